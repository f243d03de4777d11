//! Control-plane client used by `music-cli` and the integration tests

use std::path::Path;
use std::time::Duration;

use derive_more::{Display, From};
use serde::Serialize;

use super::types::*;

#[derive(Debug, Display, From)]
pub enum ClientError {
    #[display(fmt = "HTTP error: {}", _0)]
    Http(reqwest::Error),
    #[display(fmt = "cannot read CA bundle: {}", _0)]
    Io(std::io::Error),
    #[display(fmt = "server answered {}: {}", status, body)]
    #[from(ignore)]
    Status { status: u16, body: String },
}

impl std::error::Error for ClientError {}

pub struct ApiClient {
    base_url: String,
    apikey: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// `base_url` is scheme and authority, e.g. `http://127.0.0.1:8080`.
    /// With `root_ca` the server certificate is verified against that
    /// PEM bundle in addition to the system roots.
    pub fn new(base_url: &str, apikey: &str, root_ca: Option<&Path>) -> Result<ApiClient, ClientError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if let Some(path) = root_ca {
            let pem = std::fs::read(path)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        Ok(ApiClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            apikey: apikey.to_string(),
            http: builder.build()?,
        })
    }

    /// Posts `body` to `/api/v1/<endpoint>`.
    pub async fn post<T: Serialize>(&self, endpoint: &str, body: &T) -> Result<ApiResponse, ClientError> {
        let url = format!("{}{}/{}", self.base_url, API_PREFIX, endpoint);
        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.apikey)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    pub async fn ping(&self, msg: &str) -> Result<ApiResponse, ClientError> {
        let post = PingPost {
            msg: msg.to_string(),
            pings: 0,
        };
        self.post("ping", &post).await
    }

    pub async fn zone(&self, post: &ZonePost) -> Result<ApiResponse, ClientError> {
        self.post("zone", post).await
    }

    pub async fn signer(&self, post: &SignerPost) -> Result<ApiResponse, ClientError> {
        self.post("signer", post).await
    }

    pub async fn signergroup(&self, post: &SignerGroupPost) -> Result<ApiResponse, ClientError> {
        self.post("signergroup", post).await
    }

    pub async fn process(&self, post: &ProcessPost) -> Result<ApiResponse, ClientError> {
        self.post("process", post).await
    }

    pub async fn show(&self, command: &str) -> Result<ApiResponse, ClientError> {
        let post = ShowPost {
            command: command.to_string(),
        };
        self.post("show", &post).await
    }

    pub async fn test(&self, post: &TestPost) -> Result<ApiResponse, ClientError> {
        self.post("test", post).await
    }
}
