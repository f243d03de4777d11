//! Control-plane HTTP server
//!
//! JSON over POST under `/api/v1/`, every route gated by the
//! `X-API-Key` header. Handlers translate an envelope into engine and
//! store calls; failures come back as `Error: true` with the message,
//! never as a non-200 status.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use tokio::task::JoinHandle;

use super::types::*;
use crate::dns::protocol::{fqdn, DnsRecord, QueryType};
use crate::engine::{Engine, ShutdownCoordinator};
use crate::errors::{MusicError, MusicResult};
use crate::store::signers::SignerUpdate;
use crate::store::{FsmMode, Signer, ZoneType};

pub struct ApiState {
    pub engine: Arc<Engine>,
    pub apikey: String,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v1/ping", post(ping))
        .route("/api/v1/zone", post(zone))
        .route("/api/v1/signer", post(signer))
        .route("/api/v1/signergroup", post(signergroup))
        .route("/api/v1/process", post(process))
        .route("/api/v1/show", post(show))
        .route("/api/v1/test", post(test))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

/// Binds `addr` and serves the control plane until shutdown is
/// signalled. Returns the bound address.
pub fn spawn(
    addr: SocketAddr,
    state: Arc<ApiState>,
    shutdown: Option<&ShutdownCoordinator>,
) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let server = axum::Server::try_bind(&addr)
        .map_err(|e| io::Error::new(io::ErrorKind::AddrNotAvailable, e.to_string()))?
        .serve(router(state).into_make_service_with_connect_info::<SocketAddr>());
    let local = server.local_addr();
    log::info!("Control plane listening on http://{}{}", local, API_PREFIX);

    let signal = shutdown.map(|s| s.subscribe());
    let guard = shutdown.map(|s| s.register_worker());
    let handle = tokio::spawn(async move {
        let stop = async move {
            match signal {
                Some(mut rx) => {
                    let _ = rx.recv().await;
                }
                None => futures::future::pending::<()>().await,
            }
        };
        if let Err(e) = server.with_graceful_shutdown(stop).await {
            log::error!("Control plane server failed: {}", e);
        }
        log::info!("Control plane stopped");
        drop(guard);
    });
    Ok((local, handle))
}

async fn require_api_key<B>(
    State(state): State<Arc<ApiState>>,
    request: Request<B>,
    next: Next<B>,
) -> Result<Response, StatusCode> {
    let supplied = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    match supplied {
        Some(key) if key == state.apikey => Ok(next.run(request).await),
        _ => {
            log::warn!("Rejected {} without a valid API key", request.uri().path());
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

fn respond(client: SocketAddr, command: &str, result: MusicResult<ApiResponse>) -> Json<ApiResponse> {
    let response = match result {
        Ok(response) => response,
        Err(e) => {
            log::info!("{} from {} failed: {}", command, client, e);
            ApiResponse::failure(&e)
        }
    };
    Json(response.stamped(client.to_string()))
}

fn opt(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn required<'a>(value: &'a str, what: &str, command: &str) -> MusicResult<&'a str> {
    opt(value).ok_or_else(|| MusicError::validation(format!("{} requires a {}", command, what)))
}

fn parse_rrtype(text: &str) -> MusicResult<QueryType> {
    text.to_uppercase()
        .parse::<QueryType>()
        .map_err(|e| MusicError::validation(format!("bad RR type '{}': {}", text, e)))
}

fn as_text(rrsets: BTreeMap<String, Vec<DnsRecord>>) -> BTreeMap<String, Vec<String>> {
    rrsets
        .into_iter()
        .map(|(signer, records)| (signer, records.iter().map(DnsRecord::to_string).collect()))
        .collect()
}

async fn ping(ConnectInfo(client): ConnectInfo<SocketAddr>, Json(req): Json<PingPost>) -> Json<ApiResponse> {
    log::debug!("ping from {}: {}", client, req.msg);
    let response = ApiResponse {
        pongs: Some(req.pings + 1),
        ..ApiResponse::message("pong from musicd")
    };
    respond(client, "ping", Ok(response))
}

async fn zone(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    Json(req): Json<ZonePost>,
) -> Json<ApiResponse> {
    let command = format!("zone {}", req.command);
    respond(client, &command, zone_command(&state.engine, req).await)
}

async fn zone_command(engine: &Arc<Engine>, req: ZonePost) -> MusicResult<ApiResponse> {
    let store = engine.store();
    if req.command == "list" {
        let zones = store.list_zones(None).await?;
        return Ok(ApiResponse {
            zones: Some(zones.clone()),
            ..ApiResponse::message(format!("{} zone(s)", zones.len()))
        });
    }

    let name = fqdn(required(&req.zone, "zone", &req.command)?);
    let owner = opt(&req.owner).map(fqdn).unwrap_or_else(|| name.clone());
    match req.command.as_str() {
        "add" => {
            let mut msg = store
                .add_zone(
                    None,
                    &name,
                    req.zone_type.unwrap_or(ZoneType::Normal),
                    req.fsm_mode.unwrap_or(FsmMode::Auto),
                )
                .await?;
            if let Some(group) = opt(&req.signer_group) {
                msg = format!("{}. {}", msg, engine.zone_join_group(&name, group).await?);
            }
            Ok(ApiResponse::message(msg))
        }
        "delete" => Ok(ApiResponse::message(store.delete_zone(None, &name).await?)),
        "update" => Ok(ApiResponse::message(
            store.update_zone(None, &name, req.zone_type, req.fsm_mode).await?,
        )),
        "join" => {
            let group = required(&req.signer_group, "signer group", "join")?;
            Ok(ApiResponse::message(engine.zone_join_group(&name, group).await?))
        }
        "leave" => {
            let group = required(&req.signer_group, "signer group", "leave")?;
            Ok(ApiResponse::message(engine.zone_leave_group(&name, group).await?))
        }
        "meta" => match opt(&req.meta_key) {
            Some(key) => {
                store.set_metadata(None, &name, key, &req.meta_value).await?;
                Ok(ApiResponse::message(format!("Zone {}: {} set to '{}'", name, key, req.meta_value)))
            }
            None => {
                let metadata = store.list_metadata(None, &name).await?;
                Ok(ApiResponse {
                    metadata: Some(metadata),
                    ..ApiResponse::message(format!("Metadata of zone {}", name))
                })
            }
        },
        "fsm" => {
            let process = required(&req.fsm, "process", "fsm")?;
            Ok(ApiResponse::message(
                engine
                    .attach(None, &name, process, &req.fsm_signer, req.preempt)
                    .await?,
            ))
        }
        "detach" => Ok(ApiResponse::message(engine.detach(None, &name, &req.fsm).await?)),
        "step-fsm" => {
            let (moved, msg) = engine.step(&name, opt(&req.next_state)).await?;
            Ok(ApiResponse {
                transitioned: Some(moved),
                zones: Some(vec![store.get_zone(None, &name).await?]),
                ..ApiResponse::message(msg)
            })
        }
        "get-rrsets" => {
            let rrtype = parse_rrtype(&req.rrtype)?;
            let rrsets = engine.get_rrsets(&name, &owner, rrtype).await?;
            Ok(ApiResponse {
                rrsets: Some(as_text(rrsets)),
                ..ApiResponse::message(format!("{} {} as published by each signer", owner, rrtype))
            })
        }
        "list-rrset" => {
            let rrtype = parse_rrtype(&req.rrtype)?;
            let rrsets = store.list_rrset(None, &name, &owner, rrtype).await?;
            Ok(ApiResponse {
                rrsets: Some(as_text(rrsets)),
                ..ApiResponse::message(format!("{} {} as last fetched from each signer", owner, rrtype))
            })
        }
        "copy-rrset" => {
            let rrtype = parse_rrtype(&req.rrtype)?;
            let from = required(&req.from_signer, "source signer", "copy-rrset")?;
            let to = required(&req.to_signer, "target signer", "copy-rrset")?;
            Ok(ApiResponse::message(
                engine.copy_rrset(&name, &owner, rrtype, from, to).await?,
            ))
        }
        other => Err(MusicError::validation(format!("unknown zone command '{}'", other))),
    }
}

async fn signer(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    Json(req): Json<SignerPost>,
) -> Json<ApiResponse> {
    let command = format!("signer {}", req.command);
    respond(client, &command, signer_command(&state.engine, req).await)
}

fn check_method(engine: &Engine, method: &str) -> MusicResult<()> {
    if engine.gateway().has_method(method) {
        Ok(())
    } else {
        Err(MusicError::validation(format!(
            "unknown signer method '{}', known: {}",
            method,
            engine.gateway().methods().join(", ")
        )))
    }
}

async fn signer_command(engine: &Arc<Engine>, req: SignerPost) -> MusicResult<ApiResponse> {
    let store = engine.store();
    if req.command == "list" {
        let signers: Vec<Signer> = store
            .list_signers(None)
            .await?
            .into_iter()
            .map(redacted)
            .collect();
        return Ok(ApiResponse {
            signers: Some(signers.clone()),
            ..ApiResponse::message(format!("{} signer(s)", signers.len()))
        });
    }

    let name = required(&req.name, "signer name", &req.command)?;
    match req.command.as_str() {
        "add" => {
            let method = required(&req.method, "method", "add")?;
            check_method(engine, method)?;
            let signer = Signer {
                name: name.to_string(),
                method: method.to_string(),
                auth: req.auth.clone(),
                address: req.address.clone(),
                port: req.port.unwrap_or(53),
                usetcp: req.use_tcp.unwrap_or(true),
                usetsig: req.use_tsig.unwrap_or(true),
            };
            let mut msg = store.add_signer(None, &signer).await?;
            if let Some(group) = opt(&req.signer_group) {
                msg = format!("{}. {}", msg, engine.join_group(name, group).await?);
            }
            Ok(ApiResponse::message(msg))
        }
        "update" => {
            if let Some(method) = opt(&req.method) {
                check_method(engine, method)?;
            }
            let update = SignerUpdate {
                method: opt(&req.method).map(str::to_string),
                auth: opt(&req.auth).map(str::to_string),
                address: opt(&req.address).map(str::to_string),
                port: req.port,
                usetcp: req.use_tcp,
                usetsig: req.use_tsig,
            };
            Ok(ApiResponse::message(store.update_signer(None, name, &update).await?))
        }
        "delete" => Ok(ApiResponse::message(store.delete_signer(None, name).await?)),
        "join" => {
            let group = required(&req.signer_group, "signer group", "join")?;
            Ok(ApiResponse::message(engine.join_group(name, group).await?))
        }
        "leave" => {
            let group = required(&req.signer_group, "signer group", "leave")?;
            Ok(ApiResponse::message(engine.leave_group(name, group).await?))
        }
        "login" => {
            let signer = store.get_signer(None, name).await?;
            Ok(ApiResponse::message(engine.gateway().login(&signer).await?))
        }
        "logout" => {
            let signer = store.get_signer(None, name).await?;
            Ok(ApiResponse::message(engine.gateway().logout(&signer).await?))
        }
        other => Err(MusicError::validation(format!("unknown signer command '{}'", other))),
    }
}

async fn signergroup(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    Json(req): Json<SignerGroupPost>,
) -> Json<ApiResponse> {
    let command = format!("signergroup {}", req.command);
    respond(client, &command, signergroup_command(&state.engine, req).await)
}

async fn signergroup_command(engine: &Arc<Engine>, req: SignerGroupPost) -> MusicResult<ApiResponse> {
    let store = engine.store();
    match req.command.as_str() {
        "list" => {
            let groups = store.list_groups(None).await?;
            Ok(ApiResponse {
                signer_groups: Some(groups.clone()),
                ..ApiResponse::message(format!("{} signer group(s)", groups.len()))
            })
        }
        "add" => {
            let name = required(&req.name, "signer group name", "add")?;
            Ok(ApiResponse::message(store.add_group(None, name).await?))
        }
        "delete" => {
            let name = required(&req.name, "signer group name", "delete")?;
            Ok(ApiResponse::message(store.delete_group(None, name).await?))
        }
        other => Err(MusicError::validation(format!(
            "unknown signergroup command '{}'",
            other
        ))),
    }
}

async fn process(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    Json(req): Json<ProcessPost>,
) -> Json<ApiResponse> {
    let command = format!("process {}", req.command);
    let registry = state.engine.registry();
    let result = match req.command.as_str() {
        "list" => Ok(ApiResponse {
            processes: Some(registry.list()),
            ..ApiResponse::message("Defined processes")
        }),
        "graph" => required(&req.process, "process", "graph")
            .and_then(|name| registry.graph(name))
            .map(|graph| ApiResponse {
                graph: Some(graph),
                ..ApiResponse::message(format!("Process {}", req.process))
            }),
        other => Err(MusicError::validation(format!("unknown process command '{}'", other))),
    };
    respond(client, &command, result)
}

async fn show(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    Json(req): Json<ShowPost>,
) -> Json<ApiResponse> {
    let command = format!("show {}", req.command);
    let engine = &state.engine;
    let result = match req.command.as_str() {
        "api" => Ok(ApiResponse {
            routes: Some(ROUTES.iter().map(|r| r.to_string()).collect()),
            ..ApiResponse::message("Control plane routes")
        }),
        "status" => {
            let queues = engine
                .gateway()
                .queue_depths()
                .into_iter()
                .map(|(backend, fetch, update)| QueueDepth {
                    backend,
                    fetch,
                    update,
                })
                .collect();
            Ok(ApiResponse {
                status: Some(EngineStatus {
                    active: engine.config().active,
                    interval: engine.scheduler().interval().as_secs(),
                    pending_writes: engine.writer().pending(),
                    failed_writes: engine.writer().failures(),
                    queued_notifies: engine.notifier().queued(),
                    queues,
                }),
                ..ApiResponse::message("Engine status")
            })
        }
        other => Err(MusicError::validation(format!("unknown show command '{}'", other))),
    };
    respond(client, &command, result)
}

async fn test(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    Json(req): Json<TestPost>,
) -> Json<ApiResponse> {
    let command = format!("test {}", req.command);
    respond(client, &command, test_command(&state.engine, req).await)
}

async fn test_command(engine: &Arc<Engine>, req: TestPost) -> MusicResult<ApiResponse> {
    match req.command.as_str() {
        "dnsquery" => {
            let signer = engine
                .store()
                .get_signer(None, required(&req.signer, "signer", "dnsquery")?)
                .await?;
            let zone = fqdn(required(&req.zone, "zone", "dnsquery")?);
            let owner = opt(&req.owner).map(fqdn).unwrap_or_else(|| zone.clone());
            let rrtype = parse_rrtype(&req.rrtype)?;
            let records = engine.gateway().fetch_rrset(&signer, &zone, &owner, rrtype).await?;

            let mut rrsets = BTreeMap::new();
            let count = records.len();
            rrsets.insert(signer.name.clone(), records);
            Ok(ApiResponse {
                rrsets: Some(as_text(rrsets)),
                ..ApiResponse::message(format!("{} {} record(s) from {}", count, rrtype, signer.name))
            })
        }
        other => Err(MusicError::validation(format!("unknown test command '{}'", other))),
    }
}
