//! Dynamic DNS backend: plain queries for reads, TSIG signed RFC 2136
//! UPDATEs for writes.

use async_trait::async_trait;

use super::{parse_tsig_auth, rrset_types, signer_addr, GatewayError, SignerBackend, METHOD_DDNS};
use crate::dns::client::DnsNetworkClient;
use crate::dns::protocol::{DnsRecord, QueryType, ResultCode};
use crate::dns::tsig::TsigKey;
use crate::dns::update::UpdateMessage;
use crate::store::Signer;

/// Talks to signers that accept DNS UPDATE
pub struct DdnsBackend {
    client: DnsNetworkClient,
}

impl DdnsBackend {
    pub fn new(client: DnsNetworkClient) -> DdnsBackend {
        DdnsBackend { client }
    }

    fn key(signer: &Signer) -> Result<Option<TsigKey>, GatewayError> {
        if signer.usetsig {
            parse_tsig_auth(&signer.auth).map(Some)
        } else {
            Ok(None)
        }
    }

    async fn send(&self, signer: &Signer, message: &UpdateMessage) -> Result<(), GatewayError> {
        if message.is_empty() {
            return Ok(());
        }
        let server = signer_addr(signer).await?;
        let key = DdnsBackend::key(signer)?;

        let reply = self
            .client
            .update(server, message, key.as_ref(), signer.usetcp)
            .await?;

        match reply.header.rescode {
            ResultCode::NOERROR => Ok(()),
            rcode => {
                log::warn!(
                    "UPDATE of {} on signer {} failed: {}",
                    message.zone,
                    signer.name,
                    rcode
                );
                Err(GatewayError::Rcode(rcode))
            }
        }
    }
}

/// Builds the UPDATE that removes `removes` and adds `inserts`.
pub fn build_update(zone: &str, inserts: &[Vec<DnsRecord>], removes: &[Vec<DnsRecord>]) -> UpdateMessage {
    let mut message = UpdateMessage::new(zone);
    for record in removes.iter().flatten() {
        message.delete(record.clone());
    }
    for record in inserts.iter().flatten() {
        message.add(record.clone());
    }
    message
}

#[async_trait]
impl SignerBackend for DdnsBackend {
    fn method(&self) -> &'static str {
        METHOD_DDNS
    }

    async fn fetch_rrset(
        &self,
        signer: &Signer,
        _zone: &str,
        owner: &str,
        rrtype: QueryType,
    ) -> Result<Vec<DnsRecord>, GatewayError> {
        let server = signer_addr(signer).await?;
        let reply = self.client.query(server, owner, rrtype, signer.usetcp).await?;

        match reply.header.rescode {
            ResultCode::NOERROR | ResultCode::NXDOMAIN => Ok(reply.answers_for(owner, rrtype)),
            rcode => Err(GatewayError::Rcode(rcode)),
        }
    }

    async fn update(
        &self,
        signer: &Signer,
        zone: &str,
        _owner: &str,
        inserts: &[Vec<DnsRecord>],
        removes: &[Vec<DnsRecord>],
    ) -> Result<(), GatewayError> {
        self.send(signer, &build_update(zone, inserts, removes)).await
    }

    async fn remove_rrset(
        &self,
        signer: &Signer,
        zone: &str,
        owner: &str,
        rrsets: &[Vec<DnsRecord>],
    ) -> Result<(), GatewayError> {
        let mut message = UpdateMessage::new(zone);
        for rrtype in rrset_types(rrsets) {
            message.delete_rrset(owner, rrtype);
        }
        self.send(signer, &message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::update::Update;
    use crate::signer::METHOD_DDNS;

    fn signer(auth: &str, usetsig: bool) -> Signer {
        Signer {
            name: "s1".to_string(),
            method: METHOD_DDNS.to_string(),
            auth: auth.to_string(),
            address: "127.0.0.1".to_string(),
            port: 53,
            usetcp: true,
            usetsig,
        }
    }

    #[test]
    fn test_build_update_orders_removes_first() {
        let old: DnsRecord = "example.com. 300 IN NS ns1.old.net.".parse().unwrap();
        let new: DnsRecord = "example.com. 300 IN NS ns1.new.net.".parse().unwrap();
        let message = build_update("example.com.", &[vec![new.clone()]], &[vec![old.clone()]]);

        assert_eq!(message.updates.len(), 2);
        assert_eq!(message.updates[0], Update::DeleteRecord { record: old });
        assert_eq!(message.updates[1], Update::AddRecord { record: new });
    }

    #[test]
    fn test_key_only_when_tsig_enabled() {
        assert!(DdnsBackend::key(&signer("", false)).unwrap().is_none());
        assert!(DdnsBackend::key(&signer("", true)).is_err());
        let key = DdnsBackend::key(&signer("hmac-sha512:k.:c2VjcmV0", true))
            .unwrap()
            .unwrap();
        assert_eq!(key.name, "k.");
    }
}
