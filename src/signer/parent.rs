//! Access to the parent zone: reading the delegation (DS and NS) of a
//! child and asking the parent to rescan it with NOTIFY(CDS) or
//! NOTIFY(CSYNC).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::GatewayError;
use crate::dns::client::DnsNetworkClient;
use crate::dns::protocol::{fqdn, DnsRecord, QueryType, ResultCode};

/// Parses `ip`, `ip:port` or `[ipv6]:port`; port 53 is implied.
pub fn parse_parent_addr(text: &str) -> Result<SocketAddr, GatewayError> {
    let text = text.trim();
    if let Ok(addr) = text.parse::<SocketAddr>() {
        return Ok(addr);
    }
    text.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| GatewayError::Config(format!("invalid parent address '{}'", text)))
}

#[async_trait]
pub trait ParentAgent: Send + Sync {
    /// The parent's view of `rrtype` (DS or NS) for the child `zone`.
    async fn delegation(&self, parent: SocketAddr, zone: &str, rrtype: QueryType) -> Result<Vec<DnsRecord>, GatewayError>;

    async fn notify(&self, parent: SocketAddr, zone: &str, rrtype: QueryType) -> Result<(), GatewayError>;
}

/// Queries the parent's primary over DNS
pub struct DnsParent {
    client: DnsNetworkClient,
}

impl DnsParent {
    pub fn new(client: DnsNetworkClient) -> DnsParent {
        DnsParent { client }
    }
}

#[async_trait]
impl ParentAgent for DnsParent {
    async fn delegation(&self, parent: SocketAddr, zone: &str, rrtype: QueryType) -> Result<Vec<DnsRecord>, GatewayError> {
        let reply = self.client.query(parent, zone, rrtype, false).await?;
        match reply.header.rescode {
            ResultCode::NOERROR | ResultCode::NXDOMAIN => {}
            rcode => return Err(GatewayError::Rcode(rcode)),
        }

        let mut records = reply.answers_for(zone, rrtype);
        if records.is_empty() && rrtype == QueryType::Ns {
            // The parent is not authoritative for the child's NS set and
            // answers with a referral.
            let owner = fqdn(zone);
            records = reply
                .authorities
                .iter()
                .filter(|rr| rr.get_querytype() == QueryType::Ns && rr.get_domain() == owner)
                .cloned()
                .collect();
        }
        Ok(records)
    }

    async fn notify(&self, parent: SocketAddr, zone: &str, rrtype: QueryType) -> Result<(), GatewayError> {
        let reply = self.client.notify(parent, zone, rrtype).await?;
        match reply.header.rescode {
            ResultCode::NOERROR => Ok(()),
            rcode => Err(GatewayError::Rcode(rcode)),
        }
    }
}

/// In-memory parent for dry runs and tests. Delegations are whatever
/// was last set; NOTIFYs are recorded.
#[derive(Default)]
pub struct MemoryParent {
    delegations: Mutex<HashMap<(String, QueryType), Vec<DnsRecord>>>,
    notifies: Mutex<Vec<(String, QueryType)>>,
}

impl MemoryParent {
    pub fn new() -> MemoryParent {
        MemoryParent::default()
    }

    pub fn set_delegation(&self, zone: &str, rrtype: QueryType, records: Vec<DnsRecord>) {
        self.delegations.lock().insert((fqdn(zone), rrtype), records);
    }

    pub fn notifies(&self) -> Vec<(String, QueryType)> {
        self.notifies.lock().clone()
    }
}

#[async_trait]
impl ParentAgent for MemoryParent {
    async fn delegation(&self, _parent: SocketAddr, zone: &str, rrtype: QueryType) -> Result<Vec<DnsRecord>, GatewayError> {
        Ok(self
            .delegations
            .lock()
            .get(&(fqdn(zone), rrtype))
            .cloned()
            .unwrap_or_default())
    }

    async fn notify(&self, _parent: SocketAddr, zone: &str, rrtype: QueryType) -> Result<(), GatewayError> {
        self.notifies.lock().push((fqdn(zone), rrtype));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::protocol::{DnsPacket, TransientTtl};
    use tokio::net::UdpSocket;

    #[test]
    fn test_parse_parent_addr() {
        assert_eq!(
            parse_parent_addr("192.0.2.1").unwrap(),
            "192.0.2.1:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_parent_addr("[2001:db8::1]:5353").unwrap(),
            "[2001:db8::1]:5353".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_parent_addr("parent.example.").is_err());
    }

    #[tokio::test]
    async fn test_ns_from_referral() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let query = DnsPacket::from_bytes(&buf[..len]).unwrap();

            let mut reply = DnsPacket::new();
            reply.header.id = query.header.id;
            reply.header.response = true;
            reply.questions = query.questions.clone();
            reply.authorities.push(DnsRecord::Ns {
                domain: "example.com.".to_string(),
                host: "ns1.s1.net.".to_string(),
                ttl: TransientTtl(86400),
            });
            let bytes = reply.to_bytes().unwrap();
            socket.send_to(&bytes, peer).await.unwrap();
        });

        let parent = DnsParent::new(DnsNetworkClient::default());
        let ns = parent
            .delegation(addr, "example.com.", QueryType::Ns)
            .await
            .unwrap();
        assert_eq!(ns.len(), 1);
        assert_eq!(ns[0].get_domain(), "example.com.");
    }

    #[tokio::test]
    async fn test_memory_parent() {
        let parent = MemoryParent::new();
        let addr = "127.0.0.1:53".parse().unwrap();
        assert!(parent
            .delegation(addr, "example.com.", QueryType::Ds)
            .await
            .unwrap()
            .is_empty());
        parent.notify(addr, "Example.com", QueryType::Cds).await.unwrap();
        assert_eq!(
            parent.notifies(),
            vec![("example.com.".to_string(), QueryType::Cds)]
        );
    }
}
