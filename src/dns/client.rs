//! client for sending DNS queries, UPDATEs and NOTIFYs to other servers

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use derive_more::{Display, Error, From};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::dns::protocol::{DnsPacket, DnsQuestion, QueryType, OPCODE_NOTIFY};
use crate::dns::tsig::{TsigError, TsigKey};
use crate::dns::update::UpdateMessage;

#[derive(Debug, Display, From, Error)]
pub enum ClientError {
    Protocol(crate::dns::protocol::ProtocolError),
    Io(std::io::Error),
    Tsig(TsigError),
    TimeOut,
    IdMismatch,
}

type Result<T> = std::result::Result<T, ClientError>;

/// Timeouts applied to each exchange. Reads are expected to be quick;
/// updates may make the signer re-sign the zone before answering.
#[derive(Debug, Clone, Copy)]
pub struct ClientTimeouts {
    pub query: Duration,
    pub update: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        ClientTimeouts {
            query: Duration::from_secs(3),
            update: Duration::from_secs(10),
        }
    }
}

/// Async DNS client over UDP and TCP.
///
/// Every exchange uses a fresh socket, so the client is cheap to clone
/// and safe to share between workers.
#[derive(Clone)]
pub struct DnsNetworkClient {
    total_sent: Arc<AtomicUsize>,
    total_failed: Arc<AtomicUsize>,

    /// Counter for assigning packet ids
    seq: Arc<AtomicUsize>,

    timeouts: ClientTimeouts,
}

impl Default for DnsNetworkClient {
    fn default() -> Self {
        DnsNetworkClient::new(ClientTimeouts::default())
    }
}

impl DnsNetworkClient {
    pub fn new(timeouts: ClientTimeouts) -> DnsNetworkClient {
        DnsNetworkClient {
            total_sent: Arc::new(AtomicUsize::new(0)),
            total_failed: Arc::new(AtomicUsize::new(0)),
            seq: Arc::new(AtomicUsize::new(rand::random::<u16>() as usize)),
            timeouts,
        }
    }

    pub fn get_sent_count(&self) -> usize {
        self.total_sent.load(Ordering::Acquire)
    }

    pub fn get_failed_count(&self) -> usize {
        self.total_failed.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u16 {
        (self.seq.fetch_add(1, Ordering::SeqCst) & 0xFFFF) as u16
    }

    /// Sends a plain (non-recursive) query and returns the parsed reply.
    pub async fn query(
        &self,
        server: SocketAddr,
        qname: &str,
        qtype: QueryType,
        use_tcp: bool,
    ) -> Result<DnsPacket> {
        let mut packet = DnsPacket::new();
        packet.header.id = self.next_id();
        packet
            .questions
            .push(DnsQuestion::new(qname.to_string(), qtype));
        let bytes = packet.to_bytes()?;

        let reply = self
            .exchange(server, &bytes, use_tcp, self.timeouts.query)
            .await?;
        DnsPacket::from_bytes(&reply).map_err(ClientError::from)
    }

    /// Sends an UPDATE, TSIG signed when a key is given. A signed reply
    /// is verified against the request MAC. The caller inspects the
    /// reply's RCODE.
    pub async fn update(
        &self,
        server: SocketAddr,
        message: &UpdateMessage,
        key: Option<&TsigKey>,
        use_tcp: bool,
    ) -> Result<DnsPacket> {
        let mut bytes = message.to_bytes(self.next_id())?;
        let now = chrono::Utc::now().timestamp().max(0) as u64;

        let request_mac = match key {
            Some(key) => Some(key.sign(&mut bytes, now)?),
            None => None,
        };

        let reply = self
            .exchange(server, &bytes, use_tcp, self.timeouts.update)
            .await?;
        let packet = DnsPacket::from_bytes(&reply)?;

        if let (Some(key), Some(request_mac)) = (key, request_mac) {
            // Error replies (e.g. NOTAUTH for an unknown key) come back unsigned.
            if packet.header.rescode == crate::dns::protocol::ResultCode::NOERROR {
                let now = chrono::Utc::now().timestamp().max(0) as u64;
                key.verify_response(&reply, &request_mac, now)?;
            }
        }

        Ok(packet)
    }

    /// Sends a NOTIFY for `zone` announcing a change of `qtype`.
    pub async fn notify(&self, server: SocketAddr, zone: &str, qtype: QueryType) -> Result<DnsPacket> {
        let mut packet = DnsPacket::new();
        packet.header.id = self.next_id();
        packet.header.opcode = OPCODE_NOTIFY;
        packet.header.authoritative_answer = true;
        packet
            .questions
            .push(DnsQuestion::new(zone.to_string(), qtype));
        let bytes = packet.to_bytes()?;

        let reply = self
            .exchange(server, &bytes, false, self.timeouts.query)
            .await?;
        DnsPacket::from_bytes(&reply).map_err(ClientError::from)
    }

    async fn exchange(
        &self,
        server: SocketAddr,
        request: &[u8],
        use_tcp: bool,
        limit: Duration,
    ) -> Result<Vec<u8>> {
        let _ = self.total_sent.fetch_add(1, Ordering::Release);

        let result = match timeout(limit, self.exchange_inner(server, request, use_tcp)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::TimeOut),
        };

        if let Err(ref e) = result {
            let _ = self.total_failed.fetch_add(1, Ordering::Release);
            log::debug!("DNS exchange with {} failed: {}", server, e);
        }
        result
    }

    async fn exchange_inner(&self, server: SocketAddr, request: &[u8], use_tcp: bool) -> Result<Vec<u8>> {
        if use_tcp {
            return send_tcp(server, request).await;
        }

        let reply = send_udp(server, request).await?;
        // TC bit: the answer did not fit, ask again over TCP
        if reply.len() > 2 && reply[2] & 0x02 != 0 {
            log::debug!("Truncated reply from {}, retrying over TCP", server);
            return send_tcp(server, request).await;
        }
        Ok(reply)
    }
}

async fn send_tcp(server: SocketAddr, request: &[u8]) -> Result<Vec<u8>> {
    let mut socket = TcpStream::connect(server).await?;

    socket.write_all(&(request.len() as u16).to_be_bytes()).await?;
    socket.write_all(request).await?;
    socket.flush().await?;

    let len = socket.read_u16().await? as usize;
    let mut reply = vec![0u8; len];
    socket.read_exact(&mut reply).await?;

    check_id(request, &reply)?;
    Ok(reply)
}

async fn send_udp(server: SocketAddr, request: &[u8]) -> Result<Vec<u8>> {
    let bind: SocketAddr = if server.is_ipv4() {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(server).await?;
    socket.send(request).await?;

    let mut buf = vec![0u8; 65535];
    loop {
        let len = socket.recv(&mut buf).await?;
        // Stray datagrams with a foreign id are dropped; the timeout
        // around the exchange bounds the wait.
        if check_id(request, &buf[..len]).is_ok() {
            buf.truncate(len);
            return Ok(buf);
        }
    }
}

fn check_id(request: &[u8], reply: &[u8]) -> Result<()> {
    if reply.len() < 12 || request.len() < 2 || reply[0..2] != request[0..2] {
        return Err(ClientError::IdMismatch);
    }
    Ok(())
}
