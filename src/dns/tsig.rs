//! TSIG (RFC 8945) signing of outgoing messages and verification of the
//! signed replies.
//!
//! Only the client side is needed: every UPDATE sent to a dynamic DNS
//! signer is signed with the signer's shared secret, and a signed reply
//! is checked against the MAC of the request it answers.

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use serde_derive::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};
use crate::dns::protocol::{QueryType, CLASS_ANY};

pub const DEFAULT_FUDGE: u16 = 300;

const ID_END: usize = 2;
const ARCOUNT_START: usize = 10;
const ARCOUNT_END: usize = 12;

#[derive(Debug)]
pub enum TsigError {
    UnknownAlgorithm(String),
    InvalidSecret(String),
    Malformed(String),
    Unsigned,
    BadSig,
    BadTime { signed: u64, now: u64 },
    Rejected(u16),
}

impl fmt::Display for TsigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TsigError::UnknownAlgorithm(name) => write!(f, "unsupported TSIG algorithm '{}'", name),
            TsigError::InvalidSecret(msg) => write!(f, "invalid TSIG secret: {}", msg),
            TsigError::Malformed(msg) => write!(f, "malformed TSIG record: {}", msg),
            TsigError::Unsigned => write!(f, "reply is not TSIG signed"),
            TsigError::BadSig => write!(f, "TSIG signature mismatch"),
            TsigError::BadTime { signed, now } => {
                write!(f, "TSIG time {} outside fudge window (now {})", signed, now)
            }
            TsigError::Rejected(code) => write!(f, "server rejected TSIG (error {})", code),
        }
    }
}

impl std::error::Error for TsigError {}

type Result<T> = std::result::Result<T, TsigError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TsigAlgorithm {
    HmacSha256,
    HmacSha512,
}

impl TsigAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            TsigAlgorithm::HmacSha256 => "hmac-sha256.",
            TsigAlgorithm::HmacSha512 => "hmac-sha512.",
        }
    }

    fn output_size(&self) -> usize {
        match self {
            TsigAlgorithm::HmacSha256 => 32,
            TsigAlgorithm::HmacSha512 => 64,
        }
    }
}

impl FromStr for TsigAlgorithm {
    type Err = TsigError;

    fn from_str(s: &str) -> Result<TsigAlgorithm> {
        match s.trim_end_matches('.').to_ascii_lowercase().as_str() {
            "hmac-sha256" => Ok(TsigAlgorithm::HmacSha256),
            "hmac-sha512" => Ok(TsigAlgorithm::HmacSha512),
            _ => Err(TsigError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for TsigAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name().trim_end_matches('.'))
    }
}

enum Authenticator {
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
}

impl Authenticator {
    fn new(algorithm: TsigAlgorithm, key: &[u8]) -> Result<Authenticator> {
        let invalid = |e: hmac::digest::InvalidLength| TsigError::InvalidSecret(e.to_string());
        Ok(match algorithm {
            TsigAlgorithm::HmacSha256 => {
                Authenticator::Sha256(Hmac::<Sha256>::new_from_slice(key).map_err(invalid)?)
            }
            TsigAlgorithm::HmacSha512 => {
                Authenticator::Sha512(Hmac::<Sha512>::new_from_slice(key).map_err(invalid)?)
            }
        })
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Authenticator::Sha256(mac) => mac.update(data),
            Authenticator::Sha512(mac) => mac.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Authenticator::Sha256(mac) => mac.finalize().into_bytes().to_vec(),
            Authenticator::Sha512(mac) => mac.finalize().into_bytes().to_vec(),
        }
    }

    fn verify(self, tag: &[u8]) -> Result<()> {
        let ok = match self {
            Authenticator::Sha256(mac) => mac.verify_truncated_left(tag).is_ok(),
            Authenticator::Sha512(mac) => mac.verify_truncated_left(tag).is_ok(),
        };
        if ok {
            Ok(())
        } else {
            Err(TsigError::BadSig)
        }
    }
}

/// A shared TSIG key as configured on a signer.
#[derive(Clone)]
pub struct TsigKey {
    pub name: String,
    pub algorithm: TsigAlgorithm,
    secret: Vec<u8>,
    pub fudge: u16,
}

impl fmt::Debug for TsigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TsigKey")
            .field("name", &self.name)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

/// Fields of a TSIG record read back from a message.
#[derive(Debug, Clone)]
struct TsigRecord {
    start: usize,
    key_name: String,
    algorithm: String,
    time_signed: u64,
    fudge: u16,
    mac: Vec<u8>,
    original_id: u16,
    error: u16,
    other: Vec<u8>,
}

fn wire_name(name: &str) -> Result<Vec<u8>> {
    let mut buffer = VectorPacketBuffer::new();
    buffer
        .write_qname(&name.to_lowercase())
        .map_err(|e| TsigError::Malformed(e.to_string()))?;
    Ok(buffer.buf)
}

fn time_bytes(time: u64) -> [u8; 6] {
    let b = time.to_be_bytes();
    [b[2], b[3], b[4], b[5], b[6], b[7]]
}

impl TsigKey {
    /// Builds a key from its name, algorithm and base64 encoded secret.
    pub fn new(name: &str, algorithm: TsigAlgorithm, secret: &str) -> Result<TsigKey> {
        let secret = base64::decode(secret.trim()).map_err(|e| TsigError::InvalidSecret(e.to_string()))?;
        if secret.is_empty() {
            return Err(TsigError::InvalidSecret("empty secret".to_string()));
        }
        Ok(TsigKey {
            name: crate::dns::protocol::fqdn(name),
            algorithm,
            secret,
            fudge: DEFAULT_FUDGE,
        })
    }

    fn add_variables(
        &self,
        auth: &mut Authenticator,
        time_signed: u64,
        fudge: u16,
        error: u16,
        other: &[u8],
    ) -> Result<()> {
        auth.update(&wire_name(&self.name)?);
        auth.update(b"\x00\xff\x00\x00\x00\x00");
        auth.update(&wire_name(self.algorithm.name())?);
        auth.update(&time_bytes(time_signed));
        auth.update(&fudge.to_be_bytes());
        auth.update(&error.to_be_bytes());
        auth.update(&(other.len() as u16).to_be_bytes());
        auth.update(other);
        Ok(())
    }

    /// Signs a complete message in place by appending a TSIG record and
    /// bumping ARCOUNT. Returns the MAC, which is needed to verify the
    /// reply.
    pub fn sign(&self, message: &mut Vec<u8>, now: u64) -> Result<Vec<u8>> {
        self.sign_message(message, None, now)
    }

    fn sign_message(
        &self,
        message: &mut Vec<u8>,
        request_mac: Option<&[u8]>,
        now: u64,
    ) -> Result<Vec<u8>> {
        if message.len() < ARCOUNT_END {
            return Err(TsigError::Malformed("message shorter than a header".to_string()));
        }
        let original_id = u16::from_be_bytes([message[0], message[1]]);

        let mut auth = Authenticator::new(self.algorithm, &self.secret)?;
        if let Some(request_mac) = request_mac {
            auth.update(&(request_mac.len() as u16).to_be_bytes());
            auth.update(request_mac);
        }
        auth.update(message);
        self.add_variables(&mut auth, now, self.fudge, 0, &[])?;
        let mac = auth.finalize();

        let mut rdata = wire_name(self.algorithm.name())?;
        rdata.extend_from_slice(&time_bytes(now));
        rdata.extend_from_slice(&self.fudge.to_be_bytes());
        rdata.extend_from_slice(&(mac.len() as u16).to_be_bytes());
        rdata.extend_from_slice(&mac);
        rdata.extend_from_slice(&original_id.to_be_bytes());
        rdata.extend_from_slice(&0u16.to_be_bytes()); // error
        rdata.extend_from_slice(&0u16.to_be_bytes()); // other len

        message.extend_from_slice(&wire_name(&self.name)?);
        message.extend_from_slice(&QueryType::Tsig.to_num().to_be_bytes());
        message.extend_from_slice(&CLASS_ANY.to_be_bytes());
        message.extend_from_slice(&0u32.to_be_bytes());
        message.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        message.extend_from_slice(&rdata);

        let arcount = u16::from_be_bytes([message[ARCOUNT_START], message[ARCOUNT_START + 1]]) + 1;
        message[ARCOUNT_START..ARCOUNT_END].copy_from_slice(&arcount.to_be_bytes());

        Ok(mac)
    }

    /// Verifies the TSIG record on a reply to a request signed with
    /// `request_mac`.
    pub fn verify_response(&self, response: &[u8], request_mac: &[u8], now: u64) -> Result<()> {
        let tsig = find_tsig(response)?.ok_or(TsigError::Unsigned)?;

        if tsig.key_name != self.name || tsig.algorithm != self.algorithm.name() {
            return Err(TsigError::Malformed(format!(
                "reply signed with {} / {}",
                tsig.key_name, tsig.algorithm
            )));
        }
        if tsig.error != 0 {
            return Err(TsigError::Rejected(tsig.error));
        }

        let half = (self.algorithm.output_size() + 1) / 2;
        if tsig.mac.len() > self.algorithm.output_size() || tsig.mac.len() < half.max(10) {
            return Err(TsigError::Malformed(format!("MAC size {}", tsig.mac.len())));
        }

        let message = &response[..tsig.start];
        let arcount = u16::from_be_bytes([message[ARCOUNT_START], message[ARCOUNT_START + 1]]);

        let mut auth = Authenticator::new(self.algorithm, &self.secret)?;
        auth.update(&(request_mac.len() as u16).to_be_bytes());
        auth.update(request_mac);
        auth.update(&tsig.original_id.to_be_bytes());
        auth.update(&message[ID_END..ARCOUNT_START]);
        auth.update(&arcount.saturating_sub(1).to_be_bytes());
        auth.update(&message[ARCOUNT_END..]);
        self.add_variables(&mut auth, tsig.time_signed, tsig.fudge, tsig.error, &tsig.other)?;
        auth.verify(&tsig.mac)?;

        let window_start = tsig.time_signed.saturating_sub(tsig.fudge as u64);
        let window_end = tsig.time_signed.saturating_add(tsig.fudge as u64);
        if now < window_start || now > window_end {
            return Err(TsigError::BadTime {
                signed: tsig.time_signed,
                now,
            });
        }

        Ok(())
    }
}

/// Locates the TSIG record, which must be the last additional record.
fn find_tsig(message: &[u8]) -> Result<Option<TsigRecord>> {
    let malformed = |e: crate::dns::buffer::BufferError| TsigError::Malformed(e.to_string());
    let mut buffer = VectorPacketBuffer::from_bytes(message);
    if message.len() < ARCOUNT_END {
        return Err(TsigError::Malformed("short message".to_string()));
    }

    buffer.seek(4).map_err(malformed)?;
    let qdcount = buffer.read_u16().map_err(malformed)?;
    let ancount = buffer.read_u16().map_err(malformed)?;
    let nscount = buffer.read_u16().map_err(malformed)?;
    let arcount = buffer.read_u16().map_err(malformed)?;

    let mut name = String::new();
    for _ in 0..qdcount {
        name.clear();
        buffer.read_qname(&mut name).map_err(malformed)?;
        buffer.step(4).map_err(malformed)?;
    }

    let total = ancount as usize + nscount as usize + arcount as usize;
    let mut found = None;
    for i in 0..total {
        let start = buffer.pos();
        let mut owner = String::new();
        buffer.read_qname(&mut owner).map_err(malformed)?;
        let rtype = buffer.read_u16().map_err(malformed)?;
        buffer.step(6).map_err(malformed)?; // class + ttl
        let rdlen = buffer.read_u16().map_err(malformed)? as usize;
        let rdata_start = buffer.pos();

        if rtype == QueryType::Tsig.to_num() && i == total - 1 {
            let mut algorithm = String::new();
            buffer.read_qname(&mut algorithm).map_err(malformed)?;
            let time = buffer.read_bytes(6).map_err(malformed)?;
            let mut time_signed: u64 = 0;
            for b in time {
                time_signed = (time_signed << 8) | b as u64;
            }
            let fudge = buffer.read_u16().map_err(malformed)?;
            let mac_size = buffer.read_u16().map_err(malformed)? as usize;
            let mac = buffer.read_bytes(mac_size).map_err(malformed)?;
            let original_id = buffer.read_u16().map_err(malformed)?;
            let error = buffer.read_u16().map_err(malformed)?;
            let other_len = buffer.read_u16().map_err(malformed)? as usize;
            let other = buffer.read_bytes(other_len).map_err(malformed)?;

            found = Some(TsigRecord {
                start,
                key_name: owner,
                algorithm,
                time_signed,
                fudge,
                mac,
                original_id,
                error,
                other,
            });
        }

        buffer.seek(rdata_start + rdlen).map_err(malformed)?;
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::protocol::{DnsPacket, DnsQuestion};

    const SECRET: &str = "c2VjcmV0LXNlY3JldC1zZWNyZXQtc2VjcmV0LXNlY3JldA==";

    fn query_bytes(id: u16) -> Vec<u8> {
        let mut packet = DnsPacket::new();
        packet.header.id = id;
        packet
            .questions
            .push(DnsQuestion::new("example.com.".to_string(), QueryType::Soa));
        packet.to_bytes().unwrap()
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!("hmac-sha256".parse::<TsigAlgorithm>().unwrap(), TsigAlgorithm::HmacSha256);
        assert_eq!("HMAC-SHA512.".parse::<TsigAlgorithm>().unwrap(), TsigAlgorithm::HmacSha512);
        assert!("hmac-md5".parse::<TsigAlgorithm>().is_err());
    }

    #[test]
    fn test_sign_appends_tsig() {
        let key = TsigKey::new("k", TsigAlgorithm::HmacSha256, SECRET).unwrap();
        let mut msg = query_bytes(42);
        let unsigned_len = msg.len();
        let mac = key.sign(&mut msg, 1_700_000_000).unwrap();

        assert_eq!(mac.len(), 32);
        assert!(msg.len() > unsigned_len);
        assert_eq!(u16::from_be_bytes([msg[10], msg[11]]), 1);

        let tsig = find_tsig(&msg).unwrap().unwrap();
        assert_eq!(tsig.key_name, "k.");
        assert_eq!(tsig.algorithm, "hmac-sha256.");
        assert_eq!(tsig.time_signed, 1_700_000_000);
        assert_eq!(tsig.fudge, DEFAULT_FUDGE);
        assert_eq!(tsig.mac, mac);
        assert_eq!(tsig.original_id, 42);
    }

    #[test]
    fn test_verify_signed_reply() {
        let key = TsigKey::new("k.", TsigAlgorithm::HmacSha512, SECRET).unwrap();
        let mut request = query_bytes(7);
        let request_mac = key.sign(&mut request, 1_700_000_000).unwrap();

        let mut signed_reply = query_bytes(7);
        signed_reply[2] |= 0x80;
        key.sign_message(&mut signed_reply, Some(&request_mac), 1_700_000_010)
            .unwrap();

        assert!(key
            .verify_response(&signed_reply, &request_mac, 1_700_000_020)
            .is_ok());
        assert!(matches!(
            key.verify_response(&signed_reply, &[0u8; 64], 1_700_000_020),
            Err(TsigError::BadSig)
        ));
        assert!(matches!(
            key.verify_response(&signed_reply, &request_mac, 1_700_009_999),
            Err(TsigError::BadTime { .. })
        ));
    }

    #[test]
    fn test_unsigned_reply() {
        let key = TsigKey::new("k", TsigAlgorithm::HmacSha256, SECRET).unwrap();
        assert!(matches!(
            key.verify_response(&query_bytes(1), &[], 0),
            Err(TsigError::Unsigned)
        ));
    }
}
