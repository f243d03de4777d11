//! implements the DNS protocol in a transport agnostic fashion

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use derive_more::{Display, From};
use serde_derive::{Deserialize, Serialize};

use crate::dns::buffer::{BufferError, PacketBuffer, VectorPacketBuffer};

#[derive(Debug, Display, From)]
pub enum ProtocolError {
    Buffer(BufferError),
    Io(std::io::Error),
    #[display(fmt = "invalid rdata: {}", _0)]
    Rdata(String),
}

impl std::error::Error for ProtocolError {}

type Result<T> = std::result::Result<T, ProtocolError>;

pub const CLASS_IN: u16 = 1;
pub const CLASS_NONE: u16 = 254;
pub const CLASS_ANY: u16 = 255;

pub const OPCODE_QUERY: u8 = 0;
pub const OPCODE_NOTIFY: u8 = 4;
pub const OPCODE_UPDATE: u8 = 5;

/// `QueryType` represents the requested Record Type of a query
///
/// The specific type Unknown that an integer parameter in order to retain the
/// id of an unknown query when compiling the reply. An integer can be converted
/// to a querytype using the `from_num` function, and back to an integer using
/// the `to_num` method.
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueryType {
    Unknown(u16),
    A,       // 1
    Ns,      // 2
    Cname,   // 5
    Soa,     // 6
    Mx,      // 15
    Txt,     // 16
    Aaaa,    // 28
    Srv,     // 33
    Ds,      // 43
    Rrsig,   // 46
    Dnskey,  // 48
    Cds,     // 59
    Cdnskey, // 60
    Csync,   // 62
    Tsig,    // 250
    Axfr,    // 252
    Any,     // 255
}

impl QueryType {
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryType::Unknown(x) => x,
            QueryType::A => 1,
            QueryType::Ns => 2,
            QueryType::Cname => 5,
            QueryType::Soa => 6,
            QueryType::Mx => 15,
            QueryType::Txt => 16,
            QueryType::Aaaa => 28,
            QueryType::Srv => 33,
            QueryType::Ds => 43,
            QueryType::Rrsig => 46,
            QueryType::Dnskey => 48,
            QueryType::Cds => 59,
            QueryType::Cdnskey => 60,
            QueryType::Csync => 62,
            QueryType::Tsig => 250,
            QueryType::Axfr => 252,
            QueryType::Any => 255,
        }
    }

    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            2 => QueryType::Ns,
            5 => QueryType::Cname,
            6 => QueryType::Soa,
            15 => QueryType::Mx,
            16 => QueryType::Txt,
            28 => QueryType::Aaaa,
            33 => QueryType::Srv,
            43 => QueryType::Ds,
            46 => QueryType::Rrsig,
            48 => QueryType::Dnskey,
            59 => QueryType::Cds,
            60 => QueryType::Cdnskey,
            62 => QueryType::Csync,
            250 => QueryType::Tsig,
            252 => QueryType::Axfr,
            255 => QueryType::Any,
            _ => QueryType::Unknown(num),
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            QueryType::Unknown(x) => return write!(f, "TYPE{}", x),
            QueryType::A => "A",
            QueryType::Ns => "NS",
            QueryType::Cname => "CNAME",
            QueryType::Soa => "SOA",
            QueryType::Mx => "MX",
            QueryType::Txt => "TXT",
            QueryType::Aaaa => "AAAA",
            QueryType::Srv => "SRV",
            QueryType::Ds => "DS",
            QueryType::Rrsig => "RRSIG",
            QueryType::Dnskey => "DNSKEY",
            QueryType::Cds => "CDS",
            QueryType::Cdnskey => "CDNSKEY",
            QueryType::Csync => "CSYNC",
            QueryType::Tsig => "TSIG",
            QueryType::Axfr => "AXFR",
            QueryType::Any => "ANY",
        };
        f.write_str(name)
    }
}

impl FromStr for QueryType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<QueryType> {
        let upper = s.to_ascii_uppercase();
        let qtype = match upper.as_str() {
            "A" => QueryType::A,
            "NS" => QueryType::Ns,
            "CNAME" => QueryType::Cname,
            "SOA" => QueryType::Soa,
            "MX" => QueryType::Mx,
            "TXT" => QueryType::Txt,
            "AAAA" => QueryType::Aaaa,
            "SRV" => QueryType::Srv,
            "DS" => QueryType::Ds,
            "RRSIG" => QueryType::Rrsig,
            "DNSKEY" => QueryType::Dnskey,
            "CDS" => QueryType::Cds,
            "CDNSKEY" => QueryType::Cdnskey,
            "CSYNC" => QueryType::Csync,
            "TSIG" => QueryType::Tsig,
            "AXFR" => QueryType::Axfr,
            "ANY" => QueryType::Any,
            other => match other.strip_prefix("TYPE").and_then(|n| n.parse::<u16>().ok()) {
                Some(num) => QueryType::from_num(num),
                None => return Err(ProtocolError::Rdata(format!("unknown RR type '{}'", s))),
            },
        };
        Ok(qtype)
    }
}

#[derive(Copy, Clone, Debug, Eq, Serialize, Deserialize)]
pub struct TransientTtl(pub u32);

impl PartialEq<TransientTtl> for TransientTtl {
    fn eq(&self, _: &TransientTtl) -> bool {
        true
    }
}

impl PartialOrd<TransientTtl> for TransientTtl {
    fn partial_cmp(&self, other: &TransientTtl) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransientTtl {
    fn cmp(&self, _: &TransientTtl) -> Ordering {
        Ordering::Equal
    }
}

impl Hash for TransientTtl {
    fn hash<H>(&self, _: &mut H)
    where
        H: Hasher,
    {
        // purposely left empty
    }
}

/// `DnsRecord` is the primary representation of a DNS record
///
/// Records compare equal when owner, type and rdata match; the TTL is
/// carried along but ignored by `Eq`/`Hash`, which is what RRset
/// comparisons across signers need.
///
/// Owner names and host names are kept in lowercase fully qualified form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DnsRecord {
    Unknown {
        domain: String,
        qtype: u16,
        data: Vec<u8>,
        ttl: TransientTtl,
    }, // 0
    A {
        domain: String,
        addr: Ipv4Addr,
        ttl: TransientTtl,
    }, // 1
    Ns {
        domain: String,
        host: String,
        ttl: TransientTtl,
    }, // 2
    Cname {
        domain: String,
        host: String,
        ttl: TransientTtl,
    }, // 5
    Soa {
        domain: String,
        m_name: String,
        r_name: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: TransientTtl,
    }, // 6
    Mx {
        domain: String,
        priority: u16,
        host: String,
        ttl: TransientTtl,
    }, // 15
    Txt {
        domain: String,
        data: String,
        ttl: TransientTtl,
    }, // 16
    Aaaa {
        domain: String,
        addr: Ipv6Addr,
        ttl: TransientTtl,
    }, // 28
    Srv {
        domain: String,
        priority: u16,
        weight: u16,
        port: u16,
        host: String,
        ttl: TransientTtl,
    }, // 33
    Ds {
        domain: String,
        key_tag: u16,
        algorithm: u8,
        digest_type: u8,
        digest: String,
        ttl: TransientTtl,
    }, // 43
    Dnskey {
        domain: String,
        flags: u16,
        protocol: u8,
        algorithm: u8,
        public_key: String,
        ttl: TransientTtl,
    }, // 48
    Cds {
        domain: String,
        key_tag: u16,
        algorithm: u8,
        digest_type: u8,
        digest: String,
        ttl: TransientTtl,
    }, // 59
    Cdnskey {
        domain: String,
        flags: u16,
        protocol: u8,
        algorithm: u8,
        public_key: String,
        ttl: TransientTtl,
    }, // 60
    Csync {
        domain: String,
        serial: u32,
        flags: u16,
        types: Vec<QueryType>,
        ttl: TransientTtl,
    }, // 62
}

/// Lowercases a domain name and makes sure it ends in a dot.
pub fn fqdn(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    if lower.ends_with('.') {
        lower
    } else {
        format!("{}.", lower)
    }
}

impl DnsRecord {
    pub fn read<T: PacketBuffer>(buffer: &mut T) -> Result<DnsRecord> {
        let mut domain = String::new();
        buffer.read_qname(&mut domain)?;

        let qtype_num = buffer.read_u16()?;
        let qtype = QueryType::from_num(qtype_num);
        let _class = buffer.read_u16()?;
        let ttl = TransientTtl(buffer.read_u32()?);
        let data_len = buffer.read_u16()? as usize;
        let rdata_start = buffer.pos();

        // Empty rdata shows up in RRset deletions and is kept opaque.
        if data_len == 0 {
            return Ok(DnsRecord::Unknown {
                domain,
                qtype: qtype_num,
                data: Vec::new(),
                ttl,
            });
        }

        let record = match qtype {
            QueryType::A => {
                let raw = buffer.read_u32()?;
                DnsRecord::A {
                    domain,
                    addr: Ipv4Addr::from(raw),
                    ttl,
                }
            }
            QueryType::Aaaa => {
                let mut segments = [0u16; 8];
                for segment in segments.iter_mut() {
                    *segment = buffer.read_u16()?;
                }
                DnsRecord::Aaaa {
                    domain,
                    addr: Ipv6Addr::from(segments),
                    ttl,
                }
            }
            QueryType::Ns => {
                let mut host = String::new();
                buffer.read_qname(&mut host)?;
                DnsRecord::Ns { domain, host, ttl }
            }
            QueryType::Cname => {
                let mut host = String::new();
                buffer.read_qname(&mut host)?;
                DnsRecord::Cname { domain, host, ttl }
            }
            QueryType::Srv => {
                let priority = buffer.read_u16()?;
                let weight = buffer.read_u16()?;
                let port = buffer.read_u16()?;
                let mut host = String::new();
                buffer.read_qname(&mut host)?;
                DnsRecord::Srv {
                    domain,
                    priority,
                    weight,
                    port,
                    host,
                    ttl,
                }
            }
            QueryType::Mx => {
                let priority = buffer.read_u16()?;
                let mut host = String::new();
                buffer.read_qname(&mut host)?;
                DnsRecord::Mx {
                    domain,
                    priority,
                    host,
                    ttl,
                }
            }
            QueryType::Soa => {
                let mut m_name = String::new();
                buffer.read_qname(&mut m_name)?;
                let mut r_name = String::new();
                buffer.read_qname(&mut r_name)?;

                DnsRecord::Soa {
                    domain,
                    m_name,
                    r_name,
                    serial: buffer.read_u32()?,
                    refresh: buffer.read_u32()?,
                    retry: buffer.read_u32()?,
                    expire: buffer.read_u32()?,
                    minimum: buffer.read_u32()?,
                    ttl,
                }
            }
            QueryType::Txt => {
                let raw = buffer.read_bytes(data_len)?;
                DnsRecord::Txt {
                    domain,
                    data: decode_character_strings(&raw),
                    ttl,
                }
            }
            QueryType::Ds | QueryType::Cds => {
                let key_tag = buffer.read_u16()?;
                let algorithm = buffer.read()?;
                let digest_type = buffer.read()?;
                let digest = hex::encode_upper(buffer.read_bytes(data_len.saturating_sub(4))?);
                if qtype == QueryType::Ds {
                    DnsRecord::Ds {
                        domain,
                        key_tag,
                        algorithm,
                        digest_type,
                        digest,
                        ttl,
                    }
                } else {
                    DnsRecord::Cds {
                        domain,
                        key_tag,
                        algorithm,
                        digest_type,
                        digest,
                        ttl,
                    }
                }
            }
            QueryType::Dnskey | QueryType::Cdnskey => {
                let flags = buffer.read_u16()?;
                let protocol = buffer.read()?;
                let algorithm = buffer.read()?;
                let public_key = base64::encode(buffer.read_bytes(data_len.saturating_sub(4))?);
                if qtype == QueryType::Dnskey {
                    DnsRecord::Dnskey {
                        domain,
                        flags,
                        protocol,
                        algorithm,
                        public_key,
                        ttl,
                    }
                } else {
                    DnsRecord::Cdnskey {
                        domain,
                        flags,
                        protocol,
                        algorithm,
                        public_key,
                        ttl,
                    }
                }
            }
            QueryType::Csync => {
                let serial = buffer.read_u32()?;
                let flags = buffer.read_u16()?;
                let bitmap = buffer.read_bytes(data_len.saturating_sub(6))?;
                DnsRecord::Csync {
                    domain,
                    serial,
                    flags,
                    types: decode_type_bitmap(&bitmap),
                    ttl,
                }
            }
            _ => {
                let data = buffer.read_bytes(data_len)?;
                DnsRecord::Unknown {
                    domain,
                    qtype: qtype_num,
                    data,
                    ttl,
                }
            }
        };

        // Keep the cursor honest even if the rdata had trailing octets.
        buffer.seek(rdata_start + data_len)?;

        Ok(record)
    }

    /// Writes the record with class IN and its own TTL.
    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<usize> {
        self.write_as(buffer, CLASS_IN, self.get_ttl())
    }

    /// Writes the record with an explicit class and TTL, as UPDATE
    /// messages require for deletions.
    pub fn write_as<T: PacketBuffer>(&self, buffer: &mut T, class: u16, ttl: u32) -> Result<usize> {
        let start_pos = buffer.pos();

        buffer.write_qname(self.get_domain())?;
        buffer.write_u16(self.get_querytype().to_num())?;
        buffer.write_u16(class)?;
        buffer.write_u32(ttl)?;

        let pos = buffer.pos();
        buffer.write_u16(0)?;
        self.write_rdata(buffer)?;
        let size = buffer.pos() - (pos + 2);
        buffer.set_u16(pos, size as u16)?;

        Ok(buffer.pos() - start_pos)
    }

    /// Writes only the rdata portion of the record, in canonical
    /// (uncompressed) form.
    pub fn write_rdata<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        match *self {
            DnsRecord::A { ref addr, .. } => {
                buffer.write_bytes(&addr.octets())?;
            }
            DnsRecord::Aaaa { ref addr, .. } => {
                for segment in &addr.segments() {
                    buffer.write_u16(*segment)?;
                }
            }
            DnsRecord::Ns { ref host, .. } | DnsRecord::Cname { ref host, .. } => {
                buffer.write_qname(host)?;
            }
            DnsRecord::Srv {
                priority,
                weight,
                port,
                ref host,
                ..
            } => {
                buffer.write_u16(priority)?;
                buffer.write_u16(weight)?;
                buffer.write_u16(port)?;
                buffer.write_qname(host)?;
            }
            DnsRecord::Mx {
                priority, ref host, ..
            } => {
                buffer.write_u16(priority)?;
                buffer.write_qname(host)?;
            }
            DnsRecord::Soa {
                ref m_name,
                ref r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ..
            } => {
                buffer.write_qname(m_name)?;
                buffer.write_qname(r_name)?;
                buffer.write_u32(serial)?;
                buffer.write_u32(refresh)?;
                buffer.write_u32(retry)?;
                buffer.write_u32(expire)?;
                buffer.write_u32(minimum)?;
            }
            DnsRecord::Txt { ref data, .. } => {
                let bytes = data.as_bytes();
                if bytes.is_empty() {
                    buffer.write_u8(0)?;
                }
                for chunk in bytes.chunks(255) {
                    buffer.write_u8(chunk.len() as u8)?;
                    buffer.write_bytes(chunk)?;
                }
            }
            DnsRecord::Ds {
                key_tag,
                algorithm,
                digest_type,
                ref digest,
                ..
            }
            | DnsRecord::Cds {
                key_tag,
                algorithm,
                digest_type,
                ref digest,
                ..
            } => {
                let raw = hex::decode(digest)
                    .map_err(|e| ProtocolError::Rdata(format!("DS digest: {}", e)))?;
                buffer.write_u16(key_tag)?;
                buffer.write_u8(algorithm)?;
                buffer.write_u8(digest_type)?;
                buffer.write_bytes(&raw)?;
            }
            DnsRecord::Dnskey {
                flags,
                protocol,
                algorithm,
                ref public_key,
                ..
            }
            | DnsRecord::Cdnskey {
                flags,
                protocol,
                algorithm,
                ref public_key,
                ..
            } => {
                let raw = base64::decode(public_key)
                    .map_err(|e| ProtocolError::Rdata(format!("DNSKEY public key: {}", e)))?;
                buffer.write_u16(flags)?;
                buffer.write_u8(protocol)?;
                buffer.write_u8(algorithm)?;
                buffer.write_bytes(&raw)?;
            }
            DnsRecord::Csync {
                serial,
                flags,
                ref types,
                ..
            } => {
                buffer.write_u32(serial)?;
                buffer.write_u16(flags)?;
                buffer.write_bytes(&encode_type_bitmap(types))?;
            }
            DnsRecord::Unknown { ref data, .. } => {
                buffer.write_bytes(data)?;
            }
        }

        Ok(())
    }

    /// The rdata in canonical wire form.
    pub fn rdata_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = VectorPacketBuffer::new();
        self.write_rdata(&mut buffer)?;
        Ok(buffer.buf)
    }

    pub fn get_querytype(&self) -> QueryType {
        match *self {
            DnsRecord::A { .. } => QueryType::A,
            DnsRecord::Aaaa { .. } => QueryType::Aaaa,
            DnsRecord::Ns { .. } => QueryType::Ns,
            DnsRecord::Cname { .. } => QueryType::Cname,
            DnsRecord::Srv { .. } => QueryType::Srv,
            DnsRecord::Mx { .. } => QueryType::Mx,
            DnsRecord::Unknown { qtype, .. } => QueryType::from_num(qtype),
            DnsRecord::Soa { .. } => QueryType::Soa,
            DnsRecord::Txt { .. } => QueryType::Txt,
            DnsRecord::Ds { .. } => QueryType::Ds,
            DnsRecord::Dnskey { .. } => QueryType::Dnskey,
            DnsRecord::Cds { .. } => QueryType::Cds,
            DnsRecord::Cdnskey { .. } => QueryType::Cdnskey,
            DnsRecord::Csync { .. } => QueryType::Csync,
        }
    }

    pub fn get_domain(&self) -> &str {
        match *self {
            DnsRecord::A { ref domain, .. }
            | DnsRecord::Aaaa { ref domain, .. }
            | DnsRecord::Ns { ref domain, .. }
            | DnsRecord::Cname { ref domain, .. }
            | DnsRecord::Srv { ref domain, .. }
            | DnsRecord::Mx { ref domain, .. }
            | DnsRecord::Unknown { ref domain, .. }
            | DnsRecord::Soa { ref domain, .. }
            | DnsRecord::Txt { ref domain, .. }
            | DnsRecord::Ds { ref domain, .. }
            | DnsRecord::Dnskey { ref domain, .. }
            | DnsRecord::Cds { ref domain, .. }
            | DnsRecord::Cdnskey { ref domain, .. }
            | DnsRecord::Csync { ref domain, .. } => domain,
        }
    }

    pub fn get_ttl(&self) -> u32 {
        self.ttl_ref().0
    }

    /// Returns a copy of the record with a different TTL.
    pub fn with_ttl(&self, ttl: u32) -> DnsRecord {
        let mut copy = self.clone();
        *copy.ttl_mut() = TransientTtl(ttl);
        copy
    }

    fn ttl_ref(&self) -> &TransientTtl {
        match *self {
            DnsRecord::A { ref ttl, .. }
            | DnsRecord::Aaaa { ref ttl, .. }
            | DnsRecord::Ns { ref ttl, .. }
            | DnsRecord::Cname { ref ttl, .. }
            | DnsRecord::Srv { ref ttl, .. }
            | DnsRecord::Mx { ref ttl, .. }
            | DnsRecord::Unknown { ref ttl, .. }
            | DnsRecord::Soa { ref ttl, .. }
            | DnsRecord::Txt { ref ttl, .. }
            | DnsRecord::Ds { ref ttl, .. }
            | DnsRecord::Dnskey { ref ttl, .. }
            | DnsRecord::Cds { ref ttl, .. }
            | DnsRecord::Cdnskey { ref ttl, .. }
            | DnsRecord::Csync { ref ttl, .. } => ttl,
        }
    }

    fn ttl_mut(&mut self) -> &mut TransientTtl {
        match *self {
            DnsRecord::A { ref mut ttl, .. }
            | DnsRecord::Aaaa { ref mut ttl, .. }
            | DnsRecord::Ns { ref mut ttl, .. }
            | DnsRecord::Cname { ref mut ttl, .. }
            | DnsRecord::Srv { ref mut ttl, .. }
            | DnsRecord::Mx { ref mut ttl, .. }
            | DnsRecord::Unknown { ref mut ttl, .. }
            | DnsRecord::Soa { ref mut ttl, .. }
            | DnsRecord::Txt { ref mut ttl, .. }
            | DnsRecord::Ds { ref mut ttl, .. }
            | DnsRecord::Dnskey { ref mut ttl, .. }
            | DnsRecord::Cds { ref mut ttl, .. }
            | DnsRecord::Cdnskey { ref mut ttl, .. }
            | DnsRecord::Csync { ref mut ttl, .. } => ttl,
        }
    }

    /// The presentation form of the rdata alone, i.e. everything after
    /// the fourth tab of the record's textual form.
    pub fn rdata_text(&self) -> String {
        match *self {
            DnsRecord::A { ref addr, .. } => addr.to_string(),
            DnsRecord::Aaaa { ref addr, .. } => addr.to_string(),
            DnsRecord::Ns { ref host, .. } | DnsRecord::Cname { ref host, .. } => host.clone(),
            DnsRecord::Srv {
                priority,
                weight,
                port,
                ref host,
                ..
            } => format!("{} {} {} {}", priority, weight, port, host),
            DnsRecord::Mx {
                priority, ref host, ..
            } => format!("{} {}", priority, host),
            DnsRecord::Soa {
                ref m_name,
                ref r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ..
            } => format!(
                "{} {} {} {} {} {} {}",
                m_name, r_name, serial, refresh, retry, expire, minimum
            ),
            DnsRecord::Txt { ref data, .. } => format!("\"{}\"", data.replace('"', "\\\"")),
            DnsRecord::Ds {
                key_tag,
                algorithm,
                digest_type,
                ref digest,
                ..
            }
            | DnsRecord::Cds {
                key_tag,
                algorithm,
                digest_type,
                ref digest,
                ..
            } => format!("{} {} {} {}", key_tag, algorithm, digest_type, digest),
            DnsRecord::Dnskey {
                flags,
                protocol,
                algorithm,
                ref public_key,
                ..
            }
            | DnsRecord::Cdnskey {
                flags,
                protocol,
                algorithm,
                ref public_key,
                ..
            } => format!("{} {} {} {}", flags, protocol, algorithm, public_key),
            DnsRecord::Csync {
                serial,
                flags,
                ref types,
                ..
            } => {
                let mut out = format!("{} {}", serial, flags);
                for t in types {
                    out.push(' ');
                    out.push_str(&t.to_string());
                }
                out
            }
            DnsRecord::Unknown { ref data, .. } => {
                format!("\\# {} {}", data.len(), hex::encode_upper(data))
            }
        }
    }

    /// Parses rdata in presentation form for the given owner, type and TTL.
    pub fn from_rdata(domain: &str, qtype: QueryType, ttl: u32, rdata: &str) -> Result<DnsRecord> {
        let domain = fqdn(domain);
        let ttl = TransientTtl(ttl);
        let fields: Vec<&str> = rdata.split_whitespace().collect();
        let need = |n: usize| -> Result<()> {
            if fields.len() < n {
                Err(ProtocolError::Rdata(format!(
                    "{} rdata needs {} fields, got '{}'",
                    qtype, n, rdata
                )))
            } else {
                Ok(())
            }
        };

        let record = match qtype {
            QueryType::A => {
                need(1)?;
                DnsRecord::A {
                    domain,
                    addr: parse_field(fields[0], "IPv4 address")?,
                    ttl,
                }
            }
            QueryType::Aaaa => {
                need(1)?;
                DnsRecord::Aaaa {
                    domain,
                    addr: parse_field(fields[0], "IPv6 address")?,
                    ttl,
                }
            }
            QueryType::Ns => {
                need(1)?;
                DnsRecord::Ns {
                    domain,
                    host: fqdn(fields[0]),
                    ttl,
                }
            }
            QueryType::Cname => {
                need(1)?;
                DnsRecord::Cname {
                    domain,
                    host: fqdn(fields[0]),
                    ttl,
                }
            }
            QueryType::Mx => {
                need(2)?;
                DnsRecord::Mx {
                    domain,
                    priority: parse_field(fields[0], "MX priority")?,
                    host: fqdn(fields[1]),
                    ttl,
                }
            }
            QueryType::Srv => {
                need(4)?;
                DnsRecord::Srv {
                    domain,
                    priority: parse_field(fields[0], "SRV priority")?,
                    weight: parse_field(fields[1], "SRV weight")?,
                    port: parse_field(fields[2], "SRV port")?,
                    host: fqdn(fields[3]),
                    ttl,
                }
            }
            QueryType::Soa => {
                need(7)?;
                DnsRecord::Soa {
                    domain,
                    m_name: fqdn(fields[0]),
                    r_name: fqdn(fields[1]),
                    serial: parse_field(fields[2], "SOA serial")?,
                    refresh: parse_field(fields[3], "SOA refresh")?,
                    retry: parse_field(fields[4], "SOA retry")?,
                    expire: parse_field(fields[5], "SOA expire")?,
                    minimum: parse_field(fields[6], "SOA minimum")?,
                    ttl,
                }
            }
            QueryType::Txt => DnsRecord::Txt {
                domain,
                data: parse_txt(rdata.trim()),
                ttl,
            },
            QueryType::Ds | QueryType::Cds => {
                need(4)?;
                let key_tag = parse_field(fields[0], "key tag")?;
                let algorithm = parse_field(fields[1], "algorithm")?;
                let digest_type = parse_field(fields[2], "digest type")?;
                let digest = fields[3..].concat().to_ascii_uppercase();
                hex::decode(&digest)
                    .map_err(|e| ProtocolError::Rdata(format!("digest '{}': {}", digest, e)))?;
                if qtype == QueryType::Ds {
                    DnsRecord::Ds {
                        domain,
                        key_tag,
                        algorithm,
                        digest_type,
                        digest,
                        ttl,
                    }
                } else {
                    DnsRecord::Cds {
                        domain,
                        key_tag,
                        algorithm,
                        digest_type,
                        digest,
                        ttl,
                    }
                }
            }
            QueryType::Dnskey | QueryType::Cdnskey => {
                need(4)?;
                let flags = parse_field(fields[0], "flags")?;
                let protocol = parse_field(fields[1], "protocol")?;
                let algorithm = parse_field(fields[2], "algorithm")?;
                let public_key = fields[3..].concat();
                base64::decode(&public_key)
                    .map_err(|e| ProtocolError::Rdata(format!("public key: {}", e)))?;
                if qtype == QueryType::Dnskey {
                    DnsRecord::Dnskey {
                        domain,
                        flags,
                        protocol,
                        algorithm,
                        public_key,
                        ttl,
                    }
                } else {
                    DnsRecord::Cdnskey {
                        domain,
                        flags,
                        protocol,
                        algorithm,
                        public_key,
                        ttl,
                    }
                }
            }
            QueryType::Csync => {
                need(2)?;
                let mut types = Vec::new();
                for field in &fields[2..] {
                    types.push(field.parse::<QueryType>()?);
                }
                DnsRecord::Csync {
                    domain,
                    serial: parse_field(fields[0], "CSYNC serial")?,
                    flags: parse_field(fields[1], "CSYNC flags")?,
                    types,
                    ttl,
                }
            }
            _ => {
                // RFC 3597 generic encoding: \# <len> <hex>
                if fields.len() < 2 || fields[0] != "\\#" {
                    return Err(ProtocolError::Rdata(format!(
                        "unsupported rdata for {}: '{}'",
                        qtype, rdata
                    )));
                }
                let data = hex::decode(fields[2..].concat())
                    .map_err(|e| ProtocolError::Rdata(format!("generic rdata: {}", e)))?;
                DnsRecord::Unknown {
                    domain,
                    qtype: qtype.to_num(),
                    data,
                    ttl,
                }
            }
        };

        Ok(record)
    }
}

fn parse_field<T: FromStr>(field: &str, what: &str) -> Result<T> {
    field
        .parse::<T>()
        .map_err(|_| ProtocolError::Rdata(format!("invalid {}: '{}'", what, field)))
}

fn parse_txt(rdata: &str) -> String {
    let mut out = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let quoted = rdata.starts_with('"');

    if !quoted {
        return rdata.to_string();
    }

    for c in rdata.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            in_quotes = !in_quotes;
        } else if in_quotes {
            out.push(c);
        }
    }
    out
}

fn decode_character_strings(raw: &[u8]) -> String {
    let mut out = String::new();
    let mut pos = 0;
    while pos < raw.len() {
        let len = raw[pos] as usize;
        let end = (pos + 1 + len).min(raw.len());
        out.push_str(&String::from_utf8_lossy(&raw[pos + 1..end]));
        pos = end;
    }
    out
}

/// Encodes an RFC 4034 §4.1.2 type bitmap.
pub fn encode_type_bitmap(types: &[QueryType]) -> Vec<u8> {
    let mut nums: Vec<u16> = types.iter().map(|t| t.to_num()).collect();
    nums.sort_unstable();
    nums.dedup();

    let mut out = Vec::new();
    let mut idx = 0;
    while idx < nums.len() {
        let window = (nums[idx] >> 8) as u8;
        let mut bitmap = [0u8; 32];
        let mut max_octet = 0;
        while idx < nums.len() && (nums[idx] >> 8) as u8 == window {
            let low = (nums[idx] & 0xFF) as usize;
            bitmap[low / 8] |= 0x80 >> (low % 8);
            max_octet = low / 8;
            idx += 1;
        }
        out.push(window);
        out.push((max_octet + 1) as u8);
        out.extend_from_slice(&bitmap[..=max_octet]);
    }
    out
}

pub fn decode_type_bitmap(raw: &[u8]) -> Vec<QueryType> {
    let mut types = Vec::new();
    let mut pos = 0;
    while pos + 2 <= raw.len() {
        let window = raw[pos] as u16;
        let len = raw[pos + 1] as usize;
        let end = (pos + 2 + len).min(raw.len());
        for (i, octet) in raw[pos + 2..end].iter().enumerate() {
            for bit in 0..8 {
                if octet & (0x80 >> bit) != 0 {
                    types.push(QueryType::from_num((window << 8) | (i * 8 + bit) as u16));
                }
            }
        }
        pos = end;
    }
    types
}

impl fmt::Display for DnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\tIN\t{}\t{}",
            self.get_domain(),
            self.get_ttl(),
            self.get_querytype(),
            self.rdata_text()
        )
    }
}

impl FromStr for DnsRecord {
    type Err = ProtocolError;

    /// Parses `owner [ttl] [class] type rdata...`, with tabs or spaces.
    fn from_str(s: &str) -> Result<DnsRecord> {
        let (owner, rest) = next_token(s);
        if owner.is_empty() {
            return Err(ProtocolError::Rdata("empty record".to_string()));
        }

        let (mut token, mut rest) = next_token(rest);
        let mut ttl = 0;
        if let Ok(parsed) = token.parse::<u32>() {
            ttl = parsed;
            let next = next_token(rest);
            token = next.0;
            rest = next.1;
        }
        if token.eq_ignore_ascii_case("IN") {
            let next = next_token(rest);
            token = next.0;
            rest = next.1;
        }

        let qtype = token.parse::<QueryType>()?;
        DnsRecord::from_rdata(owner, qtype, ttl, rest.trim())
    }
}

fn next_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, ""),
    }
}

/// The result code for a DNS query, as described in RFC 1035
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ResultCode {
    #[default]
    NOERROR = 0,
    FORMERR = 1,
    SERVFAIL = 2,
    NXDOMAIN = 3,
    NOTIMP = 4,
    REFUSED = 5,
    YXDOMAIN = 6,
    YXRRSET = 7,
    NXRRSET = 8,
    NOTAUTH = 9,
    NOTZONE = 10,
}

impl ResultCode {
    pub fn from_num(num: u8) -> ResultCode {
        match num {
            0 => ResultCode::NOERROR,
            1 => ResultCode::FORMERR,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            6 => ResultCode::YXDOMAIN,
            7 => ResultCode::YXRRSET,
            8 => ResultCode::NXRRSET,
            9 => ResultCode::NOTAUTH,
            10 => ResultCode::NOTZONE,
            _ => ResultCode::SERVFAIL,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Representation of a DNS header
#[derive(Clone, Debug, Default)]
pub struct DnsHeader {
    pub id: u16, // 16 bits

    pub recursion_desired: bool,    // 1 bit
    pub truncated_message: bool,    // 1 bit
    pub authoritative_answer: bool, // 1 bit
    pub opcode: u8,                 // 4 bits
    pub response: bool,             // 1 bit

    pub rescode: ResultCode,       // 4 bits
    pub checking_disabled: bool,   // 1 bit
    pub authed_data: bool,         // 1 bit
    pub z: bool,                   // 1 bit
    pub recursion_available: bool, // 1 bit

    pub questions: u16,             // 16 bits
    pub answers: u16,               // 16 bits
    pub authoritative_entries: u16, // 16 bits
    pub resource_entries: u16,      // 16 bits
}

impl DnsHeader {
    pub fn new() -> DnsHeader {
        DnsHeader::default()
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_u16(self.id)?;

        buffer.write_u8(
            (self.recursion_desired as u8)
                | ((self.truncated_message as u8) << 1)
                | ((self.authoritative_answer as u8) << 2)
                | (self.opcode << 3)
                | ((self.response as u8) << 7),
        )?;

        buffer.write_u8(
            (self.rescode as u8)
                | ((self.checking_disabled as u8) << 4)
                | ((self.authed_data as u8) << 5)
                | ((self.z as u8) << 6)
                | ((self.recursion_available as u8) << 7),
        )?;

        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let a = (flags >> 8) as u8;
        let b = (flags & 0xFF) as u8;
        self.recursion_desired = (a & (1 << 0)) > 0;
        self.truncated_message = (a & (1 << 1)) > 0;
        self.authoritative_answer = (a & (1 << 2)) > 0;
        self.opcode = (a >> 3) & 0x0F;
        self.response = (a & (1 << 7)) > 0;

        self.rescode = ResultCode::from_num(b & 0x0F);
        self.checking_disabled = (b & (1 << 4)) > 0;
        self.authed_data = (b & (1 << 5)) > 0;
        self.z = (b & (1 << 6)) > 0;
        self.recursion_available = (b & (1 << 7)) > 0;

        self.questions = buffer.read_u16()?;
        self.answers = buffer.read_u16()?;
        self.authoritative_entries = buffer.read_u16()?;
        self.resource_entries = buffer.read_u16()?;

        Ok(())
    }
}

/// Representation of a DNS question. In an UPDATE message this is the
/// zone section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: QueryType,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: QueryType) -> DnsQuestion {
        DnsQuestion { name, qtype }
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.qtype.to_num())?;
        buffer.write_u16(CLASS_IN)?;
        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        buffer.read_qname(&mut self.name)?;
        self.qtype = QueryType::from_num(buffer.read_u16()?); // qtype
        let _ = buffer.read_u16()?; // class
        Ok(())
    }
}

/// Representation of a complete DNS packet
///
/// Used for queries and NOTIFY messages. UPDATE messages need per-record
/// classes and are assembled by `dns::update` on top of the same buffer
/// primitives.
#[derive(Clone, Debug, Default)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
}

impl DnsPacket {
    pub fn new() -> DnsPacket {
        DnsPacket::default()
    }

    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T) -> Result<DnsPacket> {
        let mut result = DnsPacket::new();
        result.header.read(buffer)?;

        for _ in 0..result.header.questions {
            let mut question = DnsQuestion::new(String::new(), QueryType::Unknown(0));
            question.read(buffer)?;
            result.questions.push(question);
        }

        for _ in 0..result.header.answers {
            result.answers.push(DnsRecord::read(buffer)?);
        }
        for _ in 0..result.header.authoritative_entries {
            result.authorities.push(DnsRecord::read(buffer)?);
        }
        for _ in 0..result.header.resource_entries {
            result.resources.push(DnsRecord::read(buffer)?);
        }

        Ok(result)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<DnsPacket> {
        let mut buffer = VectorPacketBuffer::from_bytes(bytes);
        DnsPacket::from_buffer(&mut buffer)
    }

    pub fn write<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.header.questions = self.questions.len() as u16;
        self.header.answers = self.answers.len() as u16;
        self.header.authoritative_entries = self.authorities.len() as u16;
        self.header.resource_entries = self.resources.len() as u16;

        self.header.write(buffer)?;

        for question in &self.questions {
            question.write(buffer)?;
        }

        for rec in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
        {
            rec.write(buffer)?;
        }

        Ok(())
    }

    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        let mut buffer = VectorPacketBuffer::new();
        self.write(&mut buffer)?;
        Ok(buffer.buf)
    }

    /// Answers of the given type owned by `owner`.
    pub fn answers_for(&self, owner: &str, qtype: QueryType) -> Vec<DnsRecord> {
        let owner = fqdn(owner);
        self.answers
            .iter()
            .filter(|rr| rr.get_querytype() == qtype && rr.get_domain() == owner)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    const KSK: &str = "AwEAAagAIKlVZrpC6Ia7gEzahOR+9W29euxhJhVVLOyQbSEW0O8gcCjFFVQUTf6v58fLjwBd0YI0EzrAcQqBGCzh/RStIoO8g0NfnfL2MTJRkxoXbfDaUeVPQuYEhg37NZWAJQ9VnMVDxP/VHL496M/QZxkjf5/Efucp2gaDX6RS6CXpoY68LsvPVjR0ZSwzz1apAzvN9dlzEheX7ICJBBtuA6G3LQpzW5hOA2hzCTMjJPJ8LbqF6dsV6DoBQzgul0sGIcGOYl7OyQdXfZ57relSQageu+ipAdTTJ25AsRTAoub8ONGcLmqrAmRLKBP1dfwhYB4N7knNnulqQxA+Uk1ihz0=";

    #[test]
    fn test_packet() {
        let mut packet = DnsPacket::new();
        packet.header.id = 1337;
        packet.header.response = true;

        packet
            .questions
            .push(DnsQuestion::new("google.com.".to_string(), QueryType::Ns));
        packet.answers.push(DnsRecord::Ns {
            domain: "google.com.".to_string(),
            host: "ns1.google.com.".to_string(),
            ttl: TransientTtl(3600),
        });
        packet.answers.push(DnsRecord::Ns {
            domain: "google.com.".to_string(),
            host: "ns2.google.com.".to_string(),
            ttl: TransientTtl(3600),
        });

        let bytes = packet.to_bytes().unwrap();
        let parsed_packet = DnsPacket::from_bytes(&bytes).unwrap();

        assert_eq!(parsed_packet.header.id, 1337);
        assert_eq!(packet.questions[0], parsed_packet.questions[0]);
        assert_eq!(packet.answers[0], parsed_packet.answers[0]);
        assert_eq!(packet.answers[1], parsed_packet.answers[1]);
        assert_eq!(parsed_packet.answers[1].get_ttl(), 3600);
    }

    #[test]
    fn test_dnskey_text_and_wire() {
        let text = format!("example.com. 3600 IN DNSKEY 257 3 8 {}", KSK);
        let rr: DnsRecord = text.parse().unwrap();
        assert_eq!(rr.get_querytype(), QueryType::Dnskey);
        assert_eq!(rr.get_ttl(), 3600);

        let display = rr.to_string();
        assert_eq!(display.split('\t').count(), 5);
        assert!(display.starts_with("example.com.\t3600\tIN\tDNSKEY\t257 3 8 "));

        let mut buffer = VectorPacketBuffer::new();
        rr.write(&mut buffer).unwrap();
        buffer.seek(0).unwrap();
        let parsed = DnsRecord::read(&mut buffer).unwrap();
        assert_eq!(parsed, rr);
        if let DnsRecord::Dnskey { public_key, .. } = parsed {
            assert_eq!(public_key, KSK);
        } else {
            panic!("Expected DNSKEY record");
        }
    }

    #[test]
    fn test_ttl_is_ignored_by_equality() {
        let a: DnsRecord = "example.com. 300 IN NS ns1.example.net.".parse().unwrap();
        let b: DnsRecord = "EXAMPLE.com 86400 NS NS1.example.net".parse().unwrap();
        assert_eq!(a, b);
        assert_ne!(a.get_ttl(), b.get_ttl());
    }

    #[test]
    fn test_csync_bitmap() {
        let rr: DnsRecord = "example.com. 300 IN CSYNC 2024010101 3 A NS AAAA".parse().unwrap();
        let mut buffer = VectorPacketBuffer::new();
        rr.write(&mut buffer).unwrap();
        buffer.seek(0).unwrap();

        let parsed = DnsRecord::read(&mut buffer).unwrap();
        match parsed {
            DnsRecord::Csync {
                serial,
                flags,
                ref types,
                ..
            } => {
                assert_eq!(serial, 2024010101);
                assert_eq!(flags, 3);
                assert_eq!(types, &vec![QueryType::A, QueryType::Ns, QueryType::Aaaa]);
            }
            _ => panic!("Expected CSYNC record"),
        }
        assert_eq!(parsed.rdata_text(), "2024010101 3 A NS AAAA");
    }

    #[test]
    fn test_ds_digest_is_normalised() {
        let rr: DnsRecord = "example.com. 3600 IN DS 12345 8 2 49fd46e6c4b45c55d4ac 69cbd3cd3440".parse().unwrap();
        assert_eq!(rr.rdata_text(), "12345 8 2 49FD46E6C4B45C55D4AC69CBD3CD3440");
    }

    #[test]
    fn test_txt_with_spaces() {
        let rr: DnsRecord = "example.com.\t60\tIN\tTXT\t\"hello world\"".parse().unwrap();
        if let DnsRecord::Txt { ref data, .. } = rr {
            assert_eq!(data, "hello world");
        } else {
            panic!("Expected TXT record");
        }
        let bytes = rr.rdata_bytes().unwrap();
        assert_eq!(bytes[0], 11);
    }

    #[test]
    fn test_unknown_type_rejected_without_generic_rdata() {
        assert!("example.com. 60 IN TYPE999 foo".parse::<DnsRecord>().is_err());
        let rr: DnsRecord = "example.com. 60 IN TYPE999 \\# 2 ABCD".parse().unwrap();
        assert_eq!(rr.get_querytype(), QueryType::Unknown(999));
    }
}
