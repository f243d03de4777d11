//! DNSSEC key helpers
//!
//! MUSIC never signs anything itself. What it needs is enough DNSSEC
//! arithmetic to reason about the keys the signers publish:
//!
//! * **Classification** - telling ZSKs from KSKs by the SEP flag
//! * **Key tags** - RFC 4034 appendix B
//! * **Digests** - DS/CDS computation with SHA-1, SHA-256 or SHA-384
//! * **Fingerprints** - the `protocol-algorithm-publickey` form used to
//!   track which signer a key came from

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384};

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};
use crate::dns::protocol::{DnsRecord, ProtocolError, TransientTtl};

/// Flags value of a zone signing key.
pub const ZSK_FLAGS: u16 = 256;
/// Flags value of a key signing key (zone key + SEP).
pub const KSK_FLAGS: u16 = 257;

const SEP_FLAG: u16 = 0x0001;

/// DNSSEC digest types for DS records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestType {
    /// SHA-1 (Digest Type 1) - Deprecated
    Sha1 = 1,
    /// SHA-256 (Digest Type 2)
    Sha256 = 2,
    /// SHA-384 (Digest Type 4)
    Sha384 = 4,
}

impl DigestType {
    pub fn from_num(num: u8) -> Option<DigestType> {
        match num {
            1 => Some(DigestType::Sha1),
            2 => Some(DigestType::Sha256),
            4 => Some(DigestType::Sha384),
            _ => None,
        }
    }
}

/// DNSSEC key type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    /// Zone Signing Key (ZSK)
    ZSK,
    /// Key Signing Key (KSK)
    KSK,
}

impl KeyType {
    pub fn from_flags(flags: u16) -> KeyType {
        if flags & SEP_FLAG == SEP_FLAG {
            KeyType::KSK
        } else {
            KeyType::ZSK
        }
    }
}

/// Returns the key type of a DNSKEY or CDNSKEY record.
pub fn key_type(record: &DnsRecord) -> Option<KeyType> {
    match *record {
        DnsRecord::Dnskey { flags, .. } | DnsRecord::Cdnskey { flags, .. } => {
            Some(KeyType::from_flags(flags))
        }
        _ => None,
    }
}

pub fn is_ksk(record: &DnsRecord) -> bool {
    key_type(record) == Some(KeyType::KSK)
}

pub fn is_zsk(record: &DnsRecord) -> bool {
    key_type(record) == Some(KeyType::ZSK)
}

/// Computes the key tag over the DNSKEY rdata.
pub fn key_tag_of_rdata(rdata: &[u8]) -> u16 {
    let mut ac: u32 = 0;
    for (i, b) in rdata.iter().enumerate() {
        if i & 1 == 1 {
            ac += *b as u32;
        } else {
            ac += (*b as u32) << 8;
        }
    }
    ac += (ac >> 16) & 0xFFFF;
    (ac & 0xFFFF) as u16
}

/// Key tag of a DNSKEY or CDNSKEY record.
pub fn key_tag(record: &DnsRecord) -> Result<u16, ProtocolError> {
    match *record {
        DnsRecord::Dnskey { .. } | DnsRecord::Cdnskey { .. } => {
            Ok(key_tag_of_rdata(&record.rdata_bytes()?))
        }
        DnsRecord::Ds { key_tag, .. } | DnsRecord::Cds { key_tag, .. } => Ok(key_tag),
        _ => Err(ProtocolError::Rdata(format!(
            "{} has no key tag",
            record.get_querytype()
        ))),
    }
}

/// The `protocol-algorithm-publickey` fingerprint of a DNSKEY, used as
/// the identity of a key in the key origin table.
pub fn fingerprint(record: &DnsRecord) -> Option<String> {
    match *record {
        DnsRecord::Dnskey {
            protocol,
            algorithm,
            ref public_key,
            ..
        }
        | DnsRecord::Cdnskey {
            protocol,
            algorithm,
            ref public_key,
            ..
        } => Some(format!("{}-{}-{}", protocol, algorithm, public_key)),
        _ => None,
    }
}

fn digest_input(owner: &str, dnskey: &DnsRecord) -> Result<Vec<u8>, ProtocolError> {
    let mut buffer = VectorPacketBuffer::new();
    buffer.write_qname(&owner.to_lowercase())?;
    dnskey.write_rdata(&mut buffer)?;
    Ok(buffer.buf)
}

/// Computes the DS digest of a DNSKEY (or CDNSKEY) record.
pub fn digest(dnskey: &DnsRecord, digest_type: DigestType) -> Result<Vec<u8>, ProtocolError> {
    let data = digest_input(dnskey.get_domain(), dnskey)?;
    let out = match digest_type {
        DigestType::Sha1 => Sha1::digest(&data).to_vec(),
        DigestType::Sha256 => Sha256::digest(&data).to_vec(),
        DigestType::Sha384 => Sha384::digest(&data).to_vec(),
    };
    Ok(out)
}

fn ds_parts(
    dnskey: &DnsRecord,
    digest_type: DigestType,
) -> Result<(String, u16, u8, String, u32), ProtocolError> {
    let algorithm = match *dnskey {
        DnsRecord::Dnskey { algorithm, .. } | DnsRecord::Cdnskey { algorithm, .. } => algorithm,
        _ => {
            return Err(ProtocolError::Rdata(format!(
                "cannot derive DS from {}",
                dnskey.get_querytype()
            )))
        }
    };
    let tag = key_tag(dnskey)?;
    let hex_digest = hex::encode_upper(digest(dnskey, digest_type)?);
    Ok((
        dnskey.get_domain().to_string(),
        tag,
        algorithm,
        hex_digest,
        dnskey.get_ttl(),
    ))
}

/// Derives the DS record a parent should publish for `dnskey`.
pub fn ds_from_dnskey(dnskey: &DnsRecord, digest_type: DigestType) -> Result<DnsRecord, ProtocolError> {
    let (domain, key_tag, algorithm, digest, ttl) = ds_parts(dnskey, digest_type)?;
    Ok(DnsRecord::Ds {
        domain,
        key_tag,
        algorithm,
        digest_type: digest_type as u8,
        digest,
        ttl: TransientTtl(ttl),
    })
}

/// Derives the CDS record a child publishes to ask for `dnskey` at the parent.
pub fn cds_from_dnskey(dnskey: &DnsRecord, digest_type: DigestType) -> Result<DnsRecord, ProtocolError> {
    let (domain, key_tag, algorithm, digest, ttl) = ds_parts(dnskey, digest_type)?;
    Ok(DnsRecord::Cds {
        domain,
        key_tag,
        algorithm,
        digest_type: digest_type as u8,
        digest,
        ttl: TransientTtl(ttl),
    })
}

pub fn cdnskey_from_dnskey(dnskey: &DnsRecord) -> Option<DnsRecord> {
    match *dnskey {
        DnsRecord::Dnskey {
            ref domain,
            flags,
            protocol,
            algorithm,
            ref public_key,
            ttl,
        } => Some(DnsRecord::Cdnskey {
            domain: domain.clone(),
            flags,
            protocol,
            algorithm,
            public_key: public_key.clone(),
            ttl,
        }),
        _ => None,
    }
}

/// Turns a CDS into the DS it asks for, so the two can be compared.
pub fn cds_as_ds(cds: &DnsRecord) -> Option<DnsRecord> {
    match *cds {
        DnsRecord::Cds {
            ref domain,
            key_tag,
            algorithm,
            digest_type,
            ref digest,
            ttl,
        } => Some(DnsRecord::Ds {
            domain: domain.clone(),
            key_tag,
            algorithm,
            digest_type,
            digest: digest.clone(),
            ttl,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Root KSK-2017, published with tag 20326 and the DS below.
    const ROOT_KSK: &str = ". 172800 IN DNSKEY 257 3 8 AwEAAaz/tAm8yTn4Mfeh5eyI96WSVexTBAvkMgJzkKTOiW1vkIbzxeF3+/4RgWOq7HrxRixHlFlExOLAJr5emLvN7SWXgnLh4+B5xQlNVz8Og8kvArMtNROxVQuCaSnIDdD5LKyWbRd2n9WGe2R8PzgCmr3EgVLrjyBxWezF0jLHwVN8efS3rCj/EWgvIWgb9tarpVUDK/b58Da+sqqls3eNbuv7pr+eoZG+SrDK6nWeL3c6H5Apxz7LjVc1uTIdsIXxuOLYA4/ilBmSVIzuDWfdRUfhHdY6+cn8HFRm+2hM8AnXGXws9555KrUB5qihylGa8subX2Nn6UwNR1AkUTV74bU=";
    const ROOT_DS: &str = "E06D44B80B8F1D39A95C0B0D7C65D08458E880409BBC683457104237C7F8EC8D";

    #[test]
    fn test_root_ksk_tag_and_digest() {
        let ksk: DnsRecord = ROOT_KSK.parse().unwrap();
        assert!(is_ksk(&ksk));
        assert_eq!(key_tag(&ksk).unwrap(), 20326);

        let ds = ds_from_dnskey(&ksk, DigestType::Sha256).unwrap();
        match ds {
            DnsRecord::Ds {
                key_tag,
                algorithm,
                digest_type,
                ref digest,
                ..
            } => {
                assert_eq!(key_tag, 20326);
                assert_eq!(algorithm, 8);
                assert_eq!(digest_type, 2);
                assert_eq!(digest, ROOT_DS);
            }
            _ => panic!("Expected DS record"),
        }
    }

    #[test]
    fn test_cds_matches_ds() {
        let ksk: DnsRecord = ROOT_KSK.parse().unwrap();
        let cds = cds_from_dnskey(&ksk, DigestType::Sha256).unwrap();
        let ds = ds_from_dnskey(&ksk, DigestType::Sha256).unwrap();
        assert_eq!(cds_as_ds(&cds).unwrap(), ds);
    }

    #[test]
    fn test_fingerprint_and_classification() {
        let zsk: DnsRecord = "example.com. 3600 IN DNSKEY 256 3 13 mdsswUyr3DPW132mOi8V9xESWE8jTo0dxCjjnopKl+GqJxpVXckHAeF+KkxLbxILfDLUT0rAK9iUzy1L53eKGQ=="
            .parse()
            .unwrap();
        assert!(is_zsk(&zsk));
        assert!(!is_ksk(&zsk));
        let fp = fingerprint(&zsk).unwrap();
        assert!(fp.starts_with("3-13-mdssw"));
    }

    #[test]
    fn test_cdnskey_keeps_key() {
        let ksk: DnsRecord = ROOT_KSK.parse().unwrap();
        let cdnskey = cdnskey_from_dnskey(&ksk).unwrap();
        assert_eq!(key_tag(&cdnskey).unwrap(), 20326);
        assert_eq!(fingerprint(&cdnskey), fingerprint(&ksk));
    }
}
