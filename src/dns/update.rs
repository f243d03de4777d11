//! Dynamic DNS Update messages (RFC 2136)
//!
//! Builds the UPDATE messages MUSIC sends to dynamic DNS signers. The
//! prerequisite section is always empty; changes are expressed with the
//! three update forms of RFC 2136 §2.5.

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};
use crate::dns::protocol::{
    fqdn, DnsHeader, DnsQuestion, DnsRecord, ProtocolError, QueryType, CLASS_ANY, CLASS_NONE,
    OPCODE_UPDATE,
};

/// Update operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Add to an RRset
    AddRecord { record: DnsRecord },
    /// Delete all RRsets at name
    DeleteName { name: String },
    /// Delete RRset
    DeleteRRset { name: String, rtype: QueryType },
    /// Delete specific record
    DeleteRecord { record: DnsRecord },
}

impl Update {
    fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<(), ProtocolError> {
        match *self {
            Update::AddRecord { ref record } => {
                record.write(buffer)?;
            }
            Update::DeleteRecord { ref record } => {
                record.write_as(buffer, CLASS_NONE, 0)?;
            }
            Update::DeleteRRset { ref name, rtype } => {
                buffer.write_qname(name)?;
                buffer.write_u16(rtype.to_num())?;
                buffer.write_u16(CLASS_ANY)?;
                buffer.write_u32(0)?;
                buffer.write_u16(0)?;
            }
            Update::DeleteName { ref name } => {
                buffer.write_qname(name)?;
                buffer.write_u16(QueryType::Any.to_num())?;
                buffer.write_u16(CLASS_ANY)?;
                buffer.write_u32(0)?;
                buffer.write_u16(0)?;
            }
        }
        Ok(())
    }
}

/// Update message sections (RFC 2136)
#[derive(Debug, Clone)]
pub struct UpdateMessage {
    /// Zone section (exactly one zone)
    pub zone: String,
    /// Update section
    pub updates: Vec<Update>,
}

impl UpdateMessage {
    pub fn new(zone: &str) -> UpdateMessage {
        UpdateMessage {
            zone: fqdn(zone),
            updates: Vec::new(),
        }
    }

    pub fn add(&mut self, record: DnsRecord) -> &mut Self {
        self.updates.push(Update::AddRecord { record });
        self
    }

    pub fn delete(&mut self, record: DnsRecord) -> &mut Self {
        self.updates.push(Update::DeleteRecord { record });
        self
    }

    pub fn delete_rrset(&mut self, name: &str, rtype: QueryType) -> &mut Self {
        self.updates.push(Update::DeleteRRset {
            name: fqdn(name),
            rtype,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Encodes the message with the given id. TSIG is appended afterwards
    /// by the caller.
    pub fn to_bytes(&self, id: u16) -> Result<Vec<u8>, ProtocolError> {
        let mut header = DnsHeader::new();
        header.id = id;
        header.opcode = OPCODE_UPDATE;
        header.questions = 1; // ZOCOUNT
        header.authoritative_entries = self.updates.len() as u16; // UPCOUNT

        let mut buffer = VectorPacketBuffer::new();
        header.write(&mut buffer)?;
        DnsQuestion::new(self.zone.clone(), QueryType::Soa).write(&mut buffer)?;
        for update in &self.updates {
            update.write(&mut buffer)?;
        }
        Ok(buffer.buf)
    }
}
