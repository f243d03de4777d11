//! DNS wire layer
//!
//! Everything MUSIC needs to talk DNS to signers and parents:
//! * DNS packet parsing and serialization, plus the textual RR form
//! * RFC 2136 UPDATE messages signed with TSIG
//! * An async UDP/TCP client for queries, updates and NOTIFY
//! * DNSSEC key arithmetic (key tags, DS digests, fingerprints)
//!
//! # Module Structure
//!
//! * `buffer` - Low-level packet buffer operations
//! * `protocol` - DNS protocol definitions and packet handling
//! * `update` - UPDATE message construction
//! * `tsig` - Transaction signatures
//! * `client` - DNS client for outgoing messages
//! * `dnssec` - DNSSEC key helpers

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// DNS client for making outgoing queries, updates and notifies
pub mod client;

/// DNSSEC key classification, key tags and digests
pub mod dnssec;

/// DNS protocol definitions and packet structures
pub mod protocol;

/// TSIG signing and verification
pub mod tsig;

/// RFC 2136 UPDATE messages
pub mod update;
