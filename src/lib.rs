//! MUSIC: multi-signer DNSSEC controller
//!
//! Keeps zones that are signed by several independent signers
//! consistent while signers join or leave their group. Each zone is
//! driven through a small state machine that synchronises DNSKEY and NS
//! RRsets between the signers and the DS and NS delegation at the
//! parent.
//!
//! # Architecture
//!
//! * `dns` - wire format, DNSSEC digests, TSIG and dynamic updates
//! * `store` - SQLite persistence of zones, signers, groups and caches
//! * `signer` - the gateway over heterogeneous signer backends
//! * `fsm` - process definitions and their transition checks
//! * `engine` - stepping zones, the scheduler and group lifecycle
//! * `api` - the control-plane HTTP API and its client

/// DNS protocol handling and exchanges with signers and parents
pub mod dns;

/// Persistent state
pub mod store;

/// Signer backends behind one gateway
pub mod signer;

/// Process definitions
pub mod fsm;

/// Process engine and background tasks
pub mod engine;

/// Control plane
pub mod api;

pub mod config;
pub mod errors;
pub mod logging;
