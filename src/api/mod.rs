//! Control plane: the JSON API served by `musicd` and the client that
//! `music-cli` talks to it with.

pub mod client;
pub mod server;
pub mod types;

pub use client::{ApiClient, ClientError};
pub use server::{router, spawn, ApiState};
pub use types::ApiResponse;
