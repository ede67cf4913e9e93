//! Node-to-Node Transport
//!
//! HTTP JSON RPC surface between cluster nodes plus the coordinator-facing
//! session API: server, client, TLS material and wire types.

pub mod client;
pub mod server;
pub mod tls;
pub mod types;

pub use client::NodeClient;
pub use server::{create_router, serve, AppState};
pub use types::{TransportError, MAX_FRAME_BYTES};
