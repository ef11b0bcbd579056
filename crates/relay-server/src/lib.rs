//! # relay-server
//!
//! Axum HTTP + `WebSocket` signaling server.
//!
//! - `WebSocket` gateway: join handshake, per-session writer task, heartbeat
//! - Room directory: one consistency domain for rooms and connections
//! - Fan-out of opaque negotiation payloads to the other members of a room
//! - Diagnostics: `/status`, `/rooms`, `/health`, `/metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod directory;
pub mod health;
pub mod heartbeat;
pub mod metrics;
pub mod router;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod status;

pub use config::ServerConfig;
pub use directory::{DepartReason, RoomDirectory};
pub use server::RelayServer;
pub use session::{Session, SessionState};
