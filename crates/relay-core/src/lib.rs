//! # relay-core
//!
//! Shared building blocks for the signaling relay:
//!
//! - [`ids`]: branded connection identifiers
//! - [`protocol`]: join request, server envelopes and inbound frame classification
//! - [`errors`]: the per-connection error taxonomy
//! - [`logging`]: `tracing` subscriber bootstrap

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;

pub use errors::RelayError;
pub use ids::ConnectionId;
pub use protocol::{Inbound, JoinRequest, RelayPolicy, RoomInfo, ServerEnvelope};
