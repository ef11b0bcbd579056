//! Inbound frame dispatch for active sessions.

use std::sync::Arc;

use metrics::counter;
use relay_core::{Inbound, RelayPolicy, ServerEnvelope};
use tracing::{debug, warn};

use crate::broadcast::Broadcaster;
use crate::directory::RoomDirectory;
use crate::metrics::RELAY_FRAMES_RELAYED_TOTAL;
use crate::session::Session;

/// What the receive loop should do after a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Keep reading.
    Continue,
    /// The client asked to leave.
    Leave,
}

/// Dispatches frames from active sessions. Never awaits a recipient write.
pub struct MessageRouter {
    directory: Arc<RoomDirectory>,
    broadcaster: Broadcaster,
    policy: RelayPolicy,
}

impl MessageRouter {
    /// Create a router over `directory`.
    pub fn new(directory: Arc<RoomDirectory>, policy: RelayPolicy) -> Self {
        Self {
            broadcaster: Broadcaster::new(Arc::clone(&directory)),
            directory,
            policy,
        }
    }

    /// Handle one text frame from `session`.
    pub fn route(&self, session: &Arc<Session>, raw: &str) -> RouteOutcome {
        session.touch();

        let kind = match Inbound::classify(raw) {
            Ok(kind) => kind,
            Err(err) => {
                warn!(conn_id = %session.id, error = %err, "skipping malformed frame");
                return RouteOutcome::Continue;
            }
        };

        match kind {
            Inbound::Leave => return RouteOutcome::Leave,
            Inbound::Ping => {
                if let Err(err) = session.send_envelope(&ServerEnvelope::Pong) {
                    warn!(conn_id = %session.id, error = %err, "failed to queue pong");
                }
            }
            Inbound::Pong => {}
            Inbound::Join => {
                warn!(conn_id = %session.id, room = %session.room, "ignoring join from active session");
            }
            Inbound::StartStream => {
                let _ = self.directory.set_streaming(session, true);
            }
            Inbound::EndStream => {
                let _ = self.directory.set_streaming(session, false);
            }
            Inbound::Relay | Inbound::Unrecognized => {
                if kind.is_forwarded(self.policy) {
                    let report = self.broadcaster.broadcast(
                        &session.room,
                        Some(&session.name),
                        Arc::from(raw),
                    );
                    counter!(RELAY_FRAMES_RELAYED_TOTAL).increment(report.delivered as u64);
                } else {
                    debug!(conn_id = %session.id, "dropping unrecognized frame");
                }
            }
        }
        RouteOutcome::Continue
    }
}
