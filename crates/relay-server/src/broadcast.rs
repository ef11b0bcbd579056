//! Frame fan-out to the members of a room.
//!
//! Fan-out only enqueues: each recipient's writer task performs the socket
//! write later, so a slow peer never holds up the directory lock or the
//! other recipients.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use crate::directory::{DepartReason, RoomDirectory};
use crate::metrics::RELAY_DELIVERY_FAILURES_TOTAL;
use crate::session::{Session, SessionState};

/// Result of one fan-out.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    /// Recipients whose queue accepted the frame.
    pub delivered: usize,
    /// Recipients whose queue was full or closed.
    pub failed: Vec<Arc<Session>>,
}

impl DeliveryReport {
    /// Display names of the failed recipients.
    pub fn failed_names(&self) -> Vec<&str> {
        self.failed.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Enqueue `frame` on every active member except `exclude`.
///
/// Called with the directory lock held, so it must never block.
pub(crate) fn fan_out<'a>(
    members: impl IntoIterator<Item = &'a Arc<Session>>,
    exclude: Option<&str>,
    frame: &Arc<str>,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    for member in members {
        if exclude == Some(member.name.as_str()) || member.state() != SessionState::Active {
            continue;
        }
        match member.deliver(Arc::clone(frame)) {
            Ok(()) => report.delivered += 1,
            Err(err) => {
                warn!(
                    conn_id = %member.id,
                    room = %member.room,
                    username = %member.name,
                    error = %err,
                    "delivery failed, evicting recipient"
                );
                counter!(RELAY_DELIVERY_FAILURES_TOTAL).increment(1);
                report.failed.push(Arc::clone(member));
            }
        }
    }
    report
}

/// Room-scoped broadcaster over the shared [`RoomDirectory`].
#[derive(Clone)]
pub struct Broadcaster {
    directory: Arc<RoomDirectory>,
}

impl Broadcaster {
    /// Create a broadcaster bound to `directory`.
    pub fn new(directory: Arc<RoomDirectory>) -> Self {
        Self { directory }
    }

    /// Deliver `frame` to every active member of `room` except `exclude`.
    ///
    /// Recipients that could not accept the frame are departed once the
    /// directory lock has been released. A missing room delivers to nobody.
    pub fn broadcast(&self, room: &str, exclude: Option<&str>, frame: Arc<str>) -> DeliveryReport {
        let report = self.directory.fan_out_in_room(room, exclude, &frame);
        if report.failed.is_empty() {
            debug!(room, delivered = report.delivered, "broadcast frame");
        } else {
            warn!(
                room,
                delivered = report.delivered,
                failed = ?report.failed_names(),
                "broadcast frame, evicting failed recipients"
            );
        }
        self.directory
            .evict(report.failed.iter().cloned(), DepartReason::DeliveryFailure);
        report
    }
}
