//! Read-only diagnostics over the room directory.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use relay_core::RoomInfo;
use serde::Serialize;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::directory::RoomDirectory;

/// Point-in-time view of every room.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Registered sessions.
    pub connections: usize,
    /// Non-empty rooms, sorted by name.
    pub rooms: Vec<RoomStatus>,
}

/// One room in a [`StatusSnapshot`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoomStatus {
    /// Room name.
    pub name: String,
    /// Number of members.
    pub member_count: usize,
    /// Member names, sorted.
    pub members: Vec<String>,
    /// Members currently streaming, sorted.
    pub streaming: Vec<String>,
}

/// Produces snapshots and the periodic status log line.
pub struct StatusReporter {
    directory: Arc<RoomDirectory>,
}

impl StatusReporter {
    /// Create a reporter over `directory`.
    pub fn new(directory: Arc<RoomDirectory>) -> Self {
        Self { directory }
    }

    /// Consistent snapshot taken under the directory lock.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.directory.status()
    }

    /// Room name to `room_info`, as served on `/rooms`.
    pub fn rooms(&self) -> BTreeMap<String, RoomInfo> {
        self.directory.room_infos()
    }

    /// Emit one line with totals plus one line per room.
    pub fn log_status(&self) {
        let snapshot = self.snapshot();
        info!(
            connections = snapshot.connections,
            rooms = snapshot.rooms.len(),
            "relay status"
        );
        for room in &snapshot.rooms {
            info!(
                room = %room.name,
                members = room.member_count,
                users = ?room.members,
                streaming = ?room.streaming,
                "room status"
            );
        }
    }

    /// Log the status every `interval` until `cancel` fires. A zero interval
    /// disables logging.
    pub async fn run_status_logger(&self, interval: Duration, cancel: CancellationToken) {
        if interval.is_zero() {
            return;
        }
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.log_status(),
                () = cancel.cancelled() => break,
            }
        }
    }
}
