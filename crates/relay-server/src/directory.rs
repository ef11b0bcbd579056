//! Room directory: the single consistency domain for rooms and connections.
//!
//! Both maps live behind one `parking_lot::Mutex`. The duplicate-name check
//! and the insert happen in the same critical section, and every membership
//! change enqueues its `room_info` snapshot before the lock is released. No
//! `.await` happens while the lock is held.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::{ConnectionId, RelayError, RoomInfo, ServerEnvelope};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broadcast::{DeliveryReport, fan_out};
use crate::session::{Lifecycle, Outbound, Session, SessionState};
use crate::status::{RoomStatus, StatusSnapshot};

/// Why a session is being torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepartReason {
    /// The client sent `leave`.
    Leave,
    /// The socket closed or a read failed.
    TransportClosed,
    /// No inbound activity within the liveness window.
    LivenessTimeout,
    /// A socket write failed or timed out.
    WriteFailed,
    /// The session's queue rejected a frame.
    DeliveryFailure,
    /// Closed by another task.
    Evicted,
    /// The server is stopping.
    Shutdown,
}

impl DepartReason {
    /// Snake-case label for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Leave => "leave",
            Self::TransportClosed => "transport_closed",
            Self::LivenessTimeout => "liveness_timeout",
            Self::WriteFailed => "write_failed",
            Self::DeliveryFailure => "delivery_failure",
            Self::Evicted => "evicted",
            Self::Shutdown => "shutdown",
        }
    }
}

/// What a connection brings to a join attempt.
pub struct Admission {
    /// Connection identity.
    pub id: ConnectionId,
    /// Remote address.
    pub peer: Option<SocketAddr>,
    /// Producer side of the connection's outbound queue.
    pub outbound: mpsc::Sender<Outbound>,
    /// Lifecycle, expected to be in [`SessionState::Joining`].
    pub lifecycle: Arc<Lifecycle>,
}

/// Successful join.
#[derive(Debug)]
pub struct JoinOutcome {
    /// The newly active session.
    pub session: Arc<Session>,
    /// Whether this join created the room.
    pub created_room: bool,
    /// Members after the join, sorted.
    pub members: Vec<String>,
}

/// Effect of removing a session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// The session was a member and has been removed.
    pub removed: bool,
    /// The room became empty and was dropped.
    pub room_closed: bool,
    /// Members left in the room.
    pub remaining: usize,
}

#[derive(Default)]
struct Room {
    members: HashMap<String, Arc<Session>>,
}

impl Room {
    fn info(&self) -> RoomInfo {
        let mut users: Vec<String> = self.members.keys().cloned().collect();
        users.sort();
        let mut streaming_users: Vec<String> = self
            .members
            .values()
            .filter(|s| s.is_streaming())
            .map(|s| s.name.clone())
            .collect();
        streaming_users.sort();
        RoomInfo {
            users,
            streaming_users,
        }
    }

    fn holds(&self, session: &Arc<Session>) -> bool {
        self.members
            .get(&session.name)
            .is_some_and(|member| Arc::ptr_eq(member, session))
    }

    /// Enqueue the current `room_info` to every active member.
    fn announce(&self) -> DeliveryReport {
        match envelope_frame(&ServerEnvelope::RoomInfo(self.info())) {
            Some(frame) => fan_out(self.members.values(), None, &frame),
            None => DeliveryReport::default(),
        }
    }
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<String, Room>,
    connections: HashMap<ConnectionId, Arc<Session>>,
}

impl Inner {
    fn remove(&mut self, session: &Arc<Session>) -> LeaveOutcome {
        if self
            .connections
            .get(&session.id)
            .is_some_and(|s| Arc::ptr_eq(s, session))
        {
            let _ = self.connections.remove(&session.id);
        }

        let Some(room) = self.rooms.get_mut(&session.room) else {
            return LeaveOutcome::default();
        };
        if !room.holds(session) {
            return LeaveOutcome {
                remaining: room.members.len(),
                ..LeaveOutcome::default()
            };
        }
        let _ = room.members.remove(&session.name);
        let remaining = room.members.len();
        if remaining == 0 {
            let _ = self.rooms.remove(&session.room);
        }
        LeaveOutcome {
            removed: true,
            room_closed: remaining == 0,
            remaining,
        }
    }
}

fn envelope_frame(envelope: &ServerEnvelope) -> Option<Arc<str>> {
    match envelope.to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(err) => {
            warn!(error = %err, "failed to serialize envelope");
            None
        }
    }
}

/// Shared registry of rooms and live sessions.
#[derive(Default)]
pub struct RoomDirectory {
    inner: Mutex<Inner>,
}

impl RoomDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection into `room` under `name`.
    ///
    /// A missing room is created only when `allow_create` is set. A taken
    /// name is rejected without mutating anything. On success the session is
    /// `Active`, registered in both maps, and every member (the joiner
    /// included) has the new `room_info` queued.
    pub fn join_or_create(
        &self,
        admission: Admission,
        room: &str,
        name: &str,
        allow_create: bool,
    ) -> Result<JoinOutcome, RelayError> {
        let (outcome, failed) = {
            let mut inner = self.inner.lock();

            let created_room = match inner.rooms.get(room) {
                None if !allow_create => return Err(RelayError::RoomNotFound(room.to_owned())),
                None => true,
                Some(existing) if existing.members.contains_key(name) => {
                    return Err(RelayError::DuplicateName {
                        room: room.to_owned(),
                        username: name.to_owned(),
                    });
                }
                Some(_) => false,
            };
            if admission.lifecycle.state() != SessionState::Joining {
                return Err(RelayError::InvalidJoin(format!(
                    "connection is {}",
                    admission.lifecycle.state().as_str()
                )));
            }

            let session = Arc::new(Session::new(
                admission.id,
                room,
                name,
                admission.peer,
                admission.outbound,
                admission.lifecycle,
            ));
            if !session.activate() {
                return Err(RelayError::InvalidJoin("connection left the joining state".into()));
            }

            let _ = inner
                .connections
                .insert(session.id.clone(), Arc::clone(&session));
            let entry = inner.rooms.entry(room.to_owned()).or_default();
            let _ = entry.members.insert(name.to_owned(), Arc::clone(&session));

            let report = entry.announce();
            let mut members: Vec<String> = entry.members.keys().cloned().collect();
            members.sort();
            (
                JoinOutcome {
                    session,
                    created_room,
                    members,
                },
                report.failed,
            )
        };

        if outcome.created_room {
            info!(room, "room created");
        }
        self.evict(failed, DepartReason::DeliveryFailure);
        Ok(outcome)
    }

    /// Remove `session` from its room and the connection map.
    ///
    /// Only removes entries that belong to this very session; drops the room
    /// when it becomes empty. Idempotent. Does not notify anyone: use
    /// [`depart`](Self::depart) for the full teardown.
    pub fn leave(&self, session: &Arc<Session>) -> LeaveOutcome {
        self.inner.lock().remove(session)
    }

    /// The single teardown path.
    ///
    /// The first caller to move the session from `Active` to `Leaving` wins:
    /// it removes the session, queues the updated `room_info` to the
    /// remaining members and closes the session. Every other caller gets
    /// `false` and nothing happens.
    pub fn depart(&self, session: &Arc<Session>, reason: DepartReason) -> bool {
        if !session.begin_leaving() {
            return false;
        }
        let failed = self.teardown(session, reason);
        self.evict(failed, DepartReason::DeliveryFailure);
        true
    }

    /// Depart every session in `sessions`, plus any recipient that fails
    /// while the remaining members are being notified.
    pub fn evict(&self, sessions: impl IntoIterator<Item = Arc<Session>>, reason: DepartReason) {
        let mut pending: Vec<Arc<Session>> = sessions.into_iter().collect();
        while let Some(session) = pending.pop() {
            if session.begin_leaving() {
                pending.extend(self.teardown(&session, reason));
            }
        }
    }

    /// Remove, notify and close a session already in `Leaving`. Returns the
    /// members whose notification failed.
    fn teardown(&self, session: &Arc<Session>, reason: DepartReason) -> Vec<Arc<Session>> {
        let (outcome, failed) = {
            let mut inner = self.inner.lock();
            let outcome = inner.remove(session);
            let failed = match inner.rooms.get(&session.room) {
                Some(room) if outcome.removed => room.announce().failed,
                _ => Vec::new(),
            };
            (outcome, failed)
        };
        let _ = session.close();

        info!(
            conn_id = %session.id,
            peer = ?session.peer,
            room = %session.room,
            username = %session.name,
            reason = reason.as_str(),
            remaining = outcome.remaining,
            room_closed = outcome.room_closed,
            "session departed"
        );
        if outcome.room_closed {
            debug!(room = %session.room, "room removed");
        }
        failed
    }

    /// Set the streaming flag and tell the room.
    ///
    /// Every call queues `room_info`; ending a stream also queues
    /// `stream_ended` to the other members. Returns `false` when the session
    /// is no longer an active member.
    pub fn set_streaming(&self, session: &Arc<Session>, streaming: bool) -> bool {
        if session.state() != SessionState::Active {
            return false;
        }
        let failed = {
            let inner = self.inner.lock();
            let Some(room) = inner.rooms.get(&session.room) else {
                return false;
            };
            if !room.holds(session) {
                return false;
            }
            let _ = session.swap_streaming(streaming);

            let mut failed = room.announce().failed;
            if !streaming {
                if let Some(frame) = envelope_frame(&ServerEnvelope::StreamEnded(session.name.clone())) {
                    failed.extend(fan_out(room.members.values(), Some(&session.name), &frame).failed);
                }
            }
            failed
        };
        debug!(room = %session.room, username = %session.name, streaming, "streaming flag updated");
        self.evict(failed, DepartReason::DeliveryFailure);
        true
    }

    /// Enqueue `frame` on the active members of `room`, except `exclude`.
    pub(crate) fn fan_out_in_room(
        &self,
        room: &str,
        exclude: Option<&str>,
        frame: &Arc<str>,
    ) -> DeliveryReport {
        let inner = self.inner.lock();
        match inner.rooms.get(room) {
            Some(room) => fan_out(room.members.values(), exclude, frame),
            None => DeliveryReport::default(),
        }
    }

    /// Sorted member names of `room`; empty if the room does not exist.
    pub fn members_of(&self, room: &str) -> Vec<String> {
        self.inner
            .lock()
            .rooms
            .get(room)
            .map(|r| r.info().users)
            .unwrap_or_default()
    }

    /// The session registered for a connection, if any.
    pub fn lookup_by_connection(&self, id: &ConnectionId) -> Option<Arc<Session>> {
        self.inner.lock().connections.get(id).cloned()
    }

    /// Consistent snapshot of every room, sorted by name.
    pub fn status(&self) -> StatusSnapshot {
        let inner = self.inner.lock();
        let mut rooms: Vec<RoomStatus> = inner
            .rooms
            .iter()
            .map(|(name, room)| {
                let info = room.info();
                RoomStatus {
                    name: name.clone(),
                    member_count: info.users.len(),
                    members: info.users,
                    streaming: info.streaming_users,
                }
            })
            .collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        StatusSnapshot {
            connections: inner.connections.len(),
            rooms,
        }
    }

    /// `room_info` of every room, keyed by room name.
    pub fn room_infos(&self) -> BTreeMap<String, RoomInfo> {
        self.inner
            .lock()
            .rooms
            .iter()
            .map(|(name, room)| (name.clone(), room.info()))
            .collect()
    }

    /// Number of registered sessions.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.inner.lock().rooms.len()
    }

    /// Every registered session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.lock().connections.values().cloned().collect()
    }
}
