//! Server-side state of one joined client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use relay_core::{ConnectionId, RelayError, ServerEnvelope};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a connection, from upgrade to teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Upgraded, waiting for the join request.
    Connecting,
    /// Join request received, being validated.
    Joining,
    /// Member of a room.
    Active,
    /// Being removed from its room.
    Leaving,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Whether `self -> to` is an allowed transition.
    pub fn can_advance(self, to: Self) -> bool {
        use SessionState::{Active, Closed, Connecting, Joining, Leaving};
        matches!(
            (self, to),
            (Connecting, Joining | Closed) | (Joining, Active | Closed) | (Active, Leaving) | (Leaving, Closed)
        )
    }

    /// Lowercase label for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Joining => "joining",
            Self::Active => "active",
            Self::Leaving => "leaving",
            Self::Closed => "closed",
        }
    }
}

/// Guarded [`SessionState`] enforcing the transition table.
///
/// Shared between the connection driver (which owns it while connecting and
/// joining) and the [`Session`] created on a successful join.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<SessionState>,
}

impl Lifecycle {
    /// Start in [`SessionState::Connecting`].
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Connecting),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Compare-and-set transition. Returns `false` (state unchanged) if the
    /// transition is not allowed from the current state.
    pub fn advance(&self, to: SessionState) -> bool {
        let mut state = self.state.lock();
        if state.can_advance(to) {
            *state = to;
            true
        } else {
            false
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Item on a session's outbound queue, drained by its writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// A text frame, shared between all recipients of one fan-out.
    Text(Arc<str>),
    /// A transport-level liveness probe.
    Ping,
}

/// A client that has joined a room.
pub struct Session {
    /// Connection identity.
    pub id: ConnectionId,
    /// Display name, unique within `room`.
    pub name: String,
    /// Room this session belongs to.
    pub room: String,
    /// Remote address, when known.
    pub peer: Option<SocketAddr>,
    lifecycle: Arc<Lifecycle>,
    outbound: mpsc::Sender<Outbound>,
    closed: CancellationToken,
    last_activity: Mutex<Instant>,
    streaming: AtomicBool,
    joined_at: Instant,
    dropped_frames: AtomicU64,
}

impl Session {
    pub(crate) fn new(
        id: ConnectionId,
        room: &str,
        name: &str,
        peer: Option<SocketAddr>,
        outbound: mpsc::Sender<Outbound>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            name: name.to_owned(),
            room: room.to_owned(),
            peer,
            lifecycle,
            outbound,
            closed: CancellationToken::new(),
            last_activity: Mutex::new(now),
            streaming: AtomicBool::new(false),
            joined_at: now,
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub(crate) fn activate(&self) -> bool {
        self.lifecycle.advance(SessionState::Active)
    }

    /// Claim teardown: `Active -> Leaving`. Only one caller ever wins.
    pub fn begin_leaving(&self) -> bool {
        self.lifecycle.advance(SessionState::Leaving)
    }

    /// `Leaving -> Closed`, then fire the closed token. Runs at most once.
    pub fn close(&self) -> bool {
        if self.lifecycle.advance(SessionState::Closed) {
            self.closed.cancel();
            true
        } else {
            false
        }
    }

    /// Queue a text frame without waiting.
    ///
    /// A full or closed queue is a [`RelayError::DeliveryFailure`]; the frame
    /// is dropped and counted.
    pub fn deliver(&self, frame: Arc<str>) -> Result<(), RelayError> {
        match self.outbound.try_send(Outbound::Text(frame)) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                let cause = match err {
                    TrySendError::Full(_) => "outbound queue full",
                    TrySendError::Closed(_) => "outbound queue closed",
                };
                Err(RelayError::DeliveryFailure {
                    recipient: self.name.clone(),
                    cause: cause.into(),
                })
            }
        }
    }

    /// Serialize and queue a server envelope.
    pub fn send_envelope(&self, envelope: &ServerEnvelope) -> Result<(), RelayError> {
        let json = envelope.to_json().map_err(|e| RelayError::DeliveryFailure {
            recipient: self.name.clone(),
            cause: e.to_string(),
        })?;
        self.deliver(Arc::from(json))
    }

    /// Queue a liveness probe. Returns `false` if the queue had no room.
    pub fn probe(&self) -> bool {
        self.outbound.try_send(Outbound::Ping).is_ok()
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound frame (or the join).
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Clone of the closed token, for tasks that outlive a borrow.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Whether the member announced an active stream.
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Relaxed)
    }

    /// Set the streaming flag, returning the previous value.
    pub(crate) fn swap_streaming(&self, streaming: bool) -> bool {
        self.streaming.swap(streaming, Ordering::Relaxed)
    }

    /// Time since the join.
    pub fn age(&self) -> Duration {
        self.joined_at.elapsed()
    }

    /// Frames dropped because the queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("room", &self.room)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
