//! Heartbeat ping/liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session::Session;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No inbound activity within the timeout window.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Run heartbeat probes for a session.
///
/// Every `interval` a Ping is queued on the session's outbound queue. Any
/// inbound frame counts as activity (see [`Session::touch`]); once the
/// session has been idle for at least `timeout`, `TimedOut` is returned.
pub async fn run_heartbeat(
    session: Arc<Session>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let idle = session.idle_for();
                if idle >= timeout {
                    return HeartbeatResult::TimedOut;
                }
                if !session.probe() {
                    debug!(conn_id = %session.id, ?idle, "outbound queue full, probe skipped");
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Outbound;
    use crate::session::testing::active_session;

    #[tokio::test]
    async fn heartbeat_cancelled() {
        let (session, _rx) = active_session("lobby", "alice", 8);
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();

        let handle = tokio::spawn(async move {
            run_heartbeat(
                session,
                Duration::from_secs(100),
                Duration::from_secs(300),
                cancel2,
            )
            .await
        });

        cancel.cancel();
        let result = handle.await.unwrap();
        assert_eq!(result, HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_session_times_out() {
        let (session, _rx) = active_session("lobby", "alice", 8);
        let started = Instant::now();

        let result = run_heartbeat(
            session,
            Duration::from_secs(15),
            Duration::from_secs(30),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(result, HeartbeatResult::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn probes_are_queued_each_interval() {
        let (session, mut rx) = active_session("lobby", "alice", 8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(
            Arc::clone(&session),
            Duration::from_secs(15),
            Duration::from_secs(30),
            cancel.clone(),
        ));

        assert_eq!(rx.recv().await, Some(Outbound::Ping));
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn active_session_stays_alive() {
        let (session, _rx) = active_session("lobby", "alice", 64);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(
            Arc::clone(&session),
            Duration::from_secs(15),
            Duration::from_secs(30),
            cancel.clone(),
        ));

        for _ in 0..12 {
            time::sleep(Duration::from_secs(10)).await;
            session.touch();
        }
        assert!(!handle.is_finished());

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_does_not_stop_liveness_check() {
        let (session, _rx) = active_session("lobby", "alice", 1);
        session.deliver(Arc::from("filler")).unwrap();

        let result = run_heartbeat(
            session,
            Duration::from_secs(1),
            Duration::from_secs(3),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result, HeartbeatResult::TimedOut);
    }

    #[test]
    fn heartbeat_result_equality() {
        assert_eq!(HeartbeatResult::TimedOut, HeartbeatResult::TimedOut);
        assert_ne!(HeartbeatResult::TimedOut, HeartbeatResult::Cancelled);
    }
}
