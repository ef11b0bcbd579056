//! Runtime server configuration.

use std::time::Duration;

use relay_core::RelayPolicy;
use relay_settings::RelaySettings;

/// Configuration for the relay server, with durations already resolved.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Capacity of each session's outbound queue.
    pub outbound_queue: usize,
    /// Upper bound on one socket write.
    pub write_timeout: Duration,
    /// Deadline for the join request after the upgrade.
    pub join_timeout: Duration,
    /// Interval between liveness probes.
    pub heartbeat_interval: Duration,
    /// Inactivity after which a session is dropped.
    pub heartbeat_timeout: Duration,
    /// Create missing rooms even when the join does not ask for it.
    pub implicit_create: bool,
    /// Treatment of unrecognized frames.
    pub relay_policy: RelayPolicy,
    /// Period of the status log line; zero disables it.
    pub status_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_message_size: 1024 * 1024,
            outbound_queue: 256,
            write_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(30),
            implicit_create: false,
            relay_policy: RelayPolicy::Permissive,
            status_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Outbound queue capacity, never below one.
    pub fn outbound_capacity(&self) -> usize {
        self.outbound_queue.max(1)
    }
}

impl From<&RelaySettings> for ServerConfig {
    fn from(settings: &RelaySettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_message_size: settings.server.max_message_size,
            outbound_queue: settings.server.outbound_queue,
            write_timeout: Duration::from_millis(settings.server.write_timeout_ms),
            join_timeout: Duration::from_millis(settings.session.join_timeout_ms),
            heartbeat_interval: Duration::from_millis(settings.session.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(settings.session.heartbeat_timeout_ms),
            implicit_create: settings.rooms.implicit_create,
            relay_policy: settings.rooms.relay_policy,
            status_interval: Duration::from_secs(settings.status.log_interval_secs),
        }
    }
}
