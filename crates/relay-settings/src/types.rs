//! Settings types.
//!
//! All structs use camelCase keys and `#[serde(default)]`, so a settings file
//! only needs the keys it overrides.

use relay_core::RelayPolicy;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Listener and transport settings.
    pub server: ServerSettings,
    /// Per-session timing.
    pub session: SessionSettings,
    /// Room policy.
    pub rooms: RoomSettings,
    /// Log output.
    pub logging: LoggingSettings,
    /// Diagnostics.
    pub status: StatusSettings,
}

impl RelaySettings {
    /// Reject combinations that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.server.outbound_queue == 0 {
            return Err(SettingsError::InvalidValue("outboundQueue must be > 0".into()));
        }
        if self.session.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "heartbeatIntervalMs must be > 0".into(),
            ));
        }
        if self.session.heartbeat_timeout_ms < self.session.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "heartbeatTimeoutMs ({}) must be >= heartbeatIntervalMs ({})",
                self.session.heartbeat_timeout_ms, self.session.heartbeat_interval_ms
            )));
        }
        if self.session.join_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("joinTimeoutMs must be > 0".into()));
        }
        Ok(())
    }
}

/// Listener and transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_size: usize,
    /// Capacity of each session's outbound queue.
    pub outbound_queue: usize,
    /// Upper bound on a single socket write, in milliseconds.
    pub write_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_size: 1024 * 1024,
            outbound_queue: 256,
            write_timeout_ms: 10_000,
        }
    }
}

/// Per-session timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Deadline for the join request after the upgrade.
    pub join_timeout_ms: u64,
    /// Interval between liveness probes.
    pub heartbeat_interval_ms: u64,
    /// Inactivity after which a session is considered dead.
    pub heartbeat_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            join_timeout_ms: 10_000,
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 30_000,
        }
    }
}

/// Room policy.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomSettings {
    /// Let the first joiner create a room even without `"create": true`.
    pub implicit_create: bool,
    /// Treatment of frames with no control word and no negotiation field.
    pub relay_policy: RelayPolicy,
}

/// Log output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive, e.g. `"info"` or `"relay_server=debug"`.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Diagnostics.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusSettings {
    /// Period of the status log line in seconds; `0` disables it.
    pub log_interval_secs: u64,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            log_interval_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_case_keys() {
        let json = serde_json::to_value(RelaySettings::default()).unwrap();
        assert!(json["server"]["maxMessageSize"].is_number());
        assert!(json["session"]["heartbeatTimeoutMs"].is_number());
        assert_eq!(json["rooms"]["relayPolicy"], "permissive");
        assert_eq!(json["rooms"]["implicitCreate"], false);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: RelaySettings =
            serde_json::from_str(r#"{"rooms":{"relayPolicy":"strict"}}"#).unwrap();
        assert_eq!(settings.rooms.relay_policy, RelayPolicy::Strict);
        assert_eq!(settings.server.port, 8080);
    }

    #[test]
    fn validate_rejects_timeout_below_interval() {
        let mut settings = RelaySettings::default();
        settings.session.heartbeat_timeout_ms = 5_000;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn validate_rejects_zero_queue() {
        let mut settings = RelaySettings::default();
        settings.server.outbound_queue = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_join_timeout() {
        let mut settings = RelaySettings::default();
        settings.session.join_timeout_ms = 0;
        assert!(settings.validate().is_err());
    }
}
