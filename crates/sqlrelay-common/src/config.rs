//! Instance configuration for SQL Relay services
//!
//! One `InstanceConfig` describes a whole deployment: the listener
//! addresses, the connection daemon fleet, per-session limits, and
//! scaling policy. Configuration loads from an optional TOML file with an
//! `SQLR`-prefixed environment overlay (`SQLR__LISTENER__INET_PORT=9000`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{RelayError, Result};

/// Top-level instance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Instance identifier; all shared resources derive from it
    pub id: String,
    /// Base directory for sockets, pid files, and rendezvous keys
    pub run_dir: PathBuf,
    /// Listener settings
    pub listener: ListenerConfig,
    /// Connection daemon fleet settings
    pub connections: ConnectionsConfig,
    /// Per-session limits, enforced with the 900000-range error codes
    pub limits: LimitsConfig,
    /// Session behavior
    pub session: SessionConfig,
    /// Users allowed to authenticate
    pub users: Vec<UserConfig>,
    /// Connect strings, one per logical daemon pool
    pub connect_strings: Vec<ConnectStringConfig>,
    /// Telemetry settings
    pub telemetry: TelemetryConfig,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            id: "sqlrelay".into(),
            run_dir: std::env::temp_dir().join("sqlrelay"),
            listener: ListenerConfig::default(),
            connections: ConnectionsConfig::default(),
            limits: LimitsConfig::default(),
            session: SessionConfig::default(),
            users: Vec::new(),
            connect_strings: vec![ConnectStringConfig::default()],
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// How the listener transfers an accepted client to a daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffMode {
    /// Pass the descriptor over the daemon's hand-off socket (SCM_RIGHTS)
    Pass,
    /// Relay bytes through the listener; for platforms without fd passing
    Proxy,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// TCP address to listen on
    pub inet_address: String,
    /// TCP port; 0 disables the TCP socket
    pub inet_port: u16,
    /// Additional client UNIX socket path; the per-instance socket under
    /// the run directory is always created
    pub unix_socket: Option<PathBuf>,
    /// Maximum concurrently forked per-client children
    pub max_listeners: u32,
    /// Seconds an accepted client may wait for an idle daemon
    pub listener_timeout_secs: u64,
    /// Regex of client addresses to allow; unset allows all
    pub allowed_ips: Option<String>,
    /// Regex of client addresses to deny; applied after `allowed_ips`
    pub denied_ips: Option<String>,
    /// Hand-off method
    pub handoff: HandoffMode,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            inet_address: "0.0.0.0".into(),
            inet_port: 9000,
            unix_socket: None,
            max_listeners: 1000,
            listener_timeout_secs: 60,
            allowed_ips: None,
            denied_ips: None,
            handoff: HandoffMode::Pass,
        }
    }
}

/// Connection daemon fleet settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionsConfig {
    /// Daemons started at instance launch
    pub connections: u32,
    /// Hard ceiling on daemon count
    pub max_connections: u32,
    /// Enable the scaler
    pub dynamic_scaling: bool,
    /// Clients allowed to queue before the scaler grows the fleet
    pub max_queue_length: u32,
    /// Daemons spawned per grow decision
    pub grow_by: u32,
    /// Scaler poll interval in seconds
    pub scaler_interval_secs: u64,
    /// Seconds a dynamically-spawned daemon may sit idle before exiting;
    /// 0 means live forever
    pub ttl_secs: u64,
    /// Cursors allocated per daemon
    pub cursors: u16,
    /// Reconnect attempts after the backend connection is lost
    pub tries: u32,
    /// Base delay between reconnect attempts, doubled per attempt
    pub retry_time_secs: u64,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            connections: 5,
            max_connections: 30,
            dynamic_scaling: false,
            max_queue_length: 0,
            grow_by: 1,
            scaler_interval_secs: 15,
            ttl_secs: 0,
            cursors: 5,
            tries: 5,
            retry_time_secs: 1,
        }
    }
}

/// Per-session limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_query_size: u32,
    pub max_client_info_length: u64,
    pub max_bind_count: u16,
    pub max_bind_name_length: u16,
    pub max_string_bind_value_length: u32,
    pub max_lob_bind_value_length: u32,
    pub max_error_length: u32,
    /// Maximum columns in a select list; 0 means unlimited
    pub max_select_list: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_query_size: 65536,
            max_client_info_length: 512,
            max_bind_count: 256,
            max_bind_name_length: 64,
            max_string_bind_value_length: 32768,
            max_lob_bind_value_length: 71680,
            max_error_length: 2048,
            max_select_list: 0,
        }
    }
}

/// Session behavior settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Autocommit state applied at session start
    pub autocommit: bool,
    /// Simulate transaction blocks by toggling autocommit on drivers
    /// without native BEGIN support
    pub fake_transaction_blocks: bool,
    /// Send column descriptors with result sets unless the client opts out
    pub send_column_info: bool,
    /// Seconds a daemon waits in `read` for the next client command;
    /// 0 disables the timeout
    pub idle_client_timeout_secs: u64,
    /// Seconds a suspended session waits for the client to reconnect
    pub suspend_timeout_secs: u64,
    /// Statements run against the driver at session start
    pub session_start_queries: Vec<String>,
    /// Statements run against the driver at session end
    pub session_end_queries: Vec<String>,
    /// Transaction isolation level passed to the driver at login
    pub isolation_level: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autocommit: false,
            fake_transaction_blocks: false,
            send_column_info: true,
            idle_client_timeout_secs: 0,
            suspend_timeout_secs: 600,
            session_start_queries: Vec::new(),
            session_end_queries: Vec::new(),
            isolation_level: None,
        }
    }
}

/// One user allowed to authenticate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub user: String,
    pub password: String,
}

/// One connect string: a logical pool of daemons against one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectStringConfig {
    /// Logical id announced by daemons of this pool
    pub connection_id: String,
    /// Driver name; only "stub" is compiled into the core
    pub driver: String,
    /// Driver-specific parameters (host, port, user, password, ...)
    pub parameters: HashMap<String, String>,
    /// Weight used by the launcher to apportion the initial fleet
    pub metric: u32,
}

impl Default for ConnectStringConfig {
    fn default() -> Self {
        Self {
            connection_id: "default".into(),
            driver: "stub".into(),
            parameters: HashMap::new(),
            metric: 1,
        }
    }
}

/// Telemetry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON-formatted logs
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            json_logs: false,
        }
    }
}

impl InstanceConfig {
    /// Load configuration from an optional TOML file plus the `SQLR`
    /// environment overlay
    pub fn load(file: Option<&std::path::Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Toml),
            );
        }
        let cfg: InstanceConfig = builder
            .add_source(config::Environment::with_prefix("SQLR").separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Find the connect string for a connection id; falls back to the
    /// first entry when no id was requested
    pub fn connect_string(&self, connection_id: Option<&str>) -> Result<&ConnectStringConfig> {
        match connection_id {
            Some(id) => self
                .connect_strings
                .iter()
                .find(|cs| cs.connection_id == id)
                .ok_or_else(|| {
                    RelayError::ConfigError(format!("no connect string named '{}'", id))
                }),
            None => self.connect_strings.first().ok_or_else(|| {
                RelayError::ConfigError("no connect strings configured".into())
            }),
        }
    }

    /// Sum of connect string metrics
    pub fn metric_total(&self) -> u32 {
        self.connect_strings.iter().map(|cs| cs.metric).sum()
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty()
            || !self
                .id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(RelayError::ConfigError(format!(
                "instance id '{}' must be non-empty ASCII [a-zA-Z0-9_-]",
                self.id
            )));
        }
        if self.connections.connections > self.connections.max_connections {
            return Err(RelayError::ConfigError(format!(
                "connections ({}) exceeds max_connections ({})",
                self.connections.connections, self.connections.max_connections
            )));
        }
        if self.connections.cursors == 0 {
            return Err(RelayError::ConfigError("cursors must be at least 1".into()));
        }
        if self.connect_strings.is_empty() {
            return Err(RelayError::ConfigError(
                "at least one connect string is required".into(),
            ));
        }
        Ok(())
    }
}

/// Get environment variable with default
pub fn env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get environment variable as parsed type with default
pub fn env_parse_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = InstanceConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.connections.connections, 5);
        assert_eq!(cfg.limits.max_query_size, 65536);
    }

    #[test]
    fn bad_id_rejected() {
        let cfg = InstanceConfig {
            id: "bad id!".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fleet_bounds_checked() {
        let mut cfg = InstanceConfig::default();
        cfg.connections.connections = 50;
        cfg.connections.max_connections = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn connect_string_lookup() {
        let cfg = InstanceConfig::default();
        assert_eq!(
            cfg.connect_string(None).unwrap().connection_id,
            "default"
        );
        assert!(cfg.connect_string(Some("missing")).is_err());
        assert_eq!(cfg.metric_total(), 1);
    }
}
