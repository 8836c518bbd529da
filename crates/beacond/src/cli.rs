//! CLI argument parsing for the beacon server.
//!
//! Every flag has an environment fallback so the binary drops into
//! container deployments without wrapper scripts.

use std::net::SocketAddr;
use std::time::Duration;

use beacon_cdc::{RetryPolicy, StreamConfig};
use clap::Parser;

/// Beacon - CRUD API with CDC-driven live updates
///
/// Serves a REST API over PostgreSQL and pushes row changes to websocket
/// clients by consuming the database's logical replication stream.
#[derive(Parser, Debug, Clone)]
#[command(name = "beacond")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    // ============ Server ============
    /// HTTP bind address
    #[arg(long, default_value = "0.0.0.0:3000", env = "BEACON_BIND")]
    pub bind: SocketAddr,

    /// WebSocket bind address
    #[arg(long, default_value = "0.0.0.0:3001", env = "BEACON_WS_BIND")]
    pub ws_bind: SocketAddr,

    /// Allowed CORS origin for the frontend
    #[arg(long, default_value = "http://localhost:5174", env = "FRONTEND_URL")]
    pub frontend_url: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Per-client websocket send buffer, in frames
    #[arg(long, default_value = "64", env = "BEACON_WS_BUFFER")]
    pub ws_buffer: usize,

    // ============ Database ============
    /// PostgreSQL host
    #[arg(long, default_value = "localhost", env = "POSTGRES_HOST")]
    pub pg_host: String,

    /// PostgreSQL port
    #[arg(long, default_value = "5432", env = "POSTGRES_PORT")]
    pub pg_port: u16,

    /// PostgreSQL user
    #[arg(long, default_value = "dev", env = "POSTGRES_USER")]
    pub pg_user: String,

    /// PostgreSQL password
    #[arg(long, default_value = "dev", env = "POSTGRES_PASSWORD")]
    pub pg_password: String,

    /// PostgreSQL database name
    #[arg(long, default_value = "beacon", env = "POSTGRES_DATABASE")]
    pub pg_database: String,

    // ============ Change data capture ============
    /// Enable the CDC consumer
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "BEACON_CDC")]
    pub cdc_enabled: bool,

    /// Logical replication publication name
    #[arg(long, default_value = "beacon_cdc", env = "BEACON_PUBLICATION")]
    pub publication: String,

    /// Logical replication slot name
    #[arg(long, default_value = "beacon_cdc_slot", env = "BEACON_SLOT")]
    pub slot: String,

    /// Base reconnect delay in milliseconds
    #[arg(long, default_value = "1000", env = "BEACON_RETRY_BASE_MS")]
    pub retry_base_ms: u64,

    /// Reconnect delay cap in milliseconds
    #[arg(long, default_value = "30000", env = "BEACON_RETRY_CAP_MS")]
    pub retry_cap_ms: u64,

    /// Consecutive reconnect attempts before going dormant
    #[arg(long, default_value = "50", env = "BEACON_RETRY_MAX_ATTEMPTS")]
    pub retry_max_attempts: u32,

    /// Seconds between replication acknowledgments
    #[arg(long, default_value = "10", env = "BEACON_ACK_INTERVAL_SECS")]
    pub ack_interval_secs: u64,
}

impl Cli {
    /// Validate configuration before startup.
    pub fn validate(&self) -> Result<(), String> {
        if self.pg_user.is_empty() {
            return Err("postgres user must not be empty".into());
        }
        if self.pg_database.is_empty() {
            return Err("postgres database must not be empty".into());
        }
        if self.ws_buffer == 0 {
            return Err("websocket buffer must be at least 1".into());
        }
        if self.retry_base_ms == 0 {
            return Err("retry base delay must be positive".into());
        }
        if self.ack_interval_secs == 0 {
            return Err("ack interval must be positive".into());
        }
        // Stream config repeats identifier checks for slot/publication.
        self.stream_config().validate().map_err(|e| e.to_string())
    }

    /// Retry policy for the change stream supervisor.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_cap_ms),
            self.retry_max_attempts,
        )
    }

    /// Connection settings for the change stream client.
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            host: self.pg_host.clone(),
            port: self.pg_port,
            user: self.pg_user.clone(),
            password: if self.pg_password.is_empty() {
                None
            } else {
                Some(self.pg_password.clone())
            },
            database: self.pg_database.clone(),
            slot: self.slot.clone(),
            publication: self.publication.clone(),
            retry: self.retry_policy(),
            ack_interval: Duration::from_secs(self.ack_interval_secs),
        }
    }
}
