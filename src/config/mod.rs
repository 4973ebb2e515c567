//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::game::RoomSettings;
use crate::store::LedgerSettings;
use crate::ws::connection::ConnectionSettings;

/// Which persistence backend the score ledger writes through
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerBackendKind {
    /// Embedded SQLite file (default)
    Sqlite,
    /// Supabase PostgREST API
    Supabase,
    /// In-process store, lost on restart
    Memory,
}

impl FromStr for LedgerBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "supabase" => Ok(Self::Supabase),
            "memory" => Ok(Self::Memory),
            _ => Err(ConfigError::Invalid("LEDGER_BACKEND")),
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS (comma-separated)
    pub client_origin: String,
    /// Per-request timeout for the REST endpoints
    pub request_timeout: Duration,
    /// How long shutdown waits for live rooms to drain
    pub shutdown_drain: Duration,

    /// Ledger persistence backend
    pub ledger_backend: LedgerBackendKind,
    /// SQLite database file
    pub database_path: PathBuf,
    /// Supabase project URL (supabase backend only)
    pub supabase_url: Option<String>,
    /// Supabase service role key (supabase backend only)
    pub supabase_service_role_key: Option<String>,

    /// Time both players have to send JOIN after pairing
    pub join_timeout: Duration,
    /// Max silence in an active room before it is aborted
    pub idle_timeout: Duration,
    /// Protocol errors a player may commit before the room aborts
    pub max_protocol_errors: u32,
    /// Commit accumulated tallies when a match is aborted
    pub partial_credit: bool,

    /// Bound on a single ledger write (and on waiting for the player lock)
    pub ledger_write_timeout: Duration,
    /// Total attempts for a ledger write before it is reported as failed
    pub ledger_max_attempts: u32,
    /// Base delay between ledger retries, doubled per attempt
    pub ledger_retry_backoff: Duration,

    /// Outbound envelopes buffered per connection
    pub outbound_buffer: usize,
    /// How long a send may wait on a full buffer before the peer is dropped
    pub backpressure_grace: Duration,
    /// Best-effort deadline for flushing queued envelopes on close
    pub close_flush: Duration,
    /// Inbound messages allowed per second per connection
    pub inbound_rate_limit: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let ledger_backend = match env::var("LEDGER_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => LedgerBackendKind::Sqlite,
        };

        let supabase_url = env::var("SUPABASE_URL").ok();
        let supabase_service_role_key = env::var("SUPABASE_SERVICE_ROLE_KEY").ok();
        if ledger_backend == LedgerBackendKind::Supabase {
            if supabase_url.is_none() {
                return Err(ConfigError::Missing("SUPABASE_URL"));
            }
            if supabase_service_role_key.is_none() {
                return Err(ConfigError::Missing("SUPABASE_SERVICE_ROLE_KEY"));
            }
        }

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origin: env::var("CLIENT_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:5173".to_string()),
            request_timeout: Duration::from_secs(parse_var("REQUEST_TIMEOUT_SECS", 10)?),
            shutdown_drain: Duration::from_secs(parse_var("SHUTDOWN_DRAIN_SECS", 10)?),

            ledger_backend,
            database_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("duel_relay.db")),
            supabase_url,
            supabase_service_role_key,

            join_timeout: Duration::from_secs(parse_var("JOIN_TIMEOUT_SECS", 15)?),
            idle_timeout: Duration::from_secs(parse_var("IDLE_TIMEOUT_SECS", 120)?),
            max_protocol_errors: parse_var("MAX_PROTOCOL_ERRORS", 5)?,
            partial_credit: parse_var("PARTIAL_CREDIT", false)?,

            ledger_write_timeout: Duration::from_millis(parse_var("LEDGER_WRITE_TIMEOUT_MS", 2_000)?),
            ledger_max_attempts: parse_var("LEDGER_MAX_ATTEMPTS", 4)?,
            ledger_retry_backoff: Duration::from_millis(parse_var("LEDGER_RETRY_BACKOFF_MS", 100)?),

            outbound_buffer: parse_var("OUTBOUND_BUFFER", 64)?,
            backpressure_grace: Duration::from_millis(parse_var("BACKPRESSURE_GRACE_MS", 500)?),
            close_flush: Duration::from_millis(parse_var("CLOSE_FLUSH_MS", 1_000)?),
            inbound_rate_limit: parse_var("INBOUND_RATE_LIMIT", 30)?,
        })
    }

    pub fn room_settings(&self) -> RoomSettings {
        RoomSettings {
            join_timeout: self.join_timeout,
            idle_timeout: self.idle_timeout,
            max_protocol_errors: self.max_protocol_errors,
            partial_credit: self.partial_credit,
        }
    }

    pub fn ledger_settings(&self) -> LedgerSettings {
        LedgerSettings {
            write_timeout: self.ledger_write_timeout,
            max_attempts: self.ledger_max_attempts.max(1),
            retry_backoff: self.ledger_retry_backoff,
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            outbound_buffer: self.outbound_buffer.max(1),
            backpressure_grace: self.backpressure_grace,
            close_flush: self.close_flush,
            inbound_rate_limit: self.inbound_rate_limit,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let rooms = RoomSettings::default();
        let ledger = LedgerSettings::default();
        let connections = ConnectionSettings::default();
        Self {
            server_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            client_origin: "http://localhost:5173".to_string(),
            request_timeout: Duration::from_secs(10),
            shutdown_drain: Duration::from_secs(10),
            ledger_backend: LedgerBackendKind::Sqlite,
            database_path: PathBuf::from("duel_relay.db"),
            supabase_url: None,
            supabase_service_role_key: None,
            join_timeout: rooms.join_timeout,
            idle_timeout: rooms.idle_timeout,
            max_protocol_errors: rooms.max_protocol_errors,
            partial_credit: rooms.partial_credit,
            ledger_write_timeout: ledger.write_timeout,
            ledger_max_attempts: ledger.max_attempts,
            ledger_retry_backoff: ledger.retry_backoff,
            outbound_buffer: connections.outbound_buffer,
            backpressure_grace: connections.backpressure_grace,
            close_flush: connections.close_flush,
            inbound_rate_limit: connections.inbound_rate_limit,
        }
    }
}

/// Read an optional variable, falling back to `default` when unset
fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
