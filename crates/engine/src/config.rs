//! Engine configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Optional
//! - `TICKET_DESK_SESSION_TTL_SECS` - Session validity window (default: 86400)
//! - `TICKET_DESK_SUBSCRIPTION_BUFFER` - Event-log channel capacity (default: 256)
//! - `TICKET_DESK_UPLOAD_TIMEOUT_SECS` - Attachment upload timeout (default: 30)
//! - `TICKET_DESK_REAPER_INTERVAL_SECS` - Expired-session sweep interval (default: 60)
//! - `TICKET_DESK_USERS_FILE` - YAML user directory used by the CLI

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_SUBSCRIPTION_BUFFER: usize = 256;
const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a session stays valid after authentication
    pub session_ttl: Duration,
    /// Capacity of the store's event-log channel
    pub subscription_buffer: usize,
    /// Deadline for a single attachment upload
    pub upload_timeout: Duration,
    /// How often expired sessions are swept
    pub reaper_interval: Duration,
    /// YAML user directory (CLI only)
    pub users_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
            upload_timeout: Duration::from_secs(DEFAULT_UPLOAD_TIMEOUT_SECS),
            reaper_interval: Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
            users_file: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set but not a positive number.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set but not a positive number.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let session_ttl = Duration::from_secs(get_positive(
            &lookup,
            "TICKET_DESK_SESSION_TTL_SECS",
            DEFAULT_SESSION_TTL_SECS,
        )?);
        let subscription_buffer = get_positive(
            &lookup,
            "TICKET_DESK_SUBSCRIPTION_BUFFER",
            DEFAULT_SUBSCRIPTION_BUFFER,
        )?;
        let upload_timeout = Duration::from_secs(get_positive(
            &lookup,
            "TICKET_DESK_UPLOAD_TIMEOUT_SECS",
            DEFAULT_UPLOAD_TIMEOUT_SECS,
        )?);
        let reaper_interval = Duration::from_secs(get_positive(
            &lookup,
            "TICKET_DESK_REAPER_INTERVAL_SECS",
            DEFAULT_REAPER_INTERVAL_SECS,
        )?);
        let users_file = lookup("TICKET_DESK_USERS_FILE").map(PathBuf::from);

        Ok(Self {
            session_ttl,
            subscription_buffer,
            upload_timeout,
            reaper_interval,
            users_file,
        })
    }
}

fn get_positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };

    let value = raw
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))?;

    if value == T::default() {
        return Err(ConfigError::InvalidEnvVar(
            key.to_string(),
            "must be greater than zero".to_string(),
        ));
    }

    Ok(value)
}
