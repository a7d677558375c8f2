//! Session core configuration.
//!
//! Configuration is loaded from environment variables. Every value has a
//! default so a session can start with an empty environment.

use crate::connection::retry::RetryPolicy;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default per-candidate wait for first inbound media (milliseconds).
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 2500;

/// Default number of candidate addresses tried per dial.
pub const DEFAULT_MAX_CANDIDATES: usize = 3;

/// Default reconnect sweep interval (milliseconds).
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 3000;

/// Sweep interval bounds (milliseconds).
pub const MIN_SWEEP_INTERVAL_MS: u64 = 2500;
pub const MAX_SWEEP_INTERVAL_MS: u64 = 5000;

/// Default cooldown before a refused screen-share request may prompt again.
pub const DEFAULT_SCREEN_SHARE_COOLDOWN_MS: u64 = 1500;

/// Default prefix of deterministic transport addresses.
pub const DEFAULT_ADDRESS_PREFIX: &str = "dt";

/// Default prefix of legacy account-id addresses.
pub const DEFAULT_LEGACY_ADDRESS_PREFIX: &str = "dt-legacy";

/// Default diagnostics endpoint bind address.
pub const DEFAULT_DIAGNOSTICS_BIND_ADDRESS: &str = "0.0.0.0:8085";

/// Session core configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Session identifier (default: random UUID).
    pub session_id: String,

    /// Per-candidate dial timeout (default: 2500ms).
    pub dial_timeout_ms: u64,

    /// Candidate addresses tried per dial (default: 3).
    pub max_candidates: usize,

    /// Reconnect sweep interval, clamped to 2.5-5s (default: 3000ms).
    pub sweep_interval_ms: u64,

    /// Screen-share re-prompt cooldown (default: 1500ms).
    pub screen_share_cooldown_ms: u64,

    /// Deterministic address prefix (default: "dt").
    pub address_prefix: String,

    /// Legacy address prefix (default: "dt-legacy").
    pub legacy_address_prefix: String,

    /// Diagnostics endpoint bind address (default: "0.0.0.0:8085").
    pub diagnostics_bind_address: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Runtime knobs handed to a session actor.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub retry: RetryPolicy,
    pub sweep_interval: Duration,
    pub screen_share_cooldown: Duration,
    pub address_prefix: String,
    pub legacy_address_prefix: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            screen_share_cooldown: Duration::from_millis(DEFAULT_SCREEN_SHARE_COOLDOWN_MS),
            address_prefix: DEFAULT_ADDRESS_PREFIX.to_string(),
            legacy_address_prefix: DEFAULT_LEGACY_ADDRESS_PREFIX.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let session_id = vars
            .get("SESSION_ID")
            .cloned()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let dial_timeout_ms = vars
            .get("SESSION_DIAL_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_DIAL_TIMEOUT_MS);
        if dial_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "SESSION_DIAL_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        let max_candidates = vars
            .get("SESSION_MAX_CANDIDATES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_CANDIDATES);
        if max_candidates == 0 {
            return Err(ConfigError::InvalidValue(
                "SESSION_MAX_CANDIDATES must be at least 1".to_string(),
            ));
        }

        let sweep_interval_ms = vars
            .get("SESSION_SWEEP_INTERVAL_MS")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_MS)
            .clamp(MIN_SWEEP_INTERVAL_MS, MAX_SWEEP_INTERVAL_MS);

        let screen_share_cooldown_ms = vars
            .get("SESSION_SCREEN_SHARE_COOLDOWN_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SCREEN_SHARE_COOLDOWN_MS);

        let address_prefix = vars
            .get("SESSION_ADDRESS_PREFIX")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ADDRESS_PREFIX.to_string());

        let legacy_address_prefix = vars
            .get("SESSION_LEGACY_ADDRESS_PREFIX")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LEGACY_ADDRESS_PREFIX.to_string());

        if address_prefix.is_empty() || address_prefix == legacy_address_prefix {
            return Err(ConfigError::InvalidValue(
                "SESSION_ADDRESS_PREFIX must be non-empty and differ from the legacy prefix"
                    .to_string(),
            ));
        }

        let diagnostics_bind_address = vars
            .get("SESSION_DIAGNOSTICS_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_DIAGNOSTICS_BIND_ADDRESS.to_string());

        Ok(Config {
            session_id,
            dial_timeout_ms,
            max_candidates,
            sweep_interval_ms,
            screen_share_cooldown_ms,
            address_prefix,
            legacy_address_prefix,
            diagnostics_bind_address,
        })
    }

    /// Settings for a session actor built from this configuration.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            retry: RetryPolicy {
                per_candidate_timeout: Duration::from_millis(self.dial_timeout_ms),
                max_candidates: self.max_candidates,
            },
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            screen_share_cooldown: Duration::from_millis(self.screen_share_cooldown_ms),
            address_prefix: self.address_prefix.clone(),
            legacy_address_prefix: self.legacy_address_prefix.clone(),
        }
    }
}
