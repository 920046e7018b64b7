//! Configuration for the ticket engine.
//!
//! Values are resolved in layers:
//! 1. Built-in defaults
//! 2. A TOML file (explicit path, or the global `config.toml`)
//! 3. Environment variables: `REMEDY_*`
//!
//! The result is validated before any component sees it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    completion::{MIN_COMPLETION_NOTES, MIN_TEST_RESULTS, MIN_TEST_STEPS},
    Error, Result,
};

// ═══════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemedyConfig {
    pub store: StoreConfig,
    pub lease: LeaseConfig,
    pub capacity: CapacityConfig,
    pub retry: RetryConfig,
    pub limits: FieldLimits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file. `None` resolves to the platform data directory.
    pub path: Option<PathBuf>,
    /// How long a connection waits behind another writer before reporting busy
    pub busy_timeout_ms: u64,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: 5_000,
            max_connections: 8,
        }
    }
}

impl StoreConfig {
    /// The configured path, or `<data dir>/remedy/tickets.db`.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => directories::ProjectDirs::from("", "", "remedy")
                .map(|dirs| dirs.data_dir().join("tickets.db"))
                .ok_or_else(|| {
                    Error::InvalidConfig(
                        "Cannot determine a data directory; set store.path or REMEDY_DB_PATH"
                            .into(),
                    )
                }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lease length used when a caller does not supply one
    pub default_secs: i64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self { default_secs: 300 }
    }
}

impl LeaseConfig {
    #[must_use]
    pub const fn default_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.default_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// Upper bound on non-deleted, non-completed tickets
    pub max_active_tickets: usize,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_active_tickets: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

/// Maximum lengths, in characters, for stored text fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldLimits {
    pub error_type: usize,
    pub message: usize,
    pub source: usize,
    pub stack_trace: usize,
    pub completion_notes: usize,
    pub test_steps: usize,
    pub test_results: usize,
    /// Cap on the serialized file-context blob, in bytes
    pub file_context_max_bytes: usize,
}

impl Default for FieldLimits {
    fn default() -> Self {
        Self {
            error_type: 200,
            message: 10_000,
            source: 500,
            stack_trace: 50_000,
            completion_notes: 20_000,
            test_steps: 20_000,
            test_results: 20_000,
            file_context_max_bytes: 64 * 1024,
        }
    }
}

impl FieldLimits {
    /// Reject `value` if it is longer than `limit` characters.
    pub fn check(field: &'static str, value: &str, limit: usize) -> Result<()> {
        let actual = value.chars().count();
        if actual > limit {
            return Err(Error::FieldTooLong {
                field,
                limit,
                actual,
            });
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LOADING
// ═══════════════════════════════════════════════════════════════════════════

impl RemedyConfig {
    /// Load defaults, then `path` (or the global config file if present),
    /// then environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(explicit) => Self::from_toml_file(explicit)?,
            None => match global_config_path() {
                Some(global) if global.exists() => Self::from_toml_file(&global)?,
                _ => Self::default(),
            },
        };

        let config = config.apply_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        if path.is_dir() {
            return Err(Error::Io(format!(
                "Config path is a directory, not a file: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Io(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            Error::Parse(msg) => Error::Parse(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(Error::from)
    }

    /// Apply `REMEDY_*` environment overrides.
    pub fn apply_env_vars(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var("REMEDY_DB_PATH") {
            if value.trim().is_empty() {
                return Err(Error::InvalidConfig(
                    "REMEDY_DB_PATH cannot be empty - unset the variable or provide a path".into(),
                ));
            }
            self.store.path = Some(PathBuf::from(value));
        }

        if let Ok(value) = std::env::var("REMEDY_BUSY_TIMEOUT_MS") {
            self.store.busy_timeout_ms = parse_env("REMEDY_BUSY_TIMEOUT_MS", &value)?;
        }

        if let Ok(value) = std::env::var("REMEDY_MAX_CONNECTIONS") {
            self.store.max_connections = parse_env("REMEDY_MAX_CONNECTIONS", &value)?;
        }

        if let Ok(value) = std::env::var("REMEDY_LEASE_SECS") {
            self.lease.default_secs = parse_env("REMEDY_LEASE_SECS", &value)?;
        }

        if let Ok(value) = std::env::var("REMEDY_MAX_ACTIVE_TICKETS") {
            self.capacity.max_active_tickets = parse_env("REMEDY_MAX_ACTIVE_TICKETS", &value)?;
        }

        if let Ok(value) = std::env::var("REMEDY_RETRY_ATTEMPTS") {
            self.retry.max_attempts = parse_env("REMEDY_RETRY_ATTEMPTS", &value)?;
        }

        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=60_000).contains(&self.store.busy_timeout_ms) {
            return Err(Error::InvalidConfig(
                "store.busy_timeout_ms must be 1-60000".into(),
            ));
        }

        if !(1..=64).contains(&self.store.max_connections) {
            return Err(Error::InvalidConfig(
                "store.max_connections must be 1-64".into(),
            ));
        }

        if !(1..=86_400).contains(&self.lease.default_secs) {
            return Err(Error::InvalidConfig(
                "lease.default_secs must be 1-86400".into(),
            ));
        }

        if self.capacity.max_active_tickets == 0 {
            return Err(Error::InvalidConfig(
                "capacity.max_active_tickets must be at least 1".into(),
            ));
        }

        if !(1..=10).contains(&self.retry.max_attempts) {
            return Err(Error::InvalidConfig("retry.max_attempts must be 1-10".into()));
        }

        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(Error::InvalidConfig(
                "retry.max_backoff_ms must not be below retry.initial_backoff_ms".into(),
            ));
        }

        let limits = &self.limits;
        let named = [
            ("limits.error_type", limits.error_type),
            ("limits.message", limits.message),
            ("limits.source", limits.source),
            ("limits.stack_trace", limits.stack_trace),
            ("limits.completion_notes", limits.completion_notes),
            ("limits.test_steps", limits.test_steps),
            ("limits.test_results", limits.test_results),
            ("limits.file_context_max_bytes", limits.file_context_max_bytes),
        ];
        if let Some((name, _)) = named.iter().find(|(_, value)| *value == 0) {
            return Err(Error::InvalidConfig(format!("{name} must be at least 1")));
        }

        let evidence = [
            ("limits.completion_notes", limits.completion_notes, MIN_COMPLETION_NOTES),
            ("limits.test_steps", limits.test_steps, MIN_TEST_STEPS),
            ("limits.test_results", limits.test_results, MIN_TEST_RESULTS),
        ];
        if let Some((name, _, min)) = evidence.iter().find(|(_, limit, min)| limit < min) {
            return Err(Error::InvalidConfig(format!(
                "{name} must be at least {min} so completions can pass the gate"
            )));
        }

        Ok(())
    }
}

/// Global config file: `<config dir>/remedy/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "remedy")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn parse_env<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::InvalidConfig(format!("Invalid {name} value '{value}': {e}")))
}
