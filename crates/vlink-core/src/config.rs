//! Link configuration.
//!
//! Handles loading, saving, and validating vlink configuration including:
//! - The vehicle to talk to and its key material
//! - Scan, connection and per-operation timeouts
//! - Retry and circuit breaker policy
//! - Logging
//!
//! Configuration lives in a TOML file. Any field can be overridden with a
//! `VLINK_`-prefixed environment variable, using `__` between section and
//! field (`VLINK_VEHICLE__VIN`, `VLINK_RETRY__MAX_RETRIES`).

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::RetryConfig;
use crate::circuit_breaker::CircuitBreakerConfig;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "VLINK";

/// VINs are 17 characters and never contain I, O or Q.
static VIN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-HJ-NPR-Z0-9]{17}$").expect("VIN pattern is a valid regex"));

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// No platform configuration directory could be determined.
    #[error("cannot determine config directory")]
    NoConfigDir,

    /// The file or environment could not be parsed into a configuration.
    #[error("failed to parse config: {0}")]
    Parse(#[from] ::config::ConfigError),

    /// The configuration could not be rendered as TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Writing the configuration file failed.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        /// File being written.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A single field failed validation.
    #[error("invalid {field}: {message}")]
    Validation {
        /// Dotted path of the offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// More than one field failed validation.
    #[error("{} validation errors: {}", .0.len(), join_problems(.0))]
    MultipleValidation(Vec<ValidationProblem>),

    /// The file watcher could not be started.
    #[error("failed to watch config file: {0}")]
    Watch(#[from] notify::Error),
}

/// One validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationProblem {
    /// Dotted path of the offending field.
    pub field: &'static str,
    /// What is wrong with it.
    pub message: String,
}

impl fmt::Display for ValidationProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_problems(problems: &[ValidationProblem]) -> String {
    problems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// =============================================================================
// SECTIONS
// =============================================================================

/// Complete vlink configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Vehicle identity and link timing.
    pub vehicle: VehicleConfig,
    /// Client behavior.
    pub client: ClientConfig,
    /// Outer retry policy.
    pub retry: RetryConfig,
    /// Circuit breaker policy.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Vehicle identity and link timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    /// Vehicle identification number.
    pub vin: String,

    /// Private key used to authenticate the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<PathBuf>,

    /// Budget for a whole connect, scan retries included.
    #[serde(rename = "connection_timeout_ms", with = "duration_ms")]
    pub connection_timeout: Duration,

    /// Budget for a single scan attempt.
    #[serde(rename = "scan_timeout_ms", with = "duration_ms")]
    pub scan_timeout: Duration,

    /// Budget for a state query.
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,

    /// Budget for a command send.
    #[serde(rename = "command_timeout_ms", with = "duration_ms")]
    pub command_timeout: Duration,

    /// Scan attempts per connect.
    pub scan_retries: u32,

    /// Fixed pause between scan attempts.
    #[serde(rename = "scan_delay_ms", with = "duration_ms")]
    pub scan_delay: Duration,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            vin: String::new(),
            private_key_file: None,
            connection_timeout: Duration::from_secs(60),
            scan_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(15),
            scan_retries: 3,
            scan_delay: Duration::from_secs(2),
        }
    }
}

/// Client behavior.
///
/// The keep-alive and health check intervals are advisory: the core never
/// schedules work on its own, callers drive health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name reported by the client.
    pub client_name: String,

    /// Suggested keep-alive period.
    #[serde(rename = "keep_alive_interval_ms", with = "duration_ms")]
    pub keep_alive_interval: Duration,

    /// Suggested health check period.
    #[serde(rename = "health_check_interval_ms", with = "duration_ms")]
    pub health_check_interval: Duration,

    /// Health probes closer together than this are skipped.
    #[serde(rename = "health_check_min_interval_ms", with = "duration_ms")]
    pub health_check_min_interval: Duration,

    /// Heal the connection before sending commands.
    pub enable_auto_reconnect: bool,

    /// Whether callers should schedule health checks.
    pub enable_health_checks: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "vlink".into(),
            keep_alive_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            health_check_min_interval: Duration::from_secs(5),
            enable_auto_reconnect: true,
            enable_health_checks: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Log destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Standard output.
    #[default]
    Stdout,
    /// Standard error.
    Stderr,
    /// Daily rotated file at `file_path`.
    File,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum level: trace, debug, info, warn or error.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Destination.
    pub output: LogOutput,
    /// Log file, required when `output` is `file`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    /// Rotated files to keep.
    pub max_backups: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
            output: LogOutput::Stdout,
            file_path: None,
            max_backups: 7,
        }
    }
}

// =============================================================================
// LOADING AND SAVING
// =============================================================================

impl LinkConfig {
    /// Loads configuration from `path`, layering environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file is missing, or
    /// [`ConfigError::Parse`] if it or the environment is malformed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::build(path)
    }

    /// Loads configuration from `path`, falling back to defaults (plus
    /// environment overrides) when the file is missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the file or environment is malformed.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Self::build(path)
    }

    /// Loads configuration from `path`, writing a default file first if none
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the default file cannot be written or the existing
    /// file cannot be parsed.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            Self::default().save(path)?;
            tracing::info!(path = %path.display(), "created default config file");
        }
        Self::build(path)
    }

    fn build(path: &Path) -> Result<Self, ConfigError> {
        let settings = ::config::Config::builder()
            .add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Writes the configuration to `path` as pretty TOML, creating parent
    /// directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any file operation fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(write_err)
    }

    /// Platform configuration file path (`~/.config/vlink/config.toml` on
    /// Linux).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConfigDir`] if no home directory is known.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs =
            directories::ProjectDirs::from("", "", "vlink").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    // =========================================================================
    // VALIDATION
    // =========================================================================

    /// Checks every field, reporting all problems at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for a single problem or
    /// [`ConfigError::MultipleValidation`] for several.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        let mut check = |ok: bool, field: &'static str, message: &str| {
            if !ok {
                problems.push(ValidationProblem {
                    field,
                    message: message.to_owned(),
                });
            }
        };

        let vehicle = &self.vehicle;
        if vehicle.vin.is_empty() {
            check(false, "vehicle.vin", "is required");
        } else {
            check(
                VIN_PATTERN.is_match(&vehicle.vin),
                "vehicle.vin",
                "must be 17 characters of A-Z and 0-9, excluding I, O and Q",
            );
        }
        let positive = "must be greater than zero";
        check(!vehicle.connection_timeout.is_zero(), "vehicle.connection_timeout_ms", positive);
        check(!vehicle.scan_timeout.is_zero(), "vehicle.scan_timeout_ms", positive);
        check(!vehicle.request_timeout.is_zero(), "vehicle.request_timeout_ms", positive);
        check(!vehicle.command_timeout.is_zero(), "vehicle.command_timeout_ms", positive);
        check(!vehicle.scan_delay.is_zero(), "vehicle.scan_delay_ms", positive);
        check(vehicle.scan_retries > 0, "vehicle.scan_retries", "must be at least 1");

        let client = &self.client;
        check(!client.keep_alive_interval.is_zero(), "client.keep_alive_interval_ms", positive);
        check(
            !client.health_check_interval.is_zero(),
            "client.health_check_interval_ms",
            positive,
        );

        let retry = &self.retry;
        check(!retry.initial_delay.is_zero(), "retry.initial_delay_ms", positive);
        check(!retry.max_delay.is_zero(), "retry.max_delay_ms", positive);
        check(
            retry.backoff_factor.is_finite() && retry.backoff_factor > 0.0,
            "retry.backoff_factor",
            positive,
        );
        check(
            retry.initial_delay <= retry.max_delay,
            "retry.initial_delay_ms",
            "must not exceed retry.max_delay_ms",
        );

        let breaker = &self.circuit_breaker;
        check(breaker.max_failures > 0, "circuit_breaker.max_failures", positive);
        check(!breaker.reset_timeout.is_zero(), "circuit_breaker.reset_timeout_ms", positive);
        check(
            breaker.half_open_max_calls > 0,
            "circuit_breaker.half_open_max_calls",
            positive,
        );

        let logging = &self.logging;
        check(
            LOG_LEVELS.contains(&logging.level.to_ascii_lowercase().as_str()),
            "logging.level",
            "must be one of trace, debug, info, warn, error",
        );
        check(
            logging.output != LogOutput::File || logging.file_path.is_some(),
            "logging.file_path",
            "is required when logging.output is file",
        );

        match problems.len() {
            0 => Ok(()),
            1 => {
                let problem = problems.remove(0);
                Err(ConfigError::Validation {
                    field: problem.field,
                    message: problem.message,
                })
            }
            _ => Err(ConfigError::MultipleValidation(problems)),
        }
    }
}

/// Serializes a [`Duration`] as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
