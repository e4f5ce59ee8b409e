//! Configuration loading and constants.
//!
//! Loads the build/runtime descriptor from TOML files and defines constants for
//! probe timing, the runtime identity, the image store layout, logging format,
//! and default paths. `AppConfig` is the root configuration struct containing
//! all settings.

use const_format::formatcp;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

// =============================================================================
// Liveness Probe Defaults
// =============================================================================
// Default timing parameters for the health-check supervisor. All values are
// overridable per image through the [healthcheck] config table; the orchestrator
// that schedules probes owns the final word on timing.

/// Seconds between consecutive probe attempts
pub const PROBE_INTERVAL_SECS: u64 = 30;

/// Seconds before a single probe attempt is declared failed
pub const PROBE_TIMEOUT_SECS: u64 = 10;

/// Seconds after instance start during which failed probes do not count
/// toward the unhealthy threshold (the service may still be initializing)
pub const PROBE_GRACE_PERIOD_SECS: u64 = 60;

/// Consecutive post-grace failures before an instance is declared unhealthy
pub const PROBE_FAILURE_THRESHOLD: u32 = 3;

/// Path probed on the instance's exposed port
pub const DEFAULT_HEALTH_PATH: &str = "/health";

// =============================================================================
// Runtime Defaults
// =============================================================================

/// Port the service process is expected to bind inside the instance
pub const DEFAULT_EXPOSED_PORT: u16 = 8080;

/// Name of the non-privileged runtime user created at build time
pub const DEFAULT_RUNTIME_USER: &str = "botuser";

/// Numeric user id of the runtime identity
pub const DEFAULT_RUNTIME_UID: u32 = 1000;

/// Numeric group id of the runtime identity
pub const DEFAULT_RUNTIME_GID: u32 = 1000;

/// Working directory inside the image that receives the project tree
pub const DEFAULT_WORKDIR: &str = "/app";

/// Default probe target for an instance using the default port and path
pub const DEFAULT_PROBE_URL: &str =
    formatcp!("http://localhost:{}{}", DEFAULT_EXPOSED_PORT, DEFAULT_HEALTH_PATH);

/// Milliseconds after spawn during which an exited child is treated as a
/// failed startup rather than a short-lived run
pub const STARTUP_EXIT_WINDOW_MS: u64 = 1000;

// =============================================================================
// Build Defaults
// =============================================================================

/// Dependency manifest consumed by the installer step
pub const DEFAULT_DEPENDENCY_MANIFEST: &str = "requirements.txt";

/// OS packages required for compiling native Python extensions:
/// a C compiler, a C++ compiler, and PostgreSQL client development headers
pub const DEFAULT_OS_PACKAGES: [&str; 3] = ["gcc", "g++", "libpq-dev"];

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default image store directory
pub const DEFAULT_STORE_DIR: &str = "/var/lib/stevedore/images";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "stevedore=debug";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Base image and store settings
    pub image: ImageConfig,
    /// Build pipeline settings
    #[serde(default)]
    pub build: BuildConfig,
    /// Runtime identity, port, and startup command
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Liveness probe timing
    #[serde(default)]
    pub healthcheck: HealthcheckConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Base image reference and image store location
#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    /// Base runtime reference. Must be pinned to an explicit version tag;
    /// `latest` and untagged references are rejected at load time.
    pub base: String,
    /// Directory the image store lives under
    #[serde(default = "ImageConfig::default_store")]
    pub store: String,
}

impl ImageConfig {
    fn default_store() -> String {
        DEFAULT_STORE_DIR.to_string()
    }

    /// Check whether the base reference carries an explicit, non-floating tag
    pub fn base_is_pinned(&self) -> bool {
        match self.base.rsplit_once(':') {
            Some((_, tag)) => !tag.is_empty() && tag != "latest",
            None => false,
        }
    }
}

/// Build pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    /// Project tree copied into the image
    #[serde(default = "BuildConfig::default_context")]
    pub context: String,
    /// Dependency manifest file, resolved relative to the context
    #[serde(default = "BuildConfig::default_dependency_manifest")]
    pub dependency_manifest: String,
    /// OS-level packages installed before dependency resolution
    #[serde(default = "BuildConfig::default_os_packages")]
    pub os_packages: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            context: Self::default_context(),
            dependency_manifest: Self::default_dependency_manifest(),
            os_packages: Self::default_os_packages(),
        }
    }
}

impl BuildConfig {
    fn default_context() -> String {
        ".".to_string()
    }

    fn default_dependency_manifest() -> String {
        DEFAULT_DEPENDENCY_MANIFEST.to_string()
    }

    fn default_os_packages() -> Vec<String> {
        DEFAULT_OS_PACKAGES.iter().map(|p| p.to_string()).collect()
    }
}

/// Runtime identity, network exposure, and startup command
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Name of the non-privileged runtime user
    #[serde(default = "RuntimeConfig::default_user")]
    pub user: String,
    /// Numeric user id (never 0)
    #[serde(default = "RuntimeConfig::default_uid")]
    pub uid: u32,
    /// Numeric group id (never 0)
    #[serde(default = "RuntimeConfig::default_gid")]
    pub gid: u32,
    /// Working directory inside the image
    #[serde(default = "RuntimeConfig::default_workdir")]
    pub workdir: String,
    /// Port the service process is declared to listen on. Declaration only;
    /// the service process is responsible for actually binding it.
    #[serde(default = "RuntimeConfig::default_port")]
    pub port: u16,
    /// Startup command, invoked with no additional arguments
    #[serde(default = "RuntimeConfig::default_command")]
    pub command: Vec<String>,
    /// Environment variables set for the service process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            user: Self::default_user(),
            uid: Self::default_uid(),
            gid: Self::default_gid(),
            workdir: Self::default_workdir(),
            port: Self::default_port(),
            command: Self::default_command(),
            env: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    fn default_user() -> String {
        DEFAULT_RUNTIME_USER.to_string()
    }

    fn default_uid() -> u32 {
        DEFAULT_RUNTIME_UID
    }

    fn default_gid() -> u32 {
        DEFAULT_RUNTIME_GID
    }

    fn default_workdir() -> String {
        DEFAULT_WORKDIR.to_string()
    }

    fn default_port() -> u16 {
        DEFAULT_EXPOSED_PORT
    }

    fn default_command() -> Vec<String> {
        vec!["python".to_string(), "main.py".to_string()]
    }
}

/// Liveness probe timing parameters
#[derive(Debug, Clone, Deserialize)]
pub struct HealthcheckConfig {
    /// Path probed on the exposed port
    #[serde(default = "HealthcheckConfig::default_path")]
    pub path: String,
    /// Seconds between probe attempts
    #[serde(default = "HealthcheckConfig::default_interval")]
    pub interval_seconds: u64,
    /// Seconds before a single attempt is declared failed
    #[serde(default = "HealthcheckConfig::default_timeout")]
    pub timeout_seconds: u64,
    /// Seconds after start during which failures do not count
    #[serde(default = "HealthcheckConfig::default_grace_period")]
    pub grace_period_seconds: u64,
    /// Consecutive post-grace failures before the instance is unhealthy
    #[serde(default = "HealthcheckConfig::default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            interval_seconds: Self::default_interval(),
            timeout_seconds: Self::default_timeout(),
            grace_period_seconds: Self::default_grace_period(),
            failure_threshold: Self::default_failure_threshold(),
        }
    }
}

impl HealthcheckConfig {
    fn default_path() -> String {
        DEFAULT_HEALTH_PATH.to_string()
    }

    fn default_interval() -> u64 {
        PROBE_INTERVAL_SECS
    }

    fn default_timeout() -> u64 {
        PROBE_TIMEOUT_SECS
    }

    fn default_grace_period() -> u64 {
        PROBE_GRACE_PERIOD_SECS
    }

    fn default_failure_threshold() -> u32 {
        PROBE_FAILURE_THRESHOLD
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants that hold for every build and launch.
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.image.base_is_pinned() {
            return Err(ConfigError::Validation(format!(
                "image.base \"{}\" must be pinned to an explicit version tag",
                self.image.base
            )));
        }

        // Instances never execute as the privileged identity
        if self.runtime.uid == 0 || self.runtime.gid == 0 {
            return Err(ConfigError::Validation(
                "runtime.uid and runtime.gid must be non-zero".to_string(),
            ));
        }

        if self.runtime.command.is_empty() {
            return Err(ConfigError::Validation(
                "runtime.command must name the service process".to_string(),
            ));
        }

        if self.healthcheck.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "healthcheck.failure_threshold must be at least 1".to_string(),
            ));
        }

        if !self.healthcheck.path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "healthcheck.path \"{}\" must start with '/'",
                self.healthcheck.path
            )));
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}
