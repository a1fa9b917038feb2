//! Configuration management for vendorbox
//!
//! Settings are loaded from environment variables with sensible defaults. They cover
//! storage locations, worker sizing, retry and timeout policy, and the pass-through
//! settings handed to package-manager tooling.
//!
//! # Environment Variables
//!
//! - `VENDORBOX_SOURCES_DIR`: Cache of fetched sources - default: user cache dir + "vendorbox/sources"
//! - `VENDORBOX_BUNDLES_DIR`: Published bundles - default: user cache dir + "vendorbox/bundles"
//! - `VENDORBOX_WORK_DIR`: Private per-request working trees - default: temp dir + "vendorbox-work"
//! - `VENDORBOX_WORKERS`: Worker pool size - default: "4"
//! - `VENDORBOX_FETCH_RETRIES`: Extra attempts for transient fetch failures - default: "3"
//! - `VENDORBOX_RETRY_BASE_MS`: First backoff delay in milliseconds - default: "500"
//! - `VENDORBOX_STEP_TIMEOUT`: Timeout of one external step in seconds - default: "600"
//! - `VENDORBOX_STALE_AFTER`: Age in seconds after which in-progress requests go stale - default: "86400"
//! - `VENDORBOX_DEFAULT_PKG_MANAGERS`: Comma separated ecosystems used when a request names none - default: "gomod"
//! - `VENDORBOX_MAX_PER_PAGE`: Upper bound for list page sizes - default: "100"
//! - `VENDORBOX_GOPROXY` / `VENDORBOX_GOSUMDB`: Go module proxy and checksum database
//! - `VENDORBOX_GIT_BIN` / `VENDORBOX_HG_BIN` / `VENDORBOX_GO_BIN`: Tool executables
//! - `VENDORBOX_NPM_TOKEN`: Bearer token passed through to the npm registry
//! - `VENDORBOX_PIP_INDEX_URL`: Base URL of the Python package index JSON API
//! - `VENDORBOX_LOG_LEVEL`: Logging level - default: "info"
//!
//! # Example
//!
//! ```no_run
//! use vendorbox::VendorboxConfig;
//!
//! let config = VendorboxConfig::default();
//! config.validate().expect("Invalid configuration");
//! println!("{}", config);
//! ```

use crate::models::Ecosystem;
use std::collections::{BTreeSet, HashMap};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_FETCH_RETRIES: usize = 3;
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const DEFAULT_STEP_TIMEOUT_SECS: u64 = 600;
const DEFAULT_STALE_AFTER_SECS: u64 = 86_400;
const DEFAULT_MAX_PER_PAGE: usize = 100;
const DEFAULT_GOPROXY: &str = "https://proxy.golang.org";
const DEFAULT_GOSUMDB: &str = "sum.golang.org";
const DEFAULT_PIP_INDEX_URL: &str = "https://pypi.org/pypi";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Flags resolvers understand; anything else is rejected at submission
pub const KNOWN_FLAGS: &[&str] = &["skip-dev-dependencies"];

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// Failed to parse configuration value
    #[error("Failed to parse {field}: {error}")]
    ParseError { field: String, error: String },
}

/// Main configuration structure for vendorbox
#[derive(Debug, Clone)]
pub struct VendorboxConfig {
    /// Cache Layer root, one directory per repository
    pub sources_dir: PathBuf,

    /// Published bundles
    pub bundles_dir: PathBuf,

    /// Private working trees, one per request
    pub work_dir: PathBuf,

    pub workers: usize,

    pub fetch_retries: usize,

    pub retry_base_ms: u64,

    /// Deadline of a single external step (clone, tool run, download)
    pub step_timeout_secs: u64,

    pub stale_after_secs: u64,

    pub default_pkg_managers: BTreeSet<Ecosystem>,

    pub max_per_page: usize,

    pub goproxy: String,

    pub gosumdb: String,

    pub git_bin: String,

    pub hg_bin: String,

    pub go_bin: String,

    pub npm_token: Option<String>,

    pub pip_index_url: String,

    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Parses a comma separated ecosystem list
pub fn parse_pkg_managers(value: &str) -> Result<BTreeSet<Ecosystem>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|tag| {
            Ecosystem::from_tag(tag).ok_or_else(|| ConfigError::ParseError {
                field: "pkg_managers".to_string(),
                error: format!("unknown package manager '{}'", tag),
            })
        })
        .collect()
}

impl Default for VendorboxConfig {
    /// Loads VENDORBOX_* environment variables, falling back to defaults
    fn default() -> Self {
        let data_root = dirs::cache_dir()
            .unwrap_or_else(env::temp_dir)
            .join("vendorbox");

        let sources_dir = env::var("VENDORBOX_SOURCES_DIR")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_root.join("sources"));
        let bundles_dir = env::var("VENDORBOX_BUNDLES_DIR")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_root.join("bundles"));
        let work_dir = env::var("VENDORBOX_WORK_DIR")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("vendorbox-work"));

        let default_pkg_managers = env::var("VENDORBOX_DEFAULT_PKG_MANAGERS")
            .ok()
            .and_then(|v| parse_pkg_managers(&v).ok())
            .filter(|set| !set.is_empty())
            .unwrap_or_else(|| [Ecosystem::Gomod].into_iter().collect());

        let npm_token = env::var("VENDORBOX_NPM_TOKEN")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let log_level = env::var("VENDORBOX_LOG_LEVEL")
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
            .to_lowercase();

        Self {
            sources_dir,
            bundles_dir,
            work_dir,
            workers: env_parse("VENDORBOX_WORKERS", DEFAULT_WORKERS),
            fetch_retries: env_parse("VENDORBOX_FETCH_RETRIES", DEFAULT_FETCH_RETRIES),
            retry_base_ms: env_parse("VENDORBOX_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS),
            step_timeout_secs: env_parse("VENDORBOX_STEP_TIMEOUT", DEFAULT_STEP_TIMEOUT_SECS),
            stale_after_secs: env_parse("VENDORBOX_STALE_AFTER", DEFAULT_STALE_AFTER_SECS),
            default_pkg_managers,
            max_per_page: env_parse("VENDORBOX_MAX_PER_PAGE", DEFAULT_MAX_PER_PAGE),
            goproxy: env_string("VENDORBOX_GOPROXY", DEFAULT_GOPROXY),
            gosumdb: env_string("VENDORBOX_GOSUMDB", DEFAULT_GOSUMDB),
            git_bin: env_string("VENDORBOX_GIT_BIN", "git"),
            hg_bin: env_string("VENDORBOX_HG_BIN", "hg"),
            go_bin: env_string("VENDORBOX_GO_BIN", "go"),
            npm_token,
            pip_index_url: env_string("VENDORBOX_PIP_INDEX_URL", DEFAULT_PIP_INDEX_URL),
            log_level,
        }
    }
}

impl VendorboxConfig {
    /// Built-in defaults rooted in one directory; the environment is not consulted
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            sources_dir: root.join("sources"),
            bundles_dir: root.join("bundles"),
            work_dir: root.join("work"),
            workers: DEFAULT_WORKERS,
            fetch_retries: DEFAULT_FETCH_RETRIES,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            default_pkg_managers: [Ecosystem::Gomod].into_iter().collect(),
            max_per_page: DEFAULT_MAX_PER_PAGE,
            goproxy: DEFAULT_GOPROXY.to_string(),
            gosumdb: DEFAULT_GOSUMDB.to_string(),
            git_bin: "git".to_string(),
            hg_bin: "hg".to_string(),
            go_bin: "go".to_string(),
            npm_token: None,
            pip_index_url: DEFAULT_PIP_INDEX_URL.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }

    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any value is out of range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 || self.workers > 64 {
            return Err(ConfigError::ValidationFailed(
                "Worker count must be between 1 and 64".to_string(),
            ));
        }

        if self.fetch_retries > 10 {
            return Err(ConfigError::ValidationFailed(
                "Fetch retries cannot exceed 10".to_string(),
            ));
        }

        if self.step_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "Step timeout must be at least 1 second".to_string(),
            ));
        }
        if self.step_timeout_secs > 7200 {
            return Err(ConfigError::ValidationFailed(
                "Step timeout cannot exceed 2 hours".to_string(),
            ));
        }

        if self.stale_after_secs < self.step_timeout_secs {
            return Err(ConfigError::ValidationFailed(
                "Stale age must be at least the step timeout".to_string(),
            ));
        }

        if self.max_per_page == 0 {
            return Err(ConfigError::ValidationFailed(
                "Max page size must be at least 1".to_string(),
            ));
        }

        if self.default_pkg_managers.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "At least one default package manager is required".to_string(),
            ));
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationFailed(format!(
                    "Invalid log level: {}. Valid options: trace, debug, info, warn, error",
                    self.log_level
                )))
            }
        }

        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    /// Converts configuration to a display map for output formatting
    pub fn to_display_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();

        map.insert("sources_dir".to_string(), self.sources_dir.display().to_string());
        map.insert("bundles_dir".to_string(), self.bundles_dir.display().to_string());
        map.insert("work_dir".to_string(), self.work_dir.display().to_string());
        map.insert("workers".to_string(), self.workers.to_string());
        map.insert("fetch_retries".to_string(), self.fetch_retries.to_string());
        map.insert(
            "step_timeout_secs".to_string(),
            self.step_timeout_secs.to_string(),
        );
        map.insert(
            "stale_after_secs".to_string(),
            self.stale_after_secs.to_string(),
        );
        map.insert(
            "default_pkg_managers".to_string(),
            self.default_pkg_managers
                .iter()
                .map(|e| e.tag())
                .collect::<Vec<_>>()
                .join(","),
        );
        map.insert("goproxy".to_string(), self.goproxy.clone());
        map.insert("pip_index_url".to_string(), self.pip_index_url.clone());
        map.insert(
            "npm_token".to_string(),
            if self.npm_token.is_some() { "set" } else { "unset" }.to_string(),
        );
        map.insert("log_level".to_string(), self.log_level.clone());

        map
    }
}

impl fmt::Display for VendorboxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Vendorbox Configuration:")?;
        writeln!(f, "  Sources Dir: {}", self.sources_dir.display())?;
        writeln!(f, "  Bundles Dir: {}", self.bundles_dir.display())?;
        writeln!(f, "  Work Dir: {}", self.work_dir.display())?;
        writeln!(f, "  Workers: {}", self.workers)?;
        writeln!(f, "  Fetch Retries: {}", self.fetch_retries)?;
        writeln!(f, "  Step Timeout: {}s", self.step_timeout_secs)?;
        writeln!(f, "  Stale After: {}s", self.stale_after_secs)?;
        let managers: Vec<&str> = self.default_pkg_managers.iter().map(|e| e.tag()).collect();
        writeln!(f, "  Default Package Managers: {}", managers.join(", "))?;
        writeln!(f, "  GOPROXY: {}", self.goproxy)?;
        writeln!(f, "  Pip Index: {}", self.pip_index_url)?;
        writeln!(
            f,
            "  npm Token: {}",
            if self.npm_token.is_some() { "set" } else { "unset" }
        )?;
        writeln!(f, "  Log Level: {}", self.log_level)?;
        Ok(())
    }
}
