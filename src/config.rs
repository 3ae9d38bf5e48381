//! Configuration loading.
//!
//! Configuration lives in `<home>/whack.json`. On first start the file is
//! written from the default bundled into the binary, so a fresh home
//! directory is usable after filling in the server details.
//!
//! # Environment Variables
//!
//! Applied on top of the file:
//!
//! - `WHACK_HOST` - server host
//! - `WHACK_PORT` - server component port
//! - `WHACK_DOMAIN` - server XMPP domain
//! - `WHACK_SECRET` - default shared secret
//! - `WHACK_CONNECT_TIMEOUT_MS` - connect timeout

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    COMPONENTS_DIR_NAME, CONFIG_FILE_NAME, DEFAULT_COMPONENT_PORT, DEFAULT_CONNECT_TIMEOUT_MS,
    DEFAULT_DELETE_RETRY_DELAY_MS, DEFAULT_DELETE_RETRY_LIMIT, DEFAULT_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_INITIAL_DELAY_MS, DEFAULT_RECONNECT_MAX_DELAY_MS, DEFAULT_SCAN_INTERVAL_SECS,
};
use crate::error::{Error, Result};
use crate::loader::LoaderOptions;
use crate::manager::{ComponentManager, ReconnectPolicy};

/// Default configuration written to a fresh home directory.
pub const DEFAULT_CONFIG: &str = include_str!("../conf/whack.json");

/// Top-level configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// XMPP server connection.
    pub server: ServerConfig,
    /// Per-subdomain settings.
    pub components: BTreeMap<String, ComponentConfig>,
    /// Component loader tuning.
    pub loader: LoaderConfig,
    /// Reconnection after a lost connection.
    pub reconnect: ReconnectConfig,
}

/// Where and how to reach the XMPP server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to connect to.
    pub host: String,
    /// Component port.
    pub port: u16,
    /// XMPP domain of the server; the host is used when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Secret used by subdomains without their own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_secret: Option<String>,
    /// How long to wait for the server while binding, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_COMPONENT_PORT,
            domain: None,
            default_secret: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ServerConfig {
    /// XMPP domain, falling back to the host.
    pub fn domain(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }
}

/// Settings for one subdomain.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ComponentConfig {
    /// Secret for this subdomain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Advertise support for multiple bindings of this subdomain.
    pub allow_multiple: bool,
}

/// Component loader settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LoaderConfig {
    /// Seconds between scan passes.
    pub scan_interval_secs: u64,
    /// Delete attempts per stale directory within one pass.
    pub delete_retry_limit: u32,
    /// Milliseconds between delete attempts.
    pub delete_retry_delay_ms: u64,
    /// Scan early on filesystem changes.
    pub watch: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            delete_retry_limit: DEFAULT_DELETE_RETRY_LIMIT,
            delete_retry_delay_ms: DEFAULT_DELETE_RETRY_DELAY_MS,
            watch: true,
        }
    }
}

/// Reconnection settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Attempts before giving up; zero disables reconnection.
    pub max_attempts: u32,
    /// Delay before the first attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap for the doubling delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            initial_delay_ms: DEFAULT_RECONNECT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
        }
    }
}

impl Config {
    /// Path of the configuration file inside `home`.
    pub fn path(home: &Path) -> PathBuf {
        home.join(CONFIG_FILE_NAME)
    }

    /// Components directory inside `home`.
    pub fn components_dir(home: &Path) -> PathBuf {
        home.join(COMPONENTS_DIR_NAME)
    }

    /// Load `<home>/whack.json`, creating it from the default if absent,
    /// then apply environment overrides.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the file cannot be created, read or parsed,
    /// or an override has an unparseable value.
    pub fn load(home: &Path) -> Result<Self> {
        let path = Self::path(home);
        if !path.exists() {
            fs::create_dir_all(home).map_err(|e| {
                Error::Config(format!("cannot create {}: {e}", home.display()))
            })?;
            fs::write(&path, DEFAULT_CONFIG).map_err(|e| {
                Error::Config(format!("cannot write {}: {e}", path.display()))
            })?;
            log::info!("Created default configuration at {}", path.display());
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config = Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse configuration JSON.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] on malformed JSON or mistyped fields.
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply overrides read through `var`.
    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = var("WHACK_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("WHACK_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| Error::Config(format!("WHACK_PORT={port}: {e}")))?;
        }
        if let Some(domain) = var("WHACK_DOMAIN") {
            self.server.domain = Some(domain);
        }
        if let Some(secret) = var("WHACK_SECRET") {
            self.server.default_secret = Some(secret);
        }
        if let Some(timeout) = var("WHACK_CONNECT_TIMEOUT_MS") {
            self.server.connect_timeout_ms = timeout
                .parse()
                .map_err(|e| Error::Config(format!("WHACK_CONNECT_TIMEOUT_MS={timeout}: {e}")))?;
        }
        Ok(())
    }

    /// A manager configured from this file.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the manager's runtime cannot be started.
    pub fn build_manager(&self) -> Result<std::sync::Arc<ComponentManager>> {
        let manager = ComponentManager::with_port(self.server.host.clone(), self.server.port)?;
        manager.set_server_name(self.server.domain());
        manager.set_connect_timeout(Duration::from_millis(self.server.connect_timeout_ms));
        if let Some(secret) = &self.server.default_secret {
            manager.set_default_secret_key(secret);
        }
        for (subdomain, component) in &self.components {
            if let Some(secret) = &component.secret {
                manager.set_secret_key(subdomain, secret);
            }
            manager.set_multiple_allowed(subdomain, component.allow_multiple);
        }
        manager.set_reconnect_policy(self.reconnect_policy());
        Ok(manager)
    }

    /// Reconnection policy from the `reconnect` section.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect.max_attempts,
            initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
        }
    }

    /// Loader options from the `loader` section.
    pub fn loader_options(&self) -> LoaderOptions {
        LoaderOptions {
            scan_interval: Duration::from_secs(self.loader.scan_interval_secs.max(1)),
            delete_retry_limit: self.loader.delete_retry_limit,
            delete_retry_delay: Duration::from_millis(self.loader.delete_retry_delay_ms),
            watch: self.loader.watch,
        }
    }
}
