//! Configuration structures and parsing for blockroute.
//!
//! Every value has a default, so the configuration file is optional. Command
//! line flags are applied on top of whatever the file provides.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            registry: RegistryConfig::default(),
            resolver: ResolverConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

/// Where the domain blocklist is published
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Registry endpoint returning a JSON array of domain names
    #[serde(default = "default_registry_url")]
    pub url: String,
}

fn default_registry_url() -> String {
    "https://reestr.rublacklist.net/api/v3/domains/".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
        }
    }
}

/// Upstream resolvers, bootstrap servers and worker pool sizing
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// Number of concurrent resolution workers (default: 100)
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-upstream query timeout, given in (fractional) seconds (default: 5)
    #[serde(default = "default_timeout", deserialize_with = "deserialize_timeout")]
    pub timeout: Duration,
    /// Plain DNS servers used only to resolve upstream hostnames
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap: Vec<String>,
    /// Upstream resolvers queried for every domain
    #[serde(default = "default_upstream_servers")]
    pub upstream: Vec<String>,
    /// HTTP method used for DoH upstreams
    #[serde(default)]
    pub doh_method: DohMethod,
}

pub fn default_workers() -> usize {
    100
}

pub fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

pub fn default_bootstrap_servers() -> Vec<String> {
    vec!["1.1.1.1".to_string(), "1.0.0.1".to_string()]
}

pub fn default_upstream_servers() -> Vec<String> {
    vec![
        "https://1.1.1.1/dns-query".to_string(),
        "https://1.0.0.1/dns-query".to_string(),
    ]
}

/// Deserialize a timeout given as a number of seconds
fn deserialize_timeout<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    parse_timeout_secs(secs).map_err(serde::de::Error::custom)
}

/// Convert seconds into a timeout, rejecting zero, negative and non-finite values
pub fn parse_timeout_secs(secs: f64) -> std::result::Result<Duration, String> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("timeout must be a positive number of seconds, got {}", secs));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid timeout {}: {}", secs, e))
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            timeout: default_timeout(),
            bootstrap: default_bootstrap_servers(),
            upstream: default_upstream_servers(),
            doh_method: DohMethod::default(),
        }
    }
}

impl ResolverConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_bootstrap(mut self, servers: Vec<String>) -> Self {
        self.bootstrap = servers;
        self
    }

    pub fn with_upstream(mut self, servers: Vec<String>) -> Self {
        self.upstream = servers;
        self
    }

    pub fn with_doh_method(mut self, method: DohMethod) -> Self {
        self.doh_method = method;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            anyhow::bail!("resolver.workers must be at least 1");
        }
        if self.timeout.is_zero() {
            anyhow::bail!("resolver.timeout must be greater than zero");
        }
        if self.upstream.is_empty() {
            anyhow::bail!("resolver.upstream must list at least one server");
        }
        Ok(())
    }
}

/// DoH request style (RFC 8484 allows both)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DohMethod {
    /// Wire-format body with `Content-Type: application/dns-message`
    #[default]
    Post,
    /// Base64url-encoded message in the `dns` query parameter
    Get,
}

/// Presentation settings
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Gateway used in generated route commands
    #[serde(default = "default_gateway")]
    pub gateway: Ipv4Addr,
}

fn default_gateway() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 0, 1)
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            gateway: default_gateway(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse TOML config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.registry.url.trim().is_empty() {
            anyhow::bail!("registry.url cannot be empty");
        }
        reqwest::Url::parse(&self.registry.url)
            .with_context(|| format!("Invalid registry URL '{}'", self.registry.url))?;

        self.resolver.validate()
    }
}
