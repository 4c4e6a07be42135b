//! Provides the typed view of the system configuration.
//!
//! The raw YAML document is maintained by [Config](crate::config::Config). Each time a document
//! is loaded, it is converted into [Settings]. If any value is invalid, the whole document is
//! rejected and the previous settings remain active.
//!
//! A complete **settings.yml** with all default values looks like this:
//! ```yaml
//! server:
//!     host: 0.0.0.0
//!     port: 3000
//! cache:
//!     capacity: 100
//!     ttl_ms: 60000
//! limiter:
//!     minute_capacity: 10
//!     burst_capacity: 5
//! coalescer:
//!     stale_ms: 30000
//! store:
//!     latency_ms: 200
//! maintenance:
//!     cache_sweep_ms: 30000
//!     limiter_sweep_ms: 60000
//!     coalescer_sweep_ms: 60000
//! ```
use anyhow::Context;
use yaml_rust::{Yaml, YamlLoader};

/// Contains all tunables of the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Contains the IP address the server binds to.
    pub host: String,
    /// Contains the port the server binds to.
    pub port: u16,
    /// Contains the max number of cached users.
    pub cache_capacity: usize,
    /// Contains the default TTL of cache entries in milliseconds.
    pub cache_ttl_ms: u64,
    /// Contains the number of requests a client may issue per minute.
    pub minute_capacity: u32,
    /// Contains the number of requests a client may issue per 10 seconds.
    pub burst_capacity: u32,
    /// Contains the age in milliseconds after which a pending fetch is reclaimed.
    pub stale_ms: u64,
    /// Contains the simulated latency of the store in milliseconds.
    pub store_latency_ms: u64,
    /// Contains the interval of the cache sweep in milliseconds.
    pub cache_sweep_ms: u64,
    /// Contains the interval of the limiter sweep in milliseconds.
    pub limiter_sweep_ms: u64,
    /// Contains the interval of the coalescer sweep in milliseconds.
    pub coalescer_sweep_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            host: "0.0.0.0".to_owned(),
            port: 3000,
            cache_capacity: 100,
            cache_ttl_ms: 60_000,
            minute_capacity: 10,
            burst_capacity: 5,
            stale_ms: 30_000,
            store_latency_ms: 200,
            cache_sweep_ms: 30_000,
            limiter_sweep_ms: 60_000,
            coalescer_sweep_ms: 60_000,
        }
    }
}

impl Settings {
    /// Extracts the settings from the given YAML document.
    ///
    /// Missing values are replaced by their defaults. Values which are present but invalid (not
    /// a positive integer, a port out of range, ...) yield an error.
    ///
    /// # Example
    /// ```
    /// # use userhub::settings::Settings;
    /// let settings = Settings::parse("
    /// server:
    ///     port: 1503
    /// cache:
    ///     capacity: 3
    /// ").unwrap();
    ///
    /// assert_eq!(settings.port, 1503);
    /// assert_eq!(settings.cache_capacity, 3);
    /// assert_eq!(settings.cache_ttl_ms, 60_000);
    ///
    /// assert!(Settings::parse("cache:\n    capacity: 0").is_err());
    /// ```
    pub fn from_yaml(doc: &Yaml) -> anyhow::Result<Settings> {
        let defaults = Settings::default();

        let port = read_positive(doc, "server", "port", defaults.port as u64)?;
        let port = u16::try_from(port).map_err(|_| {
            anyhow::anyhow!("Invalid value for server.port: {} is out of range", port)
        })?;

        let cache_capacity =
            read_positive(doc, "cache", "capacity", defaults.cache_capacity as u64)?;
        let cache_capacity = usize::try_from(cache_capacity)
            .context("Invalid value for cache.capacity: the value is too large")?;

        Ok(Settings {
            host: read_string(doc, "server", "host", &defaults.host)?,
            port,
            cache_capacity,
            cache_ttl_ms: read_positive(doc, "cache", "ttl_ms", defaults.cache_ttl_ms)?,
            minute_capacity: read_u32(doc, "limiter", "minute_capacity", defaults.minute_capacity)?,
            burst_capacity: read_u32(doc, "limiter", "burst_capacity", defaults.burst_capacity)?,
            stale_ms: read_positive(doc, "coalescer", "stale_ms", defaults.stale_ms)?,
            store_latency_ms: read_positive(doc, "store", "latency_ms", defaults.store_latency_ms)?,
            cache_sweep_ms: read_positive(
                doc,
                "maintenance",
                "cache_sweep_ms",
                defaults.cache_sweep_ms,
            )?,
            limiter_sweep_ms: read_positive(
                doc,
                "maintenance",
                "limiter_sweep_ms",
                defaults.limiter_sweep_ms,
            )?,
            coalescer_sweep_ms: read_positive(
                doc,
                "maintenance",
                "coalescer_sweep_ms",
                defaults.coalescer_sweep_ms,
            )?,
        })
    }

    /// Parses the given YAML string and extracts the settings.
    pub fn parse(data: &str) -> anyhow::Result<Settings> {
        let docs = YamlLoader::load_from_str(data).context("Cannot parse settings")?;
        Settings::from_yaml(docs.first().unwrap_or(&Yaml::Null))
    }

    /// Returns the address the server should bind to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn read_positive(doc: &Yaml, section: &str, key: &str, default: u64) -> anyhow::Result<u64> {
    match &doc[section][key] {
        Yaml::BadValue | Yaml::Null => Ok(default),
        Yaml::Integer(value) if *value >= 1 => Ok(*value as u64),
        other => Err(anyhow::anyhow!(
            "Invalid value for {}.{}: {:?} (a positive integer is required)",
            section,
            key,
            other
        )),
    }
}

fn read_u32(doc: &Yaml, section: &str, key: &str, default: u32) -> anyhow::Result<u32> {
    let value = read_positive(doc, section, key, default as u64)?;
    u32::try_from(value).map_err(|_| {
        anyhow::anyhow!(
            "Invalid value for {}.{}: {} is too large",
            section,
            key,
            value
        )
    })
}

fn read_string(doc: &Yaml, section: &str, key: &str, default: &str) -> anyhow::Result<String> {
    match &doc[section][key] {
        Yaml::BadValue | Yaml::Null => Ok(default.to_owned()),
        Yaml::String(value) if !value.trim().is_empty() => Ok(value.trim().to_owned()),
        other => Err(anyhow::anyhow!(
            "Invalid value for {}.{}: {:?} (a non-empty string is required)",
            section,
            key,
            other
        )),
    }
}
