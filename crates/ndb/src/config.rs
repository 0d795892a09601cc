//! Database configuration.
//!
//! ```ignore
//! use ndb::config::NdbConfig;
//!
//! let config = NdbConfig::from_json(r#"{
//!     "localhost": "host0",
//!     "gc_interval": 30,
//!     "sources": [{"target": "host0", "kind": "local"}]
//! }"#)?;
//! ```
//!
//! Durations are given in (fractional) seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::source::SourceSpec;

/// Serde helper: a [`Duration`] as fractional seconds.
pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Tuning of the apply loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Confirmation polls before falling back to a resync.
    pub attempts: u32,
    /// Full resyncs before giving up.
    pub resync_attempts: u32,
    /// Wait growth per attempt.
    #[serde(with = "secs")]
    pub wait_step: Duration,
    /// Cap of the per-attempt wait (before queue pressure).
    #[serde(with = "secs")]
    pub wait_max: Duration,
    /// Queued messages per second of extra wait.
    pub queue_divisor: u32,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            resync_attempts: 3,
            wait_step: Duration::from_millis(100),
            wait_max: Duration::from_secs(1),
            queue_divisor: 10,
        }
    }
}

impl ApplyConfig {
    /// Wait before confirmation attempt `attempt`:
    /// `max(min(attempt * step, max), depth / divisor seconds)`.
    pub fn wait_time(&self, attempt: u32, queue_depth: usize) -> Duration {
        let grow = (self.wait_step * attempt).min(self.wait_max);
        let pressure = Duration::from_secs_f64(queue_depth as f64 / self.queue_divisor.max(1) as f64);
        grow.max(pressure)
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NdbConfig {
    /// Name of the local target.
    pub localhost: String,
    /// Sources started with the database. Empty means one local source.
    pub sources: Vec<SourceSpec>,
    /// Queue capacity in messages.
    pub queue_capacity: usize,
    /// Garbage collection period.
    #[serde(with = "secs")]
    pub gc_interval: Duration,
    /// Idle time before an unreferenced cached object is dropped.
    #[serde(with = "secs")]
    pub cache_expire: Duration,
    /// Age of a route GC mark before the route is purged.
    #[serde(with = "secs")]
    pub route_gc_grace: Duration,
    /// How long a source may take to connect and load its dump.
    #[serde(with = "secs")]
    pub start_timeout: Duration,
    /// How long callers wait on a closed read or write gate.
    #[serde(with = "secs")]
    pub gate_timeout: Duration,
    /// Flush each source's rows on shutdown.
    pub db_cleanup: bool,
    /// Keep a copy of every loaded event.
    pub rtnl_log: bool,
    /// Follow namespace events with namespace sources.
    pub auto_netns: bool,
    /// Apply loop tuning.
    pub apply: ApplyConfig,
}

impl Default for NdbConfig {
    fn default() -> Self {
        Self {
            localhost: "localhost".into(),
            sources: Vec::new(),
            queue_capacity: 100,
            gc_interval: Duration::from_secs(60),
            cache_expire: Duration::from_secs(30),
            route_gc_grace: Duration::from_secs(5),
            start_timeout: Duration::from_secs(30),
            gate_timeout: Duration::from_secs(30),
            db_cleanup: true,
            rtnl_log: false,
            auto_netns: false,
            apply: ApplyConfig::default(),
        }
    }
}

impl NdbConfig {
    /// Parse a JSON configuration. Missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Render the configuration as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceKind;

    #[test]
    fn test_defaults() {
        let config = NdbConfig::from_json("{}").unwrap();
        assert_eq!(config.localhost, "localhost");
        assert_eq!(config.queue_capacity, 100);
        assert!(config.db_cleanup);
        assert_eq!(config.apply, ApplyConfig::default());
    }

    #[test]
    fn test_from_json() {
        let config = NdbConfig::from_json(
            r#"{
                "localhost": "host0",
                "gc_interval": 0.5,
                "apply": {"attempts": 4},
                "sources": [
                    {"target": "host0"},
                    {"target": "ns1", "kind": "netns", "netns": "ns1", "persistent": false}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.gc_interval, Duration::from_millis(500));
        assert_eq!(config.apply.attempts, 4);
        assert_eq!(config.apply.resync_attempts, 3);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].kind, SourceKind::Local);
        assert!(config.sources[0].persistent);
        assert_eq!(config.sources[1].netns.as_deref(), Some("ns1"));
        assert!(!config.sources[1].persistent);
    }

    #[test]
    fn test_wait_time() {
        let apply = ApplyConfig::default();
        assert_eq!(apply.wait_time(0, 0), Duration::ZERO);
        assert_eq!(apply.wait_time(3, 0), Duration::from_millis(300));
        assert_eq!(apply.wait_time(20, 0), Duration::from_secs(1));
        // Queue pressure wins over the cap.
        assert_eq!(apply.wait_time(20, 50), Duration::from_secs(5));
    }
}
