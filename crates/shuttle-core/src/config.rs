//! Config - shuttle の設定
//!
//! TOML で読み、`Default` が標準値。期間はすべてミリ秒（`*_ms`）で書く。
//!
//! ```toml
//! [store]
//! root = "/var/lib/shuttle"
//!
//! [poll]
//! interval_ms = 2000
//!
//! [sweeper]
//! max_attempts = 3
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{BackoffPolicy, TransportMode};

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Errors while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("invalid config `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuttleConfig {
    pub store: StoreConfig,
    pub poll: PollConfig,
    pub push: PushConfig,
    pub hybrid: HybridConfig,
    pub heartbeat: HeartbeatConfig,
    pub sweeper: SweeperConfig,
    pub selector: SelectorConfig,
    pub coordinator: CoordinatorConfig,
}

/// `root` が無ければ in-memory store で動く。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    /// Lifts the 1-5s bound on `interval_ms`. Tests and demos only.
    pub allow_fast_poll: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            allow_fast_poll: false,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub publish_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            publish_timeout_ms: 250,
            backoff_base_ms: 100,
            backoff_multiplier: 2.0,
            backoff_max_ms: 10_000,
        }
    }
}

impl PushConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            self.backoff_multiplier,
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    pub safety_interval_ms: u64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            safety_interval_ms: 45_000,
        }
    }
}

impl HybridConfig {
    pub fn safety_interval(&self) -> Duration {
        Duration::from_millis(self.safety_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// How often the reference worker beats.
    pub interval_ms: u64,
    /// Where the monitor snapshot is persisted. Defaults to
    /// `<store.root>/heartbeats.json` when the store is on disk.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            snapshot_path: None,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_ms: u64,
    pub stale_processing_ms: u64,
    pub liveness_timeout_ms: u64,
    pub stale_queued_ms: u64,
    /// 放置された task を再配送する回数の上限。0 なら最初の回収で dead letter
    pub max_attempts: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            stale_processing_ms: 10 * 60 * 1_000,
            liveness_timeout_ms: 30_000,
            stale_queued_ms: 60 * 60 * 1_000,
            max_attempts: 3,
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stale_processing(&self) -> Duration {
        Duration::from_millis(self.stale_processing_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn stale_queued(&self) -> Duration {
        Duration::from_millis(self.stale_queued_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub evaluation_interval_ms: u64,
    pub window_ms: u64,
    pub latency_threshold_ms: f64,
    pub rate_threshold_per_min: f64,
    pub depth_threshold: u32,
    /// Pinned modes by worker name, applied at startup.
    pub overrides: BTreeMap<String, TransportMode>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: 15_000,
            window_ms: 5 * 60 * 1_000,
            latency_threshold_ms: 500.0,
            rate_threshold_per_min: 10.0,
            depth_threshold: 5,
            overrides: BTreeMap::new(),
        }
    }
}

impl SelectorConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub await_poll_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            await_poll_interval_ms: 500,
        }
    }
}

impl CoordinatorConfig {
    pub fn await_poll_interval(&self) -> Duration {
        Duration::from_millis(self.await_poll_interval_ms)
    }
}

impl ShuttleConfig {
    /// Read a TOML file. Missing sections and keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `SHUTTLE_ROOT`, `SHUTTLE_POLL_INTERVAL_MS` and
    /// `SHUTTLE_MAX_ATTEMPTS` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    pub(crate) fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(root) = lookup("SHUTTLE_ROOT") {
            self.store.root = Some(PathBuf::from(root));
        }
        if let Some(value) = lookup("SHUTTLE_POLL_INTERVAL_MS") {
            self.poll.interval_ms = parse_env("SHUTTLE_POLL_INTERVAL_MS", value)?;
        }
        if let Some(value) = lookup("SHUTTLE_MAX_ATTEMPTS") {
            self.sweeper.max_attempts = parse_env("SHUTTLE_MAX_ATTEMPTS", value)?;
        }
        Ok(())
    }

    /// Fail-fast checks run by the runtime builder.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let poll = self.poll.interval();
        if poll.is_zero() {
            return Err(invalid("poll.interval_ms", "must be positive"));
        }
        if !self.poll.allow_fast_poll && !(MIN_POLL_INTERVAL..=MAX_POLL_INTERVAL).contains(&poll) {
            return Err(invalid(
                "poll.interval_ms",
                format!("{} is outside 1000..=5000", self.poll.interval_ms),
            ));
        }
        if self.hybrid.safety_interval() <= poll {
            return Err(invalid(
                "hybrid.safety_interval_ms",
                "must be longer than poll.interval_ms",
            ));
        }
        let positive: [(&'static str, u64); 9] = [
            ("push.publish_timeout_ms", self.push.publish_timeout_ms),
            ("push.backoff_base_ms", self.push.backoff_base_ms),
            ("heartbeat.interval_ms", self.heartbeat.interval_ms),
            ("sweeper.interval_ms", self.sweeper.interval_ms),
            ("sweeper.stale_processing_ms", self.sweeper.stale_processing_ms),
            ("sweeper.liveness_timeout_ms", self.sweeper.liveness_timeout_ms),
            ("sweeper.stale_queued_ms", self.sweeper.stale_queued_ms),
            ("selector.evaluation_interval_ms", self.selector.evaluation_interval_ms),
            ("coordinator.await_poll_interval_ms", self.coordinator.await_poll_interval_ms),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(invalid(*field, "must be positive"));
        }
        if self.push.backoff_max_ms < self.push.backoff_base_ms {
            return Err(invalid("push.backoff_max_ms", "must be >= push.backoff_base_ms"));
        }
        if self.push.backoff_multiplier < 1.0 {
            return Err(invalid("push.backoff_multiplier", "must be >= 1.0"));
        }
        if self.selector.window_ms == 0 {
            return Err(invalid("selector.window_ms", "must be positive"));
        }
        if !(self.selector.latency_threshold_ms > 0.0) {
            return Err(invalid("selector.latency_threshold_ms", "must be positive"));
        }
        if !(self.selector.rate_threshold_per_min > 0.0) {
            return Err(invalid("selector.rate_threshold_per_min", "must be positive"));
        }
        Ok(())
    }

    /// Explicit `heartbeat.snapshot_path`, else `<store.root>/heartbeats.json`.
    pub fn heartbeat_snapshot_path(&self) -> Option<PathBuf> {
        self.heartbeat
            .snapshot_path
            .clone()
            .or_else(|| self.store.root.as_ref().map(|root| root.join("heartbeats.json")))
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}
