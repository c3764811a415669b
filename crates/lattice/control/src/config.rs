//! Configuration for the reconciliation engine

use lattice_dispatch::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Engine identity and partitioning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Reconciliation loop tuning
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Command dispatch and retries
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Observed state projection
    #[serde(default)]
    pub projector: ProjectorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Engine identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Identity of this engine among its peers
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    #[serde(default)]
    pub partition: PartitionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            partition: PartitionConfig::default(),
        }
    }
}

/// How applications are split across cooperating engines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionMode {
    /// This engine owns every application
    #[default]
    Single,
    /// Hash ring over `peers`
    ConsistentHash,
    /// Ownership assigned from outside
    Static,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    #[serde(default)]
    pub mode: PartitionMode,

    /// Every engine instance id in the ring, this one included
    #[serde(default)]
    pub peers: Vec<String>,

    /// Virtual nodes per peer on the ring
    #[serde(default = "default_vnodes")]
    pub vnodes: u32,

    /// Initially owned applications in static mode
    #[serde(default)]
    pub owned: Vec<String>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            mode: PartitionMode::Single,
            peers: Vec::new(),
            vnodes: default_vnodes(),
            owned: Vec::new(),
        }
    }
}

/// Reconciliation loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Quiet period after an observed change before evaluating
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Most queued triggers folded into one cycle
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Periodic re-evaluation of every deployed application
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    /// Trigger queue depth per application
    #[serde(default = "default_actor_channel_capacity")]
    pub actor_channel_capacity: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_batch: default_max_batch(),
            resync_interval_secs: default_resync_interval(),
            actor_channel_capacity: default_actor_channel_capacity(),
        }
    }
}

impl ReconcileConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }
}

/// Command dispatch configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// How long settled and failed commands are remembered
    #[serde(default = "default_settle_ttl")]
    pub settle_ttl_ms: u64,

    /// Interval between timeout and retry sweeps
    #[serde(default = "default_reap_interval")]
    pub reap_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff(),
            max_backoff_ms: default_max_backoff(),
            ack_timeout_ms: default_ack_timeout(),
            settle_ttl_ms: default_settle_ttl(),
            reap_interval_ms: default_reap_interval(),
        }
    }
}

impl DispatchConfig {
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(1))
    }
}

impl From<&DispatchConfig> for RetryPolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            entry_ttl: Duration::from_millis(config.settle_ttl_ms),
        }
    }
}

/// Observed state configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectorConfig {
    /// Expected heartbeat interval of hosts
    #[serde(default = "default_host_interval")]
    pub host_interval_secs: u64,

    /// Missed intervals before a host is reaped
    #[serde(default = "default_expiry_intervals")]
    pub host_expiry_intervals: u32,

    /// Events kept per lattice before compaction
    #[serde(default = "default_event_log_limit")]
    pub event_log_limit: usize,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            host_interval_secs: default_host_interval(),
            host_expiry_intervals: default_expiry_intervals(),
            event_log_limit: default_event_log_limit(),
        }
    }
}

impl ProjectorConfig {
    pub fn host_interval(&self) -> Duration {
        Duration::from_secs(self.host_interval_secs.max(1))
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive, used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_instance_id() -> String {
    "engine-0".to_string()
}

fn default_vnodes() -> u32 {
    64
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_max_batch() -> usize {
    256
}

fn default_resync_interval() -> u64 {
    30
}

fn default_actor_channel_capacity() -> usize {
    64
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_ack_timeout() -> u64 {
    10_000
}

fn default_settle_ttl() -> u64 {
    60_000
}

fn default_reap_interval() -> u64 {
    1_000
}

fn default_host_interval() -> u64 {
    30
}

fn default_expiry_intervals() -> u32 {
    2
}

fn default_event_log_limit() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ControlConfig {
    /// Load configuration from defaults, an optional file and `LATTICE_*` variables
    ///
    /// Nested keys are separated by a double underscore, so
    /// `LATTICE_RECONCILE__DEBOUNCE_MS=100` sets `reconcile.debounce_ms`.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&ControlConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("LATTICE")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("engine.partition.peers")
                .with_list_parse_key("engine.partition.owned")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Short timings for tests and local development
    pub fn development() -> Self {
        Self {
            reconcile: ReconcileConfig {
                debounce_ms: 10,
                resync_interval_secs: 5,
                ..Default::default()
            },
            dispatch: DispatchConfig {
                base_backoff_ms: 50,
                max_backoff_ms: 1_000,
                ack_timeout_ms: 1_000,
                settle_ttl_ms: 5_000,
                reap_interval_ms: 100,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
