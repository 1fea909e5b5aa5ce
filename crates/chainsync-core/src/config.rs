//! Engine configuration, loaded from YAML with environment overrides.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::checkpoint::PersistPolicy;
use crate::error::SyncError;
use crate::failure::FailureConfig;
use crate::scheduler::SchedulerConfig;

pub const ENV_DATABASE_URL: &str = "CHAINSYNC_DATABASE_URL";
pub const ENV_START_BLOCK: &str = "CHAINSYNC_START_BLOCK";
pub const ENV_RPC_URLS: &str = "CHAINSYNC_RPC_URLS";

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainSyncConfig {
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub failure: FailureSection,
    #[serde(default)]
    pub rpc: RpcSection,
    #[serde(default)]
    pub contracts: ContractsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Signing credentials for external tooling. The indexer never reads it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<WalletConfig>,
}

// ─── indexer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Key of the persisted state row.
    #[serde(default = "default_indexer_id")]
    pub id: String,
    #[serde(default = "default_chain")]
    pub chain: String,
    /// Used only when no state exists yet. Absent means "recent".
    #[serde(default)]
    pub start_block: Option<u64>,
    /// Blocks behind the safe head to begin at for a "recent" start.
    #[serde(default)]
    pub recent_lookback: u64,
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,
    #[serde(default = "default_steady_batch_size")]
    pub steady_batch_size: u64,
    #[serde(default = "default_medium_batch_size")]
    pub medium_batch_size: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u64,
    #[serde(default = "default_medium_lag_threshold")]
    pub medium_lag_threshold: u64,
    #[serde(default = "default_large_lag_threshold")]
    pub large_lag_threshold: u64,
    /// Widest block span of a single `eth_getLogs` call.
    #[serde(default = "default_max_logs_range")]
    pub max_logs_range: u64,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_idle_delay_ms")]
    pub idle_delay_ms: u64,
    #[serde(default = "default_slow_batch_threshold_ms")]
    pub slow_batch_threshold_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_checkpoint_block_interval")]
    pub checkpoint_block_interval: u64,
    /// 0 persists every batch. Otherwise empty batches are persisted only
    /// when their range crosses a multiple of this value.
    #[serde(default)]
    pub empty_batch_persist_interval: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
}

fn default_indexer_id() -> String { "main".into() }
fn default_chain() -> String { "ethereum".into() }
fn default_confirmation_depth() -> u64 { 12 }
fn default_steady_batch_size() -> u64 { 100 }
fn default_medium_batch_size() -> u64 { 500 }
fn default_max_batch_size() -> u64 { 2_000 }
fn default_medium_lag_threshold() -> u64 { 1_000 }
fn default_large_lag_threshold() -> u64 { 10_000 }
fn default_max_logs_range() -> u64 { 2_000 }
fn default_base_delay_ms() -> u64 { 1_000 }
fn default_idle_delay_ms() -> u64 { 3_000 }
fn default_slow_batch_threshold_ms() -> u64 { 5_000 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_checkpoint_block_interval() -> u64 { 100 }
fn default_health_interval_secs() -> u64 { 30 }

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            id: default_indexer_id(),
            chain: default_chain(),
            start_block: None,
            recent_lookback: 0,
            confirmation_depth: default_confirmation_depth(),
            steady_batch_size: default_steady_batch_size(),
            medium_batch_size: default_medium_batch_size(),
            max_batch_size: default_max_batch_size(),
            medium_lag_threshold: default_medium_lag_threshold(),
            large_lag_threshold: default_large_lag_threshold(),
            max_logs_range: default_max_logs_range(),
            base_delay_ms: default_base_delay_ms(),
            idle_delay_ms: default_idle_delay_ms(),
            slow_batch_threshold_ms: default_slow_batch_threshold_ms(),
            max_delay_ms: default_max_delay_ms(),
            checkpoint_block_interval: default_checkpoint_block_interval(),
            empty_batch_persist_interval: 0,
            health_interval_secs: default_health_interval_secs(),
        }
    }
}

impl IndexerConfig {
    pub fn start_position(&self) -> StartPosition {
        match self.start_block {
            Some(h) => StartPosition::Height(h),
            None => StartPosition::Recent {
                lookback: self.recent_lookback,
            },
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            confirmation_depth: self.confirmation_depth,
            steady_batch_size: self.steady_batch_size,
            medium_batch_size: self.medium_batch_size,
            max_batch_size: self.max_batch_size,
            medium_lag_threshold: self.medium_lag_threshold,
            large_lag_threshold: self.large_lag_threshold,
            base_delay: Duration::from_millis(self.base_delay_ms),
            idle_delay: Duration::from_millis(self.idle_delay_ms),
            slow_batch_threshold: Duration::from_millis(self.slow_batch_threshold_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }
}

/// Where to begin when no state has been persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// First block to index.
    Height(u64),
    /// `head - confirmation_depth - lookback`.
    Recent { lookback: u64 },
}

impl StartPosition {
    /// The `last_indexed_block` to seed a fresh state with.
    pub fn seed_last_indexed(&self, head: u64, confirmation_depth: u64) -> u64 {
        match *self {
            Self::Height(h) => h.saturating_sub(1),
            Self::Recent { lookback } => head
                .saturating_sub(confirmation_depth)
                .saturating_sub(lookback),
        }
    }
}

// ─── failure ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSection {
    #[serde(default = "default_failover_threshold")]
    pub failover_threshold: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Capacity of the in-state error ring buffer.
    #[serde(default = "default_error_history")]
    pub error_history: usize,
}

fn default_failover_threshold() -> u32 { 15 }
fn default_base_backoff_ms() -> u64 { 1_000 }
fn default_max_backoff_ms() -> u64 { 30_000 }
fn default_error_history() -> usize { crate::state::DEFAULT_ERROR_HISTORY }

impl Default for FailureSection {
    fn default() -> Self {
        Self {
            failover_threshold: default_failover_threshold(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            error_history: default_error_history(),
        }
    }
}

impl FailureSection {
    pub fn controller(&self) -> FailureConfig {
        FailureConfig {
            failover_threshold: self.failover_threshold,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

// ─── rpc ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    /// Relative share of traffic.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 { 1 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSection {
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    /// Consecutive failures before an endpoint's circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_rpc_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_failure_threshold() -> u32 { 8 }
fn default_cooldown_secs() -> u64 { 15 }
fn default_request_timeout_secs() -> u64 { 30 }
fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 250 }
fn default_rpc_max_backoff_ms() -> u64 { 5_000 }

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            endpoints: vec![],
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_rpc_max_backoff_ms(),
        }
    }
}

// ─── contracts ────────────────────────────────────────────────────────────────

/// Contract addresses. An absent contract disables the families it emits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContractsConfig {
    #[serde(default)]
    pub pool_core: Option<String>,
    #[serde(default)]
    pub oddyssey: Option<String>,
    #[serde(default)]
    pub reputation: Option<String>,
}

// ─── storage ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

// ─── log / wallet ─────────────────────────────────────────────────────────────

/// Log level per component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: component_name → level
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// Emit JSON structured logs instead of text.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String { "info".into() }

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// Filter directives, e.g. `info,chainsync_rpc=debug`.
    pub fn directives(&self) -> String {
        let mut components: Vec<_> = self.components.iter().collect();
        components.sort();
        let mut directives = self.level.clone();
        for (component, level) in components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default, skip_serializing)]
    pub private_key: Option<String>,
}

// ─── loading ──────────────────────────────────────────────────────────────────

impl ChainSyncConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, SyncError> {
        serde_yaml::from_str(s).map_err(|e| SyncError::Config(format!("invalid config: {e}")))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml_str(&raw)
    }

    /// Apply `CHAINSYNC_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), SyncError> {
        let vars: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with("CHAINSYNC_"))
            .collect();
        self.apply_overrides(&vars)
    }

    /// Apply overrides from an explicit variable map.
    pub fn apply_overrides(&mut self, vars: &HashMap<String, String>) -> Result<(), SyncError> {
        if let Some(url) = vars.get(ENV_DATABASE_URL) {
            self.storage.url = Some(url.clone());
        }
        if let Some(raw) = vars.get(ENV_START_BLOCK) {
            let block = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| SyncError::Config(format!("{ENV_START_BLOCK}: not a block number: {raw}")))?;
            self.indexer.start_block = Some(block);
        }
        if let Some(raw) = vars.get(ENV_RPC_URLS) {
            self.rpc.endpoints = parse_endpoint_list(raw)?;
        }
        Ok(())
    }

    /// Reject configurations the engine cannot start with.
    pub fn validate(&self) -> Result<(), SyncError> {
        let fail = |msg: String| Err(SyncError::Config(msg));

        if self.rpc.endpoints.is_empty() {
            return fail("rpc.endpoints: at least one endpoint is required".into());
        }
        for ep in &self.rpc.endpoints {
            if ep.url.trim().is_empty() {
                return fail("rpc.endpoints: empty url".into());
            }
            if ep.weight == 0 {
                return fail(format!("rpc.endpoints: weight of {} must be positive", ep.url));
            }
        }
        if self.rpc.failure_threshold == 0 {
            return fail("rpc.failure_threshold must be positive".into());
        }

        let ix = &self.indexer;
        if ix.id.trim().is_empty() {
            return fail("indexer.id must not be empty".into());
        }
        if ix.steady_batch_size == 0 || ix.medium_batch_size == 0 || ix.max_batch_size == 0 {
            return fail("indexer batch sizes must be positive".into());
        }
        if ix.steady_batch_size > ix.medium_batch_size || ix.medium_batch_size > ix.max_batch_size {
            return fail(format!(
                "indexer batch sizes must be non-decreasing: {} / {} / {}",
                ix.steady_batch_size, ix.medium_batch_size, ix.max_batch_size
            ));
        }
        if ix.medium_lag_threshold >= ix.large_lag_threshold {
            return fail(format!(
                "indexer.medium_lag_threshold ({}) must be below large_lag_threshold ({})",
                ix.medium_lag_threshold, ix.large_lag_threshold
            ));
        }
        if ix.max_logs_range == 0 {
            return fail("indexer.max_logs_range must be positive".into());
        }

        if self.contracts.pool_core.is_none()
            && self.contracts.oddyssey.is_none()
            && self.contracts.reputation.is_none()
        {
            return fail("contracts: no contract addresses configured".into());
        }

        if self.failure.failover_threshold == 0 {
            return fail("failure.failover_threshold must be positive".into());
        }

        match self.storage.backend {
            StorageBackend::Memory => {}
            StorageBackend::Sqlite | StorageBackend::Postgres => {
                if self.storage.url.as_deref().map_or(true, |u| u.trim().is_empty()) {
                    return fail(format!(
                        "storage.url is required for the {:?} backend (or set {ENV_DATABASE_URL})",
                        self.storage.backend
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn persist_policy(&self) -> PersistPolicy {
        PersistPolicy {
            checkpoint_block_interval: self.indexer.checkpoint_block_interval,
            empty_batch_persist_interval: self.indexer.empty_batch_persist_interval,
            error_history: self.failure.error_history,
        }
    }
}

/// Parse `url[|weight],url[|weight],...`.
///
/// `|` cannot appear unescaped in a url, so query strings such as
/// `?key=abc` stay part of the url.
pub fn parse_endpoint_list(raw: &str) -> Result<Vec<EndpointConfig>, SyncError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| match item.split_once('|') {
            Some((url, weight)) => {
                let weight = weight.trim().parse::<u32>().map_err(|_| {
                    SyncError::Config(format!("{ENV_RPC_URLS}: bad weight in {item:?}"))
                })?;
                Ok(EndpointConfig {
                    url: url.trim().to_string(),
                    weight,
                })
            }
            None => Ok(EndpointConfig {
                url: item.to_string(),
                weight: default_weight(),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
indexer:
  id: mainnet
  start_block: 164000000
  confirmation_depth: 6
rpc:
  endpoints:
    - url: https://rpc-a.example
      weight: 3
    - url: https://rpc-b.example
contracts:
  pool_core: "0x1111111111111111111111111111111111111111"
storage:
  backend: sqlite
  url: "sqlite://chainsync.db"
log:
  level: debug
  components:
    chainsync-rpc: trace
wallet:
  address: "0xabc"
  private_key: "secret"
"#;

    #[test]
    fn parses_yaml_with_defaults() {
        let cfg = ChainSyncConfig::from_yaml_str(YAML).unwrap();
        assert_eq!(cfg.indexer.id, "mainnet");
        assert_eq!(cfg.indexer.start_block, Some(164_000_000));
        assert_eq!(cfg.indexer.confirmation_depth, 6);
        assert_eq!(cfg.indexer.steady_batch_size, 100);
        assert_eq!(cfg.indexer.large_lag_threshold, 10_000);
        assert_eq!(cfg.indexer.empty_batch_persist_interval, 0);
        assert_eq!(cfg.rpc.endpoints.len(), 2);
        assert_eq!(cfg.rpc.endpoints[0].weight, 3);
        assert_eq!(cfg.rpc.endpoints[1].weight, 1);
        assert_eq!(cfg.rpc.failure_threshold, 8);
        assert_eq!(cfg.rpc.cooldown_secs, 15);
        assert_eq!(cfg.failure.failover_threshold, 15);
        assert_eq!(cfg.storage.backend, StorageBackend::Sqlite);
        assert!(cfg.wallet.is_some());
        assert_eq!(cfg.log.directives(), "debug,chainsync_rpc=trace");
        cfg.validate().unwrap();
    }

    #[test]
    fn env_overrides() {
        let mut cfg = ChainSyncConfig::from_yaml_str(YAML).unwrap();
        let vars: HashMap<String, String> = [
            (ENV_START_BLOCK, "42"),
            (ENV_DATABASE_URL, "postgres://db/chainsync"),
            (ENV_RPC_URLS, "https://x.example|5, https://y.example"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        cfg.apply_overrides(&vars).unwrap();
        assert_eq!(cfg.indexer.start_block, Some(42));
        assert_eq!(cfg.storage.url.as_deref(), Some("postgres://db/chainsync"));
        assert_eq!(
            cfg.rpc.endpoints,
            vec![
                EndpointConfig { url: "https://x.example".into(), weight: 5 },
                EndpointConfig { url: "https://y.example".into(), weight: 1 },
            ]
        );

        let bad: HashMap<String, String> =
            [(ENV_START_BLOCK.to_string(), "soon".to_string())].into_iter().collect();
        assert!(matches!(cfg.apply_overrides(&bad), Err(SyncError::Config(_))));
    }

    #[test]
    fn endpoint_urls_keep_their_query_strings() {
        let endpoints = parse_endpoint_list(
            "https://rpc.example/v1?apikey=abc123|4,https://rpc.example/v1?apikey=7, https://plain.example",
        )
        .unwrap();
        assert_eq!(
            endpoints,
            vec![
                EndpointConfig { url: "https://rpc.example/v1?apikey=abc123".into(), weight: 4 },
                EndpointConfig { url: "https://rpc.example/v1?apikey=7".into(), weight: 1 },
                EndpointConfig { url: "https://plain.example".into(), weight: 1 },
            ]
        );
        assert!(matches!(
            parse_endpoint_list("https://rpc.example|heavy"),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn validation_failures() {
        let base = ChainSyncConfig::from_yaml_str(YAML).unwrap();

        let mut c = base.clone();
        c.rpc.endpoints.clear();
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.rpc.endpoints[0].weight = 0;
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.indexer.medium_batch_size = 5_000;
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.storage.url = None;
        assert!(c.validate().is_err());

        let mut c = base.clone();
        c.contracts = ContractsConfig::default();
        assert!(c.validate().is_err());

        let mut c = base;
        c.storage.backend = StorageBackend::Memory;
        c.storage.url = None;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn start_positions() {
        assert_eq!(StartPosition::Height(1_000).seed_last_indexed(5_000, 12), 999);
        assert_eq!(StartPosition::Height(0).seed_last_indexed(5_000, 12), 0);
        assert_eq!(
            StartPosition::Recent { lookback: 100 }.seed_last_indexed(5_000, 12),
            4_888
        );
        let ix = IndexerConfig::default();
        assert_eq!(ix.start_position(), StartPosition::Recent { lookback: 0 });
        assert_eq!(ix.scheduler(), SchedulerConfig::default());
    }
}
