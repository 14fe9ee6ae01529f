use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Maximum span of a single battle.
    pub window_minutes: i64,
    /// Maximum silence between consecutive events inside one battle.
    pub gap_max_minutes: i64,
    /// Overrides the ruleset's min_pilots when set.
    pub min_kills: Option<u32>,
    /// Events younger than this are left for a later tick, so in-flight
    /// enrichment and late arrivals don't race the clusterer.
    pub delay_minutes: i64,
    pub batch_size: i64,
    pub interval_ms: u64,
    pub transaction_timeout_seconds: i64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            window_minutes: 60,
            gap_max_minutes: 20,
            min_kills: None,
            delay_minutes: 30,
            batch_size: 500,
            interval_ms: 5_000,
            transaction_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IngestConfig {
    pub user_agent: String,
    pub redisq_base_url: String,
    /// Distinct per replica; replicas sharing a queue identity split one
    /// logical stream into under-loaded shards.
    pub redisq_queue_id: Option<String>,
    pub redisq_ttw_seconds: u32,
    pub esi_base_url: String,
    pub esi_cache_path: Option<PathBuf>,
    pub esi_error_budget: i32,
    pub esi_timeout_seconds: u64,
    pub enrich_workers: usize,
    pub enrich_backoff_base_seconds: i64,
    pub resweep_seconds: i64,
    pub sweep_batch_size: i64,
    pub work_queue_capacity: usize,
    pub store_retry_window_seconds: u64,
    pub stats_interval_seconds: i64,
    pub cluster: ClusterConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("battlelog/", env!("CARGO_PKG_VERSION")).to_string(),
            redisq_base_url: "https://zkillredisq.stream/listen.php".to_string(),
            redisq_queue_id: None,
            redisq_ttw_seconds: 10,
            esi_base_url: "https://esi.evetech.net/latest".to_string(),
            esi_cache_path: None,
            esi_error_budget: 100,
            esi_timeout_seconds: 10,
            enrich_workers: 2,
            enrich_backoff_base_seconds: 30,
            resweep_seconds: 300,
            sweep_batch_size: 1000,
            work_queue_capacity: 1024,
            store_retry_window_seconds: 60,
            stats_interval_seconds: 60,
            cluster: Default::default(),
        }
    }
}

impl IngestConfig {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("BATTLELOG.toml"))
            .merge(Env::prefixed("BATTLELOG_"))
    }

    pub fn config() -> figment::Result<Self> {
        Self::figment().extract()
    }
}
