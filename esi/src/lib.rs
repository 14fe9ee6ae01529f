mod cache;

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use hashbrown::HashMap;
use humansize::{DECIMAL, format_size};
use itertools::Itertools;
use log::{debug, info, warn};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::TieredCache;

const DEFAULT_BASE_URL: &str = "https://esi.evetech.net/latest";
const NAME_CHUNK_SIZE: usize = 1000;
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error, Diagnostic)]
pub enum EsiError {
    #[error("error building ESI request")]
    RequestBuild(#[source] reqwest::Error),

    #[error("error executing ESI request")]
    RequestExecute(#[source] reqwest::Error),

    #[error("error deserializing ESI response")]
    Decode(#[source] reqwest::Error),

    #[error("ESI rejected the request as unauthorized")]
    Unauthorized,

    #[error("ESI entity does not exist")]
    NotFound,

    #[error("ESI returned HTTP status {status}")]
    UpstreamHttp { status: u16 },

    #[error("the ESI error budget is exhausted; calls are suspended")]
    ErrorLimited,
}

impl EsiError {
    /// True for failures worth retrying later: rate limiting, server-side
    /// errors, and transport problems. Unauthorized and not-found are not
    /// transient.
    pub fn is_transient(&self) -> bool {
        match self {
            EsiError::ErrorLimited | EsiError::RequestExecute(_) => true,
            EsiError::UpstreamHttp { status } => *status == 429 || *status >= 500,
            EsiError::RequestBuild(_) | EsiError::Decode(_) => false,
            EsiError::Unauthorized | EsiError::NotFound => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameCategory {
    Alliance,
    Character,
    Constellation,
    Corporation,
    Faction,
    InventoryType,
    Region,
    SolarSystem,
    Station,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameEntry {
    pub name: String,
    pub category: NameCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub system_id: i64,
    pub name: String,
    pub security_status: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CharacterInfo {
    pub name: String,
    pub corporation_id: i64,
    pub alliance_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorporationInfo {
    pub name: String,
    pub ticker: String,
    pub alliance_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllianceInfo {
    pub name: String,
    pub ticker: String,
}

/// Bulk ID-to-name resolution. The one capability the name enricher needs.
pub trait NameResolver {
    fn resolve_names(
        &self,
        ids: &[i64],
    ) -> impl Future<Output = Result<HashMap<i64, NameEntry>, EsiError>> + Send;
}

/// Single-entity fetches against the upstream game API.
pub trait EntityFetcher {
    fn get_character(
        &self,
        id: i64,
    ) -> impl Future<Output = Result<CharacterInfo, EsiError>> + Send;

    fn get_corporation(
        &self,
        id: i64,
    ) -> impl Future<Output = Result<CorporationInfo, EsiError>> + Send;

    fn get_alliance(
        &self,
        id: i64,
    ) -> impl Future<Output = Result<AllianceInfo, EsiError>> + Send;

    fn get_system(&self, id: i64) -> impl Future<Output = Result<SystemInfo, EsiError>> + Send;

    fn get_killmail(
        &self,
        id: i64,
        hash: &str,
    ) -> impl Future<Output = Result<serde_json::Value, EsiError>> + Send;
}

// Each 429 spends budget, each success earns it back up to the cap. At zero
// outbound calls are suspended for a cooldown window; the upstream error
// window is per-minute, so after it passes the budget reopens just enough to
// let successes refill it.
struct ErrorBudget {
    remaining: AtomicI32,
    cap: i32,
    resume_at: std::sync::Mutex<Option<chrono::DateTime<Utc>>>,
}

const BUDGET_COOLDOWN: TimeDelta = TimeDelta::seconds(60);

impl ErrorBudget {
    fn new(cap: i32) -> Self {
        Self {
            remaining: AtomicI32::new(cap),
            cap,
            resume_at: std::sync::Mutex::new(None),
        }
    }

    fn check(&self, now: chrono::DateTime<Utc>) -> Result<(), EsiError> {
        if self.remaining.load(Ordering::Relaxed) > 0 {
            return Ok(());
        }

        let mut resume_at = self
            .resume_at
            .lock()
            .expect("budget lock should not be poisoned");
        match *resume_at {
            Some(at) if now >= at => {
                self.remaining.store(1, Ordering::Relaxed);
                *resume_at = None;
                Ok(())
            }
            Some(_) => Err(EsiError::ErrorLimited),
            None => {
                *resume_at = Some(now + BUDGET_COOLDOWN);
                Err(EsiError::ErrorLimited)
            }
        }
    }

    fn record_error(&self) {
        self.remaining.fetch_sub(1, Ordering::Relaxed);
    }

    fn record_success(&self) {
        let cap = self.cap;
        let _ = self
            .remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (current < cap).then_some(current + 1)
            });
    }
}

pub struct EsiConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub error_budget: i32,
    /// Location of the shared cache tier. None disables the tier; the
    /// in-process tier is always active.
    pub cache_path: Option<PathBuf>,
}

impl Default for EsiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: concat!("battlelog/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_seconds: 10,
            error_budget: 100,
            cache_path: None,
        }
    }
}

pub struct EsiClient {
    client: reqwest::Client,
    base_url: String,
    budget: ErrorBudget,
    names: TieredCache<NameEntry>,
    systems: TieredCache<SystemInfo>,
}

impl EsiClient {
    pub fn new(config: EsiConfig) -> Result<Self, EsiError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(EsiError::RequestBuild)?;

        let shared = config.cache_path.as_ref().and_then(|path| {
            match sled::open(path) {
                Ok(db) => {
                    match db.size_on_disk() {
                        Ok(size) => info!(
                            "Opened {} shared ESI cache at {path:?}",
                            format_size(size, DECIMAL),
                        ),
                        Err(_) => info!("Opened shared ESI cache at {path:?}"),
                    }
                    Some(db)
                }
                Err(err) => {
                    // The shared tier is an optimization; losing it is not.
                    warn!("Could not open shared ESI cache at {path:?}: {err}");
                    None
                }
            }
        });

        Ok(Self {
            client,
            base_url: config.base_url,
            budget: ErrorBudget::new(config.error_budget),
            names: TieredCache::new(
                "name",
                shared.clone(),
                TimeDelta::hours(24),
                TimeDelta::minutes(5),
                16384,
            ),
            systems: TieredCache::new(
                "system",
                shared,
                TimeDelta::hours(24),
                TimeDelta::minutes(5),
                8192,
            ),
        })
    }

    async fn execute_with_retries(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, EsiError> {
        for attempt in 0..MAX_ATTEMPTS {
            self.budget.check(Utc::now())?;

            let request = build().build().map_err(EsiError::RequestBuild)?;
            let response = self
                .client
                .execute(request)
                .await
                .map_err(EsiError::RequestExecute)?;

            let status = response.status().as_u16();
            match status {
                200..=299 => {
                    self.budget.record_success();
                    return Ok(response);
                }
                401 | 403 => return Err(EsiError::Unauthorized),
                404 => return Err(EsiError::NotFound),
                // 420 is the upstream's error-limited status; treat it like
                // a plain 429.
                429 | 420 => {
                    self.budget.record_error();
                    if attempt + 1 < MAX_ATTEMPTS {
                        let backoff = Duration::from_secs(1 << attempt);
                        debug!("ESI rate limited; retrying in {backoff:?}");
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    return Err(EsiError::UpstreamHttp { status });
                }
                _ => return Err(EsiError::UpstreamHttp { status }),
            }
        }

        Err(EsiError::ErrorLimited)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, EsiError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .execute_with_retries(|| self.client.get(&url))
            .await?;
        response.json().await.map_err(EsiError::Decode)
    }

    async fn resolve_uncached_names(
        &self,
        ids: &[i64],
    ) -> Result<Vec<(i64, NameEntry)>, EsiError> {
        #[derive(Deserialize)]
        struct ResolvedName {
            id: i64,
            name: String,
            category: NameCategory,
        }

        let url = format!("{}/universe/names", self.base_url);
        let mut resolved = Vec::with_capacity(ids.len());

        for chunk in ids.chunks(NAME_CHUNK_SIZE) {
            let response = self
                .execute_with_retries(|| self.client.post(&url).json(&chunk))
                .await?;
            let entries: Vec<ResolvedName> = response.json().await.map_err(EsiError::Decode)?;
            resolved.extend(entries.into_iter().map(|entry| {
                (
                    entry.id,
                    NameEntry {
                        name: entry.name,
                        category: entry.category,
                    },
                )
            }));
        }

        Ok(resolved)
    }

    /// Shared-tier failure count across both caches, for operational
    /// logging.
    pub fn cache_failures(&self) -> u64 {
        self.names.shared_failures() + self.systems.shared_failures()
    }
}

impl NameResolver for EsiClient {
    async fn resolve_names(&self, ids: &[i64]) -> Result<HashMap<i64, NameEntry>, EsiError> {
        let now = Utc::now();
        let wanted = sanitize_ids(ids);

        let mut resolved: HashMap<i64, NameEntry> = HashMap::with_capacity(wanted.len());
        let mut missing = Vec::new();
        for id in wanted {
            match self.names.get(id, now) {
                Some(entry) => {
                    resolved.insert(id, entry);
                }
                None => missing.push(id),
            }
        }

        if !missing.is_empty() {
            for (id, entry) in self.resolve_uncached_names(&missing).await? {
                self.names.put(id, &entry, now);
                resolved.insert(id, entry);
            }
        }

        Ok(resolved)
    }
}

impl EntityFetcher for EsiClient {
    async fn get_character(&self, id: i64) -> Result<CharacterInfo, EsiError> {
        self.get_json(&format!("/characters/{id}/")).await
    }

    async fn get_corporation(&self, id: i64) -> Result<CorporationInfo, EsiError> {
        self.get_json(&format!("/corporations/{id}/")).await
    }

    async fn get_alliance(&self, id: i64) -> Result<AllianceInfo, EsiError> {
        self.get_json(&format!("/alliances/{id}/")).await
    }

    async fn get_system(&self, id: i64) -> Result<SystemInfo, EsiError> {
        let now = Utc::now();
        if let Some(info) = self.systems.get(id, now) {
            return Ok(info);
        }

        #[derive(Deserialize)]
        struct RawSystem {
            system_id: i64,
            name: String,
            security_status: f64,
        }

        let raw: RawSystem = self.get_json(&format!("/universe/systems/{id}/")).await?;
        let info = SystemInfo {
            system_id: raw.system_id,
            name: raw.name,
            security_status: raw.security_status,
        };
        self.systems.put(id, &info, now);
        Ok(info)
    }

    async fn get_killmail(&self, id: i64, hash: &str) -> Result<serde_json::Value, EsiError> {
        self.get_json(&format!("/killmails/{id}/{hash}/")).await
    }
}

// Drop non-positive IDs and deduplicate preserving first-seen order.
fn sanitize_ids(ids: &[i64]) -> Vec<i64> {
    ids.iter()
        .copied()
        .filter(|id| *id > 0)
        .unique()
        .collect_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_filters_and_dedups_preserving_order() {
        assert_eq!(sanitize_ids(&[3, -1, 0, 2, 3, 2, 7]), vec![3, 2, 7]);
    }

    #[test]
    fn sanitize_of_nothing_is_empty() {
        assert!(sanitize_ids(&[]).is_empty());
        assert!(sanitize_ids(&[0, -5]).is_empty());
    }

    #[test]
    fn error_budget_decrements_and_refills_to_cap() {
        let now = Utc::now();
        let budget = ErrorBudget::new(2);
        assert!(budget.check(now).is_ok());

        budget.record_error();
        budget.record_error();
        assert!(budget.check(now).is_err());

        budget.record_success();
        budget.record_success();
        assert!(budget.check(now).is_ok());

        // Refill never exceeds the cap.
        budget.record_success();
        budget.record_success();
        budget.record_success();
        assert_eq!(budget.remaining.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn exhausted_budget_reopens_after_the_cooldown() {
        let now = Utc::now();
        let budget = ErrorBudget::new(1);
        budget.record_error();

        assert!(budget.check(now).is_err());
        assert!(budget.check(now + BUDGET_COOLDOWN).is_ok());
    }

    #[test]
    fn transient_classification() {
        assert!(EsiError::ErrorLimited.is_transient());
        assert!(EsiError::UpstreamHttp { status: 429 }.is_transient());
        assert!(EsiError::UpstreamHttp { status: 502 }.is_transient());
        assert!(!EsiError::UpstreamHttp { status: 418 }.is_transient());
        assert!(!EsiError::Unauthorized.is_transient());
        assert!(!EsiError::NotFound.is_transient());
    }

    #[test]
    fn name_categories_deserialize_from_esi_strings() {
        let entry: NameEntry =
            serde_json::from_str(r#"{"name":"Jita","category":"solar_system"}"#).unwrap();
        assert_eq!(entry.category, NameCategory::SolarSystem);

        let entry: NameEntry =
            serde_json::from_str(r#"{"name":"?","category":"something_new"}"#).unwrap();
        assert_eq!(entry.category, NameCategory::Unknown);
    }
}
