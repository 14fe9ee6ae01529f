use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use log::debug;
use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_BASE_URL: &str = "https://zkillredisq.stream/listen.php";
const KILL_URL_HOST: &str = "https://zkillboard.com";

#[derive(Debug, Error, Diagnostic)]
pub enum RedisqError {
    #[error("error building RedisQ request")]
    RequestBuild(#[source] reqwest::Error),

    #[error("error executing RedisQ request")]
    RequestExecute(#[source] reqwest::Error),

    #[error("RedisQ returned HTTP status {status}")]
    UpstreamHttp { status: u16 },

    #[error("error extracting RedisQ response body")]
    RequestBody(#[source] reqwest::Error),

    #[error("error deserializing RedisQ response")]
    Decode(#[source] serde_json::Error),

    #[error("package for kill {0:?} has no killmail payload")]
    MissingPayload(Option<i64>),

    #[error("package has neither an inner killmail_id nor a top-level killID")]
    MissingEventId,

    #[error("killmail {0} has an invalid timestamp: {1:?}")]
    InvalidTimestamp(i64, String),
}

/// One normalized combat event, ready for persistence. Immutable once
/// ingested.
#[derive(Debug, Clone, PartialEq)]
pub struct Killmail {
    pub event_id: i64,
    pub system_id: i64,
    pub occurred_at: DateTime<Utc>,
    pub victim_character_id: Option<i64>,
    pub victim_corp_id: Option<i64>,
    pub victim_alliance_id: Option<i64>,
    pub victim_ship_type_id: Option<i64>,
    pub attacker_character_ids: Vec<i64>,
    pub attacker_corp_ids: Vec<i64>,
    pub attacker_alliance_ids: Vec<i64>,
    pub isk_value: Option<i64>,
    pub zkb_hash: Option<String>,
    pub source_url: String,
}

/// A producer of killmails. The production implementation long-polls the
/// RedisQ queue; tests substitute their own.
pub trait KillmailSource {
    fn pull(&self) -> impl Future<Output = Result<Option<Killmail>, RedisqError>> + Send;
}

// The wire shape of one RedisQ response. Everything is optional at this
// stage; normalize_package decides what is actually required.
#[derive(Debug, Deserialize)]
struct RawResponse {
    package: Option<RawPackage>,
}

#[derive(Debug, Deserialize)]
struct RawPackage {
    #[serde(rename = "killID")]
    kill_id: Option<i64>,
    killmail: Option<RawKillmail>,
    zkb: Option<RawZkb>,
}

#[derive(Debug, Deserialize)]
struct RawKillmail {
    killmail_id: Option<i64>,
    killmail_time: Option<String>,
    solar_system_id: i64,
    victim: Option<RawVictim>,
    #[serde(default)]
    attackers: Vec<RawAttacker>,
}

#[derive(Debug, Deserialize, Default)]
struct RawVictim {
    character_id: Option<i64>,
    corporation_id: Option<i64>,
    alliance_id: Option<i64>,
    ship_type_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawAttacker {
    character_id: Option<i64>,
    corporation_id: Option<i64>,
    alliance_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawZkb {
    #[serde(rename = "totalValue")]
    total_value: Option<f64>,
    hash: Option<String>,
    url: Option<String>,
}

pub struct RedisqConfig {
    pub base_url: String,
    pub user_agent: String,
    /// Appended as the queueID query parameter. Replicas must use distinct
    /// queue identities or the upstream splits one stream between them.
    pub queue_id: Option<String>,
    /// Upstream time-to-wait for the long poll, in seconds.
    pub ttw_seconds: u32,
}

impl Default for RedisqConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: concat!("battlelog/", env!("CARGO_PKG_VERSION")).to_string(),
            queue_id: None,
            ttw_seconds: 10,
        }
    }
}

pub struct Redisq {
    client: reqwest::Client,
    base_url: String,
    queue_id: Option<String>,
    ttw_seconds: u32,
}

impl Redisq {
    pub fn new(config: RedisqConfig) -> Result<Self, RedisqError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            // The long poll holds the connection open for ttw seconds, so
            // the request deadline has to sit beyond that.
            .timeout(Duration::from_secs(u64::from(config.ttw_seconds) + 10))
            .build()
            .map_err(RedisqError::RequestBuild)?;

        Ok(Self {
            client,
            base_url: config.base_url,
            queue_id: config.queue_id,
            ttw_seconds: config.ttw_seconds,
        })
    }
}

impl KillmailSource for Redisq {
    async fn pull(&self) -> Result<Option<Killmail>, RedisqError> {
        let ttw = self.ttw_seconds.to_string();
        let mut request_builder = self
            .client
            .get(&self.base_url)
            .query(&[("ttw", ttw.as_str())]);

        if let Some(queue_id) = &self.queue_id {
            request_builder = request_builder.query(&[("queueID", queue_id.as_str())]);
        }

        let request = request_builder
            .build()
            .map_err(RedisqError::RequestBuild)?;

        let response = self
            .client
            .execute(request)
            .await
            .map_err(RedisqError::RequestExecute)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RedisqError::UpstreamHttp {
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(RedisqError::RequestBody)?;
        let raw: RawResponse = serde_json::from_str(&body).map_err(RedisqError::Decode)?;

        let Some(package) = raw.package else {
            // An empty package is normal idle, not an error.
            debug!("RedisQ long poll returned an empty package");
            return Ok(None);
        };

        normalize_package(package).map(Some)
    }
}

/// Turns one raw package into a normalized killmail. The parsing rules are
/// bit-exact against the upstream feed: the inner killmail_id is preferred
/// over the top-level killID, ID arrays are deduplicated preserving
/// first-seen order with nulls dropped, and the ISK value rounds half to
/// even.
fn normalize_package(package: RawPackage) -> Result<Killmail, RedisqError> {
    let Some(killmail) = package.killmail else {
        return Err(RedisqError::MissingPayload(package.kill_id));
    };

    let event_id = killmail
        .killmail_id
        .or(package.kill_id)
        .ok_or(RedisqError::MissingEventId)?;

    let raw_time = killmail.killmail_time.unwrap_or_default();
    let occurred_at = DateTime::parse_from_rfc3339(&raw_time)
        .map_err(|_| RedisqError::InvalidTimestamp(event_id, raw_time.clone()))?
        .with_timezone(&Utc);

    let victim = killmail.victim.unwrap_or_default();

    let attacker_character_ids = dedup_ids(killmail.attackers.iter().map(|a| a.character_id));
    let attacker_corp_ids = dedup_ids(killmail.attackers.iter().map(|a| a.corporation_id));
    let attacker_alliance_ids = dedup_ids(killmail.attackers.iter().map(|a| a.alliance_id));

    let (isk_value, zkb_hash, source_url) = match package.zkb {
        Some(zkb) => (
            zkb.total_value.map(round_isk),
            zkb.hash,
            zkb.url,
        ),
        None => (None, None, None),
    };

    let source_url =
        source_url.unwrap_or_else(|| format!("{KILL_URL_HOST}/kill/{event_id}/"));

    Ok(Killmail {
        event_id,
        system_id: killmail.solar_system_id,
        occurred_at,
        victim_character_id: victim.character_id,
        victim_corp_id: victim.corporation_id,
        victim_alliance_id: victim.alliance_id,
        victim_ship_type_id: victim.ship_type_id,
        attacker_character_ids,
        attacker_corp_ids,
        attacker_alliance_ids,
        isk_value,
        zkb_hash,
        source_url,
    })
}

// Deduplicate preserving first-seen order, dropping nulls.
fn dedup_ids(ids: impl Iterator<Item = Option<i64>>) -> Vec<i64> {
    ids.flatten().unique().collect_vec()
}

fn round_isk(value: f64) -> i64 {
    value.round_ties_even() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn package_from_json(json: serde_json::Value) -> RawPackage {
        serde_json::from_value(json).expect("test package should deserialize")
    }

    fn normalize(json: serde_json::Value) -> Result<Killmail, RedisqError> {
        normalize_package(package_from_json(json))
    }

    #[test]
    fn normalizes_a_full_package() {
        let killmail = normalize(serde_json::json!({
            "killID": 9001,
            "killmail": {
                "killmail_id": 9001,
                "killmail_time": "2024-05-01T12:00:00Z",
                "solar_system_id": 30000142,
                "victim": {
                    "character_id": 11,
                    "corporation_id": 21,
                    "alliance_id": 31,
                    "ship_type_id": 587
                },
                "attackers": [
                    { "character_id": 12, "corporation_id": 22, "alliance_id": 32 },
                    { "character_id": 13, "corporation_id": 22 }
                ]
            },
            "zkb": { "totalValue": 750000000.0, "hash": "abc123" }
        }))
        .expect("package should normalize");

        assert_eq!(killmail.event_id, 9001);
        assert_eq!(killmail.system_id, 30000142);
        assert_eq!(
            killmail.occurred_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(killmail.victim_character_id, Some(11));
        assert_eq!(killmail.attacker_character_ids, vec![12, 13]);
        assert_eq!(killmail.attacker_corp_ids, vec![22]);
        assert_eq!(killmail.attacker_alliance_ids, vec![32]);
        assert_eq!(killmail.isk_value, Some(750000000));
        assert_eq!(killmail.zkb_hash.as_deref(), Some("abc123"));
    }

    #[test]
    fn prefers_inner_killmail_id_over_kill_id() {
        let killmail = normalize(serde_json::json!({
            "killID": 1,
            "killmail": {
                "killmail_id": 2,
                "killmail_time": "2024-05-01T12:00:00Z",
                "solar_system_id": 30000142
            }
        }))
        .unwrap();

        assert_eq!(killmail.event_id, 2);
    }

    #[test]
    fn falls_back_to_top_level_kill_id() {
        let killmail = normalize(serde_json::json!({
            "killID": 77,
            "killmail": {
                "killmail_time": "2024-05-01T12:00:00Z",
                "solar_system_id": 30000142
            }
        }))
        .unwrap();

        assert_eq!(killmail.event_id, 77);
    }

    #[test]
    fn missing_killmail_object_is_an_error() {
        let err = normalize(serde_json::json!({ "killID": 5 })).unwrap_err();
        assert!(matches!(err, RedisqError::MissingPayload(Some(5))));
    }

    #[test]
    fn invalid_timestamp_is_an_error() {
        let err = normalize(serde_json::json!({
            "killmail": {
                "killmail_id": 3,
                "killmail_time": "yesterday-ish",
                "solar_system_id": 30000142
            }
        }))
        .unwrap_err();
        assert!(matches!(err, RedisqError::InvalidTimestamp(3, _)));
    }

    #[test]
    fn missing_timestamp_is_an_invalid_timestamp() {
        let err = normalize(serde_json::json!({
            "killmail": {
                "killmail_id": 4,
                "solar_system_id": 30000142
            }
        }))
        .unwrap_err();
        assert!(matches!(err, RedisqError::InvalidTimestamp(4, _)));
    }

    #[test]
    fn attacker_ids_dedup_preserves_first_seen_order() {
        let killmail = normalize(serde_json::json!({
            "killmail": {
                "killmail_id": 6,
                "killmail_time": "2024-05-01T12:00:00Z",
                "solar_system_id": 30000142,
                "attackers": [
                    { "character_id": 9, "alliance_id": 40 },
                    { "alliance_id": 41 },
                    { "character_id": 8, "alliance_id": 40 },
                    { "character_id": 9 }
                ]
            }
        }))
        .unwrap();

        assert_eq!(killmail.attacker_character_ids, vec![9, 8]);
        assert_eq!(killmail.attacker_alliance_ids, vec![40, 41]);
        assert!(killmail.attacker_corp_ids.is_empty());
    }

    #[test]
    fn isk_rounds_half_to_even() {
        assert_eq!(round_isk(0.5), 0);
        assert_eq!(round_isk(1.5), 2);
        assert_eq!(round_isk(2.5), 2);
        assert_eq!(round_isk(2.4), 2);
        assert_eq!(round_isk(2.6), 3);
    }

    #[test]
    fn missing_isk_value_stays_null() {
        let killmail = normalize(serde_json::json!({
            "killmail": {
                "killmail_id": 7,
                "killmail_time": "2024-05-01T12:00:00Z",
                "solar_system_id": 30000142
            },
            "zkb": { "hash": "h" }
        }))
        .unwrap();

        assert_eq!(killmail.isk_value, None);
    }

    #[test]
    fn source_url_is_honored_when_present() {
        let killmail = normalize(serde_json::json!({
            "killmail": {
                "killmail_id": 10,
                "killmail_time": "2024-05-01T12:00:00Z",
                "solar_system_id": 30000142
            },
            "zkb": { "url": "https://example.net/kill/10/" }
        }))
        .unwrap();

        assert_eq!(killmail.source_url, "https://example.net/kill/10/");
    }

    #[test]
    fn source_url_is_synthesized_when_absent() {
        let killmail = normalize(serde_json::json!({
            "killmail": {
                "killmail_id": 10,
                "killmail_time": "2024-05-01T12:00:00Z",
                "solar_system_id": 30000142
            }
        }))
        .unwrap();

        assert_eq!(killmail.source_url, "https://zkillboard.com/kill/10/");
    }

    #[test]
    fn empty_package_parses_as_none() {
        let raw: RawResponse = serde_json::from_str(r#"{"package":null}"#).unwrap();
        assert!(raw.package.is_none());
    }
}
