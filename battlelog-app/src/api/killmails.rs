//! The live killmail feed: filtered cursor pagination over stored events,
//! served once (`/recent`) or as a long-lived server-sent-event session
//! (`/stream`).

use std::str::FromStr;
use std::time::Duration;

use battlelog_db::db;
use battlelog_db::models::DbEvent;
use battlelog_db::ruleset::{Ruleset, RulesetHandle};
use battlelog_db::space::{SecurityClass, SpaceClass};
use chrono::{DateTime, Utc};
use esi::EsiClient;
use itertools::Itertools;
use log::warn;
use rocket::response::stream::{Event, EventStream};
use rocket::serde::json::Json;
use rocket::{FromForm, Shutdown, State, get};
use serde::Serialize;
use uuid::Uuid;

use crate::api::ApiError;
use crate::names::{self, ApiEntityRef};
use crate::{AppConfig, Db};

#[derive(Debug, Clone, Serialize)]
pub struct ApiVictim {
    pub character: Option<ApiEntityRef>,
    pub corporation: Option<ApiEntityRef>,
    pub alliance: Option<ApiEntityRef>,
    pub ship: Option<ApiEntityRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiAttackers {
    pub characters: Vec<ApiEntityRef>,
    pub corporations: Vec<ApiEntityRef>,
    pub alliances: Vec<ApiEntityRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKillmail {
    #[serde(with = "crate::api::id_string")]
    pub event_id: i64,
    pub system: ApiEntityRef,
    pub space_class: String,
    pub security_class: String,
    pub occurred_at: DateTime<Utc>,
    pub victim: ApiVictim,
    pub attackers: ApiAttackers,
    pub isk_value: Option<i64>,
    pub source_url: String,
    pub battle_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct KillmailPage {
    pub items: Vec<ApiKillmail>,
    pub count: usize,
}

#[derive(Debug, FromForm)]
pub struct FeedQuery {
    pub limit: Option<i64>,
    pub space_type: Vec<String>,
    pub security_type: Vec<String>,
    #[field(name = "trackedOnly")]
    pub tracked_only: Option<bool>,
    pub once: Option<bool>,
    #[field(name = "pollIntervalMs")]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FeedFilter {
    pub limit: i64,
    pub space_classes: Option<Vec<SpaceClass>>,
    pub security_classes: Option<Vec<SecurityClass>>,
    pub tracked_only: bool,
    pub once: bool,
    pub poll_interval: Duration,
}

impl FeedQuery {
    pub fn validate(&self, config: &AppConfig) -> Result<FeedFilter, ApiError> {
        let limit = self.limit.unwrap_or(config.feed_default_limit);
        if limit < 1 || limit > config.feed_max_limit {
            return Err(ApiError::BadQuery(format!(
                "limit must be between 1 and {}",
                config.feed_max_limit,
            )));
        }

        let space_classes = parse_classes::<SpaceClass>(&self.space_type, "space_type")?;
        let security_classes =
            parse_classes::<SecurityClass>(&self.security_type, "security_type")?;

        let poll_ms = self
            .poll_interval_ms
            .unwrap_or(config.feed_default_poll_ms)
            .clamp(config.feed_min_poll_ms, config.feed_max_poll_ms);

        Ok(FeedFilter {
            limit,
            space_classes,
            security_classes,
            tracked_only: self.tracked_only.unwrap_or(false),
            once: self.once.unwrap_or(false),
            poll_interval: Duration::from_millis(poll_ms),
        })
    }
}

fn parse_classes<T: FromStr>(
    raw: &[String],
    param: &str,
) -> Result<Option<Vec<T>>, ApiError> {
    if raw.is_empty() {
        return Ok(None);
    }

    raw.iter()
        .map(|value| {
            T::from_str(value)
                .map_err(|_| ApiError::BadQuery(format!("unknown {param} {value:?}")))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Apply the class filters and the shared ruleset predicate in process.
/// Callers over-fetch to absorb the shrinkage this causes.
pub fn apply_filters(
    rows: Vec<DbEvent>,
    ruleset: &Ruleset,
    filter: &FeedFilter,
) -> Vec<DbEvent> {
    rows.into_iter()
        .filter(|row| admits_row(row, ruleset, filter))
        .collect_vec()
}

fn admits_row(row: &DbEvent, ruleset: &Ruleset, filter: &FeedFilter) -> bool {
    if let Some(space_classes) = &filter.space_classes {
        let space_class =
            SpaceClass::from_str(&row.space_class).unwrap_or(SpaceClass::Normal);
        if !space_classes.contains(&space_class) {
            return false;
        }
    }

    if let Some(security_classes) = &filter.security_classes {
        let security_class =
            SecurityClass::from_str(&row.security_class).unwrap_or(SecurityClass::Nullsec);
        if !security_classes.contains(&security_class) {
            return false;
        }
    }

    let attacker_characters = row.attacker_characters().collect_vec();
    let attacker_corps = row.attacker_corps().collect_vec();
    let attacker_alliances = row.attacker_alliances().collect_vec();
    let facts = row.facts(&attacker_characters, &attacker_corps, &attacker_alliances);

    ruleset.admits(&facts, filter.tracked_only)
}

#[get("/killmails/recent?<query..>")]
pub async fn recent_killmails(
    query: FeedQuery,
    db: Db,
    esi: &State<EsiClient>,
    ruleset: &State<RulesetHandle>,
    config: &State<AppConfig>,
) -> Result<Json<KillmailPage>, ApiError> {
    let filter = query.validate(config)?;

    let fetch = filter.limit * config.feed_overfetch;
    let rows = db.run(move |conn| db::recent_killmails(conn, fetch)).await?;

    let mut kept = apply_filters(rows, &ruleset.current(), &filter);
    kept.truncate(filter.limit as usize);

    let items = names::enrich_killmails(esi.inner(), kept).await;
    Ok(Json(KillmailPage {
        count: items.len(),
        items,
    }))
}

#[get("/killmails/stream?<query..>")]
pub async fn killmail_stream<'r>(
    query: FeedQuery,
    db: Db,
    esi: &'r State<EsiClient>,
    ruleset: &'r State<RulesetHandle>,
    config: &'r State<AppConfig>,
    mut end: Shutdown,
) -> Result<EventStream![Event + 'r], ApiError> {
    let filter = query.validate(config)?;
    let fetch = filter.limit * config.feed_overfetch;

    Ok(EventStream! {
        // Snapshot first: same logic as /recent, plus it seeds the cursor
        // with the newest row observed (or now, if the feed is empty).
        let snapshot = db.run(move |conn| db::recent_killmails(conn, fetch)).await;
        let mut session = match snapshot {
            Ok(rows) => {
                let cursor = rows
                    .first()
                    .map(|row| (row.occurred_at, row.event_id))
                    .unwrap_or_else(|| (Utc::now().naive_utc(), 0));

                let mut kept = apply_filters(rows, &ruleset.current(), &filter);
                kept.truncate(filter.limit as usize);
                let items = names::enrich_killmails(esi.inner(), kept).await;
                yield Event::json(&KillmailPage { count: items.len(), items })
                    .event("snapshot");

                (!filter.once).then_some(cursor)
            }
            Err(err) => {
                warn!("Stream snapshot fetch failed: {err}");
                None
            }
        };

        while let Some(cursor) = session {
            tokio::select! {
                _ = &mut end => break,
                _ = tokio::time::sleep(filter.poll_interval) => {}
            }

            let rows = match db
                .run(move |conn| db::killmails_after(conn, cursor, fetch))
                .await
            {
                Ok(rows) => rows,
                Err(err) => {
                    // Recoverable: skip the tick and keep the session.
                    warn!("Stream tick fetch failed: {err}");
                    yield Event::comment("keep-alive");
                    continue;
                }
            };

            // Advance past everything observed, filtered or not, so a
            // filtered-out event is never refetched forever.
            if let Some(last) = rows.last() {
                session = Some((last.occurred_at, last.event_id));
            }

            // The handle is kept fresh by the invalidation listener, so a
            // ruleset update applies from the very next tick, cursor
            // intact.
            let kept = apply_filters(rows, &ruleset.current(), &filter);
            if kept.is_empty() {
                yield Event::comment("keep-alive");
                continue;
            }

            let items = names::enrich_killmails(esi.inner(), kept).await;
            for item in items {
                yield Event::json(&item).event("killmail");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn row(event_id: i64, security_class: &str, attacker_count: usize) -> DbEvent {
        DbEvent {
            event_id,
            system_id: 30000142,
            space_class: "normal".to_string(),
            security_class: security_class.to_string(),
            occurred_at: NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
            victim_character_id: Some(11),
            victim_corp_id: Some(21),
            victim_alliance_id: Some(31),
            victim_ship_type_id: None,
            attacker_character_ids: (0..attacker_count as i64).map(|i| Some(100 + i)).collect(),
            attacker_corp_ids: vec![],
            attacker_alliance_ids: vec![],
            isk_value: None,
            zkb_hash: None,
            source_url: String::new(),
            fetched_at: NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(12, 1, 0)
                .unwrap(),
            processed_at: None,
            battle_id: None,
        }
    }

    fn open_ruleset() -> Ruleset {
        Ruleset {
            min_pilots: 1,
            tracked_alliance_ids: vec![],
            tracked_corp_ids: vec![],
            tracked_system_ids: vec![],
            tracked_security_classes: vec![],
            ignore_unlisted: false,
            updated_at: Utc::now(),
        }
    }

    fn filter() -> FeedFilter {
        FeedFilter {
            limit: 25,
            space_classes: None,
            security_classes: None,
            tracked_only: false,
            once: false,
            poll_interval: Duration::from_secs(5),
        }
    }

    #[test]
    fn security_class_filter_drops_mismatches() {
        let rows = vec![row(1, "highsec", 1), row(2, "nullsec", 1)];
        let mut f = filter();
        f.security_classes = Some(vec![SecurityClass::Nullsec]);

        let kept = apply_filters(rows, &open_ruleset(), &f);
        assert_eq!(kept.iter().map(|r| r.event_id).collect_vec(), vec![2]);
    }

    #[test]
    fn min_pilots_applies_through_the_shared_predicate() {
        let rows = vec![row(1, "highsec", 0), row(2, "highsec", 3)];
        let mut ruleset = open_ruleset();
        ruleset.min_pilots = 3;

        let kept = apply_filters(rows, &ruleset, &filter());
        assert_eq!(kept.iter().map(|r| r.event_id).collect_vec(), vec![2]);
    }

    #[test]
    fn tracked_only_with_tracking_lists_filters() {
        let rows = vec![row(1, "highsec", 1)];
        let mut ruleset = open_ruleset();
        ruleset.tracked_alliance_ids = vec![31];

        let mut f = filter();
        f.tracked_only = true;
        assert_eq!(apply_filters(rows.clone(), &ruleset, &f).len(), 1);

        ruleset.tracked_alliance_ids = vec![32];
        assert!(apply_filters(rows, &ruleset, &f).is_empty());
    }
}
