//! The ingestion loop: pull one killmail at a time from the upstream queue,
//! classify it, apply the ruleset's coarse filter, persist it exactly once,
//! and hand the new event to the enrichment worker.

use std::sync::Arc;
use std::time::Duration;

use battlelog_db::db::{self, IngestOutcome};
use battlelog_db::models::NewEvent;
use battlelog_db::ruleset::{EventFacts, RulesetHandle};
use battlelog_db::space::{SecurityClass, SpaceClass};
use battlelog_db::{PgConnection, is_connection_error};
use chrono::{TimeDelta, Utc};
use esi::{EntityFetcher, EsiClient};
use itertools::Itertools;
use log::{debug, info, warn};
use redisq::{Killmail, KillmailSource, RedisqError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::IngestConfig;
use crate::service::{ServiceError, establish_with_retries};

// How long to sit out after a failed pull before hitting the queue again.
const PULL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct IngestCounters {
    stored: u64,
    duplicates: u64,
    rejected: u64,
    malformed: u64,
    empty_polls: u64,
    classify_fallbacks: u64,
}

impl IngestCounters {
    fn report(&self) {
        info!(
            "Ingest: {} stored, {} duplicates, {} rejected by ruleset, {} malformed, \
            {} empty polls, {} security-class fallbacks",
            self.stored,
            self.duplicates,
            self.rejected,
            self.malformed,
            self.empty_polls,
            self.classify_fallbacks,
        );
    }
}

pub async fn run_ingest_loop<S: KillmailSource>(
    url: &str,
    source: &S,
    esi: Arc<EsiClient>,
    ruleset: RulesetHandle,
    work_tx: mpsc::Sender<i64>,
    config: &IngestConfig,
    cancel: CancellationToken,
) -> Result<(), ServiceError> {
    let retry_window = Duration::from_secs(config.store_retry_window_seconds);
    let mut conn = match establish_with_retries(url, retry_window, &cancel).await {
        Ok(conn) => conn,
        Err(ServiceError::Cancelled) => return Ok(()),
        Err(err) => return Err(err),
    };

    let mut counters = IngestCounters::default();
    let mut last_report = Utc::now();
    let report_every = TimeDelta::seconds(config.stats_interval_seconds);

    info!("Beginning killmail ingest");

    loop {
        let pulled = tokio::select! {
            _ = cancel.cancelled() => break,
            pulled = source.pull() => pulled,
        };

        match pulled {
            Ok(None) => {
                counters.empty_polls += 1;
            }
            Ok(Some(killmail)) => {
                match ingest_one(
                    &mut conn,
                    &esi,
                    &ruleset,
                    &work_tx,
                    killmail,
                    &mut counters,
                )
                .await
                {
                    Ok(()) => {}
                    Err(err) if is_connection_error(&err) => {
                        warn!("Lost the store connection during ingest: {err}");
                        conn = match establish_with_retries(url, retry_window, &cancel).await {
                            Ok(conn) => conn,
                            Err(ServiceError::Cancelled) => break,
                            Err(err) => return Err(err),
                        };
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            Err(
                err @ (RedisqError::Decode(_)
                | RedisqError::InvalidTimestamp(..)
                | RedisqError::MissingPayload(_)
                | RedisqError::MissingEventId),
            ) => {
                // Malformed events are dropped, counted, and never
                // persisted.
                counters.malformed += 1;
                warn!("Dropping malformed upstream event: {err}");
            }
            Err(err) => {
                warn!("Upstream pull failed: {err}. Backing off.");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(PULL_ERROR_BACKOFF) => {}
                }
            }
        }

        if Utc::now() - last_report >= report_every {
            counters.report();
            last_report = Utc::now();
        }
    }

    counters.report();
    info!("Killmail ingest is exiting");
    Ok(())
}

async fn ingest_one(
    conn: &mut PgConnection,
    esi: &EsiClient,
    ruleset: &RulesetHandle,
    work_tx: &mpsc::Sender<i64>,
    killmail: Killmail,
    counters: &mut IngestCounters,
) -> Result<(), battlelog_db::QueryError> {
    let security_class = classify(esi, &killmail, counters).await;

    let facts = EventFacts {
        system_id: killmail.system_id,
        security_class,
        victim_character_id: killmail.victim_character_id,
        victim_corp_id: killmail.victim_corp_id,
        victim_alliance_id: killmail.victim_alliance_id,
        attacker_character_ids: &killmail.attacker_character_ids,
        attacker_corp_ids: &killmail.attacker_corp_ids,
        attacker_alliance_ids: &killmail.attacker_alliance_ids,
    };

    if ruleset.current().rejects_at_ingest(&facts) {
        counters.rejected += 1;
        debug!("Ruleset rejected event {} before ingest", killmail.event_id);
        return Ok(());
    }

    // occurred_at <= fetched_at must hold even when the upstream clock runs
    // ahead of ours.
    let fetched_at = Utc::now().max(killmail.occurred_at);

    let space_class = SpaceClass::of_system(killmail.system_id).to_string();
    let security_class = security_class.to_string();
    let new_event = NewEvent {
        event_id: killmail.event_id,
        system_id: killmail.system_id,
        space_class: &space_class,
        security_class: &security_class,
        occurred_at: killmail.occurred_at.naive_utc(),
        victim_character_id: killmail.victim_character_id,
        victim_corp_id: killmail.victim_corp_id,
        victim_alliance_id: killmail.victim_alliance_id,
        victim_ship_type_id: killmail.victim_ship_type_id,
        attacker_character_ids: to_db_ids(&killmail.attacker_character_ids),
        attacker_corp_ids: to_db_ids(&killmail.attacker_corp_ids),
        attacker_alliance_ids: to_db_ids(&killmail.attacker_alliance_ids),
        isk_value: killmail.isk_value,
        zkb_hash: killmail.zkb_hash.as_deref(),
        source_url: &killmail.source_url,
        fetched_at: fetched_at.naive_utc(),
    };

    match db::insert_event(conn, &new_event, fetched_at.naive_utc())? {
        IngestOutcome::Stored => {
            counters.stored += 1;
            // Best-effort: a full queue just means the sweep picks this one
            // up later.
            if work_tx.try_send(killmail.event_id).is_err() {
                debug!(
                    "Work queue is full; enrichment of {} is deferred to the sweep",
                    killmail.event_id,
                );
            }
        }
        IngestOutcome::Duplicate => {
            counters.duplicates += 1;
            debug!("Event {} was already ingested", killmail.event_id);
        }
    }

    Ok(())
}

async fn classify(
    esi: &EsiClient,
    killmail: &Killmail,
    counters: &mut IngestCounters,
) -> SecurityClass {
    let security_status = match SpaceClass::of_system(killmail.system_id) {
        SpaceClass::Normal => match esi.get_system(killmail.system_id).await {
            Ok(info) => Some(info.security_status),
            Err(err) => {
                counters.classify_fallbacks += 1;
                debug!(
                    "Couldn't resolve security for system {}: {err}",
                    killmail.system_id,
                );
                None
            }
        },
        _ => None,
    };

    SecurityClass::derive(killmail.system_id, security_status)
}

fn to_db_ids(ids: &[i64]) -> Vec<Option<i64>> {
    ids.iter().map(|id| Some(*id)).collect_vec()
}
