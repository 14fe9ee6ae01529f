//! The enrichment worker: consume work items, fetch the full killmail
//! payload from the upstream game API, and drive the per-event enrichment
//! state machine. A companion sweep re-enqueues whatever the best-effort
//! channel lost and whatever is due for a backoff retry.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use battlelog_db::db::{self, EnrichmentStatus};
use battlelog_db::{PgConnection, is_connection_error};
use chrono::{TimeDelta, Utc};
use esi::{EntityFetcher, EsiClient, EsiError};
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::IngestConfig;
use crate::service::{ServiceError, establish_with_retries};

// Consecutive unauthorized responses before the worker declares the
// credential situation unrecoverable and halts.
const UNAUTHORIZED_HALT_THRESHOLD: u32 = 5;

// Exponent cap so the backoff stays bounded however many times a transient
// failure repeats.
const MAX_BACKOFF_EXPONENT: u32 = 8;

pub type WorkQueue = Arc<Mutex<mpsc::Receiver<i64>>>;

pub async fn run_enrichment_worker(
    worker_id: usize,
    url: String,
    esi: Arc<EsiClient>,
    work_rx: WorkQueue,
    config: IngestConfig,
    cancel: CancellationToken,
) -> Result<(), ServiceError> {
    let retry_window = Duration::from_secs(config.store_retry_window_seconds);
    let mut conn = match establish_with_retries(&url, retry_window, &cancel).await {
        Ok(conn) => conn,
        Err(ServiceError::Cancelled) => return Ok(()),
        Err(err) => return Err(err),
    };

    let mut consecutive_unauthorized = 0u32;
    debug!("Enrichment worker {worker_id} is running");

    loop {
        let event_id = {
            let mut work_rx = work_rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                item = work_rx.recv() => match item {
                    Some(event_id) => event_id,
                    None => break,
                },
            }
        };

        match enrich_one(&mut conn, &esi, event_id, &config).await {
            Ok(EnrichAttempt::Unauthorized) => {
                consecutive_unauthorized += 1;
                if consecutive_unauthorized >= UNAUTHORIZED_HALT_THRESHOLD {
                    error!(
                        "Enrichment worker {worker_id} saw {consecutive_unauthorized} \
                        unauthorized responses in a row; halting",
                    );
                    return Err(ServiceError::UpstreamUnauthorized);
                }
            }
            Ok(_) => {
                consecutive_unauthorized = 0;
            }
            Err(err) if is_connection_error(&err) => {
                warn!("Enrichment worker {worker_id} lost the store connection: {err}");
                conn = match establish_with_retries(&url, retry_window, &cancel).await {
                    Ok(conn) => conn,
                    Err(ServiceError::Cancelled) => break,
                    Err(err) => return Err(err),
                };
            }
            Err(err) => return Err(err.into()),
        }
    }

    debug!("Enrichment worker {worker_id} is exiting");
    Ok(())
}

enum EnrichAttempt {
    /// The row reached a state transition (or was already terminal).
    Settled,
    /// The upstream said 401/403; the caller tracks persistence.
    Unauthorized,
}

async fn enrich_one(
    conn: &mut PgConnection,
    esi: &EsiClient,
    event_id: i64,
    config: &IngestConfig,
) -> Result<EnrichAttempt, battlelog_db::QueryError> {
    let Some(enrichment) = db::get_enrichment(conn, event_id)? else {
        // The sweep only hands out ids with stubs, so this is a work item
        // for an event that never finished ingesting.
        warn!("No enrichment stub for event {event_id}; skipping");
        return Ok(EnrichAttempt::Settled);
    };

    // Receiving the same work item twice must never regress state.
    let status = EnrichmentStatus::from_str(&enrichment.status)
        .unwrap_or(EnrichmentStatus::Pending);
    if status.is_terminal() {
        debug!("Enrichment for {event_id} is already {status}; nothing to do");
        return Ok(EnrichAttempt::Settled);
    }

    let Some(event) = db::get_event(conn, event_id)? else {
        warn!("Enrichment stub {event_id} has no event row; skipping");
        return Ok(EnrichAttempt::Settled);
    };

    let now = Utc::now();
    let Some(hash) = event.zkb_hash.as_deref() else {
        // Without the upstream hash there is no address to fetch from, ever.
        db::mark_enrichment_failed_permanent(
            conn,
            event_id,
            "event carries no killmail hash",
            now.naive_utc(),
        )?;
        return Ok(EnrichAttempt::Settled);
    };

    match esi.get_killmail(event_id, hash).await {
        Ok(payload) => {
            db::mark_enrichment_succeeded(conn, event_id, &payload, now.naive_utc())?;
            debug!("Enriched event {event_id}");
            Ok(EnrichAttempt::Settled)
        }
        Err(EsiError::NotFound) => {
            db::mark_enrichment_failed_permanent(
                conn,
                event_id,
                "killmail does not exist upstream",
                now.naive_utc(),
            )?;
            Ok(EnrichAttempt::Settled)
        }
        Err(EsiError::Unauthorized) => {
            db::mark_enrichment_failed_transient(
                conn,
                event_id,
                "unauthorized",
                (now + backoff(config, enrichment.attempts)).naive_utc(),
                now.naive_utc(),
            )?;
            Ok(EnrichAttempt::Unauthorized)
        }
        Err(err) => {
            // Everything else (rate limiting, 5xx, transport) retries on
            // the backoff schedule.
            db::mark_enrichment_failed_transient(
                conn,
                event_id,
                &err.to_string(),
                (now + backoff(config, enrichment.attempts)).naive_utc(),
                now.naive_utc(),
            )?;
            Ok(EnrichAttempt::Settled)
        }
    }
}

fn backoff(config: &IngestConfig, attempts: i32) -> TimeDelta {
    let exponent = (attempts.max(0) as u32).min(MAX_BACKOFF_EXPONENT);
    TimeDelta::seconds(config.enrich_backoff_base_seconds << exponent)
}

/// Periodically re-enqueue enrichment work the channel lost (stale pending
/// stubs) and transient failures whose retry time has passed.
pub async fn run_enrichment_sweep(
    url: String,
    work_tx: mpsc::Sender<i64>,
    config: IngestConfig,
    cancel: CancellationToken,
) -> Result<(), ServiceError> {
    let retry_window = Duration::from_secs(config.store_retry_window_seconds);
    let mut conn = match establish_with_retries(&url, retry_window, &cancel).await {
        Ok(conn) => conn,
        Err(ServiceError::Cancelled) => return Ok(()),
        Err(err) => return Err(err),
    };

    let mut timer =
        tokio::time::interval(Duration::from_secs(config.resweep_seconds.max(1) as u64));
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {}
        }

        let now = Utc::now();
        let pending_before = now - TimeDelta::seconds(config.resweep_seconds);
        let swept = db::sweep_enrichment_backlog(
            &mut conn,
            pending_before.naive_utc(),
            now.naive_utc(),
            config.sweep_batch_size,
        );

        match swept {
            Ok(event_ids) => {
                if event_ids.is_empty() {
                    continue;
                }
                let total = event_ids.len();
                let mut enqueued = 0;
                for event_id in event_ids {
                    if work_tx.try_send(event_id).is_err() {
                        break;
                    }
                    enqueued += 1;
                }
                info!("Enrichment sweep re-enqueued {enqueued} of {total} backlogged events");
            }
            Err(err) if is_connection_error(&err) => {
                warn!("Enrichment sweep lost the store connection: {err}");
                conn = match establish_with_retries(&url, retry_window, &cancel).await {
                    Ok(conn) => conn,
                    Err(ServiceError::Cancelled) => break,
                    Err(err) => return Err(err),
                };
            }
            Err(err) => return Err(err.into()),
        }
    }

    debug!("Enrichment sweep is exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_base(base: i64) -> IngestConfig {
        IngestConfig {
            enrich_backoff_base_seconds: base,
            ..Default::default()
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = config_with_base(30);
        assert_eq!(backoff(&config, 0), TimeDelta::seconds(30));
        assert_eq!(backoff(&config, 1), TimeDelta::seconds(60));
        assert_eq!(backoff(&config, 3), TimeDelta::seconds(240));
    }

    #[test]
    fn backoff_is_bounded() {
        let config = config_with_base(30);
        assert_eq!(backoff(&config, 50), backoff(&config, 8));
        assert_eq!(backoff(&config, -3), TimeDelta::seconds(30));
    }
}
