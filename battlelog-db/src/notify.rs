//! Cross-process invalidation over Postgres LISTEN/NOTIFY. One channel,
//! `ruleset:invalidate`; the payload is the new `updated_at` as an RFC 3339
//! instant and is opaque to subscribers — the message means "re-read the
//! ruleset before your next scheduled action".

use std::time::Duration;

use diesel::sql_types::Text;
use diesel::{Connection, ConnectionError, PgConnection, RunQueryDsl};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use miette::Diagnostic;
use thiserror::Error;

use crate::QueryError;

pub const RULESET_CHANNEL: &str = "ruleset:invalidate";

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error, Diagnostic)]
pub enum ListenError {
    #[error("couldn't connect to database for LISTEN")]
    FailedToConnect(#[source] ConnectionError),

    #[error("error subscribing to {RULESET_CHANNEL}")]
    FailedToListen(#[source] QueryError),

    #[error("error polling for notifications")]
    FailedToPoll(#[source] QueryError),
}

/// Publish an invalidation for a ruleset committed at `updated_at`. Callers
/// invoke this after the mutation is committed so subscribers never re-read
/// a stale row.
pub fn publish_ruleset_invalidation(
    conn: &mut PgConnection,
    updated_at: DateTime<Utc>,
) -> Result<(), QueryError> {
    diesel::sql_query("select pg_notify($1, $2)")
        .bind::<Text, _>(RULESET_CHANNEL)
        .bind::<Text, _>(updated_at.to_rfc3339())
        .execute(conn)
        .map(|_| ())
}

/// Block on a dedicated connection, invoking `on_invalidate` once per batch
/// of pending invalidations. Returns when `should_stop` reports true; a
/// dropped connection is re-established so a subscriber survives
/// disconnection (worst case, it acts on one stale tick).
///
/// This is a blocking loop; async callers run it on a blocking task.
pub fn listen_for_ruleset_invalidations(
    url: &str,
    should_stop: impl Fn() -> bool,
    mut on_invalidate: impl FnMut(),
) -> Result<(), ListenError> {
    let mut conn = subscribe(url)?;

    while !should_stop() {
        match drain_notifications(&mut conn) {
            Ok(saw_invalidation) => {
                if saw_invalidation {
                    on_invalidate();
                }
            }
            Err(err) => {
                warn!("Ruleset listener lost its connection: {err:?}. Reconnecting.");
                // Re-read unconditionally after a reconnect; a notification
                // may have fired while we were away.
                conn = reconnect(url, &should_stop)?;
                on_invalidate();
            }
        }

        std::thread::sleep(POLL_INTERVAL);
    }

    debug!("Ruleset listener is exiting");
    Ok(())
}

fn subscribe(url: &str) -> Result<PgConnection, ListenError> {
    let mut conn = PgConnection::establish(url).map_err(ListenError::FailedToConnect)?;

    // The channel name contains a colon, so it has to be quoted as an
    // identifier.
    diesel::sql_query(format!("listen \"{RULESET_CHANNEL}\""))
        .execute(&mut conn)
        .map_err(ListenError::FailedToListen)?;

    Ok(conn)
}

fn reconnect(
    url: &str,
    should_stop: &impl Fn() -> bool,
) -> Result<PgConnection, ListenError> {
    let mut last_err = None;
    for _ in 0..40 {
        if should_stop() {
            break;
        }
        match subscribe(url) {
            Ok(conn) => return Ok(conn),
            Err(err) => {
                last_err = Some(err);
                std::thread::sleep(Duration::from_millis(500));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        ListenError::FailedToConnect(ConnectionError::BadConnection(
            "listener stopped before reconnecting".to_string(),
        ))
    }))
}

// A round trip forces libpq to consume any input waiting on the socket;
// the iterator then yields whatever notifications arrived.
fn drain_notifications(conn: &mut PgConnection) -> Result<bool, QueryError> {
    diesel::sql_query("select 1").execute(conn)?;

    let mut saw_invalidation = false;
    for notification in conn.notifications_iter() {
        let notification = notification?;
        if notification.channel == RULESET_CHANNEL {
            debug!(
                "Received ruleset invalidation (payload {:?})",
                notification.payload
            );
            saw_invalidation = true;
        }
    }

    Ok(saw_invalidation)
}
