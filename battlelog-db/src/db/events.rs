use chrono::NaiveDateTime;
use diesel::{PgConnection, prelude::*};

use crate::data_schema::data::enrichments::dsl as enrichments_dsl;
use crate::data_schema::data::events::dsl as events_dsl;
use crate::db::EnrichmentStatus;
use crate::models::{DbEvent, NewEnrichment, NewEvent};

/// The observable outcome of one ingest write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The event was new; an enrichment stub now exists for it.
    Stored,
    /// The event was already present. Nothing was written.
    Duplicate,
}

/// Persist one event and its pending enrichment stub in a single
/// transaction. The insert is conflict-ignore on `event_id`, which is what
/// makes ingestion safe under at-least-once delivery from the upstream
/// queue.
pub fn insert_event(
    conn: &mut PgConnection,
    event: &NewEvent<'_>,
    now: NaiveDateTime,
) -> QueryResult<IngestOutcome> {
    conn.transaction(|conn| {
        let inserted = diesel::insert_into(events_dsl::events)
            .values(event)
            .on_conflict(events_dsl::event_id)
            .do_nothing()
            .execute(conn)?;

        if inserted == 0 {
            return Ok(IngestOutcome::Duplicate);
        }

        NewEnrichment {
            event_id: event.event_id,
            status: EnrichmentStatus::Pending.as_str(),
            fetched_at: now,
            updated_at: now,
        }
        .insert_into(enrichments_dsl::enrichments)
        .on_conflict(enrichments_dsl::event_id)
        .do_nothing()
        .execute(conn)?;

        Ok(IngestOutcome::Stored)
    })
}

pub fn get_event(conn: &mut PgConnection, event_id: i64) -> QueryResult<Option<DbEvent>> {
    events_dsl::events
        .find(event_id)
        .select(DbEvent::as_select())
        .get_result(conn)
        .optional()
}

/// The newest events, feed-ordered. Callers over-fetch and filter in
/// process, so `limit` here is the already-multiplied fetch size.
pub fn recent_killmails(conn: &mut PgConnection, limit: i64) -> QueryResult<Vec<DbEvent>> {
    events_dsl::events
        .order_by((events_dsl::occurred_at.desc(), events_dsl::event_id.desc()))
        .limit(limit)
        .select(DbEvent::as_select())
        .get_results(conn)
}

#[diesel::dsl::auto_type]
fn killmail_cursor_query(cursor_time: NaiveDateTime, cursor_event_id: i64) -> _ {
    events_dsl::events
        // Select events that are strictly after the cursor time, or from
        // the same time and with higher ids
        .filter(
            events_dsl::occurred_at.gt(cursor_time).or(events_dsl::occurred_at
                .eq(cursor_time)
                .and(events_dsl::event_id.gt(cursor_event_id))),
        )
        // Callers of this function rely on the results being sorted by
        // (occurred_at, event_id) with the highest id last
        .order_by((
            events_dsl::occurred_at.asc(),
            events_dsl::event_id.asc(),
        ))
}

/// Events strictly newer than the `(occurred_at, event_id)` cursor, oldest
/// first. This is the stream's per-tick fetch.
pub fn killmails_after(
    conn: &mut PgConnection,
    cursor: (NaiveDateTime, i64),
    limit: i64,
) -> QueryResult<Vec<DbEvent>> {
    killmail_cursor_query(cursor.0, cursor.1)
        .limit(limit)
        .select(DbEvent::as_select())
        .get_results(conn)
}

/// The clusterer's sweep: unprocessed events old enough to be clear of
/// in-flight enrichment and late arrivals, in time order.
pub fn unprocessed_batch(
    conn: &mut PgConnection,
    cutoff: NaiveDateTime,
    batch_size: i64,
) -> QueryResult<Vec<DbEvent>> {
    events_dsl::events
        .filter(events_dsl::processed_at.is_null())
        .filter(events_dsl::occurred_at.le(cutoff))
        .order_by((events_dsl::occurred_at.asc(), events_dsl::event_id.asc()))
        .limit(batch_size)
        .select(DbEvent::as_select())
        .get_results(conn)
}

/// Mark events considered-and-rejected by clustering: processed, attached
/// to no battle, never re-examined.
pub fn mark_events_ignored(
    conn: &mut PgConnection,
    event_ids: &[i64],
    now: NaiveDateTime,
) -> QueryResult<usize> {
    diesel::update(events_dsl::events.filter(events_dsl::event_id.eq_any(event_ids)))
        .set((
            events_dsl::processed_at.eq(now),
            events_dsl::battle_id.eq(None::<uuid::Uuid>),
        ))
        .execute(conn)
}
