use chrono::NaiveDateTime;
use diesel::{PgConnection, prelude::*};
use strum::{Display, EnumString};

use crate::data_schema::data::enrichments::dsl as enrichments_dsl;
use crate::models::DbEnrichment;

/// The enrichment state machine. Created `pending` alongside the event;
/// `succeeded` and `failed_permanent` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum EnrichmentStatus {
    Pending,
    Succeeded,
    FailedTransient,
    FailedPermanent,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Succeeded => "succeeded",
            EnrichmentStatus::FailedTransient => "failed_transient",
            EnrichmentStatus::FailedPermanent => "failed_permanent",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnrichmentStatus::Succeeded | EnrichmentStatus::FailedPermanent
        )
    }
}

pub fn get_enrichment(
    conn: &mut PgConnection,
    event_id: i64,
) -> QueryResult<Option<DbEnrichment>> {
    enrichments_dsl::enrichments
        .find(event_id)
        .select(DbEnrichment::as_select())
        .get_result(conn)
        .optional()
}

pub fn mark_enrichment_succeeded(
    conn: &mut PgConnection,
    event_id: i64,
    payload: &serde_json::Value,
    now: NaiveDateTime,
) -> QueryResult<usize> {
    diesel::update(enrichments_dsl::enrichments.find(event_id))
        .set((
            enrichments_dsl::status.eq(EnrichmentStatus::Succeeded.as_str()),
            enrichments_dsl::payload.eq(Some(payload)),
            enrichments_dsl::error.eq(None::<String>),
            enrichments_dsl::retry_at.eq(None::<NaiveDateTime>),
            enrichments_dsl::updated_at.eq(now),
        ))
        .execute(conn)
}

pub fn mark_enrichment_failed_permanent(
    conn: &mut PgConnection,
    event_id: i64,
    error: &str,
    now: NaiveDateTime,
) -> QueryResult<usize> {
    diesel::update(enrichments_dsl::enrichments.find(event_id))
        .set((
            enrichments_dsl::status.eq(EnrichmentStatus::FailedPermanent.as_str()),
            enrichments_dsl::error.eq(Some(error)),
            enrichments_dsl::retry_at.eq(None::<NaiveDateTime>),
            enrichments_dsl::updated_at.eq(now),
        ))
        .execute(conn)
}

/// Record a transient failure and schedule its retry. Attempts only advance
/// here, which keeps the backoff schedule honest when the same work item is
/// delivered more than once.
pub fn mark_enrichment_failed_transient(
    conn: &mut PgConnection,
    event_id: i64,
    error: &str,
    retry_at: NaiveDateTime,
    now: NaiveDateTime,
) -> QueryResult<usize> {
    diesel::update(enrichments_dsl::enrichments.find(event_id))
        .set((
            enrichments_dsl::status.eq(EnrichmentStatus::FailedTransient.as_str()),
            enrichments_dsl::error.eq(Some(error)),
            enrichments_dsl::attempts.eq(enrichments_dsl::attempts + 1),
            enrichments_dsl::retry_at.eq(Some(retry_at)),
            enrichments_dsl::updated_at.eq(now),
        ))
        .execute(conn)
}

/// Work items the channel lost or whose backoff has elapsed: pending rows
/// whose stub predates `pending_before` (emission is best-effort) and
/// transient failures due for retry.
pub fn sweep_enrichment_backlog(
    conn: &mut PgConnection,
    pending_before: NaiveDateTime,
    now: NaiveDateTime,
    limit: i64,
) -> QueryResult<Vec<i64>> {
    enrichments_dsl::enrichments
        .filter(
            enrichments_dsl::status
                .eq(EnrichmentStatus::Pending.as_str())
                .and(enrichments_dsl::fetched_at.lt(pending_before))
                .or(enrichments_dsl::status
                    .eq(EnrichmentStatus::FailedTransient.as_str())
                    .and(enrichments_dsl::retry_at.le(now))),
        )
        .order_by(enrichments_dsl::updated_at.asc())
        .limit(limit)
        .select(enrichments_dsl::event_id)
        .get_results(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            EnrichmentStatus::Pending,
            EnrichmentStatus::Succeeded,
            EnrichmentStatus::FailedTransient,
            EnrichmentStatus::FailedPermanent,
        ] {
            assert_eq!(
                EnrichmentStatus::from_str(status.as_str()).unwrap(),
                status
            );
            assert_eq!(status.to_string(), status.as_str());
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!EnrichmentStatus::Pending.is_terminal());
        assert!(!EnrichmentStatus::FailedTransient.is_terminal());
        assert!(EnrichmentStatus::Succeeded.is_terminal());
        assert!(EnrichmentStatus::FailedPermanent.is_terminal());
    }
}
