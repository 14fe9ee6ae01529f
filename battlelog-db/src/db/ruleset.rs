use chrono::{DateTime, Utc};
use diesel::{PgConnection, prelude::*};
use itertools::Itertools;

use crate::data_schema::data::ruleset::dsl as ruleset_dsl;
use crate::models::DbRuleset;
use crate::notify;
use crate::ruleset::{Ruleset, RulesetPatch};

const SINGLETON_ID: i32 = 1;

/// Read the active ruleset. The row is seeded by the initial migration, so
/// a missing row is a real error, not an empty state.
pub fn get_active_ruleset(conn: &mut PgConnection) -> QueryResult<Ruleset> {
    ruleset_dsl::ruleset
        .find(SINGLETON_ID)
        .select(DbRuleset::as_select())
        .get_result(conn)
        .map(Ruleset::from)
}

/// Apply a patch to the singleton, last writer wins, and publish the
/// invalidation once the write has committed. Returns the new ruleset.
pub fn update_active_ruleset(
    conn: &mut PgConnection,
    patch: &RulesetPatch,
    now: DateTime<Utc>,
) -> QueryResult<Ruleset> {
    let updated = conn.transaction(|conn| {
        let mut current = get_active_ruleset(conn)?;
        current.apply_patch(patch, now);

        let tracked_security_classes = current
            .tracked_security_classes
            .iter()
            .map(|class| Some(class.to_string()))
            .collect_vec();

        diesel::update(ruleset_dsl::ruleset.find(SINGLETON_ID))
            .set((
                ruleset_dsl::min_pilots.eq(current.min_pilots),
                ruleset_dsl::tracked_alliance_ids
                    .eq(current.tracked_alliance_ids.iter().map(|id| Some(*id)).collect_vec()),
                ruleset_dsl::tracked_corp_ids
                    .eq(current.tracked_corp_ids.iter().map(|id| Some(*id)).collect_vec()),
                ruleset_dsl::tracked_system_ids
                    .eq(current.tracked_system_ids.iter().map(|id| Some(*id)).collect_vec()),
                ruleset_dsl::tracked_security_classes.eq(tracked_security_classes),
                ruleset_dsl::ignore_unlisted.eq(current.ignore_unlisted),
                ruleset_dsl::updated_at.eq(now.naive_utc()),
            ))
            .execute(conn)?;

        Ok::<_, diesel::result::Error>(current)
    })?;

    // Published outside the transaction: subscribers that react immediately
    // must see the committed row.
    notify::publish_ruleset_invalidation(conn, updated.updated_at)?;

    Ok(updated)
}
