use chrono::NaiveDateTime;
use diesel::dsl::{max, min};
use diesel::{PgConnection, prelude::*};
use uuid::Uuid;

use crate::data_schema::data::battle_events::dsl as battle_events_dsl;
use crate::data_schema::data::battle_participants::dsl as battle_participants_dsl;
use crate::data_schema::data::battles::dsl as battles_dsl;
use crate::data_schema::data::events::dsl as events_dsl;
use crate::models::{
    DbBattle, DbBattleEvent, DbBattleParticipant, NewBattle, NewBattleEvent,
    NewBattleParticipant,
};

/// Persist one clustering plan atomically: the battle row, its attachments
/// and participants, and the processed markers on the plan's events. A
/// failure rolls the whole plan back, leaving its events unprocessed for the
/// next tick. Conflicts on the natural identities are idempotent successes
/// (a replayed plan never duplicates rows).
pub fn apply_battle_plan(
    conn: &mut PgConnection,
    battle: &NewBattle<'_>,
    attachments: &[NewBattleEvent],
    participants: &[NewBattleParticipant],
    event_ids: &[i64],
    now: NaiveDateTime,
) -> QueryResult<()> {
    conn.transaction(|conn| {
        diesel::insert_into(battles_dsl::battles)
            .values(battle)
            .on_conflict(battles_dsl::id)
            .do_nothing()
            .execute(conn)?;

        diesel::insert_into(battle_events_dsl::battle_events)
            .values(attachments)
            .on_conflict((battle_events_dsl::battle_id, battle_events_dsl::event_id))
            .do_nothing()
            .execute(conn)?;

        // Participants upsert latest-wins: the plan already resolved
        // per-character detail, so a replay carries identical rows.
        diesel::insert_into(battle_participants_dsl::battle_participants)
            .values(participants)
            .on_conflict((
                battle_participants_dsl::battle_id,
                battle_participants_dsl::character_id,
            ))
            .do_update()
            .set((
                battle_participants_dsl::alliance_id
                    .eq(diesel::upsert::excluded(battle_participants_dsl::alliance_id)),
                battle_participants_dsl::corp_id
                    .eq(diesel::upsert::excluded(battle_participants_dsl::corp_id)),
                battle_participants_dsl::ship_type_id
                    .eq(diesel::upsert::excluded(battle_participants_dsl::ship_type_id)),
                battle_participants_dsl::side_id
                    .eq(diesel::upsert::excluded(battle_participants_dsl::side_id)),
                battle_participants_dsl::is_victim
                    .eq(diesel::upsert::excluded(battle_participants_dsl::is_victim)),
            ))
            .execute(conn)?;

        diesel::update(events_dsl::events.filter(events_dsl::event_id.eq_any(event_ids)))
            .set((
                events_dsl::processed_at.eq(now),
                events_dsl::battle_id.eq(battle.id),
            ))
            .execute(conn)?;

        Ok(())
    })
}

pub fn recent_battles(
    conn: &mut PgConnection,
    limit: i64,
    system_id: Option<i64>,
) -> QueryResult<Vec<DbBattle>> {
    let mut query = battles_dsl::battles.into_boxed();

    if let Some(system_id) = system_id {
        query = query.filter(battles_dsl::system_id.eq(system_id));
    }

    query
        .order_by((battles_dsl::start_time.desc(), battles_dsl::id.desc()))
        .limit(limit)
        .select(DbBattle::as_select())
        .get_results(conn)
}

pub fn battle_by_id(conn: &mut PgConnection, id: Uuid) -> QueryResult<Option<DbBattle>> {
    battles_dsl::battles
        .find(id)
        .select(DbBattle::as_select())
        .get_result(conn)
        .optional()
}

pub fn battle_events_for(
    conn: &mut PgConnection,
    battle_id: Uuid,
) -> QueryResult<Vec<DbBattleEvent>> {
    battle_events_dsl::battle_events
        .filter(battle_events_dsl::battle_id.eq(battle_id))
        .order_by((
            battle_events_dsl::occurred_at.asc(),
            battle_events_dsl::event_id.asc(),
        ))
        .select(DbBattleEvent::as_select())
        .get_results(conn)
}

pub fn battle_participants_for(
    conn: &mut PgConnection,
    battle_id: Uuid,
) -> QueryResult<Vec<DbBattleParticipant>> {
    battle_participants_dsl::battle_participants
        .filter(battle_participants_dsl::battle_id.eq(battle_id))
        .order_by(battle_participants_dsl::character_id.asc())
        .select(DbBattleParticipant::as_select())
        .get_results(conn)
}

/// Operator-initiated do-over: atomically delete every battle overlapping
/// the range (attachments cascade) and clear the processed markers on the
/// affected events so the next clusterer tick re-examines them. The reset
/// window is widened to cover the full span of every deleted battle, so no
/// event is left attached to nothing.
pub fn recluster(
    conn: &mut PgConnection,
    from: NaiveDateTime,
    to: NaiveDateTime,
) -> QueryResult<(usize, usize)> {
    conn.transaction(|conn| {
        let overlapping = battles_dsl::battles
            .filter(battles_dsl::start_time.le(to))
            .filter(battles_dsl::end_time.ge(from));

        let span: (Option<NaiveDateTime>, Option<NaiveDateTime>) = overlapping
            .select((min(battles_dsl::start_time), max(battles_dsl::end_time)))
            .get_result(conn)?;

        let reset_from = span.0.map_or(from, |start| start.min(from));
        let reset_to = span.1.map_or(to, |end| end.max(to));

        let battles_deleted = diesel::delete(
            battles_dsl::battles
                .filter(battles_dsl::start_time.le(to))
                .filter(battles_dsl::end_time.ge(from)),
        )
        .execute(conn)?;

        let events_reset = diesel::update(
            events_dsl::events
                .filter(events_dsl::occurred_at.ge(reset_from))
                .filter(events_dsl::occurred_at.le(reset_to)),
        )
        .set((
            events_dsl::processed_at.eq(None::<NaiveDateTime>),
            events_dsl::battle_id.eq(None::<Uuid>),
        ))
        .execute(conn)?;

        Ok((battles_deleted, events_reset))
    })
}
