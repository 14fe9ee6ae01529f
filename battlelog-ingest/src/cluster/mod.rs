//! The clusterer service: on an interval, sweep unprocessed events past the
//! settling delay, run them through the engine, and persist each plan in
//! its own transaction.

pub mod engine;

use std::time::Duration;

use battlelog_db::db;
use battlelog_db::models::{DbEvent, NewBattle, NewBattleEvent, NewBattleParticipant};
use battlelog_db::ruleset::RulesetHandle;
use battlelog_db::{PgConnection, QueryError, is_connection_error};
use chrono::{TimeDelta, Utc};
use itertools::Itertools;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::ClusterConfig;
use crate::service::{ServiceError, establish_with_retries};
use engine::{BattlePlan, ClusterEvent, ClusterParams};

pub async fn run_clusterer(
    url: String,
    ruleset: RulesetHandle,
    config: ClusterConfig,
    store_retry_window: Duration,
    cancel: CancellationToken,
) -> Result<(), ServiceError> {
    let mut conn = match establish_with_retries(&url, store_retry_window, &cancel).await {
        Ok(conn) => conn,
        Err(ServiceError::Cancelled) => return Ok(()),
        Err(err) => return Err(err),
    };
    db::set_statement_timeout(&mut conn, config.transaction_timeout_seconds)?;

    let mut timer = tokio::time::interval(Duration::from_millis(config.interval_ms.max(1)));
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!("Clusterer is running");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {}
        }

        match run_tick(&mut conn, &ruleset, &config) {
            Ok(()) => {}
            Err(err) if is_connection_error(&err) => {
                warn!("Clusterer lost the store connection: {err}");
                conn = match establish_with_retries(&url, store_retry_window, &cancel).await {
                    Ok(conn) => conn,
                    Err(ServiceError::Cancelled) => break,
                    Err(err) => return Err(err),
                };
                db::set_statement_timeout(&mut conn, config.transaction_timeout_seconds)?;
            }
            Err(err) => return Err(err.into()),
        }
    }

    info!("Clusterer is exiting");
    Ok(())
}

fn run_tick(
    conn: &mut PgConnection,
    ruleset: &RulesetHandle,
    config: &ClusterConfig,
) -> Result<(), QueryError> {
    let cutoff = (Utc::now() - TimeDelta::minutes(config.delay_minutes)).naive_utc();
    let batch = db::unprocessed_batch(conn, cutoff, config.batch_size)?;
    if batch.is_empty() {
        debug!("No events are ready for clustering");
        return Ok(());
    }

    let params = ClusterParams {
        window: TimeDelta::minutes(config.window_minutes),
        gap_max: TimeDelta::minutes(config.gap_max_minutes),
        min_kills: effective_min_kills(config, ruleset),
    };

    let batch_len = batch.len();
    let events = batch.into_iter().map(cluster_event_from_row).collect_vec();
    let outcome = engine::cluster(events, &params);

    let now = Utc::now().naive_utc();
    let mut battles_created = 0;
    for plan in &outcome.battles {
        // One transaction per plan; a failure leaves the plan's events
        // unprocessed and the next tick retries them.
        match persist_plan(conn, plan, now) {
            Ok(()) => {
                battles_created += 1;
                info!(
                    "Battle {} in system {}: {} kills between {} and {}",
                    plan.battle.id,
                    plan.battle.system_id,
                    plan.battle.total_kills,
                    plan.battle.start_time,
                    plan.battle.end_time,
                );
            }
            Err(err) if is_connection_error(&err) => return Err(err),
            Err(err) => {
                warn!(
                    "Couldn't persist a battle plan for system {}: {err}. Its events stay \
                    unprocessed for the next tick.",
                    plan.battle.system_id,
                );
            }
        }
    }

    if !outcome.ignored.is_empty() {
        db::mark_events_ignored(conn, &outcome.ignored, now)?;
    }

    info!(
        "Clustered {} events into {} battles ({} ignored)",
        batch_len,
        battles_created,
        outcome.ignored.len(),
    );

    Ok(())
}

fn effective_min_kills(config: &ClusterConfig, ruleset: &RulesetHandle) -> usize {
    match config.min_kills {
        Some(min_kills) => min_kills.max(1) as usize,
        None => ruleset.current().min_pilots.max(1) as usize,
    }
}

fn cluster_event_from_row(row: DbEvent) -> ClusterEvent {
    ClusterEvent {
        event_id: row.event_id,
        system_id: row.system_id,
        occurred_at: row.occurred_at.and_utc(),
        victim_character_id: row.victim_character_id,
        victim_corp_id: row.victim_corp_id,
        victim_alliance_id: row.victim_alliance_id,
        victim_ship_type_id: row.victim_ship_type_id,
        attacker_character_ids: row.attacker_characters().collect_vec(),
        attacker_alliance_ids: row.attacker_alliances().collect_vec(),
        isk_value: row.isk_value,
    }
}

fn persist_plan(
    conn: &mut PgConnection,
    plan: &BattlePlan,
    now: chrono::NaiveDateTime,
) -> Result<(), QueryError> {
    let space_class = plan.battle.space_class.to_string();
    let battle = NewBattle {
        id: plan.battle.id,
        system_id: plan.battle.system_id,
        space_class: &space_class,
        start_time: plan.battle.start_time.naive_utc(),
        end_time: plan.battle.end_time.naive_utc(),
        total_kills: plan.battle.total_kills as i32,
        total_isk_destroyed: plan.battle.total_isk_destroyed,
        external_reference_url: Some(plan.battle.external_reference_url.as_str()),
        created_at: now,
    };

    let attachments = plan
        .attachments
        .iter()
        .map(|a| NewBattleEvent {
            battle_id: plan.battle.id,
            event_id: a.event_id,
            victim_alliance_id: a.victim_alliance_id,
            attacker_alliance_ids: a.attacker_alliance_ids.iter().map(|id| Some(*id)).collect(),
            isk_value: a.isk_value,
            occurred_at: a.occurred_at.naive_utc(),
            side_id: None,
        })
        .collect_vec();

    let participants = plan
        .participants
        .iter()
        .map(|p| NewBattleParticipant {
            battle_id: plan.battle.id,
            character_id: p.character_id,
            alliance_id: p.alliance_id,
            corp_id: p.corp_id,
            ship_type_id: p.ship_type_id,
            side_id: None,
            is_victim: p.is_victim,
        })
        .collect_vec();

    db::apply_battle_plan(
        conn,
        &battle,
        &attachments,
        &participants,
        &plan.event_ids(),
        now,
    )
}
