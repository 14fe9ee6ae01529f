//! The clustering engine: a pure function from a batch of events to battle
//! plans. No I/O happens here; the service layer owns persistence.
//!
//! Events are partitioned by system, swept in time order, and grouped while
//! consecutive events stay within the gap limit and the whole group stays
//! within the window. Groups below the minimum size are reported as ignored
//! so their events can be marked processed without a battle.

use std::collections::BTreeMap;

use battlelog_db::space::SpaceClass;
use chrono::{DateTime, TimeDelta, Utc};
use hashbrown::HashMap;
use itertools::Itertools;
use uuid::Uuid;

const RELATED_URL_HOST: &str = "https://zkillboard.com";

#[derive(Debug, Clone)]
pub struct ClusterParams {
    /// Maximum span of a single battle.
    pub window: TimeDelta,
    /// Maximum silence between consecutive events inside one battle. The
    /// comparison is a closed interval: a gap of exactly this much still
    /// extends the battle.
    pub gap_max: TimeDelta,
    /// Minimum events per battle to emit.
    pub min_kills: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            window: TimeDelta::minutes(60),
            gap_max: TimeDelta::minutes(20),
            min_kills: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterEvent {
    pub event_id: i64,
    pub system_id: i64,
    pub occurred_at: DateTime<Utc>,
    pub victim_character_id: Option<i64>,
    pub victim_corp_id: Option<i64>,
    pub victim_alliance_id: Option<i64>,
    pub victim_ship_type_id: Option<i64>,
    pub attacker_character_ids: Vec<i64>,
    pub attacker_alliance_ids: Vec<i64>,
    pub isk_value: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct PlannedBattle {
    pub id: Uuid,
    pub system_id: i64,
    pub space_class: SpaceClass,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_kills: usize,
    pub total_isk_destroyed: i64,
    pub external_reference_url: String,
}

#[derive(Debug, Clone)]
pub struct PlannedAttachment {
    pub event_id: i64,
    pub victim_alliance_id: Option<i64>,
    pub attacker_alliance_ids: Vec<i64>,
    pub isk_value: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PlannedParticipant {
    pub character_id: i64,
    pub alliance_id: Option<i64>,
    pub corp_id: Option<i64>,
    pub ship_type_id: Option<i64>,
    pub is_victim: bool,
}

#[derive(Debug, Clone)]
pub struct BattlePlan {
    pub battle: PlannedBattle,
    pub attachments: Vec<PlannedAttachment>,
    pub participants: Vec<PlannedParticipant>,
}

impl BattlePlan {
    pub fn event_ids(&self) -> Vec<i64> {
        self.attachments.iter().map(|a| a.event_id).collect_vec()
    }
}

#[derive(Debug, Default)]
pub struct ClusterOutcome {
    pub battles: Vec<BattlePlan>,
    pub ignored: Vec<i64>,
}

pub fn cluster(events: Vec<ClusterEvent>, params: &ClusterParams) -> ClusterOutcome {
    // BTreeMap so the sweep visits systems in a stable order.
    let mut by_system: BTreeMap<i64, Vec<ClusterEvent>> = BTreeMap::new();
    for event in events {
        by_system.entry(event.system_id).or_default().push(event);
    }

    let mut outcome = ClusterOutcome::default();

    for (system_id, mut events) in by_system {
        events.sort_by_key(|e| (e.occurred_at, e.event_id));

        let mut current: Vec<ClusterEvent> = Vec::new();
        for event in events {
            let extends = match (current.first(), current.last()) {
                (Some(first), Some(last)) => {
                    event.occurred_at - last.occurred_at <= params.gap_max
                        && event.occurred_at - first.occurred_at <= params.window
                }
                _ => true,
            };

            if !extends {
                finalize(system_id, std::mem::take(&mut current), params, &mut outcome);
            }
            current.push(event);
        }
        finalize(system_id, current, params, &mut outcome);
    }

    outcome
}

fn finalize(
    system_id: i64,
    events: Vec<ClusterEvent>,
    params: &ClusterParams,
    outcome: &mut ClusterOutcome,
) {
    if events.is_empty() {
        return;
    }

    if events.len() < params.min_kills {
        outcome.ignored.extend(events.iter().map(|e| e.event_id));
        return;
    }

    // `events` arrives sorted by (occurred_at, event_id), which is what
    // makes the latest-wins participant merge deterministic.
    let start_time = events
        .first()
        .map(|e| e.occurred_at)
        .expect("non-empty cluster has a first event");
    let end_time = events
        .last()
        .map(|e| e.occurred_at)
        .expect("non-empty cluster has a last event");

    let total_isk_destroyed = events
        .iter()
        .fold(0i64, |sum, e| sum.saturating_add(e.isk_value.unwrap_or(0)));

    let mut participants: HashMap<i64, PlannedParticipant> = HashMap::new();
    for event in &events {
        // Attackers only contribute their identity; the event model's
        // deduplicated attacker arrays don't preserve which alliance or
        // corp each attacker flew under.
        for character_id in &event.attacker_character_ids {
            participants
                .entry(*character_id)
                .or_insert_with(|| PlannedParticipant {
                    character_id: *character_id,
                    alliance_id: None,
                    corp_id: None,
                    ship_type_id: None,
                    is_victim: false,
                });
        }

        // The victim carries full detail and overwrites. Iteration order
        // makes the latest event win, with ties on occurred_at broken by
        // the higher event_id.
        if let Some(character_id) = event.victim_character_id {
            let participant = participants
                .entry(character_id)
                .or_insert_with(|| PlannedParticipant {
                    character_id,
                    alliance_id: None,
                    corp_id: None,
                    ship_type_id: None,
                    is_victim: false,
                });
            participant.alliance_id = event.victim_alliance_id;
            participant.corp_id = event.victim_corp_id;
            participant.ship_type_id = event.victim_ship_type_id;
            participant.is_victim = true;
        }
    }

    let participants = participants
        .into_values()
        .sorted_by_key(|p| p.character_id)
        .collect_vec();

    let attachments = events
        .iter()
        .map(|e| PlannedAttachment {
            event_id: e.event_id,
            victim_alliance_id: e.victim_alliance_id,
            attacker_alliance_ids: e.attacker_alliance_ids.clone(),
            isk_value: e.isk_value,
            occurred_at: e.occurred_at,
        })
        .collect_vec();

    let battle = PlannedBattle {
        id: Uuid::new_v4(),
        system_id,
        space_class: SpaceClass::of_system(system_id),
        start_time,
        end_time,
        total_kills: events.len(),
        total_isk_destroyed,
        external_reference_url: format!(
            "{RELATED_URL_HOST}/related/{system_id}/{}/",
            start_time.format("%Y%m%d%H%M"),
        ),
    };

    outcome.battles.push(BattlePlan {
        battle,
        attachments,
        participants,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SYSTEM: i64 = 30000142;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + TimeDelta::minutes(minutes)
    }

    fn event(id: i64, minutes: i64) -> ClusterEvent {
        ClusterEvent {
            event_id: id,
            system_id: SYSTEM,
            occurred_at: t(minutes),
            victim_character_id: Some(1000 + id),
            victim_corp_id: Some(2000 + id),
            victim_alliance_id: Some(3000 + id),
            victim_ship_type_id: Some(587),
            attacker_character_ids: vec![1],
            attacker_alliance_ids: vec![90],
            isk_value: Some(1_000_000),
        }
    }

    fn params(window: i64, gap: i64, min_kills: usize) -> ClusterParams {
        ClusterParams {
            window: TimeDelta::minutes(window),
            gap_max: TimeDelta::minutes(gap),
            min_kills,
        }
    }

    #[test]
    fn five_close_events_form_one_battle() {
        let events = (0..5).map(|i| event(i, i)).collect_vec();
        let outcome = cluster(events, &params(60, 2, 3));

        assert_eq!(outcome.battles.len(), 1);
        assert!(outcome.ignored.is_empty());

        let battle = &outcome.battles[0].battle;
        assert_eq!(battle.total_kills, 5);
        assert_eq!(battle.start_time, t(0));
        assert_eq!(battle.end_time, t(4));
        assert_eq!(battle.system_id, SYSTEM);
        assert_eq!(battle.total_isk_destroyed, 5_000_000);
    }

    #[test]
    fn single_event_below_min_kills_is_ignored() {
        let outcome = cluster(vec![event(7, 0)], &params(60, 20, 2));

        assert!(outcome.battles.is_empty());
        assert_eq!(outcome.ignored, vec![7]);
    }

    #[test]
    fn cluster_of_exactly_min_kills_is_emitted() {
        let events = (0..3).map(|i| event(i, i)).collect_vec();
        let outcome = cluster(events, &params(60, 20, 3));
        assert_eq!(outcome.battles.len(), 1);

        let events = (0..2).map(|i| event(i, i)).collect_vec();
        let outcome = cluster(events, &params(60, 20, 3));
        assert!(outcome.battles.is_empty());
        assert_eq!(outcome.ignored.len(), 2);
    }

    #[test]
    fn gap_of_exactly_gap_max_extends_the_battle() {
        let events = vec![event(1, 0), event(2, 20)];
        let outcome = cluster(events, &params(60, 20, 1));
        assert_eq!(outcome.battles.len(), 1);
        assert_eq!(outcome.battles[0].battle.total_kills, 2);
    }

    #[test]
    fn gap_beyond_gap_max_splits_the_battle() {
        let events = vec![event(1, 0), event(2, 21)];
        let outcome = cluster(events, &params(60, 20, 1));
        assert_eq!(outcome.battles.len(), 2);
    }

    #[test]
    fn window_bounds_a_battle_even_with_small_gaps() {
        // Events every 15 minutes never violate the gap, but the seventh
        // falls outside the hour window and starts a new battle.
        let events = (0..7).map(|i| event(i, i * 15)).collect_vec();
        let outcome = cluster(events, &params(60, 20, 1));

        assert_eq!(outcome.battles.len(), 2);
        assert_eq!(outcome.battles[0].battle.total_kills, 5);
        assert_eq!(outcome.battles[1].battle.total_kills, 2);
    }

    #[test]
    fn systems_partition_independently() {
        let mut other = event(10, 0);
        other.system_id = SYSTEM + 1;
        let events = vec![event(1, 0), event(2, 1), other];

        let outcome = cluster(events, &params(60, 20, 1));
        assert_eq!(outcome.battles.len(), 2);

        let systems = outcome
            .battles
            .iter()
            .map(|p| p.battle.system_id)
            .collect_vec();
        assert_eq!(systems, vec![SYSTEM, SYSTEM + 1]);
    }

    #[test]
    fn null_isk_counts_as_zero() {
        let mut a = event(1, 0);
        a.isk_value = None;
        let b = event(2, 1);

        let outcome = cluster(vec![a, b], &params(60, 20, 1));
        assert_eq!(outcome.battles[0].battle.total_isk_destroyed, 1_000_000);
    }

    #[test]
    fn totals_match_attachments() {
        let events = (0..4).map(|i| event(i, i)).collect_vec();
        let outcome = cluster(events, &params(60, 20, 1));

        let plan = &outcome.battles[0];
        assert_eq!(plan.battle.total_kills, plan.attachments.len());
        let sum: i64 = plan
            .attachments
            .iter()
            .map(|a| a.isk_value.unwrap_or(0))
            .sum();
        assert_eq!(plan.battle.total_isk_destroyed, sum);
    }

    #[test]
    fn victimless_event_with_no_attackers_still_clusters() {
        let mut a = event(1, 0);
        a.victim_character_id = None;
        a.attacker_character_ids = vec![];

        let outcome = cluster(vec![a], &params(60, 20, 1));
        assert_eq!(outcome.battles.len(), 1);
        assert!(outcome.battles[0].participants.is_empty());
    }

    #[test]
    fn empty_attacker_list_yields_the_victim_as_sole_participant() {
        let mut a = event(1, 0);
        a.attacker_character_ids = vec![];

        let outcome = cluster(vec![a], &params(60, 20, 1));
        let participants = &outcome.battles[0].participants;
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].character_id, 1001);
        assert!(participants[0].is_victim);
        assert_eq!(participants[0].ship_type_id, Some(587));
    }

    #[test]
    fn latest_victim_detail_wins_with_event_id_tiebreak() {
        // The same character dies twice at the same instant; the higher
        // event_id carries the detail that sticks.
        let mut first = event(1, 0);
        first.victim_character_id = Some(5);
        first.victim_ship_type_id = Some(100);
        let mut second = event(2, 0);
        second.victim_character_id = Some(5);
        second.victim_ship_type_id = Some(200);

        let outcome = cluster(vec![second.clone(), first], &params(60, 20, 1));
        let participant = outcome.battles[0]
            .participants
            .iter()
            .find(|p| p.character_id == 5)
            .expect("victim should be a participant");
        assert_eq!(participant.ship_type_id, Some(200));
    }

    #[test]
    fn attacker_appearance_never_clears_victim_detail() {
        // Dies at t0, then appears as an attacker at t1: keeps the victim
        // detail and stays flagged as a victim.
        let mut death = event(1, 0);
        death.victim_character_id = Some(5);
        death.victim_alliance_id = Some(31);
        let mut revenge = event(2, 1);
        revenge.victim_character_id = Some(6);
        revenge.attacker_character_ids = vec![5];

        let outcome = cluster(vec![death, revenge], &params(60, 20, 1));
        let participant = outcome.battles[0]
            .participants
            .iter()
            .find(|p| p.character_id == 5)
            .expect("character 5 should be a participant");
        assert!(participant.is_victim);
        assert_eq!(participant.alliance_id, Some(31));
    }

    #[test]
    fn outcome_is_deterministic_modulo_battle_ids() {
        let events = (0..20)
            .map(|i| event(i, (i * 7) % 90))
            .collect_vec();

        let a = cluster(events.clone(), &params(60, 20, 2));
        let b = cluster(events, &params(60, 20, 2));

        assert_eq!(a.ignored, b.ignored);
        assert_eq!(a.battles.len(), b.battles.len());
        for (left, right) in a.battles.iter().zip(&b.battles) {
            assert_eq!(left.event_ids(), right.event_ids());
            assert_eq!(left.battle.start_time, right.battle.start_time);
            assert_eq!(left.battle.end_time, right.battle.end_time);
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_events() -> impl Strategy<Value = Vec<ClusterEvent>> {
            prop::collection::vec(
                (0i64..3, 0i64..300, any::<bool>(), 0i64..2_000_000),
                0..60,
            )
            .prop_map(|raw| {
                raw.into_iter()
                    .enumerate()
                    .map(|(index, (system, minutes, has_isk, isk))| {
                        let mut e = event(index as i64, minutes);
                        e.system_id = SYSTEM + system;
                        e.isk_value = has_isk.then_some(isk);
                        e
                    })
                    .collect_vec()
            })
        }

        proptest! {
            #[test]
            fn every_event_lands_exactly_once(events in arb_events()) {
                let input_ids = events.iter().map(|e| e.event_id).sorted().collect_vec();
                let outcome = cluster(events, &params(60, 20, 3));

                let mut output_ids = outcome.ignored.clone();
                for plan in &outcome.battles {
                    output_ids.extend(plan.event_ids());
                }
                output_ids.sort();

                prop_assert_eq!(input_ids, output_ids);
            }

            #[test]
            fn emitted_battles_respect_all_bounds(events in arb_events()) {
                let p = params(60, 20, 3);
                let outcome = cluster(events, &p);

                for plan in &outcome.battles {
                    let battle = &plan.battle;
                    prop_assert!(battle.total_kills >= p.min_kills);
                    prop_assert_eq!(battle.total_kills, plan.attachments.len());
                    prop_assert!(battle.start_time <= battle.end_time);
                    prop_assert!(battle.end_time - battle.start_time <= p.window);

                    let times = plan
                        .attachments
                        .iter()
                        .map(|a| a.occurred_at)
                        .collect_vec();
                    prop_assert_eq!(battle.start_time, *times.iter().min().unwrap());
                    prop_assert_eq!(battle.end_time, *times.iter().max().unwrap());
                    for pair in times.windows(2) {
                        prop_assert!(pair[1] - pair[0] <= p.gap_max);
                    }

                    let isk: i64 = plan
                        .attachments
                        .iter()
                        .map(|a| a.isk_value.unwrap_or(0))
                        .sum();
                    prop_assert_eq!(battle.total_isk_destroyed, isk);
                }
            }

            #[test]
            fn battles_never_mix_systems(events in arb_events()) {
                let outcome = cluster(events.clone(), &params(60, 20, 1));
                let systems: hashbrown::HashMap<i64, i64> = events
                    .iter()
                    .map(|e| (e.event_id, e.system_id))
                    .collect();

                for plan in &outcome.battles {
                    for attachment in &plan.attachments {
                        prop_assert_eq!(
                            systems[&attachment.event_id],
                            plan.battle.system_id
                        );
                    }
                }
            }
        }
    }
}
