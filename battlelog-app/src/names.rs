//! The name enricher: the single place where entity IDs become names.
//! Every outgoing DTO is built here from its stored rows plus one batched
//! name lookup; handlers never do their own ID-to-name projection.

use battlelog_db::models::{DbBattle, DbBattleEvent, DbBattleParticipant, DbEvent};
use esi::{NameEntry, NameResolver};
use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use log::warn;
use serde::Serialize;

use crate::api::killmails::{ApiAttackers, ApiKillmail, ApiVictim};
use crate::api::battles::{ApiBattle, ApiBattleDetail, ApiBattleEvent, ApiBattleParticipant};

#[derive(Debug, Clone, Serialize)]
pub struct ApiEntityRef {
    #[serde(with = "crate::api::id_string")]
    pub id: i64,
    pub name: Option<String>,
}

/// The resolved names for one response. Lookups that failed resolve to
/// bare IDs; a feed with naked IDs beats a feed that 500s because the name
/// service hiccuped.
pub struct NameBook {
    names: HashMap<i64, NameEntry>,
}

impl NameBook {
    pub fn entity(&self, id: i64) -> ApiEntityRef {
        ApiEntityRef {
            id,
            name: self.names.get(&id).map(|entry| entry.name.clone()),
        }
    }

    pub fn entity_opt(&self, id: Option<i64>) -> Option<ApiEntityRef> {
        id.map(|id| self.entity(id))
    }
}

async fn resolve<R: NameResolver>(resolver: &R, wanted: HashSet<i64>) -> NameBook {
    let ids = wanted
        .into_iter()
        .filter(|id| *id > 0)
        .sorted()
        .collect_vec();

    let names = if ids.is_empty() {
        HashMap::new()
    } else {
        match resolver.resolve_names(&ids).await {
            Ok(names) => names,
            Err(err) => {
                warn!("Name resolution failed; serving bare IDs: {err}");
                HashMap::new()
            }
        }
    };

    NameBook { names }
}

pub async fn enrich_killmails<R: NameResolver>(
    resolver: &R,
    rows: Vec<DbEvent>,
) -> Vec<ApiKillmail> {
    let mut wanted = HashSet::new();
    for row in &rows {
        wanted.insert(row.system_id);
        wanted.extend(row.victim_character_id);
        wanted.extend(row.victim_corp_id);
        wanted.extend(row.victim_alliance_id);
        wanted.extend(row.victim_ship_type_id);
        wanted.extend(row.attacker_characters());
        wanted.extend(row.attacker_corps());
        wanted.extend(row.attacker_alliances());
    }

    let book = resolve(resolver, wanted).await;
    rows.into_iter()
        .map(|row| killmail_dto(&book, row))
        .collect_vec()
}

fn killmail_dto(book: &NameBook, row: DbEvent) -> ApiKillmail {
    ApiKillmail {
        event_id: row.event_id,
        system: book.entity(row.system_id),
        space_class: row.space_class.clone(),
        security_class: row.security_class.clone(),
        occurred_at: row.occurred_at.and_utc(),
        victim: ApiVictim {
            character: book.entity_opt(row.victim_character_id),
            corporation: book.entity_opt(row.victim_corp_id),
            alliance: book.entity_opt(row.victim_alliance_id),
            ship: book.entity_opt(row.victim_ship_type_id),
        },
        attackers: ApiAttackers {
            characters: row.attacker_characters().map(|id| book.entity(id)).collect(),
            corporations: row.attacker_corps().map(|id| book.entity(id)).collect(),
            alliances: row.attacker_alliances().map(|id| book.entity(id)).collect(),
        },
        isk_value: row.isk_value,
        source_url: row.source_url,
        battle_id: row.battle_id,
    }
}

pub async fn enrich_battles<R: NameResolver>(
    resolver: &R,
    battles: Vec<DbBattle>,
) -> Vec<ApiBattle> {
    let wanted = battles.iter().map(|b| b.system_id).collect();
    let book = resolve(resolver, wanted).await;
    battles
        .into_iter()
        .map(|battle| battle_dto(&book, battle))
        .collect_vec()
}

fn battle_dto(book: &NameBook, battle: DbBattle) -> ApiBattle {
    ApiBattle {
        id: battle.id,
        system: book.entity(battle.system_id),
        space_class: battle.space_class,
        start_time: battle.start_time.and_utc(),
        end_time: battle.end_time.and_utc(),
        total_kills: battle.total_kills,
        total_isk_destroyed: battle.total_isk_destroyed,
        external_reference_url: battle.external_reference_url,
        created_at: battle.created_at.and_utc(),
    }
}

pub async fn enrich_battle_detail<R: NameResolver>(
    resolver: &R,
    battle: DbBattle,
    events: Vec<DbBattleEvent>,
    participants: Vec<DbBattleParticipant>,
) -> ApiBattleDetail {
    let mut wanted = HashSet::new();
    wanted.insert(battle.system_id);
    for event in &events {
        wanted.extend(event.victim_alliance_id);
        wanted.extend(event.attacker_alliance_ids.iter().copied().flatten());
    }
    for participant in &participants {
        wanted.insert(participant.character_id);
        wanted.extend(participant.alliance_id);
        wanted.extend(participant.corp_id);
        wanted.extend(participant.ship_type_id);
    }

    let book = resolve(resolver, wanted).await;

    ApiBattleDetail {
        battle: battle_dto(&book, battle),
        events: events
            .into_iter()
            .map(|event| ApiBattleEvent {
                event_id: event.event_id,
                victim_alliance: book.entity_opt(event.victim_alliance_id),
                attacker_alliances: event
                    .attacker_alliance_ids
                    .iter()
                    .copied()
                    .flatten()
                    .map(|id| book.entity(id))
                    .collect_vec(),
                isk_value: event.isk_value,
                occurred_at: event.occurred_at.and_utc(),
                side_id: event.side_id,
            })
            .collect_vec(),
        participants: participants
            .into_iter()
            .map(|participant| ApiBattleParticipant {
                character: book.entity(participant.character_id),
                corporation: book.entity_opt(participant.corp_id),
                alliance: book.entity_opt(participant.alliance_id),
                ship: book.entity_opt(participant.ship_type_id),
                side_id: participant.side_id,
                is_victim: participant.is_victim,
            })
            .collect_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use esi::{EsiError, NameCategory};

    struct FakeResolver {
        names: HashMap<i64, NameEntry>,
    }

    impl NameResolver for FakeResolver {
        async fn resolve_names(
            &self,
            ids: &[i64],
        ) -> Result<HashMap<i64, NameEntry>, EsiError> {
            Ok(ids
                .iter()
                .filter_map(|id| self.names.get(id).map(|entry| (*id, entry.clone())))
                .collect())
        }
    }

    struct FailingResolver;

    impl NameResolver for FailingResolver {
        async fn resolve_names(
            &self,
            _ids: &[i64],
        ) -> Result<HashMap<i64, NameEntry>, EsiError> {
            Err(EsiError::UpstreamHttp { status: 502 })
        }
    }

    fn event_row() -> DbEvent {
        DbEvent {
            event_id: 9001,
            system_id: 30000142,
            space_class: "normal".to_string(),
            security_class: "highsec".to_string(),
            occurred_at: chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
            victim_character_id: Some(11),
            victim_corp_id: Some(21),
            victim_alliance_id: None,
            victim_ship_type_id: Some(587),
            attacker_character_ids: vec![Some(12), Some(13)],
            attacker_corp_ids: vec![Some(22)],
            attacker_alliance_ids: vec![],
            isk_value: Some(750_000_000),
            zkb_hash: Some("abc".to_string()),
            source_url: "https://zkillboard.com/kill/9001/".to_string(),
            fetched_at: chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(12, 1, 0)
                .unwrap(),
            processed_at: None,
            battle_id: None,
        }
    }

    fn entry(name: &str, category: NameCategory) -> NameEntry {
        NameEntry {
            name: name.to_string(),
            category,
        }
    }

    #[tokio::test]
    async fn names_attach_to_every_id_carrying_field() {
        let resolver = FakeResolver {
            names: HashMap::from_iter([
                (30000142, entry("Jita", NameCategory::SolarSystem)),
                (11, entry("Pilot Eleven", NameCategory::Character)),
                (12, entry("Pilot Twelve", NameCategory::Character)),
                (587, entry("Rifter", NameCategory::InventoryType)),
            ]),
        };

        let items = enrich_killmails(&resolver, vec![event_row()]).await;
        let item = &items[0];

        assert_eq!(item.system.name.as_deref(), Some("Jita"));
        assert_eq!(
            item.victim.character.as_ref().unwrap().name.as_deref(),
            Some("Pilot Eleven"),
        );
        assert_eq!(
            item.victim.ship.as_ref().unwrap().name.as_deref(),
            Some("Rifter"),
        );
        assert_eq!(item.attackers.characters[0].name.as_deref(), Some("Pilot Twelve"));
        // Unresolvable IDs stay as bare references.
        assert_eq!(item.attackers.characters[1].name, None);
        assert!(item.victim.alliance.is_none());
    }

    #[tokio::test]
    async fn resolution_failure_degrades_to_bare_ids() {
        let items = enrich_killmails(&FailingResolver, vec![event_row()]).await;
        let item = &items[0];

        assert_eq!(item.event_id, 9001);
        assert_eq!(item.system.id, 30000142);
        assert_eq!(item.system.name, None);
    }
}
