use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

#[derive(Insertable)]
#[diesel(table_name = crate::data_schema::data::events)]
#[diesel(treat_none_as_default_value = false)]
pub struct NewEvent<'a> {
    pub event_id: i64,
    pub system_id: i64,
    pub space_class: &'a str,
    pub security_class: &'a str,
    pub occurred_at: NaiveDateTime,
    pub victim_character_id: Option<i64>,
    pub victim_corp_id: Option<i64>,
    pub victim_alliance_id: Option<i64>,
    pub victim_ship_type_id: Option<i64>,
    pub attacker_character_ids: Vec<Option<i64>>,
    pub attacker_corp_ids: Vec<Option<i64>>,
    pub attacker_alliance_ids: Vec<Option<i64>>,
    pub isk_value: Option<i64>,
    pub zkb_hash: Option<&'a str>,
    pub source_url: &'a str,
    pub fetched_at: NaiveDateTime,
}

#[derive(Debug, Clone, Identifiable, Queryable, Selectable)]
#[diesel(table_name = crate::data_schema::data::events)]
#[diesel(primary_key(event_id))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbEvent {
    pub event_id: i64,
    pub system_id: i64,
    pub space_class: String,
    pub security_class: String,
    pub occurred_at: NaiveDateTime,
    pub victim_character_id: Option<i64>,
    pub victim_corp_id: Option<i64>,
    pub victim_alliance_id: Option<i64>,
    pub victim_ship_type_id: Option<i64>,
    pub attacker_character_ids: Vec<Option<i64>>,
    pub attacker_corp_ids: Vec<Option<i64>>,
    pub attacker_alliance_ids: Vec<Option<i64>>,
    pub isk_value: Option<i64>,
    pub zkb_hash: Option<String>,
    pub source_url: String,
    pub fetched_at: NaiveDateTime,
    pub processed_at: Option<NaiveDateTime>,
    pub battle_id: Option<Uuid>,
}

impl DbEvent {
    // Array columns can't guarantee element non-nullability at the Postgres
    // layer, so the mapped type is Vec<Option<i64>> even though no element
    // is ever null in practice.
    pub fn attacker_characters(&self) -> impl Iterator<Item = i64> + '_ {
        self.attacker_character_ids.iter().copied().flatten()
    }

    pub fn attacker_corps(&self) -> impl Iterator<Item = i64> + '_ {
        self.attacker_corp_ids.iter().copied().flatten()
    }

    pub fn attacker_alliances(&self) -> impl Iterator<Item = i64> + '_ {
        self.attacker_alliance_ids.iter().copied().flatten()
    }
}

#[derive(Insertable)]
#[diesel(table_name = crate::data_schema::data::enrichments)]
#[diesel(treat_none_as_default_value = false)]
pub struct NewEnrichment<'a> {
    pub event_id: i64,
    pub status: &'a str,
    pub fetched_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Identifiable, Queryable, Selectable)]
#[diesel(table_name = crate::data_schema::data::enrichments)]
#[diesel(primary_key(event_id))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbEnrichment {
    pub event_id: i64,
    pub status: String,
    pub payload: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempts: i32,
    pub retry_at: Option<NaiveDateTime>,
    pub fetched_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = crate::data_schema::data::battles)]
#[diesel(treat_none_as_default_value = false)]
pub struct NewBattle<'a> {
    pub id: Uuid,
    pub system_id: i64,
    pub space_class: &'a str,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub total_kills: i32,
    pub total_isk_destroyed: i64,
    pub external_reference_url: Option<&'a str>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Identifiable, Queryable, Selectable)]
#[diesel(table_name = crate::data_schema::data::battles)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbBattle {
    pub id: Uuid,
    pub system_id: i64,
    pub space_class: String,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub total_kills: i32,
    pub total_isk_destroyed: i64,
    pub external_reference_url: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = crate::data_schema::data::battle_events)]
#[diesel(treat_none_as_default_value = false)]
pub struct NewBattleEvent {
    pub battle_id: Uuid,
    pub event_id: i64,
    pub victim_alliance_id: Option<i64>,
    pub attacker_alliance_ids: Vec<Option<i64>>,
    pub isk_value: Option<i64>,
    pub occurred_at: NaiveDateTime,
    pub side_id: Option<i64>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::data_schema::data::battle_events)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbBattleEvent {
    pub battle_id: Uuid,
    pub event_id: i64,
    pub victim_alliance_id: Option<i64>,
    pub attacker_alliance_ids: Vec<Option<i64>>,
    pub isk_value: Option<i64>,
    pub occurred_at: NaiveDateTime,
    pub side_id: Option<i64>,
}

#[derive(Insertable)]
#[diesel(table_name = crate::data_schema::data::battle_participants)]
#[diesel(treat_none_as_default_value = false)]
pub struct NewBattleParticipant {
    pub battle_id: Uuid,
    pub character_id: i64,
    pub alliance_id: Option<i64>,
    pub corp_id: Option<i64>,
    pub ship_type_id: Option<i64>,
    pub side_id: Option<i64>,
    pub is_victim: bool,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::data_schema::data::battle_participants)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbBattleParticipant {
    pub battle_id: Uuid,
    pub character_id: i64,
    pub alliance_id: Option<i64>,
    pub corp_id: Option<i64>,
    pub ship_type_id: Option<i64>,
    pub side_id: Option<i64>,
    pub is_victim: bool,
}

#[derive(Debug, Clone, Identifiable, Queryable, Selectable)]
#[diesel(table_name = crate::data_schema::data::ruleset)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbRuleset {
    pub id: i32,
    pub min_pilots: i32,
    pub tracked_alliance_ids: Vec<Option<i64>>,
    pub tracked_corp_ids: Vec<Option<i64>>,
    pub tracked_system_ids: Vec<Option<i64>>,
    pub tracked_security_classes: Vec<Option<String>>,
    pub ignore_unlisted: bool,
    pub updated_at: NaiveDateTime,
}
