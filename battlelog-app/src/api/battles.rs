use battlelog_db::db;
use chrono::{DateTime, Utc};
use esi::EsiClient;
use rocket::serde::json::Json;
use rocket::serde::uuid::Uuid;
use rocket::{FromForm, State, get};
use serde::Serialize;

use crate::api::ApiError;
use crate::names::{self, ApiEntityRef};
use crate::{AppConfig, Db};

#[derive(Debug, Clone, Serialize)]
pub struct ApiBattle {
    pub id: Uuid,
    pub system: ApiEntityRef,
    pub space_class: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_kills: i32,
    pub total_isk_destroyed: i64,
    pub external_reference_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiBattleEvent {
    #[serde(with = "crate::api::id_string")]
    pub event_id: i64,
    pub victim_alliance: Option<ApiEntityRef>,
    pub attacker_alliances: Vec<ApiEntityRef>,
    pub isk_value: Option<i64>,
    pub occurred_at: DateTime<Utc>,
    pub side_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiBattleParticipant {
    pub character: ApiEntityRef,
    pub corporation: Option<ApiEntityRef>,
    pub alliance: Option<ApiEntityRef>,
    pub ship: Option<ApiEntityRef>,
    pub side_id: Option<i64>,
    pub is_victim: bool,
}

#[derive(Debug, Serialize)]
pub struct ApiBattleDetail {
    #[serde(flatten)]
    pub battle: ApiBattle,
    pub events: Vec<ApiBattleEvent>,
    pub participants: Vec<ApiBattleParticipant>,
}

#[derive(Debug, Serialize)]
pub struct BattlePage {
    pub items: Vec<ApiBattle>,
    pub count: usize,
}

#[derive(Debug, FromForm)]
pub struct BattlesQuery {
    pub limit: Option<i64>,
    pub system_id: Option<i64>,
}

#[get("/battles?<query..>")]
pub async fn battles_list(
    query: BattlesQuery,
    db: Db,
    esi: &State<EsiClient>,
    config: &State<AppConfig>,
) -> Result<Json<BattlePage>, ApiError> {
    let limit = query.limit.unwrap_or(config.feed_default_limit);
    if limit < 1 || limit > config.feed_max_limit {
        return Err(ApiError::BadQuery(format!(
            "limit must be between 1 and {}",
            config.feed_max_limit,
        )));
    }

    let system_id = query.system_id;
    let battles = db
        .run(move |conn| db::recent_battles(conn, limit, system_id))
        .await?;

    let items = names::enrich_battles(esi.inner(), battles).await;
    Ok(Json(BattlePage {
        count: items.len(),
        items,
    }))
}

#[get("/battles/<id>")]
pub async fn battle_detail(
    id: Uuid,
    db: Db,
    esi: &State<EsiClient>,
) -> Result<Json<ApiBattleDetail>, ApiError> {
    let (battle, events, participants) = db
        .run(move |conn| {
            let Some(battle) = db::battle_by_id(conn, id)? else {
                return Ok(None);
            };
            let events = db::battle_events_for(conn, id)?;
            let participants = db::battle_participants_for(conn, id)?;
            Ok::<_, battlelog_db::QueryError>(Some((battle, events, participants)))
        })
        .await?
        .ok_or(ApiError::NotFound)?;

    let detail = names::enrich_battle_detail(esi.inner(), battle, events, participants).await;
    Ok(Json(detail))
}
