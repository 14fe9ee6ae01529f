use battlelog_db::db;
use battlelog_db::ruleset::{Ruleset, RulesetHandle, RulesetPatch};
use battlelog_db::space::SecurityClass;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use rocket::serde::json::Json;
use rocket::{State, get, put};
use serde::{Deserialize, Serialize};

use crate::Db;
use crate::api::{ApiError, IdParam};

#[derive(Debug, Serialize)]
pub struct ApiRuleset {
    pub min_pilots: i32,
    pub tracked_alliance_ids: Vec<String>,
    pub tracked_corp_ids: Vec<String>,
    pub tracked_system_ids: Vec<String>,
    pub tracked_security_classes: Vec<SecurityClass>,
    pub ignore_unlisted: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<Ruleset> for ApiRuleset {
    fn from(ruleset: Ruleset) -> Self {
        ApiRuleset {
            min_pilots: ruleset.min_pilots,
            tracked_alliance_ids: to_id_strings(&ruleset.tracked_alliance_ids),
            tracked_corp_ids: to_id_strings(&ruleset.tracked_corp_ids),
            tracked_system_ids: to_id_strings(&ruleset.tracked_system_ids),
            tracked_security_classes: ruleset.tracked_security_classes,
            ignore_unlisted: ruleset.ignore_unlisted,
            updated_at: ruleset.updated_at,
        }
    }
}

fn to_id_strings(ids: &[i64]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect_vec()
}

/// The wire form of a ruleset update. IDs arrive the way they were served:
/// as decimal strings (plain integers are also accepted).
#[derive(Debug, Default, Deserialize)]
pub struct ApiRulesetPatch {
    pub min_pilots: Option<i32>,
    pub tracked_alliance_ids: Option<Vec<IdParam>>,
    pub tracked_corp_ids: Option<Vec<IdParam>>,
    pub tracked_system_ids: Option<Vec<IdParam>>,
    pub tracked_security_classes: Option<Vec<SecurityClass>>,
    pub ignore_unlisted: Option<bool>,
}

impl ApiRulesetPatch {
    fn into_patch(self) -> Result<RulesetPatch, ApiError> {
        Ok(RulesetPatch {
            min_pilots: self.min_pilots,
            tracked_alliance_ids: parse_ids(self.tracked_alliance_ids)?,
            tracked_corp_ids: parse_ids(self.tracked_corp_ids)?,
            tracked_system_ids: parse_ids(self.tracked_system_ids)?,
            tracked_security_classes: self.tracked_security_classes,
            ignore_unlisted: self.ignore_unlisted,
        })
    }
}

fn parse_ids(ids: Option<Vec<IdParam>>) -> Result<Option<Vec<i64>>, ApiError> {
    ids.map(|ids| {
        ids.iter()
            .map(|id| id.value().map_err(ApiError::BadQuery))
            .collect::<Result<Vec<_>, _>>()
    })
    .transpose()
}

#[get("/rulesets/current")]
pub async fn current_ruleset(
    db: Db,
    ruleset: &State<RulesetHandle>,
) -> Result<Json<ApiRuleset>, ApiError> {
    // The store is the source of truth; the handle is refreshed on the way
    // through so this process converges even if it missed a notification.
    let current = db.run(db::get_active_ruleset).await?;
    ruleset.replace(current.clone());
    Ok(Json(current.into()))
}

#[put("/rulesets/current", data = "<patch>")]
pub async fn update_ruleset(
    patch: Json<ApiRulesetPatch>,
    db: Db,
    ruleset: &State<RulesetHandle>,
) -> Result<Json<ApiRuleset>, ApiError> {
    let patch = patch.into_inner().into_patch()?;

    let now = Utc::now();
    let updated = db
        .run(move |conn| db::update_active_ruleset(conn, &patch, now))
        .await?;

    // The broadcast already went out with the commit; updating the local
    // handle just saves this process one round trip.
    ruleset.replace(updated.clone());

    Ok(Json(updated.into()))
}
