pub mod battles;
mod error;
pub mod killmails;
mod rulesets;

pub use error::ApiError;

use serde::Deserialize;

#[rocket::get("/")]
pub async fn index() -> &'static str {
    "This is the battlelog API."
}

pub fn routes() -> Vec<rocket::Route> {
    rocket::routes![
        index,
        killmails::recent_killmails,
        killmails::killmail_stream,
        battles::battles_list,
        battles::battle_detail,
        rulesets::current_ruleset,
        rulesets::update_ruleset,
    ]
}

/// Entity IDs exceed the safe integer range of some clients, so they go
/// over the wire as decimal strings.
pub mod id_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        super::IdParam::deserialize(deserializer)?
            .value()
            .map_err(serde::de::Error::custom)
    }
}

/// An ID in a request body: clients send back what they read, so both the
/// decimal-string form and a plain integer are accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdParam {
    Int(i64),
    Str(String),
}

impl IdParam {
    pub fn value(&self) -> Result<i64, String> {
        match self {
            IdParam::Int(id) => Ok(*id),
            IdParam::Str(s) => s
                .parse()
                .map_err(|_| format!("{s:?} is not a numeric id")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "id_string")]
        id: i64,
    }

    #[test]
    fn ids_serialize_as_decimal_strings() {
        let json = serde_json::to_string(&Wrapper { id: 99_999_999_999 }).unwrap();
        assert_eq!(json, r#"{"id":"99999999999"}"#);
    }

    #[test]
    fn ids_deserialize_from_strings_and_numbers() {
        let from_str: Wrapper = serde_json::from_str(r#"{"id":"42"}"#).unwrap();
        assert_eq!(from_str.id, 42);

        let from_int: Wrapper = serde_json::from_str(r#"{"id":42}"#).unwrap();
        assert_eq!(from_int.id, 42);

        assert!(serde_json::from_str::<Wrapper>(r#"{"id":"forty-two"}"#).is_err());
    }
}
