mod battles;
mod enrichments;
mod events;
mod ruleset;

pub use battles::*;
pub use enrichments::*;
pub use events::*;
pub use ruleset::*;

use diesel::{PgConnection, QueryResult, RunQueryDsl, sql_query};

pub fn set_statement_timeout(conn: &mut PgConnection, timeout_seconds: i64) -> QueryResult<usize> {
    // `set` cannot use a prepared query, so the statement is built from a
    // string. `timeout_seconds` is an i64 and thus its format cannot contain
    // a `'` character, so this is safe.
    sql_query(format!("set statement_timeout = '{}s'", timeout_seconds)).execute(conn)
}
