mod schema;
mod url;

pub mod db;
pub mod migrations;
pub mod models;
pub mod notify;
pub mod pool;
pub mod ruleset;
pub mod space;

pub(crate) use schema::*;

pub use migrations::{MigrationError, run_migrations};
pub use pool::{ConnectionPool, PoolError, get_pool};
pub use url::*;

pub use diesel::{Connection, PgConnection};

/// The error surface of every query function in this crate.
pub type QueryError = diesel::result::Error;

/// True when a query failed because the connection to the store is gone, as
/// opposed to the query itself being at fault. Callers use this to decide
/// between reconnecting and bubbling.
pub fn is_connection_error(err: &QueryError) -> bool {
    matches!(
        err,
        diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::ClosedConnection,
            _,
        ) | diesel::result::Error::BrokenTransactionManager
    )
}
