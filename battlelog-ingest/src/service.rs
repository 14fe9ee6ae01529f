//! Shared plumbing for the long-running service loops: the common error
//! surface and store reconnection with a bounded retry window.

use std::time::Duration;

use battlelog_db::{Connection, PgConnection, QueryError};
use chrono::Utc;
use log::{info, warn};
use miette::Diagnostic;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Diagnostic)]
pub enum ServiceError {
    #[error("lost connectivity to the store and couldn't re-establish it within the retry window")]
    StoreOffline,

    #[error("the upstream API persistently rejected our requests as unauthorized")]
    UpstreamUnauthorized,

    #[error("failed to initialize: {0}")]
    Setup(String),

    #[error(transparent)]
    Db(#[from] QueryError),

    /// Shutdown was requested mid-operation. Not a failure; loops unwind
    /// silently when they see it.
    #[error("cancelled")]
    Cancelled,
}

impl ServiceError {
    /// The process exit code this failure maps to. Clean shutdown is 0,
    /// store loss is 2, everything else is a generic failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServiceError::Cancelled => 0,
            ServiceError::StoreOffline => 2,
            _ => 1,
        }
    }
}

/// Connect to the store, retrying with exponential backoff inside a bounded
/// window. Past the window the store is declared offline, which the caller
/// turns into exit code 2.
pub async fn establish_with_retries(
    url: &str,
    window: Duration,
    cancel: &CancellationToken,
) -> Result<PgConnection, ServiceError> {
    let started = Utc::now();
    let mut backoff = Duration::from_secs(1);

    loop {
        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }

        match PgConnection::establish(url) {
            Ok(conn) => return Ok(conn),
            Err(err) => {
                let elapsed = (Utc::now() - started)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if elapsed >= window {
                    warn!("Store is still unreachable after {elapsed:?}: {err}");
                    return Err(ServiceError::StoreOffline);
                }

                info!("Store is unreachable ({err}); retrying in {backoff:?}");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ServiceError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(Duration::from_secs(8));
            }
        }
    }
}
