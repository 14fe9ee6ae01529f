mod cluster;
mod config;
mod enrich;
mod ingest;
mod service;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use battlelog_db::ruleset::RulesetHandle;
use battlelog_db::{Connection, PgConnection, db, notify};
use esi::{EsiClient, EsiConfig};
use log::{error, info, warn};
use redisq::{Redisq, RedisqConfig};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::IngestConfig;
use crate::service::{ServiceError, establish_with_retries};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match IngestConfig::config() {
        Ok(config) => config,
        Err(err) => {
            error!("Invalid configuration: {err}");
            return ExitCode::from(1);
        }
    };

    let url = battlelog_db::postgres_url_from_environment();
    if let Err(err) = battlelog_db::run_migrations(&url) {
        error!("Migrations failed: {err:?}");
        return ExitCode::from(1);
    }

    match run(config, url).await {
        Ok(()) => {
            info!("Clean shutdown");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("Service failed: {err:?}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

async fn run(config: IngestConfig, url: String) -> Result<(), ServiceError> {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                cancel.cancel();
            }
        }
    });

    let esi = Arc::new(
        EsiClient::new(EsiConfig {
            base_url: config.esi_base_url.clone(),
            user_agent: config.user_agent.clone(),
            timeout_seconds: config.esi_timeout_seconds,
            error_budget: config.esi_error_budget,
            cache_path: config.esi_cache_path.clone(),
        })
        .map_err(|err| ServiceError::Setup(format!("upstream API client: {err}")))?,
    );

    let source = Redisq::new(RedisqConfig {
        base_url: config.redisq_base_url.clone(),
        user_agent: config.user_agent.clone(),
        queue_id: config.redisq_queue_id.clone(),
        ttw_seconds: config.redisq_ttw_seconds,
    })
    .map_err(|err| ServiceError::Setup(format!("killmail source: {err}")))?;

    let retry_window = Duration::from_secs(config.store_retry_window_seconds);

    // The ruleset is read once at boot, then kept fresh by the invalidation
    // listener; every loop reads it through the shared handle.
    let initial_ruleset = {
        let mut conn = establish_with_retries(&url, retry_window, &cancel).await?;
        db::get_active_ruleset(&mut conn)?
    };
    let ruleset = RulesetHandle::new(initial_ruleset);

    let listener_handle = spawn_ruleset_listener(url.clone(), ruleset.clone(), cancel.clone());

    let (work_tx, work_rx) = mpsc::channel(config.work_queue_capacity);
    let work_rx = Arc::new(Mutex::new(work_rx));

    let mut worker_handles: Vec<JoinHandle<Result<(), ServiceError>>> = Vec::new();
    for worker_id in 0..config.enrich_workers.max(1) {
        worker_handles.push(tokio::spawn(enrich::run_enrichment_worker(
            worker_id,
            url.clone(),
            esi.clone(),
            work_rx.clone(),
            config.clone(),
            cancel.clone(),
        )));
    }

    worker_handles.push(tokio::spawn(enrich::run_enrichment_sweep(
        url.clone(),
        work_tx.clone(),
        config.clone(),
        cancel.clone(),
    )));

    worker_handles.push(tokio::spawn(cluster::run_clusterer(
        url.clone(),
        ruleset.clone(),
        config.cluster.clone(),
        retry_window,
        cancel.clone(),
    )));

    info!("Launched enrichment and clustering tasks");

    let ingest_result = ingest::run_ingest_loop(
        &url,
        &source,
        esi,
        ruleset,
        work_tx,
        &config,
        cancel.clone(),
    )
    .await;

    // Whatever ended the puller ends everyone; workers drain their
    // in-flight item and stop.
    cancel.cancel();

    let mut first_error = ingest_result.err();
    for handle in worker_handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(ServiceError::Cancelled)) => {}
            Ok(Err(err)) => {
                warn!("A worker task failed: {err:?}");
                first_error.get_or_insert(err);
            }
            Err(join_err) => {
                warn!("A worker task panicked: {join_err}");
                first_error.get_or_insert(ServiceError::Setup(join_err.to_string()));
            }
        }
    }

    if let Err(err) = listener_handle.await {
        warn!("The ruleset listener task failed to join: {err}");
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn spawn_ruleset_listener(
    url: String,
    ruleset: RulesetHandle,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let reload_url = url.clone();
        let result = notify::listen_for_ruleset_invalidations(
            &url,
            || cancel.is_cancelled(),
            || {
                let fresh = PgConnection::establish(&reload_url)
                    .map_err(|err| warn!("Ruleset reload couldn't connect: {err}"))
                    .ok()
                    .and_then(|mut conn| {
                        db::get_active_ruleset(&mut conn)
                            .map_err(|err| warn!("Ruleset reload failed: {err}"))
                            .ok()
                    });
                if let Some(fresh) = fresh {
                    info!("Ruleset invalidated; reloaded (updated {})", fresh.updated_at);
                    ruleset.replace(fresh);
                }
            },
        );

        if let Err(err) = result {
            warn!("Ruleset listener exited with an error: {err:?}");
        }
    })
}
