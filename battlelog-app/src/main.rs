mod api;
mod names;

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use battlelog_db::ruleset::RulesetHandle;
use battlelog_db::{Connection, db, notify};
use chrono::Utc;
use esi::{EsiClient, EsiConfig};
use figment::providers::{Env, Format, Serialized, Toml};
use log::{error, info, warn};
use rocket::figment::map;
use rocket_sync_db_pools::database as sync_database;
use rocket_sync_db_pools::diesel::PgConnection;
use serde::{Deserialize, Serialize};

#[sync_database("battlelog")]
pub struct Db(PgConnection);

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    pub user_agent: String,
    pub esi_base_url: String,
    pub esi_cache_path: Option<std::path::PathBuf>,
    pub esi_error_budget: i32,
    pub esi_timeout_seconds: u64,
    pub feed_default_limit: i64,
    pub feed_max_limit: i64,
    pub feed_default_poll_ms: u64,
    pub feed_min_poll_ms: u64,
    pub feed_max_poll_ms: u64,
    pub feed_overfetch: i64,
    pub store_retry_window_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("battlelog/", env!("CARGO_PKG_VERSION")).to_string(),
            esi_base_url: "https://esi.evetech.net/latest".to_string(),
            esi_cache_path: None,
            esi_error_budget: 100,
            esi_timeout_seconds: 10,
            feed_default_limit: 25,
            feed_max_limit: 100,
            feed_default_poll_ms: 5_000,
            feed_min_poll_ms: 1_000,
            feed_max_poll_ms: 60_000,
            feed_overfetch: 3,
            store_retry_window_seconds: 60,
        }
    }
}

impl AppConfig {
    fn config() -> figment::Result<Self> {
        figment::Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("BATTLELOG.toml"))
            .merge(Env::prefixed("BATTLELOG_"))
            .extract()
    }
}

fn get_figment_with_constructed_db_url() -> rocket::figment::Figment {
    let url = battlelog_db::postgres_url_from_environment();
    rocket::Config::figment().merge(("databases", map!["battlelog" => map!["url" => url]]))
}

/// Read the ruleset at boot, riding out a briefly unavailable store. Past
/// the window the store is declared offline.
fn initial_ruleset(url: &str, window: Duration) -> Result<battlelog_db::ruleset::Ruleset, ExitCode> {
    let started = Utc::now();
    let mut backoff = Duration::from_secs(1);

    loop {
        let result = battlelog_db::PgConnection::establish(url)
            .map_err(|err| err.to_string())
            .and_then(|mut conn| {
                db::get_active_ruleset(&mut conn).map_err(|err| err.to_string())
            });

        match result {
            Ok(ruleset) => return Ok(ruleset),
            Err(err) => {
                let elapsed = (Utc::now() - started).to_std().unwrap_or(Duration::ZERO);
                if elapsed >= window {
                    error!("Store is still unreachable after {elapsed:?}: {err}");
                    return Err(ExitCode::from(2));
                }
                warn!("Store is unreachable ({err}); retrying in {backoff:?}");
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_secs(8));
            }
        }
    }
}

#[rocket::main]
async fn main() -> ExitCode {
    // Rocket skips its own logger when one is already installed; this one
    // also covers everything that happens before launch.
    env_logger::init();

    let config = match AppConfig::config() {
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

    let esi = match EsiClient::new(EsiConfig {
        base_url: config.esi_base_url.clone(),
        user_agent: config.user_agent.clone(),
        timeout_seconds: config.esi_timeout_seconds,
        error_budget: config.esi_error_budget,
        cache_path: config.esi_cache_path.clone(),
    }) {
        Ok(esi) => esi,
        Err(err) => {
            error!("Couldn't construct the upstream API client: {err}");
            return ExitCode::from(1);
        }
    };

    let window = Duration::from_secs(config.store_retry_window_seconds);
    let ruleset = match initial_ruleset(&url, window) {
        Ok(initial) => RulesetHandle::new(initial),
        Err(code) => return code,
    };

    // A dedicated blocking thread keeps the handle fresh for the feed and
    // every open stream session.
    let stop_listener = Arc::new(AtomicBool::new(false));
    let listener = std::thread::spawn({
        let url = url.clone();
        let ruleset = ruleset.clone();
        let stop = stop_listener.clone();
        move || {
            let reload_url = url.clone();
            let result = notify::listen_for_ruleset_invalidations(
                &url,
                || stop.load(Ordering::Relaxed),
                || {
                    let fresh = battlelog_db::PgConnection::establish(&reload_url)
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
        }
    });

    let result = rocket::custom(get_figment_with_constructed_db_url())
        .manage(config)
        .manage(esi)
        .manage(ruleset)
        .mount("/", api::routes())
        .attach(Db::fairing())
        .launch()
        .await;

    stop_listener.store(true, Ordering::Relaxed);
    if listener.join().is_err() {
        warn!("The ruleset listener thread panicked");
    }

    match result {
        Ok(_) => {
            info!("Clean shutdown");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("Rocket failed: {err}");
            ExitCode::from(1)
        }
    }
}
