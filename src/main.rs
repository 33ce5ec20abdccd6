//! Race poller and money-flow timeline service.
//!
//! Schedules fetches per race keyed to proximity-to-start, retrieves event
//! payloads from the upstream racing API, and writes entrant snapshots with
//! odds-change history, per-race pool totals, and a time-bucketed
//! money-flow timeline.

use anyhow::Result;
use axum::{routing::get, Router};
use race_poller::config::Config;
use race_poller::health::{health_handler, HealthState};
use race_poller::orchestrator;
use race_poller::scheduler::Scheduler;
use race_poller::store::{PgStore, Store};
use race_poller::upstream::UpstreamFetcher;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// How often the scheduler re-evaluates which races are due. Independent of
/// any single race's chosen cadence (spec §4.9) — this is just the tick rate
/// at which "is anything due yet?" gets asked.
const SCHEDULER_TICK: Duration = Duration::from_secs(5);

/// Builds the scheduler's candidate set from every non-terminal race
/// currently known to the store (spec §4.9 operates over this set).
async fn collect_candidates(
    store: &dyn Store,
    now: chrono::DateTime<chrono::Utc>,
) -> Vec<(String, f64, race_poller::domain::RaceStatus)> {
    let mut candidates = Vec::new();
    let race_ids = match store.list_active_race_ids().await {
        Ok(ids) => ids,
        Err(e) => {
            error!("failed to list active races: {}", e);
            return candidates;
        }
    };
    for race_id in race_ids {
        if let Ok(Some(race)) = store.get_race(&race_id).await {
            let time_to_start = (race.start_time - now).num_milliseconds() as f64 / 60_000.0;
            candidates.push((race_id, time_to_start, race.status));
        }
    }
    candidates
}

async fn run(
    config: Config,
    fetcher: Arc<UpstreamFetcher>,
    store: Arc<dyn Store>,
    scheduler: Scheduler,
    health: HealthState,
) -> Result<()> {
    info!("starting race-poller scheduling loop (tick {:?})", SCHEDULER_TICK);

    loop {
        let now = chrono::Utc::now();
        let candidates = collect_candidates(store.as_ref(), now).await;
        let due = scheduler.select_due(&candidates, now).await;

        if !due.is_empty() {
            let (summary, errors) =
                orchestrator::run_batch(fetcher.clone(), store.clone(), &config, due.clone(), now).await;

            for race_id in &due {
                scheduler.record_polled(race_id, now).await;
            }

            health.record_batch(summary.total_errors).await;

            info!(
                successful_races = summary.successful_races,
                failed_races = summary.failed_races,
                total_entrants_processed = summary.total_entrants_processed,
                total_money_flow_processed = summary.total_money_flow_processed,
                total_errors = summary.total_errors,
                "batch complete"
            );
            for e in &errors {
                error!(race_id = %e.race_id, phase = e.phase, "{}", e.message);
            }
        }

        tokio::time::sleep(SCHEDULER_TICK).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    race_poller::telemetry::init();

    info!("race-poller starting");

    let config = Config::from_env()?;
    let health_port = config.health_port;

    let store: Arc<dyn Store> = Arc::new(PgStore::connect_with_retry(&config.database_url, 5).await?);
    let fetcher = Arc::new(UpstreamFetcher::new(config.clone())?);
    let scheduler = Scheduler::new();
    let health = HealthState::new();

    let app = Router::new()
        .route("/health", get(health_handler))
        .with_state(health.clone());
    let health_addr = format!("0.0.0.0:{}", health_port);
    info!("health endpoint listening on {}", health_addr);
    let listener = tokio::net::TcpListener::bind(&health_addr).await?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("health server error: {}", e);
        }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        result = run(config, fetcher, store, scheduler, health) => {
            if let Err(e) = result {
                error!("scheduling loop error: {:?}", e);
            }
        }
        _ = ctrl_c => {
            info!("shutting down...");
        }
    }

    Ok(())
}
