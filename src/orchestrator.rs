//! Batch Orchestrator (component H, spec §4.8). Drives A–G for a batch of
//! race ids with bounded fan-out, one task per race so within-race writes
//! stay single-writer (spec §5), collecting per-race/per-phase errors rather
//! than aborting the batch.

use crate::bucket::{self, BucketInput};
use crate::config::Config;
use crate::domain::RaceStatus;
use crate::error::PhaseError;
use crate::money_flow;
use crate::normalize;
use crate::odds_history;
use crate::pools;
use crate::race_state;
use crate::store::Store;
use crate::upstream::UpstreamFetcher;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

/// Summary counts returned per batch (spec §4.8 step 4).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub successful_races: usize,
    pub failed_races: usize,
    pub total_entrants_processed: usize,
    pub total_money_flow_processed: usize,
    pub total_errors: usize,
}

struct RaceOutcome {
    entrants_processed: usize,
    money_flow_processed: usize,
    fetch_failed: bool,
}

fn parse_start_time(raw: Option<&str>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(fallback)
}

/// The upstream envelope carries no currency field (spec §6); fall back to
/// the operator's configured home market.
fn default_currency(config: &Config) -> String {
    match config.default_meeting_countries.first().map(String::as_str) {
        Some("NZ") => "NZD".to_string(),
        Some("AU") => "AUD".to_string(),
        Some(other) => other.to_string(),
        None => "NZD".to_string(),
    }
}

/// Runs the full A–G pipeline for one race. Never panics on partial data: a
/// missing/malformed field degrades that phase and is recorded as a
/// [`PhaseError`], but sibling phases still run (spec §4.8 step 3).
async fn process_race(
    fetcher: &UpstreamFetcher,
    store: &dyn Store,
    config: &Config,
    race_id: &str,
    status_hint: Option<RaceStatus>,
    now: DateTime<Utc>,
) -> (RaceOutcome, Vec<PhaseError>) {
    let mut errors = Vec::new();

    let envelope = match fetcher.fetch(race_id, status_hint).await {
        Ok(e) => e,
        Err(e) => {
            errors.push(PhaseError {
                race_id: race_id.to_string(),
                phase: "fetch",
                message: e.to_string(),
            });
            return (
                RaceOutcome {
                    entrants_processed: 0,
                    money_flow_processed: 0,
                    fetch_failed: true,
                },
                errors,
            );
        }
    };

    let upstream_race = envelope.data.race.clone().unwrap_or_default();
    let incoming_status = upstream_race
        .status
        .as_deref()
        .and_then(RaceStatus::parse)
        .unwrap_or(RaceStatus::Open);
    let start_time = parse_start_time(upstream_race.start_time.as_deref(), now);

    let race = match race_state::update_status(store, race_id, start_time, incoming_status, now).await {
        Ok(r) => r,
        Err(e) => {
            errors.push(PhaseError {
                race_id: race_id.to_string(),
                phase: "race_state",
                message: e.to_string(),
            });
            return (
                RaceOutcome {
                    entrants_processed: 0,
                    money_flow_processed: 0,
                    fetch_failed: false,
                },
                errors,
            );
        }
    };

    let currency = default_currency(config);
    let pool_totals = pools::aggregate_pool_totals(race_id, &envelope.data.tote_pools, &currency);
    if let Err(e) = store.upsert_pool_totals(&pool_totals).await {
        errors.push(PhaseError {
            race_id: race_id.to_string(),
            phase: "pools",
            message: e.to_string(),
        });
    }

    let (entrants, normalize_errors) = normalize::normalize_entrants(&envelope.data.entrants, race_id);
    for e in normalize_errors {
        errors.push(PhaseError {
            race_id: race_id.to_string(),
            phase: "normalize",
            message: e.to_string(),
        });
    }

    // Entrant/odds-history (C) and money-flow/bucket (E->F) touch disjoint
    // collections and neither reads the other's output, so they run
    // concurrently within this race (spec §4.8 step 2).
    let entrants_phase = async {
        let mut phase_errors = Vec::new();
        for entrant in &entrants {
            let previous = match store.get_entrant(&entrant.entrant_id).await {
                Ok(p) => p,
                Err(e) => {
                    phase_errors.push(PhaseError {
                        race_id: race_id.to_string(),
                        phase: "odds_history",
                        message: e.to_string(),
                    });
                    None
                }
            };
            let rows = odds_history::rows_to_append(&entrant.entrant_id, entrant.odds, previous.as_ref());
            for row in rows {
                if let Err(e) = store.append_odds_history(&row).await {
                    phase_errors.push(PhaseError {
                        race_id: race_id.to_string(),
                        phase: "odds_history",
                        message: e.to_string(),
                    });
                }
            }
            if let Err(e) = store.upsert_entrant(entrant).await {
                phase_errors.push(PhaseError {
                    race_id: race_id.to_string(),
                    phase: "entrants",
                    message: e.to_string(),
                });
            }
        }
        phase_errors
    };

    let time_to_start = (start_time - now).num_milliseconds() as f64 / 60_000.0;
    let aggregated = envelope
        .data
        .money_tracker
        .as_ref()
        .map(|mt| money_flow::aggregate(&mt.entrants))
        .unwrap_or_default();

    let money_flow_phase = async {
        let mut phase_errors = Vec::new();
        let mut processed = 0;
        for (entrant_id, entry) in aggregated {
            let has_prior = match store.any_bucketed_row_exists(race_id, &entrant_id).await {
                Ok(v) => v,
                Err(e) => {
                    phase_errors.push(PhaseError {
                        race_id: race_id.to_string(),
                        phase: "money_flow",
                        message: e.to_string(),
                    });
                    false
                }
            };
            if money_flow::should_skip(race.status, has_prior) {
                continue;
            }

            let input = BucketInput {
                race_id: race_id.to_string(),
                entrant_id: entrant_id.clone(),
                time_to_start,
                hold_percentage: entry.hold_percentage,
                bet_percentage: entry.bet_percentage,
                win_pool_total_cents: pool_totals.win_pool_total,
                place_pool_total_cents: pool_totals.place_pool_total,
                polling_timestamp: now,
            };

            match bucket::compute_row(store, input).await {
                Ok(Some(row)) => {
                    if let Err(e) = store.append_bucketed_row(&row).await {
                        phase_errors.push(PhaseError {
                            race_id: race_id.to_string(),
                            phase: "bucket",
                            message: e.to_string(),
                        });
                    } else {
                        processed += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => phase_errors.push(PhaseError {
                    race_id: race_id.to_string(),
                    phase: "bucket",
                    message: e.to_string(),
                }),
            }
        }
        (processed, phase_errors)
    };

    let (entrants_errors, (money_flow_processed, money_flow_errors)) =
        tokio::join!(entrants_phase, money_flow_phase);
    errors.extend(entrants_errors);
    errors.extend(money_flow_errors);

    let has_results = !envelope.data.results.is_empty();
    let has_dividends = !envelope.data.dividends.is_empty();
    if race_state::should_write_results(has_results, has_dividends) {
        let snapshot = race_state::snapshot_odds_by_runner_number(&entrants);
        let prior_results = match store.get_race_results(race_id).await {
            Ok(r) => r,
            Err(e) => {
                errors.push(PhaseError {
                    race_id: race_id.to_string(),
                    phase: "race_state",
                    message: e.to_string(),
                });
                None
            }
        };
        let results = race_state::build_race_results(
            race_id,
            race.status,
            &envelope.data.results,
            &envelope.data.dividends,
            &snapshot,
            prior_results.as_ref(),
            now,
        );
        if let Err(e) = store.upsert_race_results(&results).await {
            errors.push(PhaseError {
                race_id: race_id.to_string(),
                phase: "race_state",
                message: e.to_string(),
            });
        }
    }

    let mut updated_race = race;
    updated_race.last_poll_time = Some(now);
    if let Err(e) = store.upsert_race(&updated_race).await {
        errors.push(PhaseError {
            race_id: race_id.to_string(),
            phase: "race_state",
            message: e.to_string(),
        });
    }

    (
        RaceOutcome {
            entrants_processed: entrants.len(),
            money_flow_processed,
            fetch_failed: false,
        },
        errors,
    )
}

/// Runs the batch against bounded upstream/store concurrency (spec §5:
/// "bounded concurrency budget"). `race_ids` is the due set chosen by the
/// scheduler. Returns the summary plus the flat list of per-race errors.
pub async fn run_batch(
    fetcher: Arc<UpstreamFetcher>,
    store: Arc<dyn Store>,
    config: &Config,
    race_ids: Vec<String>,
    now: DateTime<Utc>,
) -> (BatchSummary, Vec<PhaseError>) {
    let semaphore = Arc::new(Semaphore::new(config.worker_concurrency.max(1)));
    let mut handles = Vec::with_capacity(race_ids.len());

    for race_id in race_ids {
        let fetcher = fetcher.clone();
        let store = store.clone();
        let semaphore = semaphore.clone();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            process_race(&fetcher, store.as_ref(), &config, &race_id, None, now).await
        }));
    }

    let mut summary = BatchSummary::default();
    let mut all_errors = Vec::new();

    for handle in handles {
        match handle.await {
            Ok((outcome, errors)) => {
                if outcome.fetch_failed {
                    summary.failed_races += 1;
                } else {
                    summary.successful_races += 1;
                }
                summary.total_entrants_processed += outcome.entrants_processed;
                summary.total_money_flow_processed += outcome.money_flow_processed;
                summary.total_errors += errors.len();
                all_errors.extend(errors);
            }
            Err(join_err) => {
                warn!("race-processing task panicked: {}", join_err);
                summary.failed_races += 1;
                summary.total_errors += 1;
            }
        }
    }

    (summary, all_errors)
}
