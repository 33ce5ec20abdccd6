//! Upstream Fetcher (component A, spec §4.1). Typed HTTP client with
//! retry/backoff, timeout, and parameter selection by race status, modeled on
//! the teacher's `fetch_events`/`connect_db_with_retry` shape.

use crate::config::Config;
use crate::domain::RaceStatus;
use crate::error::IngestError;
use governor::{Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, warn};

/// Raw upstream envelope: `{data:{race, entrants[], money_tracker, tote_pools[],
/// results[], dividends[], runners[]}, header:{generated_time}}` (spec §6).
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UpstreamEnvelope {
    pub data: UpstreamData,
    pub header: UpstreamHeader,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UpstreamHeader {
    pub generated_time: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UpstreamData {
    pub race: Option<UpstreamRace>,
    pub entrants: Vec<UpstreamEntrant>,
    pub money_tracker: Option<UpstreamMoneyTracker>,
    pub tote_pools: Vec<UpstreamPoolEntry>,
    pub results: Vec<UpstreamResultEntry>,
    pub dividends: Vec<UpstreamDividend>,
    pub runners: Vec<UpstreamEntrant>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UpstreamRace {
    pub race_id: String,
    pub start_time: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UpstreamEntrant {
    pub entrant_id: String,
    pub race_id: Option<String>,
    pub runner_number: Option<u32>,
    pub name: Option<String>,
    pub is_scratched: Option<bool>,
    pub is_late_scratched: Option<bool>,
    pub is_emergency: Option<bool>,
    pub fixed_win: Option<f64>,
    pub fixed_place: Option<f64>,
    pub pool_win: Option<f64>,
    pub pool_place: Option<f64>,
    pub jockey: Option<String>,
    pub trainer: Option<String>,
    pub silk_colours: Option<String>,
    pub runner_change: Option<serde_json::Value>,
    pub gear: Option<serde_json::Value>,
    pub owners: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UpstreamMoneyTracker {
    pub entrants: Vec<UpstreamMoneyTrackerEntry>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UpstreamMoneyTrackerEntry {
    pub entrant_id: String,
    pub hold_percentage: Option<f64>,
    pub bet_percentage: Option<f64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UpstreamPoolEntry {
    pub product_type: String,
    pub total: f64,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UpstreamResultEntry {
    pub position: Option<u32>,
    pub runner_number: Option<u32>,
    pub runner_name: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UpstreamDividend {
    pub product_type: Option<String>,
    pub amount: Option<f64>,
    pub status: Option<String>,
}

pub struct UpstreamFetcher {
    client: Client,
    config: Config,
    rate_limiter: RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl UpstreamFetcher {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            "From",
            HeaderValue::from_str(&config.partner_contact_email)
                .unwrap_or_else(|_| HeaderValue::from_static("")),
        );
        headers.insert(
            "X-Partner-Name",
            HeaderValue::from_str(&config.partner_name).unwrap_or_else(|_| HeaderValue::from_static("")),
        );
        headers.insert(
            "X-Partner-Id",
            HeaderValue::from_str(&config.partner_id).unwrap_or_else(|_| HeaderValue::from_static("")),
        );

        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(5)
            .default_headers(headers)
            .user_agent(format!("{}/race-poller", config.partner_name))
            .build()?;

        // Quota is conservative; partner APIs of this shape are typically
        // rate-limited. Sized independently of WORKER_CONCURRENCY, which
        // bounds fan-out rather than upstream QPS (see orchestrator.rs).
        let rate_limiter = RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap()));

        Ok(Self {
            client,
            config,
            rate_limiter,
        })
    }

    /// Builds the query-parameter set for a race poll, keyed by status (spec §4.1).
    fn params_for_status(status: Option<RaceStatus>) -> Vec<(&'static str, &'static str)> {
        match status {
            Some(RaceStatus::Open) | None => vec![
                ("with_tote_trends", "true"),
                ("with_money_tracker", "true"),
                ("with_big_bets", "true"),
                ("with_live_bets", "true"),
                ("with_will_pays", "true"),
            ],
            Some(RaceStatus::Interim) => vec![("with_results", "true")],
            Some(RaceStatus::Closed) => vec![("with_results", "true"), ("with_dividends", "true")],
            Some(RaceStatus::Final) | Some(RaceStatus::Abandoned) => {
                vec![("with_results", "true"), ("with_dividends", "true")]
            }
        }
    }

    /// Fetches and normalizes a single race's event payload, retrying retriable
    /// errors up to 3 times with the configured backoff (spec §4.1, §8 invariant 8).
    pub async fn fetch(
        &self,
        race_id: &str,
        status_hint: Option<RaceStatus>,
    ) -> Result<UpstreamEnvelope, IngestError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/racing/events/{}", self.config.upstream_base_url, race_id);
        let params = Self::params_for_status(status_hint);

        // Total attempts are bounded by the configured delay count (default 3,
        // matching spec §8 invariant 8: "fetch emits at most 3 attempts per call").
        let max_attempts = self.config.retry_delays.len().max(1);
        let mut last_err: Option<IngestError> = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.config.retry_delays[attempt - 1];
                debug!("retrying fetch for race {} (attempt {})", race_id, attempt + 1);
                tokio::time::sleep(delay).await;
            }

            match self.try_fetch(&url, &params).await {
                Ok(envelope) => return Ok(envelope),
                Err(e) if e.is_retriable() => {
                    warn!("retriable fetch error for race {}: {}", race_id, e);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            IngestError::UpstreamNetwork(format!("exhausted retries for race {}", race_id))
        }))
    }

    async fn try_fetch(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<UpstreamEnvelope, IngestError> {
        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|e| IngestError::UpstreamNetwork(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(IngestError::UpstreamNetwork(format!("server error {}", status)));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(IngestError::UpstreamNetwork("rate limited (429)".to_string()));
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            let truncated: String = body.chars().take(200).collect();
            return Err(IngestError::UpstreamClient {
                status: status.as_u16(),
                body: truncated,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| IngestError::UpstreamNetwork(e.to_string()))?;

        serde_json::from_str::<UpstreamEnvelope>(&body).map_err(|e| IngestError::Validation {
            fields: vec![format!("envelope parse error: {}", e)],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_status_requests_pre_race_extras() {
        let params = UpstreamFetcher::params_for_status(Some(RaceStatus::Open));
        assert!(params.iter().any(|(k, _)| *k == "with_money_tracker"));
        assert!(params.iter().any(|(k, _)| *k == "with_will_pays"));
    }

    #[test]
    fn unknown_status_defaults_to_open_set() {
        let params = UpstreamFetcher::params_for_status(None);
        assert!(params.iter().any(|(k, _)| *k == "with_tote_trends"));
    }

    #[test]
    fn closed_requests_results_and_dividends() {
        let params = UpstreamFetcher::params_for_status(Some(RaceStatus::Closed));
        assert!(params.iter().any(|(k, _)| *k == "with_results"));
        assert!(params.iter().any(|(k, _)| *k == "with_dividends"));
    }

    #[test]
    fn interim_requests_results_without_dividends() {
        let params = UpstreamFetcher::params_for_status(Some(RaceStatus::Interim));
        assert!(params.iter().any(|(k, _)| *k == "with_results"));
        assert!(!params.iter().any(|(k, _)| *k == "with_dividends"));
    }
}
