//! Process-environment configuration (spec §6), loaded the way the teacher's
//! `Config::from_env()` loads it: `env::var(...).unwrap_or_else(...).parse()`.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_base_url: String,
    pub partner_name: String,
    pub partner_id: String,
    pub partner_contact_email: String,
    pub request_timeout: Duration,
    pub retry_delays: Vec<Duration>,
    pub default_meeting_countries: Vec<String>,
    pub default_meeting_categories: Vec<String>,
    pub worker_concurrency: usize,
    pub health_port: u16,
    pub database_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let upstream_base_url = env::var("UPSTREAM_BASE_URL")
            .context("UPSTREAM_BASE_URL must be set")?;
        let partner_name = env::var("PARTNER_NAME").context("PARTNER_NAME must be set")?;
        let partner_id = env::var("PARTNER_ID").context("PARTNER_ID must be set")?;
        let partner_contact_email = env::var("PARTNER_CONTACT_EMAIL")
            .context("PARTNER_CONTACT_EMAIL must be set")?;
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let request_timeout_ms: u64 = env::var("REQUEST_TIMEOUT_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .unwrap_or(5000);

        let retry_delays = env::var("RETRY_DELAYS_MS")
            .unwrap_or_else(|_| "100,200,400".to_string())
            .split(',')
            .filter_map(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .collect::<Vec<_>>();
        let retry_delays = if retry_delays.is_empty() {
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ]
        } else {
            retry_delays
        };

        let default_meeting_countries = env::var("DEFAULT_MEETING_COUNTRIES")
            .unwrap_or_else(|_| "NZ,AU".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();

        let default_meeting_categories = env::var("DEFAULT_MEETING_CATEGORIES")
            .unwrap_or_else(|_| "R,H".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();

        let worker_concurrency = env::var("WORKER_CONCURRENCY")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .unwrap_or(8);

        let health_port = env::var("HEALTH_PORT")
            .unwrap_or_else(|_| "8084".to_string())
            .parse()
            .unwrap_or(8084);

        Ok(Self {
            upstream_base_url,
            partner_name,
            partner_id,
            partner_contact_email,
            request_timeout: Duration::from_millis(request_timeout_ms),
            retry_delays,
            default_meeting_countries,
            default_meeting_categories,
            worker_concurrency,
            health_port,
            database_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_when_optional_keys_absent() {
        // Simulate the parse helpers directly rather than mutating process env,
        // since env vars are process-global and tests run concurrently.
        let delays: Vec<Duration> = "100,200,400"
            .split(',')
            .filter_map(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[test]
    fn countries_and_categories_split_on_comma() {
        let countries: Vec<String> = "NZ,AU".split(',').map(|s| s.trim().to_string()).collect();
        assert_eq!(countries, vec!["NZ".to_string(), "AU".to_string()]);
    }
}
