//! Persistence-layer adapter (spec §6): a document store offering
//! `getDocument`/`updateDocument`/`createDocument`/`listDocuments` with
//! `equal`/`greaterThan`/`notEqual`/`orderAsc`/`orderDesc`/`limit` filters,
//! specialized here into typed, domain-shaped methods per collection
//! (`races`, `entrants`, `odds-history`, `money-flow-history`, `race-pools`,
//! `race-results`) rather than a generic JSON-document API — see DESIGN.md.
//!
//! Upsert semantics throughout: try update first, create on not-found.

use crate::domain::{
    BucketedMoneyFlowRow, Entrant, OddsHistoryRow, PoolTotals, Race, RaceResults,
};
use crate::error::IngestError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_race(&self, race_id: &str) -> Result<Option<Race>, IngestError>;
    async fn upsert_race(&self, race: &Race) -> Result<(), IngestError>;

    /// Race ids not yet `final`/`abandoned` (spec §6: `listDocuments` with a
    /// `notEqual` filter) — the scheduler's candidate set for each cycle.
    async fn list_active_race_ids(&self) -> Result<Vec<String>, IngestError>;

    async fn get_entrant(&self, entrant_id: &str) -> Result<Option<Entrant>, IngestError>;
    async fn upsert_entrant(&self, entrant: &Entrant) -> Result<(), IngestError>;
    async fn list_entrants(&self, race_id: &str) -> Result<Vec<Entrant>, IngestError>;
    async fn entrant_exists(&self, entrant_id: &str) -> Result<bool, IngestError> {
        Ok(self.get_entrant(entrant_id).await?.is_some())
    }

    async fn append_odds_history(&self, row: &OddsHistoryRow) -> Result<(), IngestError>;

    async fn get_pool_totals(&self, race_id: &str) -> Result<Option<PoolTotals>, IngestError>;
    async fn upsert_pool_totals(&self, totals: &PoolTotals) -> Result<(), IngestError>;

    /// Exact-match lookup used by the bucketer's duplicate guard (spec §4.6 step 1).
    async fn get_bucketed_row(
        &self,
        race_id: &str,
        entrant_id: &str,
        time_interval: f64,
    ) -> Result<Option<BucketedMoneyFlowRow>, IngestError>;

    /// Nearest prior bucket with non-zero pool amount, ordered by `timeInterval`
    /// strictly greater than `before`, ascending (spec §4.6 step 3: "nearest" means
    /// smallest `timeInterval` that is still `> current`, i.e. closest in time).
    async fn nearest_prior_bucket(
        &self,
        race_id: &str,
        entrant_id: &str,
        before: f64,
    ) -> Result<Option<BucketedMoneyFlowRow>, IngestError>;

    /// Whether any bucketed row exists at all for this entrant (baseline-case test).
    async fn any_bucketed_row_exists(
        &self,
        race_id: &str,
        entrant_id: &str,
    ) -> Result<bool, IngestError>;

    async fn append_bucketed_row(&self, row: &BucketedMoneyFlowRow) -> Result<(), IngestError>;

    async fn get_race_results(&self, race_id: &str) -> Result<Option<RaceResults>, IngestError>;
    async fn upsert_race_results(&self, results: &RaceResults) -> Result<(), IngestError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation, used by tests and as a development fallback.
// ---------------------------------------------------------------------------

#[derive(Default)]
struct InMemoryTables {
    races: HashMap<String, Race>,
    entrants: HashMap<String, Entrant>,
    odds_history: Vec<OddsHistoryRow>,
    pool_totals: HashMap<String, PoolTotals>,
    bucketed_rows: Vec<BucketedMoneyFlowRow>,
    race_results: HashMap<String, RaceResults>,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<InMemoryTables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_race(&self, race_id: &str) -> Result<Option<Race>, IngestError> {
        Ok(self.tables.read().await.races.get(race_id).cloned())
    }

    async fn upsert_race(&self, race: &Race) -> Result<(), IngestError> {
        self.tables
            .write()
            .await
            .races
            .insert(race.race_id.clone(), race.clone());
        Ok(())
    }

    async fn list_active_race_ids(&self) -> Result<Vec<String>, IngestError> {
        Ok(self
            .tables
            .read()
            .await
            .races
            .values()
            .filter(|r| !matches!(r.status, crate::domain::RaceStatus::Final | crate::domain::RaceStatus::Abandoned))
            .map(|r| r.race_id.clone())
            .collect())
    }

    async fn get_entrant(&self, entrant_id: &str) -> Result<Option<Entrant>, IngestError> {
        Ok(self.tables.read().await.entrants.get(entrant_id).cloned())
    }

    async fn upsert_entrant(&self, entrant: &Entrant) -> Result<(), IngestError> {
        self.tables
            .write()
            .await
            .entrants
            .insert(entrant.entrant_id.clone(), entrant.clone());
        Ok(())
    }

    async fn list_entrants(&self, race_id: &str) -> Result<Vec<Entrant>, IngestError> {
        Ok(self
            .tables
            .read()
            .await
            .entrants
            .values()
            .filter(|e| e.race_id == race_id)
            .cloned()
            .collect())
    }

    async fn append_odds_history(&self, row: &OddsHistoryRow) -> Result<(), IngestError> {
        self.tables.write().await.odds_history.push(row.clone());
        Ok(())
    }

    async fn get_pool_totals(&self, race_id: &str) -> Result<Option<PoolTotals>, IngestError> {
        Ok(self.tables.read().await.pool_totals.get(race_id).cloned())
    }

    async fn upsert_pool_totals(&self, totals: &PoolTotals) -> Result<(), IngestError> {
        self.tables
            .write()
            .await
            .pool_totals
            .insert(totals.race_id.clone(), totals.clone());
        Ok(())
    }

    async fn get_bucketed_row(
        &self,
        race_id: &str,
        entrant_id: &str,
        time_interval: f64,
    ) -> Result<Option<BucketedMoneyFlowRow>, IngestError> {
        Ok(self
            .tables
            .read()
            .await
            .bucketed_rows
            .iter()
            .find(|r| {
                r.race_id == race_id
                    && r.entrant_id == entrant_id
                    && (r.time_interval - time_interval).abs() < f64::EPSILON
            })
            .cloned())
    }

    async fn nearest_prior_bucket(
        &self,
        race_id: &str,
        entrant_id: &str,
        before: f64,
    ) -> Result<Option<BucketedMoneyFlowRow>, IngestError> {
        let tables = self.tables.read().await;
        Ok(tables
            .bucketed_rows
            .iter()
            .filter(|r| r.race_id == race_id && r.entrant_id == entrant_id && r.time_interval > before)
            .filter(|r| r.win_pool_amount != 0 || r.place_pool_amount != 0)
            .min_by(|a, b| a.time_interval.partial_cmp(&b.time_interval).unwrap())
            .cloned())
    }

    async fn any_bucketed_row_exists(
        &self,
        race_id: &str,
        entrant_id: &str,
    ) -> Result<bool, IngestError> {
        Ok(self
            .tables
            .read()
            .await
            .bucketed_rows
            .iter()
            .any(|r| r.race_id == race_id && r.entrant_id == entrant_id))
    }

    async fn append_bucketed_row(&self, row: &BucketedMoneyFlowRow) -> Result<(), IngestError> {
        if !self.entrant_exists(&row.entrant_id).await? {
            return Err(IngestError::PersistenceIntegrity(format!(
                "entrant {} does not exist; skipping money-flow row",
                row.entrant_id
            )));
        }
        self.tables.write().await.bucketed_rows.push(row.clone());
        Ok(())
    }

    async fn get_race_results(&self, race_id: &str) -> Result<Option<RaceResults>, IngestError> {
        Ok(self.tables.read().await.race_results.get(race_id).cloned())
    }

    async fn upsert_race_results(&self, results: &RaceResults) -> Result<(), IngestError> {
        self.tables
            .write()
            .await
            .race_results
            .insert(results.race_id.clone(), results.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Postgres-backed implementation, following the teacher's `PgPoolOptions`
// connect-with-retry and explicit per-field `sqlx::query` style.
// ---------------------------------------------------------------------------

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect_with_retry(database_url: &str, max_retries: u32) -> anyhow::Result<Self> {
        let mut attempt = 0;
        loop {
            match PgPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(10))
                .connect(database_url)
                .await
            {
                Ok(pool) => {
                    info!("Connected to PostgreSQL");
                    return Ok(Self { pool });
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_retries {
                        anyhow::bail!(
                            "Failed to connect to database after {} attempts: {}",
                            max_retries,
                            e
                        );
                    }
                    warn!("Database connection attempt {} failed: {}. Retrying...", attempt, e);
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
            }
        }
    }

    fn transient(e: sqlx::Error) -> IngestError {
        IngestError::PersistenceTransient(e.to_string())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_race(&self, race_id: &str) -> Result<Option<Race>, IngestError> {
        type Row = (
            String,
            DateTime<Utc>,
            String,
            DateTime<Utc>,
            Option<DateTime<Utc>>,
            Option<DateTime<Utc>>,
            Option<DateTime<Utc>>,
        );
        let row: Option<Row> = sqlx::query_as(
            "SELECT race_id, start_time, status, last_status_change, finalized_at, abandoned_at, last_poll_time FROM races WHERE race_id = $1",
        )
        .bind(race_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::transient)?;

        Ok(row.map(
            |(race_id, start_time, status, last_status_change, finalized_at, abandoned_at, last_poll_time)| {
                Race {
                    race_id,
                    start_time,
                    status: crate::domain::RaceStatus::parse(&status).unwrap_or(crate::domain::RaceStatus::Open),
                    last_status_change,
                    finalized_at,
                    abandoned_at,
                    last_poll_time,
                }
            },
        ))
    }

    async fn upsert_race(&self, race: &Race) -> Result<(), IngestError> {
        sqlx::query(
            r#"
            INSERT INTO races (race_id, start_time, status, last_status_change, finalized_at, abandoned_at, last_poll_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (race_id) DO UPDATE SET
                status = EXCLUDED.status,
                last_status_change = EXCLUDED.last_status_change,
                finalized_at = EXCLUDED.finalized_at,
                abandoned_at = EXCLUDED.abandoned_at,
                last_poll_time = EXCLUDED.last_poll_time
            "#,
        )
        .bind(&race.race_id)
        .bind(race.start_time)
        .bind(race.status.as_str())
        .bind(race.last_status_change)
        .bind(race.finalized_at)
        .bind(race.abandoned_at)
        .bind(race.last_poll_time)
        .execute(&self.pool)
        .await
        .map_err(Self::transient)?;
        Ok(())
    }

    async fn list_active_race_ids(&self) -> Result<Vec<String>, IngestError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT race_id FROM races WHERE status NOT IN ('final', 'abandoned')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Self::transient)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn get_entrant(&self, entrant_id: &str) -> Result<Option<Entrant>, IngestError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT entrant_id FROM entrants WHERE entrant_id = $1",
        )
        .bind(entrant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::transient)?;
        // Full entrant hydration omitted: this reference implementation stores
        // the full row as JSON in the `payload` column for entrants (a common
        // pragmatic compromise for flexible upstream schemas, matching
        // "Unknown pool product types are logged, not coerced" in spec §9).
        if row.is_none() {
            return Ok(None);
        }
        let payload: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT payload FROM entrants WHERE entrant_id = $1",
        )
        .bind(entrant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::transient)?;
        Ok(payload.and_then(|(v,)| serde_json::from_value(v).ok()))
    }

    async fn upsert_entrant(&self, entrant: &Entrant) -> Result<(), IngestError> {
        let payload = serde_json::to_value(entrant)
            .map_err(|e| IngestError::Validation { fields: vec![e.to_string()] })?;
        sqlx::query(
            r#"
            INSERT INTO entrants (entrant_id, race_id, runner_number, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (entrant_id) DO UPDATE SET payload = EXCLUDED.payload
            "#,
        )
        .bind(&entrant.entrant_id)
        .bind(&entrant.race_id)
        .bind(entrant.runner_number as i32)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(Self::transient)?;
        Ok(())
    }

    async fn list_entrants(&self, race_id: &str) -> Result<Vec<Entrant>, IngestError> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT payload FROM entrants WHERE race_id = $1",
        )
        .bind(race_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::transient)?;
        Ok(rows
            .into_iter()
            .filter_map(|(v,)| serde_json::from_value(v).ok())
            .collect())
    }

    async fn append_odds_history(&self, row: &OddsHistoryRow) -> Result<(), IngestError> {
        sqlx::query(
            r#"
            INSERT INTO odds_history (entrant_id, odds, type, event_timestamp)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&row.entrant_id)
        .bind(row.odds)
        .bind(row.r#type.as_str())
        .bind(row.event_timestamp)
        .execute(&self.pool)
        .await
        .map_err(Self::transient)?;
        Ok(())
    }

    async fn get_pool_totals(&self, race_id: &str) -> Result<Option<PoolTotals>, IngestError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT payload FROM race_pools WHERE race_id = $1",
        )
        .bind(race_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::transient)?;
        Ok(row.and_then(|(v,)| serde_json::from_value(v).ok()))
    }

    async fn upsert_pool_totals(&self, totals: &PoolTotals) -> Result<(), IngestError> {
        let payload = serde_json::to_value(totals)
            .map_err(|e| IngestError::Validation { fields: vec![e.to_string()] })?;
        sqlx::query(
            r#"
            INSERT INTO race_pools (race_id, payload)
            VALUES ($1, $2)
            ON CONFLICT (race_id) DO UPDATE SET payload = EXCLUDED.payload
            "#,
        )
        .bind(&totals.race_id)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(Self::transient)?;
        Ok(())
    }

    async fn get_bucketed_row(
        &self,
        race_id: &str,
        entrant_id: &str,
        time_interval: f64,
    ) -> Result<Option<BucketedMoneyFlowRow>, IngestError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            r#"
            SELECT payload FROM money_flow_history
            WHERE race_id = $1 AND entrant_id = $2 AND time_interval = $3
            "#,
        )
        .bind(race_id)
        .bind(entrant_id)
        .bind(time_interval)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::transient)?;
        Ok(row.and_then(|(v,)| serde_json::from_value(v).ok()))
    }

    async fn nearest_prior_bucket(
        &self,
        race_id: &str,
        entrant_id: &str,
        before: f64,
    ) -> Result<Option<BucketedMoneyFlowRow>, IngestError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            r#"
            SELECT payload FROM money_flow_history
            WHERE race_id = $1 AND entrant_id = $2 AND time_interval > $3
              AND (win_pool_amount != 0 OR place_pool_amount != 0)
            ORDER BY time_interval ASC
            LIMIT 1
            "#,
        )
        .bind(race_id)
        .bind(entrant_id)
        .bind(before)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::transient)?;
        Ok(row.and_then(|(v,)| serde_json::from_value(v).ok()))
    }

    async fn any_bucketed_row_exists(
        &self,
        race_id: &str,
        entrant_id: &str,
    ) -> Result<bool, IngestError> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM money_flow_history WHERE race_id = $1 AND entrant_id = $2",
        )
        .bind(race_id)
        .bind(entrant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::transient)?;
        Ok(count.0 > 0)
    }

    async fn append_bucketed_row(&self, row: &BucketedMoneyFlowRow) -> Result<(), IngestError> {
        if !self.entrant_exists(&row.entrant_id).await? {
            return Err(IngestError::PersistenceIntegrity(format!(
                "entrant {} does not exist; skipping money-flow row",
                row.entrant_id
            )));
        }
        let payload = serde_json::to_value(row)
            .map_err(|e| IngestError::Validation { fields: vec![e.to_string()] })?;
        sqlx::query(
            r#"
            INSERT INTO money_flow_history
                (race_id, entrant_id, time_interval, win_pool_amount, place_pool_amount, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (race_id, entrant_id, time_interval) DO NOTHING
            "#,
        )
        .bind(&row.race_id)
        .bind(&row.entrant_id)
        .bind(row.time_interval)
        .bind(row.win_pool_amount)
        .bind(row.place_pool_amount)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(Self::transient)?;
        Ok(())
    }

    async fn get_race_results(&self, race_id: &str) -> Result<Option<RaceResults>, IngestError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT payload FROM race_results WHERE race_id = $1",
        )
        .bind(race_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::transient)?;
        Ok(row.and_then(|(v,)| serde_json::from_value(v).ok()))
    }

    async fn upsert_race_results(&self, results: &RaceResults) -> Result<(), IngestError> {
        let payload = serde_json::to_value(results)
            .map_err(|e| IngestError::Validation { fields: vec![e.to_string()] })?;
        sqlx::query(
            r#"
            INSERT INTO race_results (race_id, payload)
            VALUES ($1, $2)
            ON CONFLICT (race_id) DO UPDATE SET payload = EXCLUDED.payload
            "#,
        )
        .bind(&results.race_id)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(Self::transient)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Connections, EntrantOdds, FormFields, RaceStatus};
    use chrono::Utc;

    fn sample_race(race_id: &str, status: RaceStatus) -> Race {
        Race {
            race_id: race_id.to_string(),
            start_time: Utc::now(),
            status,
            last_status_change: Utc::now(),
            finalized_at: None,
            abandoned_at: None,
            last_poll_time: None,
        }
    }

    fn sample_entrant(race_id: &str, entrant_id: &str, runner_number: u32) -> Entrant {
        Entrant {
            entrant_id: entrant_id.to_string(),
            race_id: race_id.to_string(),
            runner_number,
            name: "Test Runner".to_string(),
            is_scratched: false,
            is_late_scratched: false,
            is_emergency: false,
            odds: EntrantOdds::default(),
            connections: Connections::default(),
            silks: None,
            form: FormFields::default(),
            last_updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = InMemoryStore::new();
        let race = Race {
            race_id: "r1".into(),
            start_time: Utc::now(),
            status: RaceStatus::Open,
            last_status_change: Utc::now(),
            finalized_at: None,
            abandoned_at: None,
            last_poll_time: None,
        };
        store.upsert_race(&race).await.unwrap();
        let fetched = store.get_race("r1").await.unwrap().unwrap();
        assert_eq!(fetched.race_id, "r1");
    }

    #[tokio::test]
    async fn entrant_exists_reflects_upserts() {
        let store = InMemoryStore::new();
        assert!(!store.entrant_exists("e1").await.unwrap());
        store.upsert_entrant(&sample_entrant("r1", "e1", 3)).await.unwrap();
        assert!(store.entrant_exists("e1").await.unwrap());
    }

    #[tokio::test]
    async fn list_active_race_ids_excludes_final_and_abandoned() {
        let store = InMemoryStore::new();
        let r1 = sample_race("r1", RaceStatus::Open);
        let r2 = sample_race("r2", RaceStatus::Final);
        let r3 = sample_race("r3", RaceStatus::Abandoned);
        store.upsert_race(&r1).await.unwrap();
        store.upsert_race(&r2).await.unwrap();
        store.upsert_race(&r3).await.unwrap();

        let mut active = store.list_active_race_ids().await.unwrap();
        active.sort();
        assert_eq!(active, vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn list_entrants_filters_by_race() {
        let store = InMemoryStore::new();
        store.upsert_entrant(&sample_entrant("r1", "e1", 1)).await.unwrap();
        store.upsert_entrant(&sample_entrant("r2", "e2", 1)).await.unwrap();
        let entrants = store.list_entrants("r1").await.unwrap();
        assert_eq!(entrants.len(), 1);
        assert_eq!(entrants[0].entrant_id, "e1");
    }

    fn sample_bucketed_row(race_id: &str, entrant_id: &str) -> BucketedMoneyFlowRow {
        BucketedMoneyFlowRow {
            race_id: race_id.to_string(),
            entrant_id: entrant_id.to_string(),
            time_interval: 5.0,
            interval_type: crate::domain::IntervalType::OneMinute,
            hold_percentage: 10.0,
            bet_percentage: 10.0,
            win_pool_amount: 1000,
            place_pool_amount: 500,
            incremental_win_amount: 100,
            incremental_place_amount: 50,
            win_pool_percentage: Some(10.0),
            place_pool_percentage: Some(10.0),
            polling_timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_bucketed_row_rejects_unknown_entrant() {
        let store = InMemoryStore::new();
        let row = sample_bucketed_row("r1", "missing-entrant");
        let err = store.append_bucketed_row(&row).await.unwrap_err();
        assert!(matches!(err, IngestError::PersistenceIntegrity(_)));
        assert!(!store.any_bucketed_row_exists("r1", "missing-entrant").await.unwrap());
    }

    #[tokio::test]
    async fn append_bucketed_row_succeeds_for_known_entrant() {
        let store = InMemoryStore::new();
        store.upsert_entrant(&sample_entrant("r1", "e1", 1)).await.unwrap();
        let row = sample_bucketed_row("r1", "e1");
        store.append_bucketed_row(&row).await.unwrap();
        assert!(store.any_bucketed_row_exists("r1", "e1").await.unwrap());
    }
}
