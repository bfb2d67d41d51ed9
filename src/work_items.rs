use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, trace};

use crate::aggregator::AggregatedSearch;
use crate::db::SharedConnection;
use crate::errors::{AppError, AppResult};
use crate::grid::GridPoint;

const SELECT_COLUMNS: &str = "id, latitude, longitude, status, created_at, updated_at, processed_at, \
error_message, restaurants_found, api_calls_made, retry_count, max_retries, response_body";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Completed,
    Error,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Completed => "completed",
            WorkStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "pending" => Ok(WorkStatus::Pending),
            "completed" => Ok(WorkStatus::Completed),
            "error" => Ok(WorkStatus::Error),
            other => Err(AppError::Config(format!("unknown work item status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkItem {
    pub id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub status: WorkStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub restaurants_found: u32,
    pub api_calls_made: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Value>,
}

impl WorkItem {
    pub fn point(&self) -> GridPoint {
        GridPoint::new(self.latitude, self.longitude)
    }

    pub fn is_retry_eligible(&self) -> bool {
        self.status == WorkStatus::Error && self.retry_count < self.max_retries
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SeedSummary {
    pub requested: usize,
    pub inserted: usize,
    pub already_present: usize,
    pub max_retries: u32,
}

/// Durable per-cell work items; every mutation touches exactly one row.
#[derive(Clone)]
pub struct WorkItemStore {
    db: SharedConnection,
}

impl WorkItemStore {
    pub fn new(db: SharedConnection) -> Self {
        Self { db }
    }

    /// Inserts one pending item per point in a single transaction; cells already seeded are kept.
    pub fn seed(&self, points: &[GridPoint], max_retries: u32) -> AppResult<SeedSummary> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let now = Utc::now();
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO data_collection_api_calls
                    (latitude, longitude, status, created_at, max_retries)
                VALUES (?1, ?2, 'pending', ?3, ?4)",
            )?;
            for point in points {
                inserted += stmt.execute(params![point.latitude, point.longitude, now, max_retries])?;
            }
        }
        tx.commit()?;

        info!(
            target: "work_items",
            requested = points.len(),
            inserted,
            "grid seeded"
        );
        Ok(SeedSummary {
            requested: points.len(),
            inserted,
            already_present: points.len() - inserted,
            max_retries,
        })
    }

    pub fn get(&self, id: i64) -> AppResult<Option<WorkItem>> {
        let conn = self.db.lock();
        conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM data_collection_api_calls WHERE id = ?1"),
            [id],
            parse_work_item,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn next_pending(&self, limit: usize) -> AppResult<Vec<WorkItem>> {
        self.select(
            "WHERE status = 'pending' ORDER BY id ASC LIMIT ?1",
            params![limit as i64],
        )
    }

    pub fn retry_candidates(&self) -> AppResult<Vec<WorkItem>> {
        self.select(
            "WHERE status = 'error' AND retry_count < max_retries ORDER BY id ASC",
            params![],
        )
    }

    /// Items that failed and used up every retry; they stay visible but are never picked again.
    pub fn exhausted(&self, limit: usize) -> AppResult<Vec<WorkItem>> {
        self.select(
            "WHERE status = 'error' AND retry_count >= max_retries ORDER BY id ASC LIMIT ?1",
            params![limit as i64],
        )
    }

    pub fn completed(&self) -> AppResult<Vec<WorkItem>> {
        self.select("WHERE status = 'completed' ORDER BY id ASC", params![])
    }

    /// pending|error → completed. `api_calls_made` accumulates across attempts.
    pub fn mark_completed(&self, id: i64, search: &AggregatedSearch) -> AppResult<bool> {
        let body = serde_json::to_string(&search.response_body())?;
        let now = Utc::now();
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE data_collection_api_calls
            SET status = 'completed',
                processed_at = ?2,
                updated_at = ?2,
                error_message = NULL,
                response_body = ?3,
                restaurants_found = ?4,
                api_calls_made = api_calls_made + ?5
            WHERE id = ?1 AND status IN ('pending', 'error')",
            params![id, now, body, search.results.len() as i64, search.api_calls],
        )?;
        trace!(target: "work_items", id, updated, "work item completed");
        Ok(updated == 1)
    }

    /// pending|error → error, bumping `retry_count`.
    pub fn mark_failed(&self, id: i64, message: &str, api_calls: u32) -> AppResult<bool> {
        let now = Utc::now();
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE data_collection_api_calls
            SET status = 'error',
                updated_at = ?2,
                error_message = ?3,
                retry_count = retry_count + 1,
                api_calls_made = api_calls_made + ?4
            WHERE id = ?1 AND status IN ('pending', 'error')",
            params![id, now, message, api_calls],
        )?;
        trace!(target: "work_items", id, updated, "work item failed");
        Ok(updated == 1)
    }

    /// Grants `extra` more attempts to every exhausted item.
    pub fn raise_retry_ceiling(&self, extra: u32) -> AppResult<usize> {
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE data_collection_api_calls
            SET max_retries = max_retries + ?1,
                updated_at = ?2
            WHERE status = 'error' AND retry_count >= max_retries",
            params![extra, Utc::now()],
        )?;
        info!(target: "work_items", updated, extra, "retry ceiling raised");
        Ok(updated)
    }

    fn select(&self, clause: &str, params: &[&dyn rusqlite::ToSql]) -> AppResult<Vec<WorkItem>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM data_collection_api_calls {clause}"
        ))?;
        let items = stmt
            .query_map(params, parse_work_item)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }
}

fn parse_work_item(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    let status: String = row.get(3)?;
    let status = WorkStatus::parse(&status).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(err))
    })?;
    let body: Option<String> = row.get(12)?;
    let response_body = body
        .map(|text| serde_json::from_str::<Value>(&text))
        .transpose()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(12, Type::Text, Box::new(err)))?;

    Ok(WorkItem {
        id: row.get(0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        status,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        processed_at: row.get(6)?,
        error_message: row.get(7)?,
        restaurants_found: row.get(8)?,
        api_calls_made: row.get(9)?,
        retry_count: row.get(10)?,
        max_retries: row.get(11)?,
        response_body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::tests::hit;
    use crate::db::open_in_memory;

    fn store_with(points: &[GridPoint]) -> WorkItemStore {
        let store = WorkItemStore::new(open_in_memory().unwrap());
        store.seed(points, 3).unwrap();
        store
    }

    fn search_with(ids: &[&str], api_calls: u32) -> AggregatedSearch {
        AggregatedSearch {
            results: ids.iter().map(|id| hit(id, id)).collect(),
            api_calls,
            queries: Vec::new(),
        }
    }

    #[test]
    fn seeds_pending_items_once_per_cell() {
        let points = [GridPoint::new(1.0, 2.0), GridPoint::new(1.0, 2.01)];
        let store = store_with(&points);
        let again = store.seed(&points, 3).unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.already_present, 2);

        let pending = store.next_pending(10).unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|item| item.status == WorkStatus::Pending
            && item.retry_count == 0
            && item.max_retries == 3
            && item.response_body.is_none()));
        assert_eq!(store.next_pending(1).unwrap().len(), 1);
    }

    #[test]
    fn completion_keeps_retry_count_and_stores_body() {
        let store = store_with(&[GridPoint::new(1.0, 2.0)]);
        let id = store.next_pending(1).unwrap()[0].id;

        assert!(store.mark_completed(id, &search_with(&["a", "b"], 6)).unwrap());
        let item = store.get(id).unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Completed);
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.restaurants_found, 2);
        assert_eq!(item.api_calls_made, 6);
        assert!(item.processed_at.is_some());
        let body = item.response_body.unwrap();
        assert_eq!(body["results"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn failures_increment_retries_until_exhausted() {
        let store = store_with(&[GridPoint::new(1.0, 2.0)]);
        let id = store.next_pending(1).unwrap()[0].id;

        assert!(store.mark_failed(id, "boom", 2).unwrap());
        let item = store.get(id).unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Error);
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.error_message.as_deref(), Some("boom"));
        assert!(item.is_retry_eligible());

        store.mark_failed(id, "boom", 1).unwrap();
        store.mark_failed(id, "boom", 1).unwrap();
        let item = store.get(id).unwrap().unwrap();
        assert_eq!(item.retry_count, 3);
        assert_eq!(item.api_calls_made, 4);
        assert!(!item.is_retry_eligible());
        assert!(store.retry_candidates().unwrap().is_empty());
        assert_eq!(store.exhausted(10).unwrap().len(), 1);

        assert_eq!(store.raise_retry_ceiling(2).unwrap(), 1);
        assert_eq!(store.retry_candidates().unwrap().len(), 1);
    }

    #[test]
    fn recovery_clears_error_and_accumulates_calls() {
        let store = store_with(&[GridPoint::new(1.0, 2.0)]);
        let id = store.next_pending(1).unwrap()[0].id;
        store.mark_failed(id, "timeout", 3).unwrap();
        store.mark_completed(id, &search_with(&["a"], 6)).unwrap();

        let item = store.get(id).unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Completed);
        assert_eq!(item.error_message, None);
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.api_calls_made, 9);
    }

    #[test]
    fn completed_items_are_never_transitioned_again() {
        let store = store_with(&[GridPoint::new(1.0, 2.0)]);
        let id = store.next_pending(1).unwrap()[0].id;
        store.mark_completed(id, &search_with(&["a"], 6)).unwrap();

        assert!(!store.mark_failed(id, "late failure", 1).unwrap());
        assert!(!store.mark_completed(id, &search_with(&[], 1)).unwrap());
        assert_eq!(store.get(id).unwrap().unwrap().restaurants_found, 1);
    }
}
