use serde::Serialize;

use crate::db::SharedConnection;
use crate::errors::AppResult;

const DEFAULT_TOP_CITIES: usize = 20;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CollectionStats {
    pub total: u64,
    pub pending: u64,
    pub completed: u64,
    pub error: u64,
    pub retryable: u64,
    pub exhausted: u64,
    pub completion_percentage: f64,
    pub error_percentage: f64,
    pub total_api_calls: u64,
    pub total_restaurants_found: u64,
    pub restaurants_per_call: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Bucket {
    pub label: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RestaurantStats {
    pub total: u64,
    pub by_city: Vec<Bucket>,
    pub by_rating: Vec<Bucket>,
    pub by_price_range: Vec<Bucket>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsReport {
    pub collection: CollectionStats,
    pub restaurants: RestaurantStats,
}

/// Read-only aggregation over both stores.
#[derive(Clone)]
pub struct StatsReporter {
    db: SharedConnection,
}

impl StatsReporter {
    pub fn new(db: SharedConnection) -> Self {
        Self { db }
    }

    pub fn report(&self) -> AppResult<StatsReport> {
        Ok(StatsReport {
            collection: self.collection()?,
            restaurants: self.restaurants(DEFAULT_TOP_CITIES)?,
        })
    }

    pub fn collection(&self) -> AppResult<CollectionStats> {
        let conn = self.db.lock();
        let (total, pending, completed, error, retryable, exhausted, calls, found) = conn.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(status = 'pending'), 0),
                COALESCE(SUM(status = 'completed'), 0),
                COALESCE(SUM(status = 'error'), 0),
                COALESCE(SUM(status = 'error' AND retry_count < max_retries), 0),
                COALESCE(SUM(status = 'error' AND retry_count >= max_retries), 0),
                COALESCE(SUM(api_calls_made), 0),
                COALESCE(SUM(restaurants_found), 0)
            FROM data_collection_api_calls",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                    row.get::<_, i64>(3)? as u64,
                    row.get::<_, i64>(4)? as u64,
                    row.get::<_, i64>(5)? as u64,
                    row.get::<_, i64>(6)? as u64,
                    row.get::<_, i64>(7)? as u64,
                ))
            },
        )?;

        Ok(CollectionStats {
            total,
            pending,
            completed,
            error,
            retryable,
            exhausted,
            completion_percentage: percentage(completed, total),
            error_percentage: percentage(error, total),
            total_api_calls: calls,
            total_restaurants_found: found,
            restaurants_per_call: ratio(found, calls),
        })
    }

    pub fn restaurants(&self, top_cities: usize) -> AppResult<RestaurantStats> {
        let total = {
            let conn = self.db.lock();
            conn.query_row("SELECT COUNT(*) FROM restaurants", [], |row| row.get::<_, i64>(0))?
                as u64
        };

        Ok(RestaurantStats {
            total,
            by_city: self.buckets(
                "SELECT COALESCE(city, 'unknown') AS label, COUNT(*) AS n
                FROM restaurants GROUP BY label ORDER BY n DESC, label ASC LIMIT ?1",
                top_cities,
            )?,
            by_rating: self.buckets(
                "SELECT CASE
                    WHEN rating IS NULL THEN 'unrated'
                    WHEN rating >= 4.5 THEN '4.5+'
                    WHEN rating >= 4.0 THEN '4.0-4.4'
                    WHEN rating >= 3.0 THEN '3.0-3.9'
                    ELSE 'below 3.0'
                END AS label, COUNT(*) AS n
                FROM restaurants GROUP BY label ORDER BY label ASC LIMIT ?1",
                usize::MAX,
            )?,
            by_price_range: self.buckets(
                "SELECT COALESCE(price_range, 'unknown') AS label, COUNT(*) AS n
                FROM restaurants GROUP BY label ORDER BY label ASC LIMIT ?1",
                usize::MAX,
            )?,
        })
    }

    fn buckets(&self, sql: &str, limit: usize) -> AppResult<Vec<Bucket>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.db.lock();
        let mut stmt = conn.prepare(sql)?;
        let buckets = stmt
            .query_map([limit], |row| {
                Ok(Bucket {
                    label: row.get(0)?,
                    count: row.get::<_, i64>(1)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(buckets)
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `part / whole × 100` to two decimals, 0 when `whole` is 0.
pub fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        round2(part as f64 / whole as f64 * 100.0)
    }
}

/// `num / den` to two decimals, 0 when `den` is 0.
pub fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        round2(num as f64 / den as f64)
    }
}
