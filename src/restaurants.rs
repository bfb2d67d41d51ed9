use rusqlite::ffi::{ErrorCode, SQLITE_CONSTRAINT_UNIQUE};
use rusqlite::{params, Error as SqliteError, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use crate::db::SharedConnection;
use crate::errors::{AppError, AppResult};

/// Normalized restaurant ready to be written. `halal_status` is curated by hand and never set here.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NewRestaurant {
    pub place_id: String,
    pub name: String,
    pub description: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub opening_hours: Option<String>,
    pub cuisine_type: Option<String>,
    pub price_range: Option<String>,
    pub rating: Option<f64>,
    pub scraped_json: Option<Value>,
    pub additional_info: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Restaurant {
    pub id: i64,
    pub place_id: Option<String>,
    pub name: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub price_range: Option<String>,
    pub cuisine_type: Option<String>,
    pub halal_status: Option<String>,
    pub rating: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    Duplicate,
}

#[derive(Clone)]
pub struct RestaurantStore {
    db: SharedConnection,
}

impl RestaurantStore {
    pub fn new(db: SharedConnection) -> Self {
        Self { db }
    }

    pub fn exists(&self, place_id: &str) -> AppResult<bool> {
        let conn = self.db.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM restaurants WHERE place_id = ?1",
                [place_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn count(&self) -> AppResult<u64> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM restaurants", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn find_by_place_id(&self, place_id: &str) -> AppResult<Option<Restaurant>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT id, place_id, name, city, state, country, price_range, cuisine_type,
                halal_status, rating
            FROM restaurants WHERE place_id = ?1",
            [place_id],
            |row| {
                Ok(Restaurant {
                    id: row.get(0)?,
                    place_id: row.get(1)?,
                    name: row.get(2)?,
                    city: row.get(3)?,
                    state: row.get(4)?,
                    country: row.get(5)?,
                    price_range: row.get(6)?,
                    cuisine_type: row.get(7)?,
                    halal_status: row.get(8)?,
                    rating: row.get(9)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Writes one record in its own transaction; an existing `place_id` is a no-op.
    pub fn insert(&self, record: &NewRestaurant) -> AppResult<InsertOutcome> {
        let scraped_json = record
            .scraped_json
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM restaurants WHERE place_id = ?1",
                [&record.place_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(InsertOutcome::Duplicate);
        }

        let result = tx.execute(
            "INSERT INTO restaurants (
                place_id, name, description, address, city, state, country, latitude,
                longitude, phone, website, opening_hours, cuisine_type, price_range, rating,
                scraped_json, additional_info
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                record.place_id,
                record.name,
                record.description,
                record.address,
                record.city,
                record.state,
                record.country,
                record.latitude,
                record.longitude,
                record.phone,
                record.website,
                record.opening_hours,
                record.cuisine_type,
                record.price_range,
                record.rating,
                scraped_json,
                record.additional_info,
            ],
        );

        match result {
            Ok(_) => {
                let id = tx.last_insert_rowid();
                tx.commit()?;
                trace!(target: "restaurants", id, place_id = %record.place_id, "restaurant stored");
                Ok(InsertOutcome::Inserted(id))
            }
            // Another writer won the race on the unique place_id index.
            Err(SqliteError::SqliteFailure(error, _))
                if error.code == ErrorCode::ConstraintViolation
                    && error.extended_code == SQLITE_CONSTRAINT_UNIQUE =>
            {
                Ok(InsertOutcome::Duplicate)
            }
            Err(err) => Err(AppError::from(err)),
        }
    }
}
