use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::grid::BoundingBox;

pub const DEFAULT_PLACES_API_BASE: &str = "https://maps.googleapis.com/maps/api/place";
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Clone, Debug)]
pub struct PacingConfig {
    pub page_token_delay: Duration,
    pub query_delay: Duration,
    pub batch_cooldown: Duration,
    pub detail_cooldown: Duration,
    pub detail_calls_per_cooldown: usize,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            page_token_delay: Duration::from_millis(2_000),
            query_delay: Duration::from_millis(1_000),
            batch_cooldown: Duration::from_millis(30_000),
            detail_cooldown: Duration::from_millis(30_000),
            detail_calls_per_cooldown: 20,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub google_places_api_key: Option<SecretString>,
    pub places_api_base: String,
    pub places_rate_limit_qps: u32,
    pub http_timeout_secs: u64,
    pub search_radius_meters: u32,
    pub database_path: String,
    pub bind_addr: String,
    pub grid: BoundingBox,
    pub grid_step: f64,
    pub default_max_retries: u32,
    pub retry_batch_size: usize,
    pub pacing: PacingConfig,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub places_api_base: String,
    pub places_rate_limit_qps: u32,
    pub search_radius_meters: u32,
    pub database_path: String,
    pub grid: BoundingBox,
    pub grid_step: f64,
    pub default_max_retries: u32,
    pub retry_batch_size: usize,
    pub page_token_delay_ms: u64,
    pub query_delay_ms: u64,
    pub batch_cooldown_ms: u64,
    pub detail_cooldown_ms: u64,
    pub detail_calls_per_cooldown: usize,
    pub has_google_places_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = PacingConfig::default();
        Self {
            google_places_api_key: env::var("GOOGLE_PLACES_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            places_api_base: env::var("PLACES_API_BASE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PLACES_API_BASE.to_string()),
            places_rate_limit_qps: parse_u32("PLACES_RATE_LIMIT_QPS", 5).max(1),
            http_timeout_secs: parse_u64("HTTP_TIMEOUT_SECS", 10),
            search_radius_meters: parse_u32("SEARCH_RADIUS_METERS", 1_000),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "places-grid.db".to_string()),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            grid: BoundingBox {
                min_lat: parse_f64("GRID_MIN_LAT", 43.47),
                max_lat: parse_f64("GRID_MAX_LAT", 43.63),
                min_lng: parse_f64("GRID_MIN_LNG", -79.64),
                max_lng: parse_f64("GRID_MAX_LNG", -79.12),
            },
            grid_step: parse_f64("GRID_STEP", 0.01),
            default_max_retries: parse_u32("DEFAULT_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            retry_batch_size: parse_usize("RETRY_BATCH_SIZE", 10).max(1),
            pacing: PacingConfig {
                page_token_delay: parse_millis("PAGE_TOKEN_DELAY_MS", defaults.page_token_delay),
                query_delay: parse_millis("QUERY_DELAY_MS", defaults.query_delay),
                batch_cooldown: parse_millis("BATCH_COOLDOWN_MS", defaults.batch_cooldown),
                detail_cooldown: parse_millis("DETAIL_COOLDOWN_MS", defaults.detail_cooldown),
                detail_calls_per_cooldown: parse_usize(
                    "DETAIL_CALLS_PER_COOLDOWN",
                    defaults.detail_calls_per_cooldown,
                )
                .max(1),
            },
        }
    }

    /// Returns the API key or fails before any external work is attempted.
    pub fn require_api_key(&self) -> AppResult<SecretString> {
        self.google_places_api_key
            .clone()
            .ok_or(AppError::MissingApiKey)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            places_api_base: self.places_api_base.clone(),
            places_rate_limit_qps: self.places_rate_limit_qps,
            search_radius_meters: self.search_radius_meters,
            database_path: self.database_path.clone(),
            grid: self.grid,
            grid_step: self.grid_step,
            default_max_retries: self.default_max_retries,
            retry_batch_size: self.retry_batch_size,
            page_token_delay_ms: self.pacing.page_token_delay.as_millis() as u64,
            query_delay_ms: self.pacing.query_delay.as_millis() as u64,
            batch_cooldown_ms: self.pacing.batch_cooldown.as_millis() as u64,
            detail_cooldown_ms: self.pacing.detail_cooldown.as_millis() as u64,
            detail_calls_per_cooldown: self.pacing.detail_calls_per_cooldown,
            has_google_places_key: self.google_places_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn parse_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
