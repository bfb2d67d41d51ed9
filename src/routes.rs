//! HTTP surface for operating the collection pipeline.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::aggregator::LocationAggregator;
use crate::config::{AppConfig, PublicAppConfig};
use crate::db::SharedConnection;
use crate::enrichment::{Enricher, EnrichmentSummary};
use crate::errors::{AppError, AppResult};
use crate::grid::{self, BoundingBox};
use crate::pacing::Pacer;
use crate::places::{HttpPlacesClient, PlaceSearch};
use crate::processor::{BatchProcessor, BatchSummary, RunGuard};
use crate::restaurants::RestaurantStore;
use crate::stats::{StatsReport, StatsReporter};
use crate::work_items::{SeedSummary, WorkItem, WorkItemStore};

const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_FAILED_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: SharedConnection,
    pub pacer: Arc<dyn Pacer>,
    places: Option<Arc<dyn PlaceSearch>>,
    run_guard: RunGuard,
    cancel_flag: Arc<AtomicBool>,
}

impl AppState {
    /// Builds the shared Places client once so every run shares one rate limiter.
    ///
    /// A missing API key is not fatal here: read-only routes keep working and every
    /// route that would call the API fails up front instead.
    pub fn new(config: AppConfig, db: SharedConnection, pacer: Arc<dyn Pacer>) -> AppResult<Self> {
        let places = match HttpPlacesClient::from_config(&config, pacer.clone()) {
            Ok(client) => {
                info!(
                    target: "routes",
                    qps = client.rate_limit_qps(),
                    "places client ready"
                );
                Some(Arc::new(client) as Arc<dyn PlaceSearch>)
            }
            Err(AppError::MissingApiKey) => {
                warn!(target: "routes", "GOOGLE_PLACES_API_KEY missing; collection routes disabled");
                None
            }
            Err(err) => return Err(err),
        };

        Ok(Self {
            config: Arc::new(config),
            db,
            pacer,
            places,
            run_guard: RunGuard::default(),
            cancel_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_places(mut self, places: Arc<dyn PlaceSearch>) -> Self {
        self.places = Some(places);
        self
    }

    /// Raised on shutdown; running passes stop at the next item boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel_flag.clone()
    }

    fn places(&self) -> AppResult<Arc<dyn PlaceSearch>> {
        self.places.clone().ok_or(AppError::MissingApiKey)
    }

    fn work_items(&self) -> WorkItemStore {
        WorkItemStore::new(self.db.clone())
    }

    fn processor(&self) -> AppResult<BatchProcessor> {
        let aggregator = LocationAggregator::new(
            self.places()?,
            self.pacer.clone(),
            self.config.search_radius_meters,
        );
        Ok(
            BatchProcessor::new(self.work_items(), Arc::new(aggregator), self.pacer.clone())
                .with_run_guard(self.run_guard.clone())
                .with_cancel_flag(self.cancel_flag()),
        )
    }

    fn enricher(&self) -> AppResult<Enricher> {
        Ok(Enricher::new(
            self.work_items(),
            RestaurantStore::new(self.db.clone()),
            self.places()?,
            self.pacer.clone(),
            self.config.pacing.detail_calls_per_cooldown,
        )
        .with_run_guard(self.run_guard.clone())
        .with_cancel_flag(self.cancel_flag()))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(config))
        .route("/collection/seed", post(seed))
        .route("/collection/process", post(process))
        .route("/collection/retry", post(retry))
        .route("/collection/enrich", post(enrich))
        .route("/collection/stats", get(stats))
        .route("/collection/failed", get(failed))
        .route("/collection/retry-ceiling", post(retry_ceiling))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub places_configured: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        places_configured: state.places.is_some(),
    })
}

async fn config(State(state): State<AppState>) -> Json<PublicAppConfig> {
    Json(state.config.public_profile())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SeedRequest {
    pub bbox: Option<BoundingBox>,
    pub step: Option<f64>,
    pub max_retries: Option<u32>,
}

#[derive(Serialize)]
pub struct SeedResponse {
    pub bbox: BoundingBox,
    pub step: f64,
    #[serde(flatten)]
    pub summary: SeedSummary,
}

async fn seed(
    State(state): State<AppState>,
    Json(request): Json<SeedRequest>,
) -> AppResult<Json<SeedResponse>> {
    let bbox = request.bbox.unwrap_or(state.config.grid);
    let step = request.step.unwrap_or(state.config.grid_step);
    if !(step.is_finite() && step > 0.0) {
        return Err(AppError::InvalidRequest(format!("step must be positive, got {step}")));
    }
    if bbox.min_lat > bbox.max_lat || bbox.min_lng > bbox.max_lng {
        return Err(AppError::InvalidRequest(
            "bounding box minimums must not exceed maximums".into(),
        ));
    }

    let points = grid::generate(&bbox, step)?;
    let max_retries = request
        .max_retries
        .unwrap_or(state.config.default_max_retries);
    let summary = state.work_items().seed(&points, max_retries)?;
    Ok(Json(SeedResponse {
        bbox,
        step,
        summary,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct BatchParams {
    pub batch_size: Option<usize>,
}

impl BatchParams {
    fn resolve(&self, default: usize) -> AppResult<usize> {
        match self.batch_size {
            Some(0) => Err(AppError::InvalidRequest("batch_size must be at least 1".into())),
            Some(size) => Ok(size),
            None => Ok(default),
        }
    }
}

async fn process(
    State(state): State<AppState>,
    Query(params): Query<BatchParams>,
) -> AppResult<Json<BatchSummary>> {
    let batch_size = params.resolve(DEFAULT_BATCH_SIZE)?;
    let summary = state.processor()?.process_pending(batch_size).await?;
    Ok(Json(summary))
}

async fn retry(
    State(state): State<AppState>,
    Query(params): Query<BatchParams>,
) -> AppResult<Json<BatchSummary>> {
    let batch_size = params.resolve(state.config.retry_batch_size)?;
    let summary = state.processor()?.retry_failed(batch_size).await?;
    Ok(Json(summary))
}

async fn enrich(
    State(state): State<AppState>,
    Query(params): Query<BatchParams>,
) -> AppResult<Json<EnrichmentSummary>> {
    let batch_size = params.resolve(DEFAULT_BATCH_SIZE)?;
    let summary = state.enricher()?.enrich(batch_size).await?;
    Ok(Json(summary))
}

async fn stats(State(state): State<AppState>) -> AppResult<Json<StatsReport>> {
    Ok(Json(StatsReporter::new(state.db.clone()).report()?))
}

#[derive(Debug, Default, Deserialize)]
pub struct FailedParams {
    pub limit: Option<usize>,
}

async fn failed(
    State(state): State<AppState>,
    Query(params): Query<FailedParams>,
) -> AppResult<Json<Vec<WorkItem>>> {
    let limit = params.limit.unwrap_or(DEFAULT_FAILED_LIMIT);
    Ok(Json(state.work_items().exhausted(limit)?))
}

#[derive(Debug, Deserialize)]
pub struct RetryCeilingRequest {
    pub extra: u32,
}

#[derive(Serialize)]
pub struct RetryCeilingResponse {
    pub extra: u32,
    pub updated: usize,
}

async fn retry_ceiling(
    State(state): State<AppState>,
    Json(request): Json<RetryCeilingRequest>,
) -> AppResult<Json<RetryCeilingResponse>> {
    if request.extra == 0 {
        return Err(AppError::InvalidRequest("extra must be at least 1".into()));
    }
    let updated = state.work_items().raise_retry_ceiling(request.extra)?;
    Ok(Json(RetryCeilingResponse {
        extra: request.extra,
        updated,
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::config::PacingConfig;
    use crate::db::open_in_memory;
    use crate::grid::GridPoint;
    use crate::pacing::NoDelay;

    fn test_config() -> AppConfig {
        AppConfig {
            google_places_api_key: None,
            places_api_base: "http://127.0.0.1:9/place".into(),
            places_rate_limit_qps: 50,
            http_timeout_secs: 1,
            search_radius_meters: 500,
            database_path: ":memory:".into(),
            bind_addr: "127.0.0.1:0".into(),
            grid: BoundingBox {
                min_lat: 43.50,
                max_lat: 43.51,
                min_lng: -79.40,
                max_lng: -79.39,
            },
            grid_step: 0.01,
            default_max_retries: 3,
            retry_batch_size: 5,
            pacing: PacingConfig::default(),
        }
    }

    fn app() -> (Router, SharedConnection) {
        let db = open_in_memory().unwrap();
        let state = AppState::new(test_config(), db.clone(), Arc::new(NoDelay)).unwrap();
        (router(state), db)
    }

    async fn call(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn health_reports_missing_places_key() {
        let (app, _) = app();
        let (status, body) = call(app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["places_configured"], false);
    }

    #[tokio::test]
    async fn config_never_exposes_the_key() {
        let (app, _) = app();
        let (status, body) = call(app, Method::GET, "/config", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["has_google_places_key"], false);
        assert!(body.get("google_places_api_key").is_none());
    }

    #[tokio::test]
    async fn seeds_the_configured_grid_once() {
        let (app, _) = app();
        let (status, body) = call(app.clone(), Method::POST, "/collection/seed", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["requested"], 4);
        assert_eq!(body["inserted"], 4);

        let (_, again) = call(app, Method::POST, "/collection/seed", Some(json!({}))).await;
        assert_eq!(again["inserted"], 0);
        assert_eq!(again["already_present"], 4);
    }

    #[tokio::test]
    async fn rejects_a_non_positive_step() {
        let (app, _) = app();
        let (status, body) = call(
            app,
            Method::POST,
            "/collection/seed",
            Some(json!({ "step": 0.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn rejects_a_step_that_would_explode_the_grid() {
        let (app, db) = app();
        let (status, body) = call(
            app,
            Method::POST,
            "/collection/seed",
            Some(json!({
                "bbox": { "min_lat": 43.47, "max_lat": 43.63, "min_lng": -79.64, "max_lng": -79.12 },
                "step": 1e-7
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
        assert!(WorkItemStore::new(db).next_pending(1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn collection_without_key_fails_before_any_work() {
        let (app, db) = app();
        call(app.clone(), Method::POST, "/collection/seed", Some(json!({}))).await;

        let (status, body) = call(app, Method::POST, "/collection/process", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "MISSING_API_KEY");
        assert_eq!(WorkItemStore::new(db).next_pending(10).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn zero_batch_size_is_rejected() {
        let (app, _) = app();
        let (status, _) = call(app, Method::POST, "/collection/enrich?batch_size=0", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn lists_exhausted_items_and_raises_their_ceiling() {
        let (app, db) = app();
        let store = WorkItemStore::new(db);
        store.seed(&[GridPoint::new(1.0, 1.0)], 1).unwrap();
        let item = &store.next_pending(1).unwrap()[0];
        store.mark_failed(item.id, "boom", 1).unwrap();

        let (_, failed) = call(app.clone(), Method::GET, "/collection/failed", None).await;
        assert_eq!(failed.as_array().unwrap().len(), 1);
        assert_eq!(failed[0]["error_message"], "boom");

        let (status, body) = call(
            app.clone(),
            Method::POST,
            "/collection/retry-ceiling",
            Some(json!({ "extra": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["updated"], 1);

        let (_, failed) = call(app, Method::GET, "/collection/failed", None).await;
        assert!(failed.as_array().unwrap().is_empty());
        assert_eq!(store.retry_candidates().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stats_on_empty_database() {
        let (app, _) = app();
        let (status, body) = call(app, Method::GET, "/collection/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["collection"]["total"], 0);
        assert_eq!(body["collection"]["completion_percentage"], 0.0);
    }
}
