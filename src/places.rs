use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::grid::GridPoint;
use crate::pacing::{Pacer, Pause, RateLimiter};

/// Raw Places payload kept verbatim; the upstream shape is not stable enough for a fixed schema.
pub type PlaceDocument = Map<String, Value>;

pub const DETAIL_FIELDS: &str = "name,formatted_address,formatted_phone_number,website,rating,\
user_ratings_total,opening_hours,price_level,types,business_status,geometry,photos,reviews,url,\
address_components,editorial_summary";

pub fn place_id_of(doc: &PlaceDocument) -> Option<&str> {
    doc.get("place_id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SearchKind {
    Text { query: String },
    Nearby { place_type: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchQuery {
    pub kind: SearchKind,
    pub location: GridPoint,
    pub radius_meters: u32,
}

impl SearchQuery {
    pub fn label(&self) -> String {
        match &self.kind {
            SearchKind::Text { query } => query.clone(),
            SearchKind::Nearby { place_type } => format!("nearby:{place_type}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    Ok,
    ZeroResults,
    InvalidRequest,
    OverQueryLimit,
    RequestDenied,
    Unknown(String),
    Transport(String),
}

impl SearchStatus {
    pub fn from_api(status: &str) -> Self {
        match status {
            "OK" => SearchStatus::Ok,
            "ZERO_RESULTS" => SearchStatus::ZeroResults,
            "INVALID_REQUEST" => SearchStatus::InvalidRequest,
            "OVER_QUERY_LIMIT" => SearchStatus::OverQueryLimit,
            "REQUEST_DENIED" => SearchStatus::RequestDenied,
            other => SearchStatus::Unknown(other.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SearchStatus::Ok | SearchStatus::ZeroResults)
    }

    pub fn describe(&self) -> String {
        match self {
            SearchStatus::Ok => "OK".into(),
            SearchStatus::ZeroResults => "ZERO_RESULTS".into(),
            SearchStatus::InvalidRequest => "INVALID_REQUEST".into(),
            SearchStatus::OverQueryLimit => "OVER_QUERY_LIMIT".into(),
            SearchStatus::RequestDenied => "REQUEST_DENIED".into(),
            SearchStatus::Unknown(status) => status.clone(),
            SearchStatus::Transport(reason) => format!("transport error: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchPage {
    pub results: Vec<PlaceDocument>,
    pub next_page_token: Option<String>,
    pub status: SearchStatus,
}

impl SearchPage {
    pub fn terminal(status: SearchStatus) -> Self {
        Self {
            results: Vec::new(),
            next_page_token: None,
            status,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DetailsOutcome {
    Found(PlaceDocument),
    NotFound,
    Failed(String),
}

/// Places web service operations used by the pipeline.
///
/// Implementations never return transport or API failures as errors; they are
/// folded into the returned status so callers can turn them into state.
#[async_trait]
pub trait PlaceSearch: Send + Sync {
    async fn search(&self, query: &SearchQuery, page_token: Option<&str>) -> SearchPage;

    async fn details(&self, place_id: &str) -> DetailsOutcome;
}

pub struct HttpPlacesClient {
    http: Client,
    api_key: SecretString,
    api_base: String,
    limiter: RateLimiter,
    pacer: Arc<dyn Pacer>,
}

impl HttpPlacesClient {
    pub fn from_config(config: &AppConfig, pacer: Arc<dyn Pacer>) -> AppResult<Self> {
        let api_key = config.require_api_key()?;
        let http = Client::builder()
            .user_agent(concat!("places-grid-collector/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.http_timeout_secs.max(1)))
            .build()?;
        let api_base = config.places_api_base.trim_end_matches('/').to_string();
        Url::parse(&api_base)
            .map_err(|err| AppError::Config(format!("invalid PLACES_API_BASE: {err}")))?;

        Ok(Self {
            http,
            api_key,
            api_base,
            limiter: RateLimiter::new(config.places_rate_limit_qps),
            pacer,
        })
    }

    pub fn rate_limit_qps(&self) -> u32 {
        self.limiter.qps()
    }

    fn endpoint(&self, operation: &str) -> Result<Url, String> {
        Url::parse(&format!("{}/{operation}/json", self.api_base))
            .map_err(|err| format!("invalid Places endpoint: {err}"))
    }

    fn search_url(&self, query: &SearchQuery, page_token: Option<&str>) -> Result<Url, String> {
        let operation = match query.kind {
            SearchKind::Text { .. } => "textsearch",
            SearchKind::Nearby { .. } => "nearbysearch",
        };
        let mut url = self.endpoint(operation)?;
        {
            let mut pairs = url.query_pairs_mut();
            match page_token {
                // The API ignores every other parameter once a page token is present.
                Some(token) => {
                    pairs.append_pair("pagetoken", token);
                }
                None => {
                    match &query.kind {
                        SearchKind::Text { query: text } => {
                            pairs.append_pair("query", text);
                        }
                        SearchKind::Nearby { place_type } => {
                            pairs.append_pair("type", place_type);
                        }
                    }
                    pairs
                        .append_pair("location", &query.location.as_location())
                        .append_pair("radius", &query.radius_meters.to_string());
                }
            }
            pairs.append_pair("key", self.api_key.expose_secret());
        }
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<Value, String> {
        self.limiter.acquire().await;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| err.without_url().to_string())?;
        response
            .json::<Value>()
            .await
            .map_err(|err| err.without_url().to_string())
    }
}

#[async_trait]
impl PlaceSearch for HttpPlacesClient {
    async fn search(&self, query: &SearchQuery, page_token: Option<&str>) -> SearchPage {
        if page_token.is_some() {
            self.pacer.pause(Pause::PageToken).await;
        }

        let url = match self.search_url(query, page_token) {
            Ok(url) => url,
            Err(reason) => return SearchPage::terminal(SearchStatus::Transport(reason)),
        };

        let body = match self.get_json(url).await {
            Ok(body) => body,
            Err(reason) => {
                warn!(target: "places", query = %query.label(), %reason, "places search failed");
                return SearchPage::terminal(SearchStatus::Transport(reason));
            }
        };

        let status = SearchStatus::from_api(
            body.get("status").and_then(Value::as_str).unwrap_or("UNKNOWN_ERROR"),
        );
        if !status.is_success() {
            let api_message = body
                .get("error_message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            warn!(
                target: "places",
                query = %query.label(),
                status = %status.describe(),
                api_message,
                "places search rejected"
            );
            return SearchPage::terminal(status);
        }

        let results = body
            .get("results")
            .and_then(Value::as_array)
            .map(|hits| {
                hits.iter()
                    .filter_map(|hit| hit.as_object().cloned())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let next_page_token = body
            .get("next_page_token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .map(str::to_string);

        trace!(
            target: "places",
            query = %query.label(),
            hits = results.len(),
            has_next = next_page_token.is_some(),
            "places search page received"
        );
        SearchPage {
            results,
            next_page_token,
            status,
        }
    }

    async fn details(&self, place_id: &str) -> DetailsOutcome {
        let mut url = match self.endpoint("details") {
            Ok(url) => url,
            Err(reason) => return DetailsOutcome::Failed(reason),
        };
        url.query_pairs_mut()
            .append_pair("place_id", place_id)
            .append_pair("fields", DETAIL_FIELDS)
            .append_pair("key", self.api_key.expose_secret());

        let body = match self.get_json(url).await {
            Ok(body) => body,
            Err(reason) => return DetailsOutcome::Failed(reason),
        };

        match body.get("status").and_then(Value::as_str) {
            Some("OK") => match body.get("result").and_then(Value::as_object) {
                Some(result) => DetailsOutcome::Found(result.clone()),
                None => DetailsOutcome::Failed("details response missing result".into()),
            },
            Some("NOT_FOUND") | Some("ZERO_RESULTS") | Some("INVALID_REQUEST") => {
                debug!(target: "places", place_id, "place details not found");
                DetailsOutcome::NotFound
            }
            Some(other) => DetailsOutcome::Failed(format!("details status {other}")),
            None => DetailsOutcome::Failed("details response missing status".into()),
        }
    }
}
