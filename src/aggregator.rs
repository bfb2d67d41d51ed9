//! Multi-query search aggregation for a single grid location.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::grid::GridPoint;
use crate::pacing::{Pacer, Pause};
use crate::places::{place_id_of, PlaceDocument, PlaceSearch, SearchKind, SearchQuery, SearchStatus};

/// Free-text templates run for every location, `{location}` is replaced by `lat,lng`.
pub const QUERY_TEMPLATES: &[&str] = &[
    "restaurants near {location}",
    "fast food near {location}",
    "cafes near {location}",
    "food court near {location}",
    "takeout near {location}",
];

pub const NEARBY_PLACE_TYPE: &str = "restaurant";

/// The Places API never serves more than three pages per query.
pub const MAX_PAGES_PER_QUERY: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct QuerySummary {
    pub query: String,
    pub pages: usize,
    pub hits: usize,
    pub new_hits: usize,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct AggregatedSearch {
    pub results: Vec<PlaceDocument>,
    pub api_calls: u32,
    pub queries: Vec<QuerySummary>,
}

impl AggregatedSearch {
    /// Document persisted as a work item's `response_body`.
    pub fn response_body(&self) -> Value {
        json!({
            "results": self.results,
            "queries": self.queries,
            "api_calls": self.api_calls,
        })
    }
}

#[derive(Debug, Clone, Error)]
#[error("{query}: {status}")]
pub struct CollectError {
    pub query: String,
    pub status: String,
    /// External calls spent before the failure.
    pub api_calls: u32,
}

pub struct LocationAggregator {
    client: Arc<dyn PlaceSearch>,
    pacer: Arc<dyn Pacer>,
    radius_meters: u32,
}

impl LocationAggregator {
    pub fn new(client: Arc<dyn PlaceSearch>, pacer: Arc<dyn Pacer>, radius_meters: u32) -> Self {
        Self {
            client,
            pacer,
            radius_meters,
        }
    }

    pub fn queries_for(&self, point: GridPoint) -> Vec<SearchQuery> {
        let location = point.as_location();
        let mut queries = QUERY_TEMPLATES
            .iter()
            .map(|template| SearchQuery {
                kind: SearchKind::Text {
                    query: template.replace("{location}", &location),
                },
                location: point,
                radius_meters: self.radius_meters,
            })
            .collect::<Vec<_>>();
        queries.push(SearchQuery {
            kind: SearchKind::Nearby {
                place_type: NEARBY_PLACE_TYPE.to_string(),
            },
            location: point,
            radius_meters: self.radius_meters,
        });
        queries
    }

    /// Runs every query variant for `point` and merges hits by `place_id`, first seen wins.
    ///
    /// Any transport failure or rejected first page fails the whole location so the
    /// work item is retried; a rejected follow-up page only ends that query's pagination.
    pub async fn collect(&self, point: GridPoint) -> Result<AggregatedSearch, CollectError> {
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        let mut summaries = Vec::new();
        let mut api_calls = 0_u32;

        for (index, query) in self.queries_for(point).into_iter().enumerate() {
            if index > 0 {
                self.pacer.pause(Pause::BetweenQueries).await;
            }

            let mut summary = QuerySummary {
                query: query.label(),
                pages: 0,
                hits: 0,
                new_hits: 0,
                status: SearchStatus::Ok.describe(),
            };
            let mut page_token: Option<String> = None;

            while summary.pages < MAX_PAGES_PER_QUERY {
                let page = self.client.search(&query, page_token.as_deref()).await;
                api_calls += 1;
                summary.pages += 1;

                if !page.status.is_success() {
                    let follow_up = page_token.is_some();
                    summary.status = page.status.describe();
                    if follow_up && page.status == SearchStatus::InvalidRequest {
                        warn!(
                            target: "aggregator",
                            query = %summary.query,
                            page = summary.pages,
                            "page token rejected; keeping earlier pages"
                        );
                        break;
                    }
                    return Err(CollectError {
                        query: summary.query,
                        status: summary.status,
                        api_calls,
                    });
                }

                summary.hits += page.results.len();
                for hit in page.results {
                    let is_new = match place_id_of(&hit) {
                        Some(place_id) => seen.insert(place_id.to_string()),
                        None => true,
                    };
                    if is_new {
                        summary.new_hits += 1;
                        results.push(hit);
                    }
                }

                match page.next_page_token {
                    Some(token) => page_token = Some(token),
                    None => break,
                }
            }

            debug!(
                target: "aggregator",
                query = %summary.query,
                pages = summary.pages,
                hits = summary.hits,
                new_hits = summary.new_hits,
                "query finished"
            );
            summaries.push(summary);
        }

        Ok(AggregatedSearch {
            results,
            api_calls,
            queries: summaries,
        })
    }
}
