//! Detail enrichment: turns raw search hits from completed work items into restaurants.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::errors::AppResult;
use crate::pacing::{Pacer, Pause};
use crate::places::{place_id_of, DetailsOutcome, PlaceDocument, PlaceSearch};
use crate::processor::{acquire, RunGuard};
use crate::restaurants::{InsertOutcome, NewRestaurant, RestaurantStore};
use crate::stats::percentage;
use crate::work_items::WorkItemStore;

const CURRENCY_GLYPH: &str = "$";
const UNNAMED_PLACE: &str = "Unnamed place";

#[derive(Debug, Clone)]
pub struct Candidate {
    pub place_id: String,
    pub hit: PlaceDocument,
    pub work_item_id: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentSummary {
    pub hits_seen: usize,
    pub candidates: usize,
    pub batches: usize,
    pub skipped_existing: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub not_found: usize,
    pub fetch_failed: usize,
    pub persist_failed: usize,
    pub api_calls: usize,
    pub cooldowns: usize,
    pub insert_rate: f64,
    pub cancelled: bool,
}

pub struct Enricher {
    work_items: WorkItemStore,
    restaurants: RestaurantStore,
    client: Arc<dyn PlaceSearch>,
    pacer: Arc<dyn Pacer>,
    calls_per_cooldown: usize,
    guard: RunGuard,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl Enricher {
    pub fn new(
        work_items: WorkItemStore,
        restaurants: RestaurantStore,
        client: Arc<dyn PlaceSearch>,
        pacer: Arc<dyn Pacer>,
        calls_per_cooldown: usize,
    ) -> Self {
        Self {
            work_items,
            restaurants,
            client,
            pacer,
            calls_per_cooldown: calls_per_cooldown.max(1),
            guard: RunGuard::default(),
            cancel_flag: None,
        }
    }

    pub fn with_run_guard(mut self, guard: RunGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(flag);
        self
    }

    /// Every distinct `place_id` across completed work items, first source wins.
    pub fn candidates(&self) -> AppResult<(usize, Vec<Candidate>)> {
        let mut seen = HashSet::new();
        let mut hits_seen = 0;
        let mut candidates = Vec::new();

        for item in self.work_items.completed()? {
            let Some(results) = item
                .response_body
                .as_ref()
                .and_then(|body| body.get("results"))
                .and_then(Value::as_array)
            else {
                continue;
            };
            for hit in results.iter().filter_map(Value::as_object) {
                let Some(place_id) = place_id_of(hit) else {
                    continue;
                };
                hits_seen += 1;
                if seen.insert(place_id.to_string()) {
                    candidates.push(Candidate {
                        place_id: place_id.to_string(),
                        hit: hit.clone(),
                        work_item_id: item.id,
                    });
                }
            }
        }
        Ok((hits_seen, candidates))
    }

    pub async fn enrich(&self, batch_size: usize) -> AppResult<EnrichmentSummary> {
        let _lock = acquire(&self.guard).await;
        let (hits_seen, candidates) = self.candidates()?;
        let mut summary = EnrichmentSummary {
            hits_seen,
            candidates: candidates.len(),
            ..Default::default()
        };
        info!(
            target: "enrichment",
            hits_seen,
            candidates = candidates.len(),
            "starting enrichment"
        );

        let mut calls_since_cooldown = 0;
        'batches: for batch in candidates.chunks(batch_size.max(1)) {
            summary.batches += 1;
            for candidate in batch {
                if self.is_cancelled() {
                    summary.cancelled = true;
                    break 'batches;
                }
                if self.restaurants.exists(&candidate.place_id)? {
                    summary.skipped_existing += 1;
                    continue;
                }

                // The cooldown tracks real detail calls, not batch boundaries.
                if calls_since_cooldown == self.calls_per_cooldown {
                    summary.cooldowns += 1;
                    self.pacer.pause(Pause::DetailCooldown).await;
                    calls_since_cooldown = 0;
                }
                let outcome = self.client.details(&candidate.place_id).await;
                calls_since_cooldown += 1;
                summary.api_calls += 1;

                self.apply(candidate, outcome, &mut summary);
            }
            debug!(
                target: "enrichment",
                batch = summary.batches,
                inserted = summary.inserted,
                api_calls = summary.api_calls,
                "enrichment batch finished"
            );
        }

        summary.insert_rate = percentage(summary.inserted as u64, summary.api_calls as u64);
        info!(
            target: "enrichment",
            inserted = summary.inserted,
            skipped_existing = summary.skipped_existing,
            fetch_failed = summary.fetch_failed,
            persist_failed = summary.persist_failed,
            api_calls = summary.api_calls,
            "enrichment finished"
        );
        Ok(summary)
    }

    fn apply(&self, candidate: &Candidate, outcome: DetailsOutcome, summary: &mut EnrichmentSummary) {
        match outcome {
            DetailsOutcome::Found(details) => {
                let record = normalize(&candidate.place_id, &details, &candidate.hit);
                match self.restaurants.insert(&record) {
                    Ok(InsertOutcome::Inserted(id)) => {
                        summary.inserted += 1;
                        debug!(
                            target: "enrichment",
                            id,
                            place_id = %candidate.place_id,
                            name = %record.name,
                            "restaurant inserted"
                        );
                    }
                    Ok(InsertOutcome::Duplicate) => summary.duplicates += 1,
                    Err(err) => {
                        summary.persist_failed += 1;
                        warn!(
                            target: "enrichment",
                            place_id = %candidate.place_id,
                            ?err,
                            "failed to store restaurant"
                        );
                    }
                }
            }
            DetailsOutcome::NotFound => {
                summary.not_found += 1;
                debug!(target: "enrichment", place_id = %candidate.place_id, "place no longer exists");
            }
            DetailsOutcome::Failed(reason) => {
                summary.fetch_failed += 1;
                warn!(
                    target: "enrichment",
                    place_id = %candidate.place_id,
                    work_item = candidate.work_item_id,
                    %reason,
                    "place details fetch failed"
                );
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

pub fn normalize(place_id: &str, details: &PlaceDocument, hit: &PlaceDocument) -> NewRestaurant {
    let (city, state, country) = address_parts(details.get("address_components"));
    let (latitude, longitude) = coordinates(details)
        .or_else(|| coordinates(hit))
        .map(|(lat, lng)| (Some(lat), Some(lng)))
        .unwrap_or((None, None));

    NewRestaurant {
        place_id: place_id.to_string(),
        name: text(details, "name")
            .or_else(|| text(hit, "name"))
            .unwrap_or_else(|| UNNAMED_PLACE.to_string()),
        description: details
            .get("editorial_summary")
            .and_then(|summary| summary.get("overview"))
            .and_then(Value::as_str)
            .map(str::to_string),
        address: text(details, "formatted_address")
            .or_else(|| text(hit, "formatted_address"))
            .or_else(|| text(hit, "vicinity")),
        city,
        state,
        country,
        latitude,
        longitude,
        phone: text(details, "formatted_phone_number"),
        website: text(details, "website"),
        opening_hours: details
            .get("opening_hours")
            .and_then(|hours| hours.get("weekday_text"))
            .and_then(Value::as_array)
            .map(|days| days.iter().filter_map(Value::as_str).collect::<Vec<_>>().join("; "))
            .filter(|joined| !joined.is_empty()),
        cuisine_type: cuisine(details.get("types").or_else(|| hit.get("types"))),
        price_range: price_range(details.get("price_level").and_then(Value::as_i64)),
        rating: details
            .get("rating")
            .or_else(|| hit.get("rating"))
            .and_then(Value::as_f64),
        scraped_json: Some(Value::Object(details.clone())),
        additional_info: additional_info(details),
    }
}

/// `locality` → city, `administrative_area_level_1` → state, `country` → country; first match wins.
pub fn address_parts(components: Option<&Value>) -> (Option<String>, Option<String>, Option<String>) {
    let mut city = None;
    let mut state = None;
    let mut country = None;

    for component in components.and_then(Value::as_array).into_iter().flatten() {
        let Some(name) = component.get("long_name").and_then(Value::as_str) else {
            continue;
        };
        let types = component
            .get("types")
            .and_then(Value::as_array)
            .map(|types| types.iter().filter_map(Value::as_str).collect::<Vec<_>>())
            .unwrap_or_default();

        if city.is_none() && types.contains(&"locality") {
            city = Some(name.to_string());
        }
        if state.is_none() && types.contains(&"administrative_area_level_1") {
            state = Some(name.to_string());
        }
        if country.is_none() && types.contains(&"country") {
            country = Some(name.to_string());
        }
    }
    (city, state, country)
}

pub fn price_range(price_level: Option<i64>) -> Option<String> {
    match price_level {
        Some(level) if level > 0 => Some(CURRENCY_GLYPH.repeat(level as usize)),
        _ => None,
    }
}

pub fn cuisine(types: Option<&Value>) -> Option<String> {
    let tags = types
        .and_then(Value::as_array)
        .map(|tags| tags.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();
    if tags.is_empty() {
        None
    } else {
        Some(tags.join(", "))
    }
}

fn additional_info(details: &PlaceDocument) -> Option<String> {
    let mut info = Map::new();
    for key in ["user_ratings_total", "business_status", "url"] {
        if let Some(value) = details.get(key).filter(|value| !value.is_null()) {
            info.insert(key.to_string(), value.clone());
        }
    }
    if info.is_empty() {
        None
    } else {
        serde_json::to_string(&info).ok()
    }
}

fn coordinates(doc: &PlaceDocument) -> Option<(f64, f64)> {
    let location = doc.get("geometry")?.get("location")?;
    Some((
        location.get("lat")?.as_f64()?,
        location.get("lng")?.as_f64()?,
    ))
}

fn text(doc: &PlaceDocument, key: &str) -> Option<String> {
    doc.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
