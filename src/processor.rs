use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::aggregator::LocationAggregator;
use crate::errors::AppResult;
use crate::pacing::{Pacer, Pause};
use crate::stats::{percentage, ratio};
use crate::work_items::{WorkItem, WorkItemStore};

/// Held for the whole of a pass so runs over the same store never overlap.
pub type RunGuard = Arc<AsyncMutex<()>>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub batches: usize,
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub restaurants_found: usize,
    pub api_calls: u32,
    pub success_rate: f64,
    pub restaurants_per_call: f64,
    pub cancelled: bool,
}

impl BatchSummary {
    fn finish(mut self) -> Self {
        self.success_rate = percentage(self.completed as u64, self.processed as u64);
        self.restaurants_per_call = ratio(self.restaurants_found as u64, self.api_calls as u64);
        self
    }
}

/// Drives work items through pending → completed / error.
///
/// Every item outcome is written on its own, so an interrupted run only leaves the
/// unfinished tail behind. Cancellation is honoured between items. Processors that
/// share a [`RunGuard`] run one pass at a time, so no item is collected twice.
pub struct BatchProcessor {
    store: WorkItemStore,
    aggregator: Arc<LocationAggregator>,
    pacer: Arc<dyn Pacer>,
    guard: RunGuard,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl BatchProcessor {
    pub fn new(
        store: WorkItemStore,
        aggregator: Arc<LocationAggregator>,
        pacer: Arc<dyn Pacer>,
    ) -> Self {
        Self {
            store,
            aggregator,
            pacer,
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

    pub async fn process_pending(&self, batch_size: usize) -> AppResult<BatchSummary> {
        let _lock = acquire(&self.guard).await;
        let batch_size = batch_size.max(1);
        let mut summary = BatchSummary::default();

        loop {
            let batch = self.store.next_pending(batch_size)?;
            if batch.is_empty() {
                break;
            }
            if summary.batches > 0 {
                self.pacer.pause(Pause::BetweenBatches).await;
            }
            summary.batches += 1;
            info!(
                target: "processor",
                batch = summary.batches,
                size = batch.len(),
                "processing pending batch"
            );

            if !self.run_batch(&batch, &mut summary).await? {
                break;
            }
        }

        let summary = summary.finish();
        info!(
            target: "processor",
            processed = summary.processed,
            completed = summary.completed,
            failed = summary.failed,
            api_calls = summary.api_calls,
            cancelled = summary.cancelled,
            "pending pass finished"
        );
        Ok(summary)
    }

    /// One pass over items in `error` that still have retries left.
    ///
    /// The candidate set is fixed when the pass starts, so an item failing again is not
    /// retried a second time within the same pass.
    pub async fn retry_failed(&self, batch_size: usize) -> AppResult<BatchSummary> {
        let _lock = acquire(&self.guard).await;
        let candidates = self.store.retry_candidates()?;
        let mut summary = BatchSummary::default();
        info!(target: "processor", candidates = candidates.len(), "retrying failed work items");

        for batch in candidates.chunks(batch_size.max(1)) {
            if summary.batches > 0 {
                self.pacer.pause(Pause::BetweenBatches).await;
            }
            summary.batches += 1;
            if !self.run_batch(batch, &mut summary).await? {
                break;
            }
        }

        let summary = summary.finish();
        info!(
            target: "processor",
            processed = summary.processed,
            recovered = summary.completed,
            failed = summary.failed,
            "retry pass finished"
        );
        Ok(summary)
    }

    /// Returns `false` when the run was cancelled part-way.
    async fn run_batch(&self, batch: &[WorkItem], summary: &mut BatchSummary) -> AppResult<bool> {
        for item in batch {
            if self.is_cancelled() {
                summary.cancelled = true;
                warn!(target: "processor", id = item.id, "cancelled before work item");
                return Ok(false);
            }
            self.process_item(item, summary).await?;
        }
        Ok(true)
    }

    async fn process_item(&self, item: &WorkItem, summary: &mut BatchSummary) -> AppResult<()> {
        summary.processed += 1;
        match self.aggregator.collect(item.point()).await {
            Ok(search) => {
                self.store.mark_completed(item.id, &search)?;
                summary.completed += 1;
                summary.restaurants_found += search.results.len();
                summary.api_calls += search.api_calls;
                info!(
                    target: "processor",
                    id = item.id,
                    lat = item.latitude,
                    lng = item.longitude,
                    restaurants = search.results.len(),
                    api_calls = search.api_calls,
                    "work item completed"
                );
            }
            Err(err) => {
                self.store.mark_failed(item.id, &err.to_string(), err.api_calls)?;
                summary.failed += 1;
                summary.api_calls += err.api_calls;
                warn!(
                    target: "processor",
                    id = item.id,
                    lat = item.latitude,
                    lng = item.longitude,
                    retry_count = item.retry_count + 1,
                    max_retries = item.max_retries,
                    error = %err,
                    "work item failed"
                );
            }
        }
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

/// Waits for any running pass on the same guard to finish.
pub(crate) async fn acquire(guard: &RunGuard) -> tokio::sync::MutexGuard<'_, ()> {
    match guard.try_lock() {
        Ok(lock) => lock,
        Err(_) => {
            info!(target: "processor", "another pass is running; waiting for it to finish");
            guard.lock().await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::aggregator::tests::hit;
    use crate::db::open_in_memory;
    use crate::grid::GridPoint;
    use crate::pacing::NoDelay;
    use crate::places::{DetailsOutcome, PlaceSearch, SearchPage, SearchQuery, SearchStatus};
    use crate::work_items::WorkStatus;

    /// Fails every call for latitudes listed in `failing`.
    struct FlakySearch {
        failing: Mutex<Vec<f64>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PlaceSearch for FlakySearch {
        async fn search(&self, query: &SearchQuery, _page_token: Option<&str>) -> SearchPage {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.failing.lock().contains(&query.location.latitude) {
                return SearchPage::terminal(SearchStatus::Transport("unreachable".into()));
            }
            let id = format!("{}:{}", query.location.latitude, query.location.longitude);
            SearchPage {
                results: vec![hit(&id, "Only Place")],
                next_page_token: None,
                status: SearchStatus::Ok,
            }
        }

        async fn details(&self, _place_id: &str) -> DetailsOutcome {
            DetailsOutcome::NotFound
        }
    }

    #[derive(Default)]
    struct CountingPacer {
        pauses: Mutex<Vec<Pause>>,
    }

    #[async_trait]
    impl Pacer for CountingPacer {
        async fn pause(&self, pause: Pause) {
            self.pauses.lock().push(pause);
        }
    }

    fn processor(
        failing: Vec<f64>,
        points: &[GridPoint],
    ) -> (BatchProcessor, WorkItemStore, Arc<FlakySearch>, Arc<CountingPacer>) {
        let store = WorkItemStore::new(open_in_memory().unwrap());
        store.seed(points, 3).unwrap();
        let search = Arc::new(FlakySearch {
            failing: Mutex::new(failing),
            calls: AtomicUsize::new(0),
        });
        let aggregator = Arc::new(LocationAggregator::new(search.clone(), Arc::new(NoDelay), 500));
        let pacer = Arc::new(CountingPacer::default());
        let processor = BatchProcessor::new(store.clone(), aggregator, pacer.clone());
        (processor, store, search, pacer)
    }

    fn points(n: usize) -> Vec<GridPoint> {
        (0..n).map(|i| GridPoint::new(i as f64, 0.0)).collect()
    }

    #[tokio::test]
    async fn cools_down_between_batches_but_not_after_the_last() {
        let (processor, store, _, pacer) = processor(vec![], &points(5));
        let summary = processor.process_pending(2).await.unwrap();

        assert_eq!(summary.batches, 3);
        assert_eq!(summary.completed, 5);
        assert_eq!(summary.success_rate, 100.0);
        let pauses = pacer.pauses.lock();
        assert_eq!(pauses.as_slice(), &[Pause::BetweenBatches, Pause::BetweenBatches]);
        assert!(store.next_pending(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn failures_are_recorded_without_aborting_the_batch() {
        let (processor, store, _, _) = processor(vec![1.0], &points(3));
        let summary = processor.process_pending(10).await.unwrap();

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 1);
        let failed = store.retry_candidates().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 1);
        assert_eq!(failed[0].api_calls_made, 1);
        assert!(failed[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("unreachable"));
    }

    #[tokio::test]
    async fn retries_until_exhausted_then_skips() {
        let (processor, store, search, _) = processor(vec![0.0], &points(1));
        processor.process_pending(1).await.unwrap();

        for _ in 0..2 {
            let summary = processor.retry_failed(5).await.unwrap();
            assert_eq!(summary.failed, 1);
        }
        let exhausted = store.exhausted(10).unwrap();
        assert_eq!(exhausted[0].retry_count, 3);
        assert!(!exhausted[0].is_retry_eligible());

        search.failing.lock().clear();
        let summary = processor.retry_failed(5).await.unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(store.exhausted(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retry_recovers_and_accumulates_api_calls() {
        let (processor, store, search, _) = processor(vec![0.0], &points(1));
        processor.process_pending(1).await.unwrap();
        search.failing.lock().clear();

        let summary = processor.retry_failed(5).await.unwrap();
        assert_eq!(summary.completed, 1);

        let items = store.completed().unwrap();
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.status, WorkStatus::Completed);
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.error_message, None);
        // one failed call, then five templates plus one nearby search
        assert_eq!(item.api_calls_made, 1 + 6);
        assert_eq!(item.restaurants_found, 1);
    }

    #[tokio::test]
    async fn stops_between_items_when_cancelled() {
        let (processor, store, _, _) = processor(vec![], &points(3));
        let flag = Arc::new(AtomicBool::new(true));
        let processor = processor.with_cancel_flag(flag);

        let summary = processor.process_pending(2).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.processed, 0);
        assert_eq!(store.next_pending(10).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn concurrent_passes_never_collect_an_item_twice() {
        let (first, store, search, _) = processor(vec![], &points(2));
        let guard = RunGuard::default();
        let first = first.with_run_guard(guard.clone());
        let aggregator = Arc::new(LocationAggregator::new(search.clone(), Arc::new(NoDelay), 500));
        let second = BatchProcessor::new(store.clone(), aggregator, Arc::new(NoDelay))
            .with_run_guard(guard);

        let (a, b) = tokio::join!(first.process_pending(10), second.process_pending(10));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.processed + b.processed, 2);
        assert_eq!(search.calls.load(Ordering::SeqCst), 2 * 6);
        assert_eq!(store.completed().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn retry_waits_for_a_running_pending_pass() {
        let (first, store, search, _) = processor(vec![0.0], &points(2));
        let guard = RunGuard::default();
        let first = first.with_run_guard(guard.clone());
        let aggregator = Arc::new(LocationAggregator::new(search.clone(), Arc::new(NoDelay), 500));
        let second = BatchProcessor::new(store.clone(), aggregator, Arc::new(NoDelay))
            .with_run_guard(guard);

        let (pending, retried) = tokio::join!(first.process_pending(10), second.retry_failed(10));
        let (pending, retried) = (pending.unwrap(), retried.unwrap());

        assert_eq!(pending.processed, 2);
        // the retry pass only starts once the failure is recorded
        assert_eq!(retried.processed, 1);
        assert_eq!(store.retry_candidates().unwrap()[0].retry_count, 2);
    }
}
