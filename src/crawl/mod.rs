//! Per-site crawl scheduler.
//!
//! One producer asks a [`Discovery`] policy for candidate ids, skips keys the
//! store already knows, and hands the rest to a bounded [`FetchPool`]. Fetch
//! workers download and parse pages; a single consumer writes the results and
//! keeps the consecutive-miss streak that trips the circuit breaker.

mod discovery;
mod fetch;
mod pool;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::model::{Entity, EntityKey, Site};
use crate::sites::{DiscoveryPlan, Parsed, SiteCollaborator};
use crate::store::{EntityStore, StoreError};

pub use discovery::{Discovery, Frontier, RandomSampling, SequentialFrontier};
pub use fetch::{Fetcher, HttpFetcher, Page, USER_AGENT};
pub use pool::FetchPool;

pub const DEFAULT_MISS_THRESHOLD: u64 = 5000;

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("fetch {url}: {reason}")]
    Transport { url: String, reason: String },

    #[error("fetch {url}: unexpected status {status}")]
    Status { url: String, status: u16 },

    #[error("parse: {0}")]
    Parse(String),

    #[error("site cannot handle {0}")]
    Unsupported(String),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Fetch pool size; `None` uses the site's default.
    pub workers: Option<usize>,
    /// Consecutive confirmed-absent results tolerated before halting.
    pub miss_threshold: u64,
    /// How often the sequential frontier re-reads the listing page.
    pub frontier_poll: Duration,
    /// Delay before retrying a failed listing probe.
    pub probe_retry: Duration,
    /// Producer sleep while the cursor sits at the frontier.
    pub frontier_wait: Duration,
    /// Parsed pages buffered between fetch workers and the consumer.
    pub results_buffer: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            workers: None,
            miss_threshold: DEFAULT_MISS_THRESHOLD,
            frontier_poll: Duration::from_secs(600),
            probe_retry: Duration::from_secs(1),
            frontier_wait: Duration::from_secs(1),
            results_buffer: 256,
        }
    }
}

/// Consecutive confirmed-absent results.
///
/// Written only by the consumer; the producer reads it to decide when to stop.
/// The value is a heuristic, so relaxed ordering is enough.
#[derive(Debug)]
pub struct MissCounter {
    streak: AtomicU64,
    threshold: u64,
}

impl MissCounter {
    pub fn new(threshold: u64) -> Self {
        Self {
            streak: AtomicU64::new(0),
            threshold,
        }
    }

    pub fn record_miss(&self) -> u64 {
        self.streak.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_hit(&self) {
        self.streak.store(0, Ordering::Relaxed);
    }

    pub fn streak(&self) -> u64 {
        self.streak.load(Ordering::Relaxed)
    }

    pub fn is_open(&self) -> bool {
        self.streak() > self.threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Too many consecutive confirmed-absent ids.
    CircuitOpen,
    Cancelled,
    /// The discovery policy ran out of candidates.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlSummary {
    pub site: Site,
    pub stop: StopReason,
    pub dispatched: u64,
    pub skipped: u64,
    pub saved: u64,
    pub absent: u64,
    pub failures: u64,
    pub miss_streak: u64,
}

struct Processed {
    key: EntityKey,
    parsed: Parsed,
}

#[derive(Debug, Default)]
struct ConsumerStats {
    saved: u64,
    absent: u64,
    failures: u64,
}

pub struct Crawler {
    site: Arc<dyn SiteCollaborator>,
    store: Arc<dyn EntityStore>,
    fetcher: Arc<dyn Fetcher>,
    config: CrawlConfig,
    discovery: Option<Box<dyn Discovery>>,
}

impl Crawler {
    pub fn new(
        site: Arc<dyn SiteCollaborator>,
        store: Arc<dyn EntityStore>,
        fetcher: Arc<dyn Fetcher>,
        config: CrawlConfig,
    ) -> Self {
        Self {
            site,
            store,
            fetcher,
            config,
            discovery: None,
        }
    }

    /// Replaces the site's own discovery plan.
    pub fn with_discovery(mut self, discovery: Box<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Runs until the circuit opens, discovery runs dry, or `cancel` fires.
    /// In-flight fetches always drain before this returns.
    pub async fn run(mut self, cancel: CancellationToken) -> CrawlSummary {
        let site = self.site.site();
        let workers = self
            .config
            .workers
            .unwrap_or_else(|| self.site.default_workers());
        tracing::info!(%site, workers, "starting crawl");

        // Scoped to this run so the frontier probe stops with it.
        let scope = cancel.child_token();
        let _stop_probe = scope.clone().drop_guard();

        let mut discovery = match self.discovery.take() {
            Some(discovery) => discovery,
            None => self.planned_discovery(&scope),
        };

        let misses = Arc::new(MissCounter::new(self.config.miss_threshold));
        let failures = Arc::new(AtomicU64::new(0));
        let (results_tx, results_rx) = mpsc::channel(self.config.results_buffer.max(1));
        let consumer = tokio::spawn(consume(
            site,
            Arc::clone(&self.store),
            results_rx,
            Arc::clone(&misses),
        ));

        let pool = FetchPool::new(workers);
        let mut dispatched = 0u64;
        let mut skipped = 0u64;
        let stop = loop {
            if scope.is_cancelled() {
                break StopReason::Cancelled;
            }
            if misses.is_open() {
                break StopReason::CircuitOpen;
            }

            let Some(id) = discovery.next_id(&scope).await else {
                break if scope.is_cancelled() {
                    StopReason::Cancelled
                } else {
                    StopReason::Exhausted
                };
            };

            let key = self.site.candidate(id);
            let known = loop {
                match self.store.exists(&key).await {
                    Ok(known) => break Some(known),
                    Err(err) => {
                        tracing::warn!(%key, error = %err, "existence check failed; retrying");
                        tokio::select! {
                            _ = scope.cancelled() => break None,
                            _ = tokio::time::sleep(self.config.frontier_wait) => {}
                        }
                    }
                }
            };
            match known {
                None => break StopReason::Cancelled,
                Some(true) => {
                    skipped += 1;
                    tokio::task::yield_now().await;
                    continue;
                }
                Some(false) => {}
            }

            let job = fetch_job(
                Arc::clone(&self.site),
                Arc::clone(&self.fetcher),
                key,
                results_tx.clone(),
                Arc::clone(&failures),
                scope.clone(),
            );
            tokio::select! {
                biased;
                _ = scope.cancelled() => break StopReason::Cancelled,
                () = pool.spawn(job) => dispatched += 1,
            }
        };

        pool.drain().await;
        drop(results_tx);
        let stats = match consumer.await {
            Ok(stats) => stats,
            Err(err) => {
                tracing::error!(%site, error = %err, "crawl consumer task failed");
                ConsumerStats::default()
            }
        };

        let summary = CrawlSummary {
            site,
            stop,
            dispatched,
            skipped,
            saved: stats.saved,
            absent: stats.absent,
            failures: stats.failures + failures.load(Ordering::Relaxed),
            miss_streak: misses.streak(),
        };
        match stop {
            StopReason::CircuitOpen => tracing::info!(
                %site,
                misses = summary.miss_streak,
                "too many missing ids in a row; stopping crawl"
            ),
            _ => tracing::info!(%site, stop = ?stop, "crawl stopped"),
        }
        summary
    }

    fn planned_discovery(&self, scope: &CancellationToken) -> Box<dyn Discovery> {
        match self.site.discovery() {
            DiscoveryPlan::Random { population } => Box::new(RandomSampling::new(population)),
            DiscoveryPlan::Sequential { listing } => {
                let frontier = Frontier::new();
                tokio::spawn(probe_frontier(
                    Arc::clone(&self.site),
                    Arc::clone(&self.fetcher),
                    listing,
                    frontier.clone(),
                    self.config.clone(),
                    scope.clone(),
                ));
                Box::new(SequentialFrontier::new(
                    frontier,
                    self.config.frontier_wait,
                ))
            }
        }
    }
}

async fn fetch_job(
    site: Arc<dyn SiteCollaborator>,
    fetcher: Arc<dyn Fetcher>,
    key: EntityKey,
    results: mpsc::Sender<Processed>,
    failures: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let outcome = tokio::select! {
        _ = cancel.cancelled() => return,
        outcome = fetch_and_parse(site.as_ref(), fetcher.as_ref(), &key) => outcome,
    };
    match outcome {
        Ok(parsed) => {
            if let Err(err) = results.send(Processed { key, parsed }).await {
                failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %err.0.key, "consumer gone; dropping parsed page");
            }
        }
        Err(err) => {
            failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%key, error = %err, "dropping crawl job");
        }
    }
}

async fn fetch_and_parse(
    site: &dyn SiteCollaborator,
    fetcher: &dyn Fetcher,
    key: &EntityKey,
) -> Result<Parsed, CrawlError> {
    let url = site.page_url(key)?;
    let page = fetcher.fetch(&url).await?;
    site.parse(key, &page)
}

async fn consume(
    site: Site,
    store: Arc<dyn EntityStore>,
    mut results: mpsc::Receiver<Processed>,
    misses: Arc<MissCounter>,
) -> ConsumerStats {
    let mut stats = ConsumerStats::default();
    while let Some(Processed { key, parsed }) = results.recv().await {
        match parsed {
            Parsed::Absent => {
                if let Err(err) = store.upsert(Entity::absent(&key)).await {
                    stats.failures += 1;
                    tracing::warn!(%key, error = %CrawlError::from(err), "saving absent record failed");
                    continue;
                }
                stats.absent += 1;
                let streak = misses.record_miss();
                tracing::debug!(%key, streak, "id does not exist");
            }
            Parsed::Found { label, entities } => {
                if let Err(err) = save_all(store.as_ref(), entities).await {
                    stats.failures += 1;
                    tracing::warn!(%key, error = %err, "saving crawled entities failed");
                    continue;
                }
                stats.saved += 1;
                misses.record_hit();
                tracing::info!(%site, %key, label = %label, "crawled");
            }
        }
    }
    stats
}

async fn save_all(store: &dyn EntityStore, entities: Vec<Entity>) -> Result<(), CrawlError> {
    for entity in entities {
        store.upsert(entity).await?;
    }
    Ok(())
}

async fn probe_frontier(
    site: Arc<dyn SiteCollaborator>,
    fetcher: Arc<dyn Fetcher>,
    listing: Url,
    frontier: Frontier,
    config: CrawlConfig,
    cancel: CancellationToken,
) {
    loop {
        let wait = match probe_latest(site.as_ref(), fetcher.as_ref(), &listing).await {
            Ok(latest) => {
                let total = frontier.raise(latest);
                tracing::info!(site = %site.site(), latest, total, "frontier probed");
                config.frontier_poll
            }
            Err(err) => {
                tracing::warn!(site = %site.site(), error = %err, "frontier probe failed");
                config.probe_retry
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            () = tokio::time::sleep(wait) => {}
        }
    }
}

async fn probe_latest(
    site: &dyn SiteCollaborator,
    fetcher: &dyn Fetcher,
    listing: &Url,
) -> Result<u64, CrawlError> {
    let page = fetcher.fetch(listing).await?;
    site.latest_id(&page)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::model::{Story, StoryKey};
    use crate::store::MemoryEntityStore;

    /// Site whose ids below `found_below` exist and everything else is
    /// confirmed absent.
    struct NumberSite {
        found_below: u64,
    }

    impl SiteCollaborator for NumberSite {
        fn site(&self) -> Site {
            Site::Ao3
        }

        fn discovery(&self) -> DiscoveryPlan {
            DiscoveryPlan::Random { population: 0 }
        }

        fn candidate(&self, id: u64) -> EntityKey {
            StoryKey::new(Site::Ao3, id).into()
        }

        fn page_url(&self, key: &EntityKey) -> Result<Url, CrawlError> {
            Ok(Url::parse(&format!("http://stub.invalid/{key}"))?)
        }

        fn parse(&self, key: &EntityKey, _page: &Page) -> Result<Parsed, CrawlError> {
            let EntityKey::Story(story_key) = key else {
                return Err(CrawlError::Unsupported(key.to_string()));
            };
            if story_key.id >= self.found_below {
                return Ok(Parsed::Absent);
            }
            let mut story = Story::new(*story_key);
            story.exists = true;
            story.title = format!("work {}", story_key.id);
            Ok(Parsed::Found {
                label: story.title.clone(),
                entities: vec![story.into()],
            })
        }

        fn story_key(&self, _url: &Url) -> Option<StoryKey> {
            None
        }
    }

    #[derive(Default)]
    struct CountingFetcher {
        calls: Mutex<HashMap<String, u32>>,
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch(&self, url: &Url) -> Result<Page, CrawlError> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default() += 1;
            Ok(Page {
                url: url.clone(),
                status: 200,
                body: String::new(),
            })
        }
    }

    struct Counting {
        next: u64,
    }

    #[async_trait]
    impl Discovery for Counting {
        async fn next_id(&mut self, _cancel: &CancellationToken) -> Option<u64> {
            self.next += 1;
            Some(self.next)
        }
    }

    struct Fixed(std::vec::IntoIter<u64>);

    #[async_trait]
    impl Discovery for Fixed {
        async fn next_id(&mut self, _cancel: &CancellationToken) -> Option<u64> {
            self.0.next()
        }
    }

    fn crawler(
        store: Arc<MemoryEntityStore>,
        fetcher: Arc<CountingFetcher>,
        found_below: u64,
        config: CrawlConfig,
    ) -> Crawler {
        Crawler::new(
            Arc::new(NumberSite { found_below }),
            store,
            fetcher,
            config,
        )
    }

    #[test]
    fn miss_counter_trips_only_past_threshold() {
        let counter = MissCounter::new(3);
        for _ in 0..3 {
            counter.record_miss();
        }
        assert!(!counter.is_open());
        counter.record_miss();
        assert!(counter.is_open());
        counter.record_hit();
        assert_eq!(counter.streak(), 0);
    }

    #[tokio::test]
    async fn consecutive_misses_open_the_circuit() {
        let store = Arc::new(MemoryEntityStore::new());
        let fetcher = Arc::new(CountingFetcher::default());
        let config = CrawlConfig {
            workers: Some(1),
            results_buffer: 1,
            ..CrawlConfig::default()
        };
        let summary = crawler(Arc::clone(&store), fetcher, 0, config)
            .with_discovery(Box::new(Counting { next: 0 }))
            .run(CancellationToken::new())
            .await;

        assert_eq!(summary.stop, StopReason::CircuitOpen);
        assert!(summary.absent > DEFAULT_MISS_THRESHOLD);
        assert_eq!(summary.saved, 0);
        assert!(
            store
                .exists(&StoryKey::new(Site::Ao3, 1).into())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn a_success_resets_the_streak() {
        let store = Arc::new(MemoryEntityStore::new());
        let fetcher = Arc::new(CountingFetcher::default());
        let config = CrawlConfig {
            workers: Some(1),
            miss_threshold: 3,
            results_buffer: 1,
            ..CrawlConfig::default()
        };
        // Ids >= 10 are absent: 11..=13 miss, 5 resets, 14..=16 miss again.
        let ids = vec![11, 12, 13, 5, 14, 15, 16];
        let summary = crawler(Arc::clone(&store), fetcher, 10, config)
            .with_discovery(Box::new(Fixed(ids.into_iter())))
            .run(CancellationToken::new())
            .await;

        assert_eq!(summary.stop, StopReason::Exhausted);
        assert_eq!(summary.saved, 1);
        assert_eq!(summary.absent, 6);
        assert_eq!(summary.miss_streak, 3);
        assert!(
            store
                .exists_with_title(&StoryKey::new(Site::Ao3, 5).into())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn known_keys_are_not_fetched_again() {
        let store = Arc::new(MemoryEntityStore::new());
        let fetcher = Arc::new(CountingFetcher::default());
        let mut known = Story::new(StoryKey::new(Site::Ao3, 2));
        known.exists = true;
        store.upsert(known.into()).await.unwrap();

        let summary = crawler(
            Arc::clone(&store),
            Arc::clone(&fetcher),
            100,
            CrawlConfig::default(),
        )
        .with_discovery(Box::new(Fixed(vec![1, 2, 3].into_iter())))
        .run(CancellationToken::new())
        .await;

        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.skipped, 1);
        let calls = fetcher.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(!calls.contains_key("http://stub.invalid/story:ao3:2"));
    }

    /// Fails the first `outages` existence checks, then defers to memory.
    struct FlakyStore {
        inner: MemoryEntityStore,
        outages: AtomicU64,
    }

    #[async_trait]
    impl EntityStore for FlakyStore {
        async fn upsert(&self, entity: Entity) -> Result<(), StoreError> {
            self.inner.upsert(entity).await
        }

        async fn exists(&self, key: &EntityKey) -> Result<bool, StoreError> {
            let down = self
                .outages
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok();
            if down {
                return Err(StoreError::Background("offline".to_owned()));
            }
            self.inner.exists(key).await
        }

        async fn exists_with_title(&self, key: &EntityKey) -> Result<bool, StoreError> {
            self.inner.exists_with_title(key).await
        }

        async fn get(&self, key: &EntityKey) -> Result<Entity, StoreError> {
            self.inner.get(key).await
        }

        async fn get_many(&self, keys: &[EntityKey]) -> Result<Vec<Entity>, StoreError> {
            self.inner.get_many(keys).await
        }
    }

    #[tokio::test]
    async fn failed_existence_checks_retry_the_same_id() {
        let store = Arc::new(FlakyStore {
            inner: MemoryEntityStore::new(),
            outages: AtomicU64::new(3),
        });
        let fetcher = Arc::new(CountingFetcher::default());
        let config = CrawlConfig {
            frontier_wait: Duration::from_millis(5),
            ..CrawlConfig::default()
        };
        let summary = Crawler::new(
            Arc::new(NumberSite { found_below: 100 }),
            store.clone(),
            fetcher.clone(),
            config,
        )
        .with_discovery(Box::new(Fixed(vec![1, 2].into_iter())))
        .run(CancellationToken::new())
        .await;

        assert_eq!(summary.stop, StopReason::Exhausted);
        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.saved, 2);
        assert_eq!(store.outages.load(Ordering::Relaxed), 0);
        assert!(
            fetcher
                .calls
                .lock()
                .unwrap()
                .contains_key("http://stub.invalid/story:ao3:1")
        );
    }

    #[tokio::test]
    async fn failed_existence_checks_yield_to_cancellation() {
        let store = Arc::new(FlakyStore {
            inner: MemoryEntityStore::new(),
            outages: AtomicU64::new(u64::MAX),
        });
        let cancel = CancellationToken::new();
        let crawl = Crawler::new(
            Arc::new(NumberSite { found_below: 100 }),
            store,
            Arc::new(CountingFetcher::default()),
            CrawlConfig {
                frontier_wait: Duration::from_millis(5),
                ..CrawlConfig::default()
            },
        )
        .with_discovery(Box::new(Counting { next: 0 }));

        let handle = tokio::spawn(crawl.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        let summary = handle.await.unwrap();

        assert_eq!(summary.stop, StopReason::Cancelled);
        assert_eq!(summary.dispatched, 0);
    }

    #[tokio::test]
    async fn parsed_pages_count_as_failures_once_the_consumer_is_gone() {
        let (results_tx, results_rx) = mpsc::channel(1);
        drop(results_rx);
        let failures = Arc::new(AtomicU64::new(0));

        fetch_job(
            Arc::new(NumberSite { found_below: 100 }),
            Arc::new(CountingFetcher::default()),
            StoryKey::new(Site::Ao3, 1).into(),
            results_tx,
            Arc::clone(&failures),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_an_endless_crawl() {
        let store = Arc::new(MemoryEntityStore::new());
        let fetcher = Arc::new(CountingFetcher::default());
        let cancel = CancellationToken::new();
        let crawl = crawler(store, fetcher, u64::MAX, CrawlConfig::default())
            .with_discovery(Box::new(Counting { next: 0 }));

        let handle = tokio::spawn(crawl.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let summary = handle.await.unwrap();

        assert_eq!(summary.stop, StopReason::Cancelled);
        assert!(summary.dispatched > 0);
    }
}
