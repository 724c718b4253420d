//! Task orchestration: one task per (keyword, engine), pages fetched in
//! order, results and statistics persisted through the storage layer.

use anyhow::Result;
use chrono::{Local, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cli::config::{CrawlerConfig, CrawlerSettings};
use crate::crawler::engine::EngineProfile;
use crate::crawler::extractor::{ExtractError, Extractor};
use crate::crawler::fetcher::{FetchError, Fetcher};
use crate::crawler::pacing::{pause, Cancelled};
use crate::crawler::task::{Fragment, SearchResult, TaskId, TaskStatus};
use crate::storage::Storage;
use crate::utils::metrics::MetricsCollector;

/// keyword -> engine -> results
pub type BatchResults = BTreeMap<String, BTreeMap<String, Vec<SearchResult>>>;

/// Why a task ended up failed
#[derive(Debug, Error)]
enum TaskFailure {
    #[error("cancelled")]
    Cancelled,

    #[error("unknown engine: {0}")]
    UnknownEngine(String),

    #[error(transparent)]
    Fetch(FetchError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl TaskFailure {
    fn storage(e: anyhow::Error) -> Self {
        TaskFailure::Storage(format!("{:#}", e))
    }
}

/// How far a task got before it failed
#[derive(Debug, Default)]
struct Progress {
    running: bool,
    statistic_recorded: bool,
}

impl From<Cancelled> for TaskFailure {
    fn from(_: Cancelled) -> Self {
        TaskFailure::Cancelled
    }
}

/// Drives search tasks across engines
#[derive(Clone)]
pub struct SearchOrchestrator {
    storage: Arc<dyn Storage>,
    fetcher: Arc<Fetcher>,
    engines: Arc<BTreeMap<String, EngineProfile>>,
    settings: CrawlerSettings,

    /// Per-engine concurrency cap
    engine_slots: Arc<HashMap<String, Arc<Semaphore>>>,

    metrics: MetricsCollector,
    cancel: CancellationToken,
}

impl SearchOrchestrator {
    /// Create an orchestrator over the configured engines
    pub fn new(config: &CrawlerConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        let metrics = MetricsCollector::new();
        let fetcher = Fetcher::new(&config.fetch, metrics.clone())?;

        let engine_slots = config.engines.keys()
            .map(|id| (id.clone(), Arc::new(Semaphore::new(config.crawler.max_concurrent_per_engine.max(1)))))
            .collect();

        Ok(Self {
            storage,
            fetcher: Arc::new(fetcher),
            engines: Arc::new(config.engines.clone()),
            settings: config.crawler.clone(),
            engine_slots: Arc::new(engine_slots),
            metrics,
            cancel: CancellationToken::new(),
        })
    }

    /// Stop all work when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Search one keyword on one engine.
    ///
    /// Never returns an error: every failure is recorded on the task, with
    /// zero-success statistics, and yields an empty result list.
    pub async fn search_keyword(&self, keyword: &str, engine: &str, page_count: u32) -> Vec<SearchResult> {
        let started = Instant::now();

        let task_id = match self.storage.create_task(keyword, engine).await {
            Ok(id) => id,
            Err(e) => {
                error!(keyword, engine, "Failed to create task: {:#}", e);
                return Vec::new();
            }
        };

        info!(task_id, keyword, engine, page_count, "Task started");

        let mut progress = Progress::default();
        match self.run_task(task_id, keyword, engine, page_count, started, &mut progress).await {
            Ok(results) => {
                info!(task_id, keyword, engine, results = results.len(), "Task completed");

                if let Err(e) = self.storage.mark_keyword_searched(keyword, Utc::now()).await {
                    warn!(keyword, "Failed to mark keyword searched: {:#}", e);
                }

                results
            }
            Err(failure) => {
                let message = failure.to_string();
                warn!(task_id, keyword, engine, error = %message, "Task failed");
                self.record_failure(task_id, keyword, engine, message, started, &progress).await;
                Vec::new()
            }
        }
    }

    async fn run_task(
        &self,
        task_id: TaskId,
        keyword: &str,
        engine: &str,
        page_count: u32,
        started: Instant,
        progress: &mut Progress,
    ) -> Result<Vec<SearchResult>, TaskFailure> {
        self.storage.update_task_status(task_id, TaskStatus::Running, None)
            .await
            .map_err(TaskFailure::storage)?;
        progress.running = true;

        let profile = self.engines.get(engine)
            .ok_or_else(|| TaskFailure::UnknownEngine(engine.to_string()))?;
        let extractor = Extractor::compile(profile)?;

        let fragments = self.collect_pages(task_id, keyword, profile, &extractor, page_count).await?;

        self.storage.save_results(task_id, keyword, engine, &fragments)
            .await
            .map_err(TaskFailure::storage)?;

        let found = fragments.len() as u32;
        self.storage.upsert_statistic(keyword, engine, Local::now().date_naive(), found, found, started.elapsed().as_secs_f64())
            .await
            .map_err(TaskFailure::storage)?;
        progress.statistic_recorded = true;

        self.storage.update_task_status(task_id, TaskStatus::Completed, None)
            .await
            .map_err(TaskFailure::storage)?;

        Ok(fragments.into_iter()
            .enumerate()
            .map(|(index, fragment)| SearchResult {
                task_id,
                keyword: keyword.to_string(),
                engine: engine.to_string(),
                title: fragment.title,
                url: fragment.url,
                snippet: fragment.snippet,
                rank: index as u32 + 1,
            })
            .collect())
    }

    /// Fetch and extract pages in order until `page_count` or an empty page.
    ///
    /// A page whose fetch fails is skipped; the task only fails when no page
    /// could be fetched at all.
    async fn collect_pages(
        &self,
        task_id: TaskId,
        keyword: &str,
        profile: &EngineProfile,
        extractor: &Extractor,
        page_count: u32,
    ) -> Result<Vec<Fragment>, TaskFailure> {
        let mut fragments = Vec::new();
        let mut fetched_pages = 0;
        let mut last_error = None;

        for page in 0..page_count {
            if page > 0 {
                pause(self.settings.page_delay.sample(), &self.cancel).await?;
            }

            let url = profile.build_url(keyword, page);
            match self.fetcher.fetch(&url, self.fetcher.max_retries(), &self.cancel).await {
                Ok(body) => {
                    fetched_pages += 1;
                    let batch = extractor.extract(&body);
                    debug!(task_id, page, found = batch.len(), "Page extracted");

                    if batch.is_empty() {
                        info!(task_id, page, "Empty page, no further pages requested");
                        break;
                    }
                    fragments.extend(batch);
                }
                Err(FetchError::Cancelled) => return Err(TaskFailure::Cancelled),
                Err(e) => {
                    warn!(task_id, page, error = %e, "Skipping page");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if fetched_pages == 0 => Err(TaskFailure::Fetch(e)),
            _ => Ok(fragments),
        }
    }

    /// Mark the task failed and record its zero-success statistic, unless
    /// the statistic was already written before the failure.
    ///
    /// A task that never reached running is moved through running first, so
    /// it still follows pending, running, failed.
    async fn record_failure(
        &self,
        task_id: TaskId,
        keyword: &str,
        engine: &str,
        message: String,
        started: Instant,
        progress: &Progress,
    ) {
        let running = progress.running || match self.storage.update_task_status(task_id, TaskStatus::Running, None).await {
            Ok(()) => true,
            Err(e) => {
                error!(task_id, "Failed to mark task running: {:#}", e);
                false
            }
        };

        if running {
            if let Err(e) = self.storage.update_task_status(task_id, TaskStatus::Failed, Some(message)).await {
                error!(task_id, "Failed to mark task failed: {:#}", e);
            }
        }

        if progress.statistic_recorded {
            return;
        }

        let elapsed = started.elapsed().as_secs_f64();
        if let Err(e) = self.storage.upsert_statistic(keyword, engine, Local::now().date_naive(), 0, 0, elapsed).await {
            error!(task_id, "Failed to update statistics: {:#}", e);
        }
    }

    /// Search every keyword on every engine.
    ///
    /// Pairs run concurrently up to the global cap, with at most
    /// `max_concurrent_per_engine` of them on one engine. Consecutive pairs
    /// on one engine are separated by the inter-engine delay. A pair that
    /// fails in any way contributes an empty list.
    pub async fn search_all_engines(&self, keywords: &[String], page_count: u32, engines: &[String]) -> BatchResults {
        let pairs: Vec<(String, String)> = keywords.iter()
            .flat_map(|keyword| engines.iter().map(move |engine| (keyword.clone(), engine.clone())))
            .collect();

        // Engines that already served a pair in this batch
        let engines_used: Arc<HashMap<String, AtomicBool>> = Arc::new(
            engines.iter().map(|engine| (engine.clone(), AtomicBool::new(false))).collect(),
        );

        info!(keywords = keywords.len(), engines = engines.len(), page_count, "Starting search batch");

        let outcomes: Vec<(String, String, Vec<SearchResult>)> = stream::iter(pairs)
            .map(|(keyword, engine)| {
                let this = self.clone();
                let engines_used = engines_used.clone();
                async move {
                    let handle = tokio::spawn({
                        let keyword = keyword.clone();
                        let engine = engine.clone();
                        async move { this.run_pair(&keyword, &engine, page_count, &engines_used).await }
                    });

                    match handle.await {
                        Ok(results) => (keyword, engine, results),
                        Err(e) => {
                            error!(keyword = %keyword, engine = %engine, "Search task aborted: {}", e);
                            (keyword, engine, Vec::new())
                        }
                    }
                }
            })
            .buffer_unordered(self.settings.max_concurrent_tasks.max(1))
            .collect()
            .await;

        let mut batch = BatchResults::new();
        for (keyword, engine, results) in outcomes {
            batch.entry(keyword).or_default().insert(engine, results);
        }

        self.log_metrics().await;
        batch
    }

    /// Run one pair under its engine permit. Every pair after the first on
    /// an engine waits out the inter-engine delay once it holds the permit.
    async fn run_pair(
        &self,
        keyword: &str,
        engine: &str,
        page_count: u32,
        engines_used: &HashMap<String, AtomicBool>,
    ) -> Vec<SearchResult> {
        let _permit = match self.engine_slots.get(engine) {
            Some(slots) => slots.clone().acquire_owned().await.ok(),
            None => None,
        };

        let used_before = engines_used.get(engine)
            .is_some_and(|used| used.swap(true, Ordering::SeqCst));
        if used_before && pause(self.settings.engine_delay.sample(), &self.cancel).await.is_err() {
            debug!(engine, "Inter-engine delay interrupted");
        }

        self.search_keyword(keyword, engine, page_count).await
    }

    /// Log and reset the fetch metrics of the finished batch
    async fn log_metrics(&self) {
        let metrics = self.metrics.get_metrics().await;
        info!(
            attempts = metrics.total_attempts,
            succeeded = metrics.successful_attempts,
            blocked = metrics.blocked_attempts,
            failed = metrics.failed_attempts,
            bytes = metrics.bytes_downloaded,
            "Fetch metrics for batch"
        );
        for (host, latency) in metrics.mean_latency_ms() {
            debug!(host = %host, mean_latency_ms = latency, "Host latency");
        }

        self.metrics.reset().await;
    }
}
