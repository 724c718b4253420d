//! Default job topology: hourly keyword search, daily trending refresh and
//! weekly retention cleanup.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing::info;

use crate::cli::config::CrawlerConfig;
use crate::crawler::orchestrator::SearchOrchestrator;
use crate::crawler::scheduler::{Scheduler, SchedulerError};
use crate::crawler::task::PurgeReport;
use crate::storage::Storage;

pub const SEARCH_JOB: &str = "search_keywords_hourly";
pub const TRENDING_JOB: &str = "trending_keywords_daily";
pub const CLEANUP_JOB: &str = "cleanup_weekly";

/// Active keywords, seeding `defaults` into storage when there are none
pub async fn resolve_keywords(storage: &dyn Storage, defaults: &[String]) -> Result<Vec<String>> {
    let active = storage.get_active_keywords().await?;
    if !active.is_empty() {
        return Ok(active);
    }

    info!(count = defaults.len(), "No active keywords, seeding defaults");
    for keyword in defaults {
        storage.add_keyword(keyword).await?;
    }

    storage.get_active_keywords().await
}

/// Search every active keyword on `engines`; returns the number of results
pub async fn run_keyword_search(
    orchestrator: &SearchOrchestrator,
    defaults: &[String],
    engines: &[String],
    pages: u32,
) -> Result<usize> {
    let keywords = resolve_keywords(orchestrator.storage().as_ref(), defaults).await?;
    info!(keywords = ?keywords, "Running keyword search");

    let batch = orchestrator.search_all_engines(&keywords, pages, engines).await;
    let total: usize = batch.values()
        .flat_map(|per_engine| per_engine.values())
        .map(Vec::len)
        .sum();

    info!(total, "Keyword search finished");
    Ok(total)
}

/// Add the trending list to storage; returns how many were new
pub async fn refresh_trending(storage: &dyn Storage, trending: &[String]) -> Result<usize> {
    let mut added = 0;
    for keyword in trending {
        if storage.add_keyword(keyword).await? {
            added += 1;
        }
    }

    info!(listed = trending.len(), added, "Trending keywords refreshed");
    Ok(added)
}

/// Delete data older than `retention_days`
pub async fn purge_expired(storage: &dyn Storage, retention_days: u32) -> Result<PurgeReport> {
    let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
    let report = storage.purge_before(cutoff).await?;

    info!(
        retention_days,
        tasks = report.tasks,
        results = report.results,
        statistics = report.statistics,
        "Old data purged"
    );
    Ok(report)
}

/// Register the three default jobs on `scheduler`
pub async fn install_default_jobs(
    scheduler: &Scheduler,
    orchestrator: &SearchOrchestrator,
    config: &CrawlerConfig,
) -> Result<(), SchedulerError> {
    let search = orchestrator.clone();
    let defaults = config.keywords.defaults.clone();
    let engines = config.enabled_engines();
    let pages = config.crawler.pages_per_keyword;
    scheduler.add_interval_job(SEARCH_JOB, Duration::from_secs(config.scheduler.search_interval_secs), move |token| {
        let orchestrator = search.clone().with_cancellation(token);
        let defaults = defaults.clone();
        let engines = engines.clone();
        async move {
            run_keyword_search(&orchestrator, &defaults, &engines, pages).await?;
            Ok::<_, anyhow::Error>(())
        }
    }).await?;

    let storage = orchestrator.storage().clone();
    let trending = config.keywords.trending.clone();
    scheduler.add_cron_job(TRENDING_JOB, &config.scheduler.trending_cron, move |_| {
        let storage = storage.clone();
        let trending = trending.clone();
        async move {
            refresh_trending(storage.as_ref(), &trending).await?;
            Ok::<_, anyhow::Error>(())
        }
    }).await?;

    let storage = orchestrator.storage().clone();
    let retention_days = config.scheduler.retention_days;
    scheduler.add_cron_job(CLEANUP_JOB, &config.scheduler.cleanup_cron, move |_| {
        let storage = storage.clone();
        async move {
            purge_expired(storage.as_ref(), retention_days).await?;
            Ok::<_, anyhow::Error>(())
        }
    }).await?;

    info!("Default jobs installed");
    Ok(())
}
