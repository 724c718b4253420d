use anyhow::{Result, Context};
use chrono::Local;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::config::CrawlerConfig;
use crate::crawler::jobs;
use crate::crawler::{BatchResults, JobInfo, Scheduler, SearchOrchestrator};
use crate::storage::{Storage, StorageFactory};

/// Cancel the returned token on Ctrl+C
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight searches");
            trigger.cancel();
        }
    });

    token
}

async fn open_storage(config: &CrawlerConfig) -> Result<Arc<dyn Storage>> {
    StorageFactory::create(&config.storage)
        .await
        .context(format!("Failed to open {} storage", config.storage.storage_type))
}

/// Engine ids to search: the named ones, or every enabled engine
fn select_engines(config: &CrawlerConfig, requested: Vec<String>) -> Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(config.enabled_engines());
    }

    for engine in &requested {
        if !config.engines.contains_key(engine) {
            anyhow::bail!("Unknown engine '{}' (configured: {:?})", engine, config.engines.keys().collect::<Vec<_>>());
        }
    }

    Ok(requested)
}

fn print_batch(batch: &BatchResults) {
    let mut total = 0;
    for (keyword, per_engine) in batch {
        let keyword_total: usize = per_engine.values().map(Vec::len).sum();
        println!("  {}: {} results", keyword, keyword_total);
        for (engine, results) in per_engine {
            println!("    {:<8} {}", engine, results.len());
        }
        total += keyword_total;
    }
    println!("Search finished: {} results in total", total);
}

fn print_jobs(jobs: &[JobInfo]) {
    for job in jobs {
        let next = match job.next_run_time {
            Some(at) => at.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => "paused".to_string(),
        };
        let state = if job.running { " [running]" } else { "" };
        println!("  - {} ({}, {}): next run {}{}", job.id, job.kind, job.trigger, next, state);
    }
}

/// Search keywords once
pub async fn search(config: CrawlerConfig, keywords: Vec<String>, engines: Vec<String>, pages: Option<u32>) -> Result<()> {
    let engines = select_engines(&config, engines)?;
    let pages = pages.unwrap_or(config.crawler.pages_per_keyword);
    let storage = open_storage(&config).await?;

    let keywords = if keywords.is_empty() {
        jobs::resolve_keywords(storage.as_ref(), &config.keywords.defaults).await?
    } else {
        keywords
    };

    println!("Keywords: {}", keywords.join(", "));
    println!("Engines: {} ({} page(s) each)", engines.join(", "), pages);

    let orchestrator = SearchOrchestrator::new(&config, storage)?
        .with_cancellation(cancel_on_ctrl_c());
    let batch = orchestrator.search_all_engines(&keywords, pages, &engines).await;

    print_batch(&batch);
    Ok(())
}

const CONSOLE_HELP: &str = "Commands: list, run <job>, pause <job>, resume <job>, remove <job>";

/// Apply one console line to the running scheduler
async fn console_command(scheduler: &Scheduler, line: &str) {
    let mut words = line.split_whitespace();
    let (command, id) = (words.next(), words.next());

    let found = match (command, id) {
        (None, _) => return,
        (Some("list"), None) => {
            print_jobs(&scheduler.list_jobs().await);
            return;
        }
        (Some("run"), Some(id)) => match scheduler.run_once(id).await {
            Ok(found) => found,
            Err(e) => {
                println!("{}", e);
                return;
            }
        },
        (Some("pause"), Some(id)) => scheduler.pause_job(id).await,
        (Some("resume"), Some(id)) => scheduler.resume_job(id).await,
        (Some("remove"), Some(id)) => scheduler.remove_job(id).await,
        _ => {
            println!("{}", CONSOLE_HELP);
            return;
        }
    };

    match (found, id) {
        (true, Some(id)) => println!("{} {}: ok", command.unwrap_or_default(), id),
        (false, Some(id)) => println!("Unknown job: {}", id),
        _ => {}
    }
}

/// Run the default jobs until Ctrl+C, taking job commands from stdin
pub async fn schedule(config: CrawlerConfig) -> Result<()> {
    let storage = open_storage(&config).await?;
    let orchestrator = SearchOrchestrator::new(&config, storage)?;
    let scheduler = Scheduler::new(Duration::from_millis(config.scheduler.tick_ms));

    jobs::install_default_jobs(&scheduler, &orchestrator, &config).await?;
    scheduler.start().await;

    println!("Scheduler started with jobs:");
    print_jobs(&scheduler.list_jobs().await);
    println!("{}", CONSOLE_HELP);
    println!("Press Ctrl+C to stop");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                break;
            }
            line = lines.next_line(), if console_open => match line {
                Ok(Some(line)) => console_command(&scheduler, &line).await,
                Ok(None) => console_open = false,
                Err(e) => {
                    warn!("Console closed: {}", e);
                    console_open = false;
                }
            },
        }
    }

    info!("Stopping scheduler");
    scheduler.stop().await;
    println!("Scheduler stopped");

    Ok(())
}

/// List the default jobs, or run one of them now
pub async fn jobs(config: CrawlerConfig, run: Option<String>, json: bool) -> Result<()> {
    let storage = open_storage(&config).await?;
    let orchestrator = SearchOrchestrator::new(&config, storage)?
        .with_cancellation(cancel_on_ctrl_c());
    let scheduler = Scheduler::new(Duration::from_millis(config.scheduler.tick_ms));
    jobs::install_default_jobs(&scheduler, &orchestrator, &config).await?;

    match run {
        Some(id) => {
            info!("Running job {} now", id);
            if !scheduler.run_once(&id).await? {
                anyhow::bail!("Unknown job: {}", id);
            }
            println!("Job {} finished", id);
        }
        None if json => {
            let listing = serde_json::to_string_pretty(&scheduler.list_jobs().await)
                .context("Failed to serialize job list")?;
            println!("{}", listing);
        }
        None => {
            println!("Default jobs:");
            print_jobs(&scheduler.list_jobs().await);
        }
    }

    Ok(())
}

/// Track new keywords
pub async fn add_keywords(config: CrawlerConfig, keywords: Vec<String>) -> Result<()> {
    let storage = open_storage(&config).await?;

    for keyword in keywords {
        if storage.add_keyword(&keyword).await? {
            println!("Added: {}", keyword);
        } else {
            println!("Already tracked: {}", keyword);
        }
    }

    Ok(())
}

/// List tracked keywords
pub async fn list_keywords(config: CrawlerConfig) -> Result<()> {
    let storage = open_storage(&config).await?;
    let keywords = storage.list_keywords().await?;

    if keywords.is_empty() {
        println!("No keywords tracked yet");
        return Ok(());
    }

    for keyword in keywords {
        let last = keyword.last_searched
            .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        let state = if keyword.is_active { "active" } else { "inactive" };
        println!("  {:<20} {:<8} last searched {}", keyword.keyword, state, last);
    }

    Ok(())
}

/// Stop searching a keyword
pub async fn remove_keyword(config: CrawlerConfig, keyword: String) -> Result<()> {
    let storage = open_storage(&config).await?;

    if storage.deactivate_keyword(&keyword).await? {
        println!("Deactivated: {}", keyword);
    } else {
        warn!("Keyword '{}' is not an active keyword", keyword);
        println!("Not active: {}", keyword);
    }

    Ok(())
}

/// Task summary and today's statistics
pub async fn stats(config: CrawlerConfig, days: u32, recent: usize) -> Result<()> {
    let storage = open_storage(&config).await?;
    let today = Local::now().date_naive();

    let summary = storage.task_summary(days).await?;
    println!("Tasks over the last {} days:", days);
    if summary.is_empty() {
        println!("  none");
    }
    for row in &summary {
        let rate = if row.total_tasks > 0 {
            f64::from(row.completed_tasks) * 100.0 / f64::from(row.total_tasks)
        } else {
            0.0
        };
        print!(
            "  {:<20} {:<8} {} tasks, {} completed, {} failed ({:.1}% ok)",
            row.keyword, row.engine, row.total_tasks, row.completed_tasks, row.failed_tasks, rate
        );
        match storage.get_statistic(&row.keyword, &row.engine, today).await? {
            Some(stat) => println!(
                ", today {} results ({} failed), avg {:.2}s",
                stat.total_results, stat.failed_results, stat.avg_response_time
            ),
            None => println!(),
        }
    }

    let tasks = storage.recent_tasks(recent).await?;
    println!("Recent tasks:");
    for task in tasks {
        let results = storage.results_for_task(task.id).await?.len();
        println!(
            "  #{:<6} {:<20} {:<8} {:<9} {} results {}",
            task.id,
            task.keyword,
            task.engine,
            task.status,
            results,
            task.error_message.unwrap_or_default()
        );
    }

    Ok(())
}

/// Write the default configuration file
pub fn init_config(path: &Path) -> Result<()> {
    CrawlerConfig::default().save_to_file(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Show the effective configuration
pub fn show_config(config: &CrawlerConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(config)
        .context("Failed to serialize configuration")?;
    println!("{}", yaml);
    Ok(())
}
