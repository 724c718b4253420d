use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;

use crate::cli::config::StorageSettings;
use crate::crawler::task::{
    Fragment, Keyword, PurgeReport, SearchResult, SearchTask, Statistic, TaskId, TaskStatus, TaskSummary,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;

/// Persistence for tasks, results, statistics and keywords.
///
/// Backends own every row; the crawler never mutates stored state except
/// through these calls.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a pending task and return its id
    async fn create_task(&self, keyword: &str, engine: &str) -> Result<TaskId>;

    /// Move a task along its state machine; illegal transitions are errors
    async fn update_task_status(&self, task_id: TaskId, status: TaskStatus, error_message: Option<String>) -> Result<()>;

    /// Write a task's results in one batch with rank = index + 1
    async fn save_results(&self, task_id: TaskId, keyword: &str, engine: &str, fragments: &[Fragment]) -> Result<()>;

    /// Add one completion to the (keyword, engine, date) bucket
    async fn upsert_statistic(
        &self,
        keyword: &str,
        engine: &str,
        date: NaiveDate,
        total_results: u32,
        successful_results: u32,
        response_time: f64,
    ) -> Result<()>;

    async fn get_active_keywords(&self) -> Result<Vec<String>>;

    /// Insert a keyword; false when it already existed
    async fn add_keyword(&self, keyword: &str) -> Result<bool>;

    /// Soft-delete a keyword; false when it was unknown or already inactive
    async fn deactivate_keyword(&self, keyword: &str) -> Result<bool>;

    async fn mark_keyword_searched(&self, keyword: &str, at: DateTime<Utc>) -> Result<()>;

    async fn list_keywords(&self) -> Result<Vec<Keyword>>;

    /// Drop results and terminal tasks created before `cutoff`, and
    /// statistics whose date bucket is older than it
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport>;

    async fn get_task(&self, task_id: TaskId) -> Result<Option<SearchTask>>;

    async fn get_statistic(&self, keyword: &str, engine: &str, date: NaiveDate) -> Result<Option<Statistic>>;

    /// Most recently created tasks first
    async fn recent_tasks(&self, limit: usize) -> Result<Vec<SearchTask>>;

    /// Results of one task in rank order
    async fn results_for_task(&self, task_id: TaskId) -> Result<Vec<SearchResult>>;

    /// Task counts per keyword and engine over the last `days` days
    async fn task_summary(&self, days: u32) -> Result<Vec<TaskSummary>>;
}

/// Factory for creating a Storage implementation
pub struct StorageFactory;

impl StorageFactory {
    /// Create a new Storage instance based on the settings
    pub async fn create(settings: &StorageSettings) -> Result<Arc<dyn Storage>> {
        match settings.storage_type.as_str() {
            "postgresql" => {
                let storage = PostgresStorage::new(settings).await?;
                Ok(Arc::new(storage))
            },
            "memory" => Ok(Arc::new(MemoryStorage::new())),
            _ => {
                anyhow::bail!("Unsupported storage type: {}", settings.storage_type);
            }
        }
    }
}
