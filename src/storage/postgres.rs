use anyhow::{Result, Context};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::{Pool, Postgres, postgres::PgPoolOptions};
use tracing::debug;

use crate::cli::config::StorageSettings;
use crate::crawler::task::{
    Fragment, Keyword, PurgeReport, SearchResult, SearchTask, Statistic, TaskId, TaskStatus, TaskSummary,
};
use crate::storage::Storage;

/// PostgreSQL implementation of Storage
pub struct PostgresStorage {
    /// PostgreSQL connection pool
    pool: Pool<Postgres>,

    keywords: String,
    tasks: String,
    results: String,
    statistics: String,
}

/// Schema-qualified, prefixed table name
fn qualified(schema: &str, prefix: &str, table: &str) -> String {
    format!("{}.{}_{}", schema, prefix, table)
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    keyword: String,
    engine: String,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl TryFrom<TaskRow> for SearchTask {
    type Error = anyhow::Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(SearchTask {
            id: row.id,
            keyword: row.keyword,
            engine: row.engine,
            status: row.status.parse()?,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResultRow {
    task_id: i64,
    keyword: String,
    engine: String,
    title: String,
    url: String,
    snippet: String,
    rank: i32,
}

#[derive(sqlx::FromRow)]
struct StatisticRow {
    keyword: String,
    engine: String,
    date: NaiveDate,
    total_results: i64,
    successful_results: i64,
    failed_results: i64,
    avg_response_time: f64,
}

#[derive(sqlx::FromRow)]
struct KeywordRow {
    keyword: String,
    is_active: bool,
    created_at: DateTime<Utc>,
    last_searched: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    keyword: String,
    engine: String,
    total_tasks: i64,
    completed_tasks: i64,
    failed_tasks: i64,
}

impl PostgresStorage {
    /// Connect and make sure every table exists
    pub async fn new(settings: &StorageSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        let table = |name: &str| qualified(&settings.schema_name, &settings.table_prefix, name);
        let storage = Self {
            pool,
            keywords: table("keywords"),
            tasks: table("search_tasks"),
            results: table("search_results"),
            statistics: table("search_statistics"),
        };

        storage.ensure_schema(&settings.schema_name).await?;

        debug!("Connected to PostgreSQL database");

        Ok(storage)
    }

    /// Ensure the schema and tables exist
    async fn ensure_schema(&self, schema: &str) -> Result<()> {
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", schema),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    keyword TEXT PRIMARY KEY,
                    is_active BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    last_searched TIMESTAMPTZ
                )",
                self.keywords
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    keyword TEXT NOT NULL,
                    engine TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    started_at TIMESTAMPTZ,
                    completed_at TIMESTAMPTZ,
                    error_message TEXT
                )",
                self.tasks
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    task_id BIGINT NOT NULL REFERENCES {} (id) ON DELETE CASCADE,
                    keyword TEXT NOT NULL,
                    engine TEXT NOT NULL,
                    title TEXT NOT NULL,
                    url TEXT NOT NULL,
                    snippet TEXT NOT NULL,
                    rank INTEGER NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    UNIQUE (task_id, rank)
                )",
                self.results, self.tasks
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    keyword TEXT NOT NULL,
                    engine TEXT NOT NULL,
                    date DATE NOT NULL,
                    total_results BIGINT NOT NULL DEFAULT 0,
                    successful_results BIGINT NOT NULL DEFAULT 0,
                    failed_results BIGINT NOT NULL DEFAULT 0,
                    avg_response_time DOUBLE PRECISION NOT NULL DEFAULT 0,
                    PRIMARY KEY (keyword, engine, date)
                )",
                self.statistics
            ),
        ];

        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context(format!("Failed to prepare schema: {}", statement))?;
        }

        debug!("Ensured schema exists: {}", schema);

        Ok(())
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn create_task(&self, keyword: &str, engine: &str) -> Result<TaskId> {
        let query = format!(
            "INSERT INTO {} (keyword, engine, status) VALUES ($1, $2, 'pending') RETURNING id",
            self.tasks
        );

        let id: i64 = sqlx::query_scalar(&query)
            .bind(keyword)
            .bind(engine)
            .fetch_one(&self.pool)
            .await
            .context("Failed to create task")?;

        debug!(task_id = id, keyword, engine, "Created task");
        Ok(id)
    }

    async fn update_task_status(&self, task_id: TaskId, status: TaskStatus, error_message: Option<String>) -> Result<()> {
        let required = match status {
            TaskStatus::Running => TaskStatus::Pending,
            TaskStatus::Completed | TaskStatus::Failed => TaskStatus::Running,
            TaskStatus::Pending => anyhow::bail!("Task {} cannot return to pending", task_id),
        };
        let error_message = if status == TaskStatus::Failed { error_message } else { None };

        let query = format!(
            "UPDATE {} SET
                status = $2,
                started_at = CASE WHEN $2 = 'running' THEN NOW() ELSE started_at END,
                completed_at = CASE WHEN $2 IN ('completed', 'failed') THEN NOW() ELSE completed_at END,
                error_message = COALESCE($3, error_message)
             WHERE id = $1 AND status = $4",
            self.tasks
        );

        let updated = sqlx::query(&query)
            .bind(task_id)
            .bind(status.as_str())
            .bind(error_message)
            .bind(required.as_str())
            .execute(&self.pool)
            .await
            .context(format!("Failed to update task {}", task_id))?
            .rows_affected();

        if updated == 0 {
            anyhow::bail!("Task {} is missing or not {}; cannot move it to {}", task_id, required, status);
        }

        Ok(())
    }

    async fn save_results(&self, task_id: TaskId, keyword: &str, engine: &str, fragments: &[Fragment]) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (task_id, keyword, engine, title, url, snippet, rank)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            self.results
        );

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        for (index, fragment) in fragments.iter().enumerate() {
            sqlx::query(&query)
                .bind(task_id)
                .bind(keyword)
                .bind(engine)
                .bind(&fragment.title)
                .bind(&fragment.url)
                .bind(&fragment.snippet)
                .bind(index as i32 + 1)
                .execute(&mut *tx)
                .await
                .context(format!("Failed to save results for task {}", task_id))?;
        }
        tx.commit().await.context("Failed to commit results")?;

        debug!(task_id, count = fragments.len(), "Saved results");
        Ok(())
    }

    async fn upsert_statistic(
        &self,
        keyword: &str,
        engine: &str,
        date: NaiveDate,
        total_results: u32,
        successful_results: u32,
        response_time: f64,
    ) -> Result<()> {
        let query = format!(
            "INSERT INTO {} AS s (keyword, engine, date, total_results, successful_results, failed_results, avg_response_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (keyword, engine, date) DO UPDATE SET
                total_results = s.total_results + EXCLUDED.total_results,
                successful_results = s.successful_results + EXCLUDED.successful_results,
                failed_results = s.failed_results + EXCLUDED.failed_results,
                avg_response_time = (s.avg_response_time + EXCLUDED.avg_response_time) / 2",
            self.statistics
        );

        sqlx::query(&query)
            .bind(keyword)
            .bind(engine)
            .bind(date)
            .bind(i64::from(total_results))
            .bind(i64::from(successful_results))
            .bind(i64::from(total_results.saturating_sub(successful_results)))
            .bind(response_time)
            .execute(&self.pool)
            .await
            .context(format!("Failed to update statistics for {}/{}", keyword, engine))?;

        Ok(())
    }

    async fn get_active_keywords(&self) -> Result<Vec<String>> {
        let query = format!(
            "SELECT keyword FROM {} WHERE is_active ORDER BY created_at, keyword",
            self.keywords
        );

        sqlx::query_scalar(&query)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query active keywords")
    }

    async fn add_keyword(&self, keyword: &str) -> Result<bool> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            anyhow::bail!("Keyword must not be empty");
        }

        let query = format!(
            "INSERT INTO {} (keyword) VALUES ($1) ON CONFLICT (keyword) DO NOTHING",
            self.keywords
        );

        let inserted = sqlx::query(&query)
            .bind(keyword)
            .execute(&self.pool)
            .await
            .context(format!("Failed to add keyword: {}", keyword))?
            .rows_affected();

        Ok(inserted == 1)
    }

    async fn deactivate_keyword(&self, keyword: &str) -> Result<bool> {
        let query = format!(
            "UPDATE {} SET is_active = FALSE WHERE keyword = $1 AND is_active",
            self.keywords
        );

        let updated = sqlx::query(&query)
            .bind(keyword.trim())
            .execute(&self.pool)
            .await
            .context(format!("Failed to deactivate keyword: {}", keyword))?
            .rows_affected();

        Ok(updated == 1)
    }

    async fn mark_keyword_searched(&self, keyword: &str, at: DateTime<Utc>) -> Result<()> {
        let query = format!("UPDATE {} SET last_searched = $2 WHERE keyword = $1", self.keywords);

        sqlx::query(&query)
            .bind(keyword)
            .bind(at)
            .execute(&self.pool)
            .await
            .context(format!("Failed to mark keyword searched: {}", keyword))?;

        Ok(())
    }

    async fn list_keywords(&self) -> Result<Vec<Keyword>> {
        let query = format!(
            "SELECT keyword, is_active, created_at, last_searched FROM {} ORDER BY created_at, keyword",
            self.keywords
        );

        let rows = sqlx::query_as::<_, KeywordRow>(&query)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list keywords")?;

        Ok(rows.into_iter()
            .map(|row| Keyword {
                keyword: row.keyword,
                is_active: row.is_active,
                created_at: row.created_at,
                last_searched: row.last_searched,
            })
            .collect())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport> {
        let expired = format!(
            "SELECT id FROM {} WHERE created_at < $1 AND status IN ('completed', 'failed')",
            self.tasks
        );
        let delete_results = format!("DELETE FROM {} WHERE task_id IN ({})", self.results, expired);
        let delete_tasks = format!("DELETE FROM {} WHERE id IN ({})", self.tasks, expired);
        let delete_statistics = format!("DELETE FROM {} WHERE date < $1", self.statistics);

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let results = sqlx::query(&delete_results)
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .context("Failed to purge results")?
            .rows_affected();

        let tasks = sqlx::query(&delete_tasks)
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .context("Failed to purge tasks")?
            .rows_affected();

        let statistics = sqlx::query(&delete_statistics)
            .bind(cutoff.date_naive())
            .execute(&mut *tx)
            .await
            .context("Failed to purge statistics")?
            .rows_affected();

        tx.commit().await.context("Failed to commit purge")?;

        Ok(PurgeReport { tasks, results, statistics })
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<SearchTask>> {
        let query = format!("SELECT * FROM {} WHERE id = $1", self.tasks);

        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context(format!("Failed to query task {}", task_id))?;

        row.map(SearchTask::try_from).transpose()
    }

    async fn get_statistic(&self, keyword: &str, engine: &str, date: NaiveDate) -> Result<Option<Statistic>> {
        let query = format!(
            "SELECT keyword, engine, date, total_results, successful_results, failed_results, avg_response_time
             FROM {} WHERE keyword = $1 AND engine = $2 AND date = $3",
            self.statistics
        );

        let row = sqlx::query_as::<_, StatisticRow>(&query)
            .bind(keyword)
            .bind(engine)
            .bind(date)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query statistic")?;

        Ok(row.map(|row| Statistic {
            keyword: row.keyword,
            engine: row.engine,
            date: row.date,
            total_results: row.total_results as u32,
            successful_results: row.successful_results as u32,
            failed_results: row.failed_results as u32,
            avg_response_time: row.avg_response_time,
        }))
    }

    async fn recent_tasks(&self, limit: usize) -> Result<Vec<SearchTask>> {
        let query = format!("SELECT * FROM {} ORDER BY id DESC LIMIT $1", self.tasks);

        let rows = sqlx::query_as::<_, TaskRow>(&query)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query recent tasks")?;

        rows.into_iter().map(SearchTask::try_from).collect()
    }

    async fn results_for_task(&self, task_id: TaskId) -> Result<Vec<SearchResult>> {
        let query = format!(
            "SELECT task_id, keyword, engine, title, url, snippet, rank FROM {} WHERE task_id = $1 ORDER BY rank",
            self.results
        );

        let rows = sqlx::query_as::<_, ResultRow>(&query)
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .context(format!("Failed to query results for task {}", task_id))?;

        Ok(rows.into_iter()
            .map(|row| SearchResult {
                task_id: row.task_id,
                keyword: row.keyword,
                engine: row.engine,
                title: row.title,
                url: row.url,
                snippet: row.snippet,
                rank: row.rank as u32,
            })
            .collect())
    }

    async fn task_summary(&self, days: u32) -> Result<Vec<TaskSummary>> {
        let query = format!(
            "SELECT keyword, engine,
                COUNT(*) AS total_tasks,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed_tasks,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed_tasks
             FROM {}
             WHERE created_at >= $1
             GROUP BY keyword, engine
             ORDER BY keyword, engine",
            self.tasks
        );

        let rows = sqlx::query_as::<_, SummaryRow>(&query)
            .bind(Utc::now() - Duration::days(i64::from(days)))
            .fetch_all(&self.pool)
            .await
            .context("Failed to query task summary")?;

        Ok(rows.into_iter()
            .map(|row| TaskSummary {
                keyword: row.keyword,
                engine: row.engine,
                total_tasks: row.total_tasks as u32,
                completed_tasks: row.completed_tasks as u32,
                failed_tasks: row.failed_tasks as u32,
            })
            .collect())
    }
}
