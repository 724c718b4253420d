use anyhow::{Result, Context};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::debug;

use crate::crawler::task::{
    Fragment, Keyword, PurgeReport, SearchResult, SearchTask, Statistic, TaskId, TaskStatus, TaskSummary,
};
use crate::storage::Storage;

#[derive(Default)]
struct State {
    next_task_id: TaskId,
    tasks: BTreeMap<TaskId, SearchTask>,
    results: BTreeMap<TaskId, Vec<SearchResult>>,
    statistics: HashMap<(String, String, NaiveDate), Statistic>,

    /// Insertion order is the order keywords are searched in
    keywords: Vec<Keyword>,
}

/// In-process backend for one-shot runs and tests
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_task(&self, keyword: &str, engine: &str) -> Result<TaskId> {
        let mut state = self.state.lock().await;
        state.next_task_id += 1;
        let id = state.next_task_id;
        state.tasks.insert(id, SearchTask::new(id, keyword, engine));

        debug!(task_id = id, keyword, engine, "Created task");
        Ok(id)
    }

    async fn update_task_status(&self, task_id: TaskId, status: TaskStatus, error_message: Option<String>) -> Result<()> {
        let mut state = self.state.lock().await;
        let task = state.tasks.get_mut(&task_id)
            .context(format!("Unknown task: {}", task_id))?;

        task.transition(status, error_message)
            .context(format!("Failed to update task {}", task_id))?;

        Ok(())
    }

    async fn save_results(&self, task_id: TaskId, keyword: &str, engine: &str, fragments: &[Fragment]) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.tasks.contains_key(&task_id) {
            anyhow::bail!("Cannot save results for unknown task {}", task_id);
        }

        let results = fragments.iter()
            .enumerate()
            .map(|(index, fragment)| SearchResult {
                task_id,
                keyword: keyword.to_string(),
                engine: engine.to_string(),
                title: fragment.title.clone(),
                url: fragment.url.clone(),
                snippet: fragment.snippet.clone(),
                rank: index as u32 + 1,
            })
            .collect();

        state.results.insert(task_id, results);
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
        let mut state = self.state.lock().await;
        state.statistics
            .entry((keyword.to_string(), engine.to_string(), date))
            .and_modify(|stat| stat.absorb(total_results, successful_results, response_time))
            .or_insert_with(|| Statistic::new(keyword, engine, date, total_results, successful_results, response_time));

        Ok(())
    }

    async fn get_active_keywords(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state.keywords.iter()
            .filter(|k| k.is_active)
            .map(|k| k.keyword.clone())
            .collect())
    }

    async fn add_keyword(&self, keyword: &str) -> Result<bool> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            anyhow::bail!("Keyword must not be empty");
        }

        let mut state = self.state.lock().await;
        if state.keywords.iter().any(|k| k.keyword == keyword) {
            return Ok(false);
        }

        state.keywords.push(Keyword {
            keyword: keyword.to_string(),
            is_active: true,
            created_at: Utc::now(),
            last_searched: None,
        });
        Ok(true)
    }

    async fn deactivate_keyword(&self, keyword: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.keywords.iter_mut().find(|k| k.keyword == keyword.trim() && k.is_active) {
            Some(entry) => {
                entry.is_active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_keyword_searched(&self, keyword: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.keywords.iter_mut().find(|k| k.keyword == keyword) {
            entry.last_searched = Some(at);
        }
        Ok(())
    }

    async fn list_keywords(&self) -> Result<Vec<Keyword>> {
        Ok(self.state.lock().await.keywords.clone())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport> {
        let mut state = self.state.lock().await;
        let mut report = PurgeReport::default();

        let expired: Vec<TaskId> = state.tasks.values()
            .filter(|task| task.status.is_terminal() && task.created_at < cutoff)
            .map(|task| task.id)
            .collect();

        for id in expired {
            state.tasks.remove(&id);
            report.tasks += 1;
            if let Some(results) = state.results.remove(&id) {
                report.results += results.len() as u64;
            }
        }

        let cutoff_date = cutoff.date_naive();
        let before = state.statistics.len();
        state.statistics.retain(|_, stat| stat.date >= cutoff_date);
        report.statistics = (before - state.statistics.len()) as u64;

        Ok(report)
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<SearchTask>> {
        Ok(self.state.lock().await.tasks.get(&task_id).cloned())
    }

    async fn get_statistic(&self, keyword: &str, engine: &str, date: NaiveDate) -> Result<Option<Statistic>> {
        let state = self.state.lock().await;
        Ok(state.statistics
            .get(&(keyword.to_string(), engine.to_string(), date))
            .cloned())
    }

    async fn recent_tasks(&self, limit: usize) -> Result<Vec<SearchTask>> {
        let state = self.state.lock().await;
        Ok(state.tasks.values().rev().take(limit).cloned().collect())
    }

    async fn results_for_task(&self, task_id: TaskId) -> Result<Vec<SearchResult>> {
        let state = self.state.lock().await;
        Ok(state.results.get(&task_id).cloned().unwrap_or_default())
    }

    async fn task_summary(&self, days: u32) -> Result<Vec<TaskSummary>> {
        let since = Utc::now() - Duration::days(i64::from(days));
        let state = self.state.lock().await;

        let mut summary: BTreeMap<(String, String), TaskSummary> = BTreeMap::new();
        for task in state.tasks.values().filter(|t| t.created_at >= since) {
            let entry = summary
                .entry((task.keyword.clone(), task.engine.clone()))
                .or_insert_with(|| TaskSummary {
                    keyword: task.keyword.clone(),
                    engine: task.engine.clone(),
                    total_tasks: 0,
                    completed_tasks: 0,
                    failed_tasks: 0,
                });

            entry.total_tasks += 1;
            match task.status {
                TaskStatus::Completed => entry.completed_tasks += 1,
                TaskStatus::Failed => entry.failed_tasks += 1,
                _ => {}
            }
        }

        Ok(summary.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragments(titles: &[&str]) -> Vec<Fragment> {
        titles.iter()
            .map(|title| Fragment {
                title: title.to_string(),
                url: format!("https://{}.example/", title),
                snippet: String::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_task_lifecycle_is_enforced() {
        let storage = MemoryStorage::new();
        let id = storage.create_task("rust", "bing").await.unwrap();

        assert!(storage.update_task_status(id, TaskStatus::Completed, None).await.is_err());
        storage.update_task_status(id, TaskStatus::Running, None).await.unwrap();
        storage.update_task_status(id, TaskStatus::Completed, None).await.unwrap();
        assert!(storage.update_task_status(id, TaskStatus::Failed, Some("late".into())).await.is_err());

        let task = storage.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.error_message.is_none());
    }

    #[tokio::test]
    async fn test_results_ranked_from_one() {
        let storage = MemoryStorage::new();
        let id = storage.create_task("rust", "bing").await.unwrap();
        storage.save_results(id, "rust", "bing", &fragments(&["a", "b", "c"])).await.unwrap();

        let results = storage.results_for_task(id).await.unwrap();
        let ranks: Vec<u32> = results.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, [1, 2, 3]);
        assert_eq!(results[1].title, "b");
        assert!(storage.save_results(99, "rust", "bing", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_statistic_upsert_averages_with_previous() {
        let storage = MemoryStorage::new();
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();

        storage.upsert_statistic("test", "bing", date, 5, 5, 2.0).await.unwrap();
        let first = storage.get_statistic("test", "bing", date).await.unwrap().unwrap();
        assert_eq!((first.total_results, first.successful_results), (5, 5));
        assert_eq!(first.avg_response_time, 2.0);

        storage.upsert_statistic("test", "bing", date, 3, 3, 4.0).await.unwrap();
        let second = storage.get_statistic("test", "bing", date).await.unwrap().unwrap();
        assert_eq!((second.total_results, second.successful_results, second.failed_results), (8, 8, 0));
        assert_eq!(second.avg_response_time, 3.0);

        assert!(storage.get_statistic("test", "baidu", date).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keywords_insert_once_and_soft_delete() {
        let storage = MemoryStorage::new();
        assert!(storage.add_keyword("rust").await.unwrap());
        assert!(!storage.add_keyword(" rust ").await.unwrap());
        assert!(storage.add_keyword("tokio").await.unwrap());
        assert!(storage.add_keyword("   ").await.is_err());

        assert!(storage.deactivate_keyword("rust").await.unwrap());
        assert!(!storage.deactivate_keyword("rust").await.unwrap());
        assert!(!storage.deactivate_keyword("missing").await.unwrap());

        assert_eq!(storage.get_active_keywords().await.unwrap(), ["tokio"]);
        assert_eq!(storage.list_keywords().await.unwrap().len(), 2);

        let now = Utc::now();
        storage.mark_keyword_searched("tokio", now).await.unwrap();
        let listed = storage.list_keywords().await.unwrap();
        assert_eq!(listed[1].last_searched, Some(now));
    }

    #[tokio::test]
    async fn test_purge_keeps_running_and_recent_rows() {
        let storage = MemoryStorage::new();
        let done = storage.create_task("rust", "bing").await.unwrap();
        storage.update_task_status(done, TaskStatus::Running, None).await.unwrap();
        storage.save_results(done, "rust", "bing", &fragments(&["a", "b"])).await.unwrap();
        storage.update_task_status(done, TaskStatus::Completed, None).await.unwrap();

        let running = storage.create_task("rust", "baidu").await.unwrap();
        storage.update_task_status(running, TaskStatus::Running, None).await.unwrap();

        let old = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        let today = Utc::now().date_naive();
        storage.upsert_statistic("rust", "bing", old, 1, 1, 1.0).await.unwrap();
        storage.upsert_statistic("rust", "bing", today, 1, 1, 1.0).await.unwrap();

        // Nothing is old enough yet
        let report = storage.purge_before(Utc::now() - Duration::days(30)).await.unwrap();
        assert_eq!(report, PurgeReport { tasks: 0, results: 0, statistics: 1 });

        let report = storage.purge_before(Utc::now() + Duration::seconds(1)).await.unwrap();
        assert_eq!(report.tasks, 1);
        assert_eq!(report.results, 2);
        assert!(storage.get_task(done).await.unwrap().is_none());
        assert!(storage.get_task(running).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_summary_and_recent_tasks() {
        let storage = MemoryStorage::new();
        for engine in ["bing", "bing", "baidu"] {
            let id = storage.create_task("rust", engine).await.unwrap();
            storage.update_task_status(id, TaskStatus::Running, None).await.unwrap();
            let status = if engine == "baidu" { TaskStatus::Failed } else { TaskStatus::Completed };
            storage.update_task_status(id, status, None).await.unwrap();
        }

        let summary = storage.task_summary(7).await.unwrap();
        assert_eq!(summary, vec![
            TaskSummary { keyword: "rust".into(), engine: "baidu".into(), total_tasks: 1, completed_tasks: 0, failed_tasks: 1 },
            TaskSummary { keyword: "rust".into(), engine: "bing".into(), total_tasks: 2, completed_tasks: 2, failed_tasks: 0 },
        ]);

        let recent = storage.recent_tasks(2).await.unwrap();
        assert_eq!(recent.iter().map(|t| t.id).collect::<Vec<_>>(), [3, 2]);
    }
}
