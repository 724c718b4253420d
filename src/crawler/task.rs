use serde::{Serialize, Deserialize};
use chrono::{DateTime, NaiveDate, Utc};
use std::fmt;
use thiserror::Error;

/// Storage identifier of a search task
pub type TaskId = i64;

/// Lifecycle state of a search task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Terminal states never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => anyhow::bail!("Unknown task status: {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal task transition {from} -> {to}")]
pub struct TaskStateError {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// One crawl attempt for a (keyword, engine) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchTask {
    /// Storage identifier
    pub id: TaskId,

    /// Keyword being searched
    pub keyword: String,

    /// Engine identifier (key of the engine profile)
    pub engine: String,

    /// Current lifecycle state
    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Failure reason for failed tasks
    pub error_message: Option<String>,
}

impl SearchTask {
    /// Create a pending task
    pub fn new(id: TaskId, keyword: &str, engine: &str) -> Self {
        Self {
            id,
            keyword: keyword.to_string(),
            engine: engine.to_string(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Move the task to `next`, stamping the matching timestamp.
    ///
    /// Only pending -> running -> {completed | failed} is accepted; a
    /// terminal task rejects every transition.
    pub fn transition(&mut self, next: TaskStatus, error_message: Option<String>) -> Result<(), TaskStateError> {
        if !self.status.can_transition_to(next) {
            return Err(TaskStateError { from: self.status, to: next });
        }

        let now = Utc::now();
        match next {
            TaskStatus::Running => self.started_at = Some(now),
            TaskStatus::Completed => self.completed_at = Some(now),
            TaskStatus::Failed => {
                self.completed_at = Some(now);
                self.error_message = error_message;
            }
            TaskStatus::Pending => {}
        }
        self.status = next;

        Ok(())
    }
}

/// Extracted (title, url, snippet) triple before rank and task are attached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// One search hit belonging to a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub task_id: TaskId,
    pub keyword: String,
    pub engine: String,
    pub title: String,
    pub url: String,
    pub snippet: String,

    /// 1-based position within the task, document order
    pub rank: u32,
}

/// Per-(keyword, engine, date) rollup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistic {
    pub keyword: String,
    pub engine: String,
    pub date: NaiveDate,
    pub total_results: u32,
    pub successful_results: u32,
    pub failed_results: u32,
    pub avg_response_time: f64,
}

impl Statistic {
    /// Fresh bucket seeded with a single sample
    pub fn new(keyword: &str, engine: &str, date: NaiveDate, total: u32, successful: u32, response_time: f64) -> Self {
        Self {
            keyword: keyword.to_string(),
            engine: engine.to_string(),
            date,
            total_results: total,
            successful_results: successful,
            failed_results: total.saturating_sub(successful),
            avg_response_time: response_time,
        }
    }

    /// Fold another completion into this bucket.
    ///
    /// Counts add up; the average is `(old + sample) / 2`, which downstream
    /// reports rely on even though it is not a true running mean.
    pub fn absorb(&mut self, total: u32, successful: u32, response_time: f64) {
        self.total_results += total;
        self.successful_results += successful;
        self.failed_results += total.saturating_sub(successful);
        self.avg_response_time = (self.avg_response_time + response_time) / 2.0;
    }
}

/// Search term tracked by the crawler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keyword {
    pub keyword: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_searched: Option<DateTime<Utc>>,
}

/// Per keyword/engine task counts for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub keyword: String,
    pub engine: String,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
}

/// Rows removed by a retention sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub tasks: u64,
    pub results: u64,
    pub statistics: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut task = SearchTask::new(1, "rust", "bing");
        assert_eq!(task.status, TaskStatus::Pending);

        task.transition(TaskStatus::Running, None).unwrap();
        assert!(task.started_at.is_some());

        task.transition(TaskStatus::Completed, None).unwrap();
        assert!(task.completed_at.is_some());
        assert!(task.status.is_terminal());
    }

    #[test]
    fn test_terminal_task_is_frozen() {
        let mut task = SearchTask::new(1, "rust", "bing");
        task.transition(TaskStatus::Running, None).unwrap();
        task.transition(TaskStatus::Failed, Some("boom".to_string())).unwrap();

        for next in [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Completed, TaskStatus::Failed] {
            let err = task.transition(next, None).unwrap_err();
            assert_eq!(err.from, TaskStatus::Failed);
        }
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_pending_cannot_skip_running() {
        let mut task = SearchTask::new(1, "rust", "bing");
        assert!(task.transition(TaskStatus::Completed, None).is_err());
        assert!(task.transition(TaskStatus::Failed, None).is_err());
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_statistic_absorb_matches_reporting_formula() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let mut stat = Statistic::new("test", "bing", date, 5, 5, 2.0);
        stat.absorb(3, 3, 4.0);

        assert_eq!(stat.total_results, 8);
        assert_eq!(stat.successful_results, 8);
        assert_eq!(stat.failed_results, 0);
        assert!((stat.avg_response_time - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Completed, TaskStatus::Failed] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("paused".parse::<TaskStatus>().is_err());
    }
}
