use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Outcome of one fetch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Blocked,
    Failed,
}

/// Fetch metrics collector shared by all workers
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<Metrics>>,
}

/// Metrics data structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,

    pub total_attempts: usize,
    pub successful_attempts: usize,
    pub blocked_attempts: usize,
    pub failed_attempts: usize,

    /// Attempt durations per host, in milliseconds
    pub durations: HashMap<String, Vec<u64>>,

    /// HTTP status code counts
    pub status_codes: HashMap<u16, usize>,

    pub bytes_downloaded: usize,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            total_attempts: 0,
            successful_attempts: 0,
            blocked_attempts: 0,
            failed_attempts: 0,
            durations: HashMap::new(),
            status_codes: HashMap::new(),
            bytes_downloaded: 0,
        }
    }
}

impl Metrics {
    /// Mean attempt latency per host in milliseconds
    pub fn mean_latency_ms(&self) -> HashMap<String, f64> {
        self.durations.iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(host, samples)| {
                let sum: u64 = samples.iter().sum();
                (host.clone(), sum as f64 / samples.len() as f64)
            })
            .collect()
    }
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(Mutex::new(Metrics::default())),
        }
    }

    /// Record one fetch attempt
    pub async fn record_attempt(&self, host: &str, outcome: AttemptOutcome, duration_ms: u64, status_code: Option<u16>, bytes: usize) {
        let mut metrics = self.metrics.lock().await;

        metrics.total_attempts += 1;
        match outcome {
            AttemptOutcome::Success => metrics.successful_attempts += 1,
            AttemptOutcome::Blocked => metrics.blocked_attempts += 1,
            AttemptOutcome::Failed => metrics.failed_attempts += 1,
        }

        metrics.bytes_downloaded += bytes;

        metrics.durations
            .entry(host.to_string())
            .or_default()
            .push(duration_ms);

        if let Some(code) = status_code {
            *metrics.status_codes.entry(code).or_default() += 1;
        }
    }

    /// Get all metrics
    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }

    /// Reset metrics
    pub async fn reset(&self) {
        *self.metrics.lock().await = Metrics::default();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
