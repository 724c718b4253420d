//! Fetch layer: one GET per attempt under a fresh browser identity, with
//! jitter, per-host pacing, block detection, cooldown and backoff.

use anyhow::{Result, Context};
use reqwest::Client;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::cli::config::FetchSettings;
use crate::crawler::blocking::{BlockDetector, BlockSignal};
use crate::crawler::identity::{Identity, IdentityPool};
use crate::crawler::pacing::{backoff_delay, pause, Cancelled, HostLimiter};
use crate::utils::metrics::{AttemptOutcome, MetricsCollector};

/// Why a single attempt did not produce a usable page
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("blocked: {0}")]
    Blocked(String),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("network error: {0}")]
    Network(String),
}

/// Terminal outcome of `Fetcher::fetch`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("{url}: gave up after {attempts} attempts ({reason})")]
    Exhausted {
        url: String,
        attempts: u32,
        reason: FailureReason,
    },

    #[error("fetch cancelled")]
    Cancelled,
}

impl From<Cancelled> for FetchError {
    fn from(_: Cancelled) -> Self {
        FetchError::Cancelled
    }
}

/// HTTP fetcher disguised as organic browser traffic
pub struct Fetcher {
    client: Client,
    identities: IdentityPool,
    detector: BlockDetector,
    limiter: HostLimiter,
    settings: FetchSettings,
    metrics: MetricsCollector,
}

impl Fetcher {
    /// Create a fetcher from the fetch settings
    pub fn new(settings: &FetchSettings, metrics: MetricsCollector) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .cookie_store(true)
            .build()
            .context("Failed to create HTTP client")?;

        let detector = BlockDetector::new(&settings.blocked_statuses, &settings.block_indicators)?;

        Ok(Self {
            client,
            identities: IdentityPool::new(settings),
            detector,
            limiter: HostLimiter::per_minute(settings.requests_per_host_per_minute),
            settings: settings.clone(),
            metrics,
        })
    }

    /// Configured attempt budget
    pub fn max_retries(&self) -> u32 {
        self.settings.max_retries
    }

    /// Retrieve the body of `url`, trying at most `max_retries` times.
    ///
    /// Blocked responses trigger the block cooldown; other failures back off
    /// exponentially. Exhaustion is returned, never raised.
    pub async fn fetch(&self, url: &str, max_retries: u32, cancel: &CancellationToken) -> Result<String, FetchError> {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        let attempts = max_retries.max(1);
        let mut last_reason = FailureReason::Network("no attempt made".to_string());

        for attempt in 0..attempts {
            let is_last = attempt + 1 == attempts;

            // Jitter before every attempt, wider on retries
            let jitter = if attempt == 0 { self.settings.request_jitter } else { self.settings.retry_jitter };
            pause(jitter.sample(), cancel).await?;
            self.limiter.acquire(&host, cancel).await?;

            let identity = self.identities.random_identity(&self.client).await;
            debug!(url, attempt = attempt + 1, user_agent = %identity.user_agent, "Sending request");
            let started = Instant::now();

            let outcome = tokio::select! {
                outcome = self.attempt(url, identity) => outcome,
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok((status, body)) => {
                    if let Some(signal) = self.detector.detect(status, &body) {
                        let description = match &signal {
                            BlockSignal::Status(code) => format!("status {}", code),
                            BlockSignal::Indicator(phrase) => format!("indicator '{}'", phrase),
                        };
                        warn!(url, attempt = attempt + 1, status, signal = %description, "Fetch attempt blocked");
                        self.metrics.record_attempt(&host, AttemptOutcome::Blocked, elapsed_ms, Some(status), body.len()).await;
                        last_reason = FailureReason::Blocked(description);

                        if !is_last {
                            pause(self.settings.block_cooldown.sample(), cancel).await?;
                        }
                        continue;
                    }

                    if status == 200 {
                        info!(url, attempt = attempt + 1, elapsed_ms, bytes = body.len(), "Fetch attempt succeeded");
                        self.metrics.record_attempt(&host, AttemptOutcome::Success, elapsed_ms, Some(status), body.len()).await;
                        return Ok(body);
                    }

                    warn!(url, attempt = attempt + 1, status, "Fetch attempt failed with unexpected status");
                    self.metrics.record_attempt(&host, AttemptOutcome::Failed, elapsed_ms, Some(status), body.len()).await;
                    last_reason = FailureReason::Status(status);
                }
                Err(e) => {
                    warn!(url, attempt = attempt + 1, error = %e, "Fetch attempt failed");
                    self.metrics.record_attempt(&host, AttemptOutcome::Failed, elapsed_ms, None, 0).await;
                    last_reason = FailureReason::Network(e.to_string());
                }
            }

            if !is_last {
                let delay = backoff_delay(self.settings.backoff_base_ms, attempt, &self.settings.backoff_jitter);
                pause(delay, cancel).await?;
            }
        }

        Err(FetchError::Exhausted {
            url: url.to_string(),
            attempts,
            reason: last_reason,
        })
    }

    /// One GET, returning status and body
    async fn attempt(&self, url: &str, identity: Identity) -> Result<(u16, String), reqwest::Error> {
        let response = self.client.get(url)
            .headers(identity.headers)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;

        Ok((status, body))
    }
}
