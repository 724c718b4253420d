//! Job scheduler: a registry of named interval and cron jobs driven by a
//! background clock. Each job has a run lock, so one job id never runs twice
//! at the same time.

use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use cron::Schedule;
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("job interval must be greater than zero")]
    InvalidInterval,

    #[error("job '{id}' failed: {message}")]
    JobFailed { id: String, message: String },
}

pub type JobFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Job body; the token is cancelled when the scheduler stops
pub type JobFn = Arc<dyn Fn(CancellationToken) -> JobFuture + Send + Sync>;

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// When a job fires
#[derive(Debug, Clone)]
pub enum Trigger {
    Interval(Duration),
    Cron { expr: String, schedule: Schedule },
}

impl Trigger {
    pub fn interval(period: Duration) -> Result<Self, SchedulerError> {
        if period.is_zero() {
            return Err(SchedulerError::InvalidInterval);
        }
        Ok(Trigger::Interval(period))
    }

    /// Parse a five-field expression: minute, hour, day-of-month, month,
    /// day-of-week (0 or 7 is Sunday)
    pub fn cron(expr: &str) -> Result<Self, SchedulerError> {
        let invalid = |reason: String| SchedulerError::InvalidCron { expr: expr.to_string(), reason };

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }

        let day_of_week = day_of_week_names(fields[4]).map_err(invalid)?;
        let full = format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], day_of_week);
        let schedule = Schedule::from_str(&full).map_err(|e| invalid(e.to_string()))?;

        Ok(Trigger::Cron { expr: expr.to_string(), schedule })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Interval(_) => "interval",
            Trigger::Cron { .. } => "cron",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Trigger::Interval(period) => format!("every {}s", period.as_secs_f64()),
            Trigger::Cron { expr, .. } => expr.clone(),
        }
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        match self {
            Trigger::Interval(period) => ChronoDuration::from_std(*period)
                .ok()
                .and_then(|period| after.checked_add_signed(period)),
            Trigger::Cron { schedule, .. } => schedule.after(&after).next(),
        }
    }
}

/// Rewrite numeric day-of-week tokens as names so 0 and 7 both mean Sunday.
/// A range ending at 7 becomes a range to Saturday plus Sunday.
fn day_of_week_names(field: &str) -> Result<String, String> {
    field.split(',')
        .map(day_of_week_item)
        .collect::<Result<Vec<_>, _>>()
        .map(|items| items.join(","))
}

fn day_number(token: &str) -> Result<Option<usize>, String> {
    match token.parse::<usize>() {
        Ok(day) if day <= 7 => Ok(Some(day)),
        Ok(day) => Err(format!("day of week {} out of range", day)),
        Err(_) => Ok(None),
    }
}

fn day_name(token: &str) -> Result<String, String> {
    Ok(match day_number(token)? {
        Some(day) => DAY_NAMES[day % 7].to_string(),
        None => token.to_string(),
    })
}

fn day_of_week_item(item: &str) -> Result<String, String> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };
    let with_step = |range: String| match step {
        Some(step) => format!("{}/{}", range, step),
        None => range,
    };

    let Some((start, end)) = range.split_once('-') else {
        return Ok(with_step(day_name(range)?));
    };

    Ok(match (day_number(start)?, day_number(end)?) {
        (Some(0), Some(7)) => with_step("Sun-Sat".to_string()),
        (Some(first @ 1..=6), Some(7)) => {
            let through_saturday = with_step(format!("{}-Sat", DAY_NAMES[first]));
            let stride = step.and_then(|step| step.parse::<usize>().ok()).unwrap_or(1).max(1);
            if (7 - first) % stride == 0 {
                format!("{},Sun", through_saturday)
            } else {
                through_saturday
            }
        }
        _ => with_step(format!("{}-{}", day_name(start)?, day_name(end)?)),
    })
}

/// Operator view of one registered job
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub kind: &'static str,
    pub trigger: String,

    /// None while paused
    pub next_run_time: Option<DateTime<Local>>,

    pub paused: bool,
    pub running: bool,
    pub created_at: DateTime<Utc>,
}

struct JobEntry {
    trigger: Trigger,
    func: JobFn,
    paused: bool,
    next_run: Option<DateTime<Local>>,
    created_at: DateTime<Utc>,
    run_lock: Arc<Mutex<()>>,
}

struct Driver {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<String, JobEntry>>>;

/// Named job registry driven by a background clock
pub struct Scheduler {
    jobs: Registry,
    tick: Duration,
    driver: Mutex<Option<Driver>>,
}

impl Scheduler {
    /// Create a stopped scheduler that checks for due jobs every `tick`
    pub fn new(tick: Duration) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            tick: tick.max(Duration::from_millis(1)),
            driver: Mutex::new(None),
        }
    }

    /// Register (or replace) a job firing every `period`
    pub async fn add_interval_job<F, Fut>(&self, id: &str, period: Duration, func: F) -> Result<(), SchedulerError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let trigger = Trigger::interval(period)?;
        self.register(id, trigger, func).await;
        Ok(())
    }

    /// Register (or replace) a job on a five-field cron expression
    pub async fn add_cron_job<F, Fut>(&self, id: &str, expr: &str, func: F) -> Result<(), SchedulerError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let trigger = Trigger::cron(expr)?;
        self.register(id, trigger, func).await;
        Ok(())
    }

    async fn register<F, Fut>(&self, id: &str, trigger: Trigger, func: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let func: JobFn = Arc::new(move |token| func(token).boxed());
        let entry = JobEntry {
            next_run: trigger.next_after(Local::now()),
            trigger,
            func,
            paused: false,
            created_at: Utc::now(),
            run_lock: Arc::new(Mutex::new(())),
        };

        let description = entry.trigger.describe();
        let replaced = self.jobs.lock().await.insert(id.to_string(), entry).is_some();

        if replaced {
            info!(job = id, trigger = %description, "Replaced job");
        } else {
            info!(job = id, trigger = %description, "Added job");
        }
    }

    /// Unregister a job; false for unknown ids
    pub async fn remove_job(&self, id: &str) -> bool {
        if self.jobs.lock().await.remove(id).is_some() {
            info!(job = id, "Removed job");
            true
        } else {
            warn!(job = id, "Cannot remove unknown job");
            false
        }
    }

    pub async fn pause_job(&self, id: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(id) {
            Some(entry) => {
                entry.paused = true;
                entry.next_run = None;
                info!(job = id, "Paused job");
                true
            }
            None => {
                warn!(job = id, "Cannot pause unknown job");
                false
            }
        }
    }

    pub async fn resume_job(&self, id: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(id) {
            Some(entry) => {
                if entry.paused {
                    entry.paused = false;
                    entry.next_run = entry.trigger.next_after(Local::now());
                }
                info!(job = id, "Resumed job");
                true
            }
            None => {
                warn!(job = id, "Cannot resume unknown job");
                false
            }
        }
    }

    /// Run a job now and wait for it, leaving its schedule untouched.
    ///
    /// Waits for an in-flight run of the same job to finish first. Returns
    /// false for unknown ids.
    pub async fn run_once(&self, id: &str) -> Result<bool, SchedulerError> {
        let (func, run_lock) = {
            let jobs = self.jobs.lock().await;
            match jobs.get(id) {
                Some(entry) => (entry.func.clone(), entry.run_lock.clone()),
                None => {
                    warn!(job = id, "Cannot run unknown job");
                    return Ok(false);
                }
            }
        };

        let _guard = run_lock.lock_owned().await;
        execute(id, &func, CancellationToken::new())
            .await
            .map_err(|e| SchedulerError::JobFailed { id: id.to_string(), message: format!("{:#}", e) })?;

        Ok(true)
    }

    /// Registered jobs ordered by id
    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        let jobs = self.jobs.lock().await;
        let mut infos: Vec<JobInfo> = jobs.iter()
            .map(|(id, entry)| JobInfo {
                id: id.clone(),
                kind: entry.trigger.kind(),
                trigger: entry.trigger.describe(),
                next_run_time: entry.next_run,
                paused: entry.paused,
                running: entry.run_lock.try_lock().is_err(),
                created_at: entry.created_at,
            })
            .collect();

        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Start the background clock
    pub async fn start(&self) {
        let mut driver = self.driver.lock().await;
        if driver.is_some() {
            warn!("Scheduler already started");
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(drive(self.jobs.clone(), self.tick, cancel.clone()));
        *driver = Some(Driver { cancel, handle });

        info!(tick_ms = self.tick.as_millis() as u64, "Scheduler started");
    }

    /// Stop the clock, cancel running jobs and wait for them to finish
    pub async fn stop(&self) {
        let Some(driver) = self.driver.lock().await.take() else {
            warn!("Scheduler already stopped");
            return;
        };

        driver.cancel.cancel();
        if let Err(e) = driver.handle.await {
            error!("Scheduler driver ended abnormally: {}", e);
        }

        info!("Scheduler stopped");
    }
}

/// Background clock: fire due jobs every tick until cancelled
async fn drive(jobs: Registry, tick: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    error!("Job execution aborted: {}", e);
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        let now = Local::now();
        let due: Vec<(String, JobFn, Arc<Mutex<()>>)> = {
            let mut jobs = jobs.lock().await;
            jobs.iter_mut()
                .filter(|(_, entry)| !entry.paused && entry.next_run.is_some_and(|next| next <= now))
                .map(|(id, entry)| {
                    entry.next_run = entry.trigger.next_after(now);
                    (id.clone(), entry.func.clone(), entry.run_lock.clone())
                })
                .collect()
        };

        for (id, func, run_lock) in due {
            match run_lock.try_lock_owned() {
                Ok(guard) => {
                    let token = cancel.child_token();
                    running.spawn(async move {
                        let _guard = guard;
                        if let Err(e) = execute(&id, &func, token).await {
                            error!(job = %id, "Job failed: {:#}", e);
                        }
                    });
                }
                Err(_) => warn!(job = %id, "Previous run still in progress, skipping trigger"),
            }
        }
    }

    debug!(in_flight = running.len(), "Waiting for running jobs");
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            error!("Job execution aborted: {}", e);
        }
    }
}

async fn execute(id: &str, func: &JobFn, token: CancellationToken) -> anyhow::Result<()> {
    info!(job = id, "Job started");
    let started = Instant::now();

    let result = func(token).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(()) => info!(job = id, elapsed_ms, "Job finished"),
        Err(_) => warn!(job = id, elapsed_ms, "Job finished with error"),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike, Weekday};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn counting_job(counter: Arc<AtomicUsize>) -> impl Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync {
        move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }
    }

    #[test]
    fn test_cron_requires_five_fields() {
        assert_ok!(Trigger::cron("0 9 * * *"));
        assert_err!(Trigger::cron("0 9 * *"));
        assert_err!(Trigger::cron("0 0 9 * * *"));
        assert_err!(Trigger::cron("61 9 * * *"));
        assert_err!(Trigger::cron("0 9 * * 8"));
        assert_err!(Trigger::cron("0 9 * * 1-8"));
    }

    #[test]
    fn test_day_of_week_ranges_ending_on_seven() {
        assert_ok!(Trigger::cron("0 2 * * 1-7"));
        assert_ok!(Trigger::cron("0 2 * * 5-7"));
        assert_ok!(Trigger::cron("0 2 * * 0-7"));

        assert_eq!(day_of_week_names("1-7").unwrap(), "Mon-Sat,Sun");
        assert_eq!(day_of_week_names("5-7").unwrap(), "Fri-Sat,Sun");
        assert_eq!(day_of_week_names("0-7").unwrap(), "Sun-Sat");
        assert_eq!(day_of_week_names("1-7/2").unwrap(), "Mon-Sat/2,Sun");
        assert_eq!(day_of_week_names("2-7/2").unwrap(), "Tue-Sat/2");
        assert_eq!(day_of_week_names("6,7").unwrap(), "Sat,Sun");
        assert_eq!(day_of_week_names("0-6").unwrap(), "Sun-Sat");
    }

    #[test]
    fn test_range_through_sunday_fires_on_weekend() {
        let trigger = Trigger::cron("0 12 * * 5-7").unwrap();
        let mut at = Local::now();
        let mut seen = Vec::new();
        for _ in 0..3 {
            at = trigger.next_after(at).unwrap();
            seen.push(at.weekday());
        }

        seen.sort_by_key(|day| day.num_days_from_monday());
        assert_eq!(seen, [Weekday::Fri, Weekday::Sat, Weekday::Sun]);
    }

    #[test]
    fn test_cron_next_run_times() {
        let now = Local::now();

        let daily = Trigger::cron("0 9 * * *").unwrap();
        let next = daily.next_after(now).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (9, 0, 0));
        assert!(next > now);

        for expr in ["0 2 * * 0", "0 2 * * 7", "0 2 * * Sun"] {
            let weekly = Trigger::cron(expr).unwrap();
            let next = weekly.next_after(now).unwrap();
            assert_eq!(next.weekday(), Weekday::Sun, "{}", expr);
            assert_eq!(next.hour(), 2);
        }

        let weekdays = Trigger::cron("30 8 * * 1-5").unwrap();
        let next = weekdays.next_after(now).unwrap();
        assert!(!matches!(next.weekday(), Weekday::Sat | Weekday::Sun));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        assert_eq!(Trigger::interval(Duration::ZERO).unwrap_err(), SchedulerError::InvalidInterval);
    }

    #[tokio::test]
    async fn test_invalid_cron_registers_nothing() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        let counter = Arc::new(AtomicUsize::new(0));

        let result = scheduler.add_cron_job("bad", "* * *", counting_job(counter)).await;
        assert!(matches!(result, Err(SchedulerError::InvalidCron { .. })));
        assert!(scheduler.list_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_same_id_replaces_job() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        let counter = Arc::new(AtomicUsize::new(0));

        assert_ok!(scheduler.add_interval_job("job", Duration::from_secs(60), counting_job(counter.clone())).await);
        assert_ok!(scheduler.add_cron_job("job", "0 9 * * *", counting_job(counter)).await);

        let jobs = scheduler.list_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, "cron");
        assert_eq!(jobs[0].trigger, "0 9 * * *");
    }

    #[tokio::test]
    async fn test_unknown_ids_are_noops() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        assert!(!scheduler.remove_job("ghost").await);
        assert!(!scheduler.pause_job("ghost").await);
        assert!(!scheduler.resume_job("ghost").await);
        assert_eq!(scheduler.run_once("ghost").await, Ok(false));
    }

    #[tokio::test]
    async fn test_interval_job_fires_until_stopped() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.add_interval_job("tick", Duration::from_millis(20), counting_job(counter.clone())).await.unwrap();

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop().await;

        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 2, "fired {} times", fired);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), fired);
    }

    #[tokio::test]
    async fn test_paused_job_does_not_fire() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.add_interval_job("tick", Duration::from_millis(10), counting_job(counter.clone())).await.unwrap();
        assert!(scheduler.pause_job("tick").await);
        assert!(scheduler.list_jobs().await[0].next_run_time.is_none());

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert!(scheduler.resume_job("tick").await);
        assert!(scheduler.list_jobs().await[0].next_run_time.is_some());
        tokio::time::sleep(Duration::from_millis(80)).await;
        scheduler.stop().await;

        assert!(counter.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_runs_of_one_job_never_overlap() {
        let scheduler = Scheduler::new(Duration::from_millis(2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let (a, p, r) = (active.clone(), peak.clone(), runs.clone());
        scheduler.add_interval_job("slow", Duration::from_millis(5), move |_| {
            let (active, peak, runs) = (a.clone(), p.clone(), r.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        }).await.unwrap();

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(scheduler.run_once("slow").await, Ok(true));
        scheduler.stop().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_failing_job_keeps_clock_running() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = attempts.clone();
        scheduler.add_interval_job("flaky", Duration::from_millis(15), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("upstream unavailable"))
            }
        }).await.unwrap();

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.stop().await;
        assert!(attempts.load(Ordering::SeqCst) >= 2);

        match scheduler.run_once("flaky").await {
            Err(SchedulerError::JobFailed { id, message }) => {
                assert_eq!(id, "flaky");
                assert!(message.contains("upstream unavailable"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        scheduler.stop().await;
        assert!(!scheduler.driver.lock().await.is_some());

        scheduler.start().await;
        scheduler.start().await;
        assert!(scheduler.driver.lock().await.is_some());

        scheduler.stop().await;
        scheduler.stop().await;
        assert!(!scheduler.driver.lock().await.is_some());
    }

    #[tokio::test]
    async fn test_stop_cancels_running_job() {
        let scheduler = Scheduler::new(Duration::from_millis(2));
        let cancelled = Arc::new(AtomicUsize::new(0));

        let flag = cancelled.clone();
        scheduler.add_interval_job("long", Duration::from_millis(5), move |token: CancellationToken| {
            let flag = flag.clone();
            async move {
                tokio::select! {
                    _ = token.cancelled() => { flag.fetch_add(1, Ordering::SeqCst); }
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                }
                Ok::<_, anyhow::Error>(())
            }
        }).await.unwrap();

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(5), scheduler.stop()).await.unwrap();

        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }
}
