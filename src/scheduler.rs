//! Job scheduler.
//!
//! Runs ingestion, optimize or any other [`JobHandler`] on one of four
//! schedule kinds:
//!
//! | Kind | Syntax |
//! |------|--------|
//! | cron | `@yearly` `@annually` `@monthly` `@weekly` `@daily` `@midnight` `@hourly`, `* * * * *`, `*/N * * * *`, `0 * * * *`, `0 0 * * *` |
//! | interval | `@every 90s`, or a bare duration such as `5m`, `1h30m`, `250ms` |
//! | once | `once:<RFC 3339>` or a bare RFC 3339 timestamp |
//! | event | `event:<name>`, or `event:*` for every event |
//!
//! Cron schedules are evaluated in UTC.
//!
//! One *invocation* of a job runs the handler and, on failure, retries it
//! up to `max_retries` times, waiting `retry_delay * backoff_factor^(n-1)`
//! after the n-th failed attempt. `run_count` and `error_count` count
//! invocations, not attempts. Each attempt is bounded by the job timeout
//! (30 minutes unless configured).
//!
//! Events go through a bounded queue; when it is full the event is dropped
//! with a warning. A background sweep removes finished one-shot jobs older
//! than the retention period (24 h by default).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::RagError;

const DEFAULT_TICK: Duration = Duration::from_secs(1);

// ─── schedules ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronSpec {
    /// Minutes of the hour divisible by N (`* * * * *` is N = 1).
    EveryMinutes(u32),
    Hourly,
    Daily,
    /// Sunday 00:00.
    Weekly,
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Schedule {
    Cron(CronSpec),
    Interval(Duration),
    Once(DateTime<Utc>),
    Event(String),
}

impl Schedule {
    /// First run time for a job added at `now`.
    fn first_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once(at) => Some(*at),
            other => other.next_after(now),
        }
    }

    /// Next run strictly after `after`. `None` for one-shot and event
    /// schedules.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval(d) => chrono::Duration::from_std(*d).ok().map(|d| after + d),
            Schedule::Once(_) | Schedule::Event(_) => None,
            Schedule::Cron(spec) => next_cron(*spec, after),
        }
    }

    pub fn is_event(&self) -> bool {
        matches!(self, Schedule::Event(_))
    }

    fn matches_event(&self, name: &str) -> bool {
        matches!(self, Schedule::Event(n) if n == "*" || n == name)
    }
}

fn at_timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

fn midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

fn next_cron(spec: CronSpec, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let ts = after.timestamp();
    match spec {
        CronSpec::EveryMinutes(n) => {
            let n = i64::from(n.clamp(1, 59));
            let mut minute = ts.div_euclid(60) + 1;
            while minute.rem_euclid(60) % n != 0 {
                minute += 1;
            }
            at_timestamp(minute * 60)
        }
        CronSpec::Hourly => at_timestamp((ts.div_euclid(3600) + 1) * 3600),
        CronSpec::Daily => at_timestamp((ts.div_euclid(86_400) + 1) * 86_400),
        CronSpec::Weekly => {
            let mut date = after.date_naive().succ_opt()?;
            while date.weekday() != Weekday::Sun {
                date = date.succ_opt()?;
            }
            midnight(date)
        }
        CronSpec::Monthly => {
            let (y, m) = (after.year(), after.month());
            let first = if m == 12 {
                NaiveDate::from_ymd_opt(y + 1, 1, 1)
            } else {
                NaiveDate::from_ymd_opt(y, m + 1, 1)
            };
            midnight(first?)
        }
        CronSpec::Yearly => midnight(NaiveDate::from_ymd_opt(after.year() + 1, 1, 1)?),
    }
}

/// `90s`, `5m`, `1h30m`, `250ms`, `2d`.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    let invalid = || RagError::validation(format!("invalid duration '{}'", text));
    if text.is_empty() {
        return Err(invalid());
    }
    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];
        let unit_len = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()).len();
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        total += match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            "d" => Duration::from_secs(value * 86_400),
            _ => return Err(invalid()),
        };
    }
    if total.is_zero() {
        return Err(invalid());
    }
    Ok(total)
}

impl FromStr for Schedule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let cron = match s {
            "@yearly" | "@annually" => Some(CronSpec::Yearly),
            "@monthly" => Some(CronSpec::Monthly),
            "@weekly" => Some(CronSpec::Weekly),
            "@daily" | "@midnight" | "0 0 * * *" => Some(CronSpec::Daily),
            "@hourly" | "0 * * * *" => Some(CronSpec::Hourly),
            "* * * * *" => Some(CronSpec::EveryMinutes(1)),
            _ => None,
        };
        if let Some(spec) = cron {
            return Ok(Schedule::Cron(spec));
        }
        if let Some(rest) = s.strip_suffix(" * * * *").and_then(|m| m.strip_prefix("*/")) {
            return match rest.parse::<u32>() {
                Ok(n) if (1..60).contains(&n) => Ok(Schedule::Cron(CronSpec::EveryMinutes(n))),
                _ => Err(RagError::validation(format!("unsupported cron expression '{}'", s))),
            };
        }
        if let Some(d) = s.strip_prefix("@every ") {
            return Ok(Schedule::Interval(parse_duration(d)?));
        }
        if let Some(name) = s.strip_prefix("event:") {
            let name = name.trim();
            if name.is_empty() {
                return Err(RagError::validation("event schedule needs an event name"));
            }
            return Ok(Schedule::Event(name.to_string()));
        }
        let stamp = s.strip_prefix("once:").unwrap_or(s).trim();
        if let Ok(at) = DateTime::parse_from_rfc3339(stamp) {
            return Ok(Schedule::Once(at.with_timezone(&Utc)));
        }
        parse_duration(s)
            .map(Schedule::Interval)
            .map_err(|_| RagError::validation(format!("unrecognized schedule '{}'", s)))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Cron(CronSpec::EveryMinutes(1)) => f.write_str("* * * * *"),
            Schedule::Cron(CronSpec::EveryMinutes(n)) => write!(f, "*/{} * * * *", n),
            Schedule::Cron(CronSpec::Hourly) => f.write_str("@hourly"),
            Schedule::Cron(CronSpec::Daily) => f.write_str("@daily"),
            Schedule::Cron(CronSpec::Weekly) => f.write_str("@weekly"),
            Schedule::Cron(CronSpec::Monthly) => f.write_str("@monthly"),
            Schedule::Cron(CronSpec::Yearly) => f.write_str("@yearly"),
            Schedule::Interval(d) => write!(f, "@every {}ms", d.as_millis()),
            Schedule::Once(at) => write!(f, "once:{}", at.to_rfc3339()),
            Schedule::Event(name) => write!(f, "event:{}", name),
        }
    }
}

// ─── jobs ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Wait after the `attempt`-th failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        self.retry_delay
            .mul_f64(self.backoff_factor.max(0.0).powi(exp))
    }
}

/// What to run and when.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub schedule: Schedule,
    pub retry: RetryPolicy,
    /// Per-attempt timeout; the scheduler default when unset.
    pub timeout: Option<Duration>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            schedule,
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub schedule: Schedule,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    pub status: JobStatus,
    pub run_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            at: Utc::now(),
        }
    }
}

/// Passed to a handler for each attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub job_name: String,
    /// 1-based.
    pub attempt: u32,
    /// The triggering event, for event jobs.
    pub event: Option<Event>,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> BoxFuture<'static, Result<()>> + Send + Sync,
{
    async fn run(&self, ctx: JobContext) -> Result<()> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(move |ctx| -> BoxFuture<'static, Result<()>> {
        Box::pin(f(ctx))
    }))
}

// ─── scheduler ───────────────────────────────────────────────────────────

struct Entry {
    job: Job,
    handler: Arc<dyn JobHandler>,
}

/// A job marked running, ready to execute.
struct Claim {
    id: String,
    name: String,
    handler: Arc<dyn JobHandler>,
    retry: RetryPolicy,
    timeout: Duration,
}

struct Inner {
    config: SchedulerConfig,
    tick: Duration,
    jobs: Mutex<HashMap<String, Entry>>,
    events_tx: mpsc::Sender<Event>,
    events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                tick: DEFAULT_TICK,
                jobs: Mutex::new(HashMap::new()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                shutdown,
                tasks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// How often due jobs are polled. Only effective before `start`.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.tick = tick.max(Duration::from_millis(1));
        }
        self
    }

    pub fn add_job(&self, spec: JobSpec, handler: Arc<dyn JobHandler>) -> Result<String> {
        if spec.name.trim().is_empty() {
            return Err(RagError::validation("job name is empty"));
        }
        let now = Utc::now();
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            name: spec.name,
            next_run: spec.schedule.first_run(now),
            schedule: spec.schedule,
            retry: spec.retry,
            timeout: spec.timeout,
            status: JobStatus::Pending,
            run_count: 0,
            error_count: 0,
            last_error: None,
            created_at: now,
            last_run: None,
            completed_at: None,
        };
        let id = job.id.clone();
        info!(job = %job.name, schedule = %job.schedule, "job added");
        self.inner
            .jobs()
            .insert(id.clone(), Entry { job, handler });
        Ok(id)
    }

    pub fn remove_job(&self, id: &str) -> Result<()> {
        match self.inner.jobs().remove(id) {
            Some(e) => {
                info!(job = %e.job.name, "job removed");
                Ok(())
            }
            None => Err(RagError::not_found(format!("job {}", id))),
        }
    }

    /// Stop scheduling a job without removing it. A running invocation
    /// finishes but does not reschedule.
    pub fn cancel_job(&self, id: &str) -> Result<()> {
        let mut jobs = self.inner.jobs();
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| RagError::not_found(format!("job {}", id)))?;
        entry.job.status = JobStatus::Cancelled;
        entry.job.next_run = None;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.inner.jobs().get(id).map(|e| e.job.clone())
    }

    /// All jobs, oldest first.
    pub fn list_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.inner.jobs().values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Run one invocation of `id` now and wait for it; returns the job
    /// afterwards.
    pub async fn trigger(&self, id: &str) -> Result<Job> {
        let claim = self.inner.claim(id).ok_or_else(|| {
            if self.inner.jobs().contains_key(id) {
                RagError::validation(format!("job {} is already running or cancelled", id))
            } else {
                RagError::not_found(format!("job {}", id))
            }
        })?;
        Inner::execute(&self.inner, claim, None).await;
        self.get_job(id)
            .ok_or_else(|| RagError::not_found(format!("job {}", id)))
    }

    /// Queue an event for event-scheduled jobs. Returns `false` when the
    /// queue is full and the event was dropped.
    pub fn publish(&self, event: Event) -> bool {
        match self.inner.events_tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(event = %event.name, "event queue full; dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(event = %event.name, "event queue closed; dropping event");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Spawn the due-job, event and garbage-collection loops.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(RagError::validation("scheduler is already running"));
        }
        let events = self
            .inner
            .events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| RagError::closed("scheduler event queue"))?;
        self.inner.shutdown.send_replace(false);

        let handles = vec![
            tokio::spawn(Inner::tick_loop(Arc::clone(&self.inner))),
            tokio::spawn(Inner::event_loop(Arc::clone(&self.inner), events)),
            tokio::spawn(Inner::gc_loop(Arc::clone(&self.inner))),
        ];
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);
        info!("scheduler started");
        Ok(())
    }

    /// Stop the loops and wait for them. In-flight invocations are
    /// interrupted at their next retry wait.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for h in handles {
            let _ = h.await;
        }
        info!("scheduler stopped");
    }

    /// Remove finished one-shot jobs completed before `cutoff`.
    pub fn collect_garbage(&self, cutoff: DateTime<Utc>) -> usize {
        self.inner.collect_garbage(cutoff)
    }
}

impl Inner {
    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claim(&self, id: &str) -> Option<Claim> {
        let mut jobs = self.jobs();
        let entry = jobs.get_mut(id)?;
        if matches!(entry.job.status, JobStatus::Running | JobStatus::Cancelled) {
            return None;
        }
        entry.job.status = JobStatus::Running;
        entry.job.last_run = Some(Utc::now());
        Some(Claim {
            id: entry.job.id.clone(),
            name: entry.job.name.clone(),
            handler: Arc::clone(&entry.handler),
            retry: entry.job.retry.clone(),
            timeout: entry
                .job
                .timeout
                .unwrap_or(Duration::from_secs(self.config.job_timeout_secs.max(1))),
        })
    }

    async fn execute(self: &Arc<Self>, claim: Claim, event: Option<Event>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let ctx = JobContext {
                job_id: claim.id.clone(),
                job_name: claim.name.clone(),
                attempt,
                event: event.clone(),
            };
            let result = match tokio::time::timeout(claim.timeout, claim.handler.run(ctx)).await {
                Ok(r) => r,
                Err(_) => Err(anyhow!("timed out after {:?}", claim.timeout)),
            };
            match result {
                Ok(()) => break Ok(()),
                Err(e) if attempt <= claim.retry.max_retries => {
                    let wait = claim.retry.delay(attempt);
                    warn!(job = %claim.name, attempt, error = %e, retry_in_ms = wait.as_millis() as u64, "job attempt failed");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.wait_for(|stop| *stop) => break Err(anyhow!("scheduler stopped during retry: {:#}", e)),
                    }
                }
                Err(e) => break Err(e),
            }
        };

        let now = Utc::now();
        let mut jobs = self.jobs();
        let Some(entry) = jobs.get_mut(&claim.id) else {
            return;
        };
        let job = &mut entry.job;
        job.run_count += 1;
        job.completed_at = Some(now);
        let cancelled = job.status == JobStatus::Cancelled;
        match outcome {
            Ok(()) => {
                debug!(job = %job.name, attempts = attempt, "job completed");
                job.last_error = None;
                if !cancelled {
                    job.status = JobStatus::Completed;
                }
            }
            Err(e) => {
                warn!(job = %job.name, attempts = attempt, error = %e, "job failed");
                job.error_count += 1;
                job.last_error = Some(format!("{:#}", e));
                if !cancelled {
                    job.status = JobStatus::Failed;
                }
            }
        }
        job.next_run = if cancelled {
            None
        } else {
            job.schedule.next_after(now)
        };
    }

    fn due_jobs(&self, now: DateTime<Utc>) -> Vec<String> {
        self.jobs()
            .values()
            .filter(|e| e.job.next_run.is_some_and(|t| t <= now))
            .map(|e| e.job.id.clone())
            .collect()
    }

    async fn tick_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => {
                    for id in self.due_jobs(Utc::now()) {
                        if let Some(claim) = self.claim(&id) {
                            let inner = Arc::clone(&self);
                            tokio::spawn(async move { inner.execute(claim, None).await });
                        }
                    }
                }
            }
        }
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::Receiver<Event>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let event = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                next = events.recv() => match next {
                    Some(e) => e,
                    None => break,
                },
            };
            let ids: Vec<String> = self
                .jobs()
                .values()
                .filter(|e| e.job.schedule.matches_event(&event.name))
                .map(|e| e.job.id.clone())
                .collect();
            debug!(event = %event.name, jobs = ids.len(), "dispatching event");
            for id in ids {
                match self.claim(&id) {
                    Some(claim) => {
                        let inner = Arc::clone(&self);
                        let event = event.clone();
                        tokio::spawn(async move { inner.execute(claim, Some(event)).await });
                    }
                    None => debug!(job = %id, event = %event.name, "job busy; event skipped"),
                }
            }
        }
        // Keep the receiver so a restart can resume with queued events.
        *self.events_rx.lock().unwrap_or_else(|e| e.into_inner()) = Some(events);
    }

    async fn gc_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.gc_interval_secs.max(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => {
                    let retention = chrono::Duration::seconds(self.config.completed_retention_secs as i64);
                    let removed = self.collect_garbage(Utc::now() - retention);
                    if removed > 0 {
                        info!(removed, "collected finished jobs");
                    }
                }
            }
        }
    }

    fn collect_garbage(&self, cutoff: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs();
        let before = jobs.len();
        jobs.retain(|_, e| {
            let finished = e.job.status == JobStatus::Completed && e.job.next_run.is_none();
            !(finished && e.job.completed_at.is_some_and(|t| t < cutoff))
        });
        before - jobs.len()
    }
}
