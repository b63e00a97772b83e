//! Cadence-driven health checks with escalation to repair.
//!
//! One coarse interval drives [`Scheduler::check_scheduled_tasks`]. Whether a task is due is
//! decided from an explicit next-fire time computed from the configured hour and weekday and
//! the last time the task fired, so a second tick inside the same matching hour is a no-op.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use graph_integrity_core::{
    HealthCheckResult, HealthStatus, IntegrityError, IntegrityIssue, RepairSession,
    ScheduleConfig, ScheduleConfigPatch, ScheduledTask, TaskResult, TaskStatus, TaskType,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use time::{OffsetDateTime, Time, UtcOffset};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::monitor::HealthMonitor;
use crate::repair::RepairEngine;
use crate::report::{ReportKind, ReportSink, RunReport};

/// Source of the wall-clock time used to match schedule hours and weekdays.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Current time in a fixed offset, resolved once at construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    /// Uses the host's local offset, or UTC when it cannot be determined.
    ///
    /// Resolving the local offset can fail once other threads exist, so build this before
    /// starting a multi-threaded runtime.
    #[must_use]
    pub fn local() -> Self {
        Self { offset: UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC) }
    }

    #[must_use]
    pub fn with_offset(offset: UtcOffset) -> Self {
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    #[must_use]
    pub fn new(now: OffsetDateTime) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: time::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

/// Start of the earliest matching one-hour window that has not fired yet and has not ended.
///
/// `weekday` counts from Sunday = 0; `None` matches every day. Returns `None` only for an
/// out-of-range hour.
#[must_use]
pub fn next_fire_time(
    now: OffsetDateTime,
    hour: u8,
    weekday: Option<u8>,
    last_fired: Option<OffsetDateTime>,
) -> Option<OffsetDateTime> {
    let slot = Time::from_hms(hour, 0, 0).ok()?;
    let today = now.replace_time(slot);
    (0..=7)
        .map(|days| today + time::Duration::days(days))
        .filter(|candidate| {
            weekday.is_none() || weekday == Some(candidate.weekday().number_days_from_sunday())
        })
        .filter(|candidate| *candidate + time::Duration::HOUR > now)
        .find(|candidate| !last_fired.is_some_and(|fired| fired >= *candidate))
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct NextFireTimes {
    #[serde(with = "time::serde::rfc3339::option")]
    pub nightly: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub weekly: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SchedulerStatus {
    pub started: bool,
    pub tick_in_progress: bool,
    pub config: ScheduleConfig,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_nightly_run: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_weekly_run: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_nightly_run: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_weekly_run: Option<OffsetDateTime>,
    pub task_count: usize,
    pub last_task: Option<ScheduledTask>,
}

#[derive(Debug, Default, Clone, Copy)]
struct LastFired {
    nightly: Option<OffsetDateTime>,
    weekly: Option<OffsetDateTime>,
}

struct Inner {
    monitor: Arc<HealthMonitor>,
    engine: Arc<RepairEngine>,
    reporter: Arc<dyn ReportSink>,
    clock: Arc<dyn Clock>,
    config: RwLock<ScheduleConfig>,
    tick_interval: Duration,
    max_task_history: usize,
    tasks: Mutex<VecDeque<ScheduledTask>>,
    last_fired: Mutex<LastFired>,
    tick_in_progress: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tick_loop: Mutex<Option<JoinHandle<()>>>,
    /// Ticks spawned by the loop that have not finished yet.
    in_flight: AtomicUsize,
    idle: Notify,
}

struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct InFlight<'a>(&'a Inner);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// # Errors
    /// Returns `InvalidConfig` when the schedule hour or weekday is out of range.
    pub fn new(
        monitor: Arc<HealthMonitor>,
        engine: Arc<RepairEngine>,
        reporter: Arc<dyn ReportSink>,
        clock: Arc<dyn Clock>,
        schedule: ScheduleConfig,
        config: &SchedulerConfig,
    ) -> Result<Self, IntegrityError> {
        schedule.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                monitor,
                engine,
                reporter,
                clock,
                config: RwLock::new(schedule),
                tick_interval: config.tick_interval(),
                max_task_history: config.max_task_history.max(1),
                tasks: Mutex::new(VecDeque::new()),
                last_fired: Mutex::new(LastFired::default()),
                tick_in_progress: AtomicBool::new(false),
                shutdown: Mutex::new(None),
                tick_loop: Mutex::new(None),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        })
    }

    /// Begin ticking; the first tick runs immediately. Calling this twice is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut shutdown = self.inner.shutdown.lock();
        if shutdown.is_some() {
            debug!("scheduler already started");
            return;
        }
        let (tx, rx) = watch::channel(false);
        *shutdown = Some(tx);

        let scheduler = self.clone();
        let handle = tokio::spawn(async move { scheduler.tick_loop(rx).await });
        *self.inner.tick_loop.lock() = Some(handle);
        drop(shutdown);
        info!(tick_interval_secs = self.inner.tick_interval.as_secs(), "scheduler started");
    }

    /// Cancel future ticks. An in-flight tick runs to completion; await
    /// [`Scheduler::wait_idle`] before tearing down the runtime.
    pub fn stop(&self) {
        let Some(tx) = self.inner.shutdown.lock().take() else {
            debug!("scheduler not running");
            return;
        };
        if tx.send(true).is_err() {
            debug!("tick loop had already exited");
        }
        info!("scheduler stopped");
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.shutdown.lock().is_some()
    }

    /// Wait until no tick spawned by the loop is running.
    ///
    /// After [`Scheduler::stop`] this also waits for the loop itself to exit, so no new tick
    /// can begin once it returns.
    pub async fn wait_idle(&self) {
        let tick_loop = if self.is_started() { None } else { self.inner.tick_loop.lock().take() };
        if let Some(handle) = tick_loop {
            if let Err(err) = handle.await {
                warn!(error = %err, "scheduler tick loop ended abnormally");
            }
        }
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    async fn tick_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.inner.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        let _in_flight = InFlight(&scheduler.inner);
                        scheduler.check_scheduled_tasks().await;
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("scheduler tick loop exited");
    }

    /// Run whichever tasks are due at the clock's current time.
    ///
    /// Returns the tasks that ran. A tick that starts while another is still running is
    /// skipped entirely.
    pub async fn check_scheduled_tasks(&self) -> Vec<ScheduledTask> {
        if self.inner.tick_in_progress.swap(true, Ordering::AcqRel) {
            debug!("previous tick still running; skipping");
            return Vec::new();
        }
        let _guard = TickGuard(&self.inner.tick_in_progress);

        let now = self.inner.clock.now();
        let config = self.get_config();
        let mut ran = Vec::new();
        if config.nightly_check_enabled && self.claim(TaskType::Nightly, now, &config) {
            ran.push(self.run_nightly_check().await);
        }
        if config.weekly_deep_analysis_enabled && self.claim(TaskType::Weekly, now, &config) {
            ran.push(self.run_weekly_deep_analysis().await);
        }
        debug!(ran = ran.len(), hour = now.hour(), "scheduler tick complete");
        ran
    }

    /// Health check, escalating to a repair session when the store is not healthy.
    pub async fn run_nightly_check(&self) -> ScheduledTask {
        let task = self.begin(TaskType::Nightly);
        let outcome = self.nightly(&task.id).await;
        self.finish(task, outcome)
    }

    /// Health check plus a full issue census; repairs whenever issues exist.
    pub async fn run_weekly_deep_analysis(&self) -> ScheduledTask {
        let task = self.begin(TaskType::Weekly);
        let outcome = self.weekly(&task.id).await;
        self.finish(task, outcome)
    }

    /// Health check only; never repairs or reports.
    pub async fn run_manual_check(&self) -> ScheduledTask {
        let task = self.begin(TaskType::Manual);
        let health = self.inner.monitor.run_health_checks().await;
        self.finish(task, Ok(TaskResult::Health { health }))
    }

    /// Merge a partial update; nothing changes when the merged result is invalid.
    ///
    /// # Errors
    /// Returns `InvalidConfig` when an hour or weekday is out of range.
    pub fn update_config(
        &self,
        patch: &ScheduleConfigPatch,
    ) -> Result<ScheduleConfig, IntegrityError> {
        let mut config = self.inner.config.write();
        let merged = config.merged(patch)?;
        *config = merged.clone();
        info!(?merged, "schedule config updated");
        Ok(merged)
    }

    #[must_use]
    pub fn get_config(&self) -> ScheduleConfig {
        self.inner.config.read().clone()
    }

    /// Task history, newest first.
    #[must_use]
    pub fn get_scheduled_tasks(&self) -> Vec<ScheduledTask> {
        self.inner.tasks.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn get_task(&self, task_id: &str) -> Option<ScheduledTask> {
        self.inner.tasks.lock().iter().find(|task| task.id == task_id).cloned()
    }

    #[must_use]
    pub fn next_fire_times(&self, now: OffsetDateTime) -> NextFireTimes {
        let config = self.get_config();
        let last_fired = *self.inner.last_fired.lock();
        NextFireTimes {
            nightly: config
                .nightly_check_enabled
                .then(|| next_fire_time(now, config.nightly_check_hour, None, last_fired.nightly))
                .flatten(),
            weekly: config
                .weekly_deep_analysis_enabled
                .then(|| {
                    next_fire_time(
                        now,
                        config.nightly_check_hour,
                        Some(config.weekly_deep_analysis_day),
                        last_fired.weekly,
                    )
                })
                .flatten(),
        }
    }

    #[must_use]
    pub fn get_status(&self) -> SchedulerStatus {
        let next = self.next_fire_times(self.inner.clock.now());
        let last_fired = *self.inner.last_fired.lock();
        let (task_count, last_task) = {
            let tasks = self.inner.tasks.lock();
            (tasks.len(), tasks.front().cloned())
        };
        SchedulerStatus {
            started: self.is_started(),
            tick_in_progress: self.inner.tick_in_progress.load(Ordering::Acquire),
            config: self.get_config(),
            last_nightly_run: last_fired.nightly,
            last_weekly_run: last_fired.weekly,
            next_nightly_run: next.nightly,
            next_weekly_run: next.weekly,
            task_count,
            last_task,
        }
    }

    fn claim(&self, task_type: TaskType, now: OffsetDateTime, config: &ScheduleConfig) -> bool {
        let mut last_fired = self.inner.last_fired.lock();
        let (weekday, slot) = match task_type {
            TaskType::Nightly => (None, &mut last_fired.nightly),
            TaskType::Weekly => (Some(config.weekly_deep_analysis_day), &mut last_fired.weekly),
            TaskType::Manual => return false,
        };
        match next_fire_time(now, config.nightly_check_hour, weekday, *slot) {
            Some(due) if due <= now => {
                *slot = Some(now);
                true
            }
            _ => false,
        }
    }

    fn begin(&self, task_type: TaskType) -> ScheduledTask {
        let now = self.inner.clock.now();
        let mut task = ScheduledTask::pending(task_type, now);
        task.status = TaskStatus::Running;
        task.executed_time = Some(now);

        let mut tasks = self.inner.tasks.lock();
        tasks.push_front(task.clone());
        tasks.truncate(self.inner.max_task_history);
        drop(tasks);

        info!(task_id = %task.id, task_type = ?task_type, "scheduled task started");
        task
    }

    fn finish(
        &self,
        mut task: ScheduledTask,
        outcome: Result<TaskResult, IntegrityError>,
    ) -> ScheduledTask {
        match outcome {
            Ok(result) => {
                task.status = TaskStatus::Completed;
                task.result = Some(result);
                info!(task_id = %task.id, task_type = ?task.task_type, "scheduled task completed");
            }
            Err(err) => {
                task.status = TaskStatus::Failed;
                task.error = Some(err.to_string());
                error!(
                    task_id = %task.id,
                    task_type = ?task.task_type,
                    error = %err,
                    "scheduled task failed"
                );
            }
        }

        let mut tasks = self.inner.tasks.lock();
        if let Some(entry) = tasks.iter_mut().find(|entry| entry.id == task.id) {
            *entry = task.clone();
        }
        task
    }

    async fn nightly(&self, task_id: &str) -> Result<TaskResult, IntegrityError> {
        let config = self.get_config();
        let health = self.inner.monitor.run_health_checks().await;

        let mut session = None;
        let mut failure = None;
        if health.status != HealthStatus::Healthy && config.auto_repair_enabled {
            info!(task_id, status = %health.status, "escalating to repair");
            match self.repair(config.auto_repair_dry_run_only).await {
                Ok(repaired) => session = Some(repaired),
                Err(err) => failure = Some(err),
            }
        }

        if config.reporting_enabled {
            let report = RunReport::new(ReportKind::Nightly, health.clone())
                .with_repair_session(session.clone())
                .with_error(failure.as_ref().map(ToString::to_string));
            self.report(report).await;
        }

        if let Some(err) = failure {
            return Err(err);
        }
        Ok(match session {
            Some(session) => TaskResult::Repair { session },
            None => TaskResult::Health { health },
        })
    }

    async fn weekly(&self, task_id: &str) -> Result<TaskResult, IntegrityError> {
        let config = self.get_config();
        let health = self.inner.monitor.run_health_checks().await;

        let mut failure = None;
        let issues = match self.scan().await {
            Ok(issues) => Some(issues),
            Err(err) => {
                failure = Some(err);
                None
            }
        };

        let mut session = None;
        let found = issues.as_ref().map_or(0, Vec::len);
        if config.auto_repair_enabled && found > 0 {
            info!(task_id, issues = found, "issues found; starting repair");
            match self.repair(config.auto_repair_dry_run_only).await {
                Ok(repaired) => session = Some(repaired),
                Err(err) => failure = Some(err),
            }
        }

        if config.reporting_enabled {
            let report = RunReport::new(ReportKind::Weekly, health.clone())
                .with_issues(issues.clone())
                .with_repair_session(session.clone())
                .with_error(failure.as_ref().map(ToString::to_string));
            self.report(report).await;
        }

        if let Some(err) = failure {
            return Err(err);
        }
        Ok(TaskResult::DeepAnalysis {
            health,
            issues: issues.unwrap_or_default(),
            repair_session: session,
        })
    }

    async fn scan(&self) -> Result<Vec<IntegrityIssue>, IntegrityError> {
        let monitor = Arc::clone(&self.inner.monitor);
        tokio::task::spawn_blocking(move || monitor.find_integrity_issues())
            .await
            .map_err(|err| IntegrityError::Task(format!("integrity scan task failed: {err}")))?
    }

    async fn repair(&self, dry_run: bool) -> Result<RepairSession, IntegrityError> {
        let engine = Arc::clone(&self.inner.engine);
        tokio::task::spawn_blocking(move || engine.start_repair_session(dry_run))
            .await
            .map_err(|err| IntegrityError::Task(format!("repair task failed: {err}")))?
    }

    async fn report(&self, report: RunReport) {
        let reporter = Arc::clone(&self.inner.reporter);
        let kind = report.kind;
        let recorded = tokio::task::spawn_blocking(move || reporter.create_report(&report)).await;
        if let Err(err) = recorded {
            warn!(kind = kind.as_str(), error = %err, "report sink panicked");
        }
    }
}

/// Health result carried by a finished task, if any.
#[must_use]
pub fn task_health(task: &ScheduledTask) -> Option<&HealthCheckResult> {
    match task.result.as_ref()? {
        TaskResult::Health { health } | TaskResult::DeepAnalysis { health, .. } => Some(health),
        TaskResult::Repair { .. } => None,
    }
}
