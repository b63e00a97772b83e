//! Self-healing integrity checks for the graph store.
//!
//! [`HealthMonitor`] audits, [`RepairEngine`] remediates in reversible sessions, and
//! [`Scheduler`] runs both on a cadence and forwards results to a [`ReportSink`].
//! [`HealingRuntime`] wires the three together for a host process.

pub mod config;
mod graph;
pub mod monitor;
pub mod repair;
pub mod report;
pub mod scheduler;

use std::sync::Arc;

use anyhow::{Context, Result};
use graph_integrity_core::RelationalStore;

pub use config::{HealingConfig, MonitorConfig, RepairConfig, ReportConfig, SchedulerConfig};
pub use monitor::{default_probes, HealthMonitor, HealthProbe, ProbeFn, ProbeVerdict};
pub use repair::{RepairEngine, RepairStats};
pub use report::{JsonlReportSink, ReportKind, ReportSink, RunReport, TracingReportSink};
pub use scheduler::{
    next_fire_time, task_health, Clock, ManualClock, NextFireTimes, Scheduler, SchedulerStatus,
    SystemClock,
};

/// The monitor, repair engine, and scheduler for one store, sharing one configuration.
#[derive(Clone)]
pub struct HealingRuntime {
    pub monitor: Arc<HealthMonitor>,
    pub engine: Arc<RepairEngine>,
    pub scheduler: Scheduler,
}

impl HealingRuntime {
    /// # Errors
    /// Returns an error when the configuration fails validation.
    pub fn new(
        store: Arc<dyn RelationalStore>,
        config: &HealingConfig,
        reporter: Arc<dyn ReportSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let monitor = Arc::new(HealthMonitor::new(store, &config.monitor));
        let engine = Arc::new(RepairEngine::new(Arc::clone(&monitor), &config.repair));
        let scheduler = Scheduler::new(
            Arc::clone(&monitor),
            Arc::clone(&engine),
            reporter,
            clock,
            config.schedule.clone(),
            &config.scheduler,
        )
        .context("failed to build scheduler")?;
        Ok(Self { monitor, engine, scheduler })
    }

    /// The sink configured by `report.path`, or the log when no path is set.
    #[must_use]
    pub fn default_reporter(config: &ReportConfig) -> Arc<dyn ReportSink> {
        match &config.path {
            Some(path) => Arc::new(JsonlReportSink::new(path.clone())),
            None => Arc::new(TracingReportSink),
        }
    }
}
