//! YAML-backed configuration for the healing runtime.
//!
//! Every section is optional; missing keys fall back to the defaults below.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use graph_integrity_core::ScheduleConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealingConfig {
    pub schedule: ScheduleConfig,
    pub monitor: MonitorConfig,
    pub repair: RepairConfig,
    pub scheduler: SchedulerConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
    pub probe_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { probe_timeout_ms: 5_000 }
    }
}

impl MonitorConfig {
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RepairConfig {
    pub max_sessions: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self { max_sessions: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    pub max_task_history: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_interval_secs: 3_600, max_task_history: 100 }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportConfig {
    /// Append-only JSONL file for run reports; reports only go to the log when unset.
    pub path: Option<PathBuf>,
}

impl HealingConfig {
    /// Load and validate a YAML configuration file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error when the YAML is malformed or fails validation.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw).context("failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error naming the first out-of-range setting.
    pub fn validate(&self) -> Result<()> {
        self.schedule.validate()?;
        if self.monitor.probe_timeout_ms == 0 {
            return Err(anyhow!("monitor.probe_timeout_ms must be greater than zero"));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(anyhow!("scheduler.tick_interval_secs must be greater than zero"));
        }
        if self.repair.max_sessions == 0 || self.scheduler.max_task_history == 0 {
            return Err(anyhow!("session and task history limits must be greater than zero"));
        }
        Ok(())
    }
}
