//! Overdue detection
//!
//! Devices with a known reporting period are flagged overdue when nothing
//! has been heard from them for longer than that period.

use super::DeviceRegistry;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Reporting periods (minutes) of models that send periodic heartbeats
const BUILTIN_INTERVALS: &[(&str, u64)] = &[
    ("lumi.sensor_ht", 60),
    ("lumi.weather", 60),
    ("lumi.sensor_magnet", 60),
    ("lumi.sensor_magnet.aq2", 60),
    ("lumi.sensor_motion", 60),
    ("lumi.sensor_motion.aq2", 60),
    ("lumi.sensor_switch", 60),
    ("lumi.sensor_switch.aq2", 60),
    ("lumi.sensor_wleak.aqua1", 60),
    ("lumi.sensor_cube", 60),
    ("lumi.sensor_86sw1", 60),
    ("lumi.sensor_86sw2", 60),
    ("lumi.vibration.aq1", 60),
    ("lumi.plug", 60),
    ("lumi.ctrl_neutral1", 60),
    ("lumi.ctrl_neutral2", 60),
];

/// Staleness threshold per model id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverdueIntervals {
    minutes: HashMap<String, u64>,
}

impl OverdueIntervals {
    /// No model is ever considered overdue
    pub fn empty() -> Self {
        Self {
            minutes: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        Self {
            minutes: BUILTIN_INTERVALS
                .iter()
                .map(|(model, minutes)| (model.to_string(), *minutes))
                .collect(),
        }
    }

    /// Built-in table with configured entries layered on top
    pub fn with_overrides(overrides: &HashMap<String, u64>) -> Self {
        let mut intervals = Self::builtin();
        for (model, minutes) in overrides {
            intervals.set(model, *minutes);
        }
        intervals
    }

    pub fn set(&mut self, model_id: &str, minutes: u64) {
        self.minutes.insert(model_id.to_string(), minutes);
    }

    pub fn threshold(&self, model_id: &str) -> Option<Duration> {
        self.minutes
            .get(model_id)
            .map(|minutes| Duration::from_secs(minutes.saturating_mul(60)))
    }
}

impl Default for OverdueIntervals {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Periodic overdue check over a registry
pub struct OverdueMonitor;

impl OverdueMonitor {
    /// Run `check_overdue` every `period`, first one period from now
    pub fn start(registry: DeviceRegistry, period: Duration) -> OverdueMonitorHandle {
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if registry.check_overdue(None).await {
                    info!("devices became overdue");
                } else {
                    debug!("overdue check: no change");
                }
            }
        });

        OverdueMonitorHandle { task }
    }
}

/// Stops the periodic check when told to or when dropped
pub struct OverdueMonitorHandle {
    task: JoinHandle<()>,
}

impl OverdueMonitorHandle {
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for OverdueMonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
