//! Host utilization sampling and bounded-step autoscaling.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use getset::Getters;
use sysinfo::System;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info};

use crate::config::MonitorConfig;

use super::QuotaEngine;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One host utilization measurement.
#[derive(Debug, Clone, Copy, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct UtilizationSample {
    /// When the sample was taken.
    pub(crate) at: DateTime<Utc>,

    /// CPU utilization as a fraction of all cores.
    pub(crate) cpu: f32,

    /// Memory utilization as a fraction of total memory.
    pub(crate) memory: f32,
}

/// A capacity recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    /// Sustained utilization above the high watermark; grow capacity.
    Up,

    /// Sustained utilization below the low watermark; shrink capacity.
    Down,

    /// No sustained breach either way.
    Hold,
}

/// Samples host CPU/memory utilization into a bounded rolling history and
/// recommends capacity changes with hysteresis.
pub struct ResourceMonitor {
    config: MonitorConfig,
    system: Mutex<System>,
    history: Mutex<VecDeque<UtilizationSample>>,
}

/// Applies monitor recommendations to the quota engine's effective capacity
/// in bounded steps, with a cooldown between successive actions.
pub struct Autoscaler {
    engine: Arc<QuotaEngine>,
    monitor: Arc<ResourceMonitor>,
    config: MonitorConfig,
    last_action: Mutex<Option<Instant>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ResourceMonitor {
    /// Creates a monitor with an empty history.
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            system: Mutex::new(System::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Takes one utilization sample from the host.
    ///
    /// CPU utilization is measured against the previous refresh, so the
    /// first sample after startup reads low; the sustain requirement below
    /// absorbs that.
    pub fn sample(&self) -> UtilizationSample {
        let mut system = self.system.lock().expect("monitor system lock poisoned");
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu = system.global_cpu_usage() / 100.0;
        let memory = if system.total_memory() > 0 {
            system.used_memory() as f32 / system.total_memory() as f32
        } else {
            0.0
        };

        UtilizationSample {
            at: Utc::now(),
            cpu,
            memory,
        }
    }

    /// Appends a sample to the rolling history, evicting the oldest beyond
    /// the configured length.
    pub fn record(&self, sample: UtilizationSample) {
        let mut history = self.history();
        history.push_back(sample);
        while history.len() > *self.config.get_history_len() {
            history.pop_front();
        }
    }

    /// Recommends a capacity change based on recent history.
    ///
    /// A recommendation only fires when the configured number of consecutive
    /// samples all breach the same watermark; anything less is `Hold`. That
    /// hysteresis keeps one noisy sample from flapping capacity up and down.
    pub fn recommendation(&self) -> ScaleAction {
        let history = self.history();
        let sustain = *self.config.get_sustain_samples();
        if history.len() < sustain {
            return ScaleAction::Hold;
        }

        let recent: Vec<f32> = history
            .iter()
            .rev()
            .take(sustain)
            .map(|sample| sample.cpu.max(sample.memory))
            .collect();

        if recent
            .iter()
            .all(|peak| *peak > *self.config.get_high_watermark())
        {
            ScaleAction::Up
        } else if recent
            .iter()
            .all(|peak| *peak < *self.config.get_low_watermark())
        {
            ScaleAction::Down
        } else {
            ScaleAction::Hold
        }
    }

    /// How many samples the history currently holds.
    pub fn history_len(&self) -> usize {
        self.history().len()
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<UtilizationSample>> {
        self.history.lock().expect("monitor history lock poisoned")
    }
}

impl Autoscaler {
    /// Creates an autoscaler over the given engine and monitor.
    pub fn new(engine: Arc<QuotaEngine>, monitor: Arc<ResourceMonitor>, config: MonitorConfig) -> Self {
        Self {
            engine,
            monitor,
            config,
            last_action: Mutex::new(None),
        }
    }

    /// Evaluates the current recommendation and, if autoscaling is enabled
    /// and the cooldown has elapsed, applies one bounded capacity step.
    ///
    /// Returns the action applied, if any.
    pub fn tick(&self) -> Option<ScaleAction> {
        if !*self.config.get_autoscale() {
            return None;
        }

        let action = self.monitor.recommendation();
        if action == ScaleAction::Hold {
            return None;
        }

        {
            let last_action = self.last_action.lock().expect("autoscaler lock poisoned");
            if let Some(last) = *last_action {
                if last.elapsed() < self.config.cooldown() {
                    debug!(?action, "autoscaler in cooldown, skipping");
                    return None;
                }
            }
        }

        let usage = self.engine.usage();
        let step_cpus = *self.config.get_scale_step_cpus();
        let step_memory = *self.config.get_scale_step_memory_mib();

        let (target_cpus, target_memory) = match action {
            ScaleAction::Up => (
                usage.get_effective_cpus().saturating_add(step_cpus),
                usage.get_effective_memory_mib().saturating_add(step_memory),
            ),
            ScaleAction::Down => (
                usage.get_effective_cpus().saturating_sub(step_cpus),
                usage.get_effective_memory_mib().saturating_sub(step_memory),
            ),
            ScaleAction::Hold => unreachable!("hold returns above"),
        };

        let (applied_cpus, applied_memory) =
            self.engine.set_effective_capacity(target_cpus, target_memory);

        if applied_cpus == *usage.get_effective_cpus()
            && applied_memory == *usage.get_effective_memory_mib()
        {
            // Already pinned at a clamp boundary; nothing changed, so the
            // cooldown is not consumed.
            return None;
        }

        *self.last_action.lock().expect("autoscaler lock poisoned") = Some(Instant::now());
        info!(
            ?action,
            applied_cpus,
            applied_memory,
            "autoscaler adjusted effective capacity"
        );
        Some(action)
    }

    /// Spawns the background sample-and-apply loop.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.sample_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let sample = self.monitor.sample();
                self.monitor.record(sample);
                self.tick();
            }
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CapacityConfig, Priority, QuotaTier};

    mod fixtures {
        use super::*;

        pub fn monitor_config() -> MonitorConfig {
            MonitorConfig::builder()
                .sustain_samples(3)
                .high_watermark(0.8)
                .low_watermark(0.3)
                .autoscale(true)
                .scale_step_cpus(2)
                .scale_step_memory_mib(1024)
                .cooldown_secs(3600)
                .build()
        }

        pub fn sample(cpu: f32, memory: f32) -> UtilizationSample {
            UtilizationSample {
                at: Utc::now(),
                cpu,
                memory,
            }
        }

        pub fn engine() -> Arc<QuotaEngine> {
            Arc::new(QuotaEngine::new(
                CapacityConfig::builder()
                    .total_cpus(16)
                    .total_memory_mib(16384)
                    .tiers(vec![QuotaTier::builder()
                        .name("default")
                        .max_cpus(16)
                        .max_memory_mib(16384)
                        .build()])
                    .build(),
            ))
        }
    }

    #[test]
    fn test_recommendation_requires_sustained_breach() {
        let monitor = ResourceMonitor::new(fixtures::monitor_config());

        monitor.record(fixtures::sample(0.9, 0.5));
        monitor.record(fixtures::sample(0.9, 0.5));
        assert_eq!(monitor.recommendation(), ScaleAction::Hold);

        monitor.record(fixtures::sample(0.9, 0.5));
        assert_eq!(monitor.recommendation(), ScaleAction::Up);

        // One sample back inside the band resets the streak.
        monitor.record(fixtures::sample(0.5, 0.5));
        assert_eq!(monitor.recommendation(), ScaleAction::Hold);
    }

    #[test]
    fn test_recommendation_uses_peak_of_cpu_and_memory() {
        let monitor = ResourceMonitor::new(fixtures::monitor_config());

        // CPU idle but memory saturated still counts as a breach.
        for _ in 0..3 {
            monitor.record(fixtures::sample(0.1, 0.95));
        }
        assert_eq!(monitor.recommendation(), ScaleAction::Up);
    }

    #[test]
    fn test_scale_down_recommendation() {
        let monitor = ResourceMonitor::new(fixtures::monitor_config());

        for _ in 0..3 {
            monitor.record(fixtures::sample(0.1, 0.1));
        }
        assert_eq!(monitor.recommendation(), ScaleAction::Down);
    }

    #[test]
    fn test_history_is_bounded() {
        let config = MonitorConfig::builder().history_len(5).build();
        let monitor = ResourceMonitor::new(config);

        for _ in 0..20 {
            monitor.record(fixtures::sample(0.5, 0.5));
        }
        assert_eq!(monitor.history_len(), 5);
    }

    #[test]
    fn test_autoscaler_applies_bounded_step_then_cools_down() {
        let engine = fixtures::engine();
        let monitor = Arc::new(ResourceMonitor::new(fixtures::monitor_config()));
        let scaler = Autoscaler::new(
            Arc::clone(&engine),
            Arc::clone(&monitor),
            fixtures::monitor_config(),
        );

        // Pull effective capacity down so an Up step has room to act.
        engine.set_effective_capacity(8, 8192);

        for _ in 0..3 {
            monitor.record(fixtures::sample(0.9, 0.9));
        }

        assert_eq!(scaler.tick(), Some(ScaleAction::Up));
        assert_eq!(*engine.usage().get_effective_cpus(), 10);
        assert_eq!(*engine.usage().get_effective_memory_mib(), 9216);

        // Still breaching, but inside the cooldown window.
        assert_eq!(scaler.tick(), None);
        assert_eq!(*engine.usage().get_effective_cpus(), 10);
    }

    #[test]
    fn test_autoscaler_never_cuts_below_admitted_resources() {
        let engine = fixtures::engine();
        engine
            .allocate("vm-a", "alice", 6, 8192, Priority::Normal)
            .unwrap();

        let monitor = Arc::new(ResourceMonitor::new(fixtures::monitor_config()));
        let scaler = Autoscaler::new(
            Arc::clone(&engine),
            Arc::clone(&monitor),
            fixtures::monitor_config(),
        );

        engine.set_effective_capacity(7, 9216);
        for _ in 0..3 {
            monitor.record(fixtures::sample(0.1, 0.1));
        }

        assert_eq!(scaler.tick(), Some(ScaleAction::Down));
        // 7 - 2 clamps to the 6 cores already admitted.
        assert_eq!(*engine.usage().get_effective_cpus(), 6);
        assert_eq!(*engine.usage().get_effective_memory_mib(), 8192);
    }

    #[test]
    fn test_autoscaler_disabled_does_nothing() {
        let engine = fixtures::engine();
        let monitor = Arc::new(ResourceMonitor::new(fixtures::monitor_config()));
        let config = MonitorConfig::builder().autoscale(false).build();
        let scaler = Autoscaler::new(Arc::clone(&engine), Arc::clone(&monitor), config);

        for _ in 0..10 {
            monitor.record(fixtures::sample(0.99, 0.99));
        }
        assert_eq!(scaler.tick(), None);
    }
}
