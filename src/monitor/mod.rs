//! Usage Monitor
//!
//! Periodic decision loop over filesystem usage. One tick walks through
//!
//! ```text
//! Idle ──► Refreshing ──► Evaluating ──┬──► Extending ──┐
//!   ▲          │                       ├──► Warning ────┤
//!   │          │ refresh failed        └────────────────┤
//!   └──────────┴────────────────────────────────────────┘
//! ```
//!
//! Every LV is evaluated at most once per tick, against the inventory taken
//! at the start of that tick. Ticks never overlap: a tick waits for the
//! previous one, including its extensions, to finish.

use crate::audit::{AuditLog, OperationKind, OperationRecord, Origin, Outcome};
use crate::domain::units::format_bytes;
use crate::guard::OperationContext;
use crate::inventory::InventoryService;
use crate::lifecycle::LifecycleOrchestrator;
use crate::metrics::ManagerMetrics;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the usage monitor
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Warn above this filesystem usage (percent)
    pub usage_threshold: u8,
    /// Extend above this filesystem usage (percent)
    pub auto_extend_threshold: u8,
    pub auto_extend_enabled: bool,
    /// Increment per extension
    pub auto_extend_bytes: u64,
    /// Time between ticks
    pub interval: Duration,
    /// Record extensions without executing them
    pub dry_run: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            usage_threshold: 80,
            auto_extend_threshold: 90,
            auto_extend_enabled: false,
            auto_extend_bytes: crate::domain::units::GIB,
            interval: Duration::from_secs(3600),
            dry_run: false,
        }
    }
}

// =============================================================================
// Decisions & Reports
// =============================================================================

/// Monitor state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitorState {
    Idle,
    Refreshing,
    Evaluating,
    Extending,
    Warning,
}

/// What the monitor decided for one LV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decision {
    Extend,
    Warn,
    Healthy,
    /// No mounted filesystem reported usage
    NoData,
}

/// Classify a usage figure; extension wins over warning
pub fn decide(usage_percent: Option<f64>, config: &MonitorConfig) -> Decision {
    match usage_percent {
        None => Decision::NoData,
        Some(usage) if config.auto_extend_enabled && usage > config.auto_extend_threshold as f64 => {
            Decision::Extend
        }
        Some(usage) if usage > config.usage_threshold as f64 => Decision::Warn,
        Some(_) => Decision::Healthy,
    }
}

/// Evaluation of a single LV within a tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LvEvaluation {
    pub lv: String,
    pub usage_percent: Option<f64>,
    pub decision: Decision,
    /// Outcome of the resulting operation, if one was attempted
    pub outcome: Option<Outcome>,
    pub error: Option<String>,
}

/// Summary of one monitor tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when the inventory could not be refreshed
    pub inventory_error: Option<String>,
    pub evaluations: Vec<LvEvaluation>,
}

impl TickReport {
    fn with_decision(&self, decision: Decision) -> Vec<&LvEvaluation> {
        self.evaluations
            .iter()
            .filter(|e| e.decision == decision)
            .collect()
    }

    pub fn extended(&self) -> Vec<&LvEvaluation> {
        self.with_decision(Decision::Extend)
    }

    pub fn warned(&self) -> Vec<&LvEvaluation> {
        self.with_decision(Decision::Warn)
    }
}

// =============================================================================
// Usage Monitor
// =============================================================================

/// Periodic filesystem usage evaluator
pub struct UsageMonitor {
    config: MonitorConfig,
    inventory: InventoryService,
    lifecycle: Arc<LifecycleOrchestrator>,
    audit: Arc<AuditLog>,
    metrics: Option<ManagerMetrics>,
    state: RwLock<MonitorState>,
    /// Held for the whole tick
    tick_lock: Mutex<()>,
    last_report: RwLock<Option<TickReport>>,
    /// LVs with a published usage gauge
    gauged: parking_lot::Mutex<HashSet<String>>,
}

impl UsageMonitor {
    pub fn new(
        config: MonitorConfig,
        inventory: InventoryService,
        lifecycle: Arc<LifecycleOrchestrator>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            config,
            inventory,
            lifecycle,
            audit,
            metrics: None,
            state: RwLock::new(MonitorState::Idle),
            tick_lock: Mutex::new(()),
            last_report: RwLock::new(None),
            gauged: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: ManagerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn state(&self) -> MonitorState {
        *self.state.read()
    }

    pub fn last_report(&self) -> Option<TickReport> {
        self.last_report.read().clone()
    }

    fn set_state(&self, state: MonitorState) {
        *self.state.write() = state;
    }

    /// Run one evaluation cycle
    #[instrument(skip(self))]
    pub async fn tick(&self) -> TickReport {
        let _tick = self.tick_lock.lock().await;
        let started_at = Utc::now();
        if let Some(metrics) = &self.metrics {
            metrics.monitor_ticks_total.inc();
        }

        self.set_state(MonitorState::Refreshing);
        let inventory = match self.inventory.refresh().await {
            Ok(inventory) => inventory,
            Err(e) => {
                error!("Monitor tick skipped, inventory unavailable: {}", e);
                if let Some(metrics) = &self.metrics {
                    metrics.monitor_tick_failures_total.inc();
                }
                self.set_state(MonitorState::Idle);
                return self.finish(TickReport {
                    started_at,
                    finished_at: Utc::now(),
                    inventory_error: Some(e.to_string()),
                    evaluations: Vec::new(),
                });
            }
        };

        self.set_state(MonitorState::Evaluating);
        let mut evaluated = HashSet::new();
        let mut gauged = HashSet::new();
        let mut evaluations = Vec::new();

        for lv in inventory.volumes() {
            let path = lv.path();
            if !evaluated.insert(path.clone()) {
                continue;
            }

            let usage = lv.usage_percent();
            if let (Some(metrics), Some(usage)) = (&self.metrics, usage) {
                metrics
                    .lv_usage_percent
                    .with_label_values(&[path.as_str()])
                    .set(usage);
                gauged.insert(path.clone());
            }

            let decision = decide(usage, &self.config);
            debug!(lv = %path, usage = ?usage, decision = ?decision, "Evaluated");

            let mut evaluation = LvEvaluation {
                lv: path.clone(),
                usage_percent: usage,
                decision,
                outcome: None,
                error: None,
            };

            match decision {
                Decision::Extend => {
                    self.set_state(MonitorState::Extending);
                    let usage = usage.unwrap_or_default();
                    info!(
                        "{} at {:.1}% (> {}%), extending by {}",
                        path,
                        usage,
                        self.config.auto_extend_threshold,
                        format_bytes(self.config.auto_extend_bytes)
                    );
                    let result = self
                        .lifecycle
                        .extend_lv_with(
                            &inventory,
                            &path,
                            self.config.auto_extend_bytes,
                            OperationContext::monitor(self.config.dry_run),
                            vec![
                                ("usage_percent", round2(usage).into()),
                                ("auto_extend_threshold", self.config.auto_extend_threshold.into()),
                            ],
                        )
                        .await;
                    match result {
                        Ok(report) => evaluation.outcome = Some(report.outcome()),
                        Err(e) => {
                            // Recorded by the guard; the remaining LVs still get evaluated
                            error!("Auto-extension of {} failed: {}", path, e);
                            evaluation.outcome = Some(Outcome::Failure);
                            evaluation.error = Some(e.to_string());
                        }
                    }
                }
                Decision::Warn => {
                    self.set_state(MonitorState::Warning);
                    let usage = usage.unwrap_or_default();
                    warn!(
                        "{} at {:.1}% exceeds warning threshold {}%",
                        path, usage, self.config.usage_threshold
                    );
                    self.audit.append(
                        OperationRecord::new(OperationKind::UsageWarning, Origin::Monitor, Outcome::Warning)
                            .with_target(path.as_str())
                            .with_param("usage_percent", round2(usage))
                            .with_param("usage_threshold", self.config.usage_threshold)
                            .with_param("auto_extend_enabled", self.config.auto_extend_enabled),
                    );
                    evaluation.outcome = Some(Outcome::Warning);
                }
                Decision::Healthy | Decision::NoData => {}
            }

            self.set_state(MonitorState::Evaluating);
            evaluations.push(evaluation);
        }

        self.drop_stale_gauges(gauged);
        self.set_state(MonitorState::Idle);
        self.finish(TickReport {
            started_at,
            finished_at: Utc::now(),
            inventory_error: None,
            evaluations,
        })
    }

    /// Remove usage series of LVs that vanished or stopped reporting
    fn drop_stale_gauges(&self, current: HashSet<String>) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let mut gauged = self.gauged.lock();
        for stale in gauged.difference(&current) {
            if let Err(e) = metrics.lv_usage_percent.remove_label_values(&[stale.as_str()]) {
                debug!("No usage series for {}: {}", stale, e);
            }
        }
        *gauged = current;
    }

    fn finish(&self, report: TickReport) -> TickReport {
        *self.last_report.write() = Some(report.clone());
        report
    }

    /// Tick every `interval` until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Usage monitor started (interval {:?}, auto-extend {})",
            self.config.interval,
            if self.config.auto_extend_enabled { "on" } else { "off" }
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.tick().await;
                    debug!(
                        evaluated = report.evaluations.len(),
                        extended = report.extended().len(),
                        warned = report.warned().len(),
                        "Monitor tick finished"
                    );
                }
            }
        }

        info!("Usage monitor stopped");
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{InMemoryBackend, Primitive};
    use crate::domain::model::FsType;
    use crate::domain::units::{GIB, MIB};
    use crate::guard::{DenyAll, GuardConfig, OperationGuard};
    use crate::lifecycle::LifecycleConfig;

    fn config(auto_extend_enabled: bool, dry_run: bool) -> MonitorConfig {
        MonitorConfig {
            usage_threshold: 80,
            auto_extend_threshold: 90,
            auto_extend_enabled,
            auto_extend_bytes: GIB,
            interval: Duration::from_millis(20),
            dry_run,
        }
    }

    fn setup(config: MonitorConfig) -> (Arc<InMemoryBackend>, Arc<AuditLog>, ManagerMetrics, Arc<UsageMonitor>) {
        let backend = Arc::new(InMemoryBackend::new());
        backend.seed_volume_group("data_vg", 4 * MIB, &[("/dev/sdb", 100 * GIB)]);
        backend.seed_logical_volume("data_vg", "app", 10 * GIB, Some(FsType::Ext4), Some("/srv/app"));
        backend.set_usage_percent("data_vg/app", 94.0);

        let audit = Arc::new(AuditLog::new());
        let inventory = InventoryService::new(backend.clone());
        // Monitor calls never ask, so even a denying confirmer must not block them
        let guard = Arc::new(OperationGuard::new(
            GuardConfig::default(),
            inventory.clone(),
            Arc::new(DenyAll),
            audit.clone(),
        ));
        let lifecycle = Arc::new(LifecycleOrchestrator::new(
            LifecycleConfig::default(),
            backend.clone(),
            guard,
        ));
        let metrics = ManagerMetrics::new().unwrap();
        let monitor = UsageMonitor::new(config, inventory, lifecycle, audit.clone())
            .with_metrics(metrics.clone());
        (backend, audit, metrics, Arc::new(monitor))
    }

    #[test]
    fn test_decide_thresholds() {
        let on = config(true, false);
        let off = config(false, false);
        assert_eq!(decide(Some(94.0), &on), Decision::Extend);
        assert_eq!(decide(Some(94.0), &off), Decision::Warn);
        assert_eq!(decide(Some(90.0), &on), Decision::Warn);
        assert_eq!(decide(Some(80.0), &on), Decision::Healthy);
        assert_eq!(decide(Some(80.1), &on), Decision::Warn);
        assert_eq!(decide(None, &on), Decision::NoData);
    }

    #[tokio::test]
    async fn test_extend_once_then_warn_only() {
        let (backend, audit, metrics, monitor) = setup(config(true, false));

        let first = monitor.tick().await;
        assert_eq!(first.extended().len(), 1);
        assert_eq!(first.evaluations[0].outcome, Some(Outcome::Success));
        assert_eq!(backend.call_count(Primitive::ExtendLogicalVolume), 1);
        assert_eq!(backend.calls_of(Primitive::ExtendLogicalVolume)[0].bytes, Some(GIB));

        let extend = &audit.by_kind(OperationKind::ExtendLv)[0];
        assert_eq!(extend.outcome, Outcome::Success);
        assert_eq!(extend.origin, Origin::Monitor);
        assert_eq!(extend.parameters["usage_percent"], 94.0);

        // 9.4 GiB used of 11 GiB is about 85%
        let second = monitor.tick().await;
        let usage = second.evaluations[0].usage_percent.unwrap();
        assert!(usage > 85.0 && usage < 86.0);
        assert_eq!(second.evaluations[0].decision, Decision::Warn);
        assert_eq!(backend.call_count(Primitive::ExtendLogicalVolume), 1);
        assert_eq!(audit.by_kind(OperationKind::UsageWarning).len(), 1);

        assert_eq!(metrics.monitor_ticks_total.get(), 2);
        assert_eq!(monitor.state(), MonitorState::Idle);
    }

    #[tokio::test]
    async fn test_usage_series_removed_for_vanished_lv() {
        let (backend, _, metrics, monitor) = setup(config(false, false));
        backend.seed_logical_volume("data_vg", "logs", 10 * GIB, Some(FsType::Xfs), Some("/var/log"));
        backend.set_usage_percent("data_vg/logs", 40.0);

        monitor.tick().await;
        let (_, body) = metrics.encode().unwrap();
        assert!(body.contains("lvm_lv_usage_percent{lv=\"data_vg/logs\"} 40"));

        backend.remove_logical_volume("data_vg/logs");
        monitor.tick().await;
        let (_, body) = metrics.encode().unwrap();
        assert!(!body.contains("data_vg/logs"));
        assert!(body.contains("lvm_lv_usage_percent{lv=\"data_vg/app\"}"));
    }

    #[tokio::test]
    async fn test_dry_run_records_without_extending() {
        let (backend, audit, _, monitor) = setup(config(true, true));

        let report = monitor.tick().await;
        assert_eq!(report.evaluations[0].outcome, Some(Outcome::DryRun));
        assert_eq!(backend.call_count(Primitive::ExtendLogicalVolume), 0);

        let record = &audit.by_kind(OperationKind::ExtendLv)[0];
        assert_eq!(record.outcome, Outcome::DryRun);
        assert_eq!(record.targets, vec!["data_vg/app"]);
        assert_eq!(record.parameters["delta_bytes"], GIB);
    }

    #[tokio::test]
    async fn test_failure_on_one_lv_does_not_stop_others() {
        let (backend, _, _, monitor) = setup(config(true, false));
        backend.seed_logical_volume("data_vg", "logs", 10 * GIB, Some(FsType::Xfs), Some("/var/log"));
        backend.set_usage_percent("data_vg/logs", 97.0);
        backend.fail_on_target(Primitive::ExtendLogicalVolume, "data_vg/app", "device busy");

        let report = monitor.tick().await;
        let app = report.evaluations.iter().find(|e| e.lv == "data_vg/app").unwrap();
        let logs = report.evaluations.iter().find(|e| e.lv == "data_vg/logs").unwrap();
        assert_eq!(app.outcome, Some(Outcome::Failure));
        assert!(app.error.is_some());
        assert_eq!(logs.outcome, Some(Outcome::Success));
        assert_eq!(backend.call_count(Primitive::ExtendLogicalVolume), 2);
    }

    #[tokio::test]
    async fn test_unavailable_inventory_skips_tick() {
        let (backend, audit, metrics, monitor) = setup(config(true, false));
        backend.set_available(false);

        let report = monitor.tick().await;
        assert!(report.inventory_error.is_some());
        assert!(report.evaluations.is_empty());
        assert!(audit.is_empty());
        assert_eq!(metrics.monitor_tick_failures_total.get(), 1);
        assert_eq!(backend.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_ticks_extend_once() {
        let (backend, _, _, monitor) = setup(config(true, false));
        backend.set_latency(Duration::from_millis(10));

        let (a, b) = tokio::join!(monitor.tick(), monitor.tick());
        assert_eq!(a.extended().len() + b.extended().len(), 1);
        assert_eq!(backend.call_count(Primitive::ExtendLogicalVolume), 1);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_cancel() {
        let (backend, _, metrics, monitor) = setup(config(false, false));
        backend.set_usage_percent("data_vg/app", 10.0);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(monitor.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(70)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(metrics.monitor_ticks_total.get() >= 2);
        assert!(monitor.last_report().is_some());
    }
}
