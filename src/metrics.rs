//! Prometheus metrics
//!
//! Each manager owns its own registry so that several instances (tests,
//! benches) never collide on metric names.

use crate::error::{Error, Result};
use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Metric handles for the volume manager
#[derive(Clone)]
pub struct ManagerMetrics {
    registry: Registry,
    /// Operation records by kind and outcome
    pub operations_total: IntCounterVec,
    pub monitor_ticks_total: IntCounter,
    /// Ticks that ended without evaluating (inventory unavailable)
    pub monitor_tick_failures_total: IntCounter,
    /// Last observed filesystem usage per LV
    pub lv_usage_percent: GaugeVec,
    pub backups_total: IntCounter,
    pub backup_archives_pruned_total: IntCounter,
}

impl ManagerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations_total = IntCounterVec::new(
            Opts::new("lvm_operations_total", "Operation records by kind and outcome"),
            &["kind", "outcome"],
        )
        .map_err(metric_error)?;
        let monitor_ticks_total =
            IntCounter::new("lvm_monitor_ticks_total", "Usage monitor ticks started")
                .map_err(metric_error)?;
        let monitor_tick_failures_total = IntCounter::new(
            "lvm_monitor_tick_failures_total",
            "Usage monitor ticks aborted by an inventory failure",
        )
        .map_err(metric_error)?;
        let lv_usage_percent = GaugeVec::new(
            Opts::new("lvm_lv_usage_percent", "Filesystem usage of a logical volume"),
            &["lv"],
        )
        .map_err(metric_error)?;
        let backups_total = IntCounter::new("lvm_backups_total", "Backup archives written")
            .map_err(metric_error)?;
        let backup_archives_pruned_total = IntCounter::new(
            "lvm_backup_archives_pruned_total",
            "Backup archives deleted by retention",
        )
        .map_err(metric_error)?;

        registry
            .register(Box::new(operations_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(monitor_ticks_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(monitor_tick_failures_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(lv_usage_percent.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(backups_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(backup_archives_pruned_total.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            registry,
            operations_total,
            monitor_ticks_total,
            monitor_tick_failures_total,
            lv_usage_percent,
            backups_total,
            backup_archives_pruned_total,
        })
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<(String, String)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        let body = String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("metrics are not UTF-8: {}", e)))?;
        Ok((encoder.format_type().to_string(), body))
    }
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_do_not_collide() {
        let a = ManagerMetrics::new().unwrap();
        let b = ManagerMetrics::new().unwrap();
        a.backups_total.inc();
        assert_eq!(a.backups_total.get(), 1);
        assert_eq!(b.backups_total.get(), 0);
    }

    #[test]
    fn test_encode_contains_labelled_counters() {
        let metrics = ManagerMetrics::new().unwrap();
        metrics
            .operations_total
            .with_label_values(&["extend-lv", "success"])
            .inc();
        metrics
            .lv_usage_percent
            .with_label_values(&["data_vg/app"])
            .set(94.0);

        let (content_type, body) = metrics.encode().unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("lvm_operations_total{kind=\"extend-lv\",outcome=\"success\"} 1"));
        assert!(body.contains("lvm_lv_usage_percent{lv=\"data_vg/app\"} 94"));
    }
}
