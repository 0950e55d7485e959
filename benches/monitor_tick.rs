//! Benchmark for the usage monitor
//!
//! Measures the pure decision function and a full tick over an in-memory
//! host with many logical volumes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use smart_lvm_manager::domain::units::{GIB, MIB};
use smart_lvm_manager::monitor::decide;
use smart_lvm_manager::{
    AuditLog, DenyAll, FsType, GuardConfig, InMemoryBackend, InventoryService, LifecycleConfig,
    LifecycleOrchestrator, MonitorConfig, OperationGuard, UsageMonitor,
};
use std::sync::Arc;

fn bench_decide(c: &mut Criterion) {
    let mut group = c.benchmark_group("monitor");
    group.throughput(Throughput::Elements(1));

    let config = MonitorConfig {
        auto_extend_enabled: true,
        ..Default::default()
    };

    group.bench_function("decide", |b| {
        let mut usage = 0.0f64;
        b.iter(|| {
            usage = (usage + 7.3) % 100.0;
            decide(black_box(Some(usage)), &config)
        });
    });

    group.finish();
}

fn monitor_with_volumes(count: usize) -> Arc<UsageMonitor> {
    let backend = Arc::new(InMemoryBackend::new());
    backend.seed_volume_group("vg0", 4 * MIB, &[("/dev/sdb", 10 * 1024 * GIB)]);
    for i in 0..count {
        let name = format!("lv{:04}", i);
        backend.seed_logical_volume("vg0", &name, GIB, Some(FsType::Ext4), Some(&format!("/srv/{}", name)));
        // Stay below the warning threshold so a tick only evaluates
        backend.set_usage_percent(&format!("vg0/{}", name), (i % 80) as f64);
    }

    let audit = Arc::new(AuditLog::new());
    let inventory = InventoryService::new(backend.clone());
    let guard = Arc::new(OperationGuard::new(
        GuardConfig::default(),
        inventory.clone(),
        Arc::new(DenyAll),
        audit.clone(),
    ));
    let lifecycle = Arc::new(LifecycleOrchestrator::new(LifecycleConfig::default(), backend, guard));

    Arc::new(UsageMonitor::new(MonitorConfig::default(), inventory, lifecycle, audit))
}

fn bench_tick(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("monitor_tick");

    for count in [10usize, 100, 1000] {
        let monitor = monitor_with_volumes(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| rt.block_on(monitor.tick()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decide, bench_tick);
criterion_main!(benches);
