//! Prometheus metrics shared by the three reconcilers. Exposed on `/metrics`
//! by `commands::run`.
//!
//! One shared `Registry`, metrics defined as `LazyLock` statics that
//! self-register on first access, force-initialized at startup so they
//! appear on `/metrics` before the first reconcile.

use std::sync::LazyLock;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Buckets (milliseconds) for the time from `Sandbox` creation to its pod
/// first turning Ready.
const CREATION_LATENCY_BUCKETS_MS: &[f64] = &[
    50.0, 100.0, 200.0, 300.0, 500.0, 700.0, 1000.0, 1500.0, 2000.0, 3000.0, 4500.0, 6000.0, 9000.0,
    12000.0, 18000.0, 30000.0,
];

pub static SANDBOX_RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("sandbox_reconcile_total", "Total Sandbox reconciliation cycles")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static SANDBOX_RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "sandbox_reconcile_errors_total",
        "Total Sandbox reconciliation errors returned to the work queue",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static SANDBOX_CREATION_LATENCY: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new(
            "sandbox_creation_latency_milliseconds",
            "Time from Sandbox creation to its pod first turning Ready",
        )
        .buckets(CREATION_LATENCY_BUCKETS_MS.to_vec()),
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

pub static CLAIM_RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("sandboxclaim_reconcile_total", "Total SandboxClaim reconciliation cycles")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static CLAIM_RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "sandboxclaim_reconcile_errors_total",
        "Total SandboxClaim reconciliation errors returned to the work queue",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static CLAIM_ADOPTIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new("sandboxclaim_adoptions_total", "Warm-pool pods adopted per namespace"),
        &["namespace"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static WARMPOOL_RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("sandboxwarmpool_reconcile_total", "Total SandboxWarmPool reconciliation cycles")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static WARMPOOL_RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "sandboxwarmpool_reconcile_errors_total",
        "Total SandboxWarmPool reconciliation errors returned to the work queue",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static WARMPOOL_READY_REPLICAS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        Opts::new("sandboxwarmpool_ready_replicas", "Ready replicas per warm pool"),
        &["namespace", "name"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

pub static WARMPOOL_EXPLOSION_GUARD_TRIGGERED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "sandboxwarmpool_explosion_guard_triggered_total",
            "Times the warm pool skipped a create because an in-flight PVC/pod race was detected",
        ),
        &["namespace", "name"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

/// Force-initialize every metric so it shows up on `/metrics` at startup,
/// before the first reconcile of each controller has run.
pub fn init() {
    LazyLock::force(&SANDBOX_RECONCILE_TOTAL);
    LazyLock::force(&SANDBOX_RECONCILE_ERRORS);
    LazyLock::force(&SANDBOX_CREATION_LATENCY);
    LazyLock::force(&CLAIM_RECONCILE_TOTAL);
    LazyLock::force(&CLAIM_RECONCILE_ERRORS);
    LazyLock::force(&CLAIM_ADOPTIONS_TOTAL);
    LazyLock::force(&WARMPOOL_RECONCILE_TOTAL);
    LazyLock::force(&WARMPOOL_RECONCILE_ERRORS);
    LazyLock::force(&WARMPOOL_READY_REPLICAS);
    LazyLock::force(&WARMPOOL_EXPLOSION_GUARD_TRIGGERED);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_registers_every_metric_without_panicking() {
        init();
        let families = REGISTRY.gather();
        assert!(families.len() >= 9);
    }

    #[test]
    fn creation_latency_buckets_are_milliseconds_not_seconds() {
        init();
        SANDBOX_CREATION_LATENCY.observe(250.0);
        let families = REGISTRY.gather();
        let hist = families
            .iter()
            .find(|f| f.get_name() == "sandbox_creation_latency_milliseconds")
            .expect("histogram registered");
        let sample = hist.get_metric()[0].get_histogram();
        assert!(sample.get_sample_count() >= 1);
    }

    #[test]
    fn counters_with_labels_increment_independently() {
        init();
        CLAIM_ADOPTIONS_TOTAL.with_label_values(&["ns-a"]).inc();
        CLAIM_ADOPTIONS_TOTAL.with_label_values(&["ns-b"]).inc_by(2);
        assert_eq!(CLAIM_ADOPTIONS_TOTAL.with_label_values(&["ns-a"]).get(), 1);
        assert_eq!(CLAIM_ADOPTIONS_TOTAL.with_label_values(&["ns-b"]).get(), 2);
    }
}
