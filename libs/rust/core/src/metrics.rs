//! Counter groups for lock and registry activity.
//!
//! Instruments are registered on the global meter; the embedding service decides whether an
//! exporter is installed.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};

pub struct LockMetrics {
    pub acquired_total: Counter<u64>,
    pub contended_total: Counter<u64>,
    pub stolen_total: Counter<u64>,
}

pub struct RegistryMetrics {
    pub push_total: Counter<u64>,
    pub pull_total: Counter<u64>,
    pub delete_total: Counter<u64>,
    pub push_latency_ms: Histogram<f64>,
}

static METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("arca"));

pub static LOCK_METRICS: Lazy<LockMetrics> = Lazy::new(|| LockMetrics {
    acquired_total: METER.u64_counter("arca_lock_acquired_total").with_description("Successful lock acquisitions").build(),
    contended_total: METER.u64_counter("arca_lock_contended_total").with_description("Acquisition attempts that found the lock held or lost a race").build(),
    stolen_total: METER.u64_counter("arca_lock_stolen_total").with_description("Expired leases taken over from a holder that never released").build(),
});

pub static REGISTRY_METRICS: Lazy<RegistryMetrics> = Lazy::new(|| RegistryMetrics {
    push_total: METER.u64_counter("arca_registry_push_total").with_description("Committed pushes").build(),
    pull_total: METER.u64_counter("arca_registry_pull_total").with_description("Served pulls").build(),
    delete_total: METER.u64_counter("arca_registry_delete_total").with_description("Tombstoned versions").build(),
    push_latency_ms: METER.f64_histogram("arca_registry_push_latency_ms").with_description("Push latency including lock wait (ms)").with_unit("ms").build(),
});
