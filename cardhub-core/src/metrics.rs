//! Prometheus metrics collection for production monitoring
//!
//! Passive counters updated by the registry, delivery queue, orchestrator
//! and call coordinator as side effects. Exposed via the /metrics endpoint
//! for Prometheus scraping and as a periodic snapshot for the external
//! monitoring surface.

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, Encoder, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder,
};
use serde::Serialize;
use std::collections::HashMap;

use crate::models::JobKind;

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Total channel connects
pub static CONNECTS_TOTAL: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter_with_registry!(
        "connects_total",
        "Total number of channel connections opened",
        REGISTRY.clone()
    )
    .expect("Failed to register CONNECTS_TOTAL")
});

/// Total channel disconnects
pub static DISCONNECTS_TOTAL: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter_with_registry!(
        "disconnects_total",
        "Total number of channel connections closed",
        REGISTRY.clone()
    )
    .expect("Failed to register DISCONNECTS_TOTAL")
});

/// Currently online users (presence count > 0)
pub static ONLINE_USERS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "online_users",
        "Current number of online users",
        REGISTRY.clone()
    )
    .expect("Failed to register ONLINE_USERS")
});

/// High-water mark of concurrently online users
pub static PEAK_ONLINE_USERS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "peak_online_users",
        "Peak number of concurrently online users",
        REGISTRY.clone()
    )
    .expect("Failed to register PEAK_ONLINE_USERS")
});

/// Messages accepted for delivery
pub static MESSAGES_SENT: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter_with_registry!(
        "messages_sent_total",
        "Total number of messages accepted from senders",
        REGISTRY.clone()
    )
    .expect("Failed to register MESSAGES_SENT")
});

/// Messages pushed to a live connection
pub static MESSAGES_DELIVERED: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter_with_registry!(
        "messages_delivered_total",
        "Total number of messages pushed to online recipients",
        REGISTRY.clone()
    )
    .expect("Failed to register MESSAGES_DELIVERED")
});

/// Delivery attempts that failed
pub static MESSAGES_FAILED: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter_with_registry!(
        "messages_failed_total",
        "Total number of failed message delivery attempts",
        REGISTRY.clone()
    )
    .expect("Failed to register MESSAGES_FAILED")
});

/// Delivery queue depth per job kind
pub static QUEUE_DEPTH: std::sync::LazyLock<IntGaugeVec> = std::sync::LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        "delivery_queue_depth",
        "Current number of queued or retrying delivery jobs",
        &["kind"],
        REGISTRY.clone()
    )
    .expect("Failed to register QUEUE_DEPTH")
});

/// Job attempts per kind and outcome
pub static JOB_ATTEMPTS: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "delivery_job_attempts_total",
        "Total delivery job attempts by kind and outcome",
        &["kind", "outcome"],
        REGISTRY.clone()
    )
    .expect("Failed to register JOB_ATTEMPTS")
});

/// Dead-lettered jobs per kind
pub static JOBS_DEAD: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "delivery_jobs_dead_total",
        "Total delivery jobs dead-lettered after exhausting retries",
        &["kind"],
        REGISTRY.clone()
    )
    .expect("Failed to register JOBS_DEAD")
});

/// Emails handed to the dispatcher
pub static EMAILS_SENT: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter_with_registry!(
        "emails_sent_total",
        "Total number of transactional emails dispatched",
        REGISTRY.clone()
    )
    .expect("Failed to register EMAILS_SENT")
});

/// Calls currently ringing
pub static CALLS_RINGING: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "calls_ringing",
        "Current number of ringing call sessions",
        REGISTRY.clone()
    )
    .expect("Failed to register CALLS_RINGING")
});

/// Calls currently active
pub static CALLS_ACTIVE: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "calls_active",
        "Current number of active call sessions",
        REGISTRY.clone()
    )
    .expect("Failed to register CALLS_ACTIVE")
});

/// Record a connection open and keep the peak gauge current
pub fn record_connect(online_users: i64) {
    CONNECTS_TOTAL.inc();
    ONLINE_USERS.set(online_users);
    if online_users > PEAK_ONLINE_USERS.get() {
        PEAK_ONLINE_USERS.set(online_users);
    }
}

/// Record a connection close
pub fn record_disconnect(online_users: i64) {
    DISCONNECTS_TOTAL.inc();
    ONLINE_USERS.set(online_users);
}

/// Point-in-time snapshot for the external monitoring surface
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSnapshot {
    pub connects_total: u64,
    pub disconnects_total: u64,
    pub online_users: i64,
    pub peak_online_users: i64,
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub messages_failed: u64,
    pub emails_sent: u64,
    pub calls_ringing: i64,
    pub calls_active: i64,
    pub queue_depth: HashMap<&'static str, i64>,
    pub jobs_dead: u64,
    pub delivery_failure_rate: f64,
}

#[must_use]
pub fn snapshot() -> AnalyticsSnapshot {
    let mut queue_depth = HashMap::new();
    let mut attempts_ok = 0;
    let mut attempts_failed = 0;
    let mut jobs_dead = 0;
    for kind in JobKind::ALL {
        let kind = kind.as_str();
        queue_depth.insert(kind, QUEUE_DEPTH.with_label_values(&[kind]).get());
        attempts_ok += JOB_ATTEMPTS.with_label_values(&[kind, "ok"]).get();
        for outcome in ["transient", "permanent"] {
            attempts_failed += JOB_ATTEMPTS.with_label_values(&[kind, outcome]).get();
        }
        jobs_dead += JOBS_DEAD.with_label_values(&[kind]).get();
    }
    let attempts_total = attempts_ok + attempts_failed;
    let delivery_failure_rate = if attempts_total == 0 {
        0.0
    } else {
        attempts_failed as f64 / attempts_total as f64
    };

    AnalyticsSnapshot {
        connects_total: CONNECTS_TOTAL.get(),
        disconnects_total: DISCONNECTS_TOTAL.get(),
        online_users: ONLINE_USERS.get(),
        peak_online_users: PEAK_ONLINE_USERS.get(),
        messages_sent: MESSAGES_SENT.get(),
        messages_delivered: MESSAGES_DELIVERED.get(),
        messages_failed: MESSAGES_FAILED.get(),
        emails_sent: EMAILS_SENT.get(),
        calls_ringing: CALLS_RINGING.get(),
        calls_active: CALLS_ACTIVE.get(),
        queue_depth,
        jobs_dead,
        delivery_failure_rate,
    }
}

/// Expose metrics in Prometheus format
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|_| prometheus::Error::Msg("Invalid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        MESSAGES_SENT.inc();
        QUEUE_DEPTH.with_label_values(&["message"]).set(1);
        JOB_ATTEMPTS.with_label_values(&["email", "ok"]).inc();

        let output = gather_metrics().unwrap();
        assert!(output.contains("messages_sent_total"));
        assert!(output.contains("delivery_queue_depth"));
    }

    #[test]
    fn test_peak_tracks_high_water_mark() {
        record_connect(5);
        record_connect(9);
        record_disconnect(3);
        assert!(PEAK_ONLINE_USERS.get() >= 9);
        assert_eq!(ONLINE_USERS.get(), 3);

        let snap = snapshot();
        assert!(snap.peak_online_users >= snap.online_users);
    }

    #[test]
    fn test_snapshot_covers_every_job_kind() {
        let snap = snapshot();
        assert_eq!(snap.queue_depth.len(), JobKind::ALL.len());
        for kind in JobKind::ALL {
            assert!(snap.queue_depth.contains_key(kind.as_str()));
        }
        assert!((0.0..=1.0).contains(&snap.delivery_failure_rate));
    }
}
