use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Registry and counters, published together once fully registered.
pub struct Metrics {
    pub registry: Registry,
    pub membership_lookups: IntCounterVec,
    pub authorization_decisions: IntCounterVec,
    pub mount_actions: IntCounterVec,
}

pub static METRICS: OnceLock<Metrics> = OnceLock::new();

fn build_metrics() -> Result<Metrics, prometheus::Error> {
    let registry = Registry::new();

    let lookups = IntCounterVec::new(
        Opts::new(
            "membership_lookups_total",
            "Membership cache lookups by outcome",
        ),
        &["outcome"],
    )?;

    let decisions = IntCounterVec::new(
        Opts::new(
            "authorization_decisions_total",
            "Permission gate decisions by operation and result",
        ),
        &["operation", "decision"],
    )?;

    let mounts = IntCounterVec::new(
        Opts::new("mount_actions_total", "Mount timeline mutations by result"),
        &["action", "result"],
    )?;

    registry.register(Box::new(lookups.clone())).map_err(|e| {
        tracing::error!("Failed to register membership_lookups_total collector: {}", e);
        e
    })?;
    registry.register(Box::new(decisions.clone())).map_err(|e| {
        tracing::error!(
            "Failed to register authorization_decisions_total collector: {}",
            e
        );
        e
    })?;
    registry.register(Box::new(mounts.clone())).map_err(|e| {
        tracing::error!("Failed to register mount_actions_total collector: {}", e);
        e
    })?;

    Ok(Metrics {
        registry,
        membership_lookups: lookups,
        authorization_decisions: decisions,
        mount_actions: mounts,
    })
}

/// Idempotent. Concurrent callers may each build a set, but only one is
/// published and every caller observes that same set afterwards.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let metrics = build_metrics()?;
    // A concurrent caller won the race; its set is the one in use.
    let _ = METRICS.set(metrics);
    Ok(())
}

/// Count a membership lookup; a no-op until `init_metrics` ran.
pub fn record_membership_lookup(outcome: &str) {
    if let Some(metrics) = METRICS.get() {
        metrics.membership_lookups.with_label_values(&[outcome]).inc();
    }
}

pub fn record_decision(operation: &str, decision: &str) {
    if let Some(metrics) = METRICS.get() {
        metrics
            .authorization_decisions
            .with_label_values(&[operation, decision])
            .inc();
    }
}

pub fn record_mount_action(action: &str, result: &str) {
    if let Some(metrics) = METRICS.get() {
        metrics
            .mount_actions
            .with_label_values(&[action, result])
            .inc();
    }
}

pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match METRICS.get() {
        Some(metrics) => &metrics.registry,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    let metric_families = registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to convert metrics to UTF-8: {}", e);
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}
