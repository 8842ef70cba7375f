use std::sync::LazyLock;

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

/* ============================= PROMETHEUS ============================= */

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static EVENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "kyverno_plugin_events_total",
            "Admission events seen by the event watcher, by outcome",
        ),
        &["outcome"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static VIOLATIONS_PUBLISHED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "kyverno_plugin_violations_published_total",
        "Violations delivered to listeners",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static REPORT_WRITES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "kyverno_plugin_report_writes_total",
            "Report store writes by scope and outcome",
        ),
        &["scope", "outcome"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static REPORT_RESULTS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        Opts::new(
            "kyverno_plugin_report_results",
            "Results currently held per report",
        ),
        &["scope", "namespace"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

pub static LEADER: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "kyverno_plugin_leader",
        "1 while this instance holds the leader lease",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

/// Force-init every metric so each shows up on `/metrics` before its first
/// sample.
pub fn init() {
    LazyLock::force(&EVENTS);
    LazyLock::force(&VIOLATIONS_PUBLISHED);
    LazyLock::force(&REPORT_WRITES);
    LazyLock::force(&REPORT_RESULTS);
    LazyLock::force(&LEADER);
}

/// Text exposition of the registry.
pub fn encode() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_metrics_registered() {
        init();
        EVENTS.with_label_values(&["ignored"]).inc();
        REPORT_WRITES.with_label_values(&["cluster", "created"]).inc();
        REPORT_RESULTS.with_label_values(&["namespaced", "test"]).set(1);

        let families = REGISTRY.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();

        for name in [
            "kyverno_plugin_events_total",
            "kyverno_plugin_violations_published_total",
            "kyverno_plugin_report_writes_total",
            "kyverno_plugin_report_results",
            "kyverno_plugin_leader",
        ] {
            assert!(names.contains(&name), "{name} should be registered");
        }
    }

    #[test]
    fn test_encode_produces_text_format() {
        init();
        VIOLATIONS_PUBLISHED.inc();
        let body = encode().expect("should encode");
        assert!(body.contains("# TYPE kyverno_plugin_violations_published_total counter"));
    }
}
