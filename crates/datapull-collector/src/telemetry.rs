//! Process-global self metrics.
//!
//! The exporter reports its own health through a prometheus-client
//! registry: collection error counts by stage and source, and the
//! outcome of the last configuration reload.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;

/// Exporter name, used as the metric namespace.
pub const EXPORTER_NAME: &str = "datapull";

type ErrorLabels = Vec<(String, String)>;

static COLLECT_ERROR_COUNT: Lazy<Family<ErrorLabels, Counter>> = Lazy::new(Family::default);
static CONFIG_RELOAD_SUCCESS: Lazy<Gauge> = Lazy::new(Gauge::default);
static CONFIG_RELOAD_SECONDS: Lazy<Gauge<f64, AtomicU64>> = Lazy::new(Gauge::default);

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        format!("{EXPORTER_NAME}_collect_error_count"),
        "Number of errors while acquiring datasources and building metrics.",
        COLLECT_ERROR_COUNT.clone(),
    );
    registry.register(
        format!("{EXPORTER_NAME}_config_last_reload_successful"),
        "Whether the last configuration reload attempt was successful.",
        CONFIG_RELOAD_SUCCESS.clone(),
    );
    registry.register(
        format!("{EXPORTER_NAME}_config_last_reload_success_timestamp_seconds"),
        "Timestamp of the last successful configuration reload.",
        CONFIG_RELOAD_SECONDS.clone(),
    );
    Mutex::new(registry)
});

/// Count one collection error of the given stage (`datasource` or
/// `metric`) for the named source or rule.
pub fn inc_collect_error(kind: &str, name: &str) {
    COLLECT_ERROR_COUNT
        .get_or_create(&vec![
            ("type".to_string(), kind.to_string()),
            ("name".to_string(), name.to_string()),
        ])
        .inc();
}

/// Record the outcome of a configuration reload.
pub fn set_config_reload(success: bool) {
    if success {
        CONFIG_RELOAD_SUCCESS.set(1);
        CONFIG_RELOAD_SECONDS.set(chrono::Utc::now().timestamp_millis() as f64 / 1000.0);
    } else {
        CONFIG_RELOAD_SUCCESS.set(0);
    }
}

/// Encode the self metrics in the OpenMetrics text format.
#[must_use]
pub fn encode() -> String {
    let mut out = String::new();
    let registry = REGISTRY.lock();
    // Errors only happen on a broken formatter; a String cannot fail.
    let _ = prometheus_client::encoding::text::encode(&mut out, &registry);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_counter_appears_in_encoding() {
        inc_collect_error("datasource", "unit-test-source");
        let body = encode();
        assert!(body.contains("datapull_collect_error_count"));
        assert!(body.contains("unit-test-source"));
    }

    #[test]
    fn test_reload_gauges() {
        set_config_reload(true);
        let body = encode();
        assert!(body.contains("datapull_config_last_reload_successful 1"));
    }
}
