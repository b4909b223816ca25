//! Metric rules and the conversion of relabeled label sets into
//! observations.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::collect::DataFormat;
use crate::error::{CollectorError, Result};
use crate::jsonpath::JsonSelector;
use crate::labels::{
    is_valid_metric_name, sanitize_name, Builder, Labels, LABEL_METRIC_BUCKETS,
    LABEL_METRIC_HELP, LABEL_METRIC_NAME, LABEL_METRIC_NAMESPACE, LABEL_METRIC_SUBSYSTEM,
    LABEL_METRIC_TIME, LABEL_METRIC_TIME_FORMAT, LABEL_METRIC_VALUE, LABEL_METRIC_VALUES,
    LABEL_METRIC_VALUES_INDEX, LABEL_METRIC_VALUES_INDEX_LABEL_NAME,
    LABEL_METRIC_VALUES_INDEX_SEPARATOR, LABEL_METRIC_VALUES_SEPARATOR,
};
use crate::relabel::{self, RelabelConfig, RelabelConfigs};
use crate::template::Template;
use crate::xmlpath::XmlPath;

/// The kind of metric a rule produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// A point-in-time value; observations set it.
    #[default]
    Gauge,
    /// A monotonically increasing value; observations add to it.
    Counter,
    /// A bucketed distribution; observations are recorded into it.
    Histogram,
}

impl MetricType {
    /// The `# TYPE` keyword for this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
            MetricType::Histogram => "histogram",
        }
    }
}

/// The datapoint and label selectors of a metric rule, in their source
/// form plus the per-format compiled representation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricMatch {
    /// Selector producing datapoints from the raw input.
    #[serde(default)]
    pub datapoint: String,
    /// Per-label selectors evaluated against each datapoint.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(skip)]
    pub(crate) compiled: Option<CompiledMatch>,
}

#[derive(Debug, Clone)]
pub(crate) enum CompiledMatch {
    Regex {
        datapoint: Option<regex::Regex>,
        labels: BTreeMap<String, regex::Regex>,
    },
    Json {
        datapoint: JsonSelector,
        labels: BTreeMap<String, JsonSelector>,
    },
    Xml {
        datapoint: Option<XmlPath>,
        labels: BTreeMap<String, Template>,
    },
}

/// A single metric rule inside a collect.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricConfig {
    /// Rule name; also the fallback metric name after sanitising.
    pub name: String,
    /// Rule-level relabel configs, applied after the collect and
    /// datasource levels.
    #[serde(default)]
    pub relabel_configs: RelabelConfigs,
    /// Datapoint and label selectors.
    #[serde(rename = "match", default)]
    pub match_: MetricMatch,
    /// Kind of metric produced (default gauge).
    #[serde(default)]
    pub metric_type: MetricType,
}

impl MetricConfig {
    /// Compile the match selectors for the collect's data format.
    ///
    /// # Errors
    ///
    /// Returns an error when a selector, pattern or template is invalid.
    pub fn compile(&mut self, format: DataFormat) -> Result<()> {
        let compiled = match format {
            DataFormat::Regex => {
                let datapoint = if self.match_.datapoint.is_empty() {
                    None
                } else {
                    Some(compile_plain(&self.match_.datapoint)?)
                };
                let mut labels = BTreeMap::new();
                for (name, pattern) in &self.match_.labels {
                    if pattern.is_empty() {
                        return Err(CollectorError::InvalidRule(format!(
                            "label pattern for {name:?} cannot be empty"
                        )));
                    }
                    labels.insert(name.clone(), compile_plain(pattern)?);
                }
                CompiledMatch::Regex { datapoint, labels }
            }
            DataFormat::Json | DataFormat::Yaml => {
                let datapoint = JsonSelector::parse(&self.match_.datapoint)?;
                let mut labels = BTreeMap::new();
                for (name, selector) in &self.match_.labels {
                    labels.insert(name.clone(), JsonSelector::parse(selector)?);
                }
                CompiledMatch::Json { datapoint, labels }
            }
            DataFormat::Xml => {
                let datapoint = if self.match_.datapoint.is_empty() {
                    None
                } else {
                    Some(XmlPath::parse(&self.match_.datapoint)?)
                };
                let mut labels = BTreeMap::new();
                for (name, template) in &self.match_.labels {
                    labels.insert(name.clone(), Template::new(template.clone())?);
                }
                CompiledMatch::Xml { datapoint, labels }
            }
        };
        self.match_.compiled = Some(compiled);
        Ok(())
    }

    /// Run the merged relabel pipeline over a datapoint's labels, then
    /// backfill `__name__` from the sanitised rule name when the pipeline
    /// did not set one. When that fallback fires and a `name` label still
    /// equals the rule's original name, the `name` label is removed.
    pub fn relabel(&self, rules: &[RelabelConfig], labels: Labels) -> Result<Option<Labels>> {
        let Some(mut relabeled) = relabel::process(rules, labels)? else {
            return Ok(None);
        };
        if !relabeled.has(LABEL_METRIC_NAME) {
            let metric_name = sanitize_name(&self.name);
            if is_valid_metric_name(&metric_name) {
                let mut builder = Builder::new(relabeled.clone());
                builder.set(LABEL_METRIC_NAME, &metric_name);
                if relabeled.get("name") == self.name {
                    builder.del("name");
                }
                relabeled = builder.into_labels();
            }
        }
        Ok(Some(relabeled))
    }
}

fn compile_plain(pattern: &str) -> Result<regex::Regex> {
    regex::Regex::new(pattern).map_err(|source| CollectorError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// One fully resolved metric observation.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Kind of metric.
    pub metric_type: MetricType,
    /// Fully-qualified metric name.
    pub name: String,
    /// Help string, possibly empty.
    pub help: String,
    /// Exported labels: sorted, no inner names, no empty values.
    pub labels: Labels,
    /// The observed value.
    pub value: f64,
    /// Histogram upper bounds with `+Inf` appended; empty otherwise.
    pub buckets: Vec<f64>,
    /// Optional explicit sample timestamp.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Convert a relabeled label set into observations.
///
/// The scalar path emits one observation; the vector path
/// (`__values__` present) emits one per element. Failures are collected
/// per element so one bad token does not abort its siblings.
pub fn build_observations(
    metric_type: MetricType,
    labels: &Labels,
) -> (Vec<Observation>, Vec<CollectorError>) {
    let name = match resolve_name(labels) {
        Ok(name) => name,
        Err(err) => return (Vec::new(), vec![err]),
    };
    let help = labels.get(LABEL_METRIC_HELP).to_string();
    let timestamp = parse_time(labels);
    let buckets = if metric_type == MetricType::Histogram {
        match parse_buckets(labels.get(LABEL_METRIC_BUCKETS)) {
            Ok(buckets) => buckets,
            Err(err) => return (Vec::new(), vec![err]),
        }
    } else {
        Vec::new()
    };
    let exported = labels.exported();

    if labels.has(LABEL_METRIC_VALUES) {
        return build_vector(metric_type, &name, &help, timestamp, &buckets, labels, &exported);
    }

    match scalar_value(labels.get(LABEL_METRIC_VALUE)) {
        Ok(value) => (
            vec![Observation {
                metric_type,
                name,
                help,
                labels: exported,
                value,
                buckets,
                timestamp,
            }],
            Vec::new(),
        ),
        Err(err) => (Vec::new(), vec![err]),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_vector(
    metric_type: MetricType,
    name: &str,
    help: &str,
    timestamp: Option<DateTime<Utc>>,
    buckets: &[f64],
    labels: &Labels,
    exported: &Labels,
) -> (Vec<Observation>, Vec<CollectorError>) {
    let separator = non_empty_or(labels.get(LABEL_METRIC_VALUES_SEPARATOR), " ");
    let index_separator = non_empty_or(labels.get(LABEL_METRIC_VALUES_INDEX_SEPARATOR), separator);
    let index_label =
        non_empty_or(labels.get(LABEL_METRIC_VALUES_INDEX_LABEL_NAME), "index").to_string();

    let raw_values: Vec<&str> = labels
        .get(LABEL_METRIC_VALUES)
        .trim()
        .split(separator)
        .collect();
    let raw_indexes: Vec<&str> = labels
        .get(LABEL_METRIC_VALUES_INDEX)
        .trim()
        .split(index_separator)
        .collect();
    if raw_values.len() != raw_indexes.len() {
        return (
            Vec::new(),
            vec![CollectorError::ValuesLengthMismatch {
                values: raw_values.len(),
                indexes: raw_indexes.len(),
            }],
        );
    }

    let mut observations = Vec::new();
    let mut errors = Vec::new();
    for (raw, index) in raw_values.iter().zip(&raw_indexes) {
        match scalar_value(raw) {
            Ok(value) => {
                let mut obs_labels = exported.clone();
                obs_labels.append(index_label.clone(), (*index).to_string());
                observations.push(Observation {
                    metric_type,
                    name: name.to_string(),
                    help: help.to_string(),
                    labels: obs_labels.exported(),
                    value,
                    buckets: buckets.to_vec(),
                    timestamp,
                });
            }
            Err(err) => errors.push(err),
        }
    }
    (observations, errors)
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

/// Resolve `namespace_subsystem_name`, sanitised.
fn resolve_name(labels: &Labels) -> Result<String> {
    let name = sanitize_name(labels.get(LABEL_METRIC_NAME));
    if name.is_empty() {
        return Err(CollectorError::InvalidName(name));
    }
    let fq = [
        labels.get(LABEL_METRIC_NAMESPACE),
        labels.get(LABEL_METRIC_SUBSYSTEM),
        &name,
    ]
    .iter()
    .filter(|part| !part.is_empty())
    .copied()
    .collect::<Vec<_>>()
    .join("_");
    if !is_valid_metric_name(&fq) {
        return Err(CollectorError::InvalidName(fq));
    }
    Ok(fq)
}

/// Decode a scalar token: empty counts as 1, booleans map to 1/0.
fn scalar_value(raw: &str) -> Result<f64> {
    let raw = raw.trim();
    match raw {
        "" | "true" => Ok(1.0),
        "false" => Ok(0.0),
        other => other
            .parse::<f64>()
            .map_err(|_| CollectorError::InvalidValue(other.to_string())),
    }
}

/// Comma-separated bucket bounds, `[…]` brackets tolerated, `+Inf`
/// appended.
fn parse_buckets(raw: &str) -> Result<Vec<f64>> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed)
        .trim();
    if trimmed.is_empty() {
        return Err(CollectorError::InvalidBuckets("bucket length == 0".into()));
    }
    let mut buckets = Vec::new();
    for token in trimmed.split(',') {
        let token = token.trim();
        buckets.push(
            token
                .parse::<f64>()
                .map_err(|err| CollectorError::InvalidBuckets(format!("{token:?}: {err}")))?,
        );
    }
    buckets.push(f64::INFINITY);
    Ok(buckets)
}

/// Parse `__time__` under the magnitude rules, falling back to
/// `__time_format__` or RFC 3339.
fn parse_time(labels: &Labels) -> Option<DateTime<Utc>> {
    let raw = labels.get(LABEL_METRIC_TIME);
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = raw.parse::<i64>() {
        return if ts >= 1_000_000_000_000_000 {
            DateTime::from_timestamp_micros(ts)
        } else if ts >= 1_000_000_000_000 {
            DateTime::from_timestamp_millis(ts)
        } else {
            DateTime::from_timestamp(ts, 0)
        };
    }
    let format = labels.get(LABEL_METRIC_TIME_FORMAT);
    if format.is_empty() {
        return DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_str(raw, format) {
        return Some(t.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, format)
        .ok()
        .map(|t| t.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Label;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        Labels::from_labels(pairs.iter().map(|(n, v)| Label::new(*n, *v)))
    }

    #[test]
    fn test_scalar_gauge() {
        let ls = labels(&[("__name__", "cpu"), ("__value__", "16"), ("host", "a")]);
        let (obs, errs) = build_observations(MetricType::Gauge, &ls);
        assert!(errs.is_empty());
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].name, "cpu");
        assert_eq!(obs[0].value, 16.0);
        assert_eq!(obs[0].labels.keys(), vec!["host"]);
    }

    #[test]
    fn test_missing_value_counts_as_one() {
        let ls = labels(&[("__name__", "seen")]);
        let (obs, errs) = build_observations(MetricType::Counter, &ls);
        assert!(errs.is_empty());
        assert_eq!(obs[0].value, 1.0);
    }

    #[test]
    fn test_bool_values() {
        let ls = labels(&[("__name__", "up"), ("__value__", "false")]);
        let (obs, _) = build_observations(MetricType::Gauge, &ls);
        assert_eq!(obs[0].value, 0.0);
    }

    #[test]
    fn test_namespace_and_subsystem_prefix() {
        let ls = labels(&[
            ("__name__", "hour"),
            ("__namespace__", "weather"),
            ("__subsystem__", "temperature"),
            ("__value__", "16"),
        ]);
        let (obs, _) = build_observations(MetricType::Gauge, &ls);
        assert_eq!(obs[0].name, "weather_temperature_hour");
    }

    #[test]
    fn test_invalid_name_fails() {
        let ls = labels(&[("__value__", "1")]);
        let (obs, errs) = build_observations(MetricType::Gauge, &ls);
        assert!(obs.is_empty());
        assert!(matches!(errs[0], CollectorError::InvalidName(_)));
    }

    #[test]
    fn test_vector_expansion() {
        let ls = labels(&[
            ("__name__", "trx"),
            ("__values__", "101 200 300 90 30"),
            ("__values_index__", "a b c d e"),
            ("__values_index_label_name__", "type"),
        ]);
        let (obs, errs) = build_observations(MetricType::Gauge, &ls);
        assert!(errs.is_empty());
        assert_eq!(obs.len(), 5);
        assert_eq!(obs[0].value, 101.0);
        assert_eq!(obs[0].labels.get("type"), "a");
        assert_eq!(obs[4].labels.get("type"), "e");
    }

    #[test]
    fn test_vector_length_mismatch_single_error() {
        let ls = labels(&[
            ("__name__", "trx"),
            ("__values__", "1 2 3"),
            ("__values_index__", "a b"),
        ]);
        let (obs, errs) = build_observations(MetricType::Gauge, &ls);
        assert!(obs.is_empty());
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0], CollectorError::ValuesLengthMismatch { .. }));
    }

    #[test]
    fn test_vector_partial_errors_keep_siblings() {
        let ls = labels(&[
            ("__name__", "trx"),
            ("__values__", "1 oops 3"),
            ("__values_index__", "a b c"),
        ]);
        let (obs, errs) = build_observations(MetricType::Gauge, &ls);
        assert_eq!(obs.len(), 2);
        assert_eq!(errs.len(), 1);
    }

    #[test]
    fn test_histogram_requires_buckets() {
        let ls = labels(&[("__name__", "lat"), ("__value__", "0.2")]);
        let (obs, errs) = build_observations(MetricType::Histogram, &ls);
        assert!(obs.is_empty());
        assert!(matches!(errs[0], CollectorError::InvalidBuckets(_)));

        let ls = labels(&[
            ("__name__", "lat"),
            ("__value__", "0.2"),
            ("__buckets__", "0.1, 0.5, 1"),
        ]);
        let (obs, errs) = build_observations(MetricType::Histogram, &ls);
        assert!(errs.is_empty());
        assert_eq!(obs[0].buckets, vec![0.1, 0.5, 1.0, f64::INFINITY]);
    }

    #[test]
    fn test_time_magnitude_thresholds() {
        let at = |raw: &str| {
            let ls = labels(&[("__name__", "t"), ("__time__", raw)]);
            build_observations(MetricType::Gauge, &ls).0[0]
                .timestamp
                .unwrap()
                .timestamp_millis()
        };
        // Boundary values use the smaller unit.
        assert_eq!(at("999999999999"), 999_999_999_999_000);
        assert_eq!(at("1000000000000"), 1_000_000_000_000);
        assert_eq!(at("999999999999999"), 999_999_999_999_999);
        assert_eq!(at("1000000000000000"), 1_000_000_000_000);
    }

    #[test]
    fn test_time_rfc3339_and_custom_format() {
        let ls = labels(&[("__name__", "t"), ("__time__", "2024-05-01T10:00:00Z")]);
        let (obs, _) = build_observations(MetricType::Gauge, &ls);
        assert!(obs[0].timestamp.is_some());

        let ls = labels(&[
            ("__name__", "t"),
            ("__time__", "2024/05/01 10:00"),
            ("__time_format__", "%Y/%m/%d %H:%M"),
        ]);
        let (obs, _) = build_observations(MetricType::Gauge, &ls);
        assert!(obs[0].timestamp.is_some());

        let ls = labels(&[("__name__", "t"), ("__time__", "not a time")]);
        let (obs, _) = build_observations(MetricType::Gauge, &ls);
        assert!(obs[0].timestamp.is_none());
    }

    #[test]
    fn test_relabel_backfills_rule_name() {
        let mc: MetricConfig = serde_yaml::from_str("{name: My-Rule.Name}").unwrap();
        let ls = labels(&[("name", "My-Rule.Name"), ("v", "1")]);
        let out = mc.relabel(&[], ls).unwrap().unwrap();
        assert_eq!(out.get(LABEL_METRIC_NAME), "my_rule_name");
        assert!(!out.has("name"));
    }

    #[test]
    fn test_relabel_keeps_unrelated_name_label() {
        let mc: MetricConfig = serde_yaml::from_str("{name: rule}").unwrap();
        let ls = labels(&[("name", "server5")]);
        let out = mc.relabel(&[], ls).unwrap().unwrap();
        assert_eq!(out.get("name"), "server5");
        assert_eq!(out.get(LABEL_METRIC_NAME), "rule");
    }
}
