//! Rendering samples in the Prometheus text format.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::labels::Labels;
use crate::metric::{MetricType, Observation};

/// The value part of a rendered sample.
#[derive(Debug, Clone)]
pub enum SampleValue {
    /// A plain gauge/counter value.
    Single(f64),
    /// A histogram snapshot: cumulative bucket counts, sum and count.
    Histogram {
        /// `(upper bound, cumulative count)` pairs, ending at `+Inf`.
        buckets: Vec<(f64, u64)>,
        /// Sum of observed values.
        sum: f64,
        /// Total number of observations.
        count: u64,
    },
}

/// A sample ready for the text format.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Fully-qualified metric name.
    pub name: String,
    /// Help string, possibly empty.
    pub help: String,
    /// Metric kind for the `# TYPE` line.
    pub metric_type: MetricType,
    /// Exported labels.
    pub labels: Labels,
    /// The value(s).
    pub value: SampleValue,
    /// Optional timestamp in milliseconds since the epoch.
    pub timestamp_ms: Option<i64>,
}

impl From<Observation> for Sample {
    fn from(obs: Observation) -> Self {
        let value = match obs.metric_type {
            MetricType::Histogram => {
                let buckets = obs
                    .buckets
                    .iter()
                    .map(|bound| (*bound, u64::from(obs.value <= *bound)))
                    .collect();
                SampleValue::Histogram {
                    buckets,
                    sum: obs.value,
                    count: 1,
                }
            }
            _ => SampleValue::Single(obs.value),
        };
        Sample {
            name: obs.name,
            help: obs.help,
            metric_type: obs.metric_type,
            labels: obs.labels,
            value,
            timestamp_ms: obs.timestamp.map(|t| t.timestamp_millis()),
        }
    }
}

/// Render samples grouped into families, each with one `# HELP`/`# TYPE`
/// header. Families are ordered by name; samples keep their order within
/// a family.
#[must_use]
pub fn render(samples: &[Sample]) -> String {
    let mut families: BTreeMap<&str, Vec<&Sample>> = BTreeMap::new();
    for sample in samples {
        families.entry(&sample.name).or_default().push(sample);
    }

    let mut out = String::new();
    for (name, group) in families {
        let first = group[0];
        if !first.help.is_empty() {
            let _ = writeln!(out, "# HELP {name} {}", escape_help(&first.help));
        }
        let _ = writeln!(out, "# TYPE {name} {}", first.metric_type.as_str());
        for sample in group {
            render_sample(&mut out, name, sample);
        }
    }
    out
}

fn render_sample(out: &mut String, name: &str, sample: &Sample) {
    match &sample.value {
        SampleValue::Single(value) => {
            let _ = write!(out, "{name}{}", format_labels(&sample.labels, None));
            let _ = write!(out, " {}", format_value(*value));
            finish_line(out, sample.timestamp_ms);
        }
        SampleValue::Histogram {
            buckets,
            sum,
            count,
        } => {
            for (bound, cumulative) in buckets {
                let le = if bound.is_infinite() {
                    "+Inf".to_string()
                } else {
                    format_value(*bound)
                };
                let _ = write!(
                    out,
                    "{name}_bucket{} {cumulative}",
                    format_labels(&sample.labels, Some(("le", &le)))
                );
                finish_line(out, sample.timestamp_ms);
            }
            let _ = write!(
                out,
                "{name}_sum{} {}",
                format_labels(&sample.labels, None),
                format_value(*sum)
            );
            finish_line(out, sample.timestamp_ms);
            let _ = write!(
                out,
                "{name}_count{} {count}",
                format_labels(&sample.labels, None)
            );
            finish_line(out, sample.timestamp_ms);
        }
    }
}

fn finish_line(out: &mut String, timestamp_ms: Option<i64>) {
    if let Some(ts) = timestamp_ms {
        let _ = write!(out, " {ts}");
    }
    out.push('\n');
}

fn format_labels(labels: &Labels, extra: Option<(&str, &str)>) -> String {
    let mut parts: Vec<String> = labels
        .iter()
        .map(|l| format!("{}=\"{}\"", l.name, escape_value(&l.value)))
        .collect();
    if let Some((name, value)) = extra {
        parts.push(format!("{name}=\"{}\"", escape_value(value)));
        parts.sort();
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", parts.join(","))
    }
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "+Inf" } else { "-Inf" }.to_string()
    } else {
        value.to_string()
    }
}

fn escape_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Label;

    fn sample(name: &str, labels: &[(&str, &str)], value: f64) -> Sample {
        Sample {
            name: name.to_string(),
            help: String::new(),
            metric_type: MetricType::Gauge,
            labels: Labels::from_labels(labels.iter().map(|(n, v)| Label::new(*n, *v))),
            value: SampleValue::Single(value),
            timestamp_ms: None,
        }
    }

    #[test]
    fn test_render_simple_family() {
        let mut s = sample("cpu_usage", &[("host", "a")], 0.5);
        s.help = "CPU usage.".to_string();
        let body = render(&[s]);
        assert_eq!(
            body,
            "# HELP cpu_usage CPU usage.\n# TYPE cpu_usage gauge\ncpu_usage{host=\"a\"} 0.5\n"
        );
    }

    #[test]
    fn test_families_share_one_header() {
        let body = render(&[
            sample("m", &[("a", "1")], 1.0),
            sample("m", &[("a", "2")], 2.0),
        ]);
        assert_eq!(body.matches("# TYPE m gauge").count(), 1);
        assert!(body.contains("m{a=\"1\"} 1\n"));
        assert!(body.contains("m{a=\"2\"} 2\n"));
    }

    #[test]
    fn test_no_labels_renders_bare_name() {
        let body = render(&[sample("up", &[], 1.0)]);
        assert!(body.contains("\nup 1\n"));
    }

    #[test]
    fn test_label_escaping() {
        let body = render(&[sample("m", &[("p", "a\"b\\c\nd")], 1.0)]);
        assert!(body.contains(r#"p="a\"b\\c\nd""#));
    }

    #[test]
    fn test_timestamp_suffix() {
        let mut s = sample("m", &[], 3.0);
        s.timestamp_ms = Some(1_700_000_000_123);
        let body = render(&[s]);
        assert!(body.contains("m 3 1700000000123\n"));
    }

    #[test]
    fn test_histogram_observation_rendering() {
        let obs = Observation {
            metric_type: MetricType::Histogram,
            name: "lat".to_string(),
            help: String::new(),
            labels: Labels::new(),
            value: 0.3,
            buckets: vec![0.1, 0.5, f64::INFINITY],
            timestamp: None,
        };
        let body = render(&[obs.into()]);
        assert!(body.contains("lat_bucket{le=\"0.1\"} 0\n"));
        assert!(body.contains("lat_bucket{le=\"0.5\"} 1\n"));
        assert!(body.contains("lat_bucket{le=\"+Inf\"} 1\n"));
        assert!(body.contains("lat_sum 0.3\n"));
        assert!(body.contains("lat_count 1\n"));
    }
}
