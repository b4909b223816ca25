//! Collect groups: a data format, datasources, metric rules and the
//! relabel configs shared by all of them.

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::datasource::{Datasource, ReadMode};
use crate::error::Result;
use crate::labels::Labels;
use crate::metric::{build_observations, MetricConfig, Observation};
use crate::relabel::{RelabelConfig, RelabelConfigs};
use crate::telemetry;

/// The extraction format shared by a collect's metric rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    /// Regular expressions with named capture groups.
    Regex,
    /// JSON path selectors.
    Json,
    /// XML path selectors and element templates.
    Xml,
    /// YAML, transcoded to JSON first.
    Yaml,
}

/// A named group of datasources and metric rules.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Collect {
    /// Collect name; routes `/{name}/metrics`.
    pub name: String,
    /// Extraction format for every rule in this collect.
    pub data_format: DataFormat,
    /// Relabel configs applied before datasource- and rule-level ones.
    #[serde(default)]
    pub relabel_configs: RelabelConfigs,
    /// The datasources feeding this collect.
    #[serde(default)]
    pub datasource: Vec<Datasource>,
    /// The metric rules run against every record.
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

impl Collect {
    /// Compile every datasource and metric rule.
    pub fn compile(&mut self) -> Result<()> {
        for ds in &mut self.datasource {
            ds.compile()?;
        }
        for mc in &mut self.metrics {
            mc.compile(self.data_format)?;
        }
        Ok(())
    }

    /// The merged relabel pipeline for one rule: collect, then
    /// datasource, then rule level.
    fn merged_relabels(&self, ds: &Datasource, mc: &MetricConfig) -> Vec<RelabelConfig> {
        self.relabel_configs
            .iter()
            .chain(&ds.relabel_configs)
            .chain(&mc.relabel_configs)
            .cloned()
            .collect()
    }

    /// Run every metric rule over one record and return the resulting
    /// observations. Extraction, relabel and build failures are counted
    /// and logged here; they never escape.
    pub fn process_record(&self, ds: &Datasource, data: &[u8]) -> Vec<Observation> {
        let mut observations = Vec::new();
        for mc in &self.metrics {
            let rules = self.merged_relabels(ds, mc);
            for dp in mc.datapoints(self.data_format, data) {
                let mut labels = Labels::new();
                labels.append("name", mc.name.clone());
                for (field, value) in dp {
                    labels.append(field, value);
                }
                let relabeled = match mc.relabel(&rules, labels) {
                    Ok(Some(relabeled)) => relabeled,
                    Ok(None) => continue,
                    Err(err) => {
                        telemetry::inc_collect_error("metric", &mc.name);
                        warn!(collect = %self.name, metric = %mc.name, %err, "failed to relabel");
                        continue;
                    }
                };
                debug!(collect = %self.name, metric = %mc.name, labels = %relabeled, "relabeled datapoint");
                let (built, errors) = build_observations(mc.metric_type, &relabeled);
                for err in errors {
                    telemetry::inc_collect_error("metric", &mc.name);
                    warn!(collect = %self.name, metric = %mc.name, %err, "failed to build metric");
                }
                observations.extend(built);
            }
        }
        observations
    }

    /// Acquire one non-stream datasource and send its observations.
    ///
    /// # Errors
    ///
    /// Returns acquisition errors; the caller counts them against the
    /// datasource.
    pub async fn collect_datasource(
        &self,
        ds: &Datasource,
        url_override: Option<&str>,
        tx: mpsc::Sender<Observation>,
    ) -> Result<()> {
        match ds.read_mode {
            ReadMode::Full => {
                let data = ds.read_all(url_override).await?;
                for obs in self.process_record(ds, &data) {
                    if tx.send(obs).await.is_err() {
                        break;
                    }
                }
            }
            ReadMode::Line => {
                let mut stream = ds.open_line_stream(url_override).await?;
                while let Some(line) = stream.next_line().await? {
                    if line.is_empty() {
                        continue;
                    }
                    for obs in self.process_record(ds, &line) {
                        if tx.send(obs).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
            // Stream datasources feed the aggregation store, not scrapes.
            ReadMode::Stream => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LABEL_METRIC_NAME;

    fn collect(yaml: &str) -> Collect {
        let mut c: Collect = serde_yaml::from_str(yaml).unwrap();
        c.compile().unwrap();
        c
    }

    #[test]
    fn test_process_record_end_to_end() {
        let c = collect(
            r"
name: nodes
data_format: regex
datasource:
  - {name: src, url: 'file:///dev/null'}
metrics:
  - name: node_cpu
    match:
      datapoint: 'cpu=(?P<cpu>\d+) host=(?P<host>\w+)'
    relabel_configs:
      - {source_labels: [cpu], target_label: __value__}
",
        );
        let ds = &c.datasource[0];
        let obs = c.process_record(ds, b"cpu=12 host=a\ncpu=14 host=b");
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0].name, "node_cpu");
        assert_eq!(obs[0].value, 12.0);
        assert_eq!(obs[0].labels.get("host"), "a");
        assert_eq!(obs[1].value, 14.0);
    }

    #[test]
    fn test_relabel_levels_merge_in_order() {
        let c = collect(
            r"
name: g
data_format: regex
relabel_configs:
  - {target_label: level, replacement: collect}
datasource:
  - name: src
    url: 'file:///dev/null'
    relabel_configs:
      - {target_label: level, replacement: datasource}
metrics:
  - name: m
    relabel_configs:
      - {target_label: level, replacement: metric}
",
        );
        let ds = &c.datasource[0];
        let obs = c.process_record(ds, b"anything");
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].labels.get("level"), "metric");
        assert_eq!(obs[0].name, "m");
    }

    #[test]
    fn test_dropped_datapoint_produces_nothing() {
        let c = collect(
            r"
name: g
data_format: regex
metrics:
  - name: m
    relabel_configs:
      - {source_labels: [__line__], regex: '.*skip.*', action: drop}
datasource:
  - {name: src, url: 'file:///dev/null'}
",
        );
        let ds = &c.datasource[0];
        assert!(c.process_record(ds, b"please skip me").is_empty());
        assert_eq!(c.process_record(ds, b"keep me").len(), 1);
    }

    #[test]
    fn test_rule_name_becomes_metric_name() {
        let c = collect(
            "
name: g
data_format: regex
metrics:
  - {name: Plain-Rule}
datasource:
  - {name: src, url: 'file:///dev/null'}
",
        );
        let ds = &c.datasource[0];
        let obs = c.process_record(ds, b"x");
        assert_eq!(obs[0].name, "plain_rule");
        assert!(!obs[0].labels.has(LABEL_METRIC_NAME));
    }
}
