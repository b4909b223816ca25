//! Turning raw bytes into datapoints.
//!
//! A datapoint is a bag of string fields extracted from one source
//! fragment. The reserved field `__line__` holds the fragment itself and
//! is what label patterns run against.

use std::collections::BTreeMap;
use std::sync::Arc;

use minijinja::value::Value as TemplateValue;
use serde_json::Value;
use tracing::{debug, error};

use crate::collect::DataFormat;
use crate::jsonpath::value_to_string;
use crate::labels::LABEL_LINE;
use crate::metric::{CompiledMatch, MetricConfig};
use crate::telemetry;
use crate::xmlpath::{ElementContext, ElementNode};

/// A bag of extracted string fields.
pub type Datapoint = BTreeMap<String, String>;

impl MetricConfig {
    /// Extract datapoints from `data` according to the collect's format.
    ///
    /// Parse failures are counted against this rule and yield zero
    /// datapoints; they never abort the scrape.
    #[must_use]
    pub fn datapoints(&self, format: DataFormat, data: &[u8]) -> Vec<Datapoint> {
        match format {
            DataFormat::Regex => self.datapoints_by_regex(data),
            DataFormat::Json => match serde_json::from_slice::<Value>(data) {
                Ok(root) => self.datapoints_by_json(&root),
                Err(err) => {
                    telemetry::inc_collect_error("metric", &self.name);
                    error!(metric = %self.name, %err, "failed to parse json data");
                    Vec::new()
                }
            },
            DataFormat::Xml => self.datapoints_by_xml(data),
            DataFormat::Yaml => match serde_yaml::from_slice::<serde_yaml::Value>(data) {
                Ok(root) => self.datapoints_by_json(&yaml_to_json(root)),
                Err(err) => {
                    telemetry::inc_collect_error("metric", &self.name);
                    error!(metric = %self.name, %err, "failed to parse yaml data");
                    Vec::new()
                }
            },
        }
    }

    fn datapoints_by_regex(&self, data: &[u8]) -> Vec<Datapoint> {
        let Some(CompiledMatch::Regex { datapoint, labels }) = &self.match_.compiled else {
            return Vec::new();
        };
        let text = String::from_utf8_lossy(data);

        let mut datapoints = Vec::new();
        if let Some(re) = datapoint {
            let has_names = re.capture_names().flatten().next().is_some();
            for caps in re.captures_iter(&text) {
                let whole = caps.get(0).map_or("", |m| m.as_str());
                let mut dp = Datapoint::new();
                dp.insert(LABEL_LINE.to_string(), whole.to_string());
                if has_names {
                    for name in re.capture_names().flatten() {
                        let value = caps.name(name).map_or("", |m| m.as_str());
                        dp.insert(name.to_string(), value.to_string());
                    }
                }
                datapoints.push(dp);
            }
            debug!(metric = %self.name, pattern = %re, count = datapoints.len(), "datapoint match by regex");
        } else {
            let mut dp = Datapoint::new();
            dp.insert(LABEL_LINE.to_string(), text.into_owned());
            datapoints.push(dp);
        }

        for dp in &mut datapoints {
            let line = dp.get(LABEL_LINE).cloned().unwrap_or_default();
            for (name, re) in labels {
                let Some(caps) = re.captures(&line) else {
                    continue;
                };
                if re.captures_len() > 1 {
                    // Only a capture group named like the label counts.
                    if re.capture_names().flatten().any(|n| n == name.as_str()) {
                        if let Some(m) = caps.name(name) {
                            dp.insert(name.clone(), m.as_str().to_string());
                        }
                    }
                } else if let Some(m) = caps.get(0) {
                    dp.insert(name.clone(), m.as_str().to_string());
                }
            }
        }
        datapoints
    }

    fn datapoints_by_json(&self, root: &Value) -> Vec<Datapoint> {
        let Some(CompiledMatch::Json { datapoint, labels }) = &self.match_.compiled else {
            return Vec::new();
        };
        let Some(selected) = datapoint.select(root) else {
            return Vec::new();
        };
        let elements: Vec<Value> = match selected {
            Value::Array(items) => items,
            other => vec![other],
        };

        let mut datapoints = Vec::new();
        for element in elements {
            let mut dp = Datapoint::new();
            dp.insert(LABEL_LINE.to_string(), value_to_string(&element));
            if let Value::Object(fields) = &element {
                for (key, value) in fields {
                    dp.insert(key.clone(), value_to_string(value));
                }
            }
            for (name, selector) in labels {
                if let Some(value) = selector.select(&element) {
                    let value = value_to_string(&value);
                    if !value.is_empty() {
                        dp.insert(name.clone(), value);
                    }
                }
            }
            datapoints.push(dp);
        }
        datapoints
    }

    fn datapoints_by_xml(&self, data: &[u8]) -> Vec<Datapoint> {
        let Some(CompiledMatch::Xml { datapoint, labels }) = &self.match_.compiled else {
            return Vec::new();
        };
        let text = String::from_utf8_lossy(data);
        let doc = match roxmltree::Document::parse(&text) {
            Ok(doc) => doc,
            Err(err) => {
                telemetry::inc_collect_error("metric", &self.name);
                error!(metric = %self.name, %err, "failed to parse xml data");
                return Vec::new();
            }
        };

        let elements: Vec<Arc<ElementNode>> = match datapoint {
            Some(path) => path.find_in_document(&doc),
            None => vec![ElementNode::from_xml(doc.root_element())],
        };

        let mut datapoints = Vec::new();
        for element in elements {
            let mut dp = Datapoint::new();
            dp.insert(LABEL_LINE.to_string(), element.text.clone());
            for (name, template) in labels {
                let ctx = minijinja::context! {
                    text => element.text.clone(),
                    attrs => element.attrs.clone(),
                    el => TemplateValue::from_object(ElementContext(element.clone())),
                };
                match template.render(ctx) {
                    Ok(value) if !value.is_empty() => {
                        dp.insert(name.clone(), value);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        telemetry::inc_collect_error("metric", &self.name);
                        error!(metric = %self.name, label = %name, %err, "failed to execute label template");
                    }
                }
            }
            datapoints.push(dp);
        }
        datapoints
    }
}

/// Transcode a YAML value into JSON: mappings become objects, sequences
/// arrays; mapping keys are stringified.
#[must_use]
pub fn yaml_to_json(value: serde_yaml::Value) -> Value {
    match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map_or(Value::Null, Value::Number)
            }
        }
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(items) => {
            Value::Array(items.into_iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                let key = match key {
                    serde_yaml::Value::String(s) => s,
                    other => value_to_string(&yaml_to_json(other)),
                };
                out.insert(key, yaml_to_json(value));
            }
            Value::Object(out)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricConfig;

    fn rule(format: DataFormat, yaml: &str) -> MetricConfig {
        let mut mc: MetricConfig = serde_yaml::from_str(yaml).unwrap();
        mc.compile(format).unwrap();
        mc
    }

    #[test]
    fn test_regex_named_groups() {
        let mc = rule(
            DataFormat::Regex,
            r"{name: node, match: {datapoint: '@\[(?P<name>[^\[]+)\]/cpu=(?P<cpu>\d+)'}}",
        );
        let dps = mc.datapoints(DataFormat::Regex, b"@[server5]/cpu=12 @[server6]/cpu=13");
        assert_eq!(dps.len(), 2);
        assert_eq!(dps[0]["name"], "server5");
        assert_eq!(dps[0]["cpu"], "12");
        assert_eq!(dps[1]["name"], "server6");
        assert!(dps[0][LABEL_LINE].starts_with("@[server5]"));
    }

    #[test]
    fn test_regex_without_named_groups_only_line() {
        let mc = rule(DataFormat::Regex, "{name: raw, match: {datapoint: 'cpu=[0-9]+'}}");
        let dps = mc.datapoints(DataFormat::Regex, b"cpu=12 cpu=14");
        assert_eq!(dps.len(), 2);
        assert_eq!(dps[0].len(), 1);
        assert_eq!(dps[0][LABEL_LINE], "cpu=12");
    }

    #[test]
    fn test_regex_empty_pattern_is_whole_input() {
        let mc = rule(DataFormat::Regex, "{name: whole}");
        let dps = mc.datapoints(DataFormat::Regex, b"anything at all");
        assert_eq!(dps.len(), 1);
        assert_eq!(dps[0][LABEL_LINE], "anything at all");
    }

    #[test]
    fn test_regex_label_patterns() {
        let mc = rule(
            DataFormat::Regex,
            r"{name: n, match: {datapoint: '.+', labels: {ip: 'ip=(?P<ip>[\d.]+)', raw_host: 'hostname=\w+'}}}",
        );
        let dps = mc.datapoints(DataFormat::Regex, b"ip=3.3.3.3/hostname=database2");
        assert_eq!(dps[0]["ip"], "3.3.3.3");
        assert_eq!(dps[0]["raw_host"], "hostname=database2");
    }

    #[test]
    fn test_json_array_elements() {
        let mc = rule(
            DataFormat::Json,
            "{name: n, match: {datapoint: 'servers', labels: {addr: 'net.ip'}}}",
        );
        let data = br#"{"servers": [{"name": "a", "net": {"ip": "1.1.1.1"}}, {"name": "b", "net": {"ip": "2.2.2.2"}}]}"#;
        let dps = mc.datapoints(DataFormat::Json, data);
        assert_eq!(dps.len(), 2);
        assert_eq!(dps[0]["name"], "a");
        assert_eq!(dps[0]["addr"], "1.1.1.1");
        assert_eq!(dps[1]["addr"], "2.2.2.2");
    }

    #[test]
    fn test_json_single_object_is_one_datapoint() {
        let mc = rule(DataFormat::Json, "{name: n, match: {datapoint: 'server'}}");
        let dps = mc.datapoints(DataFormat::Json, br#"{"server": {"cpu": 16}}"#);
        assert_eq!(dps.len(), 1);
        assert_eq!(dps[0]["cpu"], "16");
    }

    #[test]
    fn test_json_invalid_input_yields_nothing() {
        let mc = rule(DataFormat::Json, "{name: n}");
        assert!(mc.datapoints(DataFormat::Json, b"{not json").is_empty());
    }

    #[test]
    fn test_xml_elements_and_templates() {
        let mc = rule(
            DataFormat::Xml,
            "{name: n, match: {datapoint: \"//china[@dn='hour']/weather/city\", labels: {__value__: '{{ text }}', name: '{{ attrs.quName }}'}}}",
        );
        let data = "<root><china dn=\"hour\"><weather><city quName=\"吉林\">16</city></weather></china></root>";
        let dps = mc.datapoints(DataFormat::Xml, data.as_bytes());
        assert_eq!(dps.len(), 1);
        assert_eq!(dps[0]["__value__"], "16");
        assert_eq!(dps[0]["name"], "吉林");
        assert_eq!(dps[0][LABEL_LINE], "16");
    }

    #[test]
    fn test_xml_parse_failure_yields_nothing() {
        let mc = rule(DataFormat::Xml, "{name: n, match: {datapoint: '//a'}}");
        assert!(mc.datapoints(DataFormat::Xml, b"<broken").is_empty());
    }

    #[test]
    fn test_yaml_transcoding() {
        let mc = rule(
            DataFormat::Yaml,
            "{name: n, match: {datapoint: 'services', labels: {port: 'listen.port'}}}",
        );
        let data = b"services:\n  - name: web\n    listen: {port: 80}\n  - name: db\n    listen: {port: 5432}\n";
        let dps = mc.datapoints(DataFormat::Yaml, data);
        assert_eq!(dps.len(), 2);
        assert_eq!(dps[0]["port"], "80");
        assert_eq!(dps[1]["name"], "db");
    }
}
