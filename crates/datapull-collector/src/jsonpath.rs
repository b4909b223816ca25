//! Path selectors over JSON values.
//!
//! A selector is a sequence of stages separated by `|`. A stage is either
//! a dotted key path (array elements addressed by number) or one of the
//! modifiers `@to_entries`, `@drill_down` and `@expand`.

use serde_json::{Map, Value};

use crate::error::{CollectorError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Stage {
    Path(Vec<String>),
    ToEntries { key_name: String, val_name: String },
    DrillDown { path_name: String },
    Expand,
}

/// A compiled selector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JsonSelector {
    stages: Vec<Stage>,
    original: String,
}

impl JsonSelector {
    /// Parse a selector. The empty string selects the root value.
    pub fn parse(selector: &str) -> Result<Self> {
        let mut stages = Vec::new();
        for raw_stage in selector.split('|') {
            let stage = raw_stage.trim();
            if stage.is_empty() {
                if selector.trim().is_empty() {
                    continue;
                }
                return Err(CollectorError::InvalidSelector(selector.to_string()));
            }
            if let Some(modifier) = stage.strip_prefix('@') {
                let (name, arg) = split_once(modifier, ':');
                match name {
                    "to_entries" => {
                        let (key_name, val_name) = entry_names(arg);
                        stages.push(Stage::ToEntries { key_name, val_name });
                    }
                    "drill_down" => {
                        let path_name = if arg.is_empty() { "path" } else { arg };
                        stages.push(Stage::DrillDown {
                            path_name: path_name.to_string(),
                        });
                    }
                    "expand" => stages.push(Stage::Expand),
                    _ => return Err(CollectorError::InvalidSelector(selector.to_string())),
                }
            } else {
                let segments: Vec<String> = stage.split('.').map(str::to_string).collect();
                if segments.iter().any(String::is_empty) {
                    return Err(CollectorError::InvalidSelector(selector.to_string()));
                }
                stages.push(Stage::Path(segments));
            }
        }
        Ok(Self {
            stages,
            original: selector.to_string(),
        })
    }

    /// The selector text as written in the configuration.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Evaluate against `root`. `None` means the path selected nothing.
    #[must_use]
    pub fn select(&self, root: &Value) -> Option<Value> {
        let mut current = root.clone();
        for stage in &self.stages {
            current = match stage {
                Stage::Path(segments) => walk(&current, segments)?,
                Stage::ToEntries { key_name, val_name } => {
                    to_entries(&current, key_name, val_name)
                }
                Stage::DrillDown { path_name } => drill_down(&current, path_name),
                Stage::Expand => expand(&current),
            };
        }
        Some(current)
    }
}

fn split_once(s: &str, sep: char) -> (&str, &str) {
    match s.split_once(sep) {
        Some((prefix, suffix)) => (prefix, suffix),
        None => (s, ""),
    }
}

fn entry_names(arg: &str) -> (String, String) {
    let (key, val) = split_once(arg, ':');
    if key == val {
        ("key".to_string(), "value".to_string())
    } else if key.is_empty() {
        ("key".to_string(), val.to_string())
    } else if val.is_empty() {
        (key.to_string(), "value".to_string())
    } else {
        (key.to_string(), val.to_string())
    }
}

fn walk(value: &Value, segments: &[String]) -> Option<Value> {
    let mut current = value;
    for seg in segments {
        current = match current {
            Value::Array(items) => {
                let idx: usize = seg.parse().ok()?;
                items.get(idx)?
            }
            Value::Object(map) => map.get(seg)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Convert an object into an array of `{key, value}` entries. `-` as the
/// key name spreads the value; `-` as the value name keeps only the key.
fn to_entries(value: &Value, key_name: &str, val_name: &str) -> Value {
    let Value::Object(map) = value else {
        return value.clone();
    };
    let entries: Vec<Value> = map
        .iter()
        .map(|(k, v)| {
            if key_name == "-" {
                v.clone()
            } else if val_name == "-" {
                Value::String(k.clone())
            } else {
                let mut entry = Map::new();
                entry.insert(key_name.to_string(), Value::String(k.clone()));
                entry.insert(val_name.to_string(), v.clone());
                Value::Object(entry)
            }
        })
        .collect();
    Value::Array(entries)
}

/// Promote object-valued children to a top-level array, recording the
/// parent key under `path_name` (appended when already present).
fn drill_down(value: &Value, path_name: &str) -> Value {
    let children: Vec<(String, &Value)> = match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        _ => return Value::Array(Vec::new()),
    };

    let mut out = Vec::new();
    for (key, child) in children {
        let Value::Object(fields) = child else {
            continue;
        };
        let mut fields = fields.clone();
        let path = match fields.remove(path_name) {
            Some(existing) => append_path(existing, &key),
            None => Value::String(key),
        };
        fields.insert(path_name.to_string(), path);
        out.push(Value::Object(fields));
    }
    Value::Array(out)
}

fn append_path(existing: Value, path: &str) -> Value {
    match existing {
        Value::Array(mut items) => {
            items.push(Value::String(path.to_string()));
            Value::Array(items)
        }
        other => Value::String(format!("{}.{}", value_to_string(&other), path)),
    }
}

/// Flatten one level of nesting into `parent.child` keys. Children that
/// are not objects are dropped.
fn expand(value: &Value) -> Value {
    let children: Vec<(String, &Value)> = match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        _ => return Value::Object(Map::new()),
    };

    let mut out = Map::new();
    for (key, child) in children {
        if let Value::Object(fields) = child {
            for (sub, v) in fields {
                out.insert(format!("{key}.{sub}"), v.clone());
            }
        }
    }
    Value::Object(out)
}

/// The string form of a JSON value: strings unquoted, null empty,
/// containers as raw JSON.
#[must_use]
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sel(s: &str) -> JsonSelector {
        JsonSelector::parse(s).unwrap()
    }

    #[test]
    fn test_empty_selector_returns_root() {
        let root = json!({"a": 1});
        assert_eq!(sel("").select(&root).unwrap(), root);
    }

    #[test]
    fn test_dotted_path_and_index() {
        let root = json!({"data": {"items": [{"v": 1}, {"v": 2}]}});
        assert_eq!(sel("data.items.1.v").select(&root).unwrap(), json!(2));
        assert!(sel("data.missing").select(&root).is_none());
    }

    #[test]
    fn test_to_entries_defaults() {
        let root = json!({"cpu": "16", "mem": "32"});
        let out = sel("@to_entries").select(&root).unwrap();
        assert_eq!(
            out,
            json!([{"key": "cpu", "value": "16"}, {"key": "mem", "value": "32"}])
        );
    }

    #[test]
    fn test_to_entries_spread_and_key_only() {
        let root = json!({"a": {"x": 1}, "b": {"y": 2}});
        assert_eq!(
            sel("@to_entries:-:v").select(&root).unwrap(),
            json!([{"x": 1}, {"y": 2}])
        );
        assert_eq!(
            sel("@to_entries:k:-").select(&root).unwrap(),
            json!(["a", "b"])
        );
    }

    #[test]
    fn test_expand_flattens_one_level() {
        let root = json!({"server1": {"metrics": {"CPU": "16"}}});
        let out = sel("@expand").select(&root).unwrap();
        assert_eq!(out, json!({"server1.metrics": {"CPU": "16"}}));
        let out = sel("@expand | @expand").select(&root).unwrap();
        assert_eq!(out, json!({"server1.metrics.CPU": "16"}));
    }

    #[test]
    fn test_drill_down_records_parent_key() {
        let root = json!({"server1": {"cpu": 1}, "server2": {"cpu": 2}});
        let out = sel("@drill_down:name").select(&root).unwrap();
        assert_eq!(
            out,
            json!([{"cpu": 1, "name": "server1"}, {"cpu": 2, "name": "server2"}])
        );
    }

    #[test]
    fn test_drill_down_appends_to_existing_path() {
        let root = json!({"outer": {"inner": {"path": "a"}}});
        let out = sel("@drill_down | @drill_down").select(&root).unwrap();
        assert_eq!(out, json!([{"inner": {"path": "a"}, "path": "outer.0"}]));
    }

    #[test]
    fn test_pipeline_from_drilldown_scenario() {
        let root = json!({"data": {"server1": {"metrics": {"CPU": "16", "Memory": "68719476736"}}}});
        let out = sel("data | @expand | @expand | @to_entries:__name__:__value__")
            .select(&root)
            .unwrap();
        assert_eq!(
            out,
            json!([
                {"__name__": "server1.metrics.CPU", "__value__": "16"},
                {"__name__": "server1.metrics.Memory", "__value__": "68719476736"}
            ])
        );
    }

    #[test]
    fn test_unknown_modifier_rejected() {
        assert!(JsonSelector::parse("@frobnicate").is_err());
    }

    #[test]
    fn test_value_to_string() {
        assert_eq!(value_to_string(&json!("x")), "x");
        assert_eq!(value_to_string(&json!(1.5)), "1.5");
        assert_eq!(value_to_string(&json!(true)), "true");
        assert_eq!(value_to_string(&json!(null)), "");
        assert_eq!(value_to_string(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
