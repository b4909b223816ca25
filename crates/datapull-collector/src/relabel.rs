//! Ordered label rewriting: replace, keep/drop filters, hashing,
//! label mapping and template execution.

use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::error::{CollectorError, Result};
use crate::labels::{is_valid_label_name, Builder, Labels};
use crate::pattern::AnchoredRegex;
use crate::template::Template;

/// Valid targets for `replace`-style actions: label-name characters plus
/// `$1` / `${name}` capture references.
static RELABEL_TARGET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?:[a-zA-Z_]|\$(?:\{\w+\}|\w+))+\w*)+$")
        .unwrap_or_else(|_| unreachable!("static pattern compiles"))
});

/// What a relabel rule does to the working label set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Regex-replace the target label when the pattern matches.
    Replace,
    /// Render a template over the source value into the target label.
    #[serde(rename = "templexec")]
    TemplateExecute,
    /// Discard the label set unless the pattern matches.
    Keep,
    /// Discard the label set when the pattern matches.
    Drop,
    /// Set the target label to a modulus of a hash of the source value.
    #[serde(rename = "hashmod")]
    HashMod,
    /// Copy matching labels to regex-expanded names.
    #[serde(rename = "labelmap")]
    LabelMap,
    /// Delete labels whose name matches.
    #[serde(rename = "labeldrop")]
    LabelDrop,
    /// Delete labels whose name does not match.
    #[serde(rename = "labelkeep")]
    LabelKeep,
}

/// Default separator between concatenated source-label values.
pub const DEFAULT_SEPARATOR: &str = ";";
/// Default pattern: capture everything.
pub const DEFAULT_REGEX: &str = "(.*)";
/// Default replacement: the first capture group.
pub const DEFAULT_REPLACEMENT: &str = "$1";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRelabelConfig {
    #[serde(default)]
    source_labels: Vec<String>,
    #[serde(default)]
    separator: Option<String>,
    #[serde(default)]
    regex: Option<AnchoredRegex>,
    #[serde(default)]
    template: Option<Template>,
    #[serde(default)]
    modulus: u64,
    #[serde(default)]
    target_label: String,
    #[serde(default)]
    replacement: Option<String>,
    #[serde(default)]
    action: Option<Action>,
}

/// A single validated relabel rule.
///
/// Cross-field invariants are enforced while deserializing, so a rule that
/// parsed is a rule that can run.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawRelabelConfig")]
pub struct RelabelConfig {
    /// Labels whose values are concatenated into the rule input.
    pub source_labels: Vec<String>,
    /// String between concatenated source values.
    pub separator: String,
    /// Pattern matched against the concatenation, implicitly anchored.
    pub regex: AnchoredRegex,
    /// Template for the `templexec` action.
    pub template: Template,
    /// Modulus for the `hashmod` action.
    pub modulus: u64,
    /// Label the result is written to.
    pub target_label: String,
    /// Regex replacement for `replace` and `labelmap`.
    pub replacement: String,
    /// The action to perform.
    pub action: Action,
}

impl TryFrom<RawRelabelConfig> for RelabelConfig {
    type Error = CollectorError;

    fn try_from(raw: RawRelabelConfig) -> Result<Self> {
        let action = raw.action.unwrap_or(Action::Replace);
        let cfg = RelabelConfig {
            source_labels: raw.source_labels,
            separator: raw.separator.unwrap_or_else(|| DEFAULT_SEPARATOR.to_string()),
            regex: match raw.regex {
                Some(regex) => regex,
                None => AnchoredRegex::new(DEFAULT_REGEX)?,
            },
            template: raw.template.unwrap_or_default(),
            modulus: raw.modulus,
            target_label: raw.target_label,
            replacement: raw
                .replacement
                .unwrap_or_else(|| DEFAULT_REPLACEMENT.to_string()),
            action,
        };

        if cfg.action == Action::TemplateExecute && cfg.template.is_empty() {
            return Err(CollectorError::InvalidRule(
                "templexec action requires 'template' value".into(),
            ));
        }
        if cfg.action == Action::HashMod && cfg.modulus == 0 {
            return Err(CollectorError::InvalidRule(
                "hashmod action requires non-zero modulus".into(),
            ));
        }
        if matches!(
            cfg.action,
            Action::Replace | Action::HashMod | Action::TemplateExecute
        ) && cfg.target_label.is_empty()
        {
            return Err(CollectorError::InvalidRule(format!(
                "{:?} action requires 'target_label' value",
                cfg.action
            )));
        }
        if cfg.action == Action::Replace && !RELABEL_TARGET.is_match(&cfg.target_label) {
            return Err(CollectorError::InvalidRule(format!(
                "{:?} is invalid 'target_label' for replace action",
                cfg.target_label
            )));
        }
        if cfg.action == Action::LabelMap && !RELABEL_TARGET.is_match(&cfg.replacement) {
            return Err(CollectorError::InvalidRule(format!(
                "{:?} is invalid 'replacement' for labelmap action",
                cfg.replacement
            )));
        }
        if cfg.action == Action::HashMod && !is_valid_label_name(&cfg.target_label) {
            return Err(CollectorError::InvalidRule(format!(
                "{:?} is invalid 'target_label' for hashmod action",
                cfg.target_label
            )));
        }
        if matches!(cfg.action, Action::LabelDrop | Action::LabelKeep)
            && (!cfg.source_labels.is_empty()
                || !cfg.target_label.is_empty()
                || cfg.modulus != 0
                || cfg.separator != DEFAULT_SEPARATOR
                || cfg.replacement != DEFAULT_REPLACEMENT)
        {
            return Err(CollectorError::InvalidRule(format!(
                "{:?} action requires only 'regex', and no other fields",
                cfg.action
            )));
        }
        Ok(cfg)
    }
}

/// An ordered list of relabel rules.
pub type RelabelConfigs = Vec<RelabelConfig>;

/// Apply `rules` in order to `labels`.
///
/// Returns `None` when a `keep`/`drop` rule discarded the label set; once
/// discarded, later rules never see it.
///
/// # Errors
///
/// Returns an error when a `templexec` template fails to render; the
/// caller drops the datapoint.
pub fn process(rules: &[RelabelConfig], labels: Labels) -> Result<Option<Labels>> {
    let mut current = labels;
    for rule in rules {
        match relabel(current, rule)? {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

fn relabel(lset: Labels, cfg: &RelabelConfig) -> Result<Option<Labels>> {
    let val = cfg
        .source_labels
        .iter()
        .map(|name| lset.get(name))
        .collect::<Vec<_>>()
        .join(&cfg.separator);
    let pairs: Vec<(String, String)> = lset
        .iter()
        .map(|l| (l.name.clone(), l.value.clone()))
        .collect();

    let mut builder = Builder::new(lset);
    match cfg.action {
        Action::Drop => {
            if cfg.regex.is_match(&val) {
                return Ok(None);
            }
        }
        Action::Keep => {
            if !cfg.regex.is_match(&val) {
                return Ok(None);
            }
        }
        Action::TemplateExecute => {
            let rendered = cfg.template.execute_value(&val)?;
            builder.set(&cfg.target_label, &rendered);
        }
        Action::Replace => {
            // No match, no replacement.
            if let Some(target) = cfg.regex.expand(&val, &cfg.target_label) {
                if !is_valid_label_name(&target) {
                    builder.del(&cfg.target_label);
                } else {
                    match cfg.regex.expand(&val, &cfg.replacement) {
                        Some(value) if !value.is_empty() => {
                            builder.set(&target, &value);
                        }
                        _ => {
                            builder.del(&cfg.target_label);
                        }
                    }
                }
            }
        }
        Action::HashMod => {
            let digest = Md5::digest(val.as_bytes());
            let mut head = [0u8; 8];
            head.copy_from_slice(&digest[..8]);
            let hashed = u64::from_be_bytes(head) % cfg.modulus;
            builder.set(&cfg.target_label, &hashed.to_string());
        }
        Action::LabelMap => {
            for (name, value) in &pairs {
                if cfg.regex.is_match(name) {
                    if let Some(new_name) = cfg.regex.expand(name, &cfg.replacement) {
                        builder.set(&new_name, value);
                    }
                }
            }
        }
        Action::LabelDrop => {
            for (name, _) in &pairs {
                if cfg.regex.is_match(name) {
                    builder.del(name);
                }
            }
        }
        Action::LabelKeep => {
            for (name, _) in &pairs {
                if !cfg.regex.is_match(name) {
                    builder.del(name);
                }
            }
        }
    }
    Ok(Some(builder.into_labels()))
}
