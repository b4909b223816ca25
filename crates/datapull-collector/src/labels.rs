//! The label model: ordered name/value pairs with append-or-update
//! semantics and a builder for relabeling.
//!
//! Labels whose name starts with `__` are *inner* labels. They carry
//! metadata through the pipeline (metric name, value, timestamp, buckets)
//! and are stripped before export.

use std::fmt;

/// Prefix marking a label as internal metadata.
pub const INNER_PREFIX: &str = "__";

/// Fully-qualified metric name before namespace/subsystem are applied.
pub const LABEL_METRIC_NAME: &str = "__name__";
/// Optional metric name prefix, joined with underscores.
pub const LABEL_METRIC_NAMESPACE: &str = "__namespace__";
/// Optional metric name infix, joined with underscores.
pub const LABEL_METRIC_SUBSYSTEM: &str = "__subsystem__";
/// Documentation string emitted as `# HELP`.
pub const LABEL_METRIC_HELP: &str = "__help__";
/// Sample timestamp, either a unix integer or a formatted time.
pub const LABEL_METRIC_TIME: &str = "__time__";
/// chrono format string used to parse `__time__`.
pub const LABEL_METRIC_TIME_FORMAT: &str = "__time_format__";
/// Single scalar sample value.
pub const LABEL_METRIC_VALUE: &str = "__value__";
/// Comma-separated histogram upper bounds.
pub const LABEL_METRIC_BUCKETS: &str = "__buckets__";
/// Vector of scalar values.
pub const LABEL_METRIC_VALUES: &str = "__values__";
/// Separator for `__values__` (default: one space).
pub const LABEL_METRIC_VALUES_SEPARATOR: &str = "__values_separator__";
/// Parallel vector of index strings for `__values__`.
pub const LABEL_METRIC_VALUES_INDEX: &str = "__values_index__";
/// Separator for `__values_index__` (default: the values separator).
pub const LABEL_METRIC_VALUES_INDEX_SEPARATOR: &str = "__values_index_separator__";
/// Label name under which each vector index is attached (default `index`).
pub const LABEL_METRIC_VALUES_INDEX_LABEL_NAME: &str = "__values_index_label_name__";
/// Raw source fragment a datapoint was extracted from.
pub const LABEL_LINE: &str = "__line__";

/// A single name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Label {
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

impl Label {
    /// Create a label from anything string-like.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Whether this label is internal metadata rather than an output dimension.
    #[must_use]
    pub fn is_inner(&self) -> bool {
        self.name.starts_with(INNER_PREFIX)
    }
}

/// An ordered sequence of labels.
///
/// Conceptually a string map, but the order is part of the contract:
/// export order is sorted by name, and appending an existing name updates
/// the value in place instead of adding a duplicate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// An empty label set.
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a sorted label set from the given labels.
    #[must_use]
    pub fn from_labels(labels: impl IntoIterator<Item = Label>) -> Self {
        let mut set = Self(labels.into_iter().collect());
        set.0.sort();
        set
    }

    /// Value for `name`, or the empty string when absent.
    #[must_use]
    pub fn get(&self, name: &str) -> &str {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map_or("", |l| l.value.as_str())
    }

    /// Whether a label with `name` is present.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.0.iter().any(|l| l.name == name)
    }

    /// Append a label, updating the value in place when the name exists.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(existing) = self.0.iter_mut().find(|l| l.name == name) {
            existing.value = value;
        } else {
            self.0.push(Label { name, value });
        }
    }

    /// Number of labels, including inner and empty ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set holds no labels at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the labels in their current order.
    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    /// Sort the labels by name.
    pub fn sort(&mut self) {
        self.0.sort();
    }

    /// Label names in their current order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.0.iter().map(|l| l.name.clone()).collect()
    }

    /// The exported view: sorted, without empty values and inner labels.
    #[must_use]
    pub fn exported(&self) -> Labels {
        let mut out: Vec<Label> = self
            .0
            .iter()
            .filter(|l| !l.value.is_empty() && !l.is_inner())
            .cloned()
            .collect();
        out.sort();
        Labels(out)
    }
}

impl FromIterator<Label> for Labels {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Labels {
    type Item = Label;
    type IntoIter = std::vec::IntoIter<Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, l) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", l.name, l.value)?;
        }
        write!(f, "}}")
    }
}

/// Whether `name` is a syntactically valid label name.
#[must_use]
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Whether `name` is a syntactically valid metric name.
#[must_use]
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Lowercase a raw name and map `-`, `.` and spaces to underscores.
#[must_use]
pub fn sanitize_name(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| match c {
            '-' | '.' | ' ' => '_',
            other => other,
        })
        .collect()
}

/// A scratch area for modifying a label set.
///
/// The base is kept immutable; deletions and additions are tracked in an
/// overlay and merged by [`Builder::into_labels`]. Empty-valued labels in
/// the base are treated as deleted up front, matching the read semantics
/// where an empty value and a missing label are indistinguishable.
#[derive(Debug)]
pub struct Builder {
    base: Labels,
    del: Vec<String>,
    add: Vec<Label>,
}

impl Builder {
    /// Start a builder over `base`.
    #[must_use]
    pub fn new(base: Labels) -> Self {
        let del = base
            .iter()
            .filter(|l| l.value.is_empty())
            .map(|l| l.name.clone())
            .collect();
        Self {
            base,
            del,
            add: Vec::new(),
        }
    }

    /// Delete the label with the given name.
    pub fn del(&mut self, name: &str) -> &mut Self {
        self.add.retain(|l| l.name != name);
        self.del.push(name.to_string());
        self
    }

    /// Set a label. An empty value is the same as deleting the label.
    pub fn set(&mut self, name: &str, value: &str) -> &mut Self {
        if value.is_empty() {
            return self.del(name);
        }
        if let Some(existing) = self.add.iter_mut().find(|l| l.name == name) {
            existing.value = value.to_string();
            return self;
        }
        self.add.push(Label::new(name, value));
        self
    }

    /// Merge the overlay into a sorted label set.
    #[must_use]
    pub fn into_labels(self) -> Labels {
        if self.del.is_empty() && self.add.is_empty() {
            return self.base;
        }
        let mut out: Vec<Label> = self
            .base
            .into_iter()
            .filter(|l| !self.del.iter().any(|d| *d == l.name))
            .filter(|l| !self.add.iter().any(|a| a.name == l.name))
            .collect();
        out.extend(self.add);
        out.sort();
        Labels(out)
    }
}
