//! Label-value templates with a whitelisted helper set.
//!
//! Templates are minijinja expressions rendered against a small context:
//! relabel `templexec` rules see the joined source value as `value`, XML
//! label rules see the matched element as `text` and `attrs`.

use std::fmt;

use chrono::{Local, Utc};
use minijinja::value::Value;
use minijinja::{context, Environment, ErrorKind};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::Result;

static ENV: Lazy<Environment<'static>> = Lazy::new(|| {
    let mut env = Environment::new();
    env.add_filter("to_upper", |s: String| s.to_uppercase());
    env.add_filter("to_lower", |s: String| s.to_lowercase());
    env.add_filter("title", title);
    env.add_filter("trim_space", |s: String| s.trim().to_string());
    env.add_filter("trim_left", |s: String, cutset: String| {
        s.trim_start_matches(|c| cutset.contains(c)).to_string()
    });
    env.add_filter("trim_right", |s: String, cutset: String| {
        s.trim_end_matches(|c| cutset.contains(c)).to_string()
    });
    env.add_filter("trim_prefix", |s: String, prefix: String| {
        s.strip_prefix(&prefix).unwrap_or(&s).to_string()
    });
    env.add_filter("trim_suffix", |s: String, suffix: String| {
        s.strip_suffix(&suffix).unwrap_or(&s).to_string()
    });
    env.add_filter("re_replace_all", re_replace_all);
    env.add_filter("parse_int", parse_int);
    env.add_filter("parse_float", parse_float);
    env.add_filter("format_int", format_int);
    env.add_filter("format_float", format_float);
    env.add_filter("to_string", |v: Value| v.to_string());
    env.add_function("now", || Local::now().to_rfc3339());
    env.add_function("utc_now", || Utc::now().to_rfc3339());
    env
});

fn title(s: String) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if at_word_start {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        at_word_start = c.is_whitespace();
    }
    out
}

fn re_replace_all(
    text: String,
    pattern: String,
    replacement: String,
) -> std::result::Result<String, minijinja::Error> {
    let re = Regex::new(&pattern).map_err(|err| {
        minijinja::Error::new(ErrorKind::InvalidOperation, format!("bad pattern: {err}"))
    })?;
    Ok(re.replace_all(&text, replacement.as_str()).into_owned())
}

fn parse_int(
    s: String,
    base: u32,
    _bit_size: Option<u32>,
) -> std::result::Result<i64, minijinja::Error> {
    let s = s.trim();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, s.strip_prefix('+').unwrap_or(s)),
    };
    let (radix, digits) = if base == 0 {
        if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            (16, hex)
        } else if let Some(oct) = digits.strip_prefix("0o").or_else(|| digits.strip_prefix("0O")) {
            (8, oct)
        } else if let Some(bin) = digits.strip_prefix("0b").or_else(|| digits.strip_prefix("0B")) {
            (2, bin)
        } else {
            (10, digits)
        }
    } else {
        (base, digits)
    };
    i64::from_str_radix(digits, radix)
        .map(|v| sign * v)
        .map_err(|err| {
            minijinja::Error::new(ErrorKind::InvalidOperation, format!("parse_int: {err}"))
        })
}

fn parse_float(s: String) -> std::result::Result<f64, minijinja::Error> {
    s.trim().parse::<f64>().map_err(|err| {
        minijinja::Error::new(ErrorKind::InvalidOperation, format!("parse_float: {err}"))
    })
}

fn format_int(v: i64, base: Option<u32>) -> String {
    match base.unwrap_or(10) {
        2 => format!("{v:b}"),
        8 => format!("{v:o}"),
        16 => format!("{v:x}"),
        _ => v.to_string(),
    }
}

fn format_float(v: f64, precision: Option<usize>) -> String {
    match precision {
        Some(p) => format!("{v:.p$}"),
        None => v.to_string(),
    }
}

/// A validated template. The source is checked at load time; rendering
/// happens against the shared helper environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Template {
    source: String,
}

impl Template {
    /// Validate and wrap a template source.
    pub fn new(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        ENV.template_from_str(&source)?;
        Ok(Self { source })
    }

    /// The template text as written in the configuration.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the template body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    /// Render with a single `value` variable, as `templexec` rules do.
    pub fn execute_value(&self, value: &str) -> Result<String> {
        Ok(ENV.render_str(&self.source, context! { value => value })?)
    }

    /// Render with an arbitrary context, as XML label rules do.
    pub fn render(&self, ctx: Value) -> Result<String> {
        Ok(ENV.render_str(&self.source, ctx)?)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Template {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let source = String::deserialize(deserializer)?;
        Template::new(source).map_err(de::Error::custom)
    }
}

impl Serialize for Template {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.source)
    }
}
