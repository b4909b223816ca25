//! Core collection pipeline for the datapull exporter.
//!
//! The pipeline runs in four stages:
//!
//! 1. **Acquisition** — [`datasource`] opens a byte stream over http,
//!    file, tcp or udp with shared timeout, length-cap and line-splitting
//!    semantics ([`line_buffer`]).
//! 2. **Extraction** — [`extract`] turns raw bytes into datapoints (bags
//!    of string fields) using regex, JSON path, XML path or YAML rules.
//! 3. **Relabeling** — [`relabel`] rewrites, filters, hashes and
//!    templates each datapoint's labels.
//! 4. **Metric building** — [`metric`] materializes labeled datapoints
//!    into counter/gauge/histogram observations, which a scrape renders
//!    ([`exposition`]) or a stream datasource accumulates
//!    ([`aggregate`]).

#![forbid(unsafe_code)]

pub mod aggregate;
pub mod collect;
pub mod datasource;
pub mod error;
pub mod exposition;
pub mod extract;
pub mod jsonpath;
pub mod labels;
pub mod line_buffer;
pub mod metric;
pub mod pattern;
pub mod relabel;
pub mod scrape;
pub mod stream;
pub mod telemetry;
pub mod template;
pub mod xmlpath;

pub use aggregate::MetricGroup;
pub use collect::{Collect, DataFormat};
pub use datasource::{Datasource, DatasourceType, ReadMode};
pub use error::{CollectorError, Result};
pub use exposition::{render, Sample};
pub use extract::Datapoint;
pub use labels::{Label, Labels};
pub use metric::{MetricConfig, MetricType, Observation};
pub use relabel::{RelabelConfig, RelabelConfigs};
pub use scrape::{gather, ScrapeSelection};
pub use telemetry::EXPORTER_NAME;
