//! Error types for the collection pipeline.

use thiserror::Error;

/// Errors that can occur while loading rules or collecting data.
///
/// The variants fall into the stages of the pipeline: rule compilation,
/// datasource acquisition, extraction, relabeling and metric building.
/// Only rule compilation is fatal; everything else is counted, logged and
/// contained within the scrape that produced it.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// A relabel rule failed cross-field validation.
    #[error("invalid relabel rule: {0}")]
    InvalidRule(String),

    /// A regular expression failed to compile.
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// The offending pattern text.
        pattern: String,
        /// The underlying regex error.
        source: regex::Error,
    },

    /// A label or relabel template failed to parse or render.
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// A JSON path selector failed to parse.
    #[error("invalid selector {0:?}")]
    InvalidSelector(String),

    /// An XML path expression failed to parse.
    #[error("invalid xml path {0:?}: {1}")]
    InvalidXmlPath(String, String),

    /// The datasource URL has no usable scheme or type.
    #[error("unknown datasource type for url {0:?}")]
    UnknownDatasourceType(String),

    /// TLS was requested for a transport that cannot carry it.
    #[error("tls is not supported over udp")]
    TlsOverUdp,

    /// A TLS client configuration could not be built.
    #[error("tls configuration: {0}")]
    Tls(String),

    /// An HTTP request failed.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The HTTP response status was not acceptable.
    #[error("invalid HTTP response status code {status}, wanted {wanted}")]
    InvalidStatus {
        /// Status code received from the server.
        status: u16,
        /// Human-readable description of the accepted set.
        wanted: String,
    },

    /// An I/O error on a file, TCP or UDP transport.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Dialing the remote endpoint exceeded `max_connect_time`.
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    /// The connection's transfer-time budget was exhausted.
    #[error("transfer timeout")]
    TransferTimeout,

    /// Fewer than `min_content_length` bytes were read.
    #[error("content too short: read {read} bytes, want at least {min}")]
    TooShort {
        /// Number of bytes actually read.
        read: u64,
        /// Configured minimum.
        min: u64,
    },

    /// The input could not be parsed as XML.
    #[error("failed to parse xml data: {0}")]
    Xml(#[from] roxmltree::Error),

    /// The input could not be transcoded from YAML.
    #[error("failed to parse yaml data: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The metric name resolved to an empty or invalid string.
    #[error("{0:?} is not a valid metric name")]
    InvalidName(String),

    /// The scalar value could not be decoded.
    #[error("invalid metric value {0:?}")]
    InvalidValue(String),

    /// Histogram buckets were missing or malformed.
    #[error("bucket format error: {0}")]
    InvalidBuckets(String),

    /// `__values__` and `__values_index__` have different lengths.
    #[error("values length {values} not equal to index length {indexes}")]
    ValuesLengthMismatch {
        /// Number of value tokens.
        values: usize,
        /// Number of index tokens.
        indexes: usize,
    },

    /// A counter was asked to decrease.
    #[error("counter cannot decrease: {0}")]
    CounterDecrease(f64),
}

/// Result type for collector operations.
pub type Result<T> = std::result::Result<T, CollectorError>;
