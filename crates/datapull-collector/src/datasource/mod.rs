//! Datasources: where the bytes come from.
//!
//! A datasource names a URL on one of four transports (http, file, tcp,
//! udp), a read mode, and the limits that bound the acquisition: total
//! and per-line length caps, a timeout, line separators and an end-of
//! sentinel.

mod file;
pub mod http;
pub mod net;

use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};

pub use file::FileTailer;
pub use http::HttpConfig;
pub use net::{ConnReader, NetConfig, SendConfig, TlsClientConfig};

use crate::error::{CollectorError, Result};
use crate::line_buffer::{LineBuffer, LineSplitter};
use crate::relabel::RelabelConfigs;

/// A boxed transport byte stream.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Default total content cap in bytes.
pub const DEFAULT_MAX_CONTENT_LENGTH: u64 = 102_400_000;
/// Default acquisition timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasourceType {
    /// HTTP or HTTPS.
    #[serde(alias = "https")]
    Http,
    /// Local file.
    File,
    /// Raw TCP connection.
    Tcp,
    /// Raw UDP exchange.
    Udp,
}

/// How the acquired bytes are consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// One read of the whole body.
    #[default]
    #[serde(alias = "full-text")]
    Full,
    /// Iterate line records over one acquisition.
    #[serde(alias = "stream-line")]
    Line,
    /// Long-lived push source feeding the aggregation store.
    Stream,
}

/// Start position for tailing a stream-mode file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum Whence {
    /// Beginning of the file.
    Start,
    /// The current position (same as start for a fresh handle).
    Current,
    /// End of the file.
    #[default]
    End,
}

impl TryFrom<u8> for Whence {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Whence::Start),
            1 => Ok(Whence::Current),
            2 => Ok(Whence::End),
            other => Err(format!("whence must be 0, 1 or 2, got {other}")),
        }
    }
}

fn deserialize_string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(sep) => vec![sep],
        OneOrMany::Many(seps) => seps,
    })
}

#[derive(Debug, Clone)]
enum Transport {
    Http(HttpConfig),
    Net(NetConfig),
    File,
}

/// A single configured datasource.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Datasource {
    /// Name, used in routing and error counters.
    pub name: String,
    /// Target URL; the scheme may carry the transport kind.
    pub url: String,
    /// Explicit transport kind; inferred from the URL scheme when unset.
    #[serde(rename = "type", default)]
    pub type_: Option<DatasourceType>,
    /// How the bytes are consumed (default full).
    #[serde(default)]
    pub read_mode: ReadMode,
    /// Acquisition deadline for one scrape of this source.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Total content cap in bytes.
    #[serde(default)]
    pub max_content_length: Option<u64>,
    /// Minimum content length; shorter reads fail.
    #[serde(default)]
    pub min_content_length: u64,
    /// Per-line cap in bytes (0 = unlimited).
    #[serde(default)]
    pub line_max_content_length: usize,
    /// Record separators (default `["\n"]`).
    #[serde(default, deserialize_with = "deserialize_string_or_list")]
    pub line_separator: Vec<String>,
    /// Terminator sentinel; splitting stops at its first occurrence.
    #[serde(default)]
    pub end_of: String,
    /// Tail start position for stream-mode files.
    #[serde(default)]
    pub whence: Whence,
    /// Permit per-scrape URL overrides via the HTTP surface.
    #[serde(default)]
    pub allow_replace: bool,
    /// Datasource-level relabel configs.
    #[serde(default)]
    pub relabel_configs: RelabelConfigs,
    /// Transport-specific settings, parsed according to the kind.
    #[serde(default)]
    pub config: Option<serde_yaml::Value>,

    #[serde(skip)]
    kind: Option<DatasourceType>,
    #[serde(skip)]
    transport: Option<Transport>,
}

impl Datasource {
    /// Resolve the transport kind, validate limits and build the
    /// transport from the raw `config` block.
    pub fn compile(&mut self) -> Result<()> {
        let kind = match self.type_ {
            Some(kind) => kind,
            None => match self.url.split_once("://").map(|(scheme, _)| scheme) {
                Some("http" | "https") => DatasourceType::Http,
                Some("file") => DatasourceType::File,
                Some("tcp") => DatasourceType::Tcp,
                Some("udp") => DatasourceType::Udp,
                _ => return Err(CollectorError::UnknownDatasourceType(self.url.clone())),
            },
        };
        self.kind = Some(kind);

        if let Some(timeout) = self.timeout {
            if timeout < Duration::from_millis(1) {
                return Err(CollectorError::InvalidRule(
                    "timeout value cannot be less than 1 ms".into(),
                ));
            }
        }

        let raw = self.config.clone().unwrap_or(serde_yaml::Value::Null);
        self.transport = Some(match kind {
            DatasourceType::Http => {
                let mut http: HttpConfig = if raw.is_null() {
                    HttpConfig::default()
                } else {
                    serde_yaml::from_value(raw)?
                };
                http.compile()?;
                Transport::Http(http)
            }
            DatasourceType::Tcp | DatasourceType::Udp => {
                let mut net: NetConfig = if raw.is_null() {
                    NetConfig::default()
                } else {
                    serde_yaml::from_value(raw)?
                };
                net.compile(kind)?;
                Transport::Net(net)
            }
            DatasourceType::File => Transport::File,
        });
        Ok(())
    }

    /// The resolved transport kind.
    ///
    /// # Panics
    ///
    /// Panics when called before [`Datasource::compile`].
    #[must_use]
    pub fn kind(&self) -> DatasourceType {
        self.kind.expect("datasource not compiled")
    }

    /// The effective acquisition deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    /// The effective total content cap.
    #[must_use]
    pub fn max_content_length(&self) -> u64 {
        self.max_content_length
            .filter(|len| *len > 0)
            .unwrap_or(DEFAULT_MAX_CONTENT_LENGTH)
    }

    fn effective_end_of(&self) -> Vec<u8> {
        if !self.end_of.is_empty() {
            return self.end_of.clone().into_bytes();
        }
        if let Some(Transport::Net(net)) = &self.transport {
            return net.end_of.clone().into_bytes();
        }
        Vec::new()
    }

    fn separators(&self) -> Vec<Vec<u8>> {
        self.line_separator
            .iter()
            .map(|sep| sep.clone().into_bytes())
            .collect()
    }

    fn splitter(&self) -> LineSplitter {
        LineSplitter::new(
            self.separators(),
            self.effective_end_of(),
            self.line_max_content_length,
        )
    }

    fn transport(&self) -> Result<&Transport> {
        self.transport
            .as_ref()
            .ok_or_else(|| CollectorError::InvalidRule("datasource not compiled".into()))
    }

    /// The path or address part of the URL, without the scheme.
    fn target(&self, url: &str) -> String {
        url.split_once("://")
            .map_or(url, |(_, rest)| rest)
            .to_string()
    }

    async fn open_stream(&self, url_override: Option<&str>) -> Result<BoxReader> {
        let url = url_override.unwrap_or(&self.url);
        match self.transport()? {
            Transport::Http(http) => http.open(&self.name, url).await,
            Transport::Net(net) => {
                net.open(
                    self.kind(),
                    &self.target(url),
                    self.read_mode == ReadMode::Stream,
                )
                .await
            }
            Transport::File => {
                let file = tokio::fs::File::open(self.target(url)).await?;
                Ok(Box::new(file))
            }
        }
    }

    /// Read the whole body, bounded by `max_content_length`.
    ///
    /// # Errors
    ///
    /// Fails with [`CollectorError::TooShort`] when fewer than
    /// `min_content_length` bytes were read, besides transport errors.
    pub async fn read_all(&self, url_override: Option<&str>) -> Result<Vec<u8>> {
        let reader = self.open_stream(url_override).await?;
        let mut data = Vec::new();
        reader
            .take(self.max_content_length())
            .read_to_end(&mut data)
            .await?;
        if (data.len() as u64) < self.min_content_length {
            return Err(CollectorError::TooShort {
                read: data.len() as u64,
                min: self.min_content_length,
            });
        }
        Ok(data)
    }

    /// Open a lazy sequence of line records.
    ///
    /// Stream-mode file datasources tail the file; everything else reads
    /// a single transport connection through the line splitter.
    pub async fn open_line_stream(&self, url_override: Option<&str>) -> Result<LineStream> {
        if self.kind() == DatasourceType::File && self.read_mode == ReadMode::Stream {
            let url = url_override.unwrap_or(&self.url);
            let path = std::path::PathBuf::from(self.target(url));
            let tailer = FileTailer::open(path, self.whence, self.splitter()).await?;
            return Ok(LineStream::Tail(tailer));
        }
        let reader = self.open_stream(url_override).await?;
        Ok(LineStream::Buffered(LineBuffer::new(
            reader,
            self.max_content_length(),
            self.line_max_content_length,
            self.separators(),
            self.effective_end_of(),
        )))
    }
}

/// A restartable lazy sequence of line records.
pub enum LineStream {
    /// Records from one transport connection.
    Buffered(LineBuffer<BoxReader>),
    /// Records from a tailed file.
    Tail(FileTailer),
}

impl LineStream {
    /// The next record, or `None` at end of stream.
    pub async fn next_line(&mut self) -> Result<Option<Bytes>> {
        match self {
            LineStream::Buffered(buffer) => buffer.read_line().await,
            LineStream::Tail(tailer) => tailer.next_line().await,
        }
    }
}
