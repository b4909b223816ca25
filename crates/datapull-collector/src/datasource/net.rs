//! TCP and UDP transports.
//!
//! After the dial (bounded by `max_connect_time`), an optional ordered
//! `send` list fires on a background task while the reader consumes
//! response bytes. Every read debits its elapsed wall-clock time from the
//! connection's transfer budget; an exhausted budget fails the read and
//! ends the stream.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, Instant, Sleep};
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;
use tracing::{debug, error};

use super::{BoxReader, DatasourceType};
use crate::error::{CollectorError, Result};

/// Default dial deadline.
pub const DEFAULT_CONNECT_TIME: Duration = Duration::from_secs(3);
/// Default transfer budget for non-stream reads.
pub const DEFAULT_TRANSFER_TIME: Duration = Duration::from_secs(3);

/// One message of the post-connect send list.
#[derive(Debug, Clone, Default)]
pub struct SendConfig {
    /// Bytes written to the connection.
    pub msg: String,
    /// Pause after the write before the next message.
    pub delay: Option<Duration>,
}

fn deserialize_send<'de, D>(deserializer: D) -> std::result::Result<Vec<SendConfig>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Entry {
        Msg(String),
        Full {
            #[serde(default)]
            msg: String,
            #[serde(default, with = "humantime_serde")]
            delay: Option<Duration>,
        },
    }
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(Entry),
        Many(Vec<Entry>),
    }

    let entries = match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(entry) => vec![entry],
        OneOrMany::Many(entries) => entries,
    };
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            Entry::Msg(msg) => SendConfig { msg, delay: None },
            Entry::Full { msg, delay } => SendConfig { msg, delay },
        })
        .collect())
}

/// TLS settings for TCP datasources.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsClientConfig {
    /// PEM bundle of trusted roots; system roots when unset.
    #[serde(default)]
    pub ca_file: Option<std::path::PathBuf>,
    /// Client certificate chain (PEM).
    #[serde(default)]
    pub cert_file: Option<std::path::PathBuf>,
    /// Client private key (PEM).
    #[serde(default)]
    pub key_file: Option<std::path::PathBuf>,
    /// Server name for SNI and verification; host part of the URL when
    /// unset.
    #[serde(default)]
    pub server_name: Option<String>,
    /// Skip certificate verification entirely.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl TlsClientConfig {
    fn build(&self) -> Result<TlsConnector> {
        let tls_err = |err: String| CollectorError::Tls(err);

        let mut roots = rustls::RootCertStore::empty();
        if let Some(ca_file) = &self.ca_file {
            let pem = std::fs::read(ca_file)?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert = cert.map_err(|err| tls_err(format!("bad ca certificate: {err}")))?;
                roots
                    .add(cert)
                    .map_err(|err| tls_err(format!("bad ca certificate: {err}")))?;
            }
        } else {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
        let mut config = match (&self.cert_file, &self.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let cert_pem = std::fs::read(cert_file)?;
                let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|err| tls_err(format!("bad client certificate: {err}")))?;
                let key_pem = std::fs::read(key_file)?;
                let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                    .map_err(|err| tls_err(format!("bad client key: {err}")))?
                    .ok_or_else(|| tls_err("no private key found".into()))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|err| tls_err(format!("bad client auth: {err}")))?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => return Err(tls_err("cert_file and key_file must be set together".into())),
        };
        if self.insecure_skip_verify {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerify));
        }
        Ok(TlsConnector::from(Arc::new(config)))
    }
}

/// Accepts any server certificate (`insecure_skip_verify`).
#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Transport settings for TCP and UDP datasources.
#[derive(Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetConfig {
    /// Messages written after the connection is established.
    #[serde(default, deserialize_with = "deserialize_send")]
    pub send: Vec<SendConfig>,
    /// Dial deadline (default 3s).
    #[serde(default, with = "humantime_serde")]
    pub max_connect_time: Option<Duration>,
    /// Total wall-clock read budget. Zero or unset means 3s for
    /// one-shot reads and unlimited for stream reads.
    #[serde(default, with = "humantime_serde")]
    pub max_transfer_time: Option<Duration>,
    /// TLS settings; TCP only.
    #[serde(default)]
    pub tls_config: Option<TlsClientConfig>,
    /// Transport-level end-of sentinel, overridden by the datasource's.
    #[serde(default)]
    pub end_of: String,
    #[serde(skip)]
    connector: Option<TlsConnector>,
}

impl std::fmt::Debug for NetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetConfig")
            .field("send", &self.send)
            .field("max_connect_time", &self.max_connect_time)
            .field("max_transfer_time", &self.max_transfer_time)
            .field("tls_config", &self.tls_config)
            .field("end_of", &self.end_of)
            .finish()
    }
}

impl NetConfig {
    /// Build the TLS connector and reject unsupported combinations.
    pub fn compile(&mut self, kind: DatasourceType) -> Result<()> {
        if let Some(tls) = &self.tls_config {
            if kind == DatasourceType::Udp {
                return Err(CollectorError::TlsOverUdp);
            }
            self.connector = Some(tls.build()?);
        }
        Ok(())
    }

    fn connect_time(&self) -> Duration {
        self.max_connect_time
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_CONNECT_TIME)
    }

    /// The effective transfer budget for the given read mode.
    #[must_use]
    pub fn transfer_budget(&self, stream_mode: bool) -> Option<Duration> {
        match self.max_transfer_time {
            Some(d) if !d.is_zero() => Some(d),
            _ if stream_mode => None,
            _ => Some(DEFAULT_TRANSFER_TIME),
        }
    }

    /// Dial `addr` (a `host:port` pair) and return the budgeted reader.
    pub async fn open(
        &self,
        kind: DatasourceType,
        addr: &str,
        stream_mode: bool,
    ) -> Result<BoxReader> {
        let budget = self.transfer_budget(stream_mode);
        let reader: BoxReader = match kind {
            DatasourceType::Tcp => {
                let stream = tokio::time::timeout(self.connect_time(), TcpStream::connect(addr))
                    .await
                    .map_err(|_| CollectorError::ConnectTimeout(addr.to_string()))??;
                debug!(addr, "tcp connected");
                if let Some(connector) = &self.connector {
                    let host = self
                        .tls_config
                        .as_ref()
                        .and_then(|t| t.server_name.clone())
                        .unwrap_or_else(|| {
                            addr.rsplit_once(':')
                                .map_or(addr, |(host, _)| host)
                                .to_string()
                        });
                    let server_name = rustls::pki_types::ServerName::try_from(host)
                        .map_err(|err| CollectorError::Tls(err.to_string()))?;
                    let tls = tokio::time::timeout(
                        self.connect_time(),
                        connector.connect(server_name, stream),
                    )
                    .await
                    .map_err(|_| CollectorError::ConnectTimeout(addr.to_string()))??;
                    let (read_half, write_half) = tokio::io::split(tls);
                    self.spawn_sender(write_half);
                    Box::new(read_half)
                } else {
                    let (read_half, write_half) = stream.into_split();
                    self.spawn_sender(write_half);
                    Box::new(read_half)
                }
            }
            DatasourceType::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                tokio::time::timeout(self.connect_time(), socket.connect(addr))
                    .await
                    .map_err(|_| CollectorError::ConnectTimeout(addr.to_string()))??;
                let socket = Arc::new(socket);
                if !self.send.is_empty() {
                    let send = self.send.clone();
                    let sender = socket.clone();
                    tokio::spawn(async move {
                        for sc in send {
                            if let Err(err) = sender.send(sc.msg.as_bytes()).await {
                                error!(%err, "failed to send msg");
                                return;
                            }
                            if let Some(delay) = sc.delay {
                                sleep(delay).await;
                            }
                        }
                    });
                }
                Box::new(UdpReader(socket))
            }
            _ => return Err(CollectorError::UnknownDatasourceType(addr.to_string())),
        };
        Ok(Box::new(ConnReader::new(reader, budget)))
    }

    fn spawn_sender<W>(&self, mut writer: W)
    where
        W: tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        if self.send.is_empty() {
            return;
        }
        let send = self.send.clone();
        tokio::spawn(async move {
            for sc in send {
                if let Err(err) = writer.write_all(sc.msg.as_bytes()).await {
                    error!(%err, "failed to send msg");
                    return;
                }
                if let Some(delay) = sc.delay {
                    sleep(delay).await;
                }
            }
        });
    }
}

/// Adapter exposing a connected UDP socket as a byte stream.
struct UdpReader(Arc<UdpSocket>);

impl AsyncRead for UdpReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.0.poll_recv(cx, buf)
    }
}

/// A reader with a running wall-clock budget.
///
/// Each read starts a timer at the remaining budget; completing the read
/// debits the elapsed time. When the budget runs out mid-read the read
/// fails with a timeout and every later read fails immediately.
pub struct ConnReader<R> {
    inner: R,
    budget: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
    read_start: Option<Instant>,
}

impl<R> ConnReader<R> {
    /// Wrap `inner` with an optional budget (`None` = unlimited).
    pub fn new(inner: R, budget: Option<Duration>) -> Self {
        Self {
            inner,
            budget,
            deadline: None,
            read_start: None,
        }
    }
}

fn transfer_timeout() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "transfer timeout")
}

impl<R: AsyncRead + Unpin> AsyncRead for ConnReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(budget) = this.budget {
            if budget.is_zero() {
                return Poll::Ready(Err(transfer_timeout()));
            }
            if this.read_start.is_none() {
                this.read_start = Some(Instant::now());
                this.deadline = Some(Box::pin(sleep(budget)));
            }
        }
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                if let (Some(start), Some(budget)) = (this.read_start.take(), this.budget) {
                    this.budget = Some(budget.saturating_sub(start.elapsed()));
                }
                this.deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if let Some(deadline) = this.deadline.as_mut() {
                    if deadline.as_mut().poll(cx).is_ready() {
                        this.budget = Some(Duration::ZERO);
                        this.deadline = None;
                        return Poll::Ready(Err(transfer_timeout()));
                    }
                }
                Poll::Pending
            }
        }
    }
}
