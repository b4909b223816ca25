//! The HTTP(S) transport, built on a per-datasource reqwest client.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use futures::TryStreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use reqwest::Method;
use serde::Deserialize;
use tokio_util::io::StreamReader;
use tracing::debug;

use super::BoxReader;
use crate::error::{CollectorError, Result};

use super::net::DEFAULT_CONNECT_TIME;

/// Username/password for basic authentication.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BasicAuth {
    /// Username sent in the Authorization header.
    pub username: String,
    /// Password sent in the Authorization header.
    #[serde(default)]
    pub password: String,
}

/// Client-level settings: TLS material, auth and proxy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpClientConfig {
    /// Basic authentication credentials.
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
    /// Bearer token for the Authorization header.
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// Proxy URL for all requests.
    #[serde(default)]
    pub proxy_url: Option<String>,
    /// Extra trusted root certificates (PEM bundle).
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Client certificate (PEM), paired with `key_file`.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    /// Client private key (PEM).
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Skip server certificate verification.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Transport settings for HTTP datasources.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Request method (default GET).
    #[serde(default)]
    pub method: Option<String>,
    /// Request body.
    #[serde(default)]
    pub body: String,
    /// Request headers; a case-insensitive `Host` key sets the request
    /// host instead.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Exact allow-list of acceptable status codes; 2xx when empty.
    #[serde(default)]
    pub valid_status_codes: Vec<u16>,
    /// Dial deadline (default 3s).
    #[serde(default, with = "humantime_serde")]
    pub max_connect_time: Option<Duration>,
    /// Client-level TLS/auth/proxy settings.
    #[serde(default)]
    pub http_client_config: HttpClientConfig,

    #[serde(skip)]
    client: Option<reqwest::Client>,
    #[serde(skip)]
    method_parsed: Option<Method>,
    #[serde(skip)]
    header_map: HeaderMap,
    #[serde(skip)]
    host: Option<String>,
}

impl HttpConfig {
    /// Validate the settings and build the client.
    pub fn compile(&mut self) -> Result<()> {
        let method = self.method.as_deref().unwrap_or("GET");
        self.method_parsed = Some(
            Method::from_bytes(method.to_uppercase().as_bytes())
                .map_err(|_| CollectorError::InvalidRule(format!("bad http method {method:?}")))?,
        );

        self.header_map = HeaderMap::new();
        for (key, value) in &self.headers {
            if key.eq_ignore_ascii_case("host") {
                self.host = Some(value.clone());
                continue;
            }
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| CollectorError::InvalidRule(format!("bad header name {key:?}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| CollectorError::InvalidRule(format!("bad header value for {key:?}")))?;
            self.header_map.insert(name, value);
        }

        let cc = &self.http_client_config;
        let mut builder = reqwest::Client::builder()
            .connect_timeout(
                self.max_connect_time
                    .filter(|d| !d.is_zero())
                    .unwrap_or(DEFAULT_CONNECT_TIME),
            )
            .danger_accept_invalid_certs(cc.insecure_skip_verify);
        if let Some(ca_file) = &cc.ca_file {
            let pem = std::fs::read(ca_file)?;
            for cert in reqwest::Certificate::from_pem_bundle(&pem)? {
                builder = builder.add_root_certificate(cert);
            }
        }
        if let (Some(cert_file), Some(key_file)) = (&cc.cert_file, &cc.key_file) {
            let mut pem = std::fs::read(cert_file)?;
            pem.extend(std::fs::read(key_file)?);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }
        if let Some(proxy_url) = &cc.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }
        self.client = Some(builder.build()?);
        Ok(())
    }

    /// Perform the request and return the response body as a stream.
    pub async fn open(&self, name: &str, url: &str) -> Result<BoxReader> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| CollectorError::InvalidRule("http config not compiled".into()))?;
        let method = self.method_parsed.clone().unwrap_or(Method::GET);

        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("http://{url}")
        };
        let mut request = client
            .request(method, url.as_str())
            .headers(self.header_map.clone());
        if let Some(host) = &self.host {
            request = request.header(
                HOST,
                HeaderValue::from_str(host).map_err(|_| {
                    CollectorError::InvalidRule(format!("bad host header {host:?}"))
                })?,
            );
        }
        if !self.body.is_empty() {
            request = request.body(self.body.clone());
        }
        if let Some(auth) = &self.http_client_config.basic_auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }
        if let Some(token) = &self.http_client_config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(datasource = name, %url, status = status.as_u16(), "http response");
        if self.valid_status_codes.is_empty() {
            if !status.is_success() {
                return Err(CollectorError::InvalidStatus {
                    status: status.as_u16(),
                    wanted: "2xx".to_string(),
                });
            }
        } else if !self.valid_status_codes.contains(&status.as_u16()) {
            return Err(CollectorError::InvalidStatus {
                status: status.as_u16(),
                wanted: format!("{:?}", self.valid_status_codes),
            });
        }

        let stream = Box::pin(
            response
                .bytes_stream()
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err)),
        );
        Ok(Box::new(StreamReader::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_validates_method_and_headers() {
        let mut config: HttpConfig = serde_yaml::from_str("{method: post}").unwrap();
        config.compile().unwrap();
        assert_eq!(config.method_parsed, Some(Method::POST));

        let mut config: HttpConfig = serde_yaml::from_str("{method: 'not a method'}").unwrap();
        assert!(config.compile().is_err());

        let mut config: HttpConfig =
            serde_yaml::from_str("{headers: {HOST: example.com, X-Token: abc}}").unwrap();
        config.compile().unwrap();
        assert_eq!(config.host.as_deref(), Some("example.com"));
        assert_eq!(config.header_map.len(), 1);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(serde_yaml::from_str::<HttpConfig>("{methd: GET}").is_err());
    }
}
