//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::Parser;

/// datapull - a metrics exporter for heterogeneous textual data sources.
#[derive(Parser, Debug, Clone)]
#[command(name = "datapull")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// The address to listen on for HTTP requests.
    #[arg(
        long = "web.listen-address",
        env = "DATAPULL_LISTEN_ADDRESS",
        default_value = ":9116"
    )]
    pub listen_address: String,

    /// Configuration file, or a directory of *.yml/*.yaml files.
    #[arg(
        long = "config.file",
        env = "DATAPULL_CONFIG_FILE",
        default_value = "datapull.yaml"
    )]
    pub config_file: PathBuf,

    /// Prefix for the internal routes of web endpoints.
    #[arg(long = "web.route-prefix")]
    pub route_prefix: Option<String>,

    /// Validate the configuration file and exit.
    #[arg(long = "config.check")]
    pub config_check: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long = "log.level", env = "DATAPULL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// The listen address with the host defaulted when only a port was
    /// given (`:9116` listens on all interfaces).
    #[must_use]
    pub fn bind_address(&self) -> String {
        if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        }
    }

    /// The normalized route prefix: always starts with `/`, never ends
    /// with one (except the bare root).
    #[must_use]
    pub fn normalized_route_prefix(&self) -> String {
        let raw = self.route_prefix.as_deref().unwrap_or("/");
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_address_defaults_host() {
        let cli = Cli::parse_from(["datapull"]);
        assert_eq!(cli.bind_address(), "0.0.0.0:9116");

        let cli = Cli::parse_from(["datapull", "--web.listen-address", "127.0.0.1:9000"]);
        assert_eq!(cli.bind_address(), "127.0.0.1:9000");
    }

    #[test]
    fn test_route_prefix_normalization() {
        let cli = Cli::parse_from(["datapull"]);
        assert_eq!(cli.normalized_route_prefix(), "/");

        let cli = Cli::parse_from(["datapull", "--web.route-prefix", "exporter/"]);
        assert_eq!(cli.normalized_route_prefix(), "/exporter");

        let cli = Cli::parse_from(["datapull", "--web.route-prefix", "/a/b/"]);
        assert_eq!(cli.normalized_route_prefix(), "/a/b");
    }
}
