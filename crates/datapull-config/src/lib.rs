//! Configuration loading and hot reload for the datapull exporter.
//!
//! A configuration is a YAML document (or a directory of them) holding a
//! `collects:` list. Selectors, patterns and templates are compiled while
//! parsing, so a configuration that loaded is a configuration that runs.
//! [`SafeConfig`] holds the active configuration behind a read-write
//! lock; a reload builds and starts the new configuration first, swaps
//! the pointer, then cancels the old configuration's stream tasks.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use datapull_collector::stream::start_streams;
use datapull_collector::{telemetry, Collect, CollectorError, MetricGroup};

/// Errors raised while loading or reloading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file or directory could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The offending path.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A document failed to parse or validate.
    #[error("error parsing config file {path}: {source}")]
    Parse {
        /// The offending path.
        path: PathBuf,
        /// The underlying parse/validation error.
        source: serde_yaml::Error,
    },

    /// A compiled rule was rejected.
    #[error(transparent)]
    Collector(#[from] CollectorError),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct Document {
    #[serde(default)]
    collects: Vec<Collect>,
}

/// A parsed and compiled configuration.
#[derive(Debug, Default)]
pub struct Config {
    /// The collect groups.
    pub collects: Vec<Collect>,
}

impl Config {
    /// Load from a YAML file, or from every `*.yml`/`*.yaml` file of a
    /// directory in name order.
    pub fn load(path: &Path) -> Result<Self> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let meta = std::fs::metadata(path).map_err(io_err)?;

        let mut collects = Vec::new();
        if meta.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
                .map_err(io_err)?
                .filter_map(std::result::Result::ok)
                .map(|entry| entry.path())
                .filter(|p| {
                    p.is_file()
                        && matches!(
                            p.extension().and_then(|e| e.to_str()),
                            Some("yml" | "yaml")
                        )
                })
                .collect();
            entries.sort();
            for entry in entries {
                collects.extend(load_file(&entry)?);
            }
        } else {
            collects.extend(load_file(path)?);
        }

        let mut config = Config { collects };
        for collect in &mut config.collects {
            collect.compile()?;
        }
        debug!(collects = config.collects.len(), "loaded configuration");
        Ok(config)
    }
}

fn load_file(path: &Path) -> Result<Vec<Collect>> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let doc: Document = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(doc.collects)
}

/// A running configuration: the compiled collects, the aggregation store
/// its stream datasources feed, and the cancellation scope that owns the
/// stream tasks.
#[derive(Debug)]
pub struct LoadedConfig {
    /// Compiled collect groups, shared with scrape tasks.
    pub collects: Arc<Vec<Collect>>,
    /// Aggregation store for this configuration's stream datasources.
    pub group: Arc<MetricGroup>,
    token: CancellationToken,
}

impl LoadedConfig {
    /// Start the configuration: spawn one task per stream datasource.
    #[must_use]
    pub fn start(config: Config) -> Self {
        let collects = Arc::new(config.collects);
        let group = Arc::new(MetricGroup::new());
        let token = CancellationToken::new();
        start_streams(Arc::clone(&collects), Arc::clone(&group), &token);
        Self {
            collects,
            group,
            token,
        }
    }

    /// Cancel this configuration's stream tasks.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

/// The hot-swappable active configuration.
///
/// Readers load the pointer once per scrape and keep using that value;
/// a concurrent reload never mixes old and new rules within a scrape.
#[derive(Debug, Clone)]
pub struct SafeConfig {
    path: PathBuf,
    current: Arc<RwLock<Arc<LoadedConfig>>>,
}

impl SafeConfig {
    /// Load the initial configuration from `path` and start it.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = match Config::load(&path) {
            Ok(config) => config,
            Err(err) => {
                telemetry::set_config_reload(false);
                return Err(err);
            }
        };
        telemetry::set_config_reload(true);
        Ok(Self {
            path,
            current: Arc::new(RwLock::new(Arc::new(LoadedConfig::start(config)))),
        })
    }

    /// The configuration file or directory this instance reloads from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The active configuration.
    #[must_use]
    pub fn current(&self) -> Arc<LoadedConfig> {
        self.current.read().clone()
    }

    /// Reload from the configured path.
    ///
    /// The new configuration is built and started before the swap; on
    /// failure the previous configuration stays active. The old
    /// configuration's stream tasks are cancelled after the swap.
    pub fn reload(&self) -> Result<()> {
        let config = match Config::load(&self.path) {
            Ok(config) => config,
            Err(err) => {
                telemetry::set_config_reload(false);
                return Err(err);
            }
        };
        let fresh = Arc::new(LoadedConfig::start(config));
        let previous = {
            let mut guard = self.current.write();
            std::mem::replace(&mut *guard, fresh)
        };
        previous.shutdown();
        telemetry::set_config_reload(true);
        info!(path = %self.path.display(), "configuration reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "
collects:
  - name: demo
    data_format: json
    datasource:
      - {name: f, url: 'file:///dev/null'}
    metrics:
      - name: demo_metric
        relabel_configs:
          - {source_labels: [v], target_label: __value__}
";

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        tmp.write_all(content.as_bytes()).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    #[test]
    fn test_load_single_file() {
        let tmp = write_config(SAMPLE);
        let config = Config::load(tmp.path()).unwrap();
        assert_eq!(config.collects.len(), 1);
        assert_eq!(config.collects[0].name, "demo");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let tmp = write_config("collects: []\nsurprise: 1\n");
        assert!(matches!(
            Config::load(tmp.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_invalid_rule_rejected_at_load() {
        let tmp = write_config(
            "
collects:
  - name: bad
    data_format: regex
    metrics:
      - name: m
        relabel_configs:
          - {action: hashmod, target_label: t}
",
        );
        assert!(Config::load(tmp.path()).is_err());
    }

    #[test]
    fn test_load_directory_merges_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("b.yaml"),
            "collects: [{name: second, data_format: json}]",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("a.yml"),
            "collects: [{name: first, data_format: json}]",
        )
        .unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "not yaml").unwrap();

        let config = Config::load(dir.path()).unwrap();
        let names: Vec<&str> = config.collects.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_reload_swaps_pointer_and_keeps_old_arc_valid() {
        let tmp = write_config(SAMPLE);
        let safe = SafeConfig::load(tmp.path().to_path_buf()).unwrap();
        let before = safe.current();
        assert_eq!(before.collects[0].name, "demo");

        std::fs::write(
            tmp.path(),
            "collects: [{name: renamed, data_format: json}]",
        )
        .unwrap();
        safe.reload().unwrap();

        // The old snapshot stays coherent for in-flight scrapes.
        assert_eq!(before.collects[0].name, "demo");
        assert_eq!(safe.current().collects[0].name, "renamed");
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_config() {
        let tmp = write_config(SAMPLE);
        let safe = SafeConfig::load(tmp.path().to_path_buf()).unwrap();

        std::fs::write(tmp.path(), "collects: [{name: broken}]").unwrap();
        assert!(safe.reload().is_err());
        assert_eq!(safe.current().collects[0].name, "demo");
    }
}
