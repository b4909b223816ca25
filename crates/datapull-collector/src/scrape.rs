//! The scrape coordinator: fan out non-stream datasources, funnel their
//! observations back and convert them into exposition samples.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::collect::Collect;
use crate::datasource::ReadMode;
use crate::exposition::Sample;
use crate::telemetry;

const CHANNEL_CAPACITY: usize = 64;

/// What a scrape covers: everything by default, narrowed by collect
/// name, datasource name and an override URL from the query string.
#[derive(Debug, Clone, Default)]
pub struct ScrapeSelection {
    /// Only this collect.
    pub collect: Option<String>,
    /// Only this datasource of the selected collect.
    pub datasource: Option<String>,
    /// Replacement URL, honoured only for `allow_replace` datasources.
    pub url: Option<String>,
}

/// Scrape every selected non-stream datasource in parallel and return
/// the produced samples.
///
/// Acquisition failures and timeouts are counted against the datasource
/// and logged; the scrape always returns whatever was produced.
pub async fn gather(collects: Arc<Vec<Collect>>, selection: ScrapeSelection) -> Vec<Sample> {
    let (tx, mut rx) = mpsc::channel::<crate::metric::Observation>(CHANNEL_CAPACITY);

    for (ci, collect) in collects.iter().enumerate() {
        if selection
            .collect
            .as_ref()
            .is_some_and(|name| *name != collect.name)
        {
            continue;
        }
        for (di, ds) in collect.datasource.iter().enumerate() {
            if ds.read_mode == ReadMode::Stream {
                continue;
            }
            if selection
                .datasource
                .as_ref()
                .is_some_and(|name| *name != ds.name)
            {
                continue;
            }
            let url_override = if ds.allow_replace {
                selection.url.clone()
            } else {
                None
            };

            let collects = Arc::clone(&collects);
            let tx = tx.clone();
            tokio::spawn(async move {
                let collect = &collects[ci];
                let ds = &collect.datasource[di];
                let work = collect.collect_datasource(ds, url_override.as_deref(), tx);
                match tokio::time::timeout(ds.timeout(), work).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        telemetry::inc_collect_error("datasource", &ds.name);
                        warn!(collect = %collect.name, datasource = %ds.name, %err, "failed to collect datasource");
                    }
                    Err(_) => {
                        telemetry::inc_collect_error("datasource", &ds.name);
                        warn!(collect = %collect.name, datasource = %ds.name, "datasource timed out");
                    }
                }
            });
        }
    }
    drop(tx);

    let mut samples = Vec::new();
    while let Some(obs) = rx.recv().await {
        samples.push(Sample::from(obs));
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config(yaml: &str) -> Arc<Vec<Collect>> {
        let mut collects: Vec<Collect> = serde_yaml::from_str(yaml).unwrap();
        for c in &mut collects {
            c.compile().unwrap();
        }
        Arc::new(collects)
    }

    #[tokio::test]
    async fn test_gather_from_file_datasource() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, r#"{{"cpu": "16", "host": "a"}}"#).unwrap();
        tmp.flush().unwrap();

        let collects = config(&format!(
            r"
- name: demo
  data_format: json
  datasource:
    - {{name: f, url: 'file://{}'}}
  metrics:
    - name: demo_cpu
      relabel_configs:
        - {{source_labels: [cpu], target_label: __value__}}
",
            tmp.path().display()
        ));
        let samples = gather(collects, ScrapeSelection::default()).await;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "demo_cpu");
    }

    #[tokio::test]
    async fn test_gather_selection_by_collect_and_datasource() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "x").unwrap();
        tmp.flush().unwrap();
        let url = format!("file://{}", tmp.path().display());

        let collects = config(&format!(
            "
- name: one
  data_format: regex
  datasource:
    - {{name: a, url: '{url}'}}
    - {{name: b, url: '{url}'}}
  metrics:
    - {{name: m_one}}
- name: two
  data_format: regex
  datasource:
    - {{name: a, url: '{url}'}}
  metrics:
    - {{name: m_two}}
"
        ));

        let all = gather(Arc::clone(&collects), ScrapeSelection::default()).await;
        assert_eq!(all.len(), 3);

        let only_one = gather(
            Arc::clone(&collects),
            ScrapeSelection {
                collect: Some("one".into()),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(only_one.len(), 2);

        let only_a = gather(
            collects,
            ScrapeSelection {
                collect: Some("one".into()),
                datasource: Some("a".into()),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(only_a.len(), 1);
    }

    #[tokio::test]
    async fn test_gather_survives_missing_file() {
        let collects = config(
            "
- name: broken
  data_format: regex
  datasource:
    - {name: gone, url: 'file:///does/not/exist'}
  metrics:
    - {name: m}
",
        );
        let samples = gather(collects, ScrapeSelection::default()).await;
        assert!(samples.is_empty());
    }

    #[tokio::test]
    async fn test_url_override_requires_allow_replace() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "data").unwrap();
        tmp.flush().unwrap();
        let real = format!("file://{}", tmp.path().display());

        // allow_replace: false keeps the configured URL, so pointing the
        // override at a missing file must still produce the sample.
        let collects = config(&format!(
            "
- name: c
  data_format: regex
  datasource:
    - {{name: locked, url: '{real}'}}
  metrics:
    - {{name: m}}
"
        ));
        let samples = gather(
            collects,
            ScrapeSelection {
                url: Some("file:///nope".into()),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(samples.len(), 1);
    }
}
