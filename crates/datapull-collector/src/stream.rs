//! Long-lived tasks for stream (push) datasources.
//!
//! Each stream datasource owns one task for the lifetime of its config:
//! open the line stream, feed every record through the pipeline into the
//! aggregation store, and retry on failure until the config's scope is
//! cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::aggregate::MetricGroup;
use crate::collect::Collect;
use crate::datasource::ReadMode;
use crate::error::Result;
use crate::telemetry;

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Spawn one task per stream datasource. The tasks exit when `token` is
/// cancelled.
pub fn start_streams(
    collects: Arc<Vec<Collect>>,
    group: Arc<MetricGroup>,
    token: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for (ci, collect) in collects.iter().enumerate() {
        for (di, ds) in collect.datasource.iter().enumerate() {
            if ds.read_mode != ReadMode::Stream {
                continue;
            }
            let collects = Arc::clone(&collects);
            let group = Arc::clone(&group);
            let token = token.child_token();
            handles.push(tokio::spawn(async move {
                let collect = &collects[ci];
                let ds = &collect.datasource[di];
                loop {
                    match run_stream(collect, di, &group, &token).await {
                        Ok(()) => debug!(datasource = %ds.name, "stream ended"),
                        Err(err) => {
                            telemetry::inc_collect_error("datasource", &ds.name);
                            warn!(datasource = %ds.name, %err, "stream failed");
                        }
                    }
                    tokio::select! {
                        () = token.cancelled() => break,
                        () = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
                debug!(datasource = %ds.name, "stream task exiting");
            }));
        }
    }
    handles
}

async fn run_stream(
    collect: &Collect,
    ds_index: usize,
    group: &MetricGroup,
    token: &CancellationToken,
) -> Result<()> {
    let ds = &collect.datasource[ds_index];
    let mut stream = tokio::select! {
        () = token.cancelled() => return Ok(()),
        opened = ds.open_line_stream(None) => opened?,
    };
    loop {
        let line = tokio::select! {
            () = token.cancelled() => return Ok(()),
            line = stream.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.is_empty() {
            continue;
        }
        for obs in collect.process_record(ds, &line) {
            if let Err(err) = group.handle(&obs) {
                telemetry::inc_collect_error("metric", &obs.name);
                warn!(datasource = %ds.name, %err, "failed to aggregate observation");
            }
        }
    }
}
