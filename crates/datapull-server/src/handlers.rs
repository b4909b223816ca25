//! HTTP request handlers for the exporter surface.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::error;

use datapull_collector::{gather, render, telemetry, ScrapeSelection};

use crate::state::AppState;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Query parameters for the per-collect scrape endpoint.
#[derive(Debug, Deserialize)]
pub struct ScrapeParams {
    /// Limit the scrape to one datasource of the collect.
    pub datasource: Option<String>,
    /// Override that datasource's URL (requires `allow_replace`).
    pub url: Option<String>,
}

/// Handle GET /metrics - scrape every collect.
pub async fn metrics(State(state): State<AppState>) -> Response {
    let loaded = state.config.current();
    let mut samples = gather(loaded.collects.clone(), ScrapeSelection::default()).await;
    samples.extend(loaded.group.collect());
    text_response(&samples)
}

/// Handle GET /{collect_name}/metrics - scrape one collect.
pub async fn collect_metrics(
    State(state): State<AppState>,
    Path(collect_name): Path<String>,
    Query(params): Query<ScrapeParams>,
) -> Response {
    let loaded = state.config.current();
    let Some(collect) = loaded.collects.iter().find(|c| c.name == collect_name) else {
        return (StatusCode::NOT_FOUND, format!("unknown collect {collect_name:?}\n"))
            .into_response();
    };

    if let Some(ds_name) = &params.datasource {
        let Some(ds) = collect.datasource.iter().find(|d| d.name == *ds_name) else {
            return (
                StatusCode::NOT_FOUND,
                format!("unknown datasource {ds_name:?} in collect {collect_name:?}\n"),
            )
                .into_response();
        };
        if params.url.is_some() && !ds.allow_replace {
            return (
                StatusCode::BAD_REQUEST,
                format!("datasource {ds_name:?} does not allow url replacement\n"),
            )
                .into_response();
        }
    } else if params.url.is_some() {
        return (
            StatusCode::BAD_REQUEST,
            "url replacement requires a datasource parameter\n".to_string(),
        )
            .into_response();
    }

    let selection = ScrapeSelection {
        collect: Some(collect_name),
        datasource: params.datasource,
        url: params.url,
    };
    let mut samples = gather(loaded.collects.clone(), selection).await;
    samples.extend(loaded.group.collect());
    text_response(&samples)
}

/// Handle POST /-/reload - swap in a fresh configuration.
pub async fn reload(State(state): State<AppState>) -> Response {
    match state.config.reload() {
        Ok(()) => (StatusCode::OK, "Reloaded\n").into_response(),
        Err(err) => {
            error!(%err, "failed to reload config");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to reload config: {err}\n"),
            )
                .into_response()
        }
    }
}

/// Handle GET /-/healthy.
pub async fn healthy() -> Response {
    (StatusCode::OK, "Healthy").into_response()
}

fn text_response(samples: &[datapull_collector::Sample]) -> Response {
    let mut body = render(samples);
    body.push_str(&telemetry::encode());
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response()
}
