//! Route configuration for the exporter surface.

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers::{collect_metrics, healthy, metrics, reload};
use crate::state::AppState;

/// Create the exporter router, mounted under `route_prefix`.
pub fn create_router(state: AppState, route_prefix: &str) -> Router {
    let routes = Router::new()
        .route("/metrics", get(metrics))
        .route("/{collect_name}/metrics", get(collect_metrics))
        .route("/-/reload", post(reload))
        .route("/-/healthy", get(healthy))
        .with_state(state);

    let router = if route_prefix == "/" {
        routes
    } else {
        Router::new().nest(route_prefix, routes)
    };
    router.layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::io::Write;
    use tower::ServiceExt;

    use datapull_config::SafeConfig;

    fn make_state(config: &str) -> (AppState, tempfile::NamedTempFile) {
        let mut tmp = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        tmp.write_all(config.as_bytes()).unwrap();
        tmp.flush().unwrap();
        let safe = SafeConfig::load(tmp.path().to_path_buf()).unwrap();
        (AppState::new(safe), tmp)
    }

    fn data_file(content: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(content.as_bytes()).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_healthy_endpoint() {
        let (state, _cfg) = make_state("collects: []");
        let app = create_router(state, "/");
        let response = app
            .oneshot(Request::builder().uri("/-/healthy").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "Healthy");
    }

    #[tokio::test]
    async fn test_reload_requires_post() {
        let (state, _cfg) = make_state("collects: []");
        let app = create_router(state, "/");
        let response = app
            .oneshot(Request::builder().uri("/-/reload").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_metrics_scrapes_collects() {
        let data = data_file(r#"{"cpu": "42"}"#);
        let (state, _cfg) = make_state(&format!(
            "
collects:
  - name: demo
    data_format: json
    datasource:
      - {{name: f, url: 'file://{}'}}
    metrics:
      - name: demo_cpu
        relabel_configs:
          - {{source_labels: [cpu], target_label: __value__}}
",
            data.path().display()
        ));
        let app = create_router(state, "/");
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("# TYPE demo_cpu gauge"), "{body}");
        assert!(body.contains("demo_cpu{cpu=\"42\"} 42"), "{body}");
        assert!(body.contains("datapull_config_last_reload_successful 1"), "{body}");
    }

    #[tokio::test]
    async fn test_collect_scoped_scrape_and_unknown_collect() {
        let data = data_file(r#"{"v": "1"}"#);
        let (state, _cfg) = make_state(&format!(
            "
collects:
  - name: demo
    data_format: json
    datasource:
      - {{name: f, url: 'file://{}'}}
    metrics:
      - {{name: demo_m}}
",
            data.path().display()
        ));
        let app = create_router(state, "/");

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/demo/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/nope/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_url_override_rejected_without_allow_replace() {
        let data = data_file("x");
        let (state, _cfg) = make_state(&format!(
            "
collects:
  - name: demo
    data_format: regex
    datasource:
      - {{name: locked, url: 'file://{}'}}
    metrics:
      - {{name: m}}
",
            data.path().display()
        ));
        let app = create_router(state, "/");
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/demo/metrics?datasource=locked&url=file:///etc/passwd")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_route_prefix_mounting() {
        let (state, _cfg) = make_state("collects: []");
        let app = create_router(state, "/exporter");
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/exporter/-/healthy")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/-/healthy").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
