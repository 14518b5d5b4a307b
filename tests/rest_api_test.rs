//! REST adapter tests driving the axum router in-process.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use htraced::core::config::DATA_STORE_DIRECTORIES;
use htraced::metrics::MetricsSink;
use htraced::query::QueryExecutor;
use htraced::receivers::SharedReceiverList;
use htraced::server::rest::{create_router, RestState, TRACER_ID_HEADER};
use htraced::storage::DataStore;
use htraced::Config;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

struct TestServer {
    router: Router,
    store: Arc<DataStore>,
    sink: MetricsSink,
}

fn test_server(base: &TempDir) -> TestServer {
    let mut config = Config::new();
    let dirs = format!(
        "{};{}",
        base.path().join("shard0").display(),
        base.path().join("shard1").display()
    );
    config.set(DATA_STORE_DIRECTORIES, &dirs);

    let sink = MetricsSink::spawn(8, Duration::from_secs(3600));
    let store = DataStore::open(&config, sink.handle()).unwrap();
    let state = RestState {
        store: store.clone(),
        sink: sink.handle(),
        executor: Arc::new(QueryExecutor::new(store.clone(), 100)),
        receivers: Arc::new(SharedReceiverList::new()),
        query_timeout: Duration::from_secs(30),
        children_default_limit: 100,
    };
    TestServer {
        router: create_router(state),
        store,
        sink,
    }
}

impl TestServer {
    fn shutdown(self) {
        let TestServer { router, store, sink } = self;
        drop(router);
        DataStore::shutdown_arc(store);
        sink.shutdown();
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Minimal percent-encoding for the `query` URL parameter.
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() * 3);
    for byte in raw.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            },
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

const ID_ONE: &str = "00000000000000000000000000000001";
const ID_TWO: &str = "00000000000000000000000000000002";
const ID_MISSING: &str = "000000000000000000000000000000aa";

async fn write_scenario_spans(router: &Router) {
    let body = format!(
        "{}\n{}\n",
        format!(r#"{{"s":"{}","b":123,"e":150,"d":"getFileDescriptors"}}"#, ID_ONE),
        format!(
            r#"{{"s":"{}","b":125,"e":160,"d":"readBlock","p":["{}"]}}"#,
            ID_TWO, ID_ONE
        ),
    );
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/writeSpans")
                .header(TRACER_ID_HEADER, "rest-test")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let written = body_json(response).await;
    assert_eq!(written["Written"], 2);
    assert_eq!(written["Dropped"], 0);
}

#[tokio::test]
async fn test_write_then_read_span() {
    let base = TempDir::new().unwrap();
    let server = test_server(&base);
    write_scenario_spans(&server.router).await;

    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/span/{}", ID_ONE))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let span = body_json(response).await;
    assert_eq!(span["s"], ID_ONE);
    assert_eq!(span["b"], 123);
    assert_eq!(span["d"], "getFileDescriptors");
    // The htrace-trid header filled the missing tracer id.
    assert_eq!(span["r"], "rest-test");

    server.shutdown();
}

#[tokio::test]
async fn test_missing_span_is_no_content() {
    let base = TempDir::new().unwrap();
    let server = test_server(&base);

    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/span/{}", ID_MISSING))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    server.shutdown();
}

#[tokio::test]
async fn test_malformed_span_id_is_bad_request() {
    let base = TempDir::new().unwrap();
    let server = test_server(&base);

    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/span/not-hex")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    let message = body["error"].as_str().unwrap();
    assert!(!message.contains('"'), "quotes not normalized: {}", message);

    server.shutdown();
}

#[tokio::test]
async fn test_children_endpoint() {
    let base = TempDir::new().unwrap();
    let server = test_server(&base);
    write_scenario_spans(&server.router).await;

    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/span/{}/children?lim=10", ID_ONE))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let children = body_json(response).await;
    assert_eq!(children, serde_json::json!([ID_TWO]));

    server.shutdown();
}

#[tokio::test]
async fn test_query_endpoint_with_urlencoded_json() {
    let base = TempDir::new().unwrap();
    let server = test_server(&base);
    write_scenario_spans(&server.router).await;

    let query = r#"{"pred":[{"op":"ge","field":"begin","val":"125"}],"lim":5}"#;
    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/query?query={}", urlencode(query)))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let spans = body_json(response).await;
    let returned: Vec<&str> = spans
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["s"].as_str().unwrap())
        .collect();
    assert_eq!(returned, vec![ID_TWO]);

    server.shutdown();
}

#[tokio::test]
async fn test_bad_query_json_is_rejected() {
    let base = TempDir::new().unwrap();
    let server = test_server(&base);

    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/query?query={}", urlencode("{not json")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    server.shutdown();
}

#[tokio::test]
async fn test_write_spans_skips_bad_spans_but_continues() {
    let base = TempDir::new().unwrap();
    let server = test_server(&base);

    // The zero id is rejected per-span; the good span still lands.
    let body = format!(
        "{}\n{}\n",
        r#"{"s":"00000000000000000000000000000000","b":1,"e":2}"#,
        format!(r#"{{"s":"{}","b":3,"e":4,"d":"ok"}}"#, ID_ONE),
    );
    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/writeSpans")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let outcome = body_json(response).await;
    assert_eq!(outcome["Written"], 1);
    assert_eq!(outcome["Dropped"], 1);

    server.shutdown();
}

#[tokio::test]
async fn test_malformed_write_spans_body_is_bad_request() {
    let base = TempDir::new().unwrap();
    let server = test_server(&base);

    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/writeSpans")
                .body(Body::from("this is not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    server.shutdown();
}

#[tokio::test]
async fn test_server_info_and_stats() {
    let base = TempDir::new().unwrap();
    let server = test_server(&base);
    write_scenario_spans(&server.router).await;

    let response = server
        .router
        .clone()
        .oneshot(Request::builder().uri("/server/info").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let info = body_json(response).await;
    assert!(info["ReleaseVersion"].is_string());
    assert!(info["GitVersion"].is_string());

    let response = server
        .router
        .clone()
        .oneshot(Request::builder().uri("/server/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["IngestedSpans"], 2);
    let by_origin = stats["ByOrigin"].as_object().unwrap();
    // Without a socket the adapter accounts the peer as "unknown".
    assert_eq!(by_origin["unknown"]["Written"], 2);

    server.shutdown();
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let base = TempDir::new().unwrap();
    let server = test_server(&base);

    let response = server
        .router
        .clone()
        .oneshot(Request::builder().uri("/no/such/path").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("/no/such/path"));

    server.shutdown();
}
