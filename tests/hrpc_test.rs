//! Binary RPC integration test over a real TCP socket.

use htraced::core::config::DATA_STORE_DIRECTORIES;
use htraced::core::span::{Span, SpanId, SpanOptions};
use htraced::metrics::MetricsSink;
use htraced::query::QueryExecutor;
use htraced::receivers::SharedReceiverList;
use htraced::server::hrpc::{
    self, encode_request_frame, encode_write_spans_body, HrpcState, METHOD_QUERY,
    METHOD_WRITE_SPANS,
};
use htraced::storage::DataStore;
use htraced::Config;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn sid(low: u64) -> SpanId {
    SpanId::from_parts(0, low)
}

async fn read_reply(stream: &mut TcpStream) -> (u32, Vec<u8>) {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await.unwrap();
    let status = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await.unwrap();
    (status, body)
}

#[tokio::test]
async fn test_write_spans_and_query_over_rpc() {
    let base = TempDir::new().unwrap();
    let mut config = Config::new();
    let dirs = format!(
        "{};{}",
        base.path().join("shard0").display(),
        base.path().join("shard1").display()
    );
    config.set(DATA_STORE_DIRECTORIES, &dirs);

    let sink = MetricsSink::spawn(8, Duration::from_secs(3600));
    let store = DataStore::open(&config, sink.handle()).unwrap();
    let state = HrpcState {
        store: store.clone(),
        executor: Arc::new(QueryExecutor::new(store.clone(), 100)),
        receivers: Arc::new(SharedReceiverList::new()),
        query_timeout: Duration::from_secs(30),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(hrpc::serve(listener, state));

    let mut stream = TcpStream::connect(addr).await.unwrap();

    // Write two spans; the first omits its tracer id and picks up the
    // frame default.
    let spans = vec![
        Span::from_options(SpanOptions {
            id: sid(1),
            begin_ms: 100,
            end_ms: 150,
            description: "rpcOp".to_string(),
            ..Default::default()
        }),
        Span::from_options(SpanOptions {
            id: sid(2),
            begin_ms: 200,
            end_ms: 260,
            description: "rpcOp".to_string(),
            tracer_id: "explicit".to_string(),
            ..Default::default()
        }),
    ];
    let body = encode_write_spans_body("rpc-default", &spans);
    stream
        .write_all(&encode_request_frame(METHOD_WRITE_SPANS, &body))
        .await
        .unwrap();
    let (status, reply) = read_reply(&mut stream).await;
    assert_eq!(status, 0, "error reply: {}", String::from_utf8_lossy(&reply));
    let reply: serde_json::Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(reply["Written"], 2);

    // The spans are durable before the reply, so a query sees them.
    let query = r#"{"pred":[{"op":"ge","field":"begin","val":"150"}],"lim":10}"#;
    stream
        .write_all(&encode_request_frame(METHOD_QUERY, query.as_bytes()))
        .await
        .unwrap();
    let (status, reply) = read_reply(&mut stream).await;
    assert_eq!(status, 0);
    let spans_json: serde_json::Value = serde_json::from_slice(&reply).unwrap();
    let returned = spans_json.as_array().unwrap();
    assert_eq!(returned.len(), 1);
    assert_eq!(returned[0]["s"], sid(2).to_string());
    assert_eq!(returned[0]["r"], "explicit");

    let stored = store.find_span(&sid(1)).unwrap().unwrap();
    assert_eq!(stored.tracer_id, "rpc-default");

    // A bad query frame errors without closing the connection.
    stream
        .write_all(&encode_request_frame(METHOD_QUERY, b"{broken"))
        .await
        .unwrap();
    let (status, reply) = read_reply(&mut stream).await;
    assert_eq!(status, 1);
    assert!(String::from_utf8_lossy(&reply).contains("Invalid query JSON"));

    // And the connection still answers afterwards.
    stream
        .write_all(&encode_request_frame(METHOD_QUERY, b"{}"))
        .await
        .unwrap();
    let (status, reply) = read_reply(&mut stream).await;
    assert_eq!(status, 0);
    let all: serde_json::Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(all.as_array().unwrap().len(), 2);

    drop(stream);
    server.abort();
    let _ = server.await;

    DataStore::shutdown_arc(store);
    sink.shutdown();
}
