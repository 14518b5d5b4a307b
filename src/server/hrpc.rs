//! Binary RPC adapter.
//!
//! Frames are length-prefixed: a 12-byte header of `magic`, `method`, and
//! `len` (all u32 little-endian) followed by `len` body bytes. Spans travel
//! in the tagged binary codec; queries travel as their JSON wire form.
//! Replies carry a status word (0 ok, 1 error) plus a body.
//!
//! Unlike the REST path, RPC writers block on a full shard queue instead
//! of dropping, and every frame's spans are committed before the reply.

use crate::codec;
use crate::core::error::{HtracedError, Result};
use crate::core::span::Span;
use crate::query::{Query as SpanQuery, QueryExecutor};
use crate::receivers::SharedReceiverList;
use crate::storage::ingest::SpanIngestor;
use crate::storage::store::DataStore;
use crate::storage::writer::now_ms;
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// "HTRC" interpreted as a little-endian word.
pub const HRPC_MAGIC: u32 = 0x4352_5448;
pub const METHOD_WRITE_SPANS: u32 = 1;
pub const METHOD_QUERY: u32 = 2;
/// Upper bound on a request or reply body.
pub const MAX_FRAME_LEN: u32 = 32 * 1024 * 1024;

const STATUS_OK: u32 = 0;
const STATUS_ERROR: u32 = 1;

/// Shared state behind every RPC connection.
#[derive(Clone)]
pub struct HrpcState {
    pub store: Arc<DataStore>,
    pub executor: Arc<QueryExecutor>,
    pub receivers: Arc<SharedReceiverList>,
    pub query_timeout: Duration,
}

/// Accept loop; one task per connection.
pub async fn serve(listener: TcpListener, state: HrpcState) -> Result<()> {
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| HtracedError::network(format!("RPC accept failed: {}", e)))?;
        let state = state.clone();
        tokio::spawn(async move {
            let peer = peer.to_string();
            if let Err(e) = handle_connection(stream, &peer, state).await {
                tracing::debug!(peer = %peer, error = %e, "RPC connection closed");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, peer: &str, state: HrpcState) -> Result<()> {
    // The ingestor lives for the whole connection and blocks on full
    // queues rather than dropping.
    let mut ingestor = Some(state.store.ingestor(peer, "").blocking(true));

    loop {
        let mut header = [0u8; 12];
        match stream.read_exact(&mut header).await {
            Ok(_) => {},
            // Clean EOF between frames ends the connection.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let method = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if magic != HRPC_MAGIC {
            write_reply(
                &mut stream,
                STATUS_ERROR,
                format!("Bad frame magic {:#010x}", magic).as_bytes(),
            )
            .await?;
            break;
        }
        if len > MAX_FRAME_LEN {
            write_reply(
                &mut stream,
                STATUS_ERROR,
                format!("Frame of {} bytes exceeds the {} byte cap", len, MAX_FRAME_LEN)
                    .as_bytes(),
            )
            .await?;
            break;
        }

        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).await?;

        match method {
            METHOD_WRITE_SPANS => {
                // Move the ingestor through the blocking task and back.
                let receivers = state.receivers.clone();
                let mut owned = ingestor.take().ok_or(HtracedError::Shutdown)?;
                let (owned, outcome) = tokio::task::spawn_blocking(move || {
                    let outcome = handle_write_spans(&mut owned, &receivers, &body);
                    (owned, outcome)
                })
                .await
                .map_err(|_| HtracedError::storage("RPC ingest task panicked"))?;
                ingestor = Some(owned);

                match outcome {
                    Ok(written) => {
                        let reply = serde_json::to_vec(&serde_json::json!({ "Written": written }))?;
                        write_reply(&mut stream, STATUS_OK, &reply).await?;
                    },
                    Err(e) => {
                        write_reply(&mut stream, STATUS_ERROR, e.to_string().as_bytes()).await?;
                    },
                }
            },
            METHOD_QUERY => {
                let outcome = handle_query(&state, &body).await;
                match outcome {
                    Ok(reply) => write_reply(&mut stream, STATUS_OK, &reply).await?,
                    Err(e) => {
                        write_reply(&mut stream, STATUS_ERROR, e.to_string().as_bytes()).await?
                    },
                }
            },
            _ => {
                write_reply(
                    &mut stream,
                    STATUS_ERROR,
                    format!("Unknown method {}", method).as_bytes(),
                )
                .await?;
                break;
            },
        }
    }

    if let Some(ingestor) = ingestor {
        ingestor.close(now_ms());
    }
    Ok(())
}

/// Decodes a writeSpans body: default tracer id, then a counted sequence
/// of length-prefixed binary spans.
fn decode_write_spans_body(body: &[u8]) -> Result<(String, Vec<Span>)> {
    let mut cursor = body;
    if cursor.remaining() < 2 {
        return Err(HtracedError::bad_request("Truncated writeSpans body"));
    }
    let trid_len = cursor.get_u16() as usize;
    if cursor.remaining() < trid_len {
        return Err(HtracedError::bad_request("Truncated default tracer id"));
    }
    let (trid_bytes, rest) = cursor.split_at(trid_len);
    cursor = rest;
    let default_tracer_id = String::from_utf8(trid_bytes.to_vec())
        .map_err(|_| HtracedError::bad_request("Default tracer id is not valid UTF-8"))?;

    if cursor.remaining() < 4 {
        return Err(HtracedError::bad_request("Truncated span count"));
    }
    let count = cursor.get_u32() as usize;
    let mut spans = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if cursor.remaining() < 4 {
            return Err(HtracedError::bad_request("Truncated span length"));
        }
        let span_len = cursor.get_u32() as usize;
        if cursor.remaining() < span_len {
            return Err(HtracedError::bad_request("Truncated span body"));
        }
        let (span_bytes, rest) = cursor.split_at(span_len);
        cursor = rest;
        spans.push(codec::decode(span_bytes)?);
    }
    Ok((default_tracer_id, spans))
}

/// Encodes a writeSpans body; used by RPC clients and the tests.
pub fn encode_write_spans_body(default_tracer_id: &str, spans: &[Span]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u16(default_tracer_id.len() as u16);
    body.put_slice(default_tracer_id.as_bytes());
    body.put_u32(spans.len() as u32);
    for span in spans {
        let encoded = codec::encode(span);
        body.put_u32(encoded.len() as u32);
        body.put_slice(&encoded);
    }
    body.to_vec()
}

fn handle_write_spans(
    ingestor: &mut SpanIngestor,
    receivers: &SharedReceiverList,
    body: &[u8],
) -> Result<u64> {
    let (default_tracer_id, spans) = decode_write_spans_body(body)?;
    let mut written = 0u64;
    let mut commits = Vec::with_capacity(spans.len());
    for mut span in spans {
        if span.tracer_id.is_empty() {
            span.tracer_id = default_tracer_id.clone();
        }
        let broadcast_copy = span.clone();
        let (done_sender, done_receiver) = tokio::sync::oneshot::channel();
        match ingestor.ingest_with_hook(span, Some(done_sender)) {
            Ok(()) => {
                commits.push(done_receiver);
                receivers.broadcast(&broadcast_copy);
            },
            Err(e) => {
                tracing::debug!(error = %e, "Span rejected during RPC writeSpans");
            },
        }
    }
    for receiver in commits {
        match receiver.blocking_recv() {
            Ok(Ok(())) => written += 1,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(HtracedError::ChannelReceive),
        }
    }
    Ok(written)
}

async fn handle_query(state: &HrpcState, body: &[u8]) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(body)
        .map_err(|_| HtracedError::bad_query("Query body is not valid UTF-8"))?;
    let query = SpanQuery::parse(text)?;
    let result = tokio::time::timeout(state.query_timeout, state.executor.execute(&query))
        .await
        .map_err(|_| HtracedError::Timeout {
            timeout_ms: state.query_timeout.as_millis() as u64,
        })??;
    Ok(serde_json::to_vec(&result.spans)?)
}

async fn write_reply(stream: &mut TcpStream, status: u32, body: &[u8]) -> Result<()> {
    let mut frame = BytesMut::with_capacity(8 + body.len());
    frame.put_u32_le(status);
    frame.put_u32_le(body.len() as u32);
    frame.put_slice(body);
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Builds a request frame; used by RPC clients and the tests.
pub fn encode_request_frame(method: u32, body: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(12 + body.len());
    frame.put_u32_le(HRPC_MAGIC);
    frame.put_u32_le(method);
    frame.put_u32_le(body.len() as u32);
    frame.put_slice(body);
    frame.to_vec()
}
