// =============================================================================
// EventStream — single long-lived SSE subscription per auction
// =============================================================================
//
// Structurally grounded on `market_data/trade_stream.rs`: connect, split the
// stream, loop over incoming frames, hand-parse JSON with raw
// `serde_json::Value` indexing. No SSE client crate exists anywhere in the
// reference pack, so the reader here is hand-rolled on top of
// `reqwest`'s `bytes_stream()` rather than introducing an unlisted
// dependency, matching the teacher's own preference for manual parsing
// over an extra crate for small jobs.

use crate::errors::UpstreamError;
use crate::events::{send_snapshot_lossy, SnapshotReceived};
use crate::types::{AuctionSnapshot, PipelineKind};
use crate::upstream::client::parse_product_payload;
use crate::upstream::UpstreamClient;
use bytes::Bytes;
use futures_util::StreamExt;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamHealth {
    Healthy,
    Unhealthy,
}

const IDLE_TIMEOUT: Duration = Duration::from_secs(45);
const UNHEALTHY_AFTER_FAILURES: u32 = 3;
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

pub struct EventStreamHandle {
    pub health_rx: watch::Receiver<StreamHealth>,
    cancel: CancellationToken,
}

impl EventStreamHandle {
    /// Cancels the subscription; any pending reconnect timer is dropped
    /// because the reconnect loop below selects on `cancel.cancelled()`.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Spawns the per-auction SSE subscription task. Returns a handle the
/// router uses to observe health and to cancel on removal.
pub fn spawn(
    auction_id: crate::types::AuctionId,
    sse_url: String,
    upstream: Arc<UpstreamClient>,
    snapshot_tx: mpsc::Sender<SnapshotReceived>,
) -> EventStreamHandle {
    let cancel = CancellationToken::new();
    let (health_tx, health_rx) = watch::channel(StreamHealth::Unhealthy);

    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        run(auction_id, sse_url, upstream, snapshot_tx, health_tx, task_cancel).await;
    });

    EventStreamHandle { health_rx, cancel }
}

#[instrument(skip(upstream, snapshot_tx, health_tx, cancel), fields(auction_id = %auction_id))]
async fn run(
    auction_id: crate::types::AuctionId,
    sse_url: String,
    upstream: Arc<UpstreamClient>,
    snapshot_tx: mpsc::Sender<SnapshotReceived>,
    health_tx: watch::Sender<StreamHealth>,
    cancel: CancellationToken,
) {
    let mut consecutive_failures: u32 = 0;
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        // A fresh connection only carries deltas; fetch the full snapshot
        // immediately so downstream state isn't missing fields.
        match upstream.fetch_auction(&auction_id.0).await {
            Ok(fetch) => {
                send_snapshot_lossy(
                    &snapshot_tx,
                    SnapshotReceived {
                        auction_id: auction_id.clone(),
                        snapshot: fetch.snapshot,
                        source: PipelineKind::Stream,
                    },
                )
                .await;
            }
            Err(e) => {
                warn!(error = %e, "initial fetch on stream connect failed");
            }
        }

        let connect_result = tokio::select! {
            res = connect_and_consume(&auction_id, &sse_url, &snapshot_tx, &cancel) => res,
            _ = cancel.cancelled() => return,
        };

        match connect_result {
            Ok(()) => {
                consecutive_failures = 0;
                backoff = BACKOFF_INITIAL;
                let _ = health_tx.send(StreamHealth::Healthy);
            }
            Err(e) => {
                consecutive_failures += 1;
                debug!(error = %e, consecutive_failures, "event stream disconnected");
                if consecutive_failures >= UNHEALTHY_AFTER_FAILURES {
                    let _ = health_tx.send(StreamHealth::Unhealthy);
                }
            }
        }

        if cancel.is_cancelled() {
            return;
        }

        let jitter = 1.0 + rand::thread_rng().gen_range(-0.1..=0.1);
        let sleep_for = Duration::from_secs_f64((backoff.as_secs_f64() * jitter).max(0.1));
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = cancel.cancelled() => return,
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

/// Connects once and consumes frames until the stream closes, the idle
/// timeout fires, or a `ch_product_closed:<id>` terminal event arrives.
async fn connect_and_consume(
    auction_id: &crate::types::AuctionId,
    sse_url: &str,
    snapshot_tx: &mpsc::Sender<SnapshotReceived>,
    cancel: &CancellationToken,
) -> Result<(), UpstreamError> {
    let url = format!("{sse_url}/live-products?productId={}", auction_id.0);
    let resp = reqwest::Client::new()
        .get(&url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(|e| UpstreamError::Transport(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(UpstreamError::Transport(format!(
            "sse connect status {}",
            resp.status()
        )));
    }

    let mut stream = resp.bytes_stream();
    let mut parser = SseParser::new();
    let bids_event = format!("ch_product_bids:{}", auction_id.0);
    let closed_event = format!("ch_product_closed:{}", auction_id.0);

    loop {
        let chunk = tokio::select! {
            chunk = tokio::time::timeout(IDLE_TIMEOUT, stream.next()) => chunk,
            _ = cancel.cancelled() => return Ok(()),
        };

        let chunk = match chunk {
            Ok(Some(Ok(bytes))) => bytes,
            Ok(Some(Err(e))) => return Err(UpstreamError::Transport(e.to_string())),
            Ok(None) => return Err(UpstreamError::Transport("stream closed".into())),
            Err(_) => return Err(UpstreamError::Transport("idle timeout".into())),
        };

        for frame in parser.feed(chunk) {
            if frame.event.is_none() {
                // Unnamed heartbeat/ping; nothing to parse, idle timer
                // already reset by having received bytes at all.
                continue;
            }
            let event_name = frame.event.as_deref().unwrap_or_default();
            if event_name == bids_event {
                if let Ok(body) = serde_json::from_str::<serde_json::Value>(&frame.data) {
                    if let Ok(fetch) = parse_product_payload(&wrap_product(body)) {
                        send_snapshot_lossy(
                            snapshot_tx,
                            SnapshotReceived {
                                auction_id: auction_id.clone(),
                                snapshot: fetch.snapshot,
                                source: PipelineKind::Stream,
                            },
                        )
                        .await;
                    }
                }
            } else if event_name == closed_event {
                if let Some(mut snapshot) = last_known_closed_snapshot(&frame.data) {
                    snapshot.is_closed = true;
                    send_snapshot_lossy(
                        snapshot_tx,
                        SnapshotReceived {
                            auction_id: auction_id.clone(),
                            snapshot,
                            source: PipelineKind::Stream,
                        },
                    )
                    .await;
                }
                return Ok(());
            }
        }
    }
}

/// The bid/closed event bodies carry the same fields as the product fetch
/// but without the top-level `product` wrapper; re-wrap so the shared
/// parser in `upstream::client` can be reused unchanged.
fn wrap_product(body: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "product": body })
}

fn last_known_closed_snapshot(data: &str) -> Option<AuctionSnapshot> {
    let body: serde_json::Value = serde_json::from_str(data).ok()?;
    parse_product_payload(&wrap_product(body)).ok().map(|f| f.snapshot)
}

struct SseFrame {
    event: Option<String>,
    data: String,
}

/// Minimal line-buffering SSE tokenizer: accumulates `field: value` lines
/// until a blank line terminates one event, matching the protocol's wire
/// format without depending on an SSE crate.
struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            event: None,
            data_lines: Vec::new(),
        }
    }

    fn feed(&mut self, bytes: Bytes) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(&bytes));
        let mut frames = Vec::new();

        while let Some(idx) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=idx).collect();
            let line = line.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                let data = self.data_lines.join("\n");
                frames.push(SseFrame {
                    event: self.event.take(),
                    data,
                });
                self.data_lines.clear();
                continue;
            }

            if let Some(rest) = line.strip_prefix("event:") {
                self.event = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data_lines.push(rest.trim().to_string());
            }
        }

        frames
    }
}
