// =============================================================================
// PollingQueue — ordered, rate-limited polling fallback/primary pipeline
// =============================================================================
//
// Structurally grounded on `exit/monitor.rs`'s periodic-ticker-over-a-
// shared-map shape, generalized from a fixed interval to a dynamic
// per-item due-time heap, and on `binance/rate_limit.rs`'s idea of
// enforcing a minimum spacing between outbound calls.

use crate::circuit_breaker::CircuitBreaker;
use crate::errors::BreakerError;
use crate::events::{send_snapshot_lossy, SnapshotReceived};
use crate::types::{AuctionId, PipelineKind};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(6);
pub const END_GAME_INTERVAL: Duration = Duration::from_secs(2);
pub const END_GAME_THRESHOLD_SECONDS: i64 = 30;
pub const MIN_SPACING: Duration = Duration::from_millis(150);
const FAILURE_SKIP_THRESHOLD: u32 = 3;

#[derive(Clone)]
struct QueueEntry {
    id: AuctionId,
    due_at: Instant,
    interval: Duration,
    consecutive_failures: u32,
}

// BinaryHeap is a max-heap; wrap due_at in Reverse so the earliest due
// item sorts to the top, and order only by due_at (ids are not Ord-unique
// across entries so deriving Ord on the whole struct would be wrong).
struct HeapItem(Reverse<Instant>, QueueEntry);

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

pub struct PollingQueue {
    heap: Mutex<BinaryHeap<HeapItem>>,
    breaker: Arc<CircuitBreaker>,
    snapshot_tx: mpsc::Sender<SnapshotReceived>,
    cancel: CancellationToken,
    circuit_cooldown: Duration,
}

impl PollingQueue {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        snapshot_tx: mpsc::Sender<SnapshotReceived>,
        circuit_cooldown: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            breaker,
            snapshot_tx,
            cancel: CancellationToken::new(),
            circuit_cooldown,
        })
    }

    pub fn enqueue(&self, id: AuctionId) {
        self.heap.lock().push(HeapItem(
            Reverse(Instant::now()),
            QueueEntry {
                id,
                due_at: Instant::now(),
                interval: DEFAULT_INTERVAL,
                consecutive_failures: 0,
            },
        ));
    }

    /// Removes every pending entry for `id`. Used when an auction is
    /// removed or switched to EventStream.
    pub fn remove(&self, id: &AuctionId) {
        let mut heap = self.heap.lock();
        let remaining: Vec<HeapItem> = heap
            .drain()
            .filter(|item| &item.1.id != id)
            .collect();
        *heap = remaining.into_iter().collect();
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Runs the single worker loop. Intended to be spawned once per
    /// process; `Arc<Self>` lets it be shared with `enqueue`/`remove`
    /// callers on other tasks.
    pub async fn run(self: Arc<Self>) {
        let mut last_fetch_at: Option<Instant> = None;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let next = {
                let mut heap = self.heap.lock();
                heap.pop()
            };

            let Some(HeapItem(_, mut entry)) = next else {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(200)) => continue,
                    _ = self.cancel.cancelled() => return,
                }
            };

            let now = Instant::now();
            if entry.due_at > now {
                let wait = entry.due_at - now;
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.cancel.cancelled() => return,
                }
            }

            if let Some(last) = last_fetch_at {
                let elapsed = last.elapsed();
                if elapsed < MIN_SPACING {
                    tokio::time::sleep(MIN_SPACING - elapsed).await;
                }
            }
            last_fetch_at = Some(Instant::now());

            match self.breaker.fetch_auction(&entry.id.0).await {
                Ok(fetch) => {
                    let snapshot = fetch.snapshot;
                    let end_game = snapshot.time_remaining_seconds(chrono::Utc::now())
                        <= END_GAME_THRESHOLD_SECONDS;
                    entry.interval = if end_game {
                        END_GAME_INTERVAL
                    } else {
                        DEFAULT_INTERVAL
                    };
                    entry.consecutive_failures = 0;
                    entry.due_at = Instant::now() + entry.interval;

                    send_snapshot_lossy(
                        &self.snapshot_tx,
                        SnapshotReceived {
                            auction_id: entry.id.clone(),
                            snapshot,
                            source: PipelineKind::Polling,
                        },
                    )
                    .await;
                }
                Err(BreakerError::CircuitOpen) => {
                    debug!(auction_id = %entry.id, "circuit open, backing off poll");
                    entry.due_at = Instant::now() + self.circuit_cooldown;
                }
                Err(e) => {
                    warn!(auction_id = %entry.id, error = %e, "poll fetch failed");
                    entry.consecutive_failures += 1;
                    let multiplier = if entry.consecutive_failures >= FAILURE_SKIP_THRESHOLD {
                        3
                    } else {
                        1
                    };
                    entry.due_at = Instant::now() + entry.interval * multiplier;
                }
            }

            self.heap.lock().push(HeapItem(Reverse(entry.due_at), entry));
        }
    }
}
