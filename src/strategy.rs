// =============================================================================
// StrategyEngine — decides whether/when/how much to bid
// =============================================================================
//
// Keeps the teacher's shape (a unit struct with an associated evaluation
// function, `tracing`-instrumented, numbered-pipeline-steps doc comment)
// while replacing the crypto-indicator decision content entirely with the
// auction bidding decision table of spec.md §4.8.

use crate::types::{Auction, AuctionConfig, AuctionState, BidOutcome, GlobalSettings, Strategy};
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// What the engine decided to do for one auction evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    NoAction,
    Bid { amount: u64 },
    MaxBidReached,
}

pub struct StrategyEngine {
    /// Auctions with a bid currently in flight; enforces "at most one
    /// in-flight bid per auction" (spec.md §4.8 concurrency guard).
    in_flight: DashSet<crate::types::AuctionId>,
}

impl StrategyEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            in_flight: DashSet::new(),
        })
    }

    /// True if a bid attempt for this auction may proceed right now.
    /// Callers must pair a `true` result with an eventual `release`.
    pub fn try_acquire(&self, id: &crate::types::AuctionId) -> bool {
        self.in_flight.insert(id.clone())
    }

    pub fn release(&self, id: &crate::types::AuctionId) {
        self.in_flight.remove(id);
    }

    /// Pure decision function, invoked after every successful state
    /// update. Takes the inputs spec.md §4.8 names explicitly so it can be
    /// unit tested without any async machinery.
    #[instrument(skip(auction, settings), fields(auction_id = %auction.id))]
    pub fn decide(auction: &Auction, settings: &GlobalSettings) -> Decision {
        let config = &auction.config;

        // Open Question #3: autoBid=true with strategy=Manual never bids.
        // This arm comes first so no future reordering of the table below
        // can bypass it.
        if config.strategy == Strategy::Manual {
            return Decision::NoAction;
        }

        if matches!(auction.state, AuctionState::Ended | AuctionState::Terminated) {
            return Decision::NoAction;
        }

        if !config.auto_bid {
            return Decision::NoAction;
        }

        if auction.current.is_winning {
            return Decision::NoAction;
        }

        if config.strategy == Strategy::Sniping {
            let snipe_seconds = if config.snipe_seconds == 0 {
                // snipeSeconds = 0 disables sniping regardless of autoBid.
                return Decision::NoAction;
            } else {
                config.snipe_seconds as i64
            };
            let time_remaining = auction.current.time_remaining_seconds(chrono::Utc::now());
            if time_remaining > snipe_seconds {
                return Decision::NoAction;
            }
        }

        // A prior `AcceptedButOutbid` carries the upstream's own minimum for
        // the next bid, which can be ahead of the last snapshot's `nextBid`
        // if the snapshot hasn't caught up yet; never bid below it.
        let outbid_floor = match &auction.last_bid_placed {
            Some(last) => match &last.outcome {
                BidOutcome::AcceptedButOutbid { new_minimum_next_bid, .. } => *new_minimum_next_bid,
                _ => 0,
            },
            None => 0,
        };
        let candidate = std::cmp::max(auction.current.next_bid, outbid_floor) + settings.bid_buffer;

        if candidate > config.max_bid {
            return Decision::MaxBidReached;
        }

        Decision::Bid { amount: candidate }
    }

    /// Delay before Incremental re-evaluates after an `AcceptedButOutbid`
    /// outcome, per spec.md §4.8.
    pub const REEVALUATE_DELAY: Duration = Duration::from_secs(2);

    /// Whether the engine should keep auto-retrying after an outbid
    /// result. Sniping retries as long as it remains inside the window
    /// and below the max; Incremental always retries once outbid.
    pub fn should_retry_after_outbid(
        config: &AuctionConfig,
        new_current: u64,
        auction: &Auction,
    ) -> bool {
        if new_current >= config.max_bid {
            return false;
        }
        match config.strategy {
            Strategy::Incremental => true,
            Strategy::Sniping => {
                let time_remaining = auction.current.time_remaining_seconds(chrono::Utc::now());
                time_remaining <= config.snipe_seconds as i64
            }
            Strategy::Manual => false,
        }
    }

    pub fn log_outcome(auction_id: &crate::types::AuctionId, outcome: &BidOutcome) {
        info!(auction_id = %auction_id, outcome = %outcome, "bid attempt resolved");
    }
}

impl Default for StrategyEngine {
    fn default() -> Self {
        Self {
            in_flight: DashSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuctionId, AuctionSnapshot, PipelineKind};
    use chrono::{Duration as ChronoDuration, Utc};

    fn auction_with(
        strategy: Strategy,
        auto_bid: bool,
        is_winning: bool,
        max_bid: u64,
        next_bid: u64,
        close_in_seconds: i64,
        snipe_seconds: u64,
    ) -> Auction {
        let now = Utc::now();
        Auction {
            id: AuctionId::from("A"),
            title: "Item".into(),
            url: "https://example.invalid/a".into(),
            image_url: "https://example.invalid/a.jpg".into(),
            config: AuctionConfig {
                max_bid,
                strategy,
                auto_bid,
                bid_increment: 1,
                snipe_seconds,
            },
            state: AuctionState::Monitoring,
            current: AuctionSnapshot {
                current_bid: next_bid.saturating_sub(1),
                next_bid,
                bid_count: 1,
                bidder_count: 1,
                is_winning,
                is_watching: false,
                is_closed: false,
                close_at: now + ChronoDuration::seconds(close_in_seconds),
                retail_price: 200,
                extension_interval_seconds: 60,
                last_updated_at: now,
            },
            last_updated_at: now,
            last_bid_placed: None,
            source: PipelineKind::Polling,
            max_bid_notified: false,
        }
    }

    #[test]
    fn manual_never_bids_even_with_autobid_true() {
        let auction = auction_with(Strategy::Manual, true, false, 100, 51, 120, 30);
        let settings = GlobalSettings::default();
        assert_eq!(StrategyEngine::decide(&auction, &settings), Decision::NoAction);
    }

    #[test]
    fn incremental_autobid_false_does_nothing() {
        let auction = auction_with(Strategy::Incremental, false, false, 100, 51, 120, 30);
        let settings = GlobalSettings::default();
        assert_eq!(StrategyEngine::decide(&auction, &settings), Decision::NoAction);
    }

    #[test]
    fn incremental_winning_does_nothing() {
        let auction = auction_with(Strategy::Incremental, true, true, 100, 51, 120, 30);
        let settings = GlobalSettings::default();
        assert_eq!(StrategyEngine::decide(&auction, &settings), Decision::NoAction);
    }

    #[test]
    fn incremental_losing_bids() {
        let auction = auction_with(Strategy::Incremental, true, false, 100, 51, 120, 30);
        let settings = GlobalSettings::default();
        assert_eq!(
            StrategyEngine::decide(&auction, &settings),
            Decision::Bid { amount: 51 }
        );
    }

    #[test]
    fn sniping_outside_window_does_nothing() {
        let auction = auction_with(Strategy::Sniping, true, false, 100, 51, 120, 30);
        let settings = GlobalSettings::default();
        assert_eq!(StrategyEngine::decide(&auction, &settings), Decision::NoAction);
    }

    #[test]
    fn sniping_inside_window_bids() {
        let auction = auction_with(Strategy::Sniping, true, false, 100, 51, 20, 30);
        let settings = GlobalSettings::default();
        assert_eq!(
            StrategyEngine::decide(&auction, &settings),
            Decision::Bid { amount: 51 }
        );
    }

    #[test]
    fn snipe_seconds_zero_disables_sniping() {
        let auction = auction_with(Strategy::Sniping, true, false, 100, 51, 5, 0);
        let settings = GlobalSettings::default();
        assert_eq!(StrategyEngine::decide(&auction, &settings), Decision::NoAction);
    }

    #[test]
    fn clamp_reports_max_bid_reached() {
        let auction = auction_with(Strategy::Incremental, true, false, 60, 65, 120, 30);
        let settings = GlobalSettings::default();
        assert_eq!(
            StrategyEngine::decide(&auction, &settings),
            Decision::MaxBidReached
        );
    }

    #[test]
    fn retries_above_last_outbid_minimum_not_stale_next_bid() {
        // Snapshot still reports the stale `nextBid` (51) from before the
        // last bid landed, but the upstream already told us 61 is the real
        // floor via `AcceptedButOutbid` — the re-evaluation must bid 61, not
        // recompute the same 51 it already lost with.
        let mut auction = auction_with(Strategy::Incremental, true, false, 100, 51, 120, 30);
        auction.last_bid_placed = Some(crate::types::LastBidPlaced {
            amount: 51,
            time: Utc::now(),
            outcome: BidOutcome::AcceptedButOutbid {
                new_current: 60,
                new_minimum_next_bid: 61,
            },
        });
        let settings = GlobalSettings::default();
        assert_eq!(
            StrategyEngine::decide(&auction, &settings),
            Decision::Bid { amount: 61 }
        );
    }

    #[test]
    fn concurrency_guard_prevents_double_acquire() {
        let engine = StrategyEngine::new();
        let id = AuctionId::from("A");
        assert!(engine.try_acquire(&id));
        assert!(!engine.try_acquire(&id));
        engine.release(&id);
        assert!(engine.try_acquire(&id));
    }
}
