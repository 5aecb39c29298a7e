// =============================================================================
// AuctionStateMachine — per-auction lifecycle transitions
// =============================================================================
//
// A pure merge function, per spec.md §4.7: no I/O, no shared state, easy
// to exhaustively unit test against every boundary spec.md §8 names.

use crate::types::{Auction, AuctionSnapshot, AuctionState};

pub const ENDING_THRESHOLD_SECONDS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: AuctionState,
    pub to: AuctionState,
}

/// Merges an incoming snapshot into the existing auction record and
/// determines the next state. `config` is never touched by snapshots.
/// Returns the updated auction and `Some(Transition)` if the state
/// changed.
pub fn merge(
    existing: &Auction,
    snapshot: AuctionSnapshot,
    now: chrono::DateTime<chrono::Utc>,
) -> (Auction, Option<Transition>) {
    let mut updated = existing.clone();

    // Tie-break per spec.md §4.7: same lastUpdatedAt -> strictly greater
    // bidCount wins; otherwise the later-received snapshot wins outright.
    let accept = if snapshot.last_updated_at == existing.current.last_updated_at {
        snapshot.bid_count > existing.current.bid_count
    } else {
        true
    };

    if accept {
        updated.current = snapshot;
        updated.last_updated_at = updated.current.last_updated_at;
    }

    let time_remaining = updated.current.time_remaining_seconds(now);
    let next_state = match existing.state {
        AuctionState::Monitoring => {
            if updated.current.is_closed || time_remaining <= 0 {
                AuctionState::Ended
            } else if time_remaining <= ENDING_THRESHOLD_SECONDS {
                AuctionState::Ending
            } else {
                AuctionState::Monitoring
            }
        }
        AuctionState::Ending => {
            if updated.current.is_closed || time_remaining <= 0 {
                AuctionState::Ended
            } else if time_remaining > ENDING_THRESHOLD_SECONDS {
                AuctionState::Monitoring
            } else {
                AuctionState::Ending
            }
        }
        AuctionState::Ended => AuctionState::Ended,
        AuctionState::Terminated => AuctionState::Terminated,
    };

    let transition = if next_state != existing.state {
        Some(Transition {
            from: existing.state,
            to: next_state,
        })
    } else {
        None
    };

    updated.state = next_state;
    (updated, transition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuctionConfig, AuctionId, PipelineKind, Strategy};
    use chrono::{Duration as ChronoDuration, Utc};

    fn base_auction(state: AuctionState, close_in_seconds: i64, current_bid: u64) -> Auction {
        let now = Utc::now();
        Auction {
            id: AuctionId::from("A"),
            title: "Item".into(),
            url: "https://example.invalid/a".into(),
            image_url: "https://example.invalid/a.jpg".into(),
            config: AuctionConfig {
                max_bid: 100,
                strategy: Strategy::Manual,
                auto_bid: false,
                bid_increment: 1,
                snipe_seconds: 30,
            },
            state,
            current: AuctionSnapshot {
                current_bid,
                next_bid: current_bid + 1,
                bid_count: 1,
                bidder_count: 1,
                is_winning: false,
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

    fn snapshot_like(auction: &Auction, close_in_seconds: i64, bid_count: u64) -> AuctionSnapshot {
        let mut s = auction.current.clone();
        s.close_at = Utc::now() + ChronoDuration::seconds(close_in_seconds);
        s.last_updated_at = Utc::now();
        s.bid_count = bid_count;
        s
    }

    #[test]
    fn crossing_30_to_29_transitions_to_ending() {
        let auction = base_auction(AuctionState::Monitoring, 30, 50);
        let snapshot = snapshot_like(&auction, 29, 2);
        let (updated, transition) = merge(&auction, snapshot, Utc::now());
        assert_eq!(updated.state, AuctionState::Ending);
        assert_eq!(
            transition,
            Some(Transition {
                from: AuctionState::Monitoring,
                to: AuctionState::Ending
            })
        );
    }

    #[test]
    fn crossing_back_above_30_returns_to_monitoring() {
        let auction = base_auction(AuctionState::Ending, 10, 50);
        let snapshot = snapshot_like(&auction, 31, 2);
        let (updated, transition) = merge(&auction, snapshot, Utc::now());
        assert_eq!(updated.state, AuctionState::Monitoring);
        assert_eq!(transition.unwrap().to, AuctionState::Monitoring);
    }

    #[test]
    fn is_closed_forces_ended_from_any_state() {
        let auction = base_auction(AuctionState::Monitoring, 120, 50);
        let mut snapshot = snapshot_like(&auction, 120, 2);
        snapshot.is_closed = true;
        let (updated, transition) = merge(&auction, snapshot, Utc::now());
        assert_eq!(updated.state, AuctionState::Ended);
        assert_eq!(transition.unwrap().to, AuctionState::Ended);
    }

    #[test]
    fn ended_is_terminal_for_bidding() {
        let auction = base_auction(AuctionState::Ended, -5, 50);
        let snapshot = snapshot_like(&auction, 120, 2);
        let (updated, transition) = merge(&auction, snapshot, Utc::now());
        assert_eq!(updated.state, AuctionState::Ended);
        assert!(transition.is_none());
    }

    #[test]
    fn tie_break_prefers_strictly_greater_bid_count() {
        let auction = base_auction(AuctionState::Monitoring, 120, 50);
        let ts = auction.current.last_updated_at;
        let mut snapshot = auction.current.clone();
        snapshot.last_updated_at = ts;
        snapshot.bid_count = auction.current.bid_count; // not strictly greater
        snapshot.current_bid = 999; // should be ignored
        let (updated, _) = merge(&auction, snapshot, Utc::now());
        assert_eq!(updated.current.current_bid, 50);
    }

    #[test]
    fn tie_break_accepts_strictly_greater_bid_count() {
        let auction = base_auction(AuctionState::Monitoring, 120, 50);
        let ts = auction.current.last_updated_at;
        let mut snapshot = auction.current.clone();
        snapshot.last_updated_at = ts;
        snapshot.bid_count = auction.current.bid_count + 1;
        snapshot.current_bid = 60;
        let (updated, _) = merge(&auction, snapshot, Utc::now());
        assert_eq!(updated.current.current_bid, 60);
    }
}
