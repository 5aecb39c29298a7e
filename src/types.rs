// =============================================================================
// Core data model for the auction monitoring / bidding engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque auction identifier. A newtype rather than a bare `String` so it
/// can't be confused with a client id or a request id at a call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuctionId(pub String);

impl fmt::Display for AuctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AuctionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AuctionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-auction lifecycle state. See `state_machine.rs` for transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuctionState {
    Monitoring,
    Ending,
    Ended,
    Terminated,
}

impl Default for AuctionState {
    fn default() -> Self {
        Self::Monitoring
    }
}

impl fmt::Display for AuctionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Monitoring => write!(f, "Monitoring"),
            Self::Ending => write!(f, "Ending"),
            Self::Ended => write!(f, "Ended"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Which pipeline most recently produced a snapshot for this auction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineKind {
    Stream,
    Polling,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => write!(f, "Stream"),
            Self::Polling => write!(f, "Polling"),
        }
    }
}

/// Bidding strategy. Naming is deliberately exactly `Manual`/`Incremental`/
/// `Sniping` — see DESIGN.md Open Question #2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    Manual,
    Incremental,
    Sniping,
}

impl Default for Strategy {
    fn default() -> Self {
        Self::Manual
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "Manual"),
            Self::Incremental => write!(f, "Incremental"),
            Self::Sniping => write!(f, "Sniping"),
        }
    }
}

/// Outcome of a `PlaceBid` call against the upstream site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BidOutcome {
    Accepted,
    AcceptedButOutbid {
        new_current: u64,
        new_minimum_next_bid: u64,
    },
    Rejected {
        reason: String,
    },
    TransportError,
}

impl fmt::Display for BidOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "Accepted"),
            Self::AcceptedButOutbid { new_current, .. } => {
                write!(f, "AcceptedButOutbid(current={new_current})")
            }
            Self::Rejected { reason } => write!(f, "Rejected({reason})"),
            Self::TransportError => write!(f, "TransportError"),
        }
    }
}

/// Per-auction configuration, mutable by client command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionConfig {
    pub max_bid: u64,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub auto_bid: bool,
    #[serde(default = "default_bid_increment")]
    pub bid_increment: u64,
    #[serde(default = "default_snipe_seconds")]
    pub snipe_seconds: u64,
}

fn default_bid_increment() -> u64 {
    1
}

fn default_snipe_seconds() -> u64 {
    30
}

/// Hard ceiling on `maxBid`, per spec.
pub const MAX_BID_CEILING: u64 = 999_999;

impl AuctionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_bid < 1 {
            return Err("maxBid must be >= 1".into());
        }
        if self.max_bid > MAX_BID_CEILING {
            return Err(format!("maxBid must be <= {MAX_BID_CEILING}"));
        }
        Ok(())
    }
}

/// Most recently observed public state of an auction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionSnapshot {
    pub current_bid: u64,
    pub next_bid: u64,
    pub bid_count: u64,
    pub bidder_count: u64,
    pub is_winning: bool,
    pub is_watching: bool,
    pub is_closed: bool,
    pub close_at: DateTime<Utc>,
    pub retail_price: u64,
    pub extension_interval_seconds: u64,
    pub last_updated_at: DateTime<Utc>,
}

impl AuctionSnapshot {
    /// Seconds remaining until close, floored at 0. Never negative so
    /// threshold comparisons (`<= 30`, `<= 0`) behave as the spec describes.
    pub fn time_remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.close_at - now).num_seconds().max(0)
    }
}

/// Outcome of the last bid attempted for an auction, kept on the Auction
/// record for StrategyEngine's "last bid record" input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastBidPlaced {
    pub amount: u64,
    pub time: DateTime<Utc>,
    pub outcome: BidOutcome,
}

/// The full per-auction record persisted to the Store and sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Auction {
    pub id: AuctionId,
    pub title: String,
    pub url: String,
    pub image_url: String,
    pub config: AuctionConfig,
    pub state: AuctionState,
    pub current: AuctionSnapshot,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_bid_placed: Option<LastBidPlaced>,
    pub source: PipelineKind,
    /// Set once a `MaxBidReached` notification has fired, so it is emitted
    /// at most once per auction per spec.md §4.8.
    #[serde(default)]
    pub max_bid_notified: bool,
}

impl Auction {
    pub fn validate_invariants(&self) -> Result<(), String> {
        if self.current.next_bid < self.current.current_bid + 1 && !self.current.is_closed {
            return Err("nextBid must be >= currentBid + 1".into());
        }
        self.config.validate()
    }
}

/// Append-only per-auction bid ledger entry. Capped at 100 most recent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidRecord {
    pub amount: u64,
    pub strategy: Strategy,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub upstream_response: Option<serde_json::Value>,
    pub time: DateTime<Utc>,
}

pub const BID_HISTORY_CAP: usize = 100;

/// Defaults consulted when a client omits config fields in `startMonitoring`
/// / `updateConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    #[serde(default = "default_max_bid")]
    pub default_max_bid: u64,
    #[serde(default)]
    pub default_strategy: Strategy,
    #[serde(default)]
    pub bid_buffer: u64,
    #[serde(default = "default_snipe_seconds")]
    pub snipe_timing: u64,
}

fn default_max_bid() -> u64 {
    100
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            default_max_bid: default_max_bid(),
            default_strategy: Strategy::default(),
            bid_buffer: 0,
            snipe_timing: default_snipe_seconds(),
        }
    }
}

/// Per-connection ephemeral client state; never persisted.
#[derive(Debug, Clone)]
pub struct Client {
    pub client_id: uuid::Uuid,
    pub authenticated: bool,
    pub last_seen: DateTime<Utc>,
}

/// The opaque upstream session cookie, process-wide, TTL 24h.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub cookie: String,
    pub refreshed_at: DateTime<Utc>,
}

/// Marker record written to `system:state`; resolves the silence in
/// spec.md §6 about what that key actually contains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    pub schema_version: u32,
    pub started_at: DateTime<Utc>,
}

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

impl Default for SystemState {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            started_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_bid_ceiling_enforced() {
        let cfg = AuctionConfig {
            max_bid: MAX_BID_CEILING + 1,
            strategy: Strategy::Manual,
            auto_bid: false,
            bid_increment: 1,
            snipe_seconds: 30,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn max_bid_zero_rejected() {
        let cfg = AuctionConfig {
            max_bid: 0,
            strategy: Strategy::Manual,
            auto_bid: false,
            bid_increment: 1,
            snipe_seconds: 30,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn strategy_serializes_exactly() {
        assert_eq!(
            serde_json::to_string(&Strategy::Incremental).unwrap(),
            "\"incremental\""
        );
    }

    #[test]
    fn bid_outcome_round_trips() {
        let outcome = BidOutcome::AcceptedButOutbid {
            new_current: 60,
            new_minimum_next_bid: 61,
        };
        let json = serde_json::to_string(&outcome).unwrap();
        let back: BidOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(outcome, back);
    }
}
