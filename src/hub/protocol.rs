// =============================================================================
// Client-facing wire protocol
// =============================================================================

use crate::types::{Auction, AuctionConfig, AuctionId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundFrame {
    Authenticate {
        token: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    Ping,
    StartMonitoring {
        auction_id: AuctionId,
        config: AuctionConfig,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
        #[serde(default)]
        request_id: Option<String>,
    },
    StopMonitoring {
        auction_id: AuctionId,
        #[serde(default)]
        request_id: Option<String>,
    },
    UpdateConfig {
        auction_id: AuctionId,
        config: AuctionConfig,
        #[serde(default)]
        request_id: Option<String>,
    },
    PlaceBid {
        auction_id: AuctionId,
        amount: u64,
        #[serde(default)]
        request_id: Option<String>,
    },
    GetMonitoredAuctions {
        #[serde(default)]
        request_id: Option<String>,
    },
}

impl InboundFrame {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Authenticate { request_id, .. }
            | Self::StartMonitoring { request_id, .. }
            | Self::StopMonitoring { request_id, .. }
            | Self::UpdateConfig { request_id, .. }
            | Self::PlaceBid { request_id, .. }
            | Self::GetMonitoredAuctions { request_id, .. } => request_id.as_deref(),
            Self::Ping => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundFrame {
    Authenticated {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Pong,
    Response {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        data: serde_json::Value,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
    },
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    AuctionState {
        auction: Auction,
    },
    Notification {
        kind: String,
        auction_id: AuctionId,
        #[serde(flatten)]
        fields: serde_json::Value,
    },
    Connected {
        client_id: uuid::Uuid,
    },
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_authenticate_frame() {
        let json = r#"{"type":"authenticate","token":"abc","requestId":"r1"}"#;
        let frame: InboundFrame = serde_json::from_str(json).unwrap();
        match frame {
            InboundFrame::Authenticate { token, request_id } => {
                assert_eq!(token, "abc");
                assert_eq!(request_id.as_deref(), Some("r1"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn ping_has_no_request_id() {
        let frame: InboundFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame.request_id(), None);
    }

    #[test]
    fn place_bid_round_trips_request_id() {
        let json = r#"{"type":"placeBid","auctionId":"A","amount":51,"requestId":"r2"}"#;
        let frame: InboundFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.request_id(), Some("r2"));
    }
}
