// =============================================================================
// Per-connection frame draining task
// =============================================================================
//
// Re-architects the teacher's `api/ws.rs::handle_ws_connection` (a single
// `tokio::select!` between a push loop and a receive loop) into the shape
// spec.md §9 calls for: one inbound-frame channel and one outbound-frame
// channel per connection, both drained by this single task. This removes
// reentrancy (the teacher's handler can recurse into `send_snapshot` from
// inside the receive arm) and makes cancellation a matter of dropping the
// channels.
//
// Request/response correlation is modeled as one oneshot channel per
// in-flight command rather than an explicit `HashMap<requestId, Sender>`:
// each inbound command spawns a bounded-lifetime task that holds its own
// oneshot reply and a 30s timeout, then writes the correlated response
// onto the outbound channel. This is the per-connection pending-response
// map spec.md §9 describes, expressed without a shared map to lock.

use crate::coordinator::{Command, CommandOutcome, MonitorCoordinator};
use crate::hub::auth::validate_token;
use crate::hub::protocol::{InboundFrame, OutboundFrame};
use crate::types::Auction;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

const PENDING_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
const PING_IDLE_MULTIPLE: u64 = 2;
const EXPECTED_PING_INTERVAL: Duration = Duration::from_secs(30);
const MAX_COMMANDS_PER_MINUTE: u32 = 100;

pub async fn handle_connection(
    socket: WebSocket,
    coordinator: Arc<MonitorCoordinator>,
    auth_token: String,
    mut auction_state_rx: broadcast::Receiver<Auction>,
    mut notifications_rx: broadcast::Receiver<crate::events::NotificationOut>,
) {
    let client_id = uuid::Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(128);

    let _ = out_tx
        .send(OutboundFrame::Connected { client_id })
        .await;

    let mut authenticated = false;
    let rate_limiter = RateLimiter::direct(Quota::per_minute(
        NonZeroU32::new(MAX_COMMANDS_PER_MINUTE).unwrap(),
    ));

    let auth_deadline = tokio::time::sleep(AUTH_TIMEOUT);
    tokio::pin!(auth_deadline);
    let idle_timeout = EXPECTED_PING_INTERVAL * PING_IDLE_MULTIPLE;
    let mut last_activity = tokio::time::Instant::now();

    loop {
        tokio::select! {
            // Outbound: broadcasts and command responses, FIFO per
            // connection because they all funnel through one mpsc.
            Some(frame) = out_rx.recv() => {
                if send_frame(&mut ws_tx, &frame).await.is_err() {
                    break;
                }
            }
            // Broadcasts are enqueued onto the same `out_tx` mpsc as command
            // responses rather than written to the socket directly here —
            // only the `out_rx.recv()` branch above ever writes to `ws_tx`,
            // so wire order always matches enqueue order.
            Ok(auction) = auction_state_rx.recv(), if authenticated => {
                let _ = out_tx.send(OutboundFrame::AuctionState { auction }).await;
            }
            Ok(notification) = notifications_rx.recv(), if authenticated => {
                let _ = out_tx.send(notification_frame(notification)).await;
            }
            // Inbound: client frames.
            msg = ws_rx.next() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                last_activity = tokio::time::Instant::now();
                match msg {
                    Message::Text(text) => {
                        if !authenticated {
                            if !handle_preauth(&text, &auth_token, &out_tx, &mut authenticated).await {
                                break;
                            }
                            continue;
                        }
                        if rate_limiter.check().is_err() {
                            let _ = out_tx.send(OutboundFrame::RateLimited { request_id: extract_request_id(&text) }).await;
                            continue;
                        }
                        handle_authenticated_frame(&text, &coordinator, &client_id, out_tx.clone()).await;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => break,
                    Message::Binary(_) => {
                        let _ = out_tx.send(OutboundFrame::Error {
                            request_id: None,
                            message: "binary frames are not supported".into(),
                        }).await;
                    }
                }
            }
            _ = &mut auth_deadline, if !authenticated => {
                debug!(%client_id, "connection failed to authenticate within deadline");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(5)) => {
                if last_activity.elapsed() > idle_timeout {
                    debug!(%client_id, "connection idle timeout");
                    break;
                }
            }
        }
    }

    let _ = send_frame(&mut ws_tx, &OutboundFrame::Disconnected).await;
    coordinator.handle_disconnect(&client_id).await;
}

async fn handle_preauth(
    text: &str,
    auth_token: &str,
    out_tx: &mpsc::Sender<OutboundFrame>,
    authenticated: &mut bool,
) -> bool {
    let frame: Result<InboundFrame, _> = serde_json::from_str(text);
    match frame {
        Ok(InboundFrame::Authenticate { token, request_id }) => {
            let ok = validate_token(auth_token, &token);
            *authenticated = ok;
            let _ = out_tx
                .send(OutboundFrame::Authenticated {
                    success: ok,
                    request_id,
                })
                .await;
            ok
        }
        _ => {
            let _ = out_tx
                .send(OutboundFrame::Error {
                    request_id: None,
                    message: "must authenticate first".into(),
                })
                .await;
            true // keep the connection open until the auth deadline fires
        }
    }
}

async fn handle_authenticated_frame(
    text: &str,
    coordinator: &Arc<MonitorCoordinator>,
    client_id: &uuid::Uuid,
    out_tx: mpsc::Sender<OutboundFrame>,
) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            let _ = out_tx
                .send(OutboundFrame::Error {
                    request_id: None,
                    message: format!("invalid frame: {e}"),
                })
                .await;
            return;
        }
    };

    if let InboundFrame::Ping = frame {
        let _ = out_tx.send(OutboundFrame::Pong).await;
        return;
    }

    let _ = client_id;
    let request_id = frame.request_id().map(|s| s.to_string());
    let Some(command) = to_command(frame) else {
        return;
    };

    let coordinator = coordinator.clone();
    tokio::spawn(async move {
        let (reply_tx, reply_rx) = oneshot::channel();
        coordinator.dispatch(command, reply_tx).await;

        let outcome = tokio::time::timeout(PENDING_RESPONSE_TIMEOUT, reply_rx).await;
        let response = match outcome {
            Ok(Ok(CommandOutcome::Data(data))) => OutboundFrame::Response { request_id, data },
            Ok(Ok(CommandOutcome::Error(message))) => OutboundFrame::Error { request_id, message },
            Ok(Err(_)) => OutboundFrame::Error {
                request_id,
                message: "coordinator dropped the request".into(),
            },
            Err(_) => OutboundFrame::Error {
                request_id,
                message: "timeout".into(),
            },
        };
        let _ = out_tx.send(response).await;
    });
}

fn to_command(frame: InboundFrame) -> Option<Command> {
    match frame {
        InboundFrame::StartMonitoring {
            auction_id,
            config,
            metadata,
            ..
        } => Some(Command::StartMonitoring {
            auction_id,
            config,
            metadata,
        }),
        InboundFrame::StopMonitoring { auction_id, .. } => {
            Some(Command::StopMonitoring { auction_id })
        }
        InboundFrame::UpdateConfig {
            auction_id, config, ..
        } => Some(Command::UpdateConfig { auction_id, config }),
        InboundFrame::PlaceBid {
            auction_id, amount, ..
        } => Some(Command::PlaceBid { auction_id, amount }),
        InboundFrame::GetMonitoredAuctions { .. } => Some(Command::GetMonitoredAuctions),
        InboundFrame::Authenticate { .. } | InboundFrame::Ping => None,
    }
}

fn notification_frame(notification: crate::events::NotificationOut) -> OutboundFrame {
    use crate::events::NotificationOut as N;
    let (kind, auction_id, fields) = match notification {
        N::Outbid { auction_id } => ("outbid", auction_id, serde_json::json!({})),
        N::Ended {
            auction_id,
            won,
            final_price,
        } => (
            "ended",
            auction_id,
            serde_json::json!({ "won": won, "finalPrice": final_price }),
        ),
        N::MaxBidReached { auction_id } => ("maxBidReached", auction_id, serde_json::json!({})),
        N::BidError { auction_id, reason } => (
            "bidError",
            auction_id,
            serde_json::json!({ "reason": reason }),
        ),
    };
    OutboundFrame::Notification {
        kind: kind.to_string(),
        auction_id,
        fields,
    }
}

fn extract_request_id(text: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("requestId").and_then(|r| r.as_str()).map(String::from))
}

async fn send_frame(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    frame: &OutboundFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    ws_tx.send(Message::Text(text)).await
}

