// =============================================================================
// ClientHub — accepts bidirectional client connections
// =============================================================================

pub mod auth;
pub mod connection;
pub mod protocol;

use crate::coordinator::MonitorCoordinator;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub const MAX_CONNECTIONS_PER_ADDRESS: u32 = 5;

#[derive(Clone)]
pub struct HubState {
    pub coordinator: Arc<MonitorCoordinator>,
    pub auth_token: String,
    per_address: Arc<DashMap<std::net::IpAddr, AtomicU32>>,
}

impl HubState {
    pub fn new(coordinator: Arc<MonitorCoordinator>, auth_token: String) -> Self {
        Self {
            coordinator,
            auth_token,
            per_address: Arc::new(DashMap::new()),
        }
    }

    fn try_acquire_slot(&self, addr: std::net::IpAddr) -> bool {
        let counter = self.per_address.entry(addr).or_insert_with(|| AtomicU32::new(0));
        let current = counter.fetch_add(1, Ordering::SeqCst);
        if current >= MAX_CONNECTIONS_PER_ADDRESS {
            counter.fetch_sub(1, Ordering::SeqCst);
            false
        } else {
            true
        }
    }

    fn release_slot(&self, addr: std::net::IpAddr) {
        if let Some(counter) = self.per_address.get(&addr) {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub fn router(state: HubState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<HubState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let ip = addr.ip();
    if !state.try_acquire_slot(ip) {
        return axum::http::StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    ws.on_upgrade(move |socket| async move {
        let auction_state_rx = state.coordinator.subscribe_auction_state();
        let notifications_rx = state.coordinator.subscribe_notifications();
        connection::handle_connection(
            socket,
            state.coordinator.clone(),
            state.auth_token.clone(),
            auction_state_rx,
            notifications_rx,
        )
        .await;
        state.release_slot(ip);
    })
}
