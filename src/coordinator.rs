// =============================================================================
// MonitorCoordinator — top-level orchestrator
// =============================================================================
//
// Owns the monitored-auction table exclusively, the way `app_state.rs`
// owns a single `AppState` value constructed at startup and passed
// explicitly rather than reached for through a global. Startup recovery
// loosely follows `reconcile.rs`'s "compare persisted state against live
// reality" shape; the 60s Ended->Terminated purge uses the same
// periodic-ticker idiom as `exit/monitor.rs`.

use crate::circuit_breaker::{BreakerEvent, CircuitBreaker};
use crate::events::{BidAttempted, EventBus, NotificationOut, SnapshotReceived};
use crate::pipelines::polling_queue::PollingQueue;
use crate::pipelines::UpdateRouter;
use crate::state_machine;
use crate::store::{auction_key, bid_history_key, Store, COOKIES_KEY, SETTINGS_KEY, SYSTEM_STATE_KEY, TTL_AUCTION};
use crate::strategy::{Decision, StrategyEngine};
use crate::types::{
    Auction, AuctionConfig, AuctionId, AuctionState, BidRecord, GlobalSettings, LastBidPlaced,
    PipelineKind, Session, SystemState, BID_HISTORY_CAP,
};
use crate::upstream::UpstreamClient;
use dashmap::DashMap;
use parking_lot::RwLock as PLRwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const TERMINATION_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub enum Command {
    StartMonitoring {
        auction_id: AuctionId,
        config: AuctionConfig,
        metadata: Option<serde_json::Value>,
    },
    StopMonitoring {
        auction_id: AuctionId,
    },
    UpdateConfig {
        auction_id: AuctionId,
        config: AuctionConfig,
    },
    PlaceBid {
        auction_id: AuctionId,
        amount: u64,
    },
    GetMonitoredAuctions,
}

pub enum CommandOutcome {
    Data(serde_json::Value),
    Error(String),
}

pub struct MonitorCoordinator {
    table: DashMap<AuctionId, Auction>,
    store: Arc<dyn Store>,
    upstream: Arc<UpstreamClient>,
    breaker: Arc<CircuitBreaker>,
    router: Arc<UpdateRouter>,
    polling: Arc<PollingQueue>,
    strategy: Arc<StrategyEngine>,
    settings: PLRwLock<GlobalSettings>,
    bus: EventBus,
    /// Fan-out side of the notification pipeline; `run_notification_fanout`
    /// drains `bus.notifications_rx` (mpsc, single consumer) and republishes
    /// here so every connected client can subscribe independently.
    notifications_broadcast: broadcast::Sender<NotificationOut>,
    cancel: CancellationToken,
    /// Key for decrypting `COOKIES_KEY` at rest. `None` means the store
    /// holds (or is expected to hold) the session cookie as plain JSON —
    /// see `recover_from_store` and DESIGN.md for why this engine never
    /// writes that key itself.
    encryption_secret: Option<String>,
}

impl MonitorCoordinator {
    /// `router` and `polling` must already be wired to send snapshots on the
    /// same channel whose receiving half is passed back to the caller via
    /// `run_snapshot_loop`'s `rx` argument — the coordinator is constructed
    /// after those pipelines because they need a sender that outlives it.
    pub fn new(
        store: Arc<dyn Store>,
        upstream: Arc<UpstreamClient>,
        breaker: Arc<CircuitBreaker>,
        router: Arc<UpdateRouter>,
        polling: Arc<PollingQueue>,
        encryption_secret: Option<String>,
    ) -> (Arc<Self>, tokio::sync::mpsc::Receiver<NotificationOut>) {
        let (notifications_broadcast, _) =
            broadcast::channel(crate::events::NOTIFICATION_CHANNEL_CAPACITY);
        let mut bus = EventBus::new();
        let notifications_rx = bus.take_notifications_rx().expect("fresh EventBus");

        let coordinator = Arc::new(Self {
            table: DashMap::new(),
            store,
            upstream,
            breaker,
            router,
            polling,
            strategy: StrategyEngine::new(),
            settings: PLRwLock::new(GlobalSettings::default()),
            bus,
            notifications_broadcast,
            cancel: CancellationToken::new(),
            encryption_secret,
        });
        (coordinator, notifications_rx)
    }

    pub fn subscribe_auction_state(&self) -> broadcast::Receiver<Auction> {
        self.bus.subscribe_auction_state()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<NotificationOut> {
        self.notifications_broadcast.subscribe()
    }

    // -------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------

    /// Startup sequence per spec.md §4.10: load the session cookie and
    /// global settings, re-enroll every non-Ended persisted auction, then
    /// the caller begins accepting client connections.
    pub async fn recover_from_store(self: &Arc<Self>) -> anyhow::Result<()> {
        if let Some(raw) = self.store.get(COOKIES_KEY).await? {
            let decoded = match &self.encryption_secret {
                Some(secret) => crate::crypto::decrypt_cookie(secret, &raw).ok(),
                None => String::from_utf8(raw.clone()).ok(),
            };
            match decoded.and_then(|json| serde_json::from_str::<Session>(&json).ok()) {
                Some(session) => {
                    self.upstream.set_session_cookie(Some(session.cookie));
                    info!("recovered upstream session cookie from store");
                }
                None => warn!(
                    "auth:cookies present in store but unreadable (check ENCRYPTION_SECRET)"
                ),
            }
        }

        if let Some(raw) = self.store.get(SETTINGS_KEY).await? {
            if let Ok(settings) = serde_json::from_slice::<GlobalSettings>(&raw) {
                *self.settings.write() = settings;
            }
        }

        if self.store.get(SYSTEM_STATE_KEY).await?.is_none() {
            let state = SystemState::default();
            let bytes = serde_json::to_vec(&state)?;
            self.store.set(SYSTEM_STATE_KEY, bytes, TTL_AUCTION).await?;
        }

        let keys = self.store.list("auction:").await?;
        let mut recovered = 0usize;
        for key in keys {
            let Some(raw) = self.store.get(&key).await? else { continue };
            let Ok(auction) = serde_json::from_slice::<Auction>(&raw) else { continue };
            if matches!(auction.state, AuctionState::Ended | AuctionState::Terminated) {
                continue;
            }
            self.router.enroll(auction.id.clone());
            self.table.insert(auction.id.clone(), auction);
            recovered += 1;
        }
        info!(recovered, "startup recovery complete");
        Ok(())
    }

    // -------------------------------------------------------------------
    // Background loops
    // -------------------------------------------------------------------

    /// Drains pipeline snapshots, merges them through the state machine,
    /// runs the strategy engine, persists, and broadcasts. This is the
    /// single mutator for the auction table: everything else reaches the
    /// table only through this loop or through `dispatch`'s direct
    /// command handling, both serialized through `DashMap`'s per-key
    /// locking, matching "one lock per auction" from spec.md §5.
    pub async fn run_snapshot_loop(self: Arc<Self>, mut rx: tokio::sync::mpsc::Receiver<SnapshotReceived>) {
        while let Some(event) = rx.recv().await {
            if self.cancel.is_cancelled() {
                return;
            }
            self.apply_snapshot(event).await;
        }
    }

    async fn apply_snapshot(self: &Arc<Self>, event: SnapshotReceived) {
        let Some(mut entry) = self.table.get_mut(&event.auction_id) else {
            return;
        };

        let (mut updated, transition) = state_machine::merge(&*entry, event.snapshot, chrono::Utc::now());
        updated.source = event.source;
        *entry = updated.clone();
        drop(entry);

        self.persist_auction(&updated).await;
        let _ = self.bus.auction_state_tx.send(updated.clone());

        if let Some(t) = transition {
            let _ = self.bus.transitions_tx.send(crate::events::StateTransition {
                auction_id: updated.id.clone(),
                from: t.from,
                to: t.to,
            });
            if t.to == AuctionState::Ended {
                self.on_ended(&updated).await;
            }
        }

        if matches!(updated.state, AuctionState::Monitoring | AuctionState::Ending) {
            self.evaluate_strategy(updated.id.clone()).await;
        }

        self.router.reconcile_health(&updated.id);
    }

    async fn on_ended(self: &Arc<Self>, auction: &Auction) {
        let won = auction.current.is_winning;
        let _ = self
            .notify(NotificationOut::Ended {
                auction_id: auction.id.clone(),
                won,
                final_price: auction.current.current_bid,
            })
            .await;

        let id = auction.id.clone();
        let coordinator = self.clone_arc();
        tokio::spawn(async move {
            tokio::time::sleep(TERMINATION_DELAY).await;
            coordinator.terminate(&id).await;
        });
    }

    async fn terminate(self: &Arc<Self>, id: &AuctionId) {
        self.router.remove(id);
        if let Some((_, mut auction)) = self.table.remove(id) {
            auction.state = AuctionState::Terminated;
            self.persist_auction(&auction).await;
        }
        info!(auction_id = %id, "auction terminated and removed from live table");
    }

    /// Clones `self` out of an `&Arc<Self>` receiver; `MonitorCoordinator`
    /// methods that spawn detached follow-up work need an owned `Arc`.
    fn clone_arc(self: &Arc<Self>) -> Arc<Self> {
        Arc::clone(self)
    }

    async fn evaluate_strategy(self: &Arc<Self>, id: AuctionId) {
        let Some(auction) = self.table.get(&id).map(|a| a.clone()) else {
            return;
        };
        let decision = StrategyEngine::decide(&auction, &self.settings.read().clone());

        match decision {
            Decision::NoAction => {}
            Decision::MaxBidReached => {
                if !auction.max_bid_notified {
                    if let Some(mut entry) = self.table.get_mut(&id) {
                        entry.max_bid_notified = true;
                    }
                    let _ = self
                        .notify(NotificationOut::MaxBidReached {
                            auction_id: id.clone(),
                        })
                        .await;
                }
            }
            Decision::Bid { amount } => {
                self.attempt_bid(id, amount, auction.config.strategy).await;
            }
        }
    }

    async fn attempt_bid(
        self: &Arc<Self>,
        id: AuctionId,
        amount: u64,
        strategy: crate::types::Strategy,
    ) {
        if !self.strategy.try_acquire(&id) {
            return; // one in-flight bid per auction
        }
        let coordinator = self.clone_arc();
        tokio::spawn(async move {
            let outcome = coordinator.breaker.place_bid(&id.0, amount).await;
            coordinator.strategy.release(&id);

            let outcome = match outcome {
                Ok(o) => o,
                Err(_) => crate::types::BidOutcome::TransportError,
            };

            StrategyEngine::log_outcome(&id, &outcome);
            coordinator.record_bid(&id, amount, strategy, &outcome).await;

            let _ = coordinator.bus.bids_tx.send(BidAttempted {
                auction_id: id.clone(),
                amount,
                outcome: outcome.clone(),
            });

            if let crate::types::BidOutcome::AcceptedButOutbid { new_current, .. } = &outcome {
                let retry = coordinator
                    .table
                    .get(&id)
                    .map(|a| StrategyEngine::should_retry_after_outbid(&a.config, *new_current, &*a))
                    .unwrap_or(false);
                if retry {
                    let coordinator2 = coordinator.clone();
                    let id2 = id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(StrategyEngine::REEVALUATE_DELAY).await;
                        coordinator2.evaluate_strategy(id2).await;
                    });
                }
            }

            if let crate::types::BidOutcome::Rejected { reason } = &outcome {
                let _ = coordinator
                    .notify(NotificationOut::BidError {
                        auction_id: id.clone(),
                        reason: reason.clone(),
                    })
                    .await;
            }
        });
    }

    async fn record_bid(
        &self,
        id: &AuctionId,
        amount: u64,
        strategy: crate::types::Strategy,
        outcome: &crate::types::BidOutcome,
    ) {
        let success = matches!(
            outcome,
            crate::types::BidOutcome::Accepted | crate::types::BidOutcome::AcceptedButOutbid { .. }
        );
        let record = BidRecord {
            amount,
            strategy,
            success,
            error: match outcome {
                crate::types::BidOutcome::Rejected { reason } => Some(reason.clone()),
                crate::types::BidOutcome::TransportError => Some("transport error".into()),
                _ => None,
            },
            upstream_response: None,
            time: chrono::Utc::now(),
        };

        if let Some(mut entry) = self.table.get_mut(id) {
            entry.last_bid_placed = Some(LastBidPlaced {
                amount,
                time: record.time,
                outcome: outcome.clone(),
            });
            let snapshot = entry.clone();
            drop(entry);
            self.persist_auction(&snapshot).await;
            let _ = self.bus.auction_state_tx.send(snapshot);
        }

        if let Ok(bytes) = serde_json::to_vec(&record) {
            let _ = self
                .store
                .append_sorted(
                    &bid_history_key(&id.0),
                    record.time.timestamp_millis(),
                    bytes,
                    BID_HISTORY_CAP,
                )
                .await;
        }
    }

    async fn persist_auction(&self, auction: &Auction) {
        if let Ok(bytes) = serde_json::to_vec(auction) {
            if let Err(e) = self
                .store
                .set(&auction_key(&auction.id.0), bytes, TTL_AUCTION)
                .await
            {
                warn!(error = %e, auction_id = %auction.id, "failed to persist auction");
            }
        }
    }

    async fn notify(&self, notification: NotificationOut) -> Result<(), ()> {
        self.bus
            .notifications_tx
            .send(notification)
            .await
            .map_err(|_| ())
    }

    /// Drains the notifications mpsc and re-publishes to a broadcast
    /// channel so every connected client sees every notification; the
    /// mpsc side gives producers (StrategyEngine) blocking back-pressure,
    /// the broadcast side gives the hub fan-out.
    pub async fn run_notification_fanout(
        self: Arc<Self>,
        mut rx: tokio::sync::mpsc::Receiver<NotificationOut>,
    ) {
        while let Some(n) = rx.recv().await {
            let _ = self.notifications_broadcast.send(n);
        }
    }

    /// Consumes circuit breaker transitions — the "pipeline toggle"
    /// spec.md §4.3 calls for: an Open/HalfOpen/Closed transition forces an
    /// immediate `reconcile_health` sweep of every monitored auction
    /// instead of waiting for the next snapshot to trigger one, so a
    /// tripped breaker gets Polling auctions probing for a Stream
    /// reconnect right away.
    pub async fn run_breaker_watch(self: Arc<Self>) {
        let mut events = self.breaker.subscribe();
        loop {
            match events.recv().await {
                Ok(event) => {
                    match event {
                        BreakerEvent::Opened => warn!("circuit breaker opened"),
                        BreakerEvent::HalfOpened => info!("circuit breaker half-open probe admitted"),
                        BreakerEvent::Closed => info!("circuit breaker closed"),
                    }
                    for entry in self.table.iter() {
                        self.router.reconcile_health(entry.key());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }

    /// Consumes state transitions and bid attempts for the audit trail a
    /// metrics layer would otherwise read; this repo logs via `tracing`
    /// rather than shipping a separate metrics sink, matching the rest of
    /// the business-event logging throughout this module.
    pub async fn run_audit_log(self: Arc<Self>) {
        let mut transitions = self.bus.subscribe_transitions();
        let mut bids = self.bus.subscribe_bids();
        loop {
            tokio::select! {
                res = transitions.recv() => {
                    match res {
                        Ok(t) => info!(auction_id = %t.auction_id, from = %t.from, to = %t.to, "state transition"),
                        Err(broadcast::error::RecvError::Closed) => return,
                        Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "audit log lagged on state transitions"),
                    }
                }
                res = bids.recv() => {
                    match res {
                        Ok(b) => info!(auction_id = %b.auction_id, amount = b.amount, outcome = %b.outcome, "bid attempted"),
                        Err(broadcast::error::RecvError::Closed) => return,
                        Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "audit log lagged on bid attempts"),
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // Client command handling
    // -------------------------------------------------------------------

    pub async fn dispatch(self: &Arc<Self>, command: Command, reply: oneshot::Sender<CommandOutcome>) {
        let outcome = match command {
            Command::StartMonitoring {
                auction_id,
                config,
                metadata,
            } => self.handle_start_monitoring(auction_id, config, metadata).await,
            Command::StopMonitoring { auction_id } => self.handle_stop_monitoring(auction_id).await,
            Command::UpdateConfig { auction_id, config } => {
                self.handle_update_config(auction_id, config).await
            }
            Command::PlaceBid { auction_id, amount } => {
                self.handle_place_bid(auction_id, amount).await
            }
            Command::GetMonitoredAuctions => self.handle_get_monitored_auctions(),
        };
        let _ = reply.send(outcome);
    }

    async fn handle_start_monitoring(
        self: &Arc<Self>,
        auction_id: AuctionId,
        config: AuctionConfig,
        _metadata: Option<serde_json::Value>,
    ) -> CommandOutcome {
        if self.table.contains_key(&auction_id) {
            return CommandOutcome::Error(format!("{auction_id} is already monitored"));
        }
        if let Err(e) = config.validate() {
            return CommandOutcome::Error(e);
        }

        let fetch = match self.breaker.fetch_auction(&auction_id.0).await {
            Ok(f) => f,
            Err(e) => return CommandOutcome::Error(format!("failed to fetch auction: {e}")),
        };

        let auction = Auction {
            id: auction_id.clone(),
            title: fetch.title,
            url: fetch.url,
            image_url: fetch.image_url,
            config,
            state: AuctionState::Monitoring,
            current: fetch.snapshot,
            last_updated_at: chrono::Utc::now(),
            last_bid_placed: None,
            source: PipelineKind::Polling,
            max_bid_notified: false,
        };

        self.table.insert(auction_id.clone(), auction.clone());
        self.router.enroll(auction_id);
        self.persist_auction(&auction).await;
        let _ = self.bus.auction_state_tx.send(auction);

        CommandOutcome::Data(serde_json::json!({ "success": true }))
    }

    async fn handle_stop_monitoring(self: &Arc<Self>, auction_id: AuctionId) -> CommandOutcome {
        if self.table.remove(&auction_id).is_none() {
            return CommandOutcome::Error(format!("{auction_id} is not monitored"));
        }
        self.router.remove(&auction_id);
        CommandOutcome::Data(serde_json::json!({ "success": true }))
    }

    async fn handle_update_config(
        self: &Arc<Self>,
        auction_id: AuctionId,
        config: AuctionConfig,
    ) -> CommandOutcome {
        if let Err(e) = config.validate() {
            return CommandOutcome::Error(e);
        }
        let Some(mut entry) = self.table.get_mut(&auction_id) else {
            return CommandOutcome::Error(format!("{auction_id} is not monitored"));
        };
        entry.config = config;
        entry.max_bid_notified = false;
        let snapshot = entry.clone();
        drop(entry);
        self.persist_auction(&snapshot).await;
        let _ = self.bus.auction_state_tx.send(snapshot);
        CommandOutcome::Data(serde_json::json!({ "success": true }))
    }

    async fn handle_place_bid(self: &Arc<Self>, auction_id: AuctionId, amount: u64) -> CommandOutcome {
        let Some(auction) = self.table.get(&auction_id).map(|a| a.clone()) else {
            return CommandOutcome::Error(format!("{auction_id} is not monitored"));
        };
        if matches!(auction.state, AuctionState::Ended | AuctionState::Terminated) {
            return CommandOutcome::Error("auction has ended".into());
        }
        let clamped = amount.min(auction.config.max_bid);
        if clamped != amount {
            return CommandOutcome::Error("amount exceeds maxBid".into());
        }
        self.attempt_bid(auction_id, amount, crate::types::Strategy::Manual).await;
        CommandOutcome::Data(serde_json::json!({ "success": true }))
    }

    fn handle_get_monitored_auctions(&self) -> CommandOutcome {
        let auctions: Vec<Auction> = self.table.iter().map(|e| e.value().clone()).collect();
        CommandOutcome::Data(serde_json::json!({ "auctions": auctions }))
    }

    pub async fn handle_disconnect(&self, _client_id: &uuid::Uuid) {
        // No per-client server-side state beyond the connection itself;
        // nothing to release here besides the hub's own slot accounting.
    }

    // -------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------

    /// Graceful shutdown per spec.md §4.10: stop pipelines, flush writes,
    /// then let callers close connections (the hub sends a final
    /// `disconnected` frame per connection as each task unwinds).
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.polling.stop();
        for entry in self.table.iter() {
            self.router.remove(&entry.id);
        }
        info!("coordinator shutdown: pipelines stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{AuctionSnapshot, PipelineKind};

    /// Builds a fully wired coordinator with real (but network-inert)
    /// collaborators: constructing an `UpstreamClient` and `CircuitBreaker`
    /// does no I/O, and `stream_enabled: false` keeps `router.enroll` from
    /// spawning an SSE task, so no test here ever touches the network.
    fn test_coordinator() -> Arc<MonitorCoordinator> {
        test_coordinator_with_secret(None)
    }

    fn test_coordinator_with_secret(encryption_secret: Option<&str>) -> Arc<MonitorCoordinator> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let upstream = Arc::new(
            UpstreamClient::new("http://127.0.0.1:9", "http://127.0.0.1:9", "secret", 60).unwrap(),
        );
        let breaker = Arc::new(CircuitBreaker::new(
            UpstreamClient::new("http://127.0.0.1:9", "http://127.0.0.1:9", "secret", 60).unwrap(),
            3,
            Duration::from_secs(30),
        ));
        let (snapshot_tx, _snapshot_rx) = tokio::sync::mpsc::channel(16);
        let polling = PollingQueue::new(breaker.clone(), snapshot_tx.clone(), Duration::from_secs(30));
        let router = Arc::new(UpdateRouter::new(
            polling.clone(),
            upstream.clone(),
            snapshot_tx,
            "http://127.0.0.1:9/sse".to_string(),
            false,
        ));
        let (coordinator, _notifications_rx) = MonitorCoordinator::new(
            store,
            upstream,
            breaker,
            router,
            polling,
            encryption_secret.map(String::from),
        );
        coordinator
    }

    fn sample_snapshot(current_bid: u64) -> AuctionSnapshot {
        AuctionSnapshot {
            current_bid,
            next_bid: current_bid + 1,
            bid_count: 1,
            bidder_count: 1,
            is_winning: true,
            is_watching: true,
            is_closed: false,
            close_at: chrono::Utc::now() + chrono::Duration::hours(1),
            retail_price: 500,
            extension_interval_seconds: 0,
            last_updated_at: chrono::Utc::now(),
        }
    }

    fn sample_config() -> AuctionConfig {
        AuctionConfig {
            max_bid: 100,
            strategy: crate::types::Strategy::Manual,
            auto_bid: false,
            bid_increment: 1,
            snipe_seconds: 30,
        }
    }

    fn insert_monitored(coordinator: &MonitorCoordinator, id: &AuctionId, current_bid: u64) {
        let auction = Auction {
            id: id.clone(),
            title: String::new(),
            url: String::new(),
            image_url: String::new(),
            config: sample_config(),
            state: AuctionState::Monitoring,
            current: sample_snapshot(current_bid),
            last_updated_at: chrono::Utc::now(),
            last_bid_placed: None,
            source: PipelineKind::Polling,
            max_bid_notified: false,
        };
        coordinator.table.insert(id.clone(), auction);
        coordinator.router.enroll(id.clone());
    }

    #[tokio::test]
    async fn stop_monitoring_unknown_auction_errors() {
        let coordinator = test_coordinator();
        let outcome = coordinator
            .handle_stop_monitoring(AuctionId::from("missing"))
            .await;
        assert!(matches!(outcome, CommandOutcome::Error(_)));
    }

    #[tokio::test]
    async fn stop_monitoring_known_auction_removes_it() {
        let coordinator = test_coordinator();
        let id = AuctionId::from("a1");
        insert_monitored(&coordinator, &id, 50);

        let outcome = coordinator.handle_stop_monitoring(id.clone()).await;
        assert!(matches!(outcome, CommandOutcome::Data(_)));
        assert!(!coordinator.table.contains_key(&id));
    }

    #[tokio::test]
    async fn update_config_rejects_invalid_max_bid() {
        let coordinator = test_coordinator();
        let id = AuctionId::from("a1");
        insert_monitored(&coordinator, &id, 50);

        let mut config = sample_config();
        config.max_bid = 0;
        let outcome = coordinator.handle_update_config(id, config).await;
        assert!(matches!(outcome, CommandOutcome::Error(_)));
    }

    #[tokio::test]
    async fn update_config_resets_max_bid_notified() {
        let coordinator = test_coordinator();
        let id = AuctionId::from("a1");
        insert_monitored(&coordinator, &id, 50);
        coordinator.table.get_mut(&id).unwrap().max_bid_notified = true;

        let outcome = coordinator.handle_update_config(id.clone(), sample_config()).await;
        assert!(matches!(outcome, CommandOutcome::Data(_)));
        assert!(!coordinator.table.get(&id).unwrap().max_bid_notified);
    }

    #[tokio::test]
    async fn place_bid_rejects_amount_exceeding_max() {
        let coordinator = test_coordinator();
        let id = AuctionId::from("a1");
        insert_monitored(&coordinator, &id, 50);

        let outcome = coordinator.handle_place_bid(id, 101).await;
        assert!(matches!(outcome, CommandOutcome::Error(_)));
    }

    #[tokio::test]
    async fn place_bid_rejects_on_ended_auction() {
        let coordinator = test_coordinator();
        let id = AuctionId::from("a1");
        insert_monitored(&coordinator, &id, 50);
        coordinator.table.get_mut(&id).unwrap().state = AuctionState::Ended;

        let outcome = coordinator.handle_place_bid(id, 60).await;
        assert!(matches!(outcome, CommandOutcome::Error(_)));
    }

    #[tokio::test]
    async fn get_monitored_auctions_lists_every_entry() {
        let coordinator = test_coordinator();
        insert_monitored(&coordinator, &AuctionId::from("a1"), 10);
        insert_monitored(&coordinator, &AuctionId::from("a2"), 20);

        let CommandOutcome::Data(value) = coordinator.handle_get_monitored_auctions() else {
            panic!("expected Data outcome");
        };
        assert_eq!(value["auctions"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn apply_snapshot_ignores_unknown_auction() {
        let coordinator = test_coordinator();
        coordinator
            .apply_snapshot(SnapshotReceived {
                auction_id: AuctionId::from("ghost"),
                snapshot: sample_snapshot(10),
                source: PipelineKind::Polling,
            })
            .await;
        assert!(coordinator.table.is_empty());
    }

    #[tokio::test]
    async fn apply_snapshot_merges_and_persists() {
        let coordinator = test_coordinator();
        let id = AuctionId::from("a1");
        insert_monitored(&coordinator, &id, 50);

        coordinator
            .apply_snapshot(SnapshotReceived {
                auction_id: id.clone(),
                snapshot: sample_snapshot(60),
                source: PipelineKind::Stream,
            })
            .await;

        let auction = coordinator.table.get(&id).unwrap();
        assert_eq!(auction.current.current_bid, 60);
        assert_eq!(auction.source, PipelineKind::Stream);

        let persisted = coordinator
            .store
            .get(&crate::store::auction_key(&id.0))
            .await
            .unwrap();
        assert!(persisted.is_some());
    }

    #[tokio::test]
    async fn terminate_removes_from_table_and_marks_terminated() {
        let coordinator = test_coordinator();
        let id = AuctionId::from("a1");
        insert_monitored(&coordinator, &id, 50);

        coordinator.terminate(&id).await;
        assert!(!coordinator.table.contains_key(&id));

        let raw = coordinator
            .store
            .get(&crate::store::auction_key(&id.0))
            .await
            .unwrap()
            .unwrap();
        let persisted: Auction = serde_json::from_slice(&raw).unwrap();
        assert_eq!(persisted.state, AuctionState::Terminated);
    }

    #[tokio::test]
    async fn handle_disconnect_is_a_no_op() {
        let coordinator = test_coordinator();
        coordinator.handle_disconnect(&uuid::Uuid::new_v4()).await;
    }

    #[tokio::test]
    async fn shutdown_stops_polling_and_clears_router_entries() {
        let coordinator = test_coordinator();
        insert_monitored(&coordinator, &AuctionId::from("a1"), 50);
        coordinator.shutdown().await;
        assert!(coordinator.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn recover_from_store_skips_ended_and_terminated_auctions() {
        let coordinator = test_coordinator();

        let mut ended = Auction {
            id: AuctionId::from("ended"),
            title: String::new(),
            url: String::new(),
            image_url: String::new(),
            config: sample_config(),
            state: AuctionState::Ended,
            current: sample_snapshot(10),
            last_updated_at: chrono::Utc::now(),
            last_bid_placed: None,
            source: PipelineKind::Polling,
            max_bid_notified: false,
        };
        coordinator
            .store
            .set(
                &crate::store::auction_key("ended"),
                serde_json::to_vec(&ended).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        ended.id = AuctionId::from("live");
        ended.state = AuctionState::Monitoring;
        coordinator
            .store
            .set(
                &crate::store::auction_key("live"),
                serde_json::to_vec(&ended).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        coordinator.recover_from_store().await.unwrap();
        assert!(!coordinator.table.contains_key(&AuctionId::from("ended")));
        assert!(coordinator.table.contains_key(&AuctionId::from("live")));
    }

    #[tokio::test]
    async fn recover_from_store_decrypts_cookie_when_secret_configured() {
        let coordinator = test_coordinator_with_secret(Some("test-secret"));
        let session = Session {
            cookie: "sess=abc123".to_string(),
            refreshed_at: chrono::Utc::now(),
        };
        let plaintext = serde_json::to_string(&session).unwrap();
        let ciphertext = crate::crypto::encrypt_cookie("test-secret", &plaintext);
        coordinator
            .store
            .set(COOKIES_KEY, ciphertext, Duration::from_secs(60))
            .await
            .unwrap();

        coordinator.recover_from_store().await.unwrap();
        assert_eq!(
            coordinator.upstream.session_cookie(),
            Some("sess=abc123".to_string())
        );
    }

    #[tokio::test]
    async fn recover_from_store_ignores_cookie_with_wrong_secret() {
        let coordinator = test_coordinator_with_secret(Some("right-secret"));
        let session = Session {
            cookie: "sess=abc123".to_string(),
            refreshed_at: chrono::Utc::now(),
        };
        let plaintext = serde_json::to_string(&session).unwrap();
        let ciphertext = crate::crypto::encrypt_cookie("wrong-secret", &plaintext);
        coordinator
            .store
            .set(COOKIES_KEY, ciphertext, Duration::from_secs(60))
            .await
            .unwrap();

        coordinator.recover_from_store().await.unwrap();
        assert_eq!(coordinator.upstream.session_cookie(), None);
    }
}
