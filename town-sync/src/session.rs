//! Session orchestration: one `TownSession` per player tab.
//!
//! The session owns the materialized views, the operating-mode decision, and
//! the background pumps that feed them. Every write follows the same shape:
//! apply optimistically to the local view first, then persist or broadcast in
//! a detached task. Write operations never return errors to the caller; a
//! failed remote write is retried once over the local broadcast and reported
//! to the mode controller, which may degrade the whole session.
//!
//! Sessions are plain values handed an explicitly shared [`LocalBroker`];
//! there is no process-global registry, so tests can run many isolated
//! "devices" side by side.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broker::LocalBroker;
use crate::config::SessionConfig;
use crate::mode::{FailureKind, Mode, ModeController};
use crate::presence::{PresenceTracker, ACTIVE_THRESHOLD_MS, STALE_BOUND_MS};
use crate::protocol::{now_ms, ChatMessage, Envelope, MessageKind, PresenceRecord, Tile, TileKind};
use crate::remote::{RemoteEvent, RemoteStore};
use crate::tiles::TileGrid;

const CHAT_BUFFER: usize = 64;

struct Shared {
    session_id: Uuid,
    config: SessionConfig,
    mode: ModeController,
    grid: TileGrid,
    presence: PresenceTracker,
    broker: Arc<LocalBroker>,
    remote: Option<RemoteStore>,
    local_attached: AtomicBool,
    chat_tx: mpsc::Sender<ChatMessage>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    /// Track a spawned task for abort-on-shutdown, dropping handles of tasks
    /// that have already finished so a long-lived session does not accumulate
    /// one handle per operation.
    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    fn publish_local(&self, envelope: &Envelope) {
        if let Err(e) = self.broker.publish(envelope) {
            log::warn!("local broadcast failed: {e}");
        }
    }

    /// Record a remote failure; if it degrades the session, start listening
    /// on the local broadcast so same-device peers stay in sync.
    fn report_remote_failure(self: &Arc<Self>, kind: FailureKind) {
        if self.mode.report_failure(kind) == Mode::LocalBroadcast {
            self.attach_local();
        }
    }

    /// Start the local-broadcast pump and the presence heartbeat. Idempotent;
    /// the first caller wins and also asks peers to re-emit their state.
    fn attach_local(self: &Arc<Self>) {
        if self
            .local_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let pump = {
            let shared = self.clone();
            let rx = self.broker.subscribe();
            tokio::spawn(async move { shared.local_pump(rx).await })
        };
        let heartbeat = {
            let shared = self.clone();
            tokio::spawn(async move { shared.heartbeat_loop().await })
        };
        self.track(pump);
        self.track(heartbeat);

        // Recover state already held by live same-device peers.
        self.publish_local(&Envelope::sync_request(self.session_id));
        self.publish_local(&Envelope::presence_request(self.session_id));
    }

    async fn local_pump(self: Arc<Self>, mut rx: tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>) {
        loop {
            let bytes = match rx.recv().await {
                Ok(bytes) => bytes,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("local pump lagged, {n} messages dropped");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            let envelope = match Envelope::decode(&bytes) {
                Ok(env) => env,
                Err(e) => {
                    log::warn!("dropping undecodable broadcast: {e}");
                    continue;
                }
            };
            // Our own messages come back on the channel; a delayed echo must
            // never overwrite fresher optimistic state.
            if envelope.origin == self.session_id {
                continue;
            }
            self.apply_peer_envelope(&envelope).await;
        }
    }

    async fn apply_peer_envelope(self: &Arc<Self>, envelope: &Envelope) {
        match envelope.kind {
            MessageKind::TileUpsert => {
                if let Ok(tile) = envelope.tile() {
                    self.grid.apply_remote(tile);
                }
            }
            MessageKind::TileDelete => {
                if let Ok(key) = envelope.tile_key() {
                    self.grid.apply_remote(Tile::empty(key.x, key.y));
                }
            }
            MessageKind::TileClearAll => self.grid.clear_all(),
            MessageKind::PresenceUpdate => {
                if let Ok(record) = envelope.presence() {
                    self.presence.apply_peer(record);
                }
            }
            MessageKind::PresenceBatch => {
                if let Ok(records) = envelope.presences() {
                    for record in records {
                        if record.player_id != self.config.player_id {
                            self.presence.apply_peer(record);
                        }
                    }
                }
            }
            MessageKind::PresenceRequest => {
                if let Some(me) = self.presence.get(&self.config.player_id) {
                    self.publish_local(&Envelope::presence_update(self.session_id, &me));
                }
            }
            MessageKind::SyncRequest => {
                let shared = self.clone();
                let handle = tokio::spawn(async move { shared.answer_sync_request().await });
                self.track(handle);
            }
            MessageKind::Chat => {
                if let Ok(message) = envelope.chat_message() {
                    let _ = self.chat_tx.send(message).await;
                }
            }
            _ => {}
        }
    }

    /// Re-emit our full tile and presence state, staggered so a burst of
    /// simultaneous responders does not flood slow receivers.
    async fn answer_sync_request(self: Arc<Self>) {
        let tiles = self.grid.snapshot();
        log::debug!("answering sync request with {} tiles", tiles.len());
        for tile in tiles.values() {
            self.publish_local(&Envelope::tile_upsert(self.session_id, tile));
            tokio::time::sleep(self.config.sync_response_stagger).await;
        }
        let records = self.presence.active_players(ACTIVE_THRESHOLD_MS);
        if !records.is_empty() {
            self.publish_local(&Envelope::presence_batch(self.session_id, &records));
        }
    }

    /// Gossip the believed-active player set on a fixed cadence, sweeping
    /// long-idle records along the way.
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.presence.sweep_stale(STALE_BOUND_MS);
            let records = self.presence.active_players(ACTIVE_THRESHOLD_MS);
            if !records.is_empty() {
                self.publish_local(&Envelope::presence_batch(self.session_id, &records));
            }
        }
    }

    async fn remote_pump(self: Arc<Self>, mut rx: mpsc::Receiver<RemoteEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                RemoteEvent::Tile { tile, .. } => self.grid.apply_remote(tile),
                RemoteEvent::ClearAll { .. } => self.grid.clear_all(),
                RemoteEvent::Presence { record, .. } => {
                    if record.player_id != self.config.player_id {
                        self.presence.apply_peer(record);
                    }
                    // No heartbeat runs in Remote mode; GC rides the feed.
                    self.presence.sweep_stale(STALE_BOUND_MS);
                }
                RemoteEvent::Chat { message, .. } => {
                    let _ = self.chat_tx.send(message).await;
                }
                RemoteEvent::SubscriptionLost => {
                    log::warn!("change feed lost");
                    self.report_remote_failure(FailureKind::Subscription);
                    break;
                }
            }
        }
    }

    /// Periodic repair pass: re-read the tiles table and merge any upserts
    /// the change feed missed. Deletes are not repaired here; they arrive
    /// on the feed.
    async fn reconcile_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !self.mode.is_remote() {
                break;
            }
            let Some(remote) = &self.remote else { break };
            match remote.fetch_all_tiles().await {
                Ok(tiles) => {
                    for tile in tiles {
                        self.grid.apply_remote(tile);
                    }
                }
                Err(e) => {
                    log::warn!("reconcile fetch failed: {e}");
                    self.report_remote_failure(e.failure_kind());
                }
            }
        }
    }

    async fn persist_tile(self: Arc<Self>, tile: Tile) {
        if self.mode.is_remote() {
            if let Some(remote) = &self.remote {
                match remote.upsert_tile(&tile).await {
                    Ok(()) => return,
                    Err(e) => {
                        log::warn!("tile write failed: {e}");
                        self.report_remote_failure(e.failure_kind());
                    }
                }
            }
        }
        // Retry once over the local broadcast so same-device peers converge.
        self.publish_local(&Envelope::tile_upsert(self.session_id, &tile));
    }

    async fn persist_presence(self: Arc<Self>, record: PresenceRecord) {
        if self.mode.is_remote() {
            if let Some(remote) = &self.remote {
                match remote.upsert_presence(&record).await {
                    Ok(()) => return,
                    Err(e) => {
                        log::warn!("presence write failed: {e}");
                        self.report_remote_failure(e.failure_kind());
                    }
                }
            }
        }
        self.publish_local(&Envelope::presence_update(self.session_id, &record));
    }

    async fn persist_clear_all(self: Arc<Self>) {
        if self.mode.is_remote() {
            if let Some(remote) = &self.remote {
                match remote.clear_all_tiles().await {
                    Ok(()) => return,
                    Err(e) => {
                        log::warn!("clear-all failed: {e}");
                        self.report_remote_failure(e.failure_kind());
                    }
                }
            }
        }
        self.publish_local(&Envelope::tile_clear_all(self.session_id));
    }

    async fn persist_chat(self: Arc<Self>, message: ChatMessage) {
        if self.mode.is_remote() {
            if let Some(remote) = &self.remote {
                match remote.send_chat(&message).await {
                    Ok(()) => return,
                    Err(e) => {
                        log::warn!("chat send failed: {e}");
                        self.report_remote_failure(e.failure_kind());
                    }
                }
            }
        }
        self.publish_local(&Envelope::chat(self.session_id, &message));
    }
}

/// One player's live connection to the shared town.
pub struct TownSession {
    shared: Arc<Shared>,
    chat_rx: Option<mpsc::Receiver<ChatMessage>>,
}

impl TownSession {
    /// Build the session and bring its transports up.
    ///
    /// With remote configuration present this connects, seeds the grid from
    /// the tiles table, and subscribes to the change feed; any failure along
    /// that path degrades to local-broadcast mode instead of erroring. This
    /// call itself never fails.
    pub async fn connect(config: SessionConfig, broker: Arc<LocalBroker>) -> Self {
        let session_id = Uuid::new_v4();
        let mode = ModeController::resolve(config.remote.is_some());

        let mut remote = None;
        let mut event_rx = None;
        if let Some(remote_config) = config.remote.clone() {
            let mut store = RemoteStore::new(session_id, &config.player_id, remote_config);
            match store.connect().await {
                Ok(()) => {
                    event_rx = store.take_event_rx();
                    remote = Some(store);
                }
                Err(e) => {
                    log::warn!("remote connect failed: {e}");
                    // An unreachable or rejecting backend at startup is a
                    // subscription failure, not a one-off timeout.
                    mode.report_failure(FailureKind::Subscription);
                }
            }
        }

        let (chat_tx, chat_rx) = mpsc::channel(CHAT_BUFFER);
        let shared = Arc::new(Shared {
            session_id,
            config,
            mode,
            grid: TileGrid::new(),
            presence: PresenceTracker::new(),
            broker,
            remote,
            local_attached: AtomicBool::new(false),
            chat_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        if shared.mode.is_remote() {
            if let Some(remote) = &shared.remote {
                match remote.fetch_all_tiles().await {
                    Ok(tiles) => {
                        for tile in tiles {
                            shared.grid.apply_remote(tile);
                        }
                    }
                    Err(e) => {
                        log::warn!("initial tile fetch failed: {e}");
                        shared.report_remote_failure(e.failure_kind());
                    }
                }
            }
        }

        if shared.mode.is_remote() {
            if let Some(rx) = event_rx {
                let pump = {
                    let inner = shared.clone();
                    tokio::spawn(async move { inner.remote_pump(rx).await })
                };
                shared.track(pump);
            }
            if let Some(interval) = shared.config.reconcile_interval {
                let reconcile = {
                    let inner = shared.clone();
                    tokio::spawn(async move { inner.reconcile_loop(interval).await })
                };
                shared.track(reconcile);
            }
        } else {
            shared.attach_local();
        }

        Self {
            shared,
            chat_rx: Some(chat_rx),
        }
    }

    /// Place (or overwrite) a tile. Applied to the local view immediately;
    /// persistence happens in the background and never surfaces an error.
    pub fn place_tile(&self, x: i32, y: i32, kind: TileKind) {
        let tile = if kind.is_empty() {
            Tile::empty(x, y)
        } else {
            Tile::new(x, y, kind, self.shared.config.player_id.clone())
        };
        self.shared.grid.apply_local(tile.clone());

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move { shared.persist_tile(tile).await });
        self.shared.track(handle);
    }

    /// Remove the tile at a coordinate (an `Empty` placement).
    pub fn remove_tile(&self, x: i32, y: i32) {
        self.place_tile(x, y, TileKind::Empty);
    }

    /// Publish the local player's cursor position and refresh their liveness.
    pub fn update_cursor(&self, x: i32, y: i32) {
        self.shared
            .presence
            .record_local(&self.shared.config.player_id, x, y);
        let record = match self.shared.presence.get(&self.shared.config.player_id) {
            Some(record) => record,
            None => return,
        };

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move { shared.persist_presence(record).await });
        self.shared.track(handle);
    }

    /// Wipe the whole town for everyone.
    pub fn clear_all_tiles(&self) {
        self.shared.grid.clear_all();
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move { shared.persist_clear_all().await });
        self.shared.track(handle);
    }

    /// Send a chat line to every peer.
    pub fn send_chat(&self, text: impl Into<String>) {
        let message = ChatMessage {
            player_id: self.shared.config.player_id.clone(),
            text: text.into(),
            sent_at_ms: now_ms(),
        };
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move { shared.persist_chat(message).await });
        self.shared.track(handle);
    }

    /// Point-in-time copy of the tile view.
    pub fn snapshot(&self) -> std::collections::HashMap<crate::protocol::TileKey, Tile> {
        self.shared.grid.snapshot()
    }

    pub fn tile_at(&self, x: i32, y: i32) -> Option<Tile> {
        self.shared.grid.get(crate::protocol::TileKey::new(x, y))
    }

    pub fn tile_count(&self) -> usize {
        self.shared.grid.len()
    }

    /// Peers (and self) active within the default threshold.
    pub fn active_players(&self) -> Vec<PresenceRecord> {
        self.shared.presence.active_players(ACTIVE_THRESHOLD_MS)
    }

    /// Peers (and self) active within a caller-chosen threshold.
    pub fn active_players_within(&self, threshold_ms: u64) -> Vec<PresenceRecord> {
        self.shared.presence.active_players(threshold_ms)
    }

    /// Count of players active within the default threshold.
    pub fn player_count(&self) -> usize {
        self.shared.presence.active_count(ACTIVE_THRESHOLD_MS)
    }

    pub fn mode(&self) -> Mode {
        self.shared.mode.current()
    }

    /// Whether this session started remote and has since fallen back.
    pub fn degraded(&self) -> bool {
        self.shared.mode.degraded()
    }

    pub fn session_id(&self) -> Uuid {
        self.shared.session_id
    }

    pub fn player_id(&self) -> &str {
        &self.shared.config.player_id
    }

    /// Take the inbound chat receiver (can only be taken once).
    pub fn take_chat_rx(&mut self) -> Option<mpsc::Receiver<ChatMessage>> {
        self.chat_rx.take()
    }

    /// Stop all background pumps. Also runs on drop.
    pub fn shutdown(&self) {
        for handle in self.shared.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TownSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn local_session(player: &str, broker: &Arc<LocalBroker>) -> TownSession {
        TownSession::connect(SessionConfig::local(player), broker.clone()).await
    }

    #[tokio::test]
    async fn test_local_session_starts_in_local_mode() {
        let broker = Arc::new(LocalBroker::default());
        let session = local_session("alice", &broker).await;
        assert_eq!(session.mode(), Mode::LocalBroadcast);
        assert!(!session.degraded());
        assert_eq!(session.player_id(), "alice");
    }

    #[tokio::test]
    async fn test_place_tile_is_visible_immediately() {
        let broker = Arc::new(LocalBroker::default());
        let session = local_session("alice", &broker).await;

        session.place_tile(2, 3, TileKind::Forest);
        let tile = session.tile_at(2, 3).unwrap();
        assert_eq!(tile.kind, TileKind::Forest);
        assert_eq!(tile.placed_by.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_remove_tile_clears_cell() {
        let broker = Arc::new(LocalBroker::default());
        let session = local_session("alice", &broker).await;

        session.place_tile(1, 1, TileKind::House);
        session.remove_tile(1, 1);
        assert!(session.tile_at(1, 1).is_none());
    }

    #[tokio::test]
    async fn test_update_cursor_makes_self_active() {
        let broker = Arc::new(LocalBroker::default());
        let session = local_session("alice", &broker).await;

        session.update_cursor(4, 5);
        let players = session.active_players();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].player_id, "alice");
        assert_eq!((players[0].x, players[0].y), (4, 5));
    }

    #[tokio::test]
    async fn test_clear_all_empties_view() {
        let broker = Arc::new(LocalBroker::default());
        let session = local_session("alice", &broker).await;

        session.place_tile(0, 0, TileKind::Grass);
        session.place_tile(1, 0, TileKind::Road);
        session.clear_all_tiles();
        assert_eq!(session.tile_count(), 0);
    }

    #[tokio::test]
    async fn test_take_chat_rx_once() {
        let broker = Arc::new(LocalBroker::default());
        let mut session = local_session("alice", &broker).await;
        assert!(session.take_chat_rx().is_some());
        assert!(session.take_chat_rx().is_none());
    }

    #[tokio::test]
    async fn test_finished_persist_tasks_are_reaped() {
        let broker = Arc::new(LocalBroker::default());
        let session = local_session("alice", &broker).await;

        for i in 0..100 {
            session.update_cursor(i, i);
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        // The next operation reaps every handle that has since finished;
        // only the pumps and this one write may remain.
        session.update_cursor(0, 0);
        assert!(session.shared.tasks.lock().unwrap().len() < 10);
    }

    #[tokio::test]
    async fn test_sessions_have_distinct_ids() {
        let broker = Arc::new(LocalBroker::default());
        let a = local_session("alice", &broker).await;
        let b = local_session("bob", &broker).await;
        assert_ne!(a.session_id(), b.session_id());
    }
}
