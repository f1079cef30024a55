//! WebSocket adapter for the remote town store.
//!
//! Provides:
//! - Connection lifecycle with a credential handshake
//! - Request/response calls (fetch, upsert, clear) correlated by sequence
//! - A change-feed of peer events decoded off the same socket
//!
//! Every failure is classified into [`RemoteError`] so the session layer can
//! map it onto a fallback decision without inspecting transport details.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::config::RemoteConfig;
use crate::mode::FailureKind;
use crate::protocol::{
    ChatMessage, Envelope, MessageKind, PresenceRecord, RemoteFault, Tile, TileKey,
};

/// How long a request may wait for its reply before it counts as a
/// transient failure.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const OUTGOING_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

/// Remote store failures, classified for the fallback decision.
#[derive(Debug, Clone)]
pub enum RemoteError {
    /// The backend reports the addressed resource does not exist.
    ResourceUnavailable(String),
    /// The access credential was rejected.
    Unauthorized(String),
    /// Network failure, timeout, or a server-side internal error.
    Transient(String),
    /// The peer sent something that does not parse as the protocol.
    Protocol(String),
    /// The connection is gone.
    Closed,
}

impl RemoteError {
    /// Map onto the mode controller's failure taxonomy.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::ResourceUnavailable(_) | Self::Unauthorized(_) => FailureKind::ResourceMissing,
            Self::Transient(_) | Self::Protocol(_) | Self::Closed => FailureKind::Transient,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceUnavailable(m) => write!(f, "remote resource unavailable: {m}"),
            Self::Unauthorized(m) => write!(f, "unauthorized: {m}"),
            Self::Transient(m) => write!(f, "transient remote failure: {m}"),
            Self::Protocol(m) => write!(f, "protocol error: {m}"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Change-feed events decoded from the server socket.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    /// A tile changed (deletes arrive as `Empty` tiles).
    Tile { origin: Uuid, tile: Tile },
    /// The whole grid was wiped.
    ClearAll { origin: Uuid },
    /// A peer's cursor moved.
    Presence { origin: Uuid, record: PresenceRecord },
    /// A chat line.
    Chat { origin: Uuid, message: ChatMessage },
    /// The socket closed; the feed will produce nothing further.
    SubscriptionLost,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Envelope>>>>;

/// Client handle for one session's connection to the town server.
///
/// Fan-out writes and correlated requests share the same socket; the reader
/// task routes replies by sequence number and forwards everything else to the
/// event feed.
pub struct RemoteStore {
    session_id: Uuid,
    player_id: String,
    config: RemoteConfig,
    connected: Arc<AtomicBool>,
    next_seq: AtomicU64,
    pending: PendingMap,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<RemoteEvent>>,
    event_tx: mpsc::Sender<RemoteEvent>,
}

impl RemoteStore {
    pub fn new(session_id: Uuid, player_id: impl Into<String>, config: RemoteConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            session_id,
            player_id: player_id.into(),
            config,
            connected: Arc::new(AtomicBool::new(false)),
            next_seq: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the change-feed receiver (can only be taken once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RemoteEvent>> {
        self.event_rx.take()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Connect, spawn the writer and reader tasks, and run the credential
    /// handshake. A rejected credential or a missing backend table surfaces
    /// here, before any game traffic flows.
    pub async fn connect(&mut self) -> Result<(), RemoteError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.config.endpoint)
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_BUFFER);
        self.outgoing_tx = Some(out_tx);

        // Writer task: forward the outgoing channel to the socket.
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        // Reader task: route replies by sequence, forward the rest.
        let event_tx = self.event_tx.clone();
        let pending = self.pending.clone();
        let connected = self.connected.clone();
        let session_id = self.session_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let envelope = match Envelope::decode(&bytes) {
                            Ok(env) => env,
                            Err(e) => {
                                log::warn!("dropping undecodable frame: {e}");
                                continue;
                            }
                        };

                        if envelope.seq != 0 {
                            if let Some(tx) = pending.lock().await.remove(&envelope.seq) {
                                let _ = tx.send(envelope);
                            }
                            continue;
                        }

                        if envelope.origin == session_id {
                            continue;
                        }

                        if let Some(event) = Self::decode_event(&envelope) {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            connected.store(false, Ordering::Release);
            pending.lock().await.clear();
            let _ = event_tx.send(RemoteEvent::SubscriptionLost).await;
        });

        let hello = crate::protocol::HelloPayload {
            player_id: self.player_id.clone(),
            access_key: self.config.access_key.clone(),
        };
        let reply = self.request(Envelope::hello(self.session_id, &hello)).await?;
        Self::expect_ack(reply)?;

        // Connected only once the handshake is acknowledged; a rejected
        // credential must never look like a live connection.
        self.connected.store(true, Ordering::Release);
        log::info!("connected to town server at {}", self.config.endpoint);
        Ok(())
    }

    fn decode_event(envelope: &Envelope) -> Option<RemoteEvent> {
        let origin = envelope.origin;
        match envelope.kind {
            MessageKind::TileUpsert => envelope
                .tile()
                .ok()
                .map(|tile| RemoteEvent::Tile { origin, tile }),
            // A row deletion becomes an Empty upsert for the cell.
            MessageKind::TileDelete => envelope
                .tile_key()
                .ok()
                .map(|key| RemoteEvent::Tile {
                    origin,
                    tile: Tile::empty(key.x, key.y),
                }),
            MessageKind::TileClearAll => Some(RemoteEvent::ClearAll { origin }),
            MessageKind::PresenceUpdate => envelope
                .presence()
                .ok()
                .map(|record| RemoteEvent::Presence { origin, record }),
            MessageKind::Chat => envelope
                .chat_message()
                .ok()
                .map(|message| RemoteEvent::Chat { origin, message }),
            _ => None,
        }
    }

    /// Send one correlated request and wait for its reply. The handshake
    /// itself goes through here, so the gate is the outgoing channel, not
    /// the post-handshake connected flag.
    async fn request(&self, envelope: Envelope) -> Result<Envelope, RemoteError> {
        if self.outgoing_tx.is_none() {
            return Err(RemoteError::Closed);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let envelope = envelope.with_seq(seq);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);

        if let Err(e) = self.send_raw(&envelope).await {
            self.pending.lock().await.remove(&seq);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RemoteError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                Err(RemoteError::Transient(format!("request {seq} timed out")))
            }
        }
    }

    async fn send_raw(&self, envelope: &Envelope) -> Result<(), RemoteError> {
        let encoded = envelope
            .encode()
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        match &self.outgoing_tx {
            Some(tx) => tx.send(encoded).await.map_err(|_| RemoteError::Closed),
            None => Err(RemoteError::Closed),
        }
    }

    fn expect_ack(reply: Envelope) -> Result<(), RemoteError> {
        match reply.kind {
            MessageKind::Ack => Ok(()),
            MessageKind::Error => Err(Self::fault_to_error(&reply)),
            other => Err(RemoteError::Protocol(format!(
                "unexpected reply kind {other:?}"
            ))),
        }
    }

    fn fault_to_error(reply: &Envelope) -> RemoteError {
        match reply.fault_payload() {
            Ok(fault) => match fault.fault {
                RemoteFault::NotFound => RemoteError::ResourceUnavailable(fault.message),
                RemoteFault::Unauthorized => RemoteError::Unauthorized(fault.message),
                RemoteFault::Internal => RemoteError::Transient(fault.message),
            },
            Err(e) => RemoteError::Protocol(e.to_string()),
        }
    }

    /// Read the full tiles table.
    pub async fn fetch_all_tiles(&self) -> Result<Vec<Tile>, RemoteError> {
        let reply = self.request(Envelope::fetch_tiles(self.session_id)).await?;
        match reply.kind {
            MessageKind::TileSnapshot => reply
                .tiles()
                .map_err(|e| RemoteError::Protocol(e.to_string())),
            MessageKind::Error => Err(Self::fault_to_error(&reply)),
            other => Err(RemoteError::Protocol(format!(
                "unexpected reply kind {other:?}"
            ))),
        }
    }

    /// Durably write one tile (an `Empty` kind clears the cell's row).
    pub async fn upsert_tile(&self, tile: &Tile) -> Result<(), RemoteError> {
        let reply = self
            .request(Envelope::tile_upsert(self.session_id, tile))
            .await?;
        Self::expect_ack(reply)
    }

    /// Delete one row by coordinate.
    pub async fn delete_tile(&self, key: TileKey) -> Result<(), RemoteError> {
        let reply = self
            .request(Envelope::tile_delete(self.session_id, key))
            .await?;
        Self::expect_ack(reply)
    }

    /// Wipe the tiles table.
    pub async fn clear_all_tiles(&self) -> Result<(), RemoteError> {
        let reply = self
            .request(Envelope::tile_clear_all(self.session_id))
            .await?;
        Self::expect_ack(reply)
    }

    /// Durably write the local player's presence row.
    pub async fn upsert_presence(&self, record: &PresenceRecord) -> Result<(), RemoteError> {
        let reply = self
            .request(Envelope::presence_update(self.session_id, record))
            .await?;
        Self::expect_ack(reply)
    }

    /// Fan out a chat line via the server.
    pub async fn send_chat(&self, message: &ChatMessage) -> Result<(), RemoteError> {
        let reply = self.request(Envelope::chat(self.session_id, message)).await?;
        Self::expect_ack(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RemoteStore {
        RemoteStore::new(
            Uuid::new_v4(),
            "player-1",
            RemoteConfig::new("ws://127.0.0.1:1", "test-key"),
        )
    }

    #[test]
    fn test_take_event_rx_once() {
        let mut store = store();
        assert!(store.take_event_rx().is_some());
        assert!(store.take_event_rx().is_none());
    }

    #[test]
    fn test_not_connected_initially() {
        assert!(!store().is_connected());
    }

    #[tokio::test]
    async fn test_request_before_connect_is_closed() {
        let store = store();
        match store.fetch_all_tiles().await {
            Err(RemoteError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_handshake_never_reports_connected() {
        use crate::server::{ServerConfig, TownServer};

        let server = Arc::new(TownServer::new(ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            access_key: Some("secret".to_string()),
            ..ServerConfig::default()
        }));
        let addr = server.start().await.unwrap();

        let mut store = RemoteStore::new(
            Uuid::new_v4(),
            "p",
            RemoteConfig::new(format!("ws://{addr}"), "wrong"),
        );
        match store.connect().await {
            Err(RemoteError::Unauthorized(_)) => {}
            other => panic!("expected Unauthorized, got {other:?}"),
        }
        assert!(!store.is_connected());
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_endpoint_is_transient() {
        let mut store = store();
        match store.connect().await {
            Err(e) => assert_eq!(e.failure_kind(), FailureKind::Transient),
            Ok(_) => panic!("connect to port 1 should fail"),
        }
    }

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(
            RemoteError::ResourceUnavailable("tiles".into()).failure_kind(),
            FailureKind::ResourceMissing
        );
        assert_eq!(
            RemoteError::Unauthorized("bad key".into()).failure_kind(),
            FailureKind::ResourceMissing
        );
        assert_eq!(
            RemoteError::Transient("timeout".into()).failure_kind(),
            FailureKind::Transient
        );
        assert_eq!(RemoteError::Closed.failure_kind(), FailureKind::Transient);
    }

    #[test]
    fn test_delete_event_becomes_empty_tile() {
        let origin = Uuid::new_v4();
        let envelope = Envelope::tile_delete(origin, TileKey::new(4, -2));
        match RemoteStore::decode_event(&envelope) {
            Some(RemoteEvent::Tile { tile, .. }) => {
                assert!(tile.kind.is_empty());
                assert_eq!(tile.key(), TileKey::new(4, -2));
            }
            other => panic!("expected empty tile event, got {other:?}"),
        }
    }

    #[test]
    fn test_correlated_replies_are_not_events() {
        let ack = Envelope::ack(Uuid::nil(), 3);
        assert!(RemoteStore::decode_event(&ack).is_none());
    }
}
