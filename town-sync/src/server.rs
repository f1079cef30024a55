//! WebSocket town server: durable tables plus change-feed fan-out.
//!
//! One process owns the tiles and players tables and fans every accepted
//! write out to all connected sessions. Request/response traffic (handshake,
//! fetches, writes) is answered directly on the requesting socket with the
//! request's sequence number; accepted writes are additionally re-broadcast
//! with sequence zero so receivers treat them as feed events.
//!
//! The provisioning flags exist for operating without one of the tables;
//! operations addressing an unprovisioned table answer with a not-found
//! fault, which clients treat as a permanent signal to run locally.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::broker::LocalBroker;
use crate::protocol::{now_ms, Envelope, MessageKind, PresenceRecord, RemoteFault, Tile, TileKey};

/// Server tuning and provisioning.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub broadcast_capacity: usize,
    /// When set, sessions must present this key in their handshake.
    pub access_key: Option<String>,
    /// Whether the tiles table exists.
    pub provision_tiles: bool,
    /// Whether the players table exists.
    pub provision_players: bool,
    /// Presence rows idle longer than this are pruned opportunistically.
    pub presence_prune_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            access_key: None,
            provision_tiles: true,
            provision_players: true,
            presence_prune_ms: 5 * 60 * 1000,
        }
    }
}

/// Counters for observability, updated lock-free.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections_accepted: u64,
    pub messages_handled: u64,
    pub faults_returned: u64,
}

#[derive(Debug)]
pub enum ServerError {
    Bind(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind(e) => write!(f, "bind failed: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// The town server. All replies carry the nil UUID as origin so clients can
/// tell server answers from peer traffic.
pub struct TownServer {
    config: ServerConfig,
    tiles: RwLock<HashMap<TileKey, Tile>>,
    players: RwLock<HashMap<String, PresenceRecord>>,
    broker: LocalBroker,
    connections_accepted: AtomicU64,
    messages_handled: AtomicU64,
    faults_returned: AtomicU64,
}

impl TownServer {
    pub fn new(config: ServerConfig) -> Self {
        let broker = LocalBroker::new(config.broadcast_capacity);
        Self {
            config,
            tiles: RwLock::new(HashMap::new()),
            players: RwLock::new(HashMap::new()),
            broker,
            connections_accepted: AtomicU64::new(0),
            messages_handled: AtomicU64::new(0),
            faults_returned: AtomicU64::new(0),
        }
    }

    /// Bind and start accepting connections. Returns the bound address so
    /// callers binding port zero learn the real port.
    pub async fn start(self: Arc<Self>) -> Result<SocketAddr, ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(e.to_string()))?;
        log::info!("town server listening on {addr}");

        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("accept failed: {e}");
                        continue;
                    }
                };
                self.connections_accepted.fetch_add(1, Ordering::Relaxed);
                let server = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = server.handle_connection(stream).await {
                        log::debug!("connection {peer} ended: {e}");
                    }
                });
            }
        });

        Ok(addr)
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let mut fanout_rx = self.broker.subscribe();
        let mut session_id = Uuid::nil();
        let mut authed = self.config.access_key.is_none();

        loop {
            tokio::select! {
                inbound = ws_reader.next() => {
                    let msg = match inbound {
                        Some(Ok(msg)) => msg,
                        Some(Err(_)) | None => break,
                    };
                    let bytes: Vec<u8> = match msg {
                        tokio_tungstenite::tungstenite::Message::Binary(data) => data.into(),
                        tokio_tungstenite::tungstenite::Message::Close(_) => break,
                        _ => continue,
                    };
                    let envelope = match Envelope::decode(&bytes) {
                        Ok(env) => env,
                        Err(e) => {
                            log::warn!("dropping undecodable frame: {e}");
                            continue;
                        }
                    };
                    session_id = envelope.origin;

                    if let Some(reply) = self.handle_envelope(&envelope, &mut authed).await {
                        if let Ok(encoded) = reply.encode() {
                            ws_writer
                                .send(tokio_tungstenite::tungstenite::Message::Binary(encoded.into()))
                                .await?;
                        }
                    }
                }
                fanout = fanout_rx.recv() => {
                    let bytes = match fanout {
                        Ok(bytes) => bytes,
                        // Lagged: skip what was lost, keep the connection
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("session {session_id} lagged, {n} events dropped");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    };
                    ws_writer
                        .send(tokio_tungstenite::tungstenite::Message::Binary(bytes.to_vec().into()))
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Process one request and produce its direct reply. Accepted writes are
    /// also fanned out to every connection, sender included; the sender's own
    /// echo is suppressed client-side by origin.
    async fn handle_envelope(&self, envelope: &Envelope, authed: &mut bool) -> Option<Envelope> {
        self.messages_handled.fetch_add(1, Ordering::Relaxed);
        let seq = envelope.seq;

        if envelope.kind == MessageKind::Hello {
            return Some(self.handle_hello(envelope, authed));
        }
        if !*authed {
            return Some(self.fault(seq, RemoteFault::Unauthorized, "handshake required"));
        }

        match envelope.kind {
            MessageKind::FetchTiles => {
                if !self.config.provision_tiles {
                    return Some(self.missing_table(seq, "tiles"));
                }
                let tiles: Vec<Tile> = self.tiles.read().await.values().cloned().collect();
                Some(Envelope::tile_snapshot(Uuid::nil(), seq, &tiles))
            }
            MessageKind::TileUpsert => {
                if !self.config.provision_tiles {
                    return Some(self.missing_table(seq, "tiles"));
                }
                match envelope.tile() {
                    Ok(tile) => {
                        let mut tiles = self.tiles.write().await;
                        if tile.kind.is_empty() {
                            tiles.remove(&tile.key());
                        } else {
                            tiles.insert(tile.key(), tile);
                        }
                        drop(tiles);
                        self.fan_out(envelope);
                        Some(Envelope::ack(Uuid::nil(), seq))
                    }
                    Err(e) => Some(self.fault(seq, RemoteFault::Internal, e.to_string())),
                }
            }
            MessageKind::TileDelete => {
                if !self.config.provision_tiles {
                    return Some(self.missing_table(seq, "tiles"));
                }
                match envelope.tile_key() {
                    Ok(key) => {
                        self.tiles.write().await.remove(&key);
                        self.fan_out(envelope);
                        Some(Envelope::ack(Uuid::nil(), seq))
                    }
                    Err(e) => Some(self.fault(seq, RemoteFault::Internal, e.to_string())),
                }
            }
            MessageKind::TileClearAll => {
                if !self.config.provision_tiles {
                    return Some(self.missing_table(seq, "tiles"));
                }
                self.tiles.write().await.clear();
                self.fan_out(envelope);
                Some(Envelope::ack(Uuid::nil(), seq))
            }
            MessageKind::PresenceUpdate => {
                if !self.config.provision_players {
                    return Some(self.missing_table(seq, "players"));
                }
                match envelope.presence() {
                    Ok(record) => {
                        self.apply_presence(record).await;
                        self.fan_out(envelope);
                        Some(Envelope::ack(Uuid::nil(), seq))
                    }
                    Err(e) => Some(self.fault(seq, RemoteFault::Internal, e.to_string())),
                }
            }
            MessageKind::Chat => {
                self.fan_out(envelope);
                Some(Envelope::ack(Uuid::nil(), seq))
            }
            other => Some(self.fault(
                seq,
                RemoteFault::Internal,
                format!("unsupported request kind {other:?}"),
            )),
        }
    }

    fn handle_hello(&self, envelope: &Envelope, authed: &mut bool) -> Envelope {
        let seq = envelope.seq;
        let payload = match envelope.hello_payload() {
            Ok(payload) => payload,
            Err(e) => return self.fault(seq, RemoteFault::Internal, e.to_string()),
        };
        match &self.config.access_key {
            Some(expected) if *expected != payload.access_key => {
                self.fault(seq, RemoteFault::Unauthorized, "invalid access key")
            }
            _ => {
                *authed = true;
                log::debug!("session for player {} authenticated", payload.player_id);
                Envelope::ack(Uuid::nil(), seq)
            }
        }
    }

    /// Newest last_active wins; prunes idle rows while the write lock is held.
    async fn apply_presence(&self, record: PresenceRecord) {
        let mut players = self.players.write().await;
        match players.get_mut(&record.player_id) {
            Some(existing) if existing.last_active_ms > record.last_active_ms => {}
            Some(existing) => *existing = record,
            None => {
                players.insert(record.player_id.clone(), record);
            }
        }
        let now = now_ms();
        let bound = self.config.presence_prune_ms;
        players.retain(|_, p| p.is_active(now, bound));
    }

    fn fan_out(&self, envelope: &Envelope) {
        let mut event = envelope.clone();
        event.seq = 0;
        if let Err(e) = self.broker.publish(&event) {
            log::warn!("fan-out encode failed: {e}");
        }
    }

    fn fault(&self, seq: u64, fault: RemoteFault, message: impl Into<String>) -> Envelope {
        self.faults_returned.fetch_add(1, Ordering::Relaxed);
        Envelope::fault(Uuid::nil(), seq, fault, message)
    }

    fn missing_table(&self, seq: u64, table: &str) -> Envelope {
        self.fault(
            seq,
            RemoteFault::NotFound,
            format!("relation \"{table}\" does not exist"),
        )
    }

    pub async fn tile_count(&self) -> usize {
        self.tiles.read().await.len()
    }

    pub async fn player_count(&self) -> usize {
        self.players.read().await.len()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            messages_handled: self.messages_handled.load(Ordering::Relaxed),
            faults_returned: self.faults_returned.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TileKind;

    fn server() -> TownServer {
        TownServer::new(ServerConfig::default())
    }

    #[tokio::test]
    async fn test_upsert_then_fetch() {
        let server = server();
        let mut authed = true;
        let origin = Uuid::new_v4();

        let tile = Tile::new(1, 2, TileKind::House, "alice");
        let reply = server
            .handle_envelope(&Envelope::tile_upsert(origin, &tile).with_seq(1), &mut authed)
            .await
            .unwrap();
        assert_eq!(reply.kind, MessageKind::Ack);
        assert_eq!(reply.seq, 1);
        assert_eq!(reply.origin, Uuid::nil());

        let reply = server
            .handle_envelope(&Envelope::fetch_tiles(origin).with_seq(2), &mut authed)
            .await
            .unwrap();
        assert_eq!(reply.seq, 2);
        assert_eq!(reply.tiles().unwrap(), vec![tile]);
    }

    #[tokio::test]
    async fn test_empty_upsert_deletes_row() {
        let server = server();
        let mut authed = true;
        let origin = Uuid::new_v4();

        let tile = Tile::new(3, 3, TileKind::Grass, "alice");
        server
            .handle_envelope(&Envelope::tile_upsert(origin, &tile).with_seq(1), &mut authed)
            .await;
        assert_eq!(server.tile_count().await, 1);

        server
            .handle_envelope(
                &Envelope::tile_upsert(origin, &Tile::empty(3, 3)).with_seq(2),
                &mut authed,
            )
            .await;
        assert_eq!(server.tile_count().await, 0);
    }

    #[tokio::test]
    async fn test_clear_all_empties_table() {
        let server = server();
        let mut authed = true;
        let origin = Uuid::new_v4();

        for x in 0..4 {
            let tile = Tile::new(x, 0, TileKind::Road, "alice");
            server
                .handle_envelope(&Envelope::tile_upsert(origin, &tile).with_seq(1), &mut authed)
                .await;
        }
        assert_eq!(server.tile_count().await, 4);

        let reply = server
            .handle_envelope(&Envelope::tile_clear_all(origin).with_seq(5), &mut authed)
            .await
            .unwrap();
        assert_eq!(reply.kind, MessageKind::Ack);
        assert_eq!(server.tile_count().await, 0);
    }

    #[tokio::test]
    async fn test_unprovisioned_tiles_answers_not_found() {
        let server = TownServer::new(ServerConfig {
            provision_tiles: false,
            ..ServerConfig::default()
        });
        let mut authed = true;

        let reply = server
            .handle_envelope(&Envelope::fetch_tiles(Uuid::new_v4()).with_seq(1), &mut authed)
            .await
            .unwrap();
        let fault = reply.fault_payload().unwrap();
        assert_eq!(fault.fault, RemoteFault::NotFound);
        assert!(fault.message.contains("tiles"));
    }

    #[tokio::test]
    async fn test_wrong_access_key_rejected() {
        let server = TownServer::new(ServerConfig {
            access_key: Some("secret".into()),
            ..ServerConfig::default()
        });
        let mut authed = false;
        let origin = Uuid::new_v4();

        let hello = crate::protocol::HelloPayload {
            player_id: "p".into(),
            access_key: "wrong".into(),
        };
        let reply = server
            .handle_envelope(&Envelope::hello(origin, &hello).with_seq(1), &mut authed)
            .await
            .unwrap();
        assert_eq!(reply.fault_payload().unwrap().fault, RemoteFault::Unauthorized);
        assert!(!authed);

        // and the connection stays unauthenticated for operations
        let reply = server
            .handle_envelope(&Envelope::fetch_tiles(origin).with_seq(2), &mut authed)
            .await
            .unwrap();
        assert_eq!(reply.fault_payload().unwrap().fault, RemoteFault::Unauthorized);
    }

    #[tokio::test]
    async fn test_correct_access_key_accepted() {
        let server = TownServer::new(ServerConfig {
            access_key: Some("secret".into()),
            ..ServerConfig::default()
        });
        let mut authed = false;

        let hello = crate::protocol::HelloPayload {
            player_id: "p".into(),
            access_key: "secret".into(),
        };
        let reply = server
            .handle_envelope(&Envelope::hello(Uuid::new_v4(), &hello).with_seq(1), &mut authed)
            .await
            .unwrap();
        assert_eq!(reply.kind, MessageKind::Ack);
        assert!(authed);
    }

    #[tokio::test]
    async fn test_presence_newest_timestamp_wins() {
        let server = server();
        let mut authed = true;
        let origin = Uuid::new_v4();
        let now = now_ms();

        let fresh = PresenceRecord::new("bob", 1, 1).with_last_active(now);
        let stale = PresenceRecord::new("bob", 9, 9).with_last_active(now - 5000);
        server
            .handle_envelope(&Envelope::presence_update(origin, &fresh).with_seq(1), &mut authed)
            .await;
        server
            .handle_envelope(&Envelope::presence_update(origin, &stale).with_seq(2), &mut authed)
            .await;

        assert_eq!(server.player_count().await, 1);
        let players = server.players.read().await;
        assert_eq!((players["bob"].x, players["bob"].y), (1, 1));
    }

    #[tokio::test]
    async fn test_accepted_write_fans_out_with_seq_zero() {
        let server = server();
        let mut authed = true;
        let mut rx = server.broker.subscribe();

        let tile = Tile::new(0, 0, TileKind::Water, "alice");
        server
            .handle_envelope(&Envelope::tile_upsert(Uuid::new_v4(), &tile).with_seq(7), &mut authed)
            .await;

        let event = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(event.kind, MessageKind::TileUpsert);
        assert_eq!(event.seq, 0);
        assert_eq!(event.tile().unwrap(), tile);
    }

    #[tokio::test]
    async fn test_stats_count_faults() {
        let server = TownServer::new(ServerConfig {
            provision_players: false,
            ..ServerConfig::default()
        });
        let mut authed = true;

        let record = PresenceRecord::new("p", 0, 0);
        server
            .handle_envelope(
                &Envelope::presence_update(Uuid::new_v4(), &record).with_seq(1),
                &mut authed,
            )
            .await;

        let stats = server.stats();
        assert_eq!(stats.messages_handled, 1);
        assert_eq!(stats.faults_returned, 1);
    }
}
