//! Binary wire protocol shared by both transports.
//!
//! Every message — whether fanned out through the in-process broker or sent
//! over the WebSocket to the town server — is one bincode-encoded [`Envelope`]:
//!
//! ```text
//! ┌──────────┬───────────┬──────────┬─────────────┬──────────┐
//! │ kind     │ origin    │ seq      │ sent_at_ms  │ payload  │
//! │ 1 byte   │ 16 bytes  │ 8 bytes  │ 8 bytes     │ variable │
//! └──────────┴───────────┴──────────┴─────────────┴──────────┘
//! ```
//!
//! `origin` is the sending session's identifier; receivers drop envelopes
//! whose origin equals their own session id so a delayed echo can never
//! overwrite fresher optimistic state. `seq` correlates request/response
//! pairs on the remote path (zero for fan-out messages).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ───────────────────────────────────────────────────────────────────
// Game data model
// ───────────────────────────────────────────────────────────────────

/// The placeable tile types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileKind {
    /// Logical delete: an `Empty` upsert clears the cell.
    Empty,
    Grass,
    Forest,
    Water,
    House,
    Market,
    Road,
}

impl TileKind {
    pub fn is_empty(self) -> bool {
        matches!(self, TileKind::Empty)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TileKind::Empty => "empty",
            TileKind::Grass => "grass",
            TileKind::Forest => "forest",
            TileKind::Water => "water",
            TileKind::House => "house",
            TileKind::Market => "market",
            TileKind::Road => "road",
        }
    }
}

/// Grid coordinate used as the materialized-view map key.
///
/// A typed pair instead of a formatted string: collision-free for all
/// representable coordinates by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileKey {
    pub x: i32,
    pub y: i32,
}

impl TileKey {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// One cell of the shared town grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tile {
    pub x: i32,
    pub y: i32,
    pub kind: TileKind,
    /// Player identifier of whoever placed the tile; `None` for seeded tiles.
    pub placed_by: Option<String>,
}

impl Tile {
    pub fn new(x: i32, y: i32, kind: TileKind, placed_by: impl Into<String>) -> Self {
        Self {
            x,
            y,
            kind,
            placed_by: Some(placed_by.into()),
        }
    }

    /// An `Empty` tile, i.e. a logical delete for the cell.
    pub fn empty(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            kind: TileKind::Empty,
            placed_by: None,
        }
    }

    pub fn key(&self) -> TileKey {
        TileKey::new(self.x, self.y)
    }

    /// Coordinate-derived stable identifier, as persisted by the backend.
    pub fn id(&self) -> String {
        format!("{}-{}", self.x, self.y)
    }
}

/// A player's cursor position and liveness timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub player_id: String,
    pub x: i32,
    pub y: i32,
    /// Wall-clock millis of the last update. A record without a timestamp is
    /// never considered active.
    pub last_active_ms: Option<u64>,
}

impl PresenceRecord {
    pub fn new(player_id: impl Into<String>, x: i32, y: i32) -> Self {
        Self {
            player_id: player_id.into(),
            x,
            y,
            last_active_ms: Some(now_ms()),
        }
    }

    pub fn with_last_active(mut self, at_ms: u64) -> Self {
        self.last_active_ms = Some(at_ms);
        self
    }

    /// Whether `now - last_active` is strictly below the threshold.
    pub fn is_active(&self, now: u64, threshold_ms: u64) -> bool {
        match self.last_active_ms {
            Some(at) => now.saturating_sub(at) < threshold_ms,
            None => false,
        }
    }
}

/// A chat line, fanned out on the same channels as game state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub player_id: String,
    pub text: String,
    pub sent_at_ms: u64,
}

// ───────────────────────────────────────────────────────────────────
// Envelope
// ───────────────────────────────────────────────────────────────────

/// Message kinds carried by [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Insert-or-overwrite of one tile (an `Empty` kind clears the cell).
    TileUpsert = 1,
    /// Row deletion from the backing store; receivers translate it into an
    /// `Empty` upsert.
    TileDelete = 2,
    /// Wipe the whole grid.
    TileClearAll = 3,
    /// One player's cursor moved.
    PresenceUpdate = 4,
    /// Heartbeat gossip: a peer's full believed-active player set.
    PresenceBatch = 5,
    /// Ask live peers to announce their presence.
    PresenceRequest = 6,
    /// Ask live peers to re-emit their full tile and presence state.
    SyncRequest = 7,
    /// Remote path: read the full tiles table.
    FetchTiles = 8,
    /// Remote path: reply to `FetchTiles`.
    TileSnapshot = 9,
    /// Remote path: handshake carrying the access credential.
    Hello = 10,
    /// Remote path: success reply.
    Ack = 11,
    /// Remote path: failure reply.
    Error = 12,
    /// Chat line.
    Chat = 13,
}

/// Handshake payload for the remote path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub player_id: String,
    pub access_key: String,
}

/// Failure classes the server can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteFault {
    /// The addressed table is not provisioned.
    NotFound,
    /// The access credential was rejected.
    Unauthorized,
    /// Anything else.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultPayload {
    pub fault: RemoteFault,
    pub message: String,
}

/// Top-level transport message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    /// Sending session identifier, compared against the receiver's own id to
    /// suppress self-echoes.
    pub origin: Uuid,
    /// Request/response correlation on the remote path; zero for fan-out.
    pub seq: u64,
    pub sent_at_ms: u64,
    /// Bincode-encoded typed body; varies by `kind`.
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).unwrap_or_default()
}

fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, EnvelopeError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| EnvelopeError::Decode(e.to_string()))?;
    Ok(value)
}

impl Envelope {
    fn new(kind: MessageKind, origin: Uuid, payload: Vec<u8>) -> Self {
        Self {
            kind,
            origin,
            seq: 0,
            sent_at_ms: now_ms(),
            payload,
        }
    }

    /// Set the request correlation sequence (remote path).
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn tile_upsert(origin: Uuid, tile: &Tile) -> Self {
        Self::new(MessageKind::TileUpsert, origin, encode_payload(tile))
    }

    pub fn tile_delete(origin: Uuid, key: TileKey) -> Self {
        Self::new(MessageKind::TileDelete, origin, encode_payload(&key))
    }

    pub fn tile_clear_all(origin: Uuid) -> Self {
        Self::new(MessageKind::TileClearAll, origin, Vec::new())
    }

    pub fn presence_update(origin: Uuid, record: &PresenceRecord) -> Self {
        Self::new(MessageKind::PresenceUpdate, origin, encode_payload(record))
    }

    pub fn presence_batch(origin: Uuid, records: &[PresenceRecord]) -> Self {
        Self::new(MessageKind::PresenceBatch, origin, encode_payload(&records))
    }

    pub fn presence_request(origin: Uuid) -> Self {
        Self::new(MessageKind::PresenceRequest, origin, Vec::new())
    }

    pub fn sync_request(origin: Uuid) -> Self {
        Self::new(MessageKind::SyncRequest, origin, Vec::new())
    }

    pub fn fetch_tiles(origin: Uuid) -> Self {
        Self::new(MessageKind::FetchTiles, origin, Vec::new())
    }

    pub fn tile_snapshot(origin: Uuid, seq: u64, tiles: &[Tile]) -> Self {
        Self::new(MessageKind::TileSnapshot, origin, encode_payload(&tiles)).with_seq(seq)
    }

    pub fn hello(origin: Uuid, payload: &HelloPayload) -> Self {
        Self::new(MessageKind::Hello, origin, encode_payload(payload))
    }

    pub fn ack(origin: Uuid, seq: u64) -> Self {
        Self::new(MessageKind::Ack, origin, Vec::new()).with_seq(seq)
    }

    pub fn fault(origin: Uuid, seq: u64, fault: RemoteFault, message: impl Into<String>) -> Self {
        let payload = FaultPayload {
            fault,
            message: message.into(),
        };
        Self::new(MessageKind::Error, origin, encode_payload(&payload)).with_seq(seq)
    }

    pub fn chat(origin: Uuid, message: &ChatMessage) -> Self {
        Self::new(MessageKind::Chat, origin, encode_payload(message))
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let (env, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| EnvelopeError::Decode(e.to_string()))?;
        Ok(env)
    }

    /// Parse a `TileUpsert` payload.
    pub fn tile(&self) -> Result<Tile, EnvelopeError> {
        self.expect_kind(MessageKind::TileUpsert)?;
        decode_payload(&self.payload)
    }

    /// Parse a `TileDelete` payload.
    pub fn tile_key(&self) -> Result<TileKey, EnvelopeError> {
        self.expect_kind(MessageKind::TileDelete)?;
        decode_payload(&self.payload)
    }

    /// Parse a `PresenceUpdate` payload.
    pub fn presence(&self) -> Result<PresenceRecord, EnvelopeError> {
        self.expect_kind(MessageKind::PresenceUpdate)?;
        decode_payload(&self.payload)
    }

    /// Parse a `PresenceBatch` payload.
    pub fn presences(&self) -> Result<Vec<PresenceRecord>, EnvelopeError> {
        self.expect_kind(MessageKind::PresenceBatch)?;
        decode_payload(&self.payload)
    }

    /// Parse a `TileSnapshot` payload.
    pub fn tiles(&self) -> Result<Vec<Tile>, EnvelopeError> {
        self.expect_kind(MessageKind::TileSnapshot)?;
        decode_payload(&self.payload)
    }

    /// Parse a `Hello` payload.
    pub fn hello_payload(&self) -> Result<HelloPayload, EnvelopeError> {
        self.expect_kind(MessageKind::Hello)?;
        decode_payload(&self.payload)
    }

    /// Parse an `Error` payload.
    pub fn fault_payload(&self) -> Result<FaultPayload, EnvelopeError> {
        self.expect_kind(MessageKind::Error)?;
        decode_payload(&self.payload)
    }

    /// Parse a `Chat` payload.
    pub fn chat_message(&self) -> Result<ChatMessage, EnvelopeError> {
        self.expect_kind(MessageKind::Chat)?;
        decode_payload(&self.payload)
    }

    fn expect_kind(&self, kind: MessageKind) -> Result<(), EnvelopeError> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(EnvelopeError::WrongKind)
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum EnvelopeError {
    Encode(String),
    Decode(String),
    WrongKind,
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::WrongKind => write!(f, "payload accessor used on wrong message kind"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

// ===================================================================
// Tests
// ===================================================================
