//! # town-sync — Multiplayer state synchronization for the shared town
//!
//! Client-side sync and conflict-resolution layer for a collaborative
//! tile-placement game: optimistic local writes, last-write-wins merge,
//! presence gossip, and automatic degradation from a remote backend to a
//! same-device broadcast channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ TownSession  │ ◄─────────────────► │ TownServer   │
//! │ (per player) │    Binary Proto     │ (tables +    │
//! └──────┬───────┘                     │  change feed)│
//!        │                             └──────────────┘
//!        │  fallback / same-device
//!        ▼
//! ┌──────────────┐
//! │ LocalBroker  │
//! │ (fan-out)    │
//! └──────┬───────┘
//!        ▼
//! ┌──────────────┐   ┌──────────────┐
//! │ TileGrid     │   │ Presence     │
//! │ (LWW view)   │   │ Tracker      │
//! └──────────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded Envelope)
//! - [`session`] — Per-player orchestration and the public write API
//! - [`remote`] — WebSocket adapter for the remote town store
//! - [`server`] — The town server: durable tables plus fan-out
//! - [`broker`] — In-process broadcast transport for same-device sessions
//! - [`tiles`] — Last-write-wins materialized tile view
//! - [`presence`] — Believed-active peer tracking
//! - [`mode`] — Remote vs local-broadcast operating-mode decision

pub mod broker;
pub mod config;
pub mod mode;
pub mod presence;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod session;
pub mod tiles;

// Re-exports for convenience
pub use broker::{BrokerStats, LocalBroker};
pub use config::{RemoteConfig, SessionConfig, ACCESS_KEY_ENV, ENDPOINT_ENV};
pub use mode::{FailureKind, Mode, ModeController};
pub use presence::{PresenceTracker, ACTIVE_THRESHOLD_MS, STALE_BOUND_MS};
pub use protocol::{
    ChatMessage, Envelope, EnvelopeError, MessageKind, PresenceRecord, RemoteFault, Tile, TileKey,
    TileKind,
};
pub use remote::{RemoteError, RemoteEvent, RemoteStore};
pub use server::{ServerConfig, ServerError, ServerStats, TownServer};
pub use session::TownSession;
pub use tiles::TileGrid;
