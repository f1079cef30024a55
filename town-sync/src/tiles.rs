//! Materialized view of the shared town grid.
//!
//! `TileGrid` is the single authoritative mapping from coordinate to tile on
//! this peer, reconciling three event sources: local optimistic placement,
//! the remote change feed, and local-broadcast messages. Conflict resolution
//! is last-write-wins per coordinate; an `Empty` tile removes the cell from
//! the view entirely rather than leaving a tombstone.
//!
//! Every mutation happens under one write-lock acquisition and never spans an
//! await point, so readers observe either the state before an operation or
//! after it — in particular, a clear-all is atomic and a snapshot never sees
//! a half-cleared grid.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::protocol::{Tile, TileKey};

/// The materialized tile map. Cheap to share behind an `Arc`; the grid is
/// its own single writer, everyone else reads snapshots.
pub struct TileGrid {
    tiles: RwLock<HashMap<TileKey, Tile>>,
}

impl TileGrid {
    pub fn new() -> Self {
        Self {
            tiles: RwLock::new(HashMap::new()),
        }
    }

    /// Optimistic local placement. Applied before the durable write and never
    /// rolled back — the UI never "takes back" a placement.
    pub fn apply_local(&self, tile: Tile) {
        log::debug!("local placement at {}: {}", tile.key(), tile.kind.as_str());
        self.apply(tile);
    }

    /// Apply a change originating from the remote feed or a broadcast peer.
    /// Last write wins; `Empty` clears the cell.
    pub fn apply_remote(&self, tile: Tile) {
        log::trace!("remote tile at {}: {}", tile.key(), tile.kind.as_str());
        self.apply(tile);
    }

    fn apply(&self, tile: Tile) {
        let key = tile.key();
        let mut tiles = self.tiles.write().unwrap();
        if tile.kind.is_empty() {
            tiles.remove(&key);
        } else {
            tiles.insert(key, tile);
        }
    }

    /// Empty the whole view in one step. Writes applied after this call
    /// survive it; the clear never wins retroactively.
    pub fn clear_all(&self) {
        let mut tiles = self.tiles.write().unwrap();
        let dropped = tiles.len();
        tiles.clear();
        log::info!("cleared {dropped} tiles");
    }

    /// Point-in-time consistent copy of the view for rendering and scoring.
    pub fn snapshot(&self) -> HashMap<TileKey, Tile> {
        self.tiles.read().unwrap().clone()
    }

    pub fn get(&self, key: TileKey) -> Option<Tile> {
        self.tiles.read().unwrap().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.tiles.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.read().unwrap().is_empty()
    }
}

impl Default for TileGrid {
    fn default() -> Self {
        Self::new()
    }
}
