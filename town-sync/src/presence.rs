//! Believed-active peer set and the local player's published position.
//!
//! The tracker owns the player-id → presence mapping. The local player
//! writes directly (optimistically); remote peers' records arrive only via
//! inbound sync events. Liveness is a pure threshold filter over the last
//! activity timestamp — garbage collection merely bounds memory and is not
//! needed for correctness.
//!
//! During a mode transition the remote feed and the local broadcast can both
//! deliver an update for the same peer; merging keeps the newest timestamp
//! and ignores stale positions, so the duplicate is harmless.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::protocol::{now_ms, PresenceRecord};

/// Activity threshold used for gossip and peer pruning. The original UI also
/// used a looser 60 s window for its "online" counter; this crate
/// standardizes on the 20 s bound and lets callers pass their own.
pub const ACTIVE_THRESHOLD_MS: u64 = 20_000;

/// Entries idle longer than this are dropped from the map entirely.
pub const STALE_BOUND_MS: u64 = 5 * 60 * 1000;

pub struct PresenceTracker {
    players: RwLock<HashMap<String, PresenceRecord>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            players: RwLock::new(HashMap::new()),
        }
    }

    /// Optimistic write of the local player's own cursor; applied before any
    /// transport write and regardless of its outcome.
    pub fn record_local(&self, player_id: &str, x: i32, y: i32) {
        let mut players = self.players.write().unwrap();
        players.insert(player_id.to_string(), PresenceRecord::new(player_id, x, y));
    }

    /// Upsert a peer record from an inbound sync event.
    ///
    /// The newest `last_active` wins; an update older than what we already
    /// hold refreshes nothing (it is a delayed duplicate).
    pub fn apply_peer(&self, record: PresenceRecord) {
        let mut players = self.players.write().unwrap();
        match players.get_mut(&record.player_id) {
            Some(existing) => {
                if record.last_active_ms >= existing.last_active_ms {
                    *existing = record;
                }
            }
            None => {
                players.insert(record.player_id.clone(), record);
            }
        }
    }

    /// Pure filter: peers whose `now - last_active` is strictly below the
    /// threshold. Records without a timestamp are never active.
    pub fn active_players(&self, threshold_ms: u64) -> Vec<PresenceRecord> {
        let now = now_ms();
        self.players
            .read()
            .unwrap()
            .values()
            .filter(|p| p.is_active(now, threshold_ms))
            .cloned()
            .collect()
    }

    pub fn active_count(&self, threshold_ms: u64) -> usize {
        let now = now_ms();
        self.players
            .read()
            .unwrap()
            .values()
            .filter(|p| p.is_active(now, threshold_ms))
            .count()
    }

    /// Best-effort GC: drop entries idle longer than `bound_ms`. Returns how
    /// many were removed.
    pub fn sweep_stale(&self, bound_ms: u64) -> usize {
        let now = now_ms();
        let mut players = self.players.write().unwrap();
        let before = players.len();
        players.retain(|_, p| p.is_active(now, bound_ms));
        let removed = before - players.len();
        if removed > 0 {
            log::debug!("swept {removed} stale presence records");
        }
        removed
    }

    /// All tracked records, active or not.
    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        self.players.read().unwrap().values().cloned().collect()
    }

    pub fn get(&self, player_id: &str) -> Option<PresenceRecord> {
        self.players.read().unwrap().get(player_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.players.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.read().unwrap().is_empty()
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_local_creates_active_entry() {
        let tracker = PresenceTracker::new();
        tracker.record_local("alice", 3, 4);

        let rec = tracker.get("alice").unwrap();
        assert_eq!((rec.x, rec.y), (3, 4));
        assert_eq!(tracker.active_count(ACTIVE_THRESHOLD_MS), 1);
    }

    #[test]
    fn test_record_local_refreshes() {
        let tracker = PresenceTracker::new();
        tracker.record_local("alice", 0, 0);
        tracker.record_local("alice", 9, 9);

        assert_eq!(tracker.len(), 1);
        let rec = tracker.get("alice").unwrap();
        assert_eq!((rec.x, rec.y), (9, 9));
    }

    #[test]
    fn test_apply_peer_inserts_unknown() {
        let tracker = PresenceTracker::new();
        tracker.apply_peer(PresenceRecord::new("bob", 1, 1));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_apply_peer_newest_timestamp_wins() {
        let tracker = PresenceTracker::new();
        let now = now_ms();

        tracker.apply_peer(PresenceRecord::new("bob", 1, 1).with_last_active(now));
        // A delayed duplicate from the other transport path, older timestamp
        tracker.apply_peer(PresenceRecord::new("bob", 8, 8).with_last_active(now - 5000));

        let rec = tracker.get("bob").unwrap();
        assert_eq!((rec.x, rec.y), (1, 1));
        assert_eq!(rec.last_active_ms, Some(now));
    }

    #[test]
    fn test_apply_peer_newer_update_replaces() {
        let tracker = PresenceTracker::new();
        let now = now_ms();

        tracker.apply_peer(PresenceRecord::new("bob", 1, 1).with_last_active(now - 5000));
        tracker.apply_peer(PresenceRecord::new("bob", 8, 8).with_last_active(now));

        let rec = tracker.get("bob").unwrap();
        assert_eq!((rec.x, rec.y), (8, 8));
    }

    #[test]
    fn test_threshold_strictly_governs_inclusion() {
        let tracker = PresenceTracker::new();
        let now = now_ms();
        tracker.apply_peer(PresenceRecord::new("bob", 0, 0).with_last_active(now - 21_000));

        assert_eq!(tracker.active_count(20_000), 0);
        assert_eq!(tracker.active_count(30_000), 1);
    }

    #[test]
    fn test_missing_timestamp_is_inactive() {
        let tracker = PresenceTracker::new();
        let mut rec = PresenceRecord::new("ghost", 0, 0);
        rec.last_active_ms = None;
        tracker.apply_peer(rec);

        assert_eq!(tracker.active_count(u64::MAX), 0);
        // but still tracked until swept
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_active_players_has_no_side_effects() {
        let tracker = PresenceTracker::new();
        let now = now_ms();
        tracker.apply_peer(PresenceRecord::new("old", 0, 0).with_last_active(now - 100_000));
        tracker.record_local("alice", 1, 1);

        assert_eq!(tracker.active_players(ACTIVE_THRESHOLD_MS).len(), 1);
        // the stale record is filtered, not removed
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_sweep_drops_only_stale() {
        let tracker = PresenceTracker::new();
        let now = now_ms();
        tracker.apply_peer(PresenceRecord::new("old", 0, 0).with_last_active(now - STALE_BOUND_MS - 1000));
        tracker.record_local("alice", 1, 1);

        assert_eq!(tracker.sweep_stale(STALE_BOUND_MS), 1);
        assert!(tracker.get("old").is_none());
        assert!(tracker.get("alice").is_some());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let tracker = PresenceTracker::new();
        tracker.record_local("alice", 1, 1);
        let snap = tracker.snapshot();
        tracker.sweep_stale(0);
        assert_eq!(snap.len(), 1);
    }
}
