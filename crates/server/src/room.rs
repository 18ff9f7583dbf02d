//! Single-session room state: host, players, spectators, gamepad-slot
//! ownership, and per-peer input permissions. Every mutation is serialized
//! through one mutex (§4.6) — the struct never hands out a lock guard, only
//! results, so callers cannot straddle two locked operations.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use thiserror::Error;
use uuid::Uuid;

use streamcore_protocol::PlayerSummary;

pub const ROOM_CODE: &str = "STREAM";
pub const MAX_PEERS: usize = 16;
pub const PLAYER_SLOTS: [u8; 4] = [1, 2, 3, 4];
pub const HOST_SLOT: u8 = 1;
/// Gamepad slots are a monotonically assigned integer in `[0, 16)`.
pub const GAMEPAD_SLOTS: std::ops::Range<u8> = 0..16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("room is full")]
    RoomFull,
    #[error("no player slots available")]
    NoSlots,
    #[error("peer is not a player")]
    NotAPlayer,
    #[error("peer is not the host")]
    NotHost,
    #[error("a host already exists")]
    HostExists,
    #[error("peer not found")]
    PeerNotFound,
}

#[derive(Debug, Clone)]
pub struct PlayerInfo {
    pub peer_id: Uuid,
    pub name: String,
    pub slot: Option<u8>,
    pub is_host: bool,
    pub is_spectator: bool,
    pub can_use_keyboard: bool,
    pub can_use_mouse: bool,
    pub gamepad_slots: Vec<u8>,
    pub connected_at: Instant,
}

impl PlayerInfo {
    fn to_summary(&self) -> PlayerSummary {
        PlayerSummary {
            peer_id: self.peer_id,
            name: self.name.clone(),
            slot: self.slot,
            is_host: self.is_host,
            is_spectator: self.is_spectator,
            can_use_keyboard: self.can_use_keyboard,
            can_use_mouse: self.can_use_mouse,
            gamepad_count: self.gamepad_slots.len() as u8,
        }
    }
}

struct RoomInner {
    host: Option<Uuid>,
    players: HashMap<Uuid, PlayerInfo>,
    gamepad_slot_owners: HashMap<u8, Uuid>,
    peer_gamepad_map: HashMap<Uuid, HashMap<u8, u8>>,
    max_players: u8,
    default_guest_keyboard: bool,
    default_guest_mouse: bool,
}

impl RoomInner {
    fn check_invariants(&self) {
        debug_assert!(
            self.players
                .values()
                .filter(|p| p.slot.is_some())
                .map(|p| p.slot.unwrap())
                .collect::<std::collections::HashSet<_>>()
                .len()
                == self.players.values().filter(|p| p.slot.is_some()).count(),
            "player slots must be unique"
        );
        for (&slot, &owner) in &self.gamepad_slot_owners {
            debug_assert!(
                self.peer_gamepad_map
                    .get(&owner)
                    .is_some_and(|m| m.values().any(|&s| s == slot)),
                "gamepad_slot_owners/peer_gamepad_map must be mutual inverses"
            );
        }
        if let Some(host_id) = self.host
            && let Some(host) = self.players.get(&host_id)
        {
            debug_assert!(host.is_host && !host.is_spectator && host.slot == Some(HOST_SLOT));
            debug_assert!(host.can_use_keyboard && host.can_use_mouse);
        }
    }
}

/// Single-session room. Cheap to construct; wrap in `Arc` for sharing.
pub struct Room {
    inner: Mutex<RoomInner>,
}

impl Default for Room {
    fn default() -> Self {
        Self::new(PLAYER_SLOTS.len() as u8)
    }
}

impl Room {
    /// `max_players` is clamped to `[1, PLAYER_SLOTS.len()]`.
    pub fn new(max_players: u8) -> Self {
        let max_players = max_players.clamp(1, PLAYER_SLOTS.len() as u8);
        Self {
            inner: Mutex::new(RoomInner {
                host: None,
                players: HashMap::new(),
                gamepad_slot_owners: HashMap::new(),
                peer_gamepad_map: HashMap::new(),
                max_players,
                default_guest_keyboard: false,
                default_guest_mouse: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RoomInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn peer_count(&self) -> usize {
        self.lock().players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peer_count() == 0
    }

    pub fn host_id(&self) -> Option<Uuid> {
        self.lock().host
    }

    pub fn add_host(&self, peer_id: Uuid, name: String) -> Result<(), RoomError> {
        let mut inner = self.lock();
        if inner.host.is_some() {
            return Err(RoomError::HostExists);
        }
        inner.host = Some(peer_id);
        inner.players.insert(
            peer_id,
            PlayerInfo {
                peer_id,
                name,
                slot: Some(HOST_SLOT),
                is_host: true,
                is_spectator: false,
                can_use_keyboard: true,
                can_use_mouse: true,
                gamepad_slots: Vec::new(),
                connected_at: Instant::now(),
            },
        );
        inner.check_invariants();
        Ok(())
    }

    pub fn add_spectator(&self, peer_id: Uuid, name: String) -> Result<(), RoomError> {
        let mut inner = self.lock();
        if inner.players.len() >= MAX_PEERS {
            return Err(RoomError::RoomFull);
        }
        let (keyboard, mouse) = (inner.default_guest_keyboard, inner.default_guest_mouse);
        inner.players.insert(
            peer_id,
            PlayerInfo {
                peer_id,
                name,
                slot: None,
                is_host: false,
                is_spectator: true,
                can_use_keyboard: keyboard,
                can_use_mouse: mouse,
                gamepad_slots: Vec::new(),
                connected_at: Instant::now(),
            },
        );
        inner.check_invariants();
        Ok(())
    }

    pub fn promote_to_player(&self, peer_id: Uuid) -> Result<u8, RoomError> {
        let mut inner = self.lock();
        let used: std::collections::HashSet<u8> =
            inner.players.values().filter_map(|p| p.slot).collect();
        let max_players = inner.max_players;
        let slot = PLAYER_SLOTS
            .into_iter()
            .take(max_players as usize)
            .find(|s| !used.contains(s))
            .ok_or(RoomError::NoSlots)?;
        let (keyboard, mouse) = (inner.default_guest_keyboard, inner.default_guest_mouse);
        let player = inner.players.get_mut(&peer_id).ok_or(RoomError::PeerNotFound)?;
        player.slot = Some(slot);
        player.is_spectator = false;
        player.can_use_keyboard = keyboard;
        player.can_use_mouse = mouse;
        inner.check_invariants();
        Ok(slot)
    }

    /// Removes the peer, releasing any gamepad slots it held. Returns
    /// `true` iff the removed peer was the host.
    pub fn remove_peer(&self, peer_id: Uuid) -> bool {
        let mut inner = self.lock();
        let was_host = inner.host == Some(peer_id);
        if was_host {
            inner.host = None;
        }
        inner.players.remove(&peer_id);
        if let Some(owned) = inner.peer_gamepad_map.remove(&peer_id) {
            for (_, server_slot) in owned {
                inner.gamepad_slot_owners.remove(&server_slot);
            }
        }
        inner.check_invariants();
        was_host
    }

    /// Idempotent on repeats of the same `(peer_id, browser_id)`.
    pub fn claim_gamepad(&self, peer_id: Uuid, browser_id: u8) -> Result<u8, RoomError> {
        let mut inner = self.lock();
        let player = inner.players.get(&peer_id).ok_or(RoomError::PeerNotFound)?;
        if player.is_spectator {
            return Err(RoomError::NotAPlayer);
        }
        if let Some(existing) = inner
            .peer_gamepad_map
            .get(&peer_id)
            .and_then(|m| m.get(&browser_id))
        {
            return Ok(*existing);
        }
        let slot = GAMEPAD_SLOTS
            .find(|s| !inner.gamepad_slot_owners.contains_key(s))
            .ok_or(RoomError::NoSlots)?;
        inner.gamepad_slot_owners.insert(slot, peer_id);
        inner
            .peer_gamepad_map
            .entry(peer_id)
            .or_default()
            .insert(browser_id, slot);
        if let Some(player) = inner.players.get_mut(&peer_id) {
            player.gamepad_slots.push(slot);
        }
        inner.check_invariants();
        Ok(slot)
    }

    /// No-op if the peer does not own `server_slot`.
    pub fn release_gamepad(&self, peer_id: Uuid, server_slot: u8) {
        let mut inner = self.lock();
        if inner.gamepad_slot_owners.get(&server_slot) != Some(&peer_id) {
            return;
        }
        inner.gamepad_slot_owners.remove(&server_slot);
        if let Some(map) = inner.peer_gamepad_map.get_mut(&peer_id) {
            map.retain(|_, &mut s| s != server_slot);
        }
        if let Some(player) = inner.players.get_mut(&peer_id) {
            player.gamepad_slots.retain(|&s| s != server_slot);
        }
        inner.check_invariants();
    }

    /// Host's own flags are immune to change.
    pub fn set_keyboard_access(&self, peer_id: Uuid, enabled: bool) -> Result<(), RoomError> {
        let mut inner = self.lock();
        let player = inner.players.get_mut(&peer_id).ok_or(RoomError::PeerNotFound)?;
        if !player.is_host {
            player.can_use_keyboard = enabled;
        }
        Ok(())
    }

    pub fn set_mouse_access(&self, peer_id: Uuid, enabled: bool) -> Result<(), RoomError> {
        let mut inner = self.lock();
        let player = inner.players.get_mut(&peer_id).ok_or(RoomError::PeerNotFound)?;
        if !player.is_host {
            player.can_use_mouse = enabled;
        }
        Ok(())
    }

    /// Resets to a fresh, empty room. Used after the host leaves and the
    /// room is torn down, so the next `join` can seat a new host at slot 1.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.host = None;
        inner.players.clear();
        inner.gamepad_slot_owners.clear();
        inner.peer_gamepad_map.clear();
        inner.check_invariants();
    }

    pub fn set_default_guest_keyboard(&self, enabled: bool) {
        self.lock().default_guest_keyboard = enabled;
    }

    pub fn set_default_guest_mouse(&self, enabled: bool) {
        self.lock().default_guest_mouse = enabled;
    }

    pub fn can_use_keyboard(&self, peer_id: Uuid) -> bool {
        self.lock()
            .players
            .get(&peer_id)
            .map(|p| p.can_use_keyboard)
            .unwrap_or(false)
    }

    pub fn can_use_mouse(&self, peer_id: Uuid) -> bool {
        self.lock()
            .players
            .get(&peer_id)
            .map(|p| p.can_use_mouse)
            .unwrap_or(false)
    }

    pub fn is_host(&self, peer_id: Uuid) -> bool {
        self.lock().host == Some(peer_id)
    }

    pub fn player_slot(&self, peer_id: Uuid) -> Option<u8> {
        self.lock().players.get(&peer_id)?.slot
    }

    pub fn player_summary(&self, peer_id: Uuid) -> Option<PlayerSummary> {
        self.lock().players.get(&peer_id).map(PlayerInfo::to_summary)
    }

    pub fn players(&self) -> Vec<PlayerSummary> {
        self.lock().players.values().map(PlayerInfo::to_summary).collect()
    }

    /// `(keyboard_enabled, mouse_enabled, is_host, is_spectator, slot)` for
    /// populating `room_created`/`room_joined`.
    pub fn peer_state(&self, peer_id: Uuid) -> Option<(bool, bool, bool, bool, Option<u8>)> {
        let inner = self.lock();
        let p = inner.players.get(&peer_id)?;
        Some((p.can_use_keyboard, p.can_use_mouse, p.is_host, p.is_spectator, p.slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn add_host_then_second_host_fails() {
        let room = Room::new(4);
        room.add_host(uid(1), "A".into()).unwrap();
        assert_eq!(room.add_host(uid(2), "B".into()), Err(RoomError::HostExists));
    }

    #[test]
    fn host_has_slot_one_and_full_permissions() {
        let room = Room::new(4);
        room.add_host(uid(1), "A".into()).unwrap();
        let summary = room.player_summary(uid(1)).unwrap();
        assert_eq!(summary.slot, Some(1));
        assert!(summary.is_host);
        assert!(!summary.is_spectator);
        assert!(summary.can_use_keyboard && summary.can_use_mouse);
    }

    #[test]
    fn spectator_inherits_default_permissions() {
        let room = Room::new(4);
        room.add_host(uid(1), "A".into()).unwrap();
        room.set_default_guest_keyboard(true);
        room.add_spectator(uid(2), "B".into()).unwrap();
        let summary = room.player_summary(uid(2)).unwrap();
        assert!(summary.is_spectator);
        assert!(summary.can_use_keyboard);
        assert!(!summary.can_use_mouse);
    }

    #[test]
    fn promote_picks_lowest_free_slot() {
        let room = Room::new(4);
        room.add_host(uid(1), "A".into()).unwrap();
        room.add_spectator(uid(2), "B".into()).unwrap();
        room.add_spectator(uid(3), "C".into()).unwrap();
        assert_eq!(room.promote_to_player(uid(2)).unwrap(), 2);
        assert_eq!(room.promote_to_player(uid(3)).unwrap(), 3);
    }

    #[test]
    fn promote_fails_when_all_slots_taken() {
        let room = Room::new(4);
        room.add_host(uid(1), "A".into()).unwrap();
        for i in 2..=4 {
            room.add_spectator(uid(i), format!("P{i}")).unwrap();
            room.promote_to_player(uid(i)).unwrap();
        }
        room.add_spectator(uid(5), "E".into()).unwrap();
        assert_eq!(room.promote_to_player(uid(5)), Err(RoomError::NoSlots));
    }

    #[test]
    fn room_full_at_sixteen_peers() {
        let room = Room::new(4);
        room.add_host(uid(0), "host".into()).unwrap();
        for i in 1..15 {
            room.add_spectator(uid(i), format!("P{i}")).unwrap();
        }
        assert_eq!(room.peer_count(), 15);
        room.add_spectator(uid(15), "last".into()).unwrap();
        assert_eq!(room.peer_count(), 16);
        assert_eq!(
            room.add_spectator(uid(16), "overflow".into()),
            Err(RoomError::RoomFull)
        );
    }

    #[test]
    fn claim_gamepad_is_idempotent() {
        let room = Room::new(4);
        room.add_host(uid(1), "A".into()).unwrap();
        let slot_a = room.claim_gamepad(uid(1), 0).unwrap();
        let slot_b = room.claim_gamepad(uid(1), 0).unwrap();
        assert_eq!(slot_a, slot_b);
    }

    #[test]
    fn spectator_cannot_claim_gamepad() {
        let room = Room::new(4);
        room.add_host(uid(1), "A".into()).unwrap();
        room.add_spectator(uid(2), "B".into()).unwrap();
        assert_eq!(room.claim_gamepad(uid(2), 0), Err(RoomError::NotAPlayer));
    }

    #[test]
    fn release_unknown_slot_is_a_no_op() {
        let room = Room::new(4);
        room.add_host(uid(1), "A".into()).unwrap();
        room.release_gamepad(uid(1), 99);
    }

    #[test]
    fn remove_peer_releases_its_gamepads() {
        let room = Room::new(4);
        room.add_host(uid(1), "A".into()).unwrap();
        let slot = room.claim_gamepad(uid(1), 0).unwrap();
        room.remove_peer(uid(1));
        // slot should be free to reclaim by a new peer
        room.add_host(uid(2), "B".into()).unwrap();
        let new_slot = room.claim_gamepad(uid(2), 5);
        assert!(new_slot.is_ok());
        let _ = slot;
    }

    #[test]
    fn remove_peer_reports_whether_it_was_host() {
        let room = Room::new(4);
        room.add_host(uid(1), "A".into()).unwrap();
        room.add_spectator(uid(2), "B".into()).unwrap();
        assert!(!room.remove_peer(uid(2)));
        assert!(room.remove_peer(uid(1)));
    }

    #[test]
    fn host_permissions_are_immune_to_change() {
        let room = Room::new(4);
        room.add_host(uid(1), "A".into()).unwrap();
        room.set_keyboard_access(uid(1), false).unwrap();
        assert!(room.can_use_keyboard(uid(1)));
    }

    #[test]
    fn clear_resets_to_an_empty_room() {
        let room = Room::new(4);
        room.add_host(uid(1), "A".into()).unwrap();
        room.claim_gamepad(uid(1), 0).unwrap();
        room.clear();
        assert_eq!(room.peer_count(), 0);
        assert!(room.host_id().is_none());
        room.add_host(uid(2), "B".into()).unwrap();
        assert_eq!(room.player_slot(uid(2)), Some(HOST_SLOT));
    }

    #[test]
    fn join_leave_join_restores_equivalent_state() {
        let room = Room::new(4);
        room.add_host(uid(1), "A".into()).unwrap();
        let before = room.players();
        room.remove_peer(uid(1));
        room.add_host(uid(2), "A".into()).unwrap();
        let after = room.players();
        assert_eq!(before.len(), after.len());
        assert_eq!(before[0].name, after[0].name);
        assert_eq!(before[0].slot, after[0].slot);
    }
}
