//! Room state: player slots, host election, per-guest input permissions,
//! and gamepad-slot brokerage.
//!
//! All mutation goes through a single per-room lock. Holders never do
//! IO, so the lock stays cheap even with input callbacks arriving on
//! transport threads.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

/// Hard ceiling on player slots; configuration may lower it.
pub const MAX_PLAYERS: u8 = 4;

/// Server-side gamepad slots available to the virtual-input backend.
pub const GAMEPAD_SLOTS: u8 = 16;

/// Browser gamepad indices a single peer may claim.
pub const MAX_GAMEPADS_PER_PEER: usize = 4;

const MAX_NAME_LEN: usize = 32;

/// One admitted peer, player or spectator.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// Player slot 1..=4, `None` for spectators.
    pub slot: Option<u8>,
    pub is_host: bool,
    pub is_spectator: bool,
    /// Browser-local gamepad ids this peer has claimed.
    pub gamepad_ids: Vec<u8>,
    pub can_use_keyboard: bool,
    pub can_use_mouse: bool,
    /// Unix epoch seconds.
    pub connected_at: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("room is full")]
    RoomFull,
    #[error("no free player slot")]
    NoSlot,
    #[error("unknown peer {0}")]
    UnknownPeer(Uuid),
    #[error("peer {0} is already admitted")]
    AlreadyAdmitted(Uuid),
    #[error("operation requires the host")]
    NotHost,
    #[error("the host must hold a player slot")]
    HostMustBePlayer,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GamepadClaimError {
    #[error("spectators cannot claim gamepads")]
    Spectator,
    #[error("unknown peer {0}")]
    UnknownPeer(Uuid),
    #[error("all gamepad slots are taken")]
    SlotsExhausted,
    #[error("peer already holds the maximum number of gamepads")]
    TooManyGamepads,
}

/// Result of `remove_peer`. `should_close` is advisory: callers decide
/// whether to close the room or promote a successor host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub removed: bool,
    pub should_close: bool,
}

/// Admission limits, taken from configuration at room creation.
#[derive(Debug, Clone, Copy)]
pub struct RoomLimits {
    pub max_players: u8,
    pub max_spectators: usize,
}

impl Default for RoomLimits {
    fn default() -> Self {
        Self {
            max_players: MAX_PLAYERS,
            max_spectators: 8,
        }
    }
}

/// Serializable view of the room for the host process UI.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub code: String,
    pub created_at: u64,
    pub host_peer_id: Option<Uuid>,
    pub players: Vec<PlayerInfo>,
}

pub struct Room {
    code: String,
    created_at: u64,
    limits: RoomLimits,
    state: Mutex<RoomState>,
}

struct RoomState {
    /// Admission-ordered entries, spectators included.
    players: Vec<PlayerInfo>,
    host_peer_id: Option<Uuid>,
    /// Input defaults applied to future guests only.
    default_keyboard: bool,
    default_mouse: bool,
    /// server_slot -> owning peer.
    gamepad_slot_owners: HashMap<u8, Uuid>,
    /// peer -> browser gamepad id -> server_slot.
    peer_gamepad_mappings: HashMap<Uuid, HashMap<u8, u8>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Trim, strip control characters, and cap the display name.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_NAME_LEN)
        .collect();
    if cleaned.is_empty() {
        "player".to_string()
    } else {
        cleaned
    }
}

impl Room {
    /// Create a room with `host_peer` occupying slot 1.
    pub fn create(
        code: String,
        limits: RoomLimits,
        default_keyboard: bool,
        default_mouse: bool,
        host_peer: Uuid,
        host_name: &str,
    ) -> Self {
        let host = PlayerInfo {
            peer_id: host_peer,
            name: sanitize_name(host_name),
            slot: Some(1),
            is_host: true,
            is_spectator: false,
            gamepad_ids: Vec::new(),
            can_use_keyboard: true,
            can_use_mouse: true,
            connected_at: now_secs(),
        };
        info!(code, %host_peer, "Room created");
        Self {
            code,
            created_at: now_secs(),
            limits,
            state: Mutex::new(RoomState {
                players: vec![host],
                host_peer_id: Some(host_peer),
                default_keyboard,
                default_mouse,
                gamepad_slot_owners: HashMap::new(),
                peer_gamepad_mappings: HashMap::new(),
            }),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Admit a peer as a spectator. New entries inherit the room's
    /// current guest defaults.
    pub fn add_spectator(&self, peer_id: Uuid, name: &str) -> Result<(), RoomError> {
        let mut state = self.state.lock().unwrap();
        if state.players.iter().any(|p| p.peer_id == peer_id) {
            return Err(RoomError::AlreadyAdmitted(peer_id));
        }
        let spectators = state.players.iter().filter(|p| p.is_spectator).count();
        if spectators >= self.limits.max_spectators {
            return Err(RoomError::RoomFull);
        }
        let entry = PlayerInfo {
            peer_id,
            name: sanitize_name(name),
            slot: None,
            is_host: false,
            is_spectator: true,
            gamepad_ids: Vec::new(),
            can_use_keyboard: state.default_keyboard,
            can_use_mouse: state.default_mouse,
            connected_at: now_secs(),
        };
        state.players.push(entry);
        debug!(code = self.code, %peer_id, "Spectator admitted");
        Ok(())
    }

    /// Move a spectator into the lowest-numbered free player slot.
    /// Idempotent for peers that already hold a slot.
    pub fn promote_to_player(&self, peer_id: Uuid) -> Result<u8, RoomError> {
        let mut state = self.state.lock().unwrap();

        if let Some(p) = state.players.iter().find(|p| p.peer_id == peer_id)
            && let Some(slot) = p.slot
        {
            return Ok(slot);
        }

        let slot = (1..=self.limits.max_players)
            .find(|s| !state.players.iter().any(|p| p.slot == Some(*s)))
            .ok_or(RoomError::NoSlot)?;

        let player = state
            .players
            .iter_mut()
            .find(|p| p.peer_id == peer_id)
            .ok_or(RoomError::UnknownPeer(peer_id))?;
        player.slot = Some(slot);
        player.is_spectator = false;
        info!(code = self.code, %peer_id, slot, "Spectator promoted to player");
        Ok(slot)
    }

    /// Remove a peer, releasing all of its gamepad claims. When the
    /// host leaves (or the room empties) the caller is told the room
    /// should close unless it promotes a successor.
    pub fn remove_peer(&self, peer_id: Uuid) -> RemoveOutcome {
        let mut state = self.state.lock().unwrap();
        let Some(idx) = state.players.iter().position(|p| p.peer_id == peer_id) else {
            return RemoveOutcome {
                removed: false,
                should_close: false,
            };
        };

        Self::release_all_gamepads(&mut state, peer_id);
        let was_host = state.players.remove(idx).is_host;
        if was_host {
            state.host_peer_id = None;
        }

        let should_close = was_host || state.players.is_empty();
        info!(code = self.code, %peer_id, was_host, should_close, "Peer removed from room");
        RemoveOutcome {
            removed: true,
            should_close,
        }
    }

    /// Atomically transfer host status to `peer_id`.
    pub fn promote_to_host(&self, peer_id: Uuid) -> Result<(), RoomError> {
        let mut state = self.state.lock().unwrap();
        let candidate = state
            .players
            .iter()
            .find(|p| p.peer_id == peer_id)
            .ok_or(RoomError::UnknownPeer(peer_id))?;
        if candidate.is_spectator {
            return Err(RoomError::HostMustBePlayer);
        }
        for p in &mut state.players {
            p.is_host = p.peer_id == peer_id;
        }
        state.host_peer_id = Some(peer_id);
        info!(code = self.code, %peer_id, "Host promoted");
        Ok(())
    }

    pub fn host_peer_id(&self) -> Option<Uuid> {
        self.state.lock().unwrap().host_peer_id
    }

    /// Grant or revoke keyboard access. Only the host may call this.
    pub fn set_keyboard_access(
        &self,
        acting_peer: Uuid,
        target_peer: Uuid,
        allow: bool,
    ) -> Result<(), RoomError> {
        self.set_access(acting_peer, target_peer, allow, |p, v| {
            p.can_use_keyboard = v;
        })
    }

    /// Grant or revoke mouse access. Only the host may call this.
    pub fn set_mouse_access(
        &self,
        acting_peer: Uuid,
        target_peer: Uuid,
        allow: bool,
    ) -> Result<(), RoomError> {
        self.set_access(acting_peer, target_peer, allow, |p, v| {
            p.can_use_mouse = v;
        })
    }

    fn set_access(
        &self,
        acting_peer: Uuid,
        target_peer: Uuid,
        allow: bool,
        apply: impl Fn(&mut PlayerInfo, bool),
    ) -> Result<(), RoomError> {
        let mut state = self.state.lock().unwrap();
        if state.host_peer_id != Some(acting_peer) {
            return Err(RoomError::NotHost);
        }
        let target = state
            .players
            .iter_mut()
            .find(|p| p.peer_id == target_peer)
            .ok_or(RoomError::UnknownPeer(target_peer))?;
        apply(target, allow);
        Ok(())
    }

    /// Change the input defaults inherited by future guests. Existing
    /// guests keep their current flags.
    pub fn set_guest_defaults(
        &self,
        acting_peer: Uuid,
        keyboard: bool,
        mouse: bool,
    ) -> Result<(), RoomError> {
        let mut state = self.state.lock().unwrap();
        if state.host_peer_id != Some(acting_peer) {
            return Err(RoomError::NotHost);
        }
        state.default_keyboard = keyboard;
        state.default_mouse = mouse;
        Ok(())
    }

    /// Map a browser-local gamepad id to a stable server slot.
    /// Idempotent: re-claiming an existing mapping returns it.
    pub fn claim_gamepad(&self, peer_id: Uuid, browser_id: u8) -> Result<u8, GamepadClaimError> {
        let mut state = self.state.lock().unwrap();

        let player = state
            .players
            .iter()
            .find(|p| p.peer_id == peer_id)
            .ok_or(GamepadClaimError::UnknownPeer(peer_id))?;
        if player.is_spectator {
            return Err(GamepadClaimError::Spectator);
        }

        if let Some(mapping) = state.peer_gamepad_mappings.get(&peer_id)
            && let Some(&slot) = mapping.get(&browser_id)
        {
            return Ok(slot);
        }

        if player.gamepad_ids.len() >= MAX_GAMEPADS_PER_PEER {
            return Err(GamepadClaimError::TooManyGamepads);
        }

        let slot = (0..GAMEPAD_SLOTS)
            .find(|s| !state.gamepad_slot_owners.contains_key(s))
            .ok_or(GamepadClaimError::SlotsExhausted)?;

        state.gamepad_slot_owners.insert(slot, peer_id);
        state
            .peer_gamepad_mappings
            .entry(peer_id)
            .or_default()
            .insert(browser_id, slot);
        if let Some(p) = state.players.iter_mut().find(|p| p.peer_id == peer_id) {
            p.gamepad_ids.push(browser_id);
        }
        info!(code = self.code, %peer_id, browser_id, slot, "Gamepad claimed");
        Ok(slot)
    }

    /// Release a server slot. Releasing a slot not owned by `peer_id`
    /// is a no-op, as is releasing a free slot.
    pub fn release_gamepad(&self, peer_id: Uuid, server_slot: u8) {
        let mut state = self.state.lock().unwrap();
        if state.gamepad_slot_owners.get(&server_slot) != Some(&peer_id) {
            return;
        }
        state.gamepad_slot_owners.remove(&server_slot);
        let browser_id = state.peer_gamepad_mappings.get_mut(&peer_id).and_then(|m| {
            let id = m
                .iter()
                .find(|&(_, &slot)| slot == server_slot)
                .map(|(&id, _)| id);
            if let Some(id) = id {
                m.remove(&id);
            }
            id
        });
        if let (Some(browser_id), Some(p)) = (
            browser_id,
            state.players.iter_mut().find(|p| p.peer_id == peer_id),
        ) {
            p.gamepad_ids.retain(|&g| g != browser_id);
        }
        debug!(code = self.code, %peer_id, server_slot, "Gamepad released");
    }

    /// Release everything a peer holds. Used on disconnect.
    pub fn release_peer_gamepads(&self, peer_id: Uuid) {
        let mut state = self.state.lock().unwrap();
        Self::release_all_gamepads(&mut state, peer_id);
    }

    fn release_all_gamepads(state: &mut RoomState, peer_id: Uuid) {
        state.gamepad_slot_owners.retain(|_, owner| *owner != peer_id);
        state.peer_gamepad_mappings.remove(&peer_id);
        if let Some(p) = state.players.iter_mut().find(|p| p.peer_id == peer_id) {
            p.gamepad_ids.clear();
        }
    }

    /// Look up an existing browser-id -> server-slot mapping.
    pub fn translate_gamepad(&self, peer_id: Uuid, browser_id: u8) -> Option<u8> {
        let state = self.state.lock().unwrap();
        state
            .peer_gamepad_mappings
            .get(&peer_id)?
            .get(&browser_id)
            .copied()
    }

    /// Reverse lookup for the rumble return path: which peer and
    /// browser gamepad does a server slot belong to?
    pub fn rumble_target(&self, server_slot: u8) -> Option<(Uuid, u8)> {
        let state = self.state.lock().unwrap();
        let peer_id = *state.gamepad_slot_owners.get(&server_slot)?;
        let browser_id = state
            .peer_gamepad_mappings
            .get(&peer_id)?
            .iter()
            .find(|&(_, &slot)| slot == server_slot)
            .map(|(&id, _)| id)?;
        Some((peer_id, browser_id))
    }

    pub fn player(&self, peer_id: Uuid) -> Option<PlayerInfo> {
        let state = self.state.lock().unwrap();
        state
            .players
            .iter()
            .find(|p| p.peer_id == peer_id)
            .cloned()
    }

    pub fn is_admitted(&self, peer_id: Uuid) -> bool {
        self.state
            .lock()
            .unwrap()
            .players
            .iter()
            .any(|p| p.peer_id == peer_id)
    }

    pub fn peer_ids(&self) -> Vec<Uuid> {
        self.state
            .lock()
            .unwrap()
            .players
            .iter()
            .map(|p| p.peer_id)
            .collect()
    }

    pub fn player_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .players
            .iter()
            .filter(|p| !p.is_spectator)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().players.is_empty()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let state = self.state.lock().unwrap();
        RoomSnapshot {
            code: self.code.clone(),
            created_at: self.created_at,
            host_peer_id: state.host_peer_id,
            players: state.players.clone(),
        }
    }
}
