//! Process-wide registry of live rooms and room-code generation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use huddle_protocol::{ROOM_CODE_ALPHABET, ROOM_CODE_LEN};
use rand::Rng;
use tracing::info;
use uuid::Uuid;

use crate::room::{Room, RoomLimits};

/// Bounded retries against code collisions before giving up.
const CODE_RETRIES: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("room code space exhausted after {CODE_RETRIES} attempts")]
    RoomCodeExhausted,
    #[error("unknown room {0}")]
    UnknownRoom(String),
}

/// Default input permissions handed to rooms at creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestDefaults {
    pub keyboard: bool,
    pub mouse: bool,
}

pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    limits: RoomLimits,
    guest_defaults: GuestDefaults,
}

/// Sample one room code uniformly from the alphabet.
fn generate_code(rng: &mut impl Rng) -> String {
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

impl RoomRegistry {
    pub fn new(limits: RoomLimits, guest_defaults: GuestDefaults) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            limits,
            guest_defaults,
        }
    }

    /// Create a room for `host_peer`, retrying code collisions a
    /// bounded number of times.
    pub fn create_room(&self, host_peer: Uuid, host_name: &str) -> Result<Arc<Room>, RegistryError> {
        let mut rng = rand::thread_rng();
        let mut rooms = self.rooms.lock().unwrap();

        for _ in 0..CODE_RETRIES {
            let code = generate_code(&mut rng);
            if rooms.contains_key(&code) {
                continue;
            }
            let room = Arc::new(Room::create(
                code.clone(),
                self.limits,
                self.guest_defaults.keyboard,
                self.guest_defaults.mouse,
                host_peer,
                host_name,
            ));
            rooms.insert(code, Arc::clone(&room));
            return Ok(room);
        }
        Err(RegistryError::RoomCodeExhausted)
    }

    pub fn get(&self, code: &str) -> Option<Arc<Room>> {
        self.rooms.lock().unwrap().get(code).cloned()
    }

    /// Drop a room from the registry. Outstanding `Arc<Room>` handles
    /// stay valid until their holders let go.
    pub fn remove_room(&self, code: &str) -> Option<Arc<Room>> {
        let removed = self.rooms.lock().unwrap().remove(code);
        if removed.is_some() {
            info!(code, "Room closed");
        }
        removed
    }

    /// Find the room a peer is admitted to.
    pub fn room_of_peer(&self, peer_id: Uuid) -> Option<Arc<Room>> {
        let rooms = self.rooms.lock().unwrap();
        rooms.values().find(|r| r.is_admitted(peer_id)).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_use_only_the_safe_alphabet() {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let code = generate_code(&mut rng);
            assert_eq!(code.len(), ROOM_CODE_LEN);
            assert!(
                code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b)),
                "code {code} contains a character outside the alphabet"
            );
            for banned in ['0', 'O', '1', 'I', 'l'] {
                assert!(!code.contains(banned));
            }
        }
    }

    #[test]
    fn code_characters_are_roughly_uniform() {
        // One million codes; each alphabet symbol should land within
        // +/- 2% of the uniform expectation.
        let mut rng = rand::thread_rng();
        let mut counts = [0u64; 32];
        const CODES: u64 = 1_000_000;
        for _ in 0..CODES {
            for b in generate_code(&mut rng).bytes() {
                let idx = ROOM_CODE_ALPHABET.iter().position(|&a| a == b).unwrap();
                counts[idx] += 1;
            }
        }
        let total = CODES * ROOM_CODE_LEN as u64;
        let expected = total as f64 / ROOM_CODE_ALPHABET.len() as f64;
        for (idx, &count) in counts.iter().enumerate() {
            let deviation = (count as f64 - expected).abs() / expected;
            assert!(
                deviation < 0.02,
                "symbol {} off by {:.2}% ({} vs {:.0})",
                ROOM_CODE_ALPHABET[idx] as char,
                deviation * 100.0,
                count,
                expected
            );
        }
    }

    #[test]
    fn create_and_lookup_room() {
        let registry = RoomRegistry::new(RoomLimits::default(), GuestDefaults::default());
        let host = Uuid::new_v4();
        let room = registry.create_room(host, "host").unwrap();
        assert_eq!(registry.room_count(), 1);
        assert!(registry.get(room.code()).is_some());
        assert_eq!(
            registry.room_of_peer(host).unwrap().code(),
            room.code()
        );
        assert!(registry.room_of_peer(Uuid::new_v4()).is_none());
    }

    #[test]
    fn distinct_rooms_get_distinct_codes() {
        let registry = RoomRegistry::new(RoomLimits::default(), GuestDefaults::default());
        let a = registry.create_room(Uuid::new_v4(), "a").unwrap();
        let b = registry.create_room(Uuid::new_v4(), "b").unwrap();
        assert_ne!(a.code(), b.code());
    }

    #[test]
    fn remove_room_drops_lookup() {
        let registry = RoomRegistry::new(RoomLimits::default(), GuestDefaults::default());
        let room = registry.create_room(Uuid::new_v4(), "host").unwrap();
        let code = room.code().to_string();
        assert!(registry.remove_room(&code).is_some());
        assert!(registry.get(&code).is_none());
        assert!(registry.remove_room(&code).is_none());
    }
}
