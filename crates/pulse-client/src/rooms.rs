//! Room membership registry.
//!
//! A plain set of room ids the tab wants delivery for. Membership is kept
//! independently of the connection so it survives drops; the connection state
//! replays it on every (re)connect.
//!
//! `leave` is a hard removal: there is no per-subscriber reference count, so
//! one view leaving a room ends delivery for every view that joined it.

use std::collections::HashSet;

#[derive(Debug, Default, Clone)]
pub struct RoomRegistry {
    rooms: HashSet<String>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a room. Returns `true` if it was not already a member.
    pub fn insert(&mut self, room_id: &str) -> bool {
        if self.rooms.contains(room_id) {
            return false;
        }
        self.rooms.insert(room_id.to_string())
    }

    /// Remove a room. Returns `true` if it was a member; unknown rooms are a
    /// no-op.
    pub fn remove(&mut self, room_id: &str) -> bool {
        self.rooms.remove(room_id)
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains(room_id)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.rooms.iter().map(String::as_str)
    }

    /// Current membership, sorted for stable output.
    pub fn snapshot(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.rooms.iter().cloned().collect();
        rooms.sort();
        rooms
    }

    pub fn clear(&mut self) {
        self.rooms.clear();
    }
}
