use crate::config::{Config, RoomConfig};
use std::collections::{HashMap, HashSet};

/// Opaque per-connection handle used as the registry key.
pub type ConnId = u64;

/// A live room: the membership set for one configured room id.
///
/// Room configuration (routing mode, allowed types) stays in the config
/// snapshot and is looked up by id; only occupancy lives here.
#[derive(Debug, Default)]
pub struct Room {
    /// Connections currently joined.
    pub members: HashSet<ConnId>,
}

/// roomId → membership table. A room exists only while occupied: it is
/// created on first join and dropped when its last member leaves.
#[derive(Debug, Default)]
pub struct RoomTable {
    rooms: HashMap<String, Room>,
}

impl RoomTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member, creating the room on demand.
    pub fn insert(&mut self, room_id: &str, conn: ConnId) {
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .members
            .insert(conn);
    }

    /// Remove a member; drops the room record when it empties. Removing
    /// from an absent room is a no-op.
    pub fn remove(&mut self, room_id: &str, conn: ConnId) {
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.members.remove(&conn);
            if room.members.is_empty() {
                self.rooms.remove(room_id);
            }
        }
    }

    /// Membership set of a live room.
    #[must_use]
    pub fn members(&self, room_id: &str) -> Option<&HashSet<ConnId>> {
        self.rooms.get(room_id).map(|room| &room.members)
    }

    /// Member count of a room (0 when the room is not live).
    #[must_use]
    pub fn occupancy(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |room| room.members.len())
    }

    /// Number of live rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

/// Resolve a join target: the configured room whose id matches exactly,
/// else the first configured room (the default fallback). `None` only
/// when no rooms are configured at all.
#[must_use]
pub fn resolve_room<'a>(config: &'a Config, requested: &str) -> Option<&'a RoomConfig> {
    config
        .rooms
        .iter()
        .find(|room| room.id == requested)
        .or_else(|| config.rooms.first())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingMode;

    fn config_with_rooms(ids: &[&str]) -> Config {
        let mut config = Config::default();
        config.rooms = ids
            .iter()
            .map(|id| RoomConfig {
                id: (*id).to_string(),
                routing_mode: RoutingMode::Broadcast,
                allowed_message_types: None,
                max_members: None,
            })
            .collect();
        config
    }

    #[test]
    fn insert_creates_room_on_demand() {
        let mut table = RoomTable::new();
        assert_eq!(table.room_count(), 0);
        table.insert("lobby", 1);
        table.insert("lobby", 2);
        assert_eq!(table.room_count(), 1);
        assert_eq!(table.occupancy("lobby"), 2);
    }

    #[test]
    fn last_leave_dissolves_room() {
        let mut table = RoomTable::new();
        table.insert("lobby", 1);
        table.insert("lobby", 2);
        table.remove("lobby", 1);
        assert_eq!(table.occupancy("lobby"), 1);
        table.remove("lobby", 2);
        assert_eq!(table.room_count(), 0);
        assert!(table.members("lobby").is_none());
    }

    #[test]
    fn remove_from_absent_room_is_noop() {
        let mut table = RoomTable::new();
        table.remove("ghost", 7);
        assert_eq!(table.room_count(), 0);
    }

    #[test]
    fn resolve_prefers_exact_match() {
        let config = config_with_rooms(&["lobby", "ops"]);
        assert_eq!(resolve_room(&config, "ops").unwrap().id, "ops");
    }

    #[test]
    fn resolve_falls_back_to_first_room() {
        let config = config_with_rooms(&["lobby", "ops"]);
        assert_eq!(resolve_room(&config, "nonexistent").unwrap().id, "lobby");
        assert_eq!(resolve_room(&config, "").unwrap().id, "lobby");
    }

    #[test]
    fn resolve_without_rooms_is_none() {
        let config = config_with_rooms(&[]);
        assert!(resolve_room(&config, "anything").is_none());
    }
}
