use crate::config::Config;
use crate::rooms::{resolve_room, ConnId, RoomTable};
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Record of a live connection held in the shared registry.
///
/// Cloned out as a snapshot for readers; the owning driver mutates it
/// through [`Registry`] methods only.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    /// Outbound queue draining into the connection's socket.
    pub tx: mpsc::Sender<Message>,
    /// Wire-visible identifier: `<userId>_<epochMillis>` once
    /// authenticated, `pending_<epochMillis>` before.
    pub client_id: String,
    /// Stable identity: wallet address, anonymous token, or token-derived.
    pub user_id: Option<String>,
    /// Wallet address; set only for handshake-authenticated connections.
    pub wallet_address: Option<String>,
    /// Whether the connection may join rooms and send application frames.
    pub authenticated: bool,
    /// Current room; a connection is in at most one room.
    pub room_id: Option<String>,
    /// Normalized remote address.
    pub remote_addr: String,
    /// Connection timestamp, epoch milliseconds.
    pub connected_at_ms: u64,
    /// Frames routed from this connection.
    pub message_count: u64,
    /// Timestamp of the most recently routed frame.
    pub last_message_at_ms: Option<u64>,
}

#[derive(Default)]
struct Inner {
    conns: HashMap<ConnId, ClientHandle>,
    rooms: RoomTable,
}

/// Shared connection substrate: connection records and room membership
/// behind one lock, per-IP counters in a concurrent map.
///
/// Join/leave touch both the record and the membership set, so a single
/// lock keeps `conn.roomId` and room membership mutually consistent.
/// Fan-out recipient lists are snapshotted under the lock; sends happen
/// outside it.
pub struct Registry {
    inner: Mutex<Inner>,
    ip_connections: DashMap<IpAddr, usize>,
    next_id: AtomicU64,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ip_connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("registry lock")
    }

    /// Allocate a fresh connection handle.
    pub fn allocate_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().conns.len()
    }

    /// Returns `true` when no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().conns.is_empty()
    }

    /// Number of live (occupied) rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.lock().rooms.room_count()
    }

    /// Member count of a room.
    #[must_use]
    pub fn room_occupancy(&self, room_id: &str) -> usize {
        self.lock().rooms.occupancy(room_id)
    }

    /// Register a freshly upgraded connection.
    pub fn insert(&self, id: ConnId, handle: ClientHandle) {
        self.lock().conns.insert(id, handle);
    }

    /// Snapshot of one connection record.
    #[must_use]
    pub fn get(&self, id: ConnId) -> Option<ClientHandle> {
        self.lock().conns.get(&id).cloned()
    }

    /// Remove a connection and dissolve its room membership. Removing an
    /// already-released record is a no-op.
    pub fn remove(&self, id: ConnId) -> Option<ClientHandle> {
        let mut inner = self.lock();
        let handle = inner.conns.remove(&id);
        if let Some(handle) = &handle {
            if let Some(room_id) = handle.room_id.clone() {
                inner.rooms.remove(&room_id, id);
            }
        }
        handle
    }

    /// Promote a pending connection after a verified handshake.
    pub fn authenticate(&self, id: ConnId, user_id: &str, wallet: Option<&str>, client_id: &str) {
        if let Some(conn) = self.lock().conns.get_mut(&id) {
            conn.authenticated = true;
            conn.user_id = Some(user_id.to_string());
            conn.wallet_address = wallet.map(str::to_string);
            conn.client_id = client_id.to_string();
        }
    }

    /// Record one routed frame for observability.
    pub fn note_message(&self, id: ConnId, now_ms: u64) {
        if let Some(conn) = self.lock().conns.get_mut(&id) {
            conn.message_count += 1;
            conn.last_message_at_ms = Some(now_ms);
        }
    }

    /// Join a room, switching membership when the caller is already
    /// elsewhere. Unknown ids resolve to the default room. Returns the
    /// effective room id, or `None` when the caller is absent or
    /// unauthenticated or no room is configured.
    pub fn join(&self, id: ConnId, requested: &str, config: &Config) -> Option<String> {
        let target = resolve_room(config, requested)?.id.clone();
        let mut inner = self.lock();

        let previous = {
            let conn = inner.conns.get_mut(&id)?;
            if !conn.authenticated {
                return None;
            }
            if conn.room_id.as_deref() == Some(target.as_str()) {
                return Some(target);
            }
            let previous = conn.room_id.take();
            conn.room_id = Some(target.clone());
            previous
        };

        if let Some(previous) = previous {
            inner.rooms.remove(&previous, id);
        }
        inner.rooms.insert(&target, id);
        Some(target)
    }

    /// Leave the current room. Returns the room left, if any.
    pub fn leave(&self, id: ConnId) -> Option<String> {
        let mut inner = self.lock();
        let room_id = inner.conns.get_mut(&id)?.room_id.take()?;
        inner.rooms.remove(&room_id, id);
        Some(room_id)
    }

    /// Snapshot of fan-out recipients excluding the sender: the sender's
    /// room members, or every other authenticated connection when the
    /// sender is roomless.
    #[must_use]
    pub fn broadcast_targets(&self, sender: ConnId) -> Vec<mpsc::Sender<Message>> {
        let inner = self.lock();
        let Some(handle) = inner.conns.get(&sender) else {
            return Vec::new();
        };
        match &handle.room_id {
            Some(room_id) => inner
                .rooms
                .members(room_id)
                .map(|members| {
                    members
                        .iter()
                        .filter(|&&id| id != sender)
                        .filter_map(|id| inner.conns.get(id).map(|c| c.tx.clone()))
                        .collect()
                })
                .unwrap_or_default(),
            None => inner
                .conns
                .iter()
                .filter(|(id, conn)| **id != sender && conn.authenticated)
                .map(|(_, conn)| conn.tx.clone())
                .collect(),
        }
    }

    /// Look up a connection by its wire-visible client id (unicast).
    #[must_use]
    pub fn find_by_client_id(&self, client_id: &str) -> Option<mpsc::Sender<Message>> {
        self.lock()
            .conns
            .values()
            .find(|conn| conn.client_id == client_id)
            .map(|conn| conn.tx.clone())
    }

    /// Every connection's outbound queue, for the shutdown drain.
    #[must_use]
    pub fn all_senders(&self) -> Vec<mpsc::Sender<Message>> {
        self.lock().conns.values().map(|c| c.tx.clone()).collect()
    }

    // ── Per-IP accounting ────────────────────────────────────────────────

    /// Atomic per-IP check-and-increment. Returns `false` without
    /// incrementing when the address already holds `max` connections.
    pub fn try_increment_ip(&self, ip: IpAddr, max: usize) -> bool {
        match self.ip_connections.entry(ip) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if *entry.get() >= max {
                    false
                } else {
                    *entry.get_mut() += 1;
                    true
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                if max == 0 {
                    false
                } else {
                    entry.insert(1);
                    true
                }
            }
        }
    }

    /// Decrement an address's counter, removing the key at zero.
    pub fn decrement_ip(&self, ip: IpAddr) {
        let mut remove = false;
        if let Some(mut entry) = self.ip_connections.get_mut(&ip) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                remove = true;
            }
        }
        if remove {
            self.ip_connections.remove_if(&ip, |_, count| *count == 0);
        }
    }

    /// Current per-IP count (absent key reads as zero).
    #[must_use]
    pub fn ip_count(&self, ip: IpAddr) -> usize {
        self.ip_connections.get(&ip).map_or(0, |entry| *entry)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
