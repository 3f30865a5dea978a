use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::core::envelope::{RoomId, UserId};
use crate::core::session::Session;

/// An ephemeral group of sessions for message fan-out
#[derive(Debug, Clone)]
pub struct Room {
    /// Identifier allocated by the room directory
    pub id: RoomId,
    /// Sessions currently joined, keyed by user
    pub members: HashMap<UserId, Arc<Session>>,
    /// When the first member joined
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Room {
    /// Creates an empty room
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: HashMap::new(),
            created_at: chrono::Utc::now(),
        }
    }

    /// Adds a session, replacing any other connection of the same user
    pub fn add_member(&mut self, session: Arc<Session>) -> bool {
        match self.members.insert(session.user_id(), session.clone()) {
            Some(previous) => !previous.is_same(&session),
            None => true,
        }
    }

    /// Removes the session if it is the one recorded for its user
    pub fn remove_member(&mut self, session: &Session) -> bool {
        let owned = self
            .members
            .get(&session.user_id())
            .map_or(false, |member| member.is_same(session));
        if owned {
            self.members.remove(&session.user_id());
        }
        owned
    }

    /// True if removing this session would leave the room empty
    pub fn is_last_member(&self, session: &Session) -> bool {
        self.members.len() == 1
            && self
                .members
                .get(&session.user_id())
                .map_or(false, |member| member.is_same(session))
    }

    /// Checks if a user is a member of the room
    pub fn has_member(&self, user_id: UserId) -> bool {
        self.members.contains_key(&user_id)
    }

    /// Returns the number of members in the room
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Summary of a live room
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RoomInfo {
    pub id: RoomId,
    pub member_count: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Manages all live rooms.
///
/// Each room has its own lock, so joins and leaves in unrelated rooms only
/// share the outer map's read guard. Creating a room and removing the member
/// that would empty it both run under the outer write guard, which excludes
/// every per-room holder; the map therefore never holds an empty room.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Mutex<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to a room, creating the room on first join
    pub async fn join(&self, room_id: RoomId, session: &Arc<Session>) -> bool {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&room_id) {
                let mut room = room.lock().await;
                return room.add_member(session.clone());
            }
        }

        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id).or_insert_with(|| {
            log::debug!("Room {} created", room_id);
            Mutex::new(Room::new(room_id))
        });
        room.get_mut().add_member(session.clone())
    }

    /// Remove a session from a room, destroying the room once empty.
    ///
    /// Leaving a room that does not exist, or that the session is not in, is a no-op.
    pub async fn leave(&self, room_id: RoomId, session: &Session) -> bool {
        {
            let rooms = self.rooms.read().await;
            let Some(room) = rooms.get(&room_id) else {
                log::debug!(
                    "User {} left room {} which no longer exists",
                    session.user_id(),
                    room_id
                );
                return false;
            };
            let mut room = room.lock().await;
            if !room.is_last_member(session) {
                return room.remove_member(session);
            }
        }

        // Removing the last member destroys the room
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&room_id) else {
            return false;
        };
        let room = room.get_mut();
        let removed = room.remove_member(session);
        if room.is_empty() {
            let lifetime = chrono::Utc::now() - room.created_at;
            rooms.remove(&room_id);
            log::debug!(
                "Room {} destroyed after {}s",
                room_id,
                lifetime.num_seconds()
            );
        }
        removed
    }

    /// Snapshot of the room's members for iteration without holding the lock
    pub async fn members(&self, room_id: RoomId) -> Vec<Arc<Session>> {
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(&room_id) else {
            return Vec::new();
        };
        let room = room.lock().await;
        room.members.values().cloned().collect()
    }

    /// User ids currently in the room
    pub async fn member_ids(&self, room_id: RoomId) -> Vec<UserId> {
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(&room_id) else {
            return Vec::new();
        };
        let room = room.lock().await;
        room.members.keys().copied().collect()
    }

    pub async fn contains(&self, room_id: RoomId) -> bool {
        self.rooms.read().await.contains_key(&room_id)
    }

    /// Check if a specific session is recorded in the room
    pub async fn is_member(&self, room_id: RoomId, session: &Session) -> bool {
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(&room_id) else {
            return false;
        };
        let room = room.lock().await;
        room.members
            .get(&session.user_id())
            .map_or(false, |member| member.is_same(session))
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Lists all live rooms
    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let rooms = self.rooms.read().await;
        let mut infos = Vec::with_capacity(rooms.len());
        for room in rooms.values() {
            let room = room.lock().await;
            infos.push(RoomInfo {
                id: room.id,
                member_count: room.member_count(),
                created_at: room.created_at,
            });
        }
        infos.sort_by_key(|info| info.id);
        infos
    }
}
