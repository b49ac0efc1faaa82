use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::room::{random_letters, Member, Room};

#[derive(Error, Debug, PartialEq)]
pub enum StoreError {
    #[error("room '{0}' not found")]
    RoomNotFound(String),
    #[error("member with ID:{0} already exists")]
    MemberExists(String),
    #[error("unable to generate an unique ID")]
    IdExhausted,
    #[error("no visits recorded on {0}")]
    NoVisits(NaiveDate),
    #[error("room lifetime {0:?} is out of range")]
    TtlOutOfRange(Duration),
}

/// Room metadata and membership records shared by every relay process.
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn room_exists(&self, room_id: &str) -> bool;
    async fn create_room(
        &self,
        title: String,
        video_url: String,
        ttl: Duration,
    ) -> Result<Room, StoreError>;
    async fn get_room(&self, room_id: &str) -> Result<Room, StoreError>;
    async fn update_room(
        &self,
        room_id: &str,
        title: String,
        video_url: String,
    ) -> Result<(), StoreError>;
    async fn add_member(&self, room_id: &str, member: Member) -> Result<(), StoreError>;
    async fn update_member(&self, room_id: &str, member: Member) -> Result<(), StoreError>;
    async fn remove_member(&self, room_id: &str, member_id: &str) -> Result<(), StoreError>;
    async fn incr_visits(&self) -> Result<i64, StoreError>;
    async fn visits_on(&self, date: NaiveDate) -> Result<i64, StoreError>;
}

struct StoredRoom {
    room: Room,
    expires_at: Instant,
}

/// In-process [`RoomStore`] with expiring rooms.
#[derive(Clone, Default)]
pub struct MemoryStore {
    rooms: Arc<RwLock<HashMap<String, StoredRoom>>>,
    visits: Arc<RwLock<HashMap<NaiveDate, i64>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_room<T>(
        &self,
        room_id: &str,
        f: impl FnOnce(&mut Room) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut rooms = self.rooms.write().await;
        match rooms.get_mut(room_id) {
            Some(stored) if stored.expires_at > Instant::now() => f(&mut stored.room),
            Some(_) => {
                rooms.remove(room_id);
                Err(StoreError::RoomNotFound(room_id.to_string()))
            }
            None => Err(StoreError::RoomNotFound(room_id.to_string())),
        }
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn room_exists(&self, room_id: &str) -> bool {
        self.get_room(room_id).await.is_ok()
    }

    async fn create_room(
        &self,
        title: String,
        video_url: String,
        ttl: Duration,
    ) -> Result<Room, StoreError> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .ok_or(StoreError::TtlOutOfRange(ttl))?;
        let mut rooms = self.rooms.write().await;
        rooms.retain(|_, stored| stored.expires_at > now);

        let id = (5..=15)
            .map(random_letters)
            .find(|id| !rooms.contains_key(id))
            .ok_or(StoreError::IdExhausted)?;

        let room = Room {
            id: id.clone(),
            title,
            video_url,
            members: Vec::new(),
        };
        rooms.insert(
            id,
            StoredRoom {
                room: room.clone(),
                expires_at,
            },
        );
        Ok(room)
    }

    async fn get_room(&self, room_id: &str) -> Result<Room, StoreError> {
        self.with_room(room_id, |room| Ok(room.clone())).await
    }

    async fn update_room(
        &self,
        room_id: &str,
        title: String,
        video_url: String,
    ) -> Result<(), StoreError> {
        self.with_room(room_id, |room| {
            room.title = title;
            room.video_url = video_url;
            Ok(())
        })
        .await
    }

    async fn add_member(&self, room_id: &str, member: Member) -> Result<(), StoreError> {
        self.with_room(room_id, |room| {
            if room.members.iter().any(|m| m.id == member.id) {
                return Err(StoreError::MemberExists(member.id));
            }
            room.members.push(member);
            Ok(())
        })
        .await
    }

    async fn update_member(&self, room_id: &str, member: Member) -> Result<(), StoreError> {
        self.with_room(room_id, |room| {
            if let Some(existing) = room.members.iter_mut().find(|m| m.id == member.id) {
                *existing = member;
            }
            Ok(())
        })
        .await
    }

    async fn remove_member(&self, room_id: &str, member_id: &str) -> Result<(), StoreError> {
        self.with_room(room_id, |room| {
            room.members.retain(|m| m.id != member_id);
            Ok(())
        })
        .await
    }

    async fn incr_visits(&self) -> Result<i64, StoreError> {
        let mut visits = self.visits.write().await;
        let count = visits.entry(Local::now().date_naive()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn visits_on(&self, date: NaiveDate) -> Result<i64, StoreError> {
        let visits = self.visits.read().await;
        visits.get(&date).copied().ok_or(StoreError::NoVisits(date))
    }
}
