//! Explicit map of live rooms, passed to everything that needs one.
//!
//! Guarantees at most one live room per project id: a join that lands on a
//! room which retired concurrently evicts it and retries on a fresh room.

use devroom_common::Participant;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::persistence::PersistenceAdapter;
use super::room::{JoinOutcome, LeaveOutcome, SessionRoom};
use super::transport::{Outbound, TopicHub};
use crate::config::RoomsSection;
use crate::errors::SessionError;

pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<SessionRoom>>>,
    hub: Arc<TopicHub>,
    adapter: Arc<PersistenceAdapter>,
    config: RoomsSection,
}

impl RoomRegistry {
    pub fn new(hub: Arc<TopicHub>, adapter: Arc<PersistenceAdapter>, config: RoomsSection) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            hub,
            adapter,
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionRoom>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_or_create(&self, project_id: &str) -> Arc<SessionRoom> {
        let mut rooms = self.lock();
        if let Some(room) = rooms.get(project_id) {
            return room.clone();
        }
        let topic = self.hub.register(project_id);
        let room = Arc::new(SessionRoom::new(
            project_id,
            self.config.clone(),
            topic,
            self.adapter.clone(),
        ));
        rooms.insert(project_id.to_string(), room.clone());
        debug!(project_id, "Room created");
        room
    }

    /// Drop `room` from the map if it is still the registered instance.
    fn evict(&self, project_id: &str, room: &Arc<SessionRoom>) {
        let mut rooms = self.lock();
        if rooms
            .get(project_id)
            .is_some_and(|current| Arc::ptr_eq(current, room))
        {
            rooms.remove(project_id);
            self.hub.remove(project_id, room.topic());
            debug!(project_id, "Room evicted");
        }
    }

    pub async fn join(
        &self,
        project_id: &str,
        participant: Participant,
    ) -> Result<JoinOutcome, SessionError> {
        loop {
            let room = self.get_or_create(project_id);
            match room.join(participant.clone()).await {
                // only a retired room refuses a join
                Err(SessionError::UnknownRoom { .. }) => self.evict(project_id, &room),
                other => return other,
            }
        }
    }

    pub async fn leave(
        &self,
        project_id: &str,
        participant_id: &str,
    ) -> Result<LeaveOutcome, SessionError> {
        let room = self.get(project_id)?;
        let outcome = room.leave(participant_id).await;
        if outcome == LeaveOutcome::Emptied {
            self.evict(project_id, &room);
        }
        Ok(outcome)
    }

    /// The live room for `project_id`.
    pub fn get(&self, project_id: &str) -> Result<Arc<SessionRoom>, SessionError> {
        self.lock()
            .get(project_id)
            .cloned()
            .ok_or_else(|| SessionError::unknown_room(project_id))
    }

    /// Observer subscription to a live room's topic.
    pub fn subscribe(&self, project_id: &str) -> Result<broadcast::Receiver<Outbound>, SessionError> {
        self.hub
            .subscribe(project_id)
            .ok_or_else(|| SessionError::unknown_room(project_id))
    }

    #[cfg(test)]
    fn active_projects(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    fn room_count(&self) -> usize {
        self.lock().len()
    }

    /// Flush every live room and wait for the writes to be attempted.
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<SessionRoom>> = self.lock().values().cloned().collect();
        info!(rooms = rooms.len(), "Flushing live rooms");
        for room in rooms {
            room.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreSection;
    use crate::session::persistence::StoreRoutes;
    use crate::session::resolver::DeliveryResolver;
    use crate::session::store::MemoryStore;
    use devroom_common::{FileTree, Sender};

    fn registry(store: Arc<MemoryStore>) -> RoomRegistry {
        let adapter = Arc::new(PersistenceAdapter::new(
            DeliveryResolver::new(store),
            StoreRoutes::from(&StoreSection::default()),
        ));
        RoomRegistry::new(Arc::new(TopicHub::new(16)), adapter, RoomsSection::default())
    }

    #[tokio::test]
    async fn test_single_room_per_project() {
        let registry = registry(Arc::new(MemoryStore::new()));
        registry.join("p1", Participant::new("u1")).await.unwrap();
        registry.join("p1", Participant::new("u2")).await.unwrap();
        registry.join("p2", Participant::new("u1")).await.unwrap();

        assert_eq!(registry.room_count(), 2);
        assert_eq!(registry.active_projects(), vec!["p1", "p2"]);
        let room = registry.get("p1").unwrap();
        assert_eq!(room.snapshot().await.unwrap().participants.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_joins_share_one_room() {
        let registry = Arc::new(registry(Arc::new(MemoryStore::new())));
        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .join("p1", Participant::new(format!("u{}", i)))
                    .await
                    .map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(registry.room_count(), 1);
        let snap = registry.get("p1").unwrap().snapshot().await.unwrap();
        assert_eq!(snap.participants.len(), 8);
    }

    #[tokio::test]
    async fn test_last_leave_evicts_and_rejoin_creates_fresh_room() {
        let registry = registry(Arc::new(MemoryStore::new()));
        registry.join("p1", Participant::new("u1")).await.unwrap();
        let first = registry.get("p1").unwrap();

        let outcome = registry.leave("p1", "u1").await.unwrap();
        assert_eq!(outcome, LeaveOutcome::Emptied);
        assert_eq!(registry.room_count(), 0);
        assert!(matches!(
            registry.get("p1"),
            Err(SessionError::UnknownRoom { .. })
        ));
        assert!(registry.subscribe("p1").is_err());

        registry.join("p1", Participant::new("u1")).await.unwrap();
        let second = registry.get("p1").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_join_after_concurrent_retire_gets_fresh_room() {
        let registry = registry(Arc::new(MemoryStore::new()));
        registry.join("p1", Participant::new("u1")).await.unwrap();
        let stale = registry.get("p1").unwrap();
        // retire behind the registry's back; the map still holds the room
        stale.leave("u1").await;

        registry.join("p1", Participant::new("u2")).await.unwrap();
        let live = registry.get("p1").unwrap();
        assert!(!Arc::ptr_eq(&stale, &live));
        assert_eq!(live.snapshot().await.unwrap().participants[0].id, "u2");
    }

    #[tokio::test]
    async fn test_leave_unknown_project() {
        let registry = registry(Arc::new(MemoryStore::new()));
        assert!(matches!(
            registry.leave("nope", "u1").await,
            Err(SessionError::UnknownRoom { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_live_rooms() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        registry.join("p1", Participant::new("u1")).await.unwrap();
        let room = registry.get("p1").unwrap();
        room.apply_file_tree_update(FileTree::new().with_file("a.txt", "x"), &Sender::from("u1"))
            .await
            .unwrap();

        registry.shutdown().await;
        assert!(store.stored_tree("p1").is_some());
    }

    #[tokio::test]
    async fn test_observer_subscription_sees_room_events() {
        let registry = registry(Arc::new(MemoryStore::new()));
        registry.join("p1", Participant::new("u1")).await.unwrap();
        let mut observer = registry.subscribe("p1").unwrap();

        registry.join("p1", Participant::new("u2")).await.unwrap();
        let event = observer.recv().await.unwrap();
        assert!(matches!(
            event.event.as_ref(),
            devroom_common::RoomEvent::ParticipantJoined { .. }
        ));
    }
}
