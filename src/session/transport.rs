//! Per-project publish/subscribe topics.
//!
//! Each live room owns one broadcast topic keyed by project id. Events are
//! either addressed to everyone in the room or to a single participant
//! (degraded-delivery warnings); connections filter on the audience.

use devroom_common::{ProjectId, RoomEvent};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    Participant(String),
}

/// One event on a project topic.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub audience: Audience,
    pub event: Arc<RoomEvent>,
}

impl Outbound {
    pub fn everyone(event: RoomEvent) -> Self {
        Self {
            audience: Audience::Everyone,
            event: Arc::new(event),
        }
    }

    pub fn to_participant(participant_id: impl Into<String>, event: RoomEvent) -> Self {
        Self {
            audience: Audience::Participant(participant_id.into()),
            event: Arc::new(event),
        }
    }

    pub fn visible_to(&self, participant_id: &str) -> bool {
        match &self.audience {
            Audience::Everyone => true,
            Audience::Participant(id) => id == participant_id,
        }
    }
}

/// Publish an event on a topic. Returns silently when nobody is subscribed.
pub fn publish(tx: &broadcast::Sender<Outbound>, outbound: Outbound) {
    let _ = tx.send(outbound);
}

pub struct TopicHub {
    topics: RwLock<HashMap<ProjectId, broadcast::Sender<Outbound>>>,
    capacity: usize,
}

impl TopicHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Create a fresh topic for `project_id`, replacing any stale one.
    pub fn register(&self, project_id: &str) -> broadcast::Sender<Outbound> {
        let (tx, _) = broadcast::channel(self.capacity);
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        topics.insert(project_id.to_string(), tx.clone());
        debug!(project_id, "Topic registered");
        tx
    }

    /// Drop the topic for `project_id` if it is still `owner`'s.
    pub fn remove(&self, project_id: &str, owner: &broadcast::Sender<Outbound>) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        if topics
            .get(project_id)
            .is_some_and(|tx| tx.same_channel(owner))
        {
            topics.remove(project_id);
            debug!(project_id, "Topic removed");
        }
    }

    /// Observer subscription to a live topic.
    pub fn subscribe(&self, project_id: &str) -> Option<broadcast::Receiver<Outbound>> {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics.get(project_id).map(|tx| tx.subscribe())
    }

    #[cfg(test)]
    fn topic_count(&self) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
