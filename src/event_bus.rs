//! Event Bus (spec §4.11, component C11).
//!
//! A topic-based publish interface. Consumers (the rules worker, the
//! real-time web-socket publisher) are external collaborators out of scope
//! for this crate (spec §1) — what lives here is the publish side and an
//! in-memory fake, matching design note §9's call for "a global pub/sub
//! client... own it explicitly at process init and thread it as a
//! dependency; provide an in-memory fake for tests."
//!
//! Publish is best-effort: a full channel or a dropped receiver must never
//! fail the mutation that triggered the publish (spec §5, §7).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::entity::EntityType;

/// Every event this crate can publish. Topic strings (`entity.modified.<id>`
/// etc., spec §4.11) are derived from the variant via [`Event::topic`]
/// rather than stored, so there is exactly one place that can drift out of
/// sync with spec.md's topic list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    EntityModified { entity_type: EntityType, entity_id: Uuid, version: i32 },
    VariableCreated { variable_id: Uuid, campaign_id: Uuid, branch_id: Option<Uuid> },
    VariableUpdated { variable_id: Uuid, campaign_id: Uuid, branch_id: Option<Uuid> },
    VariableDeleted { variable_id: Uuid, campaign_id: Uuid, branch_id: Option<Uuid> },
    WorldTimeChanged { campaign_id: Uuid, to: i64, at: DateTime<Utc> },
    BranchMerged { source_branch_id: Uuid, target_branch_id: Uuid, merge_history_id: Uuid },
}

impl Event {
    pub fn topic(&self) -> String {
        match self {
            Event::EntityModified { entity_id, .. } => format!("entity.modified.{entity_id}"),
            Event::VariableCreated { .. } => "variable.created".to_string(),
            Event::VariableUpdated { .. } => "variable.updated".to_string(),
            Event::VariableDeleted { .. } => "variable.deleted".to_string(),
            Event::WorldTimeChanged { .. } => "worldtime.changed".to_string(),
            Event::BranchMerged { .. } => "branch.merged".to_string(),
        }
    }
}

/// Capability interface every mutation path depends on, rather than a
/// concrete publisher, so production code and tests can swap
/// implementations (design note §9).
pub trait EventBus: Send + Sync {
    fn publish(&self, event: Event);
}

/// Production implementation: an in-process broadcast channel. Suspension
/// on publish is a bounded enqueue, never a wait on a subscriber (spec §5);
/// a lagging or absent subscriber only ever loses events, it never blocks
/// the publisher.
pub struct InProcessEventBus {
    sender: broadcast::Sender<Event>,
}

impl InProcessEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        InProcessEventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for InProcessEventBus {
    fn default() -> Self {
        InProcessEventBus::new(1024)
    }
}

impl EventBus for InProcessEventBus {
    fn publish(&self, event: Event) {
        // `send` only errors when there are zero receivers, which is a
        // routine state (no subscriber attached yet) rather than a fault.
        if self.sender.send(event.clone()).is_err() {
            log::trace!("published {} with no active subscribers", event.topic());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_match_spec_format() {
        let id = Uuid::nil();
        let ev = Event::EntityModified { entity_type: EntityType::Settlement, entity_id: id, version: 2 };
        assert_eq!(ev.topic(), format!("entity.modified.{id}"));

        assert_eq!(
            Event::VariableCreated { variable_id: id, campaign_id: id, branch_id: None }.topic(),
            "variable.created"
        );
        assert_eq!(
            Event::WorldTimeChanged { campaign_id: id, to: 5, at: Utc::now() }.topic(),
            "worldtime.changed"
        );
        assert_eq!(
            Event::BranchMerged { source_branch_id: id, target_branch_id: id, merge_history_id: id }.topic(),
            "branch.merged"
        );
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error_the_caller() {
        let bus = InProcessEventBus::default();
        bus.publish(Event::WorldTimeChanged { campaign_id: Uuid::nil(), to: 1, at: Utc::now() });
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = InProcessEventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(Event::WorldTimeChanged { campaign_id: Uuid::nil(), to: 42, at: Utc::now() });

        let received = rx.recv().await.unwrap();
        match received {
            Event::WorldTimeChanged { to, .. } => assert_eq!(to, 42),
            _ => panic!("wrong event"),
        }
    }
}
