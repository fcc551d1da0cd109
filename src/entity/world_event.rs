use serde::{Deserialize, Serialize};

use super::{Entity, EntityMeta, EntityType};

/// A campaign-scoped narrative/world event entity (spec §3's `Event`,
/// renamed to avoid colliding with [`crate::event_bus`]'s publish events).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldEvent {
    pub name: String,
    #[serde(flatten)]
    pub meta: EntityMeta,
}

impl Entity for WorldEvent {
    const ENTITY_TYPE: EntityType = EntityType::WorldEvent;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
