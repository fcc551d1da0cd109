use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Entity, EntityMeta, EntityType};

/// A settlement belonging to a kingdom. `population` is promoted out of
/// `variables` into a first-class field because it is the field every
/// worked merge example in spec §8 operates on (S1, S2, S6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub kingdom_id: Uuid,
    pub name: String,
    pub population: i64,
    #[serde(flatten)]
    pub meta: EntityMeta,
}

impl Entity for Settlement {
    const ENTITY_TYPE: EntityType = EntityType::Settlement;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
