use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Entity, EntityMeta, EntityType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    pub settlement_id: Uuid,
    pub name: String,
    pub structure_type: String,
    #[serde(flatten)]
    pub meta: EntityMeta,
}

impl Entity for Structure {
    const ENTITY_TYPE: EntityType = EntityType::Structure;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
