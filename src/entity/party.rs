use serde::{Deserialize, Serialize};

use super::{Entity, EntityMeta, EntityType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    #[serde(flatten)]
    pub meta: EntityMeta,
}

impl Entity for Party {
    const ENTITY_TYPE: EntityType = EntityType::Party;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
