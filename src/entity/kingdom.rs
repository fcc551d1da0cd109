use serde::{Deserialize, Serialize};

use super::{Entity, EntityMeta, EntityType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kingdom {
    pub name: String,
    #[serde(flatten)]
    pub meta: EntityMeta,
}

impl Entity for Kingdom {
    const ENTITY_TYPE: EntityType = EntityType::Kingdom;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
