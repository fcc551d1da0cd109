use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Entity, EntityMeta, EntityType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub party_id: Option<Uuid>,
    pub name: String,
    #[serde(flatten)]
    pub meta: EntityMeta,
}

impl Entity for Character {
    const ENTITY_TYPE: EntityType = EntityType::Character;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
