//! Domain entity types (spec §3).
//!
//! Every versionable entity shares the same envelope — id, owning campaign,
//! a free-form `variables` bag, an optimistic `version` counter, and the
//! usual lifecycle timestamps — so it's expressed once here as
//! [`EntityMeta`] and embedded by each concrete type, the way the reference
//! codebase's `entity/common.rs` factors out shared shapes used by every
//! `Entity` impl.

mod campaign;
mod branch;
mod kingdom;
mod settlement;
mod structure;
mod party;
mod character;
mod location;
mod world_event;
mod encounter;
mod state_variable;

pub use campaign::Campaign;
pub use branch::{Branch, BranchState};
pub use kingdom::Kingdom;
pub use settlement::Settlement;
pub use structure::Structure;
pub use party::Party;
pub use character::Character;
pub use location::Location;
pub use world_event::WorldEvent;
pub use encounter::Encounter;
pub use state_variable::{StateVariable, VariableType};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};
use uuid::Uuid;

/// Discriminates which table/codec-schema a `VersionRecord` or audit entry
/// belongs to. Replaces the bare `entityType: string` parameters spec.md
/// threads through every C3/C4 operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Kingdom,
    Settlement,
    Structure,
    Party,
    Character,
    Location,
    WorldEvent,
    Encounter,
    StateVariable,
}

impl EntityType {
    /// LOCATION is world-bound and explicitly excluded from versioning
    /// (spec §3 invariant 7, §4.4 edge case (c)).
    pub fn is_versionable(self) -> bool {
        !matches!(self, EntityType::Location)
    }
}

/// Scope a [`StateVariable`] is attached to (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString)]
pub enum Scope {
    World,
    Campaign,
    Party,
    Kingdom,
    Settlement,
    Structure,
    Character,
    Location,
    Event,
    Encounter,
}

impl Scope {
    /// WORLD-scoped variables have no owning entity and are never versioned
    /// (spec §3 invariant 6).
    pub fn requires_scope_id(self) -> bool {
        !matches!(self, Scope::World)
    }
}

/// Fields shared by every entity that can be versioned and soft-deleted.
/// Each concrete entity embeds this under `#[serde(flatten)]` so the
/// on-disk/payload shape stays flat (spec §3's entities are described as
/// flat records, not nested envelopes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMeta {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub variables: serde_json::Map<String, serde_json::Value>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl EntityMeta {
    pub fn new(campaign_id: Uuid, now: DateTime<Utc>) -> Self {
        EntityMeta {
            id: Uuid::new_v4(),
            campaign_id,
            variables: serde_json::Map::new(),
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            archived_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

/// Implemented by every concrete versionable entity so generic code (the
/// version store, the codec, the audit log) can operate on `dyn`-free
/// generics instead of matching on an `AnyEntity` enum the way the
/// reference codebase's `entity::Entity` trait does for its own domain
/// objects.
pub trait Entity: Serialize + for<'de> Deserialize<'de> + Clone + PartialEq {
    const ENTITY_TYPE: EntityType;

    fn meta(&self) -> &EntityMeta;
    fn meta_mut(&mut self) -> &mut EntityMeta;

    fn id(&self) -> Uuid {
        self.meta().id
    }

    fn campaign_id(&self) -> Uuid {
        self.meta().campaign_id
    }

    fn version(&self) -> i32 {
        self.meta().version
    }
}
