use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Locations resolve to a *world*, not a campaign, and cannot be versioned
/// (spec §3 invariant 7, §4.4 edge case (c)). It deliberately does not
/// embed [`super::EntityMeta`] since that struct is campaign-scoped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: Uuid,
    pub world_id: Uuid,
    pub name: String,
    pub variables: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Location {
    pub fn new(world_id: Uuid, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Location {
            id: Uuid::new_v4(),
            world_id,
            name: name.into(),
            variables: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            archived_at: None,
        }
    }
}
