use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Root tenant (spec §3). Not itself versioned — it is the scope every
/// other entity ultimately resolves to for access checks (spec §4.12).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub world_id: Uuid,
    pub owner_id: Uuid,
    pub current_world_time: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn new(world_id: Uuid, owner_id: Uuid, now: DateTime<Utc>) -> Self {
        Campaign {
            id: Uuid::new_v4(),
            world_id,
            owner_id,
            current_world_time: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            archived_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
