use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the three states a branch is in (spec §4.5). There is no
/// "un-delete" transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    Root,
    Active,
    Deleted,
}

/// A named alternate timeline within one campaign (spec §3, GLOSSARY).
/// `parent_id = None` marks a root of the branch forest; `diverged_at` is
/// `None` for roots and a world-time instant for every forked branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub diverged_at: Option<i64>,
    pub is_pinned: bool,
    pub color: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Branch {
    pub fn new_root(campaign_id: Uuid, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Branch {
            id: Uuid::new_v4(),
            campaign_id,
            parent_id: None,
            name: name.into(),
            diverged_at: None,
            is_pinned: false,
            color: None,
            tags: Vec::new(),
            created_at: now,
            deleted_at: None,
        }
    }

    pub fn fork(parent: &Branch, name: impl Into<String>, diverged_at: i64, now: DateTime<Utc>) -> Self {
        Branch {
            id: Uuid::new_v4(),
            campaign_id: parent.campaign_id,
            parent_id: Some(parent.id),
            name: name.into(),
            diverged_at: Some(diverged_at),
            is_pinned: false,
            color: None,
            tags: Vec::new(),
            created_at: now,
            deleted_at: None,
        }
    }

    pub fn state(&self) -> BranchState {
        if self.deleted_at.is_some() {
            BranchState::Deleted
        } else if self.parent_id.is_none() {
            BranchState::Root
        } else {
            BranchState::Active
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}
