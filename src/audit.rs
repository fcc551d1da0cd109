//! Audit Log (spec §4.2, component C2).
//!
//! Append-only record of every mutation. The one hard rule here: a failure
//! to write an audit entry must never surface to — let alone roll back — the
//! mutation it is recording (spec §4.2, §7). Every public entry point
//! therefore returns `()`, not a `Result`.

use chrono::Utc;
use diesel::prelude::*;
use serde_json::Value;
use strum::{AsRefStr, EnumString};
use uuid::Uuid;

use crate::codec;
use crate::entity::EntityType;
use crate::schema::audit_entries;

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOperation {
    Create,
    Update,
    Delete,
    Archive,
    Restore,
    Fork,
    Merge,
    CherryPick,
}

#[derive(Insertable)]
#[diesel(table_name = audit_entries)]
pub struct NewAuditEntry {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub operation: String,
    pub user_id: Uuid,
    pub changes: Value,
    pub metadata: Option<Value>,
    pub previous_state: Option<Value>,
    pub new_state: Option<Value>,
    pub diff: Option<Value>,
    pub reason: Option<String>,
    pub timestamp: chrono::DateTime<Utc>,
}

/// Parameters for a single audit write. Grouped into a struct because the
/// full parameter list (spec §4.2's `log(...)` signature) is long enough
/// that a positional call site would be unreadable and error-prone to
/// reorder.
#[derive(Default)]
pub struct AuditParams {
    pub changes: Value,
    pub metadata: Option<Value>,
    pub previous_state: Option<Value>,
    pub new_state: Option<Value>,
    pub reason: Option<String>,
}

/// Builds the row to insert. Pure and DB-free so it can be unit tested
/// without a connection; diff is auto-computed whenever both states are
/// present (spec §4.2).
pub fn build_entry(
    entity_type: EntityType,
    entity_id: Uuid,
    operation: AuditOperation,
    user_id: Uuid,
    params: AuditParams,
) -> NewAuditEntry {
    let diff = match (&params.previous_state, &params.new_state) {
        (Some(prev), Some(next)) => Some(
            serde_json::to_value(codec::diff(prev, next)).expect("Diff always serializes"),
        ),
        _ => None,
    };

    NewAuditEntry {
        id: Uuid::new_v4(),
        entity_type: entity_type.as_ref().to_string(),
        entity_id,
        operation: operation.as_ref().to_string(),
        user_id,
        changes: params.changes,
        metadata: params.metadata,
        previous_state: params.previous_state,
        new_state: params.new_state,
        diff,
        reason: params.reason,
        timestamp: Utc::now(),
    }
}

/// Appends an entry. Always resolves: storage failures are logged at
/// `error!` with full context and then swallowed, matching spec §4.2's
/// requirement that audit writes never kill a correct mutation.
pub fn log(
    conn: &mut PgConnection,
    entity_type: EntityType,
    entity_id: Uuid,
    operation: AuditOperation,
    user_id: Uuid,
    params: AuditParams,
) {
    let entry = build_entry(entity_type, entity_id, operation, user_id, params);

    if let Err(err) = diesel::insert_into(audit_entries::table)
        .values(&entry)
        .execute(conn)
    {
        log::error!(
            "failed to write audit entry for {:?} {} op={}: {err}",
            entity_type, entity_id, entry.operation
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_is_computed_when_both_states_present() {
        let entry = build_entry(
            EntityType::Settlement,
            Uuid::new_v4(),
            AuditOperation::Update,
            Uuid::new_v4(),
            AuditParams {
                changes: serde_json::json!({"population": 1500}),
                previous_state: Some(serde_json::json!({"population": 1000})),
                new_state: Some(serde_json::json!({"population": 1500})),
                ..Default::default()
            },
        );

        let diff = entry.diff.expect("diff should be computed");
        assert_eq!(diff["modified"]["population"], serde_json::json!({"old": 1000, "new": 1500}));
    }

    #[test]
    fn diff_is_absent_when_either_state_missing() {
        let entry = build_entry(
            EntityType::Settlement,
            Uuid::new_v4(),
            AuditOperation::Create,
            Uuid::new_v4(),
            AuditParams { changes: serde_json::json!({}), ..Default::default() },
        );
        assert!(entry.diff.is_none());
    }

    #[test]
    fn operation_round_trips_through_as_ref() {
        assert_eq!(AuditOperation::CherryPick.as_ref(), "CHERRY_PICK");
    }
}
