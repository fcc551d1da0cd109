//! Branch Manager (spec §4.5, component C5).
//!
//! Forking, ancestry resolution, and the merge/cherry-pick orchestration
//! that drives [`super::merge`]'s pure three-way diff against real branch
//! history. A "branch" here is the `Branch` row plus everything
//! [`crate::version_store`] has recorded against its id.

use chrono::Utc;
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use crate::entity::{Branch, EntityType};
use crate::error::{ServiceError, ServiceResult};
use crate::schema::{branches, merge_history};
use crate::version_store;
use crate::{audit, codec};

use super::merge::{self, ConflictResolution, EntityMergeOutcome, MergeConflict};

/// Every entity type the merge algorithm walks. `Location` and
/// `StateVariable` are deliberately absent — the former isn't versioned,
/// the latter is merged by [`crate::variables`] since its formulas need
/// cycle revalidation that plain entity merge doesn't.
const MERGEABLE_TYPES: &[EntityType] = &[
    EntityType::Kingdom,
    EntityType::Settlement,
    EntityType::Structure,
    EntityType::Party,
    EntityType::Character,
    EntityType::WorldEvent,
    EntityType::Encounter,
];

pub fn fork(conn: &mut PgConnection, parent_id: Uuid, name: &str, diverged_at: i64, forked_by: Uuid) -> ServiceResult<Branch> {
    let parent = load_branch(conn, parent_id)?;
    let child = Branch::fork(&parent, name, diverged_at, Utc::now());

    diesel::insert_into(branches::table)
        .values((
            branches::id.eq(child.id),
            branches::campaign_id.eq(child.campaign_id),
            branches::parent_id.eq(child.parent_id),
            branches::name.eq(&child.name),
            branches::diverged_at.eq(child.diverged_at),
            branches::is_pinned.eq(child.is_pinned),
            branches::created_at.eq(child.created_at),
        ))
        .execute(conn)?;

    audit::log(
        conn,
        EntityType::Kingdom, // branches aren't a versionable entity type; recorded against no specific row
        child.id,
        audit::AuditOperation::Fork,
        forked_by,
        audit::AuditParams {
            changes: serde_json::json!({"parentBranchId": parent_id, "divergedAt": diverged_at, "name": name}),
            ..Default::default()
        },
    );

    Ok(child)
}

fn load_branch(conn: &mut PgConnection, branch_id: Uuid) -> ServiceResult<Branch> {
    use crate::schema::branches::dsl;

    #[derive(Queryable)]
    struct Row {
        id: Uuid,
        campaign_id: Uuid,
        parent_id: Option<Uuid>,
        name: String,
        diverged_at: Option<i64>,
        is_pinned: bool,
        color: Option<String>,
        tags: Vec<String>,
        created_at: chrono::DateTime<Utc>,
        deleted_at: Option<chrono::DateTime<Utc>>,
    }

    let row: Row = dsl::branches
        .filter(dsl::id.eq(branch_id))
        .select((
            dsl::id, dsl::campaign_id, dsl::parent_id, dsl::name, dsl::diverged_at,
            dsl::is_pinned, dsl::color, dsl::tags, dsl::created_at, dsl::deleted_at,
        ))
        .first(conn)
        .optional()?
        .ok_or(ServiceError::NotFound)?;

    Ok(Branch {
        id: row.id,
        campaign_id: row.campaign_id,
        parent_id: row.parent_id,
        name: row.name,
        diverged_at: row.diverged_at,
        is_pinned: row.is_pinned,
        color: row.color,
        tags: row.tags,
        created_at: row.created_at,
        deleted_at: row.deleted_at,
    })
}

/// Walks a branch's ancestry from itself to its root, inclusive, in
/// near-to-far order.
fn ancestry_chain(conn: &mut PgConnection, branch_id: Uuid) -> ServiceResult<Vec<Branch>> {
    let mut chain = Vec::new();
    let mut current = load_branch(conn, branch_id)?;
    loop {
        let parent_id = current.parent_id;
        chain.push(current);
        match parent_id {
            Some(id) => current = load_branch(conn, id)?,
            None => break,
        }
    }
    Ok(chain)
}

/// Finds the nearest common ancestor branch of `a` and `b`, and the
/// world-time boundary before which their histories are known to agree
/// (the earlier of the two fork points off that ancestor).
///
/// Returns `NoCommonAncestor` if the two branches belong to different
/// campaigns (branches never share ancestry across campaigns).
pub fn find_common_ancestor(conn: &mut PgConnection, a: Uuid, b: Uuid) -> ServiceResult<(Uuid, i64)> {
    let chain_a = ancestry_chain(conn, a)?;
    let chain_b = ancestry_chain(conn, b)?;

    let ids_b: std::collections::HashSet<Uuid> = chain_b.iter().map(|br| br.id).collect();
    let Some(ancestor_pos) = chain_a.iter().position(|br| ids_b.contains(&br.id)) else {
        return Err(ServiceError::BadRequest(crate::error::BadRequestKind::NoCommonAncestor { branch_a: a, target: b }));
    };
    let ancestor = &chain_a[ancestor_pos];

    // The branch just before the ancestor in each chain is where that
    // lineage actually left the ancestor; `diverged_at` on it is the fork
    // point. If the chain *is* the ancestor (position 0 with no
    // predecessor needed), that side shares the ancestor's entire history.
    let div_a = chain_a[..ancestor_pos].last().and_then(|br| br.diverged_at);
    let b_pos = chain_b.iter().position(|br| br.id == ancestor.id).unwrap();
    let div_b = chain_b[..b_pos].last().and_then(|br| br.diverged_at);

    let base_time = match (div_a, div_b) {
        (Some(x), Some(y)) => x.min(y),
        (Some(x), None) => x,
        (None, Some(y)) => y,
        (None, None) => i64::MAX,
    };

    Ok((ancestor.id, base_time))
}

/// Entity ids touched directly on `branch_id` after `since_world_time`,
/// across every mergeable entity type.
fn changed_entities(
    conn: &mut PgConnection,
    branch_id: Uuid,
    since_world_time: i64,
) -> ServiceResult<Vec<(EntityType, Uuid)>> {
    let mut out = Vec::new();
    for &entity_type in MERGEABLE_TYPES {
        let versions = version_store::versions_for_branch_and_type(conn, entity_type, branch_id)?;
        let mut ids: Vec<Uuid> = versions
            .into_iter()
            .filter(|v| v.valid_from > since_world_time)
            .map(|v| v.entity_id)
            .collect();
        ids.sort();
        ids.dedup();
        out.extend(ids.into_iter().map(|id| (entity_type, id)));
    }
    Ok(out)
}

fn snapshot(conn: &mut PgConnection, entity_type: EntityType, id: Uuid, branch_id: Uuid) -> ServiceResult<Option<Value>> {
    match version_store::latest_version(conn, entity_type, id, branch_id)? {
        Some(record) => Ok(Some(codec::decode(&record.payload_gz)?)),
        None => Ok(None),
    }
}

fn base_snapshot(
    conn: &mut PgConnection,
    entity_type: EntityType,
    id: Uuid,
    ancestor_branch: Uuid,
    base_time: i64,
) -> ServiceResult<Option<Value>> {
    match version_store::resolve_version(conn, entity_type, id, ancestor_branch, base_time)? {
        Some(record) => Ok(Some(codec::decode(&record.payload_gz)?)),
        None => Ok(None),
    }
}

/// Result of diffing every changed entity three ways, without writing
/// anything (spec §4.5 `previewMerge`).
#[derive(Debug, Default)]
pub struct MergePreview {
    pub entities_affected: usize,
    pub conflicts: Vec<MergeConflict>,
    pub clean_changes: Vec<(EntityType, Uuid, Vec<(String, Value)>)>,
}

pub fn preview_merge(conn: &mut PgConnection, source_branch: Uuid, target_branch: Uuid) -> ServiceResult<MergePreview> {
    let (ancestor, base_time) = find_common_ancestor(conn, source_branch, target_branch)?;
    let changed = changed_entities(conn, source_branch, base_time)?;

    let mut preview = MergePreview { entities_affected: changed.len(), ..Default::default() };

    for (entity_type, id) in changed {
        let outcome = diff_one_entity(conn, entity_type, id, ancestor, base_time, source_branch, target_branch, &[])?;
        if outcome.is_clean() {
            if !outcome.changes.is_empty() {
                preview.clean_changes.push((entity_type, id, outcome.changes));
            }
        } else {
            preview.conflicts.extend(outcome.unresolved);
        }
    }

    Ok(preview)
}

#[allow(clippy::too_many_arguments)]
fn diff_one_entity(
    conn: &mut PgConnection,
    entity_type: EntityType,
    id: Uuid,
    ancestor_branch: Uuid,
    base_time: i64,
    source_branch: Uuid,
    target_branch: Uuid,
    resolutions: &[ConflictResolution],
) -> ServiceResult<EntityMergeOutcome> {
    let base = base_snapshot(conn, entity_type, id, ancestor_branch, base_time)?;
    let source = snapshot(conn, entity_type, id, source_branch)?;
    let target = snapshot(conn, entity_type, id, target_branch)?;

    match (base, source, target) {
        (base, Some(source), Some(target)) => {
            Ok(merge::three_way_merge(entity_type, id, base.as_ref(), &source, &target, resolutions))
        }
        (None, Some(source), None) => {
            // Created on the source branch after divergence; nothing to
            // conflict with, just carry the whole snapshot across.
            let mut outcome = EntityMergeOutcome::default();
            if let Value::Object(map) = &source {
                for (k, v) in map {
                    outcome.changes.push((k.clone(), v.clone()));
                }
            }
            Ok(outcome)
        }
        _ => Ok(EntityMergeOutcome::default()),
    }
}

/// Applies a previewed merge. Any conflict not covered by `resolutions` is
/// rejected — the caller must either resolve it or accept the target's
/// current value.
pub fn execute_merge(
    conn: &mut PgConnection,
    source_branch: Uuid,
    target_branch: Uuid,
    resolutions: Vec<ConflictResolution>,
    merged_by: Uuid,
    world_time: i64,
) -> ServiceResult<Uuid> {
    let (ancestor, base_time) = find_common_ancestor(conn, source_branch, target_branch)?;
    let changed = changed_entities(conn, source_branch, base_time)?;

    conn.transaction(|conn| {
        let mut conflicts_count = 0;
        let mut entities_merged = 0;
        let mut all_resolutions = Vec::new();

        for (entity_type, id) in &changed {
            let outcome = diff_one_entity(conn, *entity_type, *id, ancestor, base_time, source_branch, target_branch, &resolutions)?;
            conflicts_count += outcome.unresolved.len();

            if !outcome.unresolved.is_empty() {
                return Err(ServiceError::bad_request(format!(
                    "{} unresolved conflict(s) on {:?} {id}",
                    outcome.unresolved.len(), entity_type
                )));
            }

            if outcome.changes.is_empty() {
                continue;
            }

            let current = snapshot(conn, *entity_type, *id, target_branch)?.unwrap_or_else(|| serde_json::json!({}));
            let merged = merge::apply_changes(&current, &outcome.changes);
            version_store::create_version(conn, *entity_type, *id, target_branch, world_time, &merged, merged_by)?;
            entities_merged += 1;
        }

        for r in &resolutions {
            all_resolutions.push(serde_json::json!({
                "entityType": r.entity_type.as_ref(),
                "entityId": r.entity_id,
                "path": r.path,
                "value": r.value,
            }));
        }

        let merge_id = Uuid::new_v4();
        diesel::insert_into(merge_history::table)
            .values((
                merge_history::id.eq(merge_id),
                merge_history::source_branch_id.eq(source_branch),
                merge_history::target_branch_id.eq(target_branch),
                merge_history::common_ancestor_id.eq(ancestor),
                merge_history::world_time.eq(world_time),
                merge_history::merged_by.eq(merged_by),
                merge_history::merged_at.eq(Utc::now()),
                merge_history::conflicts_count.eq(conflicts_count as i32),
                merge_history::entities_merged.eq(entities_merged as i32),
                merge_history::resolutions_data.eq(Value::Array(all_resolutions)),
            ))
            .execute(conn)?;

        audit::log(
            conn,
            EntityType::Kingdom, // merges aren't scoped to one entity type; recorded against no specific row
            merge_id,
            audit::AuditOperation::Merge,
            merged_by,
            audit::AuditParams {
                changes: serde_json::json!({"sourceBranch": source_branch, "targetBranch": target_branch}),
                ..Default::default()
            },
        );

        Ok(merge_id)
    })
}

/// The outcome of a [`cherry_pick`] attempt (spec §4.5 `cherryPick`).
#[derive(Debug, Clone)]
pub struct CherryPickOutcome {
    pub success: bool,
    pub has_conflict: bool,
    pub version_id: Option<Uuid>,
    pub conflicts: Option<Vec<MergeConflict>>,
}

/// Cherry-picks one entity's state from `source_branch` onto
/// `target_branch` as a three-way merge (spec §4.5 `cherryPick`), not a
/// blind overwrite: the base is the target's own version as of the source
/// version's `validFrom`, so anything the target branch changed
/// independently since that instant still conflicts instead of being
/// silently clobbered. Writes nothing when conflicts remain unresolved
/// after `resolutions` is applied.
pub fn cherry_pick(
    conn: &mut PgConnection,
    entity_type: EntityType,
    entity_id: Uuid,
    source_branch: Uuid,
    target_branch: Uuid,
    world_time: i64,
    resolutions: Vec<ConflictResolution>,
    picked_by: Uuid,
) -> ServiceResult<CherryPickOutcome> {
    let source_record =
        version_store::latest_version(conn, entity_type, entity_id, source_branch)?.ok_or(ServiceError::NotFound)?;
    let source_value: Value = source_record.decode()?;

    let target_value = snapshot(conn, entity_type, entity_id, target_branch)?;

    let outcome = match &target_value {
        Some(target_value) => {
            let base = version_store::resolve_version(conn, entity_type, entity_id, target_branch, source_record.valid_from)?
                .map(|record| record.decode::<Value>())
                .transpose()?;

            merge::three_way_merge(entity_type, entity_id, base.as_ref(), &source_value, target_value, &resolutions)
        }
        None => {
            // Never seen on the target branch: nothing to conflict with,
            // every field the source carries is an addition.
            let mut outcome = EntityMergeOutcome::default();
            if let Value::Object(map) = &source_value {
                for (k, v) in map {
                    outcome.changes.push((k.clone(), v.clone()));
                }
            }
            outcome
        }
    };

    if !outcome.is_clean() {
        return Ok(CherryPickOutcome { success: false, has_conflict: true, version_id: None, conflicts: Some(outcome.unresolved) });
    }

    conn.transaction(|conn| {
        let base_for_apply = target_value.unwrap_or_else(|| Value::Object(Default::default()));
        let merged = merge::apply_changes(&base_for_apply, &outcome.changes);
        let record = version_store::create_version(conn, entity_type, entity_id, target_branch, world_time, &merged, picked_by)?;

        audit::log(
            conn,
            entity_type,
            entity_id,
            audit::AuditOperation::CherryPick,
            picked_by,
            audit::AuditParams {
                new_state: Some(merged),
                changes: serde_json::json!({"sourceBranch": source_branch, "targetBranch": target_branch}),
                ..Default::default()
            },
        );

        Ok(CherryPickOutcome { success: true, has_conflict: false, version_id: Some(record.id), conflicts: None })
    })
}

#[derive(Queryable, Debug)]
pub struct MergeHistoryEntry {
    pub id: Uuid,
    pub source_branch_id: Uuid,
    pub target_branch_id: Uuid,
    pub common_ancestor_id: Uuid,
    pub world_time: i64,
    pub merged_by: Uuid,
    pub merged_at: chrono::DateTime<Utc>,
    pub conflicts_count: i32,
    pub entities_merged: i32,
    pub resolutions_data: Value,
    pub metadata: Option<Value>,
}

pub fn get_merge_history(conn: &mut PgConnection, campaign_branch_id: Uuid) -> ServiceResult<Vec<MergeHistoryEntry>> {
    use crate::schema::merge_history::dsl;

    dsl::merge_history
        .filter(dsl::target_branch_id.eq(campaign_branch_id).or(dsl::source_branch_id.eq(campaign_branch_id)))
        .order(dsl::merged_at.desc())
        .load(conn)
        .map_err(ServiceError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_connection;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Settlement {
        name: String,
        population: i64,
    }

    fn setup_branches(conn: &mut PgConnection) -> (Uuid, Uuid) {
        use crate::schema::{branches, campaigns};

        let campaign_id = Uuid::new_v4();
        diesel::insert_into(campaigns::table)
            .values((
                campaigns::id.eq(campaign_id),
                campaigns::world_id.eq(Uuid::new_v4()),
                campaigns::owner_id.eq(Uuid::new_v4()),
            ))
            .execute(conn)
            .unwrap();

        let main_id = Uuid::new_v4();
        diesel::insert_into(branches::table)
            .values((branches::id.eq(main_id), branches::campaign_id.eq(campaign_id), branches::name.eq("main")))
            .execute(conn)
            .unwrap();

        let feature_id = Uuid::new_v4();
        diesel::insert_into(branches::table)
            .values((
                branches::id.eq(feature_id),
                branches::campaign_id.eq(campaign_id),
                branches::parent_id.eq(main_id),
                branches::name.eq("feature"),
                branches::diverged_at.eq(Some(0)),
            ))
            .execute(conn)
            .unwrap();

        (main_id, feature_id)
    }

    #[test]
    #[ignore = "requires TEST_DATABASE_URL"]
    fn cherry_pick_with_no_resolutions_reports_the_conflict_and_writes_nothing() {
        let mut conn = test_connection();
        conn.begin_test_transaction().unwrap();
        let (main_id, feature_id) = setup_branches(&mut conn);
        let entity_id = Uuid::new_v4();
        let user = Uuid::new_v4();

        let base = Settlement { name: "Ford".to_string(), population: 1000 };
        version_store::create_version(&mut conn, EntityType::Settlement, entity_id, main_id, 0, &base, user).unwrap();

        // Source branch moves the population one way...
        let on_source = Settlement { name: "Ford".to_string(), population: 1500 };
        version_store::create_version(&mut conn, EntityType::Settlement, entity_id, feature_id, 10, &on_source, user).unwrap();

        // ...while main moves it another way after the same base, so cherry
        // picking the source value onto main conflicts.
        let on_target = Settlement { name: "Ford".to_string(), population: 900 };
        version_store::create_version(&mut conn, EntityType::Settlement, entity_id, main_id, 20, &on_target, user).unwrap();

        let outcome =
            cherry_pick(&mut conn, EntityType::Settlement, entity_id, feature_id, main_id, 30, vec![], user).unwrap();

        assert!(!outcome.success);
        assert!(outcome.has_conflict);
        assert!(outcome.version_id.is_none());
        let conflicts = outcome.conflicts.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].path, "population");
    }

    #[test]
    #[ignore = "requires TEST_DATABASE_URL"]
    fn cherry_pick_with_a_resolution_writes_the_resolved_value() {
        let mut conn = test_connection();
        conn.begin_test_transaction().unwrap();
        let (main_id, feature_id) = setup_branches(&mut conn);
        let entity_id = Uuid::new_v4();
        let user = Uuid::new_v4();

        let base = Settlement { name: "Ford".to_string(), population: 1000 };
        version_store::create_version(&mut conn, EntityType::Settlement, entity_id, main_id, 0, &base, user).unwrap();

        let on_source = Settlement { name: "Ford".to_string(), population: 1500 };
        version_store::create_version(&mut conn, EntityType::Settlement, entity_id, feature_id, 10, &on_source, user).unwrap();

        let on_target = Settlement { name: "Ford".to_string(), population: 900 };
        version_store::create_version(&mut conn, EntityType::Settlement, entity_id, main_id, 20, &on_target, user).unwrap();

        let resolutions = vec![ConflictResolution {
            entity_type: EntityType::Settlement,
            entity_id,
            path: "population".to_string(),
            value: serde_json::json!(1300),
        }];

        let outcome =
            cherry_pick(&mut conn, EntityType::Settlement, entity_id, feature_id, main_id, 30, resolutions, user).unwrap();

        assert!(outcome.success);
        assert!(!outcome.has_conflict);
        assert!(outcome.version_id.is_some());

        let latest = version_store::latest_version(&mut conn, EntityType::Settlement, entity_id, main_id).unwrap().unwrap();
        let decoded: Settlement = latest.decode().unwrap();
        assert_eq!(decoded.population, 1300);
    }

    #[test]
    #[ignore = "requires TEST_DATABASE_URL"]
    fn cherry_pick_onto_a_branch_that_never_saw_the_entity_is_a_clean_addition() {
        let mut conn = test_connection();
        conn.begin_test_transaction().unwrap();
        let (main_id, feature_id) = setup_branches(&mut conn);
        let entity_id = Uuid::new_v4();
        let user = Uuid::new_v4();

        let on_source = Settlement { name: "Ford".to_string(), population: 1500 };
        version_store::create_version(&mut conn, EntityType::Settlement, entity_id, feature_id, 10, &on_source, user).unwrap();

        let outcome =
            cherry_pick(&mut conn, EntityType::Settlement, entity_id, feature_id, main_id, 30, vec![], user).unwrap();

        assert!(outcome.success);
        assert!(!outcome.has_conflict);
        let latest = version_store::latest_version(&mut conn, EntityType::Settlement, entity_id, main_id).unwrap().unwrap();
        let decoded: Settlement = latest.decode().unwrap();
        assert_eq!(decoded, on_source);
    }
}
