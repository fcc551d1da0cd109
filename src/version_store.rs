//! Version Store (spec §4.3, component C3).
//!
//! Append-only, per-`(entity_type, entity_id, branch)` history of payloads
//! keyed by world time. A version's `valid_from..valid_to` window is a
//! half-open interval on the world-time axis (domain time, not wall clock);
//! creating a new version closes the previous open-ended tail by setting its
//! `valid_to` to the new version's `valid_from`.

use chrono::Utc;
use diesel::prelude::*;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::entity::EntityType;
use crate::error::{ServiceError, ServiceResult};
use crate::schema::versions;
use crate::{audit, codec};

#[derive(Queryable, Debug, Clone)]
pub struct VersionRecord {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub branch_id: Uuid,
    pub version: i32,
    pub valid_from: i64,
    pub valid_to: Option<i64>,
    pub payload_gz: Vec<u8>,
    pub created_by: Uuid,
    pub created_at: chrono::DateTime<Utc>,
}

impl VersionRecord {
    pub fn decode<T: DeserializeOwned>(&self) -> ServiceResult<T> {
        codec::decode(&self.payload_gz).map_err(ServiceError::from)
    }
}

#[derive(Insertable)]
#[diesel(table_name = versions)]
struct NewVersion {
    id: Uuid,
    entity_type: String,
    entity_id: Uuid,
    branch_id: Uuid,
    version: i32,
    valid_from: i64,
    valid_to: Option<i64>,
    payload_gz: Vec<u8>,
    created_by: Uuid,
    created_at: chrono::DateTime<Utc>,
}

/// Writes a new version for `(entity_type, entity_id, branch_id)`, closing
/// the currently-open tail (if any) at `world_time`.
///
/// Rejects a `world_time` at or before the open tail's `valid_from` — time
/// only moves forward within one entity's history on one branch (spec §4.3
/// edge case: "time regression is rejected").
pub fn create_version<T: Serialize>(
    conn: &mut PgConnection,
    entity_type: EntityType,
    entity_id: Uuid,
    branch_id: Uuid,
    world_time: i64,
    payload: &T,
    created_by: Uuid,
) -> ServiceResult<VersionRecord> {
    conn.transaction(|conn| {
        let open_tail = find_open_tail(conn, entity_type, entity_id, branch_id)?;

        if let Some(tail) = &open_tail {
            if world_time <= tail.valid_from {
                return Err(ServiceError::bad_request(format!(
                    "world_time {world_time} does not advance past the current version's valid_from {}",
                    tail.valid_from
                )));
            }
        }

        let next_version = open_tail.as_ref().map(|t| t.version + 1).unwrap_or(1);
        let payload_gz = codec::encode(payload)?;

        let new_row = NewVersion {
            id: Uuid::new_v4(),
            entity_type: entity_type.as_ref().to_string(),
            entity_id,
            branch_id,
            version: next_version,
            valid_from: world_time,
            valid_to: None,
            payload_gz,
            created_by,
            created_at: Utc::now(),
        };

        if let Some(tail) = &open_tail {
            diesel::update(versions::table.find(tail.id))
                .set(versions::valid_to.eq(world_time))
                .execute(conn)?;
        }

        diesel::insert_into(versions::table)
            .values(&new_row)
            .execute(conn)?;

        let inserted: VersionRecord = versions::table.find(new_row.id).first(conn)?;

        audit::log(
            conn,
            entity_type,
            entity_id,
            audit::AuditOperation::Update,
            created_by,
            audit::AuditParams { changes: serde_json::json!({"world_time": world_time}), ..Default::default() },
        );

        Ok(inserted)
    })
}

/// The currently open-ended version for `(entity_type, entity_id)` on
/// `branch_id`, i.e. its live value on that branch right now.
pub fn latest_version(
    conn: &mut PgConnection,
    entity_type: EntityType,
    entity_id: Uuid,
    branch_id: Uuid,
) -> ServiceResult<Option<VersionRecord>> {
    find_open_tail(conn, entity_type, entity_id, branch_id)
}

fn find_open_tail(
    conn: &mut PgConnection,
    entity_type: EntityType,
    entity_id: Uuid,
    branch_id: Uuid,
) -> ServiceResult<Option<VersionRecord>> {
    use crate::schema::versions::dsl;

    dsl::versions
        .filter(dsl::entity_type.eq(entity_type.as_ref()))
        .filter(dsl::entity_id.eq(entity_id))
        .filter(dsl::branch_id.eq(branch_id))
        .filter(dsl::valid_to.is_null())
        .first(conn)
        .optional()
        .map_err(ServiceError::from)
}

/// Resolves the version of `(entity_type, entity_id)` active on `branch_id`
/// at `world_time`, walking up the branch's ancestry (via its
/// `diverged_at`) when the branch itself has no version covering that
/// instant — a fork only sees versions written before it diverged (spec
/// §4.3, §4.5 "branch resolution").
pub fn resolve_version(
    conn: &mut PgConnection,
    entity_type: EntityType,
    entity_id: Uuid,
    branch_id: Uuid,
    world_time: i64,
) -> ServiceResult<Option<VersionRecord>> {
    let mut current_branch = branch_row_cols(conn, branch_id)?;
    let mut ceiling = world_time;

    loop {
        let found = find_active_at(conn, entity_type, entity_id, current_branch.0, ceiling)?;
        if found.is_some() {
            return Ok(found);
        }

        match current_branch.2 {
            Some(parent_id) => {
                // Above the fork point, the parent's own history applies as
                // of the moment this branch diverged, but never later than
                // the instant we're actually resolving.
                if let Some(diverged_at) = current_branch.1 {
                    ceiling = ceiling.min(diverged_at);
                }
                current_branch = branch_row_cols(conn, parent_id)?;
            }
            None => return Ok(None),
        }
    }
}

/// Finds the version active at `world_time`: the most recent version with
/// `valid_from <= world_time` whose window hasn't closed by then. Filters
/// candidates in Rust rather than with a `valid_to IS NULL OR valid_to >
/// $1` predicate, since mixing a `Bool` and a `Nullable<Bool>` branch of an
/// `OR` needs an explicit `nullable()`/`assume_not_null()` cast either way
/// — iterating the (small, `valid_from`-descending) candidate set reads
/// more plainly than that cast does.
fn find_active_at(
    conn: &mut PgConnection,
    entity_type: EntityType,
    entity_id: Uuid,
    branch_id: Uuid,
    world_time: i64,
) -> ServiceResult<Option<VersionRecord>> {
    use crate::schema::versions::dsl;

    let candidates: Vec<VersionRecord> = dsl::versions
        .filter(dsl::entity_type.eq(entity_type.as_ref()))
        .filter(dsl::entity_id.eq(entity_id))
        .filter(dsl::branch_id.eq(branch_id))
        .filter(dsl::valid_from.le(world_time))
        .order(dsl::valid_from.desc())
        .load(conn)?;

    Ok(candidates.into_iter().find(|v| v.valid_to.map(|vt| vt > world_time).unwrap_or(true)))
}

fn branch_row_cols(conn: &mut PgConnection, branch_id: Uuid) -> ServiceResult<(Uuid, Option<i64>, Option<Uuid>)> {
    use crate::schema::branches::dsl;

    dsl::branches
        .filter(dsl::id.eq(branch_id))
        .select((dsl::id, dsl::diverged_at, dsl::parent_id))
        .first(conn)
        .map_err(ServiceError::from)
}

/// All versions of `(entity_type, entity_id)` on `branch_id`, oldest first.
/// Does not walk ancestry — this is the branch's own recorded history, not
/// a resolved view (spec §4.3 `findVersionHistory`).
pub fn find_version_history(
    conn: &mut PgConnection,
    entity_type: EntityType,
    entity_id: Uuid,
    branch_id: Uuid,
) -> ServiceResult<Vec<VersionRecord>> {
    use crate::schema::versions::dsl;

    dsl::versions
        .filter(dsl::entity_type.eq(entity_type.as_ref()))
        .filter(dsl::entity_id.eq(entity_id))
        .filter(dsl::branch_id.eq(branch_id))
        .order(dsl::valid_from.asc())
        .load(conn)
        .map_err(ServiceError::from)
}

/// Every version of any entity of `entity_type` recorded directly on
/// `branch_id` (spec §4.3 `getVersionsForBranchAndType`), used by the merge
/// algorithm to enumerate what a branch actually touched.
pub fn versions_for_branch_and_type(
    conn: &mut PgConnection,
    entity_type: EntityType,
    branch_id: Uuid,
) -> ServiceResult<Vec<VersionRecord>> {
    use crate::schema::versions::dsl;

    dsl::versions
        .filter(dsl::entity_type.eq(entity_type.as_ref()))
        .filter(dsl::branch_id.eq(branch_id))
        .order(dsl::valid_from.asc())
        .load(conn)
        .map_err(ServiceError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_connection;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        population: i64,
    }

    fn setup_branch(conn: &mut PgConnection) -> Uuid {
        use crate::schema::campaigns;
        use crate::schema::branches;

        let campaign_id = Uuid::new_v4();
        diesel::insert_into(campaigns::table)
            .values((
                campaigns::id.eq(campaign_id),
                campaigns::world_id.eq(Uuid::new_v4()),
                campaigns::owner_id.eq(Uuid::new_v4()),
            ))
            .execute(conn)
            .unwrap();

        let branch_id = Uuid::new_v4();
        diesel::insert_into(branches::table)
            .values((
                branches::id.eq(branch_id),
                branches::campaign_id.eq(campaign_id),
                branches::name.eq("main"),
            ))
            .execute(conn)
            .unwrap();
        branch_id
    }

    #[test]
    #[ignore = "requires TEST_DATABASE_URL"]
    fn create_version_closes_the_previous_open_tail() {
        let mut conn = test_connection();
        conn.begin_test_transaction().unwrap();
        let branch_id = setup_branch(&mut conn);
        let entity_id = Uuid::new_v4();
        let user = Uuid::new_v4();

        create_version(&mut conn, EntityType::Settlement, entity_id, branch_id, 10, &Payload { population: 100 }, user).unwrap();
        create_version(&mut conn, EntityType::Settlement, entity_id, branch_id, 20, &Payload { population: 200 }, user).unwrap();

        let history = find_version_history(&mut conn, EntityType::Settlement, entity_id, branch_id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].valid_to, Some(20));
        assert_eq!(history[1].valid_to, None);
    }

    #[test]
    #[ignore = "requires TEST_DATABASE_URL"]
    fn time_regression_is_rejected() {
        let mut conn = test_connection();
        conn.begin_test_transaction().unwrap();
        let branch_id = setup_branch(&mut conn);
        let entity_id = Uuid::new_v4();
        let user = Uuid::new_v4();

        create_version(&mut conn, EntityType::Settlement, entity_id, branch_id, 50, &Payload { population: 100 }, user).unwrap();
        let result = create_version(&mut conn, EntityType::Settlement, entity_id, branch_id, 40, &Payload { population: 110 }, user);
        assert!(result.is_err());
    }

    #[test]
    #[ignore = "requires TEST_DATABASE_URL"]
    fn resolve_version_falls_back_to_parent_before_divergence() {
        let mut conn = test_connection();
        conn.begin_test_transaction().unwrap();
        let root_id = setup_branch(&mut conn);
        let entity_id = Uuid::new_v4();
        let user = Uuid::new_v4();

        create_version(&mut conn, EntityType::Settlement, entity_id, root_id, 10, &Payload { population: 100 }, user).unwrap();

        use crate::schema::branches;
        let child_id = Uuid::new_v4();
        let campaign_id: Uuid = branches::table.find(root_id).select(branches::campaign_id).first(&mut conn).unwrap();
        diesel::insert_into(branches::table)
            .values((
                branches::id.eq(child_id),
                branches::campaign_id.eq(campaign_id),
                branches::parent_id.eq(root_id),
                branches::name.eq("feature"),
                branches::diverged_at.eq(Some(30)),
            ))
            .execute(&mut conn)
            .unwrap();

        let resolved = resolve_version(&mut conn, EntityType::Settlement, entity_id, child_id, 30).unwrap();
        assert!(resolved.is_some());
        assert_eq!(resolved.unwrap().decode::<Payload>().unwrap(), Payload { population: 100 });
    }

    #[test]
    #[ignore = "requires TEST_DATABASE_URL"]
    fn resolve_version_clamps_ceiling_to_divergence_not_just_replaces_it() {
        let mut conn = test_connection();
        conn.begin_test_transaction().unwrap();
        let root_id = setup_branch(&mut conn);
        let entity_id = Uuid::new_v4();
        let user = Uuid::new_v4();

        create_version(&mut conn, EntityType::Settlement, entity_id, root_id, 10, &Payload { population: 100 }, user).unwrap();
        create_version(&mut conn, EntityType::Settlement, entity_id, root_id, 50, &Payload { population: 999 }, user).unwrap();

        use crate::schema::branches;
        let child_id = Uuid::new_v4();
        let campaign_id: Uuid = branches::table.find(root_id).select(branches::campaign_id).first(&mut conn).unwrap();
        diesel::insert_into(branches::table)
            .values((
                branches::id.eq(child_id),
                branches::campaign_id.eq(campaign_id),
                branches::parent_id.eq(root_id),
                branches::name.eq("feature"),
                branches::diverged_at.eq(Some(30)),
            ))
            .execute(&mut conn)
            .unwrap();

        // Querying the child at t=20 (before it diverged at 30) must resolve
        // against the parent's history as of 20, not as of 30 — the parent's
        // population=999 version (valid_from=50) must not leak in.
        let resolved = resolve_version(&mut conn, EntityType::Settlement, entity_id, child_id, 20).unwrap();
        assert!(resolved.is_some());
        assert_eq!(resolved.unwrap().decode::<Payload>().unwrap(), Payload { population: 100 });
    }
}
