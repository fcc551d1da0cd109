//! Entity Store (spec §4.4, component C4).
//!
//! Generic CRUD over the seven versionable domain entities (everything but
//! `StateVariable`, which [`crate::variables`] owns, and `Location`, which
//! is world-bound and explicitly non-versionable). Operates on
//! `serde_json::Value` snapshots rather than one typed struct per entity so
//! the optimistic-locking, versioning, and audit plumbing is written once
//! (spec §4.4's operations are the same shape for every entity type) while
//! each table's own column layout stays out of the shared path.

use chrono::Utc;
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use crate::entity::EntityType;
use crate::error::{ServiceError, ServiceResult};
use crate::{audit, codec, version_store};

/// Loads one entity row as a JSON snapshot (its full flattened shape,
/// `EntityMeta` fields included), or `None` if it doesn't exist.
pub fn find_by_id(conn: &mut PgConnection, entity_type: EntityType, id: Uuid) -> ServiceResult<Option<Value>> {
    (table_ops(entity_type)?.load_one)(conn, id)
}

/// Every live (non-deleted) entity of `entity_type` owned by `campaign_id`.
pub fn find_by_campaign(conn: &mut PgConnection, entity_type: EntityType, campaign_id: Uuid) -> ServiceResult<Vec<Value>> {
    (table_ops(entity_type)?.load_by_campaign)(conn, campaign_id)
}

/// Creates a new entity row and appends its first `VersionRecord` on
/// `branch_id` with `validFrom = world_time` (spec §4.4, §3 lifecycle) —
/// every mutation of a versionable entity on a branch gets exactly one
/// version record, and creation is no exception. `fields` supplies the
/// entity's own columns (e.g. `name`, `population`, `kingdomId`) plus any
/// free-form `variables`; `EntityMeta` bookkeeping (id, version, timestamps)
/// is filled in here.
pub fn create(
    conn: &mut PgConnection,
    entity_type: EntityType,
    campaign_id: Uuid,
    branch_id: Uuid,
    world_time: i64,
    fields: Value,
    created_by: Uuid,
) -> ServiceResult<Value> {
    let ops = table_ops(entity_type)?;

    conn.transaction(|conn| {
        let now = Utc::now();
        let row = (ops.insert)(conn, campaign_id, fields, now)?;
        let id = row_id(&row)?;

        version_store::create_version(conn, entity_type, id, branch_id, world_time, &row, created_by)?;

        audit::log(
            conn,
            entity_type,
            id,
            audit::AuditOperation::Create,
            created_by,
            audit::AuditParams { changes: row.clone(), new_state: Some(row.clone()), ..Default::default() },
        );

        Ok(row)
    })
}

/// Applies `patch` (a partial object merged over the current snapshot) to
/// an entity, enforcing the optimistic lock (`expected_version` must match
/// the row's current `version`) and writing a new version record on the
/// given branch/world-time (spec §4.4, §4.3).
///
/// `EntityType::Location` is rejected with `BadScope`: locations are not
/// versionable (spec §3 invariant 7).
#[allow(clippy::too_many_arguments)]
pub fn update(
    conn: &mut PgConnection,
    entity_type: EntityType,
    id: Uuid,
    expected_version: i32,
    patch: Value,
    branch_id: Uuid,
    world_time: i64,
    updated_by: Uuid,
) -> ServiceResult<Value> {
    if !entity_type.is_versionable() {
        return Err(ServiceError::bad_scope("LOCATION"));
    }

    let ops = table_ops(entity_type)?;

    conn.transaction(|conn| {
        let current = (ops.load_one)(conn, id)?.ok_or(ServiceError::NotFound)?;
        let current_version = row_version(&current)?;
        if current_version != expected_version {
            return Err(ServiceError::OptimisticLock { expected: expected_version, actual: current_version });
        }

        let next_version = current_version + 1;
        let now = Utc::now();
        let merged = merge_patch(&current, &patch, next_version, now);
        let updated = (ops.update)(conn, id, &merged, now)?;

        version_store::create_version(conn, entity_type, id, branch_id, world_time, &updated, updated_by)?;

        audit::log(
            conn,
            entity_type,
            id,
            audit::AuditOperation::Update,
            updated_by,
            audit::AuditParams {
                changes: patch,
                previous_state: Some(current),
                new_state: Some(updated.clone()),
                ..Default::default()
            },
        );

        Ok(updated)
    })
}

/// Soft-deletes an entity (sets `deletedAt`, bumps `version`). Does not
/// write a version record: a delete has no payload of its own to snapshot,
/// and `getAsOf` answers "did it exist then" via `deletedAt` on the latest
/// resolved version instead (spec §4.4 edge case).
pub fn delete(conn: &mut PgConnection, entity_type: EntityType, id: Uuid, deleted_by: Uuid) -> ServiceResult<()> {
    touch_lifecycle_field(conn, entity_type, id, LifecycleField::DeletedAt, deleted_by, audit::AuditOperation::Delete)
}

pub fn archive(conn: &mut PgConnection, entity_type: EntityType, id: Uuid, archived_by: Uuid) -> ServiceResult<()> {
    touch_lifecycle_field(conn, entity_type, id, LifecycleField::ArchivedAt, archived_by, audit::AuditOperation::Archive)
}

pub fn restore(conn: &mut PgConnection, entity_type: EntityType, id: Uuid, restored_by: Uuid) -> ServiceResult<()> {
    touch_lifecycle_field(conn, entity_type, id, LifecycleField::Restore, restored_by, audit::AuditOperation::Restore)
}

enum LifecycleField {
    DeletedAt,
    ArchivedAt,
    Restore,
}

fn touch_lifecycle_field(
    conn: &mut PgConnection,
    entity_type: EntityType,
    id: Uuid,
    field: LifecycleField,
    user_id: Uuid,
    operation: audit::AuditOperation,
) -> ServiceResult<()> {
    let ops = table_ops(entity_type)?;
    conn.transaction(|conn| {
        let current = (ops.load_one)(conn, id)?.ok_or(ServiceError::NotFound)?;
        let now = Utc::now();
        let mut next = current.clone();
        if let Value::Object(map) = &mut next {
            match field {
                LifecycleField::DeletedAt => { map.insert("deleted_at".into(), serde_json::json!(now)); }
                LifecycleField::ArchivedAt => { map.insert("archived_at".into(), serde_json::json!(now)); }
                LifecycleField::Restore => {
                    map.insert("deleted_at".into(), Value::Null);
                    map.insert("archived_at".into(), Value::Null);
                }
            }
            let bumped = row_version(&current)? + 1;
            map.insert("version".into(), serde_json::json!(bumped));
        }
        (ops.update)(conn, id, &next, now)?;

        audit::log(conn, entity_type, id, operation, user_id, audit::AuditParams {
            previous_state: Some(current),
            new_state: Some(next),
            ..Default::default()
        });
        Ok(())
    })
}

/// Resolves the snapshot of an entity as of `world_time` on `branch_id`
/// (spec §4.4 `getAsOf`), independent of the entity's current live state.
pub fn get_as_of(
    conn: &mut PgConnection,
    entity_type: EntityType,
    id: Uuid,
    branch_id: Uuid,
    world_time: i64,
) -> ServiceResult<Option<Value>> {
    if !entity_type.is_versionable() {
        return Err(ServiceError::bad_scope("LOCATION"));
    }
    match version_store::resolve_version(conn, entity_type, id, branch_id, world_time)? {
        Some(record) => Ok(Some(codec::decode(&record.payload_gz).map_err(ServiceError::from)?)),
        None => Ok(None),
    }
}

fn row_id(row: &Value) -> ServiceResult<Uuid> {
    row.get("id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ServiceError::bad_request("entity row is missing an id"))
}

fn row_version(row: &Value) -> ServiceResult<i32> {
    row.get("version")
        .and_then(Value::as_i64)
        .map(|v| v as i32)
        .ok_or_else(|| ServiceError::bad_request("entity row is missing a version"))
}

/// Shallow-merges `patch` over `current`, then stamps the bookkeeping
/// fields every `EntityMeta` carries. Both snapshots use the same key names
/// as the underlying table's columns (snake_case, matching what
/// `to_jsonb(table.*)` returns) — `patch` is not the raw external-API
/// request body, it is already normalized to that shape by the caller.
fn merge_patch(current: &Value, patch: &Value, next_version: i32, now: chrono::DateTime<Utc>) -> Value {
    let mut merged = current.clone();
    if let (Value::Object(base), Value::Object(overlay)) = (&mut merged, patch) {
        for (k, v) in overlay {
            base.insert(k.clone(), v.clone());
        }
        base.insert("version".into(), serde_json::json!(next_version));
        base.insert("updated_at".into(), serde_json::json!(now));
    }
    merged
}

/// Per-table glue. Each entity type's table has a different column layout,
/// so loading/inserting/updating is dispatched here rather than expressed
/// generically over `diesel::Table` — the same trade the context builder
/// (C7) and access guard (C12) make with their own `fetch!`/`campaign_of!`
/// macros.
#[derive(Debug)]
struct TableOps {
    load_one: fn(&mut PgConnection, Uuid) -> ServiceResult<Option<Value>>,
    load_by_campaign: fn(&mut PgConnection, Uuid) -> ServiceResult<Vec<Value>>,
    insert: fn(&mut PgConnection, Uuid, Value, chrono::DateTime<Utc>) -> ServiceResult<Value>,
    update: fn(&mut PgConnection, Uuid, &Value, chrono::DateTime<Utc>) -> ServiceResult<Value>,
}

fn table_ops(entity_type: EntityType) -> ServiceResult<TableOps> {
    match entity_type {
        EntityType::Location => Err(ServiceError::bad_scope("LOCATION")),
        EntityType::StateVariable => Err(ServiceError::bad_scope("STATE_VARIABLE")),
        EntityType::Kingdom => Ok(tables::kingdom_ops()),
        EntityType::Settlement => Ok(tables::settlement_ops()),
        EntityType::Structure => Ok(tables::structure_ops()),
        EntityType::Party => Ok(tables::party_ops()),
        EntityType::Character => Ok(tables::character_ops()),
        EntityType::WorldEvent => Ok(tables::world_event_ops()),
        EntityType::Encounter => Ok(tables::encounter_ops()),
    }
}

/// Per-table `TableOps` implementations. Each `to_jsonb` query mirrors the
/// context builder's `fetch!` macro (`src/expr/context.rs`); each insert
/// pulls its own-column subset out of the caller-supplied JSON and lets
/// everything else default the way `EntityMeta::new` would for a freshly
/// constructed struct.
mod tables {
    use super::*;

    macro_rules! simple_entity_ops {
        ($mod_name:ident, $table:ident, $parent_col:ident) => {
            pub fn $mod_name() -> TableOps {
                TableOps {
                    load_one: |conn, id| {
                        use crate::schema::$table::dsl;
                        dsl::$table
                            .filter(dsl::id.eq(id))
                            .select(diesel::dsl::sql::<diesel::sql_types::Jsonb>(concat!(
                                "to_jsonb(", stringify!($table), ".*)"
                            )))
                            .first(conn)
                            .optional()
                            .map_err(ServiceError::from)
                    },
                    load_by_campaign: |conn, campaign_id| {
                        use crate::schema::$table::dsl;
                        dsl::$table
                            .filter(dsl::$parent_col.eq(campaign_id))
                            .filter(dsl::deleted_at.is_null())
                            .select(diesel::dsl::sql::<diesel::sql_types::Jsonb>(concat!(
                                "to_jsonb(", stringify!($table), ".*)"
                            )))
                            .load(conn)
                            .map_err(ServiceError::from)
                    },
                    insert: |conn, campaign_id, fields, now| {
                        use crate::schema::$table;
                        let id = Uuid::new_v4();
                        let name = fields.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                        let variables = fields.get("variables").cloned().unwrap_or_else(|| serde_json::json!({}));

                        diesel::insert_into($table::table)
                            .values((
                                $table::id.eq(id),
                                $table::$parent_col.eq(campaign_id),
                                $table::name.eq(name),
                                $table::variables.eq(variables),
                                $table::version.eq(1),
                                $table::created_at.eq(now),
                                $table::updated_at.eq(now),
                            ))
                            .execute(conn)?;

                        (simple_entity_ops!(@load_one $table))(conn, id)?.ok_or_else(|| {
                            crate::error::internal("entity_store", "row vanished immediately after insert")
                        })
                    },
                    update: |conn, id, row, _now| {
                        use crate::schema::$table::dsl;
                        let name = row.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                        let variables = row.get("variables").cloned().unwrap_or_else(|| serde_json::json!({}));
                        let version = row.get("version").and_then(Value::as_i64).unwrap_or(1) as i32;
                        let deleted_at = row.get("deleted_at").cloned().filter(|v| !v.is_null())
                            .and_then(|v| serde_json::from_value::<chrono::DateTime<Utc>>(v).ok());
                        let archived_at = row.get("archived_at").cloned().filter(|v| !v.is_null())
                            .and_then(|v| serde_json::from_value::<chrono::DateTime<Utc>>(v).ok());
                        let updated_at = row.get("updated_at").cloned()
                            .and_then(|v| serde_json::from_value::<chrono::DateTime<Utc>>(v).ok())
                            .unwrap_or_else(Utc::now);

                        diesel::update(dsl::$table.filter(dsl::id.eq(id)))
                            .set((
                                dsl::name.eq(name),
                                dsl::variables.eq(variables),
                                dsl::version.eq(version),
                                dsl::updated_at.eq(updated_at),
                                dsl::deleted_at.eq(deleted_at),
                                dsl::archived_at.eq(archived_at),
                            ))
                            .execute(conn)?;

                        (simple_entity_ops!(@load_one $table))(conn, id)?.ok_or(ServiceError::NotFound)
                    },
                }
            }
        };
        (@load_one $table:ident) => {
            |conn: &mut PgConnection, id: Uuid| {
                use crate::schema::$table::dsl;
                dsl::$table
                    .filter(dsl::id.eq(id))
                    .select(diesel::dsl::sql::<diesel::sql_types::Jsonb>(concat!(
                        "to_jsonb(", stringify!($table), ".*)"
                    )))
                    .first(conn)
                    .optional()
                    .map_err(ServiceError::from)
            }
        };
    }

    simple_entity_ops!(kingdom_ops, kingdoms, campaign_id);
    simple_entity_ops!(party_ops, parties, campaign_id);
    simple_entity_ops!(world_event_ops, world_events, campaign_id);
    simple_entity_ops!(encounter_ops, encounters, campaign_id);

    /// Settlements and structures and characters have an extra domain
    /// column (`population`/`structureType`/`partyId`) and a non-campaign
    /// parent FK, so they don't fit `simple_entity_ops!` and are written out
    /// directly instead of forcing a second macro shape onto them.
    pub fn settlement_ops() -> TableOps {
        TableOps {
            load_one: |conn, id| {
                use crate::schema::settlements::dsl;
                dsl::settlements
                    .filter(dsl::id.eq(id))
                    .select(diesel::dsl::sql::<diesel::sql_types::Jsonb>("to_jsonb(settlements.*)"))
                    .first(conn)
                    .optional()
                    .map_err(ServiceError::from)
            },
            load_by_campaign: |conn, campaign_id| {
                use crate::schema::settlements::dsl;
                dsl::settlements
                    .filter(dsl::campaign_id.eq(campaign_id))
                    .filter(dsl::deleted_at.is_null())
                    .select(diesel::dsl::sql::<diesel::sql_types::Jsonb>("to_jsonb(settlements.*)"))
                    .load(conn)
                    .map_err(ServiceError::from)
            },
            insert: |conn, campaign_id, fields, now| {
                use crate::schema::settlements;
                let id = Uuid::new_v4();
                let kingdom_id: Uuid = fields.get("kingdomId").and_then(Value::as_str)
                    .ok_or_else(|| ServiceError::bad_request("settlement requires kingdomId"))?
                    .parse().map_err(|_| ServiceError::bad_request("kingdomId is not a valid uuid"))?;
                let name = fields.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                let population = fields.get("population").and_then(Value::as_i64).unwrap_or(0);
                let variables = fields.get("variables").cloned().unwrap_or_else(|| serde_json::json!({}));

                diesel::insert_into(settlements::table)
                    .values((
                        settlements::id.eq(id),
                        settlements::campaign_id.eq(campaign_id),
                        settlements::kingdom_id.eq(kingdom_id),
                        settlements::name.eq(name),
                        settlements::population.eq(population),
                        settlements::variables.eq(variables),
                        settlements::version.eq(1),
                        settlements::created_at.eq(now),
                        settlements::updated_at.eq(now),
                    ))
                    .execute(conn)?;

                find_by_id_internal_settlement(conn, id)?.ok_or_else(|| {
                    crate::error::internal("entity_store", "settlement row vanished immediately after insert")
                })
            },
            update: |conn, id, row, _now| {
                use crate::schema::settlements::dsl;
                let name = row.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                let population = row.get("population").and_then(Value::as_i64).unwrap_or(0);
                let variables = row.get("variables").cloned().unwrap_or_else(|| serde_json::json!({}));
                let version = row.get("version").and_then(Value::as_i64).unwrap_or(1) as i32;
                let deleted_at = row.get("deleted_at").cloned().filter(|v| !v.is_null())
                    .and_then(|v| serde_json::from_value::<chrono::DateTime<Utc>>(v).ok());
                let archived_at = row.get("archived_at").cloned().filter(|v| !v.is_null())
                    .and_then(|v| serde_json::from_value::<chrono::DateTime<Utc>>(v).ok());
                let updated_at = row.get("updated_at").cloned()
                    .and_then(|v| serde_json::from_value::<chrono::DateTime<Utc>>(v).ok())
                    .unwrap_or_else(Utc::now);

                diesel::update(dsl::settlements.filter(dsl::id.eq(id)))
                    .set((
                        dsl::name.eq(name),
                        dsl::population.eq(population),
                        dsl::variables.eq(variables),
                        dsl::version.eq(version),
                        dsl::updated_at.eq(updated_at),
                        dsl::deleted_at.eq(deleted_at),
                        dsl::archived_at.eq(archived_at),
                    ))
                    .execute(conn)?;

                find_by_id_internal_settlement(conn, id)?.ok_or(ServiceError::NotFound)
            },
        }
    }

    fn find_by_id_internal_settlement(conn: &mut PgConnection, id: Uuid) -> ServiceResult<Option<Value>> {
        use crate::schema::settlements::dsl;
        dsl::settlements
            .filter(dsl::id.eq(id))
            .select(diesel::dsl::sql::<diesel::sql_types::Jsonb>("to_jsonb(settlements.*)"))
            .first(conn)
            .optional()
            .map_err(ServiceError::from)
    }

    pub fn structure_ops() -> TableOps {
        TableOps {
            load_one: |conn, id| {
                use crate::schema::structures::dsl;
                dsl::structures
                    .filter(dsl::id.eq(id))
                    .select(diesel::dsl::sql::<diesel::sql_types::Jsonb>("to_jsonb(structures.*)"))
                    .first(conn)
                    .optional()
                    .map_err(ServiceError::from)
            },
            load_by_campaign: |conn, campaign_id| {
                use crate::schema::structures::dsl;
                dsl::structures
                    .filter(dsl::campaign_id.eq(campaign_id))
                    .filter(dsl::deleted_at.is_null())
                    .select(diesel::dsl::sql::<diesel::sql_types::Jsonb>("to_jsonb(structures.*)"))
                    .load(conn)
                    .map_err(ServiceError::from)
            },
            insert: |conn, campaign_id, fields, now| {
                use crate::schema::structures;
                let id = Uuid::new_v4();
                let settlement_id: Uuid = fields.get("settlementId").and_then(Value::as_str)
                    .ok_or_else(|| ServiceError::bad_request("structure requires settlementId"))?
                    .parse().map_err(|_| ServiceError::bad_request("settlementId is not a valid uuid"))?;
                let name = fields.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                let structure_type = fields.get("structureType").and_then(Value::as_str).unwrap_or_default().to_string();
                let variables = fields.get("variables").cloned().unwrap_or_else(|| serde_json::json!({}));

                diesel::insert_into(structures::table)
                    .values((
                        structures::id.eq(id),
                        structures::campaign_id.eq(campaign_id),
                        structures::settlement_id.eq(settlement_id),
                        structures::name.eq(name),
                        structures::structure_type.eq(structure_type),
                        structures::variables.eq(variables),
                        structures::version.eq(1),
                        structures::created_at.eq(now),
                        structures::updated_at.eq(now),
                    ))
                    .execute(conn)?;

                find_by_id_internal_structure(conn, id)?.ok_or_else(|| {
                    crate::error::internal("entity_store", "structure row vanished immediately after insert")
                })
            },
            update: |conn, id, row, _now| {
                use crate::schema::structures::dsl;
                let name = row.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                let structure_type = row.get("structure_type").and_then(Value::as_str).unwrap_or_default().to_string();
                let variables = row.get("variables").cloned().unwrap_or_else(|| serde_json::json!({}));
                let version = row.get("version").and_then(Value::as_i64).unwrap_or(1) as i32;
                let deleted_at = row.get("deleted_at").cloned().filter(|v| !v.is_null())
                    .and_then(|v| serde_json::from_value::<chrono::DateTime<Utc>>(v).ok());
                let archived_at = row.get("archived_at").cloned().filter(|v| !v.is_null())
                    .and_then(|v| serde_json::from_value::<chrono::DateTime<Utc>>(v).ok());
                let updated_at = row.get("updated_at").cloned()
                    .and_then(|v| serde_json::from_value::<chrono::DateTime<Utc>>(v).ok())
                    .unwrap_or_else(Utc::now);

                diesel::update(dsl::structures.filter(dsl::id.eq(id)))
                    .set((
                        dsl::name.eq(name),
                        dsl::structure_type.eq(structure_type),
                        dsl::variables.eq(variables),
                        dsl::version.eq(version),
                        dsl::updated_at.eq(updated_at),
                        dsl::deleted_at.eq(deleted_at),
                        dsl::archived_at.eq(archived_at),
                    ))
                    .execute(conn)?;

                find_by_id_internal_structure(conn, id)?.ok_or(ServiceError::NotFound)
            },
        }
    }

    fn find_by_id_internal_structure(conn: &mut PgConnection, id: Uuid) -> ServiceResult<Option<Value>> {
        use crate::schema::structures::dsl;
        dsl::structures
            .filter(dsl::id.eq(id))
            .select(diesel::dsl::sql::<diesel::sql_types::Jsonb>("to_jsonb(structures.*)"))
            .first(conn)
            .optional()
            .map_err(ServiceError::from)
    }

    pub fn character_ops() -> TableOps {
        TableOps {
            load_one: |conn, id| {
                use crate::schema::characters::dsl;
                dsl::characters
                    .filter(dsl::id.eq(id))
                    .select(diesel::dsl::sql::<diesel::sql_types::Jsonb>("to_jsonb(characters.*)"))
                    .first(conn)
                    .optional()
                    .map_err(ServiceError::from)
            },
            load_by_campaign: |conn, campaign_id| {
                use crate::schema::characters::dsl;
                dsl::characters
                    .filter(dsl::campaign_id.eq(campaign_id))
                    .filter(dsl::deleted_at.is_null())
                    .select(diesel::dsl::sql::<diesel::sql_types::Jsonb>("to_jsonb(characters.*)"))
                    .load(conn)
                    .map_err(ServiceError::from)
            },
            insert: |conn, campaign_id, fields, now| {
                use crate::schema::characters;
                let id = Uuid::new_v4();
                let party_id: Option<Uuid> = fields.get("partyId").and_then(Value::as_str)
                    .and_then(|s| s.parse().ok());
                let name = fields.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                let variables = fields.get("variables").cloned().unwrap_or_else(|| serde_json::json!({}));

                diesel::insert_into(characters::table)
                    .values((
                        characters::id.eq(id),
                        characters::campaign_id.eq(campaign_id),
                        characters::party_id.eq(party_id),
                        characters::name.eq(name),
                        characters::variables.eq(variables),
                        characters::version.eq(1),
                        characters::created_at.eq(now),
                        characters::updated_at.eq(now),
                    ))
                    .execute(conn)?;

                find_by_id_internal_character(conn, id)?.ok_or_else(|| {
                    crate::error::internal("entity_store", "character row vanished immediately after insert")
                })
            },
            update: |conn, id, row, _now| {
                use crate::schema::characters::dsl;
                let name = row.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                let party_id: Option<Uuid> = row.get("party_id").and_then(Value::as_str).and_then(|s| s.parse().ok());
                let variables = row.get("variables").cloned().unwrap_or_else(|| serde_json::json!({}));
                let version = row.get("version").and_then(Value::as_i64).unwrap_or(1) as i32;
                let deleted_at = row.get("deleted_at").cloned().filter(|v| !v.is_null())
                    .and_then(|v| serde_json::from_value::<chrono::DateTime<Utc>>(v).ok());
                let archived_at = row.get("archived_at").cloned().filter(|v| !v.is_null())
                    .and_then(|v| serde_json::from_value::<chrono::DateTime<Utc>>(v).ok());
                let updated_at = row.get("updated_at").cloned()
                    .and_then(|v| serde_json::from_value::<chrono::DateTime<Utc>>(v).ok())
                    .unwrap_or_else(Utc::now);

                diesel::update(dsl::characters.filter(dsl::id.eq(id)))
                    .set((
                        dsl::name.eq(name),
                        dsl::party_id.eq(party_id),
                        dsl::variables.eq(variables),
                        dsl::version.eq(version),
                        dsl::updated_at.eq(updated_at),
                        dsl::deleted_at.eq(deleted_at),
                        dsl::archived_at.eq(archived_at),
                    ))
                    .execute(conn)?;

                find_by_id_internal_character(conn, id)?.ok_or(ServiceError::NotFound)
            },
        }
    }

    fn find_by_id_internal_character(conn: &mut PgConnection, id: Uuid) -> ServiceResult<Option<Value>> {
        use crate::schema::characters::dsl;
        dsl::characters
            .filter(dsl::id.eq(id))
            .select(diesel::dsl::sql::<diesel::sql_types::Jsonb>("to_jsonb(characters.*)"))
            .first(conn)
            .optional()
            .map_err(ServiceError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_connection;
    use diesel::Connection;

    fn seed_campaign(conn: &mut PgConnection) -> Uuid {
        use crate::schema::campaigns;

        let campaign_id = Uuid::new_v4();
        diesel::insert_into(campaigns::table)
            .values((
                campaigns::id.eq(campaign_id),
                campaigns::world_id.eq(Uuid::new_v4()),
                campaigns::owner_id.eq(Uuid::new_v4()),
            ))
            .execute(conn)
            .unwrap();
        campaign_id
    }

    fn seed_branch(conn: &mut PgConnection, campaign_id: Uuid) -> Uuid {
        use crate::schema::branches;

        let branch_id = Uuid::new_v4();
        diesel::insert_into(branches::table)
            .values((branches::id.eq(branch_id), branches::campaign_id.eq(campaign_id), branches::name.eq("main")))
            .execute(conn)
            .unwrap();
        branch_id
    }

    #[test]
    #[ignore = "requires TEST_DATABASE_URL"]
    fn create_appends_the_first_version_record() {
        let mut conn = test_connection();
        conn.begin_test_transaction().unwrap();
        let user = Uuid::new_v4();

        let campaign_id = seed_campaign(&mut conn);
        let branch_id = seed_branch(&mut conn, campaign_id);

        let row = create(
            &mut conn,
            EntityType::Kingdom,
            campaign_id,
            branch_id,
            42,
            serde_json::json!({"name": "Andoria"}),
            user,
        )
        .unwrap();
        let id = row_id(&row).unwrap();

        let version = version_store::latest_version(&mut conn, EntityType::Kingdom, id, branch_id).unwrap().unwrap();
        assert_eq!(version.valid_from, 42);
        let decoded: Value = version.decode().unwrap();
        assert_eq!(decoded["name"], serde_json::json!("Andoria"));
    }

    #[test]
    fn location_is_rejected_with_bad_scope() {
        let err = table_ops(EntityType::Location).unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(crate::error::BadRequestKind::BadScope("LOCATION"))));
    }

    #[test]
    fn state_variable_is_not_handled_by_this_store() {
        assert!(table_ops(EntityType::StateVariable).is_err());
    }

    #[test]
    fn merge_patch_overlays_fields_and_bumps_version() {
        let current = serde_json::json!({"name": "Ford", "population": 1000, "version": 3});
        let patch = serde_json::json!({"population": 1500});
        let merged = merge_patch(&current, &patch, 4, Utc::now());

        assert_eq!(merged["name"], serde_json::json!("Ford"));
        assert_eq!(merged["population"], serde_json::json!(1500));
        assert_eq!(merged["version"], serde_json::json!(4));
    }

    #[test]
    fn row_version_reads_the_version_field() {
        let row = serde_json::json!({"version": 7});
        assert_eq!(row_version(&row).unwrap(), 7);
    }

    #[test]
    fn merge_patch_preserves_snake_case_columns_not_touched_by_the_patch() {
        let current = serde_json::json!({
            "name": "Ironhold",
            "structure_type": "fortress",
            "party_id": "11111111-1111-1111-1111-111111111111",
            "archived_at": serde_json::Value::Null,
            "deleted_at": serde_json::Value::Null,
            "version": 2,
        });
        let patch = serde_json::json!({"name": "Ironhold Keep"});
        let merged = merge_patch(&current, &patch, 3, Utc::now());

        assert_eq!(merged["name"], serde_json::json!("Ironhold Keep"));
        assert_eq!(merged["structure_type"], serde_json::json!("fortress"));
        assert_eq!(merged["party_id"], current["party_id"]);
        assert!(merged.get("updated_at").is_some());
    }
}
