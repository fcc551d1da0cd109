//! State-Variable Service (spec §4.9, component C9).
//!
//! CRUD over `StateVariable` rows, composed with the dependency graph
//! (C8), the formula evaluator (C6/C7), the shared cache (§5), and the
//! event bus (C11): creating or editing a derived variable revalidates the
//! graph for cycles before it's saved, and any successful mutation
//! invalidates the cache entries and publishes the event other
//! subsystems key off of.

use std::sync::Arc;

use chrono::Utc;
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use crate::cache::Cache;
use crate::depgraph::DependencyGraph;
use crate::entity::{EntityType, Scope, StateVariable, VariableType};
use crate::error::{ServiceError, ServiceResult};
use crate::event_bus::{Event, EventBus};
use crate::expr::{self, Context, OperatorRegistry};
use crate::schema::state_variables;
use crate::{audit, version_store};

/// Services state-variable mutations need beyond the bare DB connection
/// (spec §9: own shared collaborators explicitly and thread them in,
/// rather than reach for ambient globals).
pub struct VariableService<'a> {
    pub cache: &'a Cache,
    pub event_bus: &'a dyn EventBus,
    pub operators: &'a OperatorRegistry,
}

#[derive(Queryable, Debug, Clone)]
struct VariableRow {
    id: Uuid,
    scope: String,
    scope_id: Option<Uuid>,
    key: String,
    var_type: String,
    value: Option<Value>,
    formula: Option<Value>,
    description: Option<String>,
    is_active: bool,
    version: i32,
    created_by: Uuid,
    updated_by: Option<Uuid>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
    deleted_at: Option<chrono::DateTime<Utc>>,
}

impl TryFrom<VariableRow> for StateVariable {
    type Error = ServiceError;

    fn try_from(row: VariableRow) -> Result<Self, Self::Error> {
        Ok(StateVariable {
            id: row.id,
            scope: row.scope.parse().map_err(|_| ServiceError::bad_request("unrecognized scope"))?,
            scope_id: row.scope_id,
            key: row.key,
            var_type: parse_var_type(&row.var_type)?,
            value: row.value,
            formula: row.formula,
            description: row.description,
            is_active: row.is_active,
            version: row.version,
            created_by: row.created_by,
            updated_by: row.updated_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

fn parse_var_type(s: &str) -> ServiceResult<VariableType> {
    match s {
        "STRING" => Ok(VariableType::String),
        "INTEGER" => Ok(VariableType::Integer),
        "FLOAT" => Ok(VariableType::Float),
        "BOOLEAN" => Ok(VariableType::Boolean),
        "JSON" => Ok(VariableType::Json),
        "DERIVED" => Ok(VariableType::Derived),
        other => Err(ServiceError::bad_request(format!("unrecognized variable type {other}"))),
    }
}

fn var_type_str(v: VariableType) -> &'static str {
    match v {
        VariableType::String => "STRING",
        VariableType::Integer => "INTEGER",
        VariableType::Float => "FLOAT",
        VariableType::Boolean => "BOOLEAN",
        VariableType::Json => "JSON",
        VariableType::Derived => "DERIVED",
    }
}

pub fn find_by_id(conn: &mut PgConnection, id: Uuid) -> ServiceResult<Option<StateVariable>> {
    use crate::schema::state_variables::dsl;

    let row: Option<VariableRow> = dsl::state_variables
        .filter(dsl::id.eq(id))
        .select((
            dsl::id, dsl::scope, dsl::scope_id, dsl::key, dsl::var_type, dsl::value, dsl::formula,
            dsl::description, dsl::is_active, dsl::version, dsl::created_by, dsl::updated_by,
            dsl::created_at, dsl::updated_at, dsl::deleted_at,
        ))
        .first(conn)
        .optional()?;

    row.map(StateVariable::try_from).transpose()
}

pub fn find_by_scope(conn: &mut PgConnection, scope: Scope, scope_id: Option<Uuid>) -> ServiceResult<Vec<StateVariable>> {
    use crate::schema::state_variables::dsl;

    let mut query = dsl::state_variables
        .filter(dsl::scope.eq(scope.as_ref()))
        .filter(dsl::deleted_at.is_null())
        .into_boxed();

    query = match scope_id {
        Some(id) => query.filter(dsl::scope_id.eq(id)),
        None => query.filter(dsl::scope_id.is_null()),
    };

    let rows: Vec<VariableRow> = query
        .select((
            dsl::id, dsl::scope, dsl::scope_id, dsl::key, dsl::var_type, dsl::value, dsl::formula,
            dsl::description, dsl::is_active, dsl::version, dsl::created_by, dsl::updated_by,
            dsl::created_at, dsl::updated_at, dsl::deleted_at,
        ))
        .load(conn)?;

    rows.into_iter().map(StateVariable::try_from).collect()
}

/// Every live variable visible within `campaign_id` (spec §4.9 `findMany`):
/// WORLD-scoped variables (no owning entity), the campaign's own
/// CAMPAIGN-scoped variables, and every variable scoped to an entity that
/// belongs to this campaign. `findByScope` answers "variables at exactly
/// this one scope"; `findMany` answers "every variable this campaign could
/// possibly evaluate against".
pub fn find_many(conn: &mut PgConnection, campaign_id: Uuid) -> ServiceResult<Vec<StateVariable>> {
    use crate::schema::state_variables::dsl;

    let mut scope_ids = vec![campaign_id];
    for entity_type in [
        EntityType::Kingdom,
        EntityType::Settlement,
        EntityType::Structure,
        EntityType::Party,
        EntityType::Character,
        EntityType::WorldEvent,
        EntityType::Encounter,
    ] {
        for row in crate::entity_store::find_by_campaign(conn, entity_type, campaign_id)? {
            if let Some(id) = row.get("id").and_then(Value::as_str).and_then(|s| s.parse::<Uuid>().ok()) {
                scope_ids.push(id);
            }
        }
    }

    let rows: Vec<VariableRow> = dsl::state_variables
        .filter(dsl::deleted_at.is_null())
        .filter(dsl::scope_id.is_null().or(dsl::scope_id.eq_any(scope_ids)))
        .select((
            dsl::id, dsl::scope, dsl::scope_id, dsl::key, dsl::var_type, dsl::value, dsl::formula,
            dsl::description, dsl::is_active, dsl::version, dsl::created_by, dsl::updated_by,
            dsl::created_at, dsl::updated_at, dsl::deleted_at,
        ))
        .load(conn)?;

    rows.into_iter().map(StateVariable::try_from).collect()
}

/// Resolves a variable's snapshot as of `world_time` on `branch_id` (spec
/// §4.9 `getAsOf`), the same "call the Version Store then decode" shape as
/// the generic entity store's `getAsOf` (spec §4.4).
pub fn get_as_of(
    conn: &mut PgConnection,
    id: Uuid,
    branch_id: Uuid,
    world_time: i64,
) -> ServiceResult<Option<StateVariable>> {
    match version_store::resolve_version(conn, EntityType::StateVariable, id, branch_id, world_time)? {
        Some(record) => Ok(Some(record.decode()?)),
        None => Ok(None),
    }
}

/// This variable's own recorded version history on `branch_id`, oldest
/// first (spec §4.9 `getHistory`). WORLD-scoped variables never accumulate
/// one since `update` skips versioning for them.
pub fn get_history(conn: &mut PgConnection, id: Uuid, branch_id: Uuid) -> ServiceResult<Vec<StateVariable>> {
    version_store::find_version_history(conn, EntityType::StateVariable, id, branch_id)?
        .iter()
        .map(|record| record.decode())
        .collect()
}

impl<'a> VariableService<'a> {
    /// Creates a variable. Derived variables are validated (shape, depth,
    /// and acyclicity against every other variable already in the same
    /// scope) before the insert; a cyclic formula is rejected outright
    /// rather than stored and caught later (spec §4.8, §4.9).
    pub fn create(
        &self,
        conn: &mut PgConnection,
        campaign_id: Uuid,
        mut candidate: StateVariable,
    ) -> ServiceResult<StateVariable> {
        candidate.validate_shape()?;
        if let Some(formula) = &candidate.formula {
            self.validate_formula_acyclic(conn, campaign_id, &candidate, formula)?;
        }

        let now = Utc::now();
        candidate.id = Uuid::new_v4();
        candidate.created_at = now;
        candidate.updated_at = now;
        candidate.version = 1;

        diesel::insert_into(state_variables::table)
            .values((
                state_variables::id.eq(candidate.id),
                state_variables::scope.eq(candidate.scope.as_ref()),
                state_variables::scope_id.eq(candidate.scope_id),
                state_variables::key.eq(&candidate.key),
                state_variables::var_type.eq(var_type_str(candidate.var_type)),
                state_variables::value.eq(&candidate.value),
                state_variables::formula.eq(&candidate.formula),
                state_variables::description.eq(&candidate.description),
                state_variables::is_active.eq(candidate.is_active),
                state_variables::version.eq(candidate.version),
                state_variables::created_by.eq(candidate.created_by),
                state_variables::created_at.eq(candidate.created_at),
                state_variables::updated_at.eq(candidate.updated_at),
            ))
            .execute(conn)?;

        audit::log(
            conn,
            EntityType::StateVariable,
            candidate.id,
            audit::AuditOperation::Create,
            candidate.created_by,
            audit::AuditParams {
                changes: serde_json::to_value(&candidate).unwrap_or(Value::Null),
                ..Default::default()
            },
        );

        self.cache.invalidate_graphs_for_campaign(campaign_id);
        self.event_bus.publish(Event::VariableCreated {
            variable_id: candidate.id,
            campaign_id,
            branch_id: None,
        });

        Ok(candidate)
    }

    /// Updates a variable's formula/value/description, enforcing the
    /// optimistic lock and, for derived variables, re-validating
    /// acyclicity since the new formula might introduce one.
    ///
    /// `versioning` is `Some((branchId, worldTime))` when the caller wants
    /// this edit recorded as a `VersionRecord` too (spec §4.9: "optional
    /// versioning, when `branchId` is provided and the variable is not
    /// WORLD-scoped"). WORLD-scoped variables never get one, matching
    /// §3 invariant 6, even if a caller passes `versioning`.
    pub fn update(
        &self,
        conn: &mut PgConnection,
        campaign_id: Uuid,
        id: Uuid,
        expected_version: i32,
        patch: Value,
        updated_by: Uuid,
        versioning: Option<(Uuid, i64)>,
    ) -> ServiceResult<StateVariable> {
        conn.transaction(|conn| {
            let mut current = find_by_id(conn, id)?.ok_or(ServiceError::NotFound)?;
            if current.version != expected_version {
                return Err(ServiceError::OptimisticLock { expected: expected_version, actual: current.version });
            }

            if let Some(v) = patch.get("value") { current.value = Some(v.clone()); }
            if let Some(f) = patch.get("formula") { current.formula = Some(f.clone()); }
            if patch.get("formula").map(|f| f.is_null()).unwrap_or(false) { current.formula = None; }
            if let Some(d) = patch.get("description").and_then(Value::as_str) { current.description = Some(d.to_string()); }
            if let Some(a) = patch.get("isActive").and_then(Value::as_bool) { current.is_active = a; }

            current.validate_shape()?;
            if let Some(formula) = current.formula.clone() {
                self.validate_formula_acyclic(conn, campaign_id, &current, &formula)?;
            }

            current.version = expected_version + 1;
            current.updated_at = Utc::now();
            current.updated_by = Some(updated_by);

            use crate::schema::state_variables::dsl;
            diesel::update(dsl::state_variables.filter(dsl::id.eq(id)))
                .set((
                    dsl::value.eq(&current.value),
                    dsl::formula.eq(&current.formula),
                    dsl::description.eq(&current.description),
                    dsl::is_active.eq(current.is_active),
                    dsl::version.eq(current.version),
                    dsl::updated_by.eq(current.updated_by),
                    dsl::updated_at.eq(current.updated_at),
                ))
                .execute(conn)?;

            if let Some((branch_id, world_time)) = versioning {
                if current.scope != Scope::World {
                    version_store::create_version(conn, EntityType::StateVariable, id, branch_id, world_time, &current, updated_by)?;
                }
            }

            audit::log(conn, EntityType::StateVariable, id, audit::AuditOperation::Update, updated_by, audit::AuditParams {
                changes: patch,
                ..Default::default()
            });

            self.cache.invalidate_graphs_for_campaign(campaign_id);
            self.cache.evict_computed_fields_for_entity("STATE_VARIABLE", id);
            self.event_bus.publish(Event::VariableUpdated { variable_id: id, campaign_id, branch_id: None });

            Ok(current)
        })
    }

    /// Flips `isActive` (spec §4.9 `toggleActive`) — a thin wrapper over
    /// [`VariableService::update`] since an active-flag flip follows
    /// exactly the same optimistic-lock/revalidate/audit/cache/event path
    /// as any other field update.
    pub fn toggle_active(
        &self,
        conn: &mut PgConnection,
        campaign_id: Uuid,
        id: Uuid,
        expected_version: i32,
        is_active: bool,
        updated_by: Uuid,
    ) -> ServiceResult<StateVariable> {
        self.update(conn, campaign_id, id, expected_version, serde_json::json!({"isActive": is_active}), updated_by, None)
    }

    pub fn delete(&self, conn: &mut PgConnection, campaign_id: Uuid, id: Uuid, deleted_by: Uuid) -> ServiceResult<()> {
        use crate::schema::state_variables::dsl;

        diesel::update(dsl::state_variables.filter(dsl::id.eq(id)))
            .set(dsl::deleted_at.eq(Some(Utc::now())))
            .execute(conn)?;

        audit::log(conn, EntityType::StateVariable, id, audit::AuditOperation::Delete, deleted_by, audit::AuditParams::default());

        self.cache.invalidate_graphs_for_campaign(campaign_id);
        self.event_bus.publish(Event::VariableDeleted { variable_id: id, campaign_id, branch_id: None });
        Ok(())
    }

    /// Builds (or reuses the cached) dependency graph for every variable in
    /// `campaign_id`'s scope tree and checks that adding/editing
    /// `candidate` with `formula` wouldn't introduce a cycle.
    fn validate_formula_acyclic(
        &self,
        conn: &mut PgConnection,
        campaign_id: Uuid,
        candidate: &StateVariable,
        formula: &Value,
    ) -> ServiceResult<()> {
        let validation = expr::validate_formula(formula);
        if !validation.is_valid {
            return Err(ServiceError::invalid_formula(validation.errors.join("; ")));
        }

        let mut siblings = find_by_scope(conn, candidate.scope, candidate.scope_id)?;
        siblings.retain(|v| v.id != candidate.id);
        siblings.push(candidate.clone());

        let graph = DependencyGraph::build(&siblings);
        if let Err(cycles) = graph.validate_no_cycles() {
            return Err(ServiceError::bad_request(format!(
                "formula introduces dependency cycles across variables {cycles:?}"
            )));
        }

        self.cache.put_graph(campaign_id, candidate.scope_id.unwrap_or(campaign_id), Arc::new(graph));
        Ok(())
    }

    /// Evaluates a variable: returns its static value directly, or runs its
    /// formula against the built context (spec §4.6, §4.7, §4.9).
    pub async fn evaluate(
        &self,
        conn: &mut PgConnection,
        variable: &StateVariable,
        extra_context: Option<Value>,
    ) -> ServiceResult<Value> {
        if !variable.var_type.is_derived() {
            return Ok(variable.value.clone().unwrap_or(Value::Null));
        }

        let formula = variable.formula.as_ref().ok_or_else(|| ServiceError::invalid_formula("derived variable has no formula"))?;
        let ctx: Context = expr::build_context(conn, variable.scope, variable.scope_id, extra_context);
        let outcome = expr::evaluate(formula, &ctx, self.operators).await;

        outcome.value.ok_or_else(|| ServiceError::invalid_formula(outcome.error.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::db::test_support::test_connection;
    use crate::event_bus::InProcessEventBus;
    use crate::expr::OperatorRegistry;
    use diesel::Connection;

    #[test]
    fn var_type_round_trips_through_its_string_form() {
        for vt in [VariableType::String, VariableType::Integer, VariableType::Float, VariableType::Boolean, VariableType::Json, VariableType::Derived] {
            assert_eq!(parse_var_type(var_type_str(vt)).unwrap(), vt);
        }
    }

    #[test]
    fn unrecognized_var_type_is_rejected() {
        assert!(parse_var_type("NOT_A_TYPE").is_err());
    }

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
            .values((
                branches::id.eq(branch_id),
                branches::campaign_id.eq(campaign_id),
                branches::name.eq("main"),
            ))
            .execute(conn)
            .unwrap();
        branch_id
    }

    fn static_candidate(campaign_id: Uuid, key: &str) -> StateVariable {
        let now = Utc::now();
        StateVariable {
            id: Uuid::new_v4(),
            scope: Scope::Campaign,
            scope_id: Some(campaign_id),
            key: key.to_string(),
            var_type: VariableType::Integer,
            value: Some(serde_json::json!(1)),
            formula: None,
            description: None,
            is_active: true,
            version: 1,
            created_by: Uuid::new_v4(),
            updated_by: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    #[ignore = "requires TEST_DATABASE_URL"]
    fn toggle_active_flips_the_flag_through_the_usual_update_path() {
        let mut conn = test_connection();
        conn.begin_test_transaction().unwrap();
        let cache = Cache::new();
        let bus = InProcessEventBus::default();
        let operators = OperatorRegistry::default();
        let svc = VariableService { cache: &cache, event_bus: &bus, operators: &operators };

        let campaign_id = seed_campaign(&mut conn);
        let created = svc.create(&mut conn, campaign_id, static_candidate(campaign_id, "active_flag")).unwrap();
        assert!(created.is_active);

        let toggled = svc.toggle_active(&mut conn, campaign_id, created.id, created.version, false, created.created_by).unwrap();
        assert!(!toggled.is_active);
        assert_eq!(toggled.version, created.version + 1);
    }

    #[test]
    #[ignore = "requires TEST_DATABASE_URL"]
    fn update_with_versioning_writes_a_version_record_for_non_world_scope() {
        let mut conn = test_connection();
        conn.begin_test_transaction().unwrap();
        let cache = Cache::new();
        let bus = InProcessEventBus::default();
        let operators = OperatorRegistry::default();
        let svc = VariableService { cache: &cache, event_bus: &bus, operators: &operators };

        let campaign_id = seed_campaign(&mut conn);
        let branch_id = seed_branch(&mut conn, campaign_id);
        let created = svc.create(&mut conn, campaign_id, static_candidate(campaign_id, "versioned")).unwrap();

        svc.update(
            &mut conn,
            campaign_id,
            created.id,
            created.version,
            serde_json::json!({"value": 2}),
            created.created_by,
            Some((branch_id, 10)),
        ).unwrap();

        let history = get_history(&mut conn, created.id, branch_id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].value, Some(serde_json::json!(2)));

        let resolved = get_as_of(&mut conn, created.id, branch_id, 10).unwrap();
        assert!(resolved.is_some());
    }

    #[test]
    #[ignore = "requires TEST_DATABASE_URL"]
    fn find_many_includes_world_scoped_and_campaign_scoped_variables() {
        let mut conn = test_connection();
        conn.begin_test_transaction().unwrap();
        let cache = Cache::new();
        let bus = InProcessEventBus::default();
        let operators = OperatorRegistry::default();
        let svc = VariableService { cache: &cache, event_bus: &bus, operators: &operators };

        let campaign_id = seed_campaign(&mut conn);
        let campaign_scoped = svc.create(&mut conn, campaign_id, static_candidate(campaign_id, "campaign_var")).unwrap();

        let mut world_var = static_candidate(campaign_id, "world_var");
        world_var.scope = Scope::World;
        world_var.scope_id = None;
        let world_scoped = svc.create(&mut conn, campaign_id, world_var).unwrap();

        let found = find_many(&mut conn, campaign_id).unwrap();
        let ids: Vec<Uuid> = found.iter().map(|v| v.id).collect();
        assert!(ids.contains(&campaign_scoped.id));
        assert!(ids.contains(&world_scoped.id));
    }
}
