//! Concrete custom operators built on top of [`super::registry::OperatorRegistry`].
//!
//! These are aggregate lookups formulas can't express with `var` alone
//! (spec §4.6's "custom operators" extension point) — e.g. counting a
//! settlement's structures. Each operator owns a pool handle rather than a
//! connection, since the registry itself is shared and long-lived.

use std::sync::Arc;

use async_trait::async_trait;
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use crate::db::DbPool;

use super::context::Context;
use super::registry::{Operator, OperatorRegistry};

/// `{"structureCount": [settlementId]}` — or `{"structureCount": [settlementId, structureType]}`
/// to filter by type. Counts live (non-deleted) structures.
pub struct StructureCountOperator {
    pool: Arc<DbPool>,
}

impl StructureCountOperator {
    pub fn new(pool: Arc<DbPool>) -> Self {
        StructureCountOperator { pool }
    }
}

#[async_trait]
impl Operator for StructureCountOperator {
    async fn call(&self, args: Vec<Value>, _ctx: &Context) -> Result<Value, anyhow::Error> {
        let settlement_id: Uuid = args
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("structureCount requires a settlement id"))?
            .parse()?;
        let structure_type = args.get(1).and_then(|v| v.as_str()).map(str::to_owned);

        let mut conn = self.pool.get()?;
        let count = count_structures(&mut conn, settlement_id, structure_type)?;
        Ok(Value::from(count))
    }
}

fn count_structures(
    conn: &mut PgConnection,
    settlement_id: Uuid,
    structure_type: Option<String>,
) -> diesel::result::QueryResult<i64> {
    use crate::schema::structures::dsl;

    let mut query = dsl::structures
        .filter(dsl::settlement_id.eq(settlement_id))
        .filter(dsl::deleted_at.is_null())
        .into_boxed();

    if let Some(ty) = structure_type {
        query = query.filter(dsl::structure_type.eq(ty));
    }

    query.count().get_result(conn)
}

/// `{"partyMemberCount": [partyId]}` — counts live characters in a party.
pub struct PartyMemberCountOperator {
    pool: Arc<DbPool>,
}

impl PartyMemberCountOperator {
    pub fn new(pool: Arc<DbPool>) -> Self {
        PartyMemberCountOperator { pool }
    }
}

#[async_trait]
impl Operator for PartyMemberCountOperator {
    async fn call(&self, args: Vec<Value>, _ctx: &Context) -> Result<Value, anyhow::Error> {
        let party_id: Uuid = args
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("partyMemberCount requires a party id"))?
            .parse()?;

        let mut conn = self.pool.get()?;
        use crate::schema::characters::dsl;
        let count: i64 = dsl::characters
            .filter(dsl::party_id.eq(party_id))
            .filter(dsl::deleted_at.is_null())
            .count()
            .get_result(&mut conn)?;
        Ok(Value::from(count))
    }
}

/// Registers every operator this crate ships with.
pub fn register_default_operators(registry: &mut OperatorRegistry, pool: Arc<DbPool>) {
    registry.register("structureCount", Arc::new(StructureCountOperator::new(pool.clone())));
    registry.register("partyMemberCount", Arc::new(PartyMemberCountOperator::new(pool)));
}

// Operator execution needs a live database, so coverage for
// StructureCountOperator/PartyMemberCountOperator/register_default_operators
// lives with the variables.rs integration tests instead of here.
