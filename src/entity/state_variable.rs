use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Scope;
use crate::error::{ServiceError, ServiceResult};

/// A `StateVariable`'s storage kind (spec §3). `Derived` variables carry a
/// formula instead of a value; every other kind carries a value and no
/// formula (invariant 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableType {
    String,
    Integer,
    Float,
    Boolean,
    Json,
    Derived,
}

impl VariableType {
    pub fn is_derived(self) -> bool {
        matches!(self, VariableType::Derived)
    }
}

/// A scoped variable, static or derived (spec §3). Uniqueness of
/// `(scope, scope_id, key)` among non-deleted rows is enforced at the
/// storage layer (a partial unique index), not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVariable {
    pub id: Uuid,
    pub scope: Scope,
    pub scope_id: Option<Uuid>,
    pub key: String,
    pub var_type: VariableType,
    pub value: Option<serde_json::Value>,
    pub formula: Option<serde_json::Value>,
    pub description: Option<String>,
    pub is_active: bool,
    pub version: i32,
    pub created_by: Uuid,
    pub updated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StateVariable {
    /// Enforces invariants 5 and 6: a derived variable has a formula and no
    /// value; a static variable has a value and no formula; WORLD-scoped
    /// variables have no `scope_id`.
    pub fn validate_shape(&self) -> ServiceResult<()> {
        if self.scope.requires_scope_id() && self.scope_id.is_none() {
            return Err(ServiceError::bad_request(format!(
                "scope {:?} requires a scope_id",
                self.scope
            )));
        }
        if !self.scope.requires_scope_id() && self.scope_id.is_some() {
            return Err(ServiceError::bad_request("WORLD-scoped variables must not carry a scope_id"));
        }
        match self.var_type {
            VariableType::Derived => {
                if self.formula.is_none() {
                    return Err(ServiceError::invalid_formula("derived variable requires a formula"));
                }
                if self.value.is_some() {
                    return Err(ServiceError::bad_request("derived variable must not carry a static value"));
                }
            }
            _ => {
                if self.formula.is_some() {
                    return Err(ServiceError::bad_request("static variable must not carry a formula"));
                }
            }
        }
        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(var_type: VariableType) -> StateVariable {
        StateVariable {
            id: Uuid::new_v4(),
            scope: Scope::Settlement,
            scope_id: Some(Uuid::new_v4()),
            key: "population".into(),
            var_type,
            value: None,
            formula: None,
            description: None,
            is_active: true,
            version: 1,
            created_by: Uuid::new_v4(),
            updated_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn derived_without_formula_is_rejected() {
        let v = base(VariableType::Derived);
        assert!(v.validate_shape().is_err());
    }

    #[test]
    fn derived_with_formula_and_no_value_is_valid() {
        let mut v = base(VariableType::Derived);
        v.formula = Some(serde_json::json!({"var": "settlement.population"}));
        assert!(v.validate_shape().is_ok());
    }

    #[test]
    fn static_with_formula_is_rejected() {
        let mut v = base(VariableType::Integer);
        v.value = Some(serde_json::json!(10));
        v.formula = Some(serde_json::json!({"var": "x"}));
        assert!(v.validate_shape().is_err());
    }

    #[test]
    fn world_scope_with_scope_id_is_rejected() {
        let mut v = base(VariableType::Integer);
        v.scope = Scope::World;
        v.value = Some(serde_json::json!(1));
        assert!(v.validate_shape().is_err());
    }
}
