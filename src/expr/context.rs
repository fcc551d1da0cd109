//! Context Builder (spec §4.7, component C7).

use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use crate::entity::Scope;

/// The dynamic environment a formula is evaluated against: a JSON object
/// exposing the scope entity under its lowercase scope name (so
/// `{"var": "settlement.population"}` resolves) plus whatever `extra`
/// fields the caller merged on top.
#[derive(Debug, Clone, Default)]
pub struct Context {
    root: Value,
}

impl Context {
    pub fn new(root: Value) -> Self {
        Context { root }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Resolves a dotted path (e.g. `"settlement.population"`) through
    /// nested maps. Missing keys yield `Value::Null` rather than an error
    /// (spec §4.6: "missing keys yield nil").
    pub fn resolve(&self, dotted_path: &str) -> Value {
        let mut current = &self.root;
        for segment in dotted_path.split('.') {
            match current.get(segment) {
                Some(next) => current = next,
                None => return Value::Null,
            }
        }
        current.clone()
    }
}

/// Given `(scope, scope_id, extra)`, builds the evaluation environment.
///
/// For WORLD, returns `extra` (or an empty object). Otherwise fetches the
/// scope entity and exposes it under the lowercase scope name, with `extra`
/// merged on top so caller-supplied fields win ties. Entity lookup
/// failures yield an empty context rather than propagating — the
/// evaluator must never throw because a context couldn't be built (spec
/// §4.7).
pub fn build_context(
    conn: &mut PgConnection,
    scope: Scope,
    scope_id: Option<Uuid>,
    extra: Option<Value>,
) -> Context {
    let extra = extra.unwrap_or_else(|| Value::Object(Default::default()));

    if scope == Scope::World {
        return Context::new(extra);
    }

    let Some(scope_id) = scope_id else {
        return Context::new(extra);
    };

    let entity_json = match fetch_scope_entity(conn, scope, scope_id) {
        Ok(Some(v)) => v,
        _ => return Context::new(extra),
    };

    let key = scope_key(scope);
    let mut root = serde_json::Map::new();
    root.insert(key.to_string(), entity_json);
    merge_extra(&mut root, extra);
    Context::new(Value::Object(root))
}

fn merge_extra(root: &mut serde_json::Map<String, Value>, extra: Value) {
    if let Value::Object(extra_map) = extra {
        for (k, v) in extra_map {
            root.insert(k, v);
        }
    }
}

fn scope_key(scope: Scope) -> &'static str {
    match scope {
        Scope::World => "world",
        Scope::Campaign => "campaign",
        Scope::Party => "party",
        Scope::Kingdom => "kingdom",
        Scope::Settlement => "settlement",
        Scope::Structure => "structure",
        Scope::Character => "character",
        Scope::Location => "location",
        Scope::Event => "event",
        Scope::Encounter => "encounter",
    }
}

/// Fetches the raw JSON for the scope entity. Sub-entity aggregates (e.g.
/// structure counts per settlement) are deliberately not assembled here —
/// operators that need them fetch inside their own handler (spec §4.7).
fn fetch_scope_entity(
    conn: &mut PgConnection,
    scope: Scope,
    scope_id: Uuid,
) -> diesel::result::QueryResult<Option<Value>> {
    macro_rules! fetch {
        ($table:ident, $dsl_id:ident) => {{
            use crate::schema::$table::dsl;
            let row: Option<Value> = dsl::$table
                .filter(dsl::$dsl_id.eq(scope_id))
                .select(diesel::dsl::sql::<diesel::sql_types::Jsonb>(concat!(
                    "to_jsonb(", stringify!($table), ".*)"
                )))
                .first(conn)
                .optional()?;
            row
        }};
    }

    let value = match scope {
        Scope::World | Scope::Campaign => return Ok(None),
        Scope::Party => fetch!(parties, id),
        Scope::Kingdom => fetch!(kingdoms, id),
        Scope::Settlement => fetch!(settlements, id),
        Scope::Structure => fetch!(structures, id),
        Scope::Character => fetch!(characters, id),
        Scope::Location => fetch!(locations, id),
        Scope::Event => fetch!(world_events, id),
        Scope::Encounter => fetch!(encounters, id),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn world_context_is_extra_verbatim() {
        let ctx = Context::new(serde_json::json!({"foo": 1}));
        assert_eq!(ctx.resolve("foo"), serde_json::json!(1));
    }

    #[test]
    fn resolve_missing_path_is_null() {
        let ctx = Context::new(serde_json::json!({"settlement": {"population": 100}}));
        assert_eq!(ctx.resolve("settlement.wealth"), Value::Null);
    }

    #[test]
    fn resolve_dotted_path_through_nested_maps() {
        let ctx = Context::new(serde_json::json!({"settlement": {"population": 100}}));
        assert_eq!(ctx.resolve("settlement.population"), serde_json::json!(100));
    }

    #[test]
    fn scope_key_matches_lowercase_scope_name() {
        assert_eq!(scope_key(Scope::Settlement), "settlement");
        assert_eq!(scope_key(Scope::World), "world");
    }
}
