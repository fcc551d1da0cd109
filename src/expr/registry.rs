//! Custom operator registry (spec §4.6: "the operator set is extensible;
//! custom operators may be registered by name and may be asynchronous").

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::context::Context;

/// A named operator beyond the evaluator's built-ins. Handlers receive
/// their already-evaluated argument list (not the raw formula), so they
/// never need to recurse into the evaluator themselves.
#[async_trait]
pub trait Operator: Send + Sync {
    async fn call(&self, args: Vec<Value>, ctx: &Context) -> Result<Value, anyhow::Error>;
}

#[async_trait]
impl<F> Operator for F
where
    F: Fn(Vec<Value>, &Context) -> Result<Value, anyhow::Error> + Send + Sync,
{
    async fn call(&self, args: Vec<Value>, ctx: &Context) -> Result<Value, anyhow::Error> {
        self(args, ctx)
    }
}

#[derive(Default, Clone)]
pub struct OperatorRegistry {
    operators: HashMap<String, Arc<dyn Operator>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        OperatorRegistry::default()
    }

    pub fn register(&mut self, name: impl Into<String>, op: Arc<dyn Operator>) {
        self.operators.insert(name.into(), op);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Operator>> {
        self.operators.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_sync_closure_is_callable() {
        let mut registry = OperatorRegistry::new();
        registry.register("double", Arc::new(|args: Vec<Value>, _ctx: &Context| {
            let n = args.first().and_then(|v| v.as_f64()).unwrap_or(0.0);
            Ok(Value::from(n * 2.0))
        }));

        let op = registry.get("double").expect("registered");
        let ctx = Context::new(Value::Null);
        let result = op.call(vec![Value::from(21.0)], &ctx).await.unwrap();
        assert_eq!(result, Value::from(42.0));
    }

    #[test]
    fn unknown_operator_is_absent() {
        let registry = OperatorRegistry::new();
        assert!(!registry.contains("nope"));
    }
}
