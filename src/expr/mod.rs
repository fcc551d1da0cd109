//! Formula evaluation: the expression language (C6), its extensibility
//! point (the operator registry), and the context it evaluates against (C7).

pub mod context;
pub mod evaluator;
pub mod operators;
pub mod registry;

pub use context::{build_context, Context};
pub use evaluator::{
    evaluate, evaluate_with_trace, validate_formula, EvaluationOutcome, FormulaError, FormulaResult,
    TraceStep, ValidationResult, MAX_FORMULA_DEPTH,
};
pub use registry::{Operator, OperatorRegistry};
