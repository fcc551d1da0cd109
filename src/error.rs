use thiserror::Error;

/// Reasons a request is rejected before it ever touches storage.
///
/// Kept separate from [`ServiceError`] so call sites that only care about
/// "is this formula/scope/ancestry malformed" don't have to match the
/// outer enum's other arms.
#[derive(Debug, Clone, Error)]
pub enum BadRequestKind {
    #[error("formula is invalid: {0}")]
    InvalidFormula(String),

    #[error("formula nesting exceeds the maximum depth of {max}")]
    FormulaTooDeep { max: u32 },

    #[error("branches {branch_a} and {target} have no common ancestor")]
    NoCommonAncestor { branch_a: uuid::Uuid, target: uuid::Uuid },

    #[error("scope {0} does not support this operation")]
    BadScope(&'static str),

    #[error("location entities are world-scoped and cannot be versioned or bound to a campaign")]
    LocationWorldMismatch,

    #[error("{0}")]
    Message(String),
}

/// The full set of errors every public operation in this crate can return.
///
/// Mirrors spec §7 one-to-one. `MergeConflict` deliberately has no variant
/// here: per spec it is a structured, non-error return value of the merge
/// operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not found")]
    NotFound,

    #[error("forbidden")]
    Forbidden,

    #[error("bad request: {0}")]
    BadRequest(#[from] BadRequestKind),

    #[error("optimistic lock failed: expected version {expected}, actual {actual}")]
    OptimisticLock { expected: i32, actual: i32 },

    #[error("internal error")]
    Internal,
}

impl ServiceError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ServiceError::BadRequest(BadRequestKind::Message(msg.into()))
    }

    pub fn invalid_formula(msg: impl Into<String>) -> Self {
        ServiceError::BadRequest(BadRequestKind::InvalidFormula(msg.into()))
    }

    pub fn bad_scope(scope: &'static str) -> Self {
        ServiceError::BadRequest(BadRequestKind::BadScope(scope))
    }
}

/// Wraps a lower-level error, logs it with context, and erases it to the
/// stable, contentless `Internal` code so callers never see raw SQL or
/// serialization failures (spec §7).
pub fn internal(context: &str, err: impl std::fmt::Display) -> ServiceError {
    log::error!("internal error in {context}: {err}");
    ServiceError::Internal
}

impl From<diesel::result::Error> for ServiceError {
    fn from(err: diesel::result::Error) -> Self {
        internal("diesel", err)
    }
}

impl From<diesel::r2d2::PoolError> for ServiceError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        internal("connection pool", err)
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        internal("serde_json", err)
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_wraps_kind() {
        let err = ServiceError::bad_scope("LOCATION");
        assert_eq!(err.to_string(), "bad request: scope LOCATION does not support this operation");
    }

    #[test]
    fn optimistic_lock_carries_both_versions() {
        let err = ServiceError::OptimisticLock { expected: 5, actual: 6 };
        assert_eq!(err.to_string(), "optimistic lock failed: expected version 5, actual 6");
    }
}
