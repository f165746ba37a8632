use thiserror::Error;

/// Failure of a single graph store operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Write-write collision (e.g. deadlock). Expected to succeed on retry.
    #[error("Transient conflict: {0}")]
    Conflict(String),

    /// A uniqueness constraint rejected the write; another writer got there first.
    #[error("Duplicate node: {0}")]
    Duplicate(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<neo4rs::Error> for StoreError {
    fn from(e: neo4rs::Error) -> Self {
        classify(&format!("{e} {e:?}"), e.to_string())
    }
}

/// Map a driver error onto the store taxonomy using the Neo4j status code text.
fn classify(haystack: &str, message: String) -> StoreError {
    if haystack.contains("Neo.TransientError") || haystack.contains("DeadlockDetected") {
        StoreError::Conflict(message)
    } else if haystack.contains("ConstraintValidationFailed")
        || haystack.contains("already exists with label")
    {
        StoreError::Duplicate(message)
    } else {
        let lower = haystack.to_lowercase();
        if lower.contains("connection")
            || lower.contains("broken pipe")
            || lower.contains("ioerror")
            || lower.contains("io error")
        {
            StoreError::Unavailable(message)
        } else {
            StoreError::Query(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlock_is_a_conflict() {
        let e = classify(
            "Neo4j(Neo4jError { code: \"Neo.TransientError.Transaction.DeadlockDetected\" })",
            "deadlock".into(),
        );
        assert!(e.is_transient());
    }

    #[test]
    fn constraint_violation_is_a_duplicate() {
        let e = classify(
            "Neo.ClientError.Schema.ConstraintValidationFailed: Node(12) already exists with label `Post`",
            "dup".into(),
        );
        assert_eq!(e, StoreError::Duplicate("dup".into()));
        assert!(!e.is_transient());
    }

    #[test]
    fn connection_failures_are_unavailable() {
        let e = classify("ConnectionError", "down".into());
        assert_eq!(e, StoreError::Unavailable("down".into()));
    }

    #[test]
    fn everything_else_is_a_query_error() {
        let e = classify("Neo.ClientError.Statement.SyntaxError", "bad".into());
        assert_eq!(e, StoreError::Query("bad".into()));
    }
}
