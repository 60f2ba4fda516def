use thiserror::Error;

/// Errors from durable state store operations (used by the store trait in
/// cadence-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("entity not found")]
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");

        let err = RepositoryError::Serialization("bad json".to_string());
        assert_eq!(err.to_string(), "serialization error: bad json");
    }
}
