use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Capacity reached: {0}")]
    Capacity(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("{0} is disabled")]
    Disabled(&'static str),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for failures of the storage collaborator, as opposed to caller mistakes.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Error::Persistence(_) | Error::Database(_) | Error::Migration(_) | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_classification() {
        assert!(Error::Persistence("timeout".to_string()).is_persistence());
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_persistence());
        assert!(!Error::NotFound("dev-1".to_string()).is_persistence());
        assert!(!Error::Validation("empty id".to_string()).is_persistence());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Error::Disabled("analytics").to_string(),
            "analytics is disabled"
        );
        assert_eq!(
            Error::State("alert a1 is not active".to_string()).to_string(),
            "Invalid state: alert a1 is not active"
        );
    }
}
