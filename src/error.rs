use thiserror::Error;

use crate::scheduler::ScheduleError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("stored timestamp '{0}' is not valid RFC 3339")]
    InvalidTimestamp(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn card_not_found(id: i64) -> Self {
        Error::NotFound(format!("card {}", id))
    }

    pub fn deck_not_found(id: i64) -> Self {
        Error::NotFound(format!("deck {}", id))
    }

    /// Rejected caller input, as opposed to a storage or I/O failure.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::Schedule(_) | Error::Validation(_) | Error::NotFound(_)
        )
    }
}
