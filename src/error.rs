use std::borrow::Cow;

use sqlx::error::ErrorKind;

/// Errors surfaced by the draw engine and its store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Session {0} does not exist")]
    SessionNotFound(i64),

    #[error("Session {0} is not active")]
    SessionNotActive(i64),

    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    #[error("{0} has already picked")]
    AlreadyPicked(String),

    #[error("No participants are available to pick")]
    NoParticipantsAvailable,

    #[error("A participant cannot be assigned to themselves")]
    CannotSelfAssign,

    #[error("{0} is already registered in this session")]
    DuplicateEmail(String),

    /// The session is locked by another pick or removal. Callers may retry.
    #[error("Session is busy, please retry")]
    Busy,

    /// The assignment graph would break its invariants. The detail is logged, never shown.
    #[error("Internal consistency failure")]
    Integrity(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy)
    }

    /// Build an integrity error, logging its detail.
    pub fn integrity(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        log::error!("Assignment graph integrity violation: {}", detail);
        Error::Integrity(detail)
    }
}

/// SQLite primary result codes for a locked database.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

fn is_sqlite_busy(code: Option<Cow<'_, str>>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        // Extended codes keep the primary code in the low byte.
        .map(|c| matches!(c & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
        .unwrap_or(false)
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        let busy = match &err {
            sqlx::Error::PoolTimedOut => true,
            sqlx::Error::Database(db_err) => is_sqlite_busy(db_err.code()),
            _ => false,
        };

        if busy {
            Error::Busy
        } else {
            Error::Database(err)
        }
    }
}

/// Maps a failed edge write. Constraint violations mean the graph invariants were broken.
pub fn map_edge_write(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.kind() {
            ErrorKind::UniqueViolation
            | ErrorKind::CheckViolation
            | ErrorKind::ForeignKeyViolation => {
                return Error::integrity(format!("edge write rejected by store: {}", db_err))
            }
            _ => {}
        }
    }
    err.into()
}

/// Maps a failed participant insert. A unique violation is a duplicate email in the session.
pub fn map_participant_insert(err: sqlx::Error, email: &str) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if matches!(db_err.kind(), ErrorKind::UniqueViolation) {
            return Error::DuplicateEmail(email.to_owned());
        }
    }
    err.into()
}

pub type Result<T> = std::result::Result<T, Error>;
