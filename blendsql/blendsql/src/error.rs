//! Error type for the orchestrator. Used internally and exposed at the crate
//! root.

use std::fmt::Display;

/// A blendsql error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The query mutates database state, or could not be parsed even after
    /// autowrapping.
    InvalidQuery(String),
    /// The grammar matched an ingredient name absent from the Kitchen.
    UnknownIngredient(String),
    /// Two ingredients registered under one (case-insensitive) name.
    DuplicateIngredient(String),
    /// The backend refused a statement; the message is surfaced verbatim.
    Backend(String),
    /// An ingredient body failed.
    Ingredient { name: String, message: String },
    /// An internal invariant did not hold (e.g. a row-index mismatch while
    /// merging map outputs).
    InvariantViolation(String),
}

impl Error {
    pub fn invalid_query<S: ToString>(reason: S) -> Self {
        Error::InvalidQuery(reason.to_string())
    }

    pub fn backend<S: ToString>(reason: S) -> Self {
        Error::Backend(reason.to_string())
    }

    pub fn ingredient<S: ToString>(name: &str, reason: S) -> Self {
        Error::Ingredient {
            name: name.to_string(),
            message: reason.to_string(),
        }
    }

    /// Used for things that should never happen, but are checked anyway.
    pub fn invariant<S: ToString>(details: S) -> Self {
        Error::InvariantViolation(details.to_string())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidQuery(reason) => write!(f, "invalid query: {reason}"),
            Error::UnknownIngredient(name) => {
                write!(f, "ingredient `{name}` called, but not found among the passed ingredients")
            }
            Error::DuplicateIngredient(name) => {
                write!(f, "duplicate ingredient name `{name}` (names are case-insensitive)")
            }
            Error::Backend(reason) => write!(f, "backend error: {reason}"),
            Error::Ingredient { name, message } => {
                write!(f, "ingredient `{name}` failed: {message}")
            }
            Error::InvariantViolation(details) => {
                write!(f, "internal invariant violated; {details}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        Error::Backend(error.to_string())
    }
}
