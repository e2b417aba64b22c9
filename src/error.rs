//! Error types for the benchmark harness.
//!
//! Protocol failures keep their `PgError` shape; the harness adds the step
//! or statement it was working on.

use thiserror::Error;

use crate::pg::{BuildError, PgError};

#[derive(Error, Debug)]
pub enum BenchError {
    #[error(transparent)]
    Pg(PgError),

    #[error("Seeding failed at step {step:?}: {source}")]
    Seed {
        step: &'static str,
        #[source]
        source: PgError,
    },

    #[error("Cannot build query buffer for {statement:?}: {source}")]
    Build {
        statement: String,
        #[source]
        source: BuildError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Statement {0:?} is not prepared")]
    UnknownStatement(String),
}

impl From<PgError> for BenchError {
    fn from(err: PgError) -> Self {
        match err {
            PgError::Config(msg) => BenchError::Config(msg),
            other => BenchError::Pg(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;
