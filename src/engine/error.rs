use thiserror::Error;
use ulid::Ulid;

use crate::model::ProposalId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no authenticated user")]
    Unauthenticated,
    #[error("not allowed: {0}")]
    Unauthorized(&'static str),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("invalid request: {0}")]
    Invalid(&'static str),
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),
    #[error("conflict: {0}")]
    Conflict(&'static str),
    #[error("window of proposal {0} has already ended")]
    Stale(ProposalId),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Unauthenticated => "28000",
            EngineError::Unauthorized(_) => "42501",
            EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::Invalid(_) => "22023",
            EngineError::InvalidTransition(_) => "55000",
            EngineError::Conflict(_) => "23P01",
            EngineError::Stale(_) => "25P03",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }
}
