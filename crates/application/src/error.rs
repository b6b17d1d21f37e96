use domain::{DomainError, RepositoryError};
use thiserror::Error;

use crate::hub::HubError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("hub error: {0}")]
    Hub(#[from] HubError),
}
