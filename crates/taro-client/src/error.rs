// Client-side error wrapper

use taro_common::TaroError;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    /// Typed error signal from the coordinator
    #[error(transparent)]
    Coordinator(#[from] TaroError),

    #[error("session closed: {0}")]
    Closed(String),
}

impl ClientError {
    /// The coordinator-side error, if this wraps one
    pub fn as_coordinator_error(&self) -> Option<&TaroError> {
        match self {
            ClientError::Coordinator(err) => Some(err),
            ClientError::Closed(_) => None,
        }
    }
}
