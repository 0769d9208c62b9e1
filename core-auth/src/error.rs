use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Token endpoint unreachable: {0}")]
    NetworkError(String),

    #[error("Token endpoint returned HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("Invalid grant: {0}")]
    InvalidGrant(String),
}

impl AuthError {
    /// Whether asking again later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::NetworkError(_) => true,
            AuthError::HttpStatus { status } => *status >= 500 || *status == 429,
            AuthError::InvalidGrant(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
