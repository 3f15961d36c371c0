//! Matrix client-server API errors.

/// Error returned by intent operations.
#[derive(Debug, thiserror::Error)]
pub enum MatrixError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Homeserver returned {status} {errcode}: {error}")]
    Api {
        status: u16,
        errcode: String,
        error: String,
    },

    #[error("Homeserver response was missing {0}")]
    MissingField(&'static str),
}

impl MatrixError {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Api { errcode, .. } if errcode == "M_FORBIDDEN")
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Api { errcode, status, .. } if errcode == "M_NOT_FOUND" || *status == 404
        )
    }

    pub fn is_user_in_use(&self) -> bool {
        matches!(self, Self::Api { errcode, .. } if errcode == "M_USER_IN_USE")
    }
}

pub type MatrixResult<T> = Result<T, MatrixError>;
