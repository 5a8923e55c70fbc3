use reqwest::StatusCode;

/// Failure to establish or renew a session.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The account has a home whose name the cloud API refuses to resolve.
    /// The home must be renamed in the Phyn app.
    #[error("Home '{0}' uses a reserved name; rename it in the Phyn app")]
    ReservedHomeName(String),

    /// The identity provider refused the request for a reason other than the
    /// credentials, such as an unknown client id.
    #[error("Authentication request rejected: {0}")]
    Rejected(String),

    #[error("Authentication service unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a single API call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Network or server trouble expected to clear on its own.
    #[error("Transient API error: {0}")]
    Transient(String),

    /// The session is no longer accepted; a new login is required.
    #[error("API authentication failed: {0}")]
    Auth(String),

    /// The server understood the request and refused it.
    #[error("API request rejected: {0}")]
    Rejected(String),
}

impl ApiError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: StatusCode, context: &str) -> Self {
        let message = format!("{} returned {}", context, status);
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            ApiError::Auth(message)
        } else if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            ApiError::Transient(message)
        } else {
            ApiError::Rejected(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => ApiError::from_status(status, "request"),
            // Timeouts, connection resets and undecodable bodies all clear up
            // (or not) on the next poll.
            None => ApiError::Transient(e.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Unavailable(msg) => ApiError::Transient(msg),
            other => ApiError::Auth(other.to_string()),
        }
    }
}
