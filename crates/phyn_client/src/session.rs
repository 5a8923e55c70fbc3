use std::time::Duration;
use std::time::Instant;

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::ApiError;
use crate::error::AuthError;

/// Cognito speaks the AWS JSON 1.1 protocol rather than plain JSON.
const COGNITO_CONTENT_TYPE: &str = "application/x-amz-json-1.1";

/// Cognito error types that mean the username or password is wrong.
const CREDENTIAL_ERRORS: &[&str] = &["NotAuthorizedException", "UserNotFoundException"];

/// Tokens are renewed this long before they actually expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Account credentials captured by the host during setup.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An authenticated session.
#[derive(Debug, Clone)]
struct Session {
    id_token: String,
    refresh_token: Option<String>,
    expires_at: Instant,
}

impl Session {
    fn needs_refresh(&self) -> bool {
        Instant::now() + REFRESH_MARGIN >= self.expires_at
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateAuthRequest<'a> {
    auth_flow: &'a str,
    client_id: &'a str,
    auth_parameters: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateAuthResponse {
    authentication_result: AuthenticationResult,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthenticationResult {
    id_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
}

#[derive(Deserialize)]
struct CognitoError {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Owns the session and renews it transparently.
///
/// Logs in with `USER_PASSWORD_AUTH`, renews with `REFRESH_TOKEN_AUTH` ahead
/// of expiry, and falls back to a fresh login when the refresh token is
/// refused.
pub(crate) struct SessionManager {
    http: reqwest::Client,
    auth_url: String,
    client_id: String,
    credentials: Credentials,
    session: Mutex<Option<Session>>,
}

impl SessionManager {
    pub(crate) fn new(
        http: reqwest::Client,
        auth_url: String,
        client_id: String,
        credentials: Credentials,
    ) -> Self {
        Self {
            http,
            auth_url,
            client_id,
            credentials,
            session: Mutex::new(None),
        }
    }

    pub(crate) fn username(&self) -> &str {
        &self.credentials.username
    }

    /// Return a valid id token, logging in or refreshing as needed.
    pub(crate) async fn token(&self) -> Result<String, AuthError> {
        // Held across the network call so concurrent device polls trigger a
        // single renewal.
        let mut guard = self.session.lock().await;

        let renewed = match guard.as_ref() {
            Some(session) if !session.needs_refresh() => return Ok(session.id_token.clone()),
            Some(Session {
                refresh_token: Some(refresh_token),
                ..
            }) => match self.refresh(refresh_token).await {
                Ok(session) => session,
                Err(AuthError::InvalidCredentials(reason)) => {
                    warn!("Session refresh refused ({}), logging in again", reason);
                    self.login().await?
                }
                Err(e) => return Err(e),
            },
            _ => self.login().await?,
        };

        let token = renewed.id_token.clone();
        *guard = Some(renewed);
        Ok(token)
    }

    /// Drop the current session and log in again with the stored credentials.
    pub(crate) async fn reauthenticate(&self) -> Result<(), AuthError> {
        let mut guard = self.session.lock().await;
        *guard = None;
        let session = self.login().await?;
        *guard = Some(session);
        Ok(())
    }

    async fn login(&self) -> Result<Session, AuthError> {
        info!("Logging in to Phyn as {}", self.credentials.username);
        let params = serde_json::json!({
            "USERNAME": self.credentials.username,
            "PASSWORD": self.credentials.password,
        });
        self.initiate_auth("USER_PASSWORD_AUTH", params, None).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, AuthError> {
        debug!("Refreshing Phyn session");
        let params = serde_json::json!({ "REFRESH_TOKEN": refresh_token });
        self.initiate_auth("REFRESH_TOKEN_AUTH", params, Some(refresh_token))
            .await
    }

    async fn initiate_auth(
        &self,
        flow: &str,
        auth_parameters: serde_json::Value,
        previous_refresh_token: Option<&str>,
    ) -> Result<Session, AuthError> {
        let request = InitiateAuthRequest {
            auth_flow: flow,
            client_id: &self.client_id,
            auth_parameters,
        };

        let body = serde_json::to_vec(&request)
            .map_err(|e| AuthError::Unavailable(format!("unencodable auth request: {}", e)))?;
        let response = self
            .http
            .post(&self.auth_url)
            .header(CONTENT_TYPE, COGNITO_CONTENT_TYPE)
            .header("X-Amz-Target", "AWSCognitoIdentityProviderService.InitiateAuth")
            .body(body)
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let err: CognitoError = response.json().await.unwrap_or(CognitoError {
                kind: String::new(),
                message: String::new(),
            });
            return Err(auth_failure(flow, status, err));
        }

        let body: InitiateAuthResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Unavailable(format!("malformed auth response: {}", e)))?;
        let result = body.authentication_result;

        Ok(Session {
            id_token: result.id_token,
            // Refresh responses do not rotate the refresh token.
            refresh_token: result
                .refresh_token
                .or_else(|| previous_refresh_token.map(String::from)),
            expires_at: Instant::now() + Duration::from_secs(result.expires_in),
        })
    }
}

/// Classify a refused `InitiateAuth` call.
///
/// Only Cognito's credential errors mean the login itself is wrong; any
/// other refusal is classified by its HTTP status.
fn auth_failure(flow: &str, status: StatusCode, err: CognitoError) -> AuthError {
    // Types may carry a namespace prefix, e.g. `com.amazonaws...#NotAuthorizedException`.
    let kind = err.kind.rsplit('#').next().unwrap_or_default();
    let detail = match (kind.is_empty(), err.message.is_empty()) {
        (true, _) => status.to_string(),
        (false, true) => kind.to_string(),
        (false, false) => format!("{}: {}", kind, err.message),
    };

    if CREDENTIAL_ERRORS.contains(&kind) {
        return AuthError::InvalidCredentials(detail);
    }
    match ApiError::from_status(status, flow) {
        ApiError::Transient(msg) => AuthError::Unavailable(msg),
        ApiError::Auth(msg) | ApiError::Rejected(msg) => {
            AuthError::Rejected(format!("{} ({})", msg, detail))
        }
    }
}
