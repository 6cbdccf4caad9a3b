use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Role, SessionStore, UserProfile};

const DEFAULT_LOGIN_FAILURE: &str = "Login failed";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{detail}")]
    Rejected { detail: String },
    #[error("You don't have permission to login as {requested}")]
    RoleMismatch { requested: Role, actual: Role },
    #[error("failed to persist session: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    token_type: Option<String>,
    user: LoginUser,
}

#[derive(Debug, Deserialize)]
struct LoginUser {
    email: String,
    #[serde(default)]
    name: String,
    role: Role,
    #[serde(default)]
    student_id: Option<String>,
}

/// Client for the backend's `/auth` routes.
#[derive(Clone, Debug)]
pub struct AuthClient {
    client: Client,
    base_url: String,
}

impl AuthClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AuthError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Authenticates and, only if the account holds `requested`, persists
    /// the token and profile into `store`.
    pub fn login(
        &self,
        store: &SessionStore,
        email: &str,
        password: &str,
        requested: Role,
    ) -> Result<UserProfile, AuthError> {
        let url = format!("{}/auth/login", self.base_url);
        log::info!("logging in {email} as {requested}");

        let response = self
            .client
            .post(&url)
            .json(&LoginRequest { email, password })
            .send()?;
        let status = response.status();
        let body = response.text()?;
        if !status.is_success() {
            return Err(AuthError::Rejected {
                detail: error_detail(&body),
            });
        }

        let login: LoginResponse = serde_json::from_str(&body).map_err(|err| AuthError::Rejected {
            detail: format!("{DEFAULT_LOGIN_FAILURE}: {err}"),
        })?;
        let token = login.access_token.clone();
        let profile = complete_login(login, requested)?;
        store.store_session(&token, &profile)?;
        Ok(profile)
    }
}

fn complete_login(login: LoginResponse, requested: Role) -> Result<UserProfile, AuthError> {
    let user = login.user;
    if user.role != requested {
        return Err(AuthError::RoleMismatch {
            requested,
            actual: user.role,
        });
    }

    let student_id = match requested {
        Role::Student => user.student_id,
        Role::Admin | Role::Teacher => None,
    };
    Ok(UserProfile {
        // The login route does not return a database id; email is unique.
        id: user.email.clone(),
        email: user.email,
        name: user.name,
        role: user.role,
        student_id,
    })
}

/// Pulls a human readable message out of an error body such as
/// `{"detail": "Incorrect email or password"}`.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("detail")
                .and_then(|detail| detail.as_str())
                .map(str::to_string)
        })
        .filter(|detail| !detail.is_empty())
        .unwrap_or_else(|| DEFAULT_LOGIN_FAILURE.to_string())
}
