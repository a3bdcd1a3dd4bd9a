use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::{AuthError, Identity, IdentityProvider, LoginOutcome, TokenVerification};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// ROBLE identity service over HTTP.
pub struct RobleIdentityProvider {
    client: reqwest::Client,
    base_url: String,
    contract: String,
}

impl RobleIdentityProvider {
    pub fn new(base_url: &str, contract: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            contract: contract.to_string(),
        })
    }

    fn url(&self, op: &str) -> String {
        format!("{}/auth/{}/{}", self.base_url, self.contract, op)
    }
}

fn error_message(body: &Value, fallback: &str) -> String {
    body.get("message")
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

/// The verify payload carries the user either under `user` or at the top level.
fn identity_from(body: Value) -> Identity {
    let user = body.get("user").cloned().unwrap_or(body);
    let role = user
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or("user")
        .to_string();
    let email = user
        .get("email")
        .and_then(Value::as_str)
        .map(str::to_string);
    Identity { email, role, user }
}

#[async_trait]
impl IdentityProvider for RobleIdentityProvider {
    async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, AuthError> {
        let resp = self
            .client
            .post(self.url("login"))
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        let status = resp.status();
        let mut body: Value = resp.json().await.unwrap_or(Value::Null);

        if status != StatusCode::OK && status != StatusCode::CREATED {
            tracing::info!(status = status.as_u16(), "identity login rejected");
            if status.is_server_error() {
                return Err(AuthError::Unavailable(error_message(&body, "login failed")));
            }
            return Err(AuthError::InvalidCredentials(error_message(&body, "login failed")));
        }

        if let Some(access) = body.get("accessToken").cloned() {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("token".into(), access);
            }
        }
        let token = body
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AuthError::Unavailable("login response carried no token".into()))?;

        Ok(LoginOutcome { token, data: body })
    }

    async fn verify_token(&self, token: &str) -> Result<TokenVerification, AuthError> {
        let resp = self
            .client
            .get(self.url("verify-token"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::OK {
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            return Ok(TokenVerification {
                valid: true,
                identity: Some(identity_from(body)),
            });
        }
        if status.is_server_error() {
            return Err(AuthError::Unavailable(format!(
                "verify-token returned {}",
                status.as_u16()
            )));
        }
        tracing::debug!(status = status.as_u16(), "token rejected by identity service");
        Ok(TokenVerification::invalid())
    }
}
