//! Identity collaborator boundary.
//!
//! The gateway never sees credentials beyond relaying a login; it asks an
//! [`IdentityProvider`] whether a bearer token is valid and who it belongs to,
//! then applies a coarse permission rule:
//! - `Read` needs any valid token,
//! - `Manage` needs role `admin` or an email under the admin domain.

pub mod roble;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::AuthConfig;
use crate::errors::AppError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login rejected: {0}")]
    InvalidCredentials(String),

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    pub token: String,
    /// Full collaborator payload, with `token` normalized in.
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub email: Option<String>,
    pub role: String,
    pub user: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenVerification {
    pub valid: bool,
    pub identity: Option<Identity>,
}

impl TokenVerification {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            identity: None,
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, AuthError>;

    async fn verify_token(&self, token: &str) -> Result<TokenVerification, AuthError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    Manage,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Manage => "manage",
        }
    }
}

/// Whether `identity` holds `permission`.
pub fn is_allowed(identity: &Identity, permission: Permission, admin_email_domain: &str) -> bool {
    match permission {
        Permission::Read => true,
        Permission::Manage => {
            if identity.role.eq_ignore_ascii_case("admin") {
                return true;
            }
            let suffix = format!("@{}", admin_email_domain.trim_start_matches('@'));
            identity
                .email
                .as_deref()
                .map(|e| e.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase()))
                .unwrap_or(false)
        }
    }
}

struct CachedIdentity {
    identity: Identity,
    verified_at: DateTime<Utc>,
}

/// Applies the permission rule on top of an identity provider, caching
/// successful verifications for a short TTL.
pub struct Authorizer {
    provider: Arc<dyn IdentityProvider>,
    enabled: bool,
    admin_email_domain: String,
    cache_ttl: Duration,
    cache: DashMap<String, CachedIdentity>,
}

impl Authorizer {
    pub fn new(provider: Arc<dyn IdentityProvider>, cfg: &AuthConfig) -> Self {
        Self {
            provider,
            enabled: cfg.enabled,
            admin_email_domain: cfg.admin_email_domain.clone(),
            cache_ttl: Duration::seconds(cfg.cache_ttl_secs as i64),
            cache: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn provider(&self) -> &Arc<dyn IdentityProvider> {
        &self.provider
    }

    async fn identify(&self, token: &str) -> Result<Identity, AppError> {
        let now = Utc::now();
        if let Some(cached) = self.cache.get(token) {
            if now - cached.verified_at < self.cache_ttl {
                return Ok(cached.identity.clone());
            }
        }
        self.cache
            .remove_if(token, |_, cached| now - cached.verified_at >= self.cache_ttl);

        let verification = self.provider.verify_token(token).await?;
        let identity = match verification {
            TokenVerification {
                valid: true,
                identity: Some(identity),
            } => identity,
            _ => {
                self.cache.remove(token);
                return Err(AuthError::InvalidToken.into());
            }
        };

        if self.cache_ttl > Duration::zero() {
            self.prune_expired(Utc::now());
            self.cache.insert(
                token.to_string(),
                CachedIdentity {
                    identity: identity.clone(),
                    verified_at: Utc::now(),
                },
            );
        }
        Ok(identity)
    }

    /// Drop every cached verification older than the TTL.
    fn prune_expired(&self, now: DateTime<Utc>) {
        let ttl = self.cache_ttl;
        self.cache.retain(|_, cached| now - cached.verified_at < ttl);
    }

    /// Check `token` for `permission`. Returns the identity, or `None` when auth is disabled.
    pub async fn authorize(
        &self,
        token: Option<&str>,
        permission: Permission,
    ) -> Result<Option<Identity>, AppError> {
        if !self.enabled {
            return Ok(None);
        }
        let token = token.ok_or(AppError::Unauthorized)?;
        let identity = self.identify(token).await?;

        if !is_allowed(&identity, permission, &self.admin_email_domain) {
            tracing::warn!(
                email = identity.email.as_deref().unwrap_or("-"),
                role = %identity.role,
                permission = permission.as_str(),
                "permission denied"
            );
            return Err(AppError::Forbidden("admin privileges required".into()));
        }
        Ok(Some(identity))
    }
}
