//! Bearer-token authorization expressed as capabilities.
//!
//! Handlers ask for a capability; an `Authorizer` turns the presented token
//! into `Claims`. The static implementation is fed from config and hashes
//! tokens at load time so plaintext tokens are not kept around.

use std::collections::{BTreeSet, HashMap};

use axum::http::{header::AUTHORIZATION, HeaderMap};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AuthConfig;

/// Demo tokens from the dashboard; only honoured with `allow_dev_tokens`.
pub const DEV_TOKENS: [&str; 2] = ["admin-demo-token", "development"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    EscrowRead,
    EscrowWrite,
    /// Implies every other capability.
    Admin,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::EscrowRead => "escrow_read",
            Capability::EscrowWrite => "escrow_write",
            Capability::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub subject: String,
    pub capabilities: BTreeSet<Capability>,
}

impl Claims {
    pub fn new(subject: impl Into<String>, caps: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            subject: subject.into(),
            capabilities: caps.into_iter().collect(),
        }
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.capabilities.contains(&Capability::Admin) || self.capabilities.contains(&cap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("'{subject}' lacks capability {}", .required.as_str())]
    Forbidden {
        subject: String,
        required: Capability,
    },
}

pub trait Authorizer: Send + Sync {
    fn authorize(&self, token: &str) -> Result<Claims, AuthError>;
}

type TokenDigest = [u8; 32];

fn digest(token: &str) -> TokenDigest {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(token.as_bytes()));
    out
}

#[derive(Debug, Default)]
pub struct StaticTokenAuthorizer {
    grants: HashMap<TokenDigest, Claims>,
}

impl StaticTokenAuthorizer {
    pub fn from_config(cfg: &AuthConfig) -> Self {
        let mut out = Self::default();
        if cfg.allow_dev_tokens {
            warn!(
                target: "auth",
                "development tokens enabled; disable auth.allow_dev_tokens in production"
            );
            for t in DEV_TOKENS {
                out = out.with_grant(t, Claims::new(t, [Capability::Admin]));
            }
        }
        for g in &cfg.grants {
            if g.token.trim().is_empty() {
                warn!(target: "auth", subject = %g.subject, "skipping grant with empty token");
                continue;
            }
            out = out.with_grant(&g.token, Claims::new(&g.subject, g.capabilities.iter().copied()));
        }
        out
    }

    pub fn with_grant(mut self, token: &str, claims: Claims) -> Self {
        self.grants.insert(digest(token), claims);
        self
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

impl Authorizer for StaticTokenAuthorizer {
    fn authorize(&self, token: &str) -> Result<Claims, AuthError> {
        self.grants
            .get(&digest(token))
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

/// Token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = raw.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Authorize the request and check it carries `cap`.
pub fn require(
    authorizer: &dyn Authorizer,
    headers: &HeaderMap,
    cap: Capability,
) -> Result<Claims, AuthError> {
    let token = bearer_token(headers).ok_or(AuthError::MissingToken)?;
    let claims = authorizer.authorize(token)?;
    if !claims.has(cap) {
        debug!(
            target: "auth",
            subject = %claims.subject,
            required = cap.as_str(),
            "capability denied"
        );
        return Err(AuthError::Forbidden {
            subject: claims.subject,
            required: cap,
        });
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::app::TokenGrant;
    use axum::http::HeaderValue;

    fn headers(v: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, HeaderValue::from_str(v).unwrap());
        h
    }

    fn authorizer(allow_dev: bool) -> StaticTokenAuthorizer {
        StaticTokenAuthorizer::from_config(&AuthConfig {
            allow_dev_tokens: allow_dev,
            grants: vec![TokenGrant {
                token: "reader-token".into(),
                subject: "auditor".into(),
                capabilities: vec![Capability::EscrowRead],
            }],
        })
    }

    #[test]
    fn parses_bearer_header() {
        assert_eq!(bearer_token(&headers("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(&headers("bearer  abc ")), Some("abc"));
        assert_eq!(bearer_token(&headers("Basic abc")), None);
        assert_eq!(bearer_token(&headers("Bearer")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn dev_tokens_are_admin_when_enabled() {
        let a = authorizer(true);
        assert_eq!(a.len(), 3);
        for t in DEV_TOKENS {
            let c = require(&a, &headers(&format!("Bearer {t}")), Capability::EscrowWrite).unwrap();
            assert!(c.has(Capability::EscrowRead));
        }
    }

    #[test]
    fn dev_tokens_rejected_when_disabled() {
        let a = authorizer(false);
        assert_eq!(
            require(&a, &headers("Bearer admin-demo-token"), Capability::EscrowRead),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn capabilities_are_enforced() {
        let a = authorizer(false);
        let h = headers("Bearer reader-token");
        assert!(require(&a, &h, Capability::EscrowRead).is_ok());
        assert!(matches!(
            require(&a, &h, Capability::EscrowWrite),
            Err(AuthError::Forbidden { required: Capability::EscrowWrite, .. })
        ));
        assert_eq!(
            require(&a, &HeaderMap::new(), Capability::EscrowRead),
            Err(AuthError::MissingToken)
        );
    }
}
