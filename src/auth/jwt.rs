use std::time::Duration;

use axum::extract::FromRef;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use thiserror::Error;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;

use super::{claims::Claims, user::Role};
use crate::{config::JwtConfig, state::AppState};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid token")]
    Invalid,
    #[error("failed to sign token: {0}")]
    Sign(#[source] jsonwebtoken::errors::Error),
}

/// Holds JWT signing and verification keys with config data.
#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    ttl: Duration,
}

impl FromRef<AppState> for JwtKeys {
    fn from_ref(state: &AppState) -> Self {
        state.jwt.clone()
    }
}

impl JwtKeys {
    pub fn new(cfg: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            issuer: cfg.issuer.clone(),
            ttl: Duration::from_secs((cfg.ttl_minutes.max(1) as u64) * 60),
        }
    }

    /// Signs a token for `username`; returns it with its expiry as a unix timestamp.
    pub fn issue(&self, username: &str, role: Role) -> Result<(String, i64), TokenError> {
        self.issue_at(username, role, OffsetDateTime::now_utc())
    }

    fn issue_at(
        &self,
        username: &str,
        role: Role,
        now: OffsetDateTime,
    ) -> Result<(String, i64), TokenError> {
        let exp = now + TimeDuration::seconds(self.ttl.as_secs() as i64);
        let claims = Claims {
            sub: username.to_string(),
            role,
            iat: now.unix_timestamp(),
            exp: exp.unix_timestamp(),
            iss: self.issuer.clone(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(TokenError::Sign)?;
        debug!(%username, %role, "jwt signed");
        Ok((token, claims.exp))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            }
        })?;
        debug!(username = %data.claims.sub, "jwt verified");
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_keys(secret: &str, issuer: &str) -> JwtKeys {
        JwtKeys::new(&JwtConfig {
            secret: secret.into(),
            issuer: issuer.into(),
            ttl_minutes: 60 * 24,
        })
    }

    #[test]
    fn issue_then_verify_returns_same_identity() {
        let keys = make_keys("dev-secret", "arsm");
        let (token, expires_at) = keys.issue("alice", Role::User).expect("issue");
        let claims = keys.verify(&token).expect("verify");
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.role, Role::User);
        assert_eq!(claims.exp, expires_at);
        assert_eq!(claims.exp - claims.iat, 24 * 60 * 60);
    }

    #[test]
    fn expired_token_is_rejected_as_expired() {
        let keys = make_keys("dev-secret", "arsm");
        let issued = OffsetDateTime::now_utc() - TimeDuration::hours(25);
        let (token, expires_at) = keys.issue_at("admin", Role::Admin, issued).unwrap();
        assert!(expires_at < OffsetDateTime::now_utc().unix_timestamp());
        assert!(matches!(keys.verify(&token), Err(TokenError::Expired)));
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let good = make_keys("secret-a", "arsm");
        let bad = make_keys("secret-b", "arsm");
        let (token, _) = good.issue("admin", Role::Admin).unwrap();
        assert!(matches!(bad.verify(&token), Err(TokenError::Invalid)));
    }

    #[test]
    fn wrong_issuer_is_invalid() {
        let good = make_keys("same-secret", "arsm");
        let other = make_keys("same-secret", "someone-else");
        let (token, _) = good.issue("admin", Role::Admin).unwrap();
        assert!(matches!(other.verify(&token), Err(TokenError::Invalid)));
    }

    #[test]
    fn tampered_and_garbage_tokens_are_invalid() {
        let keys = make_keys("dev-secret", "arsm");
        let (token, _) = keys.issue("alice", Role::User).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let (forged, _) = keys.issue("alice", Role::Admin).unwrap();
        let forged_payload = forged.split('.').nth(1).unwrap().to_string();
        parts[1] = &forged_payload;
        let spliced = parts.join(".");
        // payload from one token, signature from another
        assert!(matches!(keys.verify(&spliced), Err(TokenError::Invalid)));
        assert!(matches!(keys.verify("not.a.token"), Err(TokenError::Invalid)));
        assert!(matches!(keys.verify(""), Err(TokenError::Invalid)));
    }
}
