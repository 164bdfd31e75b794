//! Passwords, bearer tokens and the logout revocation list.
//!
//! Tokens are HS256 JWTs: `base64url(header).base64url(claims).base64url(mac)`
//! without padding. The revocation list is process-local; a restart forgets
//! logouts but also rotates the generated secret unless one is configured.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const JWT_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    SubAdmin,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::SubAdmin => "sub_admin",
            Role::Student => "student",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "sub_admin" => Some(Role::SubAdmin),
            "student" => Some(Role::Student),
            _ => None,
        }
    }

    pub fn is_staff(self) -> bool {
        matches!(self, Role::Admin | Role::SubAdmin)
    }
}

pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    format!("{}${}", salt, salted_digest(&salt, password))
}

pub fn verify_password(stored: &str, password: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    constant_time_eq(salted_digest(salt, password).as_bytes(), digest.as_bytes())
}

fn salted_digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student: Option<String>,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("unsupported token algorithm")]
    UnsupportedAlgorithm,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token could not be signed: {0}")]
    Signing(String),
}

/// Signs and checks tokens with one shared secret.
#[derive(Clone)]
pub struct TokenIssuer {
    secret: Vec<u8>,
    ttl_secs: i64,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(secret: impl Into<Vec<u8>>, ttl_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            ttl_secs,
        }
    }

    /// A secret that only lives as long as this process.
    pub fn ephemeral(ttl_secs: i64) -> Self {
        let mut secret = Vec::with_capacity(32);
        secret.extend_from_slice(Uuid::new_v4().as_bytes());
        secret.extend_from_slice(Uuid::new_v4().as_bytes());
        Self::new(secret, ttl_secs)
    }

    pub fn issue(
        &self,
        user_id: &str,
        role: Role,
        branch: Option<String>,
        student: Option<String>,
        now: i64,
    ) -> Result<(String, Claims), TokenError> {
        let claims = Claims {
            sub: user_id.to_string(),
            role,
            branch,
            student,
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + self.ttl_secs,
        };
        let payload = serde_json::to_vec(&claims).map_err(|e| TokenError::Signing(e.to_string()))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(JWT_HEADER),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let sig = self.sign(signing_input.as_bytes())?;
        Ok((
            format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(sig)),
            claims,
        ))
    }

    pub fn verify(&self, token: &str, now: i64) -> Result<Claims, TokenError> {
        let mut parts = token.trim().split('.');
        let (Some(header), Some(payload), Some(sig), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };

        let header_json: serde_json::Value = URL_SAFE_NO_PAD
            .decode(header)
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok())
            .ok_or(TokenError::Malformed)?;
        if header_json.get("alg").and_then(|v| v.as_str()) != Some("HS256") {
            return Err(TokenError::UnsupportedAlgorithm);
        }

        let sig = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = self.mac()?;
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        mac.verify_slice(&sig).map_err(|_| TokenError::BadSignature)?;

        let claims: Claims = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok())
            .ok_or(TokenError::Malformed)?;
        if claims.exp <= now {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    fn sign(&self, input: &[u8]) -> Result<Vec<u8>, TokenError> {
        let mut mac = self.mac()?;
        mac.update(input);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|e| TokenError::Signing(e.to_string()))
    }
}

/// Token ids invalidated by logout, kept until their natural expiry.
#[derive(Debug, Default)]
pub struct RevocationList {
    entries: HashMap<String, i64>,
}

impl RevocationList {
    pub fn revoke(&mut self, jti: &str, exp: i64, now: i64) {
        self.entries.retain(|_, e| *e > now);
        if exp > now {
            self.entries.insert(jti.to_string(), exp);
        }
    }

    pub fn is_revoked(&self, jti: &str) -> bool {
        self.entries.contains_key(jti)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The caller behind a verified token, refreshed from the users table.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub branch_id: Option<String>,
    pub student_id: Option<String>,
    pub token_id: String,
    pub expires_at: i64,
}

impl Session {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn can_access_branch(&self, branch_id: &str) -> bool {
        match self.role {
            Role::Admin => true,
            Role::SubAdmin => self.branch_id.as_deref() == Some(branch_id),
            Role::Student => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_verifies_and_is_salted() {
        let a = hash_password("hunter22");
        let b = hash_password("hunter22");
        assert_ne!(a, b);
        assert!(verify_password(&a, "hunter22"));
        assert!(!verify_password(&a, "hunter23"));
        assert!(!verify_password("garbage", "hunter22"));
    }

    #[test]
    fn issued_token_verifies_with_same_secret() {
        let issuer = TokenIssuer::new(b"0123456789abcdef".to_vec(), 60);
        let (token, claims) = issuer.issue("u1", Role::SubAdmin, Some("b1".into()), None, 1_000).expect("issue");
        let back = issuer.verify(&token, 1_030).expect("verify");
        assert_eq!(back, claims);
        assert_eq!(back.exp, 1_060);
    }

    #[test]
    fn empty_secret_still_signs() {
        let issuer = TokenIssuer::new(Vec::new(), 60);
        let (token, claims) = issuer.issue("u1", Role::Admin, None, None, 0).expect("issue");
        assert_eq!(issuer.verify(&token, 1), Ok(claims));
    }

    #[test]
    fn token_rejected_after_expiry_or_with_other_secret() {
        let issuer = TokenIssuer::new(b"0123456789abcdef".to_vec(), 60);
        let (token, _) = issuer.issue("u1", Role::Admin, None, None, 1_000).expect("issue");
        assert_eq!(issuer.verify(&token, 1_060), Err(TokenError::Expired));

        let other = TokenIssuer::new(b"fedcba9876543210".to_vec(), 60);
        assert_eq!(other.verify(&token, 1_010), Err(TokenError::BadSignature));
    }

    #[test]
    fn tampered_payload_fails_signature() {
        let issuer = TokenIssuer::ephemeral(60);
        let (token, _) = issuer.issue("u1", Role::Student, None, Some("s1".into()), 0).expect("issue");
        let parts: Vec<&str> = token.split('.').collect();
        let forged_claims = URL_SAFE_NO_PAD.encode(
            r#"{"sub":"u1","role":"admin","jti":"x","iat":0,"exp":999999}"#,
        );
        let forged = format!("{}.{}.{}", parts[0], forged_claims, parts[2]);
        assert_eq!(issuer.verify(&forged, 1), Err(TokenError::BadSignature));
        assert_eq!(issuer.verify("a.b", 1), Err(TokenError::Malformed));
    }

    #[test]
    fn none_algorithm_is_refused() {
        let issuer = TokenIssuer::ephemeral(60);
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(r#"{"sub":"u","role":"admin","jti":"j","iat":0,"exp":99}"#);
        let token = format!("{header}.{payload}.");
        assert_eq!(
            issuer.verify(&token, 1),
            Err(TokenError::UnsupportedAlgorithm)
        );
    }

    #[test]
    fn revocation_list_prunes_expired_entries() {
        let mut list = RevocationList::default();
        list.revoke("a", 100, 10);
        list.revoke("b", 200, 10);
        assert!(list.is_revoked("a"));
        list.revoke("c", 300, 150);
        assert!(!list.is_revoked("a"));
        assert!(list.is_revoked("b"));
        assert_eq!(list.len(), 2);
        list.revoke("stale", 5, 150);
        assert!(!list.is_revoked("stale"));
    }

    #[test]
    fn sub_admin_branch_access() {
        let s = Session {
            user_id: "u".into(),
            username: "ikeja".into(),
            role: Role::SubAdmin,
            branch_id: Some("b1".into()),
            student_id: None,
            token_id: "t".into(),
            expires_at: 0,
        };
        assert!(s.can_access_branch("b1"));
        assert!(!s.can_access_branch("b2"));
    }
}
