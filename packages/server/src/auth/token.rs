use std::collections::VecDeque;
use std::sync::Mutex;

use dashmap::DashMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims carried by service-to-service tokens
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceClaims {
    pub sub: String,     // Calling service identity
    pub aud: String,     // Intended recipient
    pub iss: String,     // Issuer
    pub iat: i64,        // Issued at timestamp
    pub exp: i64,        // Expiration timestamp
    pub scope: String,   // Space-separated scopes
    pub service: String, // Service name, mirrors sub for worker-side logging
}

/// Why a presented token was rejected. Variants are distinct so callers
/// can log the reason without string matching.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature does not verify")]
    BadSignature,
    #[error("token is expired")]
    Expired,
    #[error("token audience {found:?} does not match {expected:?}")]
    WrongAudience { expected: String, found: String },
    #[error("token issuer {found:?} does not match {expected:?}")]
    WrongIssuer { expected: String, found: String },
    #[error("token encoding failed: {0}")]
    Encoding(String),
}

#[derive(Clone)]
struct IssuedToken {
    token: String,
    expires_at: i64,
}

// Verified-token cache bounds: at the cap the oldest half is evicted so a
// stream of distinct presented tokens cannot grow the cache without limit.
const VERIFIED_CACHE_CAP: usize = 1000;
const VERIFIED_CACHE_KEEP: usize = 500;

/// TokenService - mints and verifies HS256 service tokens
///
/// Issued tokens are cached per subject+scope until shortly before expiry,
/// and verified tokens are cached so hot callback paths skip signature
/// work on repeat presentations.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    ttl_secs: i64,
    issued: DashMap<String, IssuedToken>,
    verified: DashMap<String, ServiceClaims>,
    verified_order: Mutex<VecDeque<String>>,
}

impl TokenService {
    pub fn new(secret: &str, issuer: String, audience: String) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer,
            audience,
            ttl_secs: 3600,
            issued: DashMap::new(),
            verified: DashMap::new(),
            verified_order: Mutex::new(VecDeque::new()),
        }
    }

    /// Mint a token for the given service and scopes, reusing a cached one
    /// while it still has at least five minutes of life left.
    pub fn issue_service_token(
        &self,
        subject: &str,
        scopes: &[&str],
    ) -> Result<String, TokenError> {
        let scope = scopes.join(" ");
        let cache_key = format!("{subject}:{scope}");
        let now = chrono::Utc::now().timestamp();

        if let Some(entry) = self.issued.get(&cache_key) {
            if entry.expires_at - now > 300 {
                return Ok(entry.token.clone());
            }
        }

        let exp = now + self.ttl_secs;
        let claims = ServiceClaims {
            sub: subject.to_string(),
            aud: self.audience.clone(),
            iss: self.issuer.clone(),
            iat: now,
            exp,
            scope,
            service: subject.to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Encoding(e.to_string()))?;

        self.issued.insert(
            cache_key,
            IssuedToken {
                token: token.clone(),
                expires_at: exp,
            },
        );

        Ok(token)
    }

    /// Verify a presented service token and return its claims.
    pub fn verify_service_token(&self, token: &str) -> Result<ServiceClaims, TokenError> {
        let now = chrono::Utc::now().timestamp();

        if let Some(claims) = self.verified.get(token) {
            if claims.exp > now {
                return Ok(claims.clone());
            }
            drop(claims);
            self.verified.remove(token);
            return Err(TokenError::Expired);
        }

        // Signature check only; claims are validated by hand below so each
        // failure surfaces as its own variant.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = decode::<ServiceClaims>(token, &self.decoding_key, &validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidSignature => TokenError::BadSignature,
                _ => TokenError::Malformed,
            },
        )?;
        let claims = data.claims;

        if claims.exp <= now {
            return Err(TokenError::Expired);
        }
        if claims.aud != self.audience {
            return Err(TokenError::WrongAudience {
                expected: self.audience.clone(),
                found: claims.aud,
            });
        }
        if claims.iss != self.issuer {
            return Err(TokenError::WrongIssuer {
                expected: self.issuer.clone(),
                found: claims.iss,
            });
        }

        self.cache_verified(token, claims.clone());
        Ok(claims)
    }

    fn cache_verified(&self, token: &str, claims: ServiceClaims) {
        self.verified.insert(token.to_string(), claims);

        let mut order = match self.verified_order.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        order.push_back(token.to_string());
        if order.len() >= VERIFIED_CACHE_CAP {
            while order.len() > VERIFIED_CACHE_KEEP {
                if let Some(old) = order.pop_front() {
                    self.verified.remove(&old);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(
            "test_secret_key",
            "conforma-api".to_string(),
            "analysis-worker".to_string(),
        )
    }

    #[test]
    fn test_issue_and_verify() {
        let svc = service();
        let token = svc
            .issue_service_token("api-server", &["analysis:write"])
            .unwrap();

        let claims = svc.verify_service_token(&token).unwrap();
        assert_eq!(claims.sub, "api-server");
        assert_eq!(claims.aud, "analysis-worker");
        assert_eq!(claims.iss, "conforma-api");
        assert_eq!(claims.scope, "analysis:write");
    }

    #[test]
    fn test_issued_token_is_cached() {
        let svc = service();
        let a = svc.issue_service_token("api-server", &["a"]).unwrap();
        let b = svc.issue_service_token("api-server", &["a"]).unwrap();
        assert_eq!(a, b);

        // Different scope set mints a different token.
        let c = svc.issue_service_token("api-server", &["b"]).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_malformed_token() {
        let svc = service();
        assert!(matches!(
            svc.verify_service_token("not-a-jwt"),
            Err(TokenError::Malformed)
        ));
    }

    #[test]
    fn test_wrong_secret() {
        let svc = service();
        let other = TokenService::new(
            "different_secret",
            "conforma-api".to_string(),
            "analysis-worker".to_string(),
        );
        let token = other.issue_service_token("api-server", &["a"]).unwrap();
        assert!(matches!(
            svc.verify_service_token(&token),
            Err(TokenError::BadSignature)
        ));
    }

    #[test]
    fn test_wrong_audience_and_issuer() {
        let svc = service();

        let other_aud = TokenService::new(
            "test_secret_key",
            "conforma-api".to_string(),
            "someone-else".to_string(),
        );
        let token = other_aud.issue_service_token("api-server", &["a"]).unwrap();
        assert!(matches!(
            svc.verify_service_token(&token),
            Err(TokenError::WrongAudience { .. })
        ));

        let other_iss = TokenService::new(
            "test_secret_key",
            "rogue-issuer".to_string(),
            "analysis-worker".to_string(),
        );
        let token = other_iss.issue_service_token("api-server", &["a"]).unwrap();
        assert!(matches!(
            svc.verify_service_token(&token),
            Err(TokenError::WrongIssuer { .. })
        ));
    }

    #[test]
    fn test_verified_cache_is_bounded() {
        let svc = service();
        // Distinct scopes mint distinct tokens, each cached on verification.
        for i in 0..(VERIFIED_CACHE_CAP + 100) {
            let scope = format!("scope-{i}");
            let token = svc
                .issue_service_token("api-server", &[scope.as_str()])
                .unwrap();
            svc.verify_service_token(&token).unwrap();
        }
        assert!(svc.verified.len() <= VERIFIED_CACHE_CAP);

        // An evicted token still verifies through the full decode path.
        let token = svc.issue_service_token("api-server", &["scope-0"]).unwrap();
        assert!(svc.verify_service_token(&token).is_ok());
    }

    #[test]
    fn test_expired_token() {
        let mut svc = service();
        svc.ttl_secs = -10;
        let token = svc.issue_service_token("api-server", &["a"]).unwrap();
        assert!(matches!(
            svc.verify_service_token(&token),
            Err(TokenError::Expired)
        ));
    }
}
