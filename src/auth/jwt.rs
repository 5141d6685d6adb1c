//! # Bearer Token Verification
//!
//! Validates the user-facing JWT the identity provider issues before any
//! ticket is handed out. The gateway only verifies; it never mints tokens.
//! Verification uses the provider's RS256 public key supplied via
//! `CLERK_JWT_KEY` and, when configured, checks the token's authorized
//! party (`azp`) against the origin allowlist.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

/// Claims the gateway cares about. Everything else in the token is ignored.
#[derive(Debug, Deserialize)]
pub struct TokenClaims {
    /// Opaque user id; becomes the ticket subject
    pub sub: String,

    /// Authorized party (origin that requested the token), when present
    #[serde(default)]
    pub azp: Option<String>,
}

/// RS256 verifier built once at startup from the configured public key.
pub struct TokenVerifier {
    key: DecodingKey,
    authorized_parties: Vec<String>,
}

impl TokenVerifier {
    /// Build a verifier from a PEM-encoded RSA public key.
    ///
    /// `authorized_parties` is the comma-split origin allowlist; when empty,
    /// the `azp` claim is not checked.
    pub fn new(public_key_pem: &str, authorized_parties: Vec<String>) -> Result<Self, String> {
        let key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| format!("invalid verification key: {}", e))?;
        Ok(Self {
            key,
            authorized_parties,
        })
    }

    /// Verify a compact JWT and return its claims.
    ///
    /// ## Checks:
    /// - RS256 signature against the configured key
    /// - `exp`/`nbf` validity (with the library's default leeway)
    /// - `azp` membership in the allowlist, when both are present
    pub fn verify(&self, token: &str) -> Result<TokenClaims, String> {
        let validation = Validation::new(Algorithm::RS256);

        let data = decode::<TokenClaims>(token, &self.key, &validation)
            .map_err(|e| format!("token verification failed: {}", e))?;

        if !self.authorized_parties.is_empty() {
            if let Some(azp) = &data.claims.azp {
                if !self.authorized_parties.iter().any(|p| p == azp) {
                    return Err(format!("authorized party '{}' not allowed", azp));
                }
            }
        }

        Ok(data.claims)
    }
}

/// Pull the bearer token out of an `Authorization` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let rest = header_value.strip_prefix("Bearer ")?;
    let token = rest.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
