// Connection Authentication
//
// Every inbound socket presents an access token once, before it is
// registered. Two verifiers are provided:
// - `JwtVerifier`: HS256 tokens issued by the account service
// - `TokenAuth`: static token registry for development and tests

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use beacon_core::{AuthConfig, BeaconError, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value as JsonValue};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type HmacSha256 = Hmac<Sha256>;

/// Who is on the other end of a socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Resolve a token to an identity; any failure is an `AuthFailure`
    async fn verify(&self, token: &str) -> Result<Identity>;
}

fn strip_bearer(token: &str) -> &str {
    token.strip_prefix("Bearer ").unwrap_or(token)
}

// ---------------------------------------------------------------------------
// JWT (HS256)
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Malformed JWT token")]
    MalformedToken,
    #[error("Invalid JWT header")]
    InvalidHeader,
    #[error("Unsupported algorithm (only HS256)")]
    UnsupportedAlgorithm,
    #[error("Invalid JWT signature")]
    InvalidSignature,
    #[error("Invalid JWT payload")]
    InvalidPayload,
    #[error("Token expired")]
    TokenExpired,
    #[error("Token not yet valid")]
    TokenNotYetValid,
    #[error("Invalid issuer")]
    InvalidIssuer,
    #[error("Invalid audience")]
    InvalidAudience,
    #[error("Token has no user id")]
    MissingSubject,
    #[error("Invalid signing key")]
    InvalidKey,
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Allowed clock skew for `nbf`, in seconds
const NBF_LEEWAY_SECS: i64 = 300;

pub struct JwtVerifier {
    secret: Vec<u8>,
    issuer: Option<String>,
    audience: Option<String>,
}

impl JwtVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            issuer: None,
            audience: None,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            secret: config.jwt_secret.as_bytes().to_vec(),
            issuer: config.issuer.clone().filter(|s| !s.is_empty()),
            audience: config.audience.clone().filter(|s| !s.is_empty()),
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    fn mac(&self) -> std::result::Result<HmacSha256, JwtError> {
        <HmacSha256 as Mac>::new_from_slice(&self.secret).map_err(|_| JwtError::InvalidKey)
    }

    /// Check signature, algorithm and registered claims; return the claims
    pub fn decode(&self, token: &str) -> std::result::Result<JsonValue, JwtError> {
        let parts: Vec<&str> = token.splitn(3, '.').collect();
        let [header_b64, payload_b64, sig_b64] = parts.as_slice() else {
            return Err(JwtError::MalformedToken);
        };

        let signature = URL_SAFE_NO_PAD.decode(sig_b64)?;
        let mut mac = self.mac()?;
        mac.update(format!("{header_b64}.{payload_b64}").as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| JwtError::InvalidSignature)?;

        let header: JsonValue = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header_b64)?)?;
        let alg = header
            .get("alg")
            .and_then(|a| a.as_str())
            .ok_or(JwtError::InvalidHeader)?;
        if alg != "HS256" {
            return Err(JwtError::UnsupportedAlgorithm);
        }

        let claims: JsonValue = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload_b64)?)
            .map_err(|_| JwtError::InvalidPayload)?;

        let now = Utc::now().timestamp();

        let exp = claims
            .get("exp")
            .and_then(|e| e.as_i64())
            .ok_or(JwtError::TokenExpired)?;
        if now >= exp {
            return Err(JwtError::TokenExpired);
        }

        if let Some(nbf) = claims.get("nbf").and_then(|n| n.as_i64()) {
            if now < nbf - NBF_LEEWAY_SECS {
                return Err(JwtError::TokenNotYetValid);
            }
        }

        if let Some(expected) = &self.issuer {
            if claims.get("iss").and_then(|i| i.as_str()) != Some(expected.as_str()) {
                return Err(JwtError::InvalidIssuer);
            }
        }

        if let Some(expected) = &self.audience {
            if claims.get("aud").and_then(|a| a.as_str()) != Some(expected.as_str()) {
                return Err(JwtError::InvalidAudience);
            }
        }

        Ok(claims)
    }

    /// Sign `claims` as an HS256 token. The caller supplies `exp` and friends.
    pub fn encode(&self, claims: &JsonValue) -> std::result::Result<String, JwtError> {
        let header = json!({ "alg": "HS256", "typ": "JWT" });
        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);

        let mut mac = self.mac()?;
        mac.update(format!("{header_b64}.{payload_b64}").as_bytes());
        let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{header_b64}.{payload_b64}.{sig_b64}"))
    }
}

fn identity_from_claims(claims: &JsonValue) -> std::result::Result<Identity, JwtError> {
    let user_id = claims
        .get("uuid")
        .and_then(|v| v.as_str())
        .filter(|id| !id.is_empty())
        .ok_or(JwtError::MissingSubject)?;

    let display_name = ["nickName", "name"]
        .iter()
        .find_map(|key| claims.get(*key).and_then(|v| v.as_str()))
        .filter(|name| !name.is_empty())
        .unwrap_or(user_id);

    Ok(Identity::new(user_id, display_name))
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Identity> {
        self.decode(strip_bearer(token))
            .and_then(|claims| identity_from_claims(&claims))
            .map_err(|e| BeaconError::auth_failure(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Static token registry
// ---------------------------------------------------------------------------

const MIN_TOKEN_LENGTH: usize = 32;

/// Token authentication system
pub struct TokenAuth {
    tokens: Arc<RwLock<HashMap<String, TokenInfo>>>,
}

/// Token information
#[derive(Clone, Debug)]
pub struct TokenInfo {
    pub identity: Identity,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

fn check_token_format(token: &str) -> std::result::Result<(), &'static str> {
    if token.len() < MIN_TOKEN_LENGTH {
        return Err("too short");
    }
    if !token
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err("invalid characters");
    }
    Ok(())
}

impl TokenAuth {
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a token for `identity`
    pub async fn register(&self, token: &str, identity: Identity) -> Result<()> {
        let token = strip_bearer(token);
        check_token_format(token)
            .map_err(|reason| BeaconError::auth_failure(format!("token {reason}")))?;

        let info = TokenInfo {
            identity,
            created_at: Utc::now(),
            last_used: None,
        };

        self.tokens.write().await.insert(token.to_string(), info);
        tracing::info!("Token registered successfully");
        Ok(())
    }

    pub async fn get_token_info(&self, token: &str) -> Option<TokenInfo> {
        self.tokens.read().await.get(strip_bearer(token)).cloned()
    }

    pub async fn revoke(&self, token: &str) {
        self.tokens.write().await.remove(strip_bearer(token));
        tracing::info!("Token revoked successfully");
    }

    pub async fn token_count(&self) -> usize {
        self.tokens.read().await.len()
    }
}

impl Default for TokenAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityVerifier for TokenAuth {
    async fn verify(&self, token: &str) -> Result<Identity> {
        let token = strip_bearer(token);
        if let Err(reason) = check_token_format(token) {
            tracing::warn!("Token validation failed: {}", reason);
            return Err(BeaconError::auth_failure(format!("token {reason}")));
        }

        match self.tokens.write().await.get_mut(token) {
            Some(info) => {
                info.last_used = Some(Utc::now());
                tracing::debug!(user_id = %info.identity.user_id, "Token validated successfully");
                Ok(info.identity.clone())
            }
            None => {
                tracing::warn!("Token validation failed: token not found in registry");
                Err(BeaconError::auth_failure("unknown token"))
            }
        }
    }
}
