//! Component H: the auth key store.
//!
//! The teacher carries no authentication code, so this module is grounded
//! on `fraiseql-server`'s `auth::jwt::JwtValidator` (the pack's other
//! example repo actually implementing JWT verification): a
//! `jsonwebtoken::Validation` built once per issuer, `Claims` decoded with
//! `#[serde(flatten)]` for passthrough custom claims, and error variants
//! matched out of `jsonwebtoken::errors::ErrorKind`. `reqwest` is added
//! (absent from both) to fetch remote JWKS documents, since neither
//! example repo's auth surface is itself network-facing.

pub mod dns_guard;
pub mod jwks;

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::PipelineConfig;
use crate::error::AuthError;

/// Decoded JWT claims. Required fields per §4.8; anything else passes
/// through via `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Vec<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// One verification key, keyed by an optional `kid` (§4.8). A key with no
/// `kid` is only ever reached by the wildcard fallback scan.
#[derive(Clone)]
pub struct AuthKey {
    pub kid: Option<String>,
    pub algorithm: Algorithm,
    pub decoding_key: DecodingKey,
    pub audience: Vec<String>,
    /// Overrides `PipelineConfig::jwt_max_lifetime` for tokens signed by
    /// this key, if set.
    pub max_lifetime: Option<Duration>,
}

/// Supplies the current verification key set; implementations decide how
/// (and how often) that set is refreshed (§4.8).
#[async_trait::async_trait]
pub trait KeyCollector: Send + Sync {
    async fn keys(&self) -> crate::Result<Vec<AuthKey>>;
}

/// A fixed, never-refreshed key set, for static configuration or tests.
pub struct StaticKeyCollector(pub Vec<AuthKey>);

#[async_trait::async_trait]
impl KeyCollector for StaticKeyCollector {
    async fn keys(&self) -> crate::Result<Vec<AuthKey>> {
        Ok(self.0.clone())
    }
}

/// A single HS256 shared secret, as Supabase projects hand out for their
/// built-in auth service (no `kid`, no JWKS endpoint — just one symmetric
/// key the project owner copies out of their dashboard) (§4.8 item 1
/// "Supabase-style shared-secret shims").
pub struct SupabaseSharedSecretCollector {
    key: AuthKey,
}

impl SupabaseSharedSecretCollector {
    #[must_use]
    pub fn new(shared_secret: &[u8], audience: Vec<String>) -> Self {
        Self {
            key: AuthKey {
                kid: None,
                algorithm: Algorithm::HS256,
                decoding_key: DecodingKey::from_secret(shared_secret),
                audience,
                max_lifetime: None,
            },
        }
    }
}

#[async_trait::async_trait]
impl KeyCollector for SupabaseSharedSecretCollector {
    async fn keys(&self) -> crate::Result<Vec<AuthKey>> {
        Ok(vec![self.key.clone()])
    }
}

/// Resolves a JWT's signing key against one or more [`KeyCollector`]s and
/// verifies it, enforcing the claim checks §4.8 requires beyond what
/// `jsonwebtoken::Validation` covers (max lifetime, Supabase issuer hint).
pub struct KeyStore {
    collectors: Vec<Box<dyn KeyCollector>>,
    config: PipelineConfig,
    /// Cached union of every collector's keys, refreshed on a cache miss
    /// (§4.8 "background refresh on miss").
    cache: RwLock<Vec<AuthKey>>,
}

impl KeyStore {
    #[must_use]
    pub fn new(collectors: Vec<Box<dyn KeyCollector>>, config: PipelineConfig) -> Self {
        Self {
            collectors,
            config,
            cache: RwLock::new(Vec::new()),
        }
    }

    async fn refresh(&self) -> crate::Result<()> {
        let mut all = Vec::new();
        for collector in &self.collectors {
            all.extend(collector.keys().await?);
        }
        *self.cache.write().await = all;
        Ok(())
    }

    fn looks_like_supabase(token_iss: Option<&str>) -> bool {
        token_iss.is_some_and(|iss| iss.contains(".supabase.co"))
    }

    /// Verify `token`, selecting a key by the JWT header's `kid` when
    /// present, falling back to a wildcard scan over every key whose
    /// algorithm family matches the token header otherwise (§4.8).
    pub async fn verify(&self, token: &str) -> crate::Result<Claims> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|_| AuthError::MissingRequiredClaim { claim: "header" })?;

        {
            let cached = self.cache.read().await;
            if let Some(claims) = self.try_verify_against(token, &header, &cached)? {
                return Ok(claims);
            }
        }

        // Cache miss: refresh once and retry before giving up (§4.8).
        self.refresh().await?;
        let cached = self.cache.read().await;
        if let Some(claims) = self.try_verify_against(token, &header, &cached)? {
            return Ok(claims);
        }

        let unverified_iss = decode_unverified_iss(token);
        Err(AuthError::KeyNotFound {
            kid: header.kid.clone(),
            supabase_hint: Self::looks_like_supabase(unverified_iss.as_deref()),
        }
        .into())
    }

    fn try_verify_against(
        &self,
        token: &str,
        header: &jsonwebtoken::Header,
        keys: &[AuthKey],
    ) -> crate::Result<Option<Claims>> {
        let candidates: Vec<&AuthKey> = match &header.kid {
            Some(kid) => keys.iter().filter(|k| k.kid.as_deref() == Some(kid.as_str())).collect(),
            None => keys.iter().collect(),
        };

        for key in candidates {
            if key.algorithm != header.alg {
                continue;
            }
            match self.decode_with_key(token, key) {
                Ok(claims) => return Ok(Some(claims)),
                Err(AuthAttemptError::WrongKey) => continue,
                Err(AuthAttemptError::Claim(e)) => return Err(e.into()),
            }
        }

        // No exact kid match found an algorithm-compatible key; if the
        // header carried a kid but every matching key had a different
        // algorithm family, surface that specifically rather than a bare
        // "not found" (§4.8).
        if let Some(kid) = &header.kid
            && keys.iter().any(|k| k.kid.as_deref() == Some(kid.as_str()))
            && !keys
                .iter()
                .any(|k| k.kid.as_deref() == Some(kid.as_str()) && k.algorithm == header.alg)
        {
            return Err(AuthError::AlgMismatch { kid: Some(kid.clone()) }.into());
        }

        Ok(None)
    }

    fn decode_with_key(&self, token: &str, key: &AuthKey) -> Result<Claims, AuthAttemptError> {
        // Both `exp` and `aud` are re-checked manually below with the
        // skew/hint semantics §4.8 requires, which `jsonwebtoken`'s own
        // validation can't express (no configurable skew-vs-leeway
        // distinction, and a failed aud/exp check here would otherwise be
        // indistinguishable from a signature mismatch once mapped to
        // `WrongKey`, masking the real error behind a bogus KEY_NOT_FOUND).
        let mut validation = Validation::new(key.algorithm);
        validation.validate_exp = false;
        validation.validate_aud = false;

        let data = decode::<Claims>(token, &key.decoding_key, &validation).map_err(|_| AuthAttemptError::WrongKey)?;
        let claims = data.claims;

        if !key.audience.is_empty() && !claims.aud.iter().any(|a| key.audience.contains(a)) {
            return Err(AuthAttemptError::Claim(AuthError::AudMismatch));
        }

        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
        let skew = self.config.jwt_expiry_skew.as_secs() as i64;
        if claims.exp + skew < now {
            return Err(AuthAttemptError::Claim(AuthError::TokenExpired { exp: claims.exp }));
        }

        let max_lifetime = key.max_lifetime.unwrap_or(self.config.jwt_max_lifetime).as_secs() as i64;
        if claims.exp - claims.iat > max_lifetime {
            return Err(AuthAttemptError::Claim(AuthError::MaxLifetimeExceeded {
                lifetime_secs: claims.exp - claims.iat,
                max_secs: max_lifetime,
            }));
        }

        Ok(claims)
    }
}

enum AuthAttemptError {
    WrongKey,
    Claim(AuthError),
}

fn decode_unverified_iss(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let decoded = base64_url_decode(payload)?;
    let value: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    value.get("iss").and_then(|v| v.as_str()).map(str::to_string)
}

fn base64_url_decode(input: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(input).ok()
}
