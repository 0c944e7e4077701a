//! Remote JWKS-backed [`KeyCollector`], grounded on the same
//! `fraiseql-server::auth::jwt` module's key-loading conventions, extended
//! with `reqwest` since that example fetches keys from local configuration
//! rather than a network endpoint.

use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use tokio::sync::Mutex;

use super::dns_guard::guarded_http_client;
use super::{AuthKey, KeyCollector};
use crate::error::AuthError;

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: Option<String>,
    alg: Option<String>,
    kty: String,
    #[serde(rename = "n")]
    modulus: Option<String>,
    #[serde(rename = "e")]
    exponent: Option<String>,
    k: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

/// Fetches a JWKS document over HTTP, caching it for `ttl` before
/// refetching on the next [`KeyCollector::keys`] call (§4.8).
pub struct RemoteJwks {
    url: String,
    audience: Vec<String>,
    client: reqwest::Client,
    ttl: Duration,
    cached: Mutex<Option<(Instant, Vec<AuthKey>)>>,
}

impl RemoteJwks {
    #[must_use]
    pub fn new(url: impl Into<String>, audience: Vec<String>) -> Self {
        Self {
            url: url.into(),
            audience,
            // IP-range-restricted: DNS answers landing in a private/
            // loopback/link-local range are rejected rather than followed
            // (§4.8 item 1).
            client: guarded_http_client(),
            ttl: Duration::from_secs(300),
            cached: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    async fn fetch(&self) -> crate::Result<Vec<AuthKey>> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| AuthError::JwksFetchFailed {
                url: self.url.clone(),
                message: e.to_string(),
            })?
            .json::<JwkSet>()
            .await
            .map_err(|e| AuthError::JwksFetchFailed {
                url: self.url.clone(),
                message: e.to_string(),
            })?;

        Ok(body
            .keys
            .into_iter()
            .filter_map(|jwk| self.decode_jwk(jwk))
            .collect())
    }

    fn decode_jwk(&self, jwk: Jwk) -> Option<AuthKey> {
        let algorithm = jwk
            .alg
            .as_deref()
            .and_then(|a| a.parse::<Algorithm>().ok())
            .unwrap_or(match jwk.kty.as_str() {
                "oct" => Algorithm::HS256,
                "EC" => Algorithm::ES256,
                _ => Algorithm::RS256,
            });

        let decoding_key = match jwk.kty.as_str() {
            "RSA" => DecodingKey::from_rsa_components(jwk.modulus.as_deref()?, jwk.exponent.as_deref()?).ok()?,
            "oct" => DecodingKey::from_base64_secret(jwk.k.as_deref()?).ok()?,
            "EC" => DecodingKey::from_ec_components(jwk.x.as_deref()?, jwk.y.as_deref()?).ok()?,
            _ => return None,
        };

        Some(AuthKey {
            kid: jwk.kid,
            algorithm,
            decoding_key,
            audience: self.audience.clone(),
            max_lifetime: None,
        })
    }
}

#[async_trait::async_trait]
impl KeyCollector for RemoteJwks {
    async fn keys(&self) -> crate::Result<Vec<AuthKey>> {
        {
            let cached = self.cached.lock().await;
            if let Some((fetched_at, keys)) = cached.as_ref()
                && fetched_at.elapsed() < self.ttl
            {
                return Ok(keys.clone());
            }
        }

        let keys = self.fetch().await?;
        *self.cached.lock().await = Some((Instant::now(), keys.clone()));
        Ok(keys)
    }
}
