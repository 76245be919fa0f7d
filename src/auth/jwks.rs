//! JWKS key cache.
//!
//! Two TTL-bounded layers behind one lock: the raw key set is refreshed when
//! a requested `kid` is unknown or the set's TTL has elapsed; parsed
//! `DecodingKey`s live as long as the key set they came from. A failed
//! refresh never clears keys that are still within their TTL.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::AuthError;

#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kid: Option<String>,
    pub kty: Option<String>,
    pub alg: Option<String>,
    #[serde(rename = "use")]
    pub key_use: Option<String>,
    pub n: Option<String>,
    pub e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Default)]
struct KeySetState {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Option<DateTime<Utc>>,
}

impl KeySetState {
    fn is_fresh(&self, ttl: Duration) -> bool {
        match self.fetched_at {
            Some(at) => (Utc::now() - at).to_std().map(|age| age < ttl).unwrap_or(false),
            None => false,
        }
    }
}

pub struct JwksCache {
    url: String,
    ttl: Duration,
    client: reqwest::Client,
    state: RwLock<KeySetState>,
}

impl JwksCache {
    pub fn new(url: impl Into<String>, ttl: Duration, fetch_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            ttl,
            client,
            state: RwLock::new(KeySetState::default()),
        }
    }

    /// Look up the decoding key for `kid`, refreshing the key set on miss or
    /// expiry. Concurrent misses serialize on the write lock.
    pub async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        {
            let state = self.state.read().await;
            if state.is_fresh(self.ttl) {
                if let Some(key) = state.keys.get(kid) {
                    return Ok(key.clone());
                }
            }
        }

        let mut state = self.state.write().await;
        // Another task may have refreshed while we waited for the lock.
        if state.is_fresh(self.ttl) {
            if let Some(key) = state.keys.get(kid) {
                return Ok(key.clone());
            }
        }

        match self.fetch().await {
            Ok(keys) => {
                debug!(count = keys.len(), url = %self.url, "refreshed JWKS key set");
                state.keys = keys;
                state.fetched_at = Some(Utc::now());
            }
            // The cache keeps whatever it held; only this refresh failed.
            Err(e) => return Err(e),
        }

        state
            .keys
            .get(kid)
            .cloned()
            .ok_or_else(|| AuthError::UnknownKeyId(kid.to_string()))
    }

    async fn fetch(&self) -> Result<HashMap<String, DecodingKey>, AuthError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| AuthError::JwksFetchFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::JwksFetchFailed(format!(
                "HTTP {} from {}",
                response.status(),
                self.url
            )));
        }

        let body: JwksResponse = response
            .json()
            .await
            .map_err(|e| AuthError::JwksFetchFailed(e.to_string()))?;

        let mut keys = HashMap::new();
        for jwk in body.keys {
            let Some(kid) = jwk.kid else {
                warn!("skipping JWKS entry without kid");
                continue;
            };
            if jwk.kty.as_deref().unwrap_or("RSA") != "RSA" {
                warn!(kid = %kid, kty = ?jwk.kty, "skipping non-RSA JWKS entry");
                continue;
            }
            let (Some(n), Some(e)) = (jwk.n, jwk.e) else {
                warn!(kid = %kid, "skipping JWKS entry missing modulus/exponent");
                continue;
            };
            match DecodingKey::from_rsa_components(&n, &e) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(err) => {
                    warn!(kid = %kid, "failed to parse JWKS entry: {}", err);
                }
            }
        }

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_N: &str = "3JeEjhemQLDPfILb_1XFA6E6wUjoW-FtEHQ2iMeBX7aQAcFMHV__cXvhNFn2HlhU_pTlQyYOl6jBY0sof0v-QjMevZYvazIGRmkKB8pUNYVNdpBGI_U1pTdpsK912JiPfuBOuUN0GxMmN_8qd2EwxWyTC4lbexPDzmCZHg8swnMASgF10i_u0hRm6TJYDxj98XYaK2ZHoWPiveStbPIjUTNxmAUwtoPAYfU2oGuQzxTO3r2ramb9P5Y78cJpZnc2nyH3Zhct9po37x5NRIAUA8yoxXzdvWAy3b83a6GEQYncNOCrBHutfeF5CULi5kHbXGEjarzQxvHy35ehODHINQ";

    fn jwks_body(kid: &str) -> serde_json::Value {
        serde_json::json!({
            "keys": [{
                "kid": kid,
                "kty": "RSA",
                "alg": "RS256",
                "use": "sig",
                "n": TEST_N,
                "e": "AQAB"
            }]
        })
    }

    #[tokio::test]
    async fn test_fetch_and_cache_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body("key-1")))
            .expect(1) // second lookup must be served from cache
            .mount(&server)
            .await;

        let cache = JwksCache::new(
            format!("{}/jwks.json", server.uri()),
            Duration::from_secs(3600),
            Duration::from_secs(5),
        );

        cache.decoding_key("key-1").await.unwrap();
        cache.decoding_key("key-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_kid_after_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body("key-1")))
            .mount(&server)
            .await;

        let cache = JwksCache::new(
            format!("{}/jwks.json", server.uri()),
            Duration::from_secs(3600),
            Duration::from_secs(5),
        );

        let err = cache.decoding_key("key-2").await.err().unwrap();
        assert!(matches!(err, AuthError::UnknownKeyId(k) if k == "key-2"));
    }

    #[tokio::test]
    async fn test_fetch_failure_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks.json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let cache = JwksCache::new(
            format!("{}/jwks.json", server.uri()),
            Duration::from_secs(3600),
            Duration::from_secs(5),
        );

        let err = cache.decoding_key("key-1").await.err().unwrap();
        assert!(matches!(err, AuthError::JwksFetchFailed(_)));
    }

    #[tokio::test]
    async fn test_non_rsa_keys_skipped() {
        let server = MockServer::start().await;
        let body = serde_json::json!({
            "keys": [
                { "kid": "ec-key", "kty": "EC", "crv": "P-256" },
                jwks_body("rsa-key")["keys"][0]
            ]
        });
        Mock::given(method("GET"))
            .and(path("/jwks.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let cache = JwksCache::new(
            format!("{}/jwks.json", server.uri()),
            Duration::from_secs(3600),
            Duration::from_secs(5),
        );

        cache.decoding_key("rsa-key").await.unwrap();
        let err = cache.decoding_key("ec-key").await.err().unwrap();
        assert!(matches!(err, AuthError::UnknownKeyId(_)));
    }
}
