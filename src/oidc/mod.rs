//! OIDC token verification.
//!
//! Discovery documents and JWKS are fetched lazily per issuer and cached
//! with a bounded TTL. A signature-verification miss on an unknown `kid`
//! triggers one refetch within the same request, so recently rotated
//! provider keys verify without a client retry. Refreshes are single-flight
//! per issuer: concurrent requests wait on one fetch instead of stampeding
//! the provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::identity::pool::ResolvedIssuer;
use crate::identity::ClaimSet;

const SUPPORTED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// An error that can arise verifying an OIDC token.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VerifyError {
    /// The token is not a structurally valid JWT.
    #[error("cannot decode token")]
    Malformed(#[source] jsonwebtoken::errors::Error),

    /// The token header carries no `kid`.
    #[error("token header 'kid' not found")]
    MissingKeyId,

    /// The `alg` header names an algorithm outside the supported set.
    #[error("algorithm in 'alg' header is not supported")]
    UnsupportedAlgorithm,

    /// The issuer's discovery document or JWKS could not be fetched.
    #[error("cannot fetch keys for issuer '{issuer}'")]
    Fetch {
        /// The issuer whose keys were requested.
        issuer: String,
        /// The underlying HTTP error.
        #[source]
        source: reqwest::Error,
    },

    /// No JWKS key matches the token's `kid`, even after a refresh.
    #[error("no jwks key with key id '{0}'")]
    KeyNotFound(String),

    /// The matched JWK cannot be used as a decoding key.
    #[error("unusable jwks key")]
    InvalidKey(#[source] jsonwebtoken::errors::Error),

    /// Signature, audience, issuer, or time validation failed.
    #[error("token validation failed")]
    Validation(#[source] jsonwebtoken::errors::Error),

    /// The verified token's claims are not a JSON object.
    #[error("token claims are not an object")]
    NotAnObject,
}

/// A token parsed without signature verification.
///
/// Only good for routing (issuer lookup) and for reading the `sub` claim a
/// proof-of-possession signature covers; everything here is untrusted until
/// [`TokenVerifier::verify`] succeeds.
#[derive(Debug, Clone)]
pub struct UnverifiedToken {
    /// The `iss` claim.
    pub issuer: String,
    /// The `sub` claim, when present.
    pub subject: Option<String>,
    /// The unverified claim set.
    pub claims: ClaimSet,
}

/// Parses a token without verifying anything but its structure.
///
/// # Errors
///
/// [`VerifyError::Malformed`] for undecodable tokens,
/// [`VerifyError::UnsupportedAlgorithm`] for algorithms outside the
/// supported set, and [`VerifyError::NotAnObject`] when the claims are not
/// a JSON object or carry no `iss`.
pub fn parse_unverified(token: &str) -> Result<UnverifiedToken, VerifyError> {
    let header = decode_header(token).map_err(VerifyError::Malformed)?;
    if !SUPPORTED_ALGORITHMS.contains(&header.alg) {
        return Err(VerifyError::UnsupportedAlgorithm);
    }

    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<serde_json::Value>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(VerifyError::Malformed)?;

    let claims = match data.claims {
        serde_json::Value::Object(map) => map,
        _ => return Err(VerifyError::NotAnObject),
    };

    let issuer = claims
        .get("iss")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
        .ok_or(VerifyError::NotAnObject)?;
    let subject = claims
        .get("sub")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned);

    Ok(UnverifiedToken {
        issuer,
        subject,
        claims,
    })
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

#[derive(Default)]
struct KeysState {
    jwks: Option<JwkSet>,
    fetched_at: Option<Instant>,
}

/// Per-issuer key cache with a single-flight refresh lock.
struct IssuerKeys {
    state: RwLock<KeysState>,
    refresh: Mutex<()>,
}

impl IssuerKeys {
    fn new() -> Self {
        Self {
            state: RwLock::new(KeysState::default()),
            refresh: Mutex::new(()),
        }
    }

    /// Returns the key for `kid` if the cache is fresh and has it.
    async fn find_fresh(&self, kid: &str, ttl: Duration) -> Option<Jwk> {
        let state = self.state.read().await;
        let fresh = state.fetched_at.is_some_and(|at| at.elapsed() <= ttl);
        if !fresh {
            return None;
        }
        state.jwks.as_ref()?.find(kid).cloned()
    }
}

/// Cryptographic verifier for OIDC bearer tokens.
///
/// Safe to share across requests; the internal caches use shared-read /
/// exclusive-write locking.
pub struct TokenVerifier {
    http: reqwest::Client,
    issuers: RwLock<HashMap<String, Arc<IssuerKeys>>>,
    cache_ttl: Duration,
    leeway: u64,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("cache_ttl", &self.cache_ttl)
            .field("leeway", &self.leeway)
            .finish()
    }
}

impl Default for TokenVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL, 0)
    }
}

impl TokenVerifier {
    /// Creates a verifier with the given JWKS cache TTL and clock-skew
    /// leeway in seconds (default deployments use zero leeway).
    pub fn new(cache_ttl: Duration, leeway: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            http,
            issuers: RwLock::new(HashMap::new()),
            cache_ttl,
            leeway,
        }
    }

    /// Verifies `token` against the matched issuer: signature under the
    /// issuer's JWKS, `iss` equality with the resolved issuer URL, `aud`
    /// equality with the configured client id, and `exp`/`nbf` against the
    /// clock.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError`]; the issuance handler surfaces every variant
    /// as `invalid-credentials`.
    pub async fn verify(
        &self,
        token: &str,
        issuer: &ResolvedIssuer,
    ) -> Result<ClaimSet, VerifyError> {
        let header = decode_header(token).map_err(VerifyError::Malformed)?;
        if !SUPPORTED_ALGORITHMS.contains(&header.alg) {
            return Err(VerifyError::UnsupportedAlgorithm);
        }
        let kid = header.kid.ok_or(VerifyError::MissingKeyId)?;

        let jwk = self.decoding_jwk(&issuer.issuer_url, &kid).await?;
        let key = DecodingKey::from_jwk(&jwk).map_err(VerifyError::InvalidKey)?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&issuer.issuer_url]);
        validation.set_audience(&[&issuer.config.client_id]);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = self.leeway;

        let data = decode::<serde_json::Value>(token, &key, &validation)
            .map_err(VerifyError::Validation)?;

        match data.claims {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(VerifyError::NotAnObject),
        }
    }

    async fn issuer_entry(&self, issuer_url: &str) -> Arc<IssuerKeys> {
        if let Some(entry) = self.issuers.read().await.get(issuer_url) {
            return Arc::clone(entry);
        }
        let mut issuers = self.issuers.write().await;
        Arc::clone(
            issuers
                .entry(issuer_url.to_owned())
                .or_insert_with(|| Arc::new(IssuerKeys::new())),
        )
    }

    /// Finds the JWK for `kid`, refreshing the issuer's keys at most once.
    async fn decoding_jwk(&self, issuer_url: &str, kid: &str) -> Result<Jwk, VerifyError> {
        let entry = self.issuer_entry(issuer_url).await;

        if let Some(jwk) = entry.find_fresh(kid, self.cache_ttl).await {
            return Ok(jwk);
        }

        // Single-flight: one fetch per issuer; latecomers re-check first.
        let _guard = entry.refresh.lock().await;
        if let Some(jwk) = entry.find_fresh(kid, self.cache_ttl).await {
            return Ok(jwk);
        }

        let jwks = self.fetch_jwks(issuer_url).await?;
        let found = jwks.find(kid).cloned();

        let mut state = entry.state.write().await;
        state.jwks = Some(jwks);
        state.fetched_at = Some(Instant::now());
        drop(state);

        found.ok_or_else(|| VerifyError::KeyNotFound(kid.to_owned()))
    }

    async fn fetch_jwks(&self, issuer_url: &str) -> Result<JwkSet, VerifyError> {
        let fetch_err = |source| VerifyError::Fetch {
            issuer: issuer_url.to_owned(),
            source,
        };

        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            issuer_url.trim_end_matches('/')
        );
        let discovery: DiscoveryDocument = self
            .http
            .get(&discovery_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(fetch_err)?
            .json()
            .await
            .map_err(fetch_err)?;

        debug!(issuer = issuer_url, jwks_uri = %discovery.jwks_uri, "refreshing jwks");

        self.http
            .get(&discovery.jwks_uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(fetch_err)?
            .json::<JwkSet>()
            .await
            .map_err(fetch_err)
    }
}
