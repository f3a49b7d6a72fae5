//! The issuance service: the per-request pipeline and its RPC-facing types.
//!
//! The request/response types mirror the wire schema (the REST gateway uses
//! the same JSON shape, with bytes base64-encoded); transport wiring (the
//! gRPC/HTTP multiplexer) lives outside this crate. Handler failures map
//! onto `tonic::Status` codes, and a per-request recovery boundary converts
//! panics into `internal` so one bad request never takes the server down.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};
use tracing::{debug, error, info};

use crate::algorithms::{AlgorithmError, AlgorithmRegistry, ClientKey};
use crate::ca::{CaError, CertificateAuthority, CodeSigningCertificate};
use crate::cert::{self, CertError, ParsedCsr};
use crate::config::{ConfigError, IdentityConfig};
use crate::ctlog::{CtError, CtLogClient};
use crate::identity::pool::IssuerSummary;
use crate::identity::{IssuerPool, Principal};
use crate::oidc::{self, TokenVerifier};

/// The OIDC credential presented with an issuance request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// The bearer identity token.
    pub oidc_identity_token: String,
}

/// A raw public key plus its claimed algorithm hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyRequest {
    /// Optional algorithm hint; the key itself is authoritative.
    #[serde(default)]
    pub algorithm: Option<String>,
    /// The public key, PEM `PUBLIC KEY` or base64 SubjectPublicKeyInfo DER.
    pub content: String,
}

/// An issuance request: a token plus either a CSR or a raw key with a proof
/// of possession.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSigningCertificateRequest {
    /// The OIDC credential.
    pub credentials: Credentials,
    /// PKCS#10 CSR (PEM or DER), base64-encoded on the wire.
    #[serde(default, with = "base64_opt")]
    pub certificate_signing_request: Option<Vec<u8>>,
    /// Raw public key, mutually exclusive with the CSR.
    #[serde(default)]
    pub public_key: Option<PublicKeyRequest>,
    /// Signature over the UTF-8 bytes of the token's `sub` claim.
    #[serde(default, with = "base64_opt")]
    pub proof_of_possession: Option<Vec<u8>>,
}

/// A successful issuance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningCertificate {
    /// The issued certificate followed by the CA chain, PEM, leaf first.
    pub chain: Vec<String>,
    /// The TLS-encoded SCT list; empty when CT is disabled.
    #[serde(default, with = "base64_bytes")]
    pub signed_certificate_timestamp: Vec<u8>,
}

/// The CA trust bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustBundle {
    /// Certificate chains, PEM, each leaf-issuer first and root last.
    pub chains: Vec<Vec<String>>,
}

/// The issuer configuration surface reported to clients.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceConfiguration {
    /// The configured issuers.
    pub issuers: Vec<IssuerSummary>,
}

/// Readiness/liveness states.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HealthStatus {
    /// The service can issue certificates.
    Serving,
    /// The signing backend is not usable.
    NotServing,
}

/// Copies the bearer token out of gRPC request metadata (the REST gateway
/// places the `Authorization` header in the same slot).
pub fn bearer_token(metadata: &MetadataMap) -> Option<String> {
    metadata
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::to_owned)
}

/// Internal pipeline error; every variant maps onto one status code.
#[derive(Debug, Error)]
enum IssueError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("invalid identity credentials: {0}")]
    InvalidCredentials(String),
    #[error("issuer '{0}' is not trusted")]
    PermissionDenied(String),
    #[error("proof of possession verification failed")]
    FailedPrecondition,
    #[error("{0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<IssueError> for Status {
    fn from(error: IssueError) -> Self {
        match error {
            IssueError::InvalidArgument(msg) => Status::new(Code::InvalidArgument, msg),
            IssueError::UnsupportedAlgorithm(msg) => Status::new(
                Code::InvalidArgument,
                format!("unsupported signing algorithm: {msg}"),
            ),
            IssueError::InvalidCredentials(msg) => {
                debug!(%msg, "rejecting invalid credentials");
                Status::new(Code::Unauthenticated, "invalid identity credentials")
            }
            IssueError::PermissionDenied(issuer) => Status::new(
                Code::PermissionDenied,
                format!("issuer '{issuer}' is not trusted"),
            ),
            IssueError::FailedPrecondition => Status::new(
                Code::FailedPrecondition,
                "proof of possession verification failed",
            ),
            IssueError::Unavailable(msg) => Status::new(Code::Unavailable, msg),
            IssueError::Internal(msg) => {
                // Details are logged, never returned.
                error!(%msg, "internal issuance failure");
                Status::new(Code::Internal, "internal error")
            }
        }
    }
}

impl From<CaError> for IssueError {
    fn from(error: CaError) -> Self {
        match error {
            CaError::Unavailable(msg) => IssueError::Unavailable(msg),
            CaError::BadConfig(msg) | CaError::SignFailed(msg) => IssueError::Internal(msg),
        }
    }
}

impl From<CtError> for IssueError {
    fn from(error: CtError) -> Self {
        match error {
            CtError::Network(_) | CtError::Http(_) => {
                IssueError::Unavailable("ct log unreachable".to_owned())
            }
            other => IssueError::Internal(other.to_string()),
        }
    }
}

/// Builder for [`CaService`].
pub struct CaServiceBuilder {
    ca: Arc<dyn CertificateAuthority>,
    ct: Option<CtLogClient>,
    registry: AlgorithmRegistry,
    verifier: TokenVerifier,
    pool: IssuerPool,
}

impl std::fmt::Debug for CaServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaServiceBuilder")
            .field("ct", &self.ct.is_some())
            .finish()
    }
}

impl CaServiceBuilder {
    /// Starts a builder over the given signing backend with the default
    /// algorithm registry, no CT log, and an empty issuer pool.
    pub fn new(ca: Arc<dyn CertificateAuthority>) -> Self {
        Self {
            ca,
            ct: None,
            registry: AlgorithmRegistry::default(),
            verifier: TokenVerifier::default(),
            pool: IssuerPool::default(),
        }
    }

    /// Builds the issuer pool from a validated identity configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn issuers(mut self, config: IdentityConfig) -> Result<Self, ConfigError> {
        self.pool = IssuerPool::from_config(&config)?;
        Ok(self)
    }

    /// Enables CT submission through the given client.
    #[must_use]
    pub fn ct_log(mut self, client: CtLogClient) -> Self {
        self.ct = Some(client);
        self
    }

    /// Replaces the algorithm allow-list.
    #[must_use]
    pub fn algorithms(mut self, registry: AlgorithmRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the token verifier (cache TTL / leeway tuning).
    #[must_use]
    pub fn verifier(mut self, verifier: TokenVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Finishes the builder.
    pub fn build(self) -> CaService {
        CaService {
            inner: Arc::new(ServiceInner {
                ca: self.ca,
                ct: self.ct,
                registry: self.registry,
                verifier: self.verifier,
                pool: ArcSwap::from_pointee(self.pool),
            }),
        }
    }
}

struct ServiceInner {
    ca: Arc<dyn CertificateAuthority>,
    ct: Option<CtLogClient>,
    registry: AlgorithmRegistry,
    verifier: TokenVerifier,
    pool: ArcSwap<IssuerPool>,
}

/// The issuance service. Cheap to clone; safe to share across request
/// workers.
#[derive(Clone)]
pub struct CaService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for CaService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaService")
            .field("ct", &self.inner.ct.is_some())
            .finish()
    }
}

impl CaService {
    /// Runs the issuance pipeline for one request.
    ///
    /// # Errors
    ///
    /// A [`Status`] carrying the mapped error kind; see the crate's error
    /// model for the full table.
    pub async fn create_signing_certificate(
        &self,
        request: CreateSigningCertificateRequest,
    ) -> Result<SigningCertificate, Status> {
        self.create_signing_certificate_with_deadline(request, None)
            .await
    }

    /// As [`CaService::create_signing_certificate`], aborting with
    /// `DEADLINE_EXCEEDED` once the deadline elapses. The pipeline runs in
    /// its own task so a panic surfaces as `internal` instead of tearing
    /// down the worker.
    pub async fn create_signing_certificate_with_deadline(
        &self,
        request: CreateSigningCertificateRequest,
        deadline: Option<Duration>,
    ) -> Result<SigningCertificate, Status> {
        let inner = Arc::clone(&self.inner);
        let mut handle = tokio::spawn(async move { issue(&inner, request).await });

        let joined = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return Err(Status::new(Code::DeadlineExceeded, "request deadline exceeded"));
                }
            },
            None => (&mut handle).await,
        };

        match joined {
            Ok(result) => result.map_err(Status::from),
            Err(join_error) => {
                error!(%join_error, "issuance task failed");
                Err(Status::new(Code::Internal, "internal error"))
            }
        }
    }

    /// Returns the CA trust bundle.
    ///
    /// # Errors
    ///
    /// `UNAVAILABLE` when the backend cannot serve its chains.
    pub async fn get_trust_bundle(&self) -> Result<TrustBundle, Status> {
        let chains = self
            .inner
            .ca
            .trust_bundle()
            .await
            .map_err(|e| Status::from(IssueError::from(e)))?;

        Ok(TrustBundle {
            chains: chains.iter().map(|c| cert::chain_to_pem(c)).collect(),
        })
    }

    /// Reports the configured issuers.
    pub fn get_configuration(&self) -> ServiceConfiguration {
        ServiceConfiguration {
            issuers: self.inner.pool.load().summaries(),
        }
    }

    /// Readiness: the backend must be able to produce its root.
    pub async fn check_health(&self) -> HealthStatus {
        match self.inner.ca.root().await {
            Ok(_) => HealthStatus::Serving,
            Err(_) => HealthStatus::NotServing,
        }
    }

    /// Atomically replaces the issuer pool (configuration reload). In-flight
    /// requests keep the pool they started with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the new configuration fails validation;
    /// the previous pool stays in place.
    pub fn reload_issuers(&self, config: &IdentityConfig) -> Result<(), ConfigError> {
        let pool = IssuerPool::from_config(config)?;
        self.inner.pool.store(Arc::new(pool));
        info!("issuer pool reloaded");
        Ok(())
    }

    /// Releases backend resources.
    pub fn close(&self) {
        self.inner.ca.close();
    }
}

/// The pipeline: validate → authorize algorithm → verify possession →
/// authenticate → extract principal → sign precert → log → assemble final.
async fn issue(
    inner: &ServiceInner,
    request: CreateSigningCertificateRequest,
) -> Result<SigningCertificate, IssueError> {
    let token = request.credentials.oidc_identity_token.trim();
    if token.is_empty() {
        return Err(IssueError::InvalidArgument(
            "missing oidc identity token".to_owned(),
        ));
    }

    // 1. Key material; a request carrying both forms is ambiguous.
    let (key, csr) = match (&request.certificate_signing_request, &request.public_key) {
        (Some(_), Some(_)) => {
            return Err(IssueError::InvalidArgument(
                "request carries both a csr and a raw public key".to_owned(),
            ))
        }
        (Some(raw), None) => {
            let csr = ParsedCsr::parse(raw).map_err(map_cert_error)?;
            (csr.key().clone(), Some(csr))
        }
        (None, Some(public_key)) => {
            if request.proof_of_possession.is_none() {
                return Err(IssueError::InvalidArgument(
                    "missing proof of possession".to_owned(),
                ));
            }
            (parse_public_key(&public_key.content)?, None)
        }
        (None, None) => {
            return Err(IssueError::InvalidArgument(
                "missing csr or public key".to_owned(),
            ))
        }
    };

    // 2. Algorithm policy, before any token work.
    let algorithm = inner.registry.check(&key).map_err(map_algorithm_error)?;

    // 3. Proof of possession. The raw-key form signs the UTF-8 bytes of the
    // token's `sub` claim, with no framing.
    let unverified =
        oidc::parse_unverified(token).map_err(|e| IssueError::InvalidCredentials(e.to_string()))?;

    match (&csr, &request.proof_of_possession) {
        (Some(csr), _) => csr.verify().map_err(|_| IssueError::FailedPrecondition)?,
        (None, Some(pop)) => {
            let subject = unverified.subject.as_deref().ok_or_else(|| {
                IssueError::InvalidCredentials("token has no 'sub' claim".to_owned())
            })?;
            key.verify(subject.as_bytes(), pop)
                .map_err(|_| IssueError::FailedPrecondition)?;
        }
        (None, None) => unreachable!("validated above"),
    }

    // 4. Issuer lookup and token verification. The pool guard is not held
    // across awaits; a concurrent reload swaps the pool for later requests.
    let issuer = inner
        .pool
        .load()
        .lookup(&unverified.issuer, &unverified.claims)
        .ok_or_else(|| IssueError::PermissionDenied(unverified.issuer.clone()))?;

    let claims = inner
        .verifier
        .verify(token, &issuer)
        .await
        .map_err(|e| IssueError::InvalidCredentials(e.to_string()))?;

    // 5. Principal extraction.
    let principal = Principal::from_claims(&issuer, &claims)
        .map_err(|e| IssueError::InvalidCredentials(e.to_string()))?;

    debug!(
        principal = %principal.name(),
        issuer = principal.issuer(),
        %algorithm,
        "request authenticated"
    );

    // 6. Sign the precertificate.
    let csc = inner
        .ca
        .create_certificate(&principal, key.spki_der())
        .await?;

    // 7./8. Transparency log and final assembly.
    let (final_der, sct_list) = match &inner.ct {
        Some(ct) => {
            let sct = ct.submit_precert(csc.precert_der(), csc.chain_der()).await?;
            ct.verify_sct(&sct, &csc.final_tbs_der()?, &csc.issuer_spki_der()?)?;

            let sct_list = sct.sct_list_bytes();
            let final_der = csc.finalize(Some(&sct_list)).await?;
            (final_der, sct_list)
        }
        None => (csc.finalize(None).await?, Vec::new()),
    };

    info!(
        principal = %principal.name(),
        issuer = principal.issuer(),
        ct = inner.ct.is_some(),
        "issued signing certificate"
    );

    let mut chain = cert::chain_to_pem(std::slice::from_ref(&final_der));
    chain.extend(csc.chain_pem());

    Ok(SigningCertificate {
        chain,
        signed_certificate_timestamp: sct_list,
    })
}

fn parse_public_key(content: &str) -> Result<ClientKey, IssueError> {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    let der = if content.contains("-----BEGIN") {
        let block = pem::parse(content.as_bytes()).map_err(|e| {
            IssueError::InvalidArgument(format!("unparseable public key pem: {e}"))
        })?;
        if block.tag() != "PUBLIC KEY" {
            return Err(IssueError::InvalidArgument(format!(
                "unexpected public key pem tag '{}'",
                block.tag()
            )));
        }
        block.into_contents()
    } else {
        BASE64
            .decode(content.trim())
            .map_err(|_| IssueError::InvalidArgument("public key is not base64".to_owned()))?
    };

    ClientKey::from_spki_der(&der).map_err(map_algorithm_error)
}

fn map_algorithm_error(error: AlgorithmError) -> IssueError {
    match error {
        AlgorithmError::ParseKey(_) => {
            IssueError::InvalidArgument("unparseable public key".to_owned())
        }
        AlgorithmError::UnsupportedKey(msg) => IssueError::UnsupportedAlgorithm(msg),
        AlgorithmError::NotAllowed(id) => IssueError::UnsupportedAlgorithm(id.to_string()),
        AlgorithmError::UnknownFlag(msg) => IssueError::InvalidArgument(msg),
        AlgorithmError::SignatureInvalid => IssueError::FailedPrecondition,
    }
}

fn map_cert_error(error: CertError) -> IssueError {
    match error {
        CertError::CsrSignature => IssueError::FailedPrecondition,
        CertError::UnsupportedCsrKey(msg) => IssueError::UnsupportedAlgorithm(msg),
        other => IssueError::InvalidArgument(other.to_string()),
    }
}

mod base64_bytes {
    //! Bytes as base64 strings, matching the REST gateway encoding.

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    //! Optional bytes as base64 strings.

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_extraction() {
        let mut metadata = MetadataMap::new();
        assert!(bearer_token(&metadata).is_none());

        metadata.insert("authorization", "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&metadata).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_request_json_shape() {
        let raw = r#"{
            "credentials": { "oidc_identity_token": "t" },
            "public_key": { "content": "LS0t" },
            "proof_of_possession": "c2ln"
        }"#;

        let request: CreateSigningCertificateRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.proof_of_possession.as_deref(), Some(b"sig".as_ref()));
        assert!(request.certificate_signing_request.is_none());

        let response = SigningCertificate {
            chain: vec!["-----BEGIN CERTIFICATE-----".to_owned()],
            signed_certificate_timestamp: vec![1, 2, 3],
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["signed_certificate_timestamp"], "AQID");
    }

    #[test]
    fn test_error_code_mapping() {
        let cases = [
            (
                IssueError::InvalidArgument("x".into()),
                Code::InvalidArgument,
            ),
            (
                IssueError::UnsupportedAlgorithm("x".into()),
                Code::InvalidArgument,
            ),
            (
                IssueError::InvalidCredentials("x".into()),
                Code::Unauthenticated,
            ),
            (
                IssueError::PermissionDenied("x".into()),
                Code::PermissionDenied,
            ),
            (IssueError::FailedPrecondition, Code::FailedPrecondition),
            (IssueError::Unavailable("x".into()), Code::Unavailable),
            (IssueError::Internal("x".into()), Code::Internal),
        ];

        for (error, code) in cases {
            assert_eq!(Status::from(error).code(), code);
        }
    }

    #[test]
    fn test_internal_details_not_returned() {
        let status = Status::from(IssueError::Internal("secret backend detail".into()));
        assert_eq!(status.message(), "internal error");
    }
}
