//! Certificate Transparency v1 client.
//!
//! Submits signed precertificates to a log's `add-pre-chain` endpoint and
//! validates the returned SCT. The digitally-signed structure is
//! reconstructed over the de-poisoned `tbsCertificate` exactly as RFC 6962
//! prescribes, so an SCT accepted here will verify for relying parties.

use std::io::Write as _;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::algorithms::ClientKey;

const ADD_PRE_CHAIN: &str = "/ct/v1/add-pre-chain";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// RFC 5246 SignatureAndHashAlgorithm code points.
const HASH_SHA256: u8 = 4;
const SIG_RSA: u8 = 1;
const SIG_ECDSA: u8 = 3;

// RFC 6962 constants.
const SCT_VERSION_V1: u8 = 0;
const SIGNATURE_TYPE_CERTIFICATE_TIMESTAMP: u8 = 0;
const LOG_ENTRY_TYPE_PRECERT: u16 = 1;

/// An error from CT log interaction or SCT validation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CtError {
    /// The client options are invalid (bad TLS root or pinned key).
    #[error("invalid ct log client configuration: {0}")]
    BadConfig(String),

    /// The log could not be reached.
    #[error("ct log unreachable")]
    Network(#[source] reqwest::Error),

    /// The log answered with a server error, after one retry.
    #[error("ct log returned status {0}")]
    Http(u16),

    /// The log's response could not be interpreted.
    #[error("malformed ct log response: {0}")]
    Malformed(String),

    /// The SCT signature algorithm does not match the pinned key.
    #[error("unsupported sct signature algorithm ({hash}, {signature})")]
    UnsupportedSignature {
        /// Hash algorithm code point.
        hash: u8,
        /// Signature algorithm code point.
        signature: u8,
    },

    /// The SCT signature did not verify under the pinned log key.
    #[error("sct signature verification failed")]
    SignatureInvalid,
}

/// Client settings.
#[derive(Debug, Clone, Default)]
pub struct CtLogOptions {
    /// Base URL of the log, up to and including the log prefix.
    pub log_url: String,
    /// Extra TLS root to trust (e.g. a test log's self-signed cert), PEM.
    pub tls_root_pem: Option<Vec<u8>>,
    /// Pinned log public key (PEM SubjectPublicKeyInfo); when set, returned
    /// SCTs are verified before being accepted.
    pub pinned_public_key_pem: Option<Vec<u8>>,
}

/// A Merkle-tree inclusion receipt returned by the log.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SignedCertificateTimestamp {
    /// SCT version (v1 = 0).
    pub version: u8,
    /// SHA-256 hash of the log's public key.
    pub log_id: [u8; 32],
    /// Issuance timestamp, milliseconds since the epoch.
    pub timestamp_ms: u64,
    /// Opaque CT extensions.
    pub extensions: Vec<u8>,
    /// Hash algorithm code point of the log signature.
    pub hash_algorithm: u8,
    /// Signature algorithm code point of the log signature.
    pub signature_algorithm: u8,
    /// The log signature bytes.
    pub signature: Vec<u8>,
}

impl SignedCertificateTimestamp {
    /// TLS-encodes this SCT (the `SerializedSCT` contents).
    pub fn tls_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.signature.len());
        out.push(self.version);
        out.extend_from_slice(&self.log_id);
        #[allow(clippy::unwrap_used)] // Vec writes cannot fail
        {
            out.write_u64::<BigEndian>(self.timestamp_ms).unwrap();
            out.write_u16::<BigEndian>(self.extensions.len() as u16)
                .unwrap();
            out.write_all(&self.extensions).unwrap();
            out.push(self.hash_algorithm);
            out.push(self.signature_algorithm);
            out.write_u16::<BigEndian>(self.signature.len() as u16)
                .unwrap();
            out.write_all(&self.signature).unwrap();
        }
        out
    }

    /// TLS-encodes the one-element `SignedCertificateTimestampList` carried
    /// in the final certificate's SCT extension.
    pub fn sct_list_bytes(&self) -> Vec<u8> {
        let sct = self.tls_bytes();
        let mut out = Vec::with_capacity(sct.len() + 4);
        #[allow(clippy::unwrap_used)] // Vec writes cannot fail
        {
            out.write_u16::<BigEndian>((sct.len() + 2) as u16).unwrap();
            out.write_u16::<BigEndian>(sct.len() as u16).unwrap();
            out.write_all(&sct).unwrap();
        }
        out
    }
}

#[derive(Serialize)]
struct AddChainRequest {
    chain: Vec<String>,
}

#[derive(Deserialize)]
struct AddChainResponse {
    sct_version: u8,
    id: String,
    timestamp: u64,
    #[serde(default)]
    extensions: String,
    signature: String,
}

/// HTTP(S) client for one CT log, shared across requests.
pub struct CtLogClient {
    http: reqwest::Client,
    url: String,
    pinned: Option<ClientKey>,
}

impl std::fmt::Debug for CtLogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtLogClient")
            .field("url", &self.url)
            .field("pinned", &self.pinned.is_some())
            .finish()
    }
}

impl CtLogClient {
    /// Builds a client from options.
    ///
    /// # Errors
    ///
    /// [`CtError::BadConfig`] for an unusable TLS root or pinned key.
    pub fn new(options: CtLogOptions) -> Result<Self, CtError> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);

        if let Some(pem) = &options.tls_root_pem {
            let root = reqwest::Certificate::from_pem(pem)
                .map_err(|e| CtError::BadConfig(format!("tls root: {e}")))?;
            builder = builder.add_root_certificate(root).use_rustls_tls();
        }

        let pinned = options
            .pinned_public_key_pem
            .as_deref()
            .map(parse_pinned_key)
            .transpose()?;

        let http = builder
            .build()
            .map_err(|e| CtError::BadConfig(e.to_string()))?;

        Ok(Self {
            http,
            url: options.log_url.trim_end_matches('/').to_owned(),
            pinned,
        })
    }

    /// Submits a signed precertificate chain (`[precert, issuer…, root]`)
    /// and returns the log's SCT. A 5xx answer is retried once; any other
    /// failure propagates.
    ///
    /// # Errors
    ///
    /// [`CtError::Http`] after the retry, [`CtError::Network`] for transport
    /// failures, [`CtError::Malformed`] for undecodable responses.
    pub async fn submit_precert(
        &self,
        precert_der: &[u8],
        chain: &[Vec<u8>],
    ) -> Result<SignedCertificateTimestamp, CtError> {
        let request = AddChainRequest {
            chain: std::iter::once(precert_der.to_vec())
                .chain(chain.iter().cloned())
                .map(|der| BASE64.encode(der))
                .collect(),
        };
        let url = format!("{}{ADD_PRE_CHAIN}", self.url);

        let mut response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(CtError::Network)?;

        if response.status().is_server_error() {
            warn!(status = %response.status(), "ct log returned a server error, retrying once");
            response = self
                .http
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(CtError::Network)?;
        }

        if !response.status().is_success() {
            return Err(CtError::Http(response.status().as_u16()));
        }

        let body: AddChainResponse = response
            .json()
            .await
            .map_err(|e| CtError::Malformed(e.to_string()))?;

        debug!(timestamp = body.timestamp, "ct log accepted precertificate");
        parse_sct(&body)
    }

    /// Verifies the SCT signature against the pinned log key, when one is
    /// configured. `final_tbs_der` is the de-poisoned certificate body;
    /// `issuer_spki_der` is the signing CA's SubjectPublicKeyInfo.
    ///
    /// # Errors
    ///
    /// [`CtError::SignatureInvalid`] on mismatch,
    /// [`CtError::UnsupportedSignature`] for algorithm pairs outside SHA-256
    /// with ECDSA or RSA.
    pub fn verify_sct(
        &self,
        sct: &SignedCertificateTimestamp,
        final_tbs_der: &[u8],
        issuer_spki_der: &[u8],
    ) -> Result<(), CtError> {
        let Some(pinned) = &self.pinned else {
            return Ok(());
        };

        if sct.hash_algorithm != HASH_SHA256
            || !matches!(sct.signature_algorithm, SIG_ECDSA | SIG_RSA)
        {
            return Err(CtError::UnsupportedSignature {
                hash: sct.hash_algorithm,
                signature: sct.signature_algorithm,
            });
        }

        let signed = digitally_signed_bytes(sct, final_tbs_der, issuer_spki_der);
        pinned
            .verify(&signed, &sct.signature)
            .map_err(|_| CtError::SignatureInvalid)
    }
}

/// The RFC 6962 `digitally-signed` input for a precertificate SCT.
fn digitally_signed_bytes(
    sct: &SignedCertificateTimestamp,
    final_tbs_der: &[u8],
    issuer_spki_der: &[u8],
) -> Vec<u8> {
    let issuer_key_hash = Sha256::digest(issuer_spki_der);

    let mut out = Vec::with_capacity(final_tbs_der.len() + 64);
    #[allow(clippy::unwrap_used)] // Vec writes cannot fail
    {
        out.push(sct.version);
        out.push(SIGNATURE_TYPE_CERTIFICATE_TIMESTAMP);
        out.write_u64::<BigEndian>(sct.timestamp_ms).unwrap();
        out.write_u16::<BigEndian>(LOG_ENTRY_TYPE_PRECERT).unwrap();
        out.write_all(&issuer_key_hash).unwrap();
        out.write_u24::<BigEndian>(final_tbs_der.len() as u32).unwrap();
        out.write_all(final_tbs_der).unwrap();
        out.write_u16::<BigEndian>(sct.extensions.len() as u16)
            .unwrap();
        out.write_all(&sct.extensions).unwrap();
    }
    out
}

fn parse_pinned_key(pem_bytes: &[u8]) -> Result<ClientKey, CtError> {
    let block =
        pem::parse(pem_bytes).map_err(|e| CtError::BadConfig(format!("pinned key: {e}")))?;
    if block.tag() != "PUBLIC KEY" {
        return Err(CtError::BadConfig(format!(
            "pinned key: unexpected pem tag '{}'",
            block.tag()
        )));
    }
    ClientKey::from_spki_der(block.contents())
        .map_err(|e| CtError::BadConfig(format!("pinned key: {e}")))
}

fn parse_sct(body: &AddChainResponse) -> Result<SignedCertificateTimestamp, CtError> {
    let malformed = |what: &str| CtError::Malformed(what.to_owned());

    if body.sct_version != SCT_VERSION_V1 {
        return Err(CtError::Malformed(format!(
            "unsupported sct version {}",
            body.sct_version
        )));
    }

    let log_id: [u8; 32] = BASE64
        .decode(&body.id)
        .map_err(|_| malformed("log id is not base64"))?
        .try_into()
        .map_err(|_| malformed("log id is not 32 bytes"))?;

    let extensions = BASE64
        .decode(&body.extensions)
        .map_err(|_| malformed("extensions are not base64"))?;

    // The signature field is a TLS DigitallySigned: hash, signature
    // algorithm, two-byte length, then the signature.
    let raw = BASE64
        .decode(&body.signature)
        .map_err(|_| malformed("signature is not base64"))?;
    if raw.len() < 4 {
        return Err(malformed("signature too short"));
    }
    let declared = u16::from_be_bytes([raw[2], raw[3]]) as usize;
    if raw.len() != 4 + declared {
        return Err(malformed("signature length mismatch"));
    }

    Ok(SignedCertificateTimestamp {
        version: body.sct_version,
        log_id,
        timestamp_ms: body.timestamp,
        extensions,
        hash_algorithm: raw[0],
        signature_algorithm: raw[1],
        signature: raw[4..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::pkcs8::EncodePublicKey as _;
    use serde_json::json;
    use signature::Signer;

    fn log_key() -> (p256::ecdsa::SigningKey, Vec<u8>) {
        let sk = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        let spki = sk
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .as_bytes()
            .to_vec();
        (sk, spki)
    }

    fn signed_sct(
        log_key: &p256::ecdsa::SigningKey,
        log_spki: &[u8],
        tbs: &[u8],
        issuer_spki: &[u8],
    ) -> SignedCertificateTimestamp {
        let mut sct = SignedCertificateTimestamp {
            version: SCT_VERSION_V1,
            log_id: Sha256::digest(log_spki).into(),
            timestamp_ms: 1_720_000_000_000,
            extensions: Vec::new(),
            hash_algorithm: HASH_SHA256,
            signature_algorithm: SIG_ECDSA,
            signature: Vec::new(),
        };
        let message = digitally_signed_bytes(&sct, tbs, issuer_spki);
        let sig: p256::ecdsa::Signature = log_key.sign(&message);
        sct.signature = sig.to_der().as_bytes().to_vec();
        sct
    }

    fn pinned_client(log_spki: &[u8]) -> CtLogClient {
        let pem = pem::encode(&pem::Pem::new("PUBLIC KEY", log_spki.to_vec()));
        CtLogClient::new(CtLogOptions {
            log_url: "http://ct.example/test".to_owned(),
            tls_root_pem: None,
            pinned_public_key_pem: Some(pem.into_bytes()),
        })
        .unwrap()
    }

    #[test]
    fn test_sct_verifies_against_pinned_key() {
        let (sk, spki) = log_key();
        let tbs = b"final tbs bytes".to_vec();
        let issuer_spki = b"issuer spki".to_vec();

        let sct = signed_sct(&sk, &spki, &tbs, &issuer_spki);
        let client = pinned_client(&spki);

        client.verify_sct(&sct, &tbs, &issuer_spki).unwrap();

        // Any field covered by the signature breaks verification.
        let mut tampered = sct.clone();
        tampered.timestamp_ms += 1;
        assert!(matches!(
            client.verify_sct(&tampered, &tbs, &issuer_spki),
            Err(CtError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_verify_skipped_without_pinned_key() {
        let (sk, spki) = log_key();
        let sct = signed_sct(&sk, &spki, b"tbs", b"issuer");

        let client = CtLogClient::new(CtLogOptions {
            log_url: "http://ct.example/test".to_owned(),
            ..Default::default()
        })
        .unwrap();

        // Even a garbage SCT passes when no key is pinned.
        let mut garbage = sct;
        garbage.signature = vec![0u8; 8];
        client.verify_sct(&garbage, b"tbs", b"issuer").unwrap();
    }

    #[test]
    fn test_sct_list_framing() {
        let (sk, spki) = log_key();
        let sct = signed_sct(&sk, &spki, b"tbs", b"issuer");

        let inner = sct.tls_bytes();
        let list = sct.sct_list_bytes();

        assert_eq!(list.len(), inner.len() + 4);
        assert_eq!(
            u16::from_be_bytes([list[0], list[1]]) as usize,
            inner.len() + 2
        );
        assert_eq!(u16::from_be_bytes([list[2], list[3]]) as usize, inner.len());
        assert_eq!(&list[4..], &inner[..]);
    }

    #[tokio::test]
    async fn test_submit_parses_log_response() {
        let (sk, spki) = log_key();
        let precert = b"precert der".to_vec();
        let sct = signed_sct(&sk, &spki, b"final tbs", b"issuer spki");

        // Re-encode the signature as the wire DigitallySigned blob.
        let mut wire_sig = vec![sct.hash_algorithm, sct.signature_algorithm];
        wire_sig.extend_from_slice(&(sct.signature.len() as u16).to_be_bytes());
        wire_sig.extend_from_slice(&sct.signature);

        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/test/ct/v1/add-pre-chain")
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "sct_version": 0,
                    "id": BASE64.encode(sct.log_id),
                    "timestamp": sct.timestamp_ms,
                    "extensions": "",
                    "signature": BASE64.encode(&wire_sig),
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = CtLogClient::new(CtLogOptions {
            log_url: format!("{}/test", server.url()),
            ..Default::default()
        })
        .unwrap();

        let received = client.submit_precert(&precert, &[]).await.unwrap();
        assert_eq!(received, sct);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_persistent_server_error_fails_after_one_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/log/ct/v1/add-pre-chain")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let client = CtLogClient::new(CtLogOptions {
            log_url: format!("{}/log", server.url()),
            ..Default::default()
        })
        .unwrap();

        let result = client.submit_precert(b"precert", &[]).await;
        assert!(matches!(result, Err(CtError::Http(503))));
        // Exactly two attempts: the original and one retry.
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/log/ct/v1/add-pre-chain")
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let client = CtLogClient::new(CtLogOptions {
            log_url: format!("{}/log", server.url()),
            ..Default::default()
        })
        .unwrap();

        assert!(matches!(
            client.submit_precert(b"precert", &[]).await,
            Err(CtError::Http(400))
        ));
        mock.assert_async().await;
    }
}
