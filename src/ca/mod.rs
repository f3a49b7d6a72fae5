//! The certificate authority contract and its signing backends.
//!
//! Every backend satisfies [`CertificateAuthority`]: create a signed
//! precertificate for a principal, expose the trust bundle and root, release
//! resources on close. Backends differ only in where the private key lives;
//! the certificate body layout is shared (see [`crate::cert`]) and the
//! handler, not the backend, assembles the final certificate.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use const_oid::db::rfc5912::{
    ECDSA_WITH_SHA_256, ECDSA_WITH_SHA_384, SHA_256_WITH_RSA_ENCRYPTION,
};
use const_oid::db::rfc8410::ID_ED_25519;
use der::asn1::BitString;
use der::{Any, Decode, Encode};
use pkcs8::PrivateKeyInfo;
use signature::{SignatureEncoding, Signer};
use spki::AlgorithmIdentifierOwned;
use thiserror::Error;

use crate::cert;
use crate::identity::Principal;

pub mod ephemeral;
pub mod file;
pub mod hosted;
pub mod kms;
pub mod pkcs11;
pub mod tink;

/// The longest validity window a backend may be configured with.
pub const MAX_VALIDITY: Duration = Duration::from_secs(600);

/// The closed error set backends surface; the issuance handler never
/// inspects backend internals beyond these.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CaError {
    /// The backing key service or material is unreachable.
    #[error("certificate authority unavailable: {0}")]
    Unavailable(String),

    /// The backend configuration or key material is invalid.
    #[error("certificate authority misconfigured: {0}")]
    BadConfig(String),

    /// A signing operation failed.
    #[error("signing failed: {0}")]
    SignFailed(String),
}

/// The contract every signing backend satisfies.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Builds and signs the precertificate body for `principal` bound to the
    /// presented public key. Implementations must not embed an SCT; the
    /// handler assembles the final certificate via
    /// [`CodeSigningCertificate::finalize`].
    async fn create_certificate(
        &self,
        principal: &Principal,
        spki_der: &[u8],
    ) -> Result<CodeSigningCertificate, CaError>;

    /// The trust chains to return with issued artifacts, each ordered
    /// leaf-issuer first, root last.
    async fn trust_bundle(&self) -> Result<Vec<Vec<Vec<u8>>>, CaError>;

    /// The root certificate, DER.
    async fn root(&self) -> Result<Vec<u8>, CaError>;

    /// Releases held resources. Idempotent.
    fn close(&self);
}

/// The signing seam below the [`CertificateAuthority`] contract.
///
/// The CA signs exactly the `tbsCertificate` bytes it is given, with the
/// SHA-256 or SHA-384 digest matching its key, and alters nothing else.
#[async_trait]
pub trait TbsSigner: Send + Sync {
    /// The signature AlgorithmIdentifier written into issued certificates.
    fn algorithm(&self) -> AlgorithmIdentifierOwned;

    /// Signs the DER-encoded `tbsCertificate`.
    async fn sign(&self, tbs_der: &[u8]) -> Result<Vec<u8>, CaError>;
}

/// A signed precertificate plus everything the handler needs to assemble
/// the final certificate.
pub struct CodeSigningCertificate {
    tbs: x509_cert::TbsCertificate,
    tbs_der: Vec<u8>,
    signature: Vec<u8>,
    precert_der: Vec<u8>,
    chain: Vec<Vec<u8>>,
    signer: Arc<dyn TbsSigner>,
}

impl fmt::Debug for CodeSigningCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeSigningCertificate")
            .field("precert_len", &self.precert_der.len())
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

impl CodeSigningCertificate {
    /// The raw DER bytes of the to-be-signed precertificate body.
    pub fn tbs_der(&self) -> &[u8] {
        &self.tbs_der
    }

    /// The CA signature over the precertificate body.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// The signed precertificate, DER.
    pub fn precert_der(&self) -> &[u8] {
        &self.precert_der
    }

    /// The CA chain, leaf-issuer first, root last.
    pub fn chain_der(&self) -> &[Vec<u8>] {
        &self.chain
    }

    /// The CA chain as PEM blocks.
    pub fn chain_pem(&self) -> Vec<String> {
        cert::chain_to_pem(&self.chain)
    }

    /// The DER of the de-poisoned body, as a CT log signs it over.
    ///
    /// # Errors
    ///
    /// [`CaError::SignFailed`] if the body cannot be re-encoded.
    pub fn final_tbs_der(&self) -> Result<Vec<u8>, CaError> {
        cert::finalize_tbs(&self.tbs, None)
            .and_then(|tbs| tbs.to_der().map_err(Into::into))
            .map_err(|e| CaError::SignFailed(e.to_string()))
    }

    /// The SubjectPublicKeyInfo DER of the signing (leaf-issuer)
    /// certificate, used for the CT issuer key hash.
    ///
    /// # Errors
    ///
    /// [`CaError::BadConfig`] when the chain is empty or unparseable.
    pub fn issuer_spki_der(&self) -> Result<Vec<u8>, CaError> {
        let issuer = self
            .chain
            .first()
            .ok_or_else(|| CaError::BadConfig("empty certificate chain".to_owned()))?;
        let parsed = x509_cert::Certificate::from_der(issuer)
            .map_err(|e| CaError::BadConfig(e.to_string()))?;
        parsed
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| CaError::BadConfig(e.to_string()))
    }

    /// Produces the final certificate: the precertificate body with the
    /// poison removed and, when given, the SCT list appended, re-signed by
    /// the same CA key.
    ///
    /// # Errors
    ///
    /// [`CaError::SignFailed`] if the body cannot be re-encoded or the
    /// backend refuses to sign.
    pub async fn finalize(&self, sct_list: Option<&[u8]>) -> Result<Vec<u8>, CaError> {
        let tbs = cert::finalize_tbs(&self.tbs, sct_list)
            .map_err(|e| CaError::SignFailed(e.to_string()))?;
        let tbs_der = tbs
            .to_der()
            .map_err(|e| CaError::SignFailed(e.to_string()))?;

        let signature = self.signer.sign(&tbs_der).await?;
        cert::assemble_certificate(tbs, self.signer.algorithm(), &signature)
            .map_err(|e| CaError::SignFailed(e.to_string()))
    }
}

/// A CA private key held in process memory.
///
/// CA keys sign with SHA-256 (P-256, RSA) or SHA-384 (P-384); Ed25519 keys
/// sign directly.
pub enum CaKeyPair {
    /// ECDSA over P-256, signing with SHA-256.
    EcdsaP256(p256::ecdsa::SigningKey),
    /// ECDSA over P-384, signing with SHA-384.
    EcdsaP384(p384::ecdsa::SigningKey),
    /// RSA PKCS#1 v1.5 signing with SHA-256.
    Rsa(Box<rsa::pkcs1v15::SigningKey<sha2::Sha256>>),
    /// Ed25519.
    Ed25519(ed25519_dalek::SigningKey),
}

impl fmt::Debug for CaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            CaKeyPair::EcdsaP256(_) => "ecdsa-p256",
            CaKeyPair::EcdsaP384(_) => "ecdsa-p384",
            CaKeyPair::Rsa(_) => "rsa",
            CaKeyPair::Ed25519(_) => "ed25519",
        };
        f.debug_struct("CaKeyPair").field("kind", &kind).finish()
    }
}

impl CaKeyPair {
    /// Parses a CA key from PKCS#8 DER.
    ///
    /// # Errors
    ///
    /// [`CaError::BadConfig`] for unparseable material or key algorithms the
    /// CA cannot sign with.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CaError> {
        use ed25519_dalek::pkcs8::DecodePrivateKey as _;
        use p256::pkcs8::DecodePrivateKey as _;
        use rsa::pkcs8::DecodePrivateKey as _;

        let bad = |msg: &str| CaError::BadConfig(msg.to_owned());

        let info =
            PrivateKeyInfo::try_from(der).map_err(|_| bad("cannot parse pkcs#8 private key"))?;
        let alg_oid = info.algorithm.oid;

        if alg_oid == const_oid::db::rfc5912::ID_EC_PUBLIC_KEY {
            let curve = info
                .algorithm
                .parameters_oid()
                .map_err(|_| bad("ec key without named curve"))?;
            if curve == const_oid::db::rfc5912::SECP_256_R_1 {
                Ok(CaKeyPair::EcdsaP256(
                    p256::ecdsa::SigningKey::from_pkcs8_der(der)
                        .map_err(|_| bad("invalid P-256 private key"))?,
                ))
            } else if curve == const_oid::db::rfc5912::SECP_384_R_1 {
                Ok(CaKeyPair::EcdsaP384(
                    p384::ecdsa::SigningKey::from_pkcs8_der(der)
                        .map_err(|_| bad("invalid P-384 private key"))?,
                ))
            } else {
                Err(bad("unsupported ca curve"))
            }
        } else if alg_oid == const_oid::db::rfc5912::RSA_ENCRYPTION {
            let key = rsa::RsaPrivateKey::from_pkcs8_der(der)
                .map_err(|_| bad("invalid rsa private key"))?;
            Ok(CaKeyPair::Rsa(Box::new(rsa::pkcs1v15::SigningKey::new(key))))
        } else if alg_oid == ID_ED_25519 {
            Ok(CaKeyPair::Ed25519(
                ed25519_dalek::SigningKey::from_pkcs8_der(der)
                    .map_err(|_| bad("invalid ed25519 private key"))?,
            ))
        } else {
            Err(bad("unsupported ca key algorithm"))
        }
    }

    /// The signature AlgorithmIdentifier this key produces.
    pub fn signature_algorithm(&self) -> AlgorithmIdentifierOwned {
        match self {
            CaKeyPair::EcdsaP256(_) => AlgorithmIdentifierOwned {
                oid: ECDSA_WITH_SHA_256,
                parameters: None,
            },
            CaKeyPair::EcdsaP384(_) => AlgorithmIdentifierOwned {
                oid: ECDSA_WITH_SHA_384,
                parameters: None,
            },
            // RSA signature algorithms carry an explicit NULL parameter.
            CaKeyPair::Rsa(_) => AlgorithmIdentifierOwned {
                oid: SHA_256_WITH_RSA_ENCRYPTION,
                parameters: Any::from_der(&[0x05, 0x00]).ok(),
            },
            CaKeyPair::Ed25519(_) => AlgorithmIdentifierOwned {
                oid: ID_ED_25519,
                parameters: None,
            },
        }
    }

    /// Signs a message, returning the signature in certificate form
    /// (ASN.1 DER for ECDSA, PKCS#1 v1.5 for RSA, 64 bytes for Ed25519).
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CaError> {
        let failed = |e: signature::Error| CaError::SignFailed(e.to_string());

        match self {
            CaKeyPair::EcdsaP256(key) => {
                let sig: p256::ecdsa::Signature =
                    key.try_sign(message).map_err(failed)?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
            CaKeyPair::EcdsaP384(key) => {
                let sig: p384::ecdsa::Signature =
                    key.try_sign(message).map_err(failed)?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
            CaKeyPair::Rsa(key) => {
                let sig = key.try_sign(message).map_err(failed)?;
                Ok(sig.to_vec())
            }
            CaKeyPair::Ed25519(key) => {
                let sig = key.try_sign(message).map_err(failed)?;
                Ok(sig.to_vec())
            }
        }
    }

    /// The SubjectPublicKeyInfo DER of the matching public key.
    pub fn verifying_spki_der(&self) -> Result<Vec<u8>, CaError> {
        use ed25519_dalek::pkcs8::EncodePublicKey as _;
        use p256::pkcs8::EncodePublicKey as _;
        use rsa::pkcs8::EncodePublicKey as _;

        let failed = |_| CaError::BadConfig("cannot encode ca public key".to_owned());

        let doc = match self {
            CaKeyPair::EcdsaP256(key) => key.verifying_key().to_public_key_der().map_err(failed)?,
            CaKeyPair::EcdsaP384(key) => key.verifying_key().to_public_key_der().map_err(failed)?,
            CaKeyPair::Rsa(key) => {
                use signature::Keypair as _;
                key.verifying_key().to_public_key_der().map_err(failed)?
            }
            CaKeyPair::Ed25519(key) => key.verifying_key().to_public_key_der().map_err(failed)?,
        };
        Ok(doc.as_bytes().to_vec())
    }
}

#[async_trait]
impl TbsSigner for CaKeyPair {
    fn algorithm(&self) -> AlgorithmIdentifierOwned {
        self.signature_algorithm()
    }

    async fn sign(&self, tbs_der: &[u8]) -> Result<Vec<u8>, CaError> {
        CaKeyPair::sign(self, tbs_der)
    }
}

/// Key material a backend signs with: the signer seam plus the chain of CA
/// certificates, leaf-issuer first, root last.
pub(crate) struct SignerMaterial {
    pub(crate) signer: Arc<dyn TbsSigner>,
    pub(crate) chain: Vec<Vec<u8>>,
}

impl fmt::Debug for SignerMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerMaterial")
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

impl SignerMaterial {
    pub(crate) fn issuer_cert(&self) -> Result<&[u8], CaError> {
        self.chain
            .first()
            .map(Vec::as_slice)
            .ok_or_else(|| CaError::BadConfig("empty certificate chain".to_owned()))
    }
}

/// Rejects validity windows beyond [`MAX_VALIDITY`].
pub(crate) fn check_validity(validity: Duration) -> Result<Duration, CaError> {
    if validity.is_zero() || validity > MAX_VALIDITY {
        return Err(CaError::BadConfig(format!(
            "validity window must be within (0, {}s]",
            MAX_VALIDITY.as_secs()
        )));
    }
    Ok(validity)
}

/// The shared issuance flow: build the precertificate body for the
/// principal, sign it, and package the result.
pub(crate) async fn issue_precert(
    material: &SignerMaterial,
    validity: Duration,
    principal: &Principal,
    spki_der: &[u8],
) -> Result<CodeSigningCertificate, CaError> {
    let params = cert::TbsParams {
        principal,
        client_spki_der: spki_der,
        issuer_cert_der: material.issuer_cert()?,
        signature_algorithm: material.signer.algorithm(),
        validity,
    };

    let tbs = cert::build_precert_tbs(&params).map_err(|e| match e {
        cert::CertError::IssuerCertificate(_) => CaError::BadConfig(e.to_string()),
        other => CaError::SignFailed(other.to_string()),
    })?;
    let tbs_der = tbs
        .to_der()
        .map_err(|e| CaError::SignFailed(e.to_string()))?;

    let signature = material.signer.sign(&tbs_der).await?;
    let precert_der = cert::assemble_certificate(tbs.clone(), material.signer.algorithm(), &signature)
        .map_err(|e| CaError::SignFailed(e.to_string()))?;

    Ok(CodeSigningCertificate {
        tbs,
        tbs_der,
        signature,
        precert_der,
        chain: material.chain.clone(),
        signer: Arc::clone(&material.signer),
    })
}

/// Builds a self-signed CA root certificate for the given key.
pub(crate) fn build_self_signed_root(
    key: &CaKeyPair,
    subject: &str,
    validity: Duration,
) -> Result<Vec<u8>, CaError> {
    use const_oid::AssociatedOid as _;
    use der::asn1::OctetString;
    use x509_cert::ext::pkix::{BasicConstraints, KeyUsage, KeyUsages, SubjectKeyIdentifier};
    use x509_cert::ext::Extension;

    let failed = |e: der::Error| CaError::BadConfig(e.to_string());

    let spki_der = key.verifying_spki_der()?;
    let spki = spki::SubjectPublicKeyInfoOwned::from_der(&spki_der).map_err(failed)?;
    let name = x509_cert::name::Name::from_str(subject)
        .map_err(|e| CaError::BadConfig(e.to_string()))?;

    let ski = cert::key_identifier(&spki_der).map_err(|e| CaError::BadConfig(e.to_string()))?;

    let extension = |oid, critical, der_value: Vec<u8>| -> Result<Extension, CaError> {
        Ok(Extension {
            extn_id: oid,
            critical,
            extn_value: OctetString::new(der_value).map_err(failed)?,
        })
    };

    let extensions = vec![
        extension(
            BasicConstraints::OID,
            true,
            BasicConstraints {
                ca: true,
                path_len_constraint: Some(1),
            }
            .to_der()
            .map_err(failed)?,
        )?,
        extension(
            KeyUsage::OID,
            true,
            KeyUsage(KeyUsages::KeyCertSign | KeyUsages::CRLSign | KeyUsages::DigitalSignature)
                .to_der()
                .map_err(failed)?,
        )?,
        extension(
            SubjectKeyIdentifier::OID,
            false,
            SubjectKeyIdentifier(OctetString::new(ski).map_err(failed)?)
                .to_der()
                .map_err(failed)?,
        )?,
    ];

    let tbs = x509_cert::TbsCertificate {
        version: x509_cert::certificate::Version::V3,
        serial_number: cert::random_serial().map_err(|e| CaError::BadConfig(e.to_string()))?,
        signature: key.signature_algorithm(),
        issuer: name.clone(),
        validity: x509_cert::time::Validity::from_now(validity).map_err(failed)?,
        subject: name,
        subject_public_key_info: spki,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: Some(extensions),
    };

    let tbs_der = tbs.to_der().map_err(failed)?;
    let signature = key.sign(&tbs_der)?;

    let certificate = x509_cert::Certificate {
        tbs_certificate: tbs,
        signature_algorithm: key.signature_algorithm(),
        signature: BitString::from_bytes(&signature).map_err(failed)?,
    };
    certificate
        .to_der()
        .map_err(|e| CaError::BadConfig(e.to_string()))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Helpers shared by the crate's tests.

    use super::*;

    /// A throwaway self-signed issuer certificate and its key.
    pub(crate) fn self_signed_issuer() -> (Vec<u8>, CaKeyPair) {
        let key = CaKeyPair::EcdsaP256(p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng));
        #[allow(clippy::unwrap_used)]
        let cert =
            build_self_signed_root(&key, "CN=test-root,O=emberca", Duration::from_secs(3600))
                .unwrap();
        (cert, key)
    }

    /// A PEM-encoded self-signed P-256 CSR for the given common name.
    #[allow(clippy::unwrap_used)]
    pub(crate) fn self_signed_csr(common_name: &str) -> (String, p256::ecdsa::SigningKey) {
        use p256::pkcs8::EncodePublicKey as _;
        use x509_cert::request::{CertReq, CertReqInfo};

        let sk = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        let spki_der = sk
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .as_bytes()
            .to_vec();

        let info = CertReqInfo {
            version: x509_cert::request::Version::V1,
            subject: x509_cert::name::Name::from_str(&format!("CN={common_name}")).unwrap(),
            public_key: spki::SubjectPublicKeyInfoOwned::from_der(&spki_der).unwrap(),
            attributes: Default::default(),
        };

        let message = info.to_der().unwrap();
        let sig: p256::ecdsa::Signature = sk.sign(&message);

        let csr = CertReq {
            info,
            algorithm: AlgorithmIdentifierOwned {
                oid: ECDSA_WITH_SHA_256,
                parameters: None,
            },
            signature: BitString::from_bytes(sig.to_der().as_bytes()).unwrap(),
        };

        let pem = pem::encode(&pem::Pem::new("CERTIFICATE REQUEST", csr.to_der().unwrap()));
        (pem, sk)
    }
}
