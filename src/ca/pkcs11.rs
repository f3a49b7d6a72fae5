//! PKCS#11 HSM-backed CA.
//!
//! Signing happens inside the HSM through an injected [`HsmSession`]
//! adapter; the root certificate is fetched from the HSM slot by object ID,
//! or read from disk for modules that cannot store certificates.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use spki::AlgorithmIdentifierOwned;

use crate::ca::{
    check_validity, issue_precert, CaError, CertificateAuthority, CodeSigningCertificate,
    SignerMaterial, TbsSigner,
};
use crate::identity::Principal;

/// The vendor adapter around an open PKCS#11 session.
///
/// Implementations wrap the module's SDK; all failures fold into
/// [`CaError`].
#[async_trait]
pub trait HsmSession: Send + Sync {
    /// The signature algorithm of the CA key in the slot.
    fn algorithm(&self) -> AlgorithmIdentifierOwned;

    /// Signs a message with the CA key in the slot.
    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CaError>;

    /// Fetches a DER certificate stored in the slot by object ID.
    async fn certificate(&self, id: &str) -> Result<Vec<u8>, CaError>;

    /// Closes the session. Called at most once.
    fn close(&self) {}
}

/// Construction parameters for [`Pkcs11Ca`].
#[derive(Debug, Clone)]
pub struct Pkcs11Params {
    /// Path to the module configuration file.
    pub config_path: PathBuf,
    /// Object ID of the root CA certificate inside the slot.
    pub root_id: String,
    /// Optional on-disk root certificate, for modules without certificate
    /// storage (e.g. AWS CloudHSM).
    pub root_cert_path: Option<PathBuf>,
}

/// A CA signing through a PKCS#11 HSM session.
pub struct Pkcs11Ca {
    material: SignerMaterial,
    session: Arc<dyn HsmSession>,
    validity: Duration,
    closed: AtomicBool,
}

impl std::fmt::Debug for Pkcs11Ca {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkcs11Ca")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

struct SessionSigner(Arc<dyn HsmSession>);

#[async_trait]
impl TbsSigner for SessionSigner {
    fn algorithm(&self) -> AlgorithmIdentifierOwned {
        self.0.algorithm()
    }

    async fn sign(&self, tbs_der: &[u8]) -> Result<Vec<u8>, CaError> {
        self.0.sign(tbs_der).await
    }
}

impl Pkcs11Ca {
    /// Opens a CA over an established HSM session.
    ///
    /// # Errors
    ///
    /// [`CaError::BadConfig`] when the root certificate cannot be obtained
    /// or the validity window exceeds the bound; [`CaError::Unavailable`]
    /// when the session cannot serve the certificate fetch.
    pub async fn new(
        session: Arc<dyn HsmSession>,
        params: Pkcs11Params,
        validity: Duration,
    ) -> Result<Self, CaError> {
        let validity = check_validity(validity)?;

        let root = match &params.root_cert_path {
            Some(path) => {
                let chain = super::kms::load_chain(path).await?;
                chain
                    .into_iter()
                    .next()
                    .ok_or_else(|| CaError::BadConfig("empty root certificate file".to_owned()))?
            }
            None => session.certificate(&params.root_id).await?,
        };

        Ok(Self {
            material: SignerMaterial {
                signer: Arc::new(SessionSigner(Arc::clone(&session))),
                chain: vec![root],
            },
            session,
            validity,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl CertificateAuthority for Pkcs11Ca {
    async fn create_certificate(
        &self,
        principal: &Principal,
        spki_der: &[u8],
    ) -> Result<CodeSigningCertificate, CaError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CaError::Unavailable("hsm session closed".to_owned()));
        }
        issue_precert(&self.material, self.validity, principal, spki_der).await
    }

    async fn trust_bundle(&self) -> Result<Vec<Vec<Vec<u8>>>, CaError> {
        Ok(vec![self.material.chain.clone()])
    }

    async fn root(&self) -> Result<Vec<u8>, CaError> {
        self.material
            .chain
            .last()
            .cloned()
            .ok_or_else(|| CaError::BadConfig("empty certificate chain".to_owned()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeSession {
        key: crate::ca::CaKeyPair,
        root: Vec<u8>,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl HsmSession for FakeSession {
        fn algorithm(&self) -> AlgorithmIdentifierOwned {
            self.key.signature_algorithm()
        }

        async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CaError> {
            self.key.sign(message)
        }

        async fn certificate(&self, id: &str) -> Result<Vec<u8>, CaError> {
            if id == "root" {
                Ok(self.root.clone())
            } else {
                Err(CaError::BadConfig(format!("no object with id '{id}'")))
            }
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fake_session() -> Arc<FakeSession> {
        let key =
            crate::ca::CaKeyPair::EcdsaP256(p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng));
        let root = crate::ca::build_self_signed_root(
            &key,
            "CN=hsm-root,O=emberca",
            Duration::from_secs(3600),
        )
        .unwrap();
        Arc::new(FakeSession {
            key,
            root,
            closes: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_root_fetched_from_slot_and_close_is_once() {
        let session = fake_session();
        let ca = Pkcs11Ca::new(
            Arc::clone(&session) as Arc<dyn HsmSession>,
            Pkcs11Params {
                config_path: PathBuf::from("crypto11.conf"),
                root_id: "root".to_owned(),
                root_cert_path: None,
            },
            Duration::from_secs(600),
        )
        .await
        .unwrap();

        assert_eq!(ca.root().await.unwrap(), session.root);

        ca.close();
        ca.close();
        assert_eq!(session.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_root_id_is_bad_config() {
        let session = fake_session();
        let result = Pkcs11Ca::new(
            session as Arc<dyn HsmSession>,
            Pkcs11Params {
                config_path: PathBuf::from("crypto11.conf"),
                root_id: "missing".to_owned(),
                root_cert_path: None,
            },
            Duration::from_secs(600),
        )
        .await;

        assert!(matches!(result, Err(CaError::BadConfig(..))));
    }
}
