//! In-memory ephemeral CA: a self-signed P-256 root generated at startup.
//!
//! For tests and local development only; the key never leaves process
//! memory and is lost on shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::ca::{
    build_self_signed_root, check_validity, issue_precert, CaError, CaKeyPair,
    CertificateAuthority, CodeSigningCertificate, SignerMaterial,
};
use crate::identity::Principal;

const ROOT_SUBJECT: &str = "CN=emberca,O=emberca.dev";
const ROOT_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// A self-signed, in-memory certificate authority.
#[derive(Debug)]
pub struct EphemeralCa {
    material: SignerMaterial,
    validity: Duration,
}

impl EphemeralCa {
    /// Generates a fresh P-256 root and returns a CA issuing certificates
    /// with the given validity window.
    ///
    /// # Errors
    ///
    /// [`CaError::BadConfig`] if the validity window exceeds the bound.
    pub fn new(validity: Duration) -> Result<Self, CaError> {
        let validity = check_validity(validity)?;

        let key = CaKeyPair::EcdsaP256(p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng));
        let root = build_self_signed_root(&key, ROOT_SUBJECT, ROOT_VALIDITY)?;

        Ok(Self {
            material: SignerMaterial {
                signer: Arc::new(key),
                chain: vec![root],
            },
            validity,
        })
    }
}

#[async_trait]
impl CertificateAuthority for EphemeralCa {
    async fn create_certificate(
        &self,
        principal: &Principal,
        spki_der: &[u8],
    ) -> Result<CodeSigningCertificate, CaError> {
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

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ephemeral_ca_issues_under_its_own_root() {
        use p256::pkcs8::EncodePublicKey as _;

        let ca = EphemeralCa::new(Duration::from_secs(600)).unwrap();

        let client = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        let spki = client
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .as_bytes()
            .to_vec();
        let principal = Principal::Email {
            email: "alice@example.com".to_owned(),
            issuer: "https://accounts.example".to_owned(),
        };

        let csc = ca.create_certificate(&principal, &spki).await.unwrap();
        let root = ca.root().await.unwrap();

        let (_, precert) = x509_parser::parse_x509_certificate(csc.precert_der()).unwrap();
        let (_, root_cert) = x509_parser::parse_x509_certificate(&root).unwrap();
        assert_eq!(
            precert.issuer().to_string(),
            root_cert.subject().to_string()
        );

        let bundle = ca.trust_bundle().await.unwrap();
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle[0].last().unwrap(), &root);
    }

    #[test]
    fn test_validity_bound_enforced() {
        assert!(matches!(
            EphemeralCa::new(Duration::from_secs(3600)),
            Err(CaError::BadConfig(..))
        ));
    }
}
