//! Hosted cloud-CA backend.
//!
//! The remote service owns both the key and the chain; every signing
//! operation is delegated wholesale through an injected [`HostedCaClient`]
//! adapter (the provider SDK lives outside this crate).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use spki::AlgorithmIdentifierOwned;

use crate::ca::{
    check_validity, issue_precert, CaError, CertificateAuthority, CodeSigningCertificate,
    SignerMaterial, TbsSigner,
};
use crate::identity::Principal;

/// The vendor adapter for a hosted CA service.
#[async_trait]
pub trait HostedCaClient: Send + Sync {
    /// The signature algorithm of the hosted CA key.
    fn algorithm(&self) -> AlgorithmIdentifierOwned;

    /// Signs a `tbsCertificate` remotely.
    async fn sign(&self, tbs_der: &[u8]) -> Result<Vec<u8>, CaError>;

    /// Fetches the CA chain, leaf-issuer first, root last.
    async fn chain(&self) -> Result<Vec<Vec<u8>>, CaError>;
}

/// A CA delegating all signing to a hosted service.
pub struct HostedCa {
    material: SignerMaterial,
    validity: Duration,
}

impl std::fmt::Debug for HostedCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostedCa")
            .field("validity", &self.validity)
            .finish()
    }
}

struct ClientSigner(Arc<dyn HostedCaClient>);

#[async_trait]
impl TbsSigner for ClientSigner {
    fn algorithm(&self) -> AlgorithmIdentifierOwned {
        self.0.algorithm()
    }

    async fn sign(&self, tbs_der: &[u8]) -> Result<Vec<u8>, CaError> {
        self.0.sign(tbs_der).await
    }
}

impl HostedCa {
    /// Connects to the hosted CA, caching its chain for the process
    /// lifetime.
    ///
    /// # Errors
    ///
    /// [`CaError::Unavailable`] when the chain cannot be fetched,
    /// [`CaError::BadConfig`] for an empty chain or an oversized validity
    /// window.
    pub async fn new(client: Arc<dyn HostedCaClient>, validity: Duration) -> Result<Self, CaError> {
        let validity = check_validity(validity)?;

        let chain = client.chain().await?;
        if chain.is_empty() {
            return Err(CaError::BadConfig(
                "hosted ca returned an empty chain".to_owned(),
            ));
        }

        Ok(Self {
            material: SignerMaterial {
                signer: Arc::new(ClientSigner(client)),
                chain,
            },
            validity,
        })
    }
}

#[async_trait]
impl CertificateAuthority for HostedCa {
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

    struct FakeHosted {
        key: crate::ca::CaKeyPair,
        chain: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl HostedCaClient for FakeHosted {
        fn algorithm(&self) -> AlgorithmIdentifierOwned {
            self.key.signature_algorithm()
        }

        async fn sign(&self, tbs_der: &[u8]) -> Result<Vec<u8>, CaError> {
            self.key.sign(tbs_der)
        }

        async fn chain(&self) -> Result<Vec<Vec<u8>>, CaError> {
            Ok(self.chain.clone())
        }
    }

    #[tokio::test]
    async fn test_hosted_ca_delegates_signing() {
        use p256::pkcs8::EncodePublicKey as _;

        let key =
            crate::ca::CaKeyPair::EcdsaP256(p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng));
        let root = crate::ca::build_self_signed_root(
            &key,
            "CN=hosted-root,O=emberca",
            Duration::from_secs(3600),
        )
        .unwrap();

        let ca = HostedCa::new(
            Arc::new(FakeHosted {
                key,
                chain: vec![root.clone()],
            }),
            Duration::from_secs(600),
        )
        .await
        .unwrap();

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
        let final_der = csc.finalize(None).await.unwrap();
        assert!(x509_parser::parse_x509_certificate(&final_der).is_ok());
        assert_eq!(ca.root().await.unwrap(), root);
    }
}
