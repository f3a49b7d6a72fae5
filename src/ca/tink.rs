//! Tink-wrapped-key CA.
//!
//! The CA key sits on disk as a keyset encrypted under a KMS key-encryption
//! key. Startup decrypts it through an injected [`KekDecrypter`] adapter and
//! signs locally with the unwrapped key; the plaintext keyset only ever
//! exists in zeroized memory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::ca::{
    check_validity, issue_precert, CaError, CaKeyPair, CertificateAuthority,
    CodeSigningCertificate, SignerMaterial,
};
use crate::identity::Principal;

/// The vendor adapter around the KMS key-encryption key.
#[async_trait]
pub trait KekDecrypter: Send + Sync {
    /// Decrypts the wrapped keyset ciphertext.
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CaError>;
}

/// A CA whose key is unwrapped through a KMS KEK at startup.
pub struct TinkCa {
    material: SignerMaterial,
    validity: Duration,
}

impl std::fmt::Debug for TinkCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TinkCa")
            .field("validity", &self.validity)
            .finish()
    }
}

impl TinkCa {
    /// Decrypts the keyset at `keyset_path` through `decrypter` and loads
    /// the CA chain from `chain_path`.
    ///
    /// # Errors
    ///
    /// [`CaError::Unavailable`] when the KEK cannot be reached,
    /// [`CaError::BadConfig`] for unreadable files, undecryptable keysets,
    /// or a validity window beyond the bound.
    pub async fn new(
        decrypter: &dyn KekDecrypter,
        keyset_path: impl AsRef<Path>,
        chain_path: impl AsRef<Path>,
        validity: Duration,
    ) -> Result<Self, CaError> {
        let validity = check_validity(validity)?;

        let keyset_path = keyset_path.as_ref();
        let ciphertext = tokio::fs::read(keyset_path).await.map_err(|e| {
            CaError::BadConfig(format!("cannot read {}: {e}", keyset_path.display()))
        })?;

        let plaintext = Zeroizing::new(decrypter.decrypt(&ciphertext).await?);
        let key = CaKeyPair::from_pkcs8_der(&plaintext)?;

        let chain = super::kms::load_chain(chain_path.as_ref()).await?;

        Ok(Self {
            material: SignerMaterial {
                signer: Arc::new(key),
                chain,
            },
            validity,
        })
    }
}

#[async_trait]
impl CertificateAuthority for TinkCa {
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
    use p256::pkcs8::EncodePrivateKey as _;

    /// XORs with a fixed pad; stands in for the KMS envelope.
    struct FakeKek;

    #[async_trait]
    impl KekDecrypter for FakeKek {
        async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CaError> {
            Ok(ciphertext.iter().map(|b| b ^ 0x5a).collect())
        }
    }

    #[tokio::test]
    async fn test_unwraps_keyset_and_issues() {
        use p256::pkcs8::EncodePublicKey as _;

        let sk = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        let key_der = sk.to_pkcs8_der().unwrap();
        let wrapped: Vec<u8> = key_der.as_bytes().iter().map(|b| b ^ 0x5a).collect();

        let key = CaKeyPair::EcdsaP256(sk);
        let cert = crate::ca::build_self_signed_root(
            &key,
            "CN=tink-root,O=emberca",
            Duration::from_secs(3600),
        )
        .unwrap();

        let dir = std::env::temp_dir().join(format!("emberca-tink-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let keyset_path = dir.join("keyset.bin");
        let chain_path = dir.join("chain.pem");
        std::fs::write(&keyset_path, &wrapped).unwrap();
        std::fs::write(
            &chain_path,
            pem::encode(&pem::Pem::new("CERTIFICATE", cert)),
        )
        .unwrap();

        let ca = TinkCa::new(&FakeKek, &keyset_path, &chain_path, Duration::from_secs(600))
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
        assert!(!csc.precert_der().is_empty());

        let _ = std::fs::remove_dir_all(dir);
    }
}
