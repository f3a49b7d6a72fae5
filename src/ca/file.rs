//! File-backed CA: an encrypted PKCS#8 key and a PEM chain on disk.
//!
//! The key file is a PEM `ENCRYPTED PRIVATE KEY` block (plain `PRIVATE KEY`
//! is accepted when no password is configured). With watching enabled, a
//! background task polls the files' modification times and swaps the signing
//! material atomically, so in-flight requests observe either the old or the
//! new material, never a torn state. A failed reload keeps the last-known
//! -good material.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use pkcs8::der::{Decode as _, Encode as _};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::ca::{
    check_validity, issue_precert, CaError, CaKeyPair, CertificateAuthority,
    CodeSigningCertificate, SignerMaterial,
};
use crate::cert;
use crate::identity::Principal;

const WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// A certificate authority reading its key and chain from disk.
pub struct FileCa {
    inner: Arc<Inner>,
}

struct Inner {
    material: ArcSwap<SignerMaterial>,
    validity: Duration,
    cancel: CancellationToken,
}

impl std::fmt::Debug for FileCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCa")
            .field("validity", &self.inner.validity)
            .finish()
    }
}

impl FileCa {
    /// Loads the chain and (optionally encrypted) key, verifies they match,
    /// and optionally starts the file watcher.
    ///
    /// # Errors
    ///
    /// [`CaError::BadConfig`] for unreadable or mismatched material,
    /// or a validity window beyond the bound.
    pub async fn new(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        key_password: impl Into<String>,
        watch: bool,
        validity: Duration,
    ) -> Result<Self, CaError> {
        let validity = check_validity(validity)?;
        let cert_path = cert_path.into();
        let key_path = key_path.into();
        let password = Zeroizing::new(key_password.into());

        let material = load_material(&cert_path, &key_path, &password).await?;

        let inner = Arc::new(Inner {
            material: ArcSwap::from_pointee(material),
            validity,
            cancel: CancellationToken::new(),
        });

        if watch {
            tokio::spawn(watch_files(
                Arc::clone(&inner),
                cert_path,
                key_path,
                password,
            ));
        }

        Ok(Self { inner })
    }
}

#[async_trait]
impl CertificateAuthority for FileCa {
    async fn create_certificate(
        &self,
        principal: &Principal,
        spki_der: &[u8],
    ) -> Result<CodeSigningCertificate, CaError> {
        let material = self.inner.material.load();
        issue_precert(&material, self.inner.validity, principal, spki_der).await
    }

    async fn trust_bundle(&self) -> Result<Vec<Vec<Vec<u8>>>, CaError> {
        Ok(vec![self.inner.material.load().chain.clone()])
    }

    async fn root(&self) -> Result<Vec<u8>, CaError> {
        self.inner
            .material
            .load()
            .chain
            .last()
            .cloned()
            .ok_or_else(|| CaError::BadConfig("empty certificate chain".to_owned()))
    }

    fn close(&self) {
        self.inner.cancel.cancel();
    }
}

async fn load_material(
    cert_path: &Path,
    key_path: &Path,
    password: &str,
) -> Result<SignerMaterial, CaError> {
    let bad = |msg: String| CaError::BadConfig(msg);

    let chain_pem = tokio::fs::read(cert_path)
        .await
        .map_err(|e| bad(format!("cannot read {}: {e}", cert_path.display())))?;
    let chain = cert::parse_pem_chain(&chain_pem).map_err(|e| bad(e.to_string()))?;
    if chain.is_empty() {
        return Err(bad(format!(
            "{} holds no certificates",
            cert_path.display()
        )));
    }

    let key_pem = Zeroizing::new(
        tokio::fs::read(key_path)
            .await
            .map_err(|e| bad(format!("cannot read {}: {e}", key_path.display())))?,
    );
    let key = parse_private_key(&key_pem, password)?;

    // The leaf signing certificate must match the private key.
    let leaf = x509_cert::Certificate::from_der(&chain[0])
        .map_err(|e| bad(format!("invalid signing certificate: {e}")))?;
    let leaf_spki = leaf
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| bad(e.to_string()))?;
    if leaf_spki != key.verifying_spki_der()? {
        return Err(bad(
            "signing certificate public key does not match private key".to_owned(),
        ));
    }

    Ok(SignerMaterial {
        signer: Arc::new(key),
        chain,
    })
}

fn parse_private_key(key_pem: &[u8], password: &str) -> Result<CaKeyPair, CaError> {
    let bad = |msg: &str| CaError::BadConfig(msg.to_owned());

    let block = pem::parse(key_pem).map_err(|_| bad("invalid private key pem"))?;
    match block.tag() {
        "ENCRYPTED PRIVATE KEY" => {
            let encrypted = pkcs8::EncryptedPrivateKeyInfo::from_der(block.contents())
                .map_err(|_| bad("invalid encrypted pkcs#8 structure"))?;
            let document = encrypted
                .decrypt(password)
                .map_err(|_| bad("cannot decrypt private key (wrong password?)"))?;
            CaKeyPair::from_pkcs8_der(document.as_bytes())
        }
        "PRIVATE KEY" => {
            if !password.is_empty() {
                return Err(bad("password configured but private key is unencrypted"));
            }
            CaKeyPair::from_pkcs8_der(block.contents())
        }
        other => Err(CaError::BadConfig(format!(
            "unexpected private key pem tag '{other}'"
        ))),
    }
}

async fn modified_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

/// Polls the material files and swaps in new material when they change.
async fn watch_files(
    inner: Arc<Inner>,
    cert_path: PathBuf,
    key_path: PathBuf,
    password: Zeroizing<String>,
) {
    let mut last = (
        modified_at(&cert_path).await,
        modified_at(&key_path).await,
    );
    let mut interval = tokio::time::interval(WATCH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        let current = (
            modified_at(&cert_path).await,
            modified_at(&key_path).await,
        );
        if current == last {
            continue;
        }
        last = current;

        match load_material(&cert_path, &key_path, &password).await {
            Ok(material) => {
                inner.material.store(Arc::new(material));
                info!(cert = %cert_path.display(), "reloaded file ca material");
            }
            Err(error) => {
                warn!(%error, "file ca reload failed, keeping previous material");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::pkcs8::EncodePrivateKey as _;

    struct Fixture {
        dir: PathBuf,
        cert_path: PathBuf,
        key_path: PathBuf,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn write_material(tag: &str, password: &str) -> Fixture {
        let dir = std::env::temp_dir().join(format!(
            "emberca-fileca-{tag}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();

        let sk = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        let key = CaKeyPair::EcdsaP256(sk.clone());
        let cert = crate::ca::build_self_signed_root(
            &key,
            "CN=file-root,O=emberca",
            Duration::from_secs(3600),
        )
        .unwrap();

        let key_pem = if password.is_empty() {
            sk.to_pkcs8_pem(Default::default()).unwrap().to_string()
        } else {
            sk.to_pkcs8_encrypted_pem(&mut rand::rngs::OsRng, password, Default::default())
                .unwrap()
                .to_string()
        };

        let cert_path = dir.join("chain.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(
            &cert_path,
            pem::encode(&pem::Pem::new("CERTIFICATE", cert)),
        )
        .unwrap();
        std::fs::write(&key_path, key_pem).unwrap();

        Fixture {
            dir,
            cert_path,
            key_path,
        }
    }

    #[tokio::test]
    async fn test_loads_encrypted_key_and_issues() {
        use p256::pkcs8::EncodePublicKey as _;

        let fixture = write_material("encrypted", "hunter2");
        let ca = FileCa::new(
            &fixture.cert_path,
            &fixture.key_path,
            "hunter2",
            false,
            Duration::from_secs(300),
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
        assert!(!csc.precert_der().is_empty());

        ca.close();
        ca.close(); // idempotent
    }

    #[tokio::test]
    async fn test_wrong_password_is_bad_config() {
        let fixture = write_material("badpass", "hunter2");
        let result = FileCa::new(
            &fixture.cert_path,
            &fixture.key_path,
            "wrong",
            false,
            Duration::from_secs(300),
        )
        .await;

        assert!(matches!(result, Err(CaError::BadConfig(..))));
    }

    #[tokio::test]
    async fn test_mismatched_cert_and_key_rejected() {
        let fixture = write_material("mismatch", "");
        // Overwrite the chain with a certificate for a different key.
        let other = CaKeyPair::EcdsaP256(p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng));
        let cert = crate::ca::build_self_signed_root(
            &other,
            "CN=other-root,O=emberca",
            Duration::from_secs(3600),
        )
        .unwrap();
        std::fs::write(
            &fixture.cert_path,
            pem::encode(&pem::Pem::new("CERTIFICATE", cert)),
        )
        .unwrap();

        let result = FileCa::new(
            &fixture.cert_path,
            &fixture.key_path,
            "",
            false,
            Duration::from_secs(300),
        )
        .await;

        assert!(matches!(result, Err(CaError::BadConfig(..))));
    }
}
