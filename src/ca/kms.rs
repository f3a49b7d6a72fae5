//! Cloud-KMS-backed CA.
//!
//! The key never leaves the KMS; signing requests go through an injected
//! [`TbsSigner`] adapter built around the provider's SDK (the adapter leaf
//! is outside this crate). The certificate chain is loaded from disk.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::ca::{
    check_validity, issue_precert, CaError, CertificateAuthority, CodeSigningCertificate,
    SignerMaterial, TbsSigner,
};
use crate::cert;
use crate::identity::Principal;

/// A CA delegating signatures to a cloud KMS key.
pub struct KmsCa {
    material: SignerMaterial,
    validity: Duration,
    resource: String,
}

impl std::fmt::Debug for KmsCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsCa")
            .field("resource", &self.resource)
            .finish()
    }
}

impl KmsCa {
    /// Wraps a KMS signer adapter for the given key resource URL
    /// (`awskms://…`, `gcpkms://…`, `azurekms://…`, `hashivault://…`),
    /// with the CA chain read from `chain_path`.
    ///
    /// # Errors
    ///
    /// [`CaError::BadConfig`] for an unreadable or empty chain, or a
    /// validity window beyond the bound.
    pub async fn new(
        signer: Arc<dyn TbsSigner>,
        resource: impl Into<String>,
        chain_path: impl AsRef<Path>,
        validity: Duration,
    ) -> Result<Self, CaError> {
        let validity = check_validity(validity)?;
        let chain = load_chain(chain_path.as_ref()).await?;

        Ok(Self {
            material: SignerMaterial { signer, chain },
            validity,
            resource: resource.into(),
        })
    }

    /// The configured KMS key resource URL.
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

pub(crate) async fn load_chain(path: &Path) -> Result<Vec<Vec<u8>>, CaError> {
    let pem = tokio::fs::read(path)
        .await
        .map_err(|e| CaError::BadConfig(format!("cannot read {}: {e}", path.display())))?;
    let chain = cert::parse_pem_chain(&pem).map_err(|e| CaError::BadConfig(e.to_string()))?;
    if chain.is_empty() {
        return Err(CaError::BadConfig(format!(
            "{} holds no certificates",
            path.display()
        )));
    }
    Ok(chain)
}

#[async_trait]
impl CertificateAuthority for KmsCa {
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
