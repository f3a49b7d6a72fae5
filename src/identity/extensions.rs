//! The project's X.509 extension registry.
//!
//! Extension OIDs live under the Sigstore private-enterprise arc
//! `1.3.6.1.4.1.57264.1`. The legacy entries (`.1`–`.6`) carry raw UTF-8
//! bytes; entries from `.8` upward carry DER-encoded UTF8Strings. All
//! entries are non-critical and are rendered in ascending OID order.

use der::asn1::{OctetString, Utf8StringRef};
use der::oid::ObjectIdentifier;
use der::Encode;
use x509_cert::ext::Extension;

/// OIDC issuer URL (legacy encoding: raw UTF-8 bytes).
pub const OID_ISSUER: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.1");
/// GitHub workflow trigger event (legacy).
pub const OID_GITHUB_WORKFLOW_TRIGGER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.2");
/// GitHub workflow commit SHA (legacy).
pub const OID_GITHUB_WORKFLOW_SHA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.3");
/// GitHub workflow display name (legacy).
pub const OID_GITHUB_WORKFLOW_NAME: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.4");
/// GitHub workflow repository (legacy).
pub const OID_GITHUB_WORKFLOW_REPOSITORY: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.5");
/// GitHub workflow git ref (legacy).
pub const OID_GITHUB_WORKFLOW_REF: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.6");
/// otherName SAN type for username identities.
pub const OID_OTHERNAME_USERNAME: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.7");
/// OIDC issuer URL (DER UTF8String encoding).
pub const OID_ISSUER_V2: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.8");
/// URI of the workflow/config that signed (DER).
pub const OID_BUILD_SIGNER_URI: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.9");
/// Digest of the signing workflow/config (DER).
pub const OID_BUILD_SIGNER_DIGEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.10");
/// Runner environment, hosted or self-hosted (DER).
pub const OID_RUNNER_ENVIRONMENT: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.11");
/// Source repository URI (DER).
pub const OID_SOURCE_REPOSITORY_URI: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.12");
/// Source repository digest (DER).
pub const OID_SOURCE_REPOSITORY_DIGEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.13");
/// Source repository ref (DER).
pub const OID_SOURCE_REPOSITORY_REF: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.14");
/// Source repository immutable identifier (DER).
pub const OID_SOURCE_REPOSITORY_IDENTIFIER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.15");
/// Source repository owner URI (DER).
pub const OID_SOURCE_REPOSITORY_OWNER_URI: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.16");
/// Source repository owner immutable identifier (DER).
pub const OID_SOURCE_REPOSITORY_OWNER_IDENTIFIER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.17");
/// Build configuration URI (DER).
pub const OID_BUILD_CONFIG_URI: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.18");
/// Build configuration digest (DER).
pub const OID_BUILD_CONFIG_DIGEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.19");
/// Event that triggered the build (DER).
pub const OID_BUILD_TRIGGER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.20");
/// Run invocation URI (DER).
pub const OID_RUN_INVOCATION_URI: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.21");
/// Source repository visibility at signing time (DER).
pub const OID_SOURCE_REPOSITORY_VISIBILITY: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.22");

/// The typed extension set rendered into every issued certificate.
///
/// The issuer is always present; the remaining fields are populated by the
/// principal variant that owns the corresponding claims.
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct CertExtensions {
    pub issuer: String,
    pub github_workflow_trigger: Option<String>,
    pub github_workflow_sha: Option<String>,
    pub github_workflow_name: Option<String>,
    pub github_workflow_repository: Option<String>,
    pub github_workflow_ref: Option<String>,
    pub build_signer_uri: Option<String>,
    pub build_signer_digest: Option<String>,
    pub runner_environment: Option<String>,
    pub source_repository_uri: Option<String>,
    pub source_repository_digest: Option<String>,
    pub source_repository_ref: Option<String>,
    pub source_repository_identifier: Option<String>,
    pub source_repository_owner_uri: Option<String>,
    pub source_repository_owner_identifier: Option<String>,
    pub build_config_uri: Option<String>,
    pub build_config_digest: Option<String>,
    pub build_trigger: Option<String>,
    pub run_invocation_uri: Option<String>,
    pub source_repository_visibility: Option<String>,
}

impl CertExtensions {
    /// Creates an extension set carrying only the issuer.
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            ..Self::default()
        }
    }

    /// Renders the populated fields as non-critical X.509 extensions in
    /// ascending OID order.
    ///
    /// # Errors
    ///
    /// Returns a [`der::Error`] if a value cannot be encoded (e.g. exceeds
    /// DER length limits).
    pub fn render(&self) -> der::Result<Vec<Extension>> {
        let mut extensions = Vec::new();

        extensions.push(raw_extension(OID_ISSUER, &self.issuer)?);

        let legacy = [
            (OID_GITHUB_WORKFLOW_TRIGGER, &self.github_workflow_trigger),
            (OID_GITHUB_WORKFLOW_SHA, &self.github_workflow_sha),
            (OID_GITHUB_WORKFLOW_NAME, &self.github_workflow_name),
            (
                OID_GITHUB_WORKFLOW_REPOSITORY,
                &self.github_workflow_repository,
            ),
            (OID_GITHUB_WORKFLOW_REF, &self.github_workflow_ref),
        ];
        for (oid, value) in legacy {
            if let Some(value) = value {
                extensions.push(raw_extension(oid, value)?);
            }
        }

        extensions.push(der_extension(OID_ISSUER_V2, &self.issuer)?);

        let der_encoded = [
            (OID_BUILD_SIGNER_URI, &self.build_signer_uri),
            (OID_BUILD_SIGNER_DIGEST, &self.build_signer_digest),
            (OID_RUNNER_ENVIRONMENT, &self.runner_environment),
            (OID_SOURCE_REPOSITORY_URI, &self.source_repository_uri),
            (OID_SOURCE_REPOSITORY_DIGEST, &self.source_repository_digest),
            (OID_SOURCE_REPOSITORY_REF, &self.source_repository_ref),
            (
                OID_SOURCE_REPOSITORY_IDENTIFIER,
                &self.source_repository_identifier,
            ),
            (
                OID_SOURCE_REPOSITORY_OWNER_URI,
                &self.source_repository_owner_uri,
            ),
            (
                OID_SOURCE_REPOSITORY_OWNER_IDENTIFIER,
                &self.source_repository_owner_identifier,
            ),
            (OID_BUILD_CONFIG_URI, &self.build_config_uri),
            (OID_BUILD_CONFIG_DIGEST, &self.build_config_digest),
            (OID_BUILD_TRIGGER, &self.build_trigger),
            (OID_RUN_INVOCATION_URI, &self.run_invocation_uri),
            (
                OID_SOURCE_REPOSITORY_VISIBILITY,
                &self.source_repository_visibility,
            ),
        ];
        for (oid, value) in der_encoded {
            if let Some(value) = value {
                extensions.push(der_extension(oid, value)?);
            }
        }

        Ok(extensions)
    }
}

/// Legacy encoding: the extension value is the raw UTF-8 bytes.
fn raw_extension(oid: ObjectIdentifier, value: &str) -> der::Result<Extension> {
    Ok(Extension {
        extn_id: oid,
        critical: false,
        extn_value: OctetString::new(value.as_bytes().to_vec())?,
    })
}

/// Current encoding: the extension value is a DER UTF8String.
fn der_extension(oid: ObjectIdentifier, value: &str) -> der::Result<Extension> {
    let inner = Utf8StringRef::new(value)?.to_der()?;
    Ok(Extension {
        extn_id: oid,
        critical: false,
        extn_value: OctetString::new(inner)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issuer_always_rendered_in_both_encodings() {
        let ext = CertExtensions::new("https://accounts.example");
        let rendered = ext.render().unwrap();

        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[0].extn_id, OID_ISSUER);
        assert_eq!(
            rendered[0].extn_value.as_bytes(),
            b"https://accounts.example"
        );
        assert_eq!(rendered[1].extn_id, OID_ISSUER_V2);
        // DER UTF8String: tag 0x0c, length, then the bytes.
        assert_eq!(rendered[1].extn_value.as_bytes()[0], 0x0c);
    }

    #[test]
    fn test_extensions_sorted_by_oid_and_non_critical() {
        let mut ext = CertExtensions::new("https://issuer.example");
        ext.github_workflow_trigger = Some("push".to_owned());
        ext.github_workflow_ref = Some("refs/heads/main".to_owned());
        ext.build_trigger = Some("push".to_owned());

        let rendered = ext.render().unwrap();
        let oids: Vec<String> = rendered.iter().map(|e| e.extn_id.to_string()).collect();
        let mut sorted = oids.clone();
        sorted.sort_by_key(|oid| {
            oid.rsplit('.')
                .next()
                .and_then(|n| n.parse::<u32>().ok())
                .unwrap_or(0)
        });
        assert_eq!(oids, sorted);
        assert!(rendered.iter().all(|e| !e.critical));
    }
}
