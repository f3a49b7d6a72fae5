//! Principal model: structured identities derived from verified OIDC claims.
//!
//! A [`Principal`] is a closed set of identity shapes. Each variant knows how
//! to render itself into the certificate's Subject Alternative Name and into
//! the project's X.509 extension registry (see [`extensions`]).

use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config::IssuerKind;
use crate::identity::extensions::CertExtensions;
use crate::identity::pool::ResolvedIssuer;

pub mod extensions;
pub mod pool;

pub use pool::IssuerPool;

/// A verified (or, before verification, merely parsed) OIDC claim set.
pub type ClaimSet = serde_json::Map<String, Value>;

/// The single Subject Alternative Name entry of an issued certificate.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SubjectAltName {
    /// An rfc822Name entry (email identities).
    Email(String),
    /// A uniformResourceIdentifier entry.
    Uri(String),
    /// An otherName entry carrying a UTF-8 `user!domain` value.
    OtherName(String),
}

/// An error that can arise projecting a claim set into a [`Principal`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdentityError {
    /// A claim required by the issuer kind is missing or not a string.
    #[error("required claim '{0}' is missing or malformed")]
    MissingClaim(String),

    /// The `email_verified` claim is absent or false.
    #[error("email claim is not verified")]
    EmailNotVerified,

    /// The subject is not a parseable URI.
    #[error("subject '{0}' is not a valid uri")]
    InvalidSubjectUri(String),

    /// The subject does not belong to the configured subject domain.
    #[error("subject '{subject}' is not in domain '{domain}'")]
    SubjectDomainMismatch {
        /// The presented subject.
        subject: String,
        /// The configured domain.
        domain: String,
    },

    /// The SPIFFE subject does not belong to the configured trust domain.
    #[error("spiffe id '{subject}' is not in trust domain '{trust_domain}'")]
    TrustDomainMismatch {
        /// The presented SPIFFE ID.
        subject: String,
        /// The configured trust domain.
        trust_domain: String,
    },
}

/// Structured identity derived from a verified OIDC claim set.
///
/// Variants correspond to the issuer kinds in
/// [`IssuerKind`](crate::config::IssuerKind); SPIFFE identities are a
/// validated form of the URI variant.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum Principal {
    /// A verified email identity.
    Email {
        /// The email address (`email` claim).
        email: String,
        /// The issuer URL recorded in the certificate.
        issuer: String,
    },

    /// A URI identity, including SPIFFE IDs.
    Uri {
        /// The subject URI.
        uri: String,
        /// The issuer URL recorded in the certificate.
        issuer: String,
    },

    /// A username identity scoped to a domain.
    Username {
        /// The bare username (`sub` claim).
        username: String,
        /// The configured subject domain.
        domain: String,
        /// The issuer URL recorded in the certificate.
        issuer: String,
    },

    /// A GitHub Actions workflow identity.
    GithubWorkflow {
        /// The issuer URL recorded in the certificate.
        issuer: String,
        /// `workflow_ref` claim, e.g. `org/repo/.github/workflows/ci.yml@refs/heads/main`.
        workflow_ref: String,
        /// `event_name` claim.
        trigger: String,
        /// `sha` claim.
        sha: String,
        /// `workflow` claim (display name).
        workflow_name: String,
        /// `repository` claim, e.g. `org/repo`.
        repository: String,
        /// `ref` claim.
        git_ref: String,
        /// `run_id` claim, when present.
        run_id: Option<String>,
        /// `run_attempt` claim, when present.
        run_attempt: Option<String>,
        /// `repository_id` claim, when present.
        repository_id: Option<String>,
        /// `repository_owner` claim, when present.
        repository_owner: Option<String>,
        /// `repository_owner_id` claim, when present.
        repository_owner_id: Option<String>,
        /// `repository_visibility` claim, when present.
        repository_visibility: Option<String>,
        /// `runner_environment` claim, when present.
        runner_environment: Option<String>,
    },

    /// A GitLab CI pipeline identity.
    GitlabPipeline {
        /// The issuer URL recorded in the certificate.
        issuer: String,
        /// `ci_config_ref_uri` claim (scheme-less).
        ci_config_ref_uri: String,
        /// `project_path` claim, e.g. `group/project`.
        project_path: String,
        /// `pipeline_source` claim.
        pipeline_source: String,
        /// `sha` claim.
        sha: String,
        /// `pipeline_id` claim, when present.
        pipeline_id: Option<String>,
        /// `ci_config_sha` claim, when present.
        ci_config_sha: Option<String>,
        /// `runner_environment` claim, when present.
        runner_environment: Option<String>,
    },

    /// A Buildkite job identity.
    Buildkite {
        /// The issuer URL recorded in the certificate.
        issuer: String,
        /// `organization_slug` claim.
        organization: String,
        /// `pipeline_slug` claim.
        pipeline: String,
    },

    /// A generic CI-provider identity selected by the configured challenge claim.
    CiProvider {
        /// The issuer URL recorded in the certificate.
        issuer: String,
        /// The subject taken from the challenge claim.
        subject: String,
    },
}

impl Principal {
    /// Projects a verified claim set into a principal according to the
    /// matched issuer configuration.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] when a required claim is missing or the
    /// subject fails the kind's validation rules. The issuance handler maps
    /// this onto `invalid-credentials`.
    pub fn from_claims(issuer: &ResolvedIssuer, claims: &ClaimSet) -> Result<Self, IdentityError> {
        let issuer_url = issuer.certificate_issuer(claims);
        let cfg = &issuer.config;

        match cfg.kind {
            IssuerKind::Email => {
                let verified = claims
                    .get("email_verified")
                    .map(claim_truthy)
                    .unwrap_or(false);
                if !verified {
                    return Err(IdentityError::EmailNotVerified);
                }
                Ok(Principal::Email {
                    email: require_str(claims, "email")?,
                    issuer: issuer_url,
                })
            }

            IssuerKind::Spiffe => {
                let sub = require_str(claims, "sub")?;
                let trust_domain = spiffe_trust_domain(&sub)
                    .ok_or_else(|| IdentityError::InvalidSubjectUri(sub.clone()))?;
                if let Some(required) = &cfg.spiffe_trust_domain {
                    if trust_domain != required {
                        return Err(IdentityError::TrustDomainMismatch {
                            subject: sub,
                            trust_domain: required.clone(),
                        });
                    }
                }
                Ok(Principal::Uri {
                    uri: sub,
                    issuer: issuer_url,
                })
            }

            IssuerKind::Uri => {
                let sub = require_str(claims, "sub")?;
                let domain = cfg
                    .subject_domain
                    .as_deref()
                    .ok_or_else(|| IdentityError::MissingClaim("SubjectDomain".to_owned()))?;
                check_uri_in_domain(&sub, domain)?;
                Ok(Principal::Uri {
                    uri: sub,
                    issuer: issuer_url,
                })
            }

            IssuerKind::Username => {
                let sub = require_str(claims, "sub")?;
                if sub.contains('@') {
                    return Err(IdentityError::InvalidSubjectUri(sub));
                }
                let domain = cfg
                    .subject_domain
                    .clone()
                    .ok_or_else(|| IdentityError::MissingClaim("SubjectDomain".to_owned()))?;
                Ok(Principal::Username {
                    username: sub,
                    domain,
                    issuer: issuer_url,
                })
            }

            IssuerKind::GithubWorkflow => Ok(Principal::GithubWorkflow {
                issuer: issuer_url,
                workflow_ref: require_str(claims, "workflow_ref")?,
                trigger: require_str(claims, "event_name")?,
                sha: require_str(claims, "sha")?,
                workflow_name: require_str(claims, "workflow")?,
                repository: require_str(claims, "repository")?,
                git_ref: require_str(claims, "ref")?,
                run_id: optional_str(claims, "run_id"),
                run_attempt: optional_str(claims, "run_attempt"),
                repository_id: optional_str(claims, "repository_id"),
                repository_owner: optional_str(claims, "repository_owner"),
                repository_owner_id: optional_str(claims, "repository_owner_id"),
                repository_visibility: optional_str(claims, "repository_visibility"),
                runner_environment: optional_str(claims, "runner_environment"),
            }),

            IssuerKind::GitlabPipeline => Ok(Principal::GitlabPipeline {
                issuer: issuer_url,
                ci_config_ref_uri: require_str(claims, "ci_config_ref_uri")?,
                project_path: require_str(claims, "project_path")?,
                pipeline_source: require_str(claims, "pipeline_source")?,
                sha: require_str(claims, "sha")?,
                pipeline_id: optional_str(claims, "pipeline_id"),
                ci_config_sha: optional_str(claims, "ci_config_sha"),
                runner_environment: optional_str(claims, "runner_environment"),
            }),

            IssuerKind::BuildkiteJob => Ok(Principal::Buildkite {
                issuer: issuer_url,
                organization: require_str(claims, "organization_slug")?,
                pipeline: require_str(claims, "pipeline_slug")?,
            }),

            IssuerKind::CiProvider => {
                let claim = cfg
                    .challenge_claim
                    .as_deref()
                    .ok_or_else(|| IdentityError::MissingClaim("ChallengeClaim".to_owned()))?;
                Ok(Principal::CiProvider {
                    issuer: issuer_url,
                    subject: require_str(claims, claim)?,
                })
            }
        }
    }

    /// Returns the canonical identity string.
    pub fn name(&self) -> String {
        match self {
            Principal::Email { email, .. } => email.clone(),
            Principal::Uri { uri, .. } => uri.clone(),
            Principal::Username {
                username, domain, ..
            } => format!("{username}!{domain}"),
            Principal::GithubWorkflow { workflow_ref, .. } => {
                format!("https://github.com/{workflow_ref}")
            }
            Principal::GitlabPipeline {
                ci_config_ref_uri, ..
            } => format!("https://{ci_config_ref_uri}"),
            Principal::Buildkite {
                organization,
                pipeline,
                ..
            } => format!("https://buildkite.com/{organization}/{pipeline}"),
            Principal::CiProvider { subject, .. } => subject.clone(),
        }
    }

    /// Returns the issuer URL recorded in the certificate's issuer extension.
    pub fn issuer(&self) -> &str {
        match self {
            Principal::Email { issuer, .. }
            | Principal::Uri { issuer, .. }
            | Principal::Username { issuer, .. }
            | Principal::GithubWorkflow { issuer, .. }
            | Principal::GitlabPipeline { issuer, .. }
            | Principal::Buildkite { issuer, .. }
            | Principal::CiProvider { issuer, .. } => issuer,
        }
    }

    /// Renders the single SAN entry for this principal.
    ///
    /// Email identities become an rfc822Name, username identities an
    /// otherName, everything else a URI.
    pub fn subject_alt_name(&self) -> SubjectAltName {
        match self {
            Principal::Email { email, .. } => SubjectAltName::Email(email.clone()),
            Principal::Username { .. } => SubjectAltName::OtherName(self.name()),
            _ => SubjectAltName::Uri(self.name()),
        }
    }

    /// Builds the typed extension set for this principal.
    pub fn extensions(&self) -> CertExtensions {
        let mut ext = CertExtensions::new(self.issuer());

        match self {
            Principal::GithubWorkflow {
                workflow_ref,
                trigger,
                sha,
                workflow_name,
                repository,
                git_ref,
                run_id,
                run_attempt,
                repository_id,
                repository_owner,
                repository_owner_id,
                repository_visibility,
                runner_environment,
                ..
            } => {
                ext.github_workflow_trigger = Some(trigger.clone());
                ext.github_workflow_sha = Some(sha.clone());
                ext.github_workflow_name = Some(workflow_name.clone());
                ext.github_workflow_repository = Some(repository.clone());
                ext.github_workflow_ref = Some(git_ref.clone());

                ext.build_signer_uri = Some(format!("https://github.com/{workflow_ref}"));
                ext.build_signer_digest = Some(sha.clone());
                ext.runner_environment = runner_environment.clone();
                ext.source_repository_uri = Some(format!("https://github.com/{repository}"));
                ext.source_repository_digest = Some(sha.clone());
                ext.source_repository_ref = Some(git_ref.clone());
                ext.source_repository_identifier = repository_id.clone();
                ext.source_repository_owner_uri = repository_owner
                    .as_ref()
                    .map(|o| format!("https://github.com/{o}"));
                ext.source_repository_owner_identifier = repository_owner_id.clone();
                ext.build_config_uri = Some(format!("https://github.com/{workflow_ref}"));
                ext.build_config_digest = Some(sha.clone());
                ext.build_trigger = Some(trigger.clone());
                ext.run_invocation_uri = match (run_id, run_attempt) {
                    (Some(id), Some(attempt)) => Some(format!(
                        "https://github.com/{repository}/actions/runs/{id}/attempts/{attempt}"
                    )),
                    _ => None,
                };
                ext.source_repository_visibility = repository_visibility.clone();
            }

            Principal::GitlabPipeline {
                ci_config_ref_uri,
                project_path,
                pipeline_source,
                sha,
                pipeline_id,
                ci_config_sha,
                runner_environment,
                ..
            } => {
                ext.build_signer_uri = Some(format!("https://{ci_config_ref_uri}"));
                ext.build_signer_digest = ci_config_sha.clone();
                ext.runner_environment = runner_environment.clone();
                ext.source_repository_uri = Some(format!("https://gitlab.com/{project_path}"));
                ext.source_repository_digest = Some(sha.clone());
                ext.build_config_uri = Some(format!("https://{ci_config_ref_uri}"));
                ext.build_config_digest = ci_config_sha.clone();
                ext.build_trigger = Some(pipeline_source.clone());
                ext.run_invocation_uri = pipeline_id
                    .as_ref()
                    .map(|id| format!("https://gitlab.com/{project_path}/-/pipelines/{id}"));
            }

            _ => {}
        }

        ext
    }
}

fn require_str(claims: &ClaimSet, name: &str) -> Result<String, IdentityError> {
    claims
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| IdentityError::MissingClaim(name.to_owned()))
}

fn optional_str(claims: &ClaimSet, name: &str) -> Option<String> {
    claims
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

// Some providers serialize `email_verified` as the string "true".
fn claim_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s == "true",
        _ => false,
    }
}

/// Extracts the trust domain from a `spiffe://` URI, if the subject is one.
fn spiffe_trust_domain(subject: &str) -> Option<&str> {
    let rest = subject.strip_prefix("spiffe://")?;
    let domain = rest.split('/').next()?;
    if domain.is_empty() {
        return None;
    }
    Some(domain)
}

/// Checks that `subject` is a URI whose scheme and host match the configured
/// subject domain (an exact host match or a subdomain of it).
fn check_uri_in_domain(subject: &str, domain: &str) -> Result<(), IdentityError> {
    let sub_url =
        Url::parse(subject).map_err(|_| IdentityError::InvalidSubjectUri(subject.to_owned()))?;
    let domain_url =
        Url::parse(domain).map_err(|_| IdentityError::InvalidSubjectUri(domain.to_owned()))?;

    let mismatch = || IdentityError::SubjectDomainMismatch {
        subject: subject.to_owned(),
        domain: domain.to_owned(),
    };

    if sub_url.scheme() != domain_url.scheme() {
        return Err(mismatch());
    }

    match (sub_url.host_str(), domain_url.host_str()) {
        (Some(sh), Some(dh)) if sh == dh || sh.ends_with(&format!(".{dh}")) => Ok(()),
        _ => Err(mismatch()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OidcIssuerConfig;

    fn resolved(kind: IssuerKind) -> ResolvedIssuer {
        ResolvedIssuer {
            issuer_url: "https://accounts.example".to_owned(),
            config: OidcIssuerConfig {
                kind,
                client_id: "sigstore".to_owned(),
                issuer_claim: None,
                challenge_claim: None,
                subject_domain: None,
                spiffe_trust_domain: None,
            },
        }
    }

    fn claims(pairs: &[(&str, &str)]) -> ClaimSet {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), Value::String((*v).to_owned())))
            .collect()
    }

    #[test]
    fn test_email_principal() {
        let mut c = claims(&[("email", "alice@example.com")]);
        c.insert("email_verified".to_owned(), Value::Bool(true));

        let principal = Principal::from_claims(&resolved(IssuerKind::Email), &c).unwrap();
        assert_eq!(principal.name(), "alice@example.com");
        assert_eq!(
            principal.subject_alt_name(),
            SubjectAltName::Email("alice@example.com".to_owned())
        );
    }

    #[test]
    fn test_email_requires_verified() {
        let c = claims(&[("email", "alice@example.com")]);
        let result = Principal::from_claims(&resolved(IssuerKind::Email), &c);
        assert!(matches!(result, Err(IdentityError::EmailNotVerified)));
    }

    #[test]
    fn test_spiffe_principal_checks_trust_domain() {
        let mut issuer = resolved(IssuerKind::Spiffe);
        issuer.config.spiffe_trust_domain = Some("example.org".to_owned());

        let c = claims(&[("sub", "spiffe://example.org/ns/prod/sa/builder")]);
        let principal = Principal::from_claims(&issuer, &c).unwrap();
        assert_eq!(
            principal.subject_alt_name(),
            SubjectAltName::Uri("spiffe://example.org/ns/prod/sa/builder".to_owned())
        );

        let wrong = claims(&[("sub", "spiffe://other.org/sa/builder")]);
        assert!(matches!(
            Principal::from_claims(&issuer, &wrong),
            Err(IdentityError::TrustDomainMismatch { .. })
        ));
    }

    #[test]
    fn test_github_workflow_principal() {
        let c = claims(&[
            ("workflow_ref", "octo/repo/.github/workflows/release.yml@refs/tags/v1"),
            ("event_name", "push"),
            ("sha", "deadbeef"),
            ("workflow", "Release"),
            ("repository", "octo/repo"),
            ("ref", "refs/tags/v1"),
            ("run_id", "42"),
            ("run_attempt", "1"),
        ]);

        let principal = Principal::from_claims(&resolved(IssuerKind::GithubWorkflow), &c).unwrap();
        assert_eq!(
            principal.name(),
            "https://github.com/octo/repo/.github/workflows/release.yml@refs/tags/v1"
        );

        let ext = principal.extensions();
        assert_eq!(ext.github_workflow_repository.as_deref(), Some("octo/repo"));
        assert_eq!(
            ext.run_invocation_uri.as_deref(),
            Some("https://github.com/octo/repo/actions/runs/42/attempts/1")
        );
    }

    #[test]
    fn test_github_workflow_missing_claim() {
        let c = claims(&[("repository", "octo/repo")]);
        assert!(matches!(
            Principal::from_claims(&resolved(IssuerKind::GithubWorkflow), &c),
            Err(IdentityError::MissingClaim(..))
        ));
    }

    #[test]
    fn test_username_principal_rejects_at_sign() {
        let mut issuer = resolved(IssuerKind::Username);
        issuer.config.subject_domain = Some("example.com".to_owned());

        let ok = claims(&[("sub", "alice")]);
        let principal = Principal::from_claims(&issuer, &ok).unwrap();
        assert_eq!(
            principal.subject_alt_name(),
            SubjectAltName::OtherName("alice!example.com".to_owned())
        );

        let bad = claims(&[("sub", "alice@evil")]);
        assert!(Principal::from_claims(&issuer, &bad).is_err());
    }

    #[test]
    fn test_uri_principal_domain_check() {
        let mut issuer = resolved(IssuerKind::Uri);
        issuer.config.subject_domain = Some("https://apps.example.com".to_owned());

        let ok = claims(&[("sub", "https://apps.example.com/service")]);
        assert!(Principal::from_claims(&issuer, &ok).is_ok());

        let other = claims(&[("sub", "https://elsewhere.net/service")]);
        assert!(matches!(
            Principal::from_claims(&issuer, &other),
            Err(IdentityError::SubjectDomainMismatch { .. })
        ));
    }
}
