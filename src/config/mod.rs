//! Identity-provider configuration.
//!
//! The configuration file maps OIDC issuer URLs to the settings used to
//! verify tokens from that issuer and to project verified claims into a
//! principal. Wildcard issuers (one `*` host label) live in a separate
//! `MetaIssuers` map. The file may be JSON or YAML; field names follow the
//! original deployment format and are accepted case-sensitively via serde
//! aliases.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// The kind of identity an issuer vouches for.
///
/// The kind selects the principal variant extracted from a verified claim
/// set, and therefore the SAN type and extension set of issued certificates.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssuerKind {
    /// Email identities (`email` claim, requires `email_verified`).
    Email,
    /// SPIFFE identities (`sub` is a `spiffe://` URI).
    Spiffe,
    /// Generic URI identities under a configured subject domain.
    Uri,
    /// Username identities rendered as an otherName SAN.
    Username,
    /// GitHub Actions workflow identities.
    GithubWorkflow,
    /// GitLab CI pipeline identities.
    GitlabPipeline,
    /// Buildkite job identities.
    BuildkiteJob,
    /// Generic CI-provider identities configured via a challenge claim.
    CiProvider,
}

/// Settings for a single trusted OIDC issuer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcIssuerConfig {
    /// The principal kind extracted from this issuer's tokens.
    #[serde(alias = "Type")]
    pub kind: IssuerKind,

    /// Audience (`aud`) value tokens from this issuer must carry.
    #[serde(alias = "ClientID")]
    pub client_id: String,

    /// Optional claim whose value overrides the issuer URL recorded in the
    /// certificate's issuer extension (federated identity providers).
    #[serde(alias = "IssuerClaim", default)]
    pub issuer_claim: Option<String>,

    /// Claim holding the subject for non-email kinds. Defaults to `sub`.
    /// Also acts as the discriminator when several configurations share one
    /// issuer URL: a configuration only matches tokens that carry this claim.
    #[serde(alias = "ChallengeClaim", default)]
    pub challenge_claim: Option<String>,

    /// Domain the subject must belong to (`uri` and `username` kinds).
    #[serde(alias = "SubjectDomain", default)]
    pub subject_domain: Option<String>,

    /// Trust domain SPIFFE subjects must belong to (`spiffe` kind).
    #[serde(alias = "SPIFFETrustDomain", default)]
    pub spiffe_trust_domain: Option<String>,
}

/// Top-level identity configuration: trusted issuers and wildcard issuers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Issuers matched by exact URL.
    #[serde(alias = "OIDCIssuers", default)]
    pub oidc_issuers: HashMap<String, OidcIssuerConfig>,

    /// Issuers matched by wildcard URL (one `*` host label).
    #[serde(alias = "MetaIssuers", default)]
    pub meta_issuers: HashMap<String, OidcIssuerConfig>,
}

/// An error that can arise loading or validating the identity configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid JSON.
    #[error("cannot parse config as json")]
    Json(#[from] serde_json::Error),

    /// The configuration file is not valid YAML.
    #[error("cannot parse config as yaml")]
    Yaml(#[from] serde_yaml::Error),

    /// An issuer URL could not be parsed.
    #[error("invalid issuer url '{0}'")]
    InvalidIssuerUrl(String),

    /// A wildcard issuer URL must contain `*` in exactly one host label.
    #[error("wildcard issuer '{0}' must contain '*' in exactly one host label")]
    InvalidWildcard(String),

    /// Two configurations for the same issuer cannot be told apart.
    #[error("ambiguous configurations for issuer '{0}': duplicate or missing challenge claims")]
    AmbiguousIssuer(String),

    /// A required per-kind field is missing.
    #[error("issuer '{issuer}': {field} is required for kind {kind:?}")]
    MissingField {
        /// The issuer URL the configuration belongs to.
        issuer: String,
        /// The missing field name.
        field: &'static str,
        /// The configured issuer kind.
        kind: IssuerKind,
    },
}

impl IdentityConfig {
    /// Loads and validates a configuration file.
    ///
    /// The format is selected by extension: `.yaml`/`.yml` parse as YAML,
    /// anything else as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or fails
    /// [`IdentityConfig::validate`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)?,
            _ => serde_json::from_str(&raw)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates issuer URLs, wildcard placement, per-kind required fields,
    /// and discriminator ambiguity.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] encountered. Ambiguity between
    /// configurations sharing an issuer URL is a load-time error so that it
    /// never surfaces as a per-request failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (issuer, cfg) in &self.oidc_issuers {
            if issuer.contains('*') {
                return Err(ConfigError::InvalidWildcard(issuer.clone()));
            }
            Url::parse(issuer).map_err(|_| ConfigError::InvalidIssuerUrl(issuer.clone()))?;
            validate_issuer_fields(issuer, cfg)?;
        }

        for (pattern, cfg) in &self.meta_issuers {
            validate_wildcard_pattern(pattern)?;
            validate_issuer_fields(pattern, cfg)?;
        }

        // Configurations sharing an issuer URL must all carry distinct
        // challenge claims, so that at most one can match a token.
        let mut seen: HashMap<&str, Vec<Option<&str>>> = HashMap::new();
        for (issuer, cfg) in self.oidc_issuers.iter().chain(self.meta_issuers.iter()) {
            seen.entry(issuer.as_str())
                .or_default()
                .push(cfg.challenge_claim.as_deref());
        }
        for (issuer, mut claims) in seen {
            if claims.len() > 1 {
                let total = claims.len();
                if claims.iter().any(Option::is_none) {
                    return Err(ConfigError::AmbiguousIssuer(issuer.to_owned()));
                }
                claims.sort_unstable();
                claims.dedup();
                if claims.len() != total {
                    return Err(ConfigError::AmbiguousIssuer(issuer.to_owned()));
                }
            }
        }

        Ok(())
    }
}

fn validate_issuer_fields(issuer: &str, cfg: &OidcIssuerConfig) -> Result<(), ConfigError> {
    let missing = |field| ConfigError::MissingField {
        issuer: issuer.to_owned(),
        field,
        kind: cfg.kind,
    };

    match cfg.kind {
        IssuerKind::Uri | IssuerKind::Username => {
            if cfg.subject_domain.is_none() {
                return Err(missing("SubjectDomain"));
            }
        }
        IssuerKind::CiProvider => {
            if cfg.challenge_claim.is_none() {
                return Err(missing("ChallengeClaim"));
            }
        }
        _ => {}
    }

    Ok(())
}

/// Checks that a wildcard pattern parses as a URL once `*` is substituted,
/// and that the `*` occupies exactly one full host label.
pub(crate) fn validate_wildcard_pattern(pattern: &str) -> Result<(), ConfigError> {
    if pattern.matches('*').count() != 1 {
        return Err(ConfigError::InvalidWildcard(pattern.to_owned()));
    }

    let substituted = pattern.replacen('*', "wildcard", 1);
    let url =
        Url::parse(&substituted).map_err(|_| ConfigError::InvalidIssuerUrl(pattern.to_owned()))?;
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidWildcard(pattern.to_owned()));
    }

    // The `*` must occupy a full host label, not part of one.
    let rest = pattern.split("://").nth(1).unwrap_or(pattern);
    let host = rest.split('/').next().unwrap_or(rest);
    if !host.split('.').any(|label| label == "*") {
        return Err(ConfigError::InvalidWildcard(pattern.to_owned()));
    }

    Ok(())
}
