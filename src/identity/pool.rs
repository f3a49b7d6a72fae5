//! Issuer pool: maps a token's `iss` claim to a trusted issuer configuration.
//!
//! The pool is built once from [`IdentityConfig`] and is immutable; the
//! server swaps the whole pool atomically on configuration reload so readers
//! never block.

use std::collections::HashMap;

use serde::Serialize;
use url::Url;

use crate::config::{ConfigError, IdentityConfig, IssuerKind, OidcIssuerConfig};
use crate::identity::ClaimSet;

/// A matched issuer: the configuration to verify against, plus the concrete
/// issuer URL (wildcards resolved to the presented `iss`).
#[derive(Debug, Clone)]
pub struct ResolvedIssuer {
    /// The concrete issuer URL the token presented.
    pub issuer_url: String,
    /// The matched configuration.
    pub config: OidcIssuerConfig,
}

impl ResolvedIssuer {
    /// Returns the issuer URL to record in the certificate's issuer
    /// extension: the value of the configured `IssuerClaim` when present in
    /// the claim set, otherwise the resolved issuer URL.
    pub fn certificate_issuer(&self, claims: &ClaimSet) -> String {
        self.config
            .issuer_claim
            .as_deref()
            .and_then(|name| claims.get(name))
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| self.issuer_url.clone())
    }
}

/// Summary of a configured issuer, reported by the configuration endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct IssuerSummary {
    /// The issuer URL or wildcard pattern.
    pub url: String,
    /// The issuer kind.
    pub kind: IssuerKind,
    /// The audience tokens must carry.
    pub client_id: String,
}

/// The set of trusted issuers, indexed for per-request lookup.
#[derive(Debug, Clone, Default)]
pub struct IssuerPool {
    exact: HashMap<String, Vec<OidcIssuerConfig>>,
    wildcard: Vec<(String, Vec<OidcIssuerConfig>)>,
}

impl IssuerPool {
    /// Builds a pool from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration fails validation.
    pub fn from_config(config: &IdentityConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut pool = Self::default();
        for (issuer, cfg) in &config.oidc_issuers {
            pool.exact
                .entry(issuer.clone())
                .or_default()
                .push(cfg.clone());
        }

        let mut patterns: Vec<&String> = config.meta_issuers.keys().collect();
        patterns.sort();
        for pattern in patterns {
            pool.wildcard
                .push((pattern.clone(), vec![config.meta_issuers[pattern].clone()]));
        }

        Ok(pool)
    }

    /// Looks up the issuer configuration for a presented `iss` claim.
    ///
    /// Exact matches win over wildcard matches. When several configurations
    /// share the issuer URL, the discriminating challenge claim selects one;
    /// configurations whose challenge claim is absent from the token do not
    /// match.
    pub fn lookup(&self, iss: &str, claims: &ClaimSet) -> Option<ResolvedIssuer> {
        if let Some(candidates) = self.exact.get(iss) {
            if let Some(config) = select_candidate(candidates, claims) {
                return Some(ResolvedIssuer {
                    issuer_url: iss.to_owned(),
                    config: config.clone(),
                });
            }
        }

        for (pattern, candidates) in &self.wildcard {
            if wildcard_matches(pattern, iss) {
                if let Some(config) = select_candidate(candidates, claims) {
                    return Some(ResolvedIssuer {
                        issuer_url: iss.to_owned(),
                        config: config.clone(),
                    });
                }
            }
        }

        None
    }

    /// Lists the configured issuers for the configuration endpoint.
    pub fn summaries(&self) -> Vec<IssuerSummary> {
        let mut out: Vec<IssuerSummary> = self
            .exact
            .iter()
            .flat_map(|(url, configs)| configs.iter().map(move |c| (url.clone(), c)))
            .chain(
                self.wildcard
                    .iter()
                    .flat_map(|(url, configs)| configs.iter().map(move |c| (url.clone(), c))),
            )
            .map(|(url, c)| IssuerSummary {
                url,
                kind: c.kind,
                client_id: c.client_id.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.url.cmp(&b.url));
        out
    }
}

/// Picks the single matching configuration among candidates sharing an
/// issuer URL. Load-time validation guarantees distinct challenge claims, so
/// picking the first match (in claim-name order) is deterministic.
fn select_candidate<'a>(
    candidates: &'a [OidcIssuerConfig],
    claims: &ClaimSet,
) -> Option<&'a OidcIssuerConfig> {
    if candidates.len() == 1 {
        return candidates.first();
    }

    let mut matching: Vec<&OidcIssuerConfig> = candidates
        .iter()
        .filter(|c| {
            c.challenge_claim
                .as_deref()
                .is_some_and(|claim| claims.contains_key(claim))
        })
        .collect();
    matching.sort_by(|a, b| a.challenge_claim.cmp(&b.challenge_claim));
    matching.into_iter().next()
}

// Pattern labels must equal the presented labels except for the single `*`
// label; scheme, port, and path must match exactly.
fn wildcard_matches(pattern: &str, iss: &str) -> bool {
    const PLACEHOLDER: &str = "wildcard-label";

    let Ok(iss_url) = Url::parse(iss) else {
        return false;
    };
    let Ok(pattern_url) = Url::parse(&pattern.replacen('*', PLACEHOLDER, 1)) else {
        return false;
    };

    if iss_url.scheme() != pattern_url.scheme()
        || iss_url.port() != pattern_url.port()
        || iss_url.path() != pattern_url.path()
    {
        return false;
    }

    let (Some(iss_host), Some(pattern_host)) = (iss_url.host_str(), pattern_url.host_str()) else {
        return false;
    };

    let iss_labels: Vec<&str> = iss_host.split('.').collect();
    let pattern_labels: Vec<&str> = pattern_host.split('.').collect();

    iss_labels.len() == pattern_labels.len()
        && iss_labels
            .iter()
            .zip(&pattern_labels)
            .all(|(i, p)| *p == PLACEHOLDER || i == p)
}
