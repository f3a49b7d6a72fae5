#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! A short-lived code-signing certificate authority.
//!
//! Clients present a freshly generated public key together with a proof of
//! possession and an OIDC identity token. The service verifies the token
//! against the configured identity provider, projects its claims into a
//! [`Principal`], issues a code-signing certificate valid for a few minutes,
//! submits the precertificate to a Certificate Transparency log, and returns
//! the final certificate chain along with the signed certificate timestamp.
//!
//! The issuance pipeline lives in [`server::CaService`]; signing backends
//! implement the [`ca::CertificateAuthority`] contract.
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use emberca::ca::ephemeral::EphemeralCa;
//! use emberca::config::IdentityConfig;
//! use emberca::server::CaServiceBuilder;
//!
//! let config = IdentityConfig::load("config.yaml")?;
//! let ca = Arc::new(EphemeralCa::new(Duration::from_secs(600))?);
//!
//! let service = CaServiceBuilder::new(ca).issuers(config)?.build();
//! # Ok(())
//! # }
//! ```

pub mod algorithms;
pub mod ca;
pub mod cert;
pub mod config;
pub mod ctlog;
pub mod identity;
pub mod oidc;
pub mod server;

// Core identity types
pub use crate::identity::{IssuerPool, Principal};

// Issuance surface
pub use crate::server::{CaService, CaServiceBuilder};

// Signing contract
pub use crate::ca::{CaError, CertificateAuthority, CodeSigningCertificate};
