//! Certificate body construction and manipulation.
//!
//! This module owns the `tbsCertificate` layout of issued certificates: the
//! precertificate body (CT poison included), the transformation into the
//! final body (poison stripped, SCT list appended), CSR parsing with
//! self-signature verification, and PEM chain helpers. Signing itself is the
//! CA backend's job; nothing here touches private keys.

use std::time::Duration;

use const_oid::db::rfc5280::ID_KP_CODE_SIGNING;
use const_oid::db::rfc6962::{CT_PRECERT_POISON, CT_PRECERT_SCTS};
use const_oid::AssociatedOid;
use der::asn1::{BitString, Ia5String, OctetString, Utf8StringRef};
use der::{Any, Decode, Encode};
use rand::RngCore;
use sha1::{Digest, Sha1};
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned, SubjectPublicKeyInfoRef};
use thiserror::Error;
use x509_cert::certificate::Version;
use x509_cert::ext::pkix::name::{GeneralName, OtherName};
use x509_cert::ext::pkix::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages,
    SubjectAltName, SubjectKeyIdentifier,
};
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::request::CertReq;
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::Validity;
use x509_cert::{Certificate, TbsCertificate};

use crate::algorithms::{AlgorithmError, ClientKey};
use crate::identity::extensions::OID_OTHERNAME_USERNAME;
use crate::identity::{Principal, SubjectAltName as San};

/// An error that can arise building or transforming certificate bodies.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CertError {
    /// DER encoding or decoding failed.
    #[error("der encoding error")]
    Der(#[from] der::Error),

    /// A SAN value contains characters outside IA5.
    #[error("subject alternative name '{0}' is not encodable")]
    InvalidSan(String),

    /// The issuer certificate could not be parsed.
    #[error("cannot parse issuer certificate")]
    IssuerCertificate(#[source] der::Error),

    /// The poison extension was not present where required.
    #[error("precertificate poison extension is missing")]
    PoisonMissing,

    /// The CSR is structurally invalid.
    #[error("malformed certificate signing request: {0}")]
    MalformedCsr(String),

    /// The CSR's key algorithm is outside the known set.
    #[error("unsupported csr key algorithm: {0}")]
    UnsupportedCsrKey(String),

    /// The CSR's self-signature did not verify.
    #[error("csr signature verification failed")]
    CsrSignature,

    /// A PEM chain block is not a parseable certificate.
    #[error("invalid certificate in pem chain")]
    MalformedCertificate,

    /// PEM framing was invalid.
    #[error("invalid pem")]
    Pem(#[from] pem::PemError),
}

/// Inputs for building a precertificate body.
#[derive(Debug)]
pub struct TbsParams<'a> {
    /// The authenticated principal whose identity the certificate binds.
    pub principal: &'a Principal,
    /// The client's SubjectPublicKeyInfo DER, exactly as presented.
    pub client_spki_der: &'a [u8],
    /// The signing CA's own certificate, DER.
    pub issuer_cert_der: &'a [u8],
    /// The signature algorithm the CA will sign with.
    pub signature_algorithm: AlgorithmIdentifierOwned,
    /// The validity window; `NotBefore` is now.
    pub validity: Duration,
}

/// Builds the `tbsCertificate` of a precertificate.
///
/// Layout: version 3, random 20-byte serial with the high bit cleared, empty
/// subject (the identity lives in SAN and extensions), critical
/// `digitalSignature` key usage, non-critical `codeSigning` EKU, critical
/// `cA=false` basic constraints, exactly one critical SAN entry, the
/// project's identity extensions, subject/authority key identifiers, and the
/// critical CT poison extension last.
///
/// # Errors
///
/// Returns [`CertError`] if any component fails to encode or the issuer
/// certificate cannot be parsed.
pub fn build_precert_tbs(params: &TbsParams<'_>) -> Result<TbsCertificate, CertError> {
    let issuer = Certificate::from_der(params.issuer_cert_der)
        .map_err(CertError::IssuerCertificate)?;

    let spki = SubjectPublicKeyInfoOwned::from_der(params.client_spki_der)?;

    let mut extensions = vec![
        extension(
            KeyUsage::OID,
            true,
            &KeyUsage(KeyUsages::DigitalSignature.into()),
        )?,
        extension(
            ExtendedKeyUsage::OID,
            false,
            &ExtendedKeyUsage(vec![ID_KP_CODE_SIGNING]),
        )?,
        extension(
            BasicConstraints::OID,
            true,
            &BasicConstraints {
                ca: false,
                path_len_constraint: None,
            },
        )?,
        // Subject is empty, so the single SAN entry is critical.
        extension(
            SubjectAltName::OID,
            true,
            &SubjectAltName(vec![general_name(&params.principal.subject_alt_name())?]),
        )?,
        extension(
            SubjectKeyIdentifier::OID,
            false,
            &SubjectKeyIdentifier(OctetString::new(key_identifier(params.client_spki_der)?)?),
        )?,
        extension(
            AuthorityKeyIdentifier::OID,
            false,
            &AuthorityKeyIdentifier {
                key_identifier: Some(OctetString::new(key_identifier(
                    &issuer.tbs_certificate.subject_public_key_info.to_der()?,
                )?)?),
                authority_cert_issuer: None,
                authority_cert_serial_number: None,
            },
        )?,
    ];

    extensions.extend(params.principal.extensions().render()?);
    extensions.push(poison_extension()?);

    Ok(TbsCertificate {
        version: Version::V3,
        serial_number: random_serial()?,
        signature: params.signature_algorithm.clone(),
        issuer: issuer.tbs_certificate.subject.clone(),
        validity: Validity::from_now(params.validity)?,
        subject: Name::default(),
        subject_public_key_info: spki,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: Some(extensions),
    })
}

/// Returns a copy of the body with the poison extension removed and, when
/// given, the SCT-list extension appended in its place.
///
/// Removing the poison (not emptying it) is what turns the precertificate
/// body into the final certificate body.
///
/// # Errors
///
/// [`CertError::PoisonMissing`] if the body carries no poison extension.
pub fn finalize_tbs(
    precert_tbs: &TbsCertificate,
    sct_list: Option<&[u8]>,
) -> Result<TbsCertificate, CertError> {
    let mut tbs = precert_tbs.clone();

    let Some(extensions) = tbs.extensions.as_mut() else {
        return Err(CertError::PoisonMissing);
    };
    let before = extensions.len();
    extensions.retain(|ext| ext.extn_id != CT_PRECERT_POISON);
    if extensions.len() == before {
        return Err(CertError::PoisonMissing);
    }

    if let Some(sct_list) = sct_list {
        extensions.push(Extension {
            extn_id: CT_PRECERT_SCTS,
            critical: false,
            extn_value: OctetString::new(OctetString::new(sct_list)?.to_der()?)?,
        });
    }

    Ok(tbs)
}

/// Assembles a signed certificate from its body, algorithm, and signature.
///
/// # Errors
///
/// Returns [`CertError::Der`] if the certificate fails to encode.
pub fn assemble_certificate(
    tbs: TbsCertificate,
    signature_algorithm: AlgorithmIdentifierOwned,
    signature: &[u8],
) -> Result<Vec<u8>, CertError> {
    let certificate = Certificate {
        tbs_certificate: tbs,
        signature_algorithm,
        signature: BitString::from_bytes(signature)?,
    };
    Ok(certificate.to_der()?)
}

/// A parsed CSR whose self-signature has not been checked yet.
///
/// Parsing and verification are separate steps because the algorithm
/// policy is enforced between them.
#[derive(Debug)]
pub struct ParsedCsr {
    key: ClientKey,
    info_der: Vec<u8>,
    signature: Vec<u8>,
}

impl ParsedCsr {
    /// Parses a CSR from PEM (`CERTIFICATE REQUEST`) or raw DER.
    ///
    /// # Errors
    ///
    /// [`CertError::MalformedCsr`] for any structural problem, including a
    /// public key this service cannot interpret.
    pub fn parse(raw: &[u8]) -> Result<Self, CertError> {
        let der_bytes;
        let der: &[u8] = if raw.starts_with(b"-----BEGIN") {
            let block = pem::parse(raw)?;
            if block.tag() != "CERTIFICATE REQUEST" && block.tag() != "NEW CERTIFICATE REQUEST" {
                return Err(CertError::MalformedCsr(format!(
                    "unexpected pem tag '{}'",
                    block.tag()
                )));
            }
            der_bytes = block.into_contents();
            &der_bytes
        } else {
            raw
        };

        let csr = CertReq::from_der(der).map_err(|e| CertError::MalformedCsr(e.to_string()))?;

        let spki_der = csr
            .info
            .public_key
            .to_der()
            .map_err(|e| CertError::MalformedCsr(e.to_string()))?;
        let key = ClientKey::from_spki_der(&spki_der).map_err(|e| match e {
            AlgorithmError::ParseKey(inner) => CertError::MalformedCsr(inner.to_string()),
            other => CertError::UnsupportedCsrKey(other.to_string()),
        })?;

        let info_der = csr
            .info
            .to_der()
            .map_err(|e| CertError::MalformedCsr(e.to_string()))?;
        let signature = csr
            .signature
            .as_bytes()
            .ok_or_else(|| CertError::MalformedCsr("unaligned csr signature".to_owned()))?
            .to_vec();

        Ok(Self {
            key,
            info_der,
            signature,
        })
    }

    /// The public key embedded in the request.
    pub fn key(&self) -> &ClientKey {
        &self.key
    }

    /// Verifies the CSR's self-signature (the proof of possession).
    ///
    /// # Errors
    ///
    /// [`CertError::CsrSignature`] on mismatch.
    pub fn verify(&self) -> Result<(), CertError> {
        self.key
            .verify(&self.info_der, &self.signature)
            .map_err(|_| CertError::CsrSignature)
    }
}

/// Parses a CSR and verifies its self-signature in one step.
///
/// # Errors
///
/// As [`ParsedCsr::parse`] and [`ParsedCsr::verify`].
pub fn parse_and_verify_csr(raw: &[u8]) -> Result<ClientKey, CertError> {
    let csr = ParsedCsr::parse(raw)?;
    csr.verify()?;
    Ok(csr.key)
}

/// RFC 5280 method 1 key identifier: SHA-1 over the subjectPublicKey bits.
pub fn key_identifier(spki_der: &[u8]) -> Result<Vec<u8>, CertError> {
    let spki = SubjectPublicKeyInfoRef::from_der(spki_der)?;
    let bits = spki
        .subject_public_key
        .as_bytes()
        .ok_or(der::Tag::BitString.value_error())?;
    Ok(Sha1::digest(bits).to_vec())
}

/// Generates a random 20-byte serial with the high bit cleared.
pub fn random_serial() -> Result<SerialNumber, CertError> {
    let mut bytes = [0u8; 20];
    loop {
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        bytes[0] &= 0x7f;
        // Avoid a leading zero octet so the DER integer keeps its length.
        if bytes[0] != 0 {
            break;
        }
    }
    Ok(SerialNumber::new(&bytes)?)
}

/// Encodes a DER chain as concatenated PEM `CERTIFICATE` blocks.
pub fn chain_to_pem(chain: &[Vec<u8>]) -> Vec<String> {
    chain
        .iter()
        .map(|der| pem::encode(&pem::Pem::new("CERTIFICATE", der.clone())))
        .collect()
}

/// Parses concatenated PEM `CERTIFICATE` blocks into validated DER.
///
/// # Errors
///
/// Returns [`CertError`] on PEM framing errors or if a block is not a
/// parseable X.509 certificate.
pub fn parse_pem_chain(raw: &[u8]) -> Result<Vec<Vec<u8>>, CertError> {
    let blocks = pem::parse_many(raw)?;
    let mut chain = Vec::with_capacity(blocks.len());
    for block in blocks {
        if block.tag() != "CERTIFICATE" {
            continue;
        }
        let der = block.into_contents();
        x509_parser::parse_x509_certificate(&der)
            .map_err(|_| CertError::MalformedCertificate)?;
        chain.push(der);
    }
    Ok(chain)
}

fn extension<T: Encode>(
    oid: der::oid::ObjectIdentifier,
    critical: bool,
    value: &T,
) -> Result<Extension, CertError> {
    Ok(Extension {
        extn_id: oid,
        critical,
        extn_value: OctetString::new(value.to_der()?)?,
    })
}

/// The CT poison: critical, value a literal ASN.1 NULL.
fn poison_extension() -> Result<Extension, CertError> {
    Ok(Extension {
        extn_id: CT_PRECERT_POISON,
        critical: true,
        extn_value: OctetString::new(vec![0x05, 0x00])?,
    })
}

fn general_name(san: &San) -> Result<GeneralName, CertError> {
    let ia5 = |value: &str| {
        Ia5String::new(value).map_err(|_| CertError::InvalidSan(value.to_owned()))
    };

    Ok(match san {
        San::Email(email) => GeneralName::Rfc822Name(ia5(email)?),
        San::Uri(uri) => GeneralName::UniformResourceIdentifier(ia5(uri)?),
        San::OtherName(name) => {
            let value = Utf8StringRef::new(name)
                .map_err(|_| CertError::InvalidSan(name.clone()))?
                .to_der()?;
            GeneralName::OtherName(OtherName {
                type_id: OID_OTHERNAME_USERNAME,
                value: Any::from_der(&value)?,
            })
        }
    })
}
