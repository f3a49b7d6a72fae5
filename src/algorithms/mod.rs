//! Client signing-algorithm policy.
//!
//! The registry is the allow-list of `(key algorithm, parameter, digest)`
//! triples a client public key may use. Keys are checked against the
//! registry before any token verification happens, and the matched entry
//! selects the digest used for proof-of-possession verification.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use const_oid::db::rfc5912::{ID_EC_PUBLIC_KEY, RSA_ENCRYPTION, SECP_256_R_1, SECP_384_R_1, SECP_521_R_1};
use const_oid::db::rfc8410::ID_ED_25519;
use der::Decode;
use signature::Verifier;
use spki::SubjectPublicKeyInfoRef;
use thiserror::Error;

/// A registry entry: key algorithm, parameter (curve or modulus size), and
/// digest, as a single identifier.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum AlgorithmId {
    /// ECDSA over P-256 with SHA-256.
    EcdsaP256Sha256,
    /// ECDSA over P-384 with SHA-384.
    EcdsaP384Sha384,
    /// ECDSA over P-521 with SHA-512.
    EcdsaP521Sha512,
    /// RSA PKCS#1 v1.5 with a 2048-bit modulus and SHA-256.
    RsaPkcs1v15Sha256B2048,
    /// RSA PKCS#1 v1.5 with a 3072-bit modulus and SHA-256.
    RsaPkcs1v15Sha256B3072,
    /// RSA PKCS#1 v1.5 with a 4096-bit modulus and SHA-256.
    RsaPkcs1v15Sha256B4096,
    /// Ed25519.
    Ed25519,
}

impl AlgorithmId {
    /// All identifiers known to this build.
    pub const ALL: [AlgorithmId; 7] = [
        AlgorithmId::EcdsaP256Sha256,
        AlgorithmId::EcdsaP384Sha384,
        AlgorithmId::EcdsaP521Sha512,
        AlgorithmId::RsaPkcs1v15Sha256B2048,
        AlgorithmId::RsaPkcs1v15Sha256B3072,
        AlgorithmId::RsaPkcs1v15Sha256B4096,
        AlgorithmId::Ed25519,
    ];

    fn flag(&self) -> &'static str {
        match self {
            AlgorithmId::EcdsaP256Sha256 => "ecdsa-sha2-256-nistp256",
            AlgorithmId::EcdsaP384Sha384 => "ecdsa-sha2-384-nistp384",
            AlgorithmId::EcdsaP521Sha512 => "ecdsa-sha2-512-nistp521",
            AlgorithmId::RsaPkcs1v15Sha256B2048 => "rsa-sign-pkcs1-2048-sha256",
            AlgorithmId::RsaPkcs1v15Sha256B3072 => "rsa-sign-pkcs1-3072-sha256",
            AlgorithmId::RsaPkcs1v15Sha256B4096 => "rsa-sign-pkcs1-4096-sha256",
            AlgorithmId::Ed25519 => "ed25519",
        }
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flag())
    }
}

impl FromStr for AlgorithmId {
    type Err = AlgorithmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.flag() == s)
            .ok_or_else(|| AlgorithmError::UnknownFlag(s.to_owned()))
    }
}

/// An error from key parsing or algorithm policy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AlgorithmError {
    /// The public key bytes are not a parseable SubjectPublicKeyInfo.
    #[error("cannot parse public key")]
    ParseKey(#[source] der::Error),

    /// The key's algorithm or parameters are not one this service knows.
    #[error("unsupported key algorithm: {0}")]
    UnsupportedKey(String),

    /// The key's algorithm triple is known but not in the allow-list.
    #[error("algorithm {0} is not allowed")]
    NotAllowed(AlgorithmId),

    /// An algorithm flag string did not name a known identifier.
    #[error("unknown algorithm flag '{0}'")]
    UnknownFlag(String),

    /// A signature did not verify under the presented key.
    #[error("signature verification failed")]
    SignatureInvalid,
}

/// A client public key parsed from SubjectPublicKeyInfo DER, retaining the
/// exact encoding the client presented.
#[derive(Clone)]
pub struct ClientKey {
    spki_der: Vec<u8>,
    inner: KeyInner,
}

#[derive(Clone)]
enum KeyInner {
    EcdsaP256(p256::ecdsa::VerifyingKey),
    EcdsaP384(p384::ecdsa::VerifyingKey),
    EcdsaP521(p521::ecdsa::VerifyingKey),
    Rsa(rsa::RsaPublicKey),
    Ed25519(ed25519_dalek::VerifyingKey),
}

impl fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKey")
            .field("algorithm", &self.algorithm())
            .finish()
    }
}

impl ClientKey {
    /// Parses a client public key from SubjectPublicKeyInfo DER bytes.
    ///
    /// # Errors
    ///
    /// [`AlgorithmError::ParseKey`] for structurally invalid input;
    /// [`AlgorithmError::UnsupportedKey`] for keys whose algorithm, curve,
    /// or modulus size is outside the known set (e.g. P-224).
    pub fn from_spki_der(der: &[u8]) -> Result<Self, AlgorithmError> {
        use p256::pkcs8::DecodePublicKey as _;
        use rsa::pkcs8::DecodePublicKey as _;

        let spki = SubjectPublicKeyInfoRef::from_der(der).map_err(AlgorithmError::ParseKey)?;
        let alg_oid = spki.algorithm.oid;

        let inner = if alg_oid == ID_EC_PUBLIC_KEY {
            let curve = spki
                .algorithm
                .parameters_oid()
                .map_err(|_| AlgorithmError::UnsupportedKey("ec key without named curve".into()))?;
            if curve == SECP_256_R_1 {
                KeyInner::EcdsaP256(
                    p256::ecdsa::VerifyingKey::from_public_key_der(der)
                        .map_err(|_| AlgorithmError::UnsupportedKey("invalid P-256 point".into()))?,
                )
            } else if curve == SECP_384_R_1 {
                KeyInner::EcdsaP384(
                    p384::ecdsa::VerifyingKey::from_public_key_der(der)
                        .map_err(|_| AlgorithmError::UnsupportedKey("invalid P-384 point".into()))?,
                )
            } else if curve == SECP_521_R_1 {
                KeyInner::EcdsaP521(
                    p521::ecdsa::VerifyingKey::from_public_key_der(der)
                        .map_err(|_| AlgorithmError::UnsupportedKey("invalid P-521 point".into()))?,
                )
            } else {
                return Err(AlgorithmError::UnsupportedKey(format!(
                    "ec curve {curve}"
                )));
            }
        } else if alg_oid == RSA_ENCRYPTION {
            KeyInner::Rsa(
                rsa::RsaPublicKey::from_public_key_der(der)
                    .map_err(|_| AlgorithmError::UnsupportedKey("invalid rsa key".into()))?,
            )
        } else if alg_oid == ID_ED_25519 {
            let raw = spki
                .subject_public_key
                .as_bytes()
                .ok_or_else(|| AlgorithmError::UnsupportedKey("unaligned ed25519 key".into()))?;
            let raw: [u8; 32] = raw
                .try_into()
                .map_err(|_| AlgorithmError::UnsupportedKey("invalid ed25519 key length".into()))?;
            KeyInner::Ed25519(
                ed25519_dalek::VerifyingKey::from_bytes(&raw)
                    .map_err(|_| AlgorithmError::UnsupportedKey("invalid ed25519 point".into()))?,
            )
        } else {
            return Err(AlgorithmError::UnsupportedKey(format!(
                "key algorithm {alg_oid}"
            )));
        };

        Ok(Self {
            spki_der: der.to_vec(),
            inner,
        })
    }

    /// The exact SubjectPublicKeyInfo DER the client presented.
    pub fn spki_der(&self) -> &[u8] {
        &self.spki_der
    }

    /// Derives the `(key algorithm, parameter, digest)` identifier.
    ///
    /// # Errors
    ///
    /// [`AlgorithmError::UnsupportedKey`] for RSA moduli outside
    /// 2048/3072/4096 bits.
    pub fn algorithm(&self) -> Result<AlgorithmId, AlgorithmError> {
        match &self.inner {
            KeyInner::EcdsaP256(_) => Ok(AlgorithmId::EcdsaP256Sha256),
            KeyInner::EcdsaP384(_) => Ok(AlgorithmId::EcdsaP384Sha384),
            KeyInner::EcdsaP521(_) => Ok(AlgorithmId::EcdsaP521Sha512),
            KeyInner::Rsa(key) => match {
                use rsa::traits::PublicKeyParts as _;
                key.size()
            } * 8
            {
                2048 => Ok(AlgorithmId::RsaPkcs1v15Sha256B2048),
                3072 => Ok(AlgorithmId::RsaPkcs1v15Sha256B3072),
                4096 => Ok(AlgorithmId::RsaPkcs1v15Sha256B4096),
                bits => Err(AlgorithmError::UnsupportedKey(format!(
                    "rsa modulus of {bits} bits"
                ))),
            },
            KeyInner::Ed25519(_) => Ok(AlgorithmId::Ed25519),
        }
    }

    /// Verifies `signature` over `message` with this key, using the digest
    /// the registry assigns to the key's algorithm.
    ///
    /// ECDSA signatures are accepted in ASN.1 DER form; Ed25519 signatures
    /// are the usual 64 bytes; RSA signatures are PKCS#1 v1.5.
    ///
    /// # Errors
    ///
    /// [`AlgorithmError::SignatureInvalid`] on any mismatch.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), AlgorithmError> {
        let invalid = |_| AlgorithmError::SignatureInvalid;

        match &self.inner {
            KeyInner::EcdsaP256(key) => {
                let sig = p256::ecdsa::Signature::from_der(signature).map_err(invalid)?;
                key.verify(message, &sig).map_err(invalid)
            }
            KeyInner::EcdsaP384(key) => {
                let sig = p384::ecdsa::Signature::from_der(signature).map_err(invalid)?;
                key.verify(message, &sig).map_err(invalid)
            }
            KeyInner::EcdsaP521(key) => {
                let sig = p521::ecdsa::Signature::from_der(signature).map_err(invalid)?;
                key.verify(message, &sig).map_err(invalid)
            }
            KeyInner::Rsa(key) => {
                let verifying_key = rsa::pkcs1v15::VerifyingKey::<sha2::Sha256>::new(key.clone());
                let sig = rsa::pkcs1v15::Signature::try_from(signature).map_err(invalid)?;
                verifying_key.verify(message, &sig).map_err(invalid)
            }
            KeyInner::Ed25519(key) => {
                let sig = ed25519_dalek::Signature::from_slice(signature).map_err(invalid)?;
                key.verify(message, &sig).map_err(invalid)
            }
        }
    }
}

/// The configured allow-list of client signing algorithms.
#[derive(Debug, Clone)]
pub struct AlgorithmRegistry {
    allowed: HashSet<AlgorithmId>,
}

impl AlgorithmRegistry {
    /// Builds a registry from an explicit set of identifiers.
    pub fn new(allowed: impl IntoIterator<Item = AlgorithmId>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }

    /// Parses a registry from flag strings (the process configuration form).
    ///
    /// # Errors
    ///
    /// [`AlgorithmError::UnknownFlag`] for an unrecognized flag.
    pub fn from_flags<S: AsRef<str>>(flags: impl IntoIterator<Item = S>) -> Result<Self, AlgorithmError> {
        let allowed = flags
            .into_iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(Self { allowed })
    }

    /// Returns whether the identifier is allowed.
    pub fn allows(&self, id: AlgorithmId) -> bool {
        self.allowed.contains(&id)
    }

    /// Checks a client key against the allow-list and returns its identifier.
    ///
    /// # Errors
    ///
    /// [`AlgorithmError::UnsupportedKey`] for keys outside the known set,
    /// [`AlgorithmError::NotAllowed`] for known-but-disallowed triples.
    pub fn check(&self, key: &ClientKey) -> Result<AlgorithmId, AlgorithmError> {
        let id = key.algorithm()?;
        if !self.allows(id) {
            return Err(AlgorithmError::NotAllowed(id));
        }
        Ok(id)
    }
}

impl Default for AlgorithmRegistry {
    /// The default allow-list: every identifier in [`AlgorithmId::ALL`].
    fn default() -> Self {
        Self::new(AlgorithmId::ALL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::pkcs8::EncodePublicKey as _;
    use signature::Signer;

    fn p256_key() -> (p256::ecdsa::SigningKey, ClientKey) {
        let sk = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        let spki = sk
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .as_bytes()
            .to_vec();
        let client = ClientKey::from_spki_der(&spki).unwrap();
        (sk, client)
    }

    #[test]
    fn test_p256_key_roundtrip_and_policy() {
        let (_, key) = p256_key();
        assert_eq!(key.algorithm().unwrap(), AlgorithmId::EcdsaP256Sha256);

        let registry = AlgorithmRegistry::default();
        assert_eq!(registry.check(&key).unwrap(), AlgorithmId::EcdsaP256Sha256);

        let restricted = AlgorithmRegistry::new([AlgorithmId::Ed25519]);
        assert!(matches!(
            restricted.check(&key),
            Err(AlgorithmError::NotAllowed(AlgorithmId::EcdsaP256Sha256))
        ));
    }

    #[test]
    fn test_pop_signature_verifies() {
        let (sk, key) = p256_key();
        let message = b"spiffe://example.org/ns/prod/sa/builder";
        let sig: p256::ecdsa::Signature = sk.sign(message);

        key.verify(message, sig.to_der().as_bytes()).unwrap();
        assert!(matches!(
            key.verify(b"something else", sig.to_der().as_bytes()),
            Err(AlgorithmError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_ed25519_key() {
        use ed25519_dalek::pkcs8::EncodePublicKey as _;

        let sk = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        let spki = sk
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .as_bytes()
            .to_vec();

        let key = ClientKey::from_spki_der(&spki).unwrap();
        assert_eq!(key.algorithm().unwrap(), AlgorithmId::Ed25519);

        let sig = sk.sign(b"subject");
        key.verify(b"subject", &sig.to_bytes()).unwrap();
    }

    #[test]
    fn test_unknown_curve_is_unsupported_not_malformed() {
        // A P-224 SPKI: EC algorithm with the secp224r1 parameter OID and a
        // placeholder point. Parsing must classify it as unsupported so the
        // handler rejects before token verification.
        use der::asn1::{BitString, ObjectIdentifier};
        use der::Encode;
        use spki::AlgorithmIdentifier;

        let secp224r1 = ObjectIdentifier::new_unwrap("1.3.132.0.33");
        let spki = spki::SubjectPublicKeyInfo::<der::Any, BitString> {
            algorithm: AlgorithmIdentifier {
                oid: ID_EC_PUBLIC_KEY,
                parameters: Some(der::Any::from(der::AnyRef::from(&secp224r1))),
            },
            subject_public_key: BitString::from_bytes(&[0u8; 57]).unwrap(),
        };
        let der = spki.to_der().unwrap();

        assert!(matches!(
            ClientKey::from_spki_der(&der),
            Err(AlgorithmError::UnsupportedKey(..))
        ));
    }

    #[test]
    fn test_registry_flag_parsing() {
        let registry =
            AlgorithmRegistry::from_flags(["ecdsa-sha2-256-nistp256", "ed25519"]).unwrap();
        assert!(registry.allows(AlgorithmId::EcdsaP256Sha256));
        assert!(!registry.allows(AlgorithmId::EcdsaP384Sha384));

        assert!(AlgorithmRegistry::from_flags(["dsa-1024"]).is_err());
    }
}
