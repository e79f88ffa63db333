//! Published verification keys
//!
//! A [`Jwk`] is one accepted record of a key-set document: its identifier,
//! any declared algorithm and usage, and the [`PublicKey`] material itself.
//! Public keys are validated when constructed, so a `Jwk` that exists is
//! always usable with at least one algorithm.

use std::fmt;

use aliri_braid::braid;
use ring::signature::{self, UnparsedPublicKey, VerificationAlgorithm};

use crate::{
    error::{self, JwkVerifyError},
    jwa::{self, KeyType},
};

/// An identifier for a JWK
#[braid(serde, ref_doc = "A borrowed reference to JWK identifier ([`KeyId`])")]
pub struct KeyId;

const RSA_MIN_BITS: usize = 2048;
const RSA_MAX_BITS: usize = 8192;
const ED25519_KEY_LEN: usize = 32;

/// A named elliptic curve
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[non_exhaustive]
pub enum Curve {
    /// NIST P-256
    P256,

    /// NIST P-384
    P384,
}

impl Curve {
    /// The `crv` value used for this curve
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::P256 => "P-256",
            Self::P384 => "P-384",
        }
    }

    /// The length in bytes of one affine coordinate
    #[must_use]
    pub const fn coordinate_len(self) -> usize {
        match self {
            Self::P256 => 32,
            Self::P384 => 48,
        }
    }

    /// The signing algorithm paired with this curve
    #[must_use]
    pub const fn algorithm(self) -> jwa::Algorithm {
        match self {
            Self::P256 => jwa::Algorithm::ES256,
            Self::P384 => jwa::Algorithm::ES384,
        }
    }

    pub(crate) fn from_crv(crv: &str) -> Option<Self> {
        match crv {
            "P-256" => Some(Self::P256),
            "P-384" => Some(Self::P384),
            _ => None,
        }
    }

    fn verification_params(self) -> &'static dyn VerificationAlgorithm {
        match self {
            Self::P256 => &signature::ECDSA_P256_SHA256_FIXED,
            Self::P384 => &signature::ECDSA_P384_SHA384_FIXED,
        }
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public key material, tagged by key family
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum PublicKey {
    /// An RSA public key
    Rsa {
        /// The big-endian modulus, without leading zero bytes
        modulus: Vec<u8>,
        /// The big-endian public exponent
        exponent: Vec<u8>,
    },

    /// An elliptic curve public key
    EllipticCurve {
        /// The curve the point lies on
        curve: Curve,
        /// The uncompressed point (`0x04 || x || y`)
        point: Vec<u8>,
    },

    /// An Ed25519 public key
    Ed25519 {
        /// The 32-byte encoded point
        x: Vec<u8>,
    },
}

impl PublicKey {
    /// Constructs an RSA public key from its modulus and exponent
    ///
    /// Leading zero bytes on the modulus are ignored. The modulus must be
    /// between 2048 and 8192 bits.
    pub fn rsa(
        modulus: impl Into<Vec<u8>>,
        exponent: impl Into<Vec<u8>>,
    ) -> Result<Self, error::KeyRejected> {
        let mut modulus = modulus.into();
        let exponent = exponent.into();

        let leading = modulus.iter().take_while(|&&b| b == 0).count();
        modulus.drain(..leading);

        let bits = match modulus.first() {
            Some(first) => modulus.len() * 8 - first.leading_zeros() as usize,
            None => 0,
        };

        if bits < RSA_MIN_BITS {
            return Err(error::key_rejected("RSA modulus is shorter than 2048 bits"));
        }

        if bits > RSA_MAX_BITS {
            return Err(error::key_rejected("RSA modulus is longer than 8192 bits"));
        }

        if exponent.iter().all(|&b| b == 0) {
            return Err(error::key_rejected("RSA exponent is missing"));
        }

        Ok(Self::Rsa { modulus, exponent })
    }

    /// Constructs an elliptic curve public key from its affine coordinates
    pub fn elliptic_curve(curve: Curve, x: &[u8], y: &[u8]) -> Result<Self, error::KeyRejected> {
        let len = curve.coordinate_len();
        if x.len() != len || y.len() != len {
            return Err(error::key_rejected(
                "elliptic curve coordinates do not match the curve size",
            ));
        }

        let mut point = Vec::with_capacity(1 + 2 * len);
        point.push(0x04);
        point.extend_from_slice(x);
        point.extend_from_slice(y);

        Ok(Self::EllipticCurve { curve, point })
    }

    /// Constructs an Ed25519 public key
    pub fn ed25519(x: impl Into<Vec<u8>>) -> Result<Self, error::KeyRejected> {
        let x = x.into();
        if x.len() != ED25519_KEY_LEN {
            return Err(error::key_rejected("Ed25519 key must be 32 bytes"));
        }

        Ok(Self::Ed25519 { x })
    }

    /// The family this key belongs to
    #[must_use]
    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Rsa { .. } => KeyType::Rsa,
            Self::EllipticCurve { .. } => KeyType::EllipticCurve,
            Self::Ed25519 { .. } => KeyType::OctetKeyPair,
        }
    }

    /// Whether this key can verify signatures made with `alg`
    #[must_use]
    pub fn can_verify(&self, alg: jwa::Algorithm) -> bool {
        match self {
            Self::Rsa { .. } => alg.key_type() == KeyType::Rsa,
            Self::EllipticCurve { curve, .. } => curve.algorithm() == alg,
            Self::Ed25519 { .. } => alg == jwa::Algorithm::EdDSA,
        }
    }

    /// Verifies `signature` over `data` using `alg`
    pub fn verify(
        &self,
        alg: jwa::Algorithm,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), JwkVerifyError> {
        if !self.can_verify(alg) {
            return Err(error::incompatible_algorithm(alg).into());
        }

        match self {
            Self::Rsa { modulus, exponent } => {
                let params = alg
                    .rsa_params()
                    .ok_or_else(|| error::incompatible_algorithm(alg))?;

                let pk = signature::RsaPublicKeyComponents {
                    n: modulus.as_slice(),
                    e: exponent.as_slice(),
                };

                pk.verify(params, data, signature)
                    .map_err(|_| error::signature_mismatch().into())
            }
            Self::EllipticCurve { curve, point } => {
                verify_unparsed(curve.verification_params(), point, data, signature)
            }
            Self::Ed25519 { x } => verify_unparsed(&signature::ED25519, x, data, signature),
        }
    }
}

fn verify_unparsed(
    params: &'static dyn VerificationAlgorithm,
    key: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), JwkVerifyError> {
    UnparsedPublicKey::new(params, key)
        .verify(data, signature)
        .map_err(|_| error::signature_mismatch().into())
}

/// An identified JSON Web Key accepted from a key set
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub struct Jwk {
    key_id: KeyId,
    usage: Option<jwa::Usage>,
    algorithm: Option<jwa::Algorithm>,
    key: PublicKey,
}

impl Jwk {
    /// Constructs a JWK with no declared algorithm or usage
    pub fn new(key_id: KeyId, key: PublicKey) -> Self {
        Self {
            key_id,
            usage: None,
            algorithm: None,
            key,
        }
    }

    /// Declares the only algorithm this key may be used with
    ///
    /// Fails if the key material cannot verify that algorithm.
    pub fn with_algorithm(self, alg: jwa::Algorithm) -> Result<Self, error::IncompatibleAlgorithm> {
        if !self.key.can_verify(alg) {
            return Err(error::incompatible_algorithm(alg));
        }

        Ok(Self {
            algorithm: Some(alg),
            ..self
        })
    }

    /// Sets the key's usage
    pub fn with_usage(self, usage: jwa::Usage) -> Self {
        Self {
            usage: Some(usage),
            ..self
        }
    }

    /// The key ID
    #[must_use]
    pub fn key_id(&self) -> &KeyIdRef {
        &self.key_id
    }

    /// The intended usage of the key
    #[must_use]
    pub fn usage(&self) -> Option<jwa::Usage> {
        self.usage
    }

    /// The algorithm declared for this key, if any
    #[must_use]
    pub fn algorithm(&self) -> Option<jwa::Algorithm> {
        self.algorithm
    }

    /// The public key material
    #[must_use]
    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    /// Whether the key may be used to verify `alg` signatures
    ///
    /// A key that declares an algorithm is only compatible with that one.
    #[must_use]
    pub fn is_compatible(&self, alg: jwa::Algorithm) -> bool {
        self.algorithm.map_or(true, |declared| declared == alg) && self.key.can_verify(alg)
    }

    /// Verifies `signature` over `data` using `alg`
    pub fn verify(
        &self,
        alg: jwa::Algorithm,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), JwkVerifyError> {
        if !self.is_compatible(alg) {
            return Err(error::incompatible_algorithm(alg).into());
        }

        self.key.verify(alg, data, signature)
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use ring::signature::KeyPair;

    use super::*;
    use crate::test;

    #[test]
    fn rsa_rejects_short_modulus() {
        let err = PublicKey::rsa(vec![0xff; 128], vec![1, 0, 1]).unwrap_err();
        assert_eq!(err.reason(), "RSA modulus is shorter than 2048 bits");
    }

    #[test]
    fn rsa_strips_leading_zeros() -> Result<()> {
        let mut modulus = vec![0u8; 2];
        modulus.extend(std::iter::repeat(0xab).take(256));

        match PublicKey::rsa(modulus, vec![1, 0, 1])? {
            PublicKey::Rsa { modulus, .. } => assert_eq!(modulus.len(), 256),
            other => panic!("unexpected key {:?}", other),
        }

        Ok(())
    }

    #[test]
    fn rsa_rejects_zero_exponent() {
        assert!(PublicKey::rsa(vec![0xab; 256], vec![0]).is_err());
        assert!(PublicKey::rsa(vec![0xab; 256], Vec::new()).is_err());
    }

    #[test]
    fn ec_coordinates_must_match_curve() {
        assert!(PublicKey::elliptic_curve(Curve::P256, &[1; 32], &[2; 32]).is_ok());
        assert!(PublicKey::elliptic_curve(Curve::P256, &[1; 48], &[2; 48]).is_err());
        assert!(PublicKey::elliptic_curve(Curve::P384, &[1; 48], &[2; 47]).is_err());
    }

    #[test]
    fn ed25519_must_be_32_bytes() {
        assert!(PublicKey::ed25519(vec![7; 32]).is_ok());
        assert!(PublicKey::ed25519(vec![7; 31]).is_err());
    }

    #[test]
    fn rsa_verifies_rs256() -> Result<()> {
        let jwk = test::rsa_jwk();
        let sig = test::rsa_sign(b"hello");

        jwk.verify(jwa::Algorithm::RS256, b"hello", &sig)?;
        let err = jwk.verify(jwa::Algorithm::RS256, b"hellO", &sig).unwrap_err();
        assert!(err.is_signature_mismatch());

        Ok(())
    }

    #[test]
    fn declared_algorithm_restricts_key() {
        let jwk = test::rsa_jwk();
        assert_eq!(jwk.algorithm(), Some(jwa::Algorithm::RS256));
        assert!(!jwk.is_compatible(jwa::Algorithm::RS512));

        let sig = test::rsa_sign(b"hello");
        let err = jwk.verify(jwa::Algorithm::RS512, b"hello", &sig).unwrap_err();
        assert!(err.is_incompatible_alg());
    }

    #[test]
    fn incompatible_declared_algorithm_is_refused() {
        let jwk = Jwk::new(
            KeyId::from_static("ed"),
            PublicKey::ed25519(vec![7; 32]).unwrap(),
        );
        assert!(jwk.with_algorithm(jwa::Algorithm::ES256).is_err());
    }

    #[test]
    fn ed25519_verifies_eddsa() -> Result<()> {
        let pair = test::ed25519_key_pair();
        let key = PublicKey::ed25519(pair.public_key().as_ref())?;
        let sig = pair.sign(b"payload");

        key.verify(jwa::Algorithm::EdDSA, b"payload", sig.as_ref())?;
        assert!(key
            .verify(jwa::Algorithm::ES256, b"payload", sig.as_ref())
            .unwrap_err()
            .is_incompatible_alg());

        Ok(())
    }

    #[test]
    fn p256_verifies_es256() -> Result<()> {
        let pair = test::p256_key_pair();
        let public = pair.public_key().as_ref();
        let key = PublicKey::elliptic_curve(Curve::P256, &public[1..33], &public[33..65])?;
        let sig = test::p256_sign(&pair, b"payload");

        key.verify(jwa::Algorithm::ES256, b"payload", &sig)?;
        assert!(key
            .verify(jwa::Algorithm::ES256, b"other", &sig)
            .unwrap_err()
            .is_signature_mismatch());

        Ok(())
    }
}
