//! JSON Web Algorithms understood by the verifier
//!
//! Only asymmetric signature algorithms are represented. Symmetric (`HS*`)
//! algorithms and `none` parse as unknown.

use std::{convert::TryFrom, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error;

/// The family of key material held by a key-set record (`kty`)
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[non_exhaustive]
pub enum KeyType {
    /// RSA public keys
    #[serde(rename = "RSA")]
    Rsa,

    /// Elliptic curve public keys over the NIST curves
    #[serde(rename = "EC")]
    EllipticCurve,

    /// Octet key pairs, such as Ed25519
    #[serde(rename = "OKP")]
    OctetKeyPair,
}

impl KeyType {
    /// The `kty` value used for this key type
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rsa => "RSA",
            Self::EllipticCurve => "EC",
            Self::OctetKeyPair => "OKP",
        }
    }

    pub(crate) fn from_kty(kty: &str) -> Option<Self> {
        match kty {
            "RSA" => Some(Self::Rsa),
            "EC" => Some(Self::EllipticCurve),
            "OKP" => Some(Self::OctetKeyPair),
            _ => None,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The intended use of a published key (`use`)
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Usage {
    /// The key is intended for signing and verification
    #[serde(rename = "sig")]
    Signing,

    /// The key is intended for encryption
    #[serde(rename = "enc")]
    Encryption,
}

impl Usage {
    pub(crate) fn from_use(value: &str) -> Option<Self> {
        match value {
            "sig" => Some(Self::Signing),
            "enc" => Some(Self::Encryption),
            _ => None,
        }
    }
}

/// An asymmetric signature algorithm
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
#[non_exhaustive]
pub enum Algorithm {
    /// RSASSA-PKCS1-v1_5 using SHA-256
    RS256,
    /// RSASSA-PKCS1-v1_5 using SHA-384
    RS384,
    /// RSASSA-PKCS1-v1_5 using SHA-512
    RS512,
    /// RSASSA-PSS using SHA-256
    PS256,
    /// RSASSA-PSS using SHA-384
    PS384,
    /// RSASSA-PSS using SHA-512
    PS512,
    /// ECDSA using P-256 and SHA-256
    ES256,
    /// ECDSA using P-384 and SHA-384
    ES384,
    /// Edwards-curve signatures (Ed25519)
    EdDSA,
}

impl Algorithm {
    /// The key type required to verify signatures made with this algorithm
    #[must_use]
    pub const fn key_type(self) -> KeyType {
        match self {
            Self::RS256 | Self::RS384 | Self::RS512 | Self::PS256 | Self::PS384 | Self::PS512 => {
                KeyType::Rsa
            }
            Self::ES256 | Self::ES384 => KeyType::EllipticCurve,
            Self::EdDSA => KeyType::OctetKeyPair,
        }
    }

    /// The `alg` value used for this algorithm
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RS256 => "RS256",
            Self::RS384 => "RS384",
            Self::RS512 => "RS512",
            Self::PS256 => "PS256",
            Self::PS384 => "PS384",
            Self::PS512 => "PS512",
            Self::ES256 => "ES256",
            Self::ES384 => "ES384",
            Self::EdDSA => "EdDSA",
        }
    }

    pub(crate) fn rsa_params(self) -> Option<&'static ring::signature::RsaParameters> {
        match self {
            Self::RS256 => Some(&ring::signature::RSA_PKCS1_2048_8192_SHA256),
            Self::RS384 => Some(&ring::signature::RSA_PKCS1_2048_8192_SHA384),
            Self::RS512 => Some(&ring::signature::RSA_PKCS1_2048_8192_SHA512),
            Self::PS256 => Some(&ring::signature::RSA_PSS_2048_8192_SHA256),
            Self::PS384 => Some(&ring::signature::RSA_PSS_2048_8192_SHA384),
            Self::PS512 => Some(&ring::signature::RSA_PSS_2048_8192_SHA512),
            _ => None,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&'_ str> for Algorithm {
    type Error = error::UnknownAlgorithm;

    #[inline]
    fn try_from(value: &'_ str) -> Result<Self, Self::Error> {
        match value {
            "RS256" => Ok(Self::RS256),
            "RS384" => Ok(Self::RS384),
            "RS512" => Ok(Self::RS512),
            "PS256" => Ok(Self::PS256),
            "PS384" => Ok(Self::PS384),
            "PS512" => Ok(Self::PS512),
            "ES256" => Ok(Self::ES256),
            "ES384" => Ok(Self::ES384),
            "EdDSA" => Ok(Self::EdDSA),
            _ => Err(error::unknown_algorithm(value.to_string())),
        }
    }
}

impl FromStr for Algorithm {
    type Err = error::UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s)
    }
}
