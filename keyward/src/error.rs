//! Common errors

use std::{error::Error as StdError, sync::Arc, time::Duration};

use thiserror::Error;

use crate::{jwa, jwk::KeyId, jwks::SkipCounts};

/// The key cannot be used with the requested algorithm
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Error)]
#[error("key incompatible with algorithm '{alg}'")]
pub struct IncompatibleAlgorithm {
    alg: jwa::Algorithm,
}

#[inline]
pub(crate) fn incompatible_algorithm(alg: jwa::Algorithm) -> IncompatibleAlgorithm {
    IncompatibleAlgorithm { alg }
}

/// The provided name could not be matched with supported algorithms
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("'{alg}' does not match supported algorithms")]
pub struct UnknownAlgorithm {
    alg: String,
}

#[inline]
pub(crate) fn unknown_algorithm(alg: String) -> UnknownAlgorithm {
    UnknownAlgorithm { alg }
}

/// The signature did not match
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Error)]
#[error("signature mismatch")]
pub struct SignatureMismatch {
    _p: (),
}

pub(crate) const fn signature_mismatch() -> SignatureMismatch {
    SignatureMismatch { _p: () }
}

/// The key material in a key-set record could not be used
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Error)]
#[error("key rejected: {reason}")]
pub struct KeyRejected {
    reason: &'static str,
}

impl KeyRejected {
    /// Why the key was rejected
    #[must_use]
    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

pub(crate) const fn key_rejected(reason: &'static str) -> KeyRejected {
    KeyRejected { reason }
}

/// An error occurring while verifying a signature with a key
#[derive(Debug, Error)]
pub enum JwkVerifyError {
    /// The key cannot be used with this algorithm
    #[error(transparent)]
    IncompatibleAlgorithm(#[from] IncompatibleAlgorithm),

    /// Signature is invalid
    #[error(transparent)]
    SignatureMismatch(#[from] SignatureMismatch),
}

impl JwkVerifyError {
    /// Whether the error is due to an incompatible algorithm
    #[must_use]
    pub fn is_incompatible_alg(&self) -> bool {
        matches!(self, Self::IncompatibleAlgorithm(_))
    }

    /// Whether the error is due to a signature mismatch
    #[must_use]
    pub fn is_signature_mismatch(&self) -> bool {
        matches!(self, Self::SignatureMismatch(_))
    }
}

/// The token could not be broken down into header, payload, and signature
#[derive(Debug, Error)]
pub enum MalformedJwt {
    /// The token does not have three `.`-separated sections
    #[error("token is not made up of a header, payload, and signature")]
    Structure,

    /// The header section is not base64url-encoded JSON
    #[error("malformed token header")]
    Header(#[source] Box<dyn StdError + Send + Sync + 'static>),

    /// The signature section is not base64url-encoded
    #[error("malformed token signature")]
    Signature(#[source] Box<dyn StdError + Send + Sync + 'static>),
}

pub(crate) fn malformed_jwt_header(
    source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
) -> MalformedJwt {
    MalformedJwt::Header(source.into())
}

pub(crate) fn malformed_jwt_signature(
    source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
) -> MalformedJwt {
    MalformedJwt::Signature(source.into())
}

/// An error occurring when validating the claims of a token
#[derive(Debug, Error)]
pub enum ClaimsRejected {
    /// The token audience is not acceptable
    #[error("invalid audience")]
    InvalidAudience,

    /// The token issuer is not acceptable
    #[error("invalid issuer")]
    InvalidIssuer,

    /// The token is expired according to the `exp` claim
    #[error("token expired")]
    TokenExpired,

    /// The token is not yet valid according to the `nbf` claim
    #[error("token not yet valid")]
    TokenNotYetValid,

    /// A required claim is missing
    #[error("required {0} claim missing")]
    MissingRequiredClaim(&'static str),
}

/// A token whose structure was sound but which failed verification
#[derive(Debug, Error)]
pub enum TokenRejected {
    /// The signature does not verify under the resolved key
    #[error("token rejected by key")]
    Key(#[from] JwkVerifyError),

    /// The payload is not a JSON claims object
    #[error("malformed token payload")]
    MalformedPayload(#[source] Box<dyn StdError + Send + Sync + 'static>),

    /// The claims are not acceptable
    #[error("token rejected by claims validator")]
    Claims(#[from] ClaimsRejected),
}

impl From<SignatureMismatch> for TokenRejected {
    fn from(err: SignatureMismatch) -> Self {
        Self::Key(err.into())
    }
}

impl From<IncompatibleAlgorithm> for TokenRejected {
    fn from(err: IncompatibleAlgorithm) -> Self {
        Self::Key(err.into())
    }
}

pub(crate) fn malformed_jwt_payload(
    source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
) -> TokenRejected {
    TokenRejected::MalformedPayload(source.into())
}

/// An error obtaining the key-set document from its publisher
#[derive(Clone, Debug, Error)]
pub enum FetchError {
    /// The request could not be built or sent
    #[error("unable to request key set")]
    Request(#[source] Arc<dyn StdError + Send + Sync + 'static>),

    /// The publisher answered with a status other than success
    #[error("key set request returned unexpected status {status}")]
    UnexpectedStatus {
        /// The HTTP status code returned
        status: u16,
    },

    /// The response body could not be read
    #[error("unable to read key set response")]
    Body(#[source] Arc<dyn StdError + Send + Sync + 'static>),

    /// The publisher did not answer within the fetch timeout
    #[error("key set request timed out after {timeout:?}")]
    TimedOut {
        /// The timeout that elapsed
        timeout: Duration,
    },
}

pub(crate) fn request_failed(
    source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
) -> FetchError {
    FetchError::Request(Arc::from(source.into()))
}

pub(crate) fn body_unreadable(
    source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
) -> FetchError {
    FetchError::Body(Arc::from(source.into()))
}

/// An error resolving a key identifier to a verification key
///
/// Cloneable so that the outcome of one failed refresh can be handed to
/// every caller that was waiting on it.
#[derive(Clone, Debug, Error)]
pub enum ResolveError {
    /// The caller supplied an unusable key identifier
    #[error("invalid key identifier: {reason}")]
    InvalidArgument {
        /// What was wrong with the identifier
        reason: &'static str,
    },

    /// The key set could not be fetched
    #[error("failed to fetch key set")]
    FetchFailed(#[from] FetchError),

    /// The key set document could not be parsed
    #[error("failed to decode key set")]
    DecodeFailed(#[source] Arc<serde_json::Error>),

    /// The key set was loaded but has no key with this identifier
    #[error("no key found with kid '{kid}'")]
    KeyNotFound {
        /// The requested key identifier
        kid: KeyId,
    },

    /// The key set was fetched but none of its records were usable
    #[error("key set contained no usable keys ({} skipped)", .skipped.total())]
    NoUsableKeys {
        /// Why records were skipped
        skipped: SkipCounts,
    },

    /// The caller cancelled the resolution
    #[error("key resolution cancelled")]
    Cancelled,
}

impl ResolveError {
    /// Whether the key set was available but yielded no matching key
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. } | Self::NoUsableKeys { .. })
    }

    /// Whether the key set could not be fetched or decoded
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::FetchFailed(_) | Self::DecodeFailed(_))
    }
}

/// An error occurring while verifying a credential
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The token could not be broken down into its parts
    #[error(transparent)]
    Malformed(#[from] MalformedJwt),

    /// The token header declares an algorithm outside the accepted family
    #[error("token algorithm '{alg}' is not accepted")]
    InvalidAlgorithm {
        /// The algorithm named in the token header
        alg: String,
    },

    /// The token header names no key identifier
    #[error("token header has no kid")]
    MissingKeyId,

    /// The verification key could not be resolved
    #[error("unable to resolve verification key '{kid}'")]
    KeyUnavailable {
        /// The key identifier named by the token
        kid: KeyId,
        /// Why the key could not be resolved
        #[source]
        source: ResolveError,
    },

    /// The signature or claims did not pass verification
    #[error("invalid token")]
    InvalidToken(#[from] TokenRejected),
}

impl VerifyError {
    /// Whether the token was rejected for its declared algorithm
    #[must_use]
    pub fn is_invalid_algorithm(&self) -> bool {
        matches!(self, Self::InvalidAlgorithm { .. })
    }

    /// The resolution failure, if the verification key could not be resolved
    #[must_use]
    pub fn resolve_error(&self) -> Option<&ResolveError> {
        match self {
            Self::KeyUnavailable { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Whether the token failed signature or claims verification
    #[must_use]
    pub fn is_invalid_token(&self) -> bool {
        matches!(self, Self::InvalidToken(_))
    }
}
