//! JSON Web Tokens signed by a published key
//!
//! Tokens are handled in two steps. [`JwtRef::decompose`] splits a token and
//! decodes its header without trusting anything in it, so that the caller can
//! decide which key and algorithm apply. [`Decomposed::verify_with_clock`]
//! then checks the signature and validates the claims against a
//! [`CoreValidator`].

use std::{convert::TryFrom, fmt, time::Duration};

use aliri_braid::braid;
use keyward_clock::{Clock, UnixTime};
use serde::{Deserialize, Serialize};

use crate::{
    base64url, error, jwa,
    jwk::{self, Jwk},
};

/// An audience
#[braid(serde, ref_doc = "A borrowed reference to an [`Audience`]")]
pub struct Audience;

/// An issuer of JWTs
#[braid(serde, ref_doc = "A borrowed reference to an [`Issuer`]")]
pub struct Issuer;

/// The subject of a JWT
#[braid(serde, ref_doc = "A borrowed reference to a [`Subject`]")]
pub struct Subject;

/// A JSON Web Token
///
/// Formatting does not reveal the token unless the alternate form (`{:#}`)
/// is requested, in which case the signature is still elided.
#[braid(
    serde,
    debug = "owned",
    display = "owned",
    ord = "omit",
    ref_doc = "A borrowed reference to a JSON Web Token ([`Jwt`])"
)]
#[must_use]
pub struct Jwt;

impl fmt::Debug for JwtRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            write!(f, "\"{}\"", Redacted(self.as_str()))
        } else {
            f.write_str("***JWT***")
        }
    }
}

impl fmt::Display for JwtRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            fmt::Display::fmt(&Redacted(self.as_str()), f)
        } else {
            f.write_str("***JWT***")
        }
    }
}

struct Redacted<'a>(&'a str);

impl fmt::Display for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0.rfind('.') {
            Some(idx) => {
                f.write_str(&self.0[..=idx])?;
                f.write_str("…")
            }
            None => f.write_str("…"),
        }
    }
}

/// The minimal header of a signed JWT
///
/// The algorithm is kept as written so that an unknown or unapproved
/// algorithm can be reported as such rather than as a malformed header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[must_use]
pub struct BasicHeaders {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kid: Option<jwk::KeyId>,
}

impl BasicHeaders {
    /// The algorithm named in the header, as written
    #[must_use]
    pub fn alg(&self) -> &str {
        &self.alg
    }

    /// The named algorithm, if it is one this crate can verify
    pub fn algorithm(&self) -> Result<jwa::Algorithm, error::UnknownAlgorithm> {
        jwa::Algorithm::try_from(self.alg.as_str())
    }

    /// The key ID named in the header
    #[must_use]
    pub fn kid(&self) -> Option<&jwk::KeyIdRef> {
        self.kid.as_deref()
    }
}

/// Common claims used in JWTs
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[must_use]
pub struct BasicClaims {
    #[serde(default, skip_serializing_if = "Audiences::is_empty")]
    aud: Audiences,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iss: Option<Issuer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub: Option<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<UnixTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nbf: Option<UnixTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<UnixTime>,
}

impl BasicClaims {
    /// Constructs an empty set of claims
    pub fn new() -> Self {
        Self::default()
    }

    /// The audiences the token is intended for
    pub fn aud(&self) -> &Audiences {
        &self.aud
    }

    /// The issuer of the token
    #[must_use]
    pub fn iss(&self) -> Option<&IssuerRef> {
        self.iss.as_deref()
    }

    /// The subject of the token
    #[must_use]
    pub fn sub(&self) -> Option<&SubjectRef> {
        self.sub.as_deref()
    }

    /// When the token expires
    #[must_use]
    pub fn exp(&self) -> Option<UnixTime> {
        self.exp
    }

    /// When the token becomes valid
    #[must_use]
    pub fn nbf(&self) -> Option<UnixTime> {
        self.nbf
    }

    /// When the token was issued
    #[must_use]
    pub fn iat(&self) -> Option<UnixTime> {
        self.iat
    }

    /// Sets the `aud` claim to a single audience
    pub fn with_audience(mut self, aud: impl Into<Audience>) -> Self {
        self.aud = Audiences::single(aud);
        self
    }

    /// Sets the `aud` claim
    pub fn with_audiences(mut self, aud: impl Into<Audiences>) -> Self {
        self.aud = aud.into();
        self
    }

    /// Sets the `iss` claim
    pub fn with_issuer(mut self, iss: impl Into<Issuer>) -> Self {
        self.iss = Some(iss.into());
        self
    }

    /// Sets the `sub` claim
    pub fn with_subject(mut self, sub: impl Into<Subject>) -> Self {
        self.sub = Some(sub.into());
        self
    }

    /// Sets the `exp` claim
    pub fn with_expiration(mut self, time: UnixTime) -> Self {
        self.exp = Some(time);
        self
    }

    /// Sets the `nbf` claim
    pub fn with_not_before(mut self, time: UnixTime) -> Self {
        self.nbf = Some(time);
        self
    }

    /// Sets the `iat` claim
    pub fn with_issued_at(mut self, time: UnixTime) -> Self {
        self.iat = Some(time);
        self
    }
}

/// A set of zero or more [`Audience`]s
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "OneOrMany<Audience>", into = "OneOrMany<Audience>")]
#[must_use]
pub struct Audiences(Vec<Audience>);

impl Audiences {
    /// An empty audience set
    #[inline]
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// An audience set with a single audience
    #[inline]
    pub fn single(aud: impl Into<Audience>) -> Self {
        Self(vec![aud.into()])
    }

    /// Indicates whether the audience set is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates through references to the audiences in the set
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &AudienceRef> {
        self.0.iter().map(AsRef::as_ref)
    }
}

impl From<OneOrMany<Audience>> for Audiences {
    #[inline]
    fn from(vals: OneOrMany<Audience>) -> Self {
        match vals {
            OneOrMany::One(x) => Self(vec![x]),
            OneOrMany::Many(v) => Self(v),
        }
    }
}

impl From<Audiences> for OneOrMany<Audience> {
    #[inline]
    fn from(auds: Audiences) -> Self {
        let mut auds = auds.0;
        match auds.pop() {
            Some(only) if auds.is_empty() => Self::One(only),
            Some(last) => {
                auds.push(last);
                Self::Many(auds)
            }
            None => Self::Many(auds),
        }
    }
}

impl From<Vec<Audience>> for Audiences {
    #[inline]
    fn from(vals: Vec<Audience>) -> Self {
        Self(vals)
    }
}

impl From<Audience> for Audiences {
    #[inline]
    fn from(aud: Audience) -> Self {
        Self::single(aud)
    }
}

/// A type representing one or more items, primarily for serialization
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// A single item
    One(T),

    /// Zero or more items, to be serialized/deserialized as an array
    Many(Vec<T>),
}

/// The validated headers and claims of a JWT
///
/// Only produced within this crate, after the signature and claims have
/// been checked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validated {
    headers: BasicHeaders,
    claims: BasicClaims,
}

impl Validated {
    /// Extracts the header and claims from the token
    pub fn extract(self) -> (BasicHeaders, BasicClaims) {
        (self.headers, self.claims)
    }

    /// The validated token headers
    pub fn headers(&self) -> &BasicHeaders {
        &self.headers
    }

    /// The validated token claims
    pub fn claims(&self) -> &BasicClaims {
        &self.claims
    }
}

/// A JWT split into its parts, with its header decoded but not trusted
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub struct Decomposed<'a> {
    header: BasicHeaders,
    message: &'a str,
    payload: &'a str,
    signature: Vec<u8>,
}

impl<'a> Decomposed<'a> {
    /// The untrusted header of the JWT
    ///
    /// **WARNING:** *Nothing in the header has been verified.* It may only be
    /// used to decide how the token should be verified.
    pub fn untrusted_header(&self) -> &BasicHeaders {
        &self.header
    }

    /// The encoded header and payload, separated by a `.`
    #[must_use]
    pub fn untrusted_message(&self) -> &'a str {
        self.message
    }

    /// The raw signature of the JWT
    #[must_use]
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Verifies the signature with `key` under `alg`, then validates the claims
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot verify `alg`, the signature does
    /// not match, the payload is not a claims object, or the claims are
    /// rejected by `validator` at the time given by `clock`.
    pub fn verify_with_clock<C: Clock>(
        self,
        key: &Jwk,
        alg: jwa::Algorithm,
        validator: &CoreValidator,
        clock: &C,
    ) -> Result<Validated, error::TokenRejected> {
        key.verify(alg, self.message.as_bytes(), &self.signature)?;

        let p_raw = base64url::decode(self.payload).map_err(error::malformed_jwt_payload)?;
        let claims: BasicClaims =
            serde_json::from_slice(&p_raw).map_err(error::malformed_jwt_payload)?;

        validator.validate_with_clock(&claims, clock)?;

        Ok(Validated {
            headers: self.header,
            claims,
        })
    }
}

impl JwtRef {
    /// Decomposes the JWT into its parts, preparing it for later processing
    ///
    /// # Errors
    ///
    /// Returns an error if the token does not have three sections, or if the
    /// header or signature cannot be decoded.
    pub fn decompose(&self) -> Result<Decomposed<'_>, error::MalformedJwt> {
        let mut parts = self.as_str().splitn(3, '.');
        let (h_str, payload, s_str) = match (parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(p), Some(s)) if !s.contains('.') => (h, p, s),
            _ => return Err(error::MalformedJwt::Structure),
        };

        let message = &self.as_str()[..h_str.len() + 1 + payload.len()];

        let h_raw = base64url::decode(h_str).map_err(error::malformed_jwt_header)?;
        let header: BasicHeaders =
            serde_json::from_slice(&h_raw).map_err(error::malformed_jwt_header)?;
        let signature = base64url::decode(s_str).map_err(error::malformed_jwt_signature)?;

        Ok(Decomposed {
            header,
            message,
            payload,
            signature,
        })
    }
}

/// A core validator for JWTs
///
/// Expiration is always required. A `nbf` claim is honored when present.
/// Audience and issuer are only checked when configured.
#[derive(Clone, Debug, Default)]
#[must_use]
pub struct CoreValidator {
    approved_algorithms: Vec<jwa::Algorithm>,
    leeway: Duration,
    allowed_audiences: Vec<Audience>,
    issuer: Option<Issuer>,
}

impl CoreValidator {
    /// Allows a grace period for token validation
    ///
    /// Applies on either side of the "not before" and "expires" claims.
    #[inline]
    pub fn with_leeway(self, leeway: Duration) -> Self {
        Self { leeway, ..self }
    }

    /// Allows a grace period (in seconds) for token validation
    #[inline]
    pub fn with_leeway_secs(self, leeway: u64) -> Self {
        self.with_leeway(Duration::from_secs(leeway))
    }

    /// Adds a single audience to the set of allowed audiences
    #[inline]
    pub fn add_allowed_audience(mut self, audience: Audience) -> Self {
        self.allowed_audiences.push(audience);
        self
    }

    /// Adds multiple audiences to the set of allowed audiences
    #[inline]
    pub fn extend_allowed_audiences<I: IntoIterator<Item = Audience>>(mut self, auds: I) -> Self {
        self.allowed_audiences.extend(auds);
        self
    }

    /// Approves a single algorithm
    ///
    /// While no algorithm is approved, any algorithm the key accepts is allowed.
    #[inline]
    pub fn add_approved_algorithm(mut self, alg: jwa::Algorithm) -> Self {
        self.approved_algorithms.push(alg);
        self
    }

    /// Approves multiple algorithms
    #[inline]
    pub fn extend_approved_algorithms<I: IntoIterator<Item = jwa::Algorithm>>(
        mut self,
        algs: I,
    ) -> Self {
        self.approved_algorithms.extend(algs);
        self
    }

    /// Require that tokens specify a particular issuer
    #[inline]
    pub fn require_issuer(self, issuer: Issuer) -> Self {
        Self {
            issuer: Some(issuer),
            ..self
        }
    }

    /// Whether `alg` is approved by this validator
    #[must_use]
    pub fn is_approved(&self, alg: jwa::Algorithm) -> bool {
        self.approved_algorithms.is_empty() || self.approved_algorithms.contains(&alg)
    }

    /// The required issuer, if any
    #[must_use]
    pub fn issuer(&self) -> Option<&IssuerRef> {
        self.issuer.as_deref()
    }

    /// Validates the claims of a token as of the time given by `clock`
    ///
    /// # Errors
    ///
    /// Returns the first claim found to be missing or unacceptable.
    pub fn validate_with_clock<C: Clock>(
        &self,
        claims: &BasicClaims,
        clock: &C,
    ) -> Result<(), error::ClaimsRejected> {
        let now = clock.now();
        let leeway = self.leeway.as_secs();

        match claims.exp() {
            Some(exp) if exp.0 < now.0.saturating_sub(leeway) => {
                return Err(error::ClaimsRejected::TokenExpired)
            }
            Some(_) => {}
            None => return Err(error::ClaimsRejected::MissingRequiredClaim("exp")),
        }

        if let Some(nbf) = claims.nbf() {
            if nbf.0 > now.0.saturating_add(leeway) {
                return Err(error::ClaimsRejected::TokenNotYetValid);
            }
        }

        if !self.allowed_audiences.is_empty() {
            if claims.aud().is_empty() {
                return Err(error::ClaimsRejected::MissingRequiredClaim("aud"));
            }

            let found = claims
                .aud()
                .iter()
                .any(|a| self.allowed_audiences.iter().any(|e| a == e));
            if !found {
                return Err(error::ClaimsRejected::InvalidAudience);
            }
        }

        if let Some(allowed_iss) = &self.issuer {
            match claims.iss() {
                Some(iss) if iss == allowed_iss => {}
                Some(_) => return Err(error::ClaimsRejected::InvalidIssuer),
                None => return Err(error::ClaimsRejected::MissingRequiredClaim("iss")),
            }
        }

        Ok(())
    }
}
