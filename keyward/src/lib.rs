//! A cache of remotely published JSON Web Keys, and a verifier for the
//! credentials they sign.
//!
//! Identity providers such as Sign in with Apple publish their signing keys as
//! a JSON Web Key Set ([RFC7517][]). A [`KeyCache`] fetches that set, keeps
//! the usable signing keys for a fixed time-to-live, and refreshes it on
//! demand. However many callers find the set stale at once, only one fetch is
//! made on their behalf.
//!
//! A [`CredentialVerifier`] checks a compact JWT ([RFC7519][]) against the
//! cached keys and returns the subject it was issued for.
//!
//! [RFC7517]: https://tools.ietf.org/html/rfc7517
//! [RFC7519]: https://tools.ietf.org/html/rfc7519
//!
//! # Example
//!
//! ```no_run
//! use keyward::{CredentialVerifier, JwtRef, KeyCache};
//!
//! # async fn sign_in(token: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let cache = KeyCache::apple()?;
//! let verifier = CredentialVerifier::apple(cache);
//!
//! let subject = verifier.verify_credential(JwtRef::from_str(token)).await?;
//! println!("signed in as {}", subject);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod error;
pub mod jwa;
pub mod jwk;
mod jwks;
pub mod jwt;

mod base64url;
mod cache;
mod config;
mod source;
mod verifier;


#[doc(inline)]
pub use cache::{KeyCache, RefreshReport};
#[doc(inline)]
pub use config::{
    KeyCacheConfig, APPLE_ISSUER, APPLE_KEYS_URL, DEFAULT_FETCH_TIMEOUT, DEFAULT_TTL,
};
#[doc(inline)]
pub use jwk::Jwk;
#[doc(inline)]
pub use jwks::{Extraction, KeySet, SkipCounts};
#[doc(inline)]
pub use jwt::{Jwt, JwtRef};
#[cfg(feature = "reqwest")]
#[doc(inline)]
pub use source::HttpKeySource;
#[doc(inline)]
pub use source::KeySource;
#[doc(inline)]
pub use verifier::CredentialVerifier;

pub use keyward_clock as clock;
