use keyward_clock::{Clock, System};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::KeyCache,
    config::APPLE_ISSUER,
    error::{ClaimsRejected, TokenRejected, VerifyError},
    jwa,
    jwt::{CoreValidator, Issuer, JwtRef, Subject, Validated},
    source::KeySource,
};

/// Verifies signed credentials against the keys held by a [`KeyCache`]
///
/// The algorithm a token declares is checked against the accepted key types
/// and approved algorithms before any key is looked up, so a token naming a
/// symmetric algorithm (or `none`) never reaches the cache.
#[derive(Debug)]
pub struct CredentialVerifier<S, C = System> {
    cache: KeyCache<S, C>,
    validator: CoreValidator,
}

impl<S, C> CredentialVerifier<S, C>
where
    S: KeySource,
    C: Clock + Send + Sync,
{
    /// Constructs a verifier that checks claims with `validator`
    pub fn new(cache: KeyCache<S, C>, validator: CoreValidator) -> Self {
        Self { cache, validator }
    }

    /// Constructs a verifier for Apple identity tokens
    ///
    /// Tokens must be signed with `RS256` and issued by Apple.
    pub fn apple(cache: KeyCache<S, C>) -> Self {
        let validator = CoreValidator::default()
            .add_approved_algorithm(jwa::Algorithm::RS256)
            .require_issuer(Issuer::from_static(APPLE_ISSUER));

        Self::new(cache, validator)
    }

    /// The cache keys are resolved from
    pub fn cache(&self) -> &KeyCache<S, C> {
        &self.cache
    }

    /// The validator claims are checked with
    pub fn validator(&self) -> &CoreValidator {
        &self.validator
    }

    /// Verifies `token` and returns its subject
    ///
    /// # Errors
    ///
    /// * `Malformed` if the token cannot be broken into its parts
    /// * `InvalidAlgorithm` if the declared algorithm is not accepted
    /// * `MissingKeyId` if the header names no key
    /// * `KeyUnavailable` if the key cannot be resolved
    /// * `InvalidToken` if the signature or claims do not verify, or there is
    ///   no subject
    pub async fn verify_credential(&self, token: &JwtRef) -> Result<Subject, VerifyError> {
        self.verify_credential_with_cancellation(token, &CancellationToken::new())
            .await
    }

    /// Verifies `token` and returns its subject, giving up if `cancel` fires
    ///
    /// # Errors
    ///
    /// As [`verify_credential()`][Self::verify_credential]. Cancellation is
    /// reported as `KeyUnavailable`.
    pub async fn verify_credential_with_cancellation(
        &self,
        token: &JwtRef,
        cancel: &CancellationToken,
    ) -> Result<Subject, VerifyError> {
        let (_, claims) = self
            .verify_token_with_cancellation(token, cancel)
            .await?
            .extract();

        claims.sub().map(ToOwned::to_owned).ok_or_else(|| {
            TokenRejected::from(ClaimsRejected::MissingRequiredClaim("sub")).into()
        })
    }

    /// Verifies `token` and returns its validated headers and claims
    ///
    /// # Errors
    ///
    /// As [`verify_credential()`][Self::verify_credential], except that a
    /// token without a subject is accepted.
    pub async fn verify_token_with_cancellation(
        &self,
        token: &JwtRef,
        cancel: &CancellationToken,
    ) -> Result<Validated, VerifyError> {
        let decomposed = token.decompose()?;
        let header = decomposed.untrusted_header();

        let alg = match header.algorithm() {
            Ok(alg) if self.cache.accepts(alg.key_type()) && self.validator.is_approved(alg) => alg,
            _ => {
                tracing::debug!(jwt.alg = header.alg(), "token algorithm not accepted");
                return Err(VerifyError::InvalidAlgorithm {
                    alg: header.alg().to_owned(),
                });
            }
        };

        let kid = header
            .kid()
            .filter(|kid| !kid.as_str().is_empty())
            .ok_or(VerifyError::MissingKeyId)?;

        let key = self
            .cache
            .resolve_with_cancellation(kid, cancel)
            .await
            .map_err(|source| VerifyError::KeyUnavailable {
                kid: kid.to_owned(),
                source,
            })?;

        let validated =
            decomposed.verify_with_clock(&key, alg, &self.validator, self.cache.clock())?;

        Ok(validated)
    }
}
