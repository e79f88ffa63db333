use std::{
    collections::{HashMap, HashSet},
    convert::TryFrom,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    base64url, error,
    jwa::{self, KeyType},
    jwk::{Curve, Jwk, KeyId, PublicKey},
};

/// A JSON Web Key Set (JWKS) as published
///
/// Records are held as raw JSON so that a single malformed record does not
/// fail the whole document. Use [`KeySet::extract`] to obtain usable keys.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeySet {
    keys: Vec<Value>,
}

impl KeySet {
    /// Parses a key-set document
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// The number of records in the document
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the document has no records at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Converts every usable record into a [`Jwk`]
    ///
    /// Records without a `kid`, with a key type outside `accepted`, marked
    /// for encryption, or with unusable key material are skipped and counted.
    /// When two records share a `kid`, the later one wins.
    pub fn extract(&self, accepted: &HashSet<KeyType>) -> Extraction {
        let mut keys = HashMap::with_capacity(self.keys.len());
        let mut skipped = SkipCounts::default();

        for (index, record) in self.keys.iter().enumerate() {
            let kid = match record.get("kid").and_then(Value::as_str) {
                Some(kid) if !kid.is_empty() => KeyId::new(kid.to_owned()),
                _ => {
                    tracing::warn!(jwks.idx = index, "ignoring JWK without a kid");
                    skipped.missing_kid += 1;
                    continue;
                }
            };

            let raw = match RawJwk::deserialize(record) {
                Ok(raw) => raw,
                Err(error) => {
                    tracing::warn!(jwks.idx = index, jwk.kid = %kid, %error, "ignoring malformed JWK");
                    skipped.invalid_material += 1;
                    continue;
                }
            };

            let kty = match raw.kty.as_deref().and_then(KeyType::from_kty) {
                Some(kty) if accepted.contains(&kty) => kty,
                _ => {
                    tracing::debug!(
                        jwks.idx = index,
                        jwk.kid = %kid,
                        jwk.kty = ?raw.kty,
                        "ignoring JWK of unaccepted key type"
                    );
                    skipped.unsupported_type += 1;
                    continue;
                }
            };

            let usage = raw.usage.as_deref().and_then(jwa::Usage::from_use);
            if usage == Some(jwa::Usage::Encryption) {
                tracing::debug!(jwks.idx = index, jwk.kid = %kid, "ignoring encryption JWK");
                skipped.not_for_signing += 1;
                continue;
            }

            match raw.into_jwk(kid.clone(), kty) {
                Ok(jwk) => {
                    let jwk = match usage {
                        Some(usage) => jwk.with_usage(usage),
                        None => jwk,
                    };

                    if keys.insert(kid, Arc::new(jwk)).is_some() {
                        tracing::debug!(jwks.idx = index, "replacing JWK with duplicate kid");
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        jwks.idx = index,
                        jwk.kid = %kid,
                        reason = error.reason(),
                        "ignoring JWK with unusable key material"
                    );
                    skipped.invalid_material += 1;
                }
            }
        }

        Extraction { keys, skipped }
    }
}

/// Tallies of key-set records that were not accepted, by reason
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SkipCounts {
    /// Records with no `kid`
    pub missing_kid: usize,

    /// Records whose `kty` is unknown or not accepted
    pub unsupported_type: usize,

    /// Records published for encryption (`"use": "enc"`)
    pub not_for_signing: usize,

    /// Records whose key material or declared algorithm could not be used
    pub invalid_material: usize,
}

impl SkipCounts {
    /// The total number of skipped records
    #[must_use]
    pub fn total(&self) -> usize {
        self.missing_kid + self.unsupported_type + self.not_for_signing + self.invalid_material
    }
}

/// The usable keys of a key set, along with what was skipped
#[derive(Clone, Debug, Default)]
pub struct Extraction {
    keys: HashMap<KeyId, Arc<Jwk>>,
    skipped: SkipCounts,
}

impl Extraction {
    /// The accepted keys by identifier
    #[must_use]
    pub fn keys(&self) -> &HashMap<KeyId, Arc<Jwk>> {
        &self.keys
    }

    /// Counts of skipped records
    #[must_use]
    pub fn skipped(&self) -> SkipCounts {
        self.skipped
    }

    /// Splits into the accepted keys and the skip counts
    #[must_use]
    pub fn into_parts(self) -> (HashMap<KeyId, Arc<Jwk>>, SkipCounts) {
        (self.keys, self.skipped)
    }
}

#[derive(Deserialize)]
struct RawJwk {
    #[serde(default)]
    kty: Option<String>,
    #[serde(rename = "use", default)]
    usage: Option<String>,
    #[serde(default)]
    alg: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
    #[serde(default)]
    crv: Option<String>,
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Option<String>,
}

impl RawJwk {
    fn into_jwk(self, kid: KeyId, kty: KeyType) -> Result<Jwk, error::KeyRejected> {
        let key = match kty {
            KeyType::Rsa => {
                let n = decode_param(
                    self.n.as_deref(),
                    "missing RSA modulus",
                    "RSA modulus is not base64url",
                )?;
                let e = decode_param(
                    self.e.as_deref(),
                    "missing RSA exponent",
                    "RSA exponent is not base64url",
                )?;
                PublicKey::rsa(n, e)?
            }
            KeyType::EllipticCurve => {
                let curve = self
                    .crv
                    .as_deref()
                    .and_then(Curve::from_crv)
                    .ok_or_else(|| error::key_rejected("unsupported elliptic curve"))?;
                let x = decode_param(
                    self.x.as_deref(),
                    "missing elliptic curve x coordinate",
                    "elliptic curve x coordinate is not base64url",
                )?;
                let y = decode_param(
                    self.y.as_deref(),
                    "missing elliptic curve y coordinate",
                    "elliptic curve y coordinate is not base64url",
                )?;
                PublicKey::elliptic_curve(curve, &x, &y)?
            }
            KeyType::OctetKeyPair => {
                if self.crv.as_deref() != Some("Ed25519") {
                    return Err(error::key_rejected("unsupported octet key pair curve"));
                }
                let x = decode_param(
                    self.x.as_deref(),
                    "missing Ed25519 key",
                    "Ed25519 key is not base64url",
                )?;
                PublicKey::ed25519(x)?
            }
        };

        let jwk = Jwk::new(kid, key);
        match self.alg {
            Some(alg) => {
                let alg = jwa::Algorithm::try_from(alg.as_str())
                    .map_err(|_| error::key_rejected("declared algorithm is not supported"))?;
                jwk.with_algorithm(alg)
                    .map_err(|_| error::key_rejected("declared algorithm does not fit the key"))
            }
            None => Ok(jwk),
        }
    }
}

fn decode_param(
    value: Option<&str>,
    missing: &'static str,
    undecodable: &'static str,
) -> Result<Vec<u8>, error::KeyRejected> {
    let value = value.ok_or_else(|| error::key_rejected(missing))?;
    base64url::decode(value).map_err(|_| error::key_rejected(undecodable))
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::{jwk::KeyIdRef, test};

    fn rsa_only() -> HashSet<KeyType> {
        [KeyType::Rsa].iter().copied().collect()
    }

    #[test]
    fn rejects_documents_without_keys() {
        assert!(KeySet::from_slice(b"{}").is_err());
        assert!(KeySet::from_slice(b"not json").is_err());
        assert!(KeySet::from_slice(br#"{"keys": {}}"#).is_err());
    }

    #[test]
    fn extracts_published_rsa_key() -> Result<()> {
        let set = KeySet::from_slice(&test::key_set(vec![test::rsa_jwk_value()]))?;
        let extraction = set.extract(&rsa_only());

        assert_eq!(extraction.keys().len(), 1);
        assert_eq!(extraction.skipped().total(), 0);

        let jwk = &extraction.keys()[KeyIdRef::from_str(test::RSA_KID)];
        assert_eq!(jwk.algorithm(), Some(jwa::Algorithm::RS256));
        assert_eq!(jwk.usage(), Some(jwa::Usage::Signing));
        Ok(())
    }

    #[test]
    #[traced_test]
    fn skips_each_kind_of_bad_record() -> Result<()> {
        let doc = test::key_set(vec![
            test::rsa_jwk_value(),
            json!({ "kty": "RSA", "n": "AQAB", "e": "AQAB" }),
            json!({ "kid": "", "kty": "RSA" }),
            json!({ "kid": "ec", "kty": "EC", "crv": "P-256", "x": "AA", "y": "AA" }),
            json!({ "kid": "oct", "kty": "oct", "k": "c2VjcmV0" }),
            json!({ "kid": "enc", "kty": "RSA", "use": "enc", "n": "AQAB", "e": "AQAB" }),
            json!({ "kid": "short", "kty": "RSA", "n": "AQAB", "e": "AQAB" }),
            json!({ "kid": "garbled", "kty": "RSA", "n": "!!!", "e": "AQAB" }),
            json!("not an object"),
        ]);

        let extraction = KeySet::from_slice(&doc)?.extract(&rsa_only());

        assert_eq!(extraction.keys().len(), 1);
        assert_eq!(
            extraction.skipped(),
            SkipCounts {
                missing_kid: 3,
                unsupported_type: 2,
                not_for_signing: 1,
                invalid_material: 2,
            }
        );
        assert!(logs_contain("ignoring JWK with unusable key material"));
        assert!(logs_contain("RSA modulus is shorter than 2048 bits"));
        Ok(())
    }

    #[test]
    fn declared_algorithm_must_fit_key() -> Result<()> {
        let mut wrong_alg = test::rsa_jwk_value();
        wrong_alg["alg"] = json!("ES256");
        let mut unknown_alg = test::rsa_jwk_value();
        unknown_alg["kid"] = json!("other");
        unknown_alg["alg"] = json!("RSA-OAEP");

        let extraction =
            KeySet::from_slice(&test::key_set(vec![wrong_alg, unknown_alg]))?.extract(&rsa_only());

        assert!(extraction.keys().is_empty());
        assert_eq!(extraction.skipped().invalid_material, 2);
        Ok(())
    }

    #[test]
    fn later_duplicate_wins() -> Result<()> {
        let first = test::rsa_jwk_value();
        let mut second = test::rsa_jwk_value();
        second["alg"] = json!("PS256");

        let extraction =
            KeySet::from_slice(&test::key_set(vec![first, second]))?.extract(&rsa_only());

        assert_eq!(extraction.keys().len(), 1);
        assert_eq!(
            extraction.keys()[KeyIdRef::from_str(test::RSA_KID)].algorithm(),
            Some(jwa::Algorithm::PS256)
        );
        Ok(())
    }

    #[test]
    fn accepted_types_are_configurable() -> Result<()> {
        let ed = test::ed25519_key_pair();
        let ec = test::p256_key_pair();
        let doc = test::key_set(vec![
            test::rsa_jwk_value(),
            test::ed25519_jwk_value("ed", &ed),
            test::p256_jwk_value("ec", &ec),
            json!({ "kid": "p521", "kty": "EC", "crv": "P-521", "x": "AA", "y": "AA" }),
        ]);
        let set = KeySet::from_slice(&doc)?;

        let all: HashSet<_> = [KeyType::Rsa, KeyType::EllipticCurve, KeyType::OctetKeyPair]
            .iter()
            .copied()
            .collect();
        let extraction = set.extract(&all);
        assert_eq!(extraction.keys().len(), 3);
        assert_eq!(extraction.skipped().invalid_material, 1);
        assert_eq!(
            extraction.keys()[KeyIdRef::from_str("ec")].key().key_type(),
            KeyType::EllipticCurve
        );

        let extraction = set.extract(&rsa_only());
        assert_eq!(extraction.keys().len(), 1);
        assert_eq!(extraction.skipped().unsupported_type, 3);
        Ok(())
    }
}
