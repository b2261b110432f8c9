//! Signing keys and import tokens.
//!
//! The two-phase import flow hands the client a signed token between
//! `begin` and `end`. Signing is abstracted behind [`KeyProvider`]:
//! `provide` yields the current `(kid, key)` pair for signing and
//! `keychain` the verification set for inbound tokens, so rotating keys
//! is a matter of swapping the provider.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode,
};
use serde::{Deserialize, Serialize};

use crate::errors::KnitError;

/// Claims of an import token. The subject is the volume ref the client
/// is expected to fill; run and knit ids tie the token back to the
/// pseudo run created at `begin`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataImportClaim {
    /// Token id (nonce).
    pub jti: String,
    /// The volume ref of the import target.
    pub sub: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    pub run_id: String,
    pub knit_id: String,
}

impl DataImportClaim {
    pub fn new(run_id: String, knit_id: String, volume_ref: String, ttl: Duration) -> Self {
        Self {
            jti: uuid::Uuid::new_v4().to_string(),
            sub: volume_ref,
            exp: (Utc::now() + ttl).timestamp(),
            run_id,
            knit_id,
        }
    }
}

/// A signing key with its keychain id.
#[derive(Clone)]
pub struct SigningKey {
    pub kid: String,
    pub alg: Algorithm,
    key: EncodingKey,
}

impl SigningKey {
    pub fn hs256(kid: impl Into<String>, secret: &[u8]) -> Self {
        Self {
            kid: kid.into(),
            alg: Algorithm::HS256,
            key: EncodingKey::from_secret(secret),
        }
    }

    /// Sign the claim; `kid` and `alg` go into the token header.
    pub fn sign(&self, claim: &DataImportClaim) -> Result<String, KnitError> {
        let mut header = Header::new(self.alg);
        header.kid = Some(self.kid.clone());
        encode(&header, claim, &self.key)
            .map_err(|e| KnitError::internal(format!("cannot sign import token: {e}")))
    }
}

/// Verification keys, looked up by `kid`.
#[derive(Clone, Default)]
pub struct Keychain {
    keys: HashMap<String, (Algorithm, DecodingKey)>,
}

impl Keychain {
    pub fn with_hs256(mut self, kid: impl Into<String>, secret: &[u8]) -> Self {
        self.keys.insert(
            kid.into(),
            (Algorithm::HS256, DecodingKey::from_secret(secret)),
        );
        self
    }

    /// Verify a token against the key its header names. Every failure
    /// (unknown kid, bad signature, expired, malformed) is
    /// `Unauthorized`.
    pub fn verify(&self, token: &str) -> Result<DataImportClaim, KnitError> {
        let header = decode_header(token)
            .map_err(|e| KnitError::unauthorized(format!("malformed token: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| KnitError::unauthorized("token has no kid"))?;
        let (alg, key) = self
            .keys
            .get(&kid)
            .ok_or_else(|| KnitError::unauthorized(format!("unknown key {kid}")))?;
        let mut validation = Validation::new(*alg);
        validation.required_spec_claims.insert("sub".to_string());
        let data = decode::<DataImportClaim>(token, key, &validation)
            .map_err(|e| KnitError::unauthorized(format!("token rejected: {e}")))?;
        Ok(data.claims)
    }
}

/// Capability producing signing keys and the verification keychain.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn provide(&self) -> Result<SigningKey, KnitError>;
    async fn keychain(&self) -> Result<Keychain, KnitError>;
}

/// A provider over one static HS256 secret. Rotation swaps the provider
/// (or its secret) wholesale.
pub struct HmacKeyProvider {
    kid: String,
    secret: Vec<u8>,
}

impl HmacKeyProvider {
    pub fn new(kid: impl Into<String>, secret: Vec<u8>) -> Self {
        Self {
            kid: kid.into(),
            secret,
        }
    }
}

#[async_trait]
impl KeyProvider for HmacKeyProvider {
    async fn provide(&self) -> Result<SigningKey, KnitError> {
        Ok(SigningKey::hs256(self.kid.clone(), &self.secret))
    }

    async fn keychain(&self) -> Result<Keychain, KnitError> {
        Ok(Keychain::default().with_hs256(self.kid.clone(), &self.secret))
    }
}
