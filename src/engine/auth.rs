//! Bearer-token issuance for the engine endpoint.
//!
//! The engine accepts requests carrying an HS256 token over a shared
//! 32-byte secret whose `iat` claim sits within a minute of its own clock.
//! The issuer signs lazily and hands out the same token until it ages past
//! half that allowance, so steady-state ticks cost no signing work.

use std::{
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use eyre::{ensure, Result};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// A cached token is re-signed once it is this old, half the peer-side
/// skew allowance.
const TOKEN_MAX_AGE: Duration = Duration::from_secs(30);

/// The engine only checks issuance time against its own clock, so `iat`
/// is the whole claim set.
#[derive(Serialize, Deserialize)]
struct Claims {
    iat: u64,
}

struct IssuedToken {
    token: String,
    issued_at: SystemTime,
}

/// Signs and caches the short-lived bearer tokens engine requests carry.
pub struct EngineAuth {
    key: EncodingKey,
    issued: Mutex<Option<IssuedToken>>,
}

impl EngineAuth {
    /// Builds an issuer from the hex-encoded shared secret, with or
    /// without a `0x` prefix.
    pub fn from_hex(hex: impl AsRef<str>) -> Result<Self> {
        let hex = hex.as_ref().trim();
        let hex = hex
            .strip_prefix("0x")
            .or_else(|| hex.strip_prefix("0X"))
            .unwrap_or(hex);
        let secret = hex::decode(hex)?;
        ensure!(
            secret.len() == 32,
            "engine secret must be 32 bytes, got {}",
            secret.len()
        );
        Ok(Self::from_secret(&secret))
    }

    /// An issuer over a throwaway secret, for nodes configured without
    /// one. Any real engine will refuse tokens signed with it.
    pub fn ephemeral() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::from_secret(&secret)
    }

    fn from_secret(secret: &[u8]) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
            issued: Mutex::new(None),
        }
    }

    /// A bearer token fresh enough for the peer's skew check. Reuses the
    /// cached token when it has one young enough; signs a new one
    /// otherwise.
    pub fn token(&self) -> Result<String> {
        let now = SystemTime::now();
        let mut issued = self.issued.lock().expect("auth lock poisoned");

        if let Some(cached) = issued.as_ref() {
            let fresh = now
                .duration_since(cached.issued_at)
                .map_or(false, |age| age < TOKEN_MAX_AGE);
            if fresh {
                return Ok(cached.token.clone());
            }
        }

        let iat = now
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs();
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &Claims { iat }, &self.key)?;
        *issued = Some(IssuedToken {
            token: token.clone(),
            issued_at: now,
        });
        Ok(token)
    }
}

impl std::fmt::Debug for EngineAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineAuth").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};

    const SECRET: &str = "f79ae5046bc11c9927afe911db7143c51a806c4a537cc08e0d37140b0192f430";

    #[test]
    fn parses_hex_with_and_without_prefix() {
        assert!(EngineAuth::from_hex(SECRET).is_ok());
        assert!(EngineAuth::from_hex(format!("0x{SECRET}")).is_ok());
        assert!(EngineAuth::from_hex(" deadbeef ").is_err());
        assert!(EngineAuth::from_hex("zz").is_err());
    }

    #[test]
    fn token_verifies_against_the_shared_secret() {
        let auth = EngineAuth::from_hex(SECRET).unwrap();
        let token = auth.token().unwrap();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        let key = DecodingKey::from_secret(&hex::decode(SECRET).unwrap());
        let decoded = jsonwebtoken::decode::<Claims>(&token, &key, &validation).unwrap();

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(now.abs_diff(decoded.claims.iat) <= 5);
    }

    #[test]
    fn consecutive_tokens_come_from_the_cache() {
        let auth = EngineAuth::from_hex(SECRET).unwrap();
        assert_eq!(auth.token().unwrap(), auth.token().unwrap());
    }

    #[test]
    fn distinct_issuers_sign_distinct_tokens() {
        let a = EngineAuth::ephemeral().token().unwrap();
        let b = EngineAuth::ephemeral().token().unwrap();
        assert_ne!(a, b);
    }
}
