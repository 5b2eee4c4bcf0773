use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::TokenConfig;

/// Credential service: short-lived access tokens and opaque refresh
/// credentials, one rotation away from each other.
#[derive(Clone)]
pub struct CredentialService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_token_expiry_minutes: i64,
    refresh_advice_window_minutes: i64,
}

/// Claims carried by an access credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (user ID)
    pub sub: String,
    /// Session ID the credential belongs to
    pub sid: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// JWT ID
    pub jti: String,
}

/// Freshly issued access/refresh credential pair.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedCredentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

impl CredentialService {
    pub fn new(config: &TokenConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            access_token_expiry_minutes: config.access_token_expiry_minutes,
            refresh_advice_window_minutes: config.refresh_advice_window_minutes,
        }
    }

    /// Issue an access token bound to a session.
    pub fn issue_access_token(
        &self,
        user_id: &str,
        session_id: Uuid,
    ) -> Result<String, anyhow::Error> {
        let now = Utc::now();
        let exp = now + Duration::minutes(self.access_token_expiry_minutes);

        let claims = AccessClaims {
            sub: user_id.to_string(),
            sid: session_id.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode access token: {}", e))?;

        Ok(token)
    }

    /// Validate and decode an access token.
    pub fn decode_access_token(&self, token: &str) -> Result<AccessClaims, anyhow::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        let token_data = decode::<AccessClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| anyhow::anyhow!("Invalid access token: {}", e))?;

        Ok(token_data.claims)
    }

    /// Mint an opaque refresh credential. Returns `(plaintext, sha256 hex)`;
    /// only the hash is ever stored.
    pub fn mint_refresh_token(&self) -> (String, String) {
        let mut bytes = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        let hash = Self::hash_refresh_token(&token);
        (token, hash)
    }

    /// One-way hash used to index refresh credentials.
    pub fn hash_refresh_token(token: &str) -> String {
        hex::encode(Sha256::digest(token.as_bytes()))
    }

    /// Whether the claims are close enough to expiry to advise a refresh.
    pub fn refresh_advised(&self, claims: &AccessClaims) -> bool {
        let remaining = claims.exp - Utc::now().timestamp();
        remaining < self.refresh_advice_window_minutes * 60
    }

    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }
}
