use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::JwtConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub name: String,
    pub role: String,
    /// Auth-session id; revocation is checked against the session row.
    pub sid: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issue an access token for a user/session pair. Returns `(jwt, expires_at_ms)`.
pub fn issue_token(
    cfg: &JwtConfig,
    user_id: &str,
    username: &str,
    role: &str,
    session_id: &str,
) -> anyhow::Result<(String, i64)> {
    let now = chrono::Utc::now();
    let expires_at = now + chrono::Duration::seconds(i64::try_from(cfg.expires_in_secs)?);
    let claims = Claims {
        sub: user_id.to_owned(),
        name: username.to_owned(),
        role: role.to_owned(),
        sid: session_id.to_owned(),
        iat: now.timestamp(),
        exp: expires_at.timestamp(),
    };
    let jwt = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )?;
    Ok((jwt, expires_at.timestamp_millis()))
}

pub fn verify_token(secret: &str, token: &str) -> anyhow::Result<Claims> {
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}

/// Generate a refresh token. Returns `(raw_token, sha256_hash)`; only the
/// hash is stored.
pub fn generate_refresh_token() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let raw = format!("oh_r_{}", hex::encode(bytes));
    let hash = hash_token(&raw);
    (raw, hash)
}

/// SHA-256 of a token string, lowercase hex.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
