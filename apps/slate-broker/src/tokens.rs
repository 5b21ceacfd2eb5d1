use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    DeviceAccess,
    DeviceRefresh,
    InstanceAccess,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token signature invalid")]
    BadSignature,
    #[error("token malformed: {0}")]
    Malformed(String),
    #[error("token kind mismatch")]
    WrongKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub kind: TokenKind,
    pub exp: i64,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub jti: Option<String>,
    pub expires_in: u64,
}

/// Issues and verifies the broker's credentials.
///
/// Device access and instance access tokens are stateless: a valid signature
/// and a matching kind are all that is checked here. Device refresh tokens
/// additionally carry a `jti` that the state layer compares against the
/// device's stored session identifier - overwriting that identifier is the
/// revocation mechanism.
#[derive(Clone)]
pub struct TokenAuthority {
    enc: EncodingKey,
    dec: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenAuthority {
    pub fn from_config(config: &AppConfig) -> Self {
        let secret = config.token_secret.clone().unwrap_or_else(|| {
            // Ephemeral secret for dev/test; 32 random bytes hex-encoded.
            use rand::RngCore;
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            hex::encode(bytes)
        });
        Self {
            enc: EncodingKey::from_secret(secret.as_bytes()),
            dec: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl: Duration::seconds(config.access_token_ttl_secs as i64),
            refresh_ttl: Duration::seconds(config.refresh_token_ttl_secs as i64),
        }
    }

    pub fn issue(&self, subject: &str, kind: TokenKind) -> IssuedToken {
        let ttl = self.ttl(kind);
        let now = Utc::now();
        let jti = match kind {
            TokenKind::DeviceRefresh => Some(new_jti()),
            _ => None,
        };
        let claims = Claims {
            sub: subject.to_string(),
            kind,
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
            jti: jti.clone(),
        };
        let header = Header::new(Algorithm::HS256);
        let token = encode(&header, &claims, &self.enc).expect("sign token");
        IssuedToken {
            token,
            jti,
            expires_in: ttl.num_seconds() as u64,
        }
    }

    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<Claims, TokenError> {
        if token.trim().is_empty() {
            return Err(TokenError::Malformed("empty token".into()));
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let data = decode::<Claims>(token, &self.dec, &validation).map_err(map_jwt_error)?;
        if data.claims.kind != expected {
            return Err(TokenError::WrongKind);
        }
        Ok(data.claims)
    }

    fn ttl(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::DeviceRefresh => self.refresh_ttl,
            // Instance tokens live as long as refresh tokens; the instance
            // record itself is the revocation boundary.
            TokenKind::InstanceAccess => self.refresh_ttl,
            TokenKind::DeviceAccess => self.access_ttl,
        }
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> TokenError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::InvalidSignature => TokenError::BadSignature,
        _ => TokenError::Malformed(err.to_string()),
    }
}

fn new_jti() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
