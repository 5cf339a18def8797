//! Bearer-token auth: signing and verification of the edge's JWTs.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub username: String,
    pub exp: usize,
}

/// The authenticated caller, injected into request extensions by the edge
/// middleware.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: i64,
}

#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    expire_hours: i64,
}

impl JwtKeys {
    pub fn new(secret: &str, expire_hours: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            expire_hours,
        }
    }

    pub fn sign(&self, user_id: i64, username: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let exp = (Utc::now() + chrono::Duration::hours(self.expire_hours)).timestamp() as usize;
        let claims = Claims { user_id, username: username.to_string(), exp };
        encode(&Header::default(), &claims, &self.encoding)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid,
            })
    }
}
