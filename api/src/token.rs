use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};

use crate::errors::{AuthError, Error, Result};
use crate::model::Role;

const ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

/// Signs and checks HS256 bearer tokens. Verification never consults the
/// credential store.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("algorithm", &ALGORITHM)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        // Only HS256 is accepted; a header naming anything else fails
        // before the signature is looked at.
        let mut validation = Validation::new(ALGORITHM);
        // Expiry is checked in `verify` with no leeway.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, subject: &str, role: Role) -> Result<String> {
        self.issue_with_ttl(subject, role, self.ttl)
    }

    /// A zero or negative `ttl` yields a token that is already expired.
    pub fn issue_with_ttl(&self, subject: &str, role: Role, ttl: Duration) -> Result<String> {
        let now = Utc::now();
        let expires = now
            .checked_add_signed(ttl)
            .ok_or_else(|| Error::Internal(format!("Token lifetime out of range: {}", ttl)))?;
        let claims = Claims {
            sub: subject.to_string(),
            role,
            iat: now.timestamp(),
            exp: expires.timestamp(),
        };

        encode(&Header::new(ALGORITHM), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("Token signing failed: {}", e)))
    }

    pub fn verify(&self, token: &str) -> std::result::Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(classify)?;

        if Utc::now().timestamp() >= data.claims.exp {
            return Err(AuthError::ExpiredToken);
        }

        Ok(data.claims)
    }
}

fn classify(err: jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => AuthError::InvalidToken,
        ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
        _ => AuthError::MalformedToken,
    }
}
