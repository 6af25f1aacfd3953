use tracing::debug;

use crate::errors::HashError;

pub const BCRYPT_MAX_INPUT_BYTES: usize = 72;

const SCHEME_BCRYPT: &str = "bcrypt";

/// Produces hashes of the form `bcrypt$<bcrypt encoding>`. Input past
/// bcrypt's 72-byte limit is ignored.
#[derive(Clone)]
pub struct PasswordHasher {
    cost: u32,
    pepper: Vec<u8>,
}

impl std::fmt::Debug for PasswordHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordHasher")
            .field("cost", &self.cost)
            .field("peppered", &!self.pepper.is_empty())
            .finish()
    }
}

impl PasswordHasher {
    pub fn new(cost: u32, pepper: &str) -> Self {
        Self {
            cost,
            pepper: pepper.as_bytes().to_vec(),
        }
    }

    fn normalize(&self, plaintext: &str) -> Vec<u8> {
        let mut input = Vec::with_capacity(plaintext.len() + self.pepper.len());
        input.extend_from_slice(plaintext.as_bytes());
        input.extend_from_slice(&self.pepper);
        input.truncate(BCRYPT_MAX_INPUT_BYTES);
        input
    }

    pub fn hash(&self, plaintext: &str) -> Result<String, HashError> {
        let digest = bcrypt::hash(self.normalize(plaintext), self.cost)?;
        Ok(format!("{}${}", SCHEME_BCRYPT, digest))
    }

    pub fn verify(&self, plaintext: &str, stored: &str) -> Result<bool, HashError> {
        let (scheme, digest) = stored.split_once('$').ok_or(HashError::UnknownScheme)?;

        match scheme {
            SCHEME_BCRYPT => match bcrypt::verify(self.normalize(plaintext), digest) {
                Ok(matches) => Ok(matches),
                Err(e) => {
                    debug!("Stored bcrypt digest could not be parsed: {}", e);
                    Ok(false)
                }
            },
            _ => Err(HashError::UnknownScheme),
        }
    }
}
