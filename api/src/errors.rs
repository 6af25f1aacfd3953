use thiserror::Error;

/// Identity, credential and abuse failures.
///
/// Messages are safe to show to callers: none of them echo a password, token,
/// signing secret or API key, and `InvalidCredentials` is the same whether the
/// username exists or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Too many login attempts, try later")]
    TooManyAttempts,

    #[error("Could not validate credentials")]
    Unauthenticated,

    #[error("Insufficient privileges")]
    Forbidden,

    #[error("Invalid or unknown sensor key")]
    UnknownSensorKey,

    #[error("Invalid token signature")]
    InvalidToken,

    #[error("Token has expired")]
    ExpiredToken,

    #[error("Malformed token")]
    MalformedToken,

    #[error("Incorrect current password")]
    IncorrectPassword,
}

/// Invariant violations on series and measurement writes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Value {value} out of range [{min}, {max}] for series '{series}'")]
    OutOfRange {
        value: f64,
        min: f64,
        max: f64,
        series: String,
    },

    #[error("min_value ({min}) must be <= max_value ({max})")]
    InvalidRange { min: f64, max: f64 },

    #[error("{entity} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("{0}")]
    Invalid(String),
}

impl ValidationError {
    pub fn series_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: "Series",
            id,
        }
    }

    pub fn measurement_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: "Measurement",
            id,
        }
    }
}

#[derive(Debug, Error)]
pub enum HashError {
    #[error("Unknown password hash scheme")]
    UnknownScheme,

    #[error("bcrypt error: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Password hashing error: {0}")]
    Hash(#[from] HashError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
