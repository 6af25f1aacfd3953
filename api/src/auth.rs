use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::{AuthError, Error, Result, ValidationError};
use crate::metrics::{LOGIN_FAILURE_TOTAL, LOGIN_SUCCESS_TOTAL, PASSWORD_HASH_SECONDS};
use crate::model::{AccessToken, Identity, NewUser, Role, User};
use crate::password::PasswordHasher;
use crate::rate_limit::RateLimiter;
use crate::store::Store;
use crate::token::TokenIssuer;
use crate::validate::validate_name;

/// Verified against when the username is unknown, so a miss costs the same
/// as a wrong password.
const TIMING_DUMMY_PASSWORD: &str = "timing-equalization-placeholder";

pub struct Authenticator {
    store: Arc<dyn Store>,
    hasher: PasswordHasher,
    tokens: TokenIssuer,
    limiter: Arc<dyn RateLimiter>,
    dummy_hash: String,
}

impl Authenticator {
    pub fn new(
        store: Arc<dyn Store>,
        hasher: PasswordHasher,
        tokens: TokenIssuer,
        limiter: Arc<dyn RateLimiter>,
    ) -> Result<Self> {
        let dummy_hash = hasher.hash(TIMING_DUMMY_PASSWORD)?;
        Ok(Self {
            store,
            hasher,
            tokens,
            limiter,
            dummy_hash,
        })
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    async fn hash_password(&self, plaintext: &str) -> Result<String> {
        let hasher = self.hasher.clone();
        let plaintext = plaintext.to_string();
        let _timer = PASSWORD_HASH_SECONDS.start_timer();

        let hashed = tokio::task::spawn_blocking(move || hasher.hash(&plaintext))
            .await
            .map_err(|e| Error::Internal(format!("Password hashing task failed: {}", e)))??;
        Ok(hashed)
    }

    async fn verify_password(&self, plaintext: &str, stored: &str) -> Result<bool> {
        let hasher = self.hasher.clone();
        let plaintext = plaintext.to_string();
        let stored = stored.to_string();
        let _timer = PASSWORD_HASH_SECONDS.start_timer();

        let matches = tokio::task::spawn_blocking(move || hasher.verify(&plaintext, &stored))
            .await
            .map_err(|e| Error::Internal(format!("Password verification task failed: {}", e)))??;
        Ok(matches)
    }

    /// Rate limit, then check credentials, then mint a token.
    ///
    /// The rate limit runs before the username is looked up. Unknown users
    /// and wrong passwords both fail with `InvalidCredentials`.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        client_identity: &str,
    ) -> Result<AccessToken> {
        self.limiter.check_and_record(client_identity).await?;

        let user = self.store.get_user(username).await?;
        let verified = match &user {
            Some(user) => self.verify_password(password, &user.password_hash).await?,
            None => {
                self.verify_password(password, &self.dummy_hash).await?;
                false
            }
        };

        let user = match user {
            Some(user) if verified => user,
            _ => {
                warn!("Rejected login from {}", client_identity);
                LOGIN_FAILURE_TOTAL.inc();
                return Err(AuthError::InvalidCredentials.into());
            }
        };

        let token = self.tokens.issue(&user.username, user.role)?;
        info!("User {} logged in from {}", user.username, client_identity);
        LOGIN_SUCCESS_TOTAL.inc();

        Ok(AccessToken::bearer(token))
    }

    /// Replaces the caller's password after re-checking the old one.
    ///
    /// The swap is conditional on the stored hash being the one that was
    /// verified, so a concurrent change makes this call fail instead of
    /// overwriting it.
    pub async fn change_password(
        &self,
        identity: &Identity,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        if new_password.is_empty() {
            return Err(ValidationError::Invalid("new_password cannot be empty".to_string()).into());
        }

        let user = self
            .store
            .get_user(&identity.username)
            .await?
            .ok_or(AuthError::Unauthenticated)?;

        if !self.verify_password(old_password, &user.password_hash).await? {
            warn!("Incorrect current password for {}", user.username);
            return Err(AuthError::IncorrectPassword.into());
        }

        let new_hash = self.hash_password(new_password).await?;
        let swapped = self
            .store
            .replace_password_hash(&user.username, &user.password_hash, &new_hash)
            .await?;
        if !swapped {
            warn!("Password for {} changed concurrently", user.username);
            return Err(AuthError::IncorrectPassword.into());
        }

        info!("Password changed for {}", user.username);
        Ok(())
    }

    /// Resolves a bearer token to the current user, optionally requiring a role.
    ///
    /// The role checked is the one stored for the user now, not the one in
    /// the token.
    pub async fn authorize(&self, token: &str, required_role: Option<Role>) -> Result<Identity> {
        let claims = self.tokens.verify(token).map_err(|e| {
            debug!("Bearer token rejected: {}", e);
            AuthError::Unauthenticated
        })?;

        let user = self
            .store
            .get_user(&claims.sub)
            .await?
            .ok_or(AuthError::Unauthenticated)?;

        if let Some(required) = required_role {
            if user.role != required {
                debug!(
                    "User {} with role {} denied, {} required",
                    user.username, user.role, required
                );
                return Err(AuthError::Forbidden.into());
            }
        }

        Ok(Identity {
            username: user.username,
            role: user.role,
        })
    }

    /// Creates a user with a freshly hashed password.
    pub async fn provision_user(&self, username: &str, password: &str, role: Role) -> Result<User> {
        validate_name("username", username)?;
        if password.is_empty() {
            return Err(ValidationError::Invalid("password cannot be empty".to_string()).into());
        }

        let password_hash = self.hash_password(password).await?;
        let user = self
            .store
            .create_user(NewUser {
                username: username.to_string(),
                password_hash,
                role,
            })
            .await?;

        info!("Provisioned {} user {}", user.role, user.username);
        Ok(user)
    }
}
