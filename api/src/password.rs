use crate::auth::AuthError;
use crate::store::{self, StoreError, TokenId};
use crate::telemetry::spawn_blocking_with_tracing;
use crate::time::TimeSource;
use anyhow::Context;
use argon2::password_hash::SaltString;
use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier,
    Version,
};
use payloads::UserId;
use secrecy::{ExposeSecret, SecretBox};
use sqlx::PgPool;

#[derive(serde::Deserialize)]
pub struct Credentials {
    pub email: String,
    password: SecretBox<String>,
}

/// Check an email and password, returning the matching user.
///
/// A hash is verified even when the email is unknown so that response time
/// does not reveal which emails are registered.
#[tracing::instrument(name = "Validate credentials", skip(credentials, pool))]
pub async fn validate_credentials(
    credentials: Credentials,
    pool: &PgPool,
) -> Result<store::User, AuthError> {
    let mut user = None;
    // fallback password hash to prevent timing differences
    let mut expected_password_hash = SecretBox::new(Box::new(
        "$argon2id$v=19$m=15000,t=2,p=1$\
        gZiV/M1gPc22ElAH/Jh1Hw$\
        CWOrkoo7oJBQ/iyh7uJ0LO2aLEfrHwTWllSAxT0zRno"
            .to_string(),
    ));

    if let Some(stored) = get_stored_user(&credentials.email, pool).await? {
        expected_password_hash =
            SecretBox::new(Box::new(stored.password_hash.clone()));
        user = Some(stored);
    }

    spawn_blocking_with_tracing(move || {
        verify_password_hash(expected_password_hash, credentials.password)
    })
    .await
    .context("Failed to spawn blocking task.")??;

    user.ok_or_else(|| anyhow::anyhow!("Unknown email."))
        .map_err(AuthError::InvalidCredentials)
}

/// Verify `current` against the stored hash of an authenticated user.
#[tracing::instrument(name = "Verify current password", skip(current, pool))]
pub async fn verify_current_password(
    user_id: &UserId,
    current: SecretBox<String>,
    pool: &PgPool,
) -> Result<(), AuthError> {
    let user = store::read_user(pool, user_id)
        .await
        .context("Failed to read user for password check")?;
    let expected_password_hash = SecretBox::new(Box::new(user.password_hash));
    spawn_blocking_with_tracing(move || {
        verify_password_hash(expected_password_hash, current)
    })
    .await
    .context("Failed to spawn blocking task.")?
}

#[tracing::instrument(name = "Get stored user", skip(email, pool))]
async fn get_stored_user(
    email: &str,
    pool: &PgPool,
) -> Result<Option<store::User>, anyhow::Error> {
    sqlx::query_as::<_, store::User>("SELECT * FROM users WHERE email = $1;")
        .bind(email)
        .fetch_optional(pool)
        .await
        .context("Failed to perform a query to retrieve stored credentials.")
}

#[tracing::instrument(
    name = "Verify password hash",
    skip(expected_password_hash, password_candidate)
)]
fn verify_password_hash(
    expected_password_hash: SecretBox<String>,
    password_candidate: SecretBox<String>,
) -> Result<(), AuthError> {
    let expected_password_hash =
        PasswordHash::new(expected_password_hash.expose_secret())
            .context("Failed to parse hash in PHC string format.")?;

    Argon2::default()
        .verify_password(
            password_candidate.expose_secret().as_bytes(),
            &expected_password_hash,
        )
        .context("Invalid password.")
        .map_err(AuthError::InvalidCredentials)
}

/// Hash and store a new password. Revokes the user's refresh token.
#[tracing::instrument(name = "Change password", skip(password, pool, time_source))]
pub async fn change_password(
    user_id: &UserId,
    password: SecretBox<String>,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<(), StoreError> {
    let password_hash =
        spawn_blocking_with_tracing(move || compute_password_hash(password))
            .await
            .map_err(anyhow::Error::from)?
            .context("Failed to hash password")?;
    store::set_password_hash(
        user_id,
        password_hash.expose_secret(),
        pool,
        time_source,
    )
    .await
}

/// Hash `password` and store it for the owner of a reset token, spending
/// the token in the same database transaction.
#[tracing::instrument(name = "Reset password", skip(password, pool, time_source))]
pub async fn reset_password(
    token_id: &TokenId,
    password: SecretBox<String>,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<UserId, StoreError> {
    let password_hash =
        spawn_blocking_with_tracing(move || compute_password_hash(password))
            .await
            .map_err(anyhow::Error::from)?
            .context("Failed to hash password")?;
    store::reset_password_with_token(
        token_id,
        password_hash.expose_secret(),
        pool,
        time_source,
    )
    .await
}

#[derive(serde::Deserialize)]
pub struct NewUserDetails {
    pub name: String,
    pub email: String,
    password: SecretBox<String>,
}

impl NewUserDetails {
    pub fn new(name: String, email: String, password: String) -> Self {
        Self {
            name,
            email,
            password: SecretBox::new(Box::new(password)),
        }
    }

    /// Field checks shared by registration and admin seeding.
    pub fn validate(&self) -> Result<(), &'static str> {
        payloads::requests::validate_name(&self.name)?;
        payloads::requests::validate_email(&self.email)?;
        payloads::requests::validate_password(self.password.expose_secret())
    }
}

#[tracing::instrument(
    name = "Create user",
    skip(new_user_details, pool, time_source),
    fields(email=tracing::field::Empty, user_id=tracing::field::Empty)
)]
pub async fn create_user(
    new_user_details: NewUserDetails,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<store::User, StoreError> {
    let NewUserDetails {
        name,
        email,
        password,
    } = new_user_details;
    let password_hash =
        spawn_blocking_with_tracing(move || compute_password_hash(password))
            .await
            .map_err(anyhow::Error::from)?
            .context("Failed to hash password")?;
    let user = store::create_user(
        pool,
        &name,
        &email,
        password_hash.expose_secret(),
        time_source,
    )
    .await?;
    tracing::Span::current()
        .record("email", tracing::field::display(&email))
        .record("user_id", tracing::field::display(&user.id));
    Ok(user)
}

/// Create the admin account and designate it as treasury.
#[tracing::instrument(
    name = "Create admin",
    skip(new_user_details, pool, time_source),
    fields(email = %new_user_details.email)
)]
pub async fn create_admin(
    new_user_details: NewUserDetails,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<store::User, StoreError> {
    let NewUserDetails {
        name,
        email,
        password,
    } = new_user_details;
    let password_hash =
        spawn_blocking_with_tracing(move || compute_password_hash(password))
            .await
            .map_err(anyhow::Error::from)?
            .context("Failed to hash password")?;
    store::create_admin(
        pool,
        &name,
        &email,
        password_hash.expose_secret(),
        time_source,
    )
    .await
}

fn compute_password_hash(
    password: SecretBox<String>,
) -> Result<SecretBox<String>, anyhow::Error> {
    let salt = SaltString::generate(&mut rand_core::OsRng);
    let params = Params::new(15000, 2, 1, None)
        .context("Invalid argon2 parameters")?;
    let password_hash =
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password(password.expose_secret().as_bytes(), &salt)?
            .to_string();
    Ok(SecretBox::new(Box::new(password_hash)))
}
