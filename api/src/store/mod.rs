//! Database access for the wallet service.
//!
//! ## Design Decisions
//!
//! ### Time Source Dependency
//! Every write stamps `created_at`/`updated_at` from a `TimeSource` rather
//! than the database clock, so tests can pin and advance time.
//!
//! ### Treasury
//! The account that receives commissions is recorded in the single-row
//! `treasury` table. A partial unique index on `users(role)` keeps at most
//! one admin, and the seeding path writes both rows in one transaction.
//!
//! ### Tokens
//! Password reset tokens are single-use rows with an expiry. Issuing a new
//! token retires any unused one for the same user and action.

use anyhow::Context;
use derive_more::Display;
use jiff::Timestamp;
use jiff_sqlx::{Timestamp as SqlxTs, ToSqlx};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Type};
use uuid::Uuid;

use payloads::{Role, UserId, responses};

use crate::time::TimeSource;

pub mod ledger;

/// A complete user row that stays in the backend.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub balance: Decimal,
    /// `jti` of the only refresh token currently accepted for this user.
    pub refresh_token_id: Option<Uuid>,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub updated_at: Timestamp,
}

impl From<&User> for responses::UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            role: user.role,
        }
    }
}

impl From<User> for responses::Account {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
            email: user.email,
            role: user.role,
            balance: user.balance,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, Type,
)]
#[sqlx(type_name = "token_action", rename_all = "snake_case")]
pub enum TokenAction {
    PasswordReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, sqlx::Type, FromRow)]
#[sqlx(transparent)]
pub struct TokenId(pub Uuid);

#[derive(Debug, Clone, FromRow)]
pub struct Token {
    pub id: TokenId,
    pub user_id: UserId,
    pub action: TokenAction,
    pub used: bool,
    #[sqlx(try_from = "SqlxTs")]
    pub expires_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub updated_at: Timestamp,
}

/// Create a regular user as would happen during registration.
#[tracing::instrument(skip(pool, password_hash, time_source))]
pub async fn create_user(
    pool: &PgPool,
    name: &str,
    email: &str,
    password_hash: &str,
    time_source: &TimeSource,
) -> Result<User, StoreError> {
    if name.len() > payloads::requests::NAME_MAX_LEN
        || email.len() > payloads::requests::EMAIL_MAX_LEN
    {
        return Err(StoreError::FieldTooLong);
    }
    sqlx::query_as::<_, User>(
        "INSERT INTO users (
                name,
                email,
                password_hash,
                role,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, 'user', $4, $4)
            RETURNING *;",
    )
    .bind(name)
    .bind(email)
    .bind(password_hash)
    .bind(time_source.now().to_sqlx())
    .fetch_one(pool)
    .await
    .map_err(map_user_unique_error)
}

/// Create the admin account and designate it as the treasury.
///
/// Returns `AdminAlreadyExists` if there is already an admin, whether or not
/// it has the requested email.
#[tracing::instrument(skip(pool, password_hash, time_source))]
pub async fn create_admin(
    pool: &PgPool,
    name: &str,
    email: &str,
    password_hash: &str,
    time_source: &TimeSource,
) -> Result<User, StoreError> {
    let now = time_source.now().to_sqlx();
    let mut tx = pool.begin().await?;

    let admin = sqlx::query_as::<_, User>(
        "INSERT INTO users (
                name,
                email,
                password_hash,
                role,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, 'admin', $4, $4)
            RETURNING *;",
    )
    .bind(name)
    .bind(email)
    .bind(password_hash)
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .map_err(map_user_unique_error)?;

    sqlx::query(
        "INSERT INTO treasury (id, user_id, created_at)
        VALUES (true, $1, $2)
        ON CONFLICT (id) DO UPDATE SET user_id = EXCLUDED.user_id",
    )
    .bind(admin.id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    tracing::info!("Created admin {} and designated it as treasury", admin.id);
    Ok(admin)
}

pub async fn read_user(pool: &PgPool, id: &UserId) -> Result<User, StoreError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1;")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::AccountNotFound)
}

#[tracing::instrument(skip(pool))]
pub async fn get_user_by_email(
    email: &str,
    pool: &PgPool,
) -> Result<User, StoreError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
        .bind(email)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch user by email")?
        .ok_or(StoreError::AccountNotFound)
}

/// Update name and/or email. Fields left as `None` keep their value.
#[tracing::instrument(skip(pool, time_source))]
pub async fn update_user_profile(
    user_id: &UserId,
    name: Option<&str>,
    email: Option<&str>,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<User, StoreError> {
    sqlx::query_as::<_, User>(
        r#"
        UPDATE users
        SET name = COALESCE($2, name),
            email = COALESCE($3, email),
            updated_at = $4
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(name)
    .bind(email)
    .bind(time_source.now().to_sqlx())
    .fetch_optional(pool)
    .await
    .map_err(map_user_unique_error)?
    .ok_or(StoreError::AccountNotFound)
}

/// Replace a user's password hash. Also revokes their refresh token so a
/// stolen session cannot outlive the password it was issued under.
#[tracing::instrument(skip(password_hash, pool, time_source))]
pub async fn set_password_hash(
    user_id: &UserId,
    password_hash: &str,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<(), StoreError> {
    let mut conn = pool.acquire().await?;
    set_password_hash_conn(user_id, password_hash, time_source.now(), &mut *conn)
        .await
}

async fn set_password_hash_conn(
    user_id: &UserId,
    password_hash: &str,
    now: Timestamp,
    conn: &mut sqlx::PgConnection,
) -> Result<(), StoreError> {
    let rows_affected = sqlx::query(
        r#"
        UPDATE users
        SET password_hash = $2, refresh_token_id = NULL, updated_at = $3
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .bind(password_hash)
    .bind(now.to_sqlx())
    .execute(conn)
    .await
    .context("Failed to change user's password in the database.")?
    .rows_affected();

    if rows_affected == 0 {
        return Err(StoreError::AccountNotFound);
    }
    Ok(())
}

/// Record the `jti` of the refresh token just issued, or clear it on logout.
#[tracing::instrument(skip(pool, time_source))]
pub async fn set_refresh_token_id(
    user_id: &UserId,
    refresh_token_id: Option<Uuid>,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<(), StoreError> {
    let rows_affected = sqlx::query(
        r#"
        UPDATE users
        SET refresh_token_id = $2, updated_at = $3
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .bind(refresh_token_id)
    .bind(time_source.now().to_sqlx())
    .execute(pool)
    .await?
    .rows_affected();

    if rows_affected == 0 {
        return Err(StoreError::AccountNotFound);
    }
    Ok(())
}

/// Swap the stored refresh token id from `presented` to `replacement`.
///
/// Fails with `RefreshTokenRevoked` unless `presented` is the id currently on
/// record, so each refresh token can be exchanged at most once even under
/// concurrent requests.
#[tracing::instrument(skip(pool, time_source))]
pub async fn rotate_refresh_token_id(
    user_id: &UserId,
    presented: Uuid,
    replacement: Uuid,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<User, StoreError> {
    sqlx::query_as::<_, User>(
        r#"
        UPDATE users
        SET refresh_token_id = $3, updated_at = $4
        WHERE id = $1 AND refresh_token_id = $2
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(presented)
    .bind(replacement)
    .bind(time_source.now().to_sqlx())
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::RefreshTokenRevoked)
}

/// Create a password reset (or other) token, retiring any unused token the
/// user already holds for the same action.
#[tracing::instrument(skip(pool, time_source))]
pub async fn create_token(
    user_id: &UserId,
    action: TokenAction,
    expires_at: Timestamp,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<TokenId, StoreError> {
    let now = time_source.now().to_sqlx();
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    sqlx::query(
        r#"
        UPDATE tokens
        SET used = true, updated_at = $3
        WHERE user_id = $1 AND action = $2 AND NOT used
        "#,
    )
    .bind(user_id)
    .bind(action)
    .bind(now)
    .execute(&mut *tx)
    .await
    .context("Failed to retire previous tokens")?;

    let token_id = sqlx::query_as::<_, TokenId>(
        r#"
        INSERT INTO tokens (user_id, action, expires_at, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $4)
        RETURNING id
        "#,
    )
    .bind(user_id)
    .bind(action)
    .bind(expires_at.to_sqlx())
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .context("Failed to create token")?;

    tx.commit().await.context("Failed to commit transaction")?;

    tracing::info!("Created {:?} token for user {}", action, user_id);
    Ok(token_id)
}

/// Spend a password reset token and store the new hash in one database
/// transaction, so a failed write leaves the token usable.
#[tracing::instrument(skip(password_hash, pool, time_source))]
pub async fn reset_password_with_token(
    token_id: &TokenId,
    password_hash: &str,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<UserId, StoreError> {
    let now = time_source.now();
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let user_id =
        consume_token_tx(token_id, TokenAction::PasswordReset, now, &mut tx)
            .await?;
    set_password_hash_conn(&user_id, password_hash, now, &mut *tx).await?;

    tx.commit().await.context("Failed to commit transaction")?;

    tracing::info!("Password reset for user {}", user_id);
    Ok(user_id)
}

/// Validate a locked token and mark it used, returning its owner.
async fn consume_token_tx(
    token_id: &TokenId,
    expected_action: TokenAction,
    now: Timestamp,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<UserId, StoreError> {
    let token = sqlx::query_as::<_, Token>(
        "SELECT * FROM tokens WHERE id = $1 FOR UPDATE",
    )
    .bind(token_id)
    .fetch_optional(&mut **tx)
    .await
    .context("Failed to fetch token")?
    .ok_or(StoreError::TokenNotFound)?;

    if token.action != expected_action {
        return Err(StoreError::InvalidTokenAction);
    }
    if token.used {
        return Err(StoreError::TokenAlreadyUsed);
    }
    if now > token.expires_at {
        return Err(StoreError::TokenExpired);
    }

    sqlx::query("UPDATE tokens SET used = true, updated_at = $2 WHERE id = $1")
        .bind(token_id)
        .bind(now.to_sqlx())
        .execute(&mut **tx)
        .await
        .context("Failed to mark token as used")?;

    tracing::info!(
        "Consumed {:?} token for user {}",
        expected_action,
        token.user_id
    );
    Ok(token.user_id)
}

/// The account designated to receive commissions, if any.
pub async fn get_treasury_id(pool: &PgPool) -> Result<Option<UserId>, StoreError> {
    let mut conn = pool.acquire().await?;
    get_treasury_id_conn(&mut conn).await
}

pub(crate) async fn get_treasury_id_conn(
    conn: &mut sqlx::PgConnection,
) -> Result<Option<UserId>, StoreError> {
    Ok(sqlx::query_scalar::<_, UserId>("SELECT user_id FROM treasury")
        .fetch_optional(conn)
        .await?)
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Account not found")]
    AccountNotFound,
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(&'static str),
    #[error("Insufficient balance")]
    InsufficientBalance,
    #[error("Amount must be positive")]
    AmountMustBePositive,
    #[error("Amount exceeds the maximum of 1000000000")]
    AmountTooLarge,
    #[error("Amount has more than 4 decimal places")]
    TooManyDecimalPlaces,
    #[error("Balance limit exceeded")]
    BalanceLimitExceeded,
    #[error("Cannot transfer funds to yourself")]
    SelfTransfer,
    #[error("Idempotency key was already used for a different request")]
    IdempotencyKeyReused,
    #[error("Treasury account is not configured")]
    TreasuryNotConfigured,
    #[error("An account with this email already exists")]
    EmailTaken,
    #[error("An admin account already exists")]
    AdminAlreadyExists,
    #[error("Refresh token has been revoked")]
    RefreshTokenRevoked,
    #[error("Field too long")]
    FieldTooLong,
    #[error("Token not found")]
    TokenNotFound,
    #[error("Invalid token action")]
    InvalidTokenAction,
    #[error("Token already used")]
    TokenAlreadyUsed,
    #[error("Token expired")]
    TokenExpired,
    #[error("Unique constraint violation")]
    NotUnique(#[source] sqlx::Error),
    #[error("Database error")]
    Database(#[source] sqlx::Error),
    #[error("Unexpected error")]
    UnexpectedError(#[from] anyhow::Error),
}

/// Translate the unique violations a users write can hit into specific
/// errors. Anything else goes through the generic conversion.
fn map_user_unique_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &e
        && db_err.is_unique_violation()
    {
        match db_err.constraint() {
            Some("users_email_key") => return StoreError::EmailTaken,
            Some("users_single_admin") => {
                return StoreError::AdminAlreadyExists;
            }
            _ => {}
        }
    }
    e.into()
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e {
            if db_err.is_unique_violation() {
                return StoreError::NotUnique(e);
            }
            // Last line of defence behind the locked balance checks.
            if db_err.is_check_violation() {
                match db_err.constraint() {
                    Some("users_balance_check") => {
                        return StoreError::InsufficientBalance;
                    }
                    Some("users_balance_limit") => {
                        return StoreError::BalanceLimitExceeded;
                    }
                    _ => {}
                }
            }
        }
        StoreError::Database(e)
    }
}
