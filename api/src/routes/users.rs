use actix_web::{HttpResponse, get, post, put, web};
use anyhow::anyhow;
use jiff::ToSpan;
use payloads::{
    requests,
    responses::{Account, AuthSession, Envelope, UserSummary},
};
use secrecy::{ExposeSecret, SecretBox};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::{AuthError, Principal, TokenIssuer, TokenKind};
use crate::email::EmailService;
use crate::password::{
    Credentials, NewUserDetails, change_password as store_new_password,
    create_user, reset_password as reset_password_with_token,
    validate_credentials, verify_current_password,
};
use crate::store::{self, TokenAction, TokenId, ledger};
use crate::time::TimeSource;

use super::{APIError, validation};

/// Issue a token pair and record its refresh id as the only valid one.
async fn start_session(
    user: &store::User,
    issuer: &TokenIssuer,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<AuthSession, APIError> {
    let refresh_id = Uuid::new_v4();
    store::set_refresh_token_id(&user.id, Some(refresh_id), pool, time_source)
        .await?;
    let tokens =
        issuer.issue_pair(user.id, user.role, refresh_id, time_source.now())?;
    Ok(AuthSession {
        user: UserSummary::from(user),
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
    })
}

#[tracing::instrument(
    skip(new_user_details, pool, issuer, time_source),
    fields(email = %new_user_details.email)
)]
#[post("/register")]
pub async fn register(
    new_user_details: web::Json<NewUserDetails>,
    pool: web::Data<PgPool>,
    issuer: web::Data<TokenIssuer>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    validation(new_user_details.validate())?;
    let user = create_user(new_user_details.into_inner(), &pool, &time_source)
        .await?;
    let session = start_session(&user, &issuer, &pool, &time_source).await?;
    Ok(HttpResponse::Created()
        .json(Envelope::ok(session, "User registered successfully")))
}

#[tracing::instrument(
    skip(credentials, pool, issuer, time_source),
    fields(email = %credentials.email, user_id = tracing::field::Empty)
)]
#[post("/login")]
pub async fn login(
    credentials: web::Json<Credentials>,
    pool: web::Data<PgPool>,
    issuer: web::Data<TokenIssuer>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    let user = validate_credentials(credentials.into_inner(), &pool).await?;
    tracing::Span::current()
        .record("user_id", tracing::field::display(&user.id));
    let session = start_session(&user, &issuer, &pool, &time_source).await?;
    Ok(HttpResponse::Ok().json(Envelope::ok(session, "Login successful")))
}

#[tracing::instrument(skip(principal, pool, time_source), fields(user_id = %principal.user_id))]
#[post("/logout")]
pub async fn logout(
    principal: Principal,
    pool: web::Data<PgPool>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    store::set_refresh_token_id(&principal.user_id, None, &pool, &time_source)
        .await?;
    Ok(HttpResponse::Ok().json(Envelope::message("Logged out successfully")))
}

/// Exchange a refresh token for a new pair. The presented token stops
/// working as soon as the exchange succeeds.
#[tracing::instrument(skip(request, pool, issuer, time_source))]
#[post("/refresh-token")]
pub async fn refresh_token(
    request: web::Json<requests::RefreshToken>,
    pool: web::Data<PgPool>,
    issuer: web::Data<TokenIssuer>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    let claims = issuer.verify(
        TokenKind::Refresh,
        &request.refresh_token,
        time_source.now(),
    )?;
    let replacement = Uuid::new_v4();
    let user = store::rotate_refresh_token_id(
        &claims.sub,
        claims.jti,
        replacement,
        &pool,
        &time_source,
    )
    .await?;
    let tokens =
        issuer.issue_pair(user.id, user.role, replacement, time_source.now())?;
    Ok(HttpResponse::Ok().json(Envelope::ok(tokens, "Token refreshed")))
}

#[tracing::instrument(skip(principal, pool), fields(user_id = %principal.user_id))]
#[get("/profile")]
pub async fn get_profile(
    principal: Principal,
    pool: web::Data<PgPool>,
) -> Result<HttpResponse, APIError> {
    let statement = ledger::get_user_statement(&principal.user_id, &pool).await?;
    Ok(HttpResponse::Ok().json(Envelope::ok(statement, "User profile")))
}

#[tracing::instrument(
    skip(principal, request, pool, time_source),
    fields(user_id = %principal.user_id)
)]
#[put("/profile")]
pub async fn update_profile(
    principal: Principal,
    request: web::Json<requests::UpdateProfile>,
    pool: web::Data<PgPool>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    if let Some(name) = &request.name {
        validation(requests::validate_name(name))?;
    }
    if let Some(email) = &request.email {
        validation(requests::validate_email(email))?;
    }
    let user = store::update_user_profile(
        &principal.user_id,
        request.name.as_deref(),
        request.email.as_deref(),
        &pool,
        &time_source,
    )
    .await?;
    Ok(HttpResponse::Ok()
        .json(Envelope::ok(Account::from(user), "Profile updated")))
}

/// Always answers the same way so the response does not reveal whether the
/// email is registered.
#[tracing::instrument(skip(request, pool, email_service, time_source))]
#[post("/forgot-password")]
pub async fn forgot_password(
    request: web::Json<requests::ForgotPassword>,
    pool: web::Data<PgPool>,
    email_service: web::Data<EmailService>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    let response = Envelope::message(
        "If an account with that email exists, a password reset link has been sent.",
    );

    let user = match store::get_user_by_email(&request.email, &pool).await {
        Ok(user) => user,
        Err(store::StoreError::AccountNotFound) => {
            return Ok(HttpResponse::Ok().json(response));
        }
        Err(e) => return Err(e.into()),
    };

    let token_id = store::create_token(
        &user.id,
        TokenAction::PasswordReset,
        time_source.after(1.hour()),
        &pool,
        &time_source,
    )
    .await?;

    if let Err(e) = email_service
        .send_password_reset_email(&user.email, &user.name, &token_id.to_string())
        .await
    {
        // The token stays valid; the user can ask again.
        tracing::error!("Failed to send password reset email: {e:#}");
    }

    Ok(HttpResponse::Ok().json(response))
}

#[derive(serde::Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    new_password: SecretBox<String>,
}

#[tracing::instrument(skip(request, pool, time_source))]
#[post("/reset-password")]
pub async fn reset_password(
    request: web::Json<ResetPasswordRequest>,
    pool: web::Data<PgPool>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    let ResetPasswordRequest {
        token,
        new_password,
    } = request.into_inner();
    validation(requests::validate_password(new_password.expose_secret()))?;
    let token_id = token
        .parse::<Uuid>()
        .map(TokenId)
        .map_err(|_| APIError::BadRequest(anyhow!("Invalid or expired token")))?;

    reset_password_with_token(&token_id, new_password, &pool, &time_source)
        .await?;

    Ok(HttpResponse::Ok()
        .json(Envelope::message("Password has been reset successfully.")))
}

#[derive(serde::Deserialize)]
pub struct ChangePasswordRequest {
    current_password: SecretBox<String>,
    new_password: SecretBox<String>,
}

#[tracing::instrument(
    skip(principal, request, pool, time_source),
    fields(user_id = %principal.user_id)
)]
#[post("/change-password")]
pub async fn change_password(
    principal: Principal,
    request: web::Json<ChangePasswordRequest>,
    pool: web::Data<PgPool>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    let ChangePasswordRequest {
        current_password,
        new_password,
    } = request.into_inner();
    validation(requests::validate_password(new_password.expose_secret()))?;

    verify_current_password(&principal.user_id, current_password, &pool)
        .await
        .map_err(|e| match e {
            AuthError::InvalidCredentials(_) => APIError::BadRequest(anyhow!(
                "Current password is incorrect."
            )),
            e => e.into(),
        })?;
    store_new_password(&principal.user_id, new_password, &pool, &time_source)
        .await?;

    Ok(HttpResponse::Ok()
        .json(Envelope::message("Password changed successfully.")))
}
