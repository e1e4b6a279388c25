//! Bearer token issuing and verification.
//!
//! Access and refresh tokens are HS256 JWTs signed with separate secrets, so
//! one can never be presented as the other. Expiry is checked against the
//! application `TimeSource` instead of the system clock.

use actix_web::{FromRequest, HttpRequest, dev::Payload, http::header, web};
use anyhow::anyhow;
use jiff::{Timestamp, ToSpan};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
};
use payloads::{Role, UserId, responses::TokenPair};
use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use std::future::{Ready, ready};
use uuid::Uuid;

use crate::routes::APIError;
use crate::time::TimeSource;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("Incorrect email or password.")]
    InvalidCredentials(#[source] anyhow::Error),
    #[error("Invalid or expired token")]
    InvalidToken(#[source] anyhow::Error),
    #[error("Admin access required")]
    Forbidden,
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    fn lifetime(&self) -> jiff::Span {
        match self {
            Self::Access => 15.minutes(),
            Self::Refresh => (7 * 24).hours(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub role: Role,
    /// Seconds since the Unix epoch.
    pub exp: i64,
    pub jti: Uuid,
}

struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl KeyPair {
    fn from_secret(secret: &SecretBox<String>) -> Self {
        let secret = secret.expose_secret().as_bytes();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }
}

pub struct TokenIssuer {
    access: KeyPair,
    refresh: KeyPair,
    validation: Validation,
}

impl TokenIssuer {
    pub fn new(
        access_secret: &SecretBox<String>,
        refresh_secret: &SecretBox<String>,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // exp is compared against the TimeSource in `verify`.
        validation.validate_exp = false;
        Self {
            access: KeyPair::from_secret(access_secret),
            refresh: KeyPair::from_secret(refresh_secret),
            validation,
        }
    }

    fn keys(&self, kind: TokenKind) -> &KeyPair {
        match kind {
            TokenKind::Access => &self.access,
            TokenKind::Refresh => &self.refresh,
        }
    }

    pub fn issue(
        &self,
        kind: TokenKind,
        user_id: UserId,
        role: Role,
        jti: Uuid,
        now: Timestamp,
    ) -> Result<String, AuthError> {
        let expires_at = now
            .checked_add(kind.lifetime())
            .map_err(|e| AuthError::UnexpectedError(e.into()))?;
        let claims = Claims {
            sub: user_id,
            role,
            exp: expires_at.as_second(),
            jti,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.keys(kind).encoding)
            .map_err(|e| AuthError::UnexpectedError(e.into()))
    }

    /// Issue a fresh access token and a refresh token carrying `refresh_id`.
    pub fn issue_pair(
        &self,
        user_id: UserId,
        role: Role,
        refresh_id: Uuid,
        now: Timestamp,
    ) -> Result<TokenPair, AuthError> {
        Ok(TokenPair {
            access_token: self.issue(
                TokenKind::Access,
                user_id,
                role,
                Uuid::new_v4(),
                now,
            )?,
            refresh_token: self.issue(
                TokenKind::Refresh,
                user_id,
                role,
                refresh_id,
                now,
            )?,
        })
    }

    pub fn verify(
        &self,
        kind: TokenKind,
        token: &str,
        now: Timestamp,
    ) -> Result<Claims, AuthError> {
        let claims = decode::<Claims>(
            token,
            &self.keys(kind).decoding,
            &self.validation,
        )
        .map_err(|e| AuthError::InvalidToken(e.into()))?
        .claims;
        if claims.exp <= now.as_second() {
            return Err(AuthError::InvalidToken(anyhow!("Token has expired")));
        }
        Ok(claims)
    }
}

/// The authenticated caller of a route, taken from the bearer access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub role: Role,
}

/// A `Principal` that has been checked to be the admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminPrincipal(pub Principal);

fn bearer_token(request: &HttpRequest) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn authenticate(request: &HttpRequest) -> Result<Principal, APIError> {
    let issuer = request
        .app_data::<web::Data<TokenIssuer>>()
        .ok_or_else(|| anyhow!("TokenIssuer missing from app data"))?;
    let time_source = request
        .app_data::<web::Data<TimeSource>>()
        .ok_or_else(|| anyhow!("TimeSource missing from app data"))?;
    let token = bearer_token(request).ok_or_else(|| {
        AuthError::InvalidToken(anyhow!("Missing bearer token"))
    })?;
    let claims = issuer.verify(TokenKind::Access, token, time_source.now())?;
    Ok(Principal {
        user_id: claims.sub,
        role: claims.role,
    })
}

impl FromRequest for Principal {
    type Error = APIError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(authenticate(req))
    }
}

impl FromRequest for AdminPrincipal {
    type Error = APIError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(authenticate(req).and_then(|principal| {
            if principal.role.is_admin() {
                Ok(AdminPrincipal(principal))
            } else {
                Err(AuthError::Forbidden.into())
            }
        }))
    }
}
