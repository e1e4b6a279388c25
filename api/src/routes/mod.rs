pub mod admin;
pub mod transactions;
pub mod users;

use actix_web::{
    HttpRequest, HttpResponse, Responder, ResponseError,
    body::BoxBody,
    dev::HttpServiceFactory,
    error::JsonPayloadError,
    get,
    http::{StatusCode, header},
    middleware::DefaultHeaders,
    web,
};
use payloads::responses::Envelope;

use crate::auth::AuthError;
use crate::store::StoreError;

pub fn api_services() -> impl HttpServiceFactory {
    web::scope("/api")
        .service(health_check)
        .service(
            web::scope("/users")
                .wrap(no_store())
                .service(users::register)
                .service(users::login)
                .service(users::logout)
                .service(users::refresh_token)
                .service(users::get_profile)
                .service(users::update_profile)
                .service(users::forgot_password)
                .service(users::reset_password)
                .service(users::change_password),
        )
        .service(
            web::scope("/transactions")
                .wrap(no_store())
                .service(transactions::request_add_funds)
                .service(transactions::process_withdrawal),
        )
        .service(
            web::scope("/admin")
                .wrap(no_store())
                .service(admin::list_commissions)
                .service(admin::request_transfer)
                .service(admin::approve_deposit)
                .service(admin::approve_transfer)
                .service(admin::reject_transaction)
                .service(admin::pending_transactions),
        )
}

/// Account data and tokens must not be kept by browsers or proxies.
fn no_store() -> DefaultHeaders {
    DefaultHeaders::new()
        .add((
            header::CACHE_CONTROL,
            "no-store, no-cache, must-revalidate, private",
        ))
        .add((header::PRAGMA, "no-cache"))
        .add((header::EXPIRES, "0"))
}

#[get("/health_check")]
pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(Envelope::message("healthy"))
}

/// Render malformed JSON bodies with the same envelope as other errors.
pub fn json_error_handler(
    err: JsonPayloadError,
    _request: &HttpRequest,
) -> actix_web::Error {
    APIError::BadRequest(anyhow::anyhow!("Invalid request body: {err}")).into()
}

#[derive(Debug, thiserror::Error)]
pub enum APIError {
    #[error("Authentication failed")]
    AuthError(#[source] anyhow::Error),
    #[error("Forbidden")]
    Forbidden(#[source] anyhow::Error),
    #[error("Bad request")]
    BadRequest(#[source] anyhow::Error),
    #[error("Not found")]
    NotFound(#[source] anyhow::Error),
    #[error("Something went wrong")]
    UnexpectedError(#[from] anyhow::Error),
}

impl APIError {
    /// Message shown to the client. Internal errors stay generic.
    fn client_message(&self) -> String {
        match self {
            Self::AuthError(e)
            | Self::Forbidden(e)
            | Self::BadRequest(e)
            | Self::NotFound(e) => e.to_string(),
            Self::UnexpectedError(_) => self.to_string(),
        }
    }
}

impl ResponseError for APIError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthError(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::UnexpectedError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse<BoxBody> {
        if let Self::UnexpectedError(e) = self {
            tracing::error!("{e:#}");
        }
        let status = self.status_code();
        HttpResponse::build(status)
            .json(Envelope::error(status.as_u16(), self.client_message()))
    }
}

impl From<StoreError> for APIError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Database(_) | StoreError::UnexpectedError(_) => {
                APIError::UnexpectedError(e.into())
            }
            StoreError::AccountNotFound => APIError::NotFound(e.into()),
            StoreError::RefreshTokenRevoked => APIError::AuthError(e.into()),
            _ => APIError::BadRequest(e.into()),
        }
    }
}

impl From<AuthError> for APIError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidCredentials(_) | AuthError::InvalidToken(_) => {
                APIError::AuthError(e.into())
            }
            AuthError::Forbidden => APIError::Forbidden(e.into()),
            AuthError::UnexpectedError(_) => {
                APIError::UnexpectedError(e.into())
            }
        }
    }
}

/// Turn a field validation failure into a 400.
fn validation(result: Result<(), &'static str>) -> Result<(), APIError> {
    result.map_err(|message| APIError::BadRequest(anyhow::anyhow!(message)))
}
