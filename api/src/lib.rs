pub mod auth;
pub mod email;
pub mod notify;
pub mod password;
pub mod routes;
pub mod store;
pub mod telemetry;
pub mod time;

use actix_cors::Cors;
use actix_web::dev::Server;
use actix_web::{App, HttpServer, web};
use anyhow::Context;
use secrecy::SecretBox;
use sqlx::PgPool;
use std::net::TcpListener;
use std::sync::Arc;

use crate::auth::TokenIssuer;
use crate::email::EmailService;
use crate::notify::{EventPublisher, Notifier};
use crate::time::TimeSource;

/// Build the server, but not await it.
///
/// Returns the port that the server has bound to by modifying the config.
pub async fn build(
    config: &mut Config,
    time_source: TimeSource,
) -> anyhow::Result<Server> {
    let email_service = Arc::new(EmailService::new(
        &config.email_api_key,
        config.email_from_address.clone(),
        config.base_url.clone(),
    ));
    build_with_email(config, time_source, email_service).await
}

/// Like `build`, with a caller-provided email service so tests can inspect
/// what was sent.
pub async fn build_with_email(
    config: &mut Config,
    time_source: TimeSource,
    email_service: Arc<EmailService>,
) -> anyhow::Result<Server> {
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;

    // Ends once the server and every EventPublisher clone are dropped.
    let (events, receiver) = EventPublisher::channel();
    tokio::spawn(
        Notifier::new(pool.clone(), email_service.clone(), receiver).run(),
    );

    let db_pool = web::Data::new(pool);
    let time_source = web::Data::new(time_source);
    let issuer = web::Data::new(TokenIssuer::new(
        &config.access_token_secret,
        &config.refresh_token_secret,
    ));
    let email_service = web::Data::from(email_service);
    let events = web::Data::new(events);

    let allowed_origins = config.allowed_origins.clone();

    // OS assigns the port if binding to 0
    let listener = TcpListener::bind(format!("{}:{}", config.ip, config.port))
        .with_context(|| {
            format!("Failed to bind to {}:{}", config.ip, config.port)
        })?;
    config.port = listener.local_addr()?.port();
    let server = HttpServer::new(move || {
        let cors = if allowed_origins.iter().any(|origin| origin == "*") {
            // Development only. Bearer tokens, so no credentials mode.
            Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
        } else {
            allowed_origins.iter().fold(
                Cors::default().allow_any_method().allow_any_header(),
                |cors, origin| cors.allowed_origin(origin),
            )
        };

        App::new()
            .wrap(cors)
            .service(routes::api_services())
            .app_data(
                web::JsonConfig::default()
                    .error_handler(routes::json_error_handler),
            )
            .app_data(db_pool.clone())
            .app_data(time_source.clone())
            .app_data(issuer.clone())
            .app_data(email_service.clone())
            .app_data(events.clone())
    })
    .listen(listener)?
    .run();
    Ok(server)
}

pub struct Config {
    pub database_url: String,
    /// set to "0.0.0.0" for public access, "127.0.0.1" for local dev
    pub ip: String,
    /// set to 0 to get an os-assigned port
    pub port: u16,
    /// List of allowed CORS origins. Use "*" to allow any origin (development only)
    pub allowed_origins: Vec<String>,
    pub access_token_secret: SecretBox<String>,
    pub refresh_token_secret: SecretBox<String>,
    pub email_api_key: SecretBox<String>,
    pub email_from_address: String,
    /// Prefix for links sent by email
    pub base_url: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        use std::env::var;

        fn required(name: &str) -> anyhow::Result<String> {
            var(name).with_context(|| format!("{name} must be set"))
        }
        fn secret(name: &str) -> anyhow::Result<SecretBox<String>> {
            Ok(SecretBox::new(Box::new(required(name)?)))
        }

        let allowed_origins = var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            database_url: required("DATABASE_URL")?,
            ip: required("IP_ADDRESS")?,
            port: required("PORT")?
                .parse()
                .context("PORT must be a port number")?,
            allowed_origins,
            access_token_secret: secret("ACCESS_TOKEN_SECRET")?,
            refresh_token_secret: secret("REFRESH_TOKEN_SECRET")?,
            email_api_key: secret("EMAIL_API_KEY")?,
            email_from_address: required("EMAIL_FROM_ADDRESS")?,
            base_url: var("BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
        })
    }
}
