use anyhow::Context;
use api::{
    password::{self, NewUserDetails},
    store::StoreError,
    telemetry::{get_subscriber, init_subscriber},
    time::TimeSource,
};

/// Create the admin account.
///
/// Required environment variables (a .env file is read if present):
/// - DATABASE_URL: PostgreSQL connection string
/// - ADMIN_NAME, ADMIN_EMAIL, ADMIN_PASSWORD: the admin's details
///
/// Running it again once an admin exists is a no-op.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_subscriber(get_subscriber("info"))?;

    let var = |name: &str| {
        std::env::var(name).with_context(|| format!("{name} must be set"))
    };
    let details = NewUserDetails::new(
        var("ADMIN_NAME")?,
        var("ADMIN_EMAIL")?,
        var("ADMIN_PASSWORD")?,
    );
    details.validate().map_err(anyhow::Error::msg)?;

    let pool = sqlx::PgPool::connect(&var("DATABASE_URL")?)
        .await
        .context("Failed to connect to Postgres")?;
    sqlx::migrate!("../api/migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    let time_source = TimeSource::default();

    match password::create_admin(details, &pool, &time_source).await {
        Ok(admin) => {
            tracing::info!("Admin account {} is ready", admin.email);
            Ok(())
        }
        Err(StoreError::AdminAlreadyExists) => {
            tracing::info!("An admin account already exists; nothing to do");
            Ok(())
        }
        Err(e) => Err(e).context("Failed to create admin account"),
    }
}
