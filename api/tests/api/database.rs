//! Schema constraints and store functions called directly.
//!
//! Most tests are at the http route level; these check the guarantees the
//! database itself provides.

use api::store::{self, StoreError, ledger};
use jiff::ToSpan;
use payloads::{TransactionStatus, UserId};
use rust_decimal::dec;
use uuid::Uuid;

use test_helpers::spawn_app;

fn is_check_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_check_violation())
}

#[tokio::test]
async fn balance_cannot_go_negative() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let alice = app.create_alice_user().await?;

    let result = sqlx::query("UPDATE users SET balance = -1 WHERE id = $1")
        .bind(alice.id().0)
        .execute(&app.db_pool)
        .await;
    assert!(is_check_violation(&result.unwrap_err()));

    Ok(())
}

#[tokio::test]
async fn transaction_shape_is_enforced() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let alice = app.create_alice_user().await?;
    let bob = app.create_bob_user().await?;

    let insert = |kind: &'static str,
                  status: &'static str,
                  recipient: Option<Uuid>,
                  amount| {
        sqlx::query(
            "INSERT INTO transactions (user_id, recipient_id, amount, kind, status)
            VALUES ($1, $2, $3, $4::transaction_kind, $5::transaction_status)",
        )
        .bind(alice.id().0)
        .bind(recipient)
        .bind(amount)
        .bind(kind)
        .bind(status)
        .execute(&app.db_pool)
    };

    let result = insert("deposit", "pending", None, dec!(0)).await;
    assert!(is_check_violation(&result.unwrap_err()));

    let result = insert("transfer", "pending", None, dec!(5)).await;
    assert!(is_check_violation(&result.unwrap_err()));

    let result = insert("deposit", "pending", Some(bob.id().0), dec!(5)).await;
    assert!(is_check_violation(&result.unwrap_err()));

    let result = insert("withdrawal", "pending", None, dec!(5)).await;
    assert!(is_check_violation(&result.unwrap_err()));

    insert("transfer", "pending", Some(bob.id().0), dec!(5)).await?;

    Ok(())
}

#[tokio::test]
async fn one_commission_per_transaction() -> anyhow::Result<()> {
    let app = spawn_app().await;
    app.create_admin_user().await?;
    let alice = app.create_alice_user().await?;

    let withdrawal = ledger::process_withdrawal(
        &alice.id(),
        dec!(10),
        None,
        None,
        &app.time_source,
        &app.db_pool,
    )
    .await?;

    let result = sqlx::query(
        "INSERT INTO commissions (transaction_id, amount, kind)
        VALUES ($1, 1, 'withdrawal')",
    )
    .bind(withdrawal.transaction.id.0)
    .execute(&app.db_pool)
    .await;
    match result {
        Err(sqlx::Error::Database(db)) => assert!(db.is_unique_violation()),
        _ => panic!("Expected unique violation"),
    }

    Ok(())
}

#[tokio::test]
async fn second_admin_row_is_refused() -> anyhow::Result<()> {
    let app = spawn_app().await;
    app.create_admin_user().await?;

    let result = sqlx::query(
        "INSERT INTO users (name, email, password_hash, role)
        VALUES ('Eve', 'eve@example.com', 'x', 'admin')",
    )
    .execute(&app.db_pool)
    .await;
    match result {
        Err(sqlx::Error::Database(db)) => {
            assert_eq!(db.constraint(), Some("users_single_admin"))
        }
        _ => panic!("Expected unique violation"),
    }

    Ok(())
}

#[tokio::test]
async fn treasury_is_the_admin() -> anyhow::Result<()> {
    let app = spawn_app().await;
    assert_eq!(store::get_treasury_id(&app.db_pool).await?, None);

    let admin = app.create_admin_user().await?;
    assert_eq!(store::get_treasury_id(&app.db_pool).await?, Some(admin.id()));

    Ok(())
}

#[tokio::test]
async fn store_reports_missing_accounts() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let ghost = UserId(Uuid::new_v4());

    let result = ledger::request_deposit(
        &ghost,
        dec!(10),
        None,
        None,
        &app.time_source,
        &app.db_pool,
    )
    .await;
    assert!(matches!(result, Err(StoreError::AccountNotFound)));

    let result = ledger::process_withdrawal(
        &ghost,
        dec!(10),
        None,
        None,
        &app.time_source,
        &app.db_pool,
    )
    .await;
    assert!(matches!(result, Err(StoreError::AccountNotFound)));

    let result = store::read_user(&app.db_pool, &ghost).await;
    assert!(matches!(result, Err(StoreError::AccountNotFound)));

    Ok(())
}

#[tokio::test]
async fn timestamps_come_from_the_time_source() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let alice = app.create_alice_user().await?;

    let deposit = ledger::request_deposit(
        &alice.id(),
        dec!(10),
        Some("  "),
        None,
        &app.time_source,
        &app.db_pool,
    )
    .await?;
    assert_eq!(deposit.created_at, app.time_source.now());
    assert_eq!(deposit.status, TransactionStatus::Pending);
    assert_eq!(deposit.note, "-");

    Ok(())
}

#[tokio::test]
async fn failed_password_reset_leaves_token_usable() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let alice = app.create_alice_user().await?;
    let token_id = store::create_token(
        &alice.id(),
        store::TokenAction::PasswordReset,
        app.time_source.after(1.hour()),
        &app.db_pool,
        &app.time_source,
    )
    .await?;

    // Make every write to users fail.
    sqlx::query(
        "ALTER TABLE users ADD CONSTRAINT users_frozen \
         CHECK (updated_at < '2000-01-01') NOT VALID",
    )
    .execute(&app.db_pool)
    .await?;
    let result = store::reset_password_with_token(
        &token_id,
        "replacement-hash",
        &app.db_pool,
        &app.time_source,
    )
    .await;
    assert!(result.is_err());

    let used: bool =
        sqlx::query_scalar("SELECT used FROM tokens WHERE id = $1")
            .bind(token_id.0)
            .fetch_one(&app.db_pool)
            .await?;
    assert!(!used);

    sqlx::query("ALTER TABLE users DROP CONSTRAINT users_frozen")
        .execute(&app.db_pool)
        .await?;
    let user_id = store::reset_password_with_token(
        &token_id,
        "replacement-hash",
        &app.db_pool,
        &app.time_source,
    )
    .await?;
    assert_eq!(user_id, alice.id());
    let stored: String =
        sqlx::query_scalar("SELECT password_hash FROM users WHERE id = $1")
            .bind(alice.id().0)
            .fetch_one(&app.db_pool)
            .await?;
    assert_eq!(stored, "replacement-hash");

    Ok(())
}
