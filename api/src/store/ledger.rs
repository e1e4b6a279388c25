//! Balance-changing operations.
//!
//! Every operation runs in one database transaction. Rows are locked with
//! `SELECT ... FOR UPDATE` before any balance is read for a decision:
//! first the transaction being approved or rejected, then every account
//! involved in ascending id order. Balance changes are applied as
//! `balance = balance + delta` so they compose even when two roles fall on
//! the same account.
//!
//! # Commission
//!
//! Approved transfers and withdrawals charge 3% of the amount. The
//! commission is credited to the treasury on top of what moves between the
//! parties: a transfer of 100 debits the sender 100, credits the recipient
//! 100 and credits the treasury 3. A withdrawal of 100 debits the user 100,
//! reports 97 as paid out and credits the treasury 3.

use jiff_sqlx::ToSqlx;
use payloads::{
    Commission, CommissionKind, IdempotencyKey, Transaction, TransactionId,
    TransactionKind, TransactionStatus, UserId,
    responses::{Party, PendingTransaction, StatementEntry, UserStatement},
};
use rust_decimal::{Decimal, dec};
use sqlx::{FromRow, PgPool, Postgres};
use std::collections::HashMap;

use super::{StoreError, get_treasury_id_conn, read_user};
use crate::time::TimeSource;

pub const COMMISSION_RATE: Decimal = dec!(0.03);

type DbTransaction<'c> = sqlx::Transaction<'c, Postgres>;

/// Commission charged on an approved transfer or a withdrawal.
pub fn commission_for(amount: Decimal) -> Decimal {
    amount * COMMISSION_RATE
}

/// Largest amount a single deposit, transfer or withdrawal may move.
pub const MAX_AMOUNT: Decimal = dec!(1000000000);
/// Amounts carry at most this many decimal places.
pub const MAX_AMOUNT_SCALE: u32 = 4;
/// Ceiling on any balance. `users_balance_limit` enforces the same value.
pub const MAX_BALANCE: Decimal = dec!(1000000000000000);

/// Bounds keep every balance representable as a `Decimal` once read back.
fn ensure_valid_amount(amount: Decimal) -> Result<(), StoreError> {
    if amount <= Decimal::ZERO {
        return Err(StoreError::AmountMustBePositive);
    }
    if amount > MAX_AMOUNT {
        return Err(StoreError::AmountTooLarge);
    }
    if amount.normalize().scale() > MAX_AMOUNT_SCALE {
        return Err(StoreError::TooManyDecimalPlaces);
    }
    Ok(())
}

/// Blank or missing notes are stored as "-".
fn note_or_placeholder(note: Option<&str>) -> &str {
    match note.map(str::trim) {
        Some(note) if !note.is_empty() => note,
        _ => "-",
    }
}

fn rejection_note(note: &str, reason: Option<&str>) -> String {
    match reason.map(str::trim) {
        Some(reason) if !reason.is_empty() && note == "-" => {
            format!("Rejected: {reason}")
        }
        Some(reason) if !reason.is_empty() => {
            format!("{note} | Rejected: {reason}")
        }
        _ => note.to_string(),
    }
}

/// A transfer approved by an admin together with the commission it paid.
#[derive(Debug, Clone)]
pub struct TransferApproval {
    pub transaction: Transaction,
    pub commission: Commission,
}

#[derive(Debug, Clone)]
pub struct Withdrawal {
    pub transaction: Transaction,
    pub commission: Commission,
    /// Set when an idempotency key matched an earlier withdrawal and nothing
    /// new was debited.
    pub replayed: bool,
}

impl Withdrawal {
    /// Amount paid out to the user after commission.
    pub fn withdrawn_amount(&self) -> Decimal {
        self.transaction.amount - self.commission.amount
    }
}

struct NewTransaction<'a> {
    user_id: &'a UserId,
    recipient_id: Option<&'a UserId>,
    amount: Decimal,
    kind: TransactionKind,
    status: TransactionStatus,
    approved_by: Option<&'a UserId>,
    note: &'a str,
    idempotency_key: Option<IdempotencyKey>,
}

/// Record a deposit request for an admin to approve. No balance changes.
#[tracing::instrument(skip(time_source, pool))]
pub async fn request_deposit(
    user_id: &UserId,
    amount: Decimal,
    note: Option<&str>,
    idempotency_key: Option<IdempotencyKey>,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Transaction, StoreError> {
    ensure_valid_amount(amount)?;
    let mut tx = pool.begin().await?;

    let new = NewTransaction {
        user_id,
        recipient_id: None,
        amount,
        kind: TransactionKind::Deposit,
        status: TransactionStatus::Pending,
        approved_by: None,
        note: note_or_placeholder(note),
        idempotency_key,
    };
    if let Some(existing) = find_replay_tx(&new, &mut tx).await? {
        return Ok(existing);
    }
    ensure_account_exists_tx(user_id, &mut tx).await?;

    let transaction = insert_transaction_tx(&new, time_source, &mut tx).await?;
    tx.commit().await?;

    tracing::info!("Deposit {} of {} requested", transaction.id, amount);
    Ok(transaction)
}

/// Credit a pending deposit to its owner and mark it approved.
#[tracing::instrument(skip(time_source, pool))]
pub async fn approve_deposit(
    admin_id: &UserId,
    transaction_id: &TransactionId,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Transaction, StoreError> {
    let mut tx = pool.begin().await?;

    let pending = lock_pending_tx(transaction_id, &mut tx).await?;
    if pending.kind != TransactionKind::Deposit {
        return Err(StoreError::InvalidTransaction("not a deposit"));
    }

    lock_accounts_tx(&[pending.user_id], &mut tx).await?;
    adjust_balance_tx(&pending.user_id, pending.amount, time_source, &mut tx)
        .await?;
    let transaction = finalize_tx(
        transaction_id,
        TransactionStatus::Approved,
        admin_id,
        &pending.note,
        time_source,
        &mut tx,
    )
    .await?;

    tx.commit().await?;
    tracing::info!(
        "Deposit {} of {} approved for {}",
        transaction.id,
        transaction.amount,
        transaction.user_id
    );
    Ok(transaction)
}

/// Record a transfer request for an admin to approve.
///
/// The sender's balance check here is advisory and nothing is held;
/// approval re-checks it under lock.
#[tracing::instrument(skip(time_source, pool))]
pub async fn request_transfer(
    sender_id: &UserId,
    recipient_id: &UserId,
    amount: Decimal,
    note: Option<&str>,
    idempotency_key: Option<IdempotencyKey>,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Transaction, StoreError> {
    ensure_valid_amount(amount)?;
    if sender_id == recipient_id {
        return Err(StoreError::SelfTransfer);
    }
    let mut tx = pool.begin().await?;

    let new = NewTransaction {
        user_id: sender_id,
        recipient_id: Some(recipient_id),
        amount,
        kind: TransactionKind::Transfer,
        status: TransactionStatus::Pending,
        approved_by: None,
        note: note_or_placeholder(note),
        idempotency_key,
    };
    if let Some(existing) = find_replay_tx(&new, &mut tx).await? {
        return Ok(existing);
    }

    let balance = read_balance_tx(sender_id, &mut tx).await?;
    ensure_account_exists_tx(recipient_id, &mut tx).await?;
    if balance < amount {
        return Err(StoreError::InsufficientBalance);
    }

    let transaction = insert_transaction_tx(&new, time_source, &mut tx).await?;
    tx.commit().await?;

    tracing::info!(
        "Transfer {} of {} requested from {} to {}",
        transaction.id,
        amount,
        sender_id,
        recipient_id
    );
    Ok(transaction)
}

/// Move the funds of a pending transfer and credit the commission to the
/// treasury.
#[tracing::instrument(skip(time_source, pool))]
pub async fn approve_transfer(
    admin_id: &UserId,
    transaction_id: &TransactionId,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<TransferApproval, StoreError> {
    let mut tx = pool.begin().await?;

    let pending = lock_pending_tx(transaction_id, &mut tx).await?;
    if pending.kind != TransactionKind::Transfer {
        return Err(StoreError::InvalidTransaction("not a transfer"));
    }
    let recipient_id = pending
        .recipient_id
        .ok_or(StoreError::InvalidTransaction("transfer has no recipient"))?;
    let treasury_id = get_treasury_id_conn(&mut *tx)
        .await?
        .ok_or(StoreError::TreasuryNotConfigured)?;

    let balances = lock_accounts_tx(
        &[pending.user_id, recipient_id, treasury_id],
        &mut tx,
    )
    .await?;
    let sender_balance = balances
        .get(&pending.user_id)
        .copied()
        .ok_or(StoreError::AccountNotFound)?;
    if sender_balance < pending.amount {
        return Err(StoreError::InsufficientBalance);
    }

    let commission = commission_for(pending.amount);
    adjust_balance_tx(&pending.user_id, -pending.amount, time_source, &mut tx)
        .await?;
    adjust_balance_tx(&recipient_id, pending.amount, time_source, &mut tx)
        .await?;
    adjust_balance_tx(&treasury_id, commission, time_source, &mut tx).await?;

    let transaction = finalize_tx(
        transaction_id,
        TransactionStatus::Approved,
        admin_id,
        &pending.note,
        time_source,
        &mut tx,
    )
    .await?;
    let commission = record_commission_tx(
        transaction_id,
        commission,
        CommissionKind::Transfer,
        Some(&treasury_id),
        time_source,
        &mut tx,
    )
    .await?;

    tx.commit().await?;
    tracing::info!(
        "Transfer {} of {} approved with commission {}",
        transaction.id,
        transaction.amount,
        commission.amount
    );
    Ok(TransferApproval {
        transaction,
        commission,
    })
}

/// Debit a withdrawal immediately and record it as approved.
///
/// When no treasury is configured the commission is still recorded, with no
/// account credited.
#[tracing::instrument(skip(time_source, pool))]
pub async fn process_withdrawal(
    user_id: &UserId,
    amount: Decimal,
    note: Option<&str>,
    idempotency_key: Option<IdempotencyKey>,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Withdrawal, StoreError> {
    ensure_valid_amount(amount)?;
    let mut tx = pool.begin().await?;

    let treasury_id = get_treasury_id_conn(&mut *tx).await?;
    let mut involved = vec![*user_id];
    involved.extend(treasury_id);
    let balances = lock_accounts_tx(&involved, &mut tx).await?;

    let new = NewTransaction {
        user_id,
        recipient_id: None,
        amount,
        kind: TransactionKind::Withdrawal,
        status: TransactionStatus::Approved,
        approved_by: None,
        note: note_or_placeholder(note),
        idempotency_key,
    };
    // Checked after locking so a retry racing the original sees its result.
    if let Some(existing) = find_replay_tx(&new, &mut tx).await? {
        let commission = read_commission_tx(&existing.id, &mut tx).await?;
        return Ok(Withdrawal {
            transaction: existing,
            commission,
            replayed: true,
        });
    }

    let balance = balances
        .get(user_id)
        .copied()
        .ok_or(StoreError::AccountNotFound)?;
    if balance < amount {
        return Err(StoreError::InsufficientBalance);
    }

    let commission = commission_for(amount);
    adjust_balance_tx(user_id, -amount, time_source, &mut tx).await?;
    match &treasury_id {
        Some(treasury_id) => {
            adjust_balance_tx(treasury_id, commission, time_source, &mut tx)
                .await?;
        }
        None => tracing::warn!(
            "No treasury configured; withdrawal commission of {commission} \
             is recorded but not credited"
        ),
    }

    let transaction = insert_transaction_tx(&new, time_source, &mut tx).await?;
    let commission = record_commission_tx(
        &transaction.id,
        commission,
        CommissionKind::Withdrawal,
        treasury_id.as_ref(),
        time_source,
        &mut tx,
    )
    .await?;

    tx.commit().await?;
    tracing::info!(
        "Withdrawal {} of {} processed for {}",
        transaction.id,
        amount,
        user_id
    );
    Ok(Withdrawal {
        transaction,
        commission,
        replayed: false,
    })
}

/// Close a pending deposit or transfer without moving any funds.
#[tracing::instrument(skip(time_source, pool))]
pub async fn reject_transaction(
    admin_id: &UserId,
    transaction_id: &TransactionId,
    reason: Option<&str>,
    time_source: &TimeSource,
    pool: &PgPool,
) -> Result<Transaction, StoreError> {
    let mut tx = pool.begin().await?;

    let pending = lock_pending_tx(transaction_id, &mut tx).await?;
    let note = rejection_note(&pending.note, reason);
    let transaction = finalize_tx(
        transaction_id,
        TransactionStatus::Rejected,
        admin_id,
        &note,
        time_source,
        &mut tx,
    )
    .await?;

    tx.commit().await?;
    tracing::info!("{} {} rejected", transaction.kind, transaction.id);
    Ok(transaction)
}

#[derive(FromRow)]
struct PendingRow {
    #[sqlx(flatten)]
    transaction: Transaction,
    user_name: String,
    user_email: String,
    recipient_name: Option<String>,
    recipient_email: Option<String>,
}

/// Pending deposits and transfers, newest first, with the parties' names.
pub async fn list_pending_transactions(
    pool: &PgPool,
) -> Result<Vec<PendingTransaction>, StoreError> {
    let rows = sqlx::query_as::<_, PendingRow>(
        r#"
        SELECT t.*,
            u.name AS user_name,
            u.email AS user_email,
            r.name AS recipient_name,
            r.email AS recipient_email
        FROM transactions t
        JOIN users u ON u.id = t.user_id
        LEFT JOIN users r ON r.id = t.recipient_id
        WHERE t.status = 'pending'
        ORDER BY t.created_at DESC, t.id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let recipient = match (
                row.transaction.recipient_id,
                row.recipient_name,
                row.recipient_email,
            ) {
                (Some(id), Some(name), Some(email)) => {
                    Some(Party { id, name, email })
                }
                _ => None,
            };
            PendingTransaction {
                user: Party {
                    id: row.transaction.user_id,
                    name: row.user_name,
                    email: row.user_email,
                },
                recipient,
                transaction: row.transaction,
            }
        })
        .collect())
}

#[derive(FromRow)]
struct StatementRow {
    #[sqlx(flatten)]
    transaction: Transaction,
    recipient_name: Option<String>,
    approved_by_name: Option<String>,
}

/// The account and every transaction it sent, received or initiated.
pub async fn get_user_statement(
    user_id: &UserId,
    pool: &PgPool,
) -> Result<UserStatement, StoreError> {
    let user = read_user(pool, user_id).await?;
    let rows = sqlx::query_as::<_, StatementRow>(
        r#"
        SELECT t.*,
            r.name AS recipient_name,
            a.name AS approved_by_name
        FROM transactions t
        LEFT JOIN users r ON r.id = t.recipient_id
        LEFT JOIN users a ON a.id = t.approved_by
        WHERE t.user_id = $1 OR t.recipient_id = $1
        ORDER BY t.created_at DESC, t.id
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(UserStatement {
        user: user.into(),
        transactions: rows
            .into_iter()
            .map(|row| StatementEntry {
                transaction: row.transaction,
                recipient_name: row.recipient_name,
                approved_by_name: row.approved_by_name,
            })
            .collect(),
    })
}

pub async fn list_commissions(
    pool: &PgPool,
) -> Result<Vec<Commission>, StoreError> {
    Ok(sqlx::query_as::<_, Commission>(
        "SELECT * FROM commissions ORDER BY created_at DESC, id",
    )
    .fetch_all(pool)
    .await?)
}

/// Lock a transaction row and require it to be a pending deposit or transfer.
async fn lock_pending_tx(
    transaction_id: &TransactionId,
    tx: &mut DbTransaction<'_>,
) -> Result<Transaction, StoreError> {
    let transaction = sqlx::query_as::<_, Transaction>(
        "SELECT * FROM transactions WHERE id = $1 FOR UPDATE",
    )
    .bind(transaction_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(StoreError::InvalidTransaction("not found"))?;

    if transaction.status.is_terminal() {
        return Err(StoreError::InvalidTransaction("not pending"));
    }
    if transaction.kind == TransactionKind::Withdrawal {
        return Err(StoreError::InvalidTransaction("withdrawals are final"));
    }
    Ok(transaction)
}

/// Lock account rows in ascending id order and return their balances.
///
/// All writers take account locks in the same order, so two operations
/// touching overlapping accounts cannot deadlock.
async fn lock_accounts_tx(
    user_ids: &[UserId],
    tx: &mut DbTransaction<'_>,
) -> Result<HashMap<UserId, Decimal>, StoreError> {
    let mut user_ids = user_ids.to_vec();
    user_ids.sort();
    user_ids.dedup();

    let mut balances = HashMap::with_capacity(user_ids.len());
    for user_id in user_ids {
        let balance = sqlx::query_scalar::<_, Decimal>(
            "SELECT balance FROM users WHERE id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::AccountNotFound)?;
        balances.insert(user_id, balance);
    }
    Ok(balances)
}

async fn read_balance_tx(
    user_id: &UserId,
    tx: &mut DbTransaction<'_>,
) -> Result<Decimal, StoreError> {
    sqlx::query_scalar::<_, Decimal>("SELECT balance FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::AccountNotFound)
}

async fn ensure_account_exists_tx(
    user_id: &UserId,
    tx: &mut DbTransaction<'_>,
) -> Result<(), StoreError> {
    read_balance_tx(user_id, tx).await.map(|_| ())
}

async fn adjust_balance_tx(
    user_id: &UserId,
    delta: Decimal,
    time_source: &TimeSource,
    tx: &mut DbTransaction<'_>,
) -> Result<(), StoreError> {
    let rows_affected = sqlx::query(
        r#"
        UPDATE users
        SET balance = balance + $1, updated_at = $3
        WHERE id = $2
        "#,
    )
    .bind(delta)
    .bind(user_id)
    .bind(time_source.now().to_sqlx())
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if rows_affected == 0 {
        return Err(StoreError::AccountNotFound);
    }
    Ok(())
}

/// Move a locked pending transaction to a terminal status.
async fn finalize_tx(
    transaction_id: &TransactionId,
    status: TransactionStatus,
    admin_id: &UserId,
    note: &str,
    time_source: &TimeSource,
    tx: &mut DbTransaction<'_>,
) -> Result<Transaction, StoreError> {
    sqlx::query_as::<_, Transaction>(
        r#"
        UPDATE transactions
        SET status = $2, approved_by = $3, note = $4, updated_at = $5
        WHERE id = $1 AND status = 'pending'
        RETURNING *
        "#,
    )
    .bind(transaction_id)
    .bind(status)
    .bind(admin_id)
    .bind(note)
    .bind(time_source.now().to_sqlx())
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(StoreError::InvalidTransaction("not pending"))
}

/// If the request carries an idempotency key that was already used, return
/// the transaction it created. A key reused for a different request is an
/// error.
async fn find_replay_tx(
    new: &NewTransaction<'_>,
    tx: &mut DbTransaction<'_>,
) -> Result<Option<Transaction>, StoreError> {
    let Some(key) = new.idempotency_key else {
        return Ok(None);
    };
    let existing = sqlx::query_as::<_, Transaction>(
        "SELECT * FROM transactions WHERE idempotency_key = $1",
    )
    .bind(key)
    .fetch_optional(&mut **tx)
    .await?;

    match existing {
        Some(existing)
            if existing.user_id == *new.user_id
                && existing.kind == new.kind
                && existing.amount == new.amount
                && existing.recipient_id.as_ref() == new.recipient_id =>
        {
            tracing::info!("Replaying {} for idempotency key {key}", existing.id);
            Ok(Some(existing))
        }
        Some(_) => Err(StoreError::IdempotencyKeyReused),
        None => Ok(None),
    }
}

async fn insert_transaction_tx(
    new: &NewTransaction<'_>,
    time_source: &TimeSource,
    tx: &mut DbTransaction<'_>,
) -> Result<Transaction, StoreError> {
    let inserted = sqlx::query_as::<_, Transaction>(
        r#"
        INSERT INTO transactions (
            user_id,
            recipient_id,
            amount,
            kind,
            status,
            approved_by,
            note,
            idempotency_key,
            created_at,
            updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
        ON CONFLICT (idempotency_key) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(new.user_id)
    .bind(new.recipient_id)
    .bind(new.amount)
    .bind(new.kind)
    .bind(new.status)
    .bind(new.approved_by)
    .bind(new.note)
    .bind(new.idempotency_key)
    .bind(time_source.now().to_sqlx())
    .fetch_optional(&mut **tx)
    .await?;

    match inserted {
        Some(transaction) => Ok(transaction),
        // A concurrent request with the same key committed first.
        None => find_replay_tx(new, tx)
            .await?
            .ok_or(StoreError::IdempotencyKeyReused),
    }
}

async fn record_commission_tx(
    transaction_id: &TransactionId,
    amount: Decimal,
    kind: CommissionKind,
    admin_id: Option<&UserId>,
    time_source: &TimeSource,
    tx: &mut DbTransaction<'_>,
) -> Result<Commission, StoreError> {
    Ok(sqlx::query_as::<_, Commission>(
        r#"
        INSERT INTO commissions (transaction_id, amount, kind, admin_id, created_at)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(transaction_id)
    .bind(amount)
    .bind(kind)
    .bind(admin_id)
    .bind(time_source.now().to_sqlx())
    .fetch_one(&mut **tx)
    .await?)
}

async fn read_commission_tx(
    transaction_id: &TransactionId,
    tx: &mut DbTransaction<'_>,
) -> Result<Commission, StoreError> {
    sqlx::query_as::<_, Commission>(
        "SELECT * FROM commissions WHERE transaction_id = $1",
    )
    .bind(transaction_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(StoreError::InvalidTransaction("withdrawal has no commission"))
}
