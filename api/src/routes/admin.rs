//! Approval queue and commission ledger for the admin.
//!
//! `request-transfer` lives under this scope for compatibility with existing
//! clients but only requires an authenticated user.

use actix_web::{HttpResponse, get, post, web};
use payloads::{requests, responses::Envelope};
use sqlx::PgPool;

use crate::auth::{AdminPrincipal, Principal};
use crate::notify::{EventPublisher, LedgerEvent};
use crate::store::ledger;
use crate::time::TimeSource;

use super::{APIError, validation};

#[tracing::instrument(skip(admin, pool), fields(admin_id = %admin.0.user_id))]
#[get("/")]
pub async fn list_commissions(
    admin: AdminPrincipal,
    pool: web::Data<PgPool>,
) -> Result<HttpResponse, APIError> {
    let commissions = ledger::list_commissions(&pool).await?;
    Ok(HttpResponse::Ok().json(Envelope::ok(commissions, "Commissions")))
}

#[tracing::instrument(
    skip(principal, pool, time_source),
    fields(user_id = %principal.user_id)
)]
#[post("/request-transfer")]
pub async fn request_transfer(
    principal: Principal,
    request: web::Json<requests::RequestTransfer>,
    pool: web::Data<PgPool>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    validation(requests::validate_note(request.notes.as_deref()))?;
    let transaction = ledger::request_transfer(
        &principal.user_id,
        &request.recipient_id,
        request.amount,
        request.notes.as_deref(),
        request.idempotency_key,
        &time_source,
        &pool,
    )
    .await?;
    Ok(HttpResponse::Created().json(Envelope::ok(
        transaction,
        "Transfer request submitted. Waiting for admin approval.",
    )))
}

#[tracing::instrument(
    skip(admin, pool, time_source, events),
    fields(admin_id = %admin.0.user_id)
)]
#[post("/approve-deposit")]
pub async fn approve_deposit(
    admin: AdminPrincipal,
    request: web::Json<requests::ApproveTransaction>,
    pool: web::Data<PgPool>,
    time_source: web::Data<TimeSource>,
    events: web::Data<EventPublisher>,
) -> Result<HttpResponse, APIError> {
    let transaction = ledger::approve_deposit(
        &admin.0.user_id,
        &request.transaction_id,
        &time_source,
        &pool,
    )
    .await?;
    events.publish(LedgerEvent::DepositApproved {
        user_id: transaction.user_id,
        amount: transaction.amount,
    });
    Ok(HttpResponse::Ok().json(Envelope::ok(
        transaction,
        "Deposit approved and funds added successfully",
    )))
}

#[tracing::instrument(
    skip(admin, pool, time_source, events),
    fields(admin_id = %admin.0.user_id)
)]
#[post("/approve-transfer")]
pub async fn approve_transfer(
    admin: AdminPrincipal,
    request: web::Json<requests::ApproveTransaction>,
    pool: web::Data<PgPool>,
    time_source: web::Data<TimeSource>,
    events: web::Data<EventPublisher>,
) -> Result<HttpResponse, APIError> {
    let approval = ledger::approve_transfer(
        &admin.0.user_id,
        &request.transaction_id,
        &time_source,
        &pool,
    )
    .await?;
    if let Some(recipient_id) = approval.transaction.recipient_id {
        events.publish(LedgerEvent::TransferApproved {
            sender_id: approval.transaction.user_id,
            recipient_id,
            amount: approval.transaction.amount,
            commission: approval.commission.amount,
        });
    }
    Ok(HttpResponse::Ok().json(Envelope::ok(
        approval.transaction,
        "Transfer approved successfully",
    )))
}

#[tracing::instrument(
    skip(admin, pool, time_source, events),
    fields(admin_id = %admin.0.user_id)
)]
#[post("/reject-transaction")]
pub async fn reject_transaction(
    admin: AdminPrincipal,
    request: web::Json<requests::RejectTransaction>,
    pool: web::Data<PgPool>,
    time_source: web::Data<TimeSource>,
    events: web::Data<EventPublisher>,
) -> Result<HttpResponse, APIError> {
    validation(requests::validate_note(request.reason.as_deref()))?;
    let transaction = ledger::reject_transaction(
        &admin.0.user_id,
        &request.transaction_id,
        request.reason.as_deref(),
        &time_source,
        &pool,
    )
    .await?;
    events.publish(LedgerEvent::TransactionRejected {
        user_id: transaction.user_id,
        kind: transaction.kind,
        amount: transaction.amount,
        note: transaction.note.clone(),
    });
    Ok(HttpResponse::Ok()
        .json(Envelope::ok(transaction, "Transaction rejected")))
}

#[tracing::instrument(skip(admin, pool), fields(admin_id = %admin.0.user_id))]
#[get("/pending-transactions")]
pub async fn pending_transactions(
    admin: AdminPrincipal,
    pool: web::Data<PgPool>,
) -> Result<HttpResponse, APIError> {
    let pending = ledger::list_pending_transactions(&pool).await?;
    Ok(HttpResponse::Ok().json(Envelope::ok(pending, "Pending transactions")))
}
