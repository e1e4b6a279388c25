use actix_web::{HttpResponse, post, web};
use payloads::{
    requests,
    responses::{Envelope, WithdrawalResult},
};
use sqlx::PgPool;

use crate::auth::Principal;
use crate::notify::{EventPublisher, LedgerEvent};
use crate::store::ledger;
use crate::time::TimeSource;

use super::{APIError, validation};

#[tracing::instrument(
    skip(principal, pool, time_source),
    fields(user_id = %principal.user_id)
)]
#[post("/request-add-funds")]
pub async fn request_add_funds(
    principal: Principal,
    request: web::Json<requests::RequestAddFunds>,
    pool: web::Data<PgPool>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, APIError> {
    validation(requests::validate_note(request.notes.as_deref()))?;
    let transaction = ledger::request_deposit(
        &principal.user_id,
        request.amount,
        request.notes.as_deref(),
        request.idempotency_key,
        &time_source,
        &pool,
    )
    .await?;
    Ok(HttpResponse::Created().json(Envelope::ok(
        transaction,
        "Add funds request submitted. Waiting for admin approval.",
    )))
}

#[tracing::instrument(
    skip(principal, pool, time_source, events),
    fields(user_id = %principal.user_id)
)]
#[post("/process-withdrawal")]
pub async fn process_withdrawal(
    principal: Principal,
    request: web::Json<requests::ProcessWithdrawal>,
    pool: web::Data<PgPool>,
    time_source: web::Data<TimeSource>,
    events: web::Data<EventPublisher>,
) -> Result<HttpResponse, APIError> {
    validation(requests::validate_note(request.notes.as_deref()))?;
    let withdrawal = ledger::process_withdrawal(
        &principal.user_id,
        request.amount,
        request.notes.as_deref(),
        request.idempotency_key,
        &time_source,
        &pool,
    )
    .await?;

    let withdrawn_amount = withdrawal.withdrawn_amount();
    if !withdrawal.replayed {
        events.publish(LedgerEvent::WithdrawalProcessed {
            user_id: principal.user_id,
            amount: withdrawal.transaction.amount,
            withdrawn_amount,
        });
    }

    Ok(HttpResponse::Ok().json(Envelope::ok(
        WithdrawalResult {
            withdrawn_amount,
            transaction: withdrawal.transaction,
        },
        "Withdrawal processed successfully",
    )))
}
