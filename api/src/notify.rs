//! Post-commit notifications.
//!
//! Routes publish a `LedgerEvent` after an operation commits. The `Notifier`
//! runs as its own task, looks up the parties and sends email. Delivery
//! failures are logged and never reach the request that caused them.

use anyhow::Context;
use payloads::{TransactionKind, UserId};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{email::EmailService, store, telemetry::log_error};

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEvent {
    DepositApproved {
        user_id: UserId,
        amount: Decimal,
    },
    TransferApproved {
        sender_id: UserId,
        recipient_id: UserId,
        amount: Decimal,
        commission: Decimal,
    },
    WithdrawalProcessed {
        user_id: UserId,
        amount: Decimal,
        withdrawn_amount: Decimal,
    },
    TransactionRejected {
        user_id: UserId,
        kind: TransactionKind,
        amount: Decimal,
        note: String,
    },
}

/// Sending half handed to routes. Publishing never blocks.
#[derive(Clone)]
pub struct EventPublisher {
    sender: mpsc::UnboundedSender<LedgerEvent>,
}

impl EventPublisher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LedgerEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn publish(&self, event: LedgerEvent) {
        if let Err(e) = self.sender.send(event) {
            tracing::warn!("Notifier is not running; dropped {:?}", e.0);
        }
    }
}

pub struct Notifier {
    pool: PgPool,
    email_service: Arc<EmailService>,
    events: mpsc::UnboundedReceiver<LedgerEvent>,
}

impl Notifier {
    pub fn new(
        pool: PgPool,
        email_service: Arc<EmailService>,
        events: mpsc::UnboundedReceiver<LedgerEvent>,
    ) -> Self {
        Self {
            pool,
            email_service,
            events,
        }
    }

    /// Deliver events until every publisher has been dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            let _ = self.handle(&event).await.map_err(log_error);
        }
        tracing::info!("Notifier stopped");
    }

    #[tracing::instrument(skip(self))]
    async fn handle(&self, event: &LedgerEvent) -> anyhow::Result<()> {
        let delivered = match event {
            LedgerEvent::DepositApproved { user_id, amount } => {
                let user = self.read_user(user_id).await?;
                self.email_service
                    .send_deposit_approved_email(
                        &user.email,
                        &user.name,
                        *amount,
                        user.balance,
                    )
                    .await
            }
            LedgerEvent::TransferApproved {
                sender_id,
                recipient_id,
                amount,
                commission,
            } => {
                let sender = self.read_user(sender_id).await?;
                let recipient = self.read_user(recipient_id).await?;
                // Attempt both deliveries before reporting a failure.
                let sent = self
                    .email_service
                    .send_transfer_sent_email(
                        &sender.email,
                        &sender.name,
                        &recipient.name,
                        *amount,
                        *commission,
                    )
                    .await;
                let received = self
                    .email_service
                    .send_transfer_received_email(
                        &recipient.email,
                        &recipient.name,
                        &sender.name,
                        *amount,
                    )
                    .await;
                sent.and(received)
            }
            LedgerEvent::WithdrawalProcessed {
                user_id,
                amount,
                withdrawn_amount,
            } => {
                let user = self.read_user(user_id).await?;
                self.email_service
                    .send_withdrawal_email(
                        &user.email,
                        &user.name,
                        *amount,
                        *withdrawn_amount,
                    )
                    .await
            }
            LedgerEvent::TransactionRejected {
                user_id,
                kind,
                amount,
                note,
            } => {
                let user = self.read_user(user_id).await?;
                self.email_service
                    .send_rejection_email(
                        &user.email,
                        &user.name,
                        *kind,
                        *amount,
                        note,
                    )
                    .await
            }
        };
        delivered
            .with_context(|| format!("Failed to deliver notification {event:?}"))
    }

    async fn read_user(&self, user_id: &UserId) -> anyhow::Result<store::User> {
        store::read_user(&self.pool, user_id)
            .await
            .with_context(|| format!("Failed to look up user {user_id}"))
    }
}
