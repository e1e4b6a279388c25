//! Balance effects of deposits, transfers and withdrawals.

use api::store::ledger::{MAX_AMOUNT, MAX_BALANCE};
use payloads::{
    CommissionKind, IdempotencyKey, TransactionKind, TransactionStatus,
    requests::{
        ApproveTransaction, ProcessWithdrawal, RequestAddFunds,
        RequestTransfer,
    },
};
use reqwest::StatusCode;
use rust_decimal::{Decimal, dec};
use uuid::Uuid;

use test_helpers::{assert_api_error, assert_status_code, spawn_app};

fn add_funds(amount: Decimal) -> RequestAddFunds {
    RequestAddFunds {
        amount,
        notes: None,
        idempotency_key: None,
    }
}

fn withdrawal(amount: Decimal) -> ProcessWithdrawal {
    ProcessWithdrawal {
        amount,
        notes: None,
        idempotency_key: None,
    }
}

fn transfer(
    recipient: &test_helpers::TestUser,
    amount: Decimal,
) -> RequestTransfer {
    RequestTransfer {
        recipient_id: recipient.id(),
        amount,
        notes: None,
        idempotency_key: None,
    }
}

#[tokio::test]
async fn withdrawal_takes_commission() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let admin = app.create_admin_user().await?;
    let alice = app.create_alice_user().await?;

    let result = alice.client.process_withdrawal(&withdrawal(dec!(100))).await?;
    assert_eq!(result.withdrawn_amount, dec!(97));
    assert_eq!(result.transaction.amount, dec!(100));
    assert_eq!(result.transaction.kind, TransactionKind::Withdrawal);
    assert_eq!(result.transaction.status, TransactionStatus::Approved);
    assert_eq!(result.transaction.note, "-");

    assert_eq!(app.balance_of(&alice.id()).await?, dec!(900));
    assert_eq!(app.balance_of(&admin.id()).await?, dec!(1003));

    let commissions = admin.client.list_commissions().await?;
    assert_eq!(commissions.len(), 1);
    assert_eq!(commissions[0].amount, dec!(3));
    assert_eq!(commissions[0].kind, CommissionKind::Withdrawal);
    assert_eq!(commissions[0].transaction_id, result.transaction.id);
    assert_eq!(commissions[0].admin_id, Some(admin.id()));

    Ok(())
}

#[tokio::test]
async fn withdrawal_without_treasury_still_records_commission()
-> anyhow::Result<()> {
    let app = spawn_app().await;
    let alice = app.create_alice_user().await?;

    let result = alice.client.process_withdrawal(&withdrawal(dec!(100))).await?;
    assert_eq!(result.withdrawn_amount, dec!(97));
    assert_eq!(app.balance_of(&alice.id()).await?, dec!(900));
    assert_eq!(app.commission_count().await?, 1);

    Ok(())
}

#[tokio::test]
async fn withdrawal_of_entire_balance() -> anyhow::Result<()> {
    let app = spawn_app().await;
    app.create_admin_user().await?;
    let alice = app.create_alice_user().await?;

    alice
        .client
        .process_withdrawal(&withdrawal(dec!(1000)))
        .await?;
    assert_eq!(app.balance_of(&alice.id()).await?, dec!(0));

    let result = alice.client.process_withdrawal(&withdrawal(dec!(0.01))).await;
    assert_api_error(result, StatusCode::BAD_REQUEST, "Insufficient balance");

    Ok(())
}

#[tokio::test]
async fn withdrawal_above_balance_changes_nothing() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let admin = app.create_admin_user().await?;
    let alice = app.create_alice_user().await?;

    let result = alice
        .client
        .process_withdrawal(&withdrawal(dec!(1000.01)))
        .await;
    assert_api_error(result, StatusCode::BAD_REQUEST, "Insufficient balance");

    assert_eq!(app.balance_of(&alice.id()).await?, dec!(1000));
    assert_eq!(app.balance_of(&admin.id()).await?, dec!(1000));
    assert_eq!(app.transaction_count().await?, 0);
    assert_eq!(app.commission_count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn transfer_waits_for_approval() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let admin = app.create_admin_user().await?;
    let alice = app.create_alice_user().await?;
    let bob = app.create_bob_user().await?;
    app.set_balance(&alice.id(), dec!(500)).await?;
    app.set_balance(&bob.id(), dec!(200)).await?;

    let requested = alice.client.request_transfer(&transfer(&bob, dec!(100))).await?;
    assert_eq!(requested.status, TransactionStatus::Pending);
    assert_eq!(requested.kind, TransactionKind::Transfer);
    assert_eq!(requested.recipient_id, Some(bob.id()));
    assert_eq!(app.balance_of(&alice.id()).await?, dec!(500));
    assert_eq!(app.balance_of(&bob.id()).await?, dec!(200));

    let approved = admin
        .client
        .approve_transfer(&ApproveTransaction {
            transaction_id: requested.id,
        })
        .await?;
    assert_eq!(approved.status, TransactionStatus::Approved);
    assert_eq!(approved.approved_by, Some(admin.id()));

    assert_eq!(app.balance_of(&alice.id()).await?, dec!(400));
    assert_eq!(app.balance_of(&bob.id()).await?, dec!(300));
    assert_eq!(app.balance_of(&admin.id()).await?, dec!(1003));

    let commissions = admin.client.list_commissions().await?;
    assert_eq!(commissions.len(), 1);
    assert_eq!(commissions[0].amount, dec!(3));
    assert_eq!(commissions[0].kind, CommissionKind::Transfer);

    Ok(())
}

#[tokio::test]
async fn approval_fails_when_sender_balance_dropped() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let admin = app.create_admin_user().await?;
    let alice = app.create_alice_user().await?;
    let bob = app.create_bob_user().await?;
    app.set_balance(&alice.id(), dec!(150)).await?;

    let requested = alice.client.request_transfer(&transfer(&bob, dec!(100))).await?;
    alice.client.process_withdrawal(&withdrawal(dec!(100))).await?;
    let admin_before = app.balance_of(&admin.id()).await?;

    let result = admin
        .client
        .approve_transfer(&ApproveTransaction {
            transaction_id: requested.id,
        })
        .await;
    assert_api_error(result, StatusCode::BAD_REQUEST, "Insufficient balance");

    assert_eq!(app.balance_of(&alice.id()).await?, dec!(50));
    assert_eq!(app.balance_of(&bob.id()).await?, dec!(1000));
    assert_eq!(app.balance_of(&admin.id()).await?, admin_before);

    let pending = admin.client.pending_transactions().await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].transaction.id, requested.id);
    assert_eq!(pending[0].transaction.status, TransactionStatus::Pending);

    Ok(())
}

#[tokio::test]
async fn deposit_cannot_be_approved_twice() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let admin = app.create_admin_user().await?;
    let alice = app.create_alice_user().await?;

    let deposit = alice.client.request_add_funds(&add_funds(dec!(250))).await?;
    assert_eq!(deposit.status, TransactionStatus::Pending);
    assert_eq!(app.balance_of(&alice.id()).await?, dec!(1000));

    let approve = ApproveTransaction {
        transaction_id: deposit.id,
    };
    let approved = admin.client.approve_deposit(&approve).await?;
    assert_eq!(approved.status, TransactionStatus::Approved);
    assert_eq!(app.balance_of(&alice.id()).await?, dec!(1250));

    let result = admin.client.approve_deposit(&approve).await;
    assert_api_error(
        result,
        StatusCode::BAD_REQUEST,
        "Invalid transaction: not pending",
    );
    assert_eq!(app.balance_of(&alice.id()).await?, dec!(1250));

    // Deposits carry no commission.
    assert_eq!(app.commission_count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn approvals_check_the_transaction_kind() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let admin = app.create_admin_user().await?;
    let alice = app.create_alice_user().await?;
    let bob = app.create_bob_user().await?;

    let deposit = alice.client.request_add_funds(&add_funds(dec!(10))).await?;
    let result = admin
        .client
        .approve_transfer(&ApproveTransaction {
            transaction_id: deposit.id,
        })
        .await;
    assert_api_error(
        result,
        StatusCode::BAD_REQUEST,
        "Invalid transaction: not a transfer",
    );

    let requested = alice.client.request_transfer(&transfer(&bob, dec!(10))).await?;
    let result = admin
        .client
        .approve_deposit(&ApproveTransaction {
            transaction_id: requested.id,
        })
        .await;
    assert_api_error(
        result,
        StatusCode::BAD_REQUEST,
        "Invalid transaction: not a deposit",
    );

    let result = admin
        .client
        .approve_deposit(&ApproveTransaction {
            transaction_id: payloads::TransactionId(Uuid::new_v4()),
        })
        .await;
    assert_api_error(
        result,
        StatusCode::BAD_REQUEST,
        "Invalid transaction: not found",
    );

    let withdrawn = alice.client.process_withdrawal(&withdrawal(dec!(10))).await?;
    let result = admin
        .client
        .reject_transaction(&payloads::requests::RejectTransaction {
            transaction_id: withdrawn.transaction.id,
            reason: None,
        })
        .await;
    assert_status_code(result, StatusCode::BAD_REQUEST);

    Ok(())
}

#[tokio::test]
async fn amounts_must_be_positive() -> anyhow::Result<()> {
    let app = spawn_app().await;
    app.create_admin_user().await?;
    let alice = app.create_alice_user().await?;
    let bob = app.create_bob_user().await?;

    for amount in [dec!(0), dec!(-5)] {
        let result = alice.client.request_add_funds(&add_funds(amount)).await;
        assert_api_error(
            result,
            StatusCode::BAD_REQUEST,
            "Amount must be positive",
        );
        let result = alice.client.process_withdrawal(&withdrawal(amount)).await;
        assert_api_error(
            result,
            StatusCode::BAD_REQUEST,
            "Amount must be positive",
        );
        let result = alice.client.request_transfer(&transfer(&bob, amount)).await;
        assert_api_error(
            result,
            StatusCode::BAD_REQUEST,
            "Amount must be positive",
        );
    }

    assert_eq!(app.transaction_count().await?, 0);
    assert_eq!(app.balance_of(&alice.id()).await?, dec!(1000));

    Ok(())
}

#[tokio::test]
async fn amounts_are_bounded() -> anyhow::Result<()> {
    let app = spawn_app().await;
    app.create_admin_user().await?;
    let alice = app.create_alice_user().await?;
    let bob = app.create_bob_user().await?;

    let too_large = "Amount exceeds the maximum of 1000000000";
    for amount in [MAX_AMOUNT + dec!(1), Decimal::MAX] {
        let result = alice.client.request_add_funds(&add_funds(amount)).await;
        assert_api_error(result, StatusCode::BAD_REQUEST, too_large);
        let result = alice.client.process_withdrawal(&withdrawal(amount)).await;
        assert_api_error(result, StatusCode::BAD_REQUEST, too_large);
        let result = alice.client.request_transfer(&transfer(&bob, amount)).await;
        assert_api_error(result, StatusCode::BAD_REQUEST, too_large);
    }

    let result = alice
        .client
        .request_add_funds(&add_funds(dec!(0.00001)))
        .await;
    assert_api_error(
        result,
        StatusCode::BAD_REQUEST,
        "Amount has more than 4 decimal places",
    );

    assert_eq!(app.transaction_count().await?, 0);
    assert_eq!(app.balance_of(&alice.id()).await?, dec!(1000));

    Ok(())
}

#[tokio::test]
async fn credits_stop_at_the_balance_ceiling() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let admin = app.create_admin_user().await?;
    let alice = app.create_alice_user().await?;
    let near_ceiling = MAX_BALANCE - dec!(10);
    app.set_balance(&alice.id(), near_ceiling).await?;

    let deposit = alice.client.request_add_funds(&add_funds(MAX_AMOUNT)).await?;
    let result = admin
        .client
        .approve_deposit(&ApproveTransaction {
            transaction_id: deposit.id,
        })
        .await;
    assert_api_error(result, StatusCode::BAD_REQUEST, "Balance limit exceeded");
    assert_eq!(app.balance_of(&alice.id()).await?, near_ceiling);

    let pending = admin.client.pending_transactions().await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].transaction.id, deposit.id);

    // The account stays readable and usable.
    let result = alice.client.process_withdrawal(&withdrawal(dec!(1))).await?;
    assert_eq!(result.withdrawn_amount, dec!(0.97));
    assert_eq!(
        app.balance_of(&alice.id()).await?,
        near_ceiling - dec!(1)
    );

    Ok(())
}

#[tokio::test]
async fn transfer_request_checks() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let alice = app.create_alice_user().await?;
    let bob = app.create_bob_user().await?;

    let result = alice.client.request_transfer(&transfer(&alice, dec!(10))).await;
    assert_api_error(
        result,
        StatusCode::BAD_REQUEST,
        "Cannot transfer funds to yourself",
    );

    let result = alice
        .client
        .request_transfer(&transfer(&bob, dec!(1000.01)))
        .await;
    assert_api_error(result, StatusCode::BAD_REQUEST, "Insufficient balance");

    let result = alice
        .client
        .request_transfer(&RequestTransfer {
            recipient_id: payloads::UserId(Uuid::new_v4()),
            amount: dec!(10),
            notes: None,
            idempotency_key: None,
        })
        .await;
    assert_api_error(result, StatusCode::NOT_FOUND, "Account not found");

    let result = alice
        .client
        .request_transfer(&RequestTransfer {
            notes: Some("x".repeat(501)),
            ..transfer(&bob, dec!(10))
        })
        .await;
    assert_status_code(result, StatusCode::BAD_REQUEST);

    assert_eq!(app.transaction_count().await?, 0);

    Ok(())
}

/// Commission is credited on top of the transferred amount, so every
/// approved transfer adds its commission to the sum of all balances.
#[tokio::test]
async fn transfer_commission_is_additive() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let admin = app.create_admin_user().await?;
    let alice = app.create_alice_user().await?;
    let bob = app.create_bob_user().await?;
    let total_before = app.total_balance().await?;

    let requested = alice.client.request_transfer(&transfer(&bob, dec!(200))).await?;
    admin
        .client
        .approve_transfer(&ApproveTransaction {
            transaction_id: requested.id,
        })
        .await?;

    assert_eq!(app.balance_of(&alice.id()).await?, dec!(800));
    assert_eq!(app.balance_of(&bob.id()).await?, dec!(1200));
    assert_eq!(app.total_balance().await?, total_before + dec!(6));

    // Withdrawals move the commission out of the user's debit instead.
    alice.client.process_withdrawal(&withdrawal(dec!(100))).await?;
    assert_eq!(
        app.total_balance().await?,
        total_before + dec!(6) - dec!(97)
    );

    Ok(())
}

#[tokio::test]
async fn fractional_amounts_are_exact() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let admin = app.create_admin_user().await?;
    let alice = app.create_alice_user().await?;

    let result = alice
        .client
        .process_withdrawal(&withdrawal(dec!(33.33)))
        .await?;
    assert_eq!(result.withdrawn_amount, dec!(32.3301));
    assert_eq!(app.balance_of(&alice.id()).await?, dec!(966.67));
    assert_eq!(app.balance_of(&admin.id()).await?, dec!(1000.9999));

    Ok(())
}

#[tokio::test]
async fn rejection_closes_without_moving_funds() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let admin = app.create_admin_user().await?;
    let alice = app.create_alice_user().await?;
    let bob = app.create_bob_user().await?;

    let deposit = alice
        .client
        .request_add_funds(&RequestAddFunds {
            notes: Some("bank wire".into()),
            ..add_funds(dec!(50))
        })
        .await?;
    let rejected = admin
        .client
        .reject_transaction(&payloads::requests::RejectTransaction {
            transaction_id: deposit.id,
            reason: Some("no matching wire".into()),
        })
        .await?;
    assert_eq!(rejected.status, TransactionStatus::Rejected);
    assert_eq!(rejected.note, "bank wire | Rejected: no matching wire");
    assert_eq!(rejected.approved_by, Some(admin.id()));

    let requested = alice.client.request_transfer(&transfer(&bob, dec!(10))).await?;
    let rejected = admin
        .client
        .reject_transaction(&payloads::requests::RejectTransaction {
            transaction_id: requested.id,
            reason: None,
        })
        .await?;
    assert_eq!(rejected.status, TransactionStatus::Rejected);

    // A rejected transaction can no longer be approved.
    let result = admin
        .client
        .approve_transfer(&ApproveTransaction {
            transaction_id: requested.id,
        })
        .await;
    assert_status_code(result, StatusCode::BAD_REQUEST);

    assert_eq!(app.balance_of(&alice.id()).await?, dec!(1000));
    assert_eq!(app.balance_of(&bob.id()).await?, dec!(1000));
    assert!(admin.client.pending_transactions().await?.is_empty());
    assert_eq!(app.commission_count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn idempotent_requests_replay() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let admin = app.create_admin_user().await?;
    let alice = app.create_alice_user().await?;
    let bob = app.create_bob_user().await?;

    let key = Some(IdempotencyKey(Uuid::new_v4()));
    let body = ProcessWithdrawal {
        idempotency_key: key,
        ..withdrawal(dec!(100))
    };
    let first = alice.client.process_withdrawal(&body).await?;
    let second = alice.client.process_withdrawal(&body).await?;
    assert_eq!(first.transaction.id, second.transaction.id);
    assert_eq!(second.withdrawn_amount, dec!(97));
    assert_eq!(app.balance_of(&alice.id()).await?, dec!(900));
    assert_eq!(app.commission_count().await?, 1);

    // Emails go out in event order, so the deposit email arriving second
    // means the replay published nothing.
    app.fund(&alice, &admin, dec!(10)).await?;
    let emails = app.wait_for_emails(alice.email(), 2).await;
    let subjects: Vec<_> =
        emails.iter().map(|email| email.subject.as_str()).collect();
    assert_eq!(
        subjects,
        [
            "Your withdrawal has been processed",
            "Your deposit has been approved"
        ]
    );

    // Same key, different request.
    let result = alice
        .client
        .process_withdrawal(&ProcessWithdrawal {
            idempotency_key: key,
            ..withdrawal(dec!(50))
        })
        .await;
    assert_api_error(
        result,
        StatusCode::BAD_REQUEST,
        "Idempotency key was already used for a different request",
    );

    let key = Some(IdempotencyKey(Uuid::new_v4()));
    let body = RequestTransfer {
        idempotency_key: key,
        ..transfer(&bob, dec!(20))
    };
    let first = alice.client.request_transfer(&body).await?;
    let second = alice.client.request_transfer(&body).await?;
    assert_eq!(first.id, second.id);

    // Another user may not replay someone else's key.
    let result = bob
        .client
        .request_add_funds(&RequestAddFunds {
            idempotency_key: key,
            ..add_funds(dec!(20))
        })
        .await;
    assert_status_code(result, StatusCode::BAD_REQUEST);

    assert_eq!(app.transaction_count().await?, 3);

    Ok(())
}

#[tokio::test]
async fn statement_lists_both_sides_of_a_transfer() -> anyhow::Result<()> {
    let app = spawn_app().await;
    let admin = app.create_admin_user().await?;
    let alice = app.create_alice_user().await?;
    let bob = app.create_bob_user().await?;

    app.fund(&alice, &admin, dec!(40)).await?;
    let requested = alice.client.request_transfer(&transfer(&bob, dec!(25))).await?;
    admin
        .client
        .approve_transfer(&ApproveTransaction {
            transaction_id: requested.id,
        })
        .await?;

    let statement = alice.client.user_profile().await?;
    assert_eq!(statement.user.balance, dec!(1015));
    assert_eq!(statement.transactions.len(), 2);
    let entry = statement
        .transactions
        .iter()
        .find(|entry| entry.transaction.id == requested.id)
        .expect("transfer is on the sender's statement");
    assert_eq!(entry.recipient_name.as_deref(), Some("Bob"));
    assert_eq!(entry.approved_by_name.as_deref(), Some("Admin"));

    let statement = bob.client.user_profile().await?;
    assert_eq!(statement.user.balance, dec!(1025));
    assert_eq!(statement.transactions.len(), 1);
    assert_eq!(statement.transactions[0].transaction.id, requested.id);

    Ok(())
}
