use crate::{IdempotencyKey, TransactionId, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const EMAIL_MAX_LEN: usize = 255;
pub const NAME_MAX_LEN: usize = 255;
pub const NOTE_MAX_LEN: usize = 500;
pub const PASSWORD_MIN_LEN: usize = 8;

/// Validate the fields of a new or updated account, returning a message
/// suitable for display if any are invalid.
pub fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.trim().is_empty() {
        return Err("Name is required.");
    }
    if name.len() > NAME_MAX_LEN {
        return Err("Name must be at most 255 characters.");
    }
    Ok(())
}

/// Loose structural check; deliverability is not our concern.
pub fn validate_email(email: &str) -> Result<(), &'static str> {
    if email.len() > EMAIL_MAX_LEN {
        return Err("Email must be at most 255 characters.");
    }
    let Some((local, domain)) = email.split_once('@') else {
        return Err("The email must be in a valid format.");
    };
    if local.is_empty()
        || domain.is_empty()
        || !domain.contains('.')
        || email.chars().any(char::is_whitespace)
    {
        return Err("The email must be in a valid format.");
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), &'static str> {
    if password.len() < PASSWORD_MIN_LEN {
        return Err("Password must be at least 8 characters long.");
    }
    Ok(())
}

pub fn validate_note(note: Option<&str>) -> Result<(), &'static str> {
    match note {
        Some(note) if note.len() > NOTE_MAX_LEN => {
            Err("Note must be at most 500 characters.")
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Register {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginCredentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateProfile {
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgotPassword {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetPassword {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePassword {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestAddFunds {
    pub amount: Decimal,
    pub notes: Option<String>,
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessWithdrawal {
    pub amount: Decimal,
    pub notes: Option<String>,
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTransfer {
    pub recipient_id: UserId,
    pub amount: Decimal,
    pub notes: Option<String>,
    pub idempotency_key: Option<IdempotencyKey>,
}

/// Body for approving a pending deposit or transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveTransaction {
    pub transaction_id: TransactionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectTransaction {
    pub transaction_id: TransactionId,
    pub reason: Option<String>,
}
