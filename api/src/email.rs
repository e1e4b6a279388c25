#[cfg(not(feature = "mock-email"))]
use anyhow::Context;
use anyhow::Result;
use payloads::TransactionKind;
#[cfg(not(feature = "mock-email"))]
use resend_rs::{Resend, types::CreateEmailBaseOptions};
use rust_decimal::Decimal;
#[cfg(not(feature = "mock-email"))]
use secrecy::ExposeSecret;
use secrecy::SecretBox;
#[cfg(feature = "mock-email")]
use std::sync::{
    Mutex,
    atomic::{AtomicBool, Ordering},
};

pub struct EmailService {
    #[cfg(not(feature = "mock-email"))]
    client: Resend,
    from_address: String,
    /// Prefix for links in emails, e.g. the password reset page.
    base_url: String,
    #[cfg(feature = "mock-email")]
    outbox: Mutex<Vec<SentEmail>>,
    #[cfg(feature = "mock-email")]
    fail_sends: AtomicBool,
}

#[derive(Debug)]
pub struct EmailTemplate {
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

/// An email captured instead of sent when `mock-email` is enabled.
#[cfg(feature = "mock-email")]
#[derive(Debug, Clone)]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
    pub text_body: String,
}

impl EmailService {
    #[cfg(not(feature = "mock-email"))]
    pub fn new(
        api_key: &SecretBox<String>,
        from_address: String,
        base_url: String,
    ) -> Self {
        let client = Resend::new(api_key.expose_secret());
        Self {
            client,
            from_address,
            base_url,
        }
    }

    #[cfg(feature = "mock-email")]
    pub fn new(
        _api_key: &SecretBox<String>,
        from_address: String,
        base_url: String,
    ) -> Self {
        Self {
            from_address,
            base_url,
            outbox: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        }
    }

    #[cfg(not(feature = "mock-email"))]
    #[tracing::instrument(skip(self, template), fields(to = %to_email))]
    pub async fn send_email(
        &self,
        to_email: &str,
        template: EmailTemplate,
    ) -> Result<()> {
        let email = CreateEmailBaseOptions::new(
            &self.from_address,
            [to_email],
            &template.subject,
        )
        .with_html(&template.html_body)
        .with_text(&template.text_body);

        self.client
            .emails
            .send(email)
            .await
            .context("Failed to send email via Resend")?;

        tracing::info!("Email sent successfully");
        Ok(())
    }

    #[cfg(feature = "mock-email")]
    #[tracing::instrument(skip(self, template), fields(to = %to_email))]
    pub async fn send_email(
        &self,
        to_email: &str,
        template: EmailTemplate,
    ) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("Mock email delivery failure");
        }
        tracing::info!(
            "Mock email to: {} from: {} with subject: {}",
            to_email,
            self.from_address,
            template.subject
        );
        self.outbox
            .lock()
            .map_err(|_| anyhow::anyhow!("Mock outbox poisoned"))?
            .push(SentEmail {
                to: to_email.to_string(),
                subject: template.subject,
                text_body: template.text_body,
            });
        Ok(())
    }

    /// Everything "sent" so far, oldest first.
    #[cfg(feature = "mock-email")]
    pub fn sent_emails(&self) -> Vec<SentEmail> {
        self.outbox
            .lock()
            .map(|outbox| outbox.clone())
            .unwrap_or_default()
    }

    /// Make subsequent sends fail, to exercise delivery error handling.
    #[cfg(feature = "mock-email")]
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    #[tracing::instrument(skip(self, reset_token))]
    pub async fn send_password_reset_email(
        &self,
        to_email: &str,
        name: &str,
        reset_token: &str,
    ) -> Result<()> {
        let reset_link =
            format!("{}/reset-password?token={}", self.base_url, reset_token);

        let template = EmailTemplate {
            subject: "Reset your password".to_string(),
            html_body: format!(
                r#"
                <h2>Password Reset Request</h2>
                <p>Hi {name},</p>
                <p>We received a request to reset the password for your wallet account.</p>
                <p><a href="{reset_link}" style="background-color: #dc3545; color: white; padding: 10px 20px; text-decoration: none; border-radius: 5px;">Reset Password</a></p>
                <p>Or copy and paste this link in your browser:</p>
                <p>{reset_link}</p>
                <p>This link will expire in 1 hour.</p>
                <p>If you didn't request this password reset, you can safely ignore this email. Your password will not be changed.</p>
                "#,
            ),
            text_body: format!(
                r#"
Password Reset Request

Hi {name},

We received a request to reset the password for your wallet account.

Please visit the following link to reset your password:

{reset_link}

This link will expire in 1 hour.

If you didn't request this password reset, you can safely ignore this email. Your password will not be changed.
                "#,
            ),
        };

        self.send_email(to_email, template).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn send_deposit_approved_email(
        &self,
        to_email: &str,
        name: &str,
        amount: Decimal,
        new_balance: Decimal,
    ) -> Result<()> {
        let template = EmailTemplate {
            subject: "Your deposit has been approved".to_string(),
            html_body: format!(
                r#"
                <h2>Deposit approved</h2>
                <p>Hi {name},</p>
                <p>Your deposit of <strong>{amount}</strong> has been approved and credited to your account.</p>
                <p>Your balance is now <strong>{new_balance}</strong>.</p>
                "#,
            ),
            text_body: format!(
                r#"
Deposit approved

Hi {name},

Your deposit of {amount} has been approved and credited to your account.

Your balance is now {new_balance}.
                "#,
            ),
        };

        self.send_email(to_email, template).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn send_transfer_sent_email(
        &self,
        to_email: &str,
        name: &str,
        recipient_name: &str,
        amount: Decimal,
        commission: Decimal,
    ) -> Result<()> {
        let template = EmailTemplate {
            subject: "Your transfer has been approved".to_string(),
            html_body: format!(
                r#"
                <h2>Transfer approved</h2>
                <p>Hi {name},</p>
                <p>Your transfer of <strong>{amount}</strong> to {recipient_name} has been approved.</p>
                <p>A commission of {commission} was charged on this transfer.</p>
                "#,
            ),
            text_body: format!(
                r#"
Transfer approved

Hi {name},

Your transfer of {amount} to {recipient_name} has been approved.

A commission of {commission} was charged on this transfer.
                "#,
            ),
        };

        self.send_email(to_email, template).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn send_transfer_received_email(
        &self,
        to_email: &str,
        name: &str,
        sender_name: &str,
        amount: Decimal,
    ) -> Result<()> {
        let template = EmailTemplate {
            subject: "You have received funds".to_string(),
            html_body: format!(
                r#"
                <h2>Funds received</h2>
                <p>Hi {name},</p>
                <p>{sender_name} sent you <strong>{amount}</strong>. The funds are now in your account.</p>
                "#,
            ),
            text_body: format!(
                r#"
Funds received

Hi {name},

{sender_name} sent you {amount}. The funds are now in your account.
                "#,
            ),
        };

        self.send_email(to_email, template).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn send_withdrawal_email(
        &self,
        to_email: &str,
        name: &str,
        amount: Decimal,
        withdrawn_amount: Decimal,
    ) -> Result<()> {
        let commission = amount - withdrawn_amount;
        let template = EmailTemplate {
            subject: "Your withdrawal has been processed".to_string(),
            html_body: format!(
                r#"
                <h2>Withdrawal processed</h2>
                <p>Hi {name},</p>
                <p>We processed your withdrawal of <strong>{amount}</strong>.</p>
                <p>After a commission of {commission}, <strong>{withdrawn_amount}</strong> has been paid out.</p>
                "#,
            ),
            text_body: format!(
                r#"
Withdrawal processed

Hi {name},

We processed your withdrawal of {amount}.

After a commission of {commission}, {withdrawn_amount} has been paid out.
                "#,
            ),
        };

        self.send_email(to_email, template).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn send_rejection_email(
        &self,
        to_email: &str,
        name: &str,
        kind: TransactionKind,
        amount: Decimal,
        note: &str,
    ) -> Result<()> {
        let template = EmailTemplate {
            subject: format!("Your {kind} request was rejected"),
            html_body: format!(
                r#"
                <h2>Request rejected</h2>
                <p>Hi {name},</p>
                <p>Your {kind} request for <strong>{amount}</strong> was rejected. No funds were moved.</p>
                <p>Note: {note}</p>
                "#,
            ),
            text_body: format!(
                r#"
Request rejected

Hi {name},

Your {kind} request for {amount} was rejected. No funds were moved.

Note: {note}
                "#,
            ),
        };

        self.send_email(to_email, template).await
    }
}
