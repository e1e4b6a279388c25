use crate::{
    Commission, Transaction, requests,
    responses::{
        self, AuthSession, Envelope, PendingTransaction, TokenPair,
        UserStatement, WithdrawalResult,
    },
};
use reqwest::StatusCode;
use serde::Serialize;
use std::sync::{Mutex, PoisonError};

type ReqwestResult = Result<reqwest::Response, reqwest::Error>;

/// An API client for interfacing with the backend.
///
/// Holds the access token of the last successful login or registration and
/// attaches it as a bearer token to every request.
pub struct APIClient {
    pub address: String,
    pub inner_client: reqwest::Client,
    access_token: Mutex<Option<String>>,
}

/// Helper methods for http actions
impl APIClient {
    pub fn new(address: String, inner_client: reqwest::Client) -> Self {
        Self {
            address,
            inner_client,
            access_token: Mutex::new(None),
        }
    }

    pub fn set_access_token(&self, token: Option<String>) {
        *self
            .access_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub fn access_token(&self) -> Option<String> {
        self.access_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn format_url(&self, path: &str) -> String {
        format!("{}/api/{path}", &self.address)
    }

    fn with_auth(
        &self,
        request: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        match self.access_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> ReqwestResult {
        let request = self.inner_client.post(self.format_url(path)).json(body);
        self.with_auth(request).send().await
    }

    async fn put(&self, path: &str, body: &impl Serialize) -> ReqwestResult {
        let request = self.inner_client.put(self.format_url(path)).json(body);
        self.with_auth(request).send().await
    }

    async fn empty_post(&self, path: &str) -> ReqwestResult {
        let request = self.inner_client.post(self.format_url(path));
        self.with_auth(request).send().await
    }

    async fn empty_get(&self, path: &str) -> ReqwestResult {
        let request = self.inner_client.get(self.format_url(path));
        self.with_auth(request).send().await
    }
}

/// Methods on the backend API
impl APIClient {
    pub async fn health_check(&self) -> Result<(), ClientError> {
        let response = self.empty_get("health_check").await?;
        if !response.status().is_success() {
            return Err(ClientError::APIError(
                response.status(),
                response.text().await?,
            ));
        }
        Ok(())
    }

    /// Create an account. On success the client is authenticated as the new
    /// user.
    pub async fn register(
        &self,
        details: &requests::Register,
    ) -> Result<AuthSession, ClientError> {
        let response = self.post("users/register", details).await?;
        let session: AuthSession = ok_body(response).await?;
        self.set_access_token(Some(session.access_token.clone()));
        Ok(session)
    }

    /// Log in. On success the client is authenticated as the user.
    pub async fn login(
        &self,
        details: &requests::LoginCredentials,
    ) -> Result<AuthSession, ClientError> {
        let response = self.post("users/login", details).await?;
        let session: AuthSession = ok_body(response).await?;
        self.set_access_token(Some(session.access_token.clone()));
        Ok(session)
    }

    /// Invalidate the refresh token and forget the access token.
    pub async fn logout(&self) -> Result<(), ClientError> {
        let response = self.empty_post("users/logout").await?;
        ok_empty(response).await?;
        self.set_access_token(None);
        Ok(())
    }

    /// Exchange a refresh token for a new token pair. The new access token is
    /// used for subsequent requests.
    pub async fn refresh_token(
        &self,
        details: &requests::RefreshToken,
    ) -> Result<TokenPair, ClientError> {
        let response = self.post("users/refresh-token", details).await?;
        let tokens: TokenPair = ok_body(response).await?;
        self.set_access_token(Some(tokens.access_token.clone()));
        Ok(tokens)
    }

    /// The current user's account and every transaction they are party to.
    pub async fn user_profile(&self) -> Result<UserStatement, ClientError> {
        let response = self.empty_get("users/profile").await?;
        ok_body(response).await
    }

    pub async fn update_profile(
        &self,
        details: &requests::UpdateProfile,
    ) -> Result<responses::Account, ClientError> {
        let response = self.put("users/profile", details).await?;
        ok_body(response).await
    }

    pub async fn forgot_password(
        &self,
        details: &requests::ForgotPassword,
    ) -> Result<(), ClientError> {
        let response = self.post("users/forgot-password", details).await?;
        ok_empty(response).await
    }

    pub async fn reset_password(
        &self,
        details: &requests::ResetPassword,
    ) -> Result<(), ClientError> {
        let response = self.post("users/reset-password", details).await?;
        ok_empty(response).await
    }

    pub async fn change_password(
        &self,
        details: &requests::ChangePassword,
    ) -> Result<(), ClientError> {
        let response = self.post("users/change-password", details).await?;
        ok_empty(response).await
    }

    pub async fn request_add_funds(
        &self,
        details: &requests::RequestAddFunds,
    ) -> Result<Transaction, ClientError> {
        let response = self
            .post("transactions/request-add-funds", details)
            .await?;
        ok_body(response).await
    }

    pub async fn process_withdrawal(
        &self,
        details: &requests::ProcessWithdrawal,
    ) -> Result<WithdrawalResult, ClientError> {
        let response = self
            .post("transactions/process-withdrawal", details)
            .await?;
        ok_body(response).await
    }

    pub async fn request_transfer(
        &self,
        details: &requests::RequestTransfer,
    ) -> Result<Transaction, ClientError> {
        let response = self.post("admin/request-transfer", details).await?;
        ok_body(response).await
    }

    pub async fn approve_deposit(
        &self,
        details: &requests::ApproveTransaction,
    ) -> Result<Transaction, ClientError> {
        let response = self.post("admin/approve-deposit", details).await?;
        ok_body(response).await
    }

    pub async fn approve_transfer(
        &self,
        details: &requests::ApproveTransaction,
    ) -> Result<Transaction, ClientError> {
        let response = self.post("admin/approve-transfer", details).await?;
        ok_body(response).await
    }

    pub async fn reject_transaction(
        &self,
        details: &requests::RejectTransaction,
    ) -> Result<Transaction, ClientError> {
        let response = self.post("admin/reject-transaction", details).await?;
        ok_body(response).await
    }

    pub async fn pending_transactions(
        &self,
    ) -> Result<Vec<PendingTransaction>, ClientError> {
        let response = self.empty_get("admin/pending-transactions").await?;
        ok_body(response).await
    }

    pub async fn list_commissions(
        &self,
    ) -> Result<Vec<Commission>, ClientError> {
        let response = self.empty_get("admin/").await?;
        ok_body(response).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// An unhandled API error to display, containing the response message.
    #[error("{1}")]
    APIError(StatusCode, String),
    #[error("Network error. Please check your connection.")]
    Network(#[from] reqwest::Error),
    #[error("Response did not contain any data")]
    MissingData,
}

/// Extract the message of an error response, falling back to the raw body
/// if it isn't an envelope.
async fn api_error(response: reqwest::Response) -> ClientError {
    let status = response.status();
    let text = match response.text().await {
        Ok(text) => text,
        Err(e) => return e.into(),
    };
    let message = serde_json::from_str::<Envelope<()>>(&text)
        .ok()
        .and_then(|envelope| envelope.message)
        .unwrap_or(text);
    ClientError::APIError(status, message)
}

/// Deserialize the data of a successful response into the desired type, or
/// return an appropriate error.
pub async fn ok_body<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ClientError> {
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    response
        .json::<Envelope<T>>()
        .await?
        .data
        .ok_or(ClientError::MissingData)
}

/// Check that a response without data is OK, returning a ClientError if not.
pub async fn ok_empty(response: reqwest::Response) -> Result<(), ClientError> {
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    Ok(())
}
