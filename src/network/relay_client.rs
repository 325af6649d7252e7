//! Typed HTTP client for the relay API.

use crate::relay::protocol::{
    ErrorBody, HealthStatus, MailboxMessage, MessageAccepted, MessageBatch, PeerList, RelayEntry, RelayRequest,
    StatusResponse,
};
use crate::utils::{RelayError, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Client for one relay base URL, e.g. `http://relay.example:5000`
#[derive(Clone)]
pub struct RelayClient {
    http: Client,
    base_url: String,
}

impl RelayClient {
    /// Create a client whose every call is bounded by `request_timeout`
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be initialised.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self::with_client(http, base_url))
    }

    /// Wrap an existing HTTP client
    pub fn with_client(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Relay base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Underlying HTTP client
    pub fn http(&self) -> &Client {
        &self.http
    }

    async fn call<T: DeserializeOwned>(&self, request: &RelayRequest) -> Result<T> {
        let response = self
            .http
            .post(format!("{}/api", self.base_url))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let reason = match response.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => status.to_string(),
            };
            log::debug!("Relay rejected {}: {}", request.action(), reason);
            return Err(RelayError::Rejected(reason).into());
        }
        Ok(response.json::<T>().await?)
    }

    /// Announce or refresh presence
    pub async fn update(&self, peer_id: &str, name: &str, public_ip: &str, tcp_port: u16) -> Result<()> {
        let _: StatusResponse = self
            .call(&RelayRequest::Update {
                peer_id: peer_id.to_string(),
                name: Some(name.to_string()),
                public_ip: Some(public_ip.to_string()),
                tcp_port: Some(tcp_port),
            })
            .await?;
        Ok(())
    }

    /// Active peers, minus `exclude`
    pub async fn list(&self, exclude: Option<&str>) -> Result<Vec<RelayEntry>> {
        let list: PeerList = self
            .call(&RelayRequest::List {
                exclude: exclude.map(str::to_string),
            })
            .await?;
        Ok(list.peers)
    }

    /// Withdraw presence
    pub async fn remove(&self, peer_id: &str) -> Result<()> {
        let _: StatusResponse = self
            .call(&RelayRequest::Remove {
                peer_id: Some(peer_id.to_string()),
            })
            .await?;
        Ok(())
    }

    /// Ensure a mailbox exists for `user_id`; returns the relay's confirmation
    pub async fn register_messaging(&self, user_id: &str) -> Result<String> {
        let response: StatusResponse = self
            .call(&RelayRequest::RegisterMessaging {
                user_id: user_id.to_string(),
            })
            .await?;
        Ok(response.message.unwrap_or(response.status))
    }

    /// Leave a message; returns its relay-wide id
    pub async fn send_message(&self, sender: &str, recipient: &str, text: &str) -> Result<u64> {
        let accepted: MessageAccepted = self
            .call(&RelayRequest::SendMessage {
                sender: sender.to_string(),
                recipient: recipient.to_string(),
                text: text.to_string(),
            })
            .await?;
        Ok(accepted.message_id)
    }

    /// Mailbox entries with `id > since_id`, ascending
    pub async fn get_messages(&self, user_id: &str, since_id: u64) -> Result<Vec<MailboxMessage>> {
        let batch: MessageBatch = self
            .call(&RelayRequest::GetMessages {
                user_id: user_id.to_string(),
                since_id,
            })
            .await?;
        Ok(batch.messages)
    }

    /// `GET /health`
    pub async fn health(&self) -> Result<HealthStatus> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}
