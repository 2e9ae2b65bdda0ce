//! Credential service client
//!
//! The credential service issues one broker user per participant of a network
//! and owns the broker account behind it. Every reconcile pass requests the full
//! desired state again; responses are never cached.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::proto::config_service_client::ConfigServiceClient;
use crate::proto::{
    DeleteAccountRequest, DeleteNetworkRequest, DesiredStateRequest, DesiredStateResponse,
};

/// Credentials issued for one participant
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParticipantCredentials {
    /// NATS creds file holding the user JWT and NKEY seed
    pub creds: String,
    pub account_public_key: String,
}

/// Response to a desired-state request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub account_name: String,

    /// Participant identifier to issued credentials
    pub creds: BTreeMap<String, ParticipantCredentials>,

    /// Participants whose credentials were revoked
    pub deleted_participants: Vec<String>,
}

impl From<DesiredStateResponse> for DesiredState {
    fn from(response: DesiredStateResponse) -> Self {
        let network = response.network.unwrap_or_default();
        let creds = response
            .creds
            .into_iter()
            .map(|c| {
                (
                    c.network_participant,
                    ParticipantCredentials {
                        creds: c.creds,
                        account_public_key: network.account_public_key.clone(),
                    },
                )
            })
            .collect();
        Self {
            account_name: network.account_name,
            creds,
            deleted_participants: response.deleted_participants,
        }
    }
}

#[async_trait]
pub trait CredentialService: Send + Sync {
    async fn desired_state(&self, network: &str, participants: &[String]) -> Result<DesiredState>;

    async fn delete_network(&self, network: &str) -> Result<()>;

    async fn delete_account(&self, account: &str) -> Result<()>;

    /// Succeeds once the service accepts connections
    async fn ready(&self) -> Result<()>;
}

/// gRPC client of the credential service's `ConfigService`
pub struct GrpcCredentialService {
    endpoint: Endpoint,
    channel: Channel,
    timeout: Duration,
}

impl GrpcCredentialService {
    /// Every call is bounded by `timeout`, which is also sent as the gRPC deadline
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Endpoint::from_shared(url.to_string())
            .map_err(|e| Error::ConfigError(format!("credential service url {url}: {e}")))?
            .connect_timeout(timeout)
            .timeout(timeout);
        let channel = endpoint.connect_lazy();
        Ok(Self {
            endpoint,
            channel,
            timeout,
        })
    }

    fn client(&self) -> ConfigServiceClient<Channel> {
        ConfigServiceClient::new(self.channel.clone())
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request.set_timeout(self.timeout);
        request
    }
}

/// Map an RPC status; `NotFound` on a delete means an earlier pass already removed it
fn delete_outcome(result: std::result::Result<(), Status>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(status) if status.code() == Code::NotFound => {
            debug!(message = status.message(), "Already deleted");
            Ok(())
        }
        Err(status) => Err(status.into()),
    }
}

#[async_trait]
impl CredentialService for GrpcCredentialService {
    #[instrument(skip(self, participants), fields(participants = participants.len()))]
    async fn desired_state(&self, network: &str, participants: &[String]) -> Result<DesiredState> {
        debug!("Requesting desired state");
        let response = self
            .client()
            .desired_state(self.request(DesiredStateRequest {
                network: network.to_string(),
                participants: participants.to_vec(),
            }))
            .await?;

        let state = DesiredState::from(response.into_inner());
        debug!(
            issued = state.creds.len(),
            revoked = state.deleted_participants.len(),
            account = %state.account_name,
            "Received desired state"
        );
        Ok(state)
    }

    #[instrument(skip(self))]
    async fn delete_network(&self, network: &str) -> Result<()> {
        let result = self
            .client()
            .delete_network(self.request(DeleteNetworkRequest {
                network: network.to_string(),
            }))
            .await
            .map(|_| ());
        delete_outcome(result)?;
        info!("Deleted network credentials");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_account(&self, account: &str) -> Result<()> {
        let result = self
            .client()
            .delete_account(self.request(DeleteAccountRequest {
                account_name: account.to_string(),
            }))
            .await
            .map(|_| ());
        delete_outcome(result)?;
        info!("Deleted broker account");
        Ok(())
    }

    async fn ready(&self) -> Result<()> {
        self.endpoint.connect().await?;
        Ok(())
    }
}

/// Poll the service until it is ready or `total` has elapsed
pub async fn wait_until_ready(
    service: &dyn CredentialService,
    total: Duration,
    spacing: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + total;
    loop {
        match service.ready().await {
            Ok(()) => {
                info!("Credential service is ready");
                return Ok(());
            }
            Err(e) if tokio::time::Instant::now() + spacing < deadline => {
                warn!(error = %e, "Credential service not ready yet");
                tokio::time::sleep(spacing).await;
            }
            Err(e) => {
                return Err(Error::CredentialService(format!(
                    "not ready after {}s: {}",
                    total.as_secs(),
                    e
                )))
            }
        }
    }
}
