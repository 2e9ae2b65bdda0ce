//! Broker administrative client
//!
//! Streams are managed through the `async-nats` JetStream context. Every
//! domain has its own context: the main domain is the account's default
//! JetStream, an edge node's leaf broker is reached as JetStream domain
//! `<node>`.

use std::time::Duration;

use async_nats::jetstream::{
    self,
    context::{CreateStreamErrorKind, GetStreamErrorKind},
    stream::External,
    ErrorCode,
};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::crd::{DiscardPolicy, RetentionPolicy, StorageType};
use crate::error::{Error, Result};

pub use async_nats::jetstream::stream::{Config as StreamConfig, Source as StreamSource};

/// Domain of the shared main cluster
pub const MAIN_DOMAIN: &str = "main";

/// API subject prefix of a domain
pub fn api_prefix(domain: &str) -> String {
    if domain == MAIN_DOMAIN {
        "$JS.API".to_string()
    } else {
        format!("$JS.{domain}.API")
    }
}

/// Source `name` from the JetStream domain `domain`
pub fn source_from_domain(name: &str, domain: &str) -> StreamSource {
    StreamSource {
        name: name.to_string(),
        external: Some(External {
            api_prefix: api_prefix(domain),
            delivery_prefix: None,
        }),
        ..Default::default()
    }
}

impl From<RetentionPolicy> for jetstream::stream::RetentionPolicy {
    fn from(policy: RetentionPolicy) -> Self {
        match policy {
            RetentionPolicy::Limits => Self::Limits,
            RetentionPolicy::Interest => Self::Interest,
            RetentionPolicy::WorkQueue => Self::WorkQueue,
        }
    }
}

impl From<StorageType> for jetstream::stream::StorageType {
    fn from(storage: StorageType) -> Self {
        match storage {
            StorageType::File => Self::File,
            StorageType::Memory => Self::Memory,
        }
    }
}

impl From<DiscardPolicy> for jetstream::stream::DiscardPolicy {
    fn from(discard: DiscardPolicy) -> Self {
        match discard {
            DiscardPolicy::Old => Self::Old,
            DiscardPolicy::New => Self::New,
        }
    }
}

/// Opens administrative sessions with a participant's credentials
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// `creds` is the content of a NATS creds file
    async fn connect(&self, creds: &str) -> Result<Box<dyn BrokerSession>>;
}

#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn stream_exists(&self, domain: &str, name: &str) -> Result<bool>;

    /// Create a stream; an existing stream with the same name is success
    async fn create_stream(&self, domain: &str, config: &StreamConfig) -> Result<()>;

    /// Create the stream with `sources`, or update the sources of an existing one
    async fn create_mirror_stream(
        &self,
        domain: &str,
        config: &StreamConfig,
        sources: &[StreamSource],
    ) -> Result<()>;

    /// Delete every named stream, reporting each outcome. Missing streams are success.
    async fn delete_streams(&self, domain: &str, names: &[String]) -> Vec<(String, Result<()>)>;

    async fn close(&self);
}

/// [`BrokerConnector`] for a NATS server
pub struct NatsConnector {
    url: String,
    request_timeout: Duration,
}

impl NatsConnector {
    pub fn new(url: &str, request_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            request_timeout,
        }
    }
}

#[async_trait]
impl BrokerConnector for NatsConnector {
    async fn connect(&self, creds: &str) -> Result<Box<dyn BrokerSession>> {
        let broker_error = |message: String| Error::Broker {
            domain: MAIN_DOMAIN.to_string(),
            message,
        };
        let client = async_nats::ConnectOptions::with_credentials(creds)
            .map_err(|e| broker_error(format!("invalid credentials: {e}")))?
            .request_timeout(Some(self.request_timeout))
            .connect(self.url.as_str())
            .await
            .map_err(|e| broker_error(format!("connect to {}: {e}", self.url)))?;
        debug!(url = %self.url, "Connected to broker");
        Ok(Box::new(NatsSession {
            client,
            request_timeout: self.request_timeout,
        }))
    }
}

struct NatsSession {
    client: async_nats::Client,
    request_timeout: Duration,
}

impl NatsSession {
    fn context(&self, domain: &str) -> jetstream::Context {
        let mut context = if domain == MAIN_DOMAIN {
            jetstream::new(self.client.clone())
        } else {
            jetstream::with_domain(self.client.clone(), domain)
        };
        context.set_timeout(self.request_timeout);
        context
    }
}

fn broker_error(domain: &str, message: String) -> Error {
    Error::Broker {
        domain: domain.to_string(),
        message,
    }
}

fn is_stream_not_found(kind: &GetStreamErrorKind) -> bool {
    matches!(kind, GetStreamErrorKind::JetStream(err) if err.error_code() == ErrorCode::STREAM_NOT_FOUND)
}

#[async_trait]
impl BrokerSession for NatsSession {
    async fn stream_exists(&self, domain: &str, name: &str) -> Result<bool> {
        match self.context(domain).get_stream(name).await {
            Ok(_) => Ok(true),
            Err(e) if is_stream_not_found(&e.kind()) => Ok(false),
            Err(e) => Err(broker_error(domain, format!("stream info {name}: {e}"))),
        }
    }

    async fn create_stream(&self, domain: &str, config: &StreamConfig) -> Result<()> {
        match self.context(domain).create_stream(config.clone()).await {
            Ok(_) => {
                info!(domain, stream = %config.name, "Created stream");
                Ok(())
            }
            Err(e) => match e.kind() {
                CreateStreamErrorKind::JetStream(err)
                    if err.error_code() == ErrorCode::STREAM_NAME_EXIST =>
                {
                    debug!(domain, stream = %config.name, "Stream already exists");
                    Ok(())
                }
                _ => Err(broker_error(domain, format!("create stream {}: {e}", config.name))),
            },
        }
    }

    async fn create_mirror_stream(
        &self,
        domain: &str,
        config: &StreamConfig,
        sources: &[StreamSource],
    ) -> Result<()> {
        let config = StreamConfig {
            sources: Some(sources.to_vec()),
            ..config.clone()
        };
        let context = self.context(domain);
        if self.stream_exists(domain, &config.name).await? {
            context
                .update_stream(&config)
                .await
                .map_err(|e| broker_error(domain, format!("update stream {}: {e}", config.name)))?;
        } else {
            context
                .create_stream(config.clone())
                .await
                .map_err(|e| broker_error(domain, format!("create stream {}: {e}", config.name)))?;
        }
        info!(
            domain,
            stream = %config.name,
            sources = sources.len(),
            "Aggregate stream sources applied"
        );
        Ok(())
    }

    async fn delete_streams(&self, domain: &str, names: &[String]) -> Vec<(String, Result<()>)> {
        let context = self.context(domain);
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let result = match context.delete_stream(name).await {
                Ok(_) => {
                    info!(domain, stream = %name, "Deleted stream");
                    Ok(())
                }
                Err(e) if is_stream_not_found(&e.kind()) => Ok(()),
                Err(e) => Err(broker_error(domain, format!("delete stream {name}: {e}"))),
            };
            results.push((name.clone(), result));
        }
        results
    }

    async fn close(&self) {
        if let Err(e) = self.client.drain().await {
            debug!(error = %e, "Drain before close failed");
        }
    }
}
