//! Stream manager
//!
//! Translates declared [`StreamSpec`]s into broker calls per domain. Physical
//! stream names are qualified by network (`<network>_<stream>`) so networks
//! sharing a domain never collide.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::broker::{source_from_domain, BrokerConnector, BrokerSession, StreamConfig, StreamSource};
use super::retry::RetryPolicy;
use crate::crd::StreamSpec;
use crate::error::{Error, Result};

const SECS_PER_MINUTE: f64 = 60.0;
const SECS_PER_HOUR: f64 = 60.0 * SECS_PER_MINUTE;
const SECS_PER_DAY: f64 = 24.0 * SECS_PER_HOUR;

/// Parse `<number><unit>` with unit one of `s m h d w M y`
///
/// `m` is minutes and `M` months; every other unit is case-insensitive.
/// Months are 30 days and years 365 days. An empty string is zero, which
/// the broker reads as unlimited.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(Duration::ZERO);
    }

    let unit = input
        .chars()
        .last()
        .ok_or_else(|| Error::DurationParse(input.to_string()))?;
    let magnitude = &input[..input.len() - unit.len_utf8()];

    let unit_secs = match unit {
        's' | 'S' => 1.0,
        'm' => SECS_PER_MINUTE,
        'h' | 'H' => SECS_PER_HOUR,
        'd' | 'D' => SECS_PER_DAY,
        'w' | 'W' => 7.0 * SECS_PER_DAY,
        'M' => 30.0 * SECS_PER_DAY,
        'y' | 'Y' => 365.0 * SECS_PER_DAY,
        other => {
            return Err(Error::DurationParse(format!(
                "{input}: invalid time unit '{other}'"
            )))
        }
    };

    let value: f64 = magnitude
        .trim()
        .parse()
        .map_err(|_| Error::DurationParse(format!("{input}: invalid magnitude '{magnitude}'")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(Error::DurationParse(format!(
            "{input}: magnitude must be a non-negative number"
        )));
    }

    Duration::try_from_secs_f64(value * unit_secs)
        .map_err(|e| Error::DurationParse(format!("{input}: {e}")))
}

/// Physical name of a network's stream
pub fn stream_name(network: &str, stream: &str) -> String {
    format!("{network}_{stream}")
}

/// Build the broker configuration of a declared stream
///
/// Fails with a configuration error before any broker call when the spec
/// cannot be expressed, e.g. an unparseable `maxAge`.
pub fn create_jetstream_config(
    network: &str,
    spec: &StreamSpec,
    subjects: &[String],
) -> Result<StreamConfig> {
    let max_age = parse_duration(&spec.config.max_age).map_err(|e| {
        Error::ConfigError(format!("stream '{}': maxAge: {}", spec.name, e))
    })?;
    if i64::try_from(max_age.as_nanos()).is_err() {
        return Err(Error::ConfigError(format!(
            "stream '{}': maxAge out of range",
            spec.name
        )));
    }

    Ok(StreamConfig {
        name: stream_name(network, &spec.name),
        subjects: subjects.to_vec(),
        retention: spec.config.retention.into(),
        max_consumers: -1,
        max_messages: spec.config.max_msgs,
        max_bytes: spec.config.max_bytes,
        max_age,
        max_messages_per_subject: spec.config.max_msgs_per_subject,
        max_message_size: spec.config.max_msg_size,
        storage: spec.config.storage.into(),
        discard: spec.config.discard.into(),
        num_replicas: 1,
        ..Default::default()
    })
}

/// Stream operations over one broker session
///
/// Each reconcile pass opens its own manager and closes it when done.
pub struct StreamManager {
    session: Box<dyn BrokerSession>,
    existence_policy: RetryPolicy,
}

impl StreamManager {
    pub fn new(session: Box<dyn BrokerSession>, existence_policy: RetryPolicy) -> Self {
        Self {
            session,
            existence_policy,
        }
    }

    pub async fn connect(
        connector: &dyn BrokerConnector,
        creds: &str,
        existence_policy: RetryPolicy,
    ) -> Result<Self> {
        let session = connector.connect(creds).await?;
        Ok(Self::new(session, existence_policy))
    }

    pub async fn exists(&self, domain: &str, network: &str, stream: &str) -> Result<bool> {
        self.session
            .stream_exists(domain, &stream_name(network, stream))
            .await
    }

    /// Create a stream without checking for it first
    #[instrument(skip(self, spec, subjects), fields(stream = %spec.name))]
    pub async fn create(
        &self,
        domain: &str,
        network: &str,
        spec: &StreamSpec,
        subjects: &[String],
    ) -> Result<()> {
        let config = create_jetstream_config(network, spec, subjects)?;
        self.session
            .create_stream(domain, &config)
            .await
            .inspect_err(|_| record_failure("create", domain))
    }

    /// Create the stream unless it exists, checking with the manager's retry policy
    ///
    /// Returns whether a stream was created. Configuration errors are not retried.
    pub async fn ensure(
        &self,
        domain: &str,
        network: &str,
        spec: &StreamSpec,
        subjects: &[String],
    ) -> Result<bool> {
        // validate up front so a bad spec never reaches the broker
        create_jetstream_config(network, spec, subjects)?;

        self.existence_policy
            .retry_if("ensure stream", Error::is_retriable, move || async move {
                if self.exists(domain, network, &spec.name).await? {
                    debug!(domain, stream = %spec.name, "Stream exists");
                    return Ok(false);
                }
                self.create(domain, network, spec, subjects).await?;
                Ok(true)
            })
            .await
    }

    /// Create or update an aggregate stream sourcing the linked node stream from every source domain
    #[instrument(skip(self, spec, source_domains), fields(stream = %spec.name, sources = source_domains.len()))]
    pub async fn create_aggregate(
        &self,
        domain: &str,
        network: &str,
        spec: &StreamSpec,
        source_domains: &[String],
    ) -> Result<()> {
        let link = spec.link.as_ref().ok_or_else(|| {
            Error::ConfigError(format!("stream '{}' has no link to aggregate", spec.name))
        })?;
        let config = create_jetstream_config(network, spec, &[])?;
        let source_name = stream_name(network, &link.stream);
        let sources: Vec<StreamSource> = source_domains
            .iter()
            .map(|d| source_from_domain(&source_name, d))
            .collect();

        self.session
            .create_mirror_stream(domain, &config, &sources)
            .await
            .inspect_err(|_| record_failure("create_aggregate", domain))?;
        info!(domain, network, "Aggregate stream up to date");
        Ok(())
    }

    /// Delete a network's streams in a domain, attempting every name
    ///
    /// All failures are collected into one [`Error::StreamDeletion`].
    #[instrument(skip(self, names), fields(count = names.len()))]
    pub async fn delete(&self, domain: &str, network: &str, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let physical: Vec<String> = names.iter().map(|n| stream_name(network, n)).collect();
        let failures: Vec<(String, String)> = self
            .session
            .delete_streams(domain, &physical)
            .await
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e.to_string())))
            .collect();

        if failures.is_empty() {
            return Ok(());
        }
        for (name, reason) in &failures {
            warn!(domain, stream = %name, %reason, "Failed to delete stream");
        }
        record_failure("delete", domain);
        Err(Error::StreamDeletion {
            domain: domain.to_string(),
            failures,
        })
    }

    pub async fn close(self) {
        self.session.close().await;
    }
}

#[cfg(feature = "metrics")]
fn record_failure(operation: &str, domain: &str) {
    super::metrics::inc_stream_operation_failure(operation, domain);
}

#[cfg(not(feature = "metrics"))]
fn record_failure(_operation: &str, _domain: &str) {}
