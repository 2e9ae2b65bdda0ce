//! Controller module for Network, Participants and Pod reconciliation
//! This module contains the controller loops, the participation state
//! machine and the collaborators they drive: resource store, credential
//! service and broker.

pub mod broker;
pub mod credentials;
pub mod finalizers;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod network;
pub mod participants;
pub mod participation;
pub mod pod;
mod reconciler;
pub mod retry;
pub mod secrets;
pub mod sidecar;
pub mod store;
pub mod streams;
#[cfg(test)]
mod testing;

pub use broker::{BrokerConnector, BrokerSession, NatsConnector, MAIN_DOMAIN};
pub use credentials::{wait_until_ready, CredentialService, GrpcCredentialService};
pub use finalizers::{NETWORK_FINALIZER, PARTICIPANTS_FINALIZER, POD_FINALIZER};
pub use participation::{classify, NodeClass, NodeDelta, ParticipationPlan};
pub use reconciler::{requeue_after, run_controllers, Context, ControllerState, OperatorConfig};
pub use retry::{retry_on_conflict, RetryPolicy};
pub use sidecar::BrokerUrls;
pub use store::{KubeStore, ResourceStore};
pub use streams::{parse_duration, StreamManager};
