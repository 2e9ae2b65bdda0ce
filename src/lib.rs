//! anck: Kubernetes operator for multi-tenant EdgeFarm messaging networks
//!
//! This crate watches Network, Participants and Pod resources, issues broker
//! credentials through the credential service, writes them into component
//! secrets and converges JetStream streams on the main and edge domains.

pub mod controller;
pub mod crd;
pub mod error;
pub mod proto;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
