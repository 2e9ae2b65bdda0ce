//! Custom Resource Definitions for anck
//!
//! This module defines the Network and Participants CRDs of the
//! `network.edgefarm.io` API group.

mod network;
mod participants;
pub mod types;


pub use network::{Network, NetworkSpec, NetworkStatus};
pub use participants::{Participants, ParticipantsSpec};
pub use types::*;
