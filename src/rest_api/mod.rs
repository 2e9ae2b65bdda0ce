//! REST API module
//!
//! Serves health, Prometheus metrics and a read-only view of Networks.

mod dto;
mod handlers;
mod server;

pub use dto::{NetworkListResponse, NetworkSummary};
pub use server::{router, run_server};
