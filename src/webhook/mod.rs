//! Admission-time convergence for workload objects
//!
//! Mutating webhook endpoints for Deployments, StatefulSets, and DaemonSets
//! that create, update, or delete the corresponding VPA inline with the
//! workload's own admission.

pub mod mutator;
pub mod server;

pub use mutator::WorkloadImage;
pub use server::{run_server, WebhookState};
