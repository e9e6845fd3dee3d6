//! Custom Resource Definitions for the VPA operator

mod vpa_manager;

#[allow(deprecated)]
pub use vpa_manager::DeploymentReference;
pub use vpa_manager::{
    ContainerResourcePolicy, ResourcePolicy, UpdateMode, VpaManager, VpaManagerSpec,
    VpaManagerStatus, WorkloadReference,
};
