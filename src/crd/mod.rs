//! Custom Resource Definitions for the HostForge operator
//!
//! A single CRD is managed:
//! - MetalHost: one physical server, driven through its provisioning
//!   lifecycle by the host controller

mod host;

pub use host::{
    BmcDetails, BootMode, CredentialsVersion, ErrorType, HardwareDetails, HostSpec, HostStatus,
    Image, MetalHost, OperationHistory, OperationMetric, OperationalStatus, ProvisioningState,
    ProvisioningStatus,
};
