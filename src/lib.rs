//! HostForge Kubernetes Operator
//!
//! A Kubernetes operator that drives bare-metal servers from discovery
//! through registration, inspection, provisioning, steady state and
//! deletion, mediating between the declarative MetalHost record and a
//! provisioner backend that talks to the machines' BMCs.
//!
//! ## Custom Resources
//!
//! - `MetalHost`: one physical server and its desired provisioning state
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: hostforge.io/v1alpha1
//! kind: MetalHost
//! metadata:
//!   name: rack2-node7
//! spec:
//!   bmc:
//!     address: redfish://10.4.2.7
//!     credentialsName: rack2-node7-bmc
//!   image:
//!     url: http://images.infra/ubuntu-24.04.qcow2
//! ```

pub mod controllers;
pub mod crd;
pub mod error;
pub mod leader_election;
pub mod metrics;
pub mod provisioner;

pub use controllers::{
    allowed_transitions, HostController, HostEvent, HostStateMachine, ReconcileInfo,
    HOST_FINALIZER,
};
pub use crd::{
    BmcDetails, BootMode, CredentialsVersion, ErrorType, HostSpec, HostStatus, Image, MetalHost,
    OperationalStatus, ProvisioningState,
};
pub use error::{OperatorError, Result};
pub use provisioner::{ActionResult, FixtureProvisioner, Provisioner};
