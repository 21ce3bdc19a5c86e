//! Controllers for the HostForge operator
//!
//! The host controller watches MetalHost resources and reconciles each one
//! by running the host lifecycle state machine against the configured
//! provisioner backend.

mod host;
pub mod state_machine;

pub use host::{HostController, HOST_FINALIZER};
pub use state_machine::{
    allowed_transitions, HostEvent, HostStateMachine, PostSaveCallback, ReconcileInfo,
};

use crate::error::OperatorError;
use kube::runtime::controller::Action;
use std::time::Duration;

/// Backoff error policy for controller reconciliation failures.
/// Categorizes errors by severity to choose appropriate retry delays.
pub(crate) fn error_policy_backoff<K>(
    _object: std::sync::Arc<K>,
    error: &OperatorError,
    _ctx: std::sync::Arc<impl std::any::Any + Send + Sync>,
) -> Action {
    let delay_secs = match error {
        // Transient K8s API errors — retry quickly
        OperatorError::KubeApi(_) => 10,
        // Reconciliation issues — longer wait
        OperatorError::Reconciliation(_) => 30,
    };

    Action::requeue(Duration::from_secs(delay_secs))
}
