//! Provisioner backend interface
//!
//! The state machine never talks to BMCs itself. Every operation is
//! delegated to a [`Provisioner`] implementation, which classifies its
//! outcome into an [`ActionResult`] at the boundary. Long-running backend
//! work is encoded as `Continue`/`Delayed`; the machine is reinvoked until
//! the backend reports `Complete`.

pub mod fixture;

use crate::crd::{ErrorType, MetalHost};
use async_trait::async_trait;
use std::time::Duration;

pub use fixture::FixtureProvisioner;

/// Outcome of one provisioner action.
///
/// `Complete` is the only case after which the state machine may commit a
/// state transition; every other case leaves the host in its current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    /// The current state's work is done
    Complete,
    /// Work in progress; reconcile again soon
    Continue,
    /// Work pending; reconcile no sooner than the given delay
    Delayed(Duration),
    /// A classified failure, surfaced on the host status
    Failed(ErrorType),
    /// An unexpected internal error, propagated to the reconcile driver
    Error(String),
}

impl ActionResult {
    pub fn error(message: impl Into<String>) -> Self {
        ActionResult::Error(message.into())
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, ActionResult::Complete)
    }
}

/// Abstract operations the state machine invokes on the backend.
///
/// Implementations must be idempotent: the machine may reconcile the same
/// state repeatedly while waiting for `Complete`, so calling an action
/// twice in a row has to yield compatible results. Implementations may
/// record backend bookkeeping on the host status (node id, locked-in
/// image), but never change the provisioning state; that is the state
/// machine's job.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Register the host with the backend using the current credentials
    async fn register(&self, host: &mut MetalHost) -> ActionResult;

    /// Hold an unmanaged host, watching for BMC details to appear
    async fn unmanaged(&self, host: &mut MetalHost) -> ActionResult;

    /// Run hardware inspection
    async fn inspect(&self, host: &mut MetalHost) -> ActionResult;

    /// Match the inspected hardware against a profile
    async fn match_profile(&self, host: &mut MetalHost) -> ActionResult;

    /// Keep a ready host in shape to be provisioned (power checks etc.)
    async fn manage_ready(&self, host: &mut MetalHost) -> ActionResult;

    /// Ongoing maintenance for a provisioned or externally provisioned host
    async fn manage_steady_state(&self, host: &mut MetalHost) -> ActionResult;

    /// Write the spec image onto the host
    async fn provision(&self, host: &mut MetalHost) -> ActionResult;

    /// Remove the provisioned image from the host
    async fn deprovision(&self, host: &mut MetalHost) -> ActionResult;

    /// Remove the host from the backend
    async fn delete(&self, host: &mut MetalHost) -> ActionResult;
}
