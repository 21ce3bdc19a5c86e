//! In-memory provisioner backend
//!
//! `FixtureProvisioner` succeeds at every operation by default, recording
//! the same backend bookkeeping a real adapter would (node id, inspected
//! hardware, locked-in image). Individual operations can be scripted to
//! return queued results instead, which is how the state machine tests
//! drive failure and still-working paths. Also usable as a demo backend
//! for running the operator without real hardware.

use super::{ActionResult, Provisioner};
use crate::crd::{HardwareDetails, MetalHost};
use async_trait::async_trait;
use kube::ResourceExt;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// Backend retry delay when there is nothing to do but wait for spec changes
const HOLD_DELAY: Duration = Duration::from_secs(600);
/// Retry delay while a ready host waits for an image to be assigned
const READY_POLL_DELAY: Duration = Duration::from_secs(60);

/// The operations a provisioner exposes, used to script and count calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Register,
    Unmanaged,
    Inspect,
    MatchProfile,
    ManageReady,
    ManageSteadyState,
    Provision,
    Deprovision,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Register => "register",
            Operation::Unmanaged => "unmanaged",
            Operation::Inspect => "inspect",
            Operation::MatchProfile => "match-profile",
            Operation::ManageReady => "manage-ready",
            Operation::ManageSteadyState => "manage-steady-state",
            Operation::Provision => "provision",
            Operation::Deprovision => "deprovision",
            Operation::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

#[derive(Default)]
struct Inner {
    scripted: HashMap<Operation, VecDeque<ActionResult>>,
    calls: HashMap<Operation, u64>,
}

/// Scriptable in-memory backend
#[derive(Default)]
pub struct FixtureProvisioner {
    inner: Mutex<Inner>,
}

impl FixtureProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a result for an operation; consumed in FIFO order before the
    /// default behavior applies again
    pub fn with_result(self, op: Operation, result: ActionResult) -> Self {
        self.push_result(op, result);
        self
    }

    pub fn push_result(&self, op: Operation, result: ActionResult) {
        let mut inner = self.inner.lock().expect("fixture lock poisoned");
        inner.scripted.entry(op).or_default().push_back(result);
    }

    /// How many times an operation has been invoked
    pub fn calls(&self, op: Operation) -> u64 {
        let inner = self.inner.lock().expect("fixture lock poisoned");
        inner.calls.get(&op).copied().unwrap_or(0)
    }

    /// Total invocations across all operations
    pub fn total_calls(&self) -> u64 {
        let inner = self.inner.lock().expect("fixture lock poisoned");
        inner.calls.values().sum()
    }

    /// Count the call and pop a scripted result, if one is queued
    fn take_scripted(&self, op: Operation) -> Option<ActionResult> {
        let mut inner = self.inner.lock().expect("fixture lock poisoned");
        *inner.calls.entry(op).or_insert(0) += 1;
        inner.scripted.get_mut(&op).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl Provisioner for FixtureProvisioner {
    async fn register(&self, host: &mut MetalHost) -> ActionResult {
        if let Some(result) = self.take_scripted(Operation::Register) {
            return result;
        }
        let name = host.name_any();
        let status = host.status_mut();
        if status.provisioning.id.is_empty() {
            status.provisioning.id = format!("fixture-{name}");
        }
        ActionResult::Complete
    }

    async fn unmanaged(&self, host: &mut MetalHost) -> ActionResult {
        if let Some(result) = self.take_scripted(Operation::Unmanaged) {
            return result;
        }
        if host.has_bmc_details() {
            ActionResult::Complete
        } else {
            ActionResult::Delayed(HOLD_DELAY)
        }
    }

    async fn inspect(&self, host: &mut MetalHost) -> ActionResult {
        if let Some(result) = self.take_scripted(Operation::Inspect) {
            return result;
        }
        host.status_mut().hardware = Some(HardwareDetails {
            cpu_arch: "x86_64".into(),
            cpu_count: 8,
            ram_mebibytes: 16384,
            storage_gigabytes: 480,
            nic_count: 2,
        });
        ActionResult::Complete
    }

    async fn match_profile(&self, host: &mut MetalHost) -> ActionResult {
        if let Some(result) = self.take_scripted(Operation::MatchProfile) {
            return result;
        }
        let requested = host.spec.hardware_profile.clone();
        host.status_mut().hardware_profile = requested.unwrap_or_else(|| "unknown".into());
        ActionResult::Complete
    }

    async fn manage_ready(&self, host: &mut MetalHost) -> ActionResult {
        if let Some(result) = self.take_scripted(Operation::ManageReady) {
            return result;
        }
        let has_image = host
            .spec
            .image
            .as_ref()
            .is_some_and(|image| !image.url.is_empty());
        if has_image {
            ActionResult::Complete
        } else {
            ActionResult::Delayed(READY_POLL_DELAY)
        }
    }

    async fn manage_steady_state(&self, _host: &mut MetalHost) -> ActionResult {
        if let Some(result) = self.take_scripted(Operation::ManageSteadyState) {
            return result;
        }
        ActionResult::Delayed(HOLD_DELAY)
    }

    async fn provision(&self, host: &mut MetalHost) -> ActionResult {
        if let Some(result) = self.take_scripted(Operation::Provision) {
            return result;
        }
        let image = host.spec.image.clone();
        host.status_mut().provisioning.image = image;
        ActionResult::Complete
    }

    async fn deprovision(&self, host: &mut MetalHost) -> ActionResult {
        if let Some(result) = self.take_scripted(Operation::Deprovision) {
            return result;
        }
        host.status_mut().provisioning.image = None;
        ActionResult::Complete
    }

    async fn delete(&self, host: &mut MetalHost) -> ActionResult {
        if let Some(result) = self.take_scripted(Operation::Delete) {
            return result;
        }
        host.status_mut().provisioning.id.clear();
        ActionResult::Complete
    }
}
