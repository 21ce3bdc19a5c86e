//! Host lifecycle state machine
//!
//! Drives a [`MetalHost`] from discovery through registration, inspection,
//! profile matching, provisioning, steady state, deprovisioning and
//! deletion. The machine is a decision function: it mutates the in-memory
//! host record and returns an [`ActionResult`], while the controller owns
//! persistence, requeueing and event publication. Side effects that must
//! only happen once the record is saved (metric increments, duration
//! observations) are queued as post-save callbacks on the reconcile
//! context.

use crate::crd::{CredentialsVersion, ErrorType, MetalHost, OperationalStatus, ProvisioningState};
use crate::metrics;
use crate::provisioner::{ActionResult, Provisioner};
use chrono::{DateTime, Utc};
use tracing::info;

/// Side effect deferred until the host record has been persisted
pub type PostSaveCallback = Box<dyn FnOnce() + Send>;

/// An event queued for publication against the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEvent {
    pub reason: String,
    pub message: String,
}

/// Per-reconcile context handed to the state machine by the controller
pub struct ReconcileInfo {
    /// `namespace/name` of the reconcile request, used in logs and metric labels
    pub request: String,
    /// Version of the BMC credentials Secret loaded for this tick
    pub bmc_credentials: Option<CredentialsVersion>,
    /// Events to publish after a successful save
    pub events: Vec<HostEvent>,
    /// Metric side effects to run only after a successful save
    pub post_save_callbacks: Vec<PostSaveCallback>,
}

impl ReconcileInfo {
    pub fn new(request: impl Into<String>, bmc_credentials: Option<CredentialsVersion>) -> Self {
        Self {
            request: request.into(),
            bmc_credentials,
            events: Vec::new(),
            post_save_callbacks: Vec::new(),
        }
    }

    /// Queue an event for publication
    pub fn publish_event(&mut self, reason: impl Into<String>, message: impl Into<String>) {
        self.events.push(HostEvent {
            reason: reason.into(),
            message: message.into(),
        });
    }
}

/// The transitions a single reconcile tick may commit out of each state.
///
/// Includes the delete-initiation jumps. Enforced by a debug assertion at
/// commit time and by the test suite.
pub fn allowed_transitions(from: ProvisioningState) -> &'static [ProvisioningState] {
    use ProvisioningState::*;
    match from {
        None => &[Registering, Unmanaged, Deleting],
        Unmanaged => &[Registering, Deleting],
        Registering => &[Inspecting, ExternallyProvisioned, Deleting],
        Inspecting => &[MatchProfile, Deleting],
        MatchProfile => &[Ready, Deleting],
        Available | Ready => &[ExternallyProvisioned, Provisioning, Deleting],
        ExternallyProvisioned => &[Inspecting, MatchProfile, Ready, Deleting],
        Provisioning => &[Provisioned, Deprovisioning],
        Provisioned => &[Deprovisioning],
        Deprovisioning => &[Ready, Deleting],
        Deleting => &[],
    }
}

/// Finite state machine managing transitions between the provisioning
/// states of one host during one reconcile tick.
pub struct HostStateMachine<'a> {
    host: &'a mut MetalHost,
    next_state: ProvisioningState,
    provisioner: &'a dyn Provisioner,
}

impl<'a> HostStateMachine<'a> {
    pub fn new(host: &'a mut MetalHost, provisioner: &'a dyn Provisioner) -> Self {
        // Remain in the current state unless a handler decides otherwise
        let next_state = host.provisioning_state();
        Self {
            host,
            next_state,
            provisioner,
        }
    }

    /// Run one reconcile tick.
    ///
    /// The state change (if any) is committed on every return path, so the
    /// caller can persist the host record and then run the queued post-save
    /// callbacks.
    pub async fn reconcile_state(&mut self, info: &mut ReconcileInfo) -> ActionResult {
        let initial_state = self.host.provisioning_state();
        let result = self.dispatch(initial_state, info).await;
        self.commit_state_change(initial_state, info);
        result
    }

    async fn dispatch(
        &mut self,
        initial_state: ProvisioningState,
        info: &mut ReconcileInfo,
    ) -> ActionResult {
        if self.check_initiate_delete() {
            info!(host = %info.request, "initiating host deletion");
            return ActionResult::Complete;
        }

        if let Some(result) = self.ensure_registered(info).await {
            metrics::HOST_REGISTRATION_REQUIRED.inc();
            return result;
        }

        match initial_state {
            ProvisioningState::None => self.handle_none(info),
            ProvisioningState::Unmanaged => self.handle_unmanaged().await,
            ProvisioningState::Registering => self.handle_registering(),
            ProvisioningState::Inspecting => self.handle_inspecting().await,
            ProvisioningState::MatchProfile => self.handle_match_profile().await,
            ProvisioningState::ExternallyProvisioned => {
                self.handle_externally_provisioned().await
            }
            ProvisioningState::Available | ProvisioningState::Ready => self.handle_ready().await,
            ProvisioningState::Provisioning => self.handle_provisioning().await,
            ProvisioningState::Provisioned => self.handle_provisioned().await,
            ProvisioningState::Deprovisioning => self.handle_deprovisioning(info).await,
            ProvisioningState::Deleting => self.handle_deleting().await,
        }
    }

    /// Steer the trajectory toward deletion once a deletion timestamp is
    /// set. Returns true when the tick should short-circuit with the state
    /// jump alone.
    fn check_initiate_delete(&mut self) -> bool {
        if !self.host.deletion_requested() {
            return false;
        }

        match self.next_state {
            ProvisioningState::Provisioning | ProvisioningState::Provisioned => {
                self.next_state = ProvisioningState::Deprovisioning;
                true
            }
            // Already tearing down; let the handler continue the work
            ProvisioningState::Deprovisioning | ProvisioningState::Deleting => false,
            _ => {
                self.next_state = ProvisioningState::Deleting;
                true
            }
        }
    }

    /// Guarantee the backend holds a registration for this host before any
    /// state past `Unmanaged` runs its handler.
    ///
    /// Skipped during teardown even if credentials changed, which means a
    /// host can become undeprovisionable if the backend loses its node
    /// record mid-deletion. Known limitation, kept deliberately.
    ///
    /// A non-empty return value replaces the state handler result for this
    /// tick.
    async fn ensure_registered(&mut self, info: &mut ReconcileInfo) -> Option<ActionResult> {
        match self.next_state {
            ProvisioningState::None | ProvisioningState::Unmanaged => return Option::None,
            _ => {}
        }
        if self.host.deletion_requested() {
            return Option::None;
        }

        let creds = match &info.bmc_credentials {
            Some(creds) => creds.clone(),
            Option::None => {
                return Some(ActionResult::error(format!(
                    "no BMC credentials loaded for {}",
                    info.request
                )))
            }
        };

        let good_match = self
            .host
            .status
            .as_ref()
            .is_some_and(|s| s.good_credentials.matches(&creds));
        if good_match {
            // Credentials are unchanged since we verified them
            return Option::None;
        }

        record_state_begin(self.host, ProvisioningState::Registering, Utc::now());

        if self.host.error_type() == Some(ErrorType::RegistrationError) {
            let tried_match = self
                .host
                .status
                .as_ref()
                .is_some_and(|s| s.tried_credentials.matches(&creds));
            if tried_match {
                // Already tried with these credentials; no point retrying
                info!(host = %info.request, "unmodified credentials; not retrying registration");
                return Some(ActionResult::Failed(ErrorType::RegistrationError));
            }
            info!(host = %info.request, "modified credentials detected; retrying registration");
        }

        self.host.status_mut().tried_credentials = creds.clone();
        let result = self.provisioner.register(self.host).await;
        if result.is_complete() {
            self.host.status_mut().good_credentials = creds;
            if self.host.provisioning_state() != ProvisioningState::Registering {
                // Close the synthetic registering interval opened above
                record_state_end(info, self.host, ProvisioningState::Registering, Utc::now());
            }
        }
        Some(result)
    }

    fn handle_none(&mut self, info: &mut ReconcileInfo) -> ActionResult {
        // No state recorded yet; move to Registering or Unmanaged immediately
        if self.host.has_bmc_details() {
            self.next_state = ProvisioningState::Registering;
        } else {
            info.publish_event("Discovered", "Discovered host with no BMC details");
            self.host
                .set_operational_status(OperationalStatus::Discovered);
            self.next_state = ProvisioningState::Unmanaged;
            metrics::HOST_UNMANAGED.inc();
        }
        ActionResult::Complete
    }

    async fn handle_unmanaged(&mut self) -> ActionResult {
        let result = self.provisioner.unmanaged(self.host).await;
        if result.is_complete() {
            self.next_state = ProvisioningState::Registering;
        }
        result
    }

    fn handle_registering(&mut self) -> ActionResult {
        // Reaching this handler at all means registration with the current
        // credentials succeeded, so move on. The host will not return to
        // Registering even if the credentials change later.
        self.host.clear_error();
        if self.host.spec.externally_provisioned {
            self.next_state = ProvisioningState::ExternallyProvisioned;
        } else {
            self.next_state = ProvisioningState::Inspecting;
        }
        ActionResult::Complete
    }

    async fn handle_inspecting(&mut self) -> ActionResult {
        let result = self.provisioner.inspect(self.host).await;
        if result.is_complete() {
            self.host.clear_error();
            self.next_state = ProvisioningState::MatchProfile;
        }
        result
    }

    async fn handle_match_profile(&mut self) -> ActionResult {
        let result = self.provisioner.match_profile(self.host).await;
        if result.is_complete() {
            self.host.clear_error();
            self.next_state = ProvisioningState::Ready;
        }
        result
    }

    async fn handle_externally_provisioned(&mut self) -> ActionResult {
        if self.host.spec.externally_provisioned {
            return self.provisioner.manage_steady_state(self.host).await;
        }

        // The operator reclaimed the host; pick up wherever data is missing
        if self.host.needs_inspection() {
            self.next_state = ProvisioningState::Inspecting;
        } else if self.host.needs_hardware_profile() {
            self.next_state = ProvisioningState::MatchProfile;
        } else {
            self.next_state = ProvisioningState::Ready;
        }
        ActionResult::Complete
    }

    async fn handle_ready(&mut self) -> ActionResult {
        if self.host.spec.externally_provisioned {
            self.next_state = ProvisioningState::ExternallyProvisioned;
            return ActionResult::Complete;
        }

        let result = self.provisioner.manage_ready(self.host).await;
        if result.is_complete() {
            self.host.clear_error();
            self.next_state = ProvisioningState::Provisioning;
        }
        result
    }

    /// Whether in-flight provisioning no longer matches the desired state.
    ///
    /// Removing the image from the spec counts as cancellation and will
    /// tear down a provisioned host. While the backend has not locked in an
    /// image yet, spec changes are not cancellations, so early image edits
    /// do not thrash.
    fn provisioning_cancelled(&self) -> bool {
        if self.host.has_error() {
            return true;
        }
        let spec_url = match self.host.spec.image.as_ref() {
            Some(image) => image.url.as_str(),
            Option::None => return true,
        };
        if spec_url.is_empty() {
            return true;
        }
        let locked_url = self
            .host
            .status
            .as_ref()
            .and_then(|s| s.provisioning.image.as_ref())
            .map(|image| image.url.as_str())
            .unwrap_or("");
        if locked_url.is_empty() {
            return false;
        }
        locked_url != spec_url
    }

    async fn handle_provisioning(&mut self) -> ActionResult {
        if self.provisioning_cancelled() {
            self.next_state = ProvisioningState::Deprovisioning;
            return ActionResult::Complete;
        }

        let result = self.provisioner.provision(self.host).await;
        if result.is_complete() {
            self.host.clear_error();
            self.next_state = ProvisioningState::Provisioned;
        }
        result
    }

    async fn handle_provisioned(&mut self) -> ActionResult {
        if self.provisioning_cancelled() {
            self.next_state = ProvisioningState::Deprovisioning;
            return ActionResult::Complete;
        }

        self.provisioner.manage_steady_state(self.host).await
    }

    async fn handle_deprovisioning(&mut self, info: &mut ReconcileInfo) -> ActionResult {
        let mut result = self.provisioner.deprovision(self.host).await;

        match result {
            ActionResult::Complete => {
                if self.host.deletion_requested() {
                    self.next_state = ProvisioningState::Deleting;
                } else {
                    self.next_state = ProvisioningState::Ready;
                }
            }
            ActionResult::Failed(_) if self.host.deletion_requested() => {
                // The backend gave up deprovisioning while a deletion is
                // pending; continue to delete anyway
                self.next_state = ProvisioningState::Deleting;
                info.post_save_callbacks
                    .push(Box::new(|| metrics::DELETE_WITHOUT_DEPROVISION.inc()));
                result = ActionResult::Complete;
            }
            _ => {}
        }
        result
    }

    async fn handle_deleting(&mut self) -> ActionResult {
        self.provisioner.delete(self.host).await
    }

    /// Commit the state change decided during this tick, stamping the
    /// operation intervals and queueing the transition metrics.
    fn commit_state_change(&mut self, initial_state: ProvisioningState, info: &mut ReconcileInfo) {
        if self.next_state == initial_state {
            return;
        }
        debug_assert!(
            allowed_transitions(initial_state).contains(&self.next_state),
            "transition {initial_state} -> {} is not in the transition table",
            self.next_state
        );

        info!(
            host = %info.request,
            old = %initial_state,
            new = %self.next_state,
            "changing provisioning state"
        );

        let now = Utc::now();
        record_state_end(info, self.host, initial_state, now);
        record_state_begin(self.host, self.next_state, now);

        let from = initial_state.to_string();
        let to = self.next_state.to_string();
        info.post_save_callbacks
            .push(Box::new(move || metrics::STATE_CHANGES.inc(&[&from, &to])));

        self.host.status_mut().provisioning.state = self.next_state;

        match self.next_state {
            ProvisioningState::Inspecting | ProvisioningState::Provisioning => {
                if update_boot_mode_status(self.host) {
                    info!(
                        host = %info.request,
                        mode = %self.host.boot_mode(),
                        "saving boot mode"
                    );
                }
            }
            _ => {}
        }
    }
}

/// Open a fresh operation interval for a state, unless one is already open
fn record_state_begin(host: &mut MetalHost, state: ProvisioningState, time: DateTime<Utc>) {
    if let Some(metric) = host.operation_metric_for_state(state) {
        if metric.start.is_none() || metric.end.is_some() {
            metric.start = Some(time);
            metric.end = Option::None;
        }
    }
}

/// Close an open operation interval and queue a duration observation
fn record_state_end(
    info: &mut ReconcileInfo,
    host: &mut MetalHost,
    state: ProvisioningState,
    time: DateTime<Utc>,
) {
    if let Some(metric) = host.operation_metric_for_state(state) {
        if metric.start.is_some() {
            metric.end = Some(time);
            let label = state.to_string();
            let duration = metric.duration_seconds();
            info.post_save_callbacks.push(Box::new(move || {
                if let Some(seconds) = duration {
                    metrics::STATE_DURATION.observe(&label, seconds);
                }
            }));
        }
    }
}

/// Save the currently computed boot mode on the status; true when it changed
fn update_boot_mode_status(host: &mut MetalHost) -> bool {
    let mode = host.boot_mode();
    let status = host.status_mut();
    if status.provisioning.boot_mode == Some(mode) {
        return false;
    }
    status.provisioning.boot_mode = Some(mode);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{BmcDetails, BootMode, HardwareDetails, Image};
    use crate::provisioner::fixture::{FixtureProvisioner, Operation};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    const CURRENT_FINGERPRINT: &str = "1001";

    fn creds(fingerprint: &str) -> CredentialsVersion {
        CredentialsVersion::new("node-0-bmc", fingerprint)
    }

    fn host_in_state(state: ProvisioningState) -> MetalHost {
        let mut host = MetalHost::new("node-0", serde_json::from_str("{}").unwrap());
        host.metadata.namespace = Some("metal".into());
        host.spec.bmc = Some(BmcDetails {
            address: "redfish://10.0.0.8".into(),
            credentials_name: "node-0-bmc".into(),
        });
        host.status_mut().provisioning.state = state;
        // Registered with the currently loaded credentials
        host.status_mut().good_credentials = creds(CURRENT_FINGERPRINT);
        host
    }

    fn info() -> ReconcileInfo {
        ReconcileInfo::new("metal/node-0", Some(creds(CURRENT_FINGERPRINT)))
    }

    fn image(url: &str) -> Image {
        Image {
            url: url.into(),
            checksum: Option::None,
        }
    }

    fn mark_for_deletion(host: &mut MetalHost) {
        host.metadata.deletion_timestamp = Some(Time(Utc::now()));
    }

    async fn tick(
        host: &mut MetalHost,
        provisioner: &FixtureProvisioner,
        info: &mut ReconcileInfo,
    ) -> ActionResult {
        let mut machine = HostStateMachine::new(host, provisioner);
        machine.reconcile_state(info).await
    }

    fn run_post_save(info: &mut ReconcileInfo) {
        for callback in info.post_save_callbacks.drain(..) {
            callback();
        }
    }

    // -- Discovery -----------------------------------------------------------

    #[tokio::test]
    async fn test_discovery_without_bmc_goes_unmanaged() {
        let mut host = MetalHost::new("node-0", serde_json::from_str("{}").unwrap());
        host.metadata.namespace = Some("metal".into());
        let provisioner = FixtureProvisioner::new();
        let mut info = ReconcileInfo::new("metal/node-0", Option::None);

        let unmanaged_before = metrics::HOST_UNMANAGED.get();
        let change_before = metrics::STATE_CHANGES.get(&["", "unmanaged"]);

        let result = tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(result, ActionResult::Complete);
        assert_eq!(host.provisioning_state(), ProvisioningState::Unmanaged);
        assert_eq!(host.operational_status(), OperationalStatus::Discovered);
        assert_eq!(
            info.events,
            vec![HostEvent {
                reason: "Discovered".into(),
                message: "Discovered host with no BMC details".into(),
            }]
        );
        assert_eq!(metrics::HOST_UNMANAGED.get(), unmanaged_before + 1);
        assert_eq!(provisioner.total_calls(), 0);

        run_post_save(&mut info);
        assert_eq!(
            metrics::STATE_CHANGES.get(&["", "unmanaged"]),
            change_before + 1
        );
    }

    #[tokio::test]
    async fn test_discovery_with_bmc_goes_registering() {
        let mut host = host_in_state(ProvisioningState::None);
        host.status_mut().good_credentials = CredentialsVersion::default();
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        let result = tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(result, ActionResult::Complete);
        assert_eq!(host.provisioning_state(), ProvisioningState::Registering);
        assert!(info.events.is_empty());
        // Registration is not attempted while still in the discovery step
        assert_eq!(provisioner.calls(Operation::Register), 0);
    }

    // -- Registration --------------------------------------------------------

    #[tokio::test]
    async fn test_credential_rotation_retries_registration() {
        let mut host = host_in_state(ProvisioningState::Inspecting);
        host.status_mut().good_credentials = creds("0900");
        host.status_mut().tried_credentials = creds("0950");
        host.set_error(ErrorType::RegistrationError, "registration failed");
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        let result = tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(result, ActionResult::Complete);
        assert_eq!(provisioner.calls(Operation::Register), 1);
        // Registration short-circuits the tick: no state change, and the
        // error is left for the inspection handler to clear
        assert_eq!(host.provisioning_state(), ProvisioningState::Inspecting);
        assert_eq!(host.error_type(), Some(ErrorType::RegistrationError));
        assert_eq!(provisioner.calls(Operation::Inspect), 0);
        // The working credentials are recorded
        assert!(host
            .status_mut()
            .good_credentials
            .matches(&creds(CURRENT_FINGERPRINT)));
        assert!(host
            .status_mut()
            .tried_credentials
            .matches(&creds(CURRENT_FINGERPRINT)));
    }

    #[tokio::test]
    async fn test_unchanged_credentials_fail_fast() {
        let mut host = host_in_state(ProvisioningState::Inspecting);
        host.status_mut().good_credentials = creds("0900");
        host.status_mut().tried_credentials = creds(CURRENT_FINGERPRINT);
        host.set_error(ErrorType::RegistrationError, "registration failed");
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        let required_before = metrics::HOST_REGISTRATION_REQUIRED.get();
        let result = tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(result, ActionResult::Failed(ErrorType::RegistrationError));
        assert_eq!(host.provisioning_state(), ProvisioningState::Inspecting);
        // No backend contact at all on the fast path
        assert_eq!(provisioner.total_calls(), 0);
        assert!(metrics::HOST_REGISTRATION_REQUIRED.get() >= required_before + 1);
    }

    #[tokio::test]
    async fn test_registration_completes_over_two_ticks() {
        let mut host = host_in_state(ProvisioningState::Registering);
        host.status_mut().good_credentials = CredentialsVersion::default();
        let provisioner = FixtureProvisioner::new();

        // First tick performs the registration and short-circuits
        let mut first = info();
        let result = tick(&mut host, &provisioner, &mut first).await;
        assert_eq!(result, ActionResult::Complete);
        assert_eq!(host.provisioning_state(), ProvisioningState::Registering);
        assert_eq!(provisioner.calls(Operation::Register), 1);

        // Second tick sees matching credentials and advances
        let mut second = info();
        let result = tick(&mut host, &provisioner, &mut second).await;
        assert_eq!(result, ActionResult::Complete);
        assert_eq!(host.provisioning_state(), ProvisioningState::Inspecting);
        assert_eq!(provisioner.calls(Operation::Register), 1);
        assert!(!host.has_error());
    }

    #[tokio::test]
    async fn test_registering_goes_externally_provisioned_when_requested() {
        let mut host = host_in_state(ProvisioningState::Registering);
        host.spec.externally_provisioned = true;
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        let result = tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(result, ActionResult::Complete);
        assert_eq!(
            host.provisioning_state(),
            ProvisioningState::ExternallyProvisioned
        );
    }

    // -- Provisioning cancellation -------------------------------------------

    #[tokio::test]
    async fn test_image_change_cancels_provisioning() {
        let mut host = host_in_state(ProvisioningState::Provisioning);
        host.spec.image = Some(image("http://a"));
        host.status_mut().provisioning.image = Some(image("http://b"));
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        let result = tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(result, ActionResult::Complete);
        assert_eq!(host.provisioning_state(), ProvisioningState::Deprovisioning);
        assert_eq!(provisioner.calls(Operation::Provision), 0);
    }

    #[tokio::test]
    async fn test_unlocked_image_does_not_cancel() {
        let mut host = host_in_state(ProvisioningState::Provisioning);
        host.spec.image = Some(image("http://a"));
        // The backend has not locked in an image yet
        assert!(host.status_mut().provisioning.image.is_none());
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        let result = tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(result, ActionResult::Complete);
        assert_eq!(host.provisioning_state(), ProvisioningState::Provisioned);
        assert_eq!(provisioner.calls(Operation::Provision), 1);
    }

    #[tokio::test]
    async fn test_image_removal_cancels_provisioned_host() {
        let mut host = host_in_state(ProvisioningState::Provisioned);
        host.spec.image = Option::None;
        host.status_mut().provisioning.image = Some(image("http://a"));
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        let result = tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(result, ActionResult::Complete);
        assert_eq!(host.provisioning_state(), ProvisioningState::Deprovisioning);
        assert_eq!(provisioner.calls(Operation::ManageSteadyState), 0);
    }

    #[tokio::test]
    async fn test_recorded_error_cancels_provisioning() {
        let mut host = host_in_state(ProvisioningState::Provisioning);
        host.spec.image = Some(image("http://a"));
        host.status_mut().provisioning.image = Some(image("http://a"));
        host.set_error(ErrorType::ProvisioningError, "image write failed");
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        let result = tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(result, ActionResult::Complete);
        assert_eq!(host.provisioning_state(), ProvisioningState::Deprovisioning);
        assert_eq!(provisioner.calls(Operation::Provision), 0);
    }

    // -- Deletion ------------------------------------------------------------

    #[tokio::test]
    async fn test_delete_during_provisioned_goes_deprovisioning() {
        let mut host = host_in_state(ProvisioningState::Provisioned);
        host.spec.image = Some(image("http://a"));
        host.status_mut().provisioning.image = Some(image("http://a"));
        mark_for_deletion(&mut host);
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        let result = tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(result, ActionResult::Complete);
        assert_eq!(host.provisioning_state(), ProvisioningState::Deprovisioning);
        assert_eq!(provisioner.calls(Operation::ManageSteadyState), 0);
    }

    #[tokio::test]
    async fn test_delete_from_early_states_goes_straight_to_deleting() {
        for state in [
            ProvisioningState::None,
            ProvisioningState::Unmanaged,
            ProvisioningState::Registering,
            ProvisioningState::Inspecting,
            ProvisioningState::MatchProfile,
            ProvisioningState::Available,
            ProvisioningState::Ready,
            ProvisioningState::ExternallyProvisioned,
        ] {
            let mut host = host_in_state(state);
            mark_for_deletion(&mut host);
            let provisioner = FixtureProvisioner::new();
            let mut info = info();

            let result = tick(&mut host, &provisioner, &mut info).await;

            assert_eq!(result, ActionResult::Complete, "from {state}");
            assert_eq!(
                host.provisioning_state(),
                ProvisioningState::Deleting,
                "from {state}"
            );
            assert_eq!(provisioner.total_calls(), 0, "from {state}");
        }
    }

    #[tokio::test]
    async fn test_deprovision_failure_during_deletion_continues_to_delete() {
        let mut host = host_in_state(ProvisioningState::Deprovisioning);
        mark_for_deletion(&mut host);
        let provisioner = FixtureProvisioner::new().with_result(
            Operation::Deprovision,
            ActionResult::Failed(ErrorType::ProvisioningError),
        );
        let mut info = info();

        let give_up_before = metrics::DELETE_WITHOUT_DEPROVISION.get();
        let result = tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(result, ActionResult::Complete);
        assert_eq!(host.provisioning_state(), ProvisioningState::Deleting);
        // The give-up metric only fires once the record is saved
        assert_eq!(metrics::DELETE_WITHOUT_DEPROVISION.get(), give_up_before);
        run_post_save(&mut info);
        assert_eq!(
            metrics::DELETE_WITHOUT_DEPROVISION.get(),
            give_up_before + 1
        );
    }

    #[tokio::test]
    async fn test_deprovision_failure_without_deletion_stays_put() {
        let mut host = host_in_state(ProvisioningState::Deprovisioning);
        let provisioner = FixtureProvisioner::new().with_result(
            Operation::Deprovision,
            ActionResult::Failed(ErrorType::ProvisioningError),
        );
        let mut info = info();

        let result = tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(result, ActionResult::Failed(ErrorType::ProvisioningError));
        assert_eq!(host.provisioning_state(), ProvisioningState::Deprovisioning);
    }

    #[tokio::test]
    async fn test_deprovision_complete_without_deletion_returns_to_ready() {
        let mut host = host_in_state(ProvisioningState::Deprovisioning);
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        let result = tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(result, ActionResult::Complete);
        assert_eq!(host.provisioning_state(), ProvisioningState::Ready);
    }

    #[tokio::test]
    async fn test_no_reregistration_during_teardown() {
        let mut host = host_in_state(ProvisioningState::Deprovisioning);
        // Credentials changed since registration, but a deletion is pending
        host.status_mut().good_credentials = creds("0900");
        mark_for_deletion(&mut host);
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        let result = tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(result, ActionResult::Complete);
        assert_eq!(provisioner.calls(Operation::Register), 0);
        assert_eq!(provisioner.calls(Operation::Deprovision), 1);
        assert_eq!(host.provisioning_state(), ProvisioningState::Deleting);
    }

    // -- Externally provisioned ----------------------------------------------

    #[tokio::test]
    async fn test_externally_provisioned_runs_steady_state() {
        let mut host = host_in_state(ProvisioningState::ExternallyProvisioned);
        host.spec.externally_provisioned = true;
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        let result = tick(&mut host, &provisioner, &mut info).await;

        assert!(matches!(result, ActionResult::Delayed(_)));
        assert_eq!(
            host.provisioning_state(),
            ProvisioningState::ExternallyProvisioned
        );
        assert_eq!(provisioner.calls(Operation::ManageSteadyState), 1);
    }

    #[tokio::test]
    async fn test_reclaimed_host_is_reclassified() {
        // Inspection missing
        let mut host = host_in_state(ProvisioningState::ExternallyProvisioned);
        let provisioner = FixtureProvisioner::new();
        let mut ctx = info();
        tick(&mut host, &provisioner, &mut ctx).await;
        assert_eq!(host.provisioning_state(), ProvisioningState::Inspecting);

        // Inspection present, profile missing
        let mut host = host_in_state(ProvisioningState::ExternallyProvisioned);
        host.status_mut().hardware = Some(HardwareDetails::default());
        let mut ctx = info();
        tick(&mut host, &provisioner, &mut ctx).await;
        assert_eq!(host.provisioning_state(), ProvisioningState::MatchProfile);

        // Everything recorded
        let mut host = host_in_state(ProvisioningState::ExternallyProvisioned);
        host.status_mut().hardware = Some(HardwareDetails::default());
        host.status_mut().hardware_profile = "compute".into();
        let mut ctx = info();
        tick(&mut host, &provisioner, &mut ctx).await;
        assert_eq!(host.provisioning_state(), ProvisioningState::Ready);
    }

    #[tokio::test]
    async fn test_ready_host_follows_externally_provisioned_flag() {
        let mut host = host_in_state(ProvisioningState::Ready);
        host.spec.externally_provisioned = true;
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        let result = tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(result, ActionResult::Complete);
        assert_eq!(
            host.provisioning_state(),
            ProvisioningState::ExternallyProvisioned
        );
        assert_eq!(provisioner.calls(Operation::ManageReady), 0);
    }

    // -- Aliasing ------------------------------------------------------------

    #[tokio::test]
    async fn test_available_is_handled_like_ready() {
        let mut host = host_in_state(ProvisioningState::Available);
        host.spec.image = Some(image("http://a"));
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        let result = tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(result, ActionResult::Complete);
        assert_eq!(host.provisioning_state(), ProvisioningState::Provisioning);
        assert_eq!(provisioner.calls(Operation::ManageReady), 1);
    }

    // -- Boot mode -----------------------------------------------------------

    #[tokio::test]
    async fn test_boot_mode_saved_on_entry_to_inspecting() {
        let mut host = host_in_state(ProvisioningState::Registering);
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(host.provisioning_state(), ProvisioningState::Inspecting);
        assert_eq!(
            host.status_mut().provisioning.boot_mode,
            Some(BootMode::Uefi)
        );
    }

    #[tokio::test]
    async fn test_boot_mode_saved_on_entry_to_provisioning() {
        let mut host = host_in_state(ProvisioningState::Ready);
        host.spec.image = Some(image("http://a"));
        host.spec.boot_mode = Some(BootMode::Legacy);
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        tick(&mut host, &provisioner, &mut info).await;

        assert_eq!(host.provisioning_state(), ProvisioningState::Provisioning);
        assert_eq!(
            host.status_mut().provisioning.boot_mode,
            Some(BootMode::Legacy)
        );
    }

    // -- Operation intervals -------------------------------------------------

    #[tokio::test]
    async fn test_inspection_interval_closed_on_exit() {
        let mut host = host_in_state(ProvisioningState::Inspecting);
        let opened = Utc::now() - chrono::Duration::seconds(30);
        host.status_mut().operation_history.inspect.start = Some(opened);
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        let observed_before = metrics::STATE_DURATION.count("inspecting");
        tick(&mut host, &provisioner, &mut info).await;

        let interval = host.status_mut().operation_history.inspect.clone();
        let end = interval.end.expect("interval closed on exit");
        assert!(end >= opened);
        // The duration observation is deferred until after the save
        assert_eq!(metrics::STATE_DURATION.count("inspecting"), observed_before);
        run_post_save(&mut info);
        assert_eq!(
            metrics::STATE_DURATION.count("inspecting"),
            observed_before + 1
        );
    }

    #[tokio::test]
    async fn test_no_interval_close_without_open_interval() {
        let mut host = host_in_state(ProvisioningState::Provisioned);
        host.spec.image = Option::None;
        host.status_mut().provisioning.image = Some(image("http://a"));
        let provisioner = FixtureProvisioner::new();
        let mut info = info();

        // Provisioned -> Deprovisioning; the deprovision interval opens,
        // but no interval closes because Provisioned is untracked
        tick(&mut host, &provisioner, &mut info).await;

        let history = host.status_mut().operation_history.clone();
        assert!(history.deprovision.start.is_some());
        assert!(history.deprovision.end.is_none());
    }

    // -- Idempotence ---------------------------------------------------------

    #[tokio::test]
    async fn test_steady_state_ticks_are_idempotent() {
        let mut host = host_in_state(ProvisioningState::Provisioned);
        host.spec.image = Some(image("http://a"));
        host.status_mut().provisioning.image = Some(image("http://a"));
        let provisioner = FixtureProvisioner::new();

        for _ in 0..2 {
            let mut ctx = info();
            let result = tick(&mut host, &provisioner, &mut ctx).await;
            assert!(matches!(result, ActionResult::Delayed(_)));
            assert_eq!(host.provisioning_state(), ProvisioningState::Provisioned);
            assert!(ctx.post_save_callbacks.is_empty());
        }
        assert_eq!(provisioner.calls(Operation::ManageSteadyState), 2);
    }

    // -- Transition table ----------------------------------------------------

    #[tokio::test]
    async fn test_full_lifecycle_follows_transition_table() {
        let mut host = host_in_state(ProvisioningState::None);
        host.status_mut().good_credentials = CredentialsVersion::default();
        host.spec.image = Some(image("http://images/disk.qcow2"));
        let provisioner = FixtureProvisioner::new();

        let expected = [
            ProvisioningState::Registering,
            ProvisioningState::Registering, // registration tick, no change
            ProvisioningState::Inspecting,
            ProvisioningState::MatchProfile,
            ProvisioningState::Ready,
            ProvisioningState::Provisioning,
            ProvisioningState::Provisioned,
        ];
        for next in expected {
            let before = host.provisioning_state();
            let mut ctx = info();
            tick(&mut host, &provisioner, &mut ctx).await;
            let after = host.provisioning_state();
            assert_eq!(after, next);
            if after != before {
                assert!(
                    allowed_transitions(before).contains(&after),
                    "{before} -> {after}"
                );
            }
        }

        // Registration and inspection intervals were opened and closed
        let history = host.status_mut().operation_history.clone();
        assert!(history.register.start.is_some() && history.register.end.is_some());
        assert!(history.inspect.start.is_some() && history.inspect.end.is_some());
        assert!(history.provision.start.is_some() && history.provision.end.is_some());

        // Teardown
        mark_for_deletion(&mut host);
        for next in [ProvisioningState::Deprovisioning, ProvisioningState::Deleting] {
            let before = host.provisioning_state();
            let mut ctx = info();
            tick(&mut host, &provisioner, &mut ctx).await;
            let after = host.provisioning_state();
            assert_eq!(after, next);
            assert!(
                allowed_transitions(before).contains(&after),
                "{before} -> {after}"
            );
        }

        // Terminal: the delete action completes and the state is final
        let mut ctx = info();
        let result = tick(&mut host, &provisioner, &mut ctx).await;
        assert_eq!(result, ActionResult::Complete);
        assert_eq!(host.provisioning_state(), ProvisioningState::Deleting);
    }

    #[test]
    fn test_transition_table_shape() {
        assert_eq!(
            allowed_transitions(ProvisioningState::Provisioned),
            &[ProvisioningState::Deprovisioning]
        );
        assert!(allowed_transitions(ProvisioningState::Deleting).is_empty());
        assert_eq!(
            allowed_transitions(ProvisioningState::Available),
            allowed_transitions(ProvisioningState::Ready)
        );
    }
}
