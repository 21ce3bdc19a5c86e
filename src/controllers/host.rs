//! MetalHost Controller
//!
//! Reconciles MetalHost custom resources by running the host lifecycle
//! state machine and acting on its result: persisting the mutated status,
//! publishing queued events, running deferred metric callbacks, and
//! translating the [`ActionResult`] into a requeue decision.

use crate::controllers::error_policy_backoff;
use crate::controllers::state_machine::{HostEvent, HostStateMachine, ReconcileInfo};
use crate::crd::{CredentialsVersion, ErrorType, MetalHost, ProvisioningState};
use crate::error::{OperatorError, Result};
use crate::provisioner::{ActionResult, Provisioner};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Finalizer guarding backend cleanup before the resource disappears
pub const HOST_FINALIZER: &str = "hostforge.io/metalhost-cleanup";

/// Requeue after a completed step, to promptly run the next state's handler
const COMPLETE_REQUEUE: Duration = Duration::from_secs(1);
/// Requeue while the backend reports work in progress
const CONTINUE_REQUEUE: Duration = Duration::from_secs(10);

/// Retry delay for a classified failure, by error class
fn failed_requeue(kind: ErrorType) -> Duration {
    let delay_secs = match kind {
        // Waiting on the operator to fix credentials; no point hammering
        ErrorType::RegistrationError => 60,
        ErrorType::InspectionError | ErrorType::ProvisioningError => 30,
        // Power state flips tend to resolve quickly
        ErrorType::PowerManagementError => 10,
    };
    Duration::from_secs(delay_secs)
}

/// Context for the host controller
pub struct HostController {
    client: Client,
    provisioner: Arc<dyn Provisioner>,
    reporter: Reporter,
    namespace: Option<String>,
}

impl HostController {
    /// Create a new host controller driving the given provisioner backend
    pub fn new(client: Client, provisioner: Arc<dyn Provisioner>, namespace: Option<String>) -> Self {
        let reporter = Reporter {
            controller: "hostforge-operator".into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            client,
            provisioner,
            reporter,
            namespace,
        }
    }

    /// Run the host controller until shutdown
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let hosts: Api<MetalHost> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        info!("Starting MetalHost controller");

        Controller::new(hosts, Config::default())
            .shutdown_on_signal()
            .run(
                |host, ctx| async move { ctx.reconcile(host).await },
                |host, error, ctx| {
                    error!(host = %host.name_any(), "Reconciliation error: {error}");
                    error_policy_backoff(host, error, ctx)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        info!("Reconciled host: {}", obj.name);
                    }
                    Err(e) => {
                        error!("Reconciliation failed: {e:?}");
                    }
                }
            })
            .await;

        Ok(())
    }

    /// Reconcile a MetalHost
    async fn reconcile(
        &self,
        host: Arc<MetalHost>,
    ) -> std::result::Result<Action, OperatorError> {
        let name = host.name_any();
        let namespace = host.namespace().unwrap_or_else(|| "default".to_string());
        let request = format!("{namespace}/{name}");

        info!(host = %request, state = %host.provisioning_state(), "Reconciling MetalHost");

        let mut host = (*host).clone();

        if !host.deletion_requested() {
            self.ensure_finalizer(&host, &namespace).await?;
        }

        let bmc_credentials = self.load_credentials(&host, &namespace).await?;
        if host.has_bmc_details() && bmc_credentials.is_none() {
            // Registration cannot proceed until the referenced secret exists
            let secret_name = host
                .spec
                .bmc
                .as_ref()
                .map(|bmc| bmc.credentials_name.clone())
                .unwrap_or_default();
            host.set_error(
                ErrorType::RegistrationError,
                format!("BMC credentials secret {namespace}/{secret_name} not found"),
            );
            self.save_status(&mut host, &namespace).await?;
            return Ok(Action::requeue(failed_requeue(ErrorType::RegistrationError)));
        }

        let initial_state = host.provisioning_state();
        let mut info = ReconcileInfo::new(request.clone(), bmc_credentials);
        let result = {
            let mut machine = HostStateMachine::new(&mut host, self.provisioner.as_ref());
            machine.reconcile_state(&mut info).await
        };

        if let ActionResult::Failed(kind) = &result {
            host.set_error(*kind, format!("action failed: {kind}"));
        }

        // The backend finished its cleanup for a host that was already in
        // Deleting at tick entry: drop the finalizer instead of writing
        // status to a disappearing object.
        if initial_state == ProvisioningState::Deleting && result.is_complete() {
            self.remove_finalizer(&host, &namespace).await?;
            for callback in info.post_save_callbacks {
                callback();
            }
            info!(host = %request, "Host cleanup complete");
            return Ok(Action::await_change());
        }

        self.save_status(&mut host, &namespace).await?;

        // Side effects only after the record is safely persisted; a failed
        // save drops them and the next tick recomputes the same decision
        self.publish_events(&host, &info.events).await;
        for callback in info.post_save_callbacks {
            callback();
        }

        match result {
            ActionResult::Complete => Ok(Action::requeue(COMPLETE_REQUEUE)),
            ActionResult::Continue => Ok(Action::requeue(CONTINUE_REQUEUE)),
            ActionResult::Delayed(delay) => Ok(Action::requeue(delay)),
            ActionResult::Failed(kind) => Ok(Action::requeue(failed_requeue(kind))),
            ActionResult::Error(message) => Err(OperatorError::Reconciliation(message)),
        }
    }

    /// Ensure the cleanup finalizer is present on the resource
    async fn ensure_finalizer(&self, host: &MetalHost, namespace: &str) -> Result<()> {
        if host.finalizers().iter().any(|f| f.as_str() == HOST_FINALIZER) {
            return Ok(());
        }

        let hosts: Api<MetalHost> = Api::namespaced(self.client.clone(), namespace);
        let mut finalizers = host.finalizers().to_vec();
        finalizers.push(HOST_FINALIZER.to_string());
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        hosts
            .patch(&host.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }

    /// Remove the cleanup finalizer, releasing the resource for deletion
    async fn remove_finalizer(&self, host: &MetalHost, namespace: &str) -> Result<()> {
        let hosts: Api<MetalHost> = Api::namespaced(self.client.clone(), namespace);
        let finalizers: Vec<String> = host
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != HOST_FINALIZER)
            .cloned()
            .collect();

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        hosts
            .patch(&host.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        info!(host = %host.name_any(), "Finalizer removed");
        Ok(())
    }

    /// Load the referenced BMC credentials Secret and derive its version
    /// fingerprint. Only the fingerprint travels further; the credential
    /// material stays in the Secret.
    async fn load_credentials(
        &self,
        host: &MetalHost,
        namespace: &str,
    ) -> Result<Option<CredentialsVersion>> {
        let Some(bmc) = host.spec.bmc.as_ref() else {
            return Ok(None);
        };
        if bmc.credentials_name.is_empty() {
            return Ok(None);
        }

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match secrets.get(&bmc.credentials_name).await {
            Ok(secret) => {
                let fingerprint = secret.metadata.resource_version.unwrap_or_default();
                Ok(Some(CredentialsVersion::new(
                    bmc.credentials_name.clone(),
                    fingerprint,
                )))
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the in-memory status mutations
    async fn save_status(&self, host: &mut MetalHost, namespace: &str) -> Result<()> {
        let hosts: Api<MetalHost> = Api::namespaced(self.client.clone(), namespace);
        host.status_mut().last_updated = Some(Utc::now().to_rfc3339());

        let patch = serde_json::json!({
            "status": host.status
        });
        hosts
            .patch_status(&host.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }

    /// Publish queued events against the host. Event delivery is best
    /// effort; failures are logged and do not fail the reconcile.
    async fn publish_events(&self, host: &MetalHost, events: &[HostEvent]) {
        if events.is_empty() {
            return;
        }

        let reference = host.object_ref(&());
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        for event in events {
            let outcome = recorder
                .publish(Event {
                    type_: EventType::Normal,
                    reason: event.reason.clone(),
                    note: Some(event.message.clone()),
                    action: "Reconcile".into(),
                    secondary: None,
                })
                .await;
            if let Err(e) = outcome {
                warn!(host = %host.name_any(), reason = %event.reason, "Failed to publish event: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_requeue_by_error_class() {
        assert_eq!(
            failed_requeue(ErrorType::RegistrationError),
            Duration::from_secs(60)
        );
        assert_eq!(
            failed_requeue(ErrorType::InspectionError),
            Duration::from_secs(30)
        );
        assert_eq!(
            failed_requeue(ErrorType::ProvisioningError),
            Duration::from_secs(30)
        );
        assert_eq!(
            failed_requeue(ErrorType::PowerManagementError),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_finalizer_name_is_group_qualified() {
        assert!(HOST_FINALIZER.starts_with("hostforge.io/"));
    }
}
