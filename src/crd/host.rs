//! MetalHost Custom Resource Definition
//!
//! Defines the specification and status for a managed bare-metal host.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// MetalHost is the Schema for the metalhosts API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hostforge.io",
    version = "v1alpha1",
    kind = "MetalHost",
    namespaced,
    status = "HostStatus",
    shortname = "mh",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.provisioning.state"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.operationalStatus"}"#,
    printcolumn = r#"{"name":"Error","type":"string","jsonPath":".status.errorType"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HostSpec {
    /// Out-of-band management controller connection details.
    /// A host without BMC details stays unmanaged.
    #[serde(default)]
    pub bmc: Option<BmcDetails>,

    /// Image to provision onto the host
    #[serde(default)]
    pub image: Option<Image>,

    /// The host is provisioned by some other system; the operator only
    /// performs steady-state observation
    #[serde(default)]
    pub externally_provisioned: bool,

    /// Desired power state
    #[serde(default = "default_online")]
    pub online: bool,

    /// Boot mode override; UEFI when unset
    #[serde(default)]
    pub boot_mode: Option<BootMode>,

    /// Requested hardware profile name
    #[serde(default)]
    pub hardware_profile: Option<String>,
}

/// BMC connection details for a host
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BmcDetails {
    /// Address of the BMC, e.g. `ipmi://10.0.0.8:623`
    pub address: String,
    /// Name of the Secret holding the BMC username and password
    pub credentials_name: String,
}

/// An image to be written to a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// URL of the image
    pub url: String,
    /// Checksum of the image
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Firmware boot mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub enum BootMode {
    #[default]
    #[serde(rename = "UEFI")]
    Uefi,
    #[serde(rename = "legacy")]
    Legacy,
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootMode::Uefi => write!(f, "UEFI"),
            BootMode::Legacy => write!(f, "legacy"),
        }
    }
}

/// Provisioning lifecycle state of a host.
///
/// `Available` and `Ready` are aliases kept for API compatibility; both are
/// handled identically.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default,
)]
pub enum ProvisioningState {
    /// No state recorded yet
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "unmanaged")]
    Unmanaged,
    #[serde(rename = "registering")]
    Registering,
    #[serde(rename = "inspecting")]
    Inspecting,
    #[serde(rename = "match-profile")]
    MatchProfile,
    #[serde(rename = "available")]
    Available,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "provisioning")]
    Provisioning,
    #[serde(rename = "provisioned")]
    Provisioned,
    #[serde(rename = "externally-provisioned")]
    ExternallyProvisioned,
    #[serde(rename = "deprovisioning")]
    Deprovisioning,
    #[serde(rename = "deleting")]
    Deleting,
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisioningState::None => "",
            ProvisioningState::Unmanaged => "unmanaged",
            ProvisioningState::Registering => "registering",
            ProvisioningState::Inspecting => "inspecting",
            ProvisioningState::MatchProfile => "match-profile",
            ProvisioningState::Available => "available",
            ProvisioningState::Ready => "ready",
            ProvisioningState::Provisioning => "provisioning",
            ProvisioningState::Provisioned => "provisioned",
            ProvisioningState::ExternallyProvisioned => "externally-provisioned",
            ProvisioningState::Deprovisioning => "deprovisioning",
            ProvisioningState::Deleting => "deleting",
        };
        write!(f, "{s}")
    }
}

/// Coarse operational indicator surfaced to users
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default,
)]
pub enum OperationalStatus {
    #[default]
    #[serde(rename = "")]
    Unset,
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "discovered")]
    Discovered,
    #[serde(rename = "error")]
    Error,
}

/// Classification of the latest recorded error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ErrorType {
    #[serde(rename = "registration error")]
    RegistrationError,
    #[serde(rename = "inspection error")]
    InspectionError,
    #[serde(rename = "provisioning error")]
    ProvisioningError,
    #[serde(rename = "power management error")]
    PowerManagementError,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorType::RegistrationError => "registration error",
            ErrorType::InspectionError => "inspection error",
            ErrorType::ProvisioningError => "provisioning error",
            ErrorType::PowerManagementError => "power management error",
        };
        write!(f, "{s}")
    }
}

/// Reference to the credentials Secret version last used against the BMC.
///
/// Only the Secret name and its `resourceVersion` fingerprint are recorded,
/// never the credential material itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsVersion {
    #[serde(default)]
    pub secret_name: String,
    #[serde(default)]
    pub fingerprint: String,
}

impl CredentialsVersion {
    pub fn new(secret_name: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            secret_name: secret_name.into(),
            fingerprint: fingerprint.into(),
        }
    }

    /// Whether this recorded version refers to the same Secret contents
    pub fn matches(&self, other: &CredentialsVersion) -> bool {
        !self.fingerprint.is_empty()
            && self.secret_name == other.secret_name
            && self.fingerprint == other.fingerprint
    }
}

/// Tracked provisioning information for a host
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningStatus {
    /// Current lifecycle state
    #[serde(default)]
    pub state: ProvisioningState,
    /// Identifier of the node in the provisioner backend
    #[serde(default)]
    pub id: String,
    /// Image the backend has locked in for provisioning
    #[serde(default)]
    pub image: Option<Image>,
    /// Boot mode recorded when inspection or provisioning started
    #[serde(default)]
    pub boot_mode: Option<BootMode>,
}

/// Begin/end timestamps for one long-running operation
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetric {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl OperationMetric {
    /// Duration of a completed interval, in seconds
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

/// Per-operation begin/end intervals, for observability
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct OperationHistory {
    #[serde(default)]
    pub register: OperationMetric,
    #[serde(default)]
    pub inspect: OperationMetric,
    #[serde(default)]
    pub provision: OperationMetric,
    #[serde(default)]
    pub deprovision: OperationMetric,
}

/// Discovered hardware facts, populated by inspection
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct HardwareDetails {
    #[serde(default)]
    pub cpu_arch: String,
    #[serde(default)]
    pub cpu_count: i32,
    #[serde(default)]
    pub ram_mebibytes: i64,
    #[serde(default)]
    pub storage_gigabytes: i64,
    #[serde(default)]
    pub nic_count: i32,
}

/// Status of the MetalHost
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    /// Provisioning state tracking
    #[serde(default)]
    pub provisioning: ProvisioningStatus,

    /// Credentials that demonstrably worked against the BMC
    #[serde(default)]
    pub good_credentials: CredentialsVersion,

    /// Credentials most recently attempted, successfully or not
    #[serde(default)]
    pub tried_credentials: CredentialsVersion,

    /// Class of the latest error, absent when none is outstanding
    #[serde(default)]
    pub error_type: Option<ErrorType>,

    /// Human-readable details of the latest error
    #[serde(default)]
    pub error_message: String,

    /// Coarse operational indicator
    #[serde(default)]
    pub operational_status: OperationalStatus,

    /// Hardware facts recorded by inspection
    #[serde(default)]
    pub hardware: Option<HardwareDetails>,

    /// Matched hardware profile name, empty until matching ran
    #[serde(default)]
    pub hardware_profile: String,

    /// Begin/end timestamps per operation
    #[serde(default)]
    pub operation_history: OperationHistory,

    /// Last time the status was written
    #[serde(default)]
    pub last_updated: Option<String>,
}

impl MetalHost {
    /// Whether BMC connection details are fully specified
    pub fn has_bmc_details(&self) -> bool {
        self.spec
            .bmc
            .as_ref()
            .is_some_and(|bmc| !bmc.address.is_empty() && !bmc.credentials_name.is_empty())
    }

    /// The effective boot mode: the spec override, or UEFI
    pub fn boot_mode(&self) -> BootMode {
        self.spec.boot_mode.unwrap_or_default()
    }

    /// Whether a deletion has been requested for this host
    pub fn deletion_requested(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Hardware inspection is needed when no facts have been recorded yet
    pub fn needs_inspection(&self) -> bool {
        !self.spec.externally_provisioned
            && self.status.as_ref().map_or(true, |s| s.hardware.is_none())
    }

    /// Profile matching is needed until a profile name has been recorded
    pub fn needs_hardware_profile(&self) -> bool {
        self.status
            .as_ref()
            .map_or(true, |s| s.hardware_profile.is_empty())
    }

    /// Whether an error is currently recorded
    pub fn has_error(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.error_type.is_some())
    }

    pub fn provisioning_state(&self) -> ProvisioningState {
        self.status
            .as_ref()
            .map(|s| s.provisioning.state)
            .unwrap_or_default()
    }

    pub fn operational_status(&self) -> OperationalStatus {
        self.status
            .as_ref()
            .map(|s| s.operational_status)
            .unwrap_or_default()
    }

    pub fn error_type(&self) -> Option<ErrorType> {
        self.status.as_ref().and_then(|s| s.error_type)
    }

    /// Mutable status, initialised on first access
    pub fn status_mut(&mut self) -> &mut HostStatus {
        self.status.get_or_insert_with(Default::default)
    }

    /// Record a classified error on the host
    pub fn set_error(&mut self, kind: ErrorType, message: impl Into<String>) {
        let status = self.status_mut();
        status.error_type = Some(kind);
        status.error_message = message.into();
        status.operational_status = OperationalStatus::Error;
    }

    /// Clear any recorded error and mark the host operational
    pub fn clear_error(&mut self) {
        let status = self.status_mut();
        status.error_type = None;
        status.error_message.clear();
        status.operational_status = OperationalStatus::Ok;
    }

    pub fn set_operational_status(&mut self, value: OperationalStatus) {
        self.status_mut().operational_status = value;
    }

    /// The operation interval tracked for a state, if that state has one.
    /// Only states with long-running backend work are tracked.
    pub fn operation_metric_for_state(
        &mut self,
        state: ProvisioningState,
    ) -> Option<&mut OperationMetric> {
        let history = &mut self.status_mut().operation_history;
        match state {
            ProvisioningState::Registering => Some(&mut history.register),
            ProvisioningState::Inspecting => Some(&mut history.inspect),
            ProvisioningState::Provisioning => Some(&mut history.provision),
            ProvisioningState::Deprovisioning => Some(&mut history.deprovision),
            _ => None,
        }
    }
}

fn default_online() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_spec_defaults() {
        let spec: HostSpec = serde_json::from_str("{}").unwrap();
        assert!(spec.bmc.is_none());
        assert!(spec.image.is_none());
        assert!(!spec.externally_provisioned);
        assert!(spec.online);
        assert!(spec.boot_mode.is_none());
    }

    #[test]
    fn test_provisioning_state_default_is_none() {
        assert_eq!(ProvisioningState::default(), ProvisioningState::None);
        let status: HostStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status.provisioning.state, ProvisioningState::None);
    }

    #[test]
    fn test_provisioning_state_serde_round_trip() {
        let json = serde_json::to_string(&ProvisioningState::ExternallyProvisioned).unwrap();
        assert_eq!(json, "\"externally-provisioned\"");
        let state: ProvisioningState = serde_json::from_str("\"match-profile\"").unwrap();
        assert_eq!(state, ProvisioningState::MatchProfile);
        let none: ProvisioningState = serde_json::from_str("\"\"").unwrap();
        assert_eq!(none, ProvisioningState::None);
    }

    #[test]
    fn test_error_type_serde() {
        let json = serde_json::to_string(&ErrorType::RegistrationError).unwrap();
        assert_eq!(json, "\"registration error\"");
    }

    #[test]
    fn test_credentials_version_matches() {
        let recorded = CredentialsVersion::new("bmc-secret", "1234");
        assert!(recorded.matches(&CredentialsVersion::new("bmc-secret", "1234")));
        assert!(!recorded.matches(&CredentialsVersion::new("bmc-secret", "5678")));
        assert!(!recorded.matches(&CredentialsVersion::new("other", "1234")));
        // An empty fingerprint never matches anything, including itself
        let empty = CredentialsVersion::default();
        assert!(!empty.matches(&CredentialsVersion::default()));
    }

    #[test]
    fn test_operation_metric_duration() {
        let mut metric = OperationMetric::default();
        assert!(metric.duration_seconds().is_none());
        let start = Utc::now();
        metric.start = Some(start);
        assert!(metric.duration_seconds().is_none());
        metric.end = Some(start + chrono::Duration::milliseconds(1500));
        assert_eq!(metric.duration_seconds(), Some(1.5));
    }

    fn bare_host() -> MetalHost {
        MetalHost::new("host-0", serde_json::from_str("{}").unwrap())
    }

    #[test]
    fn test_has_bmc_details() {
        let mut host = bare_host();
        assert!(!host.has_bmc_details());
        host.spec.bmc = Some(BmcDetails {
            address: "ipmi://10.0.0.8:623".into(),
            credentials_name: "host-0-bmc".into(),
        });
        assert!(host.has_bmc_details());
        host.spec.bmc = Some(BmcDetails {
            address: String::new(),
            credentials_name: "host-0-bmc".into(),
        });
        assert!(!host.has_bmc_details());
    }

    #[test]
    fn test_boot_mode_defaults_to_uefi() {
        let mut host = bare_host();
        assert_eq!(host.boot_mode(), BootMode::Uefi);
        host.spec.boot_mode = Some(BootMode::Legacy);
        assert_eq!(host.boot_mode(), BootMode::Legacy);
    }

    #[test]
    fn test_set_and_clear_error() {
        let mut host = bare_host();
        host.set_error(ErrorType::InspectionError, "inspection timed out");
        assert!(host.has_error());
        assert_eq!(host.operational_status(), OperationalStatus::Error);
        host.clear_error();
        assert!(!host.has_error());
        assert_eq!(host.operational_status(), OperationalStatus::Ok);
        assert!(host.status_mut().error_message.is_empty());
    }

    #[test]
    fn test_operation_metric_for_state_mapping() {
        let mut host = bare_host();
        for state in [
            ProvisioningState::Registering,
            ProvisioningState::Inspecting,
            ProvisioningState::Provisioning,
            ProvisioningState::Deprovisioning,
        ] {
            assert!(host.operation_metric_for_state(state).is_some());
        }
        for state in [
            ProvisioningState::None,
            ProvisioningState::Ready,
            ProvisioningState::Provisioned,
            ProvisioningState::Deleting,
        ] {
            assert!(host.operation_metric_for_state(state).is_none());
        }
    }

    #[test]
    fn test_needs_inspection() {
        let mut host = bare_host();
        assert!(host.needs_inspection());
        host.status_mut().hardware = Some(HardwareDetails::default());
        assert!(!host.needs_inspection());
        host.status_mut().hardware = None;
        host.spec.externally_provisioned = true;
        assert!(!host.needs_inspection());
    }
}
