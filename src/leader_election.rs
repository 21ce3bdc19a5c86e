//! Lease-based leader election for HA operator deployments.
//!
//! With multiple operator replicas running, only the Lease holder drives
//! reconciliation; the others block in [`LeaderElector::acquire`] until the
//! holder's lease expires or is released. One leader at a time matters
//! here: two replicas reconciling the same MetalHost would race each other
//! on the provisioner backend.

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

const LEASE_NAME: &str = "hostforge-operator-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Detects the namespace for leader election.
///
/// Priority: explicit argument → service account file → `"default"`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

/// How a claim attempt relates to the existing Lease
enum Claim {
    /// We hold the lease; refresh the renew time
    Renewal,
    /// The previous holder's lease expired; take over
    Takeover,
}

/// Lease-based leader election on a `coordination.k8s.io/v1` Lease object.
///
/// Conflicting writes are resolved by the API server's optimistic
/// concurrency (`resourceVersion`); a 409 on replace means another replica
/// won the race.
pub struct LeaderElector {
    lease_api: Api<Lease>,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str) -> Self {
        let lease_api = Api::<Lease>::namespaced(client, namespace);
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("operator-{:08x}", rand::random::<u32>()));
        info!(identity = %identity, namespace = %namespace, "Initialized leader elector");
        Self { lease_api, identity }
    }

    /// Blocks until the lease is successfully acquired.
    pub async fn acquire(&self) -> anyhow::Result<()> {
        info!(identity = %self.identity, "Waiting to acquire leader lease '{LEASE_NAME}'");
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leader lease");
                    return Ok(());
                }
                Ok(false) => {
                    debug!("Lease held by another instance, retrying in {RETRY_INTERVAL:?}");
                }
                Err(e) => {
                    warn!("Lease acquisition error: {e}, retrying in {RETRY_INTERVAL:?}");
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Renews the lease. Returns `Ok(true)` if still leader, `Ok(false)` if lost.
    pub async fn renew(&self) -> anyhow::Result<bool> {
        let lease = self.lease_api.get(LEASE_NAME).await?;
        if !self.holds(&lease) {
            return Ok(false);
        }
        self.write_claim(&lease, Claim::Renewal).await
    }

    /// Releases the lease by clearing the holder identity, letting a
    /// standby replica take over without waiting for expiry.
    pub async fn release(&self) {
        info!(identity = %self.identity, "Releasing leader lease");
        let lease = match self.lease_api.get(LEASE_NAME).await {
            Ok(l) => l,
            Err(e) => {
                warn!("Failed to read lease for release: {e}");
                return;
            }
        };
        if !self.holds(&lease) {
            debug!("Lease not held by us, skipping release");
            return;
        }

        let mut updated = lease.clone();
        if let Some(ref mut spec) = updated.spec {
            spec.holder_identity = None;
        }
        match self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => info!("Released leader lease"),
            Err(e) => warn!("Failed to release leader lease: {e}"),
        }
    }

    /// Returns the recommended interval between lease renewals.
    pub fn renew_interval(&self) -> Duration {
        RENEW_INTERVAL
    }

    fn holds(&self, lease: &Lease) -> bool {
        lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref())
            == Some(self.identity.as_str())
    }

    async fn try_acquire(&self) -> anyhow::Result<bool> {
        match self.lease_api.get(LEASE_NAME).await {
            Ok(existing) => {
                if self.holds(&existing) {
                    self.write_claim(&existing, Claim::Renewal).await
                } else if is_expired(existing.spec.as_ref()) {
                    self.write_claim(&existing, Claim::Takeover).await
                } else {
                    Ok(false)
                }
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => self.create_lease().await,
            Err(e) => Err(e.into()),
        }
    }

    async fn create_lease(&self) -> anyhow::Result<bool> {
        let now = MicroTime(Utc::now());
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(0),
                preferred_holder: None,
                strategy: None,
            }),
        };
        match self
            .lease_api
            .create(&PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_claim(&self, existing: &Lease, claim: Claim) -> anyhow::Result<bool> {
        let now = MicroTime(Utc::now());
        let prev = existing.spec.as_ref();
        let transitions = prev.and_then(|s| s.lease_transitions).unwrap_or(0);

        let mut updated = existing.clone();
        updated.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            acquire_time: match claim {
                Claim::Takeover => Some(now.clone()),
                Claim::Renewal => prev.and_then(|s| s.acquire_time.clone()),
            },
            renew_time: Some(now),
            lease_transitions: Some(match claim {
                Claim::Takeover => transitions + 1,
                Claim::Renewal => transitions,
            }),
            preferred_holder: None,
            strategy: None,
        });

        match self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!("Lease conflict, another replica won the write");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn is_expired(spec: Option<&LeaseSpec>) -> bool {
    let duration_secs = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(LEASE_DURATION_SECS) as i64;

    match spec.and_then(|s| s.renew_time.as_ref()) {
        Some(MicroTime(t)) => Utc::now().signed_duration_since(*t).num_seconds() > duration_secs,
        None => true,
    }
}
