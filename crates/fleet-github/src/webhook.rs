// `workflow_job` webhook wire format and delivery authentication. The
// signature is verified over the raw body before any parsing happens; a
// mismatch means the payload is never even deserialized.

use fleet_common::error::{FleetError, FleetResult};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the HMAC-SHA-256 delivery signature.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Scheme prefix GitHub puts in front of the hex digest.
const SIGNATURE_PREFIX: &str = "sha256=";

/// Verify a webhook delivery signature against the shared secret.
///
/// The comparison is constant-time (`Mac::verify_slice`). Any malformed
/// header is treated the same as a wrong signature.
pub fn verify_signature(secret: &[u8], body: &[u8], signature_header: &str) -> FleetResult<()> {
    let hex_digest = signature_header
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or_else(|| FleetError::Auth("malformed webhook signature header".into()))?;

    let expected = hex::decode(hex_digest)
        .map_err(|_| FleetError::Auth("webhook signature is not valid hex".into()))?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC-SHA-256 accepts keys of any size");
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| FleetError::Auth("webhook signature mismatch".into()))
}

/// Compute the signature header value for a body. Test-side helper for
/// producing valid deliveries.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC-SHA-256 accepts keys of any size");
    mac.update(body);
    format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    )
}

/// Actions of a `workflow_job` event the controller reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowJobAction {
    Queued,
    InProgress,
    Completed,
    Waiting,
    #[serde(other)]
    Other,
}

/// A `workflow_job` event body, reduced to the fields the controller reads.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJobEvent {
    pub action: WorkflowJobAction,
    pub workflow_job: WorkflowJob,
    #[serde(default)]
    pub organization: Option<Organization>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJob {
    pub id: u64,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub runner_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Organization {
    pub login: String,
}

impl WorkflowJobEvent {
    /// Whether this event concerns the given org and fleet label. Events
    /// for other orgs or other runner pools are ignored.
    pub fn matches_fleet(&self, org: &str, fleet_label: &str) -> bool {
        let org_matches = self
            .organization
            .as_ref()
            .is_some_and(|o| o.login == org);
        org_matches && self.workflow_job.labels.iter().any(|l| l == fleet_label)
    }
}
