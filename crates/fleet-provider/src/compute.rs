// The compute seam: create/delete/list VM instances. Implementations wrap
// a real cloud API; tests substitute an in-memory fleet.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_common::error::FleetResult;

/// Instance lifecycle state as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Still being built by the provider.
    Build,
    /// Running.
    Active,
    /// Provider-side failure.
    Error,
    /// Anything else (shutoff, migrating, ...).
    Other,
}

impl ServerStatus {
    /// Parse the provider's status string; unknown values map to `Other`.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "BUILD" => ServerStatus::Build,
            "ACTIVE" => ServerStatus::Active,
            "ERROR" => ServerStatus::Error,
            _ => ServerStatus::Other,
        }
    }

    /// Whether the instance is alive (running or still coming up).
    pub fn is_alive(self) -> bool {
        matches!(self, ServerStatus::Build | ServerStatus::Active)
    }
}

/// One VM instance in a drift listing.
#[derive(Debug, Clone)]
pub struct ServerSummary {
    /// Provider-assigned instance id.
    pub id: String,
    /// Instance name; the controller names instances after their record id.
    pub name: String,
    pub status: ServerStatus,
    pub created_at: Option<DateTime<Utc>>,
}

/// VM create/delete/list against the cloud provider.
///
/// The boot script (inside `user_data`) is the only per-instance
/// customization point. Failure contract: implementations classify errors
/// into the shared taxonomy; delete of an already-absent instance is
/// success.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Create an instance and return its provider id.
    async fn create_server(
        &self,
        name: &str,
        image: &str,
        flavor: &str,
        user_data: &str,
    ) -> FleetResult<String>;

    /// Delete an instance. Idempotent.
    async fn delete_server(&self, instance_id: &str) -> FleetResult<()>;

    /// List fleet-owned instances (filtered to the controller's name
    /// prefix).
    async fn list_servers(&self) -> FleetResult<Vec<ServerSummary>>;
}
