// fleet-common: Shared services and infrastructure for the runner fleet
// controller. Everything here is consumed by the adapter crates and the
// controller binary.

pub mod backoff;
pub mod boot_script;
pub mod error;
pub mod secret_masker;
pub mod settings;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use backoff::{retry, Backoff};
pub use boot_script::{BootScriptParams, BootScriptTemplate, CloudConfig};
pub use error::{FleetError, FleetResult};
pub use secret_masker::SecretMasker;
pub use settings::{
    ComputeSettings, FleetSettings, GitHubSettings, InstanceSettings, RunnerSettings,
    ScalingSettings, WebhookSettings,
};

/// Name prefix for every VM and runner registration the controller owns.
/// Drift listings are filtered to this prefix so the controller never
/// touches resources it did not create.
pub const RUNNER_NAME_PREFIX: &str = "gha-";

/// Generate a fresh runner name: the owned prefix plus a short random
/// lowercase suffix. The name doubles as the VM name and the GitHub runner
/// name, which is what lets drift listings be matched back to records.
pub fn generate_runner_name() -> String {
    use rand::Rng;

    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .map(char::from)
        .filter(|c| c.is_ascii_lowercase())
        .take(5)
        .collect();

    format!("{}{}", RUNNER_NAME_PREFIX, suffix)
}
