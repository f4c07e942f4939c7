// Controller configuration. Loaded once at startup from a JSON file, with
// environment overrides for the three secrets so they can stay out of the
// config file entirely.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable overriding `github.token`.
pub const ENV_GITHUB_TOKEN: &str = "GITHUB_TOKEN";

/// Environment variable overriding `webhook.secret`.
pub const ENV_WEBHOOK_SECRET: &str = "WEBHOOK_SECRET";

/// Environment variable overriding `compute.auth_token`.
pub const ENV_COMPUTE_AUTH_TOKEN: &str = "COMPUTE_AUTH_TOKEN";

/// Top-level configuration for the fleet controller process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSettings {
    pub github: GitHubSettings,

    #[serde(default)]
    pub runner: RunnerSettings,

    pub instance: InstanceSettings,

    pub compute: ComputeSettings,

    #[serde(default)]
    pub webhook: WebhookSettings,

    #[serde(default)]
    pub scaling: ScalingSettings,

    /// Where the runner state store file lives.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Optional operator-supplied boot script template; the built-in one
    /// is used when absent.
    #[serde(default)]
    pub boot_script_path: Option<PathBuf>,
}

/// GitHub organization, credential, and runner registration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSettings {
    /// Organization the runners register against.
    pub org: String,

    /// Personal access token or app installation token. Usually supplied
    /// via `GITHUB_TOKEN` rather than the config file.
    #[serde(default)]
    pub token: String,

    /// API base URL; override for GHES.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Runner group new registrations are placed in.
    #[serde(default = "default_runner_group_id")]
    pub runner_group_id: u64,

    /// Labels attached to every registration. The first label is also the
    /// filter applied to webhook events and runner listings.
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
}

impl GitHubSettings {
    /// The label that marks jobs and runners as belonging to this fleet.
    pub fn fleet_label(&self) -> &str {
        &self.labels[0]
    }
}

/// Substitutions for the boot-script template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Unix user the runner service runs as.
    #[serde(default = "default_runner_user")]
    pub user: String,

    /// Unix group the runner service runs as.
    #[serde(default = "default_runner_user")]
    pub group: String,

    /// Runner package version installed by the boot script.
    #[serde(default = "default_runner_version")]
    pub version: String,

    /// SHA-256 checksum of the runner package tarball.
    #[serde(default)]
    pub checksum: String,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            user: default_runner_user(),
            group: default_runner_user(),
            version: default_runner_version(),
            checksum: String::new(),
        }
    }
}

/// Per-instance VM parameters passed to the compute create call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSettings {
    /// Image reference (id or name, provider-dependent).
    pub image: String,

    /// Flavor reference.
    pub flavor: String,

    /// Network the instance attaches to.
    pub network: String,

    /// Optional SSH keypair name for operator debugging.
    #[serde(default)]
    pub key_name: Option<String>,
}

/// Compute API endpoint and credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeSettings {
    /// Base URL of the compute service (e.g. `https://nova.example.com/v2.1`).
    pub endpoint: String,

    /// Token sent as `X-Auth-Token`. Usually supplied via
    /// `COMPUTE_AUTH_TOKEN`.
    #[serde(default)]
    pub auth_token: String,

    /// Per-request timeout for compute calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ComputeSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Webhook listener parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    /// Address the webhook endpoint binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Shared secret for `X-Hub-Signature-256` verification. Usually
    /// supplied via `WEBHOOK_SECRET`.
    #[serde(default)]
    pub secret: String,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            secret: String::new(),
        }
    }
}

/// Reconciliation tuning. Every knob the control loop consults lives here
/// with a documented default rather than a hard-coded constant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingSettings {
    /// Floor of idle runners the reconciler maintains.
    #[serde(default = "default_min_ready")]
    pub min_ready: u32,

    /// Interval between timer-driven reconciliation passes.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// How long a Provisioning record may wait for its runner to appear in
    /// GitHub before it is declared Failed.
    #[serde(default = "default_boot_timeout_secs")]
    pub boot_timeout_secs: u64,

    /// Age below which an unmatched external resource is left alone during
    /// drift cleanup (it may simply not have registered yet).
    #[serde(default = "default_drift_grace_secs")]
    pub drift_grace_secs: u64,

    /// How long Terminated records are retained for audit before purge.
    #[serde(default = "default_audit_retention_secs")]
    pub audit_retention_secs: u64,

    /// Retry budget for a single external call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Width of the per-pass worker pool for create/delete/deregister
    /// dispatch.
    #[serde(default = "default_worker_pool")]
    pub worker_pool: usize,
}

impl Default for ScalingSettings {
    fn default() -> Self {
        Self {
            min_ready: default_min_ready(),
            poll_interval_secs: default_poll_interval_secs(),
            boot_timeout_secs: default_boot_timeout_secs(),
            drift_grace_secs: default_drift_grace_secs(),
            audit_retention_secs: default_audit_retention_secs(),
            max_attempts: default_max_attempts(),
            worker_pool: default_worker_pool(),
        }
    }
}

impl ScalingSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn boot_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.boot_timeout_secs as i64)
    }

    pub fn drift_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.drift_grace_secs as i64)
    }

    pub fn audit_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.audit_retention_secs as i64)
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_runner_group_id() -> u64 {
    1
}

fn default_labels() -> Vec<String> {
    vec!["self-hosted".to_string()]
}

fn default_runner_user() -> String {
    "runner".to_string()
}

fn default_runner_version() -> String {
    "2.319.1".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("fleet-state.json")
}

fn default_min_ready() -> u32 {
    1
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_boot_timeout_secs() -> u64 {
    300
}

fn default_drift_grace_secs() -> u64 {
    300
}

fn default_audit_retention_secs() -> u64 {
    3600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_worker_pool() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl FleetSettings {
    /// Load settings from a JSON file, apply environment overrides, and
    /// validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let mut settings: FleetSettings = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Pull secrets from the environment when present.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var(ENV_GITHUB_TOKEN) {
            if !token.is_empty() {
                self.github.token = token;
            }
        }
        if let Ok(secret) = std::env::var(ENV_WEBHOOK_SECRET) {
            if !secret.is_empty() {
                self.webhook.secret = secret;
            }
        }
        if let Ok(token) = std::env::var(ENV_COMPUTE_AUTH_TOKEN) {
            if !token.is_empty() {
                self.compute.auth_token = token;
            }
        }
    }

    /// Reject configurations the controller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.github.org.is_empty() {
            bail!("github.org must not be empty");
        }
        if self.github.token.is_empty() {
            bail!("github.token must be set (config file or GITHUB_TOKEN)");
        }
        if self.github.labels.is_empty() {
            bail!("github.labels must contain at least one label");
        }
        if self.webhook.secret.is_empty() {
            bail!("webhook.secret must be set (config file or WEBHOOK_SECRET)");
        }
        if self.compute.endpoint.is_empty() {
            bail!("compute.endpoint must not be empty");
        }
        if self.runner.checksum.is_empty() {
            bail!("runner.checksum must be set to the runner package SHA-256");
        }
        if self.scaling.worker_pool == 0 {
            bail!("scaling.worker_pool must be at least 1");
        }
        Ok(())
    }
}
