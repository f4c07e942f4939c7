// JIT token broker: the bridge between the GitHub adapter and the compute
// adapter for a single `Requested` record. Ordering is the whole point —
// the token is time-bounded, so it is requested only when the create call
// is imminent, embedded into the boot script, and forgotten.

use std::sync::Arc;

use fleet_common::boot_script::{BootScriptParams, BootScriptTemplate, CloudConfig};
use fleet_common::error::{FleetError, FleetResult};
use fleet_common::settings::{InstanceSettings, RunnerSettings};
use fleet_common::SecretMasker;
use fleet_github::GitHubRunnerApi;
use fleet_provider::ComputeProvider;

use crate::store::{RunnerState, RunnerStore};

/// Drives one `Requested` record through JIT issuance and VM creation.
pub struct JitBroker {
    github: Arc<dyn GitHubRunnerApi>,
    provider: Arc<dyn ComputeProvider>,
    store: Arc<RunnerStore>,
    template: BootScriptTemplate,
    runner: RunnerSettings,
    instance: InstanceSettings,
    masker: SecretMasker,
}

impl JitBroker {
    pub fn new(
        github: Arc<dyn GitHubRunnerApi>,
        provider: Arc<dyn ComputeProvider>,
        store: Arc<RunnerStore>,
        template: BootScriptTemplate,
        runner: RunnerSettings,
        instance: InstanceSettings,
        masker: SecretMasker,
    ) -> Self {
        Self {
            github,
            provider,
            store,
            template,
            runner,
            instance,
            masker,
        }
    }

    /// Provision the VM for a `Requested` record: issue the JIT config,
    /// render it into the boot script, create the instance, and move the
    /// record to `Provisioning`.
    ///
    /// On a create timeout the record is left in `Requested` with its
    /// GitHub registration attached; the next drift pass either adopts the
    /// instance (create actually happened) or retries. On any other create
    /// failure the just-issued registration is removed best-effort, since
    /// the token is burned either way.
    pub async fn provision(&self, id: &str) -> FleetResult<()> {
        let jit = self.github.create_jit_config(id).await?;

        // The token value must never reach logs, even via debug output of
        // an error body.
        self.masker.add_value(&jit.encoded_jit_config);
        self.store.mark_jit_issued(id)?;
        self.store.set_github_runner(id, jit.runner.id)?;

        let script = self.template.render(&BootScriptParams {
            runner_user: &self.runner.user,
            runner_group: &self.runner.group,
            runner_version: &self.runner.version,
            runner_checksum: &self.runner.checksum,
            jit_config: &jit.encoded_jit_config,
        })?;

        let user_data = CloudConfig::for_boot_script(script)
            .to_user_data()
            .map_err(|e| FleetError::InvalidRequest(format!("cloud-config rendering: {e}")))?;

        match self
            .provider
            .create_server(id, &self.instance.image, &self.instance.flavor, &user_data)
            .await
        {
            Ok(instance_id) => {
                self.store.set_provider_instance(id, &instance_id)?;
                self.store.transition(id, RunnerState::Provisioning)?;
                Ok(())
            }
            Err(err @ FleetError::Timeout(_)) => {
                tracing::warn!(
                    record = id,
                    "create call timed out; outcome unknown, deferring to drift"
                );
                Err(err)
            }
            Err(err) => {
                // Provider errors can echo the request, user data included;
                // mask before the message reaches the log.
                tracing::error!(
                    record = id,
                    error = %self.masker.mask(&err.to_string()),
                    "instance creation failed"
                );
                if let Err(cleanup_err) = self.github.remove_runner(jit.runner.id).await {
                    tracing::warn!(
                        record = id,
                        error = %cleanup_err,
                        "failed to remove registration after create failure"
                    );
                }
                Err(err)
            }
        }
    }
}
