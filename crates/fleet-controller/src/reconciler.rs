// The core control loop. One pass: refresh drift against GitHub and the
// provider, expire boot timeouts, compute shortfall/surplus against the
// configured floor plus webhook demand, then drive create and cleanup work
// across a bounded worker pool. Passes are serialized; only the trigger
// channel and the timer feed them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use fleet_common::backoff::retry;
use fleet_common::error::{FleetError, FleetResult};
use fleet_common::generate_runner_name;
use fleet_common::settings::ScalingSettings;
use fleet_github::{GitHubRunner, GitHubRunnerApi, RunnerStatus};
use fleet_provider::{ComputeProvider, ServerSummary};
use futures::{stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::JitBroker;
use crate::demand::DemandTracker;
use crate::store::{RunnerRecord, RunnerState, RunnerStore};

/// Serialized reconciliation loop over the runner fleet.
pub struct Reconciler {
    store: Arc<RunnerStore>,
    github: Arc<dyn GitHubRunnerApi>,
    provider: Arc<dyn ComputeProvider>,
    broker: JitBroker,
    demand: Arc<DemandTracker>,
    scaling: ScalingSettings,
    cancel: CancellationToken,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<RunnerStore>,
        github: Arc<dyn GitHubRunnerApi>,
        provider: Arc<dyn ComputeProvider>,
        broker: JitBroker,
        demand: Arc<DemandTracker>,
        scaling: ScalingSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            github,
            provider,
            broker,
            demand,
            scaling,
            cancel,
        }
    }

    /// Run until cancelled. A pass fires on every poll tick and whenever
    /// the ingestor signals; signals arriving mid-pass coalesce into at
    /// most one follow-up pass.
    pub async fn run(self, mut trigger_rx: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.scaling.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("reconciler stopping");
                    break;
                }
                _ = ticker.tick() => {}
                Some(()) = trigger_rx.recv() => {
                    tracing::debug!("webhook-triggered pass");
                }
            }

            if let Err(err) = self.pass().await {
                tracing::error!(error = %err, "reconciliation pass failed");
            }
        }
    }

    /// One reconciliation pass. Individual record failures are absorbed
    /// into that record's state machine; this only errors on conditions
    /// that made the whole pass meaningless.
    pub async fn pass(&self) -> anyhow::Result<()> {
        self.refresh_drift().await;
        self.expire_boot_timeouts();

        let snapshot = self.store.snapshot();
        let ready_count = snapshot
            .iter()
            .filter(|r| r.state == RunnerState::Idle)
            .count() as u32;
        let in_flight_count = snapshot
            .iter()
            .filter(|r| r.state.is_in_flight())
            .count() as u32;
        let pending = self.demand.pending();

        let shortfall =
            (self.scaling.min_ready + pending).saturating_sub(ready_count + in_flight_count);

        tracing::debug!(
            ready_count,
            in_flight_count,
            pending,
            shortfall,
            min_ready = self.scaling.min_ready,
            "computed scaling delta"
        );

        self.provision_requested(shortfall).await;

        if pending == 0 {
            let surplus = ready_count.saturating_sub(self.scaling.min_ready);
            if surplus > 0 {
                self.scale_down(surplus);
            }
        }

        self.drive_cleanup().await;
        self.store.purge_terminated(self.scaling.audit_retention());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Drift reconciliation
    // -----------------------------------------------------------------------

    /// Cross-reference both external systems against the store. Either
    /// listing failing skips that side's drift work for this pass; the
    /// loop itself carries on.
    async fn refresh_drift(&self) {
        let (servers, runners) = tokio::join!(
            retry(
                "list_servers",
                self.scaling.max_attempts,
                self.cancel.clone(),
                || self.provider.list_servers()
            ),
            retry(
                "list_runners",
                self.scaling.max_attempts,
                self.cancel.clone(),
                || self.github.list_runners()
            ),
        );

        // Provider side first so an interrupted create is adopted before
        // the GitHub side advances the same record further.
        match servers {
            Ok(servers) => self.sync_provider(&servers).await,
            Err(err) => {
                tracing::warn!(error = %err, "server listing failed; skipping provider drift")
            }
        }

        match runners {
            Ok(runners) => self.sync_github(&runners).await,
            Err(err) => {
                tracing::warn!(error = %err, "runner listing failed; skipping github drift")
            }
        }
    }

    async fn sync_provider(&self, servers: &[ServerSummary]) {
        let records = self.store.snapshot();
        let by_name: HashMap<&str, &RunnerRecord> =
            records.iter().map(|r| (r.id.as_str(), r)).collect();

        // Adopt instances whose create response we never saw. The record
        // id was persisted before the call, so the instance name leads
        // straight back to its record.
        for server in servers {
            if let Some(record) = by_name.get(server.name.as_str()) {
                if record.state == RunnerState::Requested {
                    tracing::info!(
                        record = %record.id,
                        instance_id = %server.id,
                        "adopting instance from interrupted create"
                    );
                    if let Err(err) = self
                        .store
                        .set_provider_instance(&record.id, &server.id)
                        .and_then(|_| {
                            self.store
                                .transition(&record.id, RunnerState::Provisioning)
                                .map(|_| ())
                        })
                    {
                        tracing::error!(record = %record.id, error = %err, "adoption failed");
                    }
                }
            }
        }

        // Orphan instances: fleet-named VMs with no record. Leave young
        // ones alone; their record may appear in a racing create.
        let cutoff = Utc::now() - self.scaling.drift_grace();
        let orphans: Vec<ServerSummary> = servers
            .iter()
            .filter(|s| !by_name.contains_key(s.name.as_str()))
            .filter(|s| s.created_at.map_or(true, |t| t < cutoff))
            .cloned()
            .collect();

        stream::iter(orphans)
            .map(|server| async move { self.delete_orphan_server(&server).await })
            .buffer_unordered(self.scaling.worker_pool)
            .collect::<Vec<()>>()
            .await;

        // A live record whose backing instance vanished cannot recover.
        let listed: HashSet<&str> = servers.iter().map(|s| s.id.as_str()).collect();
        for record in &records {
            let gone = matches!(
                record.state,
                RunnerState::Provisioning
                    | RunnerState::Registered
                    | RunnerState::Idle
                    | RunnerState::Busy
            ) && record
                .provider_instance_id
                .as_deref()
                .is_some_and(|id| !listed.contains(id))
                && Utc::now() - record.last_transition_at > self.scaling.drift_grace();

            if gone {
                tracing::warn!(record = %record.id, "backing instance vanished; marking failed");
                if let Err(err) = self.store.transition(&record.id, RunnerState::Failed) {
                    tracing::error!(record = %record.id, error = %err, "transition failed");
                }
            }
        }
    }

    async fn delete_orphan_server(&self, server: &ServerSummary) {
        tracing::warn!(
            instance_id = %server.id,
            name = %server.name,
            "deleting orphan instance with no record"
        );
        if let Err(err) = self.provider.delete_server(&server.id).await {
            tracing::warn!(instance_id = %server.id, error = %err, "orphan delete failed");
        }
    }

    async fn sync_github(&self, runners: &[GitHubRunner]) {
        let records = self.store.snapshot();
        let record_names: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let by_name: HashMap<&str, &GitHubRunner> =
            runners.iter().map(|r| (r.name.as_str(), r)).collect();

        for record in &records {
            match by_name.get(record.id.as_str()) {
                Some(runner) => self.sync_runner_status(record, runner),
                None => {
                    // Registered capacity that GitHub no longer reports is
                    // lost once the grace period passes.
                    if record.state.expects_github_registration()
                        && Utc::now() - record.last_transition_at > self.scaling.drift_grace()
                    {
                        tracing::warn!(
                            record = %record.id,
                            "runner disappeared from GitHub; marking failed"
                        );
                        if let Err(err) = self.store.transition(&record.id, RunnerState::Failed) {
                            tracing::error!(record = %record.id, error = %err, "transition failed");
                        }
                    }
                }
            }
        }

        // Registrations with no record belong to nobody: deregister.
        let orphans: Vec<GitHubRunner> = runners
            .iter()
            .filter(|r| !record_names.contains(r.name.as_str()))
            .cloned()
            .collect();

        stream::iter(orphans)
            .map(|runner| async move { self.remove_orphan_runner(&runner).await })
            .buffer_unordered(self.scaling.worker_pool)
            .collect::<Vec<()>>()
            .await;
    }

    async fn remove_orphan_runner(&self, runner: &GitHubRunner) {
        tracing::warn!(
            github_runner_id = runner.id,
            name = %runner.name,
            "removing orphan runner registration"
        );
        if let Err(err) = self.github.remove_runner(runner.id).await {
            tracing::warn!(github_runner_id = runner.id, error = %err, "orphan removal failed");
        }
    }

    /// Advance a record from GitHub's view of its runner. Cleanup-owned
    /// states are not touched here.
    fn sync_runner_status(&self, record: &RunnerRecord, runner: &GitHubRunner) {
        if !matches!(
            record.state,
            RunnerState::Provisioning
                | RunnerState::Registered
                | RunnerState::Idle
                | RunnerState::Busy
        ) {
            return;
        }

        if record.github_runner_id.is_none() {
            if let Err(err) = self.store.set_github_runner(&record.id, runner.id) {
                tracing::error!(record = %record.id, error = %err, "failed to attach runner id");
            }
        }

        let target = if runner.busy {
            RunnerState::Busy
        } else if runner.status == RunnerStatus::Online {
            RunnerState::Idle
        } else {
            RunnerState::Registered
        };

        if record.state == target {
            return;
        }

        // A runner can register and grab a job between two passes; step
        // through Registered so every recorded transition is a legal edge.
        let path: Vec<RunnerState> =
            if record.state == RunnerState::Provisioning && target == RunnerState::Busy {
                vec![RunnerState::Registered, RunnerState::Busy]
            } else if record.state.can_transition(target) {
                vec![target]
            } else {
                // e.g. Idle -> Registered when a runner flaps offline:
                // not a forward edge. The absence rule handles real loss.
                return;
            };

        let was_in_flight = record.state.is_in_flight();
        for step in path {
            if let Err(err) = self.store.transition(&record.id, step) {
                tracing::error!(record = %record.id, error = %err, "status sync failed");
                return;
            }
        }

        if was_in_flight && matches!(target, RunnerState::Idle | RunnerState::Busy) {
            // This runner just became usable capacity; one unit of webhook
            // demand is now matched.
            self.demand.satisfy_one();
        }
    }

    // -----------------------------------------------------------------------
    // Timeouts
    // -----------------------------------------------------------------------

    /// A record that has not registered within the boot timeout will not;
    /// force it onto the cleanup path.
    fn expire_boot_timeouts(&self) {
        let timeout = self.scaling.boot_timeout();
        let now = Utc::now();

        for record in self.store.snapshot() {
            let expired = matches!(
                record.state,
                RunnerState::Requested | RunnerState::Provisioning
            ) && now - record.last_transition_at > timeout;

            if expired {
                tracing::warn!(
                    record = %record.id,
                    state = %record.state,
                    "boot timeout elapsed without registration; marking failed"
                );
                if let Err(err) = self.store.transition(&record.id, RunnerState::Failed) {
                    tracing::error!(record = %record.id, error = %err, "transition failed");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Scale up
    // -----------------------------------------------------------------------

    /// Create `new_count` fresh `Requested` records, then drive every
    /// `Requested` record (new and carried-over) through the broker.
    async fn provision_requested(&self, new_count: u32) {
        let mut ids: Vec<String> = self
            .store
            .snapshot()
            .into_iter()
            .filter(|r| r.state == RunnerState::Requested)
            .map(|r| r.id)
            .collect();

        for _ in 0..new_count {
            let name = generate_runner_name();
            match self.store.create_requested(&name) {
                Ok(_) => ids.push(name),
                Err(err) => {
                    // Name collision; skip this slot, the next pass fills it.
                    tracing::error!(error = %err, "failed to create runner record");
                }
            }
        }

        if ids.is_empty() {
            return;
        }

        tracing::info!(count = ids.len(), "provisioning requested runners");

        stream::iter(ids)
            .map(|id| self.provision_one(id))
            .buffer_unordered(self.scaling.worker_pool)
            .collect::<Vec<()>>()
            .await;
    }

    async fn provision_one(&self, id: String) {
        match self.broker.provision(&id).await {
            Ok(()) => {}
            Err(err) => self.note_record_failure(&id, RunnerState::Requested, err),
        }
    }

    /// Shared failure bookkeeping: count the attempt and decide whether the
    /// record's retry budget is spent. Timeouts stay retryable because the
    /// next drift pass may adopt whatever the lost call created.
    fn note_record_failure(&self, id: &str, current: RunnerState, err: FleetError) {
        let attempts = match self.store.record_attempt(id) {
            Ok(n) => n,
            Err(store_err) => {
                tracing::error!(record = id, error = %store_err, "attempt bookkeeping failed");
                return;
            }
        };

        let give_up = !err.is_retryable() || attempts >= self.scaling.max_attempts;
        if give_up && current != RunnerState::Failed {
            tracing::error!(
                record = id,
                attempts,
                error = %err,
                "retry budget exhausted; marking record failed"
            );
            if let Err(terr) = self.store.transition(id, RunnerState::Failed) {
                tracing::error!(record = id, error = %terr, "transition failed");
            }
        } else {
            tracing::warn!(
                record = id,
                attempts,
                error = %err,
                "operation failed; retrying next pass"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Scale down
    // -----------------------------------------------------------------------

    /// Voluntary scale-down: only `Idle` runners, longest-idle first, so
    /// cost is bounded without starving freshly provisioned capacity.
    fn scale_down(&self, surplus: u32) {
        let mut idle: Vec<RunnerRecord> = self
            .store
            .snapshot()
            .into_iter()
            .filter(|r| r.state == RunnerState::Idle)
            .collect();
        idle.sort_by_key(|r| r.last_transition_at);

        for record in idle.into_iter().take(surplus as usize) {
            tracing::info!(
                record = %record.id,
                idle_since = %record.last_transition_at,
                "scaling down longest-idle runner"
            );
            if let Err(err) = self.store.transition(&record.id, RunnerState::Deregistering) {
                tracing::error!(record = %record.id, error = %err, "transition failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    /// Drive every record on the teardown path one step forward.
    async fn drive_cleanup(&self) {
        let work: Vec<RunnerRecord> = self
            .store
            .snapshot()
            .into_iter()
            .filter(|r| {
                matches!(
                    r.state,
                    RunnerState::Deregistering | RunnerState::Terminating | RunnerState::Failed
                )
            })
            .collect();

        if work.is_empty() {
            return;
        }

        stream::iter(work)
            .map(|record| self.cleanup_record(record))
            .buffer_unordered(self.scaling.worker_pool)
            .collect::<Vec<()>>()
            .await;
    }

    async fn cleanup_record(&self, record: RunnerRecord) {
        let state = record.state;
        let outcome = match state {
            RunnerState::Deregistering => self.finish_deregister(&record).await,
            RunnerState::Terminating => self.finish_terminate(&record).await,
            RunnerState::Failed => self.cleanup_failed(&record).await,
            _ => Ok(()),
        };

        if let Err(err) = outcome {
            self.note_record_failure(&record.id, state, err);
        }
    }

    async fn finish_deregister(&self, record: &RunnerRecord) -> FleetResult<()> {
        if let Some(github_runner_id) = record.github_runner_id {
            retry(
                "remove_runner",
                self.scaling.max_attempts,
                self.cancel.clone(),
                || self.github.remove_runner(github_runner_id),
            )
            .await?;
        }
        self.store.transition(&record.id, RunnerState::Terminating)?;
        Ok(())
    }

    async fn finish_terminate(&self, record: &RunnerRecord) -> FleetResult<()> {
        if let Some(ref instance_id) = record.provider_instance_id {
            retry(
                "delete_server",
                self.scaling.max_attempts,
                self.cancel.clone(),
                || self.provider.delete_server(instance_id),
            )
            .await?;
        }
        self.store.transition(&record.id, RunnerState::Terminated)?;
        Ok(())
    }

    /// Best-effort teardown of a failed record: deregister, delete,
    /// retire. Each call is single-shot here; the record stays `Failed`
    /// and is re-driven next pass if anything errors.
    async fn cleanup_failed(&self, record: &RunnerRecord) -> FleetResult<()> {
        if let Some(github_runner_id) = record.github_runner_id {
            self.github.remove_runner(github_runner_id).await?;
        }
        if let Some(ref instance_id) = record.provider_instance_id {
            self.provider.delete_server(instance_id).await?;
        }
        self.store.transition(&record.id, RunnerState::Terminated)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use fleet_common::boot_script::BootScriptTemplate;
    use fleet_common::settings::{InstanceSettings, RunnerSettings};
    use fleet_common::SecretMasker;
    use fleet_github::JitConfig;
    use fleet_provider::ServerStatus;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    // -------------------------------------------------------------------
    // Mock externals
    // -------------------------------------------------------------------

    #[derive(Default)]
    struct MockGitHub {
        runners: Mutex<Vec<GitHubRunner>>,
        next_id: AtomicU64,
        removed: Mutex<Vec<u64>>,
        jit_error: Mutex<Option<fn() -> FleetError>>,
        jit_calls: AtomicU64,
    }

    impl MockGitHub {
        fn set_runner_online(&self, name: &str, busy: bool) {
            let mut runners = self.runners.lock();
            if let Some(runner) = runners.iter_mut().find(|r| r.name == name) {
                runner.status = RunnerStatus::Online;
                runner.busy = busy;
            }
        }

        fn add_runner(&self, id: u64, name: &str, status: RunnerStatus, busy: bool) {
            self.runners.lock().push(GitHubRunner {
                id,
                name: name.to_string(),
                busy,
                status,
                labels: Vec::new(),
            });
        }
    }

    #[async_trait]
    impl GitHubRunnerApi for MockGitHub {
        async fn list_runners(&self) -> FleetResult<Vec<GitHubRunner>> {
            Ok(self.runners.lock().clone())
        }

        async fn create_jit_config(&self, runner_name: &str) -> FleetResult<JitConfig> {
            self.jit_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(make_err) = *self.jit_error.lock() {
                return Err(make_err());
            }

            let id = 100 + self.next_id.fetch_add(1, Ordering::SeqCst);
            let runner = GitHubRunner {
                id,
                name: runner_name.to_string(),
                busy: false,
                status: RunnerStatus::Offline,
                labels: Vec::new(),
            };
            self.runners.lock().push(runner.clone());

            Ok(JitConfig {
                runner,
                encoded_jit_config: format!("jit-{runner_name}"),
            })
        }

        async fn remove_runner(&self, github_runner_id: u64) -> FleetResult<()> {
            // Idempotent: removing an absent runner succeeds.
            self.runners.lock().retain(|r| r.id != github_runner_id);
            self.removed.lock().push(github_runner_id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockCompute {
        servers: Mutex<Vec<ServerSummary>>,
        next_id: AtomicU64,
        create_calls: AtomicU64,
        deleted: Mutex<Vec<String>>,
        fail_create: AtomicBool,
    }

    impl MockCompute {
        fn add_server(&self, id: &str, name: &str, age: Duration) {
            self.servers.lock().push(ServerSummary {
                id: id.to_string(),
                name: name.to_string(),
                status: ServerStatus::Active,
                created_at: Some(Utc::now() - age),
            });
        }
    }

    #[async_trait]
    impl ComputeProvider for MockCompute {
        async fn create_server(
            &self,
            name: &str,
            _image: &str,
            _flavor: &str,
            _user_data: &str,
        ) -> FleetResult<String> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(FleetError::Transient("compute api down".into()));
            }

            let id = format!("vm-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.servers.lock().push(ServerSummary {
                id: id.clone(),
                name: name.to_string(),
                status: ServerStatus::Build,
                created_at: Some(Utc::now()),
            });
            Ok(id)
        }

        async fn delete_server(&self, instance_id: &str) -> FleetResult<()> {
            self.servers.lock().retain(|s| s.id != instance_id);
            self.deleted.lock().push(instance_id.to_string());
            Ok(())
        }

        async fn list_servers(&self) -> FleetResult<Vec<ServerSummary>> {
            Ok(self.servers.lock().clone())
        }
    }

    // -------------------------------------------------------------------
    // Harness
    // -------------------------------------------------------------------

    struct Harness {
        store: Arc<RunnerStore>,
        github: Arc<MockGitHub>,
        compute: Arc<MockCompute>,
        demand: Arc<DemandTracker>,
        reconciler: Reconciler,
    }

    fn harness(min_ready: u32) -> Harness {
        let store = Arc::new(RunnerStore::in_memory());
        let github = Arc::new(MockGitHub::default());
        let compute = Arc::new(MockCompute::default());
        let demand = Arc::new(DemandTracker::new());

        let scaling = ScalingSettings {
            min_ready,
            poll_interval_secs: 30,
            boot_timeout_secs: 300,
            drift_grace_secs: 300,
            audit_retention_secs: 3600,
            max_attempts: 2,
            worker_pool: 4,
        };

        let runner = RunnerSettings {
            checksum: "testsum".to_string(),
            ..RunnerSettings::default()
        };
        let instance = InstanceSettings {
            image: "ubuntu-22.04".to_string(),
            flavor: "m1.medium".to_string(),
            network: "net-1".to_string(),
            key_name: None,
        };

        let broker = JitBroker::new(
            Arc::clone(&github) as Arc<dyn GitHubRunnerApi>,
            Arc::clone(&compute) as Arc<dyn ComputeProvider>,
            Arc::clone(&store),
            BootScriptTemplate::builtin(),
            runner,
            instance.clone(),
            SecretMasker::new(),
        );

        let reconciler = Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&github) as Arc<dyn GitHubRunnerApi>,
            Arc::clone(&compute) as Arc<dyn ComputeProvider>,
            broker,
            Arc::clone(&demand),
            scaling,
            CancellationToken::new(),
        );

        Harness {
            store,
            github,
            compute,
            demand,
            reconciler,
        }
    }

    fn count_in(store: &RunnerStore, state: RunnerState) -> usize {
        store.snapshot().iter().filter(|r| r.state == state).count()
    }

    // -------------------------------------------------------------------
    // Scenarios
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_cold_start_fills_min_ready_floor() {
        let h = harness(2);

        h.reconciler.pass().await.unwrap();

        let snapshot = h.store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(count_in(&h.store, RunnerState::Provisioning), 2);
        assert_eq!(h.compute.servers.lock().len(), 2);

        // Floor liveness: ready + in-flight covers the floor.
        let in_flight = snapshot.iter().filter(|r| r.state.is_in_flight()).count();
        assert!(in_flight >= 2);

        // Every record carries its instance and registration ids.
        for record in &snapshot {
            assert!(record.provider_instance_id.is_some());
            assert!(record.github_runner_id.is_some());
            assert!(record.jit_token_issued_at.is_some());
        }

        // A second pass with nothing changed creates nothing new.
        h.reconciler.pass().await.unwrap();
        assert_eq!(h.store.snapshot().len(), 2);
        assert_eq!(h.compute.create_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_runners_progress_to_idle_then_webhook_adds_one() {
        let h = harness(2);

        // Pass 1: two VMs created, registrations offline.
        h.reconciler.pass().await.unwrap();
        // Pass 2: runners registered but offline -> Registered.
        h.reconciler.pass().await.unwrap();
        assert_eq!(count_in(&h.store, RunnerState::Registered), 2);

        // Runners come online; pass 3 makes them Idle.
        for record in h.store.snapshot() {
            h.github.set_runner_online(&record.id, false);
        }
        h.reconciler.pass().await.unwrap();
        assert_eq!(count_in(&h.store, RunnerState::Idle), 2);

        // A queued webhook event: shortfall = 2 + 1 - 2 - 0 = 1.
        h.demand.record_queued();
        h.reconciler.pass().await.unwrap();

        assert_eq!(h.store.snapshot().len(), 3);
        assert_eq!(count_in(&h.store, RunnerState::Provisioning), 1);
        assert_eq!(count_in(&h.store, RunnerState::Idle), 2);

        // The new runner coming online consumes the demand unit; with
        // demand satisfied, three idle against a floor of two is a surplus
        // of one, which the same pass scales back down.
        for record in h.store.snapshot() {
            h.github.set_runner_online(&record.id, false);
        }
        h.reconciler.pass().await.unwrap();
        assert_eq!(h.demand.pending(), 0);
        assert_eq!(count_in(&h.store, RunnerState::Idle), 2);
    }

    #[tokio::test]
    async fn test_busy_runner_counts_against_nothing_and_returns_to_idle() {
        let h = harness(1);

        h.reconciler.pass().await.unwrap();
        let id = h.store.snapshot()[0].id.clone();

        h.github.set_runner_online(&id, true);
        h.reconciler.pass().await.unwrap();
        assert_eq!(h.store.get(&id).unwrap().state, RunnerState::Busy);

        // Busy runner is not ready: the floor provisions a second one.
        assert_eq!(h.store.snapshot().len(), 2);

        // Job finishes; Busy -> Idle.
        h.github.set_runner_online(&id, false);
        h.reconciler.pass().await.unwrap();
        assert_eq!(h.store.get(&id).unwrap().state, RunnerState::Idle);
    }

    #[tokio::test]
    async fn test_scale_down_picks_longest_idle() {
        let h = harness(2);

        // Three idle runners with distinct idle-since timestamps.
        let base = Utc::now();
        for (i, (id, age_mins)) in [("gha-old01", 30), ("gha-mid02", 20), ("gha-new03", 10)]
            .iter()
            .enumerate()
        {
            h.store.create_requested(id).unwrap();
            h.store
                .set_provider_instance(id, &format!("vm-s{i}"))
                .unwrap();
            h.store.set_github_runner(id, 500 + i as u64).unwrap();
            h.store.transition(id, RunnerState::Provisioning).unwrap();
            h.store.transition(id, RunnerState::Idle).unwrap();
            h.store
                .set_last_transition_at(id, base - Duration::minutes(*age_mins));
            h.compute.add_server(&format!("vm-s{i}"), id, Duration::minutes(*age_mins));
            h.github
                .add_runner(500 + i as u64, id, RunnerStatus::Online, false);
        }

        // surplus = 3 - 2 = 1; the longest-idle runner goes first.
        h.reconciler.pass().await.unwrap();

        let old = h.store.get("gha-old01").unwrap();
        assert!(
            matches!(old.state, RunnerState::Terminating | RunnerState::Terminated),
            "longest-idle runner should be torn down, got {}",
            old.state
        );
        assert_eq!(h.store.get("gha-mid02").unwrap().state, RunnerState::Idle);
        assert_eq!(h.store.get("gha-new03").unwrap().state, RunnerState::Idle);
        assert!(h.github.removed.lock().contains(&500));
    }

    #[tokio::test]
    async fn test_no_scale_down_while_demand_pending() {
        let h = harness(1);

        for i in 0..2 {
            let id = format!("gha-idl0{i}");
            h.store.create_requested(&id).unwrap();
            h.store.transition(&id, RunnerState::Provisioning).unwrap();
            h.store.transition(&id, RunnerState::Idle).unwrap();
        }

        // Surplus exists (2 idle, floor 1) but demand is pending.
        h.demand.record_queued();
        h.demand.record_queued();
        h.demand.record_queued();
        h.reconciler.pass().await.unwrap();

        assert_eq!(count_in(&h.store, RunnerState::Deregistering), 0);
    }

    #[tokio::test]
    async fn test_boot_timeout_fails_then_terminates_and_is_replaced() {
        let h = harness(1);

        // Pass 1 creates the runner; it never registers.
        h.reconciler.pass().await.unwrap();
        let id = h.store.snapshot()[0].id.clone();
        assert_eq!(h.store.get(&id).unwrap().state, RunnerState::Provisioning);

        // Age the record past the boot timeout (and keep GitHub silent by
        // dropping the offline registration the JIT call created).
        h.store
            .set_last_transition_at(&id, Utc::now() - Duration::seconds(301));
        h.github.runners.lock().clear();

        h.reconciler.pass().await.unwrap();

        // Failed -> cleanup ran in the same pass -> Terminated; the VM is
        // gone, and a replacement record covers the floor.
        let old = h.store.get(&id).unwrap();
        assert_eq!(old.state, RunnerState::Terminated);
        assert!(h
            .compute
            .deleted
            .lock()
            .contains(old.provider_instance_id.as_ref().unwrap()));

        let snapshot = h.store.snapshot();
        let in_flight = snapshot.iter().filter(|r| r.state.is_in_flight()).count();
        assert_eq!(in_flight, 1, "terminated record must not count as in-flight");
    }

    #[tokio::test]
    async fn test_orphan_runner_registration_is_removed() {
        let h = harness(0);
        h.github
            .add_runner(999, "gha-ghost", RunnerStatus::Online, false);

        h.reconciler.pass().await.unwrap();

        assert!(h.github.removed.lock().contains(&999));
        assert!(h.github.runners.lock().is_empty());
        // No record was ever created for it.
        assert!(h.store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_instance_deleted_only_after_grace() {
        let h = harness(0);
        h.compute.add_server("vm-old", "gha-stale", Duration::minutes(30));
        h.compute.add_server("vm-new", "gha-young", Duration::seconds(10));

        h.reconciler.pass().await.unwrap();

        let deleted = h.compute.deleted.lock().clone();
        assert!(deleted.contains(&"vm-old".to_string()));
        assert!(!deleted.contains(&"vm-new".to_string()));
    }

    #[tokio::test]
    async fn test_interrupted_create_is_adopted_not_reissued() {
        let h = harness(1);

        // A crash left a Requested record whose instance actually exists.
        h.store.create_requested("gha-crash").unwrap();
        h.store.set_github_runner("gha-crash", 700).unwrap();
        h.compute.add_server("vm-lost", "gha-crash", Duration::seconds(30));
        h.github
            .add_runner(700, "gha-crash", RunnerStatus::Offline, false);

        h.reconciler.pass().await.unwrap();

        let record = h.store.get("gha-crash").unwrap();
        assert!(matches!(
            record.state,
            RunnerState::Provisioning | RunnerState::Registered
        ));
        assert_eq!(record.provider_instance_id.as_deref(), Some("vm-lost"));
        // Adoption, not re-creation: no create call went out.
        assert_eq!(h.compute.create_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.github.jit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_nonretryable_provision_failure_fails_record_immediately() {
        let h = harness(1);
        *h.github.jit_error.lock() = Some(|| FleetError::Auth("bad credentials".into()));

        h.reconciler.pass().await.unwrap();

        // The record failed and its cleanup already retired it.
        assert_eq!(count_in(&h.store, RunnerState::Terminated), 1);
        assert_eq!(h.compute.create_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_create_failure_retries_across_passes() {
        let h = harness(1);
        h.compute.fail_create.store(true, Ordering::SeqCst);

        // Pass 1: attempt 1 fails, record stays Requested.
        h.reconciler.pass().await.unwrap();
        let id = h.store.snapshot()[0].id.clone();
        assert_eq!(h.store.get(&id).unwrap().state, RunnerState::Requested);
        assert_eq!(h.store.get(&id).unwrap().attempts, 1);

        // Pass 2: attempt 2 exhausts the budget (max_attempts = 2), the
        // record fails and cleanup retires it in the same pass.
        h.reconciler.pass().await.unwrap();
        assert_eq!(h.store.get(&id).unwrap().state, RunnerState::Terminated);

        // Recovery: the compute API is healthy again and the next pass
        // provisions a fresh replacement.
        h.compute.fail_create.store(false, Ordering::SeqCst);
        h.reconciler.pass().await.unwrap();
        assert_eq!(count_in(&h.store, RunnerState::Provisioning), 1);
    }

    #[tokio::test]
    async fn test_cleanup_of_already_absent_resources_is_idempotent() {
        let h = harness(0);

        // Deregistering record whose registration and VM are both long
        // gone: every cleanup step still succeeds.
        h.store.create_requested("gha-gone1").unwrap();
        h.store.set_provider_instance("gha-gone1", "vm-gone").unwrap();
        h.store.set_github_runner("gha-gone1", 800).unwrap();
        h.store.transition("gha-gone1", RunnerState::Provisioning).unwrap();
        h.store.transition("gha-gone1", RunnerState::Idle).unwrap();
        h.store.transition("gha-gone1", RunnerState::Deregistering).unwrap();

        h.reconciler.pass().await.unwrap();
        h.reconciler.pass().await.unwrap();

        assert_eq!(h.store.get("gha-gone1").unwrap().state, RunnerState::Terminated);
    }

    #[tokio::test]
    async fn test_vanished_instance_marks_record_failed() {
        let h = harness(0);

        h.store.create_requested("gha-van01").unwrap();
        h.store.set_provider_instance("gha-van01", "vm-poof").unwrap();
        h.store.set_github_runner("gha-van01", 801).unwrap();
        h.store.transition("gha-van01", RunnerState::Provisioning).unwrap();
        h.store.transition("gha-van01", RunnerState::Idle).unwrap();
        // Old enough that the grace period has passed; GitHub still lists
        // the runner but the VM is not in the provider listing.
        h.store
            .set_last_transition_at("gha-van01", Utc::now() - Duration::minutes(10));
        h.github
            .add_runner(801, "gha-van01", RunnerStatus::Online, false);

        h.reconciler.pass().await.unwrap();

        let record = h.store.get("gha-van01").unwrap();
        assert!(
            matches!(record.state, RunnerState::Failed | RunnerState::Terminated),
            "record backed by a vanished VM must leave the active set, got {}",
            record.state
        );
    }
}
