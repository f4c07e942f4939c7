// Durable record of every VM the controller has created. Single source of
// truth: GitHub and the provider are eventually-consistent mirrors that the
// reconciler cross-references against this store each pass.
//
// Write discipline: one mutex over the record map, every mutation persisted
// to disk before the call returns. A crash therefore leaves the store
// consistent with "at most the durably recorded operations happened".

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use fleet_common::error::{FleetError, FleetResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a runner VM, from request through termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerState {
    /// Record created; no external call made yet. The record id is the
    /// idempotency key for everything that follows.
    Requested,
    /// VM create call accepted; waiting for the runner to register.
    Provisioning,
    /// GitHub reports the runner, but it is not yet online and free.
    Registered,
    /// Registered, online, and eligible to accept a job.
    Idle,
    /// Executing a job.
    Busy,
    /// Scale-down chosen; waiting for GitHub to confirm removal.
    Deregistering,
    /// Waiting for the provider to confirm VM deletion.
    Terminating,
    /// Fully cleaned up. Retained for the audit window, then purged.
    Terminated,
    /// Unrecoverable error; cleanup is forced from here.
    Failed,
}

impl RunnerState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        self == RunnerState::Terminated
    }

    /// States counted as capacity still on its way to ready.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            RunnerState::Requested | RunnerState::Provisioning | RunnerState::Registered
        )
    }

    /// States that should have a matching GitHub registration.
    pub fn expects_github_registration(self) -> bool {
        matches!(
            self,
            RunnerState::Registered | RunnerState::Idle | RunnerState::Busy
        )
    }

    /// The forward-only lifecycle: every legal edge of the state machine.
    /// Any non-terminal state may drop into `Failed`; `Idle`⇄`Busy` is the
    /// single sanctioned cycle; everything else moves strictly forward.
    pub fn can_transition(self, to: RunnerState) -> bool {
        use RunnerState::*;

        if self == to || self.is_terminal() {
            return false;
        }
        if to == Failed {
            return true;
        }

        matches!(
            (self, to),
            (Requested, Provisioning)
                | (Provisioning, Registered)
                | (Provisioning, Idle)
                | (Registered, Idle)
                | (Registered, Busy)
                | (Idle, Busy)
                | (Busy, Idle)
                | (Idle, Deregistering)
                | (Busy, Deregistering)
                | (Deregistering, Terminating)
                | (Terminating, Terminated)
                | (Failed, Terminated)
        )
    }
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One record per VM the controller has created. The id doubles as the VM
/// name and the GitHub runner name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerRecord {
    pub id: String,
    pub state: RunnerState,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,

    /// When a JIT token was issued for this record. The token itself is
    /// single-use and never retained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jit_token_issued_at: Option<DateTime<Utc>>,

    /// GitHub's runner id, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_runner_id: Option<u64>,

    /// Provider instance id; absent only in `Requested`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_instance_id: Option<String>,

    /// Failed attempts of the record's current external operation.
    #[serde(default)]
    pub attempts: u32,
}

impl RunnerRecord {
    fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: RunnerState::Requested,
            created_at: now,
            last_transition_at: now,
            jit_token_issued_at: None,
            github_runner_id: None,
            provider_instance_id: None,
            attempts: 0,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    records: BTreeMap<String, RunnerRecord>,
}

struct Inner {
    records: BTreeMap<String, RunnerRecord>,
    path: Option<PathBuf>,
}

/// The runner state store. All writes are serialized through one lock and
/// persisted before returning; reads hand out clones.
pub struct RunnerStore {
    inner: Mutex<Inner>,
}

impl RunnerStore {
    /// Open (or create) the store file at `path`.
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        let records = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read state store {}", path.display()))?;
            let file: StoreFile = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse state store {}", path.display()))?;
            file.records
        } else {
            BTreeMap::new()
        };

        tracing::info!(
            path = %path.display(),
            records = records.len(),
            "opened runner state store"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                records,
                path: Some(path),
            }),
        })
    }

    /// A store that never touches disk. Tests and dry runs.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: BTreeMap::new(),
                path: None,
            }),
        }
    }

    /// Create a new record in `Requested`. The id must be fresh; a
    /// duplicate is an invariant violation, not an overwrite.
    pub fn create_requested(&self, id: &str) -> FleetResult<RunnerRecord> {
        let mut inner = self.inner.lock();

        if inner.records.contains_key(id) {
            return Err(FleetError::InvariantViolation(format!(
                "duplicate runner record id {id}"
            )));
        }

        let record = RunnerRecord::new(id.to_string());
        inner.records.insert(id.to_string(), record.clone());
        persist(&inner)?;

        tracing::info!(record = id, "created runner record");
        Ok(record)
    }

    /// Drive a record's state machine forward. Illegal transitions are
    /// rejected as invariant violations and leave the store untouched.
    pub fn transition(&self, id: &str, to: RunnerState) -> FleetResult<RunnerRecord> {
        let mut inner = self.inner.lock();
        let record = get_mut(&mut inner, id)?;

        let from = record.state;
        if !from.can_transition(to) {
            return Err(FleetError::InvariantViolation(format!(
                "illegal transition {from} -> {to} for record {id}"
            )));
        }

        record.state = to;
        record.last_transition_at = Utc::now();
        record.attempts = 0;
        let updated = record.clone();
        persist(&inner)?;

        tracing::info!(record = id, %from, %to, "state transition");
        Ok(updated)
    }

    /// Attach the provider instance id. Enforces the one-record-per-
    /// instance invariant before persisting.
    pub fn set_provider_instance(&self, id: &str, instance_id: &str) -> FleetResult<()> {
        let mut inner = self.inner.lock();

        if let Some(holder) = inner
            .records
            .values()
            .find(|r| r.id != id && r.provider_instance_id.as_deref() == Some(instance_id))
        {
            return Err(FleetError::InvariantViolation(format!(
                "instance {instance_id} already owned by record {}",
                holder.id
            )));
        }

        let record = get_mut(&mut inner, id)?;
        record.provider_instance_id = Some(instance_id.to_string());
        persist(&inner)?;
        Ok(())
    }

    /// Attach the GitHub runner id once known.
    pub fn set_github_runner(&self, id: &str, github_runner_id: u64) -> FleetResult<()> {
        let mut inner = self.inner.lock();
        let record = get_mut(&mut inner, id)?;
        record.github_runner_id = Some(github_runner_id);
        persist(&inner)?;
        Ok(())
    }

    /// Record that a JIT token was issued for this record just now.
    pub fn mark_jit_issued(&self, id: &str) -> FleetResult<()> {
        let mut inner = self.inner.lock();
        let record = get_mut(&mut inner, id)?;
        record.jit_token_issued_at = Some(Utc::now());
        persist(&inner)?;
        Ok(())
    }

    /// Count one failed attempt; returns the new total.
    pub fn record_attempt(&self, id: &str) -> FleetResult<u32> {
        let mut inner = self.inner.lock();
        let record = get_mut(&mut inner, id)?;
        record.attempts += 1;
        let attempts = record.attempts;
        persist(&inner)?;
        Ok(attempts)
    }

    pub fn get(&self, id: &str) -> Option<RunnerRecord> {
        self.inner.lock().records.get(id).cloned()
    }

    /// Backdate a record's transition timestamp to simulate elapsed time.
    #[cfg(test)]
    pub fn set_last_transition_at(&self, id: &str, at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(id) {
            record.last_transition_at = at;
        }
    }

    /// Clone of every record, for a reconciliation pass to work from.
    pub fn snapshot(&self) -> Vec<RunnerRecord> {
        self.inner.lock().records.values().cloned().collect()
    }

    /// Drop `Terminated` records older than the audit retention window.
    /// Returns how many were purged.
    pub fn purge_terminated(&self, retention: Duration) -> usize {
        let mut inner = self.inner.lock();
        let cutoff = Utc::now() - retention;

        let before = inner.records.len();
        inner.records.retain(|_, r| {
            !(r.state == RunnerState::Terminated && r.last_transition_at < cutoff)
        });
        let purged = before - inner.records.len();

        if purged > 0 {
            if let Err(err) = persist(&inner) {
                tracing::warn!(error = %err, "failed to persist store after purge");
            }
            tracing::info!(purged, "purged terminated records past audit window");
        }
        purged
    }
}

fn get_mut<'a>(inner: &'a mut Inner, id: &str) -> FleetResult<&'a mut RunnerRecord> {
    inner
        .records
        .get_mut(id)
        .ok_or_else(|| FleetError::InvariantViolation(format!("no record with id {id}")))
}

/// Write the store file atomically: temp file in the same directory, then
/// rename over the target.
fn persist(inner: &Inner) -> FleetResult<()> {
    let Some(ref path) = inner.path else {
        return Ok(());
    };

    let file = StoreFile {
        records: inner.records.clone(),
    };
    let body = serde_json::to_string_pretty(&file)
        .map_err(|e| FleetError::Transient(format!("store serialization failed: {e}")))?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, body)
        .and_then(|_| std::fs::rename(&tmp, path))
        .map_err(|e| FleetError::Transient(format!("store write failed: {e}")))
}
