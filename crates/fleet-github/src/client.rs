// GitHub Actions REST client for organization self-hosted runners. Three
// calls: list runners (drift detection), generate a JIT config (single-use
// registration), remove a runner (scale-down / orphan cleanup).

use std::time::Duration;

use async_trait::async_trait;
use fleet_common::error::{FleetError, FleetResult};
use fleet_common::settings::GitHubSettings;
use fleet_common::RUNNER_NAME_PREFIX;
use serde::Deserialize;
use url::Url;

/// GitHub REST API version header value.
const API_VERSION: &str = "2022-11-28";

/// Page size for runner listings.
const PAGE_SIZE: usize = 100;

/// Reported connectivity of a registered runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Online,
    Offline,
    #[serde(other)]
    #[default]
    Unknown,
}

/// A label attached to a registered runner.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerLabel {
    pub name: String,
}

/// A self-hosted runner as reported by GitHub.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubRunner {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub busy: bool,
    #[serde(default)]
    pub status: RunnerStatus,
    #[serde(default)]
    pub labels: Vec<RunnerLabel>,
}

impl GitHubRunner {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.name == label)
    }
}

/// Response of the generate-jitconfig call. The `encoded_jit_config` value
/// is the single-use registration credential: it is passed straight into
/// the boot script and never persisted or logged.
#[derive(Debug, Clone, Deserialize)]
pub struct JitConfig {
    pub runner: GitHubRunner,
    pub encoded_jit_config: String,
}

/// Seam between the reconciler and GitHub; the HTTP client below is the
/// production implementation, tests substitute their own.
#[async_trait]
pub trait GitHubRunnerApi: Send + Sync {
    /// All fleet-owned runners registered in the organization.
    async fn list_runners(&self) -> FleetResult<Vec<GitHubRunner>>;

    /// Issue a single-use JIT registration config for a new runner name.
    async fn create_jit_config(&self, runner_name: &str) -> FleetResult<JitConfig>;

    /// Remove a runner registration. Removing an already-absent runner is
    /// not an error.
    async fn remove_runner(&self, github_runner_id: u64) -> FleetResult<()>;
}

#[derive(Debug, Deserialize)]
struct RunnersPage {
    #[allow(dead_code)]
    total_count: u64,
    runners: Vec<GitHubRunner>,
}

/// Production client against the GitHub REST API.
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    org: String,
    token: String,
    runner_group_id: u64,
    labels: Vec<String>,
    fleet_label: String,
}

impl GitHubClient {
    pub fn new(settings: &GitHubSettings, request_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(format!(
                "runner-fleet-controller/{}",
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;

        // Parse up front so a bad URL fails at startup, not mid-pass.
        Url::parse(&settings.api_url)?;

        Ok(Self {
            http,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            org: settings.org.clone(),
            token: settings.token.clone(),
            runner_group_id: settings.runner_group_id,
            labels: settings.labels.clone(),
            fleet_label: settings.fleet_label().to_string(),
        })
    }

    fn runners_url(&self) -> String {
        format!("{}/orgs/{}/actions/runners", self.api_url, self.org)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }
}

/// Whether a listed runner belongs to this fleet: our name prefix and the
/// configured fleet label.
fn is_fleet_runner(runner: &GitHubRunner, fleet_label: &str) -> bool {
    runner.name.starts_with(RUNNER_NAME_PREFIX) && runner.has_label(fleet_label)
}

#[async_trait]
impl GitHubRunnerApi for GitHubClient {
    async fn list_runners(&self) -> FleetResult<Vec<GitHubRunner>> {
        let mut runners = Vec::new();
        let mut page = 1u32;

        loop {
            let response = self
                .request(self.http.get(self.runners_url()))
                .query(&[("per_page", PAGE_SIZE as u32), ("page", page)])
                .send()
                .await
                .map_err(FleetError::from_transport)?;

            let status = response.status();
            if !status.is_success() {
                return Err(FleetError::from_status(status, &response));
            }

            let body: RunnersPage = response
                .json()
                .await
                .map_err(|e| FleetError::InvalidRequest(format!("malformed runner list: {e}")))?;

            let page_len = body.runners.len();
            runners.extend(
                body.runners
                    .into_iter()
                    .filter(|r| is_fleet_runner(r, &self.fleet_label)),
            );

            if page_len < PAGE_SIZE {
                break;
            }
            page += 1;
        }

        tracing::debug!(count = runners.len(), org = %self.org, "listed fleet runners");
        Ok(runners)
    }

    async fn create_jit_config(&self, runner_name: &str) -> FleetResult<JitConfig> {
        let url = format!("{}/generate-jitconfig", self.runners_url());
        let body = serde_json::json!({
            "name": runner_name,
            "runner_group_id": self.runner_group_id,
            "labels": self.labels,
        });

        let response = self
            .request(self.http.post(url))
            .json(&body)
            .send()
            .await
            .map_err(FleetError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FleetError::from_status(status, &response));
        }

        let config: JitConfig = response
            .json()
            .await
            .map_err(|e| FleetError::InvalidRequest(format!("malformed jitconfig: {e}")))?;

        tracing::info!(
            runner_name,
            github_runner_id = config.runner.id,
            "issued jit config"
        );
        Ok(config)
    }

    async fn remove_runner(&self, github_runner_id: u64) -> FleetResult<()> {
        let url = format!("{}/{}", self.runners_url(), github_runner_id);

        let response = self
            .request(self.http.delete(url))
            .send()
            .await
            .map_err(FleetError::from_transport)?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(github_runner_id, "removed runner registration");
            return Ok(());
        }

        match FleetError::from_status(status, &response) {
            // Already gone counts as removed.
            FleetError::NotFound => Ok(()),
            err => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(name: &str, labels: &[&str]) -> GitHubRunner {
        GitHubRunner {
            id: 7,
            name: name.to_string(),
            busy: false,
            status: RunnerStatus::Online,
            labels: labels
                .iter()
                .map(|l| RunnerLabel {
                    name: l.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_fleet_runner_filter() {
        assert!(is_fleet_runner(
            &runner("gha-abcde", &["self-hosted", "cloud-small"]),
            "cloud-small"
        ));
        // Wrong prefix: not ours even with the label.
        assert!(!is_fleet_runner(
            &runner("build-box-1", &["cloud-small"]),
            "cloud-small"
        ));
        // Right prefix, different pool label.
        assert!(!is_fleet_runner(
            &runner("gha-abcde", &["cloud-large"]),
            "cloud-small"
        ));
    }

    #[test]
    fn test_runner_listing_deserializes() {
        let body = r#"{
            "total_count": 1,
            "runners": [
                {
                    "id": 23,
                    "name": "gha-xyzzy",
                    "os": "linux",
                    "status": "online",
                    "busy": true,
                    "labels": [{"id": 1, "name": "self-hosted", "type": "read-only"}]
                }
            ]
        }"#;

        let page: RunnersPage = serde_json::from_str(body).unwrap();
        assert_eq!(page.runners.len(), 1);
        let r = &page.runners[0];
        assert_eq!(r.name, "gha-xyzzy");
        assert!(r.busy);
        assert_eq!(r.status, RunnerStatus::Online);
        assert!(r.has_label("self-hosted"));
    }

    #[test]
    fn test_unknown_status_is_tolerated() {
        let r: GitHubRunner =
            serde_json::from_str(r#"{"id": 1, "name": "gha-a", "status": "odd"}"#).unwrap();
        assert_eq!(r.status, RunnerStatus::Unknown);
    }

    #[test]
    fn test_jitconfig_deserializes() {
        let body = r#"{
            "runner": {"id": 42, "name": "gha-abcde", "status": "offline", "busy": false, "labels": []},
            "encoded_jit_config": "b64-opaque"
        }"#;

        let config: JitConfig = serde_json::from_str(body).unwrap();
        assert_eq!(config.runner.id, 42);
        assert_eq!(config.encoded_jit_config, "b64-opaque");
    }
}
