// fleet-github: GitHub REST adapter for organization self-hosted runners
// (listing, JIT registration, removal) and the `workflow_job` webhook wire
// format with its HMAC signature check.

pub mod client;
pub mod webhook;

pub use client::{GitHubClient, GitHubRunner, GitHubRunnerApi, JitConfig, RunnerStatus};
pub use webhook::{verify_signature, WorkflowJobAction, WorkflowJobEvent};
