// Entry point for the runner fleet controller process.
//
// Wires the adapters, state store, reconciler, and webhook ingestor
// together: the reconciler runs as a background task fed by the poll timer
// and the ingestor's trigger channel; the webhook endpoint is served until
// a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_common::boot_script::BootScriptTemplate;
use fleet_common::settings::FleetSettings;
use fleet_common::SecretMasker;
use fleet_controller::broker::JitBroker;
use fleet_controller::demand::{DemandTracker, ReconcileTrigger};
use fleet_controller::ingestor::{self, IngestorState};
use fleet_controller::reconciler::Reconciler;
use fleet_controller::store::RunnerStore;
use fleet_github::{GitHubClient, GitHubRunnerApi};
use fleet_provider::{ComputeProvider, OpenStackCompute};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(
    name = "fleet-controller",
    about = "Ephemeral GitHub Actions runner fleet controller"
)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Override the webhook bind address from the config file.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let settings = FleetSettings::load(&cli.config)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        org = %settings.github.org,
        label = settings.github.fleet_label(),
        min_ready = settings.scaling.min_ready,
        poll_interval_secs = settings.scaling.poll_interval_secs,
        "fleet controller starting"
    );

    // Every credential the process holds is registered up front so none of
    // them can leak through log output.
    let masker = SecretMasker::new();
    masker.add_value(&settings.github.token);
    masker.add_value(&settings.webhook.secret);
    masker.add_value(&settings.compute.auth_token);

    let request_timeout = settings.compute.request_timeout();
    let github: Arc<dyn GitHubRunnerApi> =
        Arc::new(GitHubClient::new(&settings.github, request_timeout)?);
    let provider: Arc<dyn ComputeProvider> = Arc::new(OpenStackCompute::new(
        &settings.compute,
        &settings.instance,
        request_timeout,
    )?);

    let store = Arc::new(RunnerStore::open(settings.store_path.clone())?);
    let demand = Arc::new(DemandTracker::new());
    let (trigger, trigger_rx) = ReconcileTrigger::new();

    let template = match settings.boot_script_path {
        Some(ref path) => BootScriptTemplate::load(path)?,
        None => BootScriptTemplate::builtin(),
    };

    let broker = JitBroker::new(
        Arc::clone(&github),
        Arc::clone(&provider),
        Arc::clone(&store),
        template,
        settings.runner.clone(),
        settings.instance.clone(),
        masker.clone(),
    );

    let cancel = CancellationToken::new();
    let reconciler = Reconciler::new(
        store,
        github,
        provider,
        broker,
        Arc::clone(&demand),
        settings.scaling.clone(),
        cancel.clone(),
    );
    let reconciler_handle = tokio::spawn(reconciler.run(trigger_rx));

    let ingestor_state = Arc::new(IngestorState {
        secret: settings.webhook.secret.clone().into_bytes(),
        org: settings.github.org.clone(),
        fleet_label: settings.github.fleet_label().to_string(),
        demand,
        trigger,
    });

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| settings.webhook.bind_addr.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind webhook listener on {bind_addr}"))?;
    tracing::info!(%bind_addr, "webhook endpoint listening");

    let shutdown = cancel.clone();
    axum::serve(listener, ingestor::router(ingestor_state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    let _ = reconciler_handle.await;
    tracing::info!("fleet controller stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
