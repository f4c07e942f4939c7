// Webhook ingestor: authenticates `workflow_job` deliveries and converts
// them into demand increments and reconcile triggers. It never touches
// runner records; completion is observed through runner status in the
// drift pass, the webhook only makes the next pass happen sooner.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use fleet_github::webhook::{self, WorkflowJobAction, WorkflowJobEvent, SIGNATURE_HEADER};

use crate::demand::{DemandTracker, ReconcileTrigger};

/// Header naming the event type of a delivery.
const EVENT_HEADER: &str = "X-GitHub-Event";

/// Shared state for the webhook route.
pub struct IngestorState {
    pub secret: Vec<u8>,
    pub org: String,
    pub fleet_label: String,
    pub demand: Arc<DemandTracker>,
    pub trigger: ReconcileTrigger,
}

/// Build the webhook router.
pub fn router(state: Arc<IngestorState>) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .with_state(state)
}

async fn handle_webhook(
    State(state): State<Arc<IngestorState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    // Authenticate before reading anything else out of the delivery.
    let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
        tracing::warn!("webhook delivery without signature header rejected");
        return StatusCode::UNAUTHORIZED;
    };

    if let Err(err) = webhook::verify_signature(&state.secret, &body, signature) {
        tracing::warn!(error = %err, "webhook signature verification failed");
        return StatusCode::UNAUTHORIZED;
    }

    // Only workflow_job deliveries are interesting; everything else
    // (ping, check_run, ...) is acknowledged and dropped.
    let event_type = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if event_type != "workflow_job" {
        tracing::debug!(event_type, "ignoring non-workflow_job delivery");
        return StatusCode::OK;
    }

    let event: WorkflowJobEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(error = %err, "malformed workflow_job payload");
            return StatusCode::BAD_REQUEST;
        }
    };

    if !event.matches_fleet(&state.org, &state.fleet_label) {
        tracing::debug!(job_id = event.workflow_job.id, "event is not for this fleet");
        return StatusCode::OK;
    }

    match event.action {
        WorkflowJobAction::Queued => {
            let pending = state.demand.record_queued();
            tracing::info!(
                job_id = event.workflow_job.id,
                pending,
                "job queued; requesting reconcile pass"
            );
            state.trigger.fire();
        }
        WorkflowJobAction::Completed => {
            // No store mutation: Busy -> Idle is observed from GitHub
            // state. A prompt pass just picks it up sooner.
            tracing::info!(
                job_id = event.workflow_job.id,
                runner = event.workflow_job.runner_name.as_deref().unwrap_or(""),
                "job completed; requesting reconcile pass"
            );
            state.trigger.fire();
        }
        _ => {
            tracing::debug!(job_id = event.workflow_job.id, "ignoring job action");
        }
    }

    StatusCode::OK
}
