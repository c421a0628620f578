use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::coordinator::Coordinator;
use crate::error::FleetError;
use crate::protocol::handler::worker_socket;
use crate::scheduler::{JobId, JobSpec, JobSummary};

#[derive(Serialize)]
struct SubmitJobResponse {
    job_id: JobId,
    worker_id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct QueueResponse {
    worker_id: String,
    queue_length: usize,
    jobs: Vec<JobSummary>,
}

/// Worker socket plus the collaborator HTTP API.
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(worker_socket))
        .route("/api/jobs", post(submit_job_handler))
        .route("/api/workers", get(list_workers_handler))
        .route("/api/workers/:worker_id/queue", get(worker_queue_handler))
        .layer(cors)
        .with_state(coordinator)
}

fn error_response(status: StatusCode, error: &FleetError) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

async fn submit_job_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Json(spec): Json<JobSpec>,
) -> Response {
    match coordinator.submit_job(spec).await {
        Ok(assignment) => (
            StatusCode::OK,
            Json(SubmitJobResponse {
                job_id: assignment.job_id,
                worker_id: assignment.worker_id,
            }),
        )
            .into_response(),
        Err(e @ FleetError::NoCapableWorker(_)) => error_response(StatusCode::SERVICE_UNAVAILABLE, &e),
        Err(e @ FleetError::DuplicateJob(_)) => error_response(StatusCode::CONFLICT, &e),
        Err(e) => {
            tracing::error!(error = %e, "Job submission failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}

async fn list_workers_handler(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    Json(coordinator.list_workers().await)
}

async fn worker_queue_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Path(worker_id): Path<String>,
) -> Response {
    let dispatcher = coordinator.dispatcher();
    let Some(queue_length) = dispatcher.queue_length(&worker_id) else {
        return error_response(StatusCode::NOT_FOUND, &FleetError::WorkerNotFound(worker_id));
    };
    let jobs = dispatcher
        .view_queue(&worker_id)
        .iter()
        .map(JobSummary::from)
        .collect();

    Json(QueueResponse {
        worker_id,
        queue_length,
        jobs,
    })
    .into_response()
}
