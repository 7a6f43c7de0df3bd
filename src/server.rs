use std::sync::Arc;
use axum::{extract::Path as UrlPath, routing::{get, post}, Router, Json};
use tower_http::cors::{CorsLayer, Any};
use serde::{Deserialize, Serialize};
use axum::http::StatusCode;
use tracing::{info, warn};
use crate::condition::Condition;
use crate::error::BulkError;
use crate::interface::{BulkInterface, RunId, RunOutcome};
use crate::request::{BulkRequest, BulkResult, WorkItem};
use crate::store::RecordStore;

pub type SharedInterface = Arc<BulkInterface<dyn RecordStore>>;

#[derive(Deserialize)]
pub struct QueryRequest {
    pub condition: Condition,
}

#[derive(Serialize)]
pub struct BulkResponse {
    pub id: u64,
    pub status: String,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<BulkResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<WorkItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BulkResponse {
    fn ok(id: RunId, elapsed_ms: f64) -> Self {
        Self { id: id.0, status: "ok".into(), elapsed_ms, result: None, matches: None, error: None }
    }
    fn failed(id: RunId, elapsed_ms: f64, e: &BulkError) -> (StatusCode, Json<Self>) {
        let status = status_of(e);
        let msg = format!("{e}");
        warn!(%msg, code=%status.as_u16(), "bulk error");
        let body = Self { id: id.0, status: "error".into(), elapsed_ms, result: None, matches: None, error: Some(msg) };
        (status, Json(body))
    }
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub id: u64,
    pub cancelled: bool,
}

/// Problems with the request itself are the caller's fault.
pub fn status_of(e: &BulkError) -> StatusCode {
    match e {
        BulkError::Request(_) | BulkError::Path(_) | BulkError::Template(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type Reply = Result<(StatusCode, Json<BulkResponse>), (StatusCode, &'static str)>;

pub fn router(interface: SharedInterface) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);
    let bulk_iface = Arc::clone(&interface);
    let query_iface = Arc::clone(&interface);
    let cancel_iface = Arc::clone(&interface);
    let start_iface = Arc::clone(&interface);
    let outcome_iface = Arc::clone(&interface);
    let runs_iface = interface;
    Router::new()
        .route("/v1/bulk", post(move |Json(req): Json<BulkRequest>| {
        let iface = Arc::clone(&bulk_iface);
        async move {
            // The executor is synchronous and may fan out over threads of its own.
            let started = std::time::Instant::now();
            let (id, outcome) = tokio::task::spawn_blocking(move || iface.run_sync(&req))
                .await
                .map_err(|e| {
                    warn!(error=%e, "Join error");
                    (StatusCode::INTERNAL_SERVER_ERROR, "Join error")
                })?;
            let elapsed_ms_f64 = started.elapsed().as_secs_f64() * 1000.0;
            match outcome {
                Ok(result) => {
                    info!(run=id.0, ms=elapsed_ms_f64, total=result.total, failed=result.failed, dry_run=result.dry_run, "bulk request complete");
                    let body = BulkResponse { result: Some(result), ..BulkResponse::ok(id, elapsed_ms_f64) };
                    Reply::Ok((StatusCode::OK, Json(body)))
                }
                Err(e) => Reply::Ok(BulkResponse::failed(id, elapsed_ms_f64, &e)),
            }
        }
    }))
        .route("/v1/query", post(move |Json(req): Json<QueryRequest>| {
        let iface = Arc::clone(&query_iface);
        async move {
            let started = std::time::Instant::now();
            let outcome = tokio::task::spawn_blocking(move || iface.collect(&req.condition))
                .await
                .map_err(|e| {
                    warn!(error=%e, "Join error");
                    (StatusCode::INTERNAL_SERVER_ERROR, "Join error")
                })?;
            let elapsed_ms_f64 = started.elapsed().as_secs_f64() * 1000.0;
            match outcome {
                Ok(matches) => {
                    info!(ms=elapsed_ms_f64, matched=matches.len(), "query complete");
                    let body = BulkResponse { matches: Some(matches), ..BulkResponse::ok(RunId(0), elapsed_ms_f64) };
                    Reply::Ok((StatusCode::OK, Json(body)))
                }
                Err(e) => Reply::Ok(BulkResponse::failed(RunId(0), elapsed_ms_f64, &e)),
            }
        }
    }))
        .route("/v1/bulk/start", post(move |Json(req): Json<BulkRequest>| {
        let iface = Arc::clone(&start_iface);
        async move {
            // returns at once; the id can be cancelled or polled right away
            match iface.start_detached(req) {
                Ok(id) => {
                    let body = BulkResponse { status: "running".into(), ..BulkResponse::ok(id, 0.0) };
                    (StatusCode::ACCEPTED, Json(body))
                }
                Err(e) => BulkResponse::failed(RunId(0), 0.0, &e),
            }
        }
    }))
        .route("/v1/bulk/:id", get(move |UrlPath(id): UrlPath<u64>| {
        let iface = Arc::clone(&outcome_iface);
        async move {
            let id = RunId(id);
            // outcomes are stored before a run leaves the active set
            if iface.is_active(id) {
                return (StatusCode::ACCEPTED, Json(BulkResponse { status: "running".into(), ..BulkResponse::ok(id, 0.0) }));
            }
            match iface.take_outcome(id) {
                Some(RunOutcome::Completed(result)) => {
                    let body = BulkResponse { elapsed_ms: result.elapsed_ms, result: Some(result), ..BulkResponse::ok(id, 0.0) };
                    (StatusCode::OK, Json(body))
                }
                Some(RunOutcome::Failed(msg)) => {
                    let body = BulkResponse { status: "error".into(), error: Some(msg), ..BulkResponse::ok(id, 0.0) };
                    (StatusCode::OK, Json(body))
                }
                None => {
                    let body = BulkResponse { status: "unknown".into(), ..BulkResponse::ok(id, 0.0) };
                    (StatusCode::NOT_FOUND, Json(body))
                }
            }
        }
    }))
        .route("/v1/bulk/:id/cancel", post(move |UrlPath(id): UrlPath<u64>| {
        let iface = Arc::clone(&cancel_iface);
        async move {
            let cancelled = iface.cancel(RunId(id));
            info!(run=id, cancelled, "cancel requested");
            let status = if cancelled { StatusCode::OK } else { StatusCode::NOT_FOUND };
            (status, Json(CancelResponse { id, cancelled }))
        }
    }))
        .route("/v1/runs", get(move || {
        let iface = Arc::clone(&runs_iface);
        async move { Json(iface.active()) }
    }))
    .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathError;
    use crate::store::StoreError;

    #[test]
    fn request_problems_are_bad_requests() {
        assert_eq!(status_of(&BulkError::Request("no actions".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(&BulkError::Path(PathError::Malformed("a..b".into()))), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(&BulkError::Store(StoreError::Backend("disk".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
