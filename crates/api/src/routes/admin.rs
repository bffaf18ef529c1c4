//! Operator endpoints for reconciliation and the retry queue.
//!
//! These return structured reports; per-item failures are part of the
//! report, not an error status.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use common::TaskId;
use domain::{LegacyPrice, Money, RetryTask};
use reconciliation::{ConsistencyReport, DrainReport, PriceRepairReport, SweepReport};
use serde::Deserialize;
use store::Store;

use super::parse_id;
use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct RepairByPriceRequest {
    /// A number or a locale-formatted string such as `"1.200,50"`.
    pub price: LegacyPrice,
    pub epsilon: Option<f64>,
}

#[derive(Deserialize)]
pub struct DrainParams {
    pub batch: Option<usize>,
}

/// GET /admin/reconciliation/consistency
pub async fn consistency<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<ConsistencyReport>, ApiError> {
    Ok(Json(state.sweep.consistency_check().await?))
}

/// POST /admin/reconciliation/sweep
#[tracing::instrument(skip(state))]
pub async fn sweep<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<SweepReport>, ApiError> {
    Ok(Json(state.sweep.run_full_sweep().await?))
}

/// POST /admin/reconciliation/repair-by-price
#[tracing::instrument(skip(state, req))]
pub async fn repair_by_price<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<RepairByPriceRequest>,
) -> Result<Json<PriceRepairReport>, ApiError> {
    let price = req
        .price
        .amount()
        .ok_or_else(|| ApiError::BadRequest(format!("Unreadable price: {}", req.price)))?;
    let epsilon = Money::from_decimal(req.epsilon.unwrap_or(0.01).abs());
    Ok(Json(state.sweep.repair_by_price(price, epsilon).await?))
}

/// POST /admin/retry-queue/drain
#[tracing::instrument(skip(state, params))]
pub async fn drain<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Query(params): Query<DrainParams>,
) -> Result<Json<DrainReport>, ApiError> {
    let batch = params.batch.unwrap_or(state.retry_batch_size);
    Ok(Json(state.queue.process_pending_tasks(batch).await?))
}

/// POST /admin/retry-queue/tasks/{id}/reset
#[tracing::instrument(skip(state))]
pub async fn reset_task<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<RetryTask>, ApiError> {
    let task_id = parse_id(&id, TaskId::parse, "task id")?;
    Ok(Json(state.queue.reset_failed(task_id).await?))
}
