//! Internal conversation endpoints called by the chat service.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::ConversationId;
use lifecycle::EscrowCancellation;
use serde::Deserialize;
use store::Store;

use super::parse_id;
use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct CancelConversationRequest {
    #[serde(default = "system_actor")]
    pub performed_by: String,
    pub reason: String,
}

fn system_actor() -> String {
    "system".to_string()
}

/// POST /internal/conversations/{id}/cancel — cancel with escrow refund, atomically.
#[tracing::instrument(skip(state, req))]
pub async fn cancel<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(req): Json<CancelConversationRequest>,
) -> Result<Json<EscrowCancellation>, ApiError> {
    let conversation_id = parse_id(&id, ConversationId::parse, "conversation id")?;
    let cancellation = state
        .escrow
        .cancel_conversation(conversation_id, &req.performed_by, &req.reason)
        .await?;
    Ok(Json(cancellation))
}
