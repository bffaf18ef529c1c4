//! Agreement creation, retrieval and transition endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use common::{AgreementId, ConversationId, ProposalId, UserId, Version};
use domain::{Agreement, AgreementStatus, Money, Parties, PartySnapshot, ProposalSnapshot};
use lifecycle::{ActionContext, CreateAgreement, TransitionOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use store::Store;

use super::{IDEMPOTENCY_KEY, actor, header, parse_id};
use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct CreateAgreementRequest {
    pub conversation_id: ConversationId,
    pub proposal_id: Option<ProposalId>,
    pub game: String,
    pub category: String,
    pub price_cents: i64,
    pub estimated_time: String,
    pub client: PartySnapshot,
    pub booster: PartySnapshot,
}

/// Body shared by transitions that carry nothing but the expected version.
#[derive(Deserialize)]
pub struct TransitionRequest {
    pub version: Option<i64>,
}

#[derive(Deserialize)]
pub struct CompleteRequest {
    pub version: Option<i64>,
    #[serde(default)]
    pub details: Map<String, Value>,
}

#[derive(Deserialize)]
pub struct ReasonRequest {
    pub version: Option<i64>,
    pub reason: String,
}

#[derive(Deserialize)]
pub struct RenegotiateRequest {
    pub version: Option<i64>,
    pub new_price_cents: i64,
    pub new_time: String,
    pub reason: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
pub struct AgreementCreatedResponse {
    pub agreement_id: AgreementId,
    pub status: AgreementStatus,
    pub version: i64,
    pub created: bool,
}

#[derive(Serialize)]
pub struct TransitionResponse {
    pub agreement_id: AgreementId,
    pub status: AgreementStatus,
    pub version: i64,
    /// True when the idempotency key had already been applied.
    pub replayed: bool,
}

impl From<TransitionOutcome> for TransitionResponse {
    fn from(outcome: TransitionOutcome) -> Self {
        Self {
            agreement_id: outcome.agreement.id(),
            status: outcome.agreement.status(),
            version: outcome.agreement.version().as_i64(),
            replayed: !outcome.transition.is_applied(),
        }
    }
}

fn context(headers: &HeaderMap, version: Option<i64>) -> Result<ActionContext, ApiError> {
    let mut ctx = ActionContext::new(actor(headers)?);
    if let Some(key) = header(headers, IDEMPOTENCY_KEY) {
        ctx = ctx.with_key(key);
    }
    if let Some(version) = version {
        ctx = ctx.with_expected_version(Version::new(version));
    }
    Ok(ctx)
}

fn agreement_id(id: &str) -> Result<AgreementId, ApiError> {
    parse_id(id, AgreementId::parse, "agreement id")
}

// -- Handlers --

/// POST /agreements — create an agreement from an accepted proposal.
///
/// Returns 201 for a new agreement and 200 when the idempotency key replays.
#[tracing::instrument(skip(state, headers, req))]
pub async fn create<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Json(req): Json<CreateAgreementRequest>,
) -> Result<(StatusCode, Json<AgreementCreatedResponse>), ApiError> {
    let outcome = state
        .service
        .create(CreateAgreement {
            conversation_id: req.conversation_id,
            proposal_id: req.proposal_id,
            proposal: ProposalSnapshot {
                game: req.game,
                category: req.category,
                price: Money::from_cents(req.price_cents),
                estimated_time: req.estimated_time,
            },
            parties: Parties {
                client: req.client,
                booster: req.booster,
            },
            created_by: actor(&headers)?,
            idempotency_key: header(&headers, IDEMPOTENCY_KEY),
        })
        .await?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(AgreementCreatedResponse {
            agreement_id: outcome.agreement.id(),
            status: outcome.agreement.status(),
            version: outcome.agreement.version().as_i64(),
            created: outcome.created,
        }),
    ))
}

/// GET /agreements/{id} — full agreement, visible to its parties only.
#[tracing::instrument(skip(state, headers))]
pub async fn get<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Agreement>, ApiError> {
    let agreement_id = agreement_id(&id)?;
    let user_id = parse_id(&actor(&headers)?, UserId::parse, "user id")?;
    Ok(Json(state.service.get(agreement_id, user_id).await?))
}

/// POST /agreements/{id}/activate
#[tracing::instrument(skip(state, headers, req))]
pub async fn activate<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<TransitionRequest>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let ctx = context(&headers, req.version)?;
    let outcome = state.service.activate(agreement_id(&id)?, ctx).await?;
    Ok(Json(outcome.into()))
}

/// POST /agreements/{id}/complete
#[tracing::instrument(skip(state, headers, req))]
pub async fn complete<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let ctx = context(&headers, req.version)?;
    let outcome = state
        .service
        .complete(agreement_id(&id)?, req.details, ctx)
        .await?;
    Ok(Json(outcome.into()))
}

/// POST /agreements/{id}/cancel
#[tracing::instrument(skip(state, headers, req))]
pub async fn cancel<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ReasonRequest>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let ctx = context(&headers, req.version)?;
    let outcome = state
        .service
        .cancel(agreement_id(&id)?, &req.reason, ctx)
        .await?;
    Ok(Json(outcome.into()))
}

/// POST /agreements/{id}/renegotiate
#[tracing::instrument(skip(state, headers, req))]
pub async fn renegotiate<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<RenegotiateRequest>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let ctx = context(&headers, req.version)?;
    let outcome = state
        .service
        .renegotiate(
            agreement_id(&id)?,
            Money::from_cents(req.new_price_cents),
            &req.new_time,
            req.reason.as_deref(),
            ctx,
        )
        .await?;
    Ok(Json(outcome.into()))
}

/// POST /agreements/{id}/expire
#[tracing::instrument(skip(state, headers, req))]
pub async fn expire<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<TransitionRequest>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let ctx = context(&headers, req.version)?;
    let outcome = state.service.expire(agreement_id(&id)?, ctx).await?;
    Ok(Json(outcome.into()))
}

/// POST /agreements/{id}/dispute — administrative.
#[tracing::instrument(skip(state, headers, req))]
pub async fn dispute<S: Store + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ReasonRequest>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let ctx = context(&headers, req.version)?;
    let outcome = state
        .service
        .dispute(agreement_id(&id)?, &req.reason, ctx)
        .await?;
    Ok(Json(outcome.into()))
}
