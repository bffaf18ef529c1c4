//! HTTP surface and background jobs for the agreement engine.
//!
//! Provides REST endpoints for agreements, the internal conversation
//! cancellation hook and operator reconciliation endpoints, with structured
//! logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod jobs;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use lifecycle::{AgreementService, EscrowService, LegacyAdapter, Notifier};
use metrics_exporter_prometheus::PrometheusHandle;
use reconciliation::{HandlerRegistry, ReconciliationSweep, RetryQueue};
use store::Store;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// Shared application state accessible from all handlers and jobs.
pub struct AppState<S: Store> {
    pub service: AgreementService<S>,
    pub escrow: EscrowService<S>,
    pub legacy: LegacyAdapter<S>,
    pub queue: RetryQueue<S>,
    pub sweep: ReconciliationSweep<S>,
    pub retry_batch_size: usize,
}

impl<S: Store + Clone> AppState<S> {
    /// Wires every service over one store handle.
    pub fn new(store: S, notifier: Arc<dyn Notifier>, config: &Config) -> Self {
        let service =
            AgreementService::new(store.clone(), notifier).with_max_attempts(config.retry_max_attempts);
        let queue = RetryQueue::new(store, HandlerRegistry::with_defaults(service.clone()))
            .with_max_attempts(config.retry_max_attempts);
        let sweep = ReconciliationSweep::new(service.clone(), queue.clone(), config.sweep_config());

        Self {
            escrow: EscrowService::new(service.clone()),
            legacy: LegacyAdapter::new(service.clone()),
            service,
            queue,
            sweep,
            retry_batch_size: config.retry_batch_size,
        }
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: Store + Clone>(state: Arc<AppState<S>>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/agreements", post(routes::agreements::create::<S>))
        .route("/agreements/{id}", get(routes::agreements::get::<S>))
        .route("/agreements/{id}/activate", post(routes::agreements::activate::<S>))
        .route("/agreements/{id}/complete", post(routes::agreements::complete::<S>))
        .route("/agreements/{id}/cancel", post(routes::agreements::cancel::<S>))
        .route("/agreements/{id}/renegotiate", post(routes::agreements::renegotiate::<S>))
        .route("/agreements/{id}/expire", post(routes::agreements::expire::<S>))
        .route("/agreements/{id}/dispute", post(routes::agreements::dispute::<S>))
        .route(
            "/internal/conversations/{id}/cancel",
            post(routes::conversations::cancel::<S>),
        )
        .route(
            "/admin/reconciliation/consistency",
            get(routes::admin::consistency::<S>),
        )
        .route("/admin/reconciliation/sweep", post(routes::admin::sweep::<S>))
        .route(
            "/admin/reconciliation/repair-by-price",
            post(routes::admin::repair_by_price::<S>),
        )
        .route("/admin/retry-queue/drain", post(routes::admin::drain::<S>))
        .route(
            "/admin/retry-queue/tasks/{id}/reset",
            post(routes::admin::reset_task::<S>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
