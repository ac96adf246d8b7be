use std::future::ready;

use axum::{
    http::{Method, StatusCode},
    routing::get,
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    api::{endpoint, sse_endpoint},
    config::Config,
    flags::pg_store::PgFlagStore,
    metrics_utils::{setup_metrics_recorder, track_metrics},
    service::FlagService,
};

#[derive(Clone)]
pub struct State {
    pub service: FlagService,
    pub config: Config,
    // None when serving from the in-memory store
    pub pg_store: Option<PgFlagStore>,
}

pub fn router(service: FlagService, pg_store: Option<PgFlagStore>, config: Config) -> Router {
    let state = State {
        service,
        config: config.clone(),
        pg_store,
    };

    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
            Method::HEAD,
        ])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request());

    // liveness/readiness checks
    let status_router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(|| ready("ok")));

    let flags_router = Router::new()
        .route(
            "/flags",
            get(endpoint::list_flags).post(endpoint::create_flag),
        )
        .route(
            "/flags/:id",
            get(endpoint::get_flag)
                .put(endpoint::update_flag)
                .delete(endpoint::delete_flag),
        )
        .route(
            "/flags/:id/overrides",
            get(endpoint::list_overrides).post(endpoint::create_override),
        )
        .route(
            "/flags/:id/overrides/:user_id",
            axum::routing::put(endpoint::set_override).delete(endpoint::delete_override),
        )
        .route("/flags/:id/audit", get(endpoint::list_audit_entries))
        .route("/effective", get(endpoint::effective_flags))
        .layer(ConcurrencyLimitLayer::new(config.max_concurrency));

    // Streams live as long as their clients, so they stay outside the concurrency limit
    let stream_router = Router::new().route("/stream", get(sse_endpoint::flag_changes_stream));

    let router = Router::new()
        .merge(status_router)
        .merge(flags_router)
        .merge(stream_router)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Global metrics recorders can play poorly with e.g. tests
    if config.enable_metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}

pub async fn readiness(
    axum::extract::State(state): axum::extract::State<State>,
) -> Result<&'static str, (StatusCode, String)> {
    match &state.pg_store {
        Some(store) if !store.is_ready().await => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "database unavailable".to_string(),
        )),
        _ => Ok("ready"),
    }
}

pub async fn index() -> &'static str {
    "flag overrides"
}
