use std::{future::ready, sync::Arc};

use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    admin_endpoint, api::FlagError, config::Config, evaluation_cache::EvaluationCacheManager,
    flag_store::SharedFlagStore, flags_endpoint,
};

#[derive(Clone)]
pub struct State {
    pub store: SharedFlagStore,
    pub evaluation_cache: Arc<EvaluationCacheManager>,
    pub config: Config,
}

pub fn router(
    store: SharedFlagStore,
    evaluation_cache: Arc<EvaluationCacheManager>,
    config: Config,
) -> Router {
    // Clone the store handle for the readiness check before moving into State
    let store_for_readiness = store.clone();

    let state = State {
        store,
        evaluation_cache,
        config: config.clone(),
    };

    // Very permissive CORS policy; the admin UI and the application frontends
    // sit on different origins depending on the deployment.
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request());

    // liveness/readiness checks
    let status_router = Router::new()
        .route("/", get(index))
        .route(
            "/_readiness",
            get(move || readiness(store_for_readiness.clone())),
        )
        .route("/_liveness", get(|| ready("ok")));

    // subject-facing read endpoints
    let flags_router = Router::new()
        .route("/flags/active", get(flags_endpoint::flags))
        .route("/flags/check", get(flags_endpoint::check))
        .layer(ConcurrencyLimitLayer::new(config.max_concurrency));

    // operator-facing CRUD
    let admin_router = Router::new()
        .route(
            "/admin/flags",
            get(admin_endpoint::list_flags).post(admin_endpoint::create_flag),
        )
        .route(
            "/admin/flags/:key",
            get(admin_endpoint::get_flag)
                .put(admin_endpoint::update_flag)
                .delete(admin_endpoint::delete_flag),
        )
        .route(
            "/admin/flags/:key/overrides",
            get(admin_endpoint::list_overrides),
        )
        .route("/admin/overrides", post(admin_endpoint::create_override))
        .route(
            "/admin/overrides/:id/deactivate",
            post(admin_endpoint::deactivate_override),
        );

    Router::new()
        .merge(status_router)
        .merge(flags_router)
        .merge(admin_router)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn readiness(store: SharedFlagStore) -> Result<&'static str, FlagError> {
    store.ping().await?;
    Ok("ready")
}

pub async fn index() -> &'static str {
    "studiosync-flags"
}
