use crate::{
    api::{FlagCheckResponse, FlagError, FlagsResponse},
    request_handler::{process_check_request, process_flags_request, RequestContext},
    router,
};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::{debug_handler, Json};
use serde::Deserialize;

#[derive(Deserialize, Default)]
pub struct CheckQueryParams {
    pub key: Option<String>,
}

/// Active flag listing for the calling subject.
#[debug_handler]
pub async fn flags(
    state: State<router::State>,
    headers: HeaderMap,
) -> Result<Json<FlagsResponse>, FlagError> {
    let context = RequestContext { state, headers };
    Ok(Json(process_flags_request(context).await?))
}

/// Single-flag check. Rejects requests without a `key` query parameter.
// No `#[debug_handler]` here: axum-macros 0.4 generates a helper fn named
// `check` that collides with a handler of the same name.
pub async fn check(
    state: State<router::State>,
    Query(params): Query<CheckQueryParams>,
    headers: HeaderMap,
) -> Result<Json<FlagCheckResponse>, FlagError> {
    let key = params
        .key
        .filter(|key| !key.is_empty())
        .ok_or(FlagError::MissingFlagKey)?;

    let context = RequestContext { state, headers };
    Ok(Json(process_check_request(context, &key).await?))
}
