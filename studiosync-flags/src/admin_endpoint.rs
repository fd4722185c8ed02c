//! Operator-facing CRUD over flags and overrides. Handlers stay thin; all
//! validation lives in the flag store so every caller goes through it.

use crate::{
    api::{FlagError, FlagSummary},
    flag_definitions::FeatureFlag,
    flag_overrides::FlagOverride,
    flag_store::{FlagUpdate, NewFlag, NewOverride},
    router,
};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use bytes::Bytes;
use uuid::Uuid;

/// Summary listing of every flag, active or not, in (category, name) order.
pub async fn list_flags(state: State<router::State>) -> Result<Json<Vec<FlagSummary>>, FlagError> {
    let flags = state.store.list_flags().await?;
    Ok(Json(flags.into_iter().map(FlagSummary::from).collect()))
}

pub async fn create_flag(
    state: State<router::State>,
    body: Bytes,
) -> Result<(StatusCode, Json<FeatureFlag>), FlagError> {
    let new_flag: NewFlag = serde_json::from_slice(&body)?;
    let flag = state.store.create_flag(new_flag).await?;
    Ok((StatusCode::CREATED, Json(flag)))
}

pub async fn get_flag(
    state: State<router::State>,
    Path(key): Path<String>,
) -> Result<Json<FeatureFlag>, FlagError> {
    Ok(Json(state.store.get_flag(&key).await?))
}

pub async fn update_flag(
    state: State<router::State>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Json<FeatureFlag>, FlagError> {
    let update: FlagUpdate = serde_json::from_slice(&body)?;
    Ok(Json(state.store.update_flag(&key, update).await?))
}

/// Hard delete. Overrides cascade away with the flag.
pub async fn delete_flag(
    state: State<router::State>,
    Path(key): Path<String>,
) -> Result<StatusCode, FlagError> {
    state.store.delete_flag(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_overrides(
    state: State<router::State>,
    Path(key): Path<String>,
) -> Result<Json<Vec<FlagOverride>>, FlagError> {
    Ok(Json(state.store.list_overrides(&key).await?))
}

pub async fn create_override(
    state: State<router::State>,
    body: Bytes,
) -> Result<(StatusCode, Json<FlagOverride>), FlagError> {
    let new_override: NewOverride = serde_json::from_slice(&body)?;
    let flag_override = state.store.create_override(new_override).await?;
    Ok((StatusCode::CREATED, Json(flag_override)))
}

/// Soft delete. The row stays behind and keeps blocking re-creation of an
/// override for the same target.
pub async fn deactivate_override(
    state: State<router::State>,
    Path(id): Path<Uuid>,
) -> Result<Json<FlagOverride>, FlagError> {
    Ok(Json(state.store.deactivate_override(id).await?))
}
