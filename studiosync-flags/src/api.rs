use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::database::CustomDatabaseError;
use crate::flag_definitions::{FeatureFlag, FlagValue, ValueType};

/// One evaluated flag for one subject.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EvaluatedFlag {
    pub key: String,
    pub value: FlagValue,
}

/// Full evaluated flag set for one subject, in stable (category, name) order.
#[derive(Debug, PartialEq, Deserialize, Serialize)]
pub struct FlagsResponse {
    pub flags: Vec<EvaluatedFlag>,
}

#[derive(Debug, PartialEq, Deserialize, Serialize)]
pub struct FlagCheckResponse {
    pub key: String,
    pub enabled: FlagValue,
}

/// Summary row for the admin flag listing. The full flag body stays behind the
/// detail endpoint; `value` is the flag's typed base value.
#[derive(Debug, PartialEq, Deserialize, Serialize)]
pub struct FlagSummary {
    pub id: Uuid,
    pub key: String,
    pub name: String,
    pub value_type: ValueType,
    pub value: FlagValue,
    pub category: String,
    pub is_active: bool,
}

impl From<FeatureFlag> for FlagSummary {
    fn from(flag: FeatureFlag) -> Self {
        FlagSummary {
            id: flag.id,
            key: flag.key,
            name: flag.name,
            value_type: flag.value_type,
            value: flag.base_value,
            category: flag.category,
            is_active: flag.is_active,
        }
    }
}

#[derive(Error, Debug)]
pub enum FlagError {
    #[error("failed to decode request: {0}")]
    RequestDecodingError(String),
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),

    #[error("No subject id in request")]
    MissingSubjectId,
    #[error("Invalid subject id in request")]
    InvalidSubjectId,
    #[error("No subject role in request")]
    MissingSubjectRole,
    #[error("Invalid studio id in request")]
    InvalidStudioId,
    #[error("key parameter required")]
    MissingFlagKey,

    #[error("{message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    #[error("flag not found: {0}")]
    FlagNotFound(String),
    #[error("override not found: {0}")]
    OverrideNotFound(Uuid),
    #[error("an override already exists for {0}")]
    DuplicateOverride(String),

    #[error("failed to parse stored flag data")]
    DataParsingError,
    #[error("database unavailable")]
    DatabaseUnavailable,
    #[error("Timed out while fetching data")]
    TimeoutError,
}

impl IntoResponse for FlagError {
    fn into_response(self) -> Response {
        match self {
            FlagError::Validation { field, ref message } => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": message, "field": field})),
            ),

            FlagError::RequestDecodingError(_)
            | FlagError::RequestParsingError(_)
            | FlagError::MissingSubjectId
            | FlagError::InvalidSubjectId
            | FlagError::MissingSubjectRole
            | FlagError::InvalidStudioId
            | FlagError::MissingFlagKey => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": self.to_string()})),
            ),

            FlagError::FlagNotFound(_) | FlagError::OverrideNotFound(_) => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": self.to_string()})),
            ),

            FlagError::DuplicateOverride(_) => (
                StatusCode::CONFLICT,
                Json(json!({"error": self.to_string()})),
            ),

            FlagError::DataParsingError
            | FlagError::DatabaseUnavailable
            | FlagError::TimeoutError => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": self.to_string()})),
            ),
        }
        .into_response()
    }
}

impl From<CustomDatabaseError> for FlagError {
    fn from(e: CustomDatabaseError) -> Self {
        match e {
            CustomDatabaseError::Other(_) => {
                tracing::error!("failed to query postgres: {}", e);
                FlagError::DatabaseUnavailable
            }
            CustomDatabaseError::Timeout(_) => FlagError::TimeoutError,
        }
    }
}

impl From<sqlx::Error> for FlagError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!("sqlx error: {}", e);
        FlagError::DatabaseUnavailable
    }
}
