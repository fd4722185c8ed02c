use axum::http::HeaderMap;
use uuid::Uuid;

use crate::api::FlagError;

pub const SUBJECT_ID_HEADER: &str = "X-Subject-Id";
pub const SUBJECT_ROLE_HEADER: &str = "X-Subject-Role";
pub const STUDIO_ID_HEADER: &str = "X-Studio-Id";

/// Caller identity for the read endpoints, taken from request headers. The
/// gateway in front of this service authenticates the caller and forwards the
/// identity; this service only validates the shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: Uuid,
    pub role: String,
    pub studio_id: Option<Uuid>,
}

impl Subject {
    /// Reads the subject from the identity headers.
    /// `X-Subject-Id` must be a uuid and `X-Subject-Role` must be non-empty.
    /// `X-Studio-Id` is optional, but must be a uuid when present.
    pub fn from_headers(headers: &HeaderMap) -> Result<Subject, FlagError> {
        let raw_id = headers
            .get(SUBJECT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(FlagError::MissingSubjectId)?;
        let id = Uuid::parse_str(raw_id).map_err(|_| FlagError::InvalidSubjectId)?;

        let role = headers
            .get(SUBJECT_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(FlagError::MissingSubjectRole)?
            .to_string();

        // An empty studio header reads the same as an absent one.
        let studio_id = headers
            .get(STUDIO_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|raw| Uuid::parse_str(raw).map_err(|_| FlagError::InvalidStudioId))
            .transpose()?;

        Ok(Subject {
            id,
            role,
            studio_id,
        })
    }
}
