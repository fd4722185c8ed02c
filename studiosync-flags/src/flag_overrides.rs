use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::api::FlagError;
use crate::flag_definitions::{value_from_slots, FlagValue, ValueType};

/// A manually-assigned value for one subject or one studio. Exactly one of
/// the two targets is set; the database enforces this with a check constraint
/// and per-target unique indexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagOverride {
    pub id: Uuid,
    pub flag_id: Uuid,
    pub subject_id: Option<Uuid>,
    pub studio_id: Option<Uuid>,
    pub value: FlagValue,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FlagOverrideRow {
    pub id: Uuid,
    pub flag_id: Uuid,
    pub subject_id: Option<Uuid>,
    pub studio_id: Option<Uuid>,
    pub value_boolean: Option<bool>,
    pub value_string: String,
    pub value_number: Option<f64>,
    pub value_json: Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlagOverrideRow {
    /// The override slots are typed by the owning flag, so conversion needs
    /// the flag's value type to know which slot to read.
    pub fn into_override(self, value_type: ValueType) -> Result<FlagOverride, FlagError> {
        if self.subject_id.is_some() == self.studio_id.is_some() {
            tracing::error!("override row {} does not target exactly one of subject or studio", self.id);
            return Err(FlagError::DataParsingError);
        }

        let value = value_from_slots(
            value_type,
            self.value_boolean,
            self.value_string,
            self.value_number,
            self.value_json,
        );

        Ok(FlagOverride {
            id: self.id,
            flag_id: self.flag_id,
            subject_id: self.subject_id,
            studio_id: self.studio_id,
            value,
            is_active: self.is_active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// An override row joined with the owning flag's `value_type`, for statements
/// that touch an override and need its typed value in one round trip.
#[derive(Debug, sqlx::FromRow)]
pub struct FlagOverrideWithTypeRow {
    #[sqlx(flatten)]
    pub row: FlagOverrideRow,
    pub value_type: String,
}

impl FlagOverrideWithTypeRow {
    pub fn into_override(self) -> Result<FlagOverride, FlagError> {
        let value_type = self
            .value_type
            .parse::<ValueType>()
            .map_err(|_| FlagError::DataParsingError)?;
        self.row.into_override(value_type)
    }
}

pub fn validate_override_target(
    subject_id: Option<Uuid>,
    studio_id: Option<Uuid>,
) -> Result<(), FlagError> {
    match (subject_id, studio_id) {
        (Some(_), Some(_)) => Err(FlagError::Validation {
            field: "target",
            message: "override cannot target both a subject and a studio".to_string(),
        }),
        (None, None) => Err(FlagError::Validation {
            field: "target",
            message: "override must target either a subject or a studio".to_string(),
        }),
        _ => Ok(()),
    }
}
