use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

use crate::api::FlagError;

pub const MAX_FLAG_KEY_LENGTH: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Boolean,
    String,
    Number,
    Json,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Boolean => "boolean",
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Json => "json",
        }
    }
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boolean" => Ok(ValueType::Boolean),
            "string" => Ok(ValueType::String),
            "number" => Ok(ValueType::Number),
            "json" => Ok(ValueType::Json),
            _ => Err(format!("unknown value type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagScope {
    Global,
    Studio,
    User,
    Role,
}

impl FlagScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagScope::Global => "global",
            FlagScope::Studio => "studio",
            FlagScope::User => "user",
            FlagScope::Role => "role",
        }
    }
}

impl FromStr for FlagScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(FlagScope::Global),
            "studio" => Ok(FlagScope::Studio),
            "user" => Ok(FlagScope::User),
            "role" => Ok(FlagScope::Role),
            _ => Err(format!("unknown flag scope: {}", s)),
        }
    }
}

/// A typed flag value. One variant per value type, so a flag can never hand
/// out a value of the wrong type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Boolean(bool),
    String(String),
    Number(f64),
    Json(Value),
}

impl FlagValue {
    /// The value an excluded or gated-out subject receives for a flag of the
    /// given type: false, the empty string, zero, or the empty object.
    pub fn disabled(value_type: ValueType) -> FlagValue {
        match value_type {
            ValueType::Boolean => FlagValue::Boolean(false),
            ValueType::String => FlagValue::String(String::new()),
            ValueType::Number => FlagValue::Number(0.0),
            ValueType::Json => FlagValue::Json(Value::Object(serde_json::Map::new())),
        }
    }

    pub fn matches_type(&self, value_type: ValueType) -> bool {
        matches!(
            (self, value_type),
            (FlagValue::Boolean(_), ValueType::Boolean)
                | (FlagValue::String(_), ValueType::String)
                | (FlagValue::Number(_), ValueType::Number)
                | (FlagValue::Json(_), ValueType::Json)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub id: Uuid,
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    pub value_type: ValueType,
    pub base_value: FlagValue,
    pub scope: FlagScope,
    #[serde(default)]
    pub target_roles: Vec<String>,
    #[serde(default)]
    pub target_studios: Vec<Uuid>,
    pub rollout_percentage: i16,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FeatureFlag {
    pub fn disabled_value(&self) -> FlagValue {
        FlagValue::disabled(self.value_type)
    }
}

/// Storage representation: one nullable slot per value type, discriminated by
/// the `value_type` column. Only the slot matching the discriminator is ever
/// read back.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeatureFlagRow {
    pub id: Uuid,
    pub key: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub value_type: String,
    pub value_boolean: Option<bool>,
    pub value_string: String,
    pub value_number: Option<f64>,
    pub value_json: Value,
    pub scope: String,
    pub target_roles: Vec<String>,
    pub target_studios: Vec<Uuid>,
    pub rollout_percentage: i16,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn value_from_slots(
    value_type: ValueType,
    value_boolean: Option<bool>,
    value_string: String,
    value_number: Option<f64>,
    value_json: Value,
) -> FlagValue {
    match value_type {
        ValueType::Boolean => FlagValue::Boolean(value_boolean.unwrap_or(false)),
        ValueType::String => FlagValue::String(value_string),
        ValueType::Number => FlagValue::Number(value_number.unwrap_or(0.0)),
        ValueType::Json => FlagValue::Json(value_json),
    }
}

/// Inverse of `value_from_slots`: spreads a typed value across the four
/// storage slots, leaving the unused ones at their column defaults.
pub(crate) fn slots_from_value(value: &FlagValue) -> (Option<bool>, String, Option<f64>, Value) {
    let empty_json = Value::Object(serde_json::Map::new());
    match value {
        FlagValue::Boolean(b) => (Some(*b), String::new(), None, empty_json),
        FlagValue::String(s) => (None, s.clone(), None, empty_json),
        FlagValue::Number(n) => (None, String::new(), Some(*n), empty_json),
        FlagValue::Json(j) => (None, String::new(), None, j.clone()),
    }
}

impl TryFrom<FeatureFlagRow> for FeatureFlag {
    type Error = FlagError;

    fn try_from(row: FeatureFlagRow) -> Result<Self, Self::Error> {
        let value_type = ValueType::from_str(&row.value_type).map_err(|e| {
            tracing::error!("failed to parse flag row {}: {}", row.key, e);
            FlagError::DataParsingError
        })?;
        let scope = FlagScope::from_str(&row.scope).map_err(|e| {
            tracing::error!("failed to parse flag row {}: {}", row.key, e);
            FlagError::DataParsingError
        })?;
        let base_value = value_from_slots(
            value_type,
            row.value_boolean,
            row.value_string,
            row.value_number,
            row.value_json,
        );

        Ok(FeatureFlag {
            id: row.id,
            key: row.key,
            name: row.name,
            description: row.description,
            category: row.category,
            value_type,
            base_value,
            scope,
            target_roles: row.target_roles,
            target_studios: row.target_studios,
            rollout_percentage: row.rollout_percentage,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub fn validate_flag_key(key: &str) -> Result<(), FlagError> {
    if key.is_empty() {
        return Err(FlagError::Validation {
            field: "key",
            message: "key must not be empty".to_string(),
        });
    }
    if key.len() > MAX_FLAG_KEY_LENGTH {
        return Err(FlagError::Validation {
            field: "key",
            message: format!("key must be at most {} characters", MAX_FLAG_KEY_LENGTH),
        });
    }
    Ok(())
}

pub fn validate_rollout_percentage(rollout_percentage: i16) -> Result<(), FlagError> {
    if !(0..=100).contains(&rollout_percentage) {
        return Err(FlagError::Validation {
            field: "rollout_percentage",
            message: "rollout_percentage must be between 0 and 100".to_string(),
        });
    }
    Ok(())
}

pub fn validate_base_value(base_value: &FlagValue, value_type: ValueType) -> Result<(), FlagError> {
    if !base_value.matches_type(value_type) {
        return Err(FlagError::Validation {
            field: "base_value",
            message: format!("base_value does not match value_type {}", value_type.as_str()),
        });
    }
    Ok(())
}
