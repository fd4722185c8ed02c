use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::PgPool;
use tokio::time::timeout;
use tracing::instrument;
use uuid::Uuid;

use crate::api::FlagError;
use crate::database::{is_foreign_key_violation, is_unique_violation, CustomDatabaseError};
use crate::flag_definitions::{
    slots_from_value, validate_base_value, validate_flag_key, validate_rollout_percentage,
    FeatureFlag, FeatureFlagRow, FlagScope, FlagValue, ValueType,
};
use crate::flag_overrides::{
    validate_override_target, FlagOverride, FlagOverrideRow, FlagOverrideWithTypeRow,
};

const DATABASE_TIMEOUT_MILLISECS: u64 = 1000;

const FLAG_COLUMNS: &str = "id, key, name, description, category, value_type, value_boolean, value_string, value_number, value_json, scope, target_roles, target_studios, rollout_percentage, is_active, created_at, updated_at";
const OVERRIDE_COLUMNS: &str = "id, flag_id, subject_id, studio_id, value_boolean, value_string, value_number, value_json, is_active, created_at, updated_at";
// OVERRIDE_COLUMNS qualified for statements that join the parent flag.
const OVERRIDE_JOIN_COLUMNS: &str = "o.id, o.flag_id, o.subject_id, o.studio_id, o.value_boolean, o.value_string, o.value_number, o.value_json, o.is_active, o.created_at, o.updated_at";

pub type SharedFlagStore = Arc<dyn FlagStore + Send + Sync>;

/// Persistence seam for flags and overrides. The server wires up the
/// Postgres implementation; tests substitute an in-memory double.
#[async_trait]
pub trait FlagStore {
    async fn get_active_flags(&self) -> Result<Vec<FeatureFlag>, FlagError>;
    async fn get_flag(&self, key: &str) -> Result<FeatureFlag, FlagError>;
    async fn list_flags(&self) -> Result<Vec<FeatureFlag>, FlagError>;
    async fn create_flag(&self, new_flag: NewFlag) -> Result<FeatureFlag, FlagError>;
    async fn update_flag(&self, key: &str, update: FlagUpdate) -> Result<FeatureFlag, FlagError>;
    async fn delete_flag(&self, key: &str) -> Result<(), FlagError>;
    async fn create_override(&self, new_override: NewOverride) -> Result<FlagOverride, FlagError>;
    async fn deactivate_override(&self, id: Uuid) -> Result<FlagOverride, FlagError>;
    async fn get_subject_override(
        &self,
        flag: &FeatureFlag,
        subject_id: Uuid,
    ) -> Result<Option<FlagOverride>, FlagError>;
    async fn list_overrides(&self, flag_key: &str) -> Result<Vec<FlagOverride>, FlagError>;
    async fn ping(&self) -> Result<(), FlagError>;
}

fn default_scope() -> FlagScope {
    FlagScope::Global
}

fn default_rollout_percentage() -> i16 {
    100
}

fn default_is_active() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewFlag {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    pub value_type: ValueType,
    pub base_value: FlagValue,
    #[serde(default = "default_scope")]
    pub scope: FlagScope,
    #[serde(default)]
    pub target_roles: Vec<String>,
    #[serde(default)]
    pub target_studios: Vec<Uuid>,
    #[serde(default = "default_rollout_percentage")]
    pub rollout_percentage: i16,
    #[serde(default = "default_is_active")]
    pub is_active: bool,
}

/// Partial update; absent fields keep their stored value. `key` is not
/// updatable at all, and `value_type` may only be restated, never changed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlagUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub value_type: Option<ValueType>,
    pub base_value: Option<FlagValue>,
    pub scope: Option<FlagScope>,
    pub target_roles: Option<Vec<String>>,
    pub target_studios: Option<Vec<Uuid>>,
    pub rollout_percentage: Option<i16>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewOverride {
    pub flag_key: String,
    #[serde(default)]
    pub subject_id: Option<Uuid>,
    #[serde(default)]
    pub studio_id: Option<Uuid>,
    pub value: FlagValue,
}

pub fn validate_new_flag(new_flag: &NewFlag) -> Result<(), FlagError> {
    validate_flag_key(&new_flag.key)?;
    validate_rollout_percentage(new_flag.rollout_percentage)?;
    validate_base_value(&new_flag.base_value, new_flag.value_type)?;
    Ok(())
}

pub fn validate_flag_update(update: &FlagUpdate, existing: &FeatureFlag) -> Result<(), FlagError> {
    if let Some(value_type) = update.value_type {
        if value_type != existing.value_type {
            return Err(FlagError::Validation {
                field: "value_type",
                message: "value_type is immutable once a flag exists".to_string(),
            });
        }
    }
    if let Some(rollout_percentage) = update.rollout_percentage {
        validate_rollout_percentage(rollout_percentage)?;
    }
    if let Some(ref base_value) = update.base_value {
        validate_base_value(base_value, existing.value_type)?;
    }
    Ok(())
}

pub fn validate_new_override(
    new_override: &NewOverride,
    flag: &FeatureFlag,
) -> Result<(), FlagError> {
    validate_override_target(new_override.subject_id, new_override.studio_id)?;
    if !new_override.value.matches_type(flag.value_type) {
        return Err(FlagError::Validation {
            field: "value",
            message: format!(
                "value does not match flag value_type {}",
                flag.value_type.as_str()
            ),
        });
    }
    Ok(())
}

pub fn merged_flag(existing: FeatureFlag, update: FlagUpdate) -> FeatureFlag {
    FeatureFlag {
        id: existing.id,
        key: existing.key,
        name: update.name.unwrap_or(existing.name),
        description: update.description.unwrap_or(existing.description),
        category: update.category.unwrap_or(existing.category),
        value_type: existing.value_type,
        base_value: update.base_value.unwrap_or(existing.base_value),
        scope: update.scope.unwrap_or(existing.scope),
        target_roles: update.target_roles.unwrap_or(existing.target_roles),
        target_studios: update.target_studios.unwrap_or(existing.target_studios),
        rollout_percentage: update
            .rollout_percentage
            .unwrap_or(existing.rollout_percentage),
        is_active: update.is_active.unwrap_or(existing.is_active),
        created_at: existing.created_at,
        updated_at: existing.updated_at,
    }
}

pub(crate) fn target_description(new_override: &NewOverride) -> String {
    match (new_override.subject_id, new_override.studio_id) {
        (Some(subject_id), _) => format!("subject {}", subject_id),
        (_, Some(studio_id)) => format!("studio {}", studio_id),
        _ => "unknown target".to_string(),
    }
}

async fn with_timeout<T>(
    fut: impl std::future::Future<Output = Result<T, sqlx::Error>>,
) -> Result<T, CustomDatabaseError> {
    let result = timeout(Duration::from_millis(DATABASE_TIMEOUT_MILLISECS), fut).await??;
    Ok(result)
}

pub struct PostgresFlagStore {
    pool: PgPool,
}

impl PostgresFlagStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn flags_from_rows(rows: Vec<FeatureFlagRow>) -> Vec<FeatureFlag> {
        // Malformed rows are dropped rather than failing the whole read; an
        // absent flag evaluates as disabled downstream.
        rows.into_iter()
            .filter_map(|row| FeatureFlag::try_from(row).ok())
            .collect()
    }
}

#[async_trait]
impl FlagStore for PostgresFlagStore {
    #[instrument(skip_all)]
    async fn get_active_flags(&self) -> Result<Vec<FeatureFlag>, FlagError> {
        let query = format!(
            "SELECT {FLAG_COLUMNS} FROM feature_flags WHERE is_active = TRUE ORDER BY category, name"
        );
        let rows = with_timeout(
            sqlx::query_as::<_, FeatureFlagRow>(&query).fetch_all(&self.pool),
        )
        .await?;

        Ok(Self::flags_from_rows(rows))
    }

    #[instrument(skip_all)]
    async fn get_flag(&self, key: &str) -> Result<FeatureFlag, FlagError> {
        let query = format!("SELECT {FLAG_COLUMNS} FROM feature_flags WHERE key = $1");
        let row = with_timeout(
            sqlx::query_as::<_, FeatureFlagRow>(&query)
                .bind(key)
                .fetch_optional(&self.pool),
        )
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(FlagError::FlagNotFound(key.to_string())),
        }
    }

    async fn list_flags(&self) -> Result<Vec<FeatureFlag>, FlagError> {
        let query = format!("SELECT {FLAG_COLUMNS} FROM feature_flags ORDER BY category, name");
        let rows = with_timeout(
            sqlx::query_as::<_, FeatureFlagRow>(&query).fetch_all(&self.pool),
        )
        .await?;

        Ok(Self::flags_from_rows(rows))
    }

    async fn create_flag(&self, new_flag: NewFlag) -> Result<FeatureFlag, FlagError> {
        validate_new_flag(&new_flag)?;

        let (value_boolean, value_string, value_number, value_json) =
            slots_from_value(&new_flag.base_value);
        let query = format!(
            "INSERT INTO feature_flags (id, key, name, description, category, value_type, value_boolean, value_string, value_number, value_json, scope, target_roles, target_studios, rollout_percentage, is_active) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) RETURNING {FLAG_COLUMNS}"
        );
        let result = with_timeout(
            sqlx::query_as::<_, FeatureFlagRow>(&query)
                .bind(Uuid::now_v7())
                .bind(&new_flag.key)
                .bind(&new_flag.name)
                .bind(&new_flag.description)
                .bind(&new_flag.category)
                .bind(new_flag.value_type.as_str())
                .bind(value_boolean)
                .bind(value_string)
                .bind(value_number)
                .bind(value_json)
                .bind(new_flag.scope.as_str())
                .bind(&new_flag.target_roles)
                .bind(&new_flag.target_studios)
                .bind(new_flag.rollout_percentage)
                .bind(new_flag.is_active)
                .fetch_one(&self.pool),
        )
        .await;

        match result {
            Ok(row) => row.try_into(),
            Err(CustomDatabaseError::Other(e)) if is_unique_violation(&e) => {
                Err(FlagError::Validation {
                    field: "key",
                    message: format!("a flag with key {} already exists", new_flag.key),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_flag(&self, key: &str, update: FlagUpdate) -> Result<FeatureFlag, FlagError> {
        let existing = self.get_flag(key).await?;
        validate_flag_update(&update, &existing)?;
        let merged = merged_flag(existing, update);

        let (value_boolean, value_string, value_number, value_json) =
            slots_from_value(&merged.base_value);
        let query = format!(
            "UPDATE feature_flags SET name = $2, description = $3, category = $4, value_boolean = $5, value_string = $6, value_number = $7, value_json = $8, scope = $9, target_roles = $10, target_studios = $11, rollout_percentage = $12, is_active = $13, updated_at = NOW() WHERE key = $1 RETURNING {FLAG_COLUMNS}"
        );
        let row = with_timeout(
            sqlx::query_as::<_, FeatureFlagRow>(&query)
                .bind(key)
                .bind(&merged.name)
                .bind(&merged.description)
                .bind(&merged.category)
                .bind(value_boolean)
                .bind(value_string)
                .bind(value_number)
                .bind(value_json)
                .bind(merged.scope.as_str())
                .bind(&merged.target_roles)
                .bind(&merged.target_studios)
                .bind(merged.rollout_percentage)
                .bind(merged.is_active)
                .fetch_optional(&self.pool),
        )
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(FlagError::FlagNotFound(key.to_string())),
        }
    }

    async fn delete_flag(&self, key: &str) -> Result<(), FlagError> {
        let result = with_timeout(
            sqlx::query("DELETE FROM feature_flags WHERE key = $1")
                .bind(key)
                .execute(&self.pool),
        )
        .await?;

        if result.rows_affected() == 0 {
            return Err(FlagError::FlagNotFound(key.to_string()));
        }
        Ok(())
    }

    async fn create_override(&self, new_override: NewOverride) -> Result<FlagOverride, FlagError> {
        let flag = self.get_flag(&new_override.flag_key).await?;
        validate_new_override(&new_override, &flag)?;

        let (value_boolean, value_string, value_number, value_json) =
            slots_from_value(&new_override.value);
        let query = format!(
            "INSERT INTO feature_flag_overrides (id, flag_id, subject_id, studio_id, value_boolean, value_string, value_number, value_json) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {OVERRIDE_COLUMNS}"
        );
        let result = with_timeout(
            sqlx::query_as::<_, FlagOverrideRow>(&query)
                .bind(Uuid::now_v7())
                .bind(flag.id)
                .bind(new_override.subject_id)
                .bind(new_override.studio_id)
                .bind(value_boolean)
                .bind(value_string)
                .bind(value_number)
                .bind(value_json)
                .fetch_one(&self.pool),
        )
        .await;

        match result {
            Ok(row) => row.into_override(flag.value_type),
            Err(CustomDatabaseError::Other(e)) if is_unique_violation(&e) => Err(
                FlagError::DuplicateOverride(target_description(&new_override)),
            ),
            Err(CustomDatabaseError::Other(e)) if is_foreign_key_violation(&e) => {
                Err(FlagError::FlagNotFound(new_override.flag_key))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn deactivate_override(&self, id: Uuid) -> Result<FlagOverride, FlagError> {
        // The parent flag's value_type is fetched in the same statement.
        // Deleting a flag cascades its overrides, so a concurrently removed
        // parent reads as no row here, never as a half-updated override.
        let query = format!(
            "UPDATE feature_flag_overrides o SET is_active = FALSE, updated_at = NOW() FROM feature_flags f WHERE o.id = $1 AND f.id = o.flag_id RETURNING {OVERRIDE_JOIN_COLUMNS}, f.value_type"
        );
        let row = with_timeout(
            sqlx::query_as::<_, FlagOverrideWithTypeRow>(&query)
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?;

        match row {
            Some(row) => row.into_override(),
            None => Err(FlagError::OverrideNotFound(id)),
        }
    }

    async fn get_subject_override(
        &self,
        flag: &FeatureFlag,
        subject_id: Uuid,
    ) -> Result<Option<FlagOverride>, FlagError> {
        let query = format!(
            "SELECT {OVERRIDE_COLUMNS} FROM feature_flag_overrides WHERE flag_id = $1 AND subject_id = $2 AND is_active = TRUE"
        );
        let row = with_timeout(
            sqlx::query_as::<_, FlagOverrideRow>(&query)
                .bind(flag.id)
                .bind(subject_id)
                .fetch_optional(&self.pool),
        )
        .await?;

        // A corrupt override degrades to "no override" on the read path.
        Ok(row.and_then(|row| row.into_override(flag.value_type).ok()))
    }

    async fn list_overrides(&self, flag_key: &str) -> Result<Vec<FlagOverride>, FlagError> {
        let flag = self.get_flag(flag_key).await?;

        let query = format!(
            "SELECT {OVERRIDE_COLUMNS} FROM feature_flag_overrides WHERE flag_id = $1 ORDER BY created_at"
        );
        let rows = with_timeout(
            sqlx::query_as::<_, FlagOverrideRow>(&query)
                .bind(flag.id)
                .fetch_all(&self.pool),
        )
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_override(flag.value_type).ok())
            .collect())
    }

    async fn ping(&self) -> Result<(), FlagError> {
        with_timeout(sqlx::query("SELECT 1").execute(&self.pool)).await?;
        Ok(())
    }
}
