use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use uuid::Uuid;

use crate::{
    api::FlagError,
    flag_definitions::FeatureFlag,
    flag_overrides::FlagOverride,
    flag_request::Subject,
    flag_store::{
        merged_flag, target_description, validate_flag_update, validate_new_flag,
        validate_new_override, FlagStore, FlagUpdate, NewFlag, NewOverride,
    },
};

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

pub fn test_subject(id: Uuid, role: &str) -> Subject {
    Subject {
        id,
        role: role.to_string(),
        studio_id: None,
    }
}

#[derive(Default)]
struct MemoryState {
    flags: Vec<FeatureFlag>,
    overrides: Vec<FlagOverride>,
}

/// In-process `FlagStore` used by unit tests and the integration harness.
/// Runs the same validation functions as the Postgres store and mirrors its
/// error mapping, so tests exercise identical write semantics without a
/// database. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryFlagStore {
    state: Arc<Mutex<MemoryState>>,
    override_lookups: Arc<AtomicU32>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many subject override lookups the store has served.
    pub fn override_lookups(&self) -> u32 {
        self.override_lookups.load(Ordering::SeqCst)
    }

    fn sorted(mut flags: Vec<FeatureFlag>) -> Vec<FeatureFlag> {
        flags.sort_by(|a, b| {
            (a.category.as_str(), a.name.as_str()).cmp(&(b.category.as_str(), b.name.as_str()))
        });
        flags
    }
}

#[async_trait]
impl FlagStore for MemoryFlagStore {
    async fn get_active_flags(&self) -> Result<Vec<FeatureFlag>, FlagError> {
        let state = self.state.lock().unwrap();
        Ok(Self::sorted(
            state
                .flags
                .iter()
                .filter(|flag| flag.is_active)
                .cloned()
                .collect(),
        ))
    }

    async fn get_flag(&self, key: &str) -> Result<FeatureFlag, FlagError> {
        let state = self.state.lock().unwrap();
        state
            .flags
            .iter()
            .find(|flag| flag.key == key)
            .cloned()
            .ok_or_else(|| FlagError::FlagNotFound(key.to_string()))
    }

    async fn list_flags(&self) -> Result<Vec<FeatureFlag>, FlagError> {
        let state = self.state.lock().unwrap();
        Ok(Self::sorted(state.flags.clone()))
    }

    async fn create_flag(&self, new_flag: NewFlag) -> Result<FeatureFlag, FlagError> {
        validate_new_flag(&new_flag)?;

        let mut state = self.state.lock().unwrap();
        if state.flags.iter().any(|flag| flag.key == new_flag.key) {
            return Err(FlagError::Validation {
                field: "key",
                message: format!("a flag with key {} already exists", new_flag.key),
            });
        }

        let now = Utc::now();
        let flag = FeatureFlag {
            id: Uuid::now_v7(),
            key: new_flag.key,
            name: new_flag.name,
            description: new_flag.description,
            category: new_flag.category,
            value_type: new_flag.value_type,
            base_value: new_flag.base_value,
            scope: new_flag.scope,
            target_roles: new_flag.target_roles,
            target_studios: new_flag.target_studios,
            rollout_percentage: new_flag.rollout_percentage,
            is_active: new_flag.is_active,
            created_at: now,
            updated_at: now,
        };
        state.flags.push(flag.clone());
        Ok(flag)
    }

    async fn update_flag(&self, key: &str, update: FlagUpdate) -> Result<FeatureFlag, FlagError> {
        let mut state = self.state.lock().unwrap();
        let Some(position) = state.flags.iter().position(|flag| flag.key == key) else {
            return Err(FlagError::FlagNotFound(key.to_string()));
        };

        let existing = state.flags[position].clone();
        validate_flag_update(&update, &existing)?;

        let mut merged = merged_flag(existing, update);
        merged.updated_at = Utc::now();
        state.flags[position] = merged.clone();
        Ok(merged)
    }

    async fn delete_flag(&self, key: &str) -> Result<(), FlagError> {
        let mut state = self.state.lock().unwrap();
        let Some(position) = state.flags.iter().position(|flag| flag.key == key) else {
            return Err(FlagError::FlagNotFound(key.to_string()));
        };

        let flag_id = state.flags.remove(position).id;
        // Overrides cascade away with the flag.
        state.overrides.retain(|o| o.flag_id != flag_id);
        Ok(())
    }

    async fn create_override(&self, new_override: NewOverride) -> Result<FlagOverride, FlagError> {
        let mut state = self.state.lock().unwrap();
        let Some(flag) = state
            .flags
            .iter()
            .find(|flag| flag.key == new_override.flag_key)
            .cloned()
        else {
            return Err(FlagError::FlagNotFound(new_override.flag_key));
        };
        validate_new_override(&new_override, &flag)?;

        // Uniqueness is keyed on (flag, target) alone, not on is_active,
        // matching the partial unique indexes in the schema.
        let duplicate = state.overrides.iter().any(|existing| {
            existing.flag_id == flag.id
                && ((new_override.subject_id.is_some()
                    && existing.subject_id == new_override.subject_id)
                    || (new_override.studio_id.is_some()
                        && existing.studio_id == new_override.studio_id))
        });
        if duplicate {
            return Err(FlagError::DuplicateOverride(target_description(
                &new_override,
            )));
        }

        let now = Utc::now();
        let flag_override = FlagOverride {
            id: Uuid::now_v7(),
            flag_id: flag.id,
            subject_id: new_override.subject_id,
            studio_id: new_override.studio_id,
            value: new_override.value,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        state.overrides.push(flag_override.clone());
        Ok(flag_override)
    }

    async fn deactivate_override(&self, id: Uuid) -> Result<FlagOverride, FlagError> {
        let mut state = self.state.lock().unwrap();
        let Some(flag_override) = state.overrides.iter_mut().find(|o| o.id == id) else {
            return Err(FlagError::OverrideNotFound(id));
        };

        flag_override.is_active = false;
        flag_override.updated_at = Utc::now();
        Ok(flag_override.clone())
    }

    async fn get_subject_override(
        &self,
        flag: &FeatureFlag,
        subject_id: Uuid,
    ) -> Result<Option<FlagOverride>, FlagError> {
        self.override_lookups.fetch_add(1, Ordering::SeqCst);

        let state = self.state.lock().unwrap();
        Ok(state
            .overrides
            .iter()
            .find(|o| o.flag_id == flag.id && o.subject_id == Some(subject_id) && o.is_active)
            .cloned())
    }

    async fn list_overrides(&self, flag_key: &str) -> Result<Vec<FlagOverride>, FlagError> {
        let state = self.state.lock().unwrap();
        let Some(flag) = state.flags.iter().find(|flag| flag.key == flag_key) else {
            return Err(FlagError::FlagNotFound(flag_key.to_string()));
        };

        let mut overrides: Vec<_> = state
            .overrides
            .iter()
            .filter(|o| o.flag_id == flag.id)
            .cloned()
            .collect();
        overrides.sort_by_key(|o| o.created_at);
        Ok(overrides)
    }

    async fn ping(&self) -> Result<(), FlagError> {
        Ok(())
    }
}
