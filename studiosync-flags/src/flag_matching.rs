use uuid::Uuid;

use crate::{
    api::{EvaluatedFlag, FlagError},
    flag_definitions::{FeatureFlag, FlagScope, FlagValue},
    flag_request::Subject,
    flag_store::SharedFlagStore,
};

/// This function takes a flag key and a subject id and returns a bucket
/// between 1 and 100. Given the same key and subject, it'll always return the
/// same bucket. Buckets are uniformly distributed, so if we want to show a
/// feature to 20% of subjects we can check `bucket <= 20`, and raising the
/// percentage only ever adds subjects without reshuffling the existing ones.
pub fn rollout_bucket(flag_key: &str, subject_id: &str) -> i32 {
    let digest = md5::compute(format!("{}:{}", flag_key, subject_id).as_bytes());
    // Reduce the 128-bit digest as a big-endian integer modulo 100.
    let remainder = digest
        .0
        .iter()
        .fold(0u64, |acc, &byte| (acc * 256 + u64::from(byte)) % 100);
    remainder as i32 + 1
}

/// Whether the subject falls inside the flag's rollout percentage. Subject
/// uuids are hashed in canonical lowercase-hyphenated form.
pub fn check_rollout(flag: &FeatureFlag, subject_id: Uuid) -> bool {
    flag.rollout_percentage >= 100
        || rollout_bucket(&flag.key, &subject_id.to_string()) <= i32::from(flag.rollout_percentage)
}

/// Evaluates flags for one subject. Holds the subject and a store handle;
/// evaluation itself is a pure read with no side effects.
pub struct FlagMatcher {
    pub subject: Subject,
    store: SharedFlagStore,
}

impl FlagMatcher {
    pub fn new(subject: Subject, store: SharedFlagStore) -> Self {
        FlagMatcher { subject, store }
    }

    /// Evaluation order, short-circuiting on the first rule that applies:
    /// inactive flag, subject override, role gate, rollout bucket, base value.
    pub async fn evaluate(&self, flag: &FeatureFlag) -> Result<FlagValue, FlagError> {
        if !flag.is_active {
            return Ok(flag.disabled_value());
        }

        if let Some(subject_override) = self
            .store
            .get_subject_override(flag, self.subject.id)
            .await?
        {
            return Ok(subject_override.value);
        }

        if !self.matches_role_scope(flag) {
            return Ok(flag.disabled_value());
        }

        if !check_rollout(flag, self.subject.id) {
            return Ok(flag.disabled_value());
        }

        Ok(flag.base_value.clone())
    }

    // Only role scope gates. Studio-scoped flags declare target_studios but
    // evaluation does not filter on them.
    fn matches_role_scope(&self, flag: &FeatureFlag) -> bool {
        match flag.scope {
            FlagScope::Role => flag
                .target_roles
                .iter()
                .any(|role| role == &self.subject.role),
            _ => true,
        }
    }

    /// One `{key, value}` entry per active flag, in the store's stable
    /// (category, name) order.
    pub async fn evaluate_all(&self) -> Result<Vec<EvaluatedFlag>, FlagError> {
        let flags = self.store.get_active_flags().await?;

        let mut evaluated = Vec::with_capacity(flags.len());
        for flag in &flags {
            let value = self.evaluate(flag).await?;
            evaluated.push(EvaluatedFlag {
                key: flag.key.clone(),
                value,
            });
        }
        Ok(evaluated)
    }

    /// Single-flag check. An unknown key or an inactive flag answers boolean
    /// false; asking about something that does not exist is not an error.
    pub async fn check(&self, key: &str) -> Result<FlagValue, FlagError> {
        let flag = match self.store.get_flag(key).await {
            Ok(flag) => flag,
            Err(FlagError::FlagNotFound(_)) => return Ok(FlagValue::Boolean(false)),
            Err(e) => return Err(e),
        };

        if !flag.is_active {
            return Ok(FlagValue::Boolean(false));
        }

        self.evaluate(&flag).await
    }
}
