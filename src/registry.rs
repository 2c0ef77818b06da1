use std::sync::Arc;

use dashmap::DashMap;

use crate::definition::TaskDefinition;
use crate::error::{TaskManagerError, TaskManagerResult};
use crate::model::TaskKey;

const MAX_KEY_LEN: usize = 64;

/// Concurrent map of registered task definitions.
#[derive(Default)]
pub(crate) struct Registry {
    definitions: DashMap<TaskKey, Arc<TaskDefinition>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            definitions: DashMap::new(),
        }
    }

    pub(crate) fn register(&self, key: impl Into<TaskKey>, mut def: TaskDefinition) -> TaskManagerResult<()> {
        let key = key.into();
        let char_len = key.chars().count();
        if char_len == 0 || char_len > MAX_KEY_LEN {
            return Err(TaskManagerError::Definition(format!(
                "task_key {key:?} must be 1-{MAX_KEY_LEN} characters"
            )));
        }
        def.validate()?;
        def.key = key.clone();
        if self.definitions.contains_key(&key) {
            return Err(TaskManagerError::Definition(format!(
                "task_key {key:?} already registered"
            )));
        }
        self.definitions.insert(key, Arc::new(def));
        Ok(())
    }

    pub(crate) fn get(&self, key: &str) -> TaskManagerResult<Arc<TaskDefinition>> {
        self.definitions
            .get(key)
            .map(|d| d.clone())
            .ok_or_else(|| TaskManagerError::KeyNotFound(key.to_string()))
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.definitions.contains_key(key)
    }

    /// Keys whose definitions opted into init-timeout sensitivity, used by
    /// the scanner to split its two claim queries.
    pub(crate) fn keys_by_sensitivity(&self, sensitive: bool) -> Vec<TaskKey> {
        self.definitions
            .iter()
            .filter(|e| e.value().init_timeout_sensitive == sensitive)
            .map(|e| e.key().clone())
            .collect()
    }

    pub(crate) fn builtin_definitions(&self) -> Vec<Arc<TaskDefinition>> {
        self.definitions
            .iter()
            .filter(|e| e.value().builtin)
            .map(|e| e.value().clone())
            .collect()
    }

    pub(crate) fn all_keys(&self) -> Vec<TaskKey> {
        self.definitions.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::TaskDefinitionBuilder;

    fn noop_def() -> TaskDefinition {
        TaskDefinitionBuilder::<serde_json::Value>::new()
            .build(|_ctx, _arg| async { Ok(()) })
    }

    #[test]
    fn register_rejects_duplicate_and_oversized_keys() {
        let registry = Registry::new();
        registry.register("t1", noop_def()).unwrap();
        assert!(registry.register("t1", noop_def()).is_err());
        assert!(registry.register("x".repeat(65), noop_def()).is_err());
        assert!(registry.register("", noop_def()).is_err());
    }

    #[test]
    fn register_counts_chars_not_bytes() {
        let registry = Registry::new();
        // 64 multibyte scalars, well over 64 bytes, must be accepted.
        assert!(registry.register("好".repeat(64), noop_def()).is_ok());
        assert!(registry.register("好".repeat(65), noop_def()).is_err());
    }

    #[test]
    fn contains_and_all_keys_reflect_registrations() {
        let registry = Registry::new();
        registry.register("t1", noop_def()).unwrap();
        registry.register("t2", noop_def()).unwrap();
        assert!(registry.contains("t1"));
        assert!(!registry.contains("t3"));
        let mut keys = registry.all_keys();
        keys.sort();
        assert_eq!(keys, vec!["t1".to_string(), "t2".to_string()]);
    }

    #[test]
    fn keys_by_sensitivity_partitions_correctly() {
        let registry = Registry::new();
        registry
            .register(
                "sensitive",
                TaskDefinitionBuilder::<serde_json::Value>::new()
                    .init_timeout_sensitive(true)
                    .build(|_ctx, _arg| async { Ok(()) }),
            )
            .unwrap();
        registry.register("insensitive", noop_def()).unwrap();

        assert_eq!(registry.keys_by_sensitivity(true), vec!["sensitive".to_string()]);
        assert_eq!(registry.keys_by_sensitivity(false), vec!["insensitive".to_string()]);
    }

    #[test]
    fn get_unknown_key_errors() {
        let registry = Registry::new();
        assert!(registry.get("missing").is_err());
    }
}
