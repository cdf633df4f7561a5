use std::collections::HashMap;
use std::sync::Arc;

use modelhost_config::ModelConfig;
use modelhost_types::{FallbackStrategy, HostError, ModelDescriptor};

/// Static catalog of model descriptors, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<ModelDescriptor>>,
}

impl ModelRegistry {
    pub fn new(descriptors: Vec<ModelDescriptor>) -> Result<Self, HostError> {
        let mut models = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if descriptor.name.trim().is_empty() {
                return Err(HostError::Config("model name cannot be empty".into()));
            }
            if descriptor.max_concurrent_users == 0 {
                return Err(HostError::Config(format!(
                    "model {} must allow at least one concurrent user",
                    descriptor.name
                )));
            }
            let name = descriptor.name.clone();
            if models.insert(name.clone(), Arc::new(descriptor)).is_some() {
                return Err(HostError::Config(format!("duplicate model name: {name}")));
            }
        }
        Ok(Self { models })
    }

    /// Build descriptors from config entries. The fallback strategy is picked
    /// here, once, from the model category.
    pub fn from_config(models: &[ModelConfig]) -> Result<Self, HostError> {
        let descriptors = models
            .iter()
            .map(|m| ModelDescriptor {
                name: m.name.clone(),
                category: m.category,
                footprint_bytes: m.footprint_bytes,
                priority: m.priority,
                required_memory_bytes: m.required_memory_bytes.unwrap_or(m.footprint_bytes),
                max_concurrent_users: m.max_concurrent_users,
                fallback: m
                    .has_fallback
                    .then(|| FallbackStrategy::for_category(m.category)),
                chunk_size_bytes: m.chunk_size_bytes,
            })
            .collect();
        Self::new(descriptors)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModelDescriptor>> {
        self.models.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
