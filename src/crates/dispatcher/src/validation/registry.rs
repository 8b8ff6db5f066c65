//! Validator registry
//!
//! Maps validator names to factories. Instances are built on first use for a
//! given `(name, params)` pair and kept in a bounded cache that evicts the
//! least recently used entry. Re-registering a name replaces the factory and
//! drops its cached instances.

use super::builtin::{BuiltinValidator, BUILTIN_KINDS};
use super::Validator;
use crate::config::ValidationSpec;
use crate::{DispatchError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Builds a validator from its params
pub type ValidatorFactory = Arc<dyn Fn(&Value) -> Result<Arc<dyn Validator>> + Send + Sync>;

/// Introspection entry returned by [`ValidatorRegistry::list`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyInfo {
    pub name: String,
    pub description: String,
}

/// Default upper bound on cached validator instances
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

#[derive(Clone)]
struct Registration {
    description: String,
    factory: ValidatorFactory,
    generation: u64,
}

type CacheKey = (String, String);

struct CachedValidator {
    validator: Arc<dyn Validator>,
    last_used: AtomicU64,
}

/// Thread-safe name to validator lookup
#[derive(Clone)]
pub struct ValidatorRegistry {
    factories: Arc<RwLock<HashMap<String, Registration>>>,
    instances: Arc<RwLock<HashMap<CacheKey, CachedValidator>>>,
    /// Monotonic counter for registration generations and cache recency
    clock: Arc<AtomicU64>,
    capacity: usize,
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self {
            factories: Arc::default(),
            instances: Arc::default(),
            clock: Arc::default(),
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl ValidatorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the instance cache; 0 disables caching
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self.instances.write().clear();
        self
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Create a registry holding every built-in kind
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_builtins();
        registry
    }

    /// Register all built-in kinds, replacing same-named entries
    pub fn register_builtins(&self) {
        for (kind, description) in BUILTIN_KINDS {
            self.register(kind, description, move |params: &Value| {
                let validator: Arc<dyn Validator> =
                    Arc::new(BuiltinValidator::from_spec(kind, params)?);
                Ok(validator)
            });
        }
    }

    /// Register a validator factory
    ///
    /// An existing registration under the same name is replaced.
    pub fn register<F>(&self, name: impl Into<String>, description: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Validator>> + Send + Sync + 'static,
    {
        let name = name.into();
        let registration = Registration {
            description: description.into(),
            factory: Arc::new(factory),
            generation: self.tick(),
        };

        let replaced = self
            .factories
            .write()
            .insert(name.clone(), registration)
            .is_some();

        if replaced {
            warn!(validator = %name, "Validator re-registered, replacing previous factory");
            self.instances.write().retain(|(cached, _), _| cached != &name);
        } else {
            debug!(validator = %name, "Validator registered");
        }
    }

    /// Check if a name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// Get a validator instance for `name` configured with `params`
    ///
    /// # Errors
    /// * `ValidatorNotFound` if no factory is registered under `name`
    /// * whatever the factory returns for bad params
    pub fn get(&self, name: &str, params: &Value) -> Result<Arc<dyn Validator>> {
        let key = (name.to_string(), params.to_string());
        if let Some(cached) = self.instances.read().get(&key) {
            cached.last_used.store(self.tick(), Ordering::Relaxed);
            return Ok(Arc::clone(&cached.validator));
        }

        loop {
            let (factory, generation) = self
                .factories
                .read()
                .get(name)
                .map(|registration| (Arc::clone(&registration.factory), registration.generation))
                .ok_or_else(|| DispatchError::ValidatorNotFound(name.to_string()))?;

            // Build outside the locks; factories may be slow
            let instance = factory(params)?;
            if self.capacity == 0 {
                return Ok(instance);
            }

            let mut instances = self.instances.write();

            // A register() that ran while building has already swept the cache
            let current = self.factories.read().get(name).map(|r| r.generation);
            if current != Some(generation) {
                drop(instances);
                debug!(validator = %name, "Validator replaced during build, rebuilding");
                continue;
            }

            if let Some(cached) = instances.get(&key) {
                cached.last_used.store(self.tick(), Ordering::Relaxed);
                return Ok(Arc::clone(&cached.validator));
            }

            if instances.len() >= self.capacity {
                let oldest = instances
                    .iter()
                    .min_by_key(|(_, cached)| cached.last_used.load(Ordering::Relaxed))
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    instances.remove(&oldest);
                }
            }

            instances.insert(
                key,
                CachedValidator {
                    validator: Arc::clone(&instance),
                    last_used: AtomicU64::new(self.tick()),
                },
            );
            return Ok(instance);
        }
    }

    /// Registered validators, sorted by name
    pub fn list(&self) -> Vec<StrategyInfo> {
        let mut infos: Vec<StrategyInfo> = self
            .factories
            .read()
            .iter()
            .map(|(name, registration)| StrategyInfo {
                name: name.clone(),
                description: registration.description.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Build the ordered validator chain of a submission
    pub fn build_chain(&self, specs: &[ValidationSpec]) -> Result<Vec<Arc<dyn Validator>>> {
        specs
            .iter()
            .map(|spec| self.get(&spec.kind, &spec.params))
            .collect()
    }

    /// Number of cached instances
    pub fn cached_instances(&self) -> usize {
        self.instances.read().len()
    }

    /// Drop every cached instance
    pub fn clear_cache(&self) {
        self.instances.write().clear();
    }
}

impl std::fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("ValidatorRegistry")
            .field("validators", &names)
            .field("cached_instances", &self.cached_instances())
            .field("capacity", &self.capacity)
            .finish()
    }
}
