//! Identity mappers: one in-memory instance per (map, primary key).
//!
//! A session only references its identity mapper; the mapper itself may be
//! shared with other code. Which mapper a session gets comes from the
//! `identity_mapper` configuration key, resolved through [`IdentityMappers`],
//! unless one is injected explicitly.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::IdentityMapperSetting;
use crate::error::{ConnectionError, Result};

/// Type-erased entity instance.
pub type Instance = Arc<dyn Any + Send + Sync>;

pub trait IdentityMapper: Send + Sync {
    fn fetch(&self, map: &str, key: &str) -> Option<Instance>;

    /// Register `instance` and return the canonical instance for the key,
    /// which is the previously stored one if there was one.
    fn store(&self, map: &str, key: &str, instance: Instance) -> Instance;

    fn discard(&self, map: &str, key: &str);

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default mapper: first stored instance wins until discarded.
#[derive(Default)]
pub struct SmartIdentityMapper {
    instances: Mutex<HashMap<(String, String), Instance>>,
}

impl SmartIdentityMapper {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityMapper for SmartIdentityMapper {
    fn fetch(&self, map: &str, key: &str) -> Option<Instance> {
        self.instances
            .lock()
            .get(&(map.to_string(), key.to_string()))
            .cloned()
    }

    fn store(&self, map: &str, key: &str, instance: Instance) -> Instance {
        Arc::clone(
            self.instances
                .lock()
                .entry((map.to_string(), key.to_string()))
                .or_insert(instance),
        )
    }

    fn discard(&self, map: &str, key: &str) {
        self.instances.lock().remove(&(map.to_string(), key.to_string()));
    }

    fn clear(&self) {
        self.instances.lock().clear();
    }

    fn len(&self) -> usize {
        self.instances.lock().len()
    }
}

impl fmt::Debug for SmartIdentityMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartIdentityMapper")
            .field("instances", &self.len())
            .finish()
    }
}

type MapperFactory = Arc<dyn Fn() -> Arc<dyn IdentityMapper> + Send + Sync>;

/// Named identity mapper constructors, filled in by the application.
#[derive(Clone, Default)]
pub struct IdentityMappers {
    factories: HashMap<String, MapperFactory>,
}

impl IdentityMappers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn IdentityMapper> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Mapper for a configuration setting; `None` when disabled.
    pub fn resolve(&self, setting: &IdentityMapperSetting) -> Result<Option<Arc<dyn IdentityMapper>>> {
        match setting {
            IdentityMapperSetting::Disabled => Ok(None),
            IdentityMapperSetting::Default => Ok(Some(Arc::new(SmartIdentityMapper::new()))),
            IdentityMapperSetting::Named(name) => self
                .factories
                .get(name)
                .map(|factory| Some(factory()))
                .ok_or_else(|| {
                    ConnectionError::Configuration(format!("unknown identity mapper '{}'", name))
                }),
        }
    }
}

impl fmt::Debug for IdentityMappers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}
