//! Per-session cache of entity maps.
//!
//! The application registers one factory per entity in [`MapFactories`];
//! each session then builds a map the first time it is asked for and keeps
//! it until the session is dropped or the caller forces a rebuild.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::driver::Driver;
use crate::error::{ConnectionError, Result};
use crate::identity::IdentityMapper;
use crate::session::Session;

/// Type-erased map instance.
pub type MapInstance = Arc<dyn Any + Send + Sync>;

type MapFactory = Arc<dyn Fn(&MapContext) -> MapInstance + Send + Sync>;

/// Entity name with leading and trailing path separators (`\`, `:`) removed.
pub fn entity_name(class_name: &str) -> &str {
    class_name.trim_matches(|c| c == '\\' || c == ':')
}

/// Conventional map type name for an entity, e.g. `Blog\Post` → `Blog\PostMap`.
pub fn map_type_name(class_name: &str) -> String {
    format!("{}Map", entity_name(class_name))
}

/// What a factory knows about the session it builds a map for.
///
/// Maps run queries through the `&mut Session` handed to their methods, so
/// the context does not borrow the session.
#[derive(Clone)]
pub struct MapContext {
    entity: String,
    session_id: Uuid,
    identity_mapper: Option<Arc<dyn IdentityMapper>>,
}

impl MapContext {
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn identity_mapper(&self) -> Option<&Arc<dyn IdentityMapper>> {
        self.identity_mapper.as_ref()
    }
}

impl fmt::Debug for MapContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapContext")
            .field("entity", &self.entity)
            .field("session_id", &self.session_id)
            .field("identity_mapper", &self.identity_mapper.is_some())
            .finish()
    }
}

/// Entity name → map constructor. Cheap to clone and share between sessions.
#[derive(Clone, Default)]
pub struct MapFactories {
    factories: HashMap<String, MapFactory>,
}

impl MapFactories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M, F>(mut self, class_name: &str, factory: F) -> Self
    where
        M: Any + Send + Sync,
        F: Fn(&MapContext) -> M + Send + Sync + 'static,
    {
        let factory: MapFactory = Arc::new(move |ctx: &MapContext| Arc::new(factory(ctx)) as MapInstance);
        self.factories.insert(entity_name(class_name).to_string(), factory);
        self
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.factories.contains_key(entity_name(class_name))
    }

    fn get(&self, entity: &str) -> Option<&MapFactory> {
        self.factories.get(entity)
    }
}

impl fmt::Debug for MapFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

/// Maps built by one session.
#[derive(Debug, Default)]
pub struct MapRegistry {
    factories: MapFactories,
    maps: HashMap<String, MapInstance>,
}

impl MapRegistry {
    pub fn new(factories: MapFactories) -> Self {
        Self {
            factories,
            maps: HashMap::new(),
        }
    }

    /// Cached map for `class_name`, built on a miss or when `force` is set.
    pub fn get(
        &mut self,
        class_name: &str,
        force: bool,
        session_id: Uuid,
        identity_mapper: Option<&Arc<dyn IdentityMapper>>,
    ) -> Result<MapInstance> {
        let entity = entity_name(class_name);
        if !force {
            if let Some(map) = self.maps.get(entity) {
                return Ok(Arc::clone(map));
            }
        }

        let factory = self
            .factories
            .get(entity)
            .ok_or_else(|| ConnectionError::UnknownEntity(entity.to_string()))?;
        let ctx = MapContext {
            entity: entity.to_string(),
            session_id,
            identity_mapper: identity_mapper.cloned(),
        };
        let map = factory(&ctx);
        tracing::debug!(entity, map = %map_type_name(entity), force, "map built");
        self.maps.insert(entity.to_string(), Arc::clone(&map));
        Ok(map)
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.maps.contains_key(entity_name(class_name))
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

impl<D: Driver> Session<D> {
    /// The map for an entity, cached per session. `force` rebuilds it.
    pub fn get_map_for(&mut self, class_name: &str, force: bool) -> Result<MapInstance> {
        self.maps
            .get(class_name, force, self.id, self.identity_mapper.as_ref())
    }

    /// Typed variant of [`get_map_for`](Self::get_map_for).
    pub fn map_for<M: Any + Send + Sync>(&mut self, class_name: &str, force: bool) -> Result<Arc<M>> {
        self.get_map_for(class_name, force)?
            .downcast::<M>()
            .map_err(|_| ConnectionError::MapTypeMismatch {
                entity: entity_name(class_name).to_string(),
                expected: type_name::<M>(),
            })
    }
}
