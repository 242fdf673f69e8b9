//! Resource registry: resolves identifiers to live resources.
//!
//! Singletons are created on first use and cached; instance resources are
//! rebuilt from their arguments on every call. Shutdown visits singletons in
//! reverse creation order.

use std::sync::Arc;

use dashmap::DashMap;
use hostlink_core::{ErrorCode, ResourceId, StateStore};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use super::resource::{Bound, FromArgs, MethodTable, Resource};

// ---------------------------------------------------------------------------
// ResolveError
// ---------------------------------------------------------------------------

/// Why a resource identifier could not be turned into a live resource.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no resource named {0:?}")]
    UnknownResource(String),
    /// Constructor arguments no longer name a live entity.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{name} is a singleton and takes no constructor arguments")]
    UnexpectedArgs { name: String },
    #[error("{name} requires constructor arguments")]
    MissingArgs { name: String },
    #[error("invalid constructor arguments for {name}: {reason}")]
    InvalidArgs { name: String, reason: String },
}

impl ResolveError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        ResolveError::NotFound(what.to_string())
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            ResolveError::UnknownResource(_) | ResolveError::NotFound(_) => {
                ErrorCode::ResourceNotFound
            }
            ResolveError::UnexpectedArgs { .. }
            | ResolveError::MissingArgs { .. }
            | ResolveError::InvalidArgs { .. } => ErrorCode::InvalidParams,
        }
    }
}

// ---------------------------------------------------------------------------
// ResourceFactory
// ---------------------------------------------------------------------------

pub type SingletonCtor = Box<dyn Fn() -> Arc<dyn Resource> + Send + Sync>;
pub type InstanceCtor =
    Box<dyn Fn(&[Value], &StateStore) -> Result<Arc<dyn Resource>, ResolveError> + Send + Sync>;

/// How a service name turns into a resource.
pub enum ResourceFactory {
    /// Created on first resolution and cached for the host's lifetime.
    Singleton(SingletonCtor),
    /// Rebuilt from constructor arguments on every resolution.
    Instance(InstanceCtor),
}

// ---------------------------------------------------------------------------
// ResourceRegistry
// ---------------------------------------------------------------------------

/// Maps service names to factories and caches singletons.
///
/// Singletons are shut down in reverse creation order.
pub struct ResourceRegistry {
    factories: DashMap<String, Arc<ResourceFactory>>,
    singletons: DashMap<String, Arc<dyn Resource>>,
    creation_order: RwLock<Vec<String>>,
}

impl ResourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
            singletons: DashMap::new(),
            creation_order: RwLock::new(Vec::new()),
        }
    }

    /// Registers a raw factory. A second registration under the same name
    /// replaces the first.
    pub fn register(&self, name: impl Into<String>, factory: ResourceFactory) {
        let name = name.into();
        if self.factories.insert(name.clone(), Arc::new(factory)).is_some() {
            warn!(resource = %name, "resource factory replaced");
        }
    }

    /// Registers a singleton built from a plain value and its method table.
    pub fn register_singleton<R, F>(&self, name: &str, table: MethodTable<R>, ctor: F)
    where
        R: Send + Sync + 'static,
        F: Fn() -> R + Send + Sync + 'static,
    {
        let table = Arc::new(table);
        let bound_name = name.to_string();
        self.register(
            name,
            ResourceFactory::Singleton(Box::new(move || {
                Arc::new(Bound {
                    name: bound_name.clone(),
                    target: ctor(),
                    table: Arc::clone(&table),
                }) as Arc<dyn Resource>
            })),
        );
    }

    /// Registers a per-instance resource whose constructor arguments decode
    /// into `A`. The constructor sees the current state and returns
    /// `ResolveError::NotFound` when the entity is gone.
    pub fn register_instance<R, A, F>(&self, name: &str, table: MethodTable<R>, ctor: F)
    where
        R: Send + Sync + 'static,
        A: FromArgs,
        F: Fn(A, &StateStore) -> Result<R, ResolveError> + Send + Sync + 'static,
    {
        let table = Arc::new(table);
        let bound_name = name.to_string();
        self.register(
            name,
            ResourceFactory::Instance(Box::new(move |args: &[Value], store: &StateStore| {
                let decoded = A::from_args(args).map_err(|e| ResolveError::InvalidArgs {
                    name: bound_name.clone(),
                    reason: e.to_string(),
                })?;
                Ok(Arc::new(Bound {
                    name: bound_name.clone(),
                    target: ctor(decoded, store)?,
                    table: Arc::clone(&table),
                }) as Arc<dyn Resource>)
            })),
        );
    }

    /// Turns an identifier into a live resource.
    ///
    /// # Errors
    ///
    /// Returns a `ResolveError` for unknown names, argument-shape mismatches,
    /// or entities that no longer exist.
    pub fn resolve(
        &self,
        id: &ResourceId,
        store: &StateStore,
    ) -> Result<Arc<dyn Resource>, ResolveError> {
        let factory = self
            .factories
            .get(id.name())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ResolveError::UnknownResource(id.name().to_string()))?;

        match (factory.as_ref(), id.args()) {
            (ResourceFactory::Singleton(ctor), None) => Ok(self.singleton(id.name(), ctor)),
            (ResourceFactory::Singleton(_), Some(_)) => Err(ResolveError::UnexpectedArgs {
                name: id.name().to_string(),
            }),
            (ResourceFactory::Instance(ctor), Some(args)) => ctor(args, store),
            (ResourceFactory::Instance(_), None) => Err(ResolveError::MissingArgs {
                name: id.name().to_string(),
            }),
        }
    }

    fn singleton(&self, name: &str, ctor: &SingletonCtor) -> Arc<dyn Resource> {
        if let Some(existing) = self.singletons.get(name) {
            return Arc::clone(existing.value());
        }
        let entry = self.singletons.entry(name.to_string()).or_insert_with(|| {
            debug!(resource = %name, "creating singleton");
            self.creation_order.write().push(name.to_string());
            ctor()
        });
        Arc::clone(entry.value())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered service names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Singletons created so far, in creation order.
    #[must_use]
    pub fn created_singletons(&self) -> Vec<String> {
        self.creation_order.read().clone()
    }

    /// Shuts down every created singleton in reverse creation order.
    ///
    /// # Errors
    ///
    /// Every singleton is attempted; the first failure is returned.
    pub fn shutdown_all(&self) -> anyhow::Result<()> {
        let order = self.creation_order.read().clone();
        let mut first_error = None;
        for name in order.iter().rev() {
            let Some(resource) = self.singletons.get(name).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            if let Err(e) = resource.shutdown() {
                warn!(resource = %name, error = %e, "singleton shutdown failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
