use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, warn};
use std::sync::Arc;
use thiserror::Error;

use crate::builder::Builder;
use crate::graph::{NodeRef, NodeType};
use crate::registry::ProxyHandle;

/// Creates consumer-side proxies for one node type (and, through the parent chain walk, for
/// every type derived from it that has no factory of its own).
pub trait ProxyFactory: Send + Sync {
    fn create(&self, node: &NodeRef, parent: ProxyHandle) -> Box<dyn Builder>;

    /// Runs before the proxy is built.
    fn pre_build(&self, _node: &NodeRef) {}

    /// Runs after the proxy has been destroyed.
    fn post_destroy(&self, _node: Option<&NodeRef>) {}
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FactoryError {
    #[error("a factory for {type_name} is already registered")]
    Duplicate { type_name: String },
    #[error("no factory registered for {type_name}")]
    Missing { type_name: String },
    #[error("neither {type_name} nor any of its parent types has a factory")]
    NoFactoryInChain { type_name: String },
}

/// Type name keyed factory table.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: DashMap<String, Arc<dyn ProxyFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuses (and keeps the existing registration) if `type_name` already has a factory.
    pub fn register_factory(
        &self,
        type_name: impl Into<String>,
        factory: Arc<dyn ProxyFactory>,
    ) -> Result<(), FactoryError> {
        match self.factories.entry(type_name.into()) {
            Entry::Occupied(entry) => {
                warn!("Factory for {} is already registered", entry.key());
                Err(FactoryError::Duplicate {
                    type_name: entry.key().clone(),
                })
            }
            Entry::Vacant(entry) => {
                debug!("Registered factory for {}", entry.key());
                entry.insert(factory);
                Ok(())
            }
        }
    }

    pub fn unregister_factory(&self, type_name: &str) -> Result<Arc<dyn ProxyFactory>, FactoryError> {
        match self.factories.remove(type_name) {
            Some((_, factory)) => Ok(factory),
            None => {
                warn!("Cannot unregister factory for {}, none is registered", type_name);
                Err(FactoryError::Missing {
                    type_name: type_name.to_string(),
                })
            }
        }
    }

    pub fn factory(&self, type_name: &str) -> Option<Arc<dyn ProxyFactory>> {
        self.factories
            .get(type_name)
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Finds the factory for `node_type`, walking up the parent types until one is registered.
    /// Returns the type that matched alongside the factory.
    pub fn resolve(
        &self,
        node_type: &'static NodeType,
    ) -> Result<(&'static NodeType, Arc<dyn ProxyFactory>), FactoryError> {
        node_type
            .ancestry()
            .find_map(|ty| self.factory(ty.name()).map(|factory| (ty, factory)))
            .ok_or_else(|| FactoryError::NoFactoryInChain {
                type_name: node_type.name().to_string(),
            })
    }

    pub fn create_proxy(
        &self,
        node: &NodeRef,
        parent: ProxyHandle,
    ) -> Result<(Box<dyn Builder>, Arc<dyn ProxyFactory>), FactoryError> {
        let (_, factory) = self.resolve(node.node_type())?;
        let proxy = factory.create(node, parent);
        Ok((proxy, factory))
    }
}

static SCENE_SYSTEM: ArcSwapOption<FactoryRegistry> = ArcSwapOption::const_empty();

/// Sets up the process-wide factory registry, or returns the one that is already set up.
pub fn initialize_scene_system() -> Arc<FactoryRegistry> {
    loop {
        let current = SCENE_SYSTEM.load();
        if let Some(registry) = &*current {
            return registry.clone();
        }

        let fresh = Arc::new(FactoryRegistry::new());
        let previous = SCENE_SYSTEM.compare_and_swap(&current, Some(fresh.clone()));
        if previous.is_none() {
            debug!("Scene system initialized");
            return fresh;
        }
    }
}

pub fn scene_system() -> Option<Arc<FactoryRegistry>> {
    SCENE_SYSTEM.load_full()
}

/// Tears the process-wide registry down. Dispatchers that already hold it keep their copy.
pub fn uninitialize_scene_system() -> Option<Arc<FactoryRegistry>> {
    let previous = SCENE_SYSTEM.swap(None);
    if previous.is_some() {
        debug!("Scene system uninitialized");
    }
    previous
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{BuildProperties, ResourceManager};
    use crate::graph::types::{GEOMETRY, GROUP, NODE, TEXT, TRANSFORM};
    use crate::graph::{GraphNode, RenderState};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullProxy;

    impl Builder for NullProxy {
        fn build(
            &mut self,
            _parent: ProxyHandle,
            _node: &NodeRef,
            _state: Option<&RenderState>,
            _props: &BuildProperties,
            _resources: &dyn ResourceManager,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn destroy(&mut self, _node: Option<&NodeRef>, _resources: &dyn ResourceManager) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
    }

    impl ProxyFactory for CountingFactory {
        fn create(&self, _node: &NodeRef, _parent: ProxyHandle) -> Box<dyn Builder> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Box::new(NullProxy)
        }
    }

    fn root_handle() -> ProxyHandle {
        ProxyHandle(hecs::World::new().spawn(()))
    }

    #[test]
    fn duplicate_registration_keeps_the_first() {
        let registry = FactoryRegistry::new();
        let first = Arc::new(CountingFactory::default());
        let second = Arc::new(CountingFactory::default());
        registry.register_factory("Geometry", first.clone()).unwrap();
        assert_eq!(
            registry.register_factory("Geometry", second.clone()),
            Err(FactoryError::Duplicate {
                type_name: "Geometry".into()
            })
        );

        let node: NodeRef = GraphNode::new("mesh", &GEOMETRY);
        registry.create_proxy(&node, root_handle()).unwrap();
        assert_eq!(first.created.load(Ordering::SeqCst), 1);
        assert_eq!(second.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregistering_an_unknown_type_fails() {
        let registry = FactoryRegistry::new();
        assert!(matches!(
            registry.unregister_factory("Geometry"),
            Err(FactoryError::Missing { .. })
        ));
    }

    #[test]
    fn exact_type_wins_over_parent_type() {
        let registry = FactoryRegistry::new();
        let geometry = Arc::new(CountingFactory::default());
        let node_factory = Arc::new(CountingFactory::default());
        registry.register_factory("Geometry", geometry.clone()).unwrap();
        registry.register_factory("Node", node_factory.clone()).unwrap();

        let node: NodeRef = GraphNode::new("mesh", &GEOMETRY);
        registry.create_proxy(&node, root_handle()).unwrap();

        assert_eq!(geometry.created.load(Ordering::SeqCst), 1);
        assert_eq!(node_factory.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn lookup_falls_back_along_the_chain() {
        let registry = FactoryRegistry::new();
        registry
            .register_factory("Group", Arc::new(CountingFactory::default()))
            .unwrap();
        registry
            .register_factory("Geometry", Arc::new(CountingFactory::default()))
            .unwrap();

        let (matched, _) = registry.resolve(&TRANSFORM).unwrap();
        assert_eq!(matched, &GROUP);
        let (matched, _) = registry.resolve(&TEXT).unwrap();
        assert_eq!(matched, &GEOMETRY);
        assert_eq!(
            registry.resolve(&NODE).err(),
            Some(FactoryError::NoFactoryInChain {
                type_name: "Node".into()
            })
        );
    }

    #[test]
    fn scene_system_lifecycle() {
        let first = initialize_scene_system();
        let again = initialize_scene_system();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(scene_system().is_some());

        let removed = uninitialize_scene_system().expect("was initialized");
        assert!(Arc::ptr_eq(&first, &removed));
        assert!(scene_system().is_none());
        assert!(uninitialize_scene_system().is_none());
    }
}
