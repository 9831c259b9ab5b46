pub mod factory;

use hecs::{Entity, World};
use itertools::Itertools;
use log::{trace, warn};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::builder::Builder;
use crate::commands::Activation;
use crate::graph::{NodeId, NodeRef};
use crate::registry::factory::ProxyFactory;

/// Identifies one occurrence of a node: the same node reached through different (instanced)
/// parents has a different path id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey {
    pub node: NodeId,
    pub path_id: u64,
}

impl PathKey {
    pub const ROOT: PathKey = PathKey {
        node: NodeId::ROOT,
        path_id: 0,
    };

    pub fn new(node: NodeId, path_id: u64) -> Self {
        Self { node, path_id }
    }

    pub fn of(node: &NodeRef, path_id: u64) -> Self {
        Self::new(node.id(), path_id)
    }
}

impl Display for PathKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{:016x}", self.node, self.path_id)
    }
}

/// Opaque handle to a registered proxy. Handles are generational: once an identity has been
/// unregistered its handle never resolves again, even if the slot gets reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ProxyHandle(Entity);

impl ProxyHandle {
    #[cfg(test)]
    pub(crate) const DANGLING: ProxyHandle = ProxyHandle(Entity::DANGLING);
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("{key} is already registered")]
    AlreadyRegistered { key: PathKey },
    #[error("{key} is not registered")]
    NotRegistered { key: PathKey },
}

struct Identity {
    key: PathKey,
    seq: u64,
}

struct Occurrence(Option<NodeRef>);

struct Proxy(Box<dyn Builder>);

struct Origin(Option<Arc<dyn ProxyFactory>>);

/// Everything that belonged to an identity, handed back on unregistration so the caller can run
/// the destroy hooks outside of the registry.
pub struct Unregistered {
    pub key: PathKey,
    pub node: Option<NodeRef>,
    pub proxy: Box<dyn Builder>,
    pub activation: Activation,
    pub factory: Option<Arc<dyn ProxyFactory>>,
}

#[derive(Default)]
struct RegistryInner {
    world: World,
    index: HashMap<PathKey, Entity>,
    seq: u64,
}

impl RegistryInner {
    fn spawn(
        &mut self,
        key: PathKey,
        node: Option<NodeRef>,
        proxy: Box<dyn Builder>,
        factory: Option<Arc<dyn ProxyFactory>>,
    ) -> ProxyHandle {
        self.seq += 1;
        let entity = self.world.spawn((
            Identity { key, seq: self.seq },
            Occurrence(node.clone()),
            Proxy(proxy),
            Origin(factory),
            Activation::Init,
        ));
        self.index.insert(key, entity);

        let handle = ProxyHandle(entity);
        if let Some(node) = node {
            node.user_data().set_proxy(key.path_id, handle);
        }

        trace!("Registered {}", key);
        handle
    }
}

/// Maps (node, path id) pairs to their consumer-side proxy and activation state.
#[derive(Default)]
pub struct PathIdentityRegistry {
    inner: Mutex<RegistryInner>,
}

impl PathIdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        key: PathKey,
        node: Option<NodeRef>,
        proxy: Box<dyn Builder>,
        factory: Option<Arc<dyn ProxyFactory>>,
    ) -> Result<ProxyHandle, RegistrationError> {
        let mut inner = self.inner.lock().expect("Registry Lock");
        if inner.index.contains_key(&key) {
            return Err(RegistrationError::AlreadyRegistered { key });
        }

        Ok(inner.spawn(key, node, proxy, factory))
    }

    /// A registry that starts out with `proxy` registered under [`PathKey::ROOT`].
    pub fn with_root(proxy: Box<dyn Builder>) -> (Self, ProxyHandle) {
        let mut inner = RegistryInner::default();
        let root = inner.spawn(PathKey::ROOT, None, proxy, None);
        (
            Self {
                inner: Mutex::new(inner),
            },
            root,
        )
    }

    pub fn lookup(&self, key: PathKey) -> Option<ProxyHandle> {
        let inner = self.inner.lock().expect("Registry Lock");
        inner.index.get(&key).copied().map(ProxyHandle)
    }

    pub fn contains(&self, key: PathKey) -> bool {
        self.lookup(key).is_some()
    }

    pub fn unregister(&self, key: PathKey) -> Result<Unregistered, RegistrationError> {
        let mut inner = self.inner.lock().expect("Registry Lock");
        let entity = inner
            .index
            .remove(&key)
            .ok_or(RegistrationError::NotRegistered { key })?;

        Self::take(&mut inner.world, entity).ok_or(RegistrationError::NotRegistered { key })
    }

    fn take(world: &mut World, entity: Entity) -> Option<Unregistered> {
        let removed = world.remove::<(Identity, Occurrence, Proxy, Origin, Activation)>(entity);
        if let Err(err) = world.despawn(entity) {
            warn!("Registry entity {:?} vanished: {}", entity, err);
        }

        let (identity, occurrence, proxy, origin, activation) = removed.ok()?;
        if let Some(node) = &occurrence.0 {
            node.user_data().clear_proxy(identity.key.path_id);
        }

        trace!("Unregistered {}", identity.key);
        Some(Unregistered {
            key: identity.key,
            node: occurrence.0,
            proxy: proxy.0,
            activation,
            factory: origin.0,
        })
    }

    /// Stores the new activation state and forwards it to the proxy.
    pub fn set_activation(&self, key: PathKey, activation: Activation) -> Result<(), RegistrationError> {
        let mut inner = self.inner.lock().expect("Registry Lock");
        let entity = *inner
            .index
            .get(&key)
            .ok_or(RegistrationError::NotRegistered { key })?;

        let (state, proxy) = inner
            .world
            .query_one_mut::<(&mut Activation, &mut Proxy)>(entity)
            .map_err(|_| RegistrationError::NotRegistered { key })?;

        if *state != activation {
            *state = activation;
            proxy.0.set_activation(activation);
        }
        Ok(())
    }

    pub fn activation(&self, key: PathKey) -> Option<Activation> {
        let mut inner = self.inner.lock().expect("Registry Lock");
        let entity = *inner.index.get(&key)?;
        inner
            .world
            .query_one_mut::<&Activation>(entity)
            .ok()
            .copied()
    }

    /// Runs `f` on the proxy behind `handle`, if it is still registered.
    pub fn with_proxy<R>(&self, handle: ProxyHandle, f: impl FnOnce(&mut dyn Builder) -> R) -> Option<R> {
        let mut inner = self.inner.lock().expect("Registry Lock");
        inner
            .world
            .query_one_mut::<&mut Proxy>(handle.0)
            .ok()
            .map(|proxy| f(proxy.0.as_mut()))
    }

    pub fn is_live(&self, handle: ProxyHandle) -> bool {
        let inner = self.inner.lock().expect("Registry Lock");
        inner.world.contains(handle.0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("Registry Lock").index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unregisters everything, most recently registered first (children before their parents).
    pub fn drain(&self) -> Vec<Unregistered> {
        let mut inner = self.inner.lock().expect("Registry Lock");
        let inner = &mut *inner;

        let mut entities = inner
            .world
            .query_mut::<&Identity>()
            .into_iter()
            .map(|(entity, identity)| (identity.seq, entity))
            .collect_vec();
        entities.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        inner.index.clear();

        entities
            .into_iter()
            .filter_map(|(_, entity)| Self::take(&mut inner.world, entity))
            .collect_vec()
    }
}
