//! The consumer-side construction boundary. Proxies are [`Builder`]s: they get built once when
//! their node occurrence appears and destroyed once when it goes away. What building means
//! (meshes, materials, engine objects) is up to the implementation.

pub mod resolver;

use glam::Vec4;
use log::trace;
use std::sync::Arc;

use crate::builder::resolver::Resolver;
use crate::commands::Activation;
use crate::graph::{NodeId, NodeRef, RenderState};
use crate::registry::ProxyHandle;

#[derive(Debug, Clone, PartialEq)]
pub struct BuildProperties {
    /// Scale from map units into engine units.
    pub world_scale: f64,
}

impl Default for BuildProperties {
    fn default() -> Self {
        Self { world_scale: 100.0 }
    }
}

pub trait Builder: Send + Sync {
    fn build(
        &mut self,
        parent: ProxyHandle,
        node: &NodeRef,
        state: Option<&RenderState>,
        props: &BuildProperties,
        resources: &dyn ResourceManager,
    ) -> anyhow::Result<()>;

    /// `node` is `None` for proxies without a graph node, e.g. the root.
    fn destroy(&mut self, node: Option<&NodeRef>, resources: &dyn ResourceManager) -> anyhow::Result<()>;

    fn set_activation(&mut self, _activation: Activation) {}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MaterialKind {
    Base,
    Unlit,
    Transparent,
    Missing,
}

impl MaterialKind {
    pub fn for_state(state: Option<&RenderState>) -> Self {
        match state {
            None => MaterialKind::Missing,
            Some(state) if state.transparent => MaterialKind::Transparent,
            Some(state) if state.unlit => MaterialKind::Unlit,
            Some(_) => MaterialKind::Base,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub kind: MaterialKind,
    pub base_color: Vec4,
    pub texture: Option<String>,
}

/// Shared resources for builders.
pub trait ResourceManager: Send + Sync {
    fn material(&self, owner: NodeId, state: Option<&RenderState>, kind: MaterialKind) -> Arc<Material>;
}

/// Deduplicates materials by (kind, render state). A material is freed once the last proxy using
/// it lets go of it.
#[derive(Default)]
pub struct MaterialCache {
    materials: Resolver<Material>,
}

impl MaterialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_materials(&self) -> usize {
        self.materials.live()
    }

    pub fn prune(&self) {
        self.materials.prune();
    }
}

impl ResourceManager for MaterialCache {
    fn material(&self, owner: NodeId, state: Option<&RenderState>, kind: MaterialKind) -> Arc<Material> {
        let key = match state {
            Some(state) => format!("{:?}|{}", kind, state.cache_key()),
            None => format!("{:?}|-", kind),
        };

        self.materials.resolve(&key, || {
            trace!("Creating material {} for {}", key, owner);
            Material {
                kind,
                base_color: state.map(|s| s.base_color).unwrap_or(Vec4::ONE),
                texture: state.and_then(|s| s.texture.clone()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_states_share_a_material() {
        let cache = MaterialCache::new();
        let state = RenderState {
            texture: Some("grass.png".into()),
            ..RenderState::default()
        };
        let kind = MaterialKind::for_state(Some(&state));
        assert_eq!(kind, MaterialKind::Base);

        let a = cache.material(NodeId::next(), Some(&state), kind);
        let b = cache.material(NodeId::next(), Some(&state.clone()), kind);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.texture.as_deref(), Some("grass.png"));

        let transparent = cache.material(NodeId::next(), Some(&state), MaterialKind::Transparent);
        assert!(!Arc::ptr_eq(&a, &transparent));
        assert_eq!(cache.live_materials(), 2);
    }

    #[test]
    fn kind_follows_the_render_state() {
        let unlit = RenderState {
            unlit: true,
            ..RenderState::default()
        };
        assert_eq!(MaterialKind::for_state(Some(&unlit)), MaterialKind::Unlit);
        assert_eq!(MaterialKind::for_state(None), MaterialKind::Missing);
    }
}
