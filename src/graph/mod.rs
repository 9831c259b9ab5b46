//! The scene graph as seen by the synchronisation core. The graph itself (loading, culling,
//! traversal) is owned by a [`crate::source::SceneSource`]; all the core needs from a node is its
//! identity, its position in the type hierarchy and a place to stash proxy handles.
//!
//! Nodes may be reachable through several parents (instanced subtrees), so a node on its own does
//! not identify an occurrence. That is what [`crate::registry::PathKey`] is for.

use dashmap::DashMap;
use glam::Vec4;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::registry::ProxyHandle;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique node identity. Unlike an address, an id is never handed out twice.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Reserved for the consumer-side root, which has no graph node.
    pub const ROOT: NodeId = NodeId(0);

    pub fn next() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One entry of the node type hierarchy. Types form a tree through `parent`, which the factory
/// registry walks when looking for a factory.
#[derive(Debug)]
pub struct NodeType {
    name: &'static str,
    parent: Option<&'static NodeType>,
}

impl NodeType {
    pub const fn root(name: &'static str) -> Self {
        Self { name, parent: None }
    }

    pub const fn derived(name: &'static str, parent: &'static NodeType) -> Self {
        Self {
            name,
            parent: Some(parent),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn parent(&self) -> Option<&'static NodeType> {
        self.parent
    }

    /// The type itself followed by all of its ancestors, most derived first.
    pub fn ancestry(&'static self) -> impl Iterator<Item = &'static NodeType> {
        std::iter::successors(Some(self), |ty| ty.parent)
    }

    pub fn is_a(&'static self, other: &NodeType) -> bool {
        self.ancestry().any(|ty| ty.name == other.name)
    }
}

impl PartialEq for NodeType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

/// The node types known to the demo graph and tests. Collaborators may declare their own.
pub mod types {
    use super::NodeType;

    pub static NODE: NodeType = NodeType::root("Node");
    pub static GROUP: NodeType = NodeType::derived("Group", &NODE);
    pub static TRANSFORM: NodeType = NodeType::derived("Transform", &GROUP);
    pub static LOD: NodeType = NodeType::derived("Lod", &GROUP);
    pub static SWITCH: NodeType = NodeType::derived("Switch", &GROUP);
    pub static GEOMETRY: NodeType = NodeType::derived("Geometry", &NODE);
    pub static TEXT: NodeType = NodeType::derived("Text", &GEOMETRY);
    pub static LIGHT: NodeType = NodeType::derived("Light", &NODE);
}

/// Per-node storage for the proxy handles of each occurrence (keyed by path id).
#[derive(Debug, Default)]
pub struct NodeUserData {
    proxies: DashMap<u64, ProxyHandle>,
}

impl NodeUserData {
    pub fn proxy(&self, path_id: u64) -> Option<ProxyHandle> {
        self.proxies.get(&path_id).map(|entry| *entry)
    }

    pub(crate) fn set_proxy(&self, path_id: u64, handle: ProxyHandle) {
        self.proxies.insert(path_id, handle);
    }

    pub(crate) fn clear_proxy(&self, path_id: u64) {
        self.proxies.remove(&path_id);
    }

    pub fn occurrences(&self) -> usize {
        self.proxies.len()
    }
}

/// What a scene graph node has to expose to be synchronised.
pub trait SceneNode: Send + Sync + Debug {
    fn id(&self) -> NodeId;

    fn node_type(&self) -> &'static NodeType;

    fn name(&self) -> &str;

    fn user_data(&self) -> &NodeUserData;

    fn type_name(&self) -> &'static str {
        self.node_type().name()
    }

    fn parent_type(&self) -> Option<&'static NodeType> {
        self.node_type().parent()
    }
}

pub type NodeRef = Arc<dyn SceneNode>;

/// Shared render state attached to nodes (the input to material resolution).
#[derive(Debug, Clone, PartialEq)]
pub struct RenderState {
    pub base_color: Vec4,
    pub texture: Option<String>,
    pub transparent: bool,
    pub unlit: bool,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            base_color: Vec4::ONE,
            texture: None,
            transparent: false,
            unlit: false,
        }
    }
}

impl RenderState {
    /// Key under which equal states share resources.
    pub fn cache_key(&self) -> String {
        let c = self.base_color;
        format!(
            "{:.3}/{:.3}/{:.3}/{:.3}|{}|{}|{}",
            c.x,
            c.y,
            c.z,
            c.w,
            self.texture.as_deref().unwrap_or("-"),
            self.transparent,
            self.unlit
        )
    }
}

/// A plain in-memory node, used by [`crate::source::StaticSceneSource`].
#[derive(Debug)]
pub struct GraphNode {
    id: NodeId,
    name: String,
    node_type: &'static NodeType,
    state: Option<Arc<RenderState>>,
    children: RwLock<Vec<Arc<GraphNode>>>,
    user_data: NodeUserData,
}

impl GraphNode {
    pub fn new(name: impl Into<String>, node_type: &'static NodeType) -> Arc<Self> {
        Arc::new(Self::build(name.into(), node_type, None))
    }

    pub fn with_state(name: impl Into<String>, node_type: &'static NodeType, state: Arc<RenderState>) -> Arc<Self> {
        Arc::new(Self::build(name.into(), node_type, Some(state)))
    }

    fn build(name: String, node_type: &'static NodeType, state: Option<Arc<RenderState>>) -> Self {
        Self {
            id: NodeId::next(),
            name,
            node_type,
            state,
            children: RwLock::new(Vec::new()),
            user_data: NodeUserData::default(),
        }
    }

    /// Adding the same child to several parents instances it.
    pub fn add_child(&self, child: Arc<GraphNode>) {
        self.children
            .write()
            .expect("Write Lock on GraphNode children")
            .push(child);
    }

    pub fn children(&self) -> Vec<Arc<GraphNode>> {
        self.children
            .read()
            .expect("Read Lock on GraphNode children")
            .clone()
    }

    pub fn state(&self) -> Option<&Arc<RenderState>> {
        self.state.as_ref()
    }
}

impl SceneNode for GraphNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn node_type(&self) -> &'static NodeType {
        self.node_type
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn user_data(&self) -> &NodeUserData {
        &self.user_data
    }
}

#[cfg(test)]
mod tests {
    use super::types::*;
    use super::*;

    #[test]
    fn ancestry_walks_up_to_the_root() {
        let names: Vec<_> = TRANSFORM.ancestry().map(NodeType::name).collect();
        assert_eq!(names, vec!["Transform", "Group", "Node"]);
        assert!(TEXT.is_a(&GEOMETRY));
        assert!(!GEOMETRY.is_a(&GROUP));
    }

    #[test]
    fn node_ids_are_unique() {
        let a = GraphNode::new("a", &GEOMETRY);
        let b = GraphNode::new("b", &GEOMETRY);
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), NodeId::ROOT);
        assert_eq!(a.type_name(), "Geometry");
        assert_eq!(a.parent_type().map(NodeType::name), Some("Node"));
    }

    #[test]
    fn render_state_keys_distinguish_states() {
        let opaque = RenderState::default();
        let transparent = RenderState {
            transparent: true,
            ..RenderState::default()
        };
        assert_ne!(opaque.cache_key(), transparent.cache_key());
        assert_eq!(opaque.cache_key(), RenderState::default().cache_key());
    }
}
