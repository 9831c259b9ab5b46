//! The producer's collaborator: whatever owns the actual scene graph and knows how to traverse,
//! stream and query it. The producer thread drives a [`SceneSource`] and packs what it reports
//! into command buffers.

mod static_source;

pub use static_source::{StaticMap, StaticSceneSource};

use glam::{DVec3, Vec3};
use std::sync::Arc;

use crate::commands::{Activation, BufferType, CommandKind, Hit};
use crate::graph::{NodeRef, RenderState};
use crate::manager::{Capabilities, RenderSettings};

/// Answer of a query that may depend on data that is still streaming in.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult<T> {
    Ready(T),
    NotReady,
    Failed(String),
}

impl<T> QueryResult<T> {
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> QueryResult<U> {
        match self {
            QueryResult::Ready(value) => QueryResult::Ready(f(value)),
            QueryResult::NotReady => QueryResult::NotReady,
            QueryResult::Failed(message) => QueryResult::Failed(message),
        }
    }
}

pub struct RefreshContext<'a> {
    pub refresh_id: u64,
    pub time: f64,
    pub size_x: u32,
    pub size_y: u32,
    pub screen_width: u32,
    pub settings: &'a RenderSettings,
    pub capabilities: Capabilities,
}

/// Collects what a source reports during one call. Commands are only created when the producer
/// packs them into buffers, so ids follow the order in which buffers are emitted.
#[derive(Default)]
pub struct FrameEmitter {
    structural: Vec<(BufferType, CommandKind)>,
    activations: Vec<CommandKind>,
}

impl FrameEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_node(
        &mut self,
        node: NodeRef,
        path_id: u64,
        parent: Option<(NodeRef, u64)>,
        state: Option<Arc<RenderState>>,
    ) {
        let (parent, parent_path_id) = match parent {
            Some((parent, parent_path_id)) => (Some(parent), parent_path_id),
            None => (None, 0),
        };

        self.structural.push((
            BufferType::New,
            CommandKind::NewNode {
                node,
                path_id,
                parent,
                parent_path_id,
                state,
            },
        ));
    }

    pub fn delete_node(&mut self, node: NodeRef, path_id: u64) {
        self.structural
            .push((BufferType::Delete, CommandKind::DeleteNode { node, path_id }));
    }

    pub fn activation(&mut self, node: NodeRef, path_id: u64, activation: Activation) {
        self.activations.push(CommandKind::Activation {
            node,
            path_id,
            activation,
        });
    }

    pub fn geo_info(&mut self, coordinate_system: impl Into<String>, origin: DVec3) {
        self.structural.push((
            BufferType::New,
            CommandKind::GeoInfo {
                coordinate_system: coordinate_system.into(),
                origin,
            },
        ));
    }

    pub fn is_empty(&self) -> bool {
        self.structural.is_empty() && self.activations.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<(BufferType, CommandKind)>, Vec<CommandKind>) {
        (self.structural, self.activations)
    }
}

pub trait SceneSource: Send {
    fn initialize(&mut self, create_default_viewer: bool) -> anyhow::Result<()>;

    fn uninitialize(&mut self) -> anyhow::Result<()>;

    fn add_map(&mut self, url: &str, emitter: &mut FrameEmitter) -> anyhow::Result<()>;

    /// Unloads the map with the given url or root node name. The occurrences it leaves behind are
    /// reported as deleted on the next refresh. Returns whether anything matched.
    fn remove_map(&mut self, name: &str) -> anyhow::Result<bool>;

    fn map_urls(&self) -> Vec<String>;

    /// Origin of the loaded maps, `None` if nothing is loaded.
    fn map_center(&self) -> Option<DVec3>;

    fn set_loaders(&mut self, loaders: u32, run_loaders: bool, precache_textures: bool);

    /// One traversal: report occurrences that appeared, disappeared or changed activation.
    fn refresh(&mut self, ctx: &RefreshContext, emitter: &mut FrameEmitter) -> anyhow::Result<()>;

    fn ground_clamp(&mut self, latitude: f64, longitude: f64, height_above_ground: f64) -> QueryResult<(DVec3, Vec3)>;

    fn intersect(&mut self, start: DVec3, direction: DVec3, mask: u32) -> QueryResult<Vec<Hit>>;
}
