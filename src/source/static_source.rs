use anyhow::anyhow;
use glam::{DVec3, Vec3};
use itertools::Itertools;
use log::{debug, info, trace};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::commands::{Activation, Hit};
use crate::graph::types::{LOD, SWITCH};
use crate::graph::{GraphNode, NodeRef, RenderState, SceneNode};
use crate::registry::PathKey;
use crate::source::{FrameEmitter, QueryResult, RefreshContext, SceneSource};
use crate::util::{child_path_id, root_path_id};

/// A pre-built in-memory map.
#[derive(Debug, Clone)]
pub struct StaticMap {
    pub root: Arc<GraphNode>,
    pub coordinate_system: String,
    pub origin: DVec3,
    /// Height of the (flat) terrain, used to answer ground clamp and intersection queries.
    pub ground_height: f64,
}

impl StaticMap {
    pub fn new(root: Arc<GraphNode>) -> Self {
        Self {
            root,
            coordinate_system: "LOCAL".to_string(),
            origin: DVec3::ZERO,
            ground_height: 0.0,
        }
    }
}

struct LoadedMap {
    url: String,
    /// Whether a refresh has traversed the map since it was added. Queries only see streamed data.
    streamed: bool,
}

struct Live {
    node: NodeRef,
    seq: u64,
}

struct Visit {
    key: PathKey,
    node: NodeRef,
    parent: Option<(NodeRef, u64)>,
    state: Option<Arc<RenderState>>,
}

/// Replays maps from a catalog of in-memory graphs. Every refresh diffs the traversal against the
/// occurrences reported so far.
pub struct StaticSceneSource {
    catalog: HashMap<String, StaticMap>,
    loaded: Vec<LoadedMap>,
    live: HashMap<PathKey, Live>,
    seq: u64,
    loaders: u32,
    run_loaders: bool,
    initialized: bool,
}

impl Default for StaticSceneSource {
    fn default() -> Self {
        Self {
            catalog: HashMap::new(),
            loaded: Vec::new(),
            live: HashMap::new(),
            seq: 0,
            loaders: 1,
            run_loaders: true,
            initialized: false,
        }
    }
}

impl StaticSceneSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_map(mut self, url: impl Into<String>, map: StaticMap) -> Self {
        self.insert_map(url, map);
        self
    }

    pub fn insert_map(&mut self, url: impl Into<String>, map: StaticMap) {
        self.catalog.insert(url.into(), map);
    }

    pub fn live_occurrences(&self) -> usize {
        self.live.len()
    }

    fn loaded_maps(&self) -> impl Iterator<Item = (&LoadedMap, &StaticMap)> {
        self.loaded
            .iter()
            .filter_map(|loaded| self.catalog.get(&loaded.url).map(|map| (loaded, map)))
    }

    /// Depth first, parents before their children. Switches and LODs only expose their first child
    /// unless traversing omni-directionally.
    fn traverse(&self, omni_traverse: bool) -> Vec<Visit> {
        let mut visits = Vec::new();
        for (loaded, map) in self.loaded_maps() {
            let path_id = root_path_id(&loaded.url);
            let mut stack = vec![(map.root.clone(), path_id, None::<(NodeRef, u64)>)];

            while let Some((node, path_id, parent)) = stack.pop() {
                let children = node.children();
                let selective = node.node_type().is_a(&SWITCH) || node.node_type().is_a(&LOD);
                let take = if selective && !omni_traverse {
                    children.len().min(1)
                } else {
                    children.len()
                };

                let node_ref: NodeRef = node.clone();
                // reversed, so that the first child is visited first
                for (index, child) in children.into_iter().take(take).enumerate().collect_vec().into_iter().rev() {
                    stack.push((child, child_path_id(path_id, index), Some((node_ref.clone(), path_id))));
                }

                visits.push(Visit {
                    key: PathKey::of(&node_ref, path_id),
                    state: node.state().cloned(),
                    node: node_ref,
                    parent,
                });
            }
        }
        visits
    }

    fn ground_height(&self) -> Option<f64> {
        self.loaded_maps()
            .find(|(loaded, _)| loaded.streamed)
            .map(|(_, map)| map.ground_height)
    }
}

impl SceneSource for StaticSceneSource {
    fn initialize(&mut self, create_default_viewer: bool) -> anyhow::Result<()> {
        debug!(
            "Static scene source initialized (default viewer: {})",
            create_default_viewer
        );
        self.initialized = true;
        Ok(())
    }

    fn uninitialize(&mut self) -> anyhow::Result<()> {
        self.loaded.clear();
        self.initialized = false;
        Ok(())
    }

    fn add_map(&mut self, url: &str, emitter: &mut FrameEmitter) -> anyhow::Result<()> {
        if !self.initialized {
            return Err(anyhow!("Cannot add map {}, the source is not initialized", url));
        }
        if self.loaded.iter().any(|loaded| loaded.url == url) {
            debug!("Map {} is already loaded", url);
            return Ok(());
        }

        let map = self
            .catalog
            .get(url)
            .ok_or_else(|| anyhow!("Unknown map {}", url))?;
        emitter.geo_info(map.coordinate_system.clone(), map.origin);

        info!("Loading map {}", url);
        self.loaded.push(LoadedMap {
            url: url.to_string(),
            streamed: false,
        });
        Ok(())
    }

    fn remove_map(&mut self, name: &str) -> anyhow::Result<bool> {
        let catalog = &self.catalog;
        let before = self.loaded.len();
        self.loaded.retain(|loaded| {
            let root_name = catalog.get(&loaded.url).map(|map| map.root.name());
            loaded.url != name && root_name != Some(name)
        });
        Ok(self.loaded.len() != before)
    }

    fn map_urls(&self) -> Vec<String> {
        self.loaded
            .iter()
            .map(|loaded| loaded.url.clone())
            .collect_vec()
    }

    fn map_center(&self) -> Option<DVec3> {
        let origins = self.loaded_maps().map(|(_, map)| map.origin).collect_vec();
        if origins.is_empty() {
            return None;
        }
        Some(origins.iter().copied().sum::<DVec3>() / origins.len() as f64)
    }

    fn set_loaders(&mut self, loaders: u32, run_loaders: bool, precache_textures: bool) {
        debug!(
            "Loaders: {} (running: {}, precache textures: {})",
            loaders, run_loaders, precache_textures
        );
        self.loaders = loaders;
        self.run_loaders = run_loaders;
    }

    fn refresh(&mut self, ctx: &RefreshContext, emitter: &mut FrameEmitter) -> anyhow::Result<()> {
        profiling::scope!("StaticSceneSource::refresh");
        let visits = self.traverse(ctx.settings.omni_traverse);
        let seen = visits.iter().map(|visit| visit.key).collect::<HashSet<_>>();

        // children were registered after their parents, so deleting newest first tears down leaves first
        let removed = self
            .live
            .iter()
            .filter(|(key, _)| !seen.contains(*key))
            .map(|(key, live)| (*key, live.seq))
            .sorted_by(|a, b| b.1.cmp(&a.1))
            .collect_vec();
        for (key, _) in removed {
            if let Some(live) = self.live.remove(&key) {
                emitter.delete_node(live.node, key.path_id);
            }
        }

        // with the loaders stopped nothing new streams in, unloading still happens
        if !self.run_loaders || self.loaders == 0 {
            trace!("Refresh {}: loaders stopped", ctx.refresh_id);
            return Ok(());
        }

        let mut added = Vec::new();
        for visit in visits {
            if self.live.contains_key(&visit.key) {
                continue;
            }

            self.seq += 1;
            self.live.insert(
                visit.key,
                Live {
                    node: visit.node.clone(),
                    seq: self.seq,
                },
            );
            emitter.new_node(visit.node.clone(), visit.key.path_id, visit.parent, visit.state);
            added.push((visit.node, visit.key.path_id));
        }

        for (node, path_id) in added {
            emitter.activation(node, path_id, Activation::On);
        }

        for loaded in self.loaded.iter_mut() {
            loaded.streamed = true;
        }

        trace!(
            "Refresh {} at {:.3}: {} live occurrences",
            ctx.refresh_id,
            ctx.time,
            self.live.len()
        );
        Ok(())
    }

    fn ground_clamp(&mut self, latitude: f64, longitude: f64, height_above_ground: f64) -> QueryResult<(DVec3, Vec3)> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return QueryResult::Failed(format!("Invalid position {}, {}", latitude, longitude));
        }

        match self.ground_height() {
            Some(ground) => QueryResult::Ready((
                DVec3::new(latitude, longitude, ground + height_above_ground),
                Vec3::Z,
            )),
            None => QueryResult::NotReady,
        }
    }

    fn intersect(&mut self, start: DVec3, direction: DVec3, mask: u32) -> QueryResult<Vec<Hit>> {
        let Some(ground) = self.ground_height() else {
            return QueryResult::NotReady;
        };

        // bit 0 selects the terrain, which is all a static map has
        if mask & 1 == 0 || direction.z == 0.0 {
            return QueryResult::Ready(vec![]);
        }

        let distance = (ground - start.z) / direction.z;
        if distance < 0.0 {
            return QueryResult::Ready(vec![]);
        }

        let hit = Hit {
            position: start + direction * distance,
            normal: Vec3::Z,
            distance: distance * direction.length(),
        };
        QueryResult::Ready(vec![hit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandKind;
    use crate::graph::types::{GEOMETRY, GROUP};
    use crate::manager::{Capabilities, RenderSettings};

    fn instanced_map() -> StaticMap {
        let root = GraphNode::new("city", &GROUP);
        let house = GraphNode::new("house", &GROUP);
        house.add_child(GraphNode::new("walls", &GEOMETRY));
        // the same house twice
        root.add_child(house.clone());
        root.add_child(house);
        StaticMap {
            ground_height: 12.0,
            ..StaticMap::new(root)
        }
    }

    fn refresh(source: &mut StaticSceneSource, refresh_id: u64) -> (Vec<CommandKind>, Vec<CommandKind>) {
        let settings = RenderSettings::default();
        let ctx = RefreshContext {
            refresh_id,
            time: 0.0,
            size_x: 100,
            size_y: 100,
            screen_width: 100,
            settings: &settings,
            capabilities: Capabilities::empty(),
        };
        let mut emitter = FrameEmitter::new();
        source.refresh(&ctx, &mut emitter).unwrap();
        let (structural, activations) = emitter.into_parts();
        (structural.into_iter().map(|(_, kind)| kind).collect(), activations)
    }

    #[test]
    fn instanced_subtrees_get_one_occurrence_per_path() {
        let mut source = StaticSceneSource::new().with_map("demo://city", instanced_map());
        source.initialize(false).unwrap();
        source
            .add_map("demo://city", &mut FrameEmitter::new())
            .unwrap();

        let (structural, activations) = refresh(&mut source, 1);
        // city, 2x house, 2x walls
        assert_eq!(structural.len(), 5);
        assert_eq!(activations.len(), 5);

        let walls = structural
            .iter()
            .filter_map(|kind| match kind {
                CommandKind::NewNode { node, path_id, .. } if node.name() == "walls" => Some(*path_id),
                _ => None,
            })
            .collect_vec();
        assert_eq!(walls.len(), 2);
        assert_ne!(walls[0], walls[1]);

        // nothing changed, nothing to report
        let (structural, activations) = refresh(&mut source, 2);
        assert!(structural.is_empty());
        assert!(activations.is_empty());
    }

    #[test]
    fn removing_a_map_deletes_children_first() {
        let mut source = StaticSceneSource::new().with_map("demo://city", instanced_map());
        source.initialize(false).unwrap();
        source
            .add_map("demo://city", &mut FrameEmitter::new())
            .unwrap();
        refresh(&mut source, 1);

        assert!(source.remove_map("city").unwrap());
        let (structural, _) = refresh(&mut source, 2);
        let names = structural
            .iter()
            .map(|kind| match kind {
                CommandKind::DeleteNode { node, .. } => node.name().to_string(),
                other => panic!("unexpected {}", other.name()),
            })
            .collect_vec();
        assert_eq!(names.len(), 5);
        assert_eq!(names.last().map(String::as_str), Some("city"));
        assert_eq!(source.live_occurrences(), 0);
    }

    #[test]
    fn queries_wait_for_streamed_data() {
        let mut source = StaticSceneSource::new().with_map("demo://city", instanced_map());
        source.initialize(false).unwrap();
        assert_eq!(source.ground_clamp(59.33, 18.12, 10.0), QueryResult::NotReady);

        source
            .add_map("demo://city", &mut FrameEmitter::new())
            .unwrap();
        assert_eq!(source.ground_clamp(59.33, 18.12, 10.0), QueryResult::NotReady);

        refresh(&mut source, 1);
        match source.ground_clamp(59.33, 18.12, 10.0) {
            QueryResult::Ready((position, normal)) => {
                assert_eq!(position.z, 22.0);
                assert_eq!(normal, Vec3::Z);
            }
            other => panic!("unexpected {:?}", other),
        }

        match source.intersect(DVec3::new(0.0, 0.0, 112.0), DVec3::NEG_Z, 1) {
            QueryResult::Ready(hits) => {
                assert_eq!(hits.len(), 1);
                assert_eq!(hits[0].distance, 100.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn stopped_loaders_stream_nothing_new() {
        let mut source = StaticSceneSource::new().with_map("demo://city", instanced_map());
        source.initialize(false).unwrap();
        source.set_loaders(0, false, false);
        source
            .add_map("demo://city", &mut FrameEmitter::new())
            .unwrap();

        let (structural, _) = refresh(&mut source, 1);
        assert!(structural.is_empty());

        source.set_loaders(2, true, false);
        let (structural, _) = refresh(&mut source, 2);
        assert_eq!(structural.len(), 5);
    }

    #[test]
    fn unknown_maps_are_errors() {
        let mut source = StaticSceneSource::new();
        source.initialize(false).unwrap();
        assert!(source.add_map("demo://nowhere", &mut FrameEmitter::new()).is_err());
    }
}
