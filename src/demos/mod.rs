//! A small hand-made city and proxies that only log what they would build. Used by the binary
//! and the integration tests.

use glam::{DVec3, Vec4};
use log::{debug, trace};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::builder::{BuildProperties, Builder, Material, MaterialKind, ResourceManager};
use crate::commands::Activation;
use crate::graph::types::{GEOMETRY, GROUP, LIGHT, LOD, SWITCH, TEXT, TRANSFORM};
use crate::graph::{GraphNode, NodeRef, RenderState, SceneNode};
use crate::registry::ProxyHandle;
use crate::registry::factory::{FactoryError, FactoryRegistry, ProxyFactory};
use crate::source::StaticMap;

pub const CITY_URL: &str = "demo://city";

fn state(base_color: Vec4, texture: Option<&str>) -> Arc<RenderState> {
    Arc::new(RenderState {
        base_color,
        texture: texture.map(str::to_string),
        ..RenderState::default()
    })
}

fn house(name: &str) -> Arc<GraphNode> {
    let house = GraphNode::new(name, &TRANSFORM);
    let brick = state(Vec4::new(0.7, 0.3, 0.2, 1.0), Some("brick.png"));
    house.add_child(GraphNode::with_state("walls", &GEOMETRY, brick));
    house.add_child(GraphNode::with_state(
        "roof",
        &GEOMETRY,
        state(Vec4::new(0.3, 0.3, 0.3, 1.0), Some("tiles.png")),
    ));

    let windows = Arc::new(RenderState {
        base_color: Vec4::new(0.6, 0.8, 1.0, 0.4),
        transparent: true,
        ..RenderState::default()
    });
    house.add_child(GraphNode::with_state("windows", &GEOMETRY, windows));
    house
}

/// Two streets sharing one house instance, a switched traffic light and a LOD'd tower.
pub fn city() -> StaticMap {
    let root = GraphNode::new("city", &GROUP);
    let ground = GraphNode::with_state("ground", &GEOMETRY, state(Vec4::new(0.2, 0.5, 0.2, 1.0), Some("grass.png")));
    root.add_child(ground);

    let house = house("house");
    for street in ["main street", "harbour road"] {
        let block = GraphNode::new(street, &TRANSFORM);
        block.add_child(house.clone());
        block.add_child(GraphNode::with_state(
            format!("{} sign", street),
            &TEXT,
            Arc::new(RenderState {
                unlit: true,
                ..RenderState::default()
            }),
        ));
        root.add_child(block);
    }

    let traffic_light = GraphNode::new("traffic light", &SWITCH);
    for color in ["red", "green"] {
        traffic_light.add_child(GraphNode::new(format!("{} lamp", color), &LIGHT));
    }
    root.add_child(traffic_light);

    let tower = GraphNode::new("tower", &LOD);
    tower.add_child(GraphNode::with_state("tower high", &GEOMETRY, state(Vec4::ONE, Some("tower.png"))));
    tower.add_child(GraphNode::with_state("tower low", &GEOMETRY, state(Vec4::ONE, None)));
    root.add_child(tower);

    let mut map = StaticMap::new(root);
    map.coordinate_system = "EPSG:3006".to_string();
    map.origin = DVec3::new(336424.0, -6580704.0, 0.0);
    map.ground_height = 12.5;
    map
}

/// Counts proxies across all [`LoggingFactory`] instances that share it.
#[derive(Debug, Default)]
pub struct ProxyCounter {
    built: AtomicUsize,
    destroyed: AtomicUsize,
}

impl ProxyCounter {
    pub fn built(&self) -> usize {
        self.built.load(Ordering::Acquire)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn live(&self) -> usize {
        self.built() - self.destroyed()
    }
}

pub struct LoggingFactory {
    kind: &'static str,
    counter: Arc<ProxyCounter>,
}

impl LoggingFactory {
    pub fn new(kind: &'static str, counter: Arc<ProxyCounter>) -> Self {
        Self { kind, counter }
    }
}

impl ProxyFactory for LoggingFactory {
    fn create(&self, node: &NodeRef, _parent: ProxyHandle) -> Box<dyn Builder> {
        trace!("Creating {} proxy for {}", self.kind, node.name());
        Box::new(LoggingProxy {
            kind: self.kind,
            counter: self.counter.clone(),
            material: None,
            active: false,
        })
    }
}

struct LoggingProxy {
    kind: &'static str,
    counter: Arc<ProxyCounter>,
    material: Option<Arc<Material>>,
    active: bool,
}

impl Builder for LoggingProxy {
    fn build(
        &mut self,
        parent: ProxyHandle,
        node: &NodeRef,
        state: Option<&RenderState>,
        props: &BuildProperties,
        resources: &dyn ResourceManager,
    ) -> anyhow::Result<()> {
        if self.kind != "light" {
            let kind = MaterialKind::for_state(state);
            self.material = Some(resources.material(node.id(), state, kind));
        }

        debug!(
            "Built {} {:?} ({}) below {:?} at scale {}",
            self.kind,
            node.name(),
            node.id(),
            parent,
            props.world_scale
        );
        self.counter.built.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn destroy(&mut self, node: Option<&NodeRef>, _resources: &dyn ResourceManager) -> anyhow::Result<()> {
        self.material = None;
        debug!(
            "Destroyed {} {:?}",
            self.kind,
            node.map(|node| node.name()).unwrap_or("<root>")
        );
        self.counter.destroyed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn set_activation(&mut self, activation: Activation) {
        self.active = activation == Activation::On;
        trace!("{} proxy active: {}", self.kind, self.active);
    }
}

/// Geometry (and text through its parent type), transforms and lights. Groups, LODs and switches
/// stay without a factory.
pub fn register_logging_factories(factories: &FactoryRegistry, counter: Arc<ProxyCounter>) -> Result<(), FactoryError> {
    factories.register_factory(TRANSFORM.name(), Arc::new(LoggingFactory::new("transform", counter.clone())))?;
    factories.register_factory(GEOMETRY.name(), Arc::new(LoggingFactory::new("geometry", counter.clone())))?;
    factories.register_factory(LIGHT.name(), Arc::new(LoggingFactory::new("light", counter)))?;
    Ok(())
}
