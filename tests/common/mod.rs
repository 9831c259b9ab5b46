#![allow(dead_code)]

use glam::{DVec3, Vec3};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use scenesync::builder::MaterialCache;
use scenesync::commands::Hit;
use scenesync::demos::{self, ProxyCounter, register_logging_factories};
use scenesync::dispatch::Dispatcher;
use scenesync::manager::SceneManager;
use scenesync::registry::factory::FactoryRegistry;
use scenesync::settings::{DispatchSettings, ManagerSettings};
use scenesync::source::{FrameEmitter, QueryResult, RefreshContext, SceneSource, StaticSceneSource};

pub type Journal = Arc<Mutex<Vec<String>>>;

/// Failures a [`RecordingSource`] injects, one per call until the count runs out.
#[derive(Default)]
pub struct Faults {
    pub refresh_panics: AtomicUsize,
    pub refresh_errors: AtomicUsize,
    pub add_map_panics: AtomicUsize,
}

impl Faults {
    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok()
    }
}

/// Forwards to a [`StaticSceneSource`] with the demo city and writes down every call.
pub struct RecordingSource {
    inner: StaticSceneSource,
    journal: Journal,
    faults: Arc<Faults>,
}

impl RecordingSource {
    pub fn new() -> (Self, Journal) {
        let journal = Journal::default();
        let source = Self {
            inner: StaticSceneSource::new().with_map(demos::CITY_URL, demos::city()),
            journal: journal.clone(),
            faults: Arc::default(),
        };
        (source, journal)
    }

    pub fn with_faults(mut self, faults: Arc<Faults>) -> Self {
        self.faults = faults;
        self
    }

    fn record(&self, entry: impl Into<String>) {
        self.journal.lock().unwrap().push(entry.into());
    }
}

impl SceneSource for RecordingSource {
    fn initialize(&mut self, create_default_viewer: bool) -> anyhow::Result<()> {
        self.record(format!("initialize({})", create_default_viewer));
        self.inner.initialize(create_default_viewer)
    }

    fn uninitialize(&mut self) -> anyhow::Result<()> {
        self.record("uninitialize");
        self.inner.uninitialize()
    }

    fn add_map(&mut self, url: &str, emitter: &mut FrameEmitter) -> anyhow::Result<()> {
        self.record(format!("add_map({})", url));
        if Faults::take(&self.faults.add_map_panics) {
            panic!("{} is corrupt", url);
        }
        self.inner.add_map(url, emitter)
    }

    fn remove_map(&mut self, name: &str) -> anyhow::Result<bool> {
        self.record(format!("remove_map({})", name));
        self.inner.remove_map(name)
    }

    fn map_urls(&self) -> Vec<String> {
        self.inner.map_urls()
    }

    fn map_center(&self) -> Option<DVec3> {
        self.inner.map_center()
    }

    fn set_loaders(&mut self, loaders: u32, run_loaders: bool, precache_textures: bool) {
        self.record(format!("set_loaders({})", loaders));
        self.inner.set_loaders(loaders, run_loaders, precache_textures)
    }

    fn refresh(&mut self, ctx: &RefreshContext, emitter: &mut FrameEmitter) -> anyhow::Result<()> {
        self.record(format!(
            "refresh(omni={}, camera={})",
            ctx.settings.omni_traverse, ctx.settings.camera.position
        ));
        if Faults::take(&self.faults.refresh_panics) {
            panic!("refresh {} fell over", ctx.refresh_id);
        }
        if Faults::take(&self.faults.refresh_errors) {
            anyhow::bail!("refresh {} could not reach the tile server", ctx.refresh_id);
        }
        self.inner.refresh(ctx, emitter)
    }

    fn ground_clamp(&mut self, latitude: f64, longitude: f64, height_above_ground: f64) -> QueryResult<(DVec3, Vec3)> {
        self.record("ground_clamp");
        self.inner.ground_clamp(latitude, longitude, height_above_ground)
    }

    fn intersect(&mut self, start: DVec3, direction: DVec3, mask: u32) -> QueryResult<Vec<Hit>> {
        self.record("intersect");
        self.inner.intersect(start, direction, mask)
    }
}

pub struct Harness {
    pub dispatcher: Dispatcher,
    pub counter: Arc<ProxyCounter>,
    pub resources: Arc<MaterialCache>,
    pub journal: Journal,
    pub faults: Arc<Faults>,
}

pub fn harness(settings: DispatchSettings) -> Harness {
    let faults = Arc::new(Faults::default());
    let (source, journal) = RecordingSource::new();
    let source = source.with_faults(faults.clone());
    let manager = SceneManager::new(source, ManagerSettings::default());
    manager.run().expect("fresh manager");

    let factories = Arc::new(FactoryRegistry::new());
    let counter = Arc::new(ProxyCounter::default());
    register_logging_factories(&factories, counter.clone()).expect("fresh registry");

    let resources = Arc::new(MaterialCache::new());
    let dispatcher = Dispatcher::new(manager, factories, resources.clone(), settings);
    Harness {
        dispatcher,
        counter,
        resources,
        journal,
        faults,
    }
}

/// Fetches and applies until `done` holds, panicking after `timeout`.
pub fn pump_until(dispatcher: &mut Dispatcher, timeout: Duration, mut done: impl FnMut(&Dispatcher) -> bool) {
    let deadline = std::time::Instant::now() + timeout;
    while !done(dispatcher) {
        assert!(std::time::Instant::now() < deadline, "condition not reached within {:?}", timeout);
        dispatcher.fetch_buffers(true, Duration::from_millis(20));
        dispatcher.process_pending_buffers(u32::MAX, u32::MAX);
    }
}
