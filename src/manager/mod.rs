pub mod producer;
pub mod queue;

use arc_swap::ArcSwap;
use bitflags::bitflags;
use glam::{DVec3, Vec3};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use thiserror::Error;

use crate::commands::{BufferType, CameraState, Command, CommandBuffer, CommandKind, SceneLock};
use crate::manager::producer::Producer;
use crate::manager::queue::BufferQueue;
use crate::settings::ManagerSettings;
use crate::source::SceneSource;

bitflags! {
    /// Geometry processing the source may apply while streaming.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        const CONVERT_TO_TRIANGLE = 1 << 0;
        const OPTIMIZE_GEOMETRY = 1 << 1;
        const REMOVE_NAME = 1 << 2;
        const REMOVE_META_DATA = 1 << 3;
        const INDEX_GEOMETRY = 1 << 4;
        const REBUILD_INDEX_GEOMETRY = 1 << 5;
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ManagerState {
    Created = 0,
    Initializing = 1,
    Running = 2,
    ShuttingDown = 3,
    Stopped = 4,
}

impl ManagerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ManagerState::Created,
            1 => ManagerState::Initializing,
            2 => ManagerState::Running,
            3 => ManagerState::ShuttingDown,
            _ => ManagerState::Stopped,
        }
    }

    /// Whether commands are still accepted.
    pub fn accepts_commands(self) -> bool {
        self < ManagerState::ShuttingDown
    }
}

/// State the producer reads at the start of every refresh. The fast path setters write it
/// directly, bypassing the command queue.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSettings {
    pub render_time: f64,
    pub omni_traverse: bool,
    pub lod_factor: f32,
    pub camera: CameraState,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            render_time: 0.0,
            omni_traverse: false,
            lod_factor: 1.0,
            camera: CameraState::default(),
        }
    }
}

/// Listener for buffers on their way from the producer to the consumer. Called on the producer
/// thread, once per buffer, before the buffer is queued.
pub trait CommandReceiver: Send + Sync {
    fn on_command(&self, buffer: &CommandBuffer);
}

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("the scene manager has been stopped")]
    Stopped,
    #[error("the scene manager is already running")]
    AlreadyStarted,
    #[error("failed to spawn the scene manager thread")]
    ThreadSpawn(#[from] std::io::Error),
}

pub(crate) struct Shared {
    state: AtomicU8,
    /// Intents, consumer to producer.
    pub(crate) inbox: BufferQueue,
    /// Events and responses, producer to consumer.
    pub(crate) outbox: BufferQueue,
    receivers: RwLock<Vec<Arc<dyn CommandReceiver>>>,
    pub(crate) render: ArcSwap<RenderSettings>,
    capabilities: AtomicU32,
    pub(crate) lock: Arc<SceneLock>,
}

impl Shared {
    pub(crate) fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ManagerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn transition(&self, from: ManagerState, to: ManagerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn capabilities(&self) -> Capabilities {
        Capabilities::from_bits_truncate(self.capabilities.load(Ordering::Relaxed))
    }

    pub(crate) fn update_render<F>(&self, update: F)
    where
        F: Fn(&mut RenderSettings),
    {
        self.render.rcu(|current| {
            let mut next = RenderSettings::clone(current);
            update(&mut next);
            next
        });
    }

    /// Notifies the receivers and hands the buffer to the consumer.
    pub(crate) fn emit(&self, buffer: CommandBuffer) {
        {
            let receivers = self.receivers.read().expect("Receivers Read Lock");
            for receiver in receivers.iter() {
                receiver.on_command(&buffer);
            }
        }

        if let Err(buffer) = self.outbox.push(buffer) {
            debug!("Dropping {:?}, the consumer side is closed", buffer);
        }
    }
}

/// Owns the producer thread and both command queues.
pub struct SceneManager {
    shared: Arc<Shared>,
    settings: ManagerSettings,
    source: Mutex<Option<Box<dyn SceneSource>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SceneManager {
    pub fn new(source: impl SceneSource + 'static, settings: ManagerSettings) -> Self {
        let shared = Shared {
            state: AtomicU8::new(ManagerState::Created as u8),
            inbox: BufferQueue::new(),
            outbox: BufferQueue::new(),
            receivers: RwLock::new(Vec::new()),
            render: ArcSwap::from_pointee(RenderSettings::default()),
            capabilities: AtomicU32::new(settings.capabilities.bits()),
            lock: Arc::new(SceneLock::new()),
        };

        Self {
            shared: Arc::new(shared),
            settings,
            source: Mutex::new(Some(Box::new(source))),
            thread: Mutex::new(None),
        }
    }

    /// Starts the producer thread. Commands queued before are processed once it runs.
    pub fn run(&self) -> Result<(), ManagerError> {
        if !self
            .shared
            .transition(ManagerState::Created, ManagerState::Initializing)
        {
            return match self.state() {
                ManagerState::ShuttingDown | ManagerState::Stopped => Err(ManagerError::Stopped),
                _ => Err(ManagerError::AlreadyStarted),
            };
        }

        let source = self
            .source
            .lock()
            .expect("Source Lock")
            .take()
            .ok_or(ManagerError::AlreadyStarted)?;

        let producer = Producer::new(self.shared.clone(), source, self.settings.clone());
        let handle = std::thread::Builder::new()
            .name(self.settings.thread_name.clone())
            .spawn(move || producer.run());

        match handle {
            Ok(handle) => {
                *self.thread.lock().expect("Thread Lock") = Some(handle);
                info!("Scene manager started");
                Ok(())
            }
            Err(err) => {
                error!("Could not spawn the scene manager thread: {}", err);
                self.shared.set_state(ManagerState::Stopped);
                self.shared.inbox.close();
                self.shared.outbox.close();
                Err(ManagerError::ThreadSpawn(err))
            }
        }
    }

    /// Stops the producer and waits for it. Wakes everybody waiting on either queue. Idempotent.
    pub fn shutdown(&self) {
        if self.state() == ManagerState::Stopped {
            return;
        }

        self.shared.set_state(ManagerState::ShuttingDown);
        self.shared.inbox.close();

        let handle = self.thread.lock().expect("Thread Lock").take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("The scene manager thread panicked");
            }
        }

        self.shared.outbox.close();
        self.shared.set_state(ManagerState::Stopped);
        info!("Scene manager stopped");
    }

    pub fn state(&self) -> ManagerState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ManagerState::Running
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Hands a buffer to the producer. The buffer is owned by the manager from now on.
    pub fn add_command_buffer(&self, mut buffer: CommandBuffer) -> Result<(), ManagerError> {
        if !self.state().accepts_commands() {
            debug!("Ignoring {:?}, the scene manager is stopped", buffer);
            return Err(ManagerError::Stopped);
        }

        buffer.share_lock(self.shared.lock.clone());
        self.shared.inbox.push(buffer).map_err(|buffer| {
            debug!("Ignoring {:?}, the scene manager is stopped", buffer);
            ManagerError::Stopped
        })
    }

    pub fn add_single_command(&self, command: Command) -> Result<(), ManagerError> {
        self.add_command_buffer(CommandBuffer::single(BufferType::Generic, command))
    }

    pub(crate) fn add_command_kind(&self, kind: CommandKind) -> Result<(), ManagerError> {
        self.add_single_command(Command::new(kind))
    }

    /// Whether intents are waiting for the producer.
    pub fn has_pending_commands(&self) -> bool {
        !self.shared.inbox.is_empty()
    }

    /// Whether buffers are waiting for the consumer.
    pub fn has_pending_buffers(&self) -> bool {
        !self.shared.outbox.is_empty()
    }

    pub fn add_command_receiver(&self, receiver: Arc<dyn CommandReceiver>) {
        self.shared
            .receivers
            .write()
            .expect("Receivers Write Lock")
            .push(receiver);
    }

    pub fn remove_command_receiver(&self, receiver: &Arc<dyn CommandReceiver>) -> bool {
        let mut receivers = self.shared.receivers.write().expect("Receivers Write Lock");
        let before = receivers.len();
        receivers.retain(|registered| !Arc::ptr_eq(registered, receiver));
        if receivers.len() == before {
            warn!("Cannot remove command receiver, it was never added");
            return false;
        }
        true
    }

    /// Discards intents the producer has not picked up yet.
    pub fn clear_command_buffer_in(&self) -> usize {
        self.shared.inbox.clear()
    }

    /// Discards buffers the consumer has not fetched yet.
    pub fn clear_command_buffer_out(&self) -> usize {
        self.shared.outbox.clear()
    }

    pub(crate) fn outbox(&self) -> &BufferQueue {
        &self.shared.outbox
    }

    pub fn capabilities(&self) -> Capabilities {
        self.shared.capabilities()
    }

    pub fn enable_capabilities(&self, capabilities: Capabilities) {
        self.shared
            .capabilities
            .fetch_or(capabilities.bits(), Ordering::Relaxed);
    }

    pub fn disable_capabilities(&self, capabilities: Capabilities) {
        self.shared
            .capabilities
            .fetch_and(!capabilities.bits(), Ordering::Relaxed);
    }

    pub fn render_settings(&self) -> Arc<RenderSettings> {
        self.shared.render.load_full()
    }

    // Fast path: written straight into the render settings, not ordered with queued commands.

    /// Overwritten again by every `RefreshScene` the producer processes.
    pub fn set_render_time(&self, time: f64) {
        self.shared.update_render(|render| render.render_time = time);
    }

    /// Takes effect with the next refresh; occurrences already reported stay until it runs.
    pub fn set_omni_traverse(&self, enabled: bool) {
        self.shared
            .update_render(|render| render.omni_traverse = enabled);
    }

    pub fn set_lod_factor(&self, factor: f32) {
        self.shared.update_render(|render| render.lod_factor = factor);
    }

    pub fn set_camera(&self, camera: CameraState) {
        self.shared.update_render(|render| render.camera = camera);
    }

    /// Keeps near/far as they are, see [`SceneManager::camera_settings`].
    pub fn position_camera(&self, position: DVec3, hpr: Vec3, fov_h: f32, fov_v: f32) {
        self.shared.update_render(|render| {
            render.camera.position = position;
            render.camera.hpr = hpr;
            render.camera.fov_h = fov_h;
            render.camera.fov_v = fov_v;
        });
    }

    pub fn camera_settings(&self, near: f32, far: f32, infinite_far: bool) {
        self.shared.update_render(|render| {
            render.camera.near = near;
            render.camera.far = far;
            render.camera.infinite_far = infinite_far;
        });
    }

    // Queued: processed by the producer in order.

    pub fn initialize(&self, create_default_viewer: bool) -> Result<(), ManagerError> {
        self.add_command_kind(CommandKind::Initialize {
            create_default_viewer,
        })
    }

    pub fn uninitialize(&self) -> Result<(), ManagerError> {
        self.add_command_kind(CommandKind::UnInitialize)
    }

    pub fn add_map(&self, url: impl Into<String>) -> Result<(), ManagerError> {
        self.add_command_kind(CommandKind::AddMap { url: url.into() })
    }

    pub fn set_map_urls(&self, urls: Vec<String>) -> Result<(), ManagerError> {
        self.add_command_kind(CommandKind::SetMapUrls { urls })
    }

    pub fn remove_map(&self, name: impl Into<String>) -> Result<(), ManagerError> {
        self.add_command_kind(CommandKind::RemoveObject { name: name.into() })
    }

    pub fn clear_maps(&self) -> Result<(), ManagerError> {
        self.add_command_kind(CommandKind::ClearMaps)
    }

    pub fn center_map(&self, altitude: f64, hpr: Vec3) -> Result<(), ManagerError> {
        self.add_command_kind(CommandKind::CenterMap { altitude, hpr })
    }

    pub fn set_loader_count(&self, loaders: u32, run_loaders: bool, precache_textures: bool) -> Result<(), ManagerError> {
        self.add_command_kind(CommandKind::SetLoaderCount {
            loaders,
            run_loaders,
            precache_textures,
        })
    }

    pub fn refresh_scene(&self, time: f64, size_x: u32, size_y: u32, screen_width: u32) -> Result<(), ManagerError> {
        self.add_command_kind(CommandKind::RefreshScene {
            time,
            size_x,
            size_y,
            screen_width,
        })
    }
}

impl Drop for SceneManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
