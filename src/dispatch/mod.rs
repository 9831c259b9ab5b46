//! The consumer half. A [`Dispatcher`] is ticked by the caller's own loop: it moves whatever the
//! producer has handed off into a private out-list and applies it under per-tick budgets, turning
//! node commands into proxies and responses into resolved requests.

pub mod requests;

use glam::{DVec3, Vec3};
use log::{debug, error, info, log, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::builder::{Builder, BuildProperties, ResourceManager};
use crate::commands::{
    Activation, BufferType, Command, CommandBuffer, CommandKind, DeleteMode, MessageLevel, RequestId,
};
use crate::dispatch::requests::{Continuation, PendingRequests, RequestError, RequestKind, RequestResult};
use crate::graph::{NodeRef, RenderState, SceneNode};
use crate::manager::SceneManager;
use crate::manager::queue::WaitResult;
use crate::registry::factory::FactoryRegistry;
use crate::registry::{PathIdentityRegistry, PathKey, ProxyHandle, Unregistered};
use crate::settings::DispatchSettings;

/// Telemetry hook for error messages coming from the producer.
pub trait ErrorSink: Send {
    fn report(&self, level: MessageLevel, message: &str, ref_id: Option<RequestId>);
}

impl<F> ErrorSink for F
where
    F: Fn(MessageLevel, &str, Option<RequestId>) + Send,
{
    fn report(&self, level: MessageLevel, message: &str, ref_id: Option<RequestId>) {
        self(level, message, ref_id)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub built: u64,
    pub destroyed: u64,
    pub activations: u64,
    /// Nodes of a type without visual representation.
    pub skipped: u64,
    pub registry_errors: u64,
    pub dispatch_errors: u64,
    pub errors_reported: u64,
    pub frames: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoInfo {
    pub coordinate_system: String,
    pub origin: DVec3,
}

/// Stands in for the consumer's scene root, proxies without a registered parent attach to it.
struct RootProxy;

impl Builder for RootProxy {
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

pub struct Dispatcher {
    manager: SceneManager,
    settings: DispatchSettings,
    factories: Arc<FactoryRegistry>,
    resources: Arc<dyn ResourceManager>,
    identities: PathIdentityRegistry,
    requests: PendingRequests,
    /// Buffers fetched from the manager, not applied yet.
    pending: VecDeque<CommandBuffer>,
    /// Applied buffers whose teardown lock was not available yet.
    graveyard: Vec<CommandBuffer>,
    root: ProxyHandle,
    /// Occurrences that were not registered on purpose, with the proxy their children attach to.
    passthrough: HashMap<PathKey, ProxyHandle>,
    stats: DispatchStats,
    render_time: f64,
    camera: (DVec3, Vec3),
    geo_info: Option<GeoInfo>,
    error_sink: Option<Box<dyn ErrorSink>>,
    epoch: Instant,
    first_run: bool,
    shut_down: bool,
}

impl Dispatcher {
    pub fn new(
        manager: SceneManager,
        factories: Arc<FactoryRegistry>,
        resources: Arc<dyn ResourceManager>,
        settings: DispatchSettings,
    ) -> Self {
        let (identities, root) = PathIdentityRegistry::with_root(Box::new(RootProxy));

        Self {
            manager,
            settings,
            factories,
            resources,
            identities,
            requests: PendingRequests::new(),
            pending: VecDeque::new(),
            graveyard: Vec::new(),
            root,
            passthrough: HashMap::new(),
            stats: DispatchStats::default(),
            render_time: 0.0,
            camera: (DVec3::ZERO, Vec3::ZERO),
            geo_info: None,
            error_sink: None,
            epoch: Instant::now(),
            first_run: true,
            shut_down: false,
        }
    }

    pub fn manager(&self) -> &SceneManager {
        &self.manager
    }

    pub fn identities(&self) -> &PathIdentityRegistry {
        &self.identities
    }

    pub fn factories(&self) -> &Arc<FactoryRegistry> {
        &self.factories
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn root(&self) -> ProxyHandle {
        self.root
    }

    /// Render time of the last frame that was applied.
    pub fn render_time(&self) -> f64 {
        self.render_time
    }

    /// Camera position and orientation of the last frame that was applied.
    pub fn frame_camera(&self) -> (DVec3, Vec3) {
        self.camera
    }

    pub fn geo_info(&self) -> Option<&GeoInfo> {
        self.geo_info.as_ref()
    }

    pub fn set_error_sink(&mut self, sink: impl ErrorSink + 'static) {
        self.error_sink = Some(Box::new(sink));
    }

    pub fn pending_buffers(&self) -> impl Iterator<Item = &CommandBuffer> {
        self.pending.iter()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    fn has_pending_frame(&self) -> bool {
        self.pending
            .iter()
            .any(|buffer| buffer.buffer_type() == BufferType::Frame)
    }

    /// Moves every buffer the producer has handed off into the out-list. With `wait_for_frame`,
    /// blocks for up to `timeout` until the out-list holds at least one frame.
    pub fn fetch_buffers(&mut self, wait_for_frame: bool, timeout: Duration) -> usize {
        profiling::scope!("Dispatcher::fetch_buffers");
        let deadline = Instant::now() + timeout;
        let mut drained = 0;

        loop {
            drained += self.take_outbox();

            if !wait_for_frame || self.has_pending_frame() {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }

            match self.manager.outbox().wait(deadline - now) {
                WaitResult::Ready => continue,
                WaitResult::TimedOut => {}
                WaitResult::Closed => {
                    drained += self.take_outbox();
                    debug!("The scene manager closed while waiting for a frame");
                    break;
                }
            }
        }

        if drained > 0 {
            trace!("Fetched {} buffers", drained);
        }
        drained
    }

    fn take_outbox(&mut self) -> usize {
        let mut fetched = VecDeque::new();
        let count = self.manager.outbox().drain_into(&mut fetched);
        for mut buffer in fetched {
            // node references must not be released while the producer traverses
            let delete_mode = match buffer.buffer_type() {
                BufferType::New | BufferType::Delete | BufferType::Frame => DeleteMode::EditLock,
                BufferType::Generic | BufferType::Error => DeleteMode::Unlocked,
            };
            buffer.set_delete_mode(delete_mode);
            self.pending.push_back(buffer);
        }
        count
    }

    /// Applies buffers in order until a budget runs out or a buffer cannot be locked. Whatever is
    /// left stays queued for the next call. Returns the number of buffers that were applied.
    pub fn process_pending_buffers(&mut self, max_frames: u32, max_builds: u32) -> u32 {
        profiling::scope!("Dispatcher::process_pending_buffers");
        self.retry_graveyard();

        let mut frames_left = max_frames;
        let mut builds_left = max_builds;
        let mut processed = 0;

        while let Some(mut buffer) = self.pending.pop_front() {
            let done = match buffer.buffer_type() {
                BufferType::Generic | BufferType::Error => {
                    self.apply_all(&mut buffer);
                    true
                }
                BufferType::Frame => {
                    if frames_left == 0 || !buffer.try_lock_render() {
                        false
                    } else {
                        self.apply_all(&mut buffer);
                        frames_left -= 1;
                        self.stats.frames += 1;
                        true
                    }
                }
                BufferType::New => {
                    if !buffer.try_lock_render() {
                        false
                    } else {
                        self.apply_budgeted(&mut buffer, &mut builds_left)
                    }
                }
                BufferType::Delete => {
                    if !buffer.try_lock_render() {
                        false
                    } else {
                        self.apply_all(&mut buffer);
                        true
                    }
                }
            };

            if !done {
                buffer.unlock();
                self.pending.push_front(buffer);
                break;
            }

            processed += 1;
            self.retire(buffer);
        }

        self.requests.expire(Instant::now());
        processed
    }

    /// One frame's worth of work: fetch, apply, and ask for the next refresh if a frame came in.
    pub fn tick(&mut self) -> u32 {
        profiling::scope!("Dispatcher::tick");
        if self.shut_down {
            return 0;
        }

        let fetch_timeout = self.settings.fetch_timeout;
        self.fetch_buffers(!fetch_timeout.is_zero(), fetch_timeout);

        let frames_before = self.stats.frames;
        let processed =
            self.process_pending_buffers(self.settings.max_frames_per_tick, self.settings.max_builds_per_tick);

        let frames = self.stats.frames - frames_before;
        if self.manager.state().accepts_commands() && (frames > 0 || self.first_run) {
            self.first_run = false;
            let time = self.epoch.elapsed().as_secs_f64();
            if let Err(err) = self.manager.refresh_scene(
                time,
                self.settings.viewport_width,
                self.settings.viewport_height,
                self.settings.screen_width,
            ) {
                debug!("Not refreshing: {}", err);
            }
        }

        processed
    }

    fn apply_all(&mut self, buffer: &mut CommandBuffer) {
        let mut applied = 0;
        for command in buffer.unprocessed() {
            self.apply(command);
            applied += 1;
        }
        buffer.mark_processed(applied);
    }

    /// Returns whether the buffer was applied completely.
    fn apply_budgeted(&mut self, buffer: &mut CommandBuffer, builds_left: &mut u32) -> bool {
        let mut applied = 0;
        for command in buffer.unprocessed() {
            if matches!(command.kind(), CommandKind::NewNode { .. }) {
                if *builds_left == 0 {
                    break;
                }
                *builds_left -= 1;
            }
            self.apply(command);
            applied += 1;
        }
        buffer.mark_processed(applied);
        buffer.is_processed()
    }

    fn apply(&mut self, command: &Command) {
        trace!("Applying {} ({})", command.name(), command.id());
        match command.kind() {
            CommandKind::NewNode {
                node,
                path_id,
                parent,
                parent_path_id,
                state,
            } => self.new_node(node, *path_id, parent.as_ref(), *parent_path_id, state.as_deref()),
            CommandKind::DeleteNode { node, path_id } => self.delete_node(node, *path_id),
            CommandKind::Activation {
                node,
                path_id,
                activation,
            } => self.activation(node, *path_id, *activation),
            CommandKind::StartFrame {
                refresh_id,
                render_time,
                position,
                hpr,
            } => {
                trace!("Frame {} at {:.3}", refresh_id, render_time);
                self.render_time = *render_time;
                self.camera = (*position, *hpr);
            }
            CommandKind::EndFrame { refresh_id } => trace!("Frame {} done", refresh_id),
            CommandKind::GeoInfo {
                coordinate_system,
                origin,
            } => {
                info!("Geo reference {} at {}", coordinate_system, origin);
                self.geo_info = Some(GeoInfo {
                    coordinate_system: coordinate_system.clone(),
                    origin: *origin,
                });
            }
            CommandKind::ErrorMessage {
                level,
                message,
                ref_id,
            } => self.report(*level, message, *ref_id),
            kind if kind.is_response() => {
                self.requests.resolve(kind);
            }
            other => debug!("{} has no meaning for the dispatcher", other.name()),
        }
    }

    fn new_node(
        &mut self,
        node: &NodeRef,
        path_id: u64,
        parent: Option<&NodeRef>,
        parent_path_id: u64,
        state: Option<&RenderState>,
    ) {
        let key = PathKey::of(node, path_id);
        if self.identities.contains(key) || self.passthrough.contains_key(&key) {
            warn!("NewNode for {} ({}), which is already registered", key, node.name());
            self.stats.registry_errors += 1;
            return;
        }

        let parent_handle = match parent {
            None => self.root,
            Some(parent) => {
                let parent_key = PathKey::of(parent, parent_path_id);
                match self
                    .identities
                    .lookup(parent_key)
                    .or_else(|| self.passthrough.get(&parent_key).copied())
                {
                    Some(handle) => handle,
                    None => {
                        warn!(
                            "Parent {} of {} is not registered, attaching to the root",
                            parent_key, key
                        );
                        self.root
                    }
                }
            }
        };

        let (mut proxy, factory) = match self.factories.create_proxy(node, parent_handle) {
            Ok(created) => created,
            Err(err) => {
                if self.settings.has_visual(node.type_name()) {
                    warn!("Cannot dispatch {} ({}): {}", key, node.name(), err);
                    self.stats.dispatch_errors += 1;
                } else {
                    trace!("Skipping {} ({}) without visual representation", key, node.name());
                    self.stats.skipped += 1;
                }
                self.passthrough.insert(key, parent_handle);
                return;
            }
        };

        factory.pre_build(node);
        let built = proxy.build(
            parent_handle,
            node,
            state,
            &self.settings.build_properties,
            self.resources.as_ref(),
        );
        if let Err(err) = built {
            warn!("Building {} ({}) failed: {:#}", key, node.name(), err);
            self.stats.dispatch_errors += 1;
            self.passthrough.insert(key, parent_handle);
            return;
        }

        match self
            .identities
            .register(key, Some(node.clone()), proxy, Some(factory))
        {
            Ok(_) => self.stats.built += 1,
            Err(err) => {
                warn!("{}", err);
                self.stats.registry_errors += 1;
            }
        }
    }

    fn delete_node(&mut self, node: &NodeRef, path_id: u64) {
        let key = PathKey::of(node, path_id);
        if self.passthrough.remove(&key).is_some() {
            return;
        }

        match self.identities.unregister(key) {
            Ok(unregistered) => self.destroy(unregistered),
            Err(err) => {
                warn!("DeleteNode for {} ({}): {}", key, node.name(), err);
                self.stats.registry_errors += 1;
            }
        }
    }

    fn activation(&mut self, node: &NodeRef, path_id: u64, activation: Activation) {
        let key = PathKey::of(node, path_id);
        if self.passthrough.contains_key(&key) {
            return;
        }

        match self.identities.set_activation(key, activation) {
            Ok(()) => self.stats.activations += 1,
            Err(err) => {
                warn!("Activation for {} ({}): {}", key, node.name(), err);
                self.stats.registry_errors += 1;
            }
        }
    }

    fn destroy(&mut self, mut unregistered: Unregistered) {
        let node = unregistered.node.as_ref();
        if let Err(err) = unregistered
            .proxy
            .destroy(node, self.resources.as_ref())
        {
            warn!("Destroying {} failed: {:#}", unregistered.key, err);
            self.stats.dispatch_errors += 1;
        }

        if let Some(factory) = &unregistered.factory {
            factory.post_destroy(node);
        }

        if unregistered.key != PathKey::ROOT {
            self.stats.destroyed += 1;
        }
    }

    fn report(&mut self, level: MessageLevel, message: &str, ref_id: Option<RequestId>) {
        match ref_id {
            Some(ref_id) => log!(level.log_level(), "Scene manager ({}): {}", ref_id, message),
            None => log!(level.log_level(), "Scene manager: {}", message),
        }
        self.stats.errors_reported += 1;

        if let Some(sink) = &self.error_sink {
            sink.report(level, message, ref_id);
        }

        if let Some(ref_id) = ref_id {
            self.requests.fail(
                ref_id,
                RequestError::Producer {
                    level,
                    message: message.to_string(),
                },
            );
        }
    }

    fn retire(&mut self, buffer: CommandBuffer) {
        if let Err(buffer) = buffer.teardown() {
            trace!("Parking {:?} until the scene lock is free", buffer);
            self.graveyard.push(buffer);
        }
    }

    fn retry_graveyard(&mut self) {
        if self.graveyard.is_empty() {
            return;
        }

        let parked = std::mem::take(&mut self.graveyard);
        self.graveyard = parked
            .into_iter()
            .filter_map(|buffer| buffer.teardown().err())
            .collect();
    }

    // Requests

    fn issue(
        &mut self,
        kind: RequestKind,
        on_done: Continuation,
        command: impl FnOnce(RequestId) -> CommandKind,
    ) -> RequestId {
        let id = self
            .requests
            .insert(kind, self.settings.request_timeout, on_done);
        if self.shut_down || self.manager.add_command_kind(command(id)).is_err() {
            self.requests.fail(id, RequestError::ManagerStopped);
        }
        id
    }

    pub fn request_camera_position<F>(&mut self, on_done: F) -> RequestId
    where
        F: FnOnce(RequestResult) + Send + 'static,
    {
        self.issue(RequestKind::CameraPosition, Box::new(on_done), |request_id| {
            CommandKind::RequestCameraPosition { request_id }
        })
    }

    pub fn request_ground_clamp_position<F>(
        &mut self,
        latitude: f64,
        longitude: f64,
        height_above_ground: f64,
        wait_for_data: bool,
        on_done: F,
    ) -> RequestId
    where
        F: FnOnce(RequestResult) + Send + 'static,
    {
        self.issue(RequestKind::GroundClamp, Box::new(on_done), |request_id| {
            CommandKind::RequestGroundClampPosition {
                request_id,
                latitude,
                longitude,
                height_above_ground,
                wait_for_data,
            }
        })
    }

    pub fn intersect<F>(&mut self, start: DVec3, direction: DVec3, wait_for_data: bool, mask: u32, on_done: F) -> RequestId
    where
        F: FnOnce(RequestResult) + Send + 'static,
    {
        self.issue(RequestKind::Intersect, Box::new(on_done), |request_id| {
            CommandKind::Intersect {
                request_id,
                start,
                direction,
                wait_for_data,
                mask,
            }
        })
    }

    /// Ticks until the request is resolved. Never waits longer than the request's own deadline.
    fn wait_for(&mut self, slot: Arc<Mutex<Option<RequestResult>>>) -> RequestResult {
        loop {
            if let Some(result) = slot.lock().expect("Request Slot Lock").take() {
                return result;
            }

            if self.requests.is_empty() {
                // resolved requests always fill the slot, so this one was dropped
                return Err(RequestError::ManagerStopped);
            }

            let now = Instant::now();
            let wait = self
                .requests
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(now))
                .unwrap_or(Duration::ZERO)
                .min(Duration::from_millis(5));
            if self.manager.outbox().wait(wait) == WaitResult::Closed && !self.manager.has_pending_buffers() {
                self.process_pending_buffers(u32::MAX, u32::MAX);
                self.requests.fail_all(RequestError::ManagerStopped);
                continue;
            }

            self.tick();
            self.requests.expire(Instant::now());
        }
    }

    fn blocking_slot() -> (Arc<Mutex<Option<RequestResult>>>, impl FnOnce(RequestResult) + Send + 'static) {
        let slot = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        (slot, move |result| {
            *sink.lock().expect("Request Slot Lock") = Some(result);
        })
    }

    pub fn request_camera_position_blocking(&mut self) -> RequestResult {
        let (slot, on_done) = Self::blocking_slot();
        self.request_camera_position(on_done);
        self.wait_for(slot)
    }

    pub fn request_ground_clamp_position_blocking(
        &mut self,
        latitude: f64,
        longitude: f64,
        height_above_ground: f64,
        wait_for_data: bool,
    ) -> RequestResult {
        let (slot, on_done) = Self::blocking_slot();
        self.request_ground_clamp_position(latitude, longitude, height_above_ground, wait_for_data, on_done);
        self.wait_for(slot)
    }

    pub fn intersect_blocking(&mut self, start: DVec3, direction: DVec3, wait_for_data: bool, mask: u32) -> RequestResult {
        let (slot, on_done) = Self::blocking_slot();
        self.intersect(start, direction, wait_for_data, mask, on_done);
        self.wait_for(slot)
    }

    /// The receiver resolves once the dispatcher has been ticked past the response or deadline.
    pub fn request_camera_position_async(&mut self) -> oneshot::Receiver<RequestResult> {
        let (sender, receiver) = oneshot::channel();
        self.request_camera_position(move |result| {
            let _ = sender.send(result);
        });
        receiver
    }

    pub fn request_ground_clamp_position_async(
        &mut self,
        latitude: f64,
        longitude: f64,
        height_above_ground: f64,
        wait_for_data: bool,
    ) -> oneshot::Receiver<RequestResult> {
        let (sender, receiver) = oneshot::channel();
        self.request_ground_clamp_position(latitude, longitude, height_above_ground, wait_for_data, move |result| {
            let _ = sender.send(result);
        });
        receiver
    }

    pub fn intersect_async(
        &mut self,
        start: DVec3,
        direction: DVec3,
        wait_for_data: bool,
        mask: u32,
    ) -> oneshot::Receiver<RequestResult> {
        let (sender, receiver) = oneshot::channel();
        self.intersect(start, direction, wait_for_data, mask, move |result| {
            let _ = sender.send(result);
        });
        receiver
    }

    /// Stops the producer, fails every outstanding request and destroys every live proxy, each
    /// exactly once. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        self.manager.shutdown();

        let failed = self.requests.fail_all(RequestError::ManagerStopped);
        if failed > 0 {
            debug!("Failed {} outstanding requests", failed);
        }

        // nobody holds the edit lock anymore, so these are released right away
        let discarded = self.pending.len() + self.manager.clear_command_buffer_out();
        if discarded > 0 {
            debug!("Discarding {} unprocessed buffers", discarded);
        }
        self.pending.clear();
        self.graveyard.clear();

        let live = self.identities.drain();
        info!("Destroying {} proxies", live.len().saturating_sub(1));
        for unregistered in live {
            self.destroy(unregistered);
        }
        self.passthrough.clear();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if !self.shut_down {
            self.shutdown();
        }
        if !self.graveyard.is_empty() {
            error!("Dropping {} parked buffers", self.graveyard.len());
        }
    }
}
