use anyhow::anyhow;
use glam::DVec3;
use log::{debug, error, info, trace, warn};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::commands::{BufferType, Command, CommandBuffer, CommandKind, MessageLevel, RequestId, SceneLock};
use crate::manager::queue::WaitResult;
use crate::manager::{ManagerState, Shared};
use crate::settings::ManagerSettings;
use crate::source::{FrameEmitter, QueryResult, RefreshContext, SceneSource};
use crate::util::Backoff;

/// Groups consecutive commands of the same buffer type into one buffer, in emission order.
struct Outbound {
    lock: Arc<SceneLock>,
    sealed: Vec<CommandBuffer>,
    current: Option<CommandBuffer>,
}

impl Outbound {
    fn new(lock: Arc<SceneLock>) -> Self {
        Self {
            lock,
            sealed: Vec::new(),
            current: None,
        }
    }

    fn push(&mut self, buffer_type: BufferType, kind: CommandKind) {
        if self
            .current
            .as_ref()
            .is_some_and(|current| current.buffer_type() != buffer_type)
        {
            self.seal();
        }

        let lock = &self.lock;
        self.current
            .get_or_insert_with(|| CommandBuffer::with_lock(buffer_type, lock.clone()))
            .add_command(Command::new(kind), false);
    }

    fn push_buffer(&mut self, buffer: CommandBuffer) {
        self.seal();
        if buffer.has_commands() {
            self.sealed.push(buffer);
        }
    }

    fn error(&mut self, level: MessageLevel, message: String, ref_id: Option<RequestId>) {
        self.push(
            BufferType::Error,
            CommandKind::ErrorMessage {
                level,
                message,
                ref_id,
            },
        );
    }

    fn seal(&mut self) {
        if let Some(buffer) = self.current.take() {
            if buffer.has_commands() {
                self.sealed.push(buffer);
            }
        }
    }

    fn take(&mut self) -> Vec<CommandBuffer> {
        self.seal();
        std::mem::take(&mut self.sealed)
    }
}

#[derive(Debug, Clone)]
enum DeferredQuery {
    GroundClamp {
        request_id: RequestId,
        latitude: f64,
        longitude: f64,
        height_above_ground: f64,
    },
    Intersect {
        request_id: RequestId,
        start: DVec3,
        direction: DVec3,
        mask: u32,
    },
}

/// The background half of the scene manager. Lives on its own thread and is the only one to
/// touch the [`SceneSource`].
pub(crate) struct Producer {
    shared: Arc<Shared>,
    source: Box<dyn SceneSource>,
    settings: ManagerSettings,
    out: Outbound,
    deferred: Vec<DeferredQuery>,
    refresh_id: u64,
    initialized: bool,
    stop_requested: bool,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Producer {
    pub(crate) fn new(shared: Arc<Shared>, source: Box<dyn SceneSource>, settings: ManagerSettings) -> Self {
        let lock = shared.lock.clone();
        Self {
            shared,
            source,
            settings,
            out: Outbound::new(lock),
            deferred: Vec::new(),
            refresh_id: 0,
            initialized: false,
            stop_requested: false,
        }
    }

    pub(crate) fn run(mut self) {
        if !self
            .shared
            .transition(ManagerState::Initializing, ManagerState::Running)
        {
            info!("Scene manager stopped before it was running");
            self.finish();
            return;
        }

        let mut pending = VecDeque::new();
        loop {
            if self.stop_requested || !self.shared.state().accepts_commands() {
                info!("Scene manager shutting down");
                break;
            }

            match self.shared.inbox.wait(self.settings.idle_wait) {
                WaitResult::Closed => break,
                WaitResult::TimedOut => continue,
                WaitResult::Ready => {}
            }

            self.shared.inbox.drain_into(&mut pending);
            while let Some(mut buffer) = pending.pop_front() {
                if self.stop_requested || !self.shared.state().accepts_commands() {
                    debug!("Discarding {} unprocessed buffers", pending.len() + 1);
                    pending.clear();
                    break;
                }

                profiling::scope!("Producer::process_buffer");
                for command in buffer.drain() {
                    self.process_guarded(command);
                }
                self.flush();
            }
        }

        self.finish();
    }

    fn finish(&mut self) {
        if !self.deferred.is_empty() {
            debug!("Dropping {} deferred queries", self.deferred.len());
            self.deferred.clear();
        }

        if self.initialized {
            let source = &mut self.source;
            match catch_unwind(AssertUnwindSafe(|| source.uninitialize())) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("Uninitializing the scene source failed: {:#}", err),
                Err(payload) => error!(
                    "Uninitializing the scene source panicked: {}",
                    panic_message(payload.as_ref())
                ),
            }
            self.initialized = false;
        }

        self.flush();
        self.shared
            .transition(ManagerState::Running, ManagerState::ShuttingDown);
        self.shared.outbox.close();
    }

    fn flush(&mut self) {
        for buffer in self.out.take() {
            self.shared.emit(buffer);
        }
    }

    /// Failures never leave the thread: errors and panics become error messages for the consumer.
    fn process_guarded(&mut self, command: Command) {
        let name = command.name();
        let request_id = command.kind().request_id();
        trace!("Processing {} ({})", name, command.id());

        match catch_unwind(AssertUnwindSafe(|| self.process(command))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!("{} failed: {:#}", name, err);
                self.out
                    .error(MessageLevel::Error, format!("{} failed: {:#}", name, err), request_id);
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("{} panicked: {}", name, message);
                self.out
                    .error(MessageLevel::Fatal, format!("{} panicked: {}", name, message), request_id);
            }
        }
    }

    fn process(&mut self, command: Command) -> anyhow::Result<()> {
        match command.into_kind() {
            CommandKind::Initialize {
                create_default_viewer,
            } => {
                self.source.initialize(create_default_viewer)?;
                self.initialized = true;
            }
            CommandKind::UnInitialize => {
                self.unload(self.source.map_urls())?;
                // report the teardown before the source goes away
                let render_time = self.shared.render.load().render_time;
                self.refresh(render_time, 0, 0, 0)?;
                self.deferred.clear();
                self.source.uninitialize()?;
                self.initialized = false;
            }
            CommandKind::Shutdown => self.stop_requested = true,
            CommandKind::AddMap { url } => self.add_map(&url)?,
            CommandKind::SetMapUrls { urls } => {
                let current = self.source.map_urls();
                let stale = current
                    .iter()
                    .filter(|url| !urls.contains(url))
                    .cloned()
                    .collect();
                self.unload(stale)?;
                for url in urls.iter().filter(|url| !current.contains(url)) {
                    self.add_map(url)?;
                }
            }
            CommandKind::RemoveObject { name } => {
                if !self.source.remove_map(&name)? {
                    self.out
                        .error(MessageLevel::Notice, format!("No map named {} is loaded", name), None);
                }
            }
            CommandKind::ClearMaps => self.unload(self.source.map_urls())?,
            CommandKind::CenterMap { altitude, hpr } => {
                let center = self
                    .source
                    .map_center()
                    .ok_or_else(|| anyhow!("No maps are loaded to center on"))?;
                let position = center + DVec3::Z * altitude;
                self.shared.update_render(|render| {
                    render.camera.position = position;
                    render.camera.hpr = hpr;
                });
            }
            CommandKind::SetRenderTime { time } => self.shared.update_render(|render| render.render_time = time),
            CommandKind::SetOmniTraverse { enabled } => self
                .shared
                .update_render(|render| render.omni_traverse = enabled),
            CommandKind::SetLodFactor { factor } => self.shared.update_render(|render| render.lod_factor = factor),
            CommandKind::SetCamera { camera } => self.shared.update_render(|render| render.camera = camera),
            CommandKind::PositionCamera {
                position,
                hpr,
                fov_h,
                fov_v,
            } => self.shared.update_render(|render| {
                render.camera.position = position;
                render.camera.hpr = hpr;
                render.camera.fov_h = fov_h;
                render.camera.fov_v = fov_v;
            }),
            CommandKind::CameraSettings {
                near,
                far,
                infinite_far,
            } => self.shared.update_render(|render| {
                render.camera.near = near;
                render.camera.far = far;
                render.camera.infinite_far = infinite_far;
            }),
            CommandKind::SetLoaderCount {
                loaders,
                run_loaders,
                precache_textures,
            } => self
                .source
                .set_loaders(loaders, run_loaders, precache_textures),
            CommandKind::RefreshScene {
                time,
                size_x,
                size_y,
                screen_width,
            } => {
                self.shared.update_render(|render| render.render_time = time);
                self.refresh(time, size_x, size_y, screen_width)?;
            }
            CommandKind::RequestCameraPosition { request_id } => {
                let camera = self.shared.render.load().camera;
                self.out.push(
                    BufferType::Generic,
                    CommandKind::CameraPositionResponse {
                        ref_id: request_id,
                        position: camera.position,
                        hpr: camera.hpr,
                    },
                );
            }
            CommandKind::RequestGroundClampPosition {
                request_id,
                latitude,
                longitude,
                height_above_ground,
                wait_for_data,
            } => self.query(
                DeferredQuery::GroundClamp {
                    request_id,
                    latitude,
                    longitude,
                    height_above_ground,
                },
                wait_for_data,
            ),
            CommandKind::Intersect {
                request_id,
                start,
                direction,
                wait_for_data,
                mask,
            } => self.query(
                DeferredQuery::Intersect {
                    request_id,
                    start,
                    direction,
                    mask,
                },
                wait_for_data,
            ),
            other => {
                warn!("{} is not handled by the scene manager", other.name());
                self.out.error(
                    MessageLevel::Warning,
                    format!("{} is not handled by the scene manager", other.name()),
                    other.ref_id(),
                );
            }
        }
        Ok(())
    }

    fn add_map(&mut self, url: &str) -> anyhow::Result<()> {
        let mut emitter = FrameEmitter::new();
        let result = self.source.add_map(url, &mut emitter);
        // whatever was reported before a failure still counts
        self.pack(emitter);
        result
    }

    fn unload(&mut self, urls: Vec<String>) -> anyhow::Result<()> {
        for url in urls {
            if !self.source.remove_map(&url)? {
                debug!("Map {} was not loaded", url);
            }
        }
        Ok(())
    }

    /// Packs structural changes into a New and a Delete buffer; activations are dropped since they
    /// only make sense inside a frame.
    fn pack(&mut self, emitter: FrameEmitter) -> Vec<CommandKind> {
        let (structural, activations) = emitter.into_parts();
        let (new, delete): (Vec<_>, Vec<_>) = structural
            .into_iter()
            .partition(|(buffer_type, _)| *buffer_type == BufferType::New);

        for (buffer_type, kind) in new.into_iter().chain(delete) {
            self.out.push(buffer_type, kind);
        }
        self.out.seal();
        activations
    }

    /// Always ends in a Frame buffer, even if the lock could not be taken or the source failed,
    /// so the consumer keeps asking for refreshes.
    fn refresh(&mut self, time: f64, size_x: u32, size_y: u32, screen_width: u32) -> anyhow::Result<()> {
        profiling::scope!("Producer::refresh");
        self.refresh_id += 1;
        let refresh_id = self.refresh_id;

        let lock = self.shared.lock.clone();
        let backoff = Backoff::new(self.settings.edit_lock_attempts, self.settings.edit_lock_backoff);
        let mut guard = None;
        backoff.retry(|| {
            guard = lock.try_edit();
            guard.is_some()
        });

        let render = self.shared.render.load_full();
        let mut emitter = FrameEmitter::new();
        let result = match guard {
            None => Err(anyhow!("Could not obtain the edit lock for refresh {}", refresh_id)),
            Some(guard) => {
                let ctx = RefreshContext {
                    refresh_id,
                    time,
                    size_x,
                    size_y,
                    screen_width,
                    settings: &render,
                    capabilities: self.shared.capabilities(),
                };
                let source = &mut self.source;
                let result = catch_unwind(AssertUnwindSafe(|| source.refresh(&ctx, &mut emitter)))
                    .unwrap_or_else(|payload| {
                        Err(anyhow!(
                            "Scene source panicked during refresh {}: {}",
                            refresh_id,
                            panic_message(payload.as_ref())
                        ))
                    });
                drop(guard);
                result
            }
        };

        let activations = self.pack(emitter);
        let mut frame = CommandBuffer::with_lock(BufferType::Frame, lock.clone());
        frame.add_command(
            Command::new(CommandKind::StartFrame {
                refresh_id,
                render_time: time,
                position: render.camera.position,
                hpr: render.camera.hpr,
            }),
            false,
        );
        for kind in activations {
            frame.add_command(Command::new(kind), false);
        }
        frame.add_command(Command::new(CommandKind::EndFrame { refresh_id }), false);
        self.out.push_buffer(frame);

        self.retry_deferred();
        result
    }

    fn query(&mut self, query: DeferredQuery, wait_for_data: bool) {
        if let Some(query) = self.answer(query) {
            if wait_for_data {
                trace!("Deferring {:?} until data is available", query);
                self.deferred.push(query);
            } else {
                let message = match &query {
                    DeferredQuery::GroundClamp {
                        latitude, longitude, ..
                    } => format!("No data loaded for ground clamp at {}, {}", latitude, longitude),
                    DeferredQuery::Intersect { start, .. } => format!("No data loaded for intersection from {}", start),
                };
                self.out
                    .error(MessageLevel::Warning, message, Some(query.request_id()));
            }
        }
    }

    /// Answers the query if the source can. Hands it back if the data is not there yet.
    fn answer(&mut self, query: DeferredQuery) -> Option<DeferredQuery> {
        let request_id = query.request_id();
        let response = match &query {
            DeferredQuery::GroundClamp {
                latitude,
                longitude,
                height_above_ground,
                ..
            } => self
                .source
                .ground_clamp(*latitude, *longitude, *height_above_ground)
                .map(|(position, normal)| CommandKind::GroundClampPositionResponse {
                    ref_id: request_id,
                    position,
                    normal,
                }),
            DeferredQuery::Intersect {
                start, direction, mask, ..
            } => self
                .source
                .intersect(*start, *direction, *mask)
                .map(|hits| CommandKind::IntersectResponse {
                    ref_id: request_id,
                    hits,
                }),
        };

        match response {
            QueryResult::Ready(response) => {
                self.out.push(BufferType::Generic, response);
                None
            }
            QueryResult::Failed(message) => {
                self.out
                    .error(MessageLevel::Error, message, Some(request_id));
                None
            }
            QueryResult::NotReady => Some(query),
        }
    }

    fn retry_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }

        let deferred = std::mem::take(&mut self.deferred);
        for query in deferred {
            if let Some(query) = self.answer(query) {
                self.deferred.push(query);
            }
        }
    }
}

impl DeferredQuery {
    fn request_id(&self) -> RequestId {
        match self {
            DeferredQuery::GroundClamp { request_id, .. } | DeferredQuery::Intersect { request_id, .. } => *request_id,
        }
    }
}
