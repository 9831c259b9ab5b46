pub mod buffer;

use glam::{DVec3, Vec3};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::graph::{NodeRef, RenderState};

pub use buffer::{BufferType, CommandBuffer, DeleteMode, SceneLock};

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide, monotonically increasing command identity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(u64);

impl CommandId {
    fn next() -> Self {
        CommandId(NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl Display for CommandId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation id of a request, echoed by its response as `ref_id`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    Init,
    Off,
    On,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageLevel {
    Debug,
    Notice,
    Warning,
    Error,
    Fatal,
}

impl MessageLevel {
    pub fn log_level(self) -> log::Level {
        match self {
            MessageLevel::Debug => log::Level::Debug,
            MessageLevel::Notice => log::Level::Info,
            MessageLevel::Warning => log::Level::Warn,
            MessageLevel::Error | MessageLevel::Fatal => log::Level::Error,
        }
    }
}

/// Camera as known to the producer. Positions are in world space (double precision, as map
/// coordinates easily exceed what f32 can hold), `hpr` is heading/pitch/roll in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraState {
    pub position: DVec3,
    pub hpr: Vec3,
    pub fov_h: f32,
    pub fov_v: f32,
    pub near: f32,
    pub far: f32,
    pub infinite_far: bool,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            position: DVec3::ZERO,
            hpr: Vec3::ZERO,
            fov_h: 60.0,
            fov_v: 45.0,
            near: 1.0,
            far: 100_000.0,
            infinite_far: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub position: DVec3,
    pub normal: Vec3,
    pub distance: f64,
}

#[derive(Debug, Clone)]
pub enum CommandKind {
    // Lifecycle
    Initialize {
        create_default_viewer: bool,
    },
    UnInitialize,
    Shutdown,

    // Maps
    AddMap {
        url: String,
    },
    SetMapUrls {
        urls: Vec<String>,
    },
    RemoveObject {
        name: String,
    },
    ClearMaps,
    CenterMap {
        altitude: f64,
        hpr: Vec3,
    },

    // Render state
    SetRenderTime {
        time: f64,
    },
    SetOmniTraverse {
        enabled: bool,
    },
    SetLoaderCount {
        loaders: u32,
        run_loaders: bool,
        precache_textures: bool,
    },
    SetLodFactor {
        factor: f32,
    },
    SetCamera {
        camera: CameraState,
    },
    PositionCamera {
        position: DVec3,
        hpr: Vec3,
        fov_h: f32,
        fov_v: f32,
    },
    CameraSettings {
        near: f32,
        far: f32,
        infinite_far: bool,
    },
    RefreshScene {
        time: f64,
        size_x: u32,
        size_y: u32,
        screen_width: u32,
    },
    GeoInfo {
        coordinate_system: String,
        origin: DVec3,
    },

    // Graph lifecycle
    NewNode {
        node: NodeRef,
        path_id: u64,
        parent: Option<NodeRef>,
        parent_path_id: u64,
        state: Option<Arc<RenderState>>,
    },
    DeleteNode {
        node: NodeRef,
        path_id: u64,
    },
    Activation {
        node: NodeRef,
        path_id: u64,
        activation: Activation,
    },
    StartFrame {
        refresh_id: u64,
        render_time: f64,
        position: DVec3,
        hpr: Vec3,
    },
    EndFrame {
        refresh_id: u64,
    },

    // Requests
    RequestCameraPosition {
        request_id: RequestId,
    },
    RequestGroundClampPosition {
        request_id: RequestId,
        latitude: f64,
        longitude: f64,
        height_above_ground: f64,
        wait_for_data: bool,
    },
    Intersect {
        request_id: RequestId,
        start: DVec3,
        direction: DVec3,
        wait_for_data: bool,
        mask: u32,
    },

    // Responses
    CameraPositionResponse {
        ref_id: RequestId,
        position: DVec3,
        hpr: Vec3,
    },
    GroundClampPositionResponse {
        ref_id: RequestId,
        position: DVec3,
        normal: Vec3,
    },
    IntersectResponse {
        ref_id: RequestId,
        hits: Vec<Hit>,
    },
    ErrorMessage {
        level: MessageLevel,
        message: String,
        ref_id: Option<RequestId>,
    },
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Initialize { .. } => "Initialize",
            CommandKind::UnInitialize => "UnInitialize",
            CommandKind::Shutdown => "Shutdown",
            CommandKind::AddMap { .. } => "AddMap",
            CommandKind::SetMapUrls { .. } => "SetMapUrls",
            CommandKind::RemoveObject { .. } => "RemoveObject",
            CommandKind::ClearMaps => "ClearMaps",
            CommandKind::CenterMap { .. } => "CenterMap",
            CommandKind::SetRenderTime { .. } => "SetRenderTime",
            CommandKind::SetOmniTraverse { .. } => "SetOmniTraverse",
            CommandKind::SetLoaderCount { .. } => "SetLoaderCount",
            CommandKind::SetLodFactor { .. } => "SetLodFactor",
            CommandKind::SetCamera { .. } => "SetCamera",
            CommandKind::PositionCamera { .. } => "PositionCamera",
            CommandKind::CameraSettings { .. } => "CameraSettings",
            CommandKind::RefreshScene { .. } => "RefreshScene",
            CommandKind::GeoInfo { .. } => "GeoInfo",
            CommandKind::NewNode { .. } => "NewNode",
            CommandKind::DeleteNode { .. } => "DeleteNode",
            CommandKind::Activation { .. } => "Activation",
            CommandKind::StartFrame { .. } => "StartFrame",
            CommandKind::EndFrame { .. } => "EndFrame",
            CommandKind::RequestCameraPosition { .. } => "RequestCameraPosition",
            CommandKind::RequestGroundClampPosition { .. } => "RequestGroundClampPosition",
            CommandKind::Intersect { .. } => "Intersect",
            CommandKind::CameraPositionResponse { .. } => "CameraPositionResponse",
            CommandKind::GroundClampPositionResponse { .. } => "GroundClampPositionResponse",
            CommandKind::IntersectResponse { .. } => "IntersectResponse",
            CommandKind::ErrorMessage { .. } => "ErrorMessage",
        }
    }

    /// The correlation id of a response (or of an error message answering a request).
    pub fn ref_id(&self) -> Option<RequestId> {
        match self {
            CommandKind::CameraPositionResponse { ref_id, .. }
            | CommandKind::GroundClampPositionResponse { ref_id, .. }
            | CommandKind::IntersectResponse { ref_id, .. } => Some(*ref_id),
            CommandKind::ErrorMessage { ref_id, .. } => *ref_id,
            _ => None,
        }
    }

    /// The id a request is waiting under, if this is a request.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            CommandKind::RequestCameraPosition { request_id }
            | CommandKind::RequestGroundClampPosition { request_id, .. }
            | CommandKind::Intersect { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            CommandKind::CameraPositionResponse { .. }
                | CommandKind::GroundClampPositionResponse { .. }
                | CommandKind::IntersectResponse { .. }
        )
    }

    /// Whether the command keeps graph nodes alive, which makes the teardown of its buffer
    /// subject to the buffer's delete mode.
    pub fn references_nodes(&self) -> bool {
        matches!(
            self,
            CommandKind::NewNode { .. } | CommandKind::DeleteNode { .. } | CommandKind::Activation { .. }
        )
    }
}

/// An immutable command. The id is assigned on construction.
#[derive(Debug, Clone)]
pub struct Command {
    id: CommandId,
    kind: CommandKind,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            id: CommandId::next(),
            kind,
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    pub fn into_kind(self) -> CommandKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn ref_id(&self) -> Option<RequestId> {
        self.kind.ref_id()
    }

    pub fn is_response(&self) -> bool {
        self.kind.is_response()
    }

    pub fn references_nodes(&self) -> bool {
        self.kind.references_nodes()
    }
}

impl From<CommandKind> for Command {
    fn from(kind: CommandKind) -> Self {
        Command::new(kind)
    }
}
