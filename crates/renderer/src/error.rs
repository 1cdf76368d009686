use std::thread::ThreadId;

use crate::completion::Canceled;

/// A native graphics call that reported failure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed: {message}")]
pub struct ApiError {
    pub operation: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

/// Misuse of the graphics context: wrong thread, wrong lifecycle stage.
///
/// These indicate caller bugs rather than runtime conditions and abort the
/// operation that triggered them.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("graphics context is not initialized")]
    NotInitialized,
    #[error("graphics context is already initialized")]
    AlreadyInitialized,
    #[error("graphics context has been released")]
    Released,
    #[error("graphics context is owned by thread {owner:?} but was called from {caller:?}")]
    WrongThread { owner: ThreadId, caller: ThreadId },
    #[error("output surface {0} was never registered")]
    UnknownSurface(u64),
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, thiserror::Error)]
pub enum InitializationError {
    #[error("unable to obtain a graphics display: {0}")]
    Display(ApiError),
    #[error("no configuration matches the requested colour format: {0}")]
    Config(ApiError),
    #[error("unable to create graphics context: {0}")]
    Context(ApiError),
    #[error("unable to create placeholder surface: {0}")]
    Placeholder(ApiError),
    #[error("unable to build shader pipelines: {0}")]
    Pipeline(#[from] ShaderError),
    #[error(transparent)]
    Misuse(#[from] ContextError),
    #[error("render thread could not be started: {0}")]
    Thread(String),
    #[error("render thread stopped before initialization completed")]
    Canceled,
}

impl From<Canceled> for InitializationError {
    fn from(_: Canceled) -> Self {
        InitializationError::Canceled
    }
}

/// Stage a shader program was compiled for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ShaderError {
    #[error("failed to compile {stage:?} shader: {log}")]
    Compile { stage: ShaderStage, log: String },
    #[error("failed to attach shader program: {0}")]
    Attach(ApiError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("processor released before the shader was applied")]
    Released,
    #[error("shader request dropped before completion")]
    Dropped,
}

impl From<Canceled> for ShaderError {
    fn from(_: Canceled) -> Self {
        ShaderError::Dropped
    }
}

/// Failure delivered to a single snapshot request.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("no JPEG output surface is attached")]
    NoCaptureSurface,
    #[error("renderer released")]
    Released,
    #[error("renderer not ready")]
    NotReady,
    #[error("failed to render snapshot: {0}")]
    Render(String),
    #[error("failed to encode snapshot: {0}")]
    Encode(String),
    #[error("failed to write snapshot: {0}")]
    Io(String),
    #[error("snapshot request dropped before completion")]
    Dropped,
}

impl From<Canceled> for SnapshotError {
    fn from(_: Canceled) -> Self {
        SnapshotError::Dropped
    }
}

/// Writing to an output target failed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SurfaceWriteError {
    #[error("output target does not accept encoded images")]
    Unsupported,
    #[error("output target consumer is gone")]
    Disconnected,
}
