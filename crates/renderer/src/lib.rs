//! GPU effects engine for camera frame streams.
//!
//! A camera hands the engine an input surface to produce frames into and any
//! number of output surfaces to consume the result. Each frame is drawn
//! through a replaceable fragment effect into every output, and still
//! captures are served from the same frame on request:
//!
//! ```text
//!   camera ──InputFrame──▶ InputSurface ──post──▶ render thread
//!                                                    │ FrameRenderer
//!                                                    ├─▶ raster outputs (swap)
//!                                                    └─▶ SnapshotCoordinator ─▶ JPEG output
//! ```
//!
//! [`SurfaceProcessor`] is the thread-safe entry point. It owns a
//! [`RenderThreadExecutor`] whose single worker is the only thread that ever
//! touches GPU state; everything under [`gpu`] assumes it runs there. The
//! native API sits behind [`gpu::GraphicsApi`] with [`WgpuBackend`] as the
//! production implementation.

mod compile;
pub mod completion;
pub mod effects;
pub mod error;
pub mod executor;
pub mod gpu;
pub mod host;
pub mod matrix;
mod processor;
mod snapshot;
pub mod types;

pub use compile::{declared_properties, PropertyDecl, SamplerKind};
pub use completion::Completion;
pub use effects::{AttachCallback, Effect, FragmentShader, PreFrameCallback, PropertySetter};
pub use error::{
    ApiError, ContextError, InitializationError, ShaderError, SnapshotError, SurfaceWriteError,
};
pub use executor::{ExecutorHandle, RenderThreadExecutor};
pub use gpu::WgpuBackend;
pub use host::{
    image_target, DeliveredImage, FrameImage, ImageTarget, InputFrame, InputSurface, NativeWindow,
    OutputEvent, ProvidedSurface, RenderedFrame, SurfaceId, SurfaceOutput, SurfaceReply,
    SurfaceRequest, SurfaceRequestHandle, SurfaceResult, TransformationInfo,
};
pub use matrix::Mat4;
pub use processor::{ProcessorOptions, SurfaceProcessor};
pub use types::{BitDepth, DeviceInfo, DynamicRange, Encoding, InputFormat, OutputFormat, PropertyValue, Size};
