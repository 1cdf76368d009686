//! Surface endpoints exchanged with the camera framework.
//!
//! The camera side produces frames into an [`InputSurface`] it receives by
//! answering a [`SurfaceRequest`], and consumes rendered output through
//! [`SurfaceOutput`]s wrapping a [`NativeWindow`]. Every callback in here may
//! fire on an arbitrary thread; the processor re-posts the work it needs onto
//! its render thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::error::SurfaceWriteError;
use crate::matrix::Mat4;
use crate::types::{DynamicRange, OutputFormat, Size};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identity of a [`NativeWindow`], stable across clones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(u64);

impl SurfaceId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A window-system drawable the GPU can present into.
pub trait WindowTarget: HasWindowHandle + HasDisplayHandle + Send + Sync {}

impl<T> WindowTarget for T where T: HasWindowHandle + HasDisplayHandle + Send + Sync {}

/// Something a rendered frame can land in.
#[derive(Clone)]
pub struct NativeWindow {
    id: SurfaceId,
    kind: WindowKind,
}

#[derive(Clone)]
enum WindowKind {
    Window {
        target: Arc<dyn WindowTarget>,
        size: Size,
    },
    Image(ImageTarget),
}

impl NativeWindow {
    pub fn from_window(target: Arc<dyn WindowTarget>, size: Size) -> Self {
        Self {
            id: SurfaceId::next(),
            kind: WindowKind::Window { target, size },
        }
    }

    pub fn from_image_target(target: ImageTarget) -> Self {
        Self {
            id: SurfaceId::next(),
            kind: WindowKind::Image(target),
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn size(&self) -> Size {
        match &self.kind {
            WindowKind::Window { size, .. } => *size,
            WindowKind::Image(target) => target.size,
        }
    }

    pub fn window_target(&self) -> Option<&Arc<dyn WindowTarget>> {
        match &self.kind {
            WindowKind::Window { target, .. } => Some(target),
            WindowKind::Image(_) => None,
        }
    }

    pub fn image_target(&self) -> Option<&ImageTarget> {
        match &self.kind {
            WindowKind::Image(target) => Some(target),
            WindowKind::Window { .. } => None,
        }
    }

    /// Hands already-encoded image bytes to the consumer.
    pub fn write_encoded(&self, bytes: Vec<u8>) -> Result<(), SurfaceWriteError> {
        match &self.kind {
            WindowKind::Image(target) => target.deliver(DeliveredImage::Encoded(bytes)),
            WindowKind::Window { .. } => Err(SurfaceWriteError::Unsupported),
        }
    }
}

impl fmt::Debug for NativeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            WindowKind::Window { .. } => "window",
            WindowKind::Image(_) => "image",
        };
        f.debug_struct("NativeWindow")
            .field("id", &self.id)
            .field("kind", &kind)
            .field("size", &self.size())
            .finish()
    }
}

/// Frame rendered into an [`ImageTarget`], rows top to bottom.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedFrame {
    pub size: Size,
    pub timestamp_ns: i64,
    pub rgba: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveredImage {
    Frame(RenderedFrame),
    Encoded(Vec<u8>),
}

/// CPU-visible consumer, the producer end of an image reader queue.
#[derive(Clone, Debug)]
pub struct ImageTarget {
    size: Size,
    sender: Sender<DeliveredImage>,
}

/// Creates an image target and the receiver its consumer reads from.
pub fn image_target(size: Size) -> (ImageTarget, Receiver<DeliveredImage>) {
    let (sender, receiver) = unbounded();
    (ImageTarget { size, sender }, receiver)
}

impl ImageTarget {
    pub fn size(&self) -> Size {
        self.size
    }

    pub fn deliver(&self, image: DeliveredImage) -> Result<(), SurfaceWriteError> {
        self.sender
            .send(image)
            .map_err(|_| SurfaceWriteError::Disconnected)
    }
}

/// Pixel payload of a camera frame.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameImage {
    Rgba8 { size: Size, data: Vec<u8> },
    /// 8-bit luma plane plus interleaved half-resolution chroma.
    Nv12 { size: Size, y: Vec<u8>, uv: Vec<u8> },
    /// 10-bit samples in the high bits of 16-bit words, NV12 plane layout.
    P010 { size: Size, y: Vec<u16>, uv: Vec<u16> },
}

impl FrameImage {
    pub fn size(&self) -> Size {
        match self {
            FrameImage::Rgba8 { size, .. }
            | FrameImage::Nv12 { size, .. }
            | FrameImage::P010 { size, .. } => *size,
        }
    }
}

/// One camera frame queued into an [`InputSurface`].
///
/// `transform` maps quad texture coordinates into the uploaded image, whose
/// first row sits at `v = 0`.
#[derive(Clone, Debug, PartialEq)]
pub struct InputFrame {
    pub timestamp_ns: i64,
    pub transform: Mat4,
    pub image: FrameImage,
}

type FrameListener = Arc<dyn Fn() + Send + Sync>;

/// Producer endpoint handed to the camera.
#[derive(Clone)]
pub struct InputSurface {
    inner: Arc<InputShared>,
}

struct InputShared {
    resolution: Size,
    frames: (Sender<InputFrame>, Receiver<InputFrame>),
    listener: FrameListener,
    detached: AtomicBool,
}

impl InputSurface {
    pub(crate) fn new(resolution: Size, listener: FrameListener) -> Self {
        Self {
            inner: Arc::new(InputShared {
                resolution,
                frames: unbounded(),
                listener,
                detached: AtomicBool::new(false),
            }),
        }
    }

    pub fn resolution(&self) -> Size {
        self.inner.resolution
    }

    /// Queues a frame and notifies the processor. Returns `false` once the
    /// surface has been torn down.
    pub fn queue_frame(&self, frame: InputFrame) -> bool {
        if self.inner.detached.load(Ordering::Acquire) {
            return false;
        }
        if self.inner.frames.0.send(frame).is_err() {
            return false;
        }
        (self.inner.listener)();
        true
    }

    /// Takes the newest queued frame, discarding older ones.
    pub(crate) fn latch(&self) -> Option<InputFrame> {
        self.inner.frames.1.try_iter().last()
    }

    pub(crate) fn detach_listener(&self) {
        self.inner.detached.store(true, Ordering::Release);
        self.inner.frames.1.try_iter().for_each(drop);
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::Acquire)
    }
}

impl fmt::Debug for InputSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputSurface")
            .field("resolution", &self.inner.resolution)
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// Orientation facts the camera reports after a surface is provided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransformationInfo {
    pub rotation_degrees: u32,
    pub has_camera_transform: bool,
}

/// How an input surface's life ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceResult {
    /// The camera finished with the surface.
    Detached,
    /// The request was cancelled before or while the surface was in use.
    Cancelled,
}

/// Answer to a [`SurfaceRequest`], observed by the camera.
#[derive(Debug)]
pub enum SurfaceReply {
    Provided(ProvidedSurface),
    Declined,
}

type ResultCallback = Box<dyn FnOnce(SurfaceResult) + Send>;
type TransformationListener = Arc<dyn Fn(TransformationInfo) + Send + Sync>;

#[derive(Default)]
struct RequestState {
    cancelled: bool,
    on_result: Option<ResultCallback>,
    listener: Option<TransformationListener>,
    transformation: Option<TransformationInfo>,
}

struct RequestShared {
    state: Mutex<RequestState>,
}

impl RequestShared {
    /// Ends the request: the orientation listener is dropped and the result
    /// callback runs if it has not already.
    fn settle(&self, result: SurfaceResult) {
        let callback = {
            let mut state = lock(&self.state);
            if result == SurfaceResult::Cancelled {
                state.cancelled = true;
            }
            state.listener = None;
            state.on_result.take()
        };
        if let Some(callback) = callback {
            callback(result);
        }
    }
}

/// Camera request for a surface to draw frames into.
pub struct SurfaceRequest {
    resolution: Size,
    dynamic_range: DynamicRange,
    reply: Sender<SurfaceReply>,
    shared: Arc<RequestShared>,
}

/// Camera-side handle for a [`SurfaceRequest`] in flight.
pub struct SurfaceRequestHandle {
    reply: Receiver<SurfaceReply>,
    shared: Arc<RequestShared>,
}

impl SurfaceRequest {
    pub fn new(resolution: Size, dynamic_range: DynamicRange) -> (Self, SurfaceRequestHandle) {
        let (reply, reply_rx) = bounded(1);
        let shared = Arc::new(RequestShared {
            state: Mutex::new(RequestState::default()),
        });
        (
            Self {
                resolution,
                dynamic_range,
                reply,
                shared: Arc::clone(&shared),
            },
            SurfaceRequestHandle {
                reply: reply_rx,
                shared,
            },
        )
    }

    pub fn resolution(&self) -> Size {
        self.resolution
    }

    pub fn dynamic_range(&self) -> DynamicRange {
        self.dynamic_range
    }

    /// Installs the orientation listener, replaying the last known info.
    pub fn set_transformation_listener(
        &self,
        listener: impl Fn(TransformationInfo) + Send + Sync + 'static,
    ) {
        let listener: TransformationListener = Arc::new(listener);
        let replay = {
            let mut state = lock(&self.shared.state);
            state.listener = Some(Arc::clone(&listener));
            state.transformation
        };
        if let Some(info) = replay {
            listener(info);
        }
    }

    /// Hands `surface` to the camera. `on_result` fires exactly once when
    /// the surface is detached or the request is cancelled, immediately if
    /// cancellation already happened. Either way the orientation listener is
    /// dropped with it.
    pub fn provide_surface(
        self,
        surface: InputSurface,
        on_result: impl FnOnce(SurfaceResult) + Send + 'static,
    ) {
        let cancelled = {
            let mut state = lock(&self.shared.state);
            if !state.cancelled {
                state.on_result = Some(Box::new(on_result));
                None
            } else {
                state.listener = None;
                Some(on_result)
            }
        };
        match cancelled {
            Some(on_result) => on_result(SurfaceResult::Cancelled),
            None => {
                let _ = self.reply.send(SurfaceReply::Provided(ProvidedSurface {
                    surface,
                    shared: self.shared,
                }));
            }
        }
    }

    pub fn will_not_provide_surface(self) {
        let _ = self.reply.send(SurfaceReply::Declined);
    }
}

impl fmt::Debug for SurfaceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceRequest")
            .field("resolution", &self.resolution)
            .field("dynamic_range", &self.dynamic_range)
            .finish()
    }
}

impl SurfaceRequestHandle {
    /// Blocks until the processor provides or declines. `None` if the request
    /// was dropped unanswered.
    pub fn wait(&self) -> Option<SurfaceReply> {
        self.reply.recv().ok()
    }

    pub fn try_reply(&self) -> Option<SurfaceReply> {
        self.reply.try_recv().ok()
    }

    pub fn cancel(&self) {
        self.shared.settle(SurfaceResult::Cancelled);
    }

    pub fn update_transformation(&self, info: TransformationInfo) {
        let listener = {
            let mut state = lock(&self.shared.state);
            state.transformation = Some(info);
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener(info);
        }
    }
}

/// A surface the processor handed to the camera.
pub struct ProvidedSurface {
    surface: InputSurface,
    shared: Arc<RequestShared>,
}

impl ProvidedSurface {
    pub fn surface(&self) -> &InputSurface {
        &self.surface
    }

    /// The camera is done with the surface.
    pub fn detach(self) {
        self.shared.settle(SurfaceResult::Detached);
    }
}

impl fmt::Debug for ProvidedSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvidedSurface")
            .field("surface", &self.surface)
            .finish()
    }
}

/// Events the camera raises against an output it handed over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputEvent {
    CloseRequested,
}

type OutputListener = Arc<dyn Fn(OutputEvent) + Send + Sync>;

/// An output endpoint handed to the processor by the camera.
#[derive(Clone)]
pub struct SurfaceOutput {
    inner: Arc<OutputShared>,
}

struct OutputShared {
    window: NativeWindow,
    format: OutputFormat,
    transform: Mat4,
    close_calls: AtomicUsize,
    closed: AtomicBool,
    listener: Mutex<Option<OutputListener>>,
    on_closed: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl SurfaceOutput {
    /// `transform` is applied after the input texture transform.
    pub fn new(window: NativeWindow, format: OutputFormat, transform: Mat4) -> Self {
        Self {
            inner: Arc::new(OutputShared {
                window,
                format,
                transform,
                close_calls: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                listener: Mutex::new(None),
                on_closed: Mutex::new(None),
            }),
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.inner.format
    }

    pub fn size(&self) -> Size {
        self.inner.window.size()
    }

    pub fn id(&self) -> SurfaceId {
        self.inner.window.id()
    }

    /// Returns the drawable and subscribes `listener` to output events.
    pub fn surface(&self, listener: impl Fn(OutputEvent) + Send + Sync + 'static) -> NativeWindow {
        *lock(&self.inner.listener) = Some(Arc::new(listener));
        self.inner.window.clone()
    }

    /// Combines the input texture transform with this output's own.
    pub fn update_transform_matrix(&self, texture_matrix: &Mat4) -> Mat4 {
        texture_matrix.multiply(&self.inner.transform)
    }

    /// Camera-side hook run the first time the processor closes the output.
    pub fn on_closed(&self, callback: impl FnOnce() + Send + 'static) {
        *lock(&self.inner.on_closed) = Some(Box::new(callback));
    }

    /// Camera side: asks the processor to stop using this output.
    pub fn request_close(&self) {
        let listener = lock(&self.inner.listener).clone();
        if let Some(listener) = listener {
            listener(OutputEvent::CloseRequested);
        }
    }

    pub fn close(&self) {
        self.inner.close_calls.fetch_add(1, Ordering::AcqRel);
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *lock(&self.inner.listener) = None;
        let callback = lock(&self.inner.on_closed).take();
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of times `close` was invoked, including redundant calls.
    pub fn close_calls(&self) -> usize {
        self.inner.close_calls.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SurfaceOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceOutput")
            .field("window", &self.inner.window)
            .field("format", &self.inner.format)
            .field("closed", &self.is_closed())
            .finish()
    }
}
