//! Thread-safe façade over the render thread.
//!
//! `SurfaceProcessor` is what the camera side talks to. Every method posts a
//! task to the processor's own [`RenderThreadExecutor`] and returns right
//! away, or hands back a [`Completion`] for results that arrive later. All
//! GPU state lives in [`ProcessorCore`], which only the render thread touches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use image::RgbaImage;
use tracing::{debug, error, info, trace, warn};

use crate::completion::{self, Completion};
use crate::effects::{Effect, FragmentShader};
use crate::error::{InitializationError, ShaderError, SnapshotError};
use crate::executor::{ExecutorHandle, RenderThreadExecutor};
use crate::gpu::{FrameRenderer, GraphicsApi, OutputRender, WgpuBackend};
use crate::host::{InputSurface, NativeWindow, OutputEvent, SurfaceId, SurfaceOutput, SurfaceRequest};
use crate::matrix::Mat4;
use crate::snapshot::{PendingSnapshot, SnapshotCoordinator};
use crate::types::{DeviceInfo, DynamicRange, InputFormat, OutputFormat, PropertyValue, Size};

/// Construction options for [`SurfaceProcessor`].
#[derive(Clone, Debug)]
pub struct ProcessorOptions {
    /// Range the camera stream was negotiated with. 10-bit HDR requests fall
    /// back to SDR when the device cannot sample 10-bit YUV.
    pub dynamic_range: DynamicRange,
    /// Name given to the render thread.
    pub thread_name: String,
    /// Effect active until the first `set_fragment_shader`.
    pub initial_effect: Effect,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            dynamic_range: DynamicRange::SDR,
            thread_name: "shaderlens-render".to_string(),
            initial_effect: Effect::Passthrough,
        }
    }
}

/// Applies camera frames through a fragment effect into registered outputs.
pub struct SurfaceProcessor {
    executor: RenderThreadExecutor<ProcessorCore>,
    release_requested: Arc<AtomicBool>,
    device_info: DeviceInfo,
    dynamic_range: DynamicRange,
}

impl SurfaceProcessor {
    /// Starts a processor on the default `wgpu` backend.
    pub fn new(options: ProcessorOptions) -> Result<Self, InitializationError> {
        Self::with_backend(Box::new(WgpuBackend::new()), options)
    }

    /// Starts the render thread, initializes the renderer on it and blocks
    /// until that finished.
    pub fn with_backend(
        gl: Box<dyn GraphicsApi>,
        options: ProcessorOptions,
    ) -> Result<Self, InitializationError> {
        let release_requested = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&release_requested);
        let executor = RenderThreadExecutor::spawn(&options.thread_name, move |handle| {
            ProcessorCore::new(FrameRenderer::new(gl), handle, flag)
        })
        .map_err(|error| InitializationError::Thread(error.to_string()))?;

        let (completer, completion) = completion::channel::<_, InitializationError>();
        let range = options.dynamic_range;
        let shader = FragmentShader::from(options.initial_effect);
        executor.execute(
            move |core: &mut ProcessorCore| {
                let result = core
                    .renderer
                    .init(range, shader)
                    .map(|info| (info, core.renderer.dynamic_range()));
                completer.complete(result);
            },
            || {},
        );

        match completion.wait() {
            Ok((device_info, dynamic_range)) => {
                info!(
                    gl = %device_info.gl_version,
                    backend = %device_info.egl_version,
                    range = %dynamic_range,
                    "surface processor ready"
                );
                Ok(Self {
                    executor,
                    release_requested,
                    device_info,
                    dynamic_range,
                })
            }
            Err(error) => {
                release_requested.store(true, Ordering::Release);
                executor.execute(|core: &mut ProcessorCore| core.teardown(), || {});
                executor.join();
                Err(error)
            }
        }
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    /// Range actually in use after any HDR downgrade.
    pub fn dynamic_range(&self) -> DynamicRange {
        self.dynamic_range
    }

    pub fn is_release_requested(&self) -> bool {
        self.release_requested.load(Ordering::Acquire)
    }

    /// Answers a camera request for an input surface.
    ///
    /// Declines right away once release was requested. Otherwise the surface
    /// is created on the render thread; its teardown runs once the camera
    /// detaches it or cancels the request, whichever comes first.
    pub fn on_input_surface(&self, request: SurfaceRequest) {
        if self.is_release_requested() {
            debug!(?request, "declining input surface after release");
            request.will_not_provide_surface();
            return;
        }
        dispatch(
            &self.executor.handle(),
            request,
            |core, request| core.attach_input(request),
            SurfaceRequest::will_not_provide_surface,
        );
    }

    /// Takes ownership of an output. It is closed immediately after release,
    /// otherwise when the camera asks for it back or the processor shuts down.
    pub fn on_output_surface(&self, output: SurfaceOutput) {
        if self.is_release_requested() {
            output.close();
            return;
        }
        dispatch(
            &self.executor.handle(),
            output,
            |core, output| core.attach_output(output),
            |output| output.close(),
        );
    }

    /// Replaces the effect. The completion resolves once every pipeline runs
    /// the new shader, or with the error that left the previous one in place.
    pub fn set_fragment_shader(&self, shader: impl Into<FragmentShader>) -> Completion<(), ShaderError> {
        let (completer, completion) = completion::channel();
        if self.is_release_requested() {
            completer.reject(ShaderError::Released);
            return completion;
        }
        dispatch(
            &self.executor.handle(),
            (shader.into(), completer),
            |core, (shader, completer)| {
                let result = core.renderer.set_fragment_shader(shader);
                if let Err(error) = &result {
                    warn!(%error, "fragment shader rejected");
                }
                completer.complete(result);
            },
            |(_, completer)| completer.reject(ShaderError::Released),
        );
        completion
    }

    /// Sets a shader property on the render thread. Unknown names and type
    /// mismatches are ignored.
    pub fn set_property(&self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        let name = name.into();
        let value = value.into();
        dispatch(
            &self.executor.handle(),
            (name, value),
            |core, (name, value)| {
                if let Err(error) = core.renderer.set_property(&name, value) {
                    warn!(name = %name, %error, "failed to set property");
                }
            },
            |(name, _)| trace!(name = %name, "property dropped after release"),
        );
    }

    /// Requests a JPEG still rotated clockwise by `rotation_degrees`, written
    /// into the JPEG output. It is taken from the next frame the render
    /// thread latches after the request arrives.
    pub fn snapshot(&self, quality: u8, rotation_degrees: u32) -> Completion<(), SnapshotError> {
        let (completer, completion) = completion::channel();
        if self.is_release_requested() {
            completer.reject(SnapshotError::Released);
            return completion;
        }
        dispatch(
            &self.executor.handle(),
            PendingSnapshot::new(quality, rotation_degrees, completer),
            |core, request| core.request_snapshot(request),
            |request| request.reject(SnapshotError::Released),
        );
        completion
    }

    /// Begins shutdown. Only the first call has an effect.
    ///
    /// Teardown waits until every input surface has been detached; then all
    /// outputs are closed, outstanding snapshots are rejected, GPU objects are
    /// deleted and the render thread exits.
    pub fn release(&self) {
        if self.release_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("surface processor release requested");
        self.executor.execute(
            |core: &mut ProcessorCore| {
                core.released = true;
                core.check_ready_to_release();
            },
            || {},
        );
    }

    /// Blocks until the render thread has exited. Returns immediately when
    /// called from the render thread.
    pub fn wait_for_release(&self) {
        self.executor.join();
    }

    #[cfg(test)]
    fn inspect<R: Send + 'static>(&self, f: impl FnOnce(&mut ProcessorCore) -> R + Send + 'static) -> Option<R> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.executor.execute(
            move |core: &mut ProcessorCore| {
                let _ = tx.send(f(core));
            },
            || {},
        );
        rx.recv().ok()
    }
}

impl Drop for SurfaceProcessor {
    fn drop(&mut self) {
        self.release();
    }
}

/// Posts `task` with `payload`. If the processor was released by the time
/// it runs, or the executor refuses it, `on_rejected` gets the payload.
fn dispatch<T, F, R>(executor: &ExecutorHandle<ProcessorCore>, payload: T, task: F, on_rejected: R)
where
    T: Send + 'static,
    F: FnOnce(&mut ProcessorCore, T) + Send + 'static,
    R: FnOnce(T) + Send + 'static,
{
    let slot = Arc::new(Mutex::new(Some((payload, on_rejected))));
    let fallback = Arc::clone(&slot);
    executor.execute(
        move |core: &mut ProcessorCore| {
            let Some((payload, on_rejected)) = take(&slot) else {
                return;
            };
            if core.released {
                on_rejected(payload);
            } else {
                task(core, payload);
            }
        },
        move || {
            if let Some((payload, on_rejected)) = take(&fallback) {
                on_rejected(payload);
            }
        },
    );
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

struct OutputEntry {
    output: SurfaceOutput,
    window: NativeWindow,
}

/// JPEG output a snapshot batch is written to.
struct CaptureTarget {
    window: NativeWindow,
    size: Size,
    texture_matrix: Mat4,
}

/// Render-thread state.
pub(crate) struct ProcessorCore {
    renderer: FrameRenderer,
    executor: ExecutorHandle<ProcessorCore>,
    release_requested: Arc<AtomicBool>,
    /// Set by the release task; later tasks take their rejection path.
    released: bool,
    torn_down: bool,
    inputs: HashMap<u64, InputSurface>,
    next_input: u64,
    outputs: Vec<OutputEntry>,
    snapshots: SnapshotCoordinator,
    texture_matrix: Mat4,
}

impl ProcessorCore {
    fn new(
        renderer: FrameRenderer,
        executor: ExecutorHandle<ProcessorCore>,
        release_requested: Arc<AtomicBool>,
    ) -> Self {
        Self {
            renderer,
            executor,
            release_requested,
            released: false,
            torn_down: false,
            inputs: HashMap::new(),
            next_input: 0,
            outputs: Vec::new(),
            snapshots: SnapshotCoordinator::new(),
            texture_matrix: Mat4::IDENTITY,
        }
    }

    fn attach_input(&mut self, request: SurfaceRequest) {
        let key = self.next_input;
        self.next_input += 1;

        let frames = self.executor.clone();
        let surface = InputSurface::new(
            request.resolution(),
            Arc::new(move || frames.post(move |core: &mut ProcessorCore| core.on_frame_available(key))),
        );
        self.inputs.insert(key, surface.clone());

        let active = Arc::new(AtomicBool::new(true));
        let listening = Arc::clone(&active);
        let hdr = request.dynamic_range().is_10bit_hdr();
        let formats = self.executor.clone();
        request.set_transformation_listener(move |info| {
            if !listening.load(Ordering::Acquire) {
                return;
            }
            let format = if hdr && info.has_camera_transform {
                InputFormat::Yuv
            } else {
                InputFormat::Default
            };
            formats.post(move |core: &mut ProcessorCore| {
                if let Err(error) = core.renderer.set_input_format(format) {
                    warn!(%format, %error, "failed to switch input format");
                }
            });
        });

        debug!(key, resolution = %request.resolution(), range = %request.dynamic_range(), "providing input surface");
        let detach = self.executor.clone();
        let fallback = surface.clone();
        request.provide_surface(surface, move |result| {
            active.store(false, Ordering::Release);
            debug!(key, ?result, "input surface finished");
            // The producer stops even if the render thread is already gone.
            detach.execute(
                move |core: &mut ProcessorCore| core.detach_input(key),
                move || fallback.detach_listener(),
            );
        });
    }

    fn detach_input(&mut self, key: u64) {
        if let Some(surface) = self.inputs.remove(&key) {
            surface.detach_listener();
            trace!(key, remaining = self.inputs.len(), "input surface detached");
        }
        self.check_ready_to_release();
    }

    fn attach_output(&mut self, output: SurfaceOutput) {
        let id = output.id();
        let events = self.executor.clone();
        let window = output.surface(move |event| match event {
            OutputEvent::CloseRequested => {
                events.post(move |core: &mut ProcessorCore| core.detach_output(id));
            }
        });
        match self.renderer.register_output(window.clone()) {
            Ok(_) => {
                debug!(surface = %id, format = ?output.format(), size = %output.size(), "output attached");
                self.outputs.push(OutputEntry { output, window });
            }
            Err(error) => {
                error!(surface = %id, %error, "failed to register output");
                output.close();
            }
        }
    }

    fn detach_output(&mut self, id: SurfaceId) {
        let Some(index) = self.outputs.iter().position(|entry| entry.output.id() == id) else {
            return;
        };
        let entry = self.outputs.remove(index);
        entry.output.close();
        if let Err(error) = self.renderer.unregister_output(id) {
            warn!(surface = %id, %error, "failed to unregister output");
        }
        debug!(surface = %id, "output detached");
    }

    fn on_frame_available(&mut self, key: u64) {
        if self.release_requested.load(Ordering::Acquire) || self.torn_down {
            return;
        }
        let Some(frame) = self.inputs.get(&key).and_then(InputSurface::latch) else {
            return;
        };
        if let Err(error) = self.renderer.update_input(&frame) {
            warn!(%error, "failed to latch input frame");
            return;
        }
        self.texture_matrix = frame.transform;

        let first_raster = self
            .outputs
            .iter()
            .find(|entry| entry.output.format() == OutputFormat::Raster)
            .map(|entry| entry.output.size());
        if let Some(size) = first_raster {
            if let Err(error) = self.renderer.begin_frame(size) {
                warn!(%error, "failed to prepare frame");
            }
        }

        let mut jpeg_seen = false;
        for entry in &self.outputs {
            let matrix = entry.output.update_transform_matrix(&frame.transform);
            let id = entry.output.id();
            match entry.output.format() {
                OutputFormat::Raster => match self.renderer.render(frame.timestamp_ns, &matrix, id) {
                    Ok(OutputRender::Presented) => {}
                    Ok(outcome) => trace!(surface = %id, ?outcome, "output not presented"),
                    Err(error) => error!(surface = %id, %error, "failed to render output"),
                },
                OutputFormat::Jpeg if jpeg_seen => {
                    warn!(surface = %id, "only one JPEG output is supported; ignoring");
                }
                OutputFormat::Jpeg => jpeg_seen = true,
            }
        }
        self.service_snapshots();
    }

    /// Queues a capture for the render pass of the next frame.
    fn request_snapshot(&mut self, request: PendingSnapshot) {
        self.snapshots.enqueue(request);
        trace!(pending = self.snapshots.len(), "snapshot queued");
    }

    fn capture_target(&self) -> Option<CaptureTarget> {
        self.outputs
            .iter()
            .find(|entry| entry.output.format() == OutputFormat::Jpeg)
            .map(|entry| CaptureTarget {
                window: entry.window.clone(),
                size: entry.output.size(),
                texture_matrix: entry.output.update_transform_matrix(&self.texture_matrix),
            })
    }

    fn service_snapshots(&mut self) {
        if self.snapshots.is_empty() {
            return;
        }
        let target = self.capture_target();
        let renderer = &mut self.renderer;
        self.snapshots
            .service(target.as_ref().map(|target| &target.window), |rotation| {
                match &target {
                    Some(target) => render_rotated(renderer, target, rotation),
                    None => Err(SnapshotError::NoCaptureSurface),
                }
            });
    }

    fn check_ready_to_release(&mut self) {
        if self.released && self.inputs.is_empty() && !self.torn_down {
            self.teardown();
        }
    }

    /// Closes every output, settles outstanding snapshots and releases the
    /// renderer, then stops the render thread.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.released = true;
        for surface in self.inputs.values() {
            surface.detach_listener();
        }
        self.inputs.clear();
        for entry in self.outputs.drain(..) {
            entry.output.close();
        }
        let rejected = self.snapshots.fail_all(SnapshotError::Released);
        if rejected > 0 {
            debug!(rejected, "rejected outstanding snapshots on release");
        }
        self.renderer.release();
        self.executor.quit();
        info!("surface processor released");
    }
}

impl Drop for ProcessorCore {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Renders the current frame at `rotation` for the capture target and
/// returns it with the first row on top.
fn render_rotated(
    renderer: &mut FrameRenderer,
    target: &CaptureTarget,
    rotation: u32,
) -> Result<RgbaImage, SnapshotError> {
    let size = target.size.rotated(rotation);
    // Flipping the geometry cancels out the bottom-up readback.
    let transform = Mat4::IDENTITY
        .pre_rotate(rotation as f32, 0.0, 0.0)
        .pre_vertical_flip(0.0);
    let pixels = renderer
        .snapshot(size, &target.texture_matrix, &transform)
        .map_err(|error| SnapshotError::Render(error.to_string()))?;
    RgbaImage::from_raw(size.width, size.height, pixels)
        .ok_or_else(|| SnapshotError::Render(format!("readback does not cover {size}")))
}
