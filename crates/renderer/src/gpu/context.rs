use std::thread::{self, ThreadId};

use tracing::{debug, info, warn};

use super::surfaces::{NativeSurface, OutputSurfaceRegistry, SurfaceFactory};
use super::{
    ConfigHandle, ConfigRequest, ContextHandle, DisplayHandle, GraphicsApi, SurfaceAttribs,
    SurfaceColorSpace, SurfaceHandle, HLG_COLORSPACE_EXTENSION, YUV_TARGET_EXTENSION,
};
use crate::error::{ApiError, ContextError, InitializationError};
use crate::host::{NativeWindow, SurfaceId};
use crate::types::{DeviceInfo, DynamicRange, Size};

const PLACEHOLDER_SIZE: Size = Size::new(1, 1);

/// Native objects owned by an initialized context, in allocation order.
#[derive(Clone, Copy, Debug)]
struct NativeObjects {
    display: DisplayHandle,
    config: ConfigHandle,
    context: ContextHandle,
    placeholder: SurfaceHandle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Initialized,
    Released,
}

/// Owns the display, config and context, plus the placeholder surface that
/// keeps the context current between draws.
///
/// Only the thread that called [`GraphicsContext::initialize`] may use it
/// afterwards.
pub(crate) struct GraphicsContext {
    gl: Box<dyn GraphicsApi>,
    native: Option<NativeObjects>,
    attribs: SurfaceAttribs,
    owner: Option<ThreadId>,
    lifecycle: Lifecycle,
    dynamic_range: DynamicRange,
    outputs: OutputSurfaceRegistry,
}

impl GraphicsContext {
    pub fn new(gl: Box<dyn GraphicsApi>) -> Self {
        Self {
            gl,
            native: None,
            attribs: SurfaceAttribs::default(),
            owner: None,
            lifecycle: Lifecycle::Uninitialized,
            dynamic_range: DynamicRange::SDR,
            outputs: OutputSurfaceRegistry::default(),
        }
    }

    /// Allocates the native objects and binds the placeholder surface.
    ///
    /// A 10-bit HDR request the device cannot sample from falls back to SDR
    /// rather than failing. Any partial allocation is released before an
    /// error is returned.
    pub fn initialize(&mut self, requested: DynamicRange) -> Result<DeviceInfo, InitializationError> {
        match self.lifecycle {
            Lifecycle::Uninitialized => {}
            Lifecycle::Initialized => return Err(ContextError::AlreadyInitialized.into()),
            Lifecycle::Released => return Err(ContextError::Released.into()),
        }

        let mut range = requested;
        if range.is_10bit_hdr() && !self.supports_10bit_yuv() {
            warn!(requested = %range, "device lacks 10-bit YUV sampling; falling back to SDR");
            range = DynamicRange::SDR;
        }

        let native = self.allocate(range)?;
        let info = self.gl.device_info(native.display);

        let mut attribs = SurfaceAttribs::default();
        if range == DynamicRange::HLG_10_BIT
            && has_extension(&info.egl_extensions, HLG_COLORSPACE_EXTENSION)
        {
            attribs.color_space = SurfaceColorSpace::Bt2020Hlg;
        }

        self.native = Some(native);
        self.attribs = attribs;
        self.dynamic_range = range;
        self.owner = Some(thread::current().id());
        self.lifecycle = Lifecycle::Initialized;
        info!(
            range = %range,
            gl = %info.gl_version,
            egl = %info.egl_version,
            "graphics context initialized"
        );
        Ok(info)
    }

    /// Creates a throwaway HDR context to read the extension list, then
    /// tears it down again.
    fn supports_10bit_yuv(&mut self) -> bool {
        match self.allocate(DynamicRange::HDR10_10_BIT) {
            Ok(scratch) => {
                let info = self.gl.device_info(scratch.display);
                self.teardown(scratch);
                has_extension(&info.gl_extensions, YUV_TARGET_EXTENSION)
            }
            Err(error) => {
                debug!(%error, "HDR capability check failed");
                false
            }
        }
    }

    fn allocate(&mut self, range: DynamicRange) -> Result<NativeObjects, InitializationError> {
        let request = ConfigRequest::for_hdr(range.is_10bit_hdr());
        let gl = self.gl.as_mut();

        let display = gl.open_display().map_err(InitializationError::Display)?;
        let config = match gl.choose_config(display, &request) {
            Ok(config) => config,
            Err(error) => {
                gl.terminate_display(display);
                return Err(InitializationError::Config(error));
            }
        };
        let context = match gl.create_context(display, config, &request) {
            Ok(context) => context,
            Err(error) => {
                gl.terminate_display(display);
                return Err(InitializationError::Context(error));
            }
        };
        let placeholder = match gl.create_pbuffer_surface(display, config, PLACEHOLDER_SIZE) {
            Ok(surface) => surface,
            Err(error) => {
                release_context(gl, display, context);
                gl.terminate_display(display);
                return Err(InitializationError::Placeholder(error));
            }
        };
        let native = NativeObjects {
            display,
            config,
            context,
            placeholder,
        };
        if let Err(error) = gl.make_current(display, Some(placeholder), Some(context)) {
            self.teardown(native);
            return Err(InitializationError::Context(error));
        }
        Ok(native)
    }

    /// Releases `native` in reverse allocation order.
    fn teardown(&mut self, native: NativeObjects) {
        let gl = self.gl.as_mut();
        if let Err(error) = gl.make_current(native.display, None, None) {
            warn!(%error, "failed to unbind context");
        }
        if let Err(error) = gl.destroy_surface(native.display, native.placeholder) {
            warn!(%error, "failed to destroy placeholder surface");
        }
        release_context(gl, native.display, native.context);
        gl.terminate_display(native.display);
    }

    fn check_thread(&self) -> Result<(), ContextError> {
        let caller = thread::current().id();
        match self.owner {
            Some(owner) if owner != caller => Err(ContextError::WrongThread { owner, caller }),
            _ => Ok(()),
        }
    }

    fn native(&self) -> Result<NativeObjects, ContextError> {
        self.check_thread()?;
        match self.lifecycle {
            Lifecycle::Uninitialized => Err(ContextError::NotInitialized),
            Lifecycle::Released => Err(ContextError::Released),
            Lifecycle::Initialized => self.native.ok_or(ContextError::NotInitialized),
        }
    }

    /// The native API, for program and texture work on the current context.
    pub fn api(&mut self) -> Result<&mut dyn GraphicsApi, ContextError> {
        self.native()?;
        Ok(self.gl.as_mut())
    }

    /// Range actually in effect after any HDR downgrade.
    pub fn dynamic_range(&self) -> DynamicRange {
        self.dynamic_range
    }

    pub fn surface_attribs(&self) -> SurfaceAttribs {
        self.attribs
    }

    pub fn is_initialized(&self) -> bool {
        self.lifecycle == Lifecycle::Initialized
    }

    pub fn is_released(&self) -> bool {
        self.lifecycle == Lifecycle::Released
    }

    /// Binds `surface` for drawing and reading.
    pub fn make_current(&mut self, surface: SurfaceHandle) -> Result<(), ContextError> {
        let native = self.native()?;
        self.gl
            .make_current(native.display, Some(surface), Some(native.context))?;
        Ok(())
    }

    /// Rebinds the placeholder so the context stays current without a real
    /// target.
    pub fn make_placeholder_current(&mut self) -> Result<(), ContextError> {
        let native = self.native()?;
        self.make_current(native.placeholder)
    }

    pub fn register_output(&mut self, window: NativeWindow) -> Result<bool, ContextError> {
        self.native()?;
        Ok(self.outputs.register(window))
    }

    /// See [`OutputSurfaceRegistry::resolve`].
    pub fn resolve_output(&mut self, id: SurfaceId) -> Result<Option<NativeSurface>, ContextError> {
        let native = self.native()?;
        let factory = SurfaceFactory {
            gl: self.gl.as_mut(),
            display: native.display,
            config: native.config,
            attribs: self.attribs,
        };
        self.outputs.resolve(factory, id)
    }

    pub fn invalidate_output(&mut self, id: SurfaceId) -> Result<(), ContextError> {
        let native = self.native()?;
        // A surface cannot be destroyed while it is current.
        self.gl
            .make_current(native.display, Some(native.placeholder), Some(native.context))?;
        self.outputs.invalidate(self.gl.as_mut(), native.display, id);
        Ok(())
    }

    pub fn unregister_output(&mut self, id: SurfaceId) -> Result<bool, ContextError> {
        let native = self.native()?;
        self.gl
            .make_current(native.display, Some(native.placeholder), Some(native.context))?;
        Ok(self.outputs.unregister(self.gl.as_mut(), native.display, id))
    }

    pub fn has_output(&self, id: SurfaceId) -> bool {
        self.outputs.contains(id)
    }

    pub fn is_output_pending(&self, id: SurfaceId) -> bool {
        self.outputs.is_pending(id)
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Allocates an offscreen surface with the context's config.
    pub fn create_offscreen(&mut self, size: Size) -> Result<SurfaceHandle, ContextError> {
        let native = self.native()?;
        Ok(self
            .gl
            .create_pbuffer_surface(native.display, native.config, size)?)
    }

    pub fn destroy_offscreen(&mut self, surface: SurfaceHandle) -> Result<(), ContextError> {
        let native = self.native()?;
        self.gl
            .make_current(native.display, Some(native.placeholder), Some(native.context))?;
        self.gl.destroy_surface(native.display, surface)?;
        Ok(())
    }

    pub fn set_presentation_time(&mut self, surface: SurfaceHandle, timestamp_ns: i64) -> Result<(), ApiError> {
        let native = self.native().map_err(|error| ApiError::new("set_presentation_time", error.to_string()))?;
        self.gl.set_presentation_time(native.display, surface, timestamp_ns)
    }

    pub fn swap_buffers(&mut self, surface: SurfaceHandle) -> Result<(), ApiError> {
        let native = self.native().map_err(|error| ApiError::new("swap_buffers", error.to_string()))?;
        self.gl.swap_buffers(native.display, surface)
    }

    /// Tears everything down: unbind, output surfaces, placeholder, context,
    /// display. Only the first call has any effect.
    pub fn release(&mut self) -> Result<(), ContextError> {
        if self.lifecycle == Lifecycle::Released {
            return Ok(());
        }
        self.check_thread()?;
        self.lifecycle = Lifecycle::Released;
        let Some(native) = self.native.take() else {
            return Ok(());
        };

        if let Err(error) = self.gl.make_current(native.display, None, None) {
            warn!(%error, "failed to unbind context");
        }
        self.outputs.clear(self.gl.as_mut(), native.display);
        if let Err(error) = self.gl.destroy_surface(native.display, native.placeholder) {
            warn!(%error, "failed to destroy placeholder surface");
        }
        release_context(self.gl.as_mut(), native.display, native.context);
        self.gl.terminate_display(native.display);
        debug!("graphics context released");
        Ok(())
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        if self.lifecycle == Lifecycle::Initialized && self.check_thread().is_ok() {
            if let Err(error) = self.release() {
                warn!(%error, "failed to release graphics context on drop");
            }
        }
    }
}

fn release_context(gl: &mut dyn GraphicsApi, display: DisplayHandle, context: ContextHandle) {
    if let Err(error) = gl.destroy_context(display, context) {
        warn!(%error, "failed to destroy graphics context");
    }
}

fn has_extension(list: &str, name: &str) -> bool {
    list.split_whitespace().any(|extension| extension == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::fake::{FakeApi, FakeMonitor};
    use crate::host::image_target;

    fn context() -> (GraphicsContext, FakeMonitor) {
        let (gl, monitor) = FakeApi::new();
        (GraphicsContext::new(Box::new(gl)), monitor)
    }

    #[test]
    fn initialize_binds_placeholder_and_reports_device() {
        let (mut ctx, monitor) = context();
        let info = ctx.initialize(DynamicRange::SDR).unwrap();
        assert_eq!(info.egl_version, "1.5");
        assert!(ctx.is_initialized());
        let (surface, current) = monitor.current();
        assert!(surface.is_some() && current.is_some());
        assert_eq!(monitor.live_surfaces(), 1);
        assert_eq!(monitor.contexts_created(), 1);
    }

    #[test]
    fn second_initialize_is_a_misuse() {
        let (mut ctx, _monitor) = context();
        ctx.initialize(DynamicRange::SDR).unwrap();
        assert!(matches!(
            ctx.initialize(DynamicRange::SDR),
            Err(InitializationError::Misuse(ContextError::AlreadyInitialized))
        ));
    }

    #[test]
    fn calls_before_initialize_fail() {
        let (mut ctx, _monitor) = context();
        assert_eq!(ctx.create_offscreen(Size::new(1, 1)), Err(ContextError::NotInitialized));
        assert!(ctx.api().is_err());
    }

    #[test]
    fn other_threads_are_rejected() {
        let (mut ctx, _monitor) = context();
        ctx.initialize(DynamicRange::SDR).unwrap();
        let ctx = std::thread::spawn(move || {
            let result = ctx.make_placeholder_current();
            assert!(matches!(result, Err(ContextError::WrongThread { .. })));
            // Hand it back so the owning thread releases it.
            ctx
        })
        .join()
        .unwrap();
        drop(ctx);
    }

    #[test]
    fn hdr_downgrades_without_yuv_target() {
        let (mut ctx, monitor) = context();
        monitor.set_extensions("GL_OES_EGL_image_external", "");
        ctx.initialize(DynamicRange::HLG_10_BIT).unwrap();
        assert_eq!(ctx.dynamic_range(), DynamicRange::SDR);
        // Scratch context plus the real one; the scratch one is already gone.
        assert_eq!(monitor.contexts_created(), 2);
        assert_eq!(monitor.live_contexts(), 1);
        assert_eq!(monitor.live_displays(), 1);
    }

    #[test]
    fn hlg_selects_bt2020_surfaces() {
        let (mut ctx, _monitor) = context();
        ctx.initialize(DynamicRange::HLG_10_BIT).unwrap();
        assert_eq!(ctx.dynamic_range(), DynamicRange::HLG_10_BIT);
        assert_eq!(ctx.surface_attribs().color_space, SurfaceColorSpace::Bt2020Hlg);
    }

    #[test]
    fn failed_config_releases_display() {
        let (mut ctx, monitor) = context();
        monitor.fail_hdr_config();
        // The capability check fails too, so the request degrades to SDR and succeeds.
        ctx.initialize(DynamicRange::HDR10_10_BIT).unwrap();
        assert_eq!(ctx.dynamic_range(), DynamicRange::SDR);
        assert_eq!(monitor.live_displays(), 1);
    }

    #[test]
    fn failed_display_surfaces_error() {
        let (mut ctx, monitor) = context();
        monitor.fail_open_display();
        assert!(matches!(
            ctx.initialize(DynamicRange::SDR),
            Err(InitializationError::Display(_))
        ));
        assert!(!ctx.is_initialized());
        assert_eq!(monitor.live_contexts(), 0);
    }

    #[test]
    fn release_tears_down_in_reverse_order_once() {
        let (mut ctx, monitor) = context();
        ctx.initialize(DynamicRange::SDR).unwrap();
        let (target, _rx) = image_target(Size::new(8, 8));
        let window = NativeWindow::from_image_target(target);
        let id = window.id();
        ctx.register_output(window).unwrap();
        ctx.resolve_output(id).unwrap().unwrap();

        ctx.release().unwrap();
        ctx.release().unwrap();

        let ops = monitor.ops();
        let tail: Vec<_> = ops
            .iter()
            .skip_while(|op| op.as_str() != "make_current None")
            .map(|op| op.split_whitespace().next().unwrap_or_default())
            .collect();
        assert_eq!(
            tail,
            [
                "make_current",
                "destroy_surface",
                "destroy_surface",
                "destroy_context",
                "terminate_display"
            ]
        );
        assert_eq!(monitor.live_surfaces(), 0);
        assert_eq!(monitor.live_contexts(), 0);
        assert_eq!(ctx.make_placeholder_current(), Err(ContextError::Released));
    }
}
