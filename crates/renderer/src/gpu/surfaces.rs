use std::collections::HashMap;

use tracing::{debug, warn};

use super::{ConfigHandle, DisplayHandle, GraphicsApi, SurfaceAttribs, SurfaceHandle};
use crate::error::ContextError;
use crate::host::{NativeWindow, SurfaceId};
use crate::types::Size;

/// A native surface created for a registered output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct NativeSurface {
    pub handle: SurfaceHandle,
    pub size: Size,
}

#[derive(Debug)]
enum Slot {
    /// Registered, native surface not created yet or demoted after a failure.
    Pending,
    Ready(NativeSurface),
}

#[derive(Debug)]
struct OutputRecord {
    window: NativeWindow,
    slot: Slot,
}

/// Native surfaces for the outputs registered with one graphics context.
///
/// Surfaces are created lazily on the first render after registration. A
/// surface that fails to create or swap falls back to `Pending` and creation
/// is retried on the next frame.
#[derive(Debug, Default)]
pub(crate) struct OutputSurfaceRegistry {
    records: HashMap<SurfaceId, OutputRecord>,
}

/// Borrowed context state the registry allocates with.
pub(crate) struct SurfaceFactory<'a> {
    pub gl: &'a mut dyn GraphicsApi,
    pub display: DisplayHandle,
    pub config: ConfigHandle,
    pub attribs: SurfaceAttribs,
}

impl OutputSurfaceRegistry {
    /// Inserts a pending record. Returns `false` if the window was already
    /// registered, leaving its record untouched.
    pub fn register(&mut self, window: NativeWindow) -> bool {
        let id = window.id();
        if self.records.contains_key(&id) {
            return false;
        }
        debug!(surface = %id, size = %window.size(), "registered output surface");
        self.records.insert(
            id,
            OutputRecord {
                window,
                slot: Slot::Pending,
            },
        );
        true
    }

    /// Returns the native surface for `id`, creating it if needed.
    ///
    /// `Ok(None)` means creation failed and the output should be skipped this
    /// frame.
    pub fn resolve(
        &mut self,
        factory: SurfaceFactory<'_>,
        id: SurfaceId,
    ) -> Result<Option<NativeSurface>, ContextError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(ContextError::UnknownSurface(id.get()))?;
        if let Slot::Ready(surface) = record.slot {
            return Ok(Some(surface));
        }

        let handle = match factory.gl.create_window_surface(
            factory.display,
            factory.config,
            &record.window,
            &factory.attribs,
        ) {
            Ok(handle) => handle,
            Err(error) => {
                warn!(surface = %id, %error, "failed to create output surface; skipping");
                return Ok(None);
            }
        };
        let size = match factory.gl.surface_size(handle) {
            Ok(size) => size,
            Err(error) => {
                warn!(surface = %id, %error, "failed to query output surface size; skipping");
                if let Err(error) = factory.gl.destroy_surface(factory.display, handle) {
                    warn!(surface = %id, %error, "failed to destroy output surface");
                }
                return Ok(None);
            }
        };
        let surface = NativeSurface { handle, size };
        record.slot = Slot::Ready(surface);
        debug!(surface = %id, %size, "created output surface");
        Ok(Some(surface))
    }

    /// Destroys the native surface, keeping the registration so creation is
    /// retried on the next frame.
    pub fn invalidate(&mut self, gl: &mut dyn GraphicsApi, display: DisplayHandle, id: SurfaceId) {
        if let Some(record) = self.records.get_mut(&id) {
            if let Slot::Ready(surface) = std::mem::replace(&mut record.slot, Slot::Pending) {
                destroy(gl, display, id, surface);
            }
        }
    }

    /// Removes the registration and destroys its surface. Unknown ids are
    /// ignored.
    pub fn unregister(&mut self, gl: &mut dyn GraphicsApi, display: DisplayHandle, id: SurfaceId) -> bool {
        match self.records.remove(&id) {
            Some(record) => {
                if let Slot::Ready(surface) = record.slot {
                    destroy(gl, display, id, surface);
                }
                debug!(surface = %id, "unregistered output surface");
                true
            }
            None => false,
        }
    }

    /// Destroys every native surface and forgets all registrations.
    pub fn clear(&mut self, gl: &mut dyn GraphicsApi, display: DisplayHandle) {
        for (id, record) in self.records.drain() {
            if let Slot::Ready(surface) = record.slot {
                destroy(gl, display, id, surface);
            }
        }
    }

    pub fn contains(&self, id: SurfaceId) -> bool {
        self.records.contains_key(&id)
    }

    /// Whether `id` is registered but has no native surface.
    pub fn is_pending(&self, id: SurfaceId) -> bool {
        matches!(
            self.records.get(&id),
            Some(OutputRecord {
                slot: Slot::Pending,
                ..
            })
        )
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

fn destroy(gl: &mut dyn GraphicsApi, display: DisplayHandle, id: SurfaceId, surface: NativeSurface) {
    if let Err(error) = gl.destroy_surface(display, surface.handle) {
        warn!(surface = %id, %error, "failed to destroy output surface");
    }
}
