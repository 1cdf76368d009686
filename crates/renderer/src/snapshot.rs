//! Still captures batched against the most recent frame.

use std::collections::VecDeque;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, RgbaImage};
use tracing::{debug, warn};

use crate::completion::Completer;
use crate::error::SnapshotError;
use crate::host::NativeWindow;

/// One outstanding capture request.
#[derive(Debug)]
pub(crate) struct PendingSnapshot {
    pub quality: u8,
    pub rotation_degrees: u32,
    completer: Completer<(), SnapshotError>,
}

impl PendingSnapshot {
    pub fn new(quality: u8, rotation_degrees: u32, completer: Completer<(), SnapshotError>) -> Self {
        Self {
            quality: quality.min(100),
            rotation_degrees: rotation_degrees % 360,
            completer,
        }
    }

    pub fn reject(self, error: SnapshotError) {
        self.completer.reject(error);
    }
}

/// Work done while servicing one batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct BatchStats {
    pub renders: usize,
    pub encodes: usize,
    pub resolved: usize,
    pub rejected: usize,
}

#[derive(Debug, Default)]
pub(crate) struct SnapshotCoordinator {
    pending: VecDeque<PendingSnapshot>,
}

impl SnapshotCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, request: PendingSnapshot) {
        self.pending.push_back(request);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Settles every pending request against the current frame.
    ///
    /// Without a JPEG `target` the whole queue is rejected. Otherwise requests
    /// run in arrival order; `capture` renders the frame at a rotation and is
    /// only called again when the rotation changes, and the image is only
    /// re-encoded when the quality changes. A failed write rejects the
    /// request that hit it and every request behind it.
    pub fn service<F>(&mut self, target: Option<&NativeWindow>, mut capture: F) -> BatchStats
    where
        F: FnMut(u32) -> Result<RgbaImage, SnapshotError>,
    {
        let mut stats = BatchStats::default();
        if self.pending.is_empty() {
            return stats;
        }
        let Some(target) = target else {
            debug!(pending = self.pending.len(), "no capture surface; rejecting snapshots");
            stats.rejected = self.fail_all(SnapshotError::NoCaptureSurface);
            return stats;
        };

        let mut image: Option<(u32, Result<RgbaImage, SnapshotError>)> = None;
        let mut encoded: Option<(u8, Result<Vec<u8>, SnapshotError>)> = None;

        while let Some(request) = self.pending.pop_front() {
            let rotation = request.rotation_degrees;
            if image.as_ref().map(|(cached, _)| *cached) != Some(rotation) {
                stats.renders += 1;
                image = Some((rotation, capture(rotation)));
                encoded = None;
            }
            let bitmap = match image.as_ref().map(|(_, result)| result) {
                Some(Ok(bitmap)) => bitmap,
                Some(Err(error)) => {
                    warn!(rotation, %error, "snapshot render failed");
                    request.completer.reject(error.clone());
                    stats.rejected += 1;
                    continue;
                }
                None => {
                    request.completer.reject(SnapshotError::NotReady);
                    stats.rejected += 1;
                    continue;
                }
            };

            if encoded.as_ref().map(|(cached, _)| *cached) != Some(request.quality) {
                stats.encodes += 1;
                encoded = Some((request.quality, encode_jpeg(bitmap, request.quality)));
            }
            let bytes = match encoded.as_ref().map(|(_, result)| result) {
                Some(Ok(bytes)) => bytes.clone(),
                Some(Err(error)) => {
                    request.completer.reject(error.clone());
                    stats.rejected += 1;
                    continue;
                }
                None => {
                    request.completer.reject(SnapshotError::NotReady);
                    stats.rejected += 1;
                    continue;
                }
            };

            if let Err(error) = target.write_encoded(bytes) {
                let error = SnapshotError::Io(error.to_string());
                warn!(%error, remaining = self.pending.len(), "snapshot write failed");
                request.completer.reject(error.clone());
                stats.rejected += 1 + self.fail_all(error);
                break;
            }
            request.completer.resolve(());
            stats.resolved += 1;
        }
        debug!(?stats, "serviced snapshot batch");
        stats
    }

    /// Rejects every pending request with `error`, returning how many.
    pub fn fail_all(&mut self, error: SnapshotError) -> usize {
        let count = self.pending.len();
        for request in self.pending.drain(..) {
            request.completer.reject(error.clone());
        }
        count
    }
}

fn encode_jpeg(bitmap: &RgbaImage, quality: u8) -> Result<Vec<u8>, SnapshotError> {
    let rgb = DynamicImage::ImageRgba8(bitmap.clone()).to_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality.max(1))
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .map_err(|error| SnapshotError::Encode(error.to_string()))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{channel, Completion};
    use crate::host::{image_target, DeliveredImage};
    use crate::types::Size;

    fn request(
        coordinator: &mut SnapshotCoordinator,
        quality: u8,
        rotation: u32,
    ) -> Completion<(), SnapshotError> {
        let (completer, completion) = channel();
        coordinator.enqueue(PendingSnapshot::new(quality, rotation, completer));
        completion
    }

    fn bitmap(_rotation: u32) -> Result<RgbaImage, SnapshotError> {
        Ok(RgbaImage::from_pixel(8, 4, image::Rgba([200, 10, 10, 255])))
    }

    #[test]
    fn missing_capture_surface_rejects_everything() {
        let mut coordinator = SnapshotCoordinator::new();
        let first = request(&mut coordinator, 90, 0);
        let second = request(&mut coordinator, 50, 90);
        let stats = coordinator.service(None, |_| panic!("should not render"));
        assert_eq!(stats.rejected, 2);
        assert!(coordinator.is_empty());
        assert_eq!(first.wait(), Err(SnapshotError::NoCaptureSurface));
        assert_eq!(second.wait(), Err(SnapshotError::NoCaptureSurface));
    }

    #[test]
    fn rotation_changes_drive_rerenders() {
        let (target, rx) = image_target(Size::new(8, 4));
        let window = NativeWindow::from_image_target(target);
        let mut coordinator = SnapshotCoordinator::new();
        let handles = [
            request(&mut coordinator, 80, 0),
            request(&mut coordinator, 80, 0),
            request(&mut coordinator, 80, 180),
        ];

        let mut rotations = Vec::new();
        let stats = coordinator.service(Some(&window), |rotation| {
            rotations.push(rotation);
            bitmap(rotation)
        });

        assert_eq!(rotations, vec![0, 180]);
        assert_eq!(stats.renders, 2);
        assert_eq!(stats.resolved, 3);
        for handle in handles {
            assert_eq!(handle.wait(), Ok(()));
        }
        let delivered: Vec<_> = rx.try_iter().collect();
        assert_eq!(delivered.len(), 3);
        assert!(matches!(&delivered[0], DeliveredImage::Encoded(bytes) if bytes.starts_with(&[0xFF, 0xD8])));
    }

    #[test]
    fn quality_changes_drive_reencodes() {
        let (target, _rx) = image_target(Size::new(8, 4));
        let window = NativeWindow::from_image_target(target);
        let mut coordinator = SnapshotCoordinator::new();
        for quality in [90, 90, 40, 40, 90] {
            request(&mut coordinator, quality, 0);
        }
        let stats = coordinator.service(Some(&window), bitmap);
        assert_eq!(stats.renders, 1);
        assert_eq!(stats.encodes, 3);
    }

    #[test]
    fn render_failure_rejects_only_matching_rotation() {
        let (target, _rx) = image_target(Size::new(8, 4));
        let window = NativeWindow::from_image_target(target);
        let mut coordinator = SnapshotCoordinator::new();
        let broken = request(&mut coordinator, 80, 90);
        let fine = request(&mut coordinator, 80, 0);
        coordinator.service(Some(&window), |rotation| {
            if rotation == 90 {
                Err(SnapshotError::Render("lost".into()))
            } else {
                bitmap(rotation)
            }
        });
        assert_eq!(broken.wait(), Err(SnapshotError::Render("lost".into())));
        assert_eq!(fine.wait(), Ok(()));
    }

    #[test]
    fn write_failure_rejects_the_rest_of_the_batch() {
        let (target, rx) = image_target(Size::new(8, 4));
        drop(rx);
        let window = NativeWindow::from_image_target(target);
        let mut coordinator = SnapshotCoordinator::new();
        let handles = [request(&mut coordinator, 80, 0), request(&mut coordinator, 70, 90)];
        let stats = coordinator.service(Some(&window), bitmap);
        assert_eq!(stats.rejected, 2);
        assert!(coordinator.is_empty());
        for handle in handles {
            assert!(matches!(handle.wait(), Err(SnapshotError::Io(_))));
        }
    }

    #[test]
    fn fail_all_settles_each_request_once() {
        let mut coordinator = SnapshotCoordinator::new();
        let handles: Vec<_> = (0..4).map(|i| request(&mut coordinator, 50, i * 90)).collect();
        assert_eq!(coordinator.fail_all(SnapshotError::Released), 4);
        assert_eq!(coordinator.fail_all(SnapshotError::Released), 0);
        for handle in handles {
            assert_eq!(handle.wait(), Err(SnapshotError::Released));
        }
    }
}
