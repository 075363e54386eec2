//! Ring of frames-in-flight.

use crate::renderer::backend::{Backend, FrameSyncId, SurfaceStatus, SwapchainId};
use crate::renderer::error::DeviceResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStart {
    /// Recording has begun in ring slot `slot` for swapchain image `image_index`
    Ready {
        slot: usize,
        frame: FrameSyncId,
        image_index: u32,
        suboptimal: bool,
    },
    /// The swapchain no longer matches the surface. Nothing was recorded.
    SurfaceInvalidated,
}

#[derive(Debug)]
pub struct FrameRing {
    frames: Vec<FrameSyncId>,
    index: usize,
}

impl FrameRing {
    pub fn new<B: Backend>(backend: &mut B, count: usize) -> DeviceResult<Self> {
        let mut frames = Vec::with_capacity(count.max(1));
        for _ in 0..count.max(1) {
            match backend.create_frame_sync() {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    frames.into_iter().for_each(|f| backend.destroy_frame_sync(f));
                    return Err(e);
                }
            }
        }
        // the first start_frame advances onto slot 0
        let index = frames.len() - 1;
        Ok(Self { frames, index })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn advance(&mut self) -> (usize, FrameSyncId) {
        self.index = (self.index + 1) % self.frames.len();
        (self.index, self.frames[self.index])
    }

    /// Moves to the next slot, waits for its previous submission, acquires an
    /// image and begins recording
    pub fn start_frame<B: Backend>(
        &mut self,
        backend: &mut B,
        swapchain: SwapchainId,
    ) -> DeviceResult<FrameStart> {
        let (slot, frame) = self.advance();
        backend.wait_for_frame(frame)?;
        match backend.acquire_image(swapchain, frame)? {
            SurfaceStatus::OutOfDate => Ok(FrameStart::SurfaceInvalidated),
            SurfaceStatus::Ready { image_index, suboptimal } => {
                backend.begin_commands(frame)?;
                Ok(FrameStart::Ready {
                    slot,
                    frame,
                    image_index,
                    suboptimal,
                })
            }
        }
    }

    pub fn destroy<B: Backend>(self, backend: &mut B) {
        for frame in self.frames {
            backend.destroy_frame_sync(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::headless::{HeadlessBackend, ObjectKind};
    use crate::renderer::backend::{Extent2D, SwapchainRequest};

    fn setup() -> (HeadlessBackend, SwapchainId) {
        let mut backend = HeadlessBackend::new(Extent2D::new(64, 64));
        let chain = backend
            .create_swapchain(
                &SwapchainRequest { extent: Extent2D::new(64, 64), vsync: true, srgb: true },
                None,
            )
            .unwrap();
        (backend, chain.id)
    }

    #[test]
    fn slots_are_used_cyclically() {
        let (mut backend, chain) = setup();
        let mut ring = FrameRing::new(&mut backend, 2).unwrap();
        let mut slots = Vec::new();
        for _ in 0..5 {
            match ring.start_frame(&mut backend, chain).unwrap() {
                FrameStart::Ready { slot, frame, .. } => {
                    slots.push(slot);
                    backend.submit_commands(frame).unwrap();
                }
                FrameStart::SurfaceInvalidated => panic!("surface should be valid"),
            }
        }
        assert_eq!(slots, vec![0, 1, 0, 1, 0]);
        assert_eq!(backend.submissions(), 5);
    }

    #[test]
    fn out_of_date_surface_is_not_an_error() {
        let (mut backend, chain) = setup();
        let mut ring = FrameRing::new(&mut backend, 2).unwrap();
        backend.set_surface_extent(Extent2D::new(32, 32));
        assert_eq!(
            ring.start_frame(&mut backend, chain).unwrap(),
            FrameStart::SurfaceInvalidated
        );
        assert!(backend.commands().is_empty());
    }

    #[test]
    fn destroy_releases_every_slot() {
        let (mut backend, _) = setup();
        let ring = FrameRing::new(&mut backend, 3).unwrap();
        assert_eq!(ring.frame_count(), 3);
        assert_eq!(backend.live_count(ObjectKind::FrameSync), 3);
        ring.destroy(&mut backend);
        assert_eq!(backend.live_count(ObjectKind::FrameSync), 0);
    }
}
