//! Groups consecutive draws that share a model into instanced draw calls.
//!
//! Instance data of a frame lives in `INSTANCE_BLOCKS` dynamic blocks per
//! phase family. A flush covers a contiguous run of one block, so a full
//! block flushes and drawing continues in the next one. Draws are dropped
//! only once every block of the frame is used.

use glam::{Mat4, Vec4};
use smallvec::SmallVec;
use crate::renderer::resources::Model;
use crate::renderer::shader_data::{
    Frag2DData, PerInstance3D, INSTANCE_BLOCKS, MAX_2D_INSTANCE, MAX_3D_INSTANCE,
    MAX_ANIMATIONS_PER_FRAME,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DrawPhase {
    #[default]
    Idle,
    Draw3D,
    DrawAnim3D,
    Draw2D,
}

/// What a run of instances has in common
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BatchKey {
    Model { model: Model, colour: Vec4 },
    /// Textured quads, their texture travels with each instance
    Quad,
    Model2D(Model),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instance2D {
    pub model: Mat4,
    pub frag: Frag2DData,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchFlush {
    pub phase: DrawPhase,
    pub key: BatchKey,
    /// Dynamic block the instances live in
    pub block: u32,
    pub first_instance: u32,
    pub instance_count: u32,
    pub bones_slot: Option<u32>,
}

pub type Flushes = SmallVec<[BatchFlush; 2]>;

#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Queued(Flushes),
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub flushes: u32,
    pub draw_calls: u32,
    pub dropped_draws: u32,
}

#[derive(Debug)]
struct InstanceStream<T> {
    items: Vec<T>,
    capacity: u32,
    blocks: u32,
    block: u32,
    fill: u32,
    run_start: u32,
}

impl<T: Copy> InstanceStream<T> {
    fn new(capacity: u32, blocks: u32) -> Self {
        Self {
            items: Vec::with_capacity((capacity * blocks) as usize),
            capacity,
            blocks,
            block: 0,
            fill: 0,
            run_start: 0,
        }
    }

    fn reset(&mut self) {
        self.items.clear();
        self.block = 0;
        self.fill = 0;
        self.run_start = 0;
    }

    fn has_room(&self) -> bool {
        self.fill < self.capacity || self.block + 1 < self.blocks
    }

    /// Moves to the next block once the current one is full. Any pending run must be taken first.
    fn advance_if_full(&mut self) {
        if self.fill == self.capacity {
            debug_assert_eq!(self.run_start, self.fill);
            self.block += 1;
            self.fill = 0;
            self.run_start = 0;
        }
    }

    fn push(&mut self, item: T) {
        self.items.push(item);
        self.fill += 1;
    }

    /// Returns `(block, first, count)` of the pending run
    fn take_run(&mut self) -> Option<(u32, u32, u32)> {
        if self.fill == self.run_start {
            return None;
        }
        let run = (self.block, self.run_start, self.fill - self.run_start);
        self.run_start = self.fill;
        Some(run)
    }

    fn blocks_used(&self) -> impl Iterator<Item = (u32, &[T])> {
        self.items
            .chunks(self.capacity as usize)
            .enumerate()
            .map(|(i, chunk)| (i as u32, chunk))
    }
}

#[derive(Debug)]
pub struct DrawBatcher {
    phase: DrawPhase,
    key: Option<BatchKey>,
    instances_3d: InstanceStream<PerInstance3D>,
    instances_2d: InstanceStream<Instance2D>,
    bones_used: u32,
    stats: FrameStats,
}

impl Default for DrawBatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DrawBatcher {
    pub fn new() -> Self {
        Self {
            phase: DrawPhase::Idle,
            key: None,
            instances_3d: InstanceStream::new(MAX_3D_INSTANCE, INSTANCE_BLOCKS),
            instances_2d: InstanceStream::new(MAX_2D_INSTANCE, INSTANCE_BLOCKS),
            bones_used: 0,
            stats: FrameStats::default(),
        }
    }

    pub fn phase(&self) -> DrawPhase {
        self.phase
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn begin_frame(&mut self) {
        self.phase = DrawPhase::Idle;
        self.key = None;
        self.instances_3d.reset();
        self.instances_2d.reset();
        self.bones_used = 0;
        self.stats = FrameStats::default();
    }

    /// Enters `phase`, flushing whatever the previous phase left pending
    pub fn begin_phase(&mut self, phase: DrawPhase) -> Option<BatchFlush> {
        let flush = self.flush_pending();
        self.phase = phase;
        self.key = None;
        flush
    }

    /// Flushes the pending run and returns to `Idle`
    pub fn finish_frame(&mut self) -> Option<BatchFlush> {
        self.begin_phase(DrawPhase::Idle)
    }

    pub fn record_draw_calls(&mut self, count: u32) {
        self.stats.draw_calls += count;
    }

    fn flush_pending(&mut self) -> Option<BatchFlush> {
        let key = self.key?;
        let run = match self.phase {
            DrawPhase::Draw3D | DrawPhase::DrawAnim3D => self.instances_3d.take_run(),
            DrawPhase::Draw2D => self.instances_2d.take_run(),
            DrawPhase::Idle => None,
        };
        run.map(|(block, first_instance, instance_count)| {
            self.flush(key, block, first_instance, instance_count, None)
        })
    }

    fn flush(
        &mut self,
        key: BatchKey,
        block: u32,
        first_instance: u32,
        instance_count: u32,
        bones_slot: Option<u32>,
    ) -> BatchFlush {
        self.stats.flushes += 1;
        log::trace!("flush {key:?}: {instance_count} instances at {block}:{first_instance}");
        BatchFlush {
            phase: self.phase,
            key,
            block,
            first_instance,
            instance_count,
            bones_slot,
        }
    }

    fn dropped(&mut self, what: &str) -> PushOutcome {
        self.stats.dropped_draws += 1;
        log::warn!("{what} instance capacity of the frame exceeded, draw dropped");
        PushOutcome::Dropped
    }

    pub fn push_model(&mut self, key: BatchKey, instance: PerInstance3D) -> PushOutcome {
        debug_assert_eq!(self.phase, DrawPhase::Draw3D);
        if !self.instances_3d.has_room() {
            return self.dropped("3D");
        }
        let mut flushes = Flushes::new();
        if self.key != Some(key) {
            flushes.extend(self.flush_pending());
        }
        if self.instances_3d.fill == self.instances_3d.capacity {
            flushes.extend(self.flush_pending());
            self.instances_3d.advance_if_full();
        }
        self.instances_3d.push(instance);
        self.key = Some(key);
        PushOutcome::Queued(flushes)
    }

    /// Animated draws flush immediately, each with its own bone slot
    pub fn push_anim(&mut self, key: BatchKey, instance: PerInstance3D) -> (PushOutcome, u32) {
        debug_assert_eq!(self.phase, DrawPhase::DrawAnim3D);
        if self.bones_used >= MAX_ANIMATIONS_PER_FRAME {
            return (self.dropped("animation"), 0);
        }
        if !self.instances_3d.has_room() {
            return (self.dropped("3D"), 0);
        }
        let mut flushes = Flushes::new();
        flushes.extend(self.flush_pending());
        self.instances_3d.advance_if_full();
        self.instances_3d.push(instance);

        let slot = self.bones_used;
        self.bones_used += 1;
        if let Some((block, first, count)) = self.instances_3d.take_run() {
            let flush = self.flush(key, block, first, count, Some(slot));
            flushes.push(flush);
        }
        self.key = None;
        (PushOutcome::Queued(flushes), slot)
    }

    pub fn push_2d(&mut self, key: BatchKey, instance: Instance2D) -> PushOutcome {
        debug_assert_eq!(self.phase, DrawPhase::Draw2D);
        if !self.instances_2d.has_room() {
            return self.dropped("2D");
        }
        let mut flushes = Flushes::new();
        if self.key != Some(key) {
            flushes.extend(self.flush_pending());
        }
        if self.instances_2d.fill == self.instances_2d.capacity {
            flushes.extend(self.flush_pending());
            self.instances_2d.advance_if_full();
        }
        self.instances_2d.push(instance);
        self.key = Some(key);
        PushOutcome::Queued(flushes)
    }

    /// Bone slot the next animated draw will get, if any is left
    pub fn next_bones_slot(&self) -> Option<u32> {
        (self.bones_used < MAX_ANIMATIONS_PER_FRAME).then_some(self.bones_used)
    }

    pub fn blocks_3d(&self) -> impl Iterator<Item = (u32, &[PerInstance3D])> {
        self.instances_3d.blocks_used()
    }

    pub fn blocks_2d(&self) -> impl Iterator<Item = (u32, &[Instance2D])> {
        self.instances_2d.blocks_used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::resources::{ModelKind, PoolId};

    fn model(id: u32) -> Model {
        Model {
            pool: PoolId { index: 0, generation: 0 },
            id,
            kind: ModelKind::Static3D,
        }
    }

    fn key(id: u32) -> BatchKey {
        BatchKey::Model { model: model(id), colour: Vec4::ONE }
    }

    fn drain(outcome: PushOutcome, into: &mut Vec<BatchFlush>) {
        match outcome {
            PushOutcome::Queued(flushes) => into.extend(flushes),
            PushOutcome::Dropped => {}
        }
    }

    fn draw_3d(batcher: &mut DrawBatcher, keys: &[u32]) -> Vec<BatchFlush> {
        let mut flushes = Vec::new();
        batcher.begin_frame();
        flushes.extend(batcher.begin_phase(DrawPhase::Draw3D));
        for &k in keys {
            drain(batcher.push_model(key(k), PerInstance3D::default()), &mut flushes);
        }
        flushes.extend(batcher.finish_frame());
        flushes
    }

    #[test]
    fn twenty_one_same_key_draws_flush_twice() {
        let mut batcher = DrawBatcher::new();
        let flushes = draw_3d(&mut batcher, &[7; 21]);

        assert_eq!(flushes.len(), 2);
        assert_eq!((flushes[0].block, flushes[0].first_instance, flushes[0].instance_count), (0, 0, 20));
        assert_eq!((flushes[1].block, flushes[1].first_instance, flushes[1].instance_count), (1, 0, 1));
        assert_eq!(batcher.stats().dropped_draws, 0);
    }

    #[test]
    fn exactly_twenty_draws_flush_once() {
        let mut batcher = DrawBatcher::new();
        let flushes = draw_3d(&mut batcher, &[1; 20]);
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].instance_count, 20);
        assert_eq!(batcher.blocks_3d().count(), 1);
    }

    #[test]
    fn flush_count_is_ceil_of_capacity_for_one_key() {
        for n in [1usize, 19, 40, 41, 100] {
            let mut batcher = DrawBatcher::new();
            let flushes = draw_3d(&mut batcher, &vec![3; n]);
            assert_eq!(flushes.len(), n.div_ceil(MAX_3D_INSTANCE as usize), "n = {n}");
            let total: u32 = flushes.iter().map(|f| f.instance_count).sum();
            assert_eq!(total as usize, n);
        }
    }

    #[test]
    fn key_change_splits_runs_inside_a_block() {
        let mut batcher = DrawBatcher::new();
        let flushes = draw_3d(&mut batcher, &[1, 1, 2, 2, 2, 1]);
        let runs: Vec<_> = flushes.iter().map(|f| (f.first_instance, f.instance_count)).collect();
        assert_eq!(runs, vec![(0, 2), (2, 3), (5, 1)]);
        assert!(flushes.iter().all(|f| f.block == 0));
    }

    #[test]
    fn draws_beyond_every_block_are_dropped() {
        let mut batcher = DrawBatcher::new();
        let capacity = (MAX_3D_INSTANCE * INSTANCE_BLOCKS) as usize;
        let flushes = draw_3d(&mut batcher, &vec![5; capacity + 3]);
        assert_eq!(flushes.len(), INSTANCE_BLOCKS as usize);
        assert_eq!(batcher.stats().dropped_draws, 3);
    }

    #[test]
    fn animated_draws_flush_immediately_with_their_own_slot() {
        let mut batcher = DrawBatcher::new();
        batcher.begin_frame();
        batcher.begin_phase(DrawPhase::DrawAnim3D);
        let mut slots = Vec::new();
        let mut flushes = Vec::new();
        for _ in 0..MAX_ANIMATIONS_PER_FRAME + 1 {
            let (outcome, slot) = batcher.push_anim(key(1), PerInstance3D::default());
            if matches!(outcome, PushOutcome::Queued(_)) {
                slots.push(slot);
            }
            drain(outcome, &mut flushes);
        }
        assert_eq!(flushes.len(), MAX_ANIMATIONS_PER_FRAME as usize);
        assert_eq!(slots, (0..MAX_ANIMATIONS_PER_FRAME).collect::<Vec<_>>());
        assert!(flushes.iter().all(|f| f.instance_count == 1));
        assert_eq!(flushes[3].bones_slot, Some(3));
        assert_eq!(batcher.stats().dropped_draws, 1);
        assert!(batcher.finish_frame().is_none());
    }

    #[test]
    fn phase_change_flushes_the_previous_phase() {
        let mut batcher = DrawBatcher::new();
        batcher.begin_frame();
        batcher.begin_phase(DrawPhase::Draw3D);
        batcher.push_model(key(1), PerInstance3D::default());
        let flush = batcher.begin_phase(DrawPhase::Draw2D).unwrap();
        assert_eq!(flush.phase, DrawPhase::Draw3D);

        let quad = Instance2D { model: Mat4::IDENTITY, frag: Frag2DData::default() };
        batcher.push_2d(BatchKey::Quad, quad);
        batcher.push_2d(BatchKey::Quad, quad);
        let flush = batcher.finish_frame().unwrap();
        assert_eq!(flush.phase, DrawPhase::Draw2D);
        assert_eq!(flush.instance_count, 2);
        assert_eq!(batcher.phase(), DrawPhase::Idle);
    }
}
