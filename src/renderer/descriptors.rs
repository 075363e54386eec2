//! Named descriptor sets declared as plain data, then materialized as a
//! descriptor pool, per-frame sets and one mapped buffer backing every
//! buffer binding for every frame.

use bytemuck::Pod;
use crate::renderer::backend::{
    Backend, BufferDesc, BufferId, BufferUsage, DescriptorCounts, DescriptorKind,
    DescriptorPoolId, DescriptorResource, DescriptorSetId, DescriptorWrite, LayoutBinding,
    SetLayoutId, ShaderStages,
};
use crate::renderer::error::DeviceResult;

pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindingDecl {
    pub name: &'static str,
    pub kind: DescriptorKind,
    pub stages: ShaderStages,
    /// Byte size of one element, zero for samplers and images
    pub element_size: u64,
    pub array_len: u32,
    /// Number of dynamic-offset slots, 1 for non dynamic bindings
    pub dynamic_len: u32,
    /// The whole array is one struct in the shader rather than an array of descriptors
    pub single_array_struct: bool,
}

impl BindingDecl {
    pub fn uniform<T: Pod>(name: &'static str, stages: ShaderStages) -> Self {
        Self::buffer::<T>(name, DescriptorKind::UniformBuffer, stages, 1, false)
    }

    pub fn storage_array<T: Pod>(name: &'static str, stages: ShaderStages, len: u32) -> Self {
        Self::buffer::<T>(name, DescriptorKind::StorageBuffer, stages, len, true)
    }

    /// Switches the binding to its dynamic descriptor kind with `slots` offsets
    pub fn dynamic(mut self, slots: u32) -> Self {
        self.kind = match self.kind {
            DescriptorKind::UniformBuffer => DescriptorKind::UniformBufferDynamic,
            DescriptorKind::StorageBuffer => DescriptorKind::StorageBufferDynamic,
            kind => kind,
        };
        self.dynamic_len = slots.max(1);
        self
    }

    pub fn sampler(name: &'static str) -> Self {
        Self {
            name,
            kind: DescriptorKind::Sampler,
            stages: ShaderStages::Fragment,
            element_size: 0,
            array_len: 1,
            dynamic_len: 1,
            single_array_struct: false,
        }
    }

    pub fn images(name: &'static str, count: u32) -> Self {
        Self {
            name,
            kind: DescriptorKind::SampledImage,
            stages: ShaderStages::Fragment,
            element_size: 0,
            array_len: count,
            dynamic_len: 1,
            single_array_struct: false,
        }
    }

    fn buffer<T: Pod>(
        name: &'static str,
        kind: DescriptorKind,
        stages: ShaderStages,
        len: u32,
        single_array_struct: bool,
    ) -> Self {
        Self {
            name,
            kind,
            stages,
            element_size: size_of::<T>() as u64,
            array_len: len.max(1),
            dynamic_len: 1,
            single_array_struct,
        }
    }

    /// Descriptor count of this binding in its set layout
    pub fn descriptor_count(&self) -> u32 {
        if self.kind.is_buffer() && self.single_array_struct {
            1
        } else {
            self.array_len
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetDecl {
    pub name: &'static str,
    pub bindings: Vec<BindingDecl>,
}

impl SetDecl {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            bindings: Vec::new(),
        }
    }

    pub fn binding(mut self, binding: BindingDecl) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn layout_bindings(&self) -> Vec<LayoutBinding> {
        self.bindings
            .iter()
            .enumerate()
            .map(|(i, b)| LayoutBinding {
                binding: i as u32,
                kind: b.kind,
                count: b.descriptor_count(),
                stages: b.stages,
            })
            .collect()
    }

    pub fn dynamic_binding_count(&self) -> usize {
        self.bindings.iter().filter(|b| b.kind.is_dynamic()).count()
    }
}

/// Where one buffer binding lives inside a frame's region of the shader buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingLayout {
    pub offset: u64,
    pub element_size: u64,
    pub element_stride: u64,
    pub array_len: u32,
    /// Distance between dynamic slots
    pub dynamic_stride: u64,
    pub dynamic_len: u32,
}

impl BindingLayout {
    /// Byte range a single descriptor of this binding covers
    pub fn descriptor_range(&self, single_array_struct: bool) -> u64 {
        if single_array_struct {
            self.element_size * self.array_len as u64
        } else {
            self.element_size
        }
    }
}

/// Byte layout of every buffer binding of a group of sets, repeated per frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferLayout {
    pub frame_stride: u64,
    pub alignment: u64,
    slots: Vec<Vec<Option<BindingLayout>>>,
}

impl BufferLayout {
    pub fn compute(sets: &[&SetDecl], alignment: u64) -> Self {
        let mut offset = 0;
        let slots = sets
            .iter()
            .map(|set| {
                set.bindings
                    .iter()
                    .map(|b| {
                        if !b.kind.is_buffer() {
                            return None;
                        }
                        let element_stride = if b.single_array_struct {
                            b.element_size
                        } else {
                            align_up(b.element_size, alignment)
                        };
                        let dynamic_stride =
                            align_up(element_stride * b.array_len as u64, alignment);
                        let layout = BindingLayout {
                            offset,
                            element_size: b.element_size,
                            element_stride,
                            array_len: b.array_len,
                            dynamic_stride,
                            dynamic_len: b.dynamic_len,
                        };
                        offset += dynamic_stride * b.dynamic_len as u64;
                        Some(layout)
                    })
                    .collect()
            })
            .collect();

        Self {
            frame_stride: offset,
            alignment,
            slots,
        }
    }

    pub fn binding(&self, set: usize, binding: usize) -> Option<&BindingLayout> {
        self.slots.get(set)?.get(binding)?.as_ref()
    }

    /// Byte offset of one element, asserting every index is in range
    pub fn element_offset(
        &self,
        frame_count: usize,
        set: usize,
        binding: usize,
        frame: usize,
        array_index: u32,
        dynamic_slot: u32,
    ) -> u64 {
        let Some(layout) = self.binding(set, binding) else {
            panic!("set {set} binding {binding} is not a buffer binding");
        };
        assert!(frame < frame_count, "frame {frame} out of range ({frame_count} frames)");
        assert!(
            array_index < layout.array_len,
            "array index {array_index} out of range ({} elements)",
            layout.array_len
        );
        assert!(
            dynamic_slot < layout.dynamic_len,
            "dynamic slot {dynamic_slot} out of range ({} slots)",
            layout.dynamic_len
        );
        frame as u64 * self.frame_stride
            + layout.offset
            + dynamic_slot as u64 * layout.dynamic_stride
            + array_index as u64 * layout.element_stride
    }
}

/// Mapped buffer holding every buffer binding for every frame in flight
#[derive(Debug)]
pub struct ShaderBuffer {
    pub buffer: BufferId,
    pub layout: BufferLayout,
    pub frame_count: usize,
}

impl ShaderBuffer {
    pub fn build<B: Backend>(
        backend: &mut B,
        layout: BufferLayout,
        frame_count: usize,
    ) -> DeviceResult<Self> {
        let size = (layout.frame_stride * frame_count as u64).max(layout.alignment);
        let buffer = backend.create_buffer(&BufferDesc {
            label: "shader data".into(),
            size,
            usage: BufferUsage::Shader,
        })?;
        log::debug!(
            "shader buffer: {} bytes per frame, {} frames",
            layout.frame_stride,
            frame_count
        );
        Ok(Self {
            buffer,
            layout,
            frame_count,
        })
    }

    pub fn destroy<B: Backend>(self, backend: &mut B) {
        backend.destroy_buffer(self.buffer);
    }

    pub fn store<B: Backend, T: Pod>(
        &self,
        backend: &mut B,
        set: usize,
        binding: usize,
        frame: usize,
        data: &T,
        array_index: u32,
        dynamic_slot: u32,
    ) -> DeviceResult<()> {
        let offset = self.layout.element_offset(
            self.frame_count,
            set,
            binding,
            frame,
            array_index,
            dynamic_slot,
        );
        backend.write_buffer(self.buffer, offset, bytemuck::bytes_of(data))
    }

    /// Writes consecutive elements starting at `first_index`
    pub fn store_array<B: Backend, T: Pod>(
        &self,
        backend: &mut B,
        set: usize,
        binding: usize,
        frame: usize,
        items: &[T],
        first_index: u32,
        dynamic_slot: u32,
    ) -> DeviceResult<()> {
        let Some(last) = items.len().checked_sub(1) else {
            return Ok(());
        };
        // Bounds check for the final element
        self.layout.element_offset(
            self.frame_count,
            set,
            binding,
            frame,
            first_index + last as u32,
            dynamic_slot,
        );
        let offset = self.layout.element_offset(
            self.frame_count,
            set,
            binding,
            frame,
            first_index,
            dynamic_slot,
        );
        let stride = self.layout.binding(set, binding).map_or(0, |l| l.element_stride);
        if stride == size_of::<T>() as u64 {
            return backend.write_buffer(self.buffer, offset, bytemuck::cast_slice(items));
        }
        for (i, item) in items.iter().enumerate() {
            backend.write_buffer(
                self.buffer,
                offset + i as u64 * stride,
                bytemuck::bytes_of(item),
            )?;
        }
        Ok(())
    }

    pub fn read<B: Backend>(
        &self,
        backend: &B,
        set: usize,
        binding: usize,
        frame: usize,
        array_index: u32,
        dynamic_slot: u32,
        len: u64,
    ) -> DeviceResult<Vec<u8>> {
        let offset = self.layout.element_offset(
            self.frame_count,
            set,
            binding,
            frame,
            array_index,
            dynamic_slot,
        );
        backend.read_buffer(self.buffer, offset, len)
    }

    pub fn dynamic_offset(&self, set: usize, binding: usize, slot: u32) -> u32 {
        let Some(layout) = self.layout.binding(set, binding) else {
            panic!("set {set} binding {binding} is not a buffer binding");
        };
        assert!(slot < layout.dynamic_len, "dynamic slot {slot} out of range");
        (slot as u64 * layout.dynamic_stride) as u32
    }

    /// Descriptor writes pointing every buffer binding of `decl` at frame `frame`
    pub fn buffer_writes(&self, set: usize, decl: &SetDecl, frame: usize) -> Vec<DescriptorWrite> {
        let base = frame as u64 * self.layout.frame_stride;
        let mut writes = Vec::new();
        for (i, binding) in decl.bindings.iter().enumerate() {
            let Some(layout) = self.layout.binding(set, i) else {
                continue;
            };
            let range = layout.descriptor_range(binding.single_array_struct);
            let elements = binding.descriptor_count();
            for element in 0..elements {
                writes.push(DescriptorWrite {
                    binding: i as u32,
                    element,
                    resource: DescriptorResource::Buffer {
                        buffer: self.buffer,
                        offset: base + layout.offset + element as u64 * layout.element_stride,
                        range,
                    },
                });
            }
        }
        writes
    }
}

/// A descriptor pool and one set per frame for each declared set
#[derive(Debug)]
pub struct DescriptorSets {
    pub pool: DescriptorPoolId,
    sets: Vec<Vec<DescriptorSetId>>,
}

impl DescriptorSets {
    pub fn pool_requirements(decls: &[&SetDecl], frame_count: usize) -> (DescriptorCounts, u32) {
        let mut counts = DescriptorCounts::default();
        for decl in decls {
            for binding in decl.layout_bindings() {
                counts.add(binding.kind, binding.count * frame_count as u32);
            }
        }
        (counts, (decls.len() * frame_count) as u32)
    }

    pub fn build_pool_and_sets<B: Backend>(
        backend: &mut B,
        layouts: &[(SetLayoutId, &SetDecl)],
        frame_count: usize,
    ) -> DeviceResult<Self> {
        let decls = layouts.iter().map(|(_, d)| *d).collect::<Vec<_>>();
        let (counts, max_sets) = Self::pool_requirements(&decls, frame_count);
        let pool = backend.create_descriptor_pool(&counts, max_sets)?;

        let mut sets = Vec::with_capacity(layouts.len());
        for (layout, decl) in layouts {
            match backend.allocate_descriptor_sets(pool, *layout, frame_count as u32) {
                Ok(allocated) => sets.push(allocated),
                Err(e) => {
                    log::error!("failed to allocate descriptor set '{}'", decl.name);
                    backend.destroy_descriptor_pool(pool);
                    return Err(e);
                }
            }
        }

        Ok(Self { pool, sets })
    }

    pub fn get(&self, set: usize, frame: usize) -> DescriptorSetId {
        self.sets[set][frame]
    }

    pub fn destroy<B: Backend>(self, backend: &mut B) {
        backend.destroy_descriptor_pool(self.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::backend::headless::HeadlessBackend;
    use crate::renderer::backend::Extent2D;
    use glam::{Mat4, Vec4};

    fn sets() -> (SetDecl, SetDecl, SetDecl) {
        let single = SetDecl::new("view")
            .binding(BindingDecl::uniform::<Mat4>("view", ShaderStages::Vertex));
        let array = SetDecl::new("colours").binding(BindingDecl {
            single_array_struct: false,
            ..BindingDecl::storage_array::<Vec4>("colours", ShaderStages::Fragment, 3)
        });
        let dynamic = SetDecl::new("instances")
            .binding(BindingDecl::storage_array::<Mat4>("models", ShaderStages::Vertex, 4).dynamic(2))
            .binding(BindingDecl::sampler("sampler"));
        (single, array, dynamic)
    }

    #[test]
    fn strides_are_padded_to_alignment() {
        let (single, array, dynamic) = sets();
        let layout = BufferLayout::compute(&[&single, &array, &dynamic], 256);

        let view = layout.binding(0, 0).unwrap();
        assert_eq!(view.offset, 0);
        assert_eq!(view.dynamic_stride, 256);

        let colours = layout.binding(1, 0).unwrap();
        assert_eq!(colours.offset, 256);
        assert_eq!(colours.element_stride, 256);
        assert_eq!(colours.dynamic_stride, 768);

        let models = layout.binding(2, 0).unwrap();
        assert_eq!(models.offset, 1024);
        assert_eq!(models.element_stride, 64);
        assert_eq!(models.dynamic_stride, 256);
        assert!(layout.binding(2, 1).is_none());

        assert_eq!(layout.frame_stride, 1024 + 512);
        assert_eq!(layout.element_offset(2, 2, 0, 1, 3, 1), 1536 + 1024 + 256 + 192);
    }

    #[test]
    fn stored_data_reads_back_for_every_binding_type() {
        let (single, array, dynamic) = sets();
        let mut backend = HeadlessBackend::new(Extent2D::new(8, 8));
        let layout = BufferLayout::compute(&[&single, &array, &dynamic], 64);
        let buffer = ShaderBuffer::build(&mut backend, layout, 2).unwrap();

        let view = Mat4::from_scale(glam::Vec3::splat(2.0));
        buffer.store(&mut backend, 0, 0, 1, &view, 0, 0).unwrap();
        let colour = Vec4::new(0.1, 0.2, 0.3, 0.4);
        buffer.store(&mut backend, 1, 0, 0, &colour, 2, 0).unwrap();
        let models = [Mat4::IDENTITY, view];
        buffer.store_array(&mut backend, 2, 0, 1, &models, 2, 1).unwrap();

        let read = buffer.read(&backend, 0, 0, 1, 0, 0, 64).unwrap();
        assert_eq!(read, bytemuck::bytes_of(&view));
        let read = buffer.read(&backend, 1, 0, 0, 2, 0, 16).unwrap();
        assert_eq!(read, bytemuck::bytes_of(&colour));
        let read = buffer.read(&backend, 2, 0, 1, 3, 1, 64).unwrap();
        assert_eq!(read, bytemuck::bytes_of(&view));
        // Other frame untouched
        let read = buffer.read(&backend, 2, 0, 0, 3, 1, 64).unwrap();
        assert!(read.iter().all(|b| *b == 0));
    }

    #[test]
    #[should_panic(expected = "array index")]
    fn out_of_range_array_index_panics() {
        let (single, array, dynamic) = sets();
        let layout = BufferLayout::compute(&[&single, &array, &dynamic], 64);
        layout.element_offset(2, 1, 0, 0, 3, 0);
    }

    #[test]
    #[should_panic(expected = "dynamic slot")]
    fn out_of_range_dynamic_slot_panics() {
        let (single, array, dynamic) = sets();
        let layout = BufferLayout::compute(&[&single, &array, &dynamic], 64);
        layout.element_offset(2, 2, 0, 0, 0, 2);
    }

    #[test]
    fn pool_and_sets_are_sized_per_frame() {
        let (single, array, dynamic) = sets();
        let mut backend = HeadlessBackend::new(Extent2D::new(8, 8));
        let decls = [&single, &array, &dynamic];
        let (counts, max_sets) = DescriptorSets::pool_requirements(&decls, 3);
        assert_eq!(max_sets, 9);
        assert_eq!(counts.get(DescriptorKind::StorageBuffer), 9);
        assert_eq!(counts.get(DescriptorKind::StorageBufferDynamic), 3);
        assert_eq!(counts.get(DescriptorKind::Sampler), 3);

        let layouts = decls
            .iter()
            .map(|d| (backend.create_set_layout(&d.layout_bindings()).unwrap(), *d))
            .collect::<Vec<_>>();
        let sets = DescriptorSets::build_pool_and_sets(&mut backend, &layouts, 3).unwrap();
        assert_ne!(sets.get(2, 0), sets.get(2, 2));
        sets.destroy(&mut backend);
    }
}
