// An in process GpuDevice
//
// HeadlessDevice hands out fake handles and keeps device memory in host
// vectors. Recorded copies are executed when the command buffer is
// submitted, but the batch fence is only signaled by signal_fences() or
// a wait, which lets callers observe every step of an upload. It also
// counts live objects so leaks show up in tests.
use crate::device::{DescriptorWrite, GpuDevice, ImageInfo, ImageTransition};
use crate::{Result, StrataError};
use ash::vk;
use ash::vk::Handle;
use utils::align_up;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Alignment reported for every resource
pub const HEADLESS_ALIGNMENT: u64 = 256;

const DEVICE_LOCAL_TYPE: u32 = 0;
const HOST_VISIBLE_TYPE: u32 = 1;

/// A command as recorded into a transfer command buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecordedCommand {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        size: u64,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        image: vk::Image,
        extent: vk::Extent2D,
    },
    Transition(ImageTransition),
}

/// One call to submit_transfer
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub cbuf: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub commands: Vec<RecordedCommand>,
}

struct HMemory {
    m_type: u32,
    m_data: Vec<u8>,
}

struct HBuffer {
    b_size: u64,
    b_binding: Option<(u64, u64)>,
}

struct HImage {
    i_info: ImageInfo,
    i_binding: Option<(u64, u64)>,
    i_layout: vk::ImageLayout,
}

struct HPool {
    p_max_sets: u32,
    p_sets: Vec<u64>,
}

#[derive(Default)]
struct HeadlessState {
    hs_next_handle: u64,
    hs_memory: HashMap<u64, HMemory>,
    hs_buffers: HashMap<u64, HBuffer>,
    hs_images: HashMap<u64, HImage>,
    hs_views: HashSet<u64>,
    hs_samplers: HashSet<u64>,
    hs_modules: HashMap<u64, usize>,
    hs_layouts: HashSet<u64>,
    hs_pools: HashMap<u64, HPool>,
    hs_writes: Vec<DescriptorWrite>,
    /// Fence -> signaled
    hs_fences: HashMap<u64, bool>,
    hs_cbufs: HashMap<u64, Vec<RecordedCommand>>,
    hs_submissions: Vec<Submission>,
}

impl HeadlessState {
    fn handle(&mut self) -> u64 {
        self.hs_next_handle += 1;
        self.hs_next_handle
    }

    fn memory_range(&mut self, binding: Option<(u64, u64)>, len: u64) -> Result<&mut [u8]> {
        let (mem, offset) = binding.ok_or(StrataError::INVALID)?;
        let memory = self.hs_memory.get_mut(&mem).ok_or(StrataError::INVALID)?;
        let start = offset as usize;
        let end = start + len as usize;
        if end > memory.m_data.len() {
            return Err(StrataError::INVALID);
        }

        Ok(&mut memory.m_data[start..end])
    }

    fn buffer_bytes(&mut self, buffer: u64, len: u64) -> Result<Vec<u8>> {
        let binding = self
            .hs_buffers
            .get(&buffer)
            .ok_or(StrataError::INVALID)?
            .b_binding;
        Ok(self.memory_range(binding, len)?.to_vec())
    }

    fn execute(&mut self, cmd: &RecordedCommand) -> Result<()> {
        match *cmd {
            RecordedCommand::CopyBuffer { src, dst, size } => {
                let data = self.buffer_bytes(src.as_raw(), size)?;
                let binding = self
                    .hs_buffers
                    .get(&dst.as_raw())
                    .ok_or(StrataError::INVALID)?
                    .b_binding;
                self.memory_range(binding, size)?.copy_from_slice(&data);
            }
            RecordedCommand::CopyBufferToImage { src, image, extent } => {
                let len = extent.width as u64 * extent.height as u64 * 4;
                let data = self.buffer_bytes(src.as_raw(), len)?;
                let img = self
                    .hs_images
                    .get(&image.as_raw())
                    .ok_or(StrataError::INVALID)?;
                if img.i_layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
                    log::error!("Copy into image {:?} in layout {:?}", image, img.i_layout);
                    return Err(StrataError::INVALID);
                }
                let binding = img.i_binding;
                self.memory_range(binding, len)?.copy_from_slice(&data);
            }
            RecordedCommand::Transition(t) => {
                let img = self
                    .hs_images
                    .get_mut(&t.image.as_raw())
                    .ok_or(StrataError::INVALID)?;
                if t.old_layout != vk::ImageLayout::UNDEFINED && t.old_layout != img.i_layout {
                    return Err(StrataError::INVALID_LAYOUT_TRANSITION(img.i_layout, t.new_layout));
                }
                img.i_layout = t.new_layout;
            }
        }
        Ok(())
    }
}

pub struct HeadlessDevice {
    hd_auto_signal: bool,
    hd_state: Mutex<HeadlessState>,
}

impl HeadlessDevice {
    /// A device whose fences signal only on signal_fences() or a wait
    pub fn new() -> Self {
        Self {
            hd_auto_signal: false,
            hd_state: Mutex::new(HeadlessState::default()),
        }
    }

    /// A device that signals each fence as soon as its batch is submitted
    pub fn auto_signal() -> Self {
        Self {
            hd_auto_signal: true,
            ..Self::new()
        }
    }

    /// Signal every fence with submitted work, completing all batches
    pub fn signal_fences(&self) {
        let mut state = self.hd_state.lock().unwrap();
        let submitted: HashSet<u64> = state
            .hs_submissions
            .iter()
            .map(|s| s.fence.as_raw())
            .collect();

        for (fence, signaled) in state.hs_fences.iter_mut() {
            if submitted.contains(fence) {
                *signaled = true;
            }
        }
    }

    /// Every submission so far, in order
    pub fn submissions(&self) -> Vec<Submission> {
        self.hd_state.lock().unwrap().hs_submissions.clone()
    }

    /// Every descriptor write so far, in order
    pub fn descriptor_writes(&self) -> Vec<DescriptorWrite> {
        self.hd_state.lock().unwrap().hs_writes.clone()
    }

    /// Contents of the memory bound to `buffer`
    pub fn read_buffer(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        let mut state = self.hd_state.lock().unwrap();
        let size = state.hs_buffers.get(&buffer.as_raw())?.b_size;
        state.buffer_bytes(buffer.as_raw(), size).ok()
    }

    /// Texels of `image`, tightly packed RGBA8
    pub fn read_image(&self, image: vk::Image) -> Option<Vec<u8>> {
        let mut state = self.hd_state.lock().unwrap();
        let img = state.hs_images.get(&image.as_raw())?;
        let len = img.i_info.extent.width as u64 * img.i_info.extent.height as u64 * 4;
        let binding = img.i_binding;
        state.memory_range(binding, len).ok().map(|d| d.to_vec())
    }

    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.hd_state
            .lock()
            .unwrap()
            .hs_images
            .get(&image.as_raw())
            .map(|i| i.i_layout)
    }

    pub fn live_memory_count(&self) -> usize {
        self.hd_state.lock().unwrap().hs_memory.len()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.hd_state.lock().unwrap().hs_buffers.len()
    }

    pub fn live_image_count(&self) -> usize {
        self.hd_state.lock().unwrap().hs_images.len()
    }

    pub fn live_view_count(&self) -> usize {
        self.hd_state.lock().unwrap().hs_views.len()
    }

    pub fn live_sampler_count(&self) -> usize {
        self.hd_state.lock().unwrap().hs_samplers.len()
    }

    pub fn live_module_count(&self) -> usize {
        self.hd_state.lock().unwrap().hs_modules.len()
    }

    pub fn live_layout_count(&self) -> usize {
        self.hd_state.lock().unwrap().hs_layouts.len()
    }

    pub fn live_pool_count(&self) -> usize {
        self.hd_state.lock().unwrap().hs_pools.len()
    }

    pub fn live_fence_count(&self) -> usize {
        self.hd_state.lock().unwrap().hs_fences.len()
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for HeadlessDevice {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 2;
        props.memory_types[DEVICE_LOCAL_TYPE as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        props.memory_types[HOST_VISIBLE_TYPE as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        };
        props.memory_heap_count = 2;
        props.memory_heaps[0] = vk::MemoryHeap {
            size: 1 << 32,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        props.memory_heaps[1] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::empty(),
        };
        props
    }

    fn allocate_memory(&self, size: u64, memory_type: u32) -> Result<vk::DeviceMemory> {
        if memory_type > HOST_VISIBLE_TYPE {
            return Err(StrataError::VK_RESULT(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let mut state = self.hd_state.lock().unwrap();
        let handle = state.handle();
        state.hs_memory.insert(
            handle,
            HMemory {
                m_type: memory_type,
                m_data: vec![0; size as usize],
            },
        );

        Ok(vk::DeviceMemory::from_raw(handle))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let removed = self
            .hd_state
            .lock()
            .unwrap()
            .hs_memory
            .remove(&memory.as_raw());
        debug_assert!(removed.is_some(), "freeing unknown memory {:?}", memory);
    }

    fn write_memory(&self, memory: vk::DeviceMemory, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.hd_state.lock().unwrap();
        let mem = state
            .hs_memory
            .get_mut(&memory.as_raw())
            .ok_or(StrataError::INVALID)?;

        // only host visible memory can be mapped
        if mem.m_type != HOST_VISIBLE_TYPE {
            return Err(StrataError::VK_RESULT(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > mem.m_data.len() {
            return Err(StrataError::INVALID);
        }
        mem.m_data[start..end].copy_from_slice(data);

        Ok(())
    }

    fn create_buffer(&self, size: u64, _usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        let mut state = self.hd_state.lock().unwrap();
        let handle = state.handle();
        state.hs_buffers.insert(
            handle,
            HBuffer {
                b_size: size,
                b_binding: None,
            },
        );

        Ok(vk::Buffer::from_raw(handle))
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self
            .hd_state
            .lock()
            .unwrap()
            .hs_buffers
            .get(&buffer.as_raw())
            .map(|b| b.b_size)
            .unwrap_or(0);

        vk::MemoryRequirements {
            size: align_up(size, HEADLESS_ALIGNMENT),
            alignment: HEADLESS_ALIGNMENT,
            memory_type_bits: 0b11,
        }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()> {
        let mut state = self.hd_state.lock().unwrap();
        let buf = state
            .hs_buffers
            .get_mut(&buffer.as_raw())
            .ok_or(StrataError::INVALID)?;
        debug_assert!(buf.b_binding.is_none(), "buffer bound twice");
        buf.b_binding = Some((memory.as_raw(), offset));

        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let removed = self
            .hd_state
            .lock()
            .unwrap()
            .hs_buffers
            .remove(&buffer.as_raw());
        debug_assert!(removed.is_some(), "destroying unknown buffer {:?}", buffer);
    }

    fn create_image(&self, info: &ImageInfo) -> Result<vk::Image> {
        let mut state = self.hd_state.lock().unwrap();
        let handle = state.handle();
        state.hs_images.insert(
            handle,
            HImage {
                i_info: *info,
                i_binding: None,
                i_layout: vk::ImageLayout::UNDEFINED,
            },
        );

        Ok(vk::Image::from_raw(handle))
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let size = self
            .hd_state
            .lock()
            .unwrap()
            .hs_images
            .get(&image.as_raw())
            .map(|i| i.i_info.extent.width as u64 * i.i_info.extent.height as u64 * 4)
            .unwrap_or(0);

        vk::MemoryRequirements {
            size: align_up(size, HEADLESS_ALIGNMENT),
            alignment: HEADLESS_ALIGNMENT,
            // images are never host visible
            memory_type_bits: 1 << DEVICE_LOCAL_TYPE,
        }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()> {
        let mut state = self.hd_state.lock().unwrap();
        let img = state
            .hs_images
            .get_mut(&image.as_raw())
            .ok_or(StrataError::INVALID)?;
        debug_assert!(img.i_binding.is_none(), "image bound twice");
        img.i_binding = Some((memory.as_raw(), offset));

        Ok(())
    }

    fn destroy_image(&self, image: vk::Image) {
        let removed = self
            .hd_state
            .lock()
            .unwrap()
            .hs_images
            .remove(&image.as_raw());
        debug_assert!(removed.is_some(), "destroying unknown image {:?}", image);
    }

    fn create_image_view(&self, image: vk::Image, _format: vk::Format) -> Result<vk::ImageView> {
        let mut state = self.hd_state.lock().unwrap();
        if !state.hs_images.contains_key(&image.as_raw()) {
            return Err(StrataError::INVALID);
        }
        let handle = state.handle();
        state.hs_views.insert(handle);

        Ok(vk::ImageView::from_raw(handle))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.hd_state
            .lock()
            .unwrap()
            .hs_views
            .remove(&view.as_raw());
    }

    fn create_sampler(&self) -> Result<vk::Sampler> {
        let mut state = self.hd_state.lock().unwrap();
        let handle = state.handle();
        state.hs_samplers.insert(handle);

        Ok(vk::Sampler::from_raw(handle))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.hd_state
            .lock()
            .unwrap()
            .hs_samplers
            .remove(&sampler.as_raw());
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        if code.is_empty() {
            return Err(StrataError::VK_RESULT(vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        let mut state = self.hd_state.lock().unwrap();
        let handle = state.handle();
        state.hs_modules.insert(handle, code.len());

        Ok(vk::ShaderModule::from_raw(handle))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.hd_state
            .lock()
            .unwrap()
            .hs_modules
            .remove(&module.as_raw());
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let mut state = self.hd_state.lock().unwrap();
        let handle = state.handle();
        state.hs_layouts.insert(handle);

        Ok(vk::DescriptorSetLayout::from_raw(handle))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        let removed = self
            .hd_state
            .lock()
            .unwrap()
            .hs_layouts
            .remove(&layout.as_raw());
        debug_assert!(removed, "destroying unknown set layout {:?}", layout);
    }

    fn create_descriptor_pool(
        &self,
        _sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<vk::DescriptorPool> {
        let mut state = self.hd_state.lock().unwrap();
        let handle = state.handle();
        state.hs_pools.insert(
            handle,
            HPool {
                p_max_sets: max_sets,
                p_sets: Vec::new(),
            },
        );

        Ok(vk::DescriptorPool::from_raw(handle))
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>> {
        let mut state = self.hd_state.lock().unwrap();
        if !state.hs_layouts.contains(&layout.as_raw()) {
            return Err(StrataError::INVALID);
        }
        let handles: Vec<u64> = (0..count).map(|_| state.handle()).collect();

        let p = state
            .hs_pools
            .get_mut(&pool.as_raw())
            .ok_or(StrataError::INVALID)?;
        if p.p_sets.len() + count as usize > p.p_max_sets as usize {
            return Err(StrataError::VK_RESULT(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        p.p_sets.extend(handles.iter());

        Ok(handles
            .into_iter()
            .map(vk::DescriptorSet::from_raw)
            .collect())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let removed = self
            .hd_state
            .lock()
            .unwrap()
            .hs_pools
            .remove(&pool.as_raw());
        debug_assert!(removed.is_some(), "destroying unknown pool {:?}", pool);
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        self.hd_state
            .lock()
            .unwrap()
            .hs_writes
            .extend_from_slice(writes);
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.hd_state.lock().unwrap();
        let handle = state.handle();
        state.hs_fences.insert(handle, signaled);

        Ok(vk::Fence::from_raw(handle))
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        self.hd_state
            .lock()
            .unwrap()
            .hs_fences
            .get(&fence.as_raw())
            .copied()
            .ok_or(StrataError::INVALID)
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.hd_state.lock().unwrap();
        let signaled = state
            .hs_fences
            .get_mut(&fence.as_raw())
            .ok_or(StrataError::INVALID)?;
        *signaled = false;

        Ok(())
    }

    /// Work is executed at submit, so waiting just signals the fence
    fn wait_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.hd_state.lock().unwrap();
        let signaled = state
            .hs_fences
            .get_mut(&fence.as_raw())
            .ok_or(StrataError::INVALID)?;
        *signaled = true;

        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.hd_state
            .lock()
            .unwrap()
            .hs_fences
            .remove(&fence.as_raw());
    }

    fn allocate_transfer_cbuf(&self) -> Result<vk::CommandBuffer> {
        let mut state = self.hd_state.lock().unwrap();
        let handle = state.handle();
        state.hs_cbufs.insert(handle, Vec::new());

        Ok(vk::CommandBuffer::from_raw(handle))
    }

    fn free_transfer_cbuf(&self, cbuf: vk::CommandBuffer) {
        self.hd_state
            .lock()
            .unwrap()
            .hs_cbufs
            .remove(&cbuf.as_raw());
    }

    fn cbuf_begin_recording(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        let mut state = self.hd_state.lock().unwrap();
        state
            .hs_cbufs
            .get_mut(&cbuf.as_raw())
            .ok_or(StrataError::INVALID)?
            .clear();

        Ok(())
    }

    fn cbuf_end_recording(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        if self
            .hd_state
            .lock()
            .unwrap()
            .hs_cbufs
            .contains_key(&cbuf.as_raw())
        {
            Ok(())
        } else {
            Err(StrataError::INVALID)
        }
    }

    fn cmd_copy_buffer(&self, cbuf: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: u64) {
        if let Some(cmds) = self.hd_state.lock().unwrap().hs_cbufs.get_mut(&cbuf.as_raw()) {
            cmds.push(RecordedCommand::CopyBuffer {
                src: src,
                dst: dst,
                size: size,
            });
        }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cbuf: vk::CommandBuffer,
        src: vk::Buffer,
        image: vk::Image,
        extent: vk::Extent2D,
    ) {
        if let Some(cmds) = self.hd_state.lock().unwrap().hs_cbufs.get_mut(&cbuf.as_raw()) {
            cmds.push(RecordedCommand::CopyBufferToImage {
                src: src,
                image: image,
                extent: extent,
            });
        }
    }

    fn cmd_transition_image_layout(&self, cbuf: vk::CommandBuffer, transition: &ImageTransition) {
        if let Some(cmds) = self.hd_state.lock().unwrap().hs_cbufs.get_mut(&cbuf.as_raw()) {
            cmds.push(RecordedCommand::Transition(*transition));
        }
    }

    fn submit_transfer(&self, cbuf: vk::CommandBuffer, fence: vk::Fence) -> Result<()> {
        let mut state = self.hd_state.lock().unwrap();
        let commands = state
            .hs_cbufs
            .get(&cbuf.as_raw())
            .ok_or(StrataError::INVALID)?
            .clone();

        match state.hs_fences.get(&fence.as_raw()).copied() {
            Some(false) => {}
            // submitting with a signaled fence is a usage error
            _ => return Err(StrataError::INVALID),
        }

        for cmd in commands.iter() {
            state.execute(cmd)?;
        }

        state.hs_submissions.push(Submission {
            cbuf: cbuf,
            fence: fence,
            commands: commands,
        });
        if self.hd_auto_signal {
            state.hs_fences.insert(fence.as_raw(), true);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_local_memory_cannot_be_mapped() {
        let dev = HeadlessDevice::new();
        let local = dev.allocate_memory(256, DEVICE_LOCAL_TYPE).unwrap();
        let host = dev.allocate_memory(256, HOST_VISIBLE_TYPE).unwrap();

        assert!(dev.write_memory(local, 0, &[1, 2, 3]).is_err());
        assert!(dev.write_memory(host, 0, &[1, 2, 3]).is_ok());
        assert!(dev.write_memory(host, 255, &[1, 2]).is_err());

        dev.free_memory(local);
        dev.free_memory(host);
        assert_eq!(dev.live_memory_count(), 0);
    }

    #[test]
    fn copy_into_image_needs_transfer_layout() {
        let dev = HeadlessDevice::auto_signal();
        let extent = vk::Extent2D {
            width: 1,
            height: 1,
        };
        let image = dev
            .create_image(&ImageInfo {
                extent: extent,
                format: vk::Format::R8G8B8A8_SRGB,
                usage: vk::ImageUsageFlags::TRANSFER_DST,
            })
            .unwrap();
        let src = dev
            .create_buffer(4, vk::BufferUsageFlags::TRANSFER_SRC)
            .unwrap();
        let mem = dev.allocate_memory(512, HOST_VISIBLE_TYPE).unwrap();
        dev.bind_buffer_memory(src, mem, 0).unwrap();
        dev.bind_image_memory(image, mem, 256).unwrap();

        let cbuf = dev.allocate_transfer_cbuf().unwrap();
        let fence = dev.create_fence(false).unwrap();
        dev.cbuf_begin_recording(cbuf).unwrap();
        dev.cmd_copy_buffer_to_image(cbuf, src, image, extent);
        dev.cbuf_end_recording(cbuf).unwrap();

        assert!(dev.submit_transfer(cbuf, fence).is_err());
        assert!(!dev.fence_signaled(fence).unwrap());
    }

    #[test]
    fn pools_refuse_past_capacity() {
        let dev = HeadlessDevice::new();
        let layout = dev.create_descriptor_set_layout(&[]).unwrap();
        let pool = dev.create_descriptor_pool(&[], 2).unwrap();

        assert_eq!(dev.allocate_descriptor_sets(pool, layout, 2).unwrap().len(), 2);
        assert!(dev.allocate_descriptor_sets(pool, layout, 1).is_err());
    }
}
