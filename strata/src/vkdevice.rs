// Vulkan device representation
//
// Implements GpuDevice on a real GPU. Uploads go through a transfer
// queue, taken from a transfer only family when the hardware has one.
use ash::vk;

use crate::device::{DescriptorResource, DescriptorWrite, GpuDevice, ImageInfo, ImageTransition};
use crate::instance::Instance;
use crate::{CreateInfo, Result, StrataError};

use std::collections::HashMap;
use std::sync::Mutex;

/// State that Vulkan requires to be externally synchronized
struct VkDeviceInternal {
    /// queue for copy operations
    transfer_queue: vk::Queue,
    /// pool the transfer command buffers come from
    copy_cmd_pool: vk::CommandPool,
    /// Host visible memory is mapped once and left mapped, this holds
    /// the mapped address of each allocation
    mappings: HashMap<vk::DeviceMemory, usize>,
}

/// Strata Vulkan device
pub struct VkDevice {
    vd_inst: Instance,
    /// the logical device we are using
    vd_dev: ash::Device,
    /// the physical device we picked
    vd_pdev: vk::PhysicalDevice,
    vd_mem_props: vk::PhysicalDeviceMemoryProperties,
    vd_graphics_family: u32,
    vd_transfer_family: u32,
    vd_internal: Mutex<VkDeviceInternal>,
}

impl VkDevice {
    /// Create a logical device with one graphics and one transfer queue
    fn create_device(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        queues: &[u32],
    ) -> Result<ash::Device> {
        // one queue per family, so one priority
        let priorities = [1.0];
        let mut queue_infos = Vec::new();
        for i in queues {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(*i)
                    .queue_priorities(&priorities)
                    .build(),
            );
        }

        let dev_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(queue_infos.as_ref())
            .build();

        Ok(unsafe { inst.create_device(pdev, &dev_create_info, None)? })
    }

    /// Choose the (graphics, transfer) queue families of `pdev`
    ///
    /// A family with TRANSFER but not GRAPHICS is the dedicated copy
    /// engine on most discrete GPUs. Without one, transfers share the
    /// graphics family.
    fn select_queue_families(inst: &ash::Instance, pdev: vk::PhysicalDevice) -> Option<(u32, u32)> {
        // get the properties per queue family
        let families = unsafe { inst.get_physical_device_queue_family_properties(pdev) };

        let graphics = families
            .iter()
            .position(|info| info.queue_flags.contains(vk::QueueFlags::GRAPHICS))?
            as u32;
        let transfer = families
            .iter()
            .position(|info| {
                info.queue_flags.contains(vk::QueueFlags::TRANSFER)
                    && !info.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            })
            .map(|i| i as u32)
            .unwrap_or(graphics);

        Some((graphics, transfer))
    }

    /// Choose a vkPhysicalDevice and its queue families
    ///
    /// Takes the first device that has a graphics queue.
    fn select_pdev(inst: &ash::Instance) -> Result<(vk::PhysicalDevice, u32, u32)> {
        let pdevices = unsafe { inst.enumerate_physical_devices()? };

        pdevices
            .iter()
            .find_map(|pdev| {
                Self::select_queue_families(inst, *pdev).map(|(g, t)| (*pdev, g, t))
            })
            .ok_or(StrataError::NO_SUITABLE_PHYSICAL_DEVICE)
    }

    pub fn new(info: &CreateInfo) -> Result<Self> {
        let instance = Instance::new(info)?;
        let (pdev, graphics_family, transfer_family) = Self::select_pdev(&instance.inst)?;
        let mem_props = unsafe { instance.inst.get_physical_device_memory_properties(pdev) };

        let mut families = vec![graphics_family];
        if transfer_family != graphics_family {
            families.push(transfer_family);
        }
        let dev = Self::create_device(&instance.inst, pdev, &families)?;
        let transfer_queue = unsafe { dev.get_device_queue(transfer_family, 0) };

        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(transfer_family);
        let copy_cmd_pool = match unsafe { dev.create_command_pool(&pool_create_info, None) } {
            Ok(p) => p,
            Err(e) => {
                unsafe { dev.destroy_device(None) };
                return Err(e.into());
            }
        };

        let props = unsafe { instance.inst.get_physical_device_properties(pdev) };
        let name = unsafe { std::ffi::CStr::from_ptr(props.device_name.as_ptr()) };
        log::info!(
            "Using {:?}: graphics family {}, transfer family {}",
            name,
            graphics_family,
            transfer_family
        );

        Ok(Self {
            vd_inst: instance,
            vd_dev: dev,
            vd_pdev: pdev,
            vd_mem_props: mem_props,
            vd_graphics_family: graphics_family,
            vd_transfer_family: transfer_family,
            vd_internal: Mutex::new(VkDeviceInternal {
                transfer_queue: transfer_queue,
                copy_cmd_pool: copy_cmd_pool,
                mappings: HashMap::new(),
            }),
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.vd_dev
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.vd_inst.inst
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.vd_pdev
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.vd_graphics_family
    }

    pub fn transfer_queue_family(&self) -> u32 {
        self.vd_transfer_family
    }

    /// Resources are shared between the graphics and transfer queues
    /// without ownership transfers when the families differ
    fn sharing(&self) -> (vk::SharingMode, Vec<u32>) {
        match self.vd_graphics_family == self.vd_transfer_family {
            true => (vk::SharingMode::EXCLUSIVE, Vec::new()),
            false => (
                vk::SharingMode::CONCURRENT,
                vec![self.vd_graphics_family, self.vd_transfer_family],
            ),
        }
    }
}

impl GpuDevice for VkDevice {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.vd_mem_props
    }

    fn allocate_memory(&self, size: u64, memory_type: u32) -> Result<vk::DeviceMemory> {
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type);

        Ok(unsafe { self.vd_dev.allocate_memory(&alloc_info, None)? })
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut internal = self.vd_internal.lock().unwrap();
        unsafe {
            if internal.mappings.remove(&memory).is_some() {
                self.vd_dev.unmap_memory(memory);
            }
            self.vd_dev.free_memory(memory, None);
        }
    }

    fn write_memory(&self, memory: vk::DeviceMemory, offset: u64, data: &[u8]) -> Result<()> {
        let mut internal = self.vd_internal.lock().unwrap();

        let base = match internal.mappings.get(&memory) {
            Some(ptr) => *ptr,
            None => {
                let ptr = unsafe {
                    self.vd_dev.map_memory(
                        memory,
                        0,
                        vk::WHOLE_SIZE,
                        vk::MemoryMapFlags::empty(),
                    )?
                };
                internal.mappings.insert(memory, ptr as usize);
                ptr as usize
            }
        };

        // The memory is host coherent, no flush is needed
        unsafe {
            let dst = std::slice::from_raw_parts_mut((base + offset as usize) as *mut u8, data.len());
            dst.copy_from_slice(data);
        }

        Ok(())
    }

    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        let (mode, families) = self.sharing();
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(mode)
            .queue_family_indices(&families);

        Ok(unsafe { self.vd_dev.create_buffer(&create_info, None)? })
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.vd_dev.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()> {
        Ok(unsafe { self.vd_dev.bind_buffer_memory(buffer, memory, offset)? })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.vd_dev.destroy_buffer(buffer, None) }
    }

    fn create_image(&self, info: &ImageInfo) -> Result<vk::Image> {
        let (mode, families) = self.sharing();
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(info.format)
            .extent(vk::Extent3D {
                width: info.extent.width,
                height: info.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage)
            .sharing_mode(mode)
            .queue_family_indices(&families)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        Ok(unsafe { self.vd_dev.create_image(&create_info, None)? })
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.vd_dev.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()> {
        Ok(unsafe { self.vd_dev.bind_image_memory(image, memory, offset)? })
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.vd_dev.destroy_image(image, None) }
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1)
                    .build(),
            )
            .image(image)
            .format(format)
            .view_type(vk::ImageViewType::TYPE_2D);

        Ok(unsafe { self.vd_dev.create_image_view(&view_info, None)? })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.vd_dev.destroy_image_view(view, None) }
    }

    fn create_sampler(&self) -> Result<vk::Sampler> {
        let info = vk::SamplerCreateInfo::builder()
            // filter for magnified (oversampled) pixels
            .mag_filter(vk::Filter::LINEAR)
            // filter for minified (undersampled) pixels
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(false)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            // texture coords are [0,1)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR);

        Ok(unsafe { self.vd_dev.create_sampler(&info, None)? })
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.vd_dev.destroy_sampler(sampler, None) }
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::builder().code(code);

        Ok(unsafe { self.vd_dev.create_shader_module(&info, None)? })
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.vd_dev.destroy_shader_module(module, None) }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);

        Ok(unsafe { self.vd_dev.create_descriptor_set_layout(&info, None)? })
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.vd_dev.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_descriptor_pool(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<vk::DescriptorPool> {
        // Sets are recycled by the pool group and never freed individually
        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(sizes)
            .max_sets(max_sets);

        Ok(unsafe { self.vd_dev.create_descriptor_pool(&info, None)? })
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>> {
        let layouts = vec![layout; count as usize];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        Ok(unsafe { self.vd_dev.allocate_descriptor_sets(&info)? })
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.vd_dev.destroy_descriptor_pool(pool, None) }
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        // The info structs must stay put while the writes point at them
        let image_infos: Vec<vk::DescriptorImageInfo> = writes
            .iter()
            .map(|w| match w.resource {
                DescriptorResource::Image { view, sampler } => vk::DescriptorImageInfo {
                    sampler: sampler,
                    image_view: view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
                DescriptorResource::Buffer { .. } => vk::DescriptorImageInfo::default(),
            })
            .collect();
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = writes
            .iter()
            .map(|w| match w.resource {
                DescriptorResource::Buffer {
                    buffer,
                    offset,
                    range,
                } => vk::DescriptorBufferInfo {
                    buffer: buffer,
                    offset: offset,
                    range: range,
                },
                DescriptorResource::Image { .. } => vk::DescriptorBufferInfo::default(),
            })
            .collect();

        let native: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(w.set)
                    .dst_binding(w.binding)
                    .dst_array_element(0)
                    .descriptor_type(w.ty);
                match w.resource {
                    DescriptorResource::Image { .. } => builder
                        .image_info(std::slice::from_ref(&image_infos[i]))
                        .build(),
                    DescriptorResource::Buffer { .. } => builder
                        .buffer_info(std::slice::from_ref(&buffer_infos[i]))
                        .build(),
                }
            })
            .collect();

        unsafe { self.vd_dev.update_descriptor_sets(&native, &[]) }
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = match signaled {
            true => vk::FenceCreateFlags::SIGNALED,
            false => vk::FenceCreateFlags::empty(),
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);

        Ok(unsafe { self.vd_dev.create_fence(&info, None)? })
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.vd_dev.get_fence_status(fence)? })
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        Ok(unsafe { self.vd_dev.reset_fences(&[fence])? })
    }

    fn wait_fence(&self, fence: vk::Fence) -> Result<()> {
        Ok(unsafe { self.vd_dev.wait_for_fences(&[fence], true, u64::MAX)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.vd_dev.destroy_fence(fence, None) }
    }

    fn allocate_transfer_cbuf(&self) -> Result<vk::CommandBuffer> {
        let internal = self.vd_internal.lock().unwrap();
        let cbuf_allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(1)
            .command_pool(internal.copy_cmd_pool)
            .level(vk::CommandBufferLevel::PRIMARY);

        let cbufs = unsafe { self.vd_dev.allocate_command_buffers(&cbuf_allocate_info)? };
        cbufs.into_iter().next().ok_or(StrataError::INVALID)
    }

    fn free_transfer_cbuf(&self, cbuf: vk::CommandBuffer) {
        let internal = self.vd_internal.lock().unwrap();
        unsafe {
            self.vd_dev
                .free_command_buffers(internal.copy_cmd_pool, &[cbuf])
        }
    }

    fn cbuf_begin_recording(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        unsafe {
            // first reset the cbuf so we know it is empty
            self.vd_dev
                .reset_command_buffer(cbuf, vk::CommandBufferResetFlags::RELEASE_RESOURCES)?;

            // this cbuf will only be used once per recording, so tell
            // vulkan that so it can optimize accordingly
            let record_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.vd_dev.begin_command_buffer(cbuf, &record_info)?;
        }
        Ok(())
    }

    fn cbuf_end_recording(&self, cbuf: vk::CommandBuffer) -> Result<()> {
        Ok(unsafe { self.vd_dev.end_command_buffer(cbuf)? })
    }

    fn cmd_copy_buffer(&self, cbuf: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: u64) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: size,
        };
        unsafe { self.vd_dev.cmd_copy_buffer(cbuf, src, dst, &[region]) }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cbuf: vk::CommandBuffer,
        src: vk::Buffer,
        image: vk::Image,
        extent: vk::Extent2D,
    ) {
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            // zero means tightly packed
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1)
                    .build(),
            )
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .build();

        unsafe {
            self.vd_dev.cmd_copy_buffer_to_image(
                cbuf,
                src,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            )
        }
    }

    fn cmd_transition_image_layout(&self, cbuf: vk::CommandBuffer, transition: &ImageTransition) {
        let layout_barrier = vk::ImageMemoryBarrier::builder()
            .image(transition.image)
            .src_access_mask(transition.src_access)
            .dst_access_mask(transition.dst_access)
            .old_layout(transition.old_layout)
            .new_layout(transition.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1)
                    .level_count(1)
                    .build(),
            )
            .build();

        unsafe {
            self.vd_dev.cmd_pipeline_barrier(
                cbuf,
                transition.src_stage,
                transition.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[layout_barrier],
            )
        }
    }

    fn submit_transfer(&self, cbuf: vk::CommandBuffer, fence: vk::Fence) -> Result<()> {
        let internal = self.vd_internal.lock().unwrap();
        let cbufs = [cbuf];
        let submit_info = [vk::SubmitInfo::builder().command_buffers(&cbufs).build()];

        Ok(unsafe {
            self.vd_dev
                .queue_submit(internal.transfer_queue, &submit_info, fence)?
        })
    }
}

impl Drop for VkDevice {
    fn drop(&mut self) {
        let mut internal = self.vd_internal.lock().unwrap();

        unsafe {
            // first wait for the device to finish working
            if let Err(e) = self.vd_dev.device_wait_idle() {
                log::error!("Could not idle the device: {}", e);
            }
            for (memory, _) in internal.mappings.drain() {
                self.vd_dev.unmap_memory(memory);
            }
            self.vd_dev
                .destroy_command_pool(internal.copy_cmd_pool, None);
            self.vd_dev.destroy_device(None);
        }
    }
}
