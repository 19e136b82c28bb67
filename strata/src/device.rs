// The device and queue provider
//
// Everything in strata reaches the GPU through `GpuDevice`. The Vulkan
// implementation lives in vkdevice.rs, and headless.rs emulates a device
// in process for tests and CI.
use crate::{Result, StrataError};
use ash::vk;

/// Description of a 2D image with a single mip level and layer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageInfo {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
}

/// One image layout transition to record into a command buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl ImageTransition {
    /// Work out the access masks and pipeline stages for a transition
    ///
    /// Only the transitions needed to upload a texture on the transfer
    /// queue are supported. The final transition releases the image to
    /// the bottom of the pipe, since the transfer queue can't wait on
    /// shader stages. The fence wait on the host makes the writes
    /// visible to later graphics submissions.
    pub fn new(image: vk::Image, old: vk::ImageLayout, new: vk::ImageLayout) -> Result<Self> {
        let (src_access, dst_access, src_stage, dst_stage) = match (old, new) {
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
            ),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            ),
            _ => return Err(StrataError::INVALID_LAYOUT_TRANSITION(old, new)),
        };

        Ok(Self {
            image: image,
            old_layout: old,
            new_layout: new,
            src_access: src_access,
            dst_access: dst_access,
            src_stage: src_stage,
            dst_stage: dst_stage,
        })
    }
}

/// The resource written into one binding of a descriptor set
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DescriptorResource {
    Image {
        view: vk::ImageView,
        sampler: vk::Sampler,
    },
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
}

/// A single descriptor update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub resource: DescriptorResource,
}

/// A logical device with a transfer queue
///
/// Implementations own the native device, the transfer queue (distinct
/// from the graphics queue where the hardware allows it) and the command
/// pool transfer command buffers come from. Creation calls return the
/// native error code on failure. Destroy calls must only be handed
/// objects this device created.
pub trait GpuDevice: Send + Sync {
    /// Memory types and heaps of the physical device
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;

    // ------------------------------ memory ------------------------------
    fn allocate_memory(&self, size: u64, memory_type: u32) -> Result<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    /// Copy `data` into host visible memory starting at `offset`
    fn write_memory(&self, memory: vk::DeviceMemory, offset: u64, data: &[u8]) -> Result<()>;

    // ------------------------------ buffers -----------------------------
    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<vk::Buffer>;
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()>;
    fn destroy_buffer(&self, buffer: vk::Buffer);

    // ------------------------------ images ------------------------------
    fn create_image(&self, info: &ImageInfo) -> Result<vk::Image>;
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<()>;
    fn destroy_image(&self, image: vk::Image);
    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    /// A linear filtering, repeating sampler
    fn create_sampler(&self) -> Result<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // ------------------------------ shaders -----------------------------
    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);

    // ---------------------------- descriptors ---------------------------
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<vk::DescriptorPool>;
    /// Allocate `count` sets of `layout` from `pool`
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>>;
    /// Destroys the pool and implicitly every set allocated from it
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    // ------------------------------ fences ------------------------------
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    /// Poll the fence, never blocks
    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    /// Block until the fence is signaled
    fn wait_fence(&self, fence: vk::Fence) -> Result<()>;
    fn destroy_fence(&self, fence: vk::Fence);

    // -------------------------- transfer queue --------------------------
    /// Allocate a primary command buffer for the transfer queue
    fn allocate_transfer_cbuf(&self) -> Result<vk::CommandBuffer>;
    fn free_transfer_cbuf(&self, cbuf: vk::CommandBuffer);
    /// Reset `cbuf` and begin one time submit recording
    fn cbuf_begin_recording(&self, cbuf: vk::CommandBuffer) -> Result<()>;
    fn cbuf_end_recording(&self, cbuf: vk::CommandBuffer) -> Result<()>;
    fn cmd_copy_buffer(&self, cbuf: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: u64);
    /// Copy tightly packed texels into the whole of `image`
    fn cmd_copy_buffer_to_image(
        &self,
        cbuf: vk::CommandBuffer,
        src: vk::Buffer,
        image: vk::Image,
        extent: vk::Extent2D,
    );
    fn cmd_transition_image_layout(&self, cbuf: vk::CommandBuffer, transition: &ImageTransition);
    /// Submit `cbuf` to the transfer queue, signaling `fence` on completion
    fn submit_transfer(&self, cbuf: vk::CommandBuffer, fence: vk::Fence) -> Result<()>;
}
