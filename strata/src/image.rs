// Device images backed by the DeviceHeap
//
// Holds the VkImage, its view and its memory. Like Buffer, the memory is
// only released when the last reference (including any in flight upload)
// is dropped.
use crate::device::ImageInfo;
use crate::heap::{Allocation, DeviceHeap};
use crate::Result;
use ash::vk;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Image {
    i_heap: Arc<DeviceHeap>,
    i_image: vk::Image,
    i_view: vk::ImageView,
    i_alloc: Option<Allocation>,
    i_extent: vk::Extent2D,
    i_format: vk::Format,
    i_loaded: AtomicBool,
}

impl Image {
    /// Create a device local, sampled 2D image that can be copied into
    pub fn new(heap: &Arc<DeviceHeap>, extent: vk::Extent2D, format: vk::Format) -> Result<Self> {
        let dev = heap.device();
        let image = dev.create_image(&ImageInfo {
            extent: extent,
            format: format,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        })?;

        let alloc = match heap.allocate_for_image(image, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(a) => a,
            Err(e) => {
                dev.destroy_image(image);
                return Err(e);
            }
        };

        let view = match dev.create_image_view(image, format) {
            Ok(v) => v,
            Err(e) => {
                dev.destroy_image(image);
                heap.free_memory(alloc);
                return Err(e);
            }
        };

        Ok(Self {
            i_heap: heap.clone(),
            i_image: image,
            i_view: view,
            i_alloc: Some(alloc),
            i_extent: extent,
            i_format: format,
            i_loaded: AtomicBool::new(false),
        })
    }

    pub fn image(&self) -> vk::Image {
        self.i_image
    }

    pub fn view(&self) -> vk::ImageView {
        self.i_view
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.i_extent
    }

    pub fn format(&self) -> vk::Format {
        self.i_format
    }

    /// Bytes of tightly packed RGBA8 texel data filling the image
    pub fn texel_size(&self) -> u64 {
        self.i_extent.width as u64 * self.i_extent.height as u64 * 4
    }

    pub fn is_loaded(&self) -> bool {
        self.i_loaded.load(Ordering::Acquire)
    }

    pub(crate) fn set_loaded(&self) {
        self.i_loaded.store(true, Ordering::Release);
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let dev = self.i_heap.device();
        dev.destroy_image_view(self.i_view);
        dev.destroy_image(self.i_image);
        if let Some(alloc) = self.i_alloc.take() {
            self.i_heap.free_memory(alloc);
        }
    }
}
