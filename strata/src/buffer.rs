// Device buffers backed by the DeviceHeap
//
// The buffer's memory goes back to its arena when the last reference is
// dropped. Transfer jobs hold a reference, so a buffer released while its
// upload is in flight is only freed once the upload has completed.
use crate::heap::{Allocation, DeviceHeap};
use crate::Result;
use ash::vk;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Buffer {
    b_heap: Arc<DeviceHeap>,
    b_buffer: vk::Buffer,
    b_alloc: Option<Allocation>,
    b_size: u64,
    /// Set once an upload into this buffer has completed
    b_loaded: AtomicBool,
}

impl Buffer {
    /// Create a buffer of `size` bytes and bind heap memory with `flags`
    pub fn new(
        heap: &Arc<DeviceHeap>,
        size: u64,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let dev = heap.device();
        let buffer = dev.create_buffer(size, usage)?;

        let alloc = match heap.allocate_for_buffer(buffer, flags) {
            Ok(a) => a,
            Err(e) => {
                dev.destroy_buffer(buffer);
                return Err(e);
            }
        };

        Ok(Self {
            b_heap: heap.clone(),
            b_buffer: buffer,
            b_alloc: Some(alloc),
            b_size: size,
            b_loaded: AtomicBool::new(false),
        })
    }

    /// A host visible, coherent buffer used as a copy source
    pub fn staging(heap: &Arc<DeviceHeap>, size: u64) -> Result<Self> {
        Self::new(
            heap,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.b_buffer
    }

    pub fn size(&self) -> u64 {
        self.b_size
    }

    pub fn allocation(&self) -> Option<&Allocation> {
        self.b_alloc.as_ref()
    }

    /// Write into the buffer from the host
    ///
    /// The buffer must have been created with host visible memory.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        match self.b_alloc.as_ref() {
            Some(alloc) if offset + data.len() as u64 <= self.b_size => {
                self.b_heap.write(alloc, offset, data)
            }
            _ => Err(crate::StrataError::INVALID),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.b_loaded.load(Ordering::Acquire)
    }

    pub(crate) fn set_loaded(&self) {
        self.b_loaded.store(true, Ordering::Release);
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.b_heap.device().destroy_buffer(self.b_buffer);
        if let Some(alloc) = self.b_alloc.take() {
            self.b_heap.free_memory(alloc);
        }
    }
}
