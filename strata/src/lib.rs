//! # Strata: a GPU resource layer
//!
//! Strata owns the device memory, binding set allocation, and host to
//! device transfers for a renderer's scene. It is built from three
//! pieces:
//!
//! * `MemoryArena`/`DeviceHeap` - a buddy allocator that carves large
//! device memory blocks into power of two chunks.
//! * `BindingSetRegistry` - shared, recycled descriptor pools keyed by
//! the hash of a binding layout.
//! * `AsyncTransferEngine` - fence gated staging copies on the transfer
//! queue, pumped once per frame without blocking.
//!
//! Meshes, textures, shaders and materials are built on top of these and
//! are shared by id through a `ResourceManager`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata::{CreateInfo, GpuContext, HeadlessDevice, MemorySource, ResourceManager};
//!
//! let info = CreateInfo::builder().arena_chunk_count(64).build();
//! let dev = Arc::new(HeadlessDevice::new());
//! let data = Arc::new(MemorySource::new());
//! let ctx = Arc::new(GpuContext::new(dev, data, &info).unwrap());
//! let mut resources = ResourceManager::new(ctx).unwrap();
//!
//! // once per frame
//! resources.update().unwrap();
//! ```
//!
//! ## Requirements
//!
//! The Vulkan backend needs a Vulkan 1.2 loader at runtime. Everything
//! else, including the test suite, runs on the `HeadlessDevice`.
#![allow(non_camel_case_types)]

#[macro_use]
extern crate memoffset;

mod arena;
mod blob;
mod buffer;
mod context;
mod data;
mod descpool;
mod device;
mod headless;
mod heap;
mod image;
mod instance;
mod layout;
mod loader;
mod manager;
mod material;
mod mesh;
mod registry;
mod resource;
mod shader;
mod texture;
mod transfer;
mod vkdevice;

pub use arena::{MemoryArena, GPU_MEMORY_ARENA_CHUNK_COUNT, GPU_MEMORY_CHUNK_SIZE};
pub use blob::{
    write_mesh_blob, write_shader_blob, write_texture_blob, MeshHeader, ShaderHeader,
    TextureHeader, Vertex, BLOB_HEADER_SIZE,
};
pub use buffer::Buffer;
pub use context::GpuContext;
pub use data::{DataSource, FileDatabase, MemorySource, ReadSeek, DATABASE_FILE};
pub use descpool::{BindingPool, BindingPoolGroup, DESCRIPTOR_POOL_SIZE};
pub use device::{DescriptorResource, DescriptorWrite, GpuDevice, ImageInfo, ImageTransition};
pub use headless::{HeadlessDevice, RecordedCommand, Submission, HEADLESS_ALIGNMENT};
pub use heap::{Allocation, DeviceHeap, HeapStats};
pub use image::Image;
pub use layout::{BindingDescription, BindingLayout, BindingType, FieldLocation, UniformField};
pub use loader::{AsyncTransferEngine, JobState};
pub use manager::{MaterialDesc, ResourceManager, SharedMaterialDesc};
pub use material::{Material, SharedMaterial};
pub use mesh::Mesh;
pub use registry::BindingSetRegistry;
pub use resource::{GpuResource, ResourceHandle, ResourceId, ResourceState};
pub use shader::Shader;
pub use texture::{Texture, TEXTURE_FORMAT};
pub use transfer::{BufferTransfer, Completion, ImageTransfer, TransferJob, TransferJobId};
pub use vkdevice::VkDevice;

extern crate ash;
pub use ash::vk;
use thiserror::Error;

/// Strata errors
///
/// Device errors carry the native result code. Programming errors such
/// as freeing an unregistered layout also trip a debug assertion before
/// the error is returned.
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Vulkan call failed: {0}")]
    VK_RESULT(#[from] vk::Result),
    #[error("Could not load the Vulkan library")]
    VK_LOADING,
    #[error("No physical device with graphics and transfer queues")]
    NO_SUITABLE_PHYSICAL_DEVICE,
    #[error("No memory type matches the requested properties")]
    NO_COMPATIBLE_MEMORY_TYPE,
    #[error("Arena of {1} chunks of {0} bytes, both must be nonzero powers of two")]
    INVALID_ARENA_SIZE(u64, u64),
    #[error("Allocation of {0} bytes can never be satisfied")]
    ALLOCATION_TOO_LARGE(u64),
    #[error("Binding layout {0:#x} is not registered")]
    UNREGISTERED_LAYOUT(u64),
    #[error("Unknown binding type \"{0}\"")]
    INVALID_BINDING_TYPE(String),
    #[error("Binding {0} is declared with conflicting types")]
    CONFLICTING_BINDING(u32),
    #[error("Unknown binding name \"{0}\"")]
    UNKNOWN_BINDING(String),
    #[error("Unsupported image layout transition {0:?} -> {1:?}")]
    INVALID_LAYOUT_TRANSITION(vk::ImageLayout, vk::ImageLayout),
    #[error("I/O error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Could not decode blob: {0}")]
    BINCODE(#[from] bincode::Error),
    #[error("Malformed resource blob: {0}")]
    INVALID_BLOB(String),
    #[error("Resource {0} was not found")]
    RESOURCE_NOT_FOUND(ResourceId),
    #[error("Could not parse data database: {0}")]
    DATABASE(#[from] serde_json::Error),
    #[error("Operation is invalid")]
    INVALID,
}

pub type Result<T> = std::result::Result<T, StrataError>;

/// Parameters for GpuContext creation.
#[derive(Debug, Clone)]
pub struct CreateInfo {
    /// Bytes per leaf of every arena's buddy tree, must be a power of two
    pub arena_chunk_size: u64,
    /// Leaves per arena, must be a power of two
    pub arena_chunk_count: u64,
    /// Binding sets allocated per material, usually one per frame in flight
    pub set_count: u32,
    /// Enable the Khronos validation layer if it is installed
    pub enable_validation: bool,
    pub application_name: String,
}

impl CreateInfo {
    pub fn builder() -> CreateInfoBuilder {
        CreateInfoBuilder {
            ci: CreateInfo::default(),
        }
    }

    /// Size in bytes of a default arena
    pub fn arena_size(&self) -> u64 {
        self.arena_chunk_size * self.arena_chunk_count
    }

    /// Check the arena geometry
    ///
    /// Buddy blocks are only aligned to their own size when the chunk
    /// size is a power of two.
    pub fn check_arena_size(&self) -> Result<()> {
        let size_ok = self.arena_chunk_size.is_power_of_two();
        let count_ok = self.arena_chunk_count.is_power_of_two();
        let fits = self
            .arena_chunk_size
            .checked_mul(self.arena_chunk_count)
            .is_some();

        match size_ok && count_ok && fits {
            true => Ok(()),
            false => Err(StrataError::INVALID_ARENA_SIZE(
                self.arena_chunk_size,
                self.arena_chunk_count,
            )),
        }
    }
}

impl Default for CreateInfo {
    fn default() -> Self {
        Self {
            arena_chunk_size: GPU_MEMORY_CHUNK_SIZE,
            arena_chunk_count: GPU_MEMORY_ARENA_CHUNK_COUNT,
            set_count: 2,
            enable_validation: cfg!(debug_assertions),
            application_name: "strata".to_string(),
        }
    }
}

/// Implements the builder pattern for easier context creation
pub struct CreateInfoBuilder {
    ci: CreateInfo,
}

impl CreateInfoBuilder {
    pub fn arena_chunk_size(mut self, size: u64) -> Self {
        self.ci.arena_chunk_size = size;
        self
    }

    pub fn arena_chunk_count(mut self, count: u64) -> Self {
        self.ci.arena_chunk_count = count;
        self
    }

    pub fn set_count(mut self, count: u32) -> Self {
        self.ci.set_count = count;
        self
    }

    pub fn enable_validation(mut self, enable: bool) -> Self {
        self.ci.enable_validation = enable;
        self
    }

    pub fn application_name(mut self, name: &str) -> Self {
        self.ci.application_name = name.to_string();
        self
    }

    pub fn build(self) -> CreateInfo {
        self.ci
    }
}

#[cfg(test)]
mod tests;
