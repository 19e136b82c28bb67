// Meshes
//
// A mesh is a vertex buffer and an index buffer, both device local and
// filled by two transfer jobs from the mesh blob.
use crate::blob::{write_mesh_blob, MeshHeader, Vertex};
use crate::buffer::Buffer;
use crate::context::GpuContext;
use crate::data::ReadSeek;
use crate::resource::{GpuResource, ResourceId};
use crate::transfer::{TransferJob, TransferJobId};
use crate::Result;
use ash::vk;

use std::io::Cursor;
use std::sync::Arc;

pub struct Mesh {
    m_id: ResourceId,
    m_vertices: Arc<Buffer>,
    m_indices: Arc<Buffer>,
    m_vertex_count: u32,
    m_index_count: u32,
    m_jobs: Vec<TransferJobId>,
}

impl Mesh {
    /// Create the buffers for the mesh blob `id` and queue both uploads
    pub fn load(ctx: &GpuContext, id: ResourceId) -> Result<Self> {
        let mut src = ctx.open(id)?;
        Self::from_stream(ctx, id, &mut *src)
    }

    /// Create a mesh from vertices and indices in memory
    pub fn from_data(
        ctx: &GpuContext,
        id: ResourceId,
        vertices: &[Vertex],
        indices: &[u32],
    ) -> Result<Self> {
        let mut blob = Vec::new();
        write_mesh_blob(&mut blob, vertices, indices)?;
        Self::from_stream(ctx, id, &mut Cursor::new(blob))
    }

    fn from_stream(ctx: &GpuContext, id: ResourceId, src: &mut dyn ReadSeek) -> Result<Self> {
        // Validates the sizes against the stream length, so nothing is
        // allocated for a truncated blob
        let header = MeshHeader::read(&mut *src)?;
        let heap = ctx.heap();

        let vertices = Arc::new(Buffer::new(
            heap,
            header.vertices_size as u64,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?);
        let indices = Arc::new(Buffer::new(
            heap,
            header.indices_size as u64,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?);

        let vertex_job = TransferJob::buffer(
            heap,
            vertices.clone(),
            &mut *src,
            header.vertices_offset(),
            header.vertices_size as u64,
            None,
        )?;
        let index_job = TransferJob::buffer(
            heap,
            indices.clone(),
            &mut *src,
            header.indices_offset(),
            header.indices_size as u64,
            None,
        )?;
        let jobs = vec![ctx.submit(vertex_job), ctx.submit(index_job)];

        log::debug!(
            "Mesh {} created: {} vertices, {} indices",
            id,
            header.vertex_count(),
            header.index_count()
        );

        Ok(Self {
            m_id: id,
            m_vertices: vertices,
            m_indices: indices,
            m_vertex_count: header.vertex_count(),
            m_index_count: header.index_count(),
            m_jobs: jobs,
        })
    }

    pub fn vertex_buffer(&self) -> &Arc<Buffer> {
        &self.m_vertices
    }

    pub fn index_buffer(&self) -> &Arc<Buffer> {
        &self.m_indices
    }

    pub fn vertex_count(&self) -> u32 {
        self.m_vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.m_index_count
    }
}

impl GpuResource for Mesh {
    fn id(&self) -> ResourceId {
        self.m_id
    }

    fn is_loaded(&self) -> bool {
        self.m_vertices.is_loaded() && self.m_indices.is_loaded()
    }

    fn transfer_jobs(&self) -> &[TransferJobId] {
        &self.m_jobs
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        log::debug!("Mesh {} destroyed", self.m_id);
    }
}
