// Shader programs
//
// A shader blob holds precompiled SPIR-V for a vertex and a fragment
// stage. Modules are created immediately, there is nothing to upload.
use crate::blob::ShaderHeader;
use crate::context::GpuContext;
use crate::device::GpuDevice;
use crate::resource::{GpuResource, ResourceId};
use crate::Result;
use ash::util;
use ash::vk;

use std::io::{Cursor, Read};
use std::sync::Arc;

pub struct Shader {
    s_id: ResourceId,
    s_dev: Arc<dyn GpuDevice>,
    s_vertex: vk::ShaderModule,
    s_fragment: vk::ShaderModule,
}

impl Shader {
    pub fn load(ctx: &GpuContext, id: ResourceId) -> Result<Self> {
        let mut src = ctx.open(id)?;
        let header = ShaderHeader::read(&mut *src)?;

        let mut vertex = vec![0; header.vertex_size as usize];
        let mut fragment = vec![0; header.fragment_size as usize];
        src.read_exact(&mut vertex)?;
        src.read_exact(&mut fragment)?;

        Self::from_spirv(ctx, id, &vertex, &fragment)
    }

    /// Create both modules from SPIR-V bytes
    pub fn from_spirv(
        ctx: &GpuContext,
        id: ResourceId,
        vertex: &[u8],
        fragment: &[u8],
    ) -> Result<Self> {
        let dev = ctx.device();
        // read_spv handles alignment and byte order
        let vertex_code = util::read_spv(&mut Cursor::new(vertex))?;
        let fragment_code = util::read_spv(&mut Cursor::new(fragment))?;

        let vertex_module = dev.create_shader_module(&vertex_code)?;
        let fragment_module = match dev.create_shader_module(&fragment_code) {
            Ok(m) => m,
            Err(e) => {
                dev.destroy_shader_module(vertex_module);
                return Err(e);
            }
        };
        log::debug!("Shader {} created", id);

        Ok(Self {
            s_id: id,
            s_dev: dev.clone(),
            s_vertex: vertex_module,
            s_fragment: fragment_module,
        })
    }

    pub fn vertex_module(&self) -> vk::ShaderModule {
        self.s_vertex
    }

    pub fn fragment_module(&self) -> vk::ShaderModule {
        self.s_fragment
    }
}

impl GpuResource for Shader {
    fn id(&self) -> ResourceId {
        self.s_id
    }

    fn is_loaded(&self) -> bool {
        true
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        self.s_dev.destroy_shader_module(self.s_vertex);
        self.s_dev.destroy_shader_module(self.s_fragment);
    }
}
