// Materials
//
// A SharedMaterial is a shader plus the layout of its binding set. It
// holds one reference on the layout's pools in the registry. A Material
// is an instance of it with its own binding sets, textures and uniform
// buffers, one set per frame in flight.
use crate::buffer::Buffer;
use crate::context::GpuContext;
use crate::device::{DescriptorResource, DescriptorWrite};
use crate::layout::{BindingDescription, BindingLayout};
use crate::registry::BindingSetRegistry;
use crate::resource::{GpuResource, ResourceHandle, ResourceId};
use crate::shader::Shader;
use crate::texture::Texture;
use crate::{Result, StrataError};
use ash::vk;

use std::collections::HashMap;
use std::sync::Arc;

pub struct SharedMaterial {
    sm_id: ResourceId,
    sm_shader: ResourceHandle<Shader>,
    sm_layout: BindingLayout,
    /// None for a layout without bindings, which is never registered
    sm_set_layout: Option<vk::DescriptorSetLayout>,
    sm_registry: Arc<BindingSetRegistry>,
}

impl SharedMaterial {
    pub fn new(
        ctx: &GpuContext,
        id: ResourceId,
        shader: ResourceHandle<Shader>,
        bindings: Vec<BindingDescription>,
    ) -> Result<Self> {
        let layout = BindingLayout::new(bindings)?;
        let set_layout = match layout.is_empty() {
            true => None,
            false => Some(ctx.registry().register_pool(layout.hash(), &layout)?),
        };
        log::debug!(
            "Shared material {} created with layout {:#x}",
            id,
            layout.hash()
        );

        Ok(Self {
            sm_id: id,
            sm_shader: shader,
            sm_layout: layout,
            sm_set_layout: set_layout,
            sm_registry: ctx.registry().clone(),
        })
    }

    pub fn shader(&self) -> &ResourceHandle<Shader> {
        &self.sm_shader
    }

    pub fn layout(&self) -> &BindingLayout {
        &self.sm_layout
    }

    pub fn layout_hash(&self) -> u64 {
        self.sm_layout.hash()
    }

    /// The native set layout, for pipeline layout creation
    pub fn set_layout(&self) -> Option<vk::DescriptorSetLayout> {
        self.sm_set_layout
    }
}

impl GpuResource for SharedMaterial {
    fn id(&self) -> ResourceId {
        self.sm_id
    }

    fn is_loaded(&self) -> bool {
        self.sm_shader.is_loaded()
    }
}

impl Drop for SharedMaterial {
    fn drop(&mut self) {
        if self.sm_set_layout.is_some() {
            if let Err(e) = self.sm_registry.unregister_pool(self.sm_layout.hash()) {
                log::error!("Could not unregister material layout: {}", e);
            }
        }
    }
}

/// Uniform buffer backing one uniform binding of one set
struct UniformBlock {
    ub_binding: u32,
    ub_buffer: Buffer,
}

pub struct Material {
    mt_id: ResourceId,
    mt_shared: ResourceHandle<SharedMaterial>,
    mt_registry: Arc<BindingSetRegistry>,
    /// Every texture binding, unset ones hold the default texture
    mt_textures: HashMap<String, ResourceHandle<Texture>>,
    mt_sets: Vec<vk::DescriptorSet>,
    /// Indexed by set
    mt_uniforms: Vec<Vec<UniformBlock>>,
}

impl Material {
    /// Allocate binding sets for `shared` and bind `textures` by name
    ///
    /// Texture bindings missing from `textures` get `default`. Input
    /// attachments are left for the renderer to write.
    pub fn new(
        ctx: &GpuContext,
        id: ResourceId,
        shared: ResourceHandle<SharedMaterial>,
        textures: HashMap<String, ResourceHandle<Texture>>,
        default: &ResourceHandle<Texture>,
    ) -> Result<Self> {
        let layout = shared.layout();
        for name in textures.keys() {
            if !layout.textures().any(|(n, _)| n == name) {
                return Err(StrataError::UNKNOWN_BINDING(name.clone()));
            }
        }

        let sets = match layout.is_empty() {
            true => Vec::new(),
            false => ctx
                .registry()
                .allocate(layout.hash(), ctx.info().set_count as usize)?,
        };

        // From here on Drop returns the sets if binding fails
        let mut material = Self {
            mt_id: id,
            mt_shared: shared.clone(),
            mt_registry: ctx.registry().clone(),
            mt_textures: HashMap::new(),
            mt_sets: sets,
            mt_uniforms: Vec::new(),
        };
        material.bind(ctx, textures, default)?;
        log::debug!(
            "Material {} created with {} binding sets",
            id,
            material.mt_sets.len()
        );

        Ok(material)
    }

    fn bind(
        &mut self,
        ctx: &GpuContext,
        mut textures: HashMap<String, ResourceHandle<Texture>>,
        default: &ResourceHandle<Texture>,
    ) -> Result<()> {
        let layout = self.mt_shared.layout();
        let mut writes = Vec::new();

        for (name, _) in layout.textures() {
            let tex = textures.remove(name).unwrap_or_else(|| default.clone());
            self.mt_textures.insert(name.to_string(), tex);
        }

        for set in self.mt_sets.iter() {
            let mut blocks = Vec::new();

            for (binding, size) in layout.uniform_blocks() {
                let buffer = Buffer::new(
                    ctx.heap(),
                    size,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )?;
                buffer.write(0, &vec![0; size as usize])?;

                writes.push(DescriptorWrite {
                    set: *set,
                    binding: binding,
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    resource: DescriptorResource::Buffer {
                        buffer: buffer.buffer(),
                        offset: 0,
                        range: size,
                    },
                });
                blocks.push(UniformBlock {
                    ub_binding: binding,
                    ub_buffer: buffer,
                });
            }

            for (name, binding) in layout.textures() {
                let tex = &self.mt_textures[name];
                writes.push(DescriptorWrite {
                    set: *set,
                    binding: binding,
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    resource: DescriptorResource::Image {
                        view: tex.view(),
                        sampler: tex.sampler(),
                    },
                });
            }

            self.mt_uniforms.push(blocks);
        }

        if !writes.is_empty() {
            ctx.device().update_descriptor_sets(&writes);
        }
        Ok(())
    }

    pub fn shared(&self) -> &ResourceHandle<SharedMaterial> {
        &self.mt_shared
    }

    /// Binding sets, one per frame in flight
    pub fn sets(&self) -> &[vk::DescriptorSet] {
        &self.mt_sets
    }

    /// The texture bound under `name`
    pub fn texture(&self, name: &str) -> Option<&ResourceHandle<Texture>> {
        self.mt_textures.get(name)
    }

    /// Native uniform buffer behind `binding` of set `set_index`
    pub fn uniform_buffer(&self, set_index: usize, binding: u32) -> Option<vk::Buffer> {
        self.mt_uniforms
            .get(set_index)?
            .iter()
            .find(|b| b.ub_binding == binding)
            .map(|b| b.ub_buffer.buffer())
    }

    /// Write the uniform field `name` in set `set_index`
    pub fn write_set_uniform(&self, set_index: usize, name: &str, data: &[u8]) -> Result<()> {
        let loc = self
            .mt_shared
            .layout()
            .field(name)
            .ok_or_else(|| StrataError::UNKNOWN_BINDING(name.to_string()))?;
        if data.len() as u64 > loc.size {
            return Err(StrataError::INVALID);
        }

        let block = self
            .mt_uniforms
            .get(set_index)
            .and_then(|blocks| blocks.iter().find(|b| b.ub_binding == loc.binding))
            .ok_or(StrataError::INVALID)?;
        block.ub_buffer.write(loc.offset, data)
    }

    /// Write the uniform field `name` in every set
    pub fn write_uniform(&self, name: &str, data: &[u8]) -> Result<()> {
        for i in 0..self.mt_uniforms.len() {
            self.write_set_uniform(i, name, data)?;
        }
        Ok(())
    }
}

impl GpuResource for Material {
    fn id(&self) -> ResourceId {
        self.mt_id
    }

    fn is_loaded(&self) -> bool {
        self.mt_shared.is_loaded() && self.mt_textures.values().all(|t| t.is_loaded())
    }
}

impl Drop for Material {
    fn drop(&mut self) {
        if !self.mt_sets.is_empty() {
            if let Err(e) = self
                .mt_registry
                .free(self.mt_shared.layout_hash(), &self.mt_sets)
            {
                log::error!("Could not free binding sets of material {}: {}", self.mt_id, e);
            }
        }
        log::debug!("Material {} destroyed", self.mt_id);
    }
}
