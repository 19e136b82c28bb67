// Resource tables
//
// The ResourceManager shares resources by id. Acquiring an id that is
// already resident bumps its reference count and returns the same
// handle. The last release drops the table's handle, which frees the
// resource's memory and binding sets once no caller handle or in flight
// transfer still references them.
use crate::context::GpuContext;
use crate::layout::BindingDescription;
use crate::loader::JobState;
use crate::material::{Material, SharedMaterial};
use crate::mesh::Mesh;
use crate::resource::{GpuResource, ResourceHandle, ResourceId, ResourceState};
use crate::shader::Shader;
use crate::texture::Texture;
use crate::{Result, StrataError};

use std::collections::HashMap;
use std::sync::Arc;

/// How to build a shared material
#[derive(Debug, Clone)]
pub struct SharedMaterialDesc {
    pub shader: ResourceId,
    pub bindings: Vec<BindingDescription>,
}

/// How to build a material instance
#[derive(Debug, Clone)]
pub struct MaterialDesc {
    /// Must already be acquired
    pub shared: ResourceId,
    /// Texture bindings by name, unset ones get the default texture
    pub textures: HashMap<String, ResourceId>,
}

/// A reference one resource holds on another through the manager
#[derive(Debug, Clone, Copy)]
enum Dependency {
    Texture(ResourceId),
    Shader(ResourceId),
    SharedMaterial(ResourceId),
}

struct TableEntry<T> {
    te_handle: ResourceHandle<T>,
    te_refcount: u32,
    te_deps: Vec<Dependency>,
}

struct ResourceTable<T> {
    rt_entries: HashMap<ResourceId, TableEntry<T>>,
}

impl<T: GpuResource> ResourceTable<T> {
    fn new() -> Self {
        Self {
            rt_entries: HashMap::new(),
        }
    }

    fn get(&self, id: ResourceId) -> Option<&ResourceHandle<T>> {
        self.rt_entries.get(&id).map(|e| &e.te_handle)
    }

    /// Take another reference on a resident resource
    fn acquire_existing(&mut self, id: ResourceId) -> Option<ResourceHandle<T>> {
        let entry = self.rt_entries.get_mut(&id)?;
        entry.te_refcount += 1;
        Some(entry.te_handle.clone())
    }

    fn insert(&mut self, handle: ResourceHandle<T>, deps: Vec<Dependency>) -> ResourceHandle<T> {
        self.rt_entries.insert(
            handle.id(),
            TableEntry {
                te_handle: handle.clone(),
                te_refcount: 1,
                te_deps: deps,
            },
        );
        handle
    }

    /// Drop a reference, returning the dependencies of a removed entry
    fn release(&mut self, id: ResourceId) -> Result<Option<Vec<Dependency>>> {
        let entry = match self.rt_entries.get_mut(&id) {
            Some(e) => e,
            None => {
                debug_assert!(false, "releasing resource {} that was never acquired", id);
                return Err(StrataError::RESOURCE_NOT_FOUND(id));
            }
        };

        entry.te_refcount -= 1;
        if entry.te_refcount > 0 {
            return Ok(None);
        }

        // Dropping the entry drops the table's handle
        Ok(self.rt_entries.remove(&id).map(|e| e.te_deps))
    }

    fn ref_count(&self, id: ResourceId) -> u32 {
        self.rt_entries
            .get(&id)
            .map(|e| e.te_refcount)
            .unwrap_or(0)
    }

    fn len(&self) -> usize {
        self.rt_entries.len()
    }
}

pub struct ResourceManager {
    // Dependents are listed before what they depend on
    rm_materials: ResourceTable<Material>,
    rm_shared_materials: ResourceTable<SharedMaterial>,
    rm_shaders: ResourceTable<Shader>,
    rm_textures: ResourceTable<Texture>,
    rm_meshes: ResourceTable<Mesh>,
    rm_default_texture: ResourceHandle<Texture>,
    rm_ctx: Arc<GpuContext>,
}

impl ResourceManager {
    /// Create the manager and upload the default texture
    pub fn new(ctx: Arc<GpuContext>) -> Result<Self> {
        let default = ResourceHandle::new(Texture::default_white(&ctx)?);
        ctx.wait_idle()?;

        Ok(Self {
            rm_materials: ResourceTable::new(),
            rm_shared_materials: ResourceTable::new(),
            rm_shaders: ResourceTable::new(),
            rm_textures: ResourceTable::new(),
            rm_meshes: ResourceTable::new(),
            rm_default_texture: default,
            rm_ctx: ctx,
        })
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.rm_ctx
    }

    /// The texture bound where a material leaves a texture unset
    pub fn default_texture(&self) -> &ResourceHandle<Texture> {
        &self.rm_default_texture
    }

    pub fn acquire_mesh(&mut self, id: ResourceId) -> Result<ResourceHandle<Mesh>> {
        if let Some(handle) = self.rm_meshes.acquire_existing(id) {
            return Ok(handle);
        }
        let mesh = Mesh::load(&self.rm_ctx, id)?;
        Ok(self.rm_meshes.insert(ResourceHandle::new(mesh), Vec::new()))
    }

    pub fn acquire_texture(&mut self, id: ResourceId) -> Result<ResourceHandle<Texture>> {
        if let Some(handle) = self.rm_textures.acquire_existing(id) {
            return Ok(handle);
        }
        let texture = Texture::load(&self.rm_ctx, id)?;
        Ok(self.rm_textures.insert(ResourceHandle::new(texture), Vec::new()))
    }

    pub fn acquire_shader(&mut self, id: ResourceId) -> Result<ResourceHandle<Shader>> {
        if let Some(handle) = self.rm_shaders.acquire_existing(id) {
            return Ok(handle);
        }
        let shader = Shader::load(&self.rm_ctx, id)?;
        Ok(self.rm_shaders.insert(ResourceHandle::new(shader), Vec::new()))
    }

    /// Acquire a shared material, loading its shader if needed
    ///
    /// `desc` is only used when the material isn't resident yet.
    pub fn acquire_shared_material(
        &mut self,
        id: ResourceId,
        desc: &SharedMaterialDesc,
    ) -> Result<ResourceHandle<SharedMaterial>> {
        if let Some(handle) = self.rm_shared_materials.acquire_existing(id) {
            return Ok(handle);
        }

        let shader = self.acquire_shader(desc.shader)?;
        let deps = vec![Dependency::Shader(desc.shader)];
        match SharedMaterial::new(&self.rm_ctx, id, shader, desc.bindings.clone()) {
            Ok(shared) => Ok(self
                .rm_shared_materials
                .insert(ResourceHandle::new(shared), deps)),
            Err(e) => {
                self.release_dependencies(deps);
                Err(e)
            }
        }
    }

    /// Acquire a material instance, loading its textures if needed
    ///
    /// The shared material named by `desc` must already be acquired, the
    /// instance takes its own reference on it.
    pub fn acquire_material(
        &mut self,
        id: ResourceId,
        desc: &MaterialDesc,
    ) -> Result<ResourceHandle<Material>> {
        if let Some(handle) = self.rm_materials.acquire_existing(id) {
            return Ok(handle);
        }

        let shared = self
            .rm_shared_materials
            .acquire_existing(desc.shared)
            .ok_or(StrataError::RESOURCE_NOT_FOUND(desc.shared))?;
        let mut deps = vec![Dependency::SharedMaterial(desc.shared)];

        let mut textures = HashMap::new();
        for (name, tex_id) in desc.textures.iter() {
            match self.acquire_texture(*tex_id) {
                Ok(tex) => {
                    deps.push(Dependency::Texture(*tex_id));
                    textures.insert(name.clone(), tex);
                }
                Err(e) => {
                    self.release_dependencies(deps);
                    return Err(e);
                }
            }
        }

        match Material::new(
            &self.rm_ctx,
            id,
            shared,
            textures,
            &self.rm_default_texture,
        ) {
            Ok(material) => Ok(self
                .rm_materials
                .insert(ResourceHandle::new(material), deps)),
            Err(e) => {
                self.release_dependencies(deps);
                Err(e)
            }
        }
    }

    fn release_dependencies(&mut self, deps: Vec<Dependency>) {
        for dep in deps.into_iter() {
            let res = match dep {
                Dependency::Texture(id) => self.release_texture(id),
                Dependency::Shader(id) => self.release_shader(id),
                Dependency::SharedMaterial(id) => self.release_shared_material(id),
            };
            if let Err(e) = res {
                log::error!("Could not release dependency {:?}: {}", dep, e);
            }
        }
    }

    pub fn release_mesh(&mut self, id: ResourceId) -> Result<()> {
        if let Some(deps) = self.rm_meshes.release(id)? {
            self.release_dependencies(deps);
        }
        Ok(())
    }

    pub fn release_texture(&mut self, id: ResourceId) -> Result<()> {
        if let Some(deps) = self.rm_textures.release(id)? {
            self.release_dependencies(deps);
        }
        Ok(())
    }

    pub fn release_shader(&mut self, id: ResourceId) -> Result<()> {
        if let Some(deps) = self.rm_shaders.release(id)? {
            self.release_dependencies(deps);
        }
        Ok(())
    }

    pub fn release_shared_material(&mut self, id: ResourceId) -> Result<()> {
        if let Some(deps) = self.rm_shared_materials.release(id)? {
            self.release_dependencies(deps);
        }
        Ok(())
    }

    pub fn release_material(&mut self, id: ResourceId) -> Result<()> {
        if let Some(deps) = self.rm_materials.release(id)? {
            self.release_dependencies(deps);
        }
        Ok(())
    }

    fn find(&self, id: ResourceId) -> Option<&dyn GpuResource> {
        if let Some(h) = self.rm_meshes.get(id) {
            return Some(&**h);
        }
        if let Some(h) = self.rm_textures.get(id) {
            return Some(&**h);
        }
        if let Some(h) = self.rm_shaders.get(id) {
            return Some(&**h);
        }
        if let Some(h) = self.rm_shared_materials.get(id) {
            return Some(&**h);
        }
        self.rm_materials.get(id).map(|h| &**h as &dyn GpuResource)
    }

    /// Number of outstanding acquires of `id`
    pub fn ref_count(&self, id: ResourceId) -> u32 {
        self.rm_meshes.ref_count(id)
            + self.rm_textures.ref_count(id)
            + self.rm_shaders.ref_count(id)
            + self.rm_shared_materials.ref_count(id)
            + self.rm_materials.ref_count(id)
    }

    pub fn is_loaded(&self, id: ResourceId) -> bool {
        self.find(id).map(|r| r.is_loaded()).unwrap_or(false)
    }

    pub fn state(&self, id: ResourceId) -> ResourceState {
        let res = match self.find(id) {
            Some(r) => r,
            None => return ResourceState::Unloaded,
        };
        if res.is_loaded() {
            return ResourceState::Loaded;
        }

        match self.rm_ctx.jobs_state(res.transfer_jobs()) {
            JobState::Pending => ResourceState::LoadRequested,
            _ => ResourceState::Loading,
        }
    }

    /// Number of resident resources across all tables
    pub fn resident_count(&self) -> usize {
        self.rm_meshes.len()
            + self.rm_textures.len()
            + self.rm_shaders.len()
            + self.rm_shared_materials.len()
            + self.rm_materials.len()
    }

    /// Pump transfers, call once per frame
    pub fn update(&mut self) -> Result<usize> {
        self.rm_ctx.update()
    }

    /// Block until every queued upload has landed
    pub fn wait_idle(&mut self) -> Result<usize> {
        self.rm_ctx.wait_idle()
    }
}
