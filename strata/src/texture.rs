// Sampled textures
use crate::blob::TextureHeader;
use crate::context::GpuContext;
use crate::device::GpuDevice;
use crate::image::Image;
use crate::resource::{GpuResource, ResourceId};
use crate::transfer::{TransferJob, TransferJobId};
use crate::Result;
use ash::vk;

use std::sync::Arc;

/// Texel format of every texture blob
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

pub struct Texture {
    t_id: ResourceId,
    t_dev: Arc<dyn GpuDevice>,
    t_image: Arc<Image>,
    t_sampler: vk::Sampler,
    t_jobs: Vec<TransferJobId>,
}

impl Texture {
    /// Create the image for the texture blob `id` and queue its upload
    ///
    /// The header is validated before anything is allocated.
    pub fn load(ctx: &GpuContext, id: ResourceId) -> Result<Self> {
        let mut src = ctx.open(id)?;
        let header = TextureHeader::read(&mut *src)?;

        let image = Self::create_image(ctx, header.width, header.height)?;
        let job = TransferJob::image(
            ctx.heap(),
            image.clone(),
            &mut *src,
            header.texels_offset(),
            None,
        )?;

        Self::new(ctx, id, image, job)
    }

    /// Create a texture from RGBA8 texels already in memory
    pub fn from_texels(
        ctx: &GpuContext,
        id: ResourceId,
        width: u32,
        height: u32,
        texels: &[u8],
    ) -> Result<Self> {
        let image = Self::create_image(ctx, width, height)?;
        let job = TransferJob::image_from_bytes(ctx.heap(), image.clone(), texels, None)?;

        Self::new(ctx, id, image, job)
    }

    /// The 1x1 opaque white texture bound where a material leaves a
    /// texture unset
    pub fn default_white(ctx: &GpuContext) -> Result<Self> {
        Self::from_texels(
            ctx,
            ResourceId::from_content(b"strata default white texture"),
            1,
            1,
            &[255; 4],
        )
    }

    fn create_image(ctx: &GpuContext, width: u32, height: u32) -> Result<Arc<Image>> {
        Ok(Arc::new(Image::new(
            ctx.heap(),
            vk::Extent2D {
                width: width,
                height: height,
            },
            TEXTURE_FORMAT,
        )?))
    }

    fn new(ctx: &GpuContext, id: ResourceId, image: Arc<Image>, job: TransferJob) -> Result<Self> {
        let sampler = ctx.device().create_sampler()?;
        let job_id = ctx.submit(job);
        log::debug!(
            "Texture {} created ({}x{})",
            id,
            image.extent().width,
            image.extent().height
        );

        Ok(Self {
            t_id: id,
            t_dev: ctx.device().clone(),
            t_image: image,
            t_sampler: sampler,
            t_jobs: vec![job_id],
        })
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.t_image
    }

    pub fn view(&self) -> vk::ImageView {
        self.t_image.view()
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.t_sampler
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.t_image.extent()
    }
}

impl GpuResource for Texture {
    fn id(&self) -> ResourceId {
        self.t_id
    }

    fn is_loaded(&self) -> bool {
        self.t_image.is_loaded()
    }

    fn transfer_jobs(&self) -> &[TransferJobId] {
        &self.t_jobs
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        log::debug!("Texture {} destroyed", self.t_id);
        self.t_dev.destroy_sampler(self.t_sampler);
    }
}
