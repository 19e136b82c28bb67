// Transfer jobs
//
// A job is one staged copy into a device buffer or image. The source
// bytes are read into a host visible staging buffer when the job is
// built, so a broken stream is reported to the caller instead of
// surfacing on the transfer queue.
use crate::buffer::Buffer;
use crate::data::ReadSeek;
use crate::device::{GpuDevice, ImageTransition};
use crate::heap::DeviceHeap;
use crate::image::Image;
use crate::{Result, StrataError};
use ash::vk;

use std::fmt;
use std::io::SeekFrom;
use std::sync::Arc;

/// Runs once the job's copy has completed on the device
pub type Completion = Box<dyn FnOnce() + Send>;

/// Identifies a submitted job within its AsyncTransferEngine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferJobId(pub(crate) u64);

impl fmt::Display for TransferJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

pub struct BufferTransfer {
    bt_staging: Buffer,
    bt_dst: Arc<Buffer>,
    bt_size: u64,
    bt_callback: Option<Completion>,
}

pub struct ImageTransfer {
    it_staging: Buffer,
    it_dst: Arc<Image>,
    it_callback: Option<Completion>,
}

/// One pending upload
pub enum TransferJob {
    Buffer(BufferTransfer),
    Image(ImageTransfer),
}

/// Copy `len` bytes at `offset` in `src` into a new staging buffer
fn stage_stream(
    heap: &Arc<DeviceHeap>,
    src: &mut dyn ReadSeek,
    offset: u64,
    len: u64,
) -> Result<Buffer> {
    let mut data = vec![0; len as usize];
    src.seek(SeekFrom::Start(offset))?;
    src.read_exact(&mut data)?;

    stage_bytes(heap, &data)
}

fn stage_bytes(heap: &Arc<DeviceHeap>, data: &[u8]) -> Result<Buffer> {
    if data.is_empty() {
        return Err(StrataError::INVALID);
    }
    let staging = Buffer::staging(heap, data.len() as u64)?;
    staging.write(0, data)?;

    Ok(staging)
}

impl TransferJob {
    /// Upload `len` bytes starting at `offset` of `src` into `dst`
    pub fn buffer(
        heap: &Arc<DeviceHeap>,
        dst: Arc<Buffer>,
        src: &mut dyn ReadSeek,
        offset: u64,
        len: u64,
        callback: Option<Completion>,
    ) -> Result<Self> {
        if len > dst.size() {
            return Err(StrataError::ALLOCATION_TOO_LARGE(len));
        }
        let staging = stage_stream(heap, src, offset, len)?;

        Ok(TransferJob::Buffer(BufferTransfer {
            bt_staging: staging,
            bt_dst: dst,
            bt_size: len,
            bt_callback: callback,
        }))
    }

    /// Upload `data` into the start of `dst`
    pub fn buffer_from_bytes(
        heap: &Arc<DeviceHeap>,
        dst: Arc<Buffer>,
        data: &[u8],
        callback: Option<Completion>,
    ) -> Result<Self> {
        if data.len() as u64 > dst.size() {
            return Err(StrataError::ALLOCATION_TOO_LARGE(data.len() as u64));
        }
        let staging = stage_bytes(heap, data)?;

        Ok(TransferJob::Buffer(BufferTransfer {
            bt_staging: staging,
            bt_dst: dst,
            bt_size: data.len() as u64,
            bt_callback: callback,
        }))
    }

    /// Fill all of `dst` with the RGBA8 texels at `offset` of `src`
    pub fn image(
        heap: &Arc<DeviceHeap>,
        dst: Arc<Image>,
        src: &mut dyn ReadSeek,
        offset: u64,
        callback: Option<Completion>,
    ) -> Result<Self> {
        let staging = stage_stream(heap, src, offset, dst.texel_size())?;

        Ok(TransferJob::Image(ImageTransfer {
            it_staging: staging,
            it_dst: dst,
            it_callback: callback,
        }))
    }

    pub fn image_from_bytes(
        heap: &Arc<DeviceHeap>,
        dst: Arc<Image>,
        texels: &[u8],
        callback: Option<Completion>,
    ) -> Result<Self> {
        if texels.len() as u64 != dst.texel_size() {
            return Err(StrataError::INVALID_BLOB(format!(
                "{} texel bytes for a {}x{} image",
                texels.len(),
                dst.extent().width,
                dst.extent().height
            )));
        }
        let staging = stage_bytes(heap, texels)?;

        Ok(TransferJob::Image(ImageTransfer {
            it_staging: staging,
            it_dst: dst,
            it_callback: callback,
        }))
    }

    /// Bytes this job copies
    pub fn size(&self) -> u64 {
        match self {
            TransferJob::Buffer(b) => b.bt_size,
            TransferJob::Image(i) => i.it_dst.texel_size(),
        }
    }

    /// Record the copy into `cbuf`
    ///
    /// Images are moved to TRANSFER_DST_OPTIMAL for the copy and left in
    /// SHADER_READ_ONLY_OPTIMAL.
    pub fn record(&self, dev: &dyn GpuDevice, cbuf: vk::CommandBuffer) -> Result<()> {
        match self {
            TransferJob::Buffer(b) => {
                dev.cmd_copy_buffer(cbuf, b.bt_staging.buffer(), b.bt_dst.buffer(), b.bt_size);
            }
            TransferJob::Image(i) => {
                let image = i.it_dst.image();
                dev.cmd_transition_image_layout(
                    cbuf,
                    &ImageTransition::new(
                        image,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    )?,
                );
                dev.cmd_copy_buffer_to_image(
                    cbuf,
                    i.it_staging.buffer(),
                    image,
                    i.it_dst.extent(),
                );
                dev.cmd_transition_image_layout(
                    cbuf,
                    &ImageTransition::new(
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    )?,
                );
            }
        }

        Ok(())
    }

    /// Mark the destination loaded and run the callback
    ///
    /// Consumes the job, dropping the staging buffer and this job's
    /// reference on the destination.
    pub(crate) fn complete(self) {
        match self {
            TransferJob::Buffer(mut b) => {
                b.bt_dst.set_loaded();
                if let Some(cb) = b.bt_callback.take() {
                    cb();
                }
            }
            TransferJob::Image(mut i) => {
                i.it_dst.set_loaded();
                if let Some(cb) = i.it_callback.take() {
                    cb();
                }
            }
        }
    }
}

impl fmt::Debug for TransferJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferJob::Buffer(b) => f
                .debug_struct("BufferTransfer")
                .field("dst", &b.bt_dst.buffer())
                .field("size", &b.bt_size)
                .finish(),
            TransferJob::Image(i) => f
                .debug_struct("ImageTransfer")
                .field("dst", &i.it_dst.image())
                .field("extent", &i.it_dst.extent())
                .finish(),
        }
    }
}
