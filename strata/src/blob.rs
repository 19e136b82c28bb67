// On disk resource layouts
//
// All blobs are little endian and start with two u32 header fields:
//
//   mesh:    vertices_size, indices_size, vertex records, u32 indices
//   texture: width, height, width * height RGBA8 texels
//   shader:  vertex_size, fragment_size, vertex SPIR-V, fragment SPIR-V
//
// bincode's default encoding of two u32 fields is exactly these 8 bytes.
use crate::{Result, StrataError};
use ash::vk;
use cgmath::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use std::io::{Read, Seek, SeekFrom, Write};

/// Bytes taken by the two u32 header fields of every blob
pub const BLOB_HEADER_SIZE: u64 = 8;

/// One vertex record of a mesh blob
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub position: Vector3<f32>,
    pub color: Vector3<f32>,
    pub normal: Vector3<f32>,
    pub uv: Vector2<f32>,
}

impl Vertex {
    /// Size of one packed vertex record
    pub const SIZE: u64 = 44;

    pub fn new(position: [f32; 3], color: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position: position.into(),
            color: color.into(),
            normal: normal.into(),
            uv: uv.into(),
        }
    }

    /// Vertex buffer binding for a pipeline consuming mesh vertices
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    /// Attribute locations 0-3: position, color, normal, uv
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 4] {
        [
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Vertex, position) as u32)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Vertex, color) as u32)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(2)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Vertex, normal) as u32)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(3)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(offset_of!(Vertex, uv) as u32)
                .build(),
        ]
    }
}

/// Check that the stream holds at least `len` bytes after the header
///
/// Leaves the stream positioned just after the header.
fn check_payload<R: Read + Seek + ?Sized>(src: &mut R, len: u64) -> Result<()> {
    let end = src.seek(SeekFrom::End(0))?;
    src.seek(SeekFrom::Start(BLOB_HEADER_SIZE))?;

    if end < BLOB_HEADER_SIZE + len {
        return Err(StrataError::INVALID_BLOB(format!(
            "expected {} payload bytes but found {}",
            len,
            end.saturating_sub(BLOB_HEADER_SIZE)
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshHeader {
    pub vertices_size: u32,
    pub indices_size: u32,
}

impl MeshHeader {
    /// Read and validate the header of a mesh blob
    ///
    /// Fails if the sizes are not whole records or the stream is too
    /// short to hold them.
    pub fn read<R: Read + Seek + ?Sized>(src: &mut R) -> Result<Self> {
        src.seek(SeekFrom::Start(0))?;
        let header: MeshHeader = bincode::deserialize_from(&mut *src)?;

        if header.vertices_size == 0 || header.vertices_size as u64 % Vertex::SIZE != 0 {
            return Err(StrataError::INVALID_BLOB(format!(
                "vertex block of {} bytes",
                header.vertices_size
            )));
        }
        if header.indices_size == 0 || header.indices_size % 4 != 0 {
            return Err(StrataError::INVALID_BLOB(format!(
                "index block of {} bytes",
                header.indices_size
            )));
        }
        check_payload(src, header.vertices_size as u64 + header.indices_size as u64)?;

        Ok(header)
    }

    pub fn vertex_count(&self) -> u32 {
        (self.vertices_size as u64 / Vertex::SIZE) as u32
    }

    pub fn index_count(&self) -> u32 {
        self.indices_size / 4
    }

    pub fn vertices_offset(&self) -> u64 {
        BLOB_HEADER_SIZE
    }

    pub fn indices_offset(&self) -> u64 {
        BLOB_HEADER_SIZE + self.vertices_size as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureHeader {
    pub width: u32,
    pub height: u32,
}

impl TextureHeader {
    pub fn read<R: Read + Seek + ?Sized>(src: &mut R) -> Result<Self> {
        src.seek(SeekFrom::Start(0))?;
        let header: TextureHeader = bincode::deserialize_from(&mut *src)?;

        if header.width == 0 || header.height == 0 {
            return Err(StrataError::INVALID_BLOB(format!(
                "texture of {}x{}",
                header.width, header.height
            )));
        }
        check_payload(src, header.texel_size())?;

        Ok(header)
    }

    /// Bytes of RGBA8 texel data
    pub fn texel_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * 4
    }

    pub fn texels_offset(&self) -> u64 {
        BLOB_HEADER_SIZE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderHeader {
    pub vertex_size: u32,
    pub fragment_size: u32,
}

impl ShaderHeader {
    pub fn read<R: Read + Seek + ?Sized>(src: &mut R) -> Result<Self> {
        src.seek(SeekFrom::Start(0))?;
        let header: ShaderHeader = bincode::deserialize_from(&mut *src)?;

        // SPIR-V is a stream of 32 bit words
        for size in [header.vertex_size, header.fragment_size] {
            if size == 0 || size % 4 != 0 {
                return Err(StrataError::INVALID_BLOB(format!(
                    "SPIR-V module of {} bytes",
                    size
                )));
            }
        }
        check_payload(src, header.vertex_size as u64 + header.fragment_size as u64)?;

        Ok(header)
    }
}

/// Write a mesh blob
pub fn write_mesh_blob<W: Write>(dst: &mut W, vertices: &[Vertex], indices: &[u32]) -> Result<()> {
    let header = MeshHeader {
        vertices_size: (vertices.len() as u64 * Vertex::SIZE) as u32,
        indices_size: (indices.len() * 4) as u32,
    };
    bincode::serialize_into(&mut *dst, &header)?;

    for v in vertices.iter() {
        bincode::serialize_into(&mut *dst, v)?;
    }
    for i in indices.iter() {
        dst.write_all(&i.to_le_bytes())?;
    }

    Ok(())
}

/// Write a texture blob, `texels` must hold width * height RGBA8 pixels
pub fn write_texture_blob<W: Write>(
    dst: &mut W,
    width: u32,
    height: u32,
    texels: &[u8],
) -> Result<()> {
    let header = TextureHeader {
        width: width,
        height: height,
    };
    if texels.len() as u64 != header.texel_size() {
        return Err(StrataError::INVALID_BLOB(format!(
            "{} texel bytes for a {}x{} texture",
            texels.len(),
            width,
            height
        )));
    }

    bincode::serialize_into(&mut *dst, &header)?;
    dst.write_all(texels)?;

    Ok(())
}

/// Write a shader blob from compiled SPIR-V for both stages
pub fn write_shader_blob<W: Write>(dst: &mut W, vertex: &[u8], fragment: &[u8]) -> Result<()> {
    let header = ShaderHeader {
        vertex_size: vertex.len() as u32,
        fragment_size: fragment.len() as u32,
    };

    bincode::serialize_into(&mut *dst, &header)?;
    dst.write_all(vertex)?;
    dst.write_all(fragment)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn quad() -> (Vec<Vertex>, Vec<u32>) {
        let v = |x, y| Vertex::new([x, y, 0.0], [1.0, 1.0, 1.0], [0.0, 0.0, 1.0], [x, y]);
        (
            vec![v(0.0, 0.0), v(1.0, 0.0), v(1.0, 1.0), v(0.0, 1.0)],
            vec![0, 1, 2, 2, 3, 0],
        )
    }

    #[test]
    fn vertex_is_packed() {
        assert_eq!(std::mem::size_of::<Vertex>() as u64, Vertex::SIZE);
        let attrs = Vertex::attribute_descriptions();
        assert_eq!(attrs[1].offset, 12);
        assert_eq!(attrs[3].offset, 36);
    }

    #[test]
    fn mesh_layout_is_bit_exact() {
        let (vertices, indices) = quad();
        let mut blob = Vec::new();
        write_mesh_blob(&mut blob, &vertices, &indices).unwrap();

        assert_eq!(&blob[0..4], &(4 * 44u32).to_le_bytes());
        assert_eq!(&blob[4..8], &24u32.to_le_bytes());
        assert_eq!(blob.len(), 8 + 4 * 44 + 24);
        // second vertex position x
        assert_eq!(&blob[8 + 44..8 + 48], &1.0f32.to_le_bytes());
        // last index
        assert_eq!(&blob[blob.len() - 4..], &0u32.to_le_bytes());

        let header = MeshHeader::read(&mut Cursor::new(&blob)).unwrap();
        assert_eq!(header.vertex_count(), 4);
        assert_eq!(header.index_count(), 6);
        assert_eq!(header.indices_offset(), 8 + 176);
    }

    #[test]
    fn truncated_mesh_is_rejected() {
        let (vertices, indices) = quad();
        let mut blob = Vec::new();
        write_mesh_blob(&mut blob, &vertices, &indices).unwrap();
        blob.truncate(blob.len() - 1);

        assert!(MeshHeader::read(&mut Cursor::new(&blob)).is_err());
        assert!(MeshHeader::read(&mut Cursor::new(&blob[..5])).is_err());
    }

    #[test]
    fn texture_layout() {
        let texels = vec![7u8; 2 * 3 * 4];
        let mut blob = Vec::new();
        write_texture_blob(&mut blob, 2, 3, &texels).unwrap();

        assert_eq!(&blob[0..8], &[2, 0, 0, 0, 3, 0, 0, 0]);
        let header = TextureHeader::read(&mut Cursor::new(&blob)).unwrap();
        assert_eq!(header.texel_size(), 24);

        assert!(write_texture_blob(&mut Vec::new(), 2, 2, &texels).is_err());
    }

    #[test]
    fn shader_modules_must_be_words() {
        let mut blob = Vec::new();
        write_shader_blob(&mut blob, &[0; 8], &[0; 6]).unwrap();
        assert!(ShaderHeader::read(&mut Cursor::new(&blob)).is_err());
    }
}
