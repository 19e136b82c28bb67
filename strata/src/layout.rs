// Binding set layouts
//
// A layout is described as a list of named bindings. Several uniform
// fields may live in the same binding index, in which case they are
// packed into one uniform buffer with std140 offsets. The native layout
// has exactly one binding per used index.
use crate::{Result, StrataError};
use ash::vk;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

/// Types of uniform buffer fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformField {
    Int,
    Uint,
    Float,
    Vec2,
    Vec3,
    Vec4,
    Mat3,
    Mat4,
    Color,
}

impl UniformField {
    /// (size, alignment) under std140 rules
    fn std140(&self) -> (u64, u64) {
        match self {
            UniformField::Int | UniformField::Uint | UniformField::Float => (4, 4),
            UniformField::Vec2 => (8, 8),
            UniformField::Vec3 => (12, 16),
            UniformField::Vec4 | UniformField::Color => (16, 16),
            // three vec4 aligned columns
            UniformField::Mat3 => (48, 16),
            UniformField::Mat4 => (64, 16),
        }
    }
}

/// What a named binding holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingType {
    /// A sampled image
    Texture,
    /// A subpass input
    InputAttachment,
    /// A raw uniform block of `count` 16 byte slots
    UniformBuffer,
    /// A typed field inside a uniform block
    Uniform(UniformField),
}

impl BindingType {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            BindingType::Texture => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            BindingType::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
            BindingType::UniformBuffer | BindingType::Uniform(_) => {
                vk::DescriptorType::UNIFORM_BUFFER
            }
        }
    }

    /// Input attachments can only be read from fragment shaders
    pub fn stage_flags(&self) -> vk::ShaderStageFlags {
        match self {
            BindingType::InputAttachment => vk::ShaderStageFlags::FRAGMENT,
            _ => vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

impl FromStr for BindingType {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "texture" => BindingType::Texture,
            "attachment" | "inputAttachment" => BindingType::InputAttachment,
            "uniformBuffer" => BindingType::UniformBuffer,
            "int" => BindingType::Uniform(UniformField::Int),
            "uint" => BindingType::Uniform(UniformField::Uint),
            "float" => BindingType::Uniform(UniformField::Float),
            "vec2" => BindingType::Uniform(UniformField::Vec2),
            "vec3" => BindingType::Uniform(UniformField::Vec3),
            "vec4" => BindingType::Uniform(UniformField::Vec4),
            "mat3" => BindingType::Uniform(UniformField::Mat3),
            "mat4" => BindingType::Uniform(UniformField::Mat4),
            "color" => BindingType::Uniform(UniformField::Color),
            other => return Err(StrataError::INVALID_BINDING_TYPE(other.to_string())),
        })
    }
}

/// One named entry of a layout description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingDescription {
    pub name: String,
    pub ty: BindingType,
    pub binding: u32,
    /// Array length for uniform fields
    pub count: u32,
}

impl BindingDescription {
    pub fn new(name: &str, ty: BindingType, binding: u32, count: u32) -> Self {
        Self {
            name: name.to_string(),
            ty: ty,
            binding: binding,
            count: count,
        }
    }

    /// Build a description from its textual type name
    pub fn parse(name: &str, ty: &str, binding: u32, count: u32) -> Result<Self> {
        Ok(Self::new(name, ty.parse()?, binding, count))
    }
}

/// Where a uniform field lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLocation {
    pub binding: u32,
    pub offset: u64,
    pub size: u64,
}

/// One binding of the native set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NativeBinding {
    binding: u32,
    ty: vk::DescriptorType,
    stages: vk::ShaderStageFlags,
    /// byte size of the uniform block, zero for images
    uniform_size: u64,
}

/// A resolved binding set layout
#[derive(Debug, Clone)]
pub struct BindingLayout {
    bl_descriptions: Vec<BindingDescription>,
    /// sorted by binding index
    bl_native: Vec<NativeBinding>,
    bl_fields: HashMap<String, FieldLocation>,
    bl_hash: u64,
}

impl BindingLayout {
    pub fn new(descriptions: Vec<BindingDescription>) -> Result<Self> {
        let mut native: BTreeMap<u32, NativeBinding> = BTreeMap::new();
        let mut fields = HashMap::new();
        // indices taken by an image binding
        let mut claimed = HashSet::new();

        for desc in descriptions.iter() {
            let ty = desc.ty.descriptor_type();
            let entry = native.entry(desc.binding).or_insert(NativeBinding {
                binding: desc.binding,
                ty: ty,
                stages: desc.ty.stage_flags(),
                uniform_size: 0,
            });

            if entry.ty != ty {
                return Err(StrataError::CONFLICTING_BINDING(desc.binding));
            }
            if ty != vk::DescriptorType::UNIFORM_BUFFER {
                // only uniform fields may share an index
                if !claimed.insert(desc.binding) {
                    return Err(StrataError::CONFLICTING_BINDING(desc.binding));
                }
                continue;
            }

            let count = desc.count.max(1) as u64;
            let (size, align) = match desc.ty {
                BindingType::Uniform(field) => {
                    let (size, align) = field.std140();
                    if count > 1 {
                        // array elements are padded to a vec4
                        (utils::align_up(size, 16) * count, 16)
                    } else {
                        (size, align)
                    }
                }
                _ => (16 * count, 16),
            };

            let offset = utils::align_up(entry.uniform_size, align);
            entry.uniform_size = offset + size;
            fields.insert(
                desc.name.clone(),
                FieldLocation {
                    binding: desc.binding,
                    offset: offset,
                    size: size,
                },
            );
        }

        let native: Vec<NativeBinding> = native.into_values().collect();
        let hash = Self::hash_bindings(&native);

        Ok(Self {
            bl_descriptions: descriptions,
            bl_native: native,
            bl_fields: fields,
            bl_hash: hash,
        })
    }

    /// Order independent signature of the native bindings
    ///
    /// Layouts with the same set of bindings hash the same so that their
    /// pools are shared.
    fn hash_bindings(native: &[NativeBinding]) -> u64 {
        native.iter().fold(0, |hash, b| {
            let descriptor_count: u64 = 1;
            hash ^ (b.binding as u64
                | (b.ty.as_raw() as u64) << 8
                | descriptor_count << 16
                | (b.stages.as_raw() as u64) << 24)
        })
    }

    pub fn hash(&self) -> u64 {
        self.bl_hash
    }

    pub fn descriptions(&self) -> &[BindingDescription] {
        self.bl_descriptions.as_slice()
    }

    /// True if the layout has no bindings at all
    pub fn is_empty(&self) -> bool {
        self.bl_native.is_empty()
    }

    /// The native layout bindings, one per used index
    pub fn native_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding> {
        self.bl_native
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.ty)
                    .descriptor_count(1)
                    .stage_flags(b.stages)
                    .build()
            })
            .collect()
    }

    /// Descriptor type of every native binding, in binding order
    pub fn descriptor_types(&self) -> Vec<vk::DescriptorType> {
        self.bl_native.iter().map(|b| b.ty).collect()
    }

    /// Location of a named uniform field
    pub fn field(&self, name: &str) -> Option<&FieldLocation> {
        self.bl_fields.get(name)
    }

    /// (binding, size) of every uniform block
    pub fn uniform_blocks(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.bl_native
            .iter()
            .filter(|b| b.ty == vk::DescriptorType::UNIFORM_BUFFER)
            .map(|b| (b.binding, b.uniform_size))
    }

    /// (name, binding) of every texture
    pub fn textures(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.bl_descriptions
            .iter()
            .filter(|d| d.ty == BindingType::Texture)
            .map(|d| (d.name.as_str(), d.binding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(name: &str, ty: &str, binding: u32) -> BindingDescription {
        BindingDescription::parse(name, ty, binding, 1).unwrap()
    }

    #[test]
    fn type_names() {
        assert_eq!(
            "texture".parse::<BindingType>().unwrap(),
            BindingType::Texture
        );
        assert_eq!(
            "attachment".parse::<BindingType>().unwrap(),
            BindingType::InputAttachment
        );
        assert_eq!(
            "color".parse::<BindingType>().unwrap(),
            BindingType::Uniform(UniformField::Color)
        );
        assert!("sampler3D".parse::<BindingType>().is_err());
    }

    #[test]
    fn hash_ignores_declaration_order() {
        let a = BindingLayout::new(vec![
            desc("albedo", "texture", 0),
            desc("tint", "color", 1),
            desc("gbuffer", "inputAttachment", 2),
        ])
        .unwrap();
        let b = BindingLayout::new(vec![
            desc("gbuffer", "inputAttachment", 2),
            desc("tint", "color", 1),
            desc("albedo", "texture", 0),
        ])
        .unwrap();

        assert_eq!(a.hash(), b.hash());

        // names don't matter either, only the shape
        let c = BindingLayout::new(vec![
            desc("diffuse", "texture", 0),
            desc("roughness", "float", 1),
            desc("input", "attachment", 2),
        ])
        .unwrap();
        assert_eq!(a.hash(), c.hash());
    }

    #[test]
    fn hash_changes_with_shape() {
        let a = BindingLayout::new(vec![desc("albedo", "texture", 0)]).unwrap();
        let b = BindingLayout::new(vec![desc("albedo", "texture", 1)]).unwrap();
        let c = BindingLayout::new(vec![desc("albedo", "inputAttachment", 0)]).unwrap();

        assert_ne!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn hash_formula() {
        let layout = BindingLayout::new(vec![desc("albedo", "texture", 3)]).unwrap();
        let stages = (vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT).as_raw();
        let expected = 3
            | (vk::DescriptorType::COMBINED_IMAGE_SAMPLER.as_raw() as u64) << 8
            | 1 << 16
            | (stages as u64) << 24;

        assert_eq!(layout.hash(), expected);
    }

    #[test]
    fn uniform_fields_share_a_block() {
        let layout = BindingLayout::new(vec![
            desc("time", "float", 0),
            desc("tint", "vec3", 0),
            desc("model", "mat4", 0),
            BindingDescription::parse("lights", "vec2", 0, 4).unwrap(),
            desc("albedo", "texture", 1),
        ])
        .unwrap();

        assert_eq!(layout.native_bindings().len(), 2);
        assert_eq!(
            layout.descriptor_types(),
            vec![
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            ]
        );

        assert_eq!(layout.field("time").unwrap().offset, 0);
        // vec3 is aligned to 16 bytes
        assert_eq!(layout.field("tint").unwrap().offset, 16);
        assert_eq!(layout.field("model").unwrap().offset, 32);
        let lights = layout.field("lights").unwrap();
        assert_eq!(lights.offset, 96);
        assert_eq!(lights.size, 64);

        let blocks: Vec<_> = layout.uniform_blocks().collect();
        assert_eq!(blocks, vec![(0, 160)]);
        let textures: Vec<_> = layout.textures().collect();
        assert_eq!(textures, vec![("albedo", 1)]);
    }

    #[test]
    fn conflicting_types_are_rejected() {
        let ret = BindingLayout::new(vec![desc("a", "texture", 0), desc("b", "float", 0)]);
        assert!(matches!(ret, Err(StrataError::CONFLICTING_BINDING(0))));

        let ret = BindingLayout::new(vec![desc("a", "texture", 0), desc("b", "texture", 0)]);
        assert!(ret.is_err());
    }

    #[test]
    fn input_attachments_are_fragment_only() {
        let layout = BindingLayout::new(vec![desc("g", "attachment", 0)]).unwrap();
        assert_eq!(
            layout.native_bindings()[0].stage_flags,
            vk::ShaderStageFlags::FRAGMENT
        );
    }
}
