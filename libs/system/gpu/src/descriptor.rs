// This file is part of Loess.
//
// Loess is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// Loess is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with Loess.  If not, see <http://www.gnu.org/licenses/>.
use bitflags::bitflags;
use std::hash::{Hash, Hasher};

bitflags! {
    pub struct BindFlags: u32 {
        const SHADER_RESOURCE  = 1 << 0;
        const RENDER_TARGET    = 1 << 1;
        const DEPTH_STENCIL    = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
        const VERTEX_BUFFER    = 1 << 4;
        const INDEX_BUFFER     = 1 << 5;
        const CONSTANT_BUFFER  = 1 << 6;
        const TRANSFER_SRC     = 1 << 7;
        const TRANSFER_DST     = 1 << 8;
    }
}

bitflags! {
    pub struct CpuAccess: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags! {
    pub struct GpuAccess: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags! {
    pub struct AllocationRules: u32 {
        const POOLED  = 1 << 0;
        const STAGING = 1 << 1;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SampleFormat {
    R8Unorm,
    R8Uint,
    R16Uint,
    R16Sint,
    R16Float,
    R32Uint,
    R32Float,
    Rg16Sint,
    Rgba8Unorm,
}

impl SampleFormat {
    pub fn sample_bytes(&self) -> u32 {
        match self {
            Self::R8Unorm | Self::R8Uint => 1,
            Self::R16Uint | Self::R16Sint | Self::R16Float => 2,
            Self::R32Uint | Self::R32Float | Self::Rg16Sint | Self::Rgba8Unorm => 4,
        }
    }

    // Stable numbering for file headers.
    pub fn to_raw(&self) -> u32 {
        match self {
            Self::R8Unorm => 0,
            Self::R8Uint => 1,
            Self::R16Uint => 2,
            Self::R16Sint => 3,
            Self::R16Float => 4,
            Self::R32Uint => 5,
            Self::R32Float => 6,
            Self::Rg16Sint => 7,
            Self::Rgba8Unorm => 8,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::R8Unorm,
            1 => Self::R8Uint,
            2 => Self::R16Uint,
            3 => Self::R16Sint,
            4 => Self::R16Float,
            5 => Self::R32Uint,
            6 => Self::R32Float,
            7 => Self::Rg16Sint,
            8 => Self::Rgba8Unorm,
            _ => return None,
        })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TextureDimension {
    D1,
    D2,
    D2Array,
    D3,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TextureShape {
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    pub depth_or_layers: u32,
    pub format: SampleFormat,
    pub mip_count: u8,
    pub sample_count: u8,
}

impl TextureShape {
    pub fn layer_count(&self) -> u32 {
        match self.dimension {
            TextureDimension::D2Array => self.depth_or_layers,
            _ => 1,
        }
    }

    pub fn mip_extent(&self, mip: u32) -> (u32, u32) {
        ((self.width >> mip).max(1), (self.height >> mip).max(1))
    }

    pub fn layer_byte_count(&self, mip: u32) -> u64 {
        let (w, h) = self.mip_extent(mip);
        w as u64 * h as u64 * self.format.sample_bytes() as u64
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ResourceShape {
    LinearBuffer { byte_count: u64 },
    Texture(TextureShape),
}

/// Describes a GPU resource precisely enough that two resources with equal
/// descriptors are interchangeable. Equality and hashing ignore the label.
#[derive(Clone, Debug)]
pub struct ResourceDesc {
    pub shape: ResourceShape,
    pub bind_flags: BindFlags,
    pub cpu_access: CpuAccess,
    pub gpu_access: GpuAccess,
    pub allocation_rules: AllocationRules,
    pub label: String,
}

impl ResourceDesc {
    pub fn linear_buffer<S: Into<String>>(byte_count: u64, bind_flags: BindFlags, label: S) -> Self {
        Self {
            shape: ResourceShape::LinearBuffer { byte_count },
            bind_flags,
            cpu_access: CpuAccess::empty(),
            gpu_access: GpuAccess::READ | GpuAccess::WRITE,
            allocation_rules: AllocationRules::POOLED,
            label: label.into(),
        }
    }

    pub fn texture_2d<S: Into<String>>(
        width: u32,
        height: u32,
        format: SampleFormat,
        bind_flags: BindFlags,
        label: S,
    ) -> Self {
        Self {
            shape: ResourceShape::Texture(TextureShape {
                dimension: TextureDimension::D2,
                width,
                height,
                depth_or_layers: 1,
                format,
                mip_count: 1,
                sample_count: 1,
            }),
            bind_flags,
            cpu_access: CpuAccess::empty(),
            gpu_access: GpuAccess::READ | GpuAccess::WRITE,
            allocation_rules: AllocationRules::POOLED,
            label: label.into(),
        }
    }

    pub fn texture_2d_array<S: Into<String>>(
        width: u32,
        height: u32,
        layers: u32,
        format: SampleFormat,
        bind_flags: BindFlags,
        label: S,
    ) -> Self {
        Self {
            shape: ResourceShape::Texture(TextureShape {
                dimension: TextureDimension::D2Array,
                width,
                height,
                depth_or_layers: layers,
                format,
                mip_count: 1,
                sample_count: 1,
            }),
            bind_flags,
            cpu_access: CpuAccess::empty(),
            gpu_access: GpuAccess::READ | GpuAccess::WRITE,
            allocation_rules: AllocationRules::POOLED,
            label: label.into(),
        }
    }

    pub fn texture_shape(&self) -> Option<&TextureShape> {
        match &self.shape {
            ResourceShape::Texture(shape) => Some(shape),
            ResourceShape::LinearBuffer { .. } => None,
        }
    }

    pub fn byte_count(&self) -> u64 {
        match &self.shape {
            ResourceShape::LinearBuffer { byte_count } => *byte_count,
            ResourceShape::Texture(shape) => {
                let mut total = 0u64;
                for mip in 0..shape.mip_count as u32 {
                    total += shape.layer_byte_count(mip) * shape.layer_count() as u64;
                }
                total
            }
        }
    }

    fn signature(
        &self,
    ) -> (
        ResourceShape,
        BindFlags,
        CpuAccess,
        GpuAccess,
        AllocationRules,
    ) {
        (
            self.shape,
            self.bind_flags,
            self.cpu_access,
            self.gpu_access,
            self.allocation_rules,
        )
    }

    /// Pool shelves are keyed by this; equal hashes with equal descriptors
    /// mean interchangeable resources.
    pub fn signature_hash(&self) -> u64 {
        fxhash::hash64(&self.signature())
    }
}

impl PartialEq for ResourceDesc {
    fn eq(&self, other: &Self) -> bool {
        self.signature() == other.signature()
    }
}

impl Eq for ResourceDesc {}

impl Hash for ResourceDesc {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.signature().hash(state);
    }
}

/// An axis-aligned pixel rectangle, min inclusive, max exclusive.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Box2d {
    pub min: [u32; 2],
    pub max: [u32; 2],
}

impl Box2d {
    pub fn new(min: [u32; 2], max: [u32; 2]) -> Self {
        debug_assert!(min[0] <= max[0] && min[1] <= max[1]);
        Self { min, max }
    }

    pub fn width(&self) -> u32 {
        self.max[0] - self.min[0]
    }

    pub fn height(&self) -> u32 {
        self.max[1] - self.min[1]
    }

    pub fn is_degenerate(&self) -> bool {
        self.min[0] >= self.max[0] || self.min[1] >= self.max[1]
    }

    pub fn contains(&self, other: &Box2d) -> bool {
        self.min[0] <= other.min[0]
            && self.min[1] <= other.min[1]
            && self.max[0] >= other.max[0]
            && self.max[1] >= other.max[1]
    }

    pub fn intersection(&self, other: &Box2d) -> Option<Box2d> {
        let min = [self.min[0].max(other.min[0]), self.min[1].max(other.min[1])];
        let max = [self.max[0].min(other.max[0]), self.max[1].min(other.max[1])];
        if min[0] >= max[0] || min[1] >= max[1] {
            None
        } else {
            Some(Box2d { min, max })
        }
    }
}

/// One mip of one array layer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct SubResource {
    pub mip: u32,
    pub layer: u32,
}

impl SubResource {
    pub fn base() -> Self {
        Self { mip: 0, layer: 0 }
    }

    pub fn layer(layer: u32) -> Self {
        Self { mip: 0, layer }
    }
}

/// Limits an update to part of a resource: one subresource, optionally only
/// a box within it.
#[derive(Copy, Clone, Debug, Default)]
pub struct PartialResource {
    pub sub: SubResource,
    pub dst_box: Option<Box2d>,
}

impl PartialResource {
    pub fn whole() -> Self {
        Self::default()
    }

    pub fn boxed(sub: SubResource, dst_box: Box2d) -> Self {
        Self {
            sub,
            dst_box: Some(dst_box),
        }
    }
}
