use std::ops::Deref;

use oxidx::dx;

use crate::rhi::{
    device::Device,
    error::RhiResult,
    types::{HeapKind, ResourceStates},
};

use super::resource::Resource;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TextureUsage: u32 {
        const RenderTarget = 1 << 0;
        const DepthStencil = 1 << 1;
        const ShaderResource = 1 << 2;
        const UnorderedAccess = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureDimension {
    Two,
    Cube,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TextureClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u8 },
}

#[derive(Clone, Debug)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: dx::Format,
    pub mip_levels: u16,
    pub array_size: u16,
    pub sample_count: u32,
    pub dimension: TextureDimension,
    pub usage: TextureUsage,
    pub clear_value: Option<TextureClearValue>,
}

impl TextureDesc {
    pub fn texture_2d(width: u32, height: u32, format: dx::Format) -> Self {
        Self {
            width,
            height,
            format,
            mip_levels: 1,
            array_size: 1,
            sample_count: 1,
            dimension: TextureDimension::Two,
            usage: TextureUsage::ShaderResource,
            clear_value: None,
        }
    }

    pub fn texture_cube(extent: u32, format: dx::Format) -> Self {
        Self {
            array_size: 6,
            dimension: TextureDimension::Cube,
            ..Self::texture_2d(extent, extent, format)
        }
    }

    pub fn with_mip_levels(mut self, mip_levels: u16) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_usage(mut self, usage: TextureUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    pub fn with_clear_value(mut self, clear_value: TextureClearValue) -> Self {
        self.clear_value = Some(clear_value);
        self
    }

    pub(crate) fn resource_flags(&self) -> dx::ResourceFlags {
        let mut flags = dx::ResourceFlags::empty();

        if self.usage.contains(TextureUsage::RenderTarget) {
            flags |= dx::ResourceFlags::AllowRenderTarget;
        }
        if self.usage.contains(TextureUsage::DepthStencil) {
            flags |= dx::ResourceFlags::AllowDepthStencil;

            if !self.usage.contains(TextureUsage::ShaderResource) {
                flags |= dx::ResourceFlags::DenyShaderResource;
            }
        }
        if self.usage.contains(TextureUsage::UnorderedAccess) {
            flags |= dx::ResourceFlags::AllowUnorderedAccess;
        }

        flags
    }

    pub(crate) fn as_raw(&self) -> dx::ResourceDesc {
        dx::ResourceDesc::texture_2d(self.width as u64, self.height)
            .with_format(self.format)
            .with_mip_levels(self.mip_levels)
            .with_array_size(self.array_size)
            .with_sample_desc(dx::SampleDesc::new(self.sample_count, 0))
            .with_flags(self.resource_flags())
    }

    fn raw_clear_value(&self) -> Option<dx::ClearValue> {
        self.clear_value.map(|clear| match clear {
            TextureClearValue::Color(color) => dx::ClearValue::color(self.format, color),
            TextureClearValue::DepthStencil { depth, stencil } => {
                dx::ClearValue::depth(self.format, depth, stencil)
            }
        })
    }
}

#[derive(Clone, Debug)]
pub struct Texture {
    resource: Resource,
    desc: TextureDesc,
}

impl Deref for Texture {
    type Target = Resource;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

impl Texture {
    pub(crate) fn inner_new(device: &Device, desc: TextureDesc) -> RhiResult<Self> {
        let clear_value = desc.raw_clear_value();

        let resource = Resource::create_committed(
            device,
            "texture",
            HeapKind::Default,
            &desc.as_raw(),
            ResourceStates::Common,
            clear_value.as_ref(),
            0,
            false,
        )?;

        Ok(Self { resource, desc })
    }

    pub(crate) fn from_resource(resource: Resource, desc: TextureDesc) -> Self {
        Self { resource, desc }
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn format(&self) -> dx::Format {
        self.desc.format
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn mip_levels(&self) -> u16 {
        self.desc.mip_levels
    }

    pub fn is_cube(&self) -> bool {
        self.desc.dimension == TextureDimension::Cube
    }

    /// Mip dimensions, clamped to 1 texel.
    pub fn mip_size(&self, mip: u16) -> (u32, u32) {
        ((self.desc.width >> mip).max(1), (self.desc.height >> mip).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_maps_to_resource_flags() {
        let desc = TextureDesc::texture_2d(64, 64, dx::Format::Rgba8Unorm)
            .with_usage(TextureUsage::RenderTarget | TextureUsage::ShaderResource);
        assert!(desc
            .resource_flags()
            .contains(dx::ResourceFlags::AllowRenderTarget));
        assert!(!desc
            .resource_flags()
            .contains(dx::ResourceFlags::DenyShaderResource));

        let depth_only = TextureDesc::texture_2d(64, 64, dx::Format::D32Float)
            .with_usage(TextureUsage::DepthStencil);
        assert!(depth_only
            .resource_flags()
            .contains(dx::ResourceFlags::AllowDepthStencil));
        assert!(depth_only
            .resource_flags()
            .contains(dx::ResourceFlags::DenyShaderResource));
    }

    #[test]
    fn cube_descs_carry_six_faces() {
        let desc = TextureDesc::texture_cube(128, dx::Format::Rgba8Unorm);
        assert_eq!(desc.array_size, 6);
        assert_eq!(desc.dimension, TextureDimension::Cube);
    }

    #[test]
    fn mip_sizes_clamp_to_one() {
        let desc = TextureDesc::texture_2d(256, 64, dx::Format::Rgba8Unorm).with_mip_levels(10);
        let texture_mips = |mip: u16| {
            (
                (desc.width >> mip).max(1),
                (desc.height >> mip).max(1),
            )
        };

        assert_eq!(texture_mips(0), (256, 64));
        assert_eq!(texture_mips(6), (4, 1));
        assert_eq!(texture_mips(9), (1, 1));
    }
}
