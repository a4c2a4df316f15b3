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
    pub struct BufferUsage: u32 {
        const Vertex = 1 << 0;
        const Index = 1 << 1;
        const Constant = 1 << 2;
        const ShaderResource = 1 << 3;
        const UnorderedAccess = 1 << 4;
        const IndirectArgs = 1 << 5;
        const AccelerationStructure = 1 << 6;
    }
}

/// Constant buffers bind in 256-byte granules.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

#[derive(Clone, Debug)]
pub struct BufferDesc {
    pub size: u64,
    pub stride: u32,
    pub usage: BufferUsage,
    pub heap_kind: HeapKind,
}

impl BufferDesc {
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            size,
            stride: 0,
            usage,
            heap_kind: HeapKind::Default,
        }
    }

    pub fn with_stride(mut self, stride: u32) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_heap_kind(mut self, heap_kind: HeapKind) -> Self {
        self.heap_kind = heap_kind;
        self
    }
}

#[derive(Clone, Debug)]
pub struct Buffer {
    resource: Resource,
    desc: BufferDesc,
}

impl Deref for Buffer {
    type Target = Resource;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

impl Buffer {
    pub(crate) fn inner_new(device: &Device, desc: BufferDesc) -> RhiResult<Self> {
        let size = if desc.usage.contains(BufferUsage::Constant) {
            crate::utils::align_up(desc.size, CONSTANT_BUFFER_ALIGNMENT)
        } else {
            desc.size
        };

        let mut flags = dx::ResourceFlags::empty();
        if desc.usage.contains(BufferUsage::UnorderedAccess)
            || desc.usage.contains(BufferUsage::AccelerationStructure)
        {
            flags |= dx::ResourceFlags::AllowUnorderedAccess;
        }

        let initial_state = Self::initial_state(&desc);

        let resource = Resource::create_committed(
            device,
            "buffer",
            desc.heap_kind,
            &dx::ResourceDesc::buffer(size as usize).with_flags(flags),
            initial_state,
            None,
            size,
            true,
        )?;

        Ok(Self {
            resource,
            desc: BufferDesc { size, ..desc },
        })
    }

    fn initial_state(desc: &BufferDesc) -> ResourceStates {
        match desc.heap_kind {
            HeapKind::Upload => ResourceStates::GenericRead,
            HeapKind::Readback => ResourceStates::CopyDst,
            HeapKind::Default => {
                if desc.usage.contains(BufferUsage::AccelerationStructure) {
                    ResourceStates::RayTracingAccelerationStructure
                } else {
                    ResourceStates::Common
                }
            }
        }
    }

    fn resting_state_for(usage: BufferUsage) -> ResourceStates {
        if usage.contains(BufferUsage::AccelerationStructure) {
            ResourceStates::RayTracingAccelerationStructure
        } else if usage.contains(BufferUsage::Constant) || usage.contains(BufferUsage::Vertex) {
            ResourceStates::VertexAndConstantBuffer
        } else if usage.contains(BufferUsage::Index) {
            ResourceStates::IndexBuffer
        } else if usage.contains(BufferUsage::UnorderedAccess) {
            ResourceStates::UnorderedAccess
        } else {
            ResourceStates::GenericRead
        }
    }

    /// The state this buffer sits in between uses, derived from its usage.
    /// Uploads from the context transition back to this.
    pub fn resting_state(&self) -> ResourceStates {
        Self::resting_state_for(self.desc.usage)
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn usage(&self) -> BufferUsage {
        self.desc.usage
    }

    pub fn stride(&self) -> u32 {
        self.desc.stride
    }

    pub fn vertex_buffer_view(&self) -> dx::VertexBufferView {
        debug_assert!(self.desc.usage.contains(BufferUsage::Vertex));

        dx::VertexBufferView::new(
            self.resource.gpu_virtual_address(),
            self.desc.stride,
            self.desc.size as u32,
        )
    }

    pub fn index_buffer_view(&self) -> dx::IndexBufferView {
        debug_assert!(self.desc.usage.contains(BufferUsage::Index));

        let format = match self.desc.stride {
            2 => dx::Format::R16Uint,
            _ => dx::Format::R32Uint,
        };

        dx::IndexBufferView::new(
            self.resource.gpu_virtual_address(),
            self.desc.size as u32,
            format,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resting_state_follows_usage() {
        assert_eq!(
            Buffer::resting_state_for(BufferUsage::Vertex),
            ResourceStates::VertexAndConstantBuffer
        );
        assert_eq!(
            Buffer::resting_state_for(BufferUsage::Index),
            ResourceStates::IndexBuffer
        );
        assert_eq!(
            Buffer::resting_state_for(BufferUsage::UnorderedAccess),
            ResourceStates::UnorderedAccess
        );
        assert_eq!(
            Buffer::resting_state_for(BufferUsage::ShaderResource),
            ResourceStates::GenericRead
        );
    }

    #[test]
    fn initial_state_per_heap() {
        let upload = BufferDesc::new(64, BufferUsage::Constant).with_heap_kind(HeapKind::Upload);
        assert_eq!(Buffer::initial_state(&upload), ResourceStates::GenericRead);

        let readback =
            BufferDesc::new(64, BufferUsage::empty()).with_heap_kind(HeapKind::Readback);
        assert_eq!(Buffer::initial_state(&readback), ResourceStates::CopyDst);

        let default = BufferDesc::new(64, BufferUsage::Vertex);
        assert_eq!(Buffer::initial_state(&default), ResourceStates::Common);
    }
}
