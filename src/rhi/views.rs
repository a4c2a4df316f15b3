use std::sync::Arc;

use oxidx::dx;

use super::{
    descriptor_heap::{OfflineDescriptor, OfflineDescriptorHeap},
    device::Device,
    error::RhiResult,
    resources::{Buffer, Resource},
};

/// A permanent offline slot plus the heap it came from. Views do not own
/// the heap; the slot index is returned to its free list on drop.
#[derive(Debug)]
struct ViewSlot {
    descriptor: OfflineDescriptor,
    heap: OfflineDescriptorHeap,
}

impl ViewSlot {
    fn allocate(heap: &OfflineDescriptorHeap) -> RhiResult<Self> {
        Ok(Self {
            descriptor: heap.allocate()?,
            heap: heap.clone(),
        })
    }
}

impl Drop for ViewSlot {
    fn drop(&mut self) {
        self.heap.free(self.descriptor);
    }
}

macro_rules! define_view {
    ($(#[$attr:meta])* $name:ident, $inner:ident) => {
        $(#[$attr])*
        #[derive(Clone, Debug)]
        pub struct $name(Arc<$inner>);

        #[derive(Debug)]
        pub struct $inner {
            resource: Resource,
            slot: ViewSlot,
        }

        impl $name {
            /// The CPU handle of the backing offline slot. Only valid while
            /// the referenced resource is alive; the view holds it alive.
            pub fn offline_handle(&self) -> dx::CpuDescriptorHandle {
                self.0.slot.descriptor.cpu()
            }

            pub fn resource(&self) -> &Resource {
                &self.0.resource
            }
        }
    };
}

define_view!(
    /// Binds a buffer range as a constant buffer.
    ConstantBufferView,
    ConstantBufferViewInner
);
define_view!(
    /// Read-only shader access to a buffer or texture.
    ShaderResourceView,
    ShaderResourceViewInner
);
define_view!(
    /// Read/write shader access.
    UnorderedAccessView,
    UnorderedAccessViewInner
);
define_view!(RenderTargetView, RenderTargetViewInner);
define_view!(DepthStencilView, DepthStencilViewInner);

impl ConstantBufferView {
    pub(crate) fn inner_new(
        device: &Device,
        heap: &OfflineDescriptorHeap,
        buffer: &Buffer,
    ) -> RhiResult<Self> {
        let slot = ViewSlot::allocate(heap)?;

        let desc =
            dx::ConstantBufferViewDesc::new(buffer.gpu_virtual_address(), buffer.size() as u32);
        device
            .raw
            .create_constant_buffer_view(Some(&desc), slot.descriptor.cpu());

        Ok(Self(Arc::new(ConstantBufferViewInner {
            resource: buffer.resource().clone(),
            slot,
        })))
    }
}

impl ShaderResourceView {
    pub(crate) fn inner_new(
        device: &Device,
        heap: &OfflineDescriptorHeap,
        resource: &Resource,
        desc: Option<&dx::ShaderResourceViewDesc>,
    ) -> RhiResult<Self> {
        let slot = ViewSlot::allocate(heap)?;

        device
            .raw
            .create_shader_resource_view(Some(resource.raw()), desc, slot.descriptor.cpu());

        Ok(Self(Arc::new(ShaderResourceViewInner {
            resource: resource.clone(),
            slot,
        })))
    }
}

impl ShaderResourceView {
    /// SRV over a ray-tracing acceleration structure: the location rides in
    /// the desc and the resource parameter stays empty.
    pub(crate) fn inner_new_acceleration_structure(
        device: &Device,
        heap: &OfflineDescriptorHeap,
        resource: &Resource,
    ) -> RhiResult<Self> {
        let slot = ViewSlot::allocate(heap)?;

        let desc = dx::ShaderResourceViewDesc::raytracing_acceleration_structure(
            dx::Format::Unknown,
            resource.gpu_virtual_address(),
        );
        device
            .raw
            .create_shader_resource_view(None::<&dx::Resource>, Some(&desc), slot.descriptor.cpu());

        Ok(Self(Arc::new(ShaderResourceViewInner {
            resource: resource.clone(),
            slot,
        })))
    }
}

impl UnorderedAccessView {
    pub(crate) fn inner_new(
        device: &Device,
        heap: &OfflineDescriptorHeap,
        resource: &Resource,
        desc: Option<&dx::UnorderedAccessViewDesc>,
    ) -> RhiResult<Self> {
        let slot = ViewSlot::allocate(heap)?;

        device.raw.create_unordered_access_view(
            Some(resource.raw()),
            None::<&dx::Resource>,
            desc,
            slot.descriptor.cpu(),
        );

        Ok(Self(Arc::new(UnorderedAccessViewInner {
            resource: resource.clone(),
            slot,
        })))
    }
}

impl RenderTargetView {
    pub(crate) fn inner_new(
        device: &Device,
        heap: &OfflineDescriptorHeap,
        resource: &Resource,
        desc: Option<&dx::RenderTargetViewDesc>,
    ) -> RhiResult<Self> {
        let slot = ViewSlot::allocate(heap)?;

        device
            .raw
            .create_render_target_view(Some(resource.raw()), desc, slot.descriptor.cpu());

        Ok(Self(Arc::new(RenderTargetViewInner {
            resource: resource.clone(),
            slot,
        })))
    }
}

impl DepthStencilView {
    pub(crate) fn inner_new(
        device: &Device,
        heap: &OfflineDescriptorHeap,
        resource: &Resource,
        desc: Option<&dx::DepthStencilViewDesc>,
    ) -> RhiResult<Self> {
        let slot = ViewSlot::allocate(heap)?;

        device
            .raw
            .create_depth_stencil_view(Some(resource.raw()), desc, slot.descriptor.cpu());

        Ok(Self(Arc::new(DepthStencilViewInner {
            resource: resource.clone(),
            slot,
        })))
    }
}
