use std::sync::Arc;

use oxidx::dx;

use crate::rhi::{
    descriptor_heap::{OfflineDescriptor, OfflineDescriptorHeap},
    device::Device,
    error::RhiResult,
};

/// An immutable sampler occupying one offline sampler slot. The slot goes
/// back to the heap's free list when the last reference drops.
#[derive(Clone, Debug)]
pub struct SamplerState(Arc<SamplerStateInner>);

#[derive(Debug)]
struct SamplerStateInner {
    descriptor: OfflineDescriptor,
    heap: OfflineDescriptorHeap,
}

impl SamplerState {
    pub(crate) fn inner_new(
        device: &Device,
        heap: &OfflineDescriptorHeap,
        desc: &dx::SamplerDesc,
    ) -> RhiResult<Self> {
        let descriptor = heap.allocate()?;
        device.raw.create_sampler(desc, descriptor.cpu());

        Ok(Self(Arc::new(SamplerStateInner {
            descriptor,
            heap: heap.clone(),
        })))
    }

    pub fn offline_handle(&self) -> dx::CpuDescriptorHandle {
        self.0.descriptor.cpu()
    }
}

impl Drop for SamplerStateInner {
    fn drop(&mut self) {
        self.heap.free(self.descriptor);
    }
}
