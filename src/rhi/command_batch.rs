use oxidx::dx;

use super::{
    descriptor_heap::OnlineDescriptorHeap,
    device::Device,
    error::{RhiError, RhiResult},
    resources::Resource,
    upload::GpuUploader,
    DEFAULT_ONLINE_RESOURCE_DESCRIPTOR_COUNT, DEFAULT_ONLINE_SAMPLER_DESCRIPTOR_COUNT,
};

const INITIAL_UPLOAD_BUFFER_SIZE: u64 = 1024;

/// One generation's worth of per-frame GPU-visible storage: command
/// allocator, upload allocator, online descriptor heaps, and the reference
/// lists keeping resources alive until the GPU retires the batch. A batch
/// must not be reset until its fence value has been reached.
pub struct CommandBatch {
    device: Device,

    pub(crate) allocator: dx::CommandAllocator,
    pub(crate) uploader: GpuUploader,

    pub(crate) online_resource_heap: OnlineDescriptorHeap,
    pub(crate) online_sampler_heap: OnlineDescriptorHeap,

    in_use_resources: Vec<Resource>,
    in_use_native: Vec<dx::Resource>,

    /// Fence value signaled the last time this batch was submitted.
    pub(crate) fence_value: u64,
}

impl CommandBatch {
    pub(crate) fn inner_new(device: Device) -> RhiResult<Self> {
        let allocator = device
            .raw
            .create_command_allocator(dx::CommandListType::Direct)
            .map_err(|e| RhiError::creation("command allocator", e))?;

        let uploader = GpuUploader::inner_new(device.clone(), INITIAL_UPLOAD_BUFFER_SIZE)?;

        let online_resource_heap = OnlineDescriptorHeap::inner_new(
            device.clone(),
            dx::DescriptorHeapType::CbvSrvUav,
            DEFAULT_ONLINE_RESOURCE_DESCRIPTOR_COUNT,
        )?;
        let online_sampler_heap = OnlineDescriptorHeap::inner_new(
            device.clone(),
            dx::DescriptorHeapType::Sampler,
            DEFAULT_ONLINE_SAMPLER_DESCRIPTOR_COUNT,
        )?;

        Ok(Self {
            device,
            allocator,
            uploader,
            online_resource_heap,
            online_sampler_heap,
            in_use_resources: Vec::new(),
            in_use_native: Vec::new(),
            fence_value: 0,
        })
    }

    /// Keeps `resource` alive until this batch's fence is reached.
    pub(crate) fn add_in_use_resource(&mut self, resource: &Resource) {
        self.in_use_resources.push(resource.clone());
    }

    pub(crate) fn add_in_use_native(&mut self, resource: &dx::Resource) {
        self.in_use_native.push(resource.clone());
    }

    /// Called from `begin` after the fence wait: everything the GPU might
    /// still have been reading is now safe to recycle.
    pub(crate) fn reset(&mut self) -> RhiResult<()> {
        self.allocator
            .reset()
            .map_err(|e| self.device.classify_failure("allocator reset", e))?;

        self.in_use_resources.clear();
        self.in_use_native.clear();

        self.uploader.reset();
        self.online_resource_heap.reset();
        self.online_sampler_heap.reset();

        Ok(())
    }
}
