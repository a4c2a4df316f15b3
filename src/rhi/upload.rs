use oxidx::dx;

use crate::utils::NonNullSend;

use super::{
    device::Device,
    error::{RhiError, RhiResult},
};

/// Slack added whenever the buffer has to grow, so a burst of slightly
/// larger uploads does not reallocate every frame.
const GROWTH_SLACK: u64 = 1024;

/// One suballocation out of the upload buffer. The resource handle pins the
/// backing buffer for copy commands; `ptr` is the CPU-visible write cursor.
pub(crate) struct UploadAllocation {
    pub resource: dx::Resource,
    pub offset: u64,
    ptr: NonNullSend<u8>,
    size: u64,
}

impl UploadAllocation {
    /// # Safety contract
    /// The slice is valid until the owning batch is reset; callers write
    /// immediately and never hold it across frames.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size as usize) }
    }
}

/// Per-batch linear allocator over a persistently mapped upload buffer.
/// Growth parks the old buffer in a garbage list; the batch fence guarantees
/// the GPU is done with it before `reset` releases it.
#[derive(Debug)]
pub(crate) struct GpuUploader {
    device: Device,
    resource: dx::Resource,
    mapped: NonNullSend<u8>,
    size: u64,
    offset: u64,
    garbage: Vec<dx::Resource>,
}

impl GpuUploader {
    pub(crate) fn inner_new(device: Device, initial_size: u64) -> RhiResult<Self> {
        let (resource, mapped) = Self::create_buffer(&device, initial_size)?;

        Ok(Self {
            device,
            resource,
            mapped,
            size: initial_size,
            offset: 0,
            garbage: Vec::new(),
        })
    }

    fn create_buffer(device: &Device, size: u64) -> RhiResult<(dx::Resource, NonNullSend<u8>)> {
        let resource = device
            .raw
            .create_committed_resource(
                &dx::HeapProperties::upload(),
                dx::HeapFlags::empty(),
                &dx::ResourceDesc::buffer(size as usize),
                dx::ResourceStates::GenericRead,
                None,
            )
            .map_err(|e| RhiError::creation("upload buffer", e))?;

        let mapped = resource
            .map::<u8>(0, None)
            .map_err(|e| RhiError::creation("upload buffer mapping", e))?;

        Ok((resource, mapped.into()))
    }

    fn reserve(&mut self, size: u64) -> RhiResult<()> {
        if size <= self.size {
            return Ok(());
        }

        let (resource, mapped) = Self::create_buffer(&self.device, size)?;

        self.resource.unmap(0, None);
        let old = std::mem::replace(&mut self.resource, resource);
        self.garbage.push(old);

        self.mapped = mapped;
        self.size = size;
        // The fresh buffer starts empty; anything already recorded against
        // the old one stays valid through the garbage list.
        self.offset = 0;

        Ok(())
    }

    pub(crate) fn allocate(&mut self, size: u64, alignment: u64) -> RhiResult<UploadAllocation> {
        let offset = crate::utils::align_up(self.offset, alignment);
        if offset + size > self.size {
            self.reserve(offset + size + GROWTH_SLACK)?;
            return self.allocate(size, alignment);
        }

        self.offset = offset + size;

        let ptr = unsafe { self.mapped.add(offset as usize) };
        Ok(UploadAllocation {
            resource: self.resource.clone(),
            offset,
            ptr: ptr.into(),
            size,
        })
    }

    /// Allocates and fills in one step; the common path for buffer updates.
    pub(crate) fn write(&mut self, data: &[u8], alignment: u64) -> RhiResult<UploadAllocation> {
        let mut allocation = self.allocate(data.len() as u64, alignment)?;
        allocation.as_mut_slice()[..data.len()].copy_from_slice(data);
        Ok(allocation)
    }

    /// Called once per batch cycle after the fence wait: the GPU is done
    /// with both the garbage buffers and last cycle's allocations.
    pub(crate) fn reset(&mut self) {
        self.garbage.clear();
        self.offset = 0;
    }
}

impl Drop for GpuUploader {
    fn drop(&mut self) {
        self.resource.unmap(0, None);
    }
}
