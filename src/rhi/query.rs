use oxidx::dx;

use super::{
    device::Device,
    error::{RhiError, RhiResult},
    resources::{Buffer, BufferDesc, BufferUsage},
    types::HeapKind,
};

/// Timestamp query pairs resolved into a readback buffer at `end`. Indices
/// address pairs: `begin_timestamp(i)` writes slot `2*i`, `end_timestamp(i)`
/// slot `2*i + 1`.
#[derive(Clone, Debug)]
pub struct GpuProfiler(std::sync::Arc<GpuProfilerInner>);

#[derive(Debug)]
pub struct GpuProfilerInner {
    heap: dx::QueryHeap,
    readback: Buffer,
    capacity: u32,
}

impl std::ops::Deref for GpuProfiler {
    type Target = GpuProfilerInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl GpuProfiler {
    pub(crate) fn inner_new(device: &Device, num_timestamps: u32) -> RhiResult<Self> {
        let capacity = num_timestamps * 2;

        let heap = device
            .raw
            .create_query_heap(&dx::QueryHeapDesc::timestamp(capacity))
            .map_err(|e| RhiError::creation("timestamp query heap", e))?;

        let readback = Buffer::inner_new(
            device,
            BufferDesc::new(
                capacity as u64 * std::mem::size_of::<u64>() as u64,
                BufferUsage::empty(),
            )
            .with_heap_kind(HeapKind::Readback),
        )?;

        Ok(Self(std::sync::Arc::new(GpuProfilerInner {
            heap,
            readback,
            capacity,
        })))
    }

    pub(crate) fn write_timestamp(&self, list: &dx::GraphicsCommandList, slot: u32) {
        debug_assert!(slot < self.capacity);
        list.end_query(&self.heap, dx::QueryType::Timestamp, slot);
    }

    /// Records the copy of all written slots into the readback buffer.
    pub(crate) fn resolve(&self, list: &dx::GraphicsCommandList) {
        list.resolve_query_data(
            &self.heap,
            dx::QueryType::Timestamp,
            0..self.capacity,
            self.readback.raw(),
            0,
        );
    }

    /// CPU-side readout; valid once the submitting batch's fence passed.
    pub fn read_timestamps(&self) -> RhiResult<Vec<u64>> {
        let mapped = self.readback.map::<u64>()?;
        let values =
            unsafe { std::slice::from_raw_parts(mapped.as_ptr(), self.capacity as usize) }.to_vec();
        self.readback.unmap();

        Ok(values)
    }
}
