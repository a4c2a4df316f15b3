use std::{ops::Deref, sync::Arc};

use oxidx::dx;
use parking_lot::Mutex;
use tracing::{debug, error};

use super::{
    device::Device,
    error::{RhiError, RhiResult},
};

/// Capacity of one offline sub-heap. Offline heaps grow by whole sub-heaps.
pub const MAX_OFFLINE_DESCRIPTOR_COUNT: u32 = 2048;

fn heap_desc(ty: dx::DescriptorHeapType, num: u32) -> dx::DescriptorHeapDesc {
    match ty {
        dx::DescriptorHeapType::Rtv => dx::DescriptorHeapDesc::rtv(num),
        dx::DescriptorHeapType::Dsv => dx::DescriptorHeapDesc::dsv(num),
        dx::DescriptorHeapType::Sampler => dx::DescriptorHeapDesc::sampler(num),
        _ => dx::DescriptorHeapDesc::cbr_srv_uav(num),
    }
}

/*
 * Free list
 */

/// Contiguous range of free descriptor indices, end exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeRange {
    begin: u32,
    end: u32,
}

/// Coalescing free list over descriptor indices of one sub-heap. Allocation
/// bump-allocates from the front of the first range; freeing merges with
/// adjacent ranges on both sides so the list does not fragment.
#[derive(Debug)]
pub(crate) struct FreeList {
    ranges: Vec<FreeRange>,
}

impl FreeList {
    pub(crate) fn new(capacity: u32) -> Self {
        Self {
            ranges: vec![FreeRange {
                begin: 0,
                end: capacity,
            }],
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub(crate) fn allocate(&mut self) -> Option<u32> {
        let range = self.ranges.first_mut()?;

        let index = range.begin;
        range.begin += 1;

        if range.begin == range.end {
            self.ranges.remove(0);
        }

        Some(index)
    }

    pub(crate) fn free(&mut self, index: u32) {
        let left = self.ranges.iter().position(|r| r.end == index);
        let right = self.ranges.iter().position(|r| r.begin == index + 1);

        match (left, right) {
            (Some(l), Some(r)) => {
                self.ranges[l].end = self.ranges[r].end;
                self.ranges.remove(r);
            }
            (Some(l), None) => self.ranges[l].end += 1,
            (None, Some(r)) => self.ranges[r].begin = index,
            (None, None) => self.ranges.push(FreeRange {
                begin: index,
                end: index + 1,
            }),
        }
    }

    /// Total number of free descriptors across all ranges.
    pub(crate) fn total_free(&self) -> u32 {
        self.ranges.iter().map(|r| r.end - r.begin).sum()
    }

    #[cfg(test)]
    fn assert_disjoint(&self) {
        let mut sorted = self.ranges.clone();
        sorted.sort_by_key(|r| r.begin);
        for pair in sorted.windows(2) {
            assert!(
                pair[0].end <= pair[1].begin,
                "overlapping free ranges: {:?}",
                sorted
            );
        }
    }
}

/*
 * Offline descriptor heap
 */

/// A stable, CPU-visible descriptor slot. Views hold one of these for their
/// lifetime and return it on drop; the pair (heap index, slot index) is the
/// back-reference into the owning offline heap.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OfflineDescriptor {
    pub(crate) handle: dx::CpuDescriptorHandle,
    heap_index: u32,
    index: u32,
}

impl OfflineDescriptor {
    pub fn cpu(&self) -> dx::CpuDescriptorHandle {
        self.handle
    }
}

#[derive(Debug)]
struct OfflineSubHeap {
    raw: dx::DescriptorHeap,
    free: FreeList,
}

/// Growable set of fixed-capacity CPU-visible sub-heaps with free-list
/// recycling. Shared service: cloned into every view so slots can be
/// returned on drop.
#[derive(Clone, Debug)]
pub struct OfflineDescriptorHeap(Arc<OfflineHeapInner>);

#[derive(Debug)]
pub struct OfflineHeapInner {
    device: Device,
    ty: dx::DescriptorHeapType,
    descriptor_size: usize,
    heaps: Mutex<Vec<OfflineSubHeap>>,
}

impl Deref for OfflineDescriptorHeap {
    type Target = OfflineHeapInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl OfflineDescriptorHeap {
    pub(crate) fn inner_new(device: Device, ty: dx::DescriptorHeapType) -> RhiResult<Self> {
        let descriptor_size = device.descriptor_increment_size(ty);

        let heap = Self(Arc::new(OfflineHeapInner {
            device,
            ty,
            descriptor_size,
            heaps: Mutex::new(Vec::new()),
        }));

        heap.allocate_sub_heap(&mut heap.heaps.lock())?;
        Ok(heap)
    }

    pub fn descriptor_size(&self) -> usize {
        self.descriptor_size
    }

    pub fn allocate(&self) -> RhiResult<OfflineDescriptor> {
        let mut heaps = self.heaps.lock();

        let heap_index = match heaps.iter().position(|h| !h.free.is_empty()) {
            Some(index) => index,
            None => {
                self.allocate_sub_heap(&mut heaps)?;
                heaps.len() - 1
            }
        };

        let sub_heap = &mut heaps[heap_index];
        let index = sub_heap.free.allocate().expect("sub-heap free list empty");

        let handle = sub_heap
            .raw
            .get_cpu_descriptor_handle_for_heap_start()
            .advance(index as usize, self.descriptor_size);

        Ok(OfflineDescriptor {
            handle,
            heap_index: heap_index as u32,
            index,
        })
    }

    pub fn free(&self, descriptor: OfflineDescriptor) {
        let mut heaps = self.heaps.lock();

        debug_assert!((descriptor.heap_index as usize) < heaps.len());
        heaps[descriptor.heap_index as usize]
            .free
            .free(descriptor.index);
    }

    fn allocate_sub_heap(&self, heaps: &mut Vec<OfflineSubHeap>) -> RhiResult<()> {
        let raw = self
            .device
            .raw
            .create_descriptor_heap(&heap_desc(self.ty, MAX_OFFLINE_DESCRIPTOR_COUNT))
            .map_err(|e| {
                error!(target: "rhi::descriptors", ty = ?self.ty, "offline sub-heap creation failed: {e}");
                RhiError::OutOfDescriptors
            })?;

        debug!(
            target: "rhi::descriptors",
            ty = ?self.ty,
            index = heaps.len(),
            "allocated offline sub-heap"
        );

        heaps.push(OfflineSubHeap {
            raw,
            free: FreeList::new(MAX_OFFLINE_DESCRIPTOR_COUNT),
        });

        Ok(())
    }
}

/*
 * Online descriptor heap
 */

/// Linear cursor over one GPU-visible heap generation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RingCursor {
    current: u32,
    capacity: u32,
}

impl RingCursor {
    pub(crate) fn new(capacity: u32) -> Self {
        Self {
            current: 0,
            capacity,
        }
    }

    /// Strict `<`: indices are zero-based, so allocating up to `capacity`
    /// itself would write one past the heap.
    pub(crate) fn has_space(&self, num: u32) -> bool {
        self.current + num < self.capacity
    }

    pub(crate) fn allocate(&mut self, num: u32) -> u32 {
        debug_assert!(self.has_space(num));

        let index = self.current;
        self.current += num;
        index
    }

    pub(crate) fn position(&self) -> u32 {
        self.current
    }

    pub(crate) fn reset(&mut self) {
        self.current = 0;
    }
}

/// Two-stage retirement pool. A heap retired in cycle N sits out cycle N+1
/// ("previous") and only becomes acquirable after the second `reset`, which
/// guarantees the GPU has finished consuming it.
#[derive(Debug)]
pub(crate) struct HeapPool<H> {
    pool: Vec<H>,
    previous: Vec<H>,
    retired: Vec<H>,
}

impl<H> Default for HeapPool<H> {
    fn default() -> Self {
        Self {
            pool: Vec::new(),
            previous: Vec::new(),
            retired: Vec::new(),
        }
    }
}

impl<H> HeapPool<H> {
    pub(crate) fn retire(&mut self, heap: H) {
        self.retired.push(heap);
    }

    pub(crate) fn acquire(&mut self) -> Option<H> {
        self.pool.pop()
    }

    pub(crate) fn reset(&mut self) {
        let previous = std::mem::take(&mut self.previous);
        self.pool.extend(previous);
        self.previous = std::mem::take(&mut self.retired);
    }
}

/// GPU-visible descriptor heap consumed linearly by one command batch.
/// Overflow retires the current heap and pulls a replacement from the pool;
/// `reset` runs once per batch cycle and advances the retirement stages.
#[derive(Debug)]
pub struct OnlineDescriptorHeap {
    device: Device,
    ty: dx::DescriptorHeapType,
    capacity: u32,
    descriptor_size: usize,

    heap: dx::DescriptorHeap,
    cpu_start: dx::CpuDescriptorHandle,
    gpu_start: dx::GpuDescriptorHandle,

    cursor: RingCursor,
    pool: HeapPool<dx::DescriptorHeap>,
}

impl OnlineDescriptorHeap {
    pub(crate) fn inner_new(
        device: Device,
        ty: dx::DescriptorHeapType,
        capacity: u32,
    ) -> RhiResult<Self> {
        let descriptor_size = device.descriptor_increment_size(ty);
        let heap = Self::create_heap(&device, ty, capacity)?;

        let cpu_start = heap.get_cpu_descriptor_handle_for_heap_start();
        let gpu_start = heap.get_gpu_descriptor_handle_for_heap_start();

        Ok(Self {
            device,
            ty,
            capacity,
            descriptor_size,
            heap,
            cpu_start,
            gpu_start,
            cursor: RingCursor::new(capacity),
            pool: HeapPool::default(),
        })
    }

    fn create_heap(
        device: &Device,
        ty: dx::DescriptorHeapType,
        capacity: u32,
    ) -> RhiResult<dx::DescriptorHeap> {
        let desc = heap_desc(ty, capacity).with_flags(dx::DescriptorHeapFlags::ShaderVisible);

        device
            .raw
            .create_descriptor_heap(&desc)
            .map_err(|e| RhiError::creation("online descriptor heap", e))
    }

    pub fn heap(&self) -> &dx::DescriptorHeap {
        &self.heap
    }

    pub fn descriptor_size(&self) -> usize {
        self.descriptor_size
    }

    pub fn has_space(&self, num: u32) -> bool {
        self.cursor.has_space(num)
    }

    /// Bump-allocates `num` contiguous handles, rolling over to a fresh heap
    /// when the current one cannot fit them.
    pub fn allocate_handles(&mut self, num: u32) -> RhiResult<u32> {
        if num >= self.capacity {
            return Err(RhiError::InvalidParameter(
                "descriptor allocation exceeds online heap capacity",
            ));
        }

        if !self.has_space(num) {
            self.allocate_fresh_heap()?;
        }

        Ok(self.cursor.allocate(num))
    }

    /// Retires the current heap into this cycle's discard set and swaps in a
    /// pooled (or new) heap. Callers must rebind descriptor heaps on the
    /// command list afterwards.
    pub fn allocate_fresh_heap(&mut self) -> RhiResult<()> {
        let fresh = match self.pool.acquire() {
            Some(heap) => heap,
            None => Self::create_heap(&self.device, self.ty, self.capacity)?,
        };

        let retired = std::mem::replace(&mut self.heap, fresh);
        self.pool.retire(retired);

        self.cpu_start = self.heap.get_cpu_descriptor_handle_for_heap_start();
        self.gpu_start = self.heap.get_gpu_descriptor_handle_for_heap_start();
        self.cursor.reset();

        debug!(target: "rhi::descriptors", ty = ?self.ty, "rolled over to fresh online heap");

        Ok(())
    }

    /// Called once per command-batch cycle, after the batch's fence has been
    /// waited on.
    pub fn reset(&mut self) {
        self.pool.reset();
        self.cursor.reset();
    }

    pub fn cpu_at(&self, index: u32) -> dx::CpuDescriptorHandle {
        debug_assert!(index < self.capacity);
        self.cpu_start.advance(index as usize, self.descriptor_size)
    }

    pub fn gpu_at(&self, index: u32) -> dx::GpuDescriptorHandle {
        debug_assert!(index < self.capacity);
        self.gpu_start.advance(index as usize, self.descriptor_size)
    }
}

#[cfg(test)]
mod tests {
    use rand::{seq::SliceRandom, Rng, SeedableRng};

    use super::{FreeList, HeapPool, RingCursor};

    #[test]
    fn free_list_allocates_in_order() {
        let mut list = FreeList::new(4);

        assert_eq!(list.allocate(), Some(0));
        assert_eq!(list.allocate(), Some(1));
        assert_eq!(list.allocate(), Some(2));
        assert_eq!(list.allocate(), Some(3));
        assert_eq!(list.allocate(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn free_list_round_trip_restores_capacity() {
        let mut list = FreeList::new(8);

        let allocated = (0..8).map(|_| list.allocate().unwrap()).collect::<Vec<_>>();
        for index in allocated.into_iter().rev() {
            list.free(index);
        }

        list.assert_disjoint();
        assert_eq!(list.total_free(), 8);
        // Both-sided coalescing collapses everything back into one range.
        assert_eq!(list.ranges.len(), 1);
    }

    #[test]
    fn free_list_merges_both_neighbors() {
        let mut list = FreeList::new(8);
        while list.allocate().is_some() {}

        // Freeing 2 and 4 leaves two singleton ranges; freeing 3 must bridge
        // them into one.
        list.free(2);
        list.free(4);
        assert_eq!(list.ranges.len(), 2);

        list.free(3);
        list.assert_disjoint();
        assert_eq!(list.ranges.len(), 1);
        assert_eq!(list.total_free(), 3);
    }

    #[test]
    fn free_list_randomized_round_trips() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x0f11);

        for _ in 0..64 {
            let capacity = rng.gen_range(1..64u32);
            let mut list = FreeList::new(capacity);

            let count = rng.gen_range(0..=capacity);
            let mut held = (0..count)
                .map(|_| list.allocate().unwrap())
                .collect::<Vec<_>>();
            held.shuffle(&mut rng);

            for index in held {
                list.free(index);
                list.assert_disjoint();
            }

            assert_eq!(list.total_free(), capacity);
        }
    }

    #[test]
    fn ring_cursor_has_strict_capacity_bound() {
        let mut cursor = RingCursor::new(8);

        // 7 is the last index a zero-based heap of 8 can hand out in one
        // block without writing out of bounds.
        assert!(cursor.has_space(7));
        assert!(!cursor.has_space(8));

        assert_eq!(cursor.allocate(4), 0);
        assert!(cursor.has_space(3));
        assert!(!cursor.has_space(4));
        assert_eq!(cursor.allocate(3), 4);
        assert_eq!(cursor.position(), 7);
    }

    #[test]
    fn heap_pool_delays_reuse_by_two_resets() {
        let mut pool: HeapPool<u32> = HeapPool::default();

        pool.retire(1);
        assert_eq!(pool.acquire(), None);

        pool.reset();
        // One reset later the heap may still be in flight on the GPU.
        assert_eq!(pool.acquire(), None);

        pool.reset();
        assert_eq!(pool.acquire(), Some(1));
        assert_eq!(pool.acquire(), None);
    }

    #[test]
    fn heap_pool_keeps_generations_apart() {
        let mut pool: HeapPool<u32> = HeapPool::default();

        pool.retire(1);
        pool.reset();
        pool.retire(2);
        pool.reset();

        // Only the older generation is available.
        assert_eq!(pool.acquire(), Some(1));
        assert_eq!(pool.acquire(), None);

        pool.reset();
        assert_eq!(pool.acquire(), Some(2));
    }
}
