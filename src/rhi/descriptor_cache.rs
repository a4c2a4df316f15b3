use oxidx::dx;
use smallvec::SmallVec;

use super::{
    descriptor_heap::{OfflineDescriptor, OfflineDescriptorHeap, OnlineDescriptorHeap},
    device::Device,
    error::RhiResult,
    root_signature::RootSignature,
    types::{ResourceBindingKind, ShaderVisibility, NUM_SHADER_VISIBILITIES},
    DEFAULT_CONSTANT_BUFFER_COUNT, DEFAULT_SAMPLER_STATE_COUNT,
    DEFAULT_SHADER_RESOURCE_VIEW_COUNT, DEFAULT_UNORDERED_ACCESS_VIEW_COUNT,
    MAX_32BIT_SHADER_CONSTANTS, MAX_RENDER_TARGET_COUNT, MAX_VERTEX_BUFFER_SLOTS,
};

/*
 * Per-kind view cache
 */

/// Currently bound offline handles for one binding kind, per visibility,
/// with dirty tracking. A register slot is only recopied into the online
/// heap when its handle actually changed since the last commit.
#[derive(Debug)]
pub(crate) struct ViewCache<const N: usize> {
    handles: [[dx::CpuDescriptorHandle; N]; NUM_SHADER_VISIBILITIES],
    null: dx::CpuDescriptorHandle,
    table_starts: [dx::GpuDescriptorHandle; NUM_SHADER_VISIBILITIES],
    dirty: [bool; NUM_SHADER_VISIBILITIES],
    range_lengths: [u32; NUM_SHADER_VISIBILITIES],
}

impl<const N: usize> ViewCache<N> {
    fn new(null: dx::CpuDescriptorHandle) -> Self {
        Self {
            handles: [[null; N]; NUM_SHADER_VISIBILITIES],
            null,
            table_starts: Default::default(),
            dirty: [true; NUM_SHADER_VISIBILITIES],
            range_lengths: [0; NUM_SHADER_VISIBILITIES],
        }
    }

    pub(crate) fn set(
        &mut self,
        handle: Option<dx::CpuDescriptorHandle>,
        visibility: ShaderVisibility,
        register: u32,
    ) {
        debug_assert!((register as usize) < N, "shader register out of range");

        let handle = handle.unwrap_or(self.null);
        let slot = &mut self.handles[visibility.index()][register as usize];

        if *slot != handle {
            *slot = handle;
            self.dirty[visibility.index()] = true;

            let range = &mut self.range_lengths[visibility.index()];
            *range = (*range).max(register + 1);
        }
    }

    pub(crate) fn reset(&mut self) {
        self.handles = [[self.null; N]; NUM_SHADER_VISIBILITIES];
        self.table_starts = Default::default();
        self.dirty = [true; NUM_SHADER_VISIBILITIES];
        self.range_lengths = [0; NUM_SHADER_VISIBILITIES];
    }

    pub(crate) fn invalidate_all(&mut self) {
        self.dirty = [true; NUM_SHADER_VISIBILITIES];
    }

    pub(crate) fn is_dirty(&self, visibility: ShaderVisibility) -> bool {
        self.dirty[visibility.index()]
    }

    pub(crate) fn range_length(&self, visibility: ShaderVisibility) -> u32 {
        self.range_lengths[visibility.index()]
    }

    /// Descriptors a commit would have to copy right now.
    pub(crate) fn count_needed(&self) -> u32 {
        ShaderVisibility::ALL
            .iter()
            .filter(|v| self.is_dirty(**v))
            .map(|v| self.range_length(*v))
            .sum()
    }

    pub(crate) fn handles(&self, visibility: ShaderVisibility) -> &[dx::CpuDescriptorHandle] {
        &self.handles[visibility.index()][..self.range_length(visibility) as usize]
    }

    pub(crate) fn set_table_start(
        &mut self,
        visibility: ShaderVisibility,
        start: dx::GpuDescriptorHandle,
    ) {
        self.table_starts[visibility.index()] = start;
    }

    pub(crate) fn table_start(&self, visibility: ShaderVisibility) -> dx::GpuDescriptorHandle {
        self.table_starts[visibility.index()]
    }

    pub(crate) fn mark_clean(&mut self, visibility: ShaderVisibility) {
        self.dirty[visibility.index()] = false;
    }
}

/*
 * Input-assembler and output-merger caches
 */

#[derive(Debug, Default)]
pub(crate) struct VertexBufferCache {
    views: [Option<dx::VertexBufferView>; MAX_VERTEX_BUFFER_SLOTS],
    num_views: u32,
    views_dirty: bool,

    index_view: Option<dx::IndexBufferView>,
    index_dirty: bool,
}

impl VertexBufferCache {
    pub(crate) fn set_vertex_buffer(&mut self, view: dx::VertexBufferView, slot: u32) {
        debug_assert!((slot as usize) < MAX_VERTEX_BUFFER_SLOTS);

        if self.views[slot as usize] != Some(view) {
            self.views[slot as usize] = Some(view);
            self.num_views = self.num_views.max(slot + 1);
            self.views_dirty = true;
        }
    }

    pub(crate) fn set_index_buffer(&mut self, view: Option<dx::IndexBufferView>) {
        if self.index_view != view {
            self.index_view = view;
            self.index_dirty = true;
        }
    }

    pub(crate) fn commit(&mut self, list: &dx::GraphicsCommandList) {
        if self.views_dirty {
            let views = self.views[..self.num_views as usize]
                .iter()
                .map(|view| view.unwrap_or(dx::VertexBufferView::new(0, 0, 0)))
                .collect::<SmallVec<[_; MAX_VERTEX_BUFFER_SLOTS]>>();

            list.ia_set_vertex_buffers(0, &views);
            self.views_dirty = false;
        }

        if self.index_dirty {
            list.ia_set_index_buffer(self.index_view.as_ref());
            self.index_dirty = false;
        }
    }

    pub(crate) fn reset(&mut self) {
        self.views = Default::default();
        self.num_views = 0;
        self.views_dirty = true;
        self.index_view = None;
        self.index_dirty = true;
    }
}

#[derive(Debug, Default)]
pub(crate) struct RenderTargetCache {
    handles: [Option<dx::CpuDescriptorHandle>; MAX_RENDER_TARGET_COUNT],
    num_targets: u32,
    depth_stencil: Option<dx::CpuDescriptorHandle>,
    dirty: bool,
}

impl RenderTargetCache {
    pub(crate) fn set_render_target(
        &mut self,
        handle: Option<dx::CpuDescriptorHandle>,
        slot: u32,
    ) {
        debug_assert!((slot as usize) < MAX_RENDER_TARGET_COUNT);

        self.handles[slot as usize] = handle;
        self.num_targets = self.num_targets.max(slot + 1);
        self.dirty = true;
    }

    pub(crate) fn set_depth_stencil(&mut self, handle: Option<dx::CpuDescriptorHandle>) {
        self.depth_stencil = handle;
        self.dirty = true;
    }

    pub(crate) fn clear_targets(&mut self) {
        self.handles = Default::default();
        self.num_targets = 0;
        self.depth_stencil = None;
        self.dirty = true;
    }

    pub(crate) fn commit(&mut self, list: &dx::GraphicsCommandList) {
        if !self.dirty {
            return;
        }

        let handles = self.handles[..self.num_targets as usize]
            .iter()
            .map(|handle| handle.unwrap_or_default())
            .collect::<SmallVec<[_; MAX_RENDER_TARGET_COUNT]>>();

        list.om_set_render_targets(&handles, false, self.depth_stencil);
        self.dirty = false;
    }

    pub(crate) fn reset(&mut self) {
        self.clear_targets();
    }
}

/*
 * Root-constant cache
 */

#[derive(Debug)]
pub(crate) struct ShaderConstantsCache {
    constants: [u32; MAX_32BIT_SHADER_CONSTANTS as usize],
    num_constants: u32,
}

impl Default for ShaderConstantsCache {
    fn default() -> Self {
        Self {
            constants: [0; MAX_32BIT_SHADER_CONSTANTS as usize],
            num_constants: 0,
        }
    }
}

impl ShaderConstantsCache {
    pub(crate) fn set(&mut self, constants: &[u32]) {
        debug_assert!(constants.len() <= MAX_32BIT_SHADER_CONSTANTS as usize);

        self.constants[..constants.len()].copy_from_slice(constants);
        self.num_constants = constants.len() as u32;
    }

    pub(crate) fn commit_graphics(
        &self,
        list: &dx::GraphicsCommandList,
        root_signature: &RootSignature,
    ) {
        if self.num_constants == 0 {
            return;
        }

        if let Some(index) = root_signature.constants_index() {
            list.set_graphics_root_32bit_constants(
                index,
                &self.constants[..self.num_constants as usize],
                0,
            );
        }
    }

    pub(crate) fn commit_compute(
        &self,
        list: &dx::GraphicsCommandList,
        root_signature: &RootSignature,
    ) {
        if self.num_constants == 0 {
            return;
        }

        if let Some(index) = root_signature.constants_index() {
            list.set_compute_root_32bit_constants(
                index,
                &self.constants[..self.num_constants as usize],
                0,
            );
        }
    }

    pub(crate) fn reset(&mut self) {
        self.num_constants = 0;
    }
}

/*
 * Descriptor cache
 */

struct NullDescriptor {
    descriptor: OfflineDescriptor,
    heap: OfflineDescriptorHeap,
}

impl Drop for NullDescriptor {
    fn drop(&mut self) {
        self.heap.free(self.descriptor);
    }
}

/// Per-context binding cache. Bound descriptors accumulate here and are
/// copied into the online heaps and committed to the command list lazily,
/// only when dirty, just before a draw or dispatch.
pub struct DescriptorCache {
    device: Device,

    pub(crate) vertex_buffers: VertexBufferCache,
    pub(crate) render_targets: RenderTargetCache,

    cbvs: ViewCache<{ DEFAULT_CONSTANT_BUFFER_COUNT as usize }>,
    srvs: ViewCache<{ DEFAULT_SHADER_RESOURCE_VIEW_COUNT as usize }>,
    uavs: ViewCache<{ DEFAULT_UNORDERED_ACCESS_VIEW_COUNT as usize }>,
    samplers: ViewCache<{ DEFAULT_SAMPLER_STATE_COUNT as usize }>,

    bound_heaps: [Option<dx::DescriptorHeap>; 2],

    _null_views: [NullDescriptor; 4],
}

impl DescriptorCache {
    pub(crate) fn inner_new(
        device: Device,
        resource_heap: &OfflineDescriptorHeap,
        sampler_heap: &OfflineDescriptorHeap,
    ) -> RhiResult<Self> {
        // Null descriptors back every register slot nothing is bound to, so
        // fixed-size tables can always be copied whole.
        let null_cbv = resource_heap.allocate()?;
        device
            .raw
            .create_constant_buffer_view(Some(&dx::ConstantBufferViewDesc::new(0, 0)), null_cbv.cpu());

        let null_srv = resource_heap.allocate()?;
        device.raw.create_shader_resource_view(
            None::<&dx::Resource>,
            Some(&dx::ShaderResourceViewDesc::texture_2d(
                dx::Format::Rgba8Unorm,
                0,
                1,
                0.0,
                0,
            )),
            null_srv.cpu(),
        );

        let null_uav = resource_heap.allocate()?;
        device.raw.create_unordered_access_view(
            None::<&dx::Resource>,
            None::<&dx::Resource>,
            Some(&dx::UnorderedAccessViewDesc::texture_2d(
                dx::Format::Rgba8Unorm,
                0,
                0,
            )),
            null_uav.cpu(),
        );

        let null_sampler = sampler_heap.allocate()?;
        let sampler_desc = dx::SamplerDesc::linear()
            .with_address_u(dx::AddressMode::Clamp)
            .with_address_v(dx::AddressMode::Clamp)
            .with_address_w(dx::AddressMode::Clamp)
            .with_comparison_func(dx::ComparisonFunc::Never)
            .with_border_color([1.0, 1.0, 1.0, 1.0])
            .with_lod(f32::MIN..f32::MAX);
        device.raw.create_sampler(&sampler_desc, null_sampler.cpu());

        Ok(Self {
            device,
            vertex_buffers: VertexBufferCache::default(),
            render_targets: RenderTargetCache::default(),
            cbvs: ViewCache::new(null_cbv.cpu()),
            srvs: ViewCache::new(null_srv.cpu()),
            uavs: ViewCache::new(null_uav.cpu()),
            samplers: ViewCache::new(null_sampler.cpu()),
            bound_heaps: [None, None],
            _null_views: [
                NullDescriptor {
                    descriptor: null_cbv,
                    heap: resource_heap.clone(),
                },
                NullDescriptor {
                    descriptor: null_srv,
                    heap: resource_heap.clone(),
                },
                NullDescriptor {
                    descriptor: null_uav,
                    heap: resource_heap.clone(),
                },
                NullDescriptor {
                    descriptor: null_sampler,
                    heap: sampler_heap.clone(),
                },
            ],
        })
    }

    pub(crate) fn set_constant_buffer_view(
        &mut self,
        handle: Option<dx::CpuDescriptorHandle>,
        visibility: ShaderVisibility,
        register: u32,
    ) {
        self.cbvs.set(handle, visibility, register);
    }

    pub(crate) fn set_shader_resource_view(
        &mut self,
        handle: Option<dx::CpuDescriptorHandle>,
        visibility: ShaderVisibility,
        register: u32,
    ) {
        self.srvs.set(handle, visibility, register);
    }

    pub(crate) fn set_unordered_access_view(
        &mut self,
        handle: Option<dx::CpuDescriptorHandle>,
        visibility: ShaderVisibility,
        register: u32,
    ) {
        self.uavs.set(handle, visibility, register);
    }

    pub(crate) fn set_sampler_state(
        &mut self,
        handle: Option<dx::CpuDescriptorHandle>,
        visibility: ShaderVisibility,
        register: u32,
    ) {
        self.samplers.set(handle, visibility, register);
    }

    /// The context just bound heaps directly (mip generation does); the next
    /// commit must re-set heaps and recopy every table.
    pub(crate) fn invalidate_bound_heaps(&mut self) {
        self.bound_heaps = [None, None];
        self.cbvs.invalidate_all();
        self.srvs.invalidate_all();
        self.uavs.invalidate_all();
        self.samplers.invalidate_all();
    }

    pub(crate) fn reset(&mut self) {
        self.vertex_buffers.reset();
        self.render_targets.reset();
        self.cbvs.reset();
        self.srvs.reset();
        self.uavs.reset();
        self.samplers.reset();
        self.bound_heaps = [None, None];
    }

    pub(crate) fn commit_graphics(
        &mut self,
        list: &dx::GraphicsCommandList,
        resource_heap: &mut OnlineDescriptorHeap,
        sampler_heap: &mut OnlineDescriptorHeap,
        root_signature: &RootSignature,
    ) -> RhiResult<()> {
        self.vertex_buffers.commit(list);
        self.render_targets.commit(list);

        self.commit_tables(
            list,
            resource_heap,
            sampler_heap,
            root_signature,
            &ShaderVisibility::ALL,
            true,
        )
    }

    pub(crate) fn commit_compute(
        &mut self,
        list: &dx::GraphicsCommandList,
        resource_heap: &mut OnlineDescriptorHeap,
        sampler_heap: &mut OnlineDescriptorHeap,
        root_signature: &RootSignature,
    ) -> RhiResult<()> {
        self.commit_tables(
            list,
            resource_heap,
            sampler_heap,
            root_signature,
            &[ShaderVisibility::All],
            false,
        )
    }

    fn commit_tables(
        &mut self,
        list: &dx::GraphicsCommandList,
        resource_heap: &mut OnlineDescriptorHeap,
        sampler_heap: &mut OnlineDescriptorHeap,
        root_signature: &RootSignature,
        visibilities: &[ShaderVisibility],
        graphics: bool,
    ) -> RhiResult<()> {
        // Make sure the current heap generation can hold everything dirty.
        // Rolling to a fresh heap orphans already-copied tables, so every
        // cache is invalidated and recopied into the new heap.
        let needed_resources =
            self.cbvs.count_needed() + self.srvs.count_needed() + self.uavs.count_needed();
        if !resource_heap.has_space(needed_resources) {
            self.cbvs.invalidate_all();
            self.srvs.invalidate_all();
            self.uavs.invalidate_all();
            resource_heap.allocate_fresh_heap()?;
        }

        if !sampler_heap.has_space(self.samplers.count_needed()) {
            self.samplers.invalidate_all();
            sampler_heap.allocate_fresh_heap()?;
        }

        let heaps = [
            Some(resource_heap.heap().clone()),
            Some(sampler_heap.heap().clone()),
        ];
        if self.bound_heaps[0] != heaps[0] || self.bound_heaps[1] != heaps[1] {
            list.set_descriptor_heaps(&heaps);
            self.bound_heaps = heaps;

            self.cbvs.invalidate_all();
            self.srvs.invalidate_all();
            self.uavs.invalidate_all();
            self.samplers.invalidate_all();
        }

        let device = self.device.clone();
        for &visibility in visibilities {
            Self::commit_kind(
                &device,
                &mut self.cbvs,
                ResourceBindingKind::Cbv,
                list,
                resource_heap,
                root_signature,
                visibility,
                graphics,
            )?;
            Self::commit_kind(
                &device,
                &mut self.srvs,
                ResourceBindingKind::Srv,
                list,
                resource_heap,
                root_signature,
                visibility,
                graphics,
            )?;
            Self::commit_kind(
                &device,
                &mut self.uavs,
                ResourceBindingKind::Uav,
                list,
                resource_heap,
                root_signature,
                visibility,
                graphics,
            )?;
            Self::commit_kind(
                &device,
                &mut self.samplers,
                ResourceBindingKind::Sampler,
                list,
                sampler_heap,
                root_signature,
                visibility,
                graphics,
            )?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_kind<const N: usize>(
        device: &Device,
        cache: &mut ViewCache<N>,
        kind: ResourceBindingKind,
        list: &dx::GraphicsCommandList,
        heap: &mut OnlineDescriptorHeap,
        root_signature: &RootSignature,
        visibility: ShaderVisibility,
        graphics: bool,
    ) -> RhiResult<()> {
        let Some(parameter_index) = root_signature.table_index(visibility, kind) else {
            return Ok(());
        };

        if !cache.is_dirty(visibility) {
            return Ok(());
        }

        let num = cache.range_length(visibility);
        if num > 0 {
            let start = heap.allocate_handles(num)?;

            device.raw.copy_descriptors(
                &[heap.cpu_at(start)],
                Some(&[num]),
                cache.handles(visibility),
                None,
                match kind {
                    ResourceBindingKind::Sampler => dx::DescriptorHeapType::Sampler,
                    _ => dx::DescriptorHeapType::CbvSrvUav,
                },
            );

            cache.set_table_start(visibility, heap.gpu_at(start));

            if graphics {
                list.set_graphics_root_descriptor_table(
                    parameter_index,
                    cache.table_start(visibility),
                );
            } else {
                list.set_compute_root_descriptor_table(
                    parameter_index,
                    cache.table_start(visibility),
                );
            }
        }

        cache.mark_clean(visibility);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(n: usize) -> dx::CpuDescriptorHandle {
        dx::CpuDescriptorHandle::default().offset(n * 32)
    }

    #[test]
    fn set_marks_dirty_and_extends_range() {
        let mut cache: ViewCache<8> = ViewCache::new(handle(0));

        assert_eq!(cache.range_length(ShaderVisibility::Pixel), 0);

        cache.set(Some(handle(1)), ShaderVisibility::Pixel, 3);
        assert!(cache.is_dirty(ShaderVisibility::Pixel));
        assert_eq!(cache.range_length(ShaderVisibility::Pixel), 4);

        // Lower registers do not shrink the tracked range.
        cache.set(Some(handle(2)), ShaderVisibility::Pixel, 1);
        assert_eq!(cache.range_length(ShaderVisibility::Pixel), 4);
    }

    #[test]
    fn identical_rebind_stays_clean() {
        let mut cache: ViewCache<8> = ViewCache::new(handle(0));

        cache.set(Some(handle(1)), ShaderVisibility::Vertex, 0);
        cache.mark_clean(ShaderVisibility::Vertex);

        cache.set(Some(handle(1)), ShaderVisibility::Vertex, 0);
        assert!(!cache.is_dirty(ShaderVisibility::Vertex));
        assert_eq!(cache.count_needed(), 0);
    }

    #[test]
    fn unbinding_substitutes_the_null_handle() {
        let mut cache: ViewCache<8> = ViewCache::new(handle(0));

        cache.set(Some(handle(5)), ShaderVisibility::All, 2);
        cache.mark_clean(ShaderVisibility::All);

        cache.set(None, ShaderVisibility::All, 2);
        assert!(cache.is_dirty(ShaderVisibility::All));
        assert_eq!(cache.handles(ShaderVisibility::All)[2], handle(0));
    }

    #[test]
    fn count_needed_sums_only_dirty_stages() {
        let mut cache: ViewCache<8> = ViewCache::new(handle(0));

        cache.set(Some(handle(1)), ShaderVisibility::Vertex, 1);
        cache.set(Some(handle(2)), ShaderVisibility::Pixel, 3);
        assert_eq!(cache.count_needed(), 2 + 4);

        cache.mark_clean(ShaderVisibility::Vertex);
        assert_eq!(cache.count_needed(), 4);

        cache.invalidate_all();
        assert_eq!(cache.count_needed(), 2 + 4);
    }

    #[test]
    fn reset_clears_ranges_and_handles() {
        let mut cache: ViewCache<8> = ViewCache::new(handle(0));

        cache.set(Some(handle(3)), ShaderVisibility::Pixel, 7);
        cache.reset();

        assert_eq!(cache.range_length(ShaderVisibility::Pixel), 0);
        assert!(cache.is_dirty(ShaderVisibility::Pixel));
        for visibility in ShaderVisibility::ALL {
            assert_eq!(cache.handles(visibility).len(), 0);
        }
    }

    #[test]
    fn constants_cache_truncates_on_reset() {
        let mut cache = ShaderConstantsCache::default();

        cache.set(&[1, 2, 3]);
        assert_eq!(cache.num_constants, 3);

        cache.reset();
        assert_eq!(cache.num_constants, 0);
    }
}
