use std::ffi::CString;

use glam::Vec2;
use oxidx::dx;
use tracing::{debug, info, warn};
use windows::Win32::Graphics::Dxgi::{DXGIGetDebugInterface1, IDXGraphicsAnalysis};

use crate::utils::{align_up, div_round_up};

use super::{
    barrier::BarrierBatcher,
    command_batch::CommandBatch,
    descriptor_cache::{DescriptorCache, ShaderConstantsCache},
    descriptor_heap::OfflineDescriptorHeap,
    device::Device,
    error::{RhiError, RhiResult},
    fence::Fence,
    pipeline::{ComputePipelineState, GraphicsPipelineState, Shader},
    query::GpuProfiler,
    raytracing::{list4, RayTracingGeometry, RayTracingPipelineState, RayTracingScene, ShaderBindingTable},
    resources::{Buffer, Resource, SamplerState, Texture},
    root_signature::{RootSignature, RootSignatureCache},
    types::{PrimitiveTopology, ResourceBindingKind, ResourceStates, ShaderVisibility},
    views::{ConstantBufferView, DepthStencilView, RenderTargetView, ShaderResourceView, UnorderedAccessView},
    NUM_COMMAND_BATCHES,
};

/// Rows uploaded into textures are placed on 256-byte pitches.
const TEXTURE_DATA_PITCH_ALIGNMENT: u32 = 256;
/// Buffer uploads are padded to 16 bytes for the copy.
const BUFFER_UPLOAD_ALIGNMENT: u64 = 16;

const MIP_LEVELS_PER_DISPATCH: u32 = 4;
const MIP_GEN_THREAD_GROUP_SIZE: u32 = 8;

/// Precompiled compute shaders for mip generation; shader compilation is
/// external, so the engine hands the DXIL in at context creation.
#[derive(Clone, Debug)]
pub struct MipGenShaders {
    pub texture_2d: Shader,
    pub texture_cube: Shader,
}

struct MipGenPipelines {
    texture_2d: ComputePipelineState,
    texture_cube: ComputePipelineState,
}

/// Copy geometry for `copy_buffer`.
#[derive(Clone, Copy, Debug)]
pub struct CopyBufferInfo {
    pub source_offset: u64,
    pub destination_offset: u64,
    pub size_in_bytes: u64,
}

/// Copy geometry for `copy_texture_region`.
#[derive(Clone, Copy, Debug)]
pub struct CopyTextureInfo {
    pub source_subresource: u32,
    pub source_origin: (u32, u32, u32),
    pub destination_subresource: u32,
    pub destination_origin: (u32, u32, u32),
    pub extent: (u32, u32, u32),
}

fn format_stride(format: dx::Format) -> u32 {
    match format {
        dx::Format::Rgba32Float => 16,
        dx::Format::Rgba16Float | dx::Format::Rg32Float => 8,
        dx::Format::Rgba8Unorm
        | dx::Format::Rgba8UnormSrgb
        | dx::Format::Bgra8Unorm
        | dx::Format::R32Float
        | dx::Format::R32Uint
        | dx::Format::D32Float
        | dx::Format::Rg16Float
        | dx::Format::Rg11B10Float => 4,
        dx::Format::R16Float | dx::Format::R16Uint | dx::Format::Rg8Unorm => 2,
        _ => 1,
    }
}

/// The facade sequencing batches, caches and barriers into the public
/// render-API contract. One recording thread per context; the GPU runs
/// asynchronously behind the fence.
pub struct CommandContext {
    device: Device,

    queue: dx::CommandQueue,
    list: dx::GraphicsCommandList,
    fence: Fence,
    fence_value: u64,

    batches: Vec<CommandBatch>,
    next_batch: usize,
    current_batch: usize,
    is_recording: bool,

    descriptor_cache: DescriptorCache,
    constants_cache: ShaderConstantsCache,
    barriers: BarrierBatcher,

    current_graphics_pipeline: Option<GraphicsPipelineState>,
    current_graphics_root_signature: Option<RootSignature>,
    current_compute_pipeline: Option<ComputePipelineState>,
    current_compute_root_signature: Option<RootSignature>,
    current_ray_tracing_pipeline: Option<RayTracingPipelineState>,
    current_shader_binding_table: Option<ShaderBindingTable>,
    current_topology: PrimitiveTopology,

    pending_profilers: Vec<GpuProfiler>,

    mip_gen: Option<MipGenPipelines>,
    graphics_analysis: Option<IDXGraphicsAnalysis>,
    is_capturing: bool,
}

// IDXGraphicsAnalysis is a free-threaded debug interface; everything else is
// plain data or already Send.
unsafe impl Send for CommandContext {}

impl CommandContext {
    pub(crate) fn inner_new(
        device: Device,
        root_signatures: &RootSignatureCache,
        resource_offline_heap: &OfflineDescriptorHeap,
        sampler_offline_heap: &OfflineDescriptorHeap,
        mip_gen_shaders: Option<MipGenShaders>,
    ) -> RhiResult<Self> {
        let queue = device
            .raw
            .create_command_queue(&dx::CommandQueueDesc::direct())
            .map_err(|e| RhiError::creation("command queue", e))?;

        let batches = (0..NUM_COMMAND_BATCHES)
            .map(|_| CommandBatch::inner_new(device.clone()))
            .collect::<RhiResult<Vec<_>>>()?;

        let list = device
            .raw
            .create_command_list(0, dx::CommandListType::Direct, &batches[0].allocator, dx::PSO_NONE)
            .map_err(|e| RhiError::creation("command list", e))?;
        list.close()
            .map_err(|e| RhiError::creation("command list close", e))?;

        let fence = Fence::inner_new(&device)?;

        let descriptor_cache =
            DescriptorCache::inner_new(device.clone(), resource_offline_heap, sampler_offline_heap)?;

        let mip_gen = match mip_gen_shaders {
            Some(shaders) => Some(MipGenPipelines {
                texture_2d: ComputePipelineState::inner_new(
                    &device,
                    root_signatures,
                    &shaders.texture_2d,
                )?,
                texture_cube: ComputePipelineState::inner_new(
                    &device,
                    root_signatures,
                    &shaders.texture_cube,
                )?,
            }),
            None => None,
        };

        let graphics_analysis = unsafe { DXGIGetDebugInterface1(0) }.ok();

        info!(target: "rhi::context", batches = NUM_COMMAND_BATCHES, "created command context");

        Ok(Self {
            device,
            queue,
            list,
            fence,
            fence_value: 0,
            batches,
            next_batch: 0,
            current_batch: 0,
            is_recording: false,
            descriptor_cache,
            constants_cache: ShaderConstantsCache::default(),
            barriers: BarrierBatcher::default(),
            current_graphics_pipeline: None,
            current_graphics_root_signature: None,
            current_compute_pipeline: None,
            current_compute_root_signature: None,
            current_ray_tracing_pipeline: None,
            current_shader_binding_table: None,
            current_topology: PrimitiveTopology::Undefined,
            pending_profilers: Vec::new(),
            mip_gen,
            graphics_analysis,
            is_capturing: false,
        })
    }

    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    pub(crate) fn queue(&self) -> &dx::CommandQueue {
        &self.queue
    }

    /*
     * Lifecycle
     */

    /// Picks the next batch round-robin, waiting for its fence if the ring
    /// has wrapped faster than the GPU retires work. This bounds CPU/GPU
    /// divergence to `NUM_COMMAND_BATCHES - 1` frames.
    pub fn begin(&mut self) -> RhiResult<()> {
        debug_assert!(!self.is_recording, "begin while already recording");

        let index = self.next_batch;
        self.next_batch = (self.next_batch + 1) % self.batches.len();

        if self.fence_value >= self.batches.len() as u64 {
            let wait_value = self.fence_value - (self.batches.len() as u64 - 1);
            self.fence.wait_for_value(wait_value)?;
        }

        self.batches[index].reset()?;
        self.clear_state();

        self.list
            .reset(&self.batches[index].allocator, dx::PSO_NONE)
            .map_err(|e| self.device.classify_failure("reset", e))?;

        self.current_batch = index;
        self.is_recording = true;
        Ok(())
    }

    /// Flushes remaining barriers, resolves queued profiler queries, closes
    /// and submits the list, and signals the next fence value.
    pub fn end(&mut self) -> RhiResult<u64> {
        debug_assert!(self.is_recording, "end without begin");

        self.barriers.flush(&self.list);

        for profiler in self.pending_profilers.drain(..) {
            profiler.resolve(&self.list);
        }

        self.list
            .close()
            .map_err(|e| self.device.classify_failure("close", e))?;

        self.queue.execute_command_lists(&[Some(self.list.clone())]);

        self.fence_value = self.fence.inc_value();
        self.queue
            .signal(&self.fence.raw, self.fence_value)
            .map_err(|e| self.device.classify_failure("signal", e))?;

        self.batches[self.current_batch].fence_value = self.fence_value;
        self.is_recording = false;

        self.current_graphics_pipeline = None;
        self.current_graphics_root_signature = None;
        self.current_compute_pipeline = None;
        self.current_compute_root_signature = None;

        Ok(self.fence_value)
    }

    /// Signals a fresh fence value and blocks until the GPU reaches it.
    pub fn flush(&mut self) -> RhiResult<()> {
        self.fence_value = self.fence.inc_value();
        self.queue
            .signal(&self.fence.raw, self.fence_value)
            .map_err(|e| self.device.classify_failure("signal", e))?;

        self.fence.wait_for_value(self.fence_value)
    }

    pub fn clear_state(&mut self) {
        self.descriptor_cache.reset();
        self.constants_cache.reset();

        self.current_graphics_pipeline = None;
        self.current_graphics_root_signature = None;
        self.current_compute_pipeline = None;
        self.current_compute_root_signature = None;
        self.current_ray_tracing_pipeline = None;
        self.current_shader_binding_table = None;
        self.current_topology = PrimitiveTopology::Undefined;
    }

    /*
     * Fixed-function state
     */

    pub fn set_viewport(&self, width: f32, height: f32, x: f32, y: f32) {
        self.list
            .rs_set_viewports(&[dx::Viewport::from_position_and_size((x, y), (width, height))]);
    }

    pub fn set_scissor_rect(&self, width: i32, height: i32, x: i32, y: i32) {
        self.list.rs_set_scissor_rects(&[dx::Rect::default()
            .with_left(x)
            .with_top(y)
            .with_size((width, height))]);
    }

    pub fn set_blend_factor(&self, color: [f32; 4]) {
        self.list.om_set_blend_factor(Some(color));
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        if self.current_topology != topology {
            self.list.ia_set_primitive_topology(topology.as_raw());
            self.current_topology = topology;
        }
    }

    /*
     * Clears
     */

    pub fn clear_render_target_view(&mut self, view: &RenderTargetView, color: [f32; 4]) {
        self.barriers.flush(&self.list);
        self.list
            .clear_render_target_view(view.offline_handle(), color, &[]);
        self.batches[self.current_batch].add_in_use_resource(view.resource());
    }

    pub fn clear_depth_stencil_view(&mut self, view: &DepthStencilView, depth: f32, stencil: u8) {
        self.barriers.flush(&self.list);
        self.list.clear_depth_stencil_view(
            view.offline_handle(),
            dx::ClearFlags::Depth | dx::ClearFlags::Stencil,
            depth,
            stencil,
            &[],
        );
        self.batches[self.current_batch].add_in_use_resource(view.resource());
    }

    /// Clearing a UAV needs the descriptor in a bound shader-visible heap,
    /// so one online slot is burned for the copy.
    pub fn clear_unordered_access_view_float(
        &mut self,
        view: &UnorderedAccessView,
        color: [f32; 4],
    ) -> RhiResult<()> {
        self.barriers.flush(&self.list);

        let batch = &mut self.batches[self.current_batch];
        let heap = &mut batch.online_resource_heap;
        let index = heap.allocate_handles(1)?;

        self.device.raw.copy_descriptors_simple(
            1,
            heap.cpu_at(index),
            view.offline_handle(),
            dx::DescriptorHeapType::CbvSrvUav,
        );

        self.list.set_descriptor_heaps(&[Some(heap.heap().clone())]);
        self.descriptor_cache.invalidate_bound_heaps();

        self.list.clear_unordered_access_view_f32(
            heap.gpu_at(index),
            view.offline_handle(),
            view.resource().raw(),
            color,
            &[],
        );

        batch.add_in_use_resource(view.resource());
        Ok(())
    }

    /*
     * Geometry and render targets
     */

    pub fn set_vertex_buffers(&mut self, buffers: &[&Buffer], start_slot: u32) {
        for (i, buffer) in buffers.iter().enumerate() {
            self.descriptor_cache
                .vertex_buffers
                .set_vertex_buffer(buffer.vertex_buffer_view(), start_slot + i as u32);
            self.batches[self.current_batch].add_in_use_resource(buffer.resource());
        }
    }

    pub fn set_index_buffer(&mut self, buffer: Option<&Buffer>) {
        self.descriptor_cache
            .vertex_buffers
            .set_index_buffer(buffer.map(|b| b.index_buffer_view()));

        if let Some(buffer) = buffer {
            self.batches[self.current_batch].add_in_use_resource(buffer.resource());
        }
    }

    pub fn set_render_targets(
        &mut self,
        render_targets: &[&RenderTargetView],
        depth_stencil: Option<&DepthStencilView>,
    ) {
        self.descriptor_cache.render_targets.clear_targets();

        for (i, view) in render_targets.iter().enumerate() {
            self.descriptor_cache
                .render_targets
                .set_render_target(Some(view.offline_handle()), i as u32);
            self.batches[self.current_batch].add_in_use_resource(view.resource());
        }

        self.descriptor_cache
            .render_targets
            .set_depth_stencil(depth_stencil.map(|view| view.offline_handle()));
        if let Some(view) = depth_stencil {
            self.batches[self.current_batch].add_in_use_resource(view.resource());
        }
    }

    /*
     * Pipelines
     */

    pub fn set_graphics_pipeline_state(&mut self, pipeline: &GraphicsPipelineState) {
        let changed = self
            .current_graphics_pipeline
            .as_ref()
            .map_or(true, |current| current.raw() != pipeline.raw());
        if changed {
            self.list.set_pipeline_state(pipeline.raw());
            self.current_graphics_pipeline = Some(pipeline.clone());
        }

        let signature_changed = self
            .current_graphics_root_signature
            .as_ref()
            .map_or(true, |current| current.raw() != pipeline.root_signature().raw());
        if signature_changed {
            self.list
                .set_graphics_root_signature(Some(pipeline.root_signature().raw()));
            self.current_graphics_root_signature = Some(pipeline.root_signature().clone());
        }
    }

    pub fn set_compute_pipeline_state(&mut self, pipeline: &ComputePipelineState) {
        let changed = self
            .current_compute_pipeline
            .as_ref()
            .map_or(true, |current| current.raw() != pipeline.raw());
        if changed {
            self.list.set_pipeline_state(pipeline.raw());
            self.current_compute_pipeline = Some(pipeline.clone());
        }

        let signature_changed = self
            .current_compute_root_signature
            .as_ref()
            .map_or(true, |current| current.raw() != pipeline.root_signature().raw());
        if signature_changed {
            self.list
                .set_compute_root_signature(Some(pipeline.root_signature().raw()));
            self.current_compute_root_signature = Some(pipeline.root_signature().clone());
        }
    }

    /*
     * Resource binding
     */

    pub fn set_32bit_shader_constants(&mut self, constants: &[u32]) {
        self.constants_cache.set(constants);
    }

    pub fn set_constant_buffer(
        &mut self,
        view: Option<&ConstantBufferView>,
        visibility: ShaderVisibility,
        register: u32,
    ) {
        self.descriptor_cache.set_constant_buffer_view(
            view.map(|v| v.offline_handle()),
            visibility,
            register,
        );
        if let Some(view) = view {
            self.batches[self.current_batch].add_in_use_resource(view.resource());
        }
    }

    pub fn set_constant_buffers(
        &mut self,
        views: &[&ConstantBufferView],
        visibility: ShaderVisibility,
        start_register: u32,
    ) {
        for (i, view) in views.iter().enumerate() {
            self.set_constant_buffer(Some(view), visibility, start_register + i as u32);
        }
    }

    pub fn set_shader_resource_view(
        &mut self,
        view: Option<&ShaderResourceView>,
        visibility: ShaderVisibility,
        register: u32,
    ) {
        self.descriptor_cache.set_shader_resource_view(
            view.map(|v| v.offline_handle()),
            visibility,
            register,
        );
        if let Some(view) = view {
            self.batches[self.current_batch].add_in_use_resource(view.resource());
        }
    }

    pub fn set_shader_resource_views(
        &mut self,
        views: &[&ShaderResourceView],
        visibility: ShaderVisibility,
        start_register: u32,
    ) {
        for (i, view) in views.iter().enumerate() {
            self.set_shader_resource_view(Some(view), visibility, start_register + i as u32);
        }
    }

    pub fn set_unordered_access_view(
        &mut self,
        view: Option<&UnorderedAccessView>,
        visibility: ShaderVisibility,
        register: u32,
    ) {
        self.descriptor_cache.set_unordered_access_view(
            view.map(|v| v.offline_handle()),
            visibility,
            register,
        );
        if let Some(view) = view {
            self.batches[self.current_batch].add_in_use_resource(view.resource());
        }
    }

    pub fn set_unordered_access_views(
        &mut self,
        views: &[&UnorderedAccessView],
        visibility: ShaderVisibility,
        start_register: u32,
    ) {
        for (i, view) in views.iter().enumerate() {
            self.set_unordered_access_view(Some(view), visibility, start_register + i as u32);
        }
    }

    pub fn set_sampler_state(
        &mut self,
        sampler: Option<&SamplerState>,
        visibility: ShaderVisibility,
        register: u32,
    ) {
        self.descriptor_cache.set_sampler_state(
            sampler.map(|s| s.offline_handle()),
            visibility,
            register,
        );
    }

    pub fn set_sampler_states(
        &mut self,
        samplers: &[&SamplerState],
        visibility: ShaderVisibility,
        start_register: u32,
    ) {
        for (i, sampler) in samplers.iter().enumerate() {
            self.set_sampler_state(Some(sampler), visibility, start_register + i as u32);
        }
    }

    /*
     * Barriers
     */

    pub fn transition_buffer(
        &mut self,
        buffer: &Buffer,
        before: ResourceStates,
        after: ResourceStates,
    ) {
        self.transition_resource(buffer.resource(), before, after);
    }

    pub fn transition_texture(
        &mut self,
        texture: &Texture,
        before: ResourceStates,
        after: ResourceStates,
    ) {
        self.transition_resource(texture.resource(), before, after);
    }

    pub(crate) fn transition_resource(
        &mut self,
        resource: &Resource,
        before: ResourceStates,
        after: ResourceStates,
    ) {
        let tracked = resource.swap_state(after);
        if tracked != before {
            warn!(
                target: "rhi::barriers",
                ?tracked,
                ?before,
                "tracked resource state does not match transition source"
            );
        }

        self.barriers.add_transition(resource.raw(), before, after);
        self.batches[self.current_batch].add_in_use_resource(resource);
    }

    pub fn unordered_access_buffer_barrier(&mut self, buffer: &Buffer) {
        self.barriers.add_unordered_access(buffer.raw());
        self.batches[self.current_batch].add_in_use_resource(buffer.resource());
    }

    pub fn unordered_access_texture_barrier(&mut self, texture: &Texture) {
        self.barriers.add_unordered_access(texture.raw());
        self.batches[self.current_batch].add_in_use_resource(texture.resource());
    }

    pub(crate) fn flush_resource_barriers(&mut self) {
        self.barriers.flush(&self.list);
    }

    /// Parks `resource` on the current batch so it outlives the GPU work
    /// already recorded against it, then lets the caller drop its handle.
    pub fn discard_resource(&mut self, resource: &Resource) {
        self.batches[self.current_batch].add_in_use_resource(resource);
    }

    /*
     * Draw / dispatch
     */

    fn prepare_graphics(&mut self) -> RhiResult<()> {
        self.barriers.flush(&self.list);

        let signature = self
            .current_graphics_root_signature
            .as_ref()
            .ok_or(RhiError::InvalidParameter("no graphics pipeline bound"))?;

        let batch = &mut self.batches[self.current_batch];
        self.descriptor_cache.commit_graphics(
            &self.list,
            &mut batch.online_resource_heap,
            &mut batch.online_sampler_heap,
            signature,
        )?;
        self.constants_cache.commit_graphics(&self.list, signature);

        Ok(())
    }

    fn prepare_compute(&mut self) -> RhiResult<()> {
        self.barriers.flush(&self.list);

        let signature = self
            .current_compute_root_signature
            .as_ref()
            .ok_or(RhiError::InvalidParameter("no compute pipeline bound"))?;

        let batch = &mut self.batches[self.current_batch];
        self.descriptor_cache.commit_compute(
            &self.list,
            &mut batch.online_resource_heap,
            &mut batch.online_sampler_heap,
            signature,
        )?;
        self.constants_cache.commit_compute(&self.list, signature);

        Ok(())
    }

    pub fn draw(&mut self, vertex_count: u32, start_vertex: u32) -> RhiResult<()> {
        self.prepare_graphics()?;
        self.list.draw_instanced(vertex_count, 1, start_vertex, 0);
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        start_index: u32,
        base_vertex: i32,
    ) -> RhiResult<()> {
        self.prepare_graphics()?;
        self.list
            .draw_indexed_instanced(index_count, 1, start_index, base_vertex, 0);
        Ok(())
    }

    pub fn draw_instanced(
        &mut self,
        vertex_count_per_instance: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) -> RhiResult<()> {
        self.prepare_graphics()?;
        self.list.draw_instanced(
            vertex_count_per_instance,
            instance_count,
            start_vertex,
            start_instance,
        );
        Ok(())
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count_per_instance: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) -> RhiResult<()> {
        self.prepare_graphics()?;
        self.list.draw_indexed_instanced(
            index_count_per_instance,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        );
        Ok(())
    }

    pub fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) -> RhiResult<()> {
        self.prepare_compute()?;
        self.list.dispatch(groups_x, groups_y, groups_z);
        Ok(())
    }

    /*
     * Updates and copies
     */

    /// Streams `data` through the batch's upload allocator into `buffer`.
    /// The destination must be in the copy-dest state.
    pub fn update_buffer(&mut self, buffer: &Buffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        self.barriers.flush(&self.list);

        let batch = &mut self.batches[self.current_batch];
        let allocation = batch.uploader.write(data, BUFFER_UPLOAD_ALIGNMENT)?;

        self.list.copy_buffer_region(
            buffer.raw(),
            offset,
            &allocation.resource,
            allocation.offset,
            data.len() as u64,
        );

        batch.add_in_use_resource(buffer.resource());
        batch.add_in_use_native(&allocation.resource);
        Ok(())
    }

    /// Row-pitch-aligned upload of one mip of a 2D texture.
    pub fn update_texture_2d(
        &mut self,
        texture: &Texture,
        width: u32,
        height: u32,
        mip_level: u32,
        data: &[u8],
    ) -> RhiResult<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }

        self.barriers.flush(&self.list);

        let stride = format_stride(texture.format());
        let row_size = width * stride;
        let row_pitch = align_up(row_size as u64, TEXTURE_DATA_PITCH_ALIGNMENT as u64) as u32;

        if data.len() < (height * row_size) as usize {
            return Err(RhiError::InvalidParameter("texture data too small"));
        }

        let batch = &mut self.batches[self.current_batch];
        let mut allocation = batch.uploader.allocate(
            (height * row_pitch) as u64,
            TEXTURE_DATA_PITCH_ALIGNMENT as u64,
        )?;

        let dst = allocation.as_mut_slice();
        for y in 0..height as usize {
            let row = &data[y * row_size as usize..][..row_size as usize];
            dst[y * row_pitch as usize..][..row_size as usize].copy_from_slice(row);
        }

        let footprint = dx::PlacedSubresourceFootprint::new(
            allocation.offset,
            dx::SubresourceFootprint::default()
                .with_format(texture.format())
                .with_width(width)
                .with_height(height)
                .with_depth(1)
                .with_row_pitch(row_pitch),
        );

        let source = dx::TextureCopyLocation::placed_footprint(&allocation.resource, footprint);
        let destination = dx::TextureCopyLocation::subresource(texture.raw(), mip_level);

        self.list
            .copy_texture_region(&destination, 0, 0, 0, &source, None);

        batch.add_in_use_resource(texture.resource());
        batch.add_in_use_native(&allocation.resource);
        Ok(())
    }

    pub fn copy_buffer(&mut self, destination: &Buffer, source: &Buffer, info: CopyBufferInfo) {
        self.barriers.flush(&self.list);

        self.list.copy_buffer_region(
            destination.raw(),
            info.destination_offset,
            source.raw(),
            info.source_offset,
            info.size_in_bytes,
        );

        let batch = &mut self.batches[self.current_batch];
        batch.add_in_use_resource(destination.resource());
        batch.add_in_use_resource(source.resource());
    }

    pub fn copy_texture(&mut self, destination: &Texture, source: &Texture) {
        self.barriers.flush(&self.list);
        self.list.copy_resource(destination.raw(), source.raw());

        let batch = &mut self.batches[self.current_batch];
        batch.add_in_use_resource(destination.resource());
        batch.add_in_use_resource(source.resource());
    }

    pub fn copy_texture_region(
        &mut self,
        destination: &Texture,
        source: &Texture,
        info: CopyTextureInfo,
    ) {
        let source_location =
            dx::TextureCopyLocation::subresource(source.raw(), info.source_subresource);
        let destination_location =
            dx::TextureCopyLocation::subresource(destination.raw(), info.destination_subresource);

        let (x, y, z) = info.source_origin;
        let (w, h, d) = info.extent;
        let source_box = dx::DxBox::default()
            .with_left(x)
            .with_right(x + w)
            .with_top(y)
            .with_bottom(y + h)
            .with_front(z)
            .with_back(z + d);

        self.barriers.flush(&self.list);

        let (dst_x, dst_y, dst_z) = info.destination_origin;
        self.list.copy_texture_region(
            &destination_location,
            dst_x,
            dst_y,
            dst_z,
            &source_location,
            Some(&source_box),
        );

        let batch = &mut self.batches[self.current_batch];
        batch.add_in_use_resource(destination.resource());
        batch.add_in_use_resource(source.resource());
    }

    /// Resolves a multisampled texture into its non-multisampled twin. The
    /// formats must match; typeless pairs are not handled here.
    pub fn resolve_texture(&mut self, destination: &Texture, source: &Texture) -> RhiResult<()> {
        if destination.format() != source.format() {
            return Err(RhiError::InvalidParameter(
                "resolve requires matching formats",
            ));
        }

        self.barriers.flush(&self.list);
        self.list
            .resolve_subresource(destination.raw(), 0, source.raw(), 0, destination.format());

        let batch = &mut self.batches[self.current_batch];
        batch.add_in_use_resource(destination.resource());
        batch.add_in_use_resource(source.resource());
        Ok(())
    }

    /*
     * Mip generation
     */

    /// Regenerates the full mip chain of `texture` with the internal compute
    /// pipelines. The texture is expected in the copy-dest state and is left
    /// there. The canonical barrier cadence: transition, copy to staging,
    /// dispatch a batch of four mips, UAV barrier, copy back, repeat.
    pub fn generate_mips(&mut self, texture: &Texture) -> RhiResult<()> {
        let mip_levels = texture.mip_levels() as u32;
        if mip_levels <= 1 {
            return Err(RhiError::InvalidParameter(
                "texture has no mip chain to generate",
            ));
        }

        let pipeline = match &self.mip_gen {
            Some(pipelines) if texture.is_cube() => pipelines.texture_cube.clone(),
            Some(pipelines) => pipelines.texture_2d.clone(),
            None => return Err(RhiError::Unsupported("mip generation shaders not provided")),
        };

        // Same-format staging copy with UAV access; the source may not allow
        // unordered access itself.
        let staging_desc = texture
            .desc()
            .as_raw()
            .with_flags(texture.desc().resource_flags() | dx::ResourceFlags::AllowUnorderedAccess);
        let staging = Resource::create_committed(
            &self.device,
            "mip-gen staging texture",
            super::types::HeapKind::Default,
            &staging_desc,
            ResourceStates::Common,
            None,
            0,
            false,
        )?;

        // One SRV over every mip plus one UAV per mip. Each dispatch binds a
        // fixed-size window of four UAVs starting at its first written mip,
        // so the UAV list is padded with null views up to the last window.
        let num_dispatches = div_round_up(mip_levels - 1, MIP_LEVELS_PER_DISPATCH);
        let uav_count = align_up(mip_levels as u64, MIP_LEVELS_PER_DISPATCH as u64) as u32
            + MIP_LEVELS_PER_DISPATCH;

        let batch = &mut self.batches[self.current_batch];
        let heap = &mut batch.online_resource_heap;
        let start = heap.allocate_handles(uav_count + 1)?;

        let srv_desc = if texture.is_cube() {
            dx::ShaderResourceViewDesc::texture_cube(texture.format(), 0, mip_levels, 0.0)
        } else {
            dx::ShaderResourceViewDesc::texture_2d(texture.format(), 0, mip_levels, 0.0, 0)
        };
        self.device.raw.create_shader_resource_view(
            Some(texture.raw()),
            Some(&srv_desc),
            heap.cpu_at(start),
        );

        for mip in 0..uav_count {
            let uav_desc = if texture.is_cube() {
                dx::UnorderedAccessViewDesc::texture_2d_array(
                    texture.format(),
                    mip.min(mip_levels - 1),
                    0,
                    0..6,
                )
            } else {
                dx::UnorderedAccessViewDesc::texture_2d(texture.format(), mip.min(mip_levels - 1), 0)
            };

            let resource = if mip < mip_levels {
                Some(staging.raw())
            } else {
                None
            };
            self.device.raw.create_unordered_access_view(
                resource,
                None::<&dx::Resource>,
                Some(&uav_desc),
                heap.cpu_at(start + 1 + mip),
            );
        }

        debug_assert_eq!(texture.state(), ResourceStates::CopyDst);

        // Seed the staging texture with the source contents.
        self.barriers.add_transition(
            texture.raw(),
            ResourceStates::CopyDst,
            ResourceStates::CopySrc,
        );
        self.barriers.add_transition(
            staging.raw(),
            ResourceStates::Common,
            ResourceStates::CopyDst,
        );
        self.barriers.flush(&self.list);

        self.list.copy_resource(staging.raw(), texture.raw());

        self.barriers.add_transition(
            texture.raw(),
            ResourceStates::CopySrc,
            ResourceStates::NonPixelShaderResource,
        );
        self.barriers.add_transition(
            staging.raw(),
            ResourceStates::CopyDst,
            ResourceStates::UnorderedAccess,
        );
        self.barriers.flush(&self.list);

        self.list.set_pipeline_state(pipeline.raw());
        self.list
            .set_compute_root_signature(Some(pipeline.root_signature().raw()));
        self.current_compute_pipeline = None;
        self.current_compute_root_signature = None;

        let batch = &mut self.batches[self.current_batch];
        self.list
            .set_descriptor_heaps(&[Some(batch.online_resource_heap.heap().clone())]);
        self.descriptor_cache.invalidate_bound_heaps();

        let signature = pipeline.root_signature();
        if let Some(index) = signature.table_index(ShaderVisibility::All, ResourceBindingKind::Srv)
        {
            self.list
                .set_compute_root_descriptor_table(index, batch.online_resource_heap.gpu_at(start));
        }
        let uav_table_index =
            signature.table_index(ShaderVisibility::All, ResourceBindingKind::Uav);
        let constants_index = signature.constants_index();

        let threads_z = if texture.is_cube() { 6 } else { 1 };

        for dispatch in 0..num_dispatches {
            let src_mip = dispatch * MIP_LEVELS_PER_DISPATCH;
            let mips_this_dispatch = (mip_levels - 1 - src_mip).min(MIP_LEVELS_PER_DISPATCH);

            let (dst_width, dst_height) = texture.mip_size((src_mip + 1) as u16);
            let texel_size = Vec2::new(1.0 / dst_width as f32, 1.0 / dst_height as f32);

            if let Some(index) = constants_index {
                let constants = [
                    src_mip,
                    mips_this_dispatch,
                    texel_size.x.to_bits(),
                    texel_size.y.to_bits(),
                ];
                self.list.set_compute_root_32bit_constants(index, &constants, 0);
            }

            if let Some(index) = uav_table_index {
                let batch = &self.batches[self.current_batch];
                // The window starts at the first mip this dispatch writes.
                self.list.set_compute_root_descriptor_table(
                    index,
                    batch.online_resource_heap.gpu_at(start + 1 + src_mip + 1),
                );
            }

            self.list.dispatch(
                div_round_up(dst_width, MIP_GEN_THREAD_GROUP_SIZE),
                div_round_up(dst_height, MIP_GEN_THREAD_GROUP_SIZE),
                threads_z,
            );

            self.barriers.add_unordered_access(staging.raw());

            // Fold the freshly written mips back into the source.
            self.barriers.add_transition(
                texture.raw(),
                ResourceStates::NonPixelShaderResource,
                ResourceStates::CopyDst,
            );
            self.barriers.add_transition(
                staging.raw(),
                ResourceStates::UnorderedAccess,
                ResourceStates::CopySrc,
            );
            self.barriers.flush(&self.list);

            self.list.copy_resource(texture.raw(), staging.raw());

            self.barriers.add_transition(
                texture.raw(),
                ResourceStates::CopyDst,
                ResourceStates::NonPixelShaderResource,
            );
            self.barriers.add_transition(
                staging.raw(),
                ResourceStates::CopySrc,
                ResourceStates::UnorderedAccess,
            );
            self.barriers.flush(&self.list);
        }

        self.barriers.add_transition(
            texture.raw(),
            ResourceStates::NonPixelShaderResource,
            ResourceStates::CopyDst,
        );
        self.barriers.flush(&self.list);

        let batch = &mut self.batches[self.current_batch];
        batch.add_in_use_resource(texture.resource());
        batch.add_in_use_resource(&staging);

        debug!(target: "rhi::context", mips = mip_levels, "generated mip chain");
        Ok(())
    }

    /*
     * Ray tracing
     */

    pub fn build_ray_tracing_geometry(&mut self, geometry: &RayTracingGeometry) -> RhiResult<()> {
        let list = list4(&self.list)?;

        self.barriers.flush(&self.list);
        geometry.build(&list);
        self.barriers
            .add_unordered_access(geometry.result_buffer().raw());

        let batch = &mut self.batches[self.current_batch];
        batch.add_in_use_resource(geometry.result_buffer().resource());
        batch.add_in_use_resource(geometry.scratch_buffer().resource());
        Ok(())
    }

    pub fn build_ray_tracing_scene(&mut self, scene: &RayTracingScene) -> RhiResult<()> {
        let list = list4(&self.list)?;

        self.barriers.flush(&self.list);
        scene.build(&list);
        self.barriers
            .add_unordered_access(scene.result_buffer().raw());

        let batch = &mut self.batches[self.current_batch];
        batch.add_in_use_resource(scene.result_buffer().resource());
        batch.add_in_use_resource(scene.scratch_buffer().resource());
        Ok(())
    }

    /// Assembles the shader binding table for `pipeline` and binds the scene
    /// for the following `dispatch_rays` calls. Hit-group records may carry
    /// one local descriptor-table handle each.
    pub fn set_ray_tracing_bindings(
        &mut self,
        scene: &RayTracingScene,
        pipeline: &RayTracingPipelineState,
        hit_group_tables: &[Option<dx::GpuDescriptorHandle>],
    ) -> RhiResult<()> {
        let table = ShaderBindingTable::build(&self.device, pipeline, hit_group_tables)?;

        self.list
            .set_compute_root_signature(Some(pipeline.root_signature().raw()));
        self.current_compute_root_signature = Some(pipeline.root_signature().clone());
        self.current_compute_pipeline = None;

        let batch = &mut self.batches[self.current_batch];
        batch.add_in_use_resource(scene.result_buffer().resource());
        batch.add_in_use_resource(table.buffer().resource());

        self.descriptor_cache.set_shader_resource_view(
            Some(scene.view().offline_handle()),
            ShaderVisibility::All,
            0,
        );

        self.current_ray_tracing_pipeline = Some(pipeline.clone());
        self.current_shader_binding_table = Some(table);
        Ok(())
    }

    pub fn dispatch_rays(&mut self, width: u32, height: u32, depth: u32) -> RhiResult<()> {
        let list = list4(&self.list)?;

        let pipeline = self
            .current_ray_tracing_pipeline
            .clone()
            .ok_or(RhiError::InvalidParameter("no ray tracing bindings set"))?;

        self.barriers.flush(&self.list);

        let batch = &mut self.batches[self.current_batch];
        self.descriptor_cache.commit_compute(
            &self.list,
            &mut batch.online_resource_heap,
            &mut batch.online_sampler_heap,
            pipeline.root_signature(),
        )?;

        let table = self
            .current_shader_binding_table
            .as_ref()
            .ok_or(RhiError::InvalidParameter("no shader binding table built"))?;

        unsafe {
            list.SetPipelineState1(pipeline.state_object());
            list.DispatchRays(&table.dispatch_desc(width, height, depth));
        }

        Ok(())
    }

    /*
     * Profiling, markers, capture
     */

    pub fn begin_timestamp(&mut self, profiler: &GpuProfiler, index: u32) {
        profiler.write_timestamp(&self.list, index * 2);
    }

    pub fn end_timestamp(&mut self, profiler: &GpuProfiler, index: u32) {
        profiler.write_timestamp(&self.list, index * 2 + 1);
        self.pending_profilers.push(profiler.clone());
    }

    pub fn insert_marker(&self, message: &str) {
        if let Ok(label) = CString::new(message) {
            self.list.set_marker(0u64, label.as_c_str());
        }
    }

    pub fn begin_external_capture(&mut self) {
        match &self.graphics_analysis {
            Some(analysis) if !self.is_capturing => {
                unsafe { analysis.BeginCapture() };
                self.is_capturing = true;
            }
            Some(_) => {}
            None => warn!(target: "rhi::context", "graphics analysis interface not attached"),
        }
    }

    pub fn end_external_capture(&mut self) {
        if self.is_capturing {
            if let Some(analysis) = &self.graphics_analysis {
                unsafe { analysis.EndCapture() };
            }
            self.is_capturing = false;
        }
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            warn!(target: "rhi::context", %error, "final flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_strides_cover_common_formats() {
        assert_eq!(format_stride(dx::Format::Rgba8Unorm), 4);
        assert_eq!(format_stride(dx::Format::Rgba16Float), 8);
        assert_eq!(format_stride(dx::Format::Rgba32Float), 16);
        assert_eq!(format_stride(dx::Format::R16Float), 2);
    }

    #[test]
    fn ring_wait_value_lags_by_ring_size_minus_one() {
        // Mirrors the wait computed in `begin`: batch N+RING cannot start
        // recording until batch N's fence value has been reached.
        let ring = NUM_COMMAND_BATCHES as u64;

        let wait_value = |fence_value: u64| {
            if fence_value >= ring {
                Some(fence_value - (ring - 1))
            } else {
                None
            }
        };

        assert_eq!(wait_value(0), None);
        assert_eq!(wait_value(ring - 1), None);
        assert_eq!(wait_value(ring), Some(1));
        assert_eq!(wait_value(ring + 5), Some(6));
    }

    #[test]
    fn mip_dispatch_batching_rounds_up() {
        let uav_count = |mips: u64| align_up(mips, MIP_LEVELS_PER_DISPATCH as u64);

        assert_eq!(uav_count(2), 4);
        assert_eq!(uav_count(4), 4);
        assert_eq!(uav_count(5), 8);
        assert_eq!(uav_count(10) / MIP_LEVELS_PER_DISPATCH as u64, 3);
    }
}
