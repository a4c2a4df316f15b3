use std::num::NonZeroIsize;

use oxidx::dx;
use tracing::{info, warn};
use windows::Win32::Graphics::Direct3D12::{
    D3D12GetDebugInterface, ID3D12DeviceRemovedExtendedDataSettings, D3D12_DRED_ENABLEMENT_FORCED_ON,
};

use super::{
    command_context::{CommandContext, MipGenShaders},
    descriptor_heap::OfflineDescriptorHeap,
    device::Device,
    error::{RhiError, RhiResult},
    pipeline::{
        ComputePipelineState, GraphicsPipelineState, GraphicsPipelineStateDesc, Shader, ShaderStage,
    },
    query::GpuProfiler,
    raytracing::{
        RayTracingGeometry, RayTracingGeometryInstance, RayTracingPipelineState,
        RayTracingPipelineStateDesc, RayTracingScene,
    },
    resources::{Buffer, BufferDesc, Resource, SamplerState, Texture, TextureDesc},
    root_signature::{
        RootSignatureCache, RootSignatureKind, RootSignatureRequirements, ShaderResourceCount,
    },
    swapchain::{Swapchain, SwapchainDesc},
    types::{ResourceStates, ShaderVisibility},
    views::{
        ConstantBufferView, DepthStencilView, RenderTargetView, ShaderResourceView,
        UnorderedAccessView,
    },
};

/// Root of the RHI: owns the device, the offline descriptor heaps, and the
/// root-signature cache. All resource construction funnels through here;
/// command contexts receive the shared services by reference, not through
/// globals.
pub struct RenderLayer {
    device: Device,

    resource_descriptors: OfflineDescriptorHeap,
    rtv_descriptors: OfflineDescriptorHeap,
    dsv_descriptors: OfflineDescriptorHeap,
    sampler_descriptors: OfflineDescriptorHeap,

    root_signatures: RootSignatureCache,
}

impl RenderLayer {
    pub fn init(enable_debug: bool) -> RhiResult<Self> {
        let factory_flags = if enable_debug {
            if let Ok(debug) = dx::create_debug() {
                debug.enable_debug_layer();
            }
            enable_dred();

            dx::FactoryCreationFlags::Debug
        } else {
            dx::FactoryCreationFlags::empty()
        };

        let factory =
            dx::create_factory4(factory_flags).map_err(|e| RhiError::creation("factory", e))?;

        let adapter = factory.enum_adapters(0).or_else(|_| {
            warn!(target: "rhi::layer", "no hardware adapter, falling back to WARP");
            factory.enum_warp_adapters()
        });
        let adapter = adapter.map_err(|e| RhiError::creation("adapter", e))?;

        let device = Device::new(factory, adapter)?;

        let resource_descriptors =
            OfflineDescriptorHeap::inner_new(device.clone(), dx::DescriptorHeapType::CbvSrvUav)?;
        let rtv_descriptors =
            OfflineDescriptorHeap::inner_new(device.clone(), dx::DescriptorHeapType::Rtv)?;
        let dsv_descriptors =
            OfflineDescriptorHeap::inner_new(device.clone(), dx::DescriptorHeapType::Dsv)?;
        let sampler_descriptors =
            OfflineDescriptorHeap::inner_new(device.clone(), dx::DescriptorHeapType::Sampler)?;

        let root_signatures = RootSignatureCache::inner_new(device.clone())?;

        info!(target: "rhi::layer", adapter = device.adapter_name(), "render layer initialized");

        Ok(Self {
            device,
            resource_descriptors,
            rtv_descriptors,
            dsv_descriptors,
            sampler_descriptors,
            root_signatures,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn root_signatures(&self) -> &RootSignatureCache {
        &self.root_signatures
    }

    pub fn create_command_context(
        &self,
        mip_gen_shaders: Option<MipGenShaders>,
    ) -> RhiResult<CommandContext> {
        CommandContext::inner_new(
            self.device.clone(),
            &self.root_signatures,
            &self.resource_descriptors,
            &self.sampler_descriptors,
            mip_gen_shaders,
        )
    }

    pub fn create_gpu_profiler(&self, num_timestamps: u32) -> RhiResult<GpuProfiler> {
        GpuProfiler::inner_new(&self.device, num_timestamps)
    }

    /*
     * Resources
     */

    pub fn create_buffer(&self, desc: BufferDesc) -> RhiResult<Buffer> {
        Buffer::inner_new(&self.device, desc)
    }

    /// Creates a default-heap buffer and streams `data` into it through the
    /// given context, leaving it in its usage's resting state.
    pub fn create_buffer_with_data(
        &self,
        desc: BufferDesc,
        data: &[u8],
        context: &mut CommandContext,
    ) -> RhiResult<Buffer> {
        let buffer = Buffer::inner_new(&self.device, desc)?;

        context.transition_buffer(&buffer, buffer.state(), ResourceStates::CopyDst);
        context.update_buffer(&buffer, 0, data)?;
        context.transition_buffer(&buffer, ResourceStates::CopyDst, buffer.resting_state());

        Ok(buffer)
    }

    pub fn create_texture(&self, desc: TextureDesc) -> RhiResult<Texture> {
        Texture::inner_new(&self.device, desc)
    }

    /// Creates a texture and uploads the top mip, leaving the texture in the
    /// copy-dest state (the state `generate_mips` consumes).
    pub fn create_texture_with_data(
        &self,
        desc: TextureDesc,
        data: &[u8],
        context: &mut CommandContext,
    ) -> RhiResult<Texture> {
        let texture = Texture::inner_new(&self.device, desc)?;

        context.transition_texture(&texture, ResourceStates::Common, ResourceStates::CopyDst);
        context.flush_resource_barriers();
        context.update_texture_2d(&texture, texture.width(), texture.height(), 0, data)?;

        Ok(texture)
    }

    pub fn create_sampler_state(&self, desc: &dx::SamplerDesc) -> RhiResult<SamplerState> {
        SamplerState::inner_new(&self.device, &self.sampler_descriptors, desc)
    }

    pub fn create_shader(
        &self,
        bytecode: Vec<u8>,
        stage: ShaderStage,
        resource_counts: ShaderResourceCount,
    ) -> RhiResult<Shader> {
        Shader::inner_new(bytecode, stage, resource_counts)
    }

    /*
     * Pipelines
     */

    pub fn create_graphics_pipeline_state(
        &self,
        desc: &GraphicsPipelineStateDesc,
    ) -> RhiResult<GraphicsPipelineState> {
        GraphicsPipelineState::inner_new(&self.device, &self.root_signatures, desc)
    }

    pub fn create_compute_pipeline_state(
        &self,
        shader: &Shader,
    ) -> RhiResult<ComputePipelineState> {
        ComputePipelineState::inner_new(&self.device, &self.root_signatures, shader)
    }

    pub fn create_ray_tracing_pipeline_state(
        &self,
        desc: &RayTracingPipelineStateDesc,
    ) -> RhiResult<RayTracingPipelineState> {
        if !self.device.is_ray_tracing_supported() {
            return Err(RhiError::Unsupported("ray tracing tier"));
        }

        let mut requirements = RootSignatureRequirements::new(RootSignatureKind::RayTracingGlobal);
        let mut fold = |shader: &Shader| {
            let stage = requirements.stage_mut(ShaderVisibility::All);
            let counts = shader.resource_counts();

            stage.ranges.num_cbvs = stage.ranges.num_cbvs.max(counts.ranges.num_cbvs);
            stage.ranges.num_srvs = stage.ranges.num_srvs.max(counts.ranges.num_srvs);
            stage.ranges.num_uavs = stage.ranges.num_uavs.max(counts.ranges.num_uavs);
            stage.ranges.num_samplers = stage.ranges.num_samplers.max(counts.ranges.num_samplers);
            stage.num_32bit_constants =
                stage.num_32bit_constants.max(counts.num_32bit_constants);
        };

        fold(&desc.ray_gen_shader);
        desc.miss_shaders.iter().for_each(&mut fold);
        desc.closest_hit_shaders.iter().for_each(&mut fold);

        let root_signature = self.root_signatures.get_or_create(requirements)?;
        RayTracingPipelineState::inner_new(&self.device, root_signature, desc)
    }

    /*
     * Ray-tracing resources
     */

    pub fn create_ray_tracing_geometry(
        &self,
        vertex_buffer: Buffer,
        vertex_count: u32,
        index_buffer: Option<Buffer>,
    ) -> RhiResult<RayTracingGeometry> {
        RayTracingGeometry::inner_new(&self.device, vertex_buffer, vertex_count, index_buffer)
    }

    pub fn create_ray_tracing_scene(
        &self,
        instances: Vec<RayTracingGeometryInstance>,
    ) -> RhiResult<RayTracingScene> {
        RayTracingScene::inner_new(&self.device, &self.resource_descriptors, instances)
    }

    /*
     * Views
     */

    pub fn create_constant_buffer_view(&self, buffer: &Buffer) -> RhiResult<ConstantBufferView> {
        ConstantBufferView::inner_new(&self.device, &self.resource_descriptors, buffer)
    }

    pub fn create_shader_resource_view(
        &self,
        resource: &Resource,
        desc: Option<&dx::ShaderResourceViewDesc>,
    ) -> RhiResult<ShaderResourceView> {
        ShaderResourceView::inner_new(&self.device, &self.resource_descriptors, resource, desc)
    }

    pub fn create_unordered_access_view(
        &self,
        resource: &Resource,
        desc: Option<&dx::UnorderedAccessViewDesc>,
    ) -> RhiResult<UnorderedAccessView> {
        UnorderedAccessView::inner_new(&self.device, &self.resource_descriptors, resource, desc)
    }

    pub fn create_render_target_view(
        &self,
        resource: &Resource,
        desc: Option<&dx::RenderTargetViewDesc>,
    ) -> RhiResult<RenderTargetView> {
        RenderTargetView::inner_new(&self.device, &self.rtv_descriptors, resource, desc)
    }

    pub fn create_depth_stencil_view(
        &self,
        resource: &Resource,
        desc: Option<&dx::DepthStencilViewDesc>,
    ) -> RhiResult<DepthStencilView> {
        DepthStencilView::inner_new(&self.device, &self.dsv_descriptors, resource, desc)
    }

    /*
     * Presentation
     */

    pub fn create_swapchain(
        &self,
        context: &CommandContext,
        hwnd: NonZeroIsize,
        desc: SwapchainDesc,
    ) -> RhiResult<Swapchain> {
        Swapchain::inner_new(
            self.device.clone(),
            self.rtv_descriptors.clone(),
            context,
            hwnd,
            desc,
        )
    }
}

/// Turns on device-removed extended data so removals carry breadcrumb
/// history. Debug builds only; silently unavailable on older runtimes.
fn enable_dred() {
    let mut settings: Option<ID3D12DeviceRemovedExtendedDataSettings> = None;
    if unsafe { D3D12GetDebugInterface(&mut settings) }.is_ok() {
        if let Some(settings) = settings {
            unsafe {
                settings.SetAutoBreadcrumbsEnablement(D3D12_DRED_ENABLEMENT_FORCED_ON);
                settings.SetPageFaultEnablement(D3D12_DRED_ENABLEMENT_FORCED_ON);
            }
        }
    }
}
