use std::{ops::Deref, sync::Arc};

use glam::Mat4;
use oxidx::dx;
use tracing::debug;
use windows::core::{Interface, PCWSTR};
use windows::Win32::Graphics::{
    Direct3D12::{
        ID3D12Device5, ID3D12GraphicsCommandList4, ID3D12StateObject,
        ID3D12StateObjectProperties, D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_DESC,
        D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS,
        D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS_0, D3D12_DISPATCH_RAYS_DESC,
        D3D12_DXIL_LIBRARY_DESC, D3D12_ELEMENTS_LAYOUT_ARRAY, D3D12_EXPORT_DESC,
        D3D12_GLOBAL_ROOT_SIGNATURE, D3D12_GPU_VIRTUAL_ADDRESS_AND_STRIDE,
        D3D12_GPU_VIRTUAL_ADDRESS_RANGE, D3D12_GPU_VIRTUAL_ADDRESS_RANGE_AND_STRIDE,
        D3D12_HIT_GROUP_DESC, D3D12_HIT_GROUP_TYPE_TRIANGLES,
        D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAG_NONE,
        D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAG_PREFER_FAST_TRACE,
        D3D12_RAYTRACING_ACCELERATION_STRUCTURE_PREBUILD_INFO,
        D3D12_RAYTRACING_ACCELERATION_STRUCTURE_TYPE_BOTTOM_LEVEL,
        D3D12_RAYTRACING_ACCELERATION_STRUCTURE_TYPE_TOP_LEVEL,
        D3D12_RAYTRACING_GEOMETRY_DESC, D3D12_RAYTRACING_GEOMETRY_DESC_0,
        D3D12_RAYTRACING_GEOMETRY_FLAG_OPAQUE, D3D12_RAYTRACING_GEOMETRY_TRIANGLES_DESC,
        D3D12_RAYTRACING_GEOMETRY_TYPE_TRIANGLES, D3D12_RAYTRACING_PIPELINE_CONFIG,
        D3D12_RAYTRACING_SHADER_CONFIG, D3D12_SHADER_BYTECODE,
        D3D12_SHADER_IDENTIFIER_SIZE_IN_BYTES, D3D12_STATE_OBJECT_DESC,
        D3D12_STATE_OBJECT_TYPE_RAYTRACING_PIPELINE, D3D12_STATE_SUBOBJECT,
        D3D12_STATE_SUBOBJECT_TYPE_DXIL_LIBRARY, D3D12_STATE_SUBOBJECT_TYPE_GLOBAL_ROOT_SIGNATURE,
        D3D12_STATE_SUBOBJECT_TYPE_HIT_GROUP, D3D12_STATE_SUBOBJECT_TYPE_RAYTRACING_PIPELINE_CONFIG,
        D3D12_STATE_SUBOBJECT_TYPE_RAYTRACING_SHADER_CONFIG,
    },
    Dxgi::Common::{DXGI_FORMAT_R16_UINT, DXGI_FORMAT_R32G32B32_FLOAT, DXGI_FORMAT_R32_UINT},
};

use crate::utils::align_up;

use super::{
    descriptor_heap::OfflineDescriptorHeap,
    device::Device,
    error::{RhiError, RhiResult},
    pipeline::{Shader, ShaderStage},
    resources::{Buffer, BufferDesc, BufferUsage},
    root_signature::RootSignature,
    types::HeapKind,
    views::ShaderResourceView,
};

/// DXR shader records are 32-byte aligned, tables 64-byte aligned.
pub const SHADER_RECORD_ALIGNMENT: u64 = 32;
pub const SHADER_TABLE_ALIGNMENT: u64 = 64;
const SHADER_IDENTIFIER_SIZE: u64 = D3D12_SHADER_IDENTIFIER_SIZE_IN_BYTES as u64;

pub(crate) fn device5(device: &Device) -> RhiResult<ID3D12Device5> {
    device
        .raw
        .0
        .cast()
        .map_err(|_| RhiError::Unsupported("ray tracing requires ID3D12Device5"))
}

pub(crate) fn list4(list: &dx::GraphicsCommandList) -> RhiResult<ID3D12GraphicsCommandList4> {
    list.0
        .cast()
        .map_err(|_| RhiError::Unsupported("ray tracing requires ID3D12GraphicsCommandList4"))
}

fn acceleration_buffers(
    device: &Device,
    prebuild: &D3D12_RAYTRACING_ACCELERATION_STRUCTURE_PREBUILD_INFO,
) -> RhiResult<(Buffer, Buffer)> {
    let scratch = Buffer::inner_new(
        device,
        BufferDesc::new(prebuild.ScratchDataSizeInBytes, BufferUsage::UnorderedAccess),
    )?;
    let result = Buffer::inner_new(
        device,
        BufferDesc::new(
            prebuild.ResultDataMaxSizeInBytes,
            BufferUsage::AccelerationStructure,
        ),
    )?;

    Ok((scratch, result))
}

/*
 * Bottom-level acceleration structure
 */

/// Triangle geometry baked into a bottom-level acceleration structure. The
/// source vertex/index buffers must be in a non-pixel-shader-readable state
/// when `build` records.
#[derive(Clone, Debug)]
pub struct RayTracingGeometry(Arc<RayTracingGeometryInner>);

#[derive(Debug)]
pub struct RayTracingGeometryInner {
    vertex_buffer: Buffer,
    index_buffer: Option<Buffer>,
    vertex_count: u32,
    scratch: Buffer,
    result: Buffer,
}

impl Deref for RayTracingGeometry {
    type Target = RayTracingGeometryInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

fn triangles_desc(
    vertex_buffer: &Buffer,
    vertex_count: u32,
    index_buffer: Option<&Buffer>,
) -> D3D12_RAYTRACING_GEOMETRY_DESC {
    let (index_address, index_count, index_format) = match index_buffer {
        Some(buffer) => {
            let format = match buffer.stride() {
                2 => DXGI_FORMAT_R16_UINT,
                _ => DXGI_FORMAT_R32_UINT,
            };
            let count = (buffer.size() / buffer.stride().max(1) as u64) as u32;
            (buffer.gpu_virtual_address(), count, format)
        }
        None => (0, 0, DXGI_FORMAT_R32_UINT),
    };

    D3D12_RAYTRACING_GEOMETRY_DESC {
        Type: D3D12_RAYTRACING_GEOMETRY_TYPE_TRIANGLES,
        Flags: D3D12_RAYTRACING_GEOMETRY_FLAG_OPAQUE,
        Anonymous: D3D12_RAYTRACING_GEOMETRY_DESC_0 {
            Triangles: D3D12_RAYTRACING_GEOMETRY_TRIANGLES_DESC {
                Transform3x4: 0,
                IndexFormat: index_format,
                VertexFormat: DXGI_FORMAT_R32G32B32_FLOAT,
                IndexCount: index_count,
                VertexCount: vertex_count,
                IndexBuffer: index_address,
                VertexBuffer: D3D12_GPU_VIRTUAL_ADDRESS_AND_STRIDE {
                    StartAddress: vertex_buffer.gpu_virtual_address(),
                    StrideInBytes: vertex_buffer.stride() as u64,
                },
            },
        },
    }
}

impl RayTracingGeometryInner {
    pub fn result_buffer(&self) -> &Buffer {
        &self.result
    }

    pub(crate) fn scratch_buffer(&self) -> &Buffer {
        &self.scratch
    }

    pub fn gpu_virtual_address(&self) -> u64 {
        self.result.gpu_virtual_address()
    }

    fn geometry_desc(&self) -> D3D12_RAYTRACING_GEOMETRY_DESC {
        triangles_desc(&self.vertex_buffer, self.vertex_count, self.index_buffer.as_ref())
    }
}

impl RayTracingGeometry {
    pub(crate) fn inner_new(
        device: &Device,
        vertex_buffer: Buffer,
        vertex_count: u32,
        index_buffer: Option<Buffer>,
    ) -> RhiResult<Self> {
        if !device.is_ray_tracing_supported() {
            return Err(RhiError::Unsupported("ray tracing tier"));
        }

        let geometry = triangles_desc(&vertex_buffer, vertex_count, index_buffer.as_ref());
        let inputs = D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS {
            Type: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_TYPE_BOTTOM_LEVEL,
            Flags: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAG_NONE,
            NumDescs: 1,
            DescsLayout: D3D12_ELEMENTS_LAYOUT_ARRAY,
            Anonymous: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS_0 {
                pGeometryDescs: &geometry,
            },
        };

        let mut prebuild = D3D12_RAYTRACING_ACCELERATION_STRUCTURE_PREBUILD_INFO::default();
        unsafe {
            device5(device)?.GetRaytracingAccelerationStructurePrebuildInfo(&inputs, &mut prebuild)
        };

        let (scratch, result) = acceleration_buffers(device, &prebuild)?;

        debug!(
            target: "rhi::raytracing",
            result_size = prebuild.ResultDataMaxSizeInBytes,
            scratch_size = prebuild.ScratchDataSizeInBytes,
            "created bottom-level acceleration structure buffers"
        );

        Ok(Self(Arc::new(RayTracingGeometryInner {
            vertex_buffer,
            index_buffer,
            vertex_count,
            scratch,
            result,
        })))
    }

    /// Records the BLAS build. The caller inserts the UAV barrier on the
    /// result buffer afterwards.
    pub(crate) fn build(&self, list: &ID3D12GraphicsCommandList4) {
        let geometry = self.geometry_desc();

        let desc = D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_DESC {
            DestAccelerationStructureData: self.result.gpu_virtual_address(),
            Inputs: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS {
                Type: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_TYPE_BOTTOM_LEVEL,
                Flags: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAG_PREFER_FAST_TRACE,
                NumDescs: 1,
                DescsLayout: D3D12_ELEMENTS_LAYOUT_ARRAY,
                Anonymous: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS_0 {
                    pGeometryDescs: &geometry,
                },
            },
            SourceAccelerationStructureData: 0,
            ScratchAccelerationStructureData: self.scratch.gpu_virtual_address(),
        };

        unsafe { list.BuildRaytracingAccelerationStructure(&desc, None) };
    }
}

/*
 * Top-level acceleration structure
 */

/// One instance of a bottom-level structure in the scene.
#[derive(Clone, Debug)]
pub struct RayTracingGeometryInstance {
    pub geometry: RayTracingGeometry,
    pub transform: Mat4,
    pub instance_id: u32,
    pub hit_group_index: u32,
    pub mask: u8,
}

/// The memory layout DXR expects for instance descriptors; written straight
/// into the instance upload buffer.
#[repr(C)]
struct RawInstanceDesc {
    transform: [f32; 12],
    id_and_mask: u32,
    contribution_and_flags: u32,
    acceleration_structure: u64,
}

impl RawInstanceDesc {
    fn new(instance: &RayTracingGeometryInstance) -> Self {
        // Row-major 3x4: glam stores column-major.
        let m = instance.transform.transpose().to_cols_array();
        let transform: [f32; 12] = m[..12].try_into().unwrap();

        Self {
            transform,
            id_and_mask: (instance.instance_id & 0x00ff_ffff) | ((instance.mask as u32) << 24),
            contribution_and_flags: instance.hit_group_index & 0x00ff_ffff,
            acceleration_structure: instance.geometry.gpu_virtual_address(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RayTracingScene(Arc<RayTracingSceneInner>);

#[derive(Debug)]
pub struct RayTracingSceneInner {
    instance_buffer: Buffer,
    instances: Vec<RayTracingGeometryInstance>,
    scratch: Buffer,
    result: Buffer,
    view: ShaderResourceView,
}

impl Deref for RayTracingScene {
    type Target = RayTracingSceneInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl RayTracingSceneInner {
    pub fn result_buffer(&self) -> &Buffer {
        &self.result
    }

    pub(crate) fn scratch_buffer(&self) -> &Buffer {
        &self.scratch
    }

    pub fn view(&self) -> &ShaderResourceView {
        &self.view
    }

    pub fn instances(&self) -> &[RayTracingGeometryInstance] {
        &self.instances
    }
}

impl RayTracingScene {
    pub(crate) fn inner_new(
        device: &Device,
        resource_heap: &OfflineDescriptorHeap,
        instances: Vec<RayTracingGeometryInstance>,
    ) -> RhiResult<Self> {
        if !device.is_ray_tracing_supported() {
            return Err(RhiError::Unsupported("ray tracing tier"));
        }
        if instances.is_empty() {
            return Err(RhiError::InvalidParameter("ray tracing scene needs instances"));
        }

        let instance_buffer = Buffer::inner_new(
            device,
            BufferDesc::new(
                (instances.len() * std::mem::size_of::<RawInstanceDesc>()) as u64,
                BufferUsage::empty(),
            )
            .with_heap_kind(HeapKind::Upload),
        )?;

        // The instance array is written once at creation and refreshed by
        // `update` before a rebuild.
        Self::write_instances(&instance_buffer, &instances)?;

        let inputs = D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS {
            Type: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_TYPE_TOP_LEVEL,
            Flags: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAG_NONE,
            NumDescs: instances.len() as u32,
            DescsLayout: D3D12_ELEMENTS_LAYOUT_ARRAY,
            Anonymous: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS_0 {
                InstanceDescs: instance_buffer.gpu_virtual_address(),
            },
        };

        let mut prebuild = D3D12_RAYTRACING_ACCELERATION_STRUCTURE_PREBUILD_INFO::default();
        unsafe {
            device5(device)?.GetRaytracingAccelerationStructurePrebuildInfo(&inputs, &mut prebuild)
        };

        let (scratch, result) = acceleration_buffers(device, &prebuild)?;

        let view = ShaderResourceView::inner_new_acceleration_structure(
            device,
            resource_heap,
            result.resource(),
        )?;

        debug!(
            target: "rhi::raytracing",
            instances = instances.len(),
            result_size = prebuild.ResultDataMaxSizeInBytes,
            "created top-level acceleration structure buffers"
        );

        Ok(Self(Arc::new(RayTracingSceneInner {
            instance_buffer,
            instances,
            scratch,
            result,
            view,
        })))
    }

    fn write_instances(
        buffer: &Buffer,
        instances: &[RayTracingGeometryInstance],
    ) -> RhiResult<()> {
        let mapped = buffer.map::<RawInstanceDesc>()?;
        for (i, instance) in instances.iter().enumerate() {
            unsafe { mapped.as_ptr().add(i).write(RawInstanceDesc::new(instance)) };
        }
        buffer.unmap();
        Ok(())
    }

    /// Records the TLAS build. All referenced bottom-level structures must
    /// have been built (and UAV-barriered) beforehand.
    pub(crate) fn build(&self, list: &ID3D12GraphicsCommandList4) {
        let desc = D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_DESC {
            DestAccelerationStructureData: self.result.gpu_virtual_address(),
            Inputs: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS {
                Type: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_TYPE_TOP_LEVEL,
                Flags: D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAG_PREFER_FAST_TRACE,
                NumDescs: self.instances.len() as u32,
                DescsLayout: D3D12_ELEMENTS_LAYOUT_ARRAY,
                Anonymous: D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS_0 {
                    InstanceDescs: self.instance_buffer.gpu_virtual_address(),
                },
            },
            SourceAccelerationStructureData: 0,
            ScratchAccelerationStructureData: self.scratch.gpu_virtual_address(),
        };

        unsafe { list.BuildRaytracingAccelerationStructure(&desc, None) };
    }
}

/*
 * Ray-tracing pipeline state
 */

#[derive(Clone, Debug)]
pub struct RayTracingPipelineStateDesc {
    pub ray_gen_shader: Shader,
    pub miss_shaders: Vec<Shader>,
    pub closest_hit_shaders: Vec<Shader>,
    pub max_payload_size: u32,
    pub max_attribute_size: u32,
    pub max_recursion_depth: u32,
}

#[derive(Clone, Debug)]
pub struct RayTracingPipelineState(Arc<RayTracingPipelineStateInner>);

#[derive(Debug)]
pub struct RayTracingPipelineStateInner {
    state_object: ID3D12StateObject,
    properties: ID3D12StateObjectProperties,
    root_signature: RootSignature,

    ray_gen_name: Vec<u16>,
    miss_names: Vec<Vec<u16>>,
    hit_group_names: Vec<Vec<u16>>,
}

// The COM pointers are agile; the name buffers are plain data.
unsafe impl Send for RayTracingPipelineStateInner {}
unsafe impl Sync for RayTracingPipelineStateInner {}

impl Deref for RayTracingPipelineState {
    type Target = RayTracingPipelineStateInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

fn wide(name: &str) -> Vec<u16> {
    name.encode_utf16().chain(std::iter::once(0)).collect()
}

impl RayTracingPipelineState {
    pub(crate) fn inner_new(
        device: &Device,
        root_signature: RootSignature,
        desc: &RayTracingPipelineStateDesc,
    ) -> RhiResult<Self> {
        if desc.ray_gen_shader.stage() != ShaderStage::RayGeneration {
            return Err(RhiError::InvalidParameter(
                "ray tracing pipeline requires a ray-generation shader",
            ));
        }

        let ray_gen_name = wide("RayGen");
        let miss_names = (0..desc.miss_shaders.len())
            .map(|i| wide(&format!("Miss{i}")))
            .collect::<Vec<_>>();
        let closest_hit_names = (0..desc.closest_hit_shaders.len())
            .map(|i| wide(&format!("ClosestHit{i}")))
            .collect::<Vec<_>>();
        let hit_group_names = (0..desc.closest_hit_shaders.len())
            .map(|i| wide(&format!("HitGroup{i}")))
            .collect::<Vec<_>>();

        // Payload structs must stay put while the subobject array borrows
        // them, so everything is sized up front.
        let num_libraries = 1 + desc.miss_shaders.len() + desc.closest_hit_shaders.len();

        let mut exports: Vec<D3D12_EXPORT_DESC> = Vec::with_capacity(num_libraries);
        let mut libraries: Vec<D3D12_DXIL_LIBRARY_DESC> = Vec::with_capacity(num_libraries);
        let mut hit_groups: Vec<D3D12_HIT_GROUP_DESC> =
            Vec::with_capacity(desc.closest_hit_shaders.len());

        let mut push_library = |shader: &Shader, name: &[u16]| {
            exports.push(D3D12_EXPORT_DESC {
                Name: PCWSTR(name.as_ptr()),
                ExportToRename: PCWSTR::null(),
                Flags: Default::default(),
            });
            libraries.push(D3D12_DXIL_LIBRARY_DESC {
                DXILLibrary: D3D12_SHADER_BYTECODE {
                    pShaderBytecode: shader.bytecode().as_ptr() as *const _,
                    BytecodeLength: shader.bytecode().len(),
                },
                NumExports: 1,
                pExports: &exports[exports.len() - 1] as *const _,
            });
        };

        push_library(&desc.ray_gen_shader, &ray_gen_name);
        for (shader, name) in desc.miss_shaders.iter().zip(miss_names.iter()) {
            push_library(shader, name);
        }
        for (shader, name) in desc.closest_hit_shaders.iter().zip(closest_hit_names.iter()) {
            push_library(shader, name);
        }

        for (closest_hit, group) in closest_hit_names.iter().zip(hit_group_names.iter()) {
            hit_groups.push(D3D12_HIT_GROUP_DESC {
                HitGroupExport: PCWSTR(group.as_ptr()),
                Type: D3D12_HIT_GROUP_TYPE_TRIANGLES,
                AnyHitShaderImport: PCWSTR::null(),
                ClosestHitShaderImport: PCWSTR(closest_hit.as_ptr()),
                IntersectionShaderImport: PCWSTR::null(),
            });
        }

        let shader_config = D3D12_RAYTRACING_SHADER_CONFIG {
            MaxPayloadSizeInBytes: desc.max_payload_size,
            MaxAttributeSizeInBytes: desc.max_attribute_size,
        };
        let pipeline_config = D3D12_RAYTRACING_PIPELINE_CONFIG {
            MaxTraceRecursionDepth: desc.max_recursion_depth.max(1),
        };
        let global_signature = D3D12_GLOBAL_ROOT_SIGNATURE {
            pGlobalRootSignature: unsafe { std::mem::transmute_copy(&root_signature.raw().0) },
        };

        let mut subobjects: Vec<D3D12_STATE_SUBOBJECT> =
            Vec::with_capacity(libraries.len() + hit_groups.len() + 3);
        for library in &libraries {
            subobjects.push(D3D12_STATE_SUBOBJECT {
                Type: D3D12_STATE_SUBOBJECT_TYPE_DXIL_LIBRARY,
                pDesc: library as *const _ as *const _,
            });
        }
        for hit_group in &hit_groups {
            subobjects.push(D3D12_STATE_SUBOBJECT {
                Type: D3D12_STATE_SUBOBJECT_TYPE_HIT_GROUP,
                pDesc: hit_group as *const _ as *const _,
            });
        }
        subobjects.push(D3D12_STATE_SUBOBJECT {
            Type: D3D12_STATE_SUBOBJECT_TYPE_RAYTRACING_SHADER_CONFIG,
            pDesc: &shader_config as *const _ as *const _,
        });
        subobjects.push(D3D12_STATE_SUBOBJECT {
            Type: D3D12_STATE_SUBOBJECT_TYPE_RAYTRACING_PIPELINE_CONFIG,
            pDesc: &pipeline_config as *const _ as *const _,
        });
        subobjects.push(D3D12_STATE_SUBOBJECT {
            Type: D3D12_STATE_SUBOBJECT_TYPE_GLOBAL_ROOT_SIGNATURE,
            pDesc: &global_signature as *const _ as *const _,
        });

        let state_desc = D3D12_STATE_OBJECT_DESC {
            Type: D3D12_STATE_OBJECT_TYPE_RAYTRACING_PIPELINE,
            NumSubobjects: subobjects.len() as u32,
            pSubobjects: subobjects.as_ptr(),
        };

        let state_object: ID3D12StateObject = unsafe { device5(device)?.CreateStateObject(&state_desc) }
            .map_err(|e| RhiError::creation("ray tracing state object", dx::DxError::Dxgi(e.message())))?;

        let properties: ID3D12StateObjectProperties = state_object
            .cast()
            .map_err(|_| RhiError::Unsupported("state object properties"))?;

        Ok(Self(Arc::new(RayTracingPipelineStateInner {
            state_object,
            properties,
            root_signature,
            ray_gen_name,
            miss_names,
            hit_group_names,
        })))
    }
}

impl RayTracingPipelineStateInner {
    pub fn root_signature(&self) -> &RootSignature {
        &self.root_signature
    }

    pub(crate) fn state_object(&self) -> &ID3D12StateObject {
        &self.state_object
    }

    fn identifier(&self, name: &[u16]) -> [u8; SHADER_IDENTIFIER_SIZE as usize] {
        let mut identifier = [0u8; SHADER_IDENTIFIER_SIZE as usize];
        let ptr = unsafe { self.properties.GetShaderIdentifier(PCWSTR(name.as_ptr())) };
        if !ptr.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    ptr as *const u8,
                    identifier.as_mut_ptr(),
                    identifier.len(),
                );
            }
        }
        identifier
    }

    pub(crate) fn ray_gen_identifier(&self) -> [u8; SHADER_IDENTIFIER_SIZE as usize] {
        self.identifier(&self.ray_gen_name)
    }

    pub(crate) fn miss_identifiers(
        &self,
    ) -> impl Iterator<Item = [u8; SHADER_IDENTIFIER_SIZE as usize]> + '_ {
        self.miss_names.iter().map(|name| self.identifier(name))
    }

    pub(crate) fn hit_group_identifiers(
        &self,
    ) -> impl Iterator<Item = [u8; SHADER_IDENTIFIER_SIZE as usize]> + '_ {
        self.hit_group_names.iter().map(|name| self.identifier(name))
    }
}

/*
 * Shader binding table
 */

/// Byte layout of the three shader tables inside one buffer. Pure so the
/// alignment rules are testable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ShaderTableLayout {
    pub record_stride: u64,
    pub ray_gen_offset: u64,
    pub miss_offset: u64,
    pub miss_size: u64,
    pub hit_group_offset: u64,
    pub hit_group_size: u64,
    pub total_size: u64,
}

impl ShaderTableLayout {
    pub(crate) fn new(num_miss: u64, num_hit_groups: u64, local_data_size: u64) -> Self {
        let record_stride = align_up(
            SHADER_IDENTIFIER_SIZE + local_data_size,
            SHADER_RECORD_ALIGNMENT,
        );

        let ray_gen_offset = 0;
        let miss_offset = align_up(record_stride, SHADER_TABLE_ALIGNMENT);
        let miss_size = num_miss * record_stride;
        let hit_group_offset = align_up(miss_offset + miss_size, SHADER_TABLE_ALIGNMENT);
        let hit_group_size = num_hit_groups * record_stride;

        Self {
            record_stride,
            ray_gen_offset,
            miss_offset,
            miss_size,
            hit_group_offset,
            hit_group_size,
            total_size: hit_group_offset + hit_group_size.max(record_stride),
        }
    }
}

/// The assembled shader tables plus the address ranges `dispatch_rays`
/// plugs into its dispatch descriptor.
#[derive(Debug)]
pub struct ShaderBindingTable {
    buffer: Buffer,
    layout: ShaderTableLayout,
}

impl ShaderBindingTable {
    /// Packs the pipeline's shader identifiers (optionally followed by one
    /// GPU descriptor handle of per-record local bindings) into an upload
    /// buffer.
    pub(crate) fn build(
        device: &Device,
        pipeline: &RayTracingPipelineState,
        hit_group_tables: &[Option<dx::GpuDescriptorHandle>],
    ) -> RhiResult<Self> {
        let local_data_size = if hit_group_tables.iter().any(Option::is_some) {
            std::mem::size_of::<u64>() as u64
        } else {
            0
        };

        let num_miss = pipeline.miss_names.len() as u64;
        let num_hit_groups = pipeline.hit_group_names.len() as u64;
        let layout = ShaderTableLayout::new(num_miss, num_hit_groups, local_data_size);

        let buffer = Buffer::inner_new(
            device,
            BufferDesc::new(layout.total_size, BufferUsage::empty())
                .with_heap_kind(HeapKind::Upload),
        )?;

        let mapped = buffer.map::<u8>()?;
        let write_record =
            |offset: u64, identifier: &[u8], table: Option<dx::GpuDescriptorHandle>| unsafe {
                let dst = mapped.as_ptr().add(offset as usize);
                std::ptr::copy_nonoverlapping(identifier.as_ptr(), dst, identifier.len());

                if let Some(table) = table {
                    // GPU descriptor handles are a raw 64-bit address in
                    // record memory.
                    let raw: u64 = std::mem::transmute(table);
                    std::ptr::copy_nonoverlapping(
                        (&raw as *const u64) as *const u8,
                        dst.add(SHADER_IDENTIFIER_SIZE as usize),
                        std::mem::size_of::<u64>(),
                    );
                }
            };

        write_record(layout.ray_gen_offset, &pipeline.ray_gen_identifier(), None);

        for (i, identifier) in pipeline.miss_identifiers().enumerate() {
            write_record(
                layout.miss_offset + i as u64 * layout.record_stride,
                &identifier,
                None,
            );
        }

        for (i, identifier) in pipeline.hit_group_identifiers().enumerate() {
            write_record(
                layout.hit_group_offset + i as u64 * layout.record_stride,
                &identifier,
                hit_group_tables.get(i).copied().flatten(),
            );
        }

        buffer.unmap();

        Ok(Self { buffer, layout })
    }

    pub(crate) fn dispatch_desc(&self, width: u32, height: u32, depth: u32) -> D3D12_DISPATCH_RAYS_DESC {
        let base = self.buffer.gpu_virtual_address();

        D3D12_DISPATCH_RAYS_DESC {
            RayGenerationShaderRecord: D3D12_GPU_VIRTUAL_ADDRESS_RANGE {
                StartAddress: base + self.layout.ray_gen_offset,
                SizeInBytes: self.layout.record_stride,
            },
            MissShaderTable: D3D12_GPU_VIRTUAL_ADDRESS_RANGE_AND_STRIDE {
                StartAddress: base + self.layout.miss_offset,
                SizeInBytes: self.layout.miss_size,
                StrideInBytes: self.layout.record_stride,
            },
            HitGroupTable: D3D12_GPU_VIRTUAL_ADDRESS_RANGE_AND_STRIDE {
                StartAddress: base + self.layout.hit_group_offset,
                SizeInBytes: self.layout.hit_group_size,
                StrideInBytes: self.layout.record_stride,
            },
            CallableShaderTable: D3D12_GPU_VIRTUAL_ADDRESS_RANGE_AND_STRIDE::default(),
            Width: width,
            Height: height,
            Depth: depth,
        }
    }

    pub(crate) fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_stride_is_32_byte_aligned() {
        let bare = ShaderTableLayout::new(1, 1, 0);
        assert_eq!(bare.record_stride, 32);

        let with_table = ShaderTableLayout::new(1, 1, 8);
        assert_eq!(with_table.record_stride, 64);
    }

    #[test]
    fn tables_start_on_64_byte_boundaries() {
        let layout = ShaderTableLayout::new(3, 5, 8);

        assert_eq!(layout.ray_gen_offset % SHADER_TABLE_ALIGNMENT, 0);
        assert_eq!(layout.miss_offset % SHADER_TABLE_ALIGNMENT, 0);
        assert_eq!(layout.hit_group_offset % SHADER_TABLE_ALIGNMENT, 0);
        assert_eq!(layout.miss_size, 3 * layout.record_stride);
        assert_eq!(layout.hit_group_size, 5 * layout.record_stride);
        assert!(layout.total_size >= layout.hit_group_offset + layout.hit_group_size);
    }

    #[test]
    fn instance_desc_packs_id_and_mask() {
        // 24-bit id, 8-bit mask, independent of each other.
        let id_and_mask = (0x00ab_cdef & 0x00ff_ffff) | (0xffu32 << 24);
        assert_eq!(id_and_mask, 0xffab_cdef);
    }
}
