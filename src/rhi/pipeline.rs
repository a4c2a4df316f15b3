use std::{ops::Deref, sync::Arc};

use oxidx::dx;
use smallvec::SmallVec;

use super::{
    device::Device,
    error::{RhiError, RhiResult},
    root_signature::{
        RootSignature, RootSignatureCache, RootSignatureKind, RootSignatureRequirements,
        ShaderResourceCount,
    },
    types::ShaderVisibility,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Hull,
    Domain,
    Geometry,
    Pixel,
    Compute,
    RayGeneration,
    Miss,
    ClosestHit,
    AnyHit,
}

impl ShaderStage {
    /// Graphics stages map to a descriptor-table visibility; compute and
    /// ray-tracing stages all bind through `All`.
    pub fn visibility(self) -> ShaderVisibility {
        match self {
            ShaderStage::Vertex => ShaderVisibility::Vertex,
            ShaderStage::Hull => ShaderVisibility::Hull,
            ShaderStage::Domain => ShaderVisibility::Domain,
            ShaderStage::Geometry => ShaderVisibility::Geometry,
            ShaderStage::Pixel => ShaderVisibility::Pixel,
            _ => ShaderVisibility::All,
        }
    }
}

/// Compiled shader bytecode plus the binding counts it declares. Shader
/// compilation happens outside this crate; the bytes arrive precompiled.
#[derive(Clone, Debug)]
pub struct Shader(Arc<ShaderInner>);

#[derive(Debug)]
pub struct ShaderInner {
    bytecode: dx::Blob,
    stage: ShaderStage,
    resource_counts: ShaderResourceCount,
}

impl Deref for Shader {
    type Target = ShaderInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Shader {
    pub(crate) fn inner_new(
        bytecode: Vec<u8>,
        stage: ShaderStage,
        resource_counts: ShaderResourceCount,
    ) -> RhiResult<Self> {
        if bytecode.is_empty() {
            return Err(RhiError::InvalidParameter("empty shader bytecode"));
        }

        Ok(Self(Arc::new(ShaderInner {
            bytecode: dx::Blob::from(bytecode),
            stage,
            resource_counts,
        })))
    }
}

impl ShaderInner {
    pub fn bytecode(&self) -> &dx::Blob {
        &self.bytecode
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn resource_counts(&self) -> &ShaderResourceCount {
        &self.resource_counts
    }
}

#[derive(Clone, Copy, Debug)]
pub struct InputElement {
    pub semantic: dx::SemanticName,
    pub format: dx::Format,
    pub slot: u32,
}

#[derive(Clone, Debug)]
pub struct GraphicsPipelineStateDesc {
    pub vertex_shader: Shader,
    pub pixel_shader: Option<Shader>,
    pub input_layout: Vec<InputElement>,
    pub primitive_topology: dx::PipelinePrimitiveTopology,
    pub render_target_formats: Vec<dx::Format>,
    pub depth_stencil_format: Option<dx::Format>,
    pub depth_func: Option<dx::ComparisonFunc>,
    pub cull_mode: dx::CullMode,
}

impl GraphicsPipelineStateDesc {
    pub fn new(vertex_shader: Shader) -> Self {
        Self {
            vertex_shader,
            pixel_shader: None,
            input_layout: Vec::new(),
            primitive_topology: dx::PipelinePrimitiveTopology::Triangle,
            render_target_formats: Vec::new(),
            depth_stencil_format: None,
            depth_func: Some(dx::ComparisonFunc::LessEqual),
            cull_mode: dx::CullMode::Back,
        }
    }

    /// Folds every stage's declared counts into one root-signature key.
    fn requirements(&self) -> RootSignatureRequirements {
        let mut requirements = RootSignatureRequirements::new(RootSignatureKind::Graphics);

        let mut fold = |shader: &Shader| {
            let stage = requirements.stage_mut(shader.stage().visibility());
            let counts = shader.resource_counts();

            stage.ranges.num_cbvs = stage.ranges.num_cbvs.max(counts.ranges.num_cbvs);
            stage.ranges.num_srvs = stage.ranges.num_srvs.max(counts.ranges.num_srvs);
            stage.ranges.num_uavs = stage.ranges.num_uavs.max(counts.ranges.num_uavs);
            stage.ranges.num_samplers = stage.ranges.num_samplers.max(counts.ranges.num_samplers);
            stage.num_32bit_constants = stage
                .num_32bit_constants
                .max(counts.num_32bit_constants);
        };

        fold(&self.vertex_shader);
        if let Some(pixel_shader) = &self.pixel_shader {
            fold(pixel_shader);
        }

        requirements
    }
}

#[derive(Clone, Debug)]
pub struct GraphicsPipelineState(Arc<GraphicsPipelineStateInner>);

#[derive(Debug)]
pub struct GraphicsPipelineStateInner {
    raw: dx::PipelineState,
    root_signature: RootSignature,
}

impl Deref for GraphicsPipelineState {
    type Target = GraphicsPipelineStateInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl GraphicsPipelineStateInner {
    pub fn raw(&self) -> &dx::PipelineState {
        &self.raw
    }

    pub fn root_signature(&self) -> &RootSignature {
        &self.root_signature
    }
}

impl GraphicsPipelineState {
    pub(crate) fn inner_new(
        device: &Device,
        root_signatures: &RootSignatureCache,
        desc: &GraphicsPipelineStateDesc,
    ) -> RhiResult<Self> {
        let root_signature = root_signatures.get_or_create(desc.requirements())?;

        let input_layout = desc
            .input_layout
            .iter()
            .map(|element| {
                dx::InputElementDesc::per_vertex(element.semantic, element.format, element.slot)
            })
            .collect::<SmallVec<[_; 8]>>();

        let mut raw_desc = dx::GraphicsPipelineDesc::new(desc.vertex_shader.bytecode())
            .with_root_signature(root_signature.raw())
            .with_input_layout(&input_layout)
            .with_primitive_topology(desc.primitive_topology)
            .with_render_targets(desc.render_target_formats.iter().copied())
            .with_rasterizer_state(
                dx::RasterizerDesc::default().with_cull_mode(desc.cull_mode),
            )
            .with_blend_desc(dx::BlendDesc::default());

        if let Some(pixel_shader) = &desc.pixel_shader {
            raw_desc = raw_desc.with_ps(pixel_shader.bytecode());
        }

        if let Some(format) = desc.depth_stencil_format {
            let depth_stencil = match desc.depth_func {
                Some(func) => dx::DepthStencilDesc::default().enable_depth(func),
                None => dx::DepthStencilDesc::default(),
            };
            raw_desc = raw_desc.with_depth_stencil(depth_stencil, format);
        }

        let raw = device
            .raw
            .create_graphics_pipeline(&raw_desc)
            .map_err(|e| RhiError::creation("graphics pipeline state", e))?;

        Ok(Self(Arc::new(GraphicsPipelineStateInner {
            raw,
            root_signature,
        })))
    }
}

#[derive(Clone, Debug)]
pub struct ComputePipelineState(Arc<ComputePipelineStateInner>);

#[derive(Debug)]
pub struct ComputePipelineStateInner {
    raw: dx::PipelineState,
    root_signature: RootSignature,
}

impl Deref for ComputePipelineState {
    type Target = ComputePipelineStateInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ComputePipelineStateInner {
    pub fn raw(&self) -> &dx::PipelineState {
        &self.raw
    }

    pub fn root_signature(&self) -> &RootSignature {
        &self.root_signature
    }
}

impl ComputePipelineState {
    pub(crate) fn inner_new(
        device: &Device,
        root_signatures: &RootSignatureCache,
        shader: &Shader,
    ) -> RhiResult<Self> {
        if shader.stage() != ShaderStage::Compute {
            return Err(RhiError::InvalidParameter(
                "compute pipeline requires a compute shader",
            ));
        }

        let mut requirements = RootSignatureRequirements::new(RootSignatureKind::Compute);
        *requirements.stage_mut(ShaderVisibility::All) = *shader.resource_counts();

        let root_signature = root_signatures.get_or_create(requirements)?;

        let raw_desc = dx::ComputePipelineStateDesc::new(shader.bytecode())
            .with_root_signature(root_signature.raw());

        let raw = device
            .raw
            .create_compute_pipeline_state(&raw_desc)
            .map_err(|e| RhiError::creation("compute pipeline state", e))?;

        Ok(Self(Arc::new(ComputePipelineStateInner {
            raw,
            root_signature,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graphics_stages_map_to_their_visibility() {
        assert_eq!(ShaderStage::Vertex.visibility(), ShaderVisibility::Vertex);
        assert_eq!(ShaderStage::Pixel.visibility(), ShaderVisibility::Pixel);
        assert_eq!(ShaderStage::Compute.visibility(), ShaderVisibility::All);
        assert_eq!(
            ShaderStage::RayGeneration.visibility(),
            ShaderVisibility::All
        );
    }

    #[test]
    fn empty_bytecode_is_rejected() {
        assert!(Shader::inner_new(
            Vec::new(),
            ShaderStage::Vertex,
            ShaderResourceCount::default()
        )
        .is_err());
    }
}
