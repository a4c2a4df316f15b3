use atomig::Atom;
use oxidx::dx;

/// Engine-tracked resource states. Mirrors the subset of D3D12 states the
/// renderer actually moves resources through; the tracked state must match
/// the last state issued to the GPU before a new transition is computed.
bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
    pub struct ResourceStates: i32 {
        const Common = dx::ResourceStates::Common.bits();
        const VertexAndConstantBuffer = dx::ResourceStates::VertexAndConstantBuffer.bits();
        const IndexBuffer = dx::ResourceStates::IndexBuffer.bits();
        const RenderTarget = dx::ResourceStates::RenderTarget.bits();
        const UnorderedAccess = dx::ResourceStates::UnorderedAccess.bits();
        const DepthWrite = dx::ResourceStates::DepthWrite.bits();
        const DepthRead = dx::ResourceStates::DepthRead.bits();
        const NonPixelShaderResource = dx::ResourceStates::NonPixelShaderResource.bits();
        const PixelShaderResource = dx::ResourceStates::PixelShaderResource.bits();
        const IndirectArgument = dx::ResourceStates::IndirectArgument.bits();
        const CopyDst = dx::ResourceStates::CopyDest.bits();
        const CopySrc = dx::ResourceStates::CopySource.bits();
        const GenericRead = dx::ResourceStates::GenericRead.bits();
        const AllShaderResource = dx::ResourceStates::AllShaderResource.bits();
        const RayTracingAccelerationStructure = dx::ResourceStates::RaytracingAccelerationStructure.bits();
        const Present = dx::ResourceStates::Present.bits();
    }
}

impl ResourceStates {
    pub(crate) fn as_raw(&self) -> dx::ResourceStates {
        dx::ResourceStates::from_bits_retain(self.bits())
    }
}

impl Atom for ResourceStates {
    type Repr = i32;

    fn pack(self) -> Self::Repr {
        self.bits()
    }

    fn unpack(src: Self::Repr) -> Self {
        ResourceStates::from_bits_retain(src)
    }
}

/// Which heap an allocation lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapKind {
    Default,
    Upload,
    Readback,
}

impl HeapKind {
    pub(crate) fn properties(self) -> dx::HeapProperties {
        match self {
            HeapKind::Default => dx::HeapProperties::new(
                dx::HeapType::Default,
                dx::CpuPageProperty::Unknown,
                dx::MemoryPool::Unknown,
            ),
            HeapKind::Upload => dx::HeapProperties::upload(),
            HeapKind::Readback => dx::HeapProperties::readback(),
        }
    }
}

/// Shader stages a binding can be visible to. Indexes the per-visibility
/// tables in the descriptor cache and root-signature keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum ShaderVisibility {
    All = 0,
    Vertex = 1,
    Hull = 2,
    Domain = 3,
    Geometry = 4,
    Pixel = 5,
}

pub const NUM_SHADER_VISIBILITIES: usize = 6;

impl ShaderVisibility {
    pub const ALL: [ShaderVisibility; NUM_SHADER_VISIBILITIES] = [
        ShaderVisibility::All,
        ShaderVisibility::Vertex,
        ShaderVisibility::Hull,
        ShaderVisibility::Domain,
        ShaderVisibility::Geometry,
        ShaderVisibility::Pixel,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub(crate) fn as_raw(self) -> dx::ShaderVisibility {
        match self {
            ShaderVisibility::All => dx::ShaderVisibility::All,
            ShaderVisibility::Vertex => dx::ShaderVisibility::Vertex,
            ShaderVisibility::Hull => dx::ShaderVisibility::Hull,
            ShaderVisibility::Domain => dx::ShaderVisibility::Domain,
            ShaderVisibility::Geometry => dx::ShaderVisibility::Geometry,
            ShaderVisibility::Pixel => dx::ShaderVisibility::Pixel,
        }
    }

    /// The root-signature flag that denies this stage access when it binds
    /// nothing. `All` has no deny flag.
    pub(crate) fn deny_flag(self) -> dx::RootSignatureFlags {
        match self {
            ShaderVisibility::All => dx::RootSignatureFlags::empty(),
            ShaderVisibility::Vertex => dx::RootSignatureFlags::DenyVertexShaderAccess,
            ShaderVisibility::Hull => dx::RootSignatureFlags::DenyHullShaderAccess,
            ShaderVisibility::Domain => dx::RootSignatureFlags::DenyDomainShaderAccess,
            ShaderVisibility::Geometry => dx::RootSignatureFlags::DenyGeometryShaderAccess,
            ShaderVisibility::Pixel => dx::RootSignatureFlags::DenyPixelShaderAccess,
        }
    }
}

/// The four binding kinds a descriptor table can carry. Indexes the
/// `(visibility, kind) -> root parameter` map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum ResourceBindingKind {
    Cbv = 0,
    Srv = 1,
    Uav = 2,
    Sampler = 3,
}

pub const NUM_RESOURCE_BINDING_KINDS: usize = 4;

impl ResourceBindingKind {
    pub const ALL: [ResourceBindingKind; NUM_RESOURCE_BINDING_KINDS] = [
        ResourceBindingKind::Cbv,
        ResourceBindingKind::Srv,
        ResourceBindingKind::Uav,
        ResourceBindingKind::Sampler,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Primitive topologies exposed by the context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PrimitiveTopology {
    #[default]
    Undefined,
    PointList,
    LineList,
    TriangleList,
}

impl PrimitiveTopology {
    pub(crate) fn as_raw(self) -> dx::PrimitiveTopology {
        match self {
            PrimitiveTopology::Undefined => dx::PrimitiveTopology::Undefined,
            PrimitiveTopology::PointList => dx::PrimitiveTopology::Point,
            PrimitiveTopology::LineList => dx::PrimitiveTopology::Line,
            PrimitiveTopology::TriangleList => dx::PrimitiveTopology::Triangle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_indices_are_dense() {
        for (i, visibility) in ShaderVisibility::ALL.iter().enumerate() {
            assert_eq!(visibility.index(), i);
        }

        for (i, kind) in ResourceBindingKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn states_round_trip_through_atom() {
        let state = ResourceStates::CopyDst | ResourceStates::NonPixelShaderResource;
        assert_eq!(ResourceStates::unpack(state.pack()), state);
    }
}
