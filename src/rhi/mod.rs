pub mod barrier;
pub mod command_batch;
pub mod command_context;
pub mod descriptor_cache;
pub mod descriptor_heap;
pub mod device;
pub mod error;
pub mod fence;
pub mod layer;
pub mod pipeline;
pub mod query;
pub mod raytracing;
pub mod resources;
pub mod root_signature;
pub mod swapchain;
pub mod types;
pub mod upload;
pub mod views;

pub use command_context::{CommandContext, CopyBufferInfo, CopyTextureInfo, MipGenShaders};
pub use device::Device;
pub use error::{RhiError, RhiResult};
pub use layer::RenderLayer;
pub use types::{HeapKind, PrimitiveTopology, ResourceStates, ShaderVisibility};

/// Command batches in flight: the CPU may run at most this many frames
/// ahead of the GPU.
pub const NUM_COMMAND_BATCHES: usize = 3;

/// Round-up minimums for root-signature descriptor tables. A signature
/// created for a smaller request grows to these so later pipelines with
/// similar needs can share it.
pub const DEFAULT_CONSTANT_BUFFER_COUNT: u32 = 8;
pub const DEFAULT_SHADER_RESOURCE_VIEW_COUNT: u32 = 16;
pub const DEFAULT_UNORDERED_ACCESS_VIEW_COUNT: u32 = 8;
pub const DEFAULT_SAMPLER_STATE_COUNT: u32 = 8;

/// Table sizes for ray-tracing local root signatures.
pub const DEFAULT_LOCAL_RESOURCE_COUNT: u32 = 4;

pub const MAX_32BIT_SHADER_CONSTANTS: u32 = 32;

pub const MAX_VERTEX_BUFFER_SLOTS: usize = 16;
pub const MAX_RENDER_TARGET_COUNT: usize = 8;

/// Online (GPU-visible) heap capacities per command batch.
pub const DEFAULT_ONLINE_RESOURCE_DESCRIPTOR_COUNT: u32 = 2048;
pub const DEFAULT_ONLINE_SAMPLER_DESCRIPTOR_COUNT: u32 = 1024;

/// Register space reserved for the shared 32-bit-constant root parameter.
pub const REGISTER_SPACE_32BIT_CONSTANTS: u32 = 1;
/// Register space for ray-tracing local root signatures.
pub const REGISTER_SPACE_RT_LOCAL: u32 = 2;
