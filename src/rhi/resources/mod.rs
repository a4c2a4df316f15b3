pub mod buffer;
pub mod resource;
pub mod sampler;
pub mod texture;

pub use buffer::{Buffer, BufferDesc, BufferUsage, CONSTANT_BUFFER_ALIGNMENT};
pub use resource::Resource;
pub use sampler::SamplerState;
pub use texture::{Texture, TextureClearValue, TextureDesc, TextureDimension, TextureUsage};
