//! A D3D12 render-hardware-interface: command-list batching, descriptor-heap
//! management, root-signature caching and resource-barrier tracking behind an
//! engine-facing API.
//!
//! The heart of the crate is [`rhi::CommandContext`]: `begin` claims one of a
//! small ring of command batches (waiting on the batch's fence if the GPU is
//! behind), state setters accumulate in dirty-tracked caches, and every
//! draw/dispatch/copy first flushes pending resource barriers and commits the
//! descriptor tables that actually changed. [`rhi::RenderLayer`] owns the
//! process-wide services (device, offline descriptor heaps, root-signature
//! cache) and hands them to contexts by reference.

pub mod rhi;
pub mod utils;
