use std::{ops::Deref, sync::Arc};

use atomig::Atomic;
use oxidx::dx;

use crate::rhi::{
    device::Device,
    error::{RhiError, RhiResult},
    types::{HeapKind, ResourceStates},
};

/// One allocation in a specific heap. Owns the native handle and the
/// engine-tracked state; the tracked state must match the last state issued
/// to the GPU before any new transition is computed.
#[derive(Clone, Debug)]
pub struct Resource(Arc<ResourceInner>);

#[derive(Debug)]
pub struct ResourceInner {
    raw: dx::Resource,
    heap_kind: HeapKind,
    size: u64,
    gpu_address: u64,
    state: Atomic<ResourceStates>,
}

impl Deref for Resource {
    type Target = ResourceInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Resource {
    pub(crate) fn create_committed(
        device: &Device,
        what: &'static str,
        heap_kind: HeapKind,
        desc: &dx::ResourceDesc,
        initial_state: ResourceStates,
        clear_value: Option<&dx::ClearValue>,
        size: u64,
        is_buffer: bool,
    ) -> RhiResult<Self> {
        let raw = device
            .raw
            .create_committed_resource(
                &heap_kind.properties(),
                dx::HeapFlags::empty(),
                desc,
                initial_state.as_raw(),
                clear_value,
            )
            .map_err(|e| RhiError::creation(what, e))?;

        Ok(Self::from_raw(raw, heap_kind, initial_state, size, is_buffer))
    }

    pub(crate) fn from_raw(
        raw: dx::Resource,
        heap_kind: HeapKind,
        state: ResourceStates,
        size: u64,
        is_buffer: bool,
    ) -> Self {
        let gpu_address = if is_buffer {
            raw.get_gpu_virtual_address()
        } else {
            0
        };

        Self(Arc::new(ResourceInner {
            raw,
            heap_kind,
            size,
            gpu_address,
            state: Atomic::new(state),
        }))
    }
}

impl ResourceInner {
    pub fn raw(&self) -> &dx::Resource {
        &self.raw
    }

    pub fn heap_kind(&self) -> HeapKind {
        self.heap_kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Valid for buffers only; textures have no stable virtual address.
    pub fn gpu_virtual_address(&self) -> u64 {
        debug_assert_ne!(self.gpu_address, 0, "not a buffer resource");
        self.gpu_address
    }

    pub fn state(&self) -> ResourceStates {
        self.state.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Records the state the GPU will be in after the pending transition
    /// and returns what it was before.
    pub(crate) fn swap_state(&self, state: ResourceStates) -> ResourceStates {
        self.state.swap(state, std::sync::atomic::Ordering::Relaxed)
    }

    pub fn map<T>(&self) -> RhiResult<std::ptr::NonNull<T>> {
        debug_assert_ne!(self.heap_kind, HeapKind::Default);

        self.raw
            .map::<T>(0, None)
            .map_err(|e| RhiError::creation("resource mapping", e))
    }

    pub fn unmap(&self) {
        self.raw.unmap(0, None);
    }
}

#[cfg(test)]
#[allow(unused)]
mod tests {
    use super::Resource;

    const fn is_send_sync<T: Send + Sync>() {}

    const _: () = is_send_sync::<Resource>();
}
