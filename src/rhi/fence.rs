use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use oxidx::dx;

use super::{
    device::Device,
    error::{RhiError, RhiResult},
};

/// A monotonically increasing GPU/CPU synchronization counter. The CPU side
/// tracks the last value handed out; the GPU side reports the last value it
/// has reached.
#[derive(Clone, Debug)]
pub struct Fence {
    pub(crate) raw: dx::Fence,
    value: Arc<AtomicU64>,
}

impl Fence {
    pub(crate) fn inner_new(device: &Device) -> RhiResult<Self> {
        let raw = device
            .raw
            .create_fence(0, dx::FenceFlags::empty())
            .map_err(|e| RhiError::creation("fence", e))?;

        Ok(Self {
            raw,
            value: Default::default(),
        })
    }

    pub fn completed_value(&self) -> u64 {
        self.raw.get_completed_value()
    }

    pub fn current_value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_value(&self) -> u64 {
        self.value.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn is_complete(&self, value: u64) -> bool {
        self.completed_value() >= value
    }

    /// Blocks the calling thread until the GPU has signaled `value`.
    pub fn wait_for_value(&self, value: u64) -> RhiResult<()> {
        if self.is_complete(value) {
            return Ok(());
        }

        let event = dx::Event::create(false, false)
            .map_err(|e| RhiError::creation("fence event", e))?;

        self.raw
            .set_event_on_completion(value, event)
            .map_err(|e| RhiError::creation("fence wait", e))?;
        event.wait(u32::MAX);

        event
            .close()
            .map_err(|e| RhiError::creation("fence event close", e))?;

        Ok(())
    }
}

#[cfg(test)]
#[allow(unused)]
mod tests {
    use super::Fence;

    const fn is_send_sync<T: Send + Sync>() {}

    const _: () = is_send_sync::<Fence>();
}
