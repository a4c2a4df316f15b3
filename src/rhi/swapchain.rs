use std::num::NonZeroIsize;

use oxidx::dx;
use tracing::info;

use super::{
    command_context::CommandContext,
    descriptor_heap::OfflineDescriptorHeap,
    device::Device,
    error::{RhiError, RhiResult},
    resources::{Resource, Texture, TextureDesc, TextureUsage},
    types::{HeapKind, ResourceStates},
    views::RenderTargetView,
};

#[derive(Clone, Debug)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub format: dx::Format,
    pub buffer_count: u32,
}

/// The presentation surface: back-buffer textures plus their render-target
/// views, rebuilt on resize. Present failures are classified so device loss
/// surfaces as the fatal channel.
pub struct Swapchain {
    device: Device,
    rtv_heap: OfflineDescriptorHeap,
    raw: dx::Swapchain3,
    desc: SwapchainDesc,

    back_buffers: Vec<Texture>,
    back_buffer_views: Vec<RenderTargetView>,
    current_index: usize,
}

impl Swapchain {
    pub(crate) fn inner_new(
        device: Device,
        rtv_heap: OfflineDescriptorHeap,
        context: &CommandContext,
        hwnd: NonZeroIsize,
        desc: SwapchainDesc,
    ) -> RhiResult<Self> {
        let raw_desc = dx::SwapchainDesc1::new(desc.width, desc.height)
            .with_format(desc.format)
            .with_buffer_count(desc.buffer_count)
            .with_usage(dx::FrameBufferUsage::RenderTargetOutput)
            .with_swap_effect(dx::SwapEffect::FlipDiscard);

        let raw: dx::Swapchain1 = device
            .factory
            .create_swapchain_for_hwnd(context.queue(), hwnd, &raw_desc, None, dx::OUTPUT_NONE)
            .map_err(|e| RhiError::creation("swapchain", e))?;
        let raw: dx::Swapchain3 = raw
            .try_into()
            .map_err(|_| RhiError::Unsupported("IDXGISwapChain3"))?;

        let mut swapchain = Self {
            device,
            rtv_heap,
            raw,
            desc,
            back_buffers: Vec::new(),
            back_buffer_views: Vec::new(),
            current_index: 0,
        };
        swapchain.acquire_back_buffers()?;

        info!(
            target: "rhi::swapchain",
            width = swapchain.desc.width,
            height = swapchain.desc.height,
            buffers = swapchain.desc.buffer_count,
            "created swapchain"
        );

        Ok(swapchain)
    }

    fn acquire_back_buffers(&mut self) -> RhiResult<()> {
        for i in 0..self.desc.buffer_count {
            let raw = self
                .raw
                .get_buffer(i)
                .map_err(|e| RhiError::creation("swapchain back buffer", e))?;

            let resource = Resource::from_raw(
                raw,
                HeapKind::Default,
                ResourceStates::Present,
                0,
                false,
            );
            let texture = Texture::from_resource(
                resource,
                TextureDesc::texture_2d(self.desc.width, self.desc.height, self.desc.format)
                    .with_usage(TextureUsage::RenderTarget),
            );

            let view =
                RenderTargetView::inner_new(&self.device, &self.rtv_heap, texture.resource(), None)?;

            self.back_buffers.push(texture);
            self.back_buffer_views.push(view);
        }

        self.current_index = self.raw.get_current_back_buffer_index() as usize;
        Ok(())
    }

    pub fn back_buffer(&self) -> &Texture {
        &self.back_buffers[self.current_index]
    }

    pub fn back_buffer_view(&self) -> &RenderTargetView {
        &self.back_buffer_views[self.current_index]
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn present(&mut self, vsync: bool) -> RhiResult<()> {
        let interval = if vsync { 1 } else { 0 };

        if let Err(e) = self.raw.present(interval, dx::PresentFlags::empty()) {
            return Err(self.device.classify_failure("present", e));
        }

        self.current_index = self.raw.get_current_back_buffer_index() as usize;
        Ok(())
    }

    /// Drops every back-buffer reference, resizes, and reacquires. The
    /// caller must have flushed the context first so the GPU holds no
    /// references either.
    pub fn resize(&mut self, context: &mut CommandContext, width: u32, height: u32) -> RhiResult<()> {
        if width == self.desc.width && height == self.desc.height {
            return Ok(());
        }

        context.flush()?;

        self.back_buffer_views.clear();
        self.back_buffers.clear();

        self.raw
            .resize_buffers(
                self.desc.buffer_count,
                width,
                height,
                self.desc.format,
                dx::SwapchainFlags::empty(),
            )
            .map_err(|e| self.device.classify_failure("resize buffers", e))?;

        self.desc.width = width;
        self.desc.height = height;
        self.acquire_back_buffers()
    }
}
