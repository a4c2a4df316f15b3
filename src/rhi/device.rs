use std::{io::Write, ops::Deref, sync::Arc};

use oxidx::dx;
use tracing::{error, info, warn};
use windows::core::Interface;
use windows::Win32::Graphics::Direct3D12::{
    ID3D12DeviceRemovedExtendedData, D3D12_AUTO_BREADCRUMB_NODE,
    D3D12_DRED_AUTO_BREADCRUMBS_OUTPUT,
};

use super::error::{RhiError, RhiResult};

const DEVICE_REMOVED_DUMP_FILE: &str = "D3D12DeviceRemovedDump.txt";

#[derive(Clone, Debug)]
pub struct Device(Arc<DeviceInner>);

#[derive(Debug)]
pub struct DeviceInner {
    name: String,
    pub(crate) factory: dx::Factory4,
    #[allow(dead_code)]
    adapter: dx::Adapter3,
    pub(crate) raw: dx::Device,

    raytracing_tier: dx::RaytracingTier,
}

impl Deref for Device {
    type Target = DeviceInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Device {
    pub fn new(factory: dx::Factory4, adapter: dx::Adapter3) -> RhiResult<Self> {
        let name = adapter
            .get_desc1()
            .map(|desc| desc.description())
            .unwrap_or_default();

        let raw: dx::Device = dx::create_device(Some(&adapter), dx::FeatureLevel::Level11)
            .map_err(|e| RhiError::creation("device", e))?;

        let mut options5 = dx::features::Options5Feature::default();
        let raytracing_tier = match raw.check_feature_support(&mut options5) {
            Ok(()) => options5.raytracing_tier(),
            Err(_) => dx::RaytracingTier::NotSupported,
        };

        info!(target: "rhi::device", adapter = %name, ?raytracing_tier, "created device");

        Ok(Self(Arc::new(DeviceInner {
            name,
            factory,
            adapter,
            raw,
            raytracing_tier,
        })))
    }

    pub fn adapter_name(&self) -> &str {
        &self.name
    }

    pub fn is_ray_tracing_supported(&self) -> bool {
        self.raytracing_tier != dx::RaytracingTier::NotSupported
    }

    pub fn descriptor_increment_size(&self, ty: dx::DescriptorHeapType) -> usize {
        self.raw.get_descriptor_handle_increment_size(ty) as usize
    }

    /// Returns whether the device has been removed. Called after a failed
    /// command-list `reset`/`close` or `Present` to tell real device loss
    /// apart from ordinary API failures.
    pub fn is_removed(&self) -> bool {
        self.raw.get_device_removed_reason().is_err()
    }

    /// Classifies a failed per-frame call: on device loss, dumps the
    /// breadcrumb history and returns the fatal error; otherwise wraps the
    /// original failure.
    pub(crate) fn classify_failure(&self, op: &'static str, source: dx::DxError) -> RhiError {
        if self.is_removed() {
            self.report_removal();
            RhiError::DeviceRemoved
        } else {
            error!(target: "rhi::device", op, %source, "command list failure");
            RhiError::CommandListFailure { op, source }
        }
    }

    /// Writes the DRED auto-breadcrumb command history to
    /// `D3D12DeviceRemovedDump.txt` and mirrors it to the log. Best effort:
    /// DRED may not have been enabled, in which case only the removal itself
    /// is reported.
    pub fn report_removal(&self) {
        error!(target: "rhi::device", adapter = %self.name, "device removed");

        let device = &self.raw.0;
        let Ok(dred) = device.cast::<ID3D12DeviceRemovedExtendedData>() else {
            warn!(target: "rhi::device", "DRED interface unavailable, no breadcrumb dump");
            return;
        };

        let mut breadcrumbs = D3D12_DRED_AUTO_BREADCRUMBS_OUTPUT::default();
        if unsafe { dred.GetAutoBreadcrumbsOutput(&mut breadcrumbs) }.is_err() {
            warn!(target: "rhi::device", "no DRED breadcrumb output available");
            return;
        }

        let mut file = std::fs::File::create(DEVICE_REMOVED_DUMP_FILE).ok();
        let mut emit = |line: &str| {
            error!(target: "rhi::device", "{line}");
            if let Some(file) = file.as_mut() {
                let _ = writeln!(file, "{line}");
            }
        };

        emit("device removed");

        let mut node = breadcrumbs.pHeadAutoBreadcrumbNode;
        while !node.is_null() {
            let current: &D3D12_AUTO_BREADCRUMB_NODE = unsafe { &*node };

            emit("breadcrumbs:");
            let completed = unsafe {
                current
                    .pLastBreadcrumbValue
                    .as_ref()
                    .copied()
                    .unwrap_or_default()
            };
            for i in 0..current.BreadcrumbCount {
                let op = unsafe { *current.pCommandHistory.add(i as usize) };
                let marker = if i < completed { "  " } else { "! " };
                emit(&format!("  {marker}{}", breadcrumb_op_name(op.0)));
            }

            node = current.pNext;
        }
    }
}

fn breadcrumb_op_name(op: i32) -> String {
    // Common subset of D3D12_AUTO_BREADCRUMB_OP; anything else is dumped
    // numerically.
    let name = match op {
        0 => "SETMARKER",
        1 => "BEGINEVENT",
        2 => "ENDEVENT",
        3 => "DRAWINSTANCED",
        4 => "DRAWINDEXEDINSTANCED",
        5 => "EXECUTEINDIRECT",
        6 => "DISPATCH",
        7 => "COPYBUFFERREGION",
        8 => "COPYTEXTUREREGION",
        9 => "COPYRESOURCE",
        10 => "COPYTILES",
        11 => "RESOLVESUBRESOURCE",
        12 => "CLEARRENDERTARGETVIEW",
        13 => "CLEARUNORDEREDACCESSVIEW",
        14 => "CLEARDEPTHSTENCILVIEW",
        15 => "RESOURCEBARRIER",
        16 => "EXECUTEBUNDLE",
        17 => "PRESENT",
        18 => "RESOLVEQUERYDATA",
        23 => "BUILDRAYTRACINGACCELERATIONSTRUCTURE",
        25 => "COPYRAYTRACINGACCELERATIONSTRUCTURE",
        26 => "DISPATCHRAYS",
        _ => return format!("OP({op})"),
    };

    name.to_string()
}

#[cfg(test)]
#[allow(unused)]
mod tests {
    use super::Device;

    const fn is_send_sync<T: Send + Sync>() {}

    const _: () = is_send_sync::<Device>();

    #[test]
    fn unknown_breadcrumb_ops_format_numerically() {
        assert_eq!(super::breadcrumb_op_name(6), "DISPATCH");
        assert_eq!(super::breadcrumb_op_name(999), "OP(999)");
    }
}
