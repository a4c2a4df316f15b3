use oxidx::dx::DxError;

pub type RhiResult<T> = Result<T, RhiError>;

/// Failure channels of the RHI. Everything here is surfaced to the caller;
/// `DeviceRemoved` is fatal and is only returned after the breadcrumb dump
/// has been written.
#[derive(Debug, thiserror::Error)]
pub enum RhiError {
    #[error("failed to create {what}: {source}")]
    Creation {
        what: &'static str,
        #[source]
        source: DxError,
    },

    #[error("offline descriptor heap exhausted and growth failed")]
    OutOfDescriptors,

    #[error("command list {op} failed: {source}")]
    CommandListFailure {
        op: &'static str,
        #[source]
        source: DxError,
    },

    #[error("device removed")]
    DeviceRemoved,

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
}

impl RhiError {
    pub(crate) fn creation(what: &'static str, source: DxError) -> Self {
        RhiError::Creation { what, source }
    }
}
