use thiserror::Error;

use crate::pipeline::PipelineState;

pub type Result<T> = std::result::Result<T, ExportError>;

/// Errors reported back to the caller of [`crate::pipeline::VideoExporter`].
///
/// Encode failures and inconclusive capability probes never show up here: the
/// former go to the error callback, the latter silently select the fallback
/// container.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("video encoding is not available in this environment")]
    UnsupportedEnvironment,

    #[error("invalid export settings: {0}")]
    InvalidSettings(String),

    #[error("{operation} is not allowed in state {state:?}")]
    Misuse {
        operation: &'static str,
        state: PipelineState,
    },

    #[error("pipeline was closed")]
    Closed,

    #[error("encoder configuration failed: {0:#}")]
    Configure(#[source] anyhow::Error),

    #[error("container finalization failed: {0:#}")]
    Mux(#[source] anyhow::Error),
}

impl ExportError {
    pub(crate) fn misuse(operation: &'static str, state: PipelineState) -> Self {
        ExportError::Misuse { operation, state }
    }

    pub fn is_misuse(&self) -> bool {
        matches!(self, ExportError::Misuse { .. })
    }
}
