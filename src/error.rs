//! Error type shared by every layer and backend in the crate.

use thiserror::Error;

/// Errors surfaced by layer construction, the forward/backward passes and the
/// backend bindings.
#[derive(Error, Debug)]
pub enum ConvError {
    /// A layer configuration violates a shape or flag invariant. Raised before
    /// any buffer is allocated.
    #[error("invalid layer configuration: {0}")]
    InvalidConfig(String),

    #[error("{what} length mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("workspace too small: layer needs {required} bytes, caller provided {provided}")]
    WorkspaceTooSmall { required: usize, provided: usize },

    /// Descriptor setup, algorithm selection or compute failure reported by an
    /// accelerated backend.
    #[error("accelerated backend failure: {0}")]
    Backend(String),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ConvError>;

/// Check a caller-supplied buffer against the length the layer expects.
pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(ConvError::ShapeMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Check that a workspace slice of `f32` holds at least `required` bytes.
pub(crate) fn check_workspace(required: usize, workspace: &[f32]) -> Result<()> {
    let provided = std::mem::size_of_val(workspace);
    if provided < required {
        return Err(ConvError::WorkspaceTooSmall { required, provided });
    }
    Ok(())
}
