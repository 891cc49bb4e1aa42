//! Convolution compute backends
//!
//! A backend owns the shape-dependent state needed to run the three
//! convolution products (forward, weight gradient, input gradient) and
//! reports how much shared scratch memory it needs for them. Layers hold a
//! `Box<dyn ConvBackend>` chosen at construction, so swapping the portable
//! path for an accelerated one never changes a call site.
//!
//! - `PortableBackend`: unfold + matrix multiply on the host
//! - `AcceleratedBackend`: delegates to an external `ConvAccelerator` bound
//!   through an explicit `DeviceContext`

pub mod accelerated;
pub mod portable;

use std::sync::Arc;

use crate::error::Result;
use crate::shape::ConvShape;

pub use accelerated::{
    AcceleratedBackend, AcceleratorError, AlgorithmSet, ConvAccelerator, ConvDescriptor,
    DeviceContext,
};
pub use portable::PortableBackend;

/// Compute contract shared by every convolution backend.
///
/// All buffers are caller-owned. `workspace` is the graph's shared scratch
/// buffer; it must hold at least `workspace_size()` bytes and is assumed to be
/// exclusively borrowed for the duration of one call.
pub trait ConvBackend: Send {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Geometry the backend is currently configured for.
    fn shape(&self) -> &ConvShape;

    /// Re-derive shape-dependent state after the owning layer was resized.
    fn reshape(&mut self, shape: &ConvShape) -> Result<()>;

    /// Scratch bytes required by `forward`/`backward` for the current shape.
    fn workspace_size(&self) -> usize;

    /// Accumulate `weights ⊛ input` into `output` (`batch × n × out_h × out_w`).
    ///
    /// `output` is expected to be zeroed by the caller.
    fn forward(
        &self,
        input: &[f32],
        weights: &[f32],
        workspace: &mut [f32],
        output: &mut [f32],
    ) -> Result<()>;

    /// Accumulate the weight gradient into `weight_updates` and, when a
    /// destination is supplied, add the input gradient into `input_delta`.
    ///
    /// `delta` is the gradient with respect to the pre-activation output.
    #[allow(clippy::too_many_arguments)]
    fn backward(
        &self,
        input: &[f32],
        delta: &[f32],
        weights: &[f32],
        workspace: &mut [f32],
        weight_updates: &mut [f32],
        input_delta: Option<&mut [f32]>,
    ) -> Result<()>;
}

/// Backend selection made when a layer is constructed.
#[derive(Clone, Default)]
pub enum BackendChoice {
    /// Host unfold + matrix multiply.
    #[default]
    Portable,
    /// External accelerator reached through a shared device context.
    Accelerated(Arc<DeviceContext>),
}

impl BackendChoice {
    /// Build the backend for `shape`.
    ///
    /// An accelerator that fails to bind is reported and replaced by the
    /// portable path, so the returned backend is always fully initialized.
    pub fn build(&self, shape: &ConvShape) -> Box<dyn ConvBackend> {
        match self {
            BackendChoice::Portable => Box::new(PortableBackend::new(*shape)),
            BackendChoice::Accelerated(context) => {
                match AcceleratedBackend::bind(Arc::clone(context), shape) {
                    Ok(backend) => Box::new(backend),
                    Err(err) => {
                        tracing::warn!(
                            device = context.device_index(),
                            error = %err,
                            "accelerated convolution unavailable, using portable path"
                        );
                        Box::new(PortableBackend::new(*shape))
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for BackendChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendChoice::Portable => f.write_str("Portable"),
            BackendChoice::Accelerated(context) => f
                .debug_tuple("Accelerated")
                .field(&context.device_index())
                .finish(),
        }
    }
}
