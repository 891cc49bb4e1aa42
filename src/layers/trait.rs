//! Layer trait implemented by the convolution and channel-shuffle layers
//!
//! The owning graph drives every layer through this interface: it allocates a
//! shared workspace sized to the largest `workspace_size()` of all layers,
//! calls `forward` in order, writes upstream gradients into `delta_mut()`,
//! calls `backward` in reverse order, and periodically calls `update`.

use crate::config::UpdateArgs;
use crate::error::Result;

/// Core trait for layers driven by an owning network graph.
///
/// # Example
///
/// ```ignore
/// layer.forward(&input, workspace.as_mut_slice())?;
///
/// // ... the next layer writes dL/d(output) into layer.delta_mut() ...
/// layer.backward(&input, workspace.as_mut_slice(), Some(&mut input_delta))?;
/// layer.update(&UpdateArgs::sgd(0.1, 0.9, 0.0005, batch));
/// ```
pub trait Layer {
    /// Forward propagation; results land in the layer's output buffer.
    ///
    /// `input` is `batch × inputs()`. `workspace` must provide at least
    /// `workspace_size()` bytes.
    fn forward(&mut self, input: &[f32], workspace: &mut [f32]) -> Result<()>;

    /// Backward propagation from the gradient currently held in `delta_mut()`.
    ///
    /// Parameter gradients are accumulated, never overwritten. When
    /// `input_delta` is supplied, the gradient w.r.t. `input` is added into it.
    fn backward(
        &mut self,
        input: &[f32],
        workspace: &mut [f32],
        input_delta: Option<&mut [f32]>,
    ) -> Result<()>;

    /// Apply one parameter step from the accumulated gradients.
    fn update(&mut self, args: &UpdateArgs);

    /// Change the input spatial extent, reallocating output-sized buffers.
    fn resize(&mut self, width: usize, height: usize) -> Result<()>;

    /// Output buffer from the last forward pass (`batch × outputs()`).
    fn output(&self) -> &[f32];

    /// Gradient buffer w.r.t. the output; upstream layers write into it.
    fn delta_mut(&mut self) -> &mut [f32];

    /// Elements of one input sample.
    fn inputs(&self) -> usize;

    /// Elements of one output sample.
    fn outputs(&self) -> usize;

    fn batch(&self) -> usize;

    /// Scratch bytes the layer needs on every forward/backward call.
    fn workspace_size(&self) -> usize;

    /// Number of trainable parameters.
    fn parameter_count(&self) -> usize;
}
