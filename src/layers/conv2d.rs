//! Grouped 2D convolutional layer
//!
//! `ConvLayer` owns the parameters, gradient accumulators, optional
//! batch-norm and quantization state, and the output/delta buffers of one
//! convolution. The heavy products are delegated to a `ConvBackend` chosen at
//! construction; scratch memory is always supplied by the caller.
//!
//! Gradient buffers follow the descent-direction convention: `delta` holds the
//! negative loss gradient w.r.t. the output, so `update` *adds* the scaled
//! accumulators to the parameters.

use crate::backend::{BackendChoice, ConvBackend, PortableBackend};
use crate::config::{ConvLayerConfig, UpdateArgs};
use crate::error::{check_len, check_workspace, ConvError, Result};
use crate::layers::batchnorm::{ConvBatchNorm, BN_EPSILON};
use crate::layers::Layer;
use crate::quantization::{binarize_input, binarize_weights, Quantization};
use crate::shape::ConvShape;
use crate::utils::blas::{add_bias, axpy, backward_bias, fill, scal};
use crate::utils::{activate_array, gradient_array, Activation, SimpleRng};

/// First/second-moment buffers for adaptive-moment updates.
#[derive(Debug, Clone)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
    bias_m: Vec<f32>,
    bias_v: Vec<f32>,
    scale_m: Vec<f32>,
    scale_v: Vec<f32>,
}

impl Moments {
    fn new(nweights: usize, n: usize) -> Self {
        Self {
            m: vec![0.0f32; nweights],
            v: vec![0.0f32; nweights],
            bias_m: vec![0.0f32; n],
            bias_v: vec![0.0f32; n],
            scale_m: vec![0.0f32; n],
            scale_v: vec![0.0f32; n],
        }
    }
}

/// 2D convolutional layer with grouped filters.
///
/// # Fields
///
/// * `weights` - Filters (`n × c/groups × size × size`)
/// * `biases` - Per-output-channel bias (`n`)
/// * `weight_updates`, `bias_updates` - Gradient accumulators, same shapes
/// * `binary_weights` - Binarized shadow of `weights` (quantized modes only)
/// * `binary_input` - Binarized shadow of the input (XNOR only)
/// * `output`, `delta` - Output activations and their gradient (`batch × outputs`)
///
/// # Example
///
/// ```
/// use convnet_core::config::ConvLayerConfig;
/// use convnet_core::layers::ConvLayer;
/// use convnet_core::utils::SimpleRng;
///
/// # fn main() -> convnet_core::Result<()> {
/// let mut rng = SimpleRng::new(42);
/// let config = ConvLayerConfig::new(1, 28, 28, 8, 16, 3).with_pad(1).with_groups(2);
/// let layer = ConvLayer::new(&config, &mut rng)?;
/// assert_eq!(layer.out_h(), 28);
/// # Ok(())
/// # }
/// ```
pub struct ConvLayer {
    shape: ConvShape,
    activation: Activation,
    quantization: Quantization,
    learning_rate_scale: f32,
    training: bool,

    weights: Vec<f32>,
    weight_updates: Vec<f32>,
    biases: Vec<f32>,
    bias_updates: Vec<f32>,

    binary_weights: Vec<f32>,
    binary_input: Vec<f32>,

    batch_norm: Option<ConvBatchNorm>,
    moments: Option<Moments>,

    output: Vec<f32>,
    delta: Vec<f32>,

    backend: Box<dyn ConvBackend>,
}

impl ConvLayer {
    /// Create a layer on the portable backend.
    ///
    /// Weights are drawn from `N(0, 1)` scaled by `sqrt(2 / (size² · c))`,
    /// biases start at zero.
    pub fn new(config: &ConvLayerConfig, rng: &mut SimpleRng) -> Result<Self> {
        Self::with_backend(config, BackendChoice::Portable, rng)
    }

    /// Create a layer on the given backend.
    ///
    /// The config is validated before anything is allocated. An accelerated
    /// backend that fails to bind is replaced by the portable one.
    pub fn with_backend(
        config: &ConvLayerConfig,
        backend: BackendChoice,
        rng: &mut SimpleRng,
    ) -> Result<Self> {
        config.validate()?;
        let quantization = config.quantization()?;
        let shape = config.shape();

        let nweights = shape.nweights();
        let n = shape.n;
        let out_len = shape.batch * shape.outputs();

        let mut weights = vec![0.0f32; nweights];
        let scale = (2.0f32 / (shape.size * shape.size * shape.c) as f32).sqrt();
        rng.fill_gaussian(&mut weights, scale);

        let binary_weights = if quantization.binarizes_weights() {
            vec![0.0f32; nweights]
        } else {
            Vec::new()
        };
        let binary_input = if quantization.binarizes_input() {
            vec![0.0f32; shape.batch * shape.inputs()]
        } else {
            Vec::new()
        };

        let backend = backend.build(&shape);

        tracing::debug!(
            backend = backend.name(),
            workspace = backend.workspace_size(),
            "conv  {:5} {:2} x{:2} /{:2}  {:4} x{:4} x{:4}   ->  {:4} x{:4} x{:4}",
            n,
            shape.size,
            shape.size,
            shape.stride,
            shape.w,
            shape.h,
            shape.c,
            shape.out_w(),
            shape.out_h(),
            shape.out_c()
        );

        Ok(Self {
            shape,
            activation: config.activation,
            quantization,
            learning_rate_scale: config.learning_rate_scale,
            training: true,
            weights,
            weight_updates: vec![0.0f32; nweights],
            biases: vec![0.0f32; n],
            bias_updates: vec![0.0f32; n],
            binary_weights,
            binary_input,
            batch_norm: config
                .batch_normalize
                .then(|| ConvBatchNorm::new(n, out_len)),
            moments: config.adam.then(|| Moments::new(nweights, n)),
            output: vec![0.0f32; out_len],
            delta: vec![0.0f32; out_len],
            backend,
        })
    }

    /// Rebind the layer to another backend without touching its parameters.
    pub fn set_backend(&mut self, backend: BackendChoice) {
        self.backend = backend.build(&self.shape);
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn shape(&self) -> &ConvShape {
        &self.shape
    }

    pub fn out_h(&self) -> usize {
        self.shape.out_h()
    }

    pub fn out_w(&self) -> usize {
        self.shape.out_w()
    }

    pub fn out_c(&self) -> usize {
        self.shape.out_c()
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn quantization(&self) -> Quantization {
        self.quantization
    }

    /// Switch between batch statistics (training) and rolling statistics.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn learning_rate_scale(&self) -> f32 {
        self.learning_rate_scale
    }

    pub fn set_learning_rate_scale(&mut self, scale: f32) {
        self.learning_rate_scale = scale;
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    pub fn biases_mut(&mut self) -> &mut [f32] {
        &mut self.biases
    }

    pub fn weight_updates(&self) -> &[f32] {
        &self.weight_updates
    }

    pub fn weight_updates_mut(&mut self) -> &mut [f32] {
        &mut self.weight_updates
    }

    pub fn bias_updates(&self) -> &[f32] {
        &self.bias_updates
    }

    pub fn bias_updates_mut(&mut self) -> &mut [f32] {
        &mut self.bias_updates
    }

    pub fn batch_norm(&self) -> Option<&ConvBatchNorm> {
        self.batch_norm.as_ref()
    }

    pub fn batch_norm_mut(&mut self) -> Option<&mut ConvBatchNorm> {
        self.batch_norm.as_mut()
    }

    /// Binarized weight shadow from the last quantized forward pass.
    pub fn binary_weights(&self) -> Option<&[f32]> {
        self.quantization
            .binarizes_weights()
            .then_some(self.binary_weights.as_slice())
    }

    pub fn has_moments(&self) -> bool {
        self.moments.is_some()
    }

    pub fn delta(&self) -> &[f32] {
        &self.delta
    }

    /// Weights of output filter `i` (`c/groups × size × size`).
    ///
    /// # Panics
    ///
    /// Panics if `i >= n`.
    pub fn filter(&self, i: usize) -> &[f32] {
        let len = self.shape.filter_len();
        &self.weights[i * len..(i + 1) * len]
    }

    /// Reset every gradient accumulator to zero.
    ///
    /// `backward` only ever adds into these buffers; call this at the start of
    /// a fresh step when gradients must not carry over.
    pub fn zero_gradients(&mut self) {
        fill(&mut self.weight_updates, 0.0);
        fill(&mut self.bias_updates, 0.0);
        if let Some(bn) = self.batch_norm.as_mut() {
            fill(&mut bn.scale_updates, 0.0);
        }
    }

    /// Copy `upstream` into the delta buffer, then run `backward`.
    pub fn backward_from(
        &mut self,
        upstream: &[f32],
        input: &[f32],
        workspace: &mut [f32],
        input_delta: Option<&mut [f32]>,
    ) -> Result<()> {
        check_len("upstream gradient", self.delta.len(), upstream.len())?;
        self.check_backward_buffers(input, workspace, input_delta.as_deref())?;
        self.delta.copy_from_slice(upstream);
        self.conv_backward(input, workspace, input_delta)
    }

    /// Reject a backward call before any gradient buffer is touched.
    fn check_backward_buffers(
        &self,
        input: &[f32],
        workspace: &[f32],
        input_delta: Option<&[f32]>,
    ) -> Result<()> {
        let s = &self.shape;
        check_len("input", s.batch * s.inputs(), input.len())?;
        check_workspace(self.backend.workspace_size(), workspace)?;
        if let Some(dst) = input_delta {
            check_len("input delta", s.batch * s.inputs(), dst.len())?;
        }
        Ok(())
    }

    fn conv_forward(&mut self, input: &[f32], workspace: &mut [f32]) -> Result<()> {
        let s = self.shape;
        check_len("input", s.batch * s.inputs(), input.len())?;
        fill(&mut self.output, 0.0);

        if self.quantization.binarizes_weights() {
            binarize_weights(&self.weights, s.n, s.filter_len(), &mut self.binary_weights);
        }
        let effective_input: &[f32] = if self.quantization.binarizes_input() {
            binarize_input(input, s.batch, s.inputs(), &mut self.binary_input);
            &self.binary_input
        } else {
            input
        };
        let effective_weights: &[f32] = if self.quantization.binarizes_weights() {
            &self.binary_weights
        } else {
            &self.weights
        };

        tracing::trace!(
            backend = self.backend.name(),
            workspace_bytes = std::mem::size_of_val(&*workspace),
            "conv forward"
        );
        self.backend
            .forward(effective_input, effective_weights, workspace, &mut self.output)?;

        match self.batch_norm.as_mut() {
            Some(bn) => bn.forward(&mut self.output, &self.biases, s.out_spatial(), self.training),
            None => add_bias(&mut self.output, &self.biases, s.n, s.out_spatial()),
        }

        activate_array(&mut self.output, self.activation);
        Ok(())
    }

    fn conv_backward(
        &mut self,
        input: &[f32],
        workspace: &mut [f32],
        input_delta: Option<&mut [f32]>,
    ) -> Result<()> {
        self.check_backward_buffers(input, workspace, input_delta.as_deref())?;
        let s = self.shape;

        gradient_array(&self.output, self.activation, &mut self.delta);

        match self.batch_norm.as_mut() {
            Some(bn) => bn.backward(
                &mut self.delta,
                &mut self.bias_updates,
                s.out_spatial(),
                self.training,
            ),
            None => backward_bias(&mut self.bias_updates, &self.delta, s.n, s.out_spatial()),
        }

        self.backend.backward(
            input,
            &self.delta,
            &self.weights,
            workspace,
            &mut self.weight_updates,
            input_delta,
        )
    }

    fn sgd_update(&mut self, args: &UpdateArgs, learning_rate: f32) {
        let batch = args.batch as f32;
        let step = learning_rate / batch;

        axpy(step, &self.bias_updates, &mut self.biases);
        scal(args.momentum, &mut self.bias_updates);

        if let Some(bn) = self.batch_norm.as_mut() {
            axpy(step, &bn.scale_updates, &mut bn.scales);
            scal(args.momentum, &mut bn.scale_updates);
        }

        // Decay enters the accumulator before the step and before momentum.
        axpy(-args.decay * batch, &self.weights, &mut self.weight_updates);
        axpy(step, &self.weight_updates, &mut self.weights);
        scal(args.momentum, &mut self.weight_updates);
    }

    fn conv_resize(&mut self, width: usize, height: usize) -> Result<()> {
        let shape = self.shape.with_spatial(width, height);
        shape.validate()?;
        self.shape = shape;

        let out_len = shape.batch * shape.outputs();
        self.output = vec![0.0f32; out_len];
        self.delta = vec![0.0f32; out_len];
        if let Some(bn) = self.batch_norm.as_mut() {
            bn.resize(out_len);
        }
        if self.quantization.binarizes_input() {
            self.binary_input = vec![0.0f32; shape.batch * shape.inputs()];
        }

        if let Err(err) = self.backend.reshape(&shape) {
            tracing::warn!(
                backend = self.backend.name(),
                error = %err,
                "backend rebind failed after resize, using portable path"
            );
            self.backend = Box::new(PortableBackend::new(shape));
        }

        tracing::debug!(
            width,
            height,
            out_w = shape.out_w(),
            out_h = shape.out_h(),
            workspace = self.backend.workspace_size(),
            "resized conv layer"
        );
        Ok(())
    }

    /// Fold the rolling batch-norm statistics into weights and biases.
    ///
    /// Afterwards scales are 1, rolling mean 0 and rolling variance 1, so
    /// inference output is unchanged up to the variance epsilon.
    pub fn denormalize(&mut self) -> Result<()> {
        let filter_len = self.shape.filter_len();
        let bn = self.batch_norm.as_mut().ok_or_else(|| {
            ConvError::InvalidConfig("denormalize requires a batch-normalized layer".into())
        })?;

        for i in 0..self.shape.n {
            let scale = bn.scales[i] / (bn.rolling_variance[i] + BN_EPSILON).sqrt();
            self.weights[i * filter_len..(i + 1) * filter_len]
                .iter_mut()
                .for_each(|w| *w *= scale);
            self.biases[i] -= bn.rolling_mean[i] * scale;
            bn.scales[i] = 1.0;
            bn.rolling_mean[i] = 0.0;
            bn.rolling_variance[i] = 1.0;
        }
        tracing::debug!(filters = self.shape.n, "folded batch norm into weights");
        Ok(())
    }

    /// Swap the first and third input channel of every 3-channel filter
    /// (RGB <-> BGR).
    pub fn swap_rgb_filters(&mut self) {
        if self.shape.group_in() != 3 {
            return;
        }
        let plane = self.shape.size * self.shape.size;
        for filter in self.weights.chunks_exact_mut(3 * plane) {
            let (red, rest) = filter.split_at_mut(plane);
            red.swap_with_slice(&mut rest[plane..]);
        }
    }

    /// Scale every 3-channel filter by `scale` and shift its bias by
    /// `trans` times the scaled filter sum.
    pub fn rescale_filters(&mut self, scale: f32, trans: f32) {
        if self.shape.group_in() != 3 {
            return;
        }
        let filter_len = self.shape.filter_len();
        for (filter, bias) in self
            .weights
            .chunks_exact_mut(filter_len)
            .zip(self.biases.iter_mut())
        {
            filter.iter_mut().for_each(|w| *w *= scale);
            *bias += filter.iter().sum::<f32>() * trans;
        }
    }
}

/// One adaptive-moment step on a parameter buffer.
///
/// `updates` holds the accumulated descent direction and is cleared.
fn adam_update(
    params: &mut [f32],
    updates: &mut [f32],
    m: &mut [f32],
    v: &mut [f32],
    args: &UpdateArgs,
    learning_rate: f32,
) {
    let batch = args.batch as f32;
    scal(args.b1, m);
    scal(args.b2, v);
    axpy(-args.decay * batch, params, updates);

    for ((mi, vi), &g) in m.iter_mut().zip(v.iter_mut()).zip(updates.iter()) {
        *mi += (1.0 - args.b1) * g;
        *vi += (1.0 - args.b2) * g * g;
    }

    let t = args.t.max(1) as i32;
    let m_correction = 1.0 - args.b1.powi(t);
    let v_correction = 1.0 - args.b2.powi(t);
    for ((p, &mi), &vi) in params.iter_mut().zip(m.iter()).zip(v.iter()) {
        let m_hat = mi / m_correction;
        let v_hat = vi / v_correction;
        *p += learning_rate * m_hat / (v_hat.sqrt() + args.eps);
    }
    fill(updates, 0.0);
}

impl Layer for ConvLayer {
    /// Zero the output, convolve (with binarized weights/input when
    /// quantized), add bias or run batch norm, then activate.
    fn forward(&mut self, input: &[f32], workspace: &mut [f32]) -> Result<()> {
        self.conv_forward(input, workspace)
    }

    /// Activation gradient, bias (or batch-norm) gradient, then weight and
    /// optional input gradient. All accumulators are added into.
    fn backward(
        &mut self,
        input: &[f32],
        workspace: &mut [f32],
        input_delta: Option<&mut [f32]>,
    ) -> Result<()> {
        self.conv_backward(input, workspace, input_delta)
    }

    /// Momentum SGD, or an adaptive-moment step when requested and the layer
    /// carries moment buffers. Arguments that fail `UpdateArgs::validate` are
    /// logged and the step is skipped.
    fn update(&mut self, args: &UpdateArgs) {
        if let Err(err) = args.validate() {
            tracing::warn!(error = %err, "skipping conv update");
            return;
        }
        let learning_rate = args.learning_rate * self.learning_rate_scale;

        if !args.adam {
            self.sgd_update(args, learning_rate);
            return;
        }
        let Some(moments) = self.moments.as_mut() else {
            tracing::debug!("adaptive-moment update requested without moment buffers, using SGD");
            self.sgd_update(args, learning_rate);
            return;
        };

        adam_update(
            &mut self.biases,
            &mut self.bias_updates,
            &mut moments.bias_m,
            &mut moments.bias_v,
            args,
            learning_rate,
        );
        if let Some(bn) = self.batch_norm.as_mut() {
            adam_update(
                &mut bn.scales,
                &mut bn.scale_updates,
                &mut moments.scale_m,
                &mut moments.scale_v,
                args,
                learning_rate,
            );
        }
        adam_update(
            &mut self.weights,
            &mut self.weight_updates,
            &mut moments.m,
            &mut moments.v,
            args,
            learning_rate,
        );
    }

    fn resize(&mut self, width: usize, height: usize) -> Result<()> {
        self.conv_resize(width, height)
    }

    fn output(&self) -> &[f32] {
        &self.output
    }

    fn delta_mut(&mut self) -> &mut [f32] {
        &mut self.delta
    }

    fn inputs(&self) -> usize {
        self.shape.inputs()
    }

    fn outputs(&self) -> usize {
        self.shape.outputs()
    }

    fn batch(&self) -> usize {
        self.shape.batch
    }

    fn workspace_size(&self) -> usize {
        self.backend.workspace_size()
    }

    /// Weights + biases, plus batch-norm scales when present.
    fn parameter_count(&self) -> usize {
        let scales = if self.batch_norm.is_some() { self.shape.n } else { 0 };
        self.weights.len() + self.biases.len() + scales
    }
}
