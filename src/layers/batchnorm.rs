//! Batch normalization hook for convolution outputs
//!
//! When a convolution layer is built with batch normalization, this hook
//! replaces the plain bias add in the forward pass and the plain bias
//! gradient in the backward pass. Statistics are per output channel, pooled
//! over the batch and every spatial position:
//!
//! 1. Compute batch statistics: mean μ and variance σ² per channel
//! 2. Normalize: x_norm = (x - μ) / sqrt(σ² + ε)
//! 3. Scale and shift: y = scale * x_norm + bias
//!
//! During training the rolling statistics follow an exponential moving average
//! and are used in place of batch statistics during inference.
//!
//! # References
//!
//! Ioffe, S., & Szegedy, C. (2015). Batch Normalization: Accelerating Deep Network Training
//! by Reducing Internal Covariate Shift. ICML.

use crate::utils::blas::{add_bias, axpy, backward_bias, scal, scale_bias};

/// Variance epsilon used by normalization and its gradient.
pub const BN_EPSILON: f32 = 1e-5;

/// Weight of the previous rolling value in the moving average.
const ROLLING_MOMENTUM: f32 = 0.99;

/// Per-channel batch-norm state owned by a convolution layer.
///
/// # Fields
///
/// * `scales` - Learnable per-channel scale (γ), initialized to 1
/// * `scale_updates` - Accumulated scale gradient
/// * `mean`, `variance` - Statistics of the last training batch
/// * `mean_delta`, `variance_delta` - Gradients of the statistics
/// * `rolling_mean`, `rolling_variance` - Inference statistics (variance starts at 1)
/// * `x`, `x_norm` - Pre-normalization and normalized caches (`batch × outputs`)
#[derive(Debug, Clone)]
pub struct ConvBatchNorm {
    channels: usize,
    pub(crate) scales: Vec<f32>,
    pub(crate) scale_updates: Vec<f32>,
    pub(crate) mean: Vec<f32>,
    pub(crate) variance: Vec<f32>,
    mean_delta: Vec<f32>,
    variance_delta: Vec<f32>,
    pub(crate) rolling_mean: Vec<f32>,
    pub(crate) rolling_variance: Vec<f32>,
    x: Vec<f32>,
    x_norm: Vec<f32>,
}

impl ConvBatchNorm {
    /// Allocate state for `channels` output channels and a
    /// `batch × outputs` output buffer.
    pub fn new(channels: usize, cache_len: usize) -> Self {
        Self {
            channels,
            scales: vec![1.0f32; channels],
            scale_updates: vec![0.0f32; channels],
            mean: vec![0.0f32; channels],
            variance: vec![0.0f32; channels],
            mean_delta: vec![0.0f32; channels],
            variance_delta: vec![0.0f32; channels],
            rolling_mean: vec![0.0f32; channels],
            rolling_variance: vec![1.0f32; channels],
            x: vec![0.0f32; cache_len],
            x_norm: vec![0.0f32; cache_len],
        }
    }

    /// Reallocate the per-sample caches after a spatial resize.
    pub fn resize(&mut self, cache_len: usize) {
        self.x = vec![0.0f32; cache_len];
        self.x_norm = vec![0.0f32; cache_len];
    }

    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    pub fn scales_mut(&mut self) -> &mut [f32] {
        &mut self.scales
    }

    pub fn scale_updates(&self) -> &[f32] {
        &self.scale_updates
    }

    pub fn rolling_mean(&self) -> &[f32] {
        &self.rolling_mean
    }

    pub fn rolling_variance(&self) -> &[f32] {
        &self.rolling_variance
    }

    /// Rolling statistics, e.g. for restoring saved inference state.
    pub fn rolling_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.rolling_mean, &mut self.rolling_variance)
    }

    /// Normalize `output` in place, then apply `scales` and `biases`.
    ///
    /// `output` is `batch × channels × spatial`.
    pub fn forward(&mut self, output: &mut [f32], biases: &[f32], spatial: usize, training: bool) {
        let n = self.channels;
        if training {
            channel_mean(output, n, spatial, &mut self.mean);
            channel_variance(output, &self.mean, n, spatial, &mut self.variance);

            scal(ROLLING_MOMENTUM, &mut self.rolling_mean);
            axpy(1.0 - ROLLING_MOMENTUM, &self.mean, &mut self.rolling_mean);
            scal(ROLLING_MOMENTUM, &mut self.rolling_variance);
            axpy(1.0 - ROLLING_MOMENTUM, &self.variance, &mut self.rolling_variance);
        }

        self.x.copy_from_slice(output);
        if training {
            normalize(output, &self.mean, &self.variance, n, spatial);
        } else {
            normalize(output, &self.rolling_mean, &self.rolling_variance, n, spatial);
        }
        self.x_norm.copy_from_slice(output);

        scale_bias(output, &self.scales, n, spatial);
        add_bias(output, biases, n, spatial);
    }

    /// Turn `delta` (gradient w.r.t. the normalized, scaled, shifted output)
    /// into the gradient w.r.t. the raw convolution output, accumulating the
    /// bias and scale gradients on the way.
    pub fn backward(
        &mut self,
        delta: &mut [f32],
        bias_updates: &mut [f32],
        spatial: usize,
        training: bool,
    ) {
        let n = self.channels;
        if !training {
            self.mean.copy_from_slice(&self.rolling_mean);
            self.variance.copy_from_slice(&self.rolling_variance);
        }

        backward_bias(bias_updates, delta, n, spatial);
        backward_scale(&self.x_norm, delta, n, spatial, &mut self.scale_updates);
        scale_bias(delta, &self.scales, n, spatial);

        mean_delta(delta, &self.variance, n, spatial, &mut self.mean_delta);
        variance_delta(
            &self.x,
            delta,
            &self.mean,
            &self.variance,
            n,
            spatial,
            &mut self.variance_delta,
        );
        normalize_delta(
            &self.x,
            &self.mean,
            &self.variance,
            &self.mean_delta,
            &self.variance_delta,
            n,
            spatial,
            delta,
        );
    }
}

fn channel_mean(x: &[f32], n: usize, spatial: usize, mean: &mut [f32]) {
    let count = (x.len() / (n * spatial) * spatial) as f32;
    mean.iter_mut().for_each(|m| *m = 0.0);
    for sample in x.chunks_exact(n * spatial) {
        for (m, channel) in mean.iter_mut().zip(sample.chunks_exact(spatial)) {
            *m += channel.iter().sum::<f32>();
        }
    }
    mean.iter_mut().for_each(|m| *m /= count);
}

fn channel_variance(x: &[f32], mean: &[f32], n: usize, spatial: usize, variance: &mut [f32]) {
    let count = (x.len() / (n * spatial) * spatial) as f32;
    variance.iter_mut().for_each(|v| *v = 0.0);
    for sample in x.chunks_exact(n * spatial) {
        for ((v, &m), channel) in variance.iter_mut().zip(mean).zip(sample.chunks_exact(spatial)) {
            *v += channel.iter().map(|&xi| (xi - m) * (xi - m)).sum::<f32>();
        }
    }
    variance.iter_mut().for_each(|v| *v /= count);
}

fn normalize(x: &mut [f32], mean: &[f32], variance: &[f32], n: usize, spatial: usize) {
    for sample in x.chunks_exact_mut(n * spatial) {
        for (f, channel) in sample.chunks_exact_mut(spatial).enumerate() {
            let inv_std = 1.0 / (variance[f] + BN_EPSILON).sqrt();
            channel.iter_mut().for_each(|v| *v = (*v - mean[f]) * inv_std);
        }
    }
}

fn backward_scale(x_norm: &[f32], delta: &[f32], n: usize, spatial: usize, updates: &mut [f32]) {
    for (xs, ds) in x_norm.chunks_exact(n * spatial).zip(delta.chunks_exact(n * spatial)) {
        for (f, update) in updates.iter_mut().enumerate() {
            let range = f * spatial..(f + 1) * spatial;
            *update += xs[range.clone()]
                .iter()
                .zip(&ds[range])
                .map(|(x, d)| x * d)
                .sum::<f32>();
        }
    }
}

fn mean_delta(delta: &[f32], variance: &[f32], n: usize, spatial: usize, out: &mut [f32]) {
    out.iter_mut().for_each(|v| *v = 0.0);
    for sample in delta.chunks_exact(n * spatial) {
        for (o, channel) in out.iter_mut().zip(sample.chunks_exact(spatial)) {
            *o += channel.iter().sum::<f32>();
        }
    }
    for (o, &var) in out.iter_mut().zip(variance) {
        *o *= -1.0 / (var + BN_EPSILON).sqrt();
    }
}

#[allow(clippy::too_many_arguments)]
fn variance_delta(
    x: &[f32],
    delta: &[f32],
    mean: &[f32],
    variance: &[f32],
    n: usize,
    spatial: usize,
    out: &mut [f32],
) {
    out.iter_mut().for_each(|v| *v = 0.0);
    for (xs, ds) in x.chunks_exact(n * spatial).zip(delta.chunks_exact(n * spatial)) {
        for (f, o) in out.iter_mut().enumerate() {
            let range = f * spatial..(f + 1) * spatial;
            *o += xs[range.clone()]
                .iter()
                .zip(&ds[range])
                .map(|(&xi, &d)| d * (xi - mean[f]))
                .sum::<f32>();
        }
    }
    for (o, &var) in out.iter_mut().zip(variance) {
        *o *= -0.5 * (var + BN_EPSILON).powf(-1.5);
    }
}

#[allow(clippy::too_many_arguments)]
fn normalize_delta(
    x: &[f32],
    mean: &[f32],
    variance: &[f32],
    mean_delta: &[f32],
    variance_delta: &[f32],
    n: usize,
    spatial: usize,
    delta: &mut [f32],
) {
    let count = (x.len() / (n * spatial) * spatial) as f32;
    for (xs, ds) in x.chunks_exact(n * spatial).zip(delta.chunks_exact_mut(n * spatial)) {
        for f in 0..n {
            let inv_std = 1.0 / (variance[f] + BN_EPSILON).sqrt();
            let range = f * spatial..(f + 1) * spatial;
            for (d, &xi) in ds[range.clone()].iter_mut().zip(&xs[range]) {
                *d = *d * inv_std
                    + variance_delta[f] * 2.0 * (xi - mean[f]) / count
                    + mean_delta[f] / count;
            }
        }
    }
}
