//! Level-1 vector primitives used by the update rules and the batch-norm hook.

/// Set every element of `x` to `value`.
pub fn fill(x: &mut [f32], value: f32) {
    x.iter_mut().for_each(|v| *v = value);
}

/// `y += alpha * x`
///
/// # Panics
///
/// Panics if `x` and `y` have different lengths.
pub fn axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    assert_eq!(x.len(), y.len(), "axpy operands must have the same length");
    for (yi, &xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

/// `x *= alpha`
pub fn scal(alpha: f32, x: &mut [f32]) {
    for v in x.iter_mut() {
        *v *= alpha;
    }
}

pub fn sum(x: &[f32]) -> f32 {
    x.iter().sum()
}

/// Add `bias[i]` to every spatial position of channel `i`, for each sample.
///
/// `data` is laid out as `batch × n × spatial`.
pub fn add_bias(data: &mut [f32], bias: &[f32], n: usize, spatial: usize) {
    for sample in data.chunks_exact_mut(n * spatial) {
        for (channel, &b) in sample.chunks_exact_mut(spatial).zip(bias) {
            channel.iter_mut().for_each(|v| *v += b);
        }
    }
}

/// Multiply channel `i` by `scales[i]`, for each sample.
pub fn scale_bias(data: &mut [f32], scales: &[f32], n: usize, spatial: usize) {
    for sample in data.chunks_exact_mut(n * spatial) {
        for (channel, &s) in sample.chunks_exact_mut(spatial).zip(scales) {
            channel.iter_mut().for_each(|v| *v *= s);
        }
    }
}

/// Accumulate the per-channel sum of `delta` into `bias_updates`.
pub fn backward_bias(bias_updates: &mut [f32], delta: &[f32], n: usize, spatial: usize) {
    for sample in delta.chunks_exact(n * spatial) {
        for (update, channel) in bias_updates.iter_mut().zip(sample.chunks_exact(spatial)) {
            *update += sum(channel);
        }
    }
}
