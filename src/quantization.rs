//! Weight and input binarization for the reduced-precision convolution paths
//!
//! Two schemes are supported and never mixed:
//!
//! - **Binary weights**: each filter is replaced by `±mean(|filter|)`, sign
//!   taken from the original weight.
//! - **XNOR**: binary weights as above, plus the input is replaced by
//!   `±mean(|x|)` where the mean runs over the batch axis at each
//!   channel/spatial position.
//!
//! Binarized values always land in a separate shadow buffer; the trainable
//! weights are only ever read.

use crate::error::{ConvError, Result};

/// Active quantization scheme of a convolution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quantization {
    #[default]
    None,
    /// Binarized weights, full-precision input.
    BinaryWeights,
    /// Binarized weights and binarized input.
    Xnor,
}

impl Quantization {
    /// Resolve the two configuration flags into a single mode.
    ///
    /// Setting both flags is a configuration error.
    pub fn from_flags(binary: bool, xnor: bool) -> Result<Self> {
        match (binary, xnor) {
            (false, false) => Ok(Quantization::None),
            (true, false) => Ok(Quantization::BinaryWeights),
            (false, true) => Ok(Quantization::Xnor),
            (true, true) => Err(ConvError::InvalidConfig(
                "binary and xnor quantization are mutually exclusive".into(),
            )),
        }
    }

    /// Whether weights are binarized before the forward pass.
    pub fn binarizes_weights(self) -> bool {
        self != Quantization::None
    }

    /// Whether the forward input is binarized as well.
    pub fn binarizes_input(self) -> bool {
        self == Quantization::Xnor
    }
}

/// Binarize `n` filters of `size` weights each into `binary`.
///
/// Element `i` of filter `f` becomes `+mean_f` if `weights[i] > 0`, else
/// `-mean_f`, where `mean_f` is the mean absolute value of that filter.
///
/// # Panics
///
/// Panics if either slice is shorter than `n * size`.
pub fn binarize_weights(weights: &[f32], n: usize, size: usize, binary: &mut [f32]) {
    if size == 0 {
        return;
    }
    let weights = &weights[..n * size];
    let binary = &mut binary[..n * size];
    for (filter, out) in weights.chunks_exact(size).zip(binary.chunks_exact_mut(size)) {
        let mean = filter.iter().map(|w| w.abs()).sum::<f32>() / size as f32;
        for (b, &w) in out.iter_mut().zip(filter) {
            *b = if w > 0.0 { mean } else { -mean };
        }
    }
}

/// Binarize a `n × size` input (n samples) along the sample axis.
///
/// For each position `s`, `mean_s` is the mean of `|input[i * size + s]|` over
/// the `n` samples, and each element becomes `±mean_s` by sign.
pub fn binarize_input(input: &[f32], n: usize, size: usize, binary: &mut [f32]) {
    if n == 0 {
        return;
    }
    for s in 0..size {
        let mean = (0..n).map(|i| input[i * size + s].abs()).sum::<f32>() / n as f32;
        for i in 0..n {
            let idx = i * size + s;
            binary[idx] = if input[idx] > 0.0 { mean } else { -mean };
        }
    }
}

/// Pure sign binarization: `+1` if `x > 0`, else `-1`.
pub fn binarize_sign(input: &[f32], binary: &mut [f32]) {
    for (b, &x) in binary.iter_mut().zip(input) {
        *b = if x > 0.0 { 1.0 } else { -1.0 };
    }
}
