//! Activation functions for convolution outputs
//!
//! Every activation here has a derivative that can be expressed in terms of
//! the activated output alone, so a layer only needs to keep its output buffer
//! around for the backward pass:
//!
//! - `activate_array` overwrites pre-activations with activations
//! - `gradient_array` multiplies a delta buffer by `f'(·)` evaluated from the
//!   cached outputs

use serde::Deserialize;

/// Elementwise activation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Logistic,
    Linear,
    Relu,
    /// ReLU with a 0.1 negative slope.
    Leaky,
    /// ReLU with a 0.01 negative slope.
    Relie,
    /// ReLU plus a 0.1 linear term.
    Ramp,
    Tanh,
    Elu,
    Selu,
    /// Piecewise-linear sigmoid.
    Plse,
    Hardtan,
    /// Linear inside [0, 1], slope 0.001 outside.
    Lhtan,
    /// Logistic rescaled to (-1, 1).
    Loggy,
}

const SELU_LAMBDA: f32 = 1.0507;
const SELU_ALPHA: f32 = 1.6732;

impl Activation {
    /// Apply the activation to one value.
    pub fn activate(self, x: f32) -> f32 {
        match self {
            Activation::Linear => x,
            Activation::Logistic => 1.0 / (1.0 + (-x).exp()),
            Activation::Relu => x.max(0.0),
            Activation::Leaky => {
                if x > 0.0 {
                    x
                } else {
                    0.1 * x
                }
            }
            Activation::Relie => {
                if x > 0.0 {
                    x
                } else {
                    0.01 * x
                }
            }
            Activation::Ramp => x * (x > 0.0) as i32 as f32 + 0.1 * x,
            Activation::Tanh => x.tanh(),
            Activation::Elu => {
                if x >= 0.0 {
                    x
                } else {
                    x.exp() - 1.0
                }
            }
            Activation::Selu => {
                if x >= 0.0 {
                    SELU_LAMBDA * x
                } else {
                    SELU_LAMBDA * SELU_ALPHA * (x.exp() - 1.0)
                }
            }
            Activation::Plse => {
                if x < -4.0 {
                    0.01 * (x + 4.0)
                } else if x > 4.0 {
                    0.01 * (x - 4.0) + 1.0
                } else {
                    0.125 * x + 0.5
                }
            }
            Activation::Hardtan => x.clamp(-1.0, 1.0),
            Activation::Lhtan => {
                if x < 0.0 {
                    0.001 * x
                } else if x > 1.0 {
                    0.001 * (x - 1.0) + 1.0
                } else {
                    x
                }
            }
            Activation::Loggy => 2.0 / (1.0 + (-x).exp()) - 1.0,
        }
    }

    /// Derivative of the activation, expressed in terms of its output `y`.
    pub fn gradient(self, y: f32) -> f32 {
        match self {
            Activation::Linear => 1.0,
            Activation::Logistic => (1.0 - y) * y,
            Activation::Relu => (y > 0.0) as i32 as f32,
            Activation::Leaky => {
                if y > 0.0 {
                    1.0
                } else {
                    0.1
                }
            }
            Activation::Relie => {
                if y > 0.0 {
                    1.0
                } else {
                    0.01
                }
            }
            Activation::Ramp => (y > 0.0) as i32 as f32 + 0.1,
            Activation::Tanh => 1.0 - y * y,
            Activation::Elu => {
                if y >= 0.0 {
                    1.0
                } else {
                    y + 1.0
                }
            }
            Activation::Selu => {
                if y >= 0.0 {
                    SELU_LAMBDA
                } else {
                    y + SELU_LAMBDA * SELU_ALPHA
                }
            }
            Activation::Plse => {
                if !(0.0..=1.0).contains(&y) {
                    0.01
                } else {
                    0.125
                }
            }
            Activation::Hardtan => {
                if y > -1.0 && y < 1.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Lhtan => {
                if y > 0.0 && y < 1.0 {
                    1.0
                } else {
                    0.001
                }
            }
            Activation::Loggy => {
                let s = (y + 1.0) / 2.0;
                2.0 * (1.0 - s) * s
            }
        }
    }
}

/// Apply `activation` in place to every element of `data`.
pub fn activate_array(data: &mut [f32], activation: Activation) {
    if activation == Activation::Linear {
        return;
    }
    for value in data.iter_mut() {
        *value = activation.activate(*value);
    }
}

/// Multiply each `delta[i]` by the activation derivative at `output[i]`.
///
/// # Panics
///
/// Panics if the two slices differ in length.
pub fn gradient_array(output: &[f32], activation: Activation, delta: &mut [f32]) {
    assert_eq!(
        output.len(),
        delta.len(),
        "output and delta must have the same length"
    );
    if activation == Activation::Linear {
        return;
    }
    for (d, &y) in delta.iter_mut().zip(output) {
        *d *= activation.gradient(y);
    }
}
