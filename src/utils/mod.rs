//! Numeric building blocks consumed by the layers
//!
//! Deterministic initialization, activations, vector primitives, matrix
//! multiply, and the unfold/fold transforms used by the portable backend.

pub mod activations;
pub mod blas;
pub mod gemm;
pub mod im2col;
pub mod rng;

pub use activations::{activate_array, gradient_array, Activation};
pub use rng::SimpleRng;
