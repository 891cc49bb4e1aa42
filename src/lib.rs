//! Convolution layer core
//!
//! Grouped 2D convolution with forward, backward and update passes, optional
//! per-channel batch norm, binary-weight and XNOR quantization, and a channel
//! shuffle operator for use between grouped convolutions.
//!
//! # Modules
//!
//! - `layers`: Layer trait, `ConvLayer`, `ShuffleLayer`, batch-norm hook
//! - `backend`: `ConvBackend` trait with the portable (unfold + matrix
//!   multiply) and accelerated implementations
//! - `quantization`: weight and input binarization
//! - `shape`: convolution geometry
//! - `config`: layer and update configuration structures
//! - `workspace`: shared scratch buffer for a sequence of layers
//! - `utils`: numeric kernels (gemm, im2col, activations, RNG)
//!
//! Enable the `blas` feature to route matrix multiplies through `cblas`.

#[cfg(feature = "blas")]
extern crate blas_src;

pub mod backend;
pub mod config;
pub mod error;
pub mod layers;
pub mod quantization;
pub mod shape;
pub mod utils;
pub mod workspace;

pub use backend::{BackendChoice, ConvBackend, DeviceContext};
pub use config::{load_config, ConvLayerConfig, ShuffleConfig, UpdateArgs};
pub use error::{ConvError, Result};
pub use layers::{ConvLayer, Layer, ShuffleLayer};
pub use quantization::Quantization;
pub use shape::ConvShape;
pub use workspace::Workspace;
