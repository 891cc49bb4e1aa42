//! Layer implementations driven by an owning network graph
//!
//! - `ConvLayer`: grouped convolution with optional batch norm and
//!   binary/XNOR quantization
//! - `ShuffleLayer`: parameter-free channel shuffle between grouped
//!   convolutions
//! - `ConvBatchNorm`: per-channel batch-norm hook owned by a `ConvLayer`

mod r#trait;
pub mod batchnorm;
pub mod conv2d;
pub mod shuffle;

// Re-export the Layer trait for convenience
pub use batchnorm::ConvBatchNorm;
pub use conv2d::ConvLayer;
pub use r#trait::Layer;
pub use shuffle::ShuffleLayer;
