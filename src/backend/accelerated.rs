//! Accelerated convolution through an external device library
//!
//! The device library itself is not part of this crate. It is reached through
//! the `ConvAccelerator` capability trait, which mirrors the usual vendor
//! contract:
//!
//! 1. Describe the convolution (tensor, filter and convolution descriptors)
//! 2. Ask the library for its fastest algorithm for each of the three products
//! 3. Query the scratch requirement of each chosen algorithm
//! 4. Run the products with a caller-provided workspace
//!
//! The process-wide device handle lives in a `DeviceContext` that callers
//! create once and share with every layer via `Arc`. Descriptor and algorithm
//! state is per layer and is re-derived by `reshape` whenever the layer is
//! resized.

use std::sync::Arc;

use thiserror::Error;

use crate::backend::ConvBackend;
use crate::error::{check_len, check_workspace, ConvError, Result};
use crate::shape::ConvShape;

/// Failure reported by a `ConvAccelerator`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcceleratorError {
    #[error("descriptor setup failed: {0}")]
    Descriptor(String),
    #[error("algorithm selection failed: {0}")]
    AlgorithmSelection(String),
    #[error("workspace query failed: {0}")]
    WorkspaceQuery(String),
    #[error("kernel execution failed: {0}")]
    Execution(String),
}

impl From<AcceleratorError> for ConvError {
    fn from(err: AcceleratorError) -> Self {
        ConvError::Backend(err.to_string())
    }
}

/// NCHW cross-correlation description handed to the device library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvDescriptor {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub filters: usize,
    /// Input channels per filter (`channels / groups`).
    pub filter_channels: usize,
    pub size: usize,
    pub out_height: usize,
    pub out_width: usize,
    pub stride: usize,
    pub pad: usize,
    pub groups: usize,
}

impl ConvDescriptor {
    pub fn from_shape(shape: &ConvShape) -> Self {
        Self {
            batch: shape.batch,
            channels: shape.c,
            height: shape.h,
            width: shape.w,
            filters: shape.n,
            filter_channels: shape.group_in(),
            size: shape.size,
            out_height: shape.out_h(),
            out_width: shape.out_w(),
            stride: shape.stride,
            pad: shape.pad,
            groups: shape.groups,
        }
    }
}

/// Algorithm identifiers picked by the device library, one per product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlgorithmSet {
    pub forward: u32,
    pub backward_filter: u32,
    pub backward_data: u32,
}

/// Capability exposed by an external accelerated-convolution library.
///
/// Compute methods accumulate into their destination, matching the portable
/// backend: `forward` adds into `output`, `backward_filter` adds into
/// `weight_updates`, `backward_data` adds into `input_delta`.
pub trait ConvAccelerator: Send + Sync {
    /// Pick the fastest algorithm for each product of `desc`.
    fn select_algorithms(&self, desc: &ConvDescriptor) -> std::result::Result<AlgorithmSet, AcceleratorError>;

    fn forward_workspace_size(
        &self,
        desc: &ConvDescriptor,
        algorithm: u32,
    ) -> std::result::Result<usize, AcceleratorError>;

    fn backward_filter_workspace_size(
        &self,
        desc: &ConvDescriptor,
        algorithm: u32,
    ) -> std::result::Result<usize, AcceleratorError>;

    fn backward_data_workspace_size(
        &self,
        desc: &ConvDescriptor,
        algorithm: u32,
    ) -> std::result::Result<usize, AcceleratorError>;

    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        desc: &ConvDescriptor,
        algorithm: u32,
        input: &[f32],
        weights: &[f32],
        workspace: &mut [f32],
        output: &mut [f32],
    ) -> std::result::Result<(), AcceleratorError>;

    #[allow(clippy::too_many_arguments)]
    fn backward_filter(
        &self,
        desc: &ConvDescriptor,
        algorithm: u32,
        input: &[f32],
        delta: &[f32],
        workspace: &mut [f32],
        weight_updates: &mut [f32],
    ) -> std::result::Result<(), AcceleratorError>;

    #[allow(clippy::too_many_arguments)]
    fn backward_data(
        &self,
        desc: &ConvDescriptor,
        algorithm: u32,
        weights: &[f32],
        delta: &[f32],
        workspace: &mut [f32],
        input_delta: &mut [f32],
    ) -> std::result::Result<(), AcceleratorError>;
}

/// Explicitly scoped handle to one accelerator device.
///
/// Create once, wrap in `Arc`, and pass to every layer that should use it.
/// Dropping the last `Arc` tears the device handle down.
pub struct DeviceContext {
    device_index: usize,
    accelerator: Box<dyn ConvAccelerator>,
}

impl DeviceContext {
    pub fn new(device_index: usize, accelerator: impl ConvAccelerator + 'static) -> Self {
        Self {
            device_index,
            accelerator: Box::new(accelerator),
        }
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }

    pub fn accelerator(&self) -> &dyn ConvAccelerator {
        self.accelerator.as_ref()
    }
}

/// Shape-derived binding state; replaced as a whole on every reshape.
#[derive(Debug, Clone, Copy)]
struct Binding {
    shape: ConvShape,
    descriptor: ConvDescriptor,
    algorithms: AlgorithmSet,
    workspace_size: usize,
}

impl Binding {
    fn derive(accelerator: &dyn ConvAccelerator, shape: &ConvShape) -> Result<Self> {
        let descriptor = ConvDescriptor::from_shape(shape);
        let algorithms = accelerator.select_algorithms(&descriptor)?;

        let forward = accelerator.forward_workspace_size(&descriptor, algorithms.forward)?;
        let filter =
            accelerator.backward_filter_workspace_size(&descriptor, algorithms.backward_filter)?;
        let data = accelerator.backward_data_workspace_size(&descriptor, algorithms.backward_data)?;

        Ok(Self {
            shape: *shape,
            descriptor,
            algorithms,
            workspace_size: forward.max(filter).max(data),
        })
    }
}

/// Backend that runs every product on a bound `ConvAccelerator`.
pub struct AcceleratedBackend {
    context: Arc<DeviceContext>,
    binding: Binding,
}

impl AcceleratedBackend {
    /// Describe `shape` to the device and select algorithms.
    ///
    /// Nothing is returned unless every step succeeded.
    pub fn bind(context: Arc<DeviceContext>, shape: &ConvShape) -> Result<Self> {
        let binding = Binding::derive(context.accelerator(), shape)?;
        tracing::debug!(
            device = context.device_index(),
            forward = binding.algorithms.forward,
            backward_filter = binding.algorithms.backward_filter,
            backward_data = binding.algorithms.backward_data,
            workspace = binding.workspace_size,
            "bound accelerated convolution"
        );
        Ok(Self { context, binding })
    }

    pub fn descriptor(&self) -> &ConvDescriptor {
        &self.binding.descriptor
    }

    pub fn algorithms(&self) -> AlgorithmSet {
        self.binding.algorithms
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }
}

impl ConvBackend for AcceleratedBackend {
    fn name(&self) -> &'static str {
        "accelerated"
    }

    fn shape(&self) -> &ConvShape {
        &self.binding.shape
    }

    /// On failure the previous binding is kept intact and the error returned.
    fn reshape(&mut self, shape: &ConvShape) -> Result<()> {
        self.binding = Binding::derive(self.context.accelerator(), shape)?;
        Ok(())
    }

    fn workspace_size(&self) -> usize {
        self.binding.workspace_size
    }

    fn forward(
        &self,
        input: &[f32],
        weights: &[f32],
        workspace: &mut [f32],
        output: &mut [f32],
    ) -> Result<()> {
        let s = &self.binding.shape;
        check_len("input", s.batch * s.inputs(), input.len())?;
        check_len("weights", s.nweights(), weights.len())?;
        check_len("output", s.batch * s.outputs(), output.len())?;
        check_workspace(self.binding.workspace_size, workspace)?;

        self.context.accelerator().forward(
            &self.binding.descriptor,
            self.binding.algorithms.forward,
            input,
            weights,
            workspace,
            output,
        )?;
        Ok(())
    }

    fn backward(
        &self,
        input: &[f32],
        delta: &[f32],
        weights: &[f32],
        workspace: &mut [f32],
        weight_updates: &mut [f32],
        input_delta: Option<&mut [f32]>,
    ) -> Result<()> {
        let s = &self.binding.shape;
        check_len("input", s.batch * s.inputs(), input.len())?;
        check_len("delta", s.batch * s.outputs(), delta.len())?;
        check_len("weights", s.nweights(), weights.len())?;
        check_len("weight updates", s.nweights(), weight_updates.len())?;
        check_workspace(self.binding.workspace_size, workspace)?;
        if let Some(dst) = input_delta.as_deref() {
            check_len("input delta", s.batch * s.inputs(), dst.len())?;
        }

        let accelerator = self.context.accelerator();
        let desc = &self.binding.descriptor;
        accelerator.backward_filter(
            desc,
            self.binding.algorithms.backward_filter,
            input,
            delta,
            workspace,
            weight_updates,
        )?;

        if let Some(dst) = input_delta {
            accelerator.backward_data(
                desc,
                self.binding.algorithms.backward_data,
                weights,
                delta,
                workspace,
                dst,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accelerator with fixed workspace answers and no compute.
    struct FixedSizes {
        sizes: [usize; 3],
        fail_select: bool,
    }

    impl ConvAccelerator for FixedSizes {
        fn select_algorithms(
            &self,
            _desc: &ConvDescriptor,
        ) -> std::result::Result<AlgorithmSet, AcceleratorError> {
            if self.fail_select {
                return Err(AcceleratorError::AlgorithmSelection("no algorithm".into()));
            }
            Ok(AlgorithmSet {
                forward: 1,
                backward_filter: 2,
                backward_data: 3,
            })
        }

        fn forward_workspace_size(
            &self,
            _desc: &ConvDescriptor,
            _algorithm: u32,
        ) -> std::result::Result<usize, AcceleratorError> {
            Ok(self.sizes[0])
        }

        fn backward_filter_workspace_size(
            &self,
            _desc: &ConvDescriptor,
            _algorithm: u32,
        ) -> std::result::Result<usize, AcceleratorError> {
            Ok(self.sizes[1])
        }

        fn backward_data_workspace_size(
            &self,
            _desc: &ConvDescriptor,
            _algorithm: u32,
        ) -> std::result::Result<usize, AcceleratorError> {
            Ok(self.sizes[2])
        }

        fn forward(
            &self,
            _desc: &ConvDescriptor,
            _algorithm: u32,
            _input: &[f32],
            _weights: &[f32],
            _workspace: &mut [f32],
            _output: &mut [f32],
        ) -> std::result::Result<(), AcceleratorError> {
            Ok(())
        }

        fn backward_filter(
            &self,
            _desc: &ConvDescriptor,
            _algorithm: u32,
            _input: &[f32],
            _delta: &[f32],
            _workspace: &mut [f32],
            _weight_updates: &mut [f32],
        ) -> std::result::Result<(), AcceleratorError> {
            Ok(())
        }

        fn backward_data(
            &self,
            _desc: &ConvDescriptor,
            _algorithm: u32,
            _weights: &[f32],
            _delta: &[f32],
            _workspace: &mut [f32],
            _input_delta: &mut [f32],
        ) -> std::result::Result<(), AcceleratorError> {
            Ok(())
        }
    }

    fn shape() -> ConvShape {
        ConvShape {
            batch: 2,
            h: 8,
            w: 8,
            c: 4,
            n: 4,
            size: 3,
            stride: 1,
            pad: 1,
            groups: 2,
        }
    }

    #[test]
    fn test_workspace_is_max_of_three_queries() {
        let context = Arc::new(DeviceContext::new(
            0,
            FixedSizes {
                sizes: [128, 512, 256],
                fail_select: false,
            },
        ));
        let backend = AcceleratedBackend::bind(context, &shape()).unwrap();
        assert_eq!(backend.workspace_size(), 512);
        assert_eq!(backend.algorithms().backward_data, 3);
        assert_eq!(backend.descriptor().filter_channels, 2);
    }

    #[test]
    fn test_bind_failure_is_reported() {
        let context = Arc::new(DeviceContext::new(
            1,
            FixedSizes {
                sizes: [0; 3],
                fail_select: true,
            },
        ));
        let err = AcceleratedBackend::bind(context, &shape()).err().unwrap();
        assert!(matches!(err, ConvError::Backend(_)));
    }

    #[test]
    fn test_descriptor_tracks_reshape() {
        let context = Arc::new(DeviceContext::new(
            0,
            FixedSizes {
                sizes: [64, 64, 64],
                fail_select: false,
            },
        ));
        let mut backend = AcceleratedBackend::bind(context, &shape()).unwrap();
        backend.reshape(&shape().with_spatial(16, 12)).unwrap();
        assert_eq!(backend.descriptor().width, 16);
        assert_eq!(backend.descriptor().out_height, 12);
    }
}
