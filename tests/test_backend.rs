// Tests for backend selection: an accelerated backend must agree with the
// portable path, report the largest of its three workspace queries, and fall
// back to the portable path when binding or rebinding fails.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use approx::assert_relative_eq;
use convnet_core::backend::{
    AcceleratedBackend, AcceleratorError, AlgorithmSet, ConvAccelerator, ConvBackend,
    ConvDescriptor, DeviceContext, PortableBackend,
};
use convnet_core::config::ConvLayerConfig;
use convnet_core::layers::{ConvLayer, Layer};
use convnet_core::utils::{Activation, SimpleRng};
use convnet_core::{BackendChoice, ConvError, ConvShape, Workspace};

const EXTRA_FILTER_BYTES: usize = 256;

/// Accelerator that runs every product on the host through the portable
/// backend, with a larger scratch demand for the filter gradient.
struct HostAccelerator {
    reject_height: Option<usize>,
    selections: Arc<AtomicUsize>,
}

impl HostAccelerator {
    fn new(reject_height: Option<usize>) -> (Self, Arc<AtomicUsize>) {
        let selections = Arc::new(AtomicUsize::new(0));
        (
            Self {
                reject_height,
                selections: Arc::clone(&selections),
            },
            selections,
        )
    }
}

fn shape_of(desc: &ConvDescriptor) -> ConvShape {
    ConvShape {
        batch: desc.batch,
        h: desc.height,
        w: desc.width,
        c: desc.channels,
        n: desc.filters,
        size: desc.size,
        stride: desc.stride,
        pad: desc.pad,
        groups: desc.groups,
    }
}

fn host_error(err: convnet_core::ConvError) -> AcceleratorError {
    AcceleratorError::Execution(err.to_string())
}

impl ConvAccelerator for HostAccelerator {
    fn select_algorithms(&self, desc: &ConvDescriptor) -> Result<AlgorithmSet, AcceleratorError> {
        self.selections.fetch_add(1, Ordering::SeqCst);
        if Some(desc.height) == self.reject_height {
            return Err(AcceleratorError::AlgorithmSelection(format!(
                "no algorithm for height {}",
                desc.height
            )));
        }
        Ok(AlgorithmSet {
            forward: 1,
            backward_filter: 2,
            backward_data: 3,
        })
    }

    fn forward_workspace_size(
        &self,
        desc: &ConvDescriptor,
        _algorithm: u32,
    ) -> Result<usize, AcceleratorError> {
        Ok(PortableBackend::new(shape_of(desc)).workspace_size())
    }

    fn backward_filter_workspace_size(
        &self,
        desc: &ConvDescriptor,
        _algorithm: u32,
    ) -> Result<usize, AcceleratorError> {
        Ok(PortableBackend::new(shape_of(desc)).workspace_size() + EXTRA_FILTER_BYTES)
    }

    fn backward_data_workspace_size(
        &self,
        desc: &ConvDescriptor,
        _algorithm: u32,
    ) -> Result<usize, AcceleratorError> {
        Ok(PortableBackend::new(shape_of(desc)).workspace_size())
    }

    fn forward(
        &self,
        desc: &ConvDescriptor,
        _algorithm: u32,
        input: &[f32],
        weights: &[f32],
        workspace: &mut [f32],
        output: &mut [f32],
    ) -> Result<(), AcceleratorError> {
        PortableBackend::new(shape_of(desc))
            .forward(input, weights, workspace, output)
            .map_err(host_error)
    }

    fn backward_filter(
        &self,
        desc: &ConvDescriptor,
        _algorithm: u32,
        input: &[f32],
        delta: &[f32],
        workspace: &mut [f32],
        weight_updates: &mut [f32],
    ) -> Result<(), AcceleratorError> {
        let weights = vec![0.0f32; weight_updates.len()];
        PortableBackend::new(shape_of(desc))
            .backward(input, delta, &weights, workspace, weight_updates, None)
            .map_err(host_error)
    }

    fn backward_data(
        &self,
        desc: &ConvDescriptor,
        _algorithm: u32,
        weights: &[f32],
        delta: &[f32],
        workspace: &mut [f32],
        input_delta: &mut [f32],
    ) -> Result<(), AcceleratorError> {
        let shape = shape_of(desc);
        let input = vec![0.0f32; input_delta.len()];
        let mut scratch = vec![0.0f32; weights.len()];
        PortableBackend::new(shape)
            .backward(&input, delta, weights, workspace, &mut scratch, Some(input_delta))
            .map_err(host_error)
    }
}

fn config() -> ConvLayerConfig {
    ConvLayerConfig::new(2, 6, 5, 4, 6, 3)
        .with_pad(1)
        .with_groups(2)
        .with_activation(Activation::Leaky)
}

fn accelerated_choice(reject_height: Option<usize>) -> (BackendChoice, Arc<AtomicUsize>) {
    let (accelerator, selections) = HostAccelerator::new(reject_height);
    let context = Arc::new(DeviceContext::new(0, accelerator));
    (BackendChoice::Accelerated(context), selections)
}

fn random_vec(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = SimpleRng::new(seed);
    (0..len).map(|_| rng.gen_range_f32(-1.0, 1.0)).collect()
}

#[test]
fn test_accelerated_matches_portable() {
    let (choice, _) = accelerated_choice(None);
    let mut accelerated =
        ConvLayer::with_backend(&config(), choice, &mut SimpleRng::new(3)).unwrap();
    let mut portable = ConvLayer::new(&config(), &mut SimpleRng::new(3)).unwrap();
    assert_eq!(accelerated.backend_name(), "accelerated");
    assert_eq!(accelerated.weights(), portable.weights());

    let input = random_vec(2 * portable.inputs(), 4);
    let upstream = random_vec(2 * portable.outputs(), 5);
    let mut workspace = Workspace::for_layers([&accelerated as &dyn Layer, &portable]);

    let mut dx_acc = vec![0.0f32; input.len()];
    accelerated.forward(&input, workspace.as_mut_slice()).unwrap();
    accelerated
        .backward_from(&upstream, &input, workspace.as_mut_slice(), Some(&mut dx_acc))
        .unwrap();

    let mut dx_host = vec![0.0f32; input.len()];
    portable.forward(&input, workspace.as_mut_slice()).unwrap();
    portable
        .backward_from(&upstream, &input, workspace.as_mut_slice(), Some(&mut dx_host))
        .unwrap();

    for (&a, &b) in accelerated.output().iter().zip(portable.output()) {
        assert_relative_eq!(a, b, epsilon = 1e-6);
    }
    for (&a, &b) in accelerated.weight_updates().iter().zip(portable.weight_updates()) {
        assert_relative_eq!(a, b, epsilon = 1e-5);
    }
    for (&a, &b) in dx_acc.iter().zip(&dx_host) {
        assert_relative_eq!(a, b, epsilon = 1e-5);
    }
}

#[test]
fn test_workspace_is_largest_query() {
    let (choice, selections) = accelerated_choice(None);
    let layer = ConvLayer::with_backend(&config(), choice, &mut SimpleRng::new(1)).unwrap();
    let portable = PortableBackend::new(*layer.shape());

    assert_eq!(
        layer.workspace_size(),
        portable.workspace_size() + EXTRA_FILTER_BYTES
    );
    assert_eq!(selections.load(Ordering::SeqCst), 1);
}

#[test]
fn test_bind_failure_falls_back_to_portable() {
    let (choice, _) = accelerated_choice(Some(6));
    let mut layer = ConvLayer::with_backend(&config(), choice, &mut SimpleRng::new(1)).unwrap();

    assert_eq!(layer.backend_name(), "portable");
    assert_eq!(
        layer.workspace_size(),
        PortableBackend::new(*layer.shape()).workspace_size()
    );

    let input = random_vec(2 * layer.inputs(), 2);
    let mut workspace = Workspace::with_bytes(layer.workspace_size());
    assert!(layer.forward(&input, workspace.as_mut_slice()).is_ok());
}

#[test]
fn test_resize_rebinds_descriptors() {
    let (choice, selections) = accelerated_choice(None);
    let mut layer = ConvLayer::with_backend(&config(), choice, &mut SimpleRng::new(1)).unwrap();
    let before = layer.workspace_size();

    layer.resize(10, 12).unwrap();
    assert_eq!(layer.backend_name(), "accelerated");
    assert_eq!(selections.load(Ordering::SeqCst), 2);
    assert_eq!(
        layer.workspace_size(),
        PortableBackend::new(*layer.shape()).workspace_size() + EXTRA_FILTER_BYTES
    );
    assert!(layer.workspace_size() > before);
}

#[test]
fn test_rebind_failure_on_resize_falls_back() {
    let (choice, _) = accelerated_choice(Some(9));
    let mut layer = ConvLayer::with_backend(&config(), choice, &mut SimpleRng::new(1)).unwrap();
    assert_eq!(layer.backend_name(), "accelerated");

    layer.resize(5, 9).unwrap();
    assert_eq!(layer.backend_name(), "portable");
    assert_eq!(
        layer.workspace_size(),
        PortableBackend::new(*layer.shape()).workspace_size()
    );

    let input = random_vec(2 * layer.inputs(), 2);
    let mut workspace = Workspace::with_bytes(layer.workspace_size());
    assert!(layer.forward(&input, workspace.as_mut_slice()).is_ok());
}

#[test]
fn test_context_shared_between_layers() {
    let (accelerator, selections) = HostAccelerator::new(None);
    let context = Arc::new(DeviceContext::new(3, accelerator));

    let first = ConvLayer::with_backend(
        &config(),
        BackendChoice::Accelerated(Arc::clone(&context)),
        &mut SimpleRng::new(1),
    )
    .unwrap();
    let second = ConvLayer::with_backend(
        &ConvLayerConfig::new(2, 6, 5, 6, 2, 1),
        BackendChoice::Accelerated(Arc::clone(&context)),
        &mut SimpleRng::new(2),
    )
    .unwrap();

    assert_eq!(Arc::strong_count(&context), 3);
    assert_eq!(selections.load(Ordering::SeqCst), 2);

    drop(first);
    drop(second);
    assert_eq!(Arc::strong_count(&context), 1);
}

#[test]
fn test_set_backend_keeps_parameters() {
    let mut layer = ConvLayer::new(&config(), &mut SimpleRng::new(8)).unwrap();
    let weights = layer.weights().to_vec();

    let (choice, _) = accelerated_choice(None);
    layer.set_backend(choice);
    assert_eq!(layer.backend_name(), "accelerated");
    assert_eq!(layer.weights(), weights.as_slice());
}

#[test]
fn test_accelerated_backward_checks_before_accumulating() {
    let (accelerator, _) = HostAccelerator::new(None);
    let context = Arc::new(DeviceContext::new(0, accelerator));
    let shape = config().shape();
    let backend = AcceleratedBackend::bind(context, &shape).unwrap();

    let input = random_vec(shape.batch * shape.inputs(), 1);
    let delta = random_vec(shape.batch * shape.outputs(), 2);
    let weights = random_vec(shape.nweights(), 3);
    let mut workspace = Workspace::with_bytes(backend.workspace_size());
    let mut weight_updates = vec![0.0f32; shape.nweights()];
    let mut short_delta = vec![0.0f32; input.len() - 1];

    let result = backend.backward(
        &input,
        &delta,
        &weights,
        workspace.as_mut_slice(),
        &mut weight_updates,
        Some(&mut short_delta),
    );
    assert!(matches!(result, Err(ConvError::ShapeMismatch { .. })));
    assert!(weight_updates.iter().all(|&g| g == 0.0));
}
