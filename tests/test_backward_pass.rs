// Tests for the convolution backward pass: accumulation semantics, bias
// gradients and the optional input-gradient destination.

use approx::assert_relative_eq;
use convnet_core::config::ConvLayerConfig;
use convnet_core::layers::{ConvLayer, Layer};
use convnet_core::utils::{Activation, SimpleRng};
use convnet_core::{ConvError, Workspace};

fn setup(config: ConvLayerConfig, seed: u64) -> (ConvLayer, Vec<f32>, Vec<f32>, Workspace) {
    let mut rng = SimpleRng::new(seed);
    let layer = ConvLayer::new(&config, &mut rng).unwrap();
    let input: Vec<f32> = (0..layer.batch() * layer.inputs())
        .map(|_| rng.gen_range_f32(-1.0, 1.0))
        .collect();
    let upstream: Vec<f32> = (0..layer.batch() * layer.outputs())
        .map(|_| rng.gen_range_f32(-1.0, 1.0))
        .collect();
    let workspace = Workspace::with_bytes(layer.workspace_size());
    (layer, input, upstream, workspace)
}

fn grouped_config() -> ConvLayerConfig {
    ConvLayerConfig::new(2, 5, 5, 4, 6, 3)
        .with_pad(1)
        .with_groups(2)
        .with_activation(Activation::Leaky)
}

#[test]
fn test_double_backward_doubles_gradients() {
    let (mut layer, input, upstream, mut workspace) = setup(grouped_config(), 3);
    layer.forward(&input, workspace.as_mut_slice()).unwrap();

    let mut input_delta = vec![0.0f32; input.len()];
    layer
        .backward_from(&upstream, &input, workspace.as_mut_slice(), Some(&mut input_delta))
        .unwrap();
    let weights_once = layer.weight_updates().to_vec();
    let bias_once = layer.bias_updates().to_vec();
    let input_once = input_delta.clone();

    layer
        .backward_from(&upstream, &input, workspace.as_mut_slice(), Some(&mut input_delta))
        .unwrap();

    for (&twice, &once) in layer.weight_updates().iter().zip(&weights_once) {
        assert_relative_eq!(twice, 2.0 * once, epsilon = 1e-5, max_relative = 1e-5);
    }
    for (&twice, &once) in layer.bias_updates().iter().zip(&bias_once) {
        assert_relative_eq!(twice, 2.0 * once, epsilon = 1e-5, max_relative = 1e-5);
    }
    for (&twice, &once) in input_delta.iter().zip(&input_once) {
        assert_relative_eq!(twice, 2.0 * once, epsilon = 1e-5, max_relative = 1e-5);
    }
}

#[test]
fn test_zero_gradients_resets_accumulators() {
    let (mut layer, input, upstream, mut workspace) =
        setup(grouped_config().with_batch_normalize(true), 4);
    layer.forward(&input, workspace.as_mut_slice()).unwrap();
    layer
        .backward_from(&upstream, &input, workspace.as_mut_slice(), None)
        .unwrap();
    assert!(layer.weight_updates().iter().any(|&g| g != 0.0));

    layer.zero_gradients();
    assert!(layer.weight_updates().iter().all(|&g| g == 0.0));
    assert!(layer.bias_updates().iter().all(|&g| g == 0.0));
    let bn = layer.batch_norm().unwrap();
    assert!(bn.scale_updates().iter().all(|&g| g == 0.0));
}

#[test]
fn test_bias_gradient_sums_delta_per_channel() {
    let config = ConvLayerConfig::new(2, 3, 3, 2, 2, 3)
        .with_pad(1)
        .with_activation(Activation::Linear);
    let (mut layer, input, upstream, mut workspace) = setup(config, 5);
    layer.forward(&input, workspace.as_mut_slice()).unwrap();
    layer
        .backward_from(&upstream, &input, workspace.as_mut_slice(), None)
        .unwrap();

    let spatial = 9;
    for ch in 0..2 {
        let expected: f32 = (0..2)
            .map(|b| {
                let start = b * layer.outputs() + ch * spatial;
                upstream[start..start + spatial].iter().sum::<f32>()
            })
            .sum();
        assert_relative_eq!(layer.bias_updates()[ch], expected, epsilon = 1e-5);
    }
}

#[test]
fn test_pointwise_weight_gradient() {
    // 1x1 kernel, one filter: dW[c] = sum over positions of delta * x[c]
    let config = ConvLayerConfig::new(1, 2, 2, 2, 1, 1).with_activation(Activation::Linear);
    let mut rng = SimpleRng::new(1);
    let mut layer = ConvLayer::new(&config, &mut rng).unwrap();
    let mut workspace = Workspace::with_bytes(layer.workspace_size());

    let input = [1.0, 2.0, 3.0, 4.0, -1.0, 0.0, 1.0, 2.0];
    let upstream = [1.0, 0.5, -1.0, 2.0];
    layer.forward(&input, workspace.as_mut_slice()).unwrap();
    layer
        .backward_from(&upstream, &input, workspace.as_mut_slice(), None)
        .unwrap();

    assert_relative_eq!(layer.weight_updates()[0], 1.0 + 1.0 - 3.0 + 8.0);
    assert_relative_eq!(layer.weight_updates()[1], -1.0 + 0.0 - 1.0 + 4.0);
}

#[test]
fn test_pointwise_input_gradient() {
    let config = ConvLayerConfig::new(1, 2, 2, 2, 1, 1).with_activation(Activation::Linear);
    let mut rng = SimpleRng::new(1);
    let mut layer = ConvLayer::new(&config, &mut rng).unwrap();
    layer.weights_mut().copy_from_slice(&[2.0, -3.0]);
    let mut workspace = Workspace::with_bytes(layer.workspace_size());

    let input = [0.0f32; 8];
    let upstream = [1.0, 0.5, -1.0, 2.0];
    let mut input_delta = vec![1.0f32; 8];
    layer.forward(&input, workspace.as_mut_slice()).unwrap();
    layer
        .backward_from(&upstream, &input, workspace.as_mut_slice(), Some(&mut input_delta))
        .unwrap();

    // accumulated onto the existing ones
    let expected = [3.0, 2.0, -1.0, 5.0, -2.0, -0.5, 4.0, -5.0];
    for (&got, &want) in input_delta.iter().zip(expected.iter()) {
        assert_relative_eq!(got, want);
    }
}

#[test]
fn test_backward_without_input_destination() {
    let (mut layer, input, upstream, mut workspace) = setup(grouped_config(), 6);
    layer.forward(&input, workspace.as_mut_slice()).unwrap();
    layer.delta_mut().copy_from_slice(&upstream);
    layer
        .backward(&input, workspace.as_mut_slice(), None)
        .unwrap();
    assert!(layer.weight_updates().iter().any(|&g| g != 0.0));
}

#[test]
fn test_backward_rejects_wrong_input_delta_length() {
    let (mut layer, input, upstream, mut workspace) = setup(grouped_config(), 6);
    layer.forward(&input, workspace.as_mut_slice()).unwrap();
    let mut input_delta = vec![0.0f32; input.len() - 1];
    let result =
        layer.backward_from(&upstream, &input, workspace.as_mut_slice(), Some(&mut input_delta));
    assert!(matches!(result, Err(ConvError::ShapeMismatch { .. })));
}

#[test]
fn test_batch_norm_backward_bias_gradient() {
    let config = grouped_config()
        .with_batch_normalize(true)
        .with_activation(Activation::Linear);
    let (mut layer, input, upstream, mut workspace) = setup(config, 8);
    layer.forward(&input, workspace.as_mut_slice()).unwrap();
    layer
        .backward_from(&upstream, &input, workspace.as_mut_slice(), None)
        .unwrap();

    // With batch norm the bias still receives the raw per-channel delta sum.
    let spatial = 25;
    for ch in 0..6 {
        let expected: f32 = (0..2)
            .map(|b| {
                let start = b * layer.outputs() + ch * spatial;
                upstream[start..start + spatial].iter().sum::<f32>()
            })
            .sum();
        assert_relative_eq!(layer.bias_updates()[ch], expected, epsilon = 1e-4);
    }
}

#[test]
fn test_rejected_backward_leaves_state_untouched() {
    let config = ConvLayerConfig::new(1, 4, 4, 2, 2, 3).with_pad(1);
    let (mut layer, input, _, mut workspace) = setup(config, 12);
    layer.forward(&input, workspace.as_mut_slice()).unwrap();
    layer.delta_mut().fill(1.0);

    let delta = layer.delta().to_vec();
    let bias = layer.bias_updates().to_vec();
    let weights = layer.weight_updates().to_vec();

    let result = layer.backward(&input, &mut [0.0f32; 1], None);
    assert!(matches!(result, Err(ConvError::WorkspaceTooSmall { .. })));

    let mut short_delta = vec![0.0f32; input.len() - 1];
    let result = layer.backward(&input, workspace.as_mut_slice(), Some(&mut short_delta));
    assert!(matches!(result, Err(ConvError::ShapeMismatch { .. })));

    assert_eq!(layer.delta(), delta.as_slice());
    assert_eq!(layer.bias_updates(), bias.as_slice());
    assert_eq!(layer.weight_updates(), weights.as_slice());
    assert!(short_delta.iter().all(|&v| v == 0.0));
}

#[test]
fn test_retry_after_rejected_backward_matches_single_call() {
    let config = ConvLayerConfig::new(1, 4, 4, 2, 2, 3).with_pad(1);
    let (mut retried, input, upstream, mut workspace) = setup(config.clone(), 13);
    let (mut fresh, _, _, _) = setup(config, 13);

    for layer in [&mut retried, &mut fresh] {
        layer.forward(&input, workspace.as_mut_slice()).unwrap();
        layer.delta_mut().copy_from_slice(&upstream);
    }

    assert!(retried.backward(&input, &mut [0.0f32; 1], None).is_err());
    retried
        .backward(&input, workspace.as_mut_slice(), None)
        .unwrap();
    fresh.backward(&input, workspace.as_mut_slice(), None).unwrap();

    assert_eq!(retried.bias_updates(), fresh.bias_updates());
    assert_eq!(retried.weight_updates(), fresh.weight_updates());
}
