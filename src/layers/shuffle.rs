//! Channel shuffle layer
//!
//! Views the channels of each sample as a `groups × (channels / groups)`
//! matrix and transposes it, moving every channel's spatial plane as one
//! contiguous block. Placed between grouped convolutions so that the next
//! convolution's groups each see channels from every previous group.

use crate::config::{ShuffleConfig, UpdateArgs};
use crate::error::{check_len, ConvError, Result};
use crate::layers::Layer;
use crate::utils::blas::axpy;

/// Copy `input` to `output` with the `group_row × group_column` channel
/// matrix transposed. Channel `i * group_column + j` lands at
/// `j * group_row + i`.
fn transpose_channels(
    input: &[f32],
    output: &mut [f32],
    group_row: usize,
    group_column: usize,
    len: usize,
) {
    for i in 0..group_row {
        for j in 0..group_column {
            let src = (i * group_column + j) * len;
            let dst = (j * group_row + i) * len;
            output[dst..dst + len].copy_from_slice(&input[src..src + len]);
        }
    }
}

/// Same permutation as [`transpose_channels`], adding into `output`.
fn transpose_channels_add(
    input: &[f32],
    output: &mut [f32],
    group_row: usize,
    group_column: usize,
    len: usize,
) {
    for i in 0..group_row {
        for j in 0..group_column {
            let src = (i * group_column + j) * len;
            let dst = (j * group_row + i) * len;
            axpy(1.0, &input[src..src + len], &mut output[dst..dst + len]);
        }
    }
}

/// Parameter-free channel permutation.
///
/// The spatial extent is unchanged; only channel order is permuted.
pub struct ShuffleLayer {
    batch: usize,
    height: usize,
    width: usize,
    channels: usize,
    groups: usize,
    output: Vec<f32>,
    delta: Vec<f32>,
}

impl ShuffleLayer {
    pub fn new(config: &ShuffleConfig) -> Result<Self> {
        config.validate()?;
        let outputs = config.channels * config.height * config.width;
        tracing::debug!("shuffle {}", outputs);

        Ok(Self {
            batch: config.batch,
            height: config.height,
            width: config.width,
            channels: config.channels,
            groups: config.groups,
            output: vec![0.0f32; config.batch * outputs],
            delta: vec![0.0f32; config.batch * outputs],
        })
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn delta(&self) -> &[f32] {
        &self.delta
    }

    fn spatial(&self) -> usize {
        self.height * self.width
    }
}

impl Layer for ShuffleLayer {
    /// Transpose the `groups × channels/groups` channel matrix of every sample.
    fn forward(&mut self, input: &[f32], _workspace: &mut [f32]) -> Result<()> {
        check_len("input", self.output.len(), input.len())?;
        let sample = self.outputs();
        let (rows, cols, len) = (self.groups, self.channels / self.groups, self.spatial());

        for (src, dst) in input
            .chunks_exact(sample)
            .zip(self.output.chunks_exact_mut(sample))
        {
            transpose_channels(src, dst, rows, cols, len);
        }
        Ok(())
    }

    /// Apply the forward transpose with the factors swapped, which is its
    /// inverse, and add the permuted delta into `input_delta`.
    fn backward(
        &mut self,
        _input: &[f32],
        _workspace: &mut [f32],
        input_delta: Option<&mut [f32]>,
    ) -> Result<()> {
        let Some(input_delta) = input_delta else {
            return Ok(());
        };
        check_len("input delta", self.delta.len(), input_delta.len())?;
        let sample = self.outputs();
        let (rows, cols, len) = (self.channels / self.groups, self.groups, self.spatial());

        for (src, dst) in self
            .delta
            .chunks_exact(sample)
            .zip(input_delta.chunks_exact_mut(sample))
        {
            transpose_channels_add(src, dst, rows, cols, len);
        }
        Ok(())
    }

    fn update(&mut self, _args: &UpdateArgs) {}

    fn resize(&mut self, width: usize, height: usize) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(ConvError::InvalidConfig(format!(
                "shuffle resize to {}x{} has an empty spatial extent",
                width, height
            )));
        }
        self.width = width;
        self.height = height;
        let len = self.batch * self.outputs();
        self.output = vec![0.0f32; len];
        self.delta = vec![0.0f32; len];
        tracing::debug!(width, height, "resized shuffle layer");
        Ok(())
    }

    fn output(&self) -> &[f32] {
        &self.output
    }

    fn delta_mut(&mut self) -> &mut [f32] {
        &mut self.delta
    }

    fn inputs(&self) -> usize {
        self.outputs()
    }

    fn outputs(&self) -> usize {
        self.channels * self.spatial()
    }

    fn batch(&self) -> usize {
        self.batch
    }

    fn workspace_size(&self) -> usize {
        0
    }

    fn parameter_count(&self) -> usize {
        0
    }
}
