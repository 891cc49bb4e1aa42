//! Configuration structures for layers and parameter updates
//!
//! Layer configurations can be built in code or parsed from JSON. Parsing
//! always runs the same validation as layer construction, so a config that
//! loads successfully also constructs successfully.
//!
//! # Example
//!
//! ```json
//! {
//!   "batch": 8,
//!   "height": 28,
//!   "width": 28,
//!   "channels": 16,
//!   "filters": 32,
//!   "size": 3,
//!   "stride": 1,
//!   "pad": 1,
//!   "groups": 4,
//!   "activation": "leaky",
//!   "batch_normalize": true
//! }
//! ```

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{ConvError, Result};
use crate::quantization::Quantization;
use crate::shape::ConvShape;
use crate::utils::Activation;

fn one() -> usize {
    1
}

fn one_f32() -> f32 {
    1.0
}

/// Configuration of one convolution layer.
///
/// `stride`, `groups` and `learning_rate_scale` default to 1, `pad` to 0,
/// `activation` to logistic and every flag to `false`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ConvLayerConfig {
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    /// Number of filters (output channels)
    pub filters: usize,
    /// Square kernel size
    pub size: usize,
    #[serde(default = "one")]
    pub stride: usize,
    #[serde(default)]
    pub pad: usize,
    #[serde(default = "one")]
    pub groups: usize,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default)]
    pub batch_normalize: bool,
    /// Binarize weights in the forward pass
    #[serde(default)]
    pub binary: bool,
    /// Binarize weights and input in the forward pass
    #[serde(default)]
    pub xnor: bool,
    /// Allocate first/second-moment buffers for adaptive-moment updates
    #[serde(default)]
    pub adam: bool,
    /// Per-layer multiplier on the update learning rate
    #[serde(default = "one_f32")]
    pub learning_rate_scale: f32,
}

impl ConvLayerConfig {
    /// Minimal config: stride 1, no padding, one group, logistic activation.
    pub fn new(
        batch: usize,
        height: usize,
        width: usize,
        channels: usize,
        filters: usize,
        size: usize,
    ) -> Self {
        Self {
            batch,
            height,
            width,
            channels,
            filters,
            size,
            stride: 1,
            pad: 0,
            groups: 1,
            activation: Activation::default(),
            batch_normalize: false,
            binary: false,
            xnor: false,
            adam: false,
            learning_rate_scale: 1.0,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_pad(mut self, pad: usize) -> Self {
        self.pad = pad;
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_batch_normalize(mut self, enabled: bool) -> Self {
        self.batch_normalize = enabled;
        self
    }

    pub fn with_binary(mut self, enabled: bool) -> Self {
        self.binary = enabled;
        self
    }

    pub fn with_xnor(mut self, enabled: bool) -> Self {
        self.xnor = enabled;
        self
    }

    pub fn with_adam(mut self, enabled: bool) -> Self {
        self.adam = enabled;
        self
    }

    /// Geometry described by this config.
    pub fn shape(&self) -> ConvShape {
        ConvShape {
            batch: self.batch,
            h: self.height,
            w: self.width,
            c: self.channels,
            n: self.filters,
            size: self.size,
            stride: self.stride,
            pad: self.pad,
            groups: self.groups,
        }
    }

    /// Resolved quantization mode.
    pub fn quantization(&self) -> Result<Quantization> {
        Quantization::from_flags(self.binary, self.xnor)
    }

    /// Reject shape and flag combinations the layer cannot represent.
    pub fn validate(&self) -> Result<()> {
        self.shape().validate()?;
        self.quantization()?;
        if !self.learning_rate_scale.is_finite() || self.learning_rate_scale < 0.0 {
            return Err(ConvError::InvalidConfig(format!(
                "learning_rate_scale must be finite and non-negative, got {}",
                self.learning_rate_scale
            )));
        }
        Ok(())
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ConvLayerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Loads a convolution layer configuration from a JSON file.
///
/// # Examples
///
/// ```no_run
/// use convnet_core::config::load_config;
///
/// let cfg = load_config("config/conv_grouped.json").unwrap();
/// assert_eq!(cfg.groups, 4);
/// ```
pub fn load_config(path: impl AsRef<Path>) -> Result<ConvLayerConfig> {
    let contents = fs::read_to_string(path)?;
    ConvLayerConfig::from_json(&contents)
}

/// Configuration of one channel-shuffle layer.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct ShuffleConfig {
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub groups: usize,
}

impl ShuffleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch == 0 || self.height == 0 || self.width == 0 || self.channels == 0 {
            return Err(ConvError::InvalidConfig(
                "shuffle batch, height, width and channels must be positive".into(),
            ));
        }
        if self.groups == 0 || self.channels % self.groups != 0 {
            return Err(ConvError::InvalidConfig(format!(
                "shuffle channels {} not divisible by groups {}",
                self.channels, self.groups
            )));
        }
        Ok(())
    }
}

fn default_b1() -> f32 {
    0.9
}

fn default_b2() -> f32 {
    0.999
}

fn default_eps() -> f32 {
    1e-8
}

/// Hyperparameters of one update step.
///
/// Momentum SGD uses `learning_rate`, `momentum`, `decay` and `batch`. The
/// adaptive-moment fields are only read when `adam` is set and the layer was
/// built with moment buffers.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct UpdateArgs {
    pub learning_rate: f32,
    #[serde(default)]
    pub momentum: f32,
    #[serde(default)]
    pub decay: f32,
    pub batch: usize,
    #[serde(default)]
    pub adam: bool,
    #[serde(default = "default_b1")]
    pub b1: f32,
    #[serde(default = "default_b2")]
    pub b2: f32,
    #[serde(default = "default_eps")]
    pub eps: f32,
    /// Update step counter for bias correction, starting at 1
    #[serde(default = "one")]
    pub t: usize,
}

impl UpdateArgs {
    /// Momentum SGD step.
    pub fn sgd(learning_rate: f32, momentum: f32, decay: f32, batch: usize) -> Self {
        Self {
            learning_rate,
            momentum,
            decay,
            batch,
            adam: false,
            b1: default_b1(),
            b2: default_b2(),
            eps: default_eps(),
            t: 1,
        }
    }

    /// Adaptive-moment step number `t` (1-based).
    pub fn adam(learning_rate: f32, decay: f32, batch: usize, t: usize) -> Self {
        Self {
            adam: true,
            t,
            ..Self::sgd(learning_rate, 0.0, decay, batch)
        }
    }

    /// Reject arguments that would write non-finite values into parameters.
    pub fn validate(&self) -> Result<()> {
        if self.batch == 0 {
            return Err(ConvError::InvalidConfig("update batch must be positive".into()));
        }
        if !self.learning_rate.is_finite() {
            return Err(ConvError::InvalidConfig(format!(
                "learning rate must be finite, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}
