//! Convolution geometry
//!
//! `ConvShape` captures the configuration that every buffer size in a
//! convolution layer is derived from. Output dimensions are never stored; they
//! are recomputed from the input dimensions so a resize can never leave them
//! stale.

use crate::error::{ConvError, Result};

/// Geometry of one (possibly grouped) 2D convolution over an NCHW batch.
///
/// # Fields
///
/// * `batch` - Number of samples per forward call
/// * `h`, `w`, `c` - Input height, width and channel count
/// * `n` - Number of filters (output channels)
/// * `size` - Square kernel size
/// * `stride` - Stride in both spatial directions
/// * `pad` - Symmetric zero padding
/// * `groups` - Number of independent channel groups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvShape {
    pub batch: usize,
    pub h: usize,
    pub w: usize,
    pub c: usize,
    pub n: usize,
    pub size: usize,
    pub stride: usize,
    pub pad: usize,
    pub groups: usize,
}

impl ConvShape {
    /// Check the invariants every other method relies on.
    ///
    /// Both channel counts must be divisible by `groups`, the kernel must fit
    /// inside the padded input, and no extent may be zero.
    pub fn validate(&self) -> Result<()> {
        if self.batch == 0 || self.h == 0 || self.w == 0 || self.c == 0 || self.n == 0 {
            return Err(ConvError::InvalidConfig(format!(
                "batch, height, width, channels and filters must be positive \
                 (got batch={}, h={}, w={}, c={}, n={})",
                self.batch, self.h, self.w, self.c, self.n
            )));
        }
        if self.size == 0 {
            return Err(ConvError::InvalidConfig("kernel size must be positive".into()));
        }
        if self.stride == 0 {
            return Err(ConvError::InvalidConfig("stride must be positive".into()));
        }
        if self.groups == 0 {
            return Err(ConvError::InvalidConfig("groups must be positive".into()));
        }
        if self.c % self.groups != 0 {
            return Err(ConvError::InvalidConfig(format!(
                "input channels {} not divisible by groups {}",
                self.c, self.groups
            )));
        }
        if self.n % self.groups != 0 {
            return Err(ConvError::InvalidConfig(format!(
                "output channels {} not divisible by groups {}",
                self.n, self.groups
            )));
        }
        if self.h + 2 * self.pad < self.size || self.w + 2 * self.pad < self.size {
            return Err(ConvError::InvalidConfig(format!(
                "kernel {} larger than padded input {}x{} (pad {})",
                self.size, self.w, self.h, self.pad
            )));
        }
        Ok(())
    }

    /// Output height: `(h + 2*pad - size) / stride + 1`
    pub fn out_h(&self) -> usize {
        (self.h + 2 * self.pad - self.size) / self.stride + 1
    }

    /// Output width: `(w + 2*pad - size) / stride + 1`
    pub fn out_w(&self) -> usize {
        (self.w + 2 * self.pad - self.size) / self.stride + 1
    }

    /// Output channels (same as the filter count).
    pub fn out_c(&self) -> usize {
        self.n
    }

    /// Elements of one input sample (`c * h * w`).
    pub fn inputs(&self) -> usize {
        self.c * self.h * self.w
    }

    /// Elements of one output sample (`n * out_h * out_w`).
    pub fn outputs(&self) -> usize {
        self.n * self.out_h() * self.out_w()
    }

    /// Spatial positions per output channel.
    pub fn out_spatial(&self) -> usize {
        self.out_h() * self.out_w()
    }

    /// Input channels seen by each group.
    pub fn group_in(&self) -> usize {
        self.c / self.groups
    }

    /// Filters owned by each group.
    pub fn group_out(&self) -> usize {
        self.n / self.groups
    }

    /// Weights of one filter: `c / groups * size * size`.
    pub fn filter_len(&self) -> usize {
        self.group_in() * self.size * self.size
    }

    /// Total weights: `c * n * size * size / groups`.
    pub fn nweights(&self) -> usize {
        self.n * self.filter_len()
    }

    /// Elements of one unfolded column tile for a single group.
    pub fn col_len(&self) -> usize {
        self.filter_len() * self.out_spatial()
    }

    /// Same shape with new spatial input dimensions.
    pub fn with_spatial(&self, w: usize, h: usize) -> Self {
        Self { w, h, ..*self }
    }
}
