//! Host convolution through unfold + matrix multiply.

use crate::backend::ConvBackend;
use crate::error::{check_len, check_workspace, Result};
use crate::shape::ConvShape;
use crate::utils::gemm::gemm;
use crate::utils::im2col::{col2im, im2col};

/// Portable backend: one unfolded column tile per (sample, group).
///
/// For group `g` the filters `g * n/groups ..` see only input channels
/// `g * c/groups ..`, so each group is an independent
/// `(n/groups) × (c/groups·size²) · (c/groups·size²) × (out_h·out_w)` product.
/// A 1×1, stride-1, unpadded kernel goes through exactly the same path; its
/// unfold degenerates to a copy.
#[derive(Debug, Clone)]
pub struct PortableBackend {
    shape: ConvShape,
}

impl PortableBackend {
    pub fn new(shape: ConvShape) -> Self {
        Self { shape }
    }

    fn check_io(&self, input: &[f32], weights: &[f32], workspace: &[f32]) -> Result<()> {
        let s = &self.shape;
        check_len("input", s.batch * s.inputs(), input.len())?;
        check_len("weights", s.nweights(), weights.len())?;
        check_workspace(self.workspace_size(), workspace)
    }
}

impl ConvBackend for PortableBackend {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn shape(&self) -> &ConvShape {
        &self.shape
    }

    fn reshape(&mut self, shape: &ConvShape) -> Result<()> {
        self.shape = *shape;
        Ok(())
    }

    /// `out_h * out_w * size² * c / groups * sizeof(f32)`: one column tile.
    fn workspace_size(&self) -> usize {
        self.shape.col_len() * std::mem::size_of::<f32>()
    }

    fn forward(
        &self,
        input: &[f32],
        weights: &[f32],
        workspace: &mut [f32],
        output: &mut [f32],
    ) -> Result<()> {
        self.check_io(input, weights, workspace)?;
        let s = &self.shape;
        check_len("output", s.batch * s.outputs(), output.len())?;

        let m = s.group_out();
        let k = s.filter_len();
        let n = s.out_spatial();
        let group_step = s.group_in() * s.h * s.w;
        let col = &mut workspace[..s.col_len()];

        for (sample_in, sample_out) in input
            .chunks_exact(s.inputs())
            .zip(output.chunks_exact_mut(s.outputs()))
        {
            for g in 0..s.groups {
                let im = &sample_in[g * group_step..(g + 1) * group_step];
                im2col(im, s.group_in(), s.h, s.w, s.size, s.stride, s.pad, col);

                let a = &weights[g * m * k..(g + 1) * m * k];
                let c = &mut sample_out[g * m * n..(g + 1) * m * n];
                gemm(false, false, m, n, k, 1.0, a, k, col, n, 1.0, c, n);
            }
        }
        Ok(())
    }

    fn backward(
        &self,
        input: &[f32],
        delta: &[f32],
        weights: &[f32],
        workspace: &mut [f32],
        weight_updates: &mut [f32],
        mut input_delta: Option<&mut [f32]>,
    ) -> Result<()> {
        self.check_io(input, weights, workspace)?;
        let s = &self.shape;
        check_len("delta", s.batch * s.outputs(), delta.len())?;
        check_len("weight updates", s.nweights(), weight_updates.len())?;
        if let Some(dst) = input_delta.as_deref() {
            check_len("input delta", s.batch * s.inputs(), dst.len())?;
        }

        let m = s.group_out();
        let k = s.filter_len();
        let n = s.out_spatial();
        let group_step = s.group_in() * s.h * s.w;
        let col = &mut workspace[..s.col_len()];

        for b in 0..s.batch {
            let sample_in = &input[b * s.inputs()..(b + 1) * s.inputs()];
            let sample_delta = &delta[b * s.outputs()..(b + 1) * s.outputs()];

            for g in 0..s.groups {
                let im = &sample_in[g * group_step..(g + 1) * group_step];
                let d = &sample_delta[g * m * n..(g + 1) * m * n];

                // dW += delta · colᵀ
                im2col(im, s.group_in(), s.h, s.w, s.size, s.stride, s.pad, col);
                let dw = &mut weight_updates[g * m * k..(g + 1) * m * k];
                gemm(false, true, m, k, n, 1.0, d, n, col, n, 1.0, dw, k);

                if let Some(dst) = input_delta.as_deref_mut() {
                    // col = Wᵀ · delta, then fold onto the group's channels
                    let w = &weights[g * m * k..(g + 1) * m * k];
                    gemm(true, false, k, n, m, 1.0, w, k, d, n, 0.0, col, n);
                    let sample_dst = &mut dst[b * s.inputs()..(b + 1) * s.inputs()];
                    let im_delta = &mut sample_dst[g * group_step..(g + 1) * group_step];
                    col2im(col, s.group_in(), s.h, s.w, s.size, s.stride, s.pad, im_delta);
                }
            }
        }
        Ok(())
    }
}
