//! Unfold (im2col) and fold (col2im) for zero-padded square kernels.
//!
//! The column matrix has `channels * ksize * ksize` rows and
//! `out_h * out_w` columns. Row `r` holds, for every output position, the
//! input value seen by kernel tap `r`; taps falling in the padding read zero.

/// Output extent of one spatial dimension.
#[inline]
fn out_extent(extent: usize, ksize: usize, stride: usize, pad: usize) -> usize {
    (extent + 2 * pad - ksize) / stride + 1
}

/// Unfold a `channels × height × width` image into `data_col`.
///
/// Every element of the first `channels * ksize² * out_h * out_w` entries of
/// `data_col` is overwritten.
#[allow(clippy::too_many_arguments)]
pub fn im2col(
    data_im: &[f32],
    channels: usize,
    height: usize,
    width: usize,
    ksize: usize,
    stride: usize,
    pad: usize,
    data_col: &mut [f32],
) {
    let height_col = out_extent(height, ksize, stride, pad);
    let width_col = out_extent(width, ksize, stride, pad);
    let channels_col = channels * ksize * ksize;

    for c in 0..channels_col {
        let w_offset = c % ksize;
        let h_offset = (c / ksize) % ksize;
        let c_im = c / ksize / ksize;
        let plane = &data_im[c_im * height * width..(c_im + 1) * height * width];
        for h in 0..height_col {
            let row_out = &mut data_col[(c * height_col + h) * width_col..][..width_col];
            // Signed arithmetic for the padded coordinates.
            let im_row = (h_offset + h * stride) as isize - pad as isize;
            if im_row < 0 || im_row >= height as isize {
                row_out.iter_mut().for_each(|v| *v = 0.0);
                continue;
            }
            let src = &plane[im_row as usize * width..(im_row as usize + 1) * width];
            for (w, out) in row_out.iter_mut().enumerate() {
                let im_col = (w_offset + w * stride) as isize - pad as isize;
                *out = if im_col < 0 || im_col >= width as isize {
                    0.0
                } else {
                    src[im_col as usize]
                };
            }
        }
    }
}

/// Fold `data_col` back onto a `channels × height × width` image.
///
/// Overlapping receptive fields are summed, and the result is added to the
/// existing contents of `data_im`. Taps that fall in the padding are dropped.
#[allow(clippy::too_many_arguments)]
pub fn col2im(
    data_col: &[f32],
    channels: usize,
    height: usize,
    width: usize,
    ksize: usize,
    stride: usize,
    pad: usize,
    data_im: &mut [f32],
) {
    let height_col = out_extent(height, ksize, stride, pad);
    let width_col = out_extent(width, ksize, stride, pad);
    let channels_col = channels * ksize * ksize;

    for c in 0..channels_col {
        let w_offset = c % ksize;
        let h_offset = (c / ksize) % ksize;
        let c_im = c / ksize / ksize;
        let plane = &mut data_im[c_im * height * width..(c_im + 1) * height * width];
        for h in 0..height_col {
            let im_row = (h_offset + h * stride) as isize - pad as isize;
            if im_row < 0 || im_row >= height as isize {
                continue;
            }
            let row_in = &data_col[(c * height_col + h) * width_col..][..width_col];
            let dst = &mut plane[im_row as usize * width..(im_row as usize + 1) * width];
            for (w, &value) in row_in.iter().enumerate() {
                let im_col = (w_offset + w * stride) as isize - pad as isize;
                if im_col >= 0 && im_col < width as isize {
                    dst[im_col as usize] += value;
                }
            }
        }
    }
}
