//! General matrix multiply
//!
//! `C = alpha * op(A) * op(B) + beta * C` on row-major matrices, where `op`
//! optionally transposes its operand. With the `blas` feature enabled the call
//! is forwarded to `cblas::sgemm`; otherwise portable loops are used. Both
//! paths share the same signature so the convolution backends never need to
//! know which one is active.

/// Row-major SGEMM with transpose flags.
///
/// # Arguments
///
/// * `transpose_a`, `transpose_b` - Whether `A` / `B` are read transposed
/// * `m`, `n`, `k` - `op(A)` is `m × k`, `op(B)` is `k × n`, `C` is `m × n`
/// * `lda`, `ldb`, `ldc` - Row strides of the stored matrices
/// * `beta` - Scale applied to `C` before accumulation (`0.0` overwrites)
#[allow(clippy::too_many_arguments)]
pub fn gemm(
    transpose_a: bool,
    transpose_b: bool,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    beta: f32,
    c: &mut [f32],
    ldc: usize,
) {
    if m == 0 || n == 0 {
        return;
    }

    #[cfg(feature = "blas")]
    {
        sgemm_blas(
            transpose_a, transpose_b, m, n, k, alpha, a, lda, b, ldb, beta, c, ldc,
        );
    }

    #[cfg(not(feature = "blas"))]
    {
        scale_c(m, n, beta, c, ldc);
        match (transpose_a, transpose_b) {
            (false, false) => gemm_nn(m, n, k, alpha, a, lda, b, ldb, c, ldc),
            (false, true) => gemm_nt(m, n, k, alpha, a, lda, b, ldb, c, ldc),
            (true, false) => gemm_tn(m, n, k, alpha, a, lda, b, ldb, c, ldc),
            (true, true) => gemm_tt(m, n, k, alpha, a, lda, b, ldb, c, ldc),
        }
    }
}

#[cfg(feature = "blas")]
#[allow(clippy::too_many_arguments)]
fn sgemm_blas(
    transpose_a: bool,
    transpose_b: bool,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    beta: f32,
    c: &mut [f32],
    ldc: usize,
) {
    use cblas::{sgemm, Layout, Transpose};

    let trans_a = if transpose_a {
        Transpose::Ordinary
    } else {
        Transpose::None
    };
    let trans_b = if transpose_b {
        Transpose::Ordinary
    } else {
        Transpose::None
    };

    // SAFETY: slice bounds are checked by the callers against m/n/k and the
    // leading dimensions; cblas only reads `a`/`b` and writes inside `c`.
    unsafe {
        sgemm(
            Layout::RowMajor,
            trans_a,
            trans_b,
            m as i32,
            n as i32,
            k as i32,
            alpha,
            a,
            lda as i32,
            b,
            ldb as i32,
            beta,
            c,
            ldc as i32,
        );
    }
}

#[cfg(not(feature = "blas"))]
fn scale_c(m: usize, n: usize, beta: f32, c: &mut [f32], ldc: usize) {
    if beta == 1.0 {
        return;
    }
    for i in 0..m {
        let row = &mut c[i * ldc..i * ldc + n];
        if beta == 0.0 {
            row.iter_mut().for_each(|v| *v = 0.0);
        } else {
            row.iter_mut().for_each(|v| *v *= beta);
        }
    }
}

#[cfg(not(feature = "blas"))]
#[allow(clippy::too_many_arguments)]
fn gemm_nn(
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    c: &mut [f32],
    ldc: usize,
) {
    for i in 0..m {
        let c_row = &mut c[i * ldc..i * ldc + n];
        for p in 0..k {
            let a_part = alpha * a[i * lda + p];
            if a_part == 0.0 {
                continue;
            }
            let b_row = &b[p * ldb..p * ldb + n];
            for (cv, &bv) in c_row.iter_mut().zip(b_row) {
                *cv += a_part * bv;
            }
        }
    }
}

#[cfg(not(feature = "blas"))]
#[allow(clippy::too_many_arguments)]
fn gemm_nt(
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    c: &mut [f32],
    ldc: usize,
) {
    for i in 0..m {
        let a_row = &a[i * lda..i * lda + k];
        for j in 0..n {
            let b_row = &b[j * ldb..j * ldb + k];
            let dot: f32 = a_row.iter().zip(b_row).map(|(x, y)| x * y).sum();
            c[i * ldc + j] += alpha * dot;
        }
    }
}

#[cfg(not(feature = "blas"))]
#[allow(clippy::too_many_arguments)]
fn gemm_tn(
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    c: &mut [f32],
    ldc: usize,
) {
    for i in 0..m {
        let c_row = &mut c[i * ldc..i * ldc + n];
        for p in 0..k {
            let a_part = alpha * a[p * lda + i];
            if a_part == 0.0 {
                continue;
            }
            let b_row = &b[p * ldb..p * ldb + n];
            for (cv, &bv) in c_row.iter_mut().zip(b_row) {
                *cv += a_part * bv;
            }
        }
    }
}

#[cfg(not(feature = "blas"))]
#[allow(clippy::too_many_arguments)]
fn gemm_tt(
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    c: &mut [f32],
    ldc: usize,
) {
    for i in 0..m {
        for j in 0..n {
            let mut dot = 0.0f32;
            for p in 0..k {
                dot += a[p * lda + i] * b[j * ldb + p];
            }
            c[i * ldc + j] += alpha * dot;
        }
    }
}
