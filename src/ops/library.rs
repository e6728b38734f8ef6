//! Matrix product through `faer`.
//!
//! Buffers are row-major while `faer` views are column-major, so the product
//! is taken transposed: `Cᵀ = Bᵀ · Aᵀ`, where every transpose is just the
//! same slice read column-major.

use crate::dtype::{DType, Float};
use faer::linalg::matmul::matmul as faer_matmul;
use faer::{Accum, MatMut, MatRef, Par};

macro_rules! product {
    ($name:ident, $ty:ty) => {
        fn $name(a: &[$ty], b: &[$ty], out: &mut [$ty], m: usize, k: usize, n: usize, par: Par) {
            let lhs = MatRef::from_column_major_slice(b, n, k);
            let rhs = MatRef::from_column_major_slice(a, k, m);
            let mut dst = MatMut::from_column_major_slice_mut(out, n, m);
            faer_matmul(dst.as_mut(), Accum::Replace, lhs, rhs, 1.0, par);
        }
    };
}

product!(product_f32, f32);
product!(product_f64, f64);

/// Row-major `out[m×n] = a[m×k] · b[k×n]`.
///
/// With `workers > 1` the product runs on the current rayon pool.
pub fn matmul<T: Float>(
    a: &[T],
    b: &[T],
    out: &mut [T],
    m: usize,
    k: usize,
    n: usize,
    workers: usize,
) {
    out.fill(T::ZERO);
    if m == 0 || n == 0 || k == 0 {
        return;
    }
    let par = if workers > 1 {
        Par::rayon(workers)
    } else {
        Par::Seq
    };
    match T::DTYPE {
        DType::Float32 => product_f32(
            bytemuck::cast_slice(a),
            bytemuck::cast_slice(b),
            bytemuck::cast_slice_mut(out),
            m,
            k,
            n,
            par,
        ),
        DType::Float64 => product_f64(
            bytemuck::cast_slice(a),
            bytemuck::cast_slice(b),
            bytemuck::cast_slice_mut(out),
            m,
            k,
            n,
            par,
        ),
        other => unreachable!("no library kernel for {other}"),
    }
}
