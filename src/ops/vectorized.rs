//! Fixed-width lane kernels.
//!
//! Bodies walk `LANES` elements at a time with `chunks_exact`, which the
//! compiler lowers to SIMD on every target, and finish with an explicit
//! scalar remainder. With the `simd` feature on an AVX2 build, the `f32`
//! element-wise ops and the boolean lane checks use intrinsics directly.
//!
//! Element-wise results and integer sums are bit-identical to
//! [`scalar`](super::scalar). Float reductions keep one compensated
//! accumulator per lane and merge them in lane order, so they agree with the
//! scalar kernels to within rounding.

use super::scalar::Neumaier;
use crate::dtype::{Float, Integer, Numeric};

/// Elements per step for numeric kernels.
pub const LANES: usize = 8;

/// Bytes per step for boolean kernels.
pub const BYTE_LANES: usize = 32;

#[inline]
fn binary<T: Copy>(a: &[T], b: &[T], out: &mut [T], f: impl Fn(T, T) -> T) {
    debug_assert!(a.len() == out.len() && b.len() == out.len());
    let xs = a.chunks_exact(LANES);
    let ys = b.chunks_exact(LANES);
    let (x_rem, y_rem) = (xs.remainder(), ys.remainder());
    let mut outs = out.chunks_exact_mut(LANES);
    for ((o, x), y) in (&mut outs).zip(xs).zip(ys) {
        for lane in 0..LANES {
            o[lane] = f(x[lane], y[lane]);
        }
    }
    for ((o, &x), &y) in outs.into_remainder().iter_mut().zip(x_rem).zip(y_rem) {
        *o = f(x, y);
    }
}

macro_rules! elementwise {
    ($name:ident, $bound:ident, $method:ident, $avx:ident) => {
        pub fn $name<T: $bound>(a: &[T], b: &[T], out: &mut [T]) {
            #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
            if T::DTYPE == crate::dtype::DType::Float32 {
                avx2::$avx(
                    bytemuck::cast_slice(a),
                    bytemuck::cast_slice(b),
                    bytemuck::cast_slice_mut(out),
                );
                return;
            }
            binary(a, b, out, T::$method);
        }
    };
}

elementwise!(add, Numeric, add, add_f32);
elementwise!(sub, Numeric, sub, sub_f32);
elementwise!(mul, Numeric, mul, mul_f32);
elementwise!(div, Float, div, div_f32);

/// Compensated sum, one accumulator per lane.
pub fn sum<T: Float>(x: &[T]) -> T {
    sum_partial(x).total()
}

/// Merges lane accumulators in lane order, then adds the remainder.
fn merge_lanes<T: Float>(lanes: [Neumaier<T>; LANES], rem: impl Iterator<Item = T>) -> Neumaier<T> {
    let mut total = Neumaier::new();
    for lane in lanes {
        total.merge(lane);
    }
    for v in rem {
        total.add(v);
    }
    total
}

pub(crate) fn sum_partial<T: Float>(x: &[T]) -> Neumaier<T> {
    let chunks = x.chunks_exact(LANES);
    let rem = chunks.remainder();
    let mut lanes = [Neumaier::new(); LANES];
    for chunk in chunks {
        for (acc, &v) in lanes.iter_mut().zip(chunk) {
            acc.add(v);
        }
    }
    merge_lanes(lanes, rem.iter().copied())
}

/// Wrapping sum widened to `i64`; equal to the scalar result.
pub fn sum_int<T: Integer>(x: &[T]) -> i64 {
    let chunks = x.chunks_exact(LANES);
    let rem = chunks.remainder();
    let mut lanes = [0i64; LANES];
    for chunk in chunks {
        for (acc, &v) in lanes.iter_mut().zip(chunk) {
            *acc = acc.wrapping_add(v.widen());
        }
    }
    let body = lanes.iter().fold(0i64, |acc, &v| acc.wrapping_add(v));
    rem.iter().fold(body, |acc, &v| acc.wrapping_add(v.widen()))
}

/// Compensated `f64` sum of integers, one accumulator per lane.
pub(crate) fn sum_int_f64<T: Integer>(x: &[T]) -> Neumaier<f64> {
    let chunks = x.chunks_exact(LANES);
    let rem = chunks.remainder();
    let mut lanes = [Neumaier::new(); LANES];
    for chunk in chunks {
        for (acc, &v) in lanes.iter_mut().zip(chunk) {
            acc.add(v.to_f64());
        }
    }
    merge_lanes(lanes, rem.iter().map(|&v| v.to_f64()))
}

/// Compensated dot product, one accumulator per lane.
pub fn dot<T: Float>(a: &[T], b: &[T]) -> T {
    dot_partial(a, b).total()
}

pub(crate) fn dot_partial<T: Float>(a: &[T], b: &[T]) -> Neumaier<T> {
    debug_assert_eq!(a.len(), b.len());
    let xs = a.chunks_exact(LANES);
    let ys = b.chunks_exact(LANES);
    let (x_rem, y_rem) = (xs.remainder(), ys.remainder());
    let mut lanes = [Neumaier::new(); LANES];
    for (x, y) in xs.zip(ys) {
        for lane in 0..LANES {
            lanes[lane].add(x[lane].mul(y[lane]));
        }
    }
    merge_lanes(lanes, x_rem.iter().zip(y_rem).map(|(&x, &y)| x.mul(y)))
}

/// Checks `BYTE_LANES` bytes at a time and confirms a hit with a scalar scan.
pub fn all(x: &[u8]) -> bool {
    let chunks = x.chunks_exact(BYTE_LANES);
    let rem = chunks.remainder();
    for chunk in chunks {
        if lane_has_zero(chunk) && chunk.contains(&0) {
            return false;
        }
    }
    rem.iter().all(|&b| b != 0)
}

/// Checks `BYTE_LANES` bytes at a time and confirms a hit with a scalar scan.
pub fn any(x: &[u8]) -> bool {
    let chunks = x.chunks_exact(BYTE_LANES);
    let rem = chunks.remainder();
    for chunk in chunks {
        if lane_has_nonzero(chunk) && chunk.iter().any(|&b| b != 0) {
            return true;
        }
    }
    rem.iter().any(|&b| b != 0)
}

#[inline]
fn lane_has_zero(chunk: &[u8]) -> bool {
    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        avx2::zero_mask(chunk) != 0
    }
    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    {
        !chunk.iter().fold(true, |acc, &b| acc & (b != 0))
    }
}

#[inline]
fn lane_has_nonzero(chunk: &[u8]) -> bool {
    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        avx2::zero_mask(chunk) != u32::MAX
    }
    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    {
        chunk.iter().fold(0u8, |acc, &b| acc | b) != 0
    }
}

/// `row += alpha * b_row`, `LANES` columns per step.
#[inline]
fn axpy<T: Numeric>(row: &mut [T], alpha: T, b_row: &[T]) {
    let bs = b_row.chunks_exact(LANES);
    let b_rem = bs.remainder();
    let mut rows = row.chunks_exact_mut(LANES);
    for (o, b) in (&mut rows).zip(bs) {
        for lane in 0..LANES {
            o[lane] = o[lane].add(alpha.mul(b[lane]));
        }
    }
    for (o, &b) in rows.into_remainder().iter_mut().zip(b_rem) {
        *o = o.add(alpha.mul(b));
    }
}

/// Row-major `out[m×n] = a[m×k] · b[k×n]`.
///
/// Four output rows share each pass over `b`. Every element accumulates in
/// `p` order, matching the scalar kernel bit for bit.
pub fn matmul<T: Float>(a: &[T], b: &[T], out: &mut [T], m: usize, k: usize, n: usize) {
    debug_assert!(a.len() == m * k && b.len() == k * n && out.len() == m * n);
    out.fill(T::ZERO);
    if m == 0 || n == 0 {
        return;
    }
    let mut blocks = out.chunks_exact_mut(4 * n);
    let mut i = 0;
    for block in &mut blocks {
        let (r0, rest) = block.split_at_mut(n);
        let (r1, rest) = rest.split_at_mut(n);
        let (r2, r3) = rest.split_at_mut(n);
        for p in 0..k {
            let b_row = &b[p * n..(p + 1) * n];
            axpy(r0, a[i * k + p], b_row);
            axpy(r1, a[(i + 1) * k + p], b_row);
            axpy(r2, a[(i + 2) * k + p], b_row);
            axpy(r3, a[(i + 3) * k + p], b_row);
        }
        i += 4;
    }
    for row in blocks.into_remainder().chunks_exact_mut(n) {
        for p in 0..k {
            axpy(row, a[i * k + p], &b[p * n..(p + 1) * n]);
        }
        i += 1;
    }
}

#[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
mod avx2 {
    use core::arch::x86_64::{
        __m256i, _mm256_add_ps, _mm256_cmpeq_epi8, _mm256_div_ps, _mm256_loadu_ps,
        _mm256_loadu_si256, _mm256_movemask_epi8, _mm256_mul_ps, _mm256_setzero_si256,
        _mm256_storeu_ps, _mm256_sub_ps,
    };

    macro_rules! binary_f32 {
        ($name:ident, $intrinsic:ident, $op:tt) => {
            pub(super) fn $name(a: &[f32], b: &[f32], out: &mut [f32]) {
                let body = out.len() / 8 * 8;
                for i in (0..body).step_by(8) {
                    // SAFETY: `i + 8 <= body <= len` for all three slices;
                    // unaligned loads and stores; AVX2 is enabled at compile
                    // time by the surrounding `cfg`.
                    unsafe {
                        let x = _mm256_loadu_ps(a.as_ptr().add(i));
                        let y = _mm256_loadu_ps(b.as_ptr().add(i));
                        _mm256_storeu_ps(out.as_mut_ptr().add(i), $intrinsic(x, y));
                    }
                }
                for ((o, &x), &y) in out[body..].iter_mut().zip(&a[body..]).zip(&b[body..]) {
                    *o = x $op y;
                }
            }
        };
    }

    binary_f32!(add_f32, _mm256_add_ps, +);
    binary_f32!(sub_f32, _mm256_sub_ps, -);
    binary_f32!(mul_f32, _mm256_mul_ps, *);
    binary_f32!(div_f32, _mm256_div_ps, /);

    /// Bit `i` is set when `chunk[i] == 0`. `chunk` is exactly 32 bytes.
    #[allow(clippy::cast_sign_loss)]
    pub(super) fn zero_mask(chunk: &[u8]) -> u32 {
        debug_assert_eq!(chunk.len(), super::BYTE_LANES);
        // SAFETY: `chunk` holds 32 readable bytes; the load is unaligned.
        unsafe {
            let v = _mm256_loadu_si256(chunk.as_ptr().cast::<__m256i>());
            _mm256_movemask_epi8(_mm256_cmpeq_epi8(v, _mm256_setzero_si256())) as u32
        }
    }
}
