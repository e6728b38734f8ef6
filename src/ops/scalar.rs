//! Scalar reference kernels.
//!
//! One element per step, in index order. Every other backend is checked
//! against these.

use crate::dtype::{Float, Integer, Numeric};

/// Neumaier-compensated running sum.
///
/// Once the running sum stops being finite it is carried as is; the
/// compensation only tracks rounding of finite sums.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Neumaier<T> {
    sum: T,
    compensation: T,
}

impl<T: Float> Neumaier<T> {
    pub(crate) const fn new() -> Self {
        Self {
            sum: T::ZERO,
            compensation: T::ZERO,
        }
    }

    pub(crate) fn from_parts(sum: T, compensation: T) -> Self {
        Self { sum, compensation }
    }

    pub(crate) fn parts(self) -> (T, T) {
        (self.sum, self.compensation)
    }

    #[inline]
    pub(crate) fn add(&mut self, x: T) {
        let t = self.sum.add(x);
        if !t.is_finite() {
            self.sum = t;
            return;
        }
        let lost = if self.sum.abs() >= x.abs() {
            self.sum.sub(t).add(x)
        } else {
            x.sub(t).add(self.sum)
        };
        self.compensation = self.compensation.add(lost);
        self.sum = t;
    }

    /// Folds another accumulator in, keeping its compensation.
    #[inline]
    pub(crate) fn merge(&mut self, other: Self) {
        self.add(other.sum);
        self.add(other.compensation);
    }

    #[inline]
    pub(crate) fn total(self) -> T {
        if self.sum.is_finite() {
            self.sum.add(self.compensation)
        } else {
            self.sum
        }
    }
}

/// `out[i] = a[i] + b[i]`.
pub fn add<T: Numeric>(a: &[T], b: &[T], out: &mut [T]) {
    debug_assert!(a.len() == out.len() && b.len() == out.len());
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = x.add(y);
    }
}

pub fn sub<T: Numeric>(a: &[T], b: &[T], out: &mut [T]) {
    debug_assert!(a.len() == out.len() && b.len() == out.len());
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = x.sub(y);
    }
}

pub fn mul<T: Numeric>(a: &[T], b: &[T], out: &mut [T]) {
    debug_assert!(a.len() == out.len() && b.len() == out.len());
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = x.mul(y);
    }
}

/// `out[i] = a[i] / b[i]` following IEEE rules for zeros.
pub fn div<T: Float>(a: &[T], b: &[T], out: &mut [T]) {
    debug_assert!(a.len() == out.len() && b.len() == out.len());
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = x.div(y);
    }
}

/// Compensated sum.
pub fn sum<T: Float>(x: &[T]) -> T {
    sum_partial(x).total()
}

pub(crate) fn sum_partial<T: Float>(x: &[T]) -> Neumaier<T> {
    let mut acc = Neumaier::new();
    for &v in x {
        acc.add(v);
    }
    acc
}

/// Wrapping sum widened to `i64`.
pub fn sum_int<T: Integer>(x: &[T]) -> i64 {
    x.iter().fold(0i64, |acc, &v| acc.wrapping_add(v.widen()))
}

/// Compensated `f64` sum of integers; never wraps.
pub(crate) fn sum_int_f64<T: Integer>(x: &[T]) -> Neumaier<f64> {
    let mut acc = Neumaier::new();
    for &v in x {
        acc.add(v.to_f64());
    }
    acc
}

/// Compensated dot product.
pub fn dot<T: Float>(a: &[T], b: &[T]) -> T {
    dot_partial(a, b).total()
}

pub(crate) fn dot_partial<T: Float>(a: &[T], b: &[T]) -> Neumaier<T> {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = Neumaier::new();
    for (&x, &y) in a.iter().zip(b) {
        acc.add(x.mul(y));
    }
    acc
}

/// Stops at the first zero byte.
pub fn all(x: &[u8]) -> bool {
    x.iter().all(|&b| b != 0)
}

/// Stops at the first nonzero byte.
pub fn any(x: &[u8]) -> bool {
    x.iter().any(|&b| b != 0)
}

/// Row-major `out[m×n] = a[m×k] · b[k×n]`, accumulated in `p` order.
pub fn matmul<T: Float>(a: &[T], b: &[T], out: &mut [T], m: usize, k: usize, n: usize) {
    debug_assert!(a.len() == m * k && b.len() == k * n && out.len() == m * n);
    out.fill(T::ZERO);
    for i in 0..m {
        let row = &mut out[i * n..(i + 1) * n];
        for p in 0..k {
            let alpha = a[i * k + p];
            for (o, &bv) in row.iter_mut().zip(&b[p * n..(p + 1) * n]) {
                *o = o.add(alpha.mul(bv));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compensated_sum_recovers_lost_bits() {
        let x = [1.0f64, 1e100, 1.0, -1e100];
        assert_eq!(sum(&x), 2.0);
        assert_eq!(x.iter().sum::<f64>(), 0.0);
    }

    #[test]
    fn infinities_survive_compensation() {
        assert_eq!(sum(&[f32::INFINITY]), f32::INFINITY);
        assert_eq!(sum(&[f64::INFINITY, 1.0]), f64::INFINITY);
        assert_eq!(sum(&[1.0, f64::NEG_INFINITY, 1.0]), f64::NEG_INFINITY);
        assert!(sum(&[f64::INFINITY, f64::NEG_INFINITY]).is_nan());
        assert!(sum(&[1.0, f32::NAN]).is_nan());
        assert_eq!(sum(&[f64::MAX, f64::MAX]), f64::INFINITY);
        assert_eq!(dot(&[f64::INFINITY, 1.0], &[1.0, 1.0]), f64::INFINITY);
    }

    #[test]
    fn merged_accumulators_keep_infinities() {
        let mut acc = sum_partial(&[1.0f64, 2.0]);
        acc.merge(sum_partial(&[f64::INFINITY]));
        acc.merge(sum_partial(&[3.0]));
        assert_eq!(acc.total(), f64::INFINITY);
    }

    #[test]
    fn integer_means_accumulate_without_wrapping() {
        let acc = sum_int_f64(&[i64::MAX, i64::MAX]);
        assert_eq!(acc.total(), 2.0 * i64::MAX as f64);
    }

    #[test]
    fn empty_inputs() {
        assert_eq!(sum::<f32>(&[]), 0.0);
        assert_eq!(sum_int::<i32>(&[]), 0);
        assert!(all(&[]));
        assert!(!any(&[]));
    }

    #[test]
    fn integer_sums_widen() {
        assert_eq!(sum_int(&[i32::MAX, i32::MAX]), 2 * i64::from(i32::MAX));
    }

    #[test]
    fn boolean_reductions() {
        assert!(all(&[1, 2, 255]));
        assert!(!all(&[1, 0, 1]));
        assert!(any(&[0, 0, 7]));
        assert!(!any(&[0, 0, 0]));
    }

    #[test]
    fn small_matmul() {
        let a = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [7.0f32, 8.0, 9.0, 10.0, 11.0, 12.0];
        let mut out = [f32::NAN; 4];
        matmul(&a, &b, &mut out, 2, 3, 2);
        assert_eq!(out, [58.0, 64.0, 139.0, 154.0]);
    }
}
