//! # Operation Layer
//!
//! Kernels for every supported operation and the dispatcher that picks
//! between them.
//!
//! ## Submodules
//!
//! - [`scalar`]: one element per step, the reference every backend is tested against
//! - [`vectorized`]: `LANES`-wide bodies with a scalar remainder (AVX2 with `simd`)
//! - [`library`] *(default `library` feature)*: matrix product through `faer`
//! - [`dispatch`]: backend selection, fan-out and the audit trail
//!
//! ## One-call Entry Points
//!
//! The functions in this module extract, validate and dispatch in one step on
//! the global dispatcher:
//!
//! ```rust
//! use tensor_dispatch::{array, ops, Scalar};
//!
//! let a = array!([1.0, 2.0, 3.0]);
//! let b = array!([4.0, 5.0, 6.0]);
//! assert_eq!(ops::dot(&a, &b)?, Scalar::F64(32.0));
//! assert_eq!(ops::add(&a, &b)?.as_slice::<f64>(), Some(&[5.0, 7.0, 9.0][..]));
//! # Ok::<(), tensor_dispatch::Error>(())
//! ```
//!
//! ## Notes
//!
//! - Kernels never validate or allocate; by the time they run, the validation
//!   layer has checked everything
//! - Operands arrive as dense row-major slices

pub mod dispatch;
#[cfg(feature = "library")]
pub mod library;
pub mod scalar;
pub mod vectorized;

use crate::buffer::HostArray;
use crate::buffer::extract::{ArrayLike, extract_buffer};
use crate::dtype::Scalar;
use crate::error::Result;
use crate::validate::{Operation, validate_and_allocate};
use core::cell::Cell;

/// What a dispatch produces.
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutput {
    /// Element-wise ops and matmul.
    Array(HostArray),
    /// Reductions and dot.
    Scalar(Scalar),
}

impl OpOutput {
    /// The array result of an element-wise op or matmul.
    #[must_use]
    pub fn into_array(self) -> Option<HostArray> {
        match self {
            Self::Array(array) => Some(array),
            Self::Scalar(_) => None,
        }
    }

    /// The scalar result of a reduction or dot.
    #[must_use]
    pub fn into_scalar(self) -> Option<Scalar> {
        match self {
            Self::Scalar(value) => Some(value),
            Self::Array(_) => None,
        }
    }
}

thread_local! {
    static KERNEL_CALLS: Cell<usize> = const { Cell::new(0) };
}

/// Kernel invocations started from the current thread (one per chunk).
#[must_use]
pub fn kernel_calls() -> usize {
    KERNEL_CALLS.with(Cell::get)
}

pub(crate) fn note_kernel_calls(chunks: usize) {
    KERNEL_CALLS.with(|c| c.set(c.get() + chunks));
}

fn run<A, B>(op: Operation, a: &A, b: Option<&B>) -> Result<OpOutput>
where
    A: ArrayLike + ?Sized,
    B: ArrayLike + ?Sized,
{
    let mut operands = vec![extract_buffer(a, None)?];
    if let Some(b) = b {
        operands.push(extract_buffer(b, None)?);
    }
    let (validated, output) = validate_and_allocate(op, operands)?;
    let (result, _) = dispatch::dispatch(validated, output)?;
    Ok(result)
}

fn array<A, B>(op: Operation, a: &A, b: &B) -> Result<HostArray>
where
    A: ArrayLike + ?Sized,
    B: ArrayLike + ?Sized,
{
    match run(op, a, Some(b))? {
        OpOutput::Array(array) => Ok(array),
        OpOutput::Scalar(_) => unreachable!("{op} produces an array"),
    }
}

fn reduce<A: ArrayLike + ?Sized>(op: Operation, a: &A) -> Result<Scalar> {
    match run::<A, A>(op, a, None)? {
        OpOutput::Scalar(value) => Ok(value),
        OpOutput::Array(_) => unreachable!("{op} produces a scalar"),
    }
}

/// Element-wise `a + b`.
///
/// # Errors
/// Any extraction, validation or dispatch error.
pub fn add<A: ArrayLike + ?Sized, B: ArrayLike + ?Sized>(a: &A, b: &B) -> Result<HostArray> {
    array(Operation::Add, a, b)
}

/// Element-wise `a - b`.
///
/// # Errors
/// Any extraction, validation or dispatch error.
pub fn sub<A: ArrayLike + ?Sized, B: ArrayLike + ?Sized>(a: &A, b: &B) -> Result<HostArray> {
    array(Operation::Sub, a, b)
}

/// Element-wise `a * b`.
///
/// # Errors
/// Any extraction, validation or dispatch error.
pub fn mul<A: ArrayLike + ?Sized, B: ArrayLike + ?Sized>(a: &A, b: &B) -> Result<HostArray> {
    array(Operation::Mul, a, b)
}

/// Element-wise `a / b` (floats only).
///
/// # Errors
/// Any extraction, validation or dispatch error.
pub fn div<A: ArrayLike + ?Sized, B: ArrayLike + ?Sized>(a: &A, b: &B) -> Result<HostArray> {
    array(Operation::Div, a, b)
}

/// Sum of all elements; integer sums are `I64`.
///
/// # Errors
/// Any extraction, validation or dispatch error.
pub fn sum<A: ArrayLike + ?Sized>(a: &A) -> Result<Scalar> {
    reduce(Operation::Sum, a)
}

/// Arithmetic mean; integer means are `F64`.
///
/// # Errors
/// [`Error::EmptyOperand`](crate::Error::EmptyOperand) on empty input, plus
/// any extraction, validation or dispatch error.
pub fn mean<A: ArrayLike + ?Sized>(a: &A) -> Result<Scalar> {
    reduce(Operation::Mean, a)
}

/// Whether every element of a bool array is true.
///
/// # Errors
/// Any extraction, validation or dispatch error.
pub fn all<A: ArrayLike + ?Sized>(a: &A) -> Result<bool> {
    reduce(Operation::All, a).map(|s| s.as_bool() == Some(true))
}

/// Whether any element of a bool array is true.
///
/// # Errors
/// Any extraction, validation or dispatch error.
pub fn any<A: ArrayLike + ?Sized>(a: &A) -> Result<bool> {
    reduce(Operation::Any, a).map(|s| s.as_bool() == Some(true))
}

/// Inner product of two equally sized float arrays.
///
/// # Errors
/// Any extraction, validation or dispatch error.
pub fn dot<A: ArrayLike + ?Sized, B: ArrayLike + ?Sized>(a: &A, b: &B) -> Result<Scalar> {
    match run(Operation::Dot, a, Some(b))? {
        OpOutput::Scalar(value) => Ok(value),
        OpOutput::Array(_) => unreachable!("dot produces a scalar"),
    }
}

/// Matrix product of rank-2 float arrays.
///
/// # Errors
/// Any extraction, validation or dispatch error.
pub fn matmul<A: ArrayLike + ?Sized, B: ArrayLike + ?Sized>(a: &A, b: &B) -> Result<HostArray> {
    array(Operation::Matmul, a, b)
}
