//! Validation layer: the only place operand compatibility is checked.
//!
//! [`validate_and_allocate`] runs every check an operation needs exactly
//! once and hands back a [`ValidatedOperation`] together with the zeroed
//! [`OutputBuffer`] the result will be written to. A `ValidatedOperation`
//! cannot be built any other way and is consumed by dispatch, so nothing
//! downstream re-checks shapes, dtypes or counts.
//!
//! Checks run in a fixed order: arity, device, dtype equality, dtype support,
//! shape rules, emptiness. The first failure is returned and nothing is
//! allocated.

use crate::buffer::{BufferDescriptor, HostBuffer};
use crate::dtype::DType;
use crate::error::{Error, Result};
use core::fmt;
use core::str::FromStr;

/// Every operation the core can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Add,
    Sub,
    Mul,
    Div,
    Sum,
    Mean,
    All,
    Any,
    Dot,
    Matmul,
}

/// How an operation consumes its operands, which decides its thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpFamily {
    /// Binary, element by element.
    Elementwise,
    /// Many elements in, one value out.
    Reduction,
    /// Rank-2 matrix product.
    Matmul,
}

impl Operation {
    /// All operations, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Div,
        Self::Sum,
        Self::Mean,
        Self::All,
        Self::Any,
        Self::Dot,
        Self::Matmul,
    ];

    /// Lowercase name used in records and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::All => "all",
            Self::Any => "any",
            Self::Dot => "dot",
            Self::Matmul => "matmul",
        }
    }

    /// Number of operands.
    #[must_use]
    pub const fn arity(self) -> usize {
        match self {
            Self::Sum | Self::Mean | Self::All | Self::Any => 1,
            Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Dot | Self::Matmul => 2,
        }
    }

    /// `Dot` reduces two operands to one value, so it is a reduction.
    #[must_use]
    pub const fn family(self) -> OpFamily {
        match self {
            Self::Add | Self::Sub | Self::Mul | Self::Div => OpFamily::Elementwise,
            Self::Sum | Self::Mean | Self::All | Self::Any | Self::Dot => OpFamily::Reduction,
            Self::Matmul => OpFamily::Matmul,
        }
    }

    /// Whether the operation is defined for `dtype` at all.
    #[must_use]
    pub const fn supports(self, dtype: DType) -> bool {
        match self {
            Self::Add | Self::Sub | Self::Mul | Self::Sum | Self::Mean => dtype.is_numeric(),
            Self::Div | Self::Dot | Self::Matmul => dtype.is_float(),
            Self::All | Self::Any => matches!(dtype, DType::Bool),
        }
    }

    /// Dtype of the result for operands of `dtype`.
    ///
    /// Integer sums widen to `Int64`; integer means are `Float64`.
    #[must_use]
    pub const fn output_dtype(self, dtype: DType) -> DType {
        match (self, dtype) {
            (Self::All | Self::Any, _) => DType::Bool,
            (Self::Sum, DType::Int32 | DType::Int64) => DType::Int64,
            (Self::Mean, DType::Int32 | DType::Int64) => DType::Float64,
            _ => dtype,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| Error::UnknownOperation { name: s.to_owned() })
    }
}

/// Problem size as seen by backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkSize {
    /// Element count of the (first) operand.
    Elements(usize),
    /// `A[m×k] · B[k×n]`.
    Matmul { m: usize, k: usize, n: usize },
}

/// Zero-initialised storage for an operation's result.
///
/// Reductions get a rank-0 buffer holding exactly one element.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBuffer {
    shape: Vec<usize>,
    buffer: HostBuffer,
}

impl OutputBuffer {
    fn zeros(shape: Vec<usize>, dtype: DType) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            buffer: HostBuffer::zeros(dtype, len),
        }
    }

    /// Shape of the result array; empty for reductions.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.buffer.dtype()
    }

    /// The zero-filled result storage.
    #[must_use]
    pub const fn buffer(&self) -> &HostBuffer {
        &self.buffer
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut HostBuffer {
        &mut self.buffer
    }

    pub(crate) fn into_parts(self) -> (Vec<usize>, HostBuffer) {
        (self.shape, self.buffer)
    }
}

/// An operation whose operands passed validation.
///
/// Owns its operand descriptors, so they are released when dispatch consumes
/// it.
#[derive(Debug)]
pub struct ValidatedOperation<'a> {
    op: Operation,
    dtype: DType,
    operands: Vec<BufferDescriptor<'a>>,
}

impl<'a> ValidatedOperation<'a> {
    /// The operation that passed validation.
    #[must_use]
    pub const fn op(&self) -> Operation {
        self.op
    }

    /// Dtype shared by every operand.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.dtype
    }

    /// Operands in call order.
    #[must_use]
    pub fn operands(&self) -> &[BufferDescriptor<'a>] {
        &self.operands
    }

    /// Copies of every operand's shape, for the dispatch record.
    #[must_use]
    pub fn operand_shapes(&self) -> Vec<Vec<usize>> {
        self.operands.iter().map(|d| d.shape().to_vec()).collect()
    }

    /// How much work the kernel does, as `select` measures it.
    #[must_use]
    pub fn work_size(&self) -> WorkSize {
        match self.op.family() {
            OpFamily::Matmul => {
                let (a, b) = (self.operands[0].shape(), self.operands[1].shape());
                WorkSize::Matmul {
                    m: a[0],
                    k: a[1],
                    n: b[1],
                }
            }
            _ => WorkSize::Elements(self.operands[0].element_count()),
        }
    }
}

/// Validates `operands` for `op` and allocates the result buffer.
///
/// # Errors
/// [`Error::ArityMismatch`], [`Error::DeviceMismatch`],
/// [`Error::DTypeMismatch`], [`Error::UnsupportedDType`],
/// [`Error::ShapeMismatch`], [`Error::RankMismatch`] or
/// [`Error::EmptyOperand`], in that order of precedence.
pub fn validate_and_allocate(
    op: Operation,
    operands: Vec<BufferDescriptor<'_>>,
) -> Result<(ValidatedOperation<'_>, OutputBuffer)> {
    if operands.len() != op.arity() {
        return Err(Error::ArityMismatch {
            op,
            expected: op.arity(),
            actual: operands.len(),
        });
    }

    let first = &operands[0];
    // a single CPU device today, so this never fires
    if let Some(other) = operands.iter().find(|d| d.device() != first.device()) {
        return Err(Error::DeviceMismatch {
            op,
            expected: first.device(),
            actual: other.device(),
        });
    }

    let dtype = first.dtype();
    if let Some(other) = operands.iter().find(|d| d.dtype() != dtype) {
        return Err(Error::DTypeMismatch {
            op: Some(op),
            expected: dtype,
            actual: other.dtype(),
        });
    }

    if !op.supports(dtype) {
        return Err(Error::UnsupportedDType { op, dtype });
    }

    let output_shape = match op.family() {
        OpFamily::Elementwise => {
            check_equal_counts(op, &operands)?;
            first.shape().to_vec()
        }
        OpFamily::Reduction => {
            if op == Operation::Dot {
                check_equal_counts(op, &operands)?;
            }
            Vec::new()
        }
        OpFamily::Matmul => matmul_shape(op, first.shape(), operands[1].shape())?,
    };

    let empty = first.element_count() == 0;
    if empty && matches!(op, Operation::Mean | Operation::All | Operation::Any) {
        return Err(Error::EmptyOperand { op });
    }

    let output = OutputBuffer::zeros(output_shape, op.output_dtype(dtype));
    Ok((
        ValidatedOperation {
            op,
            dtype,
            operands,
        },
        output,
    ))
}

fn check_equal_counts(op: Operation, operands: &[BufferDescriptor<'_>]) -> Result<()> {
    let (lhs, rhs) = (&operands[0], &operands[1]);
    if lhs.element_count() != rhs.element_count() {
        return Err(Error::ShapeMismatch {
            op,
            lhs: lhs.shape().to_vec(),
            rhs: rhs.shape().to_vec(),
            rule: "element counts must be equal (no broadcasting)",
        });
    }
    Ok(())
}

fn matmul_shape(op: Operation, a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    for shape in [a, b] {
        if shape.len() != 2 {
            return Err(Error::RankMismatch {
                op,
                expected: 2,
                actual: shape.to_vec(),
            });
        }
    }
    if a[1] != b[0] {
        return Err(Error::ShapeMismatch {
            op,
            lhs: a.to_vec(),
            rhs: b.to_vec(),
            rule: "inner dimensions must agree (a.shape[1] == b.shape[0])",
        });
    }
    Ok(vec![a[0], b[1]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::extract::extract_buffer;
    use crate::buffer::HostArray;

    #[test]
    fn names_round_trip_through_from_str() {
        for op in Operation::ALL {
            assert_eq!(op.name().parse::<Operation>(), Ok(op));
        }
        assert!(matches!(
            "conv".parse::<Operation>(),
            Err(Error::UnknownOperation { .. })
        ));
    }

    #[test]
    fn elementwise_counts_must_match() {
        let a = vec![1.0f32; 3];
        let b = vec![1.0f32; 4];
        let operands = vec![
            extract_buffer(&a, None).unwrap(),
            extract_buffer(&b, None).unwrap(),
        ];
        let err = validate_and_allocate(Operation::Add, operands).unwrap_err();
        assert_eq!(
            err,
            Error::ShapeMismatch {
                op: Operation::Add,
                lhs: vec![3],
                rhs: vec![4],
                rule: "element counts must be equal (no broadcasting)",
            }
        );
    }

    #[test]
    fn elementwise_output_takes_left_shape() {
        let a = HostArray::from_vec([2, 2], vec![1.0f64; 4]);
        let b = vec![2.0f64; 4];
        let operands = vec![
            extract_buffer(&a, None).unwrap(),
            extract_buffer(&b, None).unwrap(),
        ];
        let (validated, output) = validate_and_allocate(Operation::Mul, operands).unwrap();
        assert_eq!(output.shape(), &[2, 2]);
        assert_eq!(output.dtype(), DType::Float64);
        assert_eq!(validated.work_size(), WorkSize::Elements(4));
    }

    #[test]
    fn dtype_checks_come_before_shape_checks() {
        let a = vec![1.0f32; 3];
        let b = vec![1i32; 4];
        let operands = vec![
            extract_buffer(&a, None).unwrap(),
            extract_buffer(&b, None).unwrap(),
        ];
        let err = validate_and_allocate(Operation::Add, operands).unwrap_err();
        assert!(matches!(
            err,
            Error::DTypeMismatch {
                op: Some(Operation::Add),
                expected: DType::Float32,
                actual: DType::Int32,
            }
        ));
    }

    #[test]
    fn division_requires_floats() {
        let a = vec![4i32, 6];
        let operands = vec![
            extract_buffer(&a, None).unwrap(),
            extract_buffer(&a, None).unwrap(),
        ];
        let err = validate_and_allocate(Operation::Div, operands).unwrap_err();
        assert_eq!(
            err,
            Error::UnsupportedDType {
                op: Operation::Div,
                dtype: DType::Int32,
            }
        );
    }

    #[test]
    fn arity_is_checked_first() {
        let a = vec![1.0f32];
        let operands = vec![extract_buffer(&a, None).unwrap()];
        let err = validate_and_allocate(Operation::Matmul, operands).unwrap_err();
        assert!(matches!(err, Error::ArityMismatch { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn empty_operands_depend_on_the_op() {
        let empty: Vec<f64> = Vec::new();
        let sum = validate_and_allocate(Operation::Sum, vec![extract_buffer(&empty, None).unwrap()]);
        assert!(sum.is_ok());

        let mean = validate_and_allocate(Operation::Mean, vec![extract_buffer(&empty, None).unwrap()]);
        assert_eq!(mean.unwrap_err(), Error::EmptyOperand { op: Operation::Mean });

        let flags: Vec<bool> = Vec::new();
        for op in [Operation::All, Operation::Any] {
            let err = validate_and_allocate(op, vec![extract_buffer(&flags, None).unwrap()]).unwrap_err();
            assert_eq!(err, Error::EmptyOperand { op });
        }

        let add = validate_and_allocate(
            Operation::Add,
            vec![
                extract_buffer(&empty, None).unwrap(),
                extract_buffer(&empty, None).unwrap(),
            ],
        );
        assert!(add.is_ok());
    }

    #[test]
    fn reductions_pick_output_dtypes() {
        let ints = vec![1i32, 2, 3];
        let (_, out) = validate_and_allocate(Operation::Sum, vec![extract_buffer(&ints, None).unwrap()]).unwrap();
        assert_eq!(out.dtype(), DType::Int64);
        assert!(out.shape().is_empty());
        assert_eq!(out.buffer().len(), 1);

        let (_, out) = validate_and_allocate(Operation::Mean, vec![extract_buffer(&ints, None).unwrap()]).unwrap();
        assert_eq!(out.dtype(), DType::Float64);
    }

    #[test]
    fn matmul_checks_rank_then_inner_dims() {
        let a = HostArray::from_vec([2, 3], vec![0.0f32; 6]);
        let b = HostArray::from_vec([2, 2], vec![0.0f32; 4]);
        let flat = vec![0.0f32; 6];

        let err = validate_and_allocate(
            Operation::Matmul,
            vec![extract_buffer(&flat, None).unwrap(), extract_buffer(&b, None).unwrap()],
        )
        .unwrap_err();
        assert!(matches!(err, Error::RankMismatch { expected: 2, .. }));

        let err = validate_and_allocate(
            Operation::Matmul,
            vec![extract_buffer(&a, None).unwrap(), extract_buffer(&b, None).unwrap()],
        )
        .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { op: Operation::Matmul, .. }));

        let c = HostArray::from_vec([3, 4], vec![0.0f32; 12]);
        let (validated, out) = validate_and_allocate(
            Operation::Matmul,
            vec![extract_buffer(&a, None).unwrap(), extract_buffer(&c, None).unwrap()],
        )
        .unwrap();
        assert_eq!(out.shape(), &[2, 4]);
        assert_eq!(validated.work_size(), WorkSize::Matmul { m: 2, k: 3, n: 4 });
    }
}
