//! Error taxonomy.
//!
//! Every public entry point returns [`Result`]. Errors are grouped into three
//! recoverable categories, all raised before any kernel runs:
//!
//! - **Extraction**: the source object cannot be turned into a buffer.
//! - **Validation**: the operands do not fit the operation.
//! - **Dispatch**: a forced policy names a backend that cannot run the op.
//!
//! Kernel preconditions are not part of this taxonomy. A kernel called with
//! bad slices is a bug in the validation layer, not a runtime condition.

use crate::backend::{Backend, BackendPolicy};
use crate::dtype::{DType, Device};
use crate::validate::Operation;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Coarse grouping of [`Error`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Raised by the buffer extraction layer.
    Extraction,
    /// Raised by the validation layer.
    Validation,
    /// Raised by backend selection.
    Dispatch,
}

/// Errors raised by extraction, validation and dispatch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The source exposes no buffer capability this crate understands.
    #[error("unsupported source kind `{kind}`: no dense, byte or sequence buffer exposed")]
    UnsupportedSourceKind { kind: &'static str },

    /// A dtype could not be matched without a lossy conversion.
    #[error("dtype mismatch{}: expected {expected}, got {actual}", context_suffix(.op))]
    DTypeMismatch {
        op: Option<Operation>,
        expected: DType,
        actual: DType,
    },

    /// A strided layout addresses memory outside its backing buffer.
    #[error(
        "layout out of bounds: shape {shape:?} with byte strides {strides:?} at offset {offset} \
         does not fit in {available} bytes"
    )]
    LayoutOutOfBounds {
        shape: Vec<usize>,
        strides: Vec<isize>,
        offset: usize,
        available: usize,
    },

    /// A raw byte buffer is not a whole number of elements.
    #[error("byte buffer of {len} bytes is not a multiple of {dtype} itemsize {itemsize}")]
    TruncatedBytes {
        len: usize,
        dtype: DType,
        itemsize: usize,
    },

    /// A nested sequence has rows of different lengths or mixed depth.
    #[error("ragged sequence at depth {depth}: expected {expected} items, found {found}")]
    RaggedSequence {
        depth: usize,
        expected: usize,
        found: usize,
    },

    /// Operand shapes do not satisfy the operation's shape rule.
    #[error("{op}: shape mismatch {lhs:?} vs {rhs:?} ({rule})")]
    ShapeMismatch {
        op: Operation,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
        rule: &'static str,
    },

    /// An operand has the wrong number of dimensions.
    #[error("{op}: expected rank {expected}, got shape {actual:?}")]
    RankMismatch {
        op: Operation,
        expected: usize,
        actual: Vec<usize>,
    },

    /// Wrong number of operands.
    #[error("{op}: expected {expected} operand(s), got {actual}")]
    ArityMismatch {
        op: Operation,
        expected: usize,
        actual: usize,
    },

    /// The operation is not defined for this dtype.
    #[error("{op}: dtype {dtype} is not supported")]
    UnsupportedDType { op: Operation, dtype: DType },

    /// A host-facing operation name that names no operation.
    #[error("unknown operation `{name}`")]
    UnknownOperation { name: String },

    /// Zero-length operand where the result would be undefined.
    #[error("{op}: empty operand has no defined result")]
    EmptyOperand { op: Operation },

    /// Operands live on different devices.
    #[error("{op}: device mismatch, {expected:?} vs {actual:?}")]
    DeviceMismatch {
        op: Operation,
        expected: Device,
        actual: Device,
    },

    /// A forced policy selected a backend with no implementation for the op.
    #[error("{policy} requests the {backend} backend, which has no {op} kernel for {dtype}")]
    UnsupportedBackendForOperation {
        op: Operation,
        dtype: DType,
        policy: BackendPolicy,
        backend: Backend,
    },
}

fn context_suffix(op: &Option<Operation>) -> String {
    match op {
        Some(op) => format!(" in {op}"),
        None => String::new(),
    }
}

impl Error {
    /// Returns the category this error belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnsupportedSourceKind { .. }
            | Self::LayoutOutOfBounds { .. }
            | Self::TruncatedBytes { .. }
            | Self::RaggedSequence { .. } => ErrorCategory::Extraction,
            Self::DTypeMismatch { op: None, .. } => ErrorCategory::Extraction,
            Self::DTypeMismatch { op: Some(_), .. }
            | Self::ShapeMismatch { .. }
            | Self::RankMismatch { .. }
            | Self::ArityMismatch { .. }
            | Self::UnsupportedDType { .. }
            | Self::EmptyOperand { .. }
            | Self::UnknownOperation { .. }
            | Self::DeviceMismatch { .. } => ErrorCategory::Validation,
            Self::UnsupportedBackendForOperation { .. } => ErrorCategory::Dispatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_mismatch_message_names_both_shapes() {
        let err = Error::ShapeMismatch {
            op: Operation::Add,
            lhs: vec![3],
            rhs: vec![4],
            rule: "element counts must be equal",
        };
        let msg = err.to_string();
        assert!(msg.contains("[3]"));
        assert!(msg.contains("[4]"));
        assert!(msg.starts_with("add"));
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[test]
    fn dtype_mismatch_category_depends_on_context() {
        let extract = Error::DTypeMismatch {
            op: None,
            expected: DType::Int32,
            actual: DType::Float32,
        };
        assert_eq!(extract.category(), ErrorCategory::Extraction);
        assert_eq!(
            extract.to_string(),
            "dtype mismatch: expected int32, got float32"
        );

        let validate = Error::DTypeMismatch {
            op: Some(Operation::Mul),
            expected: DType::Float32,
            actual: DType::Float64,
        };
        assert_eq!(validate.category(), ErrorCategory::Validation);
        assert!(validate.to_string().contains("in mul"));
    }
}
