//! Element types, devices and scalar results.
//!
//! The set of dtypes is closed. Each one maps to exactly one Rust element type
//! and one [`HostBuffer`] variant, which is what lets the kernels stay generic
//! while the validation layer works on runtime tags.

use crate::buffer::HostBuffer;
use core::fmt;

/// Runtime element type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit IEEE float.
    Float32,
    /// 64-bit IEEE float.
    Float64,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// One byte per element, zero is false.
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    #[must_use]
    pub const fn itemsize(self) -> usize {
        match self {
            Self::Float32 | Self::Int32 => 4,
            Self::Float64 | Self::Int64 => 8,
            Self::Bool => 1,
        }
    }

    /// Required alignment of one element in bytes.
    #[must_use]
    pub const fn alignment(self) -> usize {
        match self {
            Self::Float32 => align_of::<f32>(),
            Self::Float64 => align_of::<f64>(),
            Self::Int32 => align_of::<i32>(),
            Self::Int64 => align_of::<i64>(),
            Self::Bool => 1,
        }
    }

    /// Lowercase name used in diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Bool => "bool",
        }
    }

    /// `true` for `Float32` and `Float64`.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    /// `true` for every dtype that supports arithmetic.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        !matches!(self, Self::Bool)
    }

    /// Whether every value of `self` is exactly representable in `target`.
    ///
    /// This is the only implicit conversion extraction performs.
    #[must_use]
    pub const fn widens_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Bool, Self::Int32 | Self::Int64 | Self::Float32 | Self::Float64)
                | (Self::Int32, Self::Int64 | Self::Float64)
                | (Self::Float32, Self::Float64)
        )
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a buffer lives.
///
/// Only host memory exists today; the enum is non-exhaustive so device checks
/// in validation keep compiling once accelerators are added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum Device {
    /// Host memory.
    #[default]
    Cpu,
}

/// A single typed value: reduction results and list-like source items.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    F32(f32),
    F64(f64),
    I32(i32),
    I64(i64),
    Bool(bool),
}

impl Scalar {
    /// The dtype this value carries.
    #[must_use]
    pub const fn dtype(self) -> DType {
        match self {
            Self::F32(_) => DType::Float32,
            Self::F64(_) => DType::Float64,
            Self::I32(_) => DType::Int32,
            Self::I64(_) => DType::Int64,
            Self::Bool(_) => DType::Bool,
        }
    }

    /// Numeric value widened to `f64` (`Bool` is 0 or 1).
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::F32(x) => f64::from(x),
            Self::F64(x) => x,
            Self::I32(x) => f64::from(x),
            Self::I64(x) => x as f64,
            Self::Bool(b) => f64::from(u8::from(b)),
        }
    }

    /// The boolean payload, if this is a `Bool`.
    #[must_use]
    pub const fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32(x) => write!(f, "{x}"),
            Self::F64(x) => write!(f, "{x}"),
            Self::I32(x) => write!(f, "{x}"),
            Self::I64(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

macro_rules! scalar_from {
    ($($ty:ty => $variant:ident),+) => {
        $(impl From<$ty> for Scalar {
            fn from(value: $ty) -> Self {
                Self::$variant(value)
            }
        })+
    };
}

scalar_from!(f32 => F32, f64 => F64, i32 => I32, i64 => I64, bool => Bool);

/// A Rust type that can back a buffer of some [`DType`].
pub trait Element: bytemuck::Pod + Send + Sync + PartialEq + fmt::Debug + 'static {
    /// The runtime tag for this type.
    const DTYPE: DType;

    /// Wraps an owned vector in the matching buffer variant.
    fn into_buffer(data: Vec<Self>) -> HostBuffer;

    /// Borrows the buffer as `[Self]` if the variant matches.
    fn view(buffer: &HostBuffer) -> Option<&[Self]>;

    /// Mutably borrows the buffer as `[Self]` if the variant matches.
    fn view_mut(buffer: &mut HostBuffer) -> Option<&mut [Self]>;

    /// Boxes a value as a [`Scalar`].
    fn into_scalar(self) -> Scalar;
}

/// Elements with add, subtract and multiply.
///
/// Integer arithmetic wraps; overflow is not a recoverable condition at the
/// kernel level.
pub trait Numeric: Element {
    /// Additive identity.
    const ZERO: Self;

    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
}

/// Floating point elements: division and compensated accumulation.
pub trait Float: Numeric + PartialOrd {
    fn div(self, rhs: Self) -> Self;
    fn abs(self) -> Self;
    fn is_finite(self) -> bool;

    /// Converts an element count for `mean`.
    fn from_count(count: usize) -> Self;
}

/// Integer elements: sums widen to `i64`.
pub trait Integer: Numeric {
    fn widen(self) -> i64;

    /// Nearest `f64`, for means.
    fn to_f64(self) -> f64;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:ident, $variant:ident, $scalar:expr) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$dtype;

            fn into_buffer(data: Vec<Self>) -> HostBuffer {
                HostBuffer::$variant(data)
            }

            fn view(buffer: &HostBuffer) -> Option<&[Self]> {
                match buffer {
                    HostBuffer::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn view_mut(buffer: &mut HostBuffer) -> Option<&mut [Self]> {
                match buffer {
                    HostBuffer::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn into_scalar(self) -> Scalar {
                $scalar(self)
            }
        }
    };
}

impl_element!(f32, Float32, F32, Scalar::F32);
impl_element!(f64, Float64, F64, Scalar::F64);
impl_element!(i32, Int32, I32, Scalar::I32);
impl_element!(i64, Int64, I64, Scalar::I64);
impl_element!(u8, Bool, Bool, |b: u8| Scalar::Bool(b != 0));

macro_rules! impl_float {
    ($ty:ty) => {
        impl Numeric for $ty {
            const ZERO: Self = 0.0;

            #[inline]
            fn add(self, rhs: Self) -> Self {
                self + rhs
            }

            #[inline]
            fn sub(self, rhs: Self) -> Self {
                self - rhs
            }

            #[inline]
            fn mul(self, rhs: Self) -> Self {
                self * rhs
            }
        }

        impl Float for $ty {
            #[inline]
            fn div(self, rhs: Self) -> Self {
                self / rhs
            }

            #[inline]
            fn abs(self) -> Self {
                <$ty>::abs(self)
            }

            #[inline]
            fn is_finite(self) -> bool {
                <$ty>::is_finite(self)
            }

            #[allow(clippy::cast_precision_loss)]
            fn from_count(count: usize) -> Self {
                count as $ty
            }
        }
    };
}

impl_float!(f32);
impl_float!(f64);

macro_rules! impl_integer {
    ($ty:ty) => {
        impl Numeric for $ty {
            const ZERO: Self = 0;

            #[inline]
            fn add(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }

            #[inline]
            fn sub(self, rhs: Self) -> Self {
                self.wrapping_sub(rhs)
            }

            #[inline]
            fn mul(self, rhs: Self) -> Self {
                self.wrapping_mul(rhs)
            }
        }

        impl Integer for $ty {
            #[inline]
            fn widen(self) -> i64 {
                i64::from(self)
            }

            #[inline]
            #[allow(clippy::cast_precision_loss)]
            fn to_f64(self) -> f64 {
                self as f64
            }
        }
    };
}

impl_integer!(i32);
impl_integer!(i64);
