//! Owned host storage and the canonical buffer descriptor.
//!
//! # Overview
//!
//! - [`HostBuffer`] is typed, owned, always-aligned storage.
//! - [`HostArray`] pairs a [`HostBuffer`] with a shape. It is what element-wise
//!   ops and matmul return, and it can be fed back in as a source.
//! - [`BufferDescriptor`] is the only input representation kernels ever see.
//!   It is dense, row-major and either borrows the source memory for `'a` or
//!   owns a defensive copy.
//!
//! Descriptors are produced by [`extract::extract_buffer`] and never by hand,
//! so every descriptor in circulation is contiguous.
//!
//! # Example
//!
//! ```
//! use tensor_dispatch::array;
//! let a = array!([[1.0, 2.0], [3.0, 4.0]]);
//! assert_eq!(a.shape(), &[2, 2]);
//! ```

pub mod extract;

use crate::dtype::{DType, Device, Element, Scalar};

/// Owned, typed element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum HostBuffer {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    /// One byte per element, zero is false.
    Bool(Vec<u8>),
}

macro_rules! each_variant {
    ($buffer:expr, $v:ident => $body:expr) => {
        match $buffer {
            HostBuffer::F32($v) => $body,
            HostBuffer::F64($v) => $body,
            HostBuffer::I32($v) => $body,
            HostBuffer::I64($v) => $body,
            HostBuffer::Bool($v) => $body,
        }
    };
}

impl HostBuffer {
    /// Zero-filled storage for `len` elements of `dtype`.
    #[must_use]
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::Float32 => Self::F32(vec![0.0; len]),
            DType::Float64 => Self::F64(vec![0.0; len]),
            DType::Int32 => Self::I32(vec![0; len]),
            DType::Int64 => Self::I64(vec![0; len]),
            DType::Bool => Self::Bool(vec![0; len]),
        }
    }

    /// Copies native-endian bytes into freshly aligned storage.
    ///
    /// `bytes.len()` must be a multiple of the itemsize; trailing bytes are
    /// ignored otherwise.
    pub(crate) fn from_ne_bytes(dtype: DType, bytes: &[u8]) -> Self {
        let len = bytes.len() / dtype.itemsize();
        let mut buffer = Self::zeros(dtype, len);
        let used = len * dtype.itemsize();
        buffer.as_bytes_mut().copy_from_slice(&bytes[..used]);
        buffer
    }

    /// Converts `[bool]` to the byte encoding.
    #[must_use]
    pub fn from_bools(values: &[bool]) -> Self {
        Self::Bool(values.iter().map(|&b| u8::from(b)).collect())
    }

    /// The dtype of the stored elements.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::Float32,
            Self::F64(_) => DType::Float64,
            Self::I32(_) => DType::Int32,
            Self::I64(_) => DType::Int64,
            Self::Bool(_) => DType::Bool,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        each_variant!(self, v => v.len())
    }

    /// `true` if there are no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The raw native-endian bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        each_variant!(self, v => bytemuck::cast_slice(v.as_slice()))
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        each_variant!(self, v => bytemuck::cast_slice_mut(v.as_mut_slice()))
    }

    /// Typed view, `None` if `T` is not this buffer's element type.
    #[must_use]
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::view(self)
    }

    /// Mutable typed view, `None` if `T` is not this buffer's element type.
    pub fn as_mut_slice<T: Element>(&mut self) -> Option<&mut [T]> {
        T::view_mut(self)
    }

    /// The first element as a [`Scalar`].
    #[must_use]
    pub fn first(&self) -> Option<Scalar> {
        each_variant!(self, v => v.first().map(|&x| x.into_scalar()))
    }

    /// Lossless conversion to `target`.
    ///
    /// Returns `None` unless `self.dtype().widens_to(target)` or the dtypes
    /// are equal.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn widen(self, target: DType) -> Option<Self> {
        if self.dtype() == target {
            return Some(self);
        }
        if !self.dtype().widens_to(target) {
            return None;
        }
        let widened = match (self, target) {
            (Self::Bool(v), DType::Int32) => Self::I32(v.into_iter().map(i32::from).collect()),
            (Self::Bool(v), DType::Int64) => Self::I64(v.into_iter().map(i64::from).collect()),
            (Self::Bool(v), DType::Float32) => Self::F32(v.into_iter().map(f32::from).collect()),
            (Self::Bool(v), DType::Float64) => Self::F64(v.into_iter().map(f64::from).collect()),
            (Self::I32(v), DType::Int64) => Self::I64(v.into_iter().map(i64::from).collect()),
            (Self::I32(v), DType::Float64) => Self::F64(v.into_iter().map(f64::from).collect()),
            (Self::F32(v), DType::Float64) => Self::F64(v.into_iter().map(f64::from).collect()),
            _ => return None,
        };
        Some(widened)
    }
}

/// An owned, shaped, dense row-major array.
#[derive(Debug, Clone, PartialEq)]
pub struct HostArray {
    shape: Vec<usize>,
    buffer: HostBuffer,
}

impl HostArray {
    /// Creates an array from a shape and matching storage.
    ///
    /// # Panics
    /// Panics if the number of elements does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, buffer: HostBuffer) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            buffer.len(),
            "shape {:?} is incompatible with {} elements",
            shape,
            buffer.len()
        );
        Self { shape, buffer }
    }

    /// Creates an array from a typed vector.
    ///
    /// # Panics
    /// Panics if the number of elements does not match the shape product.
    pub fn from_vec<T: Element>(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Self {
        Self::new(shape, T::into_buffer(data))
    }

    /// Creates a `Bool` array.
    ///
    /// # Panics
    /// Panics if the number of elements does not match the shape product.
    pub fn from_bools(shape: impl Into<Vec<usize>>, values: &[bool]) -> Self {
        Self::new(shape, HostBuffer::from_bools(values))
    }

    /// Dimensions, outermost first.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element type of the storage.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.buffer.dtype()
    }

    /// Number of elements (the shape product).
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the array holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Borrows the typed storage.
    #[must_use]
    pub const fn buffer(&self) -> &HostBuffer {
        &self.buffer
    }

    /// Consumes the array, keeping only its storage.
    #[must_use]
    pub fn into_buffer(self) -> HostBuffer {
        self.buffer
    }

    /// Typed view of the elements in row-major order.
    #[must_use]
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        self.buffer.as_slice()
    }

    /// Builds an array from a scalar or a nested Rust array literal.
    ///
    /// Backs the [`array!`](crate::array) macro.
    #[must_use]
    pub fn from_literal<L: ArrayLiteral>(literal: L) -> Self {
        let mut shape = Vec::new();
        literal.shape_into(&mut shape);
        let mut data = Vec::with_capacity(shape.iter().product());
        literal.flatten_into(&mut data);
        Self::new(shape, L::Elem::into_buffer(data))
    }
}

/// A value or (nested) fixed-size array that [`HostArray::from_literal`]
/// accepts. The nesting depth is the rank.
pub trait ArrayLiteral {
    type Elem: Element;

    fn shape_into(&self, shape: &mut Vec<usize>);
    fn flatten_into(&self, out: &mut Vec<Self::Elem>);
}

macro_rules! literal_leaf {
    ($($ty:ty => $elem:ty),+) => {
        $(impl ArrayLiteral for $ty {
            type Elem = $elem;

            fn shape_into(&self, _: &mut Vec<usize>) {}

            fn flatten_into(&self, out: &mut Vec<$elem>) {
                out.push(<$elem>::from(*self));
            }
        })+
    };
}

literal_leaf!(f32 => f32, f64 => f64, i32 => i32, i64 => i64, bool => u8);

impl<L: ArrayLiteral, const N: usize> ArrayLiteral for [L; N] {
    type Elem = L::Elem;

    fn shape_into(&self, shape: &mut Vec<usize>) {
        shape.push(N);
        if let Some(first) = self.first() {
            first.shape_into(shape);
        }
    }

    fn flatten_into(&self, out: &mut Vec<Self::Elem>) {
        for item in self {
            item.flatten_into(out);
        }
    }
}

/// Defines a [`HostArray`] from a scalar or nested array literal.
///
/// Element types unify across the whole literal, and ragged literals do not
/// compile. Float literals default to `f64` and integer literals to `i32`;
/// suffix one element (`1.0f32`) to pick another dtype.
///
/// # Example
/// ```
/// use tensor_dispatch::{array, DType};
/// let a = array!([[1.0f32, -2.0], [3.0, 4.0]]);
/// assert_eq!(a.shape(), &[2, 2]);
/// assert_eq!(a.dtype(), DType::Float32);
///
/// let flags = array!([true, false]);
/// assert_eq!(flags.dtype(), DType::Bool);
/// ```
#[macro_export]
macro_rules! array {
    ($($literal:tt)+) => {
        $crate::buffer::HostArray::from_literal($($literal)+)
    };
}

/// The keep-alive side of a [`BufferDescriptor`].
#[derive(Debug)]
pub enum Owner<'a> {
    /// Zero-copy borrow of the source's memory.
    Borrowed(&'a [u8]),
    /// Defensive dense copy owned by the descriptor.
    Copied(HostBuffer),
}

/// A dense, row-major, typed view handed to validation and the kernels.
///
/// The descriptor borrows from its source for `'a`, so the borrow checker
/// rejects any use after the source is gone.
#[derive(Debug)]
pub struct BufferDescriptor<'a> {
    owner: Owner<'a>,
    shape: Vec<usize>,
    dtype: DType,
    device: Device,
}

impl<'a> BufferDescriptor<'a> {
    /// Zero-copy descriptor over aligned, dense bytes.
    pub(crate) fn borrowed(bytes: &'a [u8], shape: Vec<usize>, dtype: DType) -> Self {
        debug_assert_eq!(bytes.len(), shape.iter().product::<usize>() * dtype.itemsize());
        debug_assert_eq!(bytes.as_ptr().align_offset(dtype.alignment()), 0);
        Self {
            owner: Owner::Borrowed(bytes),
            shape,
            dtype,
            device: Device::Cpu,
        }
    }

    /// Descriptor that owns its (already dense) storage.
    pub(crate) fn copied(buffer: HostBuffer, shape: Vec<usize>) -> Self {
        debug_assert_eq!(buffer.len(), shape.iter().product::<usize>());
        Self {
            dtype: buffer.dtype(),
            owner: Owner::Copied(buffer),
            shape,
            device: Device::Cpu,
        }
    }

    /// Address of the first element. Never dereferenced outside the kernels.
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.as_bytes().as_ptr()
    }

    /// The raw bytes, in native byte order.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match &self.owner {
            Owner::Borrowed(bytes) => bytes,
            Owner::Copied(buffer) => buffer.as_bytes(),
        }
    }

    /// Typed element view, `None` if `T` does not match the dtype.
    #[must_use]
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        if T::DTYPE != self.dtype {
            return None;
        }
        match &self.owner {
            Owner::Borrowed(bytes) => bytemuck::try_cast_slice(bytes).ok(),
            Owner::Copied(buffer) => buffer.as_slice(),
        }
    }

    /// Number of elements described.
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// `element_count` times the dtype's item size.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype.itemsize()
    }

    /// Dimensions of the dense buffer.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Byte strides. Always `None`: descriptors are dense row-major.
    #[must_use]
    pub const fn strides(&self) -> Option<&[isize]> {
        None
    }

    /// Element type of the buffer.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.dtype
    }

    /// Where the memory lives. Always [`Device::Cpu`] for now.
    #[must_use]
    pub const fn device(&self) -> Device {
        self.device
    }

    /// Only owned copies are writable; borrowed source memory is read-only.
    #[must_use]
    pub const fn writable(&self) -> bool {
        matches!(self.owner, Owner::Copied(_))
    }

    /// `true` if extraction had to copy the source.
    #[must_use]
    pub const fn is_copy(&self) -> bool {
        matches!(self.owner, Owner::Copied(_))
    }

    /// Who owns the memory behind the descriptor.
    #[must_use]
    pub const fn owner(&self) -> &Owner<'a> {
        &self.owner
    }
}

/// Dense row-major byte strides for `shape`.
#[allow(clippy::cast_possible_wrap)]
#[must_use]
pub fn dense_strides(shape: &[usize], itemsize: usize) -> Vec<isize> {
    let mut strides = vec![0isize; shape.len()];
    let mut acc = itemsize;
    for (stride, &dim) in strides.iter_mut().zip(shape).rev() {
        *stride = acc as isize;
        acc *= dim.max(1);
    }
    strides
}

/// Whether `strides` address `shape` densely in row-major order.
///
/// Dimensions of size one may carry any stride, and an empty array is
/// contiguous whatever its strides.
#[must_use]
pub fn is_contiguous(shape: &[usize], strides: &[isize], itemsize: usize) -> bool {
    if shape.len() != strides.len() {
        return false;
    }
    if shape.contains(&0) {
        return true;
    }
    let dense = dense_strides(shape, itemsize);
    shape
        .iter()
        .zip(strides.iter().zip(&dense))
        .all(|(&dim, (&actual, &expected))| dim == 1 || actual == expected)
}
