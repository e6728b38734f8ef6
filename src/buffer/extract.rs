//! Buffer extraction: arbitrary array-like sources in, dense descriptors out.
//!
//! A source advertises what it can offer through [`ArrayLike::capability`]:
//!
//! - [`BufferCapability::Strided`]: typed memory with an explicit byte layout.
//!   Contiguous, aligned layouts are borrowed without copying. Anything else
//!   is gathered into a dense copy and reported as a hidden copy.
//! - [`BufferCapability::Bytes`]: untyped bytes reinterpreted as the requested
//!   dtype.
//! - [`BufferCapability::Sequence`] and [`BufferCapability::Scalar`]: values
//!   with no stable address, always copied.
//!
//! The only implicit conversions are lossless widenings
//! (see [`DType::widens_to`]). Everything else is a [`Error::DTypeMismatch`].

use super::{BufferDescriptor, HostArray, HostBuffer, dense_strides, is_contiguous};
use crate::dtype::{DType, Element, Scalar};
use crate::error::{Error, Result};
use briny::prelude::*;
use std::cell::Cell;
use tracing::{debug, warn};

thread_local! {
    static HIDDEN_COPIES: Cell<usize> = const { Cell::new(0) };
}

/// Number of copies extraction has made on the current thread.
#[must_use]
pub fn hidden_copies() -> usize {
    HIDDEN_COPIES.with(Cell::get)
}

fn note_copy() {
    HIDDEN_COPIES.with(|c| c.set(c.get() + 1));
}

/// Anything that can be turned into a [`BufferDescriptor`].
pub trait ArrayLike {
    /// The buffer this source exposes, or `None` if it exposes none.
    fn capability(&self) -> Option<BufferCapability<'_>>;

    /// Name used in [`Error::UnsupportedSourceKind`].
    fn source_kind(&self) -> &'static str {
        core::any::type_name::<Self>()
    }
}

/// A recognized memory-buffer capability.
#[derive(Debug, Clone)]
pub enum BufferCapability<'a> {
    Strided(StridedArray<'a>),
    Bytes(&'a [u8]),
    Sequence(&'a NestedList),
    Scalar(Scalar),
}

/// Typed memory described by an explicit byte layout.
///
/// Strides are in bytes and may be negative. The layout is only trusted after
/// extraction has checked that every addressed element lies inside `bytes`.
#[derive(Debug, Clone)]
pub struct StridedArray<'a> {
    bytes: &'a [u8],
    offset: usize,
    shape: Vec<usize>,
    strides: Vec<isize>,
    dtype: DType,
}

impl<'a> StridedArray<'a> {
    /// A raw layout over `bytes`. Checked at extraction, not here.
    #[must_use]
    pub fn new(
        bytes: &'a [u8],
        offset: usize,
        shape: Vec<usize>,
        strides: Vec<isize>,
        dtype: DType,
    ) -> Self {
        Self {
            bytes,
            offset,
            shape,
            strides,
            dtype,
        }
    }

    /// A dense row-major layout over `bytes`.
    #[must_use]
    pub fn dense(bytes: &'a [u8], shape: Vec<usize>, dtype: DType) -> Self {
        let strides = dense_strides(&shape, dtype.itemsize());
        Self::new(bytes, 0, shape, strides, dtype)
    }

    /// A view over typed elements with offset and strides counted in elements.
    ///
    /// ```
    /// use tensor_dispatch::buffer::extract::StridedArray;
    /// let backing = [0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0];
    /// // every second element: [0, 2, 4]
    /// let view = StridedArray::from_elements(&backing, 0, vec![3], &[2]);
    /// assert_eq!(view.strides(), &[8]);
    /// ```
    #[allow(clippy::cast_possible_wrap)]
    #[must_use]
    pub fn from_elements<T: Element>(
        data: &'a [T],
        offset: usize,
        shape: Vec<usize>,
        strides: &[isize],
    ) -> Self {
        let itemsize = size_of::<T>();
        let strides = strides.iter().map(|s| s * itemsize as isize).collect();
        Self::new(
            bytemuck::cast_slice(data),
            offset * itemsize,
            shape,
            strides,
            T::DTYPE,
        )
    }

    /// Dimensions of the view.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Byte strides, one per dimension.
    #[must_use]
    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    /// Element type of the backing bytes.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.dtype
    }

    /// Whether the view is dense row-major with no gaps.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        is_contiguous(&self.shape, &self.strides, self.dtype.itemsize())
    }

    fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    fn layout_error(&self) -> Error {
        Error::LayoutOutOfBounds {
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            offset: self.offset,
            available: self.bytes.len(),
        }
    }
}

/// Untyped bytes, reinterpreted as whatever dtype extraction is asked for.
#[derive(Debug, Clone, Copy)]
pub struct RawBytes<'a>(pub &'a [u8]);

/// A possibly nested list of scalars.
#[derive(Debug, Clone, PartialEq)]
pub enum NestedList {
    Item(Scalar),
    List(Vec<NestedList>),
}

impl NestedList {
    /// A flat list of values.
    pub fn flat<T: Into<Scalar>>(items: impl IntoIterator<Item = T>) -> Self {
        Self::List(items.into_iter().map(|x| Self::Item(x.into())).collect())
    }

    /// A list of rows.
    pub fn rows<T: Into<Scalar>, R: IntoIterator<Item = T>>(rows: impl IntoIterator<Item = R>) -> Self {
        Self::List(rows.into_iter().map(|row| Self::flat(row)).collect())
    }
}

/// Byte-level description of a strided layout, checked before it is trusted.
struct Layout {
    available: usize,
    offset: usize,
    shape: Vec<usize>,
    strides: Vec<isize>,
    itemsize: usize,
}

impl Validate for Layout {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.shape.len() != self.strides.len() {
            return Err(ValidationError);
        }
        if self.offset > self.available {
            return Err(ValidationError);
        }
        if self.shape.contains(&0) {
            return Ok(());
        }
        let mut lo = self.offset as i128;
        let mut hi = self.offset as i128;
        for (&dim, &stride) in self.shape.iter().zip(&self.strides) {
            let span = stride as i128 * (dim as i128 - 1);
            if span < 0 {
                lo += span;
            } else {
                hi += span;
            }
        }
        if lo < 0 || hi + self.itemsize as i128 > self.available as i128 {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Turns `source` into a dense descriptor of `requested_dtype` (or the
/// source's own dtype).
///
/// # Errors
/// - [`Error::UnsupportedSourceKind`] if the source exposes no buffer.
/// - [`Error::DTypeMismatch`] if the requested dtype needs a lossy conversion.
/// - [`Error::LayoutOutOfBounds`], [`Error::TruncatedBytes`] and
///   [`Error::RaggedSequence`] for malformed sources.
pub fn extract_buffer<'a, S>(source: &'a S, requested_dtype: Option<DType>) -> Result<BufferDescriptor<'a>>
where
    S: ArrayLike + ?Sized,
{
    match source.capability() {
        None => Err(Error::UnsupportedSourceKind {
            kind: source.source_kind(),
        }),
        Some(BufferCapability::Strided(array)) => extract_strided(array, requested_dtype),
        Some(BufferCapability::Bytes(bytes)) => {
            extract_bytes(bytes, requested_dtype.unwrap_or(DType::Bool))
        }
        Some(BufferCapability::Sequence(list)) => extract_sequence(list, requested_dtype),
        Some(BufferCapability::Scalar(value)) => {
            let target = requested_dtype.unwrap_or(value.dtype());
            let converted = convert(value, target).ok_or(Error::DTypeMismatch {
                op: None,
                expected: target,
                actual: value.dtype(),
            })?;
            note_copy();
            debug!(dtype = %target, "copying scalar source");
            Ok(BufferDescriptor::copied(collect(target, &[converted]), Vec::new()))
        }
    }
}

fn extract_strided(array: StridedArray<'_>, requested: Option<DType>) -> Result<BufferDescriptor<'_>> {
    let itemsize = array.dtype.itemsize();
    let layout = Layout {
        available: array.bytes.len(),
        offset: array.offset,
        shape: array.shape.clone(),
        strides: array.strides.clone(),
        itemsize,
    };
    TrustedData::new(layout).map_err(|_| array.layout_error())?;

    let target = requested.unwrap_or(array.dtype);
    if target != array.dtype && !array.dtype.widens_to(target) {
        return Err(Error::DTypeMismatch {
            op: None,
            expected: target,
            actual: array.dtype,
        });
    }

    let bytes_len = array.element_count() * itemsize;
    if array.is_contiguous() {
        let bytes = array.bytes;
        let region = &bytes[array.offset..array.offset + bytes_len];
        let aligned = region.as_ptr().align_offset(array.dtype.alignment()) == 0;
        if aligned && target == array.dtype {
            return Ok(BufferDescriptor::borrowed(region, array.shape, target));
        }
        let buffer = HostBuffer::from_ne_bytes(array.dtype, region);
        if aligned {
            debug!(shape = ?array.shape, from = %array.dtype, to = %target, "widening copy");
        } else {
            warn!(
                shape = ?array.shape,
                dtype = %array.dtype,
                bytes = bytes_len,
                "hidden copy: source memory is misaligned for its dtype"
            );
        }
        return Ok(finish_copy(buffer, target, array.shape));
    }

    warn!(
        shape = ?array.shape,
        strides = ?array.strides,
        bytes = bytes_len,
        "hidden copy: gathering non-contiguous source into dense memory"
    );
    let mut dense = Vec::with_capacity(bytes_len);
    gather(
        array.bytes,
        array.offset as isize,
        &array.shape,
        &array.strides,
        itemsize,
        &mut dense,
    );
    let buffer = HostBuffer::from_ne_bytes(array.dtype, &dense);
    Ok(finish_copy(buffer, target, array.shape))
}

fn finish_copy(buffer: HostBuffer, target: DType, shape: Vec<usize>) -> BufferDescriptor<'static> {
    note_copy();
    // widening was checked by the caller
    let buffer = match buffer.widen(target) {
        Some(widened) => widened,
        None => unreachable!("lossless widening was checked before copying"),
    };
    BufferDescriptor::copied(buffer, shape)
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
fn gather(bytes: &[u8], offset: isize, shape: &[usize], strides: &[isize], itemsize: usize, out: &mut Vec<u8>) {
    match shape.split_first() {
        None => {
            let start = offset as usize;
            out.extend_from_slice(&bytes[start..start + itemsize]);
        }
        Some((&dim, rest)) => {
            for i in 0..dim {
                gather(bytes, offset + i as isize * strides[0], rest, &strides[1..], itemsize, out);
            }
        }
    }
}

fn extract_bytes(bytes: &[u8], dtype: DType) -> Result<BufferDescriptor<'_>> {
    let itemsize = dtype.itemsize();
    if bytes.len() % itemsize != 0 {
        return Err(Error::TruncatedBytes {
            len: bytes.len(),
            dtype,
            itemsize,
        });
    }
    let shape = vec![bytes.len() / itemsize];
    if bytes.as_ptr().align_offset(dtype.alignment()) == 0 {
        return Ok(BufferDescriptor::borrowed(bytes, shape, dtype));
    }
    warn!(
        dtype = %dtype,
        bytes = bytes.len(),
        "hidden copy: byte buffer is misaligned for its dtype"
    );
    note_copy();
    Ok(BufferDescriptor::copied(HostBuffer::from_ne_bytes(dtype, bytes), shape))
}

fn extract_sequence(list: &NestedList, requested: Option<DType>) -> Result<BufferDescriptor<'static>> {
    let mut shape = Vec::new();
    let mut node = list;
    while let NestedList::List(items) = node {
        shape.push(items.len());
        match items.first() {
            Some(first) => node = first,
            None => break,
        }
    }

    let mut values = Vec::with_capacity(shape.iter().product());
    flatten(list, 0, &shape, &mut values)?;

    let target = requested.unwrap_or_else(|| infer_dtype(&values));
    let converted = values
        .iter()
        .map(|&v| {
            convert(v, target).ok_or(Error::DTypeMismatch {
                op: None,
                expected: target,
                actual: v.dtype(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    note_copy();
    debug!(shape = ?shape, dtype = %target, "copying list-like source");
    Ok(BufferDescriptor::copied(collect(target, &converted), shape))
}

fn flatten(node: &NestedList, depth: usize, shape: &[usize], out: &mut Vec<Scalar>) -> Result<()> {
    match (node, shape.get(depth)) {
        (NestedList::Item(value), None) => {
            out.push(*value);
            Ok(())
        }
        (NestedList::List(items), Some(&expected)) => {
            if items.len() != expected {
                return Err(Error::RaggedSequence {
                    depth,
                    expected,
                    found: items.len(),
                });
            }
            items.iter().try_for_each(|item| flatten(item, depth + 1, shape, out))
        }
        // a scalar where a list was expected, or the reverse
        (NestedList::Item(_), Some(&expected)) => Err(Error::RaggedSequence {
            depth,
            expected,
            found: 0,
        }),
        (NestedList::List(items), None) => Err(Error::RaggedSequence {
            depth,
            expected: 0,
            found: items.len(),
        }),
    }
}

fn infer_dtype(values: &[Scalar]) -> DType {
    if values.is_empty() {
        return DType::Float32;
    }
    if values.iter().all(|v| matches!(v, Scalar::Bool(_))) {
        return DType::Bool;
    }
    if values.iter().any(|v| matches!(v, Scalar::F32(_) | Scalar::F64(_))) {
        return DType::Float32;
    }
    let fits_i32 = values.iter().all(|v| match *v {
        Scalar::I64(x) => i32::try_from(x).is_ok(),
        _ => true,
    });
    if fits_i32 { DType::Int32 } else { DType::Int64 }
}

/// Converts `value` to `target` if the value is exactly representable.
///
/// Floats narrowing to `Float32` round to nearest; finite values beyond its
/// range are rejected.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn convert(value: Scalar, target: DType) -> Option<Scalar> {
    let int = |x: i64| -> Option<Scalar> {
        match target {
            DType::Int32 => i32::try_from(x).ok().map(Scalar::I32),
            DType::Int64 => Some(Scalar::I64(x)),
            DType::Float32 => {
                let f = x as f32;
                (f as i64 == x).then_some(Scalar::F32(f))
            }
            DType::Float64 => {
                let f = x as f64;
                (f as i64 == x).then_some(Scalar::F64(f))
            }
            DType::Bool => None,
        }
    };
    match value {
        Scalar::Bool(b) => match target {
            DType::Bool => Some(Scalar::Bool(b)),
            _ => int(i64::from(b)),
        },
        Scalar::I32(x) => int(i64::from(x)),
        Scalar::I64(x) => int(x),
        Scalar::F32(x) => match target {
            DType::Float32 => Some(Scalar::F32(x)),
            DType::Float64 => Some(Scalar::F64(f64::from(x))),
            _ => None,
        },
        Scalar::F64(x) => match target {
            DType::Float32 => {
                let narrowed = x as f32;
                (narrowed.is_finite() || !x.is_finite()).then_some(Scalar::F32(narrowed))
            }
            DType::Float64 => Some(Scalar::F64(x)),
            _ => None,
        },
    }
}

/// Packs already converted scalars into storage of `dtype`.
fn collect(dtype: DType, values: &[Scalar]) -> HostBuffer {
    match dtype {
        DType::Float32 => HostBuffer::F32(
            values.iter().map(|v| if let Scalar::F32(x) = *v { x } else { 0.0 }).collect(),
        ),
        DType::Float64 => HostBuffer::F64(
            values.iter().map(|v| if let Scalar::F64(x) = *v { x } else { 0.0 }).collect(),
        ),
        DType::Int32 => HostBuffer::I32(
            values.iter().map(|v| if let Scalar::I32(x) = *v { x } else { 0 }).collect(),
        ),
        DType::Int64 => HostBuffer::I64(
            values.iter().map(|v| if let Scalar::I64(x) = *v { x } else { 0 }).collect(),
        ),
        DType::Bool => HostBuffer::Bool(
            values.iter().map(|v| u8::from(v.as_bool().unwrap_or(false))).collect(),
        ),
    }
}

impl<T: Element> ArrayLike for [T] {
    fn capability(&self) -> Option<BufferCapability<'_>> {
        Some(BufferCapability::Strided(StridedArray::dense(
            bytemuck::cast_slice(self),
            vec![self.len()],
            T::DTYPE,
        )))
    }
}

impl<T: Element> ArrayLike for Vec<T> {
    fn capability(&self) -> Option<BufferCapability<'_>> {
        self.as_slice().capability()
    }
}

impl<T: Element, const N: usize> ArrayLike for [T; N] {
    fn capability(&self) -> Option<BufferCapability<'_>> {
        self.as_slice().capability()
    }
}

impl ArrayLike for [bool] {
    fn capability(&self) -> Option<BufferCapability<'_>> {
        Some(BufferCapability::Strided(StridedArray::dense(
            bytemuck::cast_slice(self),
            vec![self.len()],
            DType::Bool,
        )))
    }
}

impl ArrayLike for Vec<bool> {
    fn capability(&self) -> Option<BufferCapability<'_>> {
        self.as_slice().capability()
    }
}

impl<const N: usize> ArrayLike for [bool; N] {
    fn capability(&self) -> Option<BufferCapability<'_>> {
        self.as_slice().capability()
    }
}

impl ArrayLike for HostArray {
    fn capability(&self) -> Option<BufferCapability<'_>> {
        Some(BufferCapability::Strided(StridedArray::dense(
            self.buffer().as_bytes(),
            self.shape().to_vec(),
            self.dtype(),
        )))
    }
}

impl ArrayLike for StridedArray<'_> {
    fn capability(&self) -> Option<BufferCapability<'_>> {
        Some(BufferCapability::Strided(self.clone()))
    }
}

impl ArrayLike for RawBytes<'_> {
    fn capability(&self) -> Option<BufferCapability<'_>> {
        Some(BufferCapability::Bytes(self.0))
    }
}

impl ArrayLike for NestedList {
    fn capability(&self) -> Option<BufferCapability<'_>> {
        Some(BufferCapability::Sequence(self))
    }
}

impl ArrayLike for Scalar {
    fn capability(&self) -> Option<BufferCapability<'_>> {
        Some(BufferCapability::Scalar(*self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Opaque;

    impl ArrayLike for Opaque {
        fn capability(&self) -> Option<BufferCapability<'_>> {
            None
        }

        fn source_kind(&self) -> &'static str {
            "opaque"
        }
    }

    #[test]
    fn contiguous_slice_is_borrowed() {
        let data = vec![1.0f32, 2.0, 3.0];
        let before = hidden_copies();
        let desc = extract_buffer(&data, None).unwrap();
        assert!(!desc.is_copy());
        assert!(!desc.writable());
        assert_eq!(desc.as_ptr(), data.as_ptr().cast::<u8>());
        assert_eq!(desc.as_slice::<f32>(), Some(&data[..]));
        assert_eq!(hidden_copies(), before);
    }

    #[test]
    fn strided_view_is_gathered_in_order() {
        let backing = [0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0];
        let view = StridedArray::from_elements(&backing, 0, vec![3], &[2]);
        let before = hidden_copies();
        let desc = extract_buffer(&view, None).unwrap();
        assert!(desc.is_copy());
        assert_eq!(desc.strides(), None);
        assert_eq!(desc.as_slice::<f32>(), Some(&[0.0, 2.0, 4.0][..]));
        assert_eq!(hidden_copies(), before + 1);
    }

    #[test]
    fn negative_strides_reverse_rows() {
        let backing = [1i32, 2, 3, 4, 5, 6];
        // last row first
        let view = StridedArray::from_elements(&backing, 3, vec![2, 3], &[-3, 1]);
        let desc = extract_buffer(&view, None).unwrap();
        assert_eq!(desc.shape(), &[2, 3]);
        assert_eq!(desc.as_slice::<i32>(), Some(&[4, 5, 6, 1, 2, 3][..]));
    }

    #[test]
    fn out_of_bounds_layout_is_rejected() {
        let backing = [0.0f64; 4];
        let view = StridedArray::from_elements(&backing, 1, vec![2], &[3]);
        let err = extract_buffer(&view, None).unwrap_err();
        assert!(matches!(err, Error::LayoutOutOfBounds { available: 32, .. }));

        let behind = StridedArray::from_elements(&backing, 0, vec![2], &[-1]);
        assert!(extract_buffer(&behind, None).is_err());
    }

    #[test]
    fn empty_view_past_the_end_is_rejected() {
        let view = StridedArray::new(&[], 8, vec![0], vec![4], DType::Float32);
        let err = extract_buffer(&view, None).unwrap_err();
        assert!(matches!(err, Error::LayoutOutOfBounds { available: 0, .. }));

        let backing = [0u8; 8];
        let at_end = StridedArray::new(&backing, 8, vec![0], vec![4], DType::Float32);
        assert_eq!(extract_buffer(&at_end, None).unwrap().element_count(), 0);
    }

    #[test]
    fn unit_dims_with_odd_strides_stay_zero_copy() {
        let backing = [1.0f64, 2.0, 3.0];
        let view = StridedArray::from_elements(&backing, 0, vec![1, 3], &[100, 1]);
        let desc = extract_buffer(&view, None).unwrap();
        assert!(!desc.is_copy());
    }

    #[test]
    fn unsupported_source_names_its_kind() {
        let err = extract_buffer(&Opaque, None).unwrap_err();
        assert_eq!(err, Error::UnsupportedSourceKind { kind: "opaque" });
    }

    #[test]
    fn lossy_requests_are_refused() {
        let data = vec![1.5f64, 2.5];
        let err = extract_buffer(&data, Some(DType::Float32)).unwrap_err();
        assert_eq!(
            err,
            Error::DTypeMismatch {
                op: None,
                expected: DType::Float32,
                actual: DType::Float64,
            }
        );
        let ints = vec![1i32, 2];
        assert!(extract_buffer(&ints, Some(DType::Float32)).is_err());
    }

    #[test]
    fn lossless_requests_widen_with_a_copy() {
        let data = vec![1i32, -2];
        let desc = extract_buffer(&data, Some(DType::Int64)).unwrap();
        assert!(desc.is_copy());
        assert_eq!(desc.as_slice::<i64>(), Some(&[1, -2][..]));
    }

    #[test]
    fn raw_bytes_must_be_whole_elements() {
        let data = [1.0f32, 2.0];
        let bytes: &[u8] = bytemuck::cast_slice(&data);
        let raw = RawBytes(bytes);
        let desc = extract_buffer(&raw, Some(DType::Float32)).unwrap();
        assert_eq!(desc.as_slice::<f32>(), Some(&data[..]));

        let err = extract_buffer(&RawBytes(&bytes[..7]), Some(DType::Float32)).unwrap_err();
        assert!(matches!(err, Error::TruncatedBytes { len: 7, itemsize: 4, .. }));
    }

    #[test]
    fn misaligned_bytes_fall_back_to_a_copy() {
        let data = [0u64; 3];
        let bytes: &[u8] = bytemuck::cast_slice(&data);
        let shifted = &bytes[1..17];
        let raw = RawBytes(shifted);
        let desc = extract_buffer(&raw, Some(DType::Int64)).unwrap();
        assert!(desc.is_copy());
        assert_eq!(desc.as_slice::<i64>(), Some(&[0, 0][..]));
    }

    #[test]
    fn nested_lists_infer_shape_and_dtype() {
        let list = NestedList::rows([[1, 2, 3], [4, 5, 6]]);
        let desc = extract_buffer(&list, None).unwrap();
        assert!(desc.is_copy());
        assert_eq!(desc.shape(), &[2, 3]);
        assert_eq!(desc.dtype(), DType::Int32);

        let floats = NestedList::flat([0.1f64, 0.2]);
        let desc = extract_buffer(&floats, None).unwrap();
        assert_eq!(desc.dtype(), DType::Float32);
        assert_eq!(desc.as_slice::<f32>(), Some(&[0.1f32, 0.2][..]));

        let big = NestedList::flat([1i64 << 40]);
        assert_eq!(extract_buffer(&big, None).unwrap().dtype(), DType::Int64);

        let flags = NestedList::flat([true, false]);
        assert_eq!(extract_buffer(&flags, None).unwrap().dtype(), DType::Bool);
    }

    #[test]
    fn ragged_lists_fail() {
        let list = NestedList::List(vec![NestedList::flat([1, 2]), NestedList::flat([3])]);
        let err = extract_buffer(&list, None).unwrap_err();
        assert_eq!(
            err,
            Error::RaggedSequence {
                depth: 1,
                expected: 2,
                found: 1,
            }
        );

        let mixed = NestedList::List(vec![NestedList::flat([1]), NestedList::Item(Scalar::I32(2))]);
        assert!(matches!(
            extract_buffer(&mixed, None),
            Err(Error::RaggedSequence { depth: 1, .. })
        ));
    }

    #[test]
    fn list_items_must_be_exactly_representable() {
        let list = NestedList::flat([1.5f64]);
        assert!(extract_buffer(&list, Some(DType::Int32)).is_err());

        let list = NestedList::flat([16_777_217i64]);
        assert!(extract_buffer(&list, Some(DType::Float32)).is_err());
        assert!(extract_buffer(&list, Some(DType::Float64)).is_ok());
    }

    #[test]
    fn narrowing_never_overflows_to_infinity() {
        let list = NestedList::flat([1e300f64, 2.0]);
        assert!(matches!(
            extract_buffer(&list, None),
            Err(Error::DTypeMismatch {
                expected: DType::Float32,
                actual: DType::Float64,
                ..
            })
        ));

        let list = NestedList::flat([f64::INFINITY, 2.0]);
        let desc = extract_buffer(&list, None).unwrap();
        assert_eq!(desc.as_slice::<f32>(), Some(&[f32::INFINITY, 2.0][..]));
    }

    #[test]
    fn scalars_become_rank_zero_copies() {
        let desc = extract_buffer(&Scalar::F64(2.5), None).unwrap();
        assert!(desc.shape().is_empty());
        assert_eq!(desc.element_count(), 1);
        assert_eq!(desc.as_slice::<f64>(), Some(&[2.5][..]));
    }

    #[test]
    fn bool_slices_use_the_byte_encoding() {
        let flags = [true, false, true];
        let desc = extract_buffer(&flags, None).unwrap();
        assert!(!desc.is_copy());
        assert_eq!(desc.as_slice::<u8>(), Some(&[1, 0, 1][..]));
    }
}
