//! tensor_dispatch: validated buffer extraction and explainable backend
//! dispatch for CPU tensor kernels.
//!
//! Every operation follows the same pipeline:
//!
//! 1. **Extract**: any array-like source becomes a dense, typed
//!    [`BufferDescriptor`], borrowed zero-copy whenever the memory allows it.
//! 2. **Validate**: [`validate_and_allocate`] checks arity, dtypes and shapes
//!    once and allocates the output.
//! 3. **Dispatch**: the [`Dispatcher`] picks a scalar, vectorized or library
//!    kernel, optionally fans out over worker threads, and records why.
//!
//! # Features
//!
//! - Element-wise `add`, `sub`, `mul`, `div`; reductions `sum`, `mean`, `all`,
//!   `any`; `dot`; 2-D `matmul`.
//! - Compensated float reductions with deterministic chunk combination.
//! - A per-thread scratch arena for chunk partials.
//! - A queryable [`DispatchRecord`] for the last decision.
//!
//! # Modules
//!
//! - [`buffer`]: owned arrays, descriptors and the extraction layer.
//! - [`validate`]: operations and the validation layer.
//! - [`backend`]: policies, thresholds and backend selection.
//! - [`ops`]: kernels, the dispatcher and one-call entry points.
//! - [`scheduler`]: the worker pool and scratch arenas.
//! - [`config`]: environment-driven tuning.
//!
//! # Example
//!
//! ```rust
//! use tensor_dispatch::{array, ops, explain_last_dispatch};
//!
//! let a = array!([[1.0f32, 2.0], [3.0, 4.0]]);
//! let b = array!([[1.0f32, 0.0], [0.0, 1.0]]);
//! let c = ops::matmul(&a, &b)?;
//! assert_eq!(c.as_slice::<f32>(), Some(&[1.0, 2.0, 3.0, 4.0][..]));
//!
//! if let Some(record) = explain_last_dispatch() {
//!     println!("{record}");
//! }
//! # Ok::<(), tensor_dispatch::Error>(())
//! ```

pub mod backend;
pub mod buffer;
pub mod config;
pub mod dtype;
pub mod error;
pub mod ops;
pub mod scheduler;
pub mod validate;

pub use backend::{
    Backend, BackendPolicy, CpuCapabilities, DispatchReason, DispatchRecord, Thresholds,
};
pub use buffer::extract::{ArrayLike, extract_buffer};
pub use buffer::{BufferDescriptor, HostArray, HostBuffer};
pub use config::RuntimeConfig;
pub use dtype::{DType, Device, Scalar};
pub use error::{Error, ErrorCategory, Result};
pub use ops::OpOutput;
pub use ops::dispatch::{
    Dispatcher, dispatch, dispatch_with, explain_last_dispatch, get_backend_policy,
    set_backend_policy,
};
pub use validate::{Operation, OutputBuffer, ValidatedOperation, validate_and_allocate};

/// Hardware features detected at first use.
#[must_use]
pub fn capabilities() -> &'static CpuCapabilities {
    CpuCapabilities::get()
}
