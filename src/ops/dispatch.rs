//! Operation Dispatch Layer
//!
//! This module runs a [`ValidatedOperation`] on the backend chosen by
//! [`select`], fanning out over the worker pool when the work is large enough,
//! and records why that backend was chosen.
//!
//! # Design Highlights
//! - **One state object**: policy, thresholds and the last record live in a
//!   [`Dispatcher`]; the process-wide one backs the free functions here
//! - **Short critical sections**: the state lock is never held while a kernel
//!   runs
//! - **Deterministic combines**: chunk partials are merged in chunk order, not
//!   completion order
//!
//! # Example
//! ```rust
//! use tensor_dispatch::{array, extract_buffer, validate_and_allocate, Operation};
//! use tensor_dispatch::ops::dispatch::{dispatch, explain_last_dispatch};
//!
//! let a = array!([[1.0f32, 2.0], [3.0, 4.0]]);
//! let b = array!([[5.0f32, 6.0], [7.0, 8.0]]);
//! let operands = vec![extract_buffer(&a, None)?, extract_buffer(&b, None)?];
//! let (validated, output) = validate_and_allocate(Operation::Matmul, operands)?;
//! let (result, record) = dispatch(validated, output)?;
//!
//! let product = result.into_array().unwrap();
//! assert_eq!(product.as_slice::<f32>(), Some(&[19.0, 22.0, 43.0, 50.0][..]));
//! assert_eq!(explain_last_dispatch().map(|r| r.sequence), Some(record.sequence));
//! # Ok::<(), tensor_dispatch::Error>(())
//! ```

use super::scalar::Neumaier;
use super::{OpOutput, note_kernel_calls, scalar, vectorized};
use crate::backend::{Backend, BackendPolicy, CpuCapabilities, DispatchRecord, Selection, Thresholds, select};
use crate::buffer::HostArray;
use crate::config::RuntimeConfig;
use crate::dtype::{DType, Element, Float, Integer, Numeric};
use crate::error::Result;
use crate::scheduler::arena::with_scratch;
use crate::scheduler::pool::{HostLock, NoHostLock, WorkerPool, plan_chunks, split_by_ranges};
use crate::validate::{OpFamily, Operation, OutputBuffer, ValidatedOperation, WorkSize};
use core::ops::Range;
use lazy_static::lazy_static;
use rayon::prelude::*;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct DispatchState {
    policy: BackendPolicy,
    thresholds: Thresholds,
    last: Option<DispatchRecord>,
    sequence: u64,
}

/// Owns the dispatch policy, the thresholds, the audit trail and the workers.
#[derive(Debug)]
pub struct Dispatcher {
    state: Mutex<DispatchState>,
    pool: WorkerPool,
    capabilities: CpuCapabilities,
}

lazy_static! {
    static ref GLOBAL: Dispatcher = Dispatcher::new(RuntimeConfig::global());
}

impl Dispatcher {
    /// A dispatcher with its own pool, using the detected capabilities.
    pub fn new(config: &RuntimeConfig) -> Self {
        Self::with_capabilities(config, *CpuCapabilities::get())
    }

    /// A dispatcher that plans against `capabilities` instead of the host's.
    pub fn with_capabilities(config: &RuntimeConfig, capabilities: CpuCapabilities) -> Self {
        Self {
            state: Mutex::new(DispatchState {
                policy: BackendPolicy::Auto,
                thresholds: config.thresholds,
                last: None,
                sequence: 0,
            }),
            pool: WorkerPool::new(config.num_threads),
            capabilities,
        }
    }

    /// The process-wide dispatcher, built from [`RuntimeConfig::global`].
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    fn state(&self) -> MutexGuard<'_, DispatchState> {
        // the state is plain data; a panic elsewhere cannot leave it torn
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes effect for dispatches that start after this call.
    pub fn set_policy(&self, policy: BackendPolicy) {
        self.state().policy = policy;
    }

    /// The policy the next dispatch will read.
    pub fn policy(&self) -> BackendPolicy {
        self.state().policy
    }

    /// Replaces all thresholds; takes effect for dispatches that start after this call.
    ///
    /// ```rust
    /// use tensor_dispatch::{Dispatcher, RuntimeConfig, Thresholds};
    ///
    /// let d = Dispatcher::new(&RuntimeConfig::default().with_num_threads(2));
    /// d.set_thresholds(Thresholds { reduction_parallel: 1_000, ..d.thresholds() });
    /// assert_eq!(d.thresholds().reduction_parallel, 1_000);
    /// ```
    pub fn set_thresholds(&self, thresholds: Thresholds) {
        self.state().thresholds = thresholds;
    }

    /// Thresholds the next dispatch will read.
    pub fn thresholds(&self) -> Thresholds {
        self.state().thresholds
    }

    /// Record of the most recent completed dispatch, if any.
    pub fn last_dispatch(&self) -> Option<DispatchRecord> {
        self.state().last.clone()
    }

    /// Threads in this dispatcher's pool.
    pub const fn workers(&self) -> usize {
        self.pool.workers()
    }

    /// The capabilities `select` plans against.
    pub const fn capabilities(&self) -> &CpuCapabilities {
        &self.capabilities
    }

    /// Runs `validated` into `output`.
    ///
    /// # Errors
    /// [`Error::UnsupportedBackendForOperation`](crate::Error::UnsupportedBackendForOperation)
    /// when the policy forces a backend with no kernel for the operation.
    /// Nothing runs and no record is written in that case.
    pub fn dispatch(
        &self,
        validated: ValidatedOperation<'_>,
        output: OutputBuffer,
    ) -> Result<(OpOutput, DispatchRecord)> {
        self.dispatch_with(validated, output, &NoHostLock)
    }

    /// Like [`dispatch`](Self::dispatch), releasing `host` around parallel
    /// and library sections.
    ///
    /// # Errors
    /// See [`dispatch`](Self::dispatch).
    pub fn dispatch_with<H: HostLock + ?Sized>(
        &self,
        validated: ValidatedOperation<'_>,
        mut output: OutputBuffer,
        host: &H,
    ) -> Result<(OpOutput, DispatchRecord)> {
        let (policy, thresholds) = {
            let state = self.state();
            (state.policy, state.thresholds)
        };
        let op = validated.op();
        let size = validated.work_size();
        let selection = select(
            op,
            size,
            validated.dtype(),
            policy,
            &thresholds,
            &self.capabilities,
            self.pool.workers(),
        )?;
        debug!(
            op = op.name(),
            backend = selection.backend.name(),
            chunks = selection.chunks,
            vector_width = self.capabilities.vector_width_bytes,
            shape = ?validated.operands().first().map(|d| d.shape()),
            "dispatching"
        );

        let library_workers = match size {
            WorkSize::Matmul { m, k, n }
                if m.saturating_mul(k).saturating_mul(n) >= thresholds.matmul_parallel =>
            {
                self.pool.workers()
            }
            _ => 1,
        };
        let parallel = selection.chunks > 1
            || (selection.backend == Backend::Library && library_workers > 1);

        note_kernel_calls(selection.chunks);
        let started = Instant::now();
        {
            let plan = Plan {
                selection: &selection,
                library_workers,
            };
            let output = &mut output;
            let validated = &validated;
            if parallel {
                host.allow_threads(|| self.pool.install(|| execute(validated, output, &plan)));
            } else {
                execute(validated, output, &plan);
            }
        }
        let elapsed = started.elapsed();

        let record = {
            let mut state = self.state();
            state.sequence += 1;
            let record = DispatchRecord {
                sequence: state.sequence,
                operation: op,
                operand_shapes: validated.operand_shapes(),
                dtype: validated.dtype(),
                policy_in_effect: policy,
                backend_selected: selection.backend,
                reason: selection.reason,
                chunks: selection.chunks,
                elapsed,
            };
            state.last = Some(record.clone());
            record
        };
        Ok((finish(op, output), record))
    }
}

struct Plan<'s> {
    selection: &'s Selection,
    library_workers: usize,
}

impl Plan<'_> {
    fn scalar(&self) -> bool {
        self.selection.backend == Backend::Scalar
    }
}

fn finish(op: Operation, output: OutputBuffer) -> OpOutput {
    let (shape, buffer) = output.into_parts();
    match op.family() {
        OpFamily::Reduction => match buffer.first() {
            Some(value) => OpOutput::Scalar(value),
            None => unreachable!("reductions allocate one output element"),
        },
        OpFamily::Elementwise | OpFamily::Matmul => OpOutput::Array(HostArray::new(shape, buffer)),
    }
}

fn operand<'v, T: Element>(validated: &'v ValidatedOperation<'_>, index: usize) -> &'v [T] {
    match validated.operands().get(index).and_then(|d| d.as_slice::<T>()) {
        Some(slice) => slice,
        None => unreachable!("validated operand {index} is not {}", T::DTYPE),
    }
}

fn output_slice<T: Element>(output: &mut OutputBuffer) -> &mut [T] {
    match output.buffer_mut().as_mut_slice::<T>() {
        Some(slice) => slice,
        None => unreachable!("output buffer is not {}", T::DTYPE),
    }
}

fn execute(validated: &ValidatedOperation<'_>, output: &mut OutputBuffer, plan: &Plan<'_>) {
    match validated.dtype() {
        DType::Float32 => execute_float::<f32>(validated, output, plan),
        DType::Float64 => execute_float::<f64>(validated, output, plan),
        DType::Int32 => execute_int::<i32>(validated, output, plan),
        DType::Int64 => execute_int::<i64>(validated, output, plan),
        DType::Bool => execute_bool(validated, output, plan),
    }
}

type Binary<T> = fn(&[T], &[T], &mut [T]);

fn numeric_kernel<T: Numeric>(op: Operation, scalar_backend: bool) -> Binary<T> {
    match (op, scalar_backend) {
        (Operation::Add, true) => scalar::add,
        (Operation::Add, false) => vectorized::add,
        (Operation::Sub, true) => scalar::sub,
        (Operation::Sub, false) => vectorized::sub,
        (Operation::Mul, true) => scalar::mul,
        (Operation::Mul, false) => vectorized::mul,
        _ => unreachable!("{op} is not an element-wise numeric op"),
    }
}

fn float_kernel<T: Float>(op: Operation, scalar_backend: bool) -> Binary<T> {
    match (op, scalar_backend) {
        (Operation::Div, true) => scalar::div,
        (Operation::Div, false) => vectorized::div,
        _ => numeric_kernel(op, scalar_backend),
    }
}

fn execute_float<T: Float>(validated: &ValidatedOperation<'_>, output: &mut OutputBuffer, plan: &Plan<'_>) {
    let op = validated.op();
    let scalar_backend = plan.scalar();
    let chunks = plan.selection.chunks;
    let a = operand::<T>(validated, 0);
    match op {
        Operation::Add | Operation::Sub | Operation::Mul | Operation::Div => {
            let b = operand::<T>(validated, 1);
            let kernel = float_kernel::<T>(op, scalar_backend);
            elementwise(a, b, output_slice(output), chunks, kernel);
        }
        Operation::Sum | Operation::Mean => {
            let kernel: fn(&[T]) -> Neumaier<T> = if scalar_backend {
                scalar::sum_partial
            } else {
                vectorized::sum_partial
            };
            let total = reduce_float(a.len(), chunks, |r| kernel(&a[r]));
            output_slice::<T>(output)[0] = if op == Operation::Mean {
                total.div(T::from_count(a.len()))
            } else {
                total
            };
        }
        Operation::Dot => {
            let b = operand::<T>(validated, 1);
            let kernel: fn(&[T], &[T]) -> Neumaier<T> = if scalar_backend {
                scalar::dot_partial
            } else {
                vectorized::dot_partial
            };
            output_slice::<T>(output)[0] = reduce_float(a.len(), chunks, |r| kernel(&a[r.clone()], &b[r]));
        }
        Operation::Matmul => {
            let b = operand::<T>(validated, 1);
            let (m, k, n) = match validated.work_size() {
                WorkSize::Matmul { m, k, n } => (m, k, n),
                WorkSize::Elements(_) => unreachable!("matmul work is sized by m, k, n"),
            };
            let out = output_slice::<T>(output);
            match plan.selection.backend {
                Backend::Library => library_matmul(a, b, out, (m, k, n), plan.library_workers),
                Backend::Scalar => matmul_rows(a, b, out, (m, k, n), chunks, scalar::matmul),
                Backend::Vectorized => matmul_rows(a, b, out, (m, k, n), chunks, vectorized::matmul),
            }
        }
        Operation::All | Operation::Any => unreachable!("{op} only runs on bool"),
    }
}

fn execute_int<T: Integer>(validated: &ValidatedOperation<'_>, output: &mut OutputBuffer, plan: &Plan<'_>) {
    let op = validated.op();
    let scalar_backend = plan.scalar();
    let chunks = plan.selection.chunks;
    let a = operand::<T>(validated, 0);
    match op {
        Operation::Add | Operation::Sub | Operation::Mul => {
            let b = operand::<T>(validated, 1);
            let kernel = numeric_kernel::<T>(op, scalar_backend);
            elementwise(a, b, output_slice(output), chunks, kernel);
        }
        Operation::Sum => {
            let kernel: fn(&[T]) -> i64 = if scalar_backend { scalar::sum_int } else { vectorized::sum_int };
            output_slice::<i64>(output)[0] = reduce_chunks(
                a.len(),
                chunks,
                |r| kernel(&a[r]),
                |partials: &[i64]| partials.iter().fold(0i64, |acc, &p| acc.wrapping_add(p)),
            );
        }
        Operation::Mean => {
            let kernel: fn(&[T]) -> Neumaier<f64> = if scalar_backend {
                scalar::sum_int_f64
            } else {
                vectorized::sum_int_f64
            };
            let total = reduce_float(a.len(), chunks, |r| kernel(&a[r]));
            output_slice::<f64>(output)[0] = total / f64::from_count(a.len());
        }
        _ => unreachable!("{op} is not supported on {}", T::DTYPE),
    }
}

fn execute_bool(validated: &ValidatedOperation<'_>, output: &mut OutputBuffer, plan: &Plan<'_>) {
    let op = validated.op();
    let scalar_backend = plan.scalar();
    let x = operand::<u8>(validated, 0);
    let hit = match op {
        Operation::All => {
            let kernel: fn(&[u8]) -> bool = if scalar_backend { scalar::all } else { vectorized::all };
            reduce_chunks(
                x.len(),
                plan.selection.chunks,
                |r| u8::from(kernel(&x[r])),
                |partials: &[u8]| partials.iter().all(|&p| p != 0),
            )
        }
        Operation::Any => {
            let kernel: fn(&[u8]) -> bool = if scalar_backend { scalar::any } else { vectorized::any };
            reduce_chunks(
                x.len(),
                plan.selection.chunks,
                |r| u8::from(kernel(&x[r])),
                |partials: &[u8]| partials.iter().any(|&p| p != 0),
            )
        }
        _ => unreachable!("{op} is not supported on bool"),
    };
    output_slice::<u8>(output)[0] = u8::from(hit);
}

fn elementwise<T: Element>(a: &[T], b: &[T], out: &mut [T], chunks: usize, kernel: Binary<T>) {
    if chunks <= 1 {
        kernel(a, b, out);
        return;
    }
    let ranges = plan_chunks(out.len(), chunks);
    split_by_ranges(out, &ranges, 1)
        .into_par_iter()
        .zip(ranges.par_iter())
        .for_each(|(piece, r)| kernel(&a[r.clone()], &b[r.clone()], piece));
}

/// Per-chunk partials go to the scratch arena and are combined in chunk
/// order by `combine`.
fn reduce_chunks<P, R>(
    units: usize,
    chunks: usize,
    partial: impl Fn(Range<usize>) -> P + Sync,
    combine: impl FnOnce(&[P]) -> R,
) -> R
where
    P: Element,
{
    if chunks <= 1 {
        return combine(&[partial(0..units)]);
    }
    let ranges = plan_chunks(units, chunks);
    with_scratch(|scratch| {
        let mut partials = scratch.alloc_zeroed::<P>(ranges.len());
        let slots: &mut [P] = &mut partials;
        slots
            .par_iter_mut()
            .zip(ranges.par_iter())
            .for_each(|(slot, r)| *slot = partial(r.clone()));
        combine(slots)
    })
}

/// Like [`reduce_chunks`], but each chunk leaves its `(sum, compensation)`
/// pair in the arena and the pairs are merged in chunk order.
fn reduce_float<T: Float>(
    units: usize,
    chunks: usize,
    partial: impl Fn(Range<usize>) -> Neumaier<T> + Sync,
) -> T {
    if chunks <= 1 {
        return partial(0..units).total();
    }
    let ranges = plan_chunks(units, chunks);
    with_scratch(|scratch| {
        let mut pairs = scratch.alloc_zeroed::<T>(2 * ranges.len());
        let slots: &mut [T] = &mut pairs;
        slots
            .par_chunks_mut(2)
            .zip(ranges.par_iter())
            .for_each(|(slot, r)| {
                let (sum, compensation) = partial(r.clone()).parts();
                slot[0] = sum;
                slot[1] = compensation;
            });
        let mut acc = Neumaier::new();
        for pair in slots.chunks_exact(2) {
            acc.merge(Neumaier::from_parts(pair[0], pair[1]));
        }
        acc.total()
    })
}

type MatmulKernel<T> = fn(&[T], &[T], &mut [T], usize, usize, usize);

fn matmul_rows<T: Float>(
    a: &[T],
    b: &[T],
    out: &mut [T],
    (m, k, n): (usize, usize, usize),
    chunks: usize,
    kernel: MatmulKernel<T>,
) {
    if chunks <= 1 {
        kernel(a, b, out, m, k, n);
        return;
    }
    let rows = plan_chunks(m, chunks);
    split_by_ranges(out, &rows, n)
        .into_par_iter()
        .zip(rows.par_iter())
        .for_each(|(piece, r)| kernel(&a[r.start * k..r.end * k], b, piece, r.len(), k, n));
}

#[cfg(feature = "library")]
fn library_matmul<T: Float>(a: &[T], b: &[T], out: &mut [T], (m, k, n): (usize, usize, usize), workers: usize) {
    super::library::matmul(a, b, out, m, k, n, workers);
}

#[cfg(not(feature = "library"))]
fn library_matmul<T: Float>(_: &[T], _: &[T], _: &mut [T], _: (usize, usize, usize), _: usize) {
    unreachable!("the library backend is never selected without the `library` feature")
}

/// Sets the global dispatch policy.
pub fn set_backend_policy(policy: BackendPolicy) {
    Dispatcher::global().set_policy(policy);
}

/// The global dispatch policy.
pub fn get_backend_policy() -> BackendPolicy {
    Dispatcher::global().policy()
}

/// The last dispatch recorded by the global dispatcher.
pub fn explain_last_dispatch() -> Option<DispatchRecord> {
    Dispatcher::global().last_dispatch()
}

/// Replaces the global dispatcher's thresholds.
pub fn set_thresholds(thresholds: Thresholds) {
    Dispatcher::global().set_thresholds(thresholds);
}

/// The global dispatcher's thresholds.
pub fn thresholds() -> Thresholds {
    Dispatcher::global().thresholds()
}

/// Dispatches on the global dispatcher.
///
/// # Errors
/// See [`Dispatcher::dispatch`].
pub fn dispatch(validated: ValidatedOperation<'_>, output: OutputBuffer) -> Result<(OpOutput, DispatchRecord)> {
    Dispatcher::global().dispatch(validated, output)
}

/// Dispatches on the global dispatcher, releasing `host` around parallel work.
///
/// # Errors
/// See [`Dispatcher::dispatch`].
pub fn dispatch_with<H: HostLock + ?Sized>(
    validated: ValidatedOperation<'_>,
    output: OutputBuffer,
    host: &H,
) -> Result<(OpOutput, DispatchRecord)> {
    Dispatcher::global().dispatch_with(validated, output, host)
}
