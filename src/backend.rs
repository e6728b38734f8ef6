//! Backend selection.
//!
//! This module defines the closed set of execution backends, the policy that
//! steers them, and the pure decision function [`select`] the dispatcher
//! calls once per operation.
//!
//! # Supported Backends
//!
//! - `Scalar`: one element per step, lowest fixed overhead.
//! - `Vectorized`: fixed-width lanes with an explicit scalar remainder.
//! - `Library`: `faer`'s matrix product (needs the `library` feature).
//!
//! # Thresholds
//!
//! | Family       | Parallel fan-out           | Library                     |
//! |--------------|----------------------------|-----------------------------|
//! | element-wise | `count >= 262_144`         | never                       |
//! | reduction    | `count >= 1_000_000`       | never                       |
//! | matmul       | `m * k * n >= 2_097_152`   | `max(m, k, n) >= 256`       |
//!
//! These are starting points, not contract values. They are overridable
//! through [`RuntimeConfig`](crate::config::RuntimeConfig) and
//! [`set_thresholds`](crate::ops::dispatch::set_thresholds).

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::ops::vectorized::LANES;
use crate::validate::{OpFamily, Operation, WorkSize};
use core::convert::TryFrom;
use core::fmt;
use core::str::FromStr;
use core::time::Duration;
use lazy_static::lazy_static;

/// How the dispatcher picks a backend.
///
/// The `u8` encoding is stable for host bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum BackendPolicy {
    /// Size- and op-driven heuristics (default).
    #[default]
    Auto = 0,
    ForceScalar = 1,
    ForceVectorized = 2,
    ForceLibrary = 3,
}

impl BackendPolicy {
    /// Lowercase name used in records and host bindings.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::ForceScalar => "force-scalar",
            Self::ForceVectorized => "force-vectorized",
            Self::ForceLibrary => "force-library",
        }
    }

    /// The backend a forced policy names.
    #[must_use]
    pub const fn forced(self) -> Option<Backend> {
        match self {
            Self::Auto => None,
            Self::ForceScalar => Some(Backend::Scalar),
            Self::ForceVectorized => Some(Backend::Vectorized),
            Self::ForceLibrary => Some(Backend::Library),
        }
    }
}

impl TryFrom<u8> for BackendPolicy {
    type Error = ();

    fn try_from(value: u8) -> core::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Auto),
            1 => Ok(Self::ForceScalar),
            2 => Ok(Self::ForceVectorized),
            3 => Ok(Self::ForceLibrary),
            _ => Err(()),
        }
    }
}

impl FromStr for BackendPolicy {
    type Err = ();

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "force-scalar" | "scalar" => Ok(Self::ForceScalar),
            "force-vectorized" | "vectorized" => Ok(Self::ForceVectorized),
            "force-library" | "library" => Ok(Self::ForceLibrary),
            _ => Err(()),
        }
    }
}

impl fmt::Display for BackendPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Execution backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Scalar,
    Vectorized,
    Library,
}

impl Backend {
    /// Lowercase name used in records and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::Vectorized => "vectorized",
            Self::Library => "library",
        }
    }

    /// Whether this backend has a kernel for `op` on `dtype`.
    ///
    /// The library backend only multiplies float matrices, and only when it
    /// is compiled in.
    #[must_use]
    pub fn supports(self, op: Operation, dtype: DType, caps: &CpuCapabilities) -> bool {
        match self {
            Self::Scalar | Self::Vectorized => op.supports(dtype),
            Self::Library => {
                cfg!(feature = "library")
                    && caps.library_available
                    && op == Operation::Matmul
                    && dtype.is_float()
            }
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub const DEFAULT_ELEMENTWISE_PARALLEL: usize = 262_144;
pub const DEFAULT_REDUCTION_PARALLEL: usize = 1_000_000;
pub const DEFAULT_MATMUL_PARALLEL: usize = 128 * 128 * 128;
pub const DEFAULT_LIBRARY: usize = 256;

/// Per-family size thresholds. A size equal to a threshold crosses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Element count at which element-wise ops fan out.
    pub elementwise_parallel: usize,
    /// Element count at which reductions (and `dot`) fan out.
    pub reduction_parallel: usize,
    /// `m * k * n` at which matmul fans out over rows.
    pub matmul_parallel: usize,
    /// `max(m, k, n)` at which `Auto` hands matmul to the library.
    pub library: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            elementwise_parallel: DEFAULT_ELEMENTWISE_PARALLEL,
            reduction_parallel: DEFAULT_REDUCTION_PARALLEL,
            matmul_parallel: DEFAULT_MATMUL_PARALLEL,
            library: DEFAULT_LIBRARY,
        }
    }
}

impl Thresholds {
    /// Parallel fan-out threshold for `family`.
    #[must_use]
    pub const fn parallel(&self, family: OpFamily) -> usize {
        match family {
            OpFamily::Elementwise => self.elementwise_parallel,
            OpFamily::Reduction => self.reduction_parallel,
            OpFamily::Matmul => self.matmul_parallel,
        }
    }
}

/// What the host machine offers, detected once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuCapabilities {
    /// Widest vector register in bytes (16, 32 or 64).
    ///
    /// Reported for introspection and in dispatch logs; kernels step a fixed
    /// [`LANES`](crate::ops::vectorized::LANES) elements and leave the
    /// register choice to the compiler.
    pub vector_width_bytes: usize,
    /// Hardware threads, as `num_cpus::get` reports.
    pub logical_cores: usize,
    pub physical_cores: usize,
    /// Whether the `library` backend is linked in.
    pub library_available: bool,
}

lazy_static! {
    static ref CAPABILITIES: CpuCapabilities = CpuCapabilities::detect();
}

impl CpuCapabilities {
    /// Cached capabilities of this machine.
    pub fn get() -> &'static Self {
        &CAPABILITIES
    }

    /// Probes the CPU. Prefer [`CpuCapabilities::get`], which caches this.
    #[must_use]
    pub fn detect() -> Self {
        Self {
            vector_width_bytes: vector_width(),
            logical_cores: num_cpus::get(),
            physical_cores: num_cpus::get_physical(),
            library_available: cfg!(feature = "library"),
        }
    }

    /// Copy with the library backend marked absent.
    #[must_use]
    pub const fn without_library(mut self) -> Self {
        self.library_available = false;
        self
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn vector_width() -> usize {
    if std::arch::is_x86_feature_detected!("avx512f") {
        64
    } else if std::arch::is_x86_feature_detected!("avx2") {
        32
    } else {
        16
    }
}

// NEON on aarch64, and a conservative 16 bytes everywhere else
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn vector_width() -> usize {
    16
}

/// Whether and how an operation was split across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOut {
    /// Below the family's parallel threshold.
    Serial { size: usize, threshold: usize },
    /// At or above the threshold, split into `chunks` contiguous pieces.
    Parallel {
        size: usize,
        threshold: usize,
        chunks: usize,
    },
    /// Large enough, but only one worker (or one unit of work) exists.
    SingleWorker { size: usize, threshold: usize },
}

impl FanOut {
    /// Number of chunks this plan splits the work into.
    #[must_use]
    pub const fn chunks(self) -> usize {
        match self {
            Self::Parallel { chunks, .. } => chunks,
            Self::Serial { .. } | Self::SingleWorker { .. } => 1,
        }
    }
}

impl fmt::Display for FanOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial { size, threshold } => {
                write!(f, "below parallel threshold ({size} < {threshold})")
            }
            Self::Parallel {
                size,
                threshold,
                chunks,
            } => write!(
                f,
                "size {size} at or above parallel threshold {threshold}, split into {chunks} chunks"
            ),
            Self::SingleWorker { size, threshold } => write!(
                f,
                "size {size} at or above parallel threshold {threshold}, but a single chunk"
            ),
        }
    }
}

/// Why a backend was chosen. `Display` gives the human-readable explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchReason {
    /// A forced policy named the backend.
    Forced { policy: BackendPolicy, fan_out: FanOut },
    /// Fewer elements than one vector lane.
    BelowLaneWidth {
        elements: usize,
        lanes: usize,
        fan_out: FanOut,
    },
    /// Vectorized kernel, possibly fanned out.
    Vectorized { fan_out: FanOut },
    /// Matmul below the library threshold.
    BelowLibraryThreshold {
        max_dim: usize,
        threshold: usize,
        fan_out: FanOut,
    },
    /// Matmul at or above the library threshold.
    LibraryThreshold { max_dim: usize, threshold: usize },
    /// Matmul at or above the library threshold, but no library is linked.
    LibraryUnavailable {
        max_dim: usize,
        threshold: usize,
        fan_out: FanOut,
    },
}

impl fmt::Display for DispatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forced { policy, fan_out } => {
                write!(f, "forced by policy ({policy}); {fan_out}")
            }
            Self::BelowLaneWidth {
                elements,
                lanes,
                fan_out,
            } => write!(
                f,
                "{elements} elements fill less than one {lanes}-wide lane; {fan_out}: using scalar"
            ),
            Self::Vectorized { fan_out } => write!(f, "{fan_out}: using vectorized"),
            Self::BelowLibraryThreshold {
                max_dim,
                threshold,
                fan_out,
            } => write!(
                f,
                "size {max_dim} below library threshold {threshold}; {fan_out}: using vectorized"
            ),
            Self::LibraryThreshold { max_dim, threshold } => write!(
                f,
                "size {max_dim} at or above library threshold {threshold}: using library"
            ),
            Self::LibraryUnavailable {
                max_dim,
                threshold,
                fan_out,
            } => write!(
                f,
                "size {max_dim} at or above library threshold {threshold} but no library is \
                 linked; {fan_out}: using vectorized"
            ),
        }
    }
}

/// Outcome of [`select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub backend: Backend,
    /// Number of contiguous chunks; `1` means no fan-out.
    pub chunks: usize,
    pub reason: DispatchReason,
}

/// Picks the backend and fan-out for one operation.
///
/// Pure: the same inputs always give the same [`Selection`].
///
/// # Errors
/// [`Error::UnsupportedBackendForOperation`] when a forced policy names a
/// backend with no kernel for `op` on `dtype`.
pub fn select(
    op: Operation,
    size: WorkSize,
    dtype: DType,
    policy: BackendPolicy,
    thresholds: &Thresholds,
    caps: &CpuCapabilities,
    workers: usize,
) -> Result<Selection> {
    if let Some(backend) = policy.forced() {
        if !backend.supports(op, dtype, caps) {
            return Err(Error::UnsupportedBackendForOperation {
                op,
                dtype,
                policy,
                backend,
            });
        }
        let (fan_out, chunks) = match backend {
            Backend::Library => (library_fan_out(size, thresholds), 1),
            Backend::Scalar | Backend::Vectorized => {
                let fan_out = plan_fan_out(op, size, thresholds, workers);
                (fan_out, fan_out.chunks())
            }
        };
        return Ok(Selection {
            backend,
            chunks,
            reason: DispatchReason::Forced { policy, fan_out },
        });
    }

    let fan_out = plan_fan_out(op, size, thresholds, workers);
    let selection = match size {
        WorkSize::Matmul { m, k, n } => {
            let max_dim = m.max(k).max(n);
            let threshold = thresholds.library;
            if max_dim < threshold {
                Selection {
                    backend: Backend::Vectorized,
                    chunks: fan_out.chunks(),
                    reason: DispatchReason::BelowLibraryThreshold {
                        max_dim,
                        threshold,
                        fan_out,
                    },
                }
            } else if Backend::Library.supports(op, dtype, caps) {
                Selection {
                    backend: Backend::Library,
                    chunks: 1,
                    reason: DispatchReason::LibraryThreshold { max_dim, threshold },
                }
            } else {
                Selection {
                    backend: Backend::Vectorized,
                    chunks: fan_out.chunks(),
                    reason: DispatchReason::LibraryUnavailable {
                        max_dim,
                        threshold,
                        fan_out,
                    },
                }
            }
        }
        WorkSize::Elements(elements) if elements < LANES => Selection {
            backend: Backend::Scalar,
            chunks: fan_out.chunks(),
            reason: DispatchReason::BelowLaneWidth {
                elements,
                lanes: LANES,
                fan_out,
            },
        },
        WorkSize::Elements(_) => Selection {
            backend: Backend::Vectorized,
            chunks: fan_out.chunks(),
            reason: DispatchReason::Vectorized { fan_out },
        },
    };
    Ok(selection)
}

/// The library parallelises internally, so its calls are never chunked.
const fn library_fan_out(size: WorkSize, thresholds: &Thresholds) -> FanOut {
    let size = match size {
        WorkSize::Elements(n) => n,
        WorkSize::Matmul { m, k, n } => m.saturating_mul(k).saturating_mul(n),
    };
    let threshold = thresholds.matmul_parallel;
    if size < threshold {
        FanOut::Serial { size, threshold }
    } else {
        FanOut::SingleWorker { size, threshold }
    }
}

fn plan_fan_out(op: Operation, size: WorkSize, thresholds: &Thresholds, workers: usize) -> FanOut {
    let threshold = thresholds.parallel(op.family());
    let (size, units) = match size {
        WorkSize::Elements(n) => (n, n),
        WorkSize::Matmul { m, k, n } => (m.saturating_mul(k).saturating_mul(n), m),
    };
    if size < threshold {
        return FanOut::Serial { size, threshold };
    }
    let chunks = workers.min(units);
    if chunks <= 1 {
        FanOut::SingleWorker { size, threshold }
    } else {
        FanOut::Parallel {
            size,
            threshold,
            chunks,
        }
    }
}

/// Audit trail of one completed dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    /// Monotonic per dispatcher, starting at 1.
    pub sequence: u64,
    pub operation: Operation,
    pub operand_shapes: Vec<Vec<usize>>,
    pub dtype: DType,
    pub policy_in_effect: BackendPolicy,
    pub backend_selected: Backend,
    pub reason: DispatchReason,
    pub chunks: usize,
    /// Wall time spent in the kernels.
    pub elapsed: Duration,
}

impl fmt::Display for DispatchRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} → {} (shapes {:?}, {}, policy={}, chunks={}, {}µs): {}",
            self.sequence,
            self.operation,
            self.backend_selected,
            self.operand_shapes,
            self.dtype,
            self.policy_in_effect,
            self.chunks,
            self.elapsed.as_micros(),
            self.reason
        )
    }
}
