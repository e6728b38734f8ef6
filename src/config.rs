//! Process-level tuning knobs.
//!
//! Read once from the environment on first use:
//!
//! | Variable                                    | Field                              |
//! |---------------------------------------------|------------------------------------|
//! | `TENSOR_DISPATCH_ARENA_SIZE`                | [`RuntimeConfig::arena_bytes`]     |
//! | `TENSOR_DISPATCH_NUM_THREADS`               | [`RuntimeConfig::num_threads`]     |
//! | `TENSOR_DISPATCH_ELEMENTWISE_THRESHOLD`     | `thresholds.elementwise_parallel`  |
//! | `TENSOR_DISPATCH_REDUCTION_THRESHOLD`       | `thresholds.reduction_parallel`    |
//! | `TENSOR_DISPATCH_MATMUL_PARALLEL_THRESHOLD` | `thresholds.matmul_parallel`       |
//! | `TENSOR_DISPATCH_LIBRARY_THRESHOLD`         | `thresholds.library`               |
//!
//! Values that do not parse as a positive integer (zero is allowed for the
//! arena size) are ignored with a warning.

use crate::backend::Thresholds;
use lazy_static::lazy_static;
use tracing::warn;

pub const ARENA_SIZE_VAR: &str = "TENSOR_DISPATCH_ARENA_SIZE";
pub const NUM_THREADS_VAR: &str = "TENSOR_DISPATCH_NUM_THREADS";
pub const ELEMENTWISE_THRESHOLD_VAR: &str = "TENSOR_DISPATCH_ELEMENTWISE_THRESHOLD";
pub const REDUCTION_THRESHOLD_VAR: &str = "TENSOR_DISPATCH_REDUCTION_THRESHOLD";
pub const MATMUL_PARALLEL_THRESHOLD_VAR: &str = "TENSOR_DISPATCH_MATMUL_PARALLEL_THRESHOLD";
pub const LIBRARY_THRESHOLD_VAR: &str = "TENSOR_DISPATCH_LIBRARY_THRESHOLD";

/// Default per-thread scratch arena: 1 MiB.
pub const DEFAULT_ARENA_BYTES: usize = 1024 * 1024;

/// Runtime configuration for the global dispatcher and the scratch arenas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Capacity of each thread's scratch arena.
    pub arena_bytes: usize,
    /// Worker pool size.
    pub num_threads: usize,
    pub thresholds: Thresholds,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            arena_bytes: DEFAULT_ARENA_BYTES,
            num_threads: num_cpus::get().max(1),
            thresholds: Thresholds::default(),
        }
    }
}

lazy_static! {
    static ref GLOBAL: RuntimeConfig = RuntimeConfig::from_env();
}

impl RuntimeConfig {
    /// The process-wide configuration, read from the environment once.
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Defaults overridden by the `TENSOR_DISPATCH_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let read = |key: &str, allow_zero: bool| -> Option<usize> {
            let raw = lookup(key)?;
            match raw.trim().parse::<usize>() {
                Ok(value) if value > 0 || allow_zero => Some(value),
                _ => {
                    warn!(var = key, value = %raw, "ignoring unparsable configuration value");
                    None
                }
            }
        };

        if let Some(bytes) = read(ARENA_SIZE_VAR, true) {
            config.arena_bytes = bytes;
        }
        if let Some(threads) = read(NUM_THREADS_VAR, false) {
            config.num_threads = threads;
        }
        let t = &mut config.thresholds;
        if let Some(v) = read(ELEMENTWISE_THRESHOLD_VAR, false) {
            t.elementwise_parallel = v;
        }
        if let Some(v) = read(REDUCTION_THRESHOLD_VAR, false) {
            t.reduction_parallel = v;
        }
        if let Some(v) = read(MATMUL_PARALLEL_THRESHOLD_VAR, false) {
            t.matmul_parallel = v;
        }
        if let Some(v) = read(LIBRARY_THRESHOLD_VAR, false) {
            t.library = v;
        }
        config
    }

    /// Capacity of each thread's scratch arena.
    #[must_use]
    pub const fn with_arena_bytes(mut self, bytes: usize) -> Self {
        self.arena_bytes = bytes;
        self
    }

    /// Clamped to at least one thread.
    #[must_use]
    pub const fn with_num_threads(mut self, threads: usize) -> Self {
        self.num_threads = if threads == 0 { 1 } else { threads };
        self
    }

    /// Replaces every threshold at once.
    #[must_use]
    pub const fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Smallest matmul dimension that routes to the library backend.
    #[must_use]
    pub const fn with_library_threshold(mut self, max_dim: usize) -> Self {
        self.thresholds.library = max_dim;
        self
    }
}
