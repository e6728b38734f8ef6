//! Execution resources shared by the dispatcher: the worker pool and the
//! per-thread scratch arenas.

pub mod arena;
pub mod pool;

pub use arena::{Scratch, ScratchArena, ScratchScope, ScratchStats, scratch_stats, with_scratch};
pub use pool::{HostLock, NoHostLock, WorkerPool, plan_chunks};
