//! Thread-local scratch arena.
//!
//! A fixed-capacity bump allocator per thread for short-lived buffers, such
//! as per-chunk partial results. Memory is handed out from a scope opened
//! with [`with_scratch`] and reclaimed all at once, in O(1), when the scope
//! ends. That happens on every exit path, unwinding included.
//!
//! Scopes nest. An inner scope allocates above the outer one and releases
//! back to where it started. While an inner scope is open, the outer scope's
//! allocations are served from the heap. Requests that do not fit fall back
//! to the heap as well, so allocation never fails.
//!
//! # Example
//!
//! ```
//! use tensor_dispatch::scheduler::arena::{with_scratch, scratch_stats};
//!
//! let total = with_scratch(|scratch| {
//!     let mut partials = scratch.alloc_zeroed::<f64>(4);
//!     partials.copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
//!     partials.iter().sum::<f64>()
//! });
//! assert_eq!(total, 10.0);
//! assert_eq!(scratch_stats().used_bytes, 0);
//! ```

use crate::config::RuntimeConfig;
use crate::dtype::Element;
use core::cell::Cell;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

/// Every allocation starts on a 64-byte boundary.
pub const ALIGN: usize = 64;

/// A per-thread bump allocator. Not `Send`: it never leaves its thread.
#[derive(Debug)]
pub struct ScratchArena {
    storage: NonNull<[u64]>,
    /// Byte offset from `storage` to the first 64-byte boundary.
    lead: usize,
    capacity: usize,
    top: Cell<usize>,
    depth: Cell<usize>,
    heap_fallbacks: Cell<usize>,
}

impl ScratchArena {
    /// An arena with room for `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let words = capacity.div_ceil(size_of::<u64>()) + ALIGN / size_of::<u64>();
        let storage = NonNull::from(Box::leak(vec![0u64; words].into_boxed_slice()));
        let lead = storage.cast::<u8>().as_ptr().align_offset(ALIGN);
        Self {
            storage,
            lead,
            capacity,
            top: Cell::new(0),
            depth: Cell::new(0),
            heap_fallbacks: Cell::new(0),
        }
    }

    /// Usable bytes after alignment.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes held by open scopes.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.top.get()
    }

    /// Bytes still free for the innermost scope.
    #[must_use]
    pub fn available_bytes(&self) -> usize {
        self.capacity - self.top.get()
    }

    /// Number of requests served from the heap instead.
    #[must_use]
    pub fn heap_fallbacks(&self) -> usize {
        self.heap_fallbacks.get()
    }

    /// Runs `f` with a fresh scope; its allocations are released on return.
    pub fn with_scope<R>(&self, f: impl FnOnce(&ScratchScope<'_>) -> R) -> R {
        let depth = self.depth.get() + 1;
        self.depth.set(depth);
        let scope = ScratchScope {
            arena: self,
            mark: self.top.get(),
            depth,
        };
        f(&scope)
    }

    /// Usage snapshot for this arena.
    #[must_use]
    pub fn stats(&self) -> ScratchStats {
        ScratchStats {
            used_bytes: self.used_bytes(),
            capacity: self.capacity,
            available_bytes: self.available_bytes(),
            heap_fallbacks: self.heap_fallbacks(),
        }
    }
}

impl Drop for ScratchArena {
    fn drop(&mut self) {
        // SAFETY: `storage` came from `Box::leak` in `new` and is freed once.
        drop(unsafe { Box::from_raw(self.storage.as_ptr()) });
    }
}

/// An open allocation scope. Only reachable through [`with_scratch`] or
/// [`ScratchArena::with_scope`], so scopes always close in LIFO order.
#[derive(Debug)]
pub struct ScratchScope<'s> {
    arena: &'s ScratchArena,
    mark: usize,
    depth: usize,
}

impl ScratchScope<'_> {
    /// `len` zeroed elements, from the arena when they fit.
    pub fn alloc_zeroed<T: Element>(&self, len: usize) -> Scratch<'_, T> {
        let arena = self.arena;
        let Some(bytes) = len.checked_mul(size_of::<T>()) else {
            return self.heap(len);
        };
        if len == 0 {
            return Scratch::Heap(Vec::new());
        }
        if self.depth != arena.depth.get() {
            return self.heap(len);
        }
        let start = arena.top.get().next_multiple_of(ALIGN);
        let Some(end) = start.checked_add(bytes).filter(|&end| end <= arena.capacity) else {
            return self.heap(len);
        };
        arena.top.set(end);

        // SAFETY: `[start, end)` lies inside the storage (capacity plus the
        // alignment lead was reserved in `new`) and starts on a 64-byte
        // boundary, which satisfies every element alignment. No other live
        // slice overlaps it: `top` only moves below `end` when the scope that
        // owns this range closes, and the returned borrow cannot outlive that
        // scope. All elements are `Pod`, so zero bytes are valid values.
        let slice = unsafe {
            let ptr = arena
                .storage
                .cast::<u8>()
                .as_ptr()
                .add(arena.lead + start)
                .cast::<T>();
            ptr.write_bytes(0, len);
            core::slice::from_raw_parts_mut(ptr, len)
        };
        Scratch::Arena(slice)
    }

    fn heap<T: Element>(&self, len: usize) -> Scratch<'_, T> {
        let arena = self.arena;
        arena.heap_fallbacks.set(arena.heap_fallbacks.get() + 1);
        Scratch::Heap(vec![T::zeroed(); len])
    }
}

impl Drop for ScratchScope<'_> {
    fn drop(&mut self) {
        self.arena.top.set(self.mark);
        self.arena.depth.set(self.depth - 1);
    }
}

/// A scratch buffer, either carved from the arena or heap-allocated.
#[derive(Debug)]
pub enum Scratch<'a, T> {
    Arena(&'a mut [T]),
    Heap(Vec<T>),
}

impl<T> Scratch<'_, T> {
    #[must_use]
    pub const fn is_arena(&self) -> bool {
        matches!(self, Self::Arena(_))
    }
}

impl<T> Deref for Scratch<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        match self {
            Self::Arena(slice) => slice,
            Self::Heap(vec) => vec,
        }
    }
}

impl<T> DerefMut for Scratch<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        match self {
            Self::Arena(slice) => slice,
            Self::Heap(vec) => vec,
        }
    }
}

/// Arena usage snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchStats {
    pub used_bytes: usize,
    pub capacity: usize,
    pub available_bytes: usize,
    pub heap_fallbacks: usize,
}

thread_local! {
    static ARENA: ScratchArena = ScratchArena::new(RuntimeConfig::global().arena_bytes);
}

/// Opens a scope on the current thread's arena.
pub fn with_scratch<R>(f: impl FnOnce(&ScratchScope<'_>) -> R) -> R {
    ARENA.with(|arena| arena.with_scope(f))
}

/// Usage of the current thread's arena.
#[must_use]
pub fn scratch_stats() -> ScratchStats {
    ARENA.with(ScratchArena::stats)
}
