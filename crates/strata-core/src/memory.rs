//! # Buffer Provider
//!
//! Every live slice holds one buffer from an external provider. The slice
//! store only ever calls [`BufferProvider::allocate`] when it creates a
//! slice and [`BufferProvider::release`] when the slice is reclaimed; it never
//! looks inside the storage.
//!
//! A [`BufferHandle`] is a reservation, not the payload's memory: payloads
//! are ordinary Rust values on the heap, owned by their slice. What the
//! provider controls is how many slices may exist at once and how large a
//! slice's fixed footprint may be, so an exhausted provider turns into an
//! allocation error on slice creation instead of unbounded growth.
//!
//! [`PooledBufferProvider`] is a bounded, thread-safe pool that reuses
//! released handles before minting new ones.
//!
//! ```rust
//! use strata_core::memory::{BufferProvider, PooledBufferProvider};
//!
//! let pool = PooledBufferProvider::new(4096, 2);
//! let a = pool.allocate(1024).unwrap();
//! let _b = pool.allocate(1024).unwrap();
//! assert!(pool.allocate(1024).is_err()); // exhausted
//!
//! pool.release(a);
//! assert!(pool.allocate(512).is_ok()); // reused
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Errors returned by a buffer provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// No buffer available right now; callers may retry with backoff
    #[error("Buffer pool exhausted ({capacity} buffers in use)")]
    Exhausted {
        /// Number of buffers the pool can hand out
        capacity: usize,
    },

    /// Request larger than the provider's buffer size
    #[error("Requested {requested} bytes but buffers hold {buffer_size}")]
    TooLarge {
        /// Requested size in bytes
        requested: usize,
        /// Size of every buffer in the pool
        buffer_size: usize,
    },
}

/// Opaque handle to storage owned by a [`BufferProvider`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    id: u64,
    size: usize,
}

impl BufferHandle {
    /// Creates a handle. Only providers mint handles.
    #[must_use]
    pub const fn new(id: u64, size: usize) -> Self {
        Self { id, size }
    }

    /// Returns the provider-assigned ID.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Returns the usable size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}

/// Supplier of slice storage reservations.
///
/// The handle it returns accounts for one slice; the payload itself is not
/// placed inside it. Implementations that back handles with real memory
/// (for example to track it against a budget) may do so, the store treats
/// handles as opaque either way.
///
/// Implementations must be safe to call from every worker thread.
pub trait BufferProvider: Send + Sync {
    /// Hands out storage of at least `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the request cannot be served. Exhaustion is
    /// transient and not retried by the slice store.
    fn allocate(&self, size: usize) -> Result<BufferHandle, AllocError>;

    /// Returns storage to the provider.
    fn release(&self, handle: BufferHandle);
}

#[derive(Debug)]
struct PoolState {
    free: Vec<BufferHandle>,
    minted: usize,
    in_use: usize,
}

/// Bounded pool of fixed-size buffers.
///
/// # Thread Safety
///
/// The free list sits behind a single mutex held only for a push or pop.
#[derive(Debug)]
pub struct PooledBufferProvider {
    buffer_size: usize,
    capacity: usize,
    state: Mutex<PoolState>,
    allocations: AtomicU64,
    releases: AtomicU64,
}

impl PooledBufferProvider {
    /// Creates a pool of at most `capacity` buffers of `buffer_size` bytes.
    #[must_use]
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        Self {
            buffer_size,
            capacity,
            state: Mutex::new(PoolState {
                free: Vec::with_capacity(capacity),
                minted: 0,
                in_use: 0,
            }),
            allocations: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    /// Returns the size of every buffer.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Returns the maximum number of buffers.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of buffers currently handed out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    /// Returns the number of bytes currently handed out.
    #[must_use]
    pub fn bytes_in_use(&self) -> usize {
        self.in_use() * self.buffer_size
    }

    /// Returns the number of buffers that can still be handed out.
    #[must_use]
    pub fn available(&self) -> usize {
        self.capacity - self.in_use()
    }

    /// Returns total successful allocations.
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Returns total releases.
    #[must_use]
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }
}

impl BufferProvider for PooledBufferProvider {
    fn allocate(&self, size: usize) -> Result<BufferHandle, AllocError> {
        if size > self.buffer_size {
            return Err(AllocError::TooLarge {
                requested: size,
                buffer_size: self.buffer_size,
            });
        }
        let mut state = self.state.lock();
        let handle = if let Some(handle) = state.free.pop() {
            handle
        } else if state.minted < self.capacity {
            state.minted += 1;
            BufferHandle::new(state.minted as u64, self.buffer_size)
        } else {
            return Err(AllocError::Exhausted {
                capacity: self.capacity,
            });
        };
        state.in_use += 1;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn release(&self, handle: BufferHandle) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        state.free.push(handle);
        self.releases.fetch_add(1, Ordering::Relaxed);
    }
}
