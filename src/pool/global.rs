use core::alloc::{GlobalAlloc, Layout};
use core::cell::{Cell, RefCell};
use core::fmt;
use core::ptr::{self, NonNull};

use critical_section::Mutex;

use super::{ALIGN, Note, Pool, PoolStats};

/// A [`Pool`] shared between threads and interrupt handlers.
///
/// Every operation runs inside a single `critical_section::with`, so no
/// caller ever observes a half-spliced free list. Diagnostics are logged after
/// the critical section ends; one raised while another is being logged is
/// discarded. Usable as a `static`:
///
/// ```rust
/// use hupacket::pool::LockedPool;
///
/// static POOL: LockedPool = LockedPool::new();
///
/// let arena: &'static mut [usize] = Box::leak(vec![0usize; 256].into_boxed_slice());
/// let range = arena.as_mut_ptr_range();
/// assert!(unsafe { POOL.init(range.start.cast(), range.end.cast()) });
///
/// let ptr = POOL.allocate(100).unwrap();
/// assert!(POOL.contains(ptr.as_ptr()));
/// unsafe { POOL.free(ptr) };
/// assert_eq!(POOL.stats().allocations, POOL.stats().frees);
/// ```
pub struct LockedPool {
    inner: Mutex<RefCell<Pool>>,
    reporting: Mutex<Cell<bool>>,
}

impl fmt::Debug for LockedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for LockedPool {
    fn default() -> Self {
        Self::new()
    }
}

impl LockedPool {
    /// Creates an empty pool.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Pool::deferred())),
            reporting: Mutex::new(Cell::new(false)),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Pool) -> R) -> R {
        let (result, note) = critical_section::with(|cs| {
            let mut pool = self.inner.borrow_ref_mut(cs);
            let result = f(&mut pool);
            (result, pool.take_note())
        });
        if let Some(note) = note {
            self.report(note);
        }
        result
    }

    /// Logs `note` unless this pool is already logging, as it is when the
    /// logger itself allocates from the pool.
    fn report(&self, note: Note) {
        let busy = critical_section::with(|cs| self.reporting.borrow(cs).replace(true));
        if !busy {
            note.log();
            critical_section::with(|cs| self.reporting.borrow(cs).set(false));
        }
    }

    /// See [`Pool::init`].
    ///
    /// # Safety
    ///
    /// Same contract as [`Pool::init`].
    pub unsafe fn init(&self, start: *mut u8, end: *mut u8) -> bool {
        self.with(|pool| unsafe { pool.init(start, end) })
    }

    /// See [`Pool::allocate`].
    pub fn allocate(&self, n: usize) -> Option<NonNull<u8>> {
        self.with(|pool| pool.allocate(n))
    }

    /// See [`Pool::allocate_zeroed`].
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        self.with(|pool| pool.allocate_zeroed(count, size))
    }

    /// See [`Pool::free`].
    ///
    /// # Safety
    ///
    /// Same contract as [`Pool::free`].
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        self.with(|pool| unsafe { pool.free(ptr) })
    }

    /// See [`Pool::reallocate`].
    ///
    /// # Safety
    ///
    /// Same contract as [`Pool::reallocate`].
    pub unsafe fn reallocate(&self, ptr: Option<NonNull<u8>>, n: usize) -> Option<NonNull<u8>> {
        self.with(|pool| unsafe { pool.reallocate(ptr, n) })
    }

    /// See [`Pool::capacity`].
    pub fn capacity(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.with(|pool| pool.capacity(ptr))
    }

    /// See [`Pool::contains`].
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.with(|pool| pool.contains(ptr))
    }

    /// See [`Pool::stats`].
    pub fn stats(&self) -> PoolStats {
        self.with(|pool| pool.stats())
    }
}

unsafe impl GlobalAlloc for LockedPool {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return ptr::null_mut();
        }
        self.allocate(layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return ptr::null_mut();
        }
        self.allocate_zeroed(1, layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { self.free(ptr) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGN {
            return ptr::null_mut();
        }
        unsafe { self.reallocate(NonNull::new(ptr), new_size) }
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}
