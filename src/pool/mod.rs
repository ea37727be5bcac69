//! First-fit, address-ordered, coalescing pool allocator.
//!
//! The pool manages one or more disjoint memory arenas registered at runtime
//! with [`Pool::init`]. All free blocks of all arenas form a single singly
//! linked list sorted by address. Every arena ends with a zero-size sentinel
//! node whose `next` links to the first node of the following arena, so the
//! list never coalesces across arena boundaries.
//!
//! ```text
//! arena 0                              arena 1
//! [Free|..........][Alloc|....][S] --> [Free|.................][S] --> null
//!   \____________________________/       \_______________________/
//! ```
//!
//! Every block starts with an explicit `Block` header `{ next, size, tag }`.
//! `size` includes the header. Allocated blocks are unlinked, tagged
//! [`BlockState::Allocated`] and carry a null `next`; that pair is the only
//! guard `free` has against foreign or stale pointers, which are ignored.
//!
//! [`Pool`] itself is single threaded. Share it through [`LockedPool`], which
//! serialises every operation inside one critical section and can serve as a
//! `#[global_allocator]`. A locked pool holds its diagnostics back and logs
//! them after the lock is released, so a logger may allocate from it.

mod global;

pub use global::LockedPool;

use core::ptr::{self, NonNull};

use heapless::Vec;

use crate::consts::MAX_ARENAS;

const TAG_FREE: usize = 0x4652_4545;
const TAG_ALLOCATED: usize = 0x414C_4C43;
const TAG_SENTINEL: usize = 0x454E_4421;

/// Alignment of every block and of every returned pointer.
pub const ALIGN: usize = align_of::<Block>();

/// Size of the per-block header, rounded up to [`ALIGN`].
pub const HEADER: usize = align_up(size_of::<Block>());

const fn align_up(value: usize) -> usize {
    (value + ALIGN - 1) & !(ALIGN - 1)
}

const fn align_down(value: usize) -> usize {
    value & !(ALIGN - 1)
}

/// State of a block, decoded from its header tag.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum BlockState {
    /// Linked in the free list.
    Free,
    /// Handed out by [`Pool::allocate`].
    Allocated,
    /// Zero-size end-of-arena marker.
    Sentinel,
}

impl BlockState {
    /// Decodes a raw header tag. Unknown words yield `None`.
    pub const fn from_tag(tag: usize) -> Option<Self> {
        match tag {
            TAG_FREE => Some(Self::Free),
            TAG_ALLOCATED => Some(Self::Allocated),
            TAG_SENTINEL => Some(Self::Sentinel),
            _ => None,
        }
    }

    const fn tag(self) -> usize {
        match self {
            Self::Free => TAG_FREE,
            Self::Allocated => TAG_ALLOCATED,
            Self::Sentinel => TAG_SENTINEL,
        }
    }
}

/// Diagnostic raised by a pool operation.
#[derive(Clone, Copy, Debug)]
enum Note {
    TooSmall(usize),
    Overlaps(usize),
    ArenasFull,
    Registered(usize),
    Exceeds(usize),
    NoFit(usize),
    ForeignFree(usize),
}

impl Note {
    fn log(self) {
        match self {
            Self::TooSmall(n) => warn!("pool region of {} bytes is too small", n),
            Self::Overlaps(addr) => warn!("pool region {} overlaps a registered arena", addr),
            Self::ArenasFull => warn!("pool already holds {} arenas", MAX_ARENAS),
            Self::Registered(n) => debug!("pool arena of {} bytes registered", n),
            Self::Exceeds(n) => trace!("pool request of {} bytes exceeds free bytes", n),
            Self::NoFit(n) => trace!("no free block for {} bytes", n),
            Self::ForeignFree(addr) => warn!("ignoring free of {}", addr),
        }
    }
}

/// Header placed in front of every block.
#[repr(C)]
#[derive(Debug)]
struct Block {
    next: *mut Block,
    size: usize,
    tag: usize,
}

impl Block {
    fn state(&self) -> Option<BlockState> {
        BlockState::from_tag(self.tag)
    }

    fn is(&self, state: BlockState) -> bool {
        self.tag == state.tag()
    }
}

#[derive(Clone, Copy, Debug)]
struct Arena {
    start: usize,
    /// Address of the arena's sentinel.
    sentinel: usize,
}

impl Arena {
    fn holds_header(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.sentinel
    }

    fn holds(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.sentinel + HEADER
    }
}

/// Snapshot of the pool's bookkeeping.
///
/// Block sizes are payload sizes, the header excluded. Sentinels are not
/// counted as free blocks.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct PoolStats {
    /// Tracked free bytes, headers of free blocks included.
    pub free_bytes: usize,
    /// Payload of the largest free block.
    pub largest_free: usize,
    /// Payload of the smallest free block.
    pub smallest_free: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Total bytes of all registered arenas.
    pub pool_bytes: usize,
    /// Number of registered arenas.
    pub arenas: usize,
    /// Successful allocations since creation.
    pub allocations: usize,
    /// Successful frees since creation.
    pub frees: usize,
}

/// The allocator state.
#[derive(Debug)]
pub struct Pool {
    head: *mut Block,
    arenas: Vec<Arena, MAX_ARENAS>,
    pool_size: usize,
    free_size: usize,
    allocations: usize,
    frees: usize,
    /// Keep notes in `pending` instead of logging them.
    deferred: bool,
    pending: Option<Note>,
}

// The raw pointers only ever refer to arena memory handed over in `init`.
unsafe impl Send for Pool {}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    /// Creates an empty pool; every allocation fails until [`init`](Self::init).
    pub const fn new() -> Self {
        Self::with_deferral(false)
    }

    /// An empty pool whose notes wait in [`take_note`](Self::take_note).
    const fn deferred() -> Self {
        Self::with_deferral(true)
    }

    const fn with_deferral(deferred: bool) -> Self {
        Self {
            head: ptr::null_mut(),
            arenas: Vec::new(),
            pool_size: 0,
            free_size: 0,
            allocations: 0,
            frees: 0,
            deferred,
            pending: None,
        }
    }

    fn raise(&mut self, note: Note) {
        if self.deferred {
            self.pending = Some(note);
        } else {
            note.log();
        }
    }

    fn take_note(&mut self) -> Option<Note> {
        self.pending.take()
    }

    /// Registers the memory between `start` and `end` as a new arena.
    ///
    /// `start` is aligned up and `end` down to [`ALIGN`]. Returns `false`, and
    /// leaves the pool untouched, when the aligned span is not larger than two
    /// headers, overlaps an arena already registered, or when [`MAX_ARENAS`]
    /// arenas exist.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes, must outlive the pool
    /// and must not be used by anything else afterwards.
    pub unsafe fn init(&mut self, start: *mut u8, end: *mut u8) -> bool {
        let lo = align_up(start.addr());
        let hi = align_down(end.addr());
        if hi <= lo || hi - lo <= 2 * HEADER {
            self.raise(Note::TooSmall(hi.saturating_sub(lo)));
            return false;
        }
        if self.arenas.iter().any(|a| a.start < hi && lo < a.sentinel + HEADER) {
            self.raise(Note::Overlaps(lo));
            return false;
        }
        let span = hi - lo;
        let arena = Arena {
            start: lo,
            sentinel: hi - HEADER,
        };
        if self.arenas.push(arena).is_err() {
            self.raise(Note::ArenasFull);
            return false;
        }

        // Derive both headers from `start` to keep its provenance.
        let first = unsafe { start.add(lo - start.addr()) }.cast::<Block>();
        let sentinel = unsafe { first.cast::<u8>().add(span - HEADER) }.cast::<Block>();

        // The node preceding the new arena is the sentinel of the closest
        // arena below it, if any.
        let mut prev: *mut Block = ptr::null_mut();
        let mut next = self.head;
        while !next.is_null() && next.addr() < lo {
            prev = next;
            next = unsafe { (*next).next };
        }

        unsafe {
            sentinel.write(Block {
                next,
                size: 0,
                tag: TAG_SENTINEL,
            });
            first.write(Block {
                next: sentinel,
                size: span - HEADER,
                tag: TAG_FREE,
            });
            self.link(prev, first);
        }

        self.pool_size += span;
        self.free_size += span - HEADER;
        self.raise(Note::Registered(span));
        true
    }

    /// Points `prev.next` (or the list head) at `node`.
    unsafe fn link(&mut self, prev: *mut Block, node: *mut Block) {
        if prev.is_null() {
            self.head = node;
        } else {
            unsafe { (*prev).next = node };
        }
    }

    /// Allocates `n` bytes aligned to [`ALIGN`].
    ///
    /// Returns `None` for `n == 0`, an uninitialised pool, a size that
    /// overflows once rounded, or when no free block is large enough.
    pub fn allocate(&mut self, n: usize) -> Option<NonNull<u8>> {
        if n == 0 || self.head.is_null() {
            return None;
        }
        let size = n.checked_add(HEADER + ALIGN - 1)? & !(ALIGN - 1);
        if size > self.free_size {
            self.raise(Note::Exceeds(n));
            return None;
        }

        let mut prev: *mut Block = ptr::null_mut();
        let mut node = self.head;
        unsafe {
            while !node.is_null() && !((*node).is(BlockState::Free) && (*node).size >= size) {
                prev = node;
                node = (*node).next;
            }
            if node.is_null() {
                self.raise(Note::NoFit(n));
                return None;
            }

            let block_size = (*node).size;
            let successor = if block_size - size > 2 * HEADER {
                let rest = node.cast::<u8>().add(size).cast::<Block>();
                rest.write(Block {
                    next: (*node).next,
                    size: block_size - size,
                    tag: TAG_FREE,
                });
                (*node).size = size;
                rest
            } else {
                (*node).next
            };
            self.link(prev, successor);

            (*node).next = ptr::null_mut();
            (*node).tag = TAG_ALLOCATED;
            self.free_size -= (*node).size;
            self.allocations += 1;
            Some(NonNull::new_unchecked(node.cast::<u8>().add(HEADER)))
        }
    }

    /// Allocates a zero-filled block for `count` items of `size` bytes.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        let ptr = self.allocate(total)?;
        unsafe { ptr.as_ptr().write_bytes(0, total) };
        Some(ptr)
    }

    /// Header of the live allocation at `ptr`, if it is one.
    fn allocated_header(&self, ptr: NonNull<u8>) -> Option<*mut Block> {
        let addr = ptr.as_ptr().addr();
        if addr % ALIGN != 0 {
            return None;
        }
        let header = addr.checked_sub(HEADER)?;
        if !self.arenas.iter().any(|a| a.holds_header(header)) {
            return None;
        }
        let block = ptr.as_ptr().wrapping_sub(HEADER).cast::<Block>();
        let valid = unsafe { (*block).is(BlockState::Allocated) && (*block).next.is_null() };
        valid.then_some(block)
    }

    /// Usable bytes of the allocation at `ptr`, `None` if `ptr` is not one.
    pub fn capacity(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.allocated_header(ptr)
            .map(|block| unsafe { (*block).size } - HEADER)
    }

    /// Whether `ptr` points into one of the registered arenas.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr.addr();
        self.arenas.iter().any(|a| a.holds(addr))
    }

    /// Returns the block at `ptr` to the pool.
    ///
    /// Pointers outside every arena, misaligned pointers and blocks that are
    /// not currently allocated are ignored, so a second free of the same
    /// pointer is a no-op.
    ///
    /// # Safety
    ///
    /// If `ptr` lies inside an arena it must have been returned by this pool
    /// and must not be used after this call.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let Some(block) = self.allocated_header(ptr) else {
            self.raise(Note::ForeignFree(ptr.as_ptr().addr()));
            return;
        };
        unsafe {
            (*block).tag = TAG_FREE;
            self.free_size += (*block).size;
            self.insert(block);
        }
        self.frees += 1;
    }

    /// Links a free block back in address order, merging it with free
    /// neighbours it touches.
    unsafe fn insert(&mut self, block: *mut Block) {
        let mut prev: *mut Block = ptr::null_mut();
        let mut next = self.head;
        unsafe {
            while !next.is_null() && next.addr() < block.addr() {
                prev = next;
                next = (*next).next;
            }

            let mut node = block;
            if !prev.is_null()
                && (*prev).is(BlockState::Free)
                && prev.addr() + (*prev).size == block.addr()
            {
                (*prev).size += (*block).size;
                node = prev;
            } else {
                self.link(prev, block);
            }

            if !next.is_null()
                && (*next).is(BlockState::Free)
                && node.addr() + (*node).size == next.addr()
            {
                (*node).size += (*next).size;
                (*node).next = (*next).next;
            } else {
                (*node).next = next;
            }
        }
    }

    /// Resizes an allocation.
    ///
    /// `None` behaves like [`allocate`](Self::allocate). A block that is
    /// already large enough is returned unchanged. Otherwise the contents are
    /// moved to a new block and the old one is freed. On failure `None` is
    /// returned and the old block is left as it was.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free) for `ptr`.
    pub unsafe fn reallocate(&mut self, ptr: Option<NonNull<u8>>, n: usize) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.allocate(n);
        };
        let capacity = self.capacity(ptr)?;
        if capacity >= n {
            return Some(ptr);
        }
        let moved = self.allocate(n)?;
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), capacity);
            self.free(ptr);
        }
        Some(moved)
    }

    /// Walks the free list and reports its shape.
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            free_bytes: self.free_size,
            pool_bytes: self.pool_size,
            arenas: self.arenas.len(),
            allocations: self.allocations,
            frees: self.frees,
            smallest_free: usize::MAX,
            ..PoolStats::default()
        };
        let mut node = self.head;
        while let Some(block) = unsafe { node.as_ref() } {
            if block.state() == Some(BlockState::Free) {
                let payload = block.size - HEADER;
                stats.free_blocks += 1;
                stats.largest_free = stats.largest_free.max(payload);
                stats.smallest_free = stats.smallest_free.min(payload);
            }
            node = block.next;
        }
        if stats.free_blocks == 0 {
            stats.smallest_free = 0;
        }
        stats
    }
}
