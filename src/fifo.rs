use std::alloc::{self, Layout};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Maximum supported depth in items.
///
/// The cursors live in an extended index space of size `2 * depth` carved out
/// of the 16-bit range, so the depth must fit in 15 bits.
pub const MAX_DEPTH: u16 = 32767;

/// External mutual-exclusion capability.
///
/// The FIFO never blocks on its own; when a mutex pair is supplied via
/// [`Fifo::set_mutexes`] it is acquired around mutation paths only. `acquire`
/// is expected to have wait-forever semantics.
pub trait FifoMutex: Send + Sync {
    /// Take the mutex, waiting as long as necessary.
    fn acquire(&self);
    /// Release the mutex.
    fn release(&self);
}

/// Errors reported by [`Fifo::new`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Requested depth does not fit in the 15-bit index space.
    #[error("depth {0} exceeds the maximum of 32767 items")]
    DepthTooLarge(u16),
    /// Item size of zero is rejected; a FIFO of empty items stores nothing.
    #[error("item size must be at least one byte")]
    ZeroItemSize,
    /// The backing allocation failed.
    #[error("allocation of {0} bytes for the backing store failed")]
    AllocFailed(usize),
}

/// A contiguous readable run inside the backing store.
///
/// Returned by [`Fifo::linear_read_info`]. `len` is in items; when it is zero
/// the pointer is null and must not be used. The pointer is only valid until
/// the next mutating call on the FIFO.
#[derive(Debug, Clone, Copy)]
pub struct ReadRegion {
    /// Start of the linear run.
    pub ptr: *const u8,
    /// Length of the run in items.
    pub len: u16,
}

/// A contiguous writable run inside the backing store.
///
/// Returned by [`Fifo::linear_write_info`]. Same validity rules as
/// [`ReadRegion`].
#[derive(Debug, Clone, Copy)]
pub struct WriteRegion {
    /// Start of the linear run.
    pub ptr: *mut u8,
    /// Length of the run in items.
    pub len: u16,
}

/// Unchecked cursor control for DMA completion handlers.
///
/// Obtained from [`Fifo::dma_cursors`]. These moves perform no bounds or
/// occupancy checks: they are only correct when the DMA handler is the sole
/// owner of the cursor it moves and no software API call touches the same
/// cursor concurrently. Moving a cursor past the other one by more than
/// `depth` items counts as one overflow; a second overflow before a
/// correction leaves the FIFO in an unrecoverable state.
#[derive(Debug, Clone, Copy)]
pub struct DmaCursors<'a> {
    fifo: &'a Fifo,
}

impl DmaCursors<'_> {
    /// Move the write cursor forward by `n` items.
    pub fn advance_write(&self, n: u16) {
        let f = self.fifo;
        let w = f.wr_idx.load(Ordering::Acquire);
        f.wr_idx.store(f.advance_index(w, n), Ordering::Release);
    }

    /// Move the read cursor forward by `n` items.
    pub fn advance_read(&self, n: u16) {
        let f = self.fifo;
        let r = f.rd_idx.load(Ordering::Acquire);
        f.rd_idx.store(f.advance_index(r, n), Ordering::Release);
    }

    /// Move the write cursor backward by `n` items.
    pub fn backward_write(&self, n: u16) {
        let f = self.fifo;
        let w = f.wr_idx.load(Ordering::Acquire);
        f.wr_idx.store(f.backward_index(w, n), Ordering::Release);
    }

    /// Move the read cursor backward by `n` items.
    pub fn backward_read(&self, n: u16) {
        let f = self.fifo;
        let r = f.rd_idx.load(Ordering::Acquire);
        f.rd_idx.store(f.backward_index(r, n), Ordering::Release);
    }
}

/// Releases the optional mutex on drop, so early returns cannot leak a lock.
struct LockGuard<'a>(Option<&'a dyn FifoMutex>);

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(m) = self.0 {
            m.release();
        }
    }
}

fn lock(mutex: &Option<Arc<dyn FifoMutex>>) -> LockGuard<'_> {
    match mutex {
        Some(m) => {
            m.acquire();
            LockGuard(Some(&**m))
        }
        None => LockGuard(None),
    }
}

/// Item source for the write path.
enum Source<'a> {
    /// Ordinary increasing-address copy.
    Slice(&'a [u8]),
    /// Constant-address hardware FIFO register, read word by word.
    Register(*const u32),
}

/// Item sink for the read path.
enum Sink<'a> {
    Slice(&'a mut [u8]),
    Register(*mut u32),
}

/// Read `len` bytes from a constant register address into `dst`.
///
/// Full words first, then one extra word for a 1-3 byte remainder, matching
/// how memory-mapped USB FIFOs on e.g. STM32 parts are drained.
///
/// # Safety
/// `reg` must be valid for volatile reads and `dst` for `len` bytes of
/// writes. `dst` may be unaligned.
unsafe fn copy_from_const_addr(mut dst: *mut u8, reg: *const u32, len: usize) {
    let mut full_words = len >> 2;
    while full_words > 0 {
        let word = ptr::read_volatile(reg).to_ne_bytes();
        ptr::copy_nonoverlapping(word.as_ptr(), dst, 4);
        dst = dst.add(4);
        full_words -= 1;
    }

    let rem = len & 0x03;
    if rem != 0 {
        let word = ptr::read_volatile(reg).to_ne_bytes();
        ptr::copy_nonoverlapping(word.as_ptr(), dst, rem);
    }
}

/// Write `len` bytes from `src` to a constant register address.
///
/// A 1-3 byte remainder is zero-padded into a final full word.
///
/// # Safety
/// `reg` must be valid for volatile writes and `src` for `len` bytes of
/// reads. `src` may be unaligned.
unsafe fn copy_to_const_addr(reg: *mut u32, mut src: *const u8, len: usize) {
    let mut full_words = len >> 2;
    while full_words > 0 {
        let word = ptr::read_unaligned(src as *const u32);
        ptr::write_volatile(reg, word);
        src = src.add(4);
        full_words -= 1;
    }

    let rem = len & 0x03;
    if rem != 0 {
        let mut bytes = [0u8; 4];
        ptr::copy_nonoverlapping(src, bytes.as_mut_ptr(), rem);
        ptr::write_volatile(reg, u32::from_ne_bytes(bytes));
    }
}

/// Fixed-capacity ring FIFO with overwrite mode, constant-address copy
/// variants for hardware FIFO registers, and zero-copy linear regions for
/// DMA engines.
///
/// One writer role and one reader role at a time. The cursors are absolute
/// indices in an extended space of size `2 * depth`; the remaining
/// `65536 - 2 * depth` values are unused index space that the arithmetic
/// jumps across, so the hot path needs no division. The price is that the
/// depth is capped at 2^15 - 1 items and that an index overflow caused by an
/// unsupervised DMA writer is only recoverable if it happens once between
/// corrections.
pub struct Fifo {
    /// Backing store, `depth * item_size` bytes. Null when the capacity is
    /// zero; all paths that dereference it are guarded by occupancy checks.
    buffer: *mut u8,
    depth: u16,
    item_size: u16,
    overwritable: AtomicBool,
    /// Absolute write cursor in the extended index space.
    wr_idx: AtomicU16,
    /// Absolute read cursor in the extended index space.
    rd_idx: AtomicU16,
    /// `2 * depth - 1`; largest valid extended index.
    max_index: u16,
    /// `0xFFFF - max_index`; jumped over on cursor wrap.
    unused_space: u16,
    mutex_wr: Option<Arc<dyn FifoMutex>>,
    mutex_rd: Option<Arc<dyn FifoMutex>>,
}

// Safety: the buffer pointer is exclusively interpreted through the cursor
// arithmetic; cross-context use is governed by the documented locking
// discipline, exactly like sharing the raw storage behind atomics.
unsafe impl Send for Fifo {}
unsafe impl Sync for Fifo {}

impl std::fmt::Debug for Fifo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fifo")
            .field("depth", &self.depth)
            .field("item_size", &self.item_size)
            .field("overwritable", &self.overwritable)
            .field("wr_idx", &self.wr_idx)
            .field("rd_idx", &self.rd_idx)
            .field("max_index", &self.max_index)
            .field("unused_space", &self.unused_space)
            .finish()
    }
}

impl Drop for Fifo {
    fn drop(&mut self) {
        if !self.buffer.is_null() {
            // Safety: matches the allocation in `new`.
            unsafe {
                let layout = Layout::from_size_align_unchecked(self.capacity_bytes(), 1);
                alloc::dealloc(self.buffer, layout);
            }
        }
    }
}

impl Fifo {
    /// Create a FIFO holding `depth` items of `item_size` bytes each.
    ///
    /// # Arguments
    /// * `depth` - Capacity in items, at most [`MAX_DEPTH`]. Zero is allowed
    ///   and yields a FIFO on which every operation reports empty/full.
    /// * `item_size` - Bytes per item, at least 1.
    /// * `overwritable` - When set, writes to a full FIFO overwrite the
    ///   oldest data instead of failing.
    pub fn new(depth: u16, item_size: u16, overwritable: bool) -> Result<Self, ConfigError> {
        if depth > MAX_DEPTH {
            return Err(ConfigError::DepthTooLarge(depth));
        }
        if item_size == 0 {
            return Err(ConfigError::ZeroItemSize);
        }

        let capacity = usize::from(depth) * usize::from(item_size);
        let buffer = if capacity == 0 {
            ptr::null_mut()
        } else {
            // Safety: capacity is non-zero and alignment 1 is always valid.
            let ptr = unsafe {
                alloc::alloc_zeroed(Layout::from_size_align_unchecked(capacity, 1))
            };
            if ptr.is_null() {
                return Err(ConfigError::AllocFailed(capacity));
            }
            ptr
        };

        // depth 0 wraps to 0xFFFF on purpose: the whole 16-bit range becomes
        // unused and the compensation below degenerates to a no-op.
        let max_index = depth.wrapping_mul(2).wrapping_sub(1);

        Ok(Fifo {
            buffer,
            depth,
            item_size,
            overwritable: AtomicBool::new(overwritable),
            wr_idx: AtomicU16::new(0),
            rd_idx: AtomicU16::new(0),
            max_index,
            unused_space: u16::MAX - max_index,
            mutex_wr: None,
            mutex_rd: None,
        })
    }

    /// Install the external mutex pair, one for the write role and one for
    /// the read role. Call before the FIFO is shared across contexts; with
    /// `None` the caller guarantees mutual exclusion by construction.
    pub fn set_mutexes(
        &mut self,
        write: Option<Arc<dyn FifoMutex>>,
        read: Option<Arc<dyn FifoMutex>>,
    ) {
        self.mutex_wr = write;
        self.mutex_rd = read;
    }

    /// Capacity in items.
    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// Bytes per item.
    pub fn item_size(&self) -> u16 {
        self.item_size
    }

    /// Whether writes to a full FIFO overwrite the oldest data.
    pub fn is_overwritable(&self) -> bool {
        self.overwritable.load(Ordering::Relaxed)
    }

    fn capacity_bytes(&self) -> usize {
        usize::from(self.depth) * usize::from(self.item_size)
    }

    // ---- index arithmetic -------------------------------------------------
    //
    // The cursors are absolute indices in [0, 2*depth). Widening to 32 bits
    // makes the "would leave the valid range" test explicit instead of
    // relying on 16-bit wraparound; jumping by `unused_space` lands the
    // result back on the value a true mod-2*depth reduction would give.

    fn advance_index(&self, p: u16, offset: u16) -> u16 {
        let sum = u32::from(p) + u32::from(offset);
        if sum > u32::from(self.max_index) {
            ((sum + u32::from(self.unused_space)) & 0xFFFF) as u16
        } else {
            sum as u16
        }
    }

    fn backward_index(&self, p: u16, offset: u16) -> u16 {
        let diff = i32::from(p) - i32::from(offset);
        if diff < 0 || diff > i32::from(self.max_index) {
            ((diff - i32::from(self.unused_space)) & 0xFFFF) as u16
        } else {
            diff as u16
        }
    }

    /// Reduce an absolute cursor (advanced by `offset`) to a buffer index in
    /// `[0, depth)`. Callers must ensure `depth > 0`.
    fn relative_index(&self, p: u16, offset: u16) -> u16 {
        let idx = self.advance_index(p, offset);
        // Extended indices are < 2*depth, one conditional subtraction is a
        // full modulo.
        if idx >= self.depth {
            idx - self.depth
        } else {
            idx
        }
    }

    /// Item count from a snapshot of both cursors. Values above `depth`
    /// signal that one overflow cycle has occurred.
    fn count_abs(&self, w: u16, r: u16) -> u16 {
        let mut cnt = w.wrapping_sub(r);
        if r > w {
            cnt = cnt.wrapping_sub(self.unused_space);
        }
        cnt
    }

    fn remaining_abs(&self, w: u16, r: u16) -> u16 {
        self.depth.saturating_sub(self.count_abs(w, r))
    }

    /// Snap the read cursor to exactly `depth` items behind the write
    /// cursor, discarding the overrun. One-shot: valid only while a single
    /// overflow cycle has occurred.
    fn correct_read_index(&self, w: u16) {
        self.rd_idx
            .store(self.backward_index(w, self.depth), Ordering::Release);
    }

    // ---- raw copies -------------------------------------------------------

    /// Copy `n` items from the head of `data` into the buffer at relative
    /// index `w_rel`, splitting at the physical end of the array.
    ///
    /// # Safety
    /// `w_rel < depth`, `n <= depth`, and `data` holds at least
    /// `n * item_size` bytes.
    unsafe fn push_n(&self, data: &[u8], n: u16, w_rel: u16) {
        let isz = usize::from(self.item_size);
        let n = usize::from(n);
        debug_assert!(data.len() >= n * isz);

        let lin = usize::from(self.depth - w_rel).min(n);
        ptr::copy_nonoverlapping(
            data.as_ptr(),
            self.buffer.add(usize::from(w_rel) * isz),
            lin * isz,
        );
        if n > lin {
            ptr::copy_nonoverlapping(data.as_ptr().add(lin * isz), self.buffer, (n - lin) * isz);
        }
    }

    /// Copy `n` items out of the buffer from relative index `r_rel` into
    /// `out`, splitting at the physical end of the array.
    ///
    /// # Safety
    /// `r_rel < depth`, `n <= depth`, and `out` holds at least
    /// `n * item_size` bytes.
    unsafe fn pull_n(&self, out: &mut [u8], n: u16, r_rel: u16) {
        let isz = usize::from(self.item_size);
        let n = usize::from(n);
        debug_assert!(out.len() >= n * isz);

        let src = self.buffer.add(usize::from(r_rel) * isz);
        let lin = usize::from(self.depth - r_rel).min(n);
        ptr::copy_nonoverlapping(src, out.as_mut_ptr(), lin * isz);
        if n > lin {
            ptr::copy_nonoverlapping(self.buffer, out.as_mut_ptr().add(lin * isz), (n - lin) * isz);
        }
    }

    /// Fill `n` items at relative index `w_rel` from a constant register
    /// address. The word fetched when the linear run ends on a 1-3 byte
    /// remainder straddles the wrap boundary and is split across it.
    ///
    /// # Safety
    /// Same bounds as [`Fifo::push_n`]; `reg` must be valid for volatile
    /// reads.
    unsafe fn push_n_from_reg(&self, reg: *const u32, n: u16, w_rel: u16) {
        let isz = usize::from(self.item_size);
        let lin_items = usize::from(self.depth - w_rel);
        let total_bytes = usize::from(n) * isz;
        let dst = self.buffer.add(usize::from(w_rel) * isz);

        if usize::from(n) <= lin_items {
            copy_from_const_addr(dst, reg, total_bytes);
            return;
        }

        let lin_bytes = lin_items * isz;
        let mut wrap_bytes = total_bytes - lin_bytes;

        let mut dst = dst;
        let mut full_words = lin_bytes >> 2;
        while full_words > 0 {
            let word = ptr::read_volatile(reg).to_ne_bytes();
            ptr::copy_nonoverlapping(word.as_ptr(), dst, 4);
            dst = dst.add(4);
            full_words -= 1;
        }

        let rem = lin_bytes & 0x03;
        let mut start = self.buffer;
        if rem > 0 {
            // One register word covers the last bytes before the wrap and
            // the first bytes after it.
            let spill = wrap_bytes.min(4 - rem);
            wrap_bytes -= spill;
            let word = ptr::read_volatile(reg).to_ne_bytes();
            ptr::copy_nonoverlapping(word.as_ptr(), dst, rem);
            ptr::copy_nonoverlapping(word.as_ptr().add(rem), self.buffer, spill);
            start = self.buffer.add(spill);
        }

        if wrap_bytes > 0 {
            copy_from_const_addr(start, reg, wrap_bytes);
        }
    }

    /// Drain `n` items from relative index `r_rel` to a constant register
    /// address, re-assembling the word that straddles the wrap boundary.
    ///
    /// # Safety
    /// Same bounds as [`Fifo::pull_n`]; `reg` must be valid for volatile
    /// writes.
    unsafe fn pull_n_to_reg(&self, reg: *mut u32, n: u16, r_rel: u16) {
        let isz = usize::from(self.item_size);
        let lin_items = usize::from(self.depth - r_rel);
        let total_bytes = usize::from(n) * isz;
        let mut src = self.buffer.add(usize::from(r_rel) * isz);

        if usize::from(n) <= lin_items {
            copy_to_const_addr(reg, src, total_bytes);
            return;
        }

        let lin_bytes = lin_items * isz;
        let mut wrap_bytes = total_bytes - lin_bytes;

        // Full words of the linear run; the odd 1-3 bytes are merged with
        // the first bytes of the wrapped part below.
        let lin_word_bytes = lin_bytes & !0x03;
        copy_to_const_addr(reg, src, lin_word_bytes);
        src = src.add(lin_word_bytes);

        let rem = lin_bytes & 0x03;
        if rem > 0 {
            let spill = wrap_bytes.min(4 - rem);
            wrap_bytes -= spill;
            let mut bytes = [0u8; 4];
            ptr::copy_nonoverlapping(src, bytes.as_mut_ptr(), rem);
            ptr::copy_nonoverlapping(self.buffer, bytes.as_mut_ptr().add(rem), spill);
            ptr::write_volatile(reg, u32::from_ne_bytes(bytes));
            src = self.buffer.add(spill);
        } else {
            src = self.buffer;
        }

        if wrap_bytes > 0 {
            copy_to_const_addr(reg, src, wrap_bytes);
        }
    }

    // ---- write path -------------------------------------------------------

    /// Write one item.
    ///
    /// Fails when the FIFO is full and not overwritable. In overwrite mode
    /// the write always succeeds; overwriting a full FIFO pushes the count
    /// past `depth`, which the next read-side call resolves by dropping the
    /// oldest item.
    ///
    /// # Panics
    /// Panics if `item` is shorter than one item.
    pub fn write(&self, item: &[u8]) -> bool {
        assert!(
            item.len() >= usize::from(self.item_size),
            "item of {} bytes is shorter than the configured item size {}",
            item.len(),
            self.item_size
        );
        if self.depth == 0 {
            return false;
        }

        let _wr = lock(&self.mutex_wr);

        let w = self.wr_idx.load(Ordering::Acquire);
        let r = self.rd_idx.load(Ordering::Acquire);
        if self.count_abs(w, r) == self.depth && !self.overwritable.load(Ordering::Relaxed) {
            return false;
        }

        let w_rel = self.relative_index(w, 0);
        // Safety: w_rel < depth, so the destination lies inside the store.
        unsafe {
            ptr::copy_nonoverlapping(
                item.as_ptr(),
                self.buffer.add(usize::from(w_rel) * usize::from(self.item_size)),
                usize::from(self.item_size),
            );
        }
        self.wr_idx.store(self.advance_index(w, 1), Ordering::Release);
        true
    }

    /// Write a block of items with an ordinary increasing-address copy.
    ///
    /// `data` holds `data.len() / item_size` items. When the FIFO is not
    /// overwritable the count is clamped to the free space. In overwrite
    /// mode a block of at least `depth` items keeps only its trailing
    /// `depth` items and is written starting at the current read cursor, so
    /// the read cursor itself is never touched from the write path.
    ///
    /// Returns the number of items actually written.
    pub fn write_n(&self, data: &[u8]) -> u16 {
        debug_assert_eq!(data.len() % usize::from(self.item_size), 0);
        self.write_items(Source::Slice(data), data.len() / usize::from(self.item_size))
    }

    /// Write `n` items sourced from a constant hardware register address,
    /// word by word. Same clamping and overwrite rules as [`Fifo::write_n`].
    ///
    /// # Safety
    /// `reg` must be valid for `n * item_size` bytes worth of volatile word
    /// reads (a memory-mapped receive FIFO register).
    pub unsafe fn write_n_const_addr(&self, reg: *const u32, n: u16) -> u16 {
        self.write_items(Source::Register(reg), usize::from(n))
    }

    fn write_items(&self, src: Source<'_>, total: usize) -> u16 {
        if total == 0 || self.depth == 0 {
            return 0;
        }

        let _wr = lock(&self.mutex_wr);

        let mut w = self.wr_idx.load(Ordering::Acquire);
        let r = self.rd_idx.load(Ordering::Acquire);

        let mut skip = 0usize;
        let n;
        if !self.overwritable.load(Ordering::Relaxed) {
            n = total.min(usize::from(self.remaining_abs(w, r))) as u16;
            if n == 0 {
                return 0;
            }
        } else if total >= usize::from(self.depth) {
            // Keep only the trailing `depth` items and write the full buffer
            // starting at the read cursor's position. Moving the read cursor
            // from the write path would race with concurrent reads.
            skip = total - usize::from(self.depth);
            n = self.depth;
            w = r;
        } else {
            n = total as u16;
        }

        let w_rel = self.relative_index(w, 0);
        // Safety: w_rel < depth and n <= depth keep every copy inside the
        // backing store.
        unsafe {
            match src {
                Source::Slice(data) => {
                    self.push_n(&data[skip * usize::from(self.item_size)..], n, w_rel)
                }
                // A register cannot be skipped into; overlong overwrite
                // blocks drain it from the current word onward.
                Source::Register(reg) => self.push_n_from_reg(reg, n, w_rel),
            }
        }

        self.wr_idx.store(self.advance_index(w, n), Ordering::Release);
        n
    }

    // ---- read path --------------------------------------------------------

    /// Read one item into `out`, advancing the read cursor.
    ///
    /// Corrects a detected overflow before reading. Returns `false` when the
    /// FIFO is empty.
    ///
    /// # Panics
    /// Panics if `out` is shorter than one item.
    pub fn read(&self, out: &mut [u8]) -> bool {
        assert!(
            out.len() >= usize::from(self.item_size),
            "output of {} bytes is shorter than the configured item size {}",
            out.len(),
            self.item_size
        );

        let _rd = lock(&self.mutex_rd);

        let w = self.wr_idx.load(Ordering::Acquire);
        let r = self.rd_idx.load(Ordering::Acquire);
        let found = self.peek_items(0, Sink::Slice(out), 1, w, r) == 1;

        // Re-load: the peek may have corrected the read cursor.
        let r = self.rd_idx.load(Ordering::Acquire);
        self.rd_idx
            .store(self.advance_index(r, u16::from(found)), Ordering::Release);
        found
    }

    /// Read up to `out.len() / item_size` items into `out`, advancing the
    /// read cursor by the amount actually read. Corrects a detected overflow
    /// first. Returns the number of items read.
    pub fn read_n(&self, out: &mut [u8]) -> u16 {
        let total = out.len() / usize::from(self.item_size);
        self.read_items(Sink::Slice(out), total)
    }

    /// Read up to `n` items to a constant hardware register address, word by
    /// word, advancing the read cursor by the amount actually read.
    ///
    /// # Safety
    /// `reg` must be valid for volatile word writes (a memory-mapped
    /// transmit FIFO register).
    pub unsafe fn read_n_const_addr(&self, reg: *mut u32, n: u16) -> u16 {
        self.read_items(Sink::Register(reg), usize::from(n))
    }

    fn read_items(&self, sink: Sink<'_>, total: usize) -> u16 {
        let _rd = lock(&self.mutex_rd);

        let w = self.wr_idx.load(Ordering::Acquire);
        let r = self.rd_idx.load(Ordering::Acquire);
        let n = self.peek_items(0, sink, total, w, r);

        // Re-load: the peek may have corrected the read cursor.
        let r = self.rd_idx.load(Ordering::Acquire);
        self.rd_idx.store(self.advance_index(r, n), Ordering::Release);
        n
    }

    /// Copy one item at offset 0 without consuming it. See
    /// [`Fifo::peek_at`].
    pub fn peek(&self, out: &mut [u8]) -> bool {
        self.peek_at(0, out)
    }

    /// Copy the item `offset` positions past the read cursor into `out`
    /// without consuming anything. Returns `false` when fewer than
    /// `offset + 1` items are stored.
    ///
    /// A detected overflow is corrected as a side effect: peeking must
    /// return sane data after an overrun, which requires snapping the stored
    /// read cursor.
    ///
    /// # Panics
    /// Panics if `out` is shorter than one item.
    pub fn peek_at(&self, offset: u16, out: &mut [u8]) -> bool {
        assert!(
            out.len() >= usize::from(self.item_size),
            "output of {} bytes is shorter than the configured item size {}",
            out.len(),
            self.item_size
        );

        let _rd = lock(&self.mutex_rd);

        let w = self.wr_idx.load(Ordering::Acquire);
        let r = self.rd_idx.load(Ordering::Acquire);
        self.peek_items(offset, Sink::Slice(out), 1, w, r) == 1
    }

    /// Copy up to `out.len() / item_size` items starting `offset` positions
    /// past the read cursor, without consuming anything. Corrects a detected
    /// overflow. Returns the number of items copied.
    pub fn peek_at_n(&self, offset: u16, out: &mut [u8]) -> u16 {
        let total = out.len() / usize::from(self.item_size);

        let _rd = lock(&self.mutex_rd);

        let w = self.wr_idx.load(Ordering::Acquire);
        let r = self.rd_idx.load(Ordering::Acquire);
        self.peek_items(offset, Sink::Slice(out), total, w, r)
    }

    /// Shared bounds/overflow logic for every read-side copy. Works on a
    /// snapshot of both cursors; stores a corrected read cursor when an
    /// overflow is detected. Caller holds the read lock.
    fn peek_items(&self, offset: u16, sink: Sink<'_>, total: usize, w: u16, mut r: u16) -> u16 {
        let mut cnt = self.count_abs(w, r);
        if cnt > self.depth {
            self.correct_read_index(w);
            r = self.rd_idx.load(Ordering::Acquire);
            cnt = self.depth;
        }

        if cnt == 0 || offset >= cnt {
            return 0;
        }

        let n = total.min(usize::from(cnt - offset)) as u16;
        if n == 0 {
            return 0;
        }

        let r_rel = self.relative_index(r, offset);
        // Safety: r_rel < depth and n <= depth keep every copy inside the
        // backing store; slice sinks were sized by their callers.
        unsafe {
            match sink {
                Sink::Slice(out) => self.pull_n(out, n, r_rel),
                Sink::Register(reg) => self.pull_n_to_reg(reg, n, r_rel),
            }
        }
        n
    }

    // ---- linear regions ---------------------------------------------------

    /// Longest contiguous readable run, at most `n` items, starting `offset`
    /// items past the (overflow-corrected) read cursor.
    ///
    /// No cursor is advanced; pair with [`DmaCursors::advance_read`] once
    /// the DMA transfer completes. When the available data wraps around the
    /// physical end of the array the returned run is shorter than `n`; call
    /// again after advancing past it to obtain the wrapped remainder.
    pub fn linear_read_info(&self, offset: u16, n: u16) -> ReadRegion {
        let w = self.wr_idx.load(Ordering::Acquire);
        let mut r = self.rd_idx.load(Ordering::Acquire);

        let mut cnt = self.count_abs(w, r);
        if cnt > self.depth {
            {
                let _rd = lock(&self.mutex_rd);
                self.correct_read_index(w);
            }
            r = self.rd_idx.load(Ordering::Acquire);
            cnt = self.depth;
        }

        if cnt == 0 || offset >= cnt {
            return ReadRegion { ptr: ptr::null(), len: 0 };
        }

        let n = n.min(cnt - offset);
        let w_rel = self.relative_index(w, 0);
        let r_rel = self.relative_index(r, offset);

        // Run ends at the write position or at the physical end of the
        // array, whichever comes first (the latter also covers a full FIFO).
        let len = if w_rel > r_rel {
            w_rel - r_rel
        } else {
            self.depth - r_rel
        };

        ReadRegion {
            // Safety: r_rel < depth, the offset stays inside the store.
            ptr: unsafe {
                self.buffer.add(usize::from(r_rel) * usize::from(self.item_size)) as *const u8
            },
            len: n.min(len),
        }
    }

    /// Longest contiguous writable run, at most `n` items, starting `offset`
    /// items past the write cursor.
    ///
    /// No cursor is advanced; pair with [`DmaCursors::advance_write`]. In
    /// overwrite mode a request of at least `depth` items pre-adjusts the
    /// effective write position to the read cursor, exactly as
    /// [`Fifo::write_n`] does.
    ///
    /// # Panics
    /// Panics in overwrite mode when `n > 2 * depth`; past that the
    /// resulting overflow could not be resolved by the read side.
    pub fn linear_write_info(&self, offset: u16, n: u16) -> WriteRegion {
        if self.depth == 0 {
            return WriteRegion { ptr: ptr::null_mut(), len: 0 };
        }

        let mut w = self.wr_idx.load(Ordering::Acquire);
        let r = self.rd_idx.load(Ordering::Acquire);
        let free = self.remaining_abs(w, r);

        let mut n = n;
        if !self.overwritable.load(Ordering::Relaxed) {
            n = n.min(free);
        } else if n >= self.depth {
            assert!(
                u32::from(n) <= 2 * u32::from(self.depth),
                "linear write of {} items into an overwritable FIFO of depth {} cannot be recovered",
                n,
                self.depth
            );
            n = self.depth;
            // Same adjustment as write_n: fill the whole buffer from the
            // read cursor's position without mutating the read cursor.
            w = r;
        }

        if free == 0 || offset >= free {
            return WriteRegion { ptr: ptr::null_mut(), len: 0 };
        }

        let w_rel = self.relative_index(w, offset);
        let r_rel = self.relative_index(r, 0);

        let len = if w_rel < r_rel {
            r_rel - w_rel
        } else {
            self.depth - w_rel
        };

        WriteRegion {
            // Safety: w_rel < depth, the offset stays inside the store.
            ptr: unsafe { self.buffer.add(usize::from(w_rel) * usize::from(self.item_size)) },
            len: n.min(len),
        }
    }

    /// Hand out the unchecked cursor-control capability for DMA completion
    /// handlers. See [`DmaCursors`] for the ownership contract.
    pub fn dma_cursors(&self) -> DmaCursors<'_> {
        DmaCursors { fifo: self }
    }

    // ---- snapshot queries -------------------------------------------------
    //
    // Each query loads every cursor exactly once, so it is safe from any
    // context without locks: the result may be stale but never torn.

    /// Number of stored items, clamped to `depth` while an uncorrected
    /// overflow is pending.
    pub fn count(&self) -> u16 {
        let w = self.wr_idx.load(Ordering::Acquire);
        let r = self.rd_idx.load(Ordering::Acquire);
        self.count_abs(w, r).min(self.depth)
    }

    /// Whether no items are stored.
    pub fn is_empty(&self) -> bool {
        let w = self.wr_idx.load(Ordering::Acquire);
        let r = self.rd_idx.load(Ordering::Acquire);
        w == r
    }

    /// Whether exactly `depth` items are stored.
    pub fn is_full(&self) -> bool {
        let w = self.wr_idx.load(Ordering::Acquire);
        let r = self.rd_idx.load(Ordering::Acquire);
        self.count_abs(w, r) == self.depth
    }

    /// Free space in items; zero while an uncorrected overflow is pending.
    pub fn remaining(&self) -> u16 {
        let w = self.wr_idx.load(Ordering::Acquire);
        let r = self.rd_idx.load(Ordering::Acquire);
        self.remaining_abs(w, r)
    }

    /// Whether the write cursor has moved more than `depth` items past the
    /// read cursor without a correction. Only a DMA writer bypassing the
    /// write API can cause this; the answer is only meaningful while at most
    /// one overflow cycle has occurred. Read-side calls self-heal the
    /// condition, so poll this before reading if you need to observe it.
    pub fn overflowed(&self) -> bool {
        let w = self.wr_idx.load(Ordering::Acquire);
        let r = self.rd_idx.load(Ordering::Acquire);
        self.count_abs(w, r) > self.depth
    }

    /// Snap the read cursor to exactly `depth` items behind the write
    /// cursor, discarding the oldest overrun data. Only needed after
    /// [`Fifo::overflowed`] returned `true`; read-side operations perform
    /// the same correction on their own.
    pub fn correct_read_pointer(&self) {
        let _rd = lock(&self.mutex_rd);
        self.correct_read_index(self.wr_idx.load(Ordering::Acquire));
    }

    // ---- lifecycle --------------------------------------------------------

    /// Reset both cursors to zero, emptying the FIFO.
    pub fn clear(&self) {
        let _wr = lock(&self.mutex_wr);
        let _rd = lock(&self.mutex_rd);
        self.wr_idx.store(0, Ordering::Release);
        self.rd_idx.store(0, Ordering::Release);
    }

    /// Switch overwrite mode at runtime.
    pub fn set_overwritable(&self, overwritable: bool) {
        let _wr = lock(&self.mutex_wr);
        let _rd = lock(&self.mutex_rd);
        self.overwritable.store(overwritable, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fifo(depth: u16) -> Fifo {
        Fifo::new(depth, 1, false).unwrap()
    }

    #[test]
    fn rejects_depth_past_index_space() {
        assert_eq!(
            Fifo::new(MAX_DEPTH + 1, 1, false).unwrap_err(),
            ConfigError::DepthTooLarge(MAX_DEPTH + 1)
        );
        assert!(Fifo::new(MAX_DEPTH, 1, false).is_ok());
    }

    #[test]
    fn rejects_zero_item_size() {
        assert_eq!(Fifo::new(8, 0, false).unwrap_err(), ConfigError::ZeroItemSize);
    }

    #[test]
    fn advance_jumps_unused_index_space() {
        let f = fifo(100); // max_index 199, unused 65336
        assert_eq!(f.advance_index(0, 10), 10);
        assert_eq!(f.advance_index(199, 1), 0);
        assert_eq!(f.advance_index(150, 100), 50);
        assert_eq!(f.advance_index(199, 199), 198);
    }

    #[test]
    fn backward_jumps_unused_index_space() {
        let f = fifo(100);
        assert_eq!(f.backward_index(10, 10), 0);
        assert_eq!(f.backward_index(0, 1), 199);
        assert_eq!(f.backward_index(50, 100), 150);
    }

    #[test]
    fn advance_then_backward_is_identity() {
        let f = fifo(100);
        for p in [0u16, 1, 57, 99, 100, 150, 199] {
            for off in [0u16, 1, 99, 100, 199] {
                assert_eq!(f.backward_index(f.advance_index(p, off), off), p);
            }
        }
    }

    #[test]
    fn count_spans_the_extended_wrap() {
        let f = fifo(100);
        assert_eq!(f.count_abs(50, 150), 100); // r numerically above w
        assert_eq!(f.count_abs(150, 50), 100);
        assert_eq!(f.count_abs(0, 0), 0);
        assert_eq!(f.count_abs(199, 0), 199); // overflow state is representable
    }

    #[test]
    fn relative_index_stays_in_depth() {
        let f = fifo(100);
        for p in 0..200u16 {
            assert!(f.relative_index(p, 0) < 100);
        }
        assert_eq!(f.relative_index(150, 0), 50);
        assert_eq!(f.relative_index(150, 60), 10);
    }

    #[test]
    fn depth_zero_is_inert() {
        let f = fifo(0);
        assert!(f.is_empty());
        assert!(f.is_full());
        assert_eq!(f.remaining(), 0);
        assert!(!f.write(&[1]));
        assert_eq!(f.write_n(&[1, 2, 3]), 0);
        let mut out = [0u8; 4];
        assert!(!f.read(&mut out));
        assert_eq!(f.read_n(&mut out), 0);
        assert_eq!(f.linear_read_info(0, 4).len, 0);
        assert_eq!(f.linear_write_info(0, 4).len, 0);
    }

    #[test]
    fn overwritable_depth_zero_write_reports_nothing_stored() {
        let f = Fifo::new(0, 1, true).unwrap();
        assert!(!f.write(&[9]));
        assert_eq!(f.write_n(&[9, 9]), 0);
    }

    struct CountingMutex {
        acquires: AtomicU32,
        releases: AtomicU32,
    }

    impl CountingMutex {
        fn new() -> Arc<Self> {
            Arc::new(CountingMutex {
                acquires: AtomicU32::new(0),
                releases: AtomicU32::new(0),
            })
        }
    }

    impl FifoMutex for CountingMutex {
        fn acquire(&self) {
            self.acquires.fetch_add(1, Ordering::SeqCst);
        }
        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn mutexes_are_balanced_and_scoped_to_their_role() {
        let wr = CountingMutex::new();
        let rd = CountingMutex::new();
        let mut f = fifo(8);
        f.set_mutexes(Some(wr.clone()), Some(rd.clone()));

        assert!(f.write(&[1]));
        assert_eq!(f.write_n(&[2, 3]), 2);
        assert_eq!(wr.acquires.load(Ordering::SeqCst), 2);
        assert_eq!(rd.acquires.load(Ordering::SeqCst), 0);

        let mut out = [0u8; 1];
        assert!(f.read(&mut out));
        assert!(f.peek(&mut out));
        assert_eq!(rd.acquires.load(Ordering::SeqCst), 2);

        // Snapshot queries take no lock.
        let _ = (f.count(), f.is_empty(), f.is_full(), f.remaining(), f.overflowed());
        assert_eq!(wr.acquires.load(Ordering::SeqCst), 2);
        assert_eq!(rd.acquires.load(Ordering::SeqCst), 2);

        // clear and set_overwritable take both.
        f.clear();
        f.set_overwritable(true);
        assert_eq!(wr.acquires.load(Ordering::SeqCst), 4);
        assert_eq!(rd.acquires.load(Ordering::SeqCst), 4);

        assert_eq!(wr.acquires.load(Ordering::SeqCst), wr.releases.load(Ordering::SeqCst));
        assert_eq!(rd.acquires.load(Ordering::SeqCst), rd.releases.load(Ordering::SeqCst));
    }

    #[test]
    fn write_lock_released_on_full_reject() {
        let wr = CountingMutex::new();
        let mut f = fifo(1);
        f.set_mutexes(Some(wr.clone()), None);

        assert!(f.write(&[1]));
        assert!(!f.write(&[2]));
        assert_eq!(wr.acquires.load(Ordering::SeqCst), 2);
        assert_eq!(wr.releases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn single_item_overwrite_resolves_through_read() {
        let f = Fifo::new(4, 1, true).unwrap();
        for v in 1..=4u8 {
            assert!(f.write(&[v]));
        }
        // Fifth write lands on top of the oldest item and trips the
        // overflow accounting until the read side corrects it.
        assert!(f.write(&[5]));
        assert!(f.overflowed());
        assert_eq!(f.count(), 4);

        let mut out = [0u8; 1];
        assert!(f.read(&mut out));
        assert_eq!(out[0], 2);
        assert!(!f.overflowed());
    }
}
