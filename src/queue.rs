//! # Ring Buffers
//!
//! Fixed-capacity circular buffers. [`Ring`] is the bare head/tail index
//! algebra; [`Queue`] pairs it with inline storage and [`ByteQueue`] binds it
//! to a caller-supplied byte slice, which is how a stream borrows a span of
//! the controller's shared buffer.
//!
//! One slot is sacrificed to tell empty from full:
//!
//! ```text
//!   head == tail            → empty
//!   count + 1 == size       → full      (capacity = size - 1)
//!
//!   ┌───┬───┬───┬───┬───┬───┐
//!   │   │ a │ b │ c │   │   │     head = 1, tail = 4, count = 3
//!   └───┴───┴───┴───┴───┴───┘
//!         ▲           ▲
//!        head        tail
//! ```
//!
//! Every operation is O(1). Adding to a full ring and removing from an empty
//! one fail without touching state; callers that care check first.

// ---------------------------------------------------------------------------
// Index algebra
// ---------------------------------------------------------------------------

/// Head/tail indices over a backing array of `size` slots.
///
/// `head` indexes the oldest element, `tail` the slot after the newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ring {
    head: usize,
    tail: usize,
    size: usize,
}

impl Ring {
    /// Create an empty ring over `size` slots.
    ///
    /// # Panics
    /// If `size` is zero.
    pub const fn new(size: usize) -> Self {
        assert!(size > 0, "ring needs at least one slot");
        Self {
            head: 0,
            tail: 0,
            size,
        }
    }

    /// A ring spanning `head..tail` of a `size`-slot array.
    pub(crate) const fn span(head: usize, tail: usize, size: usize) -> Self {
        Self { head, tail, size }
    }

    #[inline]
    pub const fn head(&self) -> usize {
        self.head
    }

    #[inline]
    pub const fn tail(&self) -> usize {
        self.tail
    }

    /// Number of slots in the backing array.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Maximum number of elements the ring can hold.
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.size - 1
    }

    /// Number of elements currently held.
    #[inline]
    pub const fn count(&self) -> usize {
        (self.tail + self.size - self.head) % self.size
    }

    /// Free room left before the ring is full.
    #[inline]
    pub const fn room(&self) -> usize {
        self.capacity() - self.count()
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub const fn is_full(&self) -> bool {
        self.count() + 1 == self.size
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    #[inline]
    const fn next(&self, index: usize) -> usize {
        (index + 1) % self.size
    }

    #[inline]
    const fn prev(&self, index: usize) -> usize {
        (index + self.size - 1) % self.size
    }

    /// Claim the slot at the tail. Returns the index to write.
    pub fn push_tail(&mut self) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let index = self.tail;
        self.tail = self.next(self.tail);
        Some(index)
    }

    /// Claim the slot before the head. Returns the index to write.
    pub fn push_head(&mut self) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        self.head = self.prev(self.head);
        Some(self.head)
    }

    /// Release the oldest slot. Returns the index to read.
    pub fn pop_head(&mut self) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let index = self.head;
        self.head = self.next(self.head);
        Some(index)
    }

    /// Release the newest slot. Returns the index to read.
    pub fn pop_tail(&mut self) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        self.tail = self.prev(self.tail);
        Some(self.tail)
    }

    /// Index of the element `offset` places after the head.
    pub const fn index_from_head(&self, offset: usize) -> Option<usize> {
        if offset >= self.count() {
            return None;
        }
        Some((self.head + offset) % self.size)
    }

    /// Index of the element `offset` places before the tail.
    pub const fn index_from_tail(&self, offset: usize) -> Option<usize> {
        if offset >= self.count() {
            return None;
        }
        Some((self.tail + self.size - 1 - offset) % self.size)
    }

    /// Absorb a span that was streamed out of this ring: the head advances to
    /// the span's tail, releasing everything up to it.
    ///
    /// Both rings must index the same backing array. Only the size can be
    /// checked here; returns `false` (and leaves `self` alone) when it differs.
    pub fn update_streamed(&mut self, streamed: &Ring) -> bool {
        if streamed.size != self.size {
            return false;
        }
        self.head = streamed.tail;
        true
    }

    // Element helpers shared by `Queue` and `ByteQueue`.

    fn add_tail_in<T: Copy>(&mut self, data: &mut [T], value: T) -> bool {
        match self.push_tail() {
            Some(i) => {
                data[i] = value;
                true
            }
            None => false,
        }
    }

    fn add_head_in<T: Copy>(&mut self, data: &mut [T], value: T) -> bool {
        match self.push_head() {
            Some(i) => {
                data[i] = value;
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Owned queue
// ---------------------------------------------------------------------------

/// A ring buffer with inline storage for `N - 1` elements.
///
/// Used for task wait lists and stream index pools, where the element type is
/// a small `Copy` value.
#[derive(Debug, Clone)]
pub struct Queue<T: Copy, const N: usize> {
    data: [T; N],
    ring: Ring,
}

impl<T: Copy, const N: usize> Queue<T, N> {
    /// Create an empty queue. `fill` only initializes the unused storage.
    pub const fn new(fill: T) -> Self {
        Self {
            data: [fill; N],
            ring: Ring::new(N),
        }
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    #[inline]
    pub const fn count(&self) -> usize {
        self.ring.count()
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    #[inline]
    pub const fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn clear(&mut self) {
        self.ring.clear();
    }

    /// Append at the tail. Returns `false` if the queue is full.
    pub fn add_tail(&mut self, value: T) -> bool {
        self.ring.add_tail_in(&mut self.data[..], value)
    }

    /// Prepend at the head. Returns `false` if the queue is full.
    pub fn add_head(&mut self, value: T) -> bool {
        self.ring.add_head_in(&mut self.data[..], value)
    }

    pub fn remove_head(&mut self) -> Option<T> {
        self.ring.pop_head().map(|i| self.data[i])
    }

    pub fn remove_tail(&mut self) -> Option<T> {
        self.ring.pop_tail().map(|i| self.data[i])
    }

    pub fn peek_head(&self, offset: usize) -> Option<T> {
        self.ring.index_from_head(offset).map(|i| self.data[i])
    }

    pub fn peek_tail(&self, offset: usize) -> Option<T> {
        self.ring.index_from_tail(offset).map(|i| self.data[i])
    }

    /// Elements from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.count()).filter_map(move |offset| self.peek_head(offset))
    }
}

impl<const N: usize> Queue<u8, N> {
    /// A queue preloaded with the indices `0..count`, used as a free pool.
    pub const fn indices(count: usize) -> Self {
        assert!(count < N, "index pool larger than queue capacity");
        let mut data = [0u8; N];
        let mut i = 0;
        while i < count {
            data[i] = i as u8;
            i += 1;
        }
        Self {
            data,
            ring: Ring::span(0, count, N),
        }
    }
}

// ---------------------------------------------------------------------------
// Borrowed byte queue
// ---------------------------------------------------------------------------

/// A byte ring over caller-supplied storage.
///
/// The indices live outside the view so several rings (the controller's shared
/// ring and the spans of the streams carved out of it) can index one array at
/// different times.
pub struct ByteQueue<'a> {
    data: &'a mut [u8],
    ring: &'a mut Ring,
}

impl<'a> ByteQueue<'a> {
    /// Bind `ring` to `data`.
    ///
    /// # Panics
    /// If the ring was not created for an array of exactly `data.len()` slots.
    pub fn new(data: &'a mut [u8], ring: &'a mut Ring) -> Self {
        assert_eq!(data.len(), ring.size(), "ring size does not match its storage");
        Self { data, ring }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.ring.count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn add_tail(&mut self, byte: u8) -> bool {
        self.ring.add_tail_in(&mut *self.data, byte)
    }

    pub fn add_head(&mut self, byte: u8) -> bool {
        self.ring.add_head_in(&mut *self.data, byte)
    }

    pub fn remove_head(&mut self) -> Option<u8> {
        self.ring.pop_head().map(|i| self.data[i])
    }

    pub fn remove_tail(&mut self) -> Option<u8> {
        self.ring.pop_tail().map(|i| self.data[i])
    }

    pub fn peek_head(&self, offset: usize) -> Option<u8> {
        self.ring.index_from_head(offset).map(|i| self.data[i])
    }

    pub fn peek_tail(&self, offset: usize) -> Option<u8> {
        self.ring.index_from_tail(offset).map(|i| self.data[i])
    }

    /// Append as many of `bytes` as fit. Returns how many were taken.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> usize {
        bytes.iter().take_while(|&&b| self.add_tail(b)).count()
    }

    /// Move bytes from the head into `out`. Returns how many were copied.
    pub fn read_into(&mut self, out: &mut [u8]) -> usize {
        let mut n = 0;
        for slot in out.iter_mut() {
            match self.remove_head() {
                Some(b) => *slot = b,
                None => break,
            }
            n += 1;
        }
        n
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
