//! # Streams
//!
//! A stream is one bus transaction: a span of bytes plus the metadata the
//! hardware layer needs (direction, 7-bit address, state flags) and an
//! optional completion callback.
//!
//! Streams live in the controller's fixed slot array and never point back at
//! it. Their bytes either alias a span of the controller's shared buffer
//! (transmit requests) or sit in a private buffer supplied by the caller
//! (receive requests, flagged `UNBUFFERED`). [`StreamRef`] pairs a slot with
//! the storage it indexes so the hardware and callbacks can reach the bytes.

use core::fmt;

use bitflags::bitflags;

use crate::queue::{ByteQueue, Ring};

bitflags! {
    /// Stream direction and lifecycle flags.
    pub struct StreamFlags: u8 {
        /// The hardware reads bytes out of the stream (bus transmit).
        const READABLE = 0x01;
        /// The hardware writes bytes into the stream (bus receive).
        const WRITABLE = 0x02;
        /// Queued in the controller, not yet retired.
        const PENDING = 0x04;
        /// Handed to the hardware.
        const PROCESSING = 0x08;
        /// Bytes live in a private buffer, not the shared one.
        const UNBUFFERED = 0x10;
        /// Received bytes are appended after what the buffer already holds.
        const APPEND = 0x20;
        /// The transaction ended with a bus error, see [`StreamRef::error`].
        const FAILED = 0x40;
    }
}

/// Bus faults reported by the hardware layer when it aborts a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// Another master won arbitration.
    ArbitrationLost,
    /// No device acknowledged the address.
    AddressNack,
    /// The device stopped acknowledging data bytes.
    DataNack,
    /// Illegal start/stop condition or other bus-level fault.
    Bus,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BusError::ArbitrationLost => "arbitration lost",
            BusError::AddressNack => "address not acknowledged",
            BusError::DataNack => "data not acknowledged",
            BusError::Bus => "bus error",
        })
    }
}

/// Completion callback. Runs from the retirement path, usually interrupt
/// context, with the controller borrowed: it may inspect the stream and
/// resume tasks, but must not call back into the controller.
pub type Callback = fn(&mut StreamRef<'_>, usize);

#[derive(Clone, Copy)]
pub struct Completion {
    pub callback: Callback,
    pub param: usize,
}

impl Completion {
    pub const fn new(callback: Callback, param: usize) -> Self {
        Self { callback, param }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("param", &self.param).finish()
    }
}

// ---------------------------------------------------------------------------
// Stream slot
// ---------------------------------------------------------------------------

/// One request slot.
#[derive(Debug)]
pub struct Stream {
    span: Ring,
    flags: StreamFlags,
    address: u8,
    /// Bytes the hardware should receive (WRITABLE streams).
    expected: u16,
    buffer: Option<&'static mut [u8]>,
    completion: Option<Completion>,
    error: Option<BusError>,
}

impl Stream {
    pub(crate) const fn empty() -> Self {
        Self {
            span: Ring::new(1),
            flags: StreamFlags::empty(),
            address: 0,
            expected: 0,
            buffer: None,
            completion: None,
            error: None,
        }
    }

    /// A transmit request over `span` of the shared buffer.
    pub(crate) fn transmit(span: Ring, address: u8, completion: Option<Completion>) -> Self {
        Self {
            span,
            flags: StreamFlags::READABLE | StreamFlags::PENDING,
            address,
            expected: 0,
            buffer: None,
            completion,
            error: None,
        }
    }

    /// A receive request for `expected` bytes into a private buffer.
    pub(crate) fn receive(
        buffer: &'static mut [u8],
        expected: u16,
        address: u8,
        completion: Option<Completion>,
    ) -> Self {
        Self {
            span: Ring::new(buffer.len()),
            flags: StreamFlags::WRITABLE | StreamFlags::UNBUFFERED | StreamFlags::PENDING,
            address,
            expected,
            buffer: Some(buffer),
            completion,
            error: None,
        }
    }

    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub(crate) fn completion(&self) -> Option<Completion> {
        self.completion
    }

    pub(crate) fn mark_processing(&mut self) {
        self.flags.insert(StreamFlags::PROCESSING);
    }

    /// Clear the in-flight flags and record the outcome.
    pub(crate) fn finish(&mut self, outcome: Result<(), BusError>) {
        self.flags.remove(StreamFlags::PENDING | StreamFlags::PROCESSING);
        if let Err(e) = outcome {
            self.flags.insert(StreamFlags::FAILED);
            self.error = Some(e);
        }
    }

    /// Give this stream's span of the shared buffer back to `shared`.
    /// Returns the number of bytes released; private buffers release none.
    pub(crate) fn release_into(&self, shared: &mut Ring) -> u16 {
        if self.flags.contains(StreamFlags::UNBUFFERED) {
            return 0;
        }
        let before = shared.count();
        if !shared.update_streamed(&self.span) {
            log::error!("stream span does not belong to the shared buffer");
            return 0;
        }
        (before - shared.count()) as u16
    }
}

// ---------------------------------------------------------------------------
// Stream view
// ---------------------------------------------------------------------------

/// A stream slot bound to the storage its bytes live in.
pub struct StreamRef<'a> {
    stream: &'a mut Stream,
    shared: &'a mut [u8],
}

impl<'a> StreamRef<'a> {
    pub(crate) fn new(stream: &'a mut Stream, shared: &'a mut [u8]) -> Self {
        Self { stream, shared }
    }

    pub fn flags(&self) -> StreamFlags {
        self.stream.flags
    }

    /// 7-bit device address.
    pub fn address(&self) -> u8 {
        self.stream.address
    }

    /// `true` for receive (bus read) requests.
    pub fn is_receive(&self) -> bool {
        self.stream.flags.contains(StreamFlags::WRITABLE)
    }

    /// Bytes a receive request still expects.
    pub fn remaining(&self) -> usize {
        (self.stream.expected as usize).saturating_sub(self.stream.span.count())
    }

    pub fn error(&self) -> Option<BusError> {
        self.stream.error
    }

    /// The stream's bytes as a ring: transmit hardware pops from the head,
    /// receive hardware pushes at the tail.
    pub fn bytes(&mut self) -> ByteQueue<'_> {
        let Stream { span, buffer, .. } = &mut *self.stream;
        match buffer.as_deref_mut() {
            Some(private) => ByteQueue::new(private, span),
            None => ByteQueue::new(&mut *self.shared, span),
        }
    }

    /// Take back a private receive buffer, e.g. from a completion callback.
    pub fn take_buffer(&mut self) -> Option<&'static mut [u8]> {
        self.stream.buffer.take()
    }
}
