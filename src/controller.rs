//! # Request Controller
//!
//! Serializes bus requests (TWI/I2C style) from many tasks onto one piece of
//! hardware.
//!
//! ```text
//!   task ── reserve(slots, bytes) ──► writer Mutex ──► Res2Lock
//!     │                                 (WouldBlock: queued and suspended)
//!     ├── write(bytes) ──► shared byte ring (tail)
//!     └── submit(address) ──► stream slot ──► pending FIFO ──► hardware
//!                                                  │
//!   ISR ── end_processing_request(outcome) ◄───────┘
//!            callback · bytes back to the ring · slot back to the pool
//!            · make_available (may resume a waiter) · start next
//! ```
//!
//! One task composes requests at a time: a reservation first takes the FIFO
//! writer [`Mutex`] and holds it until its last request is submitted or the
//! reservation is cancelled. Capacity goes through a two-dimensional
//! [`Res2Lock`]: one counter for free stream slots, one for free bytes of the
//! shared buffer. A request that can never fit is rejected up front; one that
//! does not fit yet waits in FIFO order. Bytes and slots return to the lock
//! only when the hardware retires the request, so a waiting task resumes
//! exactly when there is room.
//!
//! Requests are processed strictly in submission order, one at a time.

use core::fmt;
use core::future::Future;

use crate::async_task::Acquire;
use crate::config::MAX_STREAMS;
use crate::kernel::Kernel;
use crate::lock::{Mutex, Res2Lock, ReserveError};
use crate::queue::{ByteQueue, Queue, Ring};
use crate::stream::{BusError, Completion, Stream, StreamFlags, StreamRef};
use crate::sync::{critical_section, Shared};
use crate::task::TaskId;

/// The hardware side of a controller.
pub trait RequestProcessor {
    /// Program the hardware for `request`.
    ///
    /// Runs with the controller borrowed: the implementation may read or fill
    /// the request's bytes but must not call back into the controller. The
    /// outcome is reported later through
    /// [`Controller::end_processing_request`], usually from the bus
    /// interrupt.
    fn start_processing_request(&self, request: &mut StreamRef<'_>);
}

/// Why a request was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// Admission failed or has to wait.
    Reserve(ReserveError),
    /// The caller does not hold a reservation with a request left on it.
    NotReserved,
    /// More bytes written than the reservation covers.
    ExceedsReservation,
    /// No stream slot free. A held reservation rules this out.
    NoFreeSlot,
    /// The shared buffer ran out of room.
    BufferFull,
    /// Receive length is zero or does not fit the supplied buffer.
    BadLength,
}

impl From<ReserveError> for SubmitError {
    fn from(e: ReserveError) -> Self {
        SubmitError::Reserve(e)
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Reserve(e) => write!(f, "reservation failed: {e}"),
            SubmitError::NotReserved => f.write_str("no reservation held"),
            SubmitError::ExceedsReservation => f.write_str("write exceeds reservation"),
            SubmitError::NoFreeSlot => f.write_str("no free stream slot"),
            SubmitError::BufferFull => f.write_str("shared buffer full"),
            SubmitError::BadLength => f.write_str("bad receive length"),
        }
    }
}

// ---------------------------------------------------------------------------
// Controller state
// ---------------------------------------------------------------------------

const POOL: usize = MAX_STREAMS + 1;

const EMPTY_STREAM: Stream = Stream::empty();

/// What the grant holder may still submit.
#[derive(Debug, Clone, Copy)]
struct Grant {
    task: TaskId,
    slots: u16,
    bytes: u16,
}

struct ControllerState<const SLOTS: usize, const BYTES: usize> {
    buffer: [u8; BYTES],
    /// Every byte written and not yet retired, oldest at the head.
    shared: Ring,
    /// Start of the request being composed; `write_head..shared.tail`.
    write_head: usize,
    grant: Option<Grant>,
    streams: [Stream; SLOTS],
    free: Queue<u8, POOL>,
    pending: Queue<u8, POOL>,
    auto_start: bool,
    errors: u32,
}

impl<const SLOTS: usize, const BYTES: usize> ControllerState<SLOTS, BYTES> {
    /// Pick a slot for the grant holder's next request.
    fn claim(&mut self, task: TaskId) -> Result<u8, SubmitError> {
        match self.grant {
            Some(g) if g.task == task && g.slots > 0 => {}
            _ => return Err(SubmitError::NotReserved),
        }
        self.free.remove_head().ok_or(SubmitError::NoFreeSlot)
    }

    /// Queue `stream` in `slot` and charge it to the grant. Returns `true`
    /// when the grant is used up.
    fn enqueue(&mut self, slot: u8, stream: Stream) -> bool {
        self.streams[slot as usize] = stream;
        self.pending.add_tail(slot);
        let done = match &mut self.grant {
            Some(g) => {
                g.slots -= 1;
                g.slots == 0
            }
            None => true,
        };
        if done {
            self.grant = None;
        }
        done
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// A request queue with `SLOTS` stream slots and a `BYTES`-byte shared
/// transmit buffer (`BYTES - 1` usable), driving the processor `P`.
pub struct Controller<P, const SLOTS: usize, const BYTES: usize> {
    state: Shared<ControllerState<SLOTS, BYTES>>,
    /// Held by the grant holder from `reserve` to its last submit.
    writer: Mutex,
    lock: Res2Lock,
    processor: P,
}

impl<P: RequestProcessor, const SLOTS: usize, const BYTES: usize> Controller<P, SLOTS, BYTES> {
    pub const fn new(processor: P) -> Self {
        assert!(SLOTS > 0 && SLOTS <= MAX_STREAMS, "slot count out of range");
        assert!(BYTES >= 2 && BYTES - 1 <= u16::MAX as usize, "buffer size out of range");
        Self {
            state: Shared::new(ControllerState {
                buffer: [0; BYTES],
                shared: Ring::new(BYTES),
                write_head: 0,
                grant: None,
                streams: [EMPTY_STREAM; SLOTS],
                free: Queue::indices(SLOTS),
                pending: Queue::new(0),
                auto_start: true,
                errors: 0,
            }),
            writer: Mutex::new(),
            lock: Res2Lock::new(SLOTS as u16, (BYTES - 1) as u16),
            processor,
        }
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    // -- Admission ----------------------------------------------------------

    /// Reserve room for `slots` requests carrying `bytes` transmit bytes in
    /// total. On [`ReserveError::WouldBlock`] the task is queued and
    /// suspended, either behind another task's live reservation or for
    /// capacity; it must call again once resumed.
    pub fn reserve(
        &self,
        kernel: &Kernel,
        task: TaskId,
        slots: u16,
        bytes: u16,
    ) -> Result<(), ReserveError> {
        let (max_slots, max_bytes) = self.lock.max();
        if slots == 0 || slots > max_slots || bytes > max_bytes {
            log::debug!("{task}: {slots} slots / {bytes} bytes can never be admitted");
            return Err(ReserveError::Unsatisfiable);
        }
        critical_section(|_| {
            if self.state.lock(|s| matches!(s.grant, Some(g) if g.task == task)) {
                return Ok(());
            }
            self.writer.reserve(kernel, task)?;
            if let Err(e) = self.lock.reserve(kernel, task, slots, bytes) {
                if e.is_permanent() {
                    self.writer.release(kernel, task);
                }
                return Err(e);
            }
            self.state.lock(|s| s.grant = Some(Grant { task, slots, bytes }));
            Ok(())
        })
    }

    /// [`reserve`](Self::reserve) for coroutine tasks.
    pub fn reserve_async<'a>(
        &'a self,
        kernel: &'a Kernel,
        slots: u16,
        bytes: u16,
    ) -> impl Future<Output = Result<(), ReserveError>> + 'a {
        Acquire::new(kernel, move |task| self.reserve(kernel, task, slots, bytes))
    }

    /// Drop the rest of `task`'s reservation, discarding bytes written but
    /// not submitted.
    pub fn cancel_reservation(&self, kernel: &Kernel, task: TaskId) -> bool {
        critical_section(|_| {
            let dropped = self.state.lock(|s| {
                if !matches!(s.grant, Some(g) if g.task == task) {
                    return false;
                }
                s.grant = None;
                s.shared = Ring::span(s.shared.head(), s.write_head, BYTES);
                true
            });
            if dropped {
                log::debug!("{task}: reservation cancelled");
                self.end_grant(kernel, task);
            }
            dropped
        })
    }

    // -- Composing requests -------------------------------------------------

    /// Append transmit bytes to the request being composed.
    pub fn write(&self, task: TaskId, bytes: &[u8]) -> Result<(), SubmitError> {
        self.state.lock(|s| {
            let grant = match &mut s.grant {
                Some(g) if g.task == task => g,
                _ => return Err(SubmitError::NotReserved),
            };
            if bytes.len() > grant.bytes as usize {
                return Err(SubmitError::ExceedsReservation);
            }
            let written = ByteQueue::new(&mut s.buffer, &mut s.shared).extend_from_slice(bytes);
            grant.bytes -= written as u16;
            if written < bytes.len() {
                log::error!("shared buffer overflow despite reservation");
                return Err(SubmitError::BufferFull);
            }
            Ok(())
        })
    }

    /// Queue the bytes written since the last submit as one transmit request
    /// to `address`. Returns the stream slot.
    ///
    /// The request starts right away if nothing is in flight. The last
    /// request covered by a reservation releases the lock.
    pub fn submit(
        &self,
        kernel: &Kernel,
        task: TaskId,
        address: u8,
        completion: Option<Completion>,
    ) -> Result<usize, SubmitError> {
        critical_section(|_| {
            let (slot, used, done) = self.state.lock(|s| {
                let slot = s.claim(task)?;
                let span = Ring::span(s.write_head, s.shared.tail(), BYTES);
                let used = span.count() as u16;
                s.write_head = s.shared.tail();
                let done = s.enqueue(slot, Stream::transmit(span, address, completion));
                Ok::<_, SubmitError>((slot, used, done))
            })?;
            log::debug!("{task}: queued write of {used} bytes to {address:#04x} in slot {slot}");
            self.admitted(kernel, task, used, done);
            Ok(slot as usize)
        })
    }

    /// Queue a receive request for `len` bytes from `address` into a private
    /// buffer, which must hold at least `len + 1` bytes. On error the buffer
    /// comes back with the reason.
    pub fn submit_read(
        &self,
        kernel: &Kernel,
        task: TaskId,
        address: u8,
        buffer: &'static mut [u8],
        len: u16,
        completion: Option<Completion>,
    ) -> Result<usize, (SubmitError, &'static mut [u8])> {
        if len == 0 || len as usize >= buffer.len() {
            return Err((SubmitError::BadLength, buffer));
        }
        critical_section(|_| {
            let (slot, done) = self.state.lock(move |s| {
                let slot = match s.claim(task) {
                    Ok(slot) => slot,
                    Err(e) => return Err((e, buffer)),
                };
                let done = s.enqueue(slot, Stream::receive(buffer, len, address, completion));
                Ok((slot, done))
            })?;
            log::debug!("{task}: queued read of {len} bytes from {address:#04x} in slot {slot}");
            self.admitted(kernel, task, 0, done);
            Ok(slot as usize)
        })
    }

    /// Reserve, write and submit one transmit request. A task that gets
    /// `Reserve(WouldBlock)` calls again once resumed.
    pub fn process_stream(
        &self,
        kernel: &Kernel,
        task: TaskId,
        address: u8,
        bytes: &[u8],
        completion: Option<Completion>,
    ) -> Result<usize, SubmitError> {
        let len = u16::try_from(bytes.len()).map_err(|_| ReserveError::Unsatisfiable)?;
        self.reserve(kernel, task, 1, len)?;
        self.write(task, bytes)?;
        self.submit(kernel, task, address, completion)
    }

    /// [`process_stream`](Self::process_stream) for coroutine tasks.
    pub async fn process_stream_async(
        &self,
        kernel: &Kernel,
        address: u8,
        bytes: &[u8],
        completion: Option<Completion>,
    ) -> Result<usize, SubmitError> {
        let len = u16::try_from(bytes.len()).map_err(|_| ReserveError::Unsatisfiable)?;
        self.reserve_async(kernel, 1, len).await?;
        let task = kernel.current().ok_or(ReserveError::NoCurrentTask)?;
        self.write(task, bytes)?;
        self.submit(kernel, task, address, completion)
    }

    fn admitted(&self, kernel: &Kernel, task: TaskId, bytes: u16, grant_used_up: bool) {
        if !self.lock.use_available(1, bytes) {
            log::error!("admission counters out of step with queued requests");
        }
        if grant_used_up {
            self.end_grant(kernel, task);
        }
        if self.auto_start() {
            self.start_next();
        }
    }

    /// Give up capacity ownership (if it was handed over) and pass the
    /// writer turn to the next reserver.
    fn end_grant(&self, kernel: &Kernel, task: TaskId) {
        self.lock.release(kernel, task);
        self.writer.release(kernel, task);
    }

    // -- Hardware side ------------------------------------------------------

    /// Hand the oldest pending request to the processor unless it is already
    /// in flight. Returns `true` if a request was started.
    pub fn start_next(&self) -> bool {
        self.state.lock(|s| {
            let Some(slot) = s.pending.peek_head(0) else {
                return false;
            };
            let ControllerState { buffer, streams, .. } = s;
            let stream = &mut streams[slot as usize];
            if stream.flags().contains(StreamFlags::PROCESSING) {
                return false;
            }
            stream.mark_processing();
            log::debug!("starting slot {slot} for {:#04x}", stream.address());
            self.processor
                .start_processing_request(&mut StreamRef::new(stream, buffer));
            true
        })
    }

    /// Run `f` on the request in flight, e.g. to move the next byte from a
    /// bus interrupt.
    pub fn with_processing_stream<R>(&self, f: impl FnOnce(&mut StreamRef<'_>) -> R) -> Option<R> {
        self.state.lock(|s| {
            let slot = s.pending.peek_head(0)?;
            let ControllerState { buffer, streams, .. } = s;
            let stream = &mut streams[slot as usize];
            if !stream.flags().contains(StreamFlags::PROCESSING) {
                return None;
            }
            Some(f(&mut StreamRef::new(stream, buffer)))
        })
    }

    /// Retire the request in flight with `outcome`. Runs its completion
    /// callback, returns its bytes and slot, and starts the next request when
    /// auto-start is on. Interrupt-safe.
    ///
    /// Returns `false` if no request was in flight.
    pub fn end_processing_request(&self, kernel: &Kernel, outcome: Result<(), BusError>) -> bool {
        critical_section(|_| {
            let freed = self.state.lock(|s| {
                let slot = s.pending.peek_head(0)?;
                let ControllerState {
                    buffer,
                    shared,
                    streams,
                    free,
                    pending,
                    errors,
                    ..
                } = s;
                let stream = &mut streams[slot as usize];
                if !stream.flags().contains(StreamFlags::PROCESSING) {
                    return None;
                }
                stream.finish(outcome);
                if let Err(e) = outcome {
                    *errors = errors.wrapping_add(1);
                    log::warn!("slot {slot} for {:#04x} failed: {e}", stream.address());
                }
                if let Some(c) = stream.completion() {
                    (c.callback)(&mut StreamRef::new(stream, buffer), c.param);
                }
                let freed = stream.release_into(shared);
                *stream = Stream::empty();
                pending.remove_head();
                free.add_tail(slot);
                log::debug!("retired slot {slot}, {freed} bytes freed");
                Some(freed)
            });
            let Some(freed) = freed else {
                log::warn!("end of request with nothing in flight");
                return false;
            };
            self.lock.make_available(kernel, 1, freed);
            if self.auto_start() {
                self.start_next();
            }
            true
        })
    }

    // -- Status -------------------------------------------------------------

    pub fn auto_start(&self) -> bool {
        self.state.lock(|s| s.auto_start)
    }

    /// With auto-start off, queued requests wait for [`start_next`](Self::start_next).
    pub fn set_auto_start(&self, on: bool) {
        self.state.lock(|s| s.auto_start = on)
    }

    /// Queued requests, including the one in flight.
    pub fn pending_count(&self) -> usize {
        self.state.lock(|s| s.pending.count())
    }

    /// Slots not reserved by anyone.
    pub fn free_slots(&self) -> u16 {
        self.lock.available().0
    }

    /// Shared-buffer bytes not reserved by anyone.
    pub fn free_bytes(&self) -> u16 {
        self.lock.available().1
    }

    /// Requests retired with a bus error since start-up.
    pub fn error_count(&self) -> u32 {
        self.state.lock(|s| s.errors)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_task::AsyncTask;
    use crate::scheduler::{Clock, Scheduler};
    use crate::task::{Task, TaskState};
    use core::cell::RefCell;
    use core::pin::pin;

    /// Transmits by draining the request and records what it saw.
    #[derive(Default)]
    struct MockBus {
        started: RefCell<Vec<(u8, Vec<u8>)>>,
    }

    impl RequestProcessor for MockBus {
        fn start_processing_request(&self, request: &mut StreamRef<'_>) {
            let mut sent = Vec::new();
            let mut bytes = request.bytes();
            while let Some(b) = bytes.remove_head() {
                sent.push(b);
            }
            self.started.borrow_mut().push((request.address(), sent));
        }
    }

    fn started<const S: usize, const B: usize>(c: &Controller<MockBus, S, B>) -> Vec<(u8, Vec<u8>)> {
        c.processor().started.borrow().clone()
    }

    fn kernel_with(count: usize) -> Kernel {
        let k = Kernel::new();
        k.attach(count).unwrap();
        k
    }

    #[test]
    fn test_requests_run_in_submission_order() {
        let _ = env_logger::builder().is_test(true).try_init();
        let k = kernel_with(1);
        let t = k.task(0).unwrap();
        let c: Controller<MockBus, 4, 16> = Controller::new(MockBus::default());

        assert_eq!(c.reserve(&k, t, 3, 9), Ok(()));
        c.write(t, &[1, 2]).unwrap();
        assert_eq!(c.submit(&k, t, 0x10, None), Ok(0));
        c.write(t, &[3, 4, 5]).unwrap();
        assert_eq!(c.submit(&k, t, 0x20, None), Ok(1));
        c.write(t, &[6, 7, 8, 9]).unwrap();
        assert_eq!(c.submit(&k, t, 0x30, None), Ok(2));

        // The third submit used up the reservation.
        assert_eq!(c.lock.owner(), None);
        assert_eq!(c.pending_count(), 3);
        assert_eq!(c.free_bytes(), 6);
        assert_eq!(started(&c), vec![(0x10, vec![1, 2])]);

        assert!(c.end_processing_request(&k, Ok(())));
        assert_eq!(c.free_bytes(), 8);
        assert!(c.end_processing_request(&k, Ok(())));
        assert!(c.end_processing_request(&k, Ok(())));
        assert!(!c.end_processing_request(&k, Ok(())));

        assert_eq!(
            started(&c),
            vec![(0x10, vec![1, 2]), (0x20, vec![3, 4, 5]), (0x30, vec![6, 7, 8, 9])]
        );
        assert_eq!(c.pending_count(), 0);
        assert_eq!(c.free_slots(), 4);
        assert_eq!(c.free_bytes(), 15);
    }

    #[test]
    fn test_full_buffer_blocks_until_retirement() {
        let k = kernel_with(2);
        let (a, b) = (k.task(0).unwrap(), k.task(1).unwrap());
        let c: Controller<MockBus, 4, 8> = Controller::new(MockBus::default());

        assert_eq!(c.process_stream(&k, a, 0x10, &[0; 5], None), Ok(0));
        assert_eq!(c.free_bytes(), 2);
        assert_eq!(c.lock.owner(), None);

        assert_eq!(
            c.process_stream(&k, b, 0x20, &[1, 2, 3, 4], None),
            Err(SubmitError::Reserve(ReserveError::WouldBlock))
        );
        assert_eq!(k.state(b), TaskState::Suspended);
        assert_eq!(c.pending_count(), 1);

        assert!(c.end_processing_request(&k, Ok(())));
        assert_eq!(k.state(b), TaskState::Ready);
        assert_eq!(c.lock.owner(), Some(b));

        assert_eq!(c.process_stream(&k, b, 0x20, &[1, 2, 3, 4], None), Ok(1));
        assert_eq!(started(&c)[1], (0x20, vec![1, 2, 3, 4]));
    }

    #[test]
    fn test_oversized_request_is_rejected() {
        let k = kernel_with(1);
        let t = k.task(0).unwrap();
        let c: Controller<MockBus, 2, 8> = Controller::new(MockBus::default());

        assert_eq!(
            c.process_stream(&k, t, 0x10, &[0; 8], None),
            Err(SubmitError::Reserve(ReserveError::Unsatisfiable))
        );
        assert_eq!(c.reserve(&k, t, 0, 1), Err(ReserveError::Unsatisfiable));
        assert_eq!(c.reserve(&k, t, 3, 1), Err(ReserveError::Unsatisfiable));
        assert_eq!(c.pending_count(), 0);
        assert_eq!(c.free_bytes(), 7);
        assert_eq!(k.state(t), TaskState::Ready);
    }

    #[test]
    fn test_submit_requires_reservation() {
        let k = kernel_with(2);
        let (a, b) = (k.task(0).unwrap(), k.task(1).unwrap());
        let c: Controller<MockBus, 2, 8> = Controller::new(MockBus::default());

        assert_eq!(c.write(a, &[1]), Err(SubmitError::NotReserved));
        assert_eq!(c.submit(&k, a, 0x10, None), Err(SubmitError::NotReserved));

        c.reserve(&k, a, 1, 2).unwrap();
        assert_eq!(c.write(b, &[1]), Err(SubmitError::NotReserved));
        assert_eq!(c.write(a, &[1, 2, 3]), Err(SubmitError::ExceedsReservation));
    }

    #[test]
    fn test_second_writer_queues_behind_live_grant() {
        let k = kernel_with(2);
        let (a, b) = (k.task(0).unwrap(), k.task(1).unwrap());
        let c: Controller<MockBus, 4, 8> = Controller::new(MockBus::default());

        assert_eq!(c.reserve(&k, a, 2, 5), Ok(()));
        assert_eq!(c.lock.owner(), None);
        c.write(a, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(c.submit(&k, a, 0x10, None), Ok(0));

        // A still has a request left on its grant, so B may not compose.
        assert_eq!(
            c.process_stream(&k, b, 0x20, &[6, 7, 8, 9], None),
            Err(SubmitError::Reserve(ReserveError::WouldBlock))
        );
        assert_eq!(k.state(b), TaskState::Suspended);
        assert_eq!(c.write(b, &[6]), Err(SubmitError::NotReserved));

        // A's last request ends the grant; B gets its turn but lacks bytes.
        assert_eq!(c.submit(&k, a, 0x11, None), Ok(1));
        assert_eq!(k.state(b), TaskState::Ready);
        assert_eq!(
            c.process_stream(&k, b, 0x20, &[6, 7, 8, 9], None),
            Err(SubmitError::Reserve(ReserveError::WouldBlock))
        );
        assert_eq!(k.state(b), TaskState::Suspended);

        // Retiring A's first write is what frees the bytes B waits for.
        assert!(c.end_processing_request(&k, Ok(())));
        assert_eq!(k.state(b), TaskState::Ready);
        assert_eq!(c.process_stream(&k, b, 0x20, &[6, 7, 8, 9], None), Ok(2));
        assert_eq!(c.lock.owner(), None);
        assert_eq!(c.writer.owner(), None);
    }

    static FAILURE: Shared<Option<(u8, Option<BusError>, bool, usize)>> = Shared::new(None);

    fn record_failure(request: &mut StreamRef<'_>, param: usize) {
        let seen = (
            request.address(),
            request.error(),
            request.flags().contains(StreamFlags::FAILED),
            param,
        );
        FAILURE.lock(|f| *f = Some(seen));
    }

    #[test]
    fn test_bus_error_reaches_callback_and_counter() {
        let k = kernel_with(1);
        let t = k.task(0).unwrap();
        let c: Controller<MockBus, 2, 8> = Controller::new(MockBus::default());

        let done = Completion::new(record_failure, 7);
        c.process_stream(&k, t, 0x50, &[0xAA], Some(done)).unwrap();
        assert!(c.end_processing_request(&k, Err(BusError::AddressNack)));

        assert_eq!(
            FAILURE.lock(|f| *f),
            Some((0x50, Some(BusError::AddressNack), true, 7))
        );
        assert_eq!(c.error_count(), 1);
        assert_eq!(c.free_bytes(), 7);
        assert_eq!(c.free_slots(), 2);
    }

    static READ_BACK: Shared<([u8; 3], usize, bool)> = Shared::new(([0; 3], 0, false));

    fn copy_out(request: &mut StreamRef<'_>, _: usize) {
        let mut out = [0u8; 3];
        let n = request.bytes().read_into(&mut out);
        let returned = request.take_buffer().is_some();
        READ_BACK.lock(|r| *r = (out, n, returned));
    }

    #[test]
    fn test_read_into_private_buffer() {
        let k = kernel_with(1);
        let t = k.task(0).unwrap();
        let c: Controller<MockBus, 2, 8> = Controller::new(MockBus::default());
        let buffer: &'static mut [u8] = Box::leak(vec![0u8; 4].into_boxed_slice());

        c.reserve(&k, t, 1, 0).unwrap();
        let slot = c
            .submit_read(&k, t, 0x68, buffer, 3, Some(Completion::new(copy_out, 0)))
            .map_err(|(e, _)| e);
        assert_eq!(slot, Ok(0));
        assert_eq!(started(&c), vec![(0x68, vec![])]);

        let left = c.with_processing_stream(|r| {
            let receive = r.is_receive();
            for b in [0x0A, 0x0B, 0x0C] {
                r.bytes().add_tail(b);
            }
            (receive, r.remaining())
        });
        assert_eq!(left, Some((true, 0)));

        assert!(c.end_processing_request(&k, Ok(())));
        assert_eq!(READ_BACK.lock(|r| *r), ([0x0A, 0x0B, 0x0C], 3, true));
        assert_eq!(c.free_bytes(), 7);
        assert_eq!(c.with_processing_stream(|r| r.address()), None);
    }

    #[test]
    fn test_bad_read_length_returns_buffer() {
        let k = kernel_with(1);
        let t = k.task(0).unwrap();
        let c: Controller<MockBus, 2, 8> = Controller::new(MockBus::default());
        let buffer: &'static mut [u8] = Box::leak(vec![0u8; 4].into_boxed_slice());

        let Err((e, buffer)) = c.submit_read(&k, t, 0x68, buffer, 4, None) else {
            panic!("oversized read accepted");
        };
        assert_eq!(e, SubmitError::BadLength);
        let Err((e, buffer)) = c.submit_read(&k, t, 0x68, buffer, 2, None) else {
            panic!("read accepted without a reservation");
        };
        assert_eq!(e, SubmitError::NotReserved);
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn test_deferred_start() {
        let k = kernel_with(1);
        let t = k.task(0).unwrap();
        let c: Controller<MockBus, 4, 16> = Controller::new(MockBus::default());
        c.set_auto_start(false);

        c.process_stream(&k, t, 0x10, &[1], None).unwrap();
        c.process_stream(&k, t, 0x20, &[2], None).unwrap();
        assert!(started(&c).is_empty());
        assert!(!c.end_processing_request(&k, Ok(())));

        assert!(c.start_next());
        assert!(!c.start_next());
        assert!(c.end_processing_request(&k, Ok(())));
        assert_eq!(started(&c).len(), 1);

        assert!(c.start_next());
        assert_eq!(started(&c), vec![(0x10, vec![1]), (0x20, vec![2])]);
    }

    #[test]
    fn test_cancel_discards_unsubmitted_bytes() {
        let k = kernel_with(2);
        let (a, b) = (k.task(0).unwrap(), k.task(1).unwrap());
        let c: Controller<MockBus, 2, 8> = Controller::new(MockBus::default());

        c.reserve(&k, a, 2, 6).unwrap();
        c.write(a, &[9, 9, 9]).unwrap();
        assert!(!c.cancel_reservation(&k, b));
        assert!(c.cancel_reservation(&k, a));
        assert_eq!(c.lock.owner(), None);
        assert_eq!(c.writer.owner(), None);

        c.process_stream(&k, b, 0x30, &[1, 2], None).unwrap();
        assert_eq!(started(&c), vec![(0x30, vec![1, 2])]);
        assert!(c.end_processing_request(&k, Ok(())));
        assert_eq!(c.free_bytes(), 7);
    }

    struct Frozen;

    impl Clock for Frozen {
        fn now_ms(&self) -> u32 {
            0
        }
    }

    #[test]
    fn test_coroutines_share_the_controller() {
        let k = Kernel::new();
        let c: Controller<MockBus, 2, 8> = Controller::new(MockBus::default());
        let results = RefCell::new(Vec::new());

        let a_body = pin!(async {
            let r = c.process_stream_async(&k, 0x10, &[1, 2, 3, 4, 5], None).await;
            results.borrow_mut().push(('a', r));
            k.yield_suspend().await;
        });
        let b_body = pin!(async {
            let r = c.process_stream_async(&k, 0x20, &[6, 7, 8, 9], None).await;
            results.borrow_mut().push(('b', r));
            k.yield_suspend().await;
        });
        let mut a = AsyncTask::new(a_body);
        let mut b = AsyncTask::new(b_body);
        let mut table: [&mut dyn Task; 2] = [&mut a, &mut b];
        let mut s = Scheduler::new(&k, Frozen, &mut table).unwrap();
        s.begin();

        assert_eq!(s.dispatch(0), 2);
        assert_eq!(*results.borrow(), vec![('a', Ok(0))]);
        assert_eq!(c.lock.waiting(), 1);

        assert!(c.end_processing_request(&k, Ok(())));
        assert_eq!(s.dispatch(0), 1);
        assert_eq!(*results.borrow(), vec![('a', Ok(0)), ('b', Ok(1))]);
        assert_eq!(started(&c)[1], (0x20, vec![6, 7, 8, 9]));
    }
}
