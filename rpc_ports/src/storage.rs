//! Call storage: recyclable slots holding in-flight calls, the process-wide
//! slot pool and the two-flavor reference-counted handles over slots.
//!
//! A [`CallStorage`] slot stores one call payload (message, request or
//! response, see [`crate::call`]) together with the synchronization state a
//! future/promise pair needs: an atomic status, a mutex/condvar pair and the
//! reference counts. Slots are leaked into a growing pool and recycled in
//! place once the last handle is released, so the slot itself is the only
//! allocation per call in the common path.

use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex, MutexGuard};
use std::time::Duration;
use std::{fmt, io};

use crate::call::CallPayload;
use crate::error::FutureStatus;
use crate::future::SlotResponseHandler;
use crate::port::ResponseSender;
use crate::MAX_CALL_PAYLOAD;

/// Flavor of a [`CallHandle`].
///
/// Both flavors share the slot's total reference count; releasing the last
/// *producer* handle while the status is still pending performs the
/// broken-promise transition, which is how an abandoned producer fulfils its
/// obligation to any remaining consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleFlavor {
    /// Owns the obligation to complete the call (promises, in-flight
    /// requests held by a transport).
    Producer,
    /// Observes completion (futures, queued responses).
    Consumer,
}

/// Byte buffer for one call payload: inline up to [`MAX_CALL_PAYLOAD`]
/// bytes, spilling to the heap only for oversized values.
pub struct CallBuffer {
    len: usize,
    inline: [u8; MAX_CALL_PAYLOAD],
    spill: Option<Vec<u8>>,
}

impl CallBuffer {
    pub fn new() -> Self {
        Self {
            len: 0,
            inline: [0; MAX_CALL_PAYLOAD],
            spill: None,
        }
    }

    pub fn len(&self) -> usize {
        match &self.spill {
            Some(v) => v.len(),
            None => self.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.spill {
            Some(v) => v,
            None => &self.inline[..self.len],
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.spill = None;
    }

    /// Replaces the contents with `bytes`.
    pub fn set_from_slice(&mut self, bytes: &[u8]) {
        self.clear();
        if bytes.len() <= MAX_CALL_PAYLOAD {
            self.inline[..bytes.len()].copy_from_slice(bytes);
            self.len = bytes.len();
        } else {
            self.spill = Some(bytes.to_vec());
        }
    }
}

impl Default for CallBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl io::Write for CallBuffer {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if let Some(spill) = &mut self.spill {
            spill.extend_from_slice(bytes);
        } else if self.len + bytes.len() <= MAX_CALL_PAYLOAD {
            self.inline[self.len..self.len + bytes.len()].copy_from_slice(bytes);
            self.len += bytes.len();
        } else {
            let mut spill = Vec::with_capacity(self.len + bytes.len());
            spill.extend_from_slice(&self.inline[..self.len]);
            spill.extend_from_slice(bytes);
            self.spill = Some(spill);
            self.len = 0;
        }
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for CallBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallBuffer").field("len", &self.len()).finish()
    }
}

/// State the slot mutex linearizes: the payload and everything a completing
/// thread must publish together with the status transition.
pub(crate) struct SlotInner {
    pub payload: CallPayload,
    /// True while a thread blocks on the slot's condvar.
    pub waiting: bool,
    /// Optional one-shot response handler, invoked outside the mutex.
    pub handler: Option<Box<dyn SlotResponseHandler>>,
    /// Response sender attached by deserialization / promise arming.
    pub sender: Option<Arc<dyn ResponseSender>>,
    /// True once this slot was armed as a remote promise: completion must
    /// emit a response through `sender`.
    pub armed: bool,
    /// Handle of the port the call originated from (0 = none).
    pub source_port: u32,
    /// Opaque cookie for the transport that carries this call.
    pub remote_handle: u64,
    /// Zero means the call does not expect a response.
    pub response_timeout: Duration,
}

/// One recyclable storage slot.
///
/// Atomics live outside the mutex so status checks and queue-gating stay
/// lock-free; the value write and the status write are additionally
/// linearized by the mutex so a consumer observing `Ready` sees the complete
/// result.
pub struct CallStorage {
    status: AtomicU8,
    /// Ready-for-sending gate: when set, the call may leave a transport send
    /// queue only once `status` is terminal.
    gated: AtomicBool,
    refs: AtomicU32,
    producer_refs: AtomicU32,
    call_id: AtomicU64,
    inner: Mutex<SlotInner>,
    completed: Condvar,
}

impl CallStorage {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(FutureStatus::Pending as u8),
            gated: AtomicBool::new(false),
            refs: AtomicU32::new(0),
            producer_refs: AtomicU32::new(0),
            call_id: AtomicU64::new(0),
            inner: Mutex::new(SlotInner {
                payload: CallPayload::Empty,
                waiting: false,
                handler: None,
                sender: None,
                armed: false,
                source_port: 0,
                remote_handle: 0,
                response_timeout: Duration::ZERO,
            }),
            completed: Condvar::new(),
        }
    }

    /// Current status (acquire load: pairs with the release store of the
    /// completing thread).
    pub fn status(&self) -> FutureStatus {
        FutureStatus::from_u8(self.status.load(Ordering::Acquire))
            .unwrap_or(FutureStatus::InternalError)
    }

    /// Process-unique correlation id of the call in this slot.
    pub fn call_id(&self) -> u64 {
        self.call_id.load(Ordering::Relaxed)
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap()
    }

    pub(crate) fn condvar(&self) -> &Condvar {
        &self.completed
    }

    pub(crate) fn store_status(&self, status: FutureStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Marks this call as gated: transports must hold it in their send
    /// queue until the status is terminal.
    pub(crate) fn gate_on_status(&self) {
        self.gated.store(true, Ordering::Release);
    }

    pub(crate) fn is_gated(&self) -> bool {
        self.gated.load(Ordering::Acquire)
    }

    /// Obtains an additional handle of the given flavor. The caller must
    /// already hold a handle (the count is never revived from zero).
    pub(crate) fn obtain_handle(&'static self, flavor: HandleFlavor) -> CallHandle {
        let old = self.refs.fetch_add(1, Ordering::Relaxed);
        debug_assert!(old >= 1, "obtained handle to an unreferenced slot");
        if flavor == HandleFlavor::Producer {
            self.producer_refs.fetch_add(1, Ordering::Relaxed);
        }
        CallHandle { slot: self, flavor }
    }

    /// Indicates and notifies any future / response handler that the call
    /// failed. Double completion is a warn-and-ignore; `Pending` and `Ready`
    /// are not exceptions and rejecting them is a programmer-error panic.
    pub fn set_exception(&'static self, status: FutureStatus) {
        assert!(
            status.is_exception(),
            "invalid exception status: {status:?}"
        );
        let (handler, armed_sender) = {
            let mut inner = self.lock_inner();
            if self.status() != FutureStatus::Pending {
                log::warn!("exception cannot be set twice, ignoring");
                return;
            }
            self.store_status(status);
            self.completed.notify_all();
            let armed_sender = if inner.armed {
                inner.armed = false;
                inner.sender.clone()
            } else {
                None
            };
            (inner.handler.take(), armed_sender)
        };
        if let Some(mut handler) = handler {
            if let Some(error) = crate::error::RpcError::from_status(status) {
                handler.on_exception(error);
            }
        }
        if let Some(sender) = armed_sender {
            sender.send_response(self.obtain_handle(HandleFlavor::Consumer));
        }
    }

    /// Resets the slot for reuse. Runs the payload drop exactly once per
    /// occupancy (the payload becomes `Empty`).
    fn clear(&self) {
        let mut inner = self.lock_inner();
        inner.payload = CallPayload::Empty;
        inner.waiting = false;
        inner.handler = None;
        inner.sender = None;
        inner.armed = false;
        inner.source_port = 0;
        inner.remote_handle = 0;
        inner.response_timeout = Duration::ZERO;
        self.gated.store(false, Ordering::Relaxed);
    }

    fn release(&'static self, flavor: HandleFlavor) {
        if flavor == HandleFlavor::Producer {
            let old = self.producer_refs.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(old >= 1);
            if old == 1 && self.status() == FutureStatus::Pending {
                // Last producer gone while someone may still wait: the
                // promise is broken. For armed slots this also emits the
                // response (the handle obtained there keeps the slot alive
                // past our own release below).
                self.set_exception(FutureStatus::BrokenPromise);
            }
        }
        let old = self.refs.fetch_sub(1, Ordering::Release);
        debug_assert!(old >= 1);
        if old == 1 {
            fence(Ordering::Acquire);
            self.clear();
            call_pool().recycle(self);
        }
    }
}

impl fmt::Debug for CallStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallStorage")
            .field("call_id", &self.call_id())
            .field("status", &self.status())
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish()
    }
}

/// Owned, flavor-aware reference to a storage slot.
///
/// Dropping the handle releases the reference; the slot returns to the pool
/// when the last handle (of either flavor) is gone.
pub struct CallHandle {
    slot: &'static CallStorage,
    flavor: HandleFlavor,
}

impl CallHandle {
    pub(crate) fn slot(&self) -> &'static CallStorage {
        self.slot
    }

    pub fn flavor(&self) -> HandleFlavor {
        self.flavor
    }

    pub fn call_id(&self) -> u64 {
        self.slot.call_id()
    }

    pub fn status(&self) -> FutureStatus {
        self.slot.status()
    }

    /// Whether a transport may serialize this call now. Gated calls (deferred
    /// responses) wait in the send queue until their status is terminal.
    pub fn ready_for_sending(&self) -> bool {
        !self.slot.is_gated() || self.slot.status() != FutureStatus::Pending
    }

    /// Opaque transport cookie attached to this call.
    pub fn remote_handle(&self) -> u64 {
        self.slot.lock_inner().remote_handle
    }

    pub fn set_remote_handle(&self, cookie: u64) {
        self.slot.lock_inner().remote_handle = cookie;
    }

    /// Handle of the port the call originated from (0 = none).
    pub fn source_port(&self) -> u32 {
        self.slot.lock_inner().source_port
    }

    /// Timeout the caller attached; zero means no response is expected.
    pub fn response_timeout(&self) -> Duration {
        self.slot.lock_inner().response_timeout
    }

    /// Fails the stored call. Transports use this to fulfil the pending
    /// requests they retained when a connection is lost (modelled as
    /// `BrokenPromise`).
    pub fn set_exception(&self, status: FutureStatus) {
        self.slot.set_exception(status);
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("flavor", &self.flavor)
            .field("slot", self.slot)
            .finish()
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        self.slot.release(self.flavor);
    }
}

/// Process-wide pool of call storage slots.
///
/// Grows by leaking new slots on miss and never shrinks below the high-water
/// mark; recycled slots are handed out LIFO.
pub struct CallPool {
    free: Mutex<Vec<&'static CallStorage>>,
    allocated: AtomicU32,
}

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);
static POOL: LazyLock<CallPool> = LazyLock::new(|| CallPool {
    free: Mutex::new(Vec::new()),
    allocated: AtomicU32::new(0),
});

/// The process-wide call-storage pool.
pub fn call_pool() -> &'static CallPool {
    &POOL
}

impl CallPool {
    /// Acquires an unused slot: producer handle, refs = 1, status pending,
    /// empty payload and a fresh process-unique call id.
    pub fn acquire(&self) -> CallHandle {
        let slot = self.free.lock().unwrap().pop().unwrap_or_else(|| {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            Box::leak(Box::new(CallStorage::new()))
        });
        slot.refs.store(1, Ordering::Relaxed);
        slot.producer_refs.store(1, Ordering::Relaxed);
        slot.call_id
            .store(NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        slot.store_status(FutureStatus::Pending);
        CallHandle {
            slot,
            flavor: HandleFlavor::Producer,
        }
    }

    fn recycle(&self, slot: &'static CallStorage) {
        self.free.lock().unwrap().push(slot);
    }

    /// Slots ever allocated (the high-water mark).
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed) as usize
    }

    /// Slots currently in the free list.
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}
