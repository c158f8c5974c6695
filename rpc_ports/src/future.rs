//! Future / promise primitives over call-storage slots.
//!
//! A [`Future`] is the consumer side of a pending call value, a [`Promise`]
//! the producer side. Both are moveable, non-copyable handles over the same
//! storage slot; the slot's producer reference count drives the
//! broken-promise rule (see [`crate::storage`]).
//!
//! Promises can also be used as RPC return types, which gives RAII-like
//! semantics across process boundaries: wherever the call gets lost, the
//! waiting side observes `BrokenPromise`.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::encoding::{self, InputStream, OutputStream};
use crate::error::{FutureStatus, Result, RpcError};
use crate::port::ResponseSender;
use crate::registry::InterfaceTypeInfo;
use crate::storage::{call_pool, CallHandle, HandleFlavor};

/// Handles results returned by asynchronous RPC calls.
pub trait ResponseHandler<T>: Send {
    /// Called when the result of the call is available.
    fn handle_response(&mut self, value: T);

    /// Called when the call failed.
    fn handle_exception(&mut self, error: RpcError);
}

/// Type-erased response handler stored inside a slot. Invoked outside the
/// slot mutex, exactly once.
pub(crate) trait SlotResponseHandler: Send {
    fn on_ready(&mut self, value_bytes: &[u8]);
    fn on_exception(&mut self, error: RpcError);
}

pub(crate) struct HandlerAdapter<T, H> {
    handler: H,
    _marker: PhantomData<fn(T)>,
}

impl<T, H> HandlerAdapter<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

impl<T, H> SlotResponseHandler for HandlerAdapter<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: ResponseHandler<T> + Send + 'static,
{
    fn on_ready(&mut self, value_bytes: &[u8]) {
        match encoding::decode_value(value_bytes) {
            Ok(value) => self.handler.handle_response(value),
            Err(_) => self.handler.handle_exception(RpcError::InvalidData),
        }
    }

    fn on_exception(&mut self, error: RpcError) {
        self.handler.handle_exception(error);
    }
}

/// Consumer side of a pending call value.
///
/// Moveable, non-copyable. Obtained from the client port's future-returning
/// call modes or from [`Promise::future`].
pub struct Future<T> {
    handle: Option<CallHandle>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Future<T> {
    pub(crate) fn from_handle(handle: CallHandle) -> Self {
        Self {
            handle: Some(handle),
            _marker: PhantomData,
        }
    }

    /// A future that already failed with `error` (e.g. NO_CONNECTION).
    pub(crate) fn preloaded_exception(error: RpcError) -> Self {
        let producer = call_pool().acquire();
        producer.slot().install_response(None, 0, 0, false);
        let consumer = producer.slot().obtain_handle(HandleFlavor::Consumer);
        producer.slot().set_exception(error.status());
        Self::from_handle(consumer)
    }

    pub(crate) fn take_handle(&mut self) -> Option<CallHandle> {
        self.handle.take()
    }

    /// True while this future is attached to a call.
    pub fn valid(&self) -> bool {
        self.handle.is_some()
    }

    /// Non-blocking check whether [`Future::get`] would return immediately.
    pub fn ready(&self) -> bool {
        match &self.handle {
            Some(handle) => handle.status() != FutureStatus::Pending,
            None => false,
        }
    }

    /// Obtains the value, blocking up to `timeout` if it is not available
    /// yet.
    ///
    /// Fails with `InvalidFuture` on a consumed/invalid future,
    /// `InvalidCall` if another thread is already waiting on this call,
    /// `Timeout` if the deadline expires, or the terminal exception status
    /// of the call. A successful get invalidates the future.
    pub fn get(&mut self, timeout: Duration) -> Result<T> {
        let handle = self.handle.as_ref().ok_or(RpcError::InvalidFuture)?;
        let slot = handle.slot();
        let mut status = slot.status();
        if status == FutureStatus::Pending {
            let mut inner = slot.lock_inner();
            status = slot.status();
            if status == FutureStatus::Pending {
                if inner.waiting {
                    log::error!("another thread is already waiting on this call");
                    return Err(RpcError::InvalidCall);
                }
                inner.waiting = true;
                let deadline = Instant::now() + timeout;
                while status == FutureStatus::Pending {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = slot
                        .condvar()
                        .wait_timeout(inner, deadline - now)
                        .unwrap();
                    inner = guard;
                    status = slot.status();
                }
                inner.waiting = false;
                if status == FutureStatus::Pending {
                    return Err(RpcError::Timeout);
                }
            }
        }

        match status {
            FutureStatus::Ready => {
                let bytes = slot.take_value_bytes().ok_or(RpcError::Internal)?;
                let value = encoding::decode_value(bytes.as_slice())?;
                self.handle = None;
                Ok(value)
            }
            status => Err(RpcError::from_status(status).unwrap_or(RpcError::Internal)),
        }
    }

    /// Attaches a one-shot response handler that is invoked (outside the
    /// slot mutex, on the completing thread) when the call finishes.
    pub fn set_callback<H>(&mut self, handler: H)
    where
        T: Send + 'static,
        H: ResponseHandler<T> + 'static,
    {
        if let Some(handle) = &self.handle {
            handle.slot().lock_inner().handler = Some(Box::new(HandlerAdapter::new(handler)));
        } else {
            log::error!("cannot attach a callback to an invalid future");
        }
    }
}

impl<T> Drop for Future<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Detach any callback under the slot mutex before releasing.
            handle.slot().lock_inner().handler = None;
            drop(handle);
        }
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("valid", &self.handle.is_some())
            .finish()
    }
}

/// Producer side of a pending call value.
///
/// Dropping every producer half without a prior [`Promise::set_value`] /
/// [`Promise::set_exception`] leaves any attached future with
/// `BrokenPromise`.
pub struct Promise<T> {
    handle: Option<CallHandle>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Promise<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Creates an unbound promise backed by a fresh storage slot.
    pub fn new() -> Self {
        let handle = call_pool().acquire();
        handle.slot().install_response(None, 0, 0, true);
        Self {
            handle: Some(handle),
            _marker: PhantomData,
        }
    }

    /// A second producer half for the same obligation.
    ///
    /// The value can be set through either half; the promise breaks only
    /// when the last half is dropped. This is how a server method both
    /// stores a promise for later fulfilment and returns it to the caller.
    pub fn split(&self) -> Self {
        match &self.handle {
            Some(handle) => Self {
                handle: Some(handle.slot().obtain_handle(HandleFlavor::Producer)),
                _marker: PhantomData,
            },
            None => Self {
                handle: None,
                _marker: PhantomData,
            },
        }
    }

    /// Obtains the consumer future for this promise. May be called at most
    /// once across all halves.
    pub fn future(&self) -> Result<Future<T>> {
        let handle = self.handle.as_ref().ok_or(RpcError::InvalidFuture)?;
        handle.slot().obtain_future()
    }

    /// Correlation id of the slot backing this promise.
    pub fn call_id(&self) -> Result<u64> {
        let handle = self.handle.as_ref().ok_or(RpcError::InvalidFuture)?;
        Ok(handle.call_id())
    }

    /// Fulfils the promise. A no-op with a warning if the call already has
    /// a terminal status.
    pub fn set_value(&mut self, value: T) {
        let Some(handle) = &self.handle else {
            log::warn!("set_value on an invalid promise, ignoring");
            return;
        };
        match encoding::encode_value(&value) {
            Ok(bytes) => handle.slot().set_ready_with_bytes(&bytes),
            Err(e) => {
                log::error!("promise value serialization failed: {e}");
                handle.slot().set_exception(FutureStatus::InternalError);
            }
        }
    }

    /// Fails the promise with `error`. (`Pending` / `Ready` cannot be
    /// expressed as [`RpcError`], so invalid transitions are unrepresentable
    /// here.)
    pub fn set_exception(&mut self, error: RpcError) {
        let Some(handle) = &self.handle else {
            log::warn!("set_exception on an invalid promise, ignoring");
            return;
        };
        handle.slot().set_exception(error.status());
    }

    /// Arms this promise as a *remote promise*: completion (or breaking) of
    /// the promise emits a response referencing `call_id` through `sender`.
    pub(crate) fn bind_remote(
        &mut self,
        type_info: &'static InterfaceTypeInfo,
        function_index: u8,
        call_id: u64,
        sender: Arc<dyn ResponseSender>,
    ) -> Result<()> {
        let handle = self.handle.as_ref().ok_or(RpcError::InvalidFuture)?;
        let slot = handle.slot();
        slot.rebind_as_response(type_info, function_index, call_id, true);
        let mut inner = slot.lock_inner();
        inner.sender = Some(sender);
        inner.armed = true;
        Ok(())
    }
}

impl<T> Promise<T> {
    /// True while this promise is attached to a slot.
    pub fn valid(&self) -> bool {
        self.handle.is_some()
    }
}

impl<T> Default for Promise<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("valid", &self.handle.is_some())
            .finish()
    }
}

/// Return types usable from promise-returning RPC methods: [`Promise`]
/// itself, or user types wrapping one (optionally with a serializable body
/// that travels alongside the correlation id, see
/// [`crate::return_value`]).
pub trait PromiseReturn: Send + Sized + 'static {
    /// The promised value type.
    type Value: Serialize + DeserializeOwned + Send + 'static;

    /// True when the type carries a serializable body besides the promise.
    const HAS_BODY: bool = false;

    fn from_promise(promise: Promise<Self::Value>) -> Self;

    fn promise(&self) -> &Promise<Self::Value>;

    fn promise_mut(&mut self) -> &mut Promise<Self::Value>;

    fn into_promise(self) -> Promise<Self::Value>;

    /// Serializes the body of a derived type.
    fn serialize_body(&self, _stream: &mut OutputStream<'_>) -> Result<()> {
        Ok(())
    }

    /// Reads the body of a derived type back.
    fn deserialize_body(&mut self, _stream: &mut InputStream<'_>) -> Result<()> {
        Ok(())
    }
}

impl<T> PromiseReturn for Promise<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Value = T;

    fn from_promise(promise: Promise<T>) -> Self {
        promise
    }

    fn promise(&self) -> &Promise<T> {
        self
    }

    fn promise_mut(&mut self) -> &mut Promise<T> {
        self
    }

    fn into_promise(self) -> Promise<T> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn promise_fulfils_future() {
        let mut promise = Promise::<i32>::new();
        let mut future = promise.future().unwrap();
        assert!(!future.ready());
        promise.set_value(16);
        assert!(future.ready());
        assert_eq!(future.get(Duration::from_secs(1)).unwrap(), 16);
        // The value was moved out; the future is no longer valid.
        assert!(!future.valid());
        assert_eq!(
            future.get(Duration::from_secs(1)).unwrap_err(),
            RpcError::InvalidFuture
        );
    }

    #[test]
    fn dropping_the_promise_breaks_the_future() {
        let promise = Promise::<i32>::new();
        let mut future = promise.future().unwrap();
        drop(promise);
        assert_eq!(
            future.get(Duration::from_millis(100)).unwrap_err(),
            RpcError::BrokenPromise
        );
    }

    #[test]
    fn split_halves_share_one_obligation() {
        let promise = Promise::<i32>::new();
        let mut future = promise.future().unwrap();
        let mut kept = promise.split();
        drop(promise);
        // The kept half is still alive, so the promise is not broken.
        assert!(!future.ready());
        kept.set_value(3);
        assert_eq!(future.get(Duration::from_secs(1)).unwrap(), 3);
    }

    #[test]
    fn blocking_get_wakes_on_set_value() {
        let mut promise = Promise::<String>::new();
        let mut future = promise.future().unwrap();
        let waiter = std::thread::spawn(move || future.get(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(50));
        promise.set_value("hello".to_string());
        assert_eq!(waiter.join().unwrap().unwrap(), "hello");
    }

    #[test]
    fn get_times_out_and_can_be_retried() {
        let mut promise = Promise::<i32>::new();
        let mut future = promise.future().unwrap();
        assert_eq!(
            future.get(Duration::from_millis(50)).unwrap_err(),
            RpcError::Timeout
        );
        // A timeout is consumer-side only: the call stays alive.
        assert!(future.valid());
        promise.set_value(1);
        assert_eq!(future.get(Duration::from_secs(1)).unwrap(), 1);
    }

    #[test]
    fn double_set_is_warn_and_ignore() {
        let mut promise = Promise::<i32>::new();
        let mut future = promise.future().unwrap();
        promise.set_value(1);
        promise.set_value(2);
        assert_eq!(future.get(Duration::from_secs(1)).unwrap(), 1);
    }

    #[test]
    fn exception_reaches_future() {
        let mut promise = Promise::<i32>::new();
        let mut future = promise.future().unwrap();
        promise.set_exception(RpcError::InvalidCall);
        assert_eq!(
            future.get(Duration::from_secs(1)).unwrap_err(),
            RpcError::InvalidCall
        );
    }

    #[test]
    fn only_one_thread_may_wait() {
        let promise = Promise::<i32>::new();
        let mut future = promise.future().unwrap();
        // A second consumer view of the same slot, bypassing the
        // one-future-per-call guard, to provoke the double-wait error.
        let second = future
            .handle
            .as_ref()
            .unwrap()
            .slot()
            .obtain_handle(HandleFlavor::Consumer);
        let mut second: Future<i32> = Future::from_handle(second);

        let waiter = std::thread::spawn(move || {
            let result = future.get(Duration::from_millis(500));
            assert_eq!(result.unwrap_err(), RpcError::Timeout);
        });
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(
            second.get(Duration::from_millis(10)).unwrap_err(),
            RpcError::InvalidCall
        );
        waiter.join().unwrap();
    }

    struct Recorder {
        responses: Arc<Mutex<Vec<i32>>>,
        errors: Arc<Mutex<Vec<RpcError>>>,
    }

    impl ResponseHandler<i32> for Recorder {
        fn handle_response(&mut self, value: i32) {
            self.responses.lock().unwrap().push(value);
        }

        fn handle_exception(&mut self, error: RpcError) {
            self.errors.lock().unwrap().push(error);
        }
    }

    #[test]
    fn callback_fires_exactly_once() {
        let responses = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));

        let mut promise = Promise::<i32>::new();
        let mut future = promise.future().unwrap();
        future.set_callback(Recorder {
            responses: responses.clone(),
            errors: errors.clone(),
        });
        promise.set_value(42);
        promise.set_value(43);
        assert_eq!(responses.lock().unwrap().as_slice(), &[42]);
        assert!(errors.lock().unwrap().is_empty());
    }

    #[test]
    fn callback_observes_broken_promise() {
        let responses = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));

        let promise = Promise::<i32>::new();
        let mut future = promise.future().unwrap();
        future.set_callback(Recorder {
            responses: responses.clone(),
            errors: errors.clone(),
        });
        drop(promise);
        assert_eq!(errors.lock().unwrap().as_slice(), &[RpcError::BrokenPromise]);
        assert!(responses.lock().unwrap().is_empty());
    }

    #[test]
    fn dropping_the_future_detaches_the_callback() {
        let responses = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));

        let mut promise = Promise::<i32>::new();
        let mut future = promise.future().unwrap();
        future.set_callback(Recorder {
            responses: responses.clone(),
            errors: errors.clone(),
        });
        drop(future);
        promise.set_value(1);
        assert!(responses.lock().unwrap().is_empty());
        assert!(errors.lock().unwrap().is_empty());
    }
}
