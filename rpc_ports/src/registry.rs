//! Per-interface-type method registry.
//!
//! An interface type is introduced exactly once, through the builder:
//!
//! ```ignore
//! static ROBOT_TYPE: LazyLock<RpcInterfaceType<Robot>> = LazyLock::new(|| {
//!     RpcInterfaceType::builder("Robot")
//!         .method(Robot::set_speed)
//!         .method(Robot::pose)
//!         .register()
//! });
//! ```
//!
//! Registration walks the methods in declaration order, assigns each the
//! next `function_id` (a `u8`, so an interface is limited to 256 methods)
//! and derives the three dispatch trampolines — message, request and
//! response deserialization — monomorphized against the method's signature.
//! The resulting table is leaked into a process-wide registry that is
//! written once per type and read-only afterwards.

use std::any::{Any, TypeId};
use std::sync::{Arc, LazyLock, RwLock};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::encoding::{self, InputStream};
use crate::error::{FutureStatus, Result, RpcError};
use crate::future::{Future, PromiseReturn};
use crate::method::{RpcInterface, RpcMethod};
use crate::port::{ResponseSender, RpcPort};
use crate::storage::{call_pool, CallHandle};

/// Run-time classification of a registered type. Transports recognize RPC
/// interface types by classification `Other` together with a fixed size of
/// zero and route call buffers accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClassification {
    /// Plain data type with a binary representation.
    Data,
    /// Anything else; RPC interfaces fall in here.
    Other,
}

/// Deserializes and executes a fire-and-forget message.
pub type DeserializeMessageFn =
    fn(&mut InputStream<'_>, &Arc<RpcPort>, u8) -> Result<()>;

/// Deserializes and executes a request, handing the response to the sender.
pub type DeserializeRequestFn =
    fn(&mut InputStream<'_>, &Arc<RpcPort>, u8, &Arc<dyn ResponseSender>) -> Result<()>;

/// Deserializes a response and completes the matching request slot.
pub type DeserializeResponseFn = fn(
    &mut InputStream<'_>,
    &'static InterfaceTypeInfo,
    u8,
    &Arc<dyn ResponseSender>,
    Option<CallHandle>,
) -> Result<()>;

/// One registered method: its identity, the erased function value and the
/// three dispatch trampolines.
pub(crate) struct MethodEntry {
    pub key: TypeId,
    pub method: Box<dyn Any + Send + Sync>,
    pub deserialize_message: DeserializeMessageFn,
    pub deserialize_request: DeserializeRequestFn,
    pub deserialize_response: DeserializeResponseFn,
}

/// Type-erased record of a registered RPC interface type.
pub struct InterfaceTypeInfo {
    name: String,
    rtti: TypeId,
    classification: TypeClassification,
    fixed_size: usize,
    methods: Vec<MethodEntry>,
}

impl InterfaceTypeInfo {
    /// Stable name of the interface type, shared across processes.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn classification(&self) -> TypeClassification {
        self.classification
    }

    /// Reported fixed size; always zero for RPC interface types.
    pub fn fixed_size(&self) -> usize {
        self.fixed_size
    }

    /// Is this type an RPC interface type?
    pub fn is_rpc_type(&self) -> bool {
        self.fixed_size == 0 && self.classification == TypeClassification::Other
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub(crate) fn rtti(&self) -> TypeId {
        self.rtti
    }

    pub(crate) fn entry(&self, function_id: u8) -> Option<&MethodEntry> {
        self.methods.get(function_id as usize)
    }
}

impl std::fmt::Debug for InterfaceTypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceTypeInfo")
            .field("name", &self.name)
            .field("methods", &self.methods.len())
            .finish()
    }
}

static REGISTRY: LazyLock<RwLock<Vec<&'static InterfaceTypeInfo>>> =
    LazyLock::new(|| RwLock::new(Vec::new()));

/// Looks an interface type up by its wire name.
pub fn find_type(name: &str) -> Option<&'static InterfaceTypeInfo> {
    REGISTRY
        .read()
        .unwrap()
        .iter()
        .copied()
        .find(|info| info.name == name)
}

fn find_type_by_rtti(rtti: TypeId) -> Option<&'static InterfaceTypeInfo> {
    REGISTRY
        .read()
        .unwrap()
        .iter()
        .copied()
        .find(|info| info.rtti == rtti)
}

/// Typed view of a registered interface type.
pub struct RpcInterfaceType<T> {
    info: &'static InterfaceTypeInfo,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for RpcInterfaceType<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RpcInterfaceType<T> {}

impl<T: RpcInterface> RpcInterfaceType<T> {
    /// Starts registration of interface type `T` under `name`.
    pub fn builder(name: &str) -> InterfaceTypeBuilder<T> {
        InterfaceTypeBuilder {
            name: name.to_string(),
            methods: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// The registered type for `T`, if any.
    pub fn get() -> Option<Self> {
        find_type_by_rtti(TypeId::of::<T>()).map(|info| Self {
            info,
            _marker: PhantomData,
        })
    }

    /// Typed view over an info record already known to belong to `T`.
    pub(crate) fn from_info(info: &'static InterfaceTypeInfo) -> Self {
        debug_assert_eq!(info.rtti(), TypeId::of::<T>());
        Self {
            info,
            _marker: PhantomData,
        }
    }

    pub fn info(&self) -> &'static InterfaceTypeInfo {
        self.info
    }

    pub fn name(&self) -> &str {
        self.info.name()
    }

    /// Looks up the function id of a registered method. Fails with
    /// `InvalidCall` for methods that were not registered for `T`.
    pub fn function_id<M, F: RpcMethod<T, M>>(&self, function: F) -> Result<u8> {
        let key = function.key();
        self.info
            .methods
            .iter()
            .position(|entry| entry.key == key)
            .map(|index| index as u8)
            .ok_or_else(|| {
                log::error!(
                    "method is not registered for interface type '{}'",
                    self.info.name
                );
                RpcError::InvalidCall
            })
    }
}

impl<T> std::fmt::Debug for RpcInterfaceType<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RpcInterfaceType").field(&self.info).finish()
    }
}

/// Builder collecting the methods of an interface type in declaration
/// order. Finish with [`InterfaceTypeBuilder::register`].
pub struct InterfaceTypeBuilder<T> {
    name: String,
    methods: Vec<MethodEntry>,
    _marker: PhantomData<fn(T)>,
}

impl<T: RpcInterface> InterfaceTypeBuilder<T> {
    /// Registers a method with a plain (serializable or unit) return type.
    pub fn method<M, F>(mut self, function: F) -> Self
    where
        M: 'static,
        F: RpcMethod<T, M>,
        F::Ret: Serialize + DeserializeOwned + Send + 'static,
    {
        self.push(MethodEntry {
            key: function.key(),
            method: Box::new(function),
            deserialize_message: message_trampoline::<T, M, F>,
            deserialize_request: request_trampoline_plain::<T, M, F>,
            deserialize_response: response_trampoline_value::<F::Ret>,
        });
        self
    }

    /// Registers a method whose declared return type is already a
    /// [`Future<V>`]: the server invocation returns that future directly and
    /// the response is sent once it becomes ready.
    pub fn future_method<M, F, V>(mut self, function: F) -> Self
    where
        M: 'static,
        F: RpcMethod<T, M, Ret = Future<V>>,
        V: Serialize + DeserializeOwned + Send + 'static,
    {
        self.push(MethodEntry {
            key: function.key(),
            method: Box::new(function),
            deserialize_message: message_trampoline::<T, M, F>,
            deserialize_request: request_trampoline_future::<T, M, F, V>,
            deserialize_response: response_trampoline_value::<V>,
        });
        self
    }

    /// Registers a method returning a promise (or a type wrapping one): the
    /// server keeps the obligation and the response is sent on fulfilment.
    pub fn promise_method<M, F, P>(mut self, function: F) -> Self
    where
        M: 'static,
        F: RpcMethod<T, M, Ret = P>,
        P: PromiseReturn,
    {
        self.push(MethodEntry {
            key: function.key(),
            method: Box::new(function),
            deserialize_message: message_trampoline::<T, M, F>,
            deserialize_request: request_trampoline_promise::<T, M, F, P>,
            deserialize_response: response_trampoline_value::<P::Value>,
        });
        self
    }

    fn push(&mut self, entry: MethodEntry) {
        assert!(
            self.methods.len() < u8::MAX as usize + 1,
            "an RPC interface may not declare more than 256 methods"
        );
        assert!(
            !self.methods.iter().any(|m| m.key == entry.key),
            "method registered twice for interface type '{}'",
            self.name
        );
        self.methods.push(entry);
    }

    /// Publishes the type into the process-wide registry.
    ///
    /// Panics if `T` or the name was registered before; registration happens
    /// exactly once per interface type, at program start.
    pub fn register(self) -> RpcInterfaceType<T> {
        let mut registry = REGISTRY.write().unwrap();
        assert!(
            !registry.iter().any(|info| info.rtti == TypeId::of::<T>()),
            "attempt to initialize RPC type '{}' twice",
            self.name
        );
        assert!(
            !registry.iter().any(|info| info.name == self.name),
            "RPC type name '{}' is already taken",
            self.name
        );
        let info: &'static InterfaceTypeInfo = Box::leak(Box::new(InterfaceTypeInfo {
            name: self.name,
            rtti: TypeId::of::<T>(),
            classification: TypeClassification::Other,
            fixed_size: 0,
            methods: self.methods,
        }));
        registry.push(info);
        log::debug!(
            "registered RPC type '{}' with {} methods",
            info.name,
            info.methods.len()
        );
        RpcInterfaceType {
            info,
            _marker: PhantomData,
        }
    }
}

fn lookup_method<T, M, F>(info: &'static InterfaceTypeInfo, function_id: u8) -> Result<F>
where
    T: RpcInterface,
    F: RpcMethod<T, M>,
{
    let entry = info.entry(function_id).ok_or(RpcError::InvalidCall)?;
    entry
        .method
        .downcast_ref::<F>()
        .copied()
        .ok_or(RpcError::InvalidCall)
}

/// Reads the argument tuple and invokes the fire-and-forget call path on a
/// client-port view of the receiving port.
fn message_trampoline<T, M, F>(
    stream: &mut InputStream<'_>,
    port: &Arc<RpcPort>,
    function_id: u8,
) -> Result<()>
where
    T: RpcInterface,
    M: 'static,
    F: RpcMethod<T, M>,
{
    let args: F::Args = stream.read_value()?;
    let function: F = lookup_method::<T, M, F>(port.data_type(), function_id)?;
    let client = crate::client::ClientPort::<T>::wrap_unchecked(port.clone());
    client.call(function, args);
    Ok(())
}

/// Reads call id, timeout and arguments, executes the call synchronously and
/// hands the response to the sender.
fn request_trampoline_plain<T, M, F>(
    stream: &mut InputStream<'_>,
    port: &Arc<RpcPort>,
    function_id: u8,
    sender: &Arc<dyn ResponseSender>,
) -> Result<()>
where
    T: RpcInterface,
    M: 'static,
    F: RpcMethod<T, M>,
    F::Ret: Serialize + DeserializeOwned + Send + 'static,
{
    let call_id = stream.read_u64()?;
    let timeout = stream.read_duration()?;
    let args: F::Args = stream.read_value()?;
    let function: F = lookup_method::<T, M, F>(port.data_type(), function_id)?;
    let client = crate::client::ClientPort::<T>::wrap_unchecked(port.clone());
    let result = client.call_sync(timeout, function, args);

    let response = call_pool().acquire();
    response
        .slot()
        .install_response(Some(port.data_type()), function_id, call_id, false);
    match result {
        Ok(value) => {
            let bytes = encoding::encode_value(&value)?;
            response.slot().set_ready_with_bytes(&bytes);
        }
        Err(error) => response.slot().set_exception(error.status()),
    }
    sender.send_response(response);
    Ok(())
}

/// Request path for methods returning `Future<V>`: the returned future's
/// slot is rebound as the response and enqueued gated on its own status, so
/// sending is deferred until the inner future becomes ready.
fn request_trampoline_future<T, M, F, V>(
    stream: &mut InputStream<'_>,
    port: &Arc<RpcPort>,
    function_id: u8,
    sender: &Arc<dyn ResponseSender>,
) -> Result<()>
where
    T: RpcInterface,
    M: 'static,
    F: RpcMethod<T, M, Ret = Future<V>>,
    V: Serialize + DeserializeOwned + Send + 'static,
{
    let call_id = stream.read_u64()?;
    let _timeout = stream.read_duration()?;
    let args: F::Args = stream.read_value()?;
    let function: F = lookup_method::<T, M, F>(port.data_type(), function_id)?;
    let client = crate::client::ClientPort::<T>::wrap_unchecked(port.clone());
    let mut future = client.native_future_call(function, args);
    let handle = future.take_handle().ok_or(RpcError::Internal)?;
    handle
        .slot()
        .rebind_as_response(port.data_type(), function_id, call_id, false);
    handle.slot().gate_on_status();
    sender.send_response(handle);
    Ok(())
}

/// Request path for promise-returning methods; like the native-future path,
/// with the promise flag set on the deferred response.
fn request_trampoline_promise<T, M, F, P>(
    stream: &mut InputStream<'_>,
    port: &Arc<RpcPort>,
    function_id: u8,
    sender: &Arc<dyn ResponseSender>,
) -> Result<()>
where
    T: RpcInterface,
    M: 'static,
    F: RpcMethod<T, M, Ret = P>,
    P: PromiseReturn,
{
    let call_id = stream.read_u64()?;
    let _timeout = stream.read_duration()?;
    let args: F::Args = stream.read_value()?;
    let function: F = lookup_method::<T, M, F>(port.data_type(), function_id)?;
    let client = crate::client::ClientPort::<T>::wrap_unchecked(port.clone());
    let mut future = client.promise_call(function, args);
    let handle = future.take_handle().ok_or(RpcError::Internal)?;
    handle
        .slot()
        .rebind_as_response(port.data_type(), function_id, call_id, true);
    handle.slot().gate_on_status();
    sender.send_response(handle);
    Ok(())
}

/// Response path: reads the promise flag and status; on READY validates the
/// value and stores its encoded form into the matching request slot, on an
/// exception status propagates it. A response without a matching request is
/// read and discarded.
fn response_trampoline_value<V>(
    stream: &mut InputStream<'_>,
    _info: &'static InterfaceTypeInfo,
    _function_id: u8,
    _sender: &Arc<dyn ResponseSender>,
    request: Option<CallHandle>,
) -> Result<()>
where
    V: Serialize + DeserializeOwned + Send + 'static,
{
    let _promise_response = stream.read_bool()?;
    let status = FutureStatus::from_u8(stream.read_u8()?).ok_or(RpcError::InvalidData)?;
    match status {
        FutureStatus::Ready => {
            let start = stream.position();
            match stream.read_value::<V>() {
                Ok(_) => {
                    if let Some(request) = request {
                        let bytes = stream.bytes_between(start, stream.position());
                        request.slot().set_ready_with_bytes(bytes);
                    }
                }
                Err(error) => {
                    if let Some(request) = request {
                        request
                            .slot()
                            .set_exception(FutureStatus::InvalidDataReceived);
                    }
                    return Err(error);
                }
            }
        }
        FutureStatus::Pending => return Err(RpcError::InvalidData),
        status => {
            if let Some(request) = request {
                request.slot().set_exception(status);
            }
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    struct Counter {
        hits: u32,
    }

    impl RpcInterface for Counter {}

    impl Counter {
        fn bump(&mut self, by: u32) -> Result<u32> {
            self.hits += by;
            Ok(self.hits)
        }

        fn hits(&mut self) -> Result<u32> {
            Ok(self.hits)
        }
    }

    fn unregistered(_: &mut Counter) -> Result<u32> {
        Ok(0)
    }

    static COUNTER_TYPE: LazyLock<RpcInterfaceType<Counter>> = LazyLock::new(|| {
        RpcInterfaceType::builder("registry.Counter")
            .method(Counter::bump)
            .method(Counter::hits)
            .register()
    });

    #[test]
    fn ids_follow_declaration_order_and_stay_stable() {
        let ty = *COUNTER_TYPE;
        assert_eq!(ty.function_id(Counter::bump).unwrap(), 0);
        assert_eq!(ty.function_id(Counter::hits).unwrap(), 1);
        // Lookup is constant for the lifetime of the process.
        assert_eq!(ty.function_id(Counter::bump).unwrap(), 0);
        assert_eq!(ty.info().method_count(), 2);
    }

    #[test]
    fn type_is_found_by_name_and_by_type() {
        let ty = *COUNTER_TYPE;
        let by_name = find_type("registry.Counter").unwrap();
        assert!(std::ptr::eq(by_name, ty.info()));
        assert!(RpcInterfaceType::<Counter>::get().is_some());
        assert!(by_name.is_rpc_type());
        assert_eq!(by_name.fixed_size(), 0);
        assert_eq!(by_name.classification(), TypeClassification::Other);
    }

    #[test]
    fn unregistered_method_lookup_fails() {
        let ty = *COUNTER_TYPE;
        assert_eq!(
            ty.function_id(unregistered as fn(&mut Counter) -> Result<u32>)
                .unwrap_err(),
            RpcError::InvalidCall
        );
    }

    struct Twice;

    impl RpcInterface for Twice {}

    impl Twice {
        fn noop(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    #[should_panic(expected = "twice")]
    fn double_registration_panics() {
        let _ = RpcInterfaceType::<Twice>::builder("registry.Twice")
            .method(Twice::noop)
            .register();
        let _ = RpcInterfaceType::<Twice>::builder("registry.Twice")
            .method(Twice::noop)
            .register();
    }
}
