//! Client RPC port: typed façade used to call functions on a connected
//! server port.
//!
//! When the reachable counterpart is in the same process, calls execute
//! directly on the handler object. When it is a network element, the call
//! is packed into a storage slot and handed to the transport; the response
//! is matched back by call id and completes the future obtained here.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::encoding::{self, OutputStream};
use crate::error::{Result, RpcError};
use crate::future::{Future, HandlerAdapter, PromiseReturn, ResponseHandler};
use crate::method::{RpcInterface, RpcMethod};
use crate::port::{CreationInfo, PortFlags, RpcPort};
use crate::registry::RpcInterfaceType;
use crate::storage::{call_pool, CallBuffer};
use crate::DEFAULT_CALL_TIMEOUT;

/// What a call can currently reach from this port.
enum Reachable<T> {
    /// No server anywhere downstream.
    Nothing,
    /// A server in this process.
    Local(Arc<Mutex<T>>),
    /// A network element forwarding to another process.
    Network(Arc<RpcPort>),
}

/// Client RPC port for interface type `T`.
pub struct ClientPort<T> {
    port: Arc<RpcPort>,
    ty: RpcInterfaceType<T>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for ClientPort<T> {
    fn clone(&self) -> Self {
        Self {
            port: self.port.clone(),
            ty: self.ty,
            _marker: PhantomData,
        }
    }
}

impl<T: RpcInterface> ClientPort<T> {
    /// Creates a client port. The interface type of `T` must have been
    /// registered first.
    pub fn new(info: impl Into<CreationInfo>) -> Self {
        let ty = RpcInterfaceType::<T>::get()
            .expect("RPC interface type must be registered before creating ports");
        let creation = info
            .into()
            .with_flags(PortFlags::EMITS_DATA | PortFlags::OUTPUT_PORT);
        Self {
            port: RpcPort::new(creation, ty.info(), None),
            ty,
            _marker: PhantomData,
        }
    }

    /// Rebinds a type-less port as a client port of `T`. Fails when the
    /// port carries a different interface type, or (unless `ignore_flags`)
    /// when its flags are not client-shaped.
    pub fn wrap(port: Arc<RpcPort>, ignore_flags: bool) -> Result<Self> {
        let ty = RpcInterfaceType::<T>::get().ok_or(RpcError::InvalidCall)?;
        if !std::ptr::eq(port.data_type(), ty.info()) {
            log::error!(
                "cannot wrap port with interface type '{}' as '{}'",
                port.data_type().name(),
                ty.name()
            );
            return Err(RpcError::InvalidCall);
        }
        if !ignore_flags {
            let flags = port.flags();
            if !flags.contains(PortFlags::EMITS_DATA) || flags.contains(PortFlags::ACCEPTS_DATA) {
                log::error!("port '{}' does not have client flags", port.name());
                return Err(RpcError::InvalidCall);
            }
        }
        Ok(Self {
            port,
            ty,
            _marker: PhantomData,
        })
    }

    /// Wraps a port whose interface type is already known to match (used by
    /// the dispatch trampolines on receiving ports).
    pub(crate) fn wrap_unchecked(port: Arc<RpcPort>) -> Self {
        let ty = RpcInterfaceType::<T>::from_info(port.data_type());
        Self {
            port,
            ty,
            _marker: PhantomData,
        }
    }

    /// The wrapped type-less port.
    pub fn port(&self) -> &Arc<RpcPort> {
        &self.port
    }

    pub fn interface_type(&self) -> RpcInterfaceType<T> {
        self.ty
    }

    /// Connects this client port to a server port.
    pub fn connect_to(&self, server: &crate::server::ServerPort<T>) {
        match server.port() {
            Some(port) => self.port.connect_to(port),
            None => log::warn!("cannot connect '{}' to a deleted server port", self.port.name()),
        }
    }

    /// Connects this client port to any other port (proxy, network element).
    pub fn connect_to_port(&self, other: &Arc<RpcPort>) {
        self.port.connect_to(other);
    }

    /// Process-stable handle of the currently reachable server port, or 0
    /// when no server is reachable. Lets clients detect server failover.
    pub fn get_server_handle(&self) -> u32 {
        self.port
            .get_server(true)
            .map(|port| port.handle())
            .unwrap_or(0)
    }

    fn reachable(&self) -> Reachable<T> {
        match self.port.get_server(true) {
            None => Reachable::Nothing,
            Some(server) => match server.typed_handler::<T>() {
                Some(handler) => Reachable::Local(handler),
                None if server.flags().contains(PortFlags::NETWORK_ELEMENT) => {
                    Reachable::Network(server)
                }
                None => {
                    log::error!("server port '{}' has no call handler", server.name());
                    Reachable::Nothing
                }
            },
        }
    }

    fn invoke_local<M, F>(handler: &Arc<Mutex<T>>, function: F, args: F::Args) -> Result<F::Ret>
    where
        F: RpcMethod<T, M>,
    {
        let mut guard = handler.lock().unwrap();
        function.invoke(&mut guard, args)
    }

    /// Calls the function ignoring any return value or error — in other
    /// words, sends a message. Silently dropped when no server is
    /// reachable.
    pub fn call<M, F>(&self, function: F, args: F::Args)
    where
        F: RpcMethod<T, M>,
    {
        match self.reachable() {
            Reachable::Nothing => {}
            Reachable::Local(handler) => {
                if let Err(error) = Self::invoke_local(&handler, function, args) {
                    log::debug!("fire-and-forget call failed: {error}");
                }
            }
            Reachable::Network(network) => {
                let Ok(function_id) = self.ty.function_id(function) else {
                    return;
                };
                let Ok(args_buf) = encode_args(&args) else {
                    return;
                };
                let handle = call_pool().acquire();
                handle.slot().install_message(
                    self.ty.info(),
                    function_id,
                    args_buf,
                    self.port.handle(),
                );
                let _ = network.send_call(handle);
            }
        }
    }

    /// Calls the function asynchronously; the result (or error) is
    /// forwarded to the response handler.
    pub fn call_async<M, F, H>(&self, handler: H, function: F, args: F::Args)
    where
        F: RpcMethod<T, M>,
        F::Ret: Serialize + DeserializeOwned + Send + 'static,
        H: ResponseHandler<F::Ret> + 'static,
    {
        let mut handler = handler;
        match self.reachable() {
            Reachable::Nothing => handler.handle_exception(RpcError::NoConnection),
            Reachable::Local(local) => match Self::invoke_local(&local, function, args) {
                Ok(value) => handler.handle_response(value),
                Err(error) => handler.handle_exception(error),
            },
            Reachable::Network(network) => {
                let function_id = match self.ty.function_id(function) {
                    Ok(id) => id,
                    Err(error) => return handler.handle_exception(error),
                };
                let args_buf = match encode_args(&args) {
                    Ok(buf) => buf,
                    Err(error) => return handler.handle_exception(error),
                };
                let handle = call_pool().acquire();
                handle.slot().install_request(
                    self.ty.info(),
                    function_id,
                    args_buf,
                    DEFAULT_CALL_TIMEOUT,
                    self.port.handle(),
                );
                handle.slot().lock_inner().handler =
                    Some(Box::new(HandlerAdapter::new(handler)));
                let _ = network.send_call(handle);
            }
        }
    }

    /// Calls the function, blocking until the return value is available or
    /// `timeout` expires.
    pub fn call_sync<M, F>(&self, timeout: Duration, function: F, args: F::Args) -> Result<F::Ret>
    where
        F: RpcMethod<T, M>,
        F::Ret: Serialize + DeserializeOwned + Send + 'static,
    {
        match self.reachable() {
            Reachable::Nothing => Err(RpcError::NoConnection),
            Reachable::Local(handler) => Self::invoke_local(&handler, function, args),
            Reachable::Network(network) => {
                let function_id = self.ty.function_id(function)?;
                let args_buf = encode_args(&args)?;
                let mut future: Future<F::Ret> =
                    self.remote_request_future(&network, function_id, timeout, args_buf);
                future.get(timeout)
            }
        }
    }

    /// Calls the function and returns a future for the result.
    pub fn future_call<M, F>(&self, function: F, args: F::Args) -> Future<F::Ret>
    where
        F: RpcMethod<T, M>,
        F::Ret: Serialize + DeserializeOwned + Send + 'static,
    {
        match self.reachable() {
            Reachable::Nothing => Future::preloaded_exception(RpcError::NoConnection),
            Reachable::Local(handler) => {
                let result = Self::invoke_local(&handler, function, args);
                let handle = call_pool().acquire();
                handle
                    .slot()
                    .install_response(Some(self.ty.info()), 0, 0, false);
                let future = match handle.slot().obtain_future() {
                    Ok(future) => future,
                    Err(error) => return Future::preloaded_exception(error),
                };
                match result.and_then(|value| encoding::encode_value(&value)) {
                    Ok(bytes) => handle.slot().set_ready_with_bytes(&bytes),
                    Err(error) => handle.slot().set_exception(error.status()),
                }
                future
            }
            Reachable::Network(network) => {
                let function_id = match self.ty.function_id(function) {
                    Ok(id) => id,
                    Err(error) => return Future::preloaded_exception(error),
                };
                let args_buf = match encode_args(&args) {
                    Ok(buf) => buf,
                    Err(error) => return Future::preloaded_exception(error),
                };
                self.remote_request_future(&network, function_id, DEFAULT_CALL_TIMEOUT, args_buf)
            }
        }
    }

    /// Call mode for functions that already return a [`Future<V>`]: the
    /// server-side future is forwarded, and sending of the response is
    /// deferred until it becomes ready.
    pub fn native_future_call<M, F, V>(&self, function: F, args: F::Args) -> Future<V>
    where
        F: RpcMethod<T, M, Ret = Future<V>>,
        V: Serialize + DeserializeOwned + Send + 'static,
    {
        match self.reachable() {
            Reachable::Nothing => Future::preloaded_exception(RpcError::NoConnection),
            Reachable::Local(handler) => match Self::invoke_local(&handler, function, args) {
                Ok(future) => future,
                Err(error) => Future::preloaded_exception(error),
            },
            Reachable::Network(network) => {
                self.remote_value_future::<M, F, V>(&network, function, args)
            }
        }
    }

    /// Call mode for promise-returning functions (spelled `future_call` for
    /// plain returns): yields a future for the promised value. The server
    /// keeps the producer half and fulfils — or breaks — it later.
    pub fn promise_call<M, F, P>(&self, function: F, args: F::Args) -> Future<P::Value>
    where
        F: RpcMethod<T, M, Ret = P>,
        P: PromiseReturn,
    {
        match self.reachable() {
            Reachable::Nothing => Future::preloaded_exception(RpcError::NoConnection),
            Reachable::Local(handler) => match Self::invoke_local(&handler, function, args) {
                Ok(value) => {
                    let promise = value.into_promise();
                    match promise.future() {
                        Ok(future) => future,
                        Err(error) => Future::preloaded_exception(error),
                    }
                }
                Err(error) => Future::preloaded_exception(error),
            },
            Reachable::Network(network) => {
                self.remote_value_future::<M, F, P::Value>(&network, function, args)
            }
        }
    }

    fn remote_value_future<M, F, V>(
        &self,
        network: &Arc<RpcPort>,
        function: F,
        args: F::Args,
    ) -> Future<V>
    where
        F: RpcMethod<T, M>,
        V: Serialize + DeserializeOwned + Send + 'static,
    {
        let function_id = match self.ty.function_id(function) {
            Ok(id) => id,
            Err(error) => return Future::preloaded_exception(error),
        };
        let args_buf = match encode_args(&args) {
            Ok(buf) => buf,
            Err(error) => return Future::preloaded_exception(error),
        };
        self.remote_request_future(network, function_id, DEFAULT_CALL_TIMEOUT, args_buf)
    }

    /// Packs a request into a storage slot, obtains its future and hands
    /// the call to the transport.
    fn remote_request_future<V>(
        &self,
        network: &Arc<RpcPort>,
        function_id: u8,
        timeout: Duration,
        args_buf: CallBuffer,
    ) -> Future<V>
    where
        V: Serialize + DeserializeOwned + Send + 'static,
    {
        let handle = call_pool().acquire();
        handle.slot().install_request(
            self.ty.info(),
            function_id,
            args_buf,
            timeout,
            self.port.handle(),
        );
        let future = match handle.slot().obtain_future() {
            Ok(future) => future,
            Err(error) => return Future::preloaded_exception(error),
        };
        // On a send failure the handle is consumed and its producer release
        // breaks the promise, which the future observes.
        let _ = network.send_call(handle);
        future
    }
}

impl<T> std::fmt::Debug for ClientPort<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ClientPort").field(&self.port).finish()
    }
}

fn encode_args<A: Serialize>(args: &A) -> Result<CallBuffer> {
    let mut buf = CallBuffer::new();
    OutputStream::new(&mut buf).write_value(args)?;
    Ok(buf)
}
