//! Server RPC port: accepts and handles calls from connected clients.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::error::{Result, RpcError};
use crate::method::RpcInterface;
use crate::port::{CreationInfo, PortFlags, RpcPort};
use crate::registry::RpcInterfaceType;

/// Server RPC port for interface type `T`.
///
/// Binds a shared handler object; calls arriving at this port are invoked
/// on it under its mutex, possibly from a transport thread.
pub struct ServerPort<T> {
    port: Option<Arc<RpcPort>>,
    handler: Arc<Mutex<T>>,
    _marker: PhantomData<fn(T)>,
}

impl<T: RpcInterface> ServerPort<T> {
    /// Creates a server port bound to `handler`. If the creation info
    /// carries the `DELETED` flag, no underlying port is created.
    pub fn new(handler: Arc<Mutex<T>>, info: impl Into<CreationInfo>) -> Self {
        let ty = RpcInterfaceType::<T>::get()
            .expect("RPC interface type must be registered before creating ports");
        let creation = info.into();
        if creation.flags.contains(PortFlags::DELETED) {
            return Self {
                port: None,
                handler,
                _marker: PhantomData,
            };
        }
        let creation = creation.with_flags(PortFlags::ACCEPTS_DATA);
        let erased: Arc<dyn Any + Send + Sync> = handler.clone();
        Self {
            port: Some(RpcPort::new(creation, ty.info(), Some(erased))),
            handler,
            _marker: PhantomData,
        }
    }

    /// Rebinds a type-less port as a server port of `T`. Fails when the
    /// port carries a different interface type, is not server-shaped, or
    /// has no handler of type `T`.
    pub fn wrap(port: Arc<RpcPort>) -> Result<Self> {
        let ty = RpcInterfaceType::<T>::get().ok_or(RpcError::InvalidCall)?;
        if !std::ptr::eq(port.data_type(), ty.info()) {
            log::error!(
                "cannot wrap port with interface type '{}' as '{}'",
                port.data_type().name(),
                ty.name()
            );
            return Err(RpcError::InvalidCall);
        }
        if !port.is_server() {
            log::error!("port '{}' does not have server flags", port.name());
            return Err(RpcError::InvalidCall);
        }
        let handler = port.typed_handler::<T>().ok_or_else(|| {
            log::error!("port '{}' has no handler of the expected type", port.name());
            RpcError::InvalidCall
        })?;
        Ok(Self {
            port: Some(port),
            handler,
            _marker: PhantomData,
        })
    }

    /// The wrapped type-less port; `None` when created with `DELETED`.
    pub fn port(&self) -> Option<&Arc<RpcPort>> {
        self.port.as_ref()
    }

    /// The handler object calls are dispatched to.
    pub fn handler(&self) -> &Arc<Mutex<T>> {
        &self.handler
    }
}

impl<T> std::fmt::Debug for ServerPort<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPort")
            .field("port", &self.port)
            .finish()
    }
}
