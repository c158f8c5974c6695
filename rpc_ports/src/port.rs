//! Type-less RPC port, layered on a minimal framework-element surface.
//!
//! Ports live in an element graph and are connected by directed edges that
//! point from clients toward servers. A port is server-shaped when it
//! accepts and does not emit data, client-shaped in the opposite case, and
//! proxy-shaped when both flags are set. Network elements are proxy-shaped
//! ports with a transport hook: calls handed to them leave the process.

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bitflags::bitflags;

use crate::error::{Result, RpcError};
use crate::registry::InterfaceTypeInfo;
use crate::storage::CallHandle;

bitflags! {
    /// Framework-element flags relevant to RPC ports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortFlags: u32 {
        const ACCEPTS_DATA = 1 << 0;
        const EMITS_DATA = 1 << 1;
        const OUTPUT_PORT = 1 << 2;
        const NETWORK_ELEMENT = 1 << 3;
        const DELETED = 1 << 4;
    }
}

/// Direction decision for a new edge between two ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDirection {
    /// Edge from `self` toward the partner.
    ToTarget,
    /// Edge from the partner toward `self`.
    ToSource,
    /// Neither side can decide; the default policy applies.
    Unspecified,
}

/// Properties a port is created with.
#[derive(Debug, Clone)]
pub struct CreationInfo {
    pub name: String,
    pub flags: PortFlags,
}

impl CreationInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: PortFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: PortFlags) -> Self {
        self.flags |= flags;
        self
    }
}

impl From<&str> for CreationInfo {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for CreationInfo {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// Transport hook of a network-element port: forwards serialized calls to
/// another process.
pub trait CallSender: Send + Sync {
    fn send_call(&self, call: CallHandle);
}

/// Capability to emit a response back to the original caller. Handed to the
/// deserialization entry points by the transport; also attached to slots
/// whose completion is deferred (promises, native futures).
pub trait ResponseSender: Send + Sync {
    fn send_response(&self, response: CallHandle);
}

static NEXT_PORT_HANDLE: AtomicU32 = AtomicU32::new(1);

/// Type-less RPC port.
///
/// Server ports carry the handler object, network ports carry the transport
/// hook, client ports carry neither.
pub struct RpcPort {
    name: String,
    handle: u32,
    flags: PortFlags,
    data_type: &'static InterfaceTypeInfo,
    call_handler: Option<Arc<dyn Any + Send + Sync>>,
    sender: Option<Box<dyn CallSender>>,
    outgoing: Mutex<Vec<Weak<RpcPort>>>,
    incoming: Mutex<Vec<Weak<RpcPort>>>,
}

impl RpcPort {
    /// Creates a port. `call_handler` is the server-side handler object
    /// (type-erased `Arc<Mutex<T>>`), absent on client and network ports.
    pub fn new(
        info: CreationInfo,
        data_type: &'static InterfaceTypeInfo,
        call_handler: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: info.name,
            handle: NEXT_PORT_HANDLE.fetch_add(1, Ordering::Relaxed),
            flags: info.flags,
            data_type,
            call_handler,
            sender: None,
            outgoing: Mutex::new(Vec::new()),
            incoming: Mutex::new(Vec::new()),
        })
    }

    /// Creates a network-element port forwarding calls through `sender`.
    pub fn network(
        info: CreationInfo,
        data_type: &'static InterfaceTypeInfo,
        sender: Box<dyn CallSender>,
    ) -> Arc<Self> {
        let flags = info.flags
            | PortFlags::ACCEPTS_DATA
            | PortFlags::EMITS_DATA
            | PortFlags::NETWORK_ELEMENT;
        Arc::new(Self {
            name: info.name,
            handle: NEXT_PORT_HANDLE.fetch_add(1, Ordering::Relaxed),
            flags,
            data_type,
            call_handler: None,
            sender: Some(sender),
            outgoing: Mutex::new(Vec::new()),
            incoming: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process-stable handle of this port (non-zero).
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn flags(&self) -> PortFlags {
        self.flags
    }

    pub fn data_type(&self) -> &'static InterfaceTypeInfo {
        self.data_type
    }

    /// Is this a server RPC port?
    pub fn is_server(&self) -> bool {
        self.flags.contains(PortFlags::ACCEPTS_DATA) && !self.flags.contains(PortFlags::EMITS_DATA)
    }

    /// The object that handles calls on the server side, if any.
    pub fn call_handler(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.call_handler.as_ref()
    }

    /// Downcasts the handler to its concrete interface type.
    pub(crate) fn typed_handler<T: Send + 'static>(&self) -> Option<Arc<Mutex<T>>> {
        let handler = self.call_handler.as_ref()?.clone();
        handler.downcast::<Mutex<T>>().ok()
    }

    /// Sends a call to another process. Only network-element ports override
    /// the transport hook; calling this on any other port is an error.
    pub fn send_call(&self, call: CallHandle) -> Result<()> {
        match &self.sender {
            Some(sender) => {
                sender.send_call(call);
                Ok(())
            }
            None => {
                log::error!("port '{}' is not a network port", self.name);
                Err(RpcError::InvalidCall)
            }
        }
    }

    fn first_outgoing(&self) -> Option<Arc<RpcPort>> {
        self.outgoing
            .lock()
            .unwrap()
            .iter()
            .find_map(|edge| edge.upgrade())
    }

    /// Walks outgoing edges through proxies and returns the first reachable
    /// server port — or, with `include_network_ports`, the first
    /// network-element port. Usually called on client ports.
    ///
    /// The walk takes each port's edge lock only for the single-edge read,
    /// so it observes a stable snapshot per hop but no global graph lock.
    pub fn get_server(self: &Arc<Self>, include_network_ports: bool) -> Option<Arc<RpcPort>> {
        let mut current = self.clone();
        loop {
            let next = current.first_outgoing()?;
            if Arc::ptr_eq(&next, &current) {
                return None;
            }
            current = next;
            if current.is_server()
                || (include_network_ports && current.flags.contains(PortFlags::NETWORK_ELEMENT))
            {
                return Some(current);
            }
        }
    }

    /// Decides the direction for an edge to `other`: toward whichever side
    /// already reaches a server. If both do, warns and leaves the decision
    /// to the default policy.
    pub fn infer_connect_direction(self: &Arc<Self>, other: &Arc<RpcPort>) -> ConnectDirection {
        let this_side = self.is_server()
            || self.flags.contains(PortFlags::NETWORK_ELEMENT)
            || self.get_server(false).is_some();
        let other_side = other.is_server()
            || other.flags.contains(PortFlags::NETWORK_ELEMENT)
            || other.get_server(false).is_some();
        match (this_side, other_side) {
            (true, true) => {
                log::warn!(
                    "both ports ('{}' and '{}') are connected to a server already",
                    self.name,
                    other.name
                );
                ConnectDirection::Unspecified
            }
            (true, false) => ConnectDirection::ToSource,
            (false, true) => ConnectDirection::ToTarget,
            (false, false) => ConnectDirection::Unspecified,
        }
    }

    /// Connects two ports, pointing the edge toward the server side.
    pub fn connect_to(self: &Arc<Self>, other: &Arc<RpcPort>) {
        let direction = self.infer_connect_direction(other);
        let (source, destination) = match direction {
            ConnectDirection::ToTarget => (self, other),
            ConnectDirection::ToSource => (other, self),
            ConnectDirection::Unspecified => (self, other),
        };
        source.on_connect(destination);
        source
            .outgoing
            .lock()
            .unwrap()
            .push(Arc::downgrade(destination));
        destination
            .incoming
            .lock()
            .unwrap()
            .push(Arc::downgrade(source));
    }

    /// A client port keeps at most one outgoing edge: connecting to a new
    /// downstream partner disconnects any previous one.
    fn on_connect(self: &Arc<Self>, partner: &Arc<RpcPort>) {
        let stale: Vec<Arc<RpcPort>> = {
            let outgoing = self.outgoing.lock().unwrap();
            outgoing
                .iter()
                .filter_map(|edge| edge.upgrade())
                .filter(|existing| !Arc::ptr_eq(existing, partner))
                .collect()
        };
        for existing in stale {
            log::warn!(
                "port '{}' was already connected to '{}'; removing that connection in favour of '{}'",
                self.name,
                existing.name,
                partner.name
            );
            self.disconnect_from(&existing);
        }
    }

    /// Removes the edges between two ports (either direction).
    pub fn disconnect_from(self: &Arc<Self>, other: &Arc<RpcPort>) {
        let remove = |edges: &Mutex<Vec<Weak<RpcPort>>>, port: &Arc<RpcPort>| {
            edges
                .lock()
                .unwrap()
                .retain(|edge| edge.upgrade().is_some_and(|p| !Arc::ptr_eq(&p, port)));
        };
        remove(&self.outgoing, other);
        remove(&self.incoming, other);
        remove(&other.outgoing, self);
        remove(&other.incoming, self);
    }

    /// Drops every edge of this port.
    pub fn disconnect_all(self: &Arc<Self>) {
        let partners: Vec<Arc<RpcPort>> = {
            let outgoing = self.outgoing.lock().unwrap();
            let incoming = self.incoming.lock().unwrap();
            outgoing
                .iter()
                .chain(incoming.iter())
                .filter_map(|edge| edge.upgrade())
                .collect()
        };
        for partner in partners {
            self.disconnect_from(&partner);
        }
    }
}

impl std::fmt::Debug for RpcPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPort")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("flags", &self.flags)
            .field("type", &self.data_type.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::test_type_info;

    fn client(name: &str, info: &'static InterfaceTypeInfo) -> Arc<RpcPort> {
        RpcPort::new(
            CreationInfo::new(name)
                .with_flags(PortFlags::EMITS_DATA | PortFlags::OUTPUT_PORT),
            info,
            None,
        )
    }

    fn server(name: &str, info: &'static InterfaceTypeInfo) -> Arc<RpcPort> {
        RpcPort::new(
            CreationInfo::new(name).with_flags(PortFlags::ACCEPTS_DATA),
            info,
            Some(Arc::new(Mutex::new(()))),
        )
    }

    fn proxy(name: &str, info: &'static InterfaceTypeInfo) -> Arc<RpcPort> {
        RpcPort::new(
            CreationInfo::new(name)
                .with_flags(PortFlags::ACCEPTS_DATA | PortFlags::EMITS_DATA),
            info,
            None,
        )
    }

    #[test]
    fn flag_shapes() {
        let info = test_type_info("port.shapes");
        assert!(server("s", info).is_server());
        assert!(!client("c", info).is_server());
        assert!(!proxy("p", info).is_server());
    }

    #[test]
    fn port_handles_are_unique_and_nonzero() {
        let info = test_type_info("port.handles");
        let a = client("a", info);
        let b = client("b", info);
        assert_ne!(a.handle(), 0);
        assert_ne!(a.handle(), b.handle());
    }

    #[test]
    fn get_server_walks_through_proxies() {
        let info = test_type_info("port.walk");
        let c = client("client", info);
        let p = proxy("proxy", info);
        let s = server("server", info);
        c.connect_to(&p);
        p.connect_to(&s);
        let found = c.get_server(false).unwrap();
        assert!(Arc::ptr_eq(&found, &s));
    }

    #[test]
    fn get_server_can_stop_at_network_elements() {
        struct NullSender;
        impl CallSender for NullSender {
            fn send_call(&self, _call: CallHandle) {}
        }

        let info = test_type_info("port.network");
        let c = client("client", info);
        let n = RpcPort::network(CreationInfo::new("net"), info, Box::new(NullSender));
        c.connect_to(&n);
        assert!(c.get_server(false).is_none());
        let found = c.get_server(true).unwrap();
        assert!(Arc::ptr_eq(&found, &n));
    }

    #[test]
    fn at_most_one_outgoing_server_edge() {
        let info = test_type_info("port.one_server");
        let c = client("client", info);
        let s1 = server("first", info);
        let s2 = server("second", info);
        c.connect_to(&s1);
        c.connect_to(&s2);
        let found = c.get_server(false).unwrap();
        assert!(Arc::ptr_eq(&found, &s2));
        assert_eq!(c.outgoing.lock().unwrap().len(), 1);
    }

    #[test]
    fn direction_points_toward_the_server_side() {
        let info = test_type_info("port.direction");
        let c = client("client", info);
        let s = server("server", info);
        assert_eq!(c.infer_connect_direction(&s), ConnectDirection::ToTarget);
        assert_eq!(s.infer_connect_direction(&c), ConnectDirection::ToSource);

        // The edge lands client -> server regardless of call order.
        s.connect_to(&c);
        let found = c.get_server(false).unwrap();
        assert!(Arc::ptr_eq(&found, &s));
    }

    #[test]
    fn disconnect_removes_reachability() {
        let info = test_type_info("port.disconnect");
        let c = client("client", info);
        let s = server("server", info);
        c.connect_to(&s);
        assert!(c.get_server(false).is_some());
        c.disconnect_from(&s);
        assert!(c.get_server(false).is_none());
    }

    #[test]
    fn send_call_requires_a_network_port() {
        let info = test_type_info("port.send");
        let c = client("client", info);
        let call = crate::storage::call_pool().acquire();
        assert_eq!(c.send_call(call).unwrap_err(), RpcError::InvalidCall);
    }
}
