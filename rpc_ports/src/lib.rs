//! rpc_ports - Typed RPC ports for component graphs.
//!
//! Components communicate by connecting typed *ports*: a [`ClientPort`]
//! bound to an interface type invokes functions of that interface, a
//! [`ServerPort`] holds the handler object implementing it. When client and
//! server live in the same process, calls execute directly; when a
//! *network element* sits in between, calls are packed into pooled storage
//! slots, serialized, and matched with their responses by correlation id.
//!
//! # Architecture
//!
//! ```text
//!  ClientPort<T> ──► RpcPort ──► network element ──► wire
//!       │               (call in a CallStorage slot)   │
//!       │ local path                                   ▼
//!       ▼                                       interface registry
//!  handler: Arc<Mutex<T>>  ◄── ServerPort<T> ◄── dispatch by function_id
//!                                                      │
//!  Future<R>  ◄── response sender ◄── Response slot ◄──┘
//! ```
//!
//! Four calling modes exist on the client side: fire-and-forget
//! ([`ClientPort::call`]), synchronous ([`ClientPort::call_sync`]),
//! future-returning ([`ClientPort::future_call`]) and asynchronous with a
//! [`ResponseHandler`] ([`ClientPort::call_async`]) — plus
//! [`ClientPort::native_future_call`] for functions that already return a
//! [`Future`] and [`ClientPort::promise_call`] for promise-returning
//! functions.
//!
//! Interface types are registered once, at program start:
//!
//! ```ignore
//! struct Robot { speed: f64 }
//! impl RpcInterface for Robot {}
//! impl Robot {
//!     fn set_speed(&mut self, v: f64) -> Result<()> { self.speed = v; Ok(()) }
//!     fn speed(&mut self) -> Result<f64> { Ok(self.speed) }
//! }
//!
//! static ROBOT: LazyLock<RpcInterfaceType<Robot>> = LazyLock::new(|| {
//!     RpcInterfaceType::builder("Robot")
//!         .method(Robot::set_speed)
//!         .method(Robot::speed)
//!         .register()
//! });
//! ```

use std::time::Duration;

pub mod call;
pub mod client;
pub mod dispatch;
pub mod encoding;
pub mod error;
pub mod future;
pub mod method;
pub mod port;
pub mod registry;
pub mod return_value;
pub mod server;
pub mod storage;

/// Inline payload capacity of a call-storage slot, in bytes. Larger encoded
/// payloads spill to the heap.
pub const MAX_CALL_PAYLOAD: usize = 256;

/// Default timeout attached to calls that expect a response when the caller
/// does not provide one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

pub use call::CallType;
pub use client::ClientPort;
pub use dispatch::{execute_frame, execute_message, execute_request, execute_response, CallFrameKind};
pub use error::{FutureStatus, Result, RpcError};
pub use future::{Future, Promise, PromiseReturn, ResponseHandler};
pub use method::{RpcInterface, RpcMethod};
pub use port::{CallSender, ConnectDirection, CreationInfo, PortFlags, ResponseSender, RpcPort};
pub use registry::{find_type, InterfaceTypeBuilder, InterfaceTypeInfo, RpcInterfaceType, TypeClassification};
pub use server::ServerPort;
pub use storage::{call_pool, CallBuffer, CallHandle, CallPool, CallStorage, HandleFlavor};
