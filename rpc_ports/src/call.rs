//! Call payloads: the three call kinds living inside a storage slot.
//!
//! The payload is a tagged variant whose tag is the call type. A `Message`
//! carries a fire-and-forget invocation, a `Request` additionally expects a
//! `Response` correlated by call id. Argument tuples and return values are
//! kept in their encoded form inside the slot's [`CallBuffer`], so the slot
//! stays free of type parameters and recycles in place.

use std::sync::Arc;
use std::time::Duration;

use crate::encoding::OutputStream;
use crate::error::{FutureStatus, Result, RpcError};
use crate::future::Future;
use crate::registry::InterfaceTypeInfo;
use crate::storage::{CallBuffer, CallHandle, CallStorage, HandleFlavor};

/// Types of RPC calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallType {
    Message = 0,
    Request = 1,
    Response = 2,
    Unspecified = 3,
}

/// Payload stored in a [`CallStorage`] slot.
#[derive(Debug)]
pub(crate) enum CallPayload {
    /// No call stored (freshly acquired or recycled slot).
    Empty,
    Message(MessageCall),
    Request(RequestCall),
    Response(ResponseCall),
}

/// Fire-and-forget call: no reply, no return value.
#[derive(Debug)]
pub(crate) struct MessageCall {
    pub type_info: &'static InterfaceTypeInfo,
    pub function_index: u8,
    /// Encoded argument tuple.
    pub args: CallBuffer,
}

/// Call that expects a response. The same buffer holds the encoded argument
/// tuple on the way out and the encoded return value once the response
/// arrives.
#[derive(Debug)]
pub(crate) struct RequestCall {
    pub type_info: &'static InterfaceTypeInfo,
    pub function_index: u8,
    pub args: CallBuffer,
    pub timeout: Duration,
    pub future_obtained: bool,
}

/// Response to a request, or the storage contents of a promise awaiting
/// fulfilment.
#[derive(Debug)]
pub(crate) struct ResponseCall {
    /// Unknown until the slot is bound to a concrete call (promise slots
    /// start out unbound).
    pub type_info: Option<&'static InterfaceTypeInfo>,
    pub function_index: u8,
    /// Call id of the request this response answers.
    pub response_to: u64,
    /// True when the value is produced by a promise rather than the
    /// immediate server invocation.
    pub promise_response: bool,
    pub future_obtained: bool,
    /// Encoded return value (valid once the slot status is `Ready`).
    pub value: CallBuffer,
}

impl CallPayload {
    pub fn call_type(&self) -> CallType {
        match self {
            CallPayload::Empty => CallType::Unspecified,
            CallPayload::Message(_) => CallType::Message,
            CallPayload::Request(_) => CallType::Request,
            CallPayload::Response(_) => CallType::Response,
        }
    }

    /// Serializes the call for the transport.
    ///
    /// Wire layout (common header first, then per-kind body):
    ///
    /// ```text
    /// message:  type_tag, function_index, args
    /// request:  type_tag, function_index, call_id, timeout, args
    /// response: type_tag, function_index, call_id, promise_flag, status, [value]
    /// ```
    pub fn serialize(
        &self,
        stream: &mut OutputStream<'_>,
        local_call_id: u64,
        status: FutureStatus,
    ) -> Result<()> {
        match self {
            CallPayload::Empty => {
                log::error!("attempt to serialize an empty call slot");
                Err(RpcError::Internal)
            }
            CallPayload::Message(m) => {
                stream.write_value(m.type_info.name())?;
                stream.write_u8(m.function_index)?;
                stream.write_raw(m.args.as_slice())
            }
            CallPayload::Request(r) => {
                stream.write_value(r.type_info.name())?;
                stream.write_u8(r.function_index)?;
                stream.write_u64(local_call_id)?;
                stream.write_duration(r.timeout)?;
                stream.write_raw(r.args.as_slice())
            }
            CallPayload::Response(r) => {
                let info = r.type_info.ok_or_else(|| {
                    log::error!("attempt to serialize an unbound response slot");
                    RpcError::Internal
                })?;
                stream.write_value(info.name())?;
                stream.write_u8(r.function_index)?;
                stream.write_u64(r.response_to)?;
                stream.write_bool(r.promise_response)?;
                stream.write_u8(status as u8)?;
                if status == FutureStatus::Ready {
                    stream.write_raw(r.value.as_slice())?;
                }
                Ok(())
            }
        }
    }
}

impl CallStorage {
    /// Constructs a message payload in this slot.
    pub(crate) fn install_message(
        &self,
        type_info: &'static InterfaceTypeInfo,
        function_index: u8,
        args: CallBuffer,
        source_port: u32,
    ) {
        let mut inner = self.lock_inner();
        inner.payload = CallPayload::Message(MessageCall {
            type_info,
            function_index,
            args,
        });
        inner.source_port = source_port;
        inner.response_timeout = Duration::ZERO;
    }

    /// Constructs a request payload in this slot.
    pub(crate) fn install_request(
        &self,
        type_info: &'static InterfaceTypeInfo,
        function_index: u8,
        args: CallBuffer,
        timeout: Duration,
        source_port: u32,
    ) {
        let mut inner = self.lock_inner();
        inner.payload = CallPayload::Request(RequestCall {
            type_info,
            function_index,
            args,
            timeout,
            future_obtained: false,
        });
        inner.source_port = source_port;
        inner.response_timeout = timeout;
    }

    /// Constructs a response payload. Promise slots start unbound
    /// (`type_info` = `None`) and are bound later by
    /// [`CallStorage::rebind_as_response`].
    pub(crate) fn install_response(
        &self,
        type_info: Option<&'static InterfaceTypeInfo>,
        function_index: u8,
        response_to: u64,
        promise_response: bool,
    ) {
        let mut inner = self.lock_inner();
        inner.payload = CallPayload::Response(ResponseCall {
            type_info,
            function_index,
            response_to,
            promise_response,
            future_obtained: false,
            value: CallBuffer::new(),
        });
    }

    /// Rebinds this slot as the response to `response_to`, keeping whatever
    /// value buffer it already carries. Works on request slots (a forwarded
    /// call whose answer becomes our answer) and on response/promise slots.
    pub(crate) fn rebind_as_response(
        &self,
        type_info: &'static InterfaceTypeInfo,
        function_index: u8,
        response_to: u64,
        promise_response: bool,
    ) {
        let mut inner = self.lock_inner();
        let value = match &mut inner.payload {
            CallPayload::Request(r) => std::mem::take(&mut r.args),
            CallPayload::Response(r) => std::mem::take(&mut r.value),
            _ => CallBuffer::new(),
        };
        let future_obtained = match &inner.payload {
            CallPayload::Request(r) => r.future_obtained,
            CallPayload::Response(r) => r.future_obtained,
            _ => false,
        };
        inner.payload = CallPayload::Response(ResponseCall {
            type_info: Some(type_info),
            function_index,
            response_to,
            promise_response,
            future_obtained,
            value,
        });
    }

    /// Stores an encoded return value and publishes `Ready`: the value write
    /// and the status transition are linearized by the slot mutex, waiters
    /// are notified, and an attached response handler runs outside the
    /// mutex. Warns and ignores if the call already has a terminal status.
    pub(crate) fn set_ready_with_bytes(&'static self, bytes: &[u8]) {
        let (handler, armed_sender) = {
            let mut inner = self.lock_inner();
            if self.status() != FutureStatus::Pending {
                log::warn!(
                    "call already has status {:?}, ignoring return value",
                    self.status()
                );
                return;
            }
            match &mut inner.payload {
                CallPayload::Request(r) => r.args.set_from_slice(bytes),
                CallPayload::Response(r) => r.value.set_from_slice(bytes),
                _ => {
                    log::warn!("return value for a slot without a pending call, ignoring");
                    return;
                }
            }
            self.store_status(FutureStatus::Ready);
            self.condvar().notify_all();
            let armed_sender = if inner.armed {
                inner.armed = false;
                inner.sender.clone()
            } else {
                None
            };
            (inner.handler.take(), armed_sender)
        };
        if let Some(mut handler) = handler {
            handler.on_ready(bytes);
        }
        if let Some(sender) = armed_sender {
            sender.send_response(self.obtain_handle(HandleFlavor::Consumer));
        }
    }

    /// Moves the encoded return value out of the slot (for `Future::get`).
    pub(crate) fn take_value_bytes(&self) -> Option<CallBuffer> {
        let mut inner = self.lock_inner();
        match &mut inner.payload {
            CallPayload::Request(r) => Some(std::mem::take(&mut r.args)),
            CallPayload::Response(r) => Some(std::mem::take(&mut r.value)),
            _ => None,
        }
    }

    /// Obtains the consumer future for a request or response slot. May be
    /// called at most once per call.
    pub(crate) fn obtain_future<T: serde::de::DeserializeOwned>(
        &'static self,
    ) -> Result<Future<T>> {
        {
            let mut inner = self.lock_inner();
            let obtained = match &mut inner.payload {
                CallPayload::Request(r) => &mut r.future_obtained,
                CallPayload::Response(r) => &mut r.future_obtained,
                _ => return Err(RpcError::InvalidCall),
            };
            if *obtained {
                log::error!("future was already obtained for this call");
                return Err(RpcError::InvalidCall);
            }
            *obtained = true;
        }
        Ok(Future::from_handle(
            self.obtain_handle(HandleFlavor::Consumer),
        ))
    }
}

impl CallHandle {
    /// Call type of the stored payload.
    pub fn call_type(&self) -> CallType {
        self.slot().lock_inner().payload.call_type()
    }

    /// Serializes the stored call for the transport.
    pub fn serialize(&self, stream: &mut OutputStream<'_>) -> Result<()> {
        let slot = self.slot();
        let inner = slot.lock_inner();
        // Status is read under the slot mutex so a response is serialized
        // with the same status its value was published under.
        let status = slot.status();
        inner.payload.serialize(stream, slot.call_id(), status)
    }

    /// Attaches a response sender that deferred completions of this call
    /// should be routed through.
    pub fn attach_sender(&self, sender: Arc<dyn crate::port::ResponseSender>) {
        self.slot().lock_inner().sender = Some(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::InputStream;
    use crate::registry::testing::test_type_info;
    use crate::storage::call_pool;

    #[test]
    fn message_wire_format() {
        let info = test_type_info("call.message");
        let handle = call_pool().acquire();
        let mut args = CallBuffer::new();
        args.set_from_slice(&[9, 9, 9]);
        handle.slot().install_message(info, 2, args, 7);
        assert_eq!(handle.call_type(), CallType::Message);
        assert_eq!(handle.source_port(), 7);

        let mut frame = Vec::new();
        handle.serialize(&mut OutputStream::new(&mut frame)).unwrap();

        let mut stream = InputStream::new(&frame);
        let name: String = stream.read_value().unwrap();
        assert_eq!(name, info.name());
        assert_eq!(stream.read_u8().unwrap(), 2);
        let mut rest = Vec::new();
        std::io::Read::read_to_end(&mut stream, &mut rest).unwrap();
        assert_eq!(rest, vec![9, 9, 9]);
    }

    #[test]
    fn request_wire_format() {
        let info = test_type_info("call.request");
        let handle = call_pool().acquire();
        let mut args = CallBuffer::new();
        args.set_from_slice(&[1, 2]);
        handle
            .slot()
            .install_request(info, 1, args, Duration::from_secs(2), 0);
        assert_eq!(handle.response_timeout(), Duration::from_secs(2));

        let mut frame = Vec::new();
        handle.serialize(&mut OutputStream::new(&mut frame)).unwrap();

        let mut stream = InputStream::new(&frame);
        let _: String = stream.read_value().unwrap();
        assert_eq!(stream.read_u8().unwrap(), 1);
        assert_eq!(stream.read_u64().unwrap(), handle.call_id());
        assert_eq!(stream.read_duration().unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn response_serializes_value_only_when_ready() {
        let info = test_type_info("call.response");
        let handle = call_pool().acquire();
        handle.slot().install_response(Some(info), 0, 77, false);

        // Pending response of a gated slot never reaches serialization, but
        // an exception response carries no value bytes.
        handle.slot().set_exception(FutureStatus::NoConnection);
        let mut frame = Vec::new();
        handle.serialize(&mut OutputStream::new(&mut frame)).unwrap();
        let mut stream = InputStream::new(&frame);
        let _: String = stream.read_value().unwrap();
        assert_eq!(stream.read_u8().unwrap(), 0);
        assert_eq!(stream.read_u64().unwrap(), 77);
        assert!(!stream.read_bool().unwrap());
        assert_eq!(
            FutureStatus::from_u8(stream.read_u8().unwrap()),
            Some(FutureStatus::NoConnection)
        );
        assert_eq!(stream.remaining(), 0);
    }

    #[test]
    fn ready_response_carries_value_bytes() {
        let info = test_type_info("call.response_ready");
        let handle = call_pool().acquire();
        handle.slot().install_response(Some(info), 3, 5, true);
        handle.slot().set_ready_with_bytes(&[4, 4]);

        let mut frame = Vec::new();
        handle.serialize(&mut OutputStream::new(&mut frame)).unwrap();
        let mut stream = InputStream::new(&frame);
        let _: String = stream.read_value().unwrap();
        assert_eq!(stream.read_u8().unwrap(), 3);
        assert_eq!(stream.read_u64().unwrap(), 5);
        assert!(stream.read_bool().unwrap());
        assert_eq!(stream.read_u8().unwrap(), FutureStatus::Ready as u8);
        assert_eq!(stream.remaining(), 2);
    }

    #[test]
    fn request_slot_rebinds_into_response() {
        let info = test_type_info("call.rebind");
        let handle = call_pool().acquire();
        handle
            .slot()
            .install_request(info, 4, CallBuffer::new(), Duration::from_secs(1), 0);
        handle.slot().rebind_as_response(info, 4, 123, true);
        assert_eq!(handle.call_type(), CallType::Response);

        handle.slot().set_ready_with_bytes(&[8]);
        let mut frame = Vec::new();
        handle.serialize(&mut OutputStream::new(&mut frame)).unwrap();
        let mut stream = InputStream::new(&frame);
        let _: String = stream.read_value().unwrap();
        assert_eq!(stream.read_u8().unwrap(), 4);
        assert_eq!(stream.read_u64().unwrap(), 123);
    }

    #[test]
    fn future_is_obtained_at_most_once() {
        let info = test_type_info("call.future_once");
        let handle = call_pool().acquire();
        handle
            .slot()
            .install_request(info, 0, CallBuffer::new(), Duration::from_secs(1), 0);
        let slot = handle.slot();
        let future: crate::future::Future<i32> = slot.obtain_future().unwrap();
        assert!(future.valid());
        let second: Result<crate::future::Future<i32>> = slot.obtain_future();
        assert_eq!(second.unwrap_err(), RpcError::InvalidCall);
    }
}
