//! Transport-facing dispatch: deserializes incoming call frames and routes
//! them through the interface registry.
//!
//! A transport frames every serialized call with a one-byte kind tag, then
//! hands received frames to [`execute_frame`] together with the local port
//! the call arrived at, a response sender for anything flowing back, and a
//! lookup for pending requests (keyed by call id). Failures inside the
//! deserialization trampolines are logged and mapped to
//! `INVALID_DATA_RECEIVED`; they never corrupt state, because the target is
//! either a fresh response (discarded) or an identified request slot
//! (transitioned via `set_exception`).

use std::sync::Arc;

use crate::call::CallType;
use crate::encoding::InputStream;
use crate::error::{Result, RpcError};
use crate::port::{ResponseSender, RpcPort};
use crate::registry::{self, InterfaceTypeInfo};
use crate::storage::CallHandle;

/// Kind tag a transport frames each serialized call with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallFrameKind {
    Message = 0,
    Request = 1,
    Response = 2,
}

impl CallFrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => CallFrameKind::Message,
            1 => CallFrameKind::Request,
            2 => CallFrameKind::Response,
            _ => return None,
        })
    }

    /// The frame kind for an outgoing call, if it is sendable.
    pub fn of(call: &CallHandle) -> Option<Self> {
        match call.call_type() {
            CallType::Message => Some(CallFrameKind::Message),
            CallType::Request => Some(CallFrameKind::Request),
            CallType::Response => Some(CallFrameKind::Response),
            CallType::Unspecified => None,
        }
    }
}

fn resolve(stream: &mut InputStream<'_>) -> Result<(&'static InterfaceTypeInfo, u8)> {
    let type_name: String = stream.read_value()?;
    let info = registry::find_type(&type_name).ok_or_else(|| {
        log::warn!("received call for unknown interface type '{type_name}'");
        RpcError::InvalidData
    })?;
    let function_id = stream.read_u8()?;
    if info.entry(function_id).is_none() {
        log::warn!(
            "received call for invalid function id {function_id} of '{}'",
            info.name()
        );
        return Err(RpcError::InvalidData);
    }
    Ok((info, function_id))
}

/// Deserializes and executes a fire-and-forget message arriving at `port`.
pub fn execute_message(stream: &mut InputStream<'_>, port: &Arc<RpcPort>) -> Result<()> {
    let (info, function_id) = resolve(stream)?;
    let entry = info.entry(function_id).ok_or(RpcError::InvalidData)?;
    (entry.deserialize_message)(stream, port, function_id)
}

/// Deserializes and executes a request arriving at `port`; the response is
/// handed to `sender`.
pub fn execute_request(
    stream: &mut InputStream<'_>,
    port: &Arc<RpcPort>,
    sender: &Arc<dyn ResponseSender>,
) -> Result<()> {
    let (info, function_id) = resolve(stream)?;
    let entry = info.entry(function_id).ok_or(RpcError::InvalidData)?;
    (entry.deserialize_request)(stream, port, function_id, sender)
}

/// Deserializes a response and completes the pending request it answers.
///
/// `pending` maps the correlation id back to the request storage the
/// transport retained when it sent the request; returning `None` makes the
/// response payload be read and discarded (late responses after a consumer
/// timeout are normal).
pub fn execute_response(
    stream: &mut InputStream<'_>,
    sender: &Arc<dyn ResponseSender>,
    pending: impl FnOnce(u64) -> Option<CallHandle>,
) -> Result<()> {
    let (info, function_id) = resolve(stream)?;
    let entry = info.entry(function_id).ok_or(RpcError::InvalidData)?;
    let call_id = stream.read_u64()?;
    let request = pending(call_id);
    if request.is_none() {
        log::debug!("response for call {call_id} matches no live request, discarding");
    }
    (entry.deserialize_response)(stream, info, function_id, sender, request)
}

/// Decodes one framed call and dispatches it. Errors are logged; invalid
/// frames never take the receiver down.
pub fn execute_frame(
    frame: &[u8],
    port: &Arc<RpcPort>,
    sender: &Arc<dyn ResponseSender>,
    pending: impl FnOnce(u64) -> Option<CallHandle>,
) {
    let mut stream = InputStream::new(frame);
    let result = match stream.read_u8().ok().and_then(CallFrameKind::from_u8) {
        Some(CallFrameKind::Message) => execute_message(&mut stream, port),
        Some(CallFrameKind::Request) => execute_request(&mut stream, port, sender),
        Some(CallFrameKind::Response) => execute_response(&mut stream, sender, pending),
        None => {
            log::warn!("received frame with invalid kind tag");
            return;
        }
    };
    if let Err(error) = result {
        log::debug!("incoming call caused an error: {error}");
    }
}
