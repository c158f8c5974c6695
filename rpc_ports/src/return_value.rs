//! Serialization of RPC return values.
//!
//! This is a little involved because of promises. Three cases exist, chosen
//! by the shape of the declared return type:
//!
//! | promise | serializable body | serialized form |
//! |---|---|---|
//! | no  | —   | the encoded value |
//! | yes | no  | only the local call id |
//! | yes | yes | call id, then the body |
//!
//! Deserializing a promise-typed value constructs it around a *remote
//! promise*: a promise armed with the originating call id and a response
//! sender, so that fulfilment (or breaking) on its new side emits a
//! response call back to the original caller.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::encoding::{InputStream, OutputStream};
use crate::error::Result;
use crate::future::{Promise, PromiseReturn};
use crate::port::ResponseSender;
use crate::registry::InterfaceTypeInfo;

/// Serializes a plain (non-promise) return value.
pub fn serialize_value<R: Serialize>(stream: &mut OutputStream<'_>, value: &R) -> Result<()> {
    stream.write_value(value)
}

/// Deserializes a plain (non-promise) return value.
pub fn deserialize_value<R: DeserializeOwned>(stream: &mut InputStream<'_>) -> Result<R> {
    stream.read_value()
}

/// Serializes a promise-typed return value: the correlation id of the
/// promise's own slot, followed by the body for derived types.
pub fn serialize_promise<P: PromiseReturn>(
    stream: &mut OutputStream<'_>,
    value: &P,
) -> Result<()> {
    stream.write_u64(value.promise().call_id()?)?;
    if P::HAS_BODY {
        value.serialize_body(stream)?;
    }
    Ok(())
}

/// Deserializes a promise-typed return value, arming it as a remote
/// promise targeting `(type, function_id, call_id, sender)`.
pub fn deserialize_promise<P: PromiseReturn>(
    stream: &mut InputStream<'_>,
    type_info: &'static InterfaceTypeInfo,
    function_id: u8,
    sender: &Arc<dyn ResponseSender>,
) -> Result<P> {
    let call_id = stream.read_u64()?;
    let mut promise = Promise::new();
    promise.bind_remote(type_info, function_id, call_id, sender.clone())?;
    let mut value = P::from_promise(promise);
    if P::HAS_BODY {
        value.deserialize_body(stream)?;
    }
    Ok(value)
}
