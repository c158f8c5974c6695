//! Error types for rpc_ports.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status of the call a future is waiting for.
///
/// Lives in the per-slot atomic and crosses the wire as a single byte in
/// response frames. `Pending` and `Ready` are states, everything else is an
/// exception that terminates the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FutureStatus {
    /// Value is yet to be returned.
    Pending = 0,
    /// Value is ready and can be obtained.
    Ready = 1,
    /// There is no server port reachable from the client port.
    NoConnection = 2,
    /// Call timed out.
    Timeout = 3,
    /// Promise was dropped without providing a value.
    BrokenPromise = 4,
    /// Operation on an invalid future object.
    InvalidFuture = 5,
    /// Internal error; indicates a bug in this crate.
    InternalError = 6,
    /// A function was called that was not allowed.
    InvalidCall = 7,
    /// Invalid data received from another process.
    InvalidDataReceived = 8,
}

impl FutureStatus {
    /// Decodes a wire byte. Returns `None` for out-of-range values.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => FutureStatus::Pending,
            1 => FutureStatus::Ready,
            2 => FutureStatus::NoConnection,
            3 => FutureStatus::Timeout,
            4 => FutureStatus::BrokenPromise,
            5 => FutureStatus::InvalidFuture,
            6 => FutureStatus::InternalError,
            7 => FutureStatus::InvalidCall,
            8 => FutureStatus::InvalidDataReceived,
            _ => return None,
        })
    }

    /// True for every terminal status other than `Ready`.
    pub fn is_exception(self) -> bool {
        !matches!(self, FutureStatus::Pending | FutureStatus::Ready)
    }
}

/// Errors surfaced to callers of RPC operations.
///
/// Maps 1:1 onto the exception values of [`FutureStatus`]; serializable so a
/// server-side failure can cross the wire as its status byte. Registered RPC
/// methods return `Result<R, RpcError>`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcError {
    #[error("no server port is reachable from this client port")]
    NoConnection,
    #[error("call timed out")]
    Timeout,
    #[error("promise was dropped without providing a value")]
    BrokenPromise,
    #[error("operation on an invalid future")]
    InvalidFuture,
    #[error("internal error")]
    Internal,
    #[error("function was called that was not allowed")]
    InvalidCall,
    #[error("invalid data received from remote process")]
    InvalidData,
}

impl RpcError {
    /// The wire status corresponding to this error.
    pub fn status(self) -> FutureStatus {
        match self {
            RpcError::NoConnection => FutureStatus::NoConnection,
            RpcError::Timeout => FutureStatus::Timeout,
            RpcError::BrokenPromise => FutureStatus::BrokenPromise,
            RpcError::InvalidFuture => FutureStatus::InvalidFuture,
            RpcError::Internal => FutureStatus::InternalError,
            RpcError::InvalidCall => FutureStatus::InvalidCall,
            RpcError::InvalidData => FutureStatus::InvalidDataReceived,
        }
    }

    /// Maps an exception status back to an error. `None` for `Pending` and
    /// `Ready`, which never surface as errors.
    pub fn from_status(status: FutureStatus) -> Option<Self> {
        Some(match status {
            FutureStatus::Pending | FutureStatus::Ready => return None,
            FutureStatus::NoConnection => RpcError::NoConnection,
            FutureStatus::Timeout => RpcError::Timeout,
            FutureStatus::BrokenPromise => RpcError::BrokenPromise,
            FutureStatus::InvalidFuture => RpcError::InvalidFuture,
            FutureStatus::InternalError => RpcError::Internal,
            FutureStatus::InvalidCall => RpcError::InvalidCall,
            FutureStatus::InvalidDataReceived => RpcError::InvalidData,
        })
    }
}

impl From<RpcError> for FutureStatus {
    fn from(error: RpcError) -> Self {
        error.status()
    }
}

/// Result type for rpc_ports operations.
pub type Result<T> = std::result::Result<T, RpcError>;
