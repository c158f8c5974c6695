//! Method abstraction for RPC interfaces.
//!
//! A *method* is any `Fn(&mut T, args...) -> Result<R, RpcError>` — in
//! practice the plain associated functions of the interface type, passed by
//! name (`client.call(Robot::stop, ())`). The `Marker` parameter
//! disambiguates the per-arity blanket impls; it is inferred and never
//! written by callers. Method identity is the `TypeId` of the function item
//! type, which is unique per method and stable for the process lifetime.

use std::any::TypeId;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RpcError;

/// Marker trait for RPC interfaces: any type whose associated functions are
/// registered as remotely callable methods.
pub trait RpcInterface: Send + 'static {}

/// One callable method of an RPC interface `T`.
///
/// Implemented for function items and non-capturing closures of up to six
/// arguments. All arguments must be serde-serializable owned types; the
/// return value is always a `Result` so server-side failures can cross the
/// wire as their status.
pub trait RpcMethod<T: RpcInterface, Marker>: Copy + Send + Sync + 'static {
    /// Decayed argument tuple.
    type Args: Serialize + DeserializeOwned + Send + 'static;

    /// Declared (success) return type.
    type Ret: Send + 'static;

    /// Invokes the method on a handler instance.
    fn invoke(self, handler: &mut T, args: Self::Args) -> Result<Self::Ret, RpcError>;

    /// Stable identity of this method within the process.
    fn key(self) -> TypeId {
        TypeId::of::<Self>()
    }
}

macro_rules! impl_rpc_method {
    ($($arg:ident),*) => {
        impl<T, F, R, $($arg,)*> RpcMethod<T, fn($($arg,)*) -> R> for F
        where
            T: RpcInterface,
            F: Fn(&mut T, $($arg,)*) -> Result<R, RpcError> + Copy + Send + Sync + 'static,
            R: Send + 'static,
            $($arg: Serialize + DeserializeOwned + Send + 'static,)*
        {
            type Args = ($($arg,)*);
            type Ret = R;

            #[allow(non_snake_case)]
            fn invoke(self, handler: &mut T, ($($arg,)*): Self::Args) -> Result<R, RpcError> {
                self(handler, $($arg,)*)
            }
        }
    };
}

impl_rpc_method!();
impl_rpc_method!(A0);
impl_rpc_method!(A0, A1);
impl_rpc_method!(A0, A1, A2);
impl_rpc_method!(A0, A1, A2, A3);
impl_rpc_method!(A0, A1, A2, A3, A4);
impl_rpc_method!(A0, A1, A2, A3, A4, A5);
