use std::{
    any::Any,
    fmt::Display,
    marker::PhantomData,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{
    codec::{decode_args, decode_message, encode_args, encode_message, to_bytes, Arguments, CodecError},
    error::CallError,
    pending::PendingCalls,
    promise::{Promise, PromiseId},
};
use crate::net::address::Address;

/// One exposed function: decodes its arguments, runs it, encodes the result.
pub trait Invoker: Send + Sync {
    fn invoke(&self, args: &[u8]) -> Result<Vec<u8>, CallError>;
}

/// Return values an exposed function may produce.
pub trait Reply {
    fn into_reply(self) -> Result<Vec<u8>, CallError>;
}

macro_rules! encoded_reply {
    ($($ty:ty),* $(,)?) => {$(
        impl Reply for $ty {
            fn into_reply(self) -> Result<Vec<u8>, CallError> {
                Ok(to_bytes(&self)?)
            }
        }
    )*};
}

encoded_reply!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64, bool, char, (), String, Address);

macro_rules! generic_reply {
    ($(($($param:ident),+) => $ty:ty;)*) => {$(
        impl<$($param: Serialize),+> Reply for $ty {
            fn into_reply(self) -> Result<Vec<u8>, CallError> {
                Ok(to_bytes(&self)?)
            }
        }
    )*};
}

generic_reply! {
    (T) => Vec<T>;
    (T) => Option<T>;
    (A, B) => (A, B);
    (A, B, C) => (A, B, C);
}

/// Wraps any serializable value so an exposed function can return it.
pub struct Encoded<T>(pub T);

impl<T: Serialize> Reply for Encoded<T> {
    fn into_reply(self) -> Result<Vec<u8>, CallError> {
        Ok(to_bytes(&self.0)?)
    }
}

/// `Err` is reported to the caller as [`CallError::TargetFailed`].
impl<T: Reply, E: Display> Reply for Result<T, E> {
    fn into_reply(self) -> Result<Vec<u8>, CallError> {
        match self {
            Ok(value) => value.into_reply(),
            Err(error) => Err(CallError::TargetFailed(error.to_string())),
        }
    }
}

/// Plain closures taking up to six deserializable arguments.
pub trait Handler<Args>: Send + Sync + 'static {
    fn call(&self, args: &[u8]) -> Result<Vec<u8>, CallError>;
}

macro_rules! handler {
    ($($arg:ident),*) => {
        impl<Func, Ret, $($arg,)*> Handler<($($arg,)*)> for Func
        where
            Func: Fn($($arg),*) -> Ret + Send + Sync + 'static,
            Ret: Reply,
            $($arg: DeserializeOwned,)*
        {
            #[allow(non_snake_case)]
            fn call(&self, args: &[u8]) -> Result<Vec<u8>, CallError> {
                let ($($arg,)*) = decode_args::<($($arg,)*)>(args)?;
                (self)($($arg),*).into_reply()
            }
        }
    };
}

handler!();
handler!(A);
handler!(A, B);
handler!(A, B, C);
handler!(A, B, C, D);
handler!(A, B, C, D, E);
handler!(A, B, C, D, E, F);

struct Bound<H, Args> {
    handler: H,
    _args: PhantomData<fn(Args)>,
}

impl<H, Args> Invoker for Bound<H, Args>
where
    H: Handler<Args>,
    Args: 'static,
{
    fn invoke(&self, args: &[u8]) -> Result<Vec<u8>, CallError> {
        match catch_unwind(AssertUnwindSafe(|| self.handler.call(args))) {
            Ok(result) => result,
            Err(panic) => Err(CallError::TargetFailed(panic_message(&*panic))),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

/// `(protocol, function) -> invoker` table of everything this node exposes.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<(u64, u64), Arc<dyn Invoker>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exposes `handler` under `(protocol, function)`, replacing whatever was
    /// there. Returns true if an earlier registration was replaced.
    pub fn expose<Args, H>(&self, protocol: u64, function: u64, handler: H) -> bool
    where
        Args: 'static,
        H: Handler<Args>,
    {
        self.expose_invoker(
            protocol,
            function,
            Arc::new(Bound {
                handler,
                _args: PhantomData,
            }),
        )
    }

    pub fn expose_invoker(&self, protocol: u64, function: u64, invoker: Arc<dyn Invoker>) -> bool {
        let replaced = self
            .functions
            .write()
            .insert((protocol, function), invoker)
            .is_some();
        debug!(protocol, function, replaced, "function exposed");
        replaced
    }

    pub fn remove(&self, protocol: u64, function: u64) -> bool {
        self.functions.write().remove(&(protocol, function)).is_some()
    }

    pub fn contains(&self, protocol: u64, function: u64) -> bool {
        self.functions.read().contains_key(&(protocol, function))
    }

    pub fn invoke(&self, protocol: u64, function: u64, args: &[u8]) -> Result<Vec<u8>, CallError> {
        let invoker = self
            .functions
            .read()
            .get(&(protocol, function))
            .cloned()
            .ok_or(CallError::NotFound { protocol, function })?;
        invoker.invoke(args)
    }
}

/// Payload of an RPC packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcMessage {
    Call {
        id: PromiseId,
        protocol: u64,
        function: u64,
        args: Vec<u8>,
    },
    Reply {
        id: PromiseId,
        result: Result<Vec<u8>, CallError>,
    },
}

impl RpcMessage {
    pub fn id(&self) -> PromiseId {
        match self {
            RpcMessage::Call { id, .. } | RpcMessage::Reply { id, .. } => *id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode_message(self)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        decode_message(buf)
    }
}

/// Both halves of call dispatch: promises for outbound calls and the
/// function table for inbound ones.
pub struct Dispatcher {
    pending: PendingCalls,
    functions: FunctionRegistry,
    call_timeout: Duration,
}

impl Dispatcher {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            pending: PendingCalls::new(),
            functions: FunctionRegistry::new(),
            call_timeout,
        }
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Registers a fresh promise for a call to `(protocol, function)` on the
    /// node at `target`.
    pub fn make_promise(&self, target: Address, protocol: u64, function: u64) -> Promise {
        let promise = Promise::new(protocol, function, self.call_timeout);
        self.pending.insert(promise.clone(), target);
        trace!(id = %promise.id(), protocol, function, "promise created");
        promise
    }

    /// The call message for `promise` carrying `args`.
    pub fn call_message(
        &self,
        promise: &Promise,
        args: &impl Arguments,
    ) -> Result<RpcMessage, CodecError> {
        Ok(RpcMessage::Call {
            id: promise.id(),
            protocol: promise.protocol(),
            function: promise.function(),
            args: encode_args(args)?,
        })
    }

    /// Runs an inbound call and builds its reply. Blocks for as long as the
    /// exposed function does.
    pub fn serve(&self, id: PromiseId, protocol: u64, function: u64, args: &[u8]) -> RpcMessage {
        let result = self.functions.invoke(protocol, function, args);
        if let Err(error) = &result {
            warn!(%id, protocol, function, %error, "call failed");
        }
        RpcMessage::Reply { id, result }
    }

    /// Settles the promise a reply from `from` belongs to.
    pub fn resolve(&self, id: PromiseId, from: Address, result: Result<Vec<u8>, CallError>) -> bool {
        self.pending.resolve(id, from, result)
    }

    /// Fails a call that never left this node.
    pub fn fail(&self, id: PromiseId, error: CallError) -> bool {
        self.pending.fail(id, error)
    }
}
