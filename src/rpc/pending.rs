use std::time::Instant;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    error::CallError,
    promise::{Promise, PromiseId, PromiseState},
};
use crate::net::{address::Address, connection::Handle};

struct PendingCall {
    promise: Promise,
    /// Only a reply sent by this node may settle the call.
    target: Address,
    /// Connection the call was written to, once known.
    handle: Option<Handle>,
}

/// Every outbound call still waiting for its reply.
///
/// Promises are only ever settled after the table lock is released, so
/// continuations are free to issue new calls.
#[derive(Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<PromiseId, PendingCall>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, promise: Promise, target: Address) {
        self.calls.lock().insert(
            promise.id(),
            PendingCall {
                promise,
                target,
                handle: None,
            },
        );
    }

    /// Records which connection carries the call, so losing that connection
    /// fails it.
    pub fn associate(&self, id: PromiseId, handle: Handle) {
        if let Some(call) = self.calls.lock().get_mut(&id) {
            call.handle = Some(handle);
        }
    }

    pub fn get(&self, id: PromiseId) -> Option<Promise> {
        self.calls.lock().get(&id).map(|call| call.promise.clone())
    }

    pub fn take(&self, id: PromiseId) -> Option<Promise> {
        self.calls.lock().remove(&id).map(|call| call.promise)
    }

    /// Settles the call with a reply sent by `from`. Returns false for
    /// unknown or already settled calls, and for replies from any node other
    /// than the one called; those leave the call pending.
    pub fn resolve(&self, id: PromiseId, from: Address, result: Result<Vec<u8>, CallError>) -> bool {
        let promise = {
            let mut calls = self.calls.lock();
            match calls.get(&id) {
                None => {
                    trace!(%id, "reply for unknown call");
                    return false;
                }
                Some(call) if call.target != from => {
                    debug!(%id, from = %format_args!("{:#}", from), "reply from a node that was not called, ignoring");
                    return false;
                }
                Some(_) => match calls.remove(&id) {
                    Some(call) => call.promise,
                    None => return false,
                },
            }
        };
        match result {
            Ok(value) => promise.fulfill(value),
            Err(error) => promise.fail(error),
        }
    }

    /// Fails a call locally, before any reply could arrive.
    pub fn fail(&self, id: PromiseId, error: CallError) -> bool {
        match self.take(id) {
            Some(promise) => promise.fail(error),
            None => false,
        }
    }

    /// Times out every call past its deadline and forgets calls settled by
    /// other means. Returns how many calls timed out.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Promise> = {
            let mut calls = self.calls.lock();
            let ids: Vec<PromiseId> = calls
                .iter()
                .filter(|(_, call)| call.promise.is_expired(now))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| calls.remove(&id))
                .map(|call| call.promise)
                .collect()
        };
        let timed_out = expired.iter().filter(|promise| promise.timeout()).count();
        if timed_out > 0 {
            debug!(timed_out, "swept expired calls");
        }
        self.calls
            .lock()
            .retain(|_, call| call.promise.peek_state() == PromiseState::Waiting);
        timed_out
    }

    /// Fails every call written to `handle`.
    pub fn fail_handle(&self, handle: Handle, error: CallError) -> usize {
        let failed: Vec<Promise> = {
            let mut calls = self.calls.lock();
            let ids: Vec<PromiseId> = calls
                .iter()
                .filter(|(_, call)| call.handle == Some(handle))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| calls.remove(&id))
                .map(|call| call.promise)
                .collect()
        };
        let count = failed
            .iter()
            .filter(|promise| promise.fail(error.clone()))
            .count();
        if count > 0 {
            debug!(%handle, count, "failed calls of lost connection");
        }
        count
    }

    /// Fails everything still pending.
    pub fn fail_all(&self, error: CallError) -> usize {
        let drained: Vec<Promise> = self
            .calls
            .lock()
            .drain()
            .map(|(_, call)| call.promise)
            .collect();
        drained
            .iter()
            .filter(|promise| promise.fail(error.clone()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
