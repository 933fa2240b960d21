use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::watch;

use super::{codec::from_bytes, error::CallError};

static NEXT_PROMISE_ID: AtomicU64 = AtomicU64::new(1);

/// Correlates a call with its reply. Unique within the process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct PromiseId(u64);

impl PromiseId {
    pub fn next() -> Self {
        Self(NEXT_PROMISE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromiseState {
    Waiting,
    Success,
    Failed,
    TimedOut,
}

impl PromiseState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PromiseState::Waiting)
    }
}

type ThenFn = Box<dyn FnOnce(&[u8]) + Send>;
type CatchFn = Box<dyn FnOnce(&CallError) + Send>;
type FinallyFn = Box<dyn FnOnce(PromiseState) + Send>;

#[derive(Default)]
struct Callbacks {
    then: Option<ThenFn>,
    catch: Option<CatchFn>,
    finally: Option<FinallyFn>,
}

struct Slot {
    state: PromiseState,
    value: Option<Vec<u8>>,
    error: Option<CallError>,
    name: Option<String>,
    callbacks: Callbacks,
}

struct Inner {
    id: PromiseId,
    protocol: u64,
    function: u64,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    deadline: Instant,
    slot: Mutex<Slot>,
    settled: Condvar,
    watch: watch::Sender<PromiseState>,
}

/// The eventual outcome of one remote call.
///
/// A promise leaves `Waiting` exactly once. Whichever of [`fulfill`],
/// [`fail`] and [`timeout`] runs first decides the outcome; the others
/// return false and change nothing. The deadline counts as a transition of
/// its own: it is noticed lazily by every state query, and a fulfil or
/// failure arriving at or after it settles the promise as timed out instead.
///
/// [`fulfill`]: Promise::fulfill
/// [`fail`]: Promise::fail
/// [`timeout`]: Promise::timeout
#[derive(Clone)]
pub struct Promise(Arc<Inner>);

impl Promise {
    pub fn new(protocol: u64, function: u64, timeout: Duration) -> Self {
        let now = Instant::now();
        let created_at = Utc::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(u32::MAX as u64));
        let expires_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| created_at.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let (watch, _) = watch::channel(PromiseState::Waiting);

        Self(Arc::new(Inner {
            id: PromiseId::next(),
            protocol,
            function,
            created_at,
            expires_at,
            deadline,
            slot: Mutex::new(Slot {
                state: PromiseState::Waiting,
                value: None,
                error: None,
                name: None,
                callbacks: Callbacks::default(),
            }),
            settled: Condvar::new(),
            watch,
        }))
    }

    pub fn id(&self) -> PromiseId {
        self.0.id
    }

    pub fn protocol(&self) -> u64 {
        self.0.protocol
    }

    pub fn function(&self) -> u64 {
        self.0.function
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.0.created_at
    }

    pub fn deadline(&self) -> Instant {
        self.0.deadline
    }

    pub fn name(&self) -> Option<String> {
        self.0.slot.lock().name.clone()
    }

    /// Labels the promise in logs and errors.
    pub fn set_name(&self, name: impl Into<String>) {
        self.0.slot.lock().name = Some(name.into());
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.0.deadline
    }

    pub fn state(&self) -> PromiseState {
        let state = self.0.slot.lock().state;
        if state == PromiseState::Waiting && self.is_expired(Instant::now()) {
            self.timeout();
            return self.0.slot.lock().state;
        }
        state
    }

    pub fn is_waiting(&self) -> bool {
        self.state() == PromiseState::Waiting
    }

    /// The stored state without the lazy deadline check. Never settles the
    /// promise, so it is safe to call while holding other locks.
    pub(crate) fn peek_state(&self) -> PromiseState {
        self.0.slot.lock().state
    }

    pub fn fulfill(&self, value: Vec<u8>) -> bool {
        self.settle(PromiseState::Success, Some(value), None)
    }

    pub fn fail(&self, error: CallError) -> bool {
        self.settle(PromiseState::Failed, None, Some(error))
    }

    pub fn timeout(&self) -> bool {
        self.settle(PromiseState::TimedOut, None, Some(CallError::Timeout))
    }

    /// The raw result bytes, once the promise succeeded.
    pub fn value(&self) -> Option<Vec<u8>> {
        self.0.slot.lock().value.clone()
    }

    pub fn error(&self) -> Option<CallError> {
        self.0.slot.lock().error.clone()
    }

    /// Decodes the successful result as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PromiseError> {
        match self.state() {
            PromiseState::Success => {
                let value = self.value().unwrap_or_default();
                from_bytes(&value).map_err(|error| self.error_with(Some(error.into())))
            }
            _ => Err(self.error_with(self.error())),
        }
    }

    /// Blocks the calling thread until the promise settles, at most until
    /// `extra` past its deadline. Returns true only on success.
    ///
    /// An unsettled promise times out at its deadline, so waiting never
    /// outlasts the deadline itself.
    ///
    /// Never call this from inside the runtime's worker threads; use
    /// [`settled`](Promise::settled) there.
    pub fn wait(&self, extra: Duration) -> bool {
        let until = saturating_add(self.0.deadline, extra);
        {
            let mut slot = self.0.slot.lock();
            while slot.state == PromiseState::Waiting {
                let now = Instant::now();
                if now >= until || self.is_expired(now) {
                    break;
                }
                let wake = until.min(self.0.deadline);
                let _ = self.0.settled.wait_until(&mut slot, wake);
            }
        }
        self.state() == PromiseState::Success
    }

    /// Like [`wait`](Promise::wait), but reports anything except success as
    /// a [`PromiseError`].
    pub fn wait_checked(&self, extra: Duration) -> Result<(), PromiseError> {
        if self.wait(extra) {
            Ok(())
        } else {
            Err(self.error_with(self.error()))
        }
    }

    /// Resolves once the promise has settled or its deadline has passed.
    pub async fn settled(&self) -> PromiseState {
        let mut rx = self.0.watch.subscribe();
        let deadline = tokio::time::Instant::from_std(self.0.deadline);
        let _ = tokio::time::timeout_at(deadline, rx.wait_for(|state| state.is_terminal())).await;
        self.state()
    }

    /// Attaches continuations. Each runs at most once; a continuation added
    /// after the promise settled runs immediately if it matches the outcome.
    pub fn with_handlers(&self) -> Handlers<'_> {
        Handlers { promise: self }
    }

    pub(crate) fn error_with(&self, reason: Option<CallError>) -> PromiseError {
        PromiseError {
            id: self.id(),
            created_at: self.0.created_at,
            deadline: self.0.expires_at,
            protocol: self.0.protocol,
            function: self.0.function,
            state: self.state(),
            name: self.name(),
            reason,
        }
    }

    /// Moves out of `Waiting`. Past the deadline every transition becomes a
    /// timeout. Returns true if `requested` is the state that was reached.
    fn settle(
        &self,
        requested: PromiseState,
        value: Option<Vec<u8>>,
        error: Option<CallError>,
    ) -> bool {
        let (state, value, error) =
            if requested != PromiseState::TimedOut && self.is_expired(Instant::now()) {
                (PromiseState::TimedOut, None, Some(CallError::Timeout))
            } else {
                (requested, value, error)
            };

        let (callbacks, value, error) = {
            let mut slot = self.0.slot.lock();
            if slot.state != PromiseState::Waiting {
                return false;
            }
            slot.state = state;
            slot.value = value;
            slot.error = error;
            let callbacks = std::mem::take(&mut slot.callbacks);
            let value = callbacks.then.as_ref().and(slot.value.clone());
            let error = callbacks.catch.as_ref().and(slot.error.clone());
            (callbacks, value, error)
        };
        self.0.settled.notify_all();
        self.0.watch.send_replace(state);

        if let (Some(then), Some(value)) = (callbacks.then, value) {
            then(&value);
        }
        if let (Some(catch), Some(error)) = (callbacks.catch, error) {
            catch(&error);
        }
        if let Some(finally) = callbacks.finally {
            finally(state);
        }
        state == requested
    }
}

/// `base + extra`, or the latest representable instant near it when that
/// overflows.
fn saturating_add(base: Instant, extra: Duration) -> Instant {
    if let Some(until) = base.checked_add(extra) {
        return until;
    }
    let mut step = extra;
    let mut until = base;
    while !step.is_zero() {
        match until.checked_add(step) {
            Some(later) => until = later,
            None => step /= 2,
        }
    }
    until
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.0.slot.lock();
        f.debug_struct("Promise")
            .field("id", &self.0.id)
            .field("protocol", &self.0.protocol)
            .field("function", &self.0.function)
            .field("state", &slot.state)
            .field("name", &slot.name)
            .finish()
    }
}

/// Builder returned by [`Promise::with_handlers`].
pub struct Handlers<'a> {
    promise: &'a Promise,
}

impl Handlers<'_> {
    /// Runs with the raw result bytes on success.
    pub fn then(self, f: impl FnOnce(&[u8]) + Send + 'static) -> Self {
        let state = self.promise.state();
        let mut slot = self.promise.0.slot.lock();
        match state {
            PromiseState::Waiting if slot.state == PromiseState::Waiting => {
                slot.callbacks.then = Some(Box::new(f));
            }
            _ if slot.state == PromiseState::Success => {
                let value = slot.value.clone().unwrap_or_default();
                drop(slot);
                f(&value);
            }
            _ => {}
        }
        self
    }

    /// Runs with the error on failure or timeout.
    pub fn catch(self, f: impl FnOnce(&CallError) + Send + 'static) -> Self {
        let state = self.promise.state();
        let mut slot = self.promise.0.slot.lock();
        match state {
            PromiseState::Waiting if slot.state == PromiseState::Waiting => {
                slot.callbacks.catch = Some(Box::new(f));
            }
            _ if matches!(slot.state, PromiseState::Failed | PromiseState::TimedOut) => {
                let error = slot.error.clone().unwrap_or(CallError::Timeout);
                drop(slot);
                f(&error);
            }
            _ => {}
        }
        self
    }

    /// Runs with the final state whatever the outcome.
    pub fn finally(self, f: impl FnOnce(PromiseState) + Send + 'static) -> Self {
        let _ = self.promise.state();
        let mut slot = self.promise.0.slot.lock();
        if slot.state == PromiseState::Waiting {
            slot.callbacks.finally = Some(Box::new(f));
        } else {
            let state = slot.state;
            drop(slot);
            f(state);
        }
        self
    }
}

/// A promise that did not succeed, with everything needed to tell which call
/// it was.
#[derive(Debug, Clone)]
pub struct PromiseError {
    pub id: PromiseId,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub protocol: u64,
    pub function: u64,
    pub state: PromiseState,
    pub name: Option<String>,
    pub reason: Option<CallError>,
}

impl fmt::Display for PromiseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "promise {}", self.id)?;
        if let Some(name) = &self.name {
            write!(f, " ({})", name)?;
        }
        write!(
            f,
            " for {}:{} is {:?} (created {}, deadline {})",
            self.protocol,
            self.function,
            self.state,
            self.created_at.format("%H:%M:%S%.3f"),
            self.deadline.format("%H:%M:%S%.3f"),
        )?;
        if let Some(reason) = &self.reason {
            write!(f, ": {}", reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for PromiseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.reason
            .as_ref()
            .map(|reason| reason as &(dyn std::error::Error + 'static))
    }
}
