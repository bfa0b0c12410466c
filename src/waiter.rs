//! Bookkeeping for blocked operations.
//!
//! Every blocking select installs one [`Waiter`] per case on the wait queue of that case's
//! channel. All waiters of one select share a [`Context`] holding the commit token. Whoever
//! claims the token first (a peer pairing with one of the waiters, or a close) decides which case
//! the select completes with; every other waiter of that select is stale from then on and is
//! skipped by anyone who finds it in a queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::trace;

/// Lock a mutex, ignoring poisoning. Our critical sections never leave the protected state
/// half-updated: a panic can only come from a user payload's `Drop`.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a select invocation was committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Claim {
    /// Case completed: a value moved through it, or its receive saw the channel close.
    Fired(usize),
    /// Every registered case was a send whose channel closed. Carries the last one to fail.
    Closed(usize),
}

const UNCLAIMED: usize = 0;

impl Claim {
    fn encode(self) -> usize {
        match self {
            Claim::Fired(case) => (case + 1) << 1,
            Claim::Closed(case) => ((case + 1) << 1) | 1,
        }
    }

    fn decode(word: usize) -> Option<Claim> {
        match word {
            UNCLAIMED => None,
            w if w & 1 == 0 => Some(Claim::Fired((w >> 1) - 1)),
            w => Some(Claim::Closed((w >> 1) - 1)),
        }
    }
}

/// State shared by all waiters of one blocked select.
pub(crate) struct Context {
    /// The commit token. Moves from `UNCLAIMED` to an encoded `Claim` exactly once.
    token: AtomicUsize,
    /// Number of waiters this select registered.
    registered: usize,
    /// Registered send cases whose channel was closed under them.
    failed: AtomicUsize,
    /// Set by the claimer once the payload slot is filled.
    done: Mutex<bool>,
    wakeup: Condvar,
}

impl Context {
    pub(crate) fn new(registered: usize) -> Arc<Context> {
        Arc::new(Context {
            token: AtomicUsize::new(UNCLAIMED),
            registered,
            failed: AtomicUsize::new(0),
            done: Mutex::new(false),
            wakeup: Condvar::new(),
        })
    }

    /// Attempt the single unclaimed -> claimed transition.
    pub(crate) fn try_claim(&self, claim: Claim) -> bool {
        self.token
            .compare_exchange(UNCLAIMED, claim.encode(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn claim(&self) -> Option<Claim> {
        Claim::decode(self.token.load(Ordering::Acquire))
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.token.load(Ordering::Acquire) != UNCLAIMED
    }

    /// Record that the send case `case` can never complete because its channel closed. Returns
    /// true when this was the select's last hope and the token was claimed as `Claim::Closed`;
    /// the caller must then `notify()`.
    pub(crate) fn fail_send(&self, case: usize) -> bool {
        let failed = self.failed.fetch_add(1, Ordering::AcqRel) + 1;
        failed == self.registered && self.try_claim(Claim::Closed(case))
    }

    /// Wake the owning thread. Must only be called by whoever claimed the token, after the payload
    /// slot is in its final state.
    pub(crate) fn notify(&self) {
        let mut done = lock(&self.done);
        *done = true;
        self.wakeup.notify_one();
    }

    /// Block until some peer claimed the token and called `notify()`.
    pub(crate) fn wait(&self) -> Claim {
        let mut done = lock(&self.done);
        while !*done {
            done = self
                .wakeup
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(done);

        match self.claim() {
            Some(claim) => claim,
            None => unreachable!("select woken without a claimed token"),
        }
    }
}

/// One case of one select, queued on a channel.
pub(crate) struct Waiter<T> {
    pub(crate) cx: Arc<Context>,
    pub(crate) case: usize,
    /// Send cases: the value on offer. Receive cases: filled in by the sender that claims us, left
    /// empty when the channel closes.
    pub(crate) slot: Mutex<Option<T>>,
}

impl<T> Waiter<T> {
    pub(crate) fn sender(cx: Arc<Context>, case: usize, value: T) -> Arc<Waiter<T>> {
        Arc::new(Waiter {
            cx,
            case,
            slot: Mutex::new(Some(value)),
        })
    }

    pub(crate) fn receiver(cx: Arc<Context>, case: usize) -> Arc<Waiter<T>> {
        Arc::new(Waiter {
            cx,
            case,
            slot: Mutex::new(None),
        })
    }

    pub(crate) fn take(&self) -> Option<T> {
        lock(&self.slot).take()
    }

    pub(crate) fn put(&self, value: T) {
        *lock(&self.slot) = Some(value);
    }
}

/// FIFO of waiters blocked in one direction on one channel.
pub(crate) struct WaitQueue<T> {
    waiters: VecDeque<Arc<Waiter<T>>>,
}

impl<T> WaitQueue<T> {
    pub(crate) fn new() -> WaitQueue<T> {
        WaitQueue {
            waiters: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, waiter: Arc<Waiter<T>>) {
        self.waiters.push_back(waiter);
    }

    /// Pop the longest-waiting entry whose select is still undecided, claiming its token for it.
    /// Stale entries met along the way are dropped.
    pub(crate) fn claim_front(&mut self) -> Option<Arc<Waiter<T>>> {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.cx.try_claim(Claim::Fired(waiter.case)) {
                return Some(waiter);
            }
            trace!("Skipping stale waiter for case {}", waiter.case);
        }
        None
    }

    /// Unlink `waiter` if it is still queued.
    pub(crate) fn remove(&mut self, waiter: &Arc<Waiter<T>>) {
        self.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Arc<Waiter<T>>> + '_ {
        self.waiters.drain(..)
    }

    /// Entries whose select could still be committed through them.
    pub(crate) fn live(&self) -> usize {
        self.waiters.iter().filter(|w| !w.cx.is_claimed()).count()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}
