//! Waiting on several channel operations at once.
//!
//! A [`Select`] collects send and receive cases, then [`Select::select`] commits to exactly one of
//! them:
//!
//! 1. The cases are visited in a fresh uniformly random order, so no case is favoured when several
//!    are ready.
//! 2. Every channel involved is locked, in ascending [`ChannelId`] order. Two selects over the same
//!    channels therefore never wait on each other's locks in a cycle.
//! 3. The first case that can complete right away does so and the select returns.
//! 4. With a default, nothing is registered anywhere and `DefaultTaken` is returned.
//! 5. Otherwise every case is queued on its channel behind one shared commit token, the locks are
//!    released and the thread sleeps until a peer (or a close) claims the token. On wakeup the
//!    leftover registrations are unlinked again.
//!
//! [`ChannelId`]: crate::channel::ChannelId

use std::cell::RefCell;
use std::sync::{Arc, MutexGuard};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, span, trace, Level};

use crate::channel::{Channel, State};
use crate::error::SelectError;
use crate::waiter::{Claim, Context, Waiter};

thread_local! {
    /// Per-thread shuffle source for selects without an explicit seed.
    static SELECT_RNG: RefCell<StdRng> = RefCell::new(crate::new_select_rng());
}

/// What a select committed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The send case at this index handed its value to a receiver.
    Sent(usize),
    /// The receive case at this index completed. `None` means its channel is closed.
    Received(usize, Option<T>),
    /// Nothing was ready and the select had a default.
    DefaultTaken,
}

impl<T> Outcome<T> {
    /// Index of the case that fired, `None` for the default.
    pub fn index(&self) -> Option<usize> {
        match self {
            Outcome::Sent(i) | Outcome::Received(i, _) => Some(*i),
            Outcome::DefaultTaken => None,
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Outcome::DefaultTaken)
    }
}

enum Case<'a, T> {
    Send {
        chan: &'a Channel<T>,
        /// Moved into a waiter while blocked, moved back if the case loses.
        value: Option<T>,
    },
    Recv {
        chan: &'a Channel<T>,
    },
}

impl<'a, T> Case<'a, T> {
    fn channel(&self) -> &'a Channel<T> {
        match *self {
            Case::Send { chan, .. } | Case::Recv { chan } => chan,
        }
    }
}

/// The locks of every distinct channel in a select, taken in ascending id order.
struct Locks<'a, T> {
    guards: Vec<MutexGuard<'a, State<T>>>,
    /// Case index -> index into `guards`.
    slots: Vec<usize>,
}

impl<'a, T> Locks<'a, T> {
    fn acquire(cases: &[Case<'a, T>]) -> Locks<'a, T> {
        let mut by_id: Vec<usize> = (0..cases.len()).collect();
        by_id.sort_by_key(|&i| cases[i].channel().id());

        let mut guards = Vec::with_capacity(cases.len());
        let mut slots = vec![0; cases.len()];
        let mut last = None;
        for i in by_id {
            let chan = cases[i].channel();
            if last != Some(chan.id()) {
                guards.push(chan.lock());
                last = Some(chan.id());
            }
            slots[i] = guards.len() - 1;
        }
        Locks { guards, slots }
    }

    fn state(&mut self, case: usize) -> &mut State<T> {
        &mut *self.guards[self.slots[case]]
    }
}

/// A set of channel operations to wait on. See the module docs for the algorithm.
///
/// All cases share the payload type `T`. Timeouts are receive cases on an
/// [`after`](crate::channel::after) channel, which works for any `T`.
pub struct Select<'a, T> {
    cases: Vec<Case<'a, T>>,
    default: bool,
    rng: Option<StdRng>,
    /// Send cases found on closed channels by the last `run()`, in visiting order.
    closed_sends: Vec<usize>,
}

impl<'a, T> Default for Select<'a, T> {
    fn default() -> Self {
        Select::new()
    }
}

impl<'a, T> Select<'a, T> {
    /// Creates an empty list of channel operations for selection.
    pub fn new() -> Select<'a, T> {
        Select {
            cases: Vec::new(),
            default: false,
            rng: None,
            closed_sends: Vec::new(),
        }
    }

    /// Like `new()`, but the visiting order of the cases comes from `seed`. Meant for tests.
    pub fn with_seed(seed: u64) -> Select<'a, T> {
        Select {
            rng: Some(StdRng::seed_from_u64(seed)),
            ..Select::new()
        }
    }

    /// Adds a send operation. Returns the index of the added operation.
    pub fn send(&mut self, chan: &'a Channel<T>, value: T) -> usize {
        self.cases.push(Case::Send {
            chan,
            value: Some(value),
        });
        self.cases.len() - 1
    }

    /// Adds a receive operation. Returns the index of the added operation.
    pub fn recv(&mut self, chan: &'a Channel<T>) -> usize {
        self.cases.push(Case::Recv { chan });
        self.cases.len() - 1
    }

    /// Return `DefaultTaken` instead of blocking when no case is ready.
    pub fn with_default(&mut self) -> &mut Self {
        self.default = true;
        self
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Blocks until exactly one case completes, or returns `DefaultTaken` right away if a default
    /// was requested and no case is ready.
    pub fn select(mut self) -> Result<Outcome<T>, SelectError<T>> {
        self.run()
    }

    /// `with_default()` followed by `select()`.
    pub fn try_select(mut self) -> Result<Outcome<T>, SelectError<T>> {
        self.default = true;
        self.run()
    }

    /// Value of a send case that did not fire.
    pub(crate) fn take_unsent(&mut self, case: usize) -> Option<T> {
        match self.cases.get_mut(case) {
            Some(Case::Send { value, .. }) => value.take(),
            _ => None,
        }
    }

    /// Whether the last `run()` found send case `case` on a closed channel, as seen under that
    /// channel's lock.
    pub(crate) fn saw_closed(&self, case: usize) -> bool {
        self.closed_sends.contains(&case)
    }

    pub(crate) fn run(&mut self) -> Result<Outcome<T>, SelectError<T>> {
        let _s = span!(
            Level::TRACE,
            "select",
            cases = self.cases.len(),
            default = self.default
        )
        .entered();

        if self.cases.is_empty() {
            return if self.default {
                Ok(Outcome::DefaultTaken)
            } else {
                debug!("Select without cases or default.");
                Err(SelectError::Deadlock)
            };
        }

        let order = self.poll_order();
        let mut locks = Locks::acquire(&self.cases);

        // First pass: look for a case that can complete without blocking.
        self.closed_sends.clear();
        for &i in &order {
            let state = locks.state(i);
            match &mut self.cases[i] {
                Case::Recv { .. } => {
                    if let Some(sender) = state.senders.claim_front() {
                        let value = sender.take();
                        sender.cx.notify();
                        trace!("Case {} received from a waiting sender.", i);
                        return Ok(Outcome::Received(i, value));
                    }
                    if state.closed {
                        trace!("Case {} received on a closed channel.", i);
                        return Ok(Outcome::Received(i, None));
                    }
                }
                Case::Send { value, .. } => {
                    if state.closed {
                        self.closed_sends.push(i);
                        continue;
                    }
                    if let Some(receiver) = state.receivers.claim_front() {
                        receiver.put(take_value(value));
                        receiver.cx.notify();
                        trace!("Case {} sent to a waiting receiver.", i);
                        return Ok(Outcome::Sent(i));
                    }
                }
            }
        }

        if self.default {
            trace!("No case ready, taking default.");
            return Ok(Outcome::DefaultTaken);
        }

        let registered = self
            .cases
            .iter()
            .enumerate()
            .filter(|(i, case)| match case {
                Case::Send { .. } => !locks.guards[locks.slots[*i]].closed,
                Case::Recv { .. } => true,
            })
            .count();
        if registered == 0 {
            // Only sends on closed channels: nothing could ever complete.
            return match self.closed_sends.first().copied() {
                Some(index) => Err(SelectError::Closed {
                    index,
                    value: take_value(self.take_value_slot(index)),
                }),
                None => unreachable!("select with cases registered nothing"),
            };
        }

        // Second pass: queue every case behind one commit token. Still holding all the locks, so no
        // peer can see (and claim) a registration before the last one is in place.
        let cx = Context::new(registered);
        let mut waiters = Vec::with_capacity(registered);
        for (i, case) in self.cases.iter_mut().enumerate() {
            let state = locks.state(i);
            match case {
                Case::Recv { .. } => {
                    let waiter = Waiter::receiver(cx.clone(), i);
                    state.receivers.push(waiter.clone());
                    waiters.push(waiter);
                }
                Case::Send { value, .. } => {
                    if state.closed {
                        continue;
                    }
                    let waiter = Waiter::sender(cx.clone(), i, take_value(value));
                    state.senders.push(waiter.clone());
                    waiters.push(waiter);
                }
            }
        }
        drop(locks);

        trace!("Blocking on {} cases.", registered);
        let claim = cx.wait();
        trace!("Woke up with {:?}", claim);

        self.unregister(&waiters);

        match claim {
            Claim::Fired(i) => match self.cases[i] {
                Case::Recv { .. } => Ok(Outcome::Received(i, winner(&waiters, i).take())),
                Case::Send { .. } => Ok(Outcome::Sent(i)),
            },
            // `unregister` already moved the value back into the case.
            Claim::Closed(index) => match self.take_value_slot(index).take() {
                Some(value) => Err(SelectError::Closed { index, value }),
                None => unreachable!("failed send case lost its value"),
            },
        }
    }

    /// Unlink all our waiters and give losing send cases their value back.
    fn unregister(&mut self, waiters: &[Arc<Waiter<T>>]) {
        let mut locks = Locks::acquire(&self.cases);
        for waiter in waiters {
            let state = locks.state(waiter.case);
            match &mut self.cases[waiter.case] {
                Case::Recv { .. } => state.receivers.remove(waiter),
                Case::Send { value, .. } => {
                    state.senders.remove(waiter);
                    if waiter.cx.claim() != Some(Claim::Fired(waiter.case)) {
                        *value = waiter.take();
                    }
                }
            }
        }
    }

    fn take_value_slot(&mut self, case: usize) -> &mut Option<T> {
        match &mut self.cases[case] {
            Case::Send { value, .. } => value,
            Case::Recv { .. } => unreachable!("case {} is not a send", case),
        }
    }

    /// Random permutation of the case indices.
    fn poll_order(&mut self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.cases.len()).collect();
        match &mut self.rng {
            Some(rng) => order.shuffle(rng),
            None => SELECT_RNG.with(|rng| order.shuffle(&mut *rng.borrow_mut())),
        }
        order
    }
}

fn take_value<T>(value: &mut Option<T>) -> T {
    match value.take() {
        Some(value) => value,
        None => unreachable!("send case value used twice"),
    }
}

fn winner<T>(waiters: &[Arc<Waiter<T>>], case: usize) -> &Arc<Waiter<T>> {
    match waiters.iter().find(|w| w.case == case) {
        Some(waiter) => waiter,
        None => unreachable!("token claimed for unregistered case {}", case),
    }
}
