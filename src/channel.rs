//! Unbuffered rendezvous channels.
//!
//! A value is only ever handed from a sender directly to a receiver: neither side returns until
//! the other one shows up (or the channel is closed). Every blocking operation here is a one- or
//! two-case [`Select`], so direct calls and select cases go through the exact same
//! commit-token protocol and can be freely mixed on the same channel.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{
    AlreadyClosedError, ClosedError, RecvError, RecvTimeoutError, SelectError, TryRecvError,
    TrySendError,
};
use crate::select::{Outcome, Select};
use crate::timer::{self, Expire};
use crate::waiter::{self, Claim, WaitQueue};

/// Channels are numbered in creation order. Selects lock several channels at once and always do
/// so in ascending id order.
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Stable, totally ordered identity of a channel. Clones of a `Channel` share it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> ChannelId {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Everything guarded by the channel lock.
pub(crate) struct State<T> {
    pub(crate) closed: bool,
    pub(crate) senders: WaitQueue<T>,
    pub(crate) receivers: WaitQueue<T>,
}

struct Inner<T> {
    id: ChannelId,
    state: Mutex<State<T>>,
    /// Set for `after()` channels: when the timer thread closes this channel.
    deadline: Option<Instant>,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        waiter::lock(&self.state)
    }

    fn close(&self) -> Result<(), AlreadyClosedError> {
        let mut state = self.lock();
        if state.closed {
            return Err(AlreadyClosedError);
        }
        state.closed = true;
        debug!("Closing {:?}", self.id);

        // A receive case on a closed channel is ready: commit it with an empty slot.
        for waiter in state.receivers.drain() {
            if waiter.cx.try_claim(Claim::Fired(waiter.case)) {
                trace!("Close woke receiver case {}", waiter.case);
                waiter.cx.notify();
            }
        }
        // A send case on a closed channel can never fire. Only give up on the whole select when
        // none of its cases are left.
        for waiter in state.senders.drain() {
            if waiter.cx.fail_send(waiter.case) {
                trace!("Close failed sender case {}", waiter.case);
                waiter.cx.notify();
            }
        }
        Ok(())
    }
}

impl<T: Send> Expire for Inner<T> {
    fn expire(&self) {
        if self.close().is_err() {
            debug!("Timer {:?} was already closed by its user.", self.id);
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(deadline) = self.deadline {
            timer::cancel(deadline, self.id);
        }
    }
}

/// Handle to an unbuffered channel. Cloning the handle does not create a new channel; all clones
/// can send, receive and close.
pub struct Channel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Channel::new()
    }
}

impl<T> Channel<T> {
    pub fn new() -> Channel<T> {
        Channel::with_deadline(None)
    }

    fn with_deadline(deadline: Option<Instant>) -> Channel<T> {
        let id = ChannelId::next();
        trace!("Channel<{}> created: {:?}", std::any::type_name::<T>(), id);
        Channel {
            inner: Arc::new(Inner {
                id,
                state: Mutex::new(State {
                    closed: false,
                    senders: WaitQueue::new(),
                    receivers: WaitQueue::new(),
                }),
                deadline,
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.lock()
    }

    /// Close the channel. Blocked receivers wake up empty-handed; blocked senders fail and get
    /// their value back. Closing twice is an error.
    pub fn close(&self) -> Result<(), AlreadyClosedError> {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Senders currently blocked on this channel (directly or as a select case).
    pub fn waiting_senders(&self) -> usize {
        self.lock().senders.live()
    }

    /// Receivers currently blocked on this channel (directly or as a select case).
    pub fn waiting_receivers(&self) -> usize {
        self.lock().receivers.live()
    }

    /// Block until a receiver takes `value`.
    pub fn send(&self, value: T) -> Result<(), ClosedError<T>> {
        let mut sel = Select::new();
        sel.send(self, value);
        match sel.select() {
            Ok(Outcome::Sent(_)) => Ok(()),
            Err(SelectError::Closed { value, .. }) => Err(ClosedError(value)),
            Ok(_) | Err(SelectError::Deadlock) => unreachable!("single send case without default"),
        }
    }

    /// Block until a sender shows up. Fails once the channel is closed and no sender is left.
    pub fn recv(&self) -> Result<T, RecvError> {
        let mut sel = Select::new();
        sel.recv(self);
        match sel.select() {
            Ok(Outcome::Received(_, Some(value))) => Ok(value),
            Ok(Outcome::Received(_, None)) => Err(RecvError),
            Ok(_) | Err(_) => unreachable!("single receive case without default"),
        }
    }

    /// Comma-ok receive: `(value, true)` on a transfer, `(T::default(), false)` once the channel is
    /// closed and drained.
    pub fn receive(&self) -> (T, bool)
    where
        T: Default,
    {
        match self.recv() {
            Ok(value) => (value, true),
            Err(RecvError) => (T::default(), false),
        }
    }

    /// Hand `value` to a receiver that is already waiting, without blocking.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut sel = Select::new();
        let case = sel.send(self, value);
        sel.with_default();
        match sel.run() {
            Ok(Outcome::Sent(_)) => Ok(()),
            // A send on a closed channel never matches, so a closed channel also lands here.
            Ok(Outcome::DefaultTaken) => {
                let closed = sel.saw_closed(case);
                match sel.take_unsent(case) {
                    Some(value) if closed => Err(TrySendError::Closed(value)),
                    Some(value) => Err(TrySendError::Full(value)),
                    None => unreachable!("default taken but the send case lost its value"),
                }
            }
            Err(SelectError::Closed { value, .. }) => Err(TrySendError::Closed(value)),
            Ok(Outcome::Received(..)) | Err(SelectError::Deadlock) => {
                unreachable!("single send case")
            }
        }
    }

    /// Take a value from a sender that is already waiting, without blocking.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut sel = Select::new();
        sel.recv(self);
        match sel.try_select() {
            Ok(Outcome::Received(_, Some(value))) => Ok(value),
            Ok(Outcome::Received(_, None)) => Err(TryRecvError::Closed),
            Ok(Outcome::DefaultTaken) => Err(TryRecvError::Empty),
            Ok(Outcome::Sent(_)) | Err(_) => unreachable!("single receive case"),
        }
    }

    /// Like `recv()`, giving up after `timeout`. The timeout is an `after()` timer raced against
    /// this channel in one select.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError>
    where
        T: Send + 'static,
    {
        let timer = after(timeout).map_err(|e| RecvTimeoutError::Timer(e.kind()))?;
        let mut sel = Select::new();
        let this = sel.recv(self);
        sel.recv(&timer);
        match sel.select() {
            Ok(Outcome::Received(i, Some(value))) if i == this => Ok(value),
            Ok(Outcome::Received(i, None)) if i == this => Err(RecvTimeoutError::Closed),
            Ok(Outcome::Received(..)) => Err(RecvTimeoutError::Timeout),
            Ok(_) | Err(_) => unreachable!("two receive cases without default"),
        }
    }

    /// Blocking iterator over received values. Ends when the channel is closed.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { chan: self }
    }
}

pub struct Iter<'a, T> {
    chan: &'a Channel<T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.chan.recv().ok()
    }
}

impl<'a, T> IntoIterator for &'a Channel<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

/// A channel that gets closed once `duration` has elapsed. It never carries a value, so it can
/// stand in as a timeout case in a select over any `T`: receiving from it reports "closed" at the
/// deadline.
///
/// All timers share one background thread, started on first use; failing to start it is the only
/// error. Dropping every handle of the channel before the deadline cancels the timer. A deadline
/// too far away to represent never fires.
pub fn after<T: Send + 'static>(duration: Duration) -> io::Result<Channel<T>> {
    let timers = timer::timers()?;
    let deadline = Instant::now().checked_add(duration);
    let chan = Channel::with_deadline(deadline);
    if let Some(deadline) = deadline {
        let target: Weak<Inner<T>> = Arc::downgrade(&chan.inner);
        let target: Weak<dyn Expire> = target;
        timers.schedule(deadline, chan.id(), target);
    }
    Ok(chan)
}

#[cfg(test)]
mod test {
    use super::{after, Channel};
    use crate::error::{AlreadyClosedError, ClosedError, RecvError, RecvTimeoutError};
    use crate::error::{TryRecvError, TrySendError};
    use crate::test::wait_until;
    use anyhow::Result;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn ids_are_unique_and_shared_by_clones() {
        let a = Channel::<i32>::new();
        let b = Channel::<i32>::new();
        assert_ne!(a.id(), b.id());
        assert!(a.id() < b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn send_blocks_until_received() -> Result<()> {
        let chan = Channel::new();
        let sender = chan.clone();
        let h = thread::spawn(move || sender.send(42));

        wait_until(|| chan.waiting_senders() == 1);
        assert_eq!(chan.recv()?, 42);
        h.join().unwrap()?;
        assert_eq!(chan.waiting_senders(), 0);
        Ok(())
    }

    #[test]
    fn recv_blocks_until_sent() -> Result<()> {
        let chan = Channel::new();
        let receiver = chan.clone();
        let h = thread::spawn(move || receiver.recv());

        wait_until(|| chan.waiting_receivers() == 1);
        chan.send(String::from("hello"))?;
        assert_eq!(h.join().unwrap()?, "hello");
        Ok(())
    }

    #[test]
    fn receive_on_closed_channel_returns_zero_value() {
        let chan = Channel::<i32>::new();
        chan.close().unwrap();
        let start = Instant::now();
        assert_eq!(chan.receive(), (0, false));
        assert_eq!(chan.recv(), Err(RecvError));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn send_on_closed_channel_fails_with_value() {
        let chan = Channel::new();
        chan.close().unwrap();
        assert_eq!(chan.send(5), Err(ClosedError(5)));
    }

    #[test]
    fn double_close_fails() {
        let chan = Channel::<()>::new();
        assert_eq!(chan.close(), Ok(()));
        assert_eq!(chan.close(), Err(AlreadyClosedError));
        assert!(chan.is_closed());
    }

    #[test]
    fn close_wakes_blocked_receivers() {
        let chan = Channel::<i32>::new();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let chan = chan.clone();
                thread::spawn(move || chan.receive())
            })
            .collect();

        wait_until(|| chan.waiting_receivers() == 3);
        chan.close().unwrap();
        for h in handles {
            assert_eq!(h.join().unwrap(), (0, false));
        }
        assert_eq!(chan.waiting_receivers(), 0);
    }

    #[test]
    fn close_fails_blocked_senders() {
        let chan = Channel::new();
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let chan = chan.clone();
                thread::spawn(move || chan.send(i))
            })
            .collect();

        wait_until(|| chan.waiting_senders() == 3);
        chan.close().unwrap();
        let mut returned: Vec<i32> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap_err().into_inner())
            .collect();
        returned.sort();
        assert_eq!(returned, vec![0, 1, 2]);
    }

    #[test]
    fn queued_receivers_are_served_fifo() -> Result<()> {
        let chan = Channel::new();
        let order = Channel::new();
        let mut handles = vec![];

        for id in 1..=3 {
            let receiver = chan.clone();
            let order = order.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let value: i32 = receiver.recv()?;
                order.send((id, value))?;
                Ok(())
            }));
            // Queue R1, R2, R3 strictly in that order.
            wait_until(|| chan.waiting_receivers() == id);
        }

        for value in 10..13 {
            chan.send(value)?;
            let (id, got) = order.recv()?;
            assert_eq!(got, value);
            assert_eq!(id as i32, value - 9);
        }
        for h in handles {
            h.join().unwrap()?;
        }
        Ok(())
    }

    #[test]
    fn queued_senders_are_served_fifo() -> Result<()> {
        let chan = Channel::new();
        let mut handles = vec![];
        for value in 1..=3 {
            let sender = chan.clone();
            handles.push(thread::spawn(move || sender.send(value)));
            wait_until(|| chan.waiting_senders() == value as usize);
        }

        let received: Vec<i32> = (0..3).map(|_| chan.recv()).collect::<Result<_, _>>()?;
        assert_eq!(received, vec![1, 2, 3]);
        for h in handles {
            h.join().unwrap()?;
        }
        Ok(())
    }

    #[test]
    fn try_ops_do_not_block() -> Result<()> {
        let chan = Channel::new();
        assert_eq!(chan.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(chan.try_send(1), Err(TrySendError::Full(1)));
        assert_eq!(chan.waiting_senders(), 0);
        assert_eq!(chan.waiting_receivers(), 0);

        let sender = chan.clone();
        let h = thread::spawn(move || sender.send(7));
        wait_until(|| chan.waiting_senders() == 1);
        assert_eq!(chan.try_recv(), Ok(7));
        h.join().unwrap()?;

        chan.close().unwrap();
        assert_eq!(chan.try_recv(), Err(TryRecvError::Closed));
        assert_eq!(chan.try_send(2), Err(TrySendError::Closed(2)));
        Ok(())
    }

    #[test]
    fn recv_timeout() -> Result<()> {
        let chan = Channel::new();

        let sender = chan.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            sender.send(5)
        });

        assert_eq!(
            chan.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Timeout)
        );
        assert_eq!(chan.recv_timeout(Duration::from_secs(5)), Ok(5));
        h.join().unwrap()?;

        chan.close().unwrap();
        assert_eq!(
            chan.recv_timeout(Duration::from_secs(5)),
            Err(RecvTimeoutError::Closed)
        );
        Ok(())
    }

    #[test]
    fn after_closes_at_deadline() {
        let start = Instant::now();
        let timer = after::<u8>(Duration::from_millis(30)).unwrap();
        assert!(!timer.is_closed());
        assert_eq!(timer.recv(), Err(RecvError));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn iter_ends_on_close() {
        let chan = Channel::new();
        let sender = chan.clone();
        let h = thread::spawn(move || {
            for i in 0..5 {
                sender.send(i).unwrap();
            }
            sender.close().unwrap();
        });

        let received: Vec<i32> = chan.iter().collect();
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
        h.join().unwrap();
    }
}
