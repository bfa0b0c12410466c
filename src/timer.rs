//! The background thread behind [`after`](crate::channel::after).
//!
//! One thread serves every timer channel in the process. Deadlines wait in an ordered map and the
//! thread sleeps until the earliest one. A timer channel dropped before its deadline removes its
//! own entry, so nothing lingers for timeouts that were never needed.
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::Instant;

use once_cell::sync::OnceCell;
use tracing::{debug, trace};

use crate::channel::ChannelId;
use crate::waiter::lock;

/// Something the timer thread fires at a deadline.
pub(crate) trait Expire: Send + Sync {
    fn expire(&self);
}

type Key = (Instant, ChannelId);

struct Shared {
    pending: Mutex<BTreeMap<Key, Weak<dyn Expire>>>,
    changed: Condvar,
}

pub(crate) struct Timers {
    shared: Arc<Shared>,
}

static TIMERS: OnceCell<Timers> = OnceCell::new();

/// The process-wide timer thread, started on first use. A failed start is reported and retried on
/// the next call.
pub(crate) fn timers() -> io::Result<&'static Timers> {
    TIMERS.get_or_try_init(|| -> io::Result<Timers> {
        let shared = Arc::new(Shared {
            pending: Mutex::new(BTreeMap::new()),
            changed: Condvar::new(),
        });
        let worker = shared.clone();
        crate::thread::Builder::new()
            .name("rendezvous-timer".to_string())
            .spawn(move || worker.run())?;
        debug!("Timer thread started.");
        Ok(Timers { shared })
    })
}

/// Forget the timer `id` due at `deadline`, if it has not fired yet.
pub(crate) fn cancel(deadline: Instant, id: ChannelId) {
    if let Some(timers) = TIMERS.get() {
        if lock(&timers.shared.pending).remove(&(deadline, id)).is_some() {
            trace!("Timer {:?} cancelled.", id);
        }
    }
}

impl Timers {
    pub(crate) fn schedule(&self, deadline: Instant, id: ChannelId, target: Weak<dyn Expire>) {
        lock(&self.shared.pending).insert((deadline, id), target);
        self.shared.changed.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        lock(&self.shared.pending).len()
    }
}

impl Shared {
    fn run(&self) {
        let mut pending = lock(&self.pending);
        loop {
            let now = Instant::now();
            let mut due = Vec::new();
            loop {
                let key = match pending.keys().next() {
                    Some(&key) if key.0 <= now => key,
                    _ => break,
                };
                if let Some(target) = pending.remove(&key) {
                    due.push(target);
                }
            }

            if !due.is_empty() {
                // Expiring may drop the last handle of a channel, whose drop cancels through
                // `pending`: never fire with the lock held.
                drop(pending);
                for target in due {
                    if let Some(target) = target.upgrade() {
                        target.expire();
                    }
                }
                pending = lock(&self.pending);
                continue;
            }

            let next = pending.keys().next().map(|key| key.0);
            pending = match next {
                Some(deadline) => {
                    self.changed
                        .wait_timeout(pending, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .changed
                    .wait(pending)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use rusty_fork::rusty_fork_test;

    use super::timers;
    use crate::channel::{after, Channel};
    use crate::test::wait_until;

    /// Threads of this process, where the platform lets us count them.
    fn live_threads() -> Option<usize> {
        std::fs::read_dir("/proc/self/task").ok().map(|d| d.count())
    }

    fn dropped_timers_are_cancelled() {
        let timer = after::<i32>(Duration::from_secs(3600)).unwrap();
        let clone = timer.clone();
        assert_eq!(timers().unwrap().pending(), 1);

        drop(timer);
        assert_eq!(timers().unwrap().pending(), 1);
        drop(clone);
        assert_eq!(timers().unwrap().pending(), 0);
    }

    fn timers_share_one_thread() {
        let keep: Vec<_> = (0..50)
            .map(|_| after::<()>(Duration::from_secs(3600)).unwrap())
            .collect();
        let before = match live_threads() {
            Some(n) => n,
            None => return,
        };
        let more: Vec<_> = (0..50)
            .map(|_| after::<()>(Duration::from_secs(3600)).unwrap())
            .collect();
        assert_eq!(live_threads(), Some(before));
        assert_eq!(timers().unwrap().pending(), 100);
        drop(keep);
        drop(more);
        assert_eq!(timers().unwrap().pending(), 0);
    }

    fn satisfied_timeouts_leave_nothing_behind() {
        // Start the timer thread before counting.
        drop(after::<i32>(Duration::from_secs(3600)).unwrap());
        let before = match live_threads() {
            Some(n) => n,
            None => return,
        };

        let chan = Channel::new();
        for i in 0..200 {
            let sender = chan.clone();
            let h = crate::thread::spawn(move || sender.send(i));
            assert_eq!(chan.recv_timeout(Duration::from_secs(3600)), Ok(i));
            h.join().unwrap().unwrap();
        }

        wait_until(|| live_threads().map_or(true, |n| n <= before));
        assert_eq!(timers().unwrap().pending(), 0);
    }

    fn overflowing_deadline_never_fires() {
        let timer = after::<i32>(Duration::from_secs(u64::MAX)).unwrap();
        assert_eq!(timers().unwrap().pending(), 0);
        assert!(!timer.is_closed());
    }

    // The timer thread and its queue are process-wide; count them in a fresh process.
    rusty_fork_test! {
        #[test]
        fn dropped_timers_are_cancelled_test() {
            dropped_timers_are_cancelled();
        }

        #[test]
        fn timers_share_one_thread_test() {
            timers_share_one_thread();
        }

        #[test]
        fn satisfied_timeouts_leave_nothing_behind_test() {
            satisfied_timeouts_leave_nothing_behind();
        }

        #[test]
        fn overflowing_deadline_never_fires_test() {
            overflowing_deadline_never_fires();
        }
    }
}
