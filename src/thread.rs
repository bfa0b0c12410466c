//! Thread spawning wrappers. Every thread started through here gets a name (so it shows up in log
//! lines and seeds its select shuffle distinctly) and runs inside a tracing span carrying that
//! name.
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;
pub use std::thread::{current, sleep, yield_now};

use tracing::{event, span, Level};

/// Numbering for threads spawned without an explicit name. One-based.
static NEXT_WORKER: AtomicU32 = AtomicU32::new(1);

/// Wrapper around thread::spawn which names the thread `worker-N`.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    Builder::new()
        .spawn(f)
        .unwrap_or_else(|e| panic!("failed to spawn thread: {}", e))
}

/// Wrapper around std::thread::Builder.
pub struct Builder {
    builder: std::thread::Builder,
    named: bool,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            builder: std::thread::Builder::new(),
            named: false,
        }
    }

    pub fn name(self, name: String) -> Builder {
        Builder {
            builder: self.builder.name(name),
            named: true,
        }
    }

    pub fn stack_size(self, size: usize) -> Builder {
        Builder {
            builder: self.builder.stack_size(size),
            named: self.named,
        }
    }

    pub fn spawn<F, T>(self, f: F) -> std::io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T,
        F: Send + 'static,
        T: Send + 'static,
    {
        let builder = if self.named {
            self.builder
        } else {
            let n = NEXT_WORKER.fetch_add(1, Ordering::Relaxed);
            self.builder.name(format!("worker-{}", n))
        };

        builder.spawn(move || {
            let t = current();
            // Spans are thread-local, so this one covers the entire execution of the child.
            let _e = span!(Level::INFO, "Thread", name = t.name().unwrap_or("None")).entered();
            event!(Level::TRACE, "New Thread Spawned!");
            let h = f();
            event!(Level::TRACE, "Thread Finished.");
            h
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}
