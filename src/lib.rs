//! Unbuffered rendezvous channels with a randomized multi-way select.
//!
//! ```
//! use rendezvous::{Channel, Outcome, Select};
//!
//! let ch1 = Channel::new();
//! let ch2 = Channel::new();
//!
//! let sender = ch1.clone();
//! let h = rendezvous::thread::spawn(move || sender.send(42));
//!
//! let mut sel = Select::new();
//! sel.recv(&ch1);
//! sel.recv(&ch2);
//! assert_eq!(sel.select(), Ok(Outcome::Received(0, Some(42))));
//! h.join().unwrap().unwrap();
//! ```
use std::collections::hash_map::DefaultHasher;
use std::env::var;
use std::env::VarError;
use std::hash::{Hash, Hasher};

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::level_filters::LevelFilter;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

pub mod channel;
pub mod error;
pub mod scenarios;
pub mod select;
pub mod thread;
mod timer;
mod waiter;
#[cfg(test)]
pub mod test;

pub use crate::channel::{after, Channel, ChannelId, Iter};
pub use crate::error::{
    AlreadyClosedError, ClosedError, RecvError, RecvTimeoutError, SelectError, TryRecvError,
    TrySendError,
};
pub use crate::select::{Outcome, Select};

/// Environment variable fixing the shuffle order of every select in the process.
pub const SEED_VAR: &str = "RENDEZVOUS_SELECT_SEED";

/// Seed for select shuffling. Initialized from environment variable RENDEZVOUS_SELECT_SEED. `None`
/// means every thread seeds from OS entropy.
pub static SELECT_SEED: Lazy<Option<u64>> = Lazy::new(|| {
    let seed = match var(SEED_VAR) {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(seed) => Some(seed),
            Err(e) => {
                warn!("Invalid {} value {:?}: {}. Using random seeds.", SEED_VAR, value, e);
                None
            }
        },
        Err(VarError::NotPresent) => None,
        Err(e @ VarError::NotUnicode(_)) => {
            warn!("{} value is not valid unicode: {}, using random seeds.", SEED_VAR, e);
            None
        }
    };

    debug!("Select seed {:?} selected.", seed);
    seed
});

/// Shuffle source for the current thread. With a configured seed, threads with the same name get
/// the same sequence across runs.
pub(crate) fn new_select_rng() -> StdRng {
    match *SELECT_SEED {
        Some(seed) => {
            let mut hasher = DefaultHasher::new();
            seed.hash(&mut hasher);
            std::thread::current().name().hash(&mut hasher);
            StdRng::seed_from_u64(hasher.finish())
        }
        None => StdRng::from_entropy(),
    }
}

/// Log filter for our binaries and tests: `RUST_LOG` when it names a single level (`debug`,
/// `trace`, ...), `default` otherwise. Per-target directives are not honored: directive parsing
/// in the pinned tracing-subscriber release panics, so only the plain level form is read.
pub fn env_filter(default: LevelFilter) -> EnvFilter {
    let level = match var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => match value.trim().parse::<LevelFilter>() {
            Ok(level) => level,
            Err(_) => {
                warn!(
                    "{} value {:?} is not a plain level. Logging at {}.",
                    EnvFilter::DEFAULT_ENV,
                    value,
                    default
                );
                default
            }
        },
        Err(VarError::NotPresent) => default,
        Err(e @ VarError::NotUnicode(_)) => {
            warn!("{} value is not valid unicode: {}.", EnvFilter::DEFAULT_ENV, e);
            default
        }
    };
    EnvFilter::default().add_directive(level.into())
}
