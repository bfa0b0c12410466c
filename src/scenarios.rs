//! End-to-end select programs. Each scenario sets up a few workers blocked on channels, runs one
//! select against them and checks that whatever case won, the remaining exchanges still line up.
//!
//! Scenarios narrate what they do into a [`Transcript`]. The narration is emitted as `info!` events
//! (and written to the transcript's echo, if any) as it happens and is checked line by line against
//! the expected shape once the scenario is over.
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, ensure, Context, Result};
use thiserror::Error;
use tracing::{info, span, warn, Level};

use crate::channel::Channel;
use crate::select::{Outcome, Select};
use crate::thread;

/// How long to wait before giving up on workers that never block.
const SETTLE_LIMIT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    /// How long the `read` worker sleeps before sending.
    pub delay: Duration,
    /// Pause given to workers to block on their channels before the select runs.
    pub settle: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            delay: Duration::from_secs(1),
            settle: Duration::from_millis(100),
        }
    }
}

/// Narration of one scenario run. Clones share the same lines.
#[derive(Clone, Default)]
pub struct Transcript {
    inner: Arc<Mutex<Narration>>,
}

#[derive(Default)]
struct Narration {
    lines: Vec<String>,
    echo: Option<Box<dyn Write + Send>>,
}

impl fmt::Debug for Transcript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let narration = self.lock();
        f.debug_struct("Transcript")
            .field("lines", &narration.lines)
            .field("echo", &narration.echo.is_some())
            .finish()
    }
}

impl Transcript {
    pub fn new() -> Transcript {
        Transcript::default()
    }

    /// A transcript that also writes every line, as is, to `out`.
    pub fn echo_to(out: impl Write + Send + 'static) -> Transcript {
        Transcript {
            inner: Arc::new(Mutex::new(Narration {
                lines: Vec::new(),
                echo: Some(Box::new(out)),
            })),
        }
    }

    // Workers only push lines; a panicking one cannot leave the narration half-written.
    fn lock(&self) -> MutexGuard<'_, Narration> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn say(&self, line: impl Into<String>) {
        let line = line.into();
        info!("{}", line);
        let mut narration = self.lock();
        if let Some(out) = narration.echo.as_mut() {
            if let Err(e) = writeln!(out, "{}", line).and_then(|()| out.flush()) {
                warn!("Failed to echo transcript line: {}", e);
            }
        }
        narration.lines.push(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lock().lines.clone()
    }

    /// Check the narration against `expected`: one entry per line, each listing the prefixes
    /// that line may start with.
    pub fn check(&self, expected: &[&[&str]]) -> Result<()> {
        let lines = self.lines();
        ensure!(
            lines.len() == expected.len(),
            "expected {} lines, got {}: {:?}",
            expected.len(),
            lines.len(),
            lines
        );
        for (n, (line, prefixes)) in lines.iter().zip(expected).enumerate() {
            ensure!(
                prefixes.iter().any(|p| line.starts_with(p)),
                "line {} {:?} matches none of {:?}",
                n + 1,
                line,
                prefixes
            );
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
#[error("unknown scenario {0:?}")]
pub struct UnknownScenario(String);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scenario {
    Read,
    ReadDefault,
    ReadRead,
    ReadReadDefault,
    ReadWrite,
    ReadWriteDefault,
    WriteWrite,
    WriteWriteDefault,
}

impl Scenario {
    pub const ALL: [Scenario; 8] = [
        Scenario::Read,
        Scenario::ReadDefault,
        Scenario::ReadRead,
        Scenario::ReadReadDefault,
        Scenario::ReadWrite,
        Scenario::ReadWriteDefault,
        Scenario::WriteWrite,
        Scenario::WriteWriteDefault,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::Read => "read",
            Scenario::ReadDefault => "read_default",
            Scenario::ReadRead => "read_read",
            Scenario::ReadReadDefault => "read_read_default",
            Scenario::ReadWrite => "read_write",
            Scenario::ReadWriteDefault => "read_write_default",
            Scenario::WriteWrite => "write_write",
            Scenario::WriteWriteDefault => "write_write_default",
        }
    }

    /// Run the scenario and validate its narration.
    pub fn run(self, timing: &Timing) -> Result<Transcript> {
        self.run_with(timing, Transcript::new())
    }

    /// Like `run()`, narrating into `out`. `out` should start empty: its lines are checked
    /// against what this scenario alone says.
    pub fn run_with(self, timing: &Timing, out: Transcript) -> Result<Transcript> {
        let _e = span!(Level::INFO, "scenario", name = self.name()).entered();

        const READ_READ: &[&[&str]] = &[
            &["Writing 42 to ch1", "Writing 51 to ch2"],
            &["Writing 42 to ch1", "Writing 51 to ch2"],
            &["Received number 42 from ch1", "Received number 51 from ch2"],
        ];
        const READ_WRITE: &[&[&str]] = &[
            &["Writing 42 to ch1", "Reading from ch2"],
            &["Writing 42 to ch1", "Reading from ch2"],
            &["Received number 42 from ch1", "Sent number 51 to ch2"],
        ];
        const WRITE_WRITE: &[&[&str]] = &[
            &["Reading from ch1", "Reading from ch2"],
            &["Reading from ch1", "Reading from ch2"],
            &["Sent number 42 to ch1", "Sent number 51 to ch2"],
        ];

        match self {
            Scenario::Read => {
                read(timing, &out)?;
                out.check(&[&["Writing 42 to ch1"], &["Waited "]])?;
            }
            Scenario::ReadDefault => read_default(&out)?,
            Scenario::ReadRead => {
                read_read(timing, &out, false)?;
                out.check(READ_READ)?;
            }
            Scenario::ReadReadDefault => {
                read_read(timing, &out, true)?;
                out.check(READ_READ)?;
            }
            Scenario::ReadWrite => {
                read_write(timing, &out, false)?;
                out.check(READ_WRITE)?;
            }
            Scenario::ReadWriteDefault => {
                read_write(timing, &out, true)?;
                out.check(READ_WRITE)?;
            }
            Scenario::WriteWrite => {
                write_write(timing, &out, false)?;
                out.check(WRITE_WRITE)?;
            }
            Scenario::WriteWriteDefault => {
                write_write(timing, &out, true)?;
                out.check(WRITE_WRITE)?;
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = UnknownScenario;

    fn from_str(s: &str) -> Result<Scenario, UnknownScenario> {
        Scenario::ALL
            .iter()
            .copied()
            .find(|sc| sc.name() == s)
            .ok_or_else(|| UnknownScenario(s.to_string()))
    }
}

fn join(worker: JoinHandle<Result<()>>) -> Result<()> {
    worker
        .join()
        .map_err(|_| anyhow!("worker thread panicked"))?
        .context("worker failed")
}

/// Give the workers `settle` to block, then make sure they actually did.
fn settle(timing: &Timing, ready: impl Fn() -> bool) -> Result<()> {
    thread::sleep(timing.settle);
    let start = Instant::now();
    while !ready() {
        if start.elapsed() > SETTLE_LIMIT {
            bail!("workers did not block within {:?}", timing.settle + SETTLE_LIMIT);
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

fn sender(out: &Transcript, chan: &Channel<i32>, value: i32, name: &str) -> JoinHandle<Result<()>> {
    let (out, chan, name) = (out.clone(), chan.clone(), name.to_string());
    thread::spawn(move || -> Result<()> {
        out.say(format!("Writing {} to {}", value, name));
        chan.send(value)?;
        Ok(())
    })
}

/// Receive one value on `from` and pass it on to `to`.
fn forwarder(
    out: &Transcript,
    from: &Channel<i32>,
    to: &Channel<i32>,
    name: &str,
) -> JoinHandle<Result<()>> {
    let (out, from, to, name) = (out.clone(), from.clone(), to.clone(), name.to_string());
    thread::spawn(move || -> Result<()> {
        out.say(format!("Reading from {}", name));
        let x = from.recv()?;
        to.send(x)?;
        Ok(())
    })
}

/// The select blocks until the worker sends after `delay`.
fn read(timing: &Timing, out: &Transcript) -> Result<()> {
    let ch1 = Channel::new();

    let worker = {
        let (out, ch1, delay) = (out.clone(), ch1.clone(), timing.delay);
        thread::spawn(move || -> Result<()> {
            thread::sleep(delay);
            out.say("Writing 42 to ch1");
            ch1.send(42)?;
            Ok(())
        })
    };

    let start = Instant::now();
    let mut sel = Select::new();
    sel.recv(&ch1);
    match sel.select()? {
        Outcome::Received(_, Some(nb)) => {
            let elapsed = start.elapsed();
            out.say(format!("Waited {:?}", elapsed));
            ensure!(nb == 42, "received {} instead of 42", nb);
            ensure!(
                elapsed >= timing.delay,
                "select returned after {:?}, before the sender's {:?} delay",
                elapsed,
                timing.delay
            );
        }
        other => bail!("unexpected outcome {:?}", other),
    }
    join(worker)
}

/// Poll with a default until the worker, poked on the first default, sends.
fn read_default(out: &Transcript) -> Result<()> {
    let ch1 = Channel::new();
    let ch2 = Channel::<i32>::new();

    let worker = {
        let (out, ch1, ch2) = (out.clone(), ch1.clone(), ch2.clone());
        thread::spawn(move || -> Result<()> {
            ch2.recv()?;
            out.say("Writing 42 to ch1");
            ch1.send(42)?;
            Ok(())
        })
    };

    let mut from_ch1 = 0;
    let mut wrote_to_ch2 = false;
    let start = Instant::now();
    while from_ch1 == 0 {
        let mut sel = Select::new();
        sel.recv(&ch1);
        sel.with_default();
        match sel.select()? {
            Outcome::Received(_, Some(nb)) => {
                from_ch1 = nb;
                out.say(format!(
                    "Received number {} from ch1 after {:?}",
                    nb,
                    start.elapsed()
                ));
            }
            Outcome::DefaultTaken => {
                out.say("Selected default behavior");
                if !wrote_to_ch2 {
                    ch2.send(1)?;
                    wrote_to_ch2 = true;
                }
                thread::yield_now();
            }
            other => bail!("unexpected outcome {:?}", other),
        }
    }
    join(worker)?;

    let lines = out.lines();
    ensure!(from_ch1 == 42, "received {} instead of 42", from_ch1);
    ensure!(
        lines.first().map(String::as_str) == Some("Selected default behavior"),
        "the first select must take the default: {:?}",
        lines
    );
    ensure!(
        lines.iter().filter(|l| *l == "Writing 42 to ch1").count() == 1,
        "expected exactly one write: {:?}",
        lines
    );
    ensure!(
        lines
            .last()
            .map_or(false, |l| l.starts_with("Received number 42 from ch1 after")),
        "the loop must end on the receive: {:?}",
        lines
    );
    Ok(())
}

/// Two senders are blocked; the select takes one of them and the other value is still there.
fn read_read(timing: &Timing, out: &Transcript, default: bool) -> Result<()> {
    let ch1 = Channel::new();
    let ch2 = Channel::new();
    let w1 = sender(out, &ch1, 42, "ch1");
    let w2 = sender(out, &ch2, 51, "ch2");
    settle(timing, || ch1.waiting_senders() == 1 && ch2.waiting_senders() == 1)?;

    let mut sel = Select::new();
    sel.recv(&ch1);
    sel.recv(&ch2);
    if default {
        sel.with_default();
    }
    match sel.select()? {
        Outcome::Received(0, Some(nb)) => {
            out.say(format!("Received number {} from ch1", nb));
            ensure!(nb == 42, "received {} from ch1", nb);
            ensure!(ch2.recv()? == 51, "We should be able to read '51' from ch2");
        }
        Outcome::Received(1, Some(nb)) => {
            out.say(format!("Received number {} from ch2", nb));
            ensure!(nb == 51, "received {} from ch2", nb);
            ensure!(ch1.recv()? == 42, "We should be able to read '42' from ch1");
        }
        Outcome::DefaultTaken => bail!("Selected default behavior"),
        other => bail!("unexpected outcome {:?}", other),
    }
    join(w1)?;
    join(w2)
}

/// A blocked sender on ch1 and a blocked forwarder ch2 -> ch1; the select either receives on ch1
/// or sends on ch2.
fn read_write(timing: &Timing, out: &Transcript, default: bool) -> Result<()> {
    let ch1 = Channel::new();
    let ch2 = Channel::new();
    let w1 = sender(out, &ch1, 42, "ch1");
    let w2 = forwarder(out, &ch2, &ch1, "ch2");
    settle(timing, || ch1.waiting_senders() == 1 && ch2.waiting_receivers() == 1)?;

    let mut sel = Select::new();
    sel.recv(&ch1);
    sel.send(&ch2, 51);
    if default {
        sel.with_default();
    }
    match sel.select()? {
        Outcome::Received(_, Some(nb)) => {
            out.say(format!("Received number {} from ch1", nb));
            ensure!(nb == 42, "received {} from ch1", nb);
            ch2.send(17)?;
            ensure!(ch1.recv()? == 17, "We should be able to read 17 from ch1");
        }
        Outcome::Sent(_) => {
            out.say("Sent number 51 to ch2");
            // The first sender was queued on ch1 before the forwarder got there.
            ensure!(ch1.recv()? == 42, "We should be able to read '42' from ch1");
            ensure!(ch1.recv()? == 51, "the forwarder should pass 51 on to ch1");
        }
        Outcome::DefaultTaken => bail!("Selected default behavior"),
        other => bail!("unexpected outcome {:?}", other),
    }
    join(w1)?;
    join(w2)
}

/// Two blocked echo workers; exactly one gets the select's value, the other then gets 17.
fn write_write(timing: &Timing, out: &Transcript, default: bool) -> Result<()> {
    let (ch1a, ch1b) = (Channel::new(), Channel::new());
    let (ch2a, ch2b) = (Channel::new(), Channel::new());
    let w1 = forwarder(out, &ch1a, &ch1b, "ch1");
    let w2 = forwarder(out, &ch2a, &ch2b, "ch2");
    settle(timing, || ch1a.waiting_receivers() == 1 && ch2a.waiting_receivers() == 1)?;

    let mut sel = Select::new();
    sel.send(&ch1a, 42);
    sel.send(&ch2a, 51);
    if default {
        sel.with_default();
    }
    match sel.select()? {
        Outcome::Sent(0) => {
            out.say("Sent number 42 to ch1");
            // Making sure the send on ch2 did not happen as well.
            ch2a.send(17)?;
            ensure!(ch1b.recv()? == 42, "We should be able to read 42 from ch1B");
            ensure!(ch2b.recv()? == 17, "We should be able to read 17 from ch2B");
        }
        Outcome::Sent(_) => {
            out.say("Sent number 51 to ch2");
            ch1a.send(17)?;
            ensure!(ch2b.recv()? == 51, "We should be able to read 51 from ch2B");
            ensure!(ch1b.recv()? == 17, "We should be able to read 17 from ch1B");
        }
        Outcome::DefaultTaken => bail!("Selected default behavior"),
        other => bail!("unexpected outcome {:?}", other),
    }
    join(w1)?;
    join(w2)
}
