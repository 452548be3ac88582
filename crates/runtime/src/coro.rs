//! The suspendable execution unit behind every wire
//!
//! Each wire body runs inside a `may` green thread. Control transfer is a
//! rendezvous over two channels:
//!
//! - the scheduler side calls [`WireCoro::resume`], which sends a resume
//!   message and blocks until the coroutine yields or finishes;
//! - the coroutine side calls [`Yielder::suspend`], which sends a yield
//!   message and blocks until the next resume.
//!
//! Blocking on these channels parks cooperatively inside a coroutine and
//! parks the OS thread outside one, so meshes (plain threads) and nested
//! wire drivers (coroutines) use the same primitive. All local state lives
//! on the coroutine's own stack and survives every suspension.
//!
//! Cancellation rides the resume channel: a wire being stopped receives
//! `Resume::Cancel` at its next suspension point and unwinds cleanly from
//! there. Nothing ever unwinds across the coroutine boundary.

use may::sync::mpmc;
use std::sync::Once;
use std::time::Instant;

/// Default coroutine stack size: 1 MiB. Deep `Do` chains nest activation
/// frames on this stack, so the default is generous.
const DEFAULT_STACK_SIZE: usize = 0x100000;

static RUNTIME_INIT: Once = Once::new();

/// Parse a stack size from an optional string value, falling back to the
/// default when the value is missing, zero, or unparsable.
fn parse_stack_size(env_value: Option<String>) -> usize {
    match env_value {
        Some(val) => match val.parse::<usize>() {
            Ok(0) => {
                tracing::warn!("WEFT_STACK_SIZE=0 is invalid, using default {DEFAULT_STACK_SIZE}");
                DEFAULT_STACK_SIZE
            }
            Ok(size) => size,
            Err(_) => {
                tracing::warn!(
                    "WEFT_STACK_SIZE='{val}' is not a valid number, using default {DEFAULT_STACK_SIZE}"
                );
                DEFAULT_STACK_SIZE
            }
        },
        None => DEFAULT_STACK_SIZE,
    }
}

/// Process-wide coroutine runtime configuration. Idempotent; called by
/// every spawn so hosts never need to remember it.
pub fn init_runtime() {
    RUNTIME_INIT.call_once(|| {
        let stack_size = parse_stack_size(std::env::var("WEFT_STACK_SIZE").ok());
        may::config().set_stack_size(stack_size);
        // a coroutine that pins its worker (the parallel runners join
        // their scoped threads in place) must never leave zero workers
        // for the wires it is driving
        let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2).max(2);
        may::config().set_workers(workers);
    });
}

/// The configured default stack size for wire coroutines.
pub fn default_stack_size() -> usize {
    parse_stack_size(std::env::var("WEFT_STACK_SIZE").ok())
}

/// Message from the scheduler into the coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Run until the next suspension point.
    Step,
    /// Unwind: run cleanup and finish.
    Cancel,
}

/// Message from the coroutine back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Yield {
    /// Parked at a suspension point; do not resume before `until`.
    Suspended { until: Option<Instant> },
    /// The body returned; the coroutine is gone.
    Finished,
}

/// Scheduler-side handle. Cloning shares the same underlying coroutine.
#[derive(Clone)]
pub struct WireCoro {
    resume_tx: mpmc::Sender<Resume>,
    yield_rx: mpmc::Receiver<Yield>,
}

impl WireCoro {
    /// Spawn a coroutine around `body`. The body does not start running
    /// until the first [`WireCoro::resume`]; it receives the yielder plus
    /// the first resume message, so a cancel-before-start is observable.
    pub fn spawn<F>(body: F, stack_size: usize) -> std::io::Result<WireCoro>
    where
        F: FnOnce(Yielder, Resume) + Send + 'static,
    {
        init_runtime();

        let (resume_tx, resume_rx) = mpmc::channel();
        let (yield_tx, yield_rx) = mpmc::channel();

        let yielder = Yielder { yield_tx: yield_tx.clone(), resume_rx };

        let builder = may::coroutine::Builder::new().stack_size(stack_size);
        // Safety: the closure owns everything it touches; no TLS from the
        // spawning thread leaks into the coroutine.
        let handle = unsafe {
            builder.spawn(move || {
                let first = yielder.wait_resume();
                body(yielder, first);
                // the body may have finished by returning or by cancel;
                // either way the scheduler side needs a final message
                let _ = yield_tx.send(Yield::Finished);
            })
        }?;
        drop(handle); // detach; completion is signaled via the yield channel

        Ok(WireCoro { resume_tx, yield_rx })
    }

    /// Drive one step. Returns the coroutine's yield, or `Finished` when it
    /// is already gone.
    pub fn resume(&self) -> Yield {
        if self.resume_tx.send(Resume::Step).is_err() {
            return Yield::Finished;
        }
        self.yield_rx.recv().unwrap_or(Yield::Finished)
    }

    /// Request cooperative cancellation and wait for the coroutine to
    /// finish unwinding.
    pub fn cancel(&self) -> Yield {
        if self.resume_tx.send(Resume::Cancel).is_err() {
            return Yield::Finished;
        }
        loop {
            match self.yield_rx.recv() {
                Ok(Yield::Finished) | Err(_) => return Yield::Finished,
                // a suspend raced the cancel; the next wakeup sees it
                Ok(Yield::Suspended { .. }) => {
                    if self.resume_tx.send(Resume::Cancel).is_err() {
                        return Yield::Finished;
                    }
                }
            }
        }
    }
}

/// Coroutine-side handle.
pub struct Yielder {
    yield_tx: mpmc::Sender<Yield>,
    resume_rx: mpmc::Receiver<Resume>,
}

impl Yielder {
    /// Park until the scheduler resumes us. A closed channel counts as a
    /// cancel so orphaned coroutines always unwind.
    pub fn suspend(&self, until: Option<Instant>) -> Resume {
        if self.yield_tx.send(Yield::Suspended { until }).is_err() {
            return Resume::Cancel;
        }
        self.wait_resume()
    }

    fn wait_resume(&self) -> Resume {
        self.resume_rx.recv().unwrap_or(Resume::Cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    #[serial]
    fn test_body_runs_lazily() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        let coro = WireCoro::spawn(
            move |_y, first| {
                assert_eq!(first, Resume::Step);
                hits2.fetch_add(1, Ordering::SeqCst);
            },
            DEFAULT_STACK_SIZE,
        )
        .unwrap();

        // not started yet
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert_eq!(coro.resume(), Yield::Finished);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[serial]
    fn test_locals_survive_suspension() {
        let coro = WireCoro::spawn(
            |y, _first| {
                let mut acc = 0u64;
                for i in 1..=3u64 {
                    acc += i;
                    if y.suspend(None) == Resume::Cancel {
                        return;
                    }
                }
                assert_eq!(acc, 6);
            },
            DEFAULT_STACK_SIZE,
        )
        .unwrap();

        assert!(matches!(coro.resume(), Yield::Suspended { .. }));
        assert!(matches!(coro.resume(), Yield::Suspended { .. }));
        assert!(matches!(coro.resume(), Yield::Suspended { .. }));
        assert_eq!(coro.resume(), Yield::Finished);
    }

    #[test]
    #[serial]
    fn test_cancel_before_start() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        let coro = WireCoro::spawn(
            move |_y, first| {
                if first == Resume::Cancel {
                    return;
                }
                hits2.fetch_add(1, Ordering::SeqCst);
            },
            DEFAULT_STACK_SIZE,
        )
        .unwrap();

        assert_eq!(coro.cancel(), Yield::Finished);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[serial]
    fn test_cancel_at_suspension_point() {
        let coro = WireCoro::spawn(
            |y, _first| loop {
                if y.suspend(None) == Resume::Cancel {
                    return;
                }
            },
            DEFAULT_STACK_SIZE,
        )
        .unwrap();

        assert!(matches!(coro.resume(), Yield::Suspended { .. }));
        assert_eq!(coro.cancel(), Yield::Finished);
    }

    #[test]
    #[serial]
    fn test_resume_after_finish_is_finished() {
        let coro = WireCoro::spawn(|_y, _first| {}, DEFAULT_STACK_SIZE).unwrap();
        assert_eq!(coro.resume(), Yield::Finished);
        assert_eq!(coro.resume(), Yield::Finished);
    }

    #[test]
    fn test_parse_stack_size() {
        assert_eq!(parse_stack_size(None), DEFAULT_STACK_SIZE);
        assert_eq!(parse_stack_size(Some("2097152".into())), 2097152);
        assert_eq!(parse_stack_size(Some("0".into())), DEFAULT_STACK_SIZE);
        assert_eq!(parse_stack_size(Some("nope".into())), DEFAULT_STACK_SIZE);
        assert_eq!(parse_stack_size(Some("-1".into())), DEFAULT_STACK_SIZE);
    }
}
