//! Pool worker: one multiplexer, one thread.
//!
//! ```text
//!            ┌──────────── PoolWorker thread ─────────────┐
//!  attach ──▶│ scheduled tokens ─┐                        │
//!            │                   ▼                        │
//!   OS ─────▶│ poll(timeout) ─▶ Readiness ─▶ DispatchCommand ─▶ target.dispatch_pending()
//!            │                   ▲                        │
//!            │ re-armed tokens ──┘      idle sweep ───────│──▶ target.expire()
//!            └────────────────────────────────────────────┘
//! ```
//!
//! Handlers run synchronously on the worker thread right after their command
//! is appended, so commands for one socket are always handled in the order the
//! multiplexer reported them.

use std::{
    fmt, io, iter, mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread::{self, Builder, JoinHandle},
    time::{Duration, Instant},
};

use mio::{event::Source, Events, Poll, Token};
use parking_lot::Mutex;

use crate::{
    error::{NetworkError, Result},
    event::{DispatchCommand, Readiness},
    handler::{DispatchOutcome, DispatchTarget},
    net::traits::{LogLevel, Logger},
    poll::{PollHandle, WAKER_TOKEN},
};

/// Index of a worker inside its [`SocketPool`](crate::pool::SocketPool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Non-owning reference from a target back to the worker that drives it.
pub struct WorkerLink {
    worker: WorkerId,
    token: Token,
    shared: Weak<WorkerShared>,
}

impl WorkerLink {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Asks the worker to dispatch this target's queued commands on its next
    /// cycle. Returns `false` if the worker is gone.
    pub(crate) fn schedule(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) if shared.running.load(Ordering::Acquire) => {
                shared.schedule(self.token);
                true
            }
            _ => false,
        }
    }

    /// Drops the worker's table entry and deregisters `source`.
    /// Does nothing if the worker is already gone.
    pub(crate) fn detach<S>(&self, source: Option<&mut S>)
    where
        S: Source + ?Sized,
    {
        if let Some(shared) = self.shared.upgrade() {
            shared.poll.deregister(self.token);
            if let Some(source) = source {
                shared.poll.deregister_source(source);
            }
        }
    }
}

impl fmt::Debug for WorkerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLink")
            .field("worker", &self.worker)
            .field("token", &self.token)
            .finish()
    }
}

pub(crate) struct WorkerShared {
    id: WorkerId,
    poll: PollHandle,
    scheduled: Mutex<Vec<Token>>,
    running: AtomicBool,
    logger: Arc<dyn Logger>,
}

impl WorkerShared {
    fn dispatch<I>(&self, token: Token, commands: I) -> DispatchOutcome
    where
        I: IntoIterator<Item = DispatchCommand>,
    {
        // Stale tokens from already-detached sockets resolve to nothing.
        let Some(target) = self.poll.resolve(token) else {
            return DispatchOutcome::Idle;
        };
        for command in commands {
            target.append_command(command);
        }
        target.dispatch_pending()
    }

    fn schedule(&self, token: Token) {
        self.scheduled.lock().push(token);
        if let Err(e) = self.poll.wake() {
            self.logger.log(
                LogLevel::Error,
                &format!("{}: failed to wake poller: {}", self.id, e),
            );
        }
    }

    fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<_> = self
            .poll
            .targets()
            .into_iter()
            .filter(|target| target.is_expired(now))
            .collect();

        for target in &expired {
            target.expire();
        }
        expired.len()
    }
}

/// Owns a readiness multiplexer and the thread that waits on it.
pub struct PoolWorker {
    shared: Arc<WorkerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PoolWorker {
    pub fn spawn(
        id: WorkerId,
        events_capacity: usize,
        poll_timeout: Duration,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        let (poll, poller) = PollHandle::new()?;
        let shared = Arc::new(WorkerShared {
            id,
            poll,
            scheduled: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            logger,
        });

        let event_loop = EventLoop {
            poller,
            events: Events::with_capacity(events_capacity),
            shared: Arc::clone(&shared),
            poll_timeout,
            rearm: Vec::new(),
        };

        let thread = Builder::new()
            .name(format!("socket-pool-worker-{}", id.0))
            .spawn(move || event_loop.run())?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Number of targets currently pinned to this worker.
    pub fn load(&self) -> usize {
        self.shared.poll.len()
    }

    /// Pins `target` to this worker and registers it with the multiplexer.
    ///
    /// Safe to call from any thread. A `Readable` command is queued behind
    /// whatever the target already holds, so input that arrived before
    /// registration is drained on the first dispatch even if the multiplexer
    /// never reports it.
    pub fn attach(&self, target: Arc<dyn DispatchTarget>) -> Result<Token> {
        if !self.is_running() {
            return Err(NetworkError::WorkerGone);
        }

        let token = self.shared.poll.next_token();
        target.bind(WorkerLink {
            worker: self.shared.id,
            token,
            shared: Arc::downgrade(&self.shared),
        });
        if target.interest().is_readable() {
            target.append_command(DispatchCommand::Readable);
        }

        self.shared.poll.register(token, Arc::clone(&target))?;
        if !self.is_running() {
            // The loop may have run its final shutdown pass before the
            // registration landed.
            self.shared.poll.deregister(token);
            target.shutdown();
            return Err(NetworkError::WorkerGone);
        }
        self.shared.schedule(token);
        Ok(token)
    }

    /// Closes every expired target. Returns how many were closed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        self.shared.sweep_expired(now)
    }

    /// Stops the loop and waits for the thread, unless called from it.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let _ = self.shared.poll.wake();

        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                self.shared.logger.log(
                    LogLevel::Error,
                    &format!("{}: thread panicked", self.shared.id),
                );
            }
        }
    }
}

impl Drop for PoolWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

struct EventLoop {
    poller: Poll,
    events: Events,
    shared: Arc<WorkerShared>,
    poll_timeout: Duration,
    rearm: Vec<Token>,
}

impl EventLoop {
    fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        shared
            .logger
            .log(LogLevel::Debug, &format!("{}: started", shared.id));

        while shared.running.load(Ordering::Acquire) {
            let timeout = if self.rearm.is_empty() {
                self.poll_timeout
            } else {
                Duration::ZERO
            };

            if let Err(e) = self.poller.poll(&mut self.events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    shared
                        .logger
                        .log(LogLevel::Error, &format!("{}: poll failed: {}", shared.id, e));
                }
                continue;
            }

            let mut next_rearm = Vec::new();

            for event in self.events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                let readiness = Readiness::from(event);
                if shared.dispatch(readiness.token(), readiness.into_commands())
                    == DispatchOutcome::Rearm
                {
                    next_rearm.push(readiness.token());
                }
            }

            for token in mem::take(&mut self.rearm) {
                if shared.dispatch(token, [DispatchCommand::Readable]) == DispatchOutcome::Rearm {
                    next_rearm.push(token);
                }
            }

            let scheduled = mem::take(&mut *shared.scheduled.lock());
            for token in scheduled {
                if shared.dispatch(token, iter::empty()) == DispatchOutcome::Rearm {
                    next_rearm.push(token);
                }
            }

            let expired = shared.sweep_expired(Instant::now());
            if expired > 0 {
                shared.logger.log(
                    LogLevel::Info,
                    &format!("{}: closed {} idle connection(s)", shared.id, expired),
                );
            }

            self.rearm = next_rearm;
        }

        for target in shared.poll.targets() {
            target.shutdown();
        }
        shared
            .logger
            .log(LogLevel::Debug, &format!("{}: stopped", shared.id));
    }
}
