use std::io;
use std::time::Instant;

use mio::{Interest, Registry, Token};

use crate::event::DispatchCommand;
use crate::worker::WorkerLink;

/// Result of draining a target's command queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Everything queued was handled.
    Idle,
    /// The handler stopped early to give other sockets a turn; the worker
    /// queues another `Readable` on its next cycle.
    Rearm,
}

/// Something a [`PoolWorker`](crate::worker::PoolWorker) can own and drive.
///
/// The worker appends commands and then calls [`dispatch_pending`] on its own
/// thread, so a target never sees two of its handlers run concurrently from
/// the worker side.
///
/// [`dispatch_pending`]: DispatchTarget::dispatch_pending
pub trait DispatchTarget: Send + Sync {
    fn interest(&self) -> Interest;

    /// Registers the native source with the worker's multiplexer.
    fn register(&self, registry: &Registry, token: Token) -> io::Result<()>;

    /// Records which worker and token own this target.
    fn bind(&self, link: WorkerLink);

    fn append_command(&self, command: DispatchCommand);

    fn dispatch_pending(&self) -> DispatchOutcome;

    fn is_expired(&self, now: Instant) -> bool {
        let _ = now;
        false
    }

    /// Force-closes a target found expired by the idle sweep.
    fn expire(&self) {}

    /// Called for every target still attached when the worker stops.
    fn shutdown(&self);
}
