use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use mio::{event::Source, Poll, Registry, Token};
use parking_lot::Mutex;

use crate::handler::DispatchTarget;

/// Token reserved for the worker's waker.
pub const WAKER_TOKEN: Token = Token(0);

/// Thread-safe side of one multiplexer: the registry, the token table and the
/// waker. The `Poll` itself stays with the worker thread.
pub struct PollHandle {
    registry: Registry,
    table: Mutex<HashMap<Token, Arc<dyn DispatchTarget>>>,
    waker: mio::Waker,
    next_token: AtomicUsize,
}

impl PollHandle {
    /// Creates a multiplexer and returns the `Poll` to hand to the loop thread.
    pub fn new() -> io::Result<(Self, Poll)> {
        let poller = Poll::new()?;
        let registry = poller.registry().try_clone()?;
        let waker = mio::Waker::new(poller.registry(), WAKER_TOKEN)?;
        Ok((
            PollHandle {
                registry,
                table: Mutex::new(HashMap::new()),
                waker,
                next_token: AtomicUsize::new(WAKER_TOKEN.0 + 1),
            },
            poller,
        ))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Adds `target` under `token` and registers its source.
    ///
    /// The table entry goes in first so that an event arriving right after
    /// the OS registration can always be resolved.
    pub fn register(&self, token: Token, target: Arc<dyn DispatchTarget>) -> io::Result<()> {
        self.table.lock().insert(token, Arc::clone(&target));
        if let Err(e) = target.register(&self.registry, token) {
            self.table.lock().remove(&token);
            return Err(e);
        }
        Ok(())
    }

    /// Removes `token` from the table.
    pub fn deregister(&self, token: Token) -> Option<Arc<dyn DispatchTarget>> {
        self.table.lock().remove(&token)
    }

    /// Removes `source` from the multiplexer. Already-closed sources are ignored.
    pub fn deregister_source<S>(&self, source: &mut S)
    where
        S: Source + ?Sized,
    {
        let _ = self.registry.deregister(source);
    }

    pub fn resolve(&self, token: Token) -> Option<Arc<dyn DispatchTarget>> {
        self.table.lock().get(&token).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Snapshot of every attached target.
    pub fn targets(&self) -> Vec<Arc<dyn DispatchTarget>> {
        self.table.lock().values().cloned().collect()
    }

    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DispatchCommand;
    use crate::handler::DispatchOutcome;
    use crate::worker::WorkerLink;
    use mio::{Events, Interest};
    use std::time::Duration;

    struct Quiet;

    impl DispatchTarget for Quiet {
        fn interest(&self) -> Interest {
            Interest::READABLE
        }
        fn register(&self, _: &Registry, _: Token) -> io::Result<()> {
            Ok(())
        }
        fn bind(&self, _: WorkerLink) {}
        fn append_command(&self, _: DispatchCommand) {}
        fn dispatch_pending(&self) -> DispatchOutcome {
            DispatchOutcome::Idle
        }
        fn shutdown(&self) {}
    }

    struct Refusing;

    impl DispatchTarget for Refusing {
        fn interest(&self) -> Interest {
            Interest::READABLE
        }
        fn register(&self, _: &Registry, _: Token) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "refused"))
        }
        fn bind(&self, _: WorkerLink) {}
        fn append_command(&self, _: DispatchCommand) {}
        fn dispatch_pending(&self) -> DispatchOutcome {
            DispatchOutcome::Idle
        }
        fn shutdown(&self) {}
    }

    #[test]
    fn test_tokens_skip_waker() {
        let (handle, _poll) = PollHandle::new().unwrap();
        assert_ne!(handle.next_token(), WAKER_TOKEN);
    }

    #[test]
    fn test_register_resolve_deregister() {
        let (handle, _poll) = PollHandle::new().unwrap();
        let token = handle.next_token();
        handle.register(token, Arc::new(Quiet)).unwrap();
        assert!(handle.resolve(token).is_some());
        assert_eq!(handle.len(), 1);

        assert!(handle.deregister(token).is_some());
        assert!(handle.deregister(token).is_none());
        assert!(handle.is_empty());
    }

    #[test]
    fn test_failed_registration_leaves_no_entry() {
        let (handle, _poll) = PollHandle::new().unwrap();
        let token = handle.next_token();
        assert!(handle.register(token, Arc::new(Refusing)).is_err());
        assert!(handle.resolve(token).is_none());
    }

    #[test]
    fn test_wake_interrupts_poll() {
        let (handle, mut poll) = PollHandle::new().unwrap();
        let mut events = Events::with_capacity(8);
        handle.wake().unwrap();
        poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert!(events.iter().any(|e| e.token() == WAKER_TOKEN));
    }
}
