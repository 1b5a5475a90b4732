//! Readiness polling shared across socket roles.
//!
//! One [`Poller`] owns the mio poll instance for a role (Master, Worker
//! or Proxy); every socket the role uses registers here, so a single
//! bounded wait covers all of them. This is the only place a role
//! suspends: interrupts re-arm the wait with the remaining budget, and a
//! shared cancel flag lets an embedding abort from a signal handler.

use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

use super::{NetError, Timeout, remaining};
use crate::trace::trace;

/// Readiness poller with bounded, interrupt-tolerant waits.
pub struct Poller {
    poll: Poll,
    events: Events,
    next_token: usize,
    cancel: Arc<AtomicBool>,
}

impl Poller {
    /// Creates a poller with its own cancel flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS poll instance cannot be created.
    pub fn new() -> Result<Self, NetError> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            next_token: 0,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns the cancel flag checked after interrupted waits.
    ///
    /// Store `true` (typically from a signal handler thread) to make the
    /// current and all future waits fail with [`NetError::Interrupted`].
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Registers a socket for read and write readiness, allocating its token.
    pub(crate) fn register<S: Source>(&mut self, source: &mut S) -> Result<Token, NetError> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(source, token, Interest::READABLE | Interest::WRITABLE)?;
        Ok(token)
    }

    /// Waits for readiness on any registered socket, bounded by `timeout`.
    ///
    /// Returns the ready tokens; an empty vector means the wait elapsed
    /// or woke spuriously, and the caller decides whether budget remains.
    /// A signal interrupt re-arms the wait with the remaining budget
    /// unless the cancel flag was raised in the meantime.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Interrupted`] when cancelled, or an I/O error
    /// from the OS poll.
    pub fn wait(&mut self, timeout: Timeout) -> Result<Vec<Token>, NetError> {
        let deadline = timeout.deadline();
        loop {
            let budget = match remaining(deadline) {
                Some(left) => left,
                // Expired while re-arming: one final nonblocking check.
                None => Some(std::time::Duration::ZERO),
            };
            match self.poll.poll(&mut self.events, budget) {
                Ok(()) => {
                    let ready: Vec<Token> = self.events.iter().map(|ev| ev.token()).collect();
                    trace!(ready = ready.len(), "poll wake");
                    return Ok(ready);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {
                    if self.cancel.load(Ordering::Relaxed) {
                        return Err(NetError::Interrupted);
                    }
                }
                Err(e) => return Err(NetError::Io(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn wait_returns_empty_on_timeout() {
        let mut poller = Poller::new().unwrap();
        let start = std::time::Instant::now();
        let ready = poller.wait(Timeout::Duration(Duration::from_millis(20))).unwrap();
        assert!(ready.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn wait_zero_budget_does_not_block() {
        let mut poller = Poller::new().unwrap();
        let ready = poller.wait(Timeout::Duration(Duration::ZERO)).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn tokens_are_unique() {
        let mut poller = Poller::new().unwrap();
        let mut a = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut b = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let ta = poller.register(&mut a).unwrap();
        let tb = poller.register(&mut b).unwrap();
        assert_ne!(ta, tb);
    }
}
