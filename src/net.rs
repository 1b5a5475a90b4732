//! Network transport primitives.
//!
//! Provides the identity-addressed multipart socket layer the dispatch
//! protocol runs on: a hub-side [`RouterSocket`] that can address any
//! previously-seen peer by its [`RoutingId`], and a peer-side
//! [`DealerSocket`] holding one upstream connection whose loss surfaces
//! as an explicit [`DealerEvent::Disconnected`] event. Both are
//! non-blocking mio sockets multiplexed through a shared [`Poller`];
//! suspension happens only inside [`Poller::wait`].

pub mod endpoint;
pub mod frames;
pub mod poller;
pub mod socket;

pub use endpoint::Endpoint;
pub use frames::{FramingError, Multipart};
pub use poller::Poller;
pub use socket::{DealerEvent, DealerSocket, RouterSocket, RoutingId, has_connectivity};

use std::io;
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

/// Connect timeout applied when a caller does not pick its own.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

impl Timeout {
    /// Converts to an absolute deadline; `None` means unbounded.
    #[must_use]
    pub fn deadline(self) -> Option<Instant> {
        match self {
            Self::Infinite => None,
            Self::Duration(d) => Some(Instant::now() + d),
        }
    }
}

/// Time left until `deadline`, or `None` once it has passed.
///
/// The unbounded case maps to `Some(None)` so callers can hand the inner
/// value straight to a poll primitive.
#[must_use]
pub fn remaining(deadline: Option<Instant>) -> Option<Option<Duration>> {
    match deadline {
        None => Some(None),
        Some(dl) => dl.checked_duration_since(Instant::now()).map(Some),
    }
}

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum NetError {
    /// Underlying socket I/O failure.
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    /// A bind failed for a reason other than the address being taken.
    #[error("bind {addr}: {source}")]
    Bind { addr: Endpoint, source: io::Error },
    /// Every candidate address in the pool was already in use.
    #[error("no bindable address in pool")]
    AddrPoolExhausted,
    /// An outbound connection was refused or reset during setup.
    #[error("connect {addr}: {source}")]
    Connect { addr: Endpoint, source: io::Error },
    /// The connect deadline passed before the peer accepted.
    #[error("connect to {0} timed out")]
    ConnectTimeout(Endpoint),
    /// Addressed send to a routing id the socket does not know.
    #[error("unknown peer {0}")]
    UnknownPeer(RoutingId),
    /// Send attempted after the connection was already lost.
    #[error("connection closed")]
    Closed,
    /// A bounded wait was cancelled through the cancel flag.
    #[error("wait interrupted")]
    Interrupted,
    /// Malformed multipart framing on the stream.
    #[error("framing: {0}")]
    Framing(#[from] FramingError),
    /// An endpoint string could not be parsed or resolved.
    #[error("invalid address '{0}'")]
    Addr(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_from_duration() {
        let t: Timeout = Duration::from_millis(50).into();
        assert!(matches!(t, Timeout::Duration(d) if d == Duration::from_millis(50)));
    }

    #[test]
    fn infinite_deadline_is_none() {
        assert!(Timeout::Infinite.deadline().is_none());
        assert_eq!(remaining(None), Some(None));
    }

    #[test]
    fn elapsed_deadline_reports_expiry() {
        let dl = Timeout::Duration(Duration::ZERO).deadline();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(remaining(dl), None);
    }

    #[test]
    fn future_deadline_reports_budget() {
        let dl = Timeout::Duration(Duration::from_secs(60)).deadline();
        let left = remaining(dl).and_then(|r| r);
        assert!(left.is_some_and(|d| d > Duration::from_secs(59)));
    }
}
