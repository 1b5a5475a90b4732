//! Execution context a worker evaluates calls against.
//!
//! The hub side never interprets calls, results, or profiling values;
//! this seam is where an embedding application plugs in its own codec
//! and evaluator.

use std::sync::OnceLock;

use minstant::Instant;
use thiserror::Error;

/// Evaluation failure carrying the serialized error value to reply
/// with. Evaluation errors are ordinary results to the protocol: the
/// worker sends the wrapped value back and keeps serving.
#[derive(Debug, Error)]
#[error("call evaluation failed")]
pub struct EvalError {
    wrapped: Vec<u8>,
}

impl EvalError {
    #[must_use]
    pub fn new(wrapped: Vec<u8>) -> Self {
        Self { wrapped }
    }

    /// The serialized error value, ready to use as a reply payload.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.wrapped
    }
}

/// Module load failure. Unlike evaluation errors this is fatal to the
/// worker: a missing module means every subsequent call would fail.
#[derive(Debug, Error)]
#[error("failed to load module {name}: {reason}")]
pub struct ModuleError {
    pub name: String,
    pub reason: String,
}

/// Profiling snapshot reported with each reply. Opaque to the hub,
/// which stores the encoded frames without interpreting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    /// Wall-clock microseconds since a process-local origin.
    pub time_us: u64,
    /// Resident set size in bytes, zero when unavailable.
    pub mem_bytes: u64,
}

impl Profile {
    #[must_use]
    pub fn time_frame(&self) -> Vec<u8> {
        self.time_us.to_le_bytes().to_vec()
    }

    #[must_use]
    pub fn mem_frame(&self) -> Vec<u8> {
        self.mem_bytes.to_le_bytes().to_vec()
    }
}

/// What a worker needs from its embedding application.
pub trait Executor {
    /// Installs a serialized value under `name` for later calls to use.
    fn bind(&mut self, name: &str, value: &[u8]);

    /// Loads the module `name` (the reserved-prefix form of an env
    /// entry, with the prefix already stripped).
    ///
    /// # Errors
    ///
    /// A load failure aborts the worker.
    fn load_module(&mut self, name: &str) -> Result<(), ModuleError>;

    /// Evaluates a serialized call against the current bindings.
    ///
    /// # Errors
    ///
    /// Returns the serialized error value to reply with; the worker
    /// stays up.
    fn eval(&mut self, call: &[u8]) -> Result<Vec<u8>, EvalError>;

    /// Profiling snapshot appended to each reply.
    fn snapshot(&mut self) -> Profile {
        system_snapshot()
    }
}

/// Default profiling source: wall clock plus resident set size.
#[must_use]
pub fn system_snapshot() -> Profile {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let origin = ORIGIN.get_or_init(Instant::now);
    let time_us = u64::try_from(origin.elapsed().as_micros()).unwrap_or(u64::MAX);
    Profile {
        time_us,
        mem_bytes: resident_bytes().unwrap_or(0),
    }
}

/// Resident set size from /proc/self/statm, assuming 4 KiB pages.
fn resident_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}
