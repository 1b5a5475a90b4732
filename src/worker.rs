//! The peer side: register with a hub, then serve one call at a time.
//!
//! A worker connects to a master (or to a proxy, which it cannot tell
//! apart), announces itself, and loops: receive a directive, install
//! env updates, evaluate the call, reply with the result and a fresh
//! profiling snapshot. Evaluation failures are replies, not crashes;
//! losing the hub mid-protocol is a crash.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use thiserror::Error;

use crate::exec::{Executor, ModuleError};
use crate::net::{DealerEvent, DealerSocket, Endpoint, NetError, Poller, Timeout};
use crate::trace::{debug, info, warn};
use crate::wire::{Directive, MODULE_PREFIX, Report, Status, WireError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The hub vanished while no reply was pending.
    #[error("hub connection lost")]
    HubGone,
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error("unexpected directive status {0}")]
    UnexpectedDirective(Status),
}

pub struct Worker<E: Executor> {
    poller: Poller,
    sock: DealerSocket,
    exec: E,
}

impl<E: Executor> Worker<E> {
    /// Connects to the hub within `timeout` and registers, consuming
    /// one pending-worker slot on the master.
    ///
    /// # Errors
    ///
    /// Connection refusal and timeout surface here; registration bytes
    /// that cannot be sent surface as a transport error.
    pub fn connect(addr: Endpoint, timeout: Timeout, exec: E) -> Result<Self, WorkerError> {
        let mut poller = Poller::new()?;
        let sock = DealerSocket::connect(&mut poller, addr, timeout)?;
        let mut worker = Self { poller, sock, exec };
        let profile = worker.exec.snapshot();
        let report = Report {
            status: Status::Active,
            time: profile.time_frame(),
            mem: profile.mem_frame(),
            payload: Some(Vec::new()),
        };
        worker.sock.send(&report.to_frames())?;
        info!(%addr, "worker registered");
        Ok(worker)
    }

    /// The executor, for embedders that need to inspect or prime it.
    pub fn executor(&self) -> &E {
        &self.exec
    }

    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.exec
    }

    /// Flag that aborts a blocked [`Self::process_one`] when raised
    /// from another thread.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.poller.cancel_flag()
    }

    /// Blocks for one directive and serves it.
    ///
    /// Returns `false` when the directive was a shutdown; the caller
    /// then calls [`Self::close`] (or just drops the worker).
    ///
    /// # Errors
    ///
    /// [`WorkerError::HubGone`] when the connection dies while waiting,
    /// [`WorkerError::Module`] when a module load fails; evaluation
    /// failures are not errors, they become the reply payload.
    pub fn process_one(&mut self) -> Result<bool, WorkerError> {
        let frames = loop {
            match self.sock.recv() {
                Some(DealerEvent::Message(frames)) => break frames,
                Some(DealerEvent::Disconnected) => return Err(WorkerError::HubGone),
                None => {
                    let ready = self.poller.wait(Timeout::Infinite)?;
                    self.sock.pump(&ready)?;
                }
            }
        };
        let directive = Directive::parse(&frames)?;
        match directive.status {
            Status::Shutdown => {
                info!("shutdown directive received");
                Ok(false)
            }
            Status::Active => {
                for (name, value) in &directive.env {
                    if let Some(module) = name.strip_prefix(MODULE_PREFIX) {
                        self.exec.load_module(module)?;
                        debug!(module, "module loaded");
                    } else {
                        self.exec.bind(name, value);
                        debug!(%name, bytes = value.len(), "binding installed");
                    }
                }
                let result = match self.exec.eval(&directive.payload) {
                    Ok(bytes) => bytes,
                    Err(wrapped) => {
                        warn!("call evaluation failed");
                        wrapped.into_payload()
                    }
                };
                let profile = self.exec.snapshot();
                let report = Report {
                    status: Status::Active,
                    time: profile.time_frame(),
                    mem: profile.mem_frame(),
                    payload: Some(result),
                };
                self.sock.send(&report.to_frames())?;
                Ok(true)
            }
            other => Err(WorkerError::UnexpectedDirective(other)),
        }
    }

    /// Serves directives until a shutdown arrives, then closes.
    ///
    /// # Errors
    ///
    /// Whatever [`Self::process_one`] surfaces.
    pub fn run(mut self) -> Result<(), WorkerError> {
        loop {
            if !self.process_one()? {
                self.close();
                return Ok(());
            }
        }
    }

    /// Releases the connection after a short flush.
    pub fn close(self) {
        let Self {
            mut poller,
            sock,
            exec: _exec,
        } = self;
        sock.close(&mut poller, Duration::from_millis(100));
        info!("worker closed");
    }
}
