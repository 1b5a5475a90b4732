//! Relay tier between one master and its own population of workers.
//!
//! The proxy is invisible to both sides: workers connect to it exactly
//! as they would to a master, and the master addresses workers behind
//! it by their far-side routing ids. The one thing the proxy rewrites
//! is the env tail of a dispatch: values it has already seen travel the
//! upstream link once and are re-expanded from the local cache for
//! every later dependent.

use std::collections::HashMap;
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use crate::exec;
use crate::net::{
    DEFAULT_CONNECT_TIMEOUT, DealerEvent, DealerSocket, Endpoint, Multipart, NetError, Poller,
    RouterSocket, RoutingId, Timeout, remaining,
};
use crate::trace::{debug, info, trace, warn};
use crate::wire::{self, Directive, Report, Status, Upstream, WireError};

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Budget for the upstream connect.
    pub connect_timeout: Duration,
    /// How often to report in while idle.
    pub heartbeat_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("master connection lost")]
    MasterGone,
    /// The master listed a cache name this proxy never received.
    #[error("name {0} missing from the relay cache")]
    CacheMiss(String),
    #[error("unexpected directive status {0}")]
    UnexpectedDirective(Status),
    #[error("timed out waiting for traffic")]
    Timeout,
    /// A shutdown directive arrived while waiting for something else.
    #[error("shut down by the master")]
    Terminated,
}

/// What one relay step produced.
#[derive(Debug)]
pub enum ProxyEvent {
    /// Traffic moved in either direction (or was deliberately dropped
    /// because its target is gone).
    Relayed,
    /// A control command payload from the master.
    Command(Vec<u8>),
    /// The master told this proxy to terminate.
    Shutdown,
}

pub struct Proxy {
    poller: Poller,
    up: DealerSocket,
    down: RouterSocket,
    /// Env values seen on the upstream link, by name.
    cache: HashMap<String, Vec<u8>>,
    heartbeat_interval: Duration,
    last_heartbeat: Instant,
}

impl Proxy {
    /// Connects upstream, binds the downstream listener from
    /// `listen` candidates, and registers with the master by sending
    /// the first heartbeat.
    ///
    /// # Errors
    ///
    /// Upstream connect failures, downstream bind failures, and a
    /// failed registration send all surface here.
    pub fn new(
        master: Endpoint,
        listen: &[Endpoint],
        config: &ProxyConfig,
    ) -> Result<Self, ProxyError> {
        let mut poller = Poller::new()?;
        let up = DealerSocket::connect(
            &mut poller,
            master,
            Timeout::Duration(config.connect_timeout),
        )?;
        let down = RouterSocket::bind(&mut poller, listen)?;
        let mut proxy = Self {
            poller,
            up,
            down,
            cache: HashMap::new(),
            heartbeat_interval: config.heartbeat_interval,
            last_heartbeat: Instant::now(),
        };
        proxy.send_heartbeat()?;
        info!(master = %master, "proxy registered");
        Ok(proxy)
    }

    /// The downstream listen address, for handing to worker launchers.
    ///
    /// # Errors
    ///
    /// Fails when the OS cannot report the local address.
    pub fn address(&self) -> Result<Endpoint, ProxyError> {
        Ok(self.down.local_addr()?)
    }

    /// Flag that aborts a blocked relay step when raised from another
    /// thread.
    #[must_use]
    pub fn cancel_flag(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
        self.poller.cancel_flag()
    }

    /// Names currently held in the relay cache, sorted.
    #[must_use]
    pub fn cached_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cache.keys().cloned().collect();
        names.sort();
        names
    }

    /// Solicits a control command: the master consumes one heartbeat
    /// for every command it submits.
    ///
    /// # Errors
    ///
    /// Fails when the heartbeat cannot be sent.
    pub fn request_cmd(&mut self) -> Result<(), ProxyError> {
        self.send_heartbeat()
    }

    /// Waits for a control command from the master, relaying any other
    /// traffic that arrives in the meantime.
    ///
    /// # Errors
    ///
    /// [`ProxyError::Timeout`] when the budget elapses first and
    /// [`ProxyError::Terminated`] when a shutdown arrives instead.
    pub fn receive_cmd(&mut self, timeout: Timeout) -> Result<Vec<u8>, ProxyError> {
        let deadline = timeout.deadline();
        loop {
            let Some(left) = remaining(deadline) else {
                return Err(ProxyError::Timeout);
            };
            let budget = left.map_or(Timeout::Infinite, Timeout::Duration);
            match self.process_one(budget)? {
                ProxyEvent::Command(cmd) => return Ok(cmd),
                ProxyEvent::Relayed => {}
                ProxyEvent::Shutdown => return Err(ProxyError::Terminated),
            }
        }
    }

    /// Performs one relay step: moves one message in either direction,
    /// sending periodic heartbeats while waiting.
    ///
    /// # Errors
    ///
    /// [`ProxyError::MasterGone`] when the upstream link dies,
    /// [`ProxyError::Timeout`] when nothing happens within the budget,
    /// [`ProxyError::CacheMiss`] on an unsatisfiable cache reference.
    pub fn process_one(&mut self, timeout: Timeout) -> Result<ProxyEvent, ProxyError> {
        let deadline = timeout.deadline();
        loop {
            if self.last_heartbeat.elapsed() >= self.heartbeat_interval {
                self.send_heartbeat()?;
            }
            match self.up.recv() {
                Some(DealerEvent::Message(frames)) => return self.handle_upstream(&frames),
                Some(DealerEvent::Disconnected) => return Err(ProxyError::MasterGone),
                None => {}
            }
            if let Some((id, frames)) = self.down.recv() {
                self.relay_up(id, frames)?;
                return Ok(ProxyEvent::Relayed);
            }
            match remaining(deadline) {
                None => return Err(ProxyError::Timeout),
                Some(left) => {
                    // Wake at least often enough to keep heartbeats on
                    // schedule.
                    let until_beat = self
                        .heartbeat_interval
                        .saturating_sub(self.last_heartbeat.elapsed());
                    let budget = match left {
                        None => until_beat,
                        Some(d) => d.min(until_beat),
                    };
                    let ready = self.poller.wait(Timeout::Duration(budget))?;
                    self.down.pump(&mut self.poller, &ready)?;
                    self.up.pump(&ready)?;
                }
            }
        }
    }

    /// Relays until the master sends a shutdown.
    ///
    /// # Errors
    ///
    /// Whatever [`Self::process_one`] surfaces.
    pub fn run(mut self) -> Result<(), ProxyError> {
        loop {
            match self.process_one(Timeout::Infinite)? {
                ProxyEvent::Relayed => {}
                ProxyEvent::Command(_cmd) => {
                    debug!(bytes = _cmd.len(), "late control command ignored");
                }
                ProxyEvent::Shutdown => {
                    self.close();
                    return Ok(());
                }
            }
        }
    }

    /// Flushes both sockets briefly and drops them.
    pub fn close(self) {
        let Self {
            mut poller,
            up,
            down,
            ..
        } = self;
        down.close(&mut poller, Duration::from_millis(200));
        up.close(&mut poller, Duration::from_millis(200));
        info!("proxy closed");
    }

    fn handle_upstream(&mut self, frames: &Multipart) -> Result<ProxyEvent, ProxyError> {
        match wire::parse_upstream(frames)? {
            Upstream::Control(directive) => match directive.status {
                Status::ProxyCmd => Ok(ProxyEvent::Command(directive.payload)),
                Status::ProxyShutdown => {
                    info!("shutdown directive received");
                    Ok(ProxyEvent::Shutdown)
                }
                other => Err(ProxyError::UnexpectedDirective(other)),
            },
            Upstream::Relay {
                dep,
                directive,
                cached,
            } => {
                let mut env = directive.env;
                for (name, value) in &env {
                    self.cache.insert(name.clone(), value.clone());
                }
                for name in cached {
                    let Some(value) = self.cache.get(&name) else {
                        return Err(ProxyError::CacheMiss(name));
                    };
                    env.push((name, value.clone()));
                }
                let expanded = Directive {
                    status: directive.status,
                    payload: directive.payload,
                    env,
                };
                match self.down.send(dep, &expanded.to_frames()) {
                    Ok(()) => {
                        trace!(peer = %dep, "directive relayed downstream");
                        Ok(ProxyEvent::Relayed)
                    }
                    // The target died and its disconnect is already on
                    // its way upstream; the directive has nowhere to go.
                    Err(NetError::UnknownPeer(_id)) => {
                        warn!(peer = %_id, "relay target gone, directive dropped");
                        Ok(ProxyEvent::Relayed)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Forwards a downstream message (report or disconnect) upstream
    /// verbatim, prefixed with the sender's routing id.
    fn relay_up(&mut self, id: RoutingId, frames: Multipart) -> Result<(), ProxyError> {
        let mut out = Vec::with_capacity(frames.len() + 1);
        out.push(id.to_frame());
        out.extend(frames);
        self.up.send(&out)?;
        trace!(peer = %id, "message relayed upstream");
        Ok(())
    }

    fn send_heartbeat(&mut self) -> Result<(), ProxyError> {
        let profile = exec::system_snapshot();
        let report = Report {
            status: Status::ProxyCmd,
            time: profile.time_frame(),
            mem: profile.mem_frame(),
            payload: None,
        };
        self.up.send(&report.to_frames())?;
        self.last_heartbeat = Instant::now();
        trace!("heartbeat sent");
        Ok(())
    }
}
