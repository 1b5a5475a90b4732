//! The dispatch hub.
//!
//! A [`Master`] owns the listening socket, the peer table, and the
//! environment registry. Its caller drives a strict rhythm: `recv`
//! produces the next ready peer's payload (readiness marker or call
//! result) and marks that peer "current", then `send`/`send_shutdown`
//! dispatch to the current peer. All peer bookkeeping happens inside
//! `recv`'s consume loop, so the caller never sees registrations,
//! heartbeats, or expected disconnects.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use thiserror::Error;

use crate::env::EnvRegistry;
use crate::net::{
    Endpoint, Multipart, NetError, Poller, RouterSocket, RoutingId, Timeout, remaining,
};
use crate::trace::{debug, info, trace, warn};
use crate::wire::{self, Directive, Inbound, MODULE_PREFIX, Report, Status, WireError};

/// Flush budget for the socket teardown when the caller's drain budget
/// does not bound it more tightly.
const CLOSE_LINGER: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum MasterError {
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Wire(#[from] WireError),
    /// Nothing is connected or promised, so no reply can ever arrive.
    #[error("no active peers and no pending workers")]
    NoRemainingWorkers,
    #[error("timed out waiting for peer activity")]
    Timeout,
    /// A peer vanished with no shutdown in flight.
    #[error("peer {0} disconnected while {1}")]
    UnexpectedDisconnect(RoutingId, Status),
    /// A proxy vanished while workers behind it were still active.
    #[error("proxy {proxy} disconnected with {dependents} active dependents")]
    ProxyDependents { proxy: RoutingId, dependents: usize },
    /// A proxy reported a terminal failure.
    #[error("proxy {0} reported failure")]
    ProxyFailed(RoutingId),
    /// A directly connected peer registered without a promised slot.
    #[error("peer {0} registered with no pending worker slot")]
    PendingUnderflow(RoutingId),
    #[error("peer {peer} sent unexpected status {status}")]
    UnexpectedStatus { peer: RoutingId, status: Status },
    #[error("no current peer; call recv first")]
    NoCurrentPeer,
    #[error("peer {0} is gone")]
    PeerGone(RoutingId),
    #[error("peer {0} is {1}, not active")]
    PeerNotActive(RoutingId, Status),
    #[error("peer {0} already has a call outstanding")]
    PeerBusy(RoutingId),
}

/// Bookkeeping for one known peer (worker or proxy).
struct PeerRecord {
    status: Status,
    /// Env names this peer already holds. For a proxy this is its
    /// relay cache contents as the master knows them.
    env: HashSet<String>,
    /// Proxy this peer is reached through; set at creation, never
    /// changed.
    via: Option<RoutingId>,
    /// Outstanding call payload; `Some` marks the peer busy.
    call: Option<Vec<u8>>,
    call_ref: Option<u64>,
    n_calls: u64,
    time: Vec<u8>,
    mem: Vec<u8>,
}

/// Read-only snapshot of a peer record.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: RoutingId,
    pub status: Status,
    pub via: Option<RoutingId>,
    pub n_calls: u64,
    /// Latest profiling frames as reported, not interpreted here.
    pub time: Vec<u8>,
    pub mem: Vec<u8>,
}

/// Something the consume loop extracted from one inbound message.
enum PeerEvent {
    /// A payload for the caller: readiness marker or call result.
    Payload(RoutingId, Vec<u8>),
    /// A proxy announced itself or reported in.
    ProxyHeartbeat(RoutingId),
}

pub struct Master {
    poller: Poller,
    sock: RouterSocket,
    peers: HashMap<RoutingId, PeerRecord>,
    env: EnvRegistry,
    pending_workers: usize,
    /// Peer most recently produced by `recv`; target of `send`.
    current: Option<RoutingId>,
    next_call_ref: u64,
    /// Payloads that arrived while another operation was waiting for
    /// something else; drained first by `recv`.
    backlog: VecDeque<(RoutingId, Vec<u8>)>,
}

impl Master {
    /// Binds the first free address from `candidates` and starts
    /// listening.
    ///
    /// # Errors
    ///
    /// Fails when the poller cannot be created, on a hard bind error,
    /// or when every candidate address is taken.
    pub fn listen(candidates: &[Endpoint]) -> Result<Self, MasterError> {
        let mut poller = Poller::new()?;
        let sock = RouterSocket::bind(&mut poller, candidates)?;
        Ok(Self {
            poller,
            sock,
            peers: HashMap::new(),
            env: EnvRegistry::new(),
            pending_workers: 0,
            current: None,
            next_call_ref: 1,
            backlog: VecDeque::new(),
        })
    }

    /// The bound listen address, for handing to launchers.
    ///
    /// # Errors
    ///
    /// Fails when the OS cannot report the local address.
    pub fn address(&self) -> Result<Endpoint, MasterError> {
        Ok(self.sock.local_addr()?)
    }

    /// Flag that makes a blocked operation fail with an interrupt
    /// error when raised from another thread (e.g. a signal handler).
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.poller.cancel_flag()
    }

    /// Peer most recently produced by [`Self::recv`].
    #[must_use]
    pub fn current_peer(&self) -> Option<RoutingId> {
        self.current
    }

    /// Promises `n` more workers so `recv` keeps waiting for them.
    pub fn add_pending_workers(&mut self, n: usize) {
        self.pending_workers += n;
        info!(n, total = self.pending_workers, "expecting workers");
    }

    /// Promised-but-unregistered worker count.
    #[must_use]
    pub fn pending_workers(&self) -> usize {
        self.pending_workers
    }

    /// Registers or replaces an environment object. A replaced name is
    /// invalidated from every peer's known set so the new value is
    /// retransmitted on next dispatch.
    pub fn add_env(&mut self, name: impl Into<String>, value: Vec<u8>) {
        let name = name.into();
        if self.env.insert(name.clone(), value) {
            for record in self.peers.values_mut() {
                record.env.remove(&name);
            }
            debug!(%name, "env value replaced");
        } else {
            debug!(%name, "env value added");
        }
    }

    /// Registers a module for workers to load before evaluating calls.
    pub fn add_pkg(&mut self, module: &str) {
        self.add_env(format!("{MODULE_PREFIX}{module}"), Vec::new());
    }

    /// Snapshot of registered env names with their serialized sizes.
    #[must_use]
    pub fn list_env(&self) -> Vec<(String, usize)> {
        self.env.list()
    }

    /// Snapshot of all peer records, sorted by routing id. Terminal
    /// `error` records stay listed until the master is closed.
    #[must_use]
    pub fn list_workers(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self
            .peers
            .iter()
            .map(|(id, r)| WorkerInfo {
                id: *id,
                status: r.status,
                via: r.via,
                n_calls: r.n_calls,
                time: r.time.clone(),
                mem: r.mem.clone(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Waits for the next caller-visible payload: a fresh worker's
    /// readiness marker (empty bytes) or a call result. Registrations,
    /// heartbeats, and expected disconnects are consumed internally.
    /// The producing peer becomes the current peer.
    ///
    /// # Errors
    ///
    /// [`MasterError::NoRemainingWorkers`] when nothing is connected or
    /// promised, [`MasterError::Timeout`] when the budget elapses, plus
    /// the fatal protocol conditions from the consume loop (unexpected
    /// disconnects, pending underflow, proxy violations).
    pub fn recv(&mut self, timeout: Timeout) -> Result<Vec<u8>, MasterError> {
        let deadline = timeout.deadline();
        loop {
            if let Some((from, payload)) = self.backlog.pop_front() {
                self.current = Some(from);
                return Ok(payload);
            }
            // Drain whatever already arrived before judging admission,
            // so a queued unpromised registration surfaces as the
            // underflow defect it is instead of hiding behind the
            // admission error. The zero-budget poll never blocks.
            let ready = self.poller.wait(Timeout::Duration(Duration::ZERO))?;
            self.sock.pump(&mut self.poller, &ready)?;
            while let Some((sender, frames)) = self.sock.recv() {
                match self.register_peer(sender, &frames)? {
                    Some(PeerEvent::Payload(from, payload)) => {
                        self.current = Some(from);
                        return Ok(payload);
                    }
                    Some(PeerEvent::ProxyHeartbeat(_)) | None => {}
                }
            }
            if !self.can_make_progress() {
                return Err(MasterError::NoRemainingWorkers);
            }
            match remaining(deadline) {
                None => return Err(MasterError::Timeout),
                Some(left) => {
                    let budget = left.map_or(Timeout::Infinite, Timeout::Duration);
                    let ready = self.poller.wait(budget)?;
                    self.sock.pump(&mut self.poller, &ready)?;
                }
            }
        }
    }

    /// Dispatches `call` to the current peer together with every env
    /// object it is still missing. For a peer reached through a proxy,
    /// values the proxy already caches are named in the trailing
    /// cache frame instead of being re-sent.
    ///
    /// Marks the peer busy and returns a fresh call reference.
    ///
    /// # Errors
    ///
    /// Fails when there is no current peer, the peer is gone or not
    /// active, a call is already outstanding, or the send fails.
    pub fn send(&mut self, call: Vec<u8>) -> Result<u64, MasterError> {
        let id = self.current.ok_or(MasterError::NoCurrentPeer)?;
        let Some(record) = self.peers.get(&id) else {
            return Err(MasterError::PeerGone(id));
        };
        if record.status != Status::Active {
            return Err(MasterError::PeerNotActive(id, record.status));
        }
        if record.call.is_some() {
            return Err(MasterError::PeerBusy(id));
        }
        let via = record.via;
        let missing: Vec<String> = self
            .env
            .missing_from(&record.env)
            .into_iter()
            .map(str::to_string)
            .collect();

        // Partition missing names into fresh pairs and proxy-cached
        // names.
        let mut fresh: Vec<(String, Vec<u8>)> = Vec::new();
        let mut cached: Vec<String> = Vec::new();
        match via {
            None => {
                for name in &missing {
                    if let Some(value) = self.env.get(name) {
                        fresh.push((name.clone(), value.to_vec()));
                    }
                }
            }
            Some(proxy) => {
                let Some(proxy_record) = self.peers.get(&proxy) else {
                    return Err(MasterError::PeerGone(proxy));
                };
                for name in &missing {
                    if proxy_record.env.contains(name) {
                        cached.push(name.clone());
                    } else if let Some(value) = self.env.get(name) {
                        fresh.push((name.clone(), value.to_vec()));
                    }
                }
            }
        }
        let fresh_names: Vec<String> = fresh.iter().map(|(name, _)| name.clone()).collect();

        let call_ref = self.next_call_ref;
        self.next_call_ref += 1;
        let directive = Directive {
            status: Status::Active,
            payload: call.clone(),
            env: fresh,
        };
        match via {
            None => self.sock.send(id, &directive.to_frames())?,
            Some(proxy) => self.sock.send(proxy, &directive.to_relay_frames(id, &cached))?,
        }

        let Some(record) = self.peers.get_mut(&id) else {
            return Err(MasterError::PeerGone(id));
        };
        record.call = Some(call);
        record.call_ref = Some(call_ref);
        for name in &missing {
            record.env.insert(name.clone());
        }
        if let Some(proxy) = via
            && let Some(proxy_record) = self.peers.get_mut(&proxy)
        {
            proxy_record.env.extend(fresh_names.iter().cloned());
        }
        debug!(
            peer = %id,
            call_ref,
            env_new = fresh_names.len(),
            env_cached = cached.len(),
            "call dispatched"
        );
        Ok(call_ref)
    }

    /// Tells the current peer to terminate. The peer enters `shutdown`
    /// and is erased once its disconnect notification arrives; the
    /// current peer is cleared.
    ///
    /// # Errors
    ///
    /// Same preconditions as [`Self::send`].
    pub fn send_shutdown(&mut self) -> Result<(), MasterError> {
        let id = self.current.ok_or(MasterError::NoCurrentPeer)?;
        let Some(record) = self.peers.get(&id) else {
            return Err(MasterError::PeerGone(id));
        };
        if record.status != Status::Active {
            return Err(MasterError::PeerNotActive(id, record.status));
        }
        if record.call.is_some() {
            return Err(MasterError::PeerBusy(id));
        }
        let via = record.via;
        let directive = Directive {
            status: Status::Shutdown,
            payload: Vec::new(),
            env: Vec::new(),
        };
        match via {
            None => self.sock.send(id, &directive.to_frames())?,
            Some(proxy) => self.sock.send(proxy, &directive.to_relay_frames(id, &[]))?,
        }
        if let Some(record) = self.peers.get_mut(&id) {
            record.status = Status::Shutdown;
        }
        self.current = None;
        info!(peer = %id, "shutdown dispatched");
        Ok(())
    }

    /// Waits for a proxy heartbeat, consumes it, and pushes a control
    /// command to that proxy. Worker payloads observed while waiting
    /// are backlogged for the next `recv`.
    ///
    /// # Errors
    ///
    /// [`MasterError::Timeout`] when no heartbeat arrives in time, plus
    /// the consume loop's fatal conditions.
    pub fn proxy_submit_cmd(
        &mut self,
        args: Vec<u8>,
        timeout: Timeout,
    ) -> Result<RoutingId, MasterError> {
        let deadline = timeout.deadline();
        loop {
            while let Some((sender, frames)) = self.sock.recv() {
                match self.register_peer(sender, &frames)? {
                    Some(PeerEvent::ProxyHeartbeat(proxy)) => {
                        let directive = Directive {
                            status: Status::ProxyCmd,
                            payload: args,
                            env: Vec::new(),
                        };
                        self.sock.send(proxy, &directive.to_frames())?;
                        info!(%proxy, "control command submitted");
                        return Ok(proxy);
                    }
                    Some(PeerEvent::Payload(from, payload)) => {
                        self.backlog.push_back((from, payload));
                    }
                    None => {}
                }
            }
            match remaining(deadline) {
                None => return Err(MasterError::Timeout),
                Some(left) => {
                    let budget = left.map_or(Timeout::Infinite, Timeout::Duration);
                    let ready = self.poller.wait(budget)?;
                    self.sock.pump(&mut self.poller, &ready)?;
                }
            }
        }
    }

    /// Drains and tears down: shuts down idle workers as they become
    /// idle, shuts down proxies once their dependents are gone, and
    /// collects confirmations until the table is empty or the budget
    /// elapses. Late call results observed while draining are returned.
    ///
    /// A peer vanishing without a shutdown in flight is as fatal here as
    /// it is in [`Self::recv`]: the drain fails with the same
    /// unexpected-disconnect (or proxy-dependents) error so a crash is
    /// never mistaken for a graceful exit. The table may retain terminal
    /// records when the budget runs out.
    ///
    /// # Errors
    ///
    /// Transport failures and the consume loop's fatal protocol
    /// conditions abort the drain.
    pub fn cleanup(mut self, timeout: Timeout) -> Result<Vec<Vec<u8>>, MasterError> {
        let deadline = timeout.deadline();
        let mut late: Vec<Vec<u8>> = self.backlog.drain(..).map(|(_, payload)| payload).collect();
        loop {
            self.dispatch_drain_shutdowns()?;
            if !self.has_live_peers() {
                break;
            }
            match remaining(deadline) {
                None => {
                    warn!(
                        peers = self.live_peer_count(),
                        "drain budget elapsed with peers remaining"
                    );
                    break;
                }
                Some(left) => {
                    let budget = left.map_or(Timeout::Infinite, Timeout::Duration);
                    let ready = self.poller.wait(budget)?;
                    self.sock.pump(&mut self.poller, &ready)?;
                    while let Some((sender, frames)) = self.sock.recv() {
                        if let Some(PeerEvent::Payload(_from, payload)) =
                            self.register_peer(sender, &frames)?
                        {
                            debug!(peer = %_from, "late result buffered");
                            late.push(payload);
                        }
                    }
                }
            }
        }
        self.env.clear();
        let linger = match remaining(deadline) {
            None => Duration::ZERO,
            Some(None) => CLOSE_LINGER,
            Some(Some(left)) => left.min(CLOSE_LINGER),
        };
        self.sock.close(&mut self.poller, linger);
        info!("master closed");
        Ok(late)
    }

    /// [`Self::cleanup`] for callers that do not want late results.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Self::cleanup`].
    pub fn close(self, timeout: Timeout) -> Result<(), MasterError> {
        let dropped = self.cleanup(timeout)?;
        if !dropped.is_empty() {
            warn!(count = dropped.len(), "late results discarded at close");
        }
        Ok(())
    }

    /// True while a reply could still arrive.
    fn can_make_progress(&self) -> bool {
        self.pending_workers > 0
            || self
                .peers
                .values()
                .any(|r| matches!(r.status, Status::Active | Status::ProxyCmd))
    }

    fn has_live_peers(&self) -> bool {
        self.live_peer_count() > 0
    }

    fn live_peer_count(&self) -> usize {
        self.peers
            .values()
            .filter(|r| {
                matches!(
                    r.status,
                    Status::Active | Status::Shutdown | Status::ProxyCmd | Status::ProxyShutdown
                )
            })
            .count()
    }

    /// Sends shutdown directives to every idle active worker and to
    /// every proxy whose dependents are all gone. Peers whose
    /// connection already died are left for their queued disconnect
    /// notification to settle.
    fn dispatch_drain_shutdowns(&mut self) -> Result<(), MasterError> {
        let idle: Vec<(RoutingId, Option<RoutingId>)> = self
            .peers
            .iter()
            .filter(|(_, r)| r.status == Status::Active && r.call.is_none())
            .map(|(id, r)| (*id, r.via))
            .collect();
        for (id, via) in idle {
            let directive = Directive {
                status: Status::Shutdown,
                payload: Vec::new(),
                env: Vec::new(),
            };
            let sent = match via {
                None => self.sock.send(id, &directive.to_frames()),
                Some(proxy) => self.sock.send(proxy, &directive.to_relay_frames(id, &[])),
            };
            match sent {
                Ok(()) => {
                    if let Some(record) = self.peers.get_mut(&id) {
                        record.status = Status::Shutdown;
                    }
                    debug!(peer = %id, "drain shutdown sent");
                }
                Err(NetError::UnknownPeer(_)) => {
                    debug!(peer = %id, "connection already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let proxies: Vec<RoutingId> = self
            .peers
            .iter()
            .filter(|(_, r)| r.status == Status::ProxyCmd)
            .map(|(id, _)| *id)
            .collect();
        for proxy in proxies {
            let dependents = self
                .peers
                .values()
                .filter(|r| {
                    r.via == Some(proxy) && matches!(r.status, Status::Active | Status::Shutdown)
                })
                .count();
            if dependents > 0 {
                continue;
            }
            let directive = Directive {
                status: Status::ProxyShutdown,
                payload: Vec::new(),
                env: Vec::new(),
            };
            match self.sock.send(proxy, &directive.to_frames()) {
                Ok(()) => {
                    if let Some(record) = self.peers.get_mut(&proxy) {
                        record.status = Status::ProxyShutdown;
                    }
                    debug!(%proxy, "proxy shutdown sent");
                }
                Err(NetError::UnknownPeer(_)) => {
                    debug!(%proxy, "proxy connection already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Applies one inbound message to the peer table: classifies it,
    /// updates or creates the record, and reports anything the caller
    /// of `recv` should see.
    fn register_peer(
        &mut self,
        sender: RoutingId,
        frames: &Multipart,
    ) -> Result<Option<PeerEvent>, MasterError> {
        match wire::classify(frames)? {
            Inbound::Direct(report) => self.apply_report(sender, None, report),
            Inbound::Relayed { origin, report } => self.apply_report(origin, Some(sender), report),
            Inbound::Disconnect => self.apply_disconnect(sender).map(|()| None),
            Inbound::RelayedDisconnect { origin } => self.apply_disconnect(origin).map(|()| None),
        }
    }

    fn apply_report(
        &mut self,
        id: RoutingId,
        via: Option<RoutingId>,
        report: Report,
    ) -> Result<Option<PeerEvent>, MasterError> {
        if let Some(record) = self.peers.get_mut(&id) {
            record.time = report.time;
            record.mem = report.mem;
            return match report.status {
                Status::Active => {
                    if record.call.take().is_some() {
                        record.call_ref = None;
                        record.n_calls += 1;
                    }
                    Ok(report.payload.map(|p| PeerEvent::Payload(id, p)))
                }
                Status::ProxyCmd => {
                    trace!(proxy = %id, "heartbeat");
                    Ok(Some(PeerEvent::ProxyHeartbeat(id)))
                }
                Status::ProxyError => {
                    record.status = Status::ProxyError;
                    Err(MasterError::ProxyFailed(id))
                }
                other => Err(MasterError::UnexpectedStatus {
                    peer: id,
                    status: other,
                }),
            };
        }

        // First contact creates the record.
        match report.status {
            Status::Active => {
                if self.pending_workers == 0 {
                    // A launcher behind a proxy may start workers the
                    // master was never told about; only a directly
                    // promised slot makes underflow a hard defect.
                    if via.is_none() {
                        return Err(MasterError::PendingUnderflow(id));
                    }
                    warn!(peer = %id, "relayed registration without a pending slot");
                } else {
                    self.pending_workers -= 1;
                }
                self.peers.insert(
                    id,
                    PeerRecord {
                        status: Status::Active,
                        env: HashSet::new(),
                        via,
                        call: None,
                        call_ref: None,
                        n_calls: 0,
                        time: report.time,
                        mem: report.mem,
                    },
                );
                match via {
                    Some(proxy) => {
                        info!(peer = %id, via = %proxy, "worker registered");
                    }
                    None => {
                        info!(peer = %id, "worker registered");
                    }
                }
                Ok(report.payload.map(|p| PeerEvent::Payload(id, p)))
            }
            Status::ProxyCmd => {
                self.peers.insert(
                    id,
                    PeerRecord {
                        status: Status::ProxyCmd,
                        env: HashSet::new(),
                        via,
                        call: None,
                        call_ref: None,
                        n_calls: 0,
                        time: report.time,
                        mem: report.mem,
                    },
                );
                info!(proxy = %id, "proxy registered");
                Ok(Some(PeerEvent::ProxyHeartbeat(id)))
            }
            other => Err(MasterError::UnexpectedStatus {
                peer: id,
                status: other,
            }),
        }
    }

    fn apply_disconnect(&mut self, id: RoutingId) -> Result<(), MasterError> {
        let Some(status) = self.peers.get(&id).map(|r| r.status) else {
            debug!(peer = %id, "disconnect from unregistered connection");
            return Ok(());
        };
        match status {
            Status::Shutdown => {
                self.peers.remove(&id);
                info!(peer = %id, "worker finished");
                Ok(())
            }
            Status::ProxyShutdown => {
                self.erase_finished_dependents(id);
                let dependents = self.mark_dependents_lost(id);
                if dependents > 0 {
                    if let Some(record) = self.peers.get_mut(&id) {
                        record.status = Status::ProxyError;
                    }
                    return Err(MasterError::ProxyDependents {
                        proxy: id,
                        dependents,
                    });
                }
                self.peers.remove(&id);
                info!(proxy = %id, "proxy finished");
                Ok(())
            }
            Status::ProxyCmd => {
                self.erase_finished_dependents(id);
                let dependents = self.mark_dependents_lost(id);
                if let Some(record) = self.peers.get_mut(&id) {
                    record.status = Status::ProxyError;
                }
                if dependents > 0 {
                    Err(MasterError::ProxyDependents {
                        proxy: id,
                        dependents,
                    })
                } else {
                    Err(MasterError::UnexpectedDisconnect(id, Status::ProxyCmd))
                }
            }
            Status::Active => {
                if let Some(record) = self.peers.get_mut(&id) {
                    record.status = Status::Error;
                }
                Err(MasterError::UnexpectedDisconnect(id, Status::Active))
            }
            Status::Finished | Status::Error | Status::ProxyError => {
                debug!(peer = %id, %status, "disconnect for terminal peer");
                Ok(())
            }
        }
    }

    /// Active workers behind a dead proxy are unreachable; their
    /// records go terminal so nothing keeps waiting on them.
    fn mark_dependents_lost(&mut self, proxy: RoutingId) -> usize {
        let mut lost = 0;
        for (_dep, record) in &mut self.peers {
            if record.via == Some(proxy) && record.status == Status::Active {
                record.status = Status::Error;
                warn!(peer = %_dep, %proxy, "worker lost with its proxy");
                lost += 1;
            }
        }
        lost
    }

    /// A dead proxy can never relay its dependents' disconnect
    /// confirmations, so dependents already told to shut down count as
    /// finished and are erased before the remainder is judged.
    fn erase_finished_dependents(&mut self, proxy: RoutingId) {
        self.peers.retain(|_id, r| {
            if r.via == Some(proxy) && r.status == Status::Shutdown {
                info!(peer = %_id, "worker finished");
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Profile;
    use crate::net::{DealerEvent, DealerSocket};

    const SHORT: Timeout = Timeout::Duration(Duration::from_millis(50));
    const LONG: Timeout = Timeout::Duration(Duration::from_secs(2));

    fn master_on_localhost() -> Master {
        Master::listen(&[Endpoint::localhost(0)]).unwrap()
    }

    fn raw_peer(addr: Endpoint) -> (Poller, DealerSocket) {
        let mut poller = Poller::new().unwrap();
        let dealer = DealerSocket::connect(&mut poller, addr, LONG).unwrap();
        (poller, dealer)
    }

    fn profile_frames() -> (Vec<u8>, Vec<u8>) {
        let p = Profile {
            time_us: 5,
            mem_bytes: 6,
        };
        (p.time_frame(), p.mem_frame())
    }

    fn registration() -> Multipart {
        let (time, mem) = profile_frames();
        Report {
            status: Status::Active,
            time,
            mem,
            payload: Some(Vec::new()),
        }
        .to_frames()
    }

    fn reply(result: &[u8]) -> Multipart {
        let (time, mem) = profile_frames();
        Report {
            status: Status::Active,
            time,
            mem,
            payload: Some(result.to_vec()),
        }
        .to_frames()
    }

    fn proxy_heartbeat() -> Multipart {
        let (time, mem) = profile_frames();
        Report {
            status: Status::ProxyCmd,
            time,
            mem,
            payload: None,
        }
        .to_frames()
    }

    /// Pumps the dealer until one message arrives.
    fn dealer_message(poller: &mut Poller, dealer: &mut DealerSocket) -> Multipart {
        let deadline = minstant::Instant::now() + Duration::from_secs(2);
        while minstant::Instant::now() < deadline {
            match dealer.recv() {
                Some(DealerEvent::Message(frames)) => return frames,
                Some(DealerEvent::Disconnected) => panic!("dealer lost its connection"),
                None => {}
            }
            let ready = poller.wait(SHORT).unwrap();
            dealer.pump(&ready).unwrap();
        }
        panic!("no message within the deadline");
    }

    #[test]
    fn recv_without_peers_or_pending_fails() {
        let mut master = master_on_localhost();
        assert!(matches!(
            master.recv(SHORT),
            Err(MasterError::NoRemainingWorkers)
        ));
    }

    #[test]
    fn recv_times_out_while_workers_are_pending() {
        let mut master = master_on_localhost();
        master.add_pending_workers(1);
        assert!(matches!(master.recv(SHORT), Err(MasterError::Timeout)));
        assert_eq!(master.pending_workers(), 1);
    }

    #[test]
    fn registration_returns_marker_and_consumes_slot() {
        let mut master = master_on_localhost();
        master.add_pending_workers(2);
        let (_wp, mut worker) = raw_peer(master.address().unwrap());
        worker.send(&registration()).unwrap();

        let marker = master.recv(LONG).unwrap();
        assert!(marker.is_empty());
        assert_eq!(master.pending_workers(), 1);
        let listed = master.list_workers();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, Status::Active);
        assert_eq!(master.current_peer(), Some(listed[0].id));
    }

    #[test]
    fn unpromised_direct_registration_is_fatal() {
        let mut master = master_on_localhost();
        let (_wp, mut worker) = raw_peer(master.address().unwrap());
        worker.send(&registration()).unwrap();

        // Until the registration lands, recv sees an empty table and the
        // admission check fires; once it lands, the underflow does.
        let deadline = minstant::Instant::now() + Duration::from_secs(2);
        loop {
            match master.recv(SHORT) {
                Err(MasterError::PendingUnderflow(_)) => break,
                Err(MasterError::NoRemainingWorkers)
                    if minstant::Instant::now() < deadline => {}
                other => panic!("expected pending underflow, got {other:?}"),
            }
        }
        assert!(master.list_workers().is_empty());
    }

    #[test]
    fn send_requires_a_current_peer() {
        let mut master = master_on_localhost();
        assert!(matches!(
            master.send(b"call".to_vec()),
            Err(MasterError::NoCurrentPeer)
        ));
        assert!(matches!(
            master.send_shutdown(),
            Err(MasterError::NoCurrentPeer)
        ));
    }

    #[test]
    fn dispatch_cycle_sends_env_once_and_guards_busy() {
        let mut master = master_on_localhost();
        master.add_pending_workers(1);
        let (mut wp, mut worker) = raw_peer(master.address().unwrap());
        worker.send(&registration()).unwrap();
        assert!(master.recv(LONG).unwrap().is_empty());

        master.add_env("x", b"value".to_vec());
        let first_ref = master.send(b"call-1".to_vec()).unwrap();

        let frames = dealer_message(&mut wp, &mut worker);
        let directive = Directive::parse(&frames).unwrap();
        assert_eq!(directive.status, Status::Active);
        assert_eq!(directive.payload, b"call-1");
        assert_eq!(
            directive.env,
            vec![("x".to_string(), b"value".to_vec())]
        );

        // Same peer, call outstanding.
        assert!(matches!(
            master.send(b"again".to_vec()),
            Err(MasterError::PeerBusy(_))
        ));

        worker.send(&reply(b"result-1")).unwrap();
        assert_eq!(master.recv(LONG).unwrap(), b"result-1");
        assert_eq!(master.list_workers()[0].n_calls, 1);

        // Nothing new registered, so no env pairs this time.
        let second_ref = master.send(b"call-2".to_vec()).unwrap();
        assert!(second_ref > first_ref);
        let frames = dealer_message(&mut wp, &mut worker);
        let directive = Directive::parse(&frames).unwrap();
        assert_eq!(directive.payload, b"call-2");
        assert!(directive.env.is_empty());
    }

    #[test]
    fn unexpected_disconnect_marks_error_and_surfaces() {
        let mut master = master_on_localhost();
        master.add_pending_workers(1);
        let (_wp, mut worker) = raw_peer(master.address().unwrap());
        worker.send(&registration()).unwrap();
        assert!(master.recv(LONG).unwrap().is_empty());
        drop(worker);

        assert!(matches!(
            master.recv(LONG),
            Err(MasterError::UnexpectedDisconnect(_, Status::Active))
        ));
        let listed = master.list_workers();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, Status::Error);
    }

    #[test]
    fn shutdown_then_disconnect_finishes_cleanly() {
        let mut master = master_on_localhost();
        master.add_pending_workers(1);
        let addr = master.address().unwrap();

        let peer = std::thread::spawn(move || {
            let (mut wp, mut worker) = raw_peer(addr);
            worker.send(&registration()).unwrap();
            let frames = dealer_message(&mut wp, &mut worker);
            let directive = Directive::parse(&frames).unwrap();
            assert_eq!(directive.status, Status::Shutdown);
        });

        assert!(master.recv(LONG).unwrap().is_empty());
        master.send_shutdown().unwrap();
        assert_eq!(master.current_peer(), None);
        let late = master.cleanup(LONG).unwrap();
        assert!(late.is_empty());
        peer.join().unwrap();
    }

    #[test]
    fn cleanup_shuts_down_idle_workers() {
        let mut master = master_on_localhost();
        master.add_pending_workers(1);
        let addr = master.address().unwrap();

        let peer = std::thread::spawn(move || {
            let (mut wp, mut worker) = raw_peer(addr);
            worker.send(&registration()).unwrap();
            let frames = dealer_message(&mut wp, &mut worker);
            assert_eq!(
                Directive::parse(&frames).unwrap().status,
                Status::Shutdown
            );
        });

        assert!(master.recv(LONG).unwrap().is_empty());
        let late = master.cleanup(LONG).unwrap();
        assert!(late.is_empty());
        peer.join().unwrap();
    }

    #[test]
    fn proxy_submit_cmd_consumes_heartbeat() {
        let mut master = master_on_localhost();
        let (mut pp, mut proxy) = raw_peer(master.address().unwrap());
        proxy.send(&proxy_heartbeat()).unwrap();

        let proxy_id = master.proxy_submit_cmd(b"cmd-args".to_vec(), LONG).unwrap();
        let frames = dealer_message(&mut pp, &mut proxy);
        let directive = Directive::parse(&frames).unwrap();
        assert_eq!(directive.status, Status::ProxyCmd);
        assert_eq!(directive.payload, b"cmd-args");

        let listed = master.list_workers();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, proxy_id);
        assert_eq!(listed[0].status, Status::ProxyCmd);
    }

    #[test]
    fn add_pkg_registers_module_entry() {
        let mut master = master_on_localhost();
        master.add_pkg("tools");
        let env = master.list_env();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].0, "module:tools");
    }
}
