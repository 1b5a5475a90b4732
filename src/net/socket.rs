//! TCP socket roles for identity-addressed messaging.
//!
//! [`RouterSocket`] is the hub side: it accepts any number of peers,
//! assigns each connection an opaque [`RoutingId`], and can address any
//! live peer by id. [`DealerSocket`] is the peer side: one upstream
//! connection whose loss is reported as an explicit event, standing in
//! for a separate monitor channel.
//!
//! A peer's EOF (or reset) is surfaced to the hub as a synthesized
//! message containing only the empty delimiter frame, so the protocol
//! layer sees disconnects in-band and in order with the peer's final
//! replies.

use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;

use minstant::Instant;
use mio::Token;
use mio::net::{TcpListener, TcpStream};

use super::frames::{self, Multipart};
use super::{Endpoint, NetError, Poller, Timeout, remaining};
use crate::trace::{debug, info, trace, warn};

/// Opaque peer identity assigned by a hub socket on first contact.
///
/// Stable for the connection's lifetime and never reused: `origin` is a
/// per-socket random nonce, `seq` a per-connection counter, so ids
/// assigned by independent hubs (a Master's and a Proxy's) stay
/// distinct when they meet in one peer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingId {
    origin: u32,
    seq: u32,
}

impl RoutingId {
    /// Encoded length of a routing-id frame.
    pub const WIRE_LEN: usize = 8;

    pub(crate) const fn new(origin: u32, seq: u32) -> Self {
        Self { origin, seq }
    }

    /// Encodes the id as a wire frame.
    #[must_use]
    pub fn to_frame(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_LEN);
        out.extend_from_slice(&self.origin.to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
        out
    }

    /// Decodes an id from a wire frame; `None` if the length is wrong.
    #[must_use]
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        if frame.len() != Self::WIRE_LEN {
            return None;
        }
        let mut origin = [0u8; 4];
        let mut seq = [0u8; 4];
        origin.copy_from_slice(&frame[..4]);
        seq.copy_from_slice(&frame[4..]);
        Some(Self {
            origin: u32::from_le_bytes(origin),
            seq: u32::from_le_bytes(seq),
        })
    }
}

impl std::fmt::Display for RoutingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}.{}", self.origin, self.seq)
    }
}

/// Whether a link survived its latest pump.
enum LinkState {
    Open,
    Eof,
}

/// One nonblocking stream with its framing buffers.
struct Link {
    stream: TcpStream,
    rbuf: Vec<u8>,
    wbuf: Vec<u8>,
    wpos: usize,
}

impl Link {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            rbuf: Vec::new(),
            wbuf: Vec::new(),
            wpos: 0,
        }
    }

    /// Reads everything available, peeling complete messages off the
    /// front of the buffer. I/O failure is reported as EOF: a reset peer
    /// and a departed peer look the same to the protocol.
    fn read_pump(&mut self) -> Result<(Vec<Multipart>, LinkState), NetError> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 64 * 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok((out, LinkState::Eof)),
                Ok(n) => {
                    self.rbuf.extend_from_slice(&chunk[..n]);
                    loop {
                        match frames::try_decode(&self.rbuf)? {
                            Some((msg, used)) => {
                                self.rbuf.drain(..used);
                                out.push(msg);
                            }
                            None => break,
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok((out, LinkState::Open)),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_e) => {
                    debug!(error = %_e, "link read failed, treating as eof");
                    return Ok((out, LinkState::Eof));
                }
            }
        }
    }

    fn queue(&mut self, frames_to_send: &[Vec<u8>]) -> Result<(), NetError> {
        frames::encode_into(frames_to_send, &mut self.wbuf)?;
        Ok(())
    }

    /// Writes as much of the backlog as the socket accepts.
    fn flush(&mut self) -> io::Result<()> {
        while self.wpos < self.wbuf.len() {
            match self.stream.write(&self.wbuf[self.wpos..]) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => self.wpos += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.wbuf.drain(..self.wpos);
        self.wpos = 0;
        Ok(())
    }

    fn has_backlog(&self) -> bool {
        !self.wbuf.is_empty()
    }
}

struct Conn {
    id: RoutingId,
    link: Link,
}

/// Hub-side socket: accepts peers and addresses them by routing id.
pub struct RouterSocket {
    listener: TcpListener,
    listener_token: Token,
    origin: u32,
    next_seq: u32,
    conns: HashMap<Token, Conn>,
    ids: HashMap<RoutingId, Token>,
    inbox: VecDeque<(RoutingId, Multipart)>,
}

impl RouterSocket {
    /// Binds the first free address from `candidates`.
    ///
    /// Only "address in use" moves on to the next candidate; any other
    /// bind failure aborts immediately.
    ///
    /// # Errors
    ///
    /// [`NetError::Bind`] on a hard bind failure,
    /// [`NetError::AddrPoolExhausted`] when every candidate was taken.
    pub fn bind(poller: &mut Poller, candidates: &[Endpoint]) -> Result<Self, NetError> {
        let mut bound = None;
        for &addr in candidates {
            match TcpListener::bind(addr.into()) {
                Ok(l) => {
                    bound = Some(l);
                    break;
                }
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    debug!(%addr, "address in use, trying next candidate");
                }
                Err(source) => return Err(NetError::Bind { addr, source }),
            }
        }
        let Some(mut listener) = bound else {
            return Err(NetError::AddrPoolExhausted);
        };
        let listener_token = poller.register(&mut listener)?;
        let _local = listener.local_addr()?;
        info!(addr = %_local, "listening");
        Ok(Self {
            listener,
            listener_token,
            origin: rand::random(),
            next_seq: 0,
            conns: HashMap::new(),
            ids: HashMap::new(),
            inbox: VecDeque::new(),
        })
    }

    /// Returns the bound listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS cannot report the local address.
    pub fn local_addr(&self) -> Result<Endpoint, NetError> {
        Ok(self.listener.local_addr().map(Endpoint::from)?)
    }

    /// Number of live peer connections.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.conns.len()
    }

    /// Services readiness events: accepts new peers, reads inbound
    /// messages into the inbox, and flushes write backlogs. Peers that
    /// reached EOF are retired and leave a disconnect notification in
    /// the inbox.
    ///
    /// # Errors
    ///
    /// Accept failures and malformed framing are fatal; per-connection
    /// I/O errors only retire that connection.
    pub fn pump(&mut self, poller: &mut Poller, ready: &[Token]) -> Result<(), NetError> {
        for &token in ready {
            if token == self.listener_token {
                self.accept_pending(poller)?;
            } else {
                self.pump_conn(token)?;
            }
        }
        Ok(())
    }

    /// Pops the next inbound message, if any.
    pub fn recv(&mut self) -> Option<(RoutingId, Multipart)> {
        self.inbox.pop_front()
    }

    /// Queues a message to the peer with routing id `id` and flushes
    /// what the socket will take.
    ///
    /// A peer that dies mid-send is retired (its disconnect notification
    /// surfaces through [`Self::recv`]); the loss is not an error here.
    ///
    /// # Errors
    ///
    /// [`NetError::UnknownPeer`] if the id is not (or no longer) known;
    /// [`NetError::Framing`] if the message violates frame bounds.
    pub fn send(&mut self, id: RoutingId, frames_to_send: &[Vec<u8>]) -> Result<(), NetError> {
        let Some(&token) = self.ids.get(&id) else {
            return Err(NetError::UnknownPeer(id));
        };
        let Some(conn) = self.conns.get_mut(&token) else {
            return Err(NetError::UnknownPeer(id));
        };
        conn.link.queue(frames_to_send)?;
        if conn.link.flush().is_err() {
            self.retire(token);
        }
        Ok(())
    }

    /// Flushes outstanding writes for up to `linger`, then drops all
    /// connections and the listener.
    pub fn close(mut self, poller: &mut Poller, linger: Duration) {
        let deadline = Instant::now() + linger;
        loop {
            self.conns.retain(|_, conn| conn.link.flush().is_ok());
            if self.conns.values().all(|c| !c.link.has_backlog()) {
                break;
            }
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                warn!("close linger elapsed with unsent data");
                break;
            };
            if poller.wait(Timeout::Duration(left)).is_err() {
                break;
            }
        }
    }

    fn accept_pending(&mut self, poller: &mut Poller) -> Result<(), NetError> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _addr)) => {
                    let _ = stream.set_nodelay(true);
                    let token = poller.register(&mut stream)?;
                    let id = RoutingId::new(self.origin, self.next_seq);
                    self.next_seq = self.next_seq.wrapping_add(1);
                    self.conns.insert(
                        token,
                        Conn {
                            id,
                            link: Link::new(stream),
                        },
                    );
                    self.ids.insert(id, token);
                    info!(peer = %id, addr = %_addr, "peer connected");
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(NetError::Io(e)),
            }
        }
    }

    fn pump_conn(&mut self, token: Token) -> Result<(), NetError> {
        let (id, msgs, dead) = {
            // Tokens can outlive their connection within one wait batch.
            let Some(conn) = self.conns.get_mut(&token) else {
                return Ok(());
            };
            let (msgs, state) = conn.link.read_pump()?;
            let mut dead = matches!(state, LinkState::Eof);
            if !dead && conn.link.flush().is_err() {
                dead = true;
            }
            (conn.id, msgs, dead)
        };
        for msg in msgs {
            trace!(peer = %id, "message received");
            self.inbox.push_back((id, msg));
        }
        if dead {
            self.retire(token);
        }
        Ok(())
    }

    /// Removes a dead connection and queues its disconnect notification
    /// (a message of just the empty delimiter frame).
    fn retire(&mut self, token: Token) {
        if let Some(conn) = self.conns.remove(&token) {
            self.ids.remove(&conn.id);
            self.inbox.push_back((conn.id, vec![Vec::new()]));
            debug!(peer = %conn.id, "peer disconnected");
        }
    }
}

/// Events observed on a peer-side socket.
#[derive(Debug)]
pub enum DealerEvent {
    /// A complete inbound message.
    Message(Multipart),
    /// The upstream connection is gone; reported once, after any
    /// messages that arrived before the loss.
    Disconnected,
}

/// Peer-side socket: one upstream connection to a hub.
pub struct DealerSocket {
    link: Link,
    token: Token,
    peer: Endpoint,
    inbox: VecDeque<Multipart>,
    eof: bool,
    eof_reported: bool,
}

impl DealerSocket {
    /// Connects to `addr` within `timeout`.
    ///
    /// The connect is observable ("immediate" semantics): refusal and
    /// unreachability surface here instead of queueing sends into the
    /// void.
    ///
    /// # Errors
    ///
    /// [`NetError::Connect`] on refusal, [`NetError::ConnectTimeout`] if
    /// the deadline passes first.
    pub fn connect(poller: &mut Poller, addr: Endpoint, timeout: Timeout) -> Result<Self, NetError> {
        let mut stream = TcpStream::connect(addr.into()).map_err(|source| NetError::Connect {
            addr,
            source,
        })?;
        let token = poller.register(&mut stream)?;
        let deadline = timeout.deadline();
        loop {
            if let Some(source) = stream.take_error()? {
                return Err(NetError::Connect { addr, source });
            }
            match stream.peer_addr() {
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::NotConnected => {}
                Err(source) => return Err(NetError::Connect { addr, source }),
            }
            match remaining(deadline) {
                Some(left) => {
                    let budget = left.map_or(Timeout::Infinite, Timeout::Duration);
                    poller.wait(budget)?;
                }
                None => return Err(NetError::ConnectTimeout(addr)),
            }
        }
        let _ = stream.set_nodelay(true);
        info!(%addr, "connected");
        Ok(Self {
            link: Link::new(stream),
            token,
            peer: addr,
            inbox: VecDeque::new(),
            eof: false,
            eof_reported: false,
        })
    }

    /// Returns the hub address this socket is connected to.
    #[must_use]
    pub const fn peer_addr(&self) -> Endpoint {
        self.peer
    }

    /// Services readiness events for this socket's token.
    ///
    /// # Errors
    ///
    /// Malformed framing from the hub is fatal.
    pub fn pump(&mut self, ready: &[Token]) -> Result<(), NetError> {
        if !ready.contains(&self.token) || self.eof {
            return Ok(());
        }
        let (msgs, state) = self.link.read_pump()?;
        self.inbox.extend(msgs);
        if matches!(state, LinkState::Eof) || self.link.flush().is_err() {
            self.eof = true;
        }
        Ok(())
    }

    /// Pops the next event: queued messages first, then a single
    /// disconnect report once the link is gone.
    pub fn recv(&mut self) -> Option<DealerEvent> {
        if let Some(msg) = self.inbox.pop_front() {
            return Some(DealerEvent::Message(msg));
        }
        if self.eof && !self.eof_reported {
            self.eof_reported = true;
            return Some(DealerEvent::Disconnected);
        }
        None
    }

    /// Queues a message upstream and flushes what the socket will take.
    ///
    /// # Errors
    ///
    /// [`NetError::Closed`] once the connection is lost;
    /// [`NetError::Framing`] if the message violates frame bounds.
    pub fn send(&mut self, frames_to_send: &[Vec<u8>]) -> Result<(), NetError> {
        if self.eof {
            return Err(NetError::Closed);
        }
        self.link.queue(frames_to_send)?;
        if self.link.flush().is_err() {
            self.eof = true;
            return Err(NetError::Closed);
        }
        Ok(())
    }

    /// Flushes outstanding writes for up to `linger`, then drops the
    /// connection.
    pub fn close(mut self, poller: &mut Poller, linger: Duration) {
        let deadline = Instant::now() + linger;
        while self.link.has_backlog() && !self.eof {
            if self.link.flush().is_err() {
                break;
            }
            if !self.link.has_backlog() {
                break;
            }
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                warn!("close linger elapsed with unsent data");
                break;
            };
            if poller.wait(Timeout::Duration(left)).is_err() {
                break;
            }
        }
    }
}

/// Best-effort probe that `addr` currently accepts connections.
///
/// Used by launchers to sanity-check a hub address before submitting
/// jobs that would try to connect to it.
#[must_use]
pub fn has_connectivity(addr: &str, timeout: Duration) -> bool {
    let Ok(ep) = Endpoint::parse(addr) else {
        return false;
    };
    std::net::TcpStream::connect_timeout(&ep.as_socket_addr(), timeout).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Timeout = Timeout::Duration(Duration::from_millis(20));

    fn localhost_pool() -> Vec<Endpoint> {
        vec![Endpoint::localhost(0)]
    }

    /// Pumps `router` until `pred` holds or the deadline passes.
    fn router_until(
        poller: &mut Poller,
        router: &mut RouterSocket,
        mut pred: impl FnMut(&mut RouterSocket) -> bool,
    ) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if pred(router) {
                return;
            }
            let ready = poller.wait(TICK).unwrap();
            router.pump(poller, &ready).unwrap();
        }
        panic!("router condition not reached in time");
    }

    fn dealer_until(
        poller: &mut Poller,
        dealer: &mut DealerSocket,
        mut pred: impl FnMut(&mut DealerSocket) -> bool,
    ) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if pred(dealer) {
                return;
            }
            let ready = poller.wait(TICK).unwrap();
            dealer.pump(&ready).unwrap();
        }
        panic!("dealer condition not reached in time");
    }

    #[test]
    fn routing_id_frame_roundtrip() {
        let id = RoutingId::new(0xdead_beef, 17);
        let frame = id.to_frame();
        assert_eq!(frame.len(), RoutingId::WIRE_LEN);
        assert_eq!(RoutingId::from_frame(&frame), Some(id));
        assert_eq!(RoutingId::from_frame(&frame[..7]), None);
    }

    #[test]
    fn bind_skips_taken_address() {
        let mut poller = Poller::new().unwrap();
        let first = RouterSocket::bind(&mut poller, &localhost_pool()).unwrap();
        let taken = first.local_addr().unwrap();

        let mut poller2 = Poller::new().unwrap();
        let second =
            RouterSocket::bind(&mut poller2, &[taken, Endpoint::localhost(0)]).unwrap();
        assert_ne!(second.local_addr().unwrap().port(), taken.port());
    }

    #[test]
    fn bind_exhausted_pool_fails() {
        let mut poller = Poller::new().unwrap();
        let first = RouterSocket::bind(&mut poller, &localhost_pool()).unwrap();
        let taken = first.local_addr().unwrap();

        let mut poller2 = Poller::new().unwrap();
        let result = RouterSocket::bind(&mut poller2, &[taken]);
        assert!(matches!(result, Err(NetError::AddrPoolExhausted)));
    }

    #[test]
    fn roundtrip_both_directions() {
        let mut rp = Poller::new().unwrap();
        let mut router = RouterSocket::bind(&mut rp, &localhost_pool()).unwrap();
        let addr = router.local_addr().unwrap();

        let mut dp = Poller::new().unwrap();
        let mut dealer =
            DealerSocket::connect(&mut dp, addr, Timeout::Duration(Duration::from_secs(2)))
                .unwrap();

        dealer.send(&[Vec::new(), b"ping".to_vec()]).unwrap();
        let mut got = None;
        router_until(&mut rp, &mut router, |r| {
            got = r.recv();
            got.is_some()
        });
        let (id, msg) = got.unwrap();
        assert_eq!(msg, vec![Vec::new(), b"ping".to_vec()]);

        router.send(id, &[Vec::new(), b"pong".to_vec()]).unwrap();
        let mut reply = None;
        dealer_until(&mut dp, &mut dealer, |d| {
            reply = d.recv();
            reply.is_some()
        });
        match reply.unwrap() {
            DealerEvent::Message(frames) => {
                assert_eq!(frames, vec![Vec::new(), b"pong".to_vec()]);
            }
            DealerEvent::Disconnected => panic!("unexpected disconnect"),
        }
    }

    #[test]
    fn peer_eof_synthesizes_disconnect_notification() {
        let mut rp = Poller::new().unwrap();
        let mut router = RouterSocket::bind(&mut rp, &localhost_pool()).unwrap();
        let addr = router.local_addr().unwrap();

        let mut dp = Poller::new().unwrap();
        let mut dealer =
            DealerSocket::connect(&mut dp, addr, Timeout::Duration(Duration::from_secs(2)))
                .unwrap();
        dealer.send(&[Vec::new(), b"last words".to_vec()]).unwrap();
        drop(dealer);

        let mut msgs = Vec::new();
        router_until(&mut rp, &mut router, |r| {
            while let Some(m) = r.recv() {
                msgs.push(m);
            }
            msgs.len() >= 2
        });
        // Final message first, then the bare-delimiter notification.
        assert_eq!(msgs[0].1, vec![Vec::new(), b"last words".to_vec()]);
        assert_eq!(msgs[1].1, vec![Vec::new()]);
        assert_eq!(msgs[0].0, msgs[1].0);
        assert_eq!(router.peer_count(), 0);
    }

    #[test]
    fn hub_loss_reported_after_queued_messages() {
        let mut rp = Poller::new().unwrap();
        let mut router = RouterSocket::bind(&mut rp, &localhost_pool()).unwrap();
        let addr = router.local_addr().unwrap();

        let mut dp = Poller::new().unwrap();
        let mut dealer =
            DealerSocket::connect(&mut dp, addr, Timeout::Duration(Duration::from_secs(2)))
                .unwrap();
        dealer.send(&[Vec::new(), b"hello".to_vec()]).unwrap();

        let mut peer = None;
        router_until(&mut rp, &mut router, |r| {
            peer = r.recv().map(|(id, _)| id);
            peer.is_some()
        });
        router.send(peer.unwrap(), &[Vec::new(), b"bye".to_vec()]).unwrap();
        router.close(&mut rp, Duration::from_millis(200));

        let mut events = Vec::new();
        dealer_until(&mut dp, &mut dealer, |d| {
            while let Some(ev) = d.recv() {
                events.push(ev);
            }
            events.len() >= 2
        });
        assert!(matches!(&events[0], DealerEvent::Message(m) if m[1] == b"bye"));
        assert!(matches!(events[1], DealerEvent::Disconnected));
        assert!(dealer.send(&[Vec::new()]).is_err());
    }

    #[test]
    fn send_to_unknown_peer_fails() {
        let mut poller = Poller::new().unwrap();
        let mut router = RouterSocket::bind(&mut poller, &localhost_pool()).unwrap();
        let ghost = RoutingId::new(1, 1);
        assert!(matches!(
            router.send(ghost, &[Vec::new()]),
            Err(NetError::UnknownPeer(id)) if id == ghost
        ));
    }

    #[test]
    fn connect_to_dead_port_fails() {
        // Bind-then-drop to find a port nothing is listening on.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = Endpoint::from(probe.local_addr().unwrap());
        drop(probe);

        let mut poller = Poller::new().unwrap();
        let result =
            DealerSocket::connect(&mut poller, addr, Timeout::Duration(Duration::from_secs(2)));
        assert!(result.is_err());
    }

    #[test]
    fn connectivity_probe() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let live = format!("tcp://{}", listener.local_addr().unwrap());
        assert!(has_connectivity(&live, Duration::from_millis(500)));

        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = format!("tcp://{}", probe.local_addr().unwrap());
        drop(probe);
        assert!(!has_connectivity(&dead, Duration::from_millis(500)));
        assert!(!has_connectivity("not an address", Duration::from_millis(500)));
    }
}
