//! Protocol grammar on top of multipart messages.
//!
//! Every message starts (after any identity frames) with an empty
//! delimiter frame. A peer-to-hub message is a [`Report`]; a hub-to-peer
//! message is a [`Directive`]. A message that ends right after the
//! delimiter is a disconnect notification, synthesized by the transport
//! when a connection dies.
//!
//! Relayed traffic carries one extra leading identity frame: the
//! routing id of the originating (or target) peer on the far side of
//! the proxy.

use std::fmt;

use thiserror::Error;

use crate::net::{Multipart, RoutingId};

/// Environment names with this prefix name a module to load rather
/// than a value to bind.
pub const MODULE_PREFIX: &str = "module:";

/// Peer lifecycle and message status code, one byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Registered and ready, or carrying an ordinary request/reply.
    Active = 0,
    /// Told to terminate; final disconnect still expected.
    Shutdown = 1,
    /// Terminal: disconnected after an acknowledged shutdown.
    Finished = 2,
    /// Terminal: disconnected with no shutdown in flight.
    Error = 3,
    /// Proxy control traffic (heartbeat or command), not a task reply.
    ProxyCmd = 4,
    /// Terminal proxy failure.
    ProxyError = 5,
    /// Tells a proxy to terminate itself.
    ProxyShutdown = 6,
}

impl Status {
    /// Encodes the status as a wire frame.
    #[must_use]
    pub fn as_frame(self) -> Vec<u8> {
        vec![self as u8]
    }

    /// Decodes a status frame.
    ///
    /// # Errors
    ///
    /// Fails on a frame that is not exactly one recognized byte.
    pub fn from_frame(frame: &[u8]) -> Result<Self, WireError> {
        let [byte] = frame else {
            return Err(WireError::MalformedStatus);
        };
        Self::try_from(*byte)
    }
}

impl TryFrom<u8> for Status {
    type Error = WireError;

    fn try_from(byte: u8) -> Result<Self, WireError> {
        match byte {
            0 => Ok(Self::Active),
            1 => Ok(Self::Shutdown),
            2 => Ok(Self::Finished),
            3 => Ok(Self::Error),
            4 => Ok(Self::ProxyCmd),
            5 => Ok(Self::ProxyError),
            6 => Ok(Self::ProxyShutdown),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Shutdown => "shutdown",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::ProxyCmd => "proxy_cmd",
            Self::ProxyError => "proxy_error",
            Self::ProxyShutdown => "proxy_shutdown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("empty message")]
    Empty,
    #[error("missing delimiter frame")]
    MissingDelimiter,
    #[error("malformed status frame")]
    MalformedStatus,
    #[error("unknown status code {0}")]
    UnknownStatus(u8),
    #[error("malformed routing id frame")]
    MalformedRoutingId,
    #[error("truncated report")]
    TruncatedReport,
    #[error("truncated directive")]
    TruncatedDirective,
    #[error("unexpected trailing frames")]
    TrailingFrames,
    #[error("environment name is not valid utf-8")]
    BadEnvName,
    #[error("environment name without a value frame")]
    DanglingEnvName,
    #[error("malformed cache name list")]
    MalformedNameList,
}

/// Peer-to-hub message: status, profiling snapshot, optional payload.
///
/// The profiling frames are opaque here; only the peer that produced
/// them knows their encoding. A registration carries an empty (but
/// present) payload; a heartbeat carries none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub status: Status,
    pub time: Vec<u8>,
    pub mem: Vec<u8>,
    pub payload: Option<Vec<u8>>,
}

impl Report {
    /// Encodes as `[delim][status][time][mem][payload?]`.
    #[must_use]
    pub fn to_frames(&self) -> Multipart {
        let mut frames = vec![
            Vec::new(),
            self.status.as_frame(),
            self.time.clone(),
            self.mem.clone(),
        ];
        if let Some(payload) = &self.payload {
            frames.push(payload.clone());
        }
        frames
    }

    /// Parses the frames after the delimiter.
    fn parse(rest: &[Vec<u8>]) -> Result<Self, WireError> {
        if rest.len() < 3 {
            return Err(WireError::TruncatedReport);
        }
        if rest.len() > 4 {
            return Err(WireError::TrailingFrames);
        }
        Ok(Self {
            status: Status::from_frame(&rest[0])?,
            time: rest[1].clone(),
            mem: rest[2].clone(),
            payload: rest.get(3).cloned(),
        })
    }
}

/// A message classified from the hub's point of view.
#[derive(Debug)]
pub enum Inbound {
    /// Report from a directly connected peer.
    Direct(Report),
    /// Report relayed by a proxy on behalf of `origin`.
    Relayed { origin: RoutingId, report: Report },
    /// The sending peer's connection is gone.
    Disconnect,
    /// A proxy relays that its dependent `origin` is gone.
    RelayedDisconnect { origin: RoutingId },
}

/// Classifies an inbound message on a hub socket.
///
/// The transport already stripped the sender's own identity, so the
/// first frame is either the delimiter (direct peer) or the originating
/// routing id (relayed through a proxy).
///
/// # Errors
///
/// Fails on a missing delimiter or a malformed status, profiling, or
/// identity frame.
pub fn classify(frames: &Multipart) -> Result<Inbound, WireError> {
    let Some(first) = frames.first() else {
        return Err(WireError::Empty);
    };
    if first.is_empty() {
        let rest = &frames[1..];
        if rest.is_empty() {
            return Ok(Inbound::Disconnect);
        }
        return Ok(Inbound::Direct(Report::parse(rest)?));
    }
    let origin = RoutingId::from_frame(first).ok_or(WireError::MalformedRoutingId)?;
    match frames.get(1) {
        Some(delim) if delim.is_empty() => {}
        _ => return Err(WireError::MissingDelimiter),
    }
    let rest = &frames[2..];
    if rest.is_empty() {
        return Ok(Inbound::RelayedDisconnect { origin });
    }
    Ok(Inbound::Relayed {
        origin,
        report: Report::parse(rest)?,
    })
}

/// Hub-to-peer message: status, payload, environment updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub status: Status,
    pub payload: Vec<u8>,
    pub env: Vec<(String, Vec<u8>)>,
}

impl Directive {
    /// Encodes as `[delim][status][payload](name,value)*`.
    #[must_use]
    pub fn to_frames(&self) -> Multipart {
        let mut frames = Vec::with_capacity(3 + self.env.len() * 2);
        frames.push(Vec::new());
        frames.push(self.status.as_frame());
        frames.push(self.payload.clone());
        for (name, value) in &self.env {
            frames.push(name.clone().into_bytes());
            frames.push(value.clone());
        }
        frames
    }

    /// Encodes the relay form addressed to `dep` on the far side of a
    /// proxy: `[dep][delim][status][payload](name,value)*[cache_names]`.
    ///
    /// The cache-name frame is always present in this form, even when
    /// empty, so the proxy can parse the env tail unambiguously.
    #[must_use]
    pub fn to_relay_frames(&self, dep: RoutingId, cached: &[String]) -> Multipart {
        let mut frames = Vec::with_capacity(5 + self.env.len() * 2);
        frames.push(dep.to_frame());
        frames.push(Vec::new());
        frames.push(self.status.as_frame());
        frames.push(self.payload.clone());
        for (name, value) in &self.env {
            frames.push(name.clone().into_bytes());
            frames.push(value.clone());
        }
        frames.push(encode_names(cached));
        frames
    }

    /// Parses the direct (worker-facing) form.
    ///
    /// # Errors
    ///
    /// Fails on a missing delimiter, truncation, or a malformed env
    /// pair.
    pub fn parse(frames: &Multipart) -> Result<Self, WireError> {
        match frames.first() {
            Some(delim) if delim.is_empty() => {}
            Some(_) => return Err(WireError::MissingDelimiter),
            None => return Err(WireError::Empty),
        }
        if frames.len() < 3 {
            return Err(WireError::TruncatedDirective);
        }
        Ok(Self {
            status: Status::from_frame(&frames[1])?,
            payload: frames[2].clone(),
            env: parse_env_pairs(&frames[3..])?,
        })
    }
}

/// A message parsed on a proxy's upstream socket.
#[derive(Debug)]
pub enum Upstream {
    /// Control traffic addressed to the proxy itself.
    Control(Directive),
    /// A directive to relay to downstream peer `dep`, with the names
    /// the proxy must supply from its own cache.
    Relay {
        dep: RoutingId,
        directive: Directive,
        cached: Vec<String>,
    },
}

/// Parses a message arriving on a proxy's upstream connection.
///
/// # Errors
///
/// Fails on malformed identity, delimiter, status, env, or cache-name
/// frames.
pub fn parse_upstream(frames: &Multipart) -> Result<Upstream, WireError> {
    let Some(first) = frames.first() else {
        return Err(WireError::Empty);
    };
    if first.is_empty() {
        return Ok(Upstream::Control(Directive::parse(frames)?));
    }
    let dep = RoutingId::from_frame(first).ok_or(WireError::MalformedRoutingId)?;
    match frames.get(1) {
        Some(delim) if delim.is_empty() => {}
        _ => return Err(WireError::MissingDelimiter),
    }
    if frames.len() < 5 {
        return Err(WireError::TruncatedDirective);
    }
    let status = Status::from_frame(&frames[2])?;
    let payload = frames[3].clone();
    let Some((names_frame, pair_frames)) = frames[4..].split_last() else {
        return Err(WireError::TruncatedDirective);
    };
    Ok(Upstream::Relay {
        dep,
        directive: Directive {
            status,
            payload,
            env: parse_env_pairs(pair_frames)?,
        },
        cached: decode_names(names_frame)?,
    })
}

fn parse_env_pairs(frames: &[Vec<u8>]) -> Result<Vec<(String, Vec<u8>)>, WireError> {
    if frames.len() % 2 != 0 {
        return Err(WireError::DanglingEnvName);
    }
    let mut pairs = Vec::with_capacity(frames.len() / 2);
    for chunk in frames.chunks_exact(2) {
        let name =
            String::from_utf8(chunk[0].clone()).map_err(|_| WireError::BadEnvName)?;
        pairs.push((name, chunk[1].clone()));
    }
    Ok(pairs)
}

/// Encodes a name list as `count:u32le (len:u32le bytes)*`.
#[must_use]
pub fn encode_names(names: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    let count = u32::try_from(names.len()).unwrap_or(u32::MAX);
    out.extend_from_slice(&count.to_le_bytes());
    for name in names {
        let len = u32::try_from(name.len()).unwrap_or(u32::MAX);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
    }
    out
}

/// Decodes a name list produced by [`encode_names`].
///
/// # Errors
///
/// Fails on truncation, trailing bytes, or non-UTF-8 names.
pub fn decode_names(buf: &[u8]) -> Result<Vec<String>, WireError> {
    let mut rest = buf;
    let count = take_u32(&mut rest).ok_or(WireError::MalformedNameList)?;
    let mut names = Vec::new();
    for _ in 0..count {
        let len = take_u32(&mut rest).ok_or(WireError::MalformedNameList)? as usize;
        if rest.len() < len {
            return Err(WireError::MalformedNameList);
        }
        let (bytes, tail) = rest.split_at(len);
        names.push(String::from_utf8(bytes.to_vec()).map_err(|_| WireError::BadEnvName)?);
        rest = tail;
    }
    if !rest.is_empty() {
        return Err(WireError::MalformedNameList);
    }
    Ok(names)
}

fn take_u32(rest: &mut &[u8]) -> Option<u32> {
    if rest.len() < 4 {
        return None;
    }
    let (head, tail) = rest.split_at(4);
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(head);
    *rest = tail;
    Some(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: Status, payload: Option<&[u8]>) -> Report {
        Report {
            status,
            time: 7u64.to_le_bytes().to_vec(),
            mem: 11u64.to_le_bytes().to_vec(),
            payload: payload.map(<[u8]>::to_vec),
        }
    }

    #[test]
    fn status_codes_roundtrip() {
        for byte in 0u8..=6 {
            let status = Status::try_from(byte).unwrap();
            assert_eq!(Status::from_frame(&status.as_frame()), Ok(status));
        }
        assert_eq!(Status::try_from(7), Err(WireError::UnknownStatus(7)));
        assert_eq!(Status::from_frame(&[]), Err(WireError::MalformedStatus));
        assert_eq!(Status::from_frame(&[0, 0]), Err(WireError::MalformedStatus));
    }

    #[test]
    fn classify_direct_report() {
        let sent = report(Status::Active, Some(b"result"));
        match classify(&sent.to_frames()).unwrap() {
            Inbound::Direct(got) => assert_eq!(got, sent),
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn classify_heartbeat_without_payload() {
        let sent = report(Status::ProxyCmd, None);
        match classify(&sent.to_frames()).unwrap() {
            Inbound::Direct(got) => {
                assert_eq!(got.payload, None);
                assert_eq!(got.status, Status::ProxyCmd);
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn classify_disconnect_notification() {
        assert!(matches!(
            classify(&vec![Vec::new()]).unwrap(),
            Inbound::Disconnect
        ));
    }

    #[test]
    fn classify_relayed_report_and_disconnect() {
        let origin = RoutingId::from_frame(&5u64.to_le_bytes()).unwrap();
        let mut frames = vec![origin.to_frame()];
        frames.extend(report(Status::Active, Some(b"r")).to_frames());
        match classify(&frames).unwrap() {
            Inbound::Relayed { origin: got, report } => {
                assert_eq!(got, origin);
                assert_eq!(report.payload.as_deref(), Some(b"r".as_slice()));
            }
            other => panic!("unexpected classification: {other:?}"),
        }

        let gone = vec![origin.to_frame(), Vec::new()];
        assert!(matches!(
            classify(&gone).unwrap(),
            Inbound::RelayedDisconnect { origin: got } if got == origin
        ));
    }

    #[test]
    fn classify_rejects_malformed_messages() {
        assert!(matches!(classify(&Vec::new()), Err(WireError::Empty)));
        let bad_id = vec![b"xyz".to_vec(), Vec::new()];
        assert!(matches!(classify(&bad_id), Err(WireError::MalformedRoutingId)));
        let no_delim = vec![1u64.to_le_bytes().to_vec(), b"not empty".to_vec()];
        assert!(matches!(classify(&no_delim), Err(WireError::MissingDelimiter)));
        let short = vec![Vec::new(), Status::Active.as_frame()];
        assert!(matches!(classify(&short), Err(WireError::TruncatedReport)));
    }

    #[test]
    fn directive_roundtrip_with_env() {
        let sent = Directive {
            status: Status::Active,
            payload: b"call".to_vec(),
            env: vec![
                ("x".into(), b"1".to_vec()),
                ("module:tools".into(), Vec::new()),
            ],
        };
        assert_eq!(Directive::parse(&sent.to_frames()).unwrap(), sent);
    }

    #[test]
    fn directive_rejects_dangling_name() {
        let mut frames = Directive {
            status: Status::Active,
            payload: Vec::new(),
            env: Vec::new(),
        }
        .to_frames();
        frames.push(b"orphan".to_vec());
        assert!(matches!(
            Directive::parse(&frames),
            Err(WireError::DanglingEnvName)
        ));
    }

    #[test]
    fn relay_form_roundtrips_through_upstream_parse() {
        let dep = RoutingId::from_frame(&9u64.to_le_bytes()).unwrap();
        let directive = Directive {
            status: Status::Active,
            payload: b"call".to_vec(),
            env: vec![("fresh".into(), b"v".to_vec())],
        };
        let cached = vec!["seen_before".to_string()];
        let frames = directive.to_relay_frames(dep, &cached);
        match parse_upstream(&frames).unwrap() {
            Upstream::Relay {
                dep: got_dep,
                directive: got,
                cached: got_cached,
            } => {
                assert_eq!(got_dep, dep);
                assert_eq!(got, directive);
                assert_eq!(got_cached, cached);
            }
            Upstream::Control(_) => panic!("relay parsed as control"),
        }
    }

    #[test]
    fn upstream_control_form() {
        let directive = Directive {
            status: Status::ProxyShutdown,
            payload: Vec::new(),
            env: Vec::new(),
        };
        match parse_upstream(&directive.to_frames()).unwrap() {
            Upstream::Control(got) => assert_eq!(got.status, Status::ProxyShutdown),
            Upstream::Relay { .. } => panic!("control parsed as relay"),
        }
    }

    #[test]
    fn name_list_roundtrip_and_rejects() {
        let names = vec!["a".to_string(), "long_name".to_string(), String::new()];
        assert_eq!(decode_names(&encode_names(&names)).unwrap(), names);
        assert_eq!(decode_names(&encode_names(&[])).unwrap(), Vec::<String>::new());

        assert!(decode_names(&[1, 0, 0]).is_err());
        let mut trailing = encode_names(&names);
        trailing.push(0);
        assert!(decode_names(&trailing).is_err());
        // Claims one name but provides no length.
        assert!(decode_names(&1u32.to_le_bytes()).is_err());
    }
}
