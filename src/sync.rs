use std::io::Write;
use std::net::ToSocketAddrs;

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::read_available;
use crate::error::ReplicationError;
use crate::rdb::Rdb;
use crate::resp::{self, Value};
use crate::server::ServerState;
use crate::token::UPSTREAM;
use crate::{Error, Result};

/// Where the replication handshake currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    PingSent,
    PortSent,
    CapaSent,
    PsyncSent,
    AwaitingSnapshot,
    Streaming,
}

/// The secondary's persistent connection to its primary. Runs the
/// handshake, swallows the snapshot, then ingests propagated commands for
/// the lifetime of the process.
pub struct UpstreamLink {
    stream: TcpStream,
    phase: Phase,
    /// Bytes received but not yet consumed; propagated commands may be
    /// split across reads.
    pending: BytesMut,
    own_port: u16,
}

impl UpstreamLink {
    pub fn connect(config: &Config) -> Result<Self> {
        let (host, port) = config.replicaof.as_ref().ok_or_else(|| {
            Error::Argument("cannot open a primary link without --replicaof".to_string())
        })?;
        let endpoint = format!("{}:{}", host, port);
        let addr = endpoint
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ReplicationError::Connection(endpoint.clone()))?;
        let stream = TcpStream::connect(addr)
            .map_err(|_| Error::Replication(ReplicationError::Connection(endpoint.clone())))?;
        info!(primary = %endpoint, "connecting to primary");
        Ok(Self {
            stream,
            phase: Phase::Connecting,
            pending: BytesMut::new(),
            own_port: config.port,
        })
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The socket became writable: if the connection just came up, open
    /// the handshake with a PING.
    pub fn on_writable(&mut self) -> Result<()> {
        if self.phase != Phase::Connecting {
            return Ok(());
        }
        self.send(&Value::command(&["PING"]))?;
        self.phase = Phase::PingSent;
        Ok(())
    }

    /// The socket became readable: pull everything available and advance
    /// the state machine as far as the buffered bytes allow.
    pub fn on_readable(&mut self, state: &mut ServerState) -> Result<()> {
        let read = read_available(&mut self.stream)?;
        self.pending.extend_from_slice(&read.data);
        self.advance(state)?;
        if read.closed {
            return Err(ReplicationError::PrimaryClosed.into());
        }
        Ok(())
    }

    fn advance(&mut self, state: &mut ServerState) -> Result<()> {
        loop {
            match self.phase {
                Phase::Connecting => return Ok(()),
                Phase::PingSent => {
                    let Some(reply) = take_reply(&mut self.pending)? else {
                        return Ok(());
                    };
                    warn_on_mismatch(&reply, "PONG");
                    let port = self.own_port.to_string();
                    self.send(&Value::command(&["REPLCONF", "listening-port", port.as_str()]))?;
                    self.phase = Phase::PortSent;
                }
                Phase::PortSent => {
                    let Some(reply) = take_reply(&mut self.pending)? else {
                        return Ok(());
                    };
                    warn_on_mismatch(&reply, "OK");
                    self.send(&Value::command(&["REPLCONF", "capa", "psync2"]))?;
                    self.phase = Phase::CapaSent;
                }
                Phase::CapaSent => {
                    let Some(reply) = take_reply(&mut self.pending)? else {
                        return Ok(());
                    };
                    warn_on_mismatch(&reply, "OK");
                    self.send(&Value::command(&["PSYNC", "?", "-1"]))?;
                    self.phase = Phase::PsyncSent;
                }
                Phase::PsyncSent => {
                    let Some(reply) = take_reply(&mut self.pending)? else {
                        return Ok(());
                    };
                    // Anything but FULLRESYNC is fatal here.
                    match &reply {
                        Value::SimpleString(s) if s.starts_with("FULLRESYNC") => {
                            info!(reply = %s, "primary accepted full resynchronization");
                            self.phase = Phase::AwaitingSnapshot;
                        }
                        other => {
                            return Err(ReplicationError::HandshakeMismatch {
                                expected: "FULLRESYNC".to_string(),
                                got: format!("{:?}", other),
                            }
                            .into());
                        }
                    }
                }
                Phase::AwaitingSnapshot => {
                    let Some((snapshot, consumed)) = split_snapshot(&self.pending) else {
                        return Ok(());
                    };
                    self.load_snapshot(&snapshot, state);
                    self.pending.advance(consumed);
                    self.phase = Phase::Streaming;
                }
                Phase::Streaming => {
                    if self.pending.is_empty() {
                        return Ok(());
                    }
                    let text = std::str::from_utf8(&self.pending).map_err(|_| {
                        Error::Protocol("propagated traffic is not valid UTF-8".to_string())
                    })?;
                    let outcome = state.handle(text, UPSTREAM, true)?;
                    if let Some(response) = outcome.response {
                        self.stream.write_all(&response)?;
                        self.stream.flush()?;
                    }
                    self.pending.advance(outcome.consumed);
                    return Ok(());
                }
            }
        }
    }

    fn load_snapshot(&self, snapshot: &[u8], state: &mut ServerState) {
        match Rdb::parse(snapshot) {
            Ok(rdb) => {
                let entries = rdb.database(0);
                info!(keys = entries.len(), "loaded snapshot from primary");
                for entry in entries {
                    state
                        .store
                        .set(&entry.key, entry.value.clone(), entry.expires_at);
                }
            }
            Err(e) => {
                warn!(error = %e, "could not decode the primary's snapshot, skipping it");
            }
        }
    }

    fn send(&mut self, value: &Value) -> Result<()> {
        debug!(command = %value.to_string().escape_debug(), "handshake send");
        self.stream.write_all(value.to_string().as_bytes())?;
        self.stream.flush()?;
        Ok(())
    }
}

/// Pop one single-line reply off the buffer, or `None` when the line is
/// still incomplete. Handshake replies are always single-line.
fn take_reply(pending: &mut BytesMut) -> Result<Option<Value>> {
    let Some(pos) = find_crlf(pending) else {
        return Ok(None);
    };
    let line = pending.split_to(pos + 2);
    let text = std::str::from_utf8(&line)
        .map_err(|_| Error::Protocol("handshake reply is not valid UTF-8".to_string()))?;
    let (value, _) = resp::decode(text)?;
    Ok(Some(value))
}

fn warn_on_mismatch(reply: &Value, expected: &str) {
    match reply {
        Value::SimpleString(s) if s == expected => {}
        other => warn!(?other, expected, "unexpected handshake reply"),
    }
}

/// Split the RDB snapshot off the front of the buffer, returning the blob
/// and the total bytes to discard. Prefers the `$<len>\r\n` framing; falls
/// back to scanning for the `REDIS0011` magic and the 0xFF EOF marker plus
/// its 8-byte checksum. `None` means the snapshot has not fully arrived.
fn split_snapshot(buf: &[u8]) -> Option<(Vec<u8>, usize)> {
    if buf.first() == Some(&b'$') {
        let pos = find_crlf(buf)?;
        if let Ok(header) = std::str::from_utf8(&buf[..pos + 2]) {
            if let Ok((_, len)) = resp::parse_snapshot_header(header) {
                let total = pos + 2 + len as usize;
                if buf.len() < total {
                    return None;
                }
                return Some((buf[pos + 2..total].to_vec(), total));
            }
        }
    }

    let start = find_subslice(buf, b"REDIS0011")?;
    let eof = start + buf[start..].iter().position(|&b| b == 0xFF)?;
    let end = eof + 9;
    if buf.len() < end {
        return None;
    }
    Some((buf[start..end].to_vec(), end))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

fn find_subslice(buf: &[u8], needle: &[u8]) -> Option<usize> {
    buf.windows(needle.len()).position(|window| window == needle)
}
