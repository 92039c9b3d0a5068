use std::io::{ErrorKind, Read, Write};

use mio::net::TcpStream;
use mio::Token;
use tracing::warn;

use crate::server::ServerState;
use crate::{Error, Result};

/// One nonblocking drain of a socket: everything available right now, plus
/// whether the peer closed its end.
pub struct ReadOutcome {
    pub data: Vec<u8>,
    pub closed: bool,
}

/// Read until the socket would block, growing the buffer as needed.
pub fn read_available(connection: &mut TcpStream) -> std::io::Result<ReadOutcome> {
    let mut data = vec![0; 512];
    let mut filled = 0;
    let mut closed = false;
    loop {
        match connection.read(&mut data[filled..]) {
            // Zero bytes means the peer is done writing.
            Ok(0) => {
                closed = true;
                break;
            }
            Ok(n) => {
                filled += n;
                if filled == data.len() {
                    data.resize(data.len() + 512, 0);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    data.truncate(filled);
    Ok(ReadOutcome { data, closed })
}

/// Handle a readable event on a client connection: drain, dispatch, write
/// back. Returns `(closed, promote_to_replica)`.
pub fn handle_client_event(
    connection: &mut TcpStream,
    token: Token,
    state: &mut ServerState,
) -> Result<(bool, bool)> {
    let read = read_available(connection)?;
    if read.data.is_empty() {
        return Ok((read.closed, false));
    }

    let text = std::str::from_utf8(&read.data)
        .map_err(|_| Error::Protocol("request is not valid UTF-8".to_string()))?;
    let outcome = state.handle(text, token, false)?;

    if let Some(response) = outcome.response {
        connection.write_all(&response)?;
        connection.flush()?;
    }
    Ok((read.closed, outcome.register_replica))
}

/// Handle a readable event on a promoted replica connection. The only
/// traffic expected here is `REPLCONF ACK <n>`; anything else is logged
/// and dropped. Cleans the registry up on EOF or error.
pub fn handle_replica_event(token: Token, state: &mut ServerState) {
    let read = {
        let Some(stream) = state.registry_mut().and_then(|r| r.writer_mut(token)) else {
            return;
        };
        match read_available(stream) {
            Ok(read) => read,
            Err(e) => {
                warn!(?token, error = %e, "replica connection failed");
                state.remove_replica(token);
                return;
            }
        }
    };

    if !read.data.is_empty() {
        match std::str::from_utf8(&read.data) {
            Ok(text) => {
                if let Err(e) = state.handle(text, token, false) {
                    warn!(?token, error = %e, "ignoring bad traffic from replica");
                }
            }
            Err(_) => warn!(?token, "ignoring non UTF-8 traffic from replica"),
        }
    }
    if read.closed {
        state.remove_replica(token);
    }
}
