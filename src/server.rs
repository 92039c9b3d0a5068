use std::io::Write;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::Token;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, warn};

use crate::command::Command;
use crate::config::Config;
use crate::rdb;
use crate::replica::ReplicaRegistry;
use crate::resp::{self, Value};
use crate::store::Store;
use crate::{Error, Result};

/// Which side of the replication pair this process is. Fixed at startup.
#[derive(Debug)]
pub enum Role<W> {
    Primary {
        replication_id: String,
        /// Bytes of write traffic broadcast to replicas so far.
        replication_offset: u64,
        registry: ReplicaRegistry<W>,
    },
    Secondary {
        /// Bytes of propagated traffic consumed from the primary so far,
        /// counted per command as it is dispatched.
        bytes_processed: u64,
    },
}

/// A WAIT command parked until enough replicas acknowledge or the deadline
/// passes. Completed from the reactor tick.
#[derive(Debug)]
pub struct PendingWait {
    pub token: Token,
    pub target_offset: u64,
    pub required: usize,
    pub deadline: Instant,
}

/// What a handler produced: a RESP value, pre-encoded raw bytes (the PSYNC
/// snapshot handoff), or nothing at all.
#[derive(Debug)]
pub enum Reply {
    Value(Value),
    Raw(Vec<u8>),
    None,
}

impl Reply {
    pub fn simple(text: &str) -> Self {
        Reply::Value(Value::SimpleString(text.to_string()))
    }
}

/// Result of feeding a chunk of wire bytes through the dispatcher.
#[derive(Debug)]
pub struct Outcome {
    /// Bytes to write back, or `None` for "write nothing". The suppressed
    /// case is exactly null, never an empty payload.
    pub response: Option<Vec<u8>>,
    /// A PSYNC was served: promote this connection to the replica registry.
    pub register_replica: bool,
    /// How much of the input was consumed; the rest was incomplete.
    pub consumed: usize,
}

pub struct ServerState<W: Write = TcpStream> {
    pub config: Config,
    pub store: Store,
    role: Role<W>,
    pending_wait: Option<PendingWait>,
}

impl<W: Write> ServerState<W> {
    pub fn primary(config: Config, store: Store) -> Self {
        Self {
            config,
            store,
            role: Role::Primary {
                replication_id: random_replication_id(),
                replication_offset: 0,
                registry: ReplicaRegistry::new(),
            },
            pending_wait: None,
        }
    }

    pub fn secondary(config: Config, store: Store) -> Self {
        Self {
            config,
            store,
            role: Role::Secondary { bytes_processed: 0 },
            pending_wait: None,
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.role, Role::Primary { .. })
    }

    pub fn replication_offset(&self) -> u64 {
        match &self.role {
            Role::Primary {
                replication_offset, ..
            } => *replication_offset,
            Role::Secondary { .. } => 0,
        }
    }

    pub fn bytes_processed(&self) -> u64 {
        match &self.role {
            Role::Secondary {
                bytes_processed, ..
            } => *bytes_processed,
            Role::Primary { .. } => 0,
        }
    }

    fn add_bytes_processed(&mut self, n: u64) {
        if let Role::Secondary {
            bytes_processed, ..
        } = &mut self.role
        {
            *bytes_processed += n;
        }
    }

    pub fn registry(&self) -> Option<&ReplicaRegistry<W>> {
        match &self.role {
            Role::Primary { registry, .. } => Some(registry),
            Role::Secondary { .. } => None,
        }
    }

    pub fn registry_mut(&mut self) -> Option<&mut ReplicaRegistry<W>> {
        match &mut self.role {
            Role::Primary { registry, .. } => Some(registry),
            Role::Secondary { .. } => None,
        }
    }

    /// Attach a freshly PSYNCed connection at the current offset.
    pub fn register_replica(&mut self, writer: W, token: Token) {
        let offset = self.replication_offset();
        if let Some(registry) = self.registry_mut() {
            registry.add(writer, token, offset);
            debug!(?token, offset, "registered replica");
        }
    }

    pub fn remove_replica(&mut self, token: Token) {
        if let Some(registry) = self.registry_mut() {
            registry.remove(token);
        }
    }

    pub fn ack(&mut self, token: Token, offset: u64) {
        if let Some(registry) = self.registry_mut() {
            registry.update_offset(token, offset);
        }
    }

    pub fn replication_info(&self) -> String {
        match &self.role {
            Role::Primary {
                replication_id,
                replication_offset,
                ..
            } => format!(
                "role:master\r\nmaster_repl_offset:{}\r\nmaster_replid:{}",
                replication_offset, replication_id
            ),
            Role::Secondary { .. } => "role:slave".to_string(),
        }
    }

    /// The full PSYNC answer: `+FULLRESYNC <id> <offset>\r\n` followed by
    /// the framed snapshot, with no terminator after the blob.
    pub fn fullresync_reply(&self) -> Result<Vec<u8>> {
        let Role::Primary {
            replication_id,
            replication_offset,
            ..
        } = &self.role
        else {
            return Err(Error::Argument(
                "PSYNC is only valid on a primary".to_string(),
            ));
        };
        let mut reply =
            format!("+FULLRESYNC {} {}\r\n", replication_id, replication_offset).into_bytes();
        reply.extend(resp::encode_snapshot(&rdb::empty_snapshot()?));
        Ok(reply)
    }

    /// Forward raw wire bytes to every replica. Every broadcast advances
    /// the replication offset by its length.
    pub fn broadcast(&mut self, bytes: &[u8]) {
        if let Role::Primary {
            replication_offset,
            registry,
            ..
        } = &mut self.role
        {
            registry.broadcast(bytes);
            *replication_offset += bytes.len() as u64;
        }
    }

    /// Begin a WAIT: answer immediately when no write traffic has been
    /// broadcast yet, otherwise ask the replicas for acknowledgements and
    /// park until `poll_wait` finishes the job.
    pub fn start_wait(&mut self, token: Token, required: usize, timeout_ms: u64) -> Result<Reply> {
        let target_offset = self.replication_offset();
        let Some(registry) = self.registry() else {
            return Ok(Reply::Value(Value::Integer(0)));
        };
        if target_offset == 0 {
            return Ok(Reply::Value(Value::Integer(registry.len() as i64)));
        }

        let getack = Value::command(&["REPLCONF", "GETACK", "*"]).to_string();
        self.broadcast(getack.as_bytes());
        self.pending_wait = Some(PendingWait {
            token,
            target_offset,
            required,
            deadline: Instant::now() + Duration::from_millis(timeout_ms),
        });
        Ok(Reply::None)
    }

    /// Check the parked WAIT, if any. Returns the waiting connection's
    /// token and the count to answer once enough replicas caught up or the
    /// deadline passed.
    pub fn poll_wait(&mut self) -> Option<(Token, i64)> {
        let wait = self.pending_wait.as_ref()?;
        let count = self.registry()?.count_at_least(wait.target_offset);
        if count >= wait.required || Instant::now() >= wait.deadline {
            let token = wait.token;
            self.pending_wait = None;
            return Some((token, count as i64));
        }
        None
    }

    /// Dispatch a chunk of wire bytes from one connection.
    ///
    /// `propagated` marks traffic arriving on a secondary's primary link:
    /// possibly several concatenated commands, responses suppressed except
    /// for the acknowledgement path, every command's byte count added to
    /// `bytes_processed`. Client traffic must parse completely; propagated
    /// traffic may leave an incomplete tail for the caller to buffer.
    pub fn handle(&mut self, raw: &str, token: Token, propagated: bool) -> Result<Outcome> {
        let (values, consumed) = resp::decode_stream(raw);
        if !propagated && consumed < raw.len() {
            return Err(Error::Protocol(format!(
                "undecodable bytes at offset {}",
                consumed
            )));
        }

        let mut response = Vec::new();
        let mut register_replica = false;
        let mut offset = 0;
        for (value, len) in values {
            let raw_command = &raw[offset..offset + len];
            offset += len;

            match self.dispatch_one(&value, raw_command, token, propagated, &mut register_replica)
            {
                Ok(Some(bytes)) => response.extend(bytes),
                Ok(None) => {}
                Err(e) if e.is_domain() => {
                    if propagated {
                        warn!(error = %e, "ignoring bad propagated command");
                    } else {
                        response.extend(Value::Error(format!("ERR {}", e)).to_string().into_bytes());
                    }
                }
                Err(e) => return Err(e),
            }
            if propagated {
                self.add_bytes_processed(len as u64);
            }
        }

        Ok(Outcome {
            response: (!response.is_empty()).then_some(response),
            register_replica,
            consumed,
        })
    }

    fn dispatch_one(
        &mut self,
        value: &Value,
        raw_command: &str,
        token: Token,
        propagated: bool,
        register_replica: &mut bool,
    ) -> Result<Option<Vec<u8>>> {
        let command = Command::try_from(value)?;
        debug!(?token, ?command, propagated, "dispatch");

        if self.is_primary() && command.is_write() {
            self.broadcast(raw_command.as_bytes());
        }

        let reply = command.execute(self, token)?;
        if matches!(command, Command::Psync { .. }) {
            *register_replica = true;
        }

        // On the primary link a secondary only ever answers GETACK.
        if propagated && !matches!(command, Command::ReplConfGetAck) {
            return Ok(None);
        }
        Ok(match reply {
            Reply::Value(v) => Some(v.to_string().into_bytes()),
            Reply::Raw(bytes) => Some(bytes),
            Reply::None => None,
        })
    }
}

fn random_replication_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect()
}
