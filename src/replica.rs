use std::io::Write;
use std::time::Instant;

use mio::Token;
use tracing::{debug, warn};

/// One attached secondary: the writable half of its connection, identified
/// by its reactor token, with the latest offset it has acknowledged.
#[derive(Debug)]
pub struct Replica<W> {
    pub writer: W,
    pub token: Token,
    pub offset: u64,
    pub registered_at: Instant,
}

/// The set of secondaries attached to this primary. Owned by the server
/// state; the single-threaded reactor serializes all access.
#[derive(Debug)]
pub struct ReplicaRegistry<W> {
    replicas: Vec<Replica<W>>,
}

impl<W: Write> ReplicaRegistry<W> {
    pub fn new() -> Self {
        Self {
            replicas: Vec::new(),
        }
    }

    pub fn add(&mut self, writer: W, token: Token, offset: u64) {
        self.replicas.push(Replica {
            writer,
            token,
            offset,
            registered_at: Instant::now(),
        });
    }

    /// Idempotent: removing an unknown token is a no-op.
    pub fn remove(&mut self, token: Token) -> Option<Replica<W>> {
        let at = self.replicas.iter().position(|r| r.token == token)?;
        let replica = self.replicas.remove(at);
        debug!(
            ?token,
            attached_secs = replica.registered_at.elapsed().as_secs(),
            "replica detached"
        );
        Some(replica)
    }

    pub fn writer_mut(&mut self, token: Token) -> Option<&mut W> {
        self.replicas
            .iter_mut()
            .find(|r| r.token == token)
            .map(|r| &mut r.writer)
    }

    /// Acknowledged offsets only move forward for the lifetime of the
    /// connection.
    pub fn update_offset(&mut self, token: Token, offset: u64) {
        if let Some(replica) = self.replicas.iter_mut().find(|r| r.token == token) {
            replica.offset = replica.offset.max(offset);
        }
    }

    pub fn count_at_least(&self, offset: u64) -> usize {
        self.replicas.iter().filter(|r| r.offset >= offset).count()
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Write `bytes` to every replica. A failed writer is logged and
    /// dropped from the registry; the broadcast itself never fails.
    pub fn broadcast(&mut self, bytes: &[u8]) {
        let mut dead = Vec::new();
        for replica in &mut self.replicas {
            let outcome = replica
                .writer
                .write_all(bytes)
                .and_then(|_| replica.writer.flush());
            if let Err(e) = outcome {
                warn!(token = ?replica.token, error = %e, "dropping replica after failed broadcast");
                dead.push(replica.token);
            }
        }
        for token in dead {
            self.remove(token);
        }
    }
}

impl<W: Write> Default for ReplicaRegistry<W> {
    fn default() -> Self {
        Self::new()
    }
}
