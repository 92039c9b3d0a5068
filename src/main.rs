mod command;
mod config;
mod connection;
mod error;
mod rdb;
mod replica;
mod resp;
mod server;
mod store;
mod stream;
mod sync;
mod token;

pub use crate::error::{Error, Result};

use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::{handle_client_event, handle_replica_event};
use crate::rdb::Rdb;
use crate::resp::Value;
use crate::server::ServerState;
use crate::store::Store;
use crate::sync::UpstreamLink;
use crate::token::{is_replica_token, TokenAllocator, LISTENER, UPSTREAM};

#[derive(Parser)]
#[command(version, about = "Redis-compatible in-memory key/value server", long_about = None)]
struct Cli {
    #[arg(long, default_value_t = 6379)]
    port: u16,
    /// Run as a secondary of "<host> <port>".
    #[arg(long)]
    replicaof: Option<String>,
    #[arg(long, default_value_t = String::from("/tmp/shoal-files"))]
    dir: String,
    #[arg(long, default_value_t = String::from("dump.rdb"))]
    dbfilename: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let args = Cli::parse();
    let config = Config::new(args.port, args.dir, args.dbfilename, args.replicaof)?;

    let mut store = Store::new();
    preload(&config, &mut store);

    let mut state = if config.is_secondary() {
        ServerState::secondary(config.clone(), store)
    } else {
        ServerState::primary(config.clone(), store)
    };

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(128);

    let addr: std::net::SocketAddr = format!("127.0.0.1:{}", config.port).parse()?;
    let mut listener = TcpListener::bind(addr)
        .with_context(|| format!("could not bind 127.0.0.1:{}", config.port))?;
    poll.registry()
        .register(&mut listener, LISTENER, Interest::READABLE)?;
    info!(
        port = config.port,
        role = if state.is_primary() { "primary" } else { "secondary" },
        "listening"
    );

    // On a secondary, open the persistent link to the primary; the PING
    // that starts the handshake goes out on the first writable event.
    let mut upstream = if config.is_secondary() {
        let mut link = UpstreamLink::connect(&config)?;
        poll.registry().register(
            link.stream_mut(),
            UPSTREAM,
            Interest::READABLE.add(Interest::WRITABLE),
        )?;
        Some(link)
    } else {
        None
    };

    let mut connections: HashMap<Token, TcpStream> = HashMap::new();
    let mut tokens = TokenAllocator::new();

    loop {
        // Short timeout so parked WAITs make progress without traffic.
        poll.poll(&mut events, Some(Duration::from_millis(100)))?;

        for event in events.iter() {
            match event.token() {
                LISTENER => loop {
                    let (mut connection, address) = match listener.accept() {
                        Ok(pair) => pair,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e.into()),
                    };
                    let token = tokens.next_client_token();
                    poll.registry()
                        .register(&mut connection, token, Interest::READABLE)?;
                    debug!(%address, ?token, "accepted connection");
                    connections.insert(token, connection);
                },
                UPSTREAM => {
                    let Some(link) = upstream.as_mut() else {
                        continue;
                    };
                    let mut result = Ok(());
                    if event.is_writable() {
                        result = link.on_writable();
                    }
                    if result.is_ok() && event.is_readable() {
                        result = link.on_readable(&mut state);
                    }
                    if let Err(e) = result {
                        error!(error = %e, phase = ?link.phase(), "primary link failed");
                        poll.registry().deregister(link.stream_mut())?;
                        upstream = None;
                    }
                }
                token if is_replica_token(token) => handle_replica_event(token, &mut state),
                token => {
                    let Some(conn) = connections.get_mut(&token) else {
                        continue;
                    };
                    let (closed, promote) = handle_client_event(conn, token, &mut state)
                        .unwrap_or_else(|e| {
                            warn!(?token, error = %e, "closing connection");
                            (true, false)
                        });
                    if promote {
                        // The connection just completed PSYNC: re-register
                        // it under a replica token so its ACKs are routed
                        // to the registry.
                        if let Some(mut connection) = connections.remove(&token) {
                            poll.registry().deregister(&mut connection)?;
                            let replica_token = tokens.next_replica_token();
                            poll.registry().register(
                                &mut connection,
                                replica_token,
                                Interest::READABLE,
                            )?;
                            state.register_replica(connection, replica_token);
                        }
                    } else if closed {
                        if let Some(mut connection) = connections.remove(&token) {
                            poll.registry().deregister(&mut connection)?;
                        }
                        state.remove_replica(token);
                    }
                }
            }
        }

        // Finish a parked WAIT once enough replicas acknowledged or its
        // deadline passed.
        if let Some((token, count)) = state.poll_wait() {
            if let Some(connection) = connections.get_mut(&token) {
                let reply = Value::Integer(count).to_string();
                let delivery = connection
                    .write_all(reply.as_bytes())
                    .and_then(|_| connection.flush());
                if let Err(e) = delivery {
                    warn!(?token, error = %e, "could not deliver WAIT reply");
                }
            }
        }
    }
}

/// Warm-start from the configured RDB file. A missing file starts empty; a
/// malformed one is logged and ignored.
fn preload(config: &Config, store: &mut Store) {
    let path = config.rdb_path();
    match Rdb::load(&path) {
        Ok(Some(rdb)) => {
            let entries = rdb.database(0);
            info!(path = %path.display(), keys = entries.len(), "seeded keyspace from RDB file");
            for entry in entries {
                store.set(&entry.key, entry.value.clone(), entry.expires_at);
            }
        }
        Ok(None) => {}
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read RDB file, starting empty");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("shoaldb-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn config_for(dir: &std::path::Path) -> Config {
        Config::new(
            6379,
            dir.to_string_lossy().into_owned(),
            "d.rdb".to_string(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn preload_seeds_database_zero() {
        let dir = scratch_dir("preload");
        let mut bytes = b"REDIS0011".to_vec();
        bytes.extend([0xFE, 0x00, 0xFB, 0x01, 0x00]);
        bytes.push(0x00);
        bytes.extend([1, b'x']);
        bytes.extend([1, b'y']);
        bytes.push(0xFF);
        bytes.extend([0u8; 8]);
        std::fs::write(dir.join("d.rdb"), &bytes).unwrap();

        let mut store = Store::new();
        preload(&config_for(&dir), &mut store);
        assert_eq!(store.get("x").as_deref(), Some("y"));
    }

    #[test]
    fn preload_tolerates_missing_and_malformed_files() {
        let dir = scratch_dir("absent");
        let mut store = Store::new();
        preload(&config_for(&dir), &mut store);
        assert!(store.is_empty());

        let dir = scratch_dir("mangled");
        std::fs::write(dir.join("d.rdb"), b"NOTREDIS").unwrap();
        let mut store = Store::new();
        preload(&config_for(&dir), &mut store);
        assert!(store.is_empty());
    }
}
