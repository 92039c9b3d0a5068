use std::path::PathBuf;

use crate::{Error, Result};

/// Process configuration, read-only after startup. The bootstrap fills it
/// from the CLI; the core consults it through `CONFIG GET` and the RDB
/// preload path.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub dir: String,
    pub dbfilename: String,
    pub replicaof: Option<(String, u16)>,
}

impl Config {
    pub fn new(
        port: u16,
        dir: String,
        dbfilename: String,
        replicaof: Option<String>,
    ) -> Result<Self> {
        let replicaof = match replicaof {
            None => None,
            Some(s) => Some(parse_primary_endpoint(&s)?),
        };
        Ok(Self {
            port,
            dir,
            dbfilename,
            replicaof,
        })
    }

    pub fn is_secondary(&self) -> bool {
        self.replicaof.is_some()
    }

    /// Parameter lookup for `CONFIG GET`.
    pub fn get(&self, name: &str) -> Option<String> {
        match name {
            "dir" => Some(self.dir.clone()),
            "dbfilename" => Some(self.dbfilename.clone()),
            "port" => Some(self.port.to_string()),
            "replicaof" => self
                .replicaof
                .as_ref()
                .map(|(host, port)| format!("{} {}", host, port)),
            _ => None,
        }
    }

    pub fn rdb_path(&self) -> PathBuf {
        PathBuf::from(&self.dir).join(&self.dbfilename)
    }
}

/// `--replicaof` comes as a single "<host> <port>" argument.
fn parse_primary_endpoint(s: &str) -> Result<(String, u16)> {
    let mut parts = s.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(host), Some(port), None) => Ok((host.to_string(), port.parse()?)),
        _ => Err(Error::Argument(format!(
            "replicaof expects \"<host> <port>\", got {:?}",
            s
        ))),
    }
}
