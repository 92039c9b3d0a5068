use std::io::Write;
use std::time::{Duration, SystemTime};

use mio::Token;

use crate::resp::Value;
use crate::server::{Reply, ServerState};
use crate::stream::Fields;
use crate::{Error, Result};

/// A decoded client command. Verbs are case-insensitive; arguments are
/// validated at parse time so handlers only see well-formed requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    Echo(String),
    Set {
        key: String,
        value: String,
        expiry: Option<Duration>,
    },
    Get(String),
    Del(Vec<String>),
    Keys(String),
    Type(String),
    ConfigGet(String),
    InfoReplication,
    Xadd {
        key: String,
        id: String,
        fields: Fields,
    },
    Xrange {
        key: String,
        start: String,
        end: String,
    },
    ReplConfListeningPort(u16),
    ReplConfCapa(String),
    ReplConfGetAck,
    ReplConfAck(u64),
    /// Unrecognized REPLCONF subcommands are acknowledged with +OK.
    ReplConfOther,
    Psync {
        requested_id: String,
        requested_offset: String,
    },
    Wait {
        required: usize,
        timeout_ms: u64,
    },
}

impl TryFrom<&Value> for Command {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self> {
        let words = words(value)?;
        let (verb, args) = words
            .split_first()
            .ok_or_else(|| Error::Protocol("empty command array".to_string()))?;

        match verb.to_lowercase().as_str() {
            "ping" => match args {
                [] => Ok(Self::Ping),
                _ => Err(arity("ping")),
            },
            "echo" => match args {
                [msg] => Ok(Self::Echo(msg.to_string())),
                _ => Err(arity("echo")),
            },
            "set" => parse_set(args),
            "get" => match args {
                [key] => Ok(Self::Get(key.to_string())),
                _ => Err(arity("get")),
            },
            "del" => match args {
                [] => Err(arity("del")),
                keys => Ok(Self::Del(keys.iter().map(|k| k.to_string()).collect())),
            },
            "keys" => match args {
                [pattern] => Ok(Self::Keys(pattern.to_string())),
                _ => Err(arity("keys")),
            },
            "type" => match args {
                [key] => Ok(Self::Type(key.to_string())),
                _ => Err(arity("type")),
            },
            "config" => parse_config(args),
            "info" => parse_info(args),
            "xadd" => parse_xadd(args),
            "xrange" => match args {
                [key, start, end] => Ok(Self::Xrange {
                    key: key.to_string(),
                    start: start.to_string(),
                    end: end.to_string(),
                }),
                _ => Err(arity("xrange")),
            },
            "replconf" => parse_replconf(args),
            "psync" => match args {
                [requested_id, requested_offset] => Ok(Self::Psync {
                    requested_id: requested_id.to_string(),
                    requested_offset: requested_offset.to_string(),
                }),
                _ => Err(arity("psync")),
            },
            "wait" => match args {
                [required, timeout] => Ok(Self::Wait {
                    required: required.parse().map_err(|_| not_an_integer())?,
                    timeout_ms: timeout.parse().map_err(|_| not_an_integer())?,
                }),
                _ => Err(arity("wait")),
            },
            _ => Err(Error::UnknownCommand),
        }
    }
}

impl Command {
    /// Whether a primary forwards this command to its replicas. The raw
    /// wire bytes are forwarded, not a re-encoding.
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Set { .. })
    }

    pub fn execute<W: Write>(&self, state: &mut ServerState<W>, token: Token) -> Result<Reply> {
        match self {
            Self::Ping => Ok(Reply::simple("PONG")),
            Self::Echo(msg) => Ok(Reply::Value(Value::BulkString(msg.clone()))),
            Self::Set { key, value, expiry } => {
                let expires_at = expiry.map(|d| SystemTime::now() + d);
                state.store.set(key, value.clone(), expires_at);
                Ok(Reply::simple("OK"))
            }
            Self::Get(key) => Ok(Reply::Value(match state.store.get(key) {
                Some(value) => Value::BulkString(value),
                None => Value::NullBulkString,
            })),
            Self::Del(keys) => {
                let removed = keys.iter().filter(|k| state.store.del(k)).count();
                Ok(Reply::Value(Value::Integer(removed as i64)))
            }
            Self::Keys(pattern) => {
                let keys = state.store.keys(pattern);
                Ok(Reply::Value(Value::command(&keys)))
            }
            Self::Type(key) => Ok(Reply::Value(Value::SimpleString(
                state.store.entry_type(key).to_string(),
            ))),
            Self::ConfigGet(name) => {
                let value = match state.config.get(name) {
                    Some(v) => Value::BulkString(v),
                    None => Value::NullBulkString,
                };
                Ok(Reply::Value(Value::Array(vec![
                    Value::BulkString(name.clone()),
                    value,
                ])))
            }
            Self::InfoReplication => Ok(Reply::Value(Value::BulkString(state.replication_info()))),
            Self::Xadd { key, id, fields } => {
                let id = state.store.xadd(key, id, fields.clone())?;
                Ok(Reply::Value(Value::BulkString(id.to_string())))
            }
            Self::Xrange { key, start, end } => {
                let entries = state.store.xrange(key, start, end)?;
                let items = entries
                    .into_iter()
                    .map(|(id, fields)| {
                        let mut flat = Vec::with_capacity(fields.len() * 2);
                        for (field, value) in fields {
                            flat.push(Value::BulkString(field));
                            flat.push(Value::BulkString(value));
                        }
                        Value::Array(vec![
                            Value::BulkString(id.to_string()),
                            Value::Array(flat),
                        ])
                    })
                    .collect();
                Ok(Reply::Value(Value::Array(items)))
            }
            Self::ReplConfListeningPort(_) | Self::ReplConfCapa(_) | Self::ReplConfOther => {
                Ok(Reply::simple("OK"))
            }
            Self::ReplConfGetAck => {
                let processed = state.bytes_processed().to_string();
                Ok(Reply::Value(Value::command(&[
                    "REPLCONF",
                    "ACK",
                    processed.as_str(),
                ])))
            }
            Self::ReplConfAck(offset) => {
                state.ack(token, *offset);
                Ok(Reply::None)
            }
            Self::Psync {
                requested_id,
                requested_offset,
            } => {
                if requested_id != "?" || requested_offset != "-1" {
                    return Err(Error::Argument(
                        "PSYNC supports only a full resynchronization (? -1)".to_string(),
                    ));
                }
                state.fullresync_reply().map(Reply::Raw)
            }
            Self::Wait {
                required,
                timeout_ms,
            } => state.start_wait(token, *required, *timeout_ms),
        }
    }
}

fn words(value: &Value) -> Result<Vec<&str>> {
    match value {
        Value::Array(items) => items.iter().map(Value::inner_str).collect(),
        other => Err(Error::Protocol(format!(
            "expected a command array, got {:?}",
            other
        ))),
    }
}

fn parse_set(args: &[&str]) -> Result<Command> {
    let (&key, rest) = args.split_first().ok_or_else(|| arity("set"))?;
    let (&value, mut options) = rest.split_first().ok_or_else(|| arity("set"))?;

    let mut expiry = None;
    while let Some((&option, rest)) = options.split_first() {
        let (&amount, rest) = rest.split_first().ok_or_else(|| syntax_error())?;
        let amount: u64 = amount.parse().map_err(|_| not_an_integer())?;
        expiry = match option.to_lowercase().as_str() {
            "px" => Some(Duration::from_millis(amount)),
            "ex" => Some(Duration::from_secs(amount)),
            _ => return Err(syntax_error()),
        };
        options = rest;
    }

    Ok(Command::Set {
        key: key.to_string(),
        value: value.to_string(),
        expiry,
    })
}

fn parse_config(args: &[&str]) -> Result<Command> {
    match args {
        [] => Err(Error::Argument(
            "CONFIG expects a subcommand".to_string(),
        )),
        [sub, name] if sub.eq_ignore_ascii_case("get") => Ok(Command::ConfigGet(name.to_string())),
        [sub, ..] => Err(Error::Argument(format!(
            "Invalid config subcommand: {}",
            sub.to_lowercase()
        ))),
    }
}

fn parse_info(args: &[&str]) -> Result<Command> {
    match args {
        [] => Err(Error::Argument(
            "Currently, INFO command expects subcommand".to_string(),
        )),
        [sub] if sub.eq_ignore_ascii_case("replication") => Ok(Command::InfoReplication),
        [sub, ..] => Err(Error::Argument(format!(
            "Invalid info subcommand: {}",
            sub.to_lowercase()
        ))),
    }
}

fn parse_xadd(args: &[&str]) -> Result<Command> {
    if args.len() < 4 || args.len() % 2 != 0 {
        return Err(arity("xadd"));
    }
    let fields = args[2..]
        .chunks_exact(2)
        .map(|pair| (pair[0].to_string(), pair[1].to_string()))
        .collect();
    Ok(Command::Xadd {
        key: args[0].to_string(),
        id: args[1].to_string(),
        fields,
    })
}

fn parse_replconf(args: &[&str]) -> Result<Command> {
    let (&sub, rest) = args
        .split_first()
        .ok_or_else(|| Error::Argument("REPLCONF expects a subcommand".to_string()))?;
    match sub.to_lowercase().as_str() {
        "listening-port" => match rest {
            [port] => Ok(Command::ReplConfListeningPort(
                port.parse().map_err(|_| not_an_integer())?,
            )),
            _ => Err(arity("replconf")),
        },
        "capa" => match rest {
            [capa] => Ok(Command::ReplConfCapa(capa.to_string())),
            _ => Err(arity("replconf")),
        },
        "getack" => Ok(Command::ReplConfGetAck),
        "ack" => match rest {
            [offset] => Ok(Command::ReplConfAck(
                offset.parse().map_err(|_| not_an_integer())?,
            )),
            _ => Err(arity("replconf")),
        },
        _ => Ok(Command::ReplConfOther),
    }
}

fn arity(verb: &str) -> Error {
    Error::Argument(format!("wrong number of arguments for '{}' command", verb))
}

fn syntax_error() -> Error {
    Error::Argument("syntax error".to_string())
}

fn not_an_integer() -> Error {
    Error::Argument("value is not an integer or out of range".to_string())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::resp;

    fn parse(wire: &str) -> Result<Command> {
        let (value, _) = resp::decode(wire)?;
        Command::try_from(&value)
    }

    fn command_of(parts: &[&str]) -> Result<Command> {
        Command::try_from(&Value::command(parts))
    }

    #[rstest]
    #[case(&["PING"], Command::Ping)]
    #[case(&["ping"], Command::Ping)]
    #[case(&["EcHo", "hi"], Command::Echo("hi".to_string()))]
    #[case(&["GET", "k"], Command::Get("k".to_string()))]
    #[case(&["TYPE", "k"], Command::Type("k".to_string()))]
    #[case(&["KEYS", "*"], Command::Keys("*".to_string()))]
    #[case(&["WAIT", "1", "500"], Command::Wait { required: 1, timeout_ms: 500 })]
    fn parses_simple_verbs(#[case] parts: &[&str], #[case] expected: Command) -> Result<()> {
        assert_eq!(command_of(parts)?, expected);
        Ok(())
    }

    #[test]
    fn parses_set_with_expiry_options() -> Result<()> {
        assert_eq!(
            command_of(&["SET", "k", "v"])?,
            Command::Set {
                key: "k".to_string(),
                value: "v".to_string(),
                expiry: None
            }
        );
        assert_eq!(
            command_of(&["SET", "k", "v", "px", "100"])?,
            Command::Set {
                key: "k".to_string(),
                value: "v".to_string(),
                expiry: Some(Duration::from_millis(100))
            }
        );
        assert_eq!(
            command_of(&["SET", "k", "v", "EX", "2"])?,
            Command::Set {
                key: "k".to_string(),
                value: "v".to_string(),
                expiry: Some(Duration::from_secs(2))
            }
        );
        assert!(command_of(&["SET", "k", "v", "nx"]).is_err());
        assert!(command_of(&["SET", "k"]).is_err());
        Ok(())
    }

    #[test]
    fn parses_replconf_subcommands() -> Result<()> {
        assert_eq!(
            command_of(&["REPLCONF", "listening-port", "6380"])?,
            Command::ReplConfListeningPort(6380)
        );
        assert_eq!(
            command_of(&["REPLCONF", "capa", "psync2"])?,
            Command::ReplConfCapa("psync2".to_string())
        );
        assert_eq!(command_of(&["REPLCONF", "GETACK", "*"])?, Command::ReplConfGetAck);
        assert_eq!(command_of(&["REPLCONF", "ACK", "31"])?, Command::ReplConfAck(31));
        assert_eq!(command_of(&["REPLCONF", "whatever"])?, Command::ReplConfOther);
        Ok(())
    }

    #[test]
    fn parses_xadd_field_pairs_in_order() -> Result<()> {
        let cmd = command_of(&["XADD", "s", "1-1", "b", "2", "a", "1"])?;
        match cmd {
            Command::Xadd { key, id, fields } => {
                assert_eq!(key, "s");
                assert_eq!(id, "1-1");
                assert_eq!(
                    fields,
                    vec![
                        ("b".to_string(), "2".to_string()),
                        ("a".to_string(), "1".to_string())
                    ]
                );
            }
            other => panic!("expected XADD, got {:?}", other),
        }
        assert!(command_of(&["XADD", "s", "1-1", "dangling"]).is_err());
        assert!(command_of(&["XADD", "s", "1-1"]).is_err());
        Ok(())
    }

    #[test]
    fn unknown_verbs_are_rejected() {
        assert!(matches!(
            command_of(&["SUBSCRIBE", "chan"]),
            Err(Error::UnknownCommand)
        ));
    }

    #[test]
    fn parses_from_wire_framing() -> Result<()> {
        let cmd = parse("*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n")?;
        assert!(cmd.is_write());
        let cmd = parse("*1\r\n$4\r\nPING\r\n")?;
        assert!(!cmd.is_write());
        Ok(())
    }

    #[test]
    fn psync_requires_full_resync_arguments() -> Result<()> {
        assert_eq!(
            parse("*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n")?,
            Command::Psync {
                requested_id: "?".to_string(),
                requested_offset: "-1".to_string()
            }
        );
        Ok(())
    }
}
