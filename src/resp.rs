use nom::{
    bytes::complete::{tag, take, take_until},
    character::complete::{self, anychar},
    sequence::terminated,
    Finish, IResult,
};

use crate::{Error, Result};

/// A decoded RESP value. `Display` renders the wire form, so encoding is
/// `value.to_string()`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    SimpleString(String),
    /// `-<msg>\r\n`. The dispatcher prefixes the error code.
    Error(String),
    Integer(i64),
    BulkString(String),
    /// The null bulk, `$-1\r\n`.
    NullBulkString,
    Array(Vec<Value>),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SimpleString(x) => write!(f, "+{}\r\n", x),
            Self::Error(x) => write!(f, "-{}\r\n", x),
            Self::Integer(x) => write!(f, ":{}\r\n", x),
            Self::BulkString(x) => write!(f, "${}\r\n{}\r\n", x.len(), x),
            Self::NullBulkString => write!(f, "$-1\r\n"),
            Self::Array(items) => {
                write!(f, "*{}\r\n", items.len())?;
                for item in items {
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
        }
    }
}

impl Value {
    /// An array of bulk strings, the framing every client command uses.
    pub fn command<S: AsRef<str>>(parts: &[S]) -> Self {
        Self::Array(
            parts
                .iter()
                .map(|p| Self::BulkString(p.as_ref().to_string()))
                .collect(),
        )
    }

    /// The textual payload of a simple or bulk string.
    pub fn inner_str(&self) -> Result<&str> {
        match self {
            Self::SimpleString(x) | Self::BulkString(x) => Ok(x),
            other => Err(Error::Protocol(format!(
                "expected a string value, got {:?}",
                other
            ))),
        }
    }
}

/// Decode a single value, returning it with the exact number of bytes it
/// occupied on the wire.
pub fn decode(input: &str) -> Result<(Value, usize)> {
    let (rest, value) = parse_value(input)
        .finish()
        .map_err(|e| Error::Protocol(e.to_string()))?;
    Ok((value, input.len() - rest.len()))
}

/// Decode as many complete values as the buffer holds. Returns the values
/// with per-value byte counts and the total number of bytes consumed; a
/// trailing incomplete or malformed suffix is simply not consumed, the
/// caller decides whether that is an error or bytes still in flight.
pub fn decode_stream(input: &str) -> (Vec<(Value, usize)>, usize) {
    let mut values = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        match parse_value(rest) {
            Ok((next, value)) => {
                values.push((value, rest.len() - next.len()));
                rest = next;
            }
            Err(_) => break,
        }
    }
    (values, input.len() - rest.len())
}

/// Frame a raw byte blob for the snapshot handoff: `$<len>\r\n<bytes>` with
/// no trailing terminator.
pub fn encode_snapshot(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out
}

/// The `$<len>\r\n` line in front of a snapshot transfer.
pub fn parse_snapshot_header(input: &str) -> IResult<&str, u64> {
    let (input, _) = tag("$")(input)?;
    terminated(complete::u64, parse_crlf)(input)
}

fn parse_value(input: &str) -> IResult<&str, Value> {
    let (input, symbol) = anychar(input)?;
    match symbol {
        '+' => {
            let (input, val) = parse_line(input)?;
            Ok((input, Value::SimpleString(val.to_string())))
        }
        '-' => {
            let (input, val) = parse_line(input)?;
            Ok((input, Value::Error(val.to_string())))
        }
        ':' => {
            let (input, val) = parse_int(input)?;
            Ok((input, Value::Integer(val)))
        }
        '$' => {
            let (input, len) = parse_int(input)?;
            match len {
                -1 => Ok((input, Value::NullBulkString)),
                len if len < 0 => Err(fail(input)),
                len => {
                    let (input, word) = terminated(take(len as usize), parse_crlf)(input)?;
                    Ok((input, Value::BulkString(word.to_string())))
                }
            }
        }
        '*' => {
            let (mut input, count) = parse_int(input)?;
            if count < 0 {
                return Err(fail(input));
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let item;
                (input, item) = parse_value(input)?;
                items.push(item);
            }
            Ok((input, Value::Array(items)))
        }
        _ => Err(fail(input)),
    }
}

fn parse_int(input: &str) -> IResult<&str, i64> {
    terminated(complete::i64, parse_crlf)(input)
}

fn parse_line(input: &str) -> IResult<&str, &str> {
    terminated(take_until("\r\n"), parse_crlf)(input)
}

fn parse_crlf(input: &str) -> IResult<&str, &str> {
    tag("\r\n")(input)
}

fn fail(input: &str) -> nom::Err<nom::error::Error<&str>> {
    nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Fail))
}
