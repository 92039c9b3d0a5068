use std::collections::BTreeMap;
use std::fmt::Display;
use std::ops::Bound;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::StreamIdError;
use crate::{Error, Result};

/// A stream entry ID: millisecond timestamp plus sequence number, ordered
/// lexicographically on the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    /// The reserved ID; it can never be inserted and doubles as the
    /// synthetic top of an empty stream.
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };
}

impl Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl TryFrom<&str> for StreamId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        let (ms, seq) = value.split_once('-').ok_or_else(invalid_id)?;
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid_id())?,
            seq: seq.parse().map_err(|_| invalid_id())?,
        })
    }
}

/// An ID as supplied to XADD: fully explicit, timestamp-only with a `*`
/// sequence, or fully auto-generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestId {
    Auto,
    AutoSeq(u64),
    Explicit(StreamId),
}

impl std::str::FromStr for IngestId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "*" {
            return Ok(Self::Auto);
        }
        match s.split_once('-') {
            Some((ms, "*")) => Ok(Self::AutoSeq(ms.parse().map_err(|_| invalid_id())?)),
            _ => Ok(Self::Explicit(StreamId::try_from(s)?)),
        }
    }
}

impl IngestId {
    /// Whether this ID may be appended on top of `top`. Auto IDs always
    /// pass; a `<ts>-*` passes when its timestamp is not behind the top;
    /// explicit IDs must be strictly greater.
    pub fn validates_against(&self, top: StreamId) -> bool {
        match *self {
            Self::Auto => true,
            Self::AutoSeq(ms) => ms >= top.ms,
            Self::Explicit(id) => id > top,
        }
    }

    /// Resolve to a concrete ID given the current top of the stream.
    pub fn concretize(&self, top: StreamId) -> StreamId {
        match *self {
            Self::Auto => StreamId {
                ms: now_ms(),
                seq: 0,
            },
            Self::AutoSeq(ms) if ms == top.ms => StreamId {
                ms,
                seq: top.seq + 1,
            },
            Self::AutoSeq(ms) => StreamId { ms, seq: 0 },
            Self::Explicit(id) => id,
        }
    }
}

/// Field/value pairs of one entry, in insertion order.
pub type Fields = Vec<(String, String)>;

/// An append-only stream: an ordered map from entry ID to fields. Insertion
/// order equals ID order, enforced at append time.
#[derive(Debug, Clone, Default)]
pub struct Stream {
    entries: BTreeMap<StreamId, Fields>,
}

impl Stream {
    pub fn new() -> Self {
        Self::default()
    }

    /// The highest inserted ID, or `0-0` for an empty stream.
    pub fn top_id(&self) -> StreamId {
        self.entries
            .keys()
            .next_back()
            .copied()
            .unwrap_or(StreamId::ZERO)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry. Fails without mutating when the ID does not sort
    /// strictly above the current top (or is `0-0`).
    pub fn add(&mut self, id_spec: &str, fields: Fields) -> Result<StreamId> {
        let incoming: IngestId = id_spec.parse()?;

        if !incoming.validates_against(StreamId::ZERO) {
            return Err(StreamIdError::LessOrEqualToZero.into());
        }
        let top = self.top_id();
        if !self.entries.is_empty() && !incoming.validates_against(top) {
            return Err(StreamIdError::TooSmallForTop.into());
        }

        let id = incoming.concretize(top);
        self.entries.insert(id, fields);
        Ok(id)
    }

    /// Entries whose ID falls inside `[start, end]`, honoring `-`/`+`,
    /// partial bounds, and `(`-prefixed exclusive bounds.
    pub fn range(&self, start: &str, end: &str) -> Result<Vec<(StreamId, &Fields)>> {
        let start = parse_bound(start, Edge::Start)?;
        let end = parse_bound(end, Edge::End)?;
        if bounds_are_empty(&start, &end) {
            return Ok(Vec::new());
        }
        Ok(self
            .entries
            .range((start, end))
            .map(|(id, fields)| (*id, fields))
            .collect())
    }
}

#[derive(Clone, Copy)]
enum Edge {
    Start,
    End,
}

/// BTreeMap::range panics on inverted bounds; an inverted query is just an
/// empty result.
fn bounds_are_empty(start: &Bound<StreamId>, end: &Bound<StreamId>) -> bool {
    let (lo, lo_excluded) = match start {
        Bound::Included(id) => (id, false),
        Bound::Excluded(id) => (id, true),
        Bound::Unbounded => return false,
    };
    let (hi, hi_excluded) = match end {
        Bound::Included(id) => (id, false),
        Bound::Excluded(id) => (id, true),
        Bound::Unbounded => return false,
    };
    lo > hi || (lo == hi && (lo_excluded || hi_excluded))
}

/// One end of an XRANGE query. `-` and `+` are open; a bare timestamp
/// means sequence 0 at the start and +infinity at the end; a `(` prefix
/// makes the bound exclusive. A `*` sequence compares as +infinity.
fn parse_bound(spec: &str, edge: Edge) -> Result<Bound<StreamId>> {
    match (spec, edge) {
        ("-", Edge::Start) | ("+", Edge::End) => Ok(Bound::Unbounded),
        _ => {
            let (exclusive, spec) = match spec.strip_prefix('(') {
                Some(rest) => (true, rest),
                None => (false, spec),
            };
            let id = parse_bound_id(spec, edge)?;
            Ok(if exclusive {
                Bound::Excluded(id)
            } else {
                Bound::Included(id)
            })
        }
    }
}

fn parse_bound_id(spec: &str, edge: Edge) -> Result<StreamId> {
    match spec.split_once('-') {
        None => {
            let ms = spec.parse().map_err(|_| invalid_id())?;
            Ok(match edge {
                Edge::Start => StreamId { ms, seq: 0 },
                Edge::End => StreamId { ms, seq: u64::MAX },
            })
        }
        Some((ms, "*")) => Ok(StreamId {
            ms: ms.parse().map_err(|_| invalid_id())?,
            seq: u64::MAX,
        }),
        _ => StreamId::try_from(spec),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn invalid_id() -> Error {
    Error::Argument("Invalid stream ID specified as stream command argument".to_string())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::error::StreamIdError;

    fn fields() -> Fields {
        vec![("temperature".to_string(), "42".to_string())]
    }

    fn seeded(ids: &[(u64, u64)]) -> Stream {
        let mut stream = Stream::new();
        for (ms, seq) in ids {
            stream
                .add(&format!("{}-{}", ms, seq), fields())
                .expect("seed id should be valid");
        }
        stream
    }

    #[rstest]
    #[case("*", (5, 3), true)]
    #[case("6-0", (5, 3), true)]
    #[case("5-4", (5, 3), true)]
    #[case("5-*", (5, 3), true)]
    #[case("5-3", (5, 3), false)]
    #[case("5-2", (5, 3), false)]
    #[case("4-9", (5, 3), false)]
    #[case("4-*", (5, 3), false)]
    fn validates_incoming_ids(
        #[case] incoming: &str,
        #[case] top: (u64, u64),
        #[case] expected: bool,
    ) -> Result<()> {
        let incoming: IngestId = incoming.parse()?;
        let top = StreamId {
            ms: top.0,
            seq: top.1,
        };
        assert_eq!(incoming.validates_against(top), expected);
        Ok(())
    }

    #[test]
    fn explicit_ids_are_used_verbatim() -> Result<()> {
        let mut stream = Stream::new();
        let id = stream.add("1-5", fields())?;
        assert_eq!(id.to_string(), "1-5");
        Ok(())
    }

    #[test]
    fn rejects_zero_id() {
        let mut stream = Stream::new();
        match stream.add("0-0", fields()) {
            Err(Error::StreamId(kind)) => assert_eq!(kind, StreamIdError::LessOrEqualToZero),
            other => panic!("expected stream-id error, got {:?}", other),
        }
        assert!(stream.is_empty());
    }

    #[test]
    fn rejects_id_at_or_below_top_without_mutating() {
        let mut stream = seeded(&[(1, 5)]);
        match stream.add("1-3", fields()) {
            Err(Error::StreamId(kind)) => assert_eq!(kind, StreamIdError::TooSmallForTop),
            other => panic!("expected stream-id error, got {:?}", other),
        }
        assert_eq!(stream.len(), 1);
        assert_eq!(stream.top_id().to_string(), "1-5");
    }

    #[test]
    fn auto_sequence_continues_same_timestamp() -> Result<()> {
        let mut stream = seeded(&[(5, 3)]);
        let id = stream.add("5-*", fields())?;
        assert_eq!(id.to_string(), "5-4");
        Ok(())
    }

    #[test]
    fn auto_sequence_starts_at_zero_for_new_timestamp() -> Result<()> {
        let mut stream = Stream::new();
        let id = stream.add("5-*", fields())?;
        assert_eq!(id.to_string(), "5-0");
        Ok(())
    }

    #[test]
    fn auto_sequence_on_empty_stream_at_zero_yields_one() -> Result<()> {
        // The synthetic top of an empty stream is 0-0, so 0-* continues it.
        let mut stream = Stream::new();
        let id = stream.add("0-*", fields())?;
        assert_eq!(id.to_string(), "0-1");
        Ok(())
    }

    #[test]
    fn fully_auto_ids_are_strictly_increasing() -> Result<()> {
        let mut stream = Stream::new();
        let first = stream.add("*", fields())?;
        let second = stream.add(&format!("{}-*", first.ms), fields())?;
        assert!(second > first);
        assert!(second.ms >= first.ms);
        Ok(())
    }

    #[rstest]
    #[case("5-3", "5-6", &["5-3", "5-5", "5-6"])]
    #[case("(5-3", "5-6", &["5-5", "5-6"])]
    #[case("5-3", "(5-6", &["5-3", "5-5"])]
    #[case("-", "5-5", &["5-2", "5-3", "5-5"])]
    #[case("5-6", "+", &["5-6", "5-7"])]
    #[case("-", "+", &["5-2", "5-3", "5-5", "5-6", "5-7"])]
    #[case("6-0", "9-0", &[])]
    #[case("9-0", "6-0", &[])]
    #[case("(5-3", "(5-3", &[])]
    #[case("5-5", "5-5", &["5-5"])]
    fn range_honors_bounds(
        #[case] start: &str,
        #[case] end: &str,
        #[case] expected: &[&str],
    ) -> Result<()> {
        let stream = seeded(&[(5, 2), (5, 3), (5, 5), (5, 6), (5, 7)]);
        let ids: Vec<String> = stream
            .range(start, end)?
            .iter()
            .map(|(id, _)| id.to_string())
            .collect();
        assert_eq!(ids, expected);
        Ok(())
    }

    #[test]
    fn partial_bounds_cover_whole_timestamps() -> Result<()> {
        let stream = seeded(&[(5, 1), (5, 9), (6, 0), (7, 2)]);
        let ids: Vec<String> = stream
            .range("5", "6")?
            .iter()
            .map(|(id, _)| id.to_string())
            .collect();
        assert_eq!(ids, vec!["5-1", "5-9", "6-0"]);
        Ok(())
    }

    #[test]
    fn field_order_is_preserved() -> Result<()> {
        let mut stream = Stream::new();
        let entry = vec![
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
            ("c".to_string(), "3".to_string()),
        ];
        stream.add("1-1", entry.clone())?;
        let got = stream.range("-", "+")?;
        assert_eq!(got[0].1, &entry);
        Ok(())
    }

    #[test]
    fn missing_ids_are_rejected_as_arguments() {
        let mut stream = Stream::new();
        assert!(matches!(
            stream.add("not-an-id", fields()),
            Err(Error::Argument(_))
        ));
    }
}
