use std::collections::HashMap;
use std::time::SystemTime;

use crate::error::StreamIdError;
use crate::stream::{Fields, IngestId, Stream, StreamId};
use crate::{Error, Result};

/// A keyspace value: a string with optional absolute expiry, or a stream.
#[derive(Debug, Clone)]
pub enum Entry {
    String {
        value: String,
        expires_at: Option<SystemTime>,
    },
    Stream(Stream),
}

impl Entry {
    fn is_expired(&self) -> bool {
        match self {
            Entry::String {
                expires_at: Some(at),
                ..
            } => SystemTime::now() >= *at,
            _ => false,
        }
    }
}

/// The in-memory keyspace. Expiry is lazy: an expired string entry is
/// observed as absent and removed at that moment; nothing scans in the
/// background. Iteration for KEYS follows insertion order.
#[derive(Debug, Default)]
pub struct Store {
    data: HashMap<String, Entry>,
    insertion: Vec<String>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditional overwrite. `expires_at` is an absolute wall-clock
    /// deadline.
    pub fn set(&mut self, key: &str, value: String, expires_at: Option<SystemTime>) {
        if !self.data.contains_key(key) {
            self.insertion.push(key.to_string());
        }
        self.data
            .insert(key.to_string(), Entry::String { value, expires_at });
    }

    pub fn get(&mut self, key: &str) -> Option<String> {
        match self.live_entry(key) {
            Some(Entry::String { value, .. }) => Some(value.clone()),
            _ => None,
        }
    }

    /// Remove `key`, reporting whether a live entry was actually removed.
    pub fn del(&mut self, key: &str) -> bool {
        if self.live_entry(key).is_none() {
            return false;
        }
        self.forget(key);
        true
    }

    pub fn entry_type(&mut self, key: &str) -> &'static str {
        match self.live_entry(key) {
            Some(Entry::String { .. }) => "string",
            Some(Entry::Stream(_)) => "stream",
            None => "none",
        }
    }

    /// Keys matching a shell-style glob, in insertion order.
    pub fn keys(&mut self, pattern: &str) -> Vec<String> {
        let expired: Vec<String> = self
            .insertion
            .iter()
            .filter(|k| self.data.get(*k).is_some_and(Entry::is_expired))
            .cloned()
            .collect();
        for key in expired {
            self.forget(&key);
        }
        self.insertion
            .iter()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect()
    }

    /// Append to the stream at `key`, creating it on first insert. A
    /// rejected ID leaves the keyspace untouched.
    pub fn xadd(&mut self, key: &str, id_spec: &str, fields: Fields) -> Result<StreamId> {
        let incoming: IngestId = id_spec.parse()?;
        if !incoming.validates_against(StreamId::ZERO) {
            return Err(StreamIdError::LessOrEqualToZero.into());
        }

        if !self.data.contains_key(key) {
            self.insertion.push(key.to_string());
            self.data.insert(key.to_string(), Entry::Stream(Stream::new()));
        }
        match self.data.get_mut(key) {
            Some(Entry::Stream(stream)) => stream.add(id_spec, fields),
            _ => Err(wrong_type()),
        }
    }

    pub fn xrange(&self, key: &str, start: &str, end: &str) -> Result<Vec<(StreamId, Fields)>> {
        match self.data.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::Stream(stream)) => Ok(stream
                .range(start, end)?
                .into_iter()
                .map(|(id, fields)| (id, fields.clone()))
                .collect()),
            Some(Entry::String { .. }) => Err(wrong_type()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn live_entry(&mut self, key: &str) -> Option<&Entry> {
        if self.data.get(key).is_some_and(Entry::is_expired) {
            self.forget(key);
        }
        self.data.get(key)
    }

    fn forget(&mut self, key: &str) {
        self.data.remove(key);
        self.insertion.retain(|k| k != key);
    }
}

fn wrong_type() -> Error {
    Error::Argument(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

/// Shell-style glob matching: `*`, `?`, and `[...]` classes with ranges and
/// `!`/`^` negation. An unterminated class matches a literal `[`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        let step = match p.get(pi) {
            Some('*') => {
                backtrack = Some((pi, ti));
                pi += 1;
                continue;
            }
            Some('?') => Some(pi + 1),
            Some('[') => match_class(&p, pi, t[ti]),
            Some(&c) if c == t[ti] => Some(pi + 1),
            _ => None,
        };
        match step {
            Some(next_pi) => {
                pi = next_pi;
                ti += 1;
            }
            None => match backtrack {
                // Stretch the last `*` by one character and retry.
                Some((star_pi, star_ti)) => {
                    backtrack = Some((star_pi, star_ti + 1));
                    pi = star_pi + 1;
                    ti = star_ti + 1;
                }
                None => return false,
            },
        }
    }
    while p.get(pi) == Some(&'*') {
        pi += 1;
    }
    pi == p.len()
}

/// Match `c` against the class opening at `p[open]`. Returns the pattern
/// index past the closing `]` on a match, `None` otherwise (including the
/// literal-`[` fallback for an unterminated class).
fn match_class(p: &[char], open: usize, c: char) -> Option<usize> {
    let mut i = open + 1;
    let negated = matches!(p.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }
    let body_start = i;

    let mut matched = false;
    loop {
        match p.get(i) {
            None => {
                // Unterminated: `[` is an ordinary character.
                return (c == '[').then_some(open + 1);
            }
            // `]` as the first body character is literal.
            Some(']') if i > body_start => break,
            Some(&lo) => {
                if p.get(i + 1) == Some(&'-') && p.get(i + 2).is_some_and(|&hi| hi != ']') {
                    let hi = p[i + 2];
                    if lo <= c && c <= hi {
                        matched = true;
                    }
                    i += 3;
                } else {
                    if c == lo {
                        matched = true;
                    }
                    i += 1;
                }
            }
        }
    }
    (matched != negated).then_some(i + 1)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;

    #[test]
    fn set_then_get() {
        let mut store = Store::new();
        store.set("foo", "bar".to_string(), None);
        assert_eq!(store.get("foo").as_deref(), Some("bar"));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn set_overwrites_unconditionally() {
        let mut store = Store::new();
        store.set("foo", "bar".to_string(), None);
        store.set("foo", "baz".to_string(), None);
        assert_eq!(store.get("foo").as_deref(), Some("baz"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn expired_entries_vanish_on_read() {
        let mut store = Store::new();
        let past = SystemTime::now() - Duration::from_millis(200);
        store.set("gone", "x".to_string(), Some(past));
        store.set("kept", "y".to_string(), None);

        assert_eq!(store.get("gone"), None);
        assert_eq!(store.entry_type("gone"), "none");
        assert_eq!(store.keys("*"), vec!["kept".to_string()]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn future_expiry_is_still_visible() {
        let mut store = Store::new();
        let later = SystemTime::now() + Duration::from_secs(60);
        store.set("foo", "bar".to_string(), Some(later));
        assert_eq!(store.get("foo").as_deref(), Some("bar"));
    }

    #[test]
    fn del_reports_live_entries_only() {
        let mut store = Store::new();
        store.set("foo", "bar".to_string(), None);
        let past = SystemTime::now() - Duration::from_millis(1);
        store.set("gone", "x".to_string(), Some(past));

        assert!(store.del("foo"));
        assert!(!store.del("foo"));
        assert!(!store.del("gone"));
        assert!(store.is_empty());
    }

    #[test]
    fn keys_follow_insertion_order() {
        let mut store = Store::new();
        store.set("banana", "1".to_string(), None);
        store.set("apple", "2".to_string(), None);
        store.set("cherry", "3".to_string(), None);
        // Updating a key keeps its slot.
        store.set("banana", "4".to_string(), None);
        assert_eq!(store.keys("*"), vec!["banana", "apple", "cherry"]);
    }

    #[test]
    fn type_distinguishes_strings_and_streams() -> Result<()> {
        let mut store = Store::new();
        store.set("s", "v".to_string(), None);
        store.xadd("st", "1-1", vec![("f".to_string(), "v".to_string())])?;
        assert_eq!(store.entry_type("s"), "string");
        assert_eq!(store.entry_type("st"), "stream");
        assert_eq!(store.entry_type("nope"), "none");
        Ok(())
    }

    #[test]
    fn rejected_xadd_leaves_no_empty_stream() {
        let mut store = Store::new();
        assert!(store.xadd("st", "0-0", Vec::new()).is_err());
        assert_eq!(store.entry_type("st"), "none");
        assert!(store.keys("*").is_empty());
    }

    #[test]
    fn xadd_on_string_key_is_a_type_error() {
        let mut store = Store::new();
        store.set("k", "v".to_string(), None);
        assert!(store.xadd("k", "1-1", Vec::new()).is_err());
    }

    #[test]
    fn xrange_on_missing_key_is_empty() -> Result<()> {
        let store = Store::new();
        assert!(store.xrange("nope", "-", "+")?.is_empty());
        Ok(())
    }

    #[rstest]
    #[case("*", "anything", true)]
    #[case("", "", true)]
    #[case("h?llo", "hello", true)]
    #[case("h?llo", "hllo", false)]
    #[case("h*llo", "hllo", true)]
    #[case("h*llo", "heeeello", true)]
    #[case("h[ae]llo", "hello", true)]
    #[case("h[ae]llo", "hallo", true)]
    #[case("h[ae]llo", "hillo", false)]
    #[case("h[a-c]llo", "hbllo", true)]
    #[case("h[!a]llo", "hbllo", true)]
    #[case("h[!a]llo", "hallo", false)]
    #[case("key:*:name", "key:42:name", true)]
    #[case("plain", "plain", true)]
    #[case("plain", "plains", false)]
    #[case("*t", "fast", true)]
    #[case("a*b*c", "aXbYc", true)]
    #[case("a*b*c", "aXcYb", false)]
    fn glob_cases(#[case] pattern: &str, #[case] text: &str, #[case] expected: bool) {
        assert_eq!(glob_match(pattern, text), expected, "{} vs {}", pattern, text);
    }
}
