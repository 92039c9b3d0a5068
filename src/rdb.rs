use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use binrw::{binread, BinRead, BinResult, Endian};

use crate::{Error, Result};

/// A content-free RDB snapshot, served to secondaries during the PSYNC
/// handoff.
const EMPTY_SNAPSHOT_HEX: &str = "524544495330303131fa0972656469732d76657205372e322e30fa0a7265\
6469732d62697473c040fa056374696d65c26d08bc65fa08757365642d6d656dc2b0c41000fa08616f662d62617365c0\
00fff06e3bfec0ff5aa2";

pub fn empty_snapshot() -> Result<Vec<u8>> {
    Ok(hex::decode(EMPTY_SNAPSHOT_HEX)?)
}

const OP_METADATA: u8 = 0xFA;
const OP_RESIZE: u8 = 0xFB;
const OP_EXPIRY_MS: u8 = 0xFC;
const OP_EXPIRY_SEC: u8 = 0xFD;
const OP_SELECT_DB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;

const TYPE_STRING: u8 = 0;

/// A parsed RDB file: header version, metadata pairs, and the per-database
/// entry tables. The trailing checksum is read but not validated.
#[derive(Debug)]
#[binread]
#[br(little)]
pub struct Rdb {
    header: RdbHeader,
    #[br(parse_with = parse_body)]
    body: RdbBody,
}

#[derive(Debug)]
#[binread]
#[br(little, magic = b"REDIS")]
struct RdbHeader {
    #[br(parse_with = parse_version)]
    version: u16,
}

#[derive(Debug, Default)]
struct RdbBody {
    metadata: Vec<(String, String)>,
    databases: HashMap<u32, Vec<RdbEntry>>,
    checksum: [u8; 8],
}

#[derive(Debug, Clone)]
pub struct RdbEntry {
    pub key: String,
    pub value: String,
    pub expires_at: Option<SystemTime>,
}

impl Rdb {
    /// Read an RDB file from disk. A missing file is not an error: the
    /// server simply starts empty.
    pub fn load(path: &Path) -> Result<Option<Rdb>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(path)?;
        Rdb::read(&mut file).map(Some).map_err(convert_error)
    }

    /// Decode an in-memory snapshot, as received during the PSYNC handoff.
    pub fn parse(bytes: &[u8]) -> Result<Rdb> {
        Rdb::read(&mut Cursor::new(bytes)).map_err(convert_error)
    }

    pub fn version(&self) -> u16 {
        self.header.version
    }

    pub fn metadata(&self) -> &[(String, String)] {
        &self.body.metadata
    }

    pub fn checksum(&self) -> [u8; 8] {
        self.body.checksum
    }

    pub fn database(&self, index: u32) -> &[RdbEntry] {
        self.body
            .databases
            .get(&index)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[binrw::parser(reader)]
fn parse_version() -> BinResult<u16> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    let pos = reader.stream_position()?;
    std::str::from_utf8(&buf)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| binrw::Error::AssertFail {
            pos,
            message: format!("version field {:?} is not four ASCII digits", buf),
        })
}

#[binrw::parser(reader, endian)]
fn parse_body() -> BinResult<RdbBody> {
    let mut body = RdbBody::default();
    loop {
        let op = u8::read_options(reader, endian, ())?;
        match op {
            OP_METADATA => {
                let key = RdbString::read_options(reader, endian, ())?;
                let value = RdbString::read_options(reader, endian, ())?;
                body.metadata.push((key.0, value.0));
            }
            OP_SELECT_DB => {
                let index = read_plain_length(reader, endian)? as u32;
                let marker = u8::read_options(reader, endian, ())?;
                if marker != OP_RESIZE {
                    return Err(binrw::Error::AssertFail {
                        pos: reader.stream_position()?,
                        message: format!(
                            "expected hash-size section (0xFB) after database selector, got 0x{:02X}",
                            marker
                        ),
                    });
                }
                let hash_size = read_plain_length(reader, endian)?;
                let _expiry_size = read_plain_length(reader, endian)?;

                let entries = body.databases.entry(index).or_default();
                for _ in 0..hash_size {
                    entries.push(RdbEntry::read_options(reader, endian, ())?);
                }
            }
            OP_EOF => {
                reader.read_exact(&mut body.checksum)?;
                break;
            }
            other => {
                return Err(binrw::Error::AssertFail {
                    pos: reader.stream_position()?,
                    message: format!("unexpected section byte 0x{:02X}", other),
                });
            }
        }
    }
    Ok(body)
}

impl BinRead for RdbEntry {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let mut op = u8::read_options(reader, endian, ())?;

        // Optional expiry prefix, then the value-type byte.
        let expires_at = match op {
            OP_EXPIRY_SEC => {
                let secs = u32::read_options(reader, Endian::Little, ())?;
                op = u8::read_options(reader, endian, ())?;
                Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
            }
            OP_EXPIRY_MS => {
                let millis = u64::read_options(reader, Endian::Little, ())?;
                op = u8::read_options(reader, endian, ())?;
                Some(UNIX_EPOCH + Duration::from_millis(millis))
            }
            _ => None,
        };

        if op != TYPE_STRING {
            return Err(binrw::Error::AssertFail {
                pos: reader.stream_position()?,
                message: format!("unsupported value type 0x{:02X}", op),
            });
        }

        let key = RdbString::read_options(reader, endian, ())?;
        let value = RdbString::read_options(reader, endian, ())?;
        Ok(Self {
            key: key.0,
            value: value.0,
            expires_at,
        })
    }
}

/// How a length byte resolves: a plain byte count, an inline little-endian
/// integer of the given width, or LZF compression (unsupported).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Length {
    Plain(usize),
    Int8,
    Int16,
    Int32,
    Lzf,
}

impl BinRead for Length {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let byte = u8::read_options(reader, endian, ())?;
        match byte >> 6 {
            0b00 => Ok(Self::Plain((byte & 0x3F) as usize)),
            0b01 => {
                let next = u8::read_options(reader, endian, ())?;
                Ok(Self::Plain((((byte & 0x3F) as usize) << 8) | next as usize))
            }
            0b10 => {
                let len = u32::read_options(reader, Endian::Big, ())?;
                Ok(Self::Plain(len as usize))
            }
            _ => match byte & 0x3F {
                0 => Ok(Self::Int8),
                1 => Ok(Self::Int16),
                2 => Ok(Self::Int32),
                3 => Ok(Self::Lzf),
                other => Err(binrw::Error::AssertFail {
                    pos: reader.stream_position()?,
                    message: format!("unknown special string format {}", other),
                }),
            },
        }
    }
}

/// A length-prefixed RDB string; inline integers are rendered to their
/// decimal form, matching how the keyspace stores them.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RdbString(String);

impl BinRead for RdbString {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let text = match Length::read_options(reader, endian, ())? {
            Length::Plain(len) => {
                let mut buf = vec![0u8; len];
                reader.read_exact(&mut buf)?;
                String::from_utf8_lossy(&buf).to_string()
            }
            Length::Int8 => i8::read_options(reader, Endian::Little, ())?.to_string(),
            Length::Int16 => i16::read_options(reader, Endian::Little, ())?.to_string(),
            Length::Int32 => i32::read_options(reader, Endian::Little, ())?.to_string(),
            Length::Lzf => {
                return Err(binrw::Error::AssertFail {
                    pos: reader.stream_position()?,
                    message: "LZF-compressed strings are not supported".to_string(),
                });
            }
        };
        Ok(Self(text))
    }
}

fn convert_error(e: binrw::Error) -> Error {
    let text = e.to_string();
    if text.contains("supported") {
        Error::Unsupported(text)
    } else {
        Error::RdbFormat(text)
    }
}

fn read_plain_length<R: Read + Seek>(reader: &mut R, endian: Endian) -> BinResult<usize> {
    match Length::read_options(reader, endian, ())? {
        Length::Plain(len) => Ok(len),
        other => Err(binrw::Error::AssertFail {
            pos: reader.stream_position()?,
            message: format!("expected a plain length, got {:?}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_hex::PrettyHex;

    use super::*;

    fn string_bytes(s: &str) -> Vec<u8> {
        let mut out = vec![s.len() as u8];
        out.extend_from_slice(s.as_bytes());
        out
    }

    #[test]
    fn parses_the_empty_snapshot() -> Result<()> {
        let bytes = empty_snapshot()?;
        println!("{}", bytes.hex_dump());

        let rdb = Rdb::parse(&bytes)?;
        assert_eq!(rdb.version(), 11);
        assert!(rdb.database(0).is_empty());
        assert_eq!(
            rdb.checksum(),
            [0xF0, 0x6E, 0x3B, 0xFE, 0xC0, 0xFF, 0x5A, 0xA2]
        );

        let meta: HashMap<&str, &str> = rdb
            .metadata()
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(meta.get("redis-ver"), Some(&"7.2.0"));
        assert_eq!(meta.get("redis-bits"), Some(&"64"));
        assert_eq!(meta.get("aof-base"), Some(&"0"));
        Ok(())
    }

    #[test]
    fn parses_a_database_with_expiries() -> Result<()> {
        let mut bytes = b"REDIS0011".to_vec();
        bytes.extend([OP_SELECT_DB, 0x00, OP_RESIZE, 0x03, 0x01]);
        // Plain string entry.
        bytes.push(TYPE_STRING);
        bytes.extend(string_bytes("x"));
        bytes.extend(string_bytes("y"));
        // Millisecond expiry: 1_700_000_000_000.
        bytes.push(OP_EXPIRY_MS);
        bytes.extend(1_700_000_000_000u64.to_le_bytes());
        bytes.push(TYPE_STRING);
        bytes.extend(string_bytes("ttl-ms"));
        bytes.extend(string_bytes("v1"));
        // Second expiry: 1_700_000_000.
        bytes.push(OP_EXPIRY_SEC);
        bytes.extend(1_700_000_000u32.to_le_bytes());
        bytes.push(TYPE_STRING);
        bytes.extend(string_bytes("ttl-sec"));
        bytes.extend(string_bytes("v2"));
        bytes.push(OP_EOF);
        bytes.extend([0u8; 8]);

        let rdb = Rdb::parse(&bytes)?;
        let entries = rdb.database(0);
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].key, "x");
        assert_eq!(entries[0].value, "y");
        assert_eq!(entries[0].expires_at, None);

        let expected = UNIX_EPOCH + Duration::from_millis(1_700_000_000_000);
        assert_eq!(entries[1].expires_at, Some(expected));
        let expected = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(entries[2].expires_at, Some(expected));
        Ok(())
    }

    #[test]
    fn decodes_the_length_encodings() {
        fn decode(bytes: Vec<u8>) -> String {
            RdbString::read_le(&mut Cursor::new(bytes))
                .expect("string should decode")
                .0
        }

        // 14-bit form: 0b01 with (0 << 8) | 3 = 3.
        assert_eq!(decode(vec![0x40, 0x03, b'a', b'b', b'c']), "abc");

        // 32-bit big-endian form.
        let mut bytes = vec![0x80, 0x00, 0x00, 0x00, 0x02];
        bytes.extend(b"hi");
        assert_eq!(decode(bytes), "hi");

        // Inline integers render as decimal strings.
        assert_eq!(decode(vec![0xC0, 0xFF]), "-1");
        assert_eq!(decode(vec![0xC1, 0x39, 0x30]), "12345");
        assert_eq!(decode(vec![0xC2, 0x40, 0xE2, 0x01, 0x00]), "123456");
    }

    #[test]
    fn rejects_lzf_and_unknown_types() {
        let lzf = RdbString::read_le(&mut Cursor::new(vec![0xC3, 0x00]));
        assert!(lzf.is_err());

        let mut bytes = b"REDIS0011".to_vec();
        bytes.extend([OP_SELECT_DB, 0x00, OP_RESIZE, 0x01, 0x00]);
        bytes.push(0x04); // hash value type
        bytes.extend(string_bytes("k"));
        assert!(matches!(Rdb::parse(&bytes), Err(Error::Unsupported(_))));
    }

    #[test]
    fn missing_file_is_not_an_error() -> Result<()> {
        assert!(Rdb::load(Path::new("/nonexistent/shoal/dump.rdb"))?.is_none());
        Ok(())
    }

    #[test]
    fn truncated_file_is_an_error() {
        let bytes = b"REDIS0011\xfe\x00".to_vec();
        assert!(matches!(Rdb::parse(&bytes), Err(Error::RdbFormat(_))));
    }
}
