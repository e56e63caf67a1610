//! Archive container format.
//!
//! ```text
//! header: magic "EVAR" | version u16
//! entry:  name_len u16 | name utf8 | event_count u32 | payload_len u64 | crc32 u32 | payload
//! ```
//!
//! All integers are little endian. `payload` is one zstd frame holding the
//! bincode encoding of the entry's `Vec<Event>`. Entries decode independently,
//! so a reader can stop at the first bad entry and keep what came before.
//! Window starts strictly increase from one entry to the next; writers and
//! readers both enforce this through [`WindowOrder`]. The async reader used
//! by restore lives in [`super::stream`].

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::str::FromStr;

use zstd::stream::{decode_all as zstd_decode_all, encode_all as zstd_encode_all};

use crate::event::Event;
use crate::{Error, Result};

pub const ARCHIVE_MAGIC: [u8; 4] = *b"EVAR";
pub const ARCHIVE_VERSION: u16 = 1;
pub const DEFAULT_LEVEL: i32 = 3;

/// Entry name encoding `(namespace, window_start, window_end)`; rendered as
/// `<namespace>/<start>-<end>`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryName {
    pub namespace: String,
    pub start: i64,
    pub end: i64,
}

impl EntryName {
    pub fn new(namespace: impl Into<String>, start: i64, end: i64) -> Self {
        Self {
            namespace: namespace.into(),
            start,
            end,
        }
    }

    /// Half-open windows `[start, end)` overlap.
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start < end && start < self.end
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}-{}", self.namespace, self.start, self.end)
    }
}

impl FromStr for EntryName {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let bad = || Error::CorruptArchive(format!("malformed entry name `{value}`"));
        // namespaces may contain '/', window bounds never do
        let (namespace, window) = value.rsplit_once('/').ok_or_else(bad)?;
        let (start, end) = window.split_once('-').ok_or_else(bad)?;
        let start: i64 = start.parse().map_err(|_| bad())?;
        let end: i64 = end.parse().map_err(|_| bad())?;
        if namespace.is_empty() || start > end {
            return Err(bad());
        }
        Ok(Self::new(namespace, start, end))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArchiveEntry {
    pub name: EntryName,
    pub events: Vec<Event>,
}

/// Metadata of one entry, read without decompressing its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    pub name: EntryName,
    pub event_count: u32,
    pub payload_len: u64,
    pub crc32: u32,
}

/// Bytes every archive starts with.
pub fn encode_header() -> Vec<u8> {
    let mut out = Vec::with_capacity(6);
    out.extend_from_slice(&ARCHIVE_MAGIC);
    out.extend_from_slice(&ARCHIVE_VERSION.to_le_bytes());
    out
}

/// Encode one self-contained entry.
pub fn encode_entry(name: &EntryName, events: &[Event], level: i32) -> Result<Vec<u8>> {
    let rendered = name.to_string();
    let name_len = u16::try_from(rendered.len()).map_err(|_| {
        Error::CorruptArchive(format!("entry name of {} bytes is too long", rendered.len()))
    })?;
    let event_count = u32::try_from(events.len())
        .map_err(|_| Error::CorruptArchive(format!("too many events in `{name}`")))?;

    let raw = bincode::serialize(events)?;
    let payload = zstd_encode_all(raw.as_slice(), level)?;
    let crc = crc32fast::hash(&payload);

    let mut out = Vec::with_capacity(rendered.len() + payload.len() + 20);
    out.extend_from_slice(&name_len.to_le_bytes());
    out.extend_from_slice(rendered.as_bytes());
    out.extend_from_slice(&event_count.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Tracks the last window start seen in one archive.
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowOrder {
    last_start: Option<i64>,
}

impl WindowOrder {
    /// Accept `name` only if its window starts after the previous one.
    pub fn admit(&mut self, name: &EntryName) -> Result<()> {
        if let Some(last) = self.last_start {
            if name.start <= last {
                return Err(Error::CorruptArchive(format!(
                    "entry `{name}` is not after the previous window start {last}"
                )));
            }
        }
        self.last_start = Some(name.start);
        Ok(())
    }
}

/// Encodes the entries of one archive in window order.
#[derive(Clone, Debug)]
pub struct EntryEncoder {
    level: i32,
    order: WindowOrder,
    entries: u64,
}

impl EntryEncoder {
    pub fn new(level: i32) -> Self {
        Self {
            level,
            order: WindowOrder::default(),
            entries: 0,
        }
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Encode the next window. Windows must come in increasing start order.
    pub fn encode(&mut self, name: &EntryName, events: &[Event]) -> Result<Vec<u8>> {
        self.order.admit(name)?;
        let bytes = encode_entry(name, events, self.level)?;
        self.entries += 1;
        Ok(bytes)
    }
}

pub(super) fn check_preamble(preamble: [u8; 6]) -> Result<()> {
    if preamble[..4] != ARCHIVE_MAGIC {
        return Err(Error::CorruptArchive("not an archive file".into()));
    }
    let version = u16::from_le_bytes([preamble[4], preamble[5]]);
    if version != ARCHIVE_VERSION {
        return Err(Error::CorruptArchive(format!(
            "unsupported archive version {version}"
        )));
    }
    Ok(())
}

/// `event_count | payload_len | crc32`, following the entry name.
pub(super) const ENTRY_FIELDS_LEN: usize = 16;

pub(super) fn parse_header(name: Vec<u8>, fields: [u8; ENTRY_FIELDS_LEN]) -> Result<EntryHeader> {
    let name = String::from_utf8(name)
        .map_err(|_| Error::CorruptArchive("entry name is not utf-8".into()))?;
    let mut count = [0u8; 4];
    count.copy_from_slice(&fields[..4]);
    let mut len = [0u8; 8];
    len.copy_from_slice(&fields[4..12]);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&fields[12..]);
    Ok(EntryHeader {
        name: name.parse()?,
        event_count: u32::from_le_bytes(count),
        payload_len: u64::from_le_bytes(len),
        crc32: u32::from_le_bytes(crc),
    })
}

pub(super) fn decode_payload(header: EntryHeader, payload: Vec<u8>) -> Result<ArchiveEntry> {
    if payload.len() as u64 != header.payload_len {
        return Err(Error::CorruptArchive(format!(
            "entry `{}` is truncated",
            header.name
        )));
    }
    if crc32fast::hash(&payload) != header.crc32 {
        return Err(Error::CorruptArchive(format!(
            "checksum mismatch in entry `{}`",
            header.name
        )));
    }

    let raw = zstd_decode_all(payload.as_slice())?;
    let events: Vec<Event> = bincode::deserialize(&raw)?;
    if events.len() != header.event_count as usize {
        return Err(Error::CorruptArchive(format!(
            "entry `{}` declares {} events but holds {}",
            header.name,
            header.event_count,
            events.len()
        )));
    }
    Ok(ArchiveEntry {
        name: header.name,
        events,
    })
}

/// Fill `buf`, or report a clean end of stream if nothing was read.
fn read_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(Error::CorruptArchive(
                    "archive ends in the middle of an entry header".into(),
                ));
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}

pub(super) fn truncated(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::CorruptArchive("archive is truncated".into())
    } else {
        err.into()
    }
}

pub struct ArchiveReader<R: Read> {
    inner: R,
    order: WindowOrder,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let mut preamble = [0u8; 6];
        inner.read_exact(&mut preamble).map_err(truncated)?;
        check_preamble(preamble)?;
        Ok(Self {
            inner,
            order: WindowOrder::default(),
        })
    }

    fn next_header(&mut self) -> Result<Option<EntryHeader>> {
        let mut name_len = [0u8; 2];
        if !read_or_eof(&mut self.inner, &mut name_len)? {
            return Ok(None);
        }
        let mut name = vec![0u8; u16::from_le_bytes(name_len) as usize];
        self.inner.read_exact(&mut name).map_err(truncated)?;
        let mut fields = [0u8; ENTRY_FIELDS_LEN];
        self.inner.read_exact(&mut fields).map_err(truncated)?;
        let header = parse_header(name, fields)?;
        self.order.admit(&header.name)?;
        Ok(Some(header))
    }

    /// Decode the next entry, or `None` at the end of the archive.
    pub fn next_entry(&mut self) -> Result<Option<ArchiveEntry>> {
        let Some(header) = self.next_header()? else {
            return Ok(None);
        };
        let mut payload = Vec::new();
        (&mut self.inner)
            .take(header.payload_len)
            .read_to_end(&mut payload)?;
        decode_payload(header, payload).map(Some)
    }
}

impl<R: Read + Seek> ArchiveReader<R> {
    /// Headers of every entry, skipping payloads instead of decoding them.
    pub fn entry_headers(&mut self) -> Result<Vec<EntryHeader>> {
        let mut headers = Vec::new();
        while let Some(header) = self.next_header()? {
            let skip = i64::try_from(header.payload_len).map_err(|_| {
                Error::CorruptArchive(format!("entry `{}` is too large", header.name))
            })?;
            self.inner.seek(SeekFrom::Current(skip))?;
            headers.push(header);
        }
        Ok(headers)
    }
}

impl<R: Read> Iterator for ArchiveReader<R> {
    type Item = Result<ArchiveEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
