//! Moves time windows of events into compressed archive files and back.

pub mod codec;
pub mod stream;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::event::validate_namespace;
use crate::metrics::Metrics;
use crate::naming::{hex_decode, hex_encode};
use crate::query::EventQuery;
use crate::store::EventStore;
use crate::{Error, Result, WithContext};

use codec::{DEFAULT_LEVEL, EntryEncoder, EntryName, encode_header};
use stream::AsyncArchiveReader;

pub const ARCHIVE_EXTENSION: &str = "evz";
pub const MIN_WINDOW: Duration = Duration::from_secs(60);
pub const MAX_WINDOW: Duration = Duration::from_secs(60 * 60);
/// Archives of one range beyond this many are refused.
pub const MAX_ARCHIVES_PER_RANGE: u32 = 10_000;

/// `<hex(namespace)>_<start>_<end>.evz` for the first archive of a range,
/// `<hex(namespace)>_<start>_<end>_<seq>.evz` for later ones.
pub fn archive_file_name(namespace: &str, start: i64, end: i64, seq: u32) -> String {
    let stem = format!("{}_{start}_{end}", hex_encode(namespace));
    if seq == 0 {
        format!("{stem}.{ARCHIVE_EXTENSION}")
    } else {
        format!("{stem}_{seq}.{ARCHIVE_EXTENSION}")
    }
}

/// An archive file and the half-open range `[start, end)` its name encodes.
/// `seq` orders archives written for the same range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveFile {
    pub path: PathBuf,
    pub namespace: String,
    pub start: i64,
    pub end: i64,
    pub seq: u32,
}

impl ArchiveFile {
    pub fn from_path(path: &Path) -> Option<Self> {
        let stem = path
            .file_name()?
            .to_str()?
            .strip_suffix(ARCHIVE_EXTENSION)?
            .strip_suffix('.')?;
        let mut parts = stem.split('_');
        let namespace = hex_decode(parts.next()?)?;
        let start = parts.next()?.parse().ok()?;
        let end = parts.next()?.parse().ok()?;
        let seq = match parts.next() {
            Some(seq) => seq.parse::<u32>().ok().filter(|seq| *seq > 0)?,
            None => 0,
        };
        if parts.next().is_some() || start > end {
            return None;
        }
        Some(Self {
            path: path.to_path_buf(),
            namespace,
            start,
            end,
            seq,
        })
    }

    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start < end && start < self.end
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub entries: u64,
    pub events: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub namespace: String,
    pub entries: u64,
    /// Events written back. Restoring the same file twice writes them twice.
    pub events: u64,
}

pub(crate) fn window_millis(window: Duration) -> Result<i64> {
    if window < MIN_WINDOW || window > MAX_WINDOW {
        return Err(Error::InvalidQuery(format!(
            "archive window {window:?} must be between {MIN_WINDOW:?} and {MAX_WINDOW:?}"
        )));
    }
    Ok(window.as_millis() as i64)
}

#[derive(Clone)]
pub struct Archiver {
    events: Arc<dyn EventStore>,
    dir: PathBuf,
    level: i32,
    metrics: Arc<Metrics>,
}

impl Archiver {
    pub fn new(events: Arc<dyn EventStore>, dir: impl Into<PathBuf>) -> Self {
        Self {
            events,
            dir: dir.into(),
            level: DEFAULT_LEVEL,
            metrics: Arc::default(),
        }
    }

    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create a fresh archive file for the range, never replacing an
    /// existing one.
    async fn open_archive(&self, namespace: &str, start: i64, end: i64) -> Result<(PathBuf, File)> {
        fs::create_dir_all(&self.dir).await?;
        for seq in 0..MAX_ARCHIVES_PER_RANGE {
            let path = self.dir.join(archive_file_name(namespace, start, end, seq));
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(mut file) => {
                    file.write_all(&encode_header()).await?;
                    return Ok((path, file));
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{MAX_ARCHIVES_PER_RANGE} archives already exist for {namespace} [{start}, {end})"),
        )))
    }

    /// Archive the half-open range `[query.start, query.end)` one window at a
    /// time. The query's metadata and dimension predicates select which events
    /// are archived. Returns `None` and writes nothing if the range is empty.
    pub async fn archive(&self, query: &EventQuery, window: Duration) -> Result<Option<ArchiveSummary>> {
        let window_ms = window_millis(window)?;
        query.parse()?;
        let namespace = query.namespace.as_str();

        let mut file: Option<(PathBuf, File)> = None;
        let mut encoder = EntryEncoder::new(self.level);
        let mut total = 0u64;
        let mut window_start = query.start;
        while window_start < query.end {
            let window_end = window_start.saturating_add(window_ms).min(query.end);
            let name = EntryName::new(namespace, window_start, window_end);

            let mut slice = query.clone();
            slice.start = window_start;
            slice.end = window_end - 1;
            slice.limit = 0;
            slice.ascending = true;
            slice.include_payloads = true;
            let events = self
                .events
                .get(&slice)
                .await
                .context(format!("archive window {name}"))?;

            if !events.is_empty() {
                let bytes = encoder.encode(&name, &events)?;
                if file.is_none() {
                    file = Some(self.open_archive(namespace, query.start, query.end).await?);
                }
                if let Some((_, out)) = file.as_mut() {
                    out.write_all(&bytes).await?;
                }
                total += events.len() as u64;
                Metrics::add(&self.metrics.archive_entries_total, 1);
                debug!(namespace, window = %name, events = events.len(), "archived window");
            }
            window_start = window_end;
        }

        let Some((path, mut out)) = file else {
            debug!(namespace, start = query.start, end = query.end, "nothing to archive");
            return Ok(None);
        };
        out.flush().await?;
        out.sync_all().await?;
        let entries = encoder.entries();
        info!(namespace, path = %path.display(), entries, events = total, "wrote archive");
        Ok(Some(ArchiveSummary {
            path,
            entries,
            events: total,
        }))
    }

    /// Write an archive's events back into `namespace`, creating it if needed.
    /// Entries are streamed and committed one by one; a bad entry stops the
    /// restore after the earlier ones have already been stored.
    pub async fn restore(&self, namespace: &str, path: &Path) -> Result<RestoreReport> {
        validate_namespace(namespace)?;
        let file = File::open(path)
            .await
            .map_err(Error::from)
            .context(format!("open archive {}", path.display()))?;
        let mut reader = AsyncArchiveReader::new(BufReader::new(file)).await?;
        self.events.create(namespace).await?;

        let mut report = RestoreReport {
            namespace: namespace.to_string(),
            ..RestoreReport::default()
        };
        while let Some(entry) = reader.next_entry().await? {
            self.events
                .store(namespace, &entry.events)
                .await
                .context(format!("restore entry {}", entry.name))?;
            report.entries += 1;
            report.events += entry.events.len() as u64;
        }
        Metrics::add(&self.metrics.restored_events_total, report.events);
        info!(
            namespace,
            path = %path.display(),
            entries = report.entries,
            events = report.events,
            "restored archive"
        );
        Ok(report)
    }

    /// Archive files for `namespace` whose range overlaps `[start, end)`,
    /// ordered by range start, then by the order they were written.
    pub async fn candidates(&self, namespace: &str, start: i64, end: i64) -> Result<Vec<ArchiveFile>> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut found = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if let Some(file) = ArchiveFile::from_path(&entry.path()) {
                if file.namespace == namespace && file.overlaps(start, end) {
                    found.push(file);
                }
            }
        }
        found.sort_by_key(|file| (file.start, file.end, file.seq));
        Ok(found)
    }
}
