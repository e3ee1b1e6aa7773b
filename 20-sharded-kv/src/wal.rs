//! Write-ahead log for one shard replica.
//!
//! # File format
//!
//! ```text
//! header:  b"SKVW" | version: u32 LE
//! record:  len: u32 LE | crc32(payload): u32 LE | payload: bincode(Entry)
//! ```
//!
//! A payload is at most [`MAX_ENTRY_LEN`] bytes. Larger entries are refused
//! before anything is written, so an accepted append can always be read back.
//!
//! Records are self-describing (the payload carries its sequence number) and
//! checksummed, so a crash in the middle of an append leaves a tail that
//! fails validation. Opening the log truncates such a tail and reports it as a
//! [`PartialWrite`] instead of failing.
//!
//! Sequence numbers in a log are strictly increasing. Appends made by the
//! replication pipeline are also gap-free; gaps only appear where
//! [`Wal::truncate_before`] folded superseded entries out of the prefix.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::entry::{Entry, Sequence, Term, MAX_ENTRY_LEN};
use crate::error::{KvError, Result};

const MAGIC: [u8; 4] = *b"SKVW";
const VERSION: u32 = 2;
const HEADER_LEN: u64 = 8;
const RECORD_HEADER_LEN: usize = 8;
const MAX_RECORD_LEN: usize = MAX_ENTRY_LEN;

/// A torn or corrupt tail found while reading the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialWrite {
    /// Byte offset where the last fully valid record ends.
    pub offset: u64,
    /// Bytes after `offset` that could not be validated.
    pub discarded: u64,
}

impl From<PartialWrite> for KvError {
    fn from(partial: PartialWrite) -> Self {
        KvError::PartialWriteDetected {
            offset: partial.offset,
            discarded: partial.discarded,
        }
    }
}

/// Entries read back from a log, in append order.
#[derive(Debug, Default)]
pub struct Replay {
    pub entries: Vec<Entry>,
    pub partial: Option<PartialWrite>,
}

struct Record {
    entry: Entry,
    start: usize,
    end: usize,
}

struct Scan {
    records: Vec<Record>,
    valid_len: u64,
    has_header: bool,
    partial: Option<PartialWrite>,
}

/// Validates `bytes` as a WAL image and returns every record up to the first
/// one that fails to validate.
fn scan(bytes: &[u8]) -> io::Result<Scan> {
    let total = bytes.len() as u64;
    if bytes.len() < HEADER_LEN as usize {
        // Crashed while writing the header of a brand new log.
        return Ok(Scan {
            records: Vec::new(),
            valid_len: 0,
            has_header: false,
            partial: (total > 0).then_some(PartialWrite {
                offset: 0,
                discarded: total,
            }),
        });
    }
    if bytes[..4] != MAGIC {
        return Err(io::Error::new(ErrorKind::InvalidData, "missing WAL magic"));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != VERSION {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("unsupported WAL version {version}"),
        ));
    }

    let mut records = Vec::new();
    let mut pos = HEADER_LEN as usize;
    let mut last_sequence = 0;
    while pos < bytes.len() {
        let Some(record) = decode_record(bytes, pos, last_sequence) else {
            break;
        };
        last_sequence = record.entry.sequence;
        pos = record.end;
        records.push(record);
    }

    let partial = (pos < bytes.len()).then_some(PartialWrite {
        offset: pos as u64,
        discarded: total - pos as u64,
    });
    Ok(Scan {
        records,
        valid_len: pos as u64,
        has_header: true,
        partial,
    })
}

fn decode_record(bytes: &[u8], start: usize, last_sequence: Sequence) -> Option<Record> {
    let header_end = start.checked_add(RECORD_HEADER_LEN)?;
    let header = bytes.get(start..header_end)?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let checksum = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_RECORD_LEN {
        return None;
    }
    let end = header_end.checked_add(len)?;
    let payload = bytes.get(header_end..end)?;
    if crc32fast::hash(payload) != checksum {
        return None;
    }
    let entry = Entry::decode(payload).ok()?;
    if entry.sequence <= last_sequence {
        return None;
    }
    Some(Record { entry, start, end })
}

fn encode_record(entry: &Entry) -> Result<Vec<u8>> {
    let payload = entry.encode()?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(KvError::EntryTooLarge {
            size: payload.len(),
            limit: MAX_RECORD_LEN,
        });
    }
    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    record.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    record.extend_from_slice(&payload);
    Ok(record)
}

fn header_bytes() -> [u8; HEADER_LEN as usize] {
    let mut header = [0u8; HEADER_LEN as usize];
    header[..4].copy_from_slice(&MAGIC);
    header[4..].copy_from_slice(&VERSION.to_le_bytes());
    header
}

async fn read_image(path: &Path) -> io::Result<Vec<u8>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

fn term_index<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> BTreeMap<Sequence, Term> {
    entries.into_iter().map(|e| (e.sequence, e.term)).collect()
}

/// Append-only durable log owned by exactly one shard replica.
pub struct Wal {
    path: PathBuf,
    file: File,
    len: u64,
    last_sequence: Sequence,
    terms: BTreeMap<Sequence, Term>,
    poisoned: bool,
}

impl Wal {
    /// Opens (or creates) the log at `path` and recovers its contents.
    ///
    /// A torn tail is truncated away; the returned [`Replay`] reports it.
    pub async fn open(path: impl Into<PathBuf>) -> Result<(Self, Replay)> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let (file, scan) = Self::recover_file(&path).await?;
        let last_sequence = scan.records.last().map_or(0, |r| r.entry.sequence);
        let replay = Replay {
            entries: scan.records.into_iter().map(|r| r.entry).collect(),
            partial: scan.partial,
        };
        info!(
            path = %path.display(),
            entries = replay.entries.len(),
            last_sequence,
            "opened WAL"
        );
        let wal = Self {
            path,
            file,
            len: scan.valid_len.max(HEADER_LEN),
            last_sequence,
            terms: term_index(&replay.entries),
            poisoned: false,
        };
        Ok((wal, replay))
    }

    async fn recover_file(path: &Path) -> Result<(File, Scan)> {
        let bytes = read_image(path).await?;
        let scan = scan(&bytes)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        if !scan.has_header {
            file.set_len(0).await?;
            file.write_all(&header_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
        } else if let Some(partial) = scan.partial {
            warn!(
                path = %path.display(),
                error = %KvError::from(partial),
                "truncating torn WAL tail"
            );
            file.set_len(scan.valid_len).await?;
            file.sync_all().await?;
        }
        Ok((file, scan))
    }

    /// Re-runs recovery after a failed append left the file in an unknown state.
    pub async fn recover(&mut self) -> Result<Sequence> {
        let (file, scan) = Self::recover_file(&self.path).await?;
        self.file = file;
        self.len = scan.valid_len.max(HEADER_LEN);
        self.last_sequence = scan.records.last().map_or(0, |r| r.entry.sequence);
        self.terms = term_index(scan.records.iter().map(|r| &r.entry));
        self.poisoned = false;
        info!(path = %self.path.display(), last_sequence = self.last_sequence, "WAL recovered");
        Ok(self.last_sequence)
    }

    /// Durably appends one entry and returns its sequence number.
    ///
    /// Any I/O failure poisons the log: later appends are refused until
    /// [`Wal::recover`] has re-validated the file.
    pub async fn append(&mut self, entry: &Entry) -> Result<Sequence> {
        self.append_all(std::slice::from_ref(entry)).await
    }

    /// Durably appends a run of entries with a single sync.
    pub async fn append_all(&mut self, entries: &[Entry]) -> Result<Sequence> {
        if self.poisoned {
            return Err(KvError::StorageUnhealthy);
        }
        let mut buf = Vec::new();
        let mut last = self.last_sequence;
        for entry in entries {
            if entry.sequence <= last {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("sequence {} does not follow {last}", entry.sequence),
                )
                .into());
            }
            last = entry.sequence;
            buf.extend_from_slice(&encode_record(entry)?);
        }
        if buf.is_empty() {
            return Ok(self.last_sequence);
        }

        if let Err(err) = self.write_durable(&buf).await {
            self.poisoned = true;
            error!(path = %self.path.display(), error = %err, "WAL append failed");
            return Err(err.into());
        }
        self.len += buf.len() as u64;
        self.last_sequence = last;
        self.terms.extend(entries.iter().map(|e| (e.sequence, e.term)));
        debug!(path = %self.path.display(), sequence = last, "WAL append");
        Ok(last)
    }

    async fn write_durable(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf).await?;
        self.file.flush().await?;
        self.file.sync_data().await
    }

    /// Reads every valid entry back from disk, in append order.
    pub async fn replay(&self) -> Result<Replay> {
        let bytes = read_image(&self.path).await?;
        let scan = scan(&bytes)?;
        Ok(Replay {
            entries: scan.records.into_iter().map(|r| r.entry).collect(),
            partial: scan.partial,
        })
    }

    /// Returns up to `limit` entries with sequence `>= from`.
    pub async fn read_from(&self, from: Sequence, limit: usize) -> Result<Vec<Entry>> {
        let replay = self.replay().await?;
        Ok(replay
            .entries
            .into_iter()
            .filter(|entry| entry.sequence >= from)
            .take(limit)
            .collect())
    }

    /// Removes every entry after `sequence`.
    ///
    /// Used to roll back an entry the leader appended but never applied
    /// because its replication round was abandoned.
    pub async fn truncate_after(&mut self, sequence: Sequence) -> Result<()> {
        let bytes = read_image(&self.path).await?;
        let scan = scan(&bytes)?;
        let keep = scan
            .records
            .iter()
            .take_while(|r| r.entry.sequence <= sequence)
            .last();
        let (len, last) = match keep {
            Some(record) => (record.end as u64, record.entry.sequence),
            None => (HEADER_LEN, 0),
        };
        self.file.set_len(len).await?;
        self.file.sync_all().await?;
        debug!(path = %self.path.display(), from = self.last_sequence, to = last, "WAL rolled back");
        self.len = len;
        self.last_sequence = last;
        self.terms.retain(|&seq, _| seq <= last);
        Ok(())
    }

    /// Compacts the prefix below `sequence`.
    ///
    /// An entry below `sequence` is dropped when a later entry for the same
    /// key supersedes it; the newest entry of every key, tombstones included,
    /// is retained. Replaying the compacted log, or any suffix of it, yields
    /// the same store state as the full log did. Returns how many entries
    /// were removed.
    pub async fn truncate_before(&mut self, sequence: Sequence) -> Result<usize> {
        if self.poisoned {
            return Err(KvError::StorageUnhealthy);
        }
        let bytes = read_image(&self.path).await?;
        let scan = scan(&bytes)?;

        let mut newest: HashMap<&str, Sequence> = HashMap::new();
        for record in &scan.records {
            newest.insert(record.entry.key.as_str(), record.entry.sequence);
        }
        let mut image = header_bytes().to_vec();
        let mut removed = 0;
        let mut terms = BTreeMap::new();
        for record in &scan.records {
            let entry = &record.entry;
            if entry.sequence >= sequence || newest.get(entry.key.as_str()) == Some(&entry.sequence) {
                image.extend_from_slice(&bytes[record.start..record.end]);
                terms.insert(entry.sequence, entry.term);
            } else {
                removed += 1;
            }
        }
        if removed == 0 {
            return Ok(0);
        }

        let tmp = self.path.with_extension("wal.compact");
        let mut out = File::create(&tmp).await?;
        out.write_all(&image).await?;
        out.flush().await?;
        out.sync_all().await?;
        drop(out);
        fs::rename(&tmp, &self.path).await?;

        self.file = OpenOptions::new().append(true).open(&self.path).await?;
        self.len = image.len() as u64;
        self.terms = terms;
        info!(path = %self.path.display(), before = sequence, removed, "WAL compacted");
        Ok(removed)
    }

    pub fn last_sequence(&self) -> Sequence {
        self.last_sequence
    }

    /// Term of the entry at `sequence`, or `None` if the log does not hold
    /// it (never written, rolled back, or folded away by compaction).
    pub fn term_at(&self, sequence: Sequence) -> Option<Term> {
        self.terms.get(&sequence).copied()
    }

    /// Term of the newest entry, 0 for an empty log.
    pub fn last_term(&self) -> Term {
        self.terms.values().next_back().copied().unwrap_or(0)
    }

    /// Size of the validated log in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.last_sequence == 0
    }

    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
