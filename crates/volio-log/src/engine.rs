//! Intent log engine: append, commit, replay
//!
//! Appends are buffered in memory; `commit` makes everything up to a
//! sequence number durable, resolving indirect records on the way out.
//! Replay iterates verified records in sequence order and hands each to a
//! dispatch closure; recovery stops at the first corrupt record.

use crate::record::{AppendPayload, LogRecord, RecordBody, RecordPointer};

use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use volio_common::{Txg, VolumeError, VolumeResult};

/// Magic number for the log file header
const LOG_MAGIC: u64 = 0x564C_494F_494C_4F47; // "VLIOILOG"

/// Log file format version
const LOG_VERSION: u32 = 1;

/// Header: magic + version
const HEADER_SIZE: u64 = 12;

/// Per-commit budget for copying indirect payloads inline. Records that do
/// not fit are committed as pointer records instead.
pub const COMMIT_BUFFER_SIZE: u64 = 128 * 1024;

/// Resolves the data of an indirect record at commit time.
pub trait IndirectResolver: Send + Sync {
    /// When `buf` is supplied, read the span from the store into it and
    /// return `None`. Otherwise request the store's synchronous block sync
    /// and return the block's final pointer once the store resolves it.
    fn resolve(
        &self,
        offset: u64,
        length: u64,
        buf: Option<&mut Vec<u8>>,
    ) -> VolumeResult<Option<RecordPointer>>;
}

/// Outcome of a replay pass
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayStats {
    /// Records dispatched
    pub records: usize,
    /// Highest transaction generation seen across dispatched records
    pub max_txg: Txg,
}

struct PendingRecord {
    sequence: u64,
    kind: u8,
    txg: Txg,
    offset: u64,
    length: u64,
    payload: AppendPayload,
}

struct LogInner {
    writer: Option<BufWriter<File>>,
    pending: Vec<PendingRecord>,
    next_sequence: u64,
    durable_sequence: u64,
}

/// File-backed intent log scoped to one volume's backing object
pub struct IntentLog {
    path: PathBuf,
    inner: Mutex<LogInner>,
}

impl IntentLog {
    /// Open or create the log at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> VolumeResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        let next_sequence = if file_len >= HEADER_SIZE {
            Self::verify_header(&mut file)?;
            Self::scan_last_sequence(&mut file)? + 1
        } else {
            Self::write_header(&mut file)?;
            1
        };

        file.seek(SeekFrom::End(0))?;
        info!(?path, next_sequence, "opened intent log");

        Ok(Self {
            path,
            inner: Mutex::new(LogInner {
                writer: Some(BufWriter::new(file)),
                pending: Vec::new(),
                next_sequence,
                durable_sequence: next_sequence - 1,
            }),
        })
    }

    fn write_header(file: &mut File) -> VolumeResult<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&LOG_MAGIC.to_le_bytes())?;
        file.write_all(&LOG_VERSION.to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_header(file: &mut File) -> VolumeResult<()> {
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);

        let mut magic_buf = [0u8; 8];
        std::io::Read::read_exact(&mut reader, &mut magic_buf)?;
        if u64::from_le_bytes(magic_buf) != LOG_MAGIC {
            return Err(VolumeError::io("invalid intent log magic"));
        }

        let mut version_buf = [0u8; 4];
        std::io::Read::read_exact(&mut reader, &mut version_buf)?;
        let version = u32::from_le_bytes(version_buf);
        if version != LOG_VERSION {
            return Err(VolumeError::io(format!(
                "unsupported intent log version {version}"
            )));
        }
        Ok(())
    }

    /// Scan the record stream for the highest durable sequence number.
    fn scan_last_sequence(file: &mut File) -> VolumeResult<u64> {
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut reader = BufReader::new(file);
        let mut last = 0u64;
        loop {
            match LogRecord::deserialize(&mut reader) {
                Ok(record) if record.verify() => last = record.sequence,
                _ => break,
            }
        }
        Ok(last)
    }

    /// Append a record; it stays in memory until [`Self::commit`].
    /// Returns the assigned sequence number.
    pub fn append(
        &self,
        kind: u8,
        txg: Txg,
        offset: u64,
        length: u64,
        payload: AppendPayload,
    ) -> VolumeResult<u64> {
        let mut inner = self.inner.lock();
        if inner.writer.is_none() {
            return Err(VolumeError::io("intent log is closed"));
        }
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.pending.push(PendingRecord {
            sequence,
            kind,
            txg,
            offset,
            length,
            payload,
        });
        Ok(sequence)
    }

    /// Highest sequence number assigned so far.
    pub fn last_sequence(&self) -> u64 {
        self.inner.lock().next_sequence - 1
    }

    /// Force every record up to `upto` durably to disk. Indirect records
    /// are resolved through `resolver`: copied inline while the commit
    /// buffer budget lasts, committed as pointer records afterwards.
    pub fn commit(&self, upto: u64, resolver: &dyn IndirectResolver) -> VolumeResult<()> {
        let mut inner = self.inner.lock();
        if inner.durable_sequence >= upto {
            return Ok(());
        }

        let mut to_commit = Vec::new();
        let mut keep = Vec::new();
        for pending in inner.pending.drain(..) {
            if pending.sequence <= upto {
                to_commit.push(pending);
            } else {
                keep.push(pending);
            }
        }
        inner.pending = keep;

        let mut copy_budget = COMMIT_BUFFER_SIZE;
        let mut records = Vec::with_capacity(to_commit.len());
        for pending in to_commit {
            let body = match pending.payload {
                AppendPayload::Immediate(data) => {
                    copy_budget = copy_budget.saturating_sub(data.len() as u64);
                    RecordBody::Payload(data)
                }
                AppendPayload::Indirect if pending.length <= copy_budget => {
                    let mut buf = Vec::with_capacity(pending.length as usize);
                    match resolver.resolve(pending.offset, pending.length, Some(&mut buf))? {
                        None => {
                            copy_budget -= pending.length;
                            RecordBody::Payload(Bytes::from(buf))
                        }
                        Some(ptr) => RecordBody::Pointer(ptr),
                    }
                }
                AppendPayload::Indirect => {
                    let ptr = resolver
                        .resolve(pending.offset, pending.length, None)?
                        .ok_or_else(|| {
                            VolumeError::io("resolver returned no pointer for indirect record")
                        })?;
                    RecordBody::Pointer(ptr)
                }
            };
            records.push(LogRecord::new(
                pending.sequence,
                pending.kind,
                pending.txg,
                pending.offset,
                pending.length,
                body,
            ));
        }

        let writer = inner
            .writer
            .as_mut()
            .ok_or_else(|| VolumeError::io("intent log is closed"))?;
        for record in &records {
            writer.write_all(&record.serialize())?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;

        inner.durable_sequence = inner.durable_sequence.max(upto);
        debug!(
            upto,
            committed = records.len(),
            "intent log commit"
        );
        Ok(())
    }

    /// Commit everything appended so far.
    pub fn commit_all(&self, resolver: &dyn IndirectResolver) -> VolumeResult<()> {
        let upto = self.last_sequence();
        self.commit(upto, resolver)
    }

    /// Replay durable records in sequence order through `dispatch`.
    /// Stops silently at the first corrupt record; a dispatch error aborts
    /// the replay and is returned to the caller.
    pub fn replay(
        &self,
        dispatch: &mut dyn FnMut(&LogRecord) -> VolumeResult<()>,
    ) -> VolumeResult<ReplayStats> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(HEADER_SIZE))?;

        let mut stats = ReplayStats::default();
        loop {
            let record = match LogRecord::deserialize(&mut reader) {
                Ok(record) => record,
                Err(_) => break, // EOF or torn tail
            };
            if !record.verify() {
                warn!(
                    sequence = record.sequence,
                    "intent log record failed checksum, stopping replay"
                );
                break;
            }
            dispatch(&record)?;
            stats.records += 1;
            stats.max_txg = stats.max_txg.max(record.txg);
        }

        info!(records = stats.records, "intent log replay complete");
        Ok(stats)
    }

    /// Truncate to an empty log. Called after recovery has been applied;
    /// sequence numbers keep counting upward.
    pub fn rotate(&self) -> VolumeResult<()> {
        let mut inner = self.inner.lock();
        if !inner.pending.is_empty() {
            return Err(VolumeError::io("cannot rotate with uncommitted records"));
        }
        inner.writer = None;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        Self::write_header(&mut file)?;
        file.seek(SeekFrom::End(0))?;

        inner.durable_sequence = inner.next_sequence - 1;
        inner.writer = Some(BufWriter::new(file));
        debug!(path = ?self.path, "rotated intent log");
        Ok(())
    }

    /// Close the log. Further appends and commits fail.
    pub fn close(&self) {
        self.inner.lock().writer = None;
    }
}
