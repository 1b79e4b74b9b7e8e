//! Volio intent log engine
//!
//! A low-latency durable record of writes not yet reflected in the object
//! store, replayed on recovery. Records are appended in memory as writes
//! are issued and become durable on commit, which resolves indirect
//! records (payload fetched from the store, or the block's final physical
//! location) and forces the log file to disk. The volume layer's bridge
//! decides immediate vs indirect per record; this crate owns the record
//! format, the commit path, and crash replay.

pub mod engine;
pub mod record;

pub use engine::{IndirectResolver, IntentLog, ReplayStats, COMMIT_BUFFER_SIZE};
pub use record::{AppendPayload, LogRecord, RecordBody, RecordPointer, RECORD_WRITE};
