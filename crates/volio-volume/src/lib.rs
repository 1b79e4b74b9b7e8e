//! Volio volume emulation layer
//!
//! Exposes an arbitrarily large object held in a transactional object
//! store as a fixed-size block device: crash-consistent reads and writes,
//! synchronous-write intent logging with replay on open, byte-range
//! serialized concurrency, and a dump mode that bypasses the transactional
//! path by pre-resolving every logical block to a physical address.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │     Registry     │  create / open / remove / resize / dump toggle
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐     ┌───────────────┐
//! │      Volume      │────▶│  ExtentMap    │  (dump mode only)
//! │  - RangeLockTable│     └───────────────┘
//! │  - IntentLogBridge ──▶ volio-log
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐
//! │   ServiceLoop    │  per-volume worker over the RequestQueue
//! └────────┬─────────┘
//!          │
//!          ▼ volio-store (transactional object store)
//! ```

pub mod bridge;
pub mod extent;
pub mod queue;
pub mod registry;
pub mod rlock;
pub mod service;
pub mod volume;

pub use bridge::IntentLogBridge;
pub use extent::{Extent, ExtentMap};
pub use queue::{IoCompletion, Request, RequestKind, RequestQueue};
pub use registry::{CreateOpts, Registry, VolumeHandle, VolumeStats};
pub use rlock::{LockMode, RangeLockGuard, RangeLockTable};
pub use service::{LoopState, ServiceLoop};
pub use volume::Volume;
