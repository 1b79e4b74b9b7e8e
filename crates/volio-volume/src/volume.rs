//! Volume instances
//!
//! A [`Volume`] binds a pool/dataset-style name to a backing store object
//! and carries everything the I/O path needs: the claimed object, the
//! range-lock table, the intent log bridge, and the dump extent map while
//! dump mode is active. Lifecycle mutations (resize, dump toggling) are
//! serialized per volume; the registry owns registration and removal.

use crate::bridge::IntentLogBridge;
use crate::extent::{build_extent_map, preallocate, ExtentMap};
use crate::queue::RequestQueue;
use crate::rlock::{LockMode, RangeLockTable};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use volio_common::types::{validate_block_size, validate_volume_size};
use volio_common::{ByteRange, ObjectId, Txg, VolumeConfig, VolumeError, VolumeResult};
use volio_store::{ObjectStore, OpenMode, TxHandle};

/// Advertised logical size in bytes
pub const PROP_SIZE: &str = "volsize";
/// Logical block size
pub const PROP_BLOCK_SIZE: &str = "volblocksize";
/// Read-only toggle; the registry subscribes to changes
pub const PROP_READONLY: &str = "readonly";
/// Dump designation; survives restart
pub const PROP_DUMP: &str = "dump";

const PROP_COMPRESSION: &str = "compression";
const PROP_CHECKSUM: &str = "checksum";
const PROP_RESERVATION: &str = "refreservation";

/// Property values saved when dump mode is activated and put back when it
/// is deactivated
#[derive(Debug, Clone, Default)]
struct DumpSnapshot {
    compression: Option<String>,
    checksum: Option<String>,
    reservation: Option<String>,
}

/// A named volume bound to a backing store object
pub struct Volume {
    name: String,
    volume_id: Uuid,
    store: Arc<dyn ObjectStore>,
    object: ObjectId,
    mode: OpenMode,
    block_size: u32,
    logical_size: AtomicU64,
    read_only: Arc<AtomicBool>,
    dump_active: AtomicBool,
    bridge: Option<IntentLogBridge>,
    rlock: RangeLockTable,
    queue: Arc<RequestQueue>,
    extents: Mutex<Option<ExtentMap>>,
    dump_snapshot: Mutex<Option<DumpSnapshot>>,
    open_count: AtomicU32,
    replay_txg: Mutex<Option<Txg>>,
    /// Serializes resize and dump toggling for this volume
    lifecycle: Mutex<()>,
    created_at: u64,
    updated_at: AtomicU64,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.name)
            .field("volume_id", &self.volume_id)
            .field("object", &self.object)
            .field("mode", &self.mode)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl Volume {
    /// Bind `name` to its backing object, creating the object when it does
    /// not exist and `logical_size` was supplied. Opens the intent log and
    /// replays pending records before returning; a replay failure is fatal
    /// for this volume only.
    pub(crate) fn open(
        store: Arc<dyn ObjectStore>,
        config: &VolumeConfig,
        name: &str,
        logical_size: Option<u64>,
        block_size: Option<u32>,
        read_only: bool,
    ) -> VolumeResult<Arc<Self>> {
        if !store.object_exists(name) {
            let size = logical_size.ok_or_else(|| VolumeError::NotFound(name.to_string()))?;
            let bs = block_size.unwrap_or(config.default_block_size);
            validate_block_size(bs)?;
            validate_volume_size(size, bs)?;

            let object = store.create_object(name, bs)?;
            let tx = store.tx_open()?;
            let staged = store
                .set_property(&tx, object, PROP_SIZE, &size.to_string())
                .and_then(|()| store.set_property(&tx, object, PROP_BLOCK_SIZE, &bs.to_string()));
            if let Err(e) = staged {
                store.tx_abort(tx);
                return Err(e);
            }
            store.tx_commit(tx)?;
        }

        let mode = if read_only {
            OpenMode::ReadOnly
        } else {
            OpenMode::Owner
        };
        let object = store.claim_object(name, mode)?;
        match Self::open_claimed(Arc::clone(&store), config, name, object, mode, read_only) {
            Ok(volume) => Ok(volume),
            Err(e) => {
                let _ = store.close_object(object);
                Err(e)
            }
        }
    }

    fn open_claimed(
        store: Arc<dyn ObjectStore>,
        config: &VolumeConfig,
        name: &str,
        object: ObjectId,
        mode: OpenMode,
        read_only: bool,
    ) -> VolumeResult<Arc<Self>> {
        let size = store
            .get_property(object, PROP_SIZE)?
            .ok_or_else(|| VolumeError::io(format!("{name}: size property is missing")))?
            .parse::<u64>()
            .map_err(|_| VolumeError::io(format!("{name}: size property is not a number")))?;
        let bs = match store.get_property(object, PROP_BLOCK_SIZE)? {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| VolumeError::io(format!("{name}: block size property is not a number")))?,
            None => store.object_block_size(object)?,
        };
        validate_block_size(bs)?;
        validate_volume_size(size, bs)?;

        let read_only_flag = Arc::new(AtomicBool::new(
            read_only || store.get_property(object, PROP_READONLY)?.as_deref() == Some("on"),
        ));
        let rlock = RangeLockTable::new();

        // Read-only opens carry no log handle; there is nothing to replay
        // and nothing new to log.
        let (bridge, replay_txg) = if read_only {
            (None, None)
        } else {
            let (bridge, stats) = IntentLogBridge::open(
                config.log_path(name),
                Arc::clone(&store),
                object,
                rlock.clone(),
                bs,
                config.immediate_write_max,
            )?;
            (Some(bridge), (stats.records > 0).then_some(stats.max_txg))
        };

        let now = chrono::Utc::now().timestamp() as u64;
        let volume = Arc::new(Self {
            name: name.to_string(),
            volume_id: Uuid::new_v4(),
            store,
            object,
            mode,
            block_size: bs,
            logical_size: AtomicU64::new(size),
            read_only: read_only_flag,
            dump_active: AtomicBool::new(false),
            bridge,
            rlock,
            queue: Arc::new(RequestQueue::new()),
            extents: Mutex::new(None),
            dump_snapshot: Mutex::new(None),
            open_count: AtomicU32::new(0),
            replay_txg: Mutex::new(replay_txg),
            lifecycle: Mutex::new(()),
            created_at: now,
            updated_at: AtomicU64::new(now),
        });

        volume.restore_dump_designation()?;
        info!(volume = name, size, block_size = bs, "opened volume");
        Ok(volume)
    }

    /// Re-arm dump mode when the persisted designation survived a restart.
    /// A designation whose map can no longer be rebuilt is dropped rather
    /// than carried stale.
    fn restore_dump_designation(&self) -> VolumeResult<()> {
        if self.store.get_property(self.object, PROP_DUMP)?.as_deref() != Some("on") {
            return Ok(());
        }
        let size = self.logical_size();
        let rebuilt = build_extent_map(&self.store, self.object, size, self.block_size).and_then(
            |map| {
                if map.total_bytes() == size {
                    Ok(map)
                } else {
                    Err(VolumeError::io(format!(
                        "extent map covers {} of {size} bytes",
                        map.total_bytes()
                    )))
                }
            },
        );
        match rebuilt {
            Ok(map) => {
                *self.extents.lock() = Some(map);
                self.dump_active.store(true, Ordering::Release);
                info!(volume = %self.name, "restored dump designation");
            }
            Err(e) => {
                warn!(volume = %self.name, error = %e, "dropping stale dump designation");
                if !self.is_read_only() {
                    let tx = self.store.tx_open()?;
                    if let Err(abort) = self.store.clear_property(&tx, self.object, PROP_DUMP) {
                        self.store.tx_abort(tx);
                        return Err(abort);
                    }
                    self.store.tx_commit(tx)?;
                }
            }
        }
        Ok(())
    }

    /// Volume name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instance id, fresh per open.
    #[must_use]
    pub const fn volume_id(&self) -> Uuid {
        self.volume_id
    }

    /// Advertised logical size in bytes.
    #[must_use]
    pub fn logical_size(&self) -> u64 {
        self.logical_size.load(Ordering::Acquire)
    }

    /// Logical block size.
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    /// How the backing object was claimed.
    #[must_use]
    pub const fn open_mode(&self) -> OpenMode {
        self.mode
    }

    /// True when writes are refused.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// True while the volume is a designated dump target.
    #[must_use]
    pub fn is_dump_active(&self) -> bool {
        self.dump_active.load(Ordering::Acquire)
    }

    /// Outstanding consumer opens.
    #[must_use]
    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    /// Creation time, seconds since the epoch.
    #[must_use]
    pub const fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Highest generation replayed at open; present until the volume is
    /// marked ready for new requests.
    pub fn pending_replay_txg(&self) -> Option<Txg> {
        *self.replay_txg.lock()
    }

    pub(crate) fn mark_ready(&self) {
        *self.replay_txg.lock() = None;
    }

    pub(crate) fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub(crate) const fn object(&self) -> ObjectId {
        self.object
    }

    pub(crate) const fn rlock(&self) -> &RangeLockTable {
        &self.rlock
    }

    pub(crate) const fn bridge(&self) -> Option<&IntentLogBridge> {
        self.bridge.as_ref()
    }

    pub(crate) const fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub(crate) fn read_only_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.read_only)
    }

    pub(crate) fn acquire(&self) {
        self.open_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        self.open_count.fetch_sub(1, Ordering::AcqRel);
    }

    fn touch(&self) {
        self.updated_at
            .store(chrono::Utc::now().timestamp() as u64, Ordering::Release);
    }

    /// Change the advertised logical size. One transaction persists the
    /// size property and frees store blocks past the new end; a shrink
    /// takes a full-volume writer range lock first so nothing is mid-flight
    /// while the backing object is truncated. When dump mode is active the
    /// extent map is discarded; the caller re-activates or deactivates
    /// dump mode explicitly.
    pub fn set_size(&self, new_size: u64) -> VolumeResult<()> {
        if self.is_read_only() {
            return Err(VolumeError::ReadOnly(self.name.clone()));
        }
        let _lifecycle = self.lifecycle.lock();
        validate_volume_size(new_size, self.block_size)?;
        let old_size = self.logical_size();
        if new_size == old_size {
            return Ok(());
        }

        let _full_lock = (new_size < old_size)
            .then(|| self.rlock.lock(ByteRange::new(0, old_size), LockMode::Writer));

        let tx = self.store.tx_open()?;
        let staged = self
            .store
            .set_property(&tx, self.object, PROP_SIZE, &new_size.to_string())
            .and_then(|()| {
                if new_size < old_size {
                    self.store
                        .free_range(&tx, self.object, new_size, old_size - new_size)
                } else {
                    Ok(())
                }
            });
        if let Err(e) = staged {
            self.store.tx_abort(tx);
            return Err(e);
        }
        self.store.tx_commit(tx)?;

        self.logical_size.store(new_size, Ordering::Release);
        if self.is_dump_active() && self.extents.lock().take().is_some() {
            warn!(volume = %self.name, "resize invalidated the dump extent map");
        }
        self.touch();
        info!(volume = %self.name, old_size, new_size, "resized volume");
        Ok(())
    }

    /// Designate the volume as a dump target: force full allocation of the
    /// backing object and pre-resolve every logical block to a physical
    /// address. A failed activation restores the volume to its prior
    /// non-dump state.
    pub fn activate_dump(&self) -> VolumeResult<()> {
        if self.is_read_only() {
            return Err(VolumeError::ReadOnly(self.name.clone()));
        }
        let _lifecycle = self.lifecycle.lock();
        let logical_size = self.logical_size();

        // Already mapped at the current size: nothing to do.
        if self.is_dump_active()
            && self
                .extents
                .lock()
                .as_ref()
                .is_some_and(|map| map.total_bytes() == logical_size)
        {
            return Ok(());
        }

        // A resize-driven re-activation keeps the earlier property
        // snapshot and only refreshes the space reservation.
        if self.is_dump_active() {
            self.update_reservation(logical_size)?;
        } else {
            self.snapshot_dump_properties(logical_size)?;
        }

        // The whole object is rewritten and walked; nothing may be
        // mid-flight anywhere in the volume until the map is in place.
        let _full_lock = self
            .rlock
            .lock(ByteRange::new(0, logical_size), LockMode::Writer);

        let built = preallocate(&self.store, self.object, logical_size, self.block_size)
            .and_then(|()| build_extent_map(&self.store, self.object, logical_size, self.block_size))
            .and_then(|map| {
                if map.total_bytes() == logical_size {
                    Ok(map)
                } else {
                    Err(VolumeError::io(format!(
                        "extent map covers {} of {logical_size} bytes",
                        map.total_bytes()
                    )))
                }
            })
            .and_then(|map| {
                self.persist_dump_designation()?;
                Ok(map)
            });

        match built {
            Ok(map) => {
                *self.extents.lock() = Some(map);
                self.dump_active.store(true, Ordering::Release);
                self.touch();
                info!(volume = %self.name, logical_size, "dump mode active");
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = self.rollback_dump() {
                    warn!(volume = %self.name, error = %cleanup, "dump rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Drop the dump designation: restore the saved properties, discard
    /// the reserved space, and free the extent map.
    pub fn deactivate_dump(&self) -> VolumeResult<()> {
        if self.is_read_only() {
            return Err(VolumeError::ReadOnly(self.name.clone()));
        }
        let _lifecycle = self.lifecycle.lock();
        if !self.is_dump_active() {
            return Ok(());
        }
        let _full_lock = self
            .rlock
            .lock(ByteRange::new(0, self.logical_size()), LockMode::Writer);
        self.rollback_dump()?;
        self.touch();
        info!(volume = %self.name, "dump mode deactivated");
        Ok(())
    }

    /// Physical address of the block holding `logical_offset`. Defined for
    /// every in-bounds offset while dump mode is active.
    pub fn resolve(&self, logical_offset: u64) -> VolumeResult<u64> {
        let extents = self.extents.lock();
        let map = extents
            .as_ref()
            .ok_or_else(|| VolumeError::io(format!("{}: dump mode is not active", self.name)))?;
        map.resolve(logical_offset)
    }

    fn snapshot_dump_properties(&self, logical_size: u64) -> VolumeResult<()> {
        let snapshot = DumpSnapshot {
            compression: self.store.get_property(self.object, PROP_COMPRESSION)?,
            checksum: self.store.get_property(self.object, PROP_CHECKSUM)?,
            reservation: self.store.get_property(self.object, PROP_RESERVATION)?,
        };

        // Dump writes land at raw physical addresses; transforms that
        // would move or rewrite blocks are turned off for the duration.
        let tx = self.store.tx_open()?;
        let staged = self
            .store
            .set_property(&tx, self.object, PROP_COMPRESSION, "off")
            .and_then(|()| self.store.set_property(&tx, self.object, PROP_CHECKSUM, "off"))
            .and_then(|()| {
                self.store
                    .set_property(&tx, self.object, PROP_RESERVATION, &logical_size.to_string())
            });
        if let Err(e) = staged {
            self.store.tx_abort(tx);
            return Err(e);
        }
        self.store.tx_commit(tx)?;
        *self.dump_snapshot.lock() = Some(snapshot);
        Ok(())
    }

    fn update_reservation(&self, logical_size: u64) -> VolumeResult<()> {
        let tx = self.store.tx_open()?;
        if let Err(e) =
            self.store
                .set_property(&tx, self.object, PROP_RESERVATION, &logical_size.to_string())
        {
            self.store.tx_abort(tx);
            return Err(e);
        }
        self.store.tx_commit(tx)?;
        Ok(())
    }

    fn persist_dump_designation(&self) -> VolumeResult<()> {
        let tx = self.store.tx_open()?;
        if let Err(e) = self.store.set_property(&tx, self.object, PROP_DUMP, "on") {
            self.store.tx_abort(tx);
            return Err(e);
        }
        self.store.tx_commit(tx)?;
        Ok(())
    }

    fn restore_property(&self, tx: &TxHandle, key: &str, value: Option<&str>) -> VolumeResult<()> {
        match value {
            Some(value) => self.store.set_property(tx, self.object, key, value),
            None => self.store.clear_property(tx, self.object, key),
        }
    }

    /// Put the volume back into its non-dump state: saved properties
    /// restored, designation cleared, reserved blocks freed, extent map
    /// discarded.
    fn rollback_dump(&self) -> VolumeResult<()> {
        let snapshot = self.dump_snapshot.lock().take().unwrap_or_default();

        let tx = self.store.tx_open()?;
        let staged = self
            .restore_property(&tx, PROP_COMPRESSION, snapshot.compression.as_deref())
            .and_then(|()| self.restore_property(&tx, PROP_CHECKSUM, snapshot.checksum.as_deref()))
            .and_then(|()| {
                self.restore_property(&tx, PROP_RESERVATION, snapshot.reservation.as_deref())
            })
            .and_then(|()| self.store.clear_property(&tx, self.object, PROP_DUMP))
            .and_then(|()| self.store.free_range(&tx, self.object, 0, u64::MAX));
        if let Err(e) = staged {
            self.store.tx_abort(tx);
            return Err(e);
        }
        self.store.tx_commit(tx)?;

        *self.extents.lock() = None;
        self.dump_active.store(false, Ordering::Release);
        Ok(())
    }

    /// Close handles in removal order: log first, then the store claim.
    /// Asserts the range-lock table is idle; the service loop must have
    /// drained before this is called.
    pub(crate) fn close(&self) -> VolumeResult<()> {
        if let Some(bridge) = &self.bridge {
            bridge.close();
        }
        self.store.close_object(self.object)?;
        self.rlock.assert_idle();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use volio_store::MemStore;

    const BS: u32 = 4096;
    const SIZE: u64 = BS as u64 * 64;

    struct Fixture {
        mem: Arc<MemStore>,
        store: Arc<dyn ObjectStore>,
        config: VolumeConfig,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let mem = Arc::new(MemStore::new());
        Fixture {
            store: Arc::clone(&mem) as Arc<dyn ObjectStore>,
            mem,
            config: VolumeConfig {
                log_dir: dir.path().to_path_buf(),
                ..VolumeConfig::default()
            },
            _dir: dir,
        }
    }

    fn open_vol(fx: &Fixture) -> Arc<Volume> {
        Volume::open(
            Arc::clone(&fx.store),
            &fx.config,
            "pool/vol",
            Some(SIZE),
            Some(BS),
            false,
        )
        .unwrap()
    }

    fn write_committed(fx: &Fixture, volume: &Volume, offset: u64, data: &[u8]) {
        let tx = fx.store.tx_open().unwrap();
        fx.store.write(&tx, volume.object(), offset, data).unwrap();
        fx.store.tx_commit(tx).unwrap();
    }

    #[test]
    fn create_persists_size_properties() {
        let fx = fixture();
        let volume = open_vol(&fx);
        assert_eq!(volume.logical_size(), SIZE);
        assert_eq!(volume.block_size(), BS);
        assert!(!volume.is_read_only());
        assert!(volume.pending_replay_txg().is_none());
        volume.close().unwrap();

        // A reopen reads the persisted properties instead of requiring a size.
        let volume =
            Volume::open(Arc::clone(&fx.store), &fx.config, "pool/vol", None, None, false).unwrap();
        assert_eq!(volume.logical_size(), SIZE);
        assert_eq!(volume.block_size(), BS);
        volume.close().unwrap();
    }

    #[test]
    fn open_without_size_for_missing_object_fails() {
        let fx = fixture();
        let err =
            Volume::open(Arc::clone(&fx.store), &fx.config, "pool/none", None, None, false)
                .unwrap_err();
        assert!(matches!(err, VolumeError::NotFound(_)));
    }

    #[test]
    fn misaligned_size_is_rejected() {
        let fx = fixture();
        let err = Volume::open(
            Arc::clone(&fx.store),
            &fx.config,
            "pool/bad",
            Some(SIZE + 1),
            Some(BS),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, VolumeError::InvalidSize { .. }));
    }

    #[test]
    fn shrink_frees_tail_blocks() {
        let fx = fixture();
        let volume = open_vol(&fx);
        write_committed(&fx, &volume, 0, &[1; BS as usize]);
        write_committed(&fx, &volume, SIZE - u64::from(BS), &[2; BS as usize]);
        assert_eq!(fx.store.space_usage().0, u64::from(BS) * 2);

        volume.set_size(SIZE / 2).unwrap();
        assert_eq!(volume.logical_size(), SIZE / 2);
        // The tail block is past the new end and was freed.
        assert_eq!(fx.store.space_usage().0, u64::from(BS));

        // Growing back does not resurrect it.
        volume.set_size(SIZE).unwrap();
        let tail = fx
            .store
            .read(volume.object(), SIZE - u64::from(BS), u64::from(BS))
            .unwrap();
        assert_eq!(&tail[..], &[0u8; BS as usize][..]);
        volume.close().unwrap();
    }

    #[test]
    fn resize_validates_alignment_and_readonly() {
        let fx = fixture();
        let volume = open_vol(&fx);
        assert!(matches!(
            volume.set_size(SIZE + 1).unwrap_err(),
            VolumeError::InvalidSize { .. }
        ));
        volume.read_only_flag().store(true, Ordering::Release);
        assert!(matches!(
            volume.set_size(SIZE * 2).unwrap_err(),
            VolumeError::ReadOnly(_)
        ));
        volume.read_only_flag().store(false, Ordering::Release);
        volume.close().unwrap();
    }

    #[test]
    fn dump_activation_maps_every_block() {
        let fx = fixture();
        let volume = open_vol(&fx);
        volume.activate_dump().unwrap();
        assert!(volume.is_dump_active());

        // Every in-bounds offset resolves; past-end fails.
        let first = fx.mem.block_pointer(volume.object(), 0).unwrap();
        assert_eq!(volume.resolve(0).unwrap(), first.phys);
        for block in 0..SIZE / u64::from(BS) {
            volume.resolve(block * u64::from(BS)).unwrap();
        }
        assert!(matches!(
            volume.resolve(SIZE).unwrap_err(),
            VolumeError::Io(_)
        ));

        // Properties were switched for dump mode and the designation persisted.
        assert_eq!(
            fx.store
                .get_property(volume.object(), PROP_RESERVATION)
                .unwrap()
                .as_deref(),
            Some(SIZE.to_string().as_str())
        );
        assert_eq!(
            fx.store
                .get_property(volume.object(), PROP_DUMP)
                .unwrap()
                .as_deref(),
            Some("on")
        );

        // Re-activating at the same size is a no-op.
        volume.activate_dump().unwrap();
        volume.close().unwrap();
    }

    #[test]
    fn dump_deactivation_restores_properties_and_space() {
        let fx = fixture();
        let volume = open_vol(&fx);

        // A pre-existing compression setting must come back afterwards.
        let tx = fx.store.tx_open().unwrap();
        fx.store
            .set_property(&tx, volume.object(), PROP_COMPRESSION, "lz4")
            .unwrap();
        fx.store.tx_commit(tx).unwrap();

        volume.activate_dump().unwrap();
        assert_eq!(
            fx.store
                .get_property(volume.object(), PROP_COMPRESSION)
                .unwrap()
                .as_deref(),
            Some("off")
        );

        volume.deactivate_dump().unwrap();
        assert!(!volume.is_dump_active());
        assert!(volume.resolve(0).is_err());
        assert_eq!(fx.store.space_usage().0, 0);
        assert_eq!(
            fx.store
                .get_property(volume.object(), PROP_COMPRESSION)
                .unwrap()
                .as_deref(),
            Some("lz4")
        );
        assert!(fx
            .store
            .get_property(volume.object(), PROP_DUMP)
            .unwrap()
            .is_none());
        assert!(fx
            .store
            .get_property(volume.object(), PROP_RESERVATION)
            .unwrap()
            .is_none());
        volume.close().unwrap();
    }

    #[test]
    fn fragmented_activation_rolls_back() {
        let fx = fixture();
        let volume = open_vol(&fx);
        fx.mem.set_gang_allocation(true);

        let err = volume.activate_dump().unwrap_err();
        assert!(matches!(err, VolumeError::Fragmented(_)));
        assert!(!volume.is_dump_active());
        assert!(volume.resolve(0).is_err());
        assert!(fx
            .store
            .get_property(volume.object(), PROP_RESERVATION)
            .unwrap()
            .is_none());
        assert_eq!(fx.store.space_usage().0, 0);

        // The volume stays usable for the transactional path.
        fx.mem.set_gang_allocation(false);
        write_committed(&fx, &volume, 0, &[9; 512]);
        volume.close().unwrap();
    }

    #[test]
    fn out_of_space_activation_rolls_back() {
        let dir = tempdir().unwrap();
        let mem = Arc::new(MemStore::with_capacity(u64::from(BS) * 8));
        let store: Arc<dyn ObjectStore> = Arc::clone(&mem) as Arc<dyn ObjectStore>;
        let config = VolumeConfig {
            log_dir: dir.path().to_path_buf(),
            ..VolumeConfig::default()
        };
        let volume =
            Volume::open(Arc::clone(&store), &config, "pool/big", Some(SIZE), Some(BS), false)
                .unwrap();

        let err = volume.activate_dump().unwrap_err();
        assert!(matches!(err, VolumeError::OutOfSpace { .. }));
        assert!(!volume.is_dump_active());
        assert_eq!(store.space_usage().0, 0);
        volume.close().unwrap();
    }

    #[test]
    fn resize_discards_dump_map_until_reactivation() {
        let fx = fixture();
        let volume = open_vol(&fx);
        volume.activate_dump().unwrap();

        volume.set_size(SIZE / 2).unwrap();
        // Designation stands, but the stale map is gone.
        assert!(volume.is_dump_active());
        assert!(volume.resolve(0).is_err());

        // Re-activation rebuilds the map at the new size.
        volume.activate_dump().unwrap();
        assert!(volume.resolve(SIZE / 2 - u64::from(BS)).is_ok());
        assert!(volume.resolve(SIZE / 2).is_err());
        volume.close().unwrap();
    }

    #[test]
    fn dump_designation_survives_reopen() {
        let fx = fixture();
        let volume = open_vol(&fx);
        volume.activate_dump().unwrap();
        let resolved = volume.resolve(0).unwrap();
        volume.close().unwrap();

        let volume =
            Volume::open(Arc::clone(&fx.store), &fx.config, "pool/vol", None, None, false).unwrap();
        assert!(volume.is_dump_active());
        assert_eq!(volume.resolve(0).unwrap(), resolved);
        volume.close().unwrap();
    }

    #[test]
    fn readonly_open_has_no_log_handle() {
        let fx = fixture();
        let volume = open_vol(&fx);
        volume.close().unwrap();

        let volume =
            Volume::open(Arc::clone(&fx.store), &fx.config, "pool/vol", None, None, true).unwrap();
        assert!(volume.is_read_only());
        assert!(volume.bridge().is_none());
        assert!(matches!(
            volume.activate_dump().unwrap_err(),
            VolumeError::ReadOnly(_)
        ));
        volume.close().unwrap();
    }
}
