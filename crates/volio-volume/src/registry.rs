//! Named-volume registry and lifecycle
//!
//! The one deliberate process-wide object: a map from name to volume
//! behind a single coarse lock. The lock is held only around map and
//! open-count mutation, never around I/O. All management operations —
//! create, open, remove, resize, dump toggling, read-only toggling — go
//! through the registry; teardown refuses to proceed while any volume
//! still has open handles.

use crate::queue::{IoCompletion, RequestKind};
use crate::service::ServiceLoop;
use crate::volume::{Volume, PROP_READONLY};

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;
use volio_common::{VolumeConfig, VolumeError, VolumeResult};
use volio_store::{ObjectStore, PropertyCallback, SubscriptionId};

/// Options for [`Registry::create`]
#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    /// Logical size for a volume whose backing object does not exist yet;
    /// ignored when the object is already in place
    pub logical_size: Option<u64>,
    /// Logical block size; the configured default applies when absent
    pub block_size: Option<u32>,
    /// Open without a log handle; writes are refused
    pub read_only: bool,
}

/// Size and shape of a volume as reported to management callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStats {
    /// Advertised logical size in bytes
    pub logical_size: u64,
    /// Logical block size
    pub block_size: u32,
}

struct Registered {
    volume: Arc<Volume>,
    service: ServiceLoop,
    subscription: Option<SubscriptionId>,
}

/// Process-wide registry of named volumes
pub struct Registry {
    store: Arc<dyn ObjectStore>,
    config: VolumeConfig,
    volumes: Mutex<HashMap<String, Registered>>,
    active: AtomicUsize,
}

impl Registry {
    /// Create a registry backed by `store`.
    pub fn new(store: Arc<dyn ObjectStore>, config: VolumeConfig) -> Self {
        Self {
            store,
            config,
            volumes: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
        }
    }

    /// Bind `name` to a volume: open (or create) the backing object,
    /// replay the intent log, subscribe to read-only changes, and start
    /// the service loop. Fails with `Exists` when the name is already
    /// bound; a replay failure is fatal for this volume only.
    pub fn create(&self, name: &str, opts: CreateOpts) -> VolumeResult<()> {
        if self.volumes.lock().contains_key(name) {
            return Err(VolumeError::Exists(name.to_string()));
        }

        let volume = Volume::open(
            Arc::clone(&self.store),
            &self.config,
            name,
            opts.logical_size,
            opts.block_size,
            opts.read_only,
        )?;

        // The committed read-only property drives the in-memory flag.
        let flag = volume.read_only_flag();
        let callback: PropertyCallback = Arc::new(move |_key, value| {
            flag.store(value == "on", Ordering::Release);
        });
        let subscription = match self.store.subscribe(volume.object(), PROP_READONLY, callback) {
            Ok(id) => Some(id),
            Err(e) => {
                let _ = volume.close();
                return Err(e);
            }
        };

        let service = match ServiceLoop::start(Arc::clone(&volume)) {
            Ok(service) => service,
            Err(e) => {
                if let Some(id) = subscription {
                    self.store.unsubscribe(id);
                }
                let _ = volume.close();
                return Err(e);
            }
        };
        volume.mark_ready();

        let mut volumes = self.volumes.lock();
        if volumes.contains_key(name) {
            // Lost a race with another creator; tear down our copy.
            drop(volumes);
            if let Some(id) = subscription {
                self.store.unsubscribe(id);
            }
            service.stop();
            let _ = volume.close();
            return Err(VolumeError::Exists(name.to_string()));
        }
        volumes.insert(
            name.to_string(),
            Registered {
                volume,
                service,
                subscription,
            },
        );
        drop(volumes);

        self.active.fetch_add(1, Ordering::AcqRel);
        info!(volume = name, "registered volume");
        Ok(())
    }

    /// Open a consumer handle. The volume cannot be removed while the
    /// handle is alive; dropping it releases the open count.
    pub fn open(&self, name: &str) -> VolumeResult<VolumeHandle> {
        let volumes = self.volumes.lock();
        let entry = volumes
            .get(name)
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))?;
        entry.volume.acquire();
        Ok(VolumeHandle {
            volume: Arc::clone(&entry.volume),
        })
    }

    /// Unbind `name`: drain and stop the service loop, close the log and
    /// store handles, destroy the range-lock table. Fails with `Busy`
    /// while consumer handles are outstanding.
    pub fn remove(&self, name: &str) -> VolumeResult<()> {
        let entry = {
            let mut volumes = self.volumes.lock();
            let entry = volumes
                .get(name)
                .ok_or_else(|| VolumeError::NotFound(name.to_string()))?;
            if entry.volume.open_count() > 0 {
                return Err(VolumeError::Busy(name.to_string()));
            }
            volumes
                .remove(name)
                .ok_or_else(|| VolumeError::NotFound(name.to_string()))?
        };

        if let Some(id) = entry.subscription {
            self.store.unsubscribe(id);
        }
        entry.service.stop();
        entry.volume.close()?;

        self.active.fetch_sub(1, Ordering::AcqRel);
        info!(volume = name, "removed volume");
        Ok(())
    }

    fn volume(&self, name: &str) -> VolumeResult<Arc<Volume>> {
        self.volumes
            .lock()
            .get(name)
            .map(|entry| Arc::clone(&entry.volume))
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))
    }

    /// Change a volume's advertised logical size.
    pub fn set_size(&self, name: &str, new_size: u64) -> VolumeResult<()> {
        self.volume(name)?.set_size(new_size)
    }

    /// Designate a volume as a dump target.
    pub fn activate_dump(&self, name: &str) -> VolumeResult<()> {
        self.volume(name)?.activate_dump()
    }

    /// Drop a volume's dump designation.
    pub fn deactivate_dump(&self, name: &str) -> VolumeResult<()> {
        self.volume(name)?.deactivate_dump()
    }

    /// Physical address of the block holding `logical_offset`; defined
    /// only while dump mode is active.
    pub fn resolve(&self, name: &str, logical_offset: u64) -> VolumeResult<u64> {
        self.volume(name)?.resolve(logical_offset)
    }

    /// Size and shape of a volume.
    pub fn get_stats(&self, name: &str) -> VolumeResult<VolumeStats> {
        let volume = self.volume(name)?;
        Ok(VolumeStats {
            logical_size: volume.logical_size(),
            block_size: volume.block_size(),
        })
    }

    /// Persist the read-only property; the change notification flips the
    /// volume's flag when the transaction commits.
    pub fn set_readonly(&self, name: &str, read_only: bool) -> VolumeResult<()> {
        let volume = self.volume(name)?;
        let tx = self.store.tx_open()?;
        let value = if read_only { "on" } else { "off" };
        if let Err(e) = self
            .store
            .set_property(&tx, volume.object(), PROP_READONLY, value)
        {
            self.store.tx_abort(tx);
            return Err(e);
        }
        self.store.tx_commit(tx)?;
        Ok(())
    }

    /// Number of registered volumes.
    #[must_use]
    pub fn active_volumes(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Remove every registered volume. Fails with `Busy` at the first
    /// volume that still has open handles, leaving the rest registered.
    pub fn shutdown(&self) -> VolumeResult<()> {
        let names: Vec<String> = self.volumes.lock().keys().cloned().collect();
        for name in &names {
            self.remove(name)?;
        }
        info!(volumes = names.len(), "registry shut down");
        Ok(())
    }
}

/// An open consumer handle to a registered volume
#[derive(Debug)]
pub struct VolumeHandle {
    volume: Arc<Volume>,
}

impl VolumeHandle {
    /// Volume name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.volume.name()
    }

    /// Size and shape of the volume.
    #[must_use]
    pub fn stats(&self) -> VolumeStats {
        VolumeStats {
            logical_size: self.volume.logical_size(),
            block_size: self.volume.block_size(),
        }
    }

    /// Read `length` bytes at `offset` through the service loop.
    pub fn read(&self, offset: u64, length: u64) -> VolumeResult<IoCompletion> {
        let rx = self
            .volume
            .queue()
            .submit(RequestKind::Read, offset, length, None)?;
        rx.recv()
            .map_err(|_| VolumeError::io("service loop went away"))
    }

    /// Write `data` at `offset` through the service loop.
    pub fn write(&self, offset: u64, data: Bytes) -> VolumeResult<IoCompletion> {
        let length = data.len() as u64;
        let rx = self
            .volume
            .queue()
            .submit(RequestKind::Write, offset, length, Some(data))?;
        rx.recv()
            .map_err(|_| VolumeError::io("service loop went away"))
    }

    /// Force outstanding intent log records durable.
    pub fn flush(&self) -> VolumeResult<IoCompletion> {
        let rx = self.volume.queue().submit(RequestKind::Flush, 0, 0, None)?;
        rx.recv()
            .map_err(|_| VolumeError::io("service loop went away"))
    }
}

impl Drop for VolumeHandle {
    fn drop(&mut self) {
        self.volume.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use volio_log::{
        AppendPayload, IndirectResolver, IntentLog, RecordPointer, RECORD_WRITE,
    };
    use volio_store::MemStore;

    const MIB: u64 = 1024 * 1024;
    const BS: u32 = 4096;
    const VOL: &str = "pool/vol0";

    struct Harness {
        registry: Registry,
        mem: Arc<MemStore>,
        config: VolumeConfig,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let mem = Arc::new(MemStore::new());
        let config = VolumeConfig {
            log_dir: dir.path().to_path_buf(),
            ..VolumeConfig::default()
        };
        Harness {
            registry: Registry::new(
                Arc::clone(&mem) as Arc<dyn ObjectStore>,
                config.clone(),
            ),
            mem,
            config,
            _dir: dir,
        }
    }

    fn create_vol0(h: &Harness) {
        h.registry
            .create(
                VOL,
                CreateOpts {
                    logical_size: Some(MIB),
                    block_size: Some(BS),
                    ..CreateOpts::default()
                },
            )
            .unwrap();
    }

    struct NoopResolver;
    impl IndirectResolver for NoopResolver {
        fn resolve(
            &self,
            _offset: u64,
            _length: u64,
            _buf: Option<&mut Vec<u8>>,
        ) -> VolumeResult<Option<RecordPointer>> {
            Err(VolumeError::io("no indirect records expected"))
        }
    }

    #[test]
    fn write_then_read_roundtrip() {
        let h = harness();
        create_vol0(&h);
        let handle = h.registry.open(VOL).unwrap();
        let pattern = Bytes::from(vec![0xA5u8; BS as usize]);

        let wrote = handle.write(0, pattern.clone()).unwrap();
        assert!(wrote.is_ok());
        assert_eq!(wrote.bytes_transferred, u64::from(BS));

        let got = handle.read(0, u64::from(BS)).unwrap();
        assert!(got.is_ok());
        assert_eq!(got.data.unwrap(), pattern);

        assert_eq!(
            handle.stats(),
            VolumeStats {
                logical_size: MIB,
                block_size: BS
            }
        );
        drop(handle);
        h.registry.shutdown().unwrap();
    }

    #[test]
    fn boundary_write_reports_partial_transfer() {
        let h = harness();
        create_vol0(&h);
        let handle = h.registry.open(VOL).unwrap();

        // Crosses end-of-volume by one block: only the in-bounds block lands.
        let offset = MIB - u64::from(BS);
        let pattern_b = Bytes::from(vec![0xB0u8; BS as usize * 2]);
        let wrote = handle.write(offset, pattern_b.clone()).unwrap();
        assert_eq!(wrote.bytes_transferred, u64::from(BS));
        assert!(matches!(
            wrote.error,
            Some(VolumeError::Boundary {
                bytes_transferred
            }) if bytes_transferred == u64::from(BS)
        ));

        let got = handle.read(offset, u64::from(BS)).unwrap();
        assert_eq!(&got.data.unwrap()[..], &pattern_b[..BS as usize]);
        drop(handle);
        h.registry.shutdown().unwrap();
    }

    #[test]
    fn crash_replay_applies_logged_write() {
        let h = harness();

        // Simulate a crashed writer: a durable log record for a write the
        // store never saw.
        let pattern = Bytes::from(vec![0xC3u8; BS as usize]);
        {
            let log = IntentLog::open(h.config.log_path(VOL)).unwrap();
            log.append(
                RECORD_WRITE,
                5,
                u64::from(BS) * 2,
                u64::from(BS),
                AppendPayload::Immediate(pattern.clone()),
            )
            .unwrap();
            log.commit_all(&NoopResolver).unwrap();
        }

        // Opening the volume replays the record before serving requests.
        create_vol0(&h);
        let handle = h.registry.open(VOL).unwrap();
        let got = handle.read(u64::from(BS) * 2, u64::from(BS)).unwrap();
        assert_eq!(got.data.unwrap(), pattern);
        drop(handle);
        h.registry.shutdown().unwrap();
    }

    #[test]
    fn dump_activation_resolves_every_block() {
        let h = harness();
        create_vol0(&h);
        h.registry.activate_dump(VOL).unwrap();

        // resolve(0) names the first run's base address.
        let object = h.registry.volume(VOL).unwrap().object();
        let first = h.mem.block_pointer(object, 0).unwrap();
        assert_eq!(h.registry.resolve(VOL, 0).unwrap(), first.phys);

        // Defined across the whole volume, distinct per block.
        let mut seen = std::collections::HashSet::new();
        for block in 0..MIB / u64::from(BS) {
            let phys = h.registry.resolve(VOL, block * u64::from(BS)).unwrap();
            assert!(seen.insert(phys));
        }
        assert!(matches!(
            h.registry.resolve(VOL, MIB).unwrap_err(),
            VolumeError::Io(_)
        ));

        h.registry.deactivate_dump(VOL).unwrap();
        assert!(h.registry.resolve(VOL, 0).is_err());
        h.registry.shutdown().unwrap();
    }

    #[test]
    fn remove_busy_until_handles_close() {
        let h = harness();
        create_vol0(&h);
        let handle = h.registry.open(VOL).unwrap();

        assert!(matches!(
            h.registry.remove(VOL).unwrap_err(),
            VolumeError::Busy(_)
        ));
        drop(handle);
        h.registry.remove(VOL).unwrap();
        assert_eq!(h.registry.active_volumes(), 0);
        assert!(matches!(
            h.registry.open(VOL).unwrap_err(),
            VolumeError::NotFound(_)
        ));
    }

    #[test]
    fn duplicate_create_reports_exists() {
        let h = harness();
        create_vol0(&h);
        let err = h
            .registry
            .create(
                VOL,
                CreateOpts {
                    logical_size: Some(MIB),
                    ..CreateOpts::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, VolumeError::Exists(_)));
        h.registry.shutdown().unwrap();
    }

    #[test]
    fn resize_invalidates_dump_map_until_reactivation() {
        let h = harness();
        create_vol0(&h);
        h.registry.activate_dump(VOL).unwrap();
        assert!(h.registry.resolve(VOL, 0).is_ok());

        h.registry.set_size(VOL, MIB / 2).unwrap();
        assert_eq!(h.registry.get_stats(VOL).unwrap().logical_size, MIB / 2);
        assert!(h.registry.resolve(VOL, 0).is_err());

        h.registry.activate_dump(VOL).unwrap();
        assert!(h.registry.resolve(VOL, MIB / 2 - u64::from(BS)).is_ok());
        assert!(h.registry.resolve(VOL, MIB / 2).is_err());
        h.registry.shutdown().unwrap();
    }

    #[test]
    fn readonly_toggle_blocks_writes_via_notification() {
        let h = harness();
        create_vol0(&h);
        let handle = h.registry.open(VOL).unwrap();

        h.registry.set_readonly(VOL, true).unwrap();
        let wrote = handle.write(0, Bytes::from_static(&[1; 16])).unwrap();
        assert!(matches!(wrote.error, Some(VolumeError::ReadOnly(_))));

        h.registry.set_readonly(VOL, false).unwrap();
        assert!(handle.write(0, Bytes::from_static(&[1; 16])).unwrap().is_ok());
        drop(handle);
        h.registry.shutdown().unwrap();
    }

    #[test]
    fn shutdown_requires_all_handles_closed() {
        let h = harness();
        create_vol0(&h);
        let handle = h.registry.open(VOL).unwrap();

        assert!(matches!(
            h.registry.shutdown().unwrap_err(),
            VolumeError::Busy(_)
        ));
        assert_eq!(h.registry.active_volumes(), 1);

        drop(handle);
        h.registry.shutdown().unwrap();
        assert_eq!(h.registry.active_volumes(), 0);
    }
}
