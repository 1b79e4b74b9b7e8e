//! In-memory transactional object store
//!
//! Backs tests and in-process embedding. Mutations are staged per
//! transaction and applied atomically at commit, blocks carry physical
//! addresses so the dump-mode extent walk has something real to resolve,
//! and capacity accounting makes space exhaustion observable.

use crate::store::{
    BlockPtr, ObjectStore, OpenMode, PropertyCallback, SubscriptionId, SyncCallback, SyncStatus,
    TxHandle,
};

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;
use volio_common::{ObjectId, Txg, VolumeError, VolumeResult};

/// Default capacity: 1 TiB
const DEFAULT_CAPACITY: u64 = 1 << 40;

struct MemBlock {
    data: Vec<u8>,
    phys: u64,
    birth_txg: Txg,
    gang: bool,
}

struct MemObject {
    name: String,
    block_size: u32,
    blocks: BTreeMap<u64, MemBlock>,
    properties: HashMap<String, String>,
    owner_open: bool,
    open_count: u32,
}

enum Op {
    Write {
        object: ObjectId,
        offset: u64,
        data: Vec<u8>,
    },
    FreeRange {
        object: ObjectId,
        offset: u64,
        length: u64,
    },
    SetBlockSize {
        object: ObjectId,
        block_size: u32,
    },
    SetProperty {
        object: ObjectId,
        key: String,
        value: String,
    },
    ClearProperty {
        object: ObjectId,
        key: String,
    },
}

struct TxState {
    txg: Txg,
    ops: Vec<Op>,
    reserved: u64,
    staged_blocks: HashSet<(ObjectId, u64)>,
}

struct Subscription {
    object: ObjectId,
    key: String,
    callback: PropertyCallback,
}

struct PendingSync {
    object: ObjectId,
    block: u64,
    on_done: SyncCallback,
}

struct Inner {
    objects: HashMap<ObjectId, MemObject>,
    names: HashMap<String, ObjectId>,
    /// physical address -> (object, block index)
    phys_index: HashMap<u64, (ObjectId, u64)>,
    txs: HashMap<u64, TxState>,
    subs: HashMap<SubscriptionId, Subscription>,
    pending_syncs: Vec<PendingSync>,
    next_object: ObjectId,
    next_tx: u64,
    next_sub: SubscriptionId,
    next_phys: u64,
    alloc_count: u64,
    txg: Txg,
    capacity: u64,
    used: u64,
    reserved: u64,
    scattered: bool,
    gang_alloc: bool,
    defer_sync: bool,
}

type Notification = (PropertyCallback, String, String);

impl Inner {
    fn object(&self, id: ObjectId) -> VolumeResult<&MemObject> {
        self.objects
            .get(&id)
            .ok_or_else(|| VolumeError::io(format!("unknown object {id}")))
    }

    fn object_mut(&mut self, id: ObjectId) -> VolumeResult<&mut MemObject> {
        self.objects
            .get_mut(&id)
            .ok_or_else(|| VolumeError::io(format!("unknown object {id}")))
    }

    fn tx_state(&mut self, tx: &TxHandle) -> VolumeResult<&mut TxState> {
        self.txs
            .get_mut(&tx.id())
            .ok_or_else(|| VolumeError::io("transaction is not open"))
    }

    fn alloc_phys(&mut self, block_size: u64) -> u64 {
        let gap = if self.scattered {
            (self.alloc_count % 3) * block_size
        } else {
            0
        };
        self.alloc_count += 1;
        let phys = self.next_phys + gap;
        self.next_phys = phys + block_size;
        phys
    }

    fn apply_write(
        &mut self,
        object: ObjectId,
        offset: u64,
        data: &[u8],
        txg: Txg,
    ) -> VolumeResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let bs = u64::from(self.object(object)?.block_size);
        let first = offset / bs;
        let last = (offset + data.len() as u64 - 1) / bs;

        // Allocate physical addresses for blocks that do not exist yet.
        let mut allocs: Vec<(u64, u64)> = Vec::new();
        for index in first..=last {
            if !self.object(object)?.blocks.contains_key(&index) {
                let phys = self.alloc_phys(bs);
                allocs.push((index, phys));
            }
        }
        for (index, phys) in &allocs {
            self.phys_index.insert(*phys, (object, *index));
            self.used += bs;
        }

        let gang = self.gang_alloc;
        let obj = self.object_mut(object)?;
        let block_size = obj.block_size as usize;
        for (index, phys) in allocs {
            obj.blocks.insert(
                index,
                MemBlock {
                    data: vec![0u8; block_size],
                    phys,
                    birth_txg: txg,
                    gang,
                },
            );
        }

        let mut copied = 0usize;
        for index in first..=last {
            let block_start = index * bs;
            let from = offset.max(block_start);
            let to = (offset + data.len() as u64).min(block_start + bs);
            let len = (to - from) as usize;
            let in_block = (from - block_start) as usize;

            let block = obj
                .blocks
                .get_mut(&index)
                .ok_or_else(|| VolumeError::io("block vanished during write"))?;
            block.data[in_block..in_block + len].copy_from_slice(&data[copied..copied + len]);
            block.birth_txg = txg;
            copied += len;
        }
        Ok(())
    }

    fn apply_free_range(&mut self, object: ObjectId, offset: u64, length: u64) -> VolumeResult<()> {
        let bs = u64::from(self.object(object)?.block_size);
        let end = offset.saturating_add(length);

        let obj = self.object_mut(object)?;
        let freed: Vec<u64> = obj
            .blocks
            .iter()
            .filter(|(index, _)| {
                let block_start = **index * bs;
                block_start >= offset && block_start + bs <= end
            })
            .map(|(index, _)| *index)
            .collect();

        let mut freed_phys = Vec::with_capacity(freed.len());
        for index in &freed {
            if let Some(block) = obj.blocks.remove(index) {
                freed_phys.push(block.phys);
            }
        }
        for phys in freed_phys {
            self.phys_index.remove(&phys);
            self.used = self.used.saturating_sub(bs);
        }
        Ok(())
    }

    /// Drain pending sync requests whose block is now durable. Returns the
    /// completions to invoke after the store lock is released.
    fn take_ready_syncs(&mut self) -> Vec<(SyncCallback, VolumeResult<BlockPtr>)> {
        let mut ready = Vec::new();
        let mut keep = Vec::new();
        for pending in self.pending_syncs.drain(..) {
            let ptr = self
                .objects
                .get(&pending.object)
                .and_then(|obj| obj.blocks.get(&pending.block))
                .map(|block| BlockPtr {
                    phys: block.phys,
                    birth_txg: block.birth_txg,
                    gang: block.gang,
                    hole: false,
                });
            match ptr {
                Some(ptr) => ready.push((pending.on_done, Ok(ptr))),
                None => keep.push(pending),
            }
        }
        self.pending_syncs = keep;
        ready
    }
}

/// In-memory implementation of [`ObjectStore`]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// Create a store with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a store holding at most `capacity` bytes of block data.
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: HashMap::new(),
                names: HashMap::new(),
                phys_index: HashMap::new(),
                txs: HashMap::new(),
                subs: HashMap::new(),
                pending_syncs: Vec::new(),
                next_object: 1,
                next_tx: 1,
                next_sub: 1,
                next_phys: 4096,
                alloc_count: 0,
                txg: 1,
                capacity,
                used: 0,
                reserved: 0,
                scattered: false,
                gang_alloc: false,
                defer_sync: false,
            }),
        }
    }

    /// Scatter physical allocations so consecutive blocks stop forming a
    /// single constant-stride run.
    pub fn set_scattered_allocation(&self, scattered: bool) {
        self.inner.lock().scattered = scattered;
    }

    /// Mark every block allocated while enabled as a gang allocation.
    pub fn set_gang_allocation(&self, gang: bool) {
        self.inner.lock().gang_alloc = gang;
    }

    /// Hold sync-block completions until [`Self::fire_pending_syncs`].
    pub fn set_deferred_sync(&self, defer: bool) {
        self.inner.lock().defer_sync = defer;
    }

    /// Complete every pending sync whose block is durable.
    pub fn fire_pending_syncs(&self) {
        let ready = self.inner.lock().take_ready_syncs();
        for (on_done, result) in ready {
            on_done(result);
        }
    }

    /// Mark an allocated block as a gang allocation.
    pub fn inject_gang(&self, object: ObjectId, block_index: u64) -> VolumeResult<()> {
        let mut inner = self.inner.lock();
        let obj = inner.object_mut(object)?;
        let block = obj
            .blocks
            .get_mut(&block_index)
            .ok_or_else(|| VolumeError::io(format!("block {block_index} is not allocated")))?;
        block.gang = true;
        Ok(())
    }

    /// Current committed transaction generation.
    #[must_use]
    pub fn current_txg(&self) -> Txg {
        self.inner.lock().txg
    }
}

impl ObjectStore for MemStore {
    fn create_object(&self, name: &str, block_size: u32) -> VolumeResult<ObjectId> {
        let mut inner = self.inner.lock();
        if inner.names.contains_key(name) {
            return Err(VolumeError::Exists(name.to_string()));
        }
        let id = inner.next_object;
        inner.next_object += 1;
        inner.objects.insert(
            id,
            MemObject {
                name: name.to_string(),
                block_size,
                blocks: BTreeMap::new(),
                properties: HashMap::new(),
                owner_open: false,
                open_count: 0,
            },
        );
        inner.names.insert(name.to_string(), id);
        debug!(name, id, block_size, "created object");
        Ok(id)
    }

    fn claim_object(&self, name: &str, mode: OpenMode) -> VolumeResult<ObjectId> {
        let mut inner = self.inner.lock();
        let id = *inner
            .names
            .get(name)
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))?;
        let obj = inner.object_mut(id)?;
        if matches!(mode, OpenMode::Owner) {
            if obj.owner_open {
                return Err(VolumeError::Busy(name.to_string()));
            }
            obj.owner_open = true;
        }
        obj.open_count += 1;
        Ok(id)
    }

    fn close_object(&self, object: ObjectId) -> VolumeResult<()> {
        let mut inner = self.inner.lock();
        let obj = inner.object_mut(object)?;
        obj.open_count = obj.open_count.saturating_sub(1);
        if obj.open_count == 0 {
            obj.owner_open = false;
        }
        Ok(())
    }

    fn object_exists(&self, name: &str) -> bool {
        self.inner.lock().names.contains_key(name)
    }

    fn tx_open(&self) -> VolumeResult<TxHandle> {
        let mut inner = self.inner.lock();
        let txg = inner.txg + 1;
        let id = inner.next_tx;
        inner.next_tx += 1;
        inner.txs.insert(
            id,
            TxState {
                txg,
                ops: Vec::new(),
                reserved: 0,
                staged_blocks: HashSet::new(),
            },
        );
        Ok(TxHandle::new(id, txg))
    }

    fn tx_open_at(&self, txg: Txg) -> VolumeResult<TxHandle> {
        let mut inner = self.inner.lock();
        let id = inner.next_tx;
        inner.next_tx += 1;
        inner.txs.insert(
            id,
            TxState {
                txg,
                ops: Vec::new(),
                reserved: 0,
                staged_blocks: HashSet::new(),
            },
        );
        Ok(TxHandle::new(id, txg))
    }

    fn tx_commit(&self, tx: TxHandle) -> VolumeResult<Txg> {
        let (txg, notifications, completions) = {
            let mut inner = self.inner.lock();
            let state = inner
                .txs
                .remove(&tx.id())
                .ok_or_else(|| VolumeError::io("transaction is not open"))?;
            inner.reserved = inner.reserved.saturating_sub(state.reserved);

            let mut notifications: Vec<Notification> = Vec::new();
            for op in state.ops {
                match op {
                    Op::Write {
                        object,
                        offset,
                        data,
                    } => inner.apply_write(object, offset, &data, state.txg)?,
                    Op::FreeRange {
                        object,
                        offset,
                        length,
                    } => inner.apply_free_range(object, offset, length)?,
                    Op::SetBlockSize { object, block_size } => {
                        let obj = inner.object_mut(object)?;
                        if !obj.blocks.is_empty() {
                            return Err(VolumeError::io(
                                "cannot change block size of a non-empty object",
                            ));
                        }
                        obj.block_size = block_size;
                    }
                    Op::SetProperty { object, key, value } => {
                        let obj = inner.object_mut(object)?;
                        obj.properties.insert(key.clone(), value.clone());
                        for sub in inner.subs.values() {
                            if sub.object == object && sub.key == key {
                                notifications.push((
                                    sub.callback.clone(),
                                    key.clone(),
                                    value.clone(),
                                ));
                            }
                        }
                    }
                    Op::ClearProperty { object, key } => {
                        inner.object_mut(object)?.properties.remove(&key);
                    }
                }
            }

            inner.txg = inner.txg.max(state.txg);
            let completions = if inner.defer_sync {
                Vec::new()
            } else {
                inner.take_ready_syncs()
            };
            (inner.txg, notifications, completions)
        };

        // Callbacks run outside the store lock.
        for (callback, key, value) in notifications {
            callback(&key, &value);
        }
        for (on_done, result) in completions {
            on_done(result);
        }
        Ok(txg)
    }

    fn tx_abort(&self, tx: TxHandle) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.txs.remove(&tx.id()) {
            inner.reserved = inner.reserved.saturating_sub(state.reserved);
        }
    }

    fn read(&self, object: ObjectId, offset: u64, length: u64) -> VolumeResult<Bytes> {
        let inner = self.inner.lock();
        let obj = inner.object(object)?;
        let bs = u64::from(obj.block_size);
        let mut out = vec![0u8; length as usize];
        if length == 0 {
            return Ok(Bytes::new());
        }

        let first = offset / bs;
        let last = (offset + length - 1) / bs;
        for index in first..=last {
            if let Some(block) = obj.blocks.get(&index) {
                let block_start = index * bs;
                let from = offset.max(block_start);
                let to = (offset + length).min(block_start + bs);
                let len = (to - from) as usize;
                let in_block = (from - block_start) as usize;
                let in_out = (from - offset) as usize;
                out[in_out..in_out + len]
                    .copy_from_slice(&block.data[in_block..in_block + len]);
            }
        }
        Ok(Bytes::from(out))
    }

    fn write(
        &self,
        tx: &TxHandle,
        object: ObjectId,
        offset: u64,
        data: &[u8],
    ) -> VolumeResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let bs = u64::from(inner.object(object)?.block_size);
        let first = offset / bs;
        let last = (offset + data.len() as u64 - 1) / bs;

        // Reserve space for blocks this write allocates.
        let mut charge = 0u64;
        let mut new_blocks = Vec::new();
        {
            let existing = &inner.object(object)?.blocks;
            let state = inner
                .txs
                .get(&tx.id())
                .ok_or_else(|| VolumeError::io("transaction is not open"))?;
            for index in first..=last {
                if !existing.contains_key(&index)
                    && !state.staged_blocks.contains(&(object, index))
                {
                    charge += bs;
                    new_blocks.push(index);
                }
            }
        }
        let available = inner.capacity - inner.used - inner.reserved;
        if charge > available {
            return Err(VolumeError::OutOfSpace {
                required: charge,
                available,
            });
        }

        inner.reserved += charge;
        let state = inner.tx_state(tx)?;
        state.reserved += charge;
        for index in new_blocks {
            state.staged_blocks.insert((object, index));
        }
        state.ops.push(Op::Write {
            object,
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn free_range(
        &self,
        tx: &TxHandle,
        object: ObjectId,
        offset: u64,
        length: u64,
    ) -> VolumeResult<()> {
        let mut inner = self.inner.lock();
        inner.object(object)?;
        inner.tx_state(tx)?.ops.push(Op::FreeRange {
            object,
            offset,
            length,
        });
        Ok(())
    }

    fn set_block_size(
        &self,
        tx: &TxHandle,
        object: ObjectId,
        block_size: u32,
    ) -> VolumeResult<()> {
        let mut inner = self.inner.lock();
        let obj = inner.object(object)?;
        if !obj.blocks.is_empty() {
            return Err(VolumeError::io(
                "cannot change block size of a non-empty object",
            ));
        }
        inner
            .tx_state(tx)?
            .ops
            .push(Op::SetBlockSize { object, block_size });
        Ok(())
    }

    fn object_block_size(&self, object: ObjectId) -> VolumeResult<u32> {
        Ok(self.inner.lock().object(object)?.block_size)
    }

    fn space_usage(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.used, inner.capacity - inner.used - inner.reserved)
    }

    fn block_pointer(&self, object: ObjectId, block_index: u64) -> VolumeResult<BlockPtr> {
        let inner = self.inner.lock();
        let obj = inner.object(object)?;
        Ok(obj.blocks.get(&block_index).map_or(
            BlockPtr {
                phys: 0,
                birth_txg: 0,
                gang: false,
                hole: true,
            },
            |block| BlockPtr {
                phys: block.phys,
                birth_txg: block.birth_txg,
                gang: block.gang,
                hole: false,
            },
        ))
    }

    fn read_physical(&self, phys: u64) -> VolumeResult<Bytes> {
        let inner = self.inner.lock();
        let (object, index) = *inner
            .phys_index
            .get(&phys)
            .ok_or_else(|| VolumeError::io(format!("no block at physical address {phys:#x}")))?;
        let obj = inner.object(object)?;
        let block = obj
            .blocks
            .get(&index)
            .ok_or_else(|| VolumeError::io("physical index out of sync"))?;
        Ok(Bytes::from(block.data.clone()))
    }

    fn sync_block(
        &self,
        object: ObjectId,
        block_index: u64,
        on_done: SyncCallback,
    ) -> VolumeResult<SyncStatus> {
        let mut inner = self.inner.lock();
        inner.object(object)?;
        if !inner.defer_sync
            && let Some(block) = inner
                .objects
                .get(&object)
                .and_then(|obj| obj.blocks.get(&block_index))
        {
            return Ok(SyncStatus::Done(BlockPtr {
                phys: block.phys,
                birth_txg: block.birth_txg,
                gang: block.gang,
                hole: false,
            }));
        }
        inner.pending_syncs.push(PendingSync {
            object,
            block: block_index,
            on_done,
        });
        Ok(SyncStatus::Pending)
    }

    fn get_property(&self, object: ObjectId, key: &str) -> VolumeResult<Option<String>> {
        let inner = self.inner.lock();
        Ok(inner.object(object)?.properties.get(key).cloned())
    }

    fn set_property(
        &self,
        tx: &TxHandle,
        object: ObjectId,
        key: &str,
        value: &str,
    ) -> VolumeResult<()> {
        let mut inner = self.inner.lock();
        inner.object(object)?;
        inner.tx_state(tx)?.ops.push(Op::SetProperty {
            object,
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    fn clear_property(&self, tx: &TxHandle, object: ObjectId, key: &str) -> VolumeResult<()> {
        let mut inner = self.inner.lock();
        inner.object(object)?;
        inner.tx_state(tx)?.ops.push(Op::ClearProperty {
            object,
            key: key.to_string(),
        });
        Ok(())
    }

    fn subscribe(
        &self,
        object: ObjectId,
        key: &str,
        callback: PropertyCallback,
    ) -> VolumeResult<SubscriptionId> {
        let mut inner = self.inner.lock();
        inner.object(object)?;
        let id = inner.next_sub;
        inner.next_sub += 1;
        inner.subs.insert(
            id,
            Subscription {
                object,
                key: key.to_string(),
                callback,
            },
        );
        Ok(id)
    }

    fn unsubscribe(&self, subscription: SubscriptionId) {
        self.inner.lock().subs.remove(&subscription);
    }
}
