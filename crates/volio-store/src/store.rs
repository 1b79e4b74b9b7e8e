//! Object store trait and boundary types

use bytes::Bytes;
use std::sync::Arc;
use volio_common::{ObjectId, Txg, VolumeResult};

/// How an object is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Exclusive owner: reads, transactional writes, property changes
    Owner,
    /// Shared read-only access
    ReadOnly,
}

/// Resolved location of one logical block inside the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPtr {
    /// Physical byte address of the block
    pub phys: u64,
    /// Transaction generation that wrote the block
    pub birth_txg: Txg,
    /// Multi-fragment allocation with no single physical address
    pub gang: bool,
    /// Never written; reads as zeros
    pub hole: bool,
}

/// An open store transaction
///
/// Issued by [`ObjectStore::tx_open`]; every staged mutation names the
/// handle, and the handle is consumed by commit or abort.
#[derive(Debug)]
pub struct TxHandle {
    id: u64,
    txg: Txg,
}

impl TxHandle {
    pub(crate) const fn new(id: u64, txg: Txg) -> Self {
        Self { id, txg }
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    /// Generation this transaction will commit in
    #[must_use]
    pub const fn txg(&self) -> Txg {
        self.txg
    }
}

/// Outcome of a synchronous block sync request
pub enum SyncStatus {
    /// The block is already durable; its pointer is resolved now and the
    /// completion callback will not be invoked
    Done(BlockPtr),
    /// The block is pinned; the completion callback fires with the final
    /// pointer once the store writes it out
    Pending,
}

/// Completion for a pending [`ObjectStore::sync_block`]
pub type SyncCallback = Box<dyn FnOnce(VolumeResult<BlockPtr>) + Send + 'static>;

/// Property change notification: `(key, new_value)`
pub type PropertyCallback = Arc<dyn Fn(&str, &str) + Send + Sync + 'static>;

/// Handle for cancelling a property subscription
pub type SubscriptionId = u64;

/// The transactional object store the volume layer runs against.
///
/// Implementations must be callable concurrently from multiple volume
/// workers plus the registry's lifecycle path.
pub trait ObjectStore: Send + Sync {
    /// Create a new object bound to `name`. Fails if the name is taken.
    fn create_object(&self, name: &str, block_size: u32) -> VolumeResult<ObjectId>;

    /// Open an existing object by name. `Owner` mode is exclusive.
    fn claim_object(&self, name: &str, mode: OpenMode) -> VolumeResult<ObjectId>;

    /// Release one open of the object.
    fn close_object(&self, object: ObjectId) -> VolumeResult<()>;

    /// True when `name` is bound to an object.
    fn object_exists(&self, name: &str) -> bool;

    /// Open a transaction in the next generation. May block under
    /// store-side admission control.
    fn tx_open(&self) -> VolumeResult<TxHandle>;

    /// Open a transaction tagged with an explicit generation; used by log
    /// replay to re-apply records in their recorded generation.
    fn tx_open_at(&self, txg: Txg) -> VolumeResult<TxHandle>;

    /// Commit all staged mutations atomically; returns the generation.
    fn tx_commit(&self, tx: TxHandle) -> VolumeResult<Txg>;

    /// Discard all staged mutations.
    fn tx_abort(&self, tx: TxHandle);

    /// Read committed bytes. Holes read as zeros.
    fn read(&self, object: ObjectId, offset: u64, length: u64) -> VolumeResult<Bytes>;

    /// Stage a write. Space for newly allocated blocks is reserved here so
    /// exhaustion reports synchronously.
    fn write(&self, tx: &TxHandle, object: ObjectId, offset: u64, data: &[u8])
    -> VolumeResult<()>;

    /// Stage freeing of every block fully contained in the byte range.
    fn free_range(
        &self,
        tx: &TxHandle,
        object: ObjectId,
        offset: u64,
        length: u64,
    ) -> VolumeResult<()>;

    /// Stage a block-size change; only legal while the object holds no blocks.
    fn set_block_size(&self, tx: &TxHandle, object: ObjectId, block_size: u32)
    -> VolumeResult<()>;

    /// Block size of an object.
    fn object_block_size(&self, object: ObjectId) -> VolumeResult<u32>;

    /// `(used, available)` bytes.
    fn space_usage(&self) -> (u64, u64);

    /// Pointer of one logical block.
    fn block_pointer(&self, object: ObjectId, block_index: u64) -> VolumeResult<BlockPtr>;

    /// Read a whole block by physical address.
    fn read_physical(&self, phys: u64) -> VolumeResult<Bytes>;

    /// Request the final pointer of a block being written. Returns
    /// [`SyncStatus::Done`] when the block is already durable; otherwise
    /// the block is pinned and `on_done` fires at the next commit.
    fn sync_block(
        &self,
        object: ObjectId,
        block_index: u64,
        on_done: SyncCallback,
    ) -> VolumeResult<SyncStatus>;

    /// Read a committed property.
    fn get_property(&self, object: ObjectId, key: &str) -> VolumeResult<Option<String>>;

    /// Stage a property write; subscribers are notified on commit.
    fn set_property(
        &self,
        tx: &TxHandle,
        object: ObjectId,
        key: &str,
        value: &str,
    ) -> VolumeResult<()>;

    /// Stage removal of a property.
    fn clear_property(&self, tx: &TxHandle, object: ObjectId, key: &str) -> VolumeResult<()>;

    /// Register for change notification on one property of one object.
    fn subscribe(
        &self,
        object: ObjectId,
        key: &str,
        callback: PropertyCallback,
    ) -> VolumeResult<SubscriptionId>;

    /// Drop a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, subscription: SubscriptionId);
}
