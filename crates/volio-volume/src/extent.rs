//! Dump-mode extent mapping
//!
//! When a volume is a crash-dump target its writer cannot go through the
//! transactional path, so every logical block is pre-resolved to a
//! physical address. [`preallocate`] forces the backing object fully
//! resident; [`build_extent_map`] walks the block pointers into a compact
//! run-length map of constant-stride runs.

use std::sync::Arc;
use tracing::debug;
use volio_common::{ObjectId, VolumeError, VolumeResult};
use volio_store::ObjectStore;

/// A maximal run of logically contiguous blocks at constant physical stride
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Physical address of the run's first block
    pub phys_base: u64,
    /// Physical distance between consecutive blocks in the run
    pub stride: u64,
    /// Number of blocks in the run
    pub run_blocks: u64,
}

/// Ordered run list covering a volume's whole logical address space
#[derive(Debug, Clone)]
pub struct ExtentMap {
    extents: Vec<Extent>,
    block_size: u32,
}

impl ExtentMap {
    /// Runs in logical order.
    #[must_use]
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Total blocks covered by the map.
    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.extents.iter().map(|e| e.run_blocks).sum()
    }

    /// Total bytes covered by the map.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_blocks() * u64::from(self.block_size)
    }

    /// Physical address of the block containing `logical_offset`.
    pub fn resolve(&self, logical_offset: u64) -> VolumeResult<u64> {
        let block_size = u64::from(self.block_size);
        let mut block = logical_offset / block_size;
        for extent in &self.extents {
            if block < extent.run_blocks {
                return Ok(extent.phys_base + block * extent.stride);
            }
            block -= extent.run_blocks;
        }
        Err(VolumeError::io(format!(
            "logical offset {logical_offset} is outside the dump extent map"
        )))
    }
}

/// Force full allocation of the backing object: truncate to zero, then
/// write every block zero-filled, one transaction per block so no single
/// enormous transaction is required.
pub fn preallocate(
    store: &Arc<dyn ObjectStore>,
    object: ObjectId,
    logical_size: u64,
    block_size: u32,
) -> VolumeResult<()> {
    let tx = store.tx_open()?;
    store.free_range(&tx, object, 0, u64::MAX)?;
    store.tx_commit(tx)?;

    let bs = u64::from(block_size);
    let zeros = vec![0u8; block_size as usize];
    let blocks = logical_size / bs;
    for index in 0..blocks {
        let tx = store.tx_open()?;
        if let Err(e) = store.write(&tx, object, index * bs, &zeros) {
            store.tx_abort(tx);
            return Err(e);
        }
        store.tx_commit(tx)?;
    }
    debug!(object, blocks, "preallocated backing object");
    Ok(())
}

/// Walk the object's block pointers in logical order and build the run
/// list. Fails `Fragmented` on a gang allocation and `Io` on a hole.
pub fn build_extent_map(
    store: &Arc<dyn ObjectStore>,
    object: ObjectId,
    logical_size: u64,
    block_size: u32,
) -> VolumeResult<ExtentMap> {
    let bs = u64::from(block_size);
    let blocks = logical_size / bs;
    let mut extents: Vec<Extent> = Vec::new();

    for index in 0..blocks {
        let ptr = store.block_pointer(object, index)?;
        if ptr.gang {
            return Err(VolumeError::Fragmented(format!(
                "block {index} is a gang allocation"
            )));
        }
        if ptr.hole {
            return Err(VolumeError::io(format!(
                "block {index} is unallocated after preallocation"
            )));
        }

        match extents.last_mut() {
            Some(run)
                if run.run_blocks == 1 && ptr.phys > run.phys_base =>
            {
                run.stride = ptr.phys - run.phys_base;
                run.run_blocks = 2;
            }
            Some(run)
                if run.run_blocks >= 2
                    && ptr.phys == run.phys_base + run.run_blocks * run.stride =>
            {
                run.run_blocks += 1;
            }
            _ => extents.push(Extent {
                phys_base: ptr.phys,
                stride: bs,
                run_blocks: 1,
            }),
        }
    }

    debug!(object, runs = extents.len(), blocks, "built dump extent map");
    Ok(ExtentMap {
        extents,
        block_size,
    })
}
