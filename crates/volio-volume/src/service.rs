//! Per-volume I/O service loop
//!
//! One dedicated worker drains one volume's request queue. Requests run
//! under range locks against the store; writes append intent log records
//! inside their store transaction, strictly before it commits. Requests
//! that extend past end-of-volume complete the in-bounds portion and carry
//! a boundary error distinct from an I/O failure.

use crate::queue::{IoCompletion, Request, RequestKind, RequestQueue};
use crate::rlock::LockMode;
use crate::volume::Volume;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;
use volio_common::{ByteRange, VolumeError, VolumeResult};

/// Service loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Created, worker not yet started
    Idle,
    /// Blocking on the request queue
    Running,
    /// No new requests; in-flight ones completing
    Draining,
    /// Worker exited
    Stopped,
}

struct LoopShared {
    state: Mutex<LoopState>,
    cond: Condvar,
}

/// Dedicated worker draining one volume's request queue
pub struct ServiceLoop {
    volume: Arc<Volume>,
    shared: Arc<LoopShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceLoop {
    /// Spawn the worker thread for `volume`.
    pub fn start(volume: Arc<Volume>) -> VolumeResult<Self> {
        let shared = Arc::new(LoopShared {
            state: Mutex::new(LoopState::Idle),
            cond: Condvar::new(),
        });
        *shared.state.lock() = LoopState::Running;

        let worker_volume = Arc::clone(&volume);
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("volio-{}", volume.name().replace('/', "-")))
            .spawn(move || {
                run(&worker_volume);
                *worker_shared.state.lock() = LoopState::Stopped;
                worker_shared.cond.notify_all();
            })?;

        Ok(Self {
            volume,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Current state.
    pub fn state(&self) -> LoopState {
        *self.shared.state.lock()
    }

    /// Refuse new requests, let in-flight ones complete, and block until
    /// the worker has stopped.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if *state == LoopState::Running {
                *state = LoopState::Draining;
            }
        }
        self.volume.queue().drain();

        let mut state = self.shared.state.lock();
        while *state != LoopState::Stopped {
            self.shared.cond.wait(&mut state);
        }
        drop(state);

        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn run(volume: &Volume) {
    debug!(volume = %volume.name(), "service loop running");
    while let Some(request) = volume.queue().dequeue() {
        let completion = execute(volume, &request);
        RequestQueue::complete(request, completion);
    }
    debug!(volume = %volume.name(), "service loop drained");
}

fn execute(volume: &Volume, request: &Request) -> IoCompletion {
    match request.kind {
        RequestKind::Read => read(volume, request.offset, request.length),
        RequestKind::Write => write(volume, request.offset, request.data.clone()),
        RequestKind::Flush => flush(volume),
    }
}

fn read(volume: &Volume, offset: u64, length: u64) -> IoCompletion {
    let span = ByteRange::new(offset, length).clamp_to(volume.logical_size());
    if span.is_empty() {
        return IoCompletion {
            bytes_transferred: 0,
            data: Some(Bytes::new()),
            error: (length > 0).then_some(VolumeError::Boundary {
                bytes_transferred: 0,
            }),
        };
    }

    let _guard = volume.rlock().lock(span, LockMode::Reader);
    match volume.store().read(volume.object(), span.offset, span.length) {
        Ok(data) => IoCompletion {
            bytes_transferred: span.length,
            data: Some(data),
            error: (span.length < length).then_some(VolumeError::Boundary {
                bytes_transferred: span.length,
            }),
        },
        Err(e) => IoCompletion::failed(e),
    }
}

fn write(volume: &Volume, offset: u64, data: Option<Bytes>) -> IoCompletion {
    let Some(data) = data else {
        return IoCompletion::failed(VolumeError::io("write request without payload"));
    };
    if volume.is_read_only() {
        return IoCompletion::failed(VolumeError::ReadOnly(volume.name().to_string()));
    }

    let requested = data.len() as u64;
    let span = ByteRange::new(offset, requested).clamp_to(volume.logical_size());
    if span.is_empty() {
        return IoCompletion {
            bytes_transferred: 0,
            data: None,
            error: (requested > 0).then_some(VolumeError::Boundary {
                bytes_transferred: 0,
            }),
        };
    }
    let payload = data.slice(0..span.length as usize);

    let _guard = volume.rlock().lock(span, LockMode::Writer);
    let tx = match volume.store().tx_open() {
        Ok(tx) => tx,
        Err(e) => return IoCompletion::failed(e),
    };

    let staged = volume
        .store()
        .write(&tx, volume.object(), span.offset, &payload)
        .and_then(|()| match volume.bridge() {
            Some(bridge) => bridge.log_write(tx.txg(), span.offset, &payload),
            None => Ok(()),
        });
    if let Err(e) = staged {
        volume.store().tx_abort(tx);
        return IoCompletion::failed(e);
    }
    if let Err(e) = volume.store().tx_commit(tx) {
        return IoCompletion::failed(e);
    }

    IoCompletion {
        bytes_transferred: span.length,
        data: None,
        error: (span.length < requested).then_some(VolumeError::Boundary {
            bytes_transferred: span.length,
        }),
    }
}

fn flush(volume: &Volume) -> IoCompletion {
    let result = match volume.bridge() {
        Some(bridge) => bridge.flush(),
        None => Ok(()),
    };
    match result {
        Ok(()) => IoCompletion {
            bytes_transferred: 0,
            data: None,
            error: None,
        },
        Err(e) => IoCompletion::failed(e),
    }
}
