//! Block I/O request queue
//!
//! The queueing boundary between consumers and a volume's service loop.
//! Submission hands back a completion receiver; the worker dequeues,
//! executes, and completes. Draining refuses new requests while letting
//! in-flight ones finish.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::mpsc;
use volio_common::{VolumeError, VolumeResult};

/// Kind of a block I/O request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Read `length` bytes at `offset`
    Read,
    /// Write the payload at `offset`
    Write,
    /// Force outstanding intent log records durable
    Flush,
}

/// A queued block I/O request
pub struct Request {
    /// Request kind
    pub kind: RequestKind,
    /// Byte offset within the volume
    pub offset: u64,
    /// Requested length in bytes (reads)
    pub length: u64,
    /// Write payload
    pub data: Option<Bytes>,
    completion: mpsc::Sender<IoCompletion>,
}

/// Per-request completion status
#[derive(Debug, Clone)]
pub struct IoCompletion {
    /// Bytes actually transferred; never past end of volume
    pub bytes_transferred: u64,
    /// Bytes read (read requests)
    pub data: Option<Bytes>,
    /// Error, if any. A `Boundary` error accompanies a partial transfer.
    pub error: Option<VolumeError>,
}

impl IoCompletion {
    pub(crate) const fn failed(error: VolumeError) -> Self {
        Self {
            bytes_transferred: 0,
            data: None,
            error: Some(error),
        }
    }

    /// True when the request completed without any error condition.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Request>,
    draining: bool,
}

/// FIFO request queue with drain support
#[derive(Default)]
pub struct RequestQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl RequestQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a request. Fails with `Busy` once draining has begun.
    pub fn submit(
        &self,
        kind: RequestKind,
        offset: u64,
        length: u64,
        data: Option<Bytes>,
    ) -> VolumeResult<mpsc::Receiver<IoCompletion>> {
        let mut state = self.state.lock();
        if state.draining {
            return Err(VolumeError::Busy("volume is shutting down".to_string()));
        }
        let (tx, rx) = mpsc::channel();
        state.queue.push_back(Request {
            kind,
            offset,
            length,
            data,
            completion: tx,
        });
        self.cond.notify_one();
        Ok(rx)
    }

    /// Block until a request is available. Returns `None` once the queue
    /// is draining and empty.
    pub fn dequeue(&self) -> Option<Request> {
        let mut state = self.state.lock();
        loop {
            if let Some(request) = state.queue.pop_front() {
                return Some(request);
            }
            if state.draining {
                return None;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Stop accepting requests; wake the worker so it can finish draining.
    pub fn drain(&self) {
        let mut state = self.state.lock();
        state.draining = true;
        self.cond.notify_all();
    }

    /// Report a request's outcome to its submitter.
    pub fn complete(request: Request, completion: IoCompletion) {
        // The submitter may have gone away; that is not the worker's problem.
        let _ = request.completion.send(completion);
    }

    /// Number of requests waiting to be serviced.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.state.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_serviced_in_arrival_order() {
        let queue = RequestQueue::new();
        queue.submit(RequestKind::Read, 0, 10, None).unwrap();
        queue.submit(RequestKind::Write, 10, 10, None).unwrap();

        let first = queue.dequeue().unwrap();
        let second = queue.dequeue().unwrap();
        assert_eq!(first.kind, RequestKind::Read);
        assert_eq!(second.kind, RequestKind::Write);
    }

    #[test]
    fn drain_refuses_new_requests() {
        let queue = RequestQueue::new();
        queue.drain();
        let err = queue.submit(RequestKind::Read, 0, 10, None).unwrap_err();
        assert!(matches!(err, VolumeError::Busy(_)));
    }

    #[test]
    fn drain_lets_queued_requests_finish() {
        let queue = RequestQueue::new();
        let rx = queue.submit(RequestKind::Flush, 0, 0, None).unwrap();
        queue.drain();

        // The queued request is still served, then the queue reports empty.
        let request = queue.dequeue().unwrap();
        RequestQueue::complete(
            request,
            IoCompletion {
                bytes_transferred: 0,
                data: None,
                error: None,
            },
        );
        assert!(queue.dequeue().is_none());
        assert!(rx.recv().unwrap().is_ok());
    }
}
