/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The copy engine: a worker thread draining a queue of cross-process copy
//! requests.
//!
//! Copies run off the channel loop so a slow or faulting copy never stalls
//! protocol processing. Requests execute one at a time in FIFO order; a copy
//! failure is reported to its requester and the worker moves on. Only the
//! shutdown sentinel (`None` in the queue) ends the worker.

use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use nix::unistd::Pid;

use crate::error::Error;
use crate::sys;

/// Completion callback for a copy request. Invoked exactly once, on the
/// worker thread.
pub(super) type CopyCallback = Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

/// One cross-process copy: read `len` bytes at `remote_addr` in
/// `remote_pid`'s address space into `local_addr` here.
pub(super) struct CopyRequest {
    pub(super) remote_pid: Pid,
    pub(super) remote_addr: usize,
    pub(super) local_addr: usize,
    pub(super) len: usize,
    pub(super) callback: CopyCallback,
}

/// Queue bound. Producers are channel loop tasks submitting one request per
/// recv; in practice the queue never fills.
const REQUEST_QUEUE_CAPACITY: usize = 1 << 16;

/// Owns the worker thread and the request queue feeding it.
pub(super) struct CopyEngine {
    /// Retired by `shutdown`, which makes the sentinel the provably last
    /// queue item: submits serialize against shutdown on this lock.
    sender: Mutex<Option<mpsc::SyncSender<Option<CopyRequest>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CopyEngine {
    /// Start the worker thread.
    pub(super) fn start() -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(REQUEST_QUEUE_CAPACITY);
        let worker = thread::Builder::new()
            .name("memlink-copy".to_string())
            .spawn(move || Self::run(receiver))?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue `request`. Its callback runs later on the worker thread; if
    /// shutdown has already been ordered, the callback fails now with
    /// [`Error::ChannelClosed`].
    pub(super) fn submit(&self, request: CopyRequest) {
        let guard = self.sender.lock().unwrap();
        if let Some(sender) = guard.as_ref() {
            // Cannot disconnect while we hold the sender: the worker only
            // exits on the sentinel, and the sentinel cannot have been
            // queued yet.
            let _ = sender.send(Some(request));
            return;
        }
        drop(guard);
        (request.callback)(Err(Error::ChannelClosed));
    }

    /// Order shutdown after all previously submitted requests. Idempotent.
    pub(super) fn shutdown(&self) {
        let sender = self.sender.lock().unwrap().take();
        if let Some(sender) = sender {
            let _ = sender.send(None);
        }
    }

    /// Wait for the worker to exit. Must be preceded by `shutdown`.
    pub(super) fn join(&self) {
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("copy worker panicked");
            }
        }
    }

    fn run(receiver: mpsc::Receiver<Option<CopyRequest>>) {
        while let Ok(item) = receiver.recv() {
            match item {
                Some(request) => Self::execute(request),
                None => break,
            }
        }
    }

    fn execute(request: CopyRequest) {
        let CopyRequest {
            remote_pid,
            remote_addr,
            local_addr,
            len,
            callback,
        } = request;
        tracing::trace!(
            pid = remote_pid.as_raw(),
            len,
            "copying from peer address space"
        );
        // SAFETY: per the channel recv contract the requester keeps the
        // local region valid and writable until its callback fires, which
        // happens below.
        let result = unsafe { sys::copy_from_process(remote_pid, remote_addr, local_addr, len) };
        let outcome = match result {
            Err(errno) => Err(Error::System {
                syscall: "process_vm_readv",
                errno,
            }),
            Ok(nread) if nread != len => Err(Error::ShortRead {
                expected: len,
                got: nread,
            }),
            Ok(_) => Ok(()),
        };
        callback(outcome);
    }
}
