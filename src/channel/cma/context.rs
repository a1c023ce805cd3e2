/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The CMA context: domain descriptor, copy engine ownership, channel
//! creation, and the close/join lifecycle.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context as _;
use nix::unistd::getegid;
use nix::unistd::geteuid;
use nix::unistd::Pid;

use super::channel::CmaChannel;
use super::engine::CopyCallback;
use super::engine::CopyEngine;
use super::engine::CopyRequest;
use crate::channel::Channel;
use crate::channel::Context;
use crate::channel::Endpoint;
use crate::sync::ClosingEmitter;
use crate::sys;
use crate::transport::Connection;

/// Name under which this channel family registers with the embedding
/// library, and the prefix of its domain descriptor.
pub const CHANNEL_NAME: &str = "cma";

/// Build this process's CMA domain descriptor.
///
/// The kernel gates `process_vm_readv` on a ptrace access-mode check: the
/// real, effective, and saved ids of caller and target must match (absent
/// CAP_SYS_PTRACE), and the channel is bidirectional, so both processes need
/// identical ids. Boot id plus effective uid/gid is the practical equality
/// key for that regime; descriptors are only ever compared for equality.
fn domain_descriptor() -> anyhow::Result<String> {
    let boot_id = sys::boot_id()?;
    Ok(format!(
        "{}:{}/{}/{}",
        CHANNEL_NAME,
        boot_id,
        geteuid(),
        getegid()
    ))
}

/// Process-wide owner of the CMA channel family's shared resources.
///
/// Dropping the context joins it.
pub struct CmaContext {
    inner: Arc<ContextInner>,
}

pub(super) struct ContextInner {
    domain_descriptor: String,
    engine: CopyEngine,
    closing: ClosingEmitter,
    closed: AtomicBool,
    joined: AtomicBool,
    /// Serializes join. `close` deliberately never takes it: a copy callback
    /// running on the worker thread may call close while a user thread
    /// holds this lock in `join`.
    lifecycle: Mutex<()>,
}

impl CmaContext {
    /// Create a context, starting its copy worker. Fails if the boot id
    /// cannot be read or the worker thread cannot be spawned.
    pub fn new() -> anyhow::Result<Self> {
        let domain_descriptor = domain_descriptor()?;
        let engine = CopyEngine::start().context("failed to start copy worker")?;
        tracing::debug!(domain = %domain_descriptor, "created cma context");
        Ok(Self {
            inner: Arc::new(ContextInner {
                domain_descriptor,
                engine,
                closing: ClosingEmitter::new(),
                closed: AtomicBool::new(false),
                joined: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
            }),
        })
    }

    /// The string two peers compare to decide whether CMA is usable between
    /// them.
    pub fn domain_descriptor(&self) -> &str {
        &self.inner.domain_descriptor
    }

    /// Create a channel bound to `connection`. The endpoint is accepted for
    /// interface symmetry; the CMA protocol is symmetric.
    ///
    /// Panics if the context has been joined.
    pub fn create_channel(
        &self,
        connection: Arc<dyn Connection>,
        _endpoint: Endpoint,
    ) -> CmaChannel {
        assert!(
            !self.inner.joined.load(Ordering::SeqCst),
            "create_channel after join"
        );
        CmaChannel::new(Arc::clone(&self.inner), connection)
    }

    /// Close every channel created from this context and order the copy
    /// worker to shut down. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Close, then wait for the copy worker to exit. Idempotent.
    pub fn join(&self) {
        self.inner.join();
    }
}

impl Context for CmaContext {
    fn domain_descriptor(&self) -> &str {
        CmaContext::domain_descriptor(self)
    }

    fn create_channel(
        &self,
        connection: Arc<dyn Connection>,
        endpoint: Endpoint,
    ) -> Arc<dyn Channel> {
        Arc::new(CmaContext::create_channel(self, connection, endpoint))
    }

    fn close(&self) {
        CmaContext::close(self);
    }

    fn join(&self) {
        CmaContext::join(self);
    }
}

impl Drop for CmaContext {
    fn drop(&mut self) {
        self.inner.join();
    }
}

impl ContextInner {
    /// Forward one copy to the engine on behalf of a channel.
    pub(super) fn request_copy(
        &self,
        remote_pid: Pid,
        remote_addr: usize,
        local_addr: usize,
        len: usize,
        callback: CopyCallback,
    ) {
        self.engine.submit(CopyRequest {
            remote_pid,
            remote_addr,
            local_addr,
            len,
            callback,
        });
    }

    /// Run `listener` when the context closes; immediately if it already
    /// has.
    pub(super) fn subscribe_closing(&self, listener: Box<dyn FnOnce() + Send + 'static>) {
        self.closing.subscribe(listener);
    }

    fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::debug!("closing cma context");
            self.closing.close();
            self.engine.shutdown();
        }
    }

    fn join(&self) {
        let _guard = self.lifecycle.lock().unwrap();
        self.close();
        if self
            .joined
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.engine.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;

    use nix::unistd::getpid;

    use super::*;
    use crate::error::Error;
    use crate::transport::local;

    #[test]
    fn test_domain_descriptor_format() {
        let context = CmaContext::new().unwrap();
        let descriptor = context.domain_descriptor();

        let rest = descriptor.strip_prefix("cma:").unwrap();
        let parts: Vec<&str> = rest.split('/').collect();
        assert_eq!(parts.len(), 3);
        assert!(!parts[0].is_empty());
        assert_eq!(parts[1], geteuid().to_string());
        assert_eq!(parts[2], getegid().to_string());
    }

    #[test]
    fn test_domain_descriptors_agree_within_process() {
        let a = CmaContext::new().unwrap();
        let b = CmaContext::new().unwrap();
        assert_eq!(a.domain_descriptor(), b.domain_descriptor());
    }

    #[test]
    fn test_close_and_join_are_idempotent() {
        let context = CmaContext::new().unwrap();
        context.close();
        context.close();
        context.join();
        context.join();
    }

    #[test]
    fn test_join_without_close() {
        let context = CmaContext::new().unwrap();
        context.join();
    }

    #[test]
    #[should_panic(expected = "create_channel after join")]
    fn test_create_channel_after_join_panics() {
        let context = CmaContext::new().unwrap();
        context.join();
        let (conn, _peer) = local::pair();
        let _ = context.create_channel(conn, Endpoint::Connect);
    }

    #[test]
    fn test_request_copy_after_close_fails() {
        let context = CmaContext::new().unwrap();
        context.close();

        let src = [0u8; 4];
        let mut dst = [0u8; 4];
        let (tx, rx) = std_mpsc::channel();
        context.inner.request_copy(
            getpid(),
            src.as_ptr() as usize,
            dst.as_mut_ptr() as usize,
            4,
            Box::new(move |result| tx.send(result).unwrap()),
        );
        assert!(matches!(rx.recv().unwrap(), Err(Error::ChannelClosed)));
    }
}
