/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Channel and context abstractions.
//!
//! A [`Channel`] moves contiguous memory regions between two processes over
//! an established transport [`Connection`]; a [`Context`] owns whatever
//! process-wide resources a channel family needs and stamps out channels.
//!
//! Whether a channel family is usable between two processes is decided by
//! the embedding library comparing the peers' domain descriptors for
//! equality; this crate only constructs the strings.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Error;
use crate::transport::Connection;

pub mod cma;

/// Completion callback for a send operation's descriptor: receives the
/// serialized descriptor the caller must convey to the peer out of band.
pub type DescriptorCallback = Box<dyn FnOnce(Result<Bytes, Error>) + Send + 'static>;

/// Completion callback for a send operation.
pub type SendCallback = Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

/// Completion callback for a recv operation.
pub type RecvCallback = Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

/// Which side of the transport connection this channel sits on.
///
/// Channel families whose protocol is asymmetric use this to pick roles; the
/// CMA protocol is symmetric and ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// The side that accepted the connection.
    Listen,
    /// The side that dialed the connection.
    Connect,
}

/// A contiguous region of this process's memory, named by address and
/// length.
///
/// Creating a `Region` is free and safe; the transfer that consumes it is
/// where validity matters. The caller must guarantee the underlying
/// allocation stays valid (and writable, on the receiving side) until the
/// operation's callback has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Starting virtual address.
    pub addr: usize,
    /// Length in bytes.
    pub len: usize,
}

impl Region {
    pub fn new(addr: usize, len: usize) -> Self {
        Self { addr, len }
    }

    /// Region covering `slice`.
    pub fn from_slice(slice: &[u8]) -> Self {
        Self {
            addr: slice.as_ptr() as usize,
            len: slice.len(),
        }
    }

    /// Region covering `slice`, for use as a receive target.
    pub fn from_mut_slice(slice: &mut [u8]) -> Self {
        Self {
            addr: slice.as_mut_ptr() as usize,
            len: slice.len(),
        }
    }
}

/// A process-wide owner of shared channel resources and factory for
/// channels.
pub trait Context: Send + Sync {
    /// The string two peers compare to decide whether this channel family is
    /// usable between them.
    fn domain_descriptor(&self) -> &str;

    /// Create a channel bound to `connection`. Must not be called after
    /// [`join`](Context::join).
    fn create_channel(&self, connection: Arc<dyn Connection>, endpoint: Endpoint)
        -> Arc<dyn Channel>;

    /// Release shared resources and fail outstanding work. Idempotent, and
    /// safe to call from a channel or copy callback.
    fn close(&self);

    /// Close, then wait for the context's background work to finish.
    /// Idempotent; returns in bounded time.
    fn join(&self);
}

/// A peer-to-peer memory transfer endpoint bound to one transport
/// connection.
pub trait Channel: Send + Sync {
    /// Expose `source` to the peer. `descriptor_callback` receives the
    /// serialized descriptor to convey to the peer (out of band);
    /// `callback` fires when the peer confirms it has copied the region, or
    /// with the channel's terminal error.
    ///
    /// The source allocation must stay valid until `callback` fires.
    fn send(&self, source: Region, descriptor_callback: DescriptorCallback, callback: SendCallback);

    /// Copy the region named by `descriptor` from the peer into `target`.
    /// `callback` fires when the copy completes or fails; a failed copy
    /// fails only this operation, not the channel.
    ///
    /// The target allocation must stay valid and writable until `callback`
    /// fires.
    fn recv(&self, descriptor: Bytes, target: Region, callback: RecvCallback);

    /// Fail every outstanding operation with [`Error::ChannelClosed`] and
    /// close the underlying connection. Idempotent.
    fn close(&self);
}
