/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The connection seam channels coordinate over.
//!
//! A [`Connection`] is a bidirectional, in-order frame pipe between two
//! processes. Channels use it only for small coordination messages; the bulk
//! payload moves through whatever mechanism the channel itself provides.
//!
//! The interface is callback-based: `read` and `write` return immediately and
//! deliver their outcome later, exactly once, possibly on another thread.
//! Channels keep at most one read outstanding per connection.

use std::sync::Arc;

use bytes::Bytes;

pub mod local;
pub mod unix;

/// Completion callback for [`Connection::read`].
pub type ReadCallback = Box<dyn FnOnce(Result<Bytes, TransportError>) + Send + 'static>;

/// Completion callback for [`Connection::write`].
pub type WriteCallback = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;

/// Errors reported by connection operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed, locally or by the peer.
    #[error("connection closed")]
    Closed,

    /// An I/O error on the underlying stream.
    #[error("io: {0}")]
    Io(Arc<std::io::Error>),

    /// The peer announced a frame over the size limit.
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(u64),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// A bidirectional, in-order frame connection between two processes.
pub trait Connection: Send + Sync + 'static {
    /// Ask for the next incoming frame. The callback fires exactly once with
    /// the frame or with the error that ended the connection.
    fn read(&self, callback: ReadCallback);

    /// Queue `frame` for delivery to the peer. The callback fires exactly
    /// once, after the frame has been handed to the OS (or enqueued at the
    /// peer, for in-process connections) or on failure.
    fn write(&self, frame: Bytes, callback: WriteCallback);

    /// Close the connection. Idempotent. Pending and future operations fail
    /// with [`TransportError::Closed`].
    fn close(&self);
}
