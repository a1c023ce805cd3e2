/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Errors reported by channel operations.
//!
//! A channel delivers its terminal error to every outstanding operation, so
//! the type is `Clone`; non-cloneable sources are shared behind `Arc`.

use nix::errno::Errno;

use crate::transport::TransportError;

/// The type of error delivered to channel operation callbacks.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The OS copy primitive failed.
    #[error("{syscall} failed: {errno}")]
    System {
        /// Name of the failing syscall.
        syscall: &'static str,
        /// The errno it reported.
        errno: Errno,
    },

    /// The copy primitive transferred fewer bytes than requested without
    /// reporting an error.
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead {
        /// Bytes requested.
        expected: usize,
        /// Bytes actually transferred.
        got: usize,
    },

    /// The channel was closed locally.
    #[error("channel closed")]
    ChannelClosed,

    /// The underlying connection failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The peer violated the channel protocol.
    #[error("protocol: {0}")]
    Protocol(String),
}
