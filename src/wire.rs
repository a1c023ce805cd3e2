/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Wire messages exchanged between channel peers.
//!
//! Two small messages coordinate a CMA transfer. The sender hands the peer a
//! [`Descriptor`] naming its pid and the source address (out of band, through
//! whatever envelope the embedding library provides); the receiver performs
//! the copy and answers with a [`Notification`] over the channel's own
//! transport connection. [`Packet`] is the tagged union read off the
//! transport; CMA only ever expects the notification variant.
//!
//! Encoding is bincode on both ends, matching the rest of the stack.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

/// Identifies a sender's memory region so the peer can read from it.
///
/// Carries no length: the receiver already knows how many bytes its `recv`
/// wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// The send operation this descriptor belongs to.
    pub operation_id: u64,
    /// Pid of the sending process.
    pub pid: u64,
    /// Virtual address of the region in the sender's address space.
    pub ptr: u64,
}

/// Receiver-to-sender confirmation that a copy completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// The send operation being completed.
    pub operation_id: u64,
}

/// A message read off a channel's transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Completion of a send operation.
    Notification(Notification),
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Bytes, bincode::Error> {
    bincode::serialize(value).map(Bytes::from)
}

pub fn deserialize<T: DeserializeOwned>(data: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(data)
}
