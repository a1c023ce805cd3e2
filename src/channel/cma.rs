/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The cross-memory-attach channel.
//!
//! CMA moves a region between two processes on the same host with a single
//! `process_vm_readv` call issued by the receiver: the sender publishes a
//! descriptor naming its pid and the source address, the receiver copies the
//! bytes straight out of the sender's address space, then confirms over the
//! transport connection with a notification.
//!
//! The kernel only permits the copy between processes with matching
//! credentials, which is what the context's domain descriptor encodes: two
//! peers whose descriptors compare equal may use this channel.
//!
//! Layout mirrors the protocol: the engine module holds the per-context
//! worker thread that executes copy requests, [`CmaContext`] owns the engine
//! and constructs the domain descriptor, and [`CmaChannel`] runs the
//! send/recv protocol over one transport connection.

mod channel;
mod context;
mod engine;

pub use channel::CmaChannel;
pub use context::CmaContext;
pub use context::CHANNEL_NAME;
