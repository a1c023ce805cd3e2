/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Point-to-point memory transport channels between cooperating processes.
//!
//! A *channel* moves a contiguous region of memory from one process to
//! another over an already-established control connection (the *transport*).
//! This crate provides the cross-memory-attach ([`channel::cma`]) channel,
//! which copies directly between the two processes' address spaces with a
//! single `process_vm_readv` call, with no kernel-staged buffer and no
//! shared mapping.
//!
//! The pieces:
//!
//! * [`transport`] is the callback-based connection seam the channel
//!   coordinates over, with in-process and Unix-socket implementations.
//! * [`channel`] holds the channel/context traits and the raw memory
//!   [`Region`] handle.
//! * [`channel::cma`] is the CMA context, channel, and copy engine.
//!
//! Whether two processes may use the CMA channel is decided by comparing
//! their domain descriptors (see [`channel::Context::domain_descriptor`]):
//! equal strings mean same boot and same effective uid/gid, which is the
//! access regime the kernel's cross-process read primitive enforces.

pub mod channel;
pub mod error;
mod sync;
mod sys;
pub mod transport;
pub mod wire;

pub use channel::Region;
pub use error::Error;
