/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The CMA channel: send/recv protocol over one transport connection.
//!
//! All channel state lives behind a cooperative run-to-completion loop
//! ([`TaskLoop`]): public methods and every transport/copy completion defer
//! onto it, so state mutations are serialized without a dedicated thread.
//! Tasks never block; anything slow is handed to the transport or the copy
//! engine with a callback that defers back.
//!
//! Protocol: `send` assigns the next operation id, parks the operation in
//! the in-flight list, and hands the caller a serialized descriptor to
//! convey out of band. `recv` turns the peer's descriptor into a copy
//! request; on success it writes a notification over the connection, which
//! completes the matching send on the other side. The channel keeps exactly
//! one transport read outstanding to collect those notifications.
//!
//! The first error (local close, transport failure, protocol violation) is
//! terminal: it fails every in-flight send, closes the connection, and
//! causes all later operations to fail with the same error. A failed copy is
//! *not* terminal; it fails only its own recv.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use bytes::Bytes;
use nix::unistd::getpid;
use nix::unistd::Pid;

use super::context::ContextInner;
use crate::channel::Channel;
use crate::channel::DescriptorCallback;
use crate::channel::RecvCallback;
use crate::channel::Region;
use crate::channel::SendCallback;
use crate::error::Error;
use crate::sync::TaskLoop;
use crate::transport::Connection;
use crate::wire;
use crate::wire::Descriptor;
use crate::wire::Notification;
use crate::wire::Packet;

/// A send awaiting its peer notification.
struct SendOperation {
    id: u64,
    callback: SendCallback,
}

struct ChannelState {
    /// Terminal error; set at most once.
    error: Option<Error>,
    /// Next send operation id. Starts at 0, never reused.
    next_operation_id: u64,
    /// In-flight sends, completed by notification id match.
    send_operations: Vec<SendOperation>,
}

pub(super) struct ChannelInner {
    context: Arc<ContextInner>,
    connection: Arc<dyn Connection>,
    task_loop: TaskLoop,
    /// Only loop tasks touch this; the mutex makes that sharable.
    state: Mutex<ChannelState>,
}

/// A CMA channel bound to one transport connection.
///
/// Dropping the channel closes it; callbacks of operations still in flight
/// fire with [`Error::ChannelClosed`].
pub struct CmaChannel {
    inner: Arc<ChannelInner>,
}

impl CmaChannel {
    pub(super) fn new(context: Arc<ContextInner>, connection: Arc<dyn Connection>) -> Self {
        let inner = Arc::new(ChannelInner {
            context: Arc::clone(&context),
            connection,
            task_loop: TaskLoop::new(),
            state: Mutex::new(ChannelState {
                error: None,
                next_operation_id: 0,
                send_operations: Vec::new(),
            }),
        });

        // A context close must reach every channel, including one created
        // after the signal fired (the subscription then runs immediately).
        // The subscription must not keep the channel alive on its own.
        let weak = Arc::downgrade(&inner);
        context.subscribe_closing(Box::new(move || {
            if let Some(inner) = Weak::upgrade(&weak) {
                ChannelInner::close(&inner);
            }
        }));

        let init = Arc::clone(&inner);
        inner
            .task_loop
            .defer(Box::new(move || ChannelInner::arm_read(&init)));

        Self { inner }
    }

    /// See [`Channel::send`].
    pub fn send(
        &self,
        source: Region,
        descriptor_callback: DescriptorCallback,
        callback: SendCallback,
    ) {
        ChannelInner::send(&self.inner, source, descriptor_callback, callback);
    }

    /// See [`Channel::recv`].
    pub fn recv(&self, descriptor: Bytes, target: Region, callback: RecvCallback) {
        ChannelInner::recv(&self.inner, descriptor, target, callback);
    }

    /// See [`Channel::close`].
    pub fn close(&self) {
        ChannelInner::close(&self.inner);
    }
}

impl Channel for CmaChannel {
    fn send(
        &self,
        source: Region,
        descriptor_callback: DescriptorCallback,
        callback: SendCallback,
    ) {
        CmaChannel::send(self, source, descriptor_callback, callback);
    }

    fn recv(&self, descriptor: Bytes, target: Region, callback: RecvCallback) {
        CmaChannel::recv(self, descriptor, target, callback);
    }

    fn close(&self) {
        CmaChannel::close(self);
    }
}

impl Drop for CmaChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl ChannelInner {
    /// Run `task` on the channel loop with a strong reference to the
    /// channel, so in-flight work keeps the state alive.
    fn defer(self: &Arc<Self>, task: impl FnOnce(&Arc<ChannelInner>) + Send + 'static) {
        let this = Arc::clone(self);
        self.task_loop.defer(Box::new(move || task(&this)));
    }

    fn send(
        self: &Arc<Self>,
        source: Region,
        descriptor_callback: DescriptorCallback,
        callback: SendCallback,
    ) {
        self.defer(move |inner| inner.send_from_loop(source, descriptor_callback, callback));
    }

    fn send_from_loop(
        &self,
        source: Region,
        descriptor_callback: DescriptorCallback,
        callback: SendCallback,
    ) {
        debug_assert!(self.task_loop.in_loop());
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.error.clone() {
            drop(state);
            descriptor_callback(Err(error.clone()));
            callback(Err(error));
            return;
        }

        let id = state.next_operation_id;
        let descriptor = Descriptor {
            operation_id: id,
            pid: getpid().as_raw() as u64,
            ptr: source.addr as u64,
        };
        let encoded = match wire::serialize(&descriptor) {
            Ok(encoded) => encoded,
            Err(err) => {
                drop(state);
                let error = Error::Protocol(format!("failed to encode descriptor: {}", err));
                descriptor_callback(Err(error.clone()));
                callback(Err(error));
                return;
            }
        };
        state.next_operation_id += 1;
        state.send_operations.push(SendOperation { id, callback });
        drop(state);

        tracing::trace!(id, len = source.len, "send operation in flight");
        descriptor_callback(Ok(encoded));
    }

    fn recv(self: &Arc<Self>, descriptor: Bytes, target: Region, callback: RecvCallback) {
        self.defer(move |inner| inner.recv_from_loop(descriptor, target, callback));
    }

    fn recv_from_loop(self: &Arc<Self>, descriptor: Bytes, target: Region, callback: RecvCallback) {
        debug_assert!(self.task_loop.in_loop());
        let error = self.state.lock().unwrap().error.clone();
        if let Some(error) = error {
            callback(Err(error));
            return;
        }

        let descriptor: Descriptor = match wire::deserialize(&descriptor) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                callback(Err(Error::Protocol(format!(
                    "malformed descriptor: {}",
                    err
                ))));
                return;
            }
        };

        let id = descriptor.operation_id;
        tracing::trace!(id, len = target.len, "recv submitting copy");
        let this = Arc::clone(self);
        self.context.request_copy(
            Pid::from_raw(descriptor.pid as i32),
            descriptor.ptr as usize,
            target.addr,
            target.len,
            Box::new(move |result| {
                let inner = Arc::clone(&this);
                this.task_loop.defer(Box::new(move || {
                    inner.copy_done_from_loop(id, result, callback)
                }));
            }),
        );
    }

    fn copy_done_from_loop(
        self: &Arc<Self>,
        id: u64,
        result: Result<(), Error>,
        callback: RecvCallback,
    ) {
        debug_assert!(self.task_loop.in_loop());
        // The channel may have failed while the copy was in flight; the
        // terminal error wins.
        let error = self.state.lock().unwrap().error.clone();
        if let Some(error) = error {
            callback(Err(error));
            return;
        }

        // A failed copy fails this recv alone: no notification, and the
        // channel stays usable for other operations.
        if let Err(err) = result {
            tracing::debug!(id, error = %err, "copy failed");
            callback(Err(err));
            return;
        }

        let notification = Packet::Notification(Notification { operation_id: id });
        match wire::serialize(&notification) {
            Ok(frame) => {
                let this = Arc::clone(self);
                self.connection.write(
                    frame,
                    Box::new(move |result| {
                        if let Err(err) = result {
                            let inner = Arc::clone(&this);
                            this.task_loop.defer(Box::new(move || {
                                inner.fail_from_loop(Error::Transport(err))
                            }));
                        }
                    }),
                );
                // The notification is best effort from this side: the recv
                // has succeeded, and a write failure surfaces through the
                // channel error path.
                callback(Ok(()));
            }
            Err(err) => {
                let error = Error::Protocol(format!("failed to encode notification: {}", err));
                self.fail_from_loop(error.clone());
                callback(Err(error));
            }
        }
    }

    /// Keep exactly one transport read outstanding while the channel is
    /// healthy.
    fn arm_read(self: &Arc<Self>) {
        debug_assert!(self.task_loop.in_loop());
        if self.state.lock().unwrap().error.is_some() {
            return;
        }
        let this = Arc::clone(self);
        self.connection.read(Box::new(move |result| {
            let inner = Arc::clone(&this);
            this.task_loop.defer(Box::new(move || match result {
                Ok(frame) => inner.on_frame(frame),
                Err(err) => inner.fail_from_loop(Error::Transport(err)),
            }));
        }));
    }

    fn on_frame(self: &Arc<Self>, frame: Bytes) {
        debug_assert!(self.task_loop.in_loop());
        if self.state.lock().unwrap().error.is_some() {
            return;
        }
        let packet: Packet = match wire::deserialize(&frame) {
            Ok(packet) => packet,
            Err(err) => {
                self.fail_from_loop(Error::Protocol(format!("malformed packet: {}", err)));
                return;
            }
        };
        match packet {
            Packet::Notification(notification) => {
                if self.on_notification(notification) {
                    self.arm_read();
                }
            }
        }
    }

    /// Complete the matching send. Returns false if the notification was a
    /// protocol violation and the channel has failed.
    fn on_notification(&self, notification: Notification) -> bool {
        let id = notification.operation_id;
        let operation = {
            let mut state = self.state.lock().unwrap();
            state
                .send_operations
                .iter()
                .position(|operation| operation.id == id)
                .map(|index| state.send_operations.remove(index))
        };
        match operation {
            Some(operation) => {
                tracing::trace!(id, "send operation completed");
                (operation.callback)(Ok(()));
                true
            }
            None => {
                self.fail_from_loop(Error::Protocol(format!(
                    "notification for unknown send operation {}",
                    id
                )));
                false
            }
        }
    }

    fn close(self: &Arc<Self>) {
        self.defer(|inner| inner.close_from_loop());
    }

    fn close_from_loop(&self) {
        debug_assert!(self.task_loop.in_loop());
        self.fail_from_loop(Error::ChannelClosed);
    }

    /// Record the channel's terminal error, fail every in-flight send with
    /// it, and close the connection. Only the first error transition does
    /// anything.
    fn fail_from_loop(&self, error: Error) {
        debug_assert!(self.task_loop.in_loop());
        let operations = {
            let mut state = self.state.lock().unwrap();
            if state.error.is_some() {
                return;
            }
            tracing::debug!(error = %error, "channel failed");
            state.error = Some(error.clone());
            std::mem::take(&mut state.send_operations)
        };
        for operation in operations {
            (operation.callback)(Err(error.clone()));
        }
        self.connection.close();
    }
}
