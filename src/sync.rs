/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Synchronization primitives shared by channel implementations: the
//! run-to-completion [`TaskLoop`] and the one-shot [`ClosingEmitter`].

use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread;
use std::thread::ThreadId;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// A cooperative run-to-completion loop with no thread of its own.
///
/// Tasks deferred to the loop execute serially in FIFO order on whichever
/// caller thread found the loop idle: that thread becomes the *runner* and
/// drains the queue until it is empty, then steps down. A `defer` from a
/// running task (including from the runner itself) only enqueues.
///
/// This gives all tasks a single-threaded view of whatever state the loop
/// guards, without dedicating a thread per loop.
pub(crate) struct TaskLoop {
    state: Mutex<LoopState>,
}

struct LoopState {
    tasks: VecDeque<Task>,
    runner: Option<ThreadId>,
}

impl TaskLoop {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LoopState {
                tasks: VecDeque::new(),
                runner: None,
            }),
        }
    }

    /// True when called from a task currently executing on this loop.
    pub(crate) fn in_loop(&self) -> bool {
        self.state.lock().unwrap().runner == Some(thread::current().id())
    }

    /// Enqueue `task`. If no runner is active, the calling thread drains the
    /// queue (starting with `task`) before returning; otherwise the call
    /// returns immediately and the active runner picks the task up.
    pub(crate) fn defer(&self, task: Task) {
        {
            let mut state = self.state.lock().unwrap();
            state.tasks.push_back(task);
            if state.runner.is_some() {
                return;
            }
            state.runner = Some(thread::current().id());
        }

        loop {
            let task = {
                let mut state = self.state.lock().unwrap();
                match state.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        state.runner = None;
                        return;
                    }
                }
            };
            task();
        }
    }
}

type Listener = Box<dyn FnOnce() + Send + 'static>;

/// A one-shot closing signal with multi-listener fan-out.
///
/// Listeners fire at most once. Subscribing after the signal has already
/// fired runs the listener immediately, so no subscriber can miss the close.
pub(crate) struct ClosingEmitter {
    state: Mutex<EmitterState>,
}

struct EmitterState {
    closed: bool,
    listeners: Vec<Listener>,
}

impl ClosingEmitter {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(EmitterState {
                closed: false,
                listeners: Vec::new(),
            }),
        }
    }

    /// Register `listener` to run when the signal fires; runs it now if the
    /// signal already fired.
    pub(crate) fn subscribe(&self, listener: Listener) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.closed {
                state.listeners.push(listener);
                return;
            }
        }
        listener();
    }

    /// Fire the signal. Only the first call runs listeners.
    pub(crate) fn close(&self) {
        let listeners = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.listeners)
        };
        for listener in listeners {
            listener();
        }
    }
}
