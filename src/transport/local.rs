/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! In-process connections.
//!
//! [`pair`] returns two connected endpoints backed by per-direction frame
//! queues; a write either parks the frame or hands it straight to a waiting
//! read. Useful for same-process peers and for tests, where it stands in for
//! a socket without any I/O.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;

use super::Connection;
use super::ReadCallback;
use super::TransportError;
use super::WriteCallback;

/// One direction of a [`pair`]: frames written by one endpoint, read by the
/// other.
struct Inbox {
    frames: VecDeque<Bytes>,
    pending: VecDeque<ReadCallback>,
    closed: bool,
}

impl Inbox {
    fn new() -> Arc<Mutex<Inbox>> {
        Arc::new(Mutex::new(Inbox {
            frames: VecDeque::new(),
            pending: VecDeque::new(),
            closed: false,
        }))
    }
}

/// One endpoint of an in-process connection pair.
pub struct LocalConnection {
    rx: Arc<Mutex<Inbox>>,
    tx: Arc<Mutex<Inbox>>,
}

/// Create a connected pair of in-process endpoints.
pub fn pair() -> (Arc<LocalConnection>, Arc<LocalConnection>) {
    let a_to_b = Inbox::new();
    let b_to_a = Inbox::new();
    (
        Arc::new(LocalConnection {
            rx: Arc::clone(&b_to_a),
            tx: Arc::clone(&a_to_b),
        }),
        Arc::new(LocalConnection {
            rx: a_to_b,
            tx: b_to_a,
        }),
    )
}

impl LocalConnection {
    /// Mark `inbox` closed and fail its parked reads. Callbacks run after
    /// the lock is released; they may re-enter the connection.
    fn close_inbox(inbox: &Mutex<Inbox>) {
        let parked = {
            let mut inbox = inbox.lock().unwrap();
            inbox.closed = true;
            std::mem::take(&mut inbox.pending)
        };
        for callback in parked {
            callback(Err(TransportError::Closed));
        }
    }
}

impl Connection for LocalConnection {
    fn read(&self, callback: ReadCallback) {
        let ready = {
            let mut inbox = self.rx.lock().unwrap();
            match inbox.frames.pop_front() {
                Some(frame) => Ok(frame),
                None if inbox.closed => Err(TransportError::Closed),
                None => {
                    inbox.pending.push_back(callback);
                    return;
                }
            }
        };
        callback(ready);
    }

    fn write(&self, frame: Bytes, callback: WriteCallback) {
        let delivery = {
            let mut inbox = self.tx.lock().unwrap();
            if inbox.closed {
                Err(TransportError::Closed)
            } else {
                match inbox.pending.pop_front() {
                    Some(reader) => Ok(Some(reader)),
                    None => {
                        inbox.frames.push_back(frame.clone());
                        Ok(None)
                    }
                }
            }
        };
        match delivery {
            Ok(Some(reader)) => {
                reader(Ok(frame));
                callback(Ok(()));
            }
            Ok(None) => callback(Ok(())),
            Err(err) => callback(Err(err)),
        }
    }

    fn close(&self) {
        Self::close_inbox(&self.rx);
        Self::close_inbox(&self.tx);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn frame(data: &[u8]) -> Bytes {
        Bytes::copy_from_slice(data)
    }

    #[test]
    fn test_write_then_read() {
        let (a, b) = pair();
        a.write(frame(b"hello"), Box::new(|result| result.unwrap()));

        let (tx, rx) = mpsc::channel();
        b.read(Box::new(move |result| tx.send(result).unwrap()));
        assert_eq!(rx.recv().unwrap().unwrap(), frame(b"hello"));
    }

    #[test]
    fn test_read_parks_until_write() {
        let (a, b) = pair();

        let (tx, rx) = mpsc::channel();
        b.read(Box::new(move |result| tx.send(result).unwrap()));
        assert!(rx.try_recv().is_err());

        a.write(frame(b"late"), Box::new(|result| result.unwrap()));
        assert_eq!(rx.recv().unwrap().unwrap(), frame(b"late"));
    }

    #[test]
    fn test_frames_keep_order() {
        let (a, b) = pair();
        for payload in [b"one" as &[u8], b"two", b"three"] {
            a.write(frame(payload), Box::new(|result| result.unwrap()));
        }

        for expected in [b"one" as &[u8], b"two", b"three"] {
            let (tx, rx) = mpsc::channel();
            b.read(Box::new(move |result| tx.send(result).unwrap()));
            assert_eq!(rx.recv().unwrap().unwrap(), frame(expected));
        }
    }

    #[test]
    fn test_close_fails_parked_read() {
        let (a, b) = pair();

        let (tx, rx) = mpsc::channel();
        b.read(Box::new(move |result| tx.send(result).unwrap()));

        a.close();
        assert!(matches!(
            rx.recv().unwrap(),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_write_after_close_fails() {
        let (a, b) = pair();
        b.close();

        let (tx, rx) = mpsc::channel();
        a.write(frame(b"x"), Box::new(move |result| tx.send(result).unwrap()));
        assert!(matches!(
            rx.recv().unwrap(),
            Err(TransportError::Closed)
        ));
    }
}
