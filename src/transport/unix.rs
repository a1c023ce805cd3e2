/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Unix-domain socket connections.
//!
//! Frames are encoded as an 8-byte **big-endian** length prefix (u64)
//! followed by exactly that many payload bytes:
//!
//! ```text
//! +------ len: u64 (BE) ------+------- data -------+
//! | \x00...\x10               | 16 payload bytes   |
//! +---------------------------+--------------------+
//! ```
//!
//! Frames larger than [`MAX_FRAME_LENGTH`] are rejected. EOF while waiting
//! for a length prefix means the peer closed cleanly and surfaces as
//! [`TransportError::Closed`]; EOF inside a frame is an I/O error.
//!
//! I/O runs on a shared runtime started on first use. Each connection has a
//! reader task and a writer task fed by request queues; [`Connection::close`]
//! fans out through a watch signal, after which both tasks fail their queued
//! requests and drop their socket halves so the peer observes EOF.

use std::io;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::sync::watch;

use super::Connection;
use super::ReadCallback;
use super::TransportError;
use super::WriteCallback;

/// Frames above this size are rejected. Channels move only small
/// coordination messages through the connection; bulk payload takes the
/// channel's own path.
pub const MAX_FRAME_LENGTH: u64 = 1024 * 1024;

lazy_static::lazy_static! {
    static ref RUNTIME: tokio::runtime::Runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("memlink-io")
        .enable_io()
        .build()
        .expect("failed to start transport I/O runtime");
}

/// A frame connection over a Unix-domain stream socket.
pub struct UnixConnection {
    read_requests: mpsc::UnboundedSender<ReadCallback>,
    write_requests: mpsc::UnboundedSender<(Bytes, WriteCallback)>,
    closed: watch::Sender<bool>,
}

/// Connect to a listening socket at `path`.
///
/// Must not be called from a transport callback.
pub fn connect<P: AsRef<Path>>(path: P) -> io::Result<Arc<UnixConnection>> {
    let stream = RUNTIME.block_on(UnixStream::connect(path))?;
    Ok(UnixConnection::spawn(stream))
}

/// Create a connected pair of socket endpoints in this process, e.g. for
/// handing one end to a forked child.
pub fn pair() -> io::Result<(Arc<UnixConnection>, Arc<UnixConnection>)> {
    let (a, b) = std::os::unix::net::UnixStream::pair()?;
    Ok((UnixConnection::from_std(a)?, UnixConnection::from_std(b)?))
}

/// A listening socket producing [`UnixConnection`]s.
pub struct UnixListener {
    inner: tokio::net::UnixListener,
}

impl UnixListener {
    /// Bind a listener at `path`.
    pub fn bind<P: AsRef<Path>>(path: P) -> io::Result<UnixListener> {
        let _guard = RUNTIME.enter();
        Ok(UnixListener {
            inner: tokio::net::UnixListener::bind(path)?,
        })
    }

    /// Block until a peer connects.
    ///
    /// Must not be called from a transport callback.
    pub fn accept(&self) -> io::Result<Arc<UnixConnection>> {
        let (stream, _addr) = RUNTIME.block_on(self.inner.accept())?;
        Ok(UnixConnection::spawn(stream))
    }
}

impl UnixConnection {
    fn from_std(stream: std::os::unix::net::UnixStream) -> io::Result<Arc<UnixConnection>> {
        stream.set_nonblocking(true)?;
        let _guard = RUNTIME.enter();
        Ok(Self::spawn(UnixStream::from_std(stream)?))
    }

    fn spawn(stream: UnixStream) -> Arc<UnixConnection> {
        let (rd, wr) = stream.into_split();
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        RUNTIME.spawn(read_task(rd, read_rx, closed_rx.clone()));
        RUNTIME.spawn(write_task(wr, write_rx, closed_rx));
        Arc::new(UnixConnection {
            read_requests: read_tx,
            write_requests: write_tx,
            closed: closed_tx,
        })
    }
}

impl Connection for UnixConnection {
    fn read(&self, callback: ReadCallback) {
        if let Err(mpsc::error::SendError(callback)) = self.read_requests.send(callback) {
            callback(Err(TransportError::Closed));
        }
    }

    fn write(&self, frame: Bytes, callback: WriteCallback) {
        if let Err(mpsc::error::SendError((_, callback))) =
            self.write_requests.send((frame, callback))
        {
            callback(Err(TransportError::Closed));
        }
    }

    fn close(&self) {
        let _ = self.closed.send(true);
    }
}

async fn read_frame(rd: &mut OwnedReadHalf) -> Result<Option<Bytes>, TransportError> {
    let len = match rd.read_u64().await {
        Ok(len) => len,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > MAX_FRAME_LENGTH {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    rd.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}

async fn write_frame(wr: &mut OwnedWriteHalf, frame: &Bytes) -> Result<(), TransportError> {
    wr.write_u64(frame.len() as u64).await?;
    wr.write_all(frame).await?;
    wr.flush().await?;
    Ok(())
}

async fn read_task(
    mut rd: OwnedReadHalf,
    mut requests: mpsc::UnboundedReceiver<ReadCallback>,
    mut closed: watch::Receiver<bool>,
) {
    let error = loop {
        let callback = tokio::select! {
            request = requests.recv() => match request {
                Some(callback) => callback,
                // Connection dropped with nothing pending.
                None => return,
            },
            _ = closed.changed() => break TransportError::Closed,
        };
        let result = tokio::select! {
            frame = read_frame(&mut rd) => match frame {
                Ok(Some(frame)) => Ok(frame),
                Ok(None) => Err(TransportError::Closed),
                Err(err) => Err(err),
            },
            _ = closed.changed() => Err(TransportError::Closed),
        };
        match result {
            Ok(frame) => callback(Ok(frame)),
            Err(err) => {
                callback(Err(err.clone()));
                break err;
            }
        }
    };

    // The connection is done: fail whatever is still queued, reject new
    // requests, and let the read half drop.
    requests.close();
    while let Ok(callback) = requests.try_recv() {
        callback(Err(error.clone()));
    }
}

async fn write_task(
    mut wr: OwnedWriteHalf,
    mut requests: mpsc::UnboundedReceiver<(Bytes, WriteCallback)>,
    mut closed: watch::Receiver<bool>,
) {
    let error = loop {
        let (frame, callback) = tokio::select! {
            request = requests.recv() => match request {
                Some(request) => request,
                None => {
                    let _ = wr.shutdown().await;
                    return;
                }
            },
            _ = closed.changed() => break TransportError::Closed,
        };
        let result = tokio::select! {
            result = write_frame(&mut wr, &frame) => result,
            _ = closed.changed() => Err(TransportError::Closed),
        };
        match result {
            Ok(()) => callback(Ok(())),
            Err(err) => {
                callback(Err(err.clone()));
                break err;
            }
        }
    };

    requests.close();
    while let Ok((_frame, callback)) = requests.try_recv() {
        callback(Err(error.clone()));
    }
    let _ = wr.shutdown().await;
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use nix::unistd::getpid;

    use super::*;

    const RECV_TIMEOUT: Duration = Duration::from_secs(10);

    fn frame(data: &[u8]) -> Bytes {
        Bytes::copy_from_slice(data)
    }

    fn read_one(conn: &Arc<UnixConnection>) -> Result<Bytes, TransportError> {
        let (tx, rx) = std_mpsc::channel();
        conn.read(Box::new(move |result| tx.send(result).unwrap()));
        rx.recv_timeout(RECV_TIMEOUT).unwrap()
    }

    fn write_one(conn: &Arc<UnixConnection>, data: &[u8]) -> Result<(), TransportError> {
        let (tx, rx) = std_mpsc::channel();
        conn.write(frame(data), Box::new(move |result| tx.send(result).unwrap()));
        rx.recv_timeout(RECV_TIMEOUT).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let (a, b) = pair().unwrap();
        write_one(&a, b"ping").unwrap();
        assert_eq!(read_one(&b).unwrap(), frame(b"ping"));

        write_one(&b, b"pong").unwrap();
        assert_eq!(read_one(&a).unwrap(), frame(b"pong"));
    }

    #[test]
    fn test_frames_keep_order() {
        let (a, b) = pair().unwrap();
        for i in 0..16u8 {
            write_one(&a, &[i; 3]).unwrap();
        }
        for i in 0..16u8 {
            assert_eq!(read_one(&b).unwrap(), frame(&[i; 3]));
        }
    }

    #[test]
    fn test_empty_frame() {
        let (a, b) = pair().unwrap();
        write_one(&a, b"").unwrap();
        assert_eq!(read_one(&b).unwrap(), frame(b""));
    }

    #[test]
    fn test_local_close_fails_pending_read() {
        let (a, _b) = pair().unwrap();

        let (tx, rx) = std_mpsc::channel();
        a.read(Box::new(move |result| tx.send(result).unwrap()));
        a.close();

        assert!(matches!(
            rx.recv_timeout(RECV_TIMEOUT).unwrap(),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_peer_close_surfaces_as_eof() {
        let (a, b) = pair().unwrap();
        a.close();
        assert!(matches!(read_one(&b), Err(TransportError::Closed)));
    }

    #[test]
    fn test_read_after_close_fails() {
        let (a, _b) = pair().unwrap();
        a.close();
        assert!(matches!(read_one(&a), Err(TransportError::Closed)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let (raw, wrapped) = std::os::unix::net::UnixStream::pair().unwrap();
        let conn = UnixConnection::from_std(wrapped).unwrap();

        let mut raw = raw;
        raw.write_all(&(MAX_FRAME_LENGTH + 1).to_be_bytes()).unwrap();

        assert!(matches!(
            read_one(&conn),
            Err(TransportError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_listener_accept_and_connect() {
        let path = std::env::temp_dir().join(format!("memlink-test-{}.sock", getpid()));
        let _ = std::fs::remove_file(&path);

        let listener = UnixListener::bind(&path).unwrap();
        let path2 = path.clone();
        let dialer = std::thread::spawn(move || connect(&path2).unwrap());
        let served = listener.accept().unwrap();
        let dialed = dialer.join().unwrap();

        write_one(&dialed, b"over the wire").unwrap();
        assert_eq!(read_one(&served).unwrap(), frame(b"over the wire"));

        let _ = std::fs::remove_file(&path);
    }
}
