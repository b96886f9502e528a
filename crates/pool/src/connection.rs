//! Connection Object (spec §4.4): wraps a TRANSPORT handle with an
//! app-queue, metadata, and the control worker that owns the read side.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::message::{AppMessage, CodecRegistry};
use crate::registry::peer::PeerId;
use crate::registry::point::PointId;
use crate::scheduler::Scheduler;
use crate::time::Timestamp;
use crate::transport::FrameWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Monotonic allocator for [`ConnectionId`]s, owned by the pool
/// orchestrator.
#[derive(Default)]
pub struct ConnectionIdAllocator(AtomicU64);

impl ConnectionIdAllocator {
    pub fn next(&self) -> ConnectionId {
        ConnectionId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Immutable record describing a connection (spec §3).
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub point: PointId,
    pub peer_id: PeerId,
    pub incoming: bool,
    pub negotiated_version: u16,
    pub declared_listening_port: Option<u16>,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub established_at: Timestamp,
}

/// A live session (spec §4.4).
///
/// `read`/`is_readable` pull from the app-queue that the control worker
/// (§4.6) feeds; writes go straight to the shared [`FrameWriter`] half of
/// TRANSPORT, independent of the worker's read loop.
pub struct Connection {
    info: ConnectionInfo,
    writer: Arc<dyn FrameWriter>,
    codecs: Arc<CodecRegistry>,
    app_queue_rx: flume::Receiver<AppMessage>,
    scheduler: Arc<dyn Scheduler>,
    disconnecting: Arc<AtomicBool>,
    cancel: CancellationToken,
    worker_done: tokio::sync::watch::Receiver<bool>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        info: ConnectionInfo,
        writer: Arc<dyn FrameWriter>,
        codecs: Arc<CodecRegistry>,
        app_queue_rx: flume::Receiver<AppMessage>,
        scheduler: Arc<dyn Scheduler>,
        disconnecting: Arc<AtomicBool>,
        cancel: CancellationToken,
        worker_done: tokio::sync::watch::Receiver<bool>,
    ) -> Self {
        Self {
            info,
            writer,
            codecs,
            app_queue_rx,
            scheduler,
            disconnecting,
            cancel,
            worker_done,
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn stat(&self) -> crate::scheduler::Stat {
        self.scheduler.connection_stat(self.info.id).unwrap_or_default()
    }

    /// Await the next application message, or `None` once the connection
    /// has been closed and the app-queue drained.
    pub async fn read(&self) -> Option<AppMessage> {
        self.app_queue_rx.recv_async().await.ok()
    }

    pub fn is_readable(&self) -> bool {
        !self.app_queue_rx.is_empty()
    }

    /// Encode `value` under `tag` and enqueue it for writing, waiting if
    /// the underlying transport write queue is momentarily full.
    pub async fn write<T: Send + Sync + 'static>(&self, tag: u8, value: &T) -> Result<()> {
        let payload = self.codecs.encode(tag, value)?;
        self.writer.write_frame(&encode_user_frame(tag, &payload)).await?;
        self.scheduler.account_write(self.info.id, payload.len());
        Ok(())
    }

    /// Like `write`, but additionally waits for the underlying transport
    /// to report the bytes as flushed/drained.
    pub async fn write_sync<T: Send + Sync + 'static>(&self, tag: u8, value: &T) -> Result<()> {
        // The reference transport already flushes synchronously per frame,
        // so write_sync and write only differ for transports with their
        // own internal write buffering.
        self.write(tag, value).await
    }

    /// Fails fast instead of waiting if the connection is already
    /// disconnecting; returns whether the write was attempted.
    pub async fn write_now<T: Send + Sync + 'static>(&self, tag: u8, value: &T) -> bool {
        if self.disconnecting.load(Ordering::SeqCst) {
            return false;
        }
        self.write(tag, value).await.is_ok()
    }

    pub async fn raw_write_sync(&self, bytes: &[u8]) -> Result<()> {
        self.writer.write_frame(bytes).await?;
        self.scheduler.account_write(self.info.id, bytes.len());
        Ok(())
    }

    /// Idempotent: a second call while already disconnecting is a no-op.
    /// `wait=true` blocks until the control worker has exited and
    /// TRANSPORT is closed.
    pub async fn disconnect(&self, wait: bool) {
        if !self.disconnecting.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
            let _ = self.writer.close().await;
        }
        if wait {
            let mut rx = self.worker_done.clone();
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }
}

pub(crate) fn encode_user_frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    crate::message::Frame::Message {
        tag,
        payload: payload.to_vec(),
    }
    .encode()
    .map(|(tag, body)| {
        let mut framed = Vec::with_capacity(1 + body.len());
        framed.push(tag);
        framed.extend_from_slice(&body);
        framed
    })
    .unwrap_or_default()
}

pub(crate) fn decode_wire(bytes: &[u8]) -> std::result::Result<(u8, Vec<u8>), Error> {
    if bytes.is_empty() {
        return Err(Error::DecodingError("empty frame".into()));
    }
    Ok((bytes[0], bytes[1..].to_vec()))
}
