//! Event Bus (spec §4.10): condition-variable-style signals for capacity
//! (`too_few`/`too_many`, level-triggered) and membership
//! (`new_peer`/`new_connection`, edge-triggered), plus the richer
//! operator-facing watcher stream (spec §4.7 `watch()`).
//!
//! The internal `new_peer`/`new_connection` signals are forwarded through
//! the generic [`event_bus::EventBus`], wiring sub-manager events into one
//! bus the same way `fsm/handler.rs::new` does; the
//! multi-subscriber watcher stream needs true fan-out with a lagged marker
//! on resume (spec §9), which `event_bus`'s single-consumer-per-message
//! channel does not provide, so it is built directly on
//! `tokio::sync::broadcast` instead.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use event_bus::{Event, EventBus};
use serde::Serialize;

use crate::connection::ConnectionId;
use crate::registry::peer::PeerId;
use crate::registry::point::PointId;

/// The richer event stream exposed to operator tooling by `watch()`.
#[derive(Debug, Clone, Serialize)]
pub enum PoolEvent {
    Dialed { point: PointId },
    Accepted { point: PointId },
    HandshakeFailed { point: PointId, reason: String },
    Connected { connection: ConnectionId, peer_id: PeerId, point: PointId },
    Disconnected { connection: ConnectionId, peer_id: PeerId, point: PointId, reason: String },
    NewPeer { peer_id: PeerId },
    NewConnection { connection: ConnectionId },
    SwapRequested { point: PointId },
    SwapAcked { point: PointId },
    Evicted { point: Option<PointId>, peer_id: Option<PeerId> },
    TooFewConnections,
    TooManyConnections,
}

#[derive(Clone, Event)]
struct NewPeerSignal(PeerId);
#[derive(Clone, Event)]
struct NewConnectionSignal(ConnectionId);

/// An item pulled off a watcher stream: either the next event, or a
/// notice that events were dropped because this subscriber fell behind
/// (spec §9: "a 'lagged' marker delivered on resume is recommended").
#[derive(Debug, Clone)]
pub enum WatchItem {
    Event(PoolEvent),
    Lagged(u64),
}

/// A live subscription returned by [`Events::watch`]. Per-subscriber,
/// buffered, lossy only on subscriber slowness (spec §4.7).
pub struct EventStream {
    rx: tokio::sync::broadcast::Receiver<PoolEvent>,
    stopped: Arc<AtomicBool>,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<WatchItem> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        match self.rx.recv().await {
            Ok(event) => Some(WatchItem::Event(event)),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => Some(WatchItem::Lagged(n)),
            Err(tokio::sync::broadcast::error::RecvError::Closed) => None,
        }
    }
}

/// Stops the paired [`EventStream`] (causes it to yield `None` on its
/// next poll). Dropping the `Stopper` has no effect; call `stop()`
/// explicitly.
pub struct Stopper {
    stopped: Arc<AtomicBool>,
}

impl Stopper {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub struct Events {
    too_few: tokio::sync::watch::Sender<bool>,
    too_many: tokio::sync::watch::Sender<bool>,
    new_peer: tokio::sync::Notify,
    new_connection: tokio::sync::Notify,
    watchers: tokio::sync::broadcast::Sender<PoolEvent>,
    bus: EventBus,
}

impl Events {
    pub fn new(watcher_buffer: usize) -> Self {
        let (too_few, _) = tokio::sync::watch::channel(false);
        let (too_many, _) = tokio::sync::watch::channel(false);
        let (watchers, _) = tokio::sync::broadcast::channel(watcher_buffer.max(1));

        let mut bus = EventBus::default();
        bus.register::<NewPeerSignal>(None);
        bus.register::<NewConnectionSignal>(None);

        Self {
            too_few,
            too_many,
            new_peer: tokio::sync::Notify::new(),
            new_connection: tokio::sync::Notify::new(),
            watchers,
            bus,
        }
    }

    /// Evaluate and (idempotently) set the level-triggered capacity
    /// conditions (spec §4.7).
    pub fn set_too_few(&self, value: bool) {
        self.too_few.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
        if value {
            let _ = self.broadcast(PoolEvent::TooFewConnections);
        }
    }

    pub fn set_too_many(&self, value: bool) {
        self.too_many.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
        if value {
            let _ = self.broadcast(PoolEvent::TooManyConnections);
        }
    }

    pub async fn wait_too_few(&self) {
        let mut rx = self.too_few.subscribe();
        let _ = rx.wait_for(|v| *v).await;
    }

    pub async fn wait_too_many(&self) {
        let mut rx = self.too_many.subscribe();
        let _ = rx.wait_for(|v| *v).await;
    }

    pub async fn emit_new_peer(&self, peer_id: PeerId) {
        self.new_peer.notify_waiters();
        let _ = self.bus.try_send(NewPeerSignal(peer_id.clone())).await;
        let _ = self.broadcast(PoolEvent::NewPeer { peer_id });
    }

    pub async fn emit_new_connection(&self, connection: ConnectionId) {
        self.new_connection.notify_waiters();
        let _ = self.bus.try_send(NewConnectionSignal(connection)).await;
        let _ = self.broadcast(PoolEvent::NewConnection { connection });
    }

    pub async fn wait_new_peer(&self) {
        self.new_peer.notified().await;
    }

    pub async fn wait_new_connection(&self) {
        self.new_connection.notified().await;
    }

    /// Broadcast a rich event to all operator watchers (spec §4.7, §5).
    /// Best-effort: no subscribers is not an error.
    pub fn broadcast(&self, event: PoolEvent) -> Result<(), ()> {
        let _ = self.watchers.send(event);
        Ok(())
    }

    pub fn watch(&self) -> (EventStream, Stopper) {
        let stopped = Arc::new(AtomicBool::new(false));
        (
            EventStream {
                rx: self.watchers.subscribe(),
                stopped: stopped.clone(),
            },
            Stopper { stopped },
        )
    }
}
