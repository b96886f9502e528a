//! Pool Orchestrator (spec §4.7): global capacity enforcement, event
//! signalling, watchers, broadcast. The single mutator of the registries
//! (spec §5) — every mutation path takes `Shared::state` across one
//! synchronous critical section, the tokio equivalent of a single-threaded
//! reactor driving an outbox queue.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::connection::{Connection, ConnectionId, ConnectionIdAllocator};
use crate::error::{Error, Result};
use crate::events::{EventStream, Events, PoolEvent, Stopper};
use crate::message::{CodecRegistry, Frame};
use crate::registry::peer::{PeerId, PeerRegistry};
use crate::registry::point::{PointId, PointRegistry};
use crate::scheduler::{Scheduler, Stat};
use crate::time::Timestamp;
use crate::transport::Authenticator;
use crate::worker::ControlEvent;

/// Registries plus the bookkeeping the orchestrator mutates as one unit.
pub(crate) struct PoolState {
    pub(crate) points: PointRegistry,
    pub(crate) peers: PeerRegistry,
    pub(crate) connections: HashMap<ConnectionId, Arc<Connection>>,
    pub(crate) last_swap: HashMap<ConnectionId, Timestamp>,
}

impl PoolState {
    pub(crate) fn active_connections(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn half_open_incoming(&self) -> usize {
        self.points
            .iter()
            .filter(|(_, info)| matches!(info.state, crate::registry::point::PointState::Accepted { .. }))
            .count()
    }
}

pub(crate) type NewConnectionCallback = Box<dyn Fn(Arc<Connection>) + Send + Sync>;

pub(crate) struct Shared {
    pub(crate) config: PoolConfig,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) codecs: Arc<CodecRegistry>,
    pub(crate) events: Events,
    pub(crate) id_alloc: ConnectionIdAllocator,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) new_connection_cb: std::sync::Mutex<Option<NewConnectionCallback>>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) destroyed: AtomicBool,
    /// Forwards control-plane frames from every connection's worker (§4.6)
    /// to the single dispatcher task that is allowed to mutate the
    /// registries on their behalf (§5: "mutated only by G").
    pub(crate) control_tx: flume::Sender<(ConnectionId, ControlEvent)>,
}

/// Cheaply `Clone`-able façade over the pool orchestrator, handed out by
/// [`Handle::create`] — the public entry point.
#[derive(Clone)]
pub struct Handle {
    pub(crate) shared: Arc<Shared>,
}

impl Handle {
    /// Load the persisted known-set, install trusted entries (never
    /// evictable), and return a handle (spec §4.7 `create`).
    pub async fn create(
        config: PoolConfig,
        authenticator: Arc<dyn Authenticator>,
        scheduler: Arc<dyn Scheduler>,
        codecs: CodecRegistry,
    ) -> Result<Self> {
        let mut points = PointRegistry::new(config.known_points_history_size);
        let mut peers = PeerRegistry::new(config.known_peer_ids_history_size);

        if let Some(path) = &config.peers_file {
            let (loaded_points, loaded_peers) = crate::persistence::load(path)?;
            for (addr, trusted, last_seen, last_known_peer_id) in loaded_points {
                let info = points.get_or_create(addr);
                info.trusted = trusted;
                info.last_seen = last_seen;
                info.last_known_peer_id = last_known_peer_id;
            }
            for (peer_id, trusted, metadata, score) in loaded_peers {
                let info = peers.get_or_create(peer_id.clone());
                info.trusted = trusted;
                info.metadata = metadata;
                info.score = score;
            }
        }

        for trusted_point in &config.trusted_points {
            let info = points.get_or_create(*trusted_point);
            info.trusted = true;
        }

        let (control_tx, control_rx) = flume::unbounded();

        let shared = Arc::new(Shared {
            events: Events::new(1024),
            id_alloc: ConnectionIdAllocator::default(),
            state: Mutex::new(PoolState {
                points,
                peers,
                connections: HashMap::new(),
                last_swap: HashMap::new(),
            }),
            new_connection_cb: std::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
            config,
            authenticator,
            scheduler,
            codecs: Arc::new(codecs),
            control_tx,
        });

        let handle = Self { shared };
        handle.spawn_control_dispatcher(control_rx);
        handle.spawn_swap_timer();
        Ok(handle)
    }

    /// The single task allowed to act on control-plane frames forwarded by
    /// every connection's worker (§4.6, §5): closes connections on
    /// `Disconnect`/decoding errors, replies to `Bootstrap`, merges
    /// `Advertise`, and runs the swap protocol (§4.8).
    fn spawn_control_dispatcher(&self, control_rx: flume::Receiver<(ConnectionId, ControlEvent)>) {
        let handle = self.clone();
        let shutdown = self.shared.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = control_rx.recv_async() => {
                        match received {
                            Ok((id, event)) => dispatch_control(&handle, id, event).await,
                            Err(_) => break,
                        }
                    }
                }
            }
        });
    }

    /// Periodic peer swapping under rate-limit (spec §4.8, §9 "implementation
    /// choice"): attempts a swap roughly once per `swap_linger` window.
    fn spawn_swap_timer(&self) {
        let handle = self.clone();
        let shutdown = self.shared.shutdown.clone();
        let period = self.shared.config.swap_linger();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => crate::swap::send_swap_request(&handle).await,
                }
            }
        });
    }

    /// Run the outbound handshake pipeline (spec §4.5) for `point`.
    pub async fn connect(&self, point: SocketAddr, timeout: Option<std::time::Duration>) -> Result<Arc<Connection>> {
        let budget = timeout.unwrap_or_else(|| self.shared.config.connection_timeout());
        match tokio::time::timeout(budget, self.do_outbound(point)).await {
            Ok(result) => result,
            Err(_) => {
                self.fail_point(point, "connection_timeout").await;
                Err(Error::ConnectionTimeout)
            }
        }
    }

    /// Enqueue the inbound handshake pipeline for an accepted socket
    /// (spec §4.5). Non-blocking: returns immediately, the handshake runs
    /// on its own task. If the half-open cap is already exceeded the
    /// socket is dropped without spawning anything.
    pub async fn accept(&self, stream: tokio::net::TcpStream, point: SocketAddr) {
        {
            let state = self.shared.state.lock().await;
            if state.half_open_incoming() >= self.shared.config.max_incoming_connections {
                tracing::debug!(target: "pool", %point, "dropping inbound connection, half-open cap reached");
                return;
            }
        }

        let this = self.clone();
        tokio::spawn(async move {
            let budget = this.shared.config.connection_timeout();
            match tokio::time::timeout(budget, this.do_inbound(stream, point)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::debug!(target: "pool", %point, error = %e, "inbound handshake failed");
                }
                Err(_) => {
                    this.fail_point(point, "connection_timeout").await;
                }
            }
        });
    }

    pub async fn active_connections(&self) -> usize {
        self.shared.state.lock().await.active_connections()
    }

    pub async fn pool_stat(&self) -> Stat {
        self.shared.scheduler.pool_stat()
    }

    /// Install the single callback invoked after step 6 of the handshake
    /// pipeline (spec §4.7). Replaces any previously installed callback.
    pub fn on_new_connection<F>(&self, cb: F)
    where
        F: Fn(Arc<Connection>) + Send + Sync + 'static,
    {
        *self
            .shared
            .new_connection_cb
            .lock()
            .expect("new_connection callback lock poisoned") = Some(Box::new(cb));
    }

    /// A live stream of [`crate::events::PoolEvent`] values and a
    /// stopper (spec §4.7).
    pub fn watch(&self) -> (EventStream, Stopper) {
        self.shared.events.watch()
    }

    pub async fn wait_too_few(&self) {
        self.shared.events.wait_too_few().await
    }

    pub async fn wait_too_many(&self) {
        self.shared.events.wait_too_many().await
    }

    pub fn set_trusted(&self, peer_id: &PeerId) {
        // set_trusted/unset_trusted never touch state enough to need the
        // async lock's full critical section guarantees beyond a single
        // field write; still routed through the same registries.
        let shared = self.shared.clone();
        let peer_id = peer_id.clone();
        tokio::spawn(async move {
            shared.state.lock().await.peers.set_trusted(&peer_id);
        });
    }

    /// Signal shutdown, disconnect all connections with `wait=true`,
    /// persist the known-set, and return only once every worker has
    /// exited (spec §4.7 `destroy`).
    pub async fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown.cancel();

        let ids: Vec<ConnectionId> = {
            let state = self.shared.state.lock().await;
            state.connections.keys().copied().collect()
        };
        for id in ids {
            close_connection(self, id, "pool_shutdown").await;
        }

        if let Some(path) = self.shared.config.peers_file.clone() {
            let state = self.shared.state.lock().await;
            if let Err(e) = crate::persistence::save(&path, &state.points, &state.peers) {
                tracing::warn!(target: "pool", error = %e, "failed to persist known-set on shutdown");
            }
        }
    }

    /// Evaluate `|connections|` against `min_connections`/`max_connections`
    /// and (idempotently) raise/lower the `too_few`/`too_many` conditions
    /// (spec §4.7).
    pub(crate) async fn signal_capacity(&self) {
        let count = self.shared.state.lock().await.active_connections();
        self.shared
            .events
            .set_too_few(count < self.shared.config.min_connections);
        self.shared
            .events
            .set_too_many(count >= self.shared.config.max_connections);
    }

    /// GC both registries if their upper bound was exceeded (spec §4.1),
    /// and persist if persistence is configured.
    pub(crate) async fn run_gc(&self) {
        let mut state = self.shared.state.lock().await;
        if let Some((upper, lower)) = self.shared.config.max_known_points {
            let evicted = state.points.gc(upper, lower);
            for point in evicted {
                self.shared
                    .events
                    .broadcast(crate::events::PoolEvent::Evicted { point: Some(point), peer_id: None })
                    .ok();
            }
        }
        if let Some((upper, lower)) = self.shared.config.max_known_peer_ids {
            let evicted = state.peers.gc(upper, lower);
            for peer_id in evicted {
                self.shared
                    .events
                    .broadcast(crate::events::PoolEvent::Evicted { point: None, peer_id: Some(peer_id) })
                    .ok();
            }
        }
    }

    pub(crate) async fn fail_point(&self, point: PointId, reason: &str) {
        let mut state = self.shared.state.lock().await;
        state.points.mark_disconnected(&point, reason.to_string());
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn peers_file(&self) -> Option<PathBuf> {
        self.shared.config.peers_file.clone()
    }
}

/// Tear down a connection and atomically update both associated state
/// machines (spec §3 "Connections ... their destruction updates both
/// associated state machines atomically"). Idempotent: a connection id no
/// longer present in the registry is a no-op.
///
/// Used both for locally-initiated closes (swap eviction, `destroy`) and
/// for closes forwarded by a connection's own worker (remote `Disconnect`,
/// decoding errors) via [`dispatch_control`].
pub(crate) async fn close_connection(handle: &Handle, id: ConnectionId, reason: &str) {
    let connection = {
        let state = handle.shared.state.lock().await;
        state.connections.get(&id).cloned()
    };
    if let Some(connection) = &connection {
        connection.disconnect(true).await;
    }

    let mut state = handle.shared.state.lock().await;
    let Some(connection) = state.connections.remove(&id) else {
        return;
    };
    let info = connection.info().clone();
    state.points.mark_disconnected(&info.point, reason.to_string());
    state.peers.mark_disconnected(&info.peer_id, reason.to_string());
    state.last_swap.remove(&id);
    drop(state);

    handle.shared.scheduler.unregister(id);
    handle
        .shared
        .events
        .broadcast(PoolEvent::Disconnected {
            connection: id,
            peer_id: info.peer_id,
            point: info.point,
            reason: reason.to_string(),
        })
        .ok();
    handle.signal_capacity().await;
    handle.run_gc().await;
}

/// Acts on a control-plane frame forwarded by a connection's worker
/// (spec §4.6); the only path through which F is allowed to mutate
/// registry state, by routing back through G (spec §5).
pub(crate) async fn dispatch_control(handle: &Handle, id: ConnectionId, event: ControlEvent) {
    match event {
        ControlEvent::Disconnect => close_connection(handle, id, "remote_disconnect").await,
        ControlEvent::DecodingError(reason) => {
            close_connection(handle, id, &format!("decoding_error: {reason}")).await
        }
        ControlEvent::Bootstrap => handle_bootstrap(handle, id).await,
        ControlEvent::Advertise(points) => handle_advertise(handle, points).await,
        ControlEvent::SwapRequest { point, peer } => {
            crate::swap::handle_swap_request(handle, id, point, peer).await
        }
        ControlEvent::SwapAck { point, peer } => {
            crate::swap::handle_swap_ack(handle, id, point, peer).await
        }
    }
}

/// Default cap on how many points are offered in one `Advertise` reply
/// (spec §8 scenario 4: "up to N known points").
const BOOTSTRAP_SAMPLE_SIZE: usize = 23;

/// Reply to an inbound `Bootstrap` with `Advertise(sample_of_known_points)`
/// (spec §4.6).
async fn handle_bootstrap(handle: &Handle, from: ConnectionId) {
    let (connection, sample) = {
        let state = handle.shared.state.lock().await;
        let Some(connection) = state.connections.get(&from).cloned() else {
            return;
        };
        let mut points: Vec<PointId> = state.points.iter().map(|(id, _)| *id).collect();
        fastrand::shuffle(&mut points);
        points.truncate(BOOTSTRAP_SAMPLE_SIZE);
        (connection, points)
    };

    let frame = Frame::Advertise(sample);
    if let Ok(bytes) = crate::message::encode_frame(&frame) {
        let _ = connection.raw_write_sync(&bytes).await;
    }
}

/// Merge an inbound `Advertise` into the known-set (spec §4.6: "never
/// auto-connect, policy left to the orchestrator"), bounded by the next
/// GC pass.
async fn handle_advertise(handle: &Handle, points: Vec<PointId>) {
    {
        let mut state = handle.shared.state.lock().await;
        for point in points {
            state.points.get_or_create(point);
        }
    }
    handle.run_gc().await;
}
