//! Handshake Pipeline (spec §4.5): dial/accept → authenticate → version
//! negotiate → register, as the six sequential phases bounded by
//! `connection_timeout` end-to-end (enforced by the caller, `Handle::connect`
//! / `Handle::accept`) and `authentication_timeout` on phase 4 alone.
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionInfo};
use crate::error::{Error, Result};
use crate::pool::Handle;
use crate::registry::point::PointId;
use crate::time::Timestamp;
use crate::transport::Authenticated;
use crate::worker;

impl Handle {
    /// Phases 1–6 for an outbound dial.
    pub(crate) async fn do_outbound(&self, point: PointId) -> Result<Arc<Connection>> {
        // Phase 1: acquire slot.
        {
            let state = self.shared.state.lock().await;
            if state.active_connections() >= self.shared.config.max_connections {
                return Err(Error::TooManyConnections);
            }
            if self.shared.config.closed_network && !state.points.is_trusted(&point) {
                return Err(Error::Rejected);
            }
        }

        // Phase 2: transition point to Requested.
        {
            let mut state = self.shared.state.lock().await;
            state.points.begin_outbound(point)?;
        }

        // Phase 3: socket setup.
        let stream = match TcpStream::connect(point).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_point(point, "dial_failed").await;
                tracing::debug!(target: "pool", %point, error = %e, "dial failed");
                return Err(Error::ConnectionRefused);
            }
        };
        let local_addr = stream.local_addr()?;

        self.shared
            .events
            .broadcast(crate::events::PoolEvent::Dialed { point })
            .ok();

        // Phase 4: authenticate.
        let authenticated = match tokio::time::timeout(
            self.shared.config.authentication_timeout(),
            self.shared.authenticator.authenticate_outbound(
                stream,
                self.shared.config.proof_of_work_target,
                &self.shared.config.identity,
                &self.shared.config.message.versions,
                self.shared.config.listening_port,
            ),
        )
        .await
        {
            Ok(Ok(authenticated)) => authenticated,
            Ok(Err(e)) => {
                self.fail_point(point, "authentication_failed").await;
                return Err(map_auth_error(e));
            }
            Err(_) => {
                self.fail_point(point, "authentication_timeout").await;
                return Err(Error::AuthenticationTimeout);
            }
        };

        if authenticated.peer_id.as_bytes() == self.shared.config.identity.public_id {
            self.fail_point(point, "self_dial").await;
            let _ = authenticated.writer.close().await;
            return Err(Error::Myself);
        }

        self.finish_handshake(point, false, local_addr, point, authenticated)
            .await
    }

    /// Phases 1–6 for an inbound accept.
    pub(crate) async fn do_inbound(&self, stream: TcpStream, point: PointId) -> Result<Arc<Connection>> {
        // Phase 1: acquire slot (half-open is checked by the caller before
        // spawning this task; re-check the hard cap here too).
        {
            let state = self.shared.state.lock().await;
            if state.active_connections() >= self.shared.config.max_connections {
                return Err(Error::TooManyConnections);
            }
            if self.shared.config.closed_network && !state.points.is_trusted(&point) {
                return Err(Error::Rejected);
            }
        }

        let local_addr = stream.local_addr()?;

        // Phase 4: authenticate (phases 2/3 for inbound are folded in:
        // the point is provisionally `Accepted` only once we know the
        // peer id coming out of authentication).
        let authenticated = match tokio::time::timeout(
            self.shared.config.authentication_timeout(),
            self.shared.authenticator.authenticate_inbound(
                stream,
                self.shared.config.proof_of_work_target,
                &self.shared.config.identity,
                &self.shared.config.message.versions,
                self.shared.config.listening_port,
            ),
        )
        .await
        {
            Ok(Ok(authenticated)) => authenticated,
            Ok(Err(e)) => {
                self.fail_point(point, "authentication_failed").await;
                return Err(map_auth_error(e));
            }
            Err(_) => {
                self.fail_point(point, "authentication_timeout").await;
                return Err(Error::AuthenticationTimeout);
            }
        };

        if authenticated.peer_id.as_bytes() == self.shared.config.identity.public_id {
            self.fail_point(point, "self_dial").await;
            let _ = authenticated.writer.close().await;
            return Err(Error::Myself);
        }

        // Phase 2: transition point to Accepted{peer_id} now that the
        // tentative peer id is known.
        {
            let mut state = self.shared.state.lock().await;
            if let Err(e) = state.points.begin_inbound(point, authenticated.peer_id.clone()) {
                drop(state);
                let _ = authenticated.writer.close().await;
                return Err(e);
            }
        }

        self.shared
            .events
            .broadcast(crate::events::PoolEvent::Accepted { point })
            .ok();

        self.finish_handshake(point, true, local_addr, point, authenticated)
            .await
    }

    /// Phases 5–6, shared by dial and accept: register in A/C, mark
    /// Point/Peer Running, cross-link, spawn the control worker, fire
    /// `new_peer`/`new_connection`, run GC and capacity signals.
    async fn finish_handshake(
        &self,
        point: PointId,
        incoming: bool,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        authenticated: Authenticated,
    ) -> Result<Arc<Connection>> {
        let id = self.shared.id_alloc.next();
        let peer_id = authenticated.peer_id.clone();

        // Invariant 4 (at most one Running Connection per peer) and the
        // point/peer tie-break (spec §4.2): whichever handshake reaches
        // this check first wins; the loser is closed with `AlreadyConnected`.
        let is_new_peer = {
            let mut state = self.shared.state.lock().await;
            if state.peers.is_running(&peer_id) {
                state.points.mark_disconnected(&point, "already_connected");
                drop(state);
                let _ = authenticated.writer.close().await;
                return Err(Error::AlreadyConnected);
            }

            let is_new_peer = state.peers.get(&peer_id).is_none();

            state.points.complete_running(&point, peer_id.clone(), id)?;
            state
                .peers
                .begin_running(peer_id.clone(), id, point)
                .map_err(|e| {
                    state.points.mark_disconnected(&point, "already_connected");
                    e
                })?;
            is_new_peer
        };

        self.shared.scheduler.register(id);

        let (app_tx, app_rx) = match self.shared.config.incoming_app_message_queue_size {
            Some(n) => flume::bounded(n),
            None => flume::unbounded(),
        };
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = tokio::sync::watch::channel(false);
        let disconnecting = Arc::new(AtomicBool::new(false));

        let info = ConnectionInfo {
            id,
            point,
            peer_id: peer_id.clone(),
            incoming,
            negotiated_version: authenticated.negotiated_version,
            declared_listening_port: authenticated.peer_listening_port,
            local_addr,
            remote_addr,
            established_at: Timestamp::now(),
        };

        let connection = Arc::new(Connection::new(
            info,
            authenticated.writer,
            self.shared.codecs.clone(),
            app_rx,
            self.shared.scheduler.clone(),
            disconnecting,
            cancel.clone(),
            done_rx,
        ));

        {
            let mut state = self.shared.state.lock().await;
            state.connections.insert(id, connection.clone());
        }

        tokio::spawn(worker::run(
            id,
            authenticated.reader,
            self.shared.codecs.clone(),
            app_tx,
            self.shared.control_tx.clone(),
            self.shared.scheduler.clone(),
            cancel,
            done_tx,
        ));

        if is_new_peer {
            self.shared.events.emit_new_peer(peer_id.clone()).await;
        }
        self.shared.events.emit_new_connection(id).await;
        self.signal_capacity().await;
        self.run_gc().await;

        if let Some(cb) = self
            .shared
            .new_connection_cb
            .lock()
            .expect("new_connection callback lock poisoned")
            .as_ref()
        {
            cb(connection.clone());
        }

        self.shared
            .events
            .broadcast(crate::events::PoolEvent::Connected {
                connection: id,
                peer_id,
                point,
            })
            .ok();

        Ok(connection)
    }
}

fn map_auth_error(e: crate::transport::Error) -> Error {
    match e {
        crate::transport::Error::ProofOfWorkRejected => Error::AuthenticationFailed,
        crate::transport::Error::NoCommonProtocol => Error::NoCommonProtocol,
        crate::transport::Error::Malformed(msg) => Error::DecodingError(msg),
        crate::transport::Error::Io(e) => Error::Io(e),
        crate::transport::Error::Closed => Error::ConnectionClosed,
    }
}

