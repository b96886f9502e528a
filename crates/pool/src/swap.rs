//! Swap Engine (spec §4.8, component H): periodically replaces a
//! connected peer with a "fresher" one advertised by a neighbor, under a
//! per-connection rate limit (`swap_linger`).
//!
//! No teacher counterpart; modeled after the rate-limited maintenance
//! loops the pack's other node implementations use for connection
//! churn, grounded in this crate's own control-message plumbing
//! (`worker::ControlEvent`, `message::Frame`).
use std::sync::Arc;

use crate::connection::{Connection, ConnectionId};
use crate::events::PoolEvent;
use crate::message::{encode_frame, Frame};
use crate::pool::{close_connection, Handle};
use crate::registry::peer::PeerId;
use crate::registry::point::PointId;
use crate::time::Timestamp;

/// `send_swap_request(pool)` (spec §4.8): pick a random Running
/// connection `A` and a known-set candidate not currently connected, and
/// send it `Swap_request(point, peer)` over `A`.
pub(crate) async fn send_swap_request(handle: &Handle) {
    let Some((connection, point, peer)) = pick_candidate(handle).await else {
        return;
    };

    let frame = Frame::SwapRequest { point, peer };
    let Ok(bytes) = encode_frame(&frame) else {
        return;
    };
    if connection.raw_write_sync(&bytes).await.is_ok() {
        handle
            .shared
            .events
            .broadcast(PoolEvent::SwapRequested { point })
            .ok();
    }
}

async fn pick_candidate(handle: &Handle) -> Option<(Arc<Connection>, PointId, PeerId)> {
    let state = handle.shared.state.lock().await;
    if state.connections.is_empty() {
        return None;
    }

    let candidates: Vec<(PointId, PeerId)> = state
        .points
        .iter()
        .filter_map(|(point, info)| info.last_known_peer_id.as_ref().map(|pid| (*point, pid.clone())))
        .filter(|(_, peer_id)| !state.peers.is_running(peer_id))
        .collect();
    if candidates.is_empty() {
        return None;
    }
    let (point, peer) = candidates[fastrand::usize(..candidates.len())].clone();

    let connections: Vec<Arc<Connection>> = state.connections.values().cloned().collect();
    let connection = connections[fastrand::usize(..connections.len())].clone();

    Some((connection, point, peer))
}

/// Handle an inbound `Swap_request(point, peer)` received over connection
/// `from` (spec §4.8): ignored if rate-limited, otherwise attempt to
/// connect to `point`, and if successful and spare capacity remains,
/// evict a victim and reply `Swap_ack`.
pub(crate) async fn handle_swap_request(handle: &Handle, from: ConnectionId, point: PointId, candidate: PeerId) {
    if is_rate_limited(handle, from).await {
        return;
    }

    let Ok(new_connection) = handle.connect(point, None).await else {
        return;
    };
    if new_connection.info().peer_id != candidate {
        tracing::debug!(
            target: "pool",
            %point,
            expected = %candidate,
            actual = %new_connection.info().peer_id,
            "swap candidate connected under a different peer id than advertised",
        );
    }

    let has_spare_capacity = {
        let state = handle.shared.state.lock().await;
        state.active_connections() > handle.shared.config.min_connections
    };
    if !has_spare_capacity {
        close_connection(handle, new_connection.info().id, "swap_no_spare_capacity").await;
        return;
    }

    let Some(victim) = pick_victim(handle, new_connection.info().id, from).await else {
        close_connection(handle, new_connection.info().id, "swap_no_victim").await;
        return;
    };

    let victim_point = victim.info().point;
    let victim_peer = victim.info().peer_id.clone();
    close_connection(handle, victim.info().id, "swap_victim").await;

    reply_swap_ack(handle, from, victim_point, victim_peer.clone()).await;
    mark_swapped(handle, from).await;
    handle
        .shared
        .events
        .broadcast(PoolEvent::SwapAcked { point: victim_point })
        .ok();
}

/// Open question (spec §9): the exact victim-selection policy is
/// implementation-defined; this picks the least-recently-active
/// non-trusted connection (oldest `established_at`), excluding the
/// freshly-connected replacement and the connection the request arrived
/// on.
async fn pick_victim(handle: &Handle, exclude_a: ConnectionId, exclude_b: ConnectionId) -> Option<Arc<Connection>> {
    let state = handle.shared.state.lock().await;
    state
        .connections
        .values()
        .filter(|c| c.info().id != exclude_a && c.info().id != exclude_b)
        .filter(|c| !state.points.is_trusted(&c.info().point))
        .min_by_key(|c| c.info().established_at)
        .cloned()
}

async fn reply_swap_ack(handle: &Handle, to: ConnectionId, point: PointId, peer: PeerId) {
    let connection = {
        let state = handle.shared.state.lock().await;
        state.connections.get(&to).cloned()
    };
    let Some(connection) = connection else {
        return;
    };
    let frame = Frame::SwapAck { point, peer };
    if let Ok(bytes) = encode_frame(&frame) {
        let _ = connection.raw_write_sync(&bytes).await;
    }
}

/// Handle an inbound `Swap_ack(point, peer)`: update the swap-linger
/// clock for the connection the original request went out on, and log
/// the new point (spec §4.8).
pub(crate) async fn handle_swap_ack(handle: &Handle, from: ConnectionId, point: PointId, _peer: PeerId) {
    mark_swapped(handle, from).await;
    handle
        .shared
        .events
        .broadcast(PoolEvent::SwapAcked { point })
        .ok();
}

async fn is_rate_limited(handle: &Handle, connection: ConnectionId) -> bool {
    let state = handle.shared.state.lock().await;
    match state.last_swap.get(&connection) {
        Some(last) => Timestamp::now().elapsed_since(*last) < handle.shared.config.swap_linger(),
        None => false,
    }
}

async fn mark_swapped(handle: &Handle, connection: ConnectionId) {
    handle
        .shared
        .state
        .lock()
        .await
        .last_swap
        .insert(connection, Timestamp::now());
}

