//! Control-Message Worker (spec §4.6): the single task owning the read
//! side of TRANSPORT for one connection. Dispatches each framed message
//! either to an internal handler (disconnect/bootstrap/advertise/swap)
//! or to the app-queue for user messages.
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::connection::{decode_wire, ConnectionId};
use crate::message::{CodecRegistry, Frame};
use crate::registry::peer::PeerId;
use crate::registry::point::PointId;
use crate::transport::FrameReader;

/// What the worker observed for a frame it could not route to the
/// app-queue by itself; the pool orchestrator handles these because they
/// touch shared registry state (spec §5: "mutated only by G").
pub enum ControlEvent {
    Disconnect,
    Bootstrap,
    Advertise(Vec<PointId>),
    SwapRequest { point: PointId, peer: PeerId },
    SwapAck { point: PointId, peer: PeerId },
    DecodingError(String),
}

/// Runs the read loop for one connection until EOF, a protocol error, or
/// cancellation. Internal control events are forwarded on `control_tx` for
/// the orchestrator to act on; user messages are decoded and pushed to
/// the bounded app-queue, applying backpressure (spec §4.6: "if queue
/// full, apply backpressure by suspending the worker until a slot
/// frees") by sending on the async (await-based) side of the channel.
pub async fn run<R: FrameReader>(
    id: ConnectionId,
    mut reader: R,
    codecs: Arc<CodecRegistry>,
    app_queue_tx: flume::Sender<crate::message::AppMessage>,
    control_tx: flume::Sender<(ConnectionId, ControlEvent)>,
    scheduler: Arc<dyn crate::scheduler::Scheduler>,
    cancel: CancellationToken,
    done: tokio::sync::watch::Sender<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.read_frame() => frame,
        };

        let bytes = match frame {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                let _ = control_tx
                    .send_async((id, ControlEvent::DecodingError(e.to_string())))
                    .await;
                break;
            }
        };
        scheduler.account_read(id, bytes.len());

        let (tag, body) = match decode_wire(&bytes) {
            Ok(v) => v,
            Err(e) => {
                let _ = control_tx
                    .send_async((id, ControlEvent::DecodingError(e.to_string())))
                    .await;
                break;
            }
        };

        if let Some(max_len) = codecs.max_length(tag) {
            if body.len() > max_len {
                let _ = control_tx
                    .send_async((
                        id,
                        ControlEvent::DecodingError(format!(
                            "frame for tag {tag:#x} exceeds max_length {max_len}"
                        )),
                    ))
                    .await;
                break;
            }
        }

        let frame = match Frame::decode(tag, &body) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = control_tx
                    .send_async((id, ControlEvent::DecodingError(e.to_string())))
                    .await;
                break;
            }
        };

        match frame {
            Frame::Disconnect => {
                let _ = control_tx.send_async((id, ControlEvent::Disconnect)).await;
                break;
            }
            Frame::Bootstrap => {
                if control_tx
                    .send_async((id, ControlEvent::Bootstrap))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Frame::Advertise(points) => {
                if control_tx
                    .send_async((id, ControlEvent::Advertise(points)))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Frame::SwapRequest { point, peer } => {
                if control_tx
                    .send_async((id, ControlEvent::SwapRequest { point, peer }))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Frame::SwapAck { point, peer } => {
                if control_tx
                    .send_async((id, ControlEvent::SwapAck { point, peer }))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Frame::Message { tag, payload } => match codecs.decode(tag, &payload) {
                Ok(msg) => {
                    // Backpressure: the async send suspends the worker
                    // (not the whole pool) until a slot frees, but still
                    // races cancellation so `disconnect(wait=true)` can
                    // unblock a worker stuck behind a full app-queue.
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        res = app_queue_tx.send_async(msg) => {
                            if res.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    let _ = control_tx
                        .send_async((id, ControlEvent::DecodingError(e.to_string())))
                        .await;
                    break;
                }
            },
        }
    }

    let _ = done.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct ScriptedReader {
        frames: std::collections::VecDeque<Vec<u8>>,
    }

    #[async_trait]
    impl FrameReader for ScriptedReader {
        async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, crate::transport::Error> {
            Ok(self.frames.pop_front())
        }
    }

    #[tokio::test]
    async fn bootstrap_frame_is_routed_as_control_event_not_app_message() {
        let reader = ScriptedReader {
            frames: std::collections::VecDeque::from(vec![vec![crate::message::TAG_BOOTSTRAP]]),
        };
        let codecs = Arc::new(CodecRegistry::new());
        let (app_tx, app_rx) = flume::unbounded();
        let (control_tx, control_rx) = flume::unbounded();
        let scheduler: Arc<dyn crate::scheduler::Scheduler> =
            Arc::new(crate::scheduler::AtomicScheduler::new());
        scheduler.register(ConnectionId::new(0));
        let cancel = CancellationToken::new();
        let (done_tx, _done_rx) = tokio::sync::watch::channel(false);

        run(
            ConnectionId::new(0),
            reader,
            codecs,
            app_tx,
            control_tx,
            scheduler,
            cancel,
            done_tx,
        )
        .await;

        assert!(app_rx.try_recv().is_err());
        let (_, event) = control_rx.try_recv().expect("bootstrap event expected");
        assert!(matches!(event, ControlEvent::Bootstrap));
    }
}
