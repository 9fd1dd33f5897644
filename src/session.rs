//! Per-client TNP session.
//!
//! Owns one TCP connection: reads bytes into a receive buffer, drains
//! complete frames, dispatches requests against the mirror, and forwards
//! notification fanout back onto the socket. Every inbound frame with
//! response code 0 is treated as a request; sequence numbers are echoed into
//! responses and never used for classification.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::mirror::{GattMirror, MirrorError, SessionId, NOTIFY_QUEUE_DEPTH};
use crate::tnp::{self, msg, resp, Decoded, Frame};

/// Read chunk size; frames larger than one chunk accumulate across reads.
const RECEIVE_BUFFER_SIZE: usize = 256;

/// Releases the mirror registration on every exit path, normal or not.
struct SessionGuard {
    mirror: Arc<GattMirror>,
    session: SessionId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.mirror.drop_session(self.session);
    }
}

/// Serve one TNP client until EOF or I/O error.
pub async fn run(stream: TcpStream, mirror: Arc<GattMirror>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());

    let (notif_tx, mut notif_rx) = mpsc::channel(NOTIFY_QUEUE_DEPTH);
    let session = mirror.attach(notif_tx);
    let _guard = SessionGuard {
        mirror: mirror.clone(),
        session,
    };
    info!("TNP client {} connected as session {}", peer, session);

    let (mut reader, mut writer) = stream.into_split();
    let mut chunk = [0u8; RECEIVE_BUFFER_SIZE];
    let mut pending: Vec<u8> = Vec::with_capacity(RECEIVE_BUFFER_SIZE);
    let mut last_sequence: u8 = 0;

    loop {
        tokio::select! {
            read = reader.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        info!(
                            "TNP client {} disconnected (last sequence {})",
                            peer, last_sequence
                        );
                        return;
                    }
                    Ok(n) => {
                        pending.extend_from_slice(&chunk[..n]);
                        loop {
                            match tnp::decode(&pending) {
                                Decoded::Incomplete => break,
                                Decoded::Frame { frame, consumed } => {
                                    pending.drain(..consumed);
                                    if let Err(e) = handle_frame(
                                        &frame,
                                        &mirror,
                                        session,
                                        &mut last_sequence,
                                        &mut writer,
                                    )
                                    .await
                                    {
                                        warn!("TNP client {} write error: {}", peer, e);
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("TNP client {} read error: {}", peer, e);
                        return;
                    }
                }
            }
            notification = notif_rx.recv() => {
                match notification {
                    Some(n) => {
                        let bytes = Frame::notification(&n.uuid, &n.value).encode();
                        if let Err(e) = writer.write_all(&bytes).await {
                            warn!("TNP client {} notify error: {}", peer, e);
                            return;
                        }
                    }
                    None => return,
                }
            }
        }
    }
}

/// Classify and answer one inbound frame. Only socket errors propagate;
/// every protocol-level failure is answered on the wire with the request's
/// sequence echoed.
async fn handle_frame(
    frame: &Frame,
    mirror: &Arc<GattMirror>,
    session: SessionId,
    last_sequence: &mut u8,
    writer: &mut OwnedWriteHalf,
) -> std::io::Result<()> {
    if frame.response_code != resp::SUCCESS {
        debug!(
            "Inbound response frame (id 0x{:02X}, code 0x{:02X}), ignoring",
            frame.message_id, frame.response_code
        );
        return Ok(());
    }
    if frame.message_id == msg::NOTIFICATION {
        debug!("Inbound peer notification, ignoring");
        return Ok(());
    }

    let sequence = frame.sequence;
    *last_sequence = sequence;

    if frame.version != tnp::PROTOCOL_VERSION {
        debug!("Protocol version {} unsupported", frame.version);
        return send(
            writer,
            Frame::error(frame.message_id, sequence, resp::UNKNOWN_PROTOCOL),
        )
        .await;
    }

    match frame.message_id {
        msg::DISCOVER_SERVICES => {
            if !frame.body.is_empty() {
                return send(
                    writer,
                    Frame::error(frame.message_id, sequence, resp::UNEXPECTED_ERROR),
                )
                .await;
            }
            let services = mirror.advertised_services();
            debug!("Answering service discovery with {} services", services.len());
            send(
                writer,
                Frame::response(frame.message_id, sequence, tnp::services_body(&services)),
            )
            .await
        }

        msg::DISCOVER_CHARACTERISTICS => {
            if frame.body.len() != 16 {
                return send(
                    writer,
                    Frame::error(frame.message_id, sequence, resp::UNEXPECTED_ERROR),
                )
                .await;
            }
            let Some(service) = tnp::uuid_from_wire(&frame.body) else {
                return send(
                    writer,
                    Frame::error(frame.message_id, sequence, resp::UNEXPECTED_ERROR),
                )
                .await;
            };
            match mirror.characteristics(&service) {
                Ok(characteristics) => {
                    let entries: Vec<(uuid::Uuid, u8)> = characteristics
                        .into_iter()
                        .map(|(uuid, props)| (uuid, props.bits()))
                        .collect();
                    send(
                        writer,
                        Frame::response(
                            frame.message_id,
                            sequence,
                            tnp::characteristics_body(&service, &entries),
                        ),
                    )
                    .await
                }
                Err(e) => {
                    send(
                        writer,
                        Frame::error(frame.message_id, sequence, error_code(e)),
                    )
                    .await
                }
            }
        }

        msg::READ_CHARACTERISTIC => {
            if frame.body.len() != 16 {
                return send(
                    writer,
                    Frame::error(frame.message_id, sequence, resp::UNEXPECTED_ERROR),
                )
                .await;
            }
            let Some(uuid) = tnp::uuid_from_wire(&frame.body) else {
                return send(
                    writer,
                    Frame::error(frame.message_id, sequence, resp::UNEXPECTED_ERROR),
                )
                .await;
            };
            match mirror.read(&uuid) {
                Ok(value) => {
                    send(
                        writer,
                        Frame::response(
                            frame.message_id,
                            sequence,
                            tnp::uuid_value_body(&uuid, &value),
                        ),
                    )
                    .await
                }
                Err(e) => {
                    send(
                        writer,
                        Frame::error(frame.message_id, sequence, error_code(e)),
                    )
                    .await
                }
            }
        }

        msg::WRITE_CHARACTERISTIC => {
            if frame.body.len() < 16 {
                return send(
                    writer,
                    Frame::error(frame.message_id, sequence, resp::UNEXPECTED_ERROR),
                )
                .await;
            }
            let Some(uuid) = tnp::uuid_from_wire(&frame.body) else {
                return send(
                    writer,
                    Frame::error(frame.message_id, sequence, resp::UNEXPECTED_ERROR),
                )
                .await;
            };
            let value = &frame.body[16..];
            match mirror.commit_write(&uuid, value) {
                Ok(handler) => {
                    // Acknowledge before the handler runs so the ack always
                    // precedes any notifications the handler triggers.
                    send(
                        writer,
                        Frame::response(frame.message_id, sequence, tnp::uuid_body(&uuid)),
                    )
                    .await?;
                    if let Some(handler) = handler {
                        handler(value);
                    }
                    Ok(())
                }
                Err(e) => {
                    send(
                        writer,
                        Frame::error(frame.message_id, sequence, error_code(e)),
                    )
                    .await
                }
            }
        }

        msg::ENABLE_NOTIFICATIONS => {
            if frame.body.len() < 16 {
                return send(
                    writer,
                    Frame::error(frame.message_id, sequence, resp::UNEXPECTED_ERROR),
                )
                .await;
            }
            let Some(uuid) = tnp::uuid_from_wire(&frame.body) else {
                return send(
                    writer,
                    Frame::error(frame.message_id, sequence, resp::UNEXPECTED_ERROR),
                )
                .await;
            };
            if frame.body.len() == 16 {
                // No payload: the peer acknowledging one of our frames.
                debug!("Enable-notifications ack for {}", uuid);
                return Ok(());
            }
            // Payload byte 16 governs enable/disable; extra bytes are an
            // interoperability quirk and ignored.
            let enable = frame.body[16] != 0;
            let result = if enable {
                mirror.subscribe(session, &uuid)
            } else {
                mirror.unsubscribe(session, &uuid)
            };
            match result {
                Ok(()) => {
                    debug!(
                        "Session {} {} notifications for {}",
                        session,
                        if enable { "enabled" } else { "disabled" },
                        uuid
                    );
                    send(
                        writer,
                        Frame::response(frame.message_id, sequence, tnp::uuid_body(&uuid)),
                    )
                    .await
                }
                Err(e) => {
                    send(
                        writer,
                        Frame::error(frame.message_id, sequence, error_code(e)),
                    )
                    .await
                }
            }
        }

        unknown => {
            debug!("Unknown message identifier 0x{:02X}", unknown);
            send(
                writer,
                Frame::error(unknown, sequence, resp::UNKNOWN_MESSAGE_TYPE),
            )
            .await
        }
    }
}

fn error_code(e: MirrorError) -> u8 {
    match e {
        MirrorError::UnknownService => resp::SERVICE_NOT_FOUND,
        MirrorError::UnknownCharacteristic => resp::CHARACTERISTIC_NOT_FOUND,
        MirrorError::NotReadable | MirrorError::NotWritable | MirrorError::NotSubscribable => {
            resp::OPERATION_NOT_SUPPORTED
        }
        MirrorError::ValueTooLarge => resp::WRITE_FAILED,
    }
}

async fn send(writer: &mut OwnedWriteHalf, frame: Frame) -> std::io::Result<()> {
    writer.write_all(&frame.encode()).await
}
