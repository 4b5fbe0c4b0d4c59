//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use lattice_utils::backoff::ExponentialBackoff;
use lattice_utils::task::Task;
use lattice_utils::Area;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::Sender;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, Instrument};

use crate::dual::DualMessage;
use crate::error::{Error, IoError};
use crate::types::{PeerSpec, Publication, Value, ValueDigest};

// Frames above this size indicate a protocol error.
const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

// Deadline for one full-sync round trip.
pub(crate) const FULL_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

// Bounds for the peer reconnect backoff.
pub(crate) const RECONNECT_MIN_BACKOFF: Duration = Duration::from_millis(200);
pub(crate) const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(8);

// Messages exchanged between stores over TCP. Frames are a u32 BE
// payload length followed by the bincode payload.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub enum Message {
    // Client's opening message: its whole key digest.
    FullSyncRequest {
        area: Area,
        sender_id: String,
        digest: BTreeMap<String, ValueDigest>,
    },
    // Server's answer: values the client is stale on, plus the server's
    // own digest so the client can push back what the server misses.
    FullSyncResponse {
        key_vals: BTreeMap<String, Value>,
        digest: BTreeMap<String, ValueDigest>,
    },
    // Live flooding.
    Flood {
        area: Area,
        publication: Publication,
        sender_id: String,
    },
    // Spanning-tree computation traffic.
    Dual {
        area: Area,
        message: DualMessage,
    },
    // Child (de)registration on the flood tree.
    FloodTopoSet {
        area: Area,
        root: String,
        child: String,
        set: bool,
    },
}

// Network events delivered to the store task.
#[derive(Debug)]
pub(crate) enum NetEvent {
    // An inbound connection completed a full-sync request.
    SyncRequest {
        area: Area,
        sender_id: String,
        digest: BTreeMap<String, ValueDigest>,
        responder: oneshot::Sender<Message>,
    },
    // A connection (either direction) is ready to carry outbound
    // messages to the named node.
    ConnUp {
        area: Area,
        node: String,
        sink: Sender<Message>,
    },
    ConnDown {
        area: Area,
        node: String,
        // Identifies which connection went down.
        sink: Sender<Message>,
    },
    // A peer task needs the local digest to open a full-sync.
    DigestRequest {
        area: Area,
        responder: oneshot::Sender<BTreeMap<String, ValueDigest>>,
    },
    // Full-sync response received by one of our peer tasks.
    SyncResponse {
        area: Area,
        peer: String,
        key_vals: BTreeMap<String, Value>,
        digest: BTreeMap<String, ValueDigest>,
    },
    // Inbound protocol message.
    Inbound {
        from: Option<String>,
        message: Message,
    },
}

// ===== frame I/O =====

pub(crate) async fn send_message(
    writer: &mut OwnedWriteHalf,
    message: &Message,
) -> Result<(), Error> {
    let payload =
        bincode::serde::encode_to_vec(message, bincode::config::standard())
            .map_err(Error::MessageEncode)?;
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(|error| Error::Io(IoError::SendError(error)))?;
    writer
        .write_all(&payload)
        .await
        .map_err(|error| Error::Io(IoError::SendError(error)))?;
    Ok(())
}

pub(crate) async fn recv_message(
    reader: &mut OwnedReadHalf,
) -> Result<Message, Error> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|error| Error::Io(IoError::RecvError(error)))?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|error| Error::Io(IoError::RecvError(error)))?;
    let (message, _) = bincode::serde::decode_from_slice(
        &payload,
        bincode::config::standard(),
    )
    .map_err(Error::MessageDecode)?;
    Ok(message)
}

// ===== listener =====

// Accept loop for inbound peer connections.
pub(crate) fn listener_task(
    listener: TcpListener,
    net_tx: Sender<NetEvent>,
) -> Task<()> {
    Task::spawn(
        async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let net_tx = net_tx.clone();
                        tokio::spawn(async move {
                            if let Err(error) =
                                serve_connection(stream, addr, net_tx).await
                            {
                                error.log();
                            }
                        });
                    }
                    Err(error) => {
                        Error::Io(IoError::AcceptError(error)).log();
                    }
                }
            }
        }
        .instrument(debug_span!("listener")),
    )
}

// Serves one inbound connection: answers its full-sync request, then
// relays floods in both directions until it closes.
async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    net_tx: Sender<NetEvent>,
) -> Result<(), Error> {
    let (mut reader, mut writer) = stream.into_split();

    // The first frame must be a full-sync request; it also names the
    // remote node.
    let (area, sender_id) = match recv_message(&mut reader).await? {
        Message::FullSyncRequest {
            area,
            sender_id,
            digest,
        } => {
            let (responder, response) = oneshot::channel();
            let _ = net_tx
                .send(NetEvent::SyncRequest {
                    area: area.clone(),
                    sender_id: sender_id.clone(),
                    digest,
                    responder,
                })
                .await;
            let response =
                response.await.map_err(|_| Error::StoreShutDown)?;
            send_message(&mut writer, &response).await?;
            (area, sender_id)
        }
        _ => {
            debug!(%addr, "connection didn't start with a sync request");
            return Err(Error::UnexpectedMessage);
        }
    };

    let (sink_tx, sink_rx) = mpsc::channel(64);
    let _ = net_tx
        .send(NetEvent::ConnUp {
            area: area.clone(),
            node: sender_id.clone(),
            sink: sink_tx.clone(),
        })
        .await;
    relay_connection(
        area, sender_id, reader, writer, net_tx, sink_tx, sink_rx,
    )
    .await
}

// Shared relay stage: pumps inbound frames to the store while a
// sibling task writes outbound messages, until the connection closes.
//
// The two directions run in separate tasks because a frame read must
// never be torn by an unrelated wakeup.
#[allow(clippy::too_many_arguments)]
async fn relay_connection(
    area: Area,
    node: String,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    net_tx: Sender<NetEvent>,
    sink_tx: Sender<Message>,
    mut sink_rx: mpsc::Receiver<Message>,
) -> Result<(), Error> {
    // Dropped (and thereby aborted) once the read side ends.
    let _writer_task: Task<()> = Task::spawn(async move {
        while let Some(message) = sink_rx.recv().await {
            if let Err(error) = send_message(&mut writer, &message).await
            {
                error.log();
                break;
            }
        }
    });

    let result = loop {
        match recv_message(&mut reader).await {
            Ok(message) => {
                if net_tx
                    .send(NetEvent::Inbound {
                        from: Some(node.clone()),
                        message,
                    })
                    .await
                    .is_err()
                {
                    break Ok(());
                }
            }
            Err(error) => break Err(error),
        }
    };

    let _ = net_tx
        .send(NetEvent::ConnDown {
            area,
            node,
            sink: sink_tx,
        })
        .await;
    result
}

// ===== peer client =====

// Outbound peer task: connects, runs the initial full-sync, then keeps
// the connection alive for flooding. Reconnects under backoff, redoing
// the full-sync each time.
pub(crate) fn peer_task(
    area: Area,
    node_name: String,
    peer_name: String,
    spec: PeerSpec,
    net_tx: Sender<NetEvent>,
) -> Task<()> {
    let span = debug_span!("peer", name = %peer_name);
    Task::spawn(
        async move {
            let mut backoff = ExponentialBackoff::new(
                RECONNECT_MIN_BACKOFF,
                RECONNECT_MAX_BACKOFF,
            );
            loop {
                if !backoff.can_try_now() {
                    tokio::time::sleep(backoff.time_until_retry()).await;
                }

                // Snapshot the local digest for the sync request.
                let (responder, response) = oneshot::channel();
                if net_tx
                    .send(NetEvent::DigestRequest {
                        area: area.clone(),
                        responder,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                let digest = match response.await {
                    Ok(digest) => digest,
                    // The store went away.
                    Err(_) => return,
                };

                match sync_and_relay(
                    &area,
                    &node_name,
                    &peer_name,
                    &spec,
                    digest,
                    &net_tx,
                )
                .await
                {
                    Ok(()) => backoff.report_success(),
                    Err(error) => {
                        error.log();
                        backoff.report_error();
                    }
                }
            }
        }
        .instrument(span),
    )
}

async fn sync_and_relay(
    area: &Area,
    node_name: &str,
    peer_name: &str,
    spec: &PeerSpec,
    digest: BTreeMap<String, ValueDigest>,
    net_tx: &Sender<NetEvent>,
) -> Result<(), Error> {
    // Connect and run the full-sync under its own deadline.
    let sync = async {
        let stream = TcpStream::connect(spec.cmd_addr)
            .await
            .map_err(|error| Error::Io(IoError::ConnectError(error)))?;
        let (mut reader, mut writer) = stream.into_split();

        send_message(
            &mut writer,
            &Message::FullSyncRequest {
                area: area.clone(),
                sender_id: node_name.to_owned(),
                digest,
            },
        )
        .await?;

        match recv_message(&mut reader).await? {
            Message::FullSyncResponse { key_vals, digest } => {
                Ok((reader, writer, key_vals, digest))
            }
            _ => Err(Error::UnexpectedMessage),
        }
    };
    let (reader, writer, key_vals, digest) =
        tokio::time::timeout(FULL_SYNC_TIMEOUT, sync)
            .await
            .map_err(|_| Error::FullSyncTimeout(peer_name.to_owned()))??;
    debug!(keys = key_vals.len(), "full-sync response received");

    // Register the outbound sink before delivering the sync result so
    // the store can push back the peer's stale keys right away.
    let (sink_tx, sink_rx) = mpsc::channel(64);
    let _ = net_tx
        .send(NetEvent::ConnUp {
            area: area.clone(),
            node: peer_name.to_owned(),
            sink: sink_tx.clone(),
        })
        .await;
    let _ = net_tx
        .send(NetEvent::SyncResponse {
            area: area.clone(),
            peer: peer_name.to_owned(),
            key_vals,
            digest,
        })
        .await;

    relay_connection(
        area.clone(),
        peer_name.to_owned(),
        reader,
        writer,
        net_tx.clone(),
        sink_tx,
        sink_rx,
    )
    .await
}
