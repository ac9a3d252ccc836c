//! Socket-side tasks that connect listeners to the broker's channels.
//!
//! Each bound endpoint gets one router task. Routers own the connections;
//! the broker only sees [`Inbound`] frames and produces [`Outbound`] frames.
//!
//! - [`serve_inbound`] - registration and ack endpoints: every frame from
//!   every connection is forwarded as is.
//! - [`serve_frontend`] - client connections: each gets a [`ClientId`] and
//!   receives the replies addressed to it.
//! - [`serve_dispatch`] - worker connections: each announces its identity
//!   with a `Ready` hello and then receives the frames addressed to it.

use crate::broker::{Inbound, Outbound};
use bytes::Bytes;
use core::time::Duration;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use taskbroker_core::{
    ClientId, Error, Result, WorkerId,
    envelope::{Envelope, MessageKind},
    transport::{self, Connection, Listener},
};
use tokio::{
    sync::mpsc,
    task::JoinSet,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

async fn accept(
    listener: &mut Listener,
    max_frame_bytes: usize,
    _channel: &str,
) -> Option<Connection> {
    match listener.accept().await {
        Ok(io) => Some(transport::framed(io, max_frame_bytes)),
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Accept failed on {_channel} endpoint: {_e}");
            sleep(ACCEPT_BACKOFF).await;
            None
        }
    }
}

/// Waits for connection tasks to finish, aborting whatever is left after
/// `grace`.
async fn drain(mut connections: JoinSet<()>, grace: Duration, _channel: &str) {
    let all_done = async { while connections.join_next().await.is_some() {} };
    if timeout(grace, all_done).await.is_err() {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            "{} {_channel} connection(s) did not finish in time",
            connections.len()
        );
        connections.abort_all();
    }
}

/// Forwards every frame received on `listener` to `tx` until `cancel` fires.
pub async fn serve_inbound(
    mut listener: Listener,
    max_frame_bytes: usize,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    channel: &'static str,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            conn = accept(&mut listener, max_frame_bytes, channel) => {
                let Some(conn) = conn else { continue };
                connections.spawn(forward_frames(conn, tx.clone(), channel));
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    #[cfg(feature = "tracing")]
    tracing::debug!("{channel} router stopped");
}

async fn forward_frames(mut conn: Connection, tx: mpsc::Sender<Bytes>, _channel: &'static str) {
    while let Some(frame) = conn.next().await {
        match frame {
            Ok(frame) => {
                if tx.send(frame.freeze()).await.is_err() {
                    break;
                }
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Closing {_channel} connection: {_e}");
                break;
            }
        }
    }
}

/// Serves client connections.
///
/// Requests are forwarded to `inbound` tagged with the connection's
/// [`ClientId`]; replies from `replies` are written back to the matching
/// connection. New connections are refused once `cancel` fires; the router
/// exits when the broker drops its end of `replies`.
pub async fn serve_frontend(
    mut listener: Listener,
    max_frame_bytes: usize,
    inbound: mpsc::Sender<Inbound>,
    mut replies: mpsc::UnboundedReceiver<Outbound<ClientId>>,
    cancel: CancellationToken,
    grace: Duration,
) {
    let mut next_id = 0u64;
    let mut clients: HashMap<ClientId, mpsc::UnboundedSender<Bytes>> = HashMap::new();
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<ClientId>();
    let mut connections = JoinSet::new();
    let mut accepting = true;

    loop {
        tokio::select! {
            () = cancel.cancelled(), if accepting => accepting = false,
            conn = accept(&mut listener, max_frame_bytes, "frontend"), if accepting => {
                let Some(conn) = conn else { continue };
                next_id += 1;
                let client = ClientId(next_id);
                let (tx, rx) = mpsc::unbounded_channel();
                clients.insert(client, tx);

                #[cfg(feature = "tracing")]
                tracing::debug!("Accepted {client}");

                connections.spawn(client_connection(
                    client,
                    conn,
                    inbound.clone(),
                    rx,
                    closed_tx.clone(),
                ));
            }
            reply = replies.recv() => {
                let Some(Outbound { to, frame }) = reply else { break };
                match clients.get(&to) {
                    Some(tx) if tx.send(frame).is_ok() => {}
                    _ => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("Dropping reply for disconnected {to}");
                    }
                }
            }
            Some(client) = closed_rx.recv() => {
                clients.remove(&client);
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    // Writers flush what they hold and exit once their sender is gone.
    clients.clear();
    drain(connections, grace, "frontend").await;

    #[cfg(feature = "tracing")]
    tracing::debug!("frontend router stopped");
}

async fn client_connection(
    client: ClientId,
    conn: Connection,
    inbound: mpsc::Sender<Inbound>,
    mut replies: mpsc::UnboundedReceiver<Bytes>,
    closed: mpsc::UnboundedSender<ClientId>,
) {
    let (mut sink, mut stream) = conn.split();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(frame)) => {
                    let request = Inbound { from: client, frame: frame.freeze() };
                    if inbound.send(request).await.is_err() {
                        break;
                    }
                }
                Some(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Closing {client}: {_e}");
                    break;
                }
                None => break,
            },
            reply = replies.recv() => match reply {
                Some(frame) => {
                    if let Err(_e) = sink.send(frame).await {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Failed to reply to {client}: {_e}");
                        break;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
        }
    }

    #[cfg(feature = "tracing")]
    tracing::debug!("{client} disconnected");
    let _ = closed.send(client);
}

/// A worker connection that completed its hello.
struct Joined {
    identity: WorkerId,
    serial: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

/// Serves worker connections on the dispatch endpoint.
///
/// Frames for an identity that has not connected yet are kept in a mailbox
/// and delivered when it does. The router exits once the broker drops its
/// end of `dispatch`, which happens right after the shutdown `End` broadcast.
pub async fn serve_dispatch(
    mut listener: Listener,
    max_frame_bytes: usize,
    mut dispatch: mpsc::UnboundedReceiver<Outbound<WorkerId>>,
    grace: Duration,
) {
    let mut writers: HashMap<WorkerId, (u64, mpsc::UnboundedSender<Bytes>)> = HashMap::new();
    let mut mailbox: HashMap<WorkerId, Vec<Bytes>> = HashMap::new();
    let (joined_tx, mut joined_rx) = mpsc::unbounded_channel::<Joined>();
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<(WorkerId, u64)>();
    let mut connections = JoinSet::new();
    let mut next_serial = 0u64;

    loop {
        tokio::select! {
            conn = accept(&mut listener, max_frame_bytes, "dispatch") => {
                let Some(conn) = conn else { continue };
                next_serial += 1;
                connections.spawn(worker_connection(
                    next_serial,
                    conn,
                    joined_tx.clone(),
                    closed_tx.clone(),
                ));
            }
            out = dispatch.recv() => {
                let Some(Outbound { to, frame }) = out else { break };
                let undelivered = match writers.get(&to) {
                    Some((_, tx)) => tx.send(frame).err().map(|e| e.0),
                    None => Some(frame),
                };
                if let Some(frame) = undelivered {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Holding frame for {to} until it connects");
                    writers.remove(&to);
                    mailbox.entry(to).or_default().push(frame);
                }
            }
            Some(Joined { identity, serial, tx }) = joined_rx.recv() => {
                #[cfg(feature = "tracing")]
                tracing::info!("Worker {identity} connected for dispatch");

                for frame in mailbox.remove(&identity).unwrap_or_default() {
                    let _ = tx.send(frame);
                }
                writers.insert(identity, (serial, tx));
            }
            Some((identity, serial)) = closed_rx.recv() => {
                if writers.get(&identity).is_some_and(|(s, _)| *s == serial) {
                    writers.remove(&identity);
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    if !mailbox.is_empty() {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            "{} worker(s) never connected for dispatch; their frames are dropped",
            mailbox.len()
        );
    }
    writers.clear();
    drain(connections, grace, "dispatch").await;

    #[cfg(feature = "tracing")]
    tracing::debug!("dispatch router stopped");
}

/// Reads the `Ready` hello that names the worker behind a dispatch
/// connection.
async fn read_hello(conn: &mut Connection) -> Result<WorkerId> {
    let frame = match conn.next().await {
        Some(frame) => frame?,
        None => {
            return Err(Error::Transport {
                context: "connection closed before hello".to_string(),
            });
        }
    };
    let msg = Envelope::from_bytes(frame.freeze())?;
    msg.expect_kind(&[MessageKind::Ready])?;
    if msg.identity.is_empty() {
        return Err(Error::MissingField {
            kind: MessageKind::Ready,
            field: "identity",
        });
    }
    Ok(WorkerId::new(&msg.identity))
}

async fn worker_connection(
    serial: u64,
    mut conn: Connection,
    joined: mpsc::UnboundedSender<Joined>,
    closed: mpsc::UnboundedSender<(WorkerId, u64)>,
) {
    let identity = match read_hello(&mut conn).await {
        Ok(identity) => identity,
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Rejected dispatch connection: {_e}");
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let hello = Joined {
        identity: identity.clone(),
        serial,
        tx,
    };
    if joined.send(hello).is_err() {
        return;
    }

    let (mut sink, mut stream) = conn.split();
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(_e) = sink.send(frame).await {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Dispatch to {identity} failed: {_e}");
                        break;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(_)) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Ignoring frame from {identity} on dispatch connection");
                }
                Some(Err(_)) | None => break,
            },
        }
    }

    #[cfg(feature = "tracing")]
    tracing::debug!("Worker {identity} left dispatch");
    let _ = closed.send((identity, serial));
}
