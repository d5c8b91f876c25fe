use std::{io, sync::Arc};

use bytes::Bytes;
use log::{debug, error, info};
use thiserror::Error;
use tokio::{sync::mpsc, time};
use tokio_util::sync::CancellationToken;

use super::listener::{Accepted, AsyncStream};
use crate::{
    config::RelayConfig,
    framestream::{Frame, FrameStream, FramestreamError},
    message::DnsMessage,
    metrics::{RELAY_CONNECTIONS, RELAY_FRAMES},
    router,
    worker::Route,
};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("tls handshake failed: {0}")]
    Tls(#[source] io::Error),
    #[error("framestream handshake failed: {0}")]
    Handshake(#[source] FramestreamError),
    #[error("transport error: {0}")]
    Transport(#[source] FramestreamError),
}

impl ConnectionError {
    pub fn is_closed_connection(&self) -> bool {
        match self {
            ConnectionError::Transport(err) => err.is_closed_connection(),
            _ => false,
        }
    }
}

pub struct Connection {
    pub id: u64,
    pub peer: String,
    pub worker: Arc<str>,
    pub config: Arc<RelayConfig>,
    pub routes: Arc<Vec<Route>>,
    pub force_close: CancellationToken,
}

pub async fn handle_conn(conn: Connection, accepted: Accepted) {
    info!(
        "[{}] conn #{} - new connection from {}",
        conn.worker, conn.id, conn.peer
    );
    RELAY_CONNECTIONS
        .with_label_values(&[conn.worker.as_ref()])
        .inc();
    let (frames_tx, frames_rx) = mpsc::channel(conn.config.buffer_size());
    let receive = async {
        tokio::select! {
            result = transport(accepted, &conn.config, frames_tx) => Some(result),
            _ = conn.force_close.cancelled() => None,
        }
    };
    let forward = async {
        tokio::select! {
            _ = forward_frames(&conn, frames_rx) => (),
            _ = conn.force_close.cancelled() => (),
        }
    };
    let (outcome, _) = tokio::join!(receive, forward);
    match outcome {
        None => info!("[{}] conn #{} - force closed", conn.worker, conn.id),
        Some(Ok(())) => info!("[{}] conn #{} - stream finished", conn.worker, conn.id),
        Some(Err(err)) if err.is_closed_connection() => {
            info!("[{}] conn #{} - peer closed: {}", conn.worker, conn.id, err)
        }
        Some(Err(err)) => error!("[{}] conn #{} - {}", conn.worker, conn.id, err),
    }
    RELAY_CONNECTIONS
        .with_label_values(&[conn.worker.as_ref()])
        .dec();
}

async fn transport(
    accepted: Accepted,
    config: &RelayConfig,
    output: mpsc::Sender<Frame>,
) -> Result<(), ConnectionError> {
    let stream: Box<dyn AsyncStream> = match accepted {
        Accepted::Plain(stream) => stream,
        Accepted::Tls(accept) => {
            let stream = time::timeout(config.handshake_timeout, accept)
                .await
                .map_err(|_| {
                    ConnectionError::Tls(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "tls handshake timed out",
                    ))
                })?
                .map_err(ConnectionError::Tls)?;
            Box::new(stream)
        }
    };
    let content_type = Bytes::from(config.content_type.clone().into_bytes());
    let mut frames = FrameStream::new(stream, content_type, config.handshake_timeout, true);
    frames
        .init_receiver()
        .await
        .map_err(ConnectionError::Handshake)?;
    frames
        .process_frames(output)
        .await
        .map_err(ConnectionError::Transport)
}

async fn forward_frames(conn: &Connection, mut frames: mpsc::Receiver<Frame>) {
    let counter = RELAY_FRAMES.with_label_values(&[conn.worker.as_ref()]);
    while let Some(frame) = frames.recv().await {
        counter.inc();
        let dm = DnsMessage::from_frame(frame.payload, frame.content_type);
        router::deliver(&conn.routes, dm).await;
    }
    debug!("[{}] conn #{} - frame channel closed", conn.worker, conn.id);
}
