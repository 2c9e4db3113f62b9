//! WebSocket endpoint
//!
//! Accepts TCP connections, performs the WebSocket upgrade (reading an
//! optional `?resume=<id>` from the request URI) and runs two halves per
//! connection: a writer task draining the broker's outbound channel into
//! the socket, and a reader loop feeding decoded frames into the
//! connection's [`ClientConnection`](crate::broker::ClientConnection).

pub mod codec;

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use crate::broker::{Broker, DisconnectIntent};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::session::Outbound;

use codec::Inbound;

/// Time allowed for the WebSocket upgrade
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for queued frames to flush after the client goes away
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a running WebSocket endpoint
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the endpoint is listening on
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections
    ///
    /// Established connections keep running until the broker closes them.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.accept_task).await
            && !e.is_cancelled()
        {
            log::warn!("Accept loop failed: {e}");
        }
        log::info!("Stopped listening on {}", self.local_addr);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Bind `config.listen` and serve the broker
///
/// # Errors
/// Returns error if the address cannot be bound
pub async fn start_server(config: &BrokerConfig, broker: Arc<Broker>) -> Result<ServerHandle> {
    let listener = TcpListener::bind(config.listen).await?;
    start_server_with_listener(listener, broker)
}

/// Serve the broker on an already bound listener
///
/// # Errors
/// Returns error if the listener has no local address
pub fn start_server_with_listener(
    listener: TcpListener,
    broker: Arc<Broker>,
) -> Result<ServerHandle> {
    let local_addr = listener.local_addr()?;
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let accept_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            log::debug!("Failed to set TCP_NODELAY for {peer}: {e}");
                        }
                        tokio::spawn(serve_connection(stream, peer, Arc::clone(&broker)));
                    }
                    Err(e) => log::warn!("Failed to accept connection: {e}"),
                }
            }
        }
    });

    log::info!("Listening on ws://{local_addr}");

    Ok(ServerHandle {
        local_addr,
        shutdown_tx: Some(shutdown_tx),
        accept_task,
    })
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, broker: Arc<Broker>) {
    if let Err(e) = handle_socket(stream, peer, broker).await {
        log::debug!("Connection from {peer} ended: {e}");
    }
}

async fn handle_socket(stream: TcpStream, peer: SocketAddr, broker: Arc<Broker>) -> Result<()> {
    let mut resume = None;
    let upgrade = accept_hdr_async(stream, |request: &Request, response: Response| {
        resume = codec::resume_from_query(request.uri().query());
        Ok::<_, ErrorResponse>(response)
    });
    let ws = tokio::time::timeout(HANDSHAKE_TIMEOUT, upgrade)
        .await
        .map_err(|_| BrokerError::protocol("WebSocket handshake timed out"))??;

    let (mut sink, mut frames) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let mut connection = broker.connect(outbound_tx, resume);
    let connection_id = connection.id();
    log::debug!("{connection_id} accepted from {peer}");

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            let closing = matches!(outbound, Outbound::Close(_));
            match codec::encode(&outbound) {
                Ok(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        log::debug!("{connection_id} write failed: {e}");
                        break;
                    }
                }
                Err(e) => log::warn!("{connection_id} failed to encode frame: {e}"),
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut intent = DisconnectIntent::Detach;
    let mut writer_done = false;
    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(message)) => match codec::decode(message) {
                    Ok(Inbound::Message(message)) => connection.handle_message(message).await,
                    Ok(Inbound::Close(code)) => {
                        log::debug!("{connection_id} closed by client (code {code:?})");
                        intent = DisconnectIntent::from_close_code(code);
                        break;
                    }
                    Ok(Inbound::Ignore) => {}
                    Err(e) => log::warn!("{connection_id} sent a malformed frame: {e}"),
                },
                Some(Err(e)) => {
                    log::debug!("{connection_id} read failed: {e}");
                    break;
                }
                None => break,
            },
            _ = &mut writer, if !writer_done => {
                // Broker closed the connection
                writer_done = true;
                break;
            }
        }
    }

    connection.close(intent);

    if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    log::debug!("{connection_id} finished");
    Ok(())
}
