//! WebSocket listener.
//!
//! Accepts connections, registers each with the hub and splits the socket:
//! a writer task drains the client's bounded channel while the reader loop
//! handles join/leave commands. Disconnection (or any protocol error)
//! deregisters the client and clears its rooms.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::hub::Hub;
use crate::protocol::ClientCommand;
use crate::RealtimeError;

/// Accept websocket clients until the listener fails.
pub async fn serve(hub: Hub, listener: TcpListener) -> Result<(), RealtimeError> {
    let local = listener.local_addr()?;
    info!(addr = %local, "websocket listener started");
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(handle_connection(hub.clone(), stream, peer));
    }
}

async fn handle_connection(hub: Hub, stream: TcpStream, peer: SocketAddr) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, "websocket handshake failed: {e}");
            return;
        }
    };

    let (id, mut rx) = hub.register();
    info!(client = id, %peer, "websocket client connected");

    let (mut sink, mut source) = ws.split();

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(ClientCommand::Join { room }) => hub.join(id, &room),
                Ok(ClientCommand::Leave { room }) => hub.leave(id, &room),
                Err(e) => debug!(client = id, "ignoring malformed client command: {e}"),
            },
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {}
            Err(e) => {
                debug!(client = id, "websocket read error: {e}");
                break;
            }
        }
    }

    hub.deregister(id);
    writer.abort();
    info!(client = id, %peer, "websocket client disconnected");
}
