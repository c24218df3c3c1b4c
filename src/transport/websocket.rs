use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::config::ServerSettings;
use crate::session::Session;
use crate::transport::hub::HubHandle;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::transport::PushTransport;

pub async fn bind(settings: &ServerSettings) -> std::io::Result<TcpListener> {
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "push server listening");
    Ok(listener)
}

/// Accept websocket connections until `shutdown` is cancelled. Open
/// connections are closed on shutdown as well.
pub async fn serve(listener: TcpListener, hub: HubHandle, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "connection accepted");
                tokio::spawn(handle_connection(stream, hub.clone(), shutdown.clone()));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
    info!("push server stopped");
}

async fn handle_connection(stream: TcpStream, hub: HubHandle, shutdown: CancellationToken) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "websocket handshake failed");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let session = Session::new(tx);
    let session_id = session.id.clone();
    hub.register_session(session.clone());

    let forward_id = session_id.clone();
    let forward = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let closing = matches!(frame, WsMessage::Close(_));
            if let Err(e) = ws_sender.send(frame).await {
                debug!(session_id = %forward_id, error = %e, "send failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = session.sender.send(WsMessage::Close(None));
                break;
            }
            frame = ws_receiver.next() => frame,
        };
        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                let reply = handle_text(&hub, &session_id, text.as_str());
                reply_with(&session, &reply);
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(session_id = %session_id, error = %e, "read failed");
                break;
            }
        }
    }

    hub.remove_session(&session_id);
    drop(session);
    let _ = forward.await;
    debug!(session_id = %session_id, "session closed");
}

fn handle_text(hub: &HubHandle, session_id: &str, text: &str) -> ServerMessage {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Announce { user_id }) => {
            match hub.announce_identity(session_id, &user_id.to_string()) {
                Ok(()) => {
                    info!(session_id, user_id = %user_id, "identity announced");
                    ServerMessage::Announced { user_id }
                }
                Err(e) => ServerMessage::Error {
                    message: e.to_string(),
                },
            }
        }
        Err(e) => {
            debug!(session_id, error = %e, "invalid client message");
            ServerMessage::Error {
                message: format!("invalid message: {e}"),
            }
        }
    }
}

fn reply_with(session: &Session, reply: &ServerMessage) {
    match serde_json::to_string(reply) {
        Ok(text) => {
            session.send_text(&text);
        }
        Err(e) => warn!(error = %e, "could not serialize reply"),
    }
}
