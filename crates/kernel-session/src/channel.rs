//! WebSocket kernel channels.
//!
//! Each channel is bridged onto a pair of unbounded queues: frames pushed
//! into `outbound` are written to the socket in order, frames read from the
//! socket show up on `inbound` in arrival order. The session never touches
//! the socket directly, so tests can substitute in-memory channels.

use std::fmt;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Requests go out here, direct replies come back.
    Shell,
    /// Broadcast side effects: status, streams, rich output.
    Iopub,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Shell => "shell",
            ChannelKind::Iopub => "iopub",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One open channel, as a pair of text-frame queues.
///
/// Dropping every `outbound` sender closes the socket; `inbound` yields
/// `None` once the socket is gone.
#[derive(Debug)]
pub struct ChannelConnection {
    pub kind: ChannelKind,
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

impl ChannelConnection {
    /// Two connected in-memory ends: what one side sends the other receives.
    pub fn pair(kind: ChannelKind) -> (ChannelConnection, ChannelConnection) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            ChannelConnection {
                kind,
                outbound: a_tx,
                inbound: a_rx,
            },
            ChannelConnection {
                kind,
                outbound: b_tx,
                inbound: b_rx,
            },
        )
    }
}

/// The first frame sent on a fresh channel: `session:cookie`.
pub fn handshake_payload(session_id: &str, cookie: Option<&str>) -> String {
    format!("{}:{}", session_id, cookie.unwrap_or(""))
}

/// Open a channel WebSocket and spawn its reader and writer tasks.
///
/// Must be called from within a tokio runtime.
pub async fn connect(
    url: &Url,
    kind: ChannelKind,
    session_id: &str,
    cookie: Option<String>,
) -> Result<ChannelConnection, SessionError> {
    let mut request = url.as_str().into_client_request()?;
    if let Some(cookie) = cookie.as_deref().filter(|c| !c.is_empty()) {
        let value = HeaderValue::from_str(cookie)
            .map_err(|e| SessionError::KernelUnreachable(format!("bad cookie header: {}", e)))?;
        request.headers_mut().insert(COOKIE, value);
    }

    let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
    info!("[channel] {} connected to {}", kind, url);

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

    sink.send(WsMessage::Text(handshake_payload(
        session_id,
        cookie.as_deref(),
    )))
    .await?;

    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = sink.send(WsMessage::Text(frame)).await {
                warn!("[channel] {} write failed: {}", kind, e);
                return;
            }
        }
        debug!("[channel] {} outbound closed, closing socket", kind);
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(WsMessage::Text(text)) => {
                    if inbound_tx.send(text).is_err() {
                        // Session dropped its receiver
                        break;
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    debug!("[channel] {} closed by server: {:?}", kind, frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("[channel] {} read failed: {}", kind, e);
                    break;
                }
            }
        }
        debug!("[channel] {} reader finished", kind);
    });

    Ok(ChannelConnection {
        kind,
        outbound: outbound_tx,
        inbound: inbound_rx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_payload() {
        assert_eq!(handshake_payload("abc", None), "abc:");
        assert_eq!(
            handshake_payload("abc", Some("username-localhost=xyz")),
            "abc:username-localhost=xyz"
        );
    }

    #[tokio::test]
    async fn test_pair_is_cross_wired() {
        let (mut client, mut server) = ChannelConnection::pair(ChannelKind::Shell);
        client.outbound.send("ping".to_string()).unwrap();
        assert_eq!(server.inbound.recv().await.as_deref(), Some("ping"));
        server.outbound.send("pong".to_string()).unwrap();
        assert_eq!(client.inbound.recv().await.as_deref(), Some("pong"));

        drop(server);
        assert_eq!(client.inbound.recv().await, None);
    }
}
