//! WebSocket handshake and frame I/O.
//!
//! Control frames are handled by `tokio-tungstenite`: pings are answered
//! on the next poll of the stream and a peer's close frame is echoed, so
//! [`read_frame`] only surfaces data messages and the end of the stream.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::ws::{WebSocketMessage, WsError};

/// Completes the server side of the upgrade handshake.
pub async fn accept_upgrade<S>(stream: S) -> Result<WebSocketStream<S>, WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio_tungstenite::accept_async(stream)
        .await
        .map_err(WsError::Handshake)
}

/// Performs the client handshake for `ws://{host}{path}`.
///
/// `host` is sent as the `Host` header and may carry a port.
pub async fn handshake<S>(stream: S, host: &str, path: &str) -> Result<WebSocketStream<S>, WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path = if path.starts_with('/') { path.to_owned() } else { format!("/{path}") };
    let uri = format!("ws://{host}{path}");
    let (stream, _response) = tokio_tungstenite::client_async(uri, stream)
        .await
        .map_err(WsError::Handshake)?;
    Ok(stream)
}

/// Reads the next data message.
///
/// `Ok(None)` is an orderly end: the close handshake finished or the peer
/// went away after it.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<WebSocketMessage>, WsError>
where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(item) = reader.next().await {
        match item {
            Ok(message @ Message::Text(_)) => {
                return Ok(Some(WebSocketMessage {
                    data: message.into_data(),
                    is_binary: false,
                }));
            }
            Ok(message @ Message::Binary(_)) => {
                return Ok(Some(WebSocketMessage {
                    data: message.into_data(),
                    is_binary: true,
                }));
            }
            // Keep polling so the close reply is flushed.
            Ok(Message::Close(_)) => continue,
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                return Ok(None);
            }
            Err(e) => return Err(WsError::Transport(e)),
        }
    }
    Ok(None)
}

/// Writes one message as a single text or binary frame.
pub async fn write_frame<W>(writer: &mut W, message: &WebSocketMessage) -> Result<(), WsError>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let frame = if message.is_binary {
        Message::Binary(message.data.clone())
    } else {
        let text = std::str::from_utf8(&message.data).map_err(|_| WsError::InvalidText)?;
        Message::text(text.to_owned())
    };
    writer.send(frame).await.map_err(WsError::Transport)
}
