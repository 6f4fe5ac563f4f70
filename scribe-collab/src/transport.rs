//! Message streams over the two supported transports.
//!
//! ```text
//! Framed:    TcpStream ── 10-digit length + JSON ──► MessageReader / MessageWriter
//! WebSocket: WebSocketStream ── one JSON text frame per message ──► same
//! ```
//!
//! The writer elides a repeated `doc`, so callers always hand it complete
//! messages.

use std::pin::Pin;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

use crate::error::ProtocolError;
use crate::protocol::{DocElision, Message, decode_message, read_frame, write_frame};

type WsSource = Pin<Box<dyn Stream<Item = Result<WsMessage, tungstenite::Error>> + Send>>;
type WsSink = Pin<Box<dyn Sink<WsMessage, Error = tungstenite::Error> + Send>>;

enum Source {
    Framed(Pin<Box<dyn AsyncRead + Send>>),
    WebSocket(WsSource),
}

enum Destination {
    Framed(Pin<Box<dyn AsyncWrite + Send>>),
    WebSocket(WsSink),
}

/// Inbound half of a connection.
pub struct MessageReader {
    source: Source,
}

impl MessageReader {
    /// Next message, or `None` once the peer has closed the connection.
    pub async fn next(&mut self) -> Result<Option<Message>, ProtocolError> {
        match &mut self.source {
            Source::Framed(reader) => read_frame(reader).await,
            Source::WebSocket(stream) => loop {
                match stream.next().await {
                    None | Some(Ok(WsMessage::Close(_))) => return Ok(None),
                    Some(Ok(WsMessage::Text(text))) => return decode_message(text.as_bytes()).map(Some),
                    Some(Ok(WsMessage::Binary(data))) => return decode_message(&data).map(Some),
                    Some(Ok(_)) => continue,
                    Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                        return Ok(None);
                    }
                    Some(Err(e)) => return Err(e.into()),
                }
            },
        }
    }
}

/// Outbound half of a connection.
pub struct MessageWriter {
    destination: Destination,
    elision: DocElision,
}

impl MessageWriter {
    fn new(destination: Destination) -> Self {
        Self {
            destination,
            elision: DocElision::default(),
        }
    }

    pub async fn send(&mut self, mut msg: Message) -> Result<(), ProtocolError> {
        self.elision.apply(&mut msg);
        match &mut self.destination {
            Destination::Framed(writer) => write_frame(writer, &msg).await,
            Destination::WebSocket(sink) => {
                let text = serde_json::to_string(&msg)?;
                sink.send(WsMessage::text(text)).await?;
                Ok(())
            }
        }
    }

    /// Flush and shut down the outbound half.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        match &mut self.destination {
            Destination::Framed(writer) => writer.shutdown().await?,
            Destination::WebSocket(sink) => sink.close().await?,
        }
        Ok(())
    }
}

/// Length-prefixed JSON over a byte stream.
pub fn framed<S>(stream: S) -> (MessageReader, MessageWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    (
        MessageReader {
            source: Source::Framed(Box::pin(read)),
        },
        MessageWriter::new(Destination::Framed(Box::pin(write))),
    )
}

/// One JSON message per WebSocket frame.
pub fn websocket<S>(ws: WebSocketStream<S>) -> (MessageReader, MessageWriter)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    (
        MessageReader {
            source: Source::WebSocket(Box::pin(stream)),
        },
        MessageWriter::new(Destination::WebSocket(Box::pin(sink))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn msg(value: Value) -> Message {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_framed_pair() {
        let (a, b) = tokio::io::duplex(1024);
        let (_, mut writer) = framed(a);
        let (mut reader, _) = framed(b);

        writer.send(msg(json!({"doc": "a", "v": 1}))).await.unwrap();
        writer.send(msg(json!({"doc": "a", "v": 2}))).await.unwrap();
        writer.send(msg(json!({"doc": "b", "v": 3}))).await.unwrap();

        assert_eq!(reader.next().await.unwrap(), Some(msg(json!({"doc": "a", "v": 1}))));
        assert_eq!(reader.next().await.unwrap(), Some(msg(json!({"v": 2}))));
        assert_eq!(reader.next().await.unwrap(), Some(msg(json!({"doc": "b", "v": 3}))));
    }

    #[tokio::test]
    async fn test_framed_end_of_stream() {
        let (a, b) = tokio::io::duplex(64);
        let (_, mut writer) = framed(a);
        let (mut reader, _) = framed(b);

        writer.close().await.unwrap();
        assert_eq!(reader.next().await.unwrap(), None);
    }
}
