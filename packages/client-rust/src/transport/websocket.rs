use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hostlink_core::WireFormat;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::{ClientTransport, FrameSink, FrameSource};
use crate::error::ClientError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport to a host's `/ws` endpoint. JSON frames travel as
/// text messages, MsgPack frames as binary messages.
pub struct WebSocketTransport {
    format: WireFormat,
    socket: Socket,
}

impl WebSocketTransport {
    /// Connects to `base_url` (for example `ws://127.0.0.1:4000/ws`),
    /// attaching as a session of `kind` (`main`, `child` or `worker`).
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Transport` if the handshake fails.
    pub async fn connect(base_url: &str, kind: &str, format: WireFormat) -> Result<Self, ClientError> {
        let url = attach_url(base_url, kind, format);
        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        debug!(%url, "websocket attached");
        Ok(Self { format, socket })
    }
}

fn attach_url(base_url: &str, kind: &str, format: WireFormat) -> String {
    let separator = if base_url.contains('?') { '&' } else { '?' };
    format!("{base_url}{separator}format={}&kind={kind}", format.as_str())
}

pub struct WebSocketSink {
    format: WireFormat,
    sink: SplitSink<Socket, Message>,
}

pub struct WebSocketSource {
    stream: SplitStream<Socket>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), ClientError> {
        let message = match self.format {
            WireFormat::Json => match String::from_utf8(frame) {
                Ok(text) => Message::text(text),
                Err(e) => Message::binary(e.into_bytes()),
            },
            WireFormat::MsgPack => Message::binary(frame),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, ClientError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().as_bytes().to_vec())),
                Ok(Message::Binary(bytes)) => return Some(Ok(bytes.to_vec())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "host closed websocket");
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(ClientError::Transport(e.to_string()))),
            }
        }
    }
}

impl ClientTransport for WebSocketTransport {
    type Sink = WebSocketSink;
    type Source = WebSocketSource;

    fn format(&self) -> WireFormat {
        self.format
    }

    fn split(self) -> (WebSocketSink, WebSocketSource) {
        let (sink, stream) = self.socket.split();
        (
            WebSocketSink {
                format: self.format,
                sink,
            },
            WebSocketSource { stream },
        )
    }
}
