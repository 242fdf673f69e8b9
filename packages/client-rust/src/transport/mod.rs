//! Byte-pipe transports between a client and its host.
//!
//! A transport delivers whole frames reliably and in order. It splits into a
//! sending half, driven by the client's writer task, and a receiving half,
//! driven by the pump.

mod channel;
mod websocket;

use async_trait::async_trait;
use hostlink_core::WireFormat;

use crate::error::ClientError;

pub use channel::ChannelTransport;
pub use websocket::WebSocketTransport;

/// Sending half of a transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// # Errors
    ///
    /// Returns `ClientError::Disconnected` or `ClientError::Transport` when
    /// the frame cannot be handed to the host.
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), ClientError>;

    /// Closes the sending direction. Default: nothing to flush.
    async fn close(&mut self) {}
}

/// Receiving half of a transport.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next frame from the host, or `None` once the transport has closed.
    async fn recv(&mut self) -> Option<Result<Vec<u8>, ClientError>>;
}

/// A connection to a host.
pub trait ClientTransport: Send + 'static {
    type Sink: FrameSink;
    type Source: FrameSource;

    /// Encoding of every frame on this transport.
    fn format(&self) -> WireFormat;

    fn split(self) -> (Self::Sink, Self::Source);
}
