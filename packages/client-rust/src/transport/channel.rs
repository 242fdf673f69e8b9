use async_trait::async_trait;
use hostlink_core::WireFormat;
use tokio::sync::mpsc;

use super::{ClientTransport, FrameSink, FrameSource};
use crate::error::ClientError;

/// In-process transport over a pair of channels, as handed out by a host's
/// local attachment.
pub struct ChannelTransport {
    format: WireFormat,
    to_host: mpsc::UnboundedSender<Vec<u8>>,
    from_host: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelTransport {
    #[must_use]
    pub fn new(
        format: WireFormat,
        to_host: mpsc::UnboundedSender<Vec<u8>>,
        from_host: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            format,
            to_host,
            from_host,
        }
    }
}

pub struct ChannelSink(mpsc::UnboundedSender<Vec<u8>>);

pub struct ChannelSource(mpsc::UnboundedReceiver<Vec<u8>>);

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), ClientError> {
        self.0.send(frame).map_err(|_| ClientError::Disconnected)
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, ClientError>> {
        self.0.recv().await.map(Ok)
    }
}

impl ClientTransport for ChannelTransport {
    type Sink = ChannelSink;
    type Source = ChannelSource;

    fn format(&self) -> WireFormat {
        self.format
    }

    fn split(self) -> (ChannelSink, ChannelSource) {
        (ChannelSink(self.to_host), ChannelSource(self.from_host))
    }
}
