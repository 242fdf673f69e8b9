//! In-process attachment: a byte pipe between a client and the host.
//!
//! Frames cross the pipe encoded exactly as they would over a socket, so an
//! embedded client exercises the same codec and dispatch path as a remote one.

use hostlink_core::WireFormat;
use tokio::sync::mpsc;
use tracing::debug;

use super::session::{encode_frame, OutboundMessage, SessionId, SessionKind};
use crate::host::Host;

/// Client end of an in-process session.
///
/// Dropping the sender half detaches the session.
#[derive(Debug)]
pub struct LocalConnection {
    session: SessionId,
    format: WireFormat,
    to_host: mpsc::UnboundedSender<Vec<u8>>,
    from_host: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl LocalConnection {
    /// Attaches a session and spawns its reader and writer tasks.
    pub(crate) fn spawn(host: Host, kind: SessionKind, format: WireFormat) -> Self {
        let (session, mut outbound) = host.attach(kind, format);
        let (to_host, mut inbound) = mpsc::unbounded_channel::<Vec<u8>>();
        let (to_client, from_host) = mpsc::unbounded_channel::<Vec<u8>>();
        let id = session.id;
        let mut closed = session.close_signal();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    message = outbound.recv() => message,
                    reason = closed.recv() => Some(OutboundMessage::Close(Some(reason))),
                };
                match message {
                    Some(OutboundMessage::Frame(response)) => {
                        let Some(bytes) = encode_frame(&response, format) else {
                            continue;
                        };
                        if to_client.send(bytes).is_err() {
                            break;
                        }
                    }
                    Some(OutboundMessage::Close(reason)) => {
                        debug!(session = %id, ?reason, "local session closed by host");
                        break;
                    }
                    None => break,
                }
            }
        });

        tokio::spawn(async move {
            while let Some(bytes) = inbound.recv().await {
                if !session.is_connected() {
                    break;
                }
                host.serve_frame(&session, &bytes, format).await;
            }
            host.detach(id).await;
        });

        Self {
            session: id,
            format,
            to_host,
            from_host,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    #[must_use]
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Splits into the outbound sender (client to host) and the inbound
    /// receiver (host to client).
    #[must_use]
    pub fn into_parts(self) -> (mpsc::UnboundedSender<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>) {
        (self.to_host, self.from_host)
    }
}
