//! Client ends of asynchronous results.
//!
//! A [`DeferredHandle`] completes once. A [`StreamSubscription`] yields
//! values until it is unsubscribed or the connection ends; dropping it
//! releases the host-side subscription.

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use hostlink_core::{EmitterKind, ErrorCode, ErrorPayload, Event, ResourceId, SubscriptionHandle};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::client::{HostClient, Reply};
use crate::error::ClientError;

fn take_route(
    reply: Reply,
    expected: EmitterKind,
) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<Event>), ClientError> {
    match reply.events {
        Some((handle, events)) if handle.emitter == expected => Ok((handle, events)),
        _ => Err(ClientError::NotSubscription(expected)),
    }
}

fn decode<T: DeserializeOwned>(event: Event) -> Result<T, ClientError> {
    Ok(serde_json::from_value(event.data)?)
}

/// Pending one-shot result.
pub struct DeferredHandle<T> {
    client: HostClient,
    handle: SubscriptionHandle,
    events: mpsc::UnboundedReceiver<Event>,
    settled: bool,
    _result: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> DeferredHandle<T> {
    pub(crate) fn from_reply(client: HostClient, reply: Reply) -> Result<Self, ClientError> {
        let (handle, events) = take_route(reply, EmitterKind::Deferred)?;
        Ok(Self {
            client,
            handle,
            events,
            settled: false,
            _result: PhantomData,
        })
    }

    #[must_use]
    pub fn handle(&self) -> &ResourceId {
        &self.handle.resource_id
    }

    /// Waits for the result.
    ///
    /// # Errors
    ///
    /// `ClientError::Rejected` with the host's failure, or
    /// `ClientError::Disconnected` if the connection ended first.
    pub async fn wait(mut self) -> Result<T, ClientError> {
        let event = self.events.recv().await.ok_or(ClientError::Disconnected)?;
        self.settled = true;
        if event.rejected() {
            let payload = serde_json::from_value::<ErrorPayload>(event.data.clone())
                .unwrap_or_else(|_| {
                    ErrorPayload::new(ErrorCode::InternalServerError, event.data.to_string())
                });
            return Err(ClientError::Rejected(payload));
        }
        decode(event)
    }
}

impl<T> Drop for DeferredHandle<T> {
    fn drop(&mut self) {
        if !self.settled {
            self.client.release(&self.handle.resource_id);
        }
    }
}

impl<T> std::fmt::Debug for DeferredHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredHandle")
            .field("handle", &self.handle.resource_id)
            .field("settled", &self.settled)
            .finish()
    }
}

/// Ordered values pushed by the host.
pub struct StreamSubscription<T> {
    client: HostClient,
    handle: SubscriptionHandle,
    events: mpsc::UnboundedReceiver<Event>,
    active: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> StreamSubscription<T> {
    pub(crate) fn from_reply(client: HostClient, reply: Reply) -> Result<Self, ClientError> {
        let (handle, events) = take_route(reply, EmitterKind::Stream)?;
        Ok(Self {
            client,
            handle,
            events,
            active: true,
            _item: PhantomData,
        })
    }

    #[must_use]
    pub fn handle(&self) -> &ResourceId {
        &self.handle.resource_id
    }

    /// Next value, or `None` once the connection has ended. A stream the
    /// host closes itself simply stops yielding.
    pub async fn next(&mut self) -> Option<Result<T, ClientError>> {
        let event = self.events.recv().await?;
        Some(decode(event))
    }

    /// Ends delivery on the host. Returns whether the host still knew the
    /// subscription.
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub async fn unsubscribe(mut self) -> Result<bool, ClientError> {
        self.active = false;
        self.client.unsubscribe(&self.handle.resource_id).await
    }
}

impl<T: DeserializeOwned> Stream for StreamSubscription<T> {
    type Item = Result<T, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut()
            .events
            .poll_recv(cx)
            .map(|event| event.map(decode))
    }
}

impl<T> Drop for StreamSubscription<T> {
    fn drop(&mut self) {
        if self.active {
            self.client.release(&self.handle.resource_id);
        }
    }
}

impl<T> std::fmt::Debug for StreamSubscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSubscription")
            .field("handle", &self.handle.resource_id)
            .field("active", &self.active)
            .finish()
    }
}
