//! Typed access to one host resource.

use hostlink_core::{ErrorCode, ErrorPayload, FallbackError, ResourceId, PROPERTY_READ_METHOD};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::trace;

use crate::client::{CallOptions, HostClient, Reply};
use crate::error::ClientError;
use crate::subscription::{DeferredHandle, StreamSubscription};

/// Stands in for a host resource: calls become requests, property reads
/// become `$get` calls.
///
/// Typed interfaces wrap a proxy and expose one method per host method:
///
/// ```ignore
/// struct SceneList(ResourceProxy);
///
/// impl SceneList {
///     async fn add_scene(&self, name: &str) -> Result<String, ClientError> {
///         self.0.call("addScene", vec![name.into()]).await
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ResourceProxy {
    client: HostClient,
    resource: ResourceId,
}

impl ResourceProxy {
    pub(crate) fn new(client: HostClient, resource: ResourceId) -> Self {
        Self { client, resource }
    }

    #[must_use]
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    #[must_use]
    pub fn client(&self) -> &HostClient {
        &self.client
    }

    async fn send(
        &self,
        method: &str,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<Reply, ClientError> {
        self.client
            .request(self.resource.clone(), method, args, options)
            .await
    }

    /// Invokes a method and decodes its result.
    ///
    /// # Errors
    ///
    /// The host's error, a transport failure, or a result that does not
    /// decode into `T`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T, ClientError> {
        self.call_with(method, args, CallOptions::default()).await
    }

    /// [`ResourceProxy::call`] with per-call options.
    ///
    /// # Errors
    ///
    /// As for [`ResourceProxy::call`].
    pub async fn call_with<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<T, ClientError> {
        let reply = self.send(method, args, options).await?;
        Ok(serde_json::from_value(reply.result.unwrap_or(Value::Null))?)
    }

    /// Reads a property from the host.
    ///
    /// # Errors
    ///
    /// As for [`ResourceProxy::call`].
    pub async fn get<T: DeserializeOwned>(&self, property: &str) -> Result<T, ClientError> {
        self.call(PROPERTY_READ_METHOD, vec![Value::String(property.to_string())])
            .await
    }

    /// Invokes a method for its side effects only. Still waits for the
    /// response so the cache has caught up when it returns.
    ///
    /// # Errors
    ///
    /// The host's error or a transport failure.
    pub async fn notify(&self, method: &str, args: Vec<Value>) -> Result<(), ClientError> {
        let options = CallOptions {
            no_return: true,
            ..CallOptions::default()
        };
        self.send(method, args, options).await.map(|_| ())
    }

    /// Reads a property from the cache when a local fallback is registered
    /// and the cache holds a baseline, otherwise from the host.
    ///
    /// # Errors
    ///
    /// The same errors the host would report for the read.
    pub async fn get_or_local<T: DeserializeOwned>(&self, property: &str) -> Result<T, ClientError> {
        match self.read_local(property)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => self.get(property).await,
        }
    }

    fn read_local(&self, property: &str) -> Result<Option<Value>, ClientError> {
        let Some(read) = self.client.fallbacks().get(self.resource.name(), property) else {
            return Ok(None);
        };
        let cache = self.client.cache();
        if !cache.is_synced() {
            return Ok(None);
        }
        let args = self.resource.args().unwrap_or(&[]);
        match read(cache.store(), args) {
            Ok(value) => {
                trace!(resource = %self.resource, property, "answered from cache");
                Ok(Some(value))
            }
            Err(FallbackError::NotFound(what)) => Err(ClientError::Host(ErrorPayload::new(
                ErrorCode::ResourceNotFound,
                format!("not found: {what}"),
            ))),
            Err(FallbackError::InvalidArgs(reason)) => Err(ClientError::Host(ErrorPayload::new(
                ErrorCode::InvalidParams,
                format!("invalid params: {reason}"),
            ))),
            Err(FallbackError::MissingModule(_)) => Ok(None),
        }
    }

    /// Invokes a method whose result arrives later as a single event.
    ///
    /// # Errors
    ///
    /// As for [`ResourceProxy::call`], or `ClientError::NotSubscription` if
    /// the method did not return a deferred handle.
    pub async fn deferred<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<DeferredHandle<T>, ClientError> {
        let reply = self.send(method, args, CallOptions::default()).await?;
        DeferredHandle::from_reply(self.client.clone(), reply)
    }

    /// Invokes a method that returns a stream handle.
    ///
    /// # Errors
    ///
    /// As for [`ResourceProxy::call`], or `ClientError::NotSubscription` if
    /// the method did not return a stream handle.
    pub async fn stream<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<StreamSubscription<T>, ClientError> {
        let reply = self.send(method, args, CallOptions::default()).await?;
        StreamSubscription::from_reply(self.client.clone(), reply)
    }
}
