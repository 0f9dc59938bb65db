use crate::error::RemoteError;
use crate::remote_sync::{RemoteStore, RemoteValue};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Firebase Realtime Database over its REST interface.
///
/// Paths map to `{base_url}{path}.json`; the legacy database secret goes into
/// the `auth` query parameter. The client counts as ready after a successful
/// `begin()` and until a transport or authorization failure.
pub struct FirebaseClient {
    base_url: String,
    auth_token: String,
    client: reqwest::Client,
    ready: bool,
}

impl FirebaseClient {
    /// Builds the HTTP client once; `timeout` bounds every later call
    pub fn new(
        base_url: impl Into<String>,
        auth_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into(),
            auth_token: auth_token.into(),
            client,
            ready: false,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}.json", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        if self.auth_token.is_empty() {
            builder
        } else {
            builder.query(&[("auth", self.auth_token.as_str())])
        }
    }

    /// Sends a request and turns anything but a 2xx into the opaque reason string
    async fn send(&mut self, builder: RequestBuilder) -> Result<Response, String> {
        let response = match self.authorized(builder).send().await {
            Ok(response) => response,
            Err(e) => {
                self.ready = false;
                return Err(e.to_string());
            }
        };

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                self.ready = false;
                Err("permission denied".to_string())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(format!("HTTP {}: {}", status.as_u16(), body.trim()))
            }
        }
    }

    async fn put(&mut self, path: &str, body: &Value) -> Result<(), RemoteError> {
        let builder = self.client.put(self.url(path)).json(body);
        self.send(builder)
            .await
            .map(|_| ())
            .map_err(|reason| RemoteError::WriteFailed {
                path: path.to_string(),
                reason,
            })
    }
}

#[async_trait]
impl RemoteStore for FirebaseClient {
    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn begin(&mut self) -> Result<(), RemoteError> {
        info!(url = %self.base_url, "Initializing Firebase");
        let builder = self
            .client
            .get(self.url("/"))
            .query(&[("shallow", "true")]);
        match self.send(builder).await {
            Ok(_) => {
                self.ready = true;
                info!("Firebase initialized");
                Ok(())
            }
            Err(reason) => {
                self.ready = false;
                warn!(%reason, "Firebase initialization failed");
                Err(RemoteError::Unavailable(reason))
            }
        }
    }

    async fn set_document(&mut self, path: &str, document: &Value) -> Result<(), RemoteError> {
        self.put(path, document).await
    }

    async fn get_bool(&mut self, path: &str) -> Result<RemoteValue, RemoteError> {
        let read_failed = |reason: String| RemoteError::ReadFailed {
            path: path.to_string(),
            reason,
        };

        let builder = self.client.get(self.url(path));
        let response = self.send(builder).await.map_err(read_failed)?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| read_failed(e.to_string()))?;
        debug!(path, ?value, "Control value read");
        Ok(RemoteValue::from(&value))
    }

    async fn set_bool(&mut self, path: &str, value: bool) -> Result<(), RemoteError> {
        self.put(path, &Value::Bool(value)).await
    }
}
