//! Telephony engine client
//!
//! A thin REST surface plus the self-healing event-stream socket. The
//! engine terminates SIP/RTP; this client only drives bridges, channels
//! and endpoint subscriptions and feeds decoded events to the
//! orchestrator.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::StreamExt;
use reqwest::Method;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::events::AriEvent;
use crate::{Error, Result};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone)]
pub struct AriClient {
    base_url: String,
    ws_url: String,
    user: String,
    password: String,
    app_name: String,
    http: reqwest::Client,
}

impl AriClient {
    pub fn new(
        base_url: String,
        ws_url: String,
        user: String,
        password: String,
        app_name: String,
    ) -> Self {
        Self {
            base_url,
            ws_url,
            user,
            password,
            app_name,
            http: reqwest::Client::new(),
        }
    }

    /// One REST round-trip. 2xx with a body returns the parsed body; 204
    /// and empty bodies return `None`; anything else surfaces status and
    /// body for the caller to decide on.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Option<Value>> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method, &url)
            .basic_auth(&self.user, Some(&self.password));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Engine {
                status: status.as_u16(),
                body,
            });
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let text = response.text().await?;
        if text.is_empty() {
            return Ok(None);
        }
        let value = serde_json::from_str(&text).map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Some(value))
    }

    /// Register this application as a consumer of endpoint-state events.
    /// Idempotent on the engine side; called once at startup.
    pub async fn subscribe_endpoint_events(&self) -> Result<()> {
        let path = format!(
            "/applications/{}/subscription?eventSource=endpoint:PJSIP",
            self.app_name
        );
        self.request(Method::POST, &path, None).await?;
        info!(app = %self.app_name, "Subscribed to endpoint events");
        Ok(())
    }

    pub async fn answer(&self, channel_id: &str) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/channels/{}/answer", channel_id),
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn hold(&self, channel_id: &str) -> Result<()> {
        self.request(Method::POST, &format!("/channels/{}/hold", channel_id), None)
            .await?;
        Ok(())
    }

    /// Hang up a channel. A 404 means the leg is already gone, which is
    /// what the caller wanted anyway.
    pub async fn hangup(&self, channel_id: &str) -> Result<()> {
        match self
            .request(Method::DELETE, &format!("/channels/{}", channel_id), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Engine { status: 404, .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Originate an outbound leg into this application.
    pub async fn originate(&self, endpoint: &str, app_args: &str) -> Result<()> {
        let body = json!({
            "endpoint": endpoint,
            "app": self.app_name,
            "appArgs": app_args,
        });
        self.request(Method::POST, "/channels", Some(body)).await?;
        Ok(())
    }

    pub async fn create_mixing_bridge(&self) -> Result<String> {
        let value = self
            .request(Method::POST, "/bridges", Some(json!({"type": "mixing"})))
            .await?
            .ok_or_else(|| Error::Internal("engine returned no bridge body".to_string()))?;
        value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Internal("bridge response missing id".to_string()))
    }

    pub async fn add_channel(&self, bridge_id: &str, channel_id: &str) -> Result<()> {
        let body = json!({ "channel": channel_id });
        self.request(
            Method::POST,
            &format!("/bridges/{}/addChannel", bridge_id),
            Some(body),
        )
        .await?;
        Ok(())
    }

    /// Channel ids currently in the bridge.
    pub async fn bridge_channels(&self, bridge_id: &str) -> Result<Vec<String>> {
        let value = self
            .request(Method::GET, &format!("/bridges/{}", bridge_id), None)
            .await?
            .ok_or_else(|| Error::Internal("engine returned no bridge body".to_string()))?;
        let channels = value
            .get("channels")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(channels)
    }

    pub async fn delete_bridge(&self, bridge_id: &str) -> Result<()> {
        self.request(Method::DELETE, &format!("/bridges/{}", bridge_id), None)
            .await?;
        Ok(())
    }

    /// Consume the engine event stream forever, reconnecting with
    /// exponential backoff. A successful connect resets the backoff;
    /// undecodable payloads are dropped.
    pub async fn run_events<F>(&self, handler: F)
    where
        F: Fn(AriEvent) + Send + Sync + 'static,
    {
        let mut delay = RECONNECT_BASE;
        loop {
            match self.connect_stream().await {
                Ok(stream) => {
                    delay = RECONNECT_BASE;
                    info!("Engine event stream connected");
                    if let Err(err) = self.consume_stream(stream, &handler).await {
                        warn!(error = %err, "Engine event stream dropped");
                    } else {
                        warn!("Engine event stream closed by peer");
                    }
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        retry_in_secs = delay.as_secs(),
                        "Engine event stream connect failed"
                    );
                }
            }
            tokio::time::sleep(delay).await;
            delay = next_delay(delay);
        }
    }

    async fn connect_stream(&self) -> Result<WsStream> {
        let mut request = self
            .ws_url
            .clone()
            .into_client_request()
            .map_err(|e| Error::Internal(e.to_string()))?;
        let credentials = BASE64.encode(format!("{}:{}", self.user, self.password));
        let header = HeaderValue::from_str(&format!("Basic {}", credentials))
            .map_err(|e| Error::Internal(e.to_string()))?;
        request.headers_mut().insert("Authorization", header);

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| Error::Transient(e.to_string()))?;
        Ok(stream)
    }

    async fn consume_stream<F>(&self, mut stream: WsStream, handler: &F) -> Result<()>
    where
        F: Fn(AriEvent),
    {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(payload)) => match serde_json::from_str::<AriEvent>(&payload) {
                    Ok(event) => handler(event),
                    Err(_) => debug!("Dropping undecodable engine event"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => return Err(Error::Transient(err.to_string())),
            }
        }
        Ok(())
    }
}

fn next_delay(delay: Duration) -> Duration {
    (delay * 2).min(RECONNECT_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut delay = RECONNECT_BASE;
        let mut observed = Vec::new();
        for _ in 0..7 {
            observed.push(delay.as_secs());
            delay = next_delay(delay);
        }
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 30, 30]);
    }
}
