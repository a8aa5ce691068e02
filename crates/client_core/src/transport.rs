//! Duplex channel plumbing: a [`Transport`] opens a link, the link is a pair
//! of unbounded queues (frames out, frames in). Framing and the socket itself
//! stay behind the trait so the connection layer can be driven by a mock.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientRequest, InboundFrame, OutboundFrame};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, warn};
use url::Url;

/// Where to connect and which credential to present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: Url,
    pub token: String,
}

impl ConnectRequest {
    pub fn new(url: Url, token: impl Into<String>) -> Self {
        Self {
            url,
            token: token.into(),
        }
    }

    /// Endpoint with the credential attached as `?token=`.
    pub fn url_with_token(&self) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("token", &self.token);
        url
    }

    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// Handshake payload written as the first frame on every link.
    pub fn handshake(&self) -> OutboundFrame {
        OutboundFrame {
            request: ClientRequest::Authenticate {
                token: self.token.clone(),
            },
            ack: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(InboundFrame),
    Closed { reason: String },
}

/// An open channel. Dropping `outbound` closes the link.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: &ConnectRequest) -> Result<TransportLink>;
}

/// JSON-over-websocket transport.
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, request: &ConnectRequest) -> Result<TransportLink> {
        let url = request.url_with_token();
        let mut ws_request = url
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid websocket url: {}", request.url))?;
        ws_request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&request.bearer_header())
                .context("credential is not a valid header value")?,
        );

        let (ws_stream, _) = connect_async(ws_request)
            .await
            .with_context(|| format!("failed to connect websocket: {}", request.url))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        outbound
            .send(request.handshake())
            .context("handshake queue closed")?;

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(event = frame.request.name(), "dropping unencodable frame: {err}");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!("websocket send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            let mut reason = "connection closed".to_string();
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<InboundFrame>(&text) {
                        Ok(frame) => {
                            if inbound_tx.send(TransportEvent::Frame(frame)).is_err() {
                                return;
                            }
                        }
                        Err(err) => debug!("ignoring undecodable frame: {err}"),
                    },
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            reason = format!("closed by server: {}", frame.reason);
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        reason = format!("websocket receive failed: {err}");
                        break;
                    }
                }
            }
            let _ = inbound_tx.send(TransportEvent::Closed { reason });
        });

        Ok(TransportLink { outbound, inbound })
    }
}
