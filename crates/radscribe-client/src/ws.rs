use crate::error::{DictationError, Result};
use crate::protocol::decode_server_msg;
use crate::transport::{Connector, SendCmd, TransportEvent, TransportHandle, CLOSE_NORMAL};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use http::header::AUTHORIZATION;
use http::HeaderValue;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket [`Connector`] for the transcription service. One connection per
/// session, bearer credential in the handshake, no reconnection: a dropped
/// connection ends the session and the caller starts a new one.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

async fn connect_ws(url: &str, credential: &str) -> Result<WsStream> {
    let url = Url::parse(url).map_err(|e| DictationError::Handshake(e.to_string()))?;

    let mut req = url
        .to_string()
        .into_client_request()
        .map_err(|e| DictationError::Handshake(e.to_string()))?;

    let header_value = HeaderValue::from_str(&format!("Bearer {credential}"))
        .map_err(|e| DictationError::Handshake(e.to_string()))?;
    req.headers_mut().insert(AUTHORIZATION, header_value);

    let (ws_stream, _resp) = connect_async(req)
        .await
        .map_err(|e| DictationError::Handshake(e.to_string()))?;

    Ok(ws_stream)
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, credential: &str) -> Result<TransportHandle> {
        let ws_stream = connect_ws(&self.url, credential).await?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<SendCmd>(128);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(128);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = rx.recv() => {
                        let Some(cmd) = cmd else {
                            break;
                        };

                        match cmd {
                            SendCmd::Chunk(chunk) => {
                                if let Err(e) = ws_write
                                    .send(Message::Binary(chunk.into_bytes().into()))
                                    .await
                                {
                                    let _ = event_tx
                                        .send(TransportEvent::Failed(format!(
                                            "websocket send failed: {e}"
                                        )))
                                        .await;
                                    break;
                                }
                            }
                            SendCmd::Close => {
                                let _ = ws_write.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                    item = ws_read.next() => {
                        let Some(item) = item else {
                            let _ = event_tx
                                .send(TransportEvent::Failed(
                                    "websocket stream ended unexpectedly".to_string(),
                                ))
                                .await;
                            break;
                        };

                        let msg = match item {
                            Ok(msg) => msg,
                            Err(e) => {
                                let _ = event_tx
                                    .send(TransportEvent::Failed(format!(
                                        "websocket transport error: {e}"
                                    )))
                                    .await;
                                break;
                            }
                        };

                        match msg {
                            Message::Text(text) => {
                                match decode_server_msg(text.as_str()) {
                                    Ok(server_msg) => {
                                        if event_tx
                                            .send(TransportEvent::Message(server_msg))
                                            .await
                                            .is_err()
                                        {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        let _ = event_tx
                                            .send(TransportEvent::Failed(e.to_string()))
                                            .await;
                                        break;
                                    }
                                }
                            }
                            Message::Close(frame) => {
                                let (code, reason) = match frame {
                                    Some(frame) => {
                                        (u16::from(frame.code), frame.reason.to_string())
                                    }
                                    None => (CLOSE_NORMAL, String::new()),
                                };

                                let _ = event_tx
                                    .send(TransportEvent::Closed { code, reason })
                                    .await;
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }

            debug!("websocket io loop ended");
        });

        Ok(TransportHandle::from_parts(tx, event_rx))
    }
}
