//! WebSocket signaling transport against the banter relay.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use banter_proto::{ClientMessage, ServerMessage, UserId};

use crate::error::EngineError;

use super::SignalingTransport;

const RELAY_PING_INTERVAL: Duration = Duration::from_secs(30);

pub struct WsSignaling {
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    recv_rx: AsyncMutex<mpsc::UnboundedReceiver<ServerMessage>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WsSignaling {
    /// Connect `/ws/:user_id` on the relay. The user id is the stable logical
    /// identity; reconnecting with the same id replaces the old channel.
    pub async fn connect(relay_url: &str, user: &UserId) -> Result<Self, EngineError> {
        let url = derive_ws_url(relay_url, user)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| EngineError::Validation(format!("relay connect failed: {err}")))?;
        let (mut write, mut read) = stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (recv_tx, recv_rx) = mpsc::unbounded_channel::<ServerMessage>();

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                match serde_json::to_string(&message) {
                    Ok(json) => {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(target = "signaling", error = %err, "failed to encode message");
                    }
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(message) => {
                                if recv_tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                debug!(target = "signaling", error = %err, "undecodable frame");
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(target = "signaling", error = %err, "relay socket error");
                        break;
                    }
                }
            }
        });

        let ping_tx = send_tx.clone();
        let pinger = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RELAY_PING_INTERVAL);
            loop {
                ticker.tick().await;
                if ping_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            send_tx,
            recv_rx: AsyncMutex::new(recv_rx),
            tasks: Mutex::new(vec![writer, reader, pinger]),
        })
    }
}

#[async_trait]
impl SignalingTransport for WsSignaling {
    async fn send(&self, message: ClientMessage) -> Result<(), EngineError> {
        self.send_tx
            .send(message)
            .map_err(|_| EngineError::SignalingClosed)
    }

    async fn recv(&self) -> Option<ServerMessage> {
        self.recv_rx.lock().await.recv().await
    }

    async fn close(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for WsSignaling {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

fn derive_ws_url(relay_url: &str, user: &UserId) -> Result<Url, EngineError> {
    let mut url = Url::parse(relay_url)
        .map_err(|err| EngineError::Validation(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(EngineError::Validation(format!(
                "unsupported relay scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| EngineError::Validation("invalid relay scheme".into()))?;
    url.set_path(&format!("ws/{user}"));
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_is_derived_from_http_base() {
        let user = UserId::from("alice");
        let url = derive_ws_url("http://relay.example:8090", &user).unwrap();
        assert_eq!(url.as_str(), "ws://relay.example:8090/ws/alice");

        let url = derive_ws_url("https://relay.example/", &user).unwrap();
        assert_eq!(url.as_str(), "wss://relay.example/ws/alice");
    }

    #[test]
    fn garbage_urls_are_rejected() {
        let user = UserId::from("alice");
        assert!(derive_ws_url("ftp://relay", &user).is_err());
        assert!(derive_ws_url("not a url", &user).is_err());
    }
}
