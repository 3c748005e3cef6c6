//! # WebSocket Module
//!
//! Pushes wallet changes to connected clients. Display only: clients
//! must re-read `GET /wallet/{account}` for authoritative numbers.
//!
//! ## Connection Flow
//!
//! ```text
//! 1. Client connects to /ws/:account
//!              ↓
//! 2. Server registers a broadcast channel for the account
//!              ↓
//! 3. Events are pushed after successful calls:
//!    - wallet_updated   (award, redeem, link merge)
//!    - account_linked   (messaging identity linked)
//! ```
//!
//! ## Message Format
//!
//! ```json
//! {
//!     "event": "wallet_updated",
//!     "data": {
//!         "accountId": "acct1",
//!         "credits": 55,
//!         "delta": 1,
//!         "entryId": "9f86d0...",
//!         "kind": "earn",
//!         "newBadges": []
//!     },
//!     "timestamp": "2024-01-15T12:00:00Z"
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::Message;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::db::EntryKind;
use crate::AppState;

/// WebSocket event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WsEventType {
    /// Balance changed.
    WalletUpdated,
    /// A messaging identity was linked to the account.
    AccountLinked,
    /// Sent once after the handshake.
    Connected,
    /// Reply to a client text frame.
    Pong,
}

/// WebSocket message wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsMessage<T> {
    pub event: WsEventType,
    pub data: T,
    pub timestamp: chrono::DateTime<Utc>,
}

impl<T: Serialize> WsMessage<T> {
    pub fn new(event: WsEventType, data: T) -> Self {
        Self {
            event,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Wallet updated event data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletUpdatedData {
    pub account_id: String,
    pub credits: i64,
    pub impact: f64,
    pub delta: i64,
    pub entry_id: String,
    pub kind: EntryKind,
    pub new_badges: Vec<String>,
}

/// Account linked event data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountLinkedData {
    pub account_id: String,
    pub external_id: String,
    pub display_name: String,
    pub merged_credits: i64,
}

/// WebSocket connection registry.
///
/// Tracks active sessions per account. An account may have several
/// connections (tabs, devices).
#[derive(Clone, Default)]
pub struct WsRegistry {
    /// account id -> one sender per connection
    sessions: Arc<Mutex<HashMap<String, Vec<broadcast::Sender<String>>>>>,
}

impl WsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return its receiver.
    pub async fn register(&self, account_id: &str) -> broadcast::Receiver<String> {
        let mut sessions = self.sessions.lock().await;
        let (tx, rx) = broadcast::channel(100);

        let senders = sessions.entry(account_id.to_string()).or_default();
        senders.push(tx);

        info!(
            "Registered WebSocket for {} (total connections: {})",
            account_id,
            senders.len()
        );
        rx
    }

    /// Drop senders whose receivers are gone.
    pub async fn unregister(&self, account_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(senders) = sessions.get_mut(account_id) {
            senders.retain(|tx| tx.receiver_count() > 0);

            if senders.is_empty() {
                sessions.remove(account_id);
                info!("Unregistered all WebSocket connections for {}", account_id);
            } else {
                debug!(
                    "Unregistered one WebSocket connection for {} (remaining: {})",
                    account_id,
                    senders.len()
                );
            }
        }
    }

    /// Send an event to every connection of `account_id`.
    ///
    /// An account with no connections is not an error.
    pub async fn send_to_account<T: Serialize>(
        &self,
        account_id: &str,
        event: WsEventType,
        data: T,
    ) -> Result<(), String> {
        let json = WsMessage::new(event, data)
            .to_json()
            .map_err(|e| format!("Failed to serialize message: {}", e))?;

        let mut sessions = self.sessions.lock().await;
        let Some(senders) = sessions.get_mut(account_id) else {
            debug!("No active WebSocket connections for {}", account_id);
            return Ok(());
        };

        senders.retain(|sender| sender.receiver_count() > 0 && sender.send(json.clone()).is_ok());
        let sent = senders.len();
        if senders.is_empty() {
            sessions.remove(account_id);
        }

        if sent > 0 {
            debug!("Sent {:?} to {} ({} connections)", event, account_id, sent);
        }
        Ok(())
    }

    /// Number of live connections for an account.
    pub async fn connection_count(&self, account_id: &str) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.get(account_id).map(|v| v.len()).unwrap_or(0)
    }
}

/// Configure WebSocket routes.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/{account}", web::get().to(websocket_handler));
}

/// WebSocket connection handler.
///
/// ## Endpoint
///
/// `GET /ws/:account`
///
/// ## Example (JavaScript)
///
/// ```javascript
/// const ws = new WebSocket('ws://localhost:8080/ws/acct1');
/// ws.onmessage = (event) => console.log(JSON.parse(event.data));
/// ```
pub async fn websocket_handler(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Payload,
    state: web::Data<Arc<AppState>>,
) -> Result<HttpResponse, actix_web::Error> {
    let account_id = path.into_inner();
    info!("WebSocket connection request for {}", account_id);

    let (response, mut session, mut msg_stream) = actix_ws::handle(&req, body)?;

    let registry = state.ws_registry.clone();
    let mut rx = registry.register(&account_id).await;

    actix_rt::spawn(async move {
        let welcome = WsMessage::new(
            WsEventType::Connected,
            serde_json::json!({ "accountId": account_id }),
        );
        if let Ok(json) = welcome.to_json() {
            if let Err(e) = session.text(json).await {
                error!("Failed to send welcome message: {}", e);
            }
        }

        // Forward registry events to the socket
        let mut outbound = session.clone();
        let forward_account = account_id.clone();
        let forward_registry = registry.clone();
        actix_rt::spawn(async move {
            while let Ok(msg) = rx.recv().await {
                if let Err(e) = outbound.text(msg).await {
                    debug!("WebSocket session closed for {}: {}", forward_account, e);
                    forward_registry.unregister(&forward_account).await;
                    break;
                }
            }
        });

        while let Some(Ok(msg)) = msg_stream.next().await {
            match msg {
                Message::Ping(bytes) => {
                    let _ = session.pong(&bytes).await;
                }
                Message::Text(text) => {
                    debug!("Received text from {}: {}", account_id, text);
                    let reply = WsMessage::new(
                        WsEventType::Pong,
                        serde_json::json!({ "received": text.to_string() }),
                    );
                    if let Ok(json) = reply.to_json() {
                        let _ = session.text(json).await;
                    }
                }
                Message::Binary(_) => {
                    warn!("Received unexpected binary message from {}", account_id);
                }
                Message::Close(reason) => {
                    info!("WebSocket closed for {}: {:?}", account_id, reason);
                    break;
                }
                _ => {}
            }
        }

        registry.unregister(&account_id).await;
        info!("WebSocket disconnected for {}", account_id);
    });

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_reaches_registered_connection() {
        let registry = WsRegistry::new();
        let mut rx = registry.register("acct1").await;

        registry
            .send_to_account(
                "acct1",
                WsEventType::AccountLinked,
                AccountLinkedData {
                    account_id: "acct1".to_string(),
                    external_id: "tg1".to_string(),
                    display_name: "Alice".to_string(),
                    merged_credits: 30,
                },
            )
            .await
            .unwrap();

        let raw = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["event"], "account_linked");
        assert_eq!(json["data"]["mergedCredits"], 30);
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_pruned() {
        let registry = WsRegistry::new();
        let rx = registry.register("acct1").await;
        assert_eq!(registry.connection_count("acct1").await, 1);

        drop(rx);
        registry
            .send_to_account("acct1", WsEventType::Pong, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(registry.connection_count("acct1").await, 0);

        // Unknown accounts are fine
        assert!(registry
            .send_to_account("nobody", WsEventType::Pong, serde_json::json!({}))
            .await
            .is_ok());
    }
}
