use crate::traits::ChannelAdapter;
use crate::types::{
    ChannelId, ChatId, InboundMessage, InboundMessageKind, Mention, MessageId, OutboundMessage,
    SenderId,
};
use anyhow::Result;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const WEBCHAT_CHANNEL_ID: &str = "webchat";

#[derive(Clone)]
struct WebChatState {
    inbound_tx: Arc<tokio::sync::RwLock<Option<mpsc::Sender<InboundMessage>>>>,
    connections: Arc<DashMap<String, mpsc::UnboundedSender<Message>>>,
}

/// Local WebSocket chat surface.
///
/// Each connection is one sender. Clients may share a `chat_id` to form a
/// group conversation; replies go back to the connection that asked.
#[derive(Clone)]
pub struct WebChatAdapter {
    state: WebChatState,
}

impl Default for WebChatAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl WebChatAdapter {
    pub fn new() -> Self {
        Self {
            state: WebChatState {
                inbound_tx: Arc::new(tokio::sync::RwLock::new(None)),
                connections: Arc::new(DashMap::new()),
            },
        }
    }

    /// Router that serves the WebChat WebSocket at `/ws`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route("/ws", get(ws_upgrade)).with_state(self)
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }
}

#[derive(Debug, Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    chat_type: Option<String>,
    #[serde(default)]
    mentions: Vec<Mention>,
    #[serde(default)]
    create_time: Option<serde_json::Value>,
}

fn parse_client_frame(
    sender_id: &str,
    raw: &str,
    received_at: DateTime<Utc>,
) -> Result<InboundMessage> {
    let frame: ClientFrame = serde_json::from_str(raw)
        .map_err(|e| anyhow::anyhow!("webchat frame is not valid json: {e}"))?;
    if frame.frame_type != "message" {
        return Err(anyhow::anyhow!(
            "webchat unsupported frame type: {}",
            frame.frame_type
        ));
    }
    let content = frame
        .content
        .ok_or_else(|| anyhow::anyhow!("webchat message missing content"))?;
    let kind = match frame.message_type.as_deref() {
        None | Some("text") => InboundMessageKind::Text,
        Some(_) => InboundMessageKind::Other,
    };
    let chat_id = frame
        .chat_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| sender_id.to_string());
    let message_id = frame
        .message_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let created_at = frame.create_time.as_ref().and_then(parse_create_time);

    Ok(InboundMessage {
        kind,
        message_id: MessageId::new(message_id),
        channel_id: ChannelId::new(WEBCHAT_CHANNEL_ID),
        sender_id: SenderId::new(sender_id),
        chat_id: ChatId::new(chat_id),
        is_group: frame.chat_type.as_deref() == Some("group"),
        content,
        mentions: frame.mentions,
        created_at,
        received_at,
    })
}

/// Epoch milliseconds, as a number or a numeric string.
fn parse_create_time(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        serde_json::Value::Number(n) => n.as_i64()?,
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    DateTime::from_timestamp_millis(millis)
}

async fn ws_upgrade(
    State(adapter): State<Arc<WebChatAdapter>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(adapter, socket))
}

#[tracing::instrument(level = "info", skip_all)]
async fn handle_socket(adapter: Arc<WebChatAdapter>, socket: WebSocket) {
    let sender_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    adapter
        .state
        .connections
        .insert(sender_id.clone(), outbound_tx);

    let hello = serde_json::json!({ "type": "hello", "sender_id": sender_id });
    if ws_sender
        .send(Message::Text(hello.to_string().into()))
        .await
        .is_err()
    {
        adapter.state.connections.remove(&sender_id);
        return;
    }
    tracing::info!(
        sender_id = %sender_id,
        connections = adapter.connection_count(),
        "webchat connection opened"
    );

    let adapter_out = adapter.clone();
    let sender_id_out = sender_id.clone();
    let outbound_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
        adapter_out.state.connections.remove(&sender_id_out);
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let Message::Text(text) = msg else {
            continue;
        };

        let inbound = match parse_client_frame(&sender_id, text.as_str(), Utc::now()) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(%e, sender_id = %sender_id, "webchat frame skipped");
                continue;
            }
        };

        let tx = adapter.state.inbound_tx.read().await.clone();
        let Some(tx) = tx else {
            tracing::error!(sender_id = %sender_id, "webchat adapter started without inbound queue");
            break;
        };
        if let Err(e) = tx.send(inbound).await {
            tracing::error!(%e, sender_id = %sender_id, "webchat inbound queue closed");
            break;
        }
    }

    outbound_task.abort();
    adapter.state.connections.remove(&sender_id);
    tracing::info!(
        sender_id = %sender_id,
        connections = adapter.connection_count(),
        "webchat connection closed"
    );
}

#[async_trait::async_trait]
impl ChannelAdapter for WebChatAdapter {
    fn channel_id(&self) -> &str {
        WEBCHAT_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        *self.state.inbound_tx.write().await = Some(tx);
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let Some(conn) = self.state.connections.get(recipient_id) else {
            return Err(anyhow::anyhow!(
                "webchat connection not found for recipient_id={recipient_id}"
            ));
        };
        let payload = serde_json::json!({
            "type": "message",
            "content": message.content,
            "reply_to": message.reply_to_message_id,
        });
        conn.send(Message::Text(payload.to_string().into()))
            .map_err(|_| anyhow::anyhow!("webchat send failed: socket closed"))?;
        Ok(())
    }
}
