//! Inbound multiplexer: every channel adapter feeds one queue, each admitted
//! message becomes one assistant turn, serialized per chat.

use crate::commands::{self, ChatCommand, StatusSnapshot};
use crate::dashboard::Dashboard;
use crate::session::SessionStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use relay_channels::{ChannelAdapter, InboundMessage, InboundMessageKind, OutboundMessage};
use relay_core::policy::{is_bot_mentioned, is_stale, sanitize_error};
use relay_core::{ChatRunQueue, CoreError, MessageDedupCache, run_with_timeout};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EMPTY_RESPONSE_REPLY: &str = "The assistant returned no content.";

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub bot_id: Option<String>,
    pub dedup_capacity: usize,
    pub max_message_age: chrono::Duration,
    pub run_timeout: Duration,
    pub model: String,
}

pub struct Gateway {
    settings: GatewaySettings,
    dedup: MessageDedupCache,
    queue: ChatRunQueue,
    sessions: Arc<SessionStore>,
    dashboard: Arc<Dashboard>,
    channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    inbound_rx: tokio::sync::Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    missing_bot_id_warned: AtomicBool,
}

impl Gateway {
    pub fn new(
        settings: GatewaySettings,
        sessions: Arc<SessionStore>,
        dashboard: Arc<Dashboard>,
        channels: HashMap<String, Arc<dyn ChannelAdapter>>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        Self {
            dedup: MessageDedupCache::new(settings.dedup_capacity),
            settings,
            queue: ChatRunQueue::new(),
            sessions,
            dashboard,
            channels,
            inbound_rx: tokio::sync::Mutex::new(Some(inbound_rx)),
            missing_bot_id_warned: AtomicBool::new(false),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop(shutdown).await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(self: &Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let Some(mut rx) = self.inbound_rx.lock().await.take() else {
            return Err(anyhow::anyhow!("gateway inbound queue already consumed"));
        };
        loop {
            let inbound = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("gateway shutdown requested");
                    return Ok(());
                }
                msg = rx.recv() => match msg {
                    Some(inbound) => inbound,
                    None => {
                        tracing::info!("gateway inbound queue closed");
                        return Ok(());
                    }
                },
            };
            self.handle_inbound(inbound);
        }
    }

    /// Admission runs here in receipt order; processing is queued per chat.
    fn handle_inbound(self: &Arc<Self>, inbound: InboundMessage) {
        if let Err(e) = self.admit(&inbound, Utc::now()) {
            match e {
                CoreError::DuplicateEvent(_) => tracing::warn!(
                    message_id = %inbound.message_id,
                    chat_id = %inbound.chat_id,
                    "duplicate message ignored"
                ),
                _ if e.is_silent_drop() => tracing::info!(
                    reason = %e,
                    message_id = %inbound.message_id,
                    chat_id = %inbound.chat_id,
                    "message not admitted"
                ),
                _ => tracing::error!(
                    error = %e,
                    message_id = %inbound.message_id,
                    chat_id = %inbound.chat_id,
                    "admission failed"
                ),
            }
            return;
        }

        let total = self.dashboard.messages();
        self.dashboard.info(
            Some(inbound.chat_id.as_str()),
            format!("received message: {}", preview(&inbound.content)),
        );
        tracing::info!(
            message_id = %inbound.message_id,
            chat_id = %inbound.chat_id,
            channel_id = %inbound.channel_id,
            is_group = inbound.is_group,
            messages_total = total,
            "message admitted"
        );

        let gateway = self.clone();
        let chat_id = inbound.chat_id.as_str().to_string();
        let turn = self.queue.enqueue(&chat_id, move || async move {
            gateway.handle_turn(inbound).await;
            Ok::<(), CoreError>(())
        });
        tokio::spawn(turn);
    }

    /// Dedup, staleness, kind, and group-mention gates, in that order.
    /// Every fresh text message is counted, including group chatter the bot
    /// is not mentioned in.
    fn admit(&self, inbound: &InboundMessage, now: DateTime<Utc>) -> relay_core::Result<()> {
        if self.dedup.seen(inbound.message_id.as_str()) {
            return Err(CoreError::DuplicateEvent(inbound.message_id.to_string()));
        }
        if is_stale(inbound.created_at, now, self.settings.max_message_age) {
            return Err(CoreError::PolicyRejected("stale message".to_string()));
        }
        if inbound.kind != InboundMessageKind::Text {
            return Err(CoreError::PolicyRejected(
                "unsupported message kind".to_string(),
            ));
        }
        self.dashboard.record_message();
        if inbound.is_group {
            let bot_id = self.settings.bot_id.as_deref();
            if bot_id.is_none() && !self.missing_bot_id_warned.swap(true, Ordering::Relaxed) {
                tracing::warn!("channels.bot_id is not set; group messages will be ignored");
                self.dashboard
                    .error(None, "channels.bot_id is not set; group messages are ignored");
            }
            if !is_bot_mentioned(inbound.mention_ids(), bot_id) {
                return Err(CoreError::PolicyRejected(
                    "group message does not mention the bot".to_string(),
                ));
            }
        }
        Ok(())
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(chat_id = %inbound.chat_id, message_id = %inbound.message_id)
    )]
    async fn handle_turn(&self, inbound: InboundMessage) {
        let reply = match self.process(&inbound).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "message processing failed");
                self.dashboard.error(
                    Some(inbound.chat_id.as_str()),
                    format!("processing failed: {e}"),
                );
                sanitize_error(&e).to_string()
            }
        };
        self.reply(&inbound, reply).await;
    }

    async fn process(&self, inbound: &InboundMessage) -> Result<String> {
        if let Some(command) = commands::parse_command(&inbound.content) {
            return self.run_command(command, inbound).await;
        }

        let chat_id = inbound.chat_id.as_str();
        let thread = self.sessions.thread_for(chat_id);
        let runner = thread.clone();
        let input = inbound.content.clone();
        let turn = run_with_timeout(
            move |cancel| async move { Ok::<_, anyhow::Error>(runner.run(&input, cancel).await?) },
            self.settings.run_timeout,
        )
        .await?;

        if let Some(thread_id) = thread.id() {
            let known = self.sessions.stored_thread_id(chat_id);
            if let Err(e) = self.sessions.bind(chat_id, &thread_id).await {
                tracing::error!(error = %e, thread_id = %thread_id, "failed to persist session binding");
            } else if known.as_deref() != Some(thread_id.as_str()) {
                tracing::info!(thread_id = %thread_id, "chat bound to assistant thread");
                self.dashboard
                    .info(Some(chat_id), format!("session bound: {chat_id}"));
            }
        }

        tracing::info!(
            input_tokens = turn.usage.input_tokens,
            output_tokens = turn.usage.output_tokens,
            "assistant turn completed"
        );
        if turn.final_response.trim().is_empty() {
            return Ok(EMPTY_RESPONSE_REPLY.to_string());
        }
        Ok(turn.final_response)
    }

    async fn run_command(&self, command: ChatCommand, inbound: &InboundMessage) -> Result<String> {
        let chat_id = inbound.chat_id.as_str();
        tracing::info!(?command, "running chat command");
        match command {
            ChatCommand::Status => {
                let channels = self.channel_ids();
                self.dashboard.info(Some(chat_id), "ran /status");
                Ok(commands::status_reply(&StatusSnapshot {
                    sessions: self.sessions.len(),
                    messages: self.dashboard.messages(),
                    uptime: self.dashboard.uptime(),
                    model: &self.settings.model,
                    channels: &channels,
                }))
            }
            ChatCommand::Help => {
                self.dashboard.info(Some(chat_id), "ran /help");
                Ok(commands::help_reply())
            }
            ChatCommand::Clear => {
                let cleared = self.sessions.clear(chat_id).await?;
                if cleared {
                    self.dashboard
                        .info(Some(chat_id), format!("session cleared: {chat_id}"));
                }
                Ok(commands::clear_reply(cleared).to_string())
            }
        }
    }

    async fn reply(&self, inbound: &InboundMessage, content: String) {
        let Some(adapter) = self.channels.get(inbound.channel_id.as_str()) else {
            tracing::error!(channel_id = %inbound.channel_id, "reply dropped: unknown channel");
            return;
        };
        let outbound = OutboundMessage {
            content,
            reply_to_message_id: Some(inbound.message_id.clone()),
        };
        if let Err(e) = adapter.send(inbound.sender_id.as_str(), outbound).await {
            tracing::error!(%e, channel_id = %inbound.channel_id, sender_id = %inbound.sender_id, "reply failed");
        }
    }

    fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn preview(content: &str) -> String {
    const MAX_CHARS: usize = 50;
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
