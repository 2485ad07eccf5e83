use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::model::{Message, MessageKind};
use crate::platform::{Transport, UpdateEnvelope, UpdatePayload, UpdateSource};
use crate::shutdown::StopSignal;

const HEALTH_CHECKS: [&str; 3] = ["test telegram", "test_telegram", "testtelegram"];
const HEALTH_REPLY: &str = "TELEGRAM IS WORKING";

/// Turn a platform envelope into a routed event. Returns `None` for
/// anything the router does not handle (non-text messages, edits, ...).
pub fn classify(envelope: UpdateEnvelope, marker: &str) -> Option<Message> {
    let update_id = Some(envelope.update_id);
    match envelope.payload {
        UpdatePayload::Message(payload) => {
            let from_id = payload.from_id?;
            let raw = payload.text?;
            let (kind, text) = match raw.strip_prefix(marker) {
                Some(rest) => (MessageKind::Command, strip_bot_mention(rest)),
                None => (MessageKind::Message, raw),
            };
            Some(Message {
                update_id,
                kind,
                chat_id: payload.chat_id,
                message_id: Some(payload.message_id),
                from_id,
                from_name: payload.from_name,
                from_username: payload.from_username,
                chat_last_name: payload.chat_last_name,
                text: Some(text),
                callback_id: None,
                data: None,
                reply_to: payload.reply_to,
                date: payload.date,
            })
        }
        UpdatePayload::Callback(payload) => Some(Message {
            update_id,
            kind: MessageKind::Callback,
            chat_id: payload.chat_id?,
            message_id: payload.origin_message_id,
            from_id: payload.from_id,
            from_name: payload.from_name,
            from_username: payload.from_username,
            chat_last_name: payload.chat_last_name,
            text: None,
            callback_id: Some(payload.callback_id),
            data: payload.data,
            reply_to: None,
            date: chrono::Utc::now(),
        }),
        UpdatePayload::Other => None,
    }
}

/// `book@my_bot rest` -> `book rest`
fn strip_bot_mention(command: &str) -> String {
    let (first, rest) = match command.find(char::is_whitespace) {
        Some(at) => command.split_at(at),
        None => (command, ""),
    };
    let first = first.split('@').next().unwrap_or(first);
    format!("{}{}", first, rest)
}

fn is_health_check(message: &Message) -> bool {
    message.kind != MessageKind::Callback
        && message
            .text
            .as_deref()
            .map(|t| HEALTH_CHECKS.contains(&t.trim().to_lowercase().as_str()))
            .unwrap_or(false)
}

/// Long-polls the update source and feeds the router queue
pub struct Poller {
    source: Arc<dyn UpdateSource>,
    transport: Arc<dyn Transport>,
    queue: UnboundedSender<Message>,
    stop: StopSignal,
    marker: String,
    retry_delay: Duration,
    offset: i64,
}

impl Poller {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        transport: Arc<dyn Transport>,
        queue: UnboundedSender<Message>,
        stop: StopSignal,
        marker: &str,
        retry_delay: Duration,
    ) -> Self {
        Self {
            source,
            transport,
            queue,
            stop,
            marker: marker.to_string(),
            retry_delay,
            offset: 0,
        }
    }

    /// Poll until stopped. `offset` only covers updates handed to the router.
    pub async fn run(mut self) {
        info!("Update poller started");

        while !self.stop.is_stopped() {
            let result = tokio::select! {
                result = self.source.get_updates(self.offset) => result,
                _ = self.stop.stopped() => break,
            };

            match result {
                Ok(updates) => {
                    if !self.forward(updates).await {
                        warn!("Router queue closed, stopping poller");
                        break;
                    }
                }
                Err(e) => {
                    warn!("Polling failed: {:#}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_delay) => {}
                        _ = self.stop.stopped() => break,
                    }
                }
            }
        }

        // Acknowledge what was already forwarded so it is not redelivered on restart
        if let Err(e) = self.source.acknowledge(self.offset).await {
            warn!("Final acknowledge at offset {} failed: {:#}", self.offset, e);
        }
        info!("Update poller stopped at offset {}", self.offset);
    }

    /// Returns false once the router side of the queue is gone
    async fn forward(&mut self, updates: Vec<UpdateEnvelope>) -> bool {
        for envelope in updates {
            // Unforwarded updates stay unacknowledged and come back on restart
            if self.stop.is_stopped() {
                break;
            }
            self.offset = self.offset.max(envelope.update_id + 1);
            let update_id = envelope.update_id;

            let Some(message) = classify(envelope, &self.marker) else {
                debug!(update_id, "Dropping unroutable update");
                continue;
            };

            if is_health_check(&message) {
                if let Err(e) = self
                    .transport
                    .send_message(message.chat_id, HEALTH_REPLY, None)
                    .await
                {
                    warn!("Health check reply failed: {:#}", e);
                }
                continue;
            }

            if self.queue.send(message).is_err() {
                return false;
            }
        }
        true
    }
}
