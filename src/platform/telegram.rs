use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    CallbackQueryId, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, UpdateKind,
};
use tracing::debug;

use crate::platform::{
    CallbackPayload, Keyboard, MessagePayload, Transport, UpdateEnvelope, UpdatePayload,
    UpdateSource,
};

/// Split long messages for Telegram's 4096 char limit
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

fn inline_keyboard(keyboard: &Keyboard) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(keyboard.iter().map(|row| {
        row.iter()
            .map(|label| InlineKeyboardButton::callback(label.clone(), label.clone()))
            .collect::<Vec<_>>()
    }))
}

/// Telegram Bot API access through teloxide, used both as the update
/// source for the poller and as the outbound transport.
#[derive(Clone)]
pub struct TelegramPlatform {
    bot: Bot,
    timeout_secs: u32,
}

impl TelegramPlatform {
    pub fn new(bot_token: &str, timeout_secs: u32) -> Self {
        Self {
            bot: Bot::new(bot_token),
            timeout_secs,
        }
    }
}

fn to_envelope(update: Update) -> UpdateEnvelope {
    let update_id = i64::from(update.id.0);
    let payload = match update.kind {
        UpdateKind::Message(msg) => {
            let from = msg.from.as_ref();
            UpdatePayload::Message(MessagePayload {
                chat_id: msg.chat.id.0,
                message_id: msg.id.0,
                from_id: from.map(|u| u.id.0 as i64),
                from_name: from.map(|u| u.first_name.clone()),
                from_username: from.and_then(|u| u.username.clone()),
                chat_last_name: msg.chat.last_name().map(str::to_string),
                text: msg.text().map(str::to_string),
                reply_to: msg.reply_to_message().map(|m| m.id.0),
                date: msg.date,
            })
        }
        UpdateKind::CallbackQuery(query) => {
            let origin = query.message.as_ref();
            UpdatePayload::Callback(CallbackPayload {
                callback_id: query.id.0.clone(),
                origin_message_id: origin.map(|m| m.id().0),
                chat_id: origin.map(|m| m.chat().id.0),
                from_id: query.from.id.0 as i64,
                from_name: Some(query.from.first_name.clone()),
                from_username: query.from.username.clone(),
                chat_last_name: origin.and_then(|m| m.chat().last_name().map(str::to_string)),
                data: query.data.clone(),
            })
        }
        _ => UpdatePayload::Other,
    };

    UpdateEnvelope { update_id, payload }
}

#[async_trait]
impl UpdateSource for TelegramPlatform {
    async fn get_updates(&self, offset: i64) -> Result<Vec<UpdateEnvelope>> {
        let updates = self
            .bot
            .get_updates()
            .offset(offset as i32)
            .timeout(self.timeout_secs)
            .await
            .context("Failed to fetch updates from Telegram")?;

        if !updates.is_empty() {
            debug!("Fetched {} update(s) at offset {}", updates.len(), offset);
        }

        Ok(updates.into_iter().map(to_envelope).collect())
    }

    async fn acknowledge(&self, offset: i64) -> Result<()> {
        self.bot
            .get_updates()
            .offset(offset as i32)
            .timeout(0)
            .limit(1)
            .await
            .context("Failed to acknowledge updates")?;
        Ok(())
    }
}

#[async_trait]
impl Transport for TelegramPlatform {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<i32> {
        let chunks = split_message(text, 4000);
        let last = chunks.len() - 1;
        let mut message_id = 0;

        for (index, chunk) in chunks.into_iter().enumerate() {
            let mut request = self.bot.send_message(ChatId(chat_id), chunk);
            // The keyboard goes on the final chunk so callbacks point at it
            if index == last {
                if let Some(keyboard) = keyboard {
                    request = request.reply_markup(inline_keyboard(keyboard));
                }
            }
            let sent = request
                .await
                .with_context(|| format!("Failed to send message to chat {}", chat_id))?;
            message_id = sent.id.0;
        }

        Ok(message_id)
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i32,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<()> {
        let mut request = self
            .bot
            .edit_message_text(ChatId(chat_id), MessageId(message_id), text);
        if let Some(keyboard) = keyboard {
            request = request.reply_markup(inline_keyboard(keyboard));
        }
        request.await.with_context(|| {
            format!("Failed to edit message {} in chat {}", message_id, chat_id)
        })?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()> {
        self.bot
            .answer_callback_query(CallbackQueryId(callback_id.to_string()))
            .text(text)
            .await
            .context("Failed to answer callback query")?;
        Ok(())
    }
}
