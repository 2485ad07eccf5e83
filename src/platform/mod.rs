pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Rows of inline buttons; each button's callback data is its label
pub type Keyboard = Vec<Vec<String>>;

/// One update as delivered by the platform, before classification
#[derive(Debug, Clone)]
pub struct UpdateEnvelope {
    pub update_id: i64,
    pub payload: UpdatePayload,
}

#[derive(Debug, Clone)]
pub enum UpdatePayload {
    Message(MessagePayload),
    Callback(CallbackPayload),
    /// Anything the engine does not route (edits, joins, polls...)
    Other,
}

#[derive(Debug, Clone)]
pub struct MessagePayload {
    pub chat_id: i64,
    pub message_id: i32,
    pub from_id: Option<i64>,
    pub from_name: Option<String>,
    pub from_username: Option<String>,
    pub chat_last_name: Option<String>,
    pub text: Option<String>,
    pub reply_to: Option<i32>,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CallbackPayload {
    pub callback_id: String,
    /// Message that carried the pressed keyboard
    pub origin_message_id: Option<i32>,
    pub chat_id: Option<i64>,
    pub from_id: i64,
    pub from_name: Option<String>,
    pub from_username: Option<String>,
    pub chat_last_name: Option<String>,
    pub data: Option<String>,
}

/// Long-poll endpoint. Updates below an acknowledged offset are never redelivered.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn get_updates(&self, offset: i64) -> Result<Vec<UpdateEnvelope>>;

    /// Confirm every update below `offset` without waiting for new ones
    async fn acknowledge(&self, offset: i64) -> Result<()> {
        self.get_updates(offset).await?;
        Ok(())
    }
}

/// Outbound calls to the messaging platform
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns the id of the (last) message sent
    async fn send_message(&self, chat_id: i64, text: &str, keyboard: Option<&Keyboard>)
        -> Result<i32>;

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i32,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<()>;

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()>;
}
