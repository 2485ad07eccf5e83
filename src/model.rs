use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Conversation-scoped variables of a running function
pub type Settings = serde_json::Map<String, Value>;

/// Messages kept per chat for routing decisions
const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: Option<String>,
    pub username: Option<String>,
    pub is_admin: bool,
}

impl User {
    pub fn new(id: i64, name: Option<String>, username: Option<String>) -> Self {
        Self {
            id,
            name,
            username,
            is_admin: false,
        }
    }

    /// Human readable description used in admin notifications
    pub fn describe(&self) -> String {
        let name = self.name.as_deref().unwrap_or("unknown");
        match &self.username {
            Some(username) => format!("{} (@{}, id {})", name, username, self.id),
            None => format!("{} (id {})", name, self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    #[default]
    Private,
    Group,
    Supergroup,
    Channel,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Private => "private",
            ChatKind::Group => "group",
            ChatKind::Supergroup => "supergroup",
            ChatKind::Channel => "channel",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "group" => ChatKind::Group,
            "supergroup" => ChatKind::Supergroup,
            "channel" => ChatKind::Channel,
            _ => ChatKind::Private,
        }
    }
}

impl std::fmt::Display for ChatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Command,
    Message,
    Callback,
}

/// A normalized platform update. `update_id` is `None` for events the
/// process generates itself (scheduled commands, admin notifications).
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub update_id: Option<i64>,
    pub kind: MessageKind,
    pub chat_id: i64,
    /// For callbacks this is the id of the message carrying the keyboard
    pub message_id: Option<i32>,
    pub from_id: i64,
    pub from_name: Option<String>,
    pub from_username: Option<String>,
    pub chat_last_name: Option<String>,
    pub text: Option<String>,
    pub callback_id: Option<String>,
    pub data: Option<String>,
    pub reply_to: Option<i32>,
    pub date: DateTime<Utc>,
}

impl Message {
    /// Text for messages and commands, payload for callbacks
    pub fn last_message(&self) -> Option<&str> {
        self.text.as_deref().or(self.data.as_deref())
    }

    /// A command issued on behalf of the chat owner
    pub fn synthetic_command(chat_id: i64, command: &str) -> Self {
        Self {
            update_id: None,
            kind: MessageKind::Command,
            chat_id,
            message_id: None,
            from_id: chat_id,
            from_name: None,
            from_username: None,
            chat_last_name: None,
            text: Some(command.to_string()),
            callback_id: None,
            data: None,
            reply_to: None,
            date: Utc::now(),
        }
    }
}

/// Persisted state of one in-progress multi-step conversation.
/// Belongs to the chat `chat_id`; the chat owns it by value.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningFunction {
    pub id: u32,
    pub chat_id: i64,
    pub name: String,
    pub state: u32,
    pub previous_state: u32,
    pub open_for_messages: bool,
    pub callback_message_id: Option<i32>,
    pub settings: Settings,
    pub update_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunningFunction {
    pub fn new(
        id: u32,
        chat_id: i64,
        name: &str,
        initial_state: u32,
        settings: Settings,
        update_id: Option<i64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            chat_id,
            name: name.to_string(),
            state: initial_state.max(1),
            previous_state: 0,
            open_for_messages: false,
            callback_message_id: None,
            settings,
            update_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn next(&mut self) {
        self.previous_state = self.state;
        self.state += 1;
    }

    /// Return to the previously recorded state
    pub fn back(&mut self) {
        let target = self.previous_state.max(1);
        self.previous_state = self.state;
        self.state = target;
    }

    pub fn same(&mut self) {
        self.previous_state = self.state;
    }

    pub fn goto(&mut self, state: u32) {
        self.previous_state = self.state;
        self.state = state.max(1);
    }

    /// True when the last transition moved forward into the current state
    pub fn is_next(&self) -> bool {
        self.state == self.previous_state + 1
    }

    /// False when the current state is being re-invoked after `same()`
    pub fn arrived_fresh(&self) -> bool {
        self.state != self.previous_state
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    pub kind: ChatKind,
    pub title: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(skip)]
    pub history: Vec<Message>,
    #[serde(skip)]
    pub running: Vec<RunningFunction>,
}

impl Chat {
    pub fn private(id: i64, first_name: Option<String>, last_name: Option<String>, username: Option<String>) -> Self {
        Self {
            id,
            kind: ChatKind::Private,
            first_name,
            last_name,
            username,
            ..Default::default()
        }
    }

    pub fn record(&mut self, message: Message) {
        self.history.push(message);
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }

    /// Smallest positive id not used by an open function in this chat
    pub fn next_function_id(&self) -> u32 {
        let mut id = 1;
        while self.running.iter().any(|f| f.id == id) {
            id += 1;
        }
        id
    }

    pub fn function(&self, id: u32) -> Option<&RunningFunction> {
        self.running.iter().find(|f| f.id == id)
    }

    pub fn open_function(&self) -> Option<&RunningFunction> {
        self.running
            .iter()
            .filter(|f| f.open_for_messages)
            .max_by_key(|f| f.updated_at)
    }

    pub fn function_by_callback(&self, message_id: i32) -> Option<&RunningFunction> {
        self.running
            .iter()
            .find(|f| f.callback_message_id == Some(message_id))
    }

    pub fn reset_open_functions(&mut self) {
        for function in &mut self.running {
            function.open_for_messages = false;
        }
    }

    /// Insert or replace a function, keeping at most one open for messages
    pub fn upsert_function(&mut self, function: RunningFunction) {
        if function.open_for_messages {
            self.reset_open_functions();
        }
        match self.running.iter_mut().find(|f| f.id == function.id) {
            Some(existing) => *existing = function,
            None => self.running.push(function),
        }
    }

    pub fn remove_function(&mut self, id: u32) -> Option<RunningFunction> {
        let index = self.running.iter().position(|f| f.id == id)?;
        Some(self.running.remove(index))
    }

    pub fn display_name(&self) -> String {
        if let Some(title) = &self.title {
            return title.clone();
        }
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{} {}", first, last),
            (Some(first), None) => first.clone(),
            _ => self
                .username
                .clone()
                .unwrap_or_else(|| self.id.to_string()),
        }
    }
}
