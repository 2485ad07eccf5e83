//! Resumable conversation units.
//!
//! A [`Function`] runs one state handler per invocation. Handlers never talk
//! to the platform directly: outbound messages are recorded as [`Effect`]s on
//! the [`Invocation`] and performed by the manager once the handler has
//! returned `Ok`. The handler works on a copy of its [`RunningFunction`], so
//! an error leaves the stored conversation exactly as it was.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::commands::CommandRegistry;
use crate::model::{Chat, Message, RunningFunction, Settings, User};
use crate::platform::Keyboard;
use crate::store::{PendingStatus, Store};

#[async_trait]
pub trait Function: Send + Sync {
    fn name(&self) -> &'static str;

    /// Settings keys this function reads or writes
    fn settings_keys(&self) -> &'static [&'static str] {
        &[]
    }

    /// Execute the handler for `inv.state()`
    async fn run(&self, inv: &mut Invocation<'_>) -> Result<()>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("function '{function}' wrote undeclared setting '{key}'")]
    Undeclared { function: String, key: String },
    #[error("function '{function}' does not accept setting '{key}'")]
    NotAccepted { function: String, key: String },
}

/// Every key in `settings` must be declared by `function`
pub fn check_declared(function: &dyn Function, settings: &Settings) -> Result<(), SettingsError> {
    let declared = function.settings_keys();
    match settings.keys().find(|k| !declared.contains(&k.as_str())) {
        Some(key) => Err(SettingsError::Undeclared {
            function: function.name().to_string(),
            key: key.clone(),
        }),
        None => Ok(()),
    }
}

/// Every carried key must be accepted by the chain target
pub fn check_accepted(target: &dyn Function, settings: &Settings) -> Result<(), SettingsError> {
    let declared = target.settings_keys();
    match settings.keys().find(|k| !declared.contains(&k.as_str())) {
        Some(key) => Err(SettingsError::NotAccepted {
            function: target.name().to_string(),
            key: key.clone(),
        }),
        None => Ok(()),
    }
}

/// Outbound side effect requested by a handler
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send {
        chat_id: i64,
        text: String,
        keyboard: Option<Keyboard>,
    },
    /// Edit the message carrying this function's keyboard
    Edit {
        text: String,
        keyboard: Option<Keyboard>,
    },
    /// Answer the callback that triggered this invocation
    Answer { text: String },
}

/// Request to replace the current function with another one
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    pub function: String,
    pub initial_state: u32,
    pub settings: Settings,
}

/// Read-only engine counters exposed to handlers
#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    pub users: usize,
    pub chats: usize,
    pub running_functions: usize,
    pub processed_events: u64,
    pub started_at: DateTime<Utc>,
}

/// What a handler can see besides its own state
#[derive(Clone, Copy)]
pub struct Env<'a> {
    pub message: &'a Message,
    pub user: &'a User,
    pub store: &'a dyn Store,
    pub registry: &'a CommandRegistry,
    pub stats: EngineStats,
}

/// Result of a successful handler run
#[derive(Debug)]
pub struct Outcome {
    pub function: RunningFunction,
    pub effects: Vec<Effect>,
    pub closed: bool,
    /// Close every other function in the chat as well
    pub reset_chat: bool,
    pub refresh_users: bool,
    pub chain: Option<Chain>,
}

pub struct Invocation<'a> {
    function: RunningFunction,
    env: Env<'a>,
    effects: Vec<Effect>,
    closed: bool,
    reset_chat: bool,
    refresh_users: bool,
    chain: Option<Chain>,
}

impl<'a> Invocation<'a> {
    pub fn new(function: RunningFunction, env: Env<'a>) -> Self {
        Self {
            function,
            env,
            effects: Vec::new(),
            closed: false,
            reset_chat: false,
            refresh_users: false,
            chain: None,
        }
    }

    pub fn state(&self) -> u32 {
        self.function.state
    }

    pub fn previous_state(&self) -> u32 {
        self.function.previous_state
    }

    pub fn is_next(&self) -> bool {
        self.function.is_next()
    }

    pub fn arrived_fresh(&self) -> bool {
        self.function.arrived_fresh()
    }

    pub fn chat_id(&self) -> i64 {
        self.function.chat_id
    }

    pub fn message(&self) -> &Message {
        self.env.message
    }

    /// Text of the triggering message, or the pressed button's data
    pub fn input(&self) -> Option<&str> {
        self.env.message.last_message()
    }

    pub fn user(&self) -> &User {
        self.env.user
    }

    pub fn store(&self) -> &dyn Store {
        self.env.store
    }

    pub fn registry(&self) -> &CommandRegistry {
        self.env.registry
    }

    pub fn stats(&self) -> EngineStats {
        self.env.stats
    }

    // -- settings --

    pub fn settings(&self) -> &Settings {
        &self.function.settings
    }

    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.function.settings.get(key)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .function
            .settings
            .get(key)
            .cloned()
            .with_context(|| format!("Missing setting '{}'", key))?;
        serde_json::from_value(value).with_context(|| format!("Invalid setting '{}'", key))
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("Failed to serialize setting '{}'", key))?;
        self.function.settings.insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.function.settings.remove(key)
    }

    // -- transitions --

    pub fn next(&mut self) {
        self.function.next();
    }

    pub fn back(&mut self) {
        self.function.back();
    }

    pub fn same(&mut self) {
        self.function.same();
    }

    pub fn goto(&mut self, state: u32) {
        self.function.goto(state);
    }

    /// Route the next free-text message in this chat to this function
    pub fn expect_reply(&mut self) {
        self.function.open_for_messages = true;
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Close this function and every other one running in the chat
    pub fn close_chat(&mut self) {
        self.closed = true;
        self.reset_chat = true;
    }

    /// Ask the manager to reload users and chats from the store
    pub fn refresh_users(&mut self) {
        self.refresh_users = true;
    }

    /// Close this function and start `function` at `initial_state`,
    /// carrying the listed settings keys that are present
    pub fn chain(&mut self, function: &str, initial_state: u32, keys: &[&str]) {
        let settings = keys
            .iter()
            .filter_map(|k| {
                self.function
                    .settings
                    .get(*k)
                    .map(|v| (k.to_string(), v.clone()))
            })
            .collect();
        self.chain_with(function, initial_state, settings);
    }

    pub fn chain_with(&mut self, function: &str, initial_state: u32, settings: Settings) {
        self.chain = Some(Chain {
            function: function.to_string(),
            initial_state,
            settings,
        });
        self.closed = true;
    }

    // -- outbound --

    pub fn send(&mut self, text: impl Into<String>) {
        let chat_id = self.function.chat_id;
        self.send_to(chat_id, text);
    }

    pub fn send_to(&mut self, chat_id: i64, text: impl Into<String>) {
        self.effects.push(Effect::Send {
            chat_id,
            text: text.into(),
            keyboard: None,
        });
    }

    /// Send an inline keyboard; its presses are routed back to this function
    pub fn send_keyboard(&mut self, text: impl Into<String>, keyboard: Keyboard) {
        self.effects.push(Effect::Send {
            chat_id: self.function.chat_id,
            text: text.into(),
            keyboard: Some(keyboard),
        });
    }

    pub fn edit(&mut self, text: impl Into<String>, keyboard: Option<Keyboard>) {
        self.effects.push(Effect::Edit {
            text: text.into(),
            keyboard,
        });
    }

    pub fn answer(&mut self, text: impl Into<String>) {
        self.effects.push(Effect::Answer { text: text.into() });
    }

    pub fn into_outcome(self) -> Outcome {
        Outcome {
            function: self.function,
            effects: self.effects,
            closed: self.closed,
            reset_chat: self.reset_chat,
            refresh_users: self.refresh_users,
            chain: self.chain,
        }
    }
}

/// Capability of approving or banning onboarding requests
#[async_trait]
pub trait Approvable: Send + Sync {
    async fn approve(&self, store: &dyn Store, user: &User, chat: &Chat, app: &str) -> Result<()>;
    async fn ban(&self, store: &dyn Store, user: &User, app: &str) -> Result<()>;
}

/// Registers approved users in the shared user and chat tables
pub struct RegistryApproval;

#[async_trait]
impl Approvable for RegistryApproval {
    async fn approve(&self, store: &dyn Store, user: &User, chat: &Chat, app: &str) -> Result<()> {
        store.approve_pending_user(user, chat, app).await
    }

    async fn ban(&self, store: &dyn Store, user: &User, app: &str) -> Result<()> {
        store
            .set_pending_status(user.id, app, PendingStatus::Banned)
            .await?;
        Ok(())
    }
}

/// What to do with free text nobody is waiting for
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackAction {
    Reply(String),
    Dispatch {
        alias: String,
        initial_state: u32,
        settings: Settings,
    },
    Ignore,
}

#[async_trait]
pub trait Fallback: Send + Sync {
    async fn on_message(&self, user: &User, message: &Message) -> Result<FallbackAction>;
}

pub struct NoCommandRunning;

#[async_trait]
impl Fallback for NoCommandRunning {
    async fn on_message(&self, _user: &User, _message: &Message) -> Result<FallbackAction> {
        Ok(FallbackAction::Reply("No command running".to_string()))
    }
}
