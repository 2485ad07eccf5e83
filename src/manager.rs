use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use crate::commands::{CommandRegistry, ResolveError};
use crate::config::{Config, ManagerConfig};
use crate::function::{
    check_accepted, check_declared, Effect, EngineStats, Env, Fallback, FallbackAction, Function,
    Invocation, NoCommandRunning, Outcome,
};
use crate::functions::{APPROVE_USER, EXPIRED_CALLBACK};
use crate::model::{Chat, Message, MessageKind, RunningFunction, Settings, User};
use crate::platform::Transport;
use crate::shutdown::StopSignal;
use crate::store::Store;

/// Upper bound on functions chained from a single event
const MAX_CHAIN_DEPTH: usize = 16;

/// A function ready to be invoked
struct Scheduled {
    function: Arc<dyn Function>,
    working: RunningFunction,
    is_new: bool,
}

/// A successful invocation waiting to be committed
struct Step {
    function: Arc<dyn Function>,
    is_new: bool,
    /// State the handler ran in
    state: u32,
    outcome: Outcome,
}

/// Session router: owns users, chats and their running functions, and
/// processes events one at a time.
pub struct Manager {
    config: ManagerConfig,
    admin_user_id: Option<i64>,
    stale_after: Duration,
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    registry: CommandRegistry,
    fallback: Arc<dyn Fallback>,
    stop: StopSignal,
    users: HashMap<i64, User>,
    chats: HashMap<i64, Chat>,
    /// Chats whose functions changed since the last save cycle
    dirty: HashSet<i64>,
    /// Closed functions whose rows could not be deleted yet
    pending_deletes: HashSet<(i64, u32)>,
    last_update_id: Option<i64>,
    processed_events: u64,
    started_at: DateTime<Utc>,
}

impl Manager {
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        registry: CommandRegistry,
        stop: StopSignal,
    ) -> Self {
        Self {
            config: config.manager.clone(),
            admin_user_id: config.telegram.admin_user_id,
            stale_after: config.storage.stale_after(),
            store,
            transport,
            registry,
            fallback: Arc::new(NoCommandRunning),
            stop,
            users: HashMap::new(),
            chats: HashMap::new(),
            dirty: HashSet::new(),
            pending_deletes: HashSet::new(),
            last_update_id: None,
            processed_events: 0,
            started_at: Utc::now(),
        }
    }

    /// Replace the handler for free text nobody is waiting for
    pub fn with_fallback(mut self, fallback: Arc<dyn Fallback>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn user(&self, id: i64) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn chat(&self, id: i64) -> Option<&Chat> {
        self.chats.get(&id)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            users: self.users.len(),
            chats: self.chats.len(),
            running_functions: self.chats.values().map(|c| c.running.len()).sum(),
            processed_events: self.processed_events,
            started_at: self.started_at,
        }
    }

    // -- startup --

    /// Startup recovery: drop stale conversations, seed the configured admin,
    /// then load users, chats and running functions.
    pub async fn start(&mut self) -> Result<()> {
        let removed = self
            .store
            .delete_stale_running_functions(self.stale_after)
            .await
            .context("Failed to delete stale running functions")?;
        if removed > 0 {
            info!("Discarded {} stale running function(s)", removed);
        }

        if let Some(admin_id) = self.admin_user_id {
            let mut admin = User::new(admin_id, None, None);
            admin.is_admin = true;
            self.store.insert_user(&admin).await?;
            self.store
                .insert_chat(&Chat::private(admin_id, None, None, None))
                .await?;
        }

        self.users = self
            .store
            .list_users()
            .await?
            .into_iter()
            .map(|u| (u.id, u))
            .collect();

        for mut chat in self.store.list_chats().await? {
            chat.running = self
                .store
                .list_running_functions(chat.id)
                .await
                .with_context(|| format!("Failed to load running functions of chat {}", chat.id))?;
            self.chats.insert(chat.id, chat);
        }

        let stats = self.stats();
        info!(
            "Manager started: {} user(s), {} chat(s), {} running function(s)",
            stats.users, stats.chats, stats.running_functions
        );
        Ok(())
    }

    /// Append users and chats the store knows about and we do not
    async fn refresh_users(&mut self) -> Result<()> {
        for user in self.store.list_users().await? {
            self.users.entry(user.id).or_insert(user);
        }
        for chat in self.store.list_chats().await? {
            if !self.chats.contains_key(&chat.id) {
                debug!(chat_id = chat.id, "Registered chat {}", chat.display_name());
                self.chats.insert(chat.id, chat);
            }
        }
        Ok(())
    }

    // -- router loop --

    /// Drain the event queue until the stop signal is set, then flush state
    pub async fn run(mut self, mut queue: UnboundedReceiver<Message>) {
        info!("Session router started");

        loop {
            let message = tokio::select! {
                biased;
                _ = self.stop.stopped() => break,
                message = queue.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.handle(message).await;
        }

        // Events the poller already handed over are still ours to process
        while let Ok(message) = queue.try_recv() {
            self.handle(message).await;
        }

        if !self.save().await {
            error!("Final save failed; some running functions were not persisted");
        }
        info!("Session router stopped after {} event(s)", self.processed_events);
    }

    /// Process one event, then persist the chats it touched
    pub async fn handle(&mut self, message: Message) {
        if let Some(update_id) = message.update_id {
            if self.last_update_id.is_some_and(|last| update_id <= last) {
                debug!(update_id, "Dropping already processed update");
                return;
            }
            self.last_update_id = Some(update_id);
        }
        self.processed_events += 1;

        let chat_id = message.chat_id;
        if let Err(e) = self.dispatch(message).await {
            error!(chat_id, "Failed to dispatch event: {:#}", e);
        }

        if !self.dirty.is_empty() || !self.pending_deletes.is_empty() {
            let dirty: Vec<i64> = self.dirty.drain().collect();
            if !self.save_chats(&dirty).await {
                self.dirty.extend(dirty);
            }
        }
    }

    async fn dispatch(&mut self, message: Message) -> Result<()> {
        let text = message.last_message().unwrap_or_default().trim().to_string();
        let alias = alias_of(&text).to_string();

        if message.kind == MessageKind::Command
            && text.eq_ignore_ascii_case(&self.config.shutdown_keyword)
        {
            return self.shutdown_requested(&message).await;
        }

        let user = self.users.get(&message.from_id).cloned();

        if message.kind == MessageKind::Command
            && alias.eq_ignore_ascii_case(&self.config.onboarding_keyword)
        {
            return match user {
                Some(_) => {
                    debug!(user_id = message.from_id, "Known user sent onboarding command");
                    Ok(())
                }
                None => self.onboard(&message).await,
            };
        }

        let Some(user) = user else {
            debug!(user_id = message.from_id, "Ignoring event from unknown user");
            return Ok(());
        };

        let Some(chat) = self.chats.get_mut(&message.chat_id) else {
            error!(chat_id = message.chat_id, "Chat not registered, dropping event");
            return Ok(());
        };
        chat.record(message.clone());

        match message.kind {
            MessageKind::Command => self.start_command(&alias, &message, &user).await,
            MessageKind::Message => {
                let open = chat.open_function().map(|f| f.id);
                if let Some(id) = open {
                    self.resume(message.chat_id, id, &message, &user).await
                } else if self.registry.contains_alias(&text) {
                    self.start_command(&text, &message, &user).await
                } else {
                    self.fall_back(&message, &user).await
                }
            }
            MessageKind::Callback => {
                let target = message
                    .message_id
                    .and_then(|id| chat.function_by_callback(id))
                    .map(|f| f.id);
                match target {
                    Some(id) => self.resume(message.chat_id, id, &message, &user).await,
                    None => self.expired_callback(&message, &user).await,
                }
            }
        }
    }

    // -- dispatch branches --

    async fn start_command(&mut self, alias: &str, message: &Message, user: &User) -> Result<()> {
        self.start_alias(alias, 1, Settings::new(), message, user).await
    }

    async fn start_alias(
        &mut self,
        alias: &str,
        initial_state: u32,
        settings: Settings,
        message: &Message,
        user: &User,
    ) -> Result<()> {
        let function = match self.registry.resolve(alias, user) {
            Ok(command) => command.function.clone(),
            Err(e) => {
                warn!(chat_id = message.chat_id, alias, "Cannot start command: {}", e);
                self.notify(message.chat_id, &e.to_string()).await;
                return Ok(());
            }
        };
        let working = self.instantiate(function.name(), message.chat_id, initial_state, settings, message)?;
        self.execute(function, working, message, user).await;
        Ok(())
    }

    async fn resume(&mut self, chat_id: i64, id: u32, message: &Message, user: &User) -> Result<()> {
        let working = self
            .chats
            .get(&chat_id)
            .and_then(|c| c.function(id))
            .cloned()
            .with_context(|| format!("Function {} not found in chat {}", id, chat_id))?;

        let (function, allowed) = match self.registry.by_name(&working.name) {
            Some(command) => (command.function.clone(), command.allows(user)),
            None => {
                warn!(chat_id, function = %working.name, "Dropping function with no registered implementation");
                self.close_function(chat_id, id).await;
                self.notify(chat_id, &ResolveError::NotFound.to_string()).await;
                return Ok(());
            }
        };
        if !allowed {
            self.notify(chat_id, &ResolveError::Forbidden.to_string()).await;
            return Ok(());
        }

        debug!(chat_id, function = %working.name, state = working.state, "Resuming function");
        self.execute_scheduled(
            Scheduled {
                function,
                working,
                is_new: false,
            },
            message,
            user,
        )
        .await;
        Ok(())
    }

    async fn expired_callback(&mut self, message: &Message, user: &User) -> Result<()> {
        let Some(command) = self.registry.by_name(EXPIRED_CALLBACK) else {
            if let Some(callback_id) = &message.callback_id {
                if let Err(e) = self
                    .transport
                    .answer_callback(callback_id, "Function has expired")
                    .await
                {
                    warn!("Failed to answer expired callback: {:#}", e);
                }
            }
            return Ok(());
        };
        let function = command.function.clone();
        let working = self.instantiate(EXPIRED_CALLBACK, message.chat_id, 1, Settings::new(), message)?;
        self.execute(function, working, message, user).await;
        Ok(())
    }

    async fn fall_back(&mut self, message: &Message, user: &User) -> Result<()> {
        match self.fallback.on_message(user, message).await? {
            FallbackAction::Reply(text) => {
                self.notify(message.chat_id, &text).await;
                Ok(())
            }
            FallbackAction::Dispatch {
                alias,
                initial_state,
                settings,
            } => {
                self.start_alias(&alias, initial_state, settings, message, user)
                    .await
            }
            FallbackAction::Ignore => Ok(()),
        }
    }

    /// Onboarding runs in a transient chat: the user is not registered until
    /// an admin approves the request.
    async fn onboard(&mut self, message: &Message) -> Result<()> {
        if message.chat_id != message.from_id {
            debug!(chat_id = message.chat_id, "Onboarding is only available in private chats");
            return Ok(());
        }

        let user = User::new(
            message.from_id,
            message.from_name.clone(),
            message.from_username.clone(),
        );
        let chat = Chat::private(
            message.chat_id,
            message.from_name.clone(),
            message.chat_last_name.clone(),
            message.from_username.clone(),
        );

        let function = match self.registry.resolve(&self.config.onboarding_keyword, &user) {
            Ok(command) => command.function.clone(),
            Err(e) => {
                warn!("Onboarding command unavailable: {}", e);
                return Ok(());
            }
        };

        let mut settings = Settings::new();
        settings.insert("app".to_string(), Value::String(self.config.app_name.clone()));
        let working = RunningFunction::new(1, chat.id, function.name(), 1, settings, message.update_id);

        let outcome = match self.invoke(function.as_ref(), working, message, &user).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.report_failure(function.name(), chat.id, 1, e).await;
                return Ok(());
            }
        };

        let mut working = outcome.function;
        for effect in outcome.effects {
            self.perform(effect, &mut working, message).await;
        }

        let first_send = working
            .settings
            .get("first_send")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if first_send {
            info!(user_id = user.id, "New onboarding request, notifying admin");
            self.request_approval(&user, &chat).await?;
        }
        Ok(())
    }

    /// Secondary invocation of the approval function in the admin chat
    async fn request_approval(&mut self, new_user: &User, new_chat: &Chat) -> Result<()> {
        let admin = self
            .admin_user_id
            .and_then(|id| self.users.get(&id))
            .or_else(|| {
                let mut admins: Vec<&User> = self.users.values().filter(|u| u.is_admin).collect();
                admins.sort_by_key(|u| u.id);
                admins.into_iter().next()
            })
            .cloned();
        let Some(admin) = admin else {
            warn!("No admin configured; onboarding request left pending");
            return Ok(());
        };
        if !self.chats.contains_key(&admin.id) {
            error!(chat_id = admin.id, "Admin chat not registered");
            return Ok(());
        }
        let Some(command) = self.registry.by_name(APPROVE_USER) else {
            warn!("No approval function registered; onboarding request left pending");
            return Ok(());
        };
        let function = command.function.clone();

        let mut settings = Settings::new();
        settings.insert("new_user".to_string(), serde_json::to_value(new_user)?);
        settings.insert("new_chat".to_string(), serde_json::to_value(new_chat)?);
        settings.insert("app".to_string(), Value::String(self.config.app_name.clone()));

        let message = Message::synthetic_command(admin.id, APPROVE_USER);
        let working = self.instantiate(APPROVE_USER, admin.id, 1, settings, &message)?;
        self.execute(function, working, &message, &admin).await;
        Ok(())
    }

    async fn shutdown_requested(&mut self, message: &Message) -> Result<()> {
        let Some(user) = self.users.get(&message.from_id) else {
            debug!(user_id = message.from_id, "Ignoring shutdown from unknown user");
            return Ok(());
        };
        if self.config.shutdown_requires_admin && !user.is_admin {
            warn!(user_id = user.id, "Non-admin user requested shutdown");
            self.notify(message.chat_id, &ResolveError::Forbidden.to_string())
                .await;
            return Ok(());
        }

        info!(user_id = user.id, "Shutdown requested");
        if self.save().await {
            self.stop.stop();
        } else {
            error!("Shutdown refused: running functions could not be saved");
            self.notify(
                message.chat_id,
                "Could not save running functions, shutdown refused. Please retry.",
            )
            .await;
        }
        Ok(())
    }

    // -- function lifecycle --

    fn instantiate(
        &self,
        name: &str,
        chat_id: i64,
        initial_state: u32,
        settings: Settings,
        message: &Message,
    ) -> Result<RunningFunction> {
        let chat = self
            .chats
            .get(&chat_id)
            .with_context(|| format!("Chat {} not registered", chat_id))?;
        Ok(RunningFunction::new(
            chat.next_function_id(),
            chat_id,
            name,
            initial_state,
            settings,
            message.update_id,
        ))
    }

    async fn execute(
        &mut self,
        function: Arc<dyn Function>,
        working: RunningFunction,
        message: &Message,
        user: &User,
    ) {
        self.execute_scheduled(
            Scheduled {
                function,
                working,
                is_new: true,
            },
            message,
            user,
        )
        .await
    }

    /// Run a function and every function it chains to. The whole chain is
    /// invoked before anything is committed, so a failing link leaves the
    /// chat exactly as it was.
    async fn execute_scheduled(&mut self, first: Scheduled, message: &Message, user: &User) {
        let chat_id = first.working.chat_id;
        let mut steps: Vec<Step> = Vec::new();
        let mut released: Vec<u32> = Vec::new();
        let mut next = Some(first);

        while let Some(Scheduled {
            function,
            working,
            is_new,
        }) = next.take()
        {
            let id = working.id;
            let state = working.state;
            if steps.len() == MAX_CHAIN_DEPTH {
                let e = anyhow::anyhow!("chain limit of {} reached", MAX_CHAIN_DEPTH);
                self.report_failure(function.name(), chat_id, state, e).await;
                return;
            }

            let outcome = match self.invoke(function.as_ref(), working, message, user).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.report_failure(function.name(), chat_id, state, e).await;
                    return;
                }
            };

            if let Some(chain) = &outcome.chain {
                let Some(target) = self.registry.by_name(&chain.function) else {
                    error!(chat_id, "Chain target '{}' vanished", chain.function);
                    return;
                };
                released.push(id);
                debug!(chat_id, from = function.name(), to = %chain.function, "Chaining function");
                next = Some(Scheduled {
                    function: target.function.clone(),
                    working: RunningFunction::new(
                        self.free_function_id(chat_id, &released),
                        chat_id,
                        &chain.function,
                        chain.initial_state,
                        chain.settings.clone(),
                        message.update_id,
                    ),
                    is_new: true,
                });
            }

            steps.push(Step {
                function,
                is_new,
                state,
                outcome,
            });
        }

        for step in steps {
            self.commit(step, message).await;
        }
    }

    /// Smallest id not held by a function that survives the current chain
    fn free_function_id(&self, chat_id: i64, released: &[u32]) -> u32 {
        let Some(chat) = self.chats.get(&chat_id) else {
            return 1;
        };
        let mut id = 1;
        while chat
            .running
            .iter()
            .any(|f| f.id == id && !released.contains(&id))
        {
            id += 1;
        }
        id
    }

    /// Handler plus validation. Nothing here mutates engine state.
    async fn invoke(
        &self,
        function: &dyn Function,
        working: RunningFunction,
        message: &Message,
        user: &User,
    ) -> Result<Outcome> {
        let env = Env {
            message,
            user,
            store: self.store.as_ref(),
            registry: &self.registry,
            stats: self.stats(),
        };
        let mut inv = Invocation::new(working, env);
        function.run(&mut inv).await?;
        let outcome = inv.into_outcome();

        check_declared(function, &outcome.function.settings)?;
        if let Some(chain) = &outcome.chain {
            let target = self
                .registry
                .by_name(&chain.function)
                .with_context(|| format!("Chain target '{}' is not registered", chain.function))?;
            check_accepted(target.function.as_ref(), &chain.settings)?;
        }
        Ok(outcome)
    }

    /// Perform the effects of a successful invocation and apply its transition
    async fn commit(&mut self, step: Step, message: &Message) {
        let Step {
            function,
            is_new,
            state,
            outcome,
        } = step;
        let mut working = outcome.function;
        let chat_id = working.chat_id;
        let id = working.id;

        for effect in outcome.effects {
            self.perform(effect, &mut working, message).await;
        }
        working.updated_at = Utc::now();

        if is_new {
            if let Some(chat) = self.chats.get_mut(&chat_id) {
                chat.reset_open_functions();
            }
        }

        if outcome.reset_chat {
            let ids: Vec<u32> = self
                .chats
                .get(&chat_id)
                .map(|c| c.running.iter().map(|f| f.id).collect())
                .unwrap_or_default();
            for other in ids {
                self.close_function(chat_id, other).await;
            }
        }

        if outcome.closed {
            debug!(chat_id, function = function.name(), state, "Function closed");
            self.close_function(chat_id, id).await;
        } else if let Some(chat) = self.chats.get_mut(&chat_id) {
            debug!(
                chat_id,
                function = function.name(),
                from = state,
                to = working.state,
                "Function advanced"
            );
            chat.upsert_function(working);
        }
        self.dirty.insert(chat_id);

        if outcome.refresh_users {
            if let Err(e) = self.refresh_users().await {
                error!("Failed to refresh users: {:#}", e);
            }
        }
    }

    async fn perform(&self, effect: Effect, working: &mut RunningFunction, message: &Message) {
        match effect {
            Effect::Send {
                chat_id,
                text,
                keyboard,
            } => match self
                .transport
                .send_message(chat_id, &text, keyboard.as_ref())
                .await
            {
                Ok(message_id) => {
                    if keyboard.is_some() && chat_id == working.chat_id {
                        working.callback_message_id = Some(message_id);
                        working.open_for_messages = false;
                    }
                }
                Err(e) => warn!(chat_id, "Send failed: {:#}", e),
            },
            Effect::Edit { text, keyboard } => {
                let target = working.callback_message_id.or(match message.kind {
                    MessageKind::Callback => message.message_id,
                    _ => None,
                });
                let Some(message_id) = target else {
                    warn!(chat_id = working.chat_id, "Nothing to edit for '{}'", working.name);
                    return;
                };
                if let Err(e) = self
                    .transport
                    .edit_message(working.chat_id, message_id, &text, keyboard.as_ref())
                    .await
                {
                    warn!(chat_id = working.chat_id, "Edit failed: {:#}", e);
                }
            }
            Effect::Answer { text } => {
                let Some(callback_id) = &message.callback_id else {
                    debug!("No callback to answer");
                    return;
                };
                if let Err(e) = self.transport.answer_callback(callback_id, &text).await {
                    warn!("Answer failed: {:#}", e);
                }
            }
        }
    }

    async fn close_function(&mut self, chat_id: i64, id: u32) {
        let removed = self
            .chats
            .get_mut(&chat_id)
            .and_then(|c| c.remove_function(id));
        if removed.is_none() {
            return;
        }
        if let Err(e) = self.store.delete_running_function(chat_id, id).await {
            error!(chat_id, id, "Failed to delete running function, will retry: {:#}", e);
            self.pending_deletes.insert((chat_id, id));
        }
    }

    async fn report_failure(&self, function: &str, chat_id: i64, state: u32, e: anyhow::Error) {
        error!(chat_id, function, state, "Handler failed: {:#}", e);
        if let Some(notice) = self.config.failure_notice.as_deref().filter(|n| !n.is_empty()) {
            self.notify(chat_id, notice).await;
        }
    }

    async fn notify(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.transport.send_message(chat_id, text, None).await {
            warn!(chat_id, "Failed to send notice: {:#}", e);
        }
    }

    // -- persistence --

    /// Persist every running function of the given chats. The set of stored
    /// keys is fetched once per cycle to choose between insert and update.
    async fn save_chats(&mut self, chat_ids: &[i64]) -> bool {
        let mut ok = self.retry_deletes().await;

        let known = match self.store.running_function_keys().await {
            Ok(known) => known,
            Err(e) => {
                error!("Failed to list stored running functions: {:#}", e);
                return false;
            }
        };

        for chat in chat_ids.iter().filter_map(|id| self.chats.get(id)) {
            for function in &chat.running {
                let result = if known.contains(&(chat.id, function.id)) {
                    self.store.update_running_function(function).await
                } else {
                    self.store.insert_running_function(function).await
                };
                if let Err(e) = result {
                    error!(chat_id = chat.id, id = function.id, "Failed to save running function: {:#}", e);
                    ok = false;
                }
            }
        }
        ok
    }

    /// Retry deletes that failed earlier. A key reused by a live function
    /// is simply taken over by the next update of that function.
    async fn retry_deletes(&mut self) -> bool {
        let pending: Vec<(i64, u32)> = self.pending_deletes.iter().copied().collect();
        for (chat_id, id) in pending {
            let reused = self
                .chats
                .get(&chat_id)
                .is_some_and(|c| c.function(id).is_some());
            if reused {
                self.pending_deletes.remove(&(chat_id, id));
                continue;
            }
            match self.store.delete_running_function(chat_id, id).await {
                Ok(_) => {
                    self.pending_deletes.remove(&(chat_id, id));
                }
                Err(e) => warn!(chat_id, id, "Delete still failing: {:#}", e),
            }
        }
        self.pending_deletes.is_empty()
    }

    /// Persist all running functions and retry pending deletes.
    /// Returns false if any write failed.
    pub async fn save(&mut self) -> bool {
        let chat_ids: Vec<i64> = self.chats.keys().copied().collect();
        self.save_chats(&chat_ids).await
    }
}

/// First word of a command; the rest are arguments for the handler
fn alias_of(text: &str) -> &str {
    text.split_whitespace().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use crate::function::{Function, RegistryApproval};
    use crate::functions::builtin_commands;
    use crate::platform::Keyboard;
    use crate::store::{PendingStatus, PendingUser, SqliteStore};
    use anyhow::bail;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
    use std::sync::Mutex;

    const ADMIN: i64 = 1;
    const ALICE: i64 = 2;
    const BOB: i64 = 3;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Send {
            chat_id: i64,
            text: String,
            keyboard: bool,
        },
        Edit {
            message_id: i32,
            text: String,
        },
        Answer {
            text: String,
        },
    }

    struct RecordingTransport {
        calls: Mutex<Vec<Call>>,
        next_id: AtomicI32,
        fail_sends: bool,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                next_id: AtomicI32::new(100),
                fail_sends: false,
            }
        }

        fn take(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }

        fn texts(&self) -> Vec<String> {
            self.take()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Send { text, .. } => Some(text),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_message(&self, chat_id: i64, text: &str, keyboard: Option<&Keyboard>) -> Result<i32> {
            if self.fail_sends {
                bail!("transport offline");
            }
            self.calls.lock().unwrap().push(Call::Send {
                chat_id,
                text: text.to_string(),
                keyboard: keyboard.is_some(),
            });
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        async fn edit_message(&self, _chat_id: i64, message_id: i32, text: &str, _keyboard: Option<&Keyboard>) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Edit {
                message_id,
                text: text.to_string(),
            });
            Ok(())
        }

        async fn answer_callback(&self, _callback_id: &str, text: &str) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Answer {
                text: text.to_string(),
            });
            Ok(())
        }
    }

    /// Pick a book from a keyboard, then leave a note about it
    struct Book;

    #[async_trait]
    impl Function for Book {
        fn name(&self) -> &'static str {
            "book"
        }

        fn settings_keys(&self) -> &'static [&'static str] {
            &["book"]
        }

        async fn run(&self, inv: &mut Invocation<'_>) -> Result<()> {
            match inv.state() {
                1 => {
                    inv.send_keyboard(
                        "Available books:\nDune\nEmma",
                        vec![vec!["Dune".to_string(), "Emma".to_string()]],
                    );
                    inv.next();
                }
                2 => {
                    let book = inv.input().unwrap_or_default().to_string();
                    inv.answer("Noted");
                    inv.send(format!("You picked {}. Any notes?", book));
                    inv.set("book", book)?;
                    inv.expect_reply();
                    inv.next();
                }
                _ => {
                    let book: String = inv.get("book")?;
                    inv.send(format!("Saved note for {}: {}", book, inv.input().unwrap_or_default()));
                    inv.close();
                }
            }
            Ok(())
        }
    }

    /// Waits for one reply
    struct Ask;

    #[async_trait]
    impl Function for Ask {
        fn name(&self) -> &'static str {
            "ask"
        }

        async fn run(&self, inv: &mut Invocation<'_>) -> Result<()> {
            if inv.state() == 1 {
                inv.send("What is it?");
                inv.expect_reply();
                inv.next();
            } else {
                inv.send("Thanks");
                inv.close();
            }
            Ok(())
        }
    }

    /// Fails on the "boom" button
    struct Flaky;

    #[async_trait]
    impl Function for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn run(&self, inv: &mut Invocation<'_>) -> Result<()> {
            if inv.state() == 1 {
                inv.send_keyboard("Pick", vec![vec!["boom".to_string(), "ok".to_string()]]);
                inv.next();
                return Ok(());
            }
            inv.send("partial");
            inv.next();
            if inv.input() == Some("boom") {
                bail!("exploded");
            }
            inv.close();
            Ok(())
        }
    }

    struct Recommend;

    #[async_trait]
    impl Function for Recommend {
        fn name(&self) -> &'static str {
            "recommend"
        }

        fn settings_keys(&self) -> &'static [&'static str] {
            &["book", "scratch"]
        }

        async fn run(&self, inv: &mut Invocation<'_>) -> Result<()> {
            inv.set("book", "Dune")?;
            inv.set("scratch", true)?;
            inv.chain("notes", 2, &["book"]);
            Ok(())
        }
    }

    struct Notes;

    #[async_trait]
    impl Function for Notes {
        fn name(&self) -> &'static str {
            "notes"
        }

        fn settings_keys(&self) -> &'static [&'static str] {
            &["book"]
        }

        async fn run(&self, inv: &mut Invocation<'_>) -> Result<()> {
            let book: String = inv.get("book")?;
            inv.send(format!("Notes for {} (state {})", book, inv.state()));
            inv.expect_reply();
            Ok(())
        }
    }

    struct Sloppy;

    #[async_trait]
    impl Function for Sloppy {
        fn name(&self) -> &'static str {
            "sloppy"
        }

        async fn run(&self, inv: &mut Invocation<'_>) -> Result<()> {
            inv.set("undeclared", 1)?;
            inv.send("never delivered");
            Ok(())
        }
    }

    struct Purge;

    #[async_trait]
    impl Function for Purge {
        fn name(&self) -> &'static str {
            "purge"
        }

        async fn run(&self, inv: &mut Invocation<'_>) -> Result<()> {
            inv.send("purged");
            inv.close();
            Ok(())
        }
    }

    /// Asks for a colour, then hands it to `explode`
    struct Pick;

    #[async_trait]
    impl Function for Pick {
        fn name(&self) -> &'static str {
            "pick"
        }

        fn settings_keys(&self) -> &'static [&'static str] {
            &["choice"]
        }

        async fn run(&self, inv: &mut Invocation<'_>) -> Result<()> {
            if inv.state() == 1 {
                inv.send("Pick a colour");
                inv.expect_reply();
                inv.next();
                return Ok(());
            }
            let choice = inv.input().unwrap_or_default().to_string();
            inv.send("handing over");
            inv.set("choice", choice)?;
            inv.chain("explode", 1, &["choice"]);
            Ok(())
        }
    }

    struct Explode;

    #[async_trait]
    impl Function for Explode {
        fn name(&self) -> &'static str {
            "explode"
        }

        fn settings_keys(&self) -> &'static [&'static str] {
            &["choice"]
        }

        async fn run(&self, _inv: &mut Invocation<'_>) -> Result<()> {
            bail!("chain target failed");
        }
    }

    fn registry() -> CommandRegistry {
        let mut commands = builtin_commands("start", "/", Arc::new(RegistryApproval));
        commands.extend([
            Command::new(&["book"], Book),
            Command::new(&["ask"], Ask),
            Command::new(&["flaky"], Flaky),
            Command::new(&["recommend"], Recommend),
            Command::internal(Notes),
            Command::new(&["sloppy"], Sloppy),
            Command::new(&["purge"], Purge).admin(),
            Command::new(&["pick"], Pick),
            Command::internal(Explode),
        ]);
        CommandRegistry::new(commands)
    }

    fn config() -> Config {
        Config::parse("[telegram]\nbot_token = \"token\"\nadmin_user_id = 1\n").unwrap()
    }

    async fn seeded_store() -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .insert_user(&User::new(ALICE, Some("Alice".to_string()), None))
            .await
            .unwrap();
        store
            .insert_chat(&Chat::private(ALICE, Some("Alice".to_string()), None, None))
            .await
            .unwrap();
        store
    }

    async fn manager_on(store: Arc<SqliteStore>) -> (Manager, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        let mut manager = Manager::new(
            &config(),
            store,
            transport.clone(),
            registry(),
            StopSignal::new(),
        );
        manager.start().await.unwrap();
        (manager, transport)
    }

    fn event(update_id: i64, kind: MessageKind, chat_id: i64, from_id: i64, text: &str) -> Message {
        Message {
            update_id: Some(update_id),
            kind,
            chat_id,
            message_id: Some(update_id as i32),
            from_id,
            from_name: Some("Someone".to_string()),
            from_username: None,
            chat_last_name: None,
            text: Some(text.to_string()),
            callback_id: None,
            data: None,
            reply_to: None,
            date: Utc::now(),
        }
    }

    fn command(update_id: i64, chat_id: i64, text: &str) -> Message {
        event(update_id, MessageKind::Command, chat_id, chat_id, text)
    }

    fn reply(update_id: i64, chat_id: i64, text: &str) -> Message {
        event(update_id, MessageKind::Message, chat_id, chat_id, text)
    }

    fn press(update_id: i64, chat_id: i64, origin: i32, data: &str) -> Message {
        Message {
            message_id: Some(origin),
            text: None,
            callback_id: Some(format!("cb{}", update_id)),
            data: Some(data.to_string()),
            ..event(update_id, MessageKind::Callback, chat_id, chat_id, "")
        }
    }

    #[tokio::test]
    async fn test_command_starts_function_and_persists_it() {
        let store = seeded_store().await;
        let (mut manager, transport) = manager_on(store.clone()).await;

        manager.handle(command(1, ALICE, "book")).await;

        assert_eq!(
            transport.take(),
            vec![Call::Send {
                chat_id: ALICE,
                text: "Available books:\nDune\nEmma".to_string(),
                keyboard: true,
            }]
        );
        let chat = manager.chat(ALICE).unwrap();
        assert_eq!(chat.running.len(), 1);
        let function = &chat.running[0];
        assert_eq!((function.id, function.name.as_str()), (1, "book"));
        assert_eq!(function.callback_message_id, Some(100));
        assert!(!function.open_for_messages);

        let stored = store.list_running_functions(ALICE).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, 2);
    }

    #[tokio::test]
    async fn test_callback_resumes_at_persisted_state() {
        let store = seeded_store().await;
        let (mut manager, transport) = manager_on(store.clone()).await;
        manager.handle(command(1, ALICE, "book")).await;
        transport.take();

        manager.handle(press(2, ALICE, 100, "Dune")).await;
        assert_eq!(
            transport.take(),
            vec![
                Call::Answer {
                    text: "Noted".to_string()
                },
                Call::Send {
                    chat_id: ALICE,
                    text: "You picked Dune. Any notes?".to_string(),
                    keyboard: false,
                },
            ]
        );
        let function = &manager.chat(ALICE).unwrap().running[0];
        assert_eq!(function.state, 3);
        assert!(function.open_for_messages);

        manager.handle(reply(3, ALICE, "great read")).await;
        assert_eq!(transport.texts(), vec!["Saved note for Dune: great read"]);
        assert!(manager.chat(ALICE).unwrap().running.is_empty());
        assert!(store.list_running_functions(ALICE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_after_restart_is_deterministic() {
        let store = seeded_store().await;
        {
            let (mut manager, _) = manager_on(store.clone()).await;
            manager.handle(command(1, ALICE, "book")).await;
            manager.handle(press(2, ALICE, 100, "Emma")).await;
        }

        let (mut restarted, transport) = manager_on(store.clone()).await;
        let function = &restarted.chat(ALICE).unwrap().running[0];
        assert_eq!(function.state, 3);
        assert_eq!(function.settings.get("book"), Some(&Value::from("Emma")));

        restarted.handle(reply(3, ALICE, "classic")).await;
        assert_eq!(transport.texts(), vec!["Saved note for Emma: classic"]);
    }

    #[tokio::test]
    async fn test_unknown_user_gets_nothing() {
        let store = seeded_store().await;
        let (mut manager, transport) = manager_on(store.clone()).await;

        manager.handle(command(1, BOB, "book")).await;
        manager.handle(reply(2, BOB, "hello")).await;

        assert!(transport.take().is_empty());
        assert!(manager.chat(BOB).is_none());
        assert!(store.running_function_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admin_command_forbidden_once() {
        let store = seeded_store().await;
        let (mut manager, transport) = manager_on(store.clone()).await;

        manager.handle(command(1, ALICE, "purge")).await;
        assert_eq!(
            transport.texts(),
            vec![ResolveError::Forbidden.to_string()]
        );
        assert!(manager.chat(ALICE).unwrap().running.is_empty());

        manager.handle(command(2, ADMIN, "purge")).await;
        assert_eq!(transport.texts(), vec!["purged"]);
    }

    #[tokio::test]
    async fn test_routing_notices() {
        let store = seeded_store().await;
        let (mut manager, transport) = manager_on(store).await;

        manager.handle(command(1, ALICE, "missing")).await;
        manager.handle(reply(2, ALICE, "just chatting")).await;
        assert_eq!(
            transport.texts(),
            vec!["Function not implemented", "No command running"]
        );

        // Free text matching an alias starts the command
        manager.handle(reply(3, ALICE, "ask")).await;
        assert_eq!(transport.texts(), vec!["What is it?"]);
    }

    #[tokio::test]
    async fn test_free_text_must_match_whole_alias() {
        let store = seeded_store().await;
        let (mut manager, transport) = manager_on(store).await;

        manager.handle(reply(1, ALICE, "ask me later")).await;
        assert_eq!(transport.texts(), vec!["No command running"]);
        assert!(manager.chat(ALICE).unwrap().running.is_empty());

        manager.handle(reply(2, ALICE, "  ASK ")).await;
        assert_eq!(transport.texts(), vec!["What is it?"]);
    }

    #[tokio::test]
    async fn test_single_open_function_and_id_reuse() {
        let store = seeded_store().await;
        let (mut manager, transport) = manager_on(store).await;

        manager.handle(command(1, ALICE, "book")).await; // id 1, keyboard 100
        manager.handle(command(2, ALICE, "ask")).await; // id 2, open
        manager.handle(command(3, ALICE, "book")).await; // id 3, keyboard 102
        transport.take();

        let chat = manager.chat(ALICE).unwrap();
        assert_eq!(chat.running.iter().filter(|f| f.open_for_messages).count(), 0);

        manager.handle(press(4, ALICE, 100, "Dune")).await;
        let chat = manager.chat(ALICE).unwrap();
        let open: Vec<u32> = chat
            .running
            .iter()
            .filter(|f| f.open_for_messages)
            .map(|f| f.id)
            .collect();
        assert_eq!(open, vec![1]);

        manager.handle(reply(5, ALICE, "loved it")).await;
        assert!(manager.chat(ALICE).unwrap().function(1).is_none());

        manager.handle(command(6, ALICE, "ask")).await;
        let chat = manager.chat(ALICE).unwrap();
        assert_eq!(chat.function(1).map(|f| f.name.as_str()), Some("ask"));
        assert_eq!(chat.running.len(), 3);
    }

    #[tokio::test]
    async fn test_stale_function_falls_back() {
        let store = seeded_store().await;
        let mut old = RunningFunction::new(1, ALICE, "ask", 2, Settings::new(), Some(1));
        old.open_for_messages = true;
        old.updated_at = Utc::now() - chrono::Duration::hours(72);
        store.insert_running_function(&old).await.unwrap();

        let (mut manager, transport) = manager_on(store.clone()).await;
        assert!(manager.chat(ALICE).unwrap().running.is_empty());

        manager.handle(reply(10, ALICE, "hello?")).await;
        assert_eq!(transport.texts(), vec!["No command running"]);
    }

    #[tokio::test]
    async fn test_failed_handler_leaves_state_untouched() {
        let store = seeded_store().await;
        let (mut manager, transport) = manager_on(store.clone()).await;
        manager.handle(command(1, ALICE, "flaky")).await;
        transport.take();
        let before = manager.chat(ALICE).unwrap().running[0].clone();

        manager.handle(press(2, ALICE, 100, "boom")).await;
        assert_eq!(
            transport.texts(),
            vec!["Something went wrong, please try again."]
        );
        assert_eq!(manager.chat(ALICE).unwrap().running[0], before);
        assert_eq!(store.list_running_functions(ALICE).await.unwrap()[0].state, 2);

        manager.handle(press(3, ALICE, 100, "ok")).await;
        assert_eq!(transport.texts(), vec!["partial"]);
        assert!(manager.chat(ALICE).unwrap().running.is_empty());
    }

    #[tokio::test]
    async fn test_undeclared_setting_is_a_failure() {
        let store = seeded_store().await;
        let (mut manager, transport) = manager_on(store).await;

        manager.handle(command(1, ALICE, "sloppy")).await;
        assert_eq!(
            transport.texts(),
            vec!["Something went wrong, please try again."]
        );
        assert!(manager.chat(ALICE).unwrap().running.is_empty());
    }

    #[tokio::test]
    async fn test_chain_starts_target_in_same_dispatch() {
        let store = seeded_store().await;
        let (mut manager, transport) = manager_on(store.clone()).await;

        manager.handle(command(1, ALICE, "recommend")).await;
        assert_eq!(transport.texts(), vec!["Notes for Dune (state 2)"]);

        let chat = manager.chat(ALICE).unwrap();
        assert_eq!(chat.running.len(), 1);
        let notes = &chat.running[0];
        assert_eq!((notes.id, notes.name.as_str(), notes.state), (1, "notes", 2));
        assert!(!notes.settings.contains_key("scratch"));

        let stored = store.list_running_functions(ALICE).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "notes");
    }

    #[tokio::test]
    async fn test_failed_chain_target_keeps_source() {
        let store = seeded_store().await;
        let (mut manager, transport) = manager_on(store.clone()).await;
        manager.handle(command(1, ALICE, "pick")).await;
        assert_eq!(transport.texts(), vec!["Pick a colour"]);

        manager.handle(reply(2, ALICE, "red")).await;
        assert_eq!(
            transport.texts(),
            vec!["Something went wrong, please try again."]
        );
        let chat = manager.chat(ALICE).unwrap();
        assert_eq!(chat.running.len(), 1);
        let pick = &chat.running[0];
        assert_eq!((pick.id, pick.name.as_str(), pick.state), (1, "pick", 2));
        assert!(pick.open_for_messages);
        assert!(pick.settings.is_empty());

        let stored = store.list_running_functions(ALICE).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!((stored[0].name.as_str(), stored[0].state), ("pick", 2));

        // Still stuck on the same step, not dropped to the fallback
        manager.handle(reply(3, ALICE, "blue")).await;
        assert_eq!(
            transport.texts(),
            vec!["Something went wrong, please try again."]
        );
    }

    /// Treats any free text as a book title
    struct TitleShortcut;

    #[async_trait]
    impl Fallback for TitleShortcut {
        async fn on_message(&self, _user: &User, message: &Message) -> Result<FallbackAction> {
            let mut settings = Settings::new();
            settings.insert("book".to_string(), Value::from(message.last_message().unwrap_or_default()));
            Ok(FallbackAction::Dispatch {
                alias: "book".to_string(),
                initial_state: 3,
                settings,
            })
        }
    }

    #[tokio::test]
    async fn test_fallback_can_dispatch_with_settings() {
        let store = seeded_store().await;
        let transport = Arc::new(RecordingTransport::new());
        let mut manager = Manager::new(&config(), store, transport.clone(), registry(), StopSignal::new())
            .with_fallback(Arc::new(TitleShortcut));
        manager.start().await.unwrap();

        manager.handle(reply(1, ALICE, "Dune")).await;
        assert_eq!(transport.texts(), vec!["Saved note for Dune: Dune"]);
        assert!(manager.chat(ALICE).unwrap().running.is_empty());
    }

    #[tokio::test]
    async fn test_stale_callback_expires() {
        let store = seeded_store().await;
        let (mut manager, transport) = manager_on(store).await;

        manager.handle(press(1, ALICE, 555, "Dune")).await;
        assert_eq!(
            transport.take(),
            vec![Call::Answer {
                text: "Function has expired".to_string()
            }]
        );
        assert!(manager.chat(ALICE).unwrap().running.is_empty());
    }

    #[tokio::test]
    async fn test_replayed_update_is_ignored() {
        let store = seeded_store().await;
        let (mut manager, transport) = manager_on(store).await;

        manager.handle(command(5, ALICE, "ask")).await;
        manager.handle(command(5, ALICE, "ask")).await;
        manager.handle(command(4, ALICE, "ask")).await;
        assert_eq!(transport.texts().len(), 1);
        assert_eq!(manager.stats().processed_events, 1);
    }

    #[tokio::test]
    async fn test_cancel_closes_everything() {
        let store = seeded_store().await;
        let (mut manager, transport) = manager_on(store.clone()).await;
        manager.handle(command(1, ALICE, "book")).await;
        manager.handle(command(2, ALICE, "ask")).await;
        transport.take();

        manager.handle(command(3, ALICE, "cancel")).await;
        assert_eq!(transport.texts(), vec!["All running functions closed."]);
        assert!(manager.chat(ALICE).unwrap().running.is_empty());
        assert!(store.running_function_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_onboarding_and_approval() {
        let store = seeded_store().await;
        let (mut manager, transport) = manager_on(store.clone()).await;

        manager.handle(command(1, BOB, "start")).await;
        let calls = transport.take();
        assert_eq!(
            calls[0],
            Call::Send {
                chat_id: BOB,
                text: "Application sent!".to_string(),
                keyboard: false,
            }
        );
        let Call::Send {
            chat_id, keyboard, ..
        } = &calls[1]
        else {
            panic!("expected approval request, got {:?}", calls[1]);
        };
        assert_eq!((*chat_id, *keyboard), (ADMIN, true));
        assert!(manager.user(BOB).is_none());

        manager.handle(command(2, BOB, "start")).await;
        assert_eq!(
            transport.texts(),
            vec!["Application has been already sent. Please wait for approval from admin"]
        );

        // Request keyboard was message 101
        manager.handle(press(3, ADMIN, 101, "Approve")).await;
        let calls = transport.take();
        assert!(calls.contains(&Call::Answer {
            text: "Approved".to_string()
        }));
        assert!(calls.iter().any(|c| matches!(c, Call::Edit { message_id: 101, text } if text.ends_with("Approved"))));
        assert!(calls.iter().any(|c| matches!(c, Call::Send { chat_id: BOB, .. })));

        assert!(manager.user(BOB).is_some());
        assert!(manager.chat(BOB).is_some());
        assert!(manager.chat(ADMIN).unwrap().running.is_empty());
        let pending = store.list_pending_users("sessionbot").await.unwrap();
        assert!(pending[0].approved);

        manager.handle(command(4, BOB, "start")).await;
        assert!(transport.take().is_empty());
        manager.handle(command(5, BOB, "help")).await;
        let help = transport.texts();
        assert_eq!(help.len(), 1);
        assert!(help[0].contains("/book"));
        assert!(!help[0].contains("/purge"));
    }

    #[tokio::test]
    async fn test_banned_user_is_silent() {
        let store = seeded_store().await;
        let (mut manager, transport) = manager_on(store.clone()).await;
        manager.handle(command(1, BOB, "start")).await;
        transport.take();
        store
            .set_pending_status(BOB, "sessionbot", PendingStatus::Banned)
            .await
            .unwrap();

        manager.handle(command(2, BOB, "start")).await;
        assert!(transport.take().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_requires_admin_and_flushes() {
        let store = seeded_store().await;
        let transport = Arc::new(RecordingTransport::new());
        let stop = StopSignal::new();
        let mut manager = Manager::new(&config(), store.clone(), transport.clone(), registry(), stop.clone());
        manager.start().await.unwrap();
        manager.handle(command(1, ALICE, "ask")).await;
        transport.take();

        manager.handle(command(2, ALICE, "END")).await;
        assert!(!stop.is_stopped());
        assert_eq!(transport.texts(), vec![ResolveError::Forbidden.to_string()]);

        manager.handle(command(3, ADMIN, "end")).await;
        assert!(stop.is_stopped());
        assert_eq!(store.list_running_functions(ALICE).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_send_failures_do_not_stop_the_router() {
        let store = seeded_store().await;
        let transport = Arc::new(RecordingTransport {
            fail_sends: true,
            ..RecordingTransport::new()
        });
        let mut manager = Manager::new(&config(), store, transport.clone(), registry(), StopSignal::new());
        manager.start().await.unwrap();

        manager.handle(command(1, ALICE, "ask")).await;
        let function = &manager.chat(ALICE).unwrap().running[0];
        assert_eq!(function.state, 2);
        assert!(function.open_for_messages);
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_stopped() {
        let store = seeded_store().await;
        let transport = Arc::new(RecordingTransport::new());
        let stop = StopSignal::new();
        let mut manager = Manager::new(&config(), store.clone(), transport.clone(), registry(), stop.clone());
        manager.start().await.unwrap();

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tx.send(command(1, ALICE, "ask")).unwrap();
        tx.send(command(2, ADMIN, "end")).unwrap();
        manager.run(rx).await;

        assert!(stop.is_stopped());
        assert_eq!(transport.texts(), vec!["What is it?"]);
        assert_eq!(store.list_running_functions(ALICE).await.unwrap().len(), 1);
    }

    /// SQLite store whose writes and deletes can be switched off
    struct FlakyStore {
        inner: Arc<SqliteStore>,
        fail_writes: AtomicBool,
        fail_deletes: AtomicBool,
    }

    impl FlakyStore {
        fn new(inner: Arc<SqliteStore>) -> Self {
            Self {
                inner,
                fail_writes: AtomicBool::new(false),
                fail_deletes: AtomicBool::new(false),
            }
        }

        fn check_writes(&self) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                bail!("disk full");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn list_users(&self) -> Result<Vec<User>> {
            self.inner.list_users().await
        }

        async fn insert_user(&self, user: &User) -> Result<()> {
            self.inner.insert_user(user).await
        }

        async fn list_chats(&self) -> Result<Vec<Chat>> {
            self.inner.list_chats().await
        }

        async fn insert_chat(&self, chat: &Chat) -> Result<()> {
            self.inner.insert_chat(chat).await
        }

        async fn list_pending_users(&self, app: &str) -> Result<Vec<PendingUser>> {
            self.inner.list_pending_users(app).await
        }

        async fn insert_pending_user(&self, pending: &PendingUser) -> Result<()> {
            self.inner.insert_pending_user(pending).await
        }

        async fn set_pending_status(&self, user_id: i64, app: &str, status: PendingStatus) -> Result<bool> {
            self.inner.set_pending_status(user_id, app, status).await
        }

        async fn approve_pending_user(&self, user: &User, chat: &Chat, app: &str) -> Result<()> {
            self.inner.approve_pending_user(user, chat, app).await
        }

        async fn list_running_functions(&self, chat_id: i64) -> Result<Vec<RunningFunction>> {
            self.inner.list_running_functions(chat_id).await
        }

        async fn running_function_keys(&self) -> Result<HashSet<(i64, u32)>> {
            self.inner.running_function_keys().await
        }

        async fn insert_running_function(&self, function: &RunningFunction) -> Result<()> {
            self.check_writes()?;
            self.inner.insert_running_function(function).await
        }

        async fn update_running_function(&self, function: &RunningFunction) -> Result<()> {
            self.check_writes()?;
            self.inner.update_running_function(function).await
        }

        async fn delete_running_function(&self, chat_id: i64, id: u32) -> Result<bool> {
            if self.fail_deletes.load(Ordering::SeqCst) {
                bail!("database is locked");
            }
            self.inner.delete_running_function(chat_id, id).await
        }

        async fn delete_stale_running_functions(&self, max_age: Duration) -> Result<usize> {
            self.inner.delete_stale_running_functions(max_age).await
        }
    }

    const SHUTDOWN_REFUSED: &str = "Could not save running functions, shutdown refused. Please retry.";

    async fn manager_on_flaky(
        store: Arc<FlakyStore>,
        stop: StopSignal,
    ) -> (Manager, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        let mut manager = Manager::new(&config(), store, transport.clone(), registry(), stop);
        manager.start().await.unwrap();
        (manager, transport)
    }

    #[tokio::test]
    async fn test_failed_save_refuses_shutdown() {
        let sqlite = seeded_store().await;
        let store = Arc::new(FlakyStore::new(sqlite.clone()));
        let stop = StopSignal::new();
        let (mut manager, transport) = manager_on_flaky(store.clone(), stop.clone()).await;
        store.fail_writes.store(true, Ordering::SeqCst);

        manager.handle(command(1, ALICE, "ask")).await;
        assert_eq!(transport.texts(), vec!["What is it?"]);
        assert!(sqlite.list_running_functions(ALICE).await.unwrap().is_empty());

        manager.handle(command(2, ADMIN, "end")).await;
        assert_eq!(transport.texts(), vec![SHUTDOWN_REFUSED]);
        assert!(!stop.is_stopped());
        assert!(!manager.save().await);

        store.fail_writes.store(false, Ordering::SeqCst);
        manager.handle(command(3, ADMIN, "end")).await;
        assert!(stop.is_stopped());
        let stored = sqlite.list_running_functions(ALICE).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "ask");
    }

    #[tokio::test]
    async fn test_failed_delete_is_retried_before_shutdown() {
        let sqlite = seeded_store().await;
        let store = Arc::new(FlakyStore::new(sqlite.clone()));
        let stop = StopSignal::new();
        let (mut manager, transport) = manager_on_flaky(store.clone(), stop.clone()).await;

        manager.handle(command(1, ALICE, "ask")).await;
        store.fail_deletes.store(true, Ordering::SeqCst);
        manager.handle(reply(2, ALICE, "hi")).await;
        assert_eq!(transport.texts(), vec!["What is it?", "Thanks"]);
        assert!(manager.chat(ALICE).unwrap().running.is_empty());
        assert_eq!(sqlite.list_running_functions(ALICE).await.unwrap().len(), 1);
        assert!(!manager.save().await);

        manager.handle(command(3, ADMIN, "end")).await;
        assert_eq!(transport.texts(), vec![SHUTDOWN_REFUSED]);
        assert!(!stop.is_stopped());

        store.fail_deletes.store(false, Ordering::SeqCst);
        manager.handle(command(4, ADMIN, "end")).await;
        assert!(stop.is_stopped());
        assert!(sqlite.list_running_functions(ALICE).await.unwrap().is_empty());

        // The closed function does not come back after a restart
        let (mut restarted, transport) = manager_on(sqlite).await;
        restarted.handle(reply(5, ALICE, "hello")).await;
        assert_eq!(transport.texts(), vec!["No command running"]);
    }

    #[tokio::test]
    async fn test_reused_id_takes_over_undeleted_row() {
        let sqlite = seeded_store().await;
        let store = Arc::new(FlakyStore::new(sqlite.clone()));
        let (mut manager, transport) = manager_on_flaky(store.clone(), StopSignal::new()).await;
        store.fail_deletes.store(true, Ordering::SeqCst);

        manager.handle(command(1, ALICE, "ask")).await;
        manager.handle(reply(2, ALICE, "hi")).await;
        manager.handle(command(3, ALICE, "book")).await;
        transport.take();

        assert_eq!(manager.chat(ALICE).unwrap().running[0].id, 1);
        assert!(manager.save().await);
        let stored = sqlite.list_running_functions(ALICE).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!((stored[0].id, stored[0].name.as_str(), stored[0].state), (1, "book", 2));

        let (restarted, _) = manager_on(sqlite).await;
        let function = &restarted.chat(ALICE).unwrap().running[0];
        assert_eq!(function.name, "book");
    }
}
