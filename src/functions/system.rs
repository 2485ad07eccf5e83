use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::function::{Function, Invocation};

pub const EXPIRED_CALLBACK: &str = "expired_callback";

/// Answers presses on keyboards whose function is gone
pub struct ExpiredCallback;

#[async_trait]
impl Function for ExpiredCallback {
    fn name(&self) -> &'static str {
        EXPIRED_CALLBACK
    }

    async fn run(&self, inv: &mut Invocation<'_>) -> Result<()> {
        inv.answer("Function has expired");
        inv.close();
        Ok(())
    }
}

pub struct Help {
    marker: String,
}

impl Help {
    pub fn new(marker: &str) -> Self {
        Self {
            marker: marker.to_string(),
        }
    }
}

#[async_trait]
impl Function for Help {
    fn name(&self) -> &'static str {
        "help"
    }

    async fn run(&self, inv: &mut Invocation<'_>) -> Result<()> {
        let mut text = String::from("Here's a list of the main commands:\n");
        for alias in inv.registry().visible_aliases(inv.user()) {
            text.push_str(&format!("\n{}{}", self.marker, alias));
        }
        inv.send(text);
        inv.close();
        Ok(())
    }
}

/// Drops every conversation running in the chat
pub struct Cancel;

#[async_trait]
impl Function for Cancel {
    fn name(&self) -> &'static str {
        "cancel"
    }

    async fn run(&self, inv: &mut Invocation<'_>) -> Result<()> {
        inv.send("All running functions closed.");
        inv.close_chat();
        Ok(())
    }
}

pub struct Status;

#[async_trait]
impl Function for Status {
    fn name(&self) -> &'static str {
        "status"
    }

    async fn run(&self, inv: &mut Invocation<'_>) -> Result<()> {
        let stats = inv.stats();
        let uptime = Utc::now() - stats.started_at;
        let text = format!(
            "Users: {}\nChats: {}\nRunning functions: {}\nEvents processed: {}\nUptime: {}h {}m",
            stats.users,
            stats.chats,
            stats.running_functions,
            stats.processed_events,
            uptime.num_hours(),
            uptime.num_minutes() % 60,
        );
        inv.send(text);
        inv.close();
        Ok(())
    }
}
